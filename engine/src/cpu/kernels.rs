use ndarray::{Array1, ArrayD, ArrayView2, Axis, Ix2, IxDyn};

use super::Node;
use crate::{EngineErr, Op, Result};

/// Evaluates `node` over its already computed inputs.
pub(super) fn compute(node: &Node, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
    let out = match &node.op {
        Op::Placeholder { .. } => return Err(EngineErr::MissingFeed(node.name.clone())),
        Op::Const { value } => value.to_tensor(node.dtype)?.to_array()?,
        Op::Identity => inputs[0].clone(),
        Op::Add => binary(node, inputs[0], inputs[1], |a, b| a + b)?,
        Op::Mul => binary(node, inputs[0], inputs[1], |a, b| a * b)?,
        Op::MatMul {
            transpose_a,
            transpose_b,
        } => matmul(node, inputs[0], inputs[1], *transpose_a, *transpose_b)?,
        Op::Tanh => inputs[0].mapv(f64::tanh),
        Op::ReduceSum => ArrayD::from_elem(IxDyn(&[]), inputs[0].sum()),
        Op::Summary => summary(inputs[0]),
        Op::AddN => add_n(node, inputs)?,
        Op::ZerosLike => ArrayD::zeros(inputs[0].raw_dim()),
        Op::ReduceLike => reduce_to(node, inputs[0], inputs[1].shape())?,
        Op::BroadcastLike => inputs[0]
            .broadcast(inputs[1].raw_dim())
            .ok_or_else(|| mismatch(node, inputs[0].shape(), inputs[1].shape()))?
            .to_owned(),
        Op::TanhGrad => {
            if inputs[0].shape() != inputs[1].shape() {
                return Err(mismatch(node, inputs[1].shape(), inputs[0].shape()));
            }

            let mut out = inputs[1].clone();
            out.zip_mut_with(inputs[0], |dy, &y| *dy *= 1. - y * y);
            out
        }
    };

    Ok(out)
}

fn mismatch(node: &Node, got: &[usize], expected: &[usize]) -> EngineErr {
    EngineErr::ShapeMismatch {
        node: node.name.clone(),
        got: got.to_vec(),
        expected: expected.iter().map(|&d| d as i64).collect(),
    }
}

/// Computes the shape two operands broadcast to, aligning their trailing dimensions.
fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |shape: &[usize], i: usize| {
        let offset = rank - shape.len();
        if i < offset { 1 } else { shape[i - offset] }
    };

    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

fn binary<F>(node: &Node, a: &ArrayD<f64>, b: &ArrayD<f64>, f: F) -> Result<ArrayD<f64>>
where
    F: Fn(f64, f64) -> f64,
{
    let shape = broadcast_shape(a.shape(), b.shape())
        .ok_or_else(|| mismatch(node, b.shape(), a.shape()))?;

    let av = a
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| mismatch(node, a.shape(), &shape))?;
    let bv = b
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| mismatch(node, b.shape(), &shape))?;

    let mut out = av.to_owned();
    out.zip_mut_with(&bv, |x, &y| *x = f(*x, y));
    Ok(out)
}

fn matmul(
    node: &Node,
    a: &ArrayD<f64>,
    b: &ArrayD<f64>,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<ArrayD<f64>> {
    fn as_matrix<'a>(node: &Node, x: &'a ArrayD<f64>) -> Result<ArrayView2<'a, f64>> {
        x.view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| mismatch(node, x.shape(), &[0, 0]))
    }

    let mut a = as_matrix(node, a)?;
    let mut b = as_matrix(node, b)?;

    if transpose_a {
        a = a.reversed_axes();
    }
    if transpose_b {
        b = b.reversed_axes();
    }

    if a.ncols() != b.nrows() {
        return Err(mismatch(node, b.shape(), &[a.ncols(), b.ncols()]));
    }

    Ok(a.dot(&b).into_dyn())
}

fn summary(x: &ArrayD<f64>) -> ArrayD<f64> {
    let count = x.len() as f64;
    let (min, max) = if x.is_empty() {
        (0., 0.)
    } else {
        x.iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    };
    let sum = x.sum();
    let sum_sq: f64 = x.iter().map(|v| v * v).sum();

    Array1::from_vec(vec![count, min, max, sum, sum_sq]).into_dyn()
}

fn add_n(node: &Node, inputs: &[&ArrayD<f64>]) -> Result<ArrayD<f64>> {
    let (first, rest) = inputs
        .split_first()
        .ok_or_else(|| EngineErr::InvalidGraph(format!("`{}` has no inputs", node.name)))?;

    let mut out = (*first).clone();
    for x in rest {
        if x.shape() != out.shape() {
            return Err(mismatch(node, x.shape(), out.shape()));
        }

        out += *x;
    }

    Ok(out)
}

/// Sums `x` down to `target`, undoing a trailing-aligned broadcast.
fn reduce_to(node: &Node, x: &ArrayD<f64>, target: &[usize]) -> Result<ArrayD<f64>> {
    if x.ndim() < target.len() {
        return Err(mismatch(node, x.shape(), target));
    }

    let mut out = x.clone();
    while out.ndim() > target.len() {
        out = out.sum_axis(Axis(0));
    }

    for (axis, &dim) in target.iter().enumerate() {
        let got = out.shape()[axis];

        if got == dim {
            continue;
        }
        if dim != 1 {
            return Err(mismatch(node, x.shape(), target));
        }

        out = out.sum_axis(Axis(axis)).insert_axis(Axis(axis));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcasts_on_trailing_dimensions() {
        assert_eq!(broadcast_shape(&[2, 2, 3], &[3]), Some(vec![2, 2, 3]));
        assert_eq!(broadcast_shape(&[4, 1], &[1, 5]), Some(vec![4, 5]));
        assert_eq!(broadcast_shape(&[2, 3], &[2]), None);
    }

    #[test]
    fn reduces_back_to_the_broadcast_operand() {
        let node = Node {
            name: "r".into(),
            op: Op::ReduceLike,
            inputs: vec![],
            dtype: crate::DType::F64,
        };

        let x = ArrayD::from_elem(IxDyn(&[2, 2, 3]), 1.);
        let out = reduce_to(&node, &x, &[3]).unwrap();
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), [4., 4., 4.]);

        let out = reduce_to(&node, &x, &[2, 1, 3]).unwrap();
        assert_eq!(out.shape(), [2, 1, 3]);
        assert!(out.iter().all(|&v| v == 2.));
    }
}

use std::collections::HashMap;

use log::debug;

use super::GraphState;
use crate::{EngineErr, Op, Result};

/// Appends the nodes computing `d y / d x` for every `x` in `xs`, seeded by `dy`.
///
/// # Returns
/// The index of the gradient node of each element of `xs`, in order. An `x` the output doesn't
/// depend on gets a `ZerosLike` node.
pub(super) fn add_gradients(
    state: &mut GraphState,
    y: usize,
    xs: &[usize],
    dy: usize,
) -> Result<Vec<usize>> {
    let scope = state.next_grad_scope();
    let on_path = path_between(state, xs, y);

    let mut pending: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut totals: HashMap<usize, usize> = HashMap::new();
    pending.insert(y, vec![dy]);

    for idx in (0..=y).rev() {
        if !on_path[idx] {
            continue;
        }

        let Some(grads) = pending.remove(&idx) else {
            continue;
        };

        let total = sum(state, &scope, idx, grads)?;
        totals.insert(idx, total);

        for (input, grad) in backprop(state, &scope, idx, total)? {
            if on_path[input] {
                pending.entry(input).or_default().push(grad);
            }
        }
    }

    debug!(scope = scope.as_str(), xs = xs.len(); "added gradient nodes");

    xs.iter()
        .map(|&x| match totals.get(&x) {
            Some(&total) => Ok(total),
            None => {
                let name = format!("{scope}/{}/zeros", state.nodes[x].name);
                let dtype = state.nodes[x].dtype;
                state.push(name, Op::ZerosLike, vec![x], dtype)
            }
        })
        .collect()
}

/// Marks the nodes that both depend on some `x` and feed into `y`.
fn path_between(state: &GraphState, xs: &[usize], y: usize) -> Vec<bool> {
    let n = state.nodes.len();

    let mut from_x = vec![false; n];
    for (idx, node) in state.nodes.iter().enumerate().take(y + 1) {
        from_x[idx] = xs.contains(&idx) || node.inputs.iter().any(|&i| from_x[i]);
    }

    let mut to_y = vec![false; n];
    to_y[y] = true;
    for idx in (0..=y).rev() {
        if to_y[idx] {
            for &input in &state.nodes[idx].inputs {
                to_y[input] = true;
            }
        }
    }

    from_x.iter().zip(&to_y).map(|(&a, &b)| a && b).collect()
}

fn sum(state: &mut GraphState, scope: &str, idx: usize, grads: Vec<usize>) -> Result<usize> {
    if let [single] = grads[..] {
        return Ok(single);
    }

    let name = format!("{scope}/{}/sum", state.nodes[idx].name);
    let dtype = state.nodes[idx].dtype;
    state.push(name, Op::AddN, grads, dtype)
}

/// Emits the gradient of every input of node `idx` given the gradient `dy` of its output.
///
/// # Returns
/// Pairs of `(input, gradient node)`.
fn backprop(
    state: &mut GraphState,
    scope: &str,
    idx: usize,
    dy: usize,
) -> Result<Vec<(usize, usize)>> {
    let node = &state.nodes[idx];
    let op = node.op.clone();
    let inputs = node.inputs.clone();
    let name = node.name.clone();
    let prefix = format!("{scope}/{name}");

    let mut emit = |suffix: &str, op: Op, args: Vec<usize>, like: usize| {
        let dtype = state.nodes[like].dtype;
        state.push(format!("{prefix}/{suffix}"), op, args, dtype)
    };

    let grads = match op {
        Op::Placeholder { .. } | Op::Const { .. } | Op::ZerosLike => vec![],
        Op::Identity => vec![(inputs[0], dy)],
        Op::AddN => inputs.iter().map(|&input| (input, dy)).collect(),
        Op::Add => {
            let (a, b) = (inputs[0], inputs[1]);
            let da = emit("da", Op::ReduceLike, vec![dy, a], a)?;
            let db = emit("db", Op::ReduceLike, vec![dy, b], b)?;
            vec![(a, da), (b, db)]
        }
        Op::Mul => {
            let (a, b) = (inputs[0], inputs[1]);
            let dy_b = emit("dy_b", Op::Mul, vec![dy, b], a)?;
            let da = emit("da", Op::ReduceLike, vec![dy_b, a], a)?;
            let dy_a = emit("dy_a", Op::Mul, vec![dy, a], b)?;
            let db = emit("db", Op::ReduceLike, vec![dy_a, b], b)?;
            vec![(a, da), (b, db)]
        }
        Op::MatMul {
            transpose_a,
            transpose_b,
        } => {
            let (a, b) = (inputs[0], inputs[1]);
            let mm = |ta, tb| Op::MatMul {
                transpose_a: ta,
                transpose_b: tb,
            };

            let (da, db) = match (transpose_a, transpose_b) {
                (false, false) => (
                    emit("da", mm(false, true), vec![dy, b], a)?,
                    emit("db", mm(true, false), vec![a, dy], b)?,
                ),
                (false, true) => (
                    emit("da", mm(false, false), vec![dy, b], a)?,
                    emit("db", mm(true, false), vec![dy, a], b)?,
                ),
                (true, false) => (
                    emit("da", mm(false, true), vec![b, dy], a)?,
                    emit("db", mm(false, false), vec![a, dy], b)?,
                ),
                (true, true) => (
                    emit("da", mm(true, true), vec![b, dy], a)?,
                    emit("db", mm(true, true), vec![dy, a], b)?,
                ),
            };

            vec![(a, da), (b, db)]
        }
        Op::Tanh => {
            let dx = emit("dx", Op::TanhGrad, vec![idx, dy], inputs[0])?;
            vec![(inputs[0], dx)]
        }
        Op::ReduceSum => {
            let dx = emit("dx", Op::BroadcastLike, vec![dy, inputs[0]], inputs[0])?;
            vec![(inputs[0], dx)]
        }
        Op::BroadcastLike => {
            let dx = emit("dx", Op::ReduceLike, vec![dy, inputs[0]], inputs[0])?;
            vec![(inputs[0], dx)]
        }
        Op::ReduceLike => {
            let dx = emit("dx", Op::BroadcastLike, vec![dy, inputs[0]], inputs[0])?;
            vec![(inputs[0], dx)]
        }
        op @ (Op::Summary | Op::TanhGrad) => {
            return Err(EngineErr::NoGradient {
                node: name,
                op: op.name(),
            });
        }
    };

    Ok(grads)
}

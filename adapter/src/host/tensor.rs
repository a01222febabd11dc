use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use parking_lot::RwLock;

use crate::{AdapterErr, Result};

/// A weight tensor shared between its host layer and every session built against it.
pub type SharedTensor = Arc<RwLock<DenseTensor>>;

/// A batch of examples, one dense tensor per example.
pub type TensorBatch = Vec<DenseTensor>;

/// A dense, row-major tensor of `f64` values.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl DenseTensor {
    /// Creates a new `DenseTensor`.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    /// * `data` - The row-major values.
    ///
    /// # Returns
    /// A new `DenseTensor` or a `SizeMismatch` if `data` doesn't fill `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected = shape.iter().product();

        if data.len() != expected {
            return Err(AdapterErr::SizeMismatch {
                what: "tensor data",
                got: data.len(),
                expected,
            });
        }

        Ok(Self { shape, data })
    }

    /// Creates a tensor of the given shape filled with `value`.
    pub fn filled(shape: &[usize], value: f64) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![value; shape.iter().product()],
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::filled(shape, 0.)
    }

    /// Wraps the tensor into a `SharedTensor`.
    pub fn shared(self) -> SharedTensor {
        Arc::new(RwLock::new(self))
    }

    /// Copies an `ndarray` array in logical order.
    pub fn from_array(array: ArrayD<f64>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    /// Copies the tensor into an `ndarray` array.
    pub fn to_array(&self) -> Result<ArrayD<f64>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone()).map_err(|_| {
            AdapterErr::SizeMismatch {
                what: "tensor data",
                got: self.data.len(),
                expected: self.shape.iter().product(),
            }
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Gives mutable access to the values, the shape stays fixed.
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

use std::sync::Arc;

use super::{DeltaSet, TensorBatch};
use crate::{AdapterErr, Result};

/// The backward half of an evaluation.
///
/// It must drop the gradient batch it's handed before returning, holding on to it is reported as a
/// consistency error by the caller.
pub type BackwardFn = Box<dyn FnOnce(&DeltaSet, Arc<TensorBatch>) -> Result<()> + Send>;

/// The output of a node of the host network together with the way to backpropagate through it.
pub struct Evaluation {
    data: Arc<TensorBatch>,
    backward: Option<BackwardFn>,
}

impl Evaluation {
    /// Creates a new differentiable `Evaluation`.
    ///
    /// # Arguments
    /// * `data` - The batch this evaluation produced.
    /// * `backward` - Backpropagates an output gradient of the same shape as `data`.
    ///
    /// # Returns
    /// A new `Evaluation` instance.
    pub fn new<F>(data: TensorBatch, backward: F) -> Self
    where
        F: FnOnce(&DeltaSet, Arc<TensorBatch>) -> Result<()> + Send + 'static,
    {
        Self {
            data: Arc::new(data),
            backward: Some(Box::new(backward)),
        }
    }

    /// Creates an `Evaluation` that gradients don't flow through, such as the network's input.
    pub fn constant(data: TensorBatch) -> Self {
        Self {
            data: Arc::new(data),
            backward: None,
        }
    }

    pub fn data(&self) -> &TensorBatch {
        &self.data
    }

    /// Returns the amount of examples in the batch.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Backpropagates `gradient` through this evaluation, releasing it.
    pub fn backward(self, deltas: &DeltaSet, gradient: TensorBatch) -> Result<()> {
        match self.backward {
            Some(backward) => invoke_backward(0, backward, deltas, gradient),
            None => Ok(()),
        }
    }

    pub(crate) fn into_parts(self) -> (Arc<TensorBatch>, Option<BackwardFn>) {
        (self.data, self.backward)
    }
}

/// Hands `gradient` to `backward` and checks it released the only reference it was given.
///
/// # Arguments
/// * `input` - The position of the input owning `backward`, used for reporting.
/// * `backward` - The callback.
/// * `deltas` - The gradient accumulation set of the current step.
/// * `gradient` - The gradient of that input.
pub(crate) fn invoke_backward(
    input: usize,
    backward: BackwardFn,
    deltas: &DeltaSet,
    gradient: TensorBatch,
) -> Result<()> {
    let gradient = Arc::new(gradient);
    let probe = Arc::clone(&gradient);

    backward(deltas, gradient)?;

    match Arc::strong_count(&probe) - 1 {
        0 => Ok(()),
        held => Err(AdapterErr::Consistency { input, held }),
    }
}

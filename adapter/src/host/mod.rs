//! The host side of the adapter: dense tensors, the evaluation contract of the host network and
//! the per-weight gradient accumulation set.

mod delta;
mod evaluation;
mod tensor;

pub use delta::{DeltaAccumulator, DeltaEntry, DeltaSet, stable_id};
pub use evaluation::{BackwardFn, Evaluation};
pub(crate) use evaluation::invoke_backward;
pub use tensor::{DenseTensor, SharedTensor, TensorBatch};

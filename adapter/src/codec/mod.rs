//! Marshaling between host dense tensors and native engine tensors.

mod handle;
mod pool;
mod tensor_codec;

pub use handle::NativeTensorHandle;
pub use pool::{BufferPool, Element, PoolErr, PoolStats};
pub use tensor_codec::TensorCodec;

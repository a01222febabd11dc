use std::{ops::Deref, sync::Arc};

use engine::{NativeTensor, TensorData};
use log::warn;

use super::{BufferPool, PoolErr};

/// An owned native tensor whose buffer may belong to a `BufferPool`.
///
/// A pooled buffer goes back to its pool exactly once, either through `close` or when the handle
/// is dropped, so every exit path of a run releases it.
#[derive(Debug)]
pub struct NativeTensorHandle {
    tensor: NativeTensor,
    pool: Option<Arc<BufferPool>>,
}

impl NativeTensorHandle {
    /// Wraps a tensor whose buffer was obtained from `pool` with the tensor's length.
    pub(crate) fn pooled(tensor: NativeTensor, pool: Arc<BufferPool>) -> Self {
        Self {
            tensor,
            pool: Some(pool),
        }
    }

    /// Wraps a tensor the engine allocated itself.
    pub fn native(tensor: NativeTensor) -> Self {
        Self { tensor, pool: None }
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Releases the handle, reporting whether its buffer was accepted back by the pool.
    pub fn close(mut self) -> Result<(), PoolErr> {
        self.release()
    }

    fn release(&mut self) -> Result<(), PoolErr> {
        let Some(pool) = self.pool.take() else {
            return Ok(());
        };

        let len = self.tensor.len();
        let (_, data) = std::mem::take(&mut self.tensor).into_parts();

        match data {
            TensorData::F32(buf) => pool.recycle(len, buf),
            TensorData::F64(buf) => pool.recycle(len, buf),
        }
    }
}

impl Deref for NativeTensorHandle {
    type Target = NativeTensor;

    fn deref(&self) -> &Self::Target {
        &self.tensor
    }
}

impl Drop for NativeTensorHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to return a tensor buffer to its pool: {e}");
        }
    }
}

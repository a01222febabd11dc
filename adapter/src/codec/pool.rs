use std::{
    collections::HashMap,
    error::Error,
    fmt::{self, Display},
    sync::{Arc, OnceLock},
};

use engine::TensorData;
use log::warn;
use parking_lot::Mutex;

use crate::config::PoolConfig;

/// Misuse of the buffer pool: a buffer returned in a state it wasn't handed out in.
#[derive(Debug, PartialEq, Eq)]
pub enum PoolErr {
    LengthMismatch { expected: usize, got: usize },
    NotObtained { len: usize },
}

impl Display for PoolErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolErr::LengthMismatch { expected, got } => write!(
                f,
                "returned a buffer of {got} elements to the bucket of {expected} elements"
            ),
            PoolErr::NotObtained { len } => write!(
                f,
                "returned a buffer of {len} elements that was never obtained from the pool"
            ),
        }
    }
}

impl Error for PoolErr {}

/// The element types the pool keeps buffers of.
pub trait Element: bytemuck::Zeroable + Copy + Send + 'static {
    #[doc(hidden)]
    fn buckets(pool: &BufferPool) -> &Buckets<Self>;

    fn from_f64(x: f64) -> Self;

    fn to_f64(self) -> f64;

    /// Moves a buffer of this type into native tensor data.
    fn into_data(buf: Vec<Self>) -> TensorData;
}

impl Element for f32 {
    fn buckets(pool: &BufferPool) -> &Buckets<Self> {
        &pool.f32
    }

    fn from_f64(x: f64) -> Self {
        x as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn into_data(buf: Vec<Self>) -> TensorData {
        TensorData::F32(buf)
    }
}

impl Element for f64 {
    fn buckets(pool: &BufferPool) -> &Buckets<Self> {
        &pool.f64
    }

    fn from_f64(x: f64) -> Self {
        x
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn into_data(buf: Vec<Self>) -> TensorData {
        TensorData::F64(buf)
    }
}

#[derive(Debug)]
struct Bucket<T> {
    idle: Vec<Vec<T>>,
    outstanding: usize,
}

impl<T> Default for Bucket<T> {
    fn default() -> Self {
        Self {
            idle: Vec::new(),
            outstanding: 0,
        }
    }
}

/// The size-keyed free lists of one element type.
#[doc(hidden)]
#[derive(Debug)]
pub struct Buckets<T> {
    buckets: Mutex<HashMap<usize, Bucket<T>>>,
}

impl<T> Default for Buckets<T> {
    fn default() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

/// Outstanding and idle buffer counts of a `BufferPool`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub outstanding: usize,
    pub idle: usize,
}

/// A recycling store of scratch buffers, bucketed by exact element count.
///
/// Every buffer obtained must be recycled exactly once with the length it was obtained with. The
/// pool is internally synchronized and may be shared by sessions running on different threads.
#[derive(Debug)]
pub struct BufferPool {
    f32: Buckets<f32>,
    f64: Buckets<f64>,
    max_idle_per_bucket: usize,
}

impl BufferPool {
    /// Creates a new `BufferPool`.
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            f32: Buckets::default(),
            f64: Buckets::default(),
            max_idle_per_bucket: config.max_idle_per_bucket,
        }
    }

    /// Returns the process-wide pool, creating it with the default configuration on first use.
    pub fn global() -> Arc<BufferPool> {
        static GLOBAL: OnceLock<Arc<BufferPool>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(BufferPool::new(&PoolConfig::default()))))
    }

    /// Hands out a buffer of exactly `len` elements. Its contents are unspecified.
    pub fn obtain<T: Element>(&self, len: usize) -> Vec<T> {
        let mut buckets = T::buckets(self).buckets.lock();
        let bucket = buckets.entry(len).or_default();
        bucket.outstanding += 1;

        bucket
            .idle
            .pop()
            .unwrap_or_else(|| bytemuck::zeroed_vec(len))
    }

    /// Takes back a buffer obtained with `obtain::<T>(len)`.
    ///
    /// # Arguments
    /// * `len` - The length the buffer was obtained with.
    /// * `buf` - The buffer.
    ///
    /// # Returns
    /// A `PoolErr` if the buffer's length changed or no buffer of that length is outstanding,
    /// in which case the buffer is dropped instead of being kept.
    pub fn recycle<T: Element>(&self, len: usize, buf: Vec<T>) -> Result<(), PoolErr> {
        if buf.len() != len {
            warn!(expected = len, got = buf.len(); "rejected recycled buffer");
            return Err(PoolErr::LengthMismatch {
                expected: len,
                got: buf.len(),
            });
        }

        let mut buckets = T::buckets(self).buckets.lock();
        let bucket = match buckets.get_mut(&len) {
            Some(bucket) if bucket.outstanding > 0 => bucket,
            _ => {
                warn!(len = len; "rejected buffer that was never obtained");
                return Err(PoolErr::NotObtained { len });
            }
        };

        bucket.outstanding -= 1;
        if bucket.idle.len() < self.max_idle_per_bucket {
            bucket.idle.push(buf);
        }

        Ok(())
    }

    /// Returns the outstanding and idle buffer counts across every bucket.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();

        let singles = self.f32.buckets.lock();
        let doubles = self.f64.buckets.lock();
        let counts = singles
            .values()
            .map(|b| (b.outstanding, b.idle.len()))
            .chain(doubles.values().map(|b| (b.outstanding, b.idle.len())));

        for (outstanding, idle) in counts {
            stats.outstanding += outstanding;
            stats.idle += idle;
        }

        stats
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

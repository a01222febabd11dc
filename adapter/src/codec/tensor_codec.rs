use std::sync::Arc;

use engine::{DType, NativeTensor};
use ndarray::{ArrayViewD, Axis, IxDyn};
use rayon::prelude::*;

use super::{BufferPool, Element, NativeTensorHandle};
use crate::{AdapterErr, DenseTensor, Result, TensorBatch};

/// Converts host dense tensors to native tensors and back, taking scratch buffers from a pool.
#[derive(Debug, Clone)]
pub struct TensorCodec {
    pool: Arc<BufferPool>,
}

impl TensorCodec {
    /// Creates a new `TensorCodec` drawing buffers from `pool`.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Copies `tensor` into a pooled native tensor of element type `dtype`.
    ///
    /// Narrowing to `F32` is lossy, the source tensor is never modified.
    pub fn externalize(&self, tensor: &DenseTensor, dtype: DType) -> Result<NativeTensorHandle> {
        self.externalize_parts(tensor.shape().to_vec(), &[tensor], dtype)
    }

    /// Stacks `tensors` along a new leading batch dimension into one pooled native tensor.
    ///
    /// # Arguments
    /// * `tensors` - The examples of the batch, they must all share the same shape.
    /// * `dtype` - The element type of the native tensor.
    ///
    /// # Returns
    /// A handle to a tensor of shape `[tensors.len(), ..example_shape]`.
    pub fn externalize_batch(
        &self,
        tensors: &[DenseTensor],
        dtype: DType,
    ) -> Result<NativeTensorHandle> {
        let first = tensors.first().ok_or(AdapterErr::EmptyBatch)?;

        if let Some(odd) = tensors.iter().find(|t| t.shape() != first.shape()) {
            return Err(AdapterErr::shape("batch example", odd.shape(), first.shape()));
        }

        let mut shape = Vec::with_capacity(first.shape().len() + 1);
        shape.push(tensors.len());
        shape.extend_from_slice(first.shape());

        let examples: Vec<_> = tensors.iter().collect();
        self.externalize_parts(shape, &examples, dtype)
    }

    fn externalize_parts(
        &self,
        shape: Vec<usize>,
        parts: &[&DenseTensor],
        dtype: DType,
    ) -> Result<NativeTensorHandle> {
        let tensor = match dtype {
            DType::F32 => self.fill::<f32>(shape, parts)?,
            DType::F64 => self.fill::<f64>(shape, parts)?,
        };

        Ok(NativeTensorHandle::pooled(tensor, Arc::clone(&self.pool)))
    }

    fn fill<T: Element>(&self, shape: Vec<usize>, parts: &[&DenseTensor]) -> Result<NativeTensor> {
        let per = parts.first().map_or(0, |t| t.len());
        let mut buf = self.pool.obtain::<T>(per * parts.len());

        if per > 0 {
            buf.par_chunks_mut(per)
                .zip(parts.par_iter())
                .for_each(|(chunk, part)| {
                    chunk
                        .iter_mut()
                        .zip(part.data())
                        .for_each(|(dst, &src)| *dst = T::from_f64(src));
                });
        }

        NativeTensor::new(shape, T::into_data(buf)).map_err(AdapterErr::Engine)
    }

    /// Copies a native tensor into a host dense tensor, widening `F32` elements.
    pub fn internalize(&self, tensor: &NativeTensor) -> Result<DenseTensor> {
        DenseTensor::new(tensor.shape().to_vec(), tensor.data().to_f64())
    }

    /// Splits a native tensor along its leading dimension into one dense tensor per example.
    ///
    /// # Returns
    /// The examples in order, or a `SizeMismatch` if `tensor` is a scalar.
    pub fn internalize_batch(&self, tensor: &NativeTensor) -> Result<TensorBatch> {
        if tensor.shape().is_empty() {
            return Err(AdapterErr::SizeMismatch {
                what: "batch rank",
                got: 0,
                expected: 1,
            });
        }

        match tensor.data() {
            engine::TensorData::F64(data) => split(tensor.shape(), data),
            engine::TensorData::F32(data) => {
                let mut scratch = self.pool.obtain::<f64>(data.len());
                scratch
                    .par_iter_mut()
                    .zip(data.par_iter())
                    .for_each(|(dst, &src)| *dst = src.to_f64());

                let batch = split(tensor.shape(), &scratch);
                self.pool.recycle(data.len(), scratch)?;
                batch
            }
        }
    }
}

/// Splits a row-major buffer of the given shape along its first axis.
fn split(shape: &[usize], data: &[f64]) -> Result<TensorBatch> {
    let view = ArrayViewD::from_shape(IxDyn(shape), data).map_err(|_| AdapterErr::SizeMismatch {
        what: "native tensor data",
        got: data.len(),
        expected: shape.iter().product(),
    })?;

    Ok(view
        .axis_iter(Axis(0))
        .map(|example| DenseTensor::from_array(example.to_owned()))
        .collect())
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;

    fn random(rng: &mut StdRng, shape: &[usize]) -> DenseTensor {
        let len = shape.iter().product();
        let data = (0..len).map(|_| rng.random_range(-10.0..10.0)).collect();
        DenseTensor::new(shape.to_vec(), data).unwrap()
    }

    fn codec() -> TensorCodec {
        TensorCodec::new(Arc::new(BufferPool::default()))
    }

    #[test]
    fn f64_round_trip_is_exact() {
        let codec = codec();
        let mut rng = StdRng::seed_from_u64(7);

        for shape in [&[5][..], &[2, 3][..], &[2, 1, 4, 3][..]] {
            let tensor = random(&mut rng, shape);
            let handle = codec.externalize(&tensor, DType::F64).unwrap();
            assert_eq!(handle.dtype(), DType::F64);
            assert_eq!(codec.internalize(&handle).unwrap(), tensor);
        }
    }

    #[test]
    fn f32_round_trip_is_close() {
        let codec = codec();
        let mut rng = StdRng::seed_from_u64(11);
        let tensor = random(&mut rng, &[3, 4, 2]);

        let handle = codec.externalize(&tensor, DType::F32).unwrap();
        let back = codec.internalize(&handle).unwrap();

        assert_eq!(back.shape(), tensor.shape());
        for (a, b) in back.data().iter().zip(tensor.data()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn batch_round_trip_keeps_example_order() {
        let codec = codec();
        let mut rng = StdRng::seed_from_u64(3);
        let batch: Vec<_> = (0..4).map(|_| random(&mut rng, &[2, 2, 3])).collect();

        let handle = codec.externalize_batch(&batch, DType::F64).unwrap();
        assert_eq!(handle.shape(), [4, 2, 2, 3]);
        assert_eq!(codec.internalize_batch(&handle).unwrap(), batch);

        let handle = codec.externalize_batch(&batch, DType::F32).unwrap();
        let back = codec.internalize_batch(&handle).unwrap();
        assert_eq!(back.len(), 4);
        for (a, b) in back.iter().zip(&batch) {
            assert_eq!(a.shape(), b.shape());
            assert!(a.data().iter().zip(b.data()).all(|(x, y)| (x - y).abs() < 1e-4));
        }
    }

    #[test]
    fn every_buffer_goes_back_to_the_pool() {
        let codec = codec();
        let batch = vec![DenseTensor::filled(&[3], 1.); 2];

        let handles = [
            codec.externalize(&batch[0], DType::F32).unwrap(),
            codec.externalize_batch(&batch, DType::F64).unwrap(),
        ];
        assert_eq!(codec.pool().stats().outstanding, 2);

        let widened = codec.internalize_batch(&handles[0]).unwrap();
        assert_eq!(widened.len(), 3);
        drop(handles);

        let stats = codec.pool().stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.idle, 3);
    }

    #[test]
    fn rejects_empty_and_ragged_batches() {
        let codec = codec();

        assert!(matches!(
            codec.externalize_batch(&[], DType::F64),
            Err(AdapterErr::EmptyBatch)
        ));

        let ragged = [DenseTensor::zeros(&[2]), DenseTensor::zeros(&[3])];
        assert!(matches!(
            codec.externalize_batch(&ragged, DType::F64),
            Err(AdapterErr::ShapeMismatch { .. })
        ));
        assert_eq!(codec.pool().stats().outstanding, 0);
    }

    #[test]
    fn zero_sized_examples_are_supported() {
        let codec = codec();
        let batch = vec![DenseTensor::zeros(&[0, 2]); 3];

        let handle = codec.externalize_batch(&batch, DType::F32).unwrap();
        assert_eq!(handle.shape(), [3, 0, 2]);
        assert_eq!(codec.internalize_batch(&handle).unwrap(), batch);
    }
}

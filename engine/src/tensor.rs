use ndarray::{ArrayD, IxDyn};

use crate::{DType, EngineErr, Result};

/// The owned flat buffer of a `NativeTensor`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TensorData {
    /// Returns the amount of elements in the buffer.
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the element type of the buffer.
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
        }
    }

    /// Views the buffer as raw little-endian bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TensorData::F32(v) => bytemuck::cast_slice(v),
            TensorData::F64(v) => bytemuck::cast_slice(v),
        }
    }

    /// Rebuilds a buffer from raw bytes.
    ///
    /// # Arguments
    /// * `dtype` - The element type encoded in `bytes`.
    /// * `bytes` - The raw element bytes, its length must be a multiple of the element size.
    ///
    /// # Returns
    /// The decoded buffer or an error if the byte length is ragged.
    pub fn from_bytes(dtype: DType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % dtype.size() != 0 {
            return Err(EngineErr::InvalidGraph(format!(
                "{} content bytes can't hold whole {dtype} elements",
                bytes.len()
            )));
        }

        let data = match dtype {
            DType::F32 => TensorData::F32(bytemuck::pod_collect_to_vec(bytes)),
            DType::F64 => TensorData::F64(bytemuck::pod_collect_to_vec(bytes)),
        };

        Ok(data)
    }

    /// Copies the buffer into a `f64` vec, widening if needed.
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            TensorData::F32(v) => v.iter().map(|&x| x as f64).collect(),
            TensorData::F64(v) => v.clone(),
        }
    }
}

/// A tensor as the engine consumes and produces it.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeTensor {
    shape: Vec<usize>,
    data: TensorData,
}

/// An empty rank-1 `f64` tensor.
impl Default for NativeTensor {
    fn default() -> Self {
        Self {
            shape: vec![0],
            data: TensorData::F64(Vec::new()),
        }
    }
}

impl NativeTensor {
    /// Creates a new `NativeTensor`.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    /// * `data` - The row-major elements, must hold exactly `shape.iter().product()` values.
    ///
    /// # Returns
    /// A new `NativeTensor` or a shape mismatch if the buffer length disagrees with `shape`.
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        let expected: usize = shape.iter().product();

        if expected != data.len() {
            return Err(EngineErr::ShapeMismatch {
                node: String::from("<tensor>"),
                got: vec![data.len()],
                expected: vec![expected as i64],
            });
        }

        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Gives back the owned shape and buffer.
    pub fn into_parts(self) -> (Vec<usize>, TensorData) {
        (self.shape, self.data)
    }

    pub(crate) fn to_array(&self) -> Result<ArrayD<f64>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.to_f64())
            .map_err(|e| EngineErr::InvalidGraph(e.to_string()))
    }

    pub(crate) fn from_array(array: &ArrayD<f64>, dtype: DType) -> Self {
        let shape = array.shape().to_vec();
        let data = match dtype {
            DType::F32 => TensorData::F32(array.iter().map(|&x| x as f32).collect()),
            DType::F64 => TensorData::F64(array.iter().copied().collect()),
        };

        Self { shape, data }
    }
}

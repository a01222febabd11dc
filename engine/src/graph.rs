use serde::{Deserialize, Serialize};

use crate::{DType, NativeTensor, Result, TensorData};

/// The serialized payload of a constant node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorProto {
    pub shape: Vec<usize>,
    pub content: Vec<u8>,
}

impl TensorProto {
    /// Encodes a tensor's shape and raw element bytes.
    pub fn from_tensor(tensor: &NativeTensor) -> Self {
        Self {
            shape: tensor.shape().to_vec(),
            content: tensor.data().as_bytes().to_vec(),
        }
    }

    /// Decodes the payload as a tensor of type `dtype`.
    pub fn to_tensor(&self, dtype: DType) -> Result<NativeTensor> {
        let data = TensorData::from_bytes(dtype, &self.content)?;
        NativeTensor::new(self.shape.clone(), data)
    }
}

/// The operation a node computes.
///
/// Broadcasting binary ops align shapes on their trailing dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Op {
    Placeholder {
        /// Declared dimensions, `-1` stands for any size.
        #[serde(default)]
        shape: Option<Vec<i64>>,
    },
    Const {
        value: TensorProto,
    },
    Identity,
    Add,
    Mul,
    MatMul {
        #[serde(default)]
        transpose_a: bool,
        #[serde(default)]
        transpose_b: bool,
    },
    Tanh,
    ReduceSum,
    /// Histogram statistics `[count, min, max, sum, sum_sq]` of its input.
    Summary,
    AddN,
    ZerosLike,
    /// Sums its first input down to the shape of its second input.
    ReduceLike,
    /// Broadcasts its first input up to the shape of its second input.
    BroadcastLike,
    /// `dy * (1 - y^2)` with inputs `[y, dy]`.
    TanhGrad,
}

impl Op {
    /// Returns a short name for the op, used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Placeholder { .. } => "Placeholder",
            Op::Const { .. } => "Const",
            Op::Identity => "Identity",
            Op::Add => "Add",
            Op::Mul => "Mul",
            Op::MatMul { .. } => "MatMul",
            Op::Tanh => "Tanh",
            Op::ReduceSum => "ReduceSum",
            Op::Summary => "Summary",
            Op::AddN => "AddN",
            Op::ZerosLike => "ZerosLike",
            Op::ReduceLike => "ReduceLike",
            Op::BroadcastLike => "BroadcastLike",
            Op::TanhGrad => "TanhGrad",
        }
    }

    /// Returns the amount of inputs the op takes, `None` if it's variadic.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Op::Placeholder { .. } | Op::Const { .. } => Some(0),
            Op::Identity | Op::Tanh | Op::ReduceSum | Op::Summary | Op::ZerosLike => Some(1),
            Op::Add
            | Op::Mul
            | Op::MatMul { .. }
            | Op::ReduceLike
            | Op::BroadcastLike
            | Op::TanhGrad => Some(2),
            Op::AddN => None,
        }
    }
}

/// A single named node of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: Op,
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Textual element type tag, see `DType`.
    pub dtype: String,
}

/// A whole dataflow graph, the unit the engine imports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    pub nodes: Vec<NodeDef>,
}

impl GraphDef {
    /// Serializes the graph into its opaque byte form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a graph out of its opaque byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Looks up a node by name.
    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|node| node.name == name)
    }
}

/// Assembles a `GraphDef` node by node.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeDef>,
}

impl GraphBuilder {
    /// Creates a new, empty `GraphBuilder`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a placeholder node.
    ///
    /// # Arguments
    /// * `name` - The node's name.
    /// * `dtype` - The element type it accepts.
    /// * `shape` - The declared dimensions, `-1` for any size, `None` for any rank.
    ///
    /// # Returns
    /// The node's name, for wiring it into later nodes.
    pub fn placeholder(&mut self, name: &str, dtype: DType, shape: Option<&[i64]>) -> String {
        let op = Op::Placeholder {
            shape: shape.map(<[i64]>::to_vec),
        };

        self.push(name, op, &[], dtype)
    }

    /// Declares a constant node holding `tensor`.
    pub fn constant(&mut self, name: &str, tensor: &NativeTensor) -> String {
        let op = Op::Const {
            value: TensorProto::from_tensor(tensor),
        };

        self.push(name, op, &[], tensor.dtype())
    }

    /// Declares an op node reading from `inputs`.
    pub fn op(&mut self, name: &str, op: Op, inputs: &[&str], dtype: DType) -> String {
        self.push(name, op, inputs, dtype)
    }

    /// Consumes the builder and returns the assembled graph.
    pub fn build(self) -> GraphDef {
        GraphDef { nodes: self.nodes }
    }

    fn push(&mut self, name: &str, op: Op, inputs: &[&str], dtype: DType) -> String {
        self.nodes.push(NodeDef {
            name: name.to_string(),
            op,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            dtype: dtype.tag().to_string(),
        });

        name.to_string()
    }
}

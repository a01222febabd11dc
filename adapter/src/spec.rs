//! The description of a layer's native graph.

use std::collections::BTreeMap;

use engine::{DType, EngineErr, GraphBuilder, GraphDef, Op};
use serde::{Deserialize, Serialize};

use crate::{AdapterErr, DenseTensor, Result, SharedTensor};

/// A layer's weights keyed by the names of their graph nodes.
///
/// The same keys are used to feed or freeze the weights and to look up their gradients.
pub type WeightMap = BTreeMap<String, SharedTensor>;

/// Chooses the element type of every node key: a default with per-key overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecisionPolicy {
    pub default: DType,
    #[serde(default)]
    pub overrides: BTreeMap<String, DType>,
}

impl PrecisionPolicy {
    /// Creates a policy selecting `dtype` for every key.
    pub fn uniform(dtype: DType) -> Self {
        Self {
            default: dtype,
            overrides: BTreeMap::new(),
        }
    }

    /// Overrides the element type of `key`.
    pub fn with(mut self, key: impl Into<String>, dtype: DType) -> Self {
        self.overrides.insert(key.into(), dtype);
        self
    }

    pub fn of(&self, key: &str) -> DType {
        self.overrides.get(key).copied().unwrap_or(self.default)
    }
}

impl Default for PrecisionPolicy {
    fn default() -> Self {
        Self::uniform(DType::F64)
    }
}

/// What an execution session needs to know about a layer's graph.
///
/// Node names are exact and stable. Weights are placeholders whose element type is
/// `precision(weight)`, and the output's leading dimension is the batch size.
pub trait GraphSpec: Send + Sync {
    /// Serializes the graph. Calling it repeatedly yields graphs with the same semantics.
    fn graph_def(&self) -> Result<Vec<u8>>;

    fn input_nodes(&self) -> &[String];

    fn output_node(&self) -> &str;

    /// The node producing summary statistics, if the graph has one.
    fn summary_node(&self) -> Option<&str>;

    /// Whether a single run only accepts one example.
    fn is_single_batch(&self) -> bool;

    /// Returns the element type used for the node or key `node`.
    fn precision(&self, node: &str) -> DType;

    fn weights(&self) -> &WeightMap;
}

/// A `GraphSpec` over an in-memory graph definition.
#[derive(Debug, Clone)]
pub struct LayerGraph {
    def: GraphDef,
    inputs: Vec<String>,
    output: String,
    summary: Option<String>,
    weights: WeightMap,
    precision: PrecisionPolicy,
    single_batch: bool,
}

impl LayerGraph {
    pub fn def(&self) -> &GraphDef {
        &self.def
    }
}

impl GraphSpec for LayerGraph {
    fn graph_def(&self) -> Result<Vec<u8>> {
        self.def.to_bytes().map_err(AdapterErr::GraphImport)
    }

    fn input_nodes(&self) -> &[String] {
        &self.inputs
    }

    fn output_node(&self) -> &str {
        &self.output
    }

    fn summary_node(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    fn is_single_batch(&self) -> bool {
        self.single_batch
    }

    fn precision(&self, node: &str) -> DType {
        self.precision.of(node)
    }

    fn weights(&self) -> &WeightMap {
        &self.weights
    }
}

/// Assembles a `LayerGraph`, declaring every node at the precision its name selects.
#[derive(Debug)]
pub struct LayerGraphBuilder {
    graph: GraphBuilder,
    inputs: Vec<String>,
    output: Option<String>,
    summary: Option<String>,
    weights: WeightMap,
    precision: PrecisionPolicy,
    single_batch: bool,
}

impl LayerGraphBuilder {
    /// Creates a new `LayerGraphBuilder`.
    pub fn new(precision: PrecisionPolicy) -> Self {
        Self {
            graph: GraphBuilder::new(),
            inputs: Vec::new(),
            output: None,
            summary: None,
            weights: WeightMap::new(),
            precision,
            single_batch: false,
        }
    }

    /// Declares an input taking batches of examples shaped `example_shape`.
    pub fn input(&mut self, name: &str, example_shape: &[usize]) -> String {
        let shape: Vec<i64> = std::iter::once(-1)
            .chain(example_shape.iter().map(|&d| d as i64))
            .collect();

        let dtype = self.precision.of(name);
        self.inputs.push(name.to_string());
        self.graph.placeholder(name, dtype, Some(&shape))
    }

    /// Declares a weight placeholder bound to `tensor`.
    pub fn weight(&mut self, name: &str, tensor: DenseTensor) -> String {
        let shape: Vec<i64> = tensor.shape().iter().map(|&d| d as i64).collect();
        let dtype = self.precision.of(name);

        self.weights.insert(name.to_string(), tensor.shared());
        self.graph.placeholder(name, dtype, Some(&shape))
    }

    pub fn op(&mut self, name: &str, op: Op, inputs: &[&str]) -> String {
        let dtype = self.precision.of(name);
        self.graph.op(name, op, inputs, dtype)
    }

    /// Declares a `Summary` node over `input`, fetched when telemetry is installed.
    pub fn summary(&mut self, name: &str, input: &str) -> String {
        self.summary = Some(name.to_string());
        self.op(name, Op::Summary, &[input])
    }

    pub fn output(&mut self, name: &str) -> &mut Self {
        self.output = Some(name.to_string());
        self
    }

    pub fn single_batch(&mut self, single_batch: bool) -> &mut Self {
        self.single_batch = single_batch;
        self
    }

    /// Finishes the graph.
    ///
    /// # Returns
    /// The `LayerGraph`, or a `GraphImport` error if no output was set or a named node is missing.
    pub fn build(self) -> Result<LayerGraph> {
        let def = self.graph.build();
        let output = self
            .output
            .ok_or_else(|| EngineErr::InvalidGraph("the layer graph has no output".to_string()))
            .map_err(AdapterErr::GraphImport)?;

        let named = self.inputs.iter().chain([&output]).chain(&self.summary);
        for name in named {
            if def.node(name).is_none() {
                return Err(AdapterErr::GraphImport(EngineErr::NodeNotFound(name.clone())));
            }
        }

        Ok(LayerGraph {
            def,
            inputs: self.inputs,
            output,
            summary: self.summary,
            weights: self.weights,
            precision: self.precision,
            single_batch: self.single_batch,
        })
    }
}

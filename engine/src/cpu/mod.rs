//! A reference in-process implementation of the engine traits over `ndarray`.
//!
//! Values are computed in `f64` and rounded through `f32` at every node declared as `f32`.

mod grad;
mod kernels;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use log::{debug, trace};
use ndarray::ArrayD;
use parking_lot::{Mutex, RwLock};

use crate::{
    DType, Engine, EngineErr, Feed, GraphDef, NativeGraph, NativeRuntime, NativeTensor, Op,
    OutputRef, Result, TensorProto,
};

/// Live handle counters and run bookkeeping of a `CpuEngine`.
#[derive(Debug, Default)]
pub struct EngineStats {
    imports: AtomicUsize,
    runs: AtomicUsize,
    live_graphs: AtomicUsize,
    live_runtimes: AtomicUsize,
    last_fetches: Mutex<Vec<String>>,
}

impl EngineStats {
    pub fn imports(&self) -> usize {
        self.imports.load(Ordering::Acquire)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Acquire)
    }

    /// Returns the amount of graphs imported and not yet dropped.
    pub fn live_graphs(&self) -> usize {
        self.live_graphs.load(Ordering::Acquire)
    }

    /// Returns the amount of runtimes opened and not yet dropped.
    pub fn live_runtimes(&self) -> usize {
        self.live_runtimes.load(Ordering::Acquire)
    }

    /// Returns the fetch list of the most recent run, in request order.
    pub fn last_fetches(&self) -> Vec<String> {
        self.last_fetches.lock().clone()
    }
}

/// The reference engine.
#[derive(Debug, Clone, Default)]
pub struct CpuEngine {
    stats: Arc<EngineStats>,
}

impl CpuEngine {
    /// Creates a new `CpuEngine` with its own statistics.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }
}

impl Engine for CpuEngine {
    fn validate(&self, graph_def: &[u8]) -> Result<()> {
        let def = GraphDef::from_bytes(graph_def)?;
        GraphState::from_def(def).map(|_| ())
    }

    fn freeze(&self, graph_def: &[u8], constants: &[(&str, &NativeTensor)]) -> Result<Vec<u8>> {
        let mut def = GraphDef::from_bytes(graph_def)?;

        for &(name, tensor) in constants {
            let node = def
                .nodes
                .iter_mut()
                .find(|node| node.name == name)
                .ok_or_else(|| EngineErr::NodeNotFound(name.to_string()))?;

            let Op::Placeholder { shape } = &node.op else {
                return Err(EngineErr::InvalidGraph(format!(
                    "`{name}` is a {} node, only placeholders can be frozen",
                    node.op.name()
                )));
            };

            let dtype: DType = node.dtype.parse()?;
            check_feed(name, dtype, shape.as_deref(), tensor)?;

            node.op = Op::Const {
                value: TensorProto::from_tensor(tensor),
            };
        }

        def.to_bytes()
    }

    fn import(&self, graph_def: &[u8]) -> Result<Box<dyn NativeGraph>> {
        let def = GraphDef::from_bytes(graph_def)?;
        let state = GraphState::from_def(def)?;

        debug!(nodes = state.nodes.len(); "imported graph");
        self.stats.imports.fetch_add(1, Ordering::AcqRel);
        self.stats.live_graphs.fetch_add(1, Ordering::AcqRel);

        Ok(Box::new(CpuGraph {
            state: Arc::new(RwLock::new(state)),
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// A validated, index-addressed node.
///
/// Inputs always point to nodes with a smaller index, so index order is a topological order.
#[derive(Debug)]
pub(crate) struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<usize>,
    pub dtype: DType,
}

#[derive(Debug, Default)]
pub(crate) struct GraphState {
    pub nodes: Vec<Node>,
    index: HashMap<String, usize>,
    grad_scopes: usize,
}

impl GraphState {
    fn from_def(def: GraphDef) -> Result<Self> {
        let mut state = Self::default();

        for node in def.nodes {
            let dtype: DType = node.dtype.parse()?;

            match node.op.arity() {
                Some(arity) if arity != node.inputs.len() => {
                    return Err(EngineErr::InvalidGraph(format!(
                        "node `{}` ({}) takes {arity} inputs, got {}",
                        node.name,
                        node.op.name(),
                        node.inputs.len()
                    )));
                }
                None if node.inputs.is_empty() => {
                    return Err(EngineErr::InvalidGraph(format!(
                        "node `{}` ({}) needs at least one input",
                        node.name,
                        node.op.name()
                    )));
                }
                _ => {}
            }

            if let Op::Const { value } = &node.op {
                value.to_tensor(dtype)?;
            }

            let inputs = node
                .inputs
                .iter()
                .map(|input| {
                    state.lookup(input).map_err(|_| {
                        EngineErr::InvalidGraph(format!(
                            "node `{}` reads `{input}` before it is declared",
                            node.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            state.push(node.name, node.op, inputs, dtype)?;
        }

        Ok(state)
    }

    pub fn lookup(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| EngineErr::NodeNotFound(name.to_string()))
    }

    pub fn push(&mut self, name: String, op: Op, inputs: Vec<usize>, dtype: DType) -> Result<usize> {
        if self.index.contains_key(&name) {
            return Err(EngineErr::DuplicateNode(name));
        }

        let idx = self.nodes.len();
        self.index.insert(name.clone(), idx);
        self.nodes.push(Node {
            name,
            op,
            inputs,
            dtype,
        });

        Ok(idx)
    }

    /// Returns a fresh prefix for the nodes of one gradient construction.
    pub fn next_grad_scope(&mut self) -> String {
        let scope = format!("gradients_{}", self.grad_scopes);
        self.grad_scopes += 1;
        scope
    }

    /// Computes node `idx` and every ancestor missing from `values`.
    ///
    /// Nodes only read nodes declared before them, so ascending index order is topological.
    fn eval(&self, idx: usize, values: &mut HashMap<usize, ArrayD<f64>>) -> Result<()> {
        let mut needed = vec![false; idx + 1];
        let mut stack = vec![idx];

        while let Some(i) = stack.pop() {
            if needed[i] || values.contains_key(&i) {
                continue;
            }

            needed[i] = true;
            stack.extend(&self.nodes[i].inputs);
        }

        for (i, node) in self.nodes[..=idx].iter().enumerate() {
            if !needed[i] {
                continue;
            }

            let inputs: Vec<_> = node.inputs.iter().map(|input| &values[input]).collect();
            let mut out = kernels::compute(node, &inputs)?;

            if node.dtype == DType::F32 {
                out.mapv_inplace(|x| x as f32 as f64);
            }

            values.insert(i, out);
        }

        Ok(())
    }
}

/// Checks a tensor against a placeholder's declared dtype and shape.
fn check_feed(name: &str, dtype: DType, declared: Option<&[i64]>, tensor: &NativeTensor) -> Result<()> {
    if tensor.dtype() != dtype {
        return Err(EngineErr::DTypeMismatch {
            node: name.to_string(),
            got: tensor.dtype().tag(),
            expected: dtype.tag(),
        });
    }

    let Some(declared) = declared else {
        return Ok(());
    };

    let got = tensor.shape();
    let compatible = declared.len() == got.len()
        && declared
            .iter()
            .zip(got)
            .all(|(&d, &g)| d < 0 || d as usize == g);

    if !compatible {
        return Err(EngineErr::ShapeMismatch {
            node: name.to_string(),
            got: got.to_vec(),
            expected: declared.to_vec(),
        });
    }

    Ok(())
}

struct CpuGraph {
    state: Arc<RwLock<GraphState>>,
    stats: Arc<EngineStats>,
}

impl NativeGraph for CpuGraph {
    fn add_placeholder(&mut self, name: &str, dtype: DType) -> Result<OutputRef> {
        let op = Op::Placeholder { shape: None };
        self.state.write().push(name.to_string(), op, Vec::new(), dtype)?;
        Ok(OutputRef::new(name))
    }

    fn add_gradients(
        &mut self,
        y: &OutputRef,
        xs: &[OutputRef],
        dy: &OutputRef,
    ) -> Result<Vec<OutputRef>> {
        let mut state = self.state.write();
        let y = state.lookup(y.name())?;
        let dy = state.lookup(dy.name())?;
        let xs = xs
            .iter()
            .map(|x| state.lookup(x.name()))
            .collect::<Result<Vec<_>>>()?;

        let grads = grad::add_gradients(&mut state, y, &xs, dy)?;
        Ok(grads
            .into_iter()
            .map(|idx| OutputRef::new(state.nodes[idx].name.clone()))
            .collect())
    }

    fn runtime(&self) -> Result<Box<dyn NativeRuntime>> {
        self.stats.live_runtimes.fetch_add(1, Ordering::AcqRel);

        Ok(Box::new(CpuRuntime {
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
        }))
    }
}

impl Drop for CpuGraph {
    fn drop(&mut self) {
        self.stats.live_graphs.fetch_sub(1, Ordering::AcqRel);
    }
}

struct CpuRuntime {
    state: Arc<RwLock<GraphState>>,
    stats: Arc<EngineStats>,
}

impl NativeRuntime for CpuRuntime {
    fn run(&mut self, feeds: &[Feed<'_>], fetches: &[OutputRef]) -> Result<Vec<NativeTensor>> {
        let state = self.state.read();
        let mut values = HashMap::with_capacity(feeds.len() + fetches.len());

        for feed in feeds {
            let idx = state.lookup(feed.node)?;
            let node = &state.nodes[idx];
            let declared = match &node.op {
                Op::Placeholder { shape } => shape.as_deref(),
                _ => None,
            };

            check_feed(feed.node, node.dtype, declared, feed.tensor)?;
            values.insert(idx, feed.tensor.to_array()?);
        }

        let mut outputs = Vec::with_capacity(fetches.len());
        for fetch in fetches {
            let idx = state.lookup(fetch.name())?;
            state.eval(idx, &mut values)?;
            outputs.push(NativeTensor::from_array(&values[&idx], state.nodes[idx].dtype));
        }

        trace!(feeds = feeds.len(), fetches = fetches.len(); "run completed");
        self.stats.runs.fetch_add(1, Ordering::AcqRel);
        *self.stats.last_fetches.lock() = fetches.iter().map(|f| f.name().to_string()).collect();

        Ok(outputs)
    }
}

impl Drop for CpuRuntime {
    fn drop(&mut self) {
        self.stats.live_runtimes.fetch_sub(1, Ordering::AcqRel);
    }
}

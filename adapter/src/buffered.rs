//! Constant-weight evaluation with deferred weight gradient accumulation.

use std::{collections::BTreeMap, sync::Arc};

use engine::{DType, Engine, EngineErr, Feed, GraphBuilder, NativeTensor, Op, OutputRef};
use log::debug;
use parking_lot::Mutex;

use crate::{
    AdapterErr, DeltaAccumulator, DeltaSet, DenseTensor, Result, TensorBatch,
    codec::{NativeTensorHandle, TensorCodec},
    session::{ExecutionSession, SessionOptions},
    spec::GraphSpec,
    splitter::{BatchSplitter, SplitPass},
};

const SUM_NODE: &str = "sum";

/// A shared constant-weight session that keeps the native weight gradients of every backward
/// call until `flush` sums them with one batched addition per weight.
///
/// The weights are baked in when the adapter is created, so it has to be retired before the
/// weights change. Backward calls reaching a retired adapter accumulate their weight gradients
/// directly.
pub struct BufferedAdapter {
    engine: Arc<dyn Engine>,
    session: Mutex<ExecutionSession>,
    accumulator: DeltaAccumulator,
    pending: Mutex<Pending>,
}

#[derive(Default)]
struct Pending {
    grads: BTreeMap<String, Vec<NativeTensorHandle>>,
    retired: bool,
}

impl BufferedAdapter {
    /// Creates a new `BufferedAdapter`.
    ///
    /// # Arguments
    /// * `engine` - The engine running both the layer graph and the batched additions.
    /// * `spec` - The layer graph, its weights are frozen at their current values.
    /// * `codec` - Converts tensors to and from the engine.
    /// * `accumulator` - Routes the summed gradients of the layer's weights.
    /// * `options` - Session options, `constant_weights` is forced on.
    ///
    /// # Returns
    /// A new `BufferedAdapter` or the session's import failure.
    pub fn new(
        engine: Arc<dyn Engine>,
        spec: Arc<dyn GraphSpec>,
        codec: TensorCodec,
        accumulator: DeltaAccumulator,
        options: SessionOptions,
    ) -> Result<Self> {
        let options = SessionOptions {
            constant_weights: true,
            ..options
        };

        let session = ExecutionSession::new(engine.as_ref(), spec, codec, options)?;

        Ok(Self {
            engine,
            session: Mutex::new(session),
            accumulator,
            pending: Mutex::new(Pending::default()),
        })
    }

    /// Runs the forward pass of `inputs` on the shared session.
    pub fn forward(&self, inputs: &[&[DenseTensor]]) -> Result<SplitPass> {
        let mut session = self.session.lock();
        BatchSplitter::new(&mut session).forward(inputs)
    }

    /// Backpropagates through `pass`, keeping its weight gradients pending.
    ///
    /// # Arguments
    /// * `pass` - The forward pass to backpropagate.
    /// * `output_gradient` - The gradient of every example's output.
    /// * `deltas` - Receives the weight gradients right away if the adapter was retired.
    ///
    /// # Returns
    /// The gradient batch of every input.
    pub fn backward(
        &self,
        pass: SplitPass,
        output_gradient: &[DenseTensor],
        deltas: &DeltaSet,
    ) -> Result<Vec<TensorBatch>> {
        let mut session = self.session.lock();
        let grads = BatchSplitter::new(&mut session).backward(pass, output_gradient)?;
        let inputs = grads.input_gradients(session.codec())?;
        let codec = session.codec().clone();
        drop(session);

        let mut pending = self.pending.lock();
        if pending.retired {
            drop(pending);
            debug!("adapter retired, accumulating weight gradients directly");
            grads.accumulate(&codec, &self.accumulator, deltas)?;
            return Ok(inputs);
        }

        for (name, grad) in grads.into_weights() {
            pending.grads.entry(name).or_default().push(grad);
        }

        Ok(inputs)
    }

    /// Returns how many weight gradients are waiting for `flush`.
    pub fn pending(&self) -> usize {
        self.pending.lock().grads.values().map(Vec::len).sum()
    }

    pub fn is_retired(&self) -> bool {
        self.pending.lock().retired
    }

    /// Sums the pending gradients of every weight and adds each sum into `deltas` once.
    ///
    /// A weight's gradients stay pending until its sum was accumulated, so a failed flush can
    /// be retried without counting any gradient twice.
    pub fn flush(&self, deltas: &DeltaSet) -> Result<()> {
        let mut pending = self.pending.lock();
        self.drain(&mut pending, deltas)
    }

    /// Flushes the pending gradients and retires the adapter if that succeeds.
    pub fn retire(&self, deltas: &DeltaSet) -> Result<()> {
        let mut pending = self.pending.lock();
        self.drain(&mut pending, deltas)?;
        pending.retired = true;
        Ok(())
    }

    pub fn accumulator(&self) -> &DeltaAccumulator {
        &self.accumulator
    }

    fn drain(&self, pending: &mut Pending, deltas: &DeltaSet) -> Result<()> {
        let session = self.session.lock();
        let codec = session.codec();

        while let Some(entry) = pending.grads.first_entry() {
            let grads = entry.get();

            if !grads.is_empty() {
                let weight = entry.key().as_str();
                debug!(weight = weight, gradients = grads.len(); "flushing pending gradients");

                let sum = add_n(self.engine.as_ref(), grads)?;
                let sum = codec.internalize(&sum)?;
                self.accumulator.accumulate(deltas, weight, sum.data())?;
            }

            entry.remove();
        }

        Ok(())
    }
}

/// Sums same-shaped tensors with a single `AddN` run.
fn add_n(engine: &dyn Engine, tensors: &[NativeTensorHandle]) -> Result<NativeTensor> {
    let dtype = tensors.first().map_or(DType::F64, |t| t.dtype());

    let mut builder = GraphBuilder::new();
    let names: Vec<_> = (0..tensors.len())
        .map(|i| builder.placeholder(&format!("grad_{i}"), dtype, None))
        .collect();

    let inputs: Vec<_> = names.iter().map(String::as_str).collect();
    let sum = builder.op(SUM_NODE, Op::AddN, &inputs, dtype);

    let graph_def = builder.build().to_bytes().map_err(AdapterErr::import)?;
    let graph = engine.import(&graph_def).map_err(AdapterErr::import)?;
    let mut runtime = graph.runtime().map_err(AdapterErr::import)?;

    let feeds: Vec<_> = names
        .iter()
        .zip(tensors)
        .map(|(name, tensor)| Feed::new(name, tensor))
        .collect();

    runtime
        .run(&feeds, &[OutputRef::new(sum)])
        .map_err(AdapterErr::run)?
        .pop()
        .ok_or_else(|| AdapterErr::Engine(EngineErr::NodeNotFound(SUM_NODE.to_string())))
}

//! The host-facing layer backed by a native graph.

use std::sync::Arc;

use engine::Engine;
use log::debug;
use parking_lot::Mutex;

use crate::{
    BufferedAdapter, DeltaAccumulator, DeltaSet, DenseTensor, Evaluation, Result, TensorBatch,
    codec::{BufferPool, TensorCodec},
    config::LayerConfig,
    host::{BackwardFn, invoke_backward},
    session::{ExecutionSession, SessionOptions},
    spec::{GraphSpec, WeightMap},
    splitter::BatchSplitter,
    summary::Telemetry,
};

/// A layer of the host network whose forward and backward passes run on a native graph.
///
/// Without buffering every evaluation opens its own session, which lives until the evaluation
/// is backpropagated or dropped. With buffering all evaluations share one constant-weight
/// session until `flush`.
pub struct GraphLayer {
    id: String,
    engine: Arc<dyn Engine>,
    spec: Arc<dyn GraphSpec>,
    config: LayerConfig,
    codec: TensorCodec,
    accumulator: DeltaAccumulator,
    telemetry: Option<Telemetry>,
    buffered: Mutex<Option<Arc<BufferedAdapter>>>,
}

impl GraphLayer {
    /// Creates a new `GraphLayer` drawing scratch buffers from the global pool.
    ///
    /// # Arguments
    /// * `id` - The layer's identity, part of every weight's gradient identity.
    /// * `engine` - The engine running the layer's graph.
    /// * `spec` - The layer's graph and weights.
    /// * `config` - The layer's configuration.
    ///
    /// # Returns
    /// A new `GraphLayer` instance.
    pub fn new(
        id: impl Into<String>,
        engine: Arc<dyn Engine>,
        spec: Arc<dyn GraphSpec>,
        config: LayerConfig,
    ) -> Self {
        let id = id.into();
        let accumulator = DeltaAccumulator::new(id.clone(), spec.weights().clone());

        Self {
            id,
            engine,
            spec,
            config,
            codec: TensorCodec::new(BufferPool::global()),
            accumulator,
            telemetry: None,
            buffered: Mutex::new(None),
        }
    }

    /// Gives the layer its own pool, sized by its configuration.
    pub fn with_isolated_pool(mut self) -> Self {
        let pool = BufferPool::new(&self.config.pool);
        self.codec = TensorCodec::new(Arc::new(pool));
        self
    }

    pub fn with_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.codec = TensorCodec::new(pool);
        self
    }

    /// Sends the records of the graph's summary node to `telemetry`.
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn weights(&self) -> &WeightMap {
        self.spec.weights()
    }

    pub fn spec(&self) -> &Arc<dyn GraphSpec> {
        &self.spec
    }

    pub fn codec(&self) -> &TensorCodec {
        &self.codec
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    /// Evaluates the layer over the outputs of the nodes feeding it.
    ///
    /// # Arguments
    /// * `inputs` - One evaluation per input node of the graph, in order.
    ///
    /// # Returns
    /// An evaluation whose backward pass accumulates the weight gradients and backpropagates
    /// every input's gradient through the input's own backward pass.
    pub fn eval(&self, inputs: Vec<Evaluation>) -> Result<Evaluation> {
        let (batches, callbacks): (Vec<_>, Vec<_>) =
            inputs.into_iter().map(Evaluation::into_parts).unzip();
        let views: Vec<&[DenseTensor]> = batches.iter().map(|batch| batch.as_slice()).collect();

        if self.config.buffered {
            return self.eval_buffered(&views, callbacks);
        }

        let mut session = ExecutionSession::new(
            self.engine.as_ref(),
            Arc::clone(&self.spec),
            self.codec.clone(),
            self.session_options(false),
        )?;

        let mut pass = BatchSplitter::new(&mut session).forward(&views)?;
        let output = pass.take_output();

        let codec = self.codec.clone();
        let accumulator = self.accumulator.clone();

        Ok(Evaluation::new(output, move |deltas, gradient| {
            let grads = BatchSplitter::new(&mut session).backward(pass, &gradient)?;
            drop(gradient);

            let inputs = grads.input_gradients(&codec)?;
            session.release();

            deliver(callbacks, inputs, deltas)?;
            grads.accumulate(&codec, &accumulator, deltas)
        }))
    }

    fn eval_buffered(
        &self,
        views: &[&[DenseTensor]],
        callbacks: Vec<Option<BackwardFn>>,
    ) -> Result<Evaluation> {
        let adapter = self.buffered_adapter()?;
        let mut pass = adapter.forward(views)?;
        let output = pass.take_output();

        Ok(Evaluation::new(output, move |deltas, gradient| {
            let inputs = adapter.backward(pass, &gradient, deltas)?;
            drop(gradient);

            deliver(callbacks, inputs, deltas)
        }))
    }

    /// Returns the shared buffered adapter, creating it with the current weight values if absent.
    fn buffered_adapter(&self) -> Result<Arc<BufferedAdapter>> {
        let mut buffered = self.buffered.lock();

        if let Some(adapter) = buffered.as_ref() {
            return Ok(Arc::clone(adapter));
        }

        let adapter = Arc::new(BufferedAdapter::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.spec),
            self.codec.clone(),
            self.accumulator.clone(),
            self.session_options(true),
        )?);

        debug!(layer = self.id.as_str(); "created buffered adapter");
        *buffered = Some(Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Adds the pending gradients of the buffered adapter into `deltas` and retires the adapter,
    /// so the next evaluation bakes the weights' new values.
    ///
    /// Does nothing when the layer isn't buffered or wasn't evaluated since the last flush. On
    /// failure the adapter stays in place with the gradients it couldn't add, so the flush can
    /// be retried.
    pub fn flush(&self, deltas: &DeltaSet) -> Result<()> {
        let mut buffered = self.buffered.lock();
        let Some(adapter) = buffered.as_ref() else {
            return Ok(());
        };

        debug!(layer = self.id.as_str(), pending = adapter.pending(); "flushing layer");
        adapter.retire(deltas)?;
        *buffered = None;
        Ok(())
    }

    fn session_options(&self, constant_weights: bool) -> SessionOptions {
        SessionOptions {
            constant_weights,
            background_teardown: self.config.background_teardown,
            telemetry: self.telemetry.clone(),
        }
    }
}

/// Hands every input its gradient batch, checking each callback let go of it.
fn deliver(
    callbacks: Vec<Option<BackwardFn>>,
    gradients: Vec<TensorBatch>,
    deltas: &DeltaSet,
) -> Result<()> {
    for (input, (callback, gradient)) in callbacks.into_iter().zip(gradients).enumerate() {
        if let Some(callback) = callback {
            invoke_backward(input, callback, deltas, gradient)?;
        }
    }

    Ok(())
}

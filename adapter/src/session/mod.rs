//! Execution of a layer graph on a native engine.

mod feeds;

use std::sync::Arc;

use engine::{Engine, EngineErr, Feed, NativeGraph, NativeRuntime, NativeTensor, OutputRef};
use log::{debug, trace};

pub use feeds::{FeedSet, ForwardPass, GradientFetch};

use crate::{
    AdapterErr, DenseTensor, Result, codec::NativeTensorHandle, codec::TensorCodec,
    spec::GraphSpec, summary::SummaryRecord, summary::Telemetry,
};

/// How an `ExecutionSession` is built and torn down.
#[derive(Clone)]
pub struct SessionOptions {
    /// Bake the current weight values into the graph instead of feeding them on every run.
    pub constant_weights: bool,
    /// Destroy the native graph on the rayon pool instead of the releasing thread.
    pub background_teardown: bool,
    /// Where summary records go. Without it the summary node is never fetched.
    pub telemetry: Option<Telemetry>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            constant_weights: false,
            background_teardown: true,
            telemetry: None,
        }
    }
}

/// The native graph and the runtime opened over it, destroyed together.
struct Native {
    graph: Box<dyn NativeGraph>,
    runtime: Box<dyn NativeRuntime>,
}

/// The lazily built gradient subgraph.
struct Gradients {
    delta: String,
    outputs: Vec<OutputRef>,
}

/// One imported layer graph together with the runtime executing it.
///
/// A session isn't reentrant: the caller serializes its operations. Distinct sessions may run
/// on different threads at the same time.
pub struct ExecutionSession {
    spec: Arc<dyn GraphSpec>,
    codec: TensorCodec,
    options: SessionOptions,
    native: Option<Native>,
    gradients: Option<Gradients>,
}

impl ExecutionSession {
    /// Imports the graph described by `spec`.
    ///
    /// # Arguments
    /// * `engine` - The engine to import the graph into.
    /// * `spec` - The layer graph.
    /// * `codec` - Converts tensors to and from the engine.
    /// * `options` - How to build the session.
    ///
    /// # Returns
    /// A ready session, or the import failure.
    pub fn new(
        engine: &dyn Engine,
        spec: Arc<dyn GraphSpec>,
        codec: TensorCodec,
        options: SessionOptions,
    ) -> Result<Self> {
        let mut graph_def = spec.graph_def()?;
        engine.validate(&graph_def).map_err(AdapterErr::import)?;

        if options.constant_weights {
            graph_def = freeze_weights(engine, spec.as_ref(), &codec, &graph_def)?;
            engine.validate(&graph_def).map_err(AdapterErr::import)?;
        }

        let graph = engine.import(&graph_def).map_err(AdapterErr::import)?;
        let runtime = graph.runtime().map_err(AdapterErr::import)?;

        debug!(
            output = spec.output_node(),
            constant_weights = options.constant_weights;
            "opened execution session"
        );

        Ok(Self {
            spec,
            codec,
            options,
            native: Some(Native { graph, runtime }),
            gradients: None,
        })
    }

    pub fn spec(&self) -> &Arc<dyn GraphSpec> {
        &self.spec
    }

    pub fn codec(&self) -> &TensorCodec {
        &self.codec
    }

    pub fn is_constant_weights(&self) -> bool {
        self.options.constant_weights
    }

    pub fn is_released(&self) -> bool {
        self.native.is_none()
    }

    /// Whether the gradient subgraph was built already.
    pub fn has_gradients(&self) -> bool {
        self.gradients.is_some()
    }

    /// Runs the graph over one batch per input node.
    ///
    /// # Arguments
    /// * `inputs` - The batches, in the order of the graph's input nodes.
    ///
    /// # Returns
    /// The forward pass, holding the output batch and every native tensor of the run.
    pub fn forward(&mut self, inputs: &[&[DenseTensor]]) -> Result<ForwardPass> {
        let native = self.native.as_mut().ok_or(AdapterErr::Released)?;
        let spec = self.spec.as_ref();

        if inputs.len() != spec.input_nodes().len() {
            return Err(AdapterErr::SizeMismatch {
                what: "forward inputs",
                got: inputs.len(),
                expected: spec.input_nodes().len(),
            });
        }

        let mut feeds = FeedSet::new();

        if !self.options.constant_weights {
            for (name, weight) in spec.weights() {
                let tensor = self.codec.externalize(&weight.read(), spec.precision(name))?;
                feeds.push(name.as_str(), tensor);
            }
        }

        for (node, batch) in spec.input_nodes().iter().zip(inputs) {
            let tensor = self.codec.externalize_batch(batch, spec.precision(node))?;
            feeds.push(node.as_str(), tensor);
        }

        let summary = match (&self.options.telemetry, spec.summary_node()) {
            (Some(telemetry), Some(node)) => Some((telemetry, node)),
            _ => None,
        };

        let mut fetches = vec![OutputRef::new(spec.output_node())];
        if let Some((_, node)) = summary {
            fetches.push(OutputRef::new(node));
        }

        let mut outputs = native
            .runtime
            .run(&feeds.feeds(), &fetches)
            .map_err(AdapterErr::run)?
            .into_iter();

        let native_output =
            NativeTensorHandle::native(next_output(&mut outputs, spec.output_node())?);
        let output = self.codec.internalize_batch(&native_output)?;

        if let Some((telemetry, node)) = summary {
            let record = SummaryRecord::decode(node, &next_output(&mut outputs, node)?)?;
            telemetry.emit(&record);
        }

        trace!(output = spec.output_node(), examples = output.len(); "forward run completed");

        Ok(ForwardPass {
            output,
            native_output,
            feeds,
        })
    }

    /// Backpropagates `output_gradient` through the run of `pass`.
    ///
    /// Builds the gradient subgraph on first use. Every native tensor of the pass and of this run
    /// is released when the call returns, whatever its outcome.
    ///
    /// # Arguments
    /// * `pass` - The forward pass to differentiate, consumed.
    /// * `output_gradient` - The gradient of the output, shaped exactly like the output.
    ///
    /// # Returns
    /// One native gradient per input followed by one per weight.
    pub fn backward(
        &mut self,
        pass: ForwardPass,
        output_gradient: &[DenseTensor],
    ) -> Result<GradientFetch> {
        let native = self.native.as_mut().ok_or(AdapterErr::Released)?;
        let spec = self.spec.as_ref();

        if self.gradients.is_none() {
            self.gradients = Some(build_gradients(native.graph.as_mut(), spec)?);
        }

        let Some(gradients) = &self.gradients else {
            return Err(AdapterErr::Released);
        };

        let delta = self
            .codec
            .externalize_batch(output_gradient, spec.precision(&gradients.delta))?;

        if delta.shape() != pass.output_shape() {
            return Err(AdapterErr::shape(
                gradients.delta.as_str(),
                delta.shape(),
                pass.output_shape(),
            ));
        }

        let mut feeds = pass.feeds.feeds();
        feeds.push(Feed::new(&gradients.delta, &delta));

        let outputs = native
            .runtime
            .run(&feeds, &gradients.outputs)
            .map_err(AdapterErr::run)?;

        let inputs = spec.input_nodes().len();
        let expected = inputs + spec.weights().len();
        if outputs.len() != expected {
            return Err(AdapterErr::SizeMismatch {
                what: "gradient fetches",
                got: outputs.len(),
                expected,
            });
        }

        let mut outputs = outputs.into_iter().map(NativeTensorHandle::native);
        let input_grads = outputs.by_ref().take(inputs).collect();
        let weight_grads = spec.weights().keys().cloned().zip(outputs).collect();

        trace!(output = spec.output_node(), fetched = expected; "backward run completed");

        Ok(GradientFetch {
            inputs: input_grads,
            weights: weight_grads,
        })
    }

    /// Makes the session unusable and destroys its native graph.
    ///
    /// The native teardown runs on the rayon pool when background teardown is enabled, the
    /// session is rejected with `Released` from this point on either way.
    pub fn release(&mut self) {
        let Some(native) = self.native.take() else {
            return;
        };

        self.gradients = None;

        if self.options.background_teardown {
            debug!(output = self.spec.output_node(); "dispatching native teardown");
            rayon::spawn(move || drop(native));
        } else {
            debug!(output = self.spec.output_node(); "tearing down native graph");
            drop(native);
        }
    }
}

impl Drop for ExecutionSession {
    fn drop(&mut self) {
        self.release();
    }
}

fn next_output(outputs: &mut impl Iterator<Item = NativeTensor>, node: &str) -> Result<NativeTensor> {
    outputs
        .next()
        .ok_or_else(|| AdapterErr::Engine(EngineErr::NodeNotFound(node.to_string())))
}

/// Rewrites every weight placeholder into a constant holding the weight's current value.
fn freeze_weights(
    engine: &dyn Engine,
    spec: &dyn GraphSpec,
    codec: &TensorCodec,
    graph_def: &[u8],
) -> Result<Vec<u8>> {
    let handles = spec
        .weights()
        .iter()
        .map(|(name, weight)| {
            let tensor = codec.externalize(&weight.read(), spec.precision(name))?;
            Ok((name.as_str(), tensor))
        })
        .collect::<Result<Vec<_>>>()?;

    let constants: Vec<(&str, &NativeTensor)> = handles
        .iter()
        .map(|(name, tensor)| (*name, &**tensor))
        .collect();

    engine.freeze(graph_def, &constants).map_err(AdapterErr::import)
}

/// Adds the delta placeholder and the gradients of the output with respect to every input and
/// weight, in that order.
fn build_gradients(graph: &mut dyn NativeGraph, spec: &dyn GraphSpec) -> Result<Gradients> {
    let output = spec.output_node();
    let delta = format!("{output}_delta");

    let seed = graph
        .add_placeholder(&delta, spec.precision(&delta))
        .map_err(AdapterErr::wiring)?;

    let xs: Vec<_> = spec
        .input_nodes()
        .iter()
        .chain(spec.weights().keys())
        .map(|name| OutputRef::new(name.as_str()))
        .collect();

    let outputs = graph
        .add_gradients(&OutputRef::new(output), &xs, &seed)
        .map_err(AdapterErr::wiring)?;

    debug!(output = output, gradients = outputs.len(); "built gradient subgraph");

    Ok(Gradients { delta, outputs })
}

use engine::Feed;

use crate::{
    DeltaAccumulator, DeltaSet, DenseTensor, Result, TensorBatch, codec::NativeTensorHandle,
    codec::TensorCodec,
};

/// The tensors fed to one forward run, kept alive for the paired backward run.
#[derive(Debug, Default)]
pub struct FeedSet {
    feeds: Vec<(String, NativeTensorHandle)>,
}

impl FeedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `tensor` to the node `node`.
    pub fn push(&mut self, node: impl Into<String>, tensor: NativeTensorHandle) {
        self.feeds.push((node.into(), tensor));
    }

    /// Borrows every binding as engine feeds.
    pub fn feeds(&self) -> Vec<Feed<'_>> {
        self.feeds
            .iter()
            .map(|(node, tensor)| Feed::new(node, tensor))
            .collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.feeds.iter().map(|(node, _)| node.as_str())
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }
}

/// The result of a forward run.
///
/// Holds every native tensor of the run until the pass is dropped or handed to `backward`.
#[derive(Debug)]
pub struct ForwardPass {
    pub(super) output: TensorBatch,
    pub(super) native_output: NativeTensorHandle,
    pub(super) feeds: FeedSet,
}

impl ForwardPass {
    pub fn output(&self) -> &TensorBatch {
        &self.output
    }

    /// Moves the output batch out, leaving the native tensors in place.
    pub fn take_output(&mut self) -> TensorBatch {
        std::mem::take(&mut self.output)
    }

    /// Returns the shape of the native output, batch dimension included.
    pub fn output_shape(&self) -> &[usize] {
        self.native_output.shape()
    }

    pub fn feeds(&self) -> &FeedSet {
        &self.feeds
    }
}

/// The native gradients of a backward run: one per input, then one per weight.
#[derive(Debug)]
pub struct GradientFetch {
    pub(super) inputs: Vec<NativeTensorHandle>,
    pub(super) weights: Vec<(String, NativeTensorHandle)>,
}

impl GradientFetch {
    pub fn inputs(&self) -> &[NativeTensorHandle] {
        &self.inputs
    }

    pub fn weights(&self) -> &[(String, NativeTensorHandle)] {
        &self.weights
    }

    /// Splits every input gradient into a batch of per-example gradients.
    pub fn input_gradients(&self, codec: &TensorCodec) -> Result<Vec<TensorBatch>> {
        self.inputs
            .iter()
            .map(|grad| codec.internalize_batch(grad))
            .collect()
    }

    /// Copies every weight gradient into a host tensor.
    pub fn weight_gradients(&self, codec: &TensorCodec) -> Result<Vec<(String, DenseTensor)>> {
        self.weights
            .iter()
            .map(|(name, grad)| Ok((name.clone(), codec.internalize(grad)?)))
            .collect()
    }

    /// Adds every weight gradient into its entry of `deltas`.
    pub fn accumulate(
        &self,
        codec: &TensorCodec,
        accumulator: &DeltaAccumulator,
        deltas: &DeltaSet,
    ) -> Result<()> {
        for (name, grad) in self.weight_gradients(codec)? {
            accumulator.accumulate(deltas, &name, grad.data())?;
        }

        Ok(())
    }

    /// Gives up the input gradients, keeping the native weight gradients.
    pub fn into_weights(self) -> Vec<(String, NativeTensorHandle)> {
        self.weights
    }
}

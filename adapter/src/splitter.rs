//! Host-side batch splitting for graphs that only accept one example per run.

use log::trace;

use crate::{
    AdapterErr, DeltaAccumulator, DeltaSet, DenseTensor, ExecutionSession, ForwardPass,
    GradientFetch, Result, TensorBatch, codec::NativeTensorHandle, codec::TensorCodec,
};

/// Drives an `ExecutionSession` one example at a time when its graph is single-batch.
///
/// Batches of graphs that accept whole batches go through in one run.
pub struct BatchSplitter<'a> {
    session: &'a mut ExecutionSession,
}

/// The forward passes of a possibly split batch, in example order.
#[derive(Debug)]
pub struct SplitPass {
    examples: usize,
    output: TensorBatch,
    passes: Vec<ForwardPass>,
}

impl SplitPass {
    pub fn output(&self) -> &TensorBatch {
        &self.output
    }

    pub fn take_output(&mut self) -> TensorBatch {
        std::mem::take(&mut self.output)
    }

    pub fn len(&self) -> usize {
        self.examples
    }

    pub fn is_empty(&self) -> bool {
        self.examples == 0
    }

    /// Returns how many runs the batch was split into.
    pub fn runs(&self) -> usize {
        self.passes.len()
    }
}

/// The gradient fetches of every run of a split batch, in example order.
#[derive(Debug)]
pub struct SplitGradients {
    fetches: Vec<GradientFetch>,
}

impl SplitGradients {
    pub fn fetches(&self) -> &[GradientFetch] {
        &self.fetches
    }

    /// Joins the per-run input gradients back into one batch per input.
    pub fn input_gradients(&self, codec: &TensorCodec) -> Result<Vec<TensorBatch>> {
        let mut joined: Vec<TensorBatch> = Vec::new();

        for fetch in &self.fetches {
            let grads = fetch.input_gradients(codec)?;

            if joined.is_empty() {
                joined.resize_with(grads.len(), Vec::new);
            }

            for (batch, grad) in joined.iter_mut().zip(grads) {
                batch.extend(grad);
            }
        }

        Ok(joined)
    }

    /// Adds the weight gradients of every run into `deltas`, one run at a time.
    pub fn accumulate(
        &self,
        codec: &TensorCodec,
        accumulator: &DeltaAccumulator,
        deltas: &DeltaSet,
    ) -> Result<()> {
        self.fetches
            .iter()
            .try_for_each(|fetch| fetch.accumulate(codec, accumulator, deltas))
    }

    /// Gives up the input gradients, returning every run's native weight gradients.
    pub fn into_weights(self) -> Vec<(String, NativeTensorHandle)> {
        self.fetches
            .into_iter()
            .flat_map(GradientFetch::into_weights)
            .collect()
    }
}

impl<'a> BatchSplitter<'a> {
    pub fn new(session: &'a mut ExecutionSession) -> Self {
        Self { session }
    }

    /// Runs the forward pass of `inputs`, one run per example if the graph is single-batch.
    ///
    /// # Arguments
    /// * `inputs` - One batch per input node, all holding the same amount of examples.
    ///
    /// # Returns
    /// The joined output batch and the passes it came from. Fails as a whole if any run fails.
    pub fn forward(&mut self, inputs: &[&[DenseTensor]]) -> Result<SplitPass> {
        let examples = batch_len(inputs)?;

        if !self.splits(examples) {
            let mut pass = self.session.forward(inputs)?;

            return Ok(SplitPass {
                examples,
                output: pass.take_output(),
                passes: vec![pass],
            });
        }

        trace!(examples = examples; "splitting batch into single example runs");

        let mut output = Vec::with_capacity(examples);
        let mut passes = Vec::with_capacity(examples);

        for i in 0..examples {
            let example: Vec<&[DenseTensor]> = inputs.iter().map(|batch| &batch[i..=i]).collect();
            let mut pass = self.session.forward(&example)?;

            output.extend(pass.take_output());
            passes.push(pass);
        }

        Ok(SplitPass {
            examples,
            output,
            passes,
        })
    }

    /// Backpropagates `output_gradient` through every run of `pass`.
    ///
    /// Every run completes before any gradient is handed back, so a failure in one example leaves
    /// nothing half applied.
    pub fn backward(
        &mut self,
        pass: SplitPass,
        output_gradient: &[DenseTensor],
    ) -> Result<SplitGradients> {
        let SplitPass {
            examples, passes, ..
        } = pass;

        if output_gradient.len() != examples {
            return Err(AdapterErr::SizeMismatch {
                what: "output gradient batch",
                got: output_gradient.len(),
                expected: examples,
            });
        }

        let split = passes.len() > 1;
        let fetches = passes
            .into_iter()
            .enumerate()
            .map(|(i, pass)| {
                let grad = if split {
                    &output_gradient[i..=i]
                } else {
                    output_gradient
                };

                self.session.backward(pass, grad)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SplitGradients { fetches })
    }

    fn splits(&self, examples: usize) -> bool {
        examples > 1 && self.session.spec().is_single_batch()
    }
}

/// Returns the shared amount of examples of `inputs`.
fn batch_len(inputs: &[&[DenseTensor]]) -> Result<usize> {
    let examples = inputs.first().map_or(0, |batch| batch.len());

    if examples == 0 {
        return Err(AdapterErr::EmptyBatch);
    }

    if let Some(odd) = inputs.iter().find(|batch| batch.len() != examples) {
        return Err(AdapterErr::SizeMismatch {
            what: "input batch",
            got: odd.len(),
            expected: examples,
        });
    }

    Ok(examples)
}

//! Telemetry for the summary node of a layer graph.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use engine::NativeTensor;
use log::info;

use crate::{AdapterErr, Result};

/// The statistics a summary node reports: `[count, min, max, sum, sum_sq]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    pub tag: String,
    pub count: f64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub sum_sq: f64,
}

impl SummaryRecord {
    /// Decodes the tensor fetched from the summary node named `tag`.
    pub fn decode(tag: &str, tensor: &NativeTensor) -> Result<Self> {
        let values = tensor.data().to_f64();

        let [count, min, max, sum, sum_sq] = values[..] else {
            return Err(AdapterErr::SizeMismatch {
                what: "summary record",
                got: values.len(),
                expected: 5,
            });
        };

        Ok(Self {
            tag: tag.to_string(),
            count,
            min,
            max,
            sum,
            sum_sq,
        })
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0. {
            return 0.;
        }

        self.sum / self.count
    }
}

/// Receives the summary records of forward passes.
pub trait SummarySink: Send + Sync {
    fn record(&self, step: u64, record: &SummaryRecord);
}

/// A summary sink together with the training step it tags records with.
///
/// The step is set from outside, typically by the training loop before each step.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn SummarySink>,
    step: Arc<AtomicU64>,
}

impl Telemetry {
    /// Creates a new `Telemetry` starting at step zero.
    pub fn new(sink: Arc<dyn SummarySink>) -> Self {
        Self {
            sink,
            step: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_step(&self, step: u64) {
        self.step.store(step, Ordering::Release);
    }

    pub fn step(&self) -> u64 {
        self.step.load(Ordering::Acquire)
    }

    /// Forwards `record` to the sink, tagged with the current step.
    pub fn emit(&self, record: &SummaryRecord) {
        self.sink.record(self.step(), record);
    }
}

/// Writes summary records to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl SummarySink for LogSink {
    fn record(&self, step: u64, record: &SummaryRecord) {
        info!(
            step = step,
            tag = record.tag.as_str(),
            count = record.count,
            min = record.min,
            max = record.max,
            mean = record.mean();
            "layer summary"
        );
    }
}

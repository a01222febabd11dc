pub mod buffered;
pub mod codec;
pub mod config;
pub mod error;
pub mod host;
pub mod layer;
pub mod session;
pub mod spec;
pub mod splitter;
pub mod summary;

pub use buffered::BufferedAdapter;
pub use codec::{BufferPool, NativeTensorHandle, PoolErr, PoolStats, TensorCodec};
pub use config::{LayerConfig, PoolConfig};
pub use error::{AdapterErr, Result};
pub use host::{
    DeltaAccumulator, DeltaEntry, DeltaSet, DenseTensor, Evaluation, SharedTensor, TensorBatch,
    stable_id,
};
pub use layer::GraphLayer;
pub use session::{ExecutionSession, FeedSet, ForwardPass, GradientFetch, SessionOptions};
pub use spec::{GraphSpec, LayerGraph, LayerGraphBuilder, PrecisionPolicy, WeightMap};
pub use splitter::{BatchSplitter, SplitGradients, SplitPass};
pub use summary::{LogSink, SummaryRecord, SummarySink, Telemetry};

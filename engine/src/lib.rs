mod backend;
pub mod cpu;
mod dtype;
mod error;
mod graph;
mod tensor;

pub use backend::{Engine, Feed, NativeGraph, NativeRuntime, OutputRef};
pub use dtype::DType;
pub use error::{EngineErr, Result};
pub use graph::{GraphBuilder, GraphDef, NodeDef, Op, TensorProto};
pub use tensor::{NativeTensor, TensorData};

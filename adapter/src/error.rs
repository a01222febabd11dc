use std::{
    error::Error,
    fmt::{self, Display},
};

use engine::EngineErr;

use crate::codec::PoolErr;

/// The result type used in the entire adapter.
pub type Result<T> = std::result::Result<T, AdapterErr>;

/// The adapter's error type.
#[derive(Debug)]
pub enum AdapterErr {
    GraphImport(EngineErr),
    UnsupportedDType(String),
    ShapeMismatch {
        node: String,
        got: Vec<usize>,
        expected: Vec<i64>,
    },
    GradientWiring {
        node: String,
        cause: EngineErr,
    },
    Consistency {
        input: usize,
        held: usize,
    },
    EmptyBatch,
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    Pool(PoolErr),
    Released,
    Engine(EngineErr),
}

impl AdapterErr {
    /// Classifies an error raised while validating, freezing or importing a graph.
    pub(crate) fn import(err: EngineErr) -> Self {
        match err {
            EngineErr::UnsupportedDType(tag) => Self::UnsupportedDType(tag),
            other => Self::GraphImport(other),
        }
    }

    /// Classifies an error raised by a native run.
    pub(crate) fn run(err: EngineErr) -> Self {
        match err {
            EngineErr::ShapeMismatch {
                node,
                got,
                expected,
            } => Self::ShapeMismatch {
                node,
                got,
                expected,
            },
            EngineErr::UnsupportedDType(tag) => Self::UnsupportedDType(tag),
            other => Self::Engine(other),
        }
    }

    /// Classifies an error raised while synthesizing the gradient graph.
    pub(crate) fn wiring(err: EngineErr) -> Self {
        let node = match &err {
            EngineErr::NodeNotFound(node) | EngineErr::DuplicateNode(node) => node.clone(),
            EngineErr::NoGradient { node, .. } => node.clone(),
            _ => return Self::Engine(err),
        };

        Self::GradientWiring { node, cause: err }
    }

    /// Builds a shape mismatch between two fully known shapes.
    pub(crate) fn shape(node: impl Into<String>, got: &[usize], expected: &[usize]) -> Self {
        Self::ShapeMismatch {
            node: node.into(),
            got: got.to_vec(),
            expected: expected.iter().map(|&d| d as i64).collect(),
        }
    }
}

impl Display for AdapterErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterErr::GraphImport(e) => write!(f, "failed to import graph: {e}"),
            AdapterErr::UnsupportedDType(tag) => {
                write!(f, "graph declares unsupported numeric type `{tag}`")
            }
            AdapterErr::ShapeMismatch {
                node,
                got,
                expected,
            } => write!(
                f,
                "tensor fed to `{node}` has shape {got:?}, expected {expected:?}"
            ),
            AdapterErr::GradientWiring { node, cause } => {
                write!(f, "can't wire the gradient graph at `{node}`: {cause}")
            }
            AdapterErr::Consistency { input, held } => write!(
                f,
                "backward callback of input {input} kept {held} extra references to its gradient"
            ),
            AdapterErr::EmptyBatch => f.write_str("a batch must hold at least one example"),
            AdapterErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "size mismatch in {what}: got {got}, expected {expected}"),
            AdapterErr::Pool(e) => write!(f, "buffer pool misuse: {e}"),
            AdapterErr::Released => f.write_str("the session was already released"),
            AdapterErr::Engine(e) => write!(f, "engine failure: {e}"),
        }
    }
}

impl Error for AdapterErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AdapterErr::GraphImport(e) | AdapterErr::Engine(e) => Some(e),
            AdapterErr::GradientWiring { cause, .. } => Some(cause),
            AdapterErr::Pool(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PoolErr> for AdapterErr {
    fn from(value: PoolErr) -> Self {
        Self::Pool(value)
    }
}

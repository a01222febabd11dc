use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used across the engine.
pub type Result<T> = std::result::Result<T, EngineErr>;

/// The engine's error type.
#[derive(Debug)]
pub enum EngineErr {
    Parse(serde_json::Error),
    UnsupportedDType(String),
    NodeNotFound(String),
    DuplicateNode(String),
    InvalidGraph(String),
    ShapeMismatch {
        node: String,
        got: Vec<usize>,
        expected: Vec<i64>,
    },
    DTypeMismatch {
        node: String,
        got: &'static str,
        expected: &'static str,
    },
    MissingFeed(String),
    NoGradient {
        node: String,
        op: &'static str,
    },
}

impl Display for EngineErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineErr::Parse(e) => write!(f, "malformed graph definition: {e}"),
            EngineErr::UnsupportedDType(tag) => {
                write!(f, "unsupported numeric type `{tag}`, expected f32 or f64")
            }
            EngineErr::NodeNotFound(name) => write!(f, "node `{name}` doesn't exist in the graph"),
            EngineErr::DuplicateNode(name) => write!(f, "node `{name}` is declared twice"),
            EngineErr::InvalidGraph(detail) => write!(f, "invalid graph: {detail}"),
            EngineErr::ShapeMismatch {
                node,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch at node `{node}`: got {got:?}, expected {expected:?}"
            ),
            EngineErr::DTypeMismatch {
                node,
                got,
                expected,
            } => write!(
                f,
                "dtype mismatch at node `{node}`: got {got}, expected {expected}"
            ),
            EngineErr::MissingFeed(name) => {
                write!(f, "placeholder `{name}` must be fed to run this fetch")
            }
            EngineErr::NoGradient { node, op } => {
                write!(f, "node `{node}` ({op}) has no registered gradient")
            }
        }
    }
}

impl Error for EngineErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineErr::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EngineErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

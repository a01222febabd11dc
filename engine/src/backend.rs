use crate::{DType, NativeTensor, Result};

/// Names the output of a node.
///
/// Every node produces exactly one tensor, so the node's name is enough to address it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputRef(String);

impl OutputRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OutputRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A tensor bound to a node for the duration of one `NativeRuntime::run`.
#[derive(Debug, Clone, Copy)]
pub struct Feed<'a> {
    pub node: &'a str,
    pub tensor: &'a NativeTensor,
}

impl<'a> Feed<'a> {
    pub fn new(node: &'a str, tensor: &'a NativeTensor) -> Self {
        Self { node, tensor }
    }
}

/// A dataflow graph engine.
///
/// Graph definitions are opaque bytes to every caller, only the engine knows how to read them.
pub trait Engine: Send + Sync {
    /// Checks that `graph_def` is a well formed graph this engine can import.
    fn validate(&self, graph_def: &[u8]) -> Result<()>;

    /// Rewrites the named placeholders of `graph_def` into constant nodes.
    ///
    /// # Arguments
    /// * `graph_def` - The serialized graph.
    /// * `constants` - The placeholder names and the values to bake into them.
    ///
    /// # Returns
    /// The rewritten serialized graph.
    fn freeze(&self, graph_def: &[u8], constants: &[(&str, &NativeTensor)]) -> Result<Vec<u8>>;

    /// Imports a serialized graph, returning an owned native handle to it.
    fn import(&self, graph_def: &[u8]) -> Result<Box<dyn NativeGraph>>;
}

/// An imported graph. Dropping the handle destroys the native graph.
pub trait NativeGraph: Send {
    /// Appends a new rank-agnostic placeholder to the graph.
    fn add_placeholder(&mut self, name: &str, dtype: DType) -> Result<OutputRef>;

    /// Appends the symbolic gradient of `y` with respect to each of `xs`, seeded by `dy`.
    ///
    /// # Returns
    /// One output per element of `xs`, in the same order.
    fn add_gradients(
        &mut self,
        y: &OutputRef,
        xs: &[OutputRef],
        dy: &OutputRef,
    ) -> Result<Vec<OutputRef>>;

    /// Opens a runtime over this graph. The runtime observes nodes added after it was opened.
    fn runtime(&self) -> Result<Box<dyn NativeRuntime>>;
}

/// An execution context over an imported graph. Dropping it destroys the native runtime.
pub trait NativeRuntime: Send {
    /// Evaluates `fetches` given `feeds`, blocking until the run completes.
    fn run(&mut self, feeds: &[Feed<'_>], fetches: &[OutputRef]) -> Result<Vec<NativeTensor>>;
}

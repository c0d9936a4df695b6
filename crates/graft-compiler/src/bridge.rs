//! Seam between the compile pipeline and accelerator backends

use graft_core::{
    BuildError, CompilationSettings, ConcreteTarget, DlaMemoryPools, ExecutionError, Graph,
    Precision, TensorSpec,
};
use graft_partition::{CapabilityQuery, CapabilitySet};
use serde::{Deserialize, Serialize};

/// Every knob one accelerator build receives, resolved from the call's settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Engine name, same as the partition it replaces.
    pub name: String,
    pub precision: Precision,
    pub target: ConcreteTarget,
    pub workspace_size: u64,
    pub optimization_level: Option<u8>,
    pub max_internal_streams: Option<u32>,
    pub version_compatible: bool,
    pub truncate_wide_numeric_types: bool,
    pub debug: bool,
    pub disable_tf32: bool,
    pub sparse_weights: bool,
    /// Present only for secondary-core targets.
    pub dla_memory: Option<DlaMemoryPools>,
}

impl BuildConfig {
    pub fn new(name: impl Into<String>, settings: &CompilationSettings) -> Self {
        BuildConfig {
            name: name.into(),
            precision: settings.precision(),
            target: settings.target(),
            workspace_size: settings.workspace_size(),
            optimization_level: settings.optimization_level(),
            max_internal_streams: settings.max_internal_streams(),
            version_compatible: settings.version_compatible(),
            truncate_wide_numeric_types: settings.truncate_wide_numeric_types(),
            debug: settings.debug(),
            disable_tf32: settings.disable_tf32(),
            sparse_weights: settings.sparse_weights(),
            dla_memory: settings.dla_memory(),
        }
    }
}

/// Opaque executable produced by an accelerator, with its I/O signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineArtifact {
    pub bytes: Vec<u8>,
    pub input_specs: Vec<TensorSpec>,
    pub output_specs: Vec<TensorSpec>,
}

/// Accelerator compiler backend.
///
/// Builds are blocking and may run concurrently for independent subgraphs.
pub trait AcceleratorCompiler: CapabilityQuery {
    fn name(&self) -> &str;

    /// Operators this backend can compile at all.
    fn capabilities(&self) -> &CapabilitySet;

    /// Compile a standalone subgraph whose inputs and outputs are the engine's I/O.
    fn build(&self, graph: &Graph, config: &BuildConfig) -> Result<EngineArtifact, BuildError>;
}

/// Shape queries of an accelerator, as seen by the support oracle.
pub struct AcceleratorQuery<'a>(pub &'a dyn AcceleratorCompiler);

impl CapabilityQuery for AcceleratorQuery<'_> {
    fn supports(&self, op: &str, signature: &[TensorSpec]) -> bool {
        self.0.supports(op, signature)
    }
}

/// Runs built engines at execution time.
pub trait EngineRuntime<V> {
    fn run_engine(&self, artifact: &EngineArtifact, inputs: &[V]) -> Result<Vec<V>, ExecutionError>;
}

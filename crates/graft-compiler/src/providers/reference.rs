//! Reference accelerator: a table-driven backend whose engines re-run the subgraph on the host

use std::collections::BTreeSet;

use graft_core::{
    BuildError, CompileError, DType, ExecutionError, Graph, GraphDef, NodeExecutor, TensorSpec,
    ValueId,
};
use graft_partition::{CapabilityQuery, CapabilitySet};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bridge::{AcceleratorCompiler, BuildConfig, EngineArtifact, EngineRuntime};

const BUILTIN_TABLE: &str = r#"
ops = [
    "aten::add",
    "aten::sub",
    "aten::mul",
    "aten::neg",
    "aten::relu",
    "aten::matmul",
    "aten::linear",
    "aten::permute",
    "graft::permute_matmul",
    "graft::permute_linear",
]
dtypes = ["f16", "bf16", "f32", "i8", "i32", "bool"]
reject = []
"#;

/// Capability table loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapabilityTable {
    /// Operators the backend accepts.
    pub ops: BTreeSet<String>,
    /// Element types the backend accepts; empty means all of them.
    pub dtypes: BTreeSet<DType>,
    /// Operators that pass support analysis but fail at build time.
    pub reject: BTreeSet<String>,
}

impl CapabilityTable {
    pub fn from_toml_str(text: &str) -> Result<Self, CompileError> {
        toml::from_str(text)
            .map_err(|e| CompileError::InvalidSettings(format!("capability table: {e}")))
    }

    fn accepts(&self, dtype: DType) -> bool {
        self.dtypes.is_empty() || self.dtypes.contains(&dtype)
    }
}

/// Payload of a reference engine.
#[derive(Debug, Serialize, Deserialize)]
struct EngineBlob {
    config: BuildConfig,
    graph: GraphDef,
}

pub struct ReferenceAccelerator {
    table: CapabilityTable,
    capabilities: CapabilitySet,
}

impl ReferenceAccelerator {
    pub fn new(table: CapabilityTable) -> Self {
        let capabilities = CapabilitySet::new(table.ops.iter().cloned());
        ReferenceAccelerator {
            table,
            capabilities,
        }
    }

    /// Backend with the built-in operator table.
    pub fn builtin() -> Result<Self, CompileError> {
        Ok(Self::new(CapabilityTable::from_toml_str(BUILTIN_TABLE)?))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, CompileError> {
        Ok(Self::new(CapabilityTable::from_toml_str(text)?))
    }
}

impl CapabilityQuery for ReferenceAccelerator {
    // 64-bit inputs count as supported when their narrowed type is; the build decides.
    fn supports(&self, _op: &str, signature: &[TensorSpec]) -> bool {
        signature
            .iter()
            .all(|spec| self.table.accepts(spec.dtype) || self.table.accepts(spec.dtype.narrowed()))
    }
}

impl AcceleratorCompiler for ReferenceAccelerator {
    fn name(&self) -> &str {
        "reference"
    }

    fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    fn build(&self, graph: &Graph, config: &BuildConfig) -> Result<EngineArtifact, BuildError> {
        if let Some(node) = graph.nodes().iter().find(|n| self.table.reject.contains(&n.op)) {
            return Err(BuildError::new(format!(
                "no implementation for {} on {}",
                node.op, config.target
            )));
        }

        let wide: Vec<_> = graph
            .values()
            .iter()
            .filter(|(_, spec)| spec.dtype.is_wide() && !self.table.accepts(spec.dtype))
            .collect();
        if let Some((value, spec)) = wide.first() {
            if !config.truncate_wide_numeric_types {
                return Err(BuildError::new(format!(
                    "value {value} has type {}, which needs truncate_wide_numeric_types",
                    spec.dtype
                )));
            }
            debug!(
                engine = %config.name,
                values = wide.len(),
                "Truncating wide numeric values"
            );
        }

        let specs = |ids: &[ValueId]| -> Vec<TensorSpec> {
            ids.iter().filter_map(|v| graph.spec(*v).cloned()).collect()
        };
        let input_specs = specs(graph.inputs());
        let output_specs = specs(graph.outputs());

        let blob = EngineBlob {
            config: config.clone(),
            graph: GraphDef::from(graph.clone()),
        };
        let bytes = bincode::serialize(&blob)
            .map_err(|e| BuildError::new(format!("failed to encode engine: {e}")))?;

        Ok(EngineArtifact {
            bytes,
            input_specs,
            output_specs,
        })
    }
}

/// Runs reference engines by decoding their subgraph and evaluating it on `executor`.
pub struct ReferenceRuntime<E> {
    executor: E,
}

impl<E> ReferenceRuntime<E> {
    pub fn new(executor: E) -> Self {
        ReferenceRuntime { executor }
    }
}

impl<V: Clone, E: NodeExecutor<V>> EngineRuntime<V> for ReferenceRuntime<E> {
    fn run_engine(&self, artifact: &EngineArtifact, inputs: &[V]) -> Result<Vec<V>, ExecutionError> {
        let blob: EngineBlob = bincode::deserialize(&artifact.bytes).map_err(engine_error)?;
        let graph = Graph::try_from(blob.graph).map_err(engine_error)?;
        graph.evaluate(inputs, &self.executor)
    }
}

fn engine_error(err: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::Engine {
        unit: "reference".to_string(),
        reason: format!("corrupt engine artifact: {err}"),
    }
}

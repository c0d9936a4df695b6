//! Error taxonomy shared across the workspace

use thiserror::Error;

use crate::model::{NodeId, ValueId};
use crate::precision::Precision;

/// Structural problems in a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node {node} reads {value}, which is not defined before it")]
    UndefinedValue { node: NodeId, value: ValueId },
    #[error("value {0} is defined more than once")]
    DuplicateValue(ValueId),
    #[error("value {0} has no tensor spec")]
    MissingSpec(ValueId),
    #[error("graph output {0} is never produced")]
    UndefinedOutput(ValueId),
    #[error("node id {0} appears more than once")]
    DuplicateNode(NodeId),
    #[error("node position {0} is out of range")]
    NodeOutOfRange(usize),
    #[error("step {step} reads {value}, which no earlier step binds")]
    UnboundStepInput { step: String, value: ValueId },
}

/// Failure reported by an accelerator compiler for one subgraph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct BuildError {
    pub reason: String,
}

impl BuildError {
    pub fn new(reason: impl Into<String>) -> Self {
        BuildError {
            reason: reason.into(),
        }
    }
}

/// Fatal errors of a compile call. Any of these aborts the call with no partial output.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("invalid device spec: {0}")]
    InvalidDeviceSpec(String),

    #[error("precision set {0:?} has no supported member (expected half or full)")]
    UnsupportedPrecision(Vec<Precision>),

    #[error(
        "partition {partition} has {size} node(s), below min_block_size {min_block_size}, \
         and cannot be merged under require_full_compilation"
    )]
    PartitionSize {
        partition: String,
        size: usize,
        min_block_size: usize,
    },

    #[error("accelerator failed to build partition {partition}: {source}")]
    Compilation {
        partition: String,
        #[source]
        source: BuildError,
    },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Failures while running a graph or hybrid graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("expected {expected} graph input(s), got {actual}")]
    InputArity { expected: usize, actual: usize },
    #[error("{step} produced {actual} value(s), expected {expected}")]
    OutputArity {
        step: String,
        expected: usize,
        actual: usize,
    },
    #[error("value {0} is not available")]
    MissingValue(ValueId),
    #[error("host execution of node {node} failed: {reason}")]
    Host { node: NodeId, reason: String },
    #[error("engine {unit} failed: {reason}")]
    Engine { unit: String, reason: String },
}

//! Graft Core — dataflow graph model, device resolution, settings and errors

pub mod model;
pub mod graph;
pub mod device;
pub mod precision;
pub mod settings;
pub mod error;


#[cfg(any(test, feature = "testing"))]
pub mod test_utils;

pub use model::{DType, Node, NodeId, TensorSpec, ValueId};
pub use graph::{Graph, GraphBuilder, GraphDef, NodeExecutor, ValueEnv};
pub use device::{ConcreteTarget, DeviceKind, DeviceSpec, UNSET_ID};
pub use precision::{DEFAULT_PRECISION, Precision, resolve_precision};
pub use settings::{CompilationSettings, CompileOptions, DlaMemoryPools, MIN_BLOCK_SIZE};
pub use error::{BuildError, CompileError, ExecutionError, GraphError};

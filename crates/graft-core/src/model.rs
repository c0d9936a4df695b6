//! Core data structures for the dataflow graph

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a value flowing between nodes. Produced exactly once.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Stable identifier for a node, independent of its position.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Element type of a tensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    // ── Floating point ──────────────────────────────────────
    F16,
    BF16,
    F32,
    F64,

    // ── Integer / boolean ───────────────────────────────────
    I8,
    I32,
    I64,
    Bool,
}

impl DType {
    /// 64-bit types that accelerators usually narrow (long and double).
    pub const fn is_wide(self) -> bool {
        matches!(self, DType::F64 | DType::I64)
    }

    /// The 32-bit type a wide value is truncated to.
    pub const fn narrowed(self) -> DType {
        match self {
            DType::F64 => DType::F32,
            DType::I64 => DType::I32,
            other => other,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I8 => "i8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::Bool => "bool",
        };
        f.write_str(s)
    }
}

/// Static type of a value: element type plus concrete shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        TensorSpec {
            dtype,
            shape: shape.into(),
        }
    }

    pub fn f32(shape: impl Into<Vec<usize>>) -> Self {
        Self::new(DType::F32, shape)
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.shape.iter().map(ToString::to_string).collect();
        write!(f, "{}[{}]", self.dtype, dims.join(", "))
    }
}

/// One operation in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Node {
    pub id: NodeId,
    /// Operator identity, e.g. `aten::relu`.
    pub op: String,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    /// Dotted path of the owning module, e.g. `encoder.block1.attn`. Empty at top level.
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl Node {
    /// Whether this node lives in `module` or one of its submodules.
    pub fn in_module(&self, module: &str) -> bool {
        if module.is_empty() {
            return false;
        }
        match self.module.strip_prefix(module) {
            Some(rest) => rest.is_empty() || rest.starts_with('.'),
            None => false,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outs: Vec<String> = self.outputs.iter().map(ToString::to_string).collect();
        let ins: Vec<String> = self.inputs.iter().map(ToString::to_string).collect();
        write!(f, "{} = {}({})", outs.join(", "), self.op, ins.join(", "))
    }
}

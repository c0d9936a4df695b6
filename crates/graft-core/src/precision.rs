//! Engine precision and its resolution from an enabled-precision set

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CompileError;

/// Precision an accelerator engine may be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[serde(alias = "f16", alias = "fp16", alias = "float16")]
    Half,
    #[serde(alias = "f32", alias = "fp32", alias = "float", alias = "float32")]
    Full,
    #[serde(alias = "bf16")]
    BFloat16,
    #[serde(alias = "i8")]
    Int8,
    /// Accepted in the enabled set but never chosen for an engine.
    #[serde(alias = "f64", alias = "fp64", alias = "float64")]
    Double,
}

/// Precision used when no precision is requested at all.
pub const DEFAULT_PRECISION: Precision = Precision::Full;

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Precision::Half => "half",
            Precision::Full => "full",
            Precision::BFloat16 => "bfloat16",
            Precision::Int8 => "int8",
            Precision::Double => "double",
        };
        f.write_str(s)
    }
}

/// Pick the engine precision from the enabled set.
///
/// Half wins over full. An empty set falls back to [`DEFAULT_PRECISION`]; a set with
/// neither half nor full is rejected.
pub fn resolve_precision(enabled: &BTreeSet<Precision>) -> Result<Precision, CompileError> {
    if enabled.contains(&Precision::Half) {
        Ok(Precision::Half)
    } else if enabled.contains(&Precision::Full) {
        Ok(Precision::Full)
    } else if enabled.is_empty() {
        info!(
            precision = %DEFAULT_PRECISION,
            "No precision specified, defaulting to {}", DEFAULT_PRECISION
        );
        Ok(DEFAULT_PRECISION)
    } else {
        Err(CompileError::UnsupportedPrecision(
            enabled.iter().copied().collect(),
        ))
    }
}

//! Compile options and the resolved, immutable settings built from them

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::device::{ConcreteTarget, DeviceSpec};
use crate::error::CompileError;
use crate::precision::{Precision, resolve_precision};

/// Default minimum number of nodes an accelerated region must contain.
pub const MIN_BLOCK_SIZE: usize = 5;

/// Highest optimization level accelerators accept.
pub const MAX_OPTIMIZATION_LEVEL: u8 = 5;

/// Memory pool sizes for secondary-core targets, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlaMemoryPools {
    pub sram: u64,
    pub local_dram: u64,
    pub global_dram: u64,
}

/// Options as supplied by the caller. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompileOptions {
    pub enabled_precisions: BTreeSet<Precision>,
    pub debug: bool,
    pub workspace_size: u64,
    pub min_block_size: usize,
    pub excluded_operators: BTreeSet<String>,
    pub excluded_modules: BTreeSet<String>,
    pub pass_through_build_failures: bool,
    pub max_internal_streams: Option<u32>,
    pub version_compatible: bool,
    pub optimization_level: Option<u8>,
    pub truncate_wide_numeric_types: bool,
    pub require_full_compilation: bool,
    pub device: DeviceSpec,
    pub disable_tf32: bool,
    pub sparse_weights: bool,
    pub dla_sram_size: u64,
    pub dla_local_dram_size: u64,
    pub dla_global_dram_size: u64,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            enabled_precisions: BTreeSet::from([Precision::Full]),
            debug: false,
            workspace_size: 0,
            min_block_size: MIN_BLOCK_SIZE,
            excluded_operators: BTreeSet::new(),
            excluded_modules: BTreeSet::new(),
            pass_through_build_failures: false,
            max_internal_streams: None,
            version_compatible: false,
            optimization_level: None,
            truncate_wide_numeric_types: false,
            require_full_compilation: false,
            device: DeviceSpec::default(),
            disable_tf32: false,
            sparse_weights: false,
            dla_sram_size: 1 << 20,
            dla_local_dram_size: 1 << 30,
            dla_global_dram_size: 512 << 20,
        }
    }
}

impl CompileOptions {
    /// Parse options from a keyword bag.
    ///
    /// A bag of the form `{"options": {...}}` is unwrapped first.
    pub fn from_kwargs(kwargs: Value) -> Result<Self, CompileError> {
        let kwargs = match kwargs {
            Value::Object(mut map) if map.len() == 1 && map.contains_key("options") => {
                map.remove("options").unwrap_or(Value::Null)
            }
            other => other,
        };
        if kwargs.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(kwargs).map_err(|e| CompileError::InvalidSettings(e.to_string()))
    }

    /// Parse options from a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, CompileError> {
        toml::from_str(text).map_err(|e| CompileError::InvalidSettings(e.to_string()))
    }
}

/// Every build knob of one compile call, fully validated and resolved.
///
/// Built once per call and shared read-only with every subgraph compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompilationSettings {
    precision: Precision,
    options: CompileOptions,
    target: ConcreteTarget,
}

impl CompilationSettings {
    /// Validate the options, resolve precision and device.
    pub fn new(options: CompileOptions) -> Result<Self, CompileError> {
        if options.min_block_size == 0 {
            return Err(CompileError::InvalidSettings(
                "min_block_size must be at least 1".to_string(),
            ));
        }
        if let Some(level) = options.optimization_level {
            if level > MAX_OPTIMIZATION_LEVEL {
                return Err(CompileError::InvalidSettings(format!(
                    "optimization_level {level} is out of range 0..={MAX_OPTIMIZATION_LEVEL}"
                )));
            }
        }
        if options.max_internal_streams == Some(0) {
            return Err(CompileError::InvalidSettings(
                "max_internal_streams must be at least 1 when set".to_string(),
            ));
        }

        let precision = resolve_precision(&options.enabled_precisions)?;
        let target = options.device.resolve()?;
        let settings = CompilationSettings {
            precision,
            options,
            target,
        };
        debug!("Compiling with settings: {:#?}", settings);
        Ok(settings)
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn target(&self) -> ConcreteTarget {
        self.target
    }

    pub fn enabled_precisions(&self) -> &BTreeSet<Precision> {
        &self.options.enabled_precisions
    }

    pub fn debug(&self) -> bool {
        self.options.debug
    }

    pub fn workspace_size(&self) -> u64 {
        self.options.workspace_size
    }

    pub fn min_block_size(&self) -> usize {
        self.options.min_block_size
    }

    pub fn excluded_operators(&self) -> &BTreeSet<String> {
        &self.options.excluded_operators
    }

    pub fn excluded_modules(&self) -> &BTreeSet<String> {
        &self.options.excluded_modules
    }

    pub fn pass_through_build_failures(&self) -> bool {
        self.options.pass_through_build_failures
    }

    pub fn max_internal_streams(&self) -> Option<u32> {
        self.options.max_internal_streams
    }

    pub fn version_compatible(&self) -> bool {
        self.options.version_compatible
    }

    pub fn optimization_level(&self) -> Option<u8> {
        self.options.optimization_level
    }

    pub fn truncate_wide_numeric_types(&self) -> bool {
        self.options.truncate_wide_numeric_types
    }

    pub fn require_full_compilation(&self) -> bool {
        self.options.require_full_compilation
    }

    pub fn disable_tf32(&self) -> bool {
        self.options.disable_tf32
    }

    pub fn sparse_weights(&self) -> bool {
        self.options.sparse_weights
    }

    /// Pool sizes, only meaningful when the target is a secondary core.
    pub fn dla_memory(&self) -> Option<DlaMemoryPools> {
        self.target.is_secondary_core().then(|| DlaMemoryPools {
            sram: self.options.dla_sram_size,
            local_dram: self.options.dla_local_dram_size,
            global_dram: self.options.dla_global_dram_size,
        })
    }
}

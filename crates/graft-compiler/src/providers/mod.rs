//! Accelerator backends

pub mod reference;

use graft_core::CompileError;

use crate::bridge::AcceleratorCompiler;

/// Create a backend by name. `table` is an optional TOML capability table.
pub fn create_accelerator(
    name: &str,
    table: Option<&str>,
) -> Result<Box<dyn AcceleratorCompiler>, CompileError> {
    match name {
        "reference" => {
            let accelerator = match table {
                Some(text) => reference::ReferenceAccelerator::from_toml_str(text)?,
                None => reference::ReferenceAccelerator::builtin()?,
            };
            Ok(Box::new(accelerator))
        }
        other => Err(CompileError::InvalidSettings(format!(
            "unknown accelerator: {other}"
        ))),
    }
}

//! CLI command implementations

use anyhow::Context;
use graft_compiler::{AcceleratorCompiler, compile_graph, create_accelerator, partition_only};
use graft_core::{CompileOptions, DeviceSpec, Graph};
use graft_partition::render_plan;
use std::fs;
use std::path::Path;

/// Settings from a TOML file, or the defaults.
pub fn load_options(path: Option<&Path>) -> anyhow::Result<CompileOptions> {
    let Some(path) = path else {
        return Ok(CompileOptions::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings {}", path.display()))?;
    Ok(CompileOptions::from_toml_str(&text)?)
}

pub fn load_graph(path: &Path) -> anyhow::Result<Graph> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read graph {}", path.display()))?;
    let graph: Graph = serde_json::from_str(&text)
        .with_context(|| format!("Invalid graph {}", path.display()))?;
    tracing::debug!("Loaded {} node(s) from {}", graph.len(), path.display());
    Ok(graph)
}

fn load_accelerator(capabilities: Option<&Path>) -> anyhow::Result<Box<dyn AcceleratorCompiler>> {
    let table = capabilities
        .map(|path| {
            fs::read_to_string(path)
                .with_context(|| format!("Failed to read capability table {}", path.display()))
        })
        .transpose()?;
    Ok(create_accelerator("reference", table.as_deref())?)
}

pub fn plan(
    graph_path: &Path,
    options: CompileOptions,
    capabilities: Option<&Path>,
    json: bool,
) -> anyhow::Result<String> {
    let graph = load_graph(graph_path)?;
    let accelerator = load_accelerator(capabilities)?;
    let plan = partition_only(&graph, accelerator.as_ref(), options)?;

    if json {
        return Ok(serde_json::to_string_pretty(&plan.partitions)?);
    }
    Ok(format!(
        "{}\n\n{}",
        plan.preview,
        render_plan(&plan.partitions)
    ))
}

pub fn compile(
    graph_path: &Path,
    options: CompileOptions,
    capabilities: Option<&Path>,
    json: bool,
) -> anyhow::Result<String> {
    let graph = load_graph(graph_path)?;
    let accelerator = load_accelerator(capabilities)?;
    let compiled = compile_graph(&graph, accelerator.as_ref(), options)?;

    if json {
        return Ok(serde_json::to_string_pretty(&compiled.summary)?);
    }
    Ok(format!("{}\n\n{}", compiled.summary, compiled.graph))
}

pub fn device(spec: &str, allow_fallback: Option<bool>) -> anyhow::Result<String> {
    let target = DeviceSpec::symbolic(spec, allow_fallback)?.resolve()?;
    Ok(target.to_string())
}

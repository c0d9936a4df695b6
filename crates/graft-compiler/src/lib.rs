//! Graft Compiler — accelerator bridge, subgraph compilation and graph splicing

pub mod bridge;
pub mod subgraph;
pub mod splicer;
pub mod pipeline;
pub mod providers;

#[cfg(test)]
pub mod tests;

pub use bridge::{AcceleratorCompiler, AcceleratorQuery, BuildConfig, EngineArtifact, EngineRuntime};
pub use subgraph::{CompileOutcome, CompiledUnit, SubgraphCompiler};
pub use splicer::{HybridGraph, HybridStep};
pub use pipeline::{
    CompileSummary, CompiledGraph, PartitionOutcome, PartitionPlan, PartitionSummary,
    compile_graph, compile_plan, partition_only, plan_with,
};
pub use providers::create_accelerator;
pub use providers::reference::{CapabilityTable, ReferenceAccelerator, ReferenceRuntime};

//! End-to-end compile: settings, lowering, partitioning, compilation, splicing

use std::collections::BTreeMap;
use std::fmt;

use graft_core::{CompilationSettings, CompileError, CompileOptions, ConcreteTarget, Graph, Precision};
use graft_partition::{
    Exclusions, LoweringPipeline, LoweringReport, Partition, PartitionKind, PartitionPolicy,
    SupportOracle, SupportPreview, partition,
};
use serde::Serialize;
use tracing::info;

use crate::bridge::{AcceleratorCompiler, AcceleratorQuery};
use crate::splicer::HybridGraph;
use crate::subgraph::{CompileOutcome, CompiledUnit, SubgraphCompiler};

/// Partition plan of a graph, before any accelerator build.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    pub settings: CompilationSettings,
    /// Graph after lowering; partition node positions refer to it.
    pub graph: Graph,
    pub lowering: LoweringReport,
    pub preview: SupportPreview,
    pub partitions: Vec<Partition>,
}

/// What happened to one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PartitionOutcome {
    Compiled { engine_bytes: usize },
    Degraded { reason: String },
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionSummary {
    pub name: String,
    pub kind: PartitionKind,
    pub nodes: usize,
    #[serde(flatten)]
    pub outcome: PartitionOutcome,
}

/// Report of one compile call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileSummary {
    pub target: ConcreteTarget,
    pub precision: Precision,
    pub lowering: LoweringReport,
    pub partitions: Vec<PartitionSummary>,
}

impl CompileSummary {
    pub fn compiled(&self) -> usize {
        self.count(|o| matches!(o, PartitionOutcome::Compiled { .. }))
    }

    pub fn degraded(&self) -> usize {
        self.count(|o| matches!(o, PartitionOutcome::Degraded { .. }))
    }

    fn count(&self, f: impl Fn(&PartitionOutcome) -> bool) -> usize {
        self.partitions.iter().filter(|p| f(&p.outcome)).count()
    }
}

impl fmt::Display for CompileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "target: {}", self.target)?;
        writeln!(f, "precision: {}", self.precision)?;
        for pass in &self.lowering.passes {
            writeln!(f, "pass {}: {} rewrite(s)", pass.name, pass.rewrites)?;
        }
        let lines: Vec<String> = self
            .partitions
            .iter()
            .map(|p| {
                let status = match &p.outcome {
                    PartitionOutcome::Compiled { .. } => "compiled".to_string(),
                    PartitionOutcome::Degraded { reason } => format!("degraded: {reason}"),
                    PartitionOutcome::Fallback => "fallback".to_string(),
                };
                format!("{} ({} node(s)): {status}", p.name, p.nodes)
            })
            .collect();
        f.write_str(&lines.join("\n"))
    }
}

/// A hybrid graph plus the report of how it was built.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub graph: HybridGraph,
    pub summary: CompileSummary,
}

/// Build settings, lower and partition `graph` without compiling anything.
pub fn partition_only(
    graph: &Graph,
    accelerator: &dyn AcceleratorCompiler,
    options: CompileOptions,
) -> Result<PartitionPlan, CompileError> {
    let settings = CompilationSettings::new(options)?;
    plan_with(graph, accelerator, settings, &LoweringPipeline::default())
}

/// Partition with explicit settings and lowering passes.
pub fn plan_with(
    graph: &Graph,
    accelerator: &dyn AcceleratorCompiler,
    settings: CompilationSettings,
    lowering: &LoweringPipeline,
) -> Result<PartitionPlan, CompileError> {
    let (lowered, report) = lowering.run(graph)?;

    let exclusions = Exclusions::from_settings(&settings);
    let query = AcceleratorQuery(accelerator);
    let oracle = SupportOracle::new(accelerator.capabilities(), &query, &exclusions);
    let preview = oracle.preview(&lowered);
    let partitions = partition(&lowered, &oracle, PartitionPolicy::from_settings(&settings))?;

    Ok(PartitionPlan {
        settings,
        graph: lowered,
        lowering: report,
        preview,
        partitions,
    })
}

/// Compile `graph` for `accelerator`, returning a hybrid graph callable like the original.
pub fn compile_graph(
    graph: &Graph,
    accelerator: &dyn AcceleratorCompiler,
    options: CompileOptions,
) -> Result<CompiledGraph, CompileError> {
    let plan = partition_only(graph, accelerator, options)?;
    compile_plan(plan, accelerator)
}

/// Compile and splice a plan produced by [`partition_only`] or [`plan_with`].
pub fn compile_plan(
    plan: PartitionPlan,
    accelerator: &dyn AcceleratorCompiler,
) -> Result<CompiledGraph, CompileError> {
    let compiler = SubgraphCompiler::new(accelerator, &plan.settings);
    let outcomes: BTreeMap<usize, CompileOutcome> = compiler
        .compile_all(&plan.graph, &plan.partitions)?
        .into_iter()
        .collect();

    let replacements: BTreeMap<usize, CompiledUnit> = outcomes
        .iter()
        .filter_map(|(&index, outcome)| outcome.unit().map(|unit| (index, unit.clone())))
        .collect();
    let hybrid = HybridGraph::splice(&plan.graph, &plan.partitions, &replacements)?;

    let partitions = plan
        .partitions
        .iter()
        .map(|p| PartitionSummary {
            name: p.name(),
            kind: p.kind,
            nodes: p.len(),
            outcome: match outcomes.get(&p.index) {
                Some(CompileOutcome::Compiled(unit)) => PartitionOutcome::Compiled {
                    engine_bytes: unit.artifact.bytes.len(),
                },
                Some(CompileOutcome::Degraded { reason }) => PartitionOutcome::Degraded {
                    reason: reason.clone(),
                },
                None => PartitionOutcome::Fallback,
            },
        })
        .collect();
    let summary = CompileSummary {
        target: plan.settings.target(),
        precision: plan.settings.precision(),
        lowering: plan.lowering,
        partitions,
    };

    info!(
        engines = summary.compiled(),
        degraded = summary.degraded(),
        steps = hybrid.len(),
        "Compiled graph for {}",
        summary.target
    );
    Ok(CompiledGraph {
        graph: hybrid,
        summary,
    })
}

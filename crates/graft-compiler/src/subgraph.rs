//! Compiles eligible partitions into engine units

use std::sync::Arc;

use graft_core::{BuildError, CompilationSettings, CompileError, Graph, ValueId};
use graft_partition::Partition;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::bridge::{AcceleratorCompiler, BuildConfig, EngineArtifact};

/// A compiled partition, substitutable 1:1 for the nodes it replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledUnit {
    pub name: String,
    pub artifact: Arc<EngineArtifact>,
    /// Partition inputs, bound positionally to the engine's inputs.
    pub inputs: Vec<ValueId>,
    /// Slot `i` of the engine produces `outputs[i]`.
    pub outputs: Vec<ValueId>,
    /// Number of graph nodes the unit stands for.
    pub replaced: usize,
}

/// Result of compiling one eligible partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Compiled(CompiledUnit),
    /// Rejected by the accelerator; the partition stays on the fallback executor.
    Degraded { reason: String },
}

impl CompileOutcome {
    pub fn unit(&self) -> Option<&CompiledUnit> {
        match self {
            CompileOutcome::Compiled(unit) => Some(unit),
            CompileOutcome::Degraded { .. } => None,
        }
    }
}

/// Builds eligible partitions against one accelerator and one set of settings.
pub struct SubgraphCompiler<'a> {
    accelerator: &'a dyn AcceleratorCompiler,
    settings: &'a CompilationSettings,
}

impl<'a> SubgraphCompiler<'a> {
    pub fn new(accelerator: &'a dyn AcceleratorCompiler, settings: &'a CompilationSettings) -> Self {
        SubgraphCompiler {
            accelerator,
            settings,
        }
    }

    /// Compile one eligible partition.
    pub fn compile(&self, graph: &Graph, partition: &Partition) -> Result<CompileOutcome, CompileError> {
        let subgraph = graph.subgraph(&partition.nodes, &partition.inputs, &partition.outputs)?;
        let built = self.build(partition, &subgraph);
        self.settle(partition, built)
    }

    /// Compile every eligible partition in parallel.
    ///
    /// Returns `(partition index, outcome)` pairs in partition order. When several builds
    /// fail fatally, the earliest partition's error is returned.
    pub fn compile_all(
        &self,
        graph: &Graph,
        partitions: &[Partition],
    ) -> Result<Vec<(usize, CompileOutcome)>, CompileError> {
        let jobs = partitions
            .iter()
            .filter(|p| p.is_eligible())
            .map(|p| -> Result<_, CompileError> {
                Ok((p, graph.subgraph(&p.nodes, &p.inputs, &p.outputs)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            "Compiling {} eligible partition(s) with {}",
            jobs.len(),
            self.accelerator.name()
        );

        let built: Vec<_> = jobs
            .par_iter()
            .map(|(partition, subgraph)| self.build(partition, subgraph))
            .collect();

        jobs.iter()
            .zip(built)
            .map(|((partition, _), result)| {
                self.settle(partition, result)
                    .map(|outcome| (partition.index, outcome))
            })
            .collect()
    }

    fn build(&self, partition: &Partition, subgraph: &Graph) -> Result<CompiledUnit, BuildError> {
        let config = BuildConfig::new(partition.name(), self.settings);
        let artifact = self.accelerator.build(subgraph, &config)?;
        if artifact.input_specs.len() != partition.inputs.len()
            || artifact.output_specs.len() != partition.outputs.len()
        {
            return Err(BuildError::new(format!(
                "engine signature has {} input(s) and {} output(s), partition needs {} and {}",
                artifact.input_specs.len(),
                artifact.output_specs.len(),
                partition.inputs.len(),
                partition.outputs.len()
            )));
        }
        Ok(CompiledUnit {
            name: partition.name(),
            artifact: Arc::new(artifact),
            inputs: partition.inputs.clone(),
            outputs: partition.outputs.clone(),
            replaced: partition.len(),
        })
    }

    fn settle(
        &self,
        partition: &Partition,
        built: Result<CompiledUnit, BuildError>,
    ) -> Result<CompileOutcome, CompileError> {
        match built {
            Ok(unit) => {
                debug!(
                    partition = %unit.name,
                    bytes = unit.artifact.bytes.len(),
                    "Built engine"
                );
                Ok(CompileOutcome::Compiled(unit))
            }
            Err(source) if self.settings.pass_through_build_failures() => {
                Err(CompileError::Compilation {
                    partition: partition.name(),
                    source,
                })
            }
            Err(source) => {
                warn!(
                    partition = %partition.name(),
                    reason = %source,
                    "Accelerator rejected partition, running it on the fallback executor"
                );
                Ok(CompileOutcome::Degraded {
                    reason: source.reason,
                })
            }
        }
    }
}

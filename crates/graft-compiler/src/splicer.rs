//! Splices compiled units back into the graph, producing a runnable hybrid graph

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use graft_core::{ExecutionError, Graph, GraphError, Node, NodeExecutor, ValueEnv, ValueId};
use graft_partition::Partition;
use tracing::debug;

use crate::bridge::EngineRuntime;
use crate::subgraph::CompiledUnit;

/// One step of a hybrid graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HybridStep {
    /// A node left to the general-purpose executor.
    Host(Node),
    /// A compiled engine replacing a whole partition.
    Engine(CompiledUnit),
}

impl HybridStep {
    pub fn inputs(&self) -> &[ValueId] {
        match self {
            HybridStep::Host(node) => &node.inputs,
            HybridStep::Engine(unit) => &unit.inputs,
        }
    }

    pub fn outputs(&self) -> &[ValueId] {
        match self {
            HybridStep::Host(node) => &node.outputs,
            HybridStep::Engine(unit) => &unit.outputs,
        }
    }

    pub fn label(&self) -> String {
        match self {
            HybridStep::Host(node) => format!("node {} ({})", node.id, node.op),
            HybridStep::Engine(unit) => format!("engine {}", unit.name),
        }
    }
}

impl fmt::Display for HybridStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HybridStep::Host(node) => write!(f, "host   {node}"),
            HybridStep::Engine(unit) => write!(
                f,
                "engine {} = {}({}) [{} node(s)]",
                join(&unit.outputs),
                unit.name,
                join(&unit.inputs),
                unit.replaced
            ),
        }
    }
}

/// Graph whose steps are host nodes and compiled engines.
///
/// Callable exactly like the graph it was spliced from: same inputs, same outputs, same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridGraph {
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    steps: Vec<HybridStep>,
}

impl HybridGraph {
    /// Replace each partition that has a unit in `replacements` (keyed by partition index).
    ///
    /// Partitions without a unit keep their nodes as host steps.
    pub fn splice(
        graph: &Graph,
        partitions: &[Partition],
        replacements: &BTreeMap<usize, CompiledUnit>,
    ) -> Result<Self, GraphError> {
        let mut steps = Vec::with_capacity(graph.len());
        for partition in partitions {
            match replacements.get(&partition.index) {
                Some(unit) => steps.push(HybridStep::Engine(unit.clone())),
                None => {
                    for &position in &partition.nodes {
                        let node = graph
                            .node(position)
                            .ok_or(GraphError::NodeOutOfRange(position))?;
                        steps.push(HybridStep::Host(node.clone()));
                    }
                }
            }
        }

        let hybrid = HybridGraph {
            inputs: graph.inputs().to_vec(),
            outputs: graph.outputs().to_vec(),
            steps,
        };
        hybrid.validate()?;
        debug!(
            "Spliced {} engine(s) into {} step(s)",
            hybrid.engine_count(),
            hybrid.len()
        );
        Ok(hybrid)
    }

    /// Every step reads only bound values, no value is bound twice, and every output is bound.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut bound: HashSet<ValueId> = HashSet::new();
        for &value in &self.inputs {
            if !bound.insert(value) {
                return Err(GraphError::DuplicateValue(value));
            }
        }
        for step in &self.steps {
            if let Some(&value) = step.inputs().iter().find(|v| !bound.contains(*v)) {
                return Err(GraphError::UnboundStepInput {
                    step: step.label(),
                    value,
                });
            }
            for &value in step.outputs() {
                if !bound.insert(value) {
                    return Err(GraphError::DuplicateValue(value));
                }
            }
        }
        match self.outputs.iter().find(|v| !bound.contains(*v)) {
            Some(&value) => Err(GraphError::UndefinedOutput(value)),
            None => Ok(()),
        }
    }

    /// Run every step in order: host steps on `host`, engines on `engines`.
    pub fn execute<V: Clone>(
        &self,
        inputs: &[V],
        host: &dyn NodeExecutor<V>,
        engines: &dyn EngineRuntime<V>,
    ) -> Result<Vec<V>, ExecutionError> {
        let mut env = ValueEnv::bind(&self.inputs, inputs)?;
        for step in &self.steps {
            let args = env.gather(step.inputs())?;
            let results = match step {
                HybridStep::Host(node) => host.run_node(node, &args)?,
                HybridStep::Engine(unit) => engines
                    .run_engine(&unit.artifact, &args)
                    .map_err(|err| match err {
                        ExecutionError::Engine { reason, .. } => ExecutionError::Engine {
                            unit: unit.name.clone(),
                            reason,
                        },
                        other => other,
                    })?,
            };
            env.store(&step.label(), step.outputs(), results)?;
        }
        env.gather(&self.outputs)
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn steps(&self) -> &[HybridStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn engine_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, HybridStep::Engine(_)))
            .count()
    }
}

impl fmt::Display for HybridGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "inputs ({})", join(&self.inputs))?;
        for step in &self.steps {
            writeln!(f, "{step}")?;
        }
        write!(f, "outputs ({})", join(&self.outputs))
    }
}

fn join(values: &[ValueId]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

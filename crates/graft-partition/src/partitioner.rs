//! Splits a graph into eligible and fallback partitions

use std::collections::{HashMap, HashSet};
use std::fmt;

use graft_core::{CompilationSettings, CompileError, Graph, ValueId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Visitable};
use serde::Serialize;
use tracing::debug;

use crate::oracle::{SupportOracle, Verdict};

/// Where a partition is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    /// Handed to the accelerator compiler.
    Eligible,
    /// Left to the general-purpose executor.
    Fallback,
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKind::Eligible => f.write_str("eligible"),
            PartitionKind::Fallback => f.write_str("fallback"),
        }
    }
}

/// A run of nodes with one routing decision and an explicit boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub index: usize,
    pub kind: PartitionKind,
    /// Node positions in the source graph, ascending.
    pub nodes: Vec<usize>,
    /// Values read from outside, by first use.
    pub inputs: Vec<ValueId>,
    /// Values read outside or returned by the graph, by production order.
    pub outputs: Vec<ValueId>,
}

impl Partition {
    pub fn name(&self) -> String {
        match self.kind {
            PartitionKind::Eligible => format!("acc_{}", self.index),
            PartitionKind::Fallback => format!("host_{}", self.index),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_eligible(&self) -> bool {
        self.kind == PartitionKind::Eligible
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} nodes [{}] inputs ({}) outputs ({})",
            self.name(),
            self.kind,
            compress_ranges(&self.nodes),
            join(&self.inputs),
            join(&self.outputs),
        )
    }
}

/// Size policy applied after support analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPolicy {
    pub min_block_size: usize,
    pub require_full_compilation: bool,
}

impl PartitionPolicy {
    pub fn from_settings(settings: &CompilationSettings) -> Self {
        PartitionPolicy {
            min_block_size: settings.min_block_size(),
            require_full_compilation: settings.require_full_compilation(),
        }
    }
}

type DepGraph = DiGraph<usize, ValueId>;
type ReachSearch = Dfs<NodeIndex, <DepGraph as Visitable>::Map>;

#[derive(Debug, Clone)]
struct Run {
    kind: PartitionKind,
    nodes: Vec<usize>,
}

/// Partition `graph` in dependency order.
///
/// Fails with [`CompileError::PartitionSize`] only when `require_full_compilation` is set
/// and an undersized eligible run cannot legally join a neighbour.
pub fn partition(
    graph: &Graph,
    oracle: &SupportOracle<'_>,
    policy: PartitionPolicy,
) -> Result<Vec<Partition>, CompileError> {
    let verdicts = oracle.classify(graph);
    let mut runs = verdict_runs(&verdicts);

    if policy.require_full_compilation {
        runs = coalesce_fallback(runs);
        runs = merge_undersized(graph, runs, policy.min_block_size)?;
    } else {
        for run in runs.iter_mut() {
            if run.kind == PartitionKind::Eligible && run.nodes.len() < policy.min_block_size {
                debug!(
                    "Coercing {} node(s) at [{}] to fallback (min_block_size {})",
                    run.nodes.len(),
                    compress_ranges(&run.nodes),
                    policy.min_block_size
                );
                run.kind = PartitionKind::Fallback;
            }
        }
    }
    let runs = coalesce_fallback(runs);

    let partitions = with_boundaries(graph, runs);
    debug!(
        "Partitioned {} node(s) into {} partition(s)",
        graph.len(),
        partitions.len()
    );
    Ok(partitions)
}

/// Maximal runs of consecutive nodes sharing one verdict.
fn verdict_runs(verdicts: &[Verdict]) -> Vec<Run> {
    let mut runs: Vec<(Verdict, Run)> = Vec::new();
    for (position, &verdict) in verdicts.iter().enumerate() {
        match runs.last_mut() {
            Some((last, run)) if *last == verdict => run.nodes.push(position),
            _ => {
                let kind = if verdict.is_supported() {
                    PartitionKind::Eligible
                } else {
                    PartitionKind::Fallback
                };
                runs.push((
                    verdict,
                    Run {
                        kind,
                        nodes: vec![position],
                    },
                ));
            }
        }
    }
    runs.into_iter().map(|(_, run)| run).collect()
}

fn coalesce_fallback(runs: Vec<Run>) -> Vec<Run> {
    let mut merged: Vec<Run> = Vec::with_capacity(runs.len());
    for run in runs {
        match merged.last_mut() {
            Some(last)
                if last.kind == PartitionKind::Fallback && run.kind == PartitionKind::Fallback =>
            {
                last.nodes.extend(run.nodes);
            }
            _ => merged.push(run),
        }
    }
    merged
}

/// Fold every undersized eligible run into a neighbouring eligible run.
///
/// Expects fallback runs to be coalesced, so eligible neighbours sit two slots away.
fn merge_undersized(
    graph: &Graph,
    mut runs: Vec<Run>,
    min_block_size: usize,
) -> Result<Vec<Run>, CompileError> {
    let deps = graph.dependency_graph();
    let mut search = Dfs::empty(&deps);

    while let Some(i) = runs
        .iter()
        .position(|r| r.kind == PartitionKind::Eligible && r.nodes.len() < min_block_size)
    {
        let earlier = i >= 2
            && runs[i - 2].kind == PartitionKind::Eligible
            && !reaches(&deps, &mut search, &runs[i - 1].nodes, &runs[i].nodes);
        let later = !earlier
            && i + 2 < runs.len()
            && runs[i + 2].kind == PartitionKind::Eligible
            && !reaches(&deps, &mut search, &runs[i].nodes, &runs[i + 1].nodes);

        if earlier {
            let small = runs.remove(i);
            debug!(
                "Merging [{}] into earlier eligible run [{}]",
                compress_ranges(&small.nodes),
                compress_ranges(&runs[i - 2].nodes)
            );
            runs[i - 2].nodes.extend(small.nodes);
        } else if later {
            let small = runs.remove(i);
            debug!(
                "Merging [{}] into later eligible run [{}]",
                compress_ranges(&small.nodes),
                compress_ranges(&runs[i + 1].nodes)
            );
            let target = &mut runs[i + 1].nodes;
            let tail = std::mem::replace(target, small.nodes);
            target.extend(tail);
        } else {
            return Err(CompileError::PartitionSize {
                partition: format!("nodes [{}]", compress_ranges(&runs[i].nodes)),
                size: runs[i].nodes.len(),
                min_block_size,
            });
        }
        runs = coalesce_fallback(runs);
    }
    Ok(runs)
}

/// Whether any node in `to` depends, directly or transitively, on a node in `from`.
///
/// One walk seeded with every node of `from`.
fn reaches(deps: &DepGraph, search: &mut ReachSearch, from: &[usize], to: &[usize]) -> bool {
    let targets: HashSet<usize> = to.iter().copied().collect();
    search.reset(deps);
    search.stack.extend(from.iter().map(|&a| NodeIndex::new(a)));
    while let Some(node) = search.next(deps) {
        if targets.contains(&node.index()) {
            return true;
        }
    }
    false
}

fn with_boundaries(graph: &Graph, runs: Vec<Run>) -> Vec<Partition> {
    let mut owner = vec![0usize; graph.len()];
    for (index, run) in runs.iter().enumerate() {
        for &position in &run.nodes {
            owner[position] = index;
        }
    }

    let producers = graph.producers();
    let mut readers: HashMap<ValueId, HashSet<usize>> = HashMap::new();
    for (position, node) in graph.nodes().iter().enumerate() {
        for &value in &node.inputs {
            readers.entry(value).or_default().insert(owner[position]);
        }
    }
    let graph_outputs: HashSet<ValueId> = graph.outputs().iter().copied().collect();

    runs.into_iter()
        .enumerate()
        .map(|(index, run)| {
            let mut inputs = Vec::new();
            let mut seen = HashSet::new();
            let mut outputs = Vec::new();
            for &position in &run.nodes {
                let node = &graph.nodes()[position];
                for &value in &node.inputs {
                    let external = producers.get(&value).is_none_or(|&p| owner[p] != index);
                    if external && seen.insert(value) {
                        inputs.push(value);
                    }
                }
                for &value in &node.outputs {
                    let read_outside = readers
                        .get(&value)
                        .is_some_and(|parts| parts.iter().any(|&p| p != index));
                    if read_outside || graph_outputs.contains(&value) {
                        outputs.push(value);
                    }
                }
            }
            Partition {
                index,
                kind: run.kind,
                nodes: run.nodes,
                inputs,
                outputs,
            }
        })
        .collect()
}

/// `0-2, 5, 7-9` style rendering of ascending positions.
pub fn compress_ranges(positions: &[usize]) -> String {
    let mut parts = Vec::new();
    let mut iter = positions.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(", ")
}

fn join(values: &[ValueId]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// One line per partition.
pub fn render_plan(partitions: &[Partition]) -> String {
    partitions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

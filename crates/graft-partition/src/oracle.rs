//! Support analysis: which nodes the accelerator compiler can take

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use graft_core::{CompilationSettings, Graph, Node, TensorSpec};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Narrow capability interface of an accelerator compiler.
///
/// Answers whether an operator is supported for one concrete shape signature
/// (the ordered input specs of a node). The oracle treats the answer as opaque.
pub trait CapabilityQuery: Send + Sync {
    fn supports(&self, op: &str, signature: &[TensorSpec]) -> bool;
}

/// Operators an accelerator declares it can compile, independent of shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    ops: BTreeSet<String>,
}

impl CapabilitySet {
    pub fn new<I, S>(ops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CapabilitySet {
            ops: ops.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, op: &str) -> bool {
        self.ops.contains(op)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Operators and modules the caller forces onto the fallback executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusions {
    pub operators: BTreeSet<String>,
    /// Module paths; a path also covers its dotted submodules.
    pub modules: BTreeSet<String>,
}

impl Exclusions {
    pub fn from_settings(settings: &CompilationSettings) -> Self {
        Exclusions {
            operators: settings.excluded_operators().clone(),
            modules: settings.excluded_modules().clone(),
        }
    }

    pub fn matches(&self, node: &Node) -> bool {
        self.operators.contains(&node.op) || self.modules.iter().any(|m| node.in_module(m))
    }
}

/// Support verdict for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Verdict {
    Supported,
    Unsupported,
    /// Excluded by the caller; overrides capability membership.
    ForcedFallback,
}

impl Verdict {
    pub fn is_supported(self) -> bool {
        self == Verdict::Supported
    }
}

/// Decides per node whether the accelerator can take it. Pure and side-effect free.
pub struct SupportOracle<'a> {
    capabilities: &'a CapabilitySet,
    query: &'a dyn CapabilityQuery,
    exclusions: &'a Exclusions,
}

impl<'a> SupportOracle<'a> {
    pub fn new(
        capabilities: &'a CapabilitySet,
        query: &'a dyn CapabilityQuery,
        exclusions: &'a Exclusions,
    ) -> Self {
        SupportOracle {
            capabilities,
            query,
            exclusions,
        }
    }

    /// Verdict for `node` given its ordered input specs.
    pub fn verdict(&self, node: &Node, signature: &[TensorSpec]) -> Verdict {
        if self.exclusions.matches(node) {
            Verdict::ForcedFallback
        } else if !self.capabilities.contains(&node.op) || !self.query.supports(&node.op, signature)
        {
            Verdict::Unsupported
        } else {
            Verdict::Supported
        }
    }

    /// Verdicts for every node of `graph`, in node order.
    pub fn classify(&self, graph: &Graph) -> Vec<Verdict> {
        graph
            .nodes()
            .iter()
            .map(|node| self.verdict(node, &graph.signature(node)))
            .collect()
    }

    /// Per-operator support counts, for diagnostics.
    pub fn preview(&self, graph: &Graph) -> SupportPreview {
        let mut per_op: BTreeMap<String, OpSupport> = BTreeMap::new();
        for (node, verdict) in graph.nodes().iter().zip(self.classify(graph)) {
            let entry = per_op.entry(node.op.clone()).or_default();
            match verdict {
                Verdict::Supported => entry.supported += 1,
                Verdict::Unsupported => entry.unsupported += 1,
                Verdict::ForcedFallback => entry.forced += 1,
            }
        }
        let preview = SupportPreview { per_op };
        debug!("Node support preview:\n{}", preview);
        preview
    }
}

/// Support counts for one operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpSupport {
    pub supported: usize,
    pub unsupported: usize,
    pub forced: usize,
}

/// Node-support preview of a whole graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupportPreview {
    pub per_op: BTreeMap<String, OpSupport>,
}

impl SupportPreview {
    pub fn supported_nodes(&self) -> usize {
        self.per_op.values().map(|s| s.supported).sum()
    }

    pub fn total_nodes(&self) -> usize {
        self.per_op
            .values()
            .map(|s| s.supported + s.unsupported + s.forced)
            .sum()
    }
}

impl fmt::Display for SupportPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (op, support) in &self.per_op {
            writeln!(
                f,
                "{op}: supported={} unsupported={} forced={}",
                support.supported, support.unsupported, support.forced
            )?;
        }
        write!(
            f,
            "{}/{} node(s) supported",
            self.supported_nodes(),
            self.total_nodes()
        )
    }
}

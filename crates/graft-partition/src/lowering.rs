//! Graph-to-graph rewrites that run before partitioning

use std::collections::{HashMap, HashSet};
use std::fmt;

use graft_core::{Graph, GraphError, Node, ValueId};
use serde::Serialize;
use tracing::debug;

/// One rewrite over a frozen graph.
pub trait LoweringPass: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the rewritten graph and the number of rewrites applied.
    fn run(&self, graph: &Graph) -> Result<(Graph, usize), GraphError>;
}

/// Record of one pass that ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassRecord {
    pub name: String,
    pub rewrites: usize,
}

/// Every pass that ran, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoweringReport {
    pub passes: Vec<PassRecord>,
}

impl LoweringReport {
    pub fn total_rewrites(&self) -> usize {
        self.passes.iter().map(|p| p.rewrites).sum()
    }
}

impl fmt::Display for LoweringReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self
            .passes
            .iter()
            .map(|p| format!("{}: {} rewrite(s)", p.name, p.rewrites))
            .collect();
        f.write_str(&lines.join("\n"))
    }
}

/// Ordered list of lowering passes.
pub struct LoweringPipeline {
    passes: Vec<Box<dyn LoweringPass>>,
}

impl Default for LoweringPipeline {
    fn default() -> Self {
        Self::empty()
            .with_pass(FuseProducerConsumer::permute_matmul())
            .with_pass(FuseProducerConsumer::permute_linear())
    }
}

impl LoweringPipeline {
    pub fn empty() -> Self {
        LoweringPipeline { passes: Vec::new() }
    }

    pub fn with_pass(mut self, pass: impl LoweringPass + 'static) -> Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn run(&self, graph: &Graph) -> Result<(Graph, LoweringReport), GraphError> {
        let mut current = graph.clone();
        let mut report = LoweringReport::default();
        for pass in &self.passes {
            let (next, rewrites) = pass.run(&current)?;
            debug!(pass = pass.name(), rewrites, "Lowering pass finished");
            report.passes.push(PassRecord {
                name: pass.name().to_string(),
                rewrites,
            });
            current = next;
        }
        Ok((current, report))
    }
}

/// Fuses a producer into its only consumer when the operator pair matches.
///
/// The fused node keeps the consumer's id, module and outputs and reads the producer's
/// inputs in place of the intermediate value.
#[derive(Debug, Clone)]
pub struct FuseProducerConsumer {
    name: String,
    producer: String,
    consumer: String,
    fused: String,
}

impl FuseProducerConsumer {
    pub fn new(
        name: impl Into<String>,
        producer: impl Into<String>,
        consumer: impl Into<String>,
        fused: impl Into<String>,
    ) -> Self {
        FuseProducerConsumer {
            name: name.into(),
            producer: producer.into(),
            consumer: consumer.into(),
            fused: fused.into(),
        }
    }

    pub fn permute_matmul() -> Self {
        Self::new(
            "fuse_permute_matmul",
            "aten::permute",
            "aten::matmul",
            "graft::permute_matmul",
        )
    }

    pub fn permute_linear() -> Self {
        Self::new(
            "fuse_permute_linear",
            "aten::permute",
            "aten::linear",
            "graft::permute_linear",
        )
    }

    /// Consumer position for each fusable producer position.
    fn find_pairs(&self, graph: &Graph) -> HashMap<usize, usize> {
        let mut readers: HashMap<ValueId, Vec<usize>> = HashMap::new();
        for (position, node) in graph.nodes().iter().enumerate() {
            for &value in &node.inputs {
                readers.entry(value).or_default().push(position);
            }
        }
        let graph_outputs: HashSet<ValueId> = graph.outputs().iter().copied().collect();

        let mut pairs = HashMap::new();
        for (position, node) in graph.nodes().iter().enumerate() {
            if node.op != self.producer || node.outputs.len() != 1 {
                continue;
            }
            let value = node.outputs[0];
            if graph_outputs.contains(&value) {
                continue;
            }
            if let Some([consumer]) = readers.get(&value).map(Vec::as_slice)
                && graph.nodes()[*consumer].op == self.consumer
            {
                pairs.insert(*consumer, position);
            }
        }
        pairs
    }
}

impl LoweringPass for FuseProducerConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, graph: &Graph) -> Result<(Graph, usize), GraphError> {
        let pairs = self.find_pairs(graph);
        if pairs.is_empty() {
            return Ok((graph.clone(), 0));
        }
        let fused_producers: HashSet<usize> = pairs.values().copied().collect();

        let mut nodes = Vec::with_capacity(graph.len() - pairs.len());
        for (position, node) in graph.nodes().iter().enumerate() {
            if fused_producers.contains(&position) {
                continue;
            }
            match pairs.get(&position) {
                Some(&producer) => nodes.push(self.fuse(&graph.nodes()[producer], node)),
                None => nodes.push(node.clone()),
            }
        }

        let fused = Graph::from_parts(
            graph.inputs().to_vec(),
            nodes,
            graph.outputs().to_vec(),
            graph.values().clone(),
        )?;
        Ok((fused, pairs.len()))
    }
}

impl FuseProducerConsumer {
    fn fuse(&self, producer: &Node, consumer: &Node) -> Node {
        let intermediate = producer.outputs[0];
        let mut inputs = Vec::with_capacity(consumer.inputs.len() + producer.inputs.len());
        for &value in &consumer.inputs {
            if value == intermediate {
                inputs.extend_from_slice(&producer.inputs);
            } else {
                inputs.push(value);
            }
        }

        let mut attrs = consumer.attrs.clone();
        attrs.insert(
            "fused_from".to_string(),
            format!("{},{}", producer.op, consumer.op),
        );
        for (key, value) in &producer.attrs {
            attrs.insert(format!("{}.{key}", self.producer), value.clone());
        }

        Node {
            id: consumer.id,
            op: self.fused.clone(),
            inputs,
            outputs: consumer.outputs.clone(),
            module: consumer.module.clone(),
            attrs,
        }
    }
}

//! Frozen dataflow graph, its builder, and a petgraph dependency view

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, GraphError};
use crate::model::*;

/// Serialized form of a graph. Validated when converted into a [`Graph`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GraphDef {
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub values: BTreeMap<ValueId, TensorSpec>,
    pub nodes: Vec<Node>,
}

/// A topologically valid, immutable dataflow graph.
///
/// Nodes are kept in their declared order, and every node only reads values produced
/// by earlier nodes or by external inputs. A `Graph` can only be obtained through
/// [`GraphBuilder`] or by converting a [`GraphDef`], both of which validate this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "GraphDef", into = "GraphDef")]
pub struct Graph {
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    nodes: Vec<Node>,
    values: BTreeMap<ValueId, TensorSpec>,
}

impl Graph {
    /// Assemble and validate a graph from its parts.
    ///
    /// Specs for values the graph never defines are dropped.
    pub fn from_parts(
        inputs: Vec<ValueId>,
        nodes: Vec<Node>,
        outputs: Vec<ValueId>,
        mut values: BTreeMap<ValueId, TensorSpec>,
    ) -> Result<Self, GraphError> {
        let mut defined = HashSet::new();
        for &value in &inputs {
            if !values.contains_key(&value) {
                return Err(GraphError::MissingSpec(value));
            }
            if !defined.insert(value) {
                return Err(GraphError::DuplicateValue(value));
            }
        }

        let mut node_ids = HashSet::new();
        for node in &nodes {
            if !node_ids.insert(node.id) {
                return Err(GraphError::DuplicateNode(node.id));
            }
            if let Some(&value) = node.inputs.iter().find(|v| !defined.contains(*v)) {
                return Err(GraphError::UndefinedValue {
                    node: node.id,
                    value,
                });
            }
            for &value in &node.outputs {
                if !values.contains_key(&value) {
                    return Err(GraphError::MissingSpec(value));
                }
                if !defined.insert(value) {
                    return Err(GraphError::DuplicateValue(value));
                }
            }
        }

        if let Some(&value) = outputs.iter().find(|v| !defined.contains(*v)) {
            return Err(GraphError::UndefinedOutput(value));
        }

        values.retain(|value, _| defined.contains(value));
        Ok(Graph {
            inputs,
            outputs,
            nodes,
            values,
        })
    }

    /// External inputs, in call order.
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    /// External outputs, in return order.
    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    /// Nodes in topological order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, position: usize) -> Option<&Node> {
        self.nodes.get(position)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn spec(&self, value: ValueId) -> Option<&TensorSpec> {
        self.values.get(&value)
    }

    pub fn values(&self) -> &BTreeMap<ValueId, TensorSpec> {
        &self.values
    }

    /// Ordered input specs of a node: what capability queries see.
    pub fn signature(&self, node: &Node) -> Vec<TensorSpec> {
        node.inputs
            .iter()
            .filter_map(|v| self.values.get(v).cloned())
            .collect()
    }

    /// Map from each node-produced value to the position of its producer.
    pub fn producers(&self) -> HashMap<ValueId, usize> {
        let mut producers = HashMap::new();
        for (position, node) in self.nodes.iter().enumerate() {
            for &value in &node.outputs {
                producers.insert(value, position);
            }
        }
        producers
    }

    /// Dependency view over node positions: an edge `a -> b` for every value `b` reads from `a`.
    ///
    /// Node index `i` in the returned graph is node position `i`.
    pub fn dependency_graph(&self) -> DiGraph<usize, ValueId> {
        let mut deps = DiGraph::with_capacity(self.nodes.len(), self.nodes.len());
        let indices: Vec<_> = (0..self.nodes.len()).map(|p| deps.add_node(p)).collect();
        let producers = self.producers();
        for (position, node) in self.nodes.iter().enumerate() {
            for value in &node.inputs {
                if let Some(&source) = producers.get(value) {
                    deps.add_edge(indices[source], indices[position], *value);
                }
            }
        }
        deps
    }

    /// Standalone graph made of the nodes at `positions`, with an explicit boundary.
    pub fn subgraph(
        &self,
        positions: &[usize],
        inputs: &[ValueId],
        outputs: &[ValueId],
    ) -> Result<Graph, GraphError> {
        let mut nodes = Vec::with_capacity(positions.len());
        for &position in positions {
            let node = self
                .nodes
                .get(position)
                .ok_or(GraphError::NodeOutOfRange(position))?;
            nodes.push(node.clone());
        }
        Graph::from_parts(
            inputs.to_vec(),
            nodes,
            outputs.to_vec(),
            self.values.clone(),
        )
    }

    /// Run the graph node by node on the host executor.
    pub fn evaluate<V: Clone>(
        &self,
        inputs: &[V],
        executor: &dyn NodeExecutor<V>,
    ) -> Result<Vec<V>, ExecutionError> {
        let mut env = ValueEnv::bind(&self.inputs, inputs)?;
        for node in &self.nodes {
            let args = env.gather(&node.inputs)?;
            let results = executor.run_node(node, &args)?;
            env.store(&format!("node {} ({})", node.id, node.op), &node.outputs, results)?;
        }
        env.gather(&self.outputs)
    }
}

impl TryFrom<GraphDef> for Graph {
    type Error = GraphError;

    fn try_from(def: GraphDef) -> Result<Self, Self::Error> {
        Graph::from_parts(def.inputs, def.nodes, def.outputs, def.values)
    }
}

impl From<Graph> for GraphDef {
    fn from(graph: Graph) -> Self {
        GraphDef {
            inputs: graph.inputs,
            outputs: graph.outputs,
            values: graph.values,
            nodes: graph.nodes,
        }
    }
}

/// Incrementally builds a [`Graph`], assigning value and node ids in order.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    inputs: Vec<ValueId>,
    nodes: Vec<Node>,
    values: BTreeMap<ValueId, TensorSpec>,
    next_value: u32,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an external input.
    pub fn input(&mut self, spec: TensorSpec) -> ValueId {
        let value = self.fresh(spec);
        self.inputs.push(value);
        value
    }

    /// Append a node. Every input must already be defined.
    pub fn add_node(
        &mut self,
        op: impl Into<String>,
        module: impl Into<String>,
        inputs: &[ValueId],
        outputs: impl IntoIterator<Item = TensorSpec>,
    ) -> Result<Vec<ValueId>, GraphError> {
        let id = NodeId(self.nodes.len() as u32);
        if let Some(&value) = inputs.iter().find(|v| !self.values.contains_key(*v)) {
            return Err(GraphError::UndefinedValue { node: id, value });
        }
        let outputs: Vec<ValueId> = outputs.into_iter().map(|spec| self.fresh(spec)).collect();
        self.nodes.push(Node {
            id,
            op: op.into(),
            inputs: inputs.to_vec(),
            outputs: outputs.clone(),
            module: module.into(),
            attrs: BTreeMap::new(),
        });
        Ok(outputs)
    }

    /// Append a single-output node.
    pub fn add_op(
        &mut self,
        op: impl Into<String>,
        module: impl Into<String>,
        inputs: &[ValueId],
        output: TensorSpec,
    ) -> Result<ValueId, GraphError> {
        let outputs = self.add_node(op, module, inputs, [output])?;
        Ok(outputs[0])
    }

    /// Declare the external outputs and freeze the graph.
    pub fn finish(self, outputs: &[ValueId]) -> Result<Graph, GraphError> {
        Graph::from_parts(self.inputs, self.nodes, outputs.to_vec(), self.values)
    }

    fn fresh(&mut self, spec: TensorSpec) -> ValueId {
        let value = ValueId(self.next_value);
        self.next_value += 1;
        self.values.insert(value, spec);
        value
    }
}

/// Host-side execution of single nodes, provided by the embedding executor.
pub trait NodeExecutor<V> {
    fn run_node(&self, node: &Node, inputs: &[V]) -> Result<Vec<V>, ExecutionError>;
}

/// Value bindings during graph execution.
#[derive(Debug)]
pub struct ValueEnv<V> {
    values: HashMap<ValueId, V>,
}

impl<V: Clone> ValueEnv<V> {
    /// Bind external inputs positionally.
    pub fn bind(inputs: &[ValueId], args: &[V]) -> Result<Self, ExecutionError> {
        if inputs.len() != args.len() {
            return Err(ExecutionError::InputArity {
                expected: inputs.len(),
                actual: args.len(),
            });
        }
        let values = inputs.iter().copied().zip(args.iter().cloned()).collect();
        Ok(ValueEnv { values })
    }

    pub fn gather(&self, ids: &[ValueId]) -> Result<Vec<V>, ExecutionError> {
        ids.iter()
            .map(|id| {
                self.values
                    .get(id)
                    .cloned()
                    .ok_or(ExecutionError::MissingValue(*id))
            })
            .collect()
    }

    /// Bind the results of one step to its declared outputs.
    pub fn store(
        &mut self,
        step: &str,
        outputs: &[ValueId],
        results: Vec<V>,
    ) -> Result<(), ExecutionError> {
        if outputs.len() != results.len() {
            return Err(ExecutionError::OutputArity {
                step: step.to_string(),
                expected: outputs.len(),
                actual: results.len(),
            });
        }
        self.values.extend(outputs.iter().copied().zip(results));
        Ok(())
    }
}

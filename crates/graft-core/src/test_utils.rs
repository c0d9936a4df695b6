//! Test utilities for Graft: graph fixtures, a toy executor, and tracing capture

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use crate::error::ExecutionError;
use crate::graph::{Graph, GraphBuilder, NodeExecutor};
use crate::model::{Node, TensorSpec};

/// Linear chain `x -> op[0] -> op[1] -> ...` with one input and one output.
///
/// Node `i` lives in module `model.layer{i}`.
pub fn chain_graph(ops: &[&str]) -> Graph {
    let mut builder = GraphBuilder::new();
    let mut current = builder.input(TensorSpec::f32([4]));
    for (i, op) in ops.iter().enumerate() {
        current = builder
            .add_op(*op, format!("model.layer{i}"), &[current], TensorSpec::f32([4]))
            .unwrap();
    }
    builder.finish(&[current]).unwrap()
}

/// Ten-node chain whose nodes 3..=5 use an operator no accelerator knows.
pub fn ten_node_graph() -> Graph {
    let ops: Vec<&str> = (0..10)
        .map(|i| if (3..=5).contains(&i) { "custom::unknown" } else { "aten::relu" })
        .collect();
    chain_graph(&ops)
}

/// Evaluates nodes over `i64` with simple arithmetic per operator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArithmeticExecutor;

impl NodeExecutor<i64> for ArithmeticExecutor {
    fn run_node(&self, node: &Node, inputs: &[i64]) -> Result<Vec<i64>, ExecutionError> {
        let value = match node.op.as_str() {
            "aten::add" => inputs.iter().sum(),
            "aten::mul" | "aten::matmul" | "aten::linear" => inputs.iter().product(),
            "graft::permute_matmul" | "graft::permute_linear" => inputs.iter().product(),
            "aten::relu" => inputs[0].max(0),
            "aten::neg" => -inputs[0],
            "aten::permute" | "custom::unknown" => inputs[0],
            "aten::sub" => inputs[0] - inputs[1],
            "aten::split" => return Ok(vec![inputs[0], inputs[0] + 1]),
            other => {
                return Err(ExecutionError::Host {
                    node: node.id,
                    reason: format!("no arithmetic for {other}"),
                });
            }
        };
        Ok(vec![value])
    }
}

/// One recorded tracing event.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

/// Layer that records every event emitted while [`EventCapture::run`] is active.
#[derive(Debug, Clone, Default)]
pub struct EventCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl EventCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with this capture installed as the thread's default subscriber.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events at `level` whose message contains `needle`.
    pub fn matching(&self, level: Level, needle: &str) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.level == level && e.message.contains(needle))
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for EventCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldRecorder::default();
        event.record(&mut visitor);
        self.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldRecorder {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for FieldRecorder {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{value:?}"));
        }
    }
}

//! Unit tests for graft-compiler

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use graft_core::test_utils::{ArithmeticExecutor, EventCapture, chain_graph, ten_node_graph};
use graft_core::{
    BuildError, CompilationSettings, CompileError, CompileOptions, DType, DeviceSpec,
    ExecutionError, Graph, GraphBuilder, GraphError, TensorSpec, ValueId,
};
use graft_partition::{CapabilityQuery, CapabilitySet};
use tracing::Level;

use crate::*;

const REJECT_NEG: &str = r#"
ops = ["aten::relu", "aten::neg"]
reject = ["aten::neg"]
"#;

/// Five relus, one unknown op, five negations.
fn relu_unknown_neg() -> Graph {
    let mut ops = vec!["aten::relu"; 5];
    ops.push("custom::unknown");
    ops.extend(["aten::neg"; 5]);
    chain_graph(&ops)
}

fn options(min_block_size: usize) -> CompileOptions {
    CompileOptions {
        min_block_size,
        ..CompileOptions::default()
    }
}

/// Accepts everything and records each build config it receives.
struct Recording {
    capabilities: CapabilitySet,
    configs: Mutex<Vec<BuildConfig>>,
}

impl Recording {
    fn new(ops: &[&str]) -> Self {
        Recording {
            capabilities: CapabilitySet::new(ops.iter().copied()),
            configs: Mutex::new(Vec::new()),
        }
    }
}

impl CapabilityQuery for Recording {
    fn supports(&self, _op: &str, _signature: &[TensorSpec]) -> bool {
        true
    }
}

impl AcceleratorCompiler for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    fn build(&self, graph: &Graph, config: &BuildConfig) -> Result<EngineArtifact, BuildError> {
        self.configs.lock().unwrap().push(config.clone());
        let specs = |ids: &[ValueId]| ids.iter().map(|v| graph.spec(*v).unwrap().clone()).collect();
        Ok(EngineArtifact {
            bytes: config.name.clone().into_bytes(),
            input_specs: specs(graph.inputs()),
            output_specs: specs(graph.outputs()),
        })
    }
}

/// Produces engines that never declare any outputs.
struct NoOutputs(CapabilitySet);

impl CapabilityQuery for NoOutputs {
    fn supports(&self, _op: &str, _signature: &[TensorSpec]) -> bool {
        true
    }
}

impl AcceleratorCompiler for NoOutputs {
    fn name(&self) -> &str {
        "no-outputs"
    }

    fn capabilities(&self) -> &CapabilitySet {
        &self.0
    }

    fn build(&self, graph: &Graph, _config: &BuildConfig) -> Result<EngineArtifact, BuildError> {
        Ok(EngineArtifact {
            bytes: Vec::new(),
            input_specs: vec![TensorSpec::f32([4]); graph.inputs().len()],
            output_specs: Vec::new(),
        })
    }
}

// ── Subgraph compilation ────────────────────────────────────

#[test]
fn test_rejected_partition_degrades_with_warning() {
    let graph = relu_unknown_neg();
    let accelerator = ReferenceAccelerator::from_toml_str(REJECT_NEG).unwrap();
    let capture = EventCapture::new();

    let compiled = capture
        .run(|| compile_graph(&graph, &accelerator, options(5)))
        .unwrap();

    let warnings = capture.matching(Level::WARN, "Accelerator rejected partition");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].fields["partition"], "acc_2");
    assert!(warnings[0].fields["reason"].contains("aten::neg"));

    assert_eq!(compiled.summary.compiled(), 1);
    assert_eq!(compiled.summary.degraded(), 1);
    insta::assert_snapshot!(compiled.summary.to_string(), @r"
    target: Device(type=GPU, gpu_id=0)
    precision: full
    pass fuse_permute_matmul: 0 rewrite(s)
    pass fuse_permute_linear: 0 rewrite(s)
    acc_0 (5 node(s)): compiled
    host_1 (1 node(s)): fallback
    acc_2 (5 node(s)): degraded: no implementation for aten::neg on Device(type=GPU, gpu_id=0)
    ");
}

#[test]
fn test_pass_through_build_failure_is_fatal() {
    let graph = relu_unknown_neg();
    let accelerator = ReferenceAccelerator::from_toml_str(REJECT_NEG).unwrap();
    let opts = CompileOptions {
        pass_through_build_failures: true,
        ..options(5)
    };

    let err = compile_graph(&graph, &accelerator, opts).unwrap_err();
    match err {
        CompileError::Compilation { partition, source } => {
            assert_eq!(partition, "acc_2");
            assert!(source.reason.contains("aten::neg"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_earliest_fatal_failure_wins() {
    // both eligible partitions are rejected
    let mut ops = vec!["aten::neg"; 3];
    ops.push("custom::unknown");
    ops.extend(["aten::neg"; 3]);
    let graph = chain_graph(&ops);
    let accelerator = ReferenceAccelerator::from_toml_str(REJECT_NEG).unwrap();
    let opts = CompileOptions {
        pass_through_build_failures: true,
        ..options(1)
    };

    for _ in 0..8 {
        let err = compile_graph(&graph, &accelerator, opts.clone()).unwrap_err();
        assert!(
            matches!(&err, CompileError::Compilation { partition, .. } if partition == "acc_0"),
            "{err}"
        );
    }
}

#[test]
fn test_artifact_arity_mismatch_counts_as_failure() {
    let graph = chain_graph(&["aten::relu"; 3]);
    let accelerator = NoOutputs(CapabilitySet::new(["aten::relu"]));
    let compiled = compile_graph(&graph, &accelerator, options(1)).unwrap();

    match &compiled.summary.partitions[0].outcome {
        PartitionOutcome::Degraded { reason } => {
            assert!(reason.contains("0 output(s), partition needs 1 and 1"), "{reason}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(compiled.graph.engine_count(), 0);
}

#[test]
fn test_build_config_carries_settings() {
    let graph = ten_node_graph();
    let accelerator = Recording::new(&["aten::relu"]);
    let settings = CompilationSettings::new(CompileOptions {
        workspace_size: 1 << 20,
        optimization_level: Some(3),
        max_internal_streams: Some(2),
        version_compatible: true,
        sparse_weights: true,
        ..options(1)
    })
    .unwrap();
    let plan = graft_partition::partition(
        &graph,
        &graft_partition::SupportOracle::new(
            accelerator.capabilities(),
            &AcceleratorQuery(&accelerator),
            &graft_partition::Exclusions::default(),
        ),
        graft_partition::PartitionPolicy::from_settings(&settings),
    )
    .unwrap();

    let compiler = SubgraphCompiler::new(&accelerator, &settings);
    let outcomes = compiler.compile_all(&graph, &plan).unwrap();
    let indices: Vec<usize> = outcomes.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, vec![0, 2]);

    let mut configs = accelerator.configs.lock().unwrap().clone();
    configs.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(configs.len(), 2);
    assert_eq!(configs[0].name, "acc_0");
    assert_eq!(configs[1].name, "acc_2");
    let config = &configs[0];
    assert_eq!(config.workspace_size, 1 << 20);
    assert_eq!(config.optimization_level, Some(3));
    assert_eq!(config.max_internal_streams, Some(2));
    assert!(config.version_compatible && config.sparse_weights);
    assert!(!config.truncate_wide_numeric_types);
    assert_eq!(config.dla_memory, None);
}

#[test]
fn test_build_config_dla_memory_pools() {
    let settings = CompilationSettings::new(CompileOptions {
        device: DeviceSpec::dla(1, true),
        dla_sram_size: 2048,
        ..CompileOptions::default()
    })
    .unwrap();
    let config = BuildConfig::new("acc_0", &settings);

    let pools = config.dla_memory.unwrap();
    assert_eq!(pools.sram, 2048);
    assert_eq!(pools.local_dram, 1 << 30);
    assert_eq!(config.target.secondary_id, 1);
    assert_eq!(config.target.primary_id, 0);
}

#[test]
fn test_wide_values_need_truncation() {
    let mut builder = GraphBuilder::new();
    let x = builder.input(TensorSpec::new(DType::I64, [4]));
    let mut current = x;
    for _ in 0..3 {
        current = builder
            .add_op("aten::relu", "", &[current], TensorSpec::new(DType::I64, [4]))
            .unwrap();
    }
    let graph = builder.finish(&[current]).unwrap();
    let accelerator = ReferenceAccelerator::builtin().unwrap();

    let strict = compile_graph(&graph, &accelerator, options(1)).unwrap();
    assert_eq!(strict.summary.degraded(), 1);

    let truncating = CompileOptions {
        truncate_wide_numeric_types: true,
        ..options(1)
    };
    let relaxed = compile_graph(&graph, &accelerator, truncating).unwrap();
    assert_eq!(relaxed.summary.compiled(), 1);
}

// ── Splicing and execution ──────────────────────────────────

#[test]
fn test_splice_preserves_interface_and_step_count() {
    let graph = relu_unknown_neg();
    let accelerator = ReferenceAccelerator::from_toml_str(REJECT_NEG).unwrap();
    let compiled = compile_graph(&graph, &accelerator, options(5)).unwrap();
    let hybrid = &compiled.graph;

    assert_eq!(hybrid.inputs(), graph.inputs());
    assert_eq!(hybrid.outputs(), graph.outputs());
    // 11 nodes, one 5-node partition replaced by one engine
    assert_eq!(hybrid.len(), 11 - 5 + 1);
    insta::assert_snapshot!(hybrid.to_string(), @r"
    inputs (%0)
    engine %5 = acc_0(%0) [5 node(s)]
    host   %6 = custom::unknown(%5)
    host   %7 = aten::neg(%6)
    host   %8 = aten::neg(%7)
    host   %9 = aten::neg(%8)
    host   %10 = aten::neg(%9)
    host   %11 = aten::neg(%10)
    outputs (%11)
    ");
}

#[test]
fn test_execute_matches_evaluate() {
    // two branches joined by an add, with an unsupported op on one side
    let mut builder = GraphBuilder::new();
    let x = builder.input(TensorSpec::f32([4]));
    let y = builder.input(TensorSpec::f32([4]));
    let a = builder.add_op("aten::add", "", &[x, y], TensorSpec::f32([4])).unwrap();
    let b = builder.add_op("aten::mul", "", &[a, y], TensorSpec::f32([4])).unwrap();
    let parts = builder
        .add_node("aten::split", "", &[b], [TensorSpec::f32([4]), TensorSpec::f32([4])])
        .unwrap();
    let c = builder.add_op("aten::sub", "", &[parts[0], a], TensorSpec::f32([4])).unwrap();
    let d = builder.add_op("aten::neg", "", &[parts[1]], TensorSpec::f32([4])).unwrap();
    let e = builder.add_op("aten::add", "", &[c, d], TensorSpec::f32([4])).unwrap();
    let f = builder.add_op("aten::relu", "", &[e], TensorSpec::f32([4])).unwrap();
    let graph = builder.finish(&[f, a]).unwrap();

    let accelerator = ReferenceAccelerator::builtin().unwrap();
    let compiled = compile_graph(&graph, &accelerator, options(2)).unwrap();
    assert_eq!(compiled.graph.engine_count(), 2);

    let runtime = ReferenceRuntime::new(ArithmeticExecutor);
    for inputs in [[3_i64, 4], [-5, 2], [0, 0], [7, -9]] {
        let expected = graph.evaluate(&inputs, &ArithmeticExecutor).unwrap();
        let actual = compiled
            .graph
            .execute(&inputs, &ArithmeticExecutor, &runtime)
            .unwrap();
        assert_eq!(actual, expected, "inputs {inputs:?}");
    }
}

#[test]
fn test_execute_after_fusion() {
    let mut builder = GraphBuilder::new();
    let x = builder.input(TensorSpec::f32([4, 4]));
    let w = builder.input(TensorSpec::f32([4, 4]));
    let p = builder.add_op("aten::permute", "", &[x], TensorSpec::f32([4, 4])).unwrap();
    let m = builder.add_op("aten::matmul", "", &[p, w], TensorSpec::f32([4, 4])).unwrap();
    let r = builder.add_op("aten::relu", "", &[m], TensorSpec::f32([4, 4])).unwrap();
    let graph = builder.finish(&[r]).unwrap();

    let accelerator = ReferenceAccelerator::builtin().unwrap();
    let compiled = compile_graph(&graph, &accelerator, options(2)).unwrap();
    assert_eq!(compiled.summary.lowering.total_rewrites(), 1);
    assert_eq!(compiled.graph.len(), 1);

    let runtime = ReferenceRuntime::new(ArithmeticExecutor);
    let inputs = [2_i64, 5];
    assert_eq!(
        compiled.graph.execute(&inputs, &ArithmeticExecutor, &runtime).unwrap(),
        graph.evaluate(&inputs, &ArithmeticExecutor).unwrap()
    );
}

#[test]
fn test_splice_without_replacements_is_plain_graph() {
    let graph = ten_node_graph();
    let accelerator = ReferenceAccelerator::builtin().unwrap();
    let plan = partition_only(&graph, &accelerator, options(1)).unwrap();
    let hybrid = HybridGraph::splice(&plan.graph, &plan.partitions, &BTreeMap::new()).unwrap();

    assert_eq!(hybrid.len(), graph.len());
    assert_eq!(hybrid.engine_count(), 0);
    let runtime = ReferenceRuntime::new(ArithmeticExecutor);
    assert_eq!(
        hybrid.execute(&[-4_i64], &ArithmeticExecutor, &runtime).unwrap(),
        graph.evaluate(&[-4_i64], &ArithmeticExecutor).unwrap()
    );
}

#[test]
fn test_validate_rejects_broken_contract() {
    let graph = chain_graph(&["aten::relu"; 4]);
    let accelerator = ReferenceAccelerator::builtin().unwrap();
    let plan = partition_only(&graph, &accelerator, options(1)).unwrap();

    // a unit that forgets the partition's output
    let unit = CompiledUnit {
        name: "acc_0".to_string(),
        artifact: Arc::new(EngineArtifact {
            bytes: Vec::new(),
            input_specs: vec![TensorSpec::f32([4])],
            output_specs: Vec::new(),
        }),
        inputs: vec![ValueId(0)],
        outputs: Vec::new(),
        replaced: 4,
    };
    let replacements = BTreeMap::from([(0, unit)]);
    let err = HybridGraph::splice(&plan.graph, &plan.partitions, &replacements).unwrap_err();
    assert_eq!(err, GraphError::UndefinedOutput(ValueId(4)));
}

#[test]
fn test_corrupt_engine_reports_unit_name() {
    let graph = chain_graph(&["aten::relu"; 2]);
    let accelerator = Recording::new(&["aten::relu"]);
    let compiled = compile_graph(&graph, &accelerator, options(1)).unwrap();

    // Recording engines hold their name, not a reference blob
    let runtime = ReferenceRuntime::new(ArithmeticExecutor);
    let err = compiled
        .graph
        .execute(&[1_i64], &ArithmeticExecutor, &runtime)
        .unwrap_err();
    match err {
        ExecutionError::Engine { unit, reason } => {
            assert_eq!(unit, "acc_0");
            assert!(reason.starts_with("corrupt engine artifact"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_parallel_compilation_is_deterministic() {
    let mut ops = Vec::new();
    for _ in 0..6 {
        ops.extend(["aten::relu", "aten::relu", "aten::neg"]);
        ops.push("custom::unknown");
    }
    let graph = chain_graph(&ops);
    let accelerator = ReferenceAccelerator::builtin().unwrap();

    let first = compile_graph(&graph, &accelerator, options(3)).unwrap();
    assert_eq!(first.graph.engine_count(), 6);
    for _ in 0..4 {
        let again = compile_graph(&graph, &accelerator, options(3)).unwrap();
        assert_eq!(again.graph, first.graph);
        assert_eq!(again.summary, first.summary);
    }
}

#[test]
fn test_summary_serializes_outcomes() {
    let graph = relu_unknown_neg();
    let accelerator = ReferenceAccelerator::from_toml_str(REJECT_NEG).unwrap();
    let compiled = compile_graph(&graph, &accelerator, options(5)).unwrap();

    let json = serde_json::to_value(&compiled.summary).unwrap();
    assert_eq!(json["partitions"][0]["status"], "compiled");
    assert_eq!(json["partitions"][1]["status"], "fallback");
    assert_eq!(json["partitions"][2]["status"], "degraded");
    assert_eq!(json["partitions"][2]["kind"], "eligible");
    assert_eq!(json["target"]["kind"], "Gpu");
}

#[test]
fn test_create_accelerator() {
    let accelerator = create_accelerator("reference", None).unwrap();
    assert_eq!(accelerator.name(), "reference");
    assert!(accelerator.capabilities().contains("aten::relu"));

    let custom = create_accelerator("reference", Some("ops = [\"aten::gelu\"]")).unwrap();
    assert!(custom.capabilities().contains("aten::gelu"));
    assert!(!custom.capabilities().contains("aten::relu"));
    assert_eq!(custom.capabilities().len(), 1);

    let empty = create_accelerator("reference", Some("ops = []")).unwrap();
    assert!(empty.capabilities().is_empty());

    assert!(matches!(
        create_accelerator("tensorrt", None),
        Err(CompileError::InvalidSettings(_))
    ));
    assert!(matches!(
        create_accelerator("reference", Some("opz = []")),
        Err(CompileError::InvalidSettings(_))
    ));
}

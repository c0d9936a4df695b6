//! Integration tests for Graft
//!
//! These exercise the crates together through files on disk and through the CLI binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use graft_compiler::{ReferenceAccelerator, ReferenceRuntime, compile_graph};
use graft_core::test_utils::{ArithmeticExecutor, ten_node_graph};
use graft_core::{CompileOptions, DeviceKind, Graph, GraphBuilder, TensorSpec};
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn write_graph(dir: &TempDir, name: &str, graph: &Graph) -> PathBuf {
    write(dir, name, &serde_json::to_string_pretty(graph).unwrap())
}

fn graft(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_graft"))
        .args(args)
        .output()
        .expect("Failed to run graft")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

/// Residual block: relu, unsupported gelu, then add back onto the input.
fn residual_graph() -> Graph {
    let mut builder = GraphBuilder::new();
    let x = builder.input(TensorSpec::f32([8]));
    let mut h = x;
    for i in 0..3 {
        h = builder
            .add_op("aten::relu", format!("block.fc{i}"), &[h], TensorSpec::f32([8]))
            .unwrap();
    }
    let g = builder
        .add_op("custom::unknown", "block.act", &[h], TensorSpec::f32([8]))
        .unwrap();
    let n = builder
        .add_op("aten::neg", "block.out", &[g], TensorSpec::f32([8]))
        .unwrap();
    let s = builder
        .add_op("aten::add", "block.out", &[n, x], TensorSpec::f32([8]))
        .unwrap();
    builder.finish(&[s]).unwrap()
}

#[test]
fn test_compile_from_files_matches_evaluation() {
    let dir = TempDir::new().unwrap();
    let graph_path = write_graph(&dir, "graph.json", &residual_graph());
    let settings_path = write(
        &dir,
        "settings.toml",
        r#"
min_block_size = 2
enabled_precisions = ["fp16"]
device = "cuda:1"
"#,
    );

    let graph: Graph = serde_json::from_str(&fs::read_to_string(&graph_path).unwrap()).unwrap();
    let options =
        CompileOptions::from_toml_str(&fs::read_to_string(&settings_path).unwrap()).unwrap();
    let accelerator = ReferenceAccelerator::builtin().unwrap();
    let compiled = compile_graph(&graph, &accelerator, options).unwrap();

    assert_eq!(compiled.graph.engine_count(), 2);
    assert_eq!(compiled.summary.target.primary_id, 1);
    assert_eq!(compiled.summary.precision.to_string(), "half");

    let runtime = ReferenceRuntime::new(ArithmeticExecutor);
    for x in [-3_i64, 0, 11] {
        assert_eq!(
            compiled.graph.execute(&[x], &ArithmeticExecutor, &runtime).unwrap(),
            graph.evaluate(&[x], &ArithmeticExecutor).unwrap()
        );
    }
}

#[test]
fn test_handwritten_graph_json() {
    let json = r#"{
        "inputs": [0],
        "outputs": [2],
        "values": {
            "0": { "dtype": "f32", "shape": [4] },
            "1": { "dtype": "f32", "shape": [4] },
            "2": { "dtype": "f32", "shape": [4] }
        },
        "nodes": [
            { "id": 0, "op": "aten::relu", "inputs": [0], "outputs": [1], "module": "enc" },
            { "id": 1, "op": "aten::neg", "inputs": [1], "outputs": [2] }
        ]
    }"#;
    let graph: Graph = serde_json::from_str(json).unwrap();
    assert_eq!(graph.len(), 2);
    assert_eq!(graph.nodes()[1].module, "");

    let broken = json.replace(r#""inputs": [1]"#, r#""inputs": [7]"#);
    let err = serde_json::from_str::<Graph>(&broken).unwrap_err();
    assert!(err.to_string().contains("%7"), "{err}");
}

#[test]
fn test_settings_file_with_device_table() {
    let dir = TempDir::new().unwrap();
    let settings_path = write(
        &dir,
        "settings.toml",
        r#"
excluded_modules = ["block.act"]

[device]
secondary_id = 1
allow_fallback = true
"#,
    );
    let options =
        CompileOptions::from_toml_str(&fs::read_to_string(settings_path).unwrap()).unwrap();
    let accelerator = ReferenceAccelerator::builtin().unwrap();
    let compiled = compile_graph(&residual_graph(), &accelerator, options).unwrap();

    let target = compiled.summary.target;
    assert_eq!(target.kind, DeviceKind::Dla);
    assert_eq!((target.primary_id, target.secondary_id), (0, 1));
    assert!(target.allow_fallback);
}

#[test]
fn test_cli_device() {
    let output = graft(&["device", "dla:0"]);
    assert!(output.status.success());
    assert_eq!(
        stdout(&output),
        "Device(type=DLA, gpu_id=0, dla_core=0, allow_gpu_fallback=false)"
    );

    let output = graft(&["device", "GPU:2"]);
    assert_eq!(stdout(&output), "Device(type=GPU, gpu_id=2)");

    let output = graft(&["device", "npu:0"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid device spec"));
}

#[test]
fn test_cli_plan() {
    let dir = TempDir::new().unwrap();
    let graph_path = write_graph(&dir, "graph.json", &ten_node_graph());
    let settings_path = write(&dir, "settings.toml", "min_block_size = 3\n");

    let output = graft(&["plan", arg(&graph_path), "--config", arg(&settings_path)]);
    assert!(output.status.success());
    insta::assert_snapshot!(stdout(&output), @r"
    aten::relu: supported=7 unsupported=0 forced=0
    custom::unknown: supported=0 unsupported=3 forced=0
    7/10 node(s) supported

    acc_0 eligible nodes [0-2] inputs (%0) outputs (%3)
    host_1 fallback nodes [3-5] inputs (%3) outputs (%6)
    acc_2 eligible nodes [6-9] inputs (%6) outputs (%10)
    ");
}

#[test]
fn test_cli_compile_json_with_capability_table() {
    let dir = TempDir::new().unwrap();
    let graph_path = write_graph(&dir, "graph.json", &ten_node_graph());
    let settings_path = write(&dir, "settings.toml", "min_block_size = 3\n");
    let table_path = write(
        &dir,
        "capabilities.toml",
        "ops = [\"aten::relu\"]\nreject = [\"aten::relu\"]\n",
    );

    let output = graft(&[
        "compile",
        arg(&graph_path),
        "--config",
        arg(&settings_path),
        "--capabilities",
        arg(&table_path),
        "--json",
    ]);
    assert!(output.status.success());
    let summary: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let statuses: Vec<&str> = summary["partitions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["degraded", "fallback", "degraded"]);
}

#[test]
fn test_cli_rejects_bad_settings() {
    let dir = TempDir::new().unwrap();
    let graph_path = write_graph(&dir, "graph.json", &ten_node_graph());
    let settings_path = write(&dir, "settings.toml", "min_blok_size = 3\n");

    let output = graft(&["compile", arg(&graph_path), "--config", arg(&settings_path)]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("min_blok_size"));
}

#[test]
fn test_cli_version() {
    let output = graft(&["version"]);
    assert!(output.status.success());
    assert!(stdout(&output).starts_with("Graft v"));
}

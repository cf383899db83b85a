//! Graph compiler tests over complete pipeline files.

mod common;

use common::{compile, path};
use pretty_assertions::assert_eq;
use sluice_core::Error;
use sluice_core::node::NodeTree;
use sluice_core::pipeline::PipelineDefinition;
use sluice_scheduler::{EdgeKind, GraphCompiler, GraphSnapshot};

const RELEASE: &str = r#"
name: release
variables:
  RUST_LOG: info
docker:
  image: rust:1.85
stages:
  - name: check
    parallel: true
    steps:
      - name: fmt
        run: cargo fmt --check
      - name: clippy
        run: cargo clippy
      - name: test
        run: cargo test
        variables:
          RUST_LOG: debug
  - name: package
    steps:
      - name: build
        run: cargo build --release
      - name: sign
        run: ./sign.sh
        docker:
          image: alpine:3
  - name: publish
    condition: $BRANCH == main
    steps:
      - name: upload
        depends_on: [check/test]
        plugin: s3-upload
"#;

fn try_compile(yaml: &str) -> sluice_core::Result<GraphSnapshot> {
    let definition: PipelineDefinition = serde_yaml::from_str(yaml).unwrap();
    let tree = NodeTree::from_definition(&definition)?;
    Ok(GraphCompiler::new().compile(&tree)?.snapshot())
}

#[test]
fn test_compilation_is_deterministic() {
    let first = compile(RELEASE).snapshot();
    for _ in 0..5 {
        assert_eq!(compile(RELEASE).snapshot(), first);
    }
}

#[test]
fn test_snapshot_json_round_trip() {
    let snapshot = compile(RELEASE).snapshot();
    let json = serde_json::to_string_pretty(&snapshot).unwrap();
    let back: GraphSnapshot = serde_json::from_str(&json).unwrap();

    assert_eq!(back, snapshot);
    assert_eq!(back.pipeline, "release");
    assert!(json.contains("\"release/package/sign\""));
}

#[test]
fn test_stages_run_in_declaration_order() {
    let graph = compile(RELEASE);
    let position = |p: &str| {
        let idx = graph.find(&path(p)).unwrap();
        graph.topological_order().iter().position(|&i| i == idx).unwrap()
    };

    for step in ["release/check/fmt", "release/check/clippy", "release/check/test"] {
        assert!(position(step) < position("release/package"), "{step}");
    }
    assert!(position("release/package/build") < position("release/package/sign"));
    assert!(position("release/package/sign") < position("release/publish"));
}

#[test]
fn test_inherited_settings_resolved() {
    let graph = compile(RELEASE);

    let test = &graph[graph.find(&path("release/check/test")).unwrap()];
    assert_eq!(test.variables.get("RUST_LOG").map(String::as_str), Some("debug"));
    assert_eq!(test.docker.as_ref().unwrap().image, "rust:1.85");

    let sign = &graph[graph.find(&path("release/package/sign")).unwrap()];
    assert_eq!(sign.variables.get("RUST_LOG").map(String::as_str), Some("info"));
    assert_eq!(sign.docker.as_ref().unwrap().image, "alpine:3");
}

#[test]
fn test_cross_stage_dependency_edge() {
    let graph = compile(RELEASE);
    let test = graph.find(&path("release/check/test")).unwrap();
    let upload = graph.find(&path("release/publish/upload")).unwrap();

    assert_eq!(graph.edge_kind(test, upload), Some(EdgeKind::Dependency));
    assert!(graph.conditions().contains("$BRANCH == main"));
    assert!(graph.plugins().contains("s3-upload"));
}

#[test]
fn test_cycle_between_steps_rejected() {
    let yaml = r#"
name: loop
stages:
  - name: build
    steps:
      - name: a
        run: make a
        depends_on: [c]
      - name: b
        run: make b
        depends_on: [a]
      - name: c
        run: make c
        depends_on: [b]
"#;
    match try_compile(yaml) {
        Err(Error::CyclicGraph { path }) => {
            assert!(path.len() >= 3);
            assert!(path.iter().all(|p| p.starts_with("loop/build/")));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[test]
fn test_invalid_pipelines_rejected() {
    let empty_stage = r#"
name: broken
stages:
  - name: build
    steps: []
"#;
    assert!(matches!(try_compile(empty_stage), Err(Error::InvalidPipeline(_))));

    let no_command = r#"
name: broken
stages:
  - name: build
    steps:
      - name: a
"#;
    assert!(matches!(try_compile(no_command), Err(Error::InvalidPipeline(_))));

    let duplicate = r#"
name: broken
stages:
  - name: build
    steps:
      - { name: a, run: "true" }
      - { name: a, run: "true" }
"#;
    assert!(matches!(try_compile(duplicate), Err(Error::DuplicateNode(_))));

    let unknown = r#"
name: broken
stages:
  - name: build
    steps:
      - { name: a, run: "true", depends_on: [ghost] }
"#;
    assert!(matches!(
        try_compile(unknown),
        Err(Error::UnknownDependency { .. })
    ));
}

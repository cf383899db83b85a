//! Local task executor tests against a real docker daemon.
//!
//! Run with: `cargo test -p sluice-runner --test docker_tests --features integration`

#![cfg(feature = "integration")]

use sluice_core::status::TaskStatus;
use sluice_core::task::{EXIT_CODE_SENTINEL, LocalTask};
use sluice_runner::{BollardRuntime, DockerRuntime, ExecutorConfig, LocalTaskExecutor};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

fn executor() -> (LocalTaskExecutor, Arc<BollardRuntime>) {
    let runtime = Arc::new(BollardRuntime::connect().expect("docker not reachable"));
    let config = ExecutorConfig {
        kill_grace_secs: 5,
        ..Default::default()
    };
    (LocalTaskExecutor::new(runtime.clone(), config), runtime)
}

#[tokio::test]
async fn test_echo_task_succeeds() {
    let (executor, runtime) = executor();
    let (_cancel, signal) = watch::channel(false);
    let task = LocalTask::new("echo")
        .with_image("alpine:3")
        .with_script("echo aaa");

    let result = executor.execute(task, signal).await.expect("task failed to start");

    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.trim(), "aaa");

    let leftovers = runtime
        .list(&format!("io.sluice.task={}", executor.config().container_prefix))
        .await
        .unwrap();
    assert!(!leftovers.contains(result.container_id.as_ref().unwrap()));
}

#[tokio::test]
async fn test_timeout_is_enforced() {
    let (executor, _runtime) = executor();
    let (_cancel, signal) = watch::channel(false);
    let task = LocalTask::new("sleepy")
        .with_image("alpine:3")
        .with_script("sleep 9999")
        .with_timeout(1);

    let started = Instant::now();
    let result = executor.execute(task, signal).await.expect("task failed to start");

    assert_eq!(result.status, TaskStatus::Timeout);
    assert_eq!(result.exit_code, EXIT_CODE_SENTINEL);
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test]
async fn test_inputs_become_environment() {
    let (executor, _runtime) = executor();
    let (_cancel, signal) = watch::channel(false);
    let task = LocalTask::new("env")
        .with_image("alpine:3")
        .with_input("GREETING", "hello")
        .with_script("echo $GREETING; exit 4");

    let result = executor.execute(task, signal).await.expect("task failed to start");

    assert_eq!(result.status, TaskStatus::Failure);
    assert_eq!(result.exit_code, 4);
    assert_eq!(result.stdout.trim(), "hello");
}

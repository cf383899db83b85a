//! Serialization tests for sluice-core types.

use chrono::Utc;
use sluice_core::events::*;
use sluice_core::ids::*;
use sluice_core::node::NodePath;
use sluice_core::status::*;
use sluice_core::task::{EXIT_CODE_SENTINEL, TaskResult};

#[test]
fn test_event_is_tagged() {
    let event = Event::JobStatusChanged(JobStatusChangedPayload {
        job_id: JobId::new(),
        pipeline: "build".to_string(),
        from: JobStatus::Queued,
        to: JobStatus::Running,
        error: None,
        timestamp: Utc::now(),
    });

    let value = serde_json::to_value(&event).expect("serialize");
    assert_eq!(value["type"], "job_status_changed");
    assert_eq!(value["to"], "running");

    let parsed: Event = serde_json::from_value(value).expect("deserialize");
    assert!(matches!(parsed, Event::JobStatusChanged(p) if p.from == JobStatus::Queued));
}

#[test]
fn test_node_event_carries_path() {
    let job_id = JobId::new();
    let event = Event::NodeStatusChanged(NodeStatusChangedPayload {
        job_id,
        path: NodePath::parse("build/test/unit").unwrap(),
        status: NodeStatus::Timeout,
        agent_id: None,
        exit_code: Some(EXIT_CODE_SENTINEL),
        error: Some("timed out".to_string()),
        timestamp: Utc::now(),
    });

    assert_eq!(event.subject(), format!("job.{}.node.timeout", job_id));
    let json = serde_json::to_string(&event).expect("serialize");
    assert!(json.contains("\"path\":\"build/test/unit\""));
}

#[test]
fn test_invalid_path_rejected_on_deserialize() {
    let json = r#"{"type":"agent_lost","agent_id":"0190b1d2-7c4e-7000-8000-000000000000","zone":"eu","job_id":null,"node":"build/a.b","timestamp":"2024-01-01T00:00:00Z"}"#;
    assert!(serde_json::from_str::<Event>(json).is_err());
}

#[test]
fn test_task_result_roundtrip() {
    let now = Utc::now();
    let result = TaskResult {
        task_id: TaskId::new(),
        name: "notify".to_string(),
        job_id: Some(JobId::new()),
        status: TaskStatus::Timeout,
        exit_code: EXIT_CODE_SENTINEL,
        stdout: String::new(),
        stderr: String::new(),
        container_id: Some("abc".to_string()),
        error: None,
        started_at: now,
        finished_at: now,
    };

    let json = serde_json::to_string(&result).expect("serialize");
    let parsed: TaskResult = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(parsed.status, TaskStatus::Timeout);
    assert_eq!(parsed.exit_code, -1);
    assert_eq!(parsed.duration_ms(), 0);
}

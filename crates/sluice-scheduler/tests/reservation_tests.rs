//! Concurrent agent reservation.

use pretty_assertions::assert_eq;
use sluice_core::Error;
use sluice_core::agent::{Agent, AgentRequirement, Assignment};
use sluice_core::ids::{AgentId, JobId};
use sluice_core::node::NodePath;
use sluice_core::status::AgentStatus;
use sluice_scheduler::{AgentRegistry, BroadcastEventBus};
use std::collections::HashSet;
use std::sync::Arc;

fn assignment(i: usize) -> Assignment {
    Assignment {
        job_id: JobId::new(),
        node: NodePath::parse(&format!("flow/stage/step-{i}")).unwrap(),
    }
}

async fn registry_with(agents: usize) -> Arc<AgentRegistry> {
    let registry = Arc::new(AgentRegistry::new(Arc::new(BroadcastEventBus::new(1024))).unwrap());
    for i in 0..agents {
        registry
            .register(Agent::new(format!("agent-{i}"), "eu"))
            .await
            .unwrap();
    }
    registry
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_agent_reserved_at_most_once() {
    let registry = registry_with(3).await;

    let mut handles = Vec::new();
    for i in 0..32 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry
                .reserve(&AgentRequirement::new("eu"), assignment(i))
                .await
        }));
    }

    let mut winners: Vec<AgentId> = Vec::new();
    let mut starved = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(agent) => winners.push(agent.id),
            Err(Error::NoAgentAvailable { zone, .. }) => {
                assert_eq!(zone, "eu");
                starved += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let unique: HashSet<AgentId> = winners.iter().copied().collect();
    assert_eq!(winners.len(), 3);
    assert_eq!(unique.len(), 3);
    assert_eq!(starved, 29);
    assert_eq!(registry.zone_stats("eu").busy, 3);
    assert_eq!(registry.zone_stats("eu").idle, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reserve_release_cycles_keep_counts_consistent() {
    let registry = registry_with(2).await;

    let mut handles = Vec::new();
    for worker in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let mut runs = 0;
            for round in 0..50 {
                match registry
                    .reserve(&AgentRequirement::new("eu"), assignment(worker * 100 + round))
                    .await
                {
                    Ok(agent) => {
                        let slot = registry.get(agent.id).unwrap();
                        assert_eq!(slot.status(), AgentStatus::Busy);
                        tokio::task::yield_now().await;
                        let cleared = registry.release(agent.id).await.unwrap();
                        assert!(cleared.is_some());
                        runs += 1;
                    }
                    Err(e) if e.is_retryable() => tokio::task::yield_now().await,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            runs
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }

    assert!(total > 0);
    let stats = registry.zone_stats("eu");
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.busy, 0);
    assert!(registry.list(Some("eu")).iter().all(|a| a.assignment.is_none()));
}

//! Agent, zone and instance types.

use crate::ids::{AgentId, JobId};
use crate::node::NodePath;
use crate::status::AgentStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Point-in-time view of an agent held by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub zone: String,
    pub tags: BTreeSet<String>,
    pub capabilities: Vec<Capability>,
    pub status: AgentStatus,
    pub assignment: Option<Assignment>,
    pub instance: Option<Instance>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(name: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            zone: zone.into(),
            tags: BTreeSet::new(),
            capabilities: vec![Capability::Docker],
            status: AgentStatus::Idle,
            assignment: None,
            instance: None,
            registered_at: Utc::now(),
            last_heartbeat_at: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_instance(mut self, instance: Instance) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Docker,
    Host,
}

/// Job node an agent is currently bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub job_id: JobId,
    pub node: NodePath,
}

/// What a node needs from the agent that runs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequirement {
    pub zone: String,
    pub tags: BTreeSet<String>,
    pub docker_image: Option<String>,
}

impl AgentRequirement {
    pub fn new(zone: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            ..Default::default()
        }
    }

    /// Zone must match, the agent's tags must be a superset of the
    /// requirement's, and docker is required when an image is set.
    pub fn matches(&self, agent: &Agent) -> bool {
        agent.zone == self.zone
            && self.tags.is_subset(&agent.tags)
            && (self.docker_image.is_none() || agent.has_capability(Capability::Docker))
    }
}

/// Provisioning group of agents sharing one machine image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    /// Provision a batch when the idle count is at or below this.
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Shut down idle agents above this count.
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    /// Hard cap on instances in the zone, provisioning included.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_min_idle() -> usize {
    5
}

fn default_batch_size() -> usize {
    5
}

fn default_max_idle() -> usize {
    20
}

fn default_max_instances() -> usize {
    50
}

impl Zone {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: None,
            min_idle: default_min_idle(),
            batch_size: default_batch_size(),
            max_idle: default_max_idle(),
            max_instances: default_max_instances(),
            tags: Vec::new(),
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Only zones with an image can provision.
    pub fn is_available(&self) -> bool {
        self.image.as_deref().is_some_and(|i| !i.is_empty())
    }
}

/// Cloud instance backing an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub zone: String,
    pub status: InstanceStatus,
    pub ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopped,
    Terminated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirement_matching() {
        let agent = Agent::new("a1", "eu").with_tags(["linux", "large"]);
        let mut req = AgentRequirement::new("eu");
        assert!(req.matches(&agent));

        req.tags.insert("linux".into());
        assert!(req.matches(&agent));

        req.tags.insert("gpu".into());
        assert!(!req.matches(&agent));

        let req = AgentRequirement::new("us");
        assert!(!req.matches(&agent));
    }

    #[test]
    fn test_docker_requirement() {
        let agent = Agent::new("a1", "eu").with_capabilities(vec![Capability::Host]);
        let mut req = AgentRequirement::new("eu");
        assert!(req.matches(&agent));
        req.docker_image = Some("alpine:3".into());
        assert!(!req.matches(&agent));
    }

    #[test]
    fn test_zone_defaults() {
        let zone: Zone = serde_json::from_str(r#"{"name": "default"}"#).unwrap();
        assert_eq!(zone.min_idle, 5);
        assert_eq!(zone.batch_size, 5);
        assert!(!zone.is_available());
        assert!(zone.with_image("ami-123").is_available());
    }
}

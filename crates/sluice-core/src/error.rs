//! Error types for Sluice.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // State machine errors
    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Transition from {from} to {to} is already registered")]
    TransitionExists { from: String, to: String },

    #[error("Status changed concurrently: expected {expected}, found {actual}")]
    StatusConflict { expected: String, actual: String },

    // Pipeline / graph errors
    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Invalid node name '{name}': {reason}")]
    InvalidNodeName { name: String, reason: String },

    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Node {node} depends on undefined node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("Node {node} cannot depend on {dependency}: {reason}")]
    DependencyConflict {
        node: String,
        dependency: String,
        reason: String,
    },

    #[error("Cyclic graph detected: {}", path.join(" -> "))]
    CyclicGraph { path: Vec<String> },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Condition error: {0}")]
    Condition(String),

    // Job errors
    #[error("Job not found: {0}")]
    JobNotFound(String),

    // Agent errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("No agent available in zone {zone} matching tags {tags:?}")]
    NoAgentAvailable { zone: String, tags: Vec<String> },

    #[error("Agent {agent} lost while running job {job}")]
    AgentLost { agent: String, job: String },

    #[error("Instance provisioning failed: {0}")]
    Provisioning(String),

    // Local task errors
    #[error("Docker pool error: {0}")]
    DockerPool(String),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Infrastructure errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors the caller is expected to retry on a later tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NoAgentAvailable { .. } | Error::Provisioning(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_graph_message_names_path() {
        let err = Error::CyclicGraph {
            path: vec!["root/a".into(), "root/b".into(), "root/a".into()],
        };
        assert_eq!(
            err.to_string(),
            "Cyclic graph detected: root/a -> root/b -> root/a"
        );
    }

    #[test]
    fn test_retryable() {
        let err = Error::NoAgentAvailable {
            zone: "default".into(),
            tags: vec![],
        };
        assert!(err.is_retryable());
        assert!(!Error::DockerPool("gone".into()).is_retryable());
    }
}

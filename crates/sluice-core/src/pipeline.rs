//! Pipeline definition types.
//!
//! The parsed shape of a pipeline file: one flow holding stages, each stage
//! holding steps. Parsing the file itself is left to the caller.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub docker: Option<DockerOption>,
    #[serde(default)]
    pub agent: Option<AgentSelector>,
    /// Stop dispatching and cancel in-flight work on the first failed node.
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Upper bound on nodes of one job running at the same time.
    #[serde(default)]
    pub max_parallel: Option<usize>,
    pub stages: Vec<StageDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub docker: Option<DockerOption>,
    #[serde(default)]
    pub agent: Option<AgentSelector>,
    /// Run all steps as soon as the stage starts instead of one after another.
    #[serde(default)]
    pub parallel: bool,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub docker: Option<DockerOption>,
    #[serde(default)]
    pub agent: Option<AgentSelector>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub plugin: Option<String>,
    /// Execute on the server's local docker daemon instead of an agent.
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub allow_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DockerOption {
    pub image: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
}

impl DockerOption {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            entrypoint: Vec::new(),
            user: None,
            network: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AgentSelector {
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

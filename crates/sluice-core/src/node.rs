//! Pipeline node tree.
//!
//! A [`NodeTree`] is the arena form of a [`PipelineDefinition`]: one flow
//! node, its stages and their steps, addressed by [`NodeKey`] and named by a
//! slash-separated [`NodePath`] such as `build/test/unit`.

use crate::pipeline::{AgentSelector, DockerOption, PipelineDefinition};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Index;
use std::str::FromStr;

pub const PATH_SEPARATOR: char = '/';
pub const MAX_DEPTH: usize = 10;
pub const MAX_NAME_LEN: usize = 100;
const RESERVED_CHARS: [char; 4] = ['*', ';', '.', PATH_SEPARATOR];

/// Hierarchical node identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodePath {
    segments: Vec<String>,
}

impl NodePath {
    pub fn root(name: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            segments: vec![name.to_string()],
        })
    }

    pub fn child(&self, name: &str) -> Result<Self> {
        validate_name(name)?;
        if self.segments.len() >= MAX_DEPTH {
            return Err(Error::InvalidNodeName {
                name: name.to_string(),
                reason: format!("path deeper than {}", MAX_DEPTH),
            });
        }
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(PATH_SEPARATOR);
        let first = parts.next().unwrap_or_default();
        let mut path = Self::root(first)?;
        for part in parts {
            path = path.child(part)?;
        }
        Ok(path)
    }

    /// Last segment.
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn parent(&self) -> Option<NodePath> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Strict prefix test.
    pub fn is_ancestor_of(&self, other: &NodePath) -> bool {
        self.segments.len() < other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: String| Error::InvalidNodeName {
        name: name.to_string(),
        reason,
    };
    if name.trim().is_empty() {
        return Err(invalid("name is empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(invalid(format!("longer than {} characters", MAX_NAME_LEN)));
    }
    if let Some(c) = name.chars().find(|c| RESERVED_CHARS.contains(c)) {
        return Err(invalid(format!("contains reserved character '{}'", c)));
    }
    Ok(())
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", PATH_SEPARATOR)?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl FromStr for NodePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodePath {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<NodePath> for String {
    fn from(path: NodePath) -> Self {
        path.to_string()
    }
}

/// Index of a node inside its [`NodeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(usize);

impl NodeKey {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Flow,
    Stage,
    Step,
}

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub key: NodeKey,
    pub path: NodePath,
    pub kind: NodeKind,
    pub parent: Option<NodeKey>,
    pub children: Vec<NodeKey>,
    pub variables: BTreeMap<String, String>,
    pub condition: Option<String>,
    pub docker: Option<DockerOption>,
    pub agent: Option<AgentSelector>,
    pub depends_on: Vec<String>,
    pub parallel: bool,
    pub run: Option<String>,
    pub plugin: Option<String>,
    pub local: bool,
    pub timeout_secs: Option<u64>,
    pub allow_failure: bool,
}

impl Node {
    fn new(key: NodeKey, path: NodePath, kind: NodeKind, parent: Option<NodeKey>) -> Self {
        Self {
            key,
            path,
            kind,
            parent,
            children: Vec::new(),
            variables: BTreeMap::new(),
            condition: None,
            docker: None,
            agent: None,
            depends_on: Vec::new(),
            parallel: false,
            run: None,
            plugin: None,
            local: false,
            timeout_secs: None,
            allow_failure: false,
        }
    }

    pub fn name(&self) -> &str {
        self.path.name()
    }

    pub fn is_stage(&self) -> bool {
        self.kind == NodeKind::Stage
    }

    pub fn is_step(&self) -> bool {
        self.kind == NodeKind::Step
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

/// Arena of nodes in depth-first declaration order. The flow is always at
/// key 0.
#[derive(Debug, Clone)]
pub struct NodeTree {
    nodes: Vec<Node>,
    by_path: HashMap<NodePath, NodeKey>,
    definition: PipelineDefinition,
}

impl NodeTree {
    pub fn from_definition(definition: &PipelineDefinition) -> Result<Self> {
        if definition.stages.is_empty() {
            return Err(Error::InvalidPipeline(format!(
                "pipeline '{}' has no stages",
                definition.name
            )));
        }

        let mut tree = Self {
            nodes: Vec::new(),
            by_path: HashMap::new(),
            definition: definition.clone(),
        };

        let root_path = NodePath::root(&definition.name)?;
        let root = tree.push(root_path, NodeKind::Flow, None)?;
        {
            let node = &mut tree.nodes[root.0];
            node.variables = definition.variables.clone();
            node.condition = definition.condition.clone();
            node.docker = definition.docker.clone();
            node.agent = definition.agent.clone();
        }

        for stage in &definition.stages {
            let path = tree.nodes[root.0].path.child(&stage.name)?;
            if stage.steps.is_empty() {
                return Err(Error::InvalidPipeline(format!("stage {} has no steps", path)));
            }
            let stage_key = tree.push(path, NodeKind::Stage, Some(root))?;
            {
                let node = &mut tree.nodes[stage_key.0];
                node.depends_on = stage.depends_on.clone();
                node.condition = stage.condition.clone();
                node.variables = stage.variables.clone();
                node.docker = stage.docker.clone();
                node.agent = stage.agent.clone();
                node.parallel = stage.parallel;
            }

            for step in &stage.steps {
                let path = tree.nodes[stage_key.0].path.child(&step.name)?;
                if step.run.is_none() && step.plugin.is_none() {
                    return Err(Error::InvalidPipeline(format!(
                        "step {} has neither run nor plugin",
                        path
                    )));
                }
                let step_key = tree.push(path, NodeKind::Step, Some(stage_key))?;
                let node = &mut tree.nodes[step_key.0];
                node.depends_on = step.depends_on.clone();
                node.condition = step.condition.clone();
                node.variables = step.variables.clone();
                node.docker = step.docker.clone();
                node.agent = step.agent.clone();
                node.run = step.run.clone();
                node.plugin = step.plugin.clone();
                node.local = step.local;
                node.timeout_secs = step.timeout_secs;
                node.allow_failure = step.allow_failure;
            }
        }

        Ok(tree)
    }

    fn push(&mut self, path: NodePath, kind: NodeKind, parent: Option<NodeKey>) -> Result<NodeKey> {
        if self.by_path.contains_key(&path) {
            return Err(Error::DuplicateNode(path.to_string()));
        }
        let key = NodeKey(self.nodes.len());
        self.by_path.insert(path.clone(), key);
        self.nodes.push(Node::new(key, path, kind, parent));
        if let Some(parent) = parent {
            self.nodes[parent.0].children.push(key);
        }
        Ok(key)
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn get(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(key.0)
    }

    pub fn find(&self, path: &NodePath) -> Option<&Node> {
        self.by_path.get(path).map(|key| &self.nodes[key.0])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ancestors from the direct parent up to the flow.
    pub fn ancestors(&self, key: NodeKey) -> impl Iterator<Item = &Node> + '_ {
        std::iter::successors(self.nodes[key.0].parent.map(|p| &self.nodes[p.0]), |node| {
            node.parent.map(|p| &self.nodes[p.0])
        })
    }

    /// Variables merged from the flow down to `key`; inner values win.
    pub fn effective_variables(&self, key: NodeKey) -> BTreeMap<String, String> {
        let mut chain: Vec<&Node> = self.ancestors(key).collect();
        chain.reverse();
        chain.push(&self.nodes[key.0]);

        let mut merged = BTreeMap::new();
        for node in chain {
            for (k, v) in &node.variables {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    /// Docker option of the node or its nearest ancestor that has one.
    pub fn effective_docker(&self, key: NodeKey) -> Option<&DockerOption> {
        let node = &self.nodes[key.0];
        node.docker
            .as_ref()
            .or_else(|| self.ancestors(key).find_map(|n| n.docker.as_ref()))
    }

    /// Nearest zone and nearest non-empty tag set.
    pub fn effective_agent(&self, key: NodeKey) -> AgentSelector {
        let node = &self.nodes[key.0];
        let chain = || std::iter::once(node).chain(self.ancestors(key));
        let zone = chain().find_map(|n| n.agent.as_ref().and_then(|a| a.zone.clone()));
        let tags = chain()
            .find_map(|n| n.agent.as_ref().filter(|a| !a.tags.is_empty()).map(|a| a.tags.clone()))
            .unwrap_or_default();
        AgentSelector { zone, tags }
    }
}

impl Index<NodeKey> for NodeTree {
    type Output = Node;

    fn index(&self, key: NodeKey) -> &Node {
        &self.nodes[key.0]
    }
}

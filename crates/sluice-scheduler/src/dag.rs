//! Pipeline graph compiler.
//!
//! Turns a [`NodeTree`] into an [`ExecutionGraph`]: a DAG with one vertex per
//! node, where an edge `a -> b` means `b` may only start once `a` finished.
//!
//! Linking rules, per container (flow or stage), in declaration order:
//! - a child without dependencies follows its container if it is the first
//!   child or the container is parallel, otherwise it follows the tails of
//!   its previous sibling;
//! - a child with dependencies follows the tails of each dependency, and
//!   also its container when none of the dependencies is a sibling.
//!
//! The tails of a leaf are the leaf itself; the tails of a container are
//! its leaf descendants with no successor inside the container.

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use sluice_core::node::{Node, NodeKey, NodeKind, NodePath, NodeTree};
use sluice_core::pipeline::{AgentSelector, DockerOption, PipelineDefinition};
use sluice_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Index;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Derived from nesting and declaration order.
    Structural,
    /// Declared with `depends_on`.
    Dependency,
}

/// A vertex of the execution graph with its inherited settings resolved.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub node: Node,
    pub variables: BTreeMap<String, String>,
    pub docker: Option<DockerOption>,
    pub agent: AgentSelector,
}

impl GraphNode {
    pub fn path(&self) -> &NodePath {
        &self.node.path
    }

    pub fn is_stage(&self) -> bool {
        self.node.is_stage()
    }

    pub fn is_step(&self) -> bool {
        self.node.is_step()
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    graph: DiGraph<GraphNode, EdgeKind>,
    by_path: HashMap<NodePath, NodeIndex>,
    order: Vec<NodeIndex>,
    definition: PipelineDefinition,
}

impl ExecutionGraph {
    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// The flow vertex.
    pub fn root(&self) -> NodeIndex {
        NodeIndex::new(0)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn find(&self, path: &NodePath) -> Option<NodeIndex> {
        self.by_path.get(path).copied()
    }

    pub fn get(&self, idx: NodeIndex) -> Option<&GraphNode> {
        self.graph.node_weight(idx)
    }

    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Direct predecessors in declaration order.
    pub fn parents(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(idx, Direction::Incoming)
    }

    /// Direct successors in declaration order.
    pub fn children(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(idx, Direction::Outgoing)
    }

    fn neighbors(&self, idx: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn edge_kind(&self, from: NodeIndex, to: NodeIndex) -> Option<EdgeKind> {
        self.graph
            .find_edge(from, to)
            .and_then(|e| self.graph.edge_weight(e))
            .copied()
    }

    /// Vertices without predecessors.
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    pub fn topological_order(&self) -> &[NodeIndex] {
        &self.order
    }

    /// Enclosing flow or stage vertex.
    pub fn container_of(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.graph[idx].node.parent.map(index_of)
    }

    /// Condition scripts referenced anywhere in the graph.
    pub fn conditions(&self) -> BTreeSet<&str> {
        self.graph
            .node_weights()
            .filter_map(|n| n.node.condition.as_deref())
            .collect()
    }

    /// Plugin names referenced anywhere in the graph.
    pub fn plugins(&self) -> BTreeSet<&str> {
        self.graph
            .node_weights()
            .filter_map(|n| n.node.plugin.as_deref())
            .collect()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let path = |idx: NodeIndex| self.graph[idx].path().clone();
        GraphSnapshot {
            pipeline: self.definition.name.clone(),
            nodes: self
                .graph
                .node_indices()
                .map(|idx| SnapshotNode {
                    path: path(idx),
                    kind: self.graph[idx].node.kind,
                    parents: self.parents(idx).into_iter().map(path).collect(),
                    children: self.children(idx).into_iter().map(path).collect(),
                })
                .collect(),
        }
    }
}

impl Index<NodeIndex> for ExecutionGraph {
    type Output = GraphNode;

    fn index(&self, idx: NodeIndex) -> &GraphNode {
        &self.graph[idx]
    }
}

/// Serializable view of a compiled graph: paths and edges only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub pipeline: String,
    pub nodes: Vec<SnapshotNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub path: NodePath,
    pub kind: NodeKind,
    pub parents: Vec<NodePath>,
    pub children: Vec<NodePath>,
}

/// Vertices are inserted in tree order, so key and index coincide.
fn index_of(key: NodeKey) -> NodeIndex {
    NodeIndex::new(key.index())
}

#[derive(Debug, Default)]
pub struct GraphCompiler;

impl GraphCompiler {
    pub fn new() -> Self {
        Self
    }

    pub fn compile(&self, tree: &NodeTree) -> Result<ExecutionGraph> {
        let mut graph = DiGraph::with_capacity(tree.len(), tree.len());
        let mut by_path = HashMap::with_capacity(tree.len());

        for node in tree.nodes() {
            let idx = graph.add_node(GraphNode {
                node: node.clone(),
                variables: tree.effective_variables(node.key),
                docker: tree.effective_docker(node.key).cloned(),
                agent: tree.effective_agent(node.key),
            });
            by_path.insert(node.path.clone(), idx);
        }

        let mut cross: Vec<(NodeKey, NodeKey)> = Vec::new();

        // Stages before the flow, so stage tails exist when stages are chained.
        let mut containers: Vec<&Node> = tree.nodes().iter().filter(|n| n.is_stage()).collect();
        containers.push(tree.root());

        for container in containers {
            let mut previous: Option<NodeKey> = None;
            for &child in &container.children {
                let node = &tree[child];
                let mut parents = Vec::new();

                if node.depends_on.is_empty() {
                    match previous {
                        Some(prev) if !container.parallel => parents.extend(tails(tree, &graph, prev)),
                        _ => parents.push(index_of(container.key)),
                    }
                } else {
                    let mut has_sibling = false;
                    for dep in &node.depends_on {
                        let target = resolve(tree, node, dep)?;
                        check_conflict(tree, node, target, dep)?;
                        if tree[target].parent == node.parent {
                            has_sibling = true;
                            parents.extend(tails(tree, &graph, target));
                        } else {
                            cross.push((target, child));
                        }
                    }
                    if !has_sibling {
                        parents.push(index_of(container.key));
                    }
                }

                for parent in parents {
                    let kind = if node.depends_on.is_empty() || parent == index_of(container.key) {
                        EdgeKind::Structural
                    } else {
                        EdgeKind::Dependency
                    };
                    link(&mut graph, parent, index_of(child), kind);
                }
                previous = Some(child);
            }
        }

        // Tails only look at edges inside a container, so edges between
        // containers can be added after every container is linked.
        let cross_edges: Vec<(NodeIndex, NodeIndex)> = cross
            .iter()
            .flat_map(|&(target, child)| {
                tails(tree, &graph, target)
                    .into_iter()
                    .map(move |t| (t, index_of(child)))
            })
            .collect();
        for (from, to) in cross_edges {
            link(&mut graph, from, to, EdgeKind::Dependency);
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(Error::CyclicGraph {
                path: cycle.iter().map(|&idx| graph[idx].path().to_string()).collect(),
            });
        }

        let order = toposort(&graph, None).map_err(|c| Error::CyclicGraph {
            path: vec![graph[c.node_id()].path().to_string()],
        })?;

        debug!(
            pipeline = %tree.definition().name,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "Compiled execution graph"
        );

        Ok(ExecutionGraph {
            graph,
            by_path,
            order,
            definition: tree.definition().clone(),
        })
    }
}

fn link(graph: &mut DiGraph<GraphNode, EdgeKind>, from: NodeIndex, to: NodeIndex, kind: EdgeKind) {
    if graph.find_edge(from, to).is_none() {
        graph.add_edge(from, to, kind);
    }
}

/// Sibling name first, then a path relative to the flow (`stage/step`).
fn resolve(tree: &NodeTree, node: &Node, dep: &str) -> Result<NodeKey> {
    let unknown = || Error::UnknownDependency {
        node: node.path.to_string(),
        dependency: dep.to_string(),
    };

    if let Some(parent) = node.parent
        && let Some(&sibling) = tree[parent].children.iter().find(|&&c| tree[c].name() == dep)
    {
        return Ok(sibling);
    }

    let mut path = tree.root().path.clone();
    for segment in dep.split('/') {
        path = path.child(segment).map_err(|_| unknown())?;
    }
    tree.find(&path).map(|n| n.key).ok_or_else(unknown)
}

fn check_conflict(tree: &NodeTree, node: &Node, target: NodeKey, dep: &str) -> Result<()> {
    let target = &tree[target];
    let reason = if target.key == node.key {
        Some("a node cannot depend on itself")
    } else if target.path.is_ancestor_of(&node.path) {
        Some("dependency is an enclosing node")
    } else if node.path.is_ancestor_of(&target.path) {
        Some("dependency is nested inside the node")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(Error::DependencyConflict {
            node: node.path.to_string(),
            dependency: dep.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn tails(tree: &NodeTree, graph: &DiGraph<GraphNode, EdgeKind>, key: NodeKey) -> Vec<NodeIndex> {
    let node = &tree[key];
    if node.children.is_empty() {
        return vec![index_of(key)];
    }

    let mut out = Vec::new();
    let mut stack: Vec<NodeKey> = node.children.iter().rev().copied().collect();
    while let Some(current) = stack.pop() {
        let descendant = &tree[current];
        if !descendant.children.is_empty() {
            stack.extend(descendant.children.iter().rev().copied());
            continue;
        }
        let has_inner_successor = graph
            .neighbors_directed(index_of(current), Direction::Outgoing)
            .any(|n| node.path.is_ancestor_of(graph[n].path()));
        if !has_inner_successor {
            out.push(index_of(current));
        }
    }
    out
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Three-colour depth-first search. Returns the vertices of the first cycle
/// found, with the entry vertex repeated at the end.
fn find_cycle(graph: &DiGraph<GraphNode, EdgeKind>) -> Option<Vec<NodeIndex>> {
    let mut marks = vec![Mark::White; graph.node_count()];
    let mut stack = Vec::new();

    for start in graph.node_indices() {
        if marks[start.index()] == Mark::White
            && let Some(cycle) = visit(graph, start, &mut marks, &mut stack)
        {
            return Some(cycle);
        }
    }
    None
}

fn visit(
    graph: &DiGraph<GraphNode, EdgeKind>,
    idx: NodeIndex,
    marks: &mut [Mark],
    stack: &mut Vec<NodeIndex>,
) -> Option<Vec<NodeIndex>> {
    marks[idx.index()] = Mark::Gray;
    stack.push(idx);

    let mut next: Vec<NodeIndex> = graph.neighbors_directed(idx, Direction::Outgoing).collect();
    next.sort();

    for n in next {
        match marks[n.index()] {
            Mark::Gray => {
                let start = stack.iter().position(|&s| s == n).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(n);
                return Some(cycle);
            }
            Mark::White => {
                if let Some(cycle) = visit(graph, n, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Black => {}
        }
    }

    stack.pop();
    marks[idx.index()] = Mark::Black;
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(yaml: &str) -> Result<ExecutionGraph> {
        let def: PipelineDefinition = serde_yaml::from_str(yaml).unwrap();
        let tree = NodeTree::from_definition(&def)?;
        GraphCompiler::new().compile(&tree)
    }

    fn paths(graph: &ExecutionGraph, idxs: Vec<NodeIndex>) -> Vec<String> {
        idxs.into_iter().map(|i| graph[i].path().to_string()).collect()
    }

    fn idx(graph: &ExecutionGraph, path: &str) -> NodeIndex {
        graph.find(&path.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_sequential_steps_chain() {
        let graph = compile(
            r#"
name: root
stages:
  - name: build
    steps:
      - { name: a, run: "true" }
      - { name: b, run: "true" }
"#,
        )
        .unwrap();

        assert_eq!(paths(&graph, graph.children(graph.root())), vec!["root/build"]);
        assert_eq!(paths(&graph, graph.parents(idx(&graph, "root/build/a"))), vec!["root/build"]);
        assert_eq!(paths(&graph, graph.parents(idx(&graph, "root/build/b"))), vec!["root/build/a"]);
        assert_eq!(graph.roots(), vec![graph.root()]);
    }

    #[test]
    fn test_parallel_stage_fans_out() {
        let graph = compile(
            r#"
name: root
stages:
  - name: test
    parallel: true
    steps:
      - { name: unit, run: "true" }
      - { name: lint, run: "true" }
  - name: deploy
    steps:
      - { name: ship, run: "true" }
"#,
        )
        .unwrap();

        let test = idx(&graph, "root/test");
        assert_eq!(
            paths(&graph, graph.children(test)),
            vec!["root/test/unit", "root/test/lint"]
        );
        assert_eq!(
            paths(&graph, graph.parents(idx(&graph, "root/deploy"))),
            vec!["root/test/unit", "root/test/lint"]
        );
    }

    #[test]
    fn test_dependency_on_stage_links_tails() {
        let graph = compile(
            r#"
name: root
stages:
  - name: one
    steps:
      - { name: a, run: "true" }
  - name: two
    depends_on: [one]
    steps:
      - { name: b, run: "true" }
  - name: three
    depends_on: [one]
    steps:
      - { name: c, run: "true" }
"#,
        )
        .unwrap();

        let one_a = idx(&graph, "root/one/a");
        assert_eq!(
            paths(&graph, graph.children(one_a)),
            vec!["root/two", "root/three"]
        );
        assert_eq!(
            graph.edge_kind(one_a, idx(&graph, "root/three")),
            Some(EdgeKind::Dependency)
        );
    }

    #[test]
    fn test_cross_stage_dependency_is_additive() {
        let graph = compile(
            r#"
name: root
stages:
  - name: build
    parallel: true
    steps:
      - { name: compile, run: "true" }
      - { name: docs, run: "true" }
  - name: test
    parallel: true
    steps:
      - { name: unit, run: "true", depends_on: [build/compile] }
"#,
        )
        .unwrap();

        let unit = idx(&graph, "root/test/unit");
        assert_eq!(
            paths(&graph, graph.parents(unit)),
            vec!["root/build/compile", "root/test"]
        );
    }

    #[test]
    fn test_sibling_dependency() {
        let graph = compile(
            r#"
name: root
stages:
  - name: build
    steps:
      - { name: a, run: "true" }
      - { name: b, run: "true" }
      - { name: c, run: "true", depends_on: [a] }
"#,
        )
        .unwrap();

        let build = idx(&graph, "root/build");
        assert_eq!(paths(&graph, graph.parents(idx(&graph, "root/build/c"))), vec!["root/build/a"]);
        assert_eq!(
            paths(&graph, graph.children(idx(&graph, "root/build/a"))),
            vec!["root/build/b", "root/build/c"]
        );
        assert!(graph.children(build).len() == 1);
    }

    #[test]
    fn test_unknown_dependency() {
        let err = compile(
            r#"
name: root
stages:
  - name: build
    steps:
      - { name: a, run: "true", depends_on: [nope] }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownDependency { dependency, .. } if dependency == "nope"));
    }

    #[test]
    fn test_dependency_on_enclosing_stage_conflicts() {
        let err = compile(
            r#"
name: root
stages:
  - name: build
    steps:
      - { name: a, run: "true", depends_on: [build] }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DependencyConflict { .. }));
    }

    #[test]
    fn test_cycle_names_nodes() {
        let err = compile(
            r#"
name: root
stages:
  - name: one
    depends_on: [two]
    steps:
      - { name: a, run: "true" }
  - name: two
    depends_on: [one]
    steps:
      - { name: b, run: "true" }
"#,
        )
        .unwrap_err();

        match err {
            Error::CyclicGraph { path } => {
                assert_eq!(path.first(), path.last());
                assert!(path.iter().any(|p| p == "root/one"));
                assert!(path.iter().any(|p| p == "root/two"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_conditions_and_plugins_collected() {
        let graph = compile(
            r#"
name: root
stages:
  - name: build
    condition: "return true"
    steps:
      - { name: a, plugin: slack-notify }
"#,
        )
        .unwrap();
        assert_eq!(graph.conditions().into_iter().collect::<Vec<_>>(), vec!["return true"]);
        assert_eq!(graph.plugins().into_iter().collect::<Vec<_>>(), vec!["slack-notify"]);
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let graph = compile(
            r#"
name: root
stages:
  - name: one
    steps:
      - { name: a, run: "true" }
      - { name: b, run: "true" }
  - name: two
    steps:
      - { name: c, run: "true" }
"#,
        )
        .unwrap();

        let order = graph.topological_order();
        let position = |i: NodeIndex| order.iter().position(|&o| o == i).unwrap();
        for i in graph.indices() {
            for child in graph.children(i) {
                assert!(position(i) < position(child));
            }
        }
        assert_eq!(order.len(), graph.len());
    }
}

//! `WorkflowGraph`: a labeled directed multigraph of tasks, enriched with the
//! routing metadata the composer computes (barriers, splits, cycle membership) and
//! the conductor consumes (criteria, duplicate-edge ref counts).

use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Join barrier policy for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Barrier {
    /// No barrier: any single truthy inbound edge fires the task.
    Unset,
    /// `join: all` — every inbound predecessor must be terminal.
    All,
    /// `join: N` — at least `N` predecessors must have fired a truthy edge.
    Count(u32),
}

/// Per-node attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default = "default_barrier")]
    pub barrier: Barrier,
    #[serde(default)]
    pub splits: Vec<String>,
    #[serde(default)]
    pub in_cycle: bool,
}

fn default_barrier() -> Barrier {
    Barrier::Unset
}

impl Node {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            barrier: Barrier::Unset,
            splits: Vec::new(),
            in_cycle: false,
        }
    }
}

/// Per-edge attributes: the ordered criteria that must all hold for the transition to
/// fire, and a ref count tracking how many spec entries produced this identical edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub criteria: Vec<String>,
    pub refs: u32,
}

impl Edge {
    fn new(criteria: Vec<String>) -> Self {
        Self { criteria, refs: 1 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    graph: DiGraph<Node, Edge>,
    index: HashMap<String, NodeIndex>,
}

impl WorkflowGraph {
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    #[must_use]
    pub fn has_task(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn add_task(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(Node::new(name));
        self.index.insert(name.to_string(), idx);
        idx
    }

    fn idx(&self, name: &str) -> Option<NodeIndex> {
        self.index.get(name).copied()
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.idx(name).map(|i| &self.graph[i])
    }

    pub fn set_barrier(&mut self, name: &str, barrier: Barrier) {
        if let Some(i) = self.idx(name) {
            self.graph[i].barrier = barrier;
        }
    }

    pub fn set_splits(&mut self, name: &str, splits: Vec<String>) {
        if let Some(i) = self.idx(name) {
            self.graph[i].splits = splits;
        }
    }

    pub fn set_in_cycle(&mut self, name: &str, in_cycle: bool) {
        if let Some(i) = self.idx(name) {
            self.graph[i].in_cycle = in_cycle;
        }
    }

    /// Find an existing transition `from -> to` whose criteria match exactly.
    #[must_use]
    pub fn find_transition(&self, from: &str, to: &str, criteria: &[String]) -> Option<EdgeIndex> {
        let (f, t) = (self.idx(from)?, self.idx(to)?);
        self.graph
            .edges_connecting(f, t)
            .find(|e| e.weight().criteria == criteria)
            .map(|e| e.id())
    }

    /// Add a new transition, or bump the ref count of an identical existing one.
    pub fn add_transition(&mut self, from: &str, to: &str, criteria: Vec<String>) {
        let f = self.add_task(from);
        let t = self.add_task(to);
        if let Some(existing) = self
            .graph
            .edges_connecting(f, t)
            .find(|e| e.weight().criteria == criteria)
            .map(|e| e.id())
        {
            self.graph[existing].refs += 1;
            return;
        }
        self.graph.add_edge(f, t, Edge::new(criteria));
    }

    #[must_use]
    pub fn task_names(&self) -> Vec<&str> {
        self.graph.node_weights().map(|n| n.name.as_str()).collect()
    }

    /// Predecessor `(name, criteria)` pairs for `name`, in insertion order.
    #[must_use]
    pub fn predecessors(&self, name: &str) -> Vec<(&str, &[String])> {
        let Some(i) = self.idx(name) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(i, petgraph::Direction::Incoming)
            .map(|e| (self.graph[e.source()].name.as_str(), e.weight().criteria.as_slice()))
            .collect()
    }

    /// Successor `(name, criteria)` pairs for `name`, in insertion order.
    #[must_use]
    pub fn successors(&self, name: &str) -> Vec<(&str, &[String])> {
        let Some(i) = self.idx(name) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(i, petgraph::Direction::Outgoing)
            .map(|e| (self.graph[e.target()].name.as_str(), e.weight().criteria.as_slice()))
            .collect()
    }

    #[must_use]
    pub fn is_start_task(&self, name: &str) -> bool {
        self.predecessors(name).is_empty()
    }

    #[must_use]
    pub fn start_tasks(&self) -> Vec<&str> {
        self.task_names()
            .into_iter()
            .filter(|n| self.is_start_task(n))
            .collect()
    }

    /// Nodes belonging to any strongly connected component with more than one member,
    /// or carrying a self-loop.
    #[must_use]
    pub fn cyclic_node_names(&self) -> std::collections::HashSet<String> {
        let mut out = std::collections::HashSet::new();
        for scc in petgraph::algo::tarjan_scc(&self.graph) {
            if scc.len() > 1 {
                for n in scc {
                    out.insert(self.graph[n].name.clone());
                }
            }
        }
        for e in self.graph.edge_references() {
            if e.source() == e.target() {
                out.insert(self.graph[e.source()].name.clone());
            }
        }
        out
    }

    /// Stable, isomorphism-independent serialization form:
    /// `{nodes: [...], adjacency: [[...], ...], graph: [[k, v], ...]}`, nodes sorted by
    /// id, per-node adjacency link lists sorted by target id.
    #[must_use]
    pub fn to_document(&self) -> GraphDocument {
        let mut order: Vec<NodeIndex> = self.graph.node_indices().collect();
        order.sort_by_key(|i| self.graph[*i].name.clone());

        let mut rank: HashMap<NodeIndex, usize> = HashMap::new();
        for (pos, idx) in order.iter().enumerate() {
            rank.insert(*idx, pos);
        }

        let nodes = order.iter().map(|i| self.graph[*i].clone()).collect();

        let adjacency = order
            .iter()
            .map(|i| {
                let mut links: Vec<AdjacencyLink> = self
                    .graph
                    .edges_directed(*i, petgraph::Direction::Outgoing)
                    .map(|e| AdjacencyLink {
                        target: rank[&e.target()],
                        edge: e.weight().clone(),
                    })
                    .collect();
                links.sort_by_key(|l| l.target);
                links
            })
            .collect();

        GraphDocument {
            nodes,
            adjacency,
            graph: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_document(doc: GraphDocument) -> Self {
        let mut g = WorkflowGraph::new();
        let mut indices = Vec::with_capacity(doc.nodes.len());
        for node in &doc.nodes {
            let idx = g.add_task(&node.name);
            g.graph[idx] = node.clone();
            indices.push(idx);
        }
        for (src_rank, links) in doc.adjacency.into_iter().enumerate() {
            for link in links {
                let (src, dst) = (indices[src_rank], indices[link.target]);
                g.graph.add_edge(src, dst, link.edge);
            }
        }
        g
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjacencyLink {
    pub target: usize,
    #[serde(flatten)]
    pub edge: Edge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDocument {
    pub nodes: Vec<Node>,
    pub adjacency: Vec<Vec<AdjacencyLink>>,
    #[serde(default)]
    pub graph: Vec<(String, String)>,
}

impl Serialize for WorkflowGraph {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_document().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WorkflowGraph {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let doc = GraphDocument::deserialize(deserializer)?;
        Ok(WorkflowGraph::from_document(doc))
    }
}

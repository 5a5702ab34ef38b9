//! Dependency graph of target prerequisites.
//!
//! Edges run `from -> to`, meaning `from` must reach a satisfying terminal
//! status before `to` may start. The graph is acyclic at all times: an
//! edge that would introduce a cycle is rejected atomically, leaving the
//! graph unchanged.

use std::collections::{HashMap, HashSet};

/// Errors from graph mutations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("unknown node: {0:?}")]
    UnknownNode(String),

    #[error("edge {from:?} -> {to:?} would create a cycle")]
    CycleDetected { from: String, to: String },
}

/// Tri-color marking used by the cycle check.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// A DAG over target names.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// Nodes in insertion order.
    nodes: Vec<String>,
    /// Forward adjacency: from -> set of successors.
    successors: HashMap<String, HashSet<String>>,
    /// Reverse adjacency: to -> set of predecessors.
    predecessors: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Adding an existing node is a no-op.
    pub fn add_node(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.successors.contains_key(&name) {
            self.nodes.push(name.clone());
            self.successors.insert(name.clone(), HashSet::new());
            self.predecessors.insert(name, HashSet::new());
        }
    }

    /// Add an edge `from -> to`. Both nodes must exist. If the edge would
    /// create a cycle the graph is left unchanged and an error returned.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        if !self.successors.contains_key(from) {
            return Err(GraphError::UnknownNode(from.to_owned()));
        }
        if !self.successors.contains_key(to) {
            return Err(GraphError::UnknownNode(to.to_owned()));
        }

        let inserted = self
            .successors
            .get_mut(from)
            .expect("checked above")
            .insert(to.to_owned());

        if inserted && self.has_cycle() {
            // Roll back the tentative edge.
            self.successors
                .get_mut(from)
                .expect("checked above")
                .remove(to);
            return Err(GraphError::CycleDetected {
                from: from.to_owned(),
                to: to.to_owned(),
            });
        }

        if inserted {
            self.predecessors
                .get_mut(to)
                .expect("checked above")
                .insert(from.to_owned());
        }
        Ok(())
    }

    /// Remove a node and all incident edges.
    pub fn remove_node(&mut self, name: &str) {
        if self.successors.remove(name).is_none() {
            return;
        }
        self.predecessors.remove(name);
        self.nodes.retain(|n| n != name);
        for set in self.successors.values_mut() {
            set.remove(name);
        }
        for set in self.predecessors.values_mut() {
            set.remove(name);
        }
    }

    /// Replace `old` with `new`, transferring every incident edge. Used
    /// when an alternative target is spliced in place of a failed one so
    /// dependents see the replacement as their predecessor.
    pub fn replace_node(&mut self, old: &str, new: impl Into<String>) -> Result<(), GraphError> {
        let new = new.into();
        let succs = self
            .successors
            .get(old)
            .cloned()
            .ok_or_else(|| GraphError::UnknownNode(old.to_owned()))?;
        let preds = self
            .predecessors
            .get(old)
            .cloned()
            .unwrap_or_default();

        self.remove_node(old);
        self.add_node(new.clone());
        for p in preds {
            // Edges re-inserted into a known-acyclic graph; the only way a
            // replace could cycle is a self-edge, which we drop.
            if p != new {
                self.add_edge(&p, &new)?;
            }
        }
        for s in succs {
            if s != new {
                self.add_edge(&new, &s)?;
            }
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.successors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct predecessors of a node, in unspecified order.
    pub fn predecessors(&self, name: &str) -> Vec<String> {
        self.predecessors
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct successors of a node, in unspecified order.
    pub fn successors(&self, name: &str) -> Vec<String> {
        self.successors
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every node reachable from `name` by following edges forward.
    pub fn descendants(&self, name: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<String> = self.successors(name);
        while let Some(node) = stack.pop() {
            if seen.insert(node.clone()) {
                stack.extend(self.successors(&node));
            }
        }
        seen
    }

    /// All edges as `(from, to)` pairs, ordered by source node insertion
    /// order with each node's successors sorted.
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for node in &self.nodes {
            if let Some(succs) = self.successors.get(node) {
                let mut sorted: Vec<&String> = succs.iter().collect();
                sorted.sort();
                for to in sorted {
                    edges.push((node.clone(), to.clone()));
                }
            }
        }
        edges
    }

    /// Nodes whose every predecessor is in `done` and which are not in
    /// `done` themselves, in node insertion order.
    pub fn ready_nodes(&self, done: &HashSet<String>) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| !done.contains(*n))
            .filter(|n| {
                self.predecessors
                    .get(*n)
                    .map(|preds| preds.iter().all(|p| done.contains(p)))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Cycle check via depth-first search with tri-color marking.
    pub fn has_cycle(&self) -> bool {
        let mut colors: HashMap<&str, Color> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), Color::White))
            .collect();

        for node in &self.nodes {
            if colors[node.as_str()] == Color::White && self.visit(node, &mut colors) {
                return true;
            }
        }
        false
    }

    /// DFS from `node` with an explicit stack. Returns true when a gray
    /// node is reached again (a back edge).
    fn visit<'a>(&'a self, node: &'a str, colors: &mut HashMap<&'a str, Color>) -> bool {
        // Stack frames: (node, entered). First visit pushes successors;
        // the second pass blackens the node.
        let mut stack: Vec<(&str, bool)> = vec![(node, false)];

        while let Some((current, entered)) = stack.pop() {
            if entered {
                colors.insert(current, Color::Black);
                continue;
            }
            match colors[current] {
                Color::Black => continue,
                Color::Gray => continue,
                Color::White => {}
            }
            colors.insert(current, Color::Gray);
            stack.push((current, true));

            if let Some(succs) = self.successors.get(current) {
                for next in succs {
                    match colors[next.as_str()] {
                        Color::Gray => return true,
                        Color::White => stack.push((next.as_str(), false)),
                        Color::Black => {}
                    }
                }
            }
        }
        false
    }
}

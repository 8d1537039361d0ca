//! Directed acyclic dependency graphs
//!
//! Adjacency is immutable after construction; acyclicity is validated with a
//! DFS before any task is persisted.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::task::DependencyKind;

/// Child -> parents adjacency over workflow node keys
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// child -> parents
    parents: HashMap<String, HashSet<String>>,

    /// parent -> children
    children: HashMap<String, HashSet<String>>,

    /// node -> how it waits on its parents
    kinds: HashMap<String, DependencyKind>,

    nodes: Vec<String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with its parent edges
    pub fn add_node(
        &mut self,
        node: impl Into<String>,
        parents: &[String],
        kind: DependencyKind,
    ) {
        let node = node.into();
        if !self.parents.contains_key(&node) {
            self.nodes.push(node.clone());
        }
        let entry = self.parents.entry(node.clone()).or_default();
        for parent in parents {
            entry.insert(parent.clone());
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(node.clone());
        }
        self.kinds.insert(node, kind);
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn parents_of(&self, node: &str) -> impl Iterator<Item = &String> {
        self.parents.get(node).into_iter().flatten()
    }

    pub fn children_of(&self, node: &str) -> impl Iterator<Item = &String> {
        self.children.get(node).into_iter().flatten()
    }

    pub fn kind_of(&self, node: &str) -> DependencyKind {
        self.kinds.get(node).copied().unwrap_or_default()
    }

    /// Find a cycle, returning the node where one was detected
    pub fn find_cycle(&self) -> Option<String> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut in_stack: HashSet<&str> = HashSet::new();

        fn dfs<'a>(
            graph: &'a DependencyGraph,
            node: &'a str,
            visited: &mut HashSet<&'a str>,
            in_stack: &mut HashSet<&'a str>,
        ) -> Option<String> {
            visited.insert(node);
            in_stack.insert(node);

            if let Some(children) = graph.children.get(node) {
                for child in children {
                    if in_stack.contains(child.as_str()) {
                        return Some(child.clone());
                    }
                    if !visited.contains(child.as_str()) {
                        if let Some(found) = dfs(graph, child, visited, in_stack) {
                            return Some(found);
                        }
                    }
                }
            }

            in_stack.remove(node);
            None
        }

        for node in &self.nodes {
            if !visited.contains(node.as_str()) {
                if let Some(found) = dfs(self, node, &mut visited, &mut in_stack) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Whether the graph contains a cycle
    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Nodes whose dependencies are satisfied by the completed set and that
    /// are not themselves completed
    pub fn ready_nodes(&self, completed: &HashSet<String>) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|node| !completed.contains(*node))
            .filter(|node| self.is_ready(node, completed))
            .cloned()
            .collect()
    }

    /// Readiness of one node against the completed set, per its kind
    pub fn is_ready(&self, node: &str, completed: &HashSet<String>) -> bool {
        let parents = match self.parents.get(node) {
            Some(p) if !p.is_empty() => p,
            _ => return true,
        };

        match self.kind_of(node) {
            DependencyKind::WaitForAll | DependencyKind::Sequential => {
                parents.iter().all(|p| completed.contains(p))
            }
            DependencyKind::WaitForAny => parents.iter().any(|p| completed.contains(p)),
        }
    }

    /// Topological order over all nodes
    ///
    /// The graph must be acyclic; call [`DependencyGraph::find_cycle`] first.
    pub fn topological_sort(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| {
                (
                    n.as_str(),
                    self.parents.get(n).map(|p| p.len()).unwrap_or(0),
                )
            })
            .collect();

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .filter(|n| in_degree[n.as_str()] == 0)
            .map(|n| n.as_str())
            .collect();
        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            result.push(node.to_string());
            if let Some(children) = self.children.get(node) {
                for child in children {
                    let degree = in_degree.get_mut(child.as_str()).expect("known node");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }

        result
    }

    /// Nodes grouped by execution level; each level can run in parallel
    ///
    /// Used for workflow metadata and visualization; correctness of the
    /// readiness protocol does not depend on it.
    pub fn execution_levels(&self) -> Vec<Vec<String>> {
        let sorted = self.topological_sort();
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut node_level: HashMap<String, usize> = HashMap::new();

        for node in sorted {
            let level = self
                .parents_of(&node)
                .map(|p| node_level.get(p).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);

            node_level.insert(node.clone(), level);
            while levels.len() <= level {
                levels.push(Vec::new());
            }
            levels[level].push(node);
        }

        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        graph.add_node("a", &[], DependencyKind::WaitForAll);
        graph.add_node("b", &["a".into()], DependencyKind::WaitForAll);
        graph.add_node("c", &["a".into()], DependencyKind::WaitForAll);
        graph.add_node("d", &["b".into(), "c".into()], DependencyKind::WaitForAll);
        graph
    }

    #[test]
    fn test_acyclic_diamond() {
        assert!(!diamond().has_cycle());
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = DependencyGraph::new();
        graph.add_node("a", &["c".into()], DependencyKind::WaitForAll);
        graph.add_node("b", &["a".into()], DependencyKind::WaitForAll);
        graph.add_node("c", &["b".into()], DependencyKind::WaitForAll);
        assert!(graph.has_cycle());
    }

    #[test]
    fn test_self_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_node("a", &["a".into()], DependencyKind::WaitForAll);
        assert!(graph.has_cycle());
    }

    #[test]
    fn test_ready_roots_only() {
        let graph = diamond();
        let ready = graph.ready_nodes(&HashSet::new());
        assert_eq!(ready, vec!["a".to_string()]);
    }

    #[test]
    fn test_ready_after_root_completes() {
        let graph = diamond();
        let completed: HashSet<String> = ["a".to_string()].into();
        let mut ready = graph.ready_nodes(&completed);
        ready.sort();
        assert_eq!(ready, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_wait_for_all_join() {
        let graph = diamond();

        let partial: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        assert!(!graph.is_ready("d", &partial));

        let full: HashSet<String> =
            ["a".to_string(), "b".to_string(), "c".to_string()].into();
        assert!(graph.is_ready("d", &full));
    }

    #[test]
    fn test_wait_for_any() {
        let mut graph = DependencyGraph::new();
        graph.add_node("a", &[], DependencyKind::WaitForAll);
        graph.add_node("b", &[], DependencyKind::WaitForAll);
        graph.add_node("c", &["a".into(), "b".into()], DependencyKind::WaitForAny);

        let one: HashSet<String> = ["a".to_string()].into();
        assert!(graph.is_ready("c", &one));
    }

    #[test]
    fn test_topological_sort_respects_edges() {
        let graph = diamond();
        let order = graph.topological_sort();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();

        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_execution_levels() {
        let graph = diamond();
        let levels = graph.execution_levels();

        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["a".to_string()]);
        let mut mid = levels[1].clone();
        mid.sort();
        assert_eq!(mid, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(levels[2], vec!["d".to_string()]);
    }
}

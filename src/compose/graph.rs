//! Service dependency graph
//!
//! Start ordering only guarantees that a dependency's process has been
//! launched before its dependents are; it says nothing about readiness.
//! Callers that need readiness register a probe with the orchestrator.

use super::config::ComposeConfig;
use crate::error::{Result, StackError};
use std::collections::{BTreeMap, BTreeSet};

/// Directed acyclic start-order graph
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// `edges[A] = {B, C}` means A depends on B and C
    edges: BTreeMap<String, BTreeSet<String>>,
    /// `reverse[A] = {B, C}` means B and C depend on A
    reverse: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for every service in `config`.
    ///
    /// Fails if a service depends on a name that is not defined.
    pub fn from_config(config: &ComposeConfig) -> Result<Self> {
        let mut graph = Self::new();

        for name in config.services.keys() {
            graph.add_node(name);
        }

        for (name, service) in &config.services {
            for dep in service.dependency_names() {
                if !config.services.contains_key(&dep) {
                    return Err(StackError::UnknownDependency {
                        service: name.clone(),
                        dependency: dep,
                    });
                }
                graph.add_edge(name, &dep);
            }
        }

        Ok(graph)
    }

    /// Add a node to the graph
    pub fn add_node(&mut self, name: &str) {
        self.edges.entry(name.to_string()).or_default();
        self.reverse.entry(name.to_string()).or_default();
    }

    /// Record that `from` depends on `to`
    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.add_node(from);
        self.add_node(to);

        if let Some(deps) = self.edges.get_mut(from) {
            deps.insert(to.to_string());
        }
        if let Some(dependents) = self.reverse.get_mut(to) {
            dependents.insert(from.to_string());
        }
    }

    /// Number of services in the graph
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Direct dependencies of a service
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.edges
            .get(name)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Services that directly depend on `name`
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.reverse
            .get(name)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All transitive dependencies of `name`, dependencies first
    pub fn transitive_dependencies(&self, name: &str) -> Vec<String> {
        let mut visited = BTreeSet::new();
        let mut result = Vec::new();
        self.visit_dependencies(name, &mut visited, &mut result);
        result.retain(|n| n != name);
        result
    }

    fn visit_dependencies(
        &self,
        node: &str,
        visited: &mut BTreeSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(node.to_string()) {
            return;
        }
        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                self.visit_dependencies(dep, visited, result);
            }
        }
        result.push(node.to_string());
    }

    /// Group services into waves.
    ///
    /// Every member of wave N depends only on members of earlier waves, so
    /// the members of one wave can be started in parallel. Within a wave,
    /// names are sorted.
    pub fn start_waves(&self) -> Result<Vec<Vec<String>>> {
        let mut remaining: BTreeMap<&str, usize> = self
            .edges
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let wave: Vec<String> = remaining
                .iter()
                .filter(|(_, &pending)| pending == 0)
                .map(|(name, _)| name.to_string())
                .collect();

            if wave.is_empty() {
                let cycle = self.find_cycle().unwrap_or_else(|| {
                    remaining.keys().map(|n| n.to_string()).collect()
                });
                return Err(StackError::CircularDependency(cycle));
            }

            for name in &wave {
                remaining.remove(name.as_str());
                for dependent in self.reverse.get(name).into_iter().flatten() {
                    if let Some(pending) = remaining.get_mut(dependent.as_str()) {
                        *pending -= 1;
                    }
                }
            }

            waves.push(wave);
        }

        Ok(waves)
    }

    /// Flat start order, dependencies first
    pub fn start_order(&self) -> Result<Vec<String>> {
        Ok(self.start_waves()?.into_iter().flatten().collect())
    }

    /// Stop order: dependents before their dependencies
    pub fn stop_order(&self) -> Result<Vec<String>> {
        let mut order = self.start_order()?;
        order.reverse();
        Ok(order)
    }

    /// Find one dependency cycle, returned as a closed path such as
    /// `[a, b, a]`
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut done = BTreeSet::new();
        for start in self.edges.keys() {
            let mut stack = Vec::new();
            if let Some(cycle) = self.cycle_from(start, &mut stack, &mut done) {
                return Some(cycle);
            }
        }
        None
    }

    fn cycle_from(
        &self,
        node: &str,
        stack: &mut Vec<String>,
        done: &mut BTreeSet<String>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|n| n == node) {
            let mut cycle = stack[pos..].to_vec();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if done.contains(node) {
            return None;
        }

        stack.push(node.to_string());
        for dep in self.edges.get(node).into_iter().flatten() {
            if let Some(cycle) = self.cycle_from(dep, stack, done) {
                return Some(cycle);
            }
        }
        stack.pop();
        done.insert(node.to_string());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ComposeParser;

    #[test]
    fn test_waves_for_leaves_and_root() {
        let yaml = r#"
services:
  server:
    image: app
    depends_on: [redis, mongo, elasticsearch]
  redis:
    image: redis
  mongo:
    image: mongo
  elasticsearch:
    image: elasticsearch
"#;
        let config = ComposeParser::parse_str(yaml).unwrap();
        let graph = DependencyGraph::from_config(&config).unwrap();

        let waves = graph.start_waves().unwrap();
        assert_eq!(
            waves,
            vec![
                vec!["elasticsearch".to_string(), "mongo".to_string(), "redis".to_string()],
                vec!["server".to_string()],
            ]
        );
        assert_eq!(graph.dependencies("server").len(), 3);
        assert_eq!(graph.dependents("redis"), vec!["server".to_string()]);
        assert_eq!(graph.stop_order().unwrap()[0], "server");
    }

    #[test]
    fn test_chain_order() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("web", "api");
        graph.add_edge("api", "db");

        assert_eq!(graph.start_order().unwrap(), vec!["db", "api", "web"]);
        assert_eq!(graph.transitive_dependencies("web"), vec!["db", "api"]);
    }

    #[test]
    fn test_cycle_is_rejected_with_path() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("b", "c");
        graph.add_edge("c", "a");
        graph.add_node("standalone");

        let err = graph.start_waves().unwrap_err();
        match err {
            StackError::CircularDependency(path) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "a");
        assert_eq!(graph.find_cycle(), Some(vec!["a".to_string(), "a".to_string()]));
        assert!(graph.start_order().is_err());
    }

    #[test]
    fn test_unknown_dependency() {
        let yaml = r#"
services:
  server:
    image: app
    depends_on: [cache]
"#;
        let config = ComposeParser::parse_str(yaml).unwrap();
        let err = DependencyGraph::from_config(&config).unwrap_err();
        assert!(matches!(err, StackError::UnknownDependency { .. }));
    }
}

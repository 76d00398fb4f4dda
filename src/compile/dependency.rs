use super::CompileError;
use crate::release::Package;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Orders packages so each one comes after all of its transitive dependencies.
///
/// Independent packages keep their relative input order.
#[derive(Debug, Default, Clone)]
pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn compilation_order<'a>(
        &self,
        packages: &'a [Package],
    ) -> Result<Vec<&'a Package>, CompileError> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut node_map: HashMap<&str, NodeIndex> = HashMap::new();

        for (position, package) in packages.iter().enumerate() {
            let node = graph.add_node(position);
            node_map.insert(package.name.as_str(), node);
        }

        // Edge from dependency to dependent
        for package in packages {
            let dependent = node_map[package.name.as_str()];
            for dependency in &package.dependencies {
                let Some(&dep_node) = node_map.get(dependency.as_str()) else {
                    return Err(CompileError::UnknownDependency {
                        package: package.name.clone(),
                        dependency: dependency.clone(),
                    });
                };
                graph.add_edge(dep_node, dependent, ());
            }
        }

        let mut in_degree: HashMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = graph
            .node_indices()
            .filter(|n| in_degree[n] == 0)
            .map(|n| Reverse(graph[n]))
            .collect();

        let mut order = Vec::with_capacity(packages.len());
        while let Some(Reverse(position)) = ready.pop() {
            order.push(&packages[position]);
            let node = NodeIndex::new(position);
            for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(graph[dependent]));
                    }
                }
            }
        }

        if order.len() != packages.len() {
            return Err(CompileError::DependencyCycle {
                packages: cycle_members(&graph, packages),
            });
        }

        Ok(order)
    }
}

fn cycle_members(graph: &DiGraph<usize, ()>, packages: &[Package]) -> Vec<String> {
    let mut members: Vec<String> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || scc.iter().any(|&n| graph.contains_edge(n, n)))
        .flatten()
        .map(|n| packages[graph[n]].name.clone())
        .collect();
    members.sort();
    members
}

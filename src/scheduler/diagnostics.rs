use std::fmt;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{Graph, NodeIndex};

use crate::engine::Entry;

/// Counters collected over one [`Scheduler::run`](crate::Scheduler::run).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    /// Passes over the queue.
    pub passes: usize,
    /// Entry runs, summed over all passes.
    pub runs: usize,
    /// Lookups rejected to get a stalled run moving again.
    pub lookups_cancelled: usize,
}

/// Who waits on whom, among a set of stalled entries.
///
/// Edges point from an entry to each unfinished task or resource it depends
/// on, when that dependency is part of the same set.
pub struct WaitGraph {
    graph: Graph<String, ()>,
}

impl WaitGraph {
    pub fn build(entries: &[Entry]) -> Self {
        let mut graph = Graph::new();
        let nodes: Vec<NodeIndex> = entries
            .iter()
            .map(|entry| graph.add_node(entry.name().to_string()))
            .collect();

        for (source, entry) in nodes.iter().zip(entries) {
            for dependency in entry.dependencies() {
                if dependency.finished() {
                    continue;
                }
                let target = entries.iter().position(|other| other.is(&dependency));
                if let Some(target) = target {
                    graph.update_edge(*source, nodes[target], ());
                }
            }
        }

        Self { graph }
    }

    /// Groups of entries that wait on each other, by name.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || self.graph.contains_edge(component[0], component[0])
            })
            .map(|component| {
                let mut names: Vec<String> =
                    component.into_iter().map(|index| self.graph[index].clone()).collect();
                names.sort();
                names
            })
            .collect()
    }
}

impl fmt::Display for WaitGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index())?;
        }

        Ok(())
    }
}

// Copyright 2025 the workhost authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cycle-detecting topological sort over named nodes.
//!
//! Visits `nodes` in insertion order so the resulting order is stable and
//! testable for a given input. Unknown dependency names are logged and
//! treated as no edge rather than failing the sort.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, WorkhostError};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Topologically sorts `nodes` given a map from node name to the names it
/// depends on. Returns an order in which every node appears after all of
/// its (known) dependencies.
pub fn sort(nodes: &[String], edges: &HashMap<String, Vec<String>>) -> Result<Vec<String>> {
    let known: HashSet<&str> = nodes.iter().map(|n| n.as_str()).collect();
    let mut marks: HashMap<&str, Mark> = nodes.iter().map(|n| (n.as_str(), Mark::Unvisited)).collect();
    let mut order = Vec::with_capacity(nodes.len());

    for node in nodes {
        visit(node, &known, edges, &mut marks, &mut order)?;
    }

    Ok(order)
}

fn visit<'a>(
    node: &'a str,
    known: &HashSet<&'a str>,
    edges: &'a HashMap<String, Vec<String>>,
    marks: &mut HashMap<&'a str, Mark>,
    order: &mut Vec<String>,
) -> Result<()> {
    match marks.get(node).copied() {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::InProgress) => return Err(WorkhostError::Cycle(node.to_string())),
        _ => {}
    }

    marks.insert(node, Mark::InProgress);

    if let Some(deps) = edges.get(node) {
        for dep in deps {
            if !known.contains(dep.as_str()) {
                tracing::warn!(node, dependency = %dep, "unknown dependency, treating as absent edge");
                continue;
            }
            visit(dep.as_str(), known, edges, marks, order)?;
        }
    }

    marks.insert(node, Mark::Done);
    order.push(node.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    fn edges(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn linear_chain_orders_dependencies_first() {
        let nodes = names(&["A", "B", "C", "D"]);
        let edges = edges(&[("B", &["A"]), ("C", &["B"]), ("D", &["A", "C"])]);

        let order = sort(&nodes, &edges).unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();

        assert!(pos("A") < pos("B"));
        assert!(pos("B") < pos("C"));
        assert!(pos("A") < pos("D"));
        assert!(pos("C") < pos("D"));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let nodes = names(&["A"]);
        let edges = edges(&[("A", &["A"])]);
        let err = sort(&nodes, &edges).unwrap_err();
        assert!(matches!(err, WorkhostError::Cycle(ref n) if n == "A"));
    }

    #[test]
    fn three_node_cycle_fails() {
        let nodes = names(&["X", "Y", "Z"]);
        let edges = edges(&[("X", &["Y"]), ("Y", &["Z"]), ("Z", &["X"])]);
        let err = sort(&nodes, &edges).unwrap_err();
        assert!(matches!(err, WorkhostError::Cycle(_)));
    }

    #[test]
    fn unknown_dependency_is_skipped_not_fatal() {
        let nodes = names(&["A"]);
        let edges = edges(&[("A", &["ghost"])]);
        let order = sort(&nodes, &edges).unwrap();
        assert_eq!(order, vec!["A".to_string()]);
    }

    #[test]
    fn insertion_order_breaks_ties() {
        let nodes = names(&["C", "B", "A"]);
        let edges = HashMap::new();
        let order = sort(&nodes, &edges).unwrap();
        assert_eq!(order, vec!["C".to_string(), "B".to_string(), "A".to_string()]);
    }
}

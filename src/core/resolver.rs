//! TW-004: Dependency DAG construction and limit projection.
//!
//! Every remote reference is an edge `source → dependent`. Cycles are found
//! by DFS so the reported path is concrete; the order itself comes from Kahn's
//! algorithm with declaration-order tie-breaking (a min-heap over the index).

use super::error::WorkerError;
use super::types::Definition;
use indexmap::IndexMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Adjacency lists indexed by declaration position.
struct Graph<'a> {
    names: Vec<&'a str>,
    /// source → dependents, sorted and deduplicated
    dependents: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
}

fn build_graph(definitions: &IndexMap<String, Definition>) -> Result<Graph<'_>, WorkerError> {
    let names: Vec<&str> = definitions.keys().map(String::as_str).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
    let mut in_degree = vec![0usize; names.len()];

    for (idx, (name, def)) in definitions.iter().enumerate() {
        for reference in def.remote_vars.values() {
            let src = definitions.get_index_of(&reference.source).ok_or_else(|| {
                WorkerError::UnknownReference {
                    definition: name.clone(),
                    reference: reference.source.clone(),
                }
            })?;
            if src == idx {
                return Err(WorkerError::Cycle {
                    path: vec![name.clone(), name.clone()],
                });
            }
            if !dependents[src].contains(&idx) {
                dependents[src].push(idx);
                in_degree[idx] += 1;
            }
        }
    }
    for list in &mut dependents {
        list.sort_unstable();
    }

    Ok(Graph {
        names,
        dependents,
        in_degree,
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// DFS with a recursion-stack marker. Returns a closed cycle path if any.
fn find_cycle(graph: &Graph<'_>) -> Option<Vec<String>> {
    let n = graph.names.len();
    let mut marks = vec![Mark::Unvisited; n];
    let mut stack: Vec<usize> = Vec::new();

    for root in 0..n {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        // Iterative DFS: (node, next child index)
        let mut frames: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Mark::OnStack;
        stack.push(root);

        while let Some(frame) = frames.last_mut() {
            let (node, child) = *frame;
            if let Some(&next) = graph.dependents[node].get(child) {
                frame.1 += 1;
                match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::OnStack;
                        stack.push(next);
                        frames.push((next, 0));
                    }
                    Mark::OnStack => {
                        let start = stack.iter().position(|&s| s == next).unwrap_or(0);
                        let mut path: Vec<String> = stack[start..]
                            .iter()
                            .map(|&i| graph.names[i].to_string())
                            .collect();
                        path.push(graph.names[next].to_string());
                        return Some(path);
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                stack.pop();
                frames.pop();
            }
        }
    }
    None
}

/// Build a topological execution order from remote references.
/// Among ready definitions, the earliest declared runs first.
pub fn build_execution_order(
    definitions: &IndexMap<String, Definition>,
) -> Result<Vec<String>, WorkerError> {
    let graph = build_graph(definitions)?;
    if let Some(path) = find_cycle(&graph) {
        return Err(WorkerError::Cycle { path });
    }

    let mut in_degree = graph.in_degree.clone();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(graph.names.len());
    while let Some(Reverse(current)) = ready.pop() {
        order.push(graph.names[current].to_string());
        for &next in &graph.dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    // find_cycle already rejected cycles, so every node is ordered
    if order.len() != graph.names.len() {
        let missing: Vec<String> = graph
            .names
            .iter()
            .filter(|n| !order.iter().any(|o| o == *n))
            .map(|n| n.to_string())
            .collect();
        return Err(WorkerError::Cycle { path: missing });
    }

    Ok(order)
}

/// The order after applying `--limit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    /// Definitions to run, in execution order
    pub selected: Vec<String>,
    /// (dependent, upstream) pairs whose upstream is not selected
    pub excluded_upstream: Vec<(String, String)>,
    pub warnings: Vec<String>,
}

/// Project `order` onto `limit`. An empty limit selects everything.
/// `always_include` definitions are selected regardless.
pub fn project_limit(
    order: &[String],
    definitions: &IndexMap<String, Definition>,
    limit: &[String],
) -> Result<Projection, WorkerError> {
    if limit.is_empty() {
        return Ok(Projection {
            selected: order.to_vec(),
            ..Projection::default()
        });
    }

    let unknown: Vec<&str> = limit
        .iter()
        .filter(|l| !definitions.contains_key(l.as_str()))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(WorkerError::Config(format!(
            "limit names unknown definition(s): {}",
            unknown.join(", ")
        )));
    }

    let selected: Vec<String> = order
        .iter()
        .filter(|name| {
            limit.contains(name)
                || definitions
                    .get(name.as_str())
                    .is_some_and(|d| d.always_include)
        })
        .cloned()
        .collect();

    let mut projection = Projection {
        selected,
        ..Projection::default()
    };
    for name in &projection.selected {
        let Some(def) = definitions.get(name) else {
            continue;
        };
        for upstream in def.upstream() {
            if !projection.selected.iter().any(|s| s == upstream) {
                projection
                    .excluded_upstream
                    .push((name.clone(), upstream.to_string()));
                projection.warnings.push(format!(
                    "definition '{}' depends on '{}' which is excluded by the limit; assuming its state exists",
                    name, upstream
                ));
            }
        }
    }

    Ok(projection)
}

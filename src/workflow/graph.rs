//! Dependency Graph
//!
//! The `needs` edges of a batch of steps, with cycle finding and
//! topological ordering.
//!
//! Edges point from a step to the steps it needs. Only edges between steps
//! of the same batch are kept; references to anything else (unknown ids,
//! children of expanded steps) are the validator's concern.

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;

use super::model::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// `needs` adjacency over a batch of steps, in declaration order.
#[derive(Debug, Clone)]
pub struct DependencyGraph<'a> {
    order: Vec<&'a str>,
    edges: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> DependencyGraph<'a> {
    /// Builds the graph. Duplicate ids keep their first declaration.
    pub fn from_steps(steps: &'a [Step]) -> Self {
        Self::from_edges(steps.iter().map(|s| (s.id.as_str(), s.needs.as_slice())))
    }

    /// Builds the graph from `(id, needs)` pairs in declaration order.
    pub fn from_edges<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let nodes: Vec<(&'a str, &'a [String])> = nodes.into_iter().collect();

        let mut order = Vec::with_capacity(nodes.len());
        let mut known = HashSet::new();
        for &(id, _) in &nodes {
            if known.insert(id) {
                order.push(id);
            }
        }

        let mut edges: HashMap<&'a str, Vec<&'a str>> = HashMap::new();
        for &(id, needs) in &nodes {
            let targets = edges.entry(id).or_default();
            for need in needs {
                if known.contains(need.as_str()) {
                    targets.push(need.as_str());
                }
            }
        }

        Self { order, edges }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Steps `id` needs, restricted to the batch.
    pub fn needs_of(&self, id: &str) -> &[&'a str] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns every cycle found by a depth-first traversal.
    ///
    /// Each cycle is a path such as `["a", "b", "c", "a"]` where every
    /// consecutive pair is a real `needs` edge and the path starts and ends
    /// at the same step.
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let mut marks: HashMap<&'a str, Mark> =
            self.order.iter().map(|id| (*id, Mark::Unvisited)).collect();
        let mut parent: HashMap<&'a str, &'a str> = HashMap::new();
        let mut cycles = Vec::new();

        for &id in &self.order {
            if marks[id] == Mark::Unvisited {
                visit(id, &self.edges, &mut marks, &mut parent, &mut cycles);
            }
        }

        cycles
    }

    /// Orders steps so that every step comes after the steps it needs.
    ///
    /// Uses Kahn's algorithm seeded in declaration order, so independent
    /// steps keep their relative order. On a cycle, returns the steps that
    /// could not be placed.
    pub fn topological_order(&self) -> Result<Vec<&'a str>, Vec<&'a str>> {
        let mut in_degree: HashMap<&'a str, usize> = HashMap::new();
        let mut dependents: HashMap<&'a str, Vec<&'a str>> = HashMap::new();

        for &id in &self.order {
            let needs = self.needs_of(id);
            in_degree.insert(id, needs.len());
            for &need in needs {
                dependents.entry(need).or_default().push(id);
            }
        }

        // Start with root nodes (in-degree = 0)
        let mut queue: VecDeque<&'a str> = self
            .order
            .iter()
            .copied()
            .filter(|id| in_degree[id] == 0)
            .collect();

        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(current) = queue.pop_front() {
            sorted.push(current);

            for &dependent in dependents.get(current).map(Vec::as_slice).unwrap_or_default() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if sorted.len() < self.order.len() {
            let placed: HashSet<&str> = sorted.iter().copied().collect();
            return Err(self
                .order
                .iter()
                .copied()
                .filter(|id| !placed.contains(id))
                .collect());
        }

        debug!("Topological order: {:?}", sorted);
        Ok(sorted)
    }
}

/// Depth-first walk from `root` on an explicit stack of `(node, next edge)`
/// frames, so chain length is bounded by heap rather than thread stack.
fn visit<'a>(
    root: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    parent: &mut HashMap<&'a str, &'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    marks.insert(root, Mark::Visiting);
    let mut stack: Vec<(&'a str, usize)> = vec![(root, 0)];

    while let Some(frame) = stack.last_mut() {
        let (node, index) = *frame;
        let needs = edges.get(node).map(Vec::as_slice).unwrap_or_default();

        let Some(&next) = needs.get(index) else {
            marks.insert(node, Mark::Visited);
            stack.pop();
            continue;
        };
        frame.1 += 1;

        match marks.get(next).copied().unwrap_or(Mark::Visited) {
            Mark::Unvisited => {
                parent.insert(next, node);
                marks.insert(next, Mark::Visiting);
                stack.push((next, 0));
            }
            Mark::Visiting => cycles.push(cycle_path(node, next, parent)),
            Mark::Visited => {}
        }
    }
}

/// Rebuilds `start → … → node → start` from the traversal's parent links,
/// given the back edge `node → start`.
fn cycle_path(node: &str, start: &str, parent: &HashMap<&str, &str>) -> Vec<String> {
    let mut path = vec![node.to_string()];
    let mut current = node;
    while current != start {
        match parent.get(current) {
            Some(&up) => {
                path.push(up.to_string());
                current = up;
            }
            None => break,
        }
    }
    path.reverse();
    path.push(start.to_string());
    path
}

/// Formats a cycle path for error messages (`a → b → a`).
pub fn format_cycle(path: &[String]) -> String {
    path.join(" → ")
}

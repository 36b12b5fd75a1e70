//! Dependency graph over declared units.
//!
//! Design:
//! - Forward edges: unit -> units it depends on
//! - Reverse edges: unit -> units that depend on it
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! The graph is rebuilt from the registry on every pass, because loading a
//! unit can reveal dependencies nobody knew about before.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::app::registry::Registry;
use crate::domain::UnitId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<UnitId, BTreeSet<UnitId>>,
    reverse_edges: BTreeMap<UnitId, BTreeSet<UnitId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every declared dependency in the registry.
    pub fn from_registry(registry: &Registry) -> Self {
        let mut graph = Self::new();
        for record in registry.records() {
            graph.edges.entry(record.id().clone()).or_default();
            for dep in record.dependency_slice() {
                graph.add_dependency(record.id().clone(), dep.clone());
            }
        }
        graph
    }

    /// `unit` depends on `depends_on`.
    pub fn add_dependency(&mut self, unit: UnitId, depends_on: UnitId) {
        self.edges
            .entry(unit.clone())
            .or_default()
            .insert(depends_on.clone());
        self.reverse_edges.entry(depends_on).or_default().insert(unit);
    }

    pub fn has_dependencies(&self, unit: &UnitId) -> bool {
        self.edges.get(unit).is_some_and(|deps| !deps.is_empty())
    }

    pub fn dependencies(&self, unit: &UnitId) -> Vec<UnitId> {
        self.edges
            .get(unit)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Units waiting for `unit`.
    pub fn dependents(&self, unit: &UnitId) -> Vec<UnitId> {
        self.reverse_edges
            .get(unit)
            .map(|waiting| waiting.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn depends_on(&self, unit: &UnitId, other: &UnitId) -> bool {
        self.edges.get(unit).is_some_and(|deps| deps.contains(other))
    }

    /// First pair of `nodes` that depend directly on each other.
    pub fn find_mutual_dependency(&self, nodes: &[UnitId]) -> Option<(UnitId, UnitId)> {
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                if self.depends_on(a, b) && self.depends_on(b, a) {
                    return Some((a.clone(), b.clone()));
                }
            }
        }
        None
    }

    /// Detect a cycle anywhere in the graph.
    ///
    /// Returns the cycle as a path whose first and last element are the same unit.
    pub fn detect_cycle(&self) -> Option<Vec<UnitId>> {
        self.detect_cycle_within(None)
    }

    /// Three-colour DFS, iterative so deep graphs cannot overflow the stack.
    fn detect_cycle_within(&self, within: Option<&BTreeSet<UnitId>>) -> Option<Vec<UnitId>> {
        let mut color: HashMap<&UnitId, Color> = HashMap::new();
        let mut path: Vec<&UnitId> = Vec::new();

        let starts: Vec<&UnitId> = match within {
            Some(set) => set.iter().collect(),
            None => self.edges.keys().collect(),
        };

        for start in starts {
            if color.get(start).copied().unwrap_or(Color::White) != Color::White {
                continue;
            }
            color.insert(start, Color::Gray);
            path.push(start);
            let mut stack: Vec<(&UnitId, Vec<&UnitId>)> =
                vec![(start, self.pending_edges(start, within))];

            loop {
                let Some(top) = stack.last_mut() else { break };
                let node = top.0;
                match top.1.pop() {
                    Some(next) => match color.get(next).copied().unwrap_or(Color::White) {
                        Color::Gray => {
                            let pos = path.iter().position(|n| *n == next).unwrap_or(0);
                            let mut cycle: Vec<UnitId> =
                                path[pos..].iter().map(|n| (*n).clone()).collect();
                            cycle.push(next.clone());
                            return Some(cycle);
                        }
                        Color::White => {
                            color.insert(next, Color::Gray);
                            path.push(next);
                            stack.push((next, self.pending_edges(next, within)));
                        }
                        Color::Black => {}
                    },
                    None => {
                        color.insert(node, Color::Black);
                        path.pop();
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    /// Outgoing edges of `node`, reversed so that `pop` visits them in id order.
    fn pending_edges<'g>(
        &'g self,
        node: &UnitId,
        within: Option<&BTreeSet<UnitId>>,
    ) -> Vec<&'g UnitId> {
        let mut deps: Vec<&UnitId> = self
            .edges
            .get(node)
            .map(|deps| {
                deps.iter()
                    .filter(|d| within.is_none_or(|set| set.contains(*d)))
                    .collect()
            })
            .unwrap_or_default();
        deps.reverse();
        deps
    }

    /// Order `candidates` so that every unit comes after the candidates it depends on.
    ///
    /// Among units with no ordering constraint, fewer declared dependencies comes
    /// first, then id order. This is a heuristic for building leaf-like units
    /// early, not a correctness guarantee for deep graphs.
    ///
    /// Returns the offending cycle if the candidates cannot be ordered.
    pub fn build_order(&self, candidates: &[UnitId]) -> Result<Vec<UnitId>, Vec<UnitId>> {
        let set: BTreeSet<UnitId> = candidates.iter().cloned().collect();
        let dep_count = |unit: &UnitId| self.edges.get(unit).map_or(0, BTreeSet::len);

        let mut in_degree: BTreeMap<&UnitId, usize> = set
            .iter()
            .map(|unit| {
                let count = self
                    .edges
                    .get(unit)
                    .map_or(0, |deps| deps.iter().filter(|d| set.contains(*d)).count());
                (unit, count)
            })
            .collect();

        let mut ready: BTreeSet<(usize, &UnitId)> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(unit, _)| (dep_count(unit), *unit))
            .collect();

        let mut order = Vec::with_capacity(set.len());
        while let Some(entry) = ready.pop_first() {
            let unit = entry.1;
            order.push(unit.clone());
            for dependent in self.reverse_edges.get(unit).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert((dep_count(dependent), set.get(dependent).unwrap_or(dependent)));
                    }
                }
            }
        }

        if order.len() == set.len() {
            return Ok(order);
        }

        let remaining: BTreeSet<UnitId> = set
            .into_iter()
            .filter(|unit| !order.contains(unit))
            .collect();
        Err(self
            .detect_cycle_within(Some(&remaining))
            .unwrap_or_else(|| remaining.into_iter().collect()))
    }
}

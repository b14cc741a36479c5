// src/testplan.rs

//! Test-plan generation over the migration chain
//!
//! Walks operate on a directed graph whose nodes are chain positions:
//! forward edges between neighbors, backward edges only where a plan
//! declares a backward change. Three walks are deterministic; the monkey
//! walk samples edges by weight to synthesize adversarial
//! migrate/rollback sequences.

use crate::error::{Error, Result};
use crate::plan::manager::PlanManager;
use crate::plan::MigrationSignature;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::collections::HashSet;
use std::str::FromStr;

/// Kind of test plan to generate or run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    SimpleForward,
    StepForward,
    StepForwardBackward,
    Monkey,
    /// Read the plan from a file instead of generating one (run only)
    Custom,
}

impl TestKind {
    pub fn as_str(&self) -> &str {
        match self {
            TestKind::SimpleForward => "simple-forward",
            TestKind::StepForward => "step-forward",
            TestKind::StepForwardBackward => "step-forward-backward",
            TestKind::Monkey => "monkey",
            TestKind::Custom => "custom",
        }
    }
}

impl FromStr for TestKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple-forward" => Ok(TestKind::SimpleForward),
            "step-forward" => Ok(TestKind::StepForward),
            "step-forward-backward" => Ok(TestKind::StepForwardBackward),
            "monkey" => Ok(TestKind::Monkey),
            "custom" => Ok(TestKind::Custom),
            _ => Err(Error::Usage(format!("unknown test plan type: {}", s))),
        }
    }
}

pub struct TestPlanGenerator {
    graph: DiGraph<(), ()>,
}

impl TestPlanGenerator {
    pub fn new(graph: DiGraph<(), ()>) -> Self {
        Self { graph }
    }

    fn max_node(&self) -> usize {
        self.graph.node_count().saturating_sub(1)
    }

    fn has_edge(&self, from: usize, to: usize) -> bool {
        self.graph
            .find_edge(NodeIndex::new(from), NodeIndex::new(to))
            .is_some()
    }

    /// Jump straight from the initial plan to the last one.
    pub fn simple_forward(&self) -> Vec<usize> {
        vec![0, self.max_node()]
    }

    /// Visit every plan in ascending order.
    pub fn step_forward(&self) -> Vec<usize> {
        (0..=self.max_node()).collect()
    }

    /// After each forward step, follow backward edges as far as they reach,
    /// then continue from the furthest plan visited so far.
    pub fn step_forward_backward(&self) -> Vec<usize> {
        let max = self.max_node();
        let mut result = Vec::new();
        let mut max_visited = 0;
        while max_visited <= max {
            let mut curr = max_visited;
            result.push(curr);
            max_visited += 1;
            while curr > 0 && self.has_edge(curr, curr - 1) {
                curr -= 1;
                result.push(curr);
            }
        }
        result
    }

    /// Weighted random walk of `walk_len` steps (default
    /// `(nodes - start) * 10`). Base edge weight 4, doubled into important
    /// nodes, halved into non-important ones, reduced by one for forward
    /// edges without a matching backward edge. A taken edge with weight
    /// above one is decremented, spreading later steps across the graph.
    pub fn monkey(
        &self,
        walk_len: Option<usize>,
        start: usize,
        important: &[usize],
        non_important: &[usize],
        rng: &mut impl Rng,
    ) -> Vec<usize> {
        let node_count = self.graph.node_count();
        let mut weighted = self.weighted_graph(start, important, non_important);

        let walk_len = walk_len.unwrap_or((node_count - start) * 10);
        let mut result = Vec::with_capacity(walk_len);
        let mut curr = start;
        for _ in 0..walk_len {
            result.push(curr);
            let succ: Vec<_> = weighted
                .edges(NodeIndex::new(curr))
                .map(|e| (e.id(), e.target().index(), *e.weight()))
                .collect();
            if succ.is_empty() {
                break;
            }
            let Ok(dist) = WeightedIndex::new(succ.iter().map(|(_, _, w)| *w as u32)) else {
                break;
            };
            let (edge_id, next, weight) = succ[dist.sample(rng)];
            if weight > 1 {
                if let Some(w) = weighted.edge_weight_mut(edge_id) {
                    *w -= 1;
                }
            }
            curr = next;
        }
        result
    }

    /// Build the weighted graph the monkey walk samples from. The start
    /// node's backward edges are dropped first, and the irreversibility
    /// penalty consults the pruned edge set, so a forward edge whose only
    /// reverse was just removed is penalized like any other one-way edge.
    fn weighted_graph(
        &self,
        start: usize,
        important: &[usize],
        non_important: &[usize],
    ) -> DiGraph<(), i32> {
        // never roll back below the starting plan
        let edges: Vec<(usize, usize)> = self
            .graph
            .edge_references()
            .map(|e| (e.source().index(), e.target().index()))
            .filter(|&(i, j)| !(i == start && j < start))
            .collect();
        let edge_set: HashSet<(usize, usize)> = edges.iter().copied().collect();

        let mut weighted: DiGraph<(), i32> = DiGraph::new();
        for _ in 0..self.graph.node_count() {
            weighted.add_node(());
        }
        for &(i, j) in &edges {
            let mut weight = 4i32;
            if important.contains(&j) {
                weight *= 2;
            }
            if non_important.contains(&j) {
                weight /= 2;
            }
            if i < j && !edge_set.contains(&(j, i)) {
                weight -= 1;
            }
            weighted.add_edge(NodeIndex::new(i), NodeIndex::new(j), weight);
        }
        weighted
    }
}

/// Render a walk of chain positions as `"{ver}_{name}"` strings.
pub fn walk_to_signatures(manager: &PlanManager, walk: &[usize]) -> Result<Vec<String>> {
    walk.iter()
        .map(|&idx| {
            manager
                .get(idx)
                .map(|p| p.sig().to_string())
                .ok_or_else(|| Error::Usage(format!("no migration plan at index {}", idx)))
        })
        .collect()
}

/// Resolve `"{ver}_{name}"` strings back to chain positions.
pub fn signatures_to_walk(manager: &PlanManager, sigs: &[String]) -> Result<Vec<usize>> {
    sigs.iter()
        .map(|s| {
            let sig: MigrationSignature = s.parse()?;
            Ok(manager.must_by_signature(&sig)?.0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Six plans; positions 0..=2 and 3..=5 are each fully reversible, but
    /// there is no backward edge from 3 to 2.
    fn simple_graph() -> TestPlanGenerator {
        let edges = [
            (0, 1),
            (1, 0),
            (1, 2),
            (2, 1),
            (2, 3),
            (3, 4),
            (4, 3),
            (4, 5),
            (5, 4),
        ];
        let mut graph = DiGraph::new();
        for _ in 0..6 {
            graph.add_node(());
        }
        for (i, j) in edges {
            graph.add_edge(NodeIndex::new(i), NodeIndex::new(j), ());
        }
        TestPlanGenerator::new(graph)
    }

    #[test]
    fn test_simple_forward() {
        assert_eq!(simple_graph().simple_forward(), vec![0, 5]);
    }

    #[test]
    fn test_step_forward() {
        assert_eq!(simple_graph().step_forward(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_step_forward_backward() {
        assert_eq!(
            simple_graph().step_forward_backward(),
            vec![0, 1, 0, 2, 1, 0, 3, 4, 3, 5, 4, 3]
        );
    }

    #[test]
    fn test_monkey_walk_constraints() {
        let generator = simple_graph();
        let mut rng = StdRng::seed_from_u64(42);
        let walk = generator.monkey(Some(20), 0, &[0, 5], &[], &mut rng);

        assert_eq!(walk.len(), 20);
        assert_eq!(walk[0], 0);
        for pair in walk.windows(2) {
            assert!(
                generator.has_edge(pair[0], pair[1]),
                "step {} -> {} is not an edge",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_monkey_never_rolls_back_below_start() {
        let generator = simple_graph();
        let mut rng = StdRng::seed_from_u64(7);
        let walk = generator.monkey(Some(20), 2, &[], &[], &mut rng);
        assert_eq!(walk[0], 2);
        // position 1 is only reachable through the removed 2 -> 1 edge
        assert!(walk.iter().all(|&n| n >= 2));
    }

    #[test]
    fn test_monkey_default_walk_len() {
        let generator = simple_graph();
        let mut rng = StdRng::seed_from_u64(1);
        let walk = generator.monkey(None, 0, &[], &[], &mut rng);
        assert_eq!(walk.len(), 60);
    }

    fn weight_of(graph: &DiGraph<(), i32>, from: usize, to: usize) -> i32 {
        let edge = graph
            .find_edge(NodeIndex::new(from), NodeIndex::new(to))
            .unwrap();
        *graph.edge_weight(edge).unwrap()
    }

    #[test]
    fn test_weighting_penalizes_edges_made_irreversible_by_pruning() {
        let generator = simple_graph();

        // starting at 0 prunes nothing: (0, 1) keeps its base weight
        // because the 1 -> 0 edge still exists, while (2, 3) was never
        // reversible and takes the penalty
        let weighted = generator.weighted_graph(0, &[], &[]);
        assert_eq!(weight_of(&weighted, 0, 1), 4);
        assert_eq!(weight_of(&weighted, 2, 3), 3);

        // starting at 1 drops the 1 -> 0 backward edge, so (0, 1) is now
        // one-way and must be penalized too
        let weighted = generator.weighted_graph(1, &[], &[]);
        assert!(weighted
            .find_edge(NodeIndex::new(1), NodeIndex::new(0))
            .is_none());
        assert_eq!(weight_of(&weighted, 0, 1), 3);
    }

    #[test]
    fn test_weighting_scales_important_and_non_important_targets() {
        let generator = simple_graph();
        let weighted = generator.weighted_graph(0, &[5], &[1]);

        // into an important node: reversible edge doubled from the base
        assert_eq!(weight_of(&weighted, 4, 5), 8);
        // into a non-important node: reversible edge halved from the base
        assert_eq!(weight_of(&weighted, 0, 1), 2);
    }

    #[test]
    fn test_kind_parse_round_trip() {
        for kind in [
            TestKind::SimpleForward,
            TestKind::StepForward,
            TestKind::StepForwardBackward,
            TestKind::Monkey,
            TestKind::Custom,
        ] {
            assert_eq!(kind.as_str().parse::<TestKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<TestKind>().is_err());
    }
}

// src/plan/manager.rs

//! Loading, ordering, and lookup of migration plans
//!
//! Versioned plans must form a single dependency chain rooted at the
//! initial plan; the manager validates that shape while sorting. Repeatable
//! plans are kept in a separate list (always present, possibly empty) and
//! only checked against the versioned signatures they depend on.

use crate::error::{Error, Result};
use crate::plan::{initial_signature, MigrationPlan, MigrationSignature, MigrationType};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Ordering algorithm for versioned plans. Dependency order is the
/// production default; version order exists for tests that construct
/// partial chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortAlg {
    #[default]
    Dependency,
    Version,
}

/// A range bound for [`PlanManager::between`]: either a position in the
/// sorted chain or a plan signature.
#[derive(Debug, Clone)]
pub enum PlanRef {
    Index(usize),
    Sig(MigrationSignature),
}

#[derive(Debug)]
pub struct PlanManager {
    plans: Vec<MigrationPlan>,
    repeatable_plans: Vec<MigrationPlan>,
}

impl PlanManager {
    /// Load every `*.json` plan under `plan_dir` in dependency order.
    pub fn load(plan_dir: &Path) -> Result<Self> {
        Self::load_with(plan_dir, SortAlg::Dependency)
    }

    pub fn load_with(plan_dir: &Path, alg: SortAlg) -> Result<Self> {
        let mut versioned = Vec::new();
        let mut repeatable = Vec::new();
        let mut entries: Vec<_> = fs::read_dir(plan_dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
        entries.sort();
        for path in entries {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let plan = MigrationPlan::load(&path)?;
            if plan.plan_type == MigrationType::Repeatable {
                repeatable.push(plan);
            } else {
                versioned.push(plan);
            }
        }
        Self::from_plans(versioned, repeatable, alg)
    }

    /// Build a manager from pre-read plans. Both lists are always kept,
    /// even when empty.
    pub fn from_plans(
        versioned: Vec<MigrationPlan>,
        repeatable: Vec<MigrationPlan>,
        alg: SortAlg,
    ) -> Result<Self> {
        let plans = match alg {
            SortAlg::Dependency => sort_by_dependency(versioned)?,
            SortAlg::Version => sort_by_version(versioned),
        };
        check_repeatable_dependencies(&plans, &repeatable)?;
        Ok(Self {
            plans,
            repeatable_plans: repeatable,
        })
    }

    pub fn count(&self) -> usize {
        self.plans.len()
    }

    pub fn plans(&self) -> &[MigrationPlan] {
        &self.plans
    }

    pub fn get(&self, index: usize) -> Option<&MigrationPlan> {
        self.plans.get(index)
    }

    /// Latest plan in chain order, optionally restricted to one type.
    pub fn latest(&self, plan_type: Option<MigrationType>) -> Result<&MigrationPlan> {
        let found = match plan_type {
            None => self.plans.last(),
            Some(t) => self.plans.iter().rev().find(|p| p.plan_type == t),
        };
        found.ok_or_else(|| Error::Usage(format!("cannot find plan with type {:?}", plan_type)))
    }

    pub fn plans_of_type(&self, plan_type: MigrationType) -> Vec<&MigrationPlan> {
        self.plans.iter().filter(|p| p.plan_type == plan_type).collect()
    }

    /// All versioned plans matching the signature. A signature without a
    /// name matches any plan with that version.
    pub fn by_signature(&self, sig: &MigrationSignature) -> Vec<(usize, &MigrationPlan)> {
        self.plans
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.version == sig.version
                    && (sig.name.is_none() || sig.name.as_deref() == Some(p.name.as_str()))
            })
            .collect()
    }

    /// Exactly one plan for the signature, or a usage error.
    pub fn must_by_signature(&self, sig: &MigrationSignature) -> Result<(usize, &MigrationPlan)> {
        let mut matches = self.by_signature(sig);
        match matches.len() {
            0 => Err(Error::Usage(format!("cannot find plan for signature {}", sig))),
            1 => Ok(matches.remove(0)),
            _ => Err(Error::Usage(format!("found multiple plans for signature {}", sig))),
        }
    }

    /// Inclusive slice of the chain. Bounds default to the chain ends; an
    /// empty slice results when the bounds cross.
    pub fn between(&self, left: Option<PlanRef>, right: Option<PlanRef>) -> Result<&[MigrationPlan]> {
        let left_idx = match left {
            None => 0,
            Some(PlanRef::Index(i)) => i,
            Some(PlanRef::Sig(sig)) => self.must_by_signature(&sig)?.0,
        };
        let right_idx = match right {
            None => self.plans.len().saturating_sub(1),
            Some(PlanRef::Index(i)) => i,
            Some(PlanRef::Sig(sig)) => self.must_by_signature(&sig)?.0,
        };
        if self.plans.is_empty() || left_idx > right_idx {
            return Ok(&[]);
        }
        Ok(&self.plans[left_idx..=right_idx])
    }

    pub fn repeatable_plans(&self) -> &[MigrationPlan] {
        &self.repeatable_plans
    }

    pub fn must_repeatable_by_signature(&self, sig: &MigrationSignature) -> Result<&MigrationPlan> {
        self.repeatable_plans
            .iter()
            .find(|p| p.matches(sig))
            .ok_or_else(|| Error::Usage(format!("cannot find repeatable plan for {}", sig)))
    }

    /// Map from every versioned signature to the repeatable signatures
    /// declaring it as a dependency.
    pub fn repeatable_inverse_dependencies(
        &self,
    ) -> HashMap<MigrationSignature, Vec<MigrationSignature>> {
        let mut inverse: HashMap<MigrationSignature, Vec<MigrationSignature>> = HashMap::new();
        for plan in &self.repeatable_plans {
            for dep in &plan.dependencies {
                inverse.entry(dep.clone()).or_default().push(plan.sig());
            }
        }
        inverse
    }

    /// Graph over chain positions for the test-plan generator: a forward
    /// edge between neighbors, plus the reverse edge when the higher plan
    /// declares a backward change.
    pub fn dependency_graph(&self) -> DiGraph<(), ()> {
        let mut graph = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..self.plans.len()).map(|_| graph.add_node(())).collect();
        for idx in 1..self.plans.len() {
            graph.add_edge(nodes[idx - 1], nodes[idx], ());
            if self.plans[idx].change.backward.is_some() {
                graph.add_edge(nodes[idx], nodes[idx - 1], ());
            }
        }
        graph
    }
}

fn sort_by_version(mut plans: Vec<MigrationPlan>) -> Vec<MigrationPlan> {
    plans.sort_by_key(|p| p.version.parse::<u64>().unwrap_or(u64::MAX));
    plans
}

/// Topological sort of the dependency chain, validating the shape along the
/// way: unique signatures, a single initial plan, every dependency present,
/// no cycles, exactly one successor per non-terminal node, no disconnected
/// components.
fn sort_by_dependency(plans: Vec<MigrationPlan>) -> Result<Vec<MigrationPlan>> {
    if plans.is_empty() {
        return Err(Error::Integrity("cannot find initial migration plan".to_string()));
    }

    let mut graph: DiGraph<MigrationSignature, ()> = DiGraph::new();
    let mut node_of: HashMap<MigrationSignature, NodeIndex> = HashMap::new();
    let mut plan_of: HashMap<MigrationSignature, MigrationPlan> = HashMap::new();
    for plan in plans {
        let sig = plan.sig();
        if plan_of.contains_key(&sig) {
            return Err(Error::Integrity(format!("found duplicate migration plan {}", plan)));
        }
        node_of.insert(sig.clone(), graph.add_node(sig.clone()));
        plan_of.insert(sig, plan);
    }

    let initial = initial_signature();
    let Some(&start) = node_of.get(&initial) else {
        return Err(Error::Integrity("cannot find initial migration plan".to_string()));
    };

    for (sig, plan) in &plan_of {
        if plan.dependencies.is_empty() {
            if plan.is_initial() {
                continue;
            }
            return Err(Error::Integrity(format!("{} has no dependency", plan)));
        }
        // only the first dependency orders the chain, the rest are accepted
        // for forward compatibility
        let dep = &plan.dependencies[0];
        let Some(&dep_node) = node_of.get(dep) else {
            return Err(Error::Integrity(format!("cannot find dependency {} for {}", dep, plan)));
        };
        graph.add_edge(dep_node, node_of[sig], ());
    }

    if petgraph::algo::is_cyclic_directed(&graph) {
        return Err(Error::Integrity("dependency cycle detected".to_string()));
    }

    let mut sorted_sigs = Vec::with_capacity(plan_of.len());
    let mut dfs = Dfs::new(&graph, start);
    while let Some(node) = dfs.next(&graph) {
        let out_degree = graph.neighbors_directed(node, Direction::Outgoing).count();
        if out_degree == 0 && sorted_sigs.len() != plan_of.len() - 1 {
            return Err(Error::Integrity(format!(
                "cannot find next migration plan for {}",
                graph[node]
            )));
        }
        if out_degree > 1 {
            return Err(Error::Integrity(format!(
                "found multiple next migration plans for {}",
                graph[node]
            )));
        }
        sorted_sigs.push(graph[node].clone());
    }

    if sorted_sigs.len() != plan_of.len() {
        return Err(Error::Integrity(format!(
            "found {} sorted plans but expected {}",
            sorted_sigs.len(),
            plan_of.len()
        )));
    }

    let mut sorted = Vec::with_capacity(sorted_sigs.len());
    for sig in sorted_sigs {
        let plan = plan_of
            .remove(&sig)
            .ok_or_else(|| Error::Integrity(format!("plan lookup failed for {}", sig)))?;
        sorted.push(plan);
    }
    Ok(sorted)
}

fn check_repeatable_dependencies(
    versioned: &[MigrationPlan],
    repeatable: &[MigrationPlan],
) -> Result<()> {
    for plan in repeatable {
        if let Some(dep) = plan.dependencies.first() {
            if !versioned.iter().any(|p| p.matches(dep)) {
                return Err(Error::Integrity(format!(
                    "cannot find dependency {} for {}",
                    dep, plan
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Change, ChangeStep, SchemaChange};

    fn schema_plan(sig: &MigrationSignature, deps: Vec<MigrationSignature>) -> MigrationPlan {
        MigrationPlan::new(
            &sig.version,
            sig.name.as_deref().unwrap(),
            "",
            MigrationType::Schema,
            Change {
                forward: ChangeStep::Schema(SchemaChange {
                    id: String::new(),
                    precheck: None,
                    postcheck: None,
                }),
                backward: None,
            },
            deps,
        )
    }

    fn sigs() -> Vec<MigrationSignature> {
        vec![
            initial_signature(),
            MigrationSignature::new("0003", Some("1")),
            MigrationSignature::new("0002", Some("2")),
            MigrationSignature::new("0001", Some("3")),
        ]
    }

    #[test]
    fn test_dependency_sort_follows_chain_not_versions() {
        let s = sigs();
        let plans = vec![
            schema_plan(&s[3], vec![s[2].clone()]),
            schema_plan(&s[1], vec![s[0].clone()]),
            schema_plan(&s[2], vec![s[1].clone()]),
            schema_plan(&s[0], vec![]),
        ];
        let manager = PlanManager::from_plans(plans, vec![], SortAlg::Dependency).unwrap();
        let order: Vec<MigrationSignature> = manager.plans().iter().map(|p| p.sig()).collect();
        assert_eq!(order, vec![s[0].clone(), s[1].clone(), s[2].clone(), s[3].clone()]);
        // every consecutive pair is dependency -> dependent
        for pair in manager.plans().windows(2) {
            assert_eq!(pair[1].dependencies[0], pair[0].sig());
        }
    }

    #[test]
    fn test_duplicate_signature_fails() {
        let s = sigs();
        let plans = vec![
            schema_plan(&s[0], vec![]),
            schema_plan(&s[1], vec![s[0].clone()]),
            schema_plan(&s[1], vec![s[0].clone()]),
        ];
        let err = PlanManager::from_plans(plans, vec![], SortAlg::Dependency).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_missing_initial_plan_fails() {
        let s = sigs();
        let plans = vec![schema_plan(&s[1], vec![s[2].clone()]), schema_plan(&s[2], vec![s[1].clone()])];
        let err = PlanManager::from_plans(plans, vec![], SortAlg::Dependency).unwrap_err();
        assert!(err.to_string().contains("initial"));
    }

    #[test]
    fn test_dependency_cycle_fails() {
        let s = sigs();
        let plans = vec![
            schema_plan(&s[0], vec![]),
            schema_plan(&s[1], vec![s[2].clone()]),
            schema_plan(&s[2], vec![s[1].clone()]),
        ];
        let err = PlanManager::from_plans(plans, vec![], SortAlg::Dependency).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_missing_dependency_fails() {
        let s = sigs();
        let plans = vec![schema_plan(&s[0], vec![]), schema_plan(&s[1], vec![s[2].clone()])];
        let err = PlanManager::from_plans(plans, vec![], SortAlg::Dependency).unwrap_err();
        assert!(err.to_string().contains("cannot find dependency"));
    }

    #[test]
    fn test_branching_chain_fails() {
        let s = sigs();
        let plans = vec![
            schema_plan(&s[0], vec![]),
            schema_plan(&s[1], vec![s[0].clone()]),
            schema_plan(&s[2], vec![s[0].clone()]),
        ];
        let err = PlanManager::from_plans(plans, vec![], SortAlg::Dependency).unwrap_err();
        assert!(err.to_string().contains("multiple next"));
    }

    #[test]
    fn test_version_sort_orders_numerically() {
        let s = sigs();
        let plans = vec![
            schema_plan(&s[1], vec![]),
            schema_plan(&s[3], vec![]),
            schema_plan(&s[2], vec![]),
        ];
        let manager = PlanManager::from_plans(plans, vec![], SortAlg::Version).unwrap();
        let versions: Vec<&str> = manager.plans().iter().map(|p| p.version.as_str()).collect();
        assert_eq!(versions, vec!["0001", "0002", "0003"]);
    }

    #[test]
    fn test_between_bounds() {
        let s = sigs();
        let plans = vec![
            schema_plan(&s[0], vec![]),
            schema_plan(&s[1], vec![s[0].clone()]),
            schema_plan(&s[2], vec![s[1].clone()]),
            schema_plan(&s[3], vec![s[2].clone()]),
        ];
        let manager = PlanManager::from_plans(plans, vec![], SortAlg::Dependency).unwrap();

        assert_eq!(manager.between(None, None).unwrap().len(), 4);
        assert_eq!(
            manager
                .between(Some(PlanRef::Index(1)), Some(PlanRef::Sig(s[2].clone())))
                .unwrap()
                .len(),
            2
        );
        // crossed bounds mean nothing left to apply
        assert!(manager.between(Some(PlanRef::Index(4)), None).unwrap().is_empty());
    }

    #[test]
    fn test_signature_lookup_without_name() {
        let s = sigs();
        let plans = vec![schema_plan(&s[0], vec![]), schema_plan(&s[1], vec![s[0].clone()])];
        let manager = PlanManager::from_plans(plans, vec![], SortAlg::Dependency).unwrap();

        let (idx, plan) = manager
            .must_by_signature(&MigrationSignature::new("0003", None))
            .unwrap();
        assert_eq!(idx, 1);
        assert_eq!(plan.name, "1");

        assert!(manager
            .must_by_signature(&MigrationSignature::new("0009", None))
            .is_err());
    }

    #[test]
    fn test_repeatable_dependency_must_exist() {
        let s = sigs();
        let versioned = vec![schema_plan(&s[0], vec![])];
        let mut rep = schema_plan(&MigrationSignature::new("R", Some("seed")), vec![s[1].clone()]);
        rep.plan_type = MigrationType::Repeatable;
        let err = PlanManager::from_plans(versioned, vec![rep], SortAlg::Dependency).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_repeatable_inverse_dependencies() {
        let s = sigs();
        let versioned = vec![schema_plan(&s[0], vec![]), schema_plan(&s[1], vec![s[0].clone()])];
        let mut rep_a = schema_plan(&MigrationSignature::new("R", Some("a")), vec![s[1].clone()]);
        rep_a.plan_type = MigrationType::Repeatable;
        let mut rep_b = schema_plan(&MigrationSignature::new("R", Some("b")), vec![s[1].clone()]);
        rep_b.plan_type = MigrationType::Repeatable;

        let manager =
            PlanManager::from_plans(versioned, vec![rep_a, rep_b], SortAlg::Dependency).unwrap();
        let inverse = manager.repeatable_inverse_dependencies();
        let deps = inverse.get(&s[1]).unwrap();
        assert_eq!(deps.len(), 2);
        assert!(inverse.get(&s[0]).is_none());
    }

    #[test]
    fn test_dependency_graph_edges() {
        let s = sigs();
        let mut second = schema_plan(&s[1], vec![s[0].clone()]);
        second.change.backward = Some(ChangeStep::Schema(SchemaChange {
            id: String::new(),
            precheck: None,
            postcheck: None,
        }));
        let plans = vec![schema_plan(&s[0], vec![]), second, schema_plan(&s[2], vec![s[1].clone()])];
        let manager = PlanManager::from_plans(plans, vec![], SortAlg::Dependency).unwrap();

        let graph = manager.dependency_graph();
        assert_eq!(graph.node_count(), 3);
        // forward edges always, backward edge only where declared
        assert!(graph.find_edge(NodeIndex::new(0), NodeIndex::new(1)).is_some());
        assert!(graph.find_edge(NodeIndex::new(1), NodeIndex::new(0)).is_some());
        assert!(graph.find_edge(NodeIndex::new(2), NodeIndex::new(1)).is_none());
    }
}

//! AN-004: Plan build — order the graph, check templates, diff against the
//! prior snapshot.
//!
//! A `Plan` owns everything one run mutates: the dependency graph, the
//! per-node action chosen against the previous run, and the `PlanState`.

use super::resolver::{validate_templates, DependencyGraph};
use super::state::PlanState;
use super::types::*;
use crate::adapter::AdapterRegistry;
use crate::audit::eventlog::generate_run_id;
use crate::audit::hasher::hash_desired_state;
use indexmap::IndexMap;
use std::collections::HashMap;

/// A built plan, ready for the engine.
#[derive(Debug, Clone)]
pub struct Plan {
    graph: DependencyGraph,
    params: HashMap<String, serde_yaml_ng::Value>,
    actions: Vec<PlanAction>,
    descriptions: Vec<String>,
    state: PlanState,
}

impl Plan {
    /// Build an apply plan. `prior` is the last persisted snapshot, if any;
    /// its transition history and external ids carry forward.
    pub fn build(
        name: &str,
        specs: Vec<ResourceSpec>,
        params: HashMap<String, serde_yaml_ng::Value>,
        prior: Option<&PlanSnapshot>,
    ) -> Result<Self, PlanError> {
        let graph = DependencyGraph::build(&specs)?;
        validate_templates(&specs, &params)?;

        let mut actions = Vec::with_capacity(specs.len());
        let mut descriptions = Vec::with_capacity(specs.len());
        let mut nodes = IndexMap::with_capacity(specs.len());
        for spec in specs {
            let hash = hash_desired_state(&spec);
            let prev = prior.and_then(|p| p.nodes.get(&spec.id));
            let action = determine_action(&hash, prev);
            descriptions.push(describe_action(&spec, action, prev));
            actions.push(action);

            let external_id = match action {
                PlanAction::Verify | PlanAction::Update | PlanAction::Retry => {
                    prev.and_then(|p| p.external_id.clone())
                }
                PlanAction::Create => None,
            };
            nodes.insert(
                spec.id.clone(),
                ResourceNode {
                    spec,
                    state: NodeState::Pending,
                    attempts: 0,
                    last_error: None,
                    external_id,
                    hash,
                    blocked_by: None,
                },
            );
        }

        let history = prior.map(|p| p.transitions.clone()).unwrap_or_default();
        let state = PlanState::new(name, &generate_run_id(), Direction::Apply, nodes, history);
        Ok(Self {
            graph,
            params,
            actions,
            descriptions,
            state,
        })
    }

    /// Build from a parsed plan file.
    pub fn from_config(
        config: &ProvisionConfig,
        prior: Option<&PlanSnapshot>,
    ) -> Result<Self, PlanError> {
        Self::build(&config.name, config.specs(), config.params.clone(), prior)
    }

    /// Build a teardown plan over what a snapshot says exists.
    pub fn teardown(
        snapshot: &PlanSnapshot,
        params: HashMap<String, serde_yaml_ng::Value>,
    ) -> Result<Self, PlanError> {
        let specs: Vec<ResourceSpec> = snapshot.nodes.values().map(|n| n.spec.clone()).collect();
        let graph = DependencyGraph::build(&specs)?;

        let mut descriptions = Vec::with_capacity(specs.len());
        let nodes: IndexMap<String, ResourceNode> = snapshot
            .nodes
            .iter()
            .map(|(id, prev)| {
                descriptions.push(match &prev.external_id {
                    Some(ext) => format!("{}: delete {}", id, ext),
                    None => format!("{}: nothing to delete", id),
                });
                let node = ResourceNode {
                    spec: prev.spec.clone(),
                    state: NodeState::Pending,
                    attempts: 0,
                    last_error: None,
                    external_id: prev.external_id.clone(),
                    hash: prev.hash.clone(),
                    blocked_by: None,
                };
                (id.clone(), node)
            })
            .collect();

        let state = PlanState::new(
            &snapshot.plan,
            &generate_run_id(),
            Direction::Teardown,
            nodes,
            snapshot.transitions.clone(),
        );
        Ok(Self {
            graph,
            params,
            actions: vec![PlanAction::Create; specs.len()],
            descriptions,
            state,
        })
    }

    /// Every kind in the plan must have an adapter.
    pub fn check_adapters(&self, registry: &AdapterRegistry) -> Result<(), PlanError> {
        for node in self.state.nodes().values() {
            if !registry.contains(&node.spec.kind) {
                return Err(PlanError::UnknownKind {
                    resource: node.spec.id.clone(),
                    kind: node.spec.kind.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.state.plan()
    }

    pub fn direction(&self) -> Direction {
        self.state.direction()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn params(&self) -> &HashMap<String, serde_yaml_ng::Value> {
        &self.params
    }

    pub fn action_of(&self, id: &str) -> Option<PlanAction> {
        self.graph.index_of(id).map(|i| self.actions[i])
    }

    pub fn state(&self) -> &PlanState {
        &self.state
    }

    /// Split borrow for the engine: read-only plan data plus mutable state.
    pub(crate) fn parts_mut(
        &mut self,
    ) -> (
        &DependencyGraph,
        &HashMap<String, serde_yaml_ng::Value>,
        &[PlanAction],
        &mut PlanState,
    ) {
        (&self.graph, &self.params, &self.actions, &mut self.state)
    }

    /// Human-readable plan, in the order the run will walk the graph.
    pub fn execution_plan(&self) -> ExecutionPlan {
        let order: Vec<usize> = match self.direction() {
            Direction::Apply => self.graph.order_indices().to_vec(),
            Direction::Teardown => self.graph.order_indices().iter().rev().copied().collect(),
        };

        let mut changes = Vec::with_capacity(order.len());
        let (mut to_create, mut to_verify, mut to_update, mut to_retry) = (0u32, 0u32, 0u32, 0u32);
        for &idx in &order {
            let action = self.actions[idx];
            match action {
                PlanAction::Create => to_create += 1,
                PlanAction::Verify => to_verify += 1,
                PlanAction::Update => to_update += 1,
                PlanAction::Retry => to_retry += 1,
            }
            let id = self.graph.id(idx);
            let kind = self
                .state
                .node(id)
                .map(|n| n.spec.kind.clone())
                .unwrap_or_default();
            changes.push(PlannedChange {
                resource_id: id.to_string(),
                kind,
                action,
                description: self.descriptions[idx].clone(),
            });
        }

        ExecutionPlan {
            name: self.name().to_string(),
            execution_order: order.iter().map(|&i| self.graph.id(i).to_string()).collect(),
            changes,
            to_create,
            to_verify,
            to_update,
            to_retry,
        }
    }
}

/// Decide what to do with a node given its desired-state hash and the prior run.
pub fn determine_action(desired_hash: &str, prior: Option<&ResourceNode>) -> PlanAction {
    let Some(prev) = prior else {
        return PlanAction::Create;
    };
    match prev.state {
        NodeState::Created | NodeState::AlreadyExists => {
            if prev.hash == desired_hash {
                PlanAction::Verify
            } else {
                PlanAction::Update
            }
        }
        // Torn down, or never existed when last torn down
        NodeState::Deleted | NodeState::Absent => PlanAction::Create,
        // Failed, blocked, cancelled, or interrupted mid-run
        _ => PlanAction::Retry,
    }
}

fn describe_action(spec: &ResourceSpec, action: PlanAction, prior: Option<&ResourceNode>) -> String {
    match action {
        PlanAction::Create => format!("{}: create {}", spec.id, spec.kind),
        PlanAction::Verify => match prior.and_then(|p| p.external_id.as_deref()) {
            Some(ext) => format!("{}: verify {}", spec.id, ext),
            None => format!("{}: verify", spec.id),
        },
        PlanAction::Update => format!("{}: update (desired state changed)", spec.id),
        PlanAction::Retry => match prior {
            Some(p) => format!("{}: retry (previously {})", spec.id, p.state),
            None => format!("{}: retry", spec.id),
        },
    }
}

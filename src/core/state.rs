//! AN-013: Plan state — transition log, aggregate status, snapshot persistence.
//!
//! `PlanState` is owned by the engine loop and is the only place node state
//! changes. Transitions are append-only; history from earlier runs is carried
//! forward untouched when a plan is resumed.

use super::types::*;
use crate::audit::eventlog::now_iso8601;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Mutable record of one plan run.
#[derive(Debug, Clone)]
pub struct PlanState {
    plan: String,
    run_id: String,
    direction: Direction,
    nodes: IndexMap<String, ResourceNode>,
    transitions: Vec<Transition>,
    history_len: usize,
    status: PlanStatus,
    aborted: bool,
}

impl PlanState {
    /// Start a run over `nodes`, carrying `history` from earlier runs.
    pub fn new(
        plan: &str,
        run_id: &str,
        direction: Direction,
        nodes: IndexMap<String, ResourceNode>,
        history: Vec<Transition>,
    ) -> Self {
        let mut state = Self {
            plan: plan.to_string(),
            run_id: run_id.to_string(),
            direction,
            nodes,
            history_len: history.len(),
            transitions: history,
            status: PlanStatus::InProgress,
            aborted: false,
        };
        state.refresh_status();
        state
    }

    /// Append a transition and update the aggregate status.
    ///
    /// `from` must be the node's current state and the edge must be legal.
    /// Entering `Attempting` counts an attempt; an error replaces `last_error`.
    pub fn record(
        &mut self,
        node_id: &str,
        from: NodeState,
        to: NodeState,
        error: Option<String>,
    ) -> Result<&Transition, StateError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StateError::UnknownNode(node_id.to_string()))?;
        if node.state != from {
            return Err(StateError::StaleFrom {
                node: node_id.to_string(),
                expected: from,
                actual: node.state,
            });
        }
        if !from.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                node: node_id.to_string(),
                from,
                to,
            });
        }

        node.state = to;
        if to == NodeState::Attempting {
            node.attempts += 1;
        }
        if error.is_some() {
            node.last_error.clone_from(&error);
        }
        let attempt = node.attempts;

        let seq = self.transitions.last().map(|t| t.seq + 1).unwrap_or(1);
        self.transitions.push(Transition {
            seq,
            run_id: self.run_id.clone(),
            ts: now_iso8601(),
            node: node_id.to_string(),
            from,
            to,
            attempt,
            error,
        });
        self.refresh_status();
        Ok(&self.transitions[self.transitions.len() - 1])
    }

    /// Store the provider id reported for a node.
    pub fn set_external_id(&mut self, node_id: &str, external_id: Option<String>) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.external_id = external_id;
        }
    }

    pub fn set_blocked_by(&mut self, node_id: &str, blocker: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.blocked_by = Some(blocker.to_string());
        }
    }

    /// The run stopped early (fail-fast or cancellation). Takes effect once
    /// every node is terminal.
    pub fn mark_aborted(&mut self) {
        self.aborted = true;
        self.refresh_status();
    }

    fn refresh_status(&mut self) {
        self.status = if !self.is_terminal() {
            PlanStatus::InProgress
        } else if self.aborted {
            PlanStatus::Aborted
        } else if self.nodes.values().all(|n| n.state.is_success()) {
            PlanStatus::Succeeded
        } else {
            PlanStatus::PartiallyFailed
        };
    }

    pub fn is_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.state.is_terminal())
    }

    pub fn status(&self) -> PlanStatus {
        self.status
    }

    pub fn plan(&self) -> &str {
        &self.plan
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn node(&self, node_id: &str) -> Option<&ResourceNode> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> &IndexMap<String, ResourceNode> {
        &self.nodes
    }

    /// Full history, oldest first.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Transitions recorded by this run only.
    pub fn run_transitions(&self) -> &[Transition] {
        &self.transitions[self.history_len..]
    }

    /// Immutable, serializable view.
    pub fn snapshot(&self) -> PlanSnapshot {
        PlanSnapshot {
            schema: "1.0".to_string(),
            plan: self.plan.clone(),
            run_id: self.run_id.clone(),
            generator: format!("andamio {}", env!("CARGO_PKG_VERSION")),
            generated_at: now_iso8601(),
            direction: self.direction,
            status: self.status,
            nodes: self.nodes.clone(),
            transitions: self.transitions.clone(),
        }
    }

    /// Per-node outcome of the run, in plan order.
    pub fn report(&self, total_seconds: f64) -> RunReport {
        RunReport {
            plan: self.plan.clone(),
            run_id: self.run_id.clone(),
            direction: self.direction,
            status: self.status,
            nodes: self
                .nodes
                .values()
                .map(|n| NodeReport {
                    id: n.spec.id.clone(),
                    kind: n.spec.kind.clone(),
                    state: n.state,
                    attempts: n.attempts,
                    external_id: n.external_id.clone(),
                    error: if n.state.is_failure() {
                        n.last_error.clone()
                    } else {
                        None
                    },
                    blocked_by: n.blocked_by.clone(),
                })
                .collect(),
            total_seconds,
        }
    }
}

// ============================================================================
// Snapshot persistence
// ============================================================================

/// Derive the snapshot path for a plan within the state directory.
pub fn snapshot_path(state_dir: &Path, plan: &str) -> PathBuf {
    state_dir.join(plan).join("plan.state.yaml")
}

/// Load a plan snapshot. Returns None if the file doesn't exist.
pub fn load_snapshot(state_dir: &Path, plan: &str) -> Result<Option<PlanSnapshot>, String> {
    let path = snapshot_path(state_dir, plan);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let snapshot: PlanSnapshot = serde_yaml_ng::from_str(&content)
        .map_err(|e| format!("invalid state file {}: {}", path.display(), e))?;
    Ok(Some(snapshot))
}

/// Save a snapshot atomically (write to temp, then rename).
pub fn save_snapshot(state_dir: &Path, snapshot: &PlanSnapshot) -> Result<(), String> {
    let path = snapshot_path(state_dir, &snapshot.plan);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }

    let yaml =
        serde_yaml_ng::to_string(snapshot).map_err(|e| format!("serialize error: {}", e))?;

    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, &yaml)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, &path).map_err(|e| {
        format!(
            "cannot rename {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })?;

    Ok(())
}

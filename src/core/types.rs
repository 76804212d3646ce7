//! AN-001: Core types — plan file schema, resource specs, node state machine,
//! snapshots, transitions, and the run report.
//!
//! Everything that is persisted derives Serialize/Deserialize so the state file
//! and the event log roundtrip through YAML and JSON.

use crate::core::retry::RetryPolicy;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Opaque adapter payload. Order-preserving so hashes and env exports are stable.
pub type Parameters = IndexMap<String, serde_yaml_ng::Value>;

// ============================================================================
// Top-level andamio.yaml
// ============================================================================

/// Root configuration: the desired set of external resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Plan name; also names the state directory
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Global parameters (templatable as `{{params.key}}`)
    #[serde(default)]
    pub params: HashMap<String, serde_yaml_ng::Value>,

    /// Script adapters, keyed by resource kind
    #[serde(default)]
    pub adapters: IndexMap<String, ScriptAdapterConfig>,

    /// Resource declarations (order-preserving; order breaks ordering ties)
    pub resources: IndexMap<String, ResourceDecl>,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,
}

impl ProvisionConfig {
    /// Flatten the declarations into specs, in declaration order.
    pub fn specs(&self) -> Vec<ResourceSpec> {
        self.resources
            .iter()
            .map(|(id, decl)| ResourceSpec {
                id: id.clone(),
                kind: decl.kind.clone(),
                parameters: decl.parameters.clone(),
                depends_on: decl.depends_on.clone(),
            })
            .collect()
    }
}

/// A resource as written in the plan file (the id is the map key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Adapter kind
    pub kind: String,

    /// Adapter-interpreted payload
    #[serde(default)]
    pub parameters: Parameters,

    /// Resources that must succeed first
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Shell commands backing one resource kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptAdapterConfig {
    /// Prints the external id of an existing resource, or nothing
    pub describe: String,

    /// Creates the resource and prints its external id
    pub create: String,

    /// Deletes the resource named by `$ANDAMIO_EXTERNAL_ID`
    pub delete: String,

    /// Exit code classification
    #[serde(default)]
    pub exit_codes: ExitCodes,
}

/// Exit codes a script uses to signal outcomes other than plain success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCodes {
    #[serde(default = "default_already_exists")]
    pub already_exists: i32,

    #[serde(default = "default_not_found")]
    pub not_found: i32,

    #[serde(default = "default_transient")]
    pub transient: Vec<i32>,
}

impl Default for ExitCodes {
    fn default() -> Self {
        Self {
            already_exists: default_already_exists(),
            not_found: default_not_found(),
            transient: default_transient(),
        }
    }
}

// EEXIST
fn default_already_exists() -> i32 {
    17
}

// ENOENT
fn default_not_found() -> i32 {
    2
}

// EX_TEMPFAIL
fn default_transient() -> Vec<i32> {
    vec![75]
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Abort the whole plan on the first permanent failure
    #[serde(default)]
    pub fail_fast: bool,

    /// Maximum adapter calls in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Backoff for transient failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per adapter call timeout
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Append transitions to the event log
    #[serde(default = "default_true")]
    pub tripwire: bool,

    /// Persist the plan snapshot after each run
    #[serde(default = "default_true")]
    pub lock_file: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            fail_fast: false,
            concurrency: default_concurrency(),
            retry: RetryPolicy::default(),
            call_timeout_secs: default_call_timeout(),
            tripwire: true,
            lock_file: true,
        }
    }
}

fn default_concurrency() -> usize {
    2
}

fn default_call_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Resources and nodes
// ============================================================================

/// A desired resource. Immutable once submitted to a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceSpec {
    pub fn new(id: &str, kind: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            parameters: Parameters::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.parameters.insert(
            key.to_string(),
            serde_yaml_ng::Value::String(value.to_string()),
        );
        self
    }
}

/// Per-node state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Attempting,
    Created,
    AlreadyExists,
    Deleted,
    Absent,
    TransientFailure,
    PermanentFailure,
    Blocked,
    Cancelled,
}

impl NodeState {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::Created | Self::AlreadyExists | Self::Deleted | Self::Absent
        )
    }

    /// Failure terminals. Blocked is a permanent failure that was never attempted.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::PermanentFailure | Self::Blocked | Self::Cancelled)
    }

    pub fn is_terminal(self) -> bool {
        self.is_success() || self.is_failure()
    }

    /// Legal edges of the state machine.
    pub fn can_transition_to(self, to: NodeState) -> bool {
        use NodeState::*;
        match self {
            Pending => matches!(to, Attempting | Blocked | Cancelled | Absent),
            Attempting => matches!(
                to,
                Created | AlreadyExists | Deleted | TransientFailure | PermanentFailure
            ),
            TransientFailure => matches!(to, Attempting | PermanentFailure | Cancelled),
            _ => false,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Attempting => write!(f, "ATTEMPTING"),
            Self::Created => write!(f, "CREATED"),
            Self::AlreadyExists => write!(f, "ALREADY-EXISTS"),
            Self::Deleted => write!(f, "DELETED"),
            Self::Absent => write!(f, "ABSENT"),
            Self::TransientFailure => write!(f, "TRANSIENT-FAILURE"),
            Self::PermanentFailure => write!(f, "PERMANENT-FAILURE"),
            Self::Blocked => write!(f, "BLOCKED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    InProgress,
    Succeeded,
    PartiallyFailed,
    Aborted,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "IN-PROGRESS"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::PartiallyFailed => write!(f, "PARTIALLY-FAILED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Which way a run walks the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Apply,
    Teardown,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

/// Runtime wrapper around a spec inside one plan execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceNode {
    pub spec: ResourceSpec,
    pub state: NodeState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    /// BLAKE3 of the desired state this node was converged against
    #[serde(default)]
    pub hash: String,
    /// The failed node that blocked this one
    #[serde(default)]
    pub blocked_by: Option<String>,
}

/// One append-only state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub seq: u64,
    pub run_id: String,
    pub ts: String,
    pub node: String,
    pub from: NodeState,
    pub to: NodeState,
    pub attempt: u32,
    #[serde(default)]
    pub error: Option<String>,
}

/// Serializable view of a plan's state, used for audit and resumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSnapshot {
    /// Schema version
    pub schema: String,

    /// Plan name
    pub plan: String,

    /// Run that produced this snapshot
    pub run_id: String,

    /// Generator version
    pub generator: String,

    /// When the snapshot was taken
    pub generated_at: String,

    /// Direction of the run
    pub direction: Direction,

    /// Aggregate status
    pub status: PlanStatus,

    /// Per-node state, in plan order
    pub nodes: IndexMap<String, ResourceNode>,

    /// Full transition history, across runs
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

// ============================================================================
// Plan view
// ============================================================================

/// What a run will do with a node, given the prior snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Verify,
    Update,
    Retry,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Verify => write!(f, "VERIFY"),
            Self::Update => write!(f, "UPDATE"),
            Self::Retry => write!(f, "RETRY"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub resource_id: String,
    pub kind: String,
    pub action: PlanAction,
    pub description: String,
}

/// Full execution plan view.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub name: String,
    pub changes: Vec<PlannedChange>,
    pub execution_order: Vec<String>,
    pub to_create: u32,
    pub to_verify: u32,
    pub to_update: u32,
    pub to_retry: u32,
}

// ============================================================================
// Report
// ============================================================================

/// Final state of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: String,
    pub kind: String,
    pub state: NodeState,
    pub attempts: u32,
    pub external_id: Option<String>,
    pub error: Option<String>,
    pub blocked_by: Option<String>,
}

/// Outcome of a whole run. Every node appears, attempted or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub plan: String,
    pub run_id: String,
    pub direction: Direction,
    pub status: PlanStatus,
    pub nodes: Vec<NodeReport>,
    pub total_seconds: f64,
}

impl RunReport {
    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|n| n.state == state).count()
    }

    /// Nodes a later run must retry (failed) or that were never reached.
    pub fn needs_retry(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.state.is_failure())
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Nodes holding real resources, in report order. What a rollback would delete.
    pub fn provisioned(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.external_id.is_some())
            .map(|n| n.id.as_str())
            .collect()
    }
}

// ============================================================================
// Events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    RunStarted {
        plan: String,
        run_id: String,
        direction: Direction,
        andamio_version: String,
    },
    NodeTransition {
        plan: String,
        run_id: String,
        seq: u64,
        node: String,
        from: NodeState,
        to: NodeState,
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RunCompleted {
        plan: String,
        run_id: String,
        status: PlanStatus,
        succeeded: u32,
        failed: u32,
        total_seconds: f64,
    },
    DriftDetected {
        plan: String,
        node: String,
        expected_id: String,
        actual_id: String,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that reject a plan before any adapter is called.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("dependency cycle: {}", cycle_path(.members))]
    Cycle { members: Vec<String> },

    #[error("resource '{resource}' depends on unknown '{missing}'")]
    DanglingReference { resource: String, missing: String },

    #[error("duplicate resource id '{0}'")]
    DuplicateId(String),

    #[error("resource '{resource}' has kind '{kind}' with no registered adapter")]
    UnknownKind { resource: String, kind: String },

    #[error("resource '{resource}' references '{referenced}' without depending on it")]
    UndeclaredReference { resource: String, referenced: String },

    #[error("resource '{resource}': {message}")]
    Template { resource: String, message: String },
}

/// Render cycle members closed back onto the first one: `a -> b -> a`.
fn cycle_path(members: &[String]) -> String {
    let mut path = members.to_vec();
    if let Some(first) = members.first() {
        path.push(first.clone());
    }
    path.join(" -> ")
}

/// Misuse of the node state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("node '{node}' is {actual}, not {expected}")]
    StaleFrom {
        node: String,
        expected: NodeState,
        actual: NodeState,
    },

    #[error("illegal transition {from} -> {to} for node '{node}'")]
    InvalidTransition {
        node: String,
        from: NodeState,
        to: NodeState,
    },
}

// ============================================================================
// Template helper
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string for templates and script env.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_else(|_| format!("{:?}", other)),
    }
}

// ============================================================================
// Tests
// ============================================================================

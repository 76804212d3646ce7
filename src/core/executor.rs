//! AN-012: Convergence engine — walk the graph, drive adapters, classify, retry.
//!
//! One loop owns the `PlanState`. Adapter calls and retry backoffs run as
//! tasks in a `JoinSet` and report back as `TaskEvent`s; only the loop records
//! transitions. A node launches once every prerequisite is in a success
//! terminal: its dependencies when applying, its dependents when tearing down.
//!
//! load snapshot → plan → engine (snapshot + event log as it goes)

use super::planner::Plan;
use super::resolver::{resolve_parameters, DependencyGraph};
use super::retry::RetryPolicy;
use super::state::{self, PlanState};
use super::types::*;
use crate::adapter::{AdapterError, AdapterRegistry, CreateOutcome, DeleteOutcome, ResourceAdapter};
use crate::audit::eventlog;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Knobs for one engine run.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum adapter calls in flight
    pub concurrency: usize,
    /// Stop scheduling after the first permanent failure
    pub fail_fast: bool,
    pub retry: RetryPolicy,
    /// Limit on each individual adapter call
    pub call_timeout: Duration,
}

impl From<&Policy> for EngineOptions {
    fn from(policy: &Policy) -> Self {
        Self {
            concurrency: policy.concurrency,
            fail_fast: policy.fail_fast,
            retry: policy.retry.clone(),
            call_timeout: Duration::from_secs(policy.call_timeout_secs),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&Policy::default())
    }
}

/// Cooperative cancellation. Clones share the same signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for can't see a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one adapter call, as seen by the loop.
#[derive(Debug)]
enum CallOutcome {
    Created(String),
    AlreadyExists(Option<String>),
    Deleted,
    Failed(AdapterError),
}

enum TaskEvent {
    Finished { idx: usize, outcome: CallOutcome },
    RetryDue { idx: usize },
}

/// What a launched node asks of its adapter.
enum Op {
    /// Describe first when verifying, then create if not found
    Ensure { verify: bool },
    Delete(String),
}

/// Where a run records its progress while it is still going.
#[derive(Debug, Clone)]
pub struct Journal {
    pub state_dir: PathBuf,
    /// Save the snapshot after every success terminal
    pub snapshot: bool,
    /// Append each transition to the event log when it is recorded
    pub events: bool,
}

impl Journal {
    pub fn from_policy(state_dir: &Path, policy: &Policy) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            snapshot: policy.lock_file,
            events: policy.tripwire,
        }
    }

    fn log(&self, plan: &str, event: ProvenanceEvent) {
        if !self.events {
            return;
        }
        if let Err(e) = eventlog::append_event(&self.state_dir, plan, event) {
            warn!(plan, error = %e, "cannot append to event log");
        }
    }

    fn save(&self, state: &PlanState) {
        if !self.snapshot {
            return;
        }
        if let Err(e) = state::save_snapshot(&self.state_dir, &state.snapshot()) {
            warn!(plan = state.plan(), error = %e, "cannot save snapshot");
        }
    }
}

/// Drives plans through their adapters.
pub struct Engine<'r> {
    registry: &'r AdapterRegistry,
    options: EngineOptions,
    journal: Option<Journal>,
}

impl<'r> Engine<'r> {
    pub fn new(registry: &'r AdapterRegistry, options: EngineOptions) -> Self {
        Self {
            registry,
            options,
            journal: None,
        }
    }

    /// Persist transitions and snapshots during the run, not only after it.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Run a plan to a terminal state. Apply plans walk dependencies first;
    /// plans built by `Plan::teardown` walk dependents first and delete.
    ///
    /// Fails only if a resource kind has no adapter, before any call is made.
    pub async fn converge(
        &self,
        plan: &mut Plan,
        cancel: &CancelToken,
    ) -> Result<RunReport, PlanError> {
        let start = Instant::now();
        let direction = plan.direction();
        let (graph, params, actions, state) = plan.parts_mut();

        // Node order matches graph index order; both come from the same specs.
        let adapters = state
            .nodes()
            .values()
            .map(|n| {
                self.registry
                    .get(&n.spec.kind)
                    .ok_or_else(|| PlanError::UnknownKind {
                        resource: n.spec.id.clone(),
                        kind: n.spec.kind.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            plan = state.plan(),
            run_id = state.run_id(),
            %direction,
            nodes = graph.len(),
            concurrency = self.options.concurrency,
            "run started"
        );
        if let Some(journal) = &self.journal {
            journal.log(
                state.plan(),
                ProvenanceEvent::RunStarted {
                    plan: state.plan().to_string(),
                    run_id: state.run_id().to_string(),
                    direction,
                    andamio_version: env!("CARGO_PKG_VERSION").to_string(),
                },
            );
        }

        let mut run = Run::new(graph, params, actions, state, adapters, &self.options, direction);
        run.journal = self.journal.as_ref();
        run.drive(cancel).await;

        let report = plan.state().report(start.elapsed().as_secs_f64());
        info!(
            plan = %report.plan,
            status = %report.status,
            seconds = report.total_seconds,
            "run finished"
        );
        Ok(report)
    }
}

/// Scheduler state for a single run.
struct Run<'a> {
    graph: &'a DependencyGraph,
    params: &'a HashMap<String, serde_yaml_ng::Value>,
    actions: &'a [PlanAction],
    state: &'a mut PlanState,
    adapters: Vec<Arc<dyn ResourceAdapter>>,
    options: &'a EngineOptions,
    direction: Direction,
    /// Node indices in walk order
    walk: Vec<usize>,
    /// Position of each node in `walk`
    rank: Vec<usize>,
    /// Prerequisites not yet in a success terminal
    remaining: Vec<usize>,
    ready: BTreeSet<(usize, usize)>,
    tasks: JoinSet<TaskEvent>,
    in_flight: usize,
    stop_reason: Option<String>,
    /// Wakes pending backoff sleeps when the run stops
    halt: CancelToken,
    journal: Option<&'a Journal>,
}

impl<'a> Run<'a> {
    fn new(
        graph: &'a DependencyGraph,
        params: &'a HashMap<String, serde_yaml_ng::Value>,
        actions: &'a [PlanAction],
        state: &'a mut PlanState,
        adapters: Vec<Arc<dyn ResourceAdapter>>,
        options: &'a EngineOptions,
        direction: Direction,
    ) -> Self {
        let walk: Vec<usize> = match direction {
            Direction::Apply => graph.order_indices().to_vec(),
            Direction::Teardown => graph.order_indices().iter().rev().copied().collect(),
        };
        let mut rank = vec![0; graph.len()];
        for (pos, &idx) in walk.iter().enumerate() {
            rank[idx] = pos;
        }

        let mut run = Self {
            graph,
            params,
            actions,
            state,
            adapters,
            options,
            direction,
            walk,
            rank,
            remaining: Vec::new(),
            ready: BTreeSet::new(),
            tasks: JoinSet::new(),
            in_flight: 0,
            stop_reason: None,
            halt: CancelToken::new(),
            journal: None,
        };
        run.remaining = (0..graph.len()).map(|i| run.prerequisites(i).len()).collect();
        for pos in 0..run.walk.len() {
            let idx = run.walk[pos];
            if run.remaining[idx] == 0 && run.node_state(idx) == NodeState::Pending {
                run.ready.insert((run.rank[idx], idx));
            }
        }
        run
    }

    fn id(&self, idx: usize) -> &'a str {
        self.graph.id(idx)
    }

    fn prerequisites(&self, idx: usize) -> &'a [usize] {
        match self.direction {
            Direction::Apply => self.graph.dependencies_of(idx),
            Direction::Teardown => self.graph.dependents_of(idx),
        }
    }

    fn followers(&self, idx: usize) -> &'a [usize] {
        match self.direction {
            Direction::Apply => self.graph.dependents_of(idx),
            Direction::Teardown => self.graph.dependencies_of(idx),
        }
    }

    fn node_state(&self, idx: usize) -> NodeState {
        self.state
            .node(self.id(idx))
            .map(|n| n.state)
            .unwrap_or(NodeState::Cancelled)
    }

    fn attempts(&self, idx: usize) -> u32 {
        self.state.node(self.id(idx)).map(|n| n.attempts).unwrap_or(0)
    }

    fn stopping(&self) -> bool {
        self.stop_reason.is_some()
    }

    async fn drive(mut self, cancel: &CancelToken) {
        loop {
            if !self.stopping() && cancel.is_cancelled() {
                self.stop("plan cancelled".to_string());
            }
            self.launch_ready();
            if self.tasks.is_empty() {
                break;
            }
            let stopping = self.stopping();
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !stopping => {
                    self.stop("plan cancelled".to_string());
                }
                joined = self.tasks.join_next() => match joined {
                    Some(Ok(event)) => self.handle(event),
                    Some(Err(e)) => error!(error = %e, "engine task failed"),
                    None => break,
                },
            }
        }
    }

    fn launch_ready(&mut self) {
        while !self.stopping() && self.in_flight < self.options.concurrency.max(1) {
            let Some((_, idx)) = self.ready.pop_first() else {
                break;
            };
            self.launch(idx);
        }
    }

    fn launch(&mut self, idx: usize) {
        let id = self.id(idx);
        let Some(node) = self.state.node(id) else {
            return;
        };
        if !matches!(node.state, NodeState::Pending | NodeState::TransientFailure) {
            return;
        }

        let op = match (self.direction, node.external_id.clone()) {
            (Direction::Apply, _) => Op::Ensure {
                verify: self.actions[idx] == PlanAction::Verify,
            },
            (Direction::Teardown, Some(external_id)) => Op::Delete(external_id),
            (Direction::Teardown, None) => {
                debug!(node = id, "nothing to delete");
                self.transition(idx, NodeState::Absent, None);
                self.succeeded(idx);
                return;
            }
        };

        self.transition(idx, NodeState::Attempting, None);
        let params = match self.resolve(idx) {
            Ok(params) => params,
            Err(message) => {
                warn!(node = id, error = %message, "cannot resolve parameters");
                self.transition(idx, NodeState::PermanentFailure, Some(message));
                self.failed_permanently(idx);
                return;
            }
        };

        debug!(node = id, attempt = self.attempts(idx), "calling adapter");
        let adapter = Arc::clone(&self.adapters[idx]);
        let limit = self.options.call_timeout;
        self.tasks.spawn(async move {
            let call = async move {
                match op {
                    Op::Ensure { verify } => ensure(adapter.as_ref(), verify, &params, limit).await,
                    Op::Delete(external_id) => {
                        remove(adapter.as_ref(), &external_id, &params, limit).await
                    }
                }
            };
            // A panicking adapter still reports back against its node. Builds
            // with `panic = "abort"` (both shipped profiles) exit instead.
            let outcome = tokio::spawn(call).await.unwrap_or_else(|e| {
                CallOutcome::Failed(AdapterError::Permanent(format!("adapter task failed: {}", e)))
            });
            TaskEvent::Finished { idx, outcome }
        });
        self.in_flight += 1;
    }

    /// Parameters with templates filled in from dependencies' external ids.
    fn resolve(&self, idx: usize) -> Result<Parameters, String> {
        let state: &PlanState = self.state;
        let Some(node) = state.node(self.id(idx)) else {
            return Ok(Parameters::new());
        };
        resolve_parameters(&node.spec.parameters, self.params, &|dep| {
            state.node(dep).and_then(|n| n.external_id.clone())
        })
    }

    fn handle(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::RetryDue { idx } => {
                if !self.stopping() && self.node_state(idx) == NodeState::TransientFailure {
                    self.ready.insert((self.rank[idx], idx));
                }
            }
            TaskEvent::Finished { idx, outcome } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.finish(idx, outcome);
            }
        }
    }

    fn finish(&mut self, idx: usize, outcome: CallOutcome) {
        let id = self.id(idx);
        match outcome {
            CallOutcome::Created(external_id) => {
                info!(node = id, external_id = %external_id, "created");
                self.state.set_external_id(id, Some(external_id));
                self.transition(idx, NodeState::Created, None);
                self.succeeded(idx);
            }
            CallOutcome::AlreadyExists(external_id) => {
                info!(node = id, external_id = ?external_id, "already exists");
                if external_id.is_some() {
                    self.state.set_external_id(id, external_id);
                }
                self.transition(idx, NodeState::AlreadyExists, None);
                self.succeeded(idx);
            }
            CallOutcome::Deleted => {
                info!(node = id, "deleted");
                self.state.set_external_id(id, None);
                self.transition(idx, NodeState::Deleted, None);
                self.succeeded(idx);
            }
            CallOutcome::Failed(err) => self.failed(idx, err),
        }
    }

    fn succeeded(&mut self, idx: usize) {
        if let Some(journal) = self.journal {
            journal.save(self.state);
        }
        for &f in self.followers(idx) {
            self.remaining[f] = self.remaining[f].saturating_sub(1);
            if self.remaining[f] == 0
                && !self.stopping()
                && self.node_state(f) == NodeState::Pending
            {
                self.ready.insert((self.rank[f], f));
            }
        }
    }

    fn failed(&mut self, idx: usize, err: AdapterError) {
        let id = self.id(idx);
        let message = err.message().to_string();
        if !err.is_transient() {
            warn!(node = id, error = %message, "permanent failure");
            self.transition(idx, NodeState::PermanentFailure, Some(message));
            self.failed_permanently(idx);
            return;
        }

        self.transition(idx, NodeState::TransientFailure, Some(message.clone()));
        let attempts = self.attempts(idx);
        if let Some(reason) = self.stop_reason.clone() {
            self.transition(idx, NodeState::Cancelled, Some(reason));
        } else if self.options.retry.should_retry(attempts) {
            let delay = self.options.retry.delay(attempts);
            warn!(
                node = id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "transient failure, retrying"
            );
            let halt = self.halt.clone();
            self.tasks.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = halt.cancelled() => {}
                }
                TaskEvent::RetryDue { idx }
            });
        } else {
            warn!(node = id, attempts, error = %message, "retry budget exhausted");
            self.transition(
                idx,
                NodeState::PermanentFailure,
                Some(format!("gave up after {} attempts: {}", attempts, message)),
            );
            self.failed_permanently(idx);
        }
    }

    fn failed_permanently(&mut self, idx: usize) {
        self.block_followers(idx);
        if self.options.fail_fast {
            self.stop(format!("fail-fast: '{}' failed", self.id(idx)));
        }
    }

    /// Block every pending node that transitively waits on `idx`.
    fn block_followers(&mut self, idx: usize) {
        let blocker = self.id(idx);
        let followers = match self.direction {
            Direction::Apply => self.graph.transitive_dependents_of(idx),
            Direction::Teardown => self.graph.transitive_dependencies_of(idx),
        };
        for f in followers {
            if self.node_state(f) != NodeState::Pending {
                continue;
            }
            self.ready.remove(&(self.rank[f], f));
            self.state.set_blocked_by(self.id(f), blocker);
            self.transition(f, NodeState::Blocked, Some(format!("blocked by '{}'", blocker)));
            info!(node = self.id(f), blocked_by = blocker, "blocked");
        }
    }

    /// Stop scheduling: cancel everything not yet attempted or waiting to
    /// retry. In-flight calls finish and are recorded.
    fn stop(&mut self, reason: String) {
        if self.stopping() {
            return;
        }
        warn!(reason = %reason, in_flight = self.in_flight, "stopping run");
        self.halt.cancel();
        self.state.mark_aborted();
        self.ready.clear();
        for pos in 0..self.walk.len() {
            let idx = self.walk[pos];
            if matches!(
                self.node_state(idx),
                NodeState::Pending | NodeState::TransientFailure
            ) {
                self.transition(idx, NodeState::Cancelled, Some(reason.clone()));
            }
        }
        self.stop_reason = Some(reason);
    }

    fn transition(&mut self, idx: usize, to: NodeState, error: Option<String>) {
        let id = self.id(idx);
        let Some(from) = self.state.node(id).map(|n| n.state) else {
            return;
        };
        let recorded = match self.state.record(id, from, to, error) {
            Ok(t) => {
                debug!(node = id, %from, %to, attempt = t.attempt, seq = t.seq, "transition");
                t.clone()
            }
            Err(e) => {
                error!(node = id, error = %e, "rejected transition");
                return;
            }
        };
        if let Some(journal) = self.journal {
            let plan = self.state.plan();
            for event in eventlog::transition_events(plan, std::slice::from_ref(&recorded)) {
                journal.log(plan, event);
            }
        }
    }
}

async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, AdapterError>>,
) -> Result<T, AdapterError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Transient(format!(
            "call timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

async fn ensure(
    adapter: &dyn ResourceAdapter,
    verify: bool,
    params: &Parameters,
    limit: Duration,
) -> CallOutcome {
    if verify {
        match with_timeout(limit, adapter.describe(params)).await {
            Ok(Some(external_id)) => return CallOutcome::AlreadyExists(Some(external_id)),
            Ok(None) => {}
            Err(e) => return CallOutcome::Failed(e),
        }
    }
    match with_timeout(limit, adapter.create(params)).await {
        Ok(CreateOutcome::Created(external_id)) => CallOutcome::Created(external_id),
        Ok(CreateOutcome::AlreadyExists(external_id)) => CallOutcome::AlreadyExists(external_id),
        Err(e) => CallOutcome::Failed(e),
    }
}

async fn remove(
    adapter: &dyn ResourceAdapter,
    external_id: &str,
    params: &Parameters,
    limit: Duration,
) -> CallOutcome {
    match with_timeout(limit, adapter.delete(external_id, params)).await {
        Ok(DeleteOutcome::Deleted | DeleteOutcome::NotFound) => CallOutcome::Deleted,
        Err(e) => CallOutcome::Failed(e),
    }
}

// ============================================================================
// apply / destroy
// ============================================================================

/// Configuration for an apply or destroy run.
pub struct ApplyConfig<'a> {
    pub config: &'a ProvisionConfig,
    pub state_dir: &'a Path,
    pub options: EngineOptions,
}

impl ApplyConfig<'_> {
    fn engine<'r>(&self, registry: &'r AdapterRegistry) -> Engine<'r> {
        Engine::new(registry, self.options.clone())
            .with_journal(Journal::from_policy(self.state_dir, &self.config.policy))
    }
}

/// Converge the plan file against the persisted snapshot, then persist.
pub async fn apply(
    cfg: &ApplyConfig<'_>,
    registry: &AdapterRegistry,
    cancel: &CancelToken,
) -> Result<RunReport, String> {
    let prior = state::load_snapshot(cfg.state_dir, &cfg.config.name)?;
    let mut plan = Plan::from_config(cfg.config, prior.as_ref()).map_err(|e| e.to_string())?;
    plan.check_adapters(registry).map_err(|e| e.to_string())?;
    let report = cfg
        .engine(registry)
        .converge(&mut plan, cancel)
        .await
        .map_err(|e| e.to_string())?;
    persist(cfg, plan.state(), &report)?;
    Ok(report)
}

/// Tear down everything the snapshot records. `None` when there is no snapshot.
pub async fn destroy(
    cfg: &ApplyConfig<'_>,
    registry: &AdapterRegistry,
    cancel: &CancelToken,
) -> Result<Option<RunReport>, String> {
    let Some(snapshot) = state::load_snapshot(cfg.state_dir, &cfg.config.name)? else {
        return Ok(None);
    };
    let mut plan =
        Plan::teardown(&snapshot, cfg.config.params.clone()).map_err(|e| e.to_string())?;
    let report = cfg
        .engine(registry)
        .converge(&mut plan, cancel)
        .await
        .map_err(|e| e.to_string())?;
    persist(cfg, plan.state(), &report)?;
    Ok(Some(report))
}

/// Final snapshot and the run's closing event. Transitions were already
/// written by the engine's journal as they happened.
fn persist(cfg: &ApplyConfig<'_>, state: &PlanState, report: &RunReport) -> Result<(), String> {
    let policy = &cfg.config.policy;
    if policy.lock_file {
        state::save_snapshot(cfg.state_dir, &state.snapshot())?;
    }
    if policy.tripwire {
        eventlog::append_event(
            cfg.state_dir,
            state.plan(),
            ProvenanceEvent::RunCompleted {
                plan: report.plan.clone(),
                run_id: report.run_id.clone(),
                status: report.status,
                succeeded: report.nodes.iter().filter(|n| n.state.is_success()).count() as u32,
                failed: report.nodes.iter().filter(|n| n.state.is_failure()).count() as u32,
                total_seconds: report.total_seconds,
            },
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::MockAdapter;

    fn node(id: &str, deps: &[&str]) -> ResourceSpec {
        ResourceSpec::new(id, "mock")
            .param("name", id)
            .depends_on(deps)
    }

    fn fast() -> EngineOptions {
        EngineOptions {
            concurrency: 2,
            fail_fast: false,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 4,
                jitter: false,
            },
            call_timeout: Duration::from_secs(5),
        }
    }

    fn registry(mock: &Arc<MockAdapter>) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        registry.register("mock", mock.clone());
        registry
    }

    async fn run(plan: &mut Plan, mock: &Arc<MockAdapter>, options: EngineOptions) -> RunReport {
        Engine::new(&registry(mock), options)
            .converge(plan, &CancelToken::new())
            .await
            .unwrap()
    }

    async fn converge(
        specs: Vec<ResourceSpec>,
        mock: &Arc<MockAdapter>,
        options: EngineOptions,
    ) -> (RunReport, Plan) {
        let mut plan = Plan::build("test", specs, HashMap::new(), None).unwrap();
        let report = run(&mut plan, mock, options).await;
        (report, plan)
    }

    fn state_of(report: &RunReport, id: &str) -> NodeState {
        report.node(id).unwrap().state
    }

    fn transient(msg: &str) -> AdapterError {
        AdapterError::Transient(msg.to_string())
    }

    fn permanent(msg: &str) -> AdapterError {
        AdapterError::Permanent(msg.to_string())
    }

    #[tokio::test]
    async fn test_an012_already_exists_satisfies_dependents() {
        let mock = Arc::new(MockAdapter::new().on_create(
            "a",
            vec![Ok(CreateOutcome::AlreadyExists(Some("pre-a".into())))],
        ));
        let (report, _) = converge(vec![node("a", &[]), node("b", &["a"])], &mock, fast()).await;
        assert_eq!(state_of(&report, "a"), NodeState::AlreadyExists);
        assert_eq!(report.node("a").unwrap().external_id.as_deref(), Some("pre-a"));
        assert_eq!(state_of(&report, "b"), NodeState::Created);
        assert_eq!(report.status, PlanStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_an012_permanent_failure_blocks_dependents_only() {
        let mock = Arc::new(
            MockAdapter::new().on_create("a", vec![Err(permanent("InvalidParameterValue"))]),
        );
        let specs = vec![node("a", &[]), node("b", &["a"]), node("c", &[])];
        let (report, _) = converge(specs, &mock, fast()).await;

        assert_eq!(state_of(&report, "a"), NodeState::PermanentFailure);
        assert!(report.node("a").unwrap().error.as_deref().unwrap().contains("InvalidParameterValue"));
        assert_eq!(state_of(&report, "b"), NodeState::Blocked);
        assert_eq!(report.node("b").unwrap().blocked_by.as_deref(), Some("a"));
        assert_eq!(report.node("b").unwrap().attempts, 0);
        assert_eq!(state_of(&report, "c"), NodeState::Created);
        assert_eq!(report.status, PlanStatus::PartiallyFailed);
        assert!(!mock.create_calls().contains(&"b".to_string()));
        assert_eq!(report.needs_retry(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_an012_transient_then_created() {
        let mock = Arc::new(
            MockAdapter::new().on_create("a", vec![Err(transient("throttled")), Err(transient("throttled"))]),
        );
        let (report, plan) = converge(vec![node("a", &[])], &mock, fast()).await;
        assert_eq!(state_of(&report, "a"), NodeState::Created);
        assert_eq!(report.node("a").unwrap().attempts, 3);
        assert_eq!(report.node("a").unwrap().error, None);
        let path: Vec<NodeState> = plan.state().transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![
                NodeState::Attempting,
                NodeState::TransientFailure,
                NodeState::Attempting,
                NodeState::TransientFailure,
                NodeState::Attempting,
                NodeState::Created,
            ]
        );
    }

    #[tokio::test]
    async fn test_an012_retry_budget_is_bounded() {
        let mock = Arc::new(MockAdapter::new().on_create("a", vec![Err(transient("propagating")); 10]));
        let (report, _) = converge(vec![node("a", &[]), node("b", &["a"])], &mock, fast()).await;
        let a = report.node("a").unwrap();
        assert_eq!(a.state, NodeState::PermanentFailure);
        assert_eq!(a.attempts, 3);
        assert!(a.error.as_deref().unwrap().contains("gave up after 3 attempts"));
        assert_eq!(mock.create_calls().len(), 3);
        assert_eq!(state_of(&report, "b"), NodeState::Blocked);
    }

    #[tokio::test]
    async fn test_an012_cycle_rejected_before_any_call() {
        let mock = Arc::new(MockAdapter::new());
        let err = Plan::build(
            "test",
            vec![node("a", &["b"]), node("b", &["a"])],
            HashMap::new(),
            None,
        )
        .unwrap_err();
        assert_eq!(
            err,
            PlanError::Cycle {
                members: vec!["a".into(), "b".into()]
            }
        );
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_an012_never_attempts_before_dependencies_succeed() {
        let mock = Arc::new(
            MockAdapter::new()
                .with_delay(Duration::from_millis(2))
                .on_create("left", vec![Err(transient("slow"))]),
        );
        let specs = vec![
            node("bottom", &["left", "right"]),
            node("left", &["top"]),
            node("right", &["top"]),
            node("top", &[]),
            node("side", &[]),
        ];
        let mut options = fast();
        options.concurrency = 4;
        let (report, plan) = converge(specs.clone(), &mock, options).await;
        assert_eq!(report.status, PlanStatus::Succeeded);

        let transitions = plan.state().transitions();
        for spec in &specs {
            let started = transitions
                .iter()
                .find(|t| t.node == spec.id && t.to == NodeState::Attempting)
                .unwrap()
                .seq;
            for dep in &spec.depends_on {
                let done = transitions
                    .iter()
                    .find(|t| &t.node == dep && t.to.is_success())
                    .unwrap()
                    .seq;
                assert!(done < started, "{} attempted before {} succeeded", spec.id, dep);
            }
        }
    }

    #[tokio::test]
    async fn test_an012_blocks_exactly_transitive_dependents() {
        let mock = Arc::new(MockAdapter::new().on_create("a", vec![Err(permanent("denied"))]));
        let specs = vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["b"]),
            node("d", &["a", "e"]),
            node("e", &[]),
            node("f", &["e"]),
        ];
        let (report, _) = converge(specs, &mock, fast()).await;
        let blocked: Vec<&str> = report
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Blocked)
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(blocked, vec!["b", "c", "d"]);
        assert_eq!(state_of(&report, "e"), NodeState::Created);
        assert_eq!(state_of(&report, "f"), NodeState::Created);
    }

    #[tokio::test]
    async fn test_an012_concurrency_is_bounded() {
        let mock = Arc::new(MockAdapter::new().with_delay(Duration::from_millis(20)));
        let specs: Vec<_> = (0..6).map(|i| node(&format!("n{}", i), &[])).collect();
        let (report, _) = converge(specs, &mock, fast()).await;
        assert_eq!(report.count(NodeState::Created), 6);
        assert!(mock.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_an012_serial_runs_follow_input_order() {
        let mock = Arc::new(MockAdapter::new());
        let specs = vec![node("z", &[]), node("y", &["x"]), node("x", &[])];
        let mut options = fast();
        options.concurrency = 1;
        converge(specs, &mock, options).await;
        assert_eq!(mock.create_calls(), vec!["z", "x", "y"]);
        assert_eq!(mock.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_an012_fail_fast_cancels_the_rest() {
        let mock = Arc::new(MockAdapter::new().on_create("a", vec![Err(permanent("denied"))]));
        let specs = vec![node("a", &[]), node("b", &["a"]), node("c", &[]), node("d", &[])];
        let mut options = fast();
        options.concurrency = 1;
        options.fail_fast = true;
        let (report, _) = converge(specs, &mock, options).await;

        assert_eq!(state_of(&report, "a"), NodeState::PermanentFailure);
        assert_eq!(state_of(&report, "b"), NodeState::Blocked);
        assert_eq!(state_of(&report, "c"), NodeState::Cancelled);
        assert_eq!(state_of(&report, "d"), NodeState::Cancelled);
        assert_eq!(report.status, PlanStatus::Aborted);
        assert_eq!(mock.create_calls(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_an012_cancelled_before_start() {
        let mock = Arc::new(MockAdapter::new());
        let mut plan = Plan::build("test", vec![node("a", &[]), node("b", &["a"])], HashMap::new(), None)
            .unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = Engine::new(&registry(&mock), fast())
            .converge(&mut plan, &cancel)
            .await
            .unwrap();
        assert_eq!(report.count(NodeState::Cancelled), 2);
        assert_eq!(report.status, PlanStatus::Aborted);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_an012_cancel_lets_in_flight_calls_finish() {
        let mock = Arc::new(MockAdapter::new().with_delay(Duration::from_millis(50)));
        let specs = vec![node("a", &[]), node("b", &[]), node("c", &[])];
        let mut plan = Plan::build("test", specs, HashMap::new(), None).unwrap();
        let mut options = fast();
        options.concurrency = 1;

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let report = Engine::new(&registry(&mock), options)
            .converge(&mut plan, &cancel)
            .await
            .unwrap();

        assert_eq!(state_of(&report, "a"), NodeState::Created);
        assert_eq!(state_of(&report, "b"), NodeState::Cancelled);
        assert_eq!(state_of(&report, "c"), NodeState::Cancelled);
        assert_eq!(report.status, PlanStatus::Aborted);
        assert_eq!(mock.create_calls(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_an012_cancel_interrupts_backoff() {
        let mock = Arc::new(MockAdapter::new().on_create("a", vec![Err(transient("throttled"))]));
        let mut plan = Plan::build("test", vec![node("a", &[])], HashMap::new(), None).unwrap();
        let mut options = fast();
        options.retry.base_delay_ms = 60_000;
        options.retry.max_delay_ms = 60_000;

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let registry = registry(&mock);
        let engine = Engine::new(&registry, options);
        let report = tokio::time::timeout(Duration::from_secs(5), engine.converge(&mut plan, &cancel))
            .await
            .expect("backoff should not outlive cancellation")
            .unwrap();

        let a = report.node("a").unwrap();
        assert_eq!(a.state, NodeState::Cancelled);
        assert_eq!(a.attempts, 1);
        assert_eq!(mock.create_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_an012_panicking_adapter_is_permanent() {
        let mock = Arc::new(MockAdapter::new().panicking_on_create("a"));
        let specs = vec![node("a", &[]), node("b", &["a"]), node("c", &[])];
        let (report, _) = converge(specs, &mock, fast()).await;

        assert_eq!(state_of(&report, "a"), NodeState::PermanentFailure);
        assert_eq!(report.node("a").unwrap().attempts, 1);
        assert!(report
            .node("a")
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("adapter task failed"));
        assert_eq!(state_of(&report, "b"), NodeState::Blocked);
        assert_eq!(state_of(&report, "c"), NodeState::Created);
        assert_eq!(report.status, PlanStatus::PartiallyFailed);
    }

    #[tokio::test]
    async fn test_an012_timeout_is_transient() {
        let mock = Arc::new(MockAdapter::new().with_delay(Duration::from_millis(200)));
        let mut options = fast();
        options.call_timeout = Duration::from_millis(20);
        options.retry.max_attempts = 2;
        let (report, _) = converge(vec![node("a", &[])], &mock, options).await;
        let a = report.node("a").unwrap();
        assert_eq!(a.state, NodeState::PermanentFailure);
        assert_eq!(a.attempts, 2);
        assert!(a.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_an012_second_run_makes_no_creates() {
        let mock = Arc::new(MockAdapter::new());
        let specs = vec![node("sg", &[]), node("role", &[]), node("web", &["sg", "role"])];
        let (first, plan) = converge(specs.clone(), &mock, fast()).await;
        assert_eq!(first.status, PlanStatus::Succeeded);
        assert_eq!(mock.create_calls().len(), 3);

        let snapshot = plan.state().snapshot();
        let mut again = Plan::build("test", specs, HashMap::new(), Some(&snapshot)).unwrap();
        let second = run(&mut again, &mock, fast()).await;

        assert_eq!(mock.create_calls().len(), 3);
        assert_eq!(second.count(NodeState::AlreadyExists), 3);
        assert_eq!(second.status, PlanStatus::Succeeded);
        assert_eq!(
            second.node("web").unwrap().external_id.as_deref(),
            Some("id-web")
        );
        assert_eq!(
            again.state().transitions().len(),
            plan.state().transitions().len() + again.state().run_transitions().len()
        );
    }

    #[tokio::test]
    async fn test_an012_verify_recreates_missing_resource() {
        let first = Arc::new(MockAdapter::new());
        let specs = vec![node("a", &[])];
        let (_, plan) = converge(specs.clone(), &first, fast()).await;
        let snapshot = plan.state().snapshot();

        // Someone deleted it out of band
        let fresh = Arc::new(MockAdapter::new());
        let mut again = Plan::build("test", specs, HashMap::new(), Some(&snapshot)).unwrap();
        let report = run(&mut again, &fresh, fast()).await;
        assert_eq!(state_of(&report, "a"), NodeState::Created);
        assert_eq!(fresh.create_calls(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_an012_retry_resumes_only_failed_nodes() {
        let flaky = Arc::new(MockAdapter::new().on_create("b", vec![Err(permanent("quota"))]));
        let specs = vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])];
        let (first, plan) = converge(specs.clone(), &flaky, fast()).await;
        assert_eq!(first.status, PlanStatus::PartiallyFailed);

        let snapshot = plan.state().snapshot();
        let mut again = Plan::build("test", specs, HashMap::new(), Some(&snapshot)).unwrap();
        assert_eq!(again.action_of("a"), Some(PlanAction::Verify));
        assert_eq!(again.action_of("b"), Some(PlanAction::Retry));
        let second = run(&mut again, &flaky, fast()).await;
        assert_eq!(second.status, PlanStatus::Succeeded);
        assert_eq!(flaky.create_calls(), vec!["a", "b", "b", "c"]);
    }

    #[tokio::test]
    async fn test_an012_templates_resolve_from_dependencies() {
        let mock = Arc::new(MockAdapter::new());
        let web = node("web", &["sg"]).param("security_group", "{{resources.sg.external_id}}");
        let (report, _) = converge(vec![node("sg", &[]), web], &mock, fast()).await;
        assert_eq!(report.status, PlanStatus::Succeeded);
        let received = mock.received("web").unwrap();
        assert_eq!(
            received["security_group"],
            serde_yaml_ng::Value::String("id-sg".into())
        );
    }

    #[tokio::test]
    async fn test_an012_unresolvable_template_is_permanent() {
        let mock = Arc::new(
            MockAdapter::new().on_create("sg", vec![Ok(CreateOutcome::AlreadyExists(None))]),
        );
        let web = node("web", &["sg"]).param("security_group", "{{resources.sg.external_id}}");
        let (report, _) = converge(vec![node("sg", &[]), web], &mock, fast()).await;
        let web = report.node("web").unwrap();
        assert_eq!(web.state, NodeState::PermanentFailure);
        assert!(web.error.as_deref().unwrap().contains("no external id"));
        assert!(!mock.create_calls().contains(&"web".to_string()));
    }

    #[tokio::test]
    async fn test_an012_unknown_kind_fails_before_calls() {
        let mock = Arc::new(MockAdapter::new());
        let specs = vec![node("a", &[]), ResourceSpec::new("b", "ghost")];
        let mut plan = Plan::build("test", specs, HashMap::new(), None).unwrap();
        let err = Engine::new(&registry(&mock), fast())
            .converge(&mut plan, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::UnknownKind { .. }));
        assert!(mock.calls().is_empty());
        assert!(plan.state().transitions().is_empty());
    }

    async fn applied(mock: &Arc<MockAdapter>) -> PlanSnapshot {
        let specs = vec![node("sg", &[]), node("role", &[]), node("web", &["sg", "role"])];
        let (_, plan) = converge(specs, mock, fast()).await;
        plan.state().snapshot()
    }

    #[tokio::test]
    async fn test_an012_teardown_deletes_dependents_first() {
        let mock = Arc::new(MockAdapter::new());
        let snapshot = applied(&mock).await;
        let mut plan = Plan::teardown(&snapshot, HashMap::new()).unwrap();
        let mut options = fast();
        options.concurrency = 1;
        let report = run(&mut plan, &mock, options).await;

        assert_eq!(mock.delete_calls(), vec!["web", "role", "sg"]);
        assert_eq!(report.count(NodeState::Deleted), 3);
        assert_eq!(report.status, PlanStatus::Succeeded);
        assert!(report.provisioned().is_empty());
        assert!(!mock.exists("sg"));
    }

    #[tokio::test]
    async fn test_an012_teardown_skips_nodes_without_ids() {
        let mock = Arc::new(MockAdapter::new());
        let mut snapshot = applied(&mock).await;
        snapshot.nodes["role"].external_id = None;
        let mut plan = Plan::teardown(&snapshot, HashMap::new()).unwrap();
        let report = run(&mut plan, &mock, fast()).await;

        assert_eq!(state_of(&report, "role"), NodeState::Absent);
        assert!(!mock.delete_calls().contains(&"role".to_string()));
        assert_eq!(report.status, PlanStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_an012_teardown_failure_blocks_dependencies() {
        let mock = Arc::new(
            MockAdapter::new().on_delete("web", vec![Err(permanent("DependencyViolation"))]),
        );
        let snapshot = applied(&mock).await;
        let mut plan = Plan::teardown(&snapshot, HashMap::new()).unwrap();
        let report = run(&mut plan, &mock, fast()).await;

        assert_eq!(state_of(&report, "web"), NodeState::PermanentFailure);
        assert_eq!(state_of(&report, "sg"), NodeState::Blocked);
        assert_eq!(state_of(&report, "role"), NodeState::Blocked);
        assert_eq!(report.status, PlanStatus::PartiallyFailed);
        assert_eq!(mock.delete_calls(), vec!["web"]);
        assert_eq!(report.provisioned(), vec!["sg", "role", "web"]);
    }

    #[tokio::test]
    async fn test_an012_teardown_not_found_counts_as_deleted() {
        let mock = Arc::new(
            MockAdapter::new().on_delete("sg", vec![Ok(DeleteOutcome::NotFound)]),
        );
        let snapshot = applied(&mock).await;
        let mut plan = Plan::teardown(&snapshot, HashMap::new()).unwrap();
        let report = run(&mut plan, &mock, fast()).await;
        assert_eq!(state_of(&report, "sg"), NodeState::Deleted);
        assert_eq!(report.status, PlanStatus::Succeeded);
    }

    #[test]
    fn test_an012_options_from_policy() {
        let policy = Policy {
            fail_fast: true,
            concurrency: 8,
            call_timeout_secs: 30,
            ..Policy::default()
        };
        let options = EngineOptions::from(&policy);
        assert!(options.fail_fast);
        assert_eq!(options.concurrency, 8);
        assert_eq!(options.call_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_an012_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), clone.cancelled())
            .await
            .unwrap();
    }

    fn script_config(world: &Path) -> ProvisionConfig {
        let yaml = r#"
version: "1.0"
name: script-stack
params:
  world: WORLD_DIR
adapters:
  thing:
    describe: 'cat "$ANDAMIO_PARAM_WORLD/$ANDAMIO_PARAM_NAME" 2>/dev/null || exit 2'
    create: 'echo "id-$ANDAMIO_PARAM_NAME" | tee "$ANDAMIO_PARAM_WORLD/$ANDAMIO_PARAM_NAME"'
    delete: 'rm "$ANDAMIO_PARAM_WORLD/$ANDAMIO_PARAM_NAME" || exit 2'
resources:
  sg:
    kind: thing
    parameters:
      name: sg
      world: "{{params.world}}"
  web:
    kind: thing
    depends_on: [sg]
    parameters:
      name: web
      world: "{{params.world}}"
      security_group: "{{resources.sg.external_id}}"
"#
        .replace("WORLD_DIR", &world.display().to_string());
        serde_yaml_ng::from_str(&yaml).unwrap()
    }

    #[tokio::test]
    async fn test_an012_apply_and_destroy_with_scripts() {
        let world = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let config = script_config(world.path());
        let registry = AdapterRegistry::from_config(&config);
        let cfg = ApplyConfig {
            config: &config,
            state_dir: state_dir.path(),
            options: EngineOptions::from(&config.policy),
        };
        let cancel = CancelToken::new();

        let first = apply(&cfg, &registry, &cancel).await.unwrap();
        assert_eq!(first.status, PlanStatus::Succeeded);
        assert_eq!(first.count(NodeState::Created), 2);
        assert!(world.path().join("web").exists());

        let saved = state::load_snapshot(state_dir.path(), "script-stack")
            .unwrap()
            .unwrap();
        assert_eq!(saved.nodes["sg"].external_id.as_deref(), Some("id-sg"));

        let second = apply(&cfg, &registry, &cancel).await.unwrap();
        assert_eq!(second.count(NodeState::AlreadyExists), 2);

        let destroyed = destroy(&cfg, &registry, &cancel).await.unwrap().unwrap();
        assert_eq!(destroyed.count(NodeState::Deleted), 2);
        assert!(!world.path().join("sg").exists());

        let events = eventlog::read_events(state_dir.path(), "script-stack").unwrap();
        let completed = events
            .iter()
            .filter(|e| matches!(e.event, ProvenanceEvent::RunCompleted { .. }))
            .count();
        assert_eq!(completed, 3);
        assert!(events
            .iter()
            .any(|e| matches!(e.event, ProvenanceEvent::NodeTransition { to: NodeState::Deleted, .. })));
    }

    #[tokio::test]
    async fn test_an012_destroy_without_state() {
        let world = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let config = script_config(world.path());
        let cfg = ApplyConfig {
            config: &config,
            state_dir: state_dir.path(),
            options: EngineOptions::default(),
        };
        let registry = AdapterRegistry::from_config(&config);
        assert!(destroy(&cfg, &registry, &CancelToken::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_an012_policy_can_disable_persistence() {
        let world = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let mut config = script_config(world.path());
        config.policy.lock_file = false;
        config.policy.tripwire = false;
        let cfg = ApplyConfig {
            config: &config,
            state_dir: state_dir.path(),
            options: EngineOptions::from(&config.policy),
        };
        let registry = AdapterRegistry::from_config(&config);
        apply(&cfg, &registry, &CancelToken::new()).await.unwrap();
        assert!(!state_dir.path().join("script-stack").exists());
    }

    fn mock_config() -> ProvisionConfig {
        serde_yaml_ng::from_str(
            r#"
version: "1.0"
name: mock-stack
resources:
  a:
    kind: mock
    parameters: {name: a}
  b:
    kind: mock
    depends_on: [a]
    parameters: {name: b}
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_an012_interrupted_apply_keeps_finished_nodes() {
        let state_dir = tempfile::tempdir().unwrap();
        let config = mock_config();
        let cfg = ApplyConfig {
            config: &config,
            state_dir: state_dir.path(),
            options: fast(),
        };

        // `b` hangs; dropping the apply future is what a killed process looks like.
        let hanging = Arc::new(MockAdapter::new().with_slow("b", Duration::from_secs(30)));
        let hanging_registry = registry(&hanging);
        let interrupted = tokio::time::timeout(
            Duration::from_millis(300),
            apply(&cfg, &hanging_registry, &CancelToken::new()),
        )
        .await;
        assert!(interrupted.is_err());

        let saved = state::load_snapshot(state_dir.path(), "mock-stack")
            .unwrap()
            .unwrap();
        assert_eq!(saved.nodes["a"].state, NodeState::Created);
        assert_eq!(saved.nodes["a"].external_id.as_deref(), Some("id-a"));

        let events = eventlog::read_events(state_dir.path(), "mock-stack").unwrap();
        assert!(events.iter().any(|e| matches!(
            &e.event,
            ProvenanceEvent::NodeTransition { node, to: NodeState::Created, .. } if node == "a"
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e.event, ProvenanceEvent::RunCompleted { .. })));

        // The provider still holds `a`; the next run finds it instead of creating it again.
        let provider = Arc::new(MockAdapter::new().with_existing("a", "id-a"));
        let resumed = apply(&cfg, &registry(&provider), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(resumed.status, PlanStatus::Succeeded);
        assert_eq!(state_of(&resumed, "a"), NodeState::AlreadyExists);
        assert_eq!(provider.create_calls(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_an012_apply_rejects_unregistered_kind() {
        let state_dir = tempfile::tempdir().unwrap();
        let config = mock_config();
        let cfg = ApplyConfig {
            config: &config,
            state_dir: state_dir.path(),
            options: fast(),
        };
        let err = apply(&cfg, &AdapterRegistry::new(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.contains("mock"), "{}", err);
        assert!(!state_dir.path().join("mock-stack").exists());
    }
}

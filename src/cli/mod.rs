//! AN-017: CLI subcommands — init, validate, plan, apply, destroy, status,
//! drift, history, completions.

use crate::adapter::AdapterRegistry;
use crate::audit::{drift, eventlog};
use crate::core::executor::{self, ApplyConfig, CancelToken, EngineOptions};
use crate::core::planner::Plan;
use crate::core::{parser, state, types};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "andamio",
    version,
    about = "Idempotent, dependency-ordered provisioning of external resource graphs"
)]
pub struct Cli {
    /// Log engine activity to stderr (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new andamio project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate andamio.yaml without calling any adapter
    Validate {
        /// Path to andamio.yaml
        #[arg(short, long, default_value = "andamio.yaml")]
        file: PathBuf,
    },

    /// Show what an apply would do against the last snapshot
    Plan {
        /// Path to andamio.yaml
        #[arg(short, long, default_value = "andamio.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Converge resources to the desired state
    Apply {
        /// Path to andamio.yaml
        #[arg(short, long, default_value = "andamio.yaml")]
        file: PathBuf,

        /// Show the plan without calling adapters
        #[arg(long)]
        dry_run: bool,

        /// Stop scheduling after the first permanent failure
        #[arg(long)]
        fail_fast: bool,

        /// Maximum adapter calls in flight (overrides policy)
        #[arg(long)]
        concurrency: Option<usize>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Delete everything the last snapshot records, dependents first
    Destroy {
        /// Path to andamio.yaml
        #[arg(short, long, default_value = "andamio.yaml")]
        file: PathBuf,

        /// Show what would be deleted without calling adapters
        #[arg(long)]
        dry_run: bool,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Show persisted plan state
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Only this plan
        #[arg(short, long)]
        plan: Option<String>,
    },

    /// Detect resources that vanished or changed id since the last run
    Drift {
        /// Path to andamio.yaml
        #[arg(short, long, default_value = "andamio.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Exit non-zero on any drift (for CI/cron)
        #[arg(long)]
        tripwire: bool,
    },

    /// Show the event log of a plan
    History {
        /// Plan name
        plan: String,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Most recent events to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Plan { file, state_dir } => cmd_plan(&file, &state_dir),
        Commands::Apply {
            file,
            dry_run,
            fail_fast,
            concurrency,
            state_dir,
        } => {
            let cancel = cancel_on_ctrl_c();
            cmd_apply(&file, &state_dir, dry_run, fail_fast, concurrency, &cancel).await
        }
        Commands::Destroy {
            file,
            dry_run,
            state_dir,
        } => {
            let cancel = cancel_on_ctrl_c();
            cmd_destroy(&file, &state_dir, dry_run, &cancel).await
        }
        Commands::Status { state_dir, plan } => cmd_status(&state_dir, plan.as_deref()),
        Commands::Drift {
            file,
            state_dir,
            tripwire,
        } => cmd_drift(&file, &state_dir, tripwire).await,
        Commands::History {
            plan,
            state_dir,
            limit,
        } => cmd_history(&state_dir, &plan, limit),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "andamio", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// First Ctrl-C cancels the plan; in-flight calls still finish and persist.
fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted: cancelling pending resources, waiting for in-flight calls...");
            trigger.cancel();
        }
    });
    cancel
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("andamio.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;

    let template = r#"version: "1.0"
name: my-stack
description: "Managed by andamio"

params: {}

# One entry per resource kind. Scripts run under bash with parameters
# exported as ANDAMIO_PARAM_<KEY>; create prints the new id on its last line.
adapters: {}

resources: {}

policy:
  fail_fast: false
  concurrency: 2
  tripwire: true
  lock_file: true
"#;
    std::fs::write(&config_path, template)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized andamio project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);

    if errors.is_empty() {
        println!(
            "OK: {} ({} adapters, {} resources)",
            config.name,
            config.adapters.len(),
            config.resources.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

/// Parse and validate a plan file, returning errors if invalid.
fn parse_and_validate(file: &Path) -> Result<types::ProvisionConfig, String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err("validation failed".to_string())
}

fn cmd_plan(file: &Path, state_dir: &Path) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    print_plan(&load_plan(&config, state_dir)?);
    Ok(())
}

/// Plan against the saved snapshot; every kind must have an adapter.
fn load_plan(config: &types::ProvisionConfig, state_dir: &Path) -> Result<Plan, String> {
    let prior = state::load_snapshot(state_dir, &config.name)?;
    let plan = Plan::from_config(config, prior.as_ref()).map_err(|e| e.to_string())?;
    plan.check_adapters(&AdapterRegistry::from_config(config))
        .map_err(|e| e.to_string())?;
    Ok(plan)
}

/// Display a plan to stdout.
fn print_plan(plan: &Plan) {
    let view = plan.execution_plan();
    let teardown = plan.direction() == types::Direction::Teardown;
    println!(
        "{}: {} ({} resources)",
        if teardown { "Destroying" } else { "Planning" },
        view.name,
        view.changes.len()
    );
    println!();

    for change in &view.changes {
        let symbol = match (teardown, change.action) {
            (true, _) => "-",
            (false, types::PlanAction::Create) => "+",
            (false, types::PlanAction::Verify) => " ",
            (false, types::PlanAction::Update) => "~",
            (false, types::PlanAction::Retry) => "!",
        };
        println!("  {} {}", symbol, change.description);
    }

    println!();
    if teardown {
        let with_ids = plan
            .state()
            .nodes()
            .values()
            .filter(|n| n.external_id.is_some())
            .count();
        println!("Destroy: {} to delete, {} already absent.", with_ids, view.changes.len() - with_ids);
    } else {
        println!(
            "Plan: {} to create, {} to verify, {} to update, {} to retry.",
            view.to_create, view.to_verify, view.to_update, view.to_retry
        );
    }
}

/// Print a run report and turn a non-successful status into an error.
fn print_report(report: &types::RunReport) -> Result<(), String> {
    for node in &report.nodes {
        let id = node
            .external_id
            .as_deref()
            .map(|e| format!(" [{}]", e))
            .unwrap_or_default();
        let attempts = if node.attempts > 1 {
            format!(" ({} attempts)", node.attempts)
        } else {
            String::new()
        };
        println!("  {}: {}{}{}", node.id, node.state, id, attempts);
        if let Some(error) = &node.error {
            println!("    {}", error);
        }
    }
    println!();
    println!(
        "{} {}: {} in {:.1}s",
        report.direction, report.plan, report.status, report.total_seconds
    );

    if report.status == types::PlanStatus::Succeeded {
        return Ok(());
    }
    let pending = report.needs_retry();
    println!("Needs retry: {}", pending.join(", "));
    Err(format!("{} resource(s) not converged", pending.len()))
}

async fn cmd_apply(
    file: &Path,
    state_dir: &Path,
    dry_run: bool,
    fail_fast: bool,
    concurrency: Option<usize>,
    cancel: &CancelToken,
) -> Result<(), String> {
    let config = parse_and_validate(file)?;

    if dry_run {
        print_plan(&load_plan(&config, state_dir)?);
        println!("Dry run — no changes applied.");
        return Ok(());
    }

    let mut options = EngineOptions::from(&config.policy);
    options.fail_fast |= fail_fast;
    if let Some(n) = concurrency {
        options.concurrency = n.max(1);
    }

    let registry = AdapterRegistry::from_config(&config);
    let cfg = ApplyConfig {
        config: &config,
        state_dir,
        options,
    };
    let report = executor::apply(&cfg, &registry, cancel).await?;
    print_report(&report)
}

async fn cmd_destroy(
    file: &Path,
    state_dir: &Path,
    dry_run: bool,
    cancel: &CancelToken,
) -> Result<(), String> {
    let config = parse_and_validate(file)?;

    if dry_run {
        match state::load_snapshot(state_dir, &config.name)? {
            Some(snapshot) => {
                let plan = Plan::teardown(&snapshot, config.params.clone())
                    .map_err(|e| e.to_string())?;
                print_plan(&plan);
                println!("Dry run — nothing deleted.");
            }
            None => println!("No state for {}; nothing to destroy.", config.name),
        }
        return Ok(());
    }

    let registry = AdapterRegistry::from_config(&config);
    let cfg = ApplyConfig {
        config: &config,
        state_dir,
        options: EngineOptions::from(&config.policy),
    };
    match executor::destroy(&cfg, &registry, cancel).await? {
        Some(report) => print_report(&report),
        None => {
            println!("No state for {}; nothing to destroy.", config.name);
            Ok(())
        }
    }
}

async fn cmd_drift(file: &Path, state_dir: &Path, tripwire_mode: bool) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let Some(snapshot) = state::load_snapshot(state_dir, &config.name)? else {
        println!("No state for {}. Run `andamio apply` first.", config.name);
        return Ok(());
    };

    println!("Checking {} ({} resources)...", snapshot.plan, snapshot.nodes.len());
    let registry = AdapterRegistry::from_config(&config);
    let limit = Duration::from_secs(config.policy.call_timeout_secs);
    let findings = drift::detect_drift(&snapshot, &config.params, &registry, limit).await;

    if findings.is_empty() {
        println!("No drift detected.");
        return Ok(());
    }

    for f in &findings {
        println!("  DRIFTED: {} ({})", f.resource_id, f.detail);
        println!("    Expected: {}", f.expected_id);
        println!("    Actual:   {}", f.actual_id);
    }
    if config.policy.tripwire {
        eventlog::append_events(
            state_dir,
            &snapshot.plan,
            &drift::drift_events(&snapshot.plan, &findings),
        )?;
    }

    println!();
    println!("Drift detected: {} resource(s)", findings.len());
    if tripwire_mode {
        return Err(format!("{} drift finding(s)", findings.len()));
    }
    Ok(())
}

fn cmd_status(state_dir: &Path, plan_filter: Option<&str>) -> Result<(), String> {
    let entries = std::fs::read_dir(state_dir)
        .map_err(|e| format!("cannot read state dir {}: {}", state_dir.display(), e))?;

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| plan_filter.is_none_or(|f| f == name.as_str()))
        .collect();
    names.sort();

    let mut found = false;
    for name in &names {
        let Some(snapshot) = state::load_snapshot(state_dir, name)? else {
            continue;
        };
        found = true;
        println!("Plan: {} ({})", snapshot.plan, snapshot.status);
        println!("  Run:       {} ({})", snapshot.run_id, snapshot.direction);
        println!("  Generated: {}", snapshot.generated_at);
        println!("  Generator: {}", snapshot.generator);
        println!("  Resources: {}", snapshot.nodes.len());
        for (id, node) in &snapshot.nodes {
            let ext = node
                .external_id
                .as_deref()
                .map(|e| format!(" {}", e))
                .unwrap_or_default();
            println!("    {}: {} [{}]{}", id, node.state, node.spec.kind, ext);
        }
        println!();
    }

    if !found {
        println!("No state found. Run `andamio apply` first.");
    }
    Ok(())
}

fn cmd_history(state_dir: &Path, plan: &str, limit: usize) -> Result<(), String> {
    let events = eventlog::read_events(state_dir, plan)?;
    if events.is_empty() {
        println!("No events for {}.", plan);
        return Ok(());
    }
    let skip = events.len().saturating_sub(limit);
    for e in &events[skip..] {
        println!("{} {}", e.ts, describe_event(&e.event));
    }
    Ok(())
}

fn describe_event(event: &types::ProvenanceEvent) -> String {
    use types::ProvenanceEvent::*;
    match event {
        RunStarted {
            run_id, direction, ..
        } => format!("{} {} started", run_id, direction),
        NodeTransition {
            run_id,
            node,
            from,
            to,
            attempt,
            error,
            ..
        } => {
            let base = format!("{} {}: {} -> {} (attempt {})", run_id, node, from, to, attempt);
            match error {
                Some(e) => format!("{}: {}", base, e),
                None => base,
            }
        }
        RunCompleted {
            run_id,
            status,
            succeeded,
            failed,
            total_seconds,
            ..
        } => format!(
            "{} {} ({} ok, {} failed, {:.1}s)",
            run_id, status, succeeded, failed, total_seconds
        ),
        DriftDetected {
            node,
            expected_id,
            actual_id,
            ..
        } => format!("drift {}: expected {}, found {}", node, expected_id, actual_id),
    }
}

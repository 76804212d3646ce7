//! AN-015: Append-only JSONL provenance event log.

use crate::core::types::{ProvenanceEvent, TimestampedEvent, Transition};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current UTC time as ISO 8601, second precision.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_utc(secs)
}

/// Format seconds since the epoch as `YYYY-MM-DDTHH:MM:SSZ`.
fn format_utc(secs: u64) -> String {
    let (y, m, d) = civil_from_days((secs / 86_400) as i64);
    let rem = secs % 86_400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y,
        m,
        d,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

// Days since 1970-01-01 to proleptic Gregorian (y, m, d).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    format!("r-{:012x}", rand::random::<u64>() & 0xFFFF_FFFF_FFFF)
}

/// Derive the event log path for a plan.
pub fn event_log_path(state_dir: &Path, plan: &str) -> PathBuf {
    state_dir.join(plan).join("events.jsonl")
}

/// One `node_transition` event per transition.
pub fn transition_events(plan: &str, transitions: &[Transition]) -> Vec<ProvenanceEvent> {
    transitions
        .iter()
        .map(|t| ProvenanceEvent::NodeTransition {
            plan: plan.to_string(),
            run_id: t.run_id.clone(),
            seq: t.seq,
            node: t.node.clone(),
            from: t.from,
            to: t.to,
            attempt: t.attempt,
            error: t.error.clone(),
        })
        .collect()
}

/// Append an event to the plan's event log.
pub fn append_event(state_dir: &Path, plan: &str, event: ProvenanceEvent) -> Result<(), String> {
    append_events(state_dir, plan, std::slice::from_ref(&event))
}

/// Append events in order, one JSON object per line.
pub fn append_events(
    state_dir: &Path,
    plan: &str,
    events: &[ProvenanceEvent],
) -> Result<(), String> {
    let path = event_log_path(state_dir, plan);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create state dir: {}", e))?;
    }

    let ts = now_iso8601();
    let mut buf = String::new();
    for event in events {
        let te = TimestampedEvent {
            ts: ts.clone(),
            event: event.clone(),
        };
        let json =
            serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;
        buf.push_str(&json);
        buf.push('\n');
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;
    file.write_all(buf.as_bytes())
        .map_err(|e| format!("write error: {}", e))?;

    Ok(())
}

/// Read back every event. A missing log is empty.
pub fn read_events(state_dir: &Path, plan: &str) -> Result<Vec<TimestampedEvent>, String> {
    let path = event_log_path(state_dir, plan);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| format!("{}:{}: invalid event: {}", path.display(), i + 1, e))
        })
        .collect()
}

//! AN-002: YAML parsing and validation.
//!
//! Parses andamio.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Every resource kind has a script adapter
//! - The dependency graph is closed and acyclic
//! - Template references resolve to params or declared dependencies
//! - Policy values are usable

use super::resolver::{validate_templates, DependencyGraph};
use super::types::*;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Parse an andamio.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<ProvisionConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse an andamio.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<ProvisionConfig, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &ProvisionConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(ValidationError::new(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        )));
    }

    // The name becomes a directory under the state dir
    if config.name.is_empty() {
        errors.push(ValidationError::new("name must not be empty"));
    } else if config.name.contains(['/', '\\']) || config.name == "." || config.name == ".." {
        errors.push(ValidationError::new(format!(
            "name '{}' must not contain path separators",
            config.name
        )));
    }

    for (kind, adapter) in &config.adapters {
        for (op, script) in [
            ("describe", &adapter.describe),
            ("create", &adapter.create),
            ("delete", &adapter.delete),
        ] {
            if script.trim().is_empty() {
                errors.push(ValidationError::new(format!(
                    "adapter '{}' has an empty {} script",
                    kind, op
                )));
            }
        }
    }

    for (id, resource) in &config.resources {
        if !config.adapters.contains_key(&resource.kind) {
            errors.push(ValidationError::new(
                PlanError::UnknownKind {
                    resource: id.clone(),
                    kind: resource.kind.clone(),
                }
                .to_string(),
            ));
        }
    }

    let specs = config.specs();
    match DependencyGraph::build(&specs) {
        Ok(_) => {
            if let Err(e) = validate_templates(&specs, &config.params) {
                errors.push(ValidationError::new(e.to_string()));
            }
        }
        Err(e) => errors.push(ValidationError::new(e.to_string())),
    }

    let policy = &config.policy;
    if policy.concurrency == 0 {
        errors.push(ValidationError::new("policy.concurrency must be at least 1"));
    }
    if policy.retry.max_attempts == 0 {
        errors.push(ValidationError::new(
            "policy.retry.max_attempts must be at least 1",
        ));
    }
    if policy.retry.base_delay_ms > policy.retry.max_delay_ms {
        errors.push(ValidationError::new(format!(
            "policy.retry.base_delay_ms ({}) exceeds max_delay_ms ({})",
            policy.retry.base_delay_ms, policy.retry.max_delay_ms
        )));
    }
    if policy.call_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "policy.call_timeout_secs must be at least 1",
        ));
    }

    errors
}

//! AN-011: Script adapter — shell commands per resource kind.
//!
//! Each operation runs under `bash` with the resolved parameters exported as
//! `ANDAMIO_PARAM_<KEY>` and, for delete, the provider id as
//! `ANDAMIO_EXTERNAL_ID`. Outcomes are classified by exit code only; output
//! text is never matched.

use super::{AdapterError, CreateOutcome, DeleteOutcome, ResourceAdapter};
use crate::core::types::{yaml_value_to_string, ExitCodes, Parameters, ScriptAdapterConfig};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Output from running one script.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stdout line, trimmed.
    pub fn last_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
    }

    fn failure_detail(&self) -> String {
        let tail = self
            .stderr
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .unwrap_or("");
        if tail.is_empty() {
            format!("exit code {}", self.exit_code)
        } else {
            format!("exit code {}: {}", self.exit_code, tail)
        }
    }
}

/// `group_name` → `ANDAMIO_PARAM_GROUP_NAME`.
pub fn param_env_name(key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("ANDAMIO_PARAM_{}", key)
}

/// Execute a script via `bash`, reading it from stdin.
pub async fn exec_bash(script: &str, env: &[(String, String)]) -> Result<ExecOutput, String> {
    let mut child = Command::new("bash")
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn bash: {}", e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|e| format!("stdin write error: {}", e))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("wait error: {}", e))?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Adapter backed by the `describe` / `create` / `delete` commands of one kind.
#[derive(Debug, Clone)]
pub struct ScriptAdapter {
    kind: String,
    config: ScriptAdapterConfig,
}

impl ScriptAdapter {
    pub fn new(kind: &str, config: ScriptAdapterConfig) -> Self {
        Self {
            kind: kind.to_string(),
            config,
        }
    }

    fn codes(&self) -> &ExitCodes {
        &self.config.exit_codes
    }

    async fn run(
        &self,
        op: &str,
        script: &str,
        params: &Parameters,
        external_id: Option<&str>,
    ) -> Result<ExecOutput, AdapterError> {
        let mut env: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (param_env_name(k), yaml_value_to_string(v)))
            .collect();
        env.push(("ANDAMIO_KIND".to_string(), self.kind.clone()));
        if let Some(id) = external_id {
            env.push(("ANDAMIO_EXTERNAL_ID".to_string(), id.to_string()));
        }

        tracing::debug!(kind = %self.kind, op, "running script");
        let out = exec_bash(script, &env)
            .await
            .map_err(|e| AdapterError::Permanent(format!("{} {}: {}", self.kind, op, e)))?;
        tracing::debug!(kind = %self.kind, op, exit_code = out.exit_code, "script finished");
        Ok(out)
    }

    /// Map a non-zero exit that isn't an operation-specific signal.
    fn classify_failure(&self, op: &str, out: &ExecOutput) -> AdapterError {
        let message = format!("{} {}: {}", self.kind, op, out.failure_detail());
        if self.codes().transient.contains(&out.exit_code) {
            AdapterError::Transient(message)
        } else {
            AdapterError::Permanent(message)
        }
    }
}

#[async_trait]
impl ResourceAdapter for ScriptAdapter {
    async fn describe(&self, params: &Parameters) -> Result<Option<String>, AdapterError> {
        let out = self
            .run("describe", &self.config.describe, params, None)
            .await?;
        if out.success() {
            return Ok(out.last_line().map(str::to_string));
        }
        if out.exit_code == self.codes().not_found {
            return Ok(None);
        }
        Err(self.classify_failure("describe", &out))
    }

    async fn create(&self, params: &Parameters) -> Result<CreateOutcome, AdapterError> {
        let out = self.run("create", &self.config.create, params, None).await?;
        if out.success() {
            return match out.last_line() {
                Some(id) => Ok(CreateOutcome::Created(id.to_string())),
                None => Err(AdapterError::Permanent(format!(
                    "{} create: succeeded without printing an external id",
                    self.kind
                ))),
            };
        }
        if out.exit_code == self.codes().already_exists {
            return Ok(CreateOutcome::AlreadyExists(
                out.last_line().map(str::to_string),
            ));
        }
        Err(self.classify_failure("create", &out))
    }

    async fn delete(
        &self,
        external_id: &str,
        params: &Parameters,
    ) -> Result<DeleteOutcome, AdapterError> {
        let out = self
            .run("delete", &self.config.delete, params, Some(external_id))
            .await?;
        if out.success() {
            return Ok(DeleteOutcome::Deleted);
        }
        if out.exit_code == self.codes().not_found {
            return Ok(DeleteOutcome::NotFound);
        }
        Err(self.classify_failure("delete", &out))
    }
}

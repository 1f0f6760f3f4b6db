use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use burnish_core::agent::{AgentBackend, ExecuteRequest, ScoutReport, ScoutRequest};
use burnish_core::types::{FailureReason, TicketOutcome};
use tokio::process::Command;
use tracing::{info, warn};

/// Runs Codex (openai/codex) via the `codex` CLI in full-auto mode.
pub struct CodexBackend {
    pub api_key: String,
    pub model: String,
    pub codex_bin: String,
    pub timeout_s: u64,
}

impl CodexBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            codex_bin: "codex".into(),
            timeout_s: 0,
        }
    }

    pub fn with_bin(mut self, bin: impl Into<String>) -> Self {
        self.codex_bin = bin.into();
        self
    }

    pub fn with_timeout(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    pub async fn is_available(&self) -> bool {
        Command::new(&self.codex_bin)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn run(&self, dir: &str, instruction: String) -> Result<(String, bool, bool)> {
        if !self.is_available().await {
            bail!("codex binary not found: {}", self.codex_bin);
        }
        let mut cmd = Command::new(&self.codex_bin);
        cmd.args(["exec", "--full-auto", "--model", &self.model, &instruction])
            .kill_on_drop(true)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !self.api_key.is_empty() {
            cmd.env("OPENAI_API_KEY", &self.api_key);
        }

        let fut = async {
            let output = cmd.output().await.context("failed to run codex")?;
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if !stderr.trim().is_empty() {
                warn!("codex stderr: {}", stderr.trim());
            }
            anyhow::Ok((stdout, output.status.success()))
        };

        if self.timeout_s > 0 {
            match tokio::time::timeout(std::time::Duration::from_secs(self.timeout_s), fut).await {
                Ok(result) => {
                    let (out, ok) = result?;
                    Ok((out, ok, false))
                }
                Err(_elapsed) => {
                    warn!(timeout_s = self.timeout_s, "codex subprocess timed out");
                    Ok((String::new(), false, true))
                }
            }
        } else {
            let (out, ok) = fut.await?;
            Ok((out, ok, false))
        }
    }
}

#[async_trait]
impl AgentBackend for CodexBackend {
    fn name(&self) -> &str {
        "codex"
    }

    async fn scout(&self, req: &ScoutRequest) -> Result<ScoutReport> {
        let instruction = crate::instruction::build_scout_instruction(req);
        info!(scope = %req.scope, model = %self.model, "running codex scout");
        let (output, success, timed_out) = self.run(&req.repo_root, instruction).await?;
        if timed_out || !success {
            warn!(scope = %req.scope, timed_out, "codex scout did not complete cleanly");
            return Ok(ScoutReport::default());
        }
        Ok(crate::event::parse_scout_output(&output))
    }

    async fn execute(&self, req: &ExecuteRequest) -> Result<TicketOutcome> {
        let instruction = crate::instruction::build_execute_instruction(req);
        info!(ticket = req.ticket.id, branch = %req.branch, "running codex executor");
        let (output, success, timed_out) = self.run(&req.worktree_path, instruction).await?;
        if timed_out {
            return Ok(TicketOutcome::failed(
                FailureReason::Timeout,
                format!("codex timed out after {}s", self.timeout_s),
            ));
        }
        Ok(crate::event::parse_outcome(&output, success))
    }
}

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use burnish_core::agent::{AgentBackend, ExecuteRequest, ScoutReport, ScoutRequest};
use burnish_core::types::{FailureReason, TicketOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

const SCOUT_TOOLS: &str = "Read,Glob,Grep,Bash";
const EXECUTE_TOOLS: &str = "Read,Glob,Grep,Write,Edit,Bash";

/// Runs Claude Code as a subprocess with `--output-format stream-json`.
pub struct ClaudeBackend {
    /// Path to the `claude` CLI binary.
    pub claude_bin: String,
    pub model: String,
    /// Kill subprocess and return a timed-out result after this many seconds
    /// (0 = no limit).
    pub timeout_s: u64,
}

impl ClaudeBackend {
    pub fn new(claude_bin: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            claude_bin: claude_bin.into(),
            model: model.into(),
            timeout_s: 0,
        }
    }

    pub fn with_timeout(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    pub async fn is_available(&self) -> bool {
        Command::new(&self.claude_bin)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Spawn the CLI in `dir`, stream its NDJSON output, and return
    /// (final text, exit success, timed out).
    async fn run(&self, dir: &str, allowed_tools: &str, instruction: String) -> Result<(String, bool, bool)> {
        let mut child = Command::new(&self.claude_bin)
            .args([
                "--model",
                &self.model,
                "--output-format",
                "stream-json",
                "--verbose",
                "--allowedTools",
                allowed_tools,
                "--max-turns",
                "200",
                "--print",
                &instruction,
            ])
            .kill_on_drop(true)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn claude: {}", self.claude_bin))?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;

        let io_future = async move {
            let mut raw_stream = String::new();
            let mut stdout_reader = BufReader::new(stdout).lines();
            let mut stderr_reader = BufReader::new(stderr).lines();

            loop {
                tokio::select! {
                    line = stdout_reader.next_line() => {
                        match line.context("error reading stdout")? {
                            Some(l) => {
                                raw_stream.push_str(&l);
                                raw_stream.push('\n');
                            }
                            None => break,
                        }
                    }
                    line = stderr_reader.next_line() => {
                        if let Ok(Some(l)) = line {
                            if !l.is_empty() {
                                warn!("claude stderr: {l}");
                            }
                        }
                    }
                }
            }

            while let Ok(Some(l)) = stderr_reader.next_line().await {
                if !l.is_empty() {
                    warn!("claude stderr: {l}");
                }
            }

            let exit_status = child.wait().await.context("failed to wait for claude")?;
            anyhow::Ok((raw_stream, exit_status.success()))
        };

        let (raw_stream, success) = if self.timeout_s > 0 {
            match tokio::time::timeout(std::time::Duration::from_secs(self.timeout_s), io_future)
                .await
            {
                Ok(result) => result?,
                Err(_elapsed) => {
                    warn!(timeout_s = self.timeout_s, "claude subprocess timed out");
                    return Ok((String::new(), false, true));
                }
            }
        } else {
            io_future.await?
        };

        let (output, _session_id) = crate::event::parse_stream(&raw_stream);
        Ok((output, success, false))
    }
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &str {
        "claude"
    }

    async fn scout(&self, req: &ScoutRequest) -> Result<ScoutReport> {
        let instruction = crate::instruction::build_scout_instruction(req);
        info!(scope = %req.scope, model = %self.model, "spawning claude scout");
        let (output, success, timed_out) = self.run(&req.repo_root, SCOUT_TOOLS, instruction).await?;
        if timed_out || !success {
            warn!(scope = %req.scope, timed_out, "claude scout did not complete cleanly");
            return Ok(ScoutReport::default());
        }
        Ok(crate::event::parse_scout_output(&output))
    }

    async fn execute(&self, req: &ExecuteRequest) -> Result<TicketOutcome> {
        let instruction = crate::instruction::build_execute_instruction(req);
        info!(
            ticket = req.ticket.id,
            branch = %req.branch,
            "spawning claude executor"
        );
        let (output, success, timed_out) =
            self.run(&req.worktree_path, EXECUTE_TOOLS, instruction).await?;
        if timed_out {
            return Ok(TicketOutcome::failed(
                FailureReason::Timeout,
                format!("claude timed out after {}s", self.timeout_s),
            ));
        }
        Ok(crate::event::parse_outcome(&output, success))
    }
}

//! Shell command jobs, the kind that can be persisted and restored.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::dcron::Dcron;
use crate::error::Result;
use crate::job::Job;

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecJob {
    pub name: String,
    pub cron: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExecOutcome {
    Exited {
        /// `None` when the process was killed by a signal.
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    TimedOut,
}

impl ExecJob {
    pub fn new(name: &str, cron: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            cron: cron.to_string(),
            command: command.to_string(),
            timeout_secs: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_EXEC_TIMEOUT)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Read a JSON array of jobs.
    pub async fn load_file(path: impl AsRef<Path>) -> Result<Vec<ExecJob>> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Add this job to `dcron` under its own name and schedule.
    pub fn register(self, dcron: &Dcron) -> Result<()> {
        let (name, cron) = (self.name.clone(), self.cron.clone());
        dcron.add_job(&name, &cron, self)
    }

    /// Run the command through `sh -c`, killing it once the timeout passes.
    pub async fn execute(&self) -> Result<ExecOutcome> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout(), output).await {
            Ok(output) => {
                let output = output?;
                Ok(ExecOutcome::Exited {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => Ok(ExecOutcome::TimedOut),
        }
    }
}

#[async_trait]
impl Job for ExecJob {
    async fn run(&self) {
        match self.execute().await {
            Ok(ExecOutcome::Exited {
                code: Some(0),
                stdout,
                ..
            }) => {
                info!(job = %self.name, stdout = stdout.trim_end(), "command finished");
            }
            Ok(ExecOutcome::Exited {
                code,
                stdout,
                stderr,
            }) => {
                warn!(
                    job = %self.name,
                    ?code,
                    stdout = stdout.trim_end(),
                    stderr = stderr.trim_end(),
                    "command failed"
                );
            }
            Ok(ExecOutcome::TimedOut) => {
                warn!(job = %self.name, timeout = ?self.timeout(), "command timed out and was killed");
            }
            Err(e) => {
                error!(job = %self.name, error = %e, "failed to spawn command");
            }
        }
    }
}

use std::path::Path;
use std::process::{Command, Output, Stdio};

use serde::{Deserialize, Serialize};

use crate::comm::Rank;
use crate::error::Result;
use crate::scheduler::Job;

/// Environment variable holding the rank that runs the command.
pub const RANK_ENV: &str = "JOBFARM_RANK";

/// Runs `sh -c <command>` on whichever worker picks it up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellJob {
    pub command: String,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ShellJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            exit_code: None,
            output: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// One job per non-empty line; lines starting with `#` are skipped.
    pub fn parse_lines(text: &str) -> Vec<ShellJob> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(ShellJob::new)
            .collect()
    }

    pub fn load_file(path: &Path) -> Result<Vec<ShellJob>> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse_lines(&text))
    }

    fn record_output(&mut self, result: std::io::Result<Output>) {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                self.exit_code = output.status.code();
                self.output = if stdout.is_empty() { None } else { Some(stdout) };
                self.error = if output.status.success() {
                    None
                } else if stderr.is_empty() {
                    Some(format!("Exit code: {:?}", self.exit_code))
                } else {
                    Some(stderr)
                };
            }
            Err(e) => {
                tracing::error!(command = %self.command, error = %e, "Failed to spawn shell");
                self.exit_code = None;
                self.output = None;
                self.error = Some(e.to_string());
            }
        }
    }
}

impl Job for ShellJob {
    fn run(&mut self, rank: Rank) {
        tracing::debug!(rank, command = %self.command, "Running shell command");
        let result = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(RANK_ENV, rank.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();
        self.record_output(result);
    }
}

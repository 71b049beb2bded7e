//! Shell command handler.

use std::io::ErrorKind as IoErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use cadence_scheduler::{Handler, HandlerError, HandlerResult, JobInstance};

/// Characters of stderr kept in a failure message.
const STDERR_TAIL: usize = 512;

/// Runs a program with fixed arguments.
///
/// Exit status 0 is success. Any other exit is a transient failure; a
/// program that can't be started at all is a permanent one.
///
/// The child is killed if the handler future is dropped. A run abandoned
/// after a timeout keeps going until it exits on its own.
///
/// The child sees `CADENCE_JOB_KEY` and `CADENCE_ATTEMPT` in its environment.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl Handler for CommandHandler {
    async fn execute(&self, job: JobInstance) -> HandlerResult {
        debug!(key = %job.key(), program = %self.program, attempt = job.attempt, "spawning command");

        let output = Command::new(&self.program)
            .args(&self.args)
            .env("CADENCE_JOB_KEY", job.key())
            .env("CADENCE_ATTEMPT", job.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                IoErrorKind::NotFound | IoErrorKind::PermissionDenied => {
                    HandlerError::permanent(format!("cannot run {}: {e}", self.program))
                }
                _ => HandlerError::transient(format!("failed to spawn {}: {e}", self.program)),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let tail = match stderr.char_indices().rev().nth(STDERR_TAIL) {
            Some((idx, _)) => &stderr[idx..],
            None => stderr,
        };
        let status = match output.status.code() {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };

        if tail.is_empty() {
            Err(HandlerError::transient(status))
        } else {
            Err(HandlerError::transient(format!("{status}: {tail}")))
        }
    }
}

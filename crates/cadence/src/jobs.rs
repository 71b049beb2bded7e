//! Job file loading.
//!
//! A job file is a JSON array of entries:
//!
//! ```json
//! [
//!   { "key": "ping", "interval_secs": 30, "command": "curl", "args": ["-sf", "http://localhost/health"] },
//!   { "key": "warm-cache", "command": "./warm.sh", "max_attempts": 5, "timeout_secs": 120 }
//! ]
//! ```
//!
//! Entries without `interval_secs` run once at startup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cadence_scheduler::JobSpec;

use crate::command::CommandHandler;

/// Longest accepted `interval_secs` or `timeout_secs` (one year).
pub const MAX_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum JobFileError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("job #{index}: {reason}")]
    Invalid { index: usize, reason: String },

    #[error("duplicate job key: {0}")]
    DuplicateKey(String),
}

/// One scheduled command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobEntry {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl JobEntry {
    fn validate(&self, index: usize) -> Result<(), JobFileError> {
        let invalid = |reason: &str| JobFileError::Invalid {
            index,
            reason: reason.to_string(),
        };

        if self.key.trim().is_empty() {
            return Err(invalid("key must not be empty"));
        }
        if self.command.trim().is_empty() {
            return Err(invalid("command must not be empty"));
        }
        if self.interval_secs == Some(0) {
            return Err(invalid("interval_secs must be > 0"));
        }
        if self.interval_secs.is_some_and(|secs| secs > MAX_SECS) {
            return Err(invalid("interval_secs must be at most one year"));
        }
        if self.max_attempts == Some(0) {
            return Err(invalid("max_attempts must be >= 1"));
        }
        if self.timeout_secs == Some(0) {
            return Err(invalid("timeout_secs must be > 0"));
        }
        if self.timeout_secs.is_some_and(|secs| secs > MAX_SECS) {
            return Err(invalid("timeout_secs must be at most one year"));
        }
        Ok(())
    }

    /// Build the scheduler registration for this entry.
    pub fn to_spec(&self) -> JobSpec {
        let handler = CommandHandler::new(&self.command, self.args.clone());
        let mut spec = match self.interval_secs {
            Some(secs) => JobSpec::recurring(&self.key, Duration::from_secs(secs), handler),
            None => JobSpec::once(&self.key, handler),
        };
        if let Some(max_attempts) = self.max_attempts {
            spec = spec.max_attempts(max_attempts);
        }
        if let Some(secs) = self.timeout_secs {
            spec = spec.timeout(Duration::from_secs(secs));
        }
        spec
    }
}

/// A validated list of job entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFile {
    pub jobs: Vec<JobEntry>,
}

impl JobFile {
    /// Parse and validate a job file from disk.
    pub fn load(path: &Path) -> Result<Self, JobFileError> {
        let raw = std::fs::read_to_string(path).map_err(|source| JobFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let jobs: Vec<JobEntry> =
            serde_json::from_str(&raw).map_err(|source| JobFileError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_entries(jobs)
    }

    pub fn from_entries(jobs: Vec<JobEntry>) -> Result<Self, JobFileError> {
        let mut seen = HashSet::new();
        for (index, job) in jobs.iter().enumerate() {
            job.validate(index)?;
            if !seen.insert(job.key.as_str()) {
                return Err(JobFileError::DuplicateKey(job.key.clone()));
            }
        }
        Ok(Self { jobs })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

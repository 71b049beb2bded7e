//! Cadence: run shell commands on a schedule.
//!
//! The binary is a thin runner around [`cadence_scheduler`]: it reads a
//! job file, turns each entry into a [`CommandHandler`], and appends every
//! execution record to a JSON-lines file.

pub mod command;
pub mod jobs;
pub mod runner;

pub use command::CommandHandler;
pub use jobs::{JobEntry, JobFile, JobFileError};
pub use runner::RunOptions;

//! Control layer error types

use crate::runner::RunId;
use parol_driver::DriverError;
use std::path::PathBuf;
use thiserror::Error;

/// Control layer error type
#[derive(Error, Debug)]
pub enum ControlError {
    /// A program is already starting or running
    #[error("A program is already running (run {0})")]
    AlreadyRunning(RunId),

    /// Script missing or unreadable
    #[error("Script not found or unreadable: {}", .0.display())]
    NotFound(PathBuf),

    /// Interpreter could not be spawned
    #[error("Failed to spawn program: {0}")]
    SpawnFailed(String),

    /// Run id does not name the current run
    #[error("Unknown run: {0}")]
    UnknownRun(RunId),

    /// Controller did not reach Ready
    #[error("Controller not ready: {0}")]
    NotReady(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Program file name rejected
    #[error("Invalid program name: {0:?}")]
    InvalidName(String),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

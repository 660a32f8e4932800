//! # Error Kinds
//!
//! Every failure the user can run into while preparing or running a shadow job.
//! None of these are fatal to the host process: `main` prints the message and
//! exits with a non-zero status.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShadowError {
    /// The current working directory is not literally named `Maps`.
    #[error("Run the program from a folder named 'Maps', not from '{found}'.")]
    WrongWorkingDirectory { found: String },

    /// The chosen Trackmania executable does not exist on disk.
    #[error("Trackmania executable not found at {0:?}. Choose a valid Trackmania.exe first.")]
    MissingExecutable(PathBuf),

    /// A drive scan finished without a single candidate.
    #[error("{0} could not be located on any local fixed drive. Pass --exe <PATH> instead.")]
    ExecutableNotFound(String),

    #[error("Enter the name of the folder to process.")]
    MissingTargetFolder,

    /// Only raised by the strict "refuse-if-running" guard.
    #[error("{name} is already running (pid {pids:?}). Close it before computing shadows.")]
    ProcessConflict { name: String, pids: Vec<u32> },

    #[error("Failed to start {path:?}: {source}")]
    SpawnFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Never leaves the preference loader; a corrupt file reads as "no preference".
    #[error("Saved preference is unreadable: {0}")]
    CorruptPreference(String),
}

pub type Result<T> = std::result::Result<T, ShadowError>;

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Relocation error.
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    #[error("Failed to classify {0:?}: {1}")]
    Classification(PathBuf, #[source] std::io::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("External tool failed: {0}")]
    RpathTool(#[from] ToolError),
    #[error(
        "Cannot replace \"{}\" with \"{}\" in the C-string \"{}\".",
        .old.escape_ascii(),
        .new.escape_ascii(),
        .c_string.escape_ascii()
    )]
    CannotShrinkCString {
        /// The prefix found in the file.
        old: Vec<u8>,
        /// Its replacement.
        new: Vec<u8>,
        /// The C-string that contains the prefix, without the terminator.
        c_string: Vec<u8>,
    },
    #[error("Output length {actual} differs from input length {expected} for {path:?}")]
    LengthMismatch {
        /// The file being rewritten.
        path: PathBuf,
        /// Original length.
        expected: usize,
        /// Length after replacement.
        actual: usize,
    },
    #[error("Invalid Mach-O file {0:?}: {1}")]
    InvalidMachO(PathBuf, String),
    #[error("{path:?} contains install root string {prefix:?}")]
    InstallRootString {
        /// The binary.
        path: PathBuf,
        /// The forbidden prefix.
        prefix: String,
    },
    #[error("Failed to create thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Input/output error: {0}")]
    Io(#[from] std::io::Error),
}

/// External tool error.
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum ToolError {
    #[error("{0:?} not found")]
    NotFound(PathBuf),
    #[error("{0:?} timed out after {1:?}")]
    Timeout(PathBuf, Duration),
    #[error("{program:?} exited with {status}: {stderr}")]
    Failed {
        /// The executable.
        program: PathBuf,
        /// Exit status.
        status: ExitStatus,
        /// Captured standard error.
        stderr: String,
    },
    #[error("Failed to run {0:?}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

impl ToolError {
    /// Returns `true` if the tool is not installed.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(..))
    }

    /// Returns `true` if the tool was killed because it ran for too long.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(..))
    }

    /// Returns `true` if the file that the tool was run on has to be reported as failed.
    ///
    /// Other errors leave the file unchanged and are reported as warnings.
    pub fn is_fatal(&self) -> bool {
        self.is_not_found() || self.is_timeout()
    }
}

impl Error {
    /// Returns `true` if the error was caused by the caller's input rather than by a file.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(..))
    }
}

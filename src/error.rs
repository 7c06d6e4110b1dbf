//! Error taxonomy for repository synchronization.
//!
//! Configuration and authentication errors are raised before any repository
//! is touched. Rebase conflicts and dirty pushes surface from the git layer and
//! are meant to stop the run so an operator can look at the repository.
//! Library load errors are recorded per project and never abort a run.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Configuration is unusable, e.g. the project filter matches nothing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credentials were rejected by the hosting platform.
    #[error("Authentication to GitHub failed: {0}")]
    Authentication(String),

    /// Non-destructive sync hit a conflicting rebase.
    #[error("Rebase onto {upstream} failed in {}: {stderr}", path.display())]
    RebaseConflict {
        path: PathBuf,
        upstream: String,
        stderr: String,
    },

    /// Refusing to push a working tree with uncommitted changes.
    #[error("Skipping push, repository is dirty: {}", path.display())]
    DirtyPush { path: PathBuf },

    /// Compiled library is missing or could not be introspected.
    #[error("Failed to read output library {}: {reason}", path.display())]
    LibraryLoad { path: PathBuf, reason: String },

    /// External build returned non-zero.
    #[error("Compilation failed: {0}")]
    BuildFailed(String),

    /// A git invocation exited unsuccessfully.
    #[error("git {args} failed in {}: {stderr}", path.display())]
    Git {
        path: PathBuf,
        args: String,
        stderr: String,
    },

    #[error("GitHub API error: {0}")]
    GitHub(#[from] octocrab::Error),

    #[error("GitHub rate limit exhausted, resets at {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("Credential store error: {0}")]
    Credentials(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_load_names_library() {
        let err = SyncError::LibraryLoad {
            path: PathBuf::from("install/game.libretro.nes/game.libretro.nes.so"),
            reason: "not found".to_string(),
        };
        assert!(err.to_string().contains("game.libretro.nes.so"));
    }

    #[test]
    fn test_dirty_push_message() {
        let err = SyncError::DirtyPush {
            path: PathBuf::from("/tmp/game.libretro.nes"),
        };
        assert!(err.to_string().contains("dirty"));
    }
}

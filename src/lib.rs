//! kodi-addon-sync - Keeps generated Kodi game addon repositories in sync
//!
//! Every configured libretro core gets its own addon repository. A run
//! regenerates the addon files, optionally compiles the cores, commits the
//! result, bumps and tags the addon version when something changed and
//! pushes the repositories back to GitHub.
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and the project table
//! - [`git`]: Local repository operations
//! - [`github`]: GitHub organization access and repository listing cache
//! - [`version`]: Addon version derivation
//! - [`addon`]: Per-addon info aggregate
//! - [`collab`]: Renderer, builder and library inspector seams
//! - [`sync`]: Run orchestration

pub mod addon;
pub mod collab;
pub mod config;
pub mod credentials;
pub mod error;
pub mod git;
pub mod github;
pub mod sync;
pub mod version;

pub use addon::AddonInfo;
pub use config::{Config, ProjectDescriptor};
pub use error::{Result, SyncError};
pub use git::{GitCapabilities, LocalRepository};
pub use github::{GitHubOrg, RemoteHostingClient, RemoteRepository};
pub use sync::{SyncOptions, SyncOrchestrator, SyncSummary};

//! External collaborators: file rendering, building and library inspection.
//!
//! The orchestrator only talks to these traits. The shipped implementations
//! render JSON, drive a CMake superbuild, and run a helper command that dumps
//! library metadata.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use crate::addon::{AddonInfo, LibraryMetadata};
use crate::error::{Result, SyncError};

/// Which set of files to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderKind {
    /// Files living in the addon repository
    Addon,
    /// Files describing the addon to the host build system
    Description,
}

impl RenderKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            RenderKind::Addon => "addon.json",
            RenderKind::Description => "description.json",
        }
    }
}

/// Renders the aggregate into files.
///
/// Rendering the same aggregate twice must produce identical bytes.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, kind: RenderKind, destination: &Path, info: &AddonInfo) -> Result<()>;

    async fn render_summary(&self, destination: &Path, addons: &[AddonInfo]) -> Result<()>;
}

/// Writes the aggregate as pretty printed JSON.
#[derive(Debug, Clone, Default)]
pub struct JsonRenderer;

impl JsonRenderer {
    pub const SUMMARY_FILE: &'static str = "summary.json";

    async fn write_json<T: Serialize + ?Sized>(
        destination: &Path,
        file_name: &str,
        value: &T,
    ) -> Result<()> {
        let mut content = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
        content.push('\n');

        tokio::fs::create_dir_all(destination).await?;
        let path = destination.join(file_name);
        tokio::fs::write(&path, content).await?;
        debug!("Rendered {:?}", path);
        Ok(())
    }
}

#[derive(Serialize)]
struct Summary<'a> {
    addons: &'a [AddonInfo],
}

#[async_trait]
impl Renderer for JsonRenderer {
    async fn render(&self, kind: RenderKind, destination: &Path, info: &AddonInfo) -> Result<()> {
        Self::write_json(destination, kind.file_name(), info).await
    }

    async fn render_summary(&self, destination: &Path, addons: &[AddonInfo]) -> Result<()> {
        Self::write_json(destination, Self::SUMMARY_FILE, &Summary { addons }).await
    }
}

/// One build of the whole filtered project set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Addon names to build
    pub addons: Vec<String>,
    /// Directory holding the addon repositories
    pub source_prefix: PathBuf,
    pub build_type: String,
    pub install_prefix: PathBuf,
    /// Recreated empty before building
    pub build_directory: PathBuf,
    /// Directory of the addon superbuild project
    pub project_directory: PathBuf,
}

impl BuildRequest {
    /// Regex selecting exactly the requested addons.
    pub fn addons_pattern(&self) -> String {
        self.addons
            .iter()
            .map(|addon| format!("{}$", addon))
            .collect::<Vec<_>>()
            .join("|")
    }
}

#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> Result<()>;
}

/// Builds addons through the host project's CMake addon superbuild.
#[derive(Debug, Clone)]
pub struct CmakeBuilder {
    program: String,
}

impl CmakeBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn cmake(&self, args: &[String], cwd: &Path) -> Result<()> {
        debug!("{} {}", self.program, args.join(" "));
        let status = AsyncCommand::new(&self.program)
            .args(args)
            .current_dir(cwd)
            .status()
            .await?;
        if !status.success() {
            return Err(SyncError::BuildFailed(format!(
                "{} {} exited with {}",
                self.program,
                args.first().map(String::as_str).unwrap_or_default(),
                status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Builder for CmakeBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<()> {
        info!("Compiling {} addons", request.addons.len());

        if request.build_directory.exists() {
            tokio::fs::remove_dir_all(&request.build_directory).await?;
        }
        tokio::fs::create_dir_all(&request.build_directory).await?;

        let configure = vec![
            format!("-DADDONS_TO_BUILD={}", request.addons_pattern()),
            format!("-DADDON_SRC_PREFIX={}", request.source_prefix.display()),
            format!("-DCMAKE_BUILD_TYPE={}", request.build_type),
            "-DPACKAGE_ZIP=1".to_string(),
            format!("-DCMAKE_INSTALL_PREFIX={}", request.install_prefix.display()),
            request.project_directory.display().to_string(),
        ];
        self.cmake(&configure, &request.build_directory).await?;

        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let build = vec![
            "--build".to_string(),
            ".".to_string(),
            "--".to_string(),
            format!("-j{}", jobs),
        ];
        self.cmake(&build, &request.build_directory).await
    }
}

/// Reads runtime metadata from a compiled library.
#[async_trait]
pub trait LibraryInspector: Send + Sync {
    async fn inspect(&self, library: &Path) -> Result<LibraryMetadata>;
}

/// Runs `<program> <library>` and parses [`LibraryMetadata`] from its stdout.
///
/// Without a program every inspection fails, which leaves libraries
/// recorded as not loaded.
#[derive(Debug, Clone)]
pub struct CommandInspector {
    program: Option<String>,
}

impl CommandInspector {
    pub fn new(program: Option<String>) -> Self {
        Self { program }
    }
}

#[async_trait]
impl LibraryInspector for CommandInspector {
    async fn inspect(&self, library: &Path) -> Result<LibraryMetadata> {
        let load_error = |reason: String| SyncError::LibraryLoad {
            path: library.to_path_buf(),
            reason,
        };

        if !library.is_file() {
            return Err(load_error("library file not found".to_string()));
        }
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| load_error("no library inspector configured".to_string()))?;

        let output = AsyncCommand::new(program)
            .arg(library)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| load_error(format!("failed to run {}: {}", program, e)))?;
        if !output.status.success() {
            return Err(load_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| load_error(format!("invalid inspector output: {}", e)))
    }
}

//! Sync Orchestrator - Drives every addon repository through one run
//!
//! Each pass finishes for all addons before the next one starts: generate,
//! compile, metadata, commit, version bump and push. Generated files of one
//! addon may be read while processing another, so passes are never
//! interleaved per addon.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::addon::AddonInfo;
use crate::collab::{
    BuildRequest, Builder, CmakeBuilder, CommandInspector, JsonRenderer, LibraryInspector,
    RenderKind, Renderer,
};
use crate::config::{Config, ProjectDescriptor};
use crate::error::{Result, SyncError};
use crate::git::{GitCapabilities, LocalRepository, PRIMARY_BRANCH};
use crate::github::{RemoteHostingClient, RemoteRepository};

/// Addon descriptions inside the host project, relative to its root.
pub fn description_directory() -> PathBuf {
    Path::new("cmake").join("addons").join("addons")
}

/// CMake build configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BuildType {
    Debug,
    #[default]
    Release,
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildType::Debug => write!(f, "Debug"),
            BuildType::Release => write!(f, "Release"),
        }
    }
}

/// What a run should do.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Directory holding the addon repositories
    pub working_directory: PathBuf,
    /// Root of the host (Kodi) project checkout
    pub source_directory: Option<PathBuf>,
    pub compile: bool,
    pub build_type: BuildType,
    /// Fetch, commit and tag addon repositories
    pub git: bool,
    /// Rebase onto upstream and squash instead of resetting
    pub rebase: bool,
    /// Regex selecting project ids
    pub filter: String,
    pub push_branch: Option<String>,
    pub push_description: bool,
    pub clean_description: bool,
}

/// External collaborators used by a run.
pub struct Collaborators {
    pub renderer: Box<dyn Renderer>,
    pub builder: Box<dyn Builder>,
    pub inspector: Box<dyn LibraryInspector>,
}

impl Collaborators {
    pub fn from_config(config: &Config) -> Self {
        Self {
            renderer: Box::new(JsonRenderer),
            builder: Box::new(CmakeBuilder::new(config.build.cmake_program())),
            inspector: Box::new(CommandInspector::new(config.build.inspector.clone())),
        }
    }
}

/// Outcome of one addon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonReport {
    pub addon: String,
    pub version: String,
    /// Differs from upstream after the commit pass
    pub changed: bool,
    /// Release tag created during this run
    pub tag: Option<String>,
    pub library_loaded: bool,
    /// Recoverable errors recorded along the way
    pub errors: Vec<String>,
}

/// Results from a complete run
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub addons: Vec<AddonReport>,
    pub duration: Duration,
}

impl SyncSummary {
    pub fn changed(&self) -> usize {
        self.addons.iter().filter(|a| a.changed).count()
    }

    pub fn tagged(&self) -> usize {
        self.addons.iter().filter(|a| a.tag.is_some()).count()
    }

    pub fn with_errors(&self) -> usize {
        self.addons.iter().filter(|a| !a.errors.is_empty()).count()
    }
}

struct Addon {
    project: ProjectDescriptor,
    repo: LocalRepository,
    info: AddonInfo,
    tag: Option<String>,
    errors: Vec<String>,
}

impl Addon {
    fn record<T>(&mut self, step: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("{} failed for {}: {}", step, self.info.game.addon, e);
                self.errors.push(format!("{}: {}", step, e));
                None
            }
        }
    }

    fn report(&self) -> AddonReport {
        AddonReport {
            addon: self.info.game.addon.clone(),
            version: self.info.game.version.clone(),
            changed: self.info.changed(),
            tag: self.tag.clone(),
            library_loaded: self.info.library.loaded,
            errors: self.errors.clone(),
        }
    }
}

/// Runs the pass pipeline over all selected addons
pub struct SyncOrchestrator {
    config: Config,
    options: SyncOptions,
    collaborators: Collaborators,
    capabilities: GitCapabilities,
    info_repository: Option<LocalRepository>,
    addons: Vec<Addon>,
}

impl SyncOrchestrator {
    /// Select projects, resolve their remotes and open (and sync) repositories.
    ///
    /// Configuration problems fail here, before any repository is touched.
    pub async fn prepare(
        config: Config,
        options: SyncOptions,
        collaborators: Collaborators,
        mut hosting: Option<&mut dyn RemoteHostingClient>,
    ) -> Result<Self> {
        let projects = config.filter_projects(&options.filter)?;
        if options.source_directory.is_none()
            && (options.compile || options.push_description || options.clean_description)
        {
            return Err(SyncError::Config(
                "Compiling and handling descriptions need a source directory".to_string(),
            ));
        }

        let capabilities = GitCapabilities::probe().await?;
        tokio::fs::create_dir_all(&options.working_directory).await?;
        let identity = config.git.identity();

        let mut remotes = BTreeMap::new();
        let mut info_repository = None;
        if options.git {
            if let Some(hosting) = hosting.as_deref_mut() {
                let pattern = if options.filter.is_empty() {
                    regex::escape(&config.github.addon_prefix)
                } else {
                    options.filter.clone()
                };
                info!("Querying repositories matching '{}'", pattern);
                remotes = hosting.get_repos(&pattern).await?;
            }

            let info = &config.info_repository;
            if !info.clone_url.is_empty() {
                info!("Fetching {} repository", info.name);
                let remote = RemoteRepository {
                    name: info.name.clone(),
                    clone_url: info.clone_url.clone(),
                    push_url: String::new(),
                };
                let repo =
                    LocalRepository::open(remote, &options.working_directory, capabilities).await?;
                repo.fetch_and_reset(true).await?;
                info_repository = Some(repo);
            }
        }

        let mut addons = Vec::with_capacity(projects.len());
        for project in projects {
            let addon_name = config.github.addon_name(&project.id);
            let remote = match remotes.remove(&addon_name) {
                Some(remote) => remote,
                None => match hosting.as_deref_mut() {
                    Some(hosting) if options.git && options.push_branch.is_some() => {
                        hosting.create_repo(&addon_name).await?
                    }
                    _ => RemoteRepository::local(&addon_name),
                },
            };

            let repo = LocalRepository::open(remote, &options.working_directory, capabilities)
                .await?
                .with_identity(identity.clone());
            let info = AddonInfo::new(&project, &addon_name, options.push_branch.as_deref());
            addons.push(Addon {
                project,
                repo,
                info,
                tag: None,
                errors: Vec::new(),
            });
        }

        info!(
            "Processing the following addons: {}",
            addons
                .iter()
                .map(|a| a.project.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        if options.git {
            for addon in &addons {
                addon.repo.fetch_and_reset(!options.rebase).await?;
            }
        }

        let orchestrator = Self {
            config,
            options,
            collaborators,
            capabilities,
            info_repository,
            addons,
        };

        if orchestrator.options.clean_description {
            orchestrator.clean_descriptions().await?;
        }

        Ok(orchestrator)
    }

    /// Run every pass and report the outcome per addon.
    pub async fn run(&mut self) -> Result<SyncSummary> {
        let start_time = Instant::now();

        self.generate_pass().await;

        if self.options.compile {
            self.compile_pass().await?;
        }

        self.metadata_pass().await?;

        if self.options.git {
            self.commit_pass().await?;
            self.bump_pass().await?;

            if let Some(branch) = self.options.push_branch.clone() {
                self.push_pass().await?;
                if self.options.push_description {
                    self.push_descriptions(&branch).await?;
                }
            }
        }

        self.render_summary().await;

        let summary = SyncSummary {
            addons: self.addons.iter().map(Addon::report).collect(),
            duration: start_time.elapsed(),
        };
        info!(
            "Sync completed in {:.2}s: {} addons, {} changed, {} tagged, {} with errors",
            summary.duration.as_secs_f64(),
            summary.addons.len(),
            summary.changed(),
            summary.tagged(),
            summary.with_errors()
        );
        Ok(summary)
    }

    fn descriptions_root(&self) -> Option<PathBuf> {
        self.options
            .source_directory
            .as_ref()
            .map(|source| source.join(description_directory()))
    }

    async fn generate_pass(&mut self) {
        info!("First iteration: Generate addon files");
        let descriptions = self.descriptions_root();

        for addon in &mut self.addons {
            debug!("Processing addon: {}", addon.info.game.addon);
            let result = self
                .collaborators
                .renderer
                .render(RenderKind::Addon, addon.repo.path(), &addon.info)
                .await;
            addon.record("render", result);

            if let Some(descriptions) = &descriptions {
                let destination = descriptions.join(&addon.info.game.addon);
                let result = self
                    .collaborators
                    .renderer
                    .render(RenderKind::Description, &destination, &addon.info)
                    .await;
                addon.record("render description", result);
            }
        }
    }

    async fn compile_pass(&self) -> Result<()> {
        let source = self
            .options
            .source_directory
            .as_ref()
            .ok_or_else(|| SyncError::Config("No source directory to compile with".to_string()))?;
        let working_directory = &self.options.working_directory;

        let request = BuildRequest {
            addons: self.addons.iter().map(|a| a.info.game.addon.clone()).collect(),
            source_prefix: working_directory.clone(),
            build_type: self.options.build_type.to_string(),
            install_prefix: working_directory.join("install"),
            build_directory: working_directory.join("build"),
            project_directory: source.join("cmake").join("addons"),
        };
        if let Err(e) = self.collaborators.builder.build(&request).await {
            error!("Compilation failed!");
            return Err(e);
        }
        Ok(())
    }

    async fn metadata_pass(&mut self) -> Result<()> {
        info!("Second iteration: Generate metadata files");
        let working_directory = self.options.working_directory.clone();
        let info_directory = self
            .info_repository
            .as_ref()
            .map(|repo| repo.path().join("dist").join("info"));

        for addon in &mut self.addons {
            debug!("Processing addon: {}", addon.info.game.addon);

            if let Some(info_directory) = &info_directory {
                let result = addon.info.load_info_file(info_directory);
                addon.record("info file", result);
            }
            let result = addon.info.load_assets(addon.repo.path());
            addon.record("assets", result);

            let library = working_directory.join(&addon.info.library.file);
            let metadata = self.collaborators.inspector.inspect(&library).await;
            addon.info.apply_library(metadata);

            let upstream_describe =
                load_upstream_revision(&working_directory, addon, self.capabilities).await?;
            let upstream_version = match upstream_describe {
                Some(describe) if addon.project.options.git_tag => describe,
                _ => addon.info.system_info.version.clone(),
            };
            let describe = addon.repo.describe().await?;
            addon.info.load_game_version(&upstream_version, &describe);

            let result = self
                .collaborators
                .renderer
                .render(RenderKind::Addon, addon.repo.path(), &addon.info)
                .await;
            addon.record("render", result);
        }
        Ok(())
    }

    async fn commit_pass(&mut self) -> Result<()> {
        let message = &self.config.git.commit_message;
        for addon in &mut self.addons {
            addon.repo.commit(message, None, false, self.options.rebase).await?;
            addon.info.set_diff(addon.repo.diff().await?);
        }
        Ok(())
    }

    async fn bump_pass(&mut self) -> Result<()> {
        info!("Third iteration: Update version");
        let message = &self.config.git.commit_message;

        for addon in self.addons.iter_mut().filter(|a| a.info.changed()) {
            debug!("Processing addon: {}", addon.info.game.addon);
            // Tag-versioned projects keep their version until its tag is taken
            let released = self.config.git.release_tag(&addon.info.game.version);
            if !addon.project.options.git_tag || addon.repo.tag_exists(&released).await? {
                addon.info.bump_version();
                info!(
                    "Version of {} bumped to {}",
                    addon.info.game.addon, addon.info.game.version
                );
            }

            let result = self
                .collaborators
                .renderer
                .render(RenderKind::Addon, addon.repo.path(), &addon.info)
                .await;
            addon.record("render", result);

            addon.repo.commit(message, None, false, true).await?;
            let tag = self.config.git.release_tag(&addon.info.game.version);
            addon.repo.tag(&tag, None).await?;
            addon.tag = Some(tag);
        }
        Ok(())
    }

    /// Push in reverse order so a listing sorted by update time stays alphabetical.
    async fn push_pass(&self) -> Result<()> {
        for addon in self.addons.iter().rev() {
            let branch = &addon.info.game.branch;
            info!("Pushing {} to {}", addon.info.game.addon, branch);
            addon.repo.push(branch, branch == PRIMARY_BRANCH).await?;
        }
        Ok(())
    }

    async fn push_descriptions(&self, branch: &str) -> Result<()> {
        let source = self
            .options
            .source_directory
            .as_ref()
            .ok_or_else(|| SyncError::Config("No source directory to push".to_string()))?;
        let (parent, name) = match (source.parent(), source.file_name()) {
            (Some(parent), Some(name)) => (parent, name.to_string_lossy().into_owned()),
            _ => {
                return Err(SyncError::Config(format!(
                    "Invalid source directory {:?}",
                    source
                )))
            }
        };

        info!("Committing descriptions to {}", name);
        // The existing origin of the host project is used as is
        let repo = LocalRepository::open(RemoteRepository::local(name), parent, self.capabilities)
            .await?
            .with_identity(self.config.git.identity());
        let directory = description_directory();
        repo.commit(&self.config.git.commit_message, Some(&directory), true, false)
            .await?;
        info!("Pushing descriptions");
        repo.push(branch, false).await
    }

    async fn clean_descriptions(&self) -> Result<()> {
        let Some(root) = self.descriptions_root() else {
            return Ok(());
        };
        if !root.is_dir() {
            return Ok(());
        }

        let prefix = &self.config.github.addon_prefix;
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_addon = entry.file_name().to_string_lossy().starts_with(prefix.as_str());
            if is_addon && entry.file_type().await?.is_dir() {
                debug!("Removing description {:?}", entry.path());
                tokio::fs::remove_dir_all(entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn render_summary(&self) {
        info!("Generating summary");
        let infos: Vec<AddonInfo> = self.addons.iter().map(|a| a.info.clone()).collect();
        if let Err(e) = self
            .collaborators
            .renderer
            .render_summary(&self.options.working_directory, &infos)
            .await
        {
            warn!("Failed to render summary: {}", e);
        }
    }

    /// Aggregates in processing order.
    pub fn addons(&self) -> impl Iterator<Item = &AddonInfo> {
        self.addons.iter().map(|a| &a.info)
    }

    pub fn repository(&self, addon: &str) -> Option<&LocalRepository> {
        self.addons
            .iter()
            .find(|a| a.info.game.addon == addon)
            .map(|a| &a.repo)
    }
}

/// Record the revision of the upstream checkout left by the build.
///
/// Returns the checkout's describe output when there is one.
async fn load_upstream_revision(
    working_directory: &Path,
    addon: &mut Addon,
    capabilities: GitCapabilities,
) -> Result<Option<String>> {
    let id = &addon.project.id;
    let base = working_directory.join("build").join("build").join(id).join("src");
    if !LocalRepository::is_git_repo(&base.join(id)).await {
        return Ok(None);
    }

    let remote = RemoteRepository::local(id.as_str());
    let upstream = LocalRepository::open(remote, &base, capabilities).await?;
    addon.info.libretro_repo.hexsha = upstream.get_hexsha().await?;
    Ok(Some(upstream.describe().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(addon: &str, changed: bool, tag: Option<&str>, errors: usize) -> AddonReport {
        AddonReport {
            addon: addon.to_string(),
            version: "1.0.0.0".to_string(),
            changed,
            tag: tag.map(str::to_string),
            library_loaded: false,
            errors: vec!["render: failed".to_string(); errors],
        }
    }

    #[test]
    fn test_sync_summary_calculation() {
        let summary = SyncSummary {
            addons: vec![
                report("game.libretro.bnes", true, Some("1.0.0.0"), 0),
                report("game.libretro.nestopia", false, None, 1),
                report("game.libretro.snes9x", true, Some("1.0.0.0"), 2),
            ],
            duration: Duration::from_secs(60),
        };

        assert_eq!(summary.changed(), 2);
        assert_eq!(summary.tagged(), 2);
        assert_eq!(summary.with_errors(), 2);
    }

    #[test]
    fn test_build_type() {
        assert_eq!(BuildType::default(), BuildType::Release);
        assert_eq!(BuildType::Debug.to_string(), "Debug");
        assert_eq!(BuildType::Release.to_string(), "Release");
    }

    #[test]
    fn test_description_directory() {
        assert_eq!(
            description_directory(),
            PathBuf::from("cmake/addons/addons")
        );
    }

    #[tokio::test]
    async fn test_description_handling_needs_source_directory() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.projects.insert(
            "bnes".to_string(),
            ProjectDescriptor {
                upstream_repo: "bnes-libretro".to_string(),
                ..Default::default()
            },
        );
        let options = SyncOptions {
            working_directory: temp_dir.path().to_path_buf(),
            clean_description: true,
            ..Default::default()
        };

        let collaborators = Collaborators::from_config(&config);
        let result = SyncOrchestrator::prepare(config, options, collaborators, None).await;
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}

use anyhow::{Context, Result};
use dirs::config_dir;
use regex::Regex;
use serde::{Deserialize, Serialize};
use shellexpand;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::SyncError;
use crate::git::CommitIdentity;

/// Main configuration structure for kodi-addon-sync
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// GitHub organization and authentication settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Commit, tag and identity settings
    #[serde(default)]
    pub git: GitConfig,

    /// Repository carrying per-core `.info` files
    #[serde(default)]
    pub info_repository: InfoRepositoryConfig,

    /// External build tooling
    #[serde(default)]
    pub build: BuildConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Addon projects keyed by id
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectDescriptor>,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// Organization holding the addon repositories
    #[serde(default = "default_organization")]
    pub organization: String,

    /// Prefix turning a project id into an addon name
    #[serde(default = "default_addon_prefix")]
    pub addon_prefix: String,

    /// Environment variable holding an access token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Minimum remaining API calls required to start
    #[serde(default = "default_rate_limit_floor")]
    pub rate_limit_floor: u64,
}

/// Git configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitConfig {
    #[serde(default = "default_commit_message")]
    pub commit_message: String,

    /// Appended to release tags (e.g. `-Leia`)
    #[serde(default)]
    pub tag_suffix: String,

    /// Commit author, git's own configuration is used if unset
    pub user_name: Option<String>,
    pub user_email: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InfoRepositoryConfig {
    #[serde(default = "default_info_name")]
    pub name: String,

    /// Empty disables syncing the info repository
    #[serde(default = "default_info_clone_url")]
    pub clone_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BuildConfig {
    /// CMake executable, overridden by the `CMAKE` environment variable
    #[serde(default = "default_cmake")]
    pub cmake: String,

    /// Helper printing library metadata as JSON
    pub inspector: Option<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"
}

/// One addon project and the upstream it is built from
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct ProjectDescriptor {
    /// Filled in from the table key
    #[serde(skip)]
    pub id: String,

    pub upstream_repo: String,

    #[serde(default)]
    pub build_file: String,

    #[serde(default)]
    pub build_subdir: String,

    /// Directory of the Android (jni) build
    #[serde(default)]
    pub extra_dir: String,

    #[serde(default)]
    pub options: ProjectOptions,
}

/// Per-project overrides
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct ProjectOptions {
    /// Upstream branch, `master` if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Library base name, the project id if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jnisoname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmake_options: Option<String>,

    /// Upstream builds with CMake instead of make
    #[serde(default)]
    pub cmake: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_dir: Option<String>,

    /// Version comes from upstream tags, no package revision bump
    #[serde(default)]
    pub git_tag: bool,
}

// Default value functions
fn default_organization() -> String {
    "kodi-game".to_string()
}
fn default_addon_prefix() -> String {
    "game.libretro.".to_string()
}
fn default_token_env() -> String {
    "GITHUB_ACCESS_TOKEN".to_string()
}
fn default_rate_limit_floor() -> u64 {
    1
}
fn default_commit_message() -> String {
    "Updated by kodi-addon-sync".to_string()
}
fn default_info_name() -> String {
    "libretro-super".to_string()
}
fn default_info_clone_url() -> String {
    "https://github.com/libretro/libretro-super.git".to_string()
}
fn default_cmake() -> String {
    "cmake".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            organization: default_organization(),
            addon_prefix: default_addon_prefix(),
            token_env: default_token_env(),
            rate_limit_floor: default_rate_limit_floor(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            commit_message: default_commit_message(),
            tag_suffix: String::new(),
            user_name: None,
            user_email: None,
        }
    }
}

impl Default for InfoRepositoryConfig {
    fn default() -> Self {
        Self {
            name: default_info_name(),
            clone_url: default_info_clone_url(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            cmake: default_cmake(),
            inspector: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl GitHubConfig {
    /// Addon (and repository) name of a project id.
    pub fn addon_name(&self, id: &str) -> String {
        format!("{}{}", self.addon_prefix, id)
    }
}

impl GitConfig {
    /// Identity for commits, only when both halves are configured.
    pub fn identity(&self) -> Option<CommitIdentity> {
        match (&self.user_name, &self.user_email) {
            (Some(name), Some(email)) => Some(CommitIdentity {
                name: name.clone(),
                email: email.clone(),
            }),
            _ => None,
        }
    }

    pub fn release_tag(&self, version: &str) -> String {
        format!("{}{}", version, self.tag_suffix)
    }
}

impl BuildConfig {
    pub fn cmake_program(&self) -> String {
        std::env::var("CMAKE")
            .ok()
            .filter(|cmake| !cmake.is_empty())
            .unwrap_or_else(|| self.cmake.clone())
    }
}

impl ProjectOptions {
    pub fn branch(&self) -> &str {
        self.branch.as_deref().unwrap_or("master")
    }

    /// Desktop library name, e.g. `mednafen_psx_libretro`.
    pub fn soname(&self, id: &str) -> String {
        format!("{}_libretro", self.soname.as_deref().unwrap_or(id))
    }

    pub fn jnisoname(&self) -> &str {
        self.jnisoname.as_deref().unwrap_or("libretro")
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let config = Self::default();

            // Create config directory if it doesn't exist
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.assign_ids();
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("kodi-addon-sync").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.build.cmake = shellexpand::full(&self.build.cmake)
            .context("Failed to expand cmake path")?
            .into_owned();

        if let Some(inspector) = &self.build.inspector {
            self.build.inspector = Some(
                shellexpand::full(inspector)
                    .context("Failed to expand inspector path")?
                    .into_owned(),
            );
        }

        Ok(())
    }

    fn assign_ids(&mut self) {
        for (id, project) in self.projects.iter_mut() {
            project.id = id.clone();
        }
    }

    /// Projects whose id matches `pattern`, in id order.
    ///
    /// An empty pattern selects everything. Matching nothing is an error.
    pub fn filter_projects(&self, pattern: &str) -> crate::error::Result<Vec<ProjectDescriptor>> {
        let re = Regex::new(pattern)
            .map_err(|e| SyncError::Config(format!("Invalid filter '{}': {}", pattern, e)))?;

        let projects: Vec<ProjectDescriptor> = self
            .projects
            .iter()
            .filter(|(id, _)| re.is_match(id))
            .map(|(id, project)| ProjectDescriptor {
                id: id.clone(),
                ..project.clone()
            })
            .collect();

        if projects.is_empty() {
            return Err(SyncError::Config(format!(
                "No addon matches filter '{}'",
                pattern
            )));
        }
        Ok(projects)
    }
}

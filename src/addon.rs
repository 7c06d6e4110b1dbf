//! Per-project addon info aggregate.
//!
//! One [`AddonInfo`] is created per project when a run starts and is filled
//! in pass by pass. It is the only thing handed to the renderer, so every
//! optional field has a defined rendering (an empty string).

use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{ProjectDescriptor, ProjectOptions};
use crate::error::{Result, SyncError};
use crate::version;

/// Image extensions considered addon assets.
const ASSET_EXTENSIONS: &[&str] = &["png", "jpg", "svg"];

fn or_empty<T: Serialize, S: Serializer>(
    value: &Option<T>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(value) => value.serialize(serializer),
        None => serializer.serialize_str(""),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GameInfo {
    /// Project id, e.g. `nestopia`
    pub name: String,
    /// Addon id, e.g. `game.libretro.nestopia`
    pub addon: String,
    /// Branch the addon is pushed to
    pub branch: String,
    pub version: String,
}

/// Core-reported system information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_system_version")]
    pub version: String,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub need_fullpath: bool,
    #[serde(default)]
    pub block_extract: bool,
    #[serde(default)]
    pub supports_no_game: bool,
}

fn default_system_version() -> String {
    "0.0.0".to_string()
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: default_system_version(),
            extensions: Vec::new(),
            need_fullpath: false,
            block_extract: false,
            supports_no_game: false,
        }
    }
}

/// One core option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub values: Vec<String>,
    /// First value unless given
    #[serde(default)]
    pub default: String,
}

/// Everything read from a compiled library.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryMetadata {
    #[serde(default)]
    pub system_info: SystemInfo,
    #[serde(default)]
    pub settings: Vec<Setting>,
    #[serde(default)]
    pub opengl: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpstreamInfo {
    /// Upstream repository name
    pub name: String,
    pub branch: String,
    /// Revision of the upstream checkout used for the build
    pub hexsha: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MakefileInfo {
    pub file: String,
    pub dir: String,
    pub jni: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LibraryInfo {
    /// Relative to the working directory
    pub file: PathBuf,
    pub loaded: bool,
    pub soname: String,
    pub jnisoname: String,
    #[serde(serialize_with = "or_empty")]
    pub opengl: Option<bool>,
    #[serde(serialize_with = "or_empty")]
    pub error: Option<String>,
}

/// Images shipped in the addon, relative to the addon directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Assets {
    #[serde(serialize_with = "or_empty")]
    pub icon: Option<String>,
    #[serde(serialize_with = "or_empty")]
    pub fanart: Option<String>,
    pub screenshots: Vec<String>,
}

/// Change state of the addon repository, never rendered.
#[derive(Debug, Clone, Default)]
pub struct GitInfo {
    /// Diff against upstream after the commit pass
    pub diff: String,
    pub changed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AddonInfo {
    pub game: GameInfo,
    pub config: ProjectOptions,
    pub system_info: SystemInfo,
    /// Sorted by id
    pub settings: Vec<Setting>,
    pub libretro_info: BTreeMap<String, String>,
    pub libretro_repo: UpstreamInfo,
    pub makefile: MakefileInfo,
    pub library: LibraryInfo,
    pub assets: Assets,
    #[serde(skip)]
    pub git: GitInfo,
}

impl AddonInfo {
    pub fn new(project: &ProjectDescriptor, addon: &str, push_branch: Option<&str>) -> Self {
        let options = &project.options;
        Self {
            game: GameInfo {
                name: project.id.clone(),
                addon: addon.to_string(),
                branch: push_branch.unwrap_or("master").to_string(),
                version: default_system_version(),
            },
            config: options.clone(),
            system_info: SystemInfo::default(),
            settings: Vec::new(),
            libretro_info: BTreeMap::new(),
            libretro_repo: UpstreamInfo {
                name: project.upstream_repo.clone(),
                branch: options.branch().to_string(),
                hexsha: String::new(),
            },
            makefile: MakefileInfo {
                file: project.build_file.clone(),
                dir: project.build_subdir.clone(),
                jni: project.extra_dir.clone(),
            },
            library: LibraryInfo {
                file: Path::new("install")
                    .join(addon)
                    .join(format!("{}.{}", addon, std::env::consts::DLL_EXTENSION)),
                loaded: false,
                soname: options.soname(&project.id),
                jnisoname: options.jnisoname().to_string(),
                opengl: None,
                error: None,
            },
            assets: Assets::default(),
            git: GitInfo::default(),
        }
    }

    /// Record the outcome of reading the compiled library.
    ///
    /// A failure only marks the library unloaded; earlier values stay.
    pub fn apply_library(&mut self, result: Result<LibraryMetadata>) {
        match result {
            Ok(metadata) => {
                self.library.loaded = true;
                self.library.error = None;
                self.library.opengl = Some(metadata.opengl);
                self.system_info = metadata.system_info;
                let mut settings = metadata.settings;
                for setting in settings.iter_mut() {
                    if setting.default.is_empty() {
                        setting.default = setting.values.first().cloned().unwrap_or_default();
                    }
                }
                settings.sort_by(|a, b| a.id.cmp(&b.id));
                self.settings = settings;
            }
            Err(e) => {
                warn!("Failed to read output library of {}: {}", self.game.addon, e);
                self.library.loaded = false;
                self.library.error = Some(e.to_string());
            }
        }
    }

    /// Read `<soname>.info` from the info repository checkout, if present.
    pub fn load_info_file(&mut self, info_directory: &Path) -> Result<()> {
        let path = info_directory.join(format!("{}.info", self.library.soname));
        if path.is_file() {
            let content = std::fs::read_to_string(&path)?;
            self.libretro_info.extend(parse_info_file(&content));
        } else {
            debug!("No info file {:?}", path);
        }
        Ok(())
    }

    /// Collect icon, fanart and screenshots from the addon repository.
    pub fn load_assets(&mut self, repository: &Path) -> Result<()> {
        self.assets = scan_assets(repository, &self.game.addon)?;
        Ok(())
    }

    /// Combine an upstream version token with our release history.
    pub fn load_game_version(&mut self, upstream_version: &str, describe: &str) {
        let addon_version = version::derive_addon_version(upstream_version);
        let revision = if self.config.git_tag {
            version::derive_tagged_revision(&addon_version, describe)
        } else {
            version::derive_package_revision(describe)
        };
        self.game.version = version::full_version(&addon_version, &revision);
    }

    pub fn bump_version(&mut self) {
        self.game.version = version::bump_version(&self.game.version);
    }

    pub fn set_diff(&mut self, diff: String) {
        self.git.changed = !diff.is_empty();
        self.git.diff = diff;
    }

    pub fn changed(&self) -> bool {
        self.git.changed
    }
}

/// Parse `key = "value"` lines; comments and lines without `=` are skipped.
pub fn parse_info_file(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), first_word(value)))
        .collect()
}

/// First shell word of `value` with its quotes removed.
fn first_word(value: &str) -> String {
    let value = value.trim_start();
    let mut chars = value.chars();
    match chars.next() {
        Some(quote @ ('"' | '\'')) => chars.take_while(|&c| c != quote).collect(),
        Some(_) => value.split_whitespace().next().unwrap_or_default().to_string(),
        None => String::new(),
    }
}

fn scan_assets(repository: &Path, addon: &str) -> Result<Assets> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(repository)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
    {
        let entry = entry.map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(repository) {
            files.push(relative.to_path_buf());
        }
    }
    files.sort();

    let resources = Path::new(addon).join("resources");
    let mut assets = Assets::default();
    for file in files {
        let is_image = file
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ASSET_EXTENSIONS.contains(&ext))
            .unwrap_or(false);
        if !is_image {
            continue;
        }

        let in_resources = file.parent() == Some(resources.as_path());
        let file_name = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        if in_resources && file_name == "icon.png" {
            assets.icon = Some("resources/icon.png".to_string());
        } else if in_resources && file_name == "fanart.jpg" {
            assets.fanart = Some("resources/fanart.jpg".to_string());
        } else if in_resources && file_name.starts_with("screenshot") {
            assets.screenshots.push(format!("resources/{}", file_name));
        } else {
            warn!("Unrecognized image detected: {}", file.display());
        }
    }
    Ok(assets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project() -> ProjectDescriptor {
        ProjectDescriptor {
            id: "beetle-psx".to_string(),
            upstream_repo: "beetle-psx-libretro".to_string(),
            build_file: "Makefile".to_string(),
            build_subdir: ".".to_string(),
            extra_dir: "jni".to_string(),
            options: ProjectOptions {
                soname: Some("mednafen_psx".to_string()),
                ..Default::default()
            },
        }
    }

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_initial_aggregate() {
        let info = AddonInfo::new(&project(), "game.libretro.beetle-psx", None);

        assert_eq!(info.game.name, "beetle-psx");
        assert_eq!(info.game.branch, "master");
        assert_eq!(info.game.version, "0.0.0");
        assert_eq!(info.libretro_repo.branch, "master");
        assert_eq!(info.library.soname, "mednafen_psx_libretro");
        assert_eq!(info.library.jnisoname, "libretro");
        assert!(info
            .library
            .file
            .starts_with("install/game.libretro.beetle-psx"));
        assert!(!info.library.loaded);
    }

    #[test]
    fn test_missing_fields_render_empty() {
        let info = AddonInfo::new(&project(), "game.libretro.beetle-psx", Some("develop"));
        let json = serde_json::to_value(&info).unwrap();

        assert_eq!(json["library"]["error"], "");
        assert_eq!(json["library"]["opengl"], "");
        assert_eq!(json["assets"]["icon"], "");
        assert_eq!(json["game"]["branch"], "develop");
        assert!(json.get("git").is_none());
    }

    #[test]
    fn test_apply_library_sorts_settings() {
        let mut info = AddonInfo::new(&project(), "game.libretro.beetle-psx", None);
        let metadata = LibraryMetadata {
            system_info: SystemInfo {
                name: "Beetle PSX".to_string(),
                version: "v0.9.44".to_string(),
                ..Default::default()
            },
            settings: vec![
                Setting {
                    id: "psx_renderer".to_string(),
                    description: "Renderer".to_string(),
                    values: vec!["hardware".to_string(), "software".to_string()],
                    default: String::new(),
                },
                Setting {
                    id: "psx_cd_access".to_string(),
                    description: "CD access".to_string(),
                    values: vec!["sync".to_string()],
                    default: "sync".to_string(),
                },
            ],
            opengl: true,
        };

        info.apply_library(Ok(metadata));

        assert!(info.library.loaded);
        assert_eq!(info.library.opengl, Some(true));
        assert_eq!(info.system_info.name, "Beetle PSX");
        let ids: Vec<&str> = info.settings.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["psx_cd_access", "psx_renderer"]);
        assert_eq!(info.settings[1].default, "hardware");
    }

    #[test]
    fn test_apply_library_failure_is_recorded() {
        let mut info = AddonInfo::new(&project(), "game.libretro.beetle-psx", None);
        info.apply_library(Err(SyncError::LibraryLoad {
            path: info.library.file.clone(),
            reason: "No such file".to_string(),
        }));

        assert!(!info.library.loaded);
        assert!(info.library.error.as_deref().unwrap().contains("No such file"));
        assert_eq!(info.system_info, SystemInfo::default());
    }

    #[test]
    fn test_game_version() {
        let mut info = AddonInfo::new(&project(), "game.libretro.beetle-psx", None);

        info.load_game_version("v0.9.44", "abcdef0");
        assert_eq!(info.game.version, "0.9.44.-1");
        info.bump_version();
        assert_eq!(info.game.version, "0.9.44.0");

        info.load_game_version("v0.9.44", "0.9.44.3-2-gabcdef0");
        assert_eq!(info.game.version, "0.9.44.3");
    }

    #[test]
    fn test_git_tag_version_follows_own_releases() {
        let mut descriptor = project();
        descriptor.options.git_tag = true;
        let mut info = AddonInfo::new(&descriptor, "game.libretro.chailove", None);

        info.load_game_version("1.2.3", "0.9.44.3");
        assert_eq!(info.game.version, "1.2.3.0");

        info.load_game_version("v1.2.3-4-gabcdef0", "1.2.3.2");
        assert_eq!(info.game.version, "1.2.3.2");
    }

    #[test]
    fn test_parse_info_file() {
        let info = parse_info_file(
            "#comment\na=1\ndisplay_name = \"Sony - PlayStation (Beetle PSX)\"\n\n\
             supported_extensions = 'cue|toc'\n",
        );

        assert_eq!(info["a"], "1");
        assert_eq!(info["display_name"], "Sony - PlayStation (Beetle PSX)");
        assert_eq!(info["supported_extensions"], "cue|toc");
        assert_eq!(info.len(), 3);
    }

    #[test]
    fn test_load_info_file_missing() {
        let temp_dir = TempDir::new().unwrap();
        let mut info = AddonInfo::new(&project(), "game.libretro.beetle-psx", None);

        info.load_info_file(temp_dir.path()).unwrap();
        assert!(info.libretro_info.is_empty());

        std::fs::write(
            temp_dir.path().join("mednafen_psx_libretro.info"),
            "corename = \"Beetle PSX\"\n",
        )
        .unwrap();
        info.load_info_file(temp_dir.path()).unwrap();
        assert_eq!(info.libretro_info["corename"], "Beetle PSX");
    }

    #[test]
    fn test_load_assets() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let addon = "game.libretro.beetle-psx";
        touch(root, &format!("{}/resources/icon.png", addon));
        touch(root, &format!("{}/resources/fanart.jpg", addon));
        touch(root, &format!("{}/resources/screenshot-2.jpg", addon));
        touch(root, &format!("{}/resources/screenshot-1.jpg", addon));
        touch(root, &format!("{}/resources/logo.svg", addon));
        touch(root, &format!("{}/addon.xml.in", addon));

        let mut info = AddonInfo::new(&project(), addon, None);
        info.load_assets(root).unwrap();

        assert_eq!(
            info.assets,
            Assets {
                icon: Some("resources/icon.png".to_string()),
                fanart: Some("resources/fanart.jpg".to_string()),
                screenshots: vec![
                    "resources/screenshot-1.jpg".to_string(),
                    "resources/screenshot-2.jpg".to_string(),
                ],
            }
        );
    }
}

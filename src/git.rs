use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::github::RemoteRepository;

/// Name of the remote every local mirror fetches from and pushes to.
pub const ORIGIN: &str = "origin";

/// Branch that mirrors follow upstream and that is never force-pushed.
pub const PRIMARY_BRANCH: &str = "master";

/// Well-known id of the empty tree, used as diff base without a remote.
pub const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Version of the installed git binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GitVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl GitVersion {
    /// First release supporting `fetch --prune-tags`.
    pub const PRUNE_TAGS: GitVersion = GitVersion {
        major: 2,
        minor: 17,
        patch: 0,
    };

    /// Parse the output of `git --version` (e.g. `git version 2.39.2 (Apple Git-143)`).
    pub fn parse(output: &str) -> Option<Self> {
        let re = Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").ok()?;
        let caps = re.captures(output)?;
        let num = |idx: usize| {
            caps.get(idx)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0)
        };
        Some(Self {
            major: num(1),
            minor: num(2),
            patch: num(3),
        })
    }
}

/// How deleted upstream tags are removed locally during fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagPruneStrategy {
    /// `git fetch --prune --prune-tags --tags`
    Native,
    /// Delete every local tag, then fetch all tags again.
    DeleteAndRefetch,
}

/// Capabilities of the installed git, probed once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GitCapabilities {
    pub version: GitVersion,
    pub tag_prune: TagPruneStrategy,
}

impl GitCapabilities {
    pub fn from_version(version: GitVersion) -> Self {
        let tag_prune = if version >= GitVersion::PRUNE_TAGS {
            TagPruneStrategy::Native
        } else {
            TagPruneStrategy::DeleteAndRefetch
        };
        Self { version, tag_prune }
    }

    /// Run `git --version` and select the tag pruning strategy.
    pub async fn probe() -> Result<Self> {
        let output = AsyncCommand::new("git").arg("--version").output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(SyncError::Git {
                path: PathBuf::from("."),
                args: "--version".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let version = GitVersion::parse(&stdout).ok_or_else(|| SyncError::Git {
            path: PathBuf::from("."),
            args: "--version".to_string(),
            stderr: format!("unrecognized version string: {}", stdout.trim()),
        })?;
        let capabilities = Self::from_version(version);
        debug!(
            "Detected git {}.{}.{}, tag pruning: {:?}",
            version.major, version.minor, version.patch, capabilities.tag_prune
        );
        Ok(capabilities)
    }
}

/// Author and committer used for commits and annotated tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

/// A local working copy bound to one remote repository identity.
///
/// Nothing about the repository is cached: every call reads the on-disk
/// state again, so external changes between calls are always observed.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    remote: RemoteRepository,
    path: PathBuf,
    capabilities: GitCapabilities,
    identity: Option<CommitIdentity>,
}

impl LocalRepository {
    /// Whether `path` is the top level of a git working copy.
    ///
    /// A directory nested inside some other repository does not count.
    pub async fn is_git_repo(path: &Path) -> bool {
        let output = match AsyncCommand::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(path)
            .output()
            .await
        {
            Ok(output) if output.status.success() => output,
            _ => return false,
        };

        let toplevel = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        match (toplevel.canonicalize(), path.canonicalize()) {
            (Ok(toplevel), Ok(path)) => toplevel == path,
            _ => false,
        }
    }

    /// Open `base_directory/<remote.name>`, initializing it first if needed.
    pub async fn open(
        remote: RemoteRepository,
        base_directory: &Path,
        capabilities: GitCapabilities,
    ) -> Result<Self> {
        let path = base_directory.join(&remote.name);
        if let Err(e) = tokio::fs::create_dir_all(&path).await {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(e.into());
            }
        }

        let repo = Self {
            remote,
            path,
            capabilities,
            identity: None,
        };

        if Self::is_git_repo(&repo.path).await {
            info!("Existing repo {}", repo.remote.name);
        } else {
            info!("New repo, creating {}", repo.remote.name);
            repo.git(["init", "-q"]).await?;
            let head_ref = format!("refs/heads/{}", PRIMARY_BRANCH);
            repo.git(["symbolic-ref", "HEAD", head_ref.as_str()]).await?;
        }

        if !repo.remote.clone_url.is_empty() {
            if repo.has_origin().await? {
                debug!("Reusing remote {} of {}", ORIGIN, repo.remote.name);
            } else {
                repo.git(["remote", "add", ORIGIN, repo.remote.clone_url.as_str()])
                    .await?;
            }
            let push_url = repo.remote.push_url.as_str();
            if !push_url.is_empty() && push_url != repo.remote.clone_url {
                repo.git(["remote", "set-url", "--push", ORIGIN, push_url])
                    .await?;
            }
        }

        Ok(repo)
    }

    /// Use `identity` as author, committer and tagger.
    pub fn with_identity(mut self, identity: Option<CommitIdentity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.remote.name
    }

    pub fn remote(&self) -> &RemoteRepository {
        &self.remote
    }

    /// Fetch the primary branch and tags, then reset (or rebase) onto it.
    ///
    /// The working tree is always unstaged and cleaned afterwards, including
    /// ignored files. A repository without `origin` is only cleaned.
    pub async fn fetch_and_reset(&self, reset: bool) -> Result<()> {
        let upstream = upstream_ref();

        if self.has_origin().await? {
            info!("Fetching {}", self.remote.name);
            self.git(["fetch", "-q", ORIGIN, PRIMARY_BRANCH]).await?;
            self.fetch_tags().await?;

            // An unborn branch has nothing to preserve, so it is reset either way.
            if reset || !self.head_is_valid().await? {
                info!("Resetting {}", self.remote.name);
                self.git(["reset", "-q", "--hard", upstream.as_str()]).await?;
            } else {
                info!("Rebasing {}", self.remote.name);
                let output = self.run(["rebase", upstream.as_str()]).await?;
                if !output.status.success() {
                    return Err(SyncError::RebaseConflict {
                        path: self.path.clone(),
                        upstream,
                        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    });
                }
            }
        } else {
            info!("Skipping fetching {}, no {} remote", self.remote.name, ORIGIN);
        }

        info!("Cleaning local changes {}", self.remote.name);
        if self.head_is_valid().await? {
            self.git(["reset", "-q"]).await?;
        } else {
            self.git(["read-tree", "--empty"]).await?;
        }
        self.git(["clean", "-xffd", "-q"]).await?;
        Ok(())
    }

    async fn fetch_tags(&self) -> Result<()> {
        match self.capabilities.tag_prune {
            TagPruneStrategy::Native => {
                self.git(["fetch", "-q", "--tags", "--prune", "--prune-tags", ORIGIN])
                    .await?;
            }
            TagPruneStrategy::DeleteAndRefetch => {
                let listing = self.git(["tag", "--list"]).await?;
                let tags: Vec<&str> = listing
                    .lines()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .collect();
                if !tags.is_empty() {
                    debug!("Dropping {} local tags of {}", tags.len(), self.remote.name);
                    let mut args = vec!["tag", "--delete"];
                    args.extend(tags);
                    self.git(args).await?;
                }
                self.git(["fetch", "-q", "--tags", "--prune", ORIGIN]).await?;
            }
        }
        Ok(())
    }

    /// HEAD commit id, empty while the repository has no commits.
    pub async fn get_hexsha(&self) -> Result<String> {
        if !self.head_is_valid().await? {
            return Ok(String::new());
        }
        Ok(self.git(["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    /// Stage and commit, optionally squashing everything since upstream.
    ///
    /// With `directory` only that path is staged; `force` also stages ignored
    /// files. Nothing is committed when staging leaves the index unchanged.
    pub async fn commit(
        &self,
        message: &str,
        directory: Option<&Path>,
        force: bool,
        squash: bool,
    ) -> Result<()> {
        let mut add: Vec<String> = vec!["add".into()];
        if force {
            add.push("--force".into());
        }
        match directory {
            Some(dir) => {
                add.push("--".into());
                add.push(dir.to_string_lossy().into_owned());
            }
            None => add.push("--all".into()),
        }
        self.git(&add).await?;

        if squash {
            let upstream = upstream_ref();
            let output = self.run(["reset", "-q", "--soft", upstream.as_str()]).await?;
            if !output.status.success() {
                warn!(
                    "Cannot squash onto {} in {}, restarting history",
                    upstream, self.remote.name
                );
                self.git(["update-ref", "-d", "HEAD"]).await?;
            }
        }

        if self.has_staged_changes().await? {
            info!("Committing {}", self.remote.name);
            self.git(["commit", "-q", "--no-verify", "-m", message]).await?;
        } else {
            debug!("Nothing to commit in {}", self.remote.name);
        }
        Ok(())
    }

    /// Create (or move) an annotated tag at HEAD. No-op without commits.
    pub async fn tag(&self, name: &str, message: Option<&str>) -> Result<()> {
        if !self.head_is_valid().await? {
            debug!("Not tagging {} without HEAD", self.remote.name);
            return Ok(());
        }
        info!("Tagging {} as {}", self.remote.name, name);
        self.git(["tag", "-f", "-a", name, "-m", message.unwrap_or(name)])
            .await?;
        Ok(())
    }

    /// Diff from upstream (or the empty tree) to HEAD.
    pub async fn diff(&self) -> Result<String> {
        if !self.head_is_valid().await? {
            return Ok(String::new());
        }
        if self.has_origin().await? {
            let upstream = upstream_ref();
            let output = self.run(["diff", upstream.as_str(), "HEAD"]).await?;
            if output.status.success() {
                return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
            }
            debug!("No {} in {}, diffing against empty tree", upstream_ref(), self.remote.name);
        }
        self.git(["diff", EMPTY_TREE, "HEAD"]).await
    }

    /// Nearest tag description of HEAD, or abbreviated hash, or empty.
    pub async fn describe(&self) -> Result<String> {
        if !self.head_is_valid().await? {
            return Ok(String::new());
        }
        let output = self.run(["describe", "--tags", "--always"]).await?;
        if !output.status.success() {
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Push HEAD to `branch` on origin.
    ///
    /// Fails on a dirty working tree. Every branch except the primary one is
    /// force-pushed.
    pub async fn push(&self, branch: &str, tags: bool) -> Result<()> {
        if self.is_dirty().await? {
            return Err(SyncError::DirtyPush {
                path: self.path.clone(),
            });
        }

        let refspec = format!("HEAD:refs/heads/{}", branch);
        info!("Pushing {} to {}", self.remote.name, branch);
        if branch == PRIMARY_BRANCH {
            self.git(["push", "-q", ORIGIN, refspec.as_str()]).await?;
        } else {
            self.git(["push", "-q", "--force", ORIGIN, refspec.as_str()]).await?;
        }

        if tags {
            self.git(["push", "-q", "--tags", ORIGIN]).await?;
        }
        Ok(())
    }

    /// Tracked files differ from HEAD, staged or not.
    pub async fn is_dirty(&self) -> Result<bool> {
        let status = self
            .git(["status", "--porcelain", "--untracked-files=no"])
            .await?;
        Ok(!status.trim().is_empty())
    }

    pub async fn has_origin(&self) -> Result<bool> {
        let remotes = self.git(["remote"]).await?;
        Ok(remotes.lines().any(|remote| remote.trim() == ORIGIN))
    }

    pub async fn head_is_valid(&self) -> Result<bool> {
        let output = self
            .run(["rev-parse", "--verify", "--quiet", "HEAD^{commit}"])
            .await?;
        Ok(output.status.success())
    }

    pub async fn tag_exists(&self, name: &str) -> Result<bool> {
        let reference = format!("refs/tags/{}", name);
        let output = self
            .run(["rev-parse", "--verify", "--quiet", reference.as_str()])
            .await?;
        Ok(output.status.success())
    }

    async fn has_staged_changes(&self) -> Result<bool> {
        if !self.head_is_valid().await? {
            let index = self.git(["ls-files", "--cached"]).await?;
            return Ok(!index.trim().is_empty());
        }
        let output = self.run(["diff", "--cached", "--quiet"]).await?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(self.failure(&["diff", "--cached", "--quiet"], &output)),
        }
    }

    /// Run git and return its raw output, whatever the exit status.
    async fn run<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = AsyncCommand::new("git");
        command.args(args).current_dir(&self.path);
        if let Some(identity) = &self.identity {
            command
                .env("GIT_AUTHOR_NAME", &identity.name)
                .env("GIT_AUTHOR_EMAIL", &identity.email)
                .env("GIT_COMMITTER_NAME", &identity.name)
                .env("GIT_COMMITTER_EMAIL", &identity.email);
        }
        Ok(command.output().await?)
    }

    /// Run git and return stdout, failing on a non-zero exit status.
    async fn git<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let output = self.run(args.iter()).await?;
        if !output.status.success() {
            return Err(self.failure(&args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn failure<S: AsRef<std::ffi::OsStr>>(&self, args: &[S], output: &Output) -> SyncError {
        SyncError::Git {
            path: self.path.clone(),
            args: args
                .iter()
                .map(|a| a.as_ref().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

fn upstream_ref() -> String {
    format!("{}/{}", ORIGIN, PRIMARY_BRANCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_version_parsing() {
        assert_eq!(
            GitVersion::parse("git version 2.39.2 (Apple Git-143)"),
            Some(GitVersion {
                major: 2,
                minor: 39,
                patch: 2
            })
        );
        assert_eq!(
            GitVersion::parse("git version 2.17"),
            Some(GitVersion {
                major: 2,
                minor: 17,
                patch: 0
            })
        );
        assert_eq!(GitVersion::parse("not git"), None);
    }

    #[test]
    fn test_tag_prune_strategy_selection() {
        let old = GitVersion::parse("git version 2.16.6").unwrap();
        let new = GitVersion::parse("git version 2.17.0").unwrap();
        assert_eq!(
            GitCapabilities::from_version(old).tag_prune,
            TagPruneStrategy::DeleteAndRefetch
        );
        assert_eq!(
            GitCapabilities::from_version(new).tag_prune,
            TagPruneStrategy::Native
        );
    }

    #[tokio::test]
    async fn test_is_git_repo_missing_path() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(!LocalRepository::is_git_repo(&temp.path().join("missing")).await);
        assert!(!LocalRepository::is_git_repo(temp.path()).await);
    }

    #[tokio::test]
    async fn test_open_without_clone_url_has_no_origin() {
        let temp = tempfile::TempDir::new().unwrap();
        let capabilities = GitCapabilities::probe().await.unwrap();
        let remote = RemoteRepository::local("game.libretro.test");
        let repo = LocalRepository::open(remote, temp.path(), capabilities)
            .await
            .unwrap();

        assert!(LocalRepository::is_git_repo(repo.path()).await);
        assert!(!repo.has_origin().await.unwrap());
        assert_eq!(repo.path(), temp.path().join("game.libretro.test"));
    }

    #[tokio::test]
    async fn test_open_sets_separate_push_url() {
        let temp = tempfile::TempDir::new().unwrap();
        let capabilities = GitCapabilities::probe().await.unwrap();
        let remote = RemoteRepository {
            name: "game.libretro.push".to_string(),
            clone_url: "https://example.invalid/game.libretro.push.git".to_string(),
            push_url: "git@example.invalid:game.libretro.push.git".to_string(),
        };
        let repo = LocalRepository::open(remote, temp.path(), capabilities).await.unwrap();

        let fetch = repo.git(["remote", "get-url", ORIGIN]).await.unwrap();
        let push = repo.git(["remote", "get-url", "--push", ORIGIN]).await.unwrap();
        assert_eq!(fetch.trim(), "https://example.invalid/game.libretro.push.git");
        assert_eq!(push.trim(), "git@example.invalid:game.libretro.push.git");
    }
}

//! Common test utilities: throwaway upstream repositories driven by the git CLI
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use kodi_addon_sync::git::{CommitIdentity, GitCapabilities, LocalRepository};
use kodi_addon_sync::RemoteRepository;

pub const USER_NAME: &str = "Test User";
pub const USER_EMAIL: &str = "test@example.com";

pub fn identity() -> CommitIdentity {
    CommitIdentity {
        name: USER_NAME.to_string(),
        email: USER_EMAIL.to_string(),
    }
}

/// Run git in `dir`, panicking on failure, and return trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", USER_NAME)
        .env("GIT_AUTHOR_EMAIL", USER_EMAIL)
        .env("GIT_COMMITTER_NAME", USER_NAME)
        .env("GIT_COMMITTER_EMAIL", USER_EMAIL)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed in {:?}: {}",
        args,
        dir,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Scratch area holding bare upstream repositories and a working directory
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub remotes_dir: PathBuf,
    pub working_dir: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let remotes_dir = temp_dir.path().join("remotes");
        let working_dir = temp_dir.path().join("work");
        std::fs::create_dir_all(&remotes_dir).expect("Failed to create remotes dir");
        std::fs::create_dir_all(&working_dir).expect("Failed to create working dir");

        Self {
            temp_dir,
            remotes_dir,
            working_dir,
        }
    }

    /// Bare repository `<name>.git` whose master holds one commit with a README.
    pub fn create_upstream(&self, name: &str) -> RemoteRepository {
        let bare = self.remotes_dir.join(format!("{}.git", name));
        std::fs::create_dir_all(&bare).expect("Failed to create bare dir");
        git(&bare, &["init", "-q", "--bare"]);
        git(&bare, &["symbolic-ref", "HEAD", "refs/heads/master"]);

        let remote = RemoteRepository {
            name: name.to_string(),
            clone_url: bare.to_string_lossy().into_owned(),
            push_url: String::new(),
        };
        self.commit_upstream(&remote, "README.md", &format!("# {}\n", name));
        remote
    }

    /// Push a commit writing `file` to the upstream master.
    pub fn commit_upstream(&self, remote: &RemoteRepository, file: &str, content: &str) -> String {
        let seed = TempDir::new().expect("Failed to create seed dir");
        let dir = seed.path();
        git(dir, &["init", "-q"]);
        git(dir, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        git(dir, &["remote", "add", "origin", &remote.clone_url]);
        // Empty upstreams have nothing to fetch yet
        let _ = Command::new("git")
            .args(["fetch", "-q", "origin", "master"])
            .current_dir(dir)
            .output();
        if Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", "FETCH_HEAD"])
            .current_dir(dir)
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
        {
            git(dir, &["reset", "-q", "--hard", "FETCH_HEAD"]);
        }

        let path = dir.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(&path, content).expect("Failed to write upstream file");
        git(dir, &["add", "--all"]);
        git(dir, &["commit", "-q", "-m", &format!("Update {}", file)]);
        git(dir, &["push", "-q", "origin", "HEAD:refs/heads/master"]);
        git(dir, &["rev-parse", "HEAD"])
    }

    /// Create a lightweight tag on the upstream master.
    pub fn tag_upstream(&self, remote: &RemoteRepository, tag: &str) {
        git(Path::new(&remote.clone_url), &["tag", tag, "master"]);
    }

    pub fn delete_upstream_tag(&self, remote: &RemoteRepository, tag: &str) {
        git(Path::new(&remote.clone_url), &["tag", "-d", tag]);
    }

    pub fn upstream_head(&self, remote: &RemoteRepository, branch: &str) -> String {
        git(Path::new(&remote.clone_url), &["rev-parse", branch])
    }

    pub fn upstream_tags(&self, remote: &RemoteRepository) -> Vec<String> {
        git(Path::new(&remote.clone_url), &["tag", "--list"])
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub async fn open(&self, remote: RemoteRepository) -> LocalRepository {
        LocalRepository::open(remote, &self.working_dir, capabilities().await)
            .await
            .expect("Failed to open repository")
            .with_identity(Some(identity()))
    }
}

pub async fn capabilities() -> GitCapabilities {
    GitCapabilities::probe().await.expect("git is not available")
}

pub fn write(repo: &LocalRepository, file: &str, content: &str) {
    let path = repo.path().join(file);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    std::fs::write(path, content).expect("Failed to write file");
}

pub fn local_tags(repo: &LocalRepository) -> Vec<String> {
    git(repo.path(), &["tag", "--list"])
        .lines()
        .map(str::to_string)
        .collect()
}

/// Number of commits reachable from HEAD but not from `base`.
pub fn commits_since(repo: &LocalRepository, base: &str) -> usize {
    git(repo.path(), &["rev-list", "--count", &format!("{}..HEAD", base)])
        .parse()
        .expect("rev-list output is a number")
}

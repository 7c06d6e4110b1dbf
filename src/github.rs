use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::models::Repository;
use octocrab::Octocrab;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use tracing::{debug, info, warn};

use crate::config::GitHubConfig;
use crate::credentials::Credentials;
use crate::error::{Result, SyncError};

/// Identity of one remote repository.
///
/// `clone_url` is empty for repositories that only exist locally;
/// `push_url` is used for authenticated pushes only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepository {
    pub name: String,
    pub clone_url: String,
    pub push_url: String,
}

impl RemoteRepository {
    /// Identity without any remote, for local-only repositories.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clone_url: String::new(),
            push_url: String::new(),
        }
    }
}

impl From<&Repository> for RemoteRepository {
    fn from(repo: &Repository) -> Self {
        Self {
            name: repo.name.clone(),
            clone_url: repo
                .clone_url
                .as_ref()
                .map(|url| url.to_string())
                .unwrap_or_default(),
            push_url: repo.ssh_url.clone().unwrap_or_default(),
        }
    }
}

/// Core API quota of the current credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// Raw hosting platform operations, without caching or matching.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositoryHost: Send + Sync {
    async fn rate_limit(&self) -> Result<RateLimit>;

    async fn list_repositories(&self, organization: &str) -> Result<Vec<RemoteRepository>>;

    /// Create an auto-initialized repository (default branch not empty).
    async fn create_repository(&self, organization: &str, name: &str) -> Result<RemoteRepository>;
}

/// What the orchestrator needs from a hosting platform.
#[async_trait]
pub trait RemoteHostingClient: Send {
    /// All organization repositories whose name matches `pattern`.
    async fn get_repos(&mut self, pattern: &str) -> Result<BTreeMap<String, RemoteRepository>>;

    async fn create_repo(&mut self, name: &str) -> Result<RemoteRepository>;
}

/// GitHub authentication strategies, in order of precedence.
#[derive(Debug, Clone)]
pub enum Auth {
    /// Access token from the environment
    Token(String),
    /// Username and password (or token) from the credential store
    Basic { username: String, password: String },
    Anonymous,
}

/// Octocrab backed [`RepositoryHost`].
pub struct OctocrabHost {
    client: Octocrab,
}

impl OctocrabHost {
    pub fn new(auth: &Auth) -> Result<Self> {
        let builder = Octocrab::builder();
        let client = match auth {
            Auth::Token(token) => builder.personal_token(token.clone()).build()?,
            Auth::Basic { username, password } => builder
                .basic_auth(username.clone(), password.clone())
                .build()?,
            Auth::Anonymous => builder.build()?,
        };
        Ok(Self { client })
    }
}

#[async_trait]
impl RepositoryHost for OctocrabHost {
    async fn rate_limit(&self) -> Result<RateLimit> {
        let rate_limit = self.client.ratelimit().get().await?;
        let core = &rate_limit.resources.core;
        Ok(RateLimit {
            limit: core.limit as u64,
            remaining: core.remaining as u64,
            reset_at: DateTime::from_timestamp(core.reset as i64, 0).unwrap_or_else(Utc::now),
        })
    }

    async fn list_repositories(&self, organization: &str) -> Result<Vec<RemoteRepository>> {
        debug!("Fetching repositories for organization: {}", organization);

        let mut repositories = Vec::new();
        let mut page = 1u32;

        loop {
            let page_repos = self
                .client
                .orgs(organization)
                .list_repos()
                .per_page(100)
                .page(page)
                .send()
                .await?;

            let items = page_repos.items;
            if items.is_empty() {
                break;
            }
            repositories.extend(items.iter().map(RemoteRepository::from));
            page += 1;
        }

        info!(
            "Found {} repositories for organization: {}",
            repositories.len(),
            organization
        );
        Ok(repositories)
    }

    async fn create_repository(&self, organization: &str, name: &str) -> Result<RemoteRepository> {
        let body = serde_json::json!({ "name": name, "auto_init": true });
        let repo: Repository = self
            .client
            .post(format!("/orgs/{}/repos", organization), Some(&body))
            .await?;
        Ok(RemoteRepository::from(&repo))
    }
}

/// Repository listings keyed by the pattern they were queried with.
#[derive(Debug, Default)]
pub struct RepoCache {
    entries: HashMap<String, BTreeMap<String, RemoteRepository>>,
}

impl RepoCache {
    pub fn get(&self, pattern: &str) -> Option<&BTreeMap<String, RemoteRepository>> {
        self.entries.get(pattern)
    }

    pub fn insert(&mut self, pattern: &str, repos: BTreeMap<String, RemoteRepository>) {
        self.entries.insert(pattern.to_string(), repos);
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One GitHub organization, with cached repository listings.
pub struct GitHubOrg<H = OctocrabHost> {
    host: H,
    organization: String,
    cache: RepoCache,
}

impl GitHubOrg<OctocrabHost> {
    /// Connect using the environment token, stored credentials or nothing.
    ///
    /// Stored credentials are only consulted when `auth` is set. If they are
    /// rejected they are erased before the authentication error is returned.
    pub async fn connect(settings: &GitHubConfig, auth: bool) -> Result<Self> {
        let token = env::var(&settings.token_env).ok().filter(|t| !t.is_empty());

        let mut store = None;
        let credentials = match token {
            Some(token) => {
                info!("Using GitHub token from {}", settings.token_env);
                Auth::Token(token)
            }
            None if auth => {
                let credentials = Credentials::new("github");
                let (username, password) = credentials.load()?;
                store = Some(credentials);
                Auth::Basic { username, password }
            }
            None => Auth::Anonymous,
        };

        let host = OctocrabHost::new(&credentials)?;
        match Self::with_host(host, &settings.organization, settings.rate_limit_floor).await {
            Ok(org) => {
                if let (Some(store), Auth::Basic { username, password }) = (&store, &credentials) {
                    store.save(username, password)?;
                }
                Ok(org)
            }
            Err(e) if is_bad_credentials(&e) => {
                if let Some(store) = &store {
                    warn!("Removing rejected GitHub credentials");
                    store.clean()?;
                }
                Err(SyncError::Authentication(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

impl<H: RepositoryHost> GitHubOrg<H> {
    /// Wrap `host`, failing when less than `rate_limit_floor` calls remain.
    pub async fn with_host(host: H, organization: &str, rate_limit_floor: u64) -> Result<Self> {
        let rate = host.rate_limit().await?;
        info!(
            "GitHub API Rate: limit: {}, remaining: {}, reset: {}",
            rate.limit,
            rate.remaining,
            rate.reset_at.to_rfc3339()
        );
        if rate.remaining < rate_limit_floor {
            return Err(SyncError::RateLimited {
                reset_at: rate.reset_at,
            });
        }

        Ok(Self {
            host,
            organization: organization.to_string(),
            cache: RepoCache::default(),
        })
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn cache(&self) -> &RepoCache {
        &self.cache
    }
}

#[async_trait]
impl<H: RepositoryHost> RemoteHostingClient for GitHubOrg<H> {
    async fn get_repos(&mut self, pattern: &str) -> Result<BTreeMap<String, RemoteRepository>> {
        if let Some(repos) = self.cache.get(pattern) {
            debug!("Using cached repository list for '{}'", pattern);
            return Ok(repos.clone());
        }

        let re = Regex::new(pattern)
            .map_err(|e| {
                SyncError::Config(format!("invalid repository pattern '{}': {}", pattern, e))
            })?;
        let repos: BTreeMap<String, RemoteRepository> = self
            .host
            .list_repositories(&self.organization)
            .await?
            .into_iter()
            .filter(|repo| re.is_match(&repo.name))
            .map(|repo| (repo.name.clone(), repo))
            .collect();

        self.cache.insert(pattern, repos.clone());
        Ok(repos)
    }

    async fn create_repo(&mut self, name: &str) -> Result<RemoteRepository> {
        info!("Creating GitHub repository {}/{}", self.organization, name);
        let repo = self.host.create_repository(&self.organization, name).await?;
        self.cache.invalidate();
        Ok(repo)
    }
}

/// Whether the API rejected the supplied credentials.
pub fn is_bad_credentials(e: &SyncError) -> bool {
    match e {
        SyncError::GitHub(octocrab::Error::GitHub { source, .. }) => {
            source.status_code.as_u16() == 401
        }
        SyncError::Authentication(_) => true,
        _ => false,
    }
}

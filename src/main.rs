use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kodi_addon_sync::credentials::Credentials;
use kodi_addon_sync::github::{GitHubOrg, RemoteHostingClient};
use kodi_addon_sync::sync::{BuildType, Collaborators, SyncOptions, SyncOrchestrator};
use kodi_addon_sync::Config;

#[derive(Parser)]
#[command(name = "kodi-addon-sync")]
#[command(about = "Generate, version and publish Kodi game addon repositories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Regenerate addons and synchronize their repositories
    Sync {
        /// Directory holding the addon repositories
        #[arg(short = 'd', long = "game-addons-dir")]
        working_directory: PathBuf,

        /// Compile addons to read metadata from the built libraries
        #[arg(long)]
        compile: bool,

        /// Build type used for compiling
        #[arg(long = "buildtype", value_enum, default_value_t = BuildType::Release)]
        build_type: BuildType,

        /// Kodi source directory (for compiling and addon descriptions)
        #[arg(long = "kodi-source-dir")]
        source_directory: Option<PathBuf>,

        /// Fetch, commit and tag addon repositories
        #[arg(long)]
        git: bool,

        /// Keep existing commits (rebase and squash)
        #[arg(long = "git-noclean")]
        git_noclean: bool,

        /// Filter addons by id (e.g. nes)
        #[arg(long, default_value = "")]
        filter: String,

        /// Branch to push to
        #[arg(long = "push-branch")]
        push_branch: Option<String>,

        /// Push addon descriptions
        #[arg(long = "push-description")]
        push_description: bool,

        /// Clean existing addon descriptions
        #[arg(long = "clean-description")]
        clean_description: bool,
    },

    /// List configured addons and their remote repositories
    List {
        /// Filter addons by id
        #[arg(long, default_value = "")]
        filter: String,

        /// Look up remote repositories on GitHub
        #[arg(long)]
        remote: bool,
    },

    /// Manage stored GitHub credentials
    Auth {
        #[command(subcommand)]
        auth_command: AuthCommands,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Prompt for credentials and verify them
    Setup,

    /// Forget stored credentials
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config).await?;
    init_logging(cli.verbose, &config.logging.level)?;
    info!("Starting kodi-addon-sync v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Sync {
            working_directory,
            compile,
            build_type,
            source_directory,
            git,
            git_noclean,
            filter,
            push_branch,
            push_description,
            clean_description,
        } => {
            let options = SyncOptions {
                working_directory: std::path::absolute(&working_directory)
                    .context("Failed to resolve working directory")?,
                source_directory,
                compile,
                build_type,
                git,
                rebase: git_noclean,
                filter,
                push_branch,
                push_description,
                clean_description,
            };
            cmd_sync(options, config).await
        }
        Commands::List { filter, remote } => cmd_list(&filter, remote, &config).await,
        Commands::Auth { auth_command } => cmd_auth(auth_command, &config).await,
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool, default_level: &str) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
async fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::load_or_default(),
    }
}

/// Run the full pipeline
async fn cmd_sync(options: SyncOptions, config: Config) -> Result<()> {
    let mut github = if options.git {
        Some(
            GitHubOrg::connect(&config.github, true)
                .await
                .context("Failed to connect to GitHub")?,
        )
    } else {
        None
    };

    let collaborators = Collaborators::from_config(&config);
    let hosting = github
        .as_mut()
        .map(|github| github as &mut dyn RemoteHostingClient);
    let mut orchestrator = SyncOrchestrator::prepare(config, options, collaborators, hosting)
        .await
        .context("Failed to prepare addon repositories")?;

    let summary = orchestrator.run().await.context("Sync failed")?;

    println!("\n📈 Summary:");
    for addon in &summary.addons {
        let marker = if !addon.errors.is_empty() {
            "⚠️ "
        } else if addon.changed {
            "🔄"
        } else {
            "✅"
        };
        match &addon.tag {
            Some(tag) => println!(
                "   {} {} {} (tagged {})",
                marker, addon.addon, addon.version, tag
            ),
            None => println!("   {} {} {}", marker, addon.addon, addon.version),
        }
        for error in &addon.errors {
            println!("      {}", error);
        }
    }
    println!(
        "   {} addons, {} changed, {} with errors ({:.2}s)",
        summary.addons.len(),
        summary.changed(),
        summary.with_errors(),
        summary.duration.as_secs_f64()
    );

    Ok(())
}

/// List addons selected by a filter
async fn cmd_list(filter: &str, remote: bool, config: &Config) -> Result<()> {
    let projects = config.filter_projects(filter)?;

    let repos = if remote {
        let mut github = GitHubOrg::connect(&config.github, false).await?;
        let pattern = if filter.is_empty() {
            regex::escape(&config.github.addon_prefix)
        } else {
            filter.to_string()
        };
        github.get_repos(&pattern).await?
    } else {
        Default::default()
    };

    println!("Addons ({}): ", projects.len());
    for project in projects {
        let addon = config.github.addon_name(&project.id);
        match repos.get(&addon) {
            Some(repo) => println!(
                "  📁 {} ← {} ({})",
                addon, project.upstream_repo, repo.clone_url
            ),
            None => println!("  📁 {} ← {}", addon, project.upstream_repo),
        }
    }

    Ok(())
}

/// Handle authentication commands
async fn cmd_auth(auth_command: AuthCommands, config: &Config) -> Result<()> {
    match auth_command {
        AuthCommands::Setup => {
            let github = GitHubOrg::connect(&config.github, true).await?;
            println!("✅ Authentication successful");
            println!("   Organization: {}", github.organization());
        }
        AuthCommands::Clean => {
            Credentials::new("github").clean()?;
            println!("✅ Stored credentials removed");
        }
    }
    Ok(())
}

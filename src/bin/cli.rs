use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::time::Duration;

use assetsync::config::{self, ClientSettings, ServerConfig};
use assetsync::links::{LinkRegistry, LinkSet};
use assetsync::logging;
use assetsync::server;
use assetsync::sync::{
    self, ApiClient, AssetOutcome, Daemon, DaemonOptions, LinkStatus, NoHook, PullOptions,
    PushOptions, RunSummary, SyncEngine,
};

#[derive(Parser)]
#[command(name = "assetsync")]
#[command(
    about = "Keep AI-assistant assets (skills, commands, agents) in sync with a central version authority",
    version
)]
#[command(after_help = "Typical setup:
   assetsync config --url https://assets.example.com --token <token>
   assetsync register
   assetsync link <asset> [path]
   assetsync watch

Run `assetsync serve` to host the version authority yourself.")]
struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the server URL, API token and daemon tunables
    #[command(alias = "init")]
    Config {
        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        token: Option<String>,

        /// Seconds between remote polls in `watch`
        #[arg(long)]
        poll_secs: Option<u64>,

        /// Quiet period before a local edit is pushed
        #[arg(long)]
        debounce_ms: Option<u64>,
    },

    /// Register this machine with the server
    Register {
        /// Display name (defaults to the device name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Link an asset (id or slug) to a local file
    Link {
        asset: String,

        /// Local file (defaults to the asset's primary file name)
        path: Option<PathBuf>,
    },

    /// Remove a link; the local file is kept
    Unlink { asset: String },

    /// List linked assets
    Links,

    /// Show what sync would do for every link
    Status,

    /// Upload local edits
    Push {
        asset: Option<String>,

        /// Push even if the file did not change
        #[arg(long)]
        force: bool,
    },

    /// Download newer server versions
    Pull {
        asset: Option<String>,

        /// Re-download a named asset even if already current
        #[arg(long)]
        force: bool,
    },

    /// Push and pull in one pass
    Sync,

    /// Watch linked files and poll the server until interrupted
    Watch {
        /// Poll interval in seconds
        #[arg(long)]
        interval: Option<u64>,

        /// Debounce in milliseconds
        #[arg(long)]
        debounce: Option<u64>,
    },

    /// Run the version authority server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,

        /// Seed a user for this API token
        #[arg(long)]
        bootstrap_token: Option<String>,

        /// Requests per minute per user and endpoint
        #[arg(long)]
        rate_limit: Option<usize>,
    },
}

fn load_links() -> Result<LinkSet> {
    let cwd = std::env::current_dir()?;
    Ok(LinkSet::load(LinkRegistry::new(config::home_dir()), &cwd))
}

fn api_client(settings: &ClientSettings) -> Result<ApiClient> {
    if settings.api_token.is_none() {
        bail!("no API token configured; run `assetsync config --token <token>`");
    }
    Ok(ApiClient::new(
        &settings.api_url,
        settings.api_token.clone(),
        settings.request_timeout,
    )?)
}

fn engine(links: &LinkSet) -> Result<(ClientSettings, SyncEngine<ApiClient>)> {
    let settings = ClientSettings::resolve(links.global())?;
    let client = api_client(&settings)?;
    let machine_id = settings.require_machine()?.to_string();
    Ok((settings, SyncEngine::new(client, machine_id)))
}

fn print_summary(summary: &RunSummary) {
    for result in &summary.results {
        let name = result.asset_slug.bright_cyan();
        match &result.outcome {
            AssetOutcome::Pushed { version } => {
                println!("{} {} pushed as {}", "↑".green(), name, version.bright_white())
            }
            AssetOutcome::Pulled { version, action } => println!(
                "{} {} pulled {} {}",
                "↓".green(),
                name,
                version.bright_white(),
                format!("({})", action).bright_black()
            ),
            AssetOutcome::Unchanged => println!("{} {} up to date", "·".bright_black(), name),
            AssetOutcome::MissingLocal => {
                println!("{} {} has no local file", "·".bright_black(), name)
            }
            AssetOutcome::Conflict { action } => println!(
                "{} {} {}: local edit is newer than the server; run `assetsync push {}`",
                "!".yellow().bold(),
                name,
                action.to_string().yellow(),
                result.asset_slug
            ),
            AssetOutcome::Bundle { bundle_url } => println!(
                "{} {} is a bundle; download it manually{}",
                "!".yellow(),
                name,
                bundle_url
                    .as_deref()
                    .map(|u| format!(" from {}", u.bright_blue()))
                    .unwrap_or_default()
            ),
            AssetOutcome::NotInManifest => {
                println!("{} {} is no longer on the server", "!".yellow(), name)
            }
            AssetOutcome::Failed { error } => println!("{} {} {}", "✗".red(), name, error.red()),
        }
    }

    if summary.results.is_empty() {
        println!("{}", "No linked assets.".yellow());
        return;
    }
    println!(
        "\n{} pushed, {} pulled, {} conflicts, {} failed",
        summary.pushed().to_string().bright_white().bold(),
        summary.pulled().to_string().bright_white().bold(),
        summary.conflicts().to_string().yellow(),
        summary.failed().to_string().red()
    );
}

fn finish(summary: RunSummary) -> Result<()> {
    print_summary(&summary);
    if summary.has_failures() {
        bail!("{} asset(s) failed", summary.failed());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_dir = match cli.command {
        Commands::Watch { .. } | Commands::Serve { .. } => {
            let dir = config::home_dir().join("logs");
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            Some(dir)
        }
        _ => None,
    };
    let _guard = logging::init(cli.verbose, log_dir.as_deref());

    match cli.command {
        Commands::Config {
            url,
            token,
            poll_secs,
            debounce_ms,
        } => {
            let mut links = load_links()?;
            let global = links.global_mut();
            if let Some(url) = url {
                global.api_url = Some(url);
            }
            if let Some(token) = token {
                global.api_token = Some(token);
            }
            if let Some(secs) = poll_secs {
                global.settings.poll_interval_secs = secs.max(1);
            }
            if let Some(ms) = debounce_ms {
                global.settings.debounce_ms = ms;
            }
            links.save()?;

            let settings = ClientSettings::resolve(links.global())?;
            println!("{}", "✓ Configuration saved".green());
            println!("   {} {}", "Server:".bright_black(), settings.api_url);
            println!(
                "   {} {}",
                "Token: ".bright_black(),
                if settings.api_token.is_some() { "set" } else { "not set" }
            );
            println!(
                "   {} {:?} poll, {:?} debounce",
                "Daemon:".bright_black(),
                settings.poll_interval,
                settings.debounce
            );
        }

        Commands::Register { name } => {
            let mut links = load_links()?;
            let settings = ClientSettings::resolve(links.global())?;
            let client = api_client(&settings)?;
            let machine = sync::register_machine(&client, &mut links, name).await?;
            println!(
                "{} Registered {} {}",
                "✓".green(),
                machine.name.bright_cyan().bold(),
                format!("({})", machine.id).bright_black()
            );
        }

        Commands::Link { asset, path } => {
            let mut links = load_links()?;
            let (_, engine) = engine(&links)?;
            let (scope, entry) = engine.link(&mut links, &asset, path).await?;
            println!(
                "{} Linked {} -> {} {}",
                "✓".green(),
                entry.asset_slug.bright_cyan().bold(),
                entry.local_path.display(),
                format!("[{}]", scope).bright_black()
            );
            println!(
                "   Run {} to fetch it",
                format!("assetsync pull {}", entry.asset_slug).bright_white()
            );
        }

        Commands::Unlink { asset } => {
            let mut links = load_links()?;
            let (scope, entry) = sync::unlink(&mut links, &asset)?;
            println!(
                "{} Unlinked {} {}",
                "✓".green(),
                entry.asset_slug.bright_cyan(),
                format!("[{}]", scope).bright_black()
            );
        }

        Commands::Links => {
            let links = load_links()?;
            let entries = links.entries();
            if entries.is_empty() {
                println!("{}", "No linked assets.".yellow());
                println!("\n{}", "To link one:".bright_black());
                println!("  {}", "assetsync link <asset> [path]".bright_white());
                return Ok(());
            }

            println!("{}", "Linked Assets".cyan().bold());
            println!("{}", "═".repeat(80).bright_black());
            for (scope, entry) in &entries {
                let version = if entry.never_synced() {
                    "never synced".to_string()
                } else {
                    format!("v{}", entry.last_synced_version)
                };
                println!(
                    "\n{} {} {}",
                    "●".bright_green(),
                    entry.asset_slug.bright_cyan().bold(),
                    version.bright_black()
                );
                println!("   {} {}", "Path: ".bright_black(), entry.local_path.display());
                println!("   {} {}", "Store:".bright_black(), scope);
            }
            println!("\n{}", "─".repeat(80).bright_black());
            println!("{} links", entries.len().to_string().bright_white().bold());
        }

        Commands::Status => {
            let links = load_links()?;
            let (_, engine) = engine(&links)?;
            let statuses = engine.status(&links).await?;
            if statuses.is_empty() {
                println!("{}", "No linked assets.".yellow());
                return Ok(());
            }

            for status in statuses {
                let label = match &status.status {
                    LinkStatus::Action(action) if action.is_conflict() => {
                        action.to_string().yellow().bold()
                    }
                    LinkStatus::Action(action) => action.to_string().green(),
                    LinkStatus::NeverSynced => "never synced".bright_blue(),
                    LinkStatus::MissingLocal => "missing locally".bright_blue(),
                    LinkStatus::Bundle => "bundle (manual)".yellow(),
                    LinkStatus::NotInManifest => "not on server".red(),
                    LinkStatus::Unreadable { error } => format!("unreadable: {error}").red(),
                };
                println!(
                    "{:<32} {:<18} local {:<10} server {}",
                    status.entry.asset_slug.bright_cyan(),
                    label,
                    if status.entry.never_synced() {
                        "-"
                    } else {
                        status.entry.last_synced_version.as_str()
                    },
                    status.server_version.as_deref().unwrap_or("-")
                );
            }
        }

        Commands::Push { asset, force } => {
            let mut links = load_links()?;
            let (_, engine) = engine(&links)?;
            let summary = engine.push(&mut links, &PushOptions { asset, force }).await?;
            finish(summary)?;
        }

        Commands::Pull { asset, force } => {
            let mut links = load_links()?;
            let (_, engine) = engine(&links)?;
            let summary = engine
                .pull(&mut links, &PullOptions { asset, force }, &NoHook)
                .await?;
            finish(summary)?;
        }

        Commands::Sync => {
            let mut links = load_links()?;
            let (_, engine) = engine(&links)?;
            let summary = engine.sync(&mut links, &NoHook).await?;
            finish(summary)?;
        }

        Commands::Watch { interval, debounce } => {
            let links = load_links()?;
            let (settings, engine) = engine(&links)?;
            let options = DaemonOptions {
                poll_interval: interval
                    .map(|s| Duration::from_secs(s.max(1)))
                    .unwrap_or(settings.poll_interval),
                debounce: debounce
                    .map(Duration::from_millis)
                    .unwrap_or(settings.debounce),
            };

            println!(
                "{}",
                format!(
                    "✔ Watching {} linked assets (poll every {:?}, Ctrl+C to stop)",
                    links.entries().len(),
                    options.poll_interval
                )
                .cyan()
                .bold()
            );
            if let Some(dir) = &log_dir {
                println!("   {} {}", "Log:".bright_black(), dir.display());
            }

            Daemon::new(engine, links, options)
                .run(async {
                    tokio::signal::ctrl_c().await.ok();
                })
                .await?;
            println!("{}", "Stopped.".bright_black());
        }

        Commands::Serve {
            port,
            db,
            bootstrap_token,
            rate_limit,
        } => {
            let mut config = ServerConfig::from_env()?;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            if bootstrap_token.is_some() {
                config.bootstrap_token = bootstrap_token;
            }
            if let Some(limit) = rate_limit {
                config.rate_limit_per_minute = limit;
            }

            println!(
                "{}",
                format!("🌐 Starting version authority on port {}...", config.port)
                    .cyan()
                    .bold()
            );
            server::serve(&config).await?;
        }
    }

    Ok(())
}

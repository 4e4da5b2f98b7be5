//! GitCMS Administration CLI
//!
//! Operator tool for stuck locks and branch inspection.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use gitcms_core::{GitHost, GitStore, ObjectId, SiteMutex, StoreConfig};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gitcms-admin")]
#[command(author = "GitCMS Contributors")]
#[command(version = "0.1.0")]
#[command(about = "GitCMS site repository and lock administration")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = gitcms_core::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a configuration file with defaults
    Init {
        #[arg(long)]
        org: String,
        /// SQLite lock database shared with the servers
        #[arg(long)]
        lock_db: Option<PathBuf>,
    },

    /// Show who holds the lock of each site
    Status {
        #[arg(required = true)]
        sites: Vec<String>,
        /// Print lock records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove a site's lock regardless of its holder
    Unlock { site: String },

    /// Print the head commit and root tree of a site's branch
    Head {
        site: String,
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Force a site's branch back to an earlier commit
    Reset {
        site: String,
        commit: String,
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Print a file from a site's branch
    Cat {
        site: String,
        path: String,
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// List a directory of a site's branch
    Ls {
        site: String,
        #[arg(default_value = "")]
        dir: String,
        #[arg(short, long)]
        branch: Option<String>,
    },
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

/// Lock commands only make sense against a store shared with the servers
fn shared_mutex(config: &StoreConfig) -> Result<SiteMutex> {
    if config.lock_db_path.is_none() {
        bail!("lock_db_path is not configured; locks live inside each server process");
    }
    Ok(config.site_mutex()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config_path = cli.config;
    let load_config = || {
        StoreConfig::load_with_env(&config_path)
            .with_context(|| format!("Failed to load configuration from {:?}", config_path))
    };

    match cli.command {
        Commands::Init { org, lock_db } => {
            if config_path.exists() {
                bail!("{:?} already exists", config_path);
            }
            let config = StoreConfig {
                org,
                lock_db_path: lock_db,
                ..Default::default()
            };
            config.save(&config_path)?;
            println!("Wrote {:?}", config_path);
        }

        Commands::Status { sites, json } => {
            let mutex = shared_mutex(&load_config()?)?;
            let records = futures::future::join_all(sites.iter().map(|site| mutex.status(site))).await;
            for (site, record) in sites.iter().zip(records) {
                match (record?, json) {
                    (Some(record), true) => println!("{}", serde_json::to_string(&record)?),
                    (Some(record), false) => {
                        let expiry = record
                            .expires_at
                            .map(|t| format!("expires {}", t.to_rfc3339()))
                            .unwrap_or_else(|| "no expiry".to_string());
                        println!(
                            "{}: locked by {} since {} ({})",
                            site,
                            record.holder,
                            record.acquired_at.to_rfc3339(),
                            expiry
                        );
                    }
                    (None, true) => println!("{}", serde_json::json!({ "site": site, "locked": false })),
                    (None, false) => println!("{}: unlocked", site),
                }
            }
        }

        Commands::Unlock { site } => {
            shared_mutex(&load_config()?)?.unlock(&site).await?;
            println!("Unlocked {}", site);
        }

        Commands::Head { site, branch } => {
            let store = GitStore::from_config(&load_config()?)?;
            let scope = store.reader(&site, branch.as_deref()).scope().clone();
            let head = store.host().get_repo_state(&scope).await?;
            println!("{} commit {} tree {}", scope, head.commit, head.tree);
        }

        Commands::Reset { site, commit, branch } => {
            let target: ObjectId = commit
                .parse()
                .with_context(|| format!("{:?} is not a commit id", commit))?;
            let store = GitStore::from_config(&load_config()?)?;
            let host = store.host().clone();
            let previous = store
                .lock_and_run(&site, branch.as_deref(), |session| async move {
                    let head = session.head().await?;
                    host.update_ref(session.scope(), target, true).await?;
                    Ok(head.commit)
                })
                .await?;
            println!("Moved {} from {} to {}", site, previous, target);
        }

        Commands::Cat { site, path, branch } => {
            let store = GitStore::from_config(&load_config()?)?;
            let file = store.reader(&site, branch.as_deref()).read(path.as_str()).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&file.content)?;
            stdout.flush()?;
        }

        Commands::Ls { site, dir, branch } => {
            let store = GitStore::from_config(&load_config()?)?;
            for entry in store.reader(&site, branch.as_deref()).list_directory(&dir).await? {
                println!("{} {} {}", entry.kind.as_str(), entry.sha.short(), entry.name);
            }
        }
    }

    Ok(())
}

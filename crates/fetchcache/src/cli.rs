//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use url::Url;

use fetchcache_service::caching;
use fetchcache_service::config::Config;
use fetchcache_service::fetch::FetchService;
use fetchcache_service::metrics;

use crate::logging;

/// fetchcache commands.
#[derive(Subcommand)]
enum Command {
    /// Download one or more URLs through the cache.
    Fetch {
        /// The URLs to download.
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,
    },

    /// Clean stale entries from the local cache.
    Cleanup {
        /// Remove all entries regardless of expiry.
        #[arg(long)]
        force: bool,

        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "fetchcache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    // SAFETY: We did not spawn any threads at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(statsd) = config.metrics.statsd.clone() {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags);
    }

    match cli.command {
        Command::Fetch { urls } => fetch(config, urls),
        Command::Cleanup { force, dry_run } => {
            let stats = caching::cleanup(&config, force, dry_run)
                .context("failed to clean up the cache")?;
            println!(
                "expunged {} files ({} bytes), retained {} files ({} bytes)",
                stats.expunged_files,
                stats.expunged_bytes,
                stats.retained_files,
                stats.retained_bytes,
            );
            Ok(())
        }
    }
}

/// Runs the fetch command on a fresh runtime.
fn fetch(config: Config, urls: Vec<String>) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to create runtime")?;

    runtime.block_on(async move {
        let service =
            FetchService::new(&config).context("failed to initialize the download cache")?;

        let mut failures = 0;
        for raw in urls {
            let url: Url = raw.parse().with_context(|| format!("invalid URL: {raw}"))?;

            let handle = service.download(url.clone());
            let mut progress = handle.progress();
            let reporter = tokio::spawn(async move {
                use tokio::sync::broadcast::error::RecvError;
                loop {
                    match progress.recv().await {
                        Ok(update) => tracing::debug!(
                            bytes = update.bytes_transferred,
                            total = ?update.total_bytes,
                            "Transfer progress",
                        ),
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    }
                }
            });

            match handle.wait().await {
                Ok(entry) => {
                    let origin = if entry.just_downloaded() {
                        "downloaded"
                    } else {
                        "cached"
                    };
                    match entry.path() {
                        Some(path) => println!("{origin}\t{}", path.display()),
                        None => println!("{origin}\t{url}"),
                    }
                }
                Err(error) => {
                    tracing::error!(error = %error, url = %url, "Download failed");
                    failures += 1;
                }
            }

            reporter.await.ok();
        }

        if failures > 0 {
            anyhow::bail!("{failures} download(s) failed");
        }
        Ok(())
    })
}

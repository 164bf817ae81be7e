//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use idecache_service::caching;
use idecache_service::config::Config;
use idecache_service::makecache::BuildFlagsResolver;
use idecache_service::metrics;
use idecache_service::process::{ProcessRunner, TokioProcessRunner};
use idecache_service::service::Service;
use idecache_service::tags::{MiningState, TagIndexService};

use crate::logging;
use crate::output;

/// idecache commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Mine the tags files of a project and list the loaded indices.
    Tags {
        /// The project's working directory.
        project: PathBuf,
        /// Print the definitions of this symbol. May be given multiple times.
        #[arg(long, value_name = "NAME")]
        lookup: Vec<String>,
    },

    /// Print the compiler flags of source files in a Makefile project.
    Flags {
        /// The project's Makefile.
        makefile: PathBuf,
        /// Source files, relative to the Makefile's directory or absolute.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print the make targets that build source files.
    Targets {
        /// The project's Makefile.
        makefile: PathBuf,
        /// Source files, relative to the Makefile's directory or absolute.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Remove stale temporary makecache files.
    Cleanup {
        /// Only list the files that would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(bin_name = "idecache", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
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

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: no other threads exist yet, the runtime is started below.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        if let Err(e) = metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        ) {
            tracing::warn!(error = &e as &dyn std::error::Error, "Failed to configure statsd");
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("idecache-worker")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(run(config, cli.command))
}

async fn run(config: Config, command: Command) -> Result<()> {
    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);

    match command {
        Command::Tags { project, lookup } => {
            let project = std::path::absolute(&project)
                .with_context(|| format!("invalid project directory {}", project.display()))?;
            let service = TagIndexService::new(&config, project, runner);
            service.start();
            let state = service.wait_until_steady().await;
            service.stop();
            if state != MiningState::Steady {
                anyhow::bail!("mining stopped before it finished");
            }

            let mut indexes = service.indexes();
            indexes.sort_by(|a, b| a.file().cmp(b.file()));
            output::print_indexes(&indexes);
            for name in &lookup {
                output::print_lookup(name, &indexes);
            }
        }
        Command::Flags { makefile, files } => {
            let resolver = BuildFlagsResolver::new(&config, makefile, runner);
            resolver
                .wait_ready()
                .await
                .context("failed to build the makecache")?;
            let mut results = Vec::with_capacity(files.len());
            for file in files {
                let flags = resolver.get_flags(&file).await;
                results.push((file, flags));
            }
            output::print_flags(&results);
        }
        Command::Targets { makefile, files } => {
            let resolver = BuildFlagsResolver::new(&config, makefile, runner);
            resolver
                .wait_ready()
                .await
                .context("failed to build the makecache")?;
            let mut results = Vec::with_capacity(files.len());
            for file in files {
                let targets = resolver.get_targets(&file).await;
                results.push((file, targets));
            }
            output::print_targets(&results);
        }
        Command::Cleanup { dry_run } => {
            let count = caching::cleanup(&config, dry_run).context("failed to clean up caches")?;
            output::print_cleanup(count, dry_run);
        }
    }

    Ok(())
}

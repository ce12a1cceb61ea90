//! # rapport CLI
//!
//! ## Usage
//!
//! ```bash
//! rapport --config ./config/rapport.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rapport init` | Create the SQLite database and run schema migrations |
//! | `rapport stats` | Coverage of every derived field |
//! | `rapport comms summarize` | Aggregate communication threads per contact |
//! | `rapport embed` | Build profile and interests embeddings |
//! | `rapport tag profile` | Full intelligence profile (variant A) |
//! | `rapport tag overlap` | Institutional overlap (variant B) |
//! | `rapport tag closeness` | Communication closeness (variant C) |
//! | `rapport search "<query>"` | Interests match or hybrid search |
//! | `rapport serve` | HTTP RPC server for retrieval |
//!
//! Batch jobs print a summary on stdout and exit with status 1 when the
//! error rate exceeds `tagger.max_error_rate`.

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rapport::job::{JobOptions, RunReport};
use rapport::progress::ProgressMode;
use rapport::tagger::TagJob;
use rapport::{comms, config, embed_cmd, migrate, search, server, stats, tagger};

/// rapport: relationship intelligence over a contact database.
#[derive(Parser)]
#[command(
    name = "rapport",
    about = "Relationship intelligence: comms summaries, embeddings, structured tagging and hybrid search",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rapport.toml")]
    config: PathBuf,

    /// Log as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    /// Progress output: off, human or json. Defaults to human on a TTY.
    #[arg(long, global = true)]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Show how many contacts carry each derived field.
    Stats,

    /// Communication aggregator.
    Comms {
        #[command(subcommand)]
        action: CommsAction,
    },

    /// Build profile and interests embeddings.
    Embed {
        #[command(flatten)]
        job: JobArgs,

        /// Texts per embedding request (overrides `embedding.batch_size`).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Count contacts that would be embedded without calling the service.
        #[arg(long)]
        dry_run: bool,
    },

    /// Structured intelligence tagging.
    Tag {
        #[command(subcommand)]
        variant: TagVariant,
    },

    /// Search contacts.
    Search {
        query: String,

        /// `semantic` (interests vectors) or `hybrid` (profile vectors + keywords, RRF).
        #[arg(long, default_value = "hybrid")]
        mode: String,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        proximity_min: Option<i64>,

        #[arg(long)]
        capacity_min: Option<i64>,
    },

    /// Start the HTTP RPC server.
    Serve,
}

#[derive(Subcommand)]
enum CommsAction {
    /// Recompute the comms summary of every contact with threads.
    Summarize {
        #[command(flatten)]
        job: JobArgs,
    },
}

#[derive(Subcommand)]
enum TagVariant {
    /// Full intelligence profile against the anchor profile.
    Profile {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Shared institutions, for contacts with overlap signals.
    Overlap {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Closeness and momentum from the comms summary.
    Closeness {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long)]
        workers: Option<usize>,
    },
}

/// Flags shared by every batch job.
#[derive(Args, Clone)]
struct JobArgs {
    /// Recompute contacts that already have a result.
    #[arg(long)]
    force: bool,

    /// Preview run: stop after this many contacts.
    #[arg(long)]
    test: Option<usize>,

    /// Contacts read per page.
    #[arg(long)]
    batch: Option<usize>,

    /// First contact id to consider.
    #[arg(long)]
    start_from: Option<i64>,

    /// Process this contact only.
    #[arg(long)]
    contact_id: Option<i64>,
}

impl JobArgs {
    fn options(&self, page_size: usize, workers: Option<usize>, progress: ProgressMode) -> JobOptions {
        JobOptions {
            limit: self.test,
            force: self.force,
            workers,
            page_size: self.batch.unwrap_or(page_size).max(1),
            start_from: self.start_from,
            contact_id: self.contact_id,
            progress,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn finish(report: RunReport) {
    if !report.succeeded() {
        eprintln!(
            "{}: error rate above {:.0}%",
            report.job,
            report.max_error_rate * 100.0
        );
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let progress = match cli.progress.as_deref() {
        None => ProgressMode::default_for_tty(),
        Some(raw) => match ProgressMode::parse(raw) {
            Some(mode) => mode,
            None => bail!("Unknown progress mode: {}. Use off, human, or json.", raw),
        },
    };

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Comms {
            action: CommsAction::Summarize { job },
        } => {
            let opts = job.options(cfg.embedding.page_size, None, progress);
            finish(comms::cmd_summarize(&cfg, &opts).await?);
        }
        Commands::Embed {
            job,
            batch_size,
            dry_run,
        } => {
            let mut cfg = cfg;
            if let Some(n) = batch_size {
                cfg.embedding.batch_size = n.max(1);
            }
            let opts = job.options(cfg.embedding.page_size, None, progress);
            finish(embed_cmd::cmd_embed(&cfg, &opts, dry_run).await?);
        }
        Commands::Tag { variant } => {
            let (which, job, workers) = match variant {
                TagVariant::Profile { job, workers } => (TagJob::Profile, job, workers),
                TagVariant::Overlap { job, workers } => (TagJob::Overlap, job, workers),
                TagVariant::Closeness { job, workers } => (TagJob::Closeness, job, workers),
            };
            let opts = job.options(1000, workers, progress);
            finish(tagger::cmd_tag(&cfg, which, &opts).await?);
        }
        Commands::Search {
            query,
            mode,
            limit,
            proximity_min,
            capacity_min,
        } => {
            search::run_search(&cfg, &query, &mode, limit, proximity_min, capacity_min).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

//! # Fusion Harness CLI (`fuse`)
//!
//! The `fuse` binary drives the retrieval + fusion engine: database setup,
//! passage ingestion, answering questions, running A/B experiments over
//! fusion strategies, and retrieval evaluation.
//!
//! ## Usage
//!
//! ```bash
//! fuse --config ./config/fuse.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fuse init` | Create the SQLite database and run schema migrations |
//! | `fuse ingest <jsonl>` | Embed and index passages, then rebuild once |
//! | `fuse ask "<question>"` | Retrieve, fan out to providers, fuse |
//! | `fuse experiment create <toml>` | Register an experiment in DRAFT |
//! | `fuse experiment start/stop <id>` | Lifecycle transitions |
//! | `fuse experiment list` | All experiments and their variants |
//! | `fuse experiment analyze <id>` | Per-variant statistics against control |
//! | `fuse feedback` | Append a provider reward |
//! | `fuse learn` | Run the aggregation job (weights + early stopping) |
//! | `fuse eval <jsonl>` | Precision@k, Recall@k, MRR, NDCG@k |
//! | `fuse stats` | Row counts and metric summaries |
//!
//! ## Logging
//!
//! Diagnostics go to stderr, filtered by `FUSE_LOG` (default `info`).
//! `--log-json` switches to JSON lines.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use fusion_harness::{
    ask, config, db, eval, experiment_cmd, feedback_cmd, ingest, logging, migrate, stats,
};

/// Fusion Harness CLI: retrieval-augmented answers fused from multiple
/// language-model providers, with built-in A/B experiments.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/fuse.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "fuse",
    about = "Fusion Harness: multi-provider RAG with fusion strategies and A/B experiments",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fuse.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Ingest passages from a JSONL file.
    ///
    /// Each line is `{"text": "...", "metadata": {...}}`. All passages are
    /// staged and published with a single index rebuild.
    Ingest {
        /// Path to the JSONL file.
        path: PathBuf,
    },

    /// Answer a question.
    Ask {
        /// The question.
        question: String,

        /// Session id used for experiment assignment.
        #[arg(long, default_value = "cli")]
        session: String,

        /// Route through this experiment instead of the first running one.
        #[arg(long)]
        experiment: Option<String>,

        /// Print the full answer as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Manage A/B experiments over fusion strategies.
    Experiment {
        #[command(subcommand)]
        action: ExperimentAction,
    },

    /// Record a reward for a provider's answer.
    Feedback {
        #[arg(long)]
        session: String,

        #[arg(long)]
        provider: String,

        /// Reward in [0.0, 1.0].
        #[arg(long)]
        reward: f64,
    },

    /// Run the aggregation job: learn provider weights from feedback and
    /// apply early-stopping rules.
    Learn {
        /// Keep running on `[learning].interval_secs`.
        #[arg(long)]
        watch: bool,
    },

    /// Evaluate retrieval quality against labelled queries (JSONL).
    Eval {
        path: PathBuf,

        #[arg(long, default_value_t = 5)]
        k: usize,
    },

    /// Show database and metric statistics.
    Stats,
}

#[derive(Subcommand)]
enum ExperimentAction {
    /// Create an experiment from a TOML definition.
    Create { path: PathBuf },
    /// DRAFT → RUNNING. Rejected unless weights sum to 1.0.
    Start { id: String },
    /// RUNNING → STOPPED.
    Stop { id: String },
    /// List experiments.
    List,
    /// Per-variant report against the control variant.
    Analyze {
        id: String,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.log_json);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path } => {
            ingest::run_ingest(&cfg, &path).await?;
        }
        Commands::Ask {
            question,
            session,
            experiment,
            json,
        } => {
            ask::run_ask(&cfg, &question, &session, experiment, json).await?;
        }
        Commands::Experiment { action } => match action {
            ExperimentAction::Create { path } => experiment_cmd::run_create(&cfg, &path).await?,
            ExperimentAction::Start { id } => experiment_cmd::run_start(&cfg, &id).await?,
            ExperimentAction::Stop { id } => experiment_cmd::run_stop(&cfg, &id).await?,
            ExperimentAction::List => experiment_cmd::run_list(&cfg).await?,
            ExperimentAction::Analyze { id, json } => {
                experiment_cmd::run_analyze(&cfg, &id, json).await?
            }
        },
        Commands::Feedback {
            session,
            provider,
            reward,
        } => {
            feedback_cmd::run_feedback(&cfg, &session, &provider, reward).await?;
        }
        Commands::Learn { watch } => {
            feedback_cmd::run_learn(&cfg, watch).await?;
        }
        Commands::Eval { path, k } => {
            eval::run_eval(&cfg, &path, k).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

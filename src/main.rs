//! # Dossier CLI (`dossier`)
//!
//! The `dossier` binary initializes the database, runs the HTTP service,
//! and drives every lifecycle operation from the terminal.
//!
//! ## Usage
//!
//! ```bash
//! dossier --config ./config/dossier.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dossier init` | Create the SQLite database and run schema migrations |
//! | `dossier serve` | Start the HTTP service with the outbox worker and sweeper |
//! | `dossier create --owner <id>` | Create an empty dossier |
//! | `dossier list` | List dossiers with readiness |
//! | `dossier show <id>` | Show a dossier and its sources |
//! | `dossier delete <id>` | Delete a dossier and its sources |
//! | `dossier upload --dossier <id> ... <files>` | Upload files as sources |
//! | `dossier add-text --dossier <id> ...` | Add pasted text as a source |
//! | `dossier add-urls --dossier <id> ... <urls>` | Add website sources |
//! | `dossier callback <id> <type> <status>` | Apply a pipeline status report |
//! | `dossier analysis <id>` | Print or start the checklist analysis |
//! | `dossier chat <id> "<message>"` | Ask the chat pipeline about a dossier |
//! | `dossier outbox list\|retry\|drain` | Inspect and deliver outbound jobs |
//! | `dossier sweep` | Fail sources stuck in `processing` |
//!
//! ## Examples
//!
//! ```bash
//! dossier init
//! dossier create --owner u-1 --title "Leilão Rua das Flores"
//! dossier upload --dossier <id> --owner u-1 --email a@b.c --document-type edital edital.pdf
//! dossier callback <id> edital completed
//! dossier serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use dossier_core::models::{DocumentType, JobState};
use dossier_intake::{commands, config, migrate, server};

/// Dossier Intake CLI: document intake and generation-status lifecycle
/// for auction dossiers.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dossier.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dossier",
    about = "Dossier Intake: document intake and generation-status lifecycle for auction dossiers",
    version,
    long_about = "Dossier Intake registers uploaded files, pasted text and links as sources of a \
    dossier, tracks each source through pending, uploading, processing and a terminal state, \
    fires one-time metadata generation on the first processable source, and accepts status \
    callbacks from external processing pipelines."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/dossier.toml`.
    #[arg(long, global = true, default_value = "./config/dossier.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Running it
    /// more than once is safe.
    Init,

    /// Start the HTTP service.
    ///
    /// Binds to `[server].bind` and runs the outbox worker and the
    /// stuck-processing sweeper alongside it.
    Serve,

    /// Create an empty dossier.
    Create {
        /// Owner (user) id.
        #[arg(long)]
        owner: String,
        /// Title; defaults to "Untitled dossier".
        #[arg(long)]
        title: Option<String>,
    },

    /// List dossiers, newest first.
    List {
        /// Only dossiers of this owner.
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show a dossier with its sources and readiness.
    Show {
        /// Dossier id.
        id: String,
    },

    /// Delete a dossier together with its sources and analysis results.
    Delete {
        /// Dossier id.
        id: String,
    },

    /// Upload local files as sources of a dossier.
    ///
    /// Waits for every transfer to finish, then delivers queued document
    /// notifications once.
    Upload {
        #[arg(long)]
        dossier: String,
        #[arg(long)]
        owner: String,
        /// Contact address forwarded to the notifier.
        #[arg(long)]
        email: String,
        /// Legal role of the document (`processo`, `edital`, `matricula`).
        /// Only valid with a single file.
        #[arg(long)]
        document_type: Option<DocumentType>,
        /// Request write targets from a running `dossier serve` instead of
        /// signing them locally.
        #[arg(long)]
        gateway: Option<String>,
        /// Files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Add pasted text as a source.
    AddText {
        #[arg(long)]
        dossier: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        content: String,
    },

    /// Add one website source per URL.
    AddUrls {
        #[arg(long)]
        dossier: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        email: String,
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Apply a pipeline status report, as the callback endpoint would.
    Callback {
        /// Dossier id.
        dossier: String,
        /// `processo`, `edital` or `matricula`.
        document_type: String,
        /// `processing`, `completed` or `failed`.
        status: String,
    },

    /// Print the checklist analysis results of a dossier.
    Analysis {
        /// Dossier id.
        dossier: String,
        /// Trigger the analysis pipeline instead of printing results.
        #[arg(long)]
        start: bool,
    },

    /// Send a chat message about a dossier and print the reply.
    Chat {
        /// Dossier id.
        dossier: String,
        message: String,
    },

    /// Inspect and deliver outbound jobs.
    Outbox {
        #[command(subcommand)]
        action: OutboxAction,
    },

    /// Fail sources that have been `processing` longer than the timeout.
    Sweep,
}

/// Outbox subcommands.
#[derive(Subcommand)]
enum OutboxAction {
    /// List jobs, newest first.
    List {
        /// Only jobs in this state (`pending`, `delivered`, `dead`).
        #[arg(long)]
        state: Option<JobState>,
    },
    /// Put a job back in the queue with a fresh attempt budget.
    Retry {
        /// Job id.
        id: String,
    },
    /// Deliver every due job once.
    Drain,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dossier_intake=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Create { owner, title } => {
            commands::run_create(&cfg, &owner, title.as_deref()).await?;
        }
        Commands::List { owner } => {
            commands::run_list(&cfg, owner.as_deref()).await?;
        }
        Commands::Show { id } => {
            commands::run_show(&cfg, &id).await?;
        }
        Commands::Delete { id } => {
            commands::run_delete(&cfg, &id).await?;
        }
        Commands::Upload {
            dossier,
            owner,
            email,
            document_type,
            gateway,
            files,
        } => {
            commands::run_upload(
                &cfg,
                &dossier,
                &owner,
                &email,
                document_type,
                gateway.as_deref(),
                &files,
            )
            .await?;
        }
        Commands::AddText {
            dossier,
            title,
            content,
        } => {
            commands::run_add_text(&cfg, &dossier, &title, &content).await?;
        }
        Commands::AddUrls {
            dossier,
            owner,
            email,
            urls,
        } => {
            commands::run_add_urls(&cfg, &dossier, &owner, &email, &urls).await?;
        }
        Commands::Callback {
            dossier,
            document_type,
            status,
        } => {
            commands::run_callback(&cfg, &dossier, &document_type, &status).await?;
        }
        Commands::Analysis { dossier, start } => {
            commands::run_analysis(&cfg, &dossier, start).await?;
        }
        Commands::Chat { dossier, message } => {
            commands::run_chat(&cfg, &dossier, &message).await?;
        }
        Commands::Outbox { action } => match action {
            OutboxAction::List { state } => {
                commands::run_outbox_list(&cfg, state).await?;
            }
            OutboxAction::Retry { id } => {
                commands::run_outbox_retry(&cfg, &id).await?;
            }
            OutboxAction::Drain => {
                commands::run_outbox_drain(&cfg).await?;
            }
        },
        Commands::Sweep => {
            commands::run_sweep(&cfg).await?;
        }
    }

    Ok(())
}

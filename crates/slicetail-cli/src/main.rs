use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

mod runner;

#[derive(Parser)]
#[command(name = "slicetail")]
#[command(about = "Tail time-ordered events from a relational journal by slice")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that touches the journal.
#[derive(Args, Clone)]
struct JournalArgs {
    /// Postgres connection string
    #[arg(long)]
    url: String,

    /// Journal table name
    #[arg(long, default_value = "event_journal")]
    table: String,

    /// Entity type to read
    #[arg(long, default_value = "Account")]
    entity_type: String,

    /// Lowest slice of the range (inclusive)
    #[arg(long, default_value = "0")]
    min_slice: u16,

    /// Highest slice of the range (inclusive)
    #[arg(long, default_value = "1023")]
    max_slice: u16,

    /// Target rows per query
    #[arg(long, default_value = "1000")]
    buffer_size: usize,
}

#[derive(Args, Clone)]
struct OffsetArgs {
    /// SQLite file for resuming from and saving offsets
    #[arg(long)]
    state: Option<PathBuf>,

    /// Projection id the offset is stored under
    #[arg(long, default_value = "slicetail")]
    projection: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the journal table and its index
    Setup {
        #[command(flatten)]
        journal: JournalArgs,
    },

    /// Read everything committed so far, print it, and exit
    Dump {
        #[command(flatten)]
        journal: JournalArgs,

        #[command(flatten)]
        offsets: OffsetArgs,
    },

    /// Follow the journal continuously
    Tail {
        #[command(flatten)]
        journal: JournalArgs,

        #[command(flatten)]
        offsets: OffsetArgs,

        /// Upper bound on the idle sleep between queries, in milliseconds
        #[arg(long, default_value = "3000")]
        refresh_interval_ms: u64,

        /// Disable backtracking re-reads
        #[arg(long)]
        no_backtracking: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("slicetail=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Setup { journal } => runner::run_setup(journal).await,
        Commands::Dump { journal, offsets } => runner::run_dump(journal, offsets).await,
        Commands::Tail {
            journal,
            offsets,
            refresh_interval_ms,
            no_backtracking,
        } => {
            runner::run_tail(
                journal,
                offsets,
                Duration::from_millis(refresh_interval_ms),
                !no_backtracking,
            )
            .await
        }
    }
}

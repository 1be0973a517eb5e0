//! tallyd - election tally backend operator tool
//!
//! Thin command-line front over the backend library: configure an election,
//! import cast vote record reports, and inspect counts. The production
//! transport layer is external; this binary exists for operators and
//! end-to-end smoke testing.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tally_backend::db::elections;
use tally_backend::{db, import, tabulation, write_ins, AppState};
use tally_common::tabulation::{Filter, GroupBy};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tallyd", about = "Election tally backend", version)]
struct Cli {
    /// Data directory (defaults to TALLY_DATA_DIR or the platform data dir)
    #[arg(long, env = "TALLY_DATA_DIR")]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and store an election definition and make it current
    Configure {
        /// Path to the election definition JSON
        election: PathBuf,
    },
    /// Import a cast vote record report bundle
    Import {
        /// Path to the report directory
        report: PathBuf,
    },
    /// Delete all imported cast vote record files
    Clear,
    /// List imported cast vote record files
    Files,
    /// Print card counts, optionally grouped
    CardCounts {
        #[arg(long)]
        by_precinct: bool,
        #[arg(long)]
        by_ballot_style: bool,
        #[arg(long)]
        by_voting_method: bool,
        #[arg(long)]
        by_batch: bool,
        #[arg(long)]
        by_scanner: bool,
        #[arg(long)]
        by_party: bool,
    },
    /// Print the write-in adjudication queue
    Queue {
        /// Restrict to one contest
        #[arg(long)]
        contest: Option<String>,
    },
    /// Print election, file mode, and record counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let data_dir = tally_common::config::resolve_data_dir(cli.data_dir.as_deref())
        .context("failed to resolve data directory")?;
    let db_path = data_dir.join("tally.db");
    let pool = db::init_database(&db_path)
        .await
        .context("failed to open database")?;
    let app = AppState::new(pool);

    match cli.command {
        Command::Configure { election } => {
            let election_json = std::fs::read_to_string(&election)
                .with_context(|| format!("failed to read {}", election.display()))?;
            let record = elections::configure(&app, &election_json).await?;
            println!("Configured election: {} ({})", record.election.title, record.id);
        }
        Command::Import { report } => {
            let summary = import::import_cast_vote_record_report(&app, &report).await?;
            info!(
                newly_added = summary.newly_added,
                already_present = summary.already_present,
                "Import complete"
            );
            println!(
                "Imported {} ({} new, {} already present, mode {})",
                summary.filename, summary.newly_added, summary.already_present, summary.file_mode
            );
        }
        Command::Clear => {
            import::clear_cast_vote_record_files(&app).await?;
            println!("Cleared all cast vote record files");
        }
        Command::Files => {
            for file in import::get_cast_vote_record_files(&app).await? {
                println!(
                    "{}  {}  {} records  mode {}",
                    file.exported_at.to_rfc3339(),
                    file.filename,
                    file.cvr_count,
                    file.file_mode
                );
            }
        }
        Command::CardCounts {
            by_precinct,
            by_ballot_style,
            by_voting_method,
            by_batch,
            by_scanner,
            by_party,
        } => {
            let group_by = GroupBy {
                by_ballot_style,
                by_batch,
                by_party,
                by_precinct,
                by_scanner,
                by_voting_method,
            };
            let counts = tabulation::get_card_counts(&app, &Filter::default(), group_by).await?;
            for entry in counts {
                println!(
                    "{}  bmd {}  hmpb {:?}  manual {}",
                    serde_json::to_string(&entry.group)?,
                    entry.card_counts.bmd,
                    entry.card_counts.hmpb,
                    entry.card_counts.manual
                );
            }
        }
        Command::Queue { contest } => {
            let queue =
                write_ins::get_write_in_adjudication_queue(&app, contest.as_deref()).await?;
            for (position, write_in_id) in queue.iter().enumerate() {
                println!("{:>4}  {}", position + 1, write_in_id);
            }
            for metadata in
                write_ins::get_write_in_adjudication_queue_metadata(&app, contest.as_deref())
                    .await?
            {
                println!(
                    "{}: {} total, {} pending",
                    metadata.contest_id, metadata.total, metadata.pending
                );
            }
        }
        Command::Status => {
            match elections::get_current_election(&app.db).await? {
                Some(record) => {
                    println!("Election: {} ({})", record.election.title, record.id);
                    let mode = import::get_cast_vote_record_file_mode(&app).await?;
                    match mode {
                        Some(mode) => println!("File mode: {mode}"),
                        None => println!("File mode: unlocked"),
                    }
                    println!(
                        "Cast vote records: {}",
                        import::get_cast_vote_record_count(&app).await?
                    );
                }
                None => println!("No election configured"),
            }
        }
    }

    Ok(())
}

//! # Tally Viewer CLI
//!
//! Command-line tool for inspecting the recorder's durable tallies.
//!
//! Usage:
//!   tally_viewer all [--format table|summary|json]
//!   tally_viewer today
//!   tally_viewer month
//!   tally_viewer pending
//!   tally_viewer stats

use chrono::Local;
use clap::{Parser, Subcommand};
use recorder::storage::{EventCache, TallyPeriod, TallyRow, TallyStore, EVENT_CACHE_DB_NAME, TALLY_DB_NAME};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tally_viewer")]
#[command(about = "Inspect event recorder tallies", long_about = None)]
struct Cli {
    /// Persistent cache directory of the daemon
    #[arg(short, long, default_value = "/var/cache/event-recorder")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show every stored tally row
    All {
        /// Output format: table, summary, json
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show today's day bucket
    Today {
        /// Output format: table, summary, json
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show the current month bucket
    Month {
        /// Output format: table, summary, json
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show rows from closed periods that the next upload will carry
    Pending,

    /// Show aggregate statistics
    Stats,
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();

    let store = TallyStore::open(cli.dir.join(TALLY_DB_NAME))?;
    let today = Local::now().date_naive();

    match cli.command {
        Commands::All { format } => {
            let rows = store.read_all()?;
            println!("📋 {} tally rows:\n", rows.len());
            print_rows(&rows, &format)?;
        }

        Commands::Today { format } => {
            let rows = store.read_bucket(TallyPeriod::Day, today)?;
            println!("📅 Day {}:\n", TallyPeriod::Day.bucket_key(today));
            print_rows(&rows, &format)?;
        }

        Commands::Month { format } => {
            let rows = store.read_bucket(TallyPeriod::Month, today)?;
            println!("🗓  Month {}:\n", TallyPeriod::Month.bucket_key(today));
            print_rows(&rows, &format)?;
        }

        Commands::Pending => {
            let mut rows = store.rows_before(TallyPeriod::Day, today)?;
            rows.extend(store.rows_before(TallyPeriod::Month, today)?);
            println!("📤 {} rows ready for upload:\n", rows.len());
            print_rows(&rows, "table")?;
        }

        Commands::Stats => {
            let rows = store.read_all()?;
            let cache = EventCache::open(cli.dir.join(EVENT_CACHE_DB_NAME), u64::MAX)?;

            let mut per_period: BTreeMap<&'static str, (usize, u64)> = BTreeMap::new();
            for row in &rows {
                let label = row.period().map(|p| p.as_str()).unwrap_or("unknown");
                let entry = per_period.entry(label).or_insert((0, 0));
                entry.0 += 1;
                entry.1 += row.counter as u64;
            }

            println!("📊 Tally Statistics\n");
            println!("Total Rows:      {}", rows.len());
            for (label, (count, total)) in &per_period {
                println!("{:<16} {} rows, {} total", format!("{}:", label), count, total);
            }
            println!("Pending Events:  {}", cache.len()?);
        }
    }

    Ok(())
}

fn print_rows(rows: &[TallyRow], format: &str) -> Result<(), String> {
    match format {
        "json" => {
            let text = serde_json::to_string_pretty(rows)
                .map_err(|e| format!("Failed to serialize rows: {}", e))?;
            println!("{}", text);
        }
        "summary" => {
            let mut totals: BTreeMap<String, u64> = BTreeMap::new();
            for row in rows {
                *totals.entry(row.event_id.to_string()).or_insert(0) += row.counter as u64;
            }
            for (event_id, total) in totals {
                println!("{} | {}", event_id, total);
            }
        }
        _ => {
            for row in rows {
                println!(
                    "{} | {:<10} | uid {:<6} | {:>10} | {}",
                    row.event_id,
                    row.bucket_key,
                    row.unix_user_id,
                    row.counter,
                    match &row.payload {
                        Some(value) => format!("{:?}", value),
                        None => "-".to_string(),
                    }
                );
            }
        }
    }
    Ok(())
}

// System status display — DB stats, prospect pipeline counts, recent runs.

use anyhow::Result;
use colored::Colorize;
use std::sync::Arc;

use crate::db::models::ProspectStatus;
use crate::db::Database;
use crate::output::terminal;

/// Display system status to the terminal.
///
/// `db_display` is the SQLite file path or a redacted Postgres URL; file size
/// is only shown for the former. The caller has already opened the database.
pub async fn show(db: &Arc<dyn Database>, db_display: &str, is_sqlite: bool) -> Result<()> {
    if is_sqlite {
        let file_size = std::fs::metadata(db_display)
            .map(|m| format_bytes(m.len()))
            .unwrap_or_else(|_| "unknown".to_string());
        println!("Database: {} ({})", db_display, file_size);
    } else {
        println!("Database: {}", db_display);
    }

    let counts = db.count_prospects_by_status().await?;
    let count_of = |status: ProspectStatus| {
        counts
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    };
    println!(
        "Prospects: {} pending, {} approved, {} rejected, {} converted",
        count_of(ProspectStatus::Pending),
        count_of(ProspectStatus::Approved),
        count_of(ProspectStatus::Rejected),
        count_of(ProspectStatus::Converted),
    );
    println!("Canonical profiles: {}", db.count_profiles().await?);

    let conflicts = db.list_conflicts(100).await?;
    if !conflicts.is_empty() {
        println!(
            "Dedup conflicts: {} awaiting review (see `prospector conflicts`)",
            conflicts.len().to_string().yellow()
        );
    }

    let runs = db.list_runs(5).await?;
    if runs.is_empty() {
        println!("Recent runs: none yet");
        println!("  Run `prospector run --country CZ --keyword fashion` to start one");
    } else {
        println!("Recent runs:");
        terminal::display_run_table(&runs);
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

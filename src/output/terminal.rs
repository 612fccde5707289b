// Colored terminal output for runs, prospects, profiles and conflicts.
//
// This module handles all terminal-specific formatting: colors, tables,
// progress indicators. The main.rs command handlers delegate here.

use colored::Colorize;

use crate::db::models::{
    AttemptStatus, CanonicalProfile, DedupConflict, InfluencerProspect, ProspectStatus,
    ScrapingAttempt, ScrapingRun,
};
use crate::pipeline::RunSnapshot;

/// Display a compact table of runs, newest first.
pub fn display_run_table(runs: &[ScrapingRun]) {
    println!(
        "  {:>5}  {:<10} {:<10} {:>6} {:>10}  {}",
        "Run".dimmed(),
        "Type".dimmed(),
        "Status".dimmed(),
        "Found".dimmed(),
        "Processed".dimmed(),
        "Started".dimmed(),
    );
    for run in runs {
        println!(
            "  {:>5}  {:<10} {:<10} {:>6} {:>10}  {}",
            run.id,
            run.run_type.as_str(),
            colorize_run_status(run.display_status()),
            run.total_found,
            run.total_processed,
            run.started_at.format("%Y-%m-%d %H:%M"),
        );
    }
}

/// Display one run with its errors and most recent attempts.
pub fn display_run_snapshot(snapshot: &RunSnapshot) {
    let run = &snapshot.run;
    println!(
        "\n{}",
        format!("=== Run #{} ({}) ===", run.id, run.run_type).bold()
    );
    println!("  Status:     {}", colorize_run_status(run.display_status()));
    println!("  Found:      {}", run.total_found);
    println!("  Processed:  {}", run.total_processed);
    println!("  Attempts:   {}", snapshot.attempt_count);
    println!("  Started:    {}", run.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(done) = run.completed_at {
        println!("  Completed:  {}", done.format("%Y-%m-%d %H:%M:%S"));
    }
    if !run.source_filter.is_empty() {
        println!("  Sources:    {}", run.source_filter.join(", "));
    }

    if !run.errors.is_empty() {
        println!("\n  Errors:");
        for e in &run.errors {
            println!(
                "    [{}] {} {}",
                e.kind.as_str().red(),
                super::truncate_chars(&e.message, 120),
                e.occurred_at.format("%H:%M:%S").to_string().dimmed()
            );
        }
    }

    if !snapshot.recent_attempts.is_empty() {
        println!(
            "\n  {} most recent attempts:",
            snapshot.recent_attempts.len()
        );
        for attempt in &snapshot.recent_attempts {
            display_attempt(attempt);
        }
    }
    println!();
}

fn display_attempt(attempt: &ScrapingAttempt) {
    let status = match attempt.status {
        AttemptStatus::Success => "success".green(),
        AttemptStatus::Failed => "failed".red(),
        AttemptStatus::Skipped => "skipped".yellow(),
    };
    let reason = attempt.reason.map(|r| r.as_str()).unwrap_or("");
    let detail = attempt
        .error_message
        .as_deref()
        .map(|m| super::truncate_chars(m, 60))
        .unwrap_or_default();
    println!(
        "    {:<10} @{:<28} {:<8} {:<16} {}",
        attempt.platform.as_str(),
        attempt.target,
        status,
        reason,
        detail.dimmed()
    );
}

/// Display a list of prospects.
pub fn display_prospects(prospects: &[InfluencerProspect]) {
    if prospects.is_empty() {
        println!("No prospects found. Start a run with `prospector run` first.");
        return;
    }

    println!(
        "\n{}",
        format!("=== Prospects ({}) ===", prospects.len()).bold()
    );
    println!();
    println!(
        "  {:>5}  {:<30} {:>9}  {:<7} {:<10}",
        "ID".dimmed(),
        "Handle".dimmed(),
        "Followers".dimmed(),
        "Country".dimmed(),
        "Status".dimmed(),
    );
    println!("  {}", "-".repeat(68).dimmed());

    for p in prospects {
        let handle = p
            .fields
            .handles
            .first()
            .map(|h| format!("{}:{}", h.platform, h.handle))
            .unwrap_or_else(|| "?".to_string());
        println!(
            "  {:>5}  {:<30} {:>9}  {:<7} {:<10}",
            p.id,
            super::truncate_chars(&handle, 30),
            p.fields.total_followers,
            p.fields.country.as_deref().unwrap_or("-"),
            colorize_prospect_status(p.status),
        );
    }
    println!();
}

/// Display a canonical profile after promotion.
pub fn display_profile(profile: &CanonicalProfile) {
    let name = profile.fields.display_name.as_deref().unwrap_or("(no name)");
    println!(
        "\n{}",
        format!("=== Canonical profile #{}: {} ===", profile.id, name).bold()
    );
    for h in &profile.fields.handles {
        println!(
            "  {:<10} @{} {}",
            h.platform.as_str(),
            h.handle,
            h.url.as_deref().unwrap_or("").dimmed()
        );
    }
    println!("  Followers:  {}", profile.fields.total_followers);
    if let Some(email) = &profile.fields.email {
        println!("  Email:      {email}");
    }
    println!("  Found by:   {}", profile.provenance.found_by);
    if !profile.provenance.source_hashtags.is_empty() {
        println!("  Keywords:   {}", profile.provenance.source_hashtags.join(", "));
    }
    if let Some(bio) = &profile.fields.bio {
        println!("  Bio:        {}", super::truncate_chars(bio, 120).dimmed());
    }
}

/// Display flagged dedup conflicts.
pub fn display_conflicts(conflicts: &[DedupConflict]) {
    if conflicts.is_empty() {
        println!("No dedup conflicts awaiting review.");
        return;
    }
    println!(
        "\n{}",
        format!("=== Dedup conflicts ({}) ===", conflicts.len()).bold()
    );
    for c in conflicts {
        let records = c
            .records
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let run = c.run_id.map(|id| format!("run #{id}")).unwrap_or_else(|| "promotion".to_string());
        println!(
            "  {:>4}. {}:@{} matches {} ({})",
            c.id,
            c.platform,
            c.target,
            records.yellow(),
            run.dimmed()
        );
    }
}

fn colorize_run_status(status: &str) -> colored::ColoredString {
    match status {
        "completed" => status.green(),
        "running" => status.cyan(),
        "failed" => status.red(),
        "cancelled" => status.yellow(),
        _ => status.dimmed(),
    }
}

fn colorize_prospect_status(status: ProspectStatus) -> colored::ColoredString {
    let s = status.as_str();
    match status {
        ProspectStatus::Pending => s.normal(),
        ProspectStatus::Approved => s.cyan(),
        ProspectStatus::Rejected => s.red(),
        ProspectStatus::Converted => s.green(),
    }
}

//! Output rendering for the replayctl CLI.
//!
//! Formats status, log, and result information for terminal display.

use replay_core::{ExecutionStatus, FinalStatus, LogEntry, LogLevel, ResultRecord, RunPhase};

/// Print the current execution status.
pub fn print_status(status: &ExecutionStatus) {
    println!("Phase: {}", format_phase(status.phase));
    if let Some(run_id) = &status.run_id {
        println!("  Run:        {}", run_id);
    }

    let progress = &status.progress;
    println!(
        "  Progress:   {}/{} ({} ok, {} failed)",
        progress.completed, progress.total, progress.succeeded, progress.failed
    );
    if let Some(current) = &progress.current {
        println!("  Current:    {}", current);
    }

    if progress.completed > 0 {
        let stats = &status.statistics;
        println!("  Latency:    min {:.2}s / avg {:.2}s / max {:.2}s",
            stats.min_latency_seconds, stats.avg_latency_seconds, stats.max_latency_seconds
        );
        println!("  Success:    {:.1}%", stats.success_rate);
    }

    if let Some(start) = &status.start_time {
        println!("  Started:    {}", format_time(start));
    }
    if let Some(end) = &status.end_time {
        println!("  Ended:      {}", format_time(end));
    }
}

/// Print log entries in tabular format, oldest first.
pub fn print_logs(logs: &[LogEntry]) {
    if logs.is_empty() {
        println!("No log entries.");
        return;
    }

    for entry in logs {
        println!(
            "{}  {:<7}  {}",
            format_time(&entry.timestamp),
            format_level(entry.level),
            entry.message
        );
    }

    println!();
    println!("{} entr{}", logs.len(), if logs.len() == 1 { "y" } else { "ies" });
}

/// Print result records in tabular format.
pub fn print_records(records: &[ResultRecord]) {
    if records.is_empty() {
        println!("No results found.");
        return;
    }

    println!(
        "{:<16}  {:<5}  {:<30}  {:<8}  {:<28}",
        "GROUP", "TURN", "QUESTION", "LATENCY", "STATUS"
    );
    println!("{}", "-".repeat(96));

    for record in records {
        println!(
            "{:<16}  {:<5}  {:<30}  {:<8}  {:<28}",
            truncate(&record.group_id, 16),
            record.turn_number,
            truncate(&record.user_message, 30),
            format!("{:.2}s", record.latency_seconds),
            format_final_status(record.final_status),
        );
    }

    println!();
    println!("{} record(s)", records.len());
}

fn format_phase(phase: RunPhase) -> &'static str {
    match phase {
        RunPhase::Idle => "IDLE",
        RunPhase::Running => "RUNNING",
        RunPhase::Paused => "PAUSED",
        RunPhase::Stopping => "STOPPING",
        RunPhase::Stopped => "STOPPED",
        RunPhase::Completed => "COMPLETED",
        RunPhase::Error => "ERROR",
    }
}

fn format_level(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "INFO",
        LogLevel::Success => "OK",
        LogLevel::Warning => "WARN",
        LogLevel::Error => "ERROR",
    }
}

fn format_final_status(status: FinalStatus) -> &'static str {
    match status {
        FinalStatus::Success => "SUCCESS",
        FinalStatus::Failed => "FAILED",
        FinalStatus::SkippedDueToPriorFailure => "SKIPPED (prior failure)",
        FinalStatus::Cancelled => "CANCELLED",
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

//! Run-wide execution status and the status board.
//!
//! The board owns the single live `ExecutionStatus` for the process. The
//! controller mutates it; every other consumer reads immutable snapshots.
//! Snapshots cap the log buffer to the most recent entries; the full trail
//! stays available through a separate accessor.

use crate::types::{FinalStatus, Id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Maximum log entries included in a status snapshot.
pub const LOG_SNAPSHOT_CAP: usize = 100;

/// Lifecycle phase of the run as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
    Completed,
    Error,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Terminal phases accept only `restart`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Error)
    }

    /// A run is active while its worker may still process cases.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Stopping)
    }
}

/// Log severity, matching the levels surfaced to polling consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// One entry of the human-readable run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Id,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Turn-level progress counters. Monotonically non-decreasing within a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Descriptor of the item in flight, e.g. `g1#2`.
    pub current: Option<String>,
}

/// Latency and success-rate statistics over completed turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub min_latency_seconds: f64,
    pub avg_latency_seconds: f64,
    pub max_latency_seconds: f64,
    /// Percentage of completed turns that succeeded.
    pub success_rate: f64,
}

/// Snapshot of the run as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    /// Identifier of the current run; None while idle before any run.
    pub run_id: Option<Id>,
    pub phase: RunPhase,
    pub progress: Progress,
    pub statistics: Statistics,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Most recent log entries (bounded; full trail via the export path).
    pub logs: Vec<LogEntry>,
}

/// Live state behind the board mutex.
#[derive(Debug, Default)]
struct BoardInner {
    status: ExecutionStatus,
    /// Full, uncapped log trail for the current run.
    full_log: Vec<LogEntry>,
    /// Latencies of attempted turns, for statistics.
    latencies: Vec<f64>,
}

/// Single owner of the process-wide mutable run state.
///
/// All mutation goes through `&self` methods holding a short-lived mutex;
/// readers get clones and never observe a partially-updated state.
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: Mutex<BoardInner>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// The board must stay readable even after a panic elsewhere poisoned
    /// the lock; every update leaves the inner state whole.
    fn lock(&self) -> MutexGuard<'_, BoardInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Immutable copy of the current status, log buffer capped.
    pub fn snapshot(&self) -> ExecutionStatus {
        let inner = self.lock();
        let mut status = inner.status.clone();
        let skip = inner.full_log.len().saturating_sub(LOG_SNAPSHOT_CAP);
        status.logs = inner.full_log[skip..].to_vec();
        status
    }

    /// The full, uncapped log trail for the current run.
    pub fn full_log(&self) -> Vec<LogEntry> {
        let inner = self.lock();
        inner.full_log.clone()
    }

    pub fn phase(&self) -> RunPhase {
        let inner = self.lock();
        inner.status.phase
    }

    /// Reset to a fresh running state for a new run.
    pub fn begin_run(&self, run_id: Id, total: usize) {
        let mut inner = self.lock();
        *inner = BoardInner::default();
        inner.status.run_id = Some(run_id);
        inner.status.phase = RunPhase::Running;
        inner.status.progress.total = total;
        inner.status.start_time = Some(Utc::now());
    }

    /// Discard all run state, returning to a fresh idle board.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = BoardInner::default();
    }

    pub fn set_phase(&self, phase: RunPhase) {
        let mut inner = self.lock();
        write_phase(&mut inner, phase);
    }

    /// Move to `to` only if the current phase satisfies `allowed`.
    ///
    /// Check and write happen under one lock, so a control verb cannot
    /// land its phase write after the worker's terminal transition (which
    /// would strand the board in a phase no worker will ever leave).
    /// Returns the unchanged phase on refusal.
    pub fn transition_if(
        &self,
        allowed: impl FnOnce(RunPhase) -> bool,
        to: RunPhase,
    ) -> Result<(), RunPhase> {
        let mut inner = self.lock();
        let current = inner.status.phase;
        if !allowed(current) {
            return Err(current);
        }
        write_phase(&mut inner, to);
        Ok(())
    }

    pub fn set_current(&self, descriptor: Option<String>) {
        let mut inner = self.lock();
        inner.status.progress.current = descriptor;
    }

    /// Record one completed turn and refresh the derived statistics.
    ///
    /// `latency_seconds` is None for turns that were never attempted
    /// (skipped or cancelled); those count as completed but not toward
    /// latency statistics.
    pub fn record_turn(&self, final_status: FinalStatus, latency_seconds: Option<f64>) {
        let mut inner = self.lock();
        inner.status.progress.completed += 1;
        match final_status {
            FinalStatus::Success => inner.status.progress.succeeded += 1,
            _ => inner.status.progress.failed += 1,
        }
        if let Some(latency) = latency_seconds {
            inner.latencies.push(latency);
        }

        if !inner.latencies.is_empty() {
            let min = inner.latencies.iter().copied().fold(f64::INFINITY, f64::min);
            let max = inner.latencies.iter().copied().fold(0.0f64, f64::max);
            let avg = inner.latencies.iter().sum::<f64>() / inner.latencies.len() as f64;
            inner.status.statistics.min_latency_seconds = min;
            inner.status.statistics.max_latency_seconds = max;
            inner.status.statistics.avg_latency_seconds = avg;
        }
        let completed = inner.status.progress.completed;
        if completed > 0 {
            inner.status.statistics.success_rate =
                inner.status.progress.succeeded as f64 / completed as f64 * 100.0;
        }
    }

    /// Append a log entry to the full trail.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.full_log.push(LogEntry {
            id: Id::new(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
    }
}

fn write_phase(inner: &mut BoardInner, phase: RunPhase) {
    inner.status.phase = phase;
    if phase.is_terminal() {
        inner.status.end_time = Some(Utc::now());
        inner.status.progress.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_phase_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&RunPhase::Idle).unwrap(), "\"idle\"");
        assert_eq!(
            serde_json::to_string(&RunPhase::Stopping).unwrap(),
            "\"stopping\""
        );
    }

    #[test]
    fn fresh_board_is_idle() {
        let board = StatusBoard::new();
        let status = board.snapshot();
        assert_eq!(status.phase, RunPhase::Idle);
        assert_eq!(status.progress.total, 0);
        assert!(status.run_id.is_none());
        assert!(status.logs.is_empty());
    }

    #[test]
    fn begin_run_resets_and_marks_running() {
        let board = StatusBoard::new();
        board.log(LogLevel::Info, "stale entry");
        board.begin_run(Id::new(), 7);

        let status = board.snapshot();
        assert_eq!(status.phase, RunPhase::Running);
        assert_eq!(status.progress.total, 7);
        assert!(status.start_time.is_some());
        assert!(status.logs.is_empty(), "old log discarded on new run");
    }

    #[test]
    fn record_turn_updates_counters_and_statistics() {
        let board = StatusBoard::new();
        board.begin_run(Id::new(), 3);
        board.record_turn(FinalStatus::Success, Some(1.0));
        board.record_turn(FinalStatus::Failed, Some(3.0));
        board.record_turn(FinalStatus::SkippedDueToPriorFailure, None);

        let status = board.snapshot();
        assert_eq!(status.progress.completed, 3);
        assert_eq!(status.progress.succeeded, 1);
        assert_eq!(status.progress.failed, 2);
        assert!((status.statistics.min_latency_seconds - 1.0).abs() < 1e-9);
        assert!((status.statistics.max_latency_seconds - 3.0).abs() < 1e-9);
        assert!((status.statistics.avg_latency_seconds - 2.0).abs() < 1e-9);
        // 1 of 3 completed turns succeeded.
        assert!((status.statistics.success_rate - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_caps_log_but_full_log_does_not() {
        let board = StatusBoard::new();
        for i in 0..(LOG_SNAPSHOT_CAP + 25) {
            board.log(LogLevel::Info, format!("entry {i}"));
        }

        let status = board.snapshot();
        assert_eq!(status.logs.len(), LOG_SNAPSHOT_CAP);
        assert_eq!(status.logs[0].message, "entry 25");

        let full = board.full_log();
        assert_eq!(full.len(), LOG_SNAPSHOT_CAP + 25);
        assert_eq!(full[0].message, "entry 0");
    }

    #[test]
    fn terminal_phase_sets_end_time_and_clears_current() {
        let board = StatusBoard::new();
        board.begin_run(Id::new(), 1);
        board.set_current(Some("g1#1".to_string()));
        board.set_phase(RunPhase::Stopped);

        let status = board.snapshot();
        assert_eq!(status.phase, RunPhase::Stopped);
        assert!(status.end_time.is_some());
        assert!(status.progress.current.is_none());
    }

    #[test]
    fn transition_refused_once_terminal() {
        let board = StatusBoard::new();
        board.begin_run(Id::new(), 2);

        // Running -> Paused passes the guard.
        board
            .transition_if(|p| p == RunPhase::Running, RunPhase::Paused)
            .unwrap();
        assert_eq!(board.phase(), RunPhase::Paused);

        // The worker finishes; a late control verb must not overwrite the
        // terminal phase.
        board
            .transition_if(|p| p.is_active(), RunPhase::Completed)
            .unwrap();
        let refused = board
            .transition_if(|p| p.is_active(), RunPhase::Stopping)
            .unwrap_err();
        assert_eq!(refused, RunPhase::Completed);
        assert_eq!(board.phase(), RunPhase::Completed);
    }

    #[test]
    fn reset_returns_to_fresh_idle() {
        let board = StatusBoard::new();
        board.begin_run(Id::new(), 5);
        board.record_turn(FinalStatus::Success, Some(0.5));
        board.set_phase(RunPhase::Completed);
        board.reset();

        let status = board.snapshot();
        assert_eq!(status, ExecutionStatus::default());
    }
}

//! Execution controller: the run lifecycle state machine.
//!
//! Exactly one run is active at a time. `start` loads and validates the
//! case file, seeds the status board, and spawns a worker that walks the
//! conversation groups sequentially. Pause parks the worker at the next
//! group boundary; stop cancels between turns and never interrupts an
//! in-flight call. Terminal phases accept only `restart`.

use crate::client::ChatClient;
use crate::runner::{ConversationRunner, GroupEnd, TurnEvents};
use crate::sink::{ExportScope, Sink, SinkError};
use async_trait::async_trait;
use replay_core::{
    cases, grouper, Config, ConversationGroup, ExecutionStatus, FinalStatus, Id, LogLevel,
    ResultRecord, RunPhase, StatusBoard, TestCase,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("a run is already active")]
    AlreadyRunning,
    #[error("no run is active")]
    NotRunning,
    #[error("run is not paused")]
    NotPaused,
    #[error("run is still active; stop it before restarting")]
    StillActive,
    #[error("case file yielded no valid conversation groups")]
    NoCases,
    #[error(transparent)]
    Config(#[from] replay_core::config::ConfigError),
    #[error(transparent)]
    CaseFile(#[from] cases::CaseFileError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

pub type Result<T> = std::result::Result<T, ControlError>;

pub struct Controller {
    config: Config,
    board: Arc<StatusBoard>,
    sink: Arc<Sink>,
    pause: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
    cancel: Mutex<Option<CancellationToken>>,
    start_lock: Mutex<()>,
}

impl Controller {
    pub fn new(config: Config, board: Arc<StatusBoard>, sink: Arc<Sink>) -> Self {
        Self {
            config,
            board,
            sink,
            pause: Arc::new(AtomicBool::new(false)),
            resume_notify: Arc::new(Notify::new()),
            cancel: Mutex::new(None),
            start_lock: Mutex::new(()),
        }
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    pub fn sink(&self) -> &Arc<Sink> {
        &self.sink
    }

    /// Start a new run from the configured case file.
    ///
    /// Rejected while another run is active. Validation defects do not
    /// abort the run; offending groups are excluded and logged.
    pub fn start(&self) -> Result<Id> {
        self.config.validate()?;
        let client = ChatClient::from_config(&self.config);
        let runner = ConversationRunner::new(
            client,
            Duration::from_secs(u64::from(self.config.case_delay_sec)),
        );
        self.start_with_runner(runner)
    }

    /// Start with an explicit runner. Split out so tests can substitute
    /// a scripted delivery.
    pub fn start_with_runner(&self, runner: ConversationRunner) -> Result<Id> {
        let _guard = self
            .start_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.board.phase().is_active() {
            return Err(ControlError::AlreadyRunning);
        }

        let rows = cases::load_rows(&self.config.cases_path)?;
        let (groups, defects) = grouper::group_cases(&rows);
        if groups.is_empty() {
            return Err(ControlError::NoCases);
        }

        let total: usize = groups.iter().map(|g| g.cases.len()).sum();
        let run_id = Id::new();
        self.pause.store(false, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        *self
            .cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(cancel.clone());

        self.board.begin_run(run_id.clone(), total);
        self.board.log(
            LogLevel::Info,
            format!(
                "run started: {} groups, {} cases",
                groups.len(),
                total
            ),
        );
        for defect in &defects {
            warn!(%defect, "excluding invalid group");
            self.board
                .log(LogLevel::Warning, format!("excluded: {defect}"));
        }

        let worker = Worker {
            run_id: run_id.clone(),
            groups,
            runner,
            board: self.board.clone(),
            sink: self.sink.clone(),
            pause: self.pause.clone(),
            resume_notify: self.resume_notify.clone(),
            cancel,
            group_delay: Duration::from_secs(u64::from(self.config.case_delay_sec)),
        };
        tokio::spawn(worker.run());

        info!(run_id = %run_id, "run started");
        Ok(run_id)
    }

    /// Park the worker at the next group boundary. The group in flight
    /// finishes first.
    ///
    /// The phase check and write are one atomic transition: a pause that
    /// races the worker's terminal write loses and is rejected instead of
    /// overwriting a finished run.
    pub fn pause(&self) -> Result<()> {
        // Flag first so the worker parks no later than the phase changes.
        self.pause.store(true, Ordering::SeqCst);
        if self
            .board
            .transition_if(|p| p == RunPhase::Running, RunPhase::Paused)
            .is_err()
        {
            self.pause.store(false, Ordering::SeqCst);
            return Err(ControlError::NotRunning);
        }
        self.board.log(LogLevel::Info, "run paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.board
            .transition_if(|p| p == RunPhase::Paused, RunPhase::Running)
            .map_err(|_| ControlError::NotPaused)?;
        self.pause.store(false, Ordering::SeqCst);
        self.board.log(LogLevel::Info, "run resumed");
        self.resume_notify.notify_waiters();
        Ok(())
    }

    /// Request a stop. Takes effect between turns; the in-flight call is
    /// never interrupted. Unattempted cases end up `cancelled`.
    pub fn stop(&self) -> Result<()> {
        self.board
            .transition_if(|p| p.is_active(), RunPhase::Stopping)
            .map_err(|_| ControlError::NotRunning)?;
        self.board.log(LogLevel::Info, "stop requested");
        if let Some(cancel) = self
            .cancel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
        {
            cancel.cancel();
        }
        // Wake a paused worker so it can observe the cancellation.
        self.pause.store(false, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
        Ok(())
    }

    /// Return to idle from a terminal phase. Persisted results are kept.
    pub fn restart(&self) -> Result<()> {
        let phase = self.board.phase();
        if phase.is_active() {
            return Err(ControlError::StillActive);
        }
        self.board.reset();
        info!("controller reset to idle");
        Ok(())
    }

    pub fn status(&self) -> ExecutionStatus {
        self.board.snapshot()
    }

    pub async fn export(&self, scope: &ExportScope) -> Result<Vec<ResultRecord>> {
        Ok(self.sink.list(scope).await?)
    }
}

/// State moved into the spawned run task.
struct Worker {
    run_id: Id,
    groups: Vec<ConversationGroup>,
    runner: ConversationRunner,
    board: Arc<StatusBoard>,
    sink: Arc<Sink>,
    pause: Arc<AtomicBool>,
    resume_notify: Arc<Notify>,
    cancel: CancellationToken,
    group_delay: Duration,
}

impl Worker {
    async fn run(self) {
        let outcome = self.drive().await;
        match outcome {
            Ok(stopped) => {
                let phase = if stopped {
                    RunPhase::Stopped
                } else {
                    RunPhase::Completed
                };
                // The worker is the only writer that leaves the active set,
                // so this transition cannot be refused.
                if self.board.transition_if(|p| p.is_active(), phase).is_ok() {
                    self.board
                        .log(LogLevel::Success, format!("run {}", phase.as_str()));
                }
                info!(run_id = %self.run_id, phase = phase.as_str(), "run finished");
            }
            Err(e) => {
                error!(run_id = %self.run_id, error = %e, "run failed");
                if self
                    .board
                    .transition_if(|p| p.is_active(), RunPhase::Error)
                    .is_ok()
                {
                    self.board.log(LogLevel::Error, format!("run failed: {e}"));
                }
            }
        }
    }

    /// Walk the groups. Returns true if the run was stopped early.
    async fn drive(&self) -> std::result::Result<bool, SinkError> {
        let mut events = BoardEvents {
            run_id: self.run_id.clone(),
            board: self.board.clone(),
            sink: self.sink.clone(),
        };

        for (index, group) in self.groups.iter().enumerate() {
            self.park_while_paused().await;
            if self.cancel.is_cancelled() {
                self.mark_cancelled(&self.groups[index..], &mut events)
                    .await?;
                return Ok(true);
            }

            if index > 0 && !self.group_delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(self.group_delay) => {}
                    () = self.cancel.cancelled() => {}
                }
            }

            self.board
                .log(LogLevel::Info, format!("group {} started", group.group_id));
            let end = self
                .runner
                .run_group(&self.run_id, group, &self.cancel, &mut events)
                .await?;

            match end {
                GroupEnd::Finished => {}
                GroupEnd::Abandoned => {
                    self.board.log(
                        LogLevel::Warning,
                        format!("group {} abandoned after fatal failure", group.group_id),
                    );
                }
                GroupEnd::Cancelled => {
                    self.mark_cancelled(&self.groups[index + 1..], &mut events)
                        .await?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn park_while_paused(&self) {
        while self.pause.load(Ordering::SeqCst) && !self.cancel.is_cancelled() {
            tokio::select! {
                () = self.resume_notify.notified() => {}
                () = self.cancel.cancelled() => {}
            }
        }
    }

    /// Record every case in `groups` as cancelled.
    async fn mark_cancelled(
        &self,
        groups: &[ConversationGroup],
        events: &mut BoardEvents,
    ) -> std::result::Result<(), SinkError> {
        for group in groups {
            for case in &group.cases {
                events
                    .on_turn_complete(ResultRecord::unattempted(
                        &self.run_id,
                        case,
                        FinalStatus::Cancelled,
                    ))
                    .await?;
            }
        }
        Ok(())
    }
}

/// Bridges turn completion into the sink and the status board.
struct BoardEvents {
    run_id: Id,
    board: Arc<StatusBoard>,
    sink: Arc<Sink>,
}

#[async_trait]
impl TurnEvents for BoardEvents {
    type Error = SinkError;

    async fn on_turn_start(&mut self, case: &TestCase) -> std::result::Result<(), SinkError> {
        self.board
            .set_current(Some(format!("{}#{}", case.group_id, case.turn_number)));
        self.board.log(
            LogLevel::Info,
            format!("{}#{} started", case.group_id, case.turn_number),
        );
        Ok(())
    }

    async fn on_call_settled(
        &mut self,
        case: &TestCase,
        outcome: &replay_core::CallOutcome,
    ) -> std::result::Result<(), SinkError> {
        if outcome.attempt_number > 1 {
            self.board.log(
                LogLevel::Warning,
                format!(
                    "{}#{}: settled on attempt {}",
                    case.group_id, case.turn_number, outcome.attempt_number
                ),
            );
        }
        Ok(())
    }

    async fn on_turn_complete(
        &mut self,
        record: ResultRecord,
    ) -> std::result::Result<(), SinkError> {
        debug_assert_eq!(record.run_id, self.run_id);
        self.sink.append(&record).await?;

        let attempted = !matches!(
            record.final_status,
            FinalStatus::SkippedDueToPriorFailure | FinalStatus::Cancelled
        );
        self.board.record_turn(
            record.final_status,
            attempted.then_some(record.latency_seconds),
        );

        let (level, note) = match record.final_status {
            FinalStatus::Success => (LogLevel::Success, "ok".to_string()),
            FinalStatus::Failed => (
                LogLevel::Error,
                record
                    .error_detail
                    .clone()
                    .unwrap_or_else(|| "failed".to_string()),
            ),
            FinalStatus::SkippedDueToPriorFailure => (LogLevel::Warning, "skipped".to_string()),
            FinalStatus::Cancelled => (LogLevel::Warning, "cancelled".to_string()),
        };
        self.board.log(
            level,
            format!("{}#{}: {}", record.group_id, record.turn_number, note),
        );
        Ok(())
    }
}

//! Sequential execution of one conversation group.
//!
//! Turns run in order. The session handle captured from the first successful
//! reply threads through every later turn so the remote service sees one
//! continuous conversation. A fatal turn failure abandons the rest of the
//! group; the skipped turns are still reported so the result set stays
//! complete.

use crate::client::ChatClient;
use async_trait::async_trait;
use replay_core::{
    CallOutcome, CallStatus, ConversationGroup, FinalStatus, Id, ResultRecord, TestCase,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Receives one finished record per turn, in execution order.
///
/// An `Err` from the observer aborts the run; the runner propagates it
/// without attempting further turns.
#[async_trait]
pub trait TurnEvents: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Called before a turn's request goes out. Skipped turns never see this.
    async fn on_turn_start(&mut self, _case: &TestCase) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called once the call settles, before its record is reported. Gives
    /// the observer the attempt count so retries show up in the run log.
    async fn on_call_settled(
        &mut self,
        _case: &TestCase,
        _outcome: &CallOutcome,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn on_turn_complete(&mut self, record: ResultRecord) -> Result<(), Self::Error>;
}

/// How a group run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEnd {
    /// Every turn was attempted (some may have failed the expectation).
    Finished,
    /// A fatal call failure abandoned the remaining turns.
    Abandoned,
    /// Cancellation was observed between turns.
    Cancelled,
}

pub struct ConversationRunner {
    client: ChatClient,
    turn_delay: Duration,
}

impl ConversationRunner {
    pub fn new(client: ChatClient, turn_delay: Duration) -> Self {
        Self { client, turn_delay }
    }

    /// Run every turn of `group` in order, reporting each result to `events`.
    ///
    /// Cancellation is only observed between turns; an in-flight call always
    /// completes and its result is recorded.
    pub async fn run_group<E: TurnEvents>(
        &self,
        run_id: &Id,
        group: &ConversationGroup,
        cancel: &CancellationToken,
        events: &mut E,
    ) -> Result<GroupEnd, E::Error> {
        let mut session: Option<String> = None;
        let total = group.cases.len();

        for (index, case) in group.cases.iter().enumerate() {
            if index > 0 && !self.turn_delay.is_zero() {
                // Pacing delay, cut short by a stop request.
                tokio::select! {
                    () = tokio::time::sleep(self.turn_delay) => {}
                    () = cancel.cancelled() => {}
                }
            }

            if cancel.is_cancelled() {
                self.report_rest(run_id, &group.cases[index..], FinalStatus::Cancelled, events)
                    .await?;
                return Ok(GroupEnd::Cancelled);
            }

            debug!(
                group = %group.group_id,
                turn = case.turn_number,
                "executing turn"
            );
            events.on_turn_start(case).await?;
            let outcome = self
                .client
                .execute_turn(
                    session.as_deref(),
                    &case.user_message,
                    case.extra_inputs.as_ref(),
                )
                .await;
            events.on_call_settled(case, &outcome).await?;

            if let Some(handle) = &outcome.session {
                if session.is_none() {
                    debug!(group = %group.group_id, session = %handle, "session established");
                }
                session = Some(handle.clone());
            }

            let fatal = outcome.status == CallStatus::FatalFailure;
            let record = ResultRecord::from_outcome(run_id, case, &outcome);
            events.on_turn_complete(record).await?;

            if fatal {
                info!(
                    group = %group.group_id,
                    turn = case.turn_number,
                    remaining = total - index - 1,
                    "fatal failure, abandoning group"
                );
                self.report_rest(
                    run_id,
                    &group.cases[index + 1..],
                    FinalStatus::SkippedDueToPriorFailure,
                    events,
                )
                .await?;
                return Ok(GroupEnd::Abandoned);
            }
        }

        Ok(GroupEnd::Finished)
    }

    async fn report_rest<E: TurnEvents>(
        &self,
        run_id: &Id,
        cases: &[TestCase],
        status: FinalStatus,
        events: &mut E,
    ) -> Result<(), E::Error> {
        for case in cases {
            events
                .on_turn_complete(ResultRecord::unattempted(run_id, case, status))
                .await?;
        }
        Ok(())
    }
}

//! Core types for the chat replay engine.
//!
//! Covers test cases, conversation groups, per-call outcomes, and the
//! durable result records produced by a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for runs and log entries.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Outcome of a single turn after the retry policy has run its course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    RetryableFailure,
    FatalFailure,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure => "retryable_failure",
            Self::FatalFailure => "fatal_failure",
        }
    }
}

/// Final status of one test case after the run has dealt with it.
///
/// `SkippedDueToPriorFailure` marks turns never attempted because an earlier
/// turn in the same group broke the conversation; `Cancelled` marks turns
/// abandoned by an explicit stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Success,
    Failed,
    SkippedDueToPriorFailure,
    Cancelled,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::SkippedDueToPriorFailure => "skipped_due_to_prior_failure",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped_due_to_prior_failure" => Some(Self::SkippedDueToPriorFailure),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Response delivery mode for the remote chat API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Full reply returned in one response body.
    Blocking,
    /// Reply assembled from an SSE event sequence.
    #[default]
    Streaming,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocking => "blocking",
            Self::Streaming => "streaming",
        }
    }
}

// --- Core Types ---

/// Extra structured inputs attached to a test case, decoded from a
/// JSON-object-encoded string in the input file.
pub type ExtraInputs = serde_json::Map<String, serde_json::Value>;

/// One row of input: a single turn of a scripted conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Groups turns into a conversation; turns sharing an id share a session.
    pub group_id: String,
    /// 1-based position of this turn within its group.
    pub turn_number: u32,
    /// The user message sent to the remote service.
    pub user_message: String,
    /// Informational only; never used to decide pass/fail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_inputs: Option<ExtraInputs>,
}

/// An ordered sequence of test cases sharing a `group_id`.
///
/// Invariant (enforced by the grouper): `cases` is sorted by `turn_number`
/// and the turn numbers are exactly `1..=cases.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationGroup {
    pub group_id: String,
    pub cases: Vec<TestCase>,
}

impl ConversationGroup {
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

/// Result of executing one turn, including however many attempts it took.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub status: CallStatus,
    pub reply_text: String,
    /// Conversation id reported by the remote service, if any.
    pub session: Option<String>,
    /// Wall-clock time of the final attempt.
    pub latency: Duration,
    /// Present only on failure.
    pub error_detail: Option<String>,
    /// 1-based number of the attempt that produced this outcome.
    pub attempt_number: u32,
}

/// Durable, append-only output for one completed test case.
///
/// Written exactly once, in the order turns complete, and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// The run (task) this record belongs to.
    pub run_id: Id,
    pub group_id: String,
    pub turn_number: u32,
    pub user_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_inputs: Option<ExtraInputs>,
    pub actual_reply: String,
    pub latency_seconds: f64,
    pub final_status: FinalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl ResultRecord {
    /// Build a record from an executed turn.
    pub fn from_outcome(run_id: &Id, case: &TestCase, outcome: &CallOutcome) -> Self {
        Self {
            run_id: run_id.clone(),
            group_id: case.group_id.clone(),
            turn_number: case.turn_number,
            user_message: case.user_message.clone(),
            expected_reply: case.expected_reply.clone(),
            extra_inputs: case.extra_inputs.clone(),
            actual_reply: outcome.reply_text.clone(),
            latency_seconds: outcome.latency.as_secs_f64(),
            final_status: match outcome.status {
                CallStatus::Success => FinalStatus::Success,
                _ => FinalStatus::Failed,
            },
            error_detail: outcome.error_detail.clone(),
            completed_at: Utc::now(),
        }
    }

    /// Build a record for a turn that was never attempted.
    pub fn unattempted(run_id: &Id, case: &TestCase, status: FinalStatus) -> Self {
        let detail = match status {
            FinalStatus::SkippedDueToPriorFailure => "skipped: earlier turn in this group failed",
            FinalStatus::Cancelled => "cancelled: stop requested",
            _ => "",
        };
        Self {
            run_id: run_id.clone(),
            group_id: case.group_id.clone(),
            turn_number: case.turn_number,
            user_message: case.user_message.clone(),
            expected_reply: case.expected_reply.clone(),
            extra_inputs: case.extra_inputs.clone(),
            actual_reply: String::new(),
            latency_seconds: 0.0,
            final_status: status,
            error_detail: if detail.is_empty() {
                None
            } else {
                Some(detail.to_string())
            },
            completed_at: Utc::now(),
        }
    }
}

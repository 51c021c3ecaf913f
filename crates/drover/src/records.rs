//! Request records - the hub-side ledger entry for every unit of work.
//!
//! One record exists per submitted request id. Status moves forward only:
//! a terminal state (completed, failed, aborted) is reached at most once, and
//! only `resubmitted` may follow it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Which channel carried the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// MUX - addressed to a specific engine by the client.
    Direct,
    /// Load-balanced through the task scheduler.
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Submitted,
    Unassigned,
    Assigned,
    Running,
    Completed,
    Failed,
    Aborted,
    Resubmitted,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::Unassigned => 1,
            Self::Assigned => 2,
            Self::Running => 3,
            Self::Completed | Self::Failed | Self::Aborted => 4,
            Self::Resubmitted => 5,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("invalid status transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: RequestStatus,
    pub to: RequestStatus,
}

/// Ledger entry for one request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub msg_id: Uuid,
    /// Hex-encoded routing identity of the submitting client.
    pub client: String,
    pub engine_id: Option<u32>,
    pub channel: Channel,
    pub status: RequestStatus,

    pub submitted: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,

    /// Submission envelope sections, kept verbatim for resubmission.
    pub header: Value,
    pub metadata: Value,
    pub content: Value,
    /// Base64-encoded payload buffers. Never inspected.
    #[serde(default)]
    pub buffers: Vec<String>,

    pub result_header: Option<Value>,
    pub result_content: Option<Value>,
    #[serde(default)]
    pub result_buffers: Vec<String>,

    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,

    #[serde(default)]
    pub resubmit_count: u32,
    /// The id this record was cloned from, when it is a resubmission.
    #[serde(default)]
    pub resubmitted_from: Option<Uuid>,
}

impl RequestRecord {
    pub fn new(msg_id: Uuid, client: String, channel: Channel, status: RequestStatus) -> Self {
        Self {
            msg_id,
            client,
            engine_id: None,
            channel,
            status,
            submitted: Utc::now(),
            started: None,
            completed: None,
            header: Value::Null,
            metadata: Value::Null,
            content: Value::Null,
            buffers: Vec::new(),
            result_header: None,
            result_content: None,
            result_buffers: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            resubmit_count: 0,
            resubmitted_from: None,
        }
    }

    /// Advance the status, enforcing monotonicity and a single terminal
    /// transition. `resubmitted` is the one allowed exit from a terminal
    /// state; it clears the started/completed stamps and bumps the counter.
    pub fn transition(&mut self, to: RequestStatus) -> Result<(), InvalidTransition> {
        let from = self.status;
        if to == RequestStatus::Resubmitted {
            self.status = to;
            self.started = None;
            self.completed = None;
            self.resubmit_count += 1;
            return Ok(());
        }
        // a resubmitted record is never advanced again; the fresh id is
        if from.is_terminal() || from == RequestStatus::Resubmitted {
            return Err(InvalidTransition { from, to });
        }
        if to.rank() <= from.rank() {
            return Err(InvalidTransition { from, to });
        }
        match to {
            RequestStatus::Running => self.started = Some(Utc::now()),
            s if s.is_terminal() => self.completed = Some(Utc::now()),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    pub fn is_outstanding(&self) -> bool {
        !self.status.is_terminal() && self.status != RequestStatus::Resubmitted
    }
}

/// Encode payload buffers for storage.
pub fn encode_buffers(buffers: &[Bytes]) -> Vec<String> {
    use base64::Engine as _;
    buffers
        .iter()
        .map(|b| base64::engine::general_purpose::STANDARD.encode(b))
        .collect()
}

/// Decode stored payload buffers.
pub fn decode_buffers(encoded: &[String]) -> Vec<Bytes> {
    use base64::Engine as _;
    encoded
        .iter()
        .filter_map(|s| {
            base64::engine::general_purpose::STANDARD
                .decode(s)
                .ok()
                .map(Bytes::from)
        })
        .collect()
}

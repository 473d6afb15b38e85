//! Capture records: one conversational exchange waiting to reach the memory worker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Delivery status of a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    /// Stored locally, waiting for a drain cycle
    Pending,

    /// Claimed by a sender
    Sending,

    /// Accepted by the memory worker
    Sent,

    /// Gave up after the retry budget ran out
    Failed,
}

impl CaptureStatus {
    /// Sent and failed records are never touched again except by cleanup
    pub fn is_terminal(self) -> bool {
        matches!(self, CaptureStatus::Sent | CaptureStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CaptureStatus::Pending => "pending",
            CaptureStatus::Sending => "sending",
            CaptureStatus::Sent => "sent",
            CaptureStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CaptureStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CaptureStatus::Pending),
            "sending" => Ok(CaptureStatus::Sending),
            "sent" => Ok(CaptureStatus::Sent),
            "failed" => Ok(CaptureStatus::Failed),
            _ => Err(Error::storage(format!("Unknown capture status: {}", s))),
        }
    }
}

/// A capture as handed over by the conversation handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCapture {
    pub session_id: String,
    pub input_text: String,
    pub output_text: String,
    pub channel: String,
}

impl NewCapture {
    pub fn new(
        session_id: impl Into<String>,
        input_text: impl Into<String>,
        output_text: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            input_text: input_text.into(),
            output_text: output_text.into(),
            channel: channel.into(),
        }
    }
}

/// A stored capture and its delivery state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Unique capture ID
    pub id: Uuid,

    /// Session / correlation id of the conversation
    pub session_id: String,

    /// What the user said
    pub input_text: String,

    /// What the assistant answered
    pub output_text: String,

    /// Surface the exchange happened on (chat, voice, ...)
    pub channel: String,

    pub created_at: DateTime<Utc>,

    /// Last status change
    pub updated_at: DateTime<Utc>,

    pub status: CaptureStatus,

    /// Genuine delivery failures so far
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl CaptureRecord {
    /// Build the wire submission for the memory worker
    pub fn submission(&self) -> CaptureSubmission {
        CaptureSubmission {
            capture_id: self.id,
            session_id: self.session_id.clone(),
            input_text: self.input_text.clone(),
            output_text: self.output_text.clone(),
            channel: self.channel.clone(),
            timestamp: self.created_at,
        }
    }
}

/// Body of a capture submission to the memory worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSubmission {
    /// Lets the worker drop duplicates from at-least-once delivery
    pub capture_id: Uuid,
    pub session_id: String,
    pub input_text: String,
    pub output_text: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
}

/// What `mark_retry` decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back in the queue with this many failures recorded
    Requeued { retry_count: u32 },

    /// Retry budget exhausted
    Failed { retry_count: u32 },
}

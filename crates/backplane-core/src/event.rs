//! Platform event tokens and handler outcomes

use backplane_records::DeviceNum;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event received from the platform, passed through handler chains so
/// exactly one consumer can claim it. Unclaimed events are forwarded to the
/// domain's unhandled-event sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformEvent {
    /// Controller the event originated from.
    pub source: DeviceNum,
    /// Raw event payload.
    pub data: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl PlatformEvent {
    pub fn new(source: DeviceNum, data: Vec<u8>) -> Self {
        Self { source, data, received_at: Utc::now() }
    }
}

/// Direction of a discrete sensor event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventDir {
    Assertion,
    Deassertion,
}

/// Whether a handler claimed the event it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    Handled,
    NotHandled,
}

/// What happened to an entity (or one of its sensors, controls, or FRU
/// data) as reported through an update-handler list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Added,
    Changed,
    Deleted,
}

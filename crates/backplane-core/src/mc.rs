//! Management-controller collaborator contract
//!
//! Controllers own the transport session. The registry consumes their
//! liveness feed for FRU-device presence monitoring, asks them to scan when
//! a non-FRU controller locator shows up for an already-populated entity,
//! and routes entity-scoped commands through them.

use anyhow::Result;
use async_trait::async_trait;
use backplane_records::DeviceNum;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// A raw command addressed to a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McMessage {
    pub netfn: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McResponse {
    pub completion: u8,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait ManagementController: Send + Sync {
    fn address(&self) -> DeviceNum;

    fn is_active(&self) -> bool;

    /// Liveness feed; the receiver's value tracks `is_active`.
    fn active_watch(&self) -> watch::Receiver<bool>;

    /// Kick off a discovery scan behind this controller.
    async fn start_scan(&self) -> Result<()>;

    async fn send_command(&self, lun: u8, msg: McMessage) -> Result<McResponse>;
}

/// Looks up controllers by bus address, creating them on demand if the
/// surrounding stack chooses to.
pub trait McResolver: Send + Sync {
    fn resolve(&self, channel: u8, address: u8) -> Option<Arc<dyn ManagementController>>;
}

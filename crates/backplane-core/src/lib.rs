//! Backplane Core - Entity registry, reconciliation, presence, and hot-swap
//!
//! This crate provides the run-time model of platform-management hardware:
//! - Entity registry with reference-counted, race-safe deferred destruction
//! - Directory reconciliation that diffs scans against remembered state
//! - Cascading presence detection from sensors, controller liveness, or
//!   child aggregation
//! - A hot-swap state machine driving activation/deactivation with timeouts
//! - Collaborator contracts for sensors, controls, controllers, and FRU data

pub mod config;
pub mod control;
pub mod entity;
pub mod error;
pub mod event;
pub mod fru;
pub mod hotswap;
pub mod mc;
pub mod observer;
pub mod presence;
pub mod reconcile;
pub mod registry;
pub mod sensor;

mod opqueue;

pub use config::{DomainConfig, HotSwapConfig};
pub use control::{Control, ControlType, IndicatorSpec};
pub use entity::{
    ControlHandler, DomainId, Entity, EntityHandle, FruHandler, HotSwapHandler, PresenceHandler,
    SensorHandler, UpdateHandler,
};
pub use error::EntityError;
pub use event::{EventDir, EventDisposition, PlatformEvent, UpdateKind};
pub use fru::{FruAddress, FruData, FruSource};
pub use hotswap::{HotSwapOps, HotSwapState, SwapTimeout};
pub use mc::{ManagementController, McMessage, McResolver, McResponse};
pub use observer::HandlerId;
pub use reconcile::{ScanReport, ScanState};
pub use registry::{EntityRef, EntityRegistry, UnhandledEventSink};
pub use sensor::{DiscreteStates, EventMask, EventSupport, RequesterSpec, Sensor};

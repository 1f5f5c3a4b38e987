//! Sensor collaborator contract
//!
//! Sensors are owned by the surrounding stack; the registry only consumes
//! the discrete-state query, event-enable configuration, and classification
//! surface defined here. Presence and hot-swap role detection is driven
//! entirely by the classification queries.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Sensor type code of a dedicated presence sensor.
pub const SENSOR_TYPE_PRESENCE: u8 = 0x25;
/// Sensor types that carry a presence bit at a fixed offset.
pub const SENSOR_TYPE_POWER_SUPPLY: u8 = 0x08;
pub const SENSOR_TYPE_SLOT_CONNECTOR: u8 = 0x21;
pub const SENSOR_TYPE_BATTERY: u8 = 0x29;

/// How a sensor's event generation can be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSupport {
    PerState,
    EntireSensor,
    GlobalEnable,
    None,
}

/// A discrete sensor state snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscreteStates {
    /// One bit per state offset.
    pub bits: u16,
    pub event_messages_enabled: bool,
    pub scanning_enabled: bool,
}

impl DiscreteStates {
    pub fn is_set(&self, offset: u8) -> bool {
        offset < 16 && self.bits & (1 << offset) != 0
    }

    pub fn with_bit(mut self, offset: u8) -> Self {
        self.bits |= 1 << offset;
        self
    }
}

/// Which assertion/deassertion events to enable, one bit per state offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMask {
    pub assertions: u16,
    pub deassertions: u16,
}

impl EventMask {
    pub fn for_offset(offset: u8) -> Self {
        Self { assertions: 1 << offset, deassertions: 1 << offset }
    }

    pub fn merged(self, other: Self) -> Self {
        Self {
            assertions: self.assertions | other.assertions,
            deassertions: self.deassertions | other.deassertions,
        }
    }
}

/// Classification of a hot-swap requester sensor: the state offset to watch
/// and the bit value that means "removal requested".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequesterSpec {
    pub offset: u8,
    pub requesting_val: bool,
}

#[async_trait]
pub trait Sensor: Send + Sync {
    /// Stable identifier, unique within the domain.
    fn id(&self) -> &str;

    fn sensor_type(&self) -> u8;

    /// Threshold sensors never act as hot-swap requesters.
    fn is_threshold(&self) -> bool {
        false
    }

    fn event_support(&self) -> EventSupport;

    /// Whether the discrete state at `offset` can be read.
    fn state_readable(&self, offset: u8) -> bool;

    fn hot_swap_requester(&self) -> Option<RequesterSpec> {
        None
    }

    async fn read_states(&self) -> Result<DiscreteStates>;

    /// Turn on event generation and scanning for the given states. Only
    /// meaningful for `PerState`/`EntireSensor` support levels.
    async fn enable_events(&self, mask: EventMask) -> Result<()>;
}

/// A dedicated presence sensor: right type, generates events, and at least
/// one of the present/absent bits is readable.
pub(crate) fn is_presence_sensor(sensor: &dyn Sensor) -> bool {
    sensor.sensor_type() == SENSOR_TYPE_PRESENCE
        && sensor.event_support() != EventSupport::None
        && (sensor.state_readable(0) || sensor.state_readable(1))
}

/// A sensor whose type carries a presence bit at a known offset; returns
/// that offset when usable.
pub(crate) fn presence_bit_for(sensor: &dyn Sensor) -> Option<u8> {
    let bit = match sensor.sensor_type() {
        SENSOR_TYPE_POWER_SUPPLY => 0,
        SENSOR_TYPE_BATTERY | SENSOR_TYPE_SLOT_CONNECTOR => 2,
        _ => return None,
    };
    if sensor.event_support() == EventSupport::None || !sensor.state_readable(bit) {
        return None;
    }
    Some(bit)
}

/// A usable hot-swap requester: non-threshold and self-classified.
pub(crate) fn requester_spec_for(sensor: &dyn Sensor) -> Option<RequesterSpec> {
    if sensor.is_threshold() {
        return None;
    }
    sensor.hot_swap_requester()
}

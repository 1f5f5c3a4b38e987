//! Decoded directory records
//!
//! A directory record either locates one entity (generic, FRU, or management
//! controller device locator) or lists the children of a parent entity
//! (entity association, plain or device-relative). Records are compared by
//! `(entity_id, entity_instance)` first and then field-wise, giving the
//! strict total order the reconciler's merge-join depends on.

use serde::{Deserialize, Serialize};

use crate::id::{DeviceNum, EntityKey};
use crate::text::DeviceText;

/// Number of contained-entity slots in an association record.
pub const CONTAINED_SLOTS: usize = 4;

/// The kind of a directory record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    #[default]
    Unknown,
    Generic,
    Fru,
    Mc,
    Association,
    DeviceRelativeAssociation,
}

/// Capability flags from a management-controller locator record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct McCapabilities {
    pub acpi_system_power_notify_required: bool,
    pub acpi_device_power_notify_required: bool,
    pub controller_logs_init_agent_errors: bool,
    pub log_init_agent_errors_accessing: bool,
    pub global_init: u8,
    pub chassis_device: bool,
    pub bridge: bool,
    pub ipmb_event_generator: bool,
    pub ipmb_event_receiver: bool,
    pub fru_inventory_device: bool,
    pub sel_device: bool,
    pub sdr_repository_device: bool,
    pub sensor_device: bool,
}

/// One contained-entity slot of an association record. A zero entity id
/// marks the slot unused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainedRef {
    pub device_num: DeviceNum,
    pub entity_id: u8,
    pub entity_instance: u8,
}

impl ContainedRef {
    pub fn is_empty(&self) -> bool {
        self.entity_id == 0
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.device_num, self.entity_id, self.entity_instance)
    }
}

/// A decoded directory record.
///
/// Field order matters: the derived `Ord` compares `entity_id` and
/// `entity_instance` first, then the remaining fields, which is exactly the
/// sort the reconciler needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DirRecord {
    pub entity_id: u8,
    pub entity_instance: u8,
    pub kind: RecordKind,
    pub device_num: DeviceNum,

    // Addressing; which fields are meaningful depends on the kind.
    pub access_address: u8,
    pub slave_address: u8,
    pub channel: u8,
    pub lun: u8,
    pub private_bus_id: u8,
    pub fru_device_id: u8,
    pub is_logical_fru: bool,
    pub address_span: u8,

    pub device_type: u8,
    pub device_type_modifier: u8,
    pub oem: u8,
    pub id: DeviceText,

    pub mc: McCapabilities,

    // Association fields.
    pub is_ranges: bool,
    pub linked_ear_exists: bool,
    pub presence_sensor_always_there: bool,
    pub contained: [ContainedRef; CONTAINED_SLOTS],
}

impl DirRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.device_num, self.entity_id, self.entity_instance)
    }

    pub fn is_association(&self) -> bool {
        matches!(
            self.kind,
            RecordKind::Association | RecordKind::DeviceRelativeAssociation
        )
    }

    /// True when this record's device doubles as a FRU inventory device, so
    /// the subject entity carries FRU data.
    pub fn is_fru_bearing(&self) -> bool {
        match self.kind {
            RecordKind::Fru => true,
            RecordKind::Mc => self.mc.fru_inventory_device,
            _ => false,
        }
    }

    /// Expand the contained-entity slots into individual child keys.
    ///
    /// In range form the slots pair up: slots 0/1 and 2/3 each describe an
    /// inclusive instance range within one entity id. In list form each
    /// nonempty slot names one child.
    pub fn contained_keys(&self) -> Vec<EntityKey> {
        let mut keys = Vec::new();
        if self.is_ranges {
            for pair in self.contained.chunks(2) {
                let first = &pair[0];
                let last = &pair[1];
                if first.is_empty() {
                    continue;
                }
                for instance in first.entity_instance..=last.entity_instance {
                    keys.push(EntityKey::new(first.device_num, first.entity_id, instance));
                }
            }
        } else {
            for slot in &self.contained {
                if !slot.is_empty() {
                    keys.push(slot.key());
                }
            }
        }
        keys
    }
}

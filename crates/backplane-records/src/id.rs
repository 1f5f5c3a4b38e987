//! Entity identity types shared between the directory and the registry

use serde::{Deserialize, Serialize};

/// Entity instances at or above this value are device-relative: the same
/// (entity id, instance) pair may exist once per owning controller, so the
/// controller address participates in the identity key.
pub const DEVICE_RELATIVE_INSTANCE: u8 = 0x60;

/// Addresses the management controller a device-relative entity belongs to.
/// All-zero for system-relative entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceNum {
    pub channel: u8,
    pub address: u8,
}

impl DeviceNum {
    pub const SYSTEM: DeviceNum = DeviceNum { channel: 0, address: 0 };

    pub fn new(channel: u8, address: u8) -> Self {
        Self { channel, address }
    }

    pub fn is_system(&self) -> bool {
        self.channel == 0 && self.address == 0
    }
}

/// Unique identity of an entity within one registry.
///
/// `device_num` is zero unless `entity_instance` is device-relative
/// (>= 0x60), in which case it names the owning management controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub device_num: DeviceNum,
    pub entity_id: u8,
    pub entity_instance: u8,
}

impl EntityKey {
    /// Build a key, zeroing the device number for system-relative instances.
    pub fn new(device_num: DeviceNum, entity_id: u8, entity_instance: u8) -> Self {
        let device_num = if entity_instance >= DEVICE_RELATIVE_INSTANCE {
            device_num
        } else {
            DeviceNum::SYSTEM
        };
        Self { device_num, entity_id, entity_instance }
    }

    pub fn system(entity_id: u8, entity_instance: u8) -> Self {
        Self::new(DeviceNum::SYSTEM, entity_id, entity_instance)
    }

    pub fn is_device_relative(&self) -> bool {
        self.entity_instance >= DEVICE_RELATIVE_INSTANCE
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_device_relative() {
            write!(
                f,
                "r{}.{}.{}.{}",
                self.device_num.channel, self.device_num.address, self.entity_id, self.entity_instance
            )
        } else {
            write!(f, "{}.{}", self.entity_id, self.entity_instance)
        }
    }
}

/// Human-readable name for the well-known entity ids.
pub fn entity_id_name(entity_id: u8) -> &'static str {
    match entity_id {
        0x00 => "unspecified",
        0x01 => "other",
        0x02 => "unknown",
        0x03 => "processor",
        0x04 => "disk or disk bay",
        0x05 => "peripheral bay",
        0x06 => "system management module",
        0x07 => "system board",
        0x08 => "memory module",
        0x09 => "processor module",
        0x0a => "power supply",
        0x0b => "add-in card",
        0x0c => "front panel board",
        0x0d => "back panel board",
        0x0e => "power system board",
        0x0f => "drive backplane",
        0x10 => "system internal expansion board",
        0x11 => "other system board",
        0x12 => "processor board",
        0x13 => "power unit",
        0x14 => "power module",
        0x15 => "power management board",
        0x16 => "chassis back panel board",
        0x17 => "system chassis",
        0x18 => "sub-chassis",
        0x19 => "other chassis board",
        0x1a => "disk drive bay",
        0x1b => "peripheral bay",
        0x1c => "device bay",
        0x1d => "fan/cooling device",
        0x1e => "cooling unit",
        0x1f => "cable/interconnect",
        0x20 => "memory device",
        0x21 => "system management software",
        0x22 => "BIOS",
        0x23 => "operating system",
        0x24 => "system bus",
        0x25 => "group",
        0x26 => "remote management device",
        0x27 => "external environment",
        0x28 => "battery",
        0x29 => "processing blade",
        0x2a => "connectivity switch",
        0x2b => "processor/memory module",
        0x2c => "I/O module",
        0x2d => "processor/IO module",
        0x2e => "management controller firmware",
        0x2f => "management channel",
        0x30 => "PCI bus",
        0x31 => "PCI Express bus",
        0x32 => "SCSI bus",
        0x33 => "SATA/SAS bus",
        0x34 => "processor front-side bus",
        _ => "invalid",
    }
}

//! Bit-exact binary codec for directory records
//!
//! The byte layouts here are fixed by the governing platform-management
//! specification and must round-trip exactly for interoperability, including
//! the legacy 1.0 layout of the management-controller locator (which lacks
//! the channel byte, shifting the capability fields down by one).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{DeviceNum, DEVICE_RELATIVE_INSTANCE};
use crate::record::{DirRecord, McCapabilities, RecordKind};
use crate::text::{decode_text, encode_text};

/// On-wire record type of an entity association record.
pub const TYPE_ASSOCIATION: u8 = 0x08;
/// On-wire record type of a device-relative entity association record.
pub const TYPE_DR_ASSOCIATION: u8 = 0x09;
/// On-wire record type of a generic device locator record.
pub const TYPE_GENERIC_LOCATOR: u8 = 0x10;
/// On-wire record type of a FRU device locator record.
pub const TYPE_FRU_LOCATOR: u8 = 0x11;
/// On-wire record type of a management-controller device locator record.
pub const TYPE_MC_LOCATOR: u8 = 0x12;

/// Directory format version a raw record was written under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVersion {
    pub major: u8,
    pub minor: u8,
}

impl RecordVersion {
    pub const V1_0: RecordVersion = RecordVersion { major: 1, minor: 0 };
    pub const V1_5: RecordVersion = RecordVersion { major: 1, minor: 5 };

    fn is_legacy(&self) -> bool {
        self.major == 1 && self.minor == 0
    }
}

/// An undecoded directory record as read from the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub record_type: u8,
    pub version: RecordVersion,
    pub data: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record type {0:#04x} is not an entity directory record")]
    UnsupportedType(u8),
    #[error("record type {record_type:#04x} needs {needed} data bytes, got {got}")]
    TooShort { record_type: u8, needed: usize, got: usize },
}

/// Decode a raw directory record into its structured form.
///
/// Record types other than the five entity kinds are rejected with
/// `UnsupportedType`; directory scans skip those.
pub fn decode_record(raw: &RawRecord) -> Result<DirRecord, CodecError> {
    match raw.record_type {
        TYPE_ASSOCIATION => decode_association(raw),
        TYPE_DR_ASSOCIATION => decode_dr_association(raw),
        TYPE_GENERIC_LOCATOR => decode_generic(raw),
        TYPE_FRU_LOCATOR => decode_fru(raw),
        TYPE_MC_LOCATOR => decode_mc(raw),
        other => Err(CodecError::UnsupportedType(other)),
    }
}

fn need(raw: &RawRecord, needed: usize) -> Result<&[u8], CodecError> {
    if raw.data.len() < needed {
        Err(CodecError::TooShort {
            record_type: raw.record_type,
            needed,
            got: raw.data.len(),
        })
    } else {
        Ok(&raw.data)
    }
}

fn device_num_for(entity_instance: u8, channel: u8, address: u8) -> DeviceNum {
    if entity_instance >= DEVICE_RELATIVE_INSTANCE {
        DeviceNum::new(channel, address)
    } else {
        DeviceNum::SYSTEM
    }
}

fn decode_generic(raw: &RawRecord) -> Result<DirRecord, CodecError> {
    let data = need(raw, 10)?;
    let channel = (data[2] >> 5) | ((data[1] << 3) & 0x08);
    let mut rec = DirRecord {
        kind: RecordKind::Generic,
        entity_id: data[7],
        entity_instance: data[8],
        device_num: device_num_for(data[8], channel, data[0] & 0xfe),
        access_address: data[0] & 0xfe,
        slave_address: data[1] & 0xfe,
        channel,
        lun: (data[2] >> 3) & 0x3,
        private_bus_id: data[2] & 0x7,
        address_span: data[3] & 0x7,
        device_type: data[5],
        device_type_modifier: data[6],
        oem: data[9],
        ..Default::default()
    };
    (rec.id, _) = decode_text(&data[10..]);
    Ok(rec)
}

fn decode_fru(raw: &RawRecord) -> Result<DirRecord, CodecError> {
    let data = need(raw, 10)?;
    let mut rec = DirRecord {
        kind: RecordKind::Fru,
        entity_id: data[7],
        entity_instance: data[8],
        device_num: device_num_for(data[8], data[3] >> 4, data[0] & 0xfe),
        access_address: data[0] & 0xfe,
        fru_device_id: data[1],
        is_logical_fru: data[2] & 0x80 == 0x80,
        lun: (data[2] >> 3) & 0x3,
        private_bus_id: data[2] & 0x7,
        channel: data[3] >> 4,
        device_type: data[5],
        device_type_modifier: data[6],
        oem: data[9],
        ..Default::default()
    };
    (rec.id, _) = decode_text(&data[10..]);
    Ok(rec)
}

fn decode_mc(raw: &RawRecord) -> Result<DirRecord, CodecError> {
    let data = need(raw, 10)?;

    // The 1.0 layout has no channel byte, which shifts the two capability
    // bytes down by one. Everything from the entity id on is shared.
    let (channel, caps0, caps1) = if raw.version.is_legacy() {
        (0, data[1], data[2])
    } else {
        (data[1] & 0xf, data[2], data[3])
    };

    let mut rec = DirRecord {
        kind: RecordKind::Mc,
        entity_id: data[7],
        entity_instance: data[8],
        device_num: device_num_for(data[8], data[1] & 0xf, data[0] & 0xfe),
        slave_address: data[0] & 0xfe,
        channel,
        oem: data[9],
        mc: McCapabilities {
            acpi_system_power_notify_required: caps0 >> 7 & 1 == 1,
            acpi_device_power_notify_required: caps0 >> 6 & 1 == 1,
            controller_logs_init_agent_errors: caps0 >> 3 & 1 == 1,
            log_init_agent_errors_accessing: caps0 >> 2 & 1 == 1,
            global_init: caps0 & 3,
            chassis_device: caps1 >> 7 & 1 == 1,
            bridge: caps1 >> 6 & 1 == 1,
            ipmb_event_generator: caps1 >> 5 & 1 == 1,
            ipmb_event_receiver: caps1 >> 4 & 1 == 1,
            fru_inventory_device: caps1 >> 3 & 1 == 1,
            sel_device: caps1 >> 2 & 1 == 1,
            sdr_repository_device: caps1 >> 1 & 1 == 1,
            sensor_device: caps1 & 1 == 1,
        },
        // A controller doubles as logical FRU device 0 at its own address.
        access_address: data[0] & 0xfe,
        fru_device_id: 0,
        is_logical_fru: true,
        private_bus_id: 0,
        ..Default::default()
    };
    (rec.id, _) = decode_text(&data[10..]);
    Ok(rec)
}

fn decode_association(raw: &RawRecord) -> Result<DirRecord, CodecError> {
    let data = need(raw, 11)?;
    let mut rec = DirRecord {
        kind: RecordKind::Association,
        entity_id: data[0],
        entity_instance: data[1],
        is_ranges: data[2] & 0x80 == 0x80,
        linked_ear_exists: data[2] & 0x40 == 0x40,
        presence_sensor_always_there: data[2] & 0x20 == 0x20,
        ..Default::default()
    };
    for (i, slot) in rec.contained.iter_mut().enumerate() {
        let pos = 3 + i * 2;
        slot.entity_id = data[pos];
        slot.entity_instance = data[pos + 1];
    }
    Ok(rec)
}

fn decode_dr_association(raw: &RawRecord) -> Result<DirRecord, CodecError> {
    let data = need(raw, 21)?;
    let mut rec = DirRecord {
        kind: RecordKind::DeviceRelativeAssociation,
        entity_id: data[0],
        entity_instance: data[1],
        device_num: device_num_for(data[1], data[3] >> 4, data[2] & 0xfe),
        is_ranges: data[4] & 0x80 == 0x80,
        linked_ear_exists: data[4] & 0x40 == 0x40,
        presence_sensor_always_there: data[4] & 0x20 == 0x20,
        ..Default::default()
    };
    for (i, slot) in rec.contained.iter_mut().enumerate() {
        let pos = 5 + i * 4;
        slot.entity_id = data[pos + 2];
        slot.entity_instance = data[pos + 3];
        if slot.entity_instance >= DEVICE_RELATIVE_INSTANCE {
            slot.device_num = DeviceNum::new(data[pos + 1], data[pos]);
        }
    }
    Ok(rec)
}

/// Encode a locator record's payload back into its on-wire form (1.5
/// layout). Association kinds are directory input only and have no encoder;
/// encoding one returns `UnsupportedType`.
pub fn encode_record(rec: &DirRecord) -> Result<RawRecord, CodecError> {
    match rec.kind {
        RecordKind::Generic => Ok(encode_generic(rec)),
        RecordKind::Fru => Ok(encode_fru(rec)),
        RecordKind::Mc => Ok(encode_mc(rec)),
        RecordKind::Association | RecordKind::DeviceRelativeAssociation | RecordKind::Unknown => {
            Err(CodecError::UnsupportedType(match rec.kind {
                RecordKind::Association => TYPE_ASSOCIATION,
                RecordKind::DeviceRelativeAssociation => TYPE_DR_ASSOCIATION,
                _ => 0,
            }))
        }
    }
}

fn encode_generic(rec: &DirRecord) -> RawRecord {
    let mut data = vec![
        rec.access_address,
        rec.slave_address | (rec.channel >> 3),
        (rec.channel << 5) | (rec.lun << 3) | rec.private_bus_id,
        rec.address_span & 0x7,
        0,
        rec.device_type,
        rec.device_type_modifier,
        rec.entity_id,
        rec.entity_instance,
        rec.oem,
    ];
    encode_text(&rec.id, &mut data);
    RawRecord { record_type: TYPE_GENERIC_LOCATOR, version: RecordVersion::V1_5, data }
}

fn encode_fru(rec: &DirRecord) -> RawRecord {
    let mut data = vec![
        rec.access_address,
        rec.fru_device_id,
        ((rec.is_logical_fru as u8) << 7) | (rec.lun << 3) | rec.private_bus_id,
        rec.channel << 4,
        0,
        rec.device_type,
        rec.device_type_modifier,
        rec.entity_id,
        rec.entity_instance,
        rec.oem,
    ];
    encode_text(&rec.id, &mut data);
    RawRecord { record_type: TYPE_FRU_LOCATOR, version: RecordVersion::V1_5, data }
}

fn encode_mc(rec: &DirRecord) -> RawRecord {
    let m = &rec.mc;
    let mut data = vec![
        rec.slave_address,
        rec.channel & 0xf,
        ((m.acpi_system_power_notify_required as u8) << 7)
            | ((m.acpi_device_power_notify_required as u8) << 6)
            | ((m.controller_logs_init_agent_errors as u8) << 3)
            | ((m.log_init_agent_errors_accessing as u8) << 2)
            | m.global_init,
        ((m.chassis_device as u8) << 7)
            | ((m.bridge as u8) << 6)
            | ((m.ipmb_event_generator as u8) << 5)
            | ((m.ipmb_event_receiver as u8) << 4)
            | ((m.fru_inventory_device as u8) << 3)
            | ((m.sel_device as u8) << 2)
            | ((m.sdr_repository_device as u8) << 1)
            | m.sensor_device as u8,
        0,
        0,
        0,
        rec.entity_id,
        rec.entity_instance,
        rec.oem,
    ];
    encode_text(&rec.id, &mut data);
    RawRecord { record_type: TYPE_MC_LOCATOR, version: RecordVersion::V1_5, data }
}

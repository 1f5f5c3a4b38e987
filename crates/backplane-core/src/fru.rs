//! FRU inventory collaborator contract

use anyhow::Result;
use async_trait::async_trait;
use backplane_records::{DirRecord, RecordKind};
use serde::{Deserialize, Serialize};

/// Addressing tuple for one FRU inventory device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FruAddress {
    pub is_logical: bool,
    pub channel: u8,
    pub access_address: u8,
    pub fru_device_id: u8,
    pub lun: u8,
    pub private_bus_id: u8,
}

impl FruAddress {
    /// FRU addressing implied by a locator record. Controller locators
    /// address logical FRU device 0 at the controller's own address.
    pub fn from_record(rec: &DirRecord) -> Self {
        match rec.kind {
            RecordKind::Mc => Self {
                is_logical: true,
                channel: rec.channel,
                access_address: rec.slave_address,
                fru_device_id: 0,
                lun: rec.lun,
                private_bus_id: 0,
            },
            _ => Self {
                is_logical: rec.is_logical_fru,
                channel: rec.channel,
                access_address: rec.access_address,
                fru_device_id: rec.fru_device_id,
                lun: rec.lun,
                private_bus_id: rec.private_bus_id,
            },
        }
    }
}

/// Parsed FRU inventory snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FruData {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub part_number: Option<String>,
    /// Unparsed inventory area for consumers with their own decoders.
    pub raw: Vec<u8>,
}

#[async_trait]
pub trait FruSource: Send + Sync {
    async fn fetch(&self, addr: &FruAddress) -> Result<FruData>;
}

//! Backplane Records - Directory record model and binary codec
//!
//! This crate provides the data model for the management directory:
//! - Entity identity types shared with the registry
//! - Decoded directory records (device locators and entity associations)
//! - The bit-exact binary codec for the five on-wire record kinds
//! - The packed device-id text field codec

pub mod codec;
pub mod id;
pub mod record;
pub mod text;

pub use codec::{decode_record, encode_record, CodecError, RawRecord, RecordVersion};
pub use id::{entity_id_name, DeviceNum, EntityKey};
pub use record::{ContainedRef, DirRecord, McCapabilities, RecordKind};
pub use text::{DeviceText, TextTag};

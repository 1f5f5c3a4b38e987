//! Packed device-id text field codec
//!
//! Directory records carry a short textual id encoded as a type/length byte
//! (bits 7:6 type tag, bits 4:0 data length) followed by the packed data.

use serde::{Deserialize, Serialize};

/// Maximum number of data bytes the 5-bit length field can describe.
pub const MAX_TEXT_DATA: usize = 0x1f;

/// Encoding tag for a device-id text field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextTag {
    /// Raw unicode bytes, uninterpreted
    Unicode,
    /// BCD plus: one character per nibble
    BcdPlus,
    /// 6-bit packed ASCII, four characters per three bytes
    Packed6,
    /// 8-bit ASCII + Latin-1, one character per byte
    Ascii,
}

impl TextTag {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => TextTag::Unicode,
            1 => TextTag::BcdPlus,
            2 => TextTag::Packed6,
            _ => TextTag::Ascii,
        }
    }

    fn bits(self) -> u8 {
        match self {
            TextTag::Unicode => 0,
            TextTag::BcdPlus => 1,
            TextTag::Packed6 => 2,
            TextTag::Ascii => 3,
        }
    }
}

/// A decoded device-id text field: the tag plus the unpacked characters
/// (raw bytes for the unicode tag).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceText {
    pub tag: TextTag,
    pub chars: Vec<u8>,
}

impl Default for TextTag {
    fn default() -> Self {
        TextTag::Ascii
    }
}

impl DeviceText {
    pub fn ascii(s: &str) -> Self {
        Self { tag: TextTag::Ascii, chars: s.as_bytes().to_vec() }
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

impl std::fmt::Display for DeviceText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.chars))
    }
}

const BCD_CHARS: &[u8; 13] = b"0123456789 -.";
const PACKED6_BASE: u8 = 0x20;

/// Decode a text field from `buf`, returning the field and the number of
/// bytes consumed (type/length byte included). An empty or truncated buffer
/// decodes to an empty ASCII field.
pub fn decode_text(buf: &[u8]) -> (DeviceText, usize) {
    let Some(&tl) = buf.first() else {
        return (DeviceText::default(), 0);
    };
    let tag = TextTag::from_bits(tl >> 6);
    let len = (tl & 0x1f) as usize;
    let data = &buf[1..];
    let len = len.min(data.len());
    let data = &data[..len];

    let chars = match tag {
        TextTag::Unicode | TextTag::Ascii => data.to_vec(),
        TextTag::BcdPlus => {
            let mut out = Vec::with_capacity(len * 2);
            for &b in data {
                for nib in [b & 0xf, b >> 4] {
                    if nib < BCD_CHARS.len() as u8 {
                        out.push(BCD_CHARS[nib as usize]);
                    }
                }
            }
            out
        }
        TextTag::Packed6 => {
            let mut out = Vec::with_capacity(len * 4 / 3 + 1);
            for chunk in data.chunks(3) {
                let b0 = chunk[0];
                out.push((b0 & 0x3f) + PACKED6_BASE);
                if chunk.len() > 1 {
                    let b1 = chunk[1];
                    out.push(((b0 >> 6) | ((b1 & 0x0f) << 2)) + PACKED6_BASE);
                    if chunk.len() > 2 {
                        let b2 = chunk[2];
                        out.push(((b1 >> 4) | ((b2 & 0x03) << 4)) + PACKED6_BASE);
                        out.push((b2 >> 2) + PACKED6_BASE);
                    }
                }
            }
            // A full 3-byte group always unpacks to 4 characters, so strings
            // whose length is not a multiple of 4 come back with zero-value
            // pad characters at the end. Those decode as spaces; trim them.
            while out.last() == Some(&PACKED6_BASE) {
                out.pop();
            }
            out
        }
    };

    (DeviceText { tag, chars }, 1 + len)
}

/// Encode a text field, appending the type/length byte and packed data to
/// `out`. Characters that do not fit the tag's alphabet, and data past the
/// 5-bit length limit, are dropped.
pub fn encode_text(text: &DeviceText, out: &mut Vec<u8>) {
    let data: Vec<u8> = match text.tag {
        TextTag::Unicode | TextTag::Ascii => {
            text.chars.iter().copied().take(MAX_TEXT_DATA).collect()
        }
        TextTag::BcdPlus => {
            let nibbles: Vec<u8> = text
                .chars
                .iter()
                .filter_map(|c| BCD_CHARS.iter().position(|b| b == c).map(|p| p as u8))
                .collect();
            let mut bytes = Vec::with_capacity((nibbles.len() + 1) / 2);
            for pair in nibbles.chunks(2) {
                let hi = pair.get(1).copied().unwrap_or(0xf);
                bytes.push((hi << 4) | pair[0]);
            }
            bytes.truncate(MAX_TEXT_DATA);
            bytes
        }
        TextTag::Packed6 => {
            let vals: Vec<u8> = text
                .chars
                .iter()
                .filter(|&&c| (PACKED6_BASE..PACKED6_BASE + 0x40).contains(&c))
                .map(|&c| c - PACKED6_BASE)
                .collect();
            let mut bytes = Vec::with_capacity(vals.len() * 3 / 4 + 1);
            for chunk in vals.chunks(4) {
                let v0 = chunk[0];
                let v1 = chunk.get(1).copied().unwrap_or(0);
                let v2 = chunk.get(2).copied().unwrap_or(0);
                let v3 = chunk.get(3).copied().unwrap_or(0);
                bytes.push(v0 | (v1 << 6));
                if chunk.len() > 1 {
                    bytes.push((v1 >> 2) | (v2 << 4));
                }
                if chunk.len() > 2 {
                    bytes.push((v2 >> 4) | (v3 << 2));
                }
            }
            bytes.truncate(MAX_TEXT_DATA);
            bytes
        }
    };

    out.push((text.tag.bits() << 6) | data.len() as u8);
    out.extend_from_slice(&data);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(text: DeviceText) -> DeviceText {
        let mut buf = Vec::new();
        encode_text(&text, &mut buf);
        let (decoded, used) = decode_text(&buf);
        assert_eq!(used, buf.len());
        decoded
    }

    #[test]
    fn test_ascii_roundtrip() {
        let text = DeviceText::ascii("PS 1");
        assert_eq!(roundtrip(text.clone()), text);
    }

    #[test]
    fn test_ascii_tag_byte() {
        let mut buf = Vec::new();
        encode_text(&DeviceText::ascii("AB"), &mut buf);
        assert_eq!(buf, vec![0xc2, b'A', b'B']);
    }

    #[test]
    fn test_bcd_roundtrip_even() {
        let text = DeviceText { tag: TextTag::BcdPlus, chars: b"12-4".to_vec() };
        assert_eq!(roundtrip(text.clone()), text);
    }

    #[test]
    fn test_packed6_roundtrip() {
        let text = DeviceText { tag: TextTag::Packed6, chars: b"SLOT-12".to_vec() };
        assert_eq!(roundtrip(text.clone()), text);
    }

    #[test]
    fn test_empty_buffer() {
        let (text, used) = decode_text(&[]);
        assert_eq!(used, 0);
        assert!(text.is_empty());
    }

    #[test]
    fn test_length_clamped_to_buffer() {
        // Claims 10 data bytes but only 2 follow.
        let (text, used) = decode_text(&[0xca, b'x', b'y']);
        assert_eq!(text.chars, b"xy");
        assert_eq!(used, 3);
    }
}

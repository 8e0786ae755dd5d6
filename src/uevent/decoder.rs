//! libudev Wire Decoder
//!
//! Messages forwarded by udevd on the netlink monitor group carry a fixed
//! header followed by the device properties:
//!
//! ```text
//! 0        8          12        16       17
//! +--------+----------+---------+--------+------------------------------+
//! |libudev\0| magic BE | ...     | offset | ... KEY=VALUE\0KEY=VALUE\0    |
//! +--------+----------+---------+--------+------------------------------+
//! ```
//!
//! The payload starts at `offset` and is a sequence of NUL-terminated
//! `KEY=VALUE` (or bare `KEY`) tokens.

use super::event::UEvent;
use crate::error::{Error, Result};
use std::collections::BTreeMap;

// =============================================================================
// Constants
// =============================================================================

/// Leading signature of udev monitor messages
pub const LIBUDEV_SIGNATURE: &[u8; 8] = b"libudev\0";

/// Magic stored big-endian at bytes 8..12
pub const LIBUDEV_MAGIC: u32 = 0xfeed_cafe;

/// Shortest message that can hold the header
pub const MIN_MESSAGE_LEN: usize = 40;

/// Position of the payload offset byte
const OFFSET_INDEX: usize = 16;

// =============================================================================
// Decoding
// =============================================================================

/// Decode the property map of a raw monitor message
///
/// Duplicate keys resolve to the last value; a bare `KEY` maps to an empty
/// value. Header violations fail without returning any properties.
pub fn parse(msg: &[u8]) -> Result<BTreeMap<String, String>> {
    if msg.len() < MIN_MESSAGE_LEN {
        return Err(Error::MessageTooShort {
            len: msg.len(),
            min: MIN_MESSAGE_LEN,
        });
    }

    if !msg.starts_with(LIBUDEV_SIGNATURE) {
        return Err(Error::MissingSignature);
    }

    let magic = u32::from_be_bytes([msg[8], msg[9], msg[10], msg[11]]);
    if magic != LIBUDEV_MAGIC {
        return Err(Error::MagicMismatch {
            expected: LIBUDEV_MAGIC,
            found: magic,
        });
    }

    let offset = msg[OFFSET_INDEX] as usize;
    if offset <= OFFSET_INDEX || offset > msg.len() {
        return Err(Error::InvalidPayloadOffset {
            offset,
            len: msg.len(),
        });
    }

    let mut properties = BTreeMap::new();
    for field in msg[offset..].split(|b| *b == 0) {
        if field.is_empty() {
            continue;
        }
        let field = String::from_utf8_lossy(field);
        match field.split_once('=') {
            Some((key, value)) => properties.insert(key.to_string(), value.to_string()),
            None => properties.insert(field.to_string(), String::new()),
        };
    }

    Ok(properties)
}

/// Decode a raw monitor message into a block-device event
pub fn decode(msg: &[u8]) -> Result<UEvent> {
    UEvent::from_properties(parse(msg)?)
}

/// Encode properties as a monitor message
///
/// Produces the framing [`parse`] accepts; used to feed synthetic events
/// through the same path as kernel ones.
pub fn encode(properties: &[(&str, &str)]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(MIN_MESSAGE_LEN + properties.len() * 32);
    msg.extend_from_slice(LIBUDEV_SIGNATURE);
    msg.extend_from_slice(&LIBUDEV_MAGIC.to_be_bytes());
    msg.resize(MIN_MESSAGE_LEN, 0);
    msg[OFFSET_INDEX] = MIN_MESSAGE_LEN as u8;
    for (key, value) in properties {
        msg.extend_from_slice(key.as_bytes());
        msg.push(b'=');
        msg.extend_from_slice(value.as_bytes());
        msg.push(0);
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uevent::event::Action;
    use assert_matches::assert_matches;

    fn header(offset: u8) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(LIBUDEV_SIGNATURE);
        msg.extend_from_slice(&LIBUDEV_MAGIC.to_be_bytes());
        msg.resize(MIN_MESSAGE_LEN, 0);
        msg[OFFSET_INDEX] = offset;
        msg
    }

    #[test]
    fn test_parse_tokens() {
        let mut msg = header(40);
        msg.extend_from_slice(b"ACTION=add\0DEVPATH=/devices/virtual/block/dm-0\0BARE\0KEY=a=b\0ACTION=change\0\0");

        let props = parse(&msg).unwrap();
        assert_eq!(props["ACTION"], "change");
        assert_eq!(props["DEVPATH"], "/devices/virtual/block/dm-0");
        assert_eq!(props["BARE"], "");
        assert_eq!(props["KEY"], "a=b");
        assert_eq!(props.len(), 4);
    }

    #[test]
    fn test_payload_may_start_inside_header_padding() {
        let mut msg = header(17);
        msg[17..24].copy_from_slice(b"A=1\0B=2");
        let props = parse(&msg).unwrap();
        assert_eq!(props["A"], "1");
    }

    #[test]
    fn test_header_violations() {
        assert_matches!(parse(&[0u8; 10]), Err(Error::MessageTooShort { len: 10, .. }));

        let mut msg = header(40);
        msg[0] = b'x';
        assert_matches!(parse(&msg), Err(Error::MissingSignature));

        let mut msg = header(40);
        msg[8..12].copy_from_slice(&0xdead_beefu32.to_be_bytes());
        assert_matches!(
            parse(&msg),
            Err(Error::MagicMismatch { found: 0xdead_beef, .. })
        );

        assert_matches!(
            parse(&header(16)),
            Err(Error::InvalidPayloadOffset { offset: 16, .. })
        );
        assert_matches!(
            parse(&header(41)),
            Err(Error::InvalidPayloadOffset { offset: 41, len: 40 })
        );
        assert!(parse(&header(40)).unwrap().is_empty());
    }

    #[test]
    fn test_decode_block_event() {
        let msg = encode(&[
            ("ACTION", "remove"),
            ("SUBSYSTEM", "block"),
            ("DEVPATH", "/devices/virtual/block/loop3"),
            ("MAJOR", "7"),
            ("MINOR", "3"),
        ]);
        let event = decode(&msg).unwrap();
        assert_eq!(event.action, Action::Remove);
        assert_eq!(event.name(), "loop3");
        assert_eq!(event.get("MAJOR"), "7");
    }

    #[test]
    fn test_decode_non_block_event() {
        let msg = encode(&[
            ("ACTION", "add"),
            ("SUBSYSTEM", "usb"),
            ("DEVPATH", "/devices/pci0000:00/usb1"),
        ]);
        let err = decode(&msg).unwrap_err();
        assert_matches!(err, Error::NonBlockDevice { .. });
        assert!(err.is_decode_error());
    }
}

//! # Durable record codec
//!
//! Length-prefixed, little-endian wire format for one dispatched item, per
//! §4.7:
//!
//! ```text
//!   1 byte    version = 0x01
//!   u32 len + UTF-8 bytes   destination URI
//!   u32 len + UTF-8 bytes   subscription location
//!   u32 len + UTF-8 bytes   MIME type
//!   u32 len + raw bytes     body
//!   0..N  (u32 len + UTF-8, u32 len + UTF-8)   header key/value pairs
//! ```
//!
//! Event metadata (id, channel, resource, origins, recipients, via) rides in
//! the header key/value pairs using the same `X-Dream-Event-*` names used on
//! the outbound HTTP POST (§6), so the record is, byte for byte, "replay the
//! POST this would have made."
//!
//! Per the Open Question resolution recorded in SPEC_FULL.md §8.2, each
//! on-disk entry additionally carries a CRC32 trailer over the record bytes
//! (an additive change the spec explicitly permits). A CRC mismatch is
//! treated identically to a truncated tail record: discarded on recovery.

use crc32fast::Hasher;

use crate::error::DispatchError;
use crate::event::{DispatcherEvent, Payload};
use crate::queue::DispatchItem;
use crate::transport::headers;

/// Current supported record version.
pub const RECORD_VERSION: u8 = 0x01;

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn read_len_prefixed<'a>(buf: &'a [u8], cursor: &mut usize) -> Option<&'a [u8]> {
    if buf.len() < *cursor + 4 {
        return None;
    }
    let len = u32::from_le_bytes(buf[*cursor..*cursor + 4].try_into().ok()?) as usize;
    *cursor += 4;
    if buf.len() < *cursor + len {
        return None;
    }
    let slice = &buf[*cursor..*cursor + len];
    *cursor += len;
    Some(slice)
}

/// Encode `item` into the record body (without the outer segment framing or
/// CRC trailer — see [`crate::durable::segment`] for that).
pub fn encode(item: &DispatchItem) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + item.event.payload().body.len());
    buf.push(RECORD_VERSION);
    write_len_prefixed(&mut buf, item.destination_uri.as_bytes());
    write_len_prefixed(&mut buf, item.location.as_bytes());
    write_len_prefixed(&mut buf, item.event.payload().content_type.as_bytes());
    write_len_prefixed(&mut buf, &item.event.payload().body);

    for (key, value) in headers::event_headers(&item.event) {
        write_len_prefixed(&mut buf, key.as_bytes());
        write_len_prefixed(&mut buf, value.as_bytes());
    }

    buf
}

/// Compute the additive CRC32 trailer for `record_bytes`.
pub fn checksum(record_bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(record_bytes);
    hasher.finalize()
}

/// Decode a record body (as produced by [`encode`]) back into a
/// [`DispatchItem`].
///
/// Returns [`DispatchError::UnsupportedRecordVersion`] if the version byte
/// doesn't match [`RECORD_VERSION`]; any other structural problem (short
/// buffer, invalid UTF-8, missing required header) is reported the same way
/// callers treat a truncated tail record — the caller decides whether that
/// means "skip this entry" or "stop reading this segment."
pub fn decode(record_bytes: &[u8], segment_name: &str) -> Result<DispatchItem, DispatchError> {
    if record_bytes.is_empty() {
        return Err(DispatchError::QueueIoError {
            location: segment_name.to_string(),
            details: "empty record".into(),
        });
    }

    let version = record_bytes[0];
    if version != RECORD_VERSION {
        return Err(DispatchError::UnsupportedRecordVersion {
            segment: segment_name.to_string(),
            found: version,
            expected: RECORD_VERSION,
        });
    }

    let mut cursor = 1usize;
    let destination_uri = read_len_prefixed(record_bytes, &mut cursor)
        .and_then(|b| std::str::from_utf8(b).ok())
        .ok_or_else(|| truncated(segment_name))?
        .to_string();
    let location = read_len_prefixed(record_bytes, &mut cursor)
        .and_then(|b| std::str::from_utf8(b).ok())
        .ok_or_else(|| truncated(segment_name))?
        .to_string();
    let content_type = read_len_prefixed(record_bytes, &mut cursor)
        .and_then(|b| std::str::from_utf8(b).ok())
        .ok_or_else(|| truncated(segment_name))?
        .to_string();
    let body = read_len_prefixed(record_bytes, &mut cursor)
        .ok_or_else(|| truncated(segment_name))?
        .to_vec();

    let mut header_pairs = Vec::new();
    while cursor < record_bytes.len() {
        let key = read_len_prefixed(record_bytes, &mut cursor)
            .and_then(|b| std::str::from_utf8(b).ok())
            .ok_or_else(|| truncated(segment_name))?
            .to_string();
        let value = read_len_prefixed(record_bytes, &mut cursor)
            .and_then(|b| std::str::from_utf8(b).ok())
            .ok_or_else(|| truncated(segment_name))?
            .to_string();
        header_pairs.push((key, value));
    }

    let fields = headers::headers_to_event_fields(&header_pairs, Payload::new(content_type, body))?;
    let event = DispatcherEvent::normalise(fields)?;

    Ok(DispatchItem {
        destination_uri,
        event,
        location,
    })
}

fn truncated(segment_name: &str) -> DispatchError {
    DispatchError::QueueIoError {
        location: segment_name.to_string(),
        details: "truncated record".into(),
    }
}

#[cfg(test)]
mod should {
    use super::*;
    use crate::event::{EventFields as Fields, Payload};

    fn sample_item() -> DispatchItem {
        let event = DispatcherEvent::normalise(Fields {
            channel_uri: "event://x/foo".into(),
            origins: vec!["http://pub/".into()],
            recipients: vec!["user:alice".into()],
            via: vec!["http://dispatcher/".into()],
            payload: Payload::new("application/json", b"{\"hello\":true}".to_vec()),
            ..Default::default()
        })
        .unwrap();
        DispatchItem {
            destination_uri: "http://sub1/".into(),
            event,
            location: "L1".into(),
        }
    }

    #[test]
    fn round_trips_byte_exact_metadata_and_body() {
        let item = sample_item();
        let encoded = encode(&item);
        let decoded = decode(&encoded, "seg-1").unwrap();

        assert_eq!(decoded.destination_uri, item.destination_uri);
        assert_eq!(decoded.location, item.location);
        assert_eq!(decoded.event.channel_uri(), item.event.channel_uri());
        assert_eq!(decoded.event.origins(), item.event.origins());
        assert_eq!(decoded.event.recipients(), item.event.recipients());
        assert_eq!(decoded.event.via(), item.event.via());
        assert_eq!(decoded.event.payload(), item.event.payload());
    }

    #[test]
    fn rejects_unsupported_version() {
        let item = sample_item();
        let mut encoded = encode(&item);
        encoded[0] = 0xFF;
        let err = decode(&encoded, "seg-1").unwrap_err();
        assert!(matches!(err, DispatchError::UnsupportedRecordVersion { .. }));
    }

    #[test]
    fn rejects_truncated_record() {
        let item = sample_item();
        let mut encoded = encode(&item);
        encoded.truncate(encoded.len() - 2);
        assert!(decode(&encoded, "seg-1").is_err());
    }

    #[test]
    fn checksum_changes_when_bytes_change() {
        let item = sample_item();
        let encoded = encode(&item);
        let mut tampered = encoded.clone();
        tampered[5] ^= 0xFF;
        assert_ne!(checksum(&encoded), checksum(&tampered));
    }
}

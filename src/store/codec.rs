//! Record frame codec
//!
//! Every durable record is a self-describing byte frame:
//!
//! ```text
//! ┌──────────┬─────────┬─────────┬─────────┬────────────┬───────────┐
//! │ magic 4B │ ver 1B  │ flags 1B│ len 4B  │ body (len) │ crc32 4B  │
//! └──────────┴─────────┴─────────┴─────────┴────────────┴───────────┘
//! ```
//!
//! The body is the bincode serialization of a [`MemoryRecord`] or
//! [`Tombstone`]. Bodies at or above the compression threshold are stored
//! lz4-block-compressed with the compressed flag set; `len` is then the
//! compressed length. The CRC always covers the *uncompressed* body, so
//! corruption is caught even when decompression happens to succeed.

use crate::constants::{MAX_COMPRESSION_RATIO, MAX_DECOMPRESSED_SIZE};
use crate::errors::{MemoryError, Result};
use crate::store::types::{MemoryRecord, Tombstone};

/// Frame magic: "MCR1".
pub const FRAME_MAGIC: [u8; 4] = *b"MCR1";

/// Current frame version.
pub const FRAME_VERSION: u8 = 1;

/// Bytes before the body: magic + version + flags + len.
pub const FRAME_HEADER_LEN: usize = 10;

/// Trailing CRC bytes.
pub const FRAME_TRAILER_LEN: usize = 4;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FLAG_TOMBSTONE: u8 = 0b0000_0010;

/// Compression policy for encoding.
#[derive(Debug, Clone, Copy)]
pub struct CodecOptions {
    pub enable_compression: bool,
    pub compression_threshold: usize,
}

/// A decoded frame.
#[derive(Debug)]
pub enum Frame {
    Put(MemoryRecord),
    Tombstone(Tombstone),
}

/// Encode a memory record into a frame.
pub fn encode_record(record: &MemoryRecord, opts: CodecOptions) -> Result<Vec<u8>> {
    let body =
        bincode::serialize(record).map_err(|e| MemoryError::Internal(anyhow::anyhow!(e)))?;
    encode_frame(&body, 0, opts)
}

/// Encode a tombstone frame. Tombstones are tiny and never compressed.
pub fn encode_tombstone(tombstone: &Tombstone) -> Result<Vec<u8>> {
    let body =
        bincode::serialize(tombstone).map_err(|e| MemoryError::Internal(anyhow::anyhow!(e)))?;
    encode_frame(
        &body,
        FLAG_TOMBSTONE,
        CodecOptions {
            enable_compression: false,
            compression_threshold: usize::MAX,
        },
    )
}

fn encode_frame(body: &[u8], mut flags: u8, opts: CodecOptions) -> Result<Vec<u8>> {
    let crc = crc32fast::hash(body);

    let stored: Vec<u8>;
    let stored_body: &[u8] =
        if opts.enable_compression && body.len() >= opts.compression_threshold {
            stored = lz4::block::compress(body, None, false)
                .map_err(|e| MemoryError::Io(e.to_string()))?;
            flags |= FLAG_COMPRESSED;
            &stored
        } else {
            body
        };

    let mut frame =
        Vec::with_capacity(FRAME_HEADER_LEN + stored_body.len() + FRAME_TRAILER_LEN);
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.push(FRAME_VERSION);
    frame.push(flags);
    frame.extend_from_slice(&(stored_body.len() as u32).to_le_bytes());
    frame.extend_from_slice(stored_body);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Decode a complete frame, verifying magic, version and CRC.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < FRAME_HEADER_LEN + FRAME_TRAILER_LEN {
        return Err(corrupt(format!("frame truncated at {} bytes", bytes.len())));
    }
    if bytes[0..4] != FRAME_MAGIC {
        return Err(corrupt(format!("bad magic {:02x?}", &bytes[0..4])));
    }
    let version = bytes[4];
    if version != FRAME_VERSION {
        return Err(corrupt(format!("unsupported frame version {version}")));
    }
    let flags = bytes[5];
    let len = u32::from_le_bytes(bytes[6..10].try_into().unwrap()) as usize;
    let expected = FRAME_HEADER_LEN + len + FRAME_TRAILER_LEN;
    if bytes.len() != expected {
        return Err(corrupt(format!(
            "frame length mismatch: have {}, header says {expected}",
            bytes.len()
        )));
    }

    let stored_body = &bytes[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
    let crc = u32::from_le_bytes(bytes[FRAME_HEADER_LEN + len..].try_into().unwrap());

    let inflated: Vec<u8>;
    let body: &[u8] = if flags & FLAG_COMPRESSED != 0 {
        inflated = decompress(stored_body)?;
        &inflated
    } else {
        stored_body
    };

    if crc32fast::hash(body) != crc {
        return Err(corrupt("crc mismatch".to_string()));
    }

    if flags & FLAG_TOMBSTONE != 0 {
        let tombstone: Tombstone = bincode::deserialize(body)
            .map_err(|e| corrupt(format!("tombstone body: {e}")))?;
        Ok(Frame::Tombstone(tombstone))
    } else {
        let record: MemoryRecord =
            bincode::deserialize(body).map_err(|e| corrupt(format!("record body: {e}")))?;
        Ok(Frame::Put(record))
    }
}

fn decompress(stored: &[u8]) -> Result<Vec<u8>> {
    let body = lz4::block::decompress(stored, Some(MAX_DECOMPRESSED_SIZE as i32))
        .map_err(|e| corrupt(format!("lz4 decompress: {e}")))?;
    if body.len() > MAX_DECOMPRESSED_SIZE
        || (!stored.is_empty() && body.len() / stored.len() > MAX_COMPRESSION_RATIO)
    {
        return Err(corrupt(format!(
            "decompressed size {} exceeds safety limits",
            body.len()
        )));
    }
    Ok(body)
}

fn corrupt(detail: String) -> MemoryError {
    MemoryError::CorruptRecord(detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::store::types::MemoryId;
    use chrono::Utc;
    use serde_json::Map;

    fn sample_record(content: &str) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            id: MemoryId::generate(&SystemClock),
            user_id: "u1".to_string(),
            session_id: "s1".to_string(),
            content: content.to_string(),
            metadata: Map::new(),
            importance: 0.8,
            created_at: now,
            expires_at: None,
            last_accessed_at: now,
            access_count: 0,
            importance_at: now,
        }
    }

    fn opts(compress: bool) -> CodecOptions {
        CodecOptions {
            enable_compression: compress,
            compression_threshold: 1024,
        }
    }

    #[test]
    fn test_roundtrip_uncompressed() {
        let record = sample_record("short note");
        let frame = encode_record(&record, opts(true)).unwrap();
        // Below threshold: compressed flag stays clear.
        assert_eq!(frame[5] & FLAG_COMPRESSED, 0);

        match decode_frame(&frame).unwrap() {
            Frame::Put(decoded) => {
                assert_eq!(decoded.id, record.id);
                assert_eq!(decoded.content, record.content);
            }
            Frame::Tombstone(_) => panic!("expected a record frame"),
        }
    }

    #[test]
    fn test_roundtrip_compressed() {
        let record = sample_record(&"memory decay ".repeat(500));
        let frame = encode_record(&record, opts(true)).unwrap();
        assert_ne!(frame[5] & FLAG_COMPRESSED, 0);

        match decode_frame(&frame).unwrap() {
            Frame::Put(decoded) => assert_eq!(decoded.content, record.content),
            Frame::Tombstone(_) => panic!("expected a record frame"),
        }
    }

    #[test]
    fn test_metadata_survives_binary_roundtrip() {
        let mut record = sample_record("note with metadata");
        record
            .metadata
            .insert("tags".into(), serde_json::json!(["alpha", "beta"]));
        record.metadata.insert("depth".into(), serde_json::json!(3));
        let frame = encode_record(&record, opts(true)).unwrap();
        match decode_frame(&frame).unwrap() {
            Frame::Put(decoded) => assert_eq!(decoded.metadata, record.metadata),
            Frame::Tombstone(_) => panic!("expected a record frame"),
        }
    }

    #[test]
    fn test_compression_disabled() {
        let record = sample_record(&"x".repeat(4096));
        let frame = encode_record(&record, opts(false)).unwrap();
        assert_eq!(frame[5] & FLAG_COMPRESSED, 0);
    }

    #[test]
    fn test_tombstone_roundtrip() {
        let clock = ManualClock::starting_now();
        let id = MemoryId::generate(clock.as_ref());
        let frame = encode_tombstone(&Tombstone { id }).unwrap();
        match decode_frame(&frame).unwrap() {
            Frame::Tombstone(t) => assert_eq!(t.id, id),
            Frame::Put(_) => panic!("expected a tombstone frame"),
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let record = sample_record("note");
        let mut frame = encode_record(&record, opts(true)).unwrap();
        frame[0] = b'X';
        let err = decode_frame(&frame).unwrap_err();
        assert_eq!(err.code(), "CORRUPT_RECORD");
    }

    #[test]
    fn test_flipped_body_byte_fails_crc() {
        let record = sample_record("a note long enough to flip a byte inside");
        let mut frame = encode_record(&record, opts(false)).unwrap();
        let mid = FRAME_HEADER_LEN + 8;
        frame[mid] ^= 0xFF;
        let err = decode_frame(&frame).unwrap_err();
        assert_eq!(err.code(), "CORRUPT_RECORD");
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let record = sample_record("note");
        let frame = encode_record(&record, opts(true)).unwrap();
        let err = decode_frame(&frame[..frame.len() - 2]).unwrap_err();
        assert_eq!(err.code(), "CORRUPT_RECORD");
    }
}

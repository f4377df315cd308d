// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! On-disk layout of a segment's payload: `[ SegHeader | KVRecord* | padding ]`.
//!
//! Grounded on `spec.md` §3 ("Segment payload layout") and the teacher's
//! `segment/writer.rs` (per-record header, checksum via `crc32fast`).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::digest::{KeyDigest, DIGEST_LEN};
use crate::slice::Slice;
use crate::{Error, Result};

/// Fixed header at the start of every segment's payload.
pub struct SegHeader {
    pub record_count: u32,
    /// Length of the payload that follows, excluding trailing zero padding
    /// up to `segment_size` - needed because the padding is not covered by
    /// `payload_crc32`.
    pub payload_len: u32,
    pub payload_crc32: u32,
}

impl SegHeader {
    pub const ENCODED_LEN: usize = 4 + 4 + 4;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        let mut cursor = &mut buf[..];
        cursor.write_u32::<LittleEndian>(self.record_count).unwrap();
        cursor.write_u32::<LittleEndian>(self.payload_len).unwrap();
        cursor.write_u32::<LittleEndian>(self.payload_crc32).unwrap();
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        Ok(Self {
            record_count: buf.read_u32::<LittleEndian>()?,
            payload_len: buf.read_u32::<LittleEndian>()?,
            payload_crc32: buf.read_u32::<LittleEndian>()?,
        })
    }
}

/// Header of one `KVRecord`. Followed in the byte stream by `key_len` bytes
/// of key and then `value_len` bytes of value.
///
/// `offset` is the in-segment byte offset of this header itself - written
/// self-referentially so recovery can rebuild the index by replaying
/// headers without needing to track a running cursor separately
/// (`spec.md` §3: "an in-segment offset used to rebuild the index on
/// recovery").
#[derive(Clone, Copy, Debug)]
pub struct RecordHeader {
    pub digest: KeyDigest,
    pub key_len: u32,
    pub value_len: u32,
    pub offset: u32,
    pub timestamp: u64,
}

impl RecordHeader {
    pub const ENCODED_LEN: usize = DIGEST_LEN + 4 + 4 + 4 + 8;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.digest.as_bytes());
        out.write_u32::<LittleEndian>(self.key_len).unwrap();
        out.write_u32::<LittleEndian>(self.value_len).unwrap();
        out.write_u32::<LittleEndian>(self.offset).unwrap();
        out.write_u64::<LittleEndian>(self.timestamp).unwrap();
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&buf[..DIGEST_LEN]);
        buf = &buf[DIGEST_LEN..];

        Ok(Self {
            digest: KeyDigest::from(digest),
            key_len: buf.read_u32::<LittleEndian>()?,
            value_len: buf.read_u32::<LittleEndian>()?,
            offset: buf.read_u32::<LittleEndian>()?,
            timestamp: buf.read_u64::<LittleEndian>()?,
        })
    }

    /// Total on-disk size of this record, header + key + value.
    #[must_use]
    pub fn total_len(&self) -> usize {
        Self::ENCODED_LEN + self.key_len as usize + self.value_len as usize
    }
}

/// A decoded record: its header plus the key and value bytes that followed it.
pub struct Record {
    pub header: RecordHeader,
    pub key: Slice,
    pub value: Slice,
}

/// Parses every record out of a segment's decoded payload (the bytes
/// following `SegHeader`, including any trailing padding); only the first
/// `seg_header.payload_len` bytes are covered by the checksum.
pub fn parse_payload(seg_header: &SegHeader, rest: &[u8]) -> Result<Vec<Record>> {
    let payload_len = seg_header.payload_len as usize;
    if payload_len > rest.len() {
        return Err(Error::Corrupt("segment payload length exceeds segment size"));
    }
    let payload = &rest[..payload_len];

    let crc = crc32fast::hash(payload);
    if crc != seg_header.payload_crc32 {
        return Err(Error::Corrupt("segment payload checksum mismatch"));
    }

    let mut records = Vec::with_capacity(seg_header.record_count as usize);
    let mut cursor = 0usize;

    for _ in 0..seg_header.record_count {
        if cursor + RecordHeader::ENCODED_LEN > payload.len() {
            return Err(Error::Corrupt("segment payload truncated"));
        }
        let header = RecordHeader::decode(&payload[cursor..cursor + RecordHeader::ENCODED_LEN])?;
        cursor += RecordHeader::ENCODED_LEN;

        let key_end = cursor + header.key_len as usize;
        let value_end = key_end + header.value_len as usize;
        if value_end > payload.len() {
            return Err(Error::Corrupt("segment payload truncated"));
        }

        let key = Slice::new(&payload[cursor..key_end]);
        let value = Slice::new(&payload[key_end..value_end]);
        cursor = value_end;

        records.push(Record {
            header,
            key,
            value,
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn seg_header_round_trips() -> Result<()> {
        let header = SegHeader {
            record_count: 3,
            payload_len: 128,
            payload_crc32: 0xDEAD_BEEF,
        };
        let decoded = SegHeader::decode(&header.encode())?;
        assert_eq!(decoded.record_count, 3);
        assert_eq!(decoded.payload_len, 128);
        assert_eq!(decoded.payload_crc32, 0xDEAD_BEEF);
        Ok(())
    }

    #[test]
    fn record_header_round_trips() -> Result<()> {
        let header = RecordHeader {
            digest: KeyDigest::compute(b"k"),
            key_len: 1,
            value_len: 5,
            offset: 8,
            timestamp: 42,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        let decoded = RecordHeader::decode(&buf)?;
        assert_eq!(decoded.digest, header.digest);
        assert_eq!(decoded.value_len, 5);
        assert_eq!(decoded.timestamp, 42);
        Ok(())
    }

    #[test]
    fn parse_payload_rejects_bad_checksum() {
        let header = SegHeader {
            record_count: 0,
            payload_len: 0,
            payload_crc32: 1,
        };
        let result = parse_payload(&header, &[]);
        assert!(matches!(result, Err(Error::Corrupt(_))));
    }

    #[test]
    fn parse_payload_round_trips_one_record() -> Result<()> {
        let record_header = RecordHeader {
            digest: KeyDigest::compute(b"hello"),
            key_len: 5,
            value_len: 5,
            offset: 0,
            timestamp: 1,
        };

        let mut payload = Vec::new();
        record_header.encode(&mut payload);
        payload.extend_from_slice(b"hello");
        payload.extend_from_slice(b"world");

        let seg_header = SegHeader {
            record_count: 1,
            payload_len: payload.len() as u32,
            payload_crc32: crc32fast::hash(&payload),
        };

        let records = parse_payload(&seg_header, &payload)?;
        assert_eq!(records.len(), 1);
        assert_eq!(&*records[0].key, b"hello");
        assert_eq!(&*records[0].value, b"world");
        Ok(())
    }
}

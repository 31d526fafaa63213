//! # Journal Record Codec
//!
//! Fixed-layout encode and decode for the journal record kinds. Every
//! record starts with the 13-byte common header; the body layout depends on
//! the kind:
//!
//! ```text
//! Header   := kind:u8 || length:u32 || timestamp:i64
//! PA Body  := volume_handle:u32 || buffer_size:u32 || left_size:u32
//!          || page_address:u64 || payload
//! IV Body  := handle:u32 || volume_id:u64 || name_len:u16 || name
//! IT Body  := handle:u32 || volume_handle:u32 || name_len:u16 || name
//! CP Body  := system_time_millis:i64
//! ```
//!
//! All multi-byte integers are little-endian, encoded through
//! `zerocopy::little_endian` field types so the structs below are the
//! on-disk layout. The `length` field counts the header itself and is the
//! only authority on record size: payload bytes may legitimately contain
//! zeros, including runs that look like further headers.
//!
//! ## Page Image Payloads
//!
//! A PA payload holds the live left and right portions of the page buffer
//! concatenated, omitting the zeroed gap of
//! `buffer_size - (left_size + right_size)` bytes between them.
//! `left_size == 0` means the whole buffer follows verbatim. Reassembly
//! places the left portion at offset 0, the right portion at
//! `buffer_size - right_size`, and zero-fills the middle.
//!
//! ## Reserved Kinds
//!
//! The transaction-boundary and read/write kinds (TS, TC, TJ, RR, WR) are
//! named here so their tags stay allocated, but no codec support exists for
//! them: recovery treats any of them as evidence the journal was not
//! cleanly closed.

use eyre::Result;
use smallvec::SmallVec;
use zerocopy::little_endian::{I64, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::MAXIMUM_NAME_LENGTH;
use crate::error::corrupt;
use crate::journal::types::Checkpoint;

pub const REC_IV: u8 = 1;
pub const REC_IT: u8 = 2;
pub const REC_PA: u8 = 3;
pub const REC_CP: u8 = 4;
pub const REC_TS: u8 = 5;
pub const REC_TC: u8 = 6;
pub const REC_TJ: u8 = 7;
pub const REC_RR: u8 = 8;
pub const REC_WR: u8 = 9;

/// Size of the common header.
pub const RECORD_OVERHEAD: usize = 13;

/// Size of a PA record up to its payload.
pub const PA_OVERHEAD: usize = RECORD_OVERHEAD + 20;

/// Exact size of a CP record.
pub const CP_OVERHEAD: usize = RECORD_OVERHEAD + 8;

/// Size of an IV record up to its name bytes.
pub const IV_OVERHEAD: usize = RECORD_OVERHEAD + 14;

/// Size of an IT record up to its name bytes.
pub const IT_OVERHEAD: usize = RECORD_OVERHEAD + 10;

/// Largest well-formed IV record.
pub const IV_MAX_LENGTH: usize = IV_OVERHEAD + MAXIMUM_NAME_LENGTH;

/// Largest well-formed IT record.
pub const IT_MAX_LENGTH: usize = IT_OVERHEAD + MAXIMUM_NAME_LENGTH;

/// Inline capacity for encoded IV/IT records; typical paths fit without a
/// heap allocation.
type RecordBuf = SmallVec<[u8; 128]>;

/// True for the reserved transaction-boundary and read/write kinds.
pub fn is_reserved_kind(kind: u8) -> bool {
    matches!(kind, REC_TS | REC_TC | REC_TJ | REC_RR | REC_WR)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RecordHeader {
    kind: u8,
    length: U32,
    timestamp: I64,
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == RECORD_OVERHEAD);

impl RecordHeader {
    pub fn new(kind: u8, length: usize, timestamp: i64) -> Self {
        Self {
            kind,
            length: U32::new(length as u32),
            timestamp: I64::new(timestamp),
        }
    }

    /// Reads a header from the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_OVERHEAD {
            return Err(corrupt(format!(
                "record header truncated: {} of {} bytes",
                bytes.len(),
                RECORD_OVERHEAD
            )));
        }
        let header = Self::read_from_bytes(&bytes[..RECORD_OVERHEAD])
            .map_err(|e| corrupt(format!("unreadable record header: {:?}", e)))?;
        Ok(header)
    }

    pub fn kind(&self) -> u8 {
        self.kind
    }

    pub fn length(&self) -> usize {
        self.length.get() as usize
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp.get()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PaFixed {
    volume_handle: U32,
    buffer_size: U32,
    left_size: U32,
    page_address: U64,
}

const _: () = assert!(std::mem::size_of::<PaFixed>() == PA_OVERHEAD - RECORD_OVERHEAD);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct IvFixed {
    handle: U32,
    volume_id: U64,
    name_len: U16,
}

const _: () = assert!(std::mem::size_of::<IvFixed>() == IV_OVERHEAD - RECORD_OVERHEAD);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ItFixed {
    handle: U32,
    volume_handle: U32,
    name_len: U16,
}

const _: () = assert!(std::mem::size_of::<ItFixed>() == IT_OVERHEAD - RECORD_OVERHEAD);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct CpFixed {
    system_time_millis: I64,
}

const _: () = assert!(std::mem::size_of::<CpFixed>() == CP_OVERHEAD - RECORD_OVERHEAD);

/// Decoded PA record header with derived sizes, validated against the
/// structural rules a well-formed page image must obey.
#[derive(Debug, Clone, Copy)]
pub struct PageRecord {
    pub length: usize,
    pub timestamp: i64,
    pub volume_handle: u32,
    pub buffer_size: usize,
    pub left_size: usize,
    pub page_address: u64,
}

impl PageRecord {
    /// Payload bytes following the overhead: the concatenated left and
    /// right portions.
    pub fn payload_size(&self) -> usize {
        self.length - PA_OVERHEAD
    }

    /// Size of the live right portion.
    pub fn right_size(&self) -> usize {
        self.payload_size() - self.left_size
    }

    /// Decodes and validates the first [`PA_OVERHEAD`] bytes of a PA
    /// record.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header = RecordHeader::parse(bytes)?;
        if header.kind() != REC_PA {
            return Err(corrupt(format!(
                "expected a PA record, found kind {}",
                header.kind()
            )));
        }
        if header.length() < PA_OVERHEAD || bytes.len() < PA_OVERHEAD {
            return Err(corrupt(format!(
                "PA record length {} is below its overhead",
                header.length()
            )));
        }
        let fixed = PaFixed::read_from_bytes(&bytes[RECORD_OVERHEAD..PA_OVERHEAD])
            .map_err(|e| corrupt(format!("unreadable PA record body: {:?}", e)))?;
        let record = Self {
            length: header.length(),
            timestamp: header.timestamp(),
            volume_handle: fixed.volume_handle.get(),
            buffer_size: fixed.buffer_size.get() as usize,
            left_size: fixed.left_size.get() as usize,
            page_address: fixed.page_address.get(),
        };
        let payload = record.payload_size();
        if record.left_size > payload || payload > record.buffer_size {
            return Err(corrupt(format!(
                "PA record has invalid sizes: payload={} left={} buffer={}",
                payload, record.left_size, record.buffer_size
            )));
        }
        Ok(record)
    }
}

/// Encodes the fixed prefix of a PA record. The payload bytes follow
/// separately.
pub fn encode_pa_header(
    record_size: usize,
    timestamp: i64,
    volume_handle: u32,
    buffer_size: usize,
    left_size: usize,
    page_address: u64,
) -> [u8; PA_OVERHEAD] {
    let mut bytes = [0u8; PA_OVERHEAD];
    let header = RecordHeader::new(REC_PA, record_size, timestamp);
    bytes[..RECORD_OVERHEAD].copy_from_slice(header.as_bytes());
    let fixed = PaFixed {
        volume_handle: U32::new(volume_handle),
        buffer_size: U32::new(buffer_size as u32),
        left_size: U32::new(left_size as u32),
        page_address: U64::new(page_address),
    };
    bytes[RECORD_OVERHEAD..].copy_from_slice(fixed.as_bytes());
    bytes
}

/// Encodes a complete IV record mapping `handle` to a volume identity.
pub fn encode_iv(handle: u32, volume_id: u64, path: &str) -> Result<RecordBuf> {
    if path.len() > MAXIMUM_NAME_LENGTH {
        return Err(corrupt(format!(
            "volume path of {} bytes exceeds the {} byte limit",
            path.len(),
            MAXIMUM_NAME_LENGTH
        )));
    }
    let length = IV_OVERHEAD + path.len();
    let mut bytes = RecordBuf::with_capacity(length);
    bytes.extend_from_slice(RecordHeader::new(REC_IV, length, 0).as_bytes());
    let fixed = IvFixed {
        handle: U32::new(handle),
        volume_id: U64::new(volume_id),
        name_len: U16::new(path.len() as u16),
    };
    bytes.extend_from_slice(fixed.as_bytes());
    bytes.extend_from_slice(path.as_bytes());
    Ok(bytes)
}

/// Decodes a complete IV record into `(handle, volume_id, path)`.
pub fn decode_iv(bytes: &[u8]) -> Result<(u32, u64, &str)> {
    let header = RecordHeader::parse(bytes)?;
    if header.kind() != REC_IV || header.length() != bytes.len() || bytes.len() < IV_OVERHEAD {
        return Err(corrupt(format!(
            "malformed IV record: kind={} length={} actual={}",
            header.kind(),
            header.length(),
            bytes.len()
        )));
    }
    let fixed = IvFixed::read_from_bytes(&bytes[RECORD_OVERHEAD..IV_OVERHEAD])
        .map_err(|e| corrupt(format!("unreadable IV record body: {:?}", e)))?;
    let name_len = fixed.name_len.get() as usize;
    if IV_OVERHEAD + name_len != bytes.len() {
        return Err(corrupt(format!(
            "IV record name length {} disagrees with record length {}",
            name_len,
            bytes.len()
        )));
    }
    let path = std::str::from_utf8(&bytes[IV_OVERHEAD..])
        .map_err(|_| corrupt("IV record volume path is not UTF-8".to_string()))?;
    Ok((fixed.handle.get(), fixed.volume_id.get(), path))
}

/// Encodes a complete IT record mapping `handle` to a tree identity.
pub fn encode_it(handle: u32, volume_handle: u32, name: &str) -> Result<RecordBuf> {
    if name.len() > MAXIMUM_NAME_LENGTH {
        return Err(corrupt(format!(
            "tree name of {} bytes exceeds the {} byte limit",
            name.len(),
            MAXIMUM_NAME_LENGTH
        )));
    }
    let length = IT_OVERHEAD + name.len();
    let mut bytes = RecordBuf::with_capacity(length);
    bytes.extend_from_slice(RecordHeader::new(REC_IT, length, 0).as_bytes());
    let fixed = ItFixed {
        handle: U32::new(handle),
        volume_handle: U32::new(volume_handle),
        name_len: U16::new(name.len() as u16),
    };
    bytes.extend_from_slice(fixed.as_bytes());
    bytes.extend_from_slice(name.as_bytes());
    Ok(bytes)
}

/// Decodes a complete IT record into `(handle, volume_handle, name)`.
pub fn decode_it(bytes: &[u8]) -> Result<(u32, u32, &str)> {
    let header = RecordHeader::parse(bytes)?;
    if header.kind() != REC_IT || header.length() != bytes.len() || bytes.len() < IT_OVERHEAD {
        return Err(corrupt(format!(
            "malformed IT record: kind={} length={} actual={}",
            header.kind(),
            header.length(),
            bytes.len()
        )));
    }
    let fixed = ItFixed::read_from_bytes(&bytes[RECORD_OVERHEAD..IT_OVERHEAD])
        .map_err(|e| corrupt(format!("unreadable IT record body: {:?}", e)))?;
    let name_len = fixed.name_len.get() as usize;
    if IT_OVERHEAD + name_len != bytes.len() {
        return Err(corrupt(format!(
            "IT record name length {} disagrees with record length {}",
            name_len,
            bytes.len()
        )));
    }
    let name = std::str::from_utf8(&bytes[IT_OVERHEAD..])
        .map_err(|_| corrupt("IT record tree name is not UTF-8".to_string()))?;
    Ok((fixed.handle.get(), fixed.volume_handle.get(), name))
}

/// Encodes a complete CP record.
pub fn encode_cp(checkpoint: Checkpoint) -> [u8; CP_OVERHEAD] {
    let mut bytes = [0u8; CP_OVERHEAD];
    let header = RecordHeader::new(REC_CP, CP_OVERHEAD, checkpoint.timestamp);
    bytes[..RECORD_OVERHEAD].copy_from_slice(header.as_bytes());
    let fixed = CpFixed {
        system_time_millis: I64::new(checkpoint.system_time_millis),
    };
    bytes[RECORD_OVERHEAD..].copy_from_slice(fixed.as_bytes());
    bytes
}

/// Decodes a complete CP record. The record length must be exactly the CP
/// overhead.
pub fn decode_cp(bytes: &[u8]) -> Result<Checkpoint> {
    let header = RecordHeader::parse(bytes)?;
    if header.kind() != REC_CP || header.length() != CP_OVERHEAD || bytes.len() != CP_OVERHEAD {
        return Err(corrupt(format!(
            "malformed CP record: kind={} length={}",
            header.kind(),
            header.length()
        )));
    }
    let fixed = CpFixed::read_from_bytes(&bytes[RECORD_OVERHEAD..])
        .map_err(|e| corrupt(format!("unreadable CP record body: {:?}", e)))?;
    Ok(Checkpoint::new(
        header.timestamp(),
        fixed.system_time_millis.get(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_header_round_trips() {
        let header = RecordHeader::new(REC_PA, 4096, -1);
        let parsed = RecordHeader::parse(header.as_bytes()).unwrap();

        assert_eq!(parsed.kind(), REC_PA);
        assert_eq!(parsed.length(), 4096);
        assert_eq!(parsed.timestamp(), -1);
    }

    #[test]
    fn pa_header_round_trips_with_split_payload() {
        let bytes = encode_pa_header(PA_OVERHEAD + 300, 17, 5, 1024, 100, 9);
        let record = PageRecord::parse(&bytes).unwrap();

        assert_eq!(record.timestamp, 17);
        assert_eq!(record.volume_handle, 5);
        assert_eq!(record.buffer_size, 1024);
        assert_eq!(record.left_size, 100);
        assert_eq!(record.right_size(), 200);
        assert_eq!(record.page_address, 9);
    }

    #[test]
    fn pa_left_size_beyond_payload_is_corrupt() {
        let bytes = encode_pa_header(PA_OVERHEAD + 10, 1, 1, 1024, 11, 0);
        assert!(PageRecord::parse(&bytes).is_err());
    }

    #[test]
    fn pa_payload_beyond_buffer_is_corrupt() {
        let bytes = encode_pa_header(PA_OVERHEAD + 64, 1, 1, 32, 0, 0);
        assert!(PageRecord::parse(&bytes).is_err());
    }

    #[test]
    fn iv_round_trips_volume_identity() {
        let rec = encode_iv(7, 0xDEAD_BEEF, "/data/accounts.vol").unwrap();
        let (handle, id, path) = decode_iv(&rec).unwrap();

        assert_eq!(handle, 7);
        assert_eq!(id, 0xDEAD_BEEF);
        assert_eq!(path, "/data/accounts.vol");
    }

    #[test]
    fn iv_rejects_oversized_paths() {
        let long = "x".repeat(MAXIMUM_NAME_LENGTH + 1);
        assert!(encode_iv(1, 1, &long).is_err());
    }

    #[test]
    fn it_round_trips_tree_identity() {
        let rec = encode_it(9, 7, "orders").unwrap();
        let (handle, volume_handle, name) = decode_it(&rec).unwrap();

        assert_eq!(handle, 9);
        assert_eq!(volume_handle, 7);
        assert_eq!(name, "orders");
    }

    #[test]
    fn cp_length_must_be_exact() {
        let rec = encode_cp(Checkpoint::new(10, 1_000));
        assert_eq!(decode_cp(&rec).unwrap(), Checkpoint::new(10, 1_000));

        let mut wrong = rec.to_vec();
        wrong.push(0);
        assert!(decode_cp(&wrong).is_err());
    }

    #[test]
    fn reserved_kinds_are_recognized() {
        for kind in [REC_TS, REC_TC, REC_TJ, REC_RR, REC_WR] {
            assert!(is_reserved_kind(kind));
        }
        for kind in [REC_IV, REC_IT, REC_PA, REC_CP, 0, 200] {
            assert!(!is_reserved_kind(kind));
        }
    }
}

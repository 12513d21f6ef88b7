//! Segment file layout: a fixed header followed by checksummed records.
//!
//! ```text
//! header (32 bytes)
//!   0..4   magic "TSEG"
//!   4..6   format version
//!   6..8   reserved, zero
//!   8..16  first change id
//!   16..24 last change id
//!   24..28 record count
//!   28..32 header crc32 (computed with this field zeroed)
//! record (24 bytes + payload)
//!   0      kind (1 applied, 2 skipped, 3 cancelled)
//!   1..4   reserved, zero
//!   4..8   origin node id
//!   8..16  change id
//!   16..20 payload length
//!   20..24 crc32 over kind, id, origin and payload
//! ```
//!
//! The id range is also encoded in the file name so segments can be located
//! without opening them.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use crate::changes::{Change, ChangeStatus};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::checksum::record_crc32;
use crate::types::{Checksum, ChangeId, Crc32Fast, NodeId, Result, TesseraError};

const SEGMENT_MAGIC: [u8; 4] = *b"TSEG";
const SEGMENT_FORMAT_VERSION: u16 = 1;
pub(crate) const SEGMENT_HEADER_LEN: usize = 32;
pub(crate) const RECORD_HEADER_LEN: usize = 24;
const SEGMENT_EXT: &str = "seg";
pub(crate) const TMP_EXT: &str = "tmp";
const FILE_NAME_LEN: usize = 16 + 1 + 16 + 1 + SEGMENT_EXT.len();

const KIND_APPLIED: u8 = 1;
const KIND_SKIPPED: u8 = 2;
const KIND_CANCELLED: u8 = 3;

/// One id slot in the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveRecord {
    /// A change that was applied.
    Applied(Change),
    /// An id given up on after the gap timeout.
    Skipped(ChangeId),
    /// A change the applier rejected; only the id is kept.
    Cancelled(ChangeId),
}

impl ArchiveRecord {
    /// Id this record occupies.
    pub fn id(&self) -> ChangeId {
        match self {
            ArchiveRecord::Applied(change) => change.id,
            ArchiveRecord::Skipped(id) | ArchiveRecord::Cancelled(id) => *id,
        }
    }

    /// Bytes this record takes on disk.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_LEN + self.payload().len()
    }

    fn kind(&self) -> u8 {
        match self {
            ArchiveRecord::Applied(_) => KIND_APPLIED,
            ArchiveRecord::Skipped(_) => KIND_SKIPPED,
            ArchiveRecord::Cancelled(_) => KIND_CANCELLED,
        }
    }

    fn origin(&self) -> NodeId {
        match self {
            ArchiveRecord::Applied(change) => change.origin,
            _ => NodeId(0),
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            ArchiveRecord::Applied(change) => &change.payload,
            _ => &[],
        }
    }

    /// Appends the on-disk encoding to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let kind = self.kind();
        let id = self.id().0;
        let origin = self.origin().0;
        let payload = self.payload();
        let mut header = [0u8; RECORD_HEADER_LEN];
        header[0] = kind;
        header[4..8].copy_from_slice(&origin.to_be_bytes());
        header[8..16].copy_from_slice(&id.to_be_bytes());
        header[16..20].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        header[20..24].copy_from_slice(&record_crc32(kind, id, origin, payload).to_be_bytes());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(payload);
    }

    /// Decodes one record from the front of `src`, returning it and its length.
    pub fn decode(src: &[u8]) -> Result<(Self, usize)> {
        if src.len() < RECORD_HEADER_LEN {
            return Err(TesseraError::Corruption("archive record header truncated"));
        }
        if src[1..4] != [0, 0, 0] {
            return Err(TesseraError::Corruption(
                "archive record reserved bytes non-zero",
            ));
        }
        let kind = src[0];
        let origin = read_u32(&src[4..8]);
        let id = read_u64(&src[8..16]);
        let len = read_u32(&src[16..20]) as usize;
        let stored_crc = read_u32(&src[20..24]);
        let end = RECORD_HEADER_LEN + len;
        if src.len() < end {
            return Err(TesseraError::Corruption("archive record payload truncated"));
        }
        let payload = &src[RECORD_HEADER_LEN..end];
        if record_crc32(kind, id, origin, payload) != stored_crc {
            return Err(TesseraError::Corruption("archive record crc mismatch"));
        }
        let record = match kind {
            KIND_APPLIED => {
                let mut change =
                    Change::new(ChangeId(id), NodeId(origin), Bytes::copy_from_slice(payload));
                change.status = ChangeStatus::Applied;
                ArchiveRecord::Applied(change)
            }
            KIND_SKIPPED if len == 0 => ArchiveRecord::Skipped(ChangeId(id)),
            KIND_CANCELLED if len == 0 => ArchiveRecord::Cancelled(ChangeId(id)),
            _ => return Err(TesseraError::Corruption("unknown archive record kind")),
        };
        Ok((record, end))
    }
}

/// Location and id range of one closed segment file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentMeta {
    /// First change id covered.
    pub first_id: ChangeId,
    /// Last change id covered.
    pub last_id: ChangeId,
    /// Path of the segment file.
    pub path: PathBuf,
    /// File size in bytes.
    pub bytes: u64,
}

impl SegmentMeta {
    /// True when `id` falls inside this segment's range.
    pub fn contains(&self, id: ChangeId) -> bool {
        self.first_id <= id && id <= self.last_id
    }
}

/// File name for a segment covering `first..=last`.
pub fn segment_file_name(first: ChangeId, last: ChangeId) -> String {
    format!("{:016x}_{:016x}.{SEGMENT_EXT}", first.0, last.0)
}

/// Parses the id range out of a segment file name.
pub fn parse_segment_file_name(name: &str) -> Option<(ChangeId, ChangeId)> {
    if name.len() != FILE_NAME_LEN || !name.is_ascii() {
        return None;
    }
    let (first, rest) = name.split_at(16);
    let rest = rest.strip_prefix('_')?;
    let (last, ext) = rest.split_at(16);
    if ext.strip_prefix('.')? != SEGMENT_EXT {
        return None;
    }
    if !first.bytes().chain(last.bytes()).all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let first = u64::from_str_radix(first, 16).ok()?;
    let last = u64::from_str_radix(last, 16).ok()?;
    Some((ChangeId(first), ChangeId(last)))
}

fn encode_header(first: ChangeId, last: ChangeId, count: u32) -> [u8; SEGMENT_HEADER_LEN] {
    let mut buf = [0u8; SEGMENT_HEADER_LEN];
    buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
    buf[4..6].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_be_bytes());
    buf[8..16].copy_from_slice(&first.0.to_be_bytes());
    buf[16..24].copy_from_slice(&last.0.to_be_bytes());
    buf[24..28].copy_from_slice(&count.to_be_bytes());
    let mut hasher = Crc32Fast::default();
    hasher.update(&buf);
    buf[28..32].copy_from_slice(&hasher.finalize().to_be_bytes());
    buf
}

fn decode_header(src: &[u8]) -> Result<(ChangeId, ChangeId, u32)> {
    if src.len() < SEGMENT_HEADER_LEN {
        return Err(TesseraError::Corruption("segment header truncated"));
    }
    let mut header = [0u8; SEGMENT_HEADER_LEN];
    header.copy_from_slice(&src[..SEGMENT_HEADER_LEN]);
    if header[0..4] != SEGMENT_MAGIC {
        return Err(TesseraError::Corruption("segment magic mismatch"));
    }
    let version = u16::from_be_bytes([header[4], header[5]]);
    if version != SEGMENT_FORMAT_VERSION {
        return Err(TesseraError::Corruption("segment format version mismatch"));
    }
    if header[6..8] != [0, 0] {
        return Err(TesseraError::Corruption(
            "segment reserved header bytes non-zero",
        ));
    }
    let stored_crc = read_u32(&header[28..32]);
    header[28..32].fill(0);
    let mut hasher = Crc32Fast::default();
    hasher.update(&header);
    if hasher.finalize() != stored_crc {
        return Err(TesseraError::Corruption("segment header crc mismatch"));
    }
    let first = ChangeId(read_u64(&header[8..16]));
    let last = ChangeId(read_u64(&header[16..24]));
    let count = read_u32(&header[24..28]);
    Ok((first, last, count))
}

/// Writes `records` (contiguous, ascending) as a new closed segment in `dir`.
///
/// The file is written under a temporary name, synced, then renamed so that
/// readers never observe a partially written segment.
pub fn write_segment(dir: &Path, records: &[ArchiveRecord]) -> Result<SegmentMeta> {
    let (first, last) = match (records.first(), records.last()) {
        (Some(first), Some(last)) => (first.id(), last.id()),
        _ => return Err(TesseraError::Invalid("cannot write an empty segment")),
    };
    for pair in records.windows(2) {
        if pair[1].id() != pair[0].id().next() {
            return Err(TesseraError::Invalid("segment records must be contiguous"));
        }
    }
    let body_len: usize = records.iter().map(ArchiveRecord::encoded_len).sum();
    let mut buf = Vec::with_capacity(SEGMENT_HEADER_LEN + body_len);
    buf.extend_from_slice(&encode_header(first, last, records.len() as u32));
    for record in records {
        record.encode_into(&mut buf);
    }

    let name = segment_file_name(first, last);
    let final_path = dir.join(&name);
    let tmp_path = dir.join(format!("{name}.{TMP_EXT}"));
    let io = StdFileIo::create(&tmp_path)?;
    io.write_at(0, &buf)?;
    io.sync_all()?;
    drop(io);
    fs::rename(&tmp_path, &final_path)?;
    debug!(
        first = first.0,
        last = last.0,
        records = records.len(),
        bytes = buf.len(),
        "archive.segment.written"
    );
    Ok(SegmentMeta {
        first_id: first,
        last_id: last,
        path: final_path,
        bytes: buf.len() as u64,
    })
}

/// Reads and validates every record of a segment.
pub fn read_segment(meta: &SegmentMeta) -> Result<Vec<ArchiveRecord>> {
    let io = StdFileIo::open_read_only(&meta.path)?;
    let len = io.len()? as usize;
    let mut buf = vec![0u8; len];
    io.read_at(0, &mut buf)?;
    let (first, last, count) = decode_header(&buf)?;
    if first != meta.first_id || last != meta.last_id {
        return Err(TesseraError::Corruption(
            "segment header disagrees with file name",
        ));
    }
    let mut records = Vec::with_capacity(count as usize);
    let mut offset = SEGMENT_HEADER_LEN;
    let mut expected = first;
    while offset < buf.len() {
        let (record, used) = ArchiveRecord::decode(&buf[offset..])?;
        if record.id() != expected {
            return Err(TesseraError::Corruption("segment records out of order"));
        }
        records.push(record);
        offset += used;
        expected = expected.next();
    }
    if records.len() != count as usize || expected != last.next() {
        return Err(TesseraError::Corruption("segment record count mismatch"));
    }
    Ok(records)
}

fn read_u32(src: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&src[..4]);
    u32::from_be_bytes(raw)
}

fn read_u64(src: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[..8]);
    u64::from_be_bytes(raw)
}

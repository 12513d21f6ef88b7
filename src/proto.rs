//! Packages exchanged between nodes and their byte encoding.
//!
//! Every package starts with a one byte tag followed by big-endian fixed
//! width fields. Payloads are length prefixed. Sync parts carry archive
//! records in their on-disk encoding, checksums included.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::archive::ArchiveRecord;
use crate::changes::Change;
use crate::types::{ChangeId, NodeId, Result, TesseraError};

const TAG_CHANGE: u8 = 1;
const TAG_MISSING_CHANGE: u8 = 2;
const TAG_SYNC_REQUEST: u8 = 3;
const TAG_SYNC_PART: u8 = 4;
const TAG_SYNC_PART_ACK: u8 = 5;
const TAG_SYNC_DONE: u8 = 6;
const TAG_SYNC_TRUNCATED: u8 = 7;
const TAG_SYNC_ABORT: u8 = 8;

/// One bounded batch of a catch-up stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncPart {
    /// Id of the first record.
    pub first: ChangeId,
    /// Id of the last record.
    pub last: ChangeId,
    /// More parts follow once this one is acknowledged.
    pub more: bool,
    /// Records in id order.
    pub records: Vec<ArchiveRecord>,
}

/// A message between two nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Package {
    /// A change broadcast by its origin, or resent on request.
    Change(Change),
    /// Asks a peer to resend one change.
    MissingChange {
        /// Id the sender is waiting for.
        id: ChangeId,
    },
    /// Opens a catch-up stream starting at `first_id`.
    SyncRequest {
        /// First id the requester needs.
        first_id: ChangeId,
    },
    /// One bounded batch of archived records.
    SyncPart(SyncPart),
    /// Acknowledges a part and asks for the next one.
    SyncPartAck {
        /// Id the next part should start at.
        next_id: ChangeId,
    },
    /// Nothing left to stream.
    SyncDone {
        /// Last id in the responder's archive.
        last_id: ChangeId,
    },
    /// The responder no longer holds the requested history.
    SyncTruncated {
        /// First id that was requested.
        requested: ChangeId,
        /// Oldest id the responder can serve.
        first_available: ChangeId,
    },
    /// Either side gave up on the stream.
    SyncAbort,
}

impl Package {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Package::Change(_) => "change",
            Package::MissingChange { .. } => "missing_change",
            Package::SyncRequest { .. } => "sync_request",
            Package::SyncPart(_) => "sync_part",
            Package::SyncPartAck { .. } => "sync_part_ack",
            Package::SyncDone { .. } => "sync_done",
            Package::SyncTruncated { .. } => "sync_truncated",
            Package::SyncAbort => "sync_abort",
        }
    }

    /// Encodes the package into a single frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Package::Change(change) => {
                buf.put_u8(TAG_CHANGE);
                buf.put_u64(change.id.0);
                buf.put_u32(change.origin.0);
                buf.put_u32(change.payload.len() as u32);
                buf.put_slice(&change.payload);
            }
            Package::MissingChange { id } => {
                buf.put_u8(TAG_MISSING_CHANGE);
                buf.put_u64(id.0);
            }
            Package::SyncRequest { first_id } => {
                buf.put_u8(TAG_SYNC_REQUEST);
                buf.put_u64(first_id.0);
            }
            Package::SyncPart(SyncPart {
                first,
                last,
                more,
                records,
            }) => {
                buf.put_u8(TAG_SYNC_PART);
                buf.put_u64(first.0);
                buf.put_u64(last.0);
                buf.put_u8(u8::from(*more));
                buf.put_u32(records.len() as u32);
                let mut encoded = Vec::new();
                for record in records {
                    record.encode_into(&mut encoded);
                }
                buf.put_slice(&encoded);
            }
            Package::SyncPartAck { next_id } => {
                buf.put_u8(TAG_SYNC_PART_ACK);
                buf.put_u64(next_id.0);
            }
            Package::SyncDone { last_id } => {
                buf.put_u8(TAG_SYNC_DONE);
                buf.put_u64(last_id.0);
            }
            Package::SyncTruncated {
                requested,
                first_available,
            } => {
                buf.put_u8(TAG_SYNC_TRUNCATED);
                buf.put_u64(requested.0);
                buf.put_u64(first_available.0);
            }
            Package::SyncAbort => buf.put_u8(TAG_SYNC_ABORT),
        }
        buf.freeze()
    }

    /// Decodes one frame produced by [`Package::encode`].
    pub fn decode(mut src: Bytes) -> Result<Self> {
        let tag = take_u8(&mut src)?;
        let package = match tag {
            TAG_CHANGE => {
                let id = ChangeId(take_u64(&mut src)?);
                let origin = NodeId(take_u32(&mut src)?);
                let len = take_u32(&mut src)? as usize;
                if src.remaining() < len {
                    return Err(TesseraError::Corruption("change payload truncated"));
                }
                let payload = src.split_to(len);
                Package::Change(Change::new(id, origin, payload))
            }
            TAG_MISSING_CHANGE => Package::MissingChange {
                id: ChangeId(take_u64(&mut src)?),
            },
            TAG_SYNC_REQUEST => Package::SyncRequest {
                first_id: ChangeId(take_u64(&mut src)?),
            },
            TAG_SYNC_PART => {
                let first = ChangeId(take_u64(&mut src)?);
                let last = ChangeId(take_u64(&mut src)?);
                let more = match take_u8(&mut src)? {
                    0 => false,
                    1 => true,
                    _ => return Err(TesseraError::Corruption("invalid sync part flag")),
                };
                let count = take_u32(&mut src)? as usize;
                let mut records = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    let (record, used) = ArchiveRecord::decode(&src)?;
                    src.advance(used);
                    records.push(record);
                }
                Package::SyncPart(SyncPart {
                    first,
                    last,
                    more,
                    records,
                })
            }
            TAG_SYNC_PART_ACK => Package::SyncPartAck {
                next_id: ChangeId(take_u64(&mut src)?),
            },
            TAG_SYNC_DONE => Package::SyncDone {
                last_id: ChangeId(take_u64(&mut src)?),
            },
            TAG_SYNC_TRUNCATED => Package::SyncTruncated {
                requested: ChangeId(take_u64(&mut src)?),
                first_available: ChangeId(take_u64(&mut src)?),
            },
            TAG_SYNC_ABORT => Package::SyncAbort,
            _ => return Err(TesseraError::Corruption("unknown package tag")),
        };
        if src.has_remaining() {
            return Err(TesseraError::Corruption("trailing bytes after package"));
        }
        Ok(package)
    }
}

fn take_u8(src: &mut Bytes) -> Result<u8> {
    if src.remaining() < 1 {
        return Err(TesseraError::Corruption("package truncated"));
    }
    Ok(src.get_u8())
}

fn take_u32(src: &mut Bytes) -> Result<u32> {
    if src.remaining() < 4 {
        return Err(TesseraError::Corruption("package truncated"));
    }
    Ok(src.get_u32())
}

fn take_u64(src: &mut Bytes) -> Result<u64> {
    if src.remaining() < 8 {
        return Err(TesseraError::Corruption("package truncated"));
    }
    Ok(src.get_u64())
}

/// Outbound side of the network layer.
///
/// `send` must return immediately; delivery failures are the transport's to
/// log and retry.
pub trait Transport: Send + 'static {
    /// Queues `package` for `peer`.
    fn send(&self, peer: NodeId, package: Package);
}

#![forbid(unsafe_code)]

//! Append-only, id-ordered archive of committed changes.
//!
//! Records live in an in-memory tail until the background flusher writes them
//! into closed segment files. Segment files are immutable once renamed into
//! place and are only ever removed whole by [`Archive::truncate_before`].

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::types::{ChangeId, Result, TesseraError};

mod flusher;
/// Segment file format.
pub mod segment;

pub use flusher::FlushTicket;
pub use segment::{ArchiveRecord, SegmentMeta};

use flusher::{FlushTarget, Flusher};

/// Archive tuning knobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchiveOptions {
    /// Tail length that triggers a background flush.
    pub flush_threshold: usize,
    /// Maximum records per segment file.
    pub max_segment_changes: usize,
    /// Maximum encoded bytes per segment file.
    pub max_segment_bytes: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            flush_threshold: 1_000,
            max_segment_changes: 10_000,
            max_segment_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ArchiveOptions {
    fn normalize(mut self) -> Self {
        self.flush_threshold = self.flush_threshold.max(1);
        self.max_segment_changes = self.max_segment_changes.max(1);
        self.max_segment_bytes = self.max_segment_bytes.max(segment::RECORD_HEADER_LEN);
        self
    }
}

/// Point-in-time archive statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveStats {
    /// Oldest id the archive can serve.
    pub first_id: u64,
    /// Newest id pushed.
    pub last_id: u64,
    /// Closed segment files on disk.
    pub segments: usize,
    /// Total bytes of closed segment files.
    pub segment_bytes: u64,
    /// Records waiting in memory.
    pub tail_len: usize,
    /// Records pushed since open.
    pub pushed: u64,
    /// Records written to segments since open.
    pub flushed: u64,
}

struct ArchiveState {
    segments: Vec<SegmentMeta>,
    tail: VecDeque<ArchiveRecord>,
    first_id: ChangeId,
    last_id: ChangeId,
    pushed: u64,
    flushed: u64,
    flush_scheduled: bool,
}

impl ArchiveState {
    fn is_empty(&self) -> bool {
        self.first_id > self.last_id
    }

    fn tail_first_id(&self) -> Option<ChangeId> {
        self.tail.front().map(ArchiveRecord::id)
    }

    fn segment_index(&self, id: ChangeId) -> Option<usize> {
        let idx = self.segments.partition_point(|seg| seg.last_id < id);
        self.segments
            .get(idx)
            .filter(|seg| seg.contains(id))
            .map(|_| idx)
    }

    fn recompute_first_id(&mut self) {
        self.first_id = self
            .segments
            .first()
            .map(|seg| seg.first_id)
            .or_else(|| self.tail_first_id())
            .unwrap_or_else(|| self.last_id.next());
    }
}

struct SegmentCache {
    path: PathBuf,
    records: Arc<Vec<ArchiveRecord>>,
}

struct ArchiveInner {
    dir: PathBuf,
    options: ArchiveOptions,
    state: Mutex<ArchiveState>,
    cache: Mutex<Option<SegmentCache>>,
    flusher: Flusher,
}

/// Shared handle to an archive directory.
///
/// Cloning is cheap; all clones see the same state. Pushing is done by the
/// single owner of the change queue, while sync responders read concurrently.
#[derive(Clone)]
pub struct Archive {
    inner: Arc<ArchiveInner>,
}

impl Archive {
    /// Opens (or creates) the archive stored in `dir`.
    pub fn open(dir: impl AsRef<Path>, options: ArchiveOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut segments = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(&format!(".{}", segment::TMP_EXT)) {
                debug!(path = %path.display(), "archive.open.remove_tmp");
                fs::remove_file(&path)?;
                continue;
            }
            let Some((first_id, last_id)) = segment::parse_segment_file_name(name) else {
                continue;
            };
            if first_id > last_id {
                return Err(TesseraError::Corruption("segment range is inverted"));
            }
            if last_id.checked_next().is_none() {
                return Err(TesseraError::Corruption("segment range ends at the id limit"));
            }
            segments.push(SegmentMeta {
                first_id,
                last_id,
                bytes: entry.metadata()?.len(),
                path,
            });
        }
        segments.sort_by_key(|seg| seg.first_id);
        for pair in segments.windows(2) {
            if pair[1].first_id <= pair[0].last_id {
                return Err(TesseraError::Corruption("overlapping archive segments"));
            }
            if pair[0].last_id.checked_next() != Some(pair[1].first_id) {
                return Err(TesseraError::Corruption("archive segments are not contiguous"));
            }
        }
        if let Some(newest) = segments.last() {
            // validates header and record checksums of the newest segment
            segment::read_segment(newest)?;
        }
        let last_id = segments.last().map(|seg| seg.last_id).unwrap_or_default();
        let mut state = ArchiveState {
            segments,
            tail: VecDeque::new(),
            first_id: ChangeId::default(),
            last_id,
            pushed: 0,
            flushed: 0,
            flush_scheduled: false,
        };
        state.recompute_first_id();
        info!(
            dir = %dir.display(),
            segments = state.segments.len(),
            first_id = state.first_id.0,
            last_id = state.last_id.0,
            "archive.open"
        );
        Ok(Self {
            inner: Arc::new(ArchiveInner {
                dir,
                options: options.normalize(),
                state: Mutex::new(state),
                cache: Mutex::new(None),
                flusher: Flusher::new(),
            }),
        })
    }

    /// Directory holding the segment files.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Appends the record for the next id.
    ///
    /// Records must arrive in id order with no holes. An empty archive accepts
    /// any id above its last id, which is how a node restored from a snapshot
    /// starts its history.
    pub fn push(&self, record: ArchiveRecord) -> Result<()> {
        let id = record.id();
        let schedule = {
            let mut state = self.inner.state.lock();
            let expected = state
                .last_id
                .checked_next()
                .ok_or(TesseraError::Invalid("change id space exhausted"))?;
            if state.is_empty() && state.tail.is_empty() && id >= expected {
                state.first_id = id;
            } else if id != expected {
                return Err(TesseraError::Invalid(
                    "archive records must be pushed in id order",
                ));
            }
            state.last_id = id;
            state.tail.push_back(record);
            state.pushed += 1;
            if state.tail.len() >= self.inner.options.flush_threshold && !state.flush_scheduled {
                state.flush_scheduled = true;
                true
            } else {
                false
            }
        };
        if schedule {
            debug!(id = id.0, "archive.flush.scheduled");
            // failures are logged by the worker and retried on the next flush
            drop(self.schedule_flush());
        }
        Ok(())
    }

    /// Starts a background flush and returns its ticket.
    pub fn schedule_flush(&self) -> FlushTicket {
        let target: Arc<dyn FlushTarget> = self.inner.clone();
        self.inner.flusher.enqueue(target)
    }

    /// Writes every tail record into segment files and waits for completion.
    pub fn flush(&self) -> Result<usize> {
        let target: Arc<dyn FlushTarget> = self.inner.clone();
        self.inner.flusher.flush(target)
    }

    /// Oldest id the archive can still serve.
    ///
    /// An empty archive reports `last_id + 1`, the id its first record will
    /// carry. That is the one case where `first_id` exceeds the commit id.
    pub fn first_id(&self) -> ChangeId {
        self.inner.state.lock().first_id
    }

    /// Newest id in the archive; zero when nothing was ever pushed.
    pub fn last_id(&self) -> ChangeId {
        self.inner.state.lock().last_id
    }

    /// Path of the closed segment holding `id`, if it is on disk.
    pub fn segment_for(&self, id: ChangeId) -> Option<PathBuf> {
        let state = self.inner.state.lock();
        state
            .segment_index(id)
            .map(|idx| state.segments[idx].path.clone())
    }

    /// Closed segments in id order.
    pub fn segments(&self) -> Vec<SegmentMeta> {
        self.inner.state.lock().segments.clone()
    }

    /// Record for `id`, from the tail or the segment holding it.
    pub fn get(&self, id: ChangeId) -> Result<Option<ArchiveRecord>> {
        let meta = {
            let state = self.inner.state.lock();
            if id < state.first_id || id > state.last_id {
                return Ok(None);
            }
            if let Some(front) = state.tail_first_id() {
                if id >= front {
                    return Ok(state.tail.get((id.0 - front.0) as usize).cloned());
                }
            }
            match state.segment_index(id) {
                Some(idx) => state.segments[idx].clone(),
                None => return Ok(None),
            }
        };
        let records = self.inner.load_segment(&meta)?;
        Ok(records.get((id.0 - meta.first_id.0) as usize).cloned())
    }

    /// Records from `from` onward, in id order, stopping once `max_bytes`
    /// of encoded records were collected (at least one record is returned
    /// when any exists).
    pub fn read_from(&self, from: ChangeId, max_bytes: usize) -> Result<Vec<ArchiveRecord>> {
        let mut out = Vec::new();
        let mut bytes = 0usize;
        let mut next = from;
        loop {
            let meta = {
                let state = self.inner.state.lock();
                if next < state.first_id {
                    return Err(TesseraError::HistoryTruncated {
                        requested: next,
                        first_available: state.first_id,
                    });
                }
                if next > state.last_id {
                    return Ok(out);
                }
                match state.tail_first_id() {
                    Some(front) if next >= front => {
                        let skip = (next.0 - front.0) as usize;
                        for record in state.tail.iter().skip(skip) {
                            bytes += record.encoded_len();
                            out.push(record.clone());
                            if bytes >= max_bytes {
                                break;
                            }
                        }
                        return Ok(out);
                    }
                    _ => match state.segment_index(next) {
                        Some(idx) => state.segments[idx].clone(),
                        None => return Err(TesseraError::Corruption("archive range has a hole")),
                    },
                }
            };
            let records = self.inner.load_segment(&meta)?;
            let skip = (next.0 - meta.first_id.0) as usize;
            for record in records.iter().skip(skip) {
                bytes += record.encoded_len();
                out.push(record.clone());
                next = next.next();
                if bytes >= max_bytes {
                    return Ok(out);
                }
            }
        }
    }

    /// Deletes closed segments lying entirely below `id`.
    ///
    /// The newest segment is always kept so the last id survives a restart.
    /// Returns the number of segment files removed.
    pub fn truncate_before(&self, id: ChangeId) -> Result<usize> {
        let doomed: Vec<SegmentMeta> = {
            let mut state = self.inner.state.lock();
            let keep_from = state
                .segments
                .partition_point(|seg| seg.last_id < id)
                .min(state.segments.len().saturating_sub(1));
            let doomed: Vec<SegmentMeta> = state.segments.drain(..keep_from).collect();
            state.recompute_first_id();
            doomed
        };
        {
            let mut cache = self.inner.cache.lock();
            if cache
                .as_ref()
                .is_some_and(|c| doomed.iter().any(|seg| seg.path == c.path))
            {
                *cache = None;
            }
        }
        for seg in &doomed {
            fs::remove_file(&seg.path)?;
        }
        if !doomed.is_empty() {
            info!(
                removed = doomed.len(),
                first_id = self.first_id().0,
                "archive.truncate"
            );
        }
        Ok(doomed.len())
    }

    /// Current statistics.
    pub fn stats(&self) -> ArchiveStats {
        let state = self.inner.state.lock();
        ArchiveStats {
            first_id: state.first_id.0,
            last_id: state.last_id.0,
            segments: state.segments.len(),
            segment_bytes: state.segments.iter().map(|seg| seg.bytes).sum(),
            tail_len: state.tail.len(),
            pushed: state.pushed,
            flushed: state.flushed,
        }
    }
}

impl ArchiveInner {
    fn load_segment(&self, meta: &SegmentMeta) -> Result<Arc<Vec<ArchiveRecord>>> {
        if let Some(cached) = self.cache.lock().as_ref() {
            if cached.path == meta.path {
                return Ok(Arc::clone(&cached.records));
            }
        }
        let records = Arc::new(segment::read_segment(meta)?);
        *self.cache.lock() = Some(SegmentCache {
            path: meta.path.clone(),
            records: Arc::clone(&records),
        });
        Ok(records)
    }

    // Takes the longest tail prefix that fits one segment.
    fn next_chunk(&self) -> Vec<ArchiveRecord> {
        let state = self.state.lock();
        let mut bytes = 0usize;
        let mut chunk = Vec::new();
        for record in &state.tail {
            let len = record.encoded_len();
            if chunk.len() >= self.options.max_segment_changes
                || (!chunk.is_empty() && bytes + len > self.options.max_segment_bytes)
            {
                break;
            }
            bytes += len;
            chunk.push(record.clone());
        }
        chunk
    }

    fn write_tail(&self) -> Result<usize> {
        let mut written = 0usize;
        loop {
            let chunk = self.next_chunk();
            if chunk.is_empty() {
                break;
            }
            let meta = segment::write_segment(&self.dir, &chunk)?;
            let mut state = self.state.lock();
            debug!(
                first = meta.first_id.0,
                last = meta.last_id.0,
                bytes = meta.bytes,
                "archive.flush.segment"
            );
            state.tail.drain(..chunk.len());
            state.segments.push(meta);
            state.flushed += chunk.len() as u64;
            written += chunk.len();
        }
        Ok(written)
    }
}

impl FlushTarget for ArchiveInner {
    fn flush_pending(&self) -> Result<usize> {
        let result = self.write_tail();
        // a failed pass must not block the next threshold-triggered flush
        self.state.lock().flush_scheduled = false;
        result
    }
}

//! Background worker that moves the archive tail into segment files.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::types::{Result, TesseraError};

/// Work the flusher performs on behalf of its owner.
pub(crate) trait FlushTarget: Send + Sync + 'static {
    /// Writes everything flushable; returns the number of records written.
    fn flush_pending(&self) -> Result<usize>;
}

/// Ticket for one flush request.
///
/// Call `wait()` to block until a flush covering the request has finished.
pub struct FlushTicket {
    request: Arc<FlushRequest>,
}

impl FlushTicket {
    /// Blocks until the flush completes; returns its outcome.
    pub fn wait(self) -> Result<usize> {
        self.request.wait()
    }
}

/// Single worker thread, spawned on demand, exiting once idle.
///
/// Requests arriving while a flush runs are coalesced: one pass over the tail
/// satisfies every request queued before it started.
pub(crate) struct Flusher {
    state: Arc<Mutex<FlushState>>,
}

#[derive(Default)]
struct FlushState {
    pending: VecDeque<Arc<FlushRequest>>,
    worker_running: bool,
}

impl Flusher {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FlushState::default())),
        }
    }

    /// Queues a flush without blocking.
    pub(crate) fn enqueue(&self, target: Arc<dyn FlushTarget>) -> FlushTicket {
        let request = Arc::new(FlushRequest::new());
        let mut state = self.state.lock();
        state.pending.push_back(Arc::clone(&request));
        debug!(
            pending = state.pending.len(),
            worker_running = state.worker_running,
            "archive.flusher.enqueue"
        );
        if !state.worker_running {
            state.worker_running = true;
            let shared = Arc::clone(&self.state);
            thread::spawn(move || Self::worker_loop(target, shared));
        }
        FlushTicket { request }
    }

    /// Queues a flush and blocks until it completes.
    pub(crate) fn flush(&self, target: Arc<dyn FlushTarget>) -> Result<usize> {
        self.enqueue(target).wait()
    }

    fn worker_loop(target: Arc<dyn FlushTarget>, state: Arc<Mutex<FlushState>>) {
        loop {
            let batch: Vec<Arc<FlushRequest>> = {
                let mut guard = state.lock();
                if guard.pending.is_empty() {
                    guard.worker_running = false;
                    debug!("archive.flusher.worker_exit");
                    break;
                }
                guard.pending.drain(..).collect()
            };
            debug!(requests = batch.len(), "archive.flusher.batch");
            match target.flush_pending() {
                Ok(written) => {
                    for req in &batch {
                        req.finish(Ok(written));
                    }
                }
                Err(err) => {
                    warn!(error = %err, requests = batch.len(), "archive.flusher.failed");
                    for req in &batch {
                        req.finish(Err(clone_error(&err)));
                    }
                }
            }
        }
    }
}

struct FlushRequest {
    result: Mutex<Option<Result<usize>>>,
    cv: Condvar,
}

impl FlushRequest {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn finish(&self, outcome: Result<usize>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }

    fn wait(&self) -> Result<usize> {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            self.cv.wait(&mut guard);
        }
    }
}

// Errors fan out to every waiting ticket; io::Error is not Clone.
fn clone_error(err: &TesseraError) -> TesseraError {
    match err {
        TesseraError::Io(io_err) => TesseraError::Io(io::Error::new(io_err.kind(), io_err.to_string())),
        TesseraError::Corruption(msg) => TesseraError::Corruption(msg),
        TesseraError::Invalid(msg) => TesseraError::Invalid(msg),
        other => TesseraError::Config(other.to_string()),
    }
}

//! The node's single event loop and the handle used to talk to it.
//!
//! All queue mutation happens inside [`ChangeQueueService::run`]. Callers
//! reach it through a cloneable [`ServiceHandle`]; replies come back over
//! `oneshot` channels so no caller ever blocks the loop.
//!
//! A node with peers starts out `Synchronizing` and streams history from a
//! ready peer before it reports itself `Ready`. It does the same whenever a
//! peer comes back online, since changes may have been missed meanwhile.

use std::future;
use std::time::Instant;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::NodeConfig;
use super::health::ClusterHealth;
use crate::archive::{Archive, ArchiveRecord};
use crate::changes::{ChangeQueue, Effect, PassthroughProducer, TaskApplier, TaskProducer};
use crate::cluster::{NodeInfo, NodeRegistry, NodeStatus};
use crate::proto::{Package, Transport};
use crate::sync::{SyncOutcome, SyncRequester, SyncResponder};
use crate::types::{ChangeId, NodeId, Result, TesseraError};

const COMMAND_BUFFER: usize = 1_024;

enum Command {
    Submit {
        payload: Bytes,
        resp: oneshot::Sender<Result<ChangeId>>,
    },
    SubmitTasks {
        tasks: Bytes,
        resp: oneshot::Sender<Result<ChangeId>>,
    },
    Deliver {
        from: NodeId,
        package: Package,
    },
    SetPeerStatus {
        node: NodeId,
        status: NodeStatus,
        resp: oneshot::Sender<bool>,
    },
    Health {
        resp: oneshot::Sender<ClusterHealth>,
    },
    CommitId {
        resp: oneshot::Sender<ChangeId>,
    },
    AddNode {
        node: NodeId,
        zone: u8,
        resp: oneshot::Sender<Result<()>>,
    },
    RemoveNode {
        node: NodeId,
        resp: oneshot::Sender<Result<()>>,
    },
    Compact {
        resp: oneshot::Sender<Result<usize>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable entry point into a running service.
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl ServiceHandle {
    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(make(resp))
            .await
            .map_err(|_| TesseraError::Closed)?;
        rx.await.map_err(|_| TesseraError::Closed)
    }

    /// Creates a local change from a ready payload; returns its id.
    pub async fn submit(&self, payload: impl Into<Bytes>) -> Result<ChangeId> {
        let payload = payload.into();
        self.request(|resp| Command::Submit { payload, resp })
            .await?
    }

    /// Creates a local change from a task list via the task producer.
    pub async fn submit_tasks(&self, tasks: impl Into<Bytes>) -> Result<ChangeId> {
        let tasks = tasks.into();
        self.request(|resp| Command::SubmitTasks { tasks, resp })
            .await?
    }

    /// Hands a package received from `from` to the loop.
    pub async fn deliver(&self, from: NodeId, package: Package) -> Result<()> {
        self.tx
            .send(Command::Deliver { from, package })
            .await
            .map_err(|_| TesseraError::Closed)
    }

    /// Non-blocking variant of [`ServiceHandle::deliver`] for transports
    /// running outside an async context.
    pub fn try_deliver(&self, from: NodeId, package: Package) -> Result<()> {
        self.tx
            .try_send(Command::Deliver { from, package })
            .map_err(|_| TesseraError::Closed)
    }

    /// Updates a peer's status; returns false for unknown nodes and for the
    /// local node, whose status follows its own catch-up.
    pub async fn set_peer_status(&self, node: NodeId, status: NodeStatus) -> Result<bool> {
        self.request(|resp| Command::SetPeerStatus { node, status, resp })
            .await
    }

    /// Current health snapshot.
    pub async fn health(&self) -> Result<ClusterHealth> {
        self.request(|resp| Command::Health { resp }).await
    }

    /// Current commit id.
    pub async fn commit_id(&self) -> Result<ChangeId> {
        self.request(|resp| Command::CommitId { resp }).await
    }

    /// Registers a new cluster member, refused while too many nodes are
    /// disconnected to keep quorum should the new one fail to connect.
    pub async fn add_node(&self, node: NodeId, zone: u8) -> Result<()> {
        self.request(|resp| Command::AddNode { node, zone, resp })
            .await?
    }

    /// Removes a cluster member and closes any stream with it.
    pub async fn remove_node(&self, node: NodeId) -> Result<()> {
        self.request(|resp| Command::RemoveNode { node, resp }).await?
    }

    /// Flushes the archive and deletes segments every node has committed.
    ///
    /// Restart replays only what the archive still holds, so call this once
    /// the applied state below the lowest committed id is stored elsewhere.
    /// Returns the number of segment files removed.
    pub async fn compact(&self) -> Result<usize> {
        self.request(|resp| Command::Compact { resp }).await?
    }

    /// Stops the loop after a final archive flush.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|resp| Command::Shutdown { resp }).await?
    }

    /// Token that stops the loop; the archive is still flushed on the way out.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Owns every component of a node and drives them from one task.
pub struct ChangeQueueService<A, T> {
    queue: ChangeQueue,
    registry: NodeRegistry,
    responder: SyncResponder,
    requester: SyncRequester,
    applier: A,
    transport: T,
    producer: Box<dyn TaskProducer + Send>,
    rng: StdRng,
    caught_up: bool,
    // truncated history or a conflicting stream; only an operator can resolve it
    sync_blocked: bool,
    tail_threshold: usize,
    rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
}

impl<A, T> ChangeQueueService<A, T>
where
    A: TaskApplier + Send + 'static,
    T: Transport,
{
    /// Opens the archive, replays it into `applier` and returns the service
    /// together with its handle.
    pub fn open(config: &NodeConfig, mut applier: A, transport: T) -> Result<(Self, ServiceHandle)> {
        config.validate()?;
        let mut registry = config.registry()?;
        let caught_up = registry.peers().next().is_none();
        if !caught_up {
            registry.set_status(registry.this_id(), NodeStatus::Synchronizing);
        }
        let archive = Archive::open(&config.archive_dir, config.archive_options())?;
        let mut queue = ChangeQueue::new(registry.this_id(), archive.clone(), config.queue_options());
        queue.recover(archive.first_id(), &mut applier)?;
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let cancel = CancellationToken::new();
        let service = Self {
            queue,
            registry,
            responder: SyncResponder::new(archive, config.sync_options()),
            requester: SyncRequester::new(config.sync_options()),
            applier,
            transport,
            producer: Box::new(PassthroughProducer),
            rng: StdRng::from_entropy(),
            caught_up,
            sync_blocked: false,
            tail_threshold: config.archive_flush_threshold,
            rx,
            cancel: cancel.clone(),
        };
        Ok((service, ServiceHandle { tx, cancel }))
    }

    /// Replaces the task producer used by `submit_tasks`.
    pub fn with_producer(mut self, producer: impl TaskProducer + Send + 'static) -> Self {
        self.producer = Box::new(producer);
        self
    }

    /// Seeds peer selection, for reproducible tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Runs until shutdown, cancellation, or every handle is dropped.
    pub async fn run(mut self) {
        info!(
            node = %self.registry.this_id(),
            commit_id = self.queue.commit_id().0,
            "service.start"
        );
        let cancel = self.cancel.clone();
        let mut deadline = self.tick();
        loop {
            let wake = deadline.map(tokio::time::Instant::from_std);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("service.cancelled");
                    break;
                }
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown { resp }) => {
                            let result = self.finish();
                            let _ = resp.send(result);
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                _ = async {
                    match wake {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => future::pending::<()>().await,
                    }
                } => {}
            }
            deadline = self.tick();
        }
        if let Err(err) = self.finish() {
            error!(error = %err, "service.final_flush_failed");
        }
    }

    fn now() -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn finish(&mut self) -> Result<()> {
        if let Some((peer, package)) = self.requester.abort() {
            self.transport.send(peer, package);
        }
        let flushed = self.queue.archive().flush()?;
        info!(
            flushed,
            commit_id = self.queue.commit_id().0,
            "service.shutdown"
        );
        Ok(())
    }

    // Drives the commit loop and timers, then dispatches effects. Returns
    // the earliest deadline the loop must wake up for.
    fn tick(&mut self) -> Option<Instant> {
        let now = Self::now();
        if let Err(err) = self.requester.poll(now) {
            warn!(error = %err, "service.sync_failed");
            self.start_sync(self.queue.commit_id().next(), now);
        }
        self.queue.set_synchronizing(self.requester.is_active());
        let queue_deadline = match self.queue.tick(now, &mut self.applier) {
            Ok((_, deadline)) => deadline,
            Err(err) => {
                error!(error = %err, "service.commit_failed");
                None
            }
        };
        let this = self.registry.this_id();
        self.registry.set_committed(this, self.queue.commit_id());
        self.catch_up(now);
        self.dispatch_effects(now);
        let sync_deadline = self.requester.poll(now).ok().flatten();
        match (queue_deadline, sync_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn dispatch_effects(&mut self, now: Instant) {
        for effect in self.queue.take_effects() {
            match effect {
                Effect::Broadcast(change) => {
                    for peer in self.registry.broadcast_targets() {
                        self.transport.send(peer, Package::Change(change.clone()));
                    }
                }
                Effect::RequestMissing(id) => {
                    match self.registry.random_ready_peer(&mut self.rng) {
                        Some(peer) => self.transport.send(peer, Package::MissingChange { id }),
                        None => debug!(id = id.0, "service.no_peer_for_missing"),
                    }
                }
                Effect::RequestSync { first, last } => {
                    debug!(first = first.0, last = last.0, "service.request_sync");
                    self.start_sync(first, now);
                }
            }
        }
    }

    fn catch_up(&mut self, now: Instant) {
        if self.caught_up
            || self.sync_blocked
            || self.requester.is_active()
            || !self.registry.has_ready_peer()
        {
            return;
        }
        self.start_sync(self.queue.commit_id().next(), now);
    }

    fn fall_behind(&mut self) {
        if self.caught_up {
            debug!("service.catch_up_needed");
        }
        self.caught_up = false;
        self.registry
            .set_status(self.registry.this_id(), NodeStatus::Synchronizing);
    }

    fn sync_finished(&mut self, from: NodeId, last_id: ChangeId) {
        if !self.caught_up {
            info!(
                %from,
                last_id = last_id.0,
                commit_id = self.queue.commit_id().0,
                "service.caught_up"
            );
        }
        self.caught_up = true;
        self.registry
            .set_status(self.registry.this_id(), NodeStatus::Ready);
    }

    fn start_sync(&mut self, first_id: ChangeId, now: Instant) {
        if self.requester.is_active() {
            return;
        }
        match self.registry.random_ready_peer(&mut self.rng) {
            Some(peer) => {
                let package = self.requester.start(peer, first_id, now);
                self.transport.send(peer, package);
            }
            None => warn!(first_id = first_id.0, "service.no_peer_for_sync"),
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { payload, resp } => {
                let _ = resp.send(self.create_local(payload));
            }
            Command::SubmitTasks { tasks, resp } => {
                let _ = resp.send(self.create_from_tasks(&tasks));
            }
            Command::Deliver { from, package } => self.handle_package(from, package),
            Command::SetPeerStatus { node, status, resp } => {
                let was_live = self
                    .registry
                    .node(node)
                    .is_some_and(|info| info.status.is_live());
                let known =
                    node != self.registry.this_id() && self.registry.set_status(node, status);
                if known && !status.is_live() {
                    self.close_streams(node);
                } else if known && !was_live && status == NodeStatus::Ready {
                    self.fall_behind();
                }
                let _ = resp.send(known);
            }
            Command::AddNode { node, zone, resp } => {
                let result = self
                    .registry
                    .check_add()
                    .and_then(|()| self.registry.add_node(NodeInfo::new(node, zone)));
                let _ = resp.send(result);
            }
            Command::RemoveNode { node, resp } => {
                let result = self.registry.remove_node(node);
                if result.is_ok() {
                    self.close_streams(node);
                }
                let _ = resp.send(result);
            }
            Command::Compact { resp } => {
                let _ = resp.send(self.compact());
            }
            Command::Health { resp } => {
                let _ = resp.send(ClusterHealth::collect(
                    &self.registry,
                    &self.queue,
                    self.tail_threshold,
                ));
            }
            Command::CommitId { resp } => {
                let _ = resp.send(self.queue.commit_id());
            }
            Command::Shutdown { .. } => {
                // handled in the select loop
            }
        }
    }

    fn close_streams(&mut self, node: NodeId) {
        self.responder.abort(node);
        if self.requester.peer() == Some(node) {
            if let Some((peer, package)) = self.requester.abort() {
                info!(%node, "service.sync_peer_lost");
                self.transport.send(peer, package);
            }
        }
    }

    fn compact(&mut self) -> Result<usize> {
        self.queue.archive().flush()?;
        let lowest = self.registry.lowest_committed_id();
        if lowest == ChangeId(0) {
            return Ok(0);
        }
        let removed = self.queue.archive().truncate_before(lowest.next())?;
        info!(
            lowest_committed = lowest.0,
            removed,
            first_id = self.queue.archive().first_id().0,
            "service.compact"
        );
        Ok(removed)
    }

    // The producer only runs once quorum is confirmed.
    fn create_from_tasks(&mut self, tasks: &[u8]) -> Result<ChangeId> {
        self.registry.require_quorum()?;
        let request = self.producer.make_change(tasks);
        self.create_local(request.payload)
    }

    fn create_local(&mut self, payload: Bytes) -> Result<ChangeId> {
        let change = self.queue.create_local_change(&self.registry, payload)?;
        Ok(change.id)
    }

    fn handle_package(&mut self, from: NodeId, package: Package) {
        debug!(%from, kind = package.kind(), "service.package");
        let now = Self::now();
        match package {
            Package::Change(change) => {
                if let Err(err) = self.queue.receive_remote_change(change) {
                    match err {
                        TesseraError::GapTooLarge { .. } => {
                            self.start_sync(self.queue.commit_id().next(), now);
                        }
                        err if err.is_operator_fault() => {
                            error!(%from, error = %err, "service.operator_fault");
                        }
                        err => warn!(%from, error = %err, "service.change_rejected"),
                    }
                }
            }
            Package::MissingChange { id } => {
                self.note_committed(from, id);
                self.resend(from, id);
            }
            Package::SyncRequest { first_id } => {
                self.note_committed(from, first_id);
                let reply = self.responder.start(from, first_id);
                self.reply_to_stream(from, reply.map(Some));
            }
            Package::SyncPartAck { next_id } => {
                self.note_committed(from, next_id);
                let reply = self.responder.on_ack(from, next_id);
                self.reply_to_stream(from, reply);
            }
            Package::SyncPart(part) => {
                match self.requester.on_part(from, part, &mut self.queue, now) {
                    Ok(SyncOutcome::Ack(ack)) => self.transport.send(from, ack),
                    Ok(SyncOutcome::Done { last_id }) => self.sync_finished(from, last_id),
                    Ok(_) => {}
                    Err(err) => {
                        if err.is_operator_fault() {
                            self.sync_blocked = true;
                            error!(%from, error = %err, "service.operator_fault");
                        } else {
                            warn!(%from, error = %err, "service.sync_part_rejected");
                        }
                        self.transport.send(from, Package::SyncAbort);
                    }
                }
            }
            Package::SyncDone { last_id } => {
                if let SyncOutcome::Done { last_id } = self.requester.on_done(from, last_id) {
                    self.sync_finished(from, last_id);
                }
            }
            Package::SyncTruncated {
                requested,
                first_available,
            } => {
                if let SyncOutcome::NeedsSnapshot { .. } =
                    self.requester.on_truncated(from, requested, first_available)
                {
                    self.sync_blocked = true;
                    error!(
                        %from,
                        requested = requested.0,
                        first_available = first_available.0,
                        "service.needs_snapshot"
                    );
                }
            }
            Package::SyncAbort => {
                self.requester.on_abort(from);
                self.responder.abort(from);
            }
        }
    }

    // A peer asking for `next` has committed everything below it.
    fn note_committed(&mut self, peer: NodeId, next: ChangeId) {
        let committed = ChangeId(next.0.saturating_sub(1));
        let known = self.registry.node(peer).map(|node| node.committed_id);
        if known.is_some_and(|known| committed > known) {
            self.registry.set_committed(peer, committed);
        }
    }

    fn reply_to_stream(&mut self, peer: NodeId, reply: Result<Option<Package>>) {
        match reply {
            Ok(Some(package)) => self.transport.send(peer, package),
            Ok(None) => {}
            Err(TesseraError::HistoryTruncated {
                requested,
                first_available,
            }) => self.transport.send(
                peer,
                Package::SyncTruncated {
                    requested,
                    first_available,
                },
            ),
            Err(err) => {
                warn!(%peer, error = %err, "service.sync_stream_failed");
                self.transport.send(peer, Package::SyncAbort);
            }
        }
    }

    fn resend(&mut self, peer: NodeId, id: ChangeId) {
        let change = match self.queue.archive().get(id) {
            Ok(Some(ArchiveRecord::Applied(change))) => Some(change),
            Ok(_) => self.queue.pending_change(id).cloned(),
            Err(err) => {
                warn!(id = id.0, error = %err, "service.resend_failed");
                None
            }
        };
        match change {
            Some(change) => self.transport.send(peer, Package::Change(change)),
            None => debug!(%peer, id = id.0, "service.missing_unknown"),
        }
    }
}

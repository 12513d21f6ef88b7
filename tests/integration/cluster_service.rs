#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::{tempdir, TempDir};
use tessera::{
    archive::{Archive, ArchiveOptions},
    changes::{Change, ChangeRequest, TaskApplier, TaskProducer},
    cluster::NodeStatus,
    node::{
        ChangeQueueService, Check, ClusterHealth, HealthStatus, NodeConfig, PeerConfig,
        ServiceHandle,
    },
    proto::{Package, Transport},
    types::{ApplyError, ChangeId, NodeId, Result, TesseraError},
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Envelope = (NodeId, NodeId, Package);

#[derive(Clone, Default)]
struct SharedLedger(Arc<Mutex<Vec<Vec<u8>>>>);

impl SharedLedger {
    fn snapshot(&self) -> Vec<Vec<u8>> {
        self.0.lock().clone()
    }
}

impl TaskApplier for SharedLedger {
    fn apply(&mut self, task_list: &[u8]) -> std::result::Result<(), ApplyError> {
        self.0.lock().push(task_list.to_vec());
        Ok(())
    }
}

struct Link {
    from: NodeId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Transport for Link {
    fn send(&self, peer: NodeId, package: Package) {
        let _ = self.tx.send((self.from, peer, package));
    }
}

#[derive(Clone, Default)]
struct Router {
    routes: Arc<Mutex<HashMap<NodeId, ServiceHandle>>>,
    // drops the first broadcast of one change id to one node
    drop_change: Arc<Mutex<Option<(NodeId, ChangeId)>>>,
    // turns the next sync ack sent by this node into an abort on both ends
    cut_stream_of: Arc<Mutex<Option<NodeId>>>,
    sync_requests: Arc<Mutex<Vec<(NodeId, ChangeId)>>>,
}

impl Router {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some((from, to, package)) = rx.recv().await {
            match &package {
                Package::Change(change) => {
                    let mut rule = self.drop_change.lock();
                    if *rule == Some((to, change.id)) {
                        *rule = None;
                        continue;
                    }
                }
                Package::SyncRequest { first_id } => {
                    self.sync_requests.lock().push((from, *first_id));
                }
                Package::SyncPartAck { .. } => {
                    let cut = {
                        let mut rule = self.cut_stream_of.lock();
                        if *rule == Some(from) {
                            *rule = None;
                            true
                        } else {
                            false
                        }
                    };
                    if cut {
                        self.deliver(from, to, Package::SyncAbort).await;
                        self.deliver(to, from, Package::SyncAbort).await;
                        continue;
                    }
                }
                _ => {}
            }
            self.deliver(from, to, package).await;
        }
    }

    async fn deliver(&self, from: NodeId, to: NodeId, package: Package) {
        let handle = self.routes.lock().get(&to).cloned();
        if let Some(handle) = handle {
            let _ = handle.deliver(from, package).await;
        }
    }

    fn requests_from(&self, node: u32) -> Vec<ChangeId> {
        self.sync_requests
            .lock()
            .iter()
            .filter(|(from, _)| *from == NodeId(node))
            .map(|(_, first_id)| *first_id)
            .collect()
    }
}

struct Node {
    handle: ServiceHandle,
    ledger: SharedLedger,
    task: JoinHandle<()>,
    dir: TempDir,
}

struct Cluster {
    members: u32,
    nodes: HashMap<NodeId, Node>,
    tx: mpsc::UnboundedSender<Envelope>,
    router: Router,
}

fn config(dir: &TempDir, id: u32, members: u32) -> NodeConfig {
    let mut config = NodeConfig::testing(dir.path());
    config.node_id = id;
    config.redundancy = 2;
    config.sync_part_size = 256;
    config.max_segment_changes = 4;
    config.peers = (1..=members)
        .filter(|&peer| peer != id)
        .map(|peer| PeerConfig { id: peer, zone: 0 })
        .collect();
    config
}

impl Cluster {
    async fn start(members: u32) -> Result<Self> {
        Self::start_some(members, members).await
    }

    // Configures `members` nodes but only runs the first `running` of them.
    async fn start_some(members: u32, running: u32) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
        let router = Router::default();
        tokio::spawn(router.clone().run(rx));
        let mut cluster = Self {
            members,
            nodes: HashMap::new(),
            tx,
            router,
        };
        for id in 1..=running {
            cluster.join(id).await?;
        }
        Ok(cluster)
    }

    async fn join(&mut self, id: u32) -> Result<()> {
        self.join_in(id, tempdir()?).await
    }

    // Starts node `id` on `dir` and connects it with every running node.
    async fn join_in(&mut self, id: u32, dir: TempDir) -> Result<()> {
        let config = config(&dir, id, self.members);
        let node = spawn_node(dir, &config, self.tx.clone())?;
        self.router.routes.lock().insert(NodeId(id), node.handle.clone());
        let running: Vec<NodeId> = self.nodes.keys().copied().collect();
        self.nodes.insert(NodeId(id), node);
        for other in running {
            self.handle(other.0)
                .set_peer_status(NodeId(id), NodeStatus::Ready)
                .await?;
            self.handle(id)
                .set_peer_status(other, NodeStatus::Ready)
                .await?;
        }
        Ok(())
    }

    // Shuts node `id` down and hands back its archive directory.
    async fn stop(&mut self, id: u32) -> Result<TempDir> {
        self.router.routes.lock().remove(&NodeId(id));
        let node = self.nodes.remove(&NodeId(id)).expect("running node");
        node.handle.shutdown().await?;
        node.task.await.expect("service task");
        for other in self.nodes.values() {
            other
                .handle
                .set_peer_status(NodeId(id), NodeStatus::Offline)
                .await?;
        }
        Ok(node.dir)
    }

    fn handle(&self, id: u32) -> &ServiceHandle {
        &self.nodes[&NodeId(id)].handle
    }

    fn ledger(&self, id: u32) -> Vec<Vec<u8>> {
        self.nodes[&NodeId(id)].ledger.snapshot()
    }

    async fn wait_for_commit(&self, id: u32, target: ChangeId) -> Result<()> {
        for _ in 0..500 {
            if self.handle(id).commit_id().await? >= target {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node {id} never reached {target}");
    }

    async fn wait_until_healthy(&self, id: u32) -> Result<ClusterHealth> {
        for _ in 0..500 {
            let health = self.handle(id).health().await?;
            if health.status == HealthStatus::Healthy {
                return Ok(health);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node {id} never became healthy");
    }
}

fn spawn_node(dir: TempDir, config: &NodeConfig, tx: mpsc::UnboundedSender<Envelope>) -> Result<Node> {
    let ledger = SharedLedger::default();
    let link = Link {
        from: NodeId(config.node_id),
        tx,
    };
    let (service, handle) = ChangeQueueService::open(config, ledger.clone(), link)?;
    let task = tokio::spawn(service.with_rng_seed(u64::from(config.node_id)).run());
    Ok(Node {
        handle,
        ledger,
        task,
        dir,
    })
}

fn quorum_required(health: &ClusterHealth) -> Option<usize> {
    health.checks.iter().find_map(|check| match check {
        Check::Quorum { required, .. } => Some(*required),
        _ => None,
    })
}

fn segment_files(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path())
        .expect("archive dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "seg"))
        .count()
}

#[tokio::test(start_paused = true)]
async fn submitted_changes_reach_every_node_in_order() -> Result<()> {
    let cluster = Cluster::start(3).await?;
    let mut ids = Vec::new();
    for (node, payload) in [(1, "a"), (2, "b"), (1, "c")] {
        ids.push(cluster.handle(node).submit(payload.as_bytes().to_vec()).await?);
        cluster.wait_for_commit(node, *ids.last().unwrap()).await?;
        for other in 1..=3 {
            cluster.wait_for_commit(other, *ids.last().unwrap()).await?;
        }
    }

    assert_eq!(ids, vec![ChangeId(1), ChangeId(2), ChangeId(3)]);
    let expected = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
    for node in 1..=3 {
        assert_eq!(cluster.ledger(node), expected);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropped_broadcast_is_fetched_from_a_peer() -> Result<()> {
    let cluster = Cluster::start(3).await?;
    *cluster.router.drop_change.lock() = Some((NodeId(3), ChangeId(1)));

    for payload in ["x1", "x2", "x3"] {
        cluster.handle(1).submit(payload.as_bytes().to_vec()).await?;
    }
    cluster.wait_for_commit(3, ChangeId(3)).await?;

    assert_eq!(
        cluster.ledger(3),
        vec![b"x1".to_vec(), b"x2".to_vec(), b"x3".to_vec()]
    );
    let health = cluster.handle(3).health().await?;
    assert_eq!(health.counters.skipped_with_gap, 0);
    assert_eq!(health.status, HealthStatus::Healthy);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unrecoverable_gap_is_skipped_after_timeout() -> Result<()> {
    let cluster = Cluster::start(3).await?;
    let stray = Change::new(ChangeId(2), NodeId(9), &b"orphan"[..]);
    cluster
        .handle(2)
        .deliver(NodeId(1), Package::Change(stray))
        .await?;

    cluster.wait_for_commit(2, ChangeId(2)).await?;
    assert_eq!(cluster.ledger(2), vec![b"orphan".to_vec()]);

    let health = cluster.handle(2).health().await?;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.counters.skipped_with_gap, 1);
    assert!(health
        .checks
        .iter()
        .any(|check| matches!(check, Check::SkippedIds { count: 1, healthy: false })));

    // a late copy of the skipped id is discarded, never applied
    let late = Change::new(ChangeId(1), NodeId(9), &b"late"[..]);
    cluster.handle(2).deliver(NodeId(1), Package::Change(late)).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.handle(2).health().await?.counters.discarded, 1);
    assert_eq!(cluster.ledger(2), vec![b"orphan".to_vec()]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn lost_quorum_refuses_submissions() -> Result<()> {
    let cluster = Cluster::start(3).await?;
    let handle = cluster.handle(1);
    handle.set_peer_status(NodeId(2), NodeStatus::Offline).await?;
    handle.set_peer_status(NodeId(3), NodeStatus::ShuttingDown).await?;

    let err = handle.submit(b"nope".to_vec()).await.unwrap_err();
    assert!(matches!(err, TesseraError::NotQuorum { live: 1, required: 2 }));
    let health = handle.health().await?;
    assert_eq!(health.status, HealthStatus::Unhealthy);

    assert!(!handle.set_peer_status(NodeId(42), NodeStatus::Ready).await?);
    handle.set_peer_status(NodeId(2), NodeStatus::Ready).await?;
    assert_eq!(handle.submit(b"yes".to_vec()).await?, ChangeId(1));
    Ok(())
}

struct Upper;

impl TaskProducer for Upper {
    fn make_change(&self, task_list: &[u8]) -> ChangeRequest {
        ChangeRequest {
            payload: task_list.to_ascii_uppercase().into(),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_and_restart_replays() -> Result<()> {
    let dir = tempdir()?;
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut cfg = config(&dir, 1, 1);
    cfg.redundancy = 1;

    let ledger = SharedLedger::default();
    let link = Link {
        from: NodeId(1),
        tx: tx.clone(),
    };
    let (service, handle) = ChangeQueueService::open(&cfg, ledger.clone(), link)?;
    let task = tokio::spawn(service.with_producer(Upper).run());
    handle.submit_tasks(&b"insert"[..]).await?;
    handle.submit(&b"raw"[..]).await?;
    assert_eq!(handle.commit_id().await?, ChangeId(2));
    handle.shutdown().await?;
    task.await.expect("service task");
    assert!(matches!(handle.commit_id().await, Err(TesseraError::Closed)));

    let archive = Archive::open(dir.path(), ArchiveOptions::default())?;
    assert_eq!(archive.last_id(), ChangeId(2));
    assert_eq!(archive.stats().segments, 1);
    drop(archive);

    let replayed = SharedLedger::default();
    let link = Link { from: NodeId(1), tx };
    let (service, handle) = ChangeQueueService::open(&cfg, replayed.clone(), link)?;
    assert_eq!(replayed.snapshot(), vec![b"INSERT".to_vec(), b"raw".to_vec()]);
    let task = tokio::spawn(service.run());
    assert_eq!(handle.submit(&b"next"[..]).await?, ChangeId(3));
    handle.cancel_token().cancel();
    task.await.expect("service task");
    assert_eq!(ledger.snapshot().len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopped_nodes_close_their_handles() -> Result<()> {
    let cluster = Cluster::start(2).await?;
    let Cluster { nodes, tx, .. } = cluster;
    drop(tx);
    for (_, node) in nodes {
        node.handle.shutdown().await?;
        node.task.await.expect("service task");
        assert!(matches!(
            node.handle.submit(&b"late"[..]).await,
            Err(TesseraError::Closed)
        ));
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn node_without_ready_peers_stays_synchronizing() -> Result<()> {
    let dir = tempdir()?;
    let (tx, _rx) = mpsc::unbounded_channel();
    let config = config(&dir, 1, 3);
    let node = spawn_node(dir, &config, tx)?;

    let health = node.handle.health().await?;
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(node.handle.commit_id().await?, ChangeId(0));
    assert!(health.checks.contains(&Check::LocalStatus {
        status: NodeStatus::Synchronizing,
        healthy: false,
    }));
    // the local status follows catch-up, not callers
    assert!(!node.handle.set_peer_status(NodeId(1), NodeStatus::Ready).await?);
    node.handle.shutdown().await?;
    node.task.await.expect("service task");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn new_member_catches_up_before_it_is_ready() -> Result<()> {
    let mut cluster = Cluster::start_some(3, 2).await?;
    for (node, payload) in [(1, "a"), (2, "b"), (1, "c")] {
        let id = cluster.handle(node).submit(payload.as_bytes().to_vec()).await?;
        cluster.wait_for_commit(1, id).await?;
        cluster.wait_for_commit(2, id).await?;
    }

    cluster.join(3).await?;
    cluster.wait_for_commit(3, ChangeId(3)).await?;
    let health = cluster.wait_until_healthy(3).await?;
    assert!(health.checks.contains(&Check::LocalStatus {
        status: NodeStatus::Ready,
        healthy: true,
    }));
    assert_eq!(cluster.router.requests_from(3)[0], ChangeId(1));
    let expected = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
    assert_eq!(cluster.ledger(3), expected);

    let id = cluster.handle(3).submit(&b"d"[..]).await?;
    assert_eq!(id, ChangeId(4));
    for node in 1..=3 {
        cluster.wait_for_commit(node, id).await?;
        assert_eq!(cluster.ledger(node).len(), 4);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restarted_member_streams_what_it_missed() -> Result<()> {
    let mut cluster = Cluster::start(3).await?;
    let first = cluster.handle(1).submit(&b"a"[..]).await?;
    for node in 1..=3 {
        cluster.wait_for_commit(node, first).await?;
    }

    let dir = cluster.stop(3).await?;
    for payload in ["b", "c", "d"] {
        cluster.handle(2).submit(payload.as_bytes().to_vec()).await?;
    }
    cluster.wait_for_commit(1, ChangeId(4)).await?;

    cluster.join_in(3, dir).await?;
    cluster.wait_for_commit(3, ChangeId(4)).await?;
    cluster.wait_until_healthy(3).await?;
    // the archived prefix is replayed locally, only the rest is streamed
    assert!(cluster.router.requests_from(3).contains(&ChangeId(2)));
    assert_eq!(
        cluster.ledger(3),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn aborted_stream_resumes_after_the_fed_prefix() -> Result<()> {
    let mut cluster = Cluster::start_some(3, 2).await?;
    let payloads: Vec<Vec<u8>> = (1..=30)
        .map(|i| format!("change-{i:02}-with-some-padding").into_bytes())
        .collect();
    for payload in &payloads {
        cluster.handle(1).submit(payload.clone()).await?;
    }
    cluster.wait_for_commit(1, ChangeId(30)).await?;
    cluster.wait_for_commit(2, ChangeId(30)).await?;

    *cluster.router.cut_stream_of.lock() = Some(NodeId(3));
    cluster.join(3).await?;
    cluster.wait_for_commit(3, ChangeId(30)).await?;
    cluster.wait_until_healthy(3).await?;

    assert!(cluster.router.cut_stream_of.lock().is_none(), "stream was never cut");
    let requests = cluster.router.requests_from(3);
    assert_eq!(requests[0], ChangeId(1));
    assert!(
        requests[1..]
            .iter()
            .any(|&first_id| first_id > ChangeId(1) && first_id <= ChangeId(30)),
        "no resumed request in {requests:?}"
    );
    // every change applied exactly once across both streams
    assert_eq!(cluster.ledger(3), payloads);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn compaction_keeps_history_a_peer_still_needs() -> Result<()> {
    let cluster = Cluster::start(2).await?;
    for i in 1..=12u8 {
        cluster.handle(1).submit(vec![i; 8]).await?;
    }
    cluster.wait_for_commit(1, ChangeId(12)).await?;
    cluster.wait_for_commit(2, ChangeId(12)).await?;

    // node 2 has not reported past id 0 yet
    assert_eq!(cluster.handle(1).compact().await?, 0);
    let node_1_dir = &cluster.nodes[&NodeId(1)].dir;
    let before = segment_files(node_1_dir);
    assert!(before >= 3, "expected rotated segments, found {before}");

    // a reconnect makes node 2 ask for everything after its commit id
    let handle = cluster.handle(2);
    handle.set_peer_status(NodeId(1), NodeStatus::Offline).await?;
    handle.set_peer_status(NodeId(1), NodeStatus::Ready).await?;
    cluster.wait_until_healthy(2).await?;
    assert!(cluster.router.requests_from(2).contains(&ChangeId(13)));

    assert_eq!(cluster.handle(1).compact().await?, before - 1);
    assert_eq!(segment_files(node_1_dir), 1);
    assert_eq!(cluster.ledger(1).len(), 12);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn membership_changes_rebuild_quorum() -> Result<()> {
    let cluster = Cluster::start(3).await?;
    let handle = cluster.handle(1);

    handle.set_peer_status(NodeId(2), NodeStatus::Offline).await?;
    assert!(matches!(
        handle.add_node(NodeId(4), 0).await,
        Err(TesseraError::Config(_))
    ));
    handle.set_peer_status(NodeId(2), NodeStatus::Ready).await?;

    handle.add_node(NodeId(4), 1).await?;
    assert_eq!(quorum_required(&handle.health().await?), Some(3));
    assert!(handle.add_node(NodeId(4), 1).await.is_err());
    assert!(handle.set_peer_status(NodeId(4), NodeStatus::Connecting).await?);
    assert_eq!(handle.submit(&b"three of four"[..]).await?, ChangeId(1));

    handle.remove_node(NodeId(4)).await?;
    assert_eq!(quorum_required(&handle.health().await?), Some(2));
    assert!(!handle.set_peer_status(NodeId(4), NodeStatus::Ready).await?);
    assert!(matches!(
        handle.remove_node(NodeId(1)).await,
        Err(TesseraError::Invalid(_))
    ));
    Ok(())
}

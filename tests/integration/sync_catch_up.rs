#![allow(missing_docs)]

use std::time::{Duration, Instant};

use tempfile::{tempdir, TempDir};
use tessera::{
    archive::{Archive, ArchiveOptions, ArchiveRecord},
    changes::{Change, ChangeQueue, ChangeStatus, QueueOptions},
    proto::Package,
    sync::{SyncOptions, SyncOutcome, SyncRequester, SyncResponder, SyncState},
    types::{ApplyError, ChangeId, NodeId, Result, TesseraError, TimeoutKind},
};

const SERVER: NodeId = NodeId(1);
const CLIENT: NodeId = NodeId(2);

#[derive(Default)]
struct Ledger {
    applied: Vec<Vec<u8>>,
}

impl tessera::changes::TaskApplier for Ledger {
    fn apply(&mut self, task_list: &[u8]) -> std::result::Result<(), ApplyError> {
        self.applied.push(task_list.to_vec());
        Ok(())
    }
}

fn options() -> SyncOptions {
    SyncOptions {
        part_size: 512,
        timeout: Duration::from_secs(5),
    }
}

fn serving_archive(last: u64) -> Result<(TempDir, Archive)> {
    let dir = tempdir()?;
    let archive = Archive::open(
        dir.path(),
        ArchiveOptions {
            flush_threshold: 1_000,
            max_segment_changes: 16,
            max_segment_bytes: 1 << 20,
        },
    )?;
    for id in 1..=last {
        let record = if id == 10 {
            ArchiveRecord::Skipped(ChangeId(id))
        } else {
            let mut change = Change::new(ChangeId(id), SERVER, format!("op-{id}").into_bytes());
            change.status = ChangeStatus::Applied;
            ArchiveRecord::Applied(change)
        };
        archive.push(record)?;
    }
    archive.flush()?;
    Ok((dir, archive))
}

fn lagging_queue() -> Result<(TempDir, ChangeQueue)> {
    let dir = tempdir()?;
    let archive = Archive::open(dir.path(), ArchiveOptions::default())?;
    Ok((dir, ChangeQueue::new(CLIENT, archive, QueueOptions::default())))
}

// Packages cross the wire encoded, as a real transport would carry them.
fn wire(package: Package) -> Result<Package> {
    Package::decode(package.encode())
}

#[test]
fn lagging_node_catches_up_part_by_part() -> Result<()> {
    let (_server_dir, server_archive) = serving_archive(60)?;
    let (_client_dir, mut queue) = lagging_queue()?;
    let mut responder = SyncResponder::new(server_archive, options());
    let mut requester = SyncRequester::new(options());
    let mut ledger = Ledger::default();
    let now = Instant::now();

    let request = wire(requester.start(SERVER, queue.commit_id().next(), now))?;
    let Package::SyncRequest { first_id } = request else {
        panic!("expected a sync request, got {}", request.kind());
    };
    let mut outbound = Some(responder.start(CLIENT, first_id)?);
    let mut parts = 0;
    while let Some(package) = outbound.take() {
        let Package::SyncPart(part) = wire(package)? else {
            panic!("expected a sync part");
        };
        parts += 1;
        match requester.on_part(SERVER, part, &mut queue, now)? {
            SyncOutcome::Ack(ack) => {
                let Package::SyncPartAck { next_id } = wire(ack)? else {
                    panic!("expected an ack");
                };
                outbound = responder.on_ack(CLIENT, next_id)?;
            }
            SyncOutcome::Done { last_id } => assert_eq!(last_id, ChangeId(60)),
            other => panic!("unexpected outcome {other:?}"),
        }
        queue.drive_commit_loop(&mut ledger)?;
    }

    assert!(parts > 1, "part size should split the stream");
    assert_eq!(requester.state(), SyncState::Done);
    assert_eq!(requester.received(), 60);
    assert_eq!(responder.active(), 0);
    assert_eq!(queue.commit_id(), ChangeId(60));
    assert!(queue.is_skipped(ChangeId(10)));
    assert_eq!(ledger.applied.len(), 59);
    assert_eq!(ledger.applied[9], b"op-11".to_vec());
    assert_eq!(queue.archive().get(ChangeId(10))?, Some(ArchiveRecord::Skipped(ChangeId(10))));
    Ok(())
}

#[test]
fn up_to_date_requester_gets_done_immediately() -> Result<()> {
    let (_dir, archive) = serving_archive(5)?;
    let mut responder = SyncResponder::new(archive, options());
    let mut requester = SyncRequester::new(options());
    let now = Instant::now();

    requester.start(SERVER, ChangeId(6), now);
    let reply = wire(responder.start(CLIENT, ChangeId(6))?)?;
    assert_eq!(reply, Package::SyncDone { last_id: ChangeId(5) });
    let Package::SyncDone { last_id } = reply else {
        unreachable!();
    };
    assert_eq!(
        requester.on_done(SERVER, last_id),
        SyncOutcome::Done { last_id: ChangeId(5) }
    );
    assert!(!requester.is_active());
    Ok(())
}

#[test]
fn truncated_history_asks_for_a_snapshot() -> Result<()> {
    let (_dir, archive) = serving_archive(48)?;
    archive.truncate_before(ChangeId(40))?;
    assert_eq!(archive.first_id(), ChangeId(33));
    let mut responder = SyncResponder::new(archive, options());
    let mut requester = SyncRequester::new(options());

    requester.start(SERVER, ChangeId(20), Instant::now());
    let err = responder.start(CLIENT, ChangeId(20)).unwrap_err();
    let TesseraError::HistoryTruncated {
        requested,
        first_available,
    } = err
    else {
        panic!("expected truncated history, got {err}");
    };
    let reply = wire(Package::SyncTruncated {
        requested,
        first_available,
    })?;
    let Package::SyncTruncated {
        requested,
        first_available,
    } = reply
    else {
        unreachable!();
    };
    assert_eq!(
        requester.on_truncated(SERVER, requested, first_available),
        SyncOutcome::NeedsSnapshot {
            requested: ChangeId(20),
            first_available: ChangeId(33),
        }
    );
    assert_eq!(requester.state(), SyncState::Failed);
    Ok(())
}

#[test]
fn silent_responder_times_out() -> Result<()> {
    let mut requester = SyncRequester::new(options());
    let start = Instant::now();
    requester.start(SERVER, ChangeId(1), start);

    assert_eq!(requester.poll(start)?, Some(start + Duration::from_secs(5)));
    assert!(matches!(
        requester.poll(start + Duration::from_secs(5)),
        Err(TesseraError::Timeout(TimeoutKind::SyncStream))
    ));
    assert_eq!(requester.state(), SyncState::Failed);
    assert_eq!(requester.poll(start + Duration::from_secs(6))?, None);
    Ok(())
}

#[test]
fn parts_from_another_peer_are_ignored() -> Result<()> {
    let (_server_dir, archive) = serving_archive(4)?;
    let (_client_dir, mut queue) = lagging_queue()?;
    let mut responder = SyncResponder::new(archive, options());
    let mut requester = SyncRequester::new(options());
    let now = Instant::now();

    requester.start(SERVER, ChangeId(1), now);
    let Package::SyncPart(part) = responder.start(CLIENT, ChangeId(1))? else {
        panic!("expected a sync part");
    };
    assert_eq!(
        requester.on_part(NodeId(9), part, &mut queue, now)?,
        SyncOutcome::Ignored
    );
    assert_eq!(queue.pending_len(), 0);

    assert_eq!(requester.on_abort(SERVER), SyncOutcome::Aborted);
    assert!(!responder.abort(CLIENT));
    Ok(())
}

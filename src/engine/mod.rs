mod access;
mod billing;
mod booking;
mod error;
mod identity;
mod ledger;
mod lessons;
mod outbox;
mod queries;
mod scheduling;
mod teachers;
mod txn;

pub use error::EngineError;
pub use ledger::Ledger;
pub use lessons::LessonChanges;
pub use teachers::ProfileChanges;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, mpsc, oneshot, watch};

use crate::clock::Clock;
use crate::config::Policy;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use txn::Txn;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        seq: u64,
        frame: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// How far the WAL is known to be on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Durability {
    /// Every frame up to and including this sequence number is fsynced.
    UpTo(u64),
    /// A write failed; nothing after the last durable frame will ever be.
    Failed,
}

struct PendingFrame {
    seq: u64,
    frame: Vec<Event>,
    response: oneshot::Sender<io::Result<()>>,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Publish the new durable sequence number and respond to all senders.
///
/// After a failed flush the log is poisoned: later appends and compactions
/// are refused, since the in-memory state already ran ahead of the file.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>, durable: watch::Sender<Durability>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { seq, frame, response } => {
                let mut batch = vec![PendingFrame { seq, frame, response }];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { seq, frame, response }) => {
                            batch.push(PendingFrame { seq, frame, response })
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, batch, &durable);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other, &durable);
                }
            }
            other => handle_non_append(&mut wal, other, &durable),
        }
    }
}

fn poisoned() -> io::Error {
    io::Error::other("write-ahead log is unavailable after an earlier failure")
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingFrame>, durable: &watch::Sender<Durability>) {
    if *durable.borrow() == Durability::Failed {
        for pending in batch {
            let _ = pending.response.send(Err(poisoned()));
        }
        return;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    match &result {
        Ok(()) => {
            if let Some(last) = batch.last() {
                durable.send_replace(Durability::UpTo(last.seq));
            }
        }
        Err(e) => {
            tracing::error!("WAL flush failed: {e}");
            durable.send_replace(Durability::Failed);
        }
    }
    for pending in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = pending.response.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingFrame]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for pending in batch {
        if let Err(e) = wal.append_buffered(&pending.frame) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand, durable: &watch::Sender<Durability>) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = if *durable.borrow() == Durability::Failed {
                Err(poisoned())
            } else {
                Wal::write_compact_file(wal.path(), &snapshot).and_then(|()| wal.swap_compact_file())
            };
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { seq, frame, response } => {
            commit_batch(wal, vec![PendingFrame { seq, frame, response }], durable);
        }
    }
}

/// One tenant's marketplace: the ledger, its WAL writer, and the policy that drives transitions.
///
/// Writers apply a transaction to the ledger as soon as its frame is queued
/// and wait for the fsync after releasing the lock, so concurrent
/// transactions share one flush. Readers wait until everything they can see
/// is durable.
pub struct Engine {
    ledger: RwLock<Ledger>,
    wal_tx: mpsc::Sender<WalCommand>,
    durable: watch::Receiver<Durability>,
    pub notify: Arc<NotifyHub>,
    clock: Clock,
    policy: Policy,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: Clock, policy: Policy) -> io::Result<Self> {
        let (wal, frames) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        let (durable_tx, durable) = watch::channel(Durability::UpTo(0));
        tokio::spawn(wal_writer_loop(wal, wal_rx, durable_tx));

        let mut ledger = Ledger::new();
        let mut replayed = 0usize;
        for frame in &frames {
            for event in frame {
                ledger.apply(event);
                replayed += 1;
            }
        }
        tracing::debug!(
            "replayed {replayed} events in {} frames from {}",
            frames.len(),
            wal_path.display()
        );

        Ok(Self {
            ledger: RwLock::new(ledger),
            wal_tx,
            durable,
            notify,
            clock,
            policy,
        })
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Read the ledger once everything it contains is on disk.
    pub(super) async fn read(&self) -> RwLockReadGuard<'_, Ledger> {
        let ledger = self.ledger.read().await;
        self.wait_durable(ledger.seq).await;
        ledger
    }

    /// Wait until frame `seq` is fsynced. Returns at once if the WAL has failed.
    async fn wait_durable(&self, seq: u64) {
        let mut durable = self.durable.clone();
        let _ = durable
            .wait_for(|d| match d {
                Durability::UpTo(done) => *done >= seq,
                Durability::Failed => true,
            })
            .await;
    }

    /// Run `op` as one transaction: its staged events become a single WAL
    /// frame. The frame is queued and applied under the ledger lock, which
    /// keeps WAL order equal to apply order; the caller sees the result only
    /// after the frame is durable.
    pub(super) async fn transact<T>(
        &self,
        op: impl FnOnce(&mut Txn<'_>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut ledger = self.ledger.write().await;
        if *self.durable.borrow() == Durability::Failed {
            return Err(EngineError::WalError(poisoned().to_string()));
        }
        let now = self.clock.now();
        let mut tx = Txn::new(&ledger, now, &self.policy);
        let result = op(&mut tx);
        let (frame, last_id, commit_on_error) = tx.finish();

        if frame.is_empty() || (result.is_err() && !commit_on_error) {
            let seen = ledger.seq;
            drop(ledger);
            // The result may be built from frames that are still in flight.
            self.wait_durable(seen).await;
            return result;
        }

        let seq = ledger.seq + 1;
        let (response, durable) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { seq, frame: frame.clone(), response })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        for event in &frame {
            ledger.apply(event);
        }
        ledger.seq = seq;
        if last_id > ledger.last_id {
            ledger.last_id = last_id;
        }
        drop(ledger);

        durable
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        result
    }

    /// Rewrite the WAL as a snapshot of the current state.
    ///
    /// The snapshot is taken and queued under the read lock, so it sits in the
    /// writer's queue exactly between the frames it covers and the ones it
    /// does not. The file I/O happens after the lock is released.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        {
            let ledger = self.ledger.read().await;
            let cutoff = self.clock.now() - self.policy.outbox_retention_ms;
            let snapshot = ledger.snapshot(cutoff);
            self.wal_tx
                .send(WalCommand::Compact { snapshot, response: tx })
                .await
                .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        }
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Publish committed notifications to in-process subscribers.
    fn publish(&self, notifications: &[Notification]) {
        for n in notifications {
            self.notify.send(n);
        }
    }
}

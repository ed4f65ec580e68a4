mod conflict;
mod error;
mod mutations;
mod queries;
mod report;
mod store;

pub use error::EngineError;
pub use report::build_report;
pub use store::Ledger;

use std::io;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};

use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        change: Change,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        changes: Vec<Change>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { change, response } => {
                let mut batch = vec![(change, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { change, response }) => {
                            batch.push((change, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel drained, flush the batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Change, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Change, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (change, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(change) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error: buffered bytes must not leak into
    // the next batch, whose callers were not told about this failure.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Change, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { changes, response } => {
            let result = Wal::write_compact_file(wal.path(), &changes)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The scheduling core of one tenant.
///
/// Every mutation holds the ledger's write lock across its conflict check,
/// its WAL append and its ledger apply, so two conflicting requests can
/// never both pass their checks. Queries take the read lock and see a
/// consistent snapshot.
pub struct Engine {
    pub(super) ledger: RwLock<Ledger>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let changes = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        let mut ledger = Ledger::new();
        let mut skipped = 0usize;
        for change in &changes {
            // A change the ledger rejects was rejected live too; skip it the same way.
            if let Err(e) = ledger.apply(change) {
                skipped += 1;
                warn!("replay: skipping change {change:?}: {e}");
            }
        }
        info!(
            "replayed {} changes from {} ({skipped} skipped)",
            changes.len(),
            wal_path.display()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            ledger: RwLock::new(ledger),
            wal_tx,
        })
    }

    /// Write a change to the WAL via the background group-commit writer.
    async fn wal_append(&self, change: &Change) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                change: change.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Stall every mutation until the guard drops.
    #[cfg(test)]
    pub(crate) async fn hold_writes(&self) -> tokio::sync::RwLockWriteGuard<'_, Ledger> {
        self.ledger.write().await
    }

    /// WAL-append then apply. Callers hold the write lock and have already
    /// validated the change, so the apply cannot fail on a live ledger.
    pub(super) async fn persist_and_apply(
        &self,
        ledger: &mut Ledger,
        change: &Change,
    ) -> Result<(), EngineError> {
        self.wal_append(change).await?;
        ledger.apply(change)
    }
}

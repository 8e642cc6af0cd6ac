use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::Mutex;
use shared::types::{Decision, Ingestion, RawCapture};
use crate::capture::{canonical_path, fingerprint, normalize};
use crate::error::{HistoryError, Result};
use crate::store::{timestamp_now, HistoryDb, Key, NewEntry};

/// One mutex per destination. The map itself is locked only long enough to
/// fetch or create a handle, so different destinations never wait on each other.
#[derive(Default)]
pub struct DestinationLocks {
    handles: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl DestinationLocks {
    pub fn handle(&self, destination_id: i64) -> Arc<Mutex<()>> {
        self.handles
            .lock()
            .entry(destination_id)
            .or_default()
            .clone()
    }

    fn forget(&self, destination_id: i64) {
        self.handles.lock().remove(&destination_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.handles.lock().len()
    }
}

/// Capture ingestion: normalize, fingerprint, and append only when the path
/// differs from the destination's latest entry.
pub struct Ingestor {
    db: Arc<HistoryDb>,
    locks: DestinationLocks,
}

impl Ingestor {
    pub fn new(db: Arc<HistoryDb>) -> Self {
        Self {
            db,
            locks: DestinationLocks::default(),
        }
    }

    pub fn db(&self) -> &HistoryDb {
        &self.db
    }

    /// Ingest a capture, stamped with its own `captured_at` or the current time.
    pub fn ingest(&self, destination_id: i64, capture: &RawCapture) -> Result<Ingestion> {
        self.db.get_destination(Key::Id(destination_id))?;

        let hops = normalize(capture)?;
        let digest = fingerprint(&canonical_path(&hops)).to_hex();

        let handle = self.locks.handle(destination_id);
        let _guard = handle.lock();

        if let Some(latest) = self.db.latest(destination_id)? {
            if latest.fingerprint == digest {
                tracing::debug!(destination_id, fingerprint = %digest, "path unchanged");
                return Ok(Ingestion {
                    entry: latest,
                    decision: Decision::Skipped,
                });
            }
        }

        // Stamped inside the critical section so concurrent callers append in order
        let raw = capture.payload();
        let appended = self.db.append(NewEntry {
            destination_id,
            hops: &hops,
            fingerprint: &digest,
            raw: &raw,
            captured_at: capture.captured_at.unwrap_or_else(timestamp_now),
        });

        // Deleted while this call waited on the lock; ids are never reused
        if let Err(HistoryError::NotFound(_)) = &appended {
            self.locks.forget(destination_id);
        }
        let entry = appended?;

        tracing::debug!(destination_id, fingerprint = %digest, entry_id = entry.id, "path stored");
        Ok(Ingestion {
            entry,
            decision: Decision::Stored,
        })
    }

    /// Deletes a destination and its history, serialized against in-flight
    /// ingestion for the same destination.
    pub fn delete_destination(&self, destination_id: i64) -> Result<u64> {
        let handle = self.locks.handle(destination_id);
        let removed = {
            let _guard = handle.lock();
            self.db.delete_destination(destination_id)
        };
        self.locks.forget(destination_id);
        removed
    }
}

//! Job Record Store
//!
//! Ephemeral key-value storage of [`JobRecord`]s keyed by job id.
//!
//! ## Backends
//! - [`MemoryJobStore`]: process-local map with one mutex per key
//! - [`crate::persistent_store::SledJobStore`]: serialized records in an
//!   embedded sled tree, suitable for sharing between processes on one host
//!
//! Both backends honour the same contract: an absent or expired id reads as
//! `None`, which callers surface as `JobNotFound`.

use crate::error::Result;
use crate::metrics;
use crate::record::JobRecord;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Record lifetime requested by a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Kept until explicitly deleted
    Never,
    /// Evicted once this much time passes without another write
    After(Duration),
}

impl Expiry {
    /// `0` means the record never expires
    pub fn from_secs(secs: u64) -> Self {
        match secs {
            0 => Expiry::Never,
            secs => Expiry::After(Duration::from_secs(secs)),
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// TTL (Time-To-Live) metadata stored alongside a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtlMetadata {
    /// TTL duration in milliseconds (None = no expiration)
    pub ttl_millis: Option<u64>,
    /// Absolute expiration timestamp (Unix millis)
    pub expires_at: Option<i64>,
    /// Write timestamp (Unix millis)
    pub written_at: i64,
}

impl TtlMetadata {
    pub fn new(expiry: Expiry) -> Self {
        let now = now_millis();
        let ttl_millis = match expiry {
            Expiry::Never => None,
            Expiry::After(ttl) => Some(ttl.as_millis().min(i64::MAX as u128) as u64),
        };
        let expires_at = ttl_millis.map(|ttl| now.saturating_add(ttl as i64));

        Self {
            ttl_millis,
            expires_at,
            written_at: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => now_millis() > expires_at,
            None => false,
        }
    }

    /// Remaining lifetime (None if no expiration or already expired)
    pub fn remaining(&self) -> Option<Duration> {
        let expires_at = self.expires_at?;
        let now = now_millis();
        if now < expires_at {
            Some(Duration::from_millis((expires_at - now) as u64))
        } else {
            None
        }
    }
}

/// A record together with its expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub record: JobRecord,
    pub ttl: TtlMetadata,
}

impl StoredEntry {
    pub fn new(record: JobRecord, expiry: Expiry) -> Self {
        Self {
            record,
            ttl: TtlMetadata::new(expiry),
        }
    }
}

/// Storage contract shared by every backend.
///
/// Writes for one id come from a single owning worker; reads may come from
/// any number of pollers concurrently.
pub trait JobStore: Send + Sync {
    /// Insert or replace the record for `id`
    fn write(&self, id: &str, record: &JobRecord, expiry: Expiry) -> Result<()>;

    /// Current record, or `None` when absent or expired
    fn read(&self, id: &str) -> Result<Option<JobRecord>>;

    /// Remove the record; returns whether a live record existed
    fn delete(&self, id: &str) -> Result<bool>;

    /// Atomically modify an existing record. Returns the updated record, or
    /// `None` without writing anything when the id is absent or expired, so a
    /// late writer can never resurrect a deleted job.
    fn update(
        &self,
        id: &str,
        expiry: Expiry,
        apply: &mut dyn FnMut(&mut JobRecord),
    ) -> Result<Option<JobRecord>>;

    /// Drop every expired record; returns how many were removed
    fn purge_expired(&self) -> Result<usize>;
}

#[derive(Default)]
struct Slot {
    /// Set once the slot has been unlinked from the map
    retired: bool,
    entry: Option<StoredEntry>,
}

/// Process-local store: a concurrent map of per-key locked slots.
///
/// Accesses to different ids never contend on the same mutex; accesses to
/// one id are mutually exclusive.
#[derive(Default)]
pub struct MemoryJobStore {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, id: &str) -> Arc<Mutex<Slot>> {
        // Clone the Arc out so the shard lock is released before the key lock is taken
        if let Some(slot) = self.slots.get(id) {
            return Arc::clone(slot.value());
        }
        Arc::clone(self.slots.entry(id.to_string()).or_default().value())
    }

    fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
        // A panic while holding a key lock leaves a whole record behind, never a torn one
        slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` under the key lock of a live (non-retired) slot
    fn with_slot<T>(&self, id: &str, mut f: impl FnMut(&mut Slot) -> T) -> T {
        loop {
            let slot = self.slot(id);
            let mut guard = Self::lock(&slot);
            if guard.retired {
                // Deleted between lookup and lock; fetch the replacement slot
                continue;
            }
            return f(&mut *guard);
        }
    }

    fn unlink(&self, id: &str, slot: &mut Slot, slot_ref: &Arc<Mutex<Slot>>) {
        slot.retired = true;
        slot.entry = None;
        self.slots.remove_if(id, |_, current| Arc::ptr_eq(current, slot_ref));
    }
}

impl JobStore for MemoryJobStore {
    fn write(&self, id: &str, record: &JobRecord, expiry: Expiry) -> Result<()> {
        self.with_slot(id, |slot| {
            slot.entry = Some(StoredEntry::new(record.clone(), expiry));
        });
        metrics::record_store_op("write");
        tracing::debug!(job_id = %id, progress = record.progress, status = %record.status, "Job record written");
        Ok(())
    }

    fn read(&self, id: &str) -> Result<Option<JobRecord>> {
        metrics::record_store_op("read");
        let Some(slot) = self.slots.get(id).map(|s| Arc::clone(s.value())) else {
            return Ok(None);
        };

        let mut guard = Self::lock(&slot);
        if guard.retired {
            return Ok(None);
        }
        let expired = match &guard.entry {
            None => return Ok(None),
            Some(entry) => entry.ttl.is_expired(),
        };
        if expired {
            self.unlink(id, &mut *guard, &slot);
            metrics::RECORDS_EXPIRED.inc();
            tracing::debug!(job_id = %id, "Job record expired on read");
            return Ok(None);
        }
        Ok(guard.entry.as_ref().map(|entry| entry.record.clone()))
    }

    fn delete(&self, id: &str) -> Result<bool> {
        metrics::record_store_op("delete");
        let Some(slot) = self.slots.get(id).map(|s| Arc::clone(s.value())) else {
            return Ok(false);
        };

        let mut guard = Self::lock(&slot);
        if guard.retired {
            return Ok(false);
        }
        let existed = guard
            .entry
            .as_ref()
            .map(|entry| !entry.ttl.is_expired())
            .unwrap_or(false);
        self.unlink(id, &mut *guard, &slot);
        Ok(existed)
    }

    fn update(
        &self,
        id: &str,
        expiry: Expiry,
        apply: &mut dyn FnMut(&mut JobRecord),
    ) -> Result<Option<JobRecord>> {
        metrics::record_store_op("update");
        let Some(slot) = self.slots.get(id).map(|s| Arc::clone(s.value())) else {
            return Ok(None);
        };

        let mut guard = Self::lock(&slot);
        if guard.retired {
            return Ok(None);
        }
        let expired = match &guard.entry {
            None => return Ok(None),
            Some(entry) => entry.ttl.is_expired(),
        };
        if expired {
            self.unlink(id, &mut *guard, &slot);
            metrics::RECORDS_EXPIRED.inc();
            return Ok(None);
        }

        let mut record = match guard.entry.take() {
            Some(entry) => entry.record,
            None => return Ok(None),
        };
        apply(&mut record);
        guard.entry = Some(StoredEntry::new(record.clone(), expiry));
        Ok(Some(record))
    }

    fn purge_expired(&self) -> Result<usize> {
        let candidates: Vec<(String, Arc<Mutex<Slot>>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut purged = 0;
        for (id, slot) in candidates {
            let mut guard = Self::lock(&slot);
            if guard.retired {
                continue;
            }
            let stale = match &guard.entry {
                Some(entry) => entry.ttl.is_expired(),
                None => true,
            };
            if stale {
                if guard.entry.is_some() {
                    purged += 1;
                }
                self.unlink(&id, &mut *guard, &slot);
            }
        }

        if purged > 0 {
            metrics::RECORDS_EXPIRED.inc_by(purged as u64);
            tracing::info!(purged = purged, "Purged expired job records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::JobStatus;

    #[test]
    fn test_ttl_metadata() {
        let never = TtlMetadata::new(Expiry::Never);
        assert!(!never.is_expired());
        assert_eq!(never.remaining(), None);

        let later = TtlMetadata::new(Expiry::After(Duration::from_secs(60)));
        assert!(!later.is_expired());
        assert!(later.remaining().unwrap() <= Duration::from_secs(60));

        let mut past = TtlMetadata::new(Expiry::After(Duration::from_secs(1)));
        past.expires_at = Some(past.written_at - 1);
        assert!(past.is_expired());
        assert_eq!(past.remaining(), None);
    }

    #[test]
    fn test_write_read_delete() {
        let store = MemoryJobStore::new();
        assert_eq!(store.read("a").unwrap(), None);

        let record = JobRecord::queued("a");
        store.write("a", &record, Expiry::Never).unwrap();
        assert_eq!(store.read("a").unwrap(), Some(record));

        assert!(store.delete("a").unwrap());
        assert_eq!(store.read("a").unwrap(), None);
        assert!(!store.delete("a").unwrap());
    }

    #[test]
    fn test_update_absent_does_not_create() {
        let store = MemoryJobStore::new();
        let updated = store
            .update("ghost", Expiry::Never, &mut |r| r.progress = 50)
            .unwrap();
        assert!(updated.is_none());
        assert_eq!(store.read("ghost").unwrap(), None);
    }

    #[test]
    fn test_update_after_delete_is_rejected() {
        let store = MemoryJobStore::new();
        store.write("job", &JobRecord::queued("job"), Expiry::Never).unwrap();
        store.delete("job").unwrap();

        let updated = store
            .update("job", Expiry::Never, &mut |r| r.status = JobStatus::Running)
            .unwrap();
        assert!(updated.is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_expired_record_reads_as_absent() {
        let store = MemoryJobStore::new();
        store
            .write("short", &JobRecord::queued("short"), Expiry::After(Duration::from_millis(20)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(store.read("short").unwrap(), None);
    }

    #[test]
    fn test_purge_expired_keeps_live_records() {
        let store = MemoryJobStore::new();
        store
            .write("stale", &JobRecord::queued("stale"), Expiry::After(Duration::from_millis(10)))
            .unwrap();
        store.write("live", &JobRecord::queued("live"), Expiry::Never).unwrap();
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(store.purge_expired().unwrap(), 1);
        assert!(store.read("live").unwrap().is_some());
        assert_eq!(store.len(), 1);
    }
}

//! Sled-backed job record store
//!
//! Records are serialized with bincode together with their TTL metadata and
//! kept in a dedicated sled tree. There is no per-key locking here: the store
//! relies on the single-writer discipline of the job pipeline, and
//! read-modify-write goes through sled's compare-and-swap.

use crate::error::Result;
use crate::job_store::{Expiry, JobStore, StoredEntry};
use crate::metrics::{self, Timer};
use crate::record::JobRecord;
use sled::Db as SledDb;
use std::path::Path;

const RECORDS_TREE: &str = "job_records";

pub struct SledJobStore {
    db: SledDb,
    records: sled::Tree,
}

impl Clone for SledJobStore {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            records: self.records.clone(),
        }
    }
}

impl SledJobStore {
    pub fn open(path: &Path) -> Result<Self> {
        tracing::info!("Opening job record store at {:?}", path);

        let db = sled::Config::new()
            .path(path)
            // Progress writes are frequent and small; batch the fsyncs
            .flush_every_ms(Some(500))
            .mode(sled::Mode::HighThroughput)
            .use_compression(true)
            .open()?;

        Self::from_db(db)
    }

    /// Throwaway store removed when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: SledDb) -> Result<Self> {
        let records = db.open_tree(RECORDS_TREE)?;
        tracing::info!(records = records.len(), "Job record store ready");
        Ok(Self { db, records })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<StoredEntry> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn encode(entry: &StoredEntry) -> Result<Vec<u8>> {
        Ok(bincode::serialize(entry)?)
    }

    /// Remove `key` only if it still holds `stale`
    fn evict(&self, key: &str, stale: sled::IVec) -> Result<()> {
        if let Ok(()) = self.records.compare_and_swap(key, Some(stale), None as Option<&[u8]>)? {
            metrics::RECORDS_EXPIRED.inc();
            tracing::debug!(job_id = %key, "Job record expired");
        }
        Ok(())
    }
}

impl JobStore for SledJobStore {
    fn write(&self, id: &str, record: &JobRecord, expiry: Expiry) -> Result<()> {
        let timer = Timer::new();
        let bytes = Self::encode(&StoredEntry::new(record.clone(), expiry))?;
        self.records.insert(id.as_bytes(), bytes)?;

        metrics::record_store_op("write");
        tracing::debug!(
            job_id = %id,
            progress = record.progress,
            status = %record.status,
            elapsed_us = timer.elapsed().as_micros() as u64,
            "Job record written"
        );
        Ok(())
    }

    fn read(&self, id: &str) -> Result<Option<JobRecord>> {
        metrics::record_store_op("read");
        let Some(bytes) = self.records.get(id.as_bytes())? else {
            return Ok(None);
        };

        let entry = Self::decode(&bytes)?;
        if entry.ttl.is_expired() {
            self.evict(id, bytes)?;
            return Ok(None);
        }
        Ok(Some(entry.record))
    }

    fn delete(&self, id: &str) -> Result<bool> {
        metrics::record_store_op("delete");
        match self.records.remove(id.as_bytes())? {
            Some(bytes) => Ok(!Self::decode(&bytes)?.ttl.is_expired()),
            None => Ok(false),
        }
    }

    fn update(
        &self,
        id: &str,
        expiry: Expiry,
        apply: &mut dyn FnMut(&mut JobRecord),
    ) -> Result<Option<JobRecord>> {
        metrics::record_store_op("update");
        loop {
            let Some(current) = self.records.get(id.as_bytes())? else {
                return Ok(None);
            };

            let entry = Self::decode(&current)?;
            if entry.ttl.is_expired() {
                self.evict(id, current)?;
                return Ok(None);
            }

            let mut record = entry.record;
            apply(&mut record);
            let next = Self::encode(&StoredEntry::new(record.clone(), expiry))?;

            match self.records.compare_and_swap(id.as_bytes(), Some(current), Some(next))? {
                Ok(()) => return Ok(Some(record)),
                Err(_) => {
                    // Lost a race with a delete or another writer; re-read
                    tracing::debug!(job_id = %id, "Concurrent modification, retrying update");
                }
            }
        }
    }

    fn purge_expired(&self) -> Result<usize> {
        let mut purged = 0;
        for item in self.records.iter() {
            let (key, bytes) = item?;
            let expired = match Self::decode(&bytes) {
                Ok(entry) => entry.ttl.is_expired(),
                Err(e) => {
                    tracing::warn!("Dropping undecodable job record: {}", e);
                    true
                }
            };
            if expired
                && self
                    .records
                    .compare_and_swap(&key, Some(bytes), None as Option<&[u8]>)?
                    .is_ok()
            {
                purged += 1;
            }
        }

        if purged > 0 {
            metrics::RECORDS_EXPIRED.inc_by(purged as u64);
            tracing::info!(purged = purged, "Purged expired job records");
        }
        Ok(purged)
    }
}

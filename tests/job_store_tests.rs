use std::sync::Arc;
use std::time::Duration;
use superres_node::{Expiry, JobRecord, JobStatus, JobStore, MemoryJobStore, SledJobStore};
use tempfile::TempDir;

fn backends(dir: &TempDir) -> Vec<(&'static str, Arc<dyn JobStore>)> {
    vec![
        ("memory", Arc::new(MemoryJobStore::new())),
        ("sled", Arc::new(SledJobStore::open(&dir.path().join("jobs_db")).unwrap())),
    ]
}

#[test]
fn test_contract_round_trip() {
    let dir = TempDir::new().unwrap();
    for (name, store) in backends(&dir) {
        let mut record = JobRecord::queued("job-1");
        record.started_time = Some("2024-01-01T00:00:00+00:00".to_string());
        store.write("job-1", &record, Expiry::Never).unwrap();

        assert_eq!(store.read("job-1").unwrap(), Some(record), "{name}");
        assert_eq!(store.read("job-2").unwrap(), None, "{name}");
        assert!(store.delete("job-1").unwrap(), "{name}");
        assert!(!store.delete("job-1").unwrap(), "{name}");
        assert_eq!(store.read("job-1").unwrap(), None, "{name}");
    }
}

#[test]
fn test_update_never_resurrects() {
    let dir = TempDir::new().unwrap();
    for (name, store) in backends(&dir) {
        store.write("job", &JobRecord::queued("job"), Expiry::Never).unwrap();
        let running = store
            .update("job", Expiry::Never, &mut |r: &mut JobRecord| {
                r.status = JobStatus::Running;
                r.progress = 25;
            })
            .unwrap()
            .unwrap();
        assert_eq!((running.status, running.progress), (JobStatus::Running, 25), "{name}");

        store.delete("job").unwrap();
        let late = store
            .update("job", Expiry::Never, &mut |r: &mut JobRecord| r.progress = 50)
            .unwrap();
        assert!(late.is_none(), "{name}");
        assert_eq!(store.read("job").unwrap(), None, "{name}");
    }
}

#[test]
fn test_expiry_and_sweep() {
    let dir = TempDir::new().unwrap();
    for (name, store) in backends(&dir) {
        let short = Expiry::After(Duration::from_millis(20));
        store.write("a", &JobRecord::queued("a"), short).unwrap();
        store.write("b", &JobRecord::queued("b"), short).unwrap();
        store.write("keep", &JobRecord::queued("keep"), Expiry::from_secs(3600)).unwrap();
        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(store.purge_expired().unwrap(), 2, "{name}");
        assert!(store.read("a").unwrap().is_none(), "{name}");
        assert!(store.read("keep").unwrap().is_some(), "{name}");
    }
}

#[test]
fn test_write_refreshes_ttl() {
    let dir = TempDir::new().unwrap();
    for (name, store) in backends(&dir) {
        let ttl = Expiry::After(Duration::from_millis(80));
        store.write("t", &JobRecord::queued("t"), ttl).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        store
            .update("t", ttl, &mut |r: &mut JobRecord| r.progress = 5)
            .unwrap()
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        // 100ms since the first write, 50ms since the refresh
        assert_eq!(store.read("t").unwrap().map(|r| r.progress), Some(5), "{name}");
    }
}

#[test]
fn test_sled_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("persist_db");
    {
        let store = SledJobStore::open(&path).unwrap();
        let mut record = JobRecord::queued("p");
        record.status = JobStatus::Done;
        record.progress = 100;
        record.output_reference = Some("/outputs/p.png".to_string());
        store.write("p", &record, Expiry::Never).unwrap();
        store.flush().unwrap();
    }

    let reopened = SledJobStore::open(&path).unwrap();
    let record = reopened.read("p").unwrap().unwrap();
    assert!(record.is_done());
    assert_eq!(record.output_reference.as_deref(), Some("/outputs/p.png"));
}

#[test]
fn test_pollers_observe_monotonic_progress() {
    let store = Arc::new(MemoryJobStore::new());
    store.write("w", &JobRecord::queued("w"), Expiry::Never).unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || {
                let mut last = 0u8;
                for _ in 0..500 {
                    let record = store.read("w").unwrap().unwrap();
                    assert!(record.progress >= last, "progress went backwards");
                    last = record.progress;
                }
            })
        })
        .collect();

    for progress in 1..=99u8 {
        store
            .update("w", Expiry::Never, &mut |r: &mut JobRecord| r.progress = progress)
            .unwrap();
    }

    for reader in readers {
        reader.join().unwrap();
    }
}

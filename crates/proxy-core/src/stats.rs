//! `TrafficRecord` bookkeeping (spec §3, §4.4 step 6).
//!
//! Updates are funneled through a bounded, drop-on-full channel (spec §5:
//! "10 000-slot bounded queue... drop-on-full is explicit for the
//! traffic-record channel") so a burst of completed connections never backs
//! up the dispatcher; the background task folds updates into a concurrent
//! map that the admin HTTP collaborator's `/stats/traffic` query reads.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct TrafficRecord {
    pub identifier: String,
    pub is_domain: bool,
    pub upload: AtomicU64,
    pub download: AtomicU64,
    pub first_seen: u64,
    pub last_seen: AtomicU64,
    pub connection_count: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficRecordSnapshot {
    pub identifier: String,
    pub is_domain: bool,
    pub upload: u64,
    pub download: u64,
    pub first_seen: u64,
    pub last_seen: u64,
    pub connection_count: u64,
}

impl From<&TrafficRecord> for TrafficRecordSnapshot {
    fn from(r: &TrafficRecord) -> Self {
        Self {
            identifier: r.identifier.clone(),
            is_domain: r.is_domain,
            upload: r.upload.load(Ordering::Relaxed),
            download: r.download.load(Ordering::Relaxed),
            first_seen: r.first_seen,
            last_seen: r.last_seen.load(Ordering::Relaxed),
            connection_count: r.connection_count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficStatsSnapshot {
    pub records: Vec<TrafficRecordSnapshot>,
}

pub struct TrafficUpdate {
    pub identifier: String,
    pub is_domain: bool,
    pub upload: u64,
    pub download: u64,
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Owns the concurrent traffic map and the receiving end of the update
/// channel. `spawn_worker` drives the fold loop as a background task; callers
/// only ever touch the `Arc<StatsRegistry>` plus the cloned `sender`.
pub struct StatsRegistry {
    records: DashMap<String, TrafficRecord>,
}

impl StatsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { records: DashMap::new() })
    }

    fn apply(&self, update: TrafficUpdate) {
        let now = now_unix();
        self.records
            .entry(update.identifier.clone())
            .and_modify(|r| {
                r.upload.fetch_add(update.upload, Ordering::Relaxed);
                r.download.fetch_add(update.download, Ordering::Relaxed);
                r.connection_count.fetch_add(1, Ordering::Relaxed);
                r.last_seen.store(now, Ordering::Relaxed);
            })
            .or_insert_with(|| TrafficRecord {
                identifier: update.identifier,
                is_domain: update.is_domain,
                upload: AtomicU64::new(update.upload),
                download: AtomicU64::new(update.download),
                first_seen: now,
                last_seen: AtomicU64::new(now),
                connection_count: AtomicU64::new(1),
            });
    }

    pub fn snapshot(&self) -> TrafficStatsSnapshot {
        TrafficStatsSnapshot {
            records: self.records.iter().map(|r| TrafficRecordSnapshot::from(r.value())).collect(),
        }
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}

/// Spawns the background fold task and returns the sender half callers use
/// to report completed flows. `try_send` backpressure means a full channel
/// silently drops the update rather than blocking the dispatcher.
pub fn spawn_worker(registry: Arc<StatsRegistry>, capacity: usize) -> mpsc::Sender<TrafficUpdate> {
    let (tx, mut rx) = mpsc::channel(capacity);
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            registry.apply(update);
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_accumulate_per_identifier() {
        let registry = StatsRegistry::new();
        let tx = spawn_worker(registry.clone(), 1024);

        tx.send(TrafficUpdate { identifier: "example.com".into(), is_domain: true, upload: 100, download: 200 })
            .await
            .unwrap();
        tx.send(TrafficUpdate { identifier: "example.com".into(), is_domain: true, upload: 50, download: 25 })
            .await
            .unwrap();
        drop(tx);

        // Give the worker a chance to drain.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.records.len(), 1);
        let record = &snapshot.records[0];
        assert_eq!(record.upload, 150);
        assert_eq!(record.download, 225);
        assert_eq!(record.connection_count, 2);
        assert!(record.is_domain);
    }

    #[tokio::test]
    async fn clear_empties_the_registry() {
        let registry = StatsRegistry::new();
        let tx = spawn_worker(registry.clone(), 16);
        tx.send(TrafficUpdate { identifier: "1.2.3.4".into(), is_domain: false, upload: 1, download: 1 })
            .await
            .unwrap();
        drop(tx);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(registry.snapshot().records.len(), 1);
        registry.clear();
        assert_eq!(registry.snapshot().records.len(), 0);
    }
}

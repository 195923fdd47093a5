use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use metrics::gauge;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::db::{PositionStore, StoreError};
use crate::models::{normalize_pair, Position};

#[derive(Debug, Clone)]
struct IndexEntry {
    position: Arc<Position>,
    indexed_at: Instant,
}

/// Result of a reconcile pass against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshStats {
    pub pairs: usize,
    pub positions: usize,
}

/// In-memory index of open positions keyed by normalized trading pair.
///
/// Readers get cloned `Arc` snapshots of a bucket, so a tick handler never
/// iterates a bucket that is being mutated. Writers that change positions
/// on a pair (order intake, closes) serialize on [`PositionIndex::pair_lock`].
#[derive(Default)]
pub struct PositionIndex {
    buckets: RwLock<HashMap<String, Vec<IndexEntry>>>,
    pair_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PositionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutation lock for one pair. Hold it across read-decide-write sequences.
    ///
    /// Locks nobody holds are dropped here, so the table only grows with the
    /// number of pairs being mutated at once.
    pub fn pair_lock(&self, pair: &str) -> Arc<Mutex<()>> {
        let mut locks = self.pair_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(normalize_pair(pair)).or_default().clone()
    }

    /// Index an open position. Closed positions are ignored; an entry with
    /// the same id is replaced.
    pub async fn add(&self, position: &Position) {
        if !position.is_open() {
            return;
        }
        let mut buckets = self.buckets.write().await;
        insert_entry(&mut buckets, position);
        update_gauges(&buckets);
    }

    /// Drop a position from its pair bucket; empty buckets are deleted.
    pub async fn remove(&self, position: &Position) -> bool {
        self.remove_by_id(&position.pair(), position.id).await
    }

    pub async fn remove_by_id(&self, pair: &str, id: Uuid) -> bool {
        let mut buckets = self.buckets.write().await;
        let removed = remove_entry(&mut buckets, &normalize_pair(pair), id);
        update_gauges(&buckets);
        removed
    }

    /// Swap `old` for `new` under one write lock; `new` is only indexed if
    /// still open.
    pub async fn replace(&self, old: &Position, new: &Position) {
        let mut buckets = self.buckets.write().await;
        remove_entry(&mut buckets, &old.pair(), old.id);
        if new.is_open() {
            insert_entry(&mut buckets, new);
        }
        update_gauges(&buckets);
    }

    /// Snapshot of the open positions on `pair`, in insertion order.
    pub async fn positions_for(&self, pair: &str) -> Vec<Arc<Position>> {
        let buckets = self.buckets.read().await;
        buckets
            .get(pair)
            .map(|bucket| bucket.iter().map(|e| e.position.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn get(&self, pair: &str, id: Uuid) -> Option<Arc<Position>> {
        let buckets = self.buckets.read().await;
        buckets
            .get(pair)?
            .iter()
            .find(|e| e.position.id == id)
            .map(|e| e.position.clone())
    }

    pub async fn len(&self) -> usize {
        self.buckets.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.read().await.is_empty()
    }

    pub async fn clear(&self) {
        let mut buckets = self.buckets.write().await;
        buckets.clear();
        update_gauges(&buckets);
    }

    /// Reconcile the whole index with the store's open positions.
    ///
    /// Entries indexed after the store read started are kept, so a position
    /// opened concurrently is not dropped until the next pass.
    pub async fn refresh_from_store<S>(&self, store: &S) -> Result<RefreshStats, StoreError>
    where
        S: PositionStore + ?Sized,
    {
        let started = Instant::now();
        let open = store.find_open_positions().await?;

        let mut buckets = self.buckets.write().await;
        let mut fresh: HashMap<String, Vec<IndexEntry>> = HashMap::new();
        for position in open.iter().filter(|p| p.is_open()) {
            insert_entry(&mut fresh, position);
        }

        let from_store: HashSet<Uuid> = open.iter().map(|p| p.id).collect();
        for entry in buckets.values().flatten().filter(|e| e.indexed_at >= started) {
            if from_store.contains(&entry.position.id) {
                let pair = entry.position.pair();
                remove_entry(&mut fresh, &pair, entry.position.id);
            }
            fresh.entry(entry.position.pair()).or_default().push(entry.clone());
        }

        *buckets = fresh;
        update_gauges(&buckets);

        Ok(RefreshStats {
            pairs: buckets.len(),
            positions: buckets.values().map(Vec::len).sum(),
        })
    }
}

fn insert_entry(buckets: &mut HashMap<String, Vec<IndexEntry>>, position: &Position) {
    let bucket = buckets.entry(position.pair()).or_default();
    let entry = IndexEntry {
        position: Arc::new(position.clone()),
        indexed_at: Instant::now(),
    };
    match bucket.iter_mut().find(|e| e.position.id == position.id) {
        Some(existing) => *existing = entry,
        None => bucket.push(entry),
    }
}

fn remove_entry(buckets: &mut HashMap<String, Vec<IndexEntry>>, pair: &str, id: Uuid) -> bool {
    let Some(bucket) = buckets.get_mut(pair) else {
        return false;
    };
    let before = bucket.len();
    bucket.retain(|e| e.position.id != id);
    let removed = bucket.len() != before;
    if bucket.is_empty() {
        buckets.remove(pair);
    }
    removed
}

fn update_gauges(buckets: &HashMap<String, Vec<IndexEntry>>) {
    gauge!("tracked_pairs").set(buckets.len() as f64);
    gauge!("open_positions").set(buckets.values().map(Vec::len).sum::<usize>() as f64);
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use proptest::prelude::*;
use shoal_cluster::{Cluster, ClusterError, ClusterResult};
use shoal_types::{block_key, ClusterLimits, ClusterSize, ValueVersion};

use super::*;

// ============================================================================
// Mock cluster
// ============================================================================

/// Single-node in-memory stand-in for the erasure cluster, with the same
/// version-precondition semantics.
struct MockCluster {
    limits: ClusterLimits,
    store: Mutex<HashMap<Vec<u8>, (ValueVersion, Bytes)>>,
    fail_puts: AtomicBool,
    put_count: AtomicUsize,
}

impl MockCluster {
    fn new(max_value_size: u64) -> Arc<Self> {
        Arc::new(Self {
            limits: ClusterLimits {
                max_key_size: 4096,
                max_value_size,
                max_version_size: 4096,
            },
            store: Mutex::new(HashMap::new()),
            fail_puts: AtomicBool::new(false),
            put_count: AtomicUsize::new(0),
        })
    }

    fn stored_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.store
            .lock()
            .unwrap()
            .get(key)
            .map(|(_, v)| v.to_vec())
    }

    fn stored_count(&self) -> usize {
        self.store.lock().unwrap().len()
    }
}

impl Cluster for MockCluster {
    fn id(&self) -> &str {
        "mock"
    }

    fn limits(&self) -> ClusterLimits {
        self.limits
    }

    fn size(&self) -> ClusterResult<ClusterSize> {
        Ok(ClusterSize {
            bytes_total: 1024,
            bytes_free: 1024,
        })
    }

    fn get(&self, key: &[u8], skip_value: bool) -> ClusterResult<(ValueVersion, Bytes)> {
        let store = self.store.lock().unwrap();
        match store.get(key) {
            Some((version, value)) => Ok((
                version.clone(),
                if skip_value {
                    Bytes::new()
                } else {
                    value.clone()
                },
            )),
            None => Err(ClusterError::NotFound),
        }
    }

    fn put(
        &self,
        key: &[u8],
        prior_version: Option<&ValueVersion>,
        value: &[u8],
        force: bool,
    ) -> ClusterResult<ValueVersion> {
        if self.fail_puts.load(Ordering::Acquire) {
            return Err(ClusterError::Io("injected put failure".to_owned()));
        }
        self.put_count.fetch_add(1, Ordering::AcqRel);

        let mut store = self.store.lock().unwrap();
        if !force {
            let matches = match (store.get(key), prior_version) {
                (None, None) => true,
                (Some((stored, _)), Some(prior)) => stored == prior,
                _ => false,
            };
            if !matches {
                return Err(ClusterError::VersionMismatch);
            }
        }
        let version = ValueVersion::generate(value.len() as u64);
        store.insert(
            key.to_vec(),
            (version.clone(), Bytes::copy_from_slice(value)),
        );
        Ok(version)
    }

    fn remove(
        &self,
        key: &[u8],
        version: Option<&ValueVersion>,
        force: bool,
    ) -> ClusterResult<()> {
        let mut store = self.store.lock().unwrap();
        match store.get(key) {
            None => Err(ClusterError::NotFound),
            Some((stored, _)) => {
                if !force && version != Some(stored) {
                    return Err(ClusterError::VersionMismatch);
                }
                store.remove(key);
                Ok(())
            }
        }
    }

    fn range(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        max_requested: u32,
    ) -> ClusterResult<Vec<Bytes>> {
        let store = self.store.lock().unwrap();
        let mut keys: Vec<Vec<u8>> = store
            .keys()
            .filter(|k| k.as_slice() >= start_key && k.as_slice() <= end_key)
            .cloned()
            .collect();
        keys.sort();
        keys.truncate(max_requested as usize);
        Ok(keys.into_iter().map(Bytes::from).collect())
    }
}

fn assert_invariants(cache: &DataCache) {
    let state = cache.state.lock().unwrap();
    let capacity_sum: u64 = state
        .items
        .values()
        .map(|item| item.block.capacity() as u64)
        .sum();
    assert_eq!(capacity_sum, cache.current_size());
    assert_eq!(state.lookup.len(), state.items.len());
    for (key, node) in &state.lookup {
        assert_eq!(&state.items[node].key, key);
    }
    for (owner, nodes) in &state.owner_tables {
        for node in nodes {
            assert!(state.items[node].owners.contains(owner));
        }
    }
    // The recency list covers exactly the item set.
    let mut walked = 0;
    let mut cursor = state.head;
    while let Some(node) = cursor {
        walked += 1;
        cursor = state.items[&node].next;
    }
    assert_eq!(walked, state.items.len());
}

// ============================================================================
// Oracle
// ============================================================================

#[test]
fn oracle_needs_history() {
    let mut oracle = PrefetchOracle::new(10);
    oracle.add(1);
    oracle.add(2);
    assert!(oracle.predict(10, PredictionType::All).is_empty());
}

#[test]
fn oracle_predicts_forward_stride() {
    let mut oracle = PrefetchOracle::new(10);
    for n in 0..=4 {
        oracle.add(n);
    }
    assert_eq!(oracle.predict(10, PredictionType::All), vec![5, 6, 7, 8]);
}

#[test]
fn oracle_predicts_backward_stride() {
    let mut oracle = PrefetchOracle::new(10);
    for n in [10, 8, 6] {
        oracle.add(n);
    }
    assert_eq!(oracle.predict(10, PredictionType::All), vec![4, 2]);
}

#[test]
fn oracle_never_predicts_non_positive_numbers() {
    let mut oracle = PrefetchOracle::new(10);
    for n in [6, 4, 2] {
        oracle.add(n);
    }
    assert!(oracle.predict(10, PredictionType::All).is_empty());
}

#[test]
fn oracle_continue_subtracts_past_predictions() {
    let mut oracle = PrefetchOracle::new(10);
    for n in [0, 1, 2] {
        oracle.add(n);
    }
    assert_eq!(oracle.predict(10, PredictionType::Continue), vec![3, 4]);

    oracle.add(3);
    assert_eq!(oracle.predict(10, PredictionType::Continue), vec![5, 6]);
}

#[test]
fn oracle_ignores_duplicate_accesses() {
    let mut oracle = PrefetchOracle::new(10);
    for n in [0, 1, 1, 1, 2, 2] {
        oracle.add(n);
    }
    assert_eq!(oracle.predict(10, PredictionType::All), vec![3, 4]);
}

#[test]
fn oracle_tolerates_one_outlier() {
    let mut oracle = PrefetchOracle::new(10);
    for n in [0, 1, 2, 77, 3, 4] {
        oracle.add(n);
    }
    let prediction = oracle.predict(10, PredictionType::All);
    assert!(prediction.contains(&5), "stride survives outlier: {prediction:?}");
}

proptest! {
    #[test]
    fn oracle_continue_never_repeats(start in 1_i64..1000, stride in 1_i64..5) {
        let mut oracle = PrefetchOracle::new(10);
        let mut seen = Vec::new();
        for i in 0..8 {
            oracle.add(start + i * stride);
            let prediction = oracle.predict(10, PredictionType::Continue);
            for p in prediction {
                prop_assert!(p > 0);
                prop_assert!(!seen.contains(&p), "duplicate prediction {p}");
                seen.push(p);
            }
        }
    }
}

// ============================================================================
// Background pool
// ============================================================================

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

#[test]
fn queued_pool_runs_jobs() {
    let pool = BackgroundPool::new(2, 8);
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let counter = Arc::clone(&counter);
        pool.run(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(wait_until(Duration::from_secs(5), || {
        counter.load(Ordering::SeqCst) == 10
    }));
}

/// Gate that blocks a worker until released.
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }

    fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

#[test]
fn try_run_refuses_when_queue_full() {
    let pool = BackgroundPool::new(1, 1);
    let gate = Gate::new();
    let done = Arc::new(AtomicUsize::new(0));

    // Occupy the single worker.
    let g = Arc::clone(&gate);
    let d = Arc::clone(&done);
    pool.run(move || {
        g.wait();
        d.fetch_add(1, Ordering::SeqCst);
    });
    // Fill the single queue slot.
    assert!(wait_until(Duration::from_secs(2), || pool
        .try_run({
            let d = Arc::clone(&done);
            move || {
                d.fetch_add(1, Ordering::SeqCst);
            }
        })));

    // Queue is now full.
    let d = Arc::clone(&done);
    assert!(!pool.try_run(move || {
        d.fetch_add(1, Ordering::SeqCst);
    }));

    gate.release();
    assert!(wait_until(Duration::from_secs(5), || {
        done.load(Ordering::SeqCst) == 2
    }));
}

#[test]
fn spawn_mode_over_limit_runs_in_caller() {
    let pool = BackgroundPool::new(0, 0);
    let caller = std::thread::current().id();
    let ran_on = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&ran_on);
    pool.run(move || {
        *slot.lock().unwrap() = Some(std::thread::current().id());
    });
    assert_eq!(*ran_on.lock().unwrap(), Some(caller));

    // try_run refuses instead of running synchronously.
    assert!(!pool.try_run(|| {}));
}

#[test]
fn spawn_mode_uses_background_threads_below_limit() {
    let pool = BackgroundPool::new(2, 0);
    let caller = std::thread::current().id();
    let ran_on = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&ran_on);
    pool.run(move || {
        *slot.lock().unwrap() = Some(std::thread::current().id());
    });
    assert!(wait_until(Duration::from_secs(5), || {
        ran_on.lock().unwrap().is_some()
    }));
    assert_ne!(*ran_on.lock().unwrap(), Some(caller));
}

#[test]
fn reconfiguration_keeps_queued_jobs() {
    let pool = BackgroundPool::new(1, 4);
    let gate = Gate::new();
    let counter = Arc::new(AtomicUsize::new(0));

    let g = Arc::clone(&gate);
    pool.run(move || g.wait());
    for _ in 0..4 {
        let counter = Arc::clone(&counter);
        pool.run(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    pool.change_configuration(3, 8);
    gate.release();
    assert!(wait_until(Duration::from_secs(5), || {
        counter.load(Ordering::SeqCst) == 4
    }));
}

// ============================================================================
// DataBlock
// ============================================================================

#[test]
fn block_holes_read_as_zeros() {
    let cluster = MockCluster::new(128);
    let block = DataBlock::new(cluster, Bytes::from_static(b"f_0"), BlockMode::Create);

    block.write(10, b"abc").unwrap();
    assert!(block.dirty());
    assert_eq!(block.size().unwrap(), 13);

    let mut buf = [0xFF_u8; 16];
    block.read(8, &mut buf).unwrap();
    assert_eq!(&buf[..2], &[0, 0]);
    assert_eq!(&buf[2..5], b"abc");
    assert!(buf[5..].iter().all(|b| *b == 0));
}

#[test]
fn block_flush_writes_back_and_cleans() {
    let cluster = MockCluster::new(128);
    let block = DataBlock::new(
        Arc::clone(&cluster) as Arc<dyn Cluster>,
        Bytes::from_static(b"f_0"),
        BlockMode::Create,
    );

    block.write(0, b"hello").unwrap();
    block.flush().unwrap();
    assert!(!block.dirty());
    assert_eq!(cluster.stored_value(b"f_0").unwrap(), b"hello");
}

#[test]
fn create_mode_is_dirty_before_first_flush() {
    let cluster = MockCluster::new(128);
    let block = DataBlock::new(
        Arc::clone(&cluster) as Arc<dyn Cluster>,
        Bytes::from_static(b"f_0"),
        BlockMode::Create,
    );
    assert!(block.dirty(), "untouched create block still needs a flush");
    block.flush().unwrap();
    assert!(!block.dirty());
    assert_eq!(cluster.stored_value(b"f_0").unwrap(), b"");
}

#[test]
fn flush_merges_on_version_mismatch() {
    let cluster = MockCluster::new(128);
    // A concurrent writer flushed first.
    cluster.put(b"f_0", None, b"aaaaaaaa", false).unwrap();

    // Our block wrote locally without ever reading the remote value.
    let block = DataBlock::new(
        Arc::clone(&cluster) as Arc<dyn Cluster>,
        Bytes::from_static(b"f_0"),
        BlockMode::Create,
    );
    block.write(4, b"BB").unwrap();
    block.flush().unwrap();

    // The local edit is overlaid on the concurrent writer's data.
    assert_eq!(cluster.stored_value(b"f_0").unwrap(), b"aaaaBBaa");
    assert!(!block.dirty());
}

#[test]
fn truncate_journals_and_shrinks() {
    let cluster = MockCluster::new(128);
    let block = DataBlock::new(
        Arc::clone(&cluster) as Arc<dyn Cluster>,
        Bytes::from_static(b"f_0"),
        BlockMode::Create,
    );
    block.write(0, b"0123456789").unwrap();
    block.truncate(4).unwrap();
    assert_eq!(block.size().unwrap(), 4);

    block.flush().unwrap();
    assert_eq!(cluster.stored_value(b"f_0").unwrap(), b"0123");

    // Reads past the truncation point yield zeros.
    let mut buf = [0xFF_u8; 4];
    block.read(6, &mut buf).unwrap();
    assert_eq!(buf, [0, 0, 0, 0]);
}

#[test]
fn stale_block_revalidates_after_expiry() {
    let cluster = MockCluster::new(128);
    let block = DataBlock::new(
        Arc::clone(&cluster) as Arc<dyn Cluster>,
        Bytes::from_static(b"f_0"),
        BlockMode::Create,
    );
    block.write(0, b"old!").unwrap();
    block.flush().unwrap();

    // Another client replaces the value remotely.
    cluster.put(b"f_0", None, b"NEW!", true).unwrap();

    // Within the expiry window the local copy is trusted.
    let mut buf = [0_u8; 4];
    block.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"old!");

    std::thread::sleep(Duration::from_millis(1100));
    block.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"NEW!");
}

#[test]
fn block_rejects_out_of_range_access() {
    let cluster = MockCluster::new(16);
    let block = DataBlock::new(cluster, Bytes::from_static(b"f_0"), BlockMode::Create);
    let mut buf = [0_u8; 8];
    assert!(matches!(
        block.read(10, &mut buf),
        Err(CacheError::InvalidArgument(_))
    ));
    assert!(matches!(
        block.write(9, &buf),
        Err(CacheError::InvalidArgument(_))
    ));
    assert!(matches!(
        block.truncate(17),
        Err(CacheError::InvalidArgument(_))
    ));
    assert!(block.write(8, &buf).is_ok());
}

// ============================================================================
// DataCache
// ============================================================================

#[test]
fn cache_hit_returns_same_block() {
    let cluster = MockCluster::new(128);
    let cache = DataCache::new(10_000, 20_000, 0, 0, 0).unwrap();
    let owner = cache.register_owner(cluster, "f");

    let a = cache
        .get(&owner, 7, BlockMode::Create, RequestMode::Standard)
        .unwrap();
    let b = cache
        .get(&owner, 7, BlockMode::Create, RequestMode::Standard)
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_invariants(&cache);
}

#[test]
fn eviction_keeps_cache_within_capacity() {
    // One-byte blocks: sizes map directly to block counts.
    let cluster = MockCluster::new(1);
    let cache = DataCache::new(100, 120, 0, 0, 10).unwrap();
    let owner = cache.register_owner(cluster, "f");

    for n in 0..150 {
        cache
            .get(&owner, n, BlockMode::Standard, RequestMode::Standard)
            .unwrap();
        assert!(
            cache.current_size() <= 120,
            "cache exceeded capacity at block {n}"
        );
    }

    // Touched at least 150 distinct blocks against a 120 capacity: a
    // substantial share of the tail must have been evicted.
    assert!(cache.current_size() <= 120);
    assert!(150 - cache.current_size() >= 30);
    assert_invariants(&cache);
}

#[test]
fn prefetch_populates_upcoming_blocks() {
    let cluster = MockCluster::new(128);
    let cache = DataCache::new(10_000, 20_000, 0, 0, 10).unwrap();
    let owner = cache.register_owner(cluster, "f");

    for n in 0..=4 {
        cache
            .get(&owner, n, BlockMode::Standard, RequestMode::Standard)
            .unwrap();
    }

    // Sequential reads 0..=4 must have staged blocks 5..=8.
    let state = cache.state.lock().unwrap();
    for n in 5..=8_u64 {
        assert!(
            state.lookup.contains_key(&block_key("f", n)),
            "block {n} was not prefetched"
        );
    }
    drop(state);
    assert_invariants(&cache);
}

#[test]
fn dirty_blocks_survive_tail_eviction() {
    let cluster = MockCluster::new(1);
    let cache = DataCache::new(4, 50, 0, 0, 0).unwrap();
    let owner = cache.register_owner(Arc::clone(&cluster) as Arc<dyn Cluster>, "f");

    // Eight dirty blocks, above the target of four.
    for n in 0..8 {
        let block = cache
            .get(&owner, n, BlockMode::Create, RequestMode::Standard)
            .unwrap();
        block.write(0, b"x").unwrap();
    }
    assert_eq!(cache.current_size(), 8, "dirty blocks must not be evicted");

    cache.flush(&owner).unwrap();
    assert_eq!(cluster.stored_count(), 8);
    assert_invariants(&cache);
}

#[test]
fn over_capacity_forces_synchronous_flush() {
    let cluster = MockCluster::new(1);
    let cache = DataCache::new(2, 4, 0, 0, 0).unwrap();
    let owner = cache.register_owner(Arc::clone(&cluster) as Arc<dyn Cluster>, "f");

    // Readahead requests skip the throttle, isolating the hard-capacity
    // path: every insert beyond capacity must force-flush the tail.
    for n in 0..10 {
        let block = cache
            .get(&owner, n, BlockMode::Create, RequestMode::Readahead)
            .unwrap();
        block.write(0, b"x").unwrap();
        assert!(cache.current_size() <= 4);
    }
    // Victims of the hard-capacity path were flushed, not dropped.
    assert!(cluster.stored_count() >= 6);
    assert_invariants(&cache);
}

#[test]
fn background_flush_failure_is_stashed_and_rethrown() {
    let cluster = MockCluster::new(128);
    let cache = DataCache::new(10_000, 20_000, 1, 4, 0).unwrap();
    let owner = cache.register_owner(Arc::clone(&cluster) as Arc<dyn Cluster>, "f");

    let block = cache
        .get(&owner, 0, BlockMode::Create, RequestMode::Standard)
        .unwrap();
    block.write(0, b"doomed").unwrap();

    cluster.fail_puts.store(true, Ordering::Release);
    cache.async_flush(&owner, block);

    assert!(wait_until(Duration::from_secs(5), || {
        cache.exceptions.lock().unwrap().contains_key(&owner.id())
    }));

    let err = cache
        .get(&owner, 1, BlockMode::Create, RequestMode::Standard)
        .unwrap_err();
    assert!(matches!(err, CacheError::Io(_)));

    // The stash is consumed by the rethrow.
    cluster.fail_puts.store(false, Ordering::Release);
    assert!(cache
        .get(&owner, 1, BlockMode::Create, RequestMode::Standard)
        .is_ok());
}

#[test]
fn drop_owner_clears_state() {
    let cluster = MockCluster::new(128);
    let cache = DataCache::new(10_000, 20_000, 0, 0, 10).unwrap();
    let owner = cache.register_owner(cluster, "f");

    for n in 0..4 {
        cache
            .get(&owner, n, BlockMode::Standard, RequestMode::Standard)
            .unwrap();
    }
    assert!(cache.current_size() > 0);

    cache.drop_owner(&owner);
    assert_eq!(cache.current_size(), 0);
    let state = cache.state.lock().unwrap();
    assert!(state.items.is_empty());
    assert!(state.lookup.is_empty());
    assert!(state.owner_tables.is_empty());
}

#[test]
fn shared_blocks_outlive_one_owner() {
    let cluster = MockCluster::new(128);
    let cache = DataCache::new(10_000, 20_000, 0, 0, 0).unwrap();
    let owner_a = cache.register_owner(Arc::clone(&cluster) as Arc<dyn Cluster>, "f");
    let owner_b = cache.register_owner(Arc::clone(&cluster) as Arc<dyn Cluster>, "f");

    let a = cache
        .get(&owner_a, 3, BlockMode::Create, RequestMode::Standard)
        .unwrap();
    let b = cache
        .get(&owner_b, 3, BlockMode::Create, RequestMode::Standard)
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    cache.drop_owner(&owner_a);
    // Still cached for owner B.
    assert_eq!(cache.current_size(), 128);
    cache.drop_owner(&owner_b);
    assert_eq!(cache.current_size(), 0);
}

#[test]
fn throttle_drains_under_dirty_pressure() {
    let cluster = MockCluster::new(1);
    let cache = DataCache::new(4, 8, 1, 8, 0).unwrap();
    let owner = cache.register_owner(Arc::clone(&cluster) as Arc<dyn Cluster>, "f");

    let start = Instant::now();
    for n in 0..12 {
        let block = cache
            .get(&owner, n, BlockMode::Create, RequestMode::Standard)
            .unwrap();
        block.write(0, b"x").unwrap();
        cache.async_flush(&owner, block);
        assert!(cache.current_size() <= 8);
    }
    cache.flush(&owner).unwrap();
    assert_eq!(cluster.stored_count(), 12);
    // Throttling slowed writers down but made progress throughout.
    assert!(start.elapsed() < Duration::from_secs(30));
}

#[test]
fn change_configuration_resets_scan_budget() {
    let cluster = MockCluster::new(1);
    let cache = DataCache::new(100, 120, 0, 0, 0).unwrap();
    let owner = cache.register_owner(cluster, "f");
    for n in 0..130 {
        cache
            .get(&owner, n, BlockMode::Standard, RequestMode::Standard)
            .unwrap();
    }

    cache.change_configuration(10, 20, 0, 0, 0);
    assert_eq!(cache.state.lock().unwrap().tail_items, 0);

    // The shrunken limits take effect on subsequent traffic.
    for n in 200..260 {
        cache
            .get(&owner, n, BlockMode::Standard, RequestMode::Standard)
            .unwrap();
        assert!(cache.current_size() <= 20);
    }
    assert_invariants(&cache);
}

//! LRU cache of data blocks with owner tracking, pressure throttling and
//! read-ahead scheduling.
//!
//! The recency list is an intrusive doubly-linked list over a node map:
//! node ids stay stable across splices, which is what the owner tables
//! point at. Lock order is cache state -> block; background flushes copy
//! the block list out first and run without the cache lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use shoal_cluster::Cluster;
use shoal_types::block_key;
use tracing::{debug, trace, warn};

use crate::block::{BlockMode, DataBlock};
use crate::error::{CacheError, CacheResult};
use crate::oracle::{PredictionType, PrefetchOracle};
use crate::pool::BackgroundPool;

/// Minimum interval between tail-cleanup sweeps in the throttle path.
const CLEANUP_RATELIMIT: Duration = Duration::from_millis(50);

/// Sleep per throttle iteration, giving dirty data a chance to drain.
const THROTTLE_SLEEP: Duration = Duration::from_millis(100);

/// Identifies one cache client (an open file).
pub type OwnerId = u64;

/// An owner handle: couples the owner id with the cluster its blocks
/// live on and the basename its block keys derive from.
pub struct CacheOwner {
    id: OwnerId,
    cluster: Arc<dyn Cluster>,
    block_basename: String,
}

impl CacheOwner {
    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn block_basename(&self) -> &str {
        &self.block_basename
    }
}

/// Who is asking for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// A client of the cache; feeds read-ahead and passes the throttle.
    Standard,
    /// The read-ahead machinery itself.
    Readahead,
}

type NodeId = u64;

pub(crate) struct CacheItem {
    pub(crate) block: Arc<DataBlock>,
    pub(crate) key: Bytes,
    pub(crate) owners: HashSet<OwnerId>,
    /// Toward the MRU end.
    prev: Option<NodeId>,
    /// Toward the LRU end.
    pub(crate) next: Option<NodeId>,
}

#[derive(Default)]
pub(crate) struct CacheState {
    pub(crate) items: HashMap<NodeId, CacheItem>,
    pub(crate) lookup: HashMap<Bytes, NodeId>,
    pub(crate) owner_tables: HashMap<OwnerId, HashSet<NodeId>>,
    pub(crate) head: Option<NodeId>,
    tail: Option<NodeId>,
    next_node: NodeId,
    /// Tail-scan budget, captured lazily and reset by reconfiguration.
    pub(crate) tail_items: usize,
}

struct ReadaheadState {
    prefetch: HashMap<OwnerId, PrefetchOracle>,
    window: usize,
}

/// Shared LRU cache of [`DataBlock`]s.
pub struct DataCache {
    target_size: AtomicU64,
    capacity: AtomicU64,
    current_size: AtomicU64,
    pub(crate) state: Mutex<CacheState>,
    pub(crate) exceptions: Arc<Mutex<HashMap<OwnerId, CacheError>>>,
    readahead: Mutex<ReadaheadState>,
    cleanup_at: Mutex<Option<Instant>>,
    pool: BackgroundPool,
    next_owner: AtomicU64,
}

impl DataCache {
    pub fn new(
        target_size: u64,
        capacity: u64,
        bg_threads: usize,
        bg_queue_depth: usize,
        readahead_window: usize,
    ) -> CacheResult<Self> {
        if capacity < target_size {
            return Err(CacheError::InvalidArgument(
                "cache target size may not exceed capacity".to_owned(),
            ));
        }
        Ok(Self {
            target_size: AtomicU64::new(target_size),
            capacity: AtomicU64::new(capacity),
            current_size: AtomicU64::new(0),
            state: Mutex::new(CacheState::default()),
            exceptions: Arc::new(Mutex::new(HashMap::new())),
            readahead: Mutex::new(ReadaheadState {
                prefetch: HashMap::new(),
                window: readahead_window,
            }),
            cleanup_at: Mutex::new(None),
            pool: BackgroundPool::new(bg_threads, bg_queue_depth),
            next_owner: AtomicU64::new(1),
        })
    }

    /// Issues an owner handle for one open file.
    pub fn register_owner(
        &self,
        cluster: Arc<dyn Cluster>,
        block_basename: impl Into<String>,
    ) -> CacheOwner {
        CacheOwner {
            id: self.next_owner.fetch_add(1, Ordering::Relaxed),
            cluster,
            block_basename: block_basename.into(),
        }
    }

    /// Total capacity of all cached blocks, in bytes.
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Acquire)
    }

    /// How far the cache has grown past its target, in `[0.0, 1.0]`.
    pub fn pressure(&self) -> f64 {
        let current = self.current_size.load(Ordering::Acquire);
        let target = self.target_size.load(Ordering::Acquire);
        let capacity = self.capacity.load(Ordering::Acquire);
        if current <= target {
            return 0.0;
        }
        if capacity <= target {
            return 1.0;
        }
        (current - target) as f64 / (capacity - target) as f64
    }

    /// Adjusts cache sizing, pool limits and the read-ahead window.
    pub fn change_configuration(
        &self,
        target_size: u64,
        capacity: u64,
        bg_threads: usize,
        bg_queue_depth: usize,
        readahead_window: usize,
    ) {
        {
            let mut readahead = self.readahead.lock().expect("readahead state poisoned");
            readahead.window = readahead_window;
        }
        {
            let mut state = self.state.lock().expect("cache state poisoned");
            state.tail_items = 0;
        }
        self.target_size.store(target_size, Ordering::Release);
        self.capacity.store(capacity, Ordering::Release);
        self.pool.change_configuration(bg_threads, bg_queue_depth);
    }

    /// Returns the block for `(owner, blocknumber)`, from cache or
    /// freshly constructed.
    pub fn get(
        &self,
        owner: &CacheOwner,
        blocknumber: u64,
        mode: BlockMode,
        request_mode: RequestMode,
    ) -> CacheResult<Arc<DataBlock>> {
        // A stashed background-flush failure surfaces on the owner's next
        // access.
        if let Some(e) = self
            .exceptions
            .lock()
            .expect("exception map poisoned")
            .remove(&owner.id)
        {
            return Err(e);
        }

        if request_mode == RequestMode::Standard {
            // A block opened for create has no history worth predicting.
            if mode != BlockMode::Create {
                self.readahead(owner, blocknumber)?;
            }
            self.throttle();
        }

        let key = block_key(&owner.block_basename, blocknumber);
        let mut state = self.state.lock().expect("cache state poisoned");

        if let Some(&node) = state.lookup.get(&key) {
            state.move_to_front(node);
            let item = state.items.get_mut(&node).expect("lookup points at item");
            item.owners.insert(owner.id);
            let block = Arc::clone(&item.block);
            state.owner_tables.entry(owner.id).or_default().insert(node);
            return Ok(block);
        }

        self.evict_tail(&mut state);

        // Hard limit: force a synchronous flush of the LRU victim rather
        // than growing past capacity.
        let block_capacity = owner.cluster.limits().max_value_size;
        if self.capacity.load(Ordering::Acquire)
            < self.current_size.load(Ordering::Acquire) + block_capacity
        {
            warn!("cache capacity reached");
            if let Some(victim) = state.tail {
                let block = Arc::clone(&state.items[&victim].block);
                if block.dirty() {
                    block.flush().map_err(|e| {
                        CacheError::Io(format!("failed freeing cache space: {e}"))
                    })?;
                }
                self.remove_item(&mut state, victim);
            }
        }

        let block = Arc::new(DataBlock::new(
            Arc::clone(&owner.cluster),
            key.clone(),
            mode,
        ));
        let node = state.next_node;
        state.next_node += 1;
        state.items.insert(
            node,
            CacheItem {
                block: Arc::clone(&block),
                key: key.clone(),
                owners: HashSet::from([owner.id]),
                prev: None,
                next: None,
            },
        );
        state.lookup.insert(key, node);
        state.link_front(node);
        state.owner_tables.entry(owner.id).or_default().insert(node);
        self.current_size
            .fetch_add(block.capacity() as u64, Ordering::AcqRel);
        trace!(blocknumber, "cached new block");
        Ok(block)
    }

    /// Flushes every dirty block the owner touches, outside the cache
    /// lock.
    pub fn flush(&self, owner: &CacheOwner) -> CacheResult<()> {
        // A stashed failure is superseded: if it still matters we will
        // re-encounter it during this flush.
        self.exceptions
            .lock()
            .expect("exception map poisoned")
            .remove(&owner.id);

        let blocks: Vec<Arc<DataBlock>> = {
            let state = self.state.lock().expect("cache state poisoned");
            state
                .owner_tables
                .get(&owner.id)
                .map(|nodes| {
                    nodes
                        .iter()
                        .map(|node| Arc::clone(&state.items[node].block))
                        .collect()
                })
                .unwrap_or_default()
        };

        for block in blocks {
            if block.dirty() {
                block.flush()?;
            }
        }
        Ok(())
    }

    /// Severs the owner from every block it touches; blocks without
    /// remaining owners are evicted regardless of dirtiness.
    pub fn drop_owner(&self, owner: &CacheOwner) {
        self.exceptions
            .lock()
            .expect("exception map poisoned")
            .remove(&owner.id);
        self.readahead
            .lock()
            .expect("readahead state poisoned")
            .prefetch
            .remove(&owner.id);

        let mut state = self.state.lock().expect("cache state poisoned");
        if let Some(nodes) = state.owner_tables.remove(&owner.id) {
            for node in nodes {
                let orphaned = {
                    let item = state.items.get_mut(&node).expect("owner table points at item");
                    item.owners.remove(&owner.id);
                    item.owners.is_empty()
                };
                if orphaned {
                    self.remove_item(&mut state, node);
                }
            }
        }
    }

    /// Dispatches a flush of `block` to the pool; a failure is stashed
    /// for the owner and rethrown from its next `get`.
    pub fn async_flush(&self, owner: &CacheOwner, block: Arc<DataBlock>) {
        let exceptions = Arc::clone(&self.exceptions);
        let owner_id = owner.id;
        self.pool.run(move || {
            if block.dirty() {
                if let Err(e) = block.flush() {
                    debug!(error = %e, "background flush failed, stashing for owner");
                    exceptions
                        .lock()
                        .expect("exception map poisoned")
                        .insert(owner_id, e);
                }
            }
        });
    }

    /// Blocks the caller in proportion to cache pressure while cleanup
    /// and background flushes drain the cache.
    fn throttle(&self) {
        let mut wait_pressure = 0.1;
        loop {
            {
                let mut cleanup_at = self.cleanup_at.lock().expect("cleanup stamp poisoned");
                let due = cleanup_at.map_or(true, |at| at.elapsed() > CLEANUP_RATELIMIT);
                if due {
                    *cleanup_at = Some(Instant::now());
                    let mut state = self.state.lock().expect("cache state poisoned");
                    self.evict_tail(&mut state);
                }
            }

            if self.pressure() <= wait_pressure {
                return;
            }
            std::thread::sleep(THROTTLE_SLEEP);
            wait_pressure += 0.01;
        }
    }

    /// Scans a bounded stretch of the LRU tail, evicting clean blocks
    /// while the cache sits above its target size. Dirty blocks are left
    /// for the background flush.
    fn evict_tail(&self, state: &mut CacheState) {
        let target = self.target_size.load(Ordering::Acquire);
        if state.tail_items == 0 && self.current_size.load(Ordering::Acquire) > target {
            // Captured once and reused until reset: keeps the scan
            // amortized instead of rescaling on every miss.
            state.tail_items = state.items.len() / 4;
        }

        let mut checked = 0;
        let mut cursor = state.tail;
        while let Some(node) = cursor {
            if self.current_size.load(Ordering::Acquire) <= target
                || checked >= state.tail_items
                || Some(node) == state.head
            {
                break;
            }
            cursor = state.items[&node].prev;
            if !state.items[&node].block.dirty() {
                self.remove_item(state, node);
            }
            checked += 1;
        }
    }

    /// Feeds the owner's oracle and schedules predicted blocks for
    /// warm-up reads on the pool.
    fn readahead(&self, owner: &CacheOwner, blocknumber: u64) -> CacheResult<()> {
        let prediction = {
            let mut readahead = self.readahead.lock().expect("readahead state poisoned");
            let window = readahead.window;
            let oracle = readahead
                .prefetch
                .entry(owner.id)
                .or_insert_with(|| PrefetchOracle::new(window));
            oracle.add(blocknumber as i64);
            // Prefetching into a cache that is already under pressure
            // would only evict blocks someone still wants.
            if self.pressure() < 0.1 {
                oracle.predict(window, PredictionType::Continue)
            } else {
                Vec::new()
            }
        };

        for predicted in prediction {
            let block = self.get(
                owner,
                predicted as u64,
                BlockMode::Standard,
                RequestMode::Readahead,
            )?;
            // One-byte read pulls the remote value in; a failure here is
            // re-encountered by the real read, so it is dropped.
            self.pool.try_run(move || {
                let mut byte = [0_u8; 1];
                let _ = block.read(0, &mut byte);
            });
        }
        Ok(())
    }

    fn remove_item(&self, state: &mut CacheState, node: NodeId) {
        let item = state.items.remove(&node).expect("removing a live item");
        for owner in &item.owners {
            if let Some(table) = state.owner_tables.get_mut(owner) {
                table.remove(&node);
            }
        }
        state.lookup.remove(&item.key);
        state.unlink(item.prev, item.next);
        self.current_size
            .fetch_sub(item.block.capacity() as u64, Ordering::AcqRel);
    }
}

impl CacheState {
    fn link_front(&mut self, node: NodeId) {
        let old_head = self.head;
        if let Some(head) = old_head {
            self.items.get_mut(&head).expect("head is live").prev = Some(node);
        }
        {
            let item = self.items.get_mut(&node).expect("linking a live item");
            item.prev = None;
            item.next = old_head;
        }
        self.head = Some(node);
        if self.tail.is_none() {
            self.tail = Some(node);
        }
    }

    fn unlink(&mut self, prev: Option<NodeId>, next: Option<NodeId>) {
        match prev {
            Some(prev) => self.items.get_mut(&prev).expect("prev is live").next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.items.get_mut(&next).expect("next is live").prev = prev,
            None => self.tail = prev,
        }
    }

    fn move_to_front(&mut self, node: NodeId) {
        if self.head == Some(node) {
            return;
        }
        let (prev, next) = {
            let item = &self.items[&node];
            (item.prev, item.next)
        };
        self.unlink(prev, next);
        self.link_front(node);
    }
}

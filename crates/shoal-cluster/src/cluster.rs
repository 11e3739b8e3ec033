//! The erasure-coded cluster facade.
//!
//! Every logical operation fans out to the drives holding the key's
//! stripe, collects per-drive results through a completion aggregator and
//! applies the read/write quorum: a status code shared by at least
//! `n_data` drives decides the outcome.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use shoal_drive::{
    AutoConnection, ConnectionOptions, DriveChannel, HandlerKey, OpResult, SocketWatcher,
};
use shoal_types::{ClusterLimits, ClusterSize, DriveStatus, StatusCode, ValueVersion};
use shoal_wire::{GetLogType, PersistMode, Record, RequestPayload, ResponsePayload, WriteMode};
use tracing::{debug, trace, warn};

use crate::codec::StripeCodec;
use crate::error::{ClusterError, ClusterResult};

/// How long cluster construction keeps retrying the initial getlog while
/// background reconnects come up.
const INITIAL_GETLOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between initial getlog attempts.
const INITIAL_GETLOG_RETRY: Duration = Duration::from_millis(100);

// ============================================================================
// Cluster trait
// ============================================================================

/// A logical key/value store spanning many drives.
///
/// This is the seam the data cache programs against; tests substitute an
/// in-memory implementation.
pub trait Cluster: Send + Sync {
    /// Unique identifier of this cluster.
    fn id(&self) -> &str;

    /// Logical operation limits. `max_value_size` is the per-drive shard
    /// limit multiplied by the data-shard count.
    fn limits(&self) -> ClusterLimits;

    /// Last known aggregate capacity; schedules a background refresh.
    fn size(&self) -> ClusterResult<ClusterSize>;

    /// Reads a key. With `skip_value` only the version is fetched and the
    /// returned value is empty.
    fn get(&self, key: &[u8], skip_value: bool) -> ClusterResult<(ValueVersion, Bytes)>;

    /// Writes a value under a key, guarded by `prior_version` unless
    /// `force` is set. Returns the freshly generated version.
    fn put(
        &self,
        key: &[u8],
        prior_version: Option<&ValueVersion>,
        value: &[u8],
        force: bool,
    ) -> ClusterResult<ValueVersion>;

    /// Deletes a key, guarded by `version` unless `force` is set.
    fn remove(&self, key: &[u8], version: Option<&ValueVersion>, force: bool)
        -> ClusterResult<()>;

    /// Best-effort key enumeration in `[start_key, end_key]`, deduplicated
    /// across drives and truncated to `max_requested`.
    fn range(&self, start_key: &[u8], end_key: &[u8], max_requested: u32)
        -> ClusterResult<Vec<Bytes>>;
}

// ============================================================================
// Drive assignment
// ============================================================================

/// Drive indices holding the stripe of `key`: shard `i` lives on drive
/// `(crc32(key) + 1 + i) mod drive_count`. Deterministic and stateless.
pub fn drive_indices(key: &[u8], drive_count: usize, stripe_len: usize) -> Vec<usize> {
    let mut index = crc32fast::hash(key) as usize % drive_count;
    (0..stripe_len)
        .map(|_| {
            index = (index + 1) % drive_count;
            index
        })
        .collect()
}

// ============================================================================
// Completion aggregation
// ============================================================================

struct AggState {
    results: Vec<Option<OpResult>>,
    completed: usize,
}

/// Collects fan-out results and lets the issuing thread wait for all of
/// them with a deadline.
struct Aggregator {
    state: Mutex<AggState>,
    cv: Condvar,
}

impl Aggregator {
    fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AggState {
                results: (0..n).map(|_| None).collect(),
                completed: 0,
            }),
            cv: Condvar::new(),
        })
    }

    /// Fills slot `index` unless it already holds a result. Returns true
    /// if this call filled it.
    fn complete(&self, index: usize, result: OpResult) -> bool {
        let mut state = self.state.lock().expect("aggregator poisoned");
        if state.results[index].is_some() {
            return false;
        }
        state.results[index] = Some(result);
        state.completed += 1;
        self.cv.notify_all();
        true
    }

    /// Waits until every slot is filled or the timeout elapses.
    fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("aggregator poisoned");
        while state.completed < state.results.len() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .expect("aggregator poisoned");
            state = next;
        }
        true
    }

    /// Takes the results out. Every slot must be filled.
    fn take_results(&self) -> Vec<OpResult> {
        let mut state = self.state.lock().expect("aggregator poisoned");
        state
            .results
            .iter_mut()
            .map(|slot| slot.take().expect("fan-out slot left unfilled"))
            .collect()
    }
}

// ============================================================================
// Quorum evaluation
// ============================================================================

/// The status code shared by at least `n_data` results, if any.
///
/// Once some code's frequency exceeds `n_parity` without reaching
/// `n_data`, no other code can reach the quorum either.
fn quorum_status(results: &[OpResult], n_data: usize, n_parity: usize) -> DriveStatus {
    for result in results {
        let frequency = results
            .iter()
            .filter(|other| other.status.code == result.status.code)
            .count();
        if frequency >= n_data {
            return result.status.clone();
        }
        if frequency > n_parity {
            break;
        }
    }
    DriveStatus::new(
        StatusCode::IoError,
        "Failed to get sufficient conforming return results from drives",
    )
}

/// Index and frequency of the most common version, ties broken by first
/// occurrence.
fn most_frequent_version(versions: &[&[u8]]) -> (usize, usize) {
    let mut best_index = 0;
    let mut best_count = 0;
    for (i, version) in versions.iter().enumerate() {
        let frequency = versions.iter().filter(|other| *other == version).count();
        if frequency > best_count {
            best_index = i;
            best_count = frequency;
        }
        if frequency > versions.len() / 2 {
            break;
        }
    }
    (best_index, best_count)
}

// ============================================================================
// ErasureCluster
// ============================================================================

struct GetLogState {
    status: DriveStatus,
    limits: ClusterLimits,
    size: ClusterSize,
    outstanding: bool,
}

struct Inner {
    id: String,
    n_data: usize,
    n_parity: usize,
    operation_timeout: Duration,
    connections: Vec<Arc<AutoConnection>>,
    codec: Arc<dyn StripeCodec>,
    getlog: Mutex<GetLogState>,
}

/// Erasure-coded facade over a fixed set of drives.
pub struct ErasureCluster {
    inner: Arc<Inner>,
}

impl ErasureCluster {
    /// Builds the cluster, connects its drives and performs the initial
    /// limits/capacity discovery.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        endpoints: Vec<(ConnectionOptions, ConnectionOptions)>,
        n_data: usize,
        n_parity: usize,
        min_reconnect_interval: Duration,
        operation_timeout: Duration,
        codec: Arc<dyn StripeCodec>,
        watcher: Arc<SocketWatcher>,
    ) -> ClusterResult<Self> {
        if n_data == 0 {
            return Err(ClusterError::InvalidArgument(
                "stripe needs at least one data shard".to_owned(),
            ));
        }
        if n_data + n_parity > endpoints.len() {
            return Err(ClusterError::InvalidArgument(format!(
                "stripe size {} exceeds cluster size {}",
                n_data + n_parity,
                endpoints.len()
            )));
        }

        let connections = endpoints
            .into_iter()
            .map(|pair| AutoConnection::new(pair, Arc::clone(&watcher), min_reconnect_interval))
            .collect();

        let inner = Arc::new(Inner {
            id: id.into(),
            n_data,
            n_parity,
            operation_timeout,
            connections,
            codec,
            getlog: Mutex::new(GetLogState {
                status: DriveStatus::new(StatusCode::InternalError, "not initialized"),
                limits: ClusterLimits::default(),
                size: ClusterSize::default(),
                outstanding: false,
            }),
        });

        // Drive connections come up in the background; keep retrying the
        // initial discovery until they do or the deadline passes.
        let deadline = Instant::now() + INITIAL_GETLOG_TIMEOUT;
        loop {
            match inner.get_log(&[GetLogType::Limits, GetLogType::Capacities]) {
                Ok(()) => break,
                Err(e) if Instant::now() >= deadline => {
                    return Err(ClusterError::NotConnected(format!(
                        "initial getlog failed: {e}"
                    )));
                }
                Err(_) => std::thread::sleep(INITIAL_GETLOG_RETRY),
            }
        }

        Ok(Self { inner })
    }

    /// Forces a fresh log query; exposed for the admin surface and tests.
    pub fn refresh_log(&self, types: &[GetLogType]) -> ClusterResult<()> {
        self.inner.get_log(types)
    }
}

impl Drop for ErasureCluster {
    fn drop(&mut self) {
        // A detached background getlog may still reference our state;
        // wait for it to finish before tearing down.
        loop {
            {
                let state = self.inner.getlog.lock().expect("getlog state poisoned");
                if !state.outstanding {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Cluster for ErasureCluster {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn limits(&self) -> ClusterLimits {
        let state = self.inner.getlog.lock().expect("getlog state poisoned");
        ClusterLimits {
            max_key_size: state.limits.max_key_size,
            max_value_size: state.limits.max_value_size * self.inner.n_data as u64,
            max_version_size: state.limits.max_version_size,
        }
    }

    fn size(&self) -> ClusterResult<ClusterSize> {
        let mut state = self.inner.getlog.lock().expect("getlog state poisoned");
        if !state.outstanding {
            state.outstanding = true;
            let inner = Arc::clone(&self.inner);
            let spawned = std::thread::Builder::new()
                .name("shoal-getlog".to_owned())
                .spawn(move || {
                    let _ = inner.get_log(&[GetLogType::Capacities]);
                });
            if let Err(e) = spawned {
                warn!(cluster = %self.inner.id, error = %e, "failed to spawn getlog refresh");
                state.outstanding = false;
            }
        }

        let size = state.size;
        ClusterError::from_status(&state.status)?;
        Ok(size)
    }

    fn get(&self, key: &[u8], skip_value: bool) -> ClusterResult<(ValueVersion, Bytes)> {
        if skip_value {
            return self.inner.get_version(key);
        }
        self.inner.get_record(key)
    }

    fn put(
        &self,
        key: &[u8],
        prior_version: Option<&ValueVersion>,
        value: &[u8],
        force: bool,
    ) -> ClusterResult<ValueVersion> {
        self.inner.put(key, prior_version, value, force)
    }

    fn remove(
        &self,
        key: &[u8],
        version: Option<&ValueVersion>,
        force: bool,
    ) -> ClusterResult<()> {
        self.inner.remove(key, version, force)
    }

    fn range(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        max_requested: u32,
    ) -> ClusterResult<Vec<Bytes>> {
        self.inner.range(start_key, end_key, max_requested)
    }
}

impl Inner {
    fn stripe_len(&self) -> usize {
        self.n_data + self.n_parity
    }

    /// Connections holding the stripe of `key`, in shard order.
    fn assigned(&self, key: &[u8], count: usize) -> Vec<Arc<AutoConnection>> {
        drive_indices(key, self.connections.len(), count)
            .into_iter()
            .map(|i| Arc::clone(&self.connections[i]))
            .collect()
    }

    /// Fans one payload per connection out and collects all results.
    ///
    /// Phase 1 submits through each AutoConnection, absorbing unhealthy
    /// drives as connection errors. Phase 2 waits for the aggregator; on
    /// timeout every outstanding request is cancelled, marked as an I/O
    /// error and its connection receives `set_error`.
    fn execute(
        &self,
        conns: &[Arc<AutoConnection>],
        payloads: Vec<RequestPayload>,
    ) -> Vec<OpResult> {
        debug_assert_eq!(conns.len(), payloads.len());
        let agg = Aggregator::new(conns.len());
        let mut handles: Vec<Option<(Arc<DriveChannel>, HandlerKey)>> = Vec::new();

        for (index, (conn, payload)) in conns.iter().zip(payloads).enumerate() {
            let handle = match conn.channel() {
                Ok(channel) => {
                    let agg_cb = Arc::clone(&agg);
                    match channel.submit(
                        payload,
                        Box::new(move |result| {
                            agg_cb.complete(index, result);
                        }),
                    ) {
                        Ok(key) => Some((channel, key)),
                        Err(e) => {
                            agg.complete(
                                index,
                                OpResult::client(StatusCode::ConnectionError, e.to_string()),
                            );
                            None
                        }
                    }
                }
                Err(e) => {
                    trace!(drive = %conn.name(), error = %e, "skipping unhealthy drive");
                    agg.complete(
                        index,
                        OpResult::client(StatusCode::ConnectionError, e.to_string()),
                    );
                    None
                }
            };
            handles.push(handle);
        }

        if !agg.wait_all(self.operation_timeout) {
            warn!(cluster = %self.id, "fan-out timed out, failing outstanding requests");
            for (index, handle) in handles.iter().enumerate() {
                let timed_out =
                    agg.complete(index, OpResult::client(StatusCode::IoError, "network timeout"));
                if timed_out {
                    if let Some((channel, key)) = handle {
                        channel.cancel(*key);
                    }
                    conns[index].set_error();
                }
            }
        }

        agg.take_results()
    }

    fn get_version(&self, key: &[u8]) -> ClusterResult<(ValueVersion, Bytes)> {
        let conns = self.assigned(key, self.stripe_len());
        let payloads = conns
            .iter()
            .map(|_| RequestPayload::GetVersion { key: key.to_vec() })
            .collect();
        let results = self.execute(&conns, payloads);
        ClusterError::from_status(&quorum_status(&results, self.n_data, self.n_parity))?;

        let versions: Vec<&[u8]> = results
            .iter()
            .map(|r| match &r.payload {
                ResponsePayload::Version(v) => v.as_slice(),
                _ => &[][..],
            })
            .collect();
        let (best, count) = most_frequent_version(&versions);
        if count < self.n_data {
            return Err(ClusterError::Io(format!(
                "Unreadable: {count} equal versions does not reach read quorum of {}",
                self.n_data
            )));
        }
        Ok((
            ValueVersion::from_bytes(versions[best].to_vec()),
            Bytes::new(),
        ))
    }

    fn get_record(&self, key: &[u8]) -> ClusterResult<(ValueVersion, Bytes)> {
        let conns = self.assigned(key, self.stripe_len());
        let payloads = conns
            .iter()
            .map(|_| RequestPayload::Get { key: key.to_vec() })
            .collect();
        let results = self.execute(&conns, payloads);
        ClusterError::from_status(&quorum_status(&results, self.n_data, self.n_parity))?;

        // A read quorum must agree on one version before shards are used.
        let versions: Vec<&[u8]> = results
            .iter()
            .map(|r| match &r.payload {
                ResponsePayload::Record(record) => record.version.as_slice(),
                _ => &[][..],
            })
            .collect();
        let (best, count) = most_frequent_version(&versions);
        if count < self.n_data {
            return Err(ClusterError::Io(format!(
                "Unreadable: {count} equal versions does not reach read quorum of {}",
                self.n_data
            )));
        }
        let target_version = versions[best].to_vec();

        // Shards conforming to the agreed version with a valid checksum.
        let mut stripe: Vec<Option<Vec<u8>>> = Vec::with_capacity(results.len());
        let mut usable = 0_usize;
        for result in &results {
            let shard = match &result.payload {
                ResponsePayload::Record(record)
                    if record.version == target_version
                        && !record.value.is_empty()
                        && record.verify_tag() =>
                {
                    usable += 1;
                    Some(record.value.clone())
                }
                _ => None,
            };
            stripe.push(shard);
        }

        let version = ValueVersion::from_bytes(target_version);

        // Zero usable shards with an agreed version: the key holds an
        // empty value.
        if usable == 0 {
            return Ok((version, Bytes::new()));
        }

        if usable < self.n_data {
            return Err(ClusterError::Io(format!(
                "only {usable} valid shards of {}, stripe cannot be reconstructed",
                stripe.len()
            )));
        }
        if usable < stripe.len() {
            debug!(cluster = %self.id, missing = stripe.len() - usable, "reconstructing stripe");
            self.codec.compute(&mut stripe)?;
        }

        // All data slots are filled now; concatenate them and trim the
        // padding back off using the size carried in the version.
        let mut value = Vec::new();
        for shard in stripe.iter().take(self.n_data) {
            value.extend_from_slice(shard.as_deref().unwrap_or_default());
        }
        value.truncate(version.decode_size() as usize);
        Ok((version, Bytes::from(value)))
    }

    fn put(
        &self,
        key: &[u8],
        prior_version: Option<&ValueVersion>,
        value: &[u8],
        force: bool,
    ) -> ClusterResult<ValueVersion> {
        let max_value_size = {
            let state = self.getlog.lock().expect("getlog state poisoned");
            state.limits.max_value_size * self.n_data as u64
        };
        if value.len() as u64 > max_value_size {
            return Err(ClusterError::InvalidArgument(format!(
                "value of {} bytes exceeds cluster limit of {max_value_size}",
                value.len()
            )));
        }

        let version_new = ValueVersion::generate(value.len() as u64);
        let prior = prior_version.map(ValueVersion::to_vec).unwrap_or_default();

        // Chunk the value into n_data shards padded to a uniform length,
        // then let the codec fill in the parity slots.
        let chunk_size = value.len().div_ceil(self.n_data);
        let mut stripe: Vec<Option<Vec<u8>>> = Vec::with_capacity(self.stripe_len());
        for i in 0..self.n_data {
            let start = (i * chunk_size).min(value.len());
            let end = ((i + 1) * chunk_size).min(value.len());
            let mut shard = value[start..end].to_vec();
            shard.resize(chunk_size, 0);
            stripe.push(Some(shard));
        }
        for _ in 0..self.n_parity {
            stripe.push(if chunk_size == 0 {
                Some(Vec::new())
            } else {
                None
            });
        }
        // An empty value has nothing to encode; every shard stays empty.
        if chunk_size > 0 {
            self.codec.compute(&mut stripe)?;
        }

        let mode = if force {
            WriteMode::IgnoreVersion
        } else {
            WriteMode::RequireSameVersion
        };
        let conns = self.assigned(key, self.stripe_len());
        let payloads = stripe
            .into_iter()
            .map(|shard| RequestPayload::Put {
                key: key.to_vec(),
                prior_version: prior.clone(),
                mode,
                record: Record::new(
                    shard.expect("stripe fully populated"),
                    version_new.to_vec(),
                ),
                persist: PersistMode::WriteBack,
            })
            .collect();

        let results = self.execute(&conns, payloads);
        ClusterError::from_status(&quorum_status(&results, self.n_data, self.n_parity))?;
        Ok(version_new)
    }

    fn remove(
        &self,
        key: &[u8],
        version: Option<&ValueVersion>,
        force: bool,
    ) -> ClusterResult<()> {
        let prior = version.map(ValueVersion::to_vec).unwrap_or_default();
        let mode = if force {
            WriteMode::IgnoreVersion
        } else {
            WriteMode::RequireSameVersion
        };
        let conns = self.assigned(key, self.stripe_len());
        let payloads = conns
            .iter()
            .map(|_| RequestPayload::Delete {
                key: key.to_vec(),
                prior_version: prior.clone(),
                mode,
                persist: PersistMode::WriteBack,
            })
            .collect();
        let results = self.execute(&conns, payloads);
        ClusterError::from_status(&quorum_status(&results, self.n_data, self.n_parity))
    }

    fn range(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        max_requested: u32,
    ) -> ClusterResult<Vec<Bytes>> {
        let conns = self.assigned(start_key, self.stripe_len());
        let payloads = conns
            .iter()
            .map(|_| RequestPayload::GetKeyRange {
                start: start_key.to_vec(),
                end: end_key.to_vec(),
                start_inclusive: true,
                end_inclusive: true,
                reverse: false,
                max_returned: max_requested,
            })
            .collect();
        let results = self.execute(&conns, payloads);
        ClusterError::from_status(&quorum_status(&results, self.n_data, self.n_parity))?;

        // Drives hold overlapping shards of the key space; a set merge
        // deduplicates the union.
        let mut merged = BTreeSet::new();
        for result in results {
            if let ResponsePayload::Keys(keys) = result.payload {
                merged.extend(keys);
            }
        }
        let mut keys: Vec<Bytes> = merged.into_iter().map(Bytes::from).collect();
        keys.truncate(max_requested as usize);
        Ok(keys)
    }

    /// Queries all drives and folds their logs into the cached cluster
    /// view under the getlog lock.
    fn get_log(&self, types: &[GetLogType]) -> ClusterResult<()> {
        let conns: Vec<Arc<AutoConnection>> = self.connections.to_vec();
        let payloads = conns
            .iter()
            .map(|_| RequestPayload::GetLog {
                types: types.to_vec(),
            })
            .collect();
        let results = self.execute(&conns, payloads);
        let status = quorum_status(&results, self.n_data, self.n_parity);

        let mut state = self.getlog.lock().expect("getlog state poisoned");
        state.status = status;
        state.outstanding = false;
        ClusterError::from_status(&state.status)?;

        if types.contains(&GetLogType::Capacities) {
            state.size = ClusterSize::default();
        }
        for result in &results {
            if !result.status.is_ok() {
                continue;
            }
            let ResponsePayload::Log(log) = &result.payload else {
                continue;
            };
            if types.contains(&GetLogType::Capacities) {
                let total = log.capacity.nominal_capacity_in_bytes;
                state.size.bytes_total += total;
                state.size.bytes_free +=
                    total.saturating_sub((total as f64 * log.capacity.portion_full) as u64);
            }
            if types.contains(&GetLogType::Limits) {
                state.limits = log.limits;
            }
        }
        Ok(())
    }
}

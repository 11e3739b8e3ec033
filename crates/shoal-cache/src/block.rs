//! A single cached logical block.
//!
//! Reads are served from the in-memory value once it is fresh enough;
//! writes are journaled as `(offset, length)` updates so they can be
//! merged over a concurrently changed remote value. Flushing writes the
//! whole value back under the held version and resolves version
//! conflicts by re-reading, re-merging and retrying.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use shoal_cluster::{Cluster, ClusterError};
use shoal_types::ValueVersion;
use tracing::{debug, trace};

use crate::error::{CacheError, CacheResult};

/// How long a validated version is trusted before it is re-checked
/// against the cluster.
const EXPIRATION: Duration = Duration::from_millis(1000);

/// How a block was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// The key is expected to exist remotely.
    Standard,
    /// The key is expected to be created by this client; the block is
    /// dirty until its first flush.
    Create,
}

struct BlockState {
    version: Option<ValueVersion>,
    value: Vec<u8>,
    /// Authoritative logical size; `value` may be padded beyond it.
    value_size: usize,
    /// Ordered write journal; a zero length marks a truncate.
    updates: Vec<(usize, usize)>,
    validated_at: Option<Instant>,
}

/// One logical block, shared between its cache entry and any in-flight
/// background flush.
pub struct DataBlock {
    cluster: Arc<dyn Cluster>,
    key: Bytes,
    mode: BlockMode,
    inner: Mutex<BlockState>,
}

impl std::fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBlock")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl DataBlock {
    pub fn new(cluster: Arc<dyn Cluster>, key: Bytes, mode: BlockMode) -> Self {
        Self {
            cluster,
            key,
            mode,
            inner: Mutex::new(BlockState {
                version: None,
                value: Vec::new(),
                value_size: 0,
                updates: Vec::new(),
                validated_at: None,
            }),
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Maximum size of this block: the cluster's logical value limit.
    pub fn capacity(&self) -> usize {
        self.cluster.limits().max_value_size as usize
    }

    /// Copies block content at `offset` into `buf`, zero-filling any part
    /// past the current size (holes read as zeros).
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> CacheResult<()> {
        let mut state = self.inner.lock().expect("block state poisoned");
        self.check_bounds(offset, buf.len())?;

        if !self.validate_version(&mut state) {
            self.fetch_remote(&mut state)?;
        }

        let available = state.value.len().min(state.value_size);
        let copy_len = buf.len().min(available.saturating_sub(offset));
        if copy_len > 0 {
            buf[..copy_len].copy_from_slice(&state.value[offset..offset + copy_len]);
        }
        buf[copy_len..].fill(0);
        Ok(())
    }

    /// Splices `buf` into the block at `offset` and journals the write.
    pub fn write(&self, offset: usize, buf: &[u8]) -> CacheResult<()> {
        let mut state = self.inner.lock().expect("block state poisoned");
        self.check_bounds(offset, buf.len())?;

        state.value_size = state.value_size.max(offset + buf.len());

        // Grow straight to capacity so a streaming writer does not pay
        // for one reallocation per write; value_size tracks the logical
        // length separately.
        if state.value.len() < state.value_size {
            let capacity = self.capacity();
            state.value.resize(capacity, 0);
        }

        state.value[offset..offset + buf.len()].copy_from_slice(buf);
        state.updates.push((offset, buf.len()));
        Ok(())
    }

    /// Sets the logical size and journals the truncation.
    pub fn truncate(&self, offset: usize) -> CacheResult<()> {
        let mut state = self.inner.lock().expect("block state poisoned");
        self.check_bounds(offset, 0)?;

        state.value_size = offset;
        state.updates.push((offset, 0));
        Ok(())
    }

    /// Writes the block back to the cluster under the held version.
    ///
    /// A version mismatch means another writer flushed first: re-read the
    /// remote value, merge the local journal over it and retry until some
    /// other outcome is reached.
    pub fn flush(&self) -> CacheResult<()> {
        let mut state = self.inner.lock().expect("block state poisoned");

        loop {
            if state.value.len() != state.value_size {
                let size = state.value_size;
                state.value.resize(size, 0);
            }

            match self
                .cluster
                .put(&self.key, state.version.as_ref(), &state.value, false)
            {
                Ok(version) => {
                    state.version = Some(version);
                    state.updates.clear();
                    state.validated_at = Some(Instant::now());
                    trace!(key = %String::from_utf8_lossy(&self.key), "block flushed");
                    return Ok(());
                }
                Err(ClusterError::VersionMismatch) => {
                    debug!(
                        key = %String::from_utf8_lossy(&self.key),
                        "version mismatch on flush, merging remote value"
                    );
                    self.fetch_remote(&mut state)?;
                }
                Err(e) => {
                    return Err(CacheError::Io(format!(
                        "writing key '{}' to cluster failed: {e}",
                        String::from_utf8_lossy(&self.key)
                    )));
                }
            }
        }
    }

    /// A block is dirty when it journals unflushed updates, or when it
    /// was opened for create and has never been flushed.
    pub fn dirty(&self) -> bool {
        let state = self.inner.lock().expect("block state poisoned");
        !state.updates.is_empty() || (state.version.is_none() && self.mode == BlockMode::Create)
    }

    /// Current logical size, revalidated against the cluster when stale.
    pub fn size(&self) -> CacheResult<usize> {
        let mut state = self.inner.lock().expect("block state poisoned");
        if !self.validate_version(&mut state) {
            self.fetch_remote(&mut state)?;
        }
        Ok(state.value_size)
    }

    fn check_bounds(&self, offset: usize, length: usize) -> CacheResult<()> {
        let capacity = self.capacity();
        if offset.checked_add(length).map_or(true, |end| end > capacity) {
            return Err(CacheError::InvalidArgument(format!(
                "range {offset}+{length} exceeds block capacity {capacity}"
            )));
        }
        Ok(())
    }

    /// True while the in-memory version is trustworthy.
    ///
    /// Within the expiry window no network traffic happens. Past it, the
    /// remote version is compared: a missing remote entry is consistent
    /// with a never-flushed block.
    fn validate_version(&self, state: &mut BlockState) -> bool {
        if let Some(at) = state.validated_at {
            if at.elapsed() < EXPIRATION {
                return true;
            }
        }

        // First read of a block opened in standard mode: skip the version
        // probe and go straight to the value fetch.
        if state.version.is_none() && self.mode == BlockMode::Standard {
            return false;
        }

        match self.cluster.get(&self.key, true) {
            Ok((remote_version, _)) => {
                if state.version.as_ref() == Some(&remote_version) {
                    state.validated_at = Some(Instant::now());
                    return true;
                }
            }
            Err(ClusterError::NotFound) => {
                if state.version.is_none() {
                    state.validated_at = Some(Instant::now());
                    return true;
                }
            }
            Err(_) => {}
        }
        false
    }

    /// Reads the current remote value and replays the local journal over
    /// it, preserving write-behind semantics across remote change.
    fn fetch_remote(&self, state: &mut BlockState) -> CacheResult<()> {
        let mut base = match self.cluster.get(&self.key, false) {
            Ok((version, value)) => {
                state.version = Some(version);
                value.to_vec()
            }
            Err(ClusterError::NotFound) => {
                state.version = None;
                Vec::new()
            }
            Err(e) => {
                return Err(CacheError::Io(format!(
                    "reading key '{}' from cluster failed: {e}",
                    String::from_utf8_lossy(&self.key)
                )));
            }
        };

        state.value_size = base.len();
        if !state.updates.is_empty() && base.len() < self.capacity() {
            base.resize(self.capacity(), 0);
        }

        for &(offset, length) in &state.updates {
            if length == 0 {
                state.value_size = offset;
            } else {
                state.value_size = state.value_size.max(offset + length);
                base[offset..offset + length]
                    .copy_from_slice(&state.value[offset..offset + length]);
            }
        }

        state.value = base;
        state.validated_at = Some(Instant::now());
        Ok(())
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        // Serialize destruction with any flush still running on another
        // thread.
        let _guard = self.inner.lock();
    }
}

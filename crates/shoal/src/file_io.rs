//! Logical file I/O chunked over cache blocks.
//!
//! A file `kinetic://{clusterID}/{name}` is stored as blocks keyed
//! `{name}_{n}`, each at most `limits().max_value_size` bytes. Reads and
//! writes stream through the shared data cache; a write that fills a
//! block to its end hands the block to the background flusher.

use std::sync::{Arc, Mutex};

use shoal_cache::{BlockMode, CacheOwner, DataCache, RequestMode};
use shoal_cluster::{Cluster, ClusterError};
use shoal_types::block_key;
use tracing::debug;

use crate::error::{ShoalError, ShoalResult};
use crate::library::Library;

/// Upper bound on the number of block keys enumerated per file.
const MAX_BLOCK_SCAN: u32 = 1_000_000;

/// One open file.
pub struct FileIo {
    cache: Arc<DataCache>,
    cluster: Arc<dyn Cluster>,
    owner: CacheOwner,
    block_size: u64,
    path: String,
    /// Largest size produced by local writes and truncates; remote state
    /// may lag behind it until flush.
    local_size: Mutex<Option<u64>>,
}

impl std::fmt::Debug for FileIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileIo")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl FileIo {
    /// Parses a path of the form `kinetic://{clusterID}/{name}`.
    pub fn parse_path(path: &str) -> ShoalResult<(&str, &str)> {
        let invalid = || ShoalError::InvalidPath(path.to_owned());
        let rest = path.strip_prefix("kinetic://").ok_or_else(invalid)?;
        let (cluster_id, name) = rest.split_once('/').ok_or_else(invalid)?;
        if cluster_id.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        Ok((cluster_id, name))
    }

    pub(crate) fn open(library: &Library, path: &str) -> ShoalResult<Self> {
        let (cluster_id, name) = Self::parse_path(path)?;
        let cluster = library.cluster_map().cluster(cluster_id)?;
        let block_size = cluster.limits().max_value_size;
        if block_size == 0 {
            return Err(ShoalError::Io(format!(
                "cluster {cluster_id} reports a zero value limit"
            )));
        }
        let owner = library
            .cache()
            .register_owner(Arc::clone(&cluster), name);
        debug!(path, block_size, "file opened");
        Ok(Self {
            cache: Arc::clone(library.cache()),
            cluster,
            owner,
            block_size,
            path: path.to_owned(),
            local_size: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads up to `buf.len()` bytes at `offset`. Returns the number of
    /// bytes read; zero means end of file.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> ShoalResult<usize> {
        let size = self.size()?;
        if offset >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);

        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let block_number = pos / self.block_size;
            let local = (pos % self.block_size) as usize;
            let chunk = (len - done).min(self.block_size as usize - local);
            let block = self.cache.get(
                &self.owner,
                block_number,
                BlockMode::Standard,
                RequestMode::Standard,
            )?;
            block.read(local, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(len)
    }

    /// Writes `buf` at `offset`. Completed blocks are flushed in the
    /// background; partial tail blocks stay dirty until `flush`.
    pub fn write(&self, offset: u64, buf: &[u8]) -> ShoalResult<usize> {
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block_number = pos / self.block_size;
            let local = (pos % self.block_size) as usize;
            let chunk = (buf.len() - done).min(self.block_size as usize - local);
            let block = self.cache.get(
                &self.owner,
                block_number,
                BlockMode::Create,
                RequestMode::Standard,
            )?;
            block.write(local, &buf[done..done + chunk])?;
            if local + chunk == self.block_size as usize {
                self.cache.async_flush(&self.owner, block);
            }
            done += chunk;
        }

        let mut local_size = self.local_size.lock().expect("size cache poisoned");
        let end = offset + buf.len() as u64;
        *local_size = Some(local_size.map_or(end, |s| s.max(end)));
        Ok(buf.len())
    }

    /// Truncates the file to `size` bytes, discarding blocks past the
    /// new end.
    pub fn truncate(&self, size: u64) -> ShoalResult<()> {
        // Push pending writes first so no background flush resurrects a
        // block removed below.
        self.cache.flush(&self.owner)?;

        let last_block = size / self.block_size;
        let local = (size % self.block_size) as usize;
        let block = self.cache.get(
            &self.owner,
            last_block,
            BlockMode::Create,
            RequestMode::Standard,
        )?;
        block.truncate(local)?;

        for number in self.remote_block_numbers()? {
            if number > last_block {
                let key = block_key(self.owner.block_basename(), number);
                match self.cluster.remove(&key, None, true) {
                    Ok(()) | Err(ClusterError::NotFound) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        *self.local_size.lock().expect("size cache poisoned") = Some(size);
        Ok(())
    }

    /// Flushes every dirty block of this file.
    pub fn flush(&self) -> ShoalResult<()> {
        self.cache.flush(&self.owner)?;
        Ok(())
    }

    /// Current file size: the highest stored block plus any local
    /// write-behind growth.
    pub fn size(&self) -> ShoalResult<u64> {
        let local = *self.local_size.lock().expect("size cache poisoned");

        let remote = match self.remote_block_numbers()?.into_iter().max() {
            Some(number) => {
                let block = self.cache.get(
                    &self.owner,
                    number,
                    BlockMode::Standard,
                    RequestMode::Readahead,
                )?;
                number * self.block_size + block.size()? as u64
            }
            None => 0,
        };
        Ok(local.map_or(remote, |l| l.max(remote)))
    }

    /// Deletes the file: drops local state and removes every stored
    /// block.
    pub fn remove(&self) -> ShoalResult<()> {
        self.cache.drop_owner(&self.owner);
        for number in self.remote_block_numbers()? {
            let key = block_key(self.owner.block_basename(), number);
            match self.cluster.remove(&key, None, true) {
                Ok(()) | Err(ClusterError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        *self.local_size.lock().expect("size cache poisoned") = Some(0);
        Ok(())
    }

    /// Block numbers of this file currently stored on the cluster.
    fn remote_block_numbers(&self) -> ShoalResult<Vec<u64>> {
        let prefix = format!("{}_", self.owner.block_basename());
        let mut end = prefix.clone().into_bytes();
        end.push(0xFF);
        let keys = self
            .cluster
            .range(prefix.as_bytes(), &end, MAX_BLOCK_SCAN)?;

        let mut numbers = Vec::new();
        for key in keys {
            let Some(suffix) = key.strip_prefix(prefix.as_bytes()) else {
                continue;
            };
            if let Ok(number) = std::str::from_utf8(suffix)
                .map_err(|_| ())
                .and_then(|s| s.parse::<u64>().map_err(|_| ()))
            {
                numbers.push(number);
            }
        }
        Ok(numbers)
    }
}

impl Drop for FileIo {
    fn drop(&mut self) {
        // Best-effort write-back on close, then sever the cache links.
        let _ = self.cache.flush(&self.owner);
        self.cache.drop_owner(&self.owner);
    }
}

//! The process-wide library container.
//!
//! One lazily initialized instance owns the configuration, the cluster
//! map and the shared data cache; it outlives every [`FileIo`] created
//! from it. No other process-wide mutable state exists.

use std::sync::{Arc, Mutex, OnceLock};

use shoal_cache::DataCache;
use tracing::info;

use crate::cluster_map::ClusterMap;
use crate::config::{Config, LibrarySettings};
use crate::error::{ShoalError, ShoalResult};
use crate::file_io::FileIo;

static INSTANCE: OnceLock<ShoalResult<Library>> = OnceLock::new();

/// Configuration, cluster map and cache shared by all file I/O objects.
pub struct Library {
    cluster_map: ClusterMap,
    cache: Arc<DataCache>,
    settings: Mutex<LibrarySettings>,
}

impl Library {
    /// The process-wide instance, initialized from the environment on
    /// first use.
    pub fn instance() -> ShoalResult<&'static Library> {
        match INSTANCE.get_or_init(Library::load_from_env) {
            Ok(library) => Ok(library),
            Err(e) => Err(e.clone()),
        }
    }

    /// Builds a library from the three environment variables.
    pub fn load_from_env() -> ShoalResult<Library> {
        Self::from_config(Config::from_env()?)
    }

    /// Builds a library from an already resolved configuration.
    pub fn from_config(config: Config) -> ShoalResult<Library> {
        let cache = DataCache::new(
            config.settings.cache_target_size,
            config.settings.cache_capacity,
            config.settings.background_io_threads,
            config.settings.background_io_queue_depth,
            config.settings.readahead_window,
        )
        .map_err(|e| ShoalError::Config(e.to_string()))?;

        let cluster_map = ClusterMap::new()?;
        cluster_map.reset(config.clusters, config.drives);
        info!("library initialized");
        Ok(Library {
            cluster_map,
            cache: Arc::new(cache),
            settings: Mutex::new(config.settings),
        })
    }

    /// Re-reads the environment and reconfigures cache and cluster map.
    pub fn reload_configuration(&self) -> ShoalResult<()> {
        let config = Config::from_env()?;
        self.cache.change_configuration(
            config.settings.cache_target_size,
            config.settings.cache_capacity,
            config.settings.background_io_threads,
            config.settings.background_io_queue_depth,
            config.settings.readahead_window,
        );
        self.cluster_map.reset(config.clusters, config.drives);
        *self.settings.lock().expect("settings poisoned") = config.settings;
        info!("configuration reloaded");
        Ok(())
    }

    pub fn cluster_map(&self) -> &ClusterMap {
        &self.cluster_map
    }

    pub fn cache(&self) -> &Arc<DataCache> {
        &self.cache
    }

    pub fn settings(&self) -> LibrarySettings {
        self.settings.lock().expect("settings poisoned").clone()
    }

    /// Opens a file I/O object for a `kinetic://{clusterID}/{name}` path.
    pub fn make_file_io(&self, path: &str) -> ShoalResult<FileIo> {
        FileIo::open(self, path)
    }
}

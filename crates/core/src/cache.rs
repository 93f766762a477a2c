//! Memoization of expensive encoder probing.
//!
//! Finding the parameter sets an encoder produces for a given resolution
//! can mean recording and parsing a test clip. The result only depends on
//! the device and the requested quality, so it is computed once and
//! reused. Entries carry the probe version they were recorded under;
//! bumping the version invalidates all of them at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::media::CodecParams;

/// Injected cache service for probe results.
pub trait ProbeCache: Send + Sync {
    fn get(&self, key: &str) -> Option<CodecParams>;

    fn put(&self, key: &str, params: CodecParams);

    fn invalidate(&self, key: &str);
}

/// In-process [`ProbeCache`] keyed by probe key, with a version counter.
#[derive(Debug, Default)]
pub struct MemoryProbeCache {
    version: AtomicU32,
    entries: Mutex<HashMap<String, (u32, CodecParams)>>,
}

impl MemoryProbeCache {
    pub fn new(version: u32) -> Self {
        Self {
            version: AtomicU32::new(version),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide instance sessions use unless another is injected.
    pub fn shared() -> Arc<MemoryProbeCache> {
        static SHARED: OnceLock<Arc<MemoryProbeCache>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(MemoryProbeCache::default())).clone()
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    /// Switch to a new probe version. Older entries are dropped lazily.
    pub fn set_version(&self, version: u32) {
        let old = self.version.swap(version, Ordering::SeqCst);
        if old != version {
            tracing::debug!(old, new = version, "probe cache version changed");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProbeCache for MemoryProbeCache {
    fn get(&self, key: &str) -> Option<CodecParams> {
        let current = self.version();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((version, params)) if *version == current => Some(params.clone()),
            Some((version, _)) => {
                tracing::debug!(key, version, current, "stale probe result dropped");
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: &str, params: CodecParams) {
        let version = self.version();
        self.entries.lock().insert(key.to_string(), (version, params));
    }

    fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

//! Filesystem blob store for captured images.
//!
//! Writes are full-object puts under a logical relative path; there are
//! no partial readers. Existence checks are cached briefly because the
//! image list endpoints stat every row they return.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::Result;

const STAT_CACHE_TTL: Duration = Duration::from_secs(10);

pub struct BlobStore {
    root: PathBuf,
    stat_cache: Mutex<HashMap<String, (Instant, bool)>>,
}

impl BlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(BlobStore {
            root,
            stat_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn abs_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Full-object put. Parent directories are created on demand.
    pub fn put(&self, rel: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.abs_path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        self.stat_cache.lock().insert(rel.to_string(), (Instant::now(), true));
        Ok(path)
    }

    pub fn read(&self, rel: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.abs_path(rel))?)
    }

    /// Whether the blob exists, cached for a few seconds per path.
    pub fn exists_cached(&self, rel: &str) -> bool {
        let now = Instant::now();
        {
            let cache = self.stat_cache.lock();
            if let Some((at, present)) = cache.get(rel) {
                if now.duration_since(*at) < STAT_CACHE_TTL {
                    return *present;
                }
            }
        }
        let present = self.abs_path(rel).is_file();
        let mut cache = self.stat_cache.lock();
        // Opportunistic cleanup so the map does not grow with history.
        if cache.len() > 4096 {
            cache.retain(|_, (at, _)| now.duration_since(*at) < STAT_CACHE_TTL);
        }
        cache.insert(rel.to_string(), (now, present));
        present
    }
}

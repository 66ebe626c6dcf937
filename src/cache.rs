use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::PipelineError;

/// Cache families with independent TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheFamily {
    SupplierProducts,
    AmazonAsin,
    LinkingMap,
}

impl CacheFamily {
    fn name(self) -> &'static str {
        match self {
            CacheFamily::SupplierProducts => "supplier_products",
            CacheFamily::AmazonAsin => "amazon_asin",
            CacheFamily::LinkingMap => "linking_map",
        }
    }
}

const DEFAULT_TTL_HOURS: u64 = 168;

/// Content-addressed JSON cache over plain files. Writes go through a
/// `.tmp` sibling and an atomic rename; a file older than its family TTL
/// reads as a miss; a file that fails JSON decode is quarantined with a
/// `.corrupt.<ts>` suffix and also reads as a miss.
#[derive(Debug, Clone)]
pub struct CacheStore {
    ttls: HashMap<CacheFamily, Duration>,
    // Writers serialize per path; readers go lock-free.
    write_locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL_HOURS)
    }
}

impl CacheStore {
    pub fn new(ttl_hours: u64) -> Self {
        let ttl = Duration::from_secs(ttl_hours * 3600);
        let mut ttls = HashMap::new();
        ttls.insert(CacheFamily::SupplierProducts, ttl);
        ttls.insert(CacheFamily::AmazonAsin, ttl);
        ttls.insert(CacheFamily::LinkingMap, ttl);
        Self {
            ttls,
            write_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn set_family_ttl(&mut self, family: CacheFamily, ttl: Duration) {
        self.ttls.insert(family, ttl);
    }

    fn ttl(&self, family: CacheFamily) -> Duration {
        self.ttls
            .get(&family)
            .copied()
            .unwrap_or(Duration::from_secs(DEFAULT_TTL_HOURS * 3600))
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Age of the file on disk, or `None` when it does not exist.
    pub fn age_of(path: &Path) -> Option<Duration> {
        let modified = std::fs::metadata(path).ok()?.modified().ok()?;
        modified.elapsed().ok()
    }

    /// Read a value if present and fresh. TTL exceeded, missing file and
    /// quarantined corruption all read as `None`.
    pub fn get<T: DeserializeOwned>(&self, family: CacheFamily, path: &Path) -> Result<Option<T>> {
        let age = match Self::age_of(path) {
            Some(age) => age,
            None => return Ok(None),
        };
        if age > self.ttl(family) {
            debug!(
                "Cache expired for {} ({:.1}h old, family {})",
                path.display(),
                age.as_secs_f64() / 3600.0,
                family.name()
            );
            return Ok(None);
        }

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("reading cache file {}", path.display())))
            }
        };

        match serde_json::from_str::<T>(&raw) {
            Ok(value) => {
                debug!(
                    "Cache hit for {} ({:.1}h old)",
                    path.display(),
                    age.as_secs_f64() / 3600.0
                );
                Ok(Some(value))
            }
            Err(decode_err) => {
                self.quarantine(path, &decode_err.to_string());
                Ok(None)
            }
        }
    }

    /// Atomically write a value: serialize to `<path>.tmp`, rename over the
    /// target. A crash mid-write leaves only the `.tmp`, which readers never
    /// look at.
    pub fn set<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let guard = self.lock_for(path);
        let _held = guard.lock();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }
        let tmp = tmp_path(path);
        let body = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, body.as_bytes())
            .map_err(|e| {
                anyhow::Error::new(PipelineError::Fatal(format!(
                    "cache write failed for {}: {}",
                    tmp.display(),
                    e
                )))
            })?;
        std::fs::rename(&tmp, path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            anyhow::Error::new(PipelineError::Fatal(format!(
                "cache rename failed for {}: {}",
                path.display(),
                e
            )))
        })?;
        debug!("Cached {} ({} bytes)", path.display(), body.len());
        Ok(())
    }

    /// Remove every cache file under `scope` whose file name starts with
    /// `prefix`. Returns the number of files removed.
    pub fn clear_prefix(&self, scope: &Path, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        let entries = match std::fs::read_dir(scope) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("listing cache scope {}", scope.display())))
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(prefix) {
                std::fs::remove_file(entry.path())
                    .with_context(|| format!("removing cache file {}", name))?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Cleared {} cache files under {} ({}*)", removed, scope.display(), prefix);
        }
        Ok(removed)
    }

    /// Rename a corrupt file aside instead of deleting it.
    fn quarantine(&self, path: &Path, detail: &str) {
        let target = corrupt_path(path);
        warn!(
            "Corrupt cache file {} ({}); renaming to {}",
            path.display(),
            detail,
            target.display()
        );
        if let Err(e) = std::fs::rename(path, &target) {
            warn!("Failed to quarantine {}: {}", path.display(), e);
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// `<file>.corrupt.<unix-ts>` sibling for quarantined files.
pub fn corrupt_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".corrupt.{}", Utc::now().timestamp()));
    PathBuf::from(os)
}

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::cache::corrupt_path;
use crate::models::LinkingRecord;

/// Append-only map of supplier identifier → chosen ASIN, mirrored between
/// memory and one JSON array on disk. First write for an identifier wins;
/// later appends for the same identifier are silent no-ops, so a flush
/// after a duplicate rewrites an identical array.
#[derive(Debug)]
pub struct LinkingMapStore {
    path: PathBuf,
    records: Vec<LinkingRecord>,
    identifiers: HashSet<String>,
    pending: usize,
    batch_size: usize,
}

impl LinkingMapStore {
    /// Load the store from disk. A corrupt file is renamed aside with a
    /// `.corrupt.<ts>` suffix and the store starts empty.
    pub fn load(path: impl Into<PathBuf>, batch_size: usize) -> Result<Self> {
        let path = path.into();
        let records: Vec<LinkingRecord> = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(records) => records,
                Err(e) => {
                    let target = corrupt_path(&path);
                    warn!(
                        "Corrupt linking map {} ({}); renaming to {}",
                        path.display(),
                        e,
                        target.display()
                    );
                    if let Err(rename_err) = std::fs::rename(&path, &target) {
                        warn!("Failed to quarantine linking map: {}", rename_err);
                    }
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("reading linking map {}", path.display())))
            }
        };

        // Identifier uniqueness is enforced on read as well: first record
        // for an identifier wins, later duplicates are dropped.
        let mut identifiers = HashSet::new();
        let mut deduped = Vec::with_capacity(records.len());
        for record in records {
            if identifiers.insert(record.supplier_product_identifier.clone()) {
                deduped.push(record);
            }
        }

        info!(
            "Loaded linking map from {} with {} entries",
            path.display(),
            deduped.len()
        );
        Ok(Self {
            path,
            records: deduped,
            identifiers,
            pending: 0,
            batch_size: batch_size.max(1),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.identifiers.contains(identifier)
    }

    pub fn get(&self, identifier: &str) -> Option<&LinkingRecord> {
        self.records
            .iter()
            .find(|r| r.supplier_product_identifier == identifier)
    }

    pub fn records(&self) -> &[LinkingRecord] {
        &self.records
    }

    /// Append a record. Returns `false` (and changes nothing) when the
    /// identifier already exists.
    pub fn append(&mut self, record: LinkingRecord) -> bool {
        if !self
            .identifiers
            .insert(record.supplier_product_identifier.clone())
        {
            return false;
        }
        self.records.push(record);
        self.pending += 1;
        true
    }

    /// True when enough appends have accumulated to warrant a flush.
    pub fn flush_due(&self) -> bool {
        self.pending >= self.batch_size
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Persist the array atomically (tmp + rename), preserving append
    /// order exactly.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(&self.records)?;
        std::fs::write(&tmp, body)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        if self.pending > 0 {
            info!(
                "Flushed linking map: {} entries ({} new) to {}",
                self.records.len(),
                self.pending,
                self.path.display()
            );
        }
        self.pending = 0;
        Ok(())
    }

    /// Write a byte-identical copy of the map at another location (the
    /// verifier reads a mirror path).
    pub fn mirror_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(&self.records)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchMethod;

    fn record(id: &str, asin: &str) -> LinkingRecord {
        LinkingRecord {
            supplier_product_identifier: id.to_string(),
            supplier_title_snippet: "Acme Widget 4-Pack".to_string(),
            chosen_amazon_asin: asin.to_string(),
            amazon_title_snippet: "Acme Widget 4 Pack (New)".to_string(),
            amazon_ean_on_page: Some("5000000000012".to_string()),
            match_method: MatchMethod::EanSearch,
        }
    }

    #[test]
    fn append_is_idempotent_on_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linking_map.json");
        let mut store = LinkingMapStore::load(&path, 10).unwrap();

        assert!(store.append(record("EAN_5000000000012", "B01ABCDEFG")));
        assert!(!store.append(record("EAN_5000000000012", "B0DIFFERENT")));
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("EAN_5000000000012").unwrap().chosen_amazon_asin,
            "B01ABCDEFG"
        );
    }

    #[test]
    fn duplicate_append_leaves_file_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linking_map.json");
        let mut store = LinkingMapStore::load(&path, 1).unwrap();
        store.append(record("EAN_5000000000012", "B01ABCDEFG"));
        store.append(record("URL_https://s.example/p2", "B0987654ZZ"));
        store.flush().unwrap();
        let before = std::fs::read(&path).unwrap();

        store.append(record("EAN_5000000000012", "B0DIFFERENT"));
        store.flush().unwrap();
        let after = std::fs::read(&path).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn flush_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linking_map.json");
        {
            let mut store = LinkingMapStore::load(&path, 10).unwrap();
            store.append(record("EAN_1", "B000000001"));
            store.append(record("EAN_2", "B000000002"));
            store.append(record("EAN_3", "B000000003"));
            store.flush().unwrap();
        }
        let store = LinkingMapStore::load(&path, 10).unwrap();
        assert_eq!(store.len(), 3);
        let ids: Vec<_> = store
            .records()
            .iter()
            .map(|r| r.supplier_product_identifier.as_str())
            .collect();
        assert_eq!(ids, vec!["EAN_1", "EAN_2", "EAN_3"]);
    }

    #[test]
    fn corrupt_file_quarantined_and_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linking_map.json");
        std::fs::write(&path, "[{broken").unwrap();

        let store = LinkingMapStore::load(&path, 10).unwrap();
        assert!(store.is_empty());
        assert!(!path.exists());
        let corrupt_siblings: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt."))
            .collect();
        assert_eq!(corrupt_siblings.len(), 1);
    }

    #[test]
    fn batch_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linking_map.json");
        let mut store = LinkingMapStore::load(&path, 3).unwrap();
        store.append(record("EAN_1", "B000000001"));
        store.append(record("EAN_2", "B000000002"));
        assert!(!store.flush_due());
        store.append(record("EAN_3", "B000000003"));
        assert!(store.flush_due());
        store.flush().unwrap();
        assert!(!store.flush_due());
    }
}

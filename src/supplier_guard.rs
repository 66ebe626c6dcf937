use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::paths::OutputLayout;

const DEFAULT_READY_TTL_HOURS: u64 = 168; // 7 days

/// Counts written next to the ready flag when a supplier package is marked
/// valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadySummary {
    pub supplier: String,
    pub total_products: usize,
    pub products_with_ean: usize,
    pub categories_discovered: usize,
    pub linking_map_entries: usize,
    pub created: DateTime<Utc>,
}

/// `.supplier_ready` flag lifecycle. A fresh flag lets a run skip supplier
/// login and extraction entirely.
#[derive(Debug, Clone)]
pub struct SupplierGuard {
    layout: OutputLayout,
    ttl: Duration,
}

impl SupplierGuard {
    pub fn new(layout: OutputLayout) -> Self {
        Self {
            layout,
            ttl: Duration::from_secs(DEFAULT_READY_TTL_HOURS * 3600),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// True iff the flag file exists, is readable, and is younger than the
    /// TTL. The reason string is human-readable either way.
    pub fn is_ready(&self, supplier: &str) -> (bool, String) {
        let flag = self.layout.ready_flag_file(supplier);
        let age = match std::fs::metadata(&flag).and_then(|m| m.modified()) {
            Ok(modified) => match modified.elapsed() {
                Ok(age) => age,
                Err(_) => {
                    return (false, format!("{} has a future mtime", flag.display()));
                }
            },
            Err(_) => {
                return (false, format!("{} not found", flag.display()));
            }
        };
        if std::fs::read_to_string(&flag).is_err() {
            return (false, format!("{} is unreadable", flag.display()));
        }
        if age >= self.ttl {
            return (
                false,
                format!(
                    "{} is stale ({:.1}h old, TTL {:.1}h)",
                    flag.display(),
                    age.as_secs_f64() / 3600.0,
                    self.ttl.as_secs_f64() / 3600.0
                ),
            );
        }
        (
            true,
            format!(
                "{} is fresh ({:.1}h old)",
                flag.display(),
                age.as_secs_f64() / 3600.0
            ),
        )
    }

    /// Create the flag and its sibling `ready_summary.json`.
    pub fn mark_ready(&self, supplier: &str, summary: &ReadySummary) -> Result<PathBuf> {
        let dir = self.layout.supplier_dir(supplier);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating supplier directory {}", dir.display()))?;

        let summary_path = self.layout.ready_summary_file(supplier);
        let body = serde_json::to_string_pretty(summary)?;
        std::fs::write(&summary_path, body)
            .with_context(|| format!("writing {}", summary_path.display()))?;

        let flag = self.layout.ready_flag_file(supplier);
        std::fs::write(
            &flag,
            format!(
                "ready at {} with {} products\n",
                summary.created.to_rfc3339(),
                summary.total_products
            ),
        )
        .with_context(|| format!("writing {}", flag.display()))?;

        info!(
            "Marked supplier {} ready ({} products, {} linking-map entries)",
            supplier, summary.total_products, summary.linking_map_entries
        );
        Ok(flag)
    }

    /// Atomically rename the supplier directory to
    /// `<supplier>.archived.<ts>` and create a fresh empty one. Returns the
    /// archive path, or `None` when there was nothing to archive.
    pub fn archive_on_force_regenerate(&self, supplier: &str) -> Result<Option<PathBuf>> {
        let dir = self.layout.supplier_dir(supplier);
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating supplier directory {}", dir.display()))?;
            return Ok(None);
        }

        let archive = dir.with_file_name(format!(
            "{}.archived.{}",
            dir.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| supplier.to_string()),
            Utc::now().timestamp()
        ));
        std::fs::rename(&dir, &archive).with_context(|| {
            format!("archiving {} to {}", dir.display(), archive.display())
        })?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("recreating supplier directory {}", dir.display()))?;
        warn!(
            "Force regenerate: archived supplier data to {}",
            archive.display()
        );
        Ok(Some(archive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard_in(dir: &std::path::Path) -> SupplierGuard {
        SupplierGuard::new(OutputLayout::new(dir))
    }

    fn summary() -> ReadySummary {
        ReadySummary {
            supplier: "acme.example".to_string(),
            total_products: 42,
            products_with_ean: 30,
            categories_discovered: 4,
            linking_map_entries: 12,
            created: Utc::now(),
        }
    }

    #[test]
    fn not_ready_without_flag() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard_in(dir.path());
        let (ready, reason) = guard.is_ready("acme.example");
        assert!(!ready);
        assert!(reason.contains("not found"));
    }

    #[test]
    fn mark_then_ready_with_summary() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard_in(dir.path());
        guard.mark_ready("acme.example", &summary()).unwrap();

        let (ready, _) = guard.is_ready("acme.example");
        assert!(ready);

        let layout = OutputLayout::new(dir.path());
        let raw = std::fs::read_to_string(layout.ready_summary_file("acme.example")).unwrap();
        let loaded: ReadySummary = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded.total_products, 42);
    }

    #[test]
    fn stale_flag_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard_in(dir.path()).with_ttl(Duration::from_secs(0));
        guard.mark_ready("acme.example", &summary()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let (ready, reason) = guard.is_ready("acme.example");
        assert!(!ready);
        assert!(reason.contains("stale"));
    }

    #[test]
    fn archive_renames_and_recreates() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard_in(dir.path());
        guard.mark_ready("acme.example", &summary()).unwrap();

        let archived = guard
            .archive_on_force_regenerate("acme.example")
            .unwrap()
            .expect("expected an archive path");
        assert!(archived
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains(".archived."));
        assert!(archived.join(".supplier_ready").exists());

        let layout = OutputLayout::new(dir.path());
        let fresh = layout.supplier_dir("acme.example");
        assert!(fresh.exists());
        assert!(!fresh.join(".supplier_ready").exists());
    }

    #[test]
    fn archive_of_missing_supplier_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let guard = guard_in(dir.path());
        assert!(guard
            .archive_on_force_regenerate("acme.example")
            .unwrap()
            .is_none());
    }
}

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Per-run output directory layout. Every on-disk path the pipeline touches
/// is minted here so the stores never concatenate paths themselves.
///
/// ```text
/// <output_root>/
///   FBA_ANALYSIS/
///     amazon_cache/amazon_<ASIN>[_<EAN>].json
///     financial_reports/<supplier>/*.json
///     Linking map/linking_map.json
///     linking_maps/linking_map.json        (verifier mirror)
///     cached_products.json
///     ai_category_cache.json
///   cached_products/<supplier>_products_cache.json
///   processing_states/<supplier>_processing_state.json
///   suppliers/<supplier>/.supplier_ready
/// ```
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create every directory the run will write into.
    pub fn ensure_directories(&self, supplier: &str) -> Result<()> {
        let slug = supplier_slug(supplier);
        for dir in [
            self.amazon_cache_dir(),
            self.financial_reports_dir(supplier),
            self.linking_map_dir(),
            self.verifier_linking_map_dir(),
            self.supplier_cache_dir(),
            self.processing_states_dir(),
            self.supplier_dir(supplier),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating output directory {}", dir.display()))?;
        }
        debug!("Output layout ready under {} for {}", self.root.display(), slug);
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn analysis_dir(&self) -> PathBuf {
        self.root.join("FBA_ANALYSIS")
    }

    pub fn amazon_cache_dir(&self) -> PathBuf {
        self.analysis_dir().join("amazon_cache")
    }

    /// `amazon_<ASIN>.json`, or `amazon_<ASIN>_<EAN>.json` when the supplier
    /// EAN is known.
    pub fn amazon_cache_file(&self, asin: &str, supplier_ean: Option<&str>) -> PathBuf {
        let name = match supplier_ean {
            Some(ean) => format!("amazon_{}_{}.json", asin, ean),
            None => format!("amazon_{}.json", asin),
        };
        self.amazon_cache_dir().join(name)
    }

    pub fn financial_reports_dir(&self, supplier: &str) -> PathBuf {
        self.analysis_dir()
            .join("financial_reports")
            .join(supplier_slug(supplier))
    }

    pub fn linking_map_dir(&self) -> PathBuf {
        self.analysis_dir().join("Linking map")
    }

    pub fn linking_map_file(&self) -> PathBuf {
        self.linking_map_dir().join("linking_map.json")
    }

    /// Mirror location validated by the output verifier.
    pub fn verifier_linking_map_dir(&self) -> PathBuf {
        self.analysis_dir().join("linking_maps")
    }

    pub fn verifier_linking_map_file(&self) -> PathBuf {
        self.verifier_linking_map_dir().join("linking_map.json")
    }

    pub fn cached_products_artifact(&self) -> PathBuf {
        self.analysis_dir().join("cached_products.json")
    }

    pub fn ai_category_cache_artifact(&self) -> PathBuf {
        self.analysis_dir().join("ai_category_cache.json")
    }

    pub fn supplier_cache_dir(&self) -> PathBuf {
        self.root.join("cached_products")
    }

    pub fn supplier_cache_file(&self, supplier: &str) -> PathBuf {
        self.supplier_cache_dir()
            .join(format!("{}_products_cache.json", supplier_slug(supplier)))
    }

    pub fn processing_states_dir(&self) -> PathBuf {
        self.root.join("processing_states")
    }

    pub fn processing_state_file(&self, supplier: &str) -> PathBuf {
        self.processing_states_dir()
            .join(format!("{}_processing_state.json", supplier_slug(supplier)))
    }

    pub fn suppliers_dir(&self) -> PathBuf {
        self.root.join("suppliers")
    }

    pub fn supplier_dir(&self, supplier: &str) -> PathBuf {
        self.suppliers_dir().join(supplier_slug(supplier))
    }

    pub fn ready_flag_file(&self, supplier: &str) -> PathBuf {
        self.supplier_dir(supplier).join(".supplier_ready")
    }

    pub fn ready_summary_file(&self, supplier: &str) -> PathBuf {
        self.supplier_dir(supplier).join("ready_summary.json")
    }
}

/// Filesystem-safe supplier name: dots become underscores, the rest is kept
/// as-is when already safe.
pub fn supplier_slug(supplier: &str) -> String {
    supplier
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Derive a supplier name from its base URL host (`www.` stripped).
pub fn supplier_name_from_url(supplier_url: &str) -> String {
    url::Url::parse(supplier_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        .unwrap_or_else(|| supplier_slug(supplier_url))
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Typed view over the single JSON configuration document. Keys that only
/// matter to external collaborators are ignored on load; everything the
/// pipeline consumes has a default so a partial document still runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemConfig {
    #[serde(default)]
    pub system: SystemSettings,

    #[serde(default)]
    pub processing_limits: ProcessingLimits,

    #[serde(default)]
    pub supplier_cache_control: SupplierCacheControl,

    #[serde(default)]
    pub supplier_extraction_progress: ExtractionProgressSettings,

    #[serde(default)]
    pub hybrid_processing: HybridProcessingSettings,

    #[serde(default)]
    pub authentication: AuthSettings,

    #[serde(default)]
    pub performance: PerformanceSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub criteria: CriteriaSettings,

    #[serde(default)]
    pub amazon: AmazonSettings,

    #[serde(default)]
    pub supplier: SupplierSettings,
}

impl SystemConfig {
    /// Load and validate the configuration document once at startup.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: SystemConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        info!(
            "Loaded config: max_products={}, price band £{:.2}-£{:.2}, K_SWITCH={}",
            config.system.max_products,
            config.processing_limits.min_price_gbp,
            config.processing_limits.max_price_gbp,
            config.hybrid_processing.switch_to_amazon_after_categories
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.processing_limits.min_price_gbp > self.processing_limits.max_price_gbp {
            anyhow::bail!(
                "invalid price band: min £{} > max £{}",
                self.processing_limits.min_price_gbp,
                self.processing_limits.max_price_gbp
            );
        }
        if self.supplier_extraction_progress.recovery_mode != "product_resume" {
            anyhow::bail!(
                "unsupported recovery_mode '{}' (only 'product_resume' is supported)",
                self.supplier_extraction_progress.recovery_mode
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Hard cap on products processed per run; 0 means unlimited.
    #[serde(default = "default_max_products")]
    pub max_products: usize,

    #[serde(default = "default_max_per_category")]
    pub max_products_per_category: usize,

    /// Chunk size within the orchestrator's match phase.
    #[serde(default = "default_max_per_cycle")]
    pub max_products_per_cycle: usize,

    /// Categories fetched per extraction slice.
    #[serde(default = "default_extraction_batch")]
    pub supplier_extraction_batch_size: usize,

    /// Linking-map flush cadence (records).
    #[serde(default = "default_linking_map_batch")]
    pub linking_map_batch_size: usize,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            max_products: default_max_products(),
            max_products_per_category: default_max_per_category(),
            max_products_per_cycle: default_max_per_cycle(),
            supplier_extraction_batch_size: default_extraction_batch(),
            linking_map_batch_size: default_linking_map_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLimits {
    #[serde(default = "default_min_price")]
    pub min_price_gbp: f64,

    #[serde(default = "default_max_price")]
    pub max_price_gbp: f64,
}

impl Default for ProcessingLimits {
    fn default() -> Self {
        Self {
            min_price_gbp: default_min_price(),
            max_price_gbp: default_max_price(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierCacheControl {
    /// Supplier cache flush cadence (products).
    #[serde(default = "default_update_frequency")]
    pub update_frequency_products: usize,
}

impl Default for SupplierCacheControl {
    fn default() -> Self {
        Self {
            update_frequency_products: default_update_frequency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionProgressSettings {
    #[serde(default)]
    pub state_persistence: StatePersistenceSettings,

    /// Only `product_resume` is supported.
    #[serde(default = "default_recovery_mode")]
    pub recovery_mode: String,
}

impl Default for ExtractionProgressSettings {
    fn default() -> Self {
        Self {
            state_persistence: StatePersistenceSettings::default(),
            recovery_mode: default_recovery_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatePersistenceSettings {
    /// Processing-state flush cadence (products).
    #[serde(default = "default_batch_save")]
    pub batch_save_frequency: usize,
}

impl Default for StatePersistenceSettings {
    fn default() -> Self {
        Self {
            batch_save_frequency: default_batch_save(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridProcessingSettings {
    /// K_SWITCH: categories extracted before switching to the match phase.
    #[serde(default = "default_switch_after")]
    pub switch_to_amazon_after_categories: usize,

    #[serde(default)]
    pub processing_modes: ProcessingModes,
}

impl Default for HybridProcessingSettings {
    fn default() -> Self {
        Self {
            switch_to_amazon_after_categories: default_switch_after(),
            processing_modes: ProcessingModes::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProcessingModes {
    #[serde(default)]
    pub chunked: ChunkedModeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkedModeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Backlog drain size, in categories' worth of products.
    #[serde(default = "default_chunk_size")]
    pub chunk_size_categories: usize,
}

impl Default for ChunkedModeSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            chunk_size_categories: default_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive price-extraction failures before a re-login.
    #[serde(default = "default_failure_threshold")]
    pub consecutive_failure_threshold: u32,

    /// Re-login every N products processed.
    #[serde(default = "default_primary_interval")]
    pub primary_periodic_interval: usize,

    #[serde(default = "default_secondary_interval")]
    pub secondary_periodic_interval: usize,

    /// Circuit breaker: failed logins before auth is disabled.
    #[serde(default = "default_max_auth_failures")]
    pub max_consecutive_auth_failures: u32,

    /// Circuit breaker cooldown.
    #[serde(default = "default_auth_failure_delay")]
    pub auth_failure_delay_seconds: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            consecutive_failure_threshold: default_failure_threshold(),
            primary_periodic_interval: default_primary_interval(),
            secondary_periodic_interval: default_secondary_interval(),
            max_consecutive_auth_failures: default_max_auth_failures(),
            auth_failure_delay_seconds: default_auth_failure_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSettings {
    /// Detail-page worker pool size.
    #[serde(default = "default_concurrent")]
    pub max_concurrent_requests: usize,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_concurrent(),
            timeout_seconds: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,

    /// Rotation hint only; the store never deletes on size.
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            max_size_mb: default_max_size_mb(),
        }
    }
}

/// Criteria-gate thresholds. Every bound is configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriteriaSettings {
    #[serde(default = "default_min_roi")]
    pub min_roi_percent: f64,

    #[serde(default = "default_min_profit")]
    pub min_profit_per_unit: f64,

    #[serde(default = "default_min_rating")]
    pub min_rating: f64,

    #[serde(default = "default_min_reviews")]
    pub min_reviews: i64,

    #[serde(default = "default_max_sales_rank")]
    pub max_sales_rank: i64,
}

impl Default for CriteriaSettings {
    fn default() -> Self {
        Self {
            min_roi_percent: default_min_roi(),
            min_profit_per_unit: default_min_profit(),
            min_rating: default_min_rating(),
            min_reviews: default_min_reviews(),
            max_sales_rank: default_max_sales_rank(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmazonSettings {
    /// Post-load wait for browser-extension overlays to populate.
    #[serde(default = "default_extension_wait")]
    pub extension_data_wait_seconds: u64,

    /// Keepa grid row wait: primary attempt.
    #[serde(default = "default_keepa_primary")]
    pub keepa_grid_wait_seconds: u64,

    /// Keepa grid row wait: fallback attempt.
    #[serde(default = "default_keepa_fallback")]
    pub keepa_grid_fallback_wait_seconds: u64,

    /// Manual captcha wait when AI solving is unavailable or fails.
    #[serde(default = "default_captcha_wait")]
    pub captcha_manual_wait_seconds: u64,

    #[serde(default = "default_cookie_attempts")]
    pub cookie_dismiss_max_attempts: u32,

    #[serde(default = "default_marketplace")]
    pub marketplace_url: String,
}

impl Default for AmazonSettings {
    fn default() -> Self {
        Self {
            extension_data_wait_seconds: default_extension_wait(),
            keepa_grid_wait_seconds: default_keepa_primary(),
            keepa_grid_fallback_wait_seconds: default_keepa_fallback(),
            captcha_manual_wait_seconds: default_captcha_wait(),
            cookie_dismiss_max_attempts: default_cookie_attempts(),
            marketplace_url: default_marketplace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierSettings {
    /// Minimum spacing between outbound requests per domain, seconds.
    #[serde(default = "default_rate_limit_delay")]
    pub rate_limit_delay_seconds: f64,

    #[serde(default = "default_retries")]
    pub max_retries: u32,

    /// Bound on subpage discovery depth below a category.
    #[serde(default = "default_subpage_depth")]
    pub max_subpage_depth: usize,
}

impl Default for SupplierSettings {
    fn default() -> Self {
        Self {
            rate_limit_delay_seconds: default_rate_limit_delay(),
            max_retries: default_retries(),
            max_subpage_depth: default_subpage_depth(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_max_products() -> usize {
    0
}
fn default_max_per_category() -> usize {
    100
}
fn default_max_per_cycle() -> usize {
    50
}
fn default_extraction_batch() -> usize {
    3
}
fn default_linking_map_batch() -> usize {
    10
}
fn default_min_price() -> f64 {
    0.1
}
fn default_max_price() -> f64 {
    20.0
}
fn default_update_frequency() -> usize {
    5
}
fn default_recovery_mode() -> String {
    "product_resume".to_string()
}
fn default_batch_save() -> usize {
    5
}
fn default_switch_after() -> usize {
    3
}
fn default_chunk_size() -> usize {
    3
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_primary_interval() -> usize {
    100
}
fn default_secondary_interval() -> usize {
    200
}
fn default_max_auth_failures() -> u32 {
    3
}
fn default_auth_failure_delay() -> u64 {
    30
}
fn default_concurrent() -> usize {
    5
}
fn default_timeout() -> u64 {
    30
}
fn default_ttl_hours() -> u64 {
    168
}
fn default_max_size_mb() -> u64 {
    500
}
fn default_min_roi() -> f64 {
    35.0
}
fn default_min_profit() -> f64 {
    3.0
}
fn default_min_rating() -> f64 {
    4.0
}
fn default_min_reviews() -> i64 {
    50
}
fn default_max_sales_rank() -> i64 {
    150_000
}
fn default_extension_wait() -> u64 {
    25
}
fn default_keepa_primary() -> u64 {
    12
}
fn default_keepa_fallback() -> u64 {
    5
}
fn default_captcha_wait() -> u64 {
    20
}
fn default_cookie_attempts() -> u32 {
    2
}
fn default_marketplace() -> String {
    "https://www.amazon.co.uk".to_string()
}
fn default_rate_limit_delay() -> f64 {
    1.0
}
fn default_retries() -> u32 {
    3
}
fn default_subpage_depth() -> usize {
    2
}

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Accepted GTIN digit lengths (EAN-8, UPC-A, EAN-13, GTIN-14).
pub const GTIN_LENGTHS: [usize; 4] = [8, 12, 13, 14];

static ASIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(B[0-9A-Z]{9}|[0-9X]{10}|[A-Z0-9]{10})$").expect("invalid ASIN regex")
});

static ASIN_IN_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/dp/([A-Z0-9]{10})").expect("invalid ASIN URL regex"));

/// Validate an ASIN against the accepted shapes.
pub fn is_valid_asin(asin: &str) -> bool {
    ASIN_RE.is_match(asin)
}

/// Pull an ASIN out of a product-page URL (`/dp/<ASIN>`), if present.
pub fn asin_from_url(url: &str) -> Option<String> {
    ASIN_IN_URL_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Strip non-digits and validate the result as a GTIN (EAN/UPC family).
/// Returns `None` when the digit count is not one of the accepted lengths.
pub fn normalize_gtin(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if GTIN_LENGTHS.contains(&digits.len()) {
        Some(digits)
    } else {
        None
    }
}

/// Truncate a title for linking-map snippets: at most 63 characters,
/// ellipsed when cut.
pub fn title_snippet(title: &str) -> String {
    let chars: Vec<char> = title.chars().collect();
    if chars.len() <= 60 {
        title.to_string()
    } else {
        let mut s: String = chars[..60].iter().collect();
        s.push_str("...");
        s
    }
}

/// How a supplier product is identified across runs. EAN wins whenever a
/// valid one was extracted; otherwise the absolute product URL stands in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProductIdentifier {
    Ean(String),
    Url(String),
}

impl ProductIdentifier {
    /// The persistent string form used as the linking-map key.
    pub fn key(&self) -> String {
        match self {
            ProductIdentifier::Ean(ean) => format!("EAN_{}", ean),
            ProductIdentifier::Url(url) => format!("URL_{}", url),
        }
    }
}

impl std::fmt::Display for ProductIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// A supplier listing after category-walk extraction. Detail-page fields
/// (brand, description) are appended later; nothing else is mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierProduct {
    pub title: String,
    pub price: f64,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ean: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source_supplier: String,
    pub source_category_url: String,
    pub extraction_timestamp: DateTime<Utc>,
}

impl SupplierProduct {
    pub fn identifier(&self) -> ProductIdentifier {
        match &self.ean {
            Some(ean) => ProductIdentifier::Ean(ean.clone()),
            None => ProductIdentifier::Url(self.url.clone()),
        }
    }

    /// Listing is usable for matching: non-empty title, positive price,
    /// absolute URL.
    pub fn is_valid(&self) -> bool {
        !self.title.trim().is_empty()
            && self.price > 0.0
            && (self.url.starts_with("http://") || self.url.starts_with("https://"))
    }
}

/// Where a cached/extracted Amazon record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Cache,
    Fresh,
}

/// Keepa overlay data merged into the Amazon record when the iframe grid
/// was readable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeepaData {
    #[serde(default)]
    pub product_details_tab_data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub sales_rank_details_table: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl KeepaData {
    /// Numeric value for the first product-details key containing `needle`.
    pub fn details_number(&self, needle: &str) -> Option<f64> {
        self.product_details_tab_data.iter().find_map(|(k, v)| {
            if k.contains(needle) {
                v.as_f64()
            } else {
                None
            }
        })
    }
}

/// Third-party sales-velocity overlay readings (optional inputs only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SalesVelocityOverlay {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_monthly_sales_from_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_monthly_sales_ai_vision: Option<String>,
}

impl SalesVelocityOverlay {
    pub fn is_empty(&self) -> bool {
        self.estimated_monthly_sales_from_text.is_none()
            && self.estimated_monthly_sales_ai_vision.is_none()
    }
}

/// A resolved Amazon listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmazonProduct {
    pub asin: String,
    /// Set when the ASIN parsed from the landed URL differs from the one
    /// that was queried; `asin` then carries the queried value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asin_queried: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asin_from_details: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sales_rank: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_count: Option<i64>,
    pub in_stock: bool,
    pub sold_by_amazon: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub eans_on_page: BTreeSet<String>,
    #[serde(default)]
    pub upcs_on_page: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepa: Option<KeepaData>,
    #[serde(default, skip_serializing_if = "SalesVelocityOverlay::is_empty")]
    pub sales_velocity: SalesVelocityOverlay,
    pub extraction_timestamp: DateTime<Utc>,
    pub source: DataSource,
}

impl AmazonProduct {
    pub fn new(asin: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            asin: asin.into(),
            asin_queried: None,
            asin_from_details: None,
            title: title.into(),
            current_price: None,
            current_price_source: None,
            sales_rank: None,
            category: None,
            rating: None,
            review_count: None,
            in_stock: false,
            sold_by_amazon: false,
            main_image: None,
            brand: None,
            description: None,
            features: Vec::new(),
            eans_on_page: BTreeSet::new(),
            upcs_on_page: BTreeSet::new(),
            weight_text: None,
            dimensions_text: None,
            keepa: None,
            sales_velocity: SalesVelocityOverlay::default(),
            extraction_timestamp: Utc::now(),
            source: DataSource::Fresh,
        }
    }

    /// First EAN extracted from the product page, if any.
    pub fn ean_on_page(&self) -> Option<&str> {
        self.eans_on_page.iter().next().map(String::as_str)
    }
}

/// How the supplier product was linked to its chosen ASIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMethod {
    #[serde(rename = "EAN_search")]
    EanSearch,
    #[serde(rename = "title_search")]
    TitleSearch,
    #[serde(rename = "hybrid_search")]
    HybridSearch,
    #[serde(rename = "manual_match")]
    ManualMatch,
}

/// One entry of the persistent linking map. Field order is load-bearing:
/// the on-disk array must round-trip without reordering or renaming.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkingRecord {
    pub supplier_product_identifier: String,
    pub supplier_title_snippet: String,
    pub chosen_amazon_asin: String,
    pub amazon_title_snippet: String,
    pub amazon_ean_on_page: Option<String>,
    pub match_method: MatchMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchQuality {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AiDecision {
    #[serde(rename = "MATCH")]
    Match,
    #[serde(rename = "MISMATCH")]
    Mismatch,
    #[serde(rename = "UNCERTAIN")]
    Uncertain,
}

/// Matcher verdict for one (supplier, Amazon) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchValidation {
    pub match_quality: MatchQuality,
    /// In [0,1], quantised to three decimal places.
    pub confidence_score: f64,
    pub reasons: Vec<String>,
    pub checks_performed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_similarity_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_validation_decision: Option<AiDecision>,
}

/// Deterministic financial outcome for one matched tuple. All prices are
/// VAT-inclusive GBP unless a field name says otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinancialMetrics {
    pub supplier_cost_price: f64,
    pub amazon_selling_price: f64,
    pub estimated_amazon_fees: f64,
    pub estimated_profit_per_unit: f64,
    pub roi_percent_calculated: f64,
    pub vat_on_purchase_estimated: f64,
    pub vat_on_sale_estimated: f64,
    pub estimated_monthly_sales: i64,
    pub estimated_monthly_profit: f64,
    #[serde(default)]
    pub costs_breakdown: BTreeMap<String, f64>,
    #[serde(default)]
    pub revenue_breakdown: BTreeMap<String, f64>,
}

/// Per-supplier category-walk position, nested inside `ProcessingState`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupplierExtractionProgress {
    pub current_category_index: usize,
    pub current_product_index_in_category: usize,
    pub total_categories: usize,
    #[serde(default)]
    pub categories_completed: Vec<String>,
}

/// The resumability record. `last_processed_index` is an absolute index
/// into the price-filtered product list and never decreases in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingState {
    pub last_processed_index: usize,
    #[serde(default)]
    pub supplier_extraction_progress: SupplierExtractionProgress,
    #[serde(default)]
    pub linking_map_batch_position: usize,
    pub last_checkpoint: DateTime<Utc>,
}

impl Default for ProcessingState {
    fn default() -> Self {
        Self {
            last_processed_index: 0,
            supplier_extraction_progress: SupplierExtractionProgress::default(),
            linking_map_batch_position: 0,
            last_checkpoint: Utc::now(),
        }
    }
}

/// End-of-run counters, logged and embedded in the financial report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub total_supplier_products: usize,
    pub products_analyzed: usize,
    pub products_profitable: usize,
    pub products_previously_visited: usize,
    pub products_failed_triage: usize,
    pub errors: usize,
    #[serde(default)]
    pub rejections: BTreeMap<String, usize>,
}

impl ResultsSummary {
    pub fn record_rejection(&mut self, reason: &str) {
        *self.rejections.entry(reason.to_string()).or_insert(0) += 1;
    }
}

/// One qualifying tuple promoted to the run's result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitableResult {
    pub supplier_product: SupplierProduct,
    pub amazon_product: AmazonProduct,
    pub match_validation: MatchValidation,
    pub financial_metrics: FinancialMetrics,
    pub match_method: MatchMethod,
}

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector as CssSelector};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::AmazonSettings;
use crate::matcher::{overlap_score, title_similarity};
use crate::models::{asin_from_url, is_valid_asin, normalize_gtin, AmazonProduct, KeepaData};
use crate::supplier_scraper::{collapse_whitespace, parse_price};

/// Injected browser-page capability. Exactly one page exists per session
/// and only the Amazon extractor holds it; navigation, clicking and
/// captcha solving are delegated to the implementation.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;
    async fn content(&self) -> Result<String>;
    async fn current_url(&self) -> Result<String>;
    /// Click the first element matching the selector; `false` when absent.
    async fn click(&self, css: &str) -> Result<bool>;
    /// Attempt to solve a visible captcha; `true` when it was cleared.
    async fn solve_captcha(&self) -> Result<bool>;
    /// Inner HTML of the first iframe matching the selector, if loaded.
    async fn iframe_content(&self, css: &str) -> Result<Option<String>>;
}

/// One search-result tile.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub asin: String,
    pub title: String,
    pub similarity: Option<f64>,
}

/// Outcome of an EAN or title search.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub results: Vec<SearchHit>,
    pub error: Option<String>,
    /// Set when no candidate met the overlap threshold and the first
    /// organic result was taken anyway.
    pub low_confidence: bool,
    /// ASIN extracted from the URL when the search landed directly on a
    /// product detail page.
    pub direct_product_asin: Option<String>,
}

const CAPTCHA_MARKER: &str = "/errors/validateCaptcha";
const COOKIE_BUTTON_CSS: &str = "input#sp-cc-accept";
const KEEPA_IFRAME_CSS: &str = "iframe[id*='keepa'], iframe[src*='keepa.com']";
const MAX_TILES_SCANNED: usize = 15;
const MAX_ORGANIC_RESULTS: usize = 5;
const EAN_OVERLAP_THRESHOLD: f64 = 0.25;
const MAX_TITLE_RESULTS: usize = 10;

static RANK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#?([\d,]+)\s+in\s+([^(\n]+)").expect("invalid rank regex"));

static SPONSORED_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)sponsored|advertisement|ad for").expect("invalid ad regex"));

static KNOWN_AD_CLASSES: [&str; 6] = [
    "AdHolder",
    "s-widget-sponsored-product",
    "sponsored-results-padding",
    "s-result-item-sponsored-popup",
    "puis-sponsored-container-component",
    "ad-feedback",
];

fn parse_number(text: &str) -> i64 {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

fn select_first_text(html: &Html, css: &str) -> Option<String> {
    let selector = CssSelector::parse(css).ok()?;
    html.select(&selector)
        .next()
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

fn select_first_attr(html: &Html, css: &str, attr: &str) -> Option<String> {
    let selector = CssSelector::parse(css).ok()?;
    html.select(&selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Amazon product extractor over an injected page. Search flows wrap the
/// detail extraction rather than subclassing it.
pub struct AmazonExtractor {
    page: Arc<dyn BrowserPage>,
    settings: AmazonSettings,
}

impl AmazonExtractor {
    pub fn new(page: Arc<dyn BrowserPage>, settings: AmazonSettings) -> Self {
        Self { page, settings }
    }

    /// Navigate with captcha and cookie-banner handling, per the lookup
    /// state machine: captcha gets one AI/solver attempt then one manual
    /// wait; cookie banners are dismissed at most twice.
    async fn navigate(&self, url: &str) -> Result<String> {
        self.page.goto(url).await?;
        let mut captcha_retries = 0u32;
        let mut cookie_attempts = 0u32;

        loop {
            let content = self.page.content().await?;

            if content.contains(CAPTCHA_MARKER) {
                if captcha_retries >= 2 {
                    return Err(anyhow!("captcha persisted after retries for {}", url));
                }
                captcha_retries += 1;
                info!("Captcha detected on {}", url);
                if self.page.solve_captcha().await.unwrap_or(false) {
                    debug!("Captcha solver cleared the page");
                } else {
                    info!(
                        "Waiting {}s for manual captcha solve",
                        self.settings.captcha_manual_wait_seconds
                    );
                    tokio::time::sleep(Duration::from_secs(
                        self.settings.captcha_manual_wait_seconds,
                    ))
                    .await;
                }
                self.page.goto(url).await?;
                continue;
            }

            if content.contains("sp-cc-accept")
                && cookie_attempts < self.settings.cookie_dismiss_max_attempts
            {
                cookie_attempts += 1;
                if self.page.click(COOKIE_BUTTON_CSS).await.unwrap_or(false) {
                    debug!("Dismissed cookie banner (attempt {})", cookie_attempts);
                    continue;
                }
            }

            return Ok(content);
        }
    }

    /// Full detail extraction for one ASIN.
    pub async fn extract_by_asin(&self, asin: &str) -> Result<AmazonProduct> {
        if !is_valid_asin(asin) {
            return Err(anyhow!("invalid ASIN format: {}", asin));
        }
        let url = format!("{}/dp/{}", self.settings.marketplace_url, asin);
        let content = self.navigate(&url).await?;

        // Give browser-extension overlays time to populate before reading.
        if self.settings.extension_data_wait_seconds > 0 {
            tokio::time::sleep(Duration::from_secs(
                self.settings.extension_data_wait_seconds,
            ))
            .await;
        }
        let content = self.page.content().await.unwrap_or(content);
        let landed_url = self.page.current_url().await.unwrap_or_else(|_| url.clone());

        let mut product = self.parse_product_page(asin, &content);

        if let Some(url_asin) = asin_from_url(&landed_url) {
            if url_asin != asin {
                warn!(
                    "ASIN drift: queried {}, page URL carries {}",
                    asin, url_asin
                );
                product.asin_queried = Some(asin.to_string());
                product.asin_from_details = Some(url_asin);
            }
        }

        product.keepa = Some(self.extract_keepa().await);
        merge_keepa_fallbacks(&mut product);

        info!(
            "Extracted ASIN {}: '{}' price={:?} rank={:?}",
            asin,
            crate::models::title_snippet(&product.title),
            product.current_price,
            product.sales_rank
        );
        Ok(product)
    }

    fn parse_product_page(&self, asin: &str, content: &str) -> AmazonProduct {
        let html = Html::parse_document(content);

        let title = select_first_text(&html, "#productTitle")
            .or_else(|| select_first_text(&html, "h1#title span"))
            .or_else(|| select_first_text(&html, "h1.product-title-word-break"))
            .unwrap_or_default();

        let mut product = AmazonProduct::new(asin, title);

        product.current_price = [
            ".a-price .a-offscreen",
            "#priceblock_ourprice",
            "#priceblock_dealprice",
            "#corePrice_feature_div .a-offscreen",
        ]
        .iter()
        .find_map(|css| select_first_text(&html, css))
        .and_then(|raw| parse_price(&raw))
        .filter(|p| *p > 0.0);
        if product.current_price.is_some() {
            product.current_price_source = Some("page".to_string());
        }

        product.rating = select_first_attr(&html, "#acrPopover", "title")
            .or_else(|| select_first_text(&html, "i.a-icon-star span.a-icon-alt"))
            .or_else(|| select_first_text(&html, "span[data-hook='rating-out-of-text']"))
            .and_then(|raw| {
                raw.split_whitespace()
                    .next()
                    .and_then(|n| n.parse::<f64>().ok())
            });

        product.review_count = select_first_text(&html, "#acrCustomerReviewText")
            .or_else(|| select_first_text(&html, "span[data-hook='total-review-count']"))
            .map(|raw| parse_number(&raw))
            .filter(|n| *n > 0);

        let availability = select_first_text(&html, "#availability").unwrap_or_default();
        product.in_stock = availability.to_lowercase().contains("in stock")
            || content.contains("add-to-cart-button");

        // "Fulfilled by Amazon" alone is an FBA third-party listing.
        let merchant = select_first_text(&html, "#merchant-info")
            .unwrap_or_default()
            .to_lowercase();
        product.sold_by_amazon = merchant.contains("sold by amazon");

        product.main_image = select_first_attr(&html, "#landingImage", "src")
            .or_else(|| select_first_attr(&html, "#imgTagWrapperId img", "src"));

        product.brand = select_first_text(&html, "#bylineInfo")
            .map(|raw| {
                raw.trim_start_matches("Visit the ")
                    .trim_end_matches(" Store")
                    .trim_start_matches("Brand: ")
                    .to_string()
            })
            .filter(|b| !b.is_empty());

        product.description = select_first_text(&html, "#productDescription")
            .or_else(|| select_first_text(&html, "#feature-bullets"));

        if let Ok(feature_sel) = CssSelector::parse("#feature-bullets li span.a-list-item") {
            product.features = html
                .select(&feature_sel)
                .map(|el| collapse_whitespace(&el.text().collect::<String>()))
                .filter(|t| !t.is_empty())
                .take(10)
                .collect();
        }

        self.parse_details_table(&html, &mut product);
        self.parse_sales_rank(&html, content, &mut product);
        product
    }

    /// Product-details rows from the tech-spec table or detail bullets:
    /// brand, weight, dimensions and any EAN/UPC printed on the page.
    fn parse_details_table(&self, html: &Html, product: &mut AmazonProduct) {
        let mut rows: Vec<(String, String)> = Vec::new();

        if let Ok(row_sel) = CssSelector::parse(
            "#productDetails_techSpec_section_1 tr, #productDetails_detailBullets_sections1 tr",
        ) {
            for row in html.select(&row_sel) {
                let key = first_child_text(&row, "th");
                let value = first_child_text(&row, "td");
                if let (Some(key), Some(value)) = (key, value) {
                    rows.push((key, value));
                }
            }
        }
        if let Ok(bullet_sel) = CssSelector::parse("#detailBullets_feature_div li") {
            for bullet in html.select(&bullet_sel) {
                let text = collapse_whitespace(&bullet.text().collect::<String>());
                if let Some((key, value)) = text.split_once(':') {
                    rows.push((key.trim().to_string(), value.trim().to_string()));
                }
            }
        }

        for (key, value) in rows {
            let key_lower = key.to_lowercase();
            if key_lower.contains("brand") && product.brand.is_none() {
                product.brand = Some(value.clone());
            } else if key_lower.contains("weight") && product.weight_text.is_none() {
                product.weight_text = Some(value.clone());
            } else if key_lower.contains("dimension") && product.dimensions_text.is_none() {
                product.dimensions_text = Some(value.clone());
            } else if key_lower.contains("ean") || key_lower.contains("gtin") {
                for candidate in value.split(|c: char| !c.is_ascii_digit()) {
                    if let Some(gtin) = normalize_gtin(candidate) {
                        product.eans_on_page.insert(gtin);
                    }
                }
            } else if key_lower.contains("upc") {
                for candidate in value.split(|c: char| !c.is_ascii_digit()) {
                    let digits: String =
                        candidate.chars().filter(|c| c.is_ascii_digit()).collect();
                    if digits.len() == 12 {
                        product.upcs_on_page.insert(digits);
                    }
                }
            }
        }
    }

    fn parse_sales_rank(&self, html: &Html, content: &str, product: &mut AmazonProduct) {
        let rank_text = select_first_text(html, "#SalesRank")
            .or_else(|| {
                content
                    .find("Best Sellers Rank")
                    .map(|idx| content[idx..(idx + 300).min(content.len())].to_string())
            })
            .unwrap_or_default();
        if let Some(caps) = RANK_RE.captures(&rank_text) {
            product.sales_rank = Some(parse_number(&caps[1])).filter(|r| *r > 0);
            if product.category.is_none() {
                let category = collapse_whitespace(caps[2].trim());
                // The capture tends to drag trailing markup along.
                let category = category
                    .split(['<', '('])
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if !category.is_empty() {
                    product.category = Some(category);
                }
            }
        }
        if product.category.is_none() {
            product.category =
                select_first_text(html, "#wayfinding-breadcrumbs_feature_div li:first-child a");
        }
    }

    /// Keepa overlay extraction: locate the iframe, wait for the product
    /// details grid with a primary and a fallback budget, parse rows. A
    /// grid that never appears is a status, not an error.
    async fn extract_keepa(&self) -> KeepaData {
        let budgets = [
            self.settings.keepa_grid_wait_seconds,
            self.settings.keepa_grid_fallback_wait_seconds,
        ];
        for (attempt, budget) in budgets.iter().enumerate() {
            let deadline = std::time::Instant::now() + Duration::from_secs(*budget);
            loop {
                match self.page.iframe_content(KEEPA_IFRAME_CSS).await {
                    Ok(Some(inner)) => {
                        let data = parse_keepa_grids(&inner);
                        if !data.product_details_tab_data.is_empty()
                            || !data.sales_rank_details_table.is_empty()
                        {
                            debug!(
                                "Keepa grid parsed on attempt {} ({} detail rows)",
                                attempt + 1,
                                data.product_details_tab_data.len()
                            );
                            return data;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!("Keepa iframe read failed: {}", e);
                    }
                }
                if std::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            debug!("Keepa grid attempt {} timed out after {}s", attempt + 1, budget);
        }
        KeepaData {
            status: Some("Product details tab timeout".to_string()),
            ..KeepaData::default()
        }
    }

    /// EAN search: sponsored filtering, disambiguation by title overlap,
    /// direct-product redirect detection.
    pub async fn search_by_ean(&self, ean: &str, supplier_title: &str) -> Result<SearchOutcome> {
        let url = format!("{}/s?k={}", self.settings.marketplace_url, ean);
        info!("Searching Amazon by EAN {} for '{}'", ean, supplier_title);
        let content = self.navigate(&url).await?;

        // Amazon sometimes redirects an exact EAN hit straight to the
        // detail page.
        if content.contains("id=\"dp-container\"") || content.contains("id=\"ppd\"") {
            let landed = self.page.current_url().await.unwrap_or_default();
            if let Some(asin) = asin_from_url(&landed) {
                info!("EAN {} redirected directly to product {}", ean, asin);
                return Ok(SearchOutcome {
                    direct_product_asin: Some(asin),
                    ..SearchOutcome::default()
                });
            }
        }

        let organic = collect_organic_results(&content);
        if organic.is_empty() {
            warn!("EAN {} returned no organic results", ean);
            return Ok(SearchOutcome {
                error: Some("no_organic_results".to_string()),
                ..SearchOutcome::default()
            });
        }

        if organic.len() == 1 {
            debug!("Single organic result for EAN {}: {}", ean, organic[0].asin);
            return Ok(SearchOutcome {
                results: organic,
                ..SearchOutcome::default()
            });
        }

        // Multiple organics: score by word overlap against the supplier
        // title, accept the best above threshold, else first with low
        // confidence.
        let mut scored: Vec<(SearchHit, f64)> = organic
            .iter()
            .map(|hit| (hit.clone(), overlap_score(supplier_title, &hit.title)))
            .collect();
        for (hit, score) in &scored {
            debug!("EAN candidate {}: overlap {:.2}", hit.asin, score);
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if scored[0].1 >= EAN_OVERLAP_THRESHOLD {
            let chosen = scored[0].0.clone();
            info!(
                "EAN {}: chose {} with {:.2} word overlap",
                ean, chosen.asin, scored[0].1
            );
            Ok(SearchOutcome {
                results: vec![chosen],
                ..SearchOutcome::default()
            })
        } else {
            let first = organic.into_iter().next().expect("non-empty organic list");
            warn!(
                "EAN {}: no result met the {:.2} overlap threshold; taking first organic {} with low confidence",
                ean, EAN_OVERLAP_THRESHOLD, first.asin
            );
            Ok(SearchOutcome {
                results: vec![first],
                low_confidence: true,
                ..SearchOutcome::default()
            })
        }
    }

    /// Title search: organic tiles scored by composite title similarity,
    /// best first.
    pub async fn search_by_title(&self, title: &str) -> Result<SearchOutcome> {
        let query = title.split_whitespace().collect::<Vec<_>>().join("+");
        let url = format!("{}/s?k={}", self.settings.marketplace_url, query);
        info!("Searching Amazon by title: '{}'", title);
        let content = self.navigate(&url).await?;

        let mut hits = collect_result_tiles(&content, MAX_TITLE_RESULTS, true);
        for hit in &mut hits {
            hit.similarity = Some(title_similarity(title, &hit.title));
        }
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if hits.is_empty() {
            return Ok(SearchOutcome {
                error: Some(format!("no results for title '{}'", title)),
                ..SearchOutcome::default()
            });
        }
        Ok(SearchOutcome {
            results: hits,
            ..SearchOutcome::default()
        })
    }
}

fn first_child_text(row: &ElementRef<'_>, css: &str) -> Option<String> {
    let selector = CssSelector::parse(css).ok()?;
    row.select(&selector)
        .next()
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

/// Tile-level sponsored detection: visible "Sponsored" badge, aria-label,
/// sponsored data attributes, known ad classes, or ad-indicator text.
fn tile_is_sponsored(tile: &ElementRef<'_>) -> bool {
    let classes = tile.value().attr("class").unwrap_or_default();
    if KNOWN_AD_CLASSES.iter().any(|ad| classes.contains(ad)) {
        return true;
    }
    if tile.value().attr("data-component-type") == Some("sp-sponsored-result")
        || tile.value().attr("data-ad-marker") == Some("true")
    {
        return true;
    }
    let inner = tile.html();
    if inner.contains("data-component-type=\"sp-sponsored-result\"")
        || inner.contains("aria-label=\"Sponsored\"")
        || inner.contains("data-ad-id")
    {
        return true;
    }
    let text = tile.text().collect::<String>();
    SPONSORED_TEXT_RE.is_match(&text)
}

fn tile_title(tile: &ElementRef<'_>) -> Option<String> {
    for css in ["h2 a span", "h2 span", "h2 a", ".a-text-normal", "[data-cy='title-recipe']"] {
        if let Ok(selector) = CssSelector::parse(css) {
            if let Some(el) = tile.select(&selector).next() {
                let text = collapse_whitespace(&el.text().collect::<String>());
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
    }
    None
}

/// Collect result tiles with valid ASINs. When `include_sponsored` is
/// false, sponsored tiles are skipped; at most `MAX_TILES_SCANNED` tiles
/// are inspected.
fn collect_result_tiles(content: &str, limit: usize, include_sponsored: bool) -> Vec<SearchHit> {
    let html = Html::parse_document(content);
    let Ok(tile_sel) = CssSelector::parse("div[data-asin]") else {
        return Vec::new();
    };

    let mut hits = Vec::new();
    for tile in html.select(&tile_sel).take(MAX_TILES_SCANNED) {
        let Some(asin) = tile.value().attr("data-asin") else {
            continue;
        };
        if asin.len() != 10 || !is_valid_asin(asin) {
            debug!("Skipping tile with invalid ASIN '{}'", asin);
            continue;
        }
        if !include_sponsored && tile_is_sponsored(&tile) {
            debug!("Skipping sponsored tile {}", asin);
            continue;
        }
        let Some(title) = tile_title(&tile) else {
            continue;
        };
        hits.push(SearchHit {
            asin: asin.to_string(),
            title,
            similarity: None,
        });
        if hits.len() >= limit {
            break;
        }
    }
    hits
}

fn collect_organic_results(content: &str) -> Vec<SearchHit> {
    collect_result_tiles(content, MAX_ORGANIC_RESULTS, false)
}

/// Parse both Keepa AG grids (product details and sales rank) out of the
/// iframe HTML, with typed coercion for known fee/rank/review keys.
pub fn parse_keepa_grids(inner_html: &str) -> KeepaData {
    let html = Html::parse_document(inner_html);
    let mut data = KeepaData::default();

    data.product_details_tab_data =
        parse_keepa_grid_rows(&html, "#grid-product-detail [role='row']");
    if data.product_details_tab_data.is_empty() {
        data.product_details_tab_data = parse_keepa_grid_rows(&html, "div[role='row']");
    }
    data.sales_rank_details_table =
        parse_keepa_grid_rows(&html, "#grid-sales-rank [role='row']");
    data
}

fn parse_keepa_grid_rows(
    html: &Html,
    row_css: &str,
) -> std::collections::BTreeMap<String, serde_json::Value> {
    let mut rows = std::collections::BTreeMap::new();
    let Ok(row_sel) = CssSelector::parse(row_css) else {
        return rows;
    };
    for row in html.select(&row_sel) {
        let key = keepa_cell_text(&row, "[role='gridcell'][col-id='productKey']")
            .or_else(|| keepa_cell_text(&row, "[role='gridcell']:first-child"));
        let value = keepa_cell_text(&row, "[role='gridcell'][col-id='productValue']")
            .or_else(|| keepa_cell_text(&row, "[role='gridcell']:nth-child(2)"));
        let (Some(key), Some(value)) = (key, value) else {
            continue;
        };
        if key.is_empty() || value.is_empty() {
            continue;
        }
        rows.insert(key.clone(), coerce_keepa_value(&key, &value));
    }
    rows
}

fn keepa_cell_text(row: &ElementRef<'_>, css: &str) -> Option<String> {
    let selector = CssSelector::parse(css).ok()?;
    row.select(&selector)
        .next()
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
}

const KEEPA_COUNT_KEYS: [&str; 9] = [
    "Review Count",
    "Bought in past month",
    "Total Offer Count",
    "Number of Items",
    "Package - Quantity",
    "Package - Weight (g)",
    "FBA Seller Count",
    "FBM Seller Count",
    "Seller Count",
];

fn coerce_keepa_value(key: &str, value: &str) -> serde_json::Value {
    if key.contains("Reviews - Rating") {
        if let Some(rating) = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
        {
            return json!(rating);
        }
    }
    if KEEPA_COUNT_KEYS.iter().any(|k| key.contains(k)) {
        let count = parse_number(value);
        if count > 0 {
            return json!(count);
        }
    }
    if key.contains("FBA Pick&Pack Fee")
        || key.contains("Referral Fee based on current Buy Box price")
        || key.contains("Current")
    {
        if let Some(price) = parse_price(value) {
            return json!(price);
        }
    }
    json!(value)
}

/// Fill missing price and sales rank from the Keepa grids, and merge any
/// barcodes Keepa lists into the on-page sets.
pub fn merge_keepa_fallbacks(product: &mut AmazonProduct) {
    let Some(keepa) = product.keepa.clone() else {
        return;
    };

    if product.current_price.is_none() {
        for key in ["Buy Box - Current", "Amazon - Current", "New - Current"] {
            if let Some(price) = keepa.details_number(key).filter(|p| *p > 0.0) {
                product.current_price = Some(price);
                product.current_price_source =
                    Some("Keepa_Product_Details_Fallback".to_string());
                info!("Price fallback from Keepa '{}': £{:.2}", key, price);
                break;
            }
        }
    }

    if product.sales_rank.is_none() {
        let rank = keepa
            .sales_rank_details_table
            .iter()
            .find(|(k, _)| k.contains("Current"))
            .and_then(|(_, v)| v.as_f64())
            .or_else(|| keepa.details_number("Sales Rank - Current"))
            .map(|r| r as i64)
            .filter(|r| *r > 0);
        if let Some(rank) = rank {
            product.sales_rank = Some(rank);
            info!("Sales rank fallback from Keepa: {}", rank);
        }
    }

    for (key, value) in &keepa.product_details_tab_data {
        let key_lower = key.to_lowercase();
        if key_lower.contains("ean") {
            if let Some(raw) = value.as_str() {
                for candidate in raw.split(|c: char| !c.is_ascii_digit()) {
                    if let Some(gtin) = normalize_gtin(candidate) {
                        product.eans_on_page.insert(gtin);
                    }
                }
            }
        } else if key_lower.contains("upc") {
            if let Some(raw) = value.as_str() {
                for candidate in raw.split(|c: char| !c.is_ascii_digit()) {
                    let digits: String =
                        candidate.chars().filter(|c| c.is_ascii_digit()).collect();
                    if digits.len() == 12 {
                        product.upcs_on_page.insert(digits);
                    }
                }
            }
        }
    }
}

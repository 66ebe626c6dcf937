use anyhow::{anyhow, Result};
use moka::future::Cache;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector as CssSelector};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::ai::{truncate_for_prompt, AiClient, MAX_AI_HTML_CONTEXT};
use crate::config::SupplierSettings;
use crate::models::normalize_gtin;
use crate::selectors::{extract_first, DomainSelectors, Selector, SelectorConfig};

/// A discovered supplier category.
#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub name: String,
    pub url: String,
}

/// Detail-page fields appended to a product after the category walk.
#[derive(Debug, Clone, Default)]
pub struct DetailFields {
    pub brand: Option<String>,
    pub description: Option<String>,
    pub ean: Option<String>,
}

static PRICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,3}(?:[.,]\d{3})*(?:[.,]\d{1,2})?|\d+(?:[.,]\d{1,2})?)")
        .expect("invalid price regex")
});

static PRICE_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[£$€]|(?:[Ss]ale)|(?:[Ff]rom)|(?:[Nn]ow:?))\s*").expect("invalid prefix regex")
});

static SITEMAP_LOC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<loc>\s*([^<\s]+)\s*</loc>").expect("invalid loc regex"));

static TRAILING_PAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(\d+)/?$").expect("invalid trailing page regex"));

static FOUR_DIGIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4}").expect("invalid year regex"));

const COMMON_PAGE_PARAMS: [&str; 6] = ["page", "p", "pg", "page_num", "pageNumber", "page_id"];
const COMMON_PAGE_PATH_SEGMENTS: [&str; 4] = ["page", "p", "pagina", "pg"];
const MIN_SANE_BODY_BYTES: usize = 1000;

/// Rate-limited, selector-driven supplier storefront scraper. One instance
/// owns its HTTP session; the browser page used for Amazon never passes
/// through here.
pub struct SupplierScraper {
    client: Client,
    settings: SupplierSettings,
    selector_config: SelectorConfig,
    response_cache: Cache<String, Arc<String>>,
    domain_last_request: Arc<RwLock<HashMap<String, Instant>>>,
    ai: Option<Arc<dyn AiClient>>,
}

impl SupplierScraper {
    pub fn new(
        settings: SupplierSettings,
        selector_config: SelectorConfig,
        timeout_seconds: u64,
        ai: Option<Arc<dyn AiClient>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds.max(1)))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .redirect(reqwest::redirect::Policy::limited(5))
            .gzip(true)
            .brotli(true)
            .build()?;

        let response_cache = Cache::builder()
            .time_to_live(Duration::from_secs(3600))
            .max_capacity(10_000)
            .build();

        Ok(Self {
            client,
            settings,
            selector_config,
            response_cache,
            domain_last_request: Arc::new(RwLock::new(HashMap::new())),
            ai,
        })
    }

    fn selectors_for(&self, url: &str) -> DomainSelectors {
        let domain = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        self.selector_config.for_domain(&domain)
    }

    /// Hold until at least `rate_limit_delay` has passed since the last
    /// request start against this domain, then stamp the new request start.
    async fn rate_limit(&self, url: &str) {
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string))
        else {
            return;
        };
        let delay = Duration::from_secs_f64(self.settings.rate_limit_delay_seconds.max(0.0));
        loop {
            let wait = {
                let mut last = self.domain_last_request.write().await;
                match last.get(&host) {
                    Some(prev) if prev.elapsed() < delay => delay - prev.elapsed(),
                    _ => {
                        last.insert(host.clone(), Instant::now());
                        return;
                    }
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Fetch a page with rate limiting, retries with exponential backoff,
    /// 429 `Retry-After` handling and a response sanity check. `None` after
    /// all attempts fail.
    pub async fn get_page_content(&self, url: &str) -> Result<Option<Arc<String>>> {
        if let Some(cached) = self.response_cache.get(url).await {
            debug!("Response cache hit for {}", url);
            return Ok(Some(cached));
        }

        let retries = self.settings.max_retries.max(1);
        for attempt in 0..retries {
            self.rate_limit(url).await;
            debug!("Fetching {} (attempt {}/{})", url, attempt + 1, retries);

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = response
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(5);
                        warn!("Rate limited (429) by {}. Waiting {}s.", url, retry_after);
                        tokio::time::sleep(Duration::from_secs(retry_after)).await;
                        continue;
                    }
                    if status == reqwest::StatusCode::NOT_FOUND {
                        warn!("Page not found: {}", url);
                        return Ok(None);
                    }
                    if !status.is_success() {
                        warn!("HTTP {} for {} (attempt {})", status, url, attempt + 1);
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        if body_is_sane(&body) {
                            debug!("Fetched {} ({} bytes)", url, body.len());
                            let body = Arc::new(body);
                            self.response_cache
                                .insert(url.to_string(), body.clone())
                                .await;
                            return Ok(Some(body));
                        }
                        warn!(
                            "Suspicious response from {} ({} bytes); retrying",
                            url,
                            body.len()
                        );
                    }
                }
                Err(e) => {
                    warn!("Request error for {} (attempt {}): {}", url, attempt + 1, e);
                }
            }

            if attempt + 1 < retries {
                let base = 2u64.pow(attempt) + 1;
                let jitter = rand::thread_rng().gen_range(0..250);
                tokio::time::sleep(Duration::from_secs(base) + Duration::from_millis(jitter)).await;
            }
        }

        warn!("Failed to fetch {} after {} attempts", url, retries);
        Ok(None)
    }

    /// Discover top-level categories from the supplier's landing page, with
    /// a sitemap fallback when the configured selectors yield nothing.
    pub async fn discover_categories(&self, supplier_base_url: &str) -> Result<Vec<Category>> {
        let Some(html) = self.get_page_content(supplier_base_url).await? else {
            return Err(anyhow!("could not fetch supplier homepage {}", supplier_base_url));
        };
        let selectors = self.selectors_for(supplier_base_url);
        let document = Html::parse_document(&html);

        let mut seen = HashSet::new();
        let mut categories = Vec::new();
        for selector in &selectors.category_links {
            let css = match selector {
                Selector::Css(css) | Selector::Attr(css, _) => css.clone(),
                Selector::Xpath(xp) => match crate::selectors::xpath_to_css(xp) {
                    Some(css) => css,
                    None => continue,
                },
            };
            let Ok(parsed) = CssSelector::parse(&css) else {
                continue;
            };
            for element in document.select(&parsed) {
                let Some(href) = element.value().attr("href") else {
                    continue;
                };
                let Some(absolute) = ensure_absolute_url(href, supplier_base_url) else {
                    continue;
                };
                if !same_host(&absolute, supplier_base_url) {
                    continue;
                }
                let name = element.text().collect::<String>().trim().to_string();
                if name.is_empty() || !seen.insert(absolute.clone()) {
                    continue;
                }
                categories.push(Category {
                    name,
                    url: absolute,
                });
            }
            if !categories.is_empty() {
                break;
            }
        }

        if categories.is_empty() {
            info!("No categories via selectors; falling back to sitemap discovery");
            categories = self.discover_categories_from_sitemap(supplier_base_url).await?;
        }

        info!(
            "Discovered {} categories for {}",
            categories.len(),
            supplier_base_url
        );
        Ok(categories)
    }

    async fn discover_categories_from_sitemap(&self, base_url: &str) -> Result<Vec<Category>> {
        let sitemap_url = format!("{}/sitemap.xml", base_url.trim_end_matches('/'));
        let Some(xml) = self.get_page_content(&sitemap_url).await? else {
            return Ok(Vec::new());
        };

        let mut seen = HashSet::new();
        let mut categories = Vec::new();
        for caps in SITEMAP_LOC_RE.captures_iter(&xml) {
            let loc = caps[1].trim().to_string();
            if !same_host(&loc, base_url) || !looks_like_category_url(&loc) {
                continue;
            }
            if !seen.insert(loc.clone()) {
                continue;
            }
            let name = category_name_from_url(&loc);
            categories.push(Category { name, url: loc });
            if categories.len() >= 50 {
                break;
            }
        }
        Ok(categories)
    }

    /// Subcategory pages under one category, bounded by configured depth.
    pub async fn discover_subpages(&self, category_url: &str) -> Result<Vec<String>> {
        let mut frontier = vec![category_url.to_string()];
        let mut found = Vec::new();
        let mut seen: HashSet<String> = frontier.iter().cloned().collect();

        for _depth in 0..self.settings.max_subpage_depth {
            let mut next_frontier = Vec::new();
            for url in frontier.drain(..) {
                let Some(html) = self.get_page_content(&url).await? else {
                    continue;
                };
                let selectors = self.selectors_for(&url);
                let document = Html::parse_document(&html);
                for selector in &selectors.category_links {
                    for href in selector_hrefs(selector, &document) {
                        let Some(absolute) = ensure_absolute_url(&href, &url) else {
                            continue;
                        };
                        if !same_host(&absolute, category_url)
                            || !absolute.starts_with(category_url.trim_end_matches('/'))
                        {
                            continue;
                        }
                        if seen.insert(absolute.clone()) {
                            found.push(absolute.clone());
                            next_frontier.push(absolute);
                        }
                    }
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }
        Ok(found)
    }

    /// Outer HTML of every product tile on a listing page. Container
    /// selectors are tried in order; the first that matches anything wins.
    pub fn extract_product_elements(&self, html: &str, url: &str) -> Vec<String> {
        let selectors = self.selectors_for(url);
        let document = Html::parse_document(html);

        for selector in &selectors.product_container {
            let css = match selector {
                Selector::Css(css) | Selector::Attr(css, _) => css.clone(),
                Selector::Xpath(xp) => match crate::selectors::xpath_to_css(xp) {
                    Some(css) => css,
                    None => continue,
                },
            };
            let Ok(parsed) = CssSelector::parse(&css) else {
                continue;
            };
            let elements: Vec<String> = document.select(&parsed).map(|el| el.html()).collect();
            if !elements.is_empty() {
                debug!(
                    "Found {} product elements on {} via '{}'",
                    elements.len(),
                    url,
                    css
                );
                return elements;
            }
        }
        warn!("No product elements found on {}", url);
        Vec::new()
    }

    pub async fn extract_title(&self, element_html: &str, ctx_url: &str) -> Option<String> {
        let selectors = self.selectors_for(ctx_url);
        let fragment = Html::parse_fragment(element_html);
        if let Some(title) = extract_first(&selectors.title, &fragment) {
            return Some(collapse_whitespace(&title));
        }
        self.ai_extract_field(element_html, "the product title", ctx_url)
            .await
    }

    pub async fn extract_price(&self, element_html: &str, ctx_url: &str) -> Option<f64> {
        let selectors = self.selectors_for(ctx_url);
        let fragment = Html::parse_fragment(element_html);
        if let Some(raw) = extract_first(&selectors.price, &fragment) {
            if let Some(price) = parse_price(&raw) {
                return Some(price);
            }
        }
        let raw = self
            .ai_extract_field(element_html, "the product price as a number", ctx_url)
            .await?;
        parse_price(&raw)
    }

    pub async fn extract_url(
        &self,
        element_html: &str,
        ctx_url: &str,
        base_url: &str,
    ) -> Option<String> {
        let selectors = self.selectors_for(ctx_url);
        let fragment = Html::parse_fragment(element_html);
        if let Some(href) = extract_first(&selectors.url, &fragment) {
            return ensure_absolute_url(&href, base_url);
        }
        let raw = self
            .ai_extract_field(element_html, "the product page URL", ctx_url)
            .await?;
        ensure_absolute_url(&raw, base_url)
    }

    pub async fn extract_image(
        &self,
        element_html: &str,
        ctx_url: &str,
        base_url: &str,
    ) -> Option<String> {
        let selectors = self.selectors_for(ctx_url);
        let fragment = Html::parse_fragment(element_html);
        let src = extract_first(&selectors.image, &fragment)?;
        ensure_absolute_url(&src, base_url)
    }

    /// Barcode identifier: digits-only after stripping, accepted lengths
    /// {8, 12, 13, 14}. Selectors are tried in order; the first value that
    /// survives normalization wins.
    pub async fn extract_identifier(&self, element_html: &str, ctx_url: &str) -> Option<String> {
        let selectors = self.selectors_for(ctx_url);
        let fragment = Html::parse_fragment(element_html);
        for selector in &selectors.identifier {
            if let Some(raw) = selector.extract(&fragment) {
                if let Some(gtin) = normalize_gtin(&raw) {
                    return Some(gtin);
                }
                debug!("Identifier candidate '{}' rejected by length rule", raw);
            }
        }
        let raw = self
            .ai_extract_field(element_html, "the product EAN or UPC barcode digits", ctx_url)
            .await?;
        normalize_gtin(&raw)
    }

    /// Brand/description/EAN refinements from a product detail page.
    pub fn extract_detail_fields(&self, html: &str, product_url: &str) -> DetailFields {
        let selectors = self.selectors_for(product_url);
        let document = Html::parse_document(html);

        let brand = [
            Selector::Css("[itemprop=\"brand\"]".to_string()),
            Selector::Attr("meta[property=\"product:brand\"]".to_string(), "content".to_string()),
            Selector::Css(".product-brand".to_string()),
        ]
        .iter()
        .find_map(|s| s.extract(&document))
        .map(|b| collapse_whitespace(&b));

        let description = [
            Selector::Attr("meta[name=\"description\"]".to_string(), "content".to_string()),
            Selector::Css(".product-description".to_string()),
            Selector::Css("#description".to_string()),
        ]
        .iter()
        .find_map(|s| s.extract(&document))
        .map(|d| collapse_whitespace(&d));

        let ean = selectors
            .identifier
            .iter()
            .find_map(|s| s.extract(&document))
            .and_then(|raw| normalize_gtin(&raw));

        DetailFields {
            brand,
            description,
            ean,
        }
    }

    /// Next listing page, trying in order: configured `{page_num}` pattern,
    /// next-button selectors, URL inference.
    pub fn get_next_page_url(
        &self,
        current_url: &str,
        page_html: &str,
        current_page_num: usize,
    ) -> Option<String> {
        let selectors = self.selectors_for(current_url);
        let next_page_num = current_page_num + 1;

        if let Some(pattern) = &selectors.pagination.pattern {
            if pattern.contains("{page_num}") {
                if let Some(next) = apply_pagination_pattern(current_url, pattern, next_page_num) {
                    return Some(next);
                }
            }
        }

        let document = Html::parse_document(page_html);
        for button_css in &selectors.pagination.next_button_selectors {
            let Ok(parsed) = CssSelector::parse(button_css) else {
                continue;
            };
            if let Some(href) = document
                .select(&parsed)
                .next()
                .and_then(|el| el.value().attr("href"))
            {
                return ensure_absolute_url(href, current_url);
            }
        }

        infer_next_page_url(current_url, current_page_num)
    }

    async fn ai_extract_field(
        &self,
        element_html: &str,
        field_description: &str,
        ctx_url: &str,
    ) -> Option<String> {
        let ai = self.ai.as_ref()?;
        let context = truncate_for_prompt(element_html, MAX_AI_HTML_CONTEXT);
        let prompt = format!(
            "From the following HTML fragment of a product listing on {}, extract {}. \
             Respond with only the value, or NONE if absent.\n\nHTML:\n{}",
            ctx_url, field_description, context
        );
        match ai.complete(&prompt).await {
            Ok(answer) => {
                let answer = answer.trim().to_string();
                if answer.is_empty() || answer.eq_ignore_ascii_case("none") {
                    None
                } else {
                    debug!("AI fallback produced {} for {}", field_description, ctx_url);
                    Some(answer)
                }
            }
            Err(e) => {
                warn!("AI field extraction failed for {}: {}", ctx_url, e);
                None
            }
        }
    }
}

fn selector_hrefs(selector: &Selector, document: &Html) -> Vec<String> {
    let css = match selector {
        Selector::Css(css) | Selector::Attr(css, _) => css.clone(),
        Selector::Xpath(xp) => match crate::selectors::xpath_to_css(xp) {
            Some(css) => css,
            None => return Vec::new(),
        },
    };
    let Ok(parsed) = CssSelector::parse(&css) else {
        return Vec::new();
    };
    document
        .select(&parsed)
        .filter_map(|el| el.value().attr("href").map(str::to_string))
        .collect()
}

/// Response sanity: a body under 1000 bytes, or one without `<html`/`<body`
/// markers, is treated as a failed fetch.
fn body_is_sane(body: &str) -> bool {
    if body.len() < MIN_SANE_BODY_BYTES {
        return false;
    }
    let lower = body.to_lowercase();
    lower.contains("<html") || lower.contains("<body")
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse price text into a number, handling `1.234,56` / `1,234.56` and
/// currency / promo prefixes.
pub fn parse_price(price_text: &str) -> Option<f64> {
    let cleaned = PRICE_PREFIX_RE.replace_all(price_text, "");
    let caps = PRICE_RE.captures(cleaned.trim())?;
    let mut price_str = caps[1].to_string();

    let has_comma = price_str.contains(',');
    let has_dot = price_str.contains('.');
    if has_comma && has_dot {
        if price_str.rfind(',') > price_str.rfind('.') {
            price_str = price_str.replace('.', "").replace(',', ".");
        } else {
            price_str = price_str.replace(',', "");
        }
    } else if has_comma {
        let decimals = price_str.rsplit(',').next().map(str::len).unwrap_or(0);
        if decimals <= 2 && price_str.matches(',').count() == 1 {
            price_str = price_str.replace(',', ".");
        } else {
            price_str = price_str.replace(',', "");
        }
    }

    price_str.parse::<f64>().ok().filter(|p| *p >= 0.0)
}

pub fn ensure_absolute_url(href: &str, base_url: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href.starts_with('#') {
        return None;
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    let base = Url::parse(base_url).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

fn same_host(url: &str, other: &str) -> bool {
    let host = |u: &str| {
        Url::parse(u)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
    };
    match (host(url), host(other)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn looks_like_category_url(url: &str) -> bool {
    let Some(parsed) = Url::parse(url).ok() else {
        return false;
    };
    let path = parsed.path().trim_matches('/').to_lowercase();
    if path.is_empty() || path.contains("product") {
        return false;
    }
    let segments = path.split('/').count();
    path.contains("categor")
        || path.contains("collections")
        || path.contains("department")
        || segments == 1
}

fn category_name_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|s| s.filter(|p| !p.is_empty()).last().map(str::to_string))
        })
        .map(|seg| seg.replace(['-', '_'], " "))
        .unwrap_or_else(|| url.to_string())
}

/// Apply an explicit `{page_num}` pagination pattern to the current URL.
fn apply_pagination_pattern(current_url: &str, pattern: &str, next_page_num: usize) -> Option<String> {
    let substituted = pattern.replace("{page_num}", &next_page_num.to_string());

    if pattern.starts_with("http://") || pattern.starts_with("https://") {
        return Some(substituted);
    }

    let parsed = Url::parse(current_url).ok()?;
    if pattern.starts_with('/') {
        return Some(format!(
            "{}://{}{}",
            parsed.scheme(),
            parsed.host_str()?,
            substituted
        ));
    }

    if pattern.contains('=') {
        // Query parameter pattern such as `page={page_num}`.
        let param_name = substituted.split('=').next()?.trim_start_matches('?');
        let mut query: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if let Some(entry) = query.iter_mut().find(|(k, _)| k == param_name) {
            entry.1 = next_page_num.to_string();
        } else {
            query.push((param_name.to_string(), next_page_num.to_string()));
        }
        let mut rebuilt = parsed.clone();
        rebuilt
            .query_pairs_mut()
            .clear()
            .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        return Some(rebuilt.to_string());
    }

    ensure_absolute_url(&substituted, current_url)
}

/// Infer a next-page URL from common storefront shapes: a known query
/// parameter, a `/page/N/` path segment, or a trailing numeric segment
/// (never a four-digit year).
pub fn infer_next_page_url(current_url: &str, current_page_num: usize) -> Option<String> {
    let parsed = Url::parse(current_url).ok()?;
    let next = current_page_num + 1;

    let query: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for param in COMMON_PAGE_PARAMS {
        if let Some((_, value)) = query.iter().find(|(k, _)| k == param) {
            if value.chars().all(|c| c.is_ascii_digit()) {
                let rebuilt_pairs: Vec<(String, String)> = query
                    .iter()
                    .map(|(k, v)| {
                        if k == param {
                            (k.clone(), next.to_string())
                        } else {
                            (k.clone(), v.clone())
                        }
                    })
                    .collect();
                let mut rebuilt = parsed.clone();
                rebuilt.query_pairs_mut().clear().extend_pairs(&rebuilt_pairs);
                return Some(rebuilt.to_string());
            }
        }
    }

    let query_part = parsed
        .query()
        .map(|q| format!("?{}", q))
        .unwrap_or_default();
    let path = parsed.path().trim_end_matches('/').to_string();
    let segments: Vec<String> = path.split('/').map(str::to_string).collect();
    for indicator in COMMON_PAGE_PATH_SEGMENTS {
        if let Some(idx) = segments.iter().position(|s| s == indicator) {
            if idx + 1 < segments.len()
                && segments[idx + 1].chars().all(|c| c.is_ascii_digit())
            {
                let mut rebuilt = segments.clone();
                rebuilt[idx + 1] = next.to_string();
                return Some(format!(
                    "{}://{}{}/{}",
                    parsed.scheme(),
                    parsed.host_str()?,
                    rebuilt.join("/"),
                    query_part
                ));
            }
        }
    }

    if let Some(caps) = TRAILING_PAGE_RE.captures(&path) {
        let page_segment = caps[1].to_string();
        if !FOUR_DIGIT_RE.is_match(&page_segment) {
            let stem = path
                .strip_suffix(&format!("/{}", page_segment))
                .unwrap_or(&path);
            return Some(format!(
                "{}://{}{}/{}/{}",
                parsed.scheme(),
                parsed.host_str()?,
                stem,
                next,
                query_part
            ));
        }
    }

    // Last resort: append a ?page= parameter if none exists yet.
    if parsed.query().is_none() {
        return Some(format!("{}?page={}", current_url.trim_end_matches('/'), next));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_parsing_handles_currency_and_separators() {
        assert_eq!(parse_price("£4.99"), Some(4.99));
        assert_eq!(parse_price("Sale £12.50"), Some(12.5));
        assert_eq!(parse_price("Now: 3,99"), Some(3.99));
        assert_eq!(parse_price("1.234,56"), Some(1234.56));
        assert_eq!(parse_price("1,234.56"), Some(1234.56));
        assert_eq!(parse_price("From €7"), Some(7.0));
        assert_eq!(parse_price("no price here"), None);
    }

    #[test]
    fn body_sanity_rules() {
        assert!(!body_is_sane("short"));
        let long_junk = "x".repeat(2000);
        assert!(!body_is_sane(&long_junk));
        let page = format!("<html><body>{}</body></html>", "x".repeat(2000));
        assert!(body_is_sane(&page));
    }

    #[test]
    fn absolute_url_resolution() {
        assert_eq!(
            ensure_absolute_url("/widget", "https://shop.example/cat"),
            Some("https://shop.example/widget".to_string())
        );
        assert_eq!(
            ensure_absolute_url("https://other.example/x", "https://shop.example"),
            Some("https://other.example/x".to_string())
        );
        assert_eq!(ensure_absolute_url("#anchor", "https://shop.example"), None);
        assert_eq!(
            ensure_absolute_url("javascript:void(0)", "https://shop.example"),
            None
        );
    }

    #[test]
    fn pagination_inference_query_param() {
        assert_eq!(
            infer_next_page_url("https://shop.example/cat?page=2", 2),
            Some("https://shop.example/cat?page=3".to_string())
        );
    }

    #[test]
    fn pagination_inference_path_segment() {
        assert_eq!(
            infer_next_page_url("https://shop.example/cat/page/2/", 2),
            Some("https://shop.example/cat/page/3/".to_string())
        );
    }

    #[test]
    fn pagination_inference_trailing_number() {
        assert_eq!(
            infer_next_page_url("https://shop.example/cat/2", 2),
            Some("https://shop.example/cat/3/".to_string())
        );
    }

    #[test]
    fn pagination_never_advances_into_year() {
        // /sale/2024 must not be treated as page 2024.
        let inferred = infer_next_page_url("https://shop.example/sale/2024", 1);
        assert_ne!(
            inferred,
            Some("https://shop.example/sale/2025/".to_string())
        );
    }

    #[test]
    fn pagination_pattern_application() {
        assert_eq!(
            apply_pagination_pattern("https://shop.example/cat", "page={page_num}", 3),
            Some("https://shop.example/cat?page=3".to_string())
        );
        assert_eq!(
            apply_pagination_pattern(
                "https://shop.example/cat?page=2&sort=price",
                "page={page_num}",
                3
            )
            .as_deref(),
            Some("https://shop.example/cat?page=3&sort=price")
        );
        assert_eq!(
            apply_pagination_pattern("https://shop.example/cat", "/cat/page/{page_num}/", 4),
            Some("https://shop.example/cat/page/4/".to_string())
        );
    }

    #[test]
    fn category_url_heuristics() {
        assert!(looks_like_category_url("https://shop.example/category/toys"));
        assert!(looks_like_category_url("https://shop.example/pound-lines"));
        assert!(!looks_like_category_url(
            "https://shop.example/product/acme-widget"
        ));
    }

    #[tokio::test]
    async fn product_element_extraction_uses_first_matching_container() {
        let scraper = SupplierScraper::new(
            SupplierSettings::default(),
            SelectorConfig::default(),
            5,
            None,
        )
        .unwrap();
        let html = r#"
            <html><body>
              <div class="product-item"><a class="product-item-link" href="/a" title="A">A</a></div>
              <div class="product-item"><a class="product-item-link" href="/b" title="B">B</a></div>
            </body></html>
        "#;
        let elements = scraper.extract_product_elements(html, "https://shop.example/cat");
        assert_eq!(elements.len(), 2);
    }

    #[tokio::test]
    async fn field_extraction_from_element() {
        let scraper = SupplierScraper::new(
            SupplierSettings::default(),
            SelectorConfig::default(),
            5,
            None,
        )
        .unwrap();
        let element = r#"
            <div class="product-item">
              <span class="product-title">Acme Widget 4-Pack</span>
              <span class="price">£4.99</span>
              <a class="product-item-link" href="/widget">view</a>
              <span data-ean="5000000000012" class="sku"></span>
            </div>
        "#;
        let ctx = "https://shop.example/cat";
        assert_eq!(
            scraper.extract_title(element, ctx).await,
            Some("Acme Widget 4-Pack".to_string())
        );
        assert_eq!(scraper.extract_price(element, ctx).await, Some(4.99));
        assert_eq!(
            scraper.extract_url(element, ctx, "https://shop.example").await,
            Some("https://shop.example/widget".to_string())
        );
        assert_eq!(
            scraper.extract_identifier(element, ctx).await,
            Some("5000000000012".to_string())
        );
    }

    #[tokio::test]
    async fn identifier_rejects_bad_lengths() {
        let scraper = SupplierScraper::new(
            SupplierSettings::default(),
            SelectorConfig::default(),
            5,
            None,
        )
        .unwrap();
        let element = r#"<div><span data-ean="12345" class="x"></span></div>"#;
        assert_eq!(
            scraper
                .extract_identifier(element, "https://shop.example/cat")
                .await,
            None
        );
    }
}

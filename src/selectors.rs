use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector as CssSelector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// One way to locate a field inside an element. Selector lists are tried in
/// order; the first variant that yields a non-empty value wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// CSS selector; the element's trimmed text content is the value.
    Css(String),
    /// XPath selector. Only the `//tag[@attr='value']` family is supported
    /// (translated to CSS); anything else is skipped with a warning.
    Xpath(String),
    /// CSS selector plus the attribute to read off the matched element.
    Attr(String, String),
}

// //tag, //tag[@attr], //tag[@attr='value']
static SIMPLE_XPATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^//([a-zA-Z][a-zA-Z0-9]*)(?:\[@([a-zA-Z-]+)(?:=['"]([^'"]*)['"])?\])?$"#)
        .expect("invalid xpath pattern")
});

/// Translate the supported XPath subset to CSS. `None` for anything beyond
/// it.
pub fn xpath_to_css(xpath: &str) -> Option<String> {
    let caps = SIMPLE_XPATH_RE.captures(xpath.trim())?;
    let tag = caps.get(1)?.as_str();
    match (caps.get(2), caps.get(3)) {
        (Some(attr), Some(value)) => Some(format!("{}[{}=\"{}\"]", tag, attr.as_str(), value.as_str())),
        (Some(attr), None) => Some(format!("{}[{}]", tag, attr.as_str())),
        _ => Some(tag.to_string()),
    }
}

impl Selector {
    /// Resolve to a parseable CSS selector string, or `None` when the
    /// variant cannot be expressed.
    fn as_css(&self) -> Option<(String, Option<&str>)> {
        match self {
            Selector::Css(css) => Some((css.clone(), None)),
            Selector::Attr(css, attr) => Some((css.clone(), Some(attr.as_str()))),
            Selector::Xpath(xpath) => match xpath_to_css(xpath) {
                Some(css) => Some((css, None)),
                None => {
                    warn!("Unsupported XPath selector skipped: {}", xpath);
                    None
                }
            },
        }
    }

    /// Extract this selector's value from a parsed fragment.
    pub fn extract(&self, fragment: &Html) -> Option<String> {
        let (css, attr) = self.as_css()?;
        let parsed = match CssSelector::parse(&css) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Unparseable CSS selector '{}': {:?}", css, e);
                return None;
            }
        };
        let element = fragment.select(&parsed).next()?;
        extract_value(element, attr)
    }

    /// Extract from every match rather than the first.
    pub fn extract_all(&self, fragment: &Html) -> Vec<String> {
        let Some((css, attr)) = self.as_css() else {
            return Vec::new();
        };
        let Ok(parsed) = CssSelector::parse(&css) else {
            return Vec::new();
        };
        fragment
            .select(&parsed)
            .filter_map(|el| extract_value(el, attr))
            .collect()
    }
}

fn extract_value(element: ElementRef<'_>, attr: Option<&str>) -> Option<String> {
    let value = match attr {
        Some(attr) => element.value().attr(attr)?.trim().to_string(),
        None => element.text().collect::<String>().trim().to_string(),
    };
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Try a selector list in order; first non-empty value wins.
pub fn extract_first(selectors: &[Selector], fragment: &Html) -> Option<String> {
    selectors.iter().find_map(|s| s.extract(fragment))
}

/// Pagination strategy inputs for one supplier domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaginationConfig {
    /// Explicit URL pattern with a `{page_num}` placeholder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Next-button selectors, tried in order.
    #[serde(default)]
    pub next_button_selectors: Vec<String>,
}

/// Per-field selector lists for one supplier domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSelectors {
    #[serde(default = "default_product_container")]
    pub product_container: Vec<Selector>,

    #[serde(default = "default_title")]
    pub title: Vec<Selector>,

    #[serde(default = "default_price")]
    pub price: Vec<Selector>,

    #[serde(default = "default_url")]
    pub url: Vec<Selector>,

    #[serde(default = "default_image")]
    pub image: Vec<Selector>,

    #[serde(default = "default_identifier")]
    pub identifier: Vec<Selector>,

    #[serde(default = "default_category_links")]
    pub category_links: Vec<Selector>,

    #[serde(default)]
    pub pagination: PaginationConfig,
}

impl Default for DomainSelectors {
    fn default() -> Self {
        Self {
            product_container: default_product_container(),
            title: default_title(),
            price: default_price(),
            url: default_url(),
            image: default_image(),
            identifier: default_identifier(),
            category_links: default_category_links(),
            pagination: PaginationConfig {
                pattern: None,
                next_button_selectors: default_next_buttons(),
            },
        }
    }
}

/// Selector configuration keyed by supplier domain, with a generic
/// storefront fallback for domains without an entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default)]
    pub domains: HashMap<String, DomainSelectors>,
}

impl SelectorConfig {
    pub fn for_domain(&self, domain: &str) -> DomainSelectors {
        let key = domain.trim_start_matches("www.");
        self.domains
            .get(key)
            .or_else(|| self.domains.get(domain))
            .cloned()
            .unwrap_or_default()
    }
}

fn css(s: &str) -> Selector {
    Selector::Css(s.to_string())
}

fn attr(css: &str, attr: &str) -> Selector {
    Selector::Attr(css.to_string(), attr.to_string())
}

fn default_product_container() -> Vec<Selector> {
    vec![
        css(".product-item"),
        css(".product"),
        css("li.item.product"),
        css("div.product-card"),
        css("article.product-miniature"),
    ]
}

fn default_title() -> Vec<Selector> {
    vec![
        css(".product-item-name a"),
        css(".product-title"),
        css("h2.product-name a"),
        css("h3 a"),
        attr("a.product-item-link", "title"),
    ]
}

fn default_price() -> Vec<Selector> {
    vec![
        css(".price-box .price"),
        css("span.price"),
        css(".product-price"),
        css(".price-container .price"),
        attr("[data-price-amount]", "data-price-amount"),
    ]
}

fn default_url() -> Vec<Selector> {
    vec![
        attr(".product-item-name a", "href"),
        attr("a.product-item-link", "href"),
        attr("h2.product-name a", "href"),
        attr("a.product-link", "href"),
        attr("a", "href"),
    ]
}

fn default_image() -> Vec<Selector> {
    vec![
        attr("img.product-image-photo", "src"),
        attr(".product-image img", "src"),
        attr("img", "data-src"),
        attr("img", "src"),
    ]
}

fn default_identifier() -> Vec<Selector> {
    vec![
        css("[itemprop=\"gtin13\"]"),
        attr("[data-ean]", "data-ean"),
        css(".product-ean"),
        css(".barcode"),
        css(".product-sku"),
    ]
}

fn default_category_links() -> Vec<Selector> {
    vec![
        attr("nav.navigation a.level-top", "href"),
        attr("ul.category-menu a", "href"),
        attr(".sidebar-categories a", "href"),
        attr("nav a[href*=\"category\"]", "href"),
    ]
}

fn default_next_buttons() -> Vec<String> {
    [
        ".next a",
        "a.next",
        "a[rel='next']",
        ".pagination-next a",
        ".pagination a[aria-label='Next']",
        "a.action.next",
        ".pagination a.next",
        "li.next a",
        ".pager-next a",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use fba_arbitrage_pipeline::amazon::BrowserPage;
use fba_arbitrage_pipeline::auth::SupplierLogin;
use fba_arbitrage_pipeline::config::SystemConfig;
use fba_arbitrage_pipeline::errors::RunStatus;
use fba_arbitrage_pipeline::linking_map::LinkingMapStore;
use fba_arbitrage_pipeline::models::{ProcessingState, SupplierProduct};
use fba_arbitrage_pipeline::orchestrator::{ExtractionOrchestrator, RunOptions};
use fba_arbitrage_pipeline::paths::OutputLayout;
use fba_arbitrage_pipeline::supplier_guard::{ReadySummary, SupplierGuard};

const MARKETPLACE: &str = "https://www.amazon.co.uk";

/// Scripted browser page: canned HTML per URL, keepa iframes keyed by the
/// page they belong to.
struct ScriptedPage {
    pages: Mutex<HashMap<String, String>>,
    iframes: Mutex<HashMap<String, String>>,
    current: Mutex<String>,
}

impl ScriptedPage {
    fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            iframes: Mutex::new(HashMap::new()),
            current: Mutex::new(String::new()),
        }
    }

    fn serve(&self, url: &str, html: &str) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), html.to_string());
    }

    fn serve_iframe_for(&self, page_url: &str, html: &str) {
        self.iframes
            .lock()
            .unwrap()
            .insert(page_url.to_string(), html.to_string());
    }
}

#[async_trait]
impl BrowserPage for ScriptedPage {
    async fn goto(&self, url: &str) -> Result<()> {
        *self.current.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        let current = self.current.lock().unwrap().clone();
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&current)
            .cloned()
            .unwrap_or_default())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.current.lock().unwrap().clone())
    }

    async fn click(&self, _css: &str) -> Result<bool> {
        Ok(false)
    }

    async fn solve_captcha(&self) -> Result<bool> {
        Ok(false)
    }

    async fn iframe_content(&self, _css: &str) -> Result<Option<String>> {
        let current = self.current.lock().unwrap().clone();
        Ok(self.iframes.lock().unwrap().get(&current).cloned())
    }
}

struct NoopLogin;

#[async_trait]
impl SupplierLogin for NoopLogin {
    async fn login(&self) -> Result<()> {
        Ok(())
    }
}

fn fast_config() -> SystemConfig {
    let mut config = SystemConfig::default();
    config.amazon.extension_data_wait_seconds = 0;
    config.amazon.keepa_grid_wait_seconds = 0;
    config.amazon.keepa_grid_fallback_wait_seconds = 0;
    config.amazon.captcha_manual_wait_seconds = 0;
    config.supplier.rate_limit_delay_seconds = 0.0;
    config.supplier.max_retries = 1;
    config.performance.timeout_seconds = 2;
    config
}

fn orchestrator_in(
    root: &Path,
    page: Arc<ScriptedPage>,
) -> Result<ExtractionOrchestrator> {
    // Sender dropped immediately: the receiver keeps reporting false.
    let (_tx, rx) = watch::channel(false);
    ExtractionOrchestrator::new(
        fast_config(),
        OutputLayout::new(root),
        page,
        None,
        Arc::new(NoopLogin),
        rx,
    )
}

fn supplier_product(title: &str, ean: &str, price: f64) -> SupplierProduct {
    SupplierProduct {
        title: title.to_string(),
        price,
        url: format!("https://supplier.example/{}", ean),
        image_url: None,
        ean: Some(ean.to_string()),
        upc: None,
        sku: None,
        brand: None,
        description: None,
        source_supplier: "supplier.example".to_string(),
        source_category_url: "https://supplier.example/cat".to_string(),
        extraction_timestamp: Utc::now(),
    }
}

fn run_options() -> RunOptions {
    RunOptions {
        supplier_url: "https://supplier.example".to_string(),
        supplier_name: "supplier.example".to_string(),
        max_products: 0,
        force_regenerate: false,
        resume: true,
    }
}

fn search_tile(asin: &str, title: &str) -> String {
    format!(
        "<div data-asin=\"{}\" class=\"s-result-item\"><h2><a><span>{}</span></a></h2></div>",
        asin, title
    )
}

fn detail_page(
    title: &str,
    price: f64,
    ean: &str,
    sold_by_amazon: bool,
) -> String {
    let merchant = if sold_by_amazon {
        "Dispatched from and sold by Amazon"
    } else {
        "Sold by Third Party Trading"
    };
    format!(
        r##"<html><body>
          <span id="productTitle">{title}</span>
          <div class="a-price"><span class="a-offscreen">£{price:.2}</span></div>
          <span id="acrPopover" title="4.4 out of 5 stars"></span>
          <span id="acrCustomerReviewText">120 ratings</span>
          <div id="availability">In stock</div>
          <div id="merchant-info">{merchant}</div>
          <img id="landingImage" src="https://img.example/main.jpg"/>
          <table id="productDetails_techSpec_section_1">
            <tr><th>EAN</th><td>{ean}</td></tr>
          </table>
          <div>Best Sellers Rank #20,000 in Home &amp; Kitchen</div>
        </body></html>"##
    )
}

fn keepa_grid(fba_fee: f64) -> String {
    format!(
        r##"<div id="grid-product-detail">
          <div role="row">
            <div role="gridcell" col-id="productKey">FBA Pick&amp;Pack Fee</div>
            <div role="gridcell" col-id="productValue">£{fba_fee:.2}</div>
          </div>
        </div>"##
    )
}

/// Wire one supplier EAN to an Amazon listing: search page with a single
/// organic tile plus the detail page and its Keepa grid.
fn wire_listing(
    page: &ScriptedPage,
    ean: &str,
    asin: &str,
    title: &str,
    price: f64,
    fba_fee: f64,
    sold_by_amazon: bool,
) {
    page.serve(
        &format!("{}/s?k={}", MARKETPLACE, ean),
        &format!(
            "<html><body><div class=\"s-search-results\">{}</div></body></html>",
            search_tile(asin, title)
        ),
    );
    let dp = format!("{}/dp/{}", MARKETPLACE, asin);
    page.serve(&dp, &detail_page(title, price, ean, sold_by_amazon));
    page.serve_iframe_for(&dp, &keepa_grid(fba_fee));
}

#[tokio::test]
async fn ean_match_below_roi_gate_is_excluded() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let page = Arc::new(ScriptedPage::new());
    // ROI lands near 30%, under the 35% default gate.
    wire_listing(
        &page,
        "5000000000012",
        "B01ABCDEFG",
        "Acme Widget 4 Pack (New)",
        12.99,
        3.80,
        false,
    );
    let mut orchestrator = orchestrator_in(dir.path(), page)?;

    let products = vec![supplier_product("Acme Widget 4-Pack", "5000000000012", 4.99)];
    let mut state = ProcessingState::default();
    let mut linking_map =
        LinkingMapStore::load(OutputLayout::new(dir.path()).linking_map_file(), 10)?;

    let profitable = orchestrator
        .run_match_phase(&run_options(), &products, &mut state, &mut linking_map)
        .await?;

    assert!(profitable.is_empty());
    // The linking decision is still persisted.
    assert_eq!(linking_map.len(), 1);
    let record = linking_map.get("EAN_5000000000012").unwrap();
    assert_eq!(record.chosen_amazon_asin, "B01ABCDEFG");
    assert_eq!(
        orchestrator
            .summary()
            .rejections
            .get("roi_below_minimum"),
        Some(&1)
    );
    Ok(())
}

#[tokio::test]
async fn profitable_tuple_promoted_to_results() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let page = Arc::new(ScriptedPage::new());
    wire_listing(
        &page,
        "5000000000012",
        "B01ABCDEFG",
        "Acme Widget 4 Pack (New)",
        29.99,
        2.50,
        false,
    );
    let mut orchestrator = orchestrator_in(dir.path(), page)?;

    let products = vec![supplier_product("Acme Widget 4-Pack", "5000000000012", 4.99)];
    let mut state = ProcessingState::default();
    let mut linking_map =
        LinkingMapStore::load(OutputLayout::new(dir.path()).linking_map_file(), 10)?;

    let profitable = orchestrator
        .run_match_phase(&run_options(), &products, &mut state, &mut linking_map)
        .await?;

    assert_eq!(profitable.len(), 1);
    let result = &profitable[0];
    assert_eq!(result.amazon_product.asin, "B01ABCDEFG");
    assert!(result.financial_metrics.roi_percent_calculated >= 35.0);
    assert!(result.financial_metrics.estimated_profit_per_unit >= 3.0);
    assert_eq!(state.last_processed_index, 1);
    Ok(())
}

#[tokio::test]
async fn sold_by_amazon_is_rejected_and_counted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let page = Arc::new(ScriptedPage::new());
    wire_listing(
        &page,
        "5000000000012",
        "B01ABCDEFG",
        "Acme Widget 4 Pack (New)",
        29.99,
        2.50,
        true,
    );
    let mut orchestrator = orchestrator_in(dir.path(), page)?;

    let products = vec![supplier_product("Acme Widget 4-Pack", "5000000000012", 4.99)];
    let mut state = ProcessingState::default();
    let mut linking_map =
        LinkingMapStore::load(OutputLayout::new(dir.path()).linking_map_file(), 10)?;

    let profitable = orchestrator
        .run_match_phase(&run_options(), &products, &mut state, &mut linking_map)
        .await?;

    assert!(profitable.is_empty());
    assert_eq!(
        orchestrator.summary().rejections.get("sold_by_amazon"),
        Some(&1)
    );
    Ok(())
}

#[tokio::test]
async fn rerun_skips_previously_visited_products() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let page = Arc::new(ScriptedPage::new());
    wire_listing(
        &page,
        "5000000000012",
        "B01ABCDEFG",
        "Acme Widget 4 Pack (New)",
        29.99,
        2.50,
        false,
    );
    let products = vec![supplier_product("Acme Widget 4-Pack", "5000000000012", 4.99)];
    let layout = OutputLayout::new(dir.path());

    let mut orchestrator = orchestrator_in(dir.path(), page.clone())?;
    let mut state = ProcessingState::default();
    let mut linking_map = LinkingMapStore::load(layout.linking_map_file(), 10)?;
    let first = orchestrator
        .run_match_phase(&run_options(), &products, &mut state, &mut linking_map)
        .await?;
    assert_eq!(first.len(), 1);
    let bytes_after_first = std::fs::read(layout.linking_map_file())?;

    // Fresh session over the same data: everything already linked.
    let mut orchestrator = orchestrator_in(dir.path(), page)?;
    let mut state = ProcessingState::default();
    let mut linking_map = LinkingMapStore::load(layout.linking_map_file(), 10)?;
    let second = orchestrator
        .run_match_phase(&run_options(), &products, &mut state, &mut linking_map)
        .await?;

    assert!(second.is_empty());
    assert_eq!(orchestrator.summary().products_previously_visited, 1);
    assert_eq!(linking_map.len(), 1);
    let bytes_after_second = std::fs::read(layout.linking_map_file())?;
    assert_eq!(bytes_after_first, bytes_after_second);
    Ok(())
}

#[tokio::test]
async fn resume_starts_at_checkpointed_index() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let page = Arc::new(ScriptedPage::new());
    for (ean, asin) in [
        ("5000000000012", "B000000001"),
        ("5000000000029", "B000000002"),
        ("5000000000036", "B000000003"),
    ] {
        wire_listing(&page, ean, asin, "Acme Widget 4 Pack", 29.99, 2.50, false);
    }
    let mut orchestrator = orchestrator_in(dir.path(), page)?;

    let products = vec![
        supplier_product("Acme Widget 4-Pack", "5000000000012", 4.99),
        supplier_product("Acme Widget 4-Pack", "5000000000029", 4.99),
        supplier_product("Acme Widget 4-Pack", "5000000000036", 4.99),
    ];
    // State says the first product was already handled in a prior session.
    let mut state = ProcessingState {
        last_processed_index: 1,
        ..ProcessingState::default()
    };
    let mut linking_map =
        LinkingMapStore::load(OutputLayout::new(dir.path()).linking_map_file(), 10)?;

    let profitable = orchestrator
        .run_match_phase(&run_options(), &products, &mut state, &mut linking_map)
        .await?;

    // Only the second and third products were processed.
    assert_eq!(profitable.len(), 2);
    assert_eq!(linking_map.len(), 2);
    assert!(!linking_map.contains("EAN_5000000000012"));
    assert!(linking_map.contains("EAN_5000000000029"));
    assert!(linking_map.contains("EAN_5000000000036"));
    assert_eq!(state.last_processed_index, 3);
    Ok(())
}

#[tokio::test]
async fn ean_search_without_organics_falls_back_to_title_search() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let page = Arc::new(ScriptedPage::new());
    // EAN search yields only sponsored tiles.
    let sponsored: Vec<String> = (0..3)
        .map(|i| {
            format!(
                "<div data-asin=\"B0SPONSOR{}\" class=\"s-result-item\"><span>Sponsored</span><h2><a><span>Ad Widget</span></a></h2></div>",
                i
            )
        })
        .collect();
    page.serve(
        &format!("{}/s?k=5000000000012", MARKETPLACE),
        &format!(
            "<html><body><div class=\"s-search-results\">{}</div></body></html>",
            sponsored.join("")
        ),
    );
    // Title search succeeds.
    page.serve(
        &format!("{}/s?k=Acme+Widget+4-Pack", MARKETPLACE),
        &format!(
            "<html><body><div class=\"s-search-results\">{}</div></body></html>",
            search_tile("B01ABCDEFG", "Acme Widget 4 Pack (New)")
        ),
    );
    let dp = format!("{}/dp/B01ABCDEFG", MARKETPLACE);
    page.serve(
        &dp,
        &detail_page("Acme Widget 4 Pack (New)", 29.99, "5000000000012", false),
    );
    page.serve_iframe_for(&dp, &keepa_grid(2.50));

    let mut orchestrator = orchestrator_in(dir.path(), page)?;
    let products = vec![supplier_product("Acme Widget 4-Pack", "5000000000012", 4.99)];
    let mut state = ProcessingState::default();
    let mut linking_map =
        LinkingMapStore::load(OutputLayout::new(dir.path()).linking_map_file(), 10)?;

    let profitable = orchestrator
        .run_match_phase(&run_options(), &products, &mut state, &mut linking_map)
        .await?;

    assert_eq!(profitable.len(), 1);
    let record = linking_map.get("EAN_5000000000012").unwrap();
    assert_eq!(
        serde_json::to_string(&record.match_method)?,
        "\"hybrid_search\""
    );
    Ok(())
}

#[tokio::test]
async fn ready_supplier_skips_the_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let layout = OutputLayout::new(dir.path());
    let guard = SupplierGuard::new(layout.clone());
    guard.mark_ready(
        "supplier.example",
        &ReadySummary {
            supplier: "supplier.example".to_string(),
            total_products: 10,
            products_with_ean: 8,
            categories_discovered: 2,
            linking_map_entries: 10,
            created: Utc::now(),
        },
    )?;

    let page = Arc::new(ScriptedPage::new());
    let mut orchestrator = orchestrator_in(dir.path(), page)?;
    let outcome = orchestrator.run(&run_options()).await?;

    assert_eq!(outcome.status, RunStatus::Success);
    assert!(outcome.profitable.is_empty());
    Ok(())
}

#[tokio::test]
async fn amazon_extraction_cached_per_asin_and_ean() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let page = Arc::new(ScriptedPage::new());
    wire_listing(
        &page,
        "5000000000012",
        "B01ABCDEFG",
        "Acme Widget 4 Pack (New)",
        29.99,
        2.50,
        false,
    );
    let layout = OutputLayout::new(dir.path());

    let mut orchestrator = orchestrator_in(dir.path(), page.clone())?;
    let products = vec![supplier_product("Acme Widget 4-Pack", "5000000000012", 4.99)];
    let mut state = ProcessingState::default();
    let mut linking_map = LinkingMapStore::load(layout.linking_map_file(), 10)?;
    orchestrator
        .run_match_phase(&run_options(), &products, &mut state, &mut linking_map)
        .await?;

    let cache_file = layout.amazon_cache_file("B01ABCDEFG", Some("5000000000012"));
    assert!(cache_file.exists());
    let raw = std::fs::read_to_string(&cache_file)?;
    assert!(raw.contains("\"asin\": \"B01ABCDEFG\""));
    Ok(())
}

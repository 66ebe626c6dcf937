use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::future::join_all;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ai::AiClient;
use crate::amazon::{AmazonExtractor, BrowserPage, SearchOutcome};
use crate::auth::{AuthCoordinator, LoginTrigger, SupplierLogin};
use crate::cache::{CacheFamily, CacheStore};
use crate::config::SystemConfig;
use crate::errors::RunStatus;
use crate::financial::{FinancialCalculator, GateOutcome};
use crate::linking_map::LinkingMapStore;
use crate::matcher::Matcher;
use crate::models::{
    title_snippet, AmazonProduct, DataSource, LinkingRecord, MatchMethod, MatchQuality,
    ProcessingState, ProfitableResult, ResultsSummary, SupplierProduct,
};
use crate::output_verifier::{self, AiCategoryCacheArtifact, AiSuggestionEntry, AiSuggestions};
use crate::paths::OutputLayout;
use crate::report::FinancialReport;
use crate::supplier_guard::{ReadySummary, SupplierGuard};
use crate::supplier_scraper::{Category, SupplierScraper};

/// Per-run options, resolved from the CLI and config.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub supplier_url: String,
    pub supplier_name: String,
    /// 0 means unlimited.
    pub max_products: usize,
    pub force_regenerate: bool,
    pub resume: bool,
}

/// Terminal result of one pipeline run.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub profitable: Vec<ProfitableResult>,
    pub summary: ResultsSummary,
}

/// Keep products inside the configured price band. Applied once,
/// post-extraction; the orchestrator iterates the filtered list.
pub fn price_filter(
    products: &[SupplierProduct],
    min_price: f64,
    max_price: f64,
) -> Vec<SupplierProduct> {
    products
        .iter()
        .filter(|p| p.is_valid() && p.price >= min_price && p.price <= max_price)
        .cloned()
        .collect()
}

/// Drives the pipeline from a supplier URL to the result set with
/// product-level checkpointing: supplier extraction and Amazon matching
/// alternate every `K_SWITCH` categories so an interrupt never loses more
/// than one flush interval of work.
pub struct ExtractionOrchestrator {
    config: SystemConfig,
    layout: OutputLayout,
    cache: CacheStore,
    guard: SupplierGuard,
    scraper: SupplierScraper,
    amazon: AmazonExtractor,
    matcher: Matcher,
    financial: FinancialCalculator,
    auth: AuthCoordinator,
    login: Arc<dyn SupplierLogin>,
    cancel: watch::Receiver<bool>,
    summary: ResultsSummary,
}

impl ExtractionOrchestrator {
    pub fn new(
        config: SystemConfig,
        layout: OutputLayout,
        page: Arc<dyn BrowserPage>,
        ai: Option<Arc<dyn AiClient>>,
        login: Arc<dyn SupplierLogin>,
        cancel: watch::Receiver<bool>,
    ) -> Result<Self> {
        let scraper = SupplierScraper::new(
            config.supplier.clone(),
            crate::selectors::SelectorConfig::default(),
            config.performance.timeout_seconds,
            ai.clone(),
        )?;
        let amazon = AmazonExtractor::new(page, config.amazon.clone());
        let matcher = Matcher::new(ai);
        let financial = FinancialCalculator::new(config.criteria.clone());
        let auth = AuthCoordinator::new(config.authentication.clone());
        let cache = CacheStore::new(config.cache.ttl_hours);
        let guard = SupplierGuard::new(layout.clone());

        Ok(Self {
            config,
            layout,
            cache,
            guard,
            scraper,
            amazon,
            matcher,
            financial,
            auth,
            login,
            cancel,
            summary: ResultsSummary::default(),
        })
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Counters accumulated so far this run.
    pub fn summary(&self) -> &ResultsSummary {
        &self.summary
    }

    /// Run the full pipeline for one supplier.
    pub async fn run(&mut self, options: &RunOptions) -> Result<RunOutcome> {
        let session_id = format!(
            "{}_{}",
            crate::paths::supplier_slug(&options.supplier_name),
            Uuid::new_v4().simple()
        );
        info!(
            "Starting extraction run for {} ({}), session {}",
            options.supplier_name, options.supplier_url, session_id
        );
        self.layout.ensure_directories(&options.supplier_name)?;

        if !options.force_regenerate {
            let (ready, reason) = self.guard.is_ready(&options.supplier_name);
            if ready {
                info!("Supplier already ready, skipping run: {}", reason);
                return Ok(RunOutcome {
                    status: RunStatus::Success,
                    profitable: Vec::new(),
                    summary: std::mem::take(&mut self.summary),
                });
            }
            info!("Supplier not ready: {}", reason);
        } else {
            self.guard
                .archive_on_force_regenerate(&options.supplier_name)?;
            self.cache.clear_prefix(
                &self.layout.supplier_cache_dir(),
                &crate::paths::supplier_slug(&options.supplier_name),
            )?;
        }

        self.auth
            .attempt_login(self.login.as_ref(), LoginTrigger::Startup)
            .await?;

        let mut state = if options.resume {
            self.load_state(&options.supplier_name)
        } else {
            ProcessingState::default()
        };
        let mut linking_map = LinkingMapStore::load(
            self.layout.linking_map_file(),
            self.config.system.linking_map_batch_size,
        )?;

        let outcome = self
            .run_pipeline(options, &mut state, &mut linking_map)
            .await;

        // Cancellation or failure still flushes what we have.
        if let Err(e) = linking_map.flush() {
            error!("Final linking-map flush failed: {}", e);
        }
        if let Err(e) = self.save_state(&options.supplier_name, &mut state) {
            error!("Final state flush failed: {}", e);
        }

        match outcome {
            Ok(profitable) => {
                let status = match self.finalize(options, &state, &linking_map, &profitable) {
                    Ok(status) => status,
                    Err(e) => {
                        error!("Finalize failed: {:#}", e);
                        RunStatus::Failed
                    }
                };
                self.log_summary();
                Ok(RunOutcome {
                    status,
                    profitable,
                    summary: std::mem::take(&mut self.summary),
                })
            }
            Err(e) if self.cancelled() => {
                warn!("Run interrupted: {}", e);
                self.log_summary();
                Ok(RunOutcome {
                    status: RunStatus::Interrupted,
                    profitable: Vec::new(),
                    summary: std::mem::take(&mut self.summary),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn run_pipeline(
        &mut self,
        options: &RunOptions,
        state: &mut ProcessingState,
        linking_map: &mut LinkingMapStore,
    ) -> Result<Vec<ProfitableResult>> {
        let supplier_cache_path = self.layout.supplier_cache_file(&options.supplier_name);
        let mut products: Vec<SupplierProduct> = self
            .cache
            .get(CacheFamily::SupplierProducts, &supplier_cache_path)?
            .unwrap_or_default();

        let mut profitable = Vec::new();

        if products.is_empty() {
            info!("No fresh supplier cache; starting category walk");
            products = self
                .walk_supplier(options, state, linking_map, &mut profitable)
                .await?;
        } else {
            info!(
                "Loaded {} products from supplier cache ({})",
                products.len(),
                supplier_cache_path.display()
            );
            // Cache exhausted from previous runs: fresh walk, index reset.
            let filtered = self.filtered(&products);
            if options.resume && !filtered.is_empty() && state.last_processed_index >= filtered.len()
            {
                info!("All cached products already processed; fetching fresh supplier data");
                state.last_processed_index = 0;
                state.supplier_extraction_progress = Default::default();
                products = self
                    .walk_supplier(options, state, linking_map, &mut profitable)
                    .await?;
            }
        }

        info!("STAGE-COMPLETE: supplier_scrape - {} records", products.len());
        self.summary.total_supplier_products = products.len();
        if products.is_empty() {
            error!("STAGE-GUARD: supplier extraction yielded zero records, aborting");
            return Err(anyhow!("supplier extraction produced no products"));
        }
        self.cache.set(&supplier_cache_path, &products)?;

        let filtered = self.filtered(&products);
        info!(
            "STAGE-COMPLETE: price_filtering - {} records",
            filtered.len()
        );
        if filtered.is_empty() {
            warn!(
                "STAGE-GUARD: price filter removed all {} products (band £{:.2}-£{:.2})",
                products.len(),
                self.config.processing_limits.min_price_gbp,
                self.config.processing_limits.max_price_gbp
            );
        }

        let matched = self
            .run_match_phase(options, &filtered, state, linking_map)
            .await?;
        profitable.extend(matched);
        info!(
            "STAGE-COMPLETE: amazon_matching - {} records",
            profitable.len()
        );
        Ok(profitable)
    }

    fn filtered(&self, products: &[SupplierProduct]) -> Vec<SupplierProduct> {
        price_filter(
            products,
            self.config.processing_limits.min_price_gbp,
            self.config.processing_limits.max_price_gbp,
        )
    }

    /// Category walk with chunked interleaving: every `K_SWITCH`
    /// categories, switch to the match phase and drain the backlog before
    /// resuming extraction.
    async fn walk_supplier(
        &mut self,
        options: &RunOptions,
        state: &mut ProcessingState,
        linking_map: &mut LinkingMapStore,
        profitable: &mut Vec<ProfitableResult>,
    ) -> Result<Vec<SupplierProduct>> {
        let categories = self.scraper.discover_categories(&options.supplier_url).await?;
        if categories.is_empty() {
            return Err(anyhow!(
                "no categories discovered for {}",
                options.supplier_url
            ));
        }
        self.write_category_artifact(&options.supplier_name, &categories)?;
        state.supplier_extraction_progress.total_categories = categories.len();

        let supplier_cache_path = self.layout.supplier_cache_file(&options.supplier_name);
        let chunked = self.config.hybrid_processing.processing_modes.chunked.clone();
        // The drain boundary: every K_SWITCH categories, tightened further
        // by the chunked-mode backlog bound when that is smaller.
        let k_switch = self
            .config
            .hybrid_processing
            .switch_to_amazon_after_categories
            .max(1)
            .min(chunked.chunk_size_categories.max(1));
        let start_category = state.supplier_extraction_progress.current_category_index;
        let mut products: Vec<SupplierProduct> = self
            .cache
            .get(CacheFamily::SupplierProducts, &supplier_cache_path)?
            .unwrap_or_default();

        for (idx, category) in categories.iter().enumerate().skip(start_category) {
            if self.cancelled() {
                self.cache.set(&supplier_cache_path, &products)?;
                return Err(anyhow!("cancelled during category walk"));
            }

            state.supplier_extraction_progress.current_category_index = idx;
            let before = products.len();
            self.walk_category(options, category, &mut products, state, &supplier_cache_path)
                .await?;
            info!(
                "Category '{}' complete: {} products ({} total)",
                category.name,
                products.len() - before,
                products.len()
            );
            state
                .supplier_extraction_progress
                .categories_completed
                .push(category.url.clone());
            self.save_state(&options.supplier_name, state)?;

            // Extraction-slice boundary: persist the cache even between
            // product-level flushes.
            let slice = self.config.system.supplier_extraction_batch_size.max(1);
            if (idx + 1 - start_category) % slice == 0 {
                self.cache.set(&supplier_cache_path, &products)?;
            }

            // Chunk boundary: flush the cache and drain the match backlog.
            if chunked.enabled && (idx + 1 - start_category) % k_switch == 0 {
                self.cache.set(&supplier_cache_path, &products)?;
                info!(
                    "K_SWITCH boundary after {} categories; draining match backlog",
                    idx + 1
                );
                let filtered = self.filtered(&products);
                let matched = self
                    .match_backlog(
                        options,
                        &filtered,
                        state,
                        linking_map,
                        self.config.system.max_products_per_cycle,
                    )
                    .await?;
                profitable.extend(matched);
            }
        }

        self.cache.set(&supplier_cache_path, &products)?;
        Ok(products)
    }

    /// Paginate one category and extract its products in discovery order.
    async fn walk_category(
        &mut self,
        options: &RunOptions,
        category: &Category,
        products: &mut Vec<SupplierProduct>,
        state: &mut ProcessingState,
        supplier_cache_path: &Path,
    ) -> Result<()> {
        let per_category_cap = self.config.system.max_products_per_category;
        let flush_every = self
            .config
            .supplier_cache_control
            .update_frequency_products
            .max(1);
        let mut category_count = 0usize;

        // The category root plus any bounded-depth subpages under it, each
        // paginated independently.
        let mut start_urls = vec![category.url.clone()];
        match self.scraper.discover_subpages(&category.url).await {
            Ok(subpages) => start_urls.extend(subpages),
            Err(e) => warn!("Subpage discovery failed for {}: {}", category.url, e),
        }

        for start_url in start_urls {
            let mut page_url = start_url;
            let mut page_num = 1usize;

            loop {
                if self.cancelled() {
                    return Err(anyhow!("cancelled during category pagination"));
                }
                let Some(html) = self.scraper.get_page_content(&page_url).await? else {
                    warn!("Category page unavailable: {}", page_url);
                    break;
                };
                let elements = self.scraper.extract_product_elements(&html, &page_url);
                if elements.is_empty() {
                    break;
                }

                let mut page_products = Vec::new();
                for (element_idx, element) in elements.iter().enumerate() {
                    if per_category_cap > 0
                        && category_count + page_products.len() >= per_category_cap
                    {
                        break;
                    }
                    state
                        .supplier_extraction_progress
                        .current_product_index_in_category = element_idx;

                    match self
                        .extract_one_product(options, element, &page_url, category)
                        .await
                    {
                        Some(product) => page_products.push(product),
                        None => {
                            self.summary.errors += 1;
                        }
                    }
                }

                self.enrich_from_detail_pages(&mut page_products).await;
                for product in page_products {
                    products.push(product);
                    category_count += 1;
                    if products.len() % flush_every == 0 {
                        self.cache.set(supplier_cache_path, products)?;
                    }
                }
                if per_category_cap > 0 && category_count >= per_category_cap {
                    return Ok(());
                }

                match self.scraper.get_next_page_url(&page_url, &html, page_num) {
                    Some(next) if next != page_url => {
                        page_num += 1;
                        page_url = next;
                    }
                    _ => break,
                }
            }
        }
        Ok(())
    }

    /// One listing element to one product. Price failures feed the auth
    /// coordinator inline.
    async fn extract_one_product(
        &mut self,
        options: &RunOptions,
        element_html: &str,
        page_url: &str,
        category: &Category,
    ) -> Option<SupplierProduct> {
        let title = self.scraper.extract_title(element_html, page_url).await?;
        let price = match self.scraper.extract_price(element_html, page_url).await {
            Some(price) => {
                self.auth.record_price_success();
                price
            }
            None => {
                warn!("Price extraction failed for '{}'", title_snippet(&title));
                if let Some(trigger) = self.auth.record_price_failure() {
                    let _ = self.auth.attempt_login(self.login.as_ref(), trigger).await;
                }
                return None;
            }
        };
        let url = self
            .scraper
            .extract_url(element_html, page_url, &options.supplier_url)
            .await?;
        let image_url = self
            .scraper
            .extract_image(element_html, page_url, &options.supplier_url)
            .await;
        let ean = self.scraper.extract_identifier(element_html, page_url).await;

        Some(SupplierProduct {
            title,
            price,
            url,
            image_url,
            ean,
            upc: None,
            sku: None,
            brand: None,
            description: None,
            source_supplier: options.supplier_name.clone(),
            source_category_url: category.url.clone(),
            extraction_timestamp: Utc::now(),
        })
    }

    /// Detail-page enrichment for products missing an identifier or brand,
    /// fetched through the bounded worker pool.
    async fn enrich_from_detail_pages(&self, page_products: &mut [SupplierProduct]) {
        let needs_detail: Vec<usize> = page_products
            .iter()
            .enumerate()
            .filter(|(_, p)| p.ean.is_none() || p.brand.is_none())
            .map(|(i, _)| i)
            .collect();
        if needs_detail.is_empty() {
            return;
        }

        let pool = Arc::new(Semaphore::new(
            self.config.performance.max_concurrent_requests.max(1),
        ));
        let fetches: Vec<_> = needs_detail
            .iter()
            .map(|&i| {
                let url = page_products[i].url.clone();
                let pool = pool.clone();
                async move {
                    let _permit = pool.acquire().await.ok()?;
                    self.scraper.get_page_content(&url).await.ok().flatten()
                }
            })
            .collect();
        let bodies = join_all(fetches).await;

        for (&i, body) in needs_detail.iter().zip(bodies) {
            let Some(body) = body else { continue };
            let product = &mut page_products[i];
            let details = self.scraper.extract_detail_fields(&body, &product.url);
            if product.ean.is_none() {
                product.ean = details.ean;
            }
            if product.brand.is_none() {
                product.brand = details.brand;
            }
            if product.description.is_none() {
                product.description = details.description;
            }
        }
    }

    /// Drain the matching backlog: resolve each unprocessed product to an
    /// Amazon listing, validate, evaluate and gate it. Checkpoints state
    /// every `batch_save_frequency` products and the linking map every
    /// `linking_map_batch_size` records.
    pub async fn run_match_phase(
        &mut self,
        options: &RunOptions,
        filtered: &[SupplierProduct],
        state: &mut ProcessingState,
        linking_map: &mut LinkingMapStore,
    ) -> Result<Vec<ProfitableResult>> {
        self.match_backlog(options, filtered, state, linking_map, 0)
            .await
    }

    /// One matching cycle over the unprocessed tail of the filtered list.
    /// `cycle_cap` bounds the products handled this call (0 = drain fully).
    async fn match_backlog(
        &mut self,
        options: &RunOptions,
        filtered: &[SupplierProduct],
        state: &mut ProcessingState,
        linking_map: &mut LinkingMapStore,
        cycle_cap: usize,
    ) -> Result<Vec<ProfitableResult>> {
        let batch_save = self
            .config
            .supplier_extraction_progress
            .state_persistence
            .batch_save_frequency
            .max(1);
        let mut profitable = Vec::new();
        let start = state.last_processed_index.min(filtered.len());

        for (offset, product) in filtered[start..].iter().enumerate() {
            let absolute_index = start + offset;
            if cycle_cap > 0 && offset >= cycle_cap {
                info!("Cycle cap {} reached; pausing match backlog", cycle_cap);
                break;
            }
            if options.max_products > 0 && self.summary.products_analyzed >= options.max_products
            {
                info!(
                    "Product cap {} reached; stopping match phase",
                    options.max_products
                );
                break;
            }
            if self.cancelled() {
                linking_map.flush()?;
                self.save_state(&options.supplier_name, state)?;
                return Err(anyhow!("cancelled during match phase"));
            }

            let identifier = product.identifier();
            if let Some(existing) = linking_map.get(&identifier.key()) {
                info!(
                    "Previously visited {} -> {} ({:?}); skipping",
                    identifier.key(),
                    existing.chosen_amazon_asin,
                    existing.match_method
                );
                self.summary.products_previously_visited += 1;
                self.advance_checkpoint(options, state, absolute_index, batch_save)?;
                continue;
            }

            info!(
                "Processing {}/{}: '{}' (EAN: {})",
                absolute_index + 1,
                filtered.len(),
                title_snippet(&product.title),
                product.ean.as_deref().unwrap_or("N/A")
            );

            match self.match_one_product(product, linking_map).await {
                Ok(Some(result)) => {
                    self.summary.products_analyzed += 1;
                    if let Some(result) = result {
                        self.summary.products_profitable += 1;
                        profitable.push(result);
                    }
                }
                Ok(None) => {
                    self.summary.products_analyzed += 1;
                }
                Err(e) => {
                    warn!("Match failed for '{}': {}", title_snippet(&product.title), e);
                    self.summary.errors += 1;
                }
            }

            if linking_map.flush_due() {
                linking_map.flush()?;
                state.linking_map_batch_position = linking_map.len();
            }
            // Checkpoint after the product is done, before the next one
            // starts; the index only ever moves forward.
            self.advance_checkpoint(options, state, absolute_index, batch_save)?;
            if let Some(trigger) = self.auth.record_product_processed() {
                let _ = self.auth.attempt_login(self.login.as_ref(), trigger).await;
            }
        }

        linking_map.flush()?;
        state.linking_map_batch_position = linking_map.len();
        self.save_state(&options.supplier_name, state)?;
        Ok(profitable)
    }

    fn advance_checkpoint(
        &self,
        options: &RunOptions,
        state: &mut ProcessingState,
        absolute_index: usize,
        batch_save: usize,
    ) -> Result<()> {
        state.last_processed_index = state.last_processed_index.max(absolute_index + 1);
        if (absolute_index + 1) % batch_save == 0 {
            self.save_state(&options.supplier_name, state)?;
        }
        Ok(())
    }

    /// Resolve, validate and gate one product. `Ok(Some(Some(r)))` is a
    /// profitable result, `Ok(Some(None))` analyzed-but-rejected,
    /// `Ok(None)` not analyzable (no Amazon match found).
    #[allow(clippy::type_complexity)]
    async fn match_one_product(
        &mut self,
        product: &SupplierProduct,
        linking_map: &mut LinkingMapStore,
    ) -> Result<Option<Option<ProfitableResult>>> {
        let (asin, method, low_confidence) = match self.resolve_asin(product).await? {
            Some(resolved) => resolved,
            None => return Ok(None),
        };

        let cache_path = self
            .layout
            .amazon_cache_file(&asin, product.ean.as_deref());
        let amazon: AmazonProduct = match self
            .cache
            .get::<AmazonProduct>(CacheFamily::AmazonAsin, &cache_path)?
        {
            Some(mut cached) => {
                cached.source = DataSource::Cache;
                info!("Amazon cache hit for ASIN {}", asin);
                cached
            }
            None => {
                let extracted = self.amazon.extract_by_asin(&asin).await?;
                self.cache.set(&cache_path, &extracted)?;
                extracted
            }
        };

        if amazon.title.is_empty() {
            return Err(anyhow!("empty Amazon title for ASIN {}", asin));
        }

        linking_map.append(LinkingRecord {
            supplier_product_identifier: product.identifier().key(),
            supplier_title_snippet: title_snippet(&product.title),
            chosen_amazon_asin: asin.clone(),
            amazon_title_snippet: title_snippet(&amazon.title),
            amazon_ean_on_page: amazon.ean_on_page().map(str::to_string),
            match_method: method,
        });

        if !self.financial.quick_triage(product.price, &amazon) {
            self.summary.products_failed_triage += 1;
            self.summary.record_rejection("failed_quick_triage");
            return Ok(Some(None));
        }

        let mut validation = self.matcher.validate_match(product, &amazon).await;
        if low_confidence && validation.match_quality == MatchQuality::High {
            validation.match_quality = MatchQuality::Medium;
            validation
                .reasons
                .push("EAN search fell back to first organic result".to_string());
        }

        let metrics = self.financial.compute(product.price, &amazon);
        match self
            .financial
            .meets_criteria(&metrics, &amazon, validation.match_quality)
        {
            GateOutcome::Pass => Ok(Some(Some(ProfitableResult {
                supplier_product: product.clone(),
                amazon_product: amazon,
                match_validation: validation,
                financial_metrics: metrics,
                match_method: method,
            }))),
            GateOutcome::Fail(reason) => {
                self.summary.record_rejection(reason);
                info!(
                    "Criteria gate rejected '{}': {}",
                    title_snippet(&product.title),
                    reason
                );
                Ok(Some(None))
            }
        }
    }

    /// EAN-first, title-fallback ASIN resolution.
    async fn resolve_asin(
        &mut self,
        product: &SupplierProduct,
    ) -> Result<Option<(String, MatchMethod, bool)>> {
        if let Some(ean) = &product.ean {
            let outcome = self.amazon.search_by_ean(ean, &product.title).await?;
            if let Some(asin) = outcome.direct_product_asin {
                return Ok(Some((asin, MatchMethod::EanSearch, false)));
            }
            if let Some(hit) = outcome.results.first() {
                return Ok(Some((
                    hit.asin.clone(),
                    MatchMethod::EanSearch,
                    outcome.low_confidence,
                )));
            }
            info!(
                "EAN search failed for {} ({}); falling back to title search",
                ean,
                outcome.error.as_deref().unwrap_or("no results")
            );
            return self
                .title_fallback(product, MatchMethod::HybridSearch)
                .await;
        }
        self.title_fallback(product, MatchMethod::TitleSearch).await
    }

    async fn title_fallback(
        &mut self,
        product: &SupplierProduct,
        method: MatchMethod,
    ) -> Result<Option<(String, MatchMethod, bool)>> {
        let outcome: SearchOutcome = self.amazon.search_by_title(&product.title).await?;
        match outcome.results.first() {
            Some(hit) => Ok(Some((hit.asin.clone(), method, false))),
            None => {
                info!(
                    "No Amazon match for '{}' ({})",
                    title_snippet(&product.title),
                    outcome.error.as_deref().unwrap_or("no results")
                );
                Ok(None)
            }
        }
    }

    /// Post-run artifacts, verification, and the ready flag.
    fn finalize(
        &mut self,
        options: &RunOptions,
        state: &ProcessingState,
        linking_map: &LinkingMapStore,
        profitable: &[ProfitableResult],
    ) -> Result<RunStatus> {
        linking_map.mirror_to(&self.layout.verifier_linking_map_file())?;
        self.write_cached_products_artifact(&options.supplier_name)?;

        let report = FinancialReport::new(
            &options.supplier_name,
            &Uuid::new_v4().simple().to_string(),
            self.summary.clone(),
            profitable.to_vec(),
        );
        report.write(&self.layout)?;

        let verification = output_verifier::verify_run_outputs(&self.layout);
        if !verification.ok {
            error!(
                "Run needs intervention: {} validation issues",
                verification.issues.len()
            );
            return Ok(RunStatus::NeedsIntervention);
        }

        let products: Vec<SupplierProduct> = self
            .cache
            .get(
                CacheFamily::SupplierProducts,
                &self.layout.supplier_cache_file(&options.supplier_name),
            )?
            .unwrap_or_default();
        self.guard.mark_ready(
            &options.supplier_name,
            &ReadySummary {
                supplier: options.supplier_name.clone(),
                total_products: products.len(),
                products_with_ean: products.iter().filter(|p| p.ean.is_some()).count(),
                categories_discovered: state.supplier_extraction_progress.total_categories,
                linking_map_entries: linking_map.len(),
                created: Utc::now(),
            },
        )?;
        Ok(RunStatus::Success)
    }

    fn write_category_artifact(&self, supplier: &str, categories: &[Category]) -> Result<()> {
        let artifact = AiCategoryCacheArtifact {
            supplier: supplier.to_string(),
            created: Utc::now(),
            ai_suggestion_history: vec![AiSuggestionEntry {
                timestamp: Utc::now(),
                ai_suggestions: AiSuggestions {
                    top_3_urls: categories.iter().take(3).map(|c| c.url.clone()).collect(),
                },
            }],
        };
        self.cache
            .set(&self.layout.ai_category_cache_artifact(), &artifact)
    }

    fn write_cached_products_artifact(&self, supplier: &str) -> Result<()> {
        let products: Vec<SupplierProduct> = self
            .cache
            .get(
                CacheFamily::SupplierProducts,
                &self.layout.supplier_cache_file(supplier),
            )?
            .unwrap_or_default();
        let artifact = serde_json::json!({
            "supplier": supplier,
            "created": Utc::now(),
            "products": products,
        });
        self.cache
            .set(&self.layout.cached_products_artifact(), &artifact)
    }

    fn load_state(&self, supplier: &str) -> ProcessingState {
        let path = self.layout.processing_state_file(supplier);
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<ProcessingState>(&raw) {
                Ok(state) => {
                    info!(
                        "Resuming from index {} (state {})",
                        state.last_processed_index,
                        path.display()
                    );
                    state
                }
                Err(e) => {
                    warn!("Unreadable processing state ({}); starting fresh", e);
                    ProcessingState::default()
                }
            },
            Err(_) => ProcessingState::default(),
        }
    }

    fn save_state(&self, supplier: &str, state: &mut ProcessingState) -> Result<()> {
        state.last_checkpoint = Utc::now();
        let path = self.layout.processing_state_file(supplier);
        self.cache
            .set(&path, state)
            .with_context(|| format!("checkpointing state to {}", path.display()))
    }

    fn log_summary(&self) {
        info!("=== Run summary ===");
        info!(
            "Supplier products: {}, analyzed: {}, profitable: {}, previously visited: {}, triage failures: {}, errors: {}",
            self.summary.total_supplier_products,
            self.summary.products_analyzed,
            self.summary.products_profitable,
            self.summary.products_previously_visited,
            self.summary.products_failed_triage,
            self.summary.errors
        );
        for (reason, count) in &self.summary.rejections {
            info!("Rejected ({}) x{}", reason, count);
        }
    }
}

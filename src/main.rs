mod ai;
mod amazon;
mod auth;
mod cache;
mod config;
mod errors;
mod financial;
mod linking_map;
mod matcher;
mod models;
mod orchestrator;
mod output_verifier;
mod paths;
mod report;
mod selectors;
mod supplier_guard;
mod supplier_scraper;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use parking_lot::Mutex;
use scraper::{Html, Selector as CssSelector};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use amazon::BrowserPage;
use auth::SupplierLogin;
use config::SystemConfig;
use errors::RunStatus;
use orchestrator::{ExtractionOrchestrator, RunOptions};
use paths::{supplier_name_from_url, OutputLayout};

/// Automated FBA arbitrage pipeline
#[derive(Parser)]
#[command(name = "fba-arbitrage-pipeline")]
#[command(about = "Supplier extraction, Amazon matching and FBA profitability analysis")]
#[command(version)]
struct Cli {
    /// Supplier storefront base URL
    #[arg(long)]
    supplier_url: String,

    /// Supplier account email (handed to the login collaborator)
    #[arg(long)]
    supplier_email: String,

    /// Supplier account password (handed to the login collaborator)
    #[arg(long)]
    supplier_password: String,

    /// Run the browser headed instead of headless
    #[arg(long, action = clap::ArgAction::Set, default_value_t = false)]
    headed: bool,

    /// Maximum products to process this run (0 = unlimited; overrides config)
    #[arg(long)]
    max_products: Option<usize>,

    /// Archive existing supplier data and regenerate from scratch
    #[arg(long)]
    force_regenerate: bool,

    /// Emit workflow tracing spans (tracing only, no behaviour change)
    #[arg(long)]
    enable_langgraph_tracing: bool,

    /// Path to the JSON configuration document
    #[arg(long, default_value = "system_config.json")]
    config: PathBuf,

    /// Output root directory
    #[arg(long, default_value = "OUTPUTS")]
    output_root: PathBuf,
}

/// Plain-HTTP rendering of the browser-page capability: navigation is a
/// GET, nothing is clickable, captchas cannot be solved. Good enough for
/// static extraction; a real browser implementation plugs in behind the
/// same trait.
struct HttpPage {
    client: reqwest::Client,
    current_url: Mutex<String>,
    body: Mutex<String>,
}

impl HttpPage {
    fn new(timeout_seconds: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds.max(1)))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .gzip(true)
            .brotli(true)
            .build()?;
        Ok(Self {
            client,
            current_url: Mutex::new(String::new()),
            body: Mutex::new(String::new()),
        })
    }
}

#[async_trait]
impl BrowserPage for HttpPage {
    async fn goto(&self, url: &str) -> Result<()> {
        let response = self.client.get(url).send().await?;
        *self.current_url.lock() = response.url().to_string();
        *self.body.lock() = response.text().await?;
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        Ok(self.body.lock().clone())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.current_url.lock().clone())
    }

    async fn click(&self, _css: &str) -> Result<bool> {
        Ok(false)
    }

    async fn solve_captcha(&self) -> Result<bool> {
        Ok(false)
    }

    async fn iframe_content(&self, css: &str) -> Result<Option<String>> {
        let src = {
            let body = self.body.lock();
            let html = Html::parse_document(&body);
            css.split(',')
                .filter_map(|part| CssSelector::parse(part.trim()).ok())
                .find_map(|sel| {
                    html.select(&sel)
                        .next()
                        .and_then(|el| el.value().attr("src"))
                        .map(str::to_string)
                })
        };
        let Some(src) = src else {
            return Ok(None);
        };
        match self.client.get(&src).send().await {
            Ok(response) => Ok(Some(response.text().await.unwrap_or_default())),
            Err(e) => {
                warn!("Iframe fetch failed for {}: {}", src, e);
                Ok(None)
            }
        }
    }
}

/// Credential holder for the out-of-core login collaborator. The concrete
/// login script runs elsewhere; this validates the credentials exist and
/// records the attempt.
struct CredentialLogin {
    email: String,
}

#[async_trait]
impl SupplierLogin for CredentialLogin {
    async fn login(&self) -> Result<()> {
        if self.email.trim().is_empty() {
            anyhow::bail!("supplier email is empty");
        }
        info!("Supplier login delegated for {}", self.email);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.enable_langgraph_tracing {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    if cli.headed {
        info!("Headed mode requested; the page capability decides how to honour it");
    }
    if cli.supplier_password.is_empty() {
        warn!("Empty supplier password supplied");
    }

    std::process::exit(match run(cli).await {
        Ok(status) => status.exit_code(),
        Err(e) => {
            error!("Run failed: {:#}", e);
            1
        }
    });
}

async fn run(cli: Cli) -> Result<RunStatus> {
    let config = if cli.config.exists() {
        SystemConfig::load(&cli.config)?
    } else {
        info!(
            "Config file {} not found; using defaults",
            cli.config.display()
        );
        SystemConfig::default()
    };

    let supplier_name = supplier_name_from_url(&cli.supplier_url);
    let layout = OutputLayout::new(&cli.output_root);
    let page: Arc<dyn BrowserPage> =
        Arc::new(HttpPage::new(config.performance.timeout_seconds)?);
    let login: Arc<dyn SupplierLogin> = Arc::new(CredentialLogin {
        email: cli.supplier_email.clone(),
    });

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; flushing state before exit");
            let _ = cancel_tx.send(true);
        }
    });

    let options = RunOptions {
        supplier_url: cli.supplier_url.clone(),
        supplier_name,
        max_products: cli.max_products.unwrap_or(config.system.max_products),
        force_regenerate: cli.force_regenerate,
        resume: true,
    };

    let mut orchestrator =
        ExtractionOrchestrator::new(config, layout, page, None, login, cancel_rx)?;
    let outcome = orchestrator.run(&options).await?;

    info!(
        "Run finished with status {:?}: {} profitable results",
        outcome.status,
        outcome.profitable.len()
    );
    Ok(outcome.status)
}

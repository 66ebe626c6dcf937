use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use crate::models::{ProfitableResult, ResultsSummary};
use crate::paths::OutputLayout;

/// Per-run financial report: the qualifying tuples plus the run counters.
#[derive(Debug, Serialize, Deserialize)]
pub struct FinancialReport {
    pub supplier: String,
    pub session_id: String,
    pub generated: DateTime<Utc>,
    pub summary: ResultsSummary,
    pub profitable_results: Vec<ProfitableResult>,
}

impl FinancialReport {
    pub fn new(
        supplier: &str,
        session_id: &str,
        summary: ResultsSummary,
        profitable_results: Vec<ProfitableResult>,
    ) -> Self {
        Self {
            supplier: supplier.to_string(),
            session_id: session_id.to_string(),
            generated: Utc::now(),
            summary,
            profitable_results,
        }
    }

    /// Write the JSON report and a flat CSV summary beside it. Returns the
    /// JSON path.
    pub fn write(&self, layout: &OutputLayout) -> Result<PathBuf> {
        let dir = layout.financial_reports_dir(&self.supplier);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating report directory {}", dir.display()))?;

        let stamp = self.generated.format("%Y%m%d_%H%M%S");
        let json_path = dir.join(format!("fba_report_{}.json", stamp));
        std::fs::write(&json_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", json_path.display()))?;

        let csv_path = dir.join(format!("fba_report_{}.csv", stamp));
        std::fs::write(&csv_path, self.to_csv()?)
            .with_context(|| format!("writing {}", csv_path.display()))?;

        info!(
            "Financial report written: {} ({} profitable of {} analyzed)",
            json_path.display(),
            self.summary.products_profitable,
            self.summary.products_analyzed
        );
        Ok(json_path)
    }

    /// Flat CSV rendering of the profitable set.
    pub fn to_csv(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Row<'a> {
            supplier_title: &'a str,
            supplier_price: f64,
            supplier_ean: &'a str,
            asin: &'a str,
            amazon_title: &'a str,
            amazon_price: f64,
            estimated_fees: f64,
            profit_per_unit: f64,
            roi_percent: f64,
            estimated_monthly_sales: i64,
            match_quality: String,
            confidence: f64,
        }

        let mut writer = csv::Writer::from_writer(vec![]);
        for result in &self.profitable_results {
            writer.serialize(Row {
                supplier_title: &result.supplier_product.title,
                supplier_price: result.supplier_product.price,
                supplier_ean: result.supplier_product.ean.as_deref().unwrap_or(""),
                asin: &result.amazon_product.asin,
                amazon_title: &result.amazon_product.title,
                amazon_price: result.amazon_product.current_price.unwrap_or(0.0),
                estimated_fees: result.financial_metrics.estimated_amazon_fees,
                profit_per_unit: result.financial_metrics.estimated_profit_per_unit,
                roi_percent: result.financial_metrics.roi_percent_calculated,
                estimated_monthly_sales: result.financial_metrics.estimated_monthly_sales,
                match_quality: format!("{:?}", result.match_validation.match_quality),
                confidence: result.match_validation.confidence_score,
            })?;
        }
        Ok(String::from_utf8(writer.into_inner()?)?)
    }
}

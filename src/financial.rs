use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::config::CriteriaSettings;
use crate::models::{AmazonProduct, FinancialMetrics, MatchQuality};

const VAT_RATE: f64 = 0.20;
const REFERRAL_FEE_RATE: f64 = 0.15;
const MIN_FBA_FEE: f64 = 1.50;

const BATTERY_KEYWORDS: [&str; 7] = [
    "battery",
    "batteries",
    "cell",
    "cr20",
    "lr41",
    "lithium",
    "alkaline",
];

static FIRST_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)").expect("invalid number regex"));

static WEIGHT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([\d,.]+)\s*(kg|g\b|oz|pounds|lbs)").expect("invalid weight regex")
});

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Battery-family products are not FBA-friendly; they are rejected before
/// any financial work.
pub fn is_battery_title(title: &str) -> bool {
    let lower = title.to_lowercase();
    BATTERY_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// BSR-to-sales curve with category multipliers. Rank below 1 is invalid
/// and estimates zero.
pub fn estimate_sales_from_bsr(rank: i64, category: &str) -> i64 {
    if rank < 1 {
        return 0;
    }
    let category = category.to_lowercase();
    let groups: [(&[&str], f64); 6] = [
        (&["books", "kindle", "ebook"], 0.5),
        (&["electronics", "computers", "technology"], 1.2),
        (&["toys", "games"], 1.5),
        (&["grocery", "food", "consumable"], 2.0),
        (&["beauty", "health"], 1.8),
        (&["home", "kitchen", "garden"], 1.3),
    ];
    let multiplier = groups
        .iter()
        .find(|(terms, _)| terms.iter().any(|t| category.contains(t)))
        .map(|(_, m)| *m)
        .unwrap_or(1.0);

    let base = if rank < 100 {
        3000
    } else if rank < 500 {
        1000
    } else if rank < 1000 {
        500
    } else if rank < 5000 {
        100
    } else if rank < 10_000 {
        50
    } else if rank < 50_000 {
        20
    } else if rank < 100_000 {
        10
    } else {
        5
    };
    (base as f64 * multiplier) as i64
}

fn parse_weight_grams(weight_text: &str) -> Option<f64> {
    let caps = WEIGHT_RE.captures(weight_text)?;
    let value: f64 = caps[1].replace(',', ".").parse().ok()?;
    let grams = match caps[2].to_lowercase().as_str() {
        "kg" => value * 1000.0,
        "g" => value,
        "oz" => value * 28.35,
        "pounds" | "lbs" => value * 453.6,
        _ => return None,
    };
    Some(grams)
}

/// Fallback FBA pick/pack estimate from size tier, weight and category,
/// floored at the minimum fee. Used only when Keepa carries no fee.
pub fn estimate_fba_fee(amazon: &AmazonProduct) -> f64 {
    // Size tier from the details-table dimension text; parcels default to
    // medium when nothing is parseable.
    let dims_lower = amazon
        .dimensions_text
        .as_deref()
        .unwrap_or("")
        .to_lowercase();
    let mut size_tier = "standard_parcel_medium";
    if dims_lower.contains("envelope") {
        size_tier = "small_envelope";
    } else if dims_lower.contains("large") {
        size_tier = "standard_parcel_large";
    }

    let mut fee = match size_tier {
        "small_envelope" => 1.90,
        "standard_parcel_small" => 2.70,
        "standard_parcel_medium" => 3.80,
        "standard_parcel_large" => 4.90,
        "standard_parcel_xlarge" => 6.50,
        _ => 3.50,
    };

    if let Some(grams) = amazon.weight_text.as_deref().and_then(parse_weight_grams) {
        if grams > 1000.0 {
            fee += ((grams - 1000.0) / 1000.0).ceil() * 0.25;
        }
    }

    let category = amazon.category.as_deref().unwrap_or("").to_lowercase();
    if category.contains("toys") || category.contains("games") {
        fee *= 1.1;
    }

    round2(fee.max(MIN_FBA_FEE))
}

/// Sales velocity precedence: overlay text, then AI-vision overlay text,
/// then the BSR curve.
fn estimate_monthly_sales(amazon: &AmazonProduct) -> i64 {
    let from_text = |text: &str| -> Option<i64> {
        FIRST_NUMBER_RE
            .captures(text)
            .and_then(|c| c[1].parse::<i64>().ok())
    };

    if let Some(sales) = amazon
        .sales_velocity
        .estimated_monthly_sales_from_text
        .as_deref()
        .and_then(from_text)
    {
        debug!("Monthly sales from overlay text: {}", sales);
        return sales;
    }
    if let Some(sales) = amazon
        .sales_velocity
        .estimated_monthly_sales_ai_vision
        .as_deref()
        .and_then(from_text)
    {
        debug!("Monthly sales from AI vision overlay: {}", sales);
        return sales;
    }
    match amazon.sales_rank {
        Some(rank) if rank > 0 => {
            let sales =
                estimate_sales_from_bsr(rank, amazon.category.as_deref().unwrap_or(""));
            debug!("Monthly sales from BSR {}: {}", rank, sales);
            sales
        }
        _ => 0,
    }
}

/// Why a tuple failed the criteria gate. Reason strings feed the rejection
/// counters in the run summary.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Pass,
    Fail(&'static str),
}

impl GateOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, GateOutcome::Pass)
    }
}

/// Deterministic fee/ROI evaluator plus the criteria gate.
#[derive(Debug, Clone)]
pub struct FinancialCalculator {
    criteria: CriteriaSettings,
}

impl FinancialCalculator {
    pub fn new(criteria: CriteriaSettings) -> Self {
        Self { criteria }
    }

    /// Compute the full metrics for a supplier price and Amazon listing.
    /// Invalid or missing prices produce all-zero metrics.
    pub fn compute(&self, supplier_price: f64, amazon: &AmazonProduct) -> FinancialMetrics {
        let mut metrics = FinancialMetrics::default();
        let amazon_price = amazon.current_price.unwrap_or(0.0);
        if supplier_price <= 0.0 || amazon_price <= 0.0 {
            debug!("Cannot compute ROI: missing supplier or Amazon price");
            return metrics;
        }

        metrics.supplier_cost_price = supplier_price;
        metrics.amazon_selling_price = amazon_price;

        let cost_ex_vat = supplier_price / (1.0 + VAT_RATE);
        metrics.vat_on_purchase_estimated = round2(supplier_price - cost_ex_vat);
        metrics
            .costs_breakdown
            .insert("supplier_price_incl_vat".to_string(), supplier_price);
        metrics
            .costs_breakdown
            .insert("supplier_price_ex_vat".to_string(), round2(cost_ex_vat));
        metrics.costs_breakdown.insert(
            "supplier_vat".to_string(),
            metrics.vat_on_purchase_estimated,
        );

        let amazon_price_ex_vat = amazon_price / (1.0 + VAT_RATE);
        metrics.vat_on_sale_estimated = round2(amazon_price - amazon_price_ex_vat);
        metrics
            .revenue_breakdown
            .insert("amazon_price_incl_vat".to_string(), amazon_price);
        metrics.revenue_breakdown.insert(
            "amazon_price_ex_vat".to_string(),
            round2(amazon_price_ex_vat),
        );
        metrics
            .revenue_breakdown
            .insert("amazon_vat".to_string(), metrics.vat_on_sale_estimated);

        let referral_fee = round2(amazon_price_ex_vat * REFERRAL_FEE_RATE);
        metrics
            .costs_breakdown
            .insert("amazon_referral_fee".to_string(), referral_fee);

        let fba_fee = match amazon
            .keepa
            .as_ref()
            .and_then(|k| k.details_number("FBA Pick&Pack Fee"))
        {
            Some(fee) if fee > 0.0 => {
                debug!("Using FBA fee from Keepa data: £{:.2}", fee);
                fee
            }
            _ => {
                let estimated = estimate_fba_fee(amazon);
                debug!("Using estimated FBA fee: £{:.2}", estimated);
                estimated
            }
        };
        metrics
            .costs_breakdown
            .insert("fba_fee".to_string(), round2(fba_fee));

        let fees_total = referral_fee + fba_fee;
        metrics.estimated_amazon_fees = round2(fees_total);

        let profit = amazon_price_ex_vat - cost_ex_vat - fees_total;
        metrics.estimated_profit_per_unit = round2(profit);
        metrics.roi_percent_calculated = if cost_ex_vat > 0.0 {
            round2(profit / cost_ex_vat * 100.0)
        } else {
            0.0
        };

        let monthly_sales = estimate_monthly_sales(amazon);
        if monthly_sales > 0 {
            metrics.estimated_monthly_sales = monthly_sales;
            metrics.estimated_monthly_profit =
                round2(metrics.estimated_profit_per_unit * monthly_sales as f64);
        }

        debug!(
            "Financials for '{}': cost ex-VAT £{:.2}, sell ex-VAT £{:.2}, fees £{:.2}, profit £{:.2}, ROI {:.1}%",
            amazon.title,
            cost_ex_vat,
            amazon_price_ex_vat,
            fees_total,
            profit,
            metrics.roi_percent_calculated
        );
        metrics
    }

    /// Cheap screen before the full financial pass: battery filter, then a
    /// net/ROI estimate from the Keepa fee pair. Unknown buy-box price
    /// passes through to the full evaluation.
    pub fn quick_triage(&self, supplier_price: f64, amazon: &AmazonProduct) -> bool {
        if is_battery_title(&amazon.title) {
            debug!("Battery product filtered in triage: {}", amazon.title);
            return false;
        }
        let buy_box = match amazon.current_price {
            Some(price) if price > 0.0 => price,
            _ => return true,
        };
        let keepa_fees = amazon
            .keepa
            .as_ref()
            .map(|k| {
                k.details_number("Referral Fee based on current Buy Box price")
                    .unwrap_or(0.0)
                    + k.details_number("FBA Pick&Pack Fee").unwrap_or(0.0)
            })
            .unwrap_or(0.0);
        let net = buy_box - keepa_fees - supplier_price;
        let roi = if supplier_price > 0.0 {
            net / supplier_price * 100.0
        } else {
            0.0
        };
        net >= self.criteria.min_profit_per_unit && roi >= self.criteria.min_roi_percent
    }

    /// The criteria gate. Every threshold comes from configuration; the
    /// outcome is fully deterministic in its inputs.
    pub fn meets_criteria(
        &self,
        metrics: &FinancialMetrics,
        amazon: &AmazonProduct,
        match_quality: MatchQuality,
    ) -> GateOutcome {
        if metrics.roi_percent_calculated < self.criteria.min_roi_percent {
            return GateOutcome::Fail("roi_below_minimum");
        }
        if metrics.estimated_profit_per_unit < self.criteria.min_profit_per_unit {
            return GateOutcome::Fail("profit_below_minimum");
        }
        if amazon.rating.unwrap_or(0.0) < self.criteria.min_rating {
            return GateOutcome::Fail("rating_below_minimum");
        }
        if amazon.review_count.unwrap_or(0) < self.criteria.min_reviews {
            return GateOutcome::Fail("reviews_below_minimum");
        }
        match amazon.sales_rank {
            Some(rank) if rank > 0 && rank <= self.criteria.max_sales_rank => {}
            _ => return GateOutcome::Fail("sales_rank_out_of_range"),
        }
        if !amazon.in_stock {
            return GateOutcome::Fail("out_of_stock");
        }
        if amazon.sold_by_amazon {
            return GateOutcome::Fail("sold_by_amazon");
        }
        if amazon.main_image.is_none() {
            return GateOutcome::Fail("no_main_image");
        }
        if match_quality == MatchQuality::Low {
            return GateOutcome::Fail("low_match_quality");
        }
        info!("Product '{}' meets all criteria", amazon.title);
        GateOutcome::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KeepaData;
    use serde_json::json;

    fn amazon_with_price(price: f64) -> AmazonProduct {
        let mut product = AmazonProduct::new("B01ABCDEFG", "Acme Widget 4 Pack (New)");
        product.current_price = Some(price);
        product.rating = Some(4.4);
        product.review_count = Some(120);
        product.sales_rank = Some(20_000);
        product.in_stock = true;
        product.main_image = Some("https://img.example/x.jpg".to_string());
        product
    }

    fn keepa_with_fee(fee: f64) -> KeepaData {
        let mut keepa = KeepaData::default();
        keepa
            .product_details_tab_data
            .insert("FBA Pick&Pack Fee".to_string(), json!(fee));
        keepa
    }

    #[test]
    fn roi_arithmetic_matches_hand_computation() {
        let calc = FinancialCalculator::new(CriteriaSettings::default());
        let mut amazon = amazon_with_price(12.99);
        amazon.keepa = Some(keepa_with_fee(3.80));

        let metrics = calc.compute(4.99, &amazon);

        let cost_ex = 4.99 / 1.2;
        let sell_ex = 12.99 / 1.2;
        let fees = round2(sell_ex * 0.15) + 3.80;
        let profit = sell_ex - cost_ex - fees;
        let roi = profit / cost_ex * 100.0;

        assert!((metrics.estimated_profit_per_unit - round2(profit)).abs() < 0.011);
        assert!((metrics.roi_percent_calculated - roi).abs() < 0.5);
        // Scenario arithmetic: ROI lands near 28%, below the default gate.
        assert!(metrics.roi_percent_calculated > 25.0);
        assert!(metrics.roi_percent_calculated < 35.0);
    }

    #[test]
    fn missing_price_yields_zero_metrics() {
        let calc = FinancialCalculator::new(CriteriaSettings::default());
        let mut amazon = amazon_with_price(12.99);
        amazon.current_price = None;
        let metrics = calc.compute(4.99, &amazon);
        assert_eq!(metrics.roi_percent_calculated, 0.0);
        assert_eq!(metrics.estimated_profit_per_unit, 0.0);
    }

    #[test]
    fn keepa_fee_preferred_over_estimate() {
        let calc = FinancialCalculator::new(CriteriaSettings::default());
        let mut amazon = amazon_with_price(20.0);
        amazon.keepa = Some(keepa_with_fee(2.10));
        let metrics = calc.compute(5.0, &amazon);
        assert_eq!(metrics.costs_breakdown.get("fba_fee"), Some(&2.10));
    }

    #[test]
    fn fba_fee_estimate_has_floor() {
        let amazon = AmazonProduct::new("B01ABCDEFG", "Tiny Thing");
        assert!(estimate_fba_fee(&amazon) >= MIN_FBA_FEE);
    }

    #[test]
    fn bsr_curve_and_multipliers() {
        assert_eq!(estimate_sales_from_bsr(0, ""), 0);
        assert_eq!(estimate_sales_from_bsr(-5, "toys"), 0);
        assert_eq!(estimate_sales_from_bsr(50, ""), 3000);
        assert_eq!(estimate_sales_from_bsr(20_000, ""), 20);
        assert_eq!(estimate_sales_from_bsr(20_000, "Toys & Games"), 30);
        assert_eq!(estimate_sales_from_bsr(20_000, "Books"), 10);
        assert_eq!(estimate_sales_from_bsr(20_000, "Grocery"), 40);
        assert_eq!(estimate_sales_from_bsr(500_000, ""), 5);
    }

    #[test]
    fn sales_velocity_precedence() {
        let calc = FinancialCalculator::new(CriteriaSettings::default());
        let mut amazon = amazon_with_price(12.99);
        amazon.sales_velocity.estimated_monthly_sales_from_text =
            Some("~150 sold last month".to_string());
        let metrics = calc.compute(4.99, &amazon);
        assert_eq!(metrics.estimated_monthly_sales, 150);

        amazon.sales_velocity.estimated_monthly_sales_from_text = None;
        amazon.sales_velocity.estimated_monthly_sales_ai_vision = Some("90/mo".to_string());
        let metrics = calc.compute(4.99, &amazon);
        assert_eq!(metrics.estimated_monthly_sales, 90);

        amazon.sales_velocity.estimated_monthly_sales_ai_vision = None;
        let metrics = calc.compute(4.99, &amazon);
        assert_eq!(metrics.estimated_monthly_sales, 20);
    }

    #[test]
    fn battery_titles_fail_triage() {
        let calc = FinancialCalculator::new(CriteriaSettings::default());
        let amazon = {
            let mut a = amazon_with_price(12.99);
            a.title = "AA Alkaline Batteries 12 Pack".to_string();
            a
        };
        assert!(!calc.quick_triage(2.0, &amazon));
        assert!(is_battery_title("CR2032 Lithium Cell"));
        assert!(!is_battery_title("Garden Hose Reel"));
    }

    #[test]
    fn triage_passes_when_price_unknown() {
        let calc = FinancialCalculator::new(CriteriaSettings::default());
        let mut amazon = amazon_with_price(12.99);
        amazon.current_price = None;
        assert!(calc.quick_triage(2.0, &amazon));
    }

    #[test]
    fn gate_rejects_sold_by_amazon() {
        let calc = FinancialCalculator::new(CriteriaSettings::default());
        let mut amazon = amazon_with_price(25.0);
        amazon.sold_by_amazon = true;
        let metrics = calc.compute(4.0, &amazon);
        let outcome = calc.meets_criteria(&metrics, &amazon, MatchQuality::High);
        assert_eq!(outcome, GateOutcome::Fail("sold_by_amazon"));
    }

    #[test]
    fn gate_rejects_low_roi() {
        let calc = FinancialCalculator::new(CriteriaSettings::default());
        let mut amazon = amazon_with_price(12.99);
        amazon.keepa = Some(keepa_with_fee(3.80));
        let metrics = calc.compute(4.99, &amazon);
        let outcome = calc.meets_criteria(&metrics, &amazon, MatchQuality::High);
        assert_eq!(outcome, GateOutcome::Fail("roi_below_minimum"));
    }

    #[test]
    fn gate_accepts_qualifying_tuple() {
        let calc = FinancialCalculator::new(CriteriaSettings::default());
        let mut amazon = amazon_with_price(29.99);
        amazon.keepa = Some(keepa_with_fee(2.50));
        let metrics = calc.compute(4.99, &amazon);
        assert!(metrics.roi_percent_calculated >= 35.0);
        let outcome = calc.meets_criteria(&metrics, &amazon, MatchQuality::High);
        assert_eq!(outcome, GateOutcome::Pass);
    }

    #[test]
    fn gate_rejects_low_match_quality_and_missing_rank() {
        let calc = FinancialCalculator::new(CriteriaSettings::default());
        let mut amazon = amazon_with_price(29.99);
        amazon.keepa = Some(keepa_with_fee(2.50));
        let metrics = calc.compute(4.99, &amazon);
        assert_eq!(
            calc.meets_criteria(&metrics, &amazon, MatchQuality::Low),
            GateOutcome::Fail("low_match_quality")
        );
        amazon.sales_rank = None;
        assert_eq!(
            calc.meets_criteria(&metrics, &amazon, MatchQuality::High),
            GateOutcome::Fail("sales_rank_out_of_range")
        );
    }
}

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::ai::{truncate_for_prompt, AiClient};
use crate::models::{
    AiDecision, AmazonProduct, MatchQuality, MatchValidation, SupplierProduct,
};

/// Structural stop words plus promotional fluff, both stripped before any
/// similarity layer runs.
static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "and", "or", "with", "for", "in", "on", "at", "by", "from", "new",
        "sale", "offer", "deal", "hot", "best", "top", "premium", "quality", "great", "amazing",
        "perfect", "ultimate", "professional", "classic", "original", "genuine", "authentic",
        "official", "branded",
    ]
    .into_iter()
    .collect()
});

/// Known brand vocabulary for the highest-weight layer.
static BRAND_INDICATORS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "apple", "samsung", "sony", "nike", "adidas", "lego", "disney", "microsoft",
    ]
    .into_iter()
    .collect()
});

static MODEL_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z0-9]+\b").expect("invalid model token regex"));

static NON_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s]").expect("invalid non-word regex"));

const PACKAGE_INDICATORS: [&str; 7] = ["pack", "set", "box", "bundle", "kit", "pieces", "pcs"];

/// Lowercase, drop stop words and anything shorter than three characters.
pub fn preprocess_title(title: &str) -> Vec<String> {
    title
        .to_lowercase()
        .split_whitespace()
        .filter(|w| !STOP_WORDS.contains(w) && w.len() > 2)
        .map(str::to_string)
        .collect()
}

fn package_tokens(words: &[String]) -> HashSet<String> {
    let mut tokens = HashSet::new();
    for (i, word) in words.iter().enumerate() {
        let stripped: String = word.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        if !PACKAGE_INDICATORS.contains(&stripped.as_str()) {
            continue;
        }
        if i > 0 && words[i - 1].chars().all(|c| c.is_ascii_digit()) {
            tokens.insert(format!("{}_{}", words[i - 1], stripped));
        } else if i + 1 < words.len() && words[i + 1].chars().all(|c| c.is_ascii_digit()) {
            tokens.insert(format!("{}_{}", words[i + 1], stripped));
        }
    }
    tokens
}

fn jaccard<T: std::hash::Hash + Eq>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn intersection_over_max<T: std::hash::Hash + Eq>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    let max = a.len().max(b.len());
    if max == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / max as f64
}

/// Multi-layer weighted title similarity in [0,1], quantised to 3 dp.
/// Layers: brand 0.40, model/product-code 0.30, package size 0.20,
/// residual word overlap 0.10. The score is normalised over the layers
/// that could actually fire (the brand layer only enters the denominator
/// when both titles carry known brand words), and pairs sharing at least
/// three non-stop tokens at an already-high score get a deterministic
/// boost clamped to 0.95.
pub fn title_similarity(title_a: &str, title_b: &str) -> f64 {
    if title_a.is_empty() || title_b.is_empty() {
        return 0.0;
    }
    let words_a = preprocess_title(title_a);
    let words_b = preprocess_title(title_b);
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }

    let mut score = 0.0;
    let mut max_possible = 0.0;

    let brands_a: HashSet<&str> = words_a
        .iter()
        .map(String::as_str)
        .filter(|w| BRAND_INDICATORS.contains(w))
        .collect();
    let brands_b: HashSet<&str> = words_b
        .iter()
        .map(String::as_str)
        .filter(|w| BRAND_INDICATORS.contains(w))
        .collect();
    if !brands_a.is_empty() && !brands_b.is_empty() {
        score += intersection_over_max(&brands_a, &brands_b) * 0.40;
        max_possible += 0.40;
    }

    let models_a: HashSet<String> = MODEL_TOKEN_RE
        .find_iter(&words_a.join(" ").to_uppercase())
        .map(|m| m.as_str().to_string())
        .collect();
    let models_b: HashSet<String> = MODEL_TOKEN_RE
        .find_iter(&words_b.join(" ").to_uppercase())
        .map(|m| m.as_str().to_string())
        .collect();
    score += intersection_over_max(&models_a, &models_b) * 0.30;
    max_possible += 0.30;

    let package_a = package_tokens(&words_a);
    let package_b = package_tokens(&words_b);
    if !package_a.is_empty() && !package_b.is_empty() {
        score += intersection_over_max(&package_a, &package_b) * 0.20;
    } else if package_a.is_empty() && package_b.is_empty() {
        // No package info on either side reads as agreement.
        score += 0.20;
    }
    max_possible += 0.20;

    let set_a: HashSet<&str> = words_a.iter().map(String::as_str).collect();
    let set_b: HashSet<&str> = words_b.iter().map(String::as_str).collect();
    let intersection = set_a.intersection(&set_b).count();
    score += jaccard(&set_a, &set_b) * 0.10;
    max_possible += 0.10;

    let mut final_score = if max_possible > 0.0 {
        score / max_possible
    } else {
        0.0
    };

    if intersection >= 3 && final_score >= 0.7 {
        final_score = (final_score + 0.15).min(0.95);
    }

    (final_score * 1000.0).round() / 1000.0
}

/// Asymmetric word-overlap score used for EAN-search disambiguation:
/// the share of the first title's words found in the second.
pub fn overlap_score(title_a: &str, title_b: &str) -> f64 {
    let norm = |t: &str| -> HashSet<String> {
        NON_WORD_RE
            .replace_all(&t.to_lowercase(), " ")
            .split_whitespace()
            .map(str::to_string)
            .collect()
    };
    let a = norm(title_a);
    let b = norm(title_b);
    a.intersection(&b).count() as f64 / a.len().max(1) as f64
}

fn longest_common_block(a: &[u8], b: &[u8]) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_len) = (0, 0, 0);
    let mut dp = vec![0usize; b.len() + 1];
    for i in 0..a.len() {
        let mut prev = 0;
        for j in 0..b.len() {
            let carried = dp[j + 1];
            if a[i] == b[j] {
                dp[j + 1] = prev + 1;
                if dp[j + 1] > best_len {
                    best_len = dp[j + 1];
                    best_i = i + 1 - best_len;
                    best_j = j + 1 - best_len;
                }
            } else {
                dp[j + 1] = 0;
            }
            prev = carried;
        }
    }
    (best_i, best_j, best_len)
}

fn matched_chars(a: &[u8], b: &[u8]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let (i, j, len) = longest_common_block(a, b);
    if len == 0 {
        return 0;
    }
    len + matched_chars(&a[..i], &b[..j]) + matched_chars(&a[i + len..], &b[j + len..])
}

/// Ratcliff/Obershelp similarity of two strings in [0,1].
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let a = a.as_bytes();
    let b = b.as_bytes();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matched_chars(a, b) as f64 / total as f64
}

const BRAND_SIMILARITY_THRESHOLD: f64 = 0.85;

fn quantise(score: f64) -> f64 {
    (score.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}

fn classify(confidence: f64) -> MatchQuality {
    if confidence >= 0.75 {
        MatchQuality::High
    } else if confidence >= 0.45 {
        MatchQuality::Medium
    } else {
        MatchQuality::Low
    }
}

/// Matcher over one (supplier, Amazon) pair. The AI client, when present,
/// only breaks ties on medium-quality matches.
pub struct Matcher {
    ai: Option<Arc<dyn AiClient>>,
}

impl Matcher {
    pub fn new(ai: Option<Arc<dyn AiClient>>) -> Self {
        Self { ai }
    }

    /// Deterministic match decision: EAN, brand and title checks roll up
    /// into a confidence score, classified against fixed thresholds.
    pub fn evaluate(
        &self,
        supplier: &SupplierProduct,
        amazon: &AmazonProduct,
    ) -> MatchValidation {
        let mut score: f64 = 0.0;
        let mut reasons = Vec::new();
        let mut checks = Vec::new();
        let mut title_sim = None;

        let amazon_gtin = amazon.ean_on_page();
        match (&supplier.ean, amazon_gtin) {
            (Some(supplier_ean), Some(amazon_ean)) => {
                checks.push("EAN/GTIN".to_string());
                if supplier_ean == amazon_ean {
                    score += 0.60;
                    reasons.push(format!("EAN exact match: {}", supplier_ean));
                } else {
                    score -= 0.20;
                    reasons.push(format!(
                        "EAN mismatch: supplier {}, Amazon {}",
                        supplier_ean, amazon_ean
                    ));
                }
            }
            (Some(supplier_ean), None) => {
                checks.push("EAN/GTIN".to_string());
                reasons.push(format!(
                    "Supplier EAN {} present, but no comparable EAN/GTIN found on Amazon page",
                    supplier_ean
                ));
            }
            _ => {}
        }

        let supplier_brand = supplier.brand.as_deref().map(|b| b.trim().to_lowercase());
        let amazon_brand = amazon.brand.as_deref().map(|b| b.trim().to_lowercase());
        if let (Some(sb), Some(ab)) = (&supplier_brand, &amazon_brand) {
            if !sb.is_empty() && !ab.is_empty() {
                checks.push("Brand".to_string());
                let brand_similarity = sequence_ratio(sb, ab);
                if brand_similarity >= BRAND_SIMILARITY_THRESHOLD {
                    score += 0.25;
                    reasons.push(format!(
                        "Brand match ({:.2}): '{}' vs '{}'",
                        brand_similarity, sb, ab
                    ));
                } else {
                    reasons.push(format!(
                        "Brand mismatch ({:.2}): supplier '{}', Amazon '{}'",
                        brand_similarity, sb, ab
                    ));
                }
            }
        }

        if !supplier.title.is_empty() && !amazon.title.is_empty() {
            checks.push("Title".to_string());
            let similarity = title_similarity(&supplier.title, &amazon.title);
            title_sim = Some(similarity);
            if similarity >= 0.75 {
                score += 0.15;
                reasons.push(format!("High title similarity ({:.1}%)", similarity * 100.0));
            } else if similarity >= 0.50 {
                score += 0.05;
                reasons.push(format!(
                    "Medium title similarity ({:.1}%)",
                    similarity * 100.0
                ));
            } else {
                score -= 0.10;
                reasons.push(format!("Low title similarity ({:.1}%)", similarity * 100.0));
            }
        }

        // Title-only pairs (no GTIN on either side, no brand pair) would
        // otherwise be capped at 0.15; there the similarity score itself is
        // the best confidence signal available.
        let title_only = checks.iter().all(|c| c == "Title");
        let mut confidence = quantise(score);
        if title_only {
            if let Some(similarity) = title_sim {
                confidence = quantise(confidence.max(similarity));
            }
        }

        MatchValidation {
            match_quality: classify(confidence),
            confidence_score: confidence,
            reasons,
            checks_performed: checks,
            title_similarity_score: title_sim,
            ai_validation_decision: None,
        }
    }

    /// Full validation: the deterministic decision, then the AI tie-breaker
    /// for medium-quality matches when a client is configured.
    pub async fn validate_match(
        &self,
        supplier: &SupplierProduct,
        amazon: &AmazonProduct,
    ) -> MatchValidation {
        let mut validation = self.evaluate(supplier, amazon);
        if validation.match_quality != MatchQuality::Medium {
            return validation;
        }
        let Some(ai) = self.ai.as_ref() else {
            return validation;
        };

        info!(
            "Medium match ({:.2}) for ASIN {}; invoking AI validation",
            validation.confidence_score, amazon.asin
        );
        let prompt = format!(
            "Assess if the following two products are likely the same. Respond with only \
             'MATCH', 'MISMATCH', or 'UNCERTAIN'.\n\n\
             Supplier product:\nTitle: {}\nBrand: {}\nEAN: {}\nPrice: {:.2}\nDescription: {}\n\n\
             Amazon product:\nTitle: {}\nBrand: {}\nASIN: {}\nEAN on page: {}\nDescription: {}",
            supplier.title,
            supplier.brand.as_deref().unwrap_or("N/A"),
            supplier.ean.as_deref().unwrap_or("N/A"),
            supplier.price,
            truncate_for_prompt(supplier.description.as_deref().unwrap_or("N/A"), 200),
            amazon.title,
            amazon.brand.as_deref().unwrap_or("N/A"),
            amazon.asin,
            amazon.ean_on_page().unwrap_or("N/A"),
            truncate_for_prompt(amazon.description.as_deref().unwrap_or("N/A"), 200),
        );

        match ai.complete(&prompt).await {
            Ok(answer) => {
                let decision = match answer.trim().to_uppercase().as_str() {
                    "MATCH" => AiDecision::Match,
                    "MISMATCH" => AiDecision::Mismatch,
                    _ => AiDecision::Uncertain,
                };
                validation.ai_validation_decision = Some(decision);
                validation.reasons.push(format!("AI validation: {:?}", decision));
                match decision {
                    AiDecision::Match => {
                        validation.match_quality = MatchQuality::High;
                        validation.confidence_score =
                            quantise(validation.confidence_score.max(0.80));
                    }
                    AiDecision::Mismatch => {
                        validation.match_quality = MatchQuality::Low;
                        validation.confidence_score =
                            quantise(validation.confidence_score.min(0.20));
                    }
                    AiDecision::Uncertain => {}
                }
            }
            Err(e) => {
                warn!("AI validation failed for ASIN {}: {}", amazon.asin, e);
                validation
                    .reasons
                    .push(format!("AI validation error: {}", e));
            }
        }
        validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::test_support::ScriptedAi;
    use crate::models::DataSource;
    use chrono::Utc;

    fn supplier(title: &str, ean: Option<&str>, brand: Option<&str>) -> SupplierProduct {
        SupplierProduct {
            title: title.to_string(),
            price: 4.99,
            url: "https://supplier.example/p".to_string(),
            image_url: None,
            ean: ean.map(str::to_string),
            upc: None,
            sku: None,
            brand: brand.map(str::to_string),
            description: None,
            source_supplier: "supplier.example".to_string(),
            source_category_url: "https://supplier.example/c".to_string(),
            extraction_timestamp: Utc::now(),
        }
    }

    fn amazon(title: &str, ean: Option<&str>, brand: Option<&str>) -> AmazonProduct {
        let mut product = AmazonProduct::new("B01ABCDEFG", title);
        if let Some(ean) = ean {
            product.eans_on_page.insert(ean.to_string());
        }
        product.brand = brand.map(str::to_string);
        product.source = DataSource::Fresh;
        product
    }

    #[test]
    fn similarity_is_symmetric() {
        let pairs = [
            ("Acme Widget 4-Pack", "Acme Widget 4 Pack (New)"),
            ("LEGO City Police Set 60312", "lego police set 60312"),
            ("Bluebell Soy Candle 200g", "Rose Gold Candle Holder"),
        ];
        for (a, b) in pairs {
            assert!((title_similarity(a, b) - title_similarity(b, a)).abs() < 1e-9);
        }
    }

    #[test]
    fn similarity_bounds_and_identity() {
        let s = title_similarity("Acme Widget 4-Pack", "Acme Widget 4-Pack");
        assert!(s > 0.5 && s <= 1.0);
        assert_eq!(title_similarity("", "anything"), 0.0);
        let unrelated = title_similarity("Garden Hose Reel", "USB Charging Cable");
        assert!(unrelated < 0.45);
    }

    #[test]
    fn package_agreement_scores_when_both_absent() {
        // Neither title has package info, both share core words.
        let s = title_similarity("Bluebell Soy Candle 200g", "Bluebell Soy Candle 200g Jar");
        assert!(s >= 0.5, "score was {}", s);
    }

    #[test]
    fn overlap_score_measures_supplier_coverage() {
        let full = overlap_score("Acme Widget", "Acme Widget 4 Pack");
        assert!((full - 1.0).abs() < 1e-9);
        let none = overlap_score("Acme Widget", "Rose Candle");
        assert_eq!(none, 0.0);
    }

    #[test]
    fn sequence_ratio_matches_known_values() {
        assert!((sequence_ratio("abc", "abc") - 1.0).abs() < 1e-9);
        assert_eq!(sequence_ratio("abc", "xyz"), 0.0);
        let r = sequence_ratio("acme", "acne");
        assert!(r > 0.5 && r < 1.0);
    }

    #[test]
    fn ean_exact_match_is_high() {
        let matcher = Matcher::new(None);
        let validation = matcher.evaluate(
            &supplier("Acme Widget 4-Pack", Some("5000000000012"), None),
            &amazon("Acme Widget 4 Pack (New)", Some("5000000000012"), None),
        );
        assert_eq!(validation.match_quality, MatchQuality::High);
        assert!(validation.confidence_score >= 0.75);
        assert!(validation
            .checks_performed
            .contains(&"EAN/GTIN".to_string()));
    }

    #[test]
    fn ean_mismatch_penalised() {
        let matcher = Matcher::new(None);
        let validation = matcher.evaluate(
            &supplier("Acme Widget", Some("5000000000012"), None),
            &amazon("Acme Widget", Some("4000000000019"), None),
        );
        assert_eq!(validation.match_quality, MatchQuality::Low);
        assert!(validation.reasons.iter().any(|r| r.contains("EAN mismatch")));
    }

    #[test]
    fn title_only_pair_uses_similarity_as_confidence_floor() {
        let matcher = Matcher::new(None);
        let validation = matcher.evaluate(
            &supplier("Bluebell Soy Candle 200g", None, None),
            &amazon("Bluebell Soy Wax Candle 200g Jar", None, None),
        );
        let sim = validation.title_similarity_score.unwrap();
        assert!(validation.confidence_score >= sim);
        assert_eq!(validation.checks_performed, vec!["Title".to_string()]);
    }

    #[test]
    fn confidence_always_in_unit_interval() {
        let matcher = Matcher::new(None);
        let cases = [
            (
                supplier("Acme Widget", Some("5000000000012"), Some("acme")),
                amazon("Acme Widget", Some("5000000000012"), Some("acme")),
            ),
            (
                supplier("Totally Different", Some("5000000000012"), Some("acme")),
                amazon("Unrelated Thing", Some("4000000000019"), Some("zorg")),
            ),
        ];
        for (s, a) in cases {
            let v = matcher.evaluate(&s, &a);
            assert!((0.0..=1.0).contains(&v.confidence_score));
            let expected = classify(v.confidence_score);
            assert_eq!(v.match_quality, expected);
        }
    }

    #[tokio::test]
    async fn ai_match_promotes_medium_to_high() {
        let ai: Arc<dyn AiClient> = Arc::new(ScriptedAi::new(vec!["MATCH"]));
        let matcher = Matcher::new(Some(ai));
        // Title-only pair in the medium band.
        let validation = matcher
            .validate_match(
                &supplier("Bluebell Soy Candle 200g", None, None),
                &amazon("Bluebell Candle Gift Jar Large", None, None),
            )
            .await;
        assert_eq!(validation.match_quality, MatchQuality::High);
        assert!(validation.confidence_score >= 0.80);
        assert_eq!(validation.ai_validation_decision, Some(AiDecision::Match));
    }

    #[tokio::test]
    async fn ai_mismatch_demotes_to_low() {
        let ai: Arc<dyn AiClient> = Arc::new(ScriptedAi::new(vec!["MISMATCH"]));
        let matcher = Matcher::new(Some(ai));
        let validation = matcher
            .validate_match(
                &supplier("Bluebell Soy Candle 200g", None, None),
                &amazon("Bluebell Candle Gift Jar Large", None, None),
            )
            .await;
        assert_eq!(validation.match_quality, MatchQuality::Low);
        assert!(validation.confidence_score <= 0.20);
    }

    #[tokio::test]
    async fn ai_failure_leaves_validation_unchanged() {
        let ai: Arc<dyn AiClient> = Arc::new(ScriptedAi::new(vec![]));
        let matcher = Matcher::new(Some(ai));
        let validation = matcher
            .validate_match(
                &supplier("Bluebell Soy Candle 200g", None, None),
                &amazon("Bluebell Candle Gift Jar Large", None, None),
            )
            .await;
        assert_eq!(validation.match_quality, MatchQuality::Medium);
        assert!(validation.ai_validation_decision.is_none());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{error, info};

use crate::models::LinkingRecord;
use crate::paths::OutputLayout;

const MIN_CACHED_PRODUCTS: usize = 5;

/// `cached_products.json`: the aggregated product snapshot for the run.
/// Products may be keyed by identifier (map) or listed as an array.
#[derive(Debug, Serialize, Deserialize)]
pub struct CachedProductsArtifact {
    pub products: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// `ai_category_cache.json`: the category-suggestion history for the run.
#[derive(Debug, Serialize, Deserialize)]
pub struct AiCategoryCacheArtifact {
    pub supplier: String,
    pub created: DateTime<Utc>,
    pub ai_suggestion_history: Vec<AiSuggestionEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AiSuggestionEntry {
    pub timestamp: DateTime<Utc>,
    pub ai_suggestions: AiSuggestions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AiSuggestions {
    pub top_3_urls: Vec<String>,
}

/// Result of validating the run artifacts. A failed verification carries
/// human-readable reasons and blocks `mark_ready`.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub ok: bool,
    pub issues: Vec<String>,
}

impl VerificationReport {
    fn fail(issues: Vec<String>) -> Self {
        Self { ok: false, issues }
    }

    fn pass() -> Self {
        Self {
            ok: true,
            issues: Vec::new(),
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, issues: &mut Vec<String>) -> Option<T> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            issues.push(format!("{}: unreadable ({})", path.display(), e));
            return None;
        }
    };
    match serde_json::from_str::<T>(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            issues.push(format!("{}: schema mismatch ({})", path.display(), e));
            None
        }
    }
}

fn validate_cached_products(layout: &OutputLayout, issues: &mut Vec<String>) {
    let path = layout.cached_products_artifact();
    let Some(artifact) = read_json::<CachedProductsArtifact>(&path, issues) else {
        return;
    };

    let entries: Vec<Value> = match &artifact.products {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map.values().cloned().collect(),
        other => {
            issues.push(format!(
                "{}: 'products' must be an array or object, found {}",
                path.display(),
                json_type_name(other)
            ));
            return;
        }
    };

    if entries.len() < MIN_CACHED_PRODUCTS {
        issues.push(format!(
            "{}: only {} products, minimum is {}",
            path.display(),
            entries.len(),
            MIN_CACHED_PRODUCTS
        ));
    }

    for (i, entry) in entries.iter().enumerate() {
        for field in ["title", "price", "url", "extraction_timestamp"] {
            if entry.get(field).is_none() {
                issues.push(format!(
                    "{}: product {} missing required field '{}'",
                    path.display(),
                    i,
                    field
                ));
            }
        }
    }
}

fn validate_ai_category_cache(layout: &OutputLayout, issues: &mut Vec<String>) {
    let path = layout.ai_category_cache_artifact();
    let Some(artifact) = read_json::<AiCategoryCacheArtifact>(&path, issues) else {
        return;
    };
    if artifact.supplier.trim().is_empty() {
        issues.push(format!("{}: empty supplier name", path.display()));
    }
    for (i, entry) in artifact.ai_suggestion_history.iter().enumerate() {
        if entry.ai_suggestions.top_3_urls.is_empty() {
            issues.push(format!(
                "{}: history entry {} has no suggested URLs",
                path.display(),
                i
            ));
        }
    }
}

fn validate_linking_map(layout: &OutputLayout, issues: &mut Vec<String>) {
    let path = layout.verifier_linking_map_file();
    let Some(records) = read_json::<Vec<LinkingRecord>>(&path, issues) else {
        return;
    };
    let mut seen = std::collections::HashSet::new();
    for (i, record) in records.iter().enumerate() {
        if record.supplier_product_identifier.is_empty() {
            issues.push(format!(
                "{}: record {} has an empty supplier identifier",
                path.display(),
                i
            ));
        }
        if !crate::models::is_valid_asin(&record.chosen_amazon_asin) {
            issues.push(format!(
                "{}: record {} carries invalid ASIN '{}'",
                path.display(),
                i,
                record.chosen_amazon_asin
            ));
        }
        if !seen.insert(record.supplier_product_identifier.clone()) {
            issues.push(format!(
                "{}: duplicate identifier '{}'",
                path.display(),
                record.supplier_product_identifier
            ));
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validate the three run artifacts. Any failure blocks promotion to the
/// ready state and surfaces as needs-intervention.
pub fn verify_run_outputs(layout: &OutputLayout) -> VerificationReport {
    let mut issues = Vec::new();
    validate_cached_products(layout, &mut issues);
    validate_ai_category_cache(layout, &mut issues);
    validate_linking_map(layout, &mut issues);

    if issues.is_empty() {
        info!("Output verification passed: all run artifacts valid");
        VerificationReport::pass()
    } else {
        for issue in &issues {
            error!("Output verification: {}", issue);
        }
        VerificationReport::fail(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchMethod;
    use serde_json::json;

    fn write(path: &Path, value: &Value) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    }

    fn product_entry(title: &str) -> Value {
        json!({
            "title": title,
            "price": 4.99,
            "url": "https://supplier.example/p",
            "extraction_timestamp": Utc::now(),
        })
    }

    fn valid_artifacts(layout: &OutputLayout) {
        let products: Vec<Value> = (0..6)
            .map(|i| product_entry(&format!("Product {}", i)))
            .collect();
        write(
            &layout.cached_products_artifact(),
            &json!({"products": products, "supplier": "acme.example"}),
        );
        write(
            &layout.ai_category_cache_artifact(),
            &json!({
                "supplier": "acme.example",
                "created": Utc::now(),
                "ai_suggestion_history": [{
                    "timestamp": Utc::now(),
                    "ai_suggestions": {"top_3_urls": ["https://supplier.example/c1"]},
                }],
            }),
        );
        let record = LinkingRecord {
            supplier_product_identifier: "EAN_5000000000012".to_string(),
            supplier_title_snippet: "Product".to_string(),
            chosen_amazon_asin: "B01ABCDEFG".to_string(),
            amazon_title_snippet: "Product".to_string(),
            amazon_ean_on_page: None,
            match_method: MatchMethod::EanSearch,
        };
        write(
            &layout.verifier_linking_map_file(),
            &serde_json::to_value(vec![record]).unwrap(),
        );
    }

    #[test]
    fn valid_run_passes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        valid_artifacts(&layout);
        let report = verify_run_outputs(&layout);
        assert!(report.ok, "issues: {:?}", report.issues);
    }

    #[test]
    fn missing_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        let report = verify_run_outputs(&layout);
        assert!(!report.ok);
        assert!(report.issues.len() >= 3);
    }

    #[test]
    fn too_few_products_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        valid_artifacts(&layout);
        write(
            &layout.cached_products_artifact(),
            &json!({"products": [product_entry("only one")]}),
        );
        let report = verify_run_outputs(&layout);
        assert!(!report.ok);
        assert!(report.issues.iter().any(|i| i.contains("minimum")));
    }

    #[test]
    fn missing_required_product_field_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        valid_artifacts(&layout);
        let mut bad = product_entry("incomplete");
        bad.as_object_mut().unwrap().remove("price");
        let mut products: Vec<Value> =
            (0..5).map(|i| product_entry(&format!("P{}", i))).collect();
        products.push(bad);
        write(
            &layout.cached_products_artifact(),
            &json!({"products": products}),
        );
        let report = verify_run_outputs(&layout);
        assert!(!report.ok);
        assert!(report.issues.iter().any(|i| i.contains("'price'")));
    }

    #[test]
    fn invalid_asin_in_linking_map_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        valid_artifacts(&layout);
        write(
            &layout.verifier_linking_map_file(),
            &json!([{
                "supplier_product_identifier": "EAN_5000000000012",
                "supplier_title_snippet": "P",
                "chosen_amazon_asin": "bad",
                "amazon_title_snippet": "P",
                "amazon_ean_on_page": null,
                "match_method": "EAN_search",
            }]),
        );
        let report = verify_run_outputs(&layout);
        assert!(!report.ok);
        assert!(report.issues.iter().any(|i| i.contains("invalid ASIN")));
    }

    #[test]
    fn malformed_history_entry_fails() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        valid_artifacts(&layout);
        write(
            &layout.ai_category_cache_artifact(),
            &json!({
                "supplier": "acme.example",
                "created": Utc::now(),
                "ai_suggestion_history": [{
                    "timestamp": Utc::now(),
                    "ai_suggestions": {"top_3_urls": []},
                }],
            }),
        );
        let report = verify_run_outputs(&layout);
        assert!(!report.ok);
    }
}

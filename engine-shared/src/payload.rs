//! Submit/Update payload shapes (§6.1)
//!
//! The payload is opaque configuration as far as the engine's scheduling
//! logic is concerned: brand, search strategy and email templates are
//! preserved verbatim for round-tripping, and any field the caller supplies
//! that this engine doesn't know about is kept in `extra` rather than
//! dropped. Canonical field names are snake_case; camelCase aliases are
//! accepted on input via `#[serde(alias = ...)]`.

use serde::{Deserialize, Serialize};

use crate::defaults::{default_max_creators, default_target_new_creators};
use crate::error::EngineError;

/// The closed set of sales-volume buckets search strategies normalise onto.
pub const SALES_CODES: &[&str] = &["0-10", "10-100", "100-1k", "1k+"];

/// The closed set of GMV buckets search strategies normalise onto.
pub const GMV_CODES: &[&str] = &["0-100", "100-1k", "1k-10k", "10k+"];

/// Normalises a `only_first` value: truthy strings/numbers become `1`,
/// literal `2` stays `2`, and anything else (including unknown strings)
/// normalises to `0`.
pub fn normalize_only_first(value: &serde_json::Value) -> u8 {
    match value {
        serde_json::Value::Number(n) => match n.as_u64() {
            Some(1) => 1,
            Some(2) => 2,
            _ => 0,
        },
        serde_json::Value::Bool(b) => u8::from(*b),
        serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => 1,
            "2" => 2,
            _ => 0,
        },
        _ => 0,
    }
}

fn deserialize_only_first<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(normalize_only_first(&value))
}

/// Normalises a single code onto a closed set, case-insensitively.
/// Unrecognised codes are dropped rather than coerced onto a bucket that
/// was never in the input - substituting a real-looking value for garbage
/// would be worse than having no value at all.
fn normalize_code(code: &str, closed_set: &[&str]) -> Option<String> {
    let trimmed = code.trim();
    closed_set.iter().find(|c| c.eq_ignore_ascii_case(trimmed)).map(|c| c.to_string())
}

/// The threshold-based fallback used only when a whole code list comes back
/// empty (the caller sent nothing, or every entry was unrecognised): every
/// bucket above the lowest one, so a missing strategy still casts a wide
/// net instead of narrowing to the smallest creators.
fn default_codes(closed_set: &[&str]) -> Vec<String> {
    closed_set[1..].iter().map(|c| c.to_string()).collect()
}

fn normalize_code_list(raw: &[String], closed_set: &[&str]) -> Vec<String> {
    let mut codes: Vec<String> = Vec::new();
    for item in raw {
        if let Some(code) = normalize_code(item, closed_set) {
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
    }
    if codes.is_empty() {
        codes = default_codes(closed_set);
    }
    codes
}

fn deserialize_sales_codes<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Vec<String> = Vec::deserialize(deserializer)?;
    Ok(normalize_code_list(&raw, SALES_CODES))
}

fn deserialize_gmv_codes<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Vec<String> = Vec::deserialize(deserializer)?;
    Ok(normalize_code_list(&raw, GMV_CODES))
}

/// Brand targeting configuration (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Brand {
    pub name: String,
    /// `0` = send to all matches, `1` = first match only, `2` = first match
    /// plus a follow-up. Normalised from truthy strings/numbers at decode
    /// time; unknown values collapse to `0`.
    #[serde(default, deserialize_with = "deserialize_only_first")]
    pub only_first: u8,
    #[serde(default, alias = "keyWord")]
    pub key_word: Option<String>,
}

/// Search/filter strategy used to find candidate creators (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SearchStrategy {
    #[serde(default, alias = "searchKeywords")]
    pub search_keywords: Vec<String>,
    #[serde(default, alias = "productCategory")]
    pub product_category: Option<String>,
    #[serde(default, alias = "fansAgeRange")]
    pub fans_age_range: Vec<String>,
    #[serde(default, alias = "fansGender")]
    pub fans_gender: Option<String>,
    #[serde(default, alias = "minFans")]
    pub min_fans: Option<u64>,
    #[serde(default, alias = "contentType")]
    pub content_type: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_gmv_codes")]
    pub gmv: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_sales_codes")]
    pub sales: Vec<String>,
    #[serde(default, alias = "minGMV")]
    pub min_gmv: Option<f64>,
    #[serde(default, alias = "maxGMV")]
    pub max_gmv: Option<f64>,
    #[serde(default, alias = "minSales")]
    pub min_sales: Vec<String>,
    #[serde(default, alias = "avgViews")]
    pub avg_views: Option<u64>,
    #[serde(default, alias = "minEngagementRate")]
    pub min_engagement_rate: Option<f64>,
}

/// One outreach email template (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailTemplate {
    pub subject: String,
    pub email_body: String,
}

/// The Submit/Update payload, preserved verbatim under `payload` on the
/// returned task snapshot. The engine only reads the fields documented in
/// §4.1-§4.6; everything else (including fields future callers invent)
/// round-trips through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskPayload {
    #[serde(default, alias = "taskId")]
    pub task_id: Option<String>,
    #[serde(default, alias = "taskName")]
    pub task_name: Option<String>,
    pub region: String,
    #[serde(default, alias = "campaignId")]
    pub campaign_id: Option<String>,
    #[serde(default, alias = "campaignName")]
    pub campaign_name: Option<String>,
    #[serde(default, alias = "productId")]
    pub product_id: Option<String>,
    #[serde(default, alias = "productName")]
    pub product_name: Option<String>,
    pub brand: Brand,
    #[serde(default, alias = "searchStrategy")]
    pub search_strategy: SearchStrategy,
    #[serde(alias = "emailFirst")]
    pub email_first: EmailTemplate,
    #[serde(default, alias = "emailLater")]
    pub email_later: Option<EmailTemplate>,
    #[serde(default = "default_max_creators", alias = "maxCreators")]
    pub max_creators: u32,
    #[serde(default = "default_target_new_creators", alias = "targetNewCreators")]
    pub target_new_creators: u32,
    #[serde(default, alias = "runAtTime")]
    pub run_at_time: Option<String>,
    #[serde(default, alias = "runEndTime")]
    pub run_end_time: Option<String>,
    /// Fields the caller supplied that the engine above doesn't name
    /// explicitly; preserved so Submit/Get round-trips losslessly.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskPayload {
    /// Applies the cross-field defaults from §6.1: `email_later` falls back
    /// to `email_first` when absent and `only_first` is `0` or `2`.
    pub fn apply_cross_field_defaults(&mut self) {
        if self.email_later.is_none() && matches!(self.brand.only_first, 0 | 2) {
            self.email_later = Some(self.email_first.clone());
        }
    }

    /// Validates the documented invariants: non-empty region, positive
    /// budgets. `target_new_creators <= max_creators` is recommended but
    /// not enforced (§3.1), so it is not checked here.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.region.trim().is_empty() {
            return Err(EngineError::InvalidPayload("region must not be empty".into()));
        }
        if self.max_creators == 0 {
            return Err(EngineError::InvalidPayload("max_creators must be > 0".into()));
        }
        if self.target_new_creators == 0 {
            return Err(EngineError::InvalidPayload(
                "target_new_creators must be > 0".into(),
            ));
        }
        if self.brand.name.trim().is_empty() {
            return Err(EngineError::InvalidPayload("brand.name must not be empty".into()));
        }
        Ok(())
    }

    /// Applies a partial patch using record-level overlay: nested objects
    /// present in the patch replace the corresponding field wholesale,
    /// scalars are overwritten, and anything absent from the patch is kept
    /// from `self` (§9 Design Notes).
    pub fn merge_patch(&self, patch: &serde_json::Value) -> Result<TaskPayload, EngineError> {
        let mut merged =
            serde_json::to_value(self).map_err(|e| EngineError::InvalidPayload(e.to_string()))?;
        match (&mut merged, patch) {
            (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
                for (key, value) in patch_map {
                    base_map.insert(key.clone(), value.clone());
                }
            }
            _ => return Err(EngineError::InvalidPayload("patch must be an object".into())),
        }
        serde_json::from_value(merged).map_err(|e| EngineError::InvalidPayload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TaskPayload {
        serde_json::from_value(serde_json::json!({
            "region": "mx",
            "brand": {"name": "Acme", "only_first": "yes"},
            "emailFirst": {"subject": "hi", "email_body": "body"},
            "search_strategy": {"sales": ["0-10", "weird"]},
        }))
        .unwrap()
    }

    #[test]
    fn only_first_truthy_strings_normalize_to_one() {
        let p = sample();
        assert_eq!(p.brand.only_first, 1);
    }

    #[test]
    fn camel_case_alias_is_accepted() {
        let p = sample();
        assert_eq!(p.email_first.subject, "hi");
    }

    #[test]
    fn unknown_sales_code_is_dropped_not_coerced() {
        let p = sample();
        assert_eq!(p.search_strategy.sales, vec!["0-10"]);
    }

    #[test]
    fn an_entirely_unparseable_sales_list_falls_back_to_the_threshold_default() {
        let p: TaskPayload = serde_json::from_value(serde_json::json!({
            "region": "mx",
            "brand": {"name": "Acme"},
            "emailFirst": {"subject": "hi", "email_body": "body"},
            "search_strategy": {"sales": ["not-a-code", "also-not-one"]},
        }))
        .unwrap();
        assert_eq!(p.search_strategy.sales, vec!["10-100", "100-1k", "1k+"]);
    }

    #[test]
    fn an_omitted_sales_list_stays_empty_rather_than_defaulting() {
        let p = sample();
        assert!(p.search_strategy.gmv.is_empty());
    }

    #[test]
    fn defaults_apply_for_omitted_budgets() {
        let p = sample();
        assert_eq!(p.max_creators, 500);
        assert_eq!(p.target_new_creators, 50);
    }

    #[test]
    fn email_later_defaults_from_email_first_when_only_first_allows() {
        let mut p = sample();
        p.apply_cross_field_defaults();
        assert_eq!(p.email_later, Some(p.email_first.clone()));
    }

    #[test]
    fn email_later_stays_absent_when_only_first_is_one() {
        let mut p = sample();
        p.brand.only_first = 1;
        p.apply_cross_field_defaults();
        assert!(p.email_later.is_none());
    }

    #[test]
    fn merge_patch_replaces_nested_objects_wholesale() {
        let base = sample();
        let patch = serde_json::json!({"brand": {"name": "NewBrand"}});
        let merged = base.merge_patch(&patch).unwrap();
        assert_eq!(merged.brand.name, "NewBrand");
        // only_first reset to default because the whole `brand` object was replaced
        assert_eq!(merged.brand.only_first, 0);
        assert_eq!(merged.region, base.region);
    }

    #[test]
    fn round_trips_unknown_fields_through_extra() {
        let raw = serde_json::json!({
            "region": "mx",
            "brand": {"name": "Acme"},
            "emailFirst": {"subject": "hi", "email_body": "b"},
            "some_future_field": 42,
        });
        let p: TaskPayload = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(p.extra.get("some_future_field"), Some(&serde_json::json!(42)));
    }
}

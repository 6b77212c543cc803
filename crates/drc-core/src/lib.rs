//! Core domain model and classification tables for the Direct report cache.

use std::fmt;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "drc-core";

/// Constant written into the `source` column of every fetched row.
pub const SOURCE_LABEL: &str = "yandex";

/// Vendor reports cost in micros; stored cost carries a fixed markup.
pub const COST_MARKUP: f64 = 1.2;
pub const COST_DIVISOR: f64 = 1_000_000.0;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub const DEFAULT_CATEGORY: &str = "other";
pub const ERROR_SENTINEL: &str = "error";

/// Converts a vendor cost (micros) into stored currency units.
pub fn normalize_cost(raw: f64) -> f64 {
    raw * COST_MARKUP / COST_DIVISOR
}

/// Vendor footer rows carry "Total rows: N" in the date column.
pub fn is_total_row(date: &str) -> bool {
    date.to_lowercase().contains("total")
}

/// Cache cells written by older runs may carry the Russian labels; anything
/// unrecognised reads back as `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformType {
    #[serde(alias = "поиск")]
    Search,
    #[default]
    #[serde(alias = "сеть")]
    Network,
    #[serde(other)]
    Error,
}

impl PlatformType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformType::Search => "search",
            PlatformType::Network => "network",
            PlatformType::Error => "error",
        }
    }
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of a fetched report, plus the fields derived during enrichment.
///
/// Serde names match the vendor TSV header for the first seven columns and the
/// cache file header for the rest, so the same type reads both files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    #[serde(rename = "Date", default)]
    pub date: String,
    #[serde(rename = "CampaignName", default)]
    pub campaign_name: Option<String>,
    #[serde(rename = "CampaignId", default)]
    pub campaign_id: String,
    #[serde(rename = "Device", default)]
    pub device: String,
    #[serde(rename = "Impressions")]
    pub impressions: u64,
    #[serde(rename = "Clicks")]
    pub clicks: u64,
    #[serde(rename = "Cost")]
    pub cost: f64,
    #[serde(rename = "акаунт", default)]
    pub account: String,
    #[serde(rename = "источник", default)]
    pub source: String,
    #[serde(rename = "поиск/сеть", default)]
    pub platform_type: PlatformType,
    #[serde(rename = "тип", default)]
    pub campaign_category: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("date window must cover at least one day")]
    Empty,
    #[error("date window is reversed: {first} > {last}")]
    Reversed { first: NaiveDate, last: NaiveDate },
}

/// Ascending, contiguous run of calendar dates.
///
/// Defines both the fetch range and which cached rows are stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateWindow {
    dates: Vec<String>,
}

impl DateWindow {
    pub fn between(first: NaiveDate, last: NaiveDate) -> Result<Self, WindowError> {
        if first > last {
            return Err(WindowError::Reversed { first, last });
        }
        let dates = first
            .iter_days()
            .take_while(|d| *d <= last)
            .map(|d| d.format(DATE_FORMAT).to_string())
            .collect();
        Ok(Self { dates })
    }

    /// "`days` days ago" through "1 day ago" relative to `today`.
    pub fn trailing(today: NaiveDate, days: u32) -> Result<Self, WindowError> {
        if days == 0 {
            return Err(WindowError::Empty);
        }
        let first = today - Duration::days(i64::from(days));
        let last = today - Duration::days(1);
        Self::between(first, last)
    }

    pub fn first_str(&self) -> &str {
        &self.dates[0]
    }

    pub fn last_str(&self) -> &str {
        &self.dates[self.dates.len() - 1]
    }

    pub fn dates(&self) -> &[String] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// True when `date` contains any window date, case-insensitively.
    /// An empty date never matches.
    pub fn contains_date(&self, date: &str) -> bool {
        if date.is_empty() {
            return false;
        }
        let date = date.to_lowercase();
        self.dates.iter().any(|d| date.contains(d.as_str()))
    }
}

/// One `(substring, result)` pair of an ordered rule list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRule<T> {
    pub tag: String,
    pub value: T,
}

impl<T> TagRule<T> {
    pub fn new(tag: impl Into<String>, value: T) -> Self {
        Self {
            tag: tag.into(),
            value,
        }
    }
}

/// Ordered first-match-wins classifier over campaign names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet<T> {
    #[serde(default = "Vec::new")]
    pub rules: Vec<TagRule<T>>,
    pub default: T,
    pub error: T,
}

impl<T: Clone> RuleSet<T> {
    /// Case-insensitive substring scan in rule order.
    ///
    /// A missing or empty name yields `error`; no match yields `default`.
    pub fn classify(&self, name: Option<&str>) -> T {
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return self.error.clone();
        };
        let name = name.to_lowercase();
        self.rules
            .iter()
            .find(|rule| !rule.tag.is_empty() && name.contains(&rule.tag.to_lowercase()))
            .map(|rule| rule.value.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

/// The two classifiers applied to every report row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub platform: RuleSet<PlatformType>,
    pub category: RuleSet<String>,
}

impl Classification {
    pub fn builtin() -> Self {
        let category = [
            ("dsa", "dsa"),
            ("-nz", "nz"),
            ("_nz", "nz"),
            ("shop", "shopping"),
            ("corporate", "b2b"),
            ("promo", "promo"),
            ("brand", "brand"),
            ("cat-cv", "category+vendor"),
            ("categor", "category"),
            ("compet", "competitor"),
            ("config", "configurator"),
            ("rmkt", "remarketing"),
            ("usilenie", "reinforcement"),
        ]
        .into_iter()
        .map(|(tag, value)| TagRule::new(tag, value.to_string()))
        .collect();

        Self {
            platform: RuleSet {
                rules: vec![TagRule::new("srch", PlatformType::Search)],
                default: PlatformType::Network,
                error: PlatformType::Error,
            },
            category: RuleSet {
                rules: category,
                default: DEFAULT_CATEGORY.to_string(),
                error: ERROR_SENTINEL.to_string(),
            },
        }
    }

    /// Fills the derived classification fields of `row` from its campaign name.
    pub fn apply(&self, row: &mut ReportRow) {
        let name = row.campaign_name.as_deref();
        row.platform_type = self.platform.classify(name);
        row.campaign_category = self.category.classify(name);
    }
}

impl Default for Classification {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    #[test]
    fn first_listed_tag_wins() {
        let rules = RuleSet {
            rules: vec![
                TagRule::new("promo", "Promo".to_string()),
                TagRule::new("brand", "Brand".to_string()),
            ],
            default: "other".to_string(),
            error: "error".to_string(),
        };
        assert_eq!(rules.classify(Some("promo_brand_camp")), "Promo");
        assert_eq!(rules.classify(Some("brand_only")), "Brand");
    }

    #[test]
    fn classification_is_case_insensitive_with_defaults() {
        let c = Classification::builtin();
        assert_eq!(c.platform.classify(Some("Shop_SRCH_msk")), PlatformType::Search);
        assert_eq!(c.platform.classify(Some("rsya_shop")), PlatformType::Network);
        assert_eq!(c.category.classify(Some("RMKT_all")), "remarketing");
        assert_eq!(c.category.classify(Some("generic")), DEFAULT_CATEGORY);
    }

    #[test]
    fn missing_name_yields_error_sentinel() {
        let c = Classification::builtin();
        assert_eq!(c.platform.classify(None), PlatformType::Error);
        assert_eq!(c.category.classify(None), ERROR_SENTINEL);
        assert_eq!(c.category.classify(Some("")), ERROR_SENTINEL);
    }

    #[test]
    fn builtin_order_prefers_earlier_markers() {
        let c = Classification::builtin();
        // "shop" precedes "brand"; "cat-cv" precedes "categor".
        assert_eq!(c.category.classify(Some("srch_brand_shop")), "shopping");
        assert_eq!(c.category.classify(Some("srch_cat-cv_categories")), "category+vendor");
    }

    #[test]
    fn apply_fills_derived_fields() {
        let mut row = ReportRow {
            date: "2024-01-01".into(),
            campaign_name: Some("srch_promo".into()),
            campaign_id: "1".into(),
            device: "DESKTOP".into(),
            impressions: 1,
            clicks: 0,
            cost: 0.0,
            account: String::new(),
            source: String::new(),
            platform_type: PlatformType::default(),
            campaign_category: String::new(),
        };
        Classification::builtin().apply(&mut row);
        assert_eq!(row.platform_type, PlatformType::Search);
        assert_eq!(row.campaign_category, "promo");
    }

    #[test]
    fn trailing_window_ends_yesterday() {
        let window = DateWindow::trailing(date("2024-03-02"), 3).unwrap();
        assert_eq!(window.dates(), ["2024-02-28", "2024-02-29", "2024-03-01"]);
        assert_eq!(window.first_str(), "2024-02-28");
        assert_eq!(window.last_str(), "2024-03-01");
        assert_eq!(DateWindow::trailing(date("2024-03-02"), 0), Err(WindowError::Empty));
    }

    #[test]
    fn window_match_is_substring_and_null_safe() {
        let window = DateWindow::between(date("2024-01-02"), date("2024-01-02")).unwrap();
        assert!(window.contains_date("2024-01-02"));
        assert!(window.contains_date("2024-01-02 00:00:00"));
        assert!(!window.contains_date("2024-01-03"));
        assert!(!window.contains_date(""));
    }

    #[test]
    fn cost_is_rescaled_from_micros() {
        assert_eq!(normalize_cost(1_000_000.0), 1_000_000.0 * 1.2 / 1_000_000.0);
        assert_eq!(normalize_cost(2_500_000.0), 3.0);
    }

    #[test]
    fn total_rows_detected_case_insensitively() {
        assert!(is_total_row("Total rows: 12"));
        assert!(is_total_row("TOTAL"));
        assert!(!is_total_row("2024-01-01"));
    }
}

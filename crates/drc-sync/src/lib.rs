//! Multi-account report sync: fetch, enrich, merge into the rolling cache.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use drc_client::{
    parse_report, HttpClientConfig, HttpTransport, PollPolicy, ReportClient, ReportSpec,
    ReportTransport, DEFAULT_API_URL, DEFAULT_REPORT_NAME,
};
use drc_core::{
    normalize_cost, Classification, DateWindow, PlatformType, ReportRow, RuleSet, WindowError,
    SOURCE_LABEL,
};
use drc_storage::{MergeOutcome, ReportFileStore};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "drc-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("DIRECT_LOGINS does not name any account")]
    NoLogins,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub token: SecretString,
    pub logins: Vec<String>,
    pub days: u32,
    pub output_dir: PathBuf,
    pub temp_file_name: String,
    pub cache_file_name: String,
    pub api_url: String,
    pub report_name: String,
    pub rules_file: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub poll: PollPolicy,
    pub account_delay: Duration,
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

fn text_var(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let token = lookup("DIRECT_TOKEN")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("DIRECT_TOKEN"))?;
        let logins: Vec<String> = lookup("DIRECT_LOGINS")
            .ok_or(ConfigError::Missing("DIRECT_LOGINS"))?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if logins.is_empty() {
            return Err(ConfigError::NoLogins);
        }

        let days: u32 = parse_var(&lookup, "DIRECT_DAYS", 45)?;
        if days == 0 {
            return Err(ConfigError::Invalid {
                name: "DIRECT_DAYS",
                value: days.to_string(),
            });
        }

        let defaults = PollPolicy::default();
        let poll = PollPolicy {
            max_attempts: parse_var(&lookup, "DIRECT_POLL_MAX_ATTEMPTS", defaults.max_attempts)?,
            max_elapsed: Duration::from_secs(parse_var(
                &lookup,
                "DIRECT_POLL_MAX_ELAPSED_SECS",
                defaults.max_elapsed.as_secs(),
            )?),
            ..defaults
        };

        Ok(Self {
            token: SecretString::from(token),
            logins,
            days,
            output_dir: PathBuf::from(text_var(&lookup, "DIRECT_OUTPUT_DIR", "./data")),
            temp_file_name: text_var(&lookup, "DIRECT_TEMP_FILE", "report_temp.tsv"),
            cache_file_name: text_var(&lookup, "DIRECT_CACHE_FILE", "report_cache.csv"),
            api_url: text_var(&lookup, "DIRECT_API_URL", DEFAULT_API_URL),
            report_name: text_var(&lookup, "DIRECT_REPORT_NAME", DEFAULT_REPORT_NAME),
            rules_file: lookup("DIRECT_RULES_FILE")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            http_timeout_secs: parse_var(&lookup, "DIRECT_HTTP_TIMEOUT_SECS", 120)?,
            poll,
            account_delay: Duration::from_millis(parse_var(&lookup, "DIRECT_ACCOUNT_DELAY_MS", 1000)?),
        })
    }

    pub fn date_window(&self, today: NaiveDate) -> Result<DateWindow, WindowError> {
        DateWindow::trailing(today, self.days)
    }

    pub fn report_spec(&self) -> ReportSpec {
        ReportSpec {
            report_name: self.report_name.clone(),
            ..ReportSpec::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            api_url: self.api_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(format!("drc-sync/{}", env!("CARGO_PKG_VERSION"))),
            ..HttpClientConfig::new(self.token.clone())
        }
    }
}

pub trait EnrichmentHook: Send + Sync {
    fn apply(&self, rows: Vec<ReportRow>) -> Result<Vec<ReportRow>>;
}

#[derive(Default)]
pub struct NoopEnrichmentHook;

impl EnrichmentHook for NoopEnrichmentHook {
    fn apply(&self, rows: Vec<ReportRow>) -> Result<Vec<ReportRow>> {
        Ok(rows)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    #[allow(dead_code)]
    version: u32,
    platform: RuleSet<PlatformType>,
    category: RuleSet<String>,
}

/// Derives platform type and campaign category from the campaign name.
#[derive(Debug, Clone, Default)]
pub struct RuleEnrichmentHook {
    classification: Classification,
}

impl RuleEnrichmentHook {
    pub fn new(classification: Classification) -> Self {
        Self { classification }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(text).context("parsing classification rules")?;
        Ok(Self::new(Classification {
            platform: file.platform,
            category: file.category,
        }))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading rules from {}", path.display()))
    }
}

impl EnrichmentHook for RuleEnrichmentHook {
    fn apply(&self, mut rows: Vec<ReportRow>) -> Result<Vec<ReportRow>> {
        for row in &mut rows {
            self.classification.apply(row);
        }
        Ok(rows)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSummary {
    pub accounts_ok: usize,
    pub accounts_failed: usize,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_first: String,
    pub window_last: String,
    pub accounts: AggregateSummary,
    pub merge: MergeOutcome,
    pub cache_path: PathBuf,
}

pub struct SyncPipeline<T> {
    config: SyncConfig,
    client: ReportClient<T>,
    files: ReportFileStore,
    enrichment: Box<dyn EnrichmentHook>,
}

impl SyncPipeline<HttpTransport> {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.http_client_config())?;
        Ok(Self::with_transport(config, transport))
    }
}

impl<T: ReportTransport> SyncPipeline<T> {
    pub fn with_transport(config: SyncConfig, transport: T) -> Self {
        let client = ReportClient::new(transport, config.report_spec(), config.poll);
        let files = ReportFileStore::new(config.output_dir.clone());
        Self {
            config,
            client,
            files,
            enrichment: Box::<RuleEnrichmentHook>::default(),
        }
    }

    pub fn with_enrichment(mut self, enrichment: Box<dyn EnrichmentHook>) -> Self {
        self.enrichment = enrichment;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One job run over the trailing window ending yesterday (local time).
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let window = self
            .config
            .date_window(Local::now().date_naive())
            .context("building date window")?;
        self.run_for_window(&window).await
    }

    pub async fn run_for_window(&self, window: &DateWindow) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        async move {
            let started_at = Utc::now();
            info!(
                accounts = self.config.logins.len(),
                from = window.first_str(),
                to = window.last_str(),
                "sync started"
            );

            let (rows, accounts) = self.collect_accounts(window).await?;
            let cache = self.files.cache(&self.config.cache_file_name).await?;
            let merge = cache.merge(rows, window).await?;

            let finished_at = Utc::now();
            info!(
                accounts_ok = accounts.accounts_ok,
                accounts_failed = accounts.accounts_failed,
                rows = accounts.rows,
                "sync finished"
            );
            Ok::<_, anyhow::Error>(SyncRunSummary {
                run_id,
                started_at,
                finished_at,
                window_first: window.first_str().to_string(),
                window_last: window.last_str().to_string(),
                accounts,
                merge,
                cache_path: cache.path().to_path_buf(),
            })
        }
        .instrument(span)
        .await
    }

    /// Fetches every configured account in order; a failed account is logged and skipped.
    pub async fn collect_accounts(&self, window: &DateWindow) -> Result<(Vec<ReportRow>, AggregateSummary)> {
        let total = self.config.logins.len();
        let mut combined = Vec::new();
        let mut summary = AggregateSummary::default();

        for (index, login) in self.config.logins.iter().enumerate() {
            let span = info_span!("account", login = %login);
            info!(parent: &span, "export {}/{}", index + 1, total);
            match self.fetch_account(login, window).instrument(span).await {
                Ok(rows) => {
                    summary.accounts_ok += 1;
                    combined.extend(rows);
                }
                Err(err) => {
                    summary.accounts_failed += 1;
                    error!(login = %login, error = %format!("{err:#}"), "account skipped");
                }
            }
            if index + 1 < total && !self.config.account_delay.is_zero() {
                tokio::time::sleep(self.config.account_delay).await;
            }
        }

        let rows = self.finalize(combined)?;
        summary.rows = rows.len();
        Ok((rows, summary))
    }

    async fn fetch_account(&self, login: &str, window: &DateWindow) -> Result<Vec<ReportRow>> {
        let response = self
            .client
            .fetch(login, window.first_str(), window.last_str())
            .await;
        let stored = self
            .files
            .store_temp_report(&self.config.temp_file_name, &response.body)
            .await?;
        debug!(
            path = %stored.path.display(),
            content_hash = %stored.content_hash,
            bytes = stored.byte_size,
            "raw report stored"
        );
        if !response.outcome.is_ready() {
            bail!(
                "report fetch ended with {:?} after {} attempt(s)",
                response.outcome,
                response.attempts
            );
        }

        let text = self.files.read_temp_report(&stored.path).await?;
        let mut rows = parse_report(&text).context("parsing report")?;
        if rows.is_empty() {
            warn!("report contains no rows");
        }
        for row in &mut rows {
            row.account = login.to_string();
        }
        Ok(rows)
    }

    fn finalize(&self, rows: Vec<ReportRow>) -> Result<Vec<ReportRow>> {
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.source = SOURCE_LABEL.to_string();
                row.cost = normalize_cost(row.cost);
                row
            })
            .collect();
        self.enrichment.apply(rows)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let enrichment = match &config.rules_file {
        Some(path) => RuleEnrichmentHook::from_yaml_file(path)?,
        None => RuleEnrichmentHook::default(),
    };
    let pipeline = SyncPipeline::new(config)?.with_enrichment(Box::new(enrichment));
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn config_defaults_apply() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("DIRECT_TOKEN", "t0ken"),
            ("DIRECT_LOGINS", " client-a, client-b ,,"),
        ]))
        .unwrap();

        assert_eq!(config.logins, vec!["client-a", "client-b"]);
        assert_eq!(config.days, 45);
        assert_eq!(config.output_dir, PathBuf::from("./data"));
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.account_delay, Duration::from_secs(1));
        assert_eq!(config.poll.max_attempts, PollPolicy::default().max_attempts);
        assert!(config.rules_file.is_none());
    }

    #[test]
    fn config_overrides_and_window() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("DIRECT_TOKEN", "t0ken"),
            ("DIRECT_LOGINS", "client-a"),
            ("DIRECT_DAYS", "3"),
            ("DIRECT_POLL_MAX_ATTEMPTS", "5"),
            ("DIRECT_ACCOUNT_DELAY_MS", "0"),
            ("DIRECT_REPORT_NAME", "daily"),
        ]))
        .unwrap();

        assert_eq!(config.poll.max_attempts, 5);
        assert!(config.account_delay.is_zero());
        assert_eq!(config.report_spec().report_name, "daily");
        let today = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let window = config.date_window(today).unwrap();
        assert_eq!(window.dates(), ["2024-01-07", "2024-01-08", "2024-01-09"]);
    }

    #[test]
    fn config_rejects_missing_and_invalid_values() {
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[("DIRECT_LOGINS", "a")])),
            Err(ConfigError::Missing("DIRECT_TOKEN"))
        ));
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[("DIRECT_TOKEN", "t"), ("DIRECT_LOGINS", " , ")])),
            Err(ConfigError::NoLogins)
        ));
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[
                ("DIRECT_TOKEN", "t"),
                ("DIRECT_LOGINS", "a"),
                ("DIRECT_DAYS", "many"),
            ])),
            Err(ConfigError::Invalid { name: "DIRECT_DAYS", .. })
        ));
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[
                ("DIRECT_TOKEN", "t"),
                ("DIRECT_LOGINS", "a"),
                ("DIRECT_DAYS", "0"),
            ])),
            Err(ConfigError::Invalid { name: "DIRECT_DAYS", .. })
        ));
    }

    #[test]
    fn yaml_rules_replace_builtin_tables() {
        let hook = RuleEnrichmentHook::from_yaml_str(
            r#"
version: 1
platform:
  rules:
    - { tag: "search", value: search }
  default: network
  error: error
category:
  rules:
    - { tag: "promo", value: "Promo" }
    - { tag: "brand", value: "Brand" }
  default: other
  error: error
"#,
        )
        .unwrap();

        let rows = hook
            .apply(vec![ReportRow {
                date: "2024-01-01".into(),
                campaign_name: Some("search_promo_brand_camp".into()),
                campaign_id: "1".into(),
                device: "DESKTOP".into(),
                impressions: 1,
                clicks: 1,
                cost: 1.0,
                account: "a".into(),
                source: SOURCE_LABEL.into(),
                platform_type: PlatformType::Network,
                campaign_category: String::new(),
            }])
            .unwrap();

        assert_eq!(rows[0].platform_type, PlatformType::Search);
        assert_eq!(rows[0].campaign_category, "Promo");
    }

    #[test]
    fn malformed_yaml_rules_are_rejected() {
        assert!(RuleEnrichmentHook::from_yaml_str("version: 1\nplatform: []\n").is_err());
    }
}

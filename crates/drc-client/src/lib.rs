//! Report fetch client for the vendor's asynchronous reports API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use drc_core::{is_total_row, ReportRow};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "drc-client";

pub const DEFAULT_API_URL: &str = "https://api.direct.yandex.com/json/v5/reports";
pub const DEFAULT_REPORT_NAME: &str = "campaign-performance";

pub const REPORT_FIELDS: [&str; 7] = [
    "Date",
    "CampaignName",
    "CampaignId",
    "Device",
    "Impressions",
    "Clicks",
    "Cost",
];

const REQUEST_ID_HEADER: &str = "RequestId";
const RETRY_IN_HEADER: &str = "retryIn";

/// Static shape of the report request; only the date range varies per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSpec {
    pub report_name: String,
    pub field_names: Vec<String>,
}

impl Default for ReportSpec {
    fn default() -> Self {
        Self {
            report_name: DEFAULT_REPORT_NAME.to_string(),
            field_names: REPORT_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ReportRequest<'a> {
    params: ReportParams<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ReportParams<'a> {
    selection_criteria: SelectionCriteria<'a>,
    field_names: &'a [String],
    report_name: &'a str,
    report_type: &'static str,
    date_range_type: &'static str,
    format: &'static str,
    #[serde(rename = "IncludeVAT")]
    include_vat: &'static str,
    include_discount: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SelectionCriteria<'a> {
    date_from: &'a str,
    date_to: &'a str,
}

/// JSON body of a custom TSV report over `[date_from, date_to]`, VAT and discounts off.
pub fn build_request_body(spec: &ReportSpec, date_from: &str, date_to: &str) -> String {
    let request = ReportRequest {
        params: ReportParams {
            selection_criteria: SelectionCriteria { date_from, date_to },
            field_names: &spec.field_names,
            report_name: &spec.report_name,
            report_type: "CUSTOM_REPORT",
            date_range_type: "CUSTOM_DATE",
            format: "TSV",
            include_vat: "NO",
            include_discount: "NO",
        },
    };
    // Plain structs of strings always serialize.
    serde_json::to_string_pretty(&request).unwrap_or_default()
}

/// What a single response status means for the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Ready,
    Pending,
    ClientError,
    ServerError,
    GatewayTimeout,
    Unknown,
}

pub fn classify_status(status: u16) -> ResponseKind {
    match status {
        200 => ResponseKind::Ready,
        201 | 202 => ResponseKind::Pending,
        400 => ResponseKind::ClientError,
        500 => ResponseKind::ServerError,
        502 => ResponseKind::GatewayTimeout,
        _ => ResponseKind::Unknown,
    }
}

/// Terminal state of one `fetch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Ready,
    ClientError,
    ServerError,
    GatewayTimeout,
    Unknown(u16),
    Connection,
    PollTimeout,
}

impl FetchOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, FetchOutcome::Ready)
    }
}

#[derive(Debug, Clone)]
pub struct ReportResponse {
    pub outcome: FetchOutcome,
    pub body: String,
    pub attempts: u32,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub request_id: Option<String>,
    pub retry_in: Option<String>,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("report API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Message(String),
}

/// One POST to the reports endpoint on behalf of a client login.
#[async_trait]
pub trait ReportTransport: Send + Sync {
    async fn post_report(&self, login: &str, body: &str) -> Result<TransportResponse, TransportError>;
}

#[async_trait]
impl<T: ReportTransport + ?Sized> ReportTransport for Arc<T> {
    async fn post_report(&self, login: &str, body: &str) -> Result<TransportResponse, TransportError> {
        (**self).post_report(login, body).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub api_url: String,
    pub token: SecretString,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl HttpClientConfig {
    pub fn new(token: SecretString) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token,
            timeout: Duration::from_secs(120),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    api_url: String,
    token: SecretString,
}

impl HttpTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            api_url: config.api_url,
            token: config.token,
        })
    }

    fn build_request(&self, login: &str, body: &str) -> Result<reqwest::Request, reqwest::Error> {
        self.client
            .post(&self.api_url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token.expose_secret()))
            .header("Client-Login", login)
            .header("Accept-Language", "ru")
            .header("processingMode", "auto")
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .body(body.to_string())
            .build()
    }
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl ReportTransport for HttpTransport {
    async fn post_report(&self, login: &str, body: &str) -> Result<TransportResponse, TransportError> {
        let request = self.build_request(login, body)?;
        let resp = self.client.execute(request).await?;

        let status = resp.status().as_u16();
        let request_id = header_text(resp.headers(), REQUEST_ID_HEADER);
        let retry_in = header_text(resp.headers(), RETRY_IN_HEADER);
        let body = resp.text().await?;

        Ok(TransportResponse {
            status,
            request_id,
            retry_in,
            body,
        })
    }
}

/// Bounds on the "report still generating" loop.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub max_elapsed: Duration,
    pub default_wait: Duration,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            max_elapsed: Duration::from_secs(3600),
            default_wait: Duration::from_secs(60),
            min_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(300),
        }
    }
}

impl PollPolicy {
    /// Turns the server's `retryIn` hint (seconds) into a wait inside `[min_wait, max_wait]`.
    pub fn wait_for_hint(&self, retry_in: Option<&str>) -> Duration {
        let hinted = retry_in
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| Duration::from_secs_f64(secs.min(self.max_wait.as_secs_f64())))
            .unwrap_or(self.default_wait);
        hinted.max(self.min_wait).min(self.max_wait)
    }
}

pub struct ReportClient<T> {
    transport: T,
    spec: ReportSpec,
    poll: PollPolicy,
}

impl<T: ReportTransport> ReportClient<T> {
    pub fn new(transport: T, spec: ReportSpec, poll: PollPolicy) -> Self {
        Self {
            transport,
            spec,
            poll,
        }
    }

    /// Requests the report for `login` over `[date_from, date_to]`, polling while
    /// the vendor is still generating it.
    ///
    /// Never fails: unrecoverable states come back as a non-ready outcome with
    /// whatever body text was available.
    pub async fn fetch(&self, login: &str, date_from: &str, date_to: &str) -> ReportResponse {
        let body = build_request_body(&self.spec, date_from, date_to);
        let max_attempts = self.poll.max_attempts.max(1);
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let resp = match self.transport.post_report(login, &body).await {
                Ok(resp) => resp,
                Err(err) => {
                    error!(login, attempt = attempts, error = %err, "connection to the report API failed");
                    return ReportResponse {
                        outcome: FetchOutcome::Connection,
                        body: String::new(),
                        attempts,
                        request_id: None,
                    };
                }
            };

            let request_id = resp.request_id.as_deref().unwrap_or("-");
            match classify_status(resp.status) {
                ResponseKind::Ready => {
                    info!(login, request_id, attempts, "report received");
                    return self.finish(FetchOutcome::Ready, resp, attempts);
                }
                ResponseKind::Pending => {
                    let wait = self.poll.wait_for_hint(resp.retry_in.as_deref());
                    if attempts >= max_attempts || started.elapsed() + wait > self.poll.max_elapsed {
                        error!(
                            login,
                            request_id,
                            attempts,
                            elapsed_secs = started.elapsed().as_secs(),
                            request_body = %body,
                            "report still not ready; polling limit reached"
                        );
                        return self.finish(FetchOutcome::PollTimeout, resp, attempts);
                    }
                    warn!(
                        login,
                        request_id,
                        attempt = attempts,
                        status = resp.status,
                        retry_in_secs = wait.as_secs_f64(),
                        "report is still being generated"
                    );
                    tokio::time::sleep(wait).await;
                }
                ResponseKind::ClientError => {
                    log_terminal(login, &resp, &body, "invalid request parameters or report queue limit reached");
                    return self.finish(FetchOutcome::ClientError, resp, attempts);
                }
                ResponseKind::ServerError => {
                    log_terminal(login, &resp, &body, "report API server error; retry on a later run");
                    return self.finish(FetchOutcome::ServerError, resp, attempts);
                }
                ResponseKind::GatewayTimeout => {
                    log_terminal(login, &resp, &body, "report generation time exceeded; narrow the request");
                    return self.finish(FetchOutcome::GatewayTimeout, resp, attempts);
                }
                ResponseKind::Unknown => {
                    log_terminal(login, &resp, &body, "unexpected report API response");
                    let status = resp.status;
                    return self.finish(FetchOutcome::Unknown(status), resp, attempts);
                }
            }
        }
    }

    fn finish(&self, outcome: FetchOutcome, resp: TransportResponse, attempts: u32) -> ReportResponse {
        ReportResponse {
            outcome,
            body: resp.body,
            attempts,
            request_id: resp.request_id,
        }
    }
}

fn log_terminal(login: &str, resp: &TransportResponse, request_body: &str, message: &str) {
    error!(
        login,
        status = resp.status,
        request_id = resp.request_id.as_deref().unwrap_or("-"),
        request_body = %request_body,
        response_body = %resp.body,
        "{message}"
    );
}

#[derive(Debug, Error)]
pub enum ReportParseError {
    #[error("report has no header line after the title banner")]
    MissingHeader,
    #[error("malformed report header: {0}")]
    Header(csv::Error),
    #[error("malformed report row at line {line}: {source}")]
    Row { line: u64, source: csv::Error },
}

/// Parses a TSV report body into rows.
///
/// The first line is the vendor's report-title banner; the column header is the
/// second line. Footer rows ("Total rows: N") are dropped.
pub fn parse_report(text: &str) -> Result<Vec<ReportRow>, ReportParseError> {
    let Some((_banner, table)) = text.split_once('\n') else {
        return Err(ReportParseError::MissingHeader);
    };
    if table.trim().is_empty() {
        return Err(ReportParseError::MissingHeader);
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .has_headers(true)
        .from_reader(table.as_bytes());
    let headers = reader.headers().map_err(ReportParseError::Header)?.clone();
    let date_idx = headers.iter().position(|h| h == "Date");

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| ReportParseError::Row {
            line: source.position().map(|p| p.line() + 1).unwrap_or_default(),
            source,
        })?;
        if date_idx
            .and_then(|idx| record.get(idx))
            .is_some_and(is_total_row)
        {
            continue;
        }
        let line = record.position().map(|p| p.line() + 1).unwrap_or_default();
        let row = record
            .deserialize::<ReportRow>(Some(&headers))
            .map_err(|source| ReportParseError::Row { line, source })?;
        rows.push(row);
    }
    Ok(rows)
}

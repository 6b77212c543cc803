//! Temp report file + rolling cache file storage for the Direct report cache.

use std::borrow::Cow;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use drc_core::{DateWindow, ReportRow};
use encoding_rs::{Encoding, WINDOWS_1251};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "drc-storage";

pub const CACHE_DELIMITER: u8 = b';';
pub const CACHE_ENCODING: &Encoding = WINDOWS_1251;

/// Header of the cache file, in column order.
pub const CACHE_COLUMNS: [&str; 11] = [
    "Date",
    "CampaignName",
    "CampaignId",
    "Device",
    "Impressions",
    "Clicks",
    "Cost",
    "акаунт",
    "источник",
    "поиск/сеть",
    "тип",
];

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Output folder holding the per-account temp report and the cache file.
#[derive(Debug, Clone)]
pub struct ReportFileStore {
    root: PathBuf,
}

impl ReportFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Creates the output folder if needed and resolves `file_name` inside it.
    pub async fn resolve(&self, file_name: &str) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating output folder {}", self.root.display()))?;
        Ok(self.root.join(file_name))
    }

    /// Overwrites the temp report file with the raw vendor text.
    ///
    /// The path is the same for every account; one job instance at a time.
    pub async fn store_temp_report(&self, file_name: &str, text: &str) -> anyhow::Result<StoredReport> {
        let path = self.resolve(file_name).await?;
        fs::write(&path, text.as_bytes())
            .await
            .with_context(|| format!("writing temp report {}", path.display()))?;
        Ok(StoredReport {
            content_hash: Self::sha256_hex(text.as_bytes()),
            byte_size: text.len(),
            path,
        })
    }

    pub async fn read_temp_report(&self, path: &Path) -> anyhow::Result<String> {
        fs::read_to_string(path)
            .await
            .with_context(|| format!("reading temp report {}", path.display()))
    }

    pub async fn cache(&self, file_name: &str) -> anyhow::Result<CacheStore> {
        Ok(CacheStore::new(self.resolve(file_name).await?))
    }
}

#[derive(Debug, Error)]
pub enum CacheFormatError {
    #[error("malformed cache row at line {line}: {source}")]
    Row { line: u64, source: csv::Error },
    #[error("cache rows could not be encoded: {0}")]
    Encode(csv::Error),
    #[error("cache buffer could not be flushed: {0}")]
    Flush(String),
    #[error("cache text is not representable in {0}")]
    Unmappable(&'static str),
}

/// Stands in for characters the cache encoding cannot represent.
pub const UNMAPPABLE_REPLACEMENT: char = '?';

fn representable(text: &str) -> bool {
    !CACHE_ENCODING.encode(text).2
}

/// Replaces every character outside the cache encoding with `UNMAPPABLE_REPLACEMENT`.
pub fn to_cache_charset(text: &str) -> Cow<'_, str> {
    if representable(text) {
        return Cow::Borrowed(text);
    }
    let mut buf = [0u8; 4];
    Cow::Owned(
        text.chars()
            .map(|c| {
                if representable(c.encode_utf8(&mut buf)) {
                    c
                } else {
                    UNMAPPABLE_REPLACEMENT
                }
            })
            .collect(),
    )
}

fn cache_safe(row: &ReportRow) -> ReportRow {
    let fix = |s: &str| to_cache_charset(s).into_owned();
    ReportRow {
        date: fix(&row.date),
        campaign_name: row.campaign_name.as_deref().map(fix),
        campaign_id: fix(&row.campaign_id),
        device: fix(&row.device),
        account: fix(&row.account),
        source: fix(&row.source),
        campaign_category: fix(&row.campaign_category),
        ..row.clone()
    }
}

/// Decodes cache bytes (windows-1251, `;`, header row) into rows.
pub fn decode_cache(bytes: &[u8]) -> Result<Vec<ReportRow>, CacheFormatError> {
    let (text, _, had_errors) = CACHE_ENCODING.decode(bytes);
    if had_errors {
        warn!("cache file contains bytes outside the cache encoding; replaced");
    }
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(CACHE_DELIMITER)
        .has_headers(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.deserialize::<ReportRow>() {
        let row = record.map_err(|source| CacheFormatError::Row {
            line: source.position().map(|p| p.line()).unwrap_or_default(),
            source,
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Encodes rows into cache bytes, header first.
///
/// Text is folded into the cache encoding before quoting, so a lossy character
/// never introduces a stray delimiter.
pub fn encode_cache(rows: &[ReportRow]) -> Result<Vec<u8>, CacheFormatError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(CACHE_DELIMITER)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    if rows.is_empty() {
        writer
            .write_record(CACHE_COLUMNS)
            .map_err(CacheFormatError::Encode)?;
    }
    let mut replaced = 0usize;
    for row in rows {
        let safe = cache_safe(row);
        if safe != *row {
            replaced += 1;
        }
        writer.serialize(&safe).map_err(CacheFormatError::Encode)?;
    }
    if replaced > 0 {
        warn!(
            rows = replaced,
            "characters outside the cache encoding replaced with '{UNMAPPABLE_REPLACEMENT}'"
        );
    }
    let utf8 = writer
        .into_inner()
        .map_err(|e| CacheFormatError::Flush(e.to_string()))?;
    let text = String::from_utf8_lossy(&utf8);
    let (bytes, _, had_unmappable) = CACHE_ENCODING.encode(&text);
    if had_unmappable {
        return Err(CacheFormatError::Unmappable(CACHE_ENCODING.name()));
    }
    Ok(bytes.into_owned())
}

/// Drops rows whose date falls inside `window`; returns survivors and the evicted count.
pub fn evict_window(rows: Vec<ReportRow>, window: &DateWindow) -> (Vec<ReportRow>, usize) {
    let before = rows.len();
    let kept: Vec<ReportRow> = rows
        .into_iter()
        .filter(|row| !window.contains_date(&row.date))
        .collect();
    let evicted = before - kept.len();
    (kept, evicted)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub new_rows: usize,
    pub kept_rows: usize,
    pub evicted_rows: usize,
}

impl MergeStats {
    pub fn total_rows(&self) -> usize {
        self.new_rows + self.kept_rows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No fresh rows; the cache file was left untouched.
    SkippedNoNewData,
    Written(MergeStats),
}

/// The rolling `;`-delimited cache file.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the prior cache. A missing or zero-byte file is an empty cache.
    pub async fn load(&self) -> anyhow::Result<Vec<ReportRow>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "cache file not found; treating as first run");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading cache {}", self.path.display()))
            }
        };
        if bytes.is_empty() {
            warn!(path = %self.path.display(), "cache file is empty");
            return Ok(Vec::new());
        }
        decode_cache(&bytes).with_context(|| format!("parsing cache {}", self.path.display()))
    }

    /// Replaces the cache file via a sibling temp file and an atomic rename.
    pub async fn write(&self, rows: &[ReportRow]) -> anyhow::Result<()> {
        let bytes = encode_cache(rows)?;
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cache".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp cache {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }

    /// Evicts the window from the prior cache and prepends the fresh rows.
    ///
    /// Empty `new_rows` leaves the file as it was.
    pub async fn merge(
        &self,
        new_rows: Vec<ReportRow>,
        window: &DateWindow,
    ) -> anyhow::Result<MergeOutcome> {
        let prior = self.load().await?;
        let (kept, evicted_rows) = evict_window(prior, window);

        if new_rows.is_empty() {
            warn!(path = %self.path.display(), "no new data to save; cache left untouched");
            return Ok(MergeOutcome::SkippedNoNewData);
        }

        let stats = MergeStats {
            new_rows: new_rows.len(),
            kept_rows: kept.len(),
            evicted_rows,
        };

        let merged = if kept.is_empty() {
            new_rows
        } else {
            let mut merged = new_rows;
            merged.extend(kept);
            merged
        };

        self.write(&merged).await?;
        if stats.kept_rows == 0 {
            info!(rows = stats.new_rows, "new data saved; no historical rows survived");
        } else {
            info!(
                new_rows = stats.new_rows,
                kept_rows = stats.kept_rows,
                evicted_rows = stats.evicted_rows,
                "cache updated"
            );
        }
        Ok(MergeOutcome::Written(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drc_core::PlatformType;
    use tempfile::tempdir;

    fn row(date: &str, name: Option<&str>) -> ReportRow {
        ReportRow {
            date: date.to_string(),
            campaign_name: name.map(str::to_string),
            campaign_id: "42".into(),
            device: "MOBILE".into(),
            impressions: 100,
            clicks: 7,
            cost: 1.44,
            account: "client-a".into(),
            source: "yandex".into(),
            platform_type: PlatformType::Search,
            campaign_category: "brand".into(),
        }
    }

    #[test]
    fn report_hashing_is_stable() {
        let hash = ReportFileStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn cache_codec_uses_windows_1251_and_semicolons() {
        let rows = vec![row("2024-01-01", Some("бренд;москва")), row("2024-01-02", None)];
        let bytes = encode_cache(&rows).unwrap();

        assert!(std::str::from_utf8(&bytes).is_err(), "cyrillic must not be utf-8");
        let (text, _, _) = WINDOWS_1251.decode(&bytes);
        let header = text.lines().next().unwrap();
        assert_eq!(header, CACHE_COLUMNS.join(";"));

        let decoded = decode_cache(&bytes).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn empty_row_set_still_writes_header() {
        let bytes = encode_cache(&[]).unwrap();
        let (text, _, _) = WINDOWS_1251.decode(&bytes);
        assert_eq!(text.trim_end(), CACHE_COLUMNS.join(";"));
        assert!(decode_cache(&bytes).unwrap().is_empty());
    }

    #[test]
    fn malformed_cache_row_is_reported() {
        let text = format!("{}\n2024-01-01;x;1;d;not-a-number;1;1.0;a;yandex;search;brand\n", CACHE_COLUMNS.join(";"));
        let (bytes, _, _) = WINDOWS_1251.encode(&text);
        let err = decode_cache(&bytes).unwrap_err();
        assert!(matches!(err, CacheFormatError::Row { .. }));
    }

    #[test]
    fn characters_outside_cp1251_are_replaced_before_quoting() {
        let bytes = encode_cache(&[row("2024-01-01", Some("Café_srch"))]).unwrap();
        let (text, _, _) = WINDOWS_1251.decode(&bytes);

        assert!(!text.contains("&#"));
        let line = text.lines().nth(1).unwrap();
        assert_eq!(line.split(';').count(), CACHE_COLUMNS.len());
        let decoded = decode_cache(&bytes).unwrap();
        assert_eq!(decoded[0].campaign_name.as_deref(), Some("Caf?_srch"));
    }

    #[test]
    fn cache_charset_keeps_cyrillic_untouched() {
        assert!(matches!(to_cache_charset("бренд_srch"), Cow::Borrowed(_)));
        assert_eq!(to_cache_charset("naïve €5 ✓"), "na?ve €5 ?");
    }

    #[test]
    fn foreign_platform_labels_are_read_leniently() {
        let text = format!(
            "{}\n\
2024-01-01;a;1;d;1;1;1.0;acc;yandex;поиск;brand\n\
2024-01-01;b;1;d;1;1;1.0;acc;yandex;сеть;brand\n\
2024-01-01;c;1;d;1;1;1.0;acc;yandex;hand-edited;brand\n",
            CACHE_COLUMNS.join(";")
        );
        let (bytes, _, _) = WINDOWS_1251.encode(&text);

        let platforms: Vec<_> = decode_cache(&bytes)
            .unwrap()
            .into_iter()
            .map(|r| r.platform_type)
            .collect();
        assert_eq!(
            platforms,
            vec![PlatformType::Search, PlatformType::Network, PlatformType::Error]
        );
    }

    #[tokio::test]
    async fn temp_report_is_overwritten_in_place() {
        let dir = tempdir().expect("tempdir");
        let store = ReportFileStore::new(dir.path().join("out"));

        let first = store.store_temp_report("temp.tsv", "first body").await.unwrap();
        let second = store.store_temp_report("temp.tsv", "second").await.unwrap();

        assert_eq!(first.path, second.path);
        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(store.read_temp_report(&second.path).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheStore::new(dir.path().join("cache.csv"));
        cache.write(&[row("2024-01-01", Some("a"))]).await.unwrap();
        cache.write(&[row("2024-01-02", Some("b"))]).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["cache.csv".to_string()]);
        assert_eq!(cache.load().await.unwrap()[0].date, "2024-01-02");
    }

    #[tokio::test]
    async fn zero_byte_cache_is_treated_as_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("cache.csv");
        std::fs::write(&path, b"").unwrap();
        assert!(CacheStore::new(&path).load().await.unwrap().is_empty());
    }
}

//! Output encoders and the file sink that persists batches.
//!
//! Every format is produced from the same ranked `[TestedConfig]` slice.
//! Files are written atomically (`.tmp` then rename) so a crash mid-write
//! never leaves a truncated output behind.

pub mod clash;
pub mod csv;
pub mod singbox;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::batch::{Batch, OutputSink};
use crate::codec::{Codec, ConfigDetails};
use crate::error::PersistError;
use crate::tester::TestedConfig;

/// Subdirectory of the output dir receiving incremental batches.
const BATCH_DIR: &str = "batches";

/// Consumer-facing serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Newline-delimited URIs.
    Raw,
    /// Base64 of the raw list (subscription format).
    Base64,
    Csv,
    Clash,
    Singbox,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 5] = [Self::Raw, Self::Base64, Self::Csv, Self::Clash, Self::Singbox];

    /// File name of this format's final output.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Raw => "proxies.txt",
            Self::Base64 => "proxies_base64.txt",
            Self::Csv => "proxies.csv",
            Self::Clash => "clash.yaml",
            Self::Singbox => "singbox.json",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => write!(f, "raw"),
            Self::Base64 => write!(f, "base64"),
            Self::Csv => write!(f, "csv"),
            Self::Clash => write!(f, "clash"),
            Self::Singbox => write!(f, "singbox"),
        }
    }
}

/// Serialize `records` (already ranked) as `format`.
pub fn encode(format: OutputFormat, records: &[TestedConfig]) -> Result<String, PersistError> {
    match format {
        OutputFormat::Raw => Ok(raw_list(records)),
        OutputFormat::Base64 => Ok(STANDARD.encode(raw_list(records))),
        OutputFormat::Csv => Ok(csv::encode(records)),
        OutputFormat::Clash => Ok(clash::encode(records)),
        OutputFormat::Singbox => singbox::encode(records),
    }
}

fn raw_list(records: &[TestedConfig]) -> String {
    let mut out = String::with_capacity(records.iter().map(|r| r.config.raw_text.len() + 1).sum());
    for record in records {
        out.push_str(&record.config.raw_text);
        out.push('\n');
    }
    out
}

/// Unique, human-readable proxy names used as Clash names and sing-box tags.
///
/// Uses the config's display name when it has one, otherwise
/// `Protocol-host:port`; collisions get a numeric suffix.
pub(crate) fn proxy_names(records: &[TestedConfig], details: &[Option<ConfigDetails>]) -> Vec<String> {
    let mut used: HashSet<String> = HashSet::with_capacity(records.len());
    records
        .iter()
        .zip(details)
        .map(|(record, detail)| {
            let base = detail
                .as_ref()
                .and_then(|d| d.name.clone())
                .unwrap_or_else(|| {
                    format!(
                        "{}-{}:{}",
                        record.config.protocol.display_name(),
                        record.config.host,
                        record.config.port
                    )
                });
            let mut name = base.clone();
            let mut n = 2;
            while !used.insert(name.clone()) {
                name = format!("{base} #{n}");
                n += 1;
            }
            name
        })
        .collect()
}

/// Structured fields of every record, in order. `None` where the raw text
/// no longer parses (never expected for records that came through the codec).
pub(crate) fn record_details(records: &[TestedConfig]) -> Vec<Option<ConfigDetails>> {
    let codec = Codec::new();
    records
        .iter()
        .map(|r| codec.details(&r.config.raw_text).map(|(_, d)| d))
        .collect()
}

/// First non-empty query / JSON parameter among `keys`.
pub(crate) fn param<'a>(details: &'a ConfigDetails, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| details.params.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

pub(crate) fn truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes")
    )
}

/// `user:pass` userinfo split; a bare value is a username.
pub(crate) fn split_user_pass(credential: Option<&str>) -> (Option<String>, Option<String>) {
    match credential {
        Some(c) => match c.split_once(':') {
            Some((u, p)) => (Some(u.to_string()), Some(p.to_string())),
            None => (Some(c.to_string()), None),
        },
        None => (None, None),
    }
}

/// Write `contents` to `path` via a sibling `.tmp` file and a rename.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PersistError::io(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| PersistError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| PersistError::io(path, e))?;
    Ok(())
}

/// Writes every configured format to the output directory.
///
/// Layout:
/// - `<dir>/<format file>`: final output
/// - `<dir>/cumulative_<format file>`: running cumulative output
/// - `<dir>/batches/batch_NNNN_<format file>`: incremental batches
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
    formats: Vec<OutputFormat>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>, formats: Vec<OutputFormat>) -> Self {
        Self {
            dir: dir.into(),
            formats,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn batch_path(&self, index: usize, format: OutputFormat) -> PathBuf {
        self.dir
            .join(BATCH_DIR)
            .join(format!("batch_{index:04}_{}", format.file_name()))
    }

    pub fn cumulative_path(&self, format: OutputFormat) -> PathBuf {
        self.dir.join(format!("cumulative_{}", format.file_name()))
    }

    pub fn final_path(&self, format: OutputFormat) -> PathBuf {
        self.dir.join(format.file_name())
    }

    async fn write_all<F>(&self, records: &[TestedConfig], path_for: F) -> Result<(), PersistError>
    where
        F: Fn(OutputFormat) -> PathBuf,
    {
        for format in &self.formats {
            let body = encode(*format, records)?;
            write_atomic(&path_for(*format), body.as_bytes()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl OutputSink for FileSink {
    async fn write_batch(&self, batch: &Batch) -> Result<(), PersistError> {
        self.write_all(&batch.members, |f| self.batch_path(batch.index, f)).await?;
        tracing::info!(
            batch = batch.index,
            records = batch.members.len(),
            cumulative = batch.cumulative,
            "output: batch written"
        );
        Ok(())
    }

    async fn write_cumulative(&self, records: &[TestedConfig]) -> Result<(), PersistError> {
        self.write_all(records, |f| self.cumulative_path(f)).await
    }

    async fn write_final(&self, records: &[TestedConfig]) -> Result<(), PersistError> {
        self.write_all(records, |f| self.final_path(f)).await?;
        tracing::info!(records = records.len(), dir = %self.dir.display(), "output: final results written");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::tested;
    use super::*;

    #[test]
    fn raw_and_base64_agree() {
        let records = vec![
            tested("trojan://pw@a.example.com:443#a", Some(10.0)),
            tested("trojan://pw@b.example.com:443#b", None),
        ];
        let raw = encode(OutputFormat::Raw, &records).unwrap();
        assert_eq!(raw, "trojan://pw@a.example.com:443#a\ntrojan://pw@b.example.com:443#b\n");
        let b64 = encode(OutputFormat::Base64, &records).unwrap();
        assert_eq!(STANDARD.decode(b64).unwrap(), raw.as_bytes());
    }

    #[test]
    fn names_are_unique() {
        let records = vec![
            tested("trojan://pw@a.example.com:443#same", None),
            tested("trojan://pw2@b.example.com:443#same", None),
            tested("trojan://pw3@c.example.com:443", None),
        ];
        let names = proxy_names(&records, &record_details(&records));
        assert_eq!(names, vec!["same", "same #2", "Trojan-c.example.com:443"]);
    }

    #[test]
    fn format_names_round_trip_through_serde() {
        let json = serde_json::to_string(&OutputFormat::ALL).unwrap();
        assert_eq!(json, r#"["raw","base64","csv","clash","singbox"]"#);
    }

    #[tokio::test]
    async fn file_sink_writes_every_format() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path(), OutputFormat::ALL.to_vec());
        let records = vec![tested("trojan://pw@a.example.com:443#a", Some(12.5))];

        sink.write_final(&records).await.unwrap();
        for format in OutputFormat::ALL {
            assert!(sink.final_path(format).exists(), "missing {format}");
        }

        let batch = Batch {
            index: 3,
            members: records.clone(),
            cumulative: false,
        };
        sink.write_batch(&batch).await.unwrap();
        let raw = tokio::fs::read_to_string(sink.batch_path(3, OutputFormat::Raw))
            .await
            .unwrap();
        assert_eq!(raw.lines().count(), 1);
        assert!(sink
            .batch_path(3, OutputFormat::Raw)
            .ends_with("batches/batch_0003_proxies.txt"));
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.txt");
        write_atomic(&path, b"hello").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "hello");
        assert!(!dir.path().join("nested").join("out.txt.tmp").exists());
    }

    #[tokio::test]
    async fn write_into_file_path_fails_with_persist_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        tokio::fs::write(&blocker, "x").await.unwrap();
        let sink = FileSink::new(&blocker, vec![OutputFormat::Raw]);
        let err = sink
            .write_final(&[tested("trojan://pw@a.example.com:443", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Io { .. }));
    }
}

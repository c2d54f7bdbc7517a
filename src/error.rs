//! Typed errors for the configuration, fetch and persistence boundaries.
//!
//! Routine malformed input never surfaces here: codecs return `Option`,
//! state-machine rejections return `false`. Only problems an operator has
//! to act on are modelled as errors.

use std::path::PathBuf;

/// Run-fatal configuration problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no sources configured; at least one [[sources]] entry is required")]
    NoSources,

    #[error("invalid source '{url}': {reason}")]
    InvalidSource { url: String, reason: String },

    #[error("invalid filter pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Per-source retrieval failures. Recoverable: the source is skipped for
/// the current round and marked with a `Failure` event.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("giving up on {url} after {attempts} attempt(s): {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: String,
    },

    #[error("fetch of {url} cancelled")]
    Cancelled { url: String },
}

/// Failure to write a batch, an output file or the proxy history.
///
/// In-memory accumulation is never rolled back when one of these is
/// returned, so the next flush attempt can succeed without data loss.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {format} output: {reason}")]
    Encode { format: String, reason: String },
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_sources_message_mentions_sources_table() {
        assert!(ConfigError::NoSources.to_string().contains("[[sources]]"));
    }

    #[test]
    fn fetch_error_display_includes_url() {
        let err = FetchError::Status {
            url: "https://example.com/sub".into(),
            status: 503,
        };
        assert_eq!(err.to_string(), "https://example.com/sub returned HTTP 503");
    }

    #[test]
    fn persist_error_io_keeps_path() {
        let err = PersistError::io(
            "/tmp/out/batch.txt",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/out/batch.txt"));
        assert!(msg.contains("denied"));
    }
}

use std::path::PathBuf;

use chrono::NaiveDate;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The event source directory or file does not exist. Expected on fresh
    /// installs; callers treat it as zero events.
    #[error("event source not found: {}", .0.display())]
    SourceAbsent(PathBuf),
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store encoding error: {0}")]
    Bitcode(#[from] bitcode::Error),
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("{provider}: fetch failed: {message}")]
    Fetch { provider: String, message: String },
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Attribute a read failure to the provider whose fetch hit it.
    pub fn fetch(provider: &str, cause: impl std::fmt::Display) -> Self {
        Error::Fetch {
            provider: provider.to_string(),
            message: cause.to_string(),
        }
    }

    pub fn is_source_absent(&self) -> bool {
        matches!(self, Error::SourceAbsent(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

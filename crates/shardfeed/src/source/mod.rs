//! Data sources.
//!
//! A source adapter knows how to fetch a batch of records from some external
//! service and how to turn each record into a row of scalar values.  The rest
//! of the pipeline never looks inside a [`Record`]; it only routes records
//! from the adapter back into the adapter's own [`SourceAdapter::extract_values`].

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

mod generator;
mod opensky;
mod registry;
mod value;

pub use generator::GeneratorSource;
pub use opensky::OpenSkySource;
pub use registry::{SourceFactory, SourceRegistry};
pub use value::Value;

/// A single record, opaque to everything but the adapter that produced it.
pub type Record = serde_json::Value;

/// All records fetched in one polling cycle.
///
/// The batch is immutable once fetched, so every table worker reads the same
/// ordered sequence without copying it.
pub type Batch = Arc<[Record]>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unknown source adapter '{0}'")]
    UnknownSource(String),

    #[error("invalid configuration for source '{source_name}': {reason}")]
    InvalidConfig { source_name: String, reason: String },

    #[error("failed to fetch data: {0}")]
    Fetch(String),

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("invalid poll interval: {0}")]
    InvalidInterval(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl SourceError {
    pub fn invalid_config(source_name: &str, reason: impl ToString) -> Self {
        Self::InvalidConfig {
            source_name: source_name.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Capability surface of a data source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Name under which the adapter is registered.
    fn name(&self) -> &str;

    /// Startup check, e.g., that the configured credentials are accepted.
    /// A failure here aborts the process.
    async fn validate(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Fetches one batch of records.
    async fn fetch_batch(&self) -> Result<Vec<Record>, SourceError>;

    /// Column names, in insert order.
    fn field_names(&self) -> Vec<String>;

    /// Column values of `record`, aligned with [`Self::field_names`].
    fn extract_values(&self, record: &Record) -> Result<Vec<Value>, SourceError>;

    /// Column definitions in the backing store's DDL syntax, e.g. `(id INT)`.
    fn schema(&self) -> String;

    /// Base name of every table written for this source.
    fn table_prefix(&self) -> String;

    /// Seconds to wait between two successful fetches.
    fn poll_interval_secs(&self) -> Result<u64, SourceError>;
}

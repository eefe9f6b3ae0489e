use super::{Record, SourceAdapter, SourceError, Value};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use serde_yaml::Value as YamlValue;
use std::sync::atomic::{AtomicU64, Ordering};

fn default_records_per_batch() -> u64 {
    10
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct GeneratorConfig {
    #[serde(default = "default_records_per_batch")]
    records_per_batch: u64,
    #[serde(default = "default_interval")]
    interval: u64,
}

/// Synthetic source producing numbered records.
///
/// Useful for smoke-testing a deployment without any external service.
#[derive(Debug)]
pub struct GeneratorSource {
    records_per_batch: u64,
    interval: u64,
    next_seq: AtomicU64,
}

impl GeneratorSource {
    pub const NAME: &'static str = "generator";

    pub fn new(records_per_batch: u64, interval: u64) -> Self {
        Self {
            records_per_batch,
            interval,
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &YamlValue) -> Result<Self, SourceError> {
        let config: GeneratorConfig = if config.is_null() {
            serde_yaml::from_str("{}")
        } else {
            serde_yaml::from_value(config.clone())
        }
        .map_err(|e| SourceError::invalid_config(Self::NAME, e))?;

        Ok(Self::new(config.records_per_batch, config.interval))
    }
}

#[async_trait]
impl SourceAdapter for GeneratorSource {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn fetch_batch(&self) -> Result<Vec<Record>, SourceError> {
        let first = self
            .next_seq
            .fetch_add(self.records_per_batch, Ordering::Relaxed);
        let ts = chrono::Utc::now().timestamp();

        Ok((first..first + self.records_per_batch)
            .map(|seq| json!({ "seq": seq, "ts": ts, "payload": format!("record-{seq}") }))
            .collect())
    }

    fn field_names(&self) -> Vec<String> {
        vec!["seq".to_string(), "ts".to_string(), "payload".to_string()]
    }

    fn extract_values(&self, record: &Record) -> Result<Vec<Value>, SourceError> {
        self.field_names()
            .iter()
            .map(|field| {
                record
                    .get(field)
                    .map(Value::from_json)
                    .ok_or_else(|| SourceError::MalformedRecord(format!("missing field '{field}'")))
            })
            .collect()
    }

    fn schema(&self) -> String {
        "(seq BIGINT, ts BIGINT, payload TEXT)".to_string()
    }

    fn table_prefix(&self) -> String {
        "generated".to_string()
    }

    fn poll_interval_secs(&self) -> Result<u64, SourceError> {
        Ok(self.interval)
    }
}

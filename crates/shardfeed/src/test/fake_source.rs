use crate::source::{Record, SourceAdapter, SourceError, Value};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Source that replays a fixed script of fetch results.
///
/// Records look like `{"id": 1, "name": "a"}`.  Once the script is exhausted
/// every fetch fails.
pub struct FakeSource {
    script: Mutex<VecDeque<Result<Vec<Record>, SourceError>>>,
    interval: u64,
    fetches: AtomicUsize,
}

impl FakeSource {
    pub fn new(interval: u64) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            interval,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn record(id: i64, name: &str) -> Record {
        json!({ "id": id, "name": name })
    }

    pub fn with_batch(self, records: Vec<Record>) -> Self {
        self.script.lock().unwrap().push_back(Ok(records));
        self
    }

    pub fn with_error(self, message: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(SourceError::Fetch(message.to_string())));
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    async fn fetch_batch(&self) -> Result<Vec<Record>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SourceError::Fetch("script exhausted".to_string())))
    }

    fn field_names(&self) -> Vec<String> {
        vec!["id".to_string(), "name".to_string()]
    }

    fn extract_values(&self, record: &Record) -> Result<Vec<Value>, SourceError> {
        let id = record
            .get("id")
            .and_then(|id| id.as_i64())
            .ok_or_else(|| SourceError::MalformedRecord(format!("no integer id in {record}")))?;
        let name = record
            .get("name")
            .and_then(|name| name.as_str())
            .ok_or_else(|| SourceError::MalformedRecord(format!("no name in {record}")))?;

        Ok(vec![Value::Int(id), Value::Text(name.to_string())])
    }

    fn schema(&self) -> String {
        "(id BIGINT, name TEXT)".to_string()
    }

    fn table_prefix(&self) -> String {
        "events".to_string()
    }

    fn poll_interval_secs(&self) -> Result<u64, SourceError> {
        Ok(self.interval)
    }
}

//! OpenSky Network live flight states.
//!
//! Every state vector returned by `GET /api/states/all` becomes one record.
//! The response timestamp is prepended to the state vector, so a record is a
//! JSON array whose positions line up with [`FIELDS`].

use super::{Record, SourceAdapter, SourceError, Value};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use std::time::Duration;

const DEFAULT_URL: &str = "https://opensky-network.org/api/states/all";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Column names and types, in state-vector order.
const FIELDS: &[(&str, &str)] = &[
    ("time", "INT"),
    ("icao24", "VARCHAR(10)"),
    ("callsign", "VARCHAR(10)"),
    ("origin_country", "VARCHAR(50)"),
    ("time_position", "INT"),
    ("last_contact", "INT"),
    ("longitude", "FLOAT"),
    ("latitude", "FLOAT"),
    ("baro_altitude", "FLOAT"),
    ("on_ground", "BOOLEAN"),
    ("velocity", "FLOAT"),
    ("true_track", "FLOAT"),
    ("vertical_rate", "FLOAT"),
    ("sensors", "JSON"),
    ("geo_altitude", "FLOAT"),
    ("squawk", "VARCHAR(10)"),
    ("spi", "BOOLEAN"),
    ("position_source", "INT"),
];

#[derive(Debug, Clone, Deserialize)]
struct Auth {
    user: String,
    pass: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenSkyConfig {
    auth: Auth,
    #[serde(default)]
    interval: u64,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatesResponse {
    time: i64,
    #[serde(default)]
    states: Option<Vec<Vec<JsonValue>>>,
}

impl StatesResponse {
    fn into_records(self) -> Vec<Record> {
        let time = self.time;
        self.states
            .unwrap_or_default()
            .into_iter()
            .map(|state| {
                let mut record = Vec::with_capacity(FIELDS.len());
                record.push(JsonValue::from(time));
                record.extend(state);
                JsonValue::Array(record)
            })
            .collect()
    }
}

pub struct OpenSkySource {
    client: Client,
    url: String,
    user: String,
    pass: String,
    interval: u64,
}

impl OpenSkySource {
    pub const NAME: &'static str = "opensky";

    pub fn from_config(config: &YamlValue) -> Result<Self, SourceError> {
        let config: OpenSkyConfig = serde_yaml::from_value(config.clone())
            .map_err(|e| SourceError::invalid_config(Self::NAME, e))?;

        if config.auth.user.is_empty() || config.auth.pass.is_empty() {
            return Err(SourceError::invalid_config(
                Self::NAME,
                "missing user or pass in auth",
            ));
        }

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            url: config.url.unwrap_or_else(|| DEFAULT_URL.to_string()),
            user: config.auth.user,
            pass: config.auth.pass,
            interval: config.interval,
        })
    }

    async fn get(&self) -> Result<reqwest::Response, SourceError> {
        Ok(self
            .client
            .get(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .send()
            .await?)
    }
}

#[async_trait]
impl SourceAdapter for OpenSkySource {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn validate(&self) -> Result<(), SourceError> {
        let response = self.get().await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(SourceError::invalid_config(
                Self::NAME,
                format!("invalid credentials, status code: {status}"),
            )),
        }
    }

    async fn fetch_batch(&self) -> Result<Vec<Record>, SourceError> {
        let response = self.get().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Fetch(format!(
                "{} responded with HTTP {status}",
                self.url
            )));
        }

        let states: StatesResponse = response.json().await?;
        Ok(states.into_records())
    }

    fn field_names(&self) -> Vec<String> {
        FIELDS.iter().map(|(name, _)| name.to_string()).collect()
    }

    fn extract_values(&self, record: &Record) -> Result<Vec<Value>, SourceError> {
        let state = record
            .as_array()
            .ok_or_else(|| SourceError::MalformedRecord("state vector is not an array".into()))?;
        if state.len() < FIELDS.len() {
            return Err(SourceError::MalformedRecord(format!(
                "state vector has {} entries, expected {}",
                state.len(),
                FIELDS.len()
            )));
        }

        // Newer API versions append extra entries (e.g. `category`); they are ignored.
        Ok(state[..FIELDS.len()].iter().map(Value::from_json).collect())
    }

    fn schema(&self) -> String {
        let columns = FIELDS
            .iter()
            .map(|(name, ty)| format!("{name} {ty}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("({columns})")
    }

    fn table_prefix(&self) -> String {
        "flights".to_string()
    }

    fn poll_interval_secs(&self) -> Result<u64, SourceError> {
        Ok(self.interval)
    }
}

#[cfg(test)]
mod test {
    use super::{OpenSkySource, StatesResponse, FIELDS};
    use crate::source::{SourceAdapter, SourceError, Value};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(url: &str) -> OpenSkySource {
        let config = serde_yaml::from_str(&format!(
            "auth: {{ user: alice, pass: secret }}\ninterval: 10\nurl: {url}/api/states/all"
        ))
        .unwrap();
        OpenSkySource::from_config(&config).unwrap()
    }

    fn state(icao: &str) -> serde_json::Value {
        json!([
            icao, "DLH4AB  ", "Germany", 1700000000, 1700000001, 8.5, 50.03, 1200.5, false,
            140.2, 270.0, -3.2, null, 1250.0, "1000", false, 0
        ])
    }

    #[test]
    fn schema_matches_field_names() {
        let source = source("http://localhost");
        let names = source.field_names();
        assert_eq!(names.len(), FIELDS.len());
        assert_eq!(names[0], "time");
        assert!(source.schema().starts_with("(time INT, icao24 VARCHAR(10),"));
        assert_eq!(source.table_prefix(), "flights");
        assert_eq!(source.poll_interval_secs().unwrap(), 10);
    }

    #[test]
    fn missing_credentials() {
        let config = serde_yaml::from_str("auth: { user: alice, pass: '' }").unwrap();
        let err = OpenSkySource::from_config(&config).err().unwrap();
        assert!(matches!(err, SourceError::InvalidConfig { .. }));
    }

    #[test]
    fn records_prepend_response_time() {
        let response: StatesResponse = serde_json::from_value(json!({
            "time": 1700000002,
            "states": [state("3c6444"), state("4b1805")]
        }))
        .unwrap();
        let records = response.into_records();
        assert_eq!(records.len(), 2);

        let source = source("http://localhost");
        let values = source.extract_values(&records[1]).unwrap();
        assert_eq!(values.len(), FIELDS.len());
        assert_eq!(values[0], Value::Int(1700000002));
        assert_eq!(values[1], Value::Text("4b1805".to_string()));
        assert_eq!(values[9], Value::Bool(false));
        assert_eq!(values[13], Value::Null);
    }

    #[test]
    fn null_states() {
        let response: StatesResponse =
            serde_json::from_value(json!({ "time": 1, "states": null })).unwrap();
        assert!(response.into_records().is_empty());
    }

    #[test]
    fn short_state_vector_is_malformed() {
        let source = source("http://localhost");
        assert!(source.extract_values(&json!([1, "abc"])).is_err());
        assert!(source.extract_values(&json!({"time": 1})).is_err());
    }

    #[tokio::test]
    async fn fetch_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/states/all"))
            .and(header("authorization", "Basic YWxpY2U6c2VjcmV0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "time": 1700000002,
                "states": [state("3c6444")]
            })))
            .mount(&server)
            .await;

        let source = source(&server.uri());
        source.validate().await.unwrap();
        let records = source.fetch_batch().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0][1], "3c6444");
    }

    #[tokio::test]
    async fn rejected_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let source = source(&server.uri());
        assert!(source.validate().await.is_err());
        assert!(matches!(
            source.fetch_batch().await,
            Err(SourceError::Fetch(_))
        ));
    }
}

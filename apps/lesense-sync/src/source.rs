use crate::checkpoint::Cursor;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::fmt;

const SENSOR_PATH: &str = "sensor";

#[derive(Debug, thiserror::Error)]
pub enum SourceFetchError {
    #[error("lesense request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("lesense returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode lesense response: {0}")]
    Decode(String),
    /// Upstream sent a record outside the documented shape.
    #[error("lesense record #{index} violates the feed contract: {reason}")]
    Contract { index: usize, reason: String },
}

impl From<reqwest::Error> for SourceFetchError {
    fn from(err: reqwest::Error) -> Self {
        // The token rides in the query string; keep it out of logs.
        SourceFetchError::Transport(err.without_url())
    }
}

/// Sensor category as reported by Lesense. Unknown categories keep their raw name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorKind {
    General { port: i64 },
    Switch { port: i64 },
    Temperature,
    Humidity,
    Other(String),
}

impl SensorKind {
    fn classify(kind: &str, port: Option<i64>) -> Result<Self, String> {
        match kind {
            "General" => port
                .map(|port| SensorKind::General { port })
                .ok_or_else(|| "General reading without a port".to_string()),
            "Switch" => port
                .map(|port| SensorKind::Switch { port })
                .ok_or_else(|| "Switch reading without a port".to_string()),
            "Temperature" => Ok(SensorKind::Temperature),
            "Humidity" => Ok(SensorKind::Humidity),
            "" => Err("reading without a type".to_string()),
            other => Ok(SensorKind::Other(other.to_string())),
        }
    }
}

/// Scalar reading value, passed to the sink unchanged.
#[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Number(serde_json::Number),
    Bool(bool),
    Text(String),
}

impl From<f64> for ReadingValue {
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value)
            .map(ReadingValue::Number)
            .unwrap_or_else(|| ReadingValue::Text(value.to_string()))
    }
}

impl From<i64> for ReadingValue {
    fn from(value: i64) -> Self {
        ReadingValue::Number(value.into())
    }
}

impl From<&str> for ReadingValue {
    fn from(value: &str) -> Self {
        ReadingValue::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub kind: SensorKind,
    pub value: ReadingValue,
    /// Seconds since epoch; the feed's ordering key.
    pub collected: i64,
    pub collected_at: DateTime<Utc>,
}

impl SourceRecord {
    pub fn new(kind: SensorKind, value: impl Into<ReadingValue>, collected: i64) -> Option<Self> {
        let collected_at = Utc.timestamp_opt(collected, 0).single()?;
        Some(Self {
            kind,
            value: value.into(),
            collected,
            collected_at,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePage {
    pub items: Vec<SourceRecord>,
}

#[derive(Deserialize)]
struct RawPage {
    items: Vec<RawRecord>,
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    port: Option<i64>,
    value: ReadingValue,
    collected: i64,
}

impl RawPage {
    fn into_page(self) -> Result<SourcePage, SourceFetchError> {
        let mut items = Vec::with_capacity(self.items.len());
        for (index, raw) in self.items.into_iter().enumerate() {
            let kind = SensorKind::classify(raw.kind.trim(), raw.port)
                .map_err(|reason| SourceFetchError::Contract { index, reason })?;
            let record = SourceRecord::new(kind, raw.value, raw.collected).ok_or_else(|| {
                SourceFetchError::Contract {
                    index,
                    reason: format!("collected {} is not a valid timestamp", raw.collected),
                }
            })?;
            items.push(record);
        }
        Ok(SourcePage { items })
    }
}

pub(crate) fn decode_page(body: &mut [u8]) -> Result<SourcePage, SourceFetchError> {
    let raw: RawPage = simd_json::serde::from_slice(body)
        .map_err(|err| SourceFetchError::Decode(err.to_string()))?;
    raw.into_page()
}

#[async_trait]
pub trait SensorSource: Send + Sync {
    /// Readings strictly after `cursor`, or the default feed window when `cursor` is `None`.
    async fn fetch(
        &self,
        token: &str,
        cursor: Option<Cursor>,
    ) -> Result<SourcePage, SourceFetchError>;
}

pub struct LesenseClient {
    http: Client,
    base_url: String,
}

impl fmt::Debug for LesenseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LesenseClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl LesenseClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }
}

#[async_trait]
impl SensorSource for LesenseClient {
    async fn fetch(
        &self,
        token: &str,
        cursor: Option<Cursor>,
    ) -> Result<SourcePage, SourceFetchError> {
        let url = format!("{}/{SENSOR_PATH}", self.base_url);
        let mut request = self.http.get(url).query(&[("token", token)]);
        if let Some(cursor) = cursor {
            request = request.query(&[("after", cursor.fetch_after())]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceFetchError::Status { status, body });
        }

        let mut body = response.bytes().await?.to_vec();
        let page = decode_page(&mut body)?;
        tracing::debug!(
            items = page.items.len(),
            after = ?cursor.map(Cursor::fetch_after),
            "fetched lesense page"
        );
        Ok(page)
    }
}

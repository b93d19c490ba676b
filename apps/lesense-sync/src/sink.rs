use crate::source::ReadingValue;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::fmt;

const DATA_PATH: &str = "data";
const DEVICE_TOKEN_HEADER: &str = "Device-Token";

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("tago request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("tago returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("tago rejected request: {message}")]
    Rejected { message: String },
    #[error("failed to decode tago response: {0}")]
    Decode(String),
    #[error("stored checkpoint {value} is not a timestamp")]
    InvalidCheckpoint { value: String },
}

/// One data point as accepted by the TagoIO device data API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkVariable {
    pub variable: String,
    pub value: ReadingValue,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_millis"
    )]
    pub time: Option<DateTime<Utc>>,
    #[serde(rename = "serie", skip_serializing_if = "Option::is_none")]
    pub series: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

fn serialize_millis<S: Serializer>(
    time: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match time {
        Some(time) => serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Millis, true)),
        None => serializer.serialize_none(),
    }
}

#[async_trait]
pub trait DeviceSink: Send + Sync {
    /// Latest stored value of `variable`, if it was ever written.
    async fn last_value(&self, token: &str, variable: &str)
        -> Result<Option<JsonValue>, SinkError>;

    /// Persists `batch` in order as one request.
    async fn insert(&self, token: &str, batch: &[SinkVariable]) -> Result<usize, SinkError>;
}

#[derive(Deserialize)]
struct TagoEnvelope {
    status: bool,
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct StoredData {
    value: JsonValue,
}

pub struct TagoDeviceClient {
    http: Client,
    base_url: String,
}

impl fmt::Debug for TagoDeviceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagoDeviceClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl TagoDeviceClient {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    fn data_url(&self) -> String {
        format!("{}/{DATA_PATH}", self.base_url)
    }

    async fn read_envelope(response: reqwest::Response) -> Result<Option<JsonValue>, SinkError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SinkError::Status { status, body });
        }
        let envelope: TagoEnvelope =
            serde_json::from_str(&body).map_err(|err| SinkError::Decode(err.to_string()))?;
        if !envelope.status {
            let message = envelope
                .message
                .or_else(|| envelope.result.as_ref().map(|r| r.to_string()))
                .unwrap_or_else(|| "no message".to_string());
            return Err(SinkError::Rejected { message });
        }
        Ok(envelope.result)
    }
}

#[async_trait]
impl DeviceSink for TagoDeviceClient {
    async fn last_value(
        &self,
        token: &str,
        variable: &str,
    ) -> Result<Option<JsonValue>, SinkError> {
        let response = self
            .http
            .get(self.data_url())
            .header(DEVICE_TOKEN_HEADER, token)
            .query(&[("variable", variable), ("query", "last_value")])
            .send()
            .await?;
        let Some(result) = Self::read_envelope(response).await? else {
            return Ok(None);
        };
        let rows: Vec<StoredData> =
            serde_json::from_value(result).map_err(|err| SinkError::Decode(err.to_string()))?;
        Ok(rows.into_iter().next().map(|row| row.value))
    }

    async fn insert(&self, token: &str, batch: &[SinkVariable]) -> Result<usize, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let response = self
            .http
            .post(self.data_url())
            .header(DEVICE_TOKEN_HEADER, token)
            .json(batch)
            .send()
            .await?;
        let result = Self::read_envelope(response).await?;
        tracing::debug!(len = batch.len(), result = ?result, "tago insert accepted");
        Ok(batch.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorded {
        queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
        tokens: Arc<Mutex<Vec<String>>>,
        posted: Arc<Mutex<Vec<JsonValue>>>,
    }

    async fn spawn_tago(
        query_reply: (AxumStatus, JsonValue),
        insert_reply: (AxumStatus, JsonValue),
    ) -> (String, Recorded) {
        let recorded = Recorded::default();
        let app = Router::new()
            .route(
                "/data",
                get(
                    move |State(rec): State<Recorded>,
                          headers: HeaderMap,
                          Query(params): Query<HashMap<String, String>>| {
                        let reply = query_reply.clone();
                        async move {
                            if let Some(token) = headers.get("device-token") {
                                rec.tokens
                                    .lock()
                                    .unwrap()
                                    .push(token.to_str().unwrap().to_string());
                            }
                            rec.queries.lock().unwrap().push(params);
                            (reply.0, Json(reply.1))
                        }
                    },
                )
                .post(
                    move |State(rec): State<Recorded>, Json(body): Json<JsonValue>| {
                        let reply = insert_reply.clone();
                        async move {
                            rec.posted.lock().unwrap().push(body);
                            (reply.0, Json(reply.1))
                        }
                    },
                ),
            )
            .with_state(recorded.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), recorded)
    }

    fn ok_insert() -> (AxumStatus, JsonValue) {
        (AxumStatus::OK, json!({"status": true, "result": "1 Data Added"}))
    }

    #[tokio::test]
    async fn last_value_queries_by_variable_with_device_token() {
        let (base, rec) = spawn_tago(
            (
                AxumStatus::OK,
                json!({"status": true, "result": [{"variable": "last_send", "value": 1600000000}]}),
            ),
            ok_insert(),
        )
        .await;
        let client = TagoDeviceClient::new(Client::new(), base);

        let value = client.last_value("dev-tok", "last_send").await.unwrap();
        assert_eq!(value, Some(json!(1600000000)));

        let queries = rec.queries.lock().unwrap();
        assert_eq!(queries[0].get("variable").map(String::as_str), Some("last_send"));
        assert_eq!(queries[0].get("query").map(String::as_str), Some("last_value"));
        assert_eq!(rec.tokens.lock().unwrap().as_slice(), ["dev-tok".to_string()]);
    }

    #[tokio::test]
    async fn last_value_is_none_on_empty_device() {
        let (base, _rec) = spawn_tago(
            (AxumStatus::OK, json!({"status": true, "result": []})),
            ok_insert(),
        )
        .await;
        let client = TagoDeviceClient::new(Client::new(), base);
        assert_eq!(client.last_value("t", "last_send").await.unwrap(), None);
    }

    #[tokio::test]
    async fn insert_posts_the_batch_in_order() {
        let (base, rec) = spawn_tago(
            (AxumStatus::OK, json!({"status": true, "result": []})),
            ok_insert(),
        )
        .await;
        let client = TagoDeviceClient::new(Client::new(), base);
        let batch = vec![
            SinkVariable {
                variable: "humidity".into(),
                value: ReadingValue::from(40_i64),
                time: chrono::TimeZone::timestamp_opt(&Utc, 10, 0).single(),
                series: Some(10),
                unit: Some(String::new()),
            },
            SinkVariable {
                variable: "last_send".into(),
                value: ReadingValue::from(10_i64),
                time: None,
                series: None,
                unit: None,
            },
        ];

        assert_eq!(client.insert("t", &batch).await.unwrap(), 2);
        let posted = rec.posted.lock().unwrap();
        assert_eq!(
            posted[0],
            json!([
                {"variable": "humidity", "value": 40, "time": "1970-01-01T00:00:10.000Z", "serie": 10, "unit": ""},
                {"variable": "last_send", "value": 10}
            ])
        );
    }

    #[tokio::test]
    async fn rejected_envelope_is_an_error() {
        let (base, _rec) = spawn_tago(
            (AxumStatus::OK, json!({"status": true, "result": []})),
            (AxumStatus::OK, json!({"status": false, "message": "Invalid Device Token"})),
        )
        .await;
        let client = TagoDeviceClient::new(Client::new(), base);
        let batch = vec![SinkVariable {
            variable: "last_send".into(),
            value: ReadingValue::from(1_i64),
            time: None,
            series: None,
            unit: None,
        }];
        match client.insert("t", &batch).await {
            Err(SinkError::Rejected { message }) => assert_eq!(message, "Invalid Device Token"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_status_keeps_body() {
        let (base, _rec) = spawn_tago(
            (AxumStatus::INTERNAL_SERVER_ERROR, json!({"status": false, "message": "down"})),
            ok_insert(),
        )
        .await;
        let client = TagoDeviceClient::new(Client::new(), base);
        match client.last_value("t", "last_send").await {
            Err(SinkError::Status { status, body }) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert!(body.contains("down"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }
}

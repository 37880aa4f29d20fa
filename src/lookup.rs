//! Fetch-and-decode client for enrichment services.
//!
//! Every call is `GET <endpoint>/<key>` with `Accept: application/json`. A
//! response counts as a success only when the status is below 400 and the
//! body decodes to a non-null JSON object.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, Url};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::LookupConfig;
use crate::error::{LookupError, PipelineError, Result};

/// A keyed lookup against an external enrichment service.
#[async_trait]
pub trait LookupService: Send + Sync {
    async fn fetch(
        &self,
        endpoint: &str,
        key: &str,
        timeout: Duration,
    ) -> std::result::Result<Map<String, Value>, LookupError>;
}

/// reqwest-backed lookup client. Cloning shares the underlying connection
/// pool.
#[derive(Debug, Clone)]
pub struct HttpLookupClient {
    client: Client,
    max_error_body_bytes: usize,
}

impl HttpLookupClient {
    pub fn new(config: &LookupConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.default_timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(PipelineError::HttpError)?;

        Ok(Self {
            client,
            max_error_body_bytes: config.max_error_body_bytes,
        })
    }

    /// Builds `<endpoint>/<key>`, percent-encoding the key as one path
    /// segment.
    pub fn url_for(endpoint: &str, key: &str) -> std::result::Result<Url, LookupError> {
        if key.is_empty() {
            return Err(LookupError::InvalidKey("empty key".to_string()));
        }
        let mut url = Url::parse(endpoint)
            .map_err(|e| LookupError::InvalidKey(format!("bad endpoint {}: {}", endpoint, e)))?;
        url.path_segments_mut()
            .map_err(|_| {
                LookupError::InvalidKey(format!("endpoint cannot be a base: {}", endpoint))
            })?
            .pop_if_empty()
            .push(key);
        Ok(url)
    }

    async fn read_error_body(&self, mut response: reqwest::Response) -> String {
        let mut buf: Vec<u8> = Vec::new();
        while buf.len() < self.max_error_body_bytes {
            match response.chunk().await {
                Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
                _ => break,
            }
        }
        buf.truncate(self.max_error_body_bytes);
        String::from_utf8_lossy(&buf).into_owned()
    }

    async fn send(
        &self,
        url: Url,
        timeout: Duration,
    ) -> std::result::Result<Map<String, Value>, LookupError> {
        let timeout_ms = timeout.as_millis() as u64;
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout_ms))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = self.read_error_body(response).await;
            return Err(LookupError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(|e| classify(e, timeout_ms))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(LookupError::EmptyBody);
        }
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(Value::Null) => Err(LookupError::EmptyBody),
            Ok(other) => Err(LookupError::Decode(format!(
                "expected JSON object, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(LookupError::Decode(e.to_string())),
        }
    }
}

#[async_trait]
impl LookupService for HttpLookupClient {
    async fn fetch(
        &self,
        endpoint: &str,
        key: &str,
        timeout: Duration,
    ) -> std::result::Result<Map<String, Value>, LookupError> {
        let url = Self::url_for(endpoint, key)?;
        debug!("Lookup GET {}", url);

        // Outer bound covers body streaming as well as the request itself.
        match tokio::time::timeout(timeout, self.send(url, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(LookupError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

fn classify(err: reqwest::Error, timeout_ms: u64) -> LookupError {
    if err.is_timeout() {
        LookupError::Timeout(timeout_ms)
    } else if err.is_decode() {
        LookupError::Decode(err.to_string())
    } else {
        LookupError::Transport(err.to_string())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> HttpLookupClient {
        HttpLookupClient::new(&LookupConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn fetches_object_with_accept_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/asset/a-1"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"owner": "IT"})))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = format!("{}/asset", server.uri());
        let data = client()
            .fetch(&endpoint, "a-1", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(data.get("owner"), Some(&json!("IT")));
    }

    #[tokio::test]
    async fn error_status_carries_truncated_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("x".repeat(4096)))
            .mount(&server)
            .await;

        let err = client()
            .fetch(&server.uri(), "missing", Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            LookupError::Status { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body.len(), 1024);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn null_and_empty_bodies_are_failures() {
        let server = MockServer::start().await;
        Mock::given(path("/null"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .mount(&server)
            .await;
        Mock::given(path("/empty"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(path("/array"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([1])))
            .mount(&server)
            .await;

        let c = client();
        let t = Duration::from_secs(2);
        assert_eq!(c.fetch(&server.uri(), "null", t).await, Err(LookupError::EmptyBody));
        assert_eq!(c.fetch(&server.uri(), "empty", t).await, Err(LookupError::EmptyBody));
        assert!(matches!(
            c.fetch(&server.uri(), "array", t).await,
            Err(LookupError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn slow_service_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"late": true}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let err = client()
            .fetch(&server.uri(), "k", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, LookupError::Timeout(50));
    }

    #[test]
    fn url_for_encodes_key_as_single_segment() {
        let url = HttpLookupClient::url_for("http://intel:1080/ioc/", "http://evil/x").unwrap();
        assert_eq!(url.as_str(), "http://intel:1080/ioc/http:%2F%2Fevil%2Fx");
        let url = HttpLookupClient::url_for("http://intel:1080/ioc", "evil.exe").unwrap();
        assert_eq!(url.as_str(), "http://intel:1080/ioc/evil.exe");
        assert!(HttpLookupClient::url_for("http://intel", "").is_err());
    }
}

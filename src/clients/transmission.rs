//! Transmission RPC adapter
//!
//! Single RPC endpoint with CSRF protection: the daemon answers 409 with an
//! `X-Transmission-Session-Id` header, and the call is repeated with that
//! id. Limits are KB/s (decimal, `Mbps * 1000 / 8`) gated by
//! `speed-limit-{down,up}-enabled` booleans; disabled means unlimited.

use super::{ACTIVE_WORK_FLOOR_BYTES, READ_TIMEOUT, WRITE_TIMEOUT};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::types::{ClientId, ClientKind, ClientStats, Limits};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::sync::Mutex;

const SESSION_ID_HEADER: &str = "X-Transmission-Session-Id";

/// Adapter for a Transmission daemon
pub struct TransmissionAdapter {
    id: ClientId,
    name: String,
    base: String,
    username: Option<String>,
    password: Option<String>,
    http: reqwest::Client,
    session_id: Mutex<Option<String>>,
    original: Mutex<Option<Limits>>,
}

impl TransmissionAdapter {
    /// Build the adapter from a client definition
    pub fn new(config: &ClientConfig) -> Result<Self> {
        super::parse_base_url(config)?;
        Ok(Self {
            id: ClientId::new(&config.id),
            name: config.name.clone(),
            base: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            http: reqwest::Client::new(),
            session_id: Mutex::new(None),
            original: Mutex::new(None),
        })
    }

    async fn rpc_call(
        &self,
        rpc_method: &str,
        arguments: Value,
        timeout: std::time::Duration,
    ) -> Result<Value> {
        let payload = json!({
            "method": rpc_method,
            "arguments": arguments,
        });

        // One retry after a 409 re-arms the session id
        for attempt in 0..2 {
            let mut request = self
                .http
                .post(format!("{}/transmission/rpc", self.base))
                .json(&payload)
                .timeout(timeout);

            if let Some(session_id) = self.session_id.lock().await.as_deref() {
                request = request.header(SESSION_ID_HEADER, session_id);
            }
            if let (Some(user), Some(pass)) = (&self.username, &self.password) {
                request = request.basic_auth(user, Some(pass));
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::transport(&self.name, e))?;

            if response.status() == StatusCode::CONFLICT {
                let new_id = response
                    .headers()
                    .get(SESSION_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                *self.session_id.lock().await = new_id;
                if attempt == 0 {
                    continue;
                }
                return Err(Error::AuthExpired {
                    client: self.name.clone(),
                });
            }

            let body: Value = response.error_for_status()?.json().await?;
            if body.get("result").and_then(Value::as_str) != Some("success") {
                return Err(Error::Rpc {
                    client: self.name.clone(),
                    message: body
                        .get("result")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                });
            }
            return Ok(body.get("arguments").cloned().unwrap_or(json!({})));
        }

        Err(Error::AuthExpired {
            client: self.name.clone(),
        })
    }

    fn limits_from_session(&self, settings: &Value) -> Limits {
        let down_enabled = settings
            .get("speed-limit-down-enabled")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let up_enabled = settings
            .get("speed-limit-up-enabled")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let down_kbps = if down_enabled {
            settings.get("speed-limit-down").and_then(Value::as_f64).unwrap_or(0.0)
        } else {
            0.0
        };
        let up_kbps = if up_enabled {
            settings.get("speed-limit-up").and_then(Value::as_f64).unwrap_or(0.0)
        } else {
            0.0
        };

        Limits {
            download_mbps: kbps_limit_to_mbps(down_kbps),
            upload_mbps: kbps_limit_to_mbps(up_kbps),
        }
    }
}

#[async_trait]
impl super::ClientAdapter for TransmissionAdapter {
    fn id(&self) -> &ClientId {
        &self.id
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Transmission
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn supports_upload(&self) -> bool {
        true
    }

    async fn test_connection(&self) -> bool {
        match self.rpc_call("session-get", json!({}), READ_TIMEOUT).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(client = %self.id, error = %e, "connection test failed");
                false
            }
        }
    }

    async fn stats(&self) -> Result<ClientStats> {
        let session = self.rpc_call("session-stats", json!({}), READ_TIMEOUT).await?;
        let settings = self.rpc_call("session-get", json!({}), READ_TIMEOUT).await?;

        let download_bytes = session.get("downloadSpeed").and_then(Value::as_f64).unwrap_or(0.0);
        let upload_bytes = session.get("uploadSpeed").and_then(Value::as_f64).unwrap_or(0.0);

        let limits = self.limits_from_session(&settings);
        let original = {
            let mut guard = self.original.lock().await;
            *guard.get_or_insert(limits)
        };

        Ok(ClientStats {
            download_mbps: download_bytes * 8.0 / 1_048_576.0,
            upload_mbps: upload_bytes * 8.0 / 1_048_576.0,
            download_limit_mbps: limits.download_mbps,
            upload_limit_mbps: limits.upload_mbps,
            active_work: download_bytes > ACTIVE_WORK_FLOOR_BYTES
                || upload_bytes > ACTIVE_WORK_FLOOR_BYTES,
            original_download_limit_mbps: original.download_mbps,
            original_upload_limit_mbps: original.upload_mbps,
        })
    }

    async fn limits(&self) -> Result<Limits> {
        let settings = self.rpc_call("session-get", json!({}), READ_TIMEOUT).await?;
        Ok(self.limits_from_session(&settings))
    }

    async fn set_limits(&self, download_mbps: Option<f64>, upload_mbps: Option<f64>) -> Result<()> {
        let mut arguments = serde_json::Map::new();

        if let Some(mbps) = download_mbps {
            let kbps = mbps_to_kbps(mbps);
            arguments.insert("speed-limit-down".into(), json!(kbps));
            arguments.insert("speed-limit-down-enabled".into(), json!(kbps > 0));
        }
        if let Some(mbps) = upload_mbps {
            let kbps = mbps_to_kbps(mbps);
            arguments.insert("speed-limit-up".into(), json!(kbps));
            arguments.insert("speed-limit-up-enabled".into(), json!(kbps > 0));
        }

        if arguments.is_empty() {
            return Ok(());
        }

        self.rpc_call("session-set", Value::Object(arguments), WRITE_TIMEOUT)
            .await
            .map_err(|e| match e {
                e @ Error::Rpc { .. } => Error::Actuation {
                    client: self.name.clone(),
                    message: e.to_string(),
                },
                other => other,
            })?;

        tracing::debug!(
            client = %self.id,
            download_mbps,
            upload_mbps,
            "applied Transmission limits"
        );
        Ok(())
    }

    async fn restore_limits(&self) -> Result<()> {
        let original = *self.original.lock().await;
        if let Some(limits) = original {
            self.set_limits(Some(limits.download_mbps), Some(limits.upload_mbps))
                .await?;
            tracing::debug!(client = %self.id, "restored Transmission original limits");
        }
        Ok(())
    }
}

/// Mbps to the daemon's KB/s (decimal)
fn mbps_to_kbps(mbps: f64) -> i64 {
    (mbps * 1000.0 / 8.0) as i64
}

/// KB/s back to Mbps; a zero or disabled limit reads as unlimited
fn kbps_limit_to_mbps(kbps: f64) -> f64 {
    if kbps > 0.0 { kbps * 8.0 / 1000.0 } else { 0.0 }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::super::ClientAdapter;
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> ClientConfig {
        ClientConfig {
            id: "transmission".into(),
            kind: ClientKind::Transmission,
            name: "Transmission".into(),
            enabled: true,
            url: url.into(),
            username: None,
            password: None,
            api_key: None,
            supports_upload: true,
        }
    }

    #[test]
    fn test_kbps_conversion() {
        assert_eq!(mbps_to_kbps(8.0), 1000);
        assert_eq!(mbps_to_kbps(100.0), 12500);
        assert_eq!(kbps_limit_to_mbps(1000.0), 8.0);
        assert_eq!(kbps_limit_to_mbps(0.0), 0.0);
    }

    #[tokio::test]
    async fn test_409_rearms_session_id_and_retries() {
        let server = MockServer::start().await;

        // First request: 409 with the session id
        Mock::given(method("POST"))
            .and(path("/transmission/rpc"))
            .respond_with(
                ResponseTemplate::new(409).insert_header(SESSION_ID_HEADER, "token-1"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        // Retry must carry the id
        Mock::given(method("POST"))
            .and(path("/transmission/rpc"))
            .and(header(SESSION_ID_HEADER, "token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"result": "success", "arguments": {}}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = TransmissionAdapter::new(&config(&server.uri())).unwrap();
        assert!(adapter.test_connection().await);
    }

    #[tokio::test]
    async fn test_limits_respect_enabled_flags() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/transmission/rpc"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"result": "success", "arguments": {
                    "speed-limit-down": 1000, "speed-limit-down-enabled": true,
                    "speed-limit-up": 500, "speed-limit-up-enabled": false
                }}"#,
            ))
            .mount(&server)
            .await;

        let adapter = TransmissionAdapter::new(&config(&server.uri())).unwrap();
        let limits = adapter.limits().await.unwrap();

        assert_eq!(limits.download_mbps, 8.0);
        // Upload limit is configured but disabled: reads as unlimited
        assert_eq!(limits.upload_mbps, 0.0);
    }

    #[tokio::test]
    async fn test_set_limits_zero_disables() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/transmission/rpc"))
            .and(body_string_contains("\"speed-limit-down-enabled\":false"))
            .and(body_string_contains("\"speed-limit-up\":12500"))
            .and(body_string_contains("\"speed-limit-up-enabled\":true"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"result": "success", "arguments": {}}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = TransmissionAdapter::new(&config(&server.uri())).unwrap();
        adapter.set_limits(Some(0.0), Some(100.0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_rpc_failure_result() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/transmission/rpc"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"result": "no session", "arguments": {}}"#,
            ))
            .mount(&server)
            .await;

        let adapter = TransmissionAdapter::new(&config(&server.uri())).unwrap();
        assert!(adapter.limits().await.is_err());
    }
}

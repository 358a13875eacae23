//! SABnzbd API adapter
//!
//! Stateless api-key API: every call is `GET /api?apikey=...&mode=...`.
//! Rates come from the queue endpoint (`kbpersec`, binary KB/s, as a
//! string); the effective limit is `speedlimit_abs` in bytes/s. Limits are
//! written through the config endpoint as decimal-MB/s strings with an `M`
//! suffix (`Mbps / 8`), `"0"` meaning unlimited. SABnzbd never uploads.

use super::{READ_TIMEOUT, WRITE_TIMEOUT};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::types::{ClientId, ClientKind, ClientStats, Limits};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

/// A queue speed above this is active downloading, below is idle noise (KB/s)
const ACTIVE_FLOOR_KBPS: f64 = 1.0;

/// Adapter for a SABnzbd daemon
pub struct SabnzbdAdapter {
    id: ClientId,
    name: String,
    base: String,
    api_key: String,
    http: reqwest::Client,
    original: Mutex<Option<Limits>>,
}

impl SabnzbdAdapter {
    /// Build the adapter from a client definition
    pub fn new(config: &ClientConfig) -> Result<Self> {
        super::parse_base_url(config)?;
        Ok(Self {
            id: ClientId::new(&config.id),
            name: config.name.clone(),
            base: config.url.trim_end_matches('/').to_string(),
            api_key: super::require_credential(config, &config.api_key, "api key")?,
            http: reqwest::Client::new(),
            original: Mutex::new(None),
        })
    }

    async fn api_call(
        &self,
        mode: &str,
        params: &[(&str, &str)],
        timeout: std::time::Duration,
    ) -> Result<Value> {
        let mut query: Vec<(&str, &str)> = vec![
            ("apikey", self.api_key.as_str()),
            ("mode", mode),
            ("output", "json"),
        ];
        query.extend_from_slice(params);

        let response = self
            .http
            .get(format!("{}/api", self.base))
            .query(&query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::transport(&self.name, e))?
            .error_for_status()?;

        Ok(response.json().await?)
    }

    fn queue_field<'a>(&self, response: &'a Value) -> Result<&'a Value> {
        response.get("queue").ok_or_else(|| Error::UnexpectedResponse {
            client: self.name.clone(),
            message: "missing queue object".into(),
        })
    }
}

#[async_trait]
impl super::ClientAdapter for SabnzbdAdapter {
    fn id(&self) -> &ClientId {
        &self.id
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Sabnzbd
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn supports_upload(&self) -> bool {
        false
    }

    async fn test_connection(&self) -> bool {
        match self.api_call("version", &[], READ_TIMEOUT).await {
            Ok(response) => response.get("version").is_some(),
            Err(e) => {
                tracing::error!(client = %self.id, error = %e, "connection test failed");
                false
            }
        }
    }

    async fn stats(&self) -> Result<ClientStats> {
        let response = self.api_call("queue", &[], READ_TIMEOUT).await?;
        let queue = self.queue_field(&response)?;

        let speed_kbps = string_or_number(queue.get("kbpersec"));
        let limit_bytes = string_or_number(queue.get("speedlimit_abs"));

        let download_mbps = kbps_to_mbps(speed_kbps);
        let limit_mbps = if limit_bytes > 0.0 {
            limit_bytes * 8.0 / 1_048_576.0
        } else {
            0.0
        };

        let limits = Limits {
            download_mbps: limit_mbps,
            upload_mbps: 0.0,
        };
        let original = {
            let mut guard = self.original.lock().await;
            *guard.get_or_insert(limits)
        };

        Ok(ClientStats {
            download_mbps,
            upload_mbps: 0.0,
            download_limit_mbps: limit_mbps,
            upload_limit_mbps: 0.0,
            active_work: speed_kbps > ACTIVE_FLOOR_KBPS,
            original_download_limit_mbps: original.download_mbps,
            original_upload_limit_mbps: 0.0,
        })
    }

    async fn limits(&self) -> Result<Limits> {
        let response = self.api_call("queue", &[], READ_TIMEOUT).await?;
        let queue = self.queue_field(&response)?;
        let limit_bytes = string_or_number(queue.get("speedlimit_abs"));
        Ok(Limits {
            download_mbps: if limit_bytes > 0.0 {
                limit_bytes * 8.0 / 1_048_576.0
            } else {
                0.0
            },
            upload_mbps: 0.0,
        })
    }

    async fn set_limits(&self, download_mbps: Option<f64>, _upload_mbps: Option<f64>) -> Result<()> {
        let Some(mbps) = download_mbps else {
            return Ok(());
        };

        let value = speedlimit_value(mbps);
        self.api_call(
            "config",
            &[("name", "speedlimit"), ("value", value.as_str())],
            WRITE_TIMEOUT,
        )
        .await
        .map_err(|e| match e {
            e @ Error::Unreachable(_) => e,
            other => Error::Actuation {
                client: self.name.clone(),
                message: other.to_string(),
            },
        })?;

        tracing::debug!(client = %self.id, download_mbps = mbps, value = %value, "applied SABnzbd limit");
        Ok(())
    }

    async fn restore_limits(&self) -> Result<()> {
        // Restoring means removing the limit entirely
        self.api_call("config", &[("name", "speedlimit"), ("value", "0")], WRITE_TIMEOUT)
            .await
            .map_err(|e| match e {
                e @ Error::Unreachable(_) => e,
                other => Error::Actuation {
                    client: self.name.clone(),
                    message: other.to_string(),
                },
            })?;
        tracing::debug!(client = %self.id, "removed SABnzbd speed limit");
        Ok(())
    }
}

/// The daemon's config value for a limit: decimal MB/s with an M suffix,
/// "0" for unlimited
fn speedlimit_value(mbps: f64) -> String {
    if mbps <= 0.0 {
        "0".to_string()
    } else {
        format!("{:.1}M", mbps / 8.0)
    }
}

/// Binary KB/s (the queue's kbpersec unit) to Mbps
fn kbps_to_mbps(kbps: f64) -> f64 {
    kbps / 1024.0 * 8.0
}

/// SABnzbd reports numbers as strings in most payloads
fn string_or_number(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::super::ClientAdapter;
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> ClientConfig {
        ClientConfig {
            id: "sab".into(),
            kind: ClientKind::Sabnzbd,
            name: "SABnzbd".into(),
            enabled: true,
            url: url.into(),
            username: None,
            password: None,
            api_key: Some("secret".into()),
            supports_upload: false,
        }
    }

    #[test]
    fn test_speedlimit_value_format() {
        // 100 Mbps = 12.5 MB/s
        assert_eq!(speedlimit_value(100.0), "12.5M");
        assert_eq!(speedlimit_value(448.5), "56.1M");
        assert_eq!(speedlimit_value(0.0), "0");
        assert_eq!(speedlimit_value(-1.0), "0");
    }

    #[test]
    fn test_kbps_to_mbps() {
        // 1024 KB/s = 8 Mbps (binary KB)
        assert_eq!(kbps_to_mbps(1024.0), 8.0);
        assert_eq!(kbps_to_mbps(0.0), 0.0);
    }

    #[test]
    fn test_string_or_number() {
        assert_eq!(string_or_number(Some(&Value::String("123.5".into()))), 123.5);
        assert_eq!(string_or_number(Some(&serde_json::json!(42))), 42.0);
        assert_eq!(string_or_number(Some(&Value::String("junk".into()))), 0.0);
        assert_eq!(string_or_number(None), 0.0);
    }

    #[tokio::test]
    async fn test_stats_parses_queue() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api"))
            .and(query_param("mode", "queue"))
            .and(query_param("apikey", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                // kbpersec 2048 KB/s = 16 Mbps; limit 1 MiB/s = 8 Mbps
                r#"{"queue": {"kbpersec": "2048.0", "speedlimit_abs": "1048576", "noofslots": 3}}"#,
            ))
            .mount(&server)
            .await;

        let adapter = SabnzbdAdapter::new(&config(&server.uri())).unwrap();
        let stats = adapter.stats().await.unwrap();

        assert_eq!(stats.download_mbps, 16.0);
        assert_eq!(stats.download_limit_mbps, 8.0);
        assert!(stats.active_work);
        assert_eq!(stats.upload_mbps, 0.0);
        assert_eq!(stats.upload_limit_mbps, 0.0);
    }

    #[tokio::test]
    async fn test_set_limits_formats_mb_string() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api"))
            .and(query_param("mode", "config"))
            .and(query_param("name", "speedlimit"))
            .and(query_param("value", "56.1M"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = SabnzbdAdapter::new(&config(&server.uri())).unwrap();
        adapter.set_limits(Some(448.5), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_argument_ignored() {
        // No mock mounted: any request would fail, proving none is sent
        let server = MockServer::start().await;
        let adapter = SabnzbdAdapter::new(&config(&server.uri())).unwrap();
        adapter.set_limits(None, Some(10.0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_sets_unlimited() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api"))
            .and(query_param("mode", "config"))
            .and(query_param("value", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = SabnzbdAdapter::new(&config(&server.uri())).unwrap();
        adapter.restore_limits().await.unwrap();
    }
}

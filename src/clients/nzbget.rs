//! NZBGet JSON-RPC adapter
//!
//! Basic-auth JSON-RPC at `/jsonrpc`. The status call reports the download
//! rate and current limit in bytes/s; the `rate` command takes its argument
//! in KB/s (`Mbps * 125`), 0 meaning unlimited. NZBGet never uploads.

use super::{ACTIVE_WORK_FLOOR_BYTES, READ_TIMEOUT, WRITE_TIMEOUT};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::types::{ClientId, ClientKind, ClientStats, Limits};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;

/// Adapter for an NZBGet daemon
pub struct NzbgetAdapter {
    id: ClientId,
    name: String,
    base: String,
    username: String,
    password: String,
    http: reqwest::Client,
    original: Mutex<Option<Limits>>,
}

impl NzbgetAdapter {
    /// Build the adapter from a client definition
    pub fn new(config: &ClientConfig) -> Result<Self> {
        super::parse_base_url(config)?;
        Ok(Self {
            id: ClientId::new(&config.id),
            name: config.name.clone(),
            base: config.url.trim_end_matches('/').to_string(),
            username: super::require_credential(config, &config.username, "username")?,
            password: super::require_credential(config, &config.password, "password")?,
            http: reqwest::Client::new(),
            original: Mutex::new(None),
        })
    }

    async fn rpc_call(
        &self,
        rpc_method: &str,
        params: Value,
        timeout: std::time::Duration,
    ) -> Result<Value> {
        let payload = json!({
            "method": rpc_method,
            "params": params,
            "id": 1,
            "jsonrpc": "2.0",
        });

        let response = self
            .http
            .post(format!("{}/jsonrpc", self.base))
            .basic_auth(&self.username, Some(&self.password))
            .json(&payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::transport(&self.name, e))?
            .error_for_status()?;

        let body: Value = response.json().await?;
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(Error::Rpc {
                client: self.name.clone(),
                message: error.to_string(),
            });
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn status(&self) -> Result<Value> {
        self.rpc_call("status", json!([]), READ_TIMEOUT).await
    }
}

#[async_trait]
impl super::ClientAdapter for NzbgetAdapter {
    fn id(&self) -> &ClientId {
        &self.id
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Nzbget
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn supports_upload(&self) -> bool {
        false
    }

    async fn test_connection(&self) -> bool {
        match self.rpc_call("version", json!([]), READ_TIMEOUT).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(client = %self.id, error = %e, "connection test failed");
                false
            }
        }
    }

    async fn stats(&self) -> Result<ClientStats> {
        let status = self.status().await?;
        let rate_bytes = status
            .get("DownloadRate")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let limit_bytes = status
            .get("DownloadLimit")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let limits = Limits {
            download_mbps: bytes_limit_to_mbps(limit_bytes),
            upload_mbps: 0.0,
        };
        let original = {
            let mut guard = self.original.lock().await;
            *guard.get_or_insert(limits)
        };

        Ok(ClientStats {
            download_mbps: rate_bytes * 8.0 / 1_048_576.0,
            upload_mbps: 0.0,
            download_limit_mbps: limits.download_mbps,
            upload_limit_mbps: 0.0,
            active_work: rate_bytes > ACTIVE_WORK_FLOOR_BYTES,
            original_download_limit_mbps: original.download_mbps,
            original_upload_limit_mbps: 0.0,
        })
    }

    async fn limits(&self) -> Result<Limits> {
        let status = self.status().await?;
        let limit_bytes = status
            .get("DownloadLimit")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        Ok(Limits {
            download_mbps: bytes_limit_to_mbps(limit_bytes),
            upload_mbps: 0.0,
        })
    }

    async fn set_limits(&self, download_mbps: Option<f64>, _upload_mbps: Option<f64>) -> Result<()> {
        let Some(mbps) = download_mbps else {
            return Ok(());
        };

        let kbps = mbps_to_rate_kbps(mbps);
        self.rpc_call("rate", json!([kbps]), WRITE_TIMEOUT)
            .await
            .map_err(|e| match e {
                e @ Error::Rpc { .. } => Error::Actuation {
                    client: self.name.clone(),
                    message: e.to_string(),
                },
                other => other,
            })?;

        tracing::debug!(client = %self.id, download_mbps = mbps, kbps, "applied NZBGet limit");
        Ok(())
    }

    async fn restore_limits(&self) -> Result<()> {
        let original = *self.original.lock().await;
        if let Some(limits) = original {
            self.set_limits(Some(limits.download_mbps), None).await?;
            tracing::debug!(client = %self.id, "restored NZBGet original limit");
        }
        Ok(())
    }
}

/// The rate command takes KB/s: 1 Mbps = 125 KB/s (decimal)
fn mbps_to_rate_kbps(mbps: f64) -> i64 {
    (mbps * 125.0) as i64
}

/// Status reports the limit in bytes/s; 0 is unlimited
fn bytes_limit_to_mbps(bytes: f64) -> f64 {
    if bytes > 0.0 { bytes * 8.0 / 1_048_576.0 } else { 0.0 }
}

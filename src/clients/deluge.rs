//! Deluge Web UI JSON-RPC adapter
//!
//! Authenticates against the Web UI with a password (`auth.login`), relying
//! on the `_session_id` cookie the daemon sets, then connects the Web UI to
//! a daemon host if it is not already connected. An error payload of
//! "Not authenticated" (code 1) means the session died; the adapter
//! re-authenticates once and retries the call. Limits live in the daemon
//! config as KB/s (`Mbps * 1000 / 8`) with -1 meaning unlimited.

use super::{ACTIVE_WORK_FLOOR_BYTES, READ_TIMEOUT, WRITE_TIMEOUT};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::types::{ClientId, ClientKind, ClientStats, Limits};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Adapter for a Deluge daemon behind its Web UI
pub struct DelugeAdapter {
    id: ClientId,
    name: String,
    base: String,
    password: String,
    http: reqwest::Client,
    authenticated: AtomicBool,
    request_id: AtomicU64,
    original: Mutex<Option<Limits>>,
}

impl DelugeAdapter {
    /// Build the adapter from a client definition
    pub fn new(config: &ClientConfig) -> Result<Self> {
        super::parse_base_url(config)?;
        Ok(Self {
            id: ClientId::new(&config.id),
            name: config.name.clone(),
            base: config.url.trim_end_matches('/').to_string(),
            password: super::require_credential(config, &config.password, "password")?,
            http: reqwest::Client::builder()
                .cookie_store(true)
                .build()
                .map_err(Error::Http)?,
            authenticated: AtomicBool::new(false),
            request_id: AtomicU64::new(0),
            original: Mutex::new(None),
        })
    }

    async fn raw_call(
        &self,
        rpc_method: &str,
        params: Value,
        timeout: std::time::Duration,
    ) -> Result<Value> {
        let payload = json!({
            "method": rpc_method,
            "params": params,
            "id": self.request_id.fetch_add(1, Ordering::SeqCst) + 1,
        });

        let response = self
            .http
            .post(format!("{}/json", self.base))
            .json(&payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::transport(&self.name, e))?
            .error_for_status()?;

        let body: Value = response.json().await?;
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if code == 1 && message.contains("Not authenticated") {
                self.authenticated.store(false, Ordering::SeqCst);
                return Err(Error::AuthExpired {
                    client: self.name.clone(),
                });
            }
            return Err(Error::Rpc {
                client: self.name.clone(),
                message: error.to_string(),
            });
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    /// RPC call that re-authenticates once when the session has expired
    async fn rpc_call(
        &self,
        rpc_method: &str,
        params: Value,
        timeout: std::time::Duration,
    ) -> Result<Value> {
        self.ensure_authenticated().await?;
        match self.raw_call(rpc_method, params.clone(), timeout).await {
            Err(Error::AuthExpired { .. }) => {
                tracing::debug!(client = %self.id, "Deluge session expired, re-authenticating");
                self.ensure_authenticated().await?;
                self.raw_call(rpc_method, params, timeout).await
            }
            other => other,
        }
    }

    async fn ensure_authenticated(&self) -> Result<()> {
        if self.authenticated.load(Ordering::SeqCst) {
            return Ok(());
        }

        let result = self
            .raw_call("auth.login", json!([self.password]), READ_TIMEOUT)
            .await?;
        if result != Value::Bool(true) {
            return Err(Error::AuthFailed {
                client: self.name.clone(),
                message: "password rejected".into(),
            });
        }
        self.authenticated.store(true, Ordering::SeqCst);
        tracing::debug!(client = %self.id, "authenticated with Deluge Web UI");

        // The Web UI may not be attached to a daemon yet
        let connected = self
            .raw_call("web.connected", json!([]), READ_TIMEOUT)
            .await
            .unwrap_or(Value::Bool(false));
        if connected == Value::Bool(true) {
            return Ok(());
        }

        match self.raw_call("web.get_hosts", json!([]), READ_TIMEOUT).await {
            Ok(Value::Array(hosts)) if !hosts.is_empty() => {
                if let Some(host_id) = hosts[0].get(0).and_then(Value::as_str) {
                    if let Err(e) = self
                        .raw_call("web.connect", json!([host_id]), READ_TIMEOUT)
                        .await
                    {
                        tracing::warn!(client = %self.id, error = %e, "failed to connect Web UI to daemon");
                    }
                }
            }
            _ => {
                tracing::warn!(
                    client = %self.id,
                    "no Deluge daemons configured in Web UI connection manager"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl super::ClientAdapter for DelugeAdapter {
    fn id(&self) -> &ClientId {
        &self.id
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Deluge
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn supports_upload(&self) -> bool {
        true
    }

    async fn test_connection(&self) -> bool {
        // Force a fresh login
        self.authenticated.store(false, Ordering::SeqCst);
        match self.ensure_authenticated().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(client = %self.id, error = %e, "connection test failed");
                false
            }
        }
    }

    async fn stats(&self) -> Result<ClientStats> {
        let status = self
            .rpc_call(
                "core.get_session_status",
                json!([["download_rate", "upload_rate"]]),
                READ_TIMEOUT,
            )
            .await?;

        let download_bytes = status.get("download_rate").and_then(Value::as_f64).unwrap_or(0.0);
        let upload_bytes = status.get("upload_rate").and_then(Value::as_f64).unwrap_or(0.0);

        let limits = self.limits().await?;
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
        let config = self.rpc_call("core.get_config", json!([]), READ_TIMEOUT).await?;
        let download = config
            .get("max_download_speed")
            .and_then(Value::as_f64)
            .unwrap_or(-1.0);
        let upload = config
            .get("max_upload_speed")
            .and_then(Value::as_f64)
            .unwrap_or(-1.0);

        Ok(Limits {
            download_mbps: kbps_limit_to_mbps(download),
            upload_mbps: kbps_limit_to_mbps(upload),
        })
    }

    async fn set_limits(&self, download_mbps: Option<f64>, upload_mbps: Option<f64>) -> Result<()> {
        let mut updates = serde_json::Map::new();
        if let Some(mbps) = download_mbps {
            updates.insert("max_download_speed".into(), json!(mbps_to_config_kbps(mbps)));
        }
        if let Some(mbps) = upload_mbps {
            updates.insert("max_upload_speed".into(), json!(mbps_to_config_kbps(mbps)));
        }
        if updates.is_empty() {
            return Ok(());
        }

        self.rpc_call("core.set_config", json!([Value::Object(updates)]), WRITE_TIMEOUT)
            .await
            .map_err(|e| match e {
                e @ Error::Rpc { .. } => Error::Actuation {
                    client: self.name.clone(),
                    message: e.to_string(),
                },
                other => other,
            })?;

        tracing::debug!(client = %self.id, download_mbps, upload_mbps, "applied Deluge limits");
        Ok(())
    }

    async fn restore_limits(&self) -> Result<()> {
        let original = *self.original.lock().await;
        if let Some(limits) = original {
            self.set_limits(Some(limits.download_mbps), Some(limits.upload_mbps))
                .await?;
            tracing::debug!(client = %self.id, "restored Deluge original limits");
        }
        Ok(())
    }
}

/// Mbps to the config's KB/s; 0 (unlimited) maps to the -1 sentinel
fn mbps_to_config_kbps(mbps: f64) -> f64 {
    if mbps > 0.0 { mbps * 1000.0 / 8.0 } else { -1.0 }
}

/// Config KB/s back to Mbps; -1 or 0 reads as unlimited
fn kbps_limit_to_mbps(kbps: f64) -> f64 {
    if kbps > 0.0 { kbps * 8.0 / 1000.0 } else { 0.0 }
}

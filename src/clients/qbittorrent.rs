//! qBittorrent Web API adapter
//!
//! Speaks the v2 Web API: form login with a session cookie, transfer info
//! for rates, and the global transfer limits. qBittorrent takes limits in
//! bytes per second with binary scaling (`Mbps * 1048576 / 8`) and uses 0
//! as the unlimited sentinel. A 403 from any endpoint means the session
//! cookie expired; the adapter re-authenticates once and retries the call.

use super::{ACTIVE_WORK_FLOOR_BYTES, READ_TIMEOUT, WRITE_TIMEOUT};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::types::{ClientId, ClientKind, ClientStats, Limits};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Adapter for a qBittorrent daemon
pub struct QbittorrentAdapter {
    id: ClientId,
    name: String,
    base: String,
    username: String,
    password: String,
    http: reqwest::Client,
    authenticated: AtomicBool,
    original: Mutex<Option<Limits>>,
}

#[derive(Debug, Deserialize)]
struct TransferInfo {
    #[serde(default)]
    dl_info_speed: f64,
    #[serde(default)]
    up_info_speed: f64,
}

impl QbittorrentAdapter {
    /// Build the adapter from a client definition
    pub fn new(config: &ClientConfig) -> Result<Self> {
        super::parse_base_url(config)?;
        Ok(Self {
            id: ClientId::new(&config.id),
            name: config.name.clone(),
            base: config.url.trim_end_matches('/').to_string(),
            username: super::require_credential(config, &config.username, "username")?,
            password: super::require_credential(config, &config.password, "password")?,
            http: reqwest::Client::builder()
                .cookie_store(true)
                .build()
                .map_err(Error::Http)?,
            authenticated: AtomicBool::new(false),
            original: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v2/{path}", self.base)
    }

    async fn login(&self) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint("auth/login"))
            .form(&[("username", self.username.as_str()), ("password", self.password.as_str())])
            .timeout(READ_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::transport(&self.name, e))?;

        if !response.status().is_success() {
            return Err(Error::AuthFailed {
                client: self.name.clone(),
                message: format!("login returned {}", response.status()),
            });
        }
        // The daemon answers 200 "Fails." on bad credentials
        let body = response.text().await?;
        if body.trim() != "Ok." {
            return Err(Error::AuthFailed {
                client: self.name.clone(),
                message: "credentials rejected".into(),
            });
        }

        self.authenticated.store(true, Ordering::SeqCst);
        tracing::debug!(client = %self.id, "authenticated with qBittorrent");
        Ok(())
    }

    async fn ensure_authenticated(&self) -> Result<()> {
        if self.authenticated.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.login().await
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        self.ensure_authenticated().await?;
        for attempt in 0..2 {
            let response = self
                .http
                .get(self.endpoint(path))
                .timeout(READ_TIMEOUT)
                .send()
                .await
                .map_err(|e| Error::transport(&self.name, e))?;

            if response.status() == StatusCode::FORBIDDEN {
                self.authenticated.store(false, Ordering::SeqCst);
                if attempt == 0 {
                    self.login().await?;
                    continue;
                }
                return Err(Error::AuthExpired {
                    client: self.name.clone(),
                });
            }
            let response = response.error_for_status()?;
            return Ok(response.text().await?);
        }
        Err(Error::AuthExpired {
            client: self.name.clone(),
        })
    }

    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> Result<()> {
        self.ensure_authenticated().await?;
        for attempt in 0..2 {
            let response = self
                .http
                .post(self.endpoint(path))
                .form(form)
                .timeout(WRITE_TIMEOUT)
                .send()
                .await
                .map_err(|e| Error::transport(&self.name, e))?;

            if response.status() == StatusCode::FORBIDDEN {
                self.authenticated.store(false, Ordering::SeqCst);
                if attempt == 0 {
                    self.login().await?;
                    continue;
                }
                return Err(Error::AuthExpired {
                    client: self.name.clone(),
                });
            }
            response.error_for_status()?;
            return Ok(());
        }
        Err(Error::AuthExpired {
            client: self.name.clone(),
        })
    }

    async fn limit_value(&self, path: &str) -> Result<f64> {
        let text = self.get_text(path).await?;
        let bytes: f64 = text.trim().parse().map_err(|_| Error::UnexpectedResponse {
            client: self.name.clone(),
            message: format!("non-numeric limit: {text:?}"),
        })?;
        Ok(if bytes > 0.0 {
            bytes_per_sec_to_mbps(bytes)
        } else {
            0.0
        })
    }
}

#[async_trait]
impl super::ClientAdapter for QbittorrentAdapter {
    fn id(&self) -> &ClientId {
        &self.id
    }

    fn kind(&self) -> ClientKind {
        ClientKind::QBittorrent
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn supports_upload(&self) -> bool {
        true
    }

    async fn test_connection(&self) -> bool {
        match self.login().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(client = %self.id, error = %e, "connection test failed");
                false
            }
        }
    }

    async fn stats(&self) -> Result<ClientStats> {
        let text = self.get_text("transfer/info").await?;
        let info: TransferInfo = serde_json::from_str(&text)?;

        let limits = self.limits().await?;
        let original = {
            let mut guard = self.original.lock().await;
            *guard.get_or_insert(limits)
        };

        Ok(ClientStats {
            download_mbps: bytes_per_sec_to_mbps(info.dl_info_speed),
            upload_mbps: bytes_per_sec_to_mbps(info.up_info_speed),
            download_limit_mbps: limits.download_mbps,
            upload_limit_mbps: limits.upload_mbps,
            active_work: info.dl_info_speed > ACTIVE_WORK_FLOOR_BYTES
                || info.up_info_speed > ACTIVE_WORK_FLOOR_BYTES,
            original_download_limit_mbps: original.download_mbps,
            original_upload_limit_mbps: original.upload_mbps,
        })
    }

    async fn limits(&self) -> Result<Limits> {
        Ok(Limits {
            download_mbps: self.limit_value("transfer/downloadLimit").await?,
            upload_mbps: self.limit_value("transfer/uploadLimit").await?,
        })
    }

    async fn set_limits(&self, download_mbps: Option<f64>, upload_mbps: Option<f64>) -> Result<()> {
        if let Some(mbps) = download_mbps {
            let bytes = mbps_to_bytes_per_sec(mbps);
            self.post_form("transfer/setDownloadLimit", &[("limit", bytes.to_string())])
                .await
                .map_err(|e| actuation(&self.name, e))?;
        }
        if let Some(mbps) = upload_mbps {
            let bytes = mbps_to_bytes_per_sec(mbps);
            self.post_form("transfer/setUploadLimit", &[("limit", bytes.to_string())])
                .await
                .map_err(|e| actuation(&self.name, e))?;
        }
        tracing::debug!(
            client = %self.id,
            download_mbps,
            upload_mbps,
            "applied qBittorrent limits"
        );
        Ok(())
    }

    async fn restore_limits(&self) -> Result<()> {
        let original = *self.original.lock().await;
        if let Some(limits) = original {
            self.set_limits(Some(limits.download_mbps), Some(limits.upload_mbps))
                .await?;
            tracing::debug!(client = %self.id, "restored qBittorrent original limits");
        }
        Ok(())
    }
}

fn actuation(name: &str, e: Error) -> Error {
    match e {
        e @ (Error::AuthExpired { .. } | Error::AuthFailed { .. } | Error::Unreachable(_)) => e,
        other => Error::Actuation {
            client: name.to_string(),
            message: other.to_string(),
        },
    }
}

/// bytes/s to Mbps with binary scaling (the daemon's unit)
fn bytes_per_sec_to_mbps(bytes: f64) -> f64 {
    bytes * 8.0 / 1_048_576.0
}

/// Mbps to bytes/s with binary scaling
fn mbps_to_bytes_per_sec(mbps: f64) -> i64 {
    (mbps * 1_048_576.0 / 8.0) as i64
}

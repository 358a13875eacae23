//! Download client adapters
//!
//! Each adapter wraps one download daemon so the rest of the system can
//! talk in Mbps pairs: it converts to and from the daemon's native unit,
//! tracks the limits that were in place before bandarr touched anything,
//! and re-authenticates transparently when a webUI/RPC session expires.
//!
//! The [`ClientRegistry`] fans operations out across all adapters in
//! parallel; one daemon failing never blocks or aborts the others.

mod deluge;
mod nzbget;
mod qbittorrent;
mod sabnzbd;
mod transmission;

pub use deluge::DelugeAdapter;
pub use nzbget::NzbgetAdapter;
pub use qbittorrent::QbittorrentAdapter;
pub use sabnzbd::SabnzbdAdapter;
pub use transmission::TransmissionAdapter;

use crate::config::{ClientConfig, Config};
use crate::error::{Error, Result};
use crate::types::{ClientId, ClientKind, ClientStats, Decision, Limits};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Timeout for read-side daemon calls (stats, limits)
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for write-side daemon calls (set limits)
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Observed data rate below this is idle noise, not active work (bytes/s)
pub(crate) const ACTIVE_WORK_FLOOR_BYTES: f64 = 1024.0;

/// Retry attempts when restoring original limits at shutdown
const RESTORE_ATTEMPTS: u32 = 3;

/// Delay between restore attempts
const RESTORE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Uniform interface over one download daemon
///
/// All rates and limits cross this boundary in Mbps; 0 means unlimited.
#[async_trait]
pub trait ClientAdapter: Send + Sync {
    /// Stable identifier from configuration
    fn id(&self) -> &ClientId;

    /// Daemon family
    fn kind(&self) -> ClientKind;

    /// Display name for logs and events
    fn display_name(&self) -> &str;

    /// Whether this client manages upload bandwidth
    fn supports_upload(&self) -> bool;

    /// Verify reachability and that the configured credentials are accepted
    async fn test_connection(&self) -> bool;

    /// Current transfer statistics.
    ///
    /// The first successful call records the daemon's current limits as the
    /// originals for shutdown restoration. `active_work` comes from the
    /// measured rate, never the daemon's state strings.
    async fn stats(&self) -> Result<ClientStats>;

    /// Current limits in Mbps (0 = unlimited on both sides)
    async fn limits(&self) -> Result<Limits>;

    /// Apply new limits. `None` leaves that side unchanged; 0 maps to the
    /// daemon's unlimited sentinel.
    async fn set_limits(&self, download_mbps: Option<f64>, upload_mbps: Option<f64>) -> Result<()>;

    /// Write back the limits recorded on the first successful probe
    async fn restore_limits(&self) -> Result<()>;
}

/// Build the adapter for one client definition
pub fn build_adapter(config: &ClientConfig) -> Result<Arc<dyn ClientAdapter>> {
    let adapter: Arc<dyn ClientAdapter> = match config.kind {
        ClientKind::QBittorrent => Arc::new(QbittorrentAdapter::new(config)?),
        ClientKind::Sabnzbd => Arc::new(SabnzbdAdapter::new(config)?),
        ClientKind::Nzbget => Arc::new(NzbgetAdapter::new(config)?),
        ClientKind::Transmission => Arc::new(TransmissionAdapter::new(config)?),
        ClientKind::Deluge => Arc::new(DelugeAdapter::new(config)?),
    };
    Ok(adapter)
}

/// The set of live adapters and parallel operations over them
#[derive(Clone, Default)]
pub struct ClientRegistry {
    adapters: Vec<Arc<dyn ClientAdapter>>,
}

impl ClientRegistry {
    /// Build adapters for every enabled client in the configuration.
    ///
    /// A client whose adapter cannot be constructed (bad URL) is skipped
    /// with an error log rather than failing the whole registry.
    pub fn from_config(config: &Config) -> Self {
        let mut adapters = Vec::new();
        for client in config.enabled_clients() {
            match build_adapter(client) {
                Ok(adapter) => {
                    tracing::info!(client_id = %client.id, kind = %client.kind, "client initialized");
                    adapters.push(adapter);
                }
                Err(e) => {
                    tracing::error!(client_id = %client.id, error = %e, "failed to initialize client");
                }
            }
        }
        Self { adapters }
    }

    /// Registry over pre-built adapters (used by tests and embedders with
    /// custom adapters)
    pub fn from_adapters(adapters: Vec<Arc<dyn ClientAdapter>>) -> Self {
        Self { adapters }
    }

    /// The live adapters, in configuration order
    pub fn adapters(&self) -> &[Arc<dyn ClientAdapter>] {
        &self.adapters
    }

    /// True when no adapters were built
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Fetch stats from every adapter in parallel, preserving per-client
    /// failures
    pub async fn stats_all(&self) -> HashMap<ClientId, Result<ClientStats>> {
        let futures = self.adapters.iter().map(|adapter| async move {
            let result = adapter.stats().await;
            if let Err(ref e) = result {
                tracing::debug!(client_id = %adapter.id(), error = %e, "stats poll failed");
            }
            (adapter.id().clone(), result)
        });
        join_all(futures).await.into_iter().collect()
    }

    /// Push decisions to their clients in parallel.
    ///
    /// Per-client failures are logged and reported in the result map; they
    /// never abort the batch.
    pub async fn apply(&self, decisions: &HashMap<ClientId, Decision>) -> HashMap<ClientId, bool> {
        let futures = self.adapters.iter().filter_map(|adapter| {
            let decision = decisions.get(adapter.id())?;
            Some(async move {
                let result = adapter
                    .set_limits(
                        Some(decision.download_limit_mbps),
                        Some(decision.upload_limit_mbps),
                    )
                    .await;
                match result {
                    Ok(()) => (adapter.id().clone(), true),
                    Err(e) => {
                        tracing::error!(
                            client_id = %adapter.id(),
                            error = %e,
                            "failed to apply limits"
                        );
                        (adapter.id().clone(), false)
                    }
                }
            })
        });
        join_all(futures).await.into_iter().collect()
    }

    /// Restore every client's original limits in parallel, retrying each a
    /// few times. Used at shutdown; the caller bounds the total time.
    pub async fn restore_all(&self) -> HashMap<ClientId, bool> {
        let futures = self.adapters.iter().map(|adapter| async move {
            for attempt in 1..=RESTORE_ATTEMPTS {
                match adapter.restore_limits().await {
                    Ok(()) => {
                        tracing::info!(client_id = %adapter.id(), "restored original limits");
                        return (adapter.id().clone(), true);
                    }
                    Err(e) if attempt < RESTORE_ATTEMPTS => {
                        tracing::warn!(
                            client_id = %adapter.id(),
                            attempt,
                            error = %e,
                            "restore failed, retrying"
                        );
                        tokio::time::sleep(RESTORE_RETRY_DELAY).await;
                    }
                    Err(e) => {
                        tracing::error!(
                            client_id = %adapter.id(),
                            error = %e,
                            "restore failed after retries"
                        );
                    }
                }
            }
            (adapter.id().clone(), false)
        });
        join_all(futures).await.into_iter().collect()
    }

    /// Test connectivity to every client in parallel
    pub async fn test_connections(&self) -> HashMap<ClientId, bool> {
        let futures = self.adapters.iter().map(|adapter| async move {
            (adapter.id().clone(), adapter.test_connection().await)
        });
        join_all(futures).await.into_iter().collect()
    }
}

/// Shared helper: parse a base URL from a client definition
pub(crate) fn parse_base_url(config: &ClientConfig) -> Result<url::Url> {
    url::Url::parse(config.url.trim_end_matches('/')).map_err(|e| Error::Config {
        message: format!("{}: invalid url {}: {e}", config.id, config.url),
    })
}

/// Shared helper: a missing credential is a configuration error
pub(crate) fn require_credential(
    config: &ClientConfig,
    value: &Option<String>,
    what: &str,
) -> Result<String> {
    value.clone().ok_or_else(|| Error::Config {
        message: format!("{}: missing {what}", config.id),
    })
}

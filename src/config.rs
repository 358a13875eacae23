//! Configuration types for bandarr
//!
//! The configuration is an immutable snapshot: every component is built
//! from it, and [`PollingMonitor::reload`](crate::monitor::PollingMonitor::reload)
//! swaps the whole snapshot atomically. Suspect values produce warnings,
//! never rejection — the loops are expected to keep running with whatever
//! the operator gave them.

use crate::schedule::ScheduleConfig;
use crate::types::ClientKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main configuration for the bandwidth arbiter
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Media server connection and stream accounting settings
    #[serde(default)]
    pub media_server: MediaServerConfig,

    /// Download client definitions
    #[serde(default)]
    pub clients: Vec<ClientConfig>,

    /// Bandwidth capacities and allocation tuning
    #[serde(default)]
    pub bandwidth: BandwidthConfig,

    /// How long to hold bandwidth after a stream ends
    #[serde(default)]
    pub restoration: RestorationConfig,

    /// Router link probe settings
    #[serde(default)]
    pub link_probe: LinkProbeConfig,

    /// Polling cadence
    #[serde(default)]
    pub system: SystemConfig,
}

impl Config {
    /// Enabled download clients, in configuration order
    pub fn enabled_clients(&self) -> Vec<&ClientConfig> {
        self.clients.iter().filter(|c| c.enabled).collect()
    }

    /// Enabled clients that manage upload bandwidth
    pub fn upload_clients(&self) -> Vec<&ClientConfig> {
        self.clients
            .iter()
            .filter(|c| c.enabled && c.supports_upload)
            .collect()
    }

    /// Poll interval with the 5-second floor applied
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.system.poll_interval_secs.max(5))
    }

    /// Check the snapshot for suspect values and log warnings.
    ///
    /// Never fails: the values are used as given.
    pub fn validate(&self) {
        if self.bandwidth.download.total_mbps <= 0.0 {
            tracing::warn!(
                total_mbps = self.bandwidth.download.total_mbps,
                "download total limit is not positive; downloads will be starved"
            );
        }
        if self.bandwidth.upload.total_mbps <= 0.0 {
            tracing::warn!(
                total_mbps = self.bandwidth.upload.total_mbps,
                "upload total limit is not positive; uploads will be starved"
            );
        }
        for (label, percents) in [
            ("download", &self.bandwidth.download.client_percents),
            ("upload", &self.bandwidth.upload.client_percents),
        ] {
            let sum: u32 = percents.values().sum();
            if sum > 100 {
                tracing::warn!(side = label, sum, "client percentages sum past 100");
            }
        }
        if self.bandwidth.streams.overhead_percent > 300 {
            tracing::warn!(
                overhead_percent = self.bandwidth.streams.overhead_percent,
                "stream overhead above 300% will be clamped"
            );
        }
        if self.system.poll_interval_secs < 5 {
            tracing::warn!(
                poll_interval_secs = self.system.poll_interval_secs,
                "poll interval below the 5s floor will be clamped"
            );
        }
        let mut seen = std::collections::HashSet::new();
        for client in &self.clients {
            if !seen.insert(&client.id) {
                tracing::warn!(client_id = %client.id, "duplicate client id");
            }
        }
    }
}

/// Media server connection and stream accounting settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MediaServerConfig {
    /// Server base URL (e.g. `http://192.168.1.100:32400`)
    #[serde(default)]
    pub url: String,

    /// Access token
    #[serde(default)]
    pub token: String,

    /// Count LAN-served streams against bandwidth (WAN-only by default)
    #[serde(default)]
    pub include_lan_streams: bool,
}

/// One download client definition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Unique identifier for this client instance
    pub id: String,

    /// Daemon family this client speaks
    pub kind: ClientKind,

    /// Display name for logs and events
    pub name: String,

    /// Whether the client participates in allocation
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Daemon base URL
    pub url: String,

    /// Username, for daemons that use one
    #[serde(default)]
    pub username: Option<String>,

    /// Password, for daemons that use one
    #[serde(default)]
    pub password: Option<String>,

    /// API key, for daemons that use one
    #[serde(default)]
    pub api_key: Option<String>,

    /// Whether this client manages upload bandwidth (torrents do,
    /// usenet daemons don't)
    #[serde(default)]
    pub supports_upload: bool,
}

/// Bandwidth capacities and allocation tuning
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BandwidthConfig {
    /// Download-side capacity and split settings
    #[serde(default)]
    pub download: DownloadBandwidthConfig,

    /// Upload-side capacity and split settings
    #[serde(default)]
    pub upload: UploadBandwidthConfig,

    /// Stream cost accounting settings
    #[serde(default)]
    pub streams: StreamBandwidthConfig,
}

/// Download bandwidth configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadBandwidthConfig {
    /// Total download capacity in Mbps
    #[serde(default)]
    pub total_mbps: f64,

    /// Per-client-type percentages used when multiple clients are actively
    /// downloading. Keyed by [`ClientKind::as_str`] values. Clients without
    /// an entry fall back to an equal split.
    #[serde(default)]
    pub client_percents: HashMap<String, u32>,

    /// Minimum percentage guaranteed to inactive clients so they can be
    /// detected waking up (default 5)
    #[serde(default = "default_safety_net")]
    pub inactive_safety_net_percent: u32,

    /// Alternate download settings during a daily window
    #[serde(default)]
    pub scheduled: ScheduleConfig,
}

impl Default for DownloadBandwidthConfig {
    fn default() -> Self {
        Self {
            total_mbps: 0.0,
            client_percents: HashMap::new(),
            inactive_safety_net_percent: default_safety_net(),
            scheduled: ScheduleConfig::default(),
        }
    }
}

/// Upload bandwidth configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UploadBandwidthConfig {
    /// Total upload capacity in Mbps
    #[serde(default)]
    pub total_mbps: f64,

    /// Per-client-type upload percentages when multiple clients are
    /// actively uploading
    #[serde(default)]
    pub client_percents: HashMap<String, u32>,

    /// Alternate upload settings during a daily window
    #[serde(default)]
    pub scheduled: ScheduleConfig,
}

/// Stream cost accounting configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamBandwidthConfig {
    /// Protocol/retransmit headroom added on top of each stream's bitrate,
    /// as a percentage (clamped to 0..=300 at use; default 100)
    #[serde(default = "default_overhead")]
    pub overhead_percent: u32,

    /// Fraction of the stream cost held back from download capacity to
    /// protect ACK/control traffic, as a percentage (default 0)
    #[serde(default)]
    pub download_reserve_percent: u32,
}

impl Default for StreamBandwidthConfig {
    fn default() -> Self {
        Self {
            overhead_percent: default_overhead(),
            download_reserve_percent: 0,
        }
    }
}

/// How long to keep holding a departed stream's bandwidth
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestorationConfig {
    /// Hold after an episode ends, in seconds — long enough for autoplay
    /// to pick the next episode (default 600)
    #[serde(default = "default_episode_end")]
    pub episode_end_secs: u64,

    /// Hold after a movie ends, in seconds — credits plus picking the next
    /// thing take longer (default 1800)
    #[serde(default = "default_movie_end")]
    pub movie_end_secs: u64,
}

impl Default for RestorationConfig {
    fn default() -> Self {
        Self {
            episode_end_secs: default_episode_end(),
            movie_end_secs: default_movie_end(),
        }
    }
}

impl RestorationConfig {
    /// Hold duration for a given media kind. Unknown kinds use the episode
    /// delay.
    pub fn hold_secs(&self, kind: crate::types::MediaKind) -> u64 {
        match kind {
            crate::types::MediaKind::Movie => self.movie_end_secs,
            _ => self.episode_end_secs,
        }
    }
}

/// Router link probe configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkProbeConfig {
    /// Whether the probe contributes to allocation
    #[serde(default)]
    pub enabled: bool,

    /// Counter table index of the WAN interface to measure
    #[serde(default)]
    pub interface_index: u32,

    /// Measurement window in seconds — must outlast the device's counter
    /// cache (default 5)
    #[serde(default = "default_probe_window")]
    pub window_secs: u64,
}

impl Default for LinkProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interface_index: 0,
            window_secs: default_probe_window(),
        }
    }
}

/// Polling cadence configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Poll interval in seconds for both loops (floor of 5 applied at use)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_safety_net() -> u32 {
    5
}

fn default_overhead() -> u32 {
    100
}

fn default_episode_end() -> u64 {
    600
}

fn default_movie_end() -> u64 {
    1800
}

fn default_probe_window() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    5
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bandwidth.streams.overhead_percent, 100);
        assert_eq!(config.bandwidth.streams.download_reserve_percent, 0);
        assert_eq!(config.bandwidth.download.inactive_safety_net_percent, 5);
        assert_eq!(config.restoration.episode_end_secs, 600);
        assert_eq!(config.restoration.movie_end_secs, 1800);
        assert!(!config.media_server.include_lan_streams);
        assert_eq!(config.system.poll_interval_secs, 5);
    }

    #[test]
    fn test_poll_interval_floor() {
        let config = Config {
            system: SystemConfig {
                poll_interval_secs: 1,
            },
            ..Config::default()
        };
        assert_eq!(config.poll_interval(), std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_hold_secs_by_media_kind() {
        let restoration = RestorationConfig::default();
        assert_eq!(restoration.hold_secs(MediaKind::Episode), 600);
        assert_eq!(restoration.hold_secs(MediaKind::Movie), 1800);
        // Unknown media kinds get the episode delay
        assert_eq!(restoration.hold_secs(MediaKind::Other), 600);
    }

    #[test]
    fn test_enabled_and_upload_client_filters() {
        let config = Config {
            clients: vec![
                ClientConfig {
                    id: "qb".into(),
                    kind: ClientKind::QBittorrent,
                    name: "qBittorrent".into(),
                    enabled: true,
                    url: "http://localhost:8080".into(),
                    username: None,
                    password: None,
                    api_key: None,
                    supports_upload: true,
                },
                ClientConfig {
                    id: "sab".into(),
                    kind: ClientKind::Sabnzbd,
                    name: "SABnzbd".into(),
                    enabled: true,
                    url: "http://localhost:8085".into(),
                    username: None,
                    password: None,
                    api_key: Some("key".into()),
                    supports_upload: false,
                },
                ClientConfig {
                    id: "old".into(),
                    kind: ClientKind::Deluge,
                    name: "Deluge".into(),
                    enabled: false,
                    url: "http://localhost:8112".into(),
                    username: None,
                    password: Some("pw".into()),
                    api_key: None,
                    supports_upload: true,
                },
            ],
            ..Config::default()
        };

        assert_eq!(config.enabled_clients().len(), 2);
        let uploaders = config.upload_clients();
        assert_eq!(uploaders.len(), 1);
        assert_eq!(uploaders[0].id, "qb");
    }

    #[test]
    fn test_deserialize_minimal_config() {
        let json = r#"{
            "bandwidth": {
                "download": { "total_mbps": 900.0 },
                "upload": { "total_mbps": 40.0 }
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.bandwidth.download.total_mbps, 900.0);
        assert_eq!(config.bandwidth.upload.total_mbps, 40.0);
        assert!(config.clients.is_empty());
    }
}

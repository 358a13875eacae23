//! Core types and events for bandarr

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identifier for a configured download client
///
/// Chosen at configuration time (e.g. `"qbittorrent-main"`) and used as the
/// key for stats, decisions, and activity tracking across polls.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    /// Create a new ClientId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Download daemon family
///
/// Determines which adapter the factory builds and which entry of the
/// per-type percent maps applies to a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    /// qBittorrent (Web API, bytes/s limits)
    QBittorrent,
    /// SABnzbd (api-key API, decimal MB/s limit strings)
    Sabnzbd,
    /// NZBGet (JSON-RPC, KB/s rate command)
    Nzbget,
    /// Transmission (RPC, KB/s limits gated by enabled flags)
    Transmission,
    /// Deluge (web JSON-RPC, -1 means unlimited)
    Deluge,
}

impl ClientKind {
    /// The lowercase identifier used in configuration and percent maps
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::QBittorrent => "qbittorrent",
            ClientKind::Sabnzbd => "sabnzbd",
            ClientKind::Nzbget => "nzbget",
            ClientKind::Transmission => "transmission",
            ClientKind::Deluge => "deluge",
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ClientKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qbittorrent" => Ok(ClientKind::QBittorrent),
            "sabnzbd" => Ok(ClientKind::Sabnzbd),
            "nzbget" => Ok(ClientKind::Nzbget),
            "transmission" => Ok(ClientKind::Transmission),
            "deluge" => Ok(ClientKind::Deluge),
            other => Err(format!("unknown client kind: {other}")),
        }
    }
}

/// Kind of media a stream session is playing
///
/// Drives the bandwidth-hold duration when the session ends: episode
/// boundaries resolve quickly (autoplay), movie credits take longer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// TV episode
    Episode,
    /// Movie
    Movie,
    /// Anything else (music, photos, unknown)
    #[default]
    Other,
}

impl MediaKind {
    /// Map a media server's raw type string to a MediaKind
    pub fn from_raw(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "episode" => MediaKind::Episode,
            "movie" => MediaKind::Movie,
            _ => MediaKind::Other,
        }
    }
}

/// Playback state reported by the media server
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// Actively playing
    Playing,
    /// Paused by the viewer
    Paused,
    /// Buffering
    Buffering,
}

impl PlaybackState {
    /// Parse a server-reported state string; anything unrecognized is None
    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "playing" => Some(PlaybackState::Playing),
            "paused" => Some(PlaybackState::Paused),
            "buffering" => Some(PlaybackState::Buffering),
            _ => None,
        }
    }
}

/// A single active streaming session
///
/// Identity is `session_id`, stable for as long as the session exists on the
/// server. Bandwidth accounting uses `bitrate_mbps` (the encoded rate of
/// what is being served) with `observed_mbps` as a real-time cross-check
/// when the server reports per-device throughput.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamSession {
    /// Opaque session identifier assigned by the media server
    pub session_id: String,
    /// Account identifier of the viewer
    pub user_id: String,
    /// Display name of the viewer
    pub user_name: String,
    /// Stable identifier of the playback device
    pub player_id: String,
    /// Display name of the playback device
    pub player_name: String,
    /// What kind of media is playing
    pub media_kind: MediaKind,
    /// Display title of the media
    pub media_title: String,
    /// Video resolution label when known (e.g. "4k", "1080") — used as a
    /// bandwidth fallback when the bitrate is missing
    pub quality_profile: Option<String>,
    /// Encoded bitrate of the served media in Mbps (0 when unknown)
    pub bitrate_mbps: f64,
    /// Observed network throughput in Mbps (0 when the server does not
    /// report per-device bandwidth)
    pub observed_mbps: f64,
    /// Resolved client address when available
    pub ip_address: Option<String>,
    /// True when the stream is served to the local network
    pub is_lan: bool,
    /// Playback state
    pub state: PlaybackState,
}

/// Per-poll statistics for one download client
///
/// All rates and limits are in Mbps at this boundary; each adapter converts
/// to and from its daemon's native unit. A limit of 0 means unlimited.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientStats {
    /// Current download rate in Mbps
    pub download_mbps: f64,
    /// Current upload rate in Mbps
    pub upload_mbps: f64,
    /// Current download limit in Mbps (0 = unlimited)
    pub download_limit_mbps: f64,
    /// Current upload limit in Mbps (0 = unlimited)
    pub upload_limit_mbps: f64,
    /// True when the client is moving data beyond a small noise floor.
    /// Computed from measured rates, never from the daemon's state strings,
    /// so stalled transfers read as inactive.
    pub active_work: bool,
    /// Download limit recorded on the first successful probe (for
    /// shutdown restoration; 0 = was unlimited)
    pub original_download_limit_mbps: f64,
    /// Upload limit recorded on the first successful probe
    pub original_upload_limit_mbps: f64,
}

/// A download/upload limit pair in Mbps (0 = unlimited on both sides)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Download limit in Mbps (0 = unlimited)
    pub download_mbps: f64,
    /// Upload limit in Mbps (0 = unlimited)
    pub upload_mbps: f64,
}

/// One allocation decision for one client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Download limit to apply in Mbps (0 = unlimited)
    pub download_limit_mbps: f64,
    /// Upload limit to apply in Mbps (0 = unlimited; always 0 for clients
    /// without upload support)
    pub upload_limit_mbps: f64,
    /// Human-readable breakdown of the inputs that produced this decision
    pub reason: String,
}

/// Snapshot of one live bandwidth reservation for external inspection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReservationView {
    /// Unique reservation identifier
    pub id: String,
    /// Held bandwidth in Mbps
    pub bandwidth_mbps: f64,
    /// Viewer whose departed stream created the hold
    pub user_id: String,
    /// Display name of that viewer
    pub user_name: String,
    /// Playback device the stream ended on
    pub player_id: String,
    /// Title of the media that ended
    pub media_title: String,
    /// Kind of media that ended (drives the hold duration)
    pub media_kind: MediaKind,
    /// When the hold was created
    pub created_at: DateTime<Utc>,
    /// Hold duration in seconds
    pub duration_secs: u64,
    /// When the hold expires on its own
    pub expires_at: DateTime<Utc>,
}

/// An operator-supplied temporary capacity override
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemporaryLimits {
    /// Download capacity override in Mbps (None = leave download alone)
    pub download_mbps: Option<f64>,
    /// Upload capacity override in Mbps (None = leave upload alone)
    pub upload_mbps: Option<f64>,
    /// When the override stops applying
    pub expires_at: DateTime<Utc>,
    /// Free-form source tag (e.g. "Home Assistant - Gaming PC")
    pub source: Option<String>,
    /// Who or what set the override
    pub set_by: Option<String>,
}

/// Read-only view of the temporary override state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TemporaryLimitsView {
    /// True when an unexpired override is in place
    pub active: bool,
    /// Download override in Mbps, if set
    pub download_mbps: Option<f64>,
    /// Upload override in Mbps, if set
    pub upload_mbps: Option<f64>,
    /// Seconds until expiry (0 when inactive)
    pub remaining_secs: u64,
    /// Source tag supplied when the override was set
    pub source: Option<String>,
    /// Who or what set the override
    pub set_by: Option<String>,
}

/// One two-sample rate measurement from the link probe
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkReading {
    /// Inbound (download-direction) rate in Mbps
    pub inbound_mbps: f64,
    /// Outbound (upload-direction) rate in Mbps
    pub outbound_mbps: f64,
    /// When the measurement completed
    pub sampled_at: DateTime<Utc>,
}

/// Aggregate snapshot of the monitor's current state
///
/// Assembled from cached poll results without touching the network.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Active stream sessions as of the last successful stream poll
    pub active_streams: Vec<StreamSession>,
    /// Bandwidth-counted stream cost (with overhead) in Mbps
    pub total_stream_cost_mbps: f64,
    /// Sum of live reservation holds in Mbps
    pub reserved_upload_mbps: f64,
    /// Last known stats per client (absent for clients never reached)
    pub client_stats: std::collections::HashMap<ClientId, ClientStats>,
    /// Download capacity currently in effect (after override/schedule)
    pub effective_download_mbps: f64,
    /// Upload capacity currently in effect (after override/schedule)
    pub effective_upload_mbps: f64,
    /// Last link probe reading, when the probe is enabled and healthy
    pub link_reading: Option<LinkReading>,
    /// True when actuation is paused
    pub paused: bool,
}

/// Events emitted by the polling monitor
///
/// Delivered on a broadcast channel; subscribe via
/// [`PollingMonitor::subscribe`](crate::monitor::PollingMonitor::subscribe).
/// Pre-existing sessions found on the first poll after startup do not emit
/// `StreamStarted`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new stream session appeared
    StreamStarted {
        /// Session identifier
        session_id: String,
        /// Viewer display name
        user_name: String,
        /// Playback device display name
        player_name: String,
        /// Media title
        media_title: String,
        /// Encoded bitrate in Mbps
        bitrate_mbps: f64,
        /// Total active stream count after this start
        stream_count: usize,
    },

    /// A stream session disappeared from the snapshot
    StreamEnded {
        /// Session identifier
        session_id: String,
        /// Viewer display name
        user_name: String,
        /// Media title
        media_title: String,
        /// Bandwidth held back for this departure, when a hold was created
        held_mbps: Option<f64>,
        /// Hold duration in seconds, when a hold was created
        hold_secs: Option<u64>,
    },

    /// A polled service crossed the consecutive-failure threshold
    ServiceUnreachable {
        /// Which service ("stream source", a client name, "link probe")
        service: String,
        /// How many consecutive polls have failed
        consecutive_failures: u32,
    },

    /// A previously-unreachable service answered again
    ServiceRecovered {
        /// Which service recovered
        service: String,
    },

    /// A bandwidth hold was created for a departed stream
    ReservationCreated {
        /// Reservation identifier
        id: String,
        /// Held bandwidth in Mbps
        bandwidth_mbps: f64,
        /// Viewer the hold belongs to
        user_id: String,
        /// Playback device the hold belongs to
        player_id: String,
        /// Hold duration in seconds
        duration_secs: u64,
    },

    /// Holds were cancelled because the viewer resumed on the same device
    ReservationCancelled {
        /// Viewer whose holds were cancelled
        user_id: String,
        /// Playback device whose holds were cancelled
        player_id: String,
        /// Total bandwidth released in Mbps
        freed_mbps: f64,
    },

    /// A hold reached its deadline and released its bandwidth
    ReservationExpired {
        /// Reservation identifier
        id: String,
        /// Bandwidth released in Mbps
        bandwidth_mbps: f64,
    },

    /// A temporary capacity override was set
    TemporaryLimitsSet {
        /// Download override in Mbps, if any
        download_mbps: Option<f64>,
        /// Upload override in Mbps, if any
        upload_mbps: Option<f64>,
        /// Override duration in seconds
        duration_secs: u64,
        /// Who or what set it
        set_by: Option<String>,
    },

    /// The temporary capacity override was cleared or expired
    TemporaryLimitsCleared,

    /// New limits were pushed to a client
    LimitsApplied {
        /// Client the limits were pushed to
        client_id: ClientId,
        /// Download limit in Mbps
        download_mbps: f64,
        /// Upload limit in Mbps
        upload_mbps: f64,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_kind_round_trip() {
        for kind in [
            ClientKind::QBittorrent,
            ClientKind::Sabnzbd,
            ClientKind::Nzbget,
            ClientKind::Transmission,
            ClientKind::Deluge,
        ] {
            let parsed: ClientKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_client_kind_rejects_unknown() {
        assert!("rtorrent".parse::<ClientKind>().is_err());
    }

    #[test]
    fn test_media_kind_from_raw() {
        assert_eq!(MediaKind::from_raw("episode"), MediaKind::Episode);
        assert_eq!(MediaKind::from_raw("Movie"), MediaKind::Movie);
        assert_eq!(MediaKind::from_raw("track"), MediaKind::Other);
        assert_eq!(MediaKind::from_raw(""), MediaKind::Other);
    }

    #[test]
    fn test_playback_state_from_raw() {
        assert_eq!(PlaybackState::from_raw("playing"), Some(PlaybackState::Playing));
        assert_eq!(PlaybackState::from_raw("stopped"), None);
    }

    #[test]
    fn test_event_serialization_tags() {
        let event = Event::ServiceRecovered {
            service: "stream source".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"service_recovered\""));
    }

    #[test]
    fn test_client_id_display() {
        let id = ClientId::new("sabnzbd-box");
        assert_eq!(id.to_string(), "sabnzbd-box");
        assert_eq!(id.as_str(), "sabnzbd-box");
    }
}

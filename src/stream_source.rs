//! Active stream listing
//!
//! [`StreamSource`] is the seam the polling monitor consumes; the provided
//! implementation speaks to a Plex Media Server. Sessions come from
//! `/status/sessions`; when the server also exposes per-account/device
//! throughput at `/statistics/bandwidth` it is fused into each session's
//! `observed_mbps` (absence of that endpoint is not an error).
//!
//! Transport failures propagate to the caller: the monitor must keep its
//! previous snapshot on error and never treat an unreachable server as
//! "all streams ended".

use crate::error::{Error, Result};
use crate::types::{MediaKind, PlaybackState, StreamSession};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// Per-request timeout against the media server
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Timespan parameter for the bandwidth statistics endpoint (seconds)
const BANDWIDTH_TIMESPAN: u32 = 4;

/// Lists the media server's active sessions
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Current active sessions.
    ///
    /// Transient unreachability must surface as `Err`; an empty list means
    /// the server answered and nothing is playing.
    async fn list_active(&self) -> Result<Vec<StreamSession>>;
}

/// Plex Media Server stream source
pub struct PlexStreamSource {
    base: String,
    token: String,
    http: reqwest::Client,
}

impl PlexStreamSource {
    /// Create a source for the given server URL and access token
    pub fn new(url: &str, token: &str) -> Result<Self> {
        url::Url::parse(url.trim_end_matches('/'))?;
        Ok(Self {
            base: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            // Many home servers run self-signed TLS
            http: reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()?,
        })
    }

    async fn fetch_sessions(&self) -> Result<Vec<Value>> {
        let response = self
            .http
            .get(format!("{}/status/sessions", self.base))
            .query(&[("X-Plex-Token", self.token.as_str())])
            .header("Accept", "application/json")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::transport("stream source", e))?
            .error_for_status()?;

        let body: Value = response.json().await?;
        Ok(body
            .pointer("/MediaContainer/Metadata")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Real-time throughput per (account, device). Best-effort: servers
    /// without the statistics endpoint yield an empty map.
    async fn fetch_bandwidth(&self) -> HashMap<(String, String), f64> {
        let mut result = HashMap::new();

        let timespan = BANDWIDTH_TIMESPAN.to_string();
        let response = self
            .http
            .get(format!("{}/statistics/bandwidth", self.base))
            .query(&[
                ("X-Plex-Token", self.token.as_str()),
                ("timespan", timespan.as_str()),
            ])
            .header("Accept", "application/json")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::debug!(status = %r.status(), "bandwidth statistics unavailable");
                return result;
            }
            Err(e) => {
                tracing::debug!(error = %e, "bandwidth statistics fetch failed");
                return result;
            }
        };

        let body: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "bandwidth statistics parse failed");
                return result;
            }
        };

        let stats = body
            .pointer("/MediaContainer/StatisticsBandwidth")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for stat in stats {
            let account = value_to_string(stat.get("accountID"));
            let device = value_to_string(stat.get("deviceID"));
            let timespan = value_to_f64(stat.get("timespan"));
            let bytes = value_to_f64(stat.get("bytes"));
            if timespan > 0.0 {
                let mbps = bytes / timespan * 8.0 / 1_000_000.0;
                result.insert((account, device), mbps);
            }
        }
        result
    }

    fn normalize(&self, session: &Value, bandwidth: &HashMap<(String, String), f64>) -> Option<StreamSession> {
        let player = session.get("Player");
        let state_raw = player
            .and_then(|p| p.get("state"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let state = PlaybackState::from_raw(state_raw)?;

        let session_info = session.get("Session");
        let user = session.get("User");

        let session_id = session_info
            .and_then(|s| s.get("id"))
            .map(|v| value_to_string(Some(v)))
            .filter(|s| !s.is_empty())
            .or_else(|| {
                session
                    .get("sessionKey")
                    .map(|v| value_to_string(Some(v)))
                    .filter(|s| !s.is_empty())
            })?;

        let user_id = value_to_string(user.and_then(|u| u.get("id")));
        let user_name = user
            .and_then(|u| u.get("title"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        let player_id = value_to_string(player.and_then(|p| p.get("machineIdentifier")));
        let player_name = player
            .and_then(|p| p.get("title"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();

        // Bitrate sources in preference order, all kbps: the session's
        // reported bandwidth, the media file's bitrate, the transcode target
        let media = session
            .get("Media")
            .and_then(Value::as_array)
            .and_then(|m| m.first())
            .cloned()
            .unwrap_or(Value::Null);
        let transcode = session.get("TranscodeSession");
        let mut bitrate_kbps = value_to_f64(session_info.and_then(|s| s.get("bandwidth")));
        if bitrate_kbps <= 0.0 {
            bitrate_kbps = value_to_f64(media.get("bitrate"));
        }
        if bitrate_kbps <= 0.0 {
            bitrate_kbps = value_to_f64(transcode.and_then(|t| t.get("bitrate")));
        }
        let bitrate_mbps = bitrate_kbps / 1000.0;

        let observed_mbps = bandwidth
            .get(&(user_id.clone(), player_id.clone()))
            .copied()
            .unwrap_or(0.0);

        // LAN detection: the server's local flag, a literal "lan" location,
        // or a private/loopback client address
        let location = session_info
            .and_then(|s| s.get("location"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let player_address = player
            .and_then(|p| p.get("address"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let ip_address = if parse_ip(location).is_some() {
            location
        } else {
            player_address
        };

        let server_says_local = session_info
            .and_then(|s| s.get("local"))
            .map(|v| v == &Value::Bool(true) || v == &Value::String("1".into()))
            .unwrap_or(false);
        let location_says_lan = location.eq_ignore_ascii_case("lan");
        let ip_is_private = parse_ip(ip_address).map(is_private_ip).unwrap_or(false);
        let is_lan = server_says_local || location_says_lan || ip_is_private;

        let media_kind = MediaKind::from_raw(
            session.get("type").and_then(Value::as_str).unwrap_or(""),
        );
        let media_title = display_title(session, media_kind);
        let quality_profile = media
            .get("videoResolution")
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(StreamSession {
            session_id,
            user_id,
            user_name,
            player_id,
            player_name,
            media_kind,
            media_title,
            quality_profile,
            bitrate_mbps,
            observed_mbps,
            ip_address: if ip_address.is_empty() {
                None
            } else {
                Some(ip_address.to_string())
            },
            is_lan,
            state,
        })
    }
}

#[async_trait]
impl StreamSource for PlexStreamSource {
    async fn list_active(&self) -> Result<Vec<StreamSession>> {
        // Session fetch failures propagate for the caller's failure
        // tracking; bandwidth statistics stay best-effort
        let sessions = self.fetch_sessions().await?;
        let bandwidth = self.fetch_bandwidth().await;

        let active: Vec<StreamSession> = sessions
            .iter()
            .filter_map(|s| self.normalize(s, &bandwidth))
            .collect();

        tracing::debug!(count = active.len(), "active streams");
        Ok(active)
    }
}

/// "Grandparent - Title" for episodes, plain title otherwise
fn display_title(session: &Value, kind: MediaKind) -> String {
    let title = session
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Unknown");
    if kind == MediaKind::Episode {
        if let Some(show) = session.get("grandparentTitle").and_then(Value::as_str) {
            return format!("{show} - {title}");
        }
    }
    title.to_string()
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.parse().ok()
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        // Unique-local fc00::/7 plus loopback
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Plex reports ids sometimes as numbers, sometimes as strings
fn value_to_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn value_to_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sessions_body(local: &str, address: &str, state: &str) -> String {
        format!(
            r#"{{"MediaContainer": {{"Metadata": [{{
                "sessionKey": "12",
                "type": "episode",
                "title": "Pilot",
                "grandparentTitle": "Some Show",
                "Media": [{{"bitrate": 12000, "videoResolution": "1080"}}],
                "Session": {{"id": "abc123", "bandwidth": 14000, "location": "wan", "local": {local}}},
                "User": {{"id": 7, "title": "alice"}},
                "Player": {{"machineIdentifier": "roku-1", "title": "Roku Living",
                            "state": "{state}", "address": "{address}"}}
            }}]}}}}"#
        )
    }

    async fn mount_no_bandwidth(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/statistics/bandwidth"))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_list_active_normalizes_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status/sessions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sessions_body("\"0\"", "203.0.113.9", "playing")),
            )
            .mount(&server)
            .await;
        mount_no_bandwidth(&server).await;

        let source = PlexStreamSource::new(&server.uri(), "token").unwrap();
        let streams = source.list_active().await.unwrap();

        assert_eq!(streams.len(), 1);
        let s = &streams[0];
        assert_eq!(s.session_id, "abc123");
        assert_eq!(s.user_id, "7");
        assert_eq!(s.user_name, "alice");
        assert_eq!(s.player_id, "roku-1");
        assert_eq!(s.media_kind, MediaKind::Episode);
        assert_eq!(s.media_title, "Some Show - Pilot");
        // Session.bandwidth (14000 kbps) wins over Media.bitrate
        assert_eq!(s.bitrate_mbps, 14.0);
        assert!(!s.is_lan);
        assert_eq!(s.state, PlaybackState::Playing);
    }

    #[tokio::test]
    async fn test_private_address_marks_lan() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status/sessions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sessions_body("\"0\"", "192.168.1.50", "playing")),
            )
            .mount(&server)
            .await;
        mount_no_bandwidth(&server).await;

        let source = PlexStreamSource::new(&server.uri(), "token").unwrap();
        let streams = source.list_active().await.unwrap();
        assert!(streams[0].is_lan);
    }

    #[tokio::test]
    async fn test_local_flag_marks_lan() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status/sessions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sessions_body("\"1\"", "203.0.113.9", "playing")),
            )
            .mount(&server)
            .await;
        mount_no_bandwidth(&server).await;

        let source = PlexStreamSource::new(&server.uri(), "token").unwrap();
        let streams = source.list_active().await.unwrap();
        assert!(streams[0].is_lan);
    }

    #[tokio::test]
    async fn test_stopped_player_state_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status/sessions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sessions_body("\"0\"", "203.0.113.9", "stopped")),
            )
            .mount(&server)
            .await;
        mount_no_bandwidth(&server).await;

        let source = PlexStreamSource::new(&server.uri(), "token").unwrap();
        let streams = source.list_active().await.unwrap();
        assert!(streams.is_empty());
    }

    #[tokio::test]
    async fn test_empty_container_is_no_streams() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status/sessions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"MediaContainer": {"size": 0}}"#),
            )
            .mount(&server)
            .await;
        mount_no_bandwidth(&server).await;

        let source = PlexStreamSource::new(&server.uri(), "token").unwrap();
        assert!(source.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_errors() {
        // No server at all: the failure must surface as unreachable, not
        // read as an empty stream list
        let source = PlexStreamSource::new("http://127.0.0.1:9", "token").unwrap();
        let err = source.list_active().await.unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_bandwidth_statistics_fused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status/sessions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sessions_body("\"0\"", "203.0.113.9", "playing")),
            )
            .mount(&server)
            .await;
        // 7 MB over 4s = 14 Mbps observed
        Mock::given(method("GET"))
            .and(path("/statistics/bandwidth"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"MediaContainer": {"StatisticsBandwidth": [
                    {"accountID": 7, "deviceID": "roku-1", "timespan": 4, "bytes": 7000000}
                ]}}"#,
            ))
            .mount(&server)
            .await;

        let source = PlexStreamSource::new(&server.uri(), "token").unwrap();
        let streams = source.list_active().await.unwrap();
        assert_eq!(streams[0].observed_mbps, 14.0);
    }

    #[test]
    fn test_is_private_ip() {
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("10.0.0.5".parse().unwrap()));
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("fd00::1".parse().unwrap()));
        assert!(!is_private_ip("203.0.113.9".parse().unwrap()));
        assert!(!is_private_ip("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_display_title() {
        let session = serde_json::json!({
            "title": "Pilot",
            "grandparentTitle": "Some Show"
        });
        assert_eq!(display_title(&session, MediaKind::Episode), "Some Show - Pilot");
        assert_eq!(display_title(&session, MediaKind::Movie), "Pilot");
    }
}

//! Stream-side poll cycle
//!
//! Each tick fetches the active session list, reconciles it against the
//! previous snapshot, and drives the departure/reservation lifecycle. The
//! single most important rule lives here: an unreachable stream source
//! keeps the last known snapshot in place. Treating silence as "no streams"
//! would flood the downloaders and evict every active viewer.

use super::{PollingMonitor, UNREACHABLE_THRESHOLD};
use crate::allocator::stream_cost;
use crate::config::Config;
use crate::reservation::HoldRequest;
use crate::types::{Event, StreamSession};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

impl PollingMonitor {
    pub(crate) async fn run_stream_loop(self: Arc<Self>) {
        tracing::info!("stream poll loop started");
        loop {
            if self.shutdown_token.is_cancelled() {
                break;
            }
            self.stream_tick().await;

            let interval = self.config.read().await.poll_interval();
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("stream poll loop stopped");
    }

    /// Run one stream poll cycle immediately.
    ///
    /// The running loop does this on its own cadence; calling it directly
    /// is useful for tests and for embedders that drive their own schedule.
    pub async fn stream_tick(&self) {
        let config = self.config.read().await.clone();

        let new_sessions = match self.stream_source.list_active().await {
            Ok(sessions) => sessions,
            Err(e) => {
                self.track_stream_failure(&e).await;
                return;
            }
        };

        let (old_sessions, first_poll, recovered) = {
            let mut state = self.streams.lock().await;
            let recovered = state.warned;
            state.warned = false;
            state.consecutive_failures = 0;
            let first_poll = state.first_poll;
            state.first_poll = false;
            let old = std::mem::replace(&mut state.sessions, new_sessions.clone());
            (old, first_poll, recovered)
        };

        if recovered {
            tracing::info!("stream source connection restored");
            self.emit(Event::ServiceRecovered {
                service: "stream source".into(),
            });
        }

        // Remember each live session's bitrate so a departure can still be
        // priced when the server has stopped reporting it
        {
            let now = Utc::now();
            let mut cache = self.session_cache.lock().await;
            for session in &new_sessions {
                if session.bitrate_mbps > 0.0 {
                    cache.store(&session.session_id, session.bitrate_mbps, now);
                }
            }
        }

        if first_poll {
            // Pre-existing sessions seed the baseline without start events
            tracing::info!(
                count = new_sessions.len(),
                "first poll: existing streams used as baseline"
            );
            return;
        }

        let old_ids: HashSet<&str> = old_sessions.iter().map(|s| s.session_id.as_str()).collect();
        let new_ids: HashSet<&str> = new_sessions.iter().map(|s| s.session_id.as_str()).collect();

        for ended in old_sessions
            .iter()
            .filter(|s| !new_ids.contains(s.session_id.as_str()))
        {
            self.handle_departure(&config, ended).await;
        }

        for started in new_sessions
            .iter()
            .filter(|s| !old_ids.contains(s.session_id.as_str()))
        {
            // The viewer is back: any hold for this (user, player) is moot
            self.reservations
                .cancel_matching(&started.user_id, &started.player_id)
                .await;

            tracing::info!(
                session_id = %started.session_id,
                user = %started.user_name,
                player = %started.player_name,
                bitrate_mbps = started.bitrate_mbps,
                "stream started"
            );
            self.emit(Event::StreamStarted {
                session_id: started.session_id.clone(),
                user_name: started.user_name.clone(),
                player_name: started.player_name.clone(),
                media_title: started.media_title.clone(),
                bitrate_mbps: started.bitrate_mbps,
                stream_count: new_sessions.len(),
            });
        }
    }

    async fn track_stream_failure(&self, error: &crate::error::Error) {
        let (failures, newly_warned, cached) = {
            let mut state = self.streams.lock().await;
            state.consecutive_failures += 1;
            let failures = state.consecutive_failures;
            let newly_warned = failures >= UNREACHABLE_THRESHOLD && !state.warned;
            if newly_warned {
                state.warned = true;
            }
            (failures, newly_warned, state.sessions.len())
        };

        if failures == 1 {
            tracing::warn!(
                error = %error,
                cached_streams = cached,
                "stream source unreachable, keeping last known streams"
            );
        } else if !newly_warned {
            tracing::debug!(failures, "stream source still unreachable");
        }

        if newly_warned {
            tracing::error!(
                failures,
                "stream source unreachable past threshold; bandwidth limits held at current levels"
            );
            self.emit(Event::ServiceUnreachable {
                service: "stream source".into(),
                consecutive_failures: failures,
            });
        }
    }

    async fn handle_departure(&self, config: &Config, stream: &StreamSession) {
        // The final snapshot may already have lost the bitrate; fall back to
        // what we cached while the session was alive
        let bitrate = if stream.bitrate_mbps > 0.0 {
            stream.bitrate_mbps
        } else {
            self.session_cache
                .lock()
                .await
                .get(&stream.session_id)
                .unwrap_or(0.0)
        };
        let freed = stream_cost(
            bitrate,
            stream.quality_profile.as_deref(),
            config.bandwidth.streams.overhead_percent,
        );

        self.session_cache.lock().await.remove(&stream.session_id);

        if stream.is_lan && !config.media_server.include_lan_streams {
            tracing::debug!(
                session_id = %stream.session_id,
                user = %stream.user_name,
                "LAN stream ended, no bandwidth hold"
            );
            self.emit(Event::StreamEnded {
                session_id: stream.session_id.clone(),
                user_name: stream.user_name.clone(),
                media_title: stream.media_title.clone(),
                held_mbps: None,
                hold_secs: None,
            });
            return;
        }

        let hold_secs = config.restoration.hold_secs(stream.media_kind);
        tracing::info!(
            session_id = %stream.session_id,
            user = %stream.user_name,
            player = %stream.player_name,
            freed_mbps = freed,
            hold_secs,
            "stream ended, holding bandwidth"
        );

        self.reservations
            .create(HoldRequest {
                bandwidth_mbps: freed,
                duration: Duration::from_secs(hold_secs),
                user_id: stream.user_id.clone(),
                user_name: stream.user_name.clone(),
                player_id: stream.player_id.clone(),
                media_title: stream.media_title.clone(),
                media_kind: stream.media_kind,
            })
            .await;

        self.emit(Event::StreamEnded {
            session_id: stream.session_id.clone(),
            user_name: stream.user_name.clone(),
            media_title: stream.media_title.clone(),
            held_mbps: Some(freed),
            hold_secs: Some(hold_secs),
        });
    }
}

//! Download-side poll cycle
//!
//! Each tick polls every client in parallel, samples the link probe, runs
//! the allocator against the cached stream snapshot, and pushes changed
//! limits — then publishes a metrics sample. The tick awaits its own
//! actuation batch, so two actuations on the same adapter can never race
//! across ticks.

use super::{PollingMonitor, UNREACHABLE_THRESHOLD};
use crate::allocator::{self, AllocatorInput, ClientView};
use crate::config::Config;
use crate::error::Result;
use crate::metrics::{ClientTickMetrics, TickMetrics};
use crate::types::{ClientId, ClientStats, Decision, Event, LinkReading};
use chrono::{Local, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Two limits within this are the same knob setting; daemon unit rounding
/// makes exact equality meaningless
const LIMIT_EPSILON: f64 = 0.01;

impl PollingMonitor {
    pub(crate) async fn run_download_loop(self: Arc<Self>) {
        tracing::info!("download poll loop started");
        loop {
            if self.shutdown_token.is_cancelled() {
                break;
            }
            self.download_tick().await;

            let interval = self.config.read().await.poll_interval();
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("download poll loop stopped");
    }

    /// Run one download poll cycle immediately.
    ///
    /// The running loop does this on its own cadence; calling it directly
    /// is useful for tests and for embedders that drive their own schedule.
    pub async fn download_tick(&self) {
        let config = self.config.read().await.clone();

        let stats = self.registry.stats_all().await;
        self.track_client_health(&stats).await;

        let link_reading = self.sample_link_probe(&config).await;

        let reserved_upload_mbps = self.reservations.total().await;
        let (temp_download, temp_upload) = self.active_temp_limits().await;
        let sessions = self.streams.lock().await.sessions.clone();

        // Clients whose poll failed stay in the allocation set with zero
        // observed speed: their streak grows and they drift to the safety
        // net instead of reshuffling everyone else's limits
        let views: Vec<ClientView> = self
            .registry
            .adapters()
            .iter()
            .map(|adapter| {
                let polled = stats.get(adapter.id()).and_then(|r| r.as_ref().ok());
                ClientView {
                    id: adapter.id().clone(),
                    kind: adapter.kind(),
                    supports_upload: adapter.supports_upload(),
                    download_mbps: polled.map_or(0.0, |s| s.download_mbps),
                    upload_mbps: polled.map_or(0.0, |s| s.upload_mbps),
                }
            })
            .collect();

        let decisions = {
            let mut tracker = self.activity.lock().await;
            allocator::decide(
                &config,
                &mut tracker,
                &AllocatorInput {
                    clients: &views,
                    streams: &sessions,
                    reserved_upload_mbps,
                    reserved_download_mbps: 0.0,
                    temp_download_mbps: temp_download,
                    temp_upload_mbps: temp_upload,
                    link_inbound_mbps: link_reading.map(|r| r.inbound_mbps),
                    now: Local::now().time(),
                },
            )
        };

        let paused = self.paused.load(Ordering::SeqCst);
        if !paused && !decisions.is_empty() {
            self.actuate(&stats, &decisions).await;
        }

        self.publish_metrics(&config, &stats, &decisions, &sessions, reserved_upload_mbps, link_reading, paused);
    }

    /// Track per-client reachability, emitting one unreachable event per
    /// outage and one recovery event when the client answers again
    async fn track_client_health(&self, stats: &HashMap<ClientId, Result<ClientStats>>) {
        let mut unreachable: Vec<(String, u32)> = Vec::new();
        let mut recovered: Vec<String> = Vec::new();

        {
            let mut state = self.clients_state.lock().await;
            for adapter in self.registry.adapters() {
                let id = adapter.id().clone();
                match stats.get(&id) {
                    Some(Ok(client_stats)) => {
                        if state.warned.get(&id).copied().unwrap_or(false) {
                            recovered.push(adapter.display_name().to_string());
                        }
                        state.failures.insert(id.clone(), 0);
                        state.warned.insert(id.clone(), false);
                        state.last_stats.insert(id, client_stats.clone());
                    }
                    _ => {
                        let failures = {
                            let entry = state.failures.entry(id.clone()).or_insert(0);
                            *entry += 1;
                            *entry
                        };
                        if failures >= UNREACHABLE_THRESHOLD
                            && !state.warned.get(&id).copied().unwrap_or(false)
                        {
                            state.warned.insert(id.clone(), true);
                            unreachable.push((adapter.display_name().to_string(), failures));
                        }
                    }
                }
            }
        }

        for (service, consecutive_failures) in unreachable {
            tracing::error!(service = %service, consecutive_failures, "client unreachable");
            self.emit(Event::ServiceUnreachable {
                service,
                consecutive_failures,
            });
        }
        for service in recovered {
            tracing::info!(service = %service, "client connection restored");
            self.emit(Event::ServiceRecovered { service });
        }
    }

    /// Sample the link probe when enabled, with the same failure tracking
    /// as every other polled service. A discarded sample counts as a
    /// failure: the allocator simply goes without link data this tick.
    async fn sample_link_probe(&self, config: &Config) -> Option<LinkReading> {
        let probe = self.link_probe.as_ref()?;
        if !config.link_probe.enabled {
            return None;
        }

        let sample = probe.sample_rate().await;

        let (reading, newly_warned, failures, recovered) = {
            let mut state = self.probe_state.lock().await;
            match sample {
                Ok(Some(reading)) => {
                    let recovered = state.warned;
                    state.warned = false;
                    state.consecutive_failures = 0;
                    state.last_reading = Some(reading);
                    (Some(reading), false, 0, recovered)
                }
                Ok(None) | Err(_) => {
                    if let Err(ref e) = sample {
                        tracing::warn!(error = %e, "link probe sample failed");
                    }
                    state.last_reading = None;
                    state.consecutive_failures += 1;
                    let failures = state.consecutive_failures;
                    let newly_warned = failures >= UNREACHABLE_THRESHOLD && !state.warned;
                    if newly_warned {
                        state.warned = true;
                    }
                    (None, newly_warned, failures, false)
                }
            }
        };

        if newly_warned {
            tracing::error!(failures, "link probe unreachable");
            self.emit(Event::ServiceUnreachable {
                service: "link probe".into(),
                consecutive_failures: failures,
            });
        }
        if recovered {
            tracing::info!("link probe restored");
            self.emit(Event::ServiceRecovered {
                service: "link probe".into(),
            });
        }
        reading
    }

    /// Push decisions whose limits differ from what the daemon currently
    /// has. Clients that did not answer this tick are skipped entirely.
    async fn actuate(
        &self,
        stats: &HashMap<ClientId, Result<ClientStats>>,
        decisions: &HashMap<ClientId, Decision>,
    ) {
        let mut to_apply: HashMap<ClientId, Decision> = HashMap::new();

        for adapter in self.registry.adapters() {
            let Some(decision) = decisions.get(adapter.id()) else {
                continue;
            };
            let Some(Ok(observed)) = stats.get(adapter.id()) else {
                continue;
            };

            let download_changed =
                (decision.download_limit_mbps - observed.download_limit_mbps).abs() > LIMIT_EPSILON;
            let upload_changed = adapter.supports_upload()
                && (decision.upload_limit_mbps - observed.upload_limit_mbps).abs() > LIMIT_EPSILON;

            if download_changed || upload_changed {
                to_apply.insert(adapter.id().clone(), decision.clone());
            }
        }

        if to_apply.is_empty() {
            return;
        }

        let results = self.registry.apply(&to_apply).await;
        for (client_id, applied) in results {
            if !applied {
                continue;
            }
            if let Some(decision) = to_apply.get(&client_id) {
                self.emit(Event::LimitsApplied {
                    client_id: client_id.clone(),
                    download_mbps: decision.download_limit_mbps,
                    upload_mbps: decision.upload_limit_mbps,
                });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn publish_metrics(
        &self,
        config: &Config,
        stats: &HashMap<ClientId, Result<ClientStats>>,
        decisions: &HashMap<ClientId, Decision>,
        sessions: &[crate::types::StreamSession],
        reserved_upload_mbps: f64,
        link_reading: Option<LinkReading>,
        paused: bool,
    ) {
        let overhead = config.bandwidth.streams.overhead_percent;
        let counted =
            allocator::countable_streams(sessions, config.media_server.include_lan_streams);
        let total_stream_bitrate_mbps: f64 = counted.iter().map(|s| s.bitrate_mbps).sum();
        let total_stream_cost_mbps: f64 = counted
            .iter()
            .map(|s| allocator::stream_cost(s.bitrate_mbps, s.quality_profile.as_deref(), overhead))
            .sum();

        let clients = self
            .registry
            .adapters()
            .iter()
            .map(|adapter| {
                let polled = stats.get(adapter.id()).and_then(|r| r.as_ref().ok());
                let decision = decisions.get(adapter.id());
                ClientTickMetrics {
                    client_id: adapter.id().clone(),
                    kind: adapter.kind(),
                    download_mbps: polled.map_or(0.0, |s| s.download_mbps),
                    upload_mbps: polled.map_or(0.0, |s| s.upload_mbps),
                    download_limit_mbps: polled.map_or(0.0, |s| s.download_limit_mbps),
                    upload_limit_mbps: polled.map_or(0.0, |s| s.upload_limit_mbps),
                    new_download_limit_mbps: decision.map(|d| d.download_limit_mbps),
                    new_upload_limit_mbps: decision.map(|d| d.upload_limit_mbps),
                    reachable: polled.is_some(),
                }
            })
            .collect();

        self.metrics.record(&TickMetrics {
            timestamp: Utc::now(),
            clients,
            stream_count: sessions.len(),
            total_stream_bitrate_mbps,
            total_stream_cost_mbps,
            reserved_upload_mbps,
            link_reading,
            paused,
        });
    }
}

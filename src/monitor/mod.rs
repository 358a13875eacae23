//! Polling monitor: the control loop that ties everything together
//!
//! Two cooperative tasks share one `PollingMonitor`: the stream loop polls
//! the media server and drives the departure/reservation lifecycle; the
//! download loop polls the clients, runs the allocator, and pushes limits.
//! Each piece of shared state sits behind its own mutex and no lock is ever
//! held across network I/O.
//!
//! The monitor is also the control surface: temporary overrides,
//! reservation inspection, pause/resume, status snapshots, and atomic
//! configuration reloads are all methods here.

mod download_loop;
mod stream_loop;

use crate::allocator::{self, ActivityTracker};
use crate::clients::ClientRegistry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::link_probe::LinkProbe;
use crate::metrics::{MetricsSink, NullMetricsSink};
use crate::reservation::ReservationTable;
use crate::session_cache::SessionBandwidthCache;
use crate::stream_source::{PlexStreamSource, StreamSource};
use crate::types::{
    ClientId, ClientStats, Event, LinkReading, ReservationView, StatusSnapshot, StreamSession,
    TemporaryLimits, TemporaryLimitsView,
};
use chrono::{Duration as ChronoDuration, Local, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Consecutive poll failures before a service is reported unreachable
/// (~30 s at the 5 s floor)
pub(crate) const UNREACHABLE_THRESHOLD: u32 = 6;

/// Aggregate cap on the shutdown restore phase; an unreachable daemon must
/// not stall shutdown
const SHUTDOWN_RESTORE_TIMEOUT: Duration = Duration::from_secs(15);

/// Event broadcast buffer; slow subscribers past this lag see `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Stream-side shared state
pub(crate) struct StreamState {
    /// Last successful snapshot; preserved verbatim across failures
    pub(crate) sessions: Vec<StreamSession>,
    /// True until the first successful snapshot has seeded the baseline
    pub(crate) first_poll: bool,
    /// Consecutive failed polls
    pub(crate) consecutive_failures: u32,
    /// Whether the unreachable event has been emitted for this outage
    pub(crate) warned: bool,
}

/// Download-client shared state
#[derive(Default)]
pub(crate) struct ClientPollState {
    /// Last successful stats per client
    pub(crate) last_stats: HashMap<ClientId, ClientStats>,
    /// Consecutive failed polls per client
    pub(crate) failures: HashMap<ClientId, u32>,
    /// Per-client unreachable-event latch
    pub(crate) warned: HashMap<ClientId, bool>,
}

/// Link probe shared state
#[derive(Default)]
pub(crate) struct ProbeState {
    /// Last good reading
    pub(crate) last_reading: Option<LinkReading>,
    /// Consecutive failed samples
    pub(crate) consecutive_failures: u32,
    /// Unreachable-event latch
    pub(crate) warned: bool,
}

/// The bandwidth arbitration control loop
///
/// Construct one from a [`Config`] plus component handles, `start()` it,
/// and `shutdown()` it when done. All control-surface methods are safe to
/// call concurrently with the running loops.
pub struct PollingMonitor {
    pub(crate) config: RwLock<Arc<Config>>,
    pub(crate) stream_source: Arc<dyn StreamSource>,
    pub(crate) registry: ClientRegistry,
    pub(crate) link_probe: Option<LinkProbe>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) streams: Mutex<StreamState>,
    pub(crate) clients_state: Mutex<ClientPollState>,
    pub(crate) reservations: ReservationTable,
    pub(crate) session_cache: Mutex<SessionBandwidthCache>,
    pub(crate) temp_limits: Mutex<Option<TemporaryLimits>>,
    pub(crate) probe_state: Mutex<ProbeState>,
    pub(crate) activity: Mutex<ActivityTracker>,
    pub(crate) paused: AtomicBool,
    pub(crate) shutdown_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingMonitor {
    /// Assemble a monitor from explicit component handles.
    ///
    /// The registry, stream source, and optional probe are taken as built;
    /// use [`PollingMonitor::from_config`] for the common case.
    pub fn new(
        config: Config,
        stream_source: Arc<dyn StreamSource>,
        registry: ClientRegistry,
        link_probe: Option<LinkProbe>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let reservations = ReservationTable::new(event_tx.clone());

        Self {
            config: RwLock::new(Arc::new(config)),
            stream_source,
            registry,
            link_probe,
            metrics,
            event_tx,
            streams: Mutex::new(StreamState {
                sessions: Vec::new(),
                first_poll: true,
                consecutive_failures: 0,
                warned: false,
            }),
            clients_state: Mutex::new(ClientPollState::default()),
            reservations,
            session_cache: Mutex::new(SessionBandwidthCache::default()),
            temp_limits: Mutex::new(None),
            probe_state: Mutex::new(ProbeState::default()),
            activity: Mutex::new(ActivityTracker::new()),
            paused: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build the monitor with the stock components: a Plex stream source
    /// and adapters for every enabled client. No link probe, no metrics.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate();
        let stream_source = Arc::new(PlexStreamSource::new(
            &config.media_server.url,
            &config.media_server.token,
        )?);
        let registry = ClientRegistry::from_config(&config);
        Ok(Self::new(
            config,
            stream_source,
            registry,
            None,
            Arc::new(NullMetricsSink),
        ))
    }

    /// Attach a link probe (builder style, before `start`)
    pub fn with_link_probe(mut self, probe: LinkProbe) -> Self {
        self.link_probe = Some(probe);
        self
    }

    /// Attach a metrics sink (builder style, before `start`)
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Subscribe to monitor events.
    ///
    /// Multiple subscribers are supported; each receives every event
    /// independently.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The client registry (for connection testing from the embedder)
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Spawn the stream and download loops
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            tracing::warn!("polling monitor already started");
            return;
        }
        let stream = Arc::clone(self);
        let download = Arc::clone(self);
        tasks.push(tokio::spawn(stream.run_stream_loop()));
        tasks.push(tokio::spawn(download.run_download_loop()));
        tracing::info!("polling monitor started (stream + download loops)");
    }

    /// Stop the loops, cancel every hold, and best-effort restore every
    /// client's original limits (bounded to ~15 s total)
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.await.ok();
        }

        self.reservations.cancel_all().await;

        match tokio::time::timeout(SHUTDOWN_RESTORE_TIMEOUT, self.registry.restore_all()).await {
            Ok(results) => {
                let failed: Vec<&ClientId> =
                    results.iter().filter(|(_, ok)| !**ok).map(|(id, _)| id).collect();
                if !failed.is_empty() {
                    tracing::warn!(?failed, "some clients were not restored");
                }
            }
            Err(_) => {
                tracing::warn!("restore phase timed out, continuing shutdown");
            }
        }

        if let Some(probe) = &self.link_probe {
            probe.close().await;
        }
        tracing::info!("polling monitor stopped");
    }

    /// Stop pushing limits; polling and decision-making continue
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("actuation paused");
    }

    /// Resume pushing limits
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!("actuation resumed");
    }

    /// Whether actuation is currently paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Swap in a new configuration atomically.
    ///
    /// An in-flight tick finishes under the old snapshot; the next tick
    /// reads the new one. The client set itself is fixed at construction —
    /// changing clients means building a new monitor.
    pub async fn reload(&self, new_config: Config) {
        new_config.validate();
        *self.config.write().await = Arc::new(new_config);
        tracing::info!("configuration reloaded");
    }

    /// Set a temporary capacity override that expires on its own.
    ///
    /// At least one limit must be given and the duration must be non-zero.
    /// Replaces any previous override.
    pub async fn set_temporary_limits(
        &self,
        download_mbps: Option<f64>,
        upload_mbps: Option<f64>,
        duration: Duration,
        source: Option<String>,
        set_by: Option<String>,
    ) -> Result<()> {
        if download_mbps.is_none() && upload_mbps.is_none() {
            return Err(Error::Config {
                message: "temporary limits need at least one of download or upload".into(),
            });
        }
        if duration.is_zero() {
            return Err(Error::Config {
                message: "temporary limit duration must be positive".into(),
            });
        }

        let expires_at = Utc::now()
            + ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(0));
        {
            let mut guard = self.temp_limits.lock().await;
            *guard = Some(TemporaryLimits {
                download_mbps,
                upload_mbps,
                expires_at,
                source: source.clone(),
                set_by: set_by.clone(),
            });
        }

        tracing::info!(
            download_mbps,
            upload_mbps,
            duration_secs = duration.as_secs(),
            set_by = ?set_by,
            "temporary limits set"
        );
        self.emit(Event::TemporaryLimitsSet {
            download_mbps,
            upload_mbps,
            duration_secs: duration.as_secs(),
            set_by,
        });
        Ok(())
    }

    /// Drop the temporary override immediately
    pub async fn clear_temporary_limits(&self) {
        let was_set = self.temp_limits.lock().await.take().is_some();
        if was_set {
            tracing::info!("temporary limits cleared");
            self.emit(Event::TemporaryLimitsCleared);
        }
    }

    /// Current override state for external inspection
    pub async fn temporary_limits(&self) -> TemporaryLimitsView {
        let (active, record) = {
            let mut guard = self.temp_limits.lock().await;
            let expired = guard
                .as_ref()
                .map(|t| t.expires_at <= Utc::now())
                .unwrap_or(false);
            if expired {
                *guard = None;
            }
            (guard.is_some(), guard.clone())
        };

        match (active, record) {
            (true, Some(t)) => TemporaryLimitsView {
                active: true,
                download_mbps: t.download_mbps,
                upload_mbps: t.upload_mbps,
                remaining_secs: (t.expires_at - Utc::now()).num_seconds().max(0) as u64,
                source: t.source,
                set_by: t.set_by,
            },
            _ => TemporaryLimitsView::default(),
        }
    }

    /// Unexpired override values, clearing an expired record on the way
    pub(crate) async fn active_temp_limits(&self) -> (Option<f64>, Option<f64>) {
        let (expired, limits) = {
            let mut guard = self.temp_limits.lock().await;
            let expired = guard
                .as_ref()
                .map(|t| t.expires_at <= Utc::now())
                .unwrap_or(false);
            if expired {
                *guard = None;
            }
            (
                expired,
                guard
                    .as_ref()
                    .map(|t| (t.download_mbps, t.upload_mbps))
                    .unwrap_or((None, None)),
            )
        };

        if expired {
            tracing::info!("temporary limits expired, reverting to configured limits");
            self.emit(Event::TemporaryLimitsCleared);
        }
        limits
    }

    /// Views of all live reservations
    pub async fn list_reservations(&self) -> Vec<ReservationView> {
        self.reservations.snapshot().await
    }

    /// Cancel one reservation by id. `Err(NotFound)` when it does not exist.
    pub async fn clear_reservation(&self, id: &str) -> Result<()> {
        if self.reservations.cancel_by_id(id).await {
            Ok(())
        } else {
            Err(Error::NotFound(format!("reservation {id}")))
        }
    }

    /// Sum of all live holds in Mbps
    pub async fn reserved_total(&self) -> f64 {
        self.reservations.total().await
    }

    /// Aggregate state snapshot assembled from cached poll results; touches
    /// no network
    pub async fn current_status(&self) -> StatusSnapshot {
        let config = self.config.read().await.clone();
        let sessions = self.streams.lock().await.sessions.clone();
        let client_stats = self.clients_state.lock().await.last_stats.clone();
        let link_reading = self.probe_state.lock().await.last_reading;
        let reserved_upload_mbps = self.reservations.total().await;
        let (temp_dl, temp_ul) = self.active_temp_limits().await;
        let now = Local::now().time();

        let overhead = config.bandwidth.streams.overhead_percent;
        let total_stream_cost_mbps: f64 =
            allocator::countable_streams(&sessions, config.media_server.include_lan_streams)
                .iter()
                .map(|s| allocator::stream_cost(s.bitrate_mbps, s.quality_profile.as_deref(), overhead))
                .sum();

        StatusSnapshot {
            active_streams: sessions,
            total_stream_cost_mbps,
            reserved_upload_mbps,
            client_stats,
            effective_download_mbps: allocator::effective_download_capacity(&config, temp_dl, now),
            effective_upload_mbps: allocator::effective_upload_capacity(&config, temp_ul, now),
            link_reading,
            paused: self.is_paused(),
        }
    }

    /// Emit an event to all subscribers (dropped when nobody listens)
    pub(crate) fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

//! Metrics seam
//!
//! The core owns no persistence. Once per download tick it hands a
//! [`TickMetrics`] sample to the embedder's [`MetricsSink`]; storing,
//! aggregating, or charting it is the embedder's business.

use crate::types::{ClientId, ClientKind, LinkReading};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-client slice of one tick's metrics
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientTickMetrics {
    /// Client these numbers belong to
    pub client_id: ClientId,
    /// Daemon family
    pub kind: ClientKind,
    /// Observed download rate in Mbps (0 when the poll failed)
    pub download_mbps: f64,
    /// Observed upload rate in Mbps
    pub upload_mbps: f64,
    /// Limit observed on the daemon this tick in Mbps
    pub download_limit_mbps: f64,
    /// Upload limit observed on the daemon this tick in Mbps
    pub upload_limit_mbps: f64,
    /// Download limit the allocator decided on, when one was computed
    pub new_download_limit_mbps: Option<f64>,
    /// Upload limit the allocator decided on
    pub new_upload_limit_mbps: Option<f64>,
    /// False when this tick's stats poll failed
    pub reachable: bool,
}

/// One download tick's worth of observations and decisions
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TickMetrics {
    /// When the tick ran
    pub timestamp: DateTime<Utc>,
    /// Per-client observations and decisions
    pub clients: Vec<ClientTickMetrics>,
    /// Active stream count used for this tick
    pub stream_count: usize,
    /// Raw bitrate sum of counted streams in Mbps
    pub total_stream_bitrate_mbps: f64,
    /// Stream cost with overhead in Mbps
    pub total_stream_cost_mbps: f64,
    /// Sum of live holds in Mbps
    pub reserved_upload_mbps: f64,
    /// Link probe reading used this tick, when available
    pub link_reading: Option<LinkReading>,
    /// True when actuation was skipped because the monitor is paused
    pub paused: bool,
}

/// Receives one sample per download tick
pub trait MetricsSink: Send + Sync {
    /// Record a tick sample. Must not block; heavy work belongs on the
    /// embedder's side of the seam.
    fn record(&self, sample: &TickMetrics);
}

/// Sink that drops every sample
#[derive(Clone, Copy, Debug, Default)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record(&self, _sample: &TickMetrics) {}
}

/// Sink that logs a one-line summary per tick at debug level
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn record(&self, sample: &TickMetrics) {
        tracing::debug!(
            streams = sample.stream_count,
            stream_cost_mbps = sample.total_stream_cost_mbps,
            reserved_mbps = sample.reserved_upload_mbps,
            clients = sample.clients.len(),
            paused = sample.paused,
            "tick metrics"
        );
    }
}

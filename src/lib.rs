//! # bandarr
//!
//! Bandwidth arbitration library for home media infrastructure.
//!
//! bandarr watches a media server's active streaming sessions and a set of
//! download daemons (torrent and Usenet), then continuously computes and
//! pushes per-client speed limits so streams keep the upstream bandwidth
//! they need while downloaders consume what remains. It is a feedback
//! control loop, not a proxy: it touches no media bytes, only the speed
//! knobs the daemons already expose.
//!
//! ## Design Philosophy
//!
//! - **Library-first** - no CLI or UI, purely a Rust crate for embedding
//! - **Hold under uncertainty** - an unreachable media server or daemon
//!   never causes limits to fly open; the loop keeps the last known state
//! - **Event-driven** - consumers subscribe to events, no polling required
//! - **No persistence** - metrics and decisions flow out through seams the
//!   embedder owns
//!
//! ## Quick Start
//!
//! ```no_run
//! use bandarr::{Config, PollingMonitor};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config: Config = serde_json::from_str(r#"{
//!         "media_server": {"url": "http://192.168.1.100:32400", "token": "xxx"},
//!         "bandwidth": {
//!             "download": {"total_mbps": 900.0},
//!             "upload": {"total_mbps": 40.0}
//!         },
//!         "clients": [{
//!             "id": "qb-main", "kind": "qbittorrent", "name": "qBittorrent",
//!             "url": "http://192.168.1.50:8080",
//!             "username": "admin", "password": "secret",
//!             "supports_upload": true
//!         }]
//!     }"#)?;
//!
//!     let monitor = Arc::new(PollingMonitor::from_config(config)?);
//!
//!     // Subscribe to events
//!     let mut events = monitor.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     monitor.start().await;
//!     bandarr::run_with_shutdown(monitor).await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Pure allocation decisions
pub mod allocator;
/// Download client adapters
pub mod clients;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Router link rate measurement
pub mod link_probe;
/// Metrics seam
pub mod metrics;
/// Polling monitor and control surface
pub mod monitor;
/// Timed bandwidth holds
pub mod reservation;
/// Time-of-day alternate bandwidth windows
pub mod schedule;
/// Bounded per-session bandwidth cache
pub mod session_cache;
/// Active stream listing
pub mod stream_source;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use allocator::{ActivityTracker, AllocatorInput, ClientView, INACTIVE_BUFFER_POLLS};
pub use clients::{ClientAdapter, ClientRegistry};
pub use config::Config;
pub use error::{Error, Result};
pub use link_probe::{CounterSource, LinkProbe};
pub use metrics::{MetricsSink, NullMetricsSink, TickMetrics};
pub use monitor::PollingMonitor;
pub use reservation::ReservationTable;
pub use schedule::ScheduleConfig;
pub use stream_source::{PlexStreamSource, StreamSource};
pub use types::{
    ClientId, ClientKind, ClientStats, Decision, Event, Limits, MediaKind, PlaybackState,
    ReservationView, StatusSnapshot, StreamSession, TemporaryLimitsView,
};

use std::sync::Arc;

/// Run the monitor until a termination signal arrives, then shut it down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(monitor: Arc<PollingMonitor>) {
    wait_for_signal().await;
    monitor.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}

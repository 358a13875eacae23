//! Timed bandwidth holds for departed streams
//!
//! When a stream ends its upload bandwidth is not released immediately:
//! a reservation keyed by (user, player) keeps the capacity subtracted for a
//! grace period so an episode-boundary hand-off does not briefly hand the
//! bandwidth to downloaders and snatch it back when autoplay starts.
//!
//! Every reservation owns its own expiry task. Expiry, cancel-by-match, and
//! cancel-by-id all converge on remove-by-id under the table mutex, so a
//! reservation can never be dropped twice or leak a timer.

use crate::types::{Event, MediaKind, ReservationView};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct Reservation {
    id: String,
    bandwidth_mbps: f64,
    user_id: String,
    user_name: String,
    player_id: String,
    media_title: String,
    media_kind: MediaKind,
    created_at: DateTime<Utc>,
    duration: Duration,
    expires_at: DateTime<Utc>,
    timer: JoinHandle<()>,
}

impl Reservation {
    fn view(&self) -> ReservationView {
        ReservationView {
            id: self.id.clone(),
            bandwidth_mbps: self.bandwidth_mbps,
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            player_id: self.player_id.clone(),
            media_title: self.media_title.clone(),
            media_kind: self.media_kind,
            created_at: self.created_at,
            duration_secs: self.duration.as_secs(),
            expires_at: self.expires_at,
        }
    }
}

/// Parameters for creating one bandwidth hold
#[derive(Clone, Debug)]
pub struct HoldRequest {
    /// Bandwidth to hold in Mbps
    pub bandwidth_mbps: f64,
    /// Hold duration
    pub duration: Duration,
    /// Viewer whose stream ended
    pub user_id: String,
    /// Display name of that viewer
    pub user_name: String,
    /// Playback device the stream ended on
    pub player_id: String,
    /// Title of the media that ended
    pub media_title: String,
    /// Kind of media that ended
    pub media_kind: MediaKind,
}

/// Set of independent timed holds on upload capacity
///
/// Cloneable; clones share the same underlying table.
#[derive(Clone)]
pub struct ReservationTable {
    inner: Arc<Mutex<Vec<Reservation>>>,
    event_tx: tokio::sync::broadcast::Sender<Event>,
}

impl ReservationTable {
    /// Create an empty table emitting lifecycle events on `event_tx`
    pub fn new(event_tx: tokio::sync::broadcast::Sender<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            event_tx,
        }
    }

    /// Create a hold and spawn its expiry timer. Returns the reservation id.
    ///
    /// A zero duration is a no-op (no hold, returns None).
    pub async fn create(&self, request: HoldRequest) -> Option<String> {
        if request.duration.is_zero() {
            tracing::debug!("hold duration is zero, skipping reservation");
            return None;
        }

        let created_at = Utc::now();
        let nanos = created_at.timestamp_nanos_opt().unwrap_or_default();
        let id = format!("{}:{}:{}", request.user_id, request.player_id, nanos);
        let expires_at = created_at
            + ChronoDuration::from_std(request.duration)
                .unwrap_or_else(|_| ChronoDuration::seconds(0));

        let timer = {
            let table = self.clone();
            let id = id.clone();
            let duration = request.duration;
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                table.expire(&id).await;
            })
        };

        let reservation = Reservation {
            id: id.clone(),
            bandwidth_mbps: request.bandwidth_mbps,
            user_id: request.user_id.clone(),
            user_name: request.user_name,
            player_id: request.player_id.clone(),
            media_title: request.media_title,
            media_kind: request.media_kind,
            created_at,
            duration: request.duration,
            expires_at,
            timer,
        };

        self.inner.lock().await.push(reservation);

        tracing::info!(
            bandwidth_mbps = request.bandwidth_mbps,
            duration_secs = request.duration.as_secs(),
            user_id = %request.user_id,
            player_id = %request.player_id,
            "bandwidth hold created"
        );
        self.event_tx
            .send(Event::ReservationCreated {
                id: id.clone(),
                bandwidth_mbps: request.bandwidth_mbps,
                user_id: request.user_id,
                player_id: request.player_id,
                duration_secs: request.duration.as_secs(),
            })
            .ok();

        Some(id)
    }

    /// Cancel every hold matching (user, player) exactly. Returns the total
    /// bandwidth released. Different users or different players never match.
    pub async fn cancel_matching(&self, user_id: &str, player_id: &str) -> f64 {
        if user_id.is_empty() || player_id.is_empty() {
            return 0.0;
        }

        let mut freed = 0.0;
        {
            let mut reservations = self.inner.lock().await;
            reservations.retain(|r| {
                if r.user_id == user_id && r.player_id == player_id {
                    r.timer.abort();
                    freed += r.bandwidth_mbps;
                    false
                } else {
                    true
                }
            });
        }

        if freed > 0.0 {
            tracing::info!(
                user_id,
                player_id,
                freed_mbps = freed,
                "viewer resumed on same player, holds cancelled"
            );
            self.event_tx
                .send(Event::ReservationCancelled {
                    user_id: user_id.to_string(),
                    player_id: player_id.to_string(),
                    freed_mbps: freed,
                })
                .ok();
        }
        freed
    }

    /// Cancel one hold by id. Returns false when no such hold exists.
    pub async fn cancel_by_id(&self, id: &str) -> bool {
        let removed = {
            let mut reservations = self.inner.lock().await;
            let before = reservations.len();
            reservations.retain(|r| {
                if r.id == id {
                    r.timer.abort();
                    false
                } else {
                    true
                }
            });
            reservations.len() < before
        };

        if removed {
            tracing::info!(reservation_id = id, "hold cleared by request");
        } else {
            tracing::warn!(reservation_id = id, "hold not found");
        }
        removed
    }

    /// Sum of all live holds in Mbps
    pub async fn total(&self) -> f64 {
        self.inner.lock().await.iter().map(|r| r.bandwidth_mbps).sum()
    }

    /// Number of live holds
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// True when no holds are live
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Read-only views of all live holds
    pub async fn snapshot(&self) -> Vec<ReservationView> {
        self.inner.lock().await.iter().map(Reservation::view).collect()
    }

    /// Cancel every hold and its timer (shutdown path)
    pub async fn cancel_all(&self) {
        let mut reservations = self.inner.lock().await;
        for reservation in reservations.iter() {
            reservation.timer.abort();
        }
        let count = reservations.len();
        reservations.clear();
        if count > 0 {
            tracing::debug!(count, "all holds cancelled");
        }
    }

    /// Timer callback: remove one hold at its deadline
    async fn expire(&self, id: &str) {
        let expired = {
            let mut reservations = self.inner.lock().await;
            let index = reservations.iter().position(|r| r.id == id);
            index.map(|i| reservations.remove(i))
        };

        match expired {
            Some(reservation) => {
                tracing::info!(
                    reservation_id = id,
                    bandwidth_mbps = reservation.bandwidth_mbps,
                    user_id = %reservation.user_id,
                    "hold expired, bandwidth released"
                );
                self.event_tx
                    .send(Event::ReservationExpired {
                        id: reservation.id,
                        bandwidth_mbps: reservation.bandwidth_mbps,
                    })
                    .ok();
            }
            None => {
                tracing::debug!(reservation_id = id, "hold already cancelled before expiry");
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ReservationTable {
        let (tx, _rx) = tokio::sync::broadcast::channel(64);
        ReservationTable::new(tx)
    }

    fn hold(user: &str, player: &str, mbps: f64, duration: Duration) -> HoldRequest {
        HoldRequest {
            bandwidth_mbps: mbps,
            duration,
            user_id: user.into(),
            user_name: user.into(),
            player_id: player.into(),
            media_title: "Some Show".into(),
            media_kind: MediaKind::Episode,
        }
    }

    #[tokio::test]
    async fn test_create_and_total() {
        let table = table();
        table
            .create(hold("alice", "roku-living", 60.0, Duration::from_secs(600)))
            .await
            .unwrap();
        table
            .create(hold("bob", "appletv", 25.0, Duration::from_secs(600)))
            .await
            .unwrap();

        assert_eq!(table.total().await, 85.0);
        assert_eq!(table.len().await, 2);
    }

    #[tokio::test]
    async fn test_zero_duration_is_noop() {
        let table = table();
        assert!(table
            .create(hold("alice", "roku", 60.0, Duration::ZERO))
            .await
            .is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_matching_same_user_same_player() {
        let table = table();
        table
            .create(hold("alice", "roku-living", 60.0, Duration::from_secs(600)))
            .await
            .unwrap();

        let freed = table.cancel_matching("alice", "roku-living").await;
        assert_eq!(freed, 60.0);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_matching_requires_both_to_match() {
        let table = table();
        table
            .create(hold("alice", "roku-living", 60.0, Duration::from_secs(600)))
            .await
            .unwrap();

        // Same player, different user
        assert_eq!(table.cancel_matching("bob", "roku-living").await, 0.0);
        // Same user, different player
        assert_eq!(table.cancel_matching("alice", "appletv").await, 0.0);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_matching_sums_multiple_holds() {
        let table = table();
        table
            .create(hold("alice", "roku", 60.0, Duration::from_secs(600)))
            .await
            .unwrap();
        table
            .create(hold("alice", "roku", 50.0, Duration::from_secs(1800)))
            .await
            .unwrap();
        table
            .create(hold("bob", "shield", 10.0, Duration::from_secs(600)))
            .await
            .unwrap();

        let freed = table.cancel_matching("alice", "roku").await;
        assert_eq!(freed, 110.0);
        assert_eq!(table.total().await, 10.0);
    }

    #[tokio::test]
    async fn test_cancel_by_id() {
        let table = table();
        let id = table
            .create(hold("alice", "roku", 60.0, Duration::from_secs(600)))
            .await
            .unwrap();

        assert!(table.cancel_by_id(&id).await);
        assert!(!table.cancel_by_id(&id).await);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_expiry_removes_only_its_own_hold() {
        let table = table();
        table
            .create(hold("alice", "roku", 60.0, Duration::from_millis(50)))
            .await
            .unwrap();
        table
            .create(hold("bob", "shield", 25.0, Duration::from_secs(600)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        // Alice's hold expired on its own; Bob's is untouched
        assert_eq!(table.len().await, 1);
        assert_eq!(table.total().await, 25.0);
    }

    #[tokio::test]
    async fn test_expiry_emits_event() {
        let (tx, mut rx) = tokio::sync::broadcast::channel(64);
        let table = ReservationTable::new(tx);
        table
            .create(hold("alice", "roku", 60.0, Duration::from_millis(50)))
            .await
            .unwrap();

        // Skip the created event, then expect expiry
        let created = rx.recv().await.unwrap();
        assert!(matches!(created, Event::ReservationCreated { .. }));

        let expired = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match expired {
            Event::ReservationExpired { bandwidth_mbps, .. } => {
                assert_eq!(bandwidth_mbps, 60.0);
            }
            other => panic!("expected expiry event, got {other:?}"),
        }
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancelled_hold_does_not_expire_later() {
        let table = table();
        table
            .create(hold("alice", "roku", 60.0, Duration::from_millis(80)))
            .await
            .unwrap();
        let freed = table.cancel_matching("alice", "roku").await;
        assert_eq!(freed, 60.0);

        // Wait past the original deadline: the aborted timer must not panic
        // or double-remove anything
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_snapshot_views() {
        let table = table();
        table
            .create(hold("alice", "roku", 60.0, Duration::from_secs(600)))
            .await
            .unwrap();

        let views = table.snapshot().await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].bandwidth_mbps, 60.0);
        assert_eq!(views[0].user_id, "alice");
        assert_eq!(views[0].duration_secs, 600);
        assert!(views[0].expires_at > views[0].created_at);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let table = table();
        for i in 0..5 {
            table
                .create(hold(&format!("user{i}"), "player", 10.0, Duration::from_secs(600)))
                .await
                .unwrap();
        }
        table.cancel_all().await;
        assert!(table.is_empty().await);
        assert_eq!(table.total().await, 0.0);
    }
}

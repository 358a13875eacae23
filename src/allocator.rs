//! Pure allocation decisions
//!
//! [`decide`] turns one poll's worth of observations (streams, client
//! speeds, reservations, overrides) into per-client download and upload
//! limits. It performs no I/O and never suspends; the only state it carries
//! between polls is the [`ActivityTracker`] hysteresis counters.
//!
//! Allocation shape, per side:
//! - nobody active: equal standby split so any client can wake up fast
//! - one active client: it gets the pool minus a safety net per idle peer
//! - several active: idle peers get the safety net, the active pool is split
//!   by configured per-type percentages (equal split unless every active
//!   client has one)

use crate::config::Config;
use crate::types::{ClientId, ClientKind, Decision, StreamSession};
use chrono::NaiveTime;
use std::collections::{HashMap, HashSet};

/// Consecutive below-threshold polls before a client stops counting as
/// active. At the 5 s floor this is ~30 s of hysteresis, enough to ride out
/// an idle tick mid-transfer.
pub const INACTIVE_BUFFER_POLLS: u32 = 6;

/// A client's observed speed must exceed this fraction of its standby share
/// to count as actively transferring
const ACTIVE_THRESHOLD_FRACTION: f64 = 0.10;

/// Per-client fraction of upload total handed out in emergency mode
const EMERGENCY_UPLOAD_FRACTION: f64 = 0.01;

/// What the allocator needs to know about one client this poll
#[derive(Clone, Debug)]
pub struct ClientView {
    /// Stable client identifier
    pub id: ClientId,
    /// Daemon family (keys the percent maps)
    pub kind: ClientKind,
    /// Whether the client manages upload bandwidth
    pub supports_upload: bool,
    /// Observed download rate in Mbps (0 when the poll failed)
    pub download_mbps: f64,
    /// Observed upload rate in Mbps
    pub upload_mbps: f64,
}

/// Everything [`decide`] consumes for one poll
#[derive(Clone, Debug)]
pub struct AllocatorInput<'a> {
    /// Enabled clients with their observed speeds
    pub clients: &'a [ClientView],
    /// Active stream sessions from the last successful stream poll
    pub streams: &'a [StreamSession],
    /// Sum of live upload holds in Mbps
    pub reserved_upload_mbps: f64,
    /// Download-side bandwidth held by reservations in Mbps
    pub reserved_download_mbps: f64,
    /// Temporary download capacity override, if one is active
    pub temp_download_mbps: Option<f64>,
    /// Temporary upload capacity override, if one is active
    pub temp_upload_mbps: Option<f64>,
    /// Observed inbound rate on the WAN link, when the probe is healthy
    pub link_inbound_mbps: Option<f64>,
    /// Current local wall-clock time (for schedule windows)
    pub now: NaiveTime,
}

/// Hysteresis counters for activity classification
///
/// One counter per client per direction. A counter resets to 0 whenever the
/// client's speed exceeds the threshold and increments otherwise; the client
/// counts as effectively active while its counter is below
/// [`INACTIVE_BUFFER_POLLS`].
#[derive(Clone, Debug, Default)]
pub struct ActivityTracker {
    download_streaks: HashMap<ClientId, u32>,
    upload_streaks: HashMap<ClientId, u32>,
}

impl ActivityTracker {
    /// Create a tracker with no history (all clients start "active")
    pub fn new() -> Self {
        Self::default()
    }

    /// Current download inactive streak for a client (0 if never seen)
    pub fn download_streak(&self, id: &ClientId) -> u32 {
        self.download_streaks.get(id).copied().unwrap_or(0)
    }

    /// Current upload inactive streak for a client (0 if never seen)
    pub fn upload_streak(&self, id: &ClientId) -> u32 {
        self.upload_streaks.get(id).copied().unwrap_or(0)
    }

    fn classify_download(&mut self, id: &ClientId, speed_mbps: f64, threshold: f64) -> bool {
        Self::classify(&mut self.download_streaks, id, speed_mbps, threshold)
    }

    fn classify_upload(&mut self, id: &ClientId, speed_mbps: f64, threshold: f64) -> bool {
        Self::classify(&mut self.upload_streaks, id, speed_mbps, threshold)
    }

    fn classify(
        streaks: &mut HashMap<ClientId, u32>,
        id: &ClientId,
        speed_mbps: f64,
        threshold: f64,
    ) -> bool {
        if speed_mbps > threshold {
            streaks.insert(id.clone(), 0);
            true
        } else {
            let streak = streaks.entry(id.clone()).or_insert(0);
            *streak += 1;
            let still_active = *streak < INACTIVE_BUFFER_POLLS;
            if still_active {
                tracing::debug!(
                    client = %id,
                    speed_mbps,
                    threshold,
                    streak = *streak,
                    buffer = INACTIVE_BUFFER_POLLS,
                    "below threshold but inside inactive buffer"
                );
            }
            still_active
        }
    }
}

/// Bandwidth cost of one stream in Mbps, overhead included.
///
/// Uses the encoded bitrate when known; otherwise estimates from the quality
/// label (4K 40, 1080p 12, 720p 6, else 4). Overhead is clamped to 0..=300%.
pub fn stream_cost(bitrate_mbps: f64, quality_profile: Option<&str>, overhead_percent: u32) -> f64 {
    let overhead = overhead_percent.min(300) as f64;

    let base = if bitrate_mbps > 0.0 {
        bitrate_mbps
    } else {
        let quality = quality_profile.unwrap_or("").to_lowercase();
        if quality.contains("4k") || quality.contains("2160") {
            40.0
        } else if quality.contains("1080") || quality.contains("hd") {
            12.0
        } else if quality.contains("720") {
            6.0
        } else {
            4.0
        }
    };

    (base * (1.0 + overhead / 100.0)).max(0.0)
}

/// Streams that count against bandwidth: everything, or WAN-only when LAN
/// streams are excluded
pub fn countable_streams<'a>(
    streams: &'a [StreamSession],
    include_lan: bool,
) -> Vec<&'a StreamSession> {
    streams
        .iter()
        .filter(|s| include_lan || !s.is_lan)
        .collect()
}

/// Download capacity currently in effect: temporary override, then schedule
/// alternate (when its window is active and its total is set), then the
/// configured total
pub fn effective_download_capacity(config: &Config, temp: Option<f64>, now: NaiveTime) -> f64 {
    if let Some(limit) = temp {
        return limit;
    }
    let scheduled = &config.bandwidth.download.scheduled;
    if scheduled.is_active(now) && scheduled.total_mbps > 0.0 {
        scheduled.total_mbps
    } else {
        config.bandwidth.download.total_mbps
    }
}

/// Upload capacity currently in effect (same precedence as download)
pub fn effective_upload_capacity(config: &Config, temp: Option<f64>, now: NaiveTime) -> f64 {
    if let Some(limit) = temp {
        return limit;
    }
    let scheduled = &config.bandwidth.upload.scheduled;
    if scheduled.is_active(now) && scheduled.total_mbps > 0.0 {
        scheduled.total_mbps
    } else {
        config.bandwidth.upload.total_mbps
    }
}

/// Compute limit decisions for every client.
///
/// Pure except for the hysteresis counters in `tracker`, which advance by
/// one poll. Returns an empty map when no clients are configured.
pub fn decide(
    config: &Config,
    tracker: &mut ActivityTracker,
    input: &AllocatorInput<'_>,
) -> HashMap<ClientId, Decision> {
    let mut decisions = HashMap::new();
    if input.clients.is_empty() {
        tracing::debug!("no download clients configured");
        return decisions;
    }

    let download_total = effective_download_capacity(config, input.temp_download_mbps, input.now);
    let upload_total = effective_upload_capacity(config, input.temp_upload_mbps, input.now);

    // Stream accounting on the LAN-filtered subset
    let counted = countable_streams(input.streams, config.media_server.include_lan_streams);
    let excluded = input.streams.len() - counted.len();
    if excluded > 0 {
        tracing::debug!(excluded, "LAN streams excluded from bandwidth accounting");
    }
    let overhead = config.bandwidth.streams.overhead_percent;
    let raw_bitrate: f64 = counted.iter().map(|s| s.bitrate_mbps).sum();
    let total_stream_cost: f64 = counted
        .iter()
        .map(|s| stream_cost(s.bitrate_mbps, s.quality_profile.as_deref(), overhead))
        .sum();

    // Download side: hold back the ACK/control reserve plus any held
    // download reservations, then whatever other household devices are
    // already pulling through the link
    let reserve_percent = config.bandwidth.streams.download_reserve_percent as f64;
    let download_reserve =
        total_stream_cost * (reserve_percent / 100.0) + input.reserved_download_mbps;
    let mut available_download = (download_total - download_reserve).max(0.0);
    if let Some(inbound) = input.link_inbound_mbps {
        available_download = (available_download - inbound).max(0.0);
    }

    // Upload side: streams come off the top, then the holds
    let available_upload = (upload_total - total_stream_cost - input.reserved_upload_mbps).max(0.0);
    let emergency = total_stream_cost > upload_total;
    if emergency {
        tracing::warn!(
            stream_cost_mbps = total_stream_cost,
            upload_total_mbps = upload_total,
            "stream cost exceeds upload capacity; upload clients limited to 1% each"
        );
    }

    let client_count = input.clients.len();
    let members: Vec<(ClientId, ClientKind)> = input
        .clients
        .iter()
        .map(|c| (c.id.clone(), c.kind))
        .collect();

    // Download classification against 10% of the standby share
    let download_threshold = available_download / client_count as f64 * ACTIVE_THRESHOLD_FRACTION;
    let mut download_active: HashSet<ClientId> = HashSet::new();
    for client in input.clients {
        if tracker.classify_download(&client.id, client.download_mbps, download_threshold) {
            download_active.insert(client.id.clone());
        }
    }

    let download_percents = select_percents(
        &config.bandwidth.download.client_percents,
        &config.bandwidth.download.scheduled,
        input.now,
    );
    let safety_net = config.bandwidth.download.inactive_safety_net_percent as f64 / 100.0;

    let download_allocations = if download_active.is_empty() {
        // Standby: equal split so any client can ramp immediately
        equal_split(available_download, &members)
    } else {
        allocate_active(
            available_download,
            &members,
            &download_active,
            download_percents,
            safety_net,
        )
    };

    // Upload allocation over the upload-capable subset
    let upload_members: Vec<(ClientId, ClientKind)> = input
        .clients
        .iter()
        .filter(|c| c.supports_upload)
        .map(|c| (c.id.clone(), c.kind))
        .collect();

    let mut upload_allocations: HashMap<ClientId, f64> = HashMap::new();
    if !upload_members.is_empty() {
        if emergency {
            for (id, _) in &upload_members {
                upload_allocations.insert(id.clone(), upload_total * EMERGENCY_UPLOAD_FRACTION);
            }
        } else {
            let upload_threshold = available_upload / upload_members.len() as f64
                * ACTIVE_THRESHOLD_FRACTION;
            let mut upload_active: HashSet<ClientId> = HashSet::new();
            for client in input.clients.iter().filter(|c| c.supports_upload) {
                if tracker.classify_upload(&client.id, client.upload_mbps, upload_threshold) {
                    upload_active.insert(client.id.clone());
                }
            }

            if upload_active.is_empty() {
                // Standby divides by the full client count: upload capacity
                // an idle seeder is not using stays as link headroom
                let share = available_upload / client_count as f64;
                for (id, _) in &upload_members {
                    upload_allocations.insert(id.clone(), share);
                }
            } else {
                let upload_percents = select_percents(
                    &config.bandwidth.upload.client_percents,
                    &config.bandwidth.upload.scheduled,
                    input.now,
                );
                upload_allocations = allocate_active(
                    available_upload,
                    &upload_members,
                    &upload_active,
                    upload_percents,
                    safety_net,
                );
            }
        }
    }

    let reason = build_reason(
        input.streams.len(),
        raw_bitrate,
        total_stream_cost,
        input.reserved_upload_mbps,
    );

    for client in input.clients {
        let download = download_allocations.get(&client.id).copied().unwrap_or(0.0);
        let upload = if client.supports_upload {
            upload_allocations.get(&client.id).copied().unwrap_or(0.0)
        } else {
            0.0
        };
        decisions.insert(
            client.id.clone(),
            Decision {
                download_limit_mbps: round2(download),
                upload_limit_mbps: round2(upload),
                reason: reason.clone(),
            },
        );
    }

    decisions
}

/// Percent map in effect: the schedule's alternates while its window is
/// active and non-empty, otherwise the configured map
fn select_percents<'a>(
    configured: &'a HashMap<String, u32>,
    scheduled: &'a crate::schedule::ScheduleConfig,
    now: NaiveTime,
) -> &'a HashMap<String, u32> {
    if scheduled.is_active(now) && !scheduled.client_percents.is_empty() {
        &scheduled.client_percents
    } else {
        configured
    }
}

fn equal_split(available: f64, members: &[(ClientId, ClientKind)]) -> HashMap<ClientId, f64> {
    let share = available / members.len() as f64;
    members.iter().map(|(id, _)| (id.clone(), share)).collect()
}

/// Split `available` across `members` given the set of active clients:
/// each inactive member gets the safety-net fraction, the rest goes to the
/// active members weighted by their configured per-type percentages
/// (equal split unless every active member has one).
fn allocate_active(
    available: f64,
    members: &[(ClientId, ClientKind)],
    active: &HashSet<ClientId>,
    percents: &HashMap<String, u32>,
    safety_net: f64,
) -> HashMap<ClientId, f64> {
    let mut allocations = HashMap::new();

    let active_members: Vec<&(ClientId, ClientKind)> =
        members.iter().filter(|(id, _)| active.contains(id)).collect();
    let inactive_members: Vec<&(ClientId, ClientKind)> =
        members.iter().filter(|(id, _)| !active.contains(id)).collect();

    let pool = 1.0 - safety_net * inactive_members.len() as f64;
    for (id, _) in &inactive_members {
        allocations.insert(id.clone(), available * safety_net);
    }

    // Mixing configured and defaulted weights would skew the split, so the
    // percentages only apply when every active member has one
    let all_configured = active_members
        .iter()
        .all(|(_, kind)| percents.contains_key(kind.as_str()));

    let weights: Vec<f64> = if all_configured {
        let raw: Vec<f64> = active_members
            .iter()
            .map(|(_, kind)| percents.get(kind.as_str()).copied().unwrap_or(0) as f64)
            .collect();
        let total: f64 = raw.iter().sum();
        if total == 0.0 {
            vec![1.0 / active_members.len() as f64; active_members.len()]
        } else {
            raw.iter().map(|w| w / total).collect()
        }
    } else {
        vec![1.0 / active_members.len() as f64; active_members.len()]
    };

    for ((id, _), weight) in active_members.iter().zip(weights) {
        allocations.insert(id.clone(), available * pool * weight);
    }

    allocations
}

fn build_reason(
    stream_count: usize,
    raw_bitrate: f64,
    cost_with_overhead: f64,
    holding_mbps: f64,
) -> String {
    let mut reason = if stream_count > 0 {
        format!(
            "Active streams: {stream_count}, Raw: {raw_bitrate:.1} Mbps, \
             With overhead: {cost_with_overhead:.1} Mbps, Reserved: {cost_with_overhead:.1} Mbps"
        )
    } else {
        "No active streams".to_string()
    };
    if holding_mbps > 0.0 {
        reason.push_str(&format!(", Holding: {holding_mbps:.1} Mbps"));
    }
    reason
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

//! Router link rate measurement
//!
//! The probe measures the current in/out rate on one router interface from
//! two reads of its octet counters, a fixed window apart. It keeps no state
//! between calls: every sample is self-contained, so a rejected reading
//! costs nothing but that sample.
//!
//! The counter transport (typically SNMP v2c against the router) sits
//! behind [`CounterSource`]; the probe owns the measurement protocol, the
//! wrap-around folding, the sanity gate, and interface discovery scoring.

use crate::error::Result;
use crate::types::LinkReading;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Highest rate the probe will believe. Anything above this is a counter
/// anomaly (wrap mid-sample, counter-width switch) and the sample is
/// discarded.
const MAX_REASONABLE_MBPS: f64 = 10_000.0;

/// Width of the octet counters a device exposes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterWidth {
    /// 32-bit counters (wrap at 2^32)
    Bits32,
    /// 64-bit counters (wrap at 2^64)
    Bits64,
}

impl CounterWidth {
    fn fold_delta(&self, earlier: u64, later: u64) -> u64 {
        match self {
            // Fold a single wrap; a double wrap inside one window silently
            // under-reports, which the sanity gate cannot distinguish from
            // a quiet link
            CounterWidth::Bits64 => later.wrapping_sub(earlier),
            CounterWidth::Bits32 => {
                let earlier = earlier & 0xFFFF_FFFF;
                let later = later & 0xFFFF_FFFF;
                later.wrapping_sub(earlier) & 0xFFFF_FFFF
            }
        }
    }
}

/// One bundled read of an interface's in/out octet counters
///
/// Both values must come from the same device-side snapshot — transports
/// must fetch them in a single request.
#[derive(Clone, Copy, Debug)]
pub struct CounterReading {
    /// Octets received on the interface since counter start
    pub in_octets: u64,
    /// Octets transmitted on the interface since counter start
    pub out_octets: u64,
    /// Width of the counters this reading came from
    pub width: CounterWidth,
}

/// A discovered router interface
#[derive(Clone, Debug)]
pub struct InterfaceInfo {
    /// Counter table index
    pub index: u32,
    /// Interface name (e.g. "eth4")
    pub name: String,
    /// Optional description string from the device
    pub description: Option<String>,
    /// Whether the interface is operationally up
    pub is_up: bool,
    /// Lifetime inbound octets (used for WAN scoring)
    pub in_octets: u64,
}

/// Transport that reads interface counters off a router
///
/// Implementations typically speak SNMP v2c; tests script the readings.
#[async_trait]
pub trait CounterSource: Send + Sync {
    /// Read both octet counters for one interface in a single request
    async fn read_octets(&self, interface_index: u32) -> Result<CounterReading>;

    /// Enumerate the device's interfaces
    async fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>>;

    /// Release any persistent transport handle
    async fn close(&self);
}

/// Two-sample rate probe over a [`CounterSource`]
#[derive(Clone)]
pub struct LinkProbe {
    source: Arc<dyn CounterSource>,
    interface_index: u32,
    window: Duration,
}

impl LinkProbe {
    /// Create a probe for one interface with the given measurement window.
    ///
    /// The window must outlast the device's counter cache (most routers
    /// refresh every few seconds); 5 s is a good default.
    pub fn new(source: Arc<dyn CounterSource>, interface_index: u32, window: Duration) -> Self {
        Self {
            source,
            interface_index,
            window,
        }
    }

    /// Measure the interface's current in/out rates.
    ///
    /// Returns `Ok(None)` when the sample had to be discarded (window too
    /// short, counter width changed mid-sample, or rate outside the sanity
    /// gate); transport failures are `Err`.
    pub async fn sample_rate(&self) -> Result<Option<LinkReading>> {
        let baseline = self.source.read_octets(self.interface_index).await?;
        let started = Instant::now();
        tokio::time::sleep(self.window).await;
        let current = self.source.read_octets(self.interface_index).await?;
        let elapsed = started.elapsed().as_secs_f64();

        if elapsed < 0.1 {
            tracing::warn!("probe window too short, discarding sample");
            return Ok(None);
        }
        if baseline.width != current.width {
            tracing::warn!("counter width changed mid-sample, discarding sample");
            return Ok(None);
        }

        let in_delta = current.width.fold_delta(baseline.in_octets, current.in_octets);
        let out_delta = current
            .width
            .fold_delta(baseline.out_octets, current.out_octets);

        let inbound_mbps = in_delta as f64 / elapsed * 8.0 / 1_000_000.0;
        let outbound_mbps = out_delta as f64 / elapsed * 8.0 / 1_000_000.0;

        if inbound_mbps > MAX_REASONABLE_MBPS || outbound_mbps > MAX_REASONABLE_MBPS {
            tracing::warn!(
                inbound_mbps,
                outbound_mbps,
                in_delta,
                out_delta,
                elapsed,
                "rejecting unreasonable link rates, discarding sample"
            );
            return Ok(None);
        }

        Ok(Some(LinkReading {
            inbound_mbps,
            outbound_mbps,
            sampled_at: Utc::now(),
        }))
    }

    /// Discover measurable interfaces, skipping VLAN sub-interfaces,
    /// bridges, loopbacks, tunnels, and bonds
    pub async fn discover_interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        let interfaces = self.source.list_interfaces().await?;
        Ok(interfaces
            .into_iter()
            .filter(|iface| !should_skip_interface(&iface.name))
            .collect())
    }

    /// Close the underlying transport
    pub async fn close(&self) {
        self.source.close().await;
    }
}

/// Interfaces that can never be the WAN link: VLAN sub-interfaces (a dot in
/// the name) and virtual types by keyword
pub fn should_skip_interface(name: &str) -> bool {
    if name.contains('.') {
        return true;
    }
    let name_lower = name.to_lowercase();
    ["switch", "br", "lo", "dummy", "miireg", "bond", "tun", "ifb"]
        .iter()
        .any(|keyword| name_lower.contains(keyword))
}

/// Suggest the most likely WAN interface.
///
/// Weighted score: inbound-octet dominance (the WAN port downloads the
/// internet), WAN-ish name keywords, common WAN port names, minus LAN and
/// virtual-interface keywords. When nothing scores positive, the interface
/// with the most inbound traffic wins.
pub fn suggest_wan_interface(interfaces: &[InterfaceInfo]) -> Option<&InterfaceInfo> {
    let up: Vec<&InterfaceInfo> = interfaces.iter().filter(|i| i.is_up).collect();
    if up.is_empty() {
        return None;
    }

    let max_in = up.iter().map(|i| i.in_octets).max().unwrap_or(0);

    let mut scored: Vec<(i32, &InterfaceInfo)> = up
        .iter()
        .map(|iface| {
            let mut score = 0i32;
            let name = iface.name.to_lowercase();
            let desc = iface
                .description
                .as_deref()
                .unwrap_or("")
                .to_lowercase();

            if max_in > 0 && iface.in_octets > 0 {
                let ratio = iface.in_octets as f64 / max_in as f64;
                if ratio > 0.8 {
                    score += 50;
                } else if ratio > 0.5 {
                    score += 30;
                } else if ratio > 0.1 {
                    score += 10;
                }
            }

            for keyword in ["wan", "internet", "pppoe", "external", "uplink"] {
                if name.contains(keyword) || desc.contains(keyword) {
                    score += 25;
                }
            }

            // Common dedicated WAN ports on prosumer gateways
            if name == "eth4" || name == "eth8" {
                score += 20;
            }
            if name.starts_with("eth") && !name.contains('.') {
                score += 5;
            }
            if name.starts_with("igb") || name.starts_with("em") {
                score += 5;
            }

            for keyword in [
                "loopback", "lo", "local", "management", "lan", "switch", "vlan", "bridge", "br",
                "dummy",
            ] {
                if name.contains(keyword) || desc.contains(keyword) {
                    score -= 30;
                }
            }
            if iface.name.contains('.') {
                score -= 15;
            }

            tracing::debug!(name = %iface.name, index = iface.index, score, "WAN scoring");
            (score, *iface)
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0));

    match scored.first() {
        Some((score, iface)) if *score > 0 => {
            tracing::info!(name = %iface.name, index = iface.index, score, "suggested WAN interface");
            Some(iface)
        }
        _ => {
            let by_traffic = *up.iter().max_by_key(|i| i.in_octets)?;
            tracing::info!(
                name = %by_traffic.name,
                "no clear WAN match, suggesting highest inbound traffic"
            );
            Some(by_traffic)
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;

    /// Counter source that replays a scripted sequence of readings
    struct ScriptedCounters {
        readings: Mutex<Vec<Result<CounterReading>>>,
    }

    impl ScriptedCounters {
        fn new(readings: Vec<Result<CounterReading>>) -> Arc<Self> {
            Arc::new(Self {
                readings: Mutex::new(readings),
            })
        }
    }

    #[async_trait]
    impl CounterSource for ScriptedCounters {
        async fn read_octets(&self, _interface_index: u32) -> Result<CounterReading> {
            self.readings
                .lock()
                .unwrap()
                .remove(0)
        }

        async fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>> {
            Ok(vec![])
        }

        async fn close(&self) {}
    }

    fn reading(in_octets: u64, out_octets: u64, width: CounterWidth) -> Result<CounterReading> {
        Ok(CounterReading {
            in_octets,
            out_octets,
            width,
        })
    }

    fn iface(index: u32, name: &str, is_up: bool, in_octets: u64) -> InterfaceInfo {
        InterfaceInfo {
            index,
            name: name.into(),
            description: None,
            is_up,
            in_octets,
        }
    }

    #[tokio::test]
    async fn test_sample_rate_basic() {
        // 1_000_000 bytes in 200ms = 40 Mbps in; half that out
        let source = ScriptedCounters::new(vec![
            reading(0, 0, CounterWidth::Bits64),
            reading(1_000_000, 500_000, CounterWidth::Bits64),
        ]);
        let probe = LinkProbe::new(source, 4, Duration::from_millis(200));

        let result = probe.sample_rate().await.unwrap().unwrap();
        // Elapsed is measured, not assumed, so allow slack around 40 Mbps
        assert!(result.inbound_mbps > 20.0 && result.inbound_mbps <= 41.0);
        assert!(result.outbound_mbps > 10.0 && result.outbound_mbps <= 20.5);
    }

    #[tokio::test]
    async fn test_sample_rate_folds_32bit_wrap() {
        // Counter wraps 2^32: 4_294_967_000 -> 1_000 is a delta of 1_296
        let source = ScriptedCounters::new(vec![
            reading(4_294_967_000, 100, CounterWidth::Bits32),
            reading(1_000, 200, CounterWidth::Bits32),
        ]);
        let probe = LinkProbe::new(source, 4, Duration::from_millis(200));

        let result = probe.sample_rate().await.unwrap().unwrap();
        // Tiny delta over the window: well under 1 Mbps, not negative garbage
        assert!(result.inbound_mbps >= 0.0 && result.inbound_mbps < 1.0);
    }

    #[tokio::test]
    async fn test_sample_rate_rejects_unreasonable() {
        // ~400 Gbps over 200ms: must be discarded
        let source = ScriptedCounters::new(vec![
            reading(0, 0, CounterWidth::Bits64),
            reading(10_000_000_000, 0, CounterWidth::Bits64),
        ]);
        let probe = LinkProbe::new(source, 4, Duration::from_millis(200));

        assert!(probe.sample_rate().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sample_rate_rejects_width_switch() {
        let source = ScriptedCounters::new(vec![
            reading(0, 0, CounterWidth::Bits64),
            reading(1_000, 1_000, CounterWidth::Bits32),
        ]);
        let probe = LinkProbe::new(source, 4, Duration::from_millis(200));

        assert!(probe.sample_rate().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sample_rate_propagates_transport_error() {
        let source = ScriptedCounters::new(vec![Err(Error::Probe("timeout".into()))]);
        let probe = LinkProbe::new(source, 4, Duration::from_millis(50));

        assert!(probe.sample_rate().await.is_err());
    }

    #[test]
    fn test_should_skip_interface() {
        assert!(should_skip_interface("eth5.20")); // VLAN sub-interface
        assert!(should_skip_interface("br0"));
        assert!(should_skip_interface("lo"));
        assert!(should_skip_interface("switch0"));
        assert!(should_skip_interface("tun1"));
        assert!(should_skip_interface("bond0"));
        assert!(!should_skip_interface("eth4"));
        assert!(!should_skip_interface("wan"));
    }

    #[test]
    fn test_suggest_wan_prefers_named_wan_with_traffic() {
        let interfaces = vec![
            iface(1, "eth0", true, 10_000),
            iface(4, "wan", true, 900_000_000),
            iface(5, "lan1", true, 200_000_000),
        ];
        let suggested = suggest_wan_interface(&interfaces).unwrap();
        assert_eq!(suggested.name, "wan");
    }

    #[test]
    fn test_suggest_wan_uses_eth4_convention() {
        let interfaces = vec![
            iface(1, "eth0", true, 100),
            iface(4, "eth4", true, 500_000_000),
        ];
        let suggested = suggest_wan_interface(&interfaces).unwrap();
        assert_eq!(suggested.name, "eth4");
    }

    #[test]
    fn test_suggest_wan_skips_down_interfaces() {
        let interfaces = vec![
            iface(4, "wan", false, 900_000_000),
            iface(1, "eth0", true, 100),
        ];
        let suggested = suggest_wan_interface(&interfaces).unwrap();
        assert_eq!(suggested.name, "eth0");
    }

    #[test]
    fn test_suggest_wan_empty() {
        assert!(suggest_wan_interface(&[]).is_none());
    }
}

//! Time-of-day alternate bandwidth windows
//!
//! A schedule swaps in an alternate total capacity (and optionally alternate
//! per-client percentages) during a daily window, e.g. a smaller download
//! pool during evening streaming hours. Windows that cross midnight
//! (22:00 to 06:00) are supported.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Alternate capacity applied during a daily time window
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Whether this schedule is active at all
    #[serde(default)]
    pub enabled: bool,

    /// Window start (HH:MM, 24-hour, local wall-clock)
    #[serde(default = "default_start", with = "time_format")]
    pub start: NaiveTime,

    /// Window end (HH:MM). When end < start the window wraps midnight.
    #[serde(default = "default_end", with = "time_format")]
    pub end: NaiveTime,

    /// Alternate total capacity during the window in Mbps.
    /// 0 means "no alternate total" — the window still swaps percents.
    #[serde(default)]
    pub total_mbps: f64,

    /// Alternate per-client-type percentages during the window
    #[serde(default)]
    pub client_percents: HashMap<String, u32>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start: default_start(),
            end: default_end(),
            total_mbps: 0.0,
            client_percents: HashMap::new(),
        }
    }
}

impl ScheduleConfig {
    /// Whether `now` falls inside this schedule's window.
    ///
    /// Disabled schedules never match. `start <= end` is a same-day window
    /// with an inclusive end; `start > end` wraps midnight.
    pub fn is_active(&self, now: NaiveTime) -> bool {
        if !self.enabled {
            return false;
        }
        if self.start <= self.end {
            now >= self.start && now <= self.end
        } else {
            now >= self.start || now <= self.end
        }
    }
}

fn default_start() -> NaiveTime {
    NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn default_end() -> NaiveTime {
    NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Serde module for serializing/deserializing NaiveTime as HH:MM strings
mod time_format {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = time.format("%H:%M").to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, "%H:%M").map_err(serde::de::Error::custom)
    }
}

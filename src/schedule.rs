//! The fixed, named schedule set and its cron mapping.
//!
//! Agents pick from a closed enumeration of schedules: a handful of
//! fixed intervals, one trigger per hour of the day, and `never`.
//! Each named schedule maps to a 6-field cron expression (the `cron`
//! crate wants seconds first) used by the scheduler loop to compute
//! fire times.
//!
//! Interval schedules of an hour or longer take a per-process random
//! minute offset so that independent deployments do not all fire on
//! the exact same minute.

use chrono::{DateTime, Utc};
use cron::Schedule;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// When an agent's scheduled check fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgentSchedule {
    Every1m,
    Every2m,
    Every5m,
    Every10m,
    Every30m,
    Every1h,
    Every2h,
    Every5h,
    Every12h,
    Every1d,
    Every2d,
    Every7d,
    /// Fire once a day at the given UTC hour (0-23).
    HourOfDay(u8),
    /// No scheduled checks; the agent only reacts to deliveries.
    Never,
}

/// Per-process random offset applied to hourly-and-longer intervals.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleJitter {
    pub minute: u8,
}

impl ScheduleJitter {
    pub fn from_rng(rng: &mut impl Rng) -> Self {
        Self {
            minute: rng.gen_range(0..60),
        }
    }

    /// Fixed zero offset, for tests and deterministic deployments.
    pub fn none() -> Self {
        Self { minute: 0 }
    }
}

impl AgentSchedule {
    /// Every named schedule in the system, in firing-frequency order.
    ///
    /// The scheduler loop registers one trigger per entry here (minus
    /// `Never`, which fires nothing).
    pub fn all() -> Vec<AgentSchedule> {
        let mut all = vec![
            AgentSchedule::Every1m,
            AgentSchedule::Every2m,
            AgentSchedule::Every5m,
            AgentSchedule::Every10m,
            AgentSchedule::Every30m,
            AgentSchedule::Every1h,
            AgentSchedule::Every2h,
            AgentSchedule::Every5h,
            AgentSchedule::Every12h,
            AgentSchedule::Every1d,
            AgentSchedule::Every2d,
            AgentSchedule::Every7d,
        ];
        all.extend((0..24).map(AgentSchedule::HourOfDay));
        all.push(AgentSchedule::Never);
        all
    }

    /// The stable name stored on agent rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentSchedule::Every1m => "every_1m",
            AgentSchedule::Every2m => "every_2m",
            AgentSchedule::Every5m => "every_5m",
            AgentSchedule::Every10m => "every_10m",
            AgentSchedule::Every30m => "every_30m",
            AgentSchedule::Every1h => "every_1h",
            AgentSchedule::Every2h => "every_2h",
            AgentSchedule::Every5h => "every_5h",
            AgentSchedule::Every12h => "every_12h",
            AgentSchedule::Every1d => "every_1d",
            AgentSchedule::Every2d => "every_2d",
            AgentSchedule::Every7d => "every_7d",
            AgentSchedule::HourOfDay(h) => HOUR_NAMES[*h as usize % 24],
            AgentSchedule::Never => "never",
        }
    }

    /// Parse a stored schedule name.
    pub fn parse(name: &str) -> Option<AgentSchedule> {
        match name {
            "every_1m" => Some(AgentSchedule::Every1m),
            "every_2m" => Some(AgentSchedule::Every2m),
            "every_5m" => Some(AgentSchedule::Every5m),
            "every_10m" => Some(AgentSchedule::Every10m),
            "every_30m" => Some(AgentSchedule::Every30m),
            "every_1h" => Some(AgentSchedule::Every1h),
            "every_2h" => Some(AgentSchedule::Every2h),
            "every_5h" => Some(AgentSchedule::Every5h),
            "every_12h" => Some(AgentSchedule::Every12h),
            "every_1d" => Some(AgentSchedule::Every1d),
            "every_2d" => Some(AgentSchedule::Every2d),
            "every_7d" => Some(AgentSchedule::Every7d),
            "never" => Some(AgentSchedule::Never),
            other => HOUR_NAMES
                .iter()
                .position(|name| *name == other)
                .map(|h| AgentSchedule::HourOfDay(h as u8)),
        }
    }

    /// The 6-field cron expression for this schedule, or `None` for
    /// `never`.
    pub fn cron_expression(&self, jitter: ScheduleJitter) -> Option<String> {
        let m = jitter.minute;
        let expr = match self {
            AgentSchedule::Every1m => "0 * * * * *".to_string(),
            AgentSchedule::Every2m => "0 */2 * * * *".to_string(),
            AgentSchedule::Every5m => "0 */5 * * * *".to_string(),
            AgentSchedule::Every10m => "0 */10 * * * *".to_string(),
            AgentSchedule::Every30m => "0 */30 * * * *".to_string(),
            AgentSchedule::Every1h => format!("0 {m} * * * *"),
            AgentSchedule::Every2h => format!("0 {m} */2 * * *"),
            AgentSchedule::Every5h => format!("0 {m} */5 * * *"),
            AgentSchedule::Every12h => format!("0 {m} */12 * * *"),
            AgentSchedule::Every1d => format!("0 {m} 0 * * *"),
            AgentSchedule::Every2d => format!("0 {m} 0 */2 * *"),
            AgentSchedule::Every7d => format!("0 {m} 0 * * Mon"),
            AgentSchedule::HourOfDay(h) => format!("0 0 {} * * *", h % 24),
            AgentSchedule::Never => return None,
        };
        Some(expr)
    }

    /// Compute the next fire time strictly after `after`.
    ///
    /// Returns `None` for `never`.
    pub fn next_fire_after(
        &self,
        after: DateTime<Utc>,
        jitter: ScheduleJitter,
    ) -> Option<DateTime<Utc>> {
        let expr = self.cron_expression(jitter)?;
        let schedule = Schedule::from_str(&expr)
            .unwrap_or_else(|err| panic!("invalid built-in cron expression '{expr}': {err}"));
        schedule.after(&after).next()
    }
}

impl std::fmt::Display for AgentSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AgentSchedule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AgentSchedule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        AgentSchedule::parse(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown schedule: {name}")))
    }
}

const HOUR_NAMES: [&str; 24] = [
    "midnight", "1am", "2am", "3am", "4am", "5am", "6am", "7am", "8am", "9am", "10am", "11am",
    "noon", "1pm", "2pm", "3pm", "4pm", "5pm", "6pm", "7pm", "8pm", "9pm", "10pm", "11pm",
];

//! Light window and day-periodic temperature schedule.

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Daily light window in local wall-clock time. `on_time >= off_time` means
/// the window crosses midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightSchedule {
    pub enabled: bool,
    #[serde(rename = "onTime")]
    pub on_time: String,
    #[serde(rename = "offTime")]
    pub off_time: String,
}

impl Default for LightSchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            on_time: "06:00".to_string(),
            off_time: "22:00".to_string(),
        }
    }
}

/// What the schedule wants the light to be right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightWindowState {
    Disabled,
    On,
    Off,
}

impl LightSchedule {
    pub fn validate(&self) -> bool {
        parse_hhmm(&self.on_time).is_some() && parse_hhmm(&self.off_time).is_some()
    }

    pub fn state(&self, now: NaiveTime) -> LightWindowState {
        if !self.enabled {
            return LightWindowState::Disabled;
        }
        if self.should_be_on(now) {
            LightWindowState::On
        } else {
            LightWindowState::Off
        }
    }

    pub fn should_be_on(&self, now: NaiveTime) -> bool {
        let (Some(on), Some(off)) = (parse_hhmm(&self.on_time), parse_hhmm(&self.off_time)) else {
            return false;
        };
        let now = minute_of_day(now);

        if on < off {
            on <= now && now < off
        } else {
            // Window crosses midnight.
            now >= on || now < off
        }
    }
}

/// Parse `"HH:MM"` into minutes since midnight.
fn parse_hhmm(value: &str) -> Option<u32> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

pub const MAX_TEMP_PERIODS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempPeriod {
    /// `"HH:MM"` start of the period.
    pub time: String,
    pub temperature: f32,
}

/// Day-periodic target-temperature overrides. When enabled, the period with
/// the latest start at or before now supplies the setpoint; before the first
/// period the last one from the previous day still applies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TempSchedule {
    pub enabled: bool,
    pub periods: Vec<TempPeriod>,
}

impl TempSchedule {
    /// Drop invalid periods, sort by start time and cap the count.
    pub fn normalize(&mut self) {
        self.periods.retain(|p| {
            parse_hhmm(&p.time).is_some() && p.temperature.is_finite()
        });
        self.periods
            .sort_by_key(|p| parse_hhmm(&p.time).unwrap_or(0));
        self.periods.truncate(MAX_TEMP_PERIODS);
    }

    pub fn current_target(&self, now: NaiveTime) -> Option<f32> {
        if !self.enabled || self.periods.is_empty() {
            return None;
        }
        let now = minute_of_day(now);

        let mut chosen: Option<&TempPeriod> = None;
        for period in &self.periods {
            let start = parse_hhmm(&period.time)?;
            if start <= now {
                chosen = Some(period);
            }
        }
        // Before the first period of the day the previous day's last period
        // is still in effect.
        chosen.or_else(|| self.periods.last()).map(|p| p.temperature)
    }
}

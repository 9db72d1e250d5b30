use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Hot-reloadable climate setpoints. Loaded from the settings store at the
/// start of every control cycle; all store values are strings, parsed here
/// with a last-known-good fallback per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimateSettings {
    pub target_temp: f32,
    pub temp_tolerance: f32,
    pub target_humidity: f32,
    pub humidity_tolerance: f32,
    pub use_ml: bool,
}

impl Default for ClimateSettings {
    fn default() -> Self {
        Self {
            target_temp: 22.0,
            temp_tolerance: 0.5,
            target_humidity: 60.0,
            humidity_tolerance: 5.0,
            use_ml: true,
        }
    }
}

impl ClimateSettings {
    pub fn sanitize(&mut self) {
        self.target_temp = self.target_temp.clamp(5.0, 40.0);
        self.temp_tolerance = self.temp_tolerance.clamp(0.0, 10.0);
        self.target_humidity = self.target_humidity.clamp(10.0, 95.0);
        self.humidity_tolerance = self.humidity_tolerance.clamp(0.0, 30.0);
    }

    /// Build a snapshot from the raw settings-store map. A key that is
    /// missing or fails to parse keeps the value from `fallback`.
    pub fn from_store(map: &HashMap<String, String>, fallback: &ClimateSettings) -> Self {
        fn parse_f32(map: &HashMap<String, String>, key: &str, fallback: f32) -> f32 {
            map.get(key)
                .and_then(|value| value.parse::<f32>().ok())
                .filter(|value| value.is_finite())
                .unwrap_or(fallback)
        }

        let use_ml = map
            .get("use_ml")
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(fallback.use_ml);

        let mut settings = Self {
            target_temp: parse_f32(map, "target_temp", fallback.target_temp),
            temp_tolerance: parse_f32(map, "temp_tolerance", fallback.temp_tolerance),
            target_humidity: parse_f32(map, "target_humidity", fallback.target_humidity),
            humidity_tolerance: parse_f32(map, "humidity_tolerance", fallback.humidity_tolerance),
            use_ml,
        };
        settings.sanitize();
        settings
    }
}

/// Fixed safety limits and loop timing. Constant for the life of the
/// process; tests construct shortened variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Continuous-runtime cap for any climate actuator.
    pub max_runtime_ms: u64,
    /// Turn-on floor for heater and humidifier, applied on every request.
    pub floor_cooldown_ms: u64,
    /// Mandatory off-time after a max-runtime trip.
    pub trip_cooldown_ms: u64,
    /// Off-time imposed after an effectiveness-based early shutoff.
    pub extended_off_ms: u64,
    /// Running time before the effectiveness check may judge at all.
    pub effectiveness_grace_ms: u64,
    /// Running time before an ineffective actuator may be shut off early.
    pub early_shutoff_after_ms: u64,
    /// Floor between successive actuator writes from the climate loop.
    pub min_action_interval_ms: u64,
    pub climate_tick_ms: u64,
    pub light_tick_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_runtime_ms: 3_600_000,
            floor_cooldown_ms: 450_000,
            trip_cooldown_ms: 600_000,
            extended_off_ms: 1_800_000,
            effectiveness_grace_ms: 300_000,
            early_shutoff_after_ms: 600_000,
            min_action_interval_ms: 60_000,
            climate_tick_ms: 10_000,
            light_tick_ms: 30_000,
        }
    }
}

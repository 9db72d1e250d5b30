//! Climate decision engine.
//!
//! A pure function of its inputs: no timers, no persistence, no I/O. The
//! duty-cycle safety layer in [`crate::safety`] decides what actually gets
//! applied; this module only answers "what do we want right now".

use crate::config::ClimateSettings;
use crate::types::{ClimateReading, ClimateStates, Prediction};

/// Compute the desired actuator states for one cycle.
///
/// When `prediction` is present and predictive control is enabled, the
/// forecast value is compared against the setpoint band instead of the
/// current reading, with `predicted < target` as the in-band tie-break.
pub fn decide(
    reading: ClimateReading,
    current: ClimateStates,
    prediction: Option<Prediction>,
    settings: &ClimateSettings,
) -> ClimateStates {
    let prediction = if settings.use_ml { prediction } else { None };

    let (humidifier, dehumidifier) = decide_humidity(reading.humidity, prediction, settings);
    ClimateStates {
        heater: decide_heater(reading.temperature, current.heater, prediction, settings),
        humidifier,
        dehumidifier,
    }
}

fn decide_heater(
    temperature: f32,
    currently_on: bool,
    prediction: Option<Prediction>,
    settings: &ClimateSettings,
) -> bool {
    let low = settings.target_temp - settings.temp_tolerance;
    let high = settings.target_temp + settings.temp_tolerance;

    match prediction {
        Some(p) => {
            if p.temperature < low {
                true
            } else if p.temperature > high {
                false
            } else {
                p.temperature < settings.target_temp
            }
        }
        None => {
            // Hysteresis: below the band turn on, at or above target turn
            // off, in between hold whatever we were doing.
            if temperature < low {
                true
            } else if temperature >= settings.target_temp {
                false
            } else {
                currently_on
            }
        }
    }
}

fn decide_humidity(
    humidity: f32,
    prediction: Option<Prediction>,
    settings: &ClimateSettings,
) -> (bool, bool) {
    let low = settings.target_humidity - settings.humidity_tolerance;
    let high = settings.target_humidity + settings.humidity_tolerance;

    let value = prediction.map(|p| p.humidity).unwrap_or(humidity);

    if value < low {
        (true, false)
    } else if value > high {
        (false, true)
    } else if prediction.is_some() {
        // In-band tie-break on the forecast only; reactive control rests
        // inside the band.
        if value < settings.target_humidity {
            (true, false)
        } else if value > settings.target_humidity {
            (false, true)
        } else {
            (false, false)
        }
    } else {
        (false, false)
    }
}

use serde::{Deserialize, Serialize};

/// A relay-driven device in the growing environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actuator {
    Heater,
    Humidifier,
    Dehumidifier,
    Light,
}

impl Actuator {
    /// The three actuators governed by the climate loop. The light is owned
    /// by the schedule loop and never appears in climate decisions.
    pub const CLIMATE: [Actuator; 3] = [
        Actuator::Heater,
        Actuator::Humidifier,
        Actuator::Dehumidifier,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heater => "heater",
            Self::Humidifier => "humidifier",
            Self::Dehumidifier => "dehumidifier",
            Self::Light => "light",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "heater" => Some(Self::Heater),
            "humidifier" => Some(Self::Humidifier),
            "dehumidifier" => Some(Self::Dehumidifier),
            "light" => Some(Self::Light),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Auto,
    Manual,
}

impl ControlMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightMode {
    Schedule,
    Manual,
}

impl LightMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "schedule" => Some(Self::Schedule),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// What caused an actuator transition, recorded with every history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    Auto,
    Manual,
    Schedule,
}

/// A complete sensor reading in degrees Celsius and percent relative
/// humidity. Partial board responses never reach the decision engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReading {
    pub temperature: f32,
    pub humidity: f32,
}

/// On/off state of the three climate actuators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClimateStates {
    pub heater: bool,
    pub humidifier: bool,
    pub dehumidifier: bool,
}

impl ClimateStates {
    pub fn get(self, actuator: Actuator) -> bool {
        match actuator {
            Actuator::Heater => self.heater,
            Actuator::Humidifier => self.humidifier,
            Actuator::Dehumidifier => self.dehumidifier,
            Actuator::Light => false,
        }
    }

    pub fn set(&mut self, actuator: Actuator, on: bool) {
        match actuator {
            Actuator::Heater => self.heater = on,
            Actuator::Humidifier => self.humidifier = on,
            Actuator::Dehumidifier => self.dehumidifier = on,
            Actuator::Light => {}
        }
    }
}

/// Forecast of temperature and humidity over the prediction horizon.
/// Ephemeral: recomputed every cycle, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub temperature: f32,
    pub humidity: f32,
    pub temp_delta: f32,
    pub humidity_delta: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClimateStatus {
    pub enabled: bool,
    pub running: bool,
    #[serde(rename = "targetTemp")]
    pub target_temp: f32,
    #[serde(rename = "tempTolerance")]
    pub temp_tolerance: f32,
    #[serde(rename = "targetHumidity")]
    pub target_humidity: f32,
    #[serde(rename = "humidityTolerance")]
    pub humidity_tolerance: f32,
    #[serde(rename = "useMl")]
    pub use_ml: bool,
    #[serde(rename = "lastActionEpoch")]
    pub last_action_epoch: Option<i64>,
    pub applied: ClimateStates,
}

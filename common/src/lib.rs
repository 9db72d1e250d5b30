pub mod config;
pub mod engine;
pub mod safety;
pub mod schedule;
pub mod types;

pub use config::{ClimateSettings, SafetyConfig};
pub use engine::decide;
pub use safety::{cycle_policy, CyclePlan, CyclePolicy, SafetyState, Transition, TransitionReason};
pub use schedule::{LightSchedule, LightWindowState, TempPeriod, TempSchedule, MAX_TEMP_PERIODS};
pub use types::{
    Actuator, ClimateReading, ClimateStates, ClimateStatus, ControlMode, LightMode, Prediction,
    TriggerMode,
};

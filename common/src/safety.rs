//! Duty-cycle safety layer.
//!
//! Filters the decision engine's desired states through minimum-on/off
//! timers, the maximum-continuous-runtime interlock and the effectiveness
//! check. All timing state lives in [`SafetyState`]; planning is pure and
//! the owning loop commits timer updates only after the board write
//! succeeded, so a failed write leaves everything positioned for a retry.

use crate::config::{ClimateSettings, SafetyConfig};
use crate::types::{Actuator, ClimateReading, ClimateStates};

/// Sensor values captured when an actuator turned on, used to judge whether
/// it is making progress toward target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectivenessSample {
    pub temperature: f32,
    pub humidity: f32,
    pub at_ms: u64,
}

/// Timing record for one climate actuator. Mutated only through
/// [`SafetyState::commit`] and [`SafetyState::sync_startup`].
#[derive(Debug, Clone, Copy, Default)]
struct ActuatorTimer {
    on: bool,
    last_on_ms: Option<u64>,
    last_off_ms: Option<u64>,
    /// Single authoritative cooldown deadline. Set by a max-runtime trip or
    /// an ineffective early shutoff; a turn-on must wait this out on top of
    /// the policy minimum-off.
    off_until_ms: Option<u64>,
    sample: Option<EffectivenessSample>,
}

/// Per-cycle minimum on/off durations, recomputed from the current distance
/// to target: the further off, the longer we may run and the sooner we may
/// restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclePolicy {
    pub min_on_ms: u64,
    pub min_off_ms: u64,
}

pub fn cycle_policy(target: f32, current: f32) -> CyclePolicy {
    let reference = if target.abs() < f32::EPSILON { 1.0 } else { target.abs() };
    let percent_off = ((target - current).abs() / reference) * 100.0;

    if percent_off < 5.0 {
        CyclePolicy {
            min_on_ms: 600_000,
            min_off_ms: 1_200_000,
        }
    } else if percent_off < 15.0 {
        CyclePolicy {
            min_on_ms: 1_200_000,
            min_off_ms: 600_000,
        }
    } else {
        let scaled = 1_800_000.0 + f64::from(percent_off) * 60_000.0;
        CyclePolicy {
            min_on_ms: scaled.min(3_600_000.0) as u64,
            min_off_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    /// Ordinary demand change that cleared the duty-cycle gates.
    Demand,
    /// Setpoint met while running; bypasses minimum-on.
    TargetReached,
    /// Continuous-runtime cap hit; imposes the trip cooldown.
    MaxRuntime,
    /// No measurable progress; early shutoff with an extended off-time.
    Ineffective,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub actuator: Actuator,
    pub on: bool,
    pub reason: TransitionReason,
}

/// Outcome of planning one cycle: the states to write to the board and the
/// real flips relative to the current state (empty when nothing changes).
#[derive(Debug, Clone, PartialEq)]
pub struct CyclePlan {
    pub applied: ClimateStates,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, Default)]
pub struct SafetyState {
    heater: ActuatorTimer,
    humidifier: ActuatorTimer,
    dehumidifier: ActuatorTimer,
}

impl SafetyState {
    pub fn applied(&self) -> ClimateStates {
        ClimateStates {
            heater: self.heater.on,
            humidifier: self.humidifier.on,
            dehumidifier: self.dehumidifier.on,
        }
    }

    /// Adopt the board's relay states at startup. Anything already running
    /// is tracked from now so the runtime cap still engages.
    pub fn sync_startup(&mut self, states: ClimateStates, now_ms: u64) {
        for actuator in Actuator::CLIMATE {
            let timer = self.timer_mut(actuator);
            timer.on = states.get(actuator);
            if timer.on {
                timer.last_on_ms = Some(now_ms);
            }
        }
    }

    /// Evaluate the safety rules against the desired states. Pure with
    /// respect to `self`; apply the result with [`SafetyState::commit`] once
    /// the board write succeeded.
    pub fn plan(
        &self,
        desired: ClimateStates,
        reading: ClimateReading,
        settings: &ClimateSettings,
        config: &SafetyConfig,
        now_ms: u64,
    ) -> CyclePlan {
        let mut applied = ClimateStates::default();
        let mut transitions = Vec::new();

        for actuator in Actuator::CLIMATE {
            let (on, reason) = plan_one(
                self.timer(actuator),
                actuator,
                desired.get(actuator),
                reading,
                settings,
                config,
                now_ms,
            );
            applied.set(actuator, on);
            if let Some(reason) = reason {
                transitions.push(Transition {
                    actuator,
                    on,
                    reason,
                });
            }
        }

        CyclePlan {
            applied,
            transitions,
        }
    }

    pub fn commit(
        &mut self,
        plan: &CyclePlan,
        reading: ClimateReading,
        config: &SafetyConfig,
        now_ms: u64,
    ) {
        for transition in &plan.transitions {
            let timer = self.timer_mut(transition.actuator);
            timer.on = transition.on;

            if transition.on {
                timer.last_on_ms = Some(now_ms);
                timer.off_until_ms = None;
                timer.sample = Some(EffectivenessSample {
                    temperature: reading.temperature,
                    humidity: reading.humidity,
                    at_ms: now_ms,
                });
            } else {
                timer.last_off_ms = Some(now_ms);
                timer.sample = None;
                timer.off_until_ms = match transition.reason {
                    TransitionReason::MaxRuntime => Some(now_ms + config.trip_cooldown_ms),
                    TransitionReason::Ineffective => Some(now_ms + config.extended_off_ms),
                    _ => None,
                };
            }
        }
    }

    fn timer(&self, actuator: Actuator) -> &ActuatorTimer {
        match actuator {
            Actuator::Heater => &self.heater,
            Actuator::Humidifier => &self.humidifier,
            Actuator::Dehumidifier | Actuator::Light => &self.dehumidifier,
        }
    }

    fn timer_mut(&mut self, actuator: Actuator) -> &mut ActuatorTimer {
        match actuator {
            Actuator::Heater => &mut self.heater,
            Actuator::Humidifier => &mut self.humidifier,
            Actuator::Dehumidifier | Actuator::Light => &mut self.dehumidifier,
        }
    }
}

fn plan_one(
    timer: &ActuatorTimer,
    actuator: Actuator,
    desired_on: bool,
    reading: ClimateReading,
    settings: &ClimateSettings,
    config: &SafetyConfig,
    now_ms: u64,
) -> (bool, Option<TransitionReason>) {
    let on = timer.on;
    let elapsed_on = now_ms.saturating_sub(timer.last_on_ms.unwrap_or(now_ms));

    // Precedence 1: never overshoot once the setpoint is met.
    if on && target_reached(actuator, reading, settings) {
        return (false, Some(TransitionReason::TargetReached));
    }

    // Precedence 2: continuous-runtime cap.
    if on && elapsed_on >= config.max_runtime_ms {
        return (false, Some(TransitionReason::MaxRuntime));
    }

    let policy = policy_for(actuator, reading, settings);

    if desired_on && !on {
        let required_off = required_off_ms(actuator, policy, config);
        let waited = timer
            .last_off_ms
            .map(|t| now_ms.saturating_sub(t))
            .unwrap_or(u64::MAX);
        let cooled = timer.off_until_ms.map_or(true, |t| now_ms >= t);

        if waited >= required_off && cooled {
            (true, Some(TransitionReason::Demand))
        } else {
            // Deferred, not dropped: the demand is re-evaluated next cycle.
            (false, None)
        }
    } else if !desired_on && on {
        if elapsed_on >= config.early_shutoff_after_ms
            && !is_effective(timer, actuator, reading, settings, config, now_ms)
        {
            return (false, Some(TransitionReason::Ineffective));
        }

        if elapsed_on >= policy.min_on_ms {
            (false, Some(TransitionReason::Demand))
        } else {
            // Keep running until minimum-on is satisfied.
            (true, None)
        }
    } else {
        (on, None)
    }
}

fn target_reached(actuator: Actuator, reading: ClimateReading, settings: &ClimateSettings) -> bool {
    match actuator {
        Actuator::Heater => reading.temperature >= settings.target_temp,
        Actuator::Humidifier => reading.humidity >= settings.target_humidity,
        Actuator::Dehumidifier => reading.humidity <= settings.target_humidity,
        Actuator::Light => false,
    }
}

fn policy_for(actuator: Actuator, reading: ClimateReading, settings: &ClimateSettings) -> CyclePolicy {
    match actuator {
        Actuator::Heater => cycle_policy(settings.target_temp, reading.temperature),
        Actuator::Humidifier | Actuator::Dehumidifier => {
            cycle_policy(settings.target_humidity, reading.humidity)
        }
        Actuator::Light => CyclePolicy {
            min_on_ms: 0,
            min_off_ms: 0,
        },
    }
}

fn required_off_ms(actuator: Actuator, policy: CyclePolicy, config: &SafetyConfig) -> u64 {
    match actuator {
        // Heater and humidifier draw enough to warrant an unconditional
        // turn-on floor on top of the adaptive policy.
        Actuator::Heater | Actuator::Humidifier => policy.min_off_ms.max(config.floor_cooldown_ms),
        _ => policy.min_off_ms,
    }
}

/// Judge whether a running actuator is measurably moving the environment
/// toward target. Defaults to effective when there is no history or it has
/// not been running long enough to tell.
fn is_effective(
    timer: &ActuatorTimer,
    actuator: Actuator,
    reading: ClimateReading,
    settings: &ClimateSettings,
    config: &SafetyConfig,
    now_ms: u64,
) -> bool {
    let Some(sample) = timer.sample else {
        return true;
    };
    let elapsed = now_ms.saturating_sub(timer.last_on_ms.unwrap_or(now_ms));
    if elapsed < config.effectiveness_grace_ms {
        return true;
    }

    match actuator {
        Actuator::Heater => {
            let change = reading.temperature - sample.temperature;
            if change <= 0.0 && reading.temperature < settings.target_temp {
                return false;
            }
            // Barely rising while still well short of target.
            if change < 0.1 && settings.target_temp - reading.temperature > 2.0 {
                return false;
            }
            true
        }
        Actuator::Humidifier => {
            let change = reading.humidity - sample.humidity;
            if change <= 0.0 && reading.humidity < settings.target_humidity {
                return false;
            }
            if change < 0.5 && settings.target_humidity - reading.humidity > 10.0 {
                return false;
            }
            true
        }
        Actuator::Dehumidifier => {
            let change = reading.humidity - sample.humidity;
            !(change >= 0.0 && reading.humidity > settings.target_humidity)
        }
        Actuator::Light => true,
    }
}

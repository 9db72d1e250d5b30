//! Climate control loop: read sensors, decide, safety-filter, write.
//!
//! The loop owns the safety timers; everything it writes to the board goes
//! through [`SafetyState::plan`] first, and the timers advance only after
//! the board acknowledged the writes. Enable/disable flips a flag without
//! touching the timers, so toggling auto mode cannot bypass a cooldown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use greenhouse_common::{
    decide, ClimateReading, ClimateSettings, ClimateStates, ClimateStatus, ControlMode,
    SafetyConfig, SafetyState, TempSchedule, TriggerMode,
};

use crate::gateway::BoardGateway;
use crate::history::{History, SensorSample};
use crate::predictor::Predictor;
use crate::store::Store;

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Latest complete board reading, cached for the HTTP API.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CurrentConditions {
    pub timestamp: f64,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    #[serde(rename = "soilMoisture")]
    pub soil_moisture: Option<f32>,
}

struct ControlState {
    settings: ClimateSettings,
    safety: SafetyState,
    temp_schedule: TempSchedule,
    timezone: String,
    last_action_ms: Option<u64>,
    last_action_epoch: Option<i64>,
}

pub struct ClimateController {
    gateway: Arc<BoardGateway>,
    store: Store,
    history: History,
    predictor: Arc<Predictor>,
    config: SafetyConfig,
    state: Mutex<ControlState>,
    enabled: AtomicBool,
    running: AtomicBool,
    shutdown: Notify,
    stopped: AtomicBool,
    latest: Mutex<Option<CurrentConditions>>,
}

impl ClimateController {
    pub fn new(
        gateway: Arc<BoardGateway>,
        store: Store,
        history: History,
        predictor: Arc<Predictor>,
        config: SafetyConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            history,
            predictor,
            config,
            state: Mutex::new(ControlState {
                settings: ClimateSettings::default(),
                safety: SafetyState::default(),
                temp_schedule: TempSchedule::default(),
                timezone: "UTC".to_string(),
                last_action_ms: None,
                last_action_epoch: None,
            }),
            enabled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            stopped: AtomicBool::new(false),
            latest: Mutex::new(None),
        }
    }

    /// Load persisted settings and adopt the board's current relay states so
    /// anything already running is tracked by the safety timers.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        let map = self.store.load_settings().await?;
        let mut state = self.state.lock().await;
        state.settings = ClimateSettings::from_store(&map, &state.settings);
        if let Some(timezone) = map.get("timezone") {
            state.timezone = timezone.clone();
        }
        state.temp_schedule = self.store.load_temp_schedule().await?;
        self.enabled.store(
            map.get("mode").map(String::as_str) == Some("auto"),
            Ordering::Relaxed,
        );

        match self.gateway.actuator_states().await {
            Ok(relays) => {
                let states = ClimateStates {
                    heater: relays.get("heater").copied().unwrap_or(false),
                    humidifier: relays.get("humidifier").copied().unwrap_or(false),
                    dehumidifier: relays.get("dehumidifier").copied().unwrap_or(false),
                };
                state.safety.sync_startup(states, monotonic_ms());
                info!(?states, "adopted board relay states");
            }
            Err(err) => warn!("could not read board relay states at startup: {err}"),
        }
        Ok(())
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(controller.config.climate_tick_ms));
            controller.running.store(true, Ordering::Relaxed);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = controller.shutdown.notified() => break,
                }
                if controller.stopped.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(err) = controller.control_cycle(monotonic_ms()).await {
                    warn!("control cycle failed: {err:#}");
                }
            }

            controller.running.store(false, Ordering::Relaxed);
            info!("climate loop stopped");
        })
    }

    pub async fn control_cycle(&self, now_ms: u64) -> anyhow::Result<()> {
        self.reload_settings().await;

        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let sample = match self.gateway.read_all().await {
            Ok(sample) => sample,
            Err(err) => {
                warn!("sensor read failed, skipping cycle: {err}");
                return Ok(());
            }
        };
        let (Some(temperature), Some(humidity)) = (sample.temperature, sample.humidity) else {
            // A partial reading never reaches the decision engine.
            warn!("incomplete sensor reading, skipping cycle");
            return Ok(());
        };
        let reading = ClimateReading {
            temperature,
            humidity,
        };

        let (settings, applied) = {
            let state = self.state.lock().await;
            let mut settings = state.settings.clone();
            if let Some(target) = state
                .temp_schedule
                .current_target(local_time(&state.timezone))
            {
                settings.target_temp = target;
                settings.sanitize();
            }
            (settings, state.safety.applied())
        };

        self.predictor
            .maybe_spawn_retrain(Utc::now().timestamp() as u64);
        let prediction = self.predictor.predict(reading, applied);

        let desired = decide(reading, applied, prediction, &settings);

        let plan = {
            let state = self.state.lock().await;
            state
                .safety
                .plan(desired, reading, &settings, &self.config, now_ms)
        };

        if plan.transitions.is_empty() {
            return Ok(());
        }

        // Rate-limit actuator writes; a deferred plan is recomputed fresh
        // next tick.
        {
            let state = self.state.lock().await;
            if let Some(last) = state.last_action_ms {
                if now_ms.saturating_sub(last) < self.config.min_action_interval_ms {
                    return Ok(());
                }
            }
        }

        for transition in &plan.transitions {
            self.gateway
                .set_actuator(transition.actuator, transition.on)
                .await?;
        }

        let mut state = self.state.lock().await;
        state.safety.commit(&plan, reading, &self.config, now_ms);
        state.last_action_ms = Some(now_ms);
        state.last_action_epoch = Some(Utc::now().timestamp());
        drop(state);

        for transition in &plan.transitions {
            info!(
                actuator = transition.actuator.as_str(),
                on = transition.on,
                reason = ?transition.reason,
                temperature,
                humidity,
                "actuator transition"
            );
            if let Err(err) = self
                .history
                .log_transition(transition.actuator, transition.on, TriggerMode::Auto)
                .await
            {
                warn!("failed to record transition: {err:#}");
            }
        }
        Ok(())
    }

    /// Pick up settings edits made through the API or directly on disk.
    async fn reload_settings(&self) {
        let map = match self.store.load_settings().await {
            Ok(map) => map,
            Err(err) => {
                // Keep the previous snapshot; a bad write must not blank
                // the setpoints mid-flight.
                warn!("settings reload failed, keeping previous values: {err:#}");
                return;
            }
        };

        let mut state = self.state.lock().await;
        state.settings = ClimateSettings::from_store(&map, &state.settings);
        if let Some(timezone) = map.get("timezone") {
            state.timezone = timezone.clone();
        }
        self.enabled.store(
            map.get("mode").map(String::as_str) == Some("auto"),
            Ordering::Relaxed,
        );
    }

    pub async fn set_mode(&self, mode: ControlMode) -> anyhow::Result<()> {
        self.store.set_setting("mode", mode.as_str()).await?;
        self.enabled
            .store(mode == ControlMode::Auto, Ordering::Relaxed);
        info!(mode = mode.as_str(), "climate mode changed");
        Ok(())
    }

    pub fn mode(&self) -> ControlMode {
        if self.enabled.load(Ordering::Relaxed) {
            ControlMode::Auto
        } else {
            ControlMode::Manual
        }
    }

    pub async fn update_settings(&self, settings: ClimateSettings) -> anyhow::Result<()> {
        let mut sanitized = settings;
        sanitized.sanitize();

        let mut map = self.store.load_settings().await?;
        map.insert("target_temp".into(), sanitized.target_temp.to_string());
        map.insert("temp_tolerance".into(), sanitized.temp_tolerance.to_string());
        map.insert(
            "target_humidity".into(),
            sanitized.target_humidity.to_string(),
        );
        map.insert(
            "humidity_tolerance".into(),
            sanitized.humidity_tolerance.to_string(),
        );
        map.insert("use_ml".into(), sanitized.use_ml.to_string());
        self.store.save_settings(&map).await?;

        self.state.lock().await.settings = sanitized;
        Ok(())
    }

    pub async fn set_temp_schedule(&self, mut schedule: TempSchedule) -> anyhow::Result<()> {
        schedule.normalize();
        self.store.save_temp_schedule(&schedule).await?;
        self.state.lock().await.temp_schedule = schedule;
        Ok(())
    }

    pub async fn temp_schedule(&self) -> TempSchedule {
        self.state.lock().await.temp_schedule.clone()
    }

    pub async fn status(&self) -> ClimateStatus {
        let state = self.state.lock().await;
        ClimateStatus {
            enabled: self.enabled.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            target_temp: state.settings.target_temp,
            temp_tolerance: state.settings.temp_tolerance,
            target_humidity: state.settings.target_humidity,
            humidity_tolerance: state.settings.humidity_tolerance,
            use_ml: state.settings.use_ml,
            last_action_epoch: state.last_action_epoch,
            applied: state.safety.applied(),
        }
    }

    pub async fn current_conditions(&self) -> Option<CurrentConditions> {
        *self.latest.lock().await
    }

    /// Sampling loop: cache the latest reading for the API and append it,
    /// with the applied actuator states, to the history log.
    pub fn spawn_sampler(self: &Arc<Self>, tick: Duration) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            // Roughly one prune per day at the default 30 s tick.
            let mut ticks: u64 = 0;

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = controller.shutdown.notified() => break,
                }
                if controller.stopped.load(Ordering::Relaxed) {
                    break;
                }

                let sample = match controller.gateway.read_all().await {
                    Ok(sample) => sample,
                    Err(err) => {
                        warn!("sampler read failed: {err}");
                        continue;
                    }
                };

                let timestamp = crate::history::epoch_seconds();
                *controller.latest.lock().await = Some(CurrentConditions {
                    timestamp,
                    temperature: sample.temperature,
                    humidity: sample.humidity,
                    soil_moisture: sample.soil_moisture,
                });

                if let (Some(temperature), Some(humidity)) =
                    (sample.temperature, sample.humidity)
                {
                    let applied = controller.state.lock().await.safety.applied();
                    let record = SensorSample {
                        timestamp,
                        temperature,
                        humidity,
                        heater: applied.heater,
                        humidifier: applied.humidifier,
                        dehumidifier: applied.dehumidifier,
                    };
                    if let Err(err) = controller.history.log_sample(&record).await {
                        warn!("failed to record sensor sample: {err:#}");
                    }
                }

                ticks += 1;
                if ticks % 2_880 == 0 {
                    if let Err(err) = controller.history.prune().await {
                        warn!("history prune failed: {err:#}");
                    }
                }
            }
        })
    }

    /// Stop the loops and switch every climate actuator off.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.shutdown.notify_waiters();
        if let Err(err) = self.gateway.set_climate(ClimateStates::default()).await {
            warn!("could not switch actuators off during shutdown: {err}");
        }
    }
}

fn local_time(timezone: &str) -> chrono::NaiveTime {
    match timezone.parse::<chrono_tz::Tz>() {
        Ok(tz) => Utc::now().with_timezone(&tz).time(),
        Err(_) => Utc::now().time(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::sync::mpsc;

    use super::*;

    /// Board stub that serves a fixed reading and records relay writes.
    fn scripted_board(
        peer: DuplexStream,
        reading: Arc<std::sync::Mutex<(f32, f32)>>,
        writes: mpsc::UnboundedSender<(String, bool)>,
    ) {
        tokio::spawn(async move {
            let mut peer = BufReader::new(peer);
            let mut line = String::new();
            loop {
                line.clear();
                match peer.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let request: Value = serde_json::from_str(&line).unwrap();
                let response = match request["command"].as_str().unwrap() {
                    "read_all" => {
                        let (temperature, humidity) = *reading.lock().unwrap();
                        json!({
                            "temperature": temperature,
                            "humidity": humidity,
                            "soil_moisture": 0.5,
                            "relays": {},
                            "status": "ok"
                        })
                    }
                    "set_relay" => {
                        writes
                            .send((
                                request["relay"].as_str().unwrap().to_string(),
                                request["state"].as_bool().unwrap(),
                            ))
                            .unwrap();
                        json!({
                            "command": "set_relay",
                            "relay": request["relay"],
                            "state": request["state"],
                            "success": true
                        })
                    }
                    "get_relays" => json!({"relays": {}, "status": "ok"}),
                    _ => json!({"status": "ok", "board": "test"}),
                };
                let mut body = serde_json::to_vec(&response).unwrap();
                body.push(b'\n');
                if peer.get_mut().write_all(&body).await.is_err() {
                    break;
                }
            }
        });
    }

    fn test_controller(
        reading: Arc<std::sync::Mutex<(f32, f32)>>,
        writes: mpsc::UnboundedSender<(String, bool)>,
        tag: &str,
    ) -> ClimateController {
        let (client, server) = duplex(16_384);
        scripted_board(server, reading, writes);

        let dir = std::env::temp_dir().join(format!(
            "greenhouse-climate-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);

        let history = History::new(dir.clone());
        let config = SafetyConfig {
            min_action_interval_ms: 0,
            ..SafetyConfig::default()
        };
        ClimateController::new(
            Arc::new(BoardGateway::from_link(client)),
            Store::new(dir),
            history.clone(),
            Arc::new(Predictor::new(history)),
            config,
        )
    }

    #[tokio::test]
    async fn cold_reading_switches_heater_on_then_target_switches_it_off() {
        let reading = Arc::new(std::sync::Mutex::new((20.0f32, 60.0f32)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = test_controller(Arc::clone(&reading), tx, "end2end");

        controller.store.set_setting("mode", "auto").await.unwrap();
        controller.initialize().await.unwrap();

        controller.control_cycle(1_000_000).await.unwrap();
        assert_eq!(rx.recv().await, Some(("heater".to_string(), true)));
        assert!(controller.status().await.applied.heater);

        // Target reached: immediate shutoff regardless of minimum-on.
        *reading.lock().unwrap() = (22.0, 60.0);
        controller.control_cycle(1_010_000).await.unwrap();
        assert_eq!(rx.recv().await, Some(("heater".to_string(), false)));
        assert!(!controller.status().await.applied.heater);
    }

    #[tokio::test]
    async fn disabled_controller_never_writes() {
        let reading = Arc::new(std::sync::Mutex::new((15.0f32, 60.0f32)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = test_controller(reading, tx, "disabled");

        controller.initialize().await.unwrap();
        assert_eq!(controller.mode(), ControlMode::Manual);

        controller.control_cycle(1_000_000).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn temp_schedule_overrides_setpoint() {
        let reading = Arc::new(std::sync::Mutex::new((23.0f32, 60.0f32)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = test_controller(Arc::clone(&reading), tx, "schedule");

        controller.store.set_setting("mode", "auto").await.unwrap();
        controller.initialize().await.unwrap();
        controller
            .set_temp_schedule(greenhouse_common::TempSchedule {
                enabled: true,
                periods: vec![greenhouse_common::TempPeriod {
                    time: "00:00".to_string(),
                    temperature: 28.0,
                }],
            })
            .await
            .unwrap();

        // 23 °C is warm against the stored 22 °C target but cold against
        // the scheduled 28 °C one.
        controller.control_cycle(1_000_000).await.unwrap();
        assert_eq!(rx.recv().await, Some(("heater".to_string(), true)));
    }
}

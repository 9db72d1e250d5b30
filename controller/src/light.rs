//! Light schedule loop.
//!
//! Evaluates the daily window on every tick but writes to the board only
//! when the desired state differs from the last one it applied. Schedule
//! updates persist to disk before they take effect, so a crash between the
//! two cannot leave an applied-but-unsaved schedule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use greenhouse_common::{Actuator, LightMode, LightSchedule, TriggerMode};

use crate::gateway::BoardGateway;
use crate::history::History;
use crate::store::Store;

struct LightState {
    schedule: LightSchedule,
    timezone: String,
    /// Last state this loop wrote to the board; `None` forces a write on
    /// the next evaluation.
    last_applied: Option<bool>,
}

pub struct LightScheduler {
    gateway: Arc<BoardGateway>,
    store: Store,
    history: History,
    state: Mutex<LightState>,
    shutdown: Notify,
    stopped: AtomicBool,
}

impl LightScheduler {
    pub fn new(gateway: Arc<BoardGateway>, store: Store, history: History) -> Self {
        Self {
            gateway,
            store,
            history,
            state: Mutex::new(LightState {
                schedule: LightSchedule::default(),
                timezone: "UTC".to_string(),
                last_applied: None,
            }),
            shutdown: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        let schedule = self.store.load_light_schedule().await?;
        let timezone = self
            .store
            .get_setting("timezone")
            .await?
            .unwrap_or_else(|| "UTC".to_string());
        let mut state = self.state.lock().await;
        state.schedule = schedule;
        state.timezone = timezone;
        Ok(())
    }

    pub fn spawn(self: &Arc<Self>, tick: Duration) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = scheduler.shutdown.notified() => break,
                }
                if scheduler.stopped.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(err) = scheduler.evaluate().await {
                    warn!("light evaluation failed: {err:#}");
                }
            }
            info!("light loop stopped");
        })
    }

    /// One evaluation: no-op unless the light is in schedule mode and the
    /// desired state changed since the last write.
    pub async fn evaluate(&self) -> anyhow::Result<()> {
        let mode = self
            .store
            .get_setting("light_mode")
            .await?
            .and_then(|value| LightMode::parse(&value))
            .unwrap_or(LightMode::Schedule);
        if mode != LightMode::Schedule {
            return Ok(());
        }

        let (desired, previous) = {
            let state = self.state.lock().await;
            if !state.schedule.enabled {
                return Ok(());
            }
            let now = local_time(&state.timezone);
            (state.schedule.should_be_on(now), state.last_applied)
        };

        if previous == Some(desired) {
            return Ok(());
        }

        self.gateway.set_actuator(Actuator::Light, desired).await?;
        self.state.lock().await.last_applied = Some(desired);

        info!(on = desired, "light switched by schedule");
        if let Err(err) = self
            .history
            .log_transition(Actuator::Light, desired, TriggerMode::Schedule)
            .await
        {
            warn!("failed to record light transition: {err:#}");
        }
        Ok(())
    }

    pub async fn schedule(&self) -> LightSchedule {
        self.state.lock().await.schedule.clone()
    }

    /// Persist first, then adopt; the next tick re-applies from scratch.
    pub async fn set_schedule(&self, schedule: LightSchedule) -> anyhow::Result<()> {
        anyhow::ensure!(schedule.validate(), "schedule times must be HH:MM");
        self.store.save_light_schedule(&schedule).await?;

        let mut state = self.state.lock().await;
        state.schedule = schedule;
        state.last_applied = None;
        Ok(())
    }

    pub async fn set_mode(&self, mode: LightMode) -> anyhow::Result<()> {
        self.store.set_setting("light_mode", mode.as_str()).await?;
        if mode == LightMode::Schedule {
            // Re-apply on the next tick after a stint of manual control.
            self.state.lock().await.last_applied = None;
        }
        info!(mode = mode.as_str(), "light mode changed");
        Ok(())
    }

    pub async fn mode(&self) -> LightMode {
        self.store
            .get_setting("light_mode")
            .await
            .ok()
            .flatten()
            .and_then(|value| LightMode::parse(&value))
            .unwrap_or(LightMode::Schedule)
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.shutdown.notify_waiters();
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
    use serde_json::{json, Value};
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::sync::mpsc;

    use super::*;

    fn relay_board(peer: DuplexStream, writes: mpsc::UnboundedSender<(String, bool)>) {
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
                writes
                    .send((
                        request["relay"].as_str().unwrap().to_string(),
                        request["state"].as_bool().unwrap(),
                    ))
                    .unwrap();
                let response = json!({
                    "command": "set_relay",
                    "relay": request["relay"],
                    "state": request["state"],
                    "success": true
                });
                let mut body = serde_json::to_vec(&response).unwrap();
                body.push(b'\n');
                if peer.get_mut().write_all(&body).await.is_err() {
                    break;
                }
            }
        });
    }

    fn test_scheduler(writes: mpsc::UnboundedSender<(String, bool)>, tag: &str) -> LightScheduler {
        let (client, server) = duplex(4_096);
        relay_board(server, writes);

        let dir = std::env::temp_dir().join(format!(
            "greenhouse-light-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        LightScheduler::new(
            Arc::new(BoardGateway::from_link(client)),
            Store::new(dir.clone()),
            History::new(dir),
        )
    }

    fn always_on() -> LightSchedule {
        LightSchedule {
            enabled: true,
            on_time: "00:00".to_string(),
            off_time: "23:59".to_string(),
        }
    }

    #[tokio::test]
    async fn repeated_evaluations_write_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = test_scheduler(tx, "idempotent");
        scheduler.set_schedule(always_on()).await.unwrap();

        scheduler.evaluate().await.unwrap();
        scheduler.evaluate().await.unwrap();

        assert_eq!(rx.recv().await, Some(("light".to_string(), true)));
        assert!(rx.try_recv().is_err(), "second evaluation must not write");
    }

    #[tokio::test]
    async fn manual_mode_suspends_the_schedule() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = test_scheduler(tx, "manual");
        scheduler.set_schedule(always_on()).await.unwrap();
        scheduler.set_mode(LightMode::Manual).await.unwrap();

        scheduler.evaluate().await.unwrap();
        assert!(rx.try_recv().is_err());

        // Returning to schedule mode re-applies.
        scheduler.set_mode(LightMode::Schedule).await.unwrap();
        scheduler.evaluate().await.unwrap();
        assert_eq!(rx.recv().await, Some(("light".to_string(), true)));
    }

    #[tokio::test]
    async fn invalid_schedule_is_rejected_and_not_persisted() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let scheduler = test_scheduler(tx, "invalid");

        let bad = LightSchedule {
            enabled: true,
            on_time: "24:00".to_string(),
            off_time: "06:00".to_string(),
        };
        assert!(scheduler.set_schedule(bad).await.is_err());
        assert_eq!(
            scheduler.store.load_light_schedule().await.unwrap(),
            LightSchedule::default()
        );
    }
}

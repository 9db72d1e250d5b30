//! Predictive advisor.
//!
//! A conditioned-mean trend model over the recent sample history: for every
//! combination of climate actuator states it learns the mean change in
//! temperature and humidity over the prediction horizon, and forecasts by
//! adding that mean to the current reading. Any failure here degrades the
//! climate loop to purely reactive control; it never stops it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use greenhouse_common::{ClimateReading, ClimateStates, Prediction};

use crate::history::{History, SensorSample};

const HORIZON_SECONDS: f64 = 600.0;
/// Pair samples within this slack of the horizon.
const HORIZON_SLACK_SECONDS: f64 = 120.0;
const MIN_TRAINING_SAMPLES: usize = 100;
const TRAINING_WINDOW_HOURS: f64 = 72.0;
const RETRAIN_INTERVAL_SECONDS: u64 = 900;

/// Mean deltas over the horizon, one bucket per actuator combination plus a
/// global fallback for combinations never observed.
#[derive(Debug, Clone)]
pub struct TrendModel {
    temp_delta: [Bucket; 2],
    humidity_delta: [Bucket; 4],
    overall_temp: Bucket,
    overall_humidity: Bucket,
    pub trained_on: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    sum: f64,
    count: u32,
}

impl Bucket {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn mean(&self) -> Option<f32> {
        (self.count > 0).then(|| (self.sum / f64::from(self.count)) as f32)
    }
}

fn humidity_bucket(states: ClimateStates) -> usize {
    usize::from(states.humidifier) | (usize::from(states.dehumidifier) << 1)
}

impl TrendModel {
    /// Fit from time-ordered samples. Pairs each sample with the first one
    /// roughly a horizon later and buckets the observed deltas by the
    /// actuator states at the start of the interval.
    pub fn fit(samples: &[SensorSample]) -> Option<Self> {
        if samples.len() < MIN_TRAINING_SAMPLES {
            return None;
        }

        let mut model = TrendModel {
            temp_delta: [Bucket::default(); 2],
            humidity_delta: [Bucket::default(); 4],
            overall_temp: Bucket::default(),
            overall_humidity: Bucket::default(),
            trained_on: 0,
        };

        let mut later = 0usize;
        for (index, start) in samples.iter().enumerate() {
            let target_time = start.timestamp + HORIZON_SECONDS;
            if later <= index {
                later = index + 1;
            }
            while later < samples.len() && samples[later].timestamp < target_time {
                later += 1;
            }
            let Some(end) = samples.get(later) else {
                break;
            };
            if end.timestamp - target_time > HORIZON_SLACK_SECONDS {
                continue;
            }

            let temp_delta = f64::from(end.temperature - start.temperature);
            let humidity_delta = f64::from(end.humidity - start.humidity);
            let states = ClimateStates {
                heater: start.heater,
                humidifier: start.humidifier,
                dehumidifier: start.dehumidifier,
            };

            model.temp_delta[usize::from(states.heater)].push(temp_delta);
            model.humidity_delta[humidity_bucket(states)].push(humidity_delta);
            model.overall_temp.push(temp_delta);
            model.overall_humidity.push(humidity_delta);
            model.trained_on += 1;
        }

        if model.trained_on < MIN_TRAINING_SAMPLES / 2 {
            return None;
        }
        Some(model)
    }

    pub fn predict(&self, reading: ClimateReading, states: ClimateStates) -> Option<Prediction> {
        let temp_delta = self.temp_delta[usize::from(states.heater)]
            .mean()
            .or_else(|| self.overall_temp.mean())?;
        let humidity_delta = self.humidity_delta[humidity_bucket(states)]
            .mean()
            .or_else(|| self.overall_humidity.mean())?;

        Some(Prediction {
            temperature: reading.temperature + temp_delta,
            humidity: reading.humidity + humidity_delta,
            temp_delta,
            humidity_delta,
        })
    }
}

pub struct Predictor {
    model: RwLock<Option<Arc<TrendModel>>>,
    history: History,
    training: AtomicBool,
    last_train_epoch: AtomicU64,
}

impl Predictor {
    pub fn new(history: History) -> Self {
        Self {
            model: RwLock::new(None),
            history,
            training: AtomicBool::new(false),
            last_train_epoch: AtomicU64::new(0),
        }
    }

    /// Forecast for the horizon, or `None` when no model is ready. Never
    /// blocks on training.
    pub fn predict(&self, reading: ClimateReading, states: ClimateStates) -> Option<Prediction> {
        let model = self.model.read().ok()?.clone()?;
        model.predict(reading, states)
    }

    pub fn is_trained(&self) -> bool {
        self.model
            .read()
            .map(|model| model.is_some())
            .unwrap_or(false)
    }

    fn should_retrain(&self, now_epoch: u64) -> bool {
        let last = self.last_train_epoch.load(Ordering::Relaxed);
        last == 0 || now_epoch.saturating_sub(last) > RETRAIN_INTERVAL_SECONDS
    }

    /// Kick off a background fit if one is due and none is running.
    pub fn maybe_spawn_retrain(self: &Arc<Self>, now_epoch: u64) {
        if !self.should_retrain(now_epoch) {
            return;
        }
        if self
            .training
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let predictor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = predictor.retrain(now_epoch).await {
                warn!("model retrain failed: {err:#}");
            }
            predictor.training.store(false, Ordering::Release);
        });
    }

    async fn retrain(&self, now_epoch: u64) -> anyhow::Result<()> {
        let mut samples = self.history.recent_samples(TRAINING_WINDOW_HOURS).await?;
        samples.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

        match TrendModel::fit(&samples) {
            Some(model) => {
                let trained_on = model.trained_on;
                if let Ok(mut slot) = self.model.write() {
                    *slot = Some(Arc::new(model));
                }
                self.last_train_epoch.store(now_epoch, Ordering::Relaxed);
                info!(trained_on, "trend model retrained");
            }
            None => {
                // Not enough history yet; check again next interval.
                self.last_train_epoch.store(now_epoch, Ordering::Relaxed);
                debug!(samples = samples.len(), "not enough history to train");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Alternating 30-minute heater-on and heater-off stretches, 30 s apart:
    /// +0.05 °C per step while heating, -0.05 °C while idle.
    fn synthetic_samples() -> Vec<SensorSample> {
        let mut samples = Vec::new();
        let mut temperature = 20.0f32;
        for step in 0..600 {
            let heater = (step / 60) % 2 == 0;
            temperature += if heater { 0.05 } else { -0.05 };
            samples.push(SensorSample {
                timestamp: step as f64 * 30.0,
                temperature,
                humidity: 60.0,
                heater,
                humidifier: false,
                dehumidifier: false,
            });
        }
        samples
    }

    #[test]
    fn fit_requires_enough_samples() {
        let samples = synthetic_samples();
        assert!(TrendModel::fit(&samples[..50]).is_none());
        assert!(TrendModel::fit(&samples).is_some());
    }

    #[test]
    fn heating_trend_is_conditioned_on_heater_state() {
        let model = TrendModel::fit(&synthetic_samples()).unwrap();
        let reading = ClimateReading {
            temperature: 21.0,
            humidity: 60.0,
        };

        let heating = model
            .predict(
                reading,
                ClimateStates {
                    heater: true,
                    ..ClimateStates::default()
                },
            )
            .unwrap();
        let idle = model.predict(reading, ClimateStates::default()).unwrap();

        assert!(heating.temp_delta > 0.0, "delta={}", heating.temp_delta);
        assert!(idle.temp_delta < 0.0, "delta={}", idle.temp_delta);
        assert!(heating.temperature > idle.temperature);
    }

    #[test]
    fn flat_humidity_predicts_no_change() {
        let model = TrendModel::fit(&synthetic_samples()).unwrap();
        let prediction = model
            .predict(
                ClimateReading {
                    temperature: 21.0,
                    humidity: 60.0,
                },
                ClimateStates::default(),
            )
            .unwrap();
        assert!(prediction.humidity_delta.abs() < 0.01);
        assert_eq!(prediction.humidity, 60.0 + prediction.humidity_delta);
    }

    #[tokio::test]
    async fn untrained_predictor_returns_none() {
        let dir = std::env::temp_dir().join(format!(
            "greenhouse-predictor-{}",
            std::process::id()
        ));
        let predictor = Predictor::new(History::new(dir));
        assert!(predictor
            .predict(
                ClimateReading {
                    temperature: 21.0,
                    humidity: 60.0
                },
                ClimateStates::default()
            )
            .is_none());
    }
}

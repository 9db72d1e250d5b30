//! Append-only JSONL history: sensor samples and actuator transitions.
//!
//! Writes are best-effort; the control loops log a warning and carry on if
//! an append fails. Reads skip malformed lines so one bad record never
//! poisons the file.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use greenhouse_common::{Actuator, TriggerMode};

/// Seconds of history the retraining window and API ever ask for; pruning
/// keeps a little more than this.
pub const RETENTION_HOURS: f64 = 96.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RelayEvent {
    /// Epoch seconds.
    pub timestamp: f64,
    pub actuator: Actuator,
    pub state: bool,
    pub mode: TriggerMode,
}

/// One sensor reading plus the climate actuator states at sampling time, so
/// model training never has to join against the transition log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SensorSample {
    /// Epoch seconds.
    pub timestamp: f64,
    pub temperature: f32,
    pub humidity: f32,
    pub heater: bool,
    pub humidifier: bool,
    pub dehumidifier: bool,
}

pub fn epoch_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1_000.0
}

#[derive(Clone)]
pub struct History {
    samples_path: Arc<PathBuf>,
    events_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl History {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            samples_path: Arc::new(data_dir.join("sensor_history.jsonl")),
            events_path: Arc::new(data_dir.join("relay_history.jsonl")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn log_sample(&self, sample: &SensorSample) -> anyhow::Result<()> {
        self.append(&self.samples_path, sample).await
    }

    pub async fn log_transition(
        &self,
        actuator: Actuator,
        state: bool,
        mode: TriggerMode,
    ) -> anyhow::Result<()> {
        self.append(
            &self.events_path,
            &RelayEvent {
                timestamp: epoch_seconds(),
                actuator,
                state,
                mode,
            },
        )
        .await
    }

    pub async fn recent_samples(&self, hours: f64) -> anyhow::Result<Vec<SensorSample>> {
        let cutoff = epoch_seconds() - hours * 3_600.0;
        let mut samples: Vec<SensorSample> = self.read_all(&self.samples_path).await?;
        samples.retain(|s| s.timestamp >= cutoff);
        Ok(samples)
    }

    pub async fn recent_transitions(&self, hours: f64) -> anyhow::Result<Vec<RelayEvent>> {
        let cutoff = epoch_seconds() - hours * 3_600.0;
        let mut events: Vec<RelayEvent> = self.read_all(&self.events_path).await?;
        events.retain(|e| e.timestamp >= cutoff);
        Ok(events)
    }

    /// Rewrite both files keeping only the retention window.
    pub async fn prune(&self) -> anyhow::Result<()> {
        let cutoff = epoch_seconds() - RETENTION_HOURS * 3_600.0;

        let samples: Vec<SensorSample> = self.read_all(&self.samples_path).await?;
        self.rewrite(
            &self.samples_path,
            samples.iter().filter(|s| s.timestamp >= cutoff),
        )
        .await?;

        let events: Vec<RelayEvent> = self.read_all(&self.events_path).await?;
        self.rewrite(
            &self.events_path,
            events.iter().filter(|e| e.timestamp >= cutoff),
        )
        .await
    }

    async fn append<T: Serialize>(&self, path: &PathBuf, record: &T) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_path())
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }

    async fn read_all<T: DeserializeOwned>(&self, path: &PathBuf) -> anyhow::Result<Vec<T>> {
        let _guard = self.lock.lock().await;
        let raw = match tokio::fs::read_to_string(path.as_path()).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    async fn rewrite<'a, T: Serialize + 'a>(
        &self,
        path: &PathBuf,
        records: impl Iterator<Item = &'a T>,
    ) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut body = Vec::new();
        for record in records {
            body.extend(serde_json::to_vec(record)?);
            body.push(b'\n');
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path.as_path(), body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn temp_history(tag: &str) -> History {
        let dir =
            std::env::temp_dir().join(format!("greenhouse-history-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        History::new(dir)
    }

    fn sample(timestamp: f64, temperature: f32) -> SensorSample {
        SensorSample {
            timestamp,
            temperature,
            humidity: 60.0,
            heater: false,
            humidifier: false,
            dehumidifier: false,
        }
    }

    #[tokio::test]
    async fn recent_samples_filters_by_age() {
        let history = temp_history("recent");
        let now = epoch_seconds();

        history.log_sample(&sample(now - 7_200.0, 20.0)).await.unwrap();
        history.log_sample(&sample(now - 60.0, 21.0)).await.unwrap();

        let recent = history.recent_samples(1.0).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].temperature, 21.0);

        let all = history.recent_samples(3.0).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let history = temp_history("malformed");
        let now = epoch_seconds();
        history.log_sample(&sample(now, 21.0)).await.unwrap();

        // Corrupt the file with a half-written line.
        let path = history.samples_path.as_path().to_path_buf();
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"timestamp\": 12\n");
        std::fs::write(&path, raw).unwrap();

        let recent = history.recent_samples(1.0).await.unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn prune_drops_expired_records() {
        let history = temp_history("prune");
        let now = epoch_seconds();

        history
            .log_sample(&sample(now - (RETENTION_HOURS + 1.0) * 3_600.0, 18.0))
            .await
            .unwrap();
        history.log_sample(&sample(now, 21.0)).await.unwrap();
        history.prune().await.unwrap();

        let all = history.recent_samples(RETENTION_HOURS * 2.0).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].temperature, 21.0);
    }
}

//! Persistent settings and schedule documents.
//!
//! Settings are a flat string map like the original key/value table;
//! schedules are their own JSON documents. One lock serializes all disk
//! access, and a missing file reads back as the defaults.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use greenhouse_common::{LightSchedule, TempSchedule};

#[derive(Clone)]
pub struct Store {
    settings_path: Arc<PathBuf>,
    light_path: Arc<PathBuf>,
    temp_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

pub fn default_settings() -> HashMap<String, String> {
    [
        ("mode", "manual"),
        ("target_temp", "22.0"),
        ("temp_tolerance", "1.0"),
        ("target_humidity", "60.0"),
        ("humidity_tolerance", "5.0"),
        ("light_mode", "schedule"),
        ("use_ml", "true"),
        ("timezone", "UTC"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Store {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            settings_path: Arc::new(data_dir.join("settings.json")),
            light_path: Arc::new(data_dir.join("light_schedule.json")),
            temp_path: Arc::new(data_dir.join("temp_schedule.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load_settings(&self) -> anyhow::Result<HashMap<String, String>> {
        let loaded: Option<HashMap<String, String>> = self.load(&self.settings_path).await?;
        // Missing keys fall back to defaults so new settings pick up a value
        // on upgrade without a migration.
        let mut settings = default_settings();
        if let Some(loaded) = loaded {
            settings.extend(loaded);
        }
        Ok(settings)
    }

    pub async fn save_settings(&self, settings: &HashMap<String, String>) -> anyhow::Result<()> {
        self.save(&self.settings_path, settings).await
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut settings = self.load_settings().await?;
        settings.insert(key.to_string(), value.to_string());
        self.save_settings(&settings).await
    }

    pub async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.load_settings().await?.get(key).cloned())
    }

    pub async fn load_light_schedule(&self) -> anyhow::Result<LightSchedule> {
        Ok(self
            .load(&self.light_path)
            .await?
            .unwrap_or_default())
    }

    pub async fn save_light_schedule(&self, schedule: &LightSchedule) -> anyhow::Result<()> {
        self.save(&self.light_path, schedule).await
    }

    pub async fn load_temp_schedule(&self) -> anyhow::Result<TempSchedule> {
        let mut schedule: TempSchedule = self
            .load(&self.temp_path)
            .await?
            .unwrap_or_default();
        schedule.normalize();
        Ok(schedule)
    }

    pub async fn save_temp_schedule(&self, schedule: &TempSchedule) -> anyhow::Result<()> {
        self.save(&self.temp_path, schedule).await
    }

    async fn load<T: DeserializeOwned>(&self, path: &PathBuf) -> anyhow::Result<Option<T>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(path.as_path()).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save<T: Serialize>(&self, path: &PathBuf, value: &T) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(path.as_path(), payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn temp_store(tag: &str) -> Store {
        let dir =
            std::env::temp_dir().join(format!("greenhouse-store-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        Store::new(dir)
    }

    #[tokio::test]
    async fn missing_files_read_back_as_defaults() {
        let store = temp_store("defaults");
        let settings = store.load_settings().await.unwrap();
        assert_eq!(settings.get("mode").map(String::as_str), Some("manual"));
        assert_eq!(
            settings.get("light_mode").map(String::as_str),
            Some("schedule")
        );

        let light = store.load_light_schedule().await.unwrap();
        assert_eq!(light, LightSchedule::default());
    }

    #[tokio::test]
    async fn set_setting_round_trips() {
        let store = temp_store("roundtrip");
        store.set_setting("target_temp", "25.5").await.unwrap();
        assert_eq!(
            store.get_setting("target_temp").await.unwrap().as_deref(),
            Some("25.5")
        );
        // Untouched keys keep their defaults.
        assert_eq!(
            store.get_setting("mode").await.unwrap().as_deref(),
            Some("manual")
        );
    }
}

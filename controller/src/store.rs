use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{watch, Mutex};

use fanwatch_common::{AlarmConfig, AlarmSettings, RuntimeConfig};

use crate::services::AlarmConfigStore;

/// `runtime.json` under the data directory.
#[derive(Clone)]
pub struct RuntimeStore {
    data_dir: Arc<PathBuf>,
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl RuntimeStore {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("FANWATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.fanwatch"));
        Self::new(data_dir)
    }

    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            data_dir: Arc::new(data_dir),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn data_dir(&self) -> &Path {
        self.data_dir.as_ref()
    }

    pub async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => {
                let mut runtime = serde_json::from_slice::<RuntimeConfig>(&raw)
                    .with_context(|| format!("invalid {}", self.runtime_path.display()))?;
                runtime.sanitize();
                Ok(runtime)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    /// Read-modify-write of the persisted config.
    pub async fn update(
        &self,
        change: impl FnOnce(&mut RuntimeConfig),
    ) -> anyhow::Result<RuntimeConfig> {
        let mut runtime = self.load_runtime_config().await?;
        change(&mut runtime);
        runtime.sanitize();
        self.save_runtime_config(&runtime).await?;
        Ok(runtime)
    }
}

/// Live alarm settings shared by the API, the weather monitor and the notifier. Receivers from
/// [`AlarmHandle::changes`] see every replacement.
#[derive(Clone)]
pub struct AlarmHandle {
    settings: Arc<watch::Sender<AlarmSettings>>,
}

impl Default for AlarmHandle {
    fn default() -> Self {
        Self::new(AlarmSettings::default())
    }
}

impl AlarmHandle {
    pub fn new(settings: AlarmSettings) -> Self {
        let (settings, _) = watch::channel(settings);
        Self {
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> AlarmSettings {
        self.settings.borrow().clone()
    }

    pub fn changes(&self) -> watch::Receiver<AlarmSettings> {
        self.settings.subscribe()
    }

    pub fn replace(&self, mut settings: AlarmSettings) -> AlarmSettings {
        settings.sanitize();
        self.settings.send_replace(settings.clone());
        settings
    }

    /// Writes `settings` to `runtime.json` and only makes them live once that succeeded.
    pub async fn save(
        &self,
        store: &RuntimeStore,
        settings: AlarmSettings,
    ) -> anyhow::Result<AlarmSettings> {
        let runtime = store.update(move |runtime| runtime.alarm = settings).await?;
        Ok(self.replace(runtime.alarm))
    }
}

#[async_trait]
impl AlarmConfigStore for AlarmHandle {
    async fn read(&self) -> AlarmConfig {
        self.settings.borrow().alarm_config()
    }
}

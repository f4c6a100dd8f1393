use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use fanwatch_common::{AlarmConfig, Coordinate, DecodeError, DeviceState, Directive, Forecast};

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("no location configured")]
    NoLocation,
    #[error("weather url is invalid: {0}")]
    BadUrl(String),
    #[error("weather response could not be decoded: {0}")]
    Decode(String),
    #[error("weather server returned status {0}")]
    Server(u16),
    #[error("forecast was refreshed too recently")]
    Throttled,
    #[error("weather request failed after repeated attempts")]
    TooManyRetries,
    #[error("weather request failed: {0}")]
    Network(String),
}

impl ForecastError {
    /// Errors worth another attempt within the same refresh.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Server(code) => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device address is invalid: {0}")]
    BadUrl(String),
    #[error("device did not answer in time")]
    Timeout,
    #[error("device request failed: {0}")]
    Network(String),
    #[error("device returned status {0}")]
    Server(u16),
    #[error("device reply could not be decoded: {0}")]
    Decode(#[from] DecodeError),
}

#[async_trait]
pub trait ForecastStore: Send + Sync {
    async fn read(&self) -> Option<Forecast>;

    async fn last_update(&self) -> Option<DateTime<Utc>>;

    async fn write(&self, forecast: Forecast) -> anyhow::Result<()>;

    async fn refresh_from_network(
        &self,
        coordinate: Option<Coordinate>,
    ) -> Result<Forecast, ForecastError>;
}

#[async_trait]
pub trait AlarmConfigStore: Send + Sync {
    async fn read(&self) -> AlarmConfig;
}

#[async_trait]
pub trait NotificationAuthority: Send + Sync {
    async fn is_authorized(&self) -> bool;

    async fn issue(&self, title: &str, subtitle: &str, body: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn send(
        &self,
        ip_address: &str,
        directive: Directive,
    ) -> Result<DeviceState, DeviceError>;
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn list(&self) -> Vec<String>;

    async fn add(&self, ip_address: &str);

    async fn mark_suppressed(&self, ip_address: &str);

    async fn is_suppressed(&self, ip_address: &str) -> bool;

    async fn clear_suppressed(&self, ip_address: &str);
}

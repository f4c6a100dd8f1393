use std::{io::ErrorKind, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use fanwatch_common::{
    millis, Coordinate, Forecast, ForecastPoint, MonitorConfig, SchedulerConfig,
};

use crate::{
    retry::retry_with_backoff,
    services::{ForecastError, ForecastStore},
};

#[derive(Debug, Deserialize)]
struct OneCallResponse {
    current: OneCallCurrent,
    #[serde(default)]
    hourly: Vec<OneCallHour>,
}

#[derive(Debug, Deserialize)]
struct OneCallCurrent {
    temp: f64,
}

#[derive(Debug, Deserialize)]
struct OneCallHour {
    dt: i64,
    temp: f64,
}

/// Turns a one-call style payload (Fahrenheit units) into a forecast stamped `fetched_at`.
pub fn parse_one_call(body: &str, fetched_at: DateTime<Utc>) -> Result<Forecast, ForecastError> {
    let response: OneCallResponse =
        serde_json::from_str(body).map_err(|err| ForecastError::Decode(err.to_string()))?;

    let points = response
        .hourly
        .into_iter()
        .filter_map(|hour| {
            DateTime::<Utc>::from_timestamp(hour.dt, 0)
                .map(|timestamp| ForecastPoint::new(timestamp, hour.temp))
        })
        .collect();

    Ok(Forecast::new(response.current.temp, points, fetched_at))
}

#[derive(Clone)]
pub struct WeatherClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl WeatherClient {
    pub fn new(base_url: &str, api_key: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build weather http client")?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn url(&self, coordinate: Coordinate) -> Result<Url, ForecastError> {
        Url::parse_with_params(
            &self.base_url,
            &[
                ("lat", coordinate.latitude.to_string()),
                ("lon", coordinate.longitude.to_string()),
                ("units", "imperial".to_string()),
                ("exclude", "minutely,daily,alerts".to_string()),
                ("appid", self.api_key.clone()),
            ],
        )
        .map_err(|err| ForecastError::BadUrl(err.to_string()))
    }

    pub async fn fetch(&self, coordinate: Coordinate) -> Result<Forecast, ForecastError> {
        let url = self.url(coordinate)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ForecastError::Network(err.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ForecastError::Server(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|err| ForecastError::Network(err.to_string()))?;
        parse_one_call(&body, Utc::now())
    }
}

/// Cached forecast in `forecast.json`, refreshed through the weather client.
#[derive(Clone)]
pub struct FileForecastStore {
    path: Arc<PathBuf>,
    client: WeatherClient,
    lock: Arc<Mutex<()>>,
    retry_attempts: u32,
    retry_base_delay: Duration,
    min_refresh_interval: chrono::Duration,
}

impl FileForecastStore {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        client: WeatherClient,
        monitor: &MonitorConfig,
        scheduler: &SchedulerConfig,
    ) -> Self {
        Self {
            path: Arc::new(data_dir.into().join("forecast.json")),
            client,
            lock: Arc::new(Mutex::new(())),
            retry_attempts: monitor.retry_attempts,
            retry_base_delay: Duration::from_millis(monitor.retry_base_delay_ms),
            min_refresh_interval: millis(scheduler.min_refresh_interval_ms),
        }
    }

    async fn load(&self) -> anyhow::Result<Option<Forecast>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.path.as_ref()).await {
            Ok(raw) => Ok(Some(serde_json::from_slice::<Forecast>(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ForecastStore for FileForecastStore {
    async fn read(&self) -> Option<Forecast> {
        self.load().await.unwrap_or_else(|err| {
            warn!("failed to read cached forecast: {err:#}");
            None
        })
    }

    async fn last_update(&self) -> Option<DateTime<Utc>> {
        self.read().await.map(|forecast| forecast.fetched_at)
    }

    async fn write(&self, forecast: Forecast) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(&forecast)?;
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    async fn refresh_from_network(
        &self,
        coordinate: Option<Coordinate>,
    ) -> Result<Forecast, ForecastError> {
        let coordinate = coordinate.ok_or(ForecastError::NoLocation)?;

        if let Some(last) = self.last_update().await {
            if Utc::now() - last < self.min_refresh_interval {
                return Err(ForecastError::Throttled);
            }
        }

        let forecast = retry_with_backoff(
            self.retry_attempts,
            self.retry_base_delay,
            ForecastError::is_transient,
            |_| ForecastError::TooManyRetries,
            || self.client.fetch(coordinate),
        )
        .await?;

        info!(
            "forecast refreshed: {:.1}F now, {} hourly points",
            forecast.current_temperature,
            forecast.points.len()
        );
        if let Err(err) = self.write(forecast.clone()).await {
            warn!("failed to cache forecast: {err:#}");
        }
        Ok(forecast)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::{http::StatusCode as AxumStatus, response::IntoResponse, routing::get, Router};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    use super::*;

    const ONE_CALL: &str = r#"{
        "lat": 37.77, "lon": -122.42,
        "current": {"dt": 1700000000, "temp": 71.5, "humidity": 40},
        "hourly": [
            {"dt": 1700007200, "temp": 70.1},
            {"dt": 1700003600, "temp": 72.4, "humidity": 38}
        ]
    }"#;

    fn coordinate() -> Coordinate {
        Coordinate {
            latitude: 37.77,
            longitude: -122.42,
        }
    }

    fn fast_monitor() -> MonitorConfig {
        MonitorConfig {
            retry_base_delay_ms: 10,
            ..MonitorConfig::default()
        }
    }

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/onecall")
    }

    #[test]
    fn parses_current_and_sorted_hourly_points() {
        let fetched_at = Utc.with_ymd_and_hms(2023, 11, 14, 22, 0, 0).unwrap();
        let forecast = parse_one_call(ONE_CALL, fetched_at).unwrap();

        assert_eq!(forecast.current_temperature, 71.5);
        assert_eq!(forecast.fetched_at, fetched_at);
        let temps: Vec<f64> = forecast.points.iter().map(|p| p.temperature).collect();
        assert_eq!(temps, vec![72.4, 70.1]);
    }

    #[test]
    fn missing_current_block_is_a_decode_error() {
        let err = parse_one_call(r#"{"hourly": []}"#, Utc::now()).unwrap_err();
        assert!(matches!(err, ForecastError::Decode(_)));
    }

    #[tokio::test]
    async fn refresh_retries_server_errors_then_caches() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/onecall",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        AxumStatus::BAD_GATEWAY.into_response()
                    } else {
                        ONE_CALL.into_response()
                    }
                }
            }),
        );
        let url = serve(app).await;
        let dir = TempDir::new().unwrap();
        let client = WeatherClient::new(&url, "key", Duration::from_secs(5)).unwrap();
        let store = FileForecastStore::new(
            dir.path(),
            client,
            &fast_monitor(),
            &SchedulerConfig::default(),
        );

        let forecast = store.refresh_from_network(Some(coordinate())).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let cached = store.read().await.unwrap();
        assert_eq!(cached.fetched_at, forecast.fetched_at);
        assert_eq!(cached.points.len(), 2);

        // A second refresh right away is throttled and never reaches the server.
        let err = store.refresh_from_network(Some(coordinate())).await.unwrap_err();
        assert!(matches!(err, ForecastError::Throttled));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_location_is_not_attempted() {
        let dir = TempDir::new().unwrap();
        let client = WeatherClient::new("http://127.0.0.1:9/onecall", "key", Duration::from_secs(1))
            .unwrap();
        let store = FileForecastStore::new(
            dir.path(),
            client,
            &fast_monitor(),
            &SchedulerConfig::default(),
        );

        let err = store.refresh_from_network(None).await.unwrap_err();

        assert!(matches!(err, ForecastError::NoLocation));
        assert_eq!(store.read().await, None);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/onecall",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { AxumStatus::UNAUTHORIZED }
            }),
        );
        let url = serve(app).await;
        let dir = TempDir::new().unwrap();
        let client = WeatherClient::new(&url, "bad", Duration::from_secs(5)).unwrap();
        let store = FileForecastStore::new(
            dir.path(),
            client,
            &fast_monitor(),
            &SchedulerConfig::default(),
        );

        let err = store.refresh_from_network(Some(coordinate())).await.unwrap_err();

        assert!(matches!(err, ForecastError::Server(401)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

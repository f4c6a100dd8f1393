use serde::{Deserialize, Serialize};

use crate::types::{AlarmConfig, ComfortBounds, Coordinate};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub idle_interval_ms: u64,
    pub min_refresh_interval_ms: u64,
    pub max_forecast_age_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: 43_200_000,
            min_refresh_interval_ms: 900_000,
            max_forecast_age_ms: 86_400_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    pub speed_attempts: u32,
    pub timer_attempts: u32,
    pub unresponsive_strikes: u32,
    pub speed_unresponsive_wait_ms: u64,
    pub timer_unresponsive_wait_ms: u64,
    pub settle_delay_ms: u64,
    pub max_timer_minutes: i32,
    pub timer_margin_minutes: i32,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            speed_attempts: 12,
            timer_attempts: 17,
            unresponsive_strikes: 3,
            speed_unresponsive_wait_ms: 4_000,
            timer_unresponsive_wait_ms: 3_000,
            settle_delay_ms: 1_000,
            max_timer_minutes: 720,
            timer_margin_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub interlock_poll_interval_ms: u64,
    pub device_request_timeout_ms: u64,
    pub interlock_aggregate_timeout_ms: u64,
    pub scan_aggregate_timeout_ms: u64,
    pub alert_cooldown_ms: u64,
    pub state_publish_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interlock_poll_interval_ms: 600_000,
            device_request_timeout_ms: 5_000,
            interlock_aggregate_timeout_ms: 20_000,
            scan_aggregate_timeout_ms: 30_000,
            alert_cooldown_ms: 3_600_000,
            state_publish_interval_ms: 10_000,
            retry_attempts: 3,
            retry_base_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmSettings {
    pub enabled: bool,
    pub low_f: Option<f64>,
    pub high_f: Option<f64>,
    pub notifications_enabled: bool,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            low_f: None,
            high_f: None,
            notifications_enabled: true,
        }
    }
}

impl AlarmSettings {
    pub fn sanitize(&mut self) {
        self.low_f = self.low_f.filter(|t| t.is_finite()).map(|t| t.clamp(-20.0, 120.0));
        self.high_f = self.high_f.filter(|t| t.is_finite()).map(|t| t.clamp(-20.0, 120.0));

        if let (Some(low), Some(high)) = (self.low_f, self.high_f) {
            if low > high {
                self.low_f = Some(high);
                self.high_f = Some(low);
            }
        }
    }

    pub fn alarm_config(&self) -> AlarmConfig {
        AlarmConfig {
            enabled: self.enabled,
            bounds: ComfortBounds {
                low: self.low_f,
                high: self.high_f,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub weather_url: String,
    pub weather_api_key: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            weather_url: "https://api.openweathermap.org/data/3.0/onecall".to_string(),
            weather_api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub convergence: ConvergenceConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    pub alarm: AlarmSettings,
    pub coordinate: Option<Coordinate>,
    #[serde(default)]
    pub devices: Vec<String>,
    pub timezone: String,
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            convergence: ConvergenceConfig::default(),
            monitor: MonitorConfig::default(),
            alarm: AlarmSettings::default(),
            coordinate: None,
            devices: Vec::new(),
            timezone: "America/Los_Angeles".to_string(),
            network: NetworkConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.alarm.sanitize();
        self.coordinate = self.coordinate.filter(Coordinate::is_valid);
        self.devices.retain(|address| !address.trim().is_empty());
        self.devices.sort();
        self.devices.dedup();

        self.scheduler.sanitize();
        self.convergence.sanitize();
        self.monitor.sanitize();
    }
}

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

impl SchedulerConfig {
    pub fn sanitize(&mut self) {
        self.idle_interval_ms = self.idle_interval_ms.clamp(MINUTE_MS, 7 * DAY_MS);
        self.min_refresh_interval_ms = self.min_refresh_interval_ms.clamp(MINUTE_MS, DAY_MS);
        self.max_forecast_age_ms = self.max_forecast_age_ms.clamp(HOUR_MS, 7 * DAY_MS);
    }
}

impl ConvergenceConfig {
    pub fn sanitize(&mut self) {
        self.speed_attempts = self.speed_attempts.clamp(1, 50);
        self.timer_attempts = self.timer_attempts.clamp(1, 50);
        self.unresponsive_strikes = self.unresponsive_strikes.clamp(1, 10);
        self.speed_unresponsive_wait_ms = self.speed_unresponsive_wait_ms.min(MINUTE_MS);
        self.timer_unresponsive_wait_ms = self.timer_unresponsive_wait_ms.min(MINUTE_MS);
        self.settle_delay_ms = self.settle_delay_ms.min(MINUTE_MS);
        self.max_timer_minutes = self.max_timer_minutes.clamp(60, 720);
        self.timer_margin_minutes = self.timer_margin_minutes.clamp(0, 59);
    }
}

impl MonitorConfig {
    /// Keeps every period non-zero; `tokio::time::interval` rejects a zero period.
    pub fn sanitize(&mut self) {
        self.interlock_poll_interval_ms =
            self.interlock_poll_interval_ms.clamp(10 * SECOND_MS, DAY_MS);
        self.device_request_timeout_ms = self.device_request_timeout_ms.clamp(100, MINUTE_MS);
        self.interlock_aggregate_timeout_ms =
            self.interlock_aggregate_timeout_ms.clamp(SECOND_MS, 5 * MINUTE_MS);
        self.scan_aggregate_timeout_ms =
            self.scan_aggregate_timeout_ms.clamp(SECOND_MS, 5 * MINUTE_MS);
        self.alert_cooldown_ms = self.alert_cooldown_ms.min(DAY_MS);
        self.state_publish_interval_ms = self.state_publish_interval_ms.clamp(SECOND_MS, HOUR_MS);
        self.retry_attempts = self.retry_attempts.clamp(1, 10);
        self.retry_base_delay_ms = self.retry_base_delay_ms.min(MINUTE_MS);
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Address used for placeholder devices that have no real hardware behind them.
pub const INVALID_ADDRESS: &str = "INVALID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Directive {
    Refresh,
    Increase,
    Decrease,
    ResetToZero,
    AdvanceTimer,
}

impl Directive {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Refresh => "REFRESH",
            Self::Increase => "INCREASE",
            Self::Decrease => "DECREASE",
            Self::ResetToZero => "RESET_TO_ZERO",
            Self::AdvanceTimer => "ADVANCE_TIMER",
        }
    }

    /// Value of the `dir` query parameter understood by the fan's status endpoint.
    pub fn code(self) -> u8 {
        match self {
            Self::Refresh => 0,
            Self::Increase => 1,
            Self::AdvanceTimer => 2,
            Self::Decrease => 3,
            Self::ResetToZero => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Refresh),
            1 => Some(Self::Increase),
            2 => Some(Self::AdvanceTimer),
            3 => Some(Self::Decrease),
            4 => Some(Self::ResetToZero),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "temperatureF")]
    pub temperature: f64,
}

impl ForecastPoint {
    pub fn new(timestamp: DateTime<Utc>, temperature: f64) -> Self {
        Self {
            timestamp,
            temperature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    #[serde(rename = "currentTemperatureF")]
    pub current_temperature: f64,
    pub points: Vec<ForecastPoint>,
    #[serde(rename = "fetchedAt")]
    pub fetched_at: DateTime<Utc>,
}

impl Forecast {
    pub fn new(
        current_temperature: f64,
        points: Vec<ForecastPoint>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let mut forecast = Self {
            current_temperature,
            points,
            fetched_at,
        };
        forecast.normalize();
        forecast
    }

    pub fn normalize(&mut self) {
        self.points.retain(|point| point.temperature.is_finite());
        self.points.sort_by_key(|point| point.timestamp);
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.fetched_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ComfortBounds {
    #[serde(rename = "lowF")]
    pub low: Option<f64>,
    #[serde(rename = "highF")]
    pub high: Option<f64>,
}

impl ComfortBounds {
    pub fn new(low: f64, high: f64) -> Self {
        Self {
            low: Some(low),
            high: Some(high),
        }
    }

    /// Both bounds, when both are configured.
    pub fn resolved(&self) -> Option<(f64, f64)> {
        Some((self.low?, self.high?))
    }

    pub fn is_too_hot(&self, temperature: f64) -> bool {
        self.high.map(|high| temperature > high).unwrap_or(false)
    }

    pub fn is_too_cold(&self, temperature: f64) -> bool {
        self.low.map(|low| temperature < low).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AlarmConfig {
    pub enabled: bool,
    pub bounds: ComfortBounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    #[serde(rename = "macAddress")]
    pub mac_address: String,
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
    pub speed: i32,
    #[serde(rename = "timerMinutes")]
    pub timer_minutes: i32,
    #[serde(rename = "damperOperating")]
    pub damper_operating: bool,
    pub interlock1: bool,
    pub interlock2: bool,
    pub model: Option<String>,
    #[serde(rename = "softwareVersion")]
    pub software_version: Option<String>,
    pub cfm: Option<i32>,
    #[serde(rename = "powerWatts")]
    pub power_watts: Option<i32>,
    #[serde(rename = "insideTempF")]
    pub inside_temp: Option<i32>,
    #[serde(rename = "atticTempF")]
    pub attic_temp: Option<i32>,
    #[serde(rename = "outsideTempF")]
    pub outside_temp: Option<i32>,
    pub setpoint: Option<i32>,
}

impl DeviceState {
    /// Minimal snapshot with every informational field absent.
    pub fn new(mac_address: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            mac_address: mac_address.into(),
            ip_address: ip_address.into(),
            speed: 0,
            timer_minutes: 0,
            damper_operating: false,
            interlock1: false,
            interlock2: false,
            model: None,
            software_version: None,
            cfm: None,
            power_watts: None,
            inside_temp: None,
            attic_temp: None,
            outside_temp: None,
            setpoint: None,
        }
    }

    pub fn is_operating(&self) -> bool {
        self.speed > 0
    }

    pub fn is_interlocked(&self) -> bool {
        self.interlock1 || self.interlock2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlertFlags {
    #[serde(rename = "tooHot")]
    pub too_hot: bool,
    #[serde(rename = "tooCold")]
    pub too_cold: bool,
    pub interlocked: bool,
}

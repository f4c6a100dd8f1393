//! In-memory collaborators shared by the controller's unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use fanwatch_common::{AlarmConfig, Coordinate, DeviceState, Directive, Forecast};

use crate::services::{
    AlarmConfigStore, DeviceError, DeviceTransport, ForecastError, ForecastStore,
    NotificationAuthority,
};

struct FakeFanState {
    device: DeviceState,
    frozen: bool,
    unreachable: bool,
    lag: u32,
    pending: Vec<(u32, Directive)>,
    sent: Vec<Directive>,
    adjustments: usize,
}

/// Single fan that applies directives immediately, after a lag, or never.
pub struct FakeFan {
    inner: Mutex<FakeFanState>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl FakeFan {
    fn build(speed: i32, timer_minutes: i32, frozen: bool, lag: u32) -> Self {
        let mut device = DeviceState::new("60:2D:3A:00:00:01", "10.0.0.40");
        device.speed = speed;
        device.timer_minutes = timer_minutes;
        Self {
            inner: Mutex::new(FakeFanState {
                device,
                frozen,
                unreachable: false,
                lag,
                pending: Vec::new(),
                sent: Vec::new(),
                adjustments: 0,
            }),
            cancel_after: None,
        }
    }

    pub fn responsive(speed: i32, timer_minutes: i32) -> Self {
        Self::build(speed, timer_minutes, false, 0)
    }

    pub fn laggy(speed: i32, lag: u32) -> Self {
        Self::build(speed, 0, false, lag)
    }

    pub fn frozen(speed: i32, timer_minutes: i32) -> Self {
        Self::build(speed, timer_minutes, true, 0)
    }

    pub fn unreachable() -> Self {
        let fan = Self::build(0, 0, true, 0);
        fan.inner.lock().unwrap().unreachable = true;
        fan
    }

    /// Cancels `token` while answering the `adjustments`-th non-refresh directive.
    pub fn cancel_after(mut self, adjustments: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((adjustments, token));
        self
    }

    pub fn sent(&self) -> Vec<Directive> {
        self.inner.lock().unwrap().sent.clone()
    }
}

fn apply(device: &mut DeviceState, directive: Directive) {
    match directive {
        Directive::Refresh => {}
        Directive::Increase => device.speed = (device.speed + 1).min(10),
        Directive::Decrease => device.speed = (device.speed - 1).max(0),
        Directive::ResetToZero => {
            device.speed = 0;
            device.timer_minutes = 0;
        }
        Directive::AdvanceTimer => device.timer_minutes = (device.timer_minutes + 60).min(720),
    }
}

#[async_trait]
impl DeviceTransport for FakeFan {
    async fn send(
        &self,
        _ip_address: &str,
        directive: Directive,
    ) -> Result<DeviceState, DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sent.push(directive);
        if inner.unreachable {
            return Err(DeviceError::Timeout);
        }

        if directive != Directive::Refresh {
            inner.adjustments += 1;
            if let Some((after, token)) = &self.cancel_after {
                if inner.adjustments == *after {
                    token.cancel();
                }
            }
        }

        if inner.frozen {
            return Ok(inner.device.clone());
        }

        let FakeFanState {
            device, pending, ..
        } = &mut *inner;
        for (countdown, _) in pending.iter_mut() {
            *countdown -= 1;
        }
        for (_, due) in pending.iter().filter(|(countdown, _)| *countdown == 0) {
            apply(device, *due);
        }
        pending.retain(|(countdown, _)| *countdown > 0);

        if directive != Directive::Refresh {
            if inner.lag == 0 {
                apply(&mut inner.device, directive);
            } else {
                let lag = inner.lag;
                inner.pending.push((lag, directive));
            }
        }

        Ok(inner.device.clone())
    }
}

/// Several fans keyed by address. Unknown addresses fail, `hanging` ones never answer.
#[derive(Default)]
pub struct FakeNetwork {
    devices: Mutex<HashMap<String, DeviceState>>,
    hanging: Mutex<HashSet<String>>,
    requested: Mutex<Vec<String>>,
}

impl FakeNetwork {
    pub fn with_device(self, state: DeviceState) -> Self {
        self.devices
            .lock()
            .unwrap()
            .insert(state.ip_address.clone(), state);
        self
    }

    pub fn with_hanging(self, ip_address: &str) -> Self {
        self.hanging.lock().unwrap().insert(ip_address.to_string());
        self
    }

    pub fn was_asked(&self, ip_address: &str) -> bool {
        self.requested.lock().unwrap().iter().any(|asked| asked == ip_address)
    }

    pub fn update(&self, ip_address: &str, change: impl FnOnce(&mut DeviceState)) {
        if let Some(state) = self.devices.lock().unwrap().get_mut(ip_address) {
            change(state);
        }
    }
}

#[async_trait]
impl DeviceTransport for FakeNetwork {
    async fn send(
        &self,
        ip_address: &str,
        _directive: Directive,
    ) -> Result<DeviceState, DeviceError> {
        self.requested.lock().unwrap().push(ip_address.to_string());
        let hanging = self.hanging.lock().unwrap().contains(ip_address);
        if hanging {
            std::future::pending::<()>().await;
        }
        self.devices
            .lock()
            .unwrap()
            .get(ip_address)
            .cloned()
            .ok_or_else(|| DeviceError::Network("connection refused".to_string()))
    }
}

pub fn device(mac_address: &str, ip_address: &str, speed: i32) -> DeviceState {
    let mut state = DeviceState::new(mac_address, ip_address);
    state.speed = speed;
    state
}

#[derive(Default)]
pub struct MemoryNotifier {
    pub denied: bool,
    pub issued: Mutex<Vec<(String, String, String)>>,
}

impl MemoryNotifier {
    pub fn denied() -> Self {
        Self {
            denied: true,
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.issued.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationAuthority for MemoryNotifier {
    async fn is_authorized(&self) -> bool {
        !self.denied
    }

    async fn issue(&self, title: &str, subtitle: &str, body: &str) -> anyhow::Result<()> {
        self.issued
            .lock()
            .unwrap()
            .push((title.to_string(), subtitle.to_string(), body.to_string()));
        Ok(())
    }
}

pub struct FixedAlarm(pub AlarmConfig);

#[async_trait]
impl AlarmConfigStore for FixedAlarm {
    async fn read(&self) -> AlarmConfig {
        self.0
    }
}

/// Forecast store whose network refresh replays a fixed result.
pub struct MemoryForecastStore {
    pub cached: Mutex<Option<Forecast>>,
    pub fetched: Mutex<Option<Result<Forecast, ForecastError>>>,
    pub refreshes: Mutex<usize>,
}

impl MemoryForecastStore {
    pub fn new(cached: Option<Forecast>, fetched: Result<Forecast, ForecastError>) -> Self {
        Self {
            cached: Mutex::new(cached),
            fetched: Mutex::new(Some(fetched)),
            refreshes: Mutex::new(0),
        }
    }
}

#[async_trait]
impl ForecastStore for MemoryForecastStore {
    async fn read(&self) -> Option<Forecast> {
        self.cached.lock().unwrap().clone()
    }

    async fn last_update(&self) -> Option<DateTime<Utc>> {
        self.cached.lock().unwrap().as_ref().map(|f| f.fetched_at)
    }

    async fn write(&self, forecast: Forecast) -> anyhow::Result<()> {
        *self.cached.lock().unwrap() = Some(forecast);
        Ok(())
    }

    async fn refresh_from_network(
        &self,
        _coordinate: Option<Coordinate>,
    ) -> Result<Forecast, ForecastError> {
        *self.refreshes.lock().unwrap() += 1;
        let result = self
            .fetched
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Err(ForecastError::TooManyRetries));
        if let Ok(forecast) = &result {
            *self.cached.lock().unwrap() = Some(forecast.clone());
        }
        result
    }
}

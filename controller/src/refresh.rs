use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fanwatch_common::{
    millis, next_check_date, AlarmConfig, AlarmSettings, AlertFlags, Coordinate, Forecast,
    MonitorConfig, SchedulerConfig,
};

use crate::{
    feed::DeviceHub,
    services::{AlarmConfigStore, ForecastError, ForecastStore, NotificationAuthority},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RefreshPhase {
    Idle,
    CheckingPreconditions,
    Fetching,
    Evaluating,
    Rescheduled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAuthorized,
    NoDeviceOperating,
    AlarmDisabled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotAuthorized => "notifications are not authorized",
            Self::NoDeviceOperating => "no fan is operating",
            Self::AlarmDisabled => "temperature alarm is disabled",
        })
    }
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Completed(AlertFlags),
    Skipped(SkipReason),
    Failed(ForecastError),
}

impl RefreshOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Collaborators the weather monitor reads from and reports to.
#[derive(Clone)]
pub struct MonitorServices {
    pub forecasts: Arc<dyn ForecastStore>,
    pub alarm: Arc<dyn AlarmConfigStore>,
    pub notifier: Arc<dyn NotificationAuthority>,
    pub hub: DeviceHub,
}

/// Periodic forecast check: refreshes the forecast, raises comfort alerts and always
/// publishes when it should run next.
pub struct WeatherMonitor {
    services: MonitorServices,
    coordinate: Option<Coordinate>,
    scheduler: SchedulerConfig,
    alert_cooldown: chrono::Duration,
    next_check: watch::Sender<DateTime<Utc>>,
    flags: Arc<watch::Sender<AlertFlags>>,
    phase: watch::Sender<RefreshPhase>,
    last_alert: Mutex<Option<DateTime<Utc>>>,
}

impl WeatherMonitor {
    pub fn new(
        services: MonitorServices,
        coordinate: Option<Coordinate>,
        scheduler: SchedulerConfig,
        monitor: &MonitorConfig,
        flags: Arc<watch::Sender<AlertFlags>>,
    ) -> Self {
        let (next_check, _) = watch::channel(Utc::now());
        let (phase, _) = watch::channel(RefreshPhase::Idle);
        Self {
            services,
            coordinate,
            scheduler,
            alert_cooldown: millis(monitor.alert_cooldown_ms),
            next_check,
            flags,
            phase,
            last_alert: Mutex::new(None),
        }
    }

    pub fn next_check(&self) -> watch::Receiver<DateTime<Utc>> {
        self.next_check.subscribe()
    }

    pub fn phase(&self) -> watch::Receiver<RefreshPhase> {
        self.phase.subscribe()
    }

    /// One full cycle. `true` when the forecast was evaluated, `false` when the cycle stopped
    /// early. The next check is published either way.
    pub async fn run_once(&self, now: DateTime<Utc>) -> bool {
        self.run_cycle(now).await.is_completed()
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> RefreshOutcome {
        let outcome = self.evaluate(now).await;
        match &outcome {
            RefreshOutcome::Completed(flags) => debug!("weather check complete: {flags:?}"),
            RefreshOutcome::Skipped(reason) => info!("weather check skipped: {reason}"),
            RefreshOutcome::Failed(err) => warn!("weather check failed: {err}"),
        }

        let next = self.reschedule(now).await;
        info!("next weather check at {next}");
        self.phase.send_replace(match outcome {
            RefreshOutcome::Failed(_) => RefreshPhase::Failed,
            _ => RefreshPhase::Rescheduled,
        });
        outcome
    }

    async fn evaluate(&self, now: DateTime<Utc>) -> RefreshOutcome {
        self.phase.send_replace(RefreshPhase::CheckingPreconditions);
        let alarm = match self.preconditions().await {
            Ok(alarm) => alarm,
            Err(reason) => return RefreshOutcome::Skipped(reason),
        };

        self.phase.send_replace(RefreshPhase::Fetching);
        let forecast = match self.fetch(now).await {
            Ok(forecast) => forecast,
            Err(err) => return RefreshOutcome::Failed(err),
        };

        self.phase.send_replace(RefreshPhase::Evaluating);
        let temperature = forecast.current_temperature;
        let too_hot = alarm.bounds.is_too_hot(temperature);
        let too_cold = alarm.bounds.is_too_cold(temperature);
        self.flags.send_modify(|flags| {
            flags.too_hot = too_hot;
            flags.too_cold = too_cold;
        });

        if too_hot || too_cold {
            self.alert(now, temperature, too_hot).await;
        }

        RefreshOutcome::Completed(*self.flags.borrow())
    }

    async fn preconditions(&self) -> Result<AlarmConfig, SkipReason> {
        if !self.services.notifier.is_authorized().await {
            return Err(SkipReason::NotAuthorized);
        }
        if !self.services.hub.any_operating().await {
            return Err(SkipReason::NoDeviceOperating);
        }
        let alarm = self.services.alarm.read().await;
        if !alarm.enabled {
            return Err(SkipReason::AlarmDisabled);
        }
        Ok(alarm)
    }

    /// Network refresh, falling back to a cached forecast that is still fresh enough.
    async fn fetch(&self, now: DateTime<Utc>) -> Result<Forecast, ForecastError> {
        let err = match self.services.forecasts.refresh_from_network(self.coordinate).await {
            Ok(forecast) => return Ok(forecast),
            Err(err) => err,
        };

        let max_age = millis(self.scheduler.max_forecast_age_ms);
        match self.services.forecasts.read().await {
            Some(cached) if cached.age(now) < max_age => {
                info!("forecast refresh unavailable ({err}); using cached forecast");
                Ok(cached)
            }
            _ => Err(err),
        }
    }

    async fn alert(&self, now: DateTime<Utc>, temperature: f64, too_hot: bool) {
        let mut last_alert = self.last_alert.lock().await;
        if let Some(last) = *last_alert {
            if now - last < self.alert_cooldown {
                debug!("comfort alert suppressed, last sent at {last}");
                return;
            }
        }

        let (title, body) = if too_hot {
            ("It's getting hot outside", "Consider closing the windows and turning the fan off.")
        } else {
            ("It's getting cold outside", "Consider turning the fan down or off.")
        };
        let subtitle = format!("Outside temperature is {temperature:.0}°F");
        match self.services.notifier.issue(title, &subtitle, body).await {
            Ok(()) => *last_alert = Some(now),
            Err(err) => warn!("comfort alert failed: {err:#}"),
        }
    }

    async fn reschedule(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let forecast = self.services.forecasts.read().await;
        let last_update = self.services.forecasts.last_update().await;
        let alarm = self.services.alarm.read().await;
        let operating = self.services.hub.any_operating().await;

        let next = next_check_date(
            forecast.as_ref(),
            last_update,
            &alarm,
            operating,
            now,
            &self.scheduler,
        );
        self.next_check.send_replace(next);
        next
    }

    /// Runs a cycle, sleeps until the published next check, and repeats until cancelled. A change
    /// on `alarm_changes` cuts the sleep short so new settings are evaluated right away.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut alarm_changes: watch::Receiver<AlarmSettings>,
    ) {
        let floor = Duration::from_millis(self.scheduler.min_refresh_interval_ms);
        let mut watching = true;
        loop {
            self.run_once(Utc::now()).await;

            let next = *self.next_check.borrow();
            // A check that is already due would spin; wait out the refresh floor instead.
            let wait = (next - Utc::now())
                .to_std()
                .ok()
                .filter(|wait| !wait.is_zero())
                .unwrap_or(floor);
            let sleep = tokio::time::sleep(wait);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!("weather monitor stopped");
                        return;
                    }
                    changed = alarm_changes.changed(), if watching => match changed {
                        Ok(()) => {
                            info!("alarm settings changed; checking the weather now");
                            break;
                        }
                        Err(_) => watching = false,
                    },
                    _ = &mut sleep => break,
                }
            }
        }
    }
}

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fanwatch_common::{ConvergenceConfig, DeviceState, Directive, INVALID_ADDRESS};

use crate::{
    feed::DeviceFeed,
    services::{DeviceError, DeviceTransport},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceOutcome {
    Converged(DeviceState),
    Cancelled,
    /// Placeholder device; nothing was sent.
    Skipped,
}

#[derive(Debug, Error)]
pub enum ConvergenceError {
    #[error("fan not responsive: wanted {target}, last saw {last_observed}")]
    NotResponsive { target: i32, last_observed: i32 },
    #[error("fan status unavailable: {0}")]
    Transport(#[from] DeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Speed,
    Timer,
}

impl Adjustment {
    fn as_str(self) -> &'static str {
        match self {
            Self::Speed => "speed",
            Self::Timer => "timer",
        }
    }

    fn observe(self, state: &DeviceState) -> i32 {
        match self {
            Self::Speed => state.speed,
            Self::Timer => state.timer_minutes,
        }
    }

    fn reached(self, observed: i32, target: i32) -> bool {
        match self {
            Self::Speed => observed == target,
            Self::Timer => observed >= target,
        }
    }

    fn directive(self, observed: i32, target: i32) -> Directive {
        match self {
            Self::Timer => Directive::AdvanceTimer,
            Self::Speed if target == 0 => Directive::ResetToZero,
            Self::Speed if target > observed => Directive::Increase,
            Self::Speed => Directive::Decrease,
        }
    }

    fn attempts(self, config: &ConvergenceConfig) -> u32 {
        match self {
            Self::Speed => config.speed_attempts,
            Self::Timer => config.timer_attempts,
        }
    }

    fn unresponsive_wait(self, config: &ConvergenceConfig) -> Duration {
        Duration::from_millis(match self {
            Self::Speed => config.speed_unresponsive_wait_ms,
            Self::Timer => config.timer_unresponsive_wait_ms,
        })
    }
}

/// Bookkeeping for one adjustment request.
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceSession {
    pub target_value: i32,
    pub attempts_remaining: u32,
    pub last_observed_value: i32,
    pub unresponsive_strikes_remaining: u32,
}

/// Timer value to aim for when adding `hours` to a running timer: capped at the device maximum,
/// less a safety margin so a slightly short timer still counts as done.
pub fn timer_target(current_minutes: i32, hours: i32, config: &ConvergenceConfig) -> i32 {
    (current_minutes + hours * 60).min(config.max_timer_minutes) - config.timer_margin_minutes
}

enum Step {
    Observed,
    Cancelled,
}

/// Drives one device towards a requested speed or timer value using its keypress directives.
pub struct FanAdjuster {
    transport: Arc<dyn DeviceTransport>,
    feed: DeviceFeed,
    ip_address: String,
    config: ConvergenceConfig,
    cancel: CancellationToken,
}

impl FanAdjuster {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        feed: DeviceFeed,
        ip_address: impl Into<String>,
        config: ConvergenceConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            feed,
            ip_address: ip_address.into(),
            config,
            cancel,
        }
    }

    fn is_placeholder(&self) -> bool {
        self.ip_address == INVALID_ADDRESS
    }

    /// Single status poll, published on success.
    pub async fn refresh(&self) -> Result<Option<DeviceState>, DeviceError> {
        if self.is_placeholder() {
            return Ok(None);
        }
        let Some(result) = self.request(Directive::Refresh).await else {
            return Ok(None);
        };
        let state = result?;
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        self.feed.publish(state.clone());
        Ok(Some(state))
    }

    pub async fn set_speed(&self, target: i32) -> Result<ConvergenceOutcome, ConvergenceError> {
        self.converge(Adjustment::Speed, |_| target).await
    }

    /// Adds `hours` to the running timer, measured from the timer value seen on the first poll.
    pub async fn extend_timer(&self, hours: i32) -> Result<ConvergenceOutcome, ConvergenceError> {
        let config = self.config.clone();
        self.converge(Adjustment::Timer, move |state| {
            timer_target(state.timer_minutes, hours, &config)
        })
        .await
    }

    async fn converge(
        &self,
        adjustment: Adjustment,
        target_for: impl FnOnce(&DeviceState) -> i32,
    ) -> Result<ConvergenceOutcome, ConvergenceError> {
        if self.is_placeholder() {
            return Ok(ConvergenceOutcome::Skipped);
        }

        let Some(initial) = self.request(Directive::Refresh).await else {
            return Ok(ConvergenceOutcome::Cancelled);
        };
        let mut state = initial?;
        if self.cancel.is_cancelled() {
            return Ok(ConvergenceOutcome::Cancelled);
        }
        self.feed.publish(state.clone());

        let mut session = ConvergenceSession {
            target_value: target_for(&state),
            attempts_remaining: adjustment.attempts(&self.config),
            last_observed_value: adjustment.observe(&state),
            unresponsive_strikes_remaining: self.config.unresponsive_strikes,
        };
        info!(
            "{} {}: adjusting {} -> {}",
            self.ip_address,
            adjustment.as_str(),
            session.last_observed_value,
            session.target_value
        );

        if adjustment.reached(session.last_observed_value, session.target_value) {
            return Ok(ConvergenceOutcome::Converged(state));
        }

        while session.attempts_remaining > 0 {
            session.attempts_remaining -= 1;
            let before = adjustment.observe(&state);
            let directive = adjustment.directive(before, session.target_value);

            if let Step::Cancelled = self
                .step(directive, adjustment, &mut state, &mut session)
                .await
            {
                return Ok(ConvergenceOutcome::Cancelled);
            }
            if adjustment.reached(session.last_observed_value, session.target_value) {
                return Ok(self.converged(adjustment, state));
            }

            session.unresponsive_strikes_remaining = self.config.unresponsive_strikes;
            while session.last_observed_value == before {
                session.unresponsive_strikes_remaining -= 1;
                if session.unresponsive_strikes_remaining == 0 {
                    break;
                }
                debug!(
                    "{} {}: no change after {}, {} strikes left",
                    self.ip_address,
                    adjustment.as_str(),
                    directive.as_str(),
                    session.unresponsive_strikes_remaining
                );
                if !self.pause(adjustment.unresponsive_wait(&self.config)).await {
                    return Ok(ConvergenceOutcome::Cancelled);
                }
                if let Step::Cancelled = self
                    .step(Directive::Refresh, adjustment, &mut state, &mut session)
                    .await
                {
                    return Ok(ConvergenceOutcome::Cancelled);
                }
                if adjustment.reached(session.last_observed_value, session.target_value) {
                    return Ok(self.converged(adjustment, state));
                }
            }

            if !self.pause(Duration::from_millis(self.config.settle_delay_ms)).await {
                return Ok(ConvergenceOutcome::Cancelled);
            }
        }

        warn!(
            "{} {}: not responsive, wanted {} but still at {}",
            self.ip_address,
            adjustment.as_str(),
            session.target_value,
            session.last_observed_value
        );
        Err(ConvergenceError::NotResponsive {
            target: session.target_value,
            last_observed: session.last_observed_value,
        })
    }

    fn converged(&self, adjustment: Adjustment, state: DeviceState) -> ConvergenceOutcome {
        info!(
            "{} {}: converged at {}",
            self.ip_address,
            adjustment.as_str(),
            adjustment.observe(&state)
        );
        ConvergenceOutcome::Converged(state)
    }

    /// Sends one directive. A failed request leaves `state` untouched so the attempt counts as
    /// an unchanged observation.
    async fn step(
        &self,
        directive: Directive,
        adjustment: Adjustment,
        state: &mut DeviceState,
        session: &mut ConvergenceSession,
    ) -> Step {
        let Some(result) = self.request(directive).await else {
            return Step::Cancelled;
        };
        match result {
            Ok(next) => {
                if self.cancel.is_cancelled() {
                    return Step::Cancelled;
                }
                self.feed.publish(next.clone());
                session.last_observed_value = adjustment.observe(&next);
                *state = next;
            }
            Err(err) => warn!("{} {}: {err}", self.ip_address, directive.as_str()),
        }
        Step::Observed
    }

    async fn request(&self, directive: Directive) -> Option<Result<DeviceState, DeviceError>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.transport.send(&self.ip_address, directive) => Some(result),
        }
    }

    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// At most one adjustment session per device. Each lease carries the token that cancels it.
#[derive(Clone, Default)]
pub struct SessionGuard {
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

pub struct SessionLease {
    guard: SessionGuard,
    ip_address: String,
    token: CancellationToken,
}

impl SessionLease {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Ok(mut active) = self.guard.active.lock() {
            active.remove(&self.ip_address);
        }
    }
}

impl SessionGuard {
    /// Claims the device, or `None` while another session holds it.
    pub fn try_begin(&self, ip_address: &str, parent: &CancellationToken) -> Option<SessionLease> {
        let mut active = self.active.lock().ok()?;
        if active.contains_key(ip_address) {
            return None;
        }
        let token = parent.child_token();
        active.insert(ip_address.to_string(), token.clone());
        Some(SessionLease {
            guard: self.clone(),
            ip_address: ip_address.to_string(),
            token,
        })
    }

    pub fn cancel(&self, ip_address: &str) -> bool {
        match self.active.lock() {
            Ok(active) => active
                .get(ip_address)
                .map(|token| {
                    token.cancel();
                    true
                })
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn is_active(&self, ip_address: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains_key(ip_address))
            .unwrap_or(false)
    }
}

use std::time::Duration;

use tokio::time::Instant;

use fanwatch_common::{DeviceState, Directive};

pub const MAX_SPEED: i32 = 10;
pub const MAX_TIMER_MINUTES: i32 = 720;

/// A whole-house fan whose status reply trails its keypresses by `lag`.
pub struct SimulatedFan {
    state: DeviceState,
    lag: Duration,
    pending: Vec<(Instant, Directive)>,
    timer_started: Instant,
}

impl SimulatedFan {
    pub fn new(mac_address: &str, ip_address: &str, lag: Duration, now: Instant) -> Self {
        let mut state = DeviceState::new(mac_address, ip_address);
        state.model = Some("3.5e".to_string());
        state.software_version = Some("2.15.1".to_string());
        state.inside_temp = Some(74);
        state.attic_temp = Some(96);
        state.outside_temp = Some(68);
        state.setpoint = Some(0);
        refresh_readings(&mut state);
        Self {
            state,
            lag,
            pending: Vec::new(),
            timer_started: now,
        }
    }

    /// Accepts one keypress and answers with the state as the controller board currently
    /// reports it.
    pub fn handle(&mut self, directive: Directive, now: Instant) -> DeviceState {
        self.settle(now);
        if directive != Directive::Refresh {
            if self.lag.is_zero() {
                self.apply(directive, now);
            } else {
                self.pending.push((now + self.lag, directive));
            }
        }
        self.state.clone()
    }

    pub fn set_interlock(&mut self, tripped: bool, now: Instant) {
        self.settle(now);
        self.state.interlock1 = tripped;
        if tripped {
            self.state.speed = 0;
            self.state.timer_minutes = 0;
            self.pending.clear();
            refresh_readings(&mut self.state);
        }
    }

    fn settle(&mut self, now: Instant) {
        let mut due: Vec<(Instant, Directive)> = Vec::new();
        self.pending.retain(|entry| {
            if entry.0 <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        for (at, directive) in due {
            self.run_timer(at);
            self.apply(directive, at);
        }
        self.run_timer(now);
    }

    fn run_timer(&mut self, now: Instant) {
        if self.state.timer_minutes <= 0 {
            self.timer_started = now;
            return;
        }
        let elapsed = (now.saturating_duration_since(self.timer_started).as_secs() / 60) as i32;
        if elapsed == 0 {
            return;
        }
        self.timer_started += Duration::from_secs(elapsed as u64 * 60);
        self.state.timer_minutes = (self.state.timer_minutes - elapsed).max(0);
        if self.state.timer_minutes == 0 {
            self.state.speed = 0;
            refresh_readings(&mut self.state);
        }
    }

    fn apply(&mut self, directive: Directive, now: Instant) {
        if self.state.is_interlocked() {
            return;
        }
        let state = &mut self.state;
        match directive {
            Directive::Refresh => {}
            Directive::Increase => state.speed = (state.speed + 1).min(MAX_SPEED),
            Directive::Decrease => state.speed = (state.speed - 1).max(0),
            Directive::ResetToZero => {
                state.speed = 0;
                state.timer_minutes = 0;
            }
            Directive::AdvanceTimer => {
                if state.timer_minutes == 0 {
                    self.timer_started = now;
                }
                state.timer_minutes = (state.timer_minutes + 60).min(MAX_TIMER_MINUTES);
                if state.speed == 0 {
                    state.speed = 1;
                }
            }
        }
        state.damper_operating = false;
        refresh_readings(state);
    }
}

fn refresh_readings(state: &mut DeviceState) {
    state.cfm = Some(state.speed * 350);
    state.power_watts = Some(state.speed * state.speed * 6);
}

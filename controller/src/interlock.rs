use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fanwatch_common::{AlertFlags, DeviceState};

use crate::{
    convergence::SessionGuard,
    discovery::{probe_all, ProbeTimeouts},
    feed::DeviceHub,
    services::{DeviceRegistry, DeviceTransport, NotificationAuthority},
};

/// Periodically checks every known fan's safety interlocks and warns once per episode. Fans
/// with an adjustment session running are left to that session.
pub struct InterlockPoller {
    transport: Arc<dyn DeviceTransport>,
    registry: Arc<dyn DeviceRegistry>,
    notifier: Arc<dyn NotificationAuthority>,
    hub: DeviceHub,
    sessions: SessionGuard,
    flags: Arc<watch::Sender<AlertFlags>>,
    timeouts: ProbeTimeouts,
    interval: Duration,
}

impl InterlockPoller {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        registry: Arc<dyn DeviceRegistry>,
        notifier: Arc<dyn NotificationAuthority>,
        hub: DeviceHub,
        sessions: SessionGuard,
        flags: Arc<watch::Sender<AlertFlags>>,
        timeouts: ProbeTimeouts,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            notifier,
            hub,
            sessions,
            flags,
            timeouts,
            interval,
        }
    }

    /// One sweep. Returns whether any fan has an interlock that has not been warned about yet.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> bool {
        let addresses = self.registry.list().await;
        if addresses.is_empty() {
            info!("interlock poll skipped: no known fans");
            return false;
        }
        let addresses: Vec<String> = addresses
            .into_iter()
            .filter(|address| !self.in_session(address))
            .collect();

        let Some(states) =
            probe_all(self.transport.clone(), addresses, self.timeouts, cancel).await
        else {
            return false;
        };

        let mut warn_for: Vec<DeviceState> = Vec::new();
        for state in states {
            if self.in_session(&state.ip_address) {
                continue;
            }
            self.hub.feed(&state.ip_address).await.publish(state.clone());

            let suppressed = self.registry.is_suppressed(&state.ip_address).await;
            if !state.is_interlocked() {
                if suppressed {
                    info!("{}: interlock cleared", state.ip_address);
                    self.registry.clear_suppressed(&state.ip_address).await;
                }
            } else if !suppressed {
                warn_for.push(state);
            }
        }

        let interlocked = !warn_for.is_empty();
        self.flags.send_modify(|flags| flags.interlocked = interlocked);
        if interlocked {
            self.warn(&warn_for).await;
        }
        interlocked
    }

    fn in_session(&self, ip_address: &str) -> bool {
        let active = self.sessions.is_active(ip_address);
        if active {
            debug!("{ip_address}: adjustment in progress, interlock check skipped");
        }
        active
    }

    async fn warn(&self, devices: &[DeviceState]) {
        if !self.notifier.is_authorized().await {
            info!("interlock warning not sent: notifications are not authorized");
            return;
        }

        let names: Vec<&str> = devices.iter().map(|d| d.ip_address.as_str()).collect();
        let subtitle = format!("Interlock active on {}", names.join(", "));
        let body =
            "The fan stopped because a safety interlock tripped. Open a window or check the damper.";
        if let Err(err) = self.notifier.issue("Fan interlock", &subtitle, body).await {
            warn!("interlock warning failed: {err:#}");
            return;
        }

        for device in devices {
            self.registry.mark_suppressed(&device.ip_address).await;
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("interlock poller stopped");
                    return;
                }
                _ = interval.tick() => {}
            }
            self.poll_once(&cancel).await;
        }
    }
}

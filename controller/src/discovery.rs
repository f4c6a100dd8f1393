use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fanwatch_common::{DeviceState, Directive};

use crate::{
    convergence::SessionGuard,
    services::{DeviceRegistry, DeviceTransport},
};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid subnet prefix {0:?}, expected three octets like 192.168.1")]
    InvalidPrefix(String),
    #[error("scan cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeTimeouts {
    pub request: Duration,
    pub aggregate: Duration,
}

/// Polls every address concurrently and returns the states that came back.
///
/// Each request is bounded by `timeouts.request`; the whole group by `timeouts.aggregate`, after
/// which outstanding probes are aborted and only the answers gathered so far are returned.
/// `None` means `cancel` fired first.
pub async fn probe_all(
    transport: Arc<dyn DeviceTransport>,
    addresses: Vec<String>,
    timeouts: ProbeTimeouts,
    cancel: &CancellationToken,
) -> Option<Vec<DeviceState>> {
    let mut probes = JoinSet::new();
    for address in addresses {
        let transport = transport.clone();
        probes.spawn(async move {
            let reply =
                tokio::time::timeout(timeouts.request, transport.send(&address, Directive::Refresh))
                    .await;
            (address, reply)
        });
    }

    let mut states = Vec::new();
    let gather = async {
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((_, Ok(Ok(state)))) => states.push(state),
                Ok((address, Ok(Err(err)))) => debug!("{address}: {err}"),
                Ok((address, Err(_))) => {
                    debug!("{address}: no answer within {:?}", timeouts.request)
                }
                Err(err) => warn!("probe task failed: {err}"),
            }
        }
    };

    let cancelled = tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        finished = tokio::time::timeout(timeouts.aggregate, gather) => {
            if finished.is_err() {
                warn!("probe group hit its {:?} limit", timeouts.aggregate);
            }
            false
        }
    };
    probes.abort_all();

    (!cancelled).then_some(states)
}

fn parse_prefix(prefix: &str) -> Result<[u8; 3], ScanError> {
    let invalid = || ScanError::InvalidPrefix(prefix.to_string());
    let octets = prefix
        .trim()
        .trim_end_matches('.')
        .split('.')
        .map(|part| part.parse::<u8>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;
    octets.try_into().map_err(|_| invalid())
}

fn address_order(state: &DeviceState) -> (Option<Ipv4Addr>, String) {
    (state.ip_address.parse().ok(), state.ip_address.clone())
}

/// Probes `prefix.1` through `prefix.254` and registers every fan that answers. Addresses with
/// an adjustment session running are not probed.
pub async fn scan(
    prefix: &str,
    transport: Arc<dyn DeviceTransport>,
    registry: &dyn DeviceRegistry,
    sessions: &SessionGuard,
    timeouts: ProbeTimeouts,
    cancel: &CancellationToken,
) -> Result<Vec<DeviceState>, ScanError> {
    let [a, b, c] = parse_prefix(prefix)?;
    let candidates = (1..=254u8)
        .map(|host| Ipv4Addr::new(a, b, c, host).to_string())
        .filter(|address| !sessions.is_active(address))
        .collect();

    info!("scanning {a}.{b}.{c}.0/24 for fans");
    let mut responders = probe_all(transport, candidates, timeouts, cancel)
        .await
        .ok_or(ScanError::Cancelled)?;
    responders.sort_by_key(address_order);

    for state in &responders {
        registry.add(&state.ip_address).await;
    }
    info!("scan found {} fan(s)", responders.len());
    Ok(responders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::MemoryRegistry,
        testing::{device, FakeNetwork},
    };

    fn timeouts() -> ProbeTimeouts {
        ProbeTimeouts {
            request: Duration::from_secs(5),
            aggregate: Duration::from_secs(30),
        }
    }

    #[test]
    fn prefix_must_have_three_octets() {
        assert_eq!(parse_prefix("192.168.1").unwrap(), [192, 168, 1]);
        assert_eq!(parse_prefix("10.0.0.").unwrap(), [10, 0, 0]);
        assert!(parse_prefix("10.0").is_err());
        assert!(parse_prefix("10.0.300").is_err());
        assert!(parse_prefix("10.0.0.1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_returns_only_responders_in_address_order() {
        let network = Arc::new(
            FakeNetwork::default()
                .with_device(device("AA", "10.0.0.12", 0))
                .with_device(device("BB", "10.0.0.7", 2))
                .with_hanging("10.0.0.20"),
        );
        let registry = MemoryRegistry::default();
        let started = tokio::time::Instant::now();

        let found = scan(
            "10.0.0",
            network,
            &registry,
            &SessionGuard::default(),
            timeouts(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let addresses: Vec<&str> = found.iter().map(|s| s.ip_address.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.7", "10.0.0.12"]);
        assert_eq!(registry.list().await, vec!["10.0.0.12", "10.0.0.7"]);
        // The silent host is dropped after its own request timeout.
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_limit_cuts_slow_probes() {
        let network = Arc::new(
            FakeNetwork::default()
                .with_device(device("AA", "10.0.0.3", 1))
                .with_hanging("10.0.0.4"),
        );
        let started = tokio::time::Instant::now();
        let limits = ProbeTimeouts {
            request: Duration::from_secs(60),
            aggregate: Duration::from_secs(20),
        };

        let states = probe_all(
            network,
            vec!["10.0.0.3".into(), "10.0.0.4".into()],
            limits,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(states.len(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_scan_is_not_a_result() {
        let network = Arc::new(FakeNetwork::default().with_hanging("10.0.0.9"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = scan(
            "10.0.0",
            network,
            &MemoryRegistry::default(),
            &SessionGuard::default(),
            timeouts(),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ScanError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_skips_fans_in_an_adjustment_session() {
        let network = Arc::new(
            FakeNetwork::default()
                .with_device(device("AA", "10.0.0.12", 0))
                .with_device(device("BB", "10.0.0.7", 2)),
        );
        let sessions = SessionGuard::default();
        let cancel = CancellationToken::new();
        let _lease = sessions.try_begin("10.0.0.7", &cancel).unwrap();

        let found = scan(
            "10.0.0",
            network.clone(),
            &MemoryRegistry::default(),
            &sessions,
            timeouts(),
            &cancel,
        )
        .await
        .unwrap();

        let addresses: Vec<&str> = found.iter().map(|s| s.ip_address.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.12"]);
        assert!(!network.was_asked("10.0.0.7"));
    }
}

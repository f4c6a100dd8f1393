use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fanwatch_common::{
    device_state_topic, AlarmSettings, AlertFlags, ConvergenceConfig, DeviceState,
    TOPIC_MONITOR_FLAGS, TOPIC_MONITOR_NEXT_CHECK,
};

use crate::{
    convergence::{ConvergenceError, ConvergenceOutcome, FanAdjuster, SessionGuard, SessionLease},
    discovery::{self, ProbeTimeouts, ScanError},
    feed::{self, DeviceHub},
    interlock::InterlockPoller,
    notify::MqttNotifier,
    refresh::{MonitorServices, RefreshPhase, WeatherMonitor},
    registry::MemoryRegistry,
    services::{DeviceRegistry, DeviceTransport, ForecastStore, NotificationAuthority},
    store::{AlarmHandle, RuntimeStore},
    transport::HttpTransport,
    weather::{FileForecastStore, WeatherClient},
};

const MAX_SPEED: i32 = 10;
const MAX_TIMER_HOURS: i32 = 12;

#[derive(Clone)]
struct AppState {
    transport: Arc<dyn DeviceTransport>,
    registry: Arc<dyn DeviceRegistry>,
    notifier: Arc<dyn NotificationAuthority>,
    forecasts: Arc<dyn ForecastStore>,
    alarm: AlarmHandle,
    hub: DeviceHub,
    sessions: SessionGuard,
    shutdown: CancellationToken,
    next_check: watch::Receiver<DateTime<Utc>>,
    flags: watch::Receiver<AlertFlags>,
    phase: watch::Receiver<RefreshPhase>,
    convergence: ConvergenceConfig,
    probe_timeouts: ProbeTimeouts,
    timezone: String,
    mqtt: AsyncClient,
    store: RuntimeStore,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    devices: Vec<DeviceState>,
    #[serde(rename = "activeSessions")]
    active_sessions: Vec<String>,
    #[serde(rename = "nextCheck")]
    next_check: DateTime<Utc>,
    #[serde(rename = "nextCheckLocal")]
    next_check_local: Option<DateTime<FixedOffset>>,
    flags: AlertFlags,
    phase: RefreshPhase,
    timezone: String,
}

#[derive(Debug, Serialize)]
struct AdjustmentAccepted {
    ip: String,
    target: i32,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = RuntimeStore::from_env();
    let runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        Default::default()
    });

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("fanwatch-controller", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let request_timeout = Duration::from_millis(runtime.monitor.device_request_timeout_ms);
    let transport: Arc<dyn DeviceTransport> = Arc::new(HttpTransport::new(request_timeout)?);
    let registry: Arc<dyn DeviceRegistry> = Arc::new(MemoryRegistry::new(runtime.devices.clone()));
    let alarm = AlarmHandle::new(runtime.alarm.clone());
    let notifier: Arc<dyn NotificationAuthority> =
        Arc::new(MqttNotifier::new(mqtt.clone(), alarm.clone()));
    let weather = WeatherClient::new(
        &runtime.network.weather_url,
        &runtime.network.weather_api_key,
        request_timeout,
    )?;
    let forecasts: Arc<dyn ForecastStore> = Arc::new(FileForecastStore::new(
        store.data_dir(),
        weather,
        &runtime.monitor,
        &runtime.scheduler,
    ));
    let (hub, feed_subscriptions) = DeviceHub::observed();
    let sessions = SessionGuard::default();
    let (flags_tx, flags) = watch::channel(AlertFlags::default());
    let flags_tx = Arc::new(flags_tx);
    let shutdown = CancellationToken::new();

    let monitor = Arc::new(WeatherMonitor::new(
        MonitorServices {
            forecasts: forecasts.clone(),
            alarm: Arc::new(alarm.clone()),
            notifier: notifier.clone(),
            hub: hub.clone(),
        },
        runtime.coordinate,
        runtime.scheduler.clone(),
        &runtime.monitor,
        flags_tx.clone(),
    ));
    let interlocks = Arc::new(InterlockPoller::new(
        transport.clone(),
        registry.clone(),
        notifier.clone(),
        hub.clone(),
        sessions.clone(),
        flags_tx,
        ProbeTimeouts {
            request: request_timeout,
            aggregate: Duration::from_millis(runtime.monitor.interlock_aggregate_timeout_ms),
        },
        Duration::from_millis(runtime.monitor.interlock_poll_interval_ms),
    ));

    let app_state = AppState {
        transport,
        registry,
        notifier,
        forecasts,
        alarm,
        hub,
        sessions,
        shutdown: shutdown.clone(),
        next_check: monitor.next_check(),
        flags,
        phase: monitor.phase(),
        convergence: runtime.convergence.clone(),
        probe_timeouts: ProbeTimeouts {
            request: request_timeout,
            aggregate: Duration::from_millis(runtime.monitor.scan_aggregate_timeout_ms),
        },
        timezone: runtime.timezone.clone(),
        mqtt,
        store,
    };

    spawn_mqtt_loop(eventloop, shutdown.clone());
    spawn_device_relays(feed_subscriptions, app_state.mqtt.clone(), shutdown.clone());
    tokio::spawn(monitor.run(shutdown.child_token(), app_state.alarm.changes()));
    tokio::spawn(interlocks.run(shutdown.child_token()));
    spawn_state_publish_loop(
        app_state.clone(),
        Duration::from_millis(runtime.monitor.state_publish_interval_ms),
    );

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/fan/refresh", post(handle_refresh_fan))
        .route("/api/fan/speed", post(handle_set_speed))
        .route("/api/fan/timer", post(handle_extend_timer))
        .route("/api/fan/cancel", post(handle_cancel_adjustment))
        .route("/api/alarm", get(handle_get_alarm).put(handle_put_alarm))
        .route("/api/forecast", get(handle_get_forecast))
        .route("/api/scan", post(handle_scan))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
    }
    info!("shutting down");
    shutdown.cancel();
}

fn spawn_mqtt_loop(mut eventloop: rumqttc::EventLoop, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// Every device state, including each step of an adjustment, goes out on its retained topic.
fn spawn_device_relays(
    subscriptions: tokio::sync::mpsc::UnboundedReceiver<feed::FeedSubscription>,
    mqtt: AsyncClient,
    shutdown: CancellationToken,
) {
    feed::spawn_relays(subscriptions, shutdown, move |device: DeviceState| {
        let mqtt = mqtt.clone();
        async move {
            publish_json(&mqtt, &device_state_topic(&device.mac_address), &device).await;
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                biased;
                _ = app_state.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            let next_check = *app_state.next_check.borrow();
            publish_json(&app_state.mqtt, TOPIC_MONITOR_NEXT_CHECK, &next_check).await;
            let flags = *app_state.flags.borrow();
            publish_json(&app_state.mqtt, TOPIC_MONITOR_FLAGS, &flags).await;
        }
    });
}

async fn publish_json<T: Serialize>(mqtt: &AsyncClient, topic: &str, value: &T) {
    match serde_json::to_vec(value) {
        Ok(body) => {
            if let Err(err) = mqtt.publish(topic, QoS::AtLeastOnce, true, body).await {
                warn!("{topic} publish failed: {err}");
            }
        }
        Err(err) => warn!("{topic} serialization failed: {err}"),
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let devices = state.hub.snapshots().await;
    let active_sessions = devices
        .iter()
        .map(|device| device.ip_address.clone())
        .filter(|ip| state.sessions.is_active(ip))
        .collect();
    let next_check = *state.next_check.borrow();

    Json(StatusView {
        devices,
        active_sessions,
        next_check,
        next_check_local: in_timezone(&state.timezone, next_check),
        flags: *state.flags.borrow(),
        phase: *state.phase.borrow(),
        timezone: state.timezone.clone(),
    })
}

async fn handle_refresh_fan(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let ip = match required_param(&params, "ip") {
        Ok(ip) => ip,
        Err(response) => return response,
    };
    let Some(lease) = state.sessions.try_begin(&ip, &state.shutdown) else {
        return error_response(
            StatusCode::CONFLICT,
            "An adjustment is already running for this fan",
        );
    };

    let adjuster = adjuster_for(&state, &ip, &lease).await;
    match adjuster.refresh().await {
        Ok(Some(device)) => Json(device).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Fan was not polled"),
        Err(err) => {
            warn!("{ip}: refresh failed: {err}");
            error_response(StatusCode::BAD_GATEWAY, &format!("Fan did not answer: {err}"))
        }
    }
}

async fn handle_set_speed(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let ip = match required_param(&params, "ip") {
        Ok(ip) => ip,
        Err(response) => return response,
    };
    let target = match bounded_int(&params, "value", 0, MAX_SPEED) {
        Ok(target) => target,
        Err(response) => return response,
    };
    let Some(lease) = state.sessions.try_begin(&ip, &state.shutdown) else {
        return error_response(
            StatusCode::CONFLICT,
            "An adjustment is already running for this fan",
        );
    };

    let adjuster = adjuster_for(&state, &ip, &lease).await;
    let notifier = state.notifier.clone();
    let response = accepted(ip.clone(), target);
    tokio::spawn(async move {
        let result = adjuster.set_speed(target).await;
        report_adjustment(notifier.as_ref(), &ip, "speed", result).await;
        drop(lease);
    });

    response
}

async fn handle_extend_timer(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let ip = match required_param(&params, "ip") {
        Ok(ip) => ip,
        Err(response) => return response,
    };
    let hours = match bounded_int(&params, "hours", 1, MAX_TIMER_HOURS) {
        Ok(hours) => hours,
        Err(response) => return response,
    };
    let Some(lease) = state.sessions.try_begin(&ip, &state.shutdown) else {
        return error_response(
            StatusCode::CONFLICT,
            "An adjustment is already running for this fan",
        );
    };

    let adjuster = adjuster_for(&state, &ip, &lease).await;
    let notifier = state.notifier.clone();
    let response = accepted(ip.clone(), hours);
    tokio::spawn(async move {
        let result = adjuster.extend_timer(hours).await;
        report_adjustment(notifier.as_ref(), &ip, "timer", result).await;
        drop(lease);
    });

    response
}

async fn handle_cancel_adjustment(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let ip = match required_param(&params, "ip") {
        Ok(ip) => ip,
        Err(response) => return response,
    };
    if state.sessions.cancel(&ip) {
        info!("{ip}: adjustment cancelled by request");
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "No adjustment is running for this fan")
    }
}

async fn handle_get_alarm(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.alarm.settings())
}

async fn handle_put_alarm(
    State(state): State<AppState>,
    Json(update): Json<AlarmSettings>,
) -> impl IntoResponse {
    match state.alarm.save(&state.store, update).await {
        Ok(settings) => Json(settings).into_response(),
        Err(err) => {
            warn!("failed to persist alarm settings: {err:#}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist alarm settings",
            )
        }
    }
}

async fn handle_get_forecast(State(state): State<AppState>) -> impl IntoResponse {
    match state.forecasts.read().await {
        Some(forecast) => Json(forecast).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No forecast has been fetched yet"),
    }
}

async fn handle_scan(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let prefix = match required_param(&params, "prefix") {
        Ok(prefix) => prefix,
        Err(response) => return response,
    };

    let cancel = state.shutdown.child_token();
    let found = match discovery::scan(
        &prefix,
        state.transport.clone(),
        state.registry.as_ref(),
        &state.sessions,
        state.probe_timeouts,
        &cancel,
    )
    .await
    {
        Ok(found) => found,
        Err(err @ ScanError::InvalidPrefix(_)) => {
            return error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
        Err(ScanError::Cancelled) => {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "Scan cancelled")
        }
    };

    for device in &found {
        // A session that started while the scan ran owns this feed now.
        if !state.sessions.is_active(&device.ip_address) {
            state.hub.feed(&device.ip_address).await.publish(device.clone());
        }
    }
    let devices = state.registry.list().await;
    if let Err(err) = state.store.update(move |runtime| runtime.devices = devices).await {
        warn!("failed to persist scanned devices: {err:#}");
    }

    Json(found).into_response()
}

async fn adjuster_for(state: &AppState, ip: &str, lease: &SessionLease) -> FanAdjuster {
    FanAdjuster::new(
        state.transport.clone(),
        state.hub.feed(ip).await,
        ip,
        state.convergence.clone(),
        lease.token(),
    )
}

async fn report_adjustment(
    notifier: &dyn NotificationAuthority,
    ip: &str,
    what: &str,
    result: Result<ConvergenceOutcome, ConvergenceError>,
) {
    match result {
        Ok(ConvergenceOutcome::Converged(device)) => info!(
            "{ip}: {what} adjustment done (speed {}, timer {}m)",
            device.speed, device.timer_minutes
        ),
        Ok(ConvergenceOutcome::Cancelled) => info!("{ip}: {what} adjustment cancelled"),
        Ok(ConvergenceOutcome::Skipped) => info!("{ip}: {what} adjustment skipped for placeholder"),
        Err(err @ ConvergenceError::NotResponsive { .. }) => {
            warn!("{ip}: {err}");
            if notifier.is_authorized().await {
                let subtitle = format!("Fan at {ip} did not respond to a {what} change");
                let body = "Check that the fan is powered and reachable, then try again.";
                if let Err(err) = notifier.issue("Fan not responsive", &subtitle, body).await {
                    warn!("unresponsive-fan alert failed: {err:#}");
                }
            }
        }
        Err(err) => warn!("{ip}: {what} adjustment failed: {err}"),
    }
}

fn required_param(
    params: &HashMap<String, String>,
    name: &str,
) -> Result<String, axum::response::Response> {
    params
        .get(name)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                &format!("Missing '{name}' parameter"),
            )
        })
}

fn bounded_int(
    params: &HashMap<String, String>,
    name: &str,
    min: i32,
    max: i32,
) -> Result<i32, axum::response::Response> {
    let raw = required_param(params, name)?;
    match raw.parse::<i32>() {
        Ok(value) if (min..=max).contains(&value) => Ok(value),
        _ => Err(error_response(
            StatusCode::BAD_REQUEST,
            &format!("'{name}' must be a whole number from {min} to {max}"),
        )),
    }
}

fn accepted(ip: String, target: i32) -> axum::response::Response {
    (StatusCode::ACCEPTED, Json(AdjustmentAccepted { ip, target })).into_response()
}

fn in_timezone(timezone: &str, instant: DateTime<Utc>) -> Option<DateTime<FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = instant.with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tokio::{net::TcpListener, sync::Mutex, time::Instant};
use tracing::{debug, info};

use fanwatch_common::{codec, Directive};

use crate::fan::SimulatedFan;

type SharedFan = Arc<Mutex<SimulatedFan>>;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port = std::env::var("SIM_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8081);
    let lag_secs = std::env::var("SIM_LAG_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(2);
    let mac = std::env::var("SIM_MAC").unwrap_or_else(|_| "60:2D:3A:00:00:01".to_string());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let fan = Arc::new(Mutex::new(SimulatedFan::new(
        &mac,
        &addr.to_string(),
        Duration::from_secs(lag_secs),
        Instant::now(),
    )));

    let app = Router::new()
        .route("/fanspd.cgi", get(handle_directive))
        .route("/sim/interlock", post(handle_interlock))
        .with_state(fan);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind simulator at {addr}"))?;

    info!("simulated fan {mac} listening on http://{addr} with {lag_secs}s lag");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_directive(
    State(fan): State<SharedFan>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let directive = params
        .get("dir")
        .and_then(|value| value.parse::<u8>().ok())
        .and_then(Directive::from_code);
    let Some(directive) = directive else {
        return (StatusCode::BAD_REQUEST, "unknown dir".to_string());
    };

    let state = fan.lock().await.handle(directive, Instant::now());
    debug!(
        "{}: speed {} timer {}m",
        directive.as_str(),
        state.speed,
        state.timer_minutes
    );
    (StatusCode::OK, codec::encode(&state))
}

async fn handle_interlock(
    State(fan): State<SharedFan>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let tripped = params.get("value").map(String::as_str) == Some("1");
    fan.lock().await.set_interlock(tripped, Instant::now());
    info!("interlock {}", if tripped { "tripped" } else { "cleared" });
    StatusCode::NO_CONTENT
}

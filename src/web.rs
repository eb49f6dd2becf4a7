//! Axum-based HTTP API
//!
//! Read-only status views plus the manual balance trigger. Handlers only talk
//! to a [`SupervisorHandle`]; the control loop never blocks on a request.

pub mod logs;

pub use logs::{TailParams, logs_stream, logs_tail};

use crate::config::Config;
use crate::supervisor::SupervisorHandle;
#[cfg(feature = "openapi")]
use crate::supervisor::BalanceRequestOutcome;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub handle: SupervisorHandle,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(handle: SupervisorHandle, config: Config) -> Self {
        Self {
            handle,
            config: Arc::new(config),
        }
    }
}

#[cfg_attr(feature = "openapi", utoipa::path(get, path = "/api/health", responses(
    (status = 200, description = "Service is healthy")
)))]
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg_attr(feature = "openapi", utoipa::path(get, path = "/api/status", responses(
    (status = 200, description = "Latest supervisor snapshot")
)))]
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.handle.snapshot();
    Json(snapshot.as_ref().clone())
}

#[cfg_attr(feature = "openapi", utoipa::path(post, path = "/api/balance", responses(
    (status = 200, description = "Request queued for the next cycle", body = BalanceRequestOutcome),
    (status = 409, description = "Request refused by an interlock", body = BalanceRequestOutcome)
)))]
pub async fn request_balance(State(state): State<AppState>) -> impl IntoResponse {
    let outcome = state.handle.request_balance();
    let logger = crate::logging::get_logger("web");
    if outcome.accepted {
        logger.info("Manual balance request accepted");
        (StatusCode::OK, Json(outcome))
    } else {
        logger.info(&format!(
            "Manual balance request rejected: {}",
            outcome.reason.as_deref().unwrap_or("unknown")
        ));
        (StatusCode::CONFLICT, Json(outcome))
    }
}

#[cfg_attr(feature = "openapi", utoipa::path(get, path = "/api/config", responses((status = 200))))]
pub async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    let json = serde_json::to_value(state.config.as_ref())
        .unwrap_or(serde_json::json!({"error":"serialization"}));
    Json(json)
}

#[cfg_attr(feature = "openapi", utoipa::path(get, path = "/api/events", responses((status = 200))))]
pub async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let stream = WatchStream::new(state.handle.subscribe()).map(|snapshot| {
        let payload = serde_json::to_string(snapshot.as_ref())
            .unwrap_or_else(|_| "{\"error\":\"serialization\"}".to_string());
        Ok::<Event, Infallible>(Event::default().event("status").data(payload))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(feature = "openapi")]
#[derive(utoipa::OpenApi)]
#[openapi(
    paths(health, status, request_balance, get_config, events, logs::logs_tail, logs::logs_stream),
    components(schemas(BalanceRequestOutcome, TailParams)),
    tags((name = "bankwarden", description = "Bankwarden battery supervisor API"))
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/balance", post(request_balance))
        .route("/api/config", get(get_config))
        .route("/api/events", get(events))
        .merge(logs::routes());

    #[cfg(feature = "openapi")]
    let router = {
        use utoipa::OpenApi as _;
        router.merge(
            utoipa_swagger_ui::SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()),
        )
    };

    router
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let router = build_router(state);

    let logger = crate::logging::get_logger("web");
    logger.info(&format!(
        "Starting web server; requested host={}, port={}",
        host, port
    ));

    let (addr, parsed_ok): (SocketAddr, bool) = match host.parse::<IpAddr>() {
        Ok(ip) => (SocketAddr::new(ip, port), true),
        Err(_) => (([127, 0, 0, 1], port).into(), false),
    };
    if !parsed_ok {
        logger.warn(&format!("Invalid host '{}'; falling back to 127.0.0.1", host));
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    logger.info(&format!(
        "Web server listening at http://{}:{} (API /api)",
        local_addr.ip(),
        local_addr.port()
    ));

    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{StatusSnapshot, SupervisorCommand, SystemStatus};
    use axum::http::Request;
    use http_body_util::BodyExt as _;
    use tokio::sync::{mpsc, watch};
    use tower::ServiceExt;

    fn state_with(
        snapshot: StatusSnapshot,
    ) -> (
        AppState,
        watch::Sender<Arc<StatusSnapshot>>,
        mpsc::UnboundedReceiver<SupervisorCommand>,
    ) {
        let (snap_tx, snap_rx) = watch::channel(Arc::new(snapshot));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = SupervisorHandle::new(snap_rx, cmd_tx, 0.1);
        (AppState::new(handle, Config::default()), snap_tx, cmd_rx)
    }

    fn running(voltages: Vec<Option<f64>>) -> StatusSnapshot {
        StatusSnapshot {
            system_status: SystemStatus::Running,
            voltages,
            ..StatusSnapshot::initial()
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str) -> Request<axum::body::Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(axum::body::Body::empty())
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<axum::body::Body> {
        Request::builder()
            .uri(uri)
            .body(axum::body::Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_ok() {
        let (state, _tx, _rx) = state_with(StatusSnapshot::initial());
        let response = build_router(state).oneshot(get_req("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_serves_latest_snapshot() {
        let (state, tx, _rx) = state_with(StatusSnapshot::initial());
        tx.send_replace(Arc::new(running(vec![Some(20.0), Some(19.8), Some(20.5)])));
        let response = build_router(state).oneshot(get_req("/api/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["system_status"], "Running");
        assert_eq!(json["voltages"][2], 20.5);
        assert_eq!(json["balancing"], false);
    }

    #[tokio::test]
    async fn balance_accepted_queues_command() {
        let (state, _tx, mut rx) = state_with(running(vec![Some(20.0), Some(19.8), Some(20.5)]));
        let response = build_router(state).oneshot(post("/api/balance")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["accepted"], true);
        assert!(json.get("reason").is_none());
        assert_eq!(rx.try_recv().ok(), Some(SupervisorCommand::RequestBalance));
    }

    #[tokio::test]
    async fn balance_rejected_with_conflict() {
        let mut snap = running(vec![Some(20.0), Some(19.8), Some(20.5)]);
        snap.balancing = true;
        let (state, _tx, mut rx) = state_with(snap);
        let response = build_router(state).oneshot(post("/api/balance")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["accepted"], false);
        assert_eq!(json["reason"], "Balancing already in progress");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn config_is_exposed() {
        let (state, _tx, _rx) = state_with(StatusSnapshot::initial());
        let response = build_router(state).oneshot(get_req("/api/config")).await.unwrap();
        let json = body_json(response).await;
        assert_eq!(json["banks"]["count"], 3);
        assert_eq!(json["temperature"]["num_channels"], 24);
    }

    #[tokio::test]
    async fn events_stream_status_snapshots() {
        let (state, _tx, _rx) = state_with(running(vec![Some(20.0)]));
        let response = build_router(state).oneshot(get_req("/api/events")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ct = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        assert!(ct.contains("text/event-stream"));

        let mut body = response.into_body();
        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), body.frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(frame.data_ref().unwrap()).to_string();
        assert!(text.contains("event: status"), "{}", text);
        assert!(text.contains("\"Running\""), "{}", text);
    }
}

//! `HubServer`: axum HTTP + WebSocket front end for the hub.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metahub_core::{Identity, Role};
use metahub_telemetry::{MetricsRecorder, MetricsReport};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::health::{health_check, HealthResponse};
use crate::hub::Hub;
use crate::session::run_ws_session;
use crate::shutdown::ShutdownCoordinator;

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Arc<ServerConfig>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
}

pub struct HubServer {
    config: Arc<ServerConfig>,
    hub: Arc<Hub>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl HubServer {
    pub fn new(config: ServerConfig) -> Self {
        let metrics = Arc::new(MetricsRecorder::new());
        let hub = Arc::new(Hub::new(config.routing.clone(), metrics));
        Self {
            config: Arc::new(config),
            hub,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            hub: Arc::clone(&self.hub),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/clients", get(clients_handler))
            .route("/bindings", get(bindings_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve in the background until shutdown is signalled.
    ///
    /// Port `0` picks a free port; the bound address is returned.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "metahub listening");

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                warn!(error = %e, "server stopped with error");
            }
        });
        Ok((local_addr, handle))
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        self.hub.metrics()
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    let active = state.shutdown.active_tasks();
    if active >= state.config.max_connections {
        warn!(active, max = state.config.max_connections, "connection limit reached, rejecting upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let AppState {
        hub, config, shutdown, ..
    } = state;
    ws.max_message_size(config.max_message_size)
        .on_upgrade(move |socket| {
            let token = shutdown.token();
            shutdown.track(run_ws_session(socket, hub, config, token))
        })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let hub = &state.hub;
    Json(health_check(
        state.start_time,
        hub.connection_count(),
        hub.list(Role::Env).len(),
        hub.list(Role::Agent).len(),
        hub.list(Role::Human).len(),
    ))
}

#[derive(Debug, Deserialize)]
struct ClientsQuery {
    role: Option<String>,
}

/// Connected ids for one role, or for every client role when omitted.
async fn clients_handler(State(state): State<AppState>, Query(query): Query<ClientsQuery>) -> Response {
    let Some(raw) = query.role else {
        let all: BTreeMap<&str, Vec<String>> = [Role::Env, Role::Agent, Role::Human]
            .into_iter()
            .map(|role| (role.as_str(), state.hub.list(role)))
            .collect();
        return Json(all).into_response();
    };
    match raw.parse::<Role>() {
        Ok(role) => Json(json!({ "role": role, "ids": state.hub.list(role) })).into_response(),
        Err(()) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("invalid role '{raw}'"),
                "valid_roles": Role::valid_names(),
            })),
        )
            .into_response(),
    }
}

async fn bindings_handler(State(state): State<AppState>) -> Json<BTreeMap<String, Vec<Identity>>> {
    Json(state.hub.bindings_snapshot())
}

async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsReport> {
    Json(state.hub.metrics().report())
}

//! Directory server: WebSocket transport in front of [`Directory`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::directory::Directory;
use crate::relay::{Outbox, RelayHub};
use crate::session::EndpointId;
use crate::signaling::{ClientMessage, ServerMessage};

/// Shared state handed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<Directory>,
    pub hub: Arc<RelayHub>,
    pub heartbeat_interval: Duration,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        let hub = Arc::new(RelayHub::new(config.max_send_queue));
        let outbox: Arc<dyn Outbox> = hub.clone();
        let directory = Arc::new(Directory::new(outbox, config.directory.clone()));
        Self {
            directory,
            hub,
            heartbeat_interval: config.heartbeat_interval,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sessions: usize,
    pub endpoints: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind and serve in the background. Port 0 picks a free port.
pub async fn start(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(&config);
    let directory = Arc::clone(&state.directory);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.addr()).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "directory server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            warn!(error = %e, "directory server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        directory,
        server,
    })
}

/// Keeps the server task alive; dropping it does not stop the server, [`shutdown`](Self::shutdown) does.
pub struct ServerHandle {
    pub port: u16,
    directory: Arc<Directory>,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    pub fn shutdown(self) {
        self.server.abort();
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.directory.session_count(),
        endpoints: state.hub.count(),
    })
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (endpoint, rx) = state.hub.register();
    state.directory.connect(&endpoint);
    info!(endpoint_id = %endpoint, "endpoint connected");

    state.hub.deliver(
        &endpoint,
        &ServerMessage::Welcome {
            endpoint_id: endpoint.clone(),
        },
    );

    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        rx,
        endpoint.clone(),
        state.heartbeat_interval,
    ));

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => dispatch(&state, &endpoint, text.as_str()),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(endpoint_id = %endpoint, error = %e, "socket read failed");
                    break;
                }
            },
            // Evicted from the relay, or the socket stopped taking writes.
            _ = &mut writer => {
                debug!(endpoint_id = %endpoint, "writer finished, dropping connection");
                break;
            }
        }
    }

    writer.abort();
    state.directory.disconnect(&endpoint);
    state.hub.unregister(&endpoint);
}

async fn write_loop(
    mut ws_tx: futures::stream::SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<String>,
    endpoint: EndpointId,
    heartbeat: Duration,
) {
    let mut ping = tokio::time::interval(heartbeat);
    ping.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(text) => {
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                trace!(endpoint_id = %endpoint, "sent ping");
            }
        }
    }
    let _ = ws_tx.close().await;
}

/// Apply one client frame. Replies travel through the relay queue like everything else.
pub fn dispatch(state: &AppState, endpoint: &EndpointId, raw: &str) {
    let message: ClientMessage = match serde_json::from_str(raw) {
        Ok(m) => m,
        Err(e) => {
            warn!(endpoint_id = %endpoint, error = %e, "malformed client frame");
            state
                .hub
                .deliver(endpoint, &ServerMessage::malformed(format!("invalid message: {e}")));
            return;
        }
    };

    let directory = &state.directory;
    match message {
        ClientMessage::SetDisplayName { name } => directory.set_display_name(endpoint, &name),
        ClientMessage::CreateSession { display_name } => {
            let _ = directory.create_session(endpoint, display_name.as_deref());
        }
        ClientMessage::JoinSession {
            session_id,
            display_name,
        } => {
            let _ = directory.join_session(endpoint, &session_id, display_name.as_deref());
        }
        ClientMessage::LeaveSession { session_id } => directory.leave_session(endpoint, &session_id),
        ClientMessage::Signal { target, payload } => {
            directory.relay_signal(endpoint, &target, payload);
        }
    }
}

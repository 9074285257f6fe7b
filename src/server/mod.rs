pub mod ingest;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::{resolve_bind_addr, ServerConfig};
use crate::export::HealthMetrics;
use crate::record::RecordClient;
use crate::registry::{ConnectionRegistry, Interest};

pub use ingest::{Ingest, Outcome};

/// Telemetry server: owns the ingest pipeline and the listener task.
pub struct Server<R> {
    cfg: ServerConfig,
    ingest: Arc<Ingest<R>>,
    health: Arc<HealthMetrics>,
    connections: TaskTracker,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<R: RecordClient + 'static> Server<R> {
    pub fn new(
        cfg: ServerConfig,
        client: Arc<R>,
        health: Arc<HealthMetrics>,
        max_in_flight: usize,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let ingest = Arc::new(Ingest::new(
            client,
            registry,
            Arc::clone(&health),
            max_in_flight,
        ));

        Self {
            cfg,
            ingest,
            health,
            connections: TaskTracker::new(),
            shutdown: parking_lot::Mutex::new(None),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn ingest(&self) -> &Arc<Ingest<R>> {
        &self.ingest
    }

    /// Binds the listener and starts serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = resolve_bind_addr(&self.cfg.listen_addr);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let state = Arc::new(AppState {
            ingest: Arc::clone(&self.ingest),
            health: Arc::clone(&self.health),
            queue_size: self.cfg.outbound_queue_size.max(1),
            cancel: cancel.clone(),
            connections: self.connections.clone(),
        });

        let app = Router::new()
            .route(&self.cfg.path, get(ws_handler::<R>))
            .with_state(state);

        let path = self.cfg.path.clone();
        let task = tokio::spawn(async move {
            info!(addr = %local_addr, path = %path, "telemetry server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "telemetry server error");
            }
        });

        *self.task.lock() = Some(task);

        Ok(local_addr)
    }

    /// Stops accepting connections, closes open ones after their current
    /// message and waits for pending report submissions.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.context("joining telemetry server task")?;
        }

        self.connections.close();
        self.connections.wait().await;

        let mut devices = self.ingest.sessions().device_ids();
        devices.sort();
        debug!(?devices, "sessions held at shutdown");

        self.ingest.synthesizer().shutdown().await;

        info!("telemetry server stopped");

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState<R> {
    ingest: Arc<Ingest<R>>,
    health: Arc<HealthMetrics>,
    queue_size: usize,
    cancel: CancellationToken,
    connections: TaskTracker,
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    /// Comma-separated device ids.
    subscribe: Option<String>,
}

/// GET {path} - WebSocket upgrade. Devices and dashboards share the route;
/// `subscribe` limits which devices a connection is notified about.
async fn ws_handler<R: RecordClient + 'static>(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState<R>>>,
) -> impl IntoResponse {
    let interest = Interest::from_query(params.subscribe.as_deref());
    let tracker = state.connections.clone();

    ws.on_upgrade(move |socket| tracker.track_future(handle_socket(socket, peer, interest, state)))
}

async fn handle_socket<R: RecordClient + 'static>(
    socket: WebSocket,
    peer: SocketAddr,
    interest: Interest,
    state: Arc<AppState<R>>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(state.queue_size);

    let registry = Arc::clone(state.ingest.registry());
    let handle = registry.register(tx, interest);
    state.health.connections_active.inc();
    info!(peer = %peer, connections = registry.len(), "connection opened");

    // Ends when the registry drops the sender.
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text.as_ref().into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Ping frames are answered by the transport.
    loop {
        let frame = tokio::select! {
            _ = state.cancel.cancelled() => {
                debug!(peer = %peer, "closing connection for shutdown");
                break;
            }
            frame = ws_rx.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                state.ingest.handle_frame(text.as_str(), Utc::now()).await;
            }
            Some(Ok(Message::Binary(data))) => {
                debug!(peer = %peer, len = data.len(), "ignoring binary frame");
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(peer = %peer, error = %e, "connection error");
                break;
            }
        }
    }

    registry.unregister(handle);
    state.health.connections_active.dec();

    if let Err(e) = writer.await {
        debug!(peer = %peer, error = %e, "writer task failed");
    }

    info!(peer = %peer, connections = registry.len(), "connection closed");
}

//! Control WebSocket server
//!
//! One server, many concurrent operator sessions. Commands are dispatched
//! against the engine and acknowledged per message; state and frame-stat
//! events are broadcast to every writable session. A handler failure or a
//! malformed message produces an `error` event, never a disconnect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{EngineSnapshot, PlayoutEngine};
use crate::output::OutputManager;
use crate::surface::Size;
use crate::template::{Compositor, TemplateDialect};

use super::{
    Command, CommandFrame, Event, InfoPayload, ServerNotice, Transition, AUTH_REJECT_CLOSE_CODE,
};

/// Queued outbound messages per session; a session that stops draining gets
/// skipped, not blocked on.
const SESSION_QUEUE: usize = 64;

/// Mix length when the operator sends `transition: "mix"` with no duration.
const DEFAULT_MIX_MS: u64 = 1000;

/// Everything command dispatch needs.
pub struct ControlContext {
    pub engine: Arc<PlayoutEngine>,
    pub manager: Arc<OutputManager>,
    pub compositor: StdMutex<Compositor>,
    pub auth_token: Option<String>,
    pub version: String,
    pub resolution: Size,
    pub frame_rate: f64,
}

struct ClientSession {
    #[allow(dead_code)]
    peer_address: SocketAddr,
    #[allow(dead_code)]
    connected_at: DateTime<Utc>,
    tx: mpsc::Sender<String>,
}

pub struct ControlServer {
    ctx: ControlContext,
    sessions: StdMutex<HashMap<Uuid, ClientSession>>,
    notices: mpsc::UnboundedSender<ServerNotice>,
}

enum Reply {
    /// Acknowledge when the command carried an id.
    Ack,
    /// The command already produced its own reply event.
    Direct,
}

impl ControlServer {
    pub fn new(ctx: ControlContext, notices: mpsc::UnboundedSender<ServerNotice>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            sessions: StdMutex::new(HashMap::new()),
            notices,
        })
    }

    /// Bind and serve. Returns the accept-loop task.
    pub async fn serve(self: Arc<Self>, port: u16) -> anyhow::Result<JoinHandle<()>> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "control server listening");
        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state(self);
        Ok(tokio::spawn(async move {
            if let Err(err) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                error!(error = %err, "control server terminated");
            }
        }))
    }

    pub fn client_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn broadcast_state(&self, snapshot: EngineSnapshot) {
        self.broadcast(&Event::State(snapshot));
    }

    pub fn broadcast_stats(&self, fps: f64, dropped: u64) {
        self.broadcast(&Event::FrameUpdate { fps, dropped });
    }

    /// Serialize once, then hand the same bytes to every session whose queue
    /// is writable. Backpressured or closing sessions are skipped.
    fn broadcast(&self, event: &Event) {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to serialize broadcast event");
                return;
            }
        };
        let sessions = self.sessions.lock().unwrap();
        for session in sessions.values() {
            let _ = session.tx.try_send(text.clone());
        }
    }

    fn auth_ok(&self, token: Option<&str>) -> bool {
        match self.ctx.auth_token.as_deref() {
            Some(expected) => token == Some(expected),
            None => true,
        }
    }

    fn register_session(&self, addr: SocketAddr) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        self.sessions.lock().unwrap().insert(
            id,
            ClientSession {
                peer_address: addr,
                connected_at: Utc::now(),
                tx,
            },
        );
        let total = self.client_count();
        info!(client = %id, %addr, total, "control client connected");
        let _ = self
            .notices
            .send(ServerNotice::ClientConnected { total_clients: total });
        (id, rx)
    }

    fn unregister_session(&self, id: Uuid) {
        if self.sessions.lock().unwrap().remove(&id).is_some() {
            let total = self.client_count();
            info!(client = %id, total, "control client disconnected");
            let _ = self
                .notices
                .send(ServerNotice::ClientDisconnected { total_clients: total });
        }
    }

    fn session_tx(&self, id: Uuid) -> Option<mpsc::Sender<String>> {
        self.sessions.lock().unwrap().get(&id).map(|s| s.tx.clone())
    }

    async fn handle_socket(self: Arc<Self>, mut socket: WebSocket, addr: SocketAddr, token: Option<String>) {
        if !self.auth_ok(token.as_deref()) {
            warn!(%addr, "control client rejected: bad token");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: AUTH_REJECT_CLOSE_CODE,
                    reason: Utf8Bytes::from_static("Unauthorized"),
                })))
                .await;
            return;
        }

        let (id, mut out_rx) = self.register_session(addr);
        let out_tx = match self.session_tx(id) {
            Some(tx) => tx,
            None => return,
        };

        // Every freshly connected client immediately sees the current state.
        send_event(&out_tx, &Event::State(self.ctx.engine.snapshot().await));

        let (mut ws_tx, mut ws_rx) = socket.split();
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_message(text.as_str(), &out_tx).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(client = %id, error = %err, "control socket error");
                    break;
                }
            }
        }

        writer.abort();
        self.unregister_session(id);
    }

    /// Decode and run one message. Never closes the session.
    async fn handle_message(&self, raw: &str, out: &mpsc::Sender<String>) {
        let frame: CommandFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "undecodable control message");
                send_event(
                    out,
                    &Event::Error {
                        id: None,
                        message: "invalid message".to_string(),
                    },
                );
                return;
            }
        };

        let id = frame.id;
        let command = match Command::parse(&frame.kind, frame.payload) {
            Ok(command) => command,
            Err(err) => {
                send_event(
                    out,
                    &Event::Error {
                        id,
                        message: err.to_string(),
                    },
                );
                return;
            }
        };

        match self.dispatch(command, out).await {
            Ok(Reply::Ack) => {
                if let Some(id) = id {
                    send_event(out, &Event::Ack { id, success: true });
                }
            }
            Ok(Reply::Direct) => {}
            Err(message) => send_event(out, &Event::Error { id, message }),
        }
    }

    async fn dispatch(&self, command: Command, out: &mpsc::Sender<String>) -> Result<Reply, String> {
        let engine = &self.ctx.engine;
        match command {
            // Auth is enforced on connect; the in-band command is a no-op.
            Command::Auth(_) => Ok(Reply::Ack),
            Command::Load(p) => {
                let dialect = if p.is_ograf {
                    TemplateDialect::Ograf
                } else {
                    TemplateDialect::Classic
                };
                let payload = self.ctx.compositor.lock().unwrap().compose(
                    &p.template_html,
                    p.template_css.as_deref(),
                    p.variables,
                    p.template_id,
                    dialect,
                    p.ograf_manifest,
                );
                engine.load(payload).await.map_err(|e| e.to_string())?;
                Ok(Reply::Ack)
            }
            Command::Update(p) => {
                engine.update(p.variables).await.map_err(|e| e.to_string())?;
                Ok(Reply::Ack)
            }
            Command::UpdatePgm(p) => {
                engine
                    .update_pgm(p.variables)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Reply::Ack)
            }
            Command::Play => {
                engine.play().await.map_err(|e| e.to_string())?;
                Ok(Reply::Ack)
            }
            Command::Stop => {
                engine.stop().await.map_err(|e| e.to_string())?;
                Ok(Reply::Ack)
            }
            Command::Take(p) => {
                match p.transition {
                    Some(Transition::Mix) => {
                        let duration = Duration::from_millis(p.duration.unwrap_or(DEFAULT_MIX_MS));
                        engine.take_mix(duration).await.map_err(|e| e.to_string())?;
                    }
                    _ => engine.take().await.map_err(|e| e.to_string())?,
                }
                Ok(Reply::Ack)
            }
            Command::Clear => {
                engine.clear().await.map_err(|e| e.to_string())?;
                Ok(Reply::Ack)
            }
            Command::Freeze => {
                engine.freeze().await.map_err(|e| e.to_string())?;
                Ok(Reply::Ack)
            }
            Command::Next => {
                engine.next().await.map_err(|e| e.to_string())?;
                Ok(Reply::Ack)
            }
            Command::TestSignal(p) => {
                let payload = self
                    .ctx
                    .compositor
                    .lock()
                    .unwrap()
                    .test_signal(&p.pattern, p.alpha);
                engine.load(payload).await.map_err(|e| e.to_string())?;
                Ok(Reply::Ack)
            }
            Command::Status => {
                send_event(out, &Event::State(engine.snapshot().await));
                Ok(Reply::Direct)
            }
            Command::GetInfo => {
                send_event(
                    out,
                    &Event::Info(InfoPayload {
                        version: self.ctx.version.clone(),
                        resolution: self.ctx.resolution,
                        frame_rate: self.ctx.frame_rate,
                        hardware: self.ctx.manager.active_outputs(),
                    }),
                );
                Ok(Reply::Direct)
            }
            Command::SetOutput(value) => {
                let _ = self.notices.send(ServerNotice::SetOutput(value));
                Ok(Reply::Ack)
            }
        }
    }
}

fn send_event(out: &mpsc::Sender<String>, event: &Event) {
    if let Ok(text) = serde_json::to_string(event) {
        let _ = out.try_send(text);
    }
}

async fn ws_handler(
    State(server): State<Arc<ControlServer>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| server.handle_socket(socket, addr, token))
}

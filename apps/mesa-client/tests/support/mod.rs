//! In-process push-endpoint stand-in for channel and sync tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant, sleep};
use url::Url;

use mesa_client_core::session::{MemoryStore, SessionStore};

#[derive(Clone, Copy, Debug)]
pub enum ServerCommand {
    /// Push one text frame to every live connection.
    Send,
    /// Close every live connection from the server side.
    Close,
}

#[derive(Clone)]
struct AppState {
    connections: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<String>>>,
    commands: broadcast::Sender<ServerCommand>,
}

pub struct PushServer {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<String>>>,
    commands: broadcast::Sender<ServerCommand>,
}

impl PushServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");

        let connections = Arc::new(AtomicUsize::new(0));
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let (commands, _) = broadcast::channel(16);

        let state = AppState {
            connections: Arc::clone(&connections),
            tokens: Arc::clone(&tokens),
            commands: commands.clone(),
        };
        let app = Router::new().route("/ws", get(upgrade)).with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server");
        });

        Self {
            addr,
            connections,
            tokens,
            commands,
        }
    }

    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).expect("base url")
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn seen_tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    pub fn push_message(&self) {
        let _ = self.commands.send(ServerCommand::Send);
    }

    pub fn close_connections(&self) {
        let _ = self.commands.send(ServerCommand::Close);
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    state.connections.fetch_add(1, Ordering::SeqCst);
    if let Some(token) = params.get("token") {
        state.tokens.lock().push(token.clone());
    }
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: AppState) {
    let mut commands = state.commands.subscribe();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Ok(ServerCommand::Send) => {
                    if socket.send(Message::Text("changed".to_string())).await.is_err() {
                        break;
                    }
                }
                Ok(ServerCommand::Close) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(_) => break,
            },
            frame = socket.recv() => match frame {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

pub fn credential_for(username: &str) -> String {
    let exp = time::OffsetDateTime::now_utc().unix_timestamp() + 3600;
    let payload = format!(r#"{{"username":"{username}","role":"Cashier","exp":{exp}}}"#);
    let encoded = URL_SAFE_NO_PAD.encode(payload.as_bytes());
    format!("header.{encoded}.signature")
}

pub fn authenticated_session() -> Arc<SessionStore> {
    let session = Arc::new(SessionStore::new(Arc::new(MemoryStore::new())));
    session
        .save_token(&credential_for("amir"))
        .expect("seed session");
    session
}

pub fn empty_session() -> Arc<SessionStore> {
    Arc::new(SessionStore::new(Arc::new(MemoryStore::new())))
}

/// Poll `check` every few milliseconds until it holds or `deadline` passes.
pub async fn wait_for(what: &str, deadline: Duration, check: impl Fn() -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

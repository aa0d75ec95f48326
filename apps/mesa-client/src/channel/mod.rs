//! The long-lived push channel.
//!
//! One websocket connection at a time carries exactly one semantic event:
//! "server state may have changed". Payloads are never parsed. The connection
//! lifecycle is an explicit state machine (Idle, Connecting, Open, Backoff)
//! with a cancellable reconnect timer, so the no-double-schedule and
//! manual-disconnect invariants are directly testable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use crate::session::SessionStore;

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

// Signals are idempotent, so a slow subscriber that overflows this buffer
// just observes a `Lagged` and keeps going; dropped signals coalesce into
// whichever one it receives next.
const SIGNAL_BUFFER: usize = 16;

/// A payload-free "state may have changed" notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Backoff,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("base address has no host")]
    MissingHost,
    #[error("invalid channel address: {0}")]
    Address(#[from] url::ParseError),
}

enum Lifecycle {
    Idle,
    Connecting {
        id: u64,
        task: JoinHandle<()>,
    },
    Open {
        id: u64,
        task: JoinHandle<()>,
        shutdown: mpsc::UnboundedSender<()>,
    },
    Backoff {
        id: u64,
        timer: JoinHandle<()>,
    },
}

impl Lifecycle {
    fn state(&self) -> ChannelState {
        match self {
            Lifecycle::Idle => ChannelState::Idle,
            Lifecycle::Connecting { .. } => ChannelState::Connecting,
            Lifecycle::Open { .. } => ChannelState::Open,
            Lifecycle::Backoff { .. } => ChannelState::Backoff,
        }
    }
}

/// Owns the push connection and republishes inbound frames as
/// [`ChangeSignal`]s to any number of subscribers.
///
/// Cheap to clone; all clones share the same connection. Requires a tokio
/// runtime context for `connect`.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    base_url: Url,
    reconnect_delay: Duration,
    session: Arc<SessionStore>,
    lifecycle: Mutex<Lifecycle>,
    manual_disconnect: AtomicBool,
    // Monotonic id handed to every spawned attempt and timer, so a stale
    // task finishing late cannot clobber a newer lifecycle entry.
    generation: AtomicU64,
    signal_tx: broadcast::Sender<ChangeSignal>,
}

impl RealtimeChannel {
    pub fn new(base_url: Url, session: Arc<SessionStore>) -> Self {
        Self::with_reconnect_delay(base_url, session, DEFAULT_RECONNECT_DELAY)
    }

    pub fn with_reconnect_delay(
        base_url: Url,
        session: Arc<SessionStore>,
        reconnect_delay: Duration,
    ) -> Self {
        let (signal_tx, _) = broadcast::channel(SIGNAL_BUFFER);
        Self {
            inner: Arc::new(ChannelInner {
                base_url,
                reconnect_delay,
                session,
                lifecycle: Mutex::new(Lifecycle::Idle),
                manual_disconnect: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                signal_tx,
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lifecycle.lock().state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSignal> {
        self.inner.signal_tx.subscribe()
    }

    /// Open the push channel. No-op while a connection is live or a reconnect
    /// is already pending; fails fast with a log line (never an error) when
    /// the session holds no credential. Clears the manual-disconnect flag.
    pub fn connect(&self) {
        self.inner.manual_disconnect.store(false, Ordering::SeqCst);
        let mut lifecycle = self.inner.lifecycle.lock();
        match &*lifecycle {
            Lifecycle::Connecting { .. } | Lifecycle::Open { .. } => {
                tracing::debug!(target: "mesa::channel", "connect ignored; channel already active");
            }
            Lifecycle::Backoff { .. } => {
                tracing::debug!(target: "mesa::channel", "connect ignored; reconnect already pending");
            }
            Lifecycle::Idle => self.inner.spawn_attempt(&mut lifecycle),
        }
    }

    /// Intentionally close the channel: cancel any pending reconnect, send a
    /// normal-closure frame on a live connection, and suppress auto-reconnect
    /// until the next `connect`.
    pub fn disconnect(&self) {
        self.inner.manual_disconnect.store(true, Ordering::SeqCst);
        let mut lifecycle = self.inner.lifecycle.lock();
        match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
            Lifecycle::Idle => {}
            Lifecycle::Connecting { task, .. } => task.abort(),
            Lifecycle::Open { shutdown, .. } => {
                // The socket task sends the close frame and exits on its own.
                let _ = shutdown.send(());
            }
            Lifecycle::Backoff { timer, .. } => timer.abort(),
        }
    }
}

impl ChannelInner {
    fn spawn_attempt(self: &Arc<Self>, lifecycle: &mut Lifecycle) {
        let Some(credential) = self.session.token() else {
            tracing::warn!(target: "mesa::channel", "no credential present; skipping channel connect");
            *lifecycle = Lifecycle::Idle;
            return;
        };
        let id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let task = tokio::spawn(run_connection(Arc::clone(self), id, credential));
        *lifecycle = Lifecycle::Connecting { id, task };
    }

    fn promote_to_open(&self, id: u64, shutdown: mpsc::UnboundedSender<()>) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let current = std::mem::replace(&mut *lifecycle, Lifecycle::Idle);
        match current {
            Lifecycle::Connecting { id: current_id, task } if current_id == id => {
                *lifecycle = Lifecycle::Open { id, task, shutdown };
                true
            }
            other => {
                // Superseded while handshaking (disconnect raced us).
                *lifecycle = other;
                false
            }
        }
    }

    /// Called by a connection task when its socket closed or failed. Schedules
    /// exactly one reconnect unless the close was requested by us.
    fn on_closed(self: &Arc<Self>, id: u64) {
        let mut lifecycle = self.lifecycle.lock();
        let owns = match &*lifecycle {
            Lifecycle::Connecting { id: current, .. } | Lifecycle::Open { id: current, .. } => {
                *current == id
            }
            _ => false,
        };
        if !owns {
            return;
        }
        if self.manual_disconnect.load(Ordering::SeqCst) {
            *lifecycle = Lifecycle::Idle;
            return;
        }

        let backoff_id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.reconnect_delay;
        tracing::info!(
            target: "mesa::channel",
            delay_ms = delay.as_millis() as u64,
            "push channel lost; scheduling reconnect"
        );
        let inner = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.resume_from_backoff(backoff_id);
        });
        *lifecycle = Lifecycle::Backoff {
            id: backoff_id,
            timer,
        };
    }

    fn resume_from_backoff(self: &Arc<Self>, id: u64) {
        let mut lifecycle = self.lifecycle.lock();
        let owns = matches!(&*lifecycle, Lifecycle::Backoff { id: current, .. } if *current == id);
        if !owns {
            return;
        }
        if self.manual_disconnect.load(Ordering::SeqCst) {
            *lifecycle = Lifecycle::Idle;
            return;
        }
        self.spawn_attempt(&mut lifecycle);
    }
}

async fn run_connection(inner: Arc<ChannelInner>, id: u64, credential: String) {
    let url = match channel_url(&inner.base_url, &credential) {
        Ok(url) => url,
        Err(err) => {
            tracing::warn!(target: "mesa::channel", error = %err, "cannot derive channel address");
            inner.on_closed(id);
            return;
        }
    };

    // Never log the full url; the credential rides in its query string.
    tracing::debug!(target: "mesa::channel", host = ?url.host_str(), "opening push channel");
    let (socket, _response) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(err) => {
            tracing::warn!(target: "mesa::channel", error = %err, "push channel connect failed");
            inner.on_closed(id);
            return;
        }
    };

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();
    if !inner.promote_to_open(id, shutdown_tx) {
        return;
    }
    tracing::info!(target: "mesa::channel", "push channel open");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                }));
                let _ = sink.send(close).await;
                let _ = sink.flush().await;
                tracing::info!(target: "mesa::channel", "push channel closed by client");
                return;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                    // Arrival is the whole event; content is irrelevant.
                    let _ = inner.signal_tx.send(ChangeSignal);
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(target: "mesa::channel", "push channel closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::warn!(target: "mesa::channel", error = %err, "push channel error");
                    break;
                }
            }
        }
    }
    inner.on_closed(id);
}

/// Derive the streaming address from the shared base address: the secure HTTP
/// scheme upgrades to its secure streaming equivalent, anything else maps to
/// the insecure one. The credential travels as a query parameter because the
/// handshake request cannot carry arbitrary headers in this transport.
fn channel_url(base: &Url, credential: &str) -> Result<Url, ChannelError> {
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    let host = base.host_str().ok_or(ChannelError::MissingHost)?;
    let mut address = format!("{scheme}://{host}");
    if let Some(port) = base.port() {
        address.push_str(&format!(":{port}"));
    }
    address.push_str("/ws");
    let mut url = Url::parse(&address)?;
    url.query_pairs_mut().append_pair("token", credential);
    Ok(url)
}

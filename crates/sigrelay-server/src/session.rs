//! One client's connection lifecycle.
//!
//! `Connecting → TlsHandshaking → WsHandshaking → Open → Closing → Closed`
//!
//! Each session runs on its own task. The task owns the only long-lived
//! strong reference to the [`Session`]; the registry keeps a weak one.
//! Outbound frames go through an unbounded channel drained by a single
//! writer, so at most one write is in flight and delivery is FIFO.
//! Dropping the last strong reference removes the session from the registry.

use crate::registry::Registry;
use futures_util::{SinkExt, StreamExt};
use sigrelay_core::SignalError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Opaque per-connection handle, never reused within a process.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

type WsStream = WebSocketStream<TlsStream<TcpStream>>;

/// Value of the `Server` header on the WebSocket handshake response.
const SERVER_HEADER: &str = concat!("sigrelay/", env!("CARGO_PKG_VERSION"));

/// Transport state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    TlsHandshaking,
    WsHandshaking,
    Open,
    Closing,
    Closed,
}

/// A connected client, shared between its own task and the registry.
pub struct Session {
    id: SessionId,
    remote_addr: Option<SocketAddr>,
    registry: Arc<Registry>,
    outbound: mpsc::UnboundedSender<String>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Create a session and the receiving end of its outbound queue.
    ///
    /// The session is not joined to the registry; that happens once the
    /// WebSocket handshake completes.
    pub fn new(
        registry: Arc<Registry>,
        remote_addr: Option<SocketAddr>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            registry,
            outbound,
            state: Mutex::new(SessionState::Connecting),
        });
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Current transport state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(session = self.id, from = ?*state, to = ?next, "session state");
        *state = next;
    }

    /// Move through `Closing` into `Closed`.
    fn finish(&self) {
        if self.state() != SessionState::Closing {
            self.transition(SessionState::Closing);
        }
        self.transition(SessionState::Closed);
    }

    /// Identity this session signed in with, if any.
    pub fn peer_id(&self) -> Option<String> {
        self.registry.peer_id_of(self)
    }

    /// Queue a frame for delivery. Never blocks; safe to call from any
    /// thread, including while the registry lock is held.
    pub fn send(&self, frame: String) {
        if self.outbound.send(frame).is_err() {
            debug!(session = self.id, "outbound queue closed, frame dropped");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.registry.leave(self);
    }
}

/// Start a session for an accepted TCP connection on its own task.
pub fn spawn(
    tcp: TcpStream,
    remote_addr: SocketAddr,
    tls: TlsAcceptor,
    registry: Arc<Registry>,
    handshake_timeout: Duration,
) {
    let (session, outbound_rx) = Session::new(registry, Some(remote_addr));
    tokio::spawn(run(session, outbound_rx, tcp, tls, handshake_timeout));
}

/// Drive one session from accept to teardown.
async fn run(
    session: Arc<Session>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    tcp: TcpStream,
    tls: TlsAcceptor,
    handshake_timeout: Duration,
) {
    let id = session.id;
    debug!(session = id, remote = ?session.remote_addr, "session accepted");

    let handshake = tokio::time::timeout(handshake_timeout, handshake(&session, tcp, tls)).await;
    let mut ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(failure)) => {
            failure.report(id);
            session.finish();
            return;
        }
        Err(_) => {
            fail(id, "handshake", &SignalError::Timeout);
            session.finish();
            return;
        }
    };

    if !session.registry.join(&session) {
        info!(session = id, remote = ?session.remote_addr, "registry full, rejecting session");
        session.transition(SessionState::Closing);
        let _ = ws.close(None).await;
        session.finish();
        return;
    }
    session.transition(SessionState::Open);
    info!(session = id, remote = ?session.remote_addr, "session open");

    let (mut sink, mut stream) = ws.split();

    let reader = async {
        loop {
            let text = match stream.next().await {
                Some(Ok(Message::Text(text))) => text.to_string(),
                Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Failure::ws("read", e)),
            };
            if let Some(response) = session.registry.handle_message(&session, &text) {
                session.send(response);
            }
        }
    };

    let writer = async {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(Message::text(frame)).await {
                return Err(Failure::ws("write", e));
            }
        }
        Ok(())
    };

    let outcome: Result<(), Failure> = tokio::select! {
        r = reader => r,
        w = writer => w,
    };
    if let Err(failure) = outcome {
        failure.report(id);
    }

    session.transition(SessionState::Closing);
    let _ = sink.close().await;
    info!(session = id, peer_id = ?session.peer_id(), "session closed");
    session.finish();
}

/// TLS handshake followed by the WebSocket upgrade.
async fn handshake(session: &Session, tcp: TcpStream, tls: TlsAcceptor) -> Result<WsStream, Failure> {
    session.transition(SessionState::TlsHandshaking);
    let tls_stream = tls.accept(tcp).await.map_err(Failure::Tls)?;

    session.transition(SessionState::WsHandshaking);
    let add_server_header = |_req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        resp.headers_mut()
            .insert("server", HeaderValue::from_static(SERVER_HEADER));
        Ok(resp)
    };
    tokio_tungstenite::accept_hdr_async(tls_stream, add_server_header)
        .await
        .map_err(|e| Failure::ws("accept", e))
}

/// A transport error that ends a session.
enum Failure {
    Tls(std::io::Error),
    WebSocket { op: &'static str, error: WsError },
}

impl Failure {
    fn ws(op: &'static str, error: WsError) -> Self {
        Failure::WebSocket { op, error }
    }

    /// Send non-benign failures to the failure sink.
    fn report(&self, id: SessionId) {
        match self {
            Failure::Tls(e) if !is_benign_io(e) => fail(id, "tls handshake", e),
            Failure::WebSocket { op, error } if !is_benign_ws(error) => fail(id, op, error),
            _ => {}
        }
    }
}

fn is_benign_io(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::ConnectionAborted
}

/// Cancellation and normal closure are not worth reporting.
fn is_benign_ws(e: &WsError) -> bool {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Io(io) => is_benign_io(io),
        _ => false,
    }
}

fn fail(id: SessionId, op: &str, error: &dyn std::fmt::Display) {
    warn!(session = id, op, error = %error, "session failure");
}

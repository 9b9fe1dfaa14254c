//! The backend control socket server and event loop.
//!
//! One logical executor services the listener, client sockets, and the
//! confirmed-commit timer. Connection reader tasks only split frames; every
//! frame is forwarded into the single event queue, so RPCs are processed in
//! arrival order across all sessions and handlers run to completion.
//!
//! Framing is the NETCONF 1.0 end-of-message marker.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use confmgr_common::{BackendError, BackendOptions, BackendResult, SockFamily};

use crate::backend::Backend;
use crate::event::BackendEvent;

/// NETCONF 1.0 end-of-message marker.
pub const EOM: &str = "]]>]]>";

/// The bound control socket.
pub enum ServerListener {
    /// Unix domain socket.
    Unix(UnixListener),
    /// IPv4/IPv6 TCP socket.
    Tcp(TcpListener),
}

impl ServerListener {
    /// Binds the control socket per the configured family and address.
    pub async fn bind(opts: &BackendOptions) -> BackendResult<Self> {
        match opts.sock_family {
            SockFamily::Unix => {
                let path = std::path::Path::new(&opts.sock);
                if path.exists() {
                    std::fs::remove_file(path)
                        .map_err(|e| BackendError::io("removing stale socket", e))?;
                }
                let listener = UnixListener::bind(path)
                    .map_err(|e| BackendError::io(format!("binding {}", opts.sock), e))?;
                info!(path = opts.sock.as_str(), "listening on unix socket");
                Ok(ServerListener::Unix(listener))
            }
            SockFamily::Ipv4 | SockFamily::Ipv6 => {
                let listener = TcpListener::bind(&opts.sock)
                    .await
                    .map_err(|e| BackendError::io(format!("binding {}", opts.sock), e))?;
                info!(addr = opts.sock.as_str(), "listening on tcp socket");
                Ok(ServerListener::Tcp(listener))
            }
        }
    }
}

/// The backend event loop.
pub struct BackendServer {
    backend: Backend,
    event_rx: mpsc::UnboundedReceiver<BackendEvent>,
}

impl BackendServer {
    /// Wraps an initialized backend and its event queue.
    pub fn new(backend: Backend, event_rx: mpsc::UnboundedReceiver<BackendEvent>) -> Self {
        Self { backend, event_rx }
    }

    /// Serves until SIGTERM/SIGINT, then shuts down gracefully.
    pub async fn run(self, listener: ServerListener) -> BackendResult<Backend> {
        let BackendServer {
            mut backend,
            mut event_rx,
        } = self;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| BackendError::io("installing SIGTERM handler", e))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| BackendError::io("installing SIGINT handler", e))?;

        loop {
            tokio::select! {
                accepted = accept(&listener) => {
                    match accepted {
                        Ok((stream, peer)) => attach_client(&mut backend, stream, peer),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                Some(event) = event_rx.recv() => {
                    handle_event(&mut backend, event).await;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    break;
                }
            }
        }

        // Stop accepting, finish cleanly: sessions are dropped, plugins get
        // their exit callbacks. The caller unlinks pidfile and socket.
        drop(listener);
        backend.terminate().await;
        Ok(backend)
    }
}

fn attach_client(backend: &mut Backend, stream: ClientStream, peer: String) {
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let session_id = backend.sessions.open(peer.clone(), "root", Some(reply_tx));
    let hello = backend.hello_message(session_id);
    if let Some(session) = backend.sessions.get(session_id) {
        session.send(hello);
    }
    let event_tx = backend.event_sender();
    match stream {
        ClientStream::Unix(s) => spawn_connection(s, session_id, event_tx, reply_rx),
        ClientStream::Tcp(s) => spawn_connection(s, session_id, event_tx, reply_rx),
    }
    debug!(session = session_id, peer = peer.as_str(), "client attached");
}

async fn handle_event(backend: &mut Backend, event: BackendEvent) {
    match event {
        BackendEvent::Connect {
            peer,
            username,
            reply,
        } => {
            // In-process transports (tests, front-end bridges).
            let session_id = backend.sessions.open(peer, username, Some(reply));
            let hello = backend.hello_message(session_id);
            if let Some(session) = backend.sessions.get(session_id) {
                session.send(hello);
            }
        }
        BackendEvent::Message {
            session_id,
            payload,
        } => {
            // Capture the channel first: the handler may tear the session
            // down (close-session) and the reply must still go out.
            let reply_tx = backend
                .sessions
                .get(session_id)
                .and_then(|s| s.reply_sender());
            if let Some(reply) = backend.handle_frame(session_id, &payload).await {
                if let Some(tx) = reply_tx {
                    let _ = tx.send(reply);
                }
            }
        }
        BackendEvent::Disconnect { session_id } => {
            backend.teardown_session(session_id).await;
        }
        BackendEvent::ConfirmTimeout { epoch } => {
            backend.on_confirm_timeout(epoch).await;
        }
    }
}

enum ClientStream {
    Unix(tokio::net::UnixStream),
    Tcp(tokio::net::TcpStream),
}

async fn accept(listener: &ServerListener) -> std::io::Result<(ClientStream, String)> {
    match listener {
        ServerListener::Unix(l) => {
            let (stream, _) = l.accept().await?;
            Ok((ClientStream::Unix(stream), "unix".to_string()))
        }
        ServerListener::Tcp(l) => {
            let (stream, addr) = l.accept().await?;
            Ok((ClientStream::Tcp(stream), addr.to_string()))
        }
    }
}

/// Spawns the reader and writer tasks for one client connection.
fn spawn_connection<S>(
    stream: S,
    session_id: u32,
    event_tx: mpsc::UnboundedSender<BackendEvent>,
    mut reply_rx: mpsc::UnboundedReceiver<String>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    tokio::spawn(async move {
        while let Some(message) = reply_rx.recv().await {
            if write_half.write_all(message.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(EOM.as_bytes()).await.is_err() {
                break;
            }
            let _ = write_half.flush().await;
        }
    });

    tokio::spawn(async move {
        let mut buffer: Vec<u8> = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            match read_half.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }
            while let Some(frame) = split_frame(&mut buffer) {
                if !frame.trim().is_empty()
                    && event_tx
                        .send(BackendEvent::Message {
                            session_id,
                            payload: frame,
                        })
                        .is_err()
                {
                    return;
                }
            }
        }
        let _ = event_tx.send(BackendEvent::Disconnect { session_id });
    });
}

/// Removes and returns the first complete frame from the buffer.
fn split_frame(buffer: &mut Vec<u8>) -> Option<String> {
    let eom = EOM.as_bytes();
    let pos = buffer
        .windows(eom.len())
        .position(|window| window == eom)?;
    let frame: Vec<u8> = buffer.drain(..pos + eom.len()).collect();
    let payload = &frame[..pos];
    Some(String::from_utf8_lossy(payload).into_owned())
}

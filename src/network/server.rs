//! WebSocket broadcast server
//!
//! Network I/O runs on a dedicated thread that owns a current-thread tokio
//! runtime serving an axum router. Everything the I/O thread learns is
//! pushed onto the [`ServerEvent`] queue for the main thread; the only state
//! it touches directly is the [`ConnectionRegistry`].
//!
//! Refreshing (e.g. after a port change) is cooperative: [`refresh`] stops
//! the listener and closes every viewer, then [`poll`], called once per main
//! loop tick, rebinds once the I/O thread has exited.
//!
//! [`refresh`]: BroadcastServer::refresh
//! [`poll`]: BroadcastServer::poll

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::constants::CLOSE_REASON_CONFIG_CHANGED;
use crate::error::NetworkError;
use crate::network::events::{EventSender, ServerEvent};
use crate::network::registry::{ConnectionRegistry, Outbound};
use crate::protocol::PacketWrapper;

/// How long the I/O thread waits for viewers to finish closing on shutdown
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Called with the outcome of a refresh
pub type RefreshCallback = Box<dyn FnOnce(bool) + Send>;

struct PendingRefresh {
    port: u16,
    callbacks: Vec<RefreshCallback>,
}

/// State shared with the I/O thread
struct IoShared {
    registry: Arc<ConnectionRegistry>,
    events: EventSender,
    live_connections: AtomicUsize,
}

/// Viewer-facing WebSocket server
pub struct BroadcastServer {
    registry: Arc<ConnectionRegistry>,
    events: EventSender,
    io_running: Arc<AtomicBool>,
    io_thread: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
    local_addr: Option<SocketAddr>,
    pending: Option<PendingRefresh>,
    generation: u64,
}

impl BroadcastServer {
    pub fn new(registry: Arc<ConnectionRegistry>, events: EventSender) -> Self {
        Self {
            registry,
            events,
            io_running: Arc::new(AtomicBool::new(false)),
            io_thread: None,
            shutdown: None,
            local_addr: None,
            pending: None,
            generation: 0,
        }
    }

    /// Start listening on `port`. Failure is logged and leaves the server
    /// idle; there is no retry.
    pub fn init(&mut self, port: u16) -> bool {
        tracing::info!("Initializing socket");
        self.start(port).is_ok()
    }

    /// Bind and spawn the I/O thread
    pub fn start(&mut self, port: u16) -> Result<SocketAddr, NetworkError> {
        if self.io_running.load(Ordering::SeqCst) {
            return Err(NetworkError::BindFailed(
                "previous server thread is still running".to_string(),
            ));
        }

        let listener = bind_listener(port).map_err(|e| {
            tracing::error!("Socket listen failed: {}", e);
            e
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let shared = Arc::new(IoShared {
            registry: self.registry.clone(),
            events: self.events.clone(),
            live_connections: AtomicUsize::new(0),
        });
        let io_running = self.io_running.clone();

        self.generation += 1;
        io_running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name(format!("ws-io-{}", self.generation))
            .spawn(move || {
                run_io(listener, shared, shutdown_rx);
                io_running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.io_running.store(false, Ordering::SeqCst);
                tracing::error!("Failed to spawn server thread: {}", e);
                NetworkError::BindFailed(e.to_string())
            })?;

        self.io_thread = Some(handle);
        self.shutdown = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        tracing::info!(
            "Listening on {} (generation {})",
            local_addr,
            self.generation
        );
        Ok(local_addr)
    }

    /// Stop accepting and close every viewer. Does not wait for the I/O
    /// thread; see [`poll`](Self::poll).
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            tracing::info!("Stopping server on {:?}", self.local_addr);
            let _ = shutdown.send(());
            self.close_all();
        }
        self.local_addr = None;
    }

    /// Drop every viewer. Their disconnect handlers will find the registry
    /// already empty, so the main thread is told here instead.
    fn close_all(&self) {
        let closed = self.registry.close_all(CLOSE_REASON_CONFIG_CHANGED);
        tracing::debug!("Closed {} connections", closed);
        if closed > 0 {
            let _ = self.events.send(ServerEvent::RegistryEmptied);
        }
    }

    /// Restart the listener on `port`, closing every viewer.
    ///
    /// Completes on a later [`poll`](Self::poll). If a refresh is already in
    /// flight it is retargeted to `port` and `on_done` joins its callbacks.
    pub fn refresh(&mut self, port: u16, on_done: Option<RefreshCallback>) {
        match self.pending.as_mut() {
            Some(pending) => {
                tracing::info!("Refresh already pending, retargeting to port {}", port);
                pending.port = port;
                pending.callbacks.extend(on_done);
            }
            None => {
                tracing::info!("Refreshing server on port {}", port);
                self.stop();
                self.pending = Some(PendingRefresh {
                    port,
                    callbacks: on_done.into_iter().collect(),
                });
            }
        }
        self.poll();
    }

    /// Non-blocking: finish a pending refresh once the I/O thread is gone
    pub fn poll(&mut self) {
        if self.pending.is_none() || self.io_running.load(Ordering::SeqCst) {
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };

        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
        // Anything that slipped in before the listener closed is dead now
        self.close_all();

        let success = self.start(pending.port).is_ok();
        for callback in pending.callbacks {
            callback(success);
        }
    }

    pub fn is_listening(&self) -> bool {
        self.shutdown.is_some() && self.io_running.load(Ordering::SeqCst)
    }

    pub fn is_refreshing(&self) -> bool {
        self.pending.is_some()
    }

    /// Bound address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Send to every viewer except `exclude`
    pub fn broadcast(&self, packet: &PacketWrapper, exclude: Option<super::ConnectionId>) -> usize {
        self.registry.broadcast(packet, exclude)
    }
}

impl Drop for BroadcastServer {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
    }
}

fn bind_listener(port: u16) -> Result<StdTcpListener, NetworkError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let bind_err = |e: std::io::Error| NetworkError::BindFailed(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(128).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    Ok(socket.into())
}

/// Body of the I/O thread
fn run_io(listener: StdTcpListener, shared: Arc<IoShared>, shutdown: oneshot::Receiver<()>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to build server runtime: {}", e);
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Failed to register listener: {}", e);
                return;
            }
        };

        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state(shared.clone());

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.await;
            })
            .await;
        if let Err(e) = served {
            tracing::error!("Server terminated: {}", e);
        }

        // Give closing viewers a moment to flush their close frames
        let deadline = Instant::now() + CLOSE_GRACE;
        while shared.live_connections.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    tracing::debug!("Server thread exiting");
}

async fn ws_handler(ws: WebSocketUpgrade, State(shared): State<Arc<IoShared>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, shared))
}

/// Counts a viewer as live for as long as it is held
struct LiveGuard(Arc<IoShared>);

impl LiveGuard {
    fn new(shared: Arc<IoShared>) -> Self {
        shared.live_connections.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn handle_socket(socket: WebSocket, shared: Arc<IoShared>) {
    let _live = LiveGuard::new(shared.clone());
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let id = shared.registry.register(tx);
    tracing::info!("Connected: {}", id);
    let _ = shared.events.send(ServerEvent::Connected(id));

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Data(bytes) => {
                    if sink.send(Message::Binary(bytes.to_vec())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    let packet = PacketWrapper::decode_lenient(&data);
                    let _ = shared.events.send(ServerEvent::Message { from: id, packet });
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!("Connection {} errored: {}", id, e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = &mut writer => break,
        }
    }

    writer.abort();
    tracing::info!("Disconnected: {}", id);
    if shared.registry.unregister(id) {
        let _ = shared.events.send(ServerEvent::RegistryEmptied);
    }
}

//! TCP server: accept loop, per-connection registry, and the
//! [`ClientConnection`] handle the request processor is wired onto.
//!
//! Unlike the rest of this crate, nothing here is adapted from an existing
//! client-side socket wrapper: the teacher only ever dials out
//! ([`UsbIpSocket::connect`](crate::proto) never had a working `bind`), so
//! this accept loop is new, built on the same `socket2` primitives the
//! teacher already depends on.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tracing::{debug, warn};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind TCP listener: {0}")]
    BindFailed(String),
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

pub type ConnectedHook = Box<dyn Fn(Arc<ClientConnection>) + Send + Sync>;
pub type DataHook = Box<dyn Fn(&[u8]) + Send + Sync>;
pub type ConnectionErrorHook = Box<dyn Fn(&Error) + Send + Sync>;

/// One per accepted TCP socket.
pub struct ClientConnection {
    id: u64,
    stream: Mutex<TcpStream>,
    closed: AtomicBool,
    on_data_received: Mutex<Option<DataHook>>,
    on_error: Mutex<Option<ConnectionErrorHook>>,
}

impl ClientConnection {
    fn new(id: u64, stream: TcpStream) -> Self {
        Self {
            id,
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
            on_data_received: Mutex::new(None),
            on_error: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        self.stream
            .lock()
            .unwrap()
            .write_all(bytes)
            .map_err(|e| Error::ConnectionFailed(e.to_string()))
    }

    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.stream.lock().unwrap().shutdown(Shutdown::Both);
    }

    pub fn on_data_received(&self, hook: DataHook) {
        *self.on_data_received.lock().unwrap() = Some(hook);
    }

    pub fn on_error(&self, hook: ConnectionErrorHook) {
        *self.on_error.lock().unwrap() = Some(hook);
    }

    fn fire_data_received(&self, bytes: &[u8]) {
        if let Some(hook) = self.on_data_received.lock().unwrap().as_ref() {
            hook(bytes);
        }
    }

    fn fire_error(&self, err: &Error) {
        if let Some(hook) = self.on_error.lock().unwrap().as_ref() {
            hook(err);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopping,
}

struct Acceptor {
    listener: TcpListener,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Accept loop, per-connection registry, and lifecycle hooks. `Idle ->
/// Running -> (Stopping ->) Idle`.
pub struct TcpServer {
    state: Mutex<State>,
    acceptor: Mutex<Option<Acceptor>>,
    connections: Arc<Mutex<HashMap<u64, Arc<ClientConnection>>>>,
    next_id: AtomicU64,
    max_connections: usize,
    read_timeout: Duration,
    on_client_connected: Arc<Mutex<Option<ConnectedHook>>>,
    on_client_disconnected: Arc<Mutex<Option<ConnectedHook>>>,
}

impl TcpServer {
    pub fn new(max_connections: usize, read_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::Idle),
            acceptor: Mutex::new(None),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            max_connections,
            read_timeout,
            on_client_connected: Arc::new(Mutex::new(None)),
            on_client_disconnected: Arc::new(Mutex::new(None)),
        }
    }

    pub fn on_client_connected(&self, hook: ConnectedHook) {
        *self.on_client_connected.lock().unwrap() = Some(hook);
    }

    pub fn on_client_disconnected(&self, hook: ConnectedHook) {
        *self.on_client_disconnected.lock().unwrap() = Some(hook);
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock().unwrap() == State::Running
    }

    /// The address the listener is bound to. `None` when idle.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|a| a.listener.local_addr().ok())
    }

    /// Binds on all interfaces at `port`. Not idempotent: calling while
    /// running raises [`Error::AlreadyRunning`].
    pub fn start(&self, port: u16) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if *state != State::Idle {
            return Err(Error::AlreadyRunning);
        }

        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let socket =
            Socket::new(Domain::IPV4, Type::STREAM, None).map_err(|e| Error::BindFailed(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| Error::BindFailed(e.to_string()))?;
        socket
            .bind(&addr.into())
            .map_err(|e| Error::BindFailed(e.to_string()))?;
        socket
            .listen(128)
            .map_err(|e| Error::BindFailed(e.to_string()))?;

        let listener: TcpListener = socket.into();
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::BindFailed(e.to_string()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let connections = self.connections.clone();
        let max_connections = self.max_connections;
        let read_timeout = self.read_timeout;
        let on_connected = self.on_client_connected.clone();
        let on_disconnected = self.on_client_disconnected.clone();

        let listener_clone = listener
            .try_clone()
            .map_err(|e| Error::BindFailed(e.to_string()))?;

        let handle = std::thread::spawn(move || {
            accept_loop(
                listener_clone,
                stop_clone,
                connections,
                max_connections,
                read_timeout,
                on_connected,
                on_disconnected,
            )
        });

        *self.acceptor.lock().unwrap() = Some(Acceptor {
            listener,
            stop,
            handle,
        });
        *state = State::Running;

        Ok(())
    }

    /// Closes the listener and every live connection, then waits for the
    /// acceptor thread to exit. Raises [`Error::NotRunning`] if idle.
    pub fn stop(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == State::Idle {
                return Err(Error::NotRunning);
            }
            *state = State::Stopping;
        }

        if let Some(acceptor) = self.acceptor.lock().unwrap().take() {
            acceptor.stop.store(true, Ordering::Release);
            drop(acceptor.listener);
            let _ = acceptor.handle.join();
        }

        for (_, connection) in self.connections.lock().unwrap().drain() {
            connection.close();
        }

        *self.state.lock().unwrap() = State::Idle;

        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_loop(
    listener: TcpListener,
    stop: Arc<AtomicBool>,
    connections: Arc<Mutex<HashMap<u64, Arc<ClientConnection>>>>,
    max_connections: usize,
    read_timeout: Duration,
    on_connected: Arc<Mutex<Option<ConnectedHook>>>,
    on_disconnected: Arc<Mutex<Option<ConnectedHook>>>,
) {
    let next_id = AtomicU64::new(1);

    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if connections.lock().unwrap().len() >= max_connections {
                    debug!(%addr, "rejecting connection: at max_connections");
                    let _ = stream.shutdown(Shutdown::Both);
                    continue;
                }

                let _ = stream.set_read_timeout(Some(read_timeout));
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let connection = Arc::new(ClientConnection::new(id, stream));

                connections.lock().unwrap().insert(id, connection.clone());

                if let Some(hook) = on_connected.lock().unwrap().as_ref() {
                    hook(connection.clone());
                }

                let connections_for_reader = connections.clone();
                let on_disconnected = on_disconnected.clone();
                std::thread::spawn(move || {
                    serve_connection(connection.clone());
                    connections_for_reader.lock().unwrap().remove(&id);
                    if let Some(hook) = on_disconnected.lock().unwrap().as_ref() {
                        hook(connection);
                    }
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

/// Reads from `connection` until the peer disconnects or a transport error
/// occurs, delivering each chunk to `on_data_received` in arrival order.
/// Fires `on_error` (for transport errors) then returns exactly once.
fn serve_connection(connection: Arc<ClientConnection>) {
    let mut buf = [0u8; 4096];

    loop {
        if connection.is_closed() {
            return;
        }

        let read_result = {
            let mut stream = connection.stream.lock().unwrap();
            stream.read(&mut buf)
        };

        match read_result {
            Ok(0) => {
                connection.close();
                return;
            }
            Ok(n) => connection.fire_data_received(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                connection.fire_error(&Error::ConnectionFailed(e.to_string()));
                connection.close();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpStream as ClientStream;

    #[test]
    fn starting_twice_raises_already_running() {
        let server = TcpServer::new(10, Duration::from_secs(30));
        server.start(0).unwrap();
        assert!(matches!(server.start(0), Err(Error::AlreadyRunning)));
        server.stop().unwrap();
    }

    #[test]
    fn stopping_when_idle_raises_not_running() {
        let server = TcpServer::new(10, Duration::from_secs(30));
        assert!(matches!(server.stop(), Err(Error::NotRunning)));
    }

    #[test]
    fn send_after_close_raises_connection_closed() {
        let connection = ClientConnection::new(1, {
            let server = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = server.local_addr().unwrap();
            let _client = ClientStream::connect(addr).unwrap();
            server.accept().unwrap().0
        });

        connection.close();
        assert!(matches!(connection.send(b"hi"), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn echoes_a_single_request_end_to_end() {
        let server = TcpServer::new(10, Duration::from_secs(5));

        server.on_client_connected(Box::new(|conn| {
            conn.on_data_received(Box::new(move |bytes| {
                let _ = conn.send(bytes);
            }));
        }));

        server.start(0).unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = ClientStream::connect(addr).unwrap();
        client.write_all(b"ping").unwrap();

        let mut echoed = [0u8; 4];
        std::io::Read::read_exact(&mut client, &mut echoed).unwrap();
        assert_eq!(&echoed, b"ping");

        server.stop().unwrap();
    }

    #[test]
    fn connection_beyond_max_connections_is_closed_gracefully() {
        let server = TcpServer::new(1, Duration::from_secs(5));
        server.on_client_connected(Box::new(|conn| {
            conn.on_data_received(Box::new(move |bytes| {
                let _ = conn.send(bytes);
            }));
        }));
        server.start(0).unwrap();
        let addr = server.local_addr().unwrap();

        let _first = ClientStream::connect(addr).unwrap();
        // Give the acceptor a moment to register the first connection before
        // the second dial races it.
        std::thread::sleep(Duration::from_millis(200));

        let mut second = ClientStream::connect(addr).unwrap();
        second.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        // The server closes the connection without replying; a 0-length read
        // (EOF) or a reset are both acceptable evidence of the graceful close.
        let result = std::io::Read::read(&mut second, &mut buf);
        assert!(matches!(result, Ok(0)) || result.is_err());

        server.stop().unwrap();
    }
}

//! TLS request/response transport shared by both services.
//!
//! One acceptor thread takes TCP connections and hands each raw stream to a
//! bounded `rayon` pool. The worker performs the TLS handshake, reads exactly
//! one JSON request, dispatches it and writes exactly one response before the
//! connection is closed:
//!
//! `ACCEPTED → HANDSHAKEN → AUTHENTICATED → PARSED → ROUTED → RESPONDED → CLOSED`
//!
//! Handshake and request read share one deadline of `read_timeout`; a peer
//! that has not delivered a complete request by then is dropped without a
//! response. Any failure after the handshake short-circuits to an error
//! response.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use openssl::ssl::{SslAcceptor, SslConnector, SslStream};
use openssl::x509::X509Ref;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::ServiceError;
use crate::protocol::{self, ReadError, Response};

/// A service plugged into the transport.
pub trait RequestHandler: Send + Sync + 'static {
    /// The authenticated principal of one connection.
    type Peer: Send;

    /// Turn the peer certificate (if any) into a principal. Runs right after
    /// the handshake, before any request bytes are read.
    fn authenticate(&self, peer: Option<&X509Ref>) -> Result<Self::Peer, ServiceError>;

    /// Parse and serve one request.
    fn handle(&self, peer: &Self::Peer, request: Value) -> Result<Response, ServiceError>;
}

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub read_timeout: Duration,
    pub max_request_bytes: u64,
    pub debug: bool,
}

/// Stops a running [`Server`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    addr: std::net::SocketAddr,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // Wake the acceptor blocked in accept().
        let _ = TcpStream::connect_timeout(&self.addr, Duration::from_secs(1));
    }
}

pub struct Server<H: RequestHandler> {
    name: &'static str,
    listener: TcpListener,
    acceptor: Arc<SslAcceptor>,
    handler: Arc<H>,
    pool: ThreadPool,
    settings: ConnectionSettings,
    stop: Arc<AtomicBool>,
}

impl<H: RequestHandler> Server<H> {
    /// Bind the listening socket and build the worker pool.
    ///
    /// # Arguments
    /// * `name` - Service name used in logs and worker thread names
    /// * `addr` - Address to listen on; port 0 picks a free port
    /// * `threads` - Worker pool size
    pub fn bind(
        name: &'static str,
        addr: impl ToSocketAddrs,
        acceptor: SslAcceptor,
        handler: H,
        threads: usize,
        settings: ConnectionSettings,
    ) -> Result<Self, ServiceError> {
        let listener = TcpListener::bind(addr).map_err(|e| {
            ServiceError::InvalidConfiguration(format!("Failed to bind {} listener: {}", name, e))
        })?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{}-worker-{}", name, i))
            .build()
            .map_err(|e| {
                ServiceError::InvalidConfiguration(format!("Failed to build worker pool: {}", e))
            })?;
        Ok(Self {
            name,
            listener,
            acceptor: Arc::new(acceptor),
            handler: Arc::new(handler),
            pool,
            settings,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        Ok(ShutdownHandle {
            flag: Arc::clone(&self.stop),
            addr: self.local_addr()?,
        })
    }

    /// Accept connections until shut down. Never blocks on per-connection work.
    pub fn serve(self) -> Result<(), ServiceError> {
        if let Ok(addr) = self.local_addr() {
            info!("{} listening on {}", self.name, addr);
        }
        for stream in self.listener.incoming() {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let acceptor = Arc::clone(&self.acceptor);
                    let handler = Arc::clone(&self.handler);
                    let settings = self.settings;
                    self.pool.spawn(move || {
                        handle_connection(stream, &acceptor, handler.as_ref(), settings)
                    });
                }
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                }
            }
        }
        info!("{} stopped", self.name);
        Ok(())
    }
}

/// TCP stream whose reads all count against one connection deadline.
///
/// Each read gets the time left as its socket timeout and fails with
/// `TimedOut` once the deadline has passed, so trickling bytes cannot keep a
/// worker busy past `read_timeout`.
#[derive(Debug)]
struct DeadlineStream {
    inner: TcpStream,
    deadline: Instant,
}

impl DeadlineStream {
    fn new(inner: TcpStream, timeout: Duration) -> Self {
        Self {
            inner,
            deadline: Instant::now() + timeout,
        }
    }

    fn remaining(&self) -> io::Result<Duration> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "Connection read deadline exceeded",
            ))
        } else {
            Ok(left)
        }
    }
}

impl Read for DeadlineStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self.remaining()?;
        self.inner.set_read_timeout(Some(left))?;
        self.inner.read(buf)
    }
}

impl Write for DeadlineStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Service one connection to completion on a worker.
fn handle_connection<H: RequestHandler>(
    stream: TcpStream,
    acceptor: &SslAcceptor,
    handler: &H,
    settings: ConnectionSettings,
) {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if let Err(e) = stream.set_write_timeout(Some(settings.read_timeout)) {
        warn!("Failed to set socket write timeout for {}: {}", peer_addr, e);
        return;
    }

    let stream = DeadlineStream::new(stream, settings.read_timeout);
    let mut tls = match acceptor.accept(stream) {
        Ok(tls) => tls,
        Err(e) => {
            debug!("TLS handshake with {} failed: {}", peer_addr, e);
            return;
        }
    };
    debug!("Handshake with {} complete", peer_addr);

    let response = match respond(&mut tls, handler, settings) {
        Some(response) => response,
        None => {
            debug!("Connection from {} closed before a request was read", peer_addr);
            return;
        }
    };

    if let Err(e) = protocol::write_response(&mut tls, &response) {
        debug!("Failed to write response to {}: {}", peer_addr, e);
    }
    let _ = tls.shutdown();
    let stream = tls.get_mut();
    let _ = stream.inner.shutdown(Shutdown::Write);
    // Unread input at close turns the FIN into a reset that can discard the
    // response in flight; drain it within the same deadline.
    let mut rest = Read::take(&mut *stream, settings.max_request_bytes);
    let _ = io::copy(&mut rest, &mut io::sink());
    let _ = stream.inner.shutdown(Shutdown::Read);
}

/// Produce the response for one connection, or `None` when nothing should be
/// sent back.
///
/// The peer is authenticated (and, for the message server, checked against
/// the PKI) before a single request byte is read.
fn respond<H: RequestHandler>(
    tls: &mut SslStream<DeadlineStream>,
    handler: &H,
    settings: ConnectionSettings,
) -> Option<Response> {
    let peer_cert = tls.ssl().peer_certificate();
    let peer = match handler.authenticate(peer_cert.as_deref()) {
        Ok(peer) => peer,
        Err(err) => return Some(failure(err, settings)),
    };

    let request = match protocol::read_value(&mut *tls, settings.max_request_bytes) {
        Ok(value) => value,
        Err(ReadError::Closed(_)) => return None,
        Err(ReadError::Rejected(err)) => return Some(failure(err, settings)),
    };

    match handler.handle(&peer, request) {
        Ok(response) => Some(response),
        Err(err) => Some(failure(err, settings)),
    }
}

fn failure(err: ServiceError, settings: ConnectionSettings) -> Response {
    if err.kind().is_fatal() {
        crate::logging::log_unexpected(settings.debug, "Request failed", &err);
    } else {
        debug!("Request rejected with {}: {}", err.status().code, err);
    }
    Response::failure(&err)
}

/// Open a TLS connection, send one request and read one response.
///
/// Used by the client library and by the server's PKI cross-check.
pub fn exchange(
    connector: &SslConnector,
    host: &str,
    port: u16,
    verify_hostname: bool,
    timeout: Duration,
    request: &[u8],
    max_response_bytes: u64,
) -> Result<Response, ExchangeError> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(ExchangeError::Connect)?
        .next()
        .ok_or_else(|| {
            ExchangeError::Connect(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No address for {}", host),
            ))
        })?;
    let stream = TcpStream::connect_timeout(&addr, timeout).map_err(ExchangeError::Connect)?;
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .map_err(ExchangeError::Connect)?;

    let mut tls = connector
        .configure()
        .map(|c| c.verify_hostname(verify_hostname))
        .map_err(|e| ExchangeError::Handshake(e.to_string()))?
        .connect(host, stream)
        .map_err(|e| ExchangeError::Handshake(e.to_string()))?;

    io::Write::write_all(&mut tls, request).map_err(ExchangeError::Io)?;
    io::Write::flush(&mut tls).map_err(ExchangeError::Io)?;

    let response = match protocol::read_response(&mut tls, max_response_bytes) {
        Ok(response) => response,
        Err(ReadError::Closed(e)) => return Err(ExchangeError::Io(e)),
        Err(ReadError::Rejected(e)) => return Err(ExchangeError::Malformed(e.to_string())),
    };
    let _ = tls.shutdown();
    Ok(response)
}

/// Failure of a client-side exchange.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("Connection failed: {0}")]
    Connect(io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

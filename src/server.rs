use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::ServerConfig;
use crate::dispatch::{dispatch, dispatch_error, ConnectionContext};
use crate::request::{is_complete, ParsedRequest, MAX_REQUEST_LENGTH};
use crate::response::write_response;

/// How long the accept loop sleeps when no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Totals across all connections.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub num_requests: AtomicU64,
    pub total_in: AtomicU64,
    pub total_out: AtomicU64,
}

/// State shared between the accept loop, connection threads and the [`Server`] handle.
#[derive(Debug)]
struct Shared {
    config: Arc<ServerConfig>,
    running: AtomicBool,
    connections: AtomicUsize,
    stats: ServerStats,
}

/// A running server: one accept thread plus one thread per connection.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept_thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind to `addr` and start accepting connections in the background.
    pub fn start(config: Arc<ServerConfig>, addr: SocketAddr) -> Result<Self> {
        // Sets `SO_REUSEADDR` implicitly.
        let listener = TcpListener::bind(addr)
            .with_context(|| format!("failed to create listening socket for {}", addr))?;
        let local_addr = listener
            .local_addr()
            .context("failed to get listening address")?;
        listener
            .set_nonblocking(true)
            .context("failed to make listening socket non-blocking")?;

        let shared = Arc::new(Shared {
            config,
            running: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
            stats: ServerStats::default(),
        });
        let accept_shared = shared.clone();
        let accept_thread = thread::Builder::new()
            .name("accept".to_string())
            .spawn(move || accept_loop(listener, accept_shared))
            .context("failed to spawn accept thread")?;

        Ok(Self {
            local_addr,
            shared,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    /// Stop accepting new connections. Connections already accepted run to completion.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Wait for the accept loop to finish after [`Server::stop`].
    pub fn wait(&mut self) {
        if let Some(accept_thread) = self.accept_thread.take() {
            if accept_thread.join().is_err() {
                eprintln!("warning: accept thread panicked");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while shared.running.load(Ordering::Relaxed) {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Failed to accept, but try to keep serving existing connections.
                eprintln!("warning: accept() failed: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
        };

        let active = shared.connections.fetch_add(1, Ordering::SeqCst) + 1;
        if matches!(shared.config.max_connections, Some(max) if active > max) {
            shared.connections.fetch_sub(1, Ordering::SeqCst);
            drop(stream);
            continue;
        }

        let conn_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("conn-{}", addr))
            .spawn(move || {
                if let Err(e) = handle_connection(stream, addr, &conn_shared) {
                    if conn_shared.config.verbosity >= 1 {
                        eprintln!("warning: connection from {} failed: {}", addr, e);
                    }
                }
                conn_shared.connections.fetch_sub(1, Ordering::SeqCst);
            });
        if let Err(e) = spawned {
            shared.connections.fetch_sub(1, Ordering::SeqCst);
            eprintln!("warning: failed to spawn connection thread: {}", e);
        }
    }
}

/// Read one request, answer it and close the connection.
fn handle_connection(mut stream: TcpStream, addr: SocketAddr, shared: &Shared) -> io::Result<()> {
    let config = &shared.config;
    // Some platforms let accepted sockets inherit the listener's non-blocking flag.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(config.timeout)?;
    stream.set_write_timeout(config.timeout)?;

    let ctx = ConnectionContext::new(&addr.ip().to_string(), config.clone());
    let head = match read_request(&mut stream, &shared.stats)? {
        Some(head) => head,
        // closed before sending a full request
        None => return Ok(()),
    };

    shared.stats.num_requests.fetch_add(1, Ordering::Relaxed);
    let (resolution, head_only) = match ParsedRequest::parse(&head) {
        Ok(request) => (dispatch(&ctx, &request), request.method == "HEAD"),
        Err(e) => (dispatch_error(&ctx, e), false),
    };
    let sent = write_response(&mut stream, config, &resolution, head_only)?;
    shared.stats.total_out.fetch_add(sent, Ordering::Relaxed);
    Ok(())
}

/// Read until the end of the request head.
///
/// Returns `None` if the peer closed the connection first. An oversized head is returned
/// as-is so that parsing rejects it.
fn read_request(stream: &mut TcpStream, stats: &ServerStats) -> io::Result<Option<Vec<u8>>> {
    let mut request = Vec::new();
    let mut buf = [0; 1 << 12];
    loop {
        let recvd = match stream.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(recvd) => recvd,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                // idle for too long
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        stats.total_in.fetch_add(recvd as u64, Ordering::Relaxed);
        request.extend_from_slice(&buf[..recvd]);
        if request.len() > MAX_REQUEST_LENGTH || is_complete(&request) {
            return Ok(Some(request));
        }
    }
}

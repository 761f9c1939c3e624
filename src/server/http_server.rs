use anyhow::{Context, Result};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::codec::SERVICE_UNAVAILABLE;
use super::connection::{self, ConnectionContext};
use crate::config::ServerConfig;
use crate::dispatcher::Service;
use crate::worker_pool::{DispatchError, WorkerPool, WorkerPoolConfig, WorkerPoolMetrics};

/// A blocking HTTP/1.1 server: one acceptor thread feeding a pool of worker
/// threads through a bounded queue.
///
/// # Example
///
/// ```rust,no_run
/// use brrtserve::{App, HttpServer, Reply, ServerConfig};
///
/// let service = App::new()
///     .get("/health", vec![], |_req, _args| Ok(Reply::json(serde_json::json!({"status": "ok"}))))
///     .build()
///     .unwrap();
/// let handle = HttpServer::new(service, ServerConfig::default()).start().unwrap();
/// println!("listening on {}", handle.local_addr());
/// handle.join().unwrap();
/// ```
pub struct HttpServer {
    service: Service,
    config: ServerConfig,
}

/// Handle to a running HTTP server
///
/// Dropping the handle leaves the server running; call [`stop`](Self::stop)
/// or [`join`](Self::join).
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<WorkerPoolMetrics>,
    acceptor: JoinHandle<()>,
}

impl HttpServer {
    pub fn new(service: Service, config: ServerConfig) -> Self {
        Self { service, config }
    }

    /// Run the startup hooks, bind the listener and start the acceptor and
    /// worker threads.
    ///
    /// The socket is bound before this returns, so the server accepts
    /// connections as soon as the handle exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a startup hook fails, the address cannot be bound
    /// or a thread cannot be spawned.
    pub fn start(mut self) -> Result<ServerHandle> {
        self.service.run_startup_hooks()?;

        let bind_addr = self.config.addr();
        let listener = TcpListener::bind(&bind_addr).with_context(|| format!("Failed to bind {bind_addr}"))?;
        let addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(WorkerPoolMetrics::new());
        let ctx = ConnectionContext {
            service: Arc::new(self.service),
            limits: self.config.parse_limits(),
            idle_timeout: self.config.idle_timeout(),
            write_timeout: self.config.write_timeout(),
            max_requests: self.config.max_requests_per_connection,
            shutdown: Arc::clone(&shutdown),
        };

        let pool = WorkerPool::new(
            "brrtserve-worker",
            WorkerPoolConfig::from(&self.config),
            Arc::clone(&metrics),
            move |stream: TcpStream| connection::serve(stream, &ctx),
        )
        .context("Failed to spawn worker threads")?;

        let acceptor_shutdown = Arc::clone(&shutdown);
        let write_timeout = self.config.write_timeout();
        let acceptor = thread::Builder::new()
            .name("brrtserve-acceptor".to_string())
            .spawn(move || accept_loop(&listener, pool, &acceptor_shutdown, write_timeout))
            .context("Failed to spawn acceptor thread")?;

        info!(
            addr = %addr,
            workers = self.config.workers,
            backlog = self.config.backlog,
            "Server listening"
        );

        Ok(ServerHandle {
            addr,
            shutdown,
            metrics,
            acceptor,
        })
    }
}

fn accept_loop(listener: &TcpListener, mut pool: WorkerPool<TcpStream>, shutdown: &AtomicBool, write_timeout: Duration) {
    for incoming in listener.incoming() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let stream = match incoming {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "Accept failed");
                continue;
            }
        };

        match pool.try_dispatch(stream) {
            Ok(()) => {}
            Err(DispatchError::Full(stream)) => {
                warn!(
                    peer = ?stream.peer_addr().ok(),
                    queue_depth = pool.queue_depth(),
                    "Connection backlog full, refusing connection"
                );
                refuse(stream, write_timeout);
            }
            Err(DispatchError::Closed(_)) => break,
        }
    }

    // Workers drain what is queued, then exit once the channel is closed
    pool.shutdown();
    debug!("Acceptor stopped");
}

fn refuse(mut stream: TcpStream, write_timeout: Duration) {
    if let Err(e) = stream
        .set_write_timeout(Some(write_timeout))
        .and_then(|()| stream.write_all(SERVICE_UNAVAILABLE))
        .and_then(|()| stream.flush())
    {
        debug!(error = %e, "Failed to send 503");
    }
}

impl ServerHandle {
    /// Address the server is bound to; resolves port 0 to the real port
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connection counters of the worker pool
    #[must_use]
    pub fn metrics(&self) -> &Arc<WorkerPoolMetrics> {
        &self.metrics
    }

    /// Stop the server gracefully
    ///
    /// Stops accepting, lets workers finish the request they are processing,
    /// closes their connections and joins every thread.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Release);

        // The acceptor is blocked in accept(); a throwaway connection wakes it
        let wake_ip = match self.addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        if let Err(e) = TcpStream::connect_timeout(&SocketAddr::new(wake_ip, self.addr.port()), Duration::from_secs(1)) {
            debug!(error = %e, "Failed to wake acceptor");
        }

        if self.acceptor.join().is_err() {
            error!("Acceptor thread panicked");
        }
        info!(addr = %self.addr, "Server stopped");
    }

    /// Wait for the acceptor thread to complete
    ///
    /// The acceptor only exits on shutdown, so without [`stop`](Self::stop)
    /// this blocks until the process ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the acceptor thread panicked.
    pub fn join(self) -> thread::Result<()> {
        self.acceptor.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{App, Reply};
    use std::io::Read;

    fn config() -> ServerConfig {
        ServerConfig {
            port: 0,
            workers: 2,
            backlog: 4,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_start_serve_stop() {
        let service = App::new()
            .get("/", vec![], |_req, _args| Ok(Reply::text("hi")))
            .build()
            .unwrap();
        let handle = HttpServer::new(service, config()).start().unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("\r\n\r\nhi"));

        let metrics = Arc::clone(handle.metrics());
        handle.stop();
        assert!(metrics.get_accepted_count() >= 1);
        assert_eq!(metrics.get_active_count(), 0);
    }

    #[test]
    fn test_startup_hooks_run_before_bind() {
        let reserved = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        // The hook can take the port only while the server has not bound it yet
        let service = App::new()
            .on_startup("claim_port", move || {
                TcpListener::bind(("127.0.0.1", port))?;
                Ok(())
            })
            .build()
            .unwrap();
        let handle = HttpServer::new(service, ServerConfig { port, ..config() }).start().unwrap();
        assert_eq!(handle.local_addr().port(), port);
        handle.stop();
    }

    #[test]
    fn test_failing_startup_hook_aborts_start() {
        let service = App::new()
            .on_startup("open_store", || anyhow::bail!("store unavailable"))
            .build()
            .unwrap();
        let err = HttpServer::new(service, config()).start().unwrap_err();
        assert!(format!("{err:#}").contains("startup hook 'open_store' failed: store unavailable"));
    }

    #[test]
    fn test_stop_closes_idle_keep_alive_connection() {
        let service = App::new().build().unwrap();
        let handle = HttpServer::new(service, config()).start().unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"GET /nothing HTTP/1.1\r\n\r\n").unwrap();
        let mut first = [0u8; 12];
        client.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"HTTP/1.1 404");

        handle.stop();
        // Remaining response bytes, then EOF
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
    }
}

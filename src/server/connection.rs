//! Per-connection request loop.
//!
//! A worker thread owns one accepted socket and drives it through
//! `AwaitingRequest -> Parsing -> Dispatching -> WritingResponse`, returning to
//! `AwaitingRequest` while the connection is kept alive and ending in `Closing`
//! otherwise. Pipelined bytes stay in the read buffer and are parsed in order.

use http::Method;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

use super::codec::{self, ParseLimits, Parsed};
use super::request::Request;
use super::response::Response;
use crate::dispatcher::Service;
use crate::ids::RequestId;

const READ_CHUNK: usize = 8 * 1024;

/// Reads wake up this often to notice shutdown and the idle deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything a connection loop needs, shared by all workers
#[derive(Debug, Clone)]
pub(crate) struct ConnectionContext {
    pub service: Arc<Service>,
    pub limits: ParseLimits,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub max_requests: usize,
    pub shutdown: Arc<AtomicBool>,
}

impl ConnectionContext {
    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

enum State {
    AwaitingRequest,
    Parsing,
    Dispatching(Request),
    WritingResponse { bytes: Vec<u8>, keep_alive: bool },
    Closing,
}

enum ReadOutcome {
    Data,
    PeerClosed,
    IdleTimeout,
    Shutdown,
}

struct Connection<'a> {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    ctx: &'a ConnectionContext,
    buf: Vec<u8>,
    served: usize,
}

/// Serve `stream` until it is closed by either side
pub(crate) fn serve(stream: TcpStream, ctx: &ConnectionContext) {
    let peer = stream.peer_addr().ok();
    debug!(peer = ?peer, "Connection accepted");

    if let Err(e) = stream
        .set_read_timeout(Some(POLL_INTERVAL))
        .and_then(|()| stream.set_write_timeout(Some(ctx.write_timeout)))
        .and_then(|()| stream.set_nodelay(true))
    {
        debug!(peer = ?peer, error = %e, "Failed to configure socket");
        return;
    }

    let mut conn = Connection {
        stream,
        peer,
        ctx,
        buf: Vec::with_capacity(READ_CHUNK),
        served: 0,
    };
    conn.run();
}

impl Connection<'_> {
    fn run(&mut self) {
        let mut state = State::AwaitingRequest;
        loop {
            state = match state {
                State::AwaitingRequest => {
                    if !self.buf.is_empty() {
                        State::Parsing
                    } else if self.ctx.shutting_down() {
                        State::Closing
                    } else {
                        self.read_more()
                    }
                }
                State::Parsing => match codec::parse(&self.buf, &self.ctx.limits) {
                    Ok(Parsed::Complete { request, consumed }) => {
                        self.buf.drain(..consumed);
                        State::Dispatching(request)
                    }
                    Ok(Parsed::Incomplete) => self.read_more(),
                    Err(err) => {
                        warn!(peer = ?self.peer, error = %err, code = err.code(), "Malformed request");
                        self.buf.clear();
                        let bytes = finish(err.to_response(), RequestId::new(), false, false);
                        State::WritingResponse { bytes, keep_alive: false }
                    }
                },
                State::Dispatching(request) => self.dispatch(&request),
                State::WritingResponse { bytes, keep_alive } => match self.write_response(&bytes) {
                    Ok(()) if keep_alive => State::AwaitingRequest,
                    Ok(()) => State::Closing,
                    Err(e) => {
                        debug!(peer = ?self.peer, error = %e, "Response write failed");
                        State::Closing
                    }
                },
                State::Closing => break,
            };
        }

        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(peer = ?self.peer, error = %e, "Socket shutdown failed");
        }
        debug!(peer = ?self.peer, requests = self.served, "Connection closed");
    }

    /// Read until at least one byte arrives; any other outcome closes the connection
    fn read_more(&mut self) -> State {
        match self.fill_buf() {
            Ok(ReadOutcome::Data) => State::Parsing,
            Ok(outcome) => {
                if !self.buf.is_empty() {
                    debug!(
                        peer = ?self.peer,
                        buffered = self.buf.len(),
                        reason = outcome.as_str(),
                        "Dropping incomplete request"
                    );
                }
                State::Closing
            }
            Err(e) => {
                debug!(peer = ?self.peer, error = %e, "Socket read failed");
                State::Closing
            }
        }
    }

    fn fill_buf(&mut self) -> io::Result<ReadOutcome> {
        let deadline = Instant::now() + self.ctx.idle_timeout;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::PeerClosed),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(ReadOutcome::Data);
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if self.ctx.shutting_down() {
                        return Ok(ReadOutcome::Shutdown);
                    }
                    if Instant::now() >= deadline {
                        return Ok(ReadOutcome::IdleTimeout);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(&mut self, request: &Request) -> State {
        self.served += 1;
        let request_id = RequestId::from_header_or_new(request.header("x-request-id"));
        let keep_alive =
            request.wants_keep_alive() && self.served < self.ctx.max_requests && !self.ctx.shutting_down();
        let head_only = request.method == Method::HEAD;

        let span = info_span!(
            "request",
            request_id = %request_id,
            method = %request.method,
            path = %request.path
        );
        let _enter = span.enter();

        let start = Instant::now();
        let response = self.ctx.service.handle(request);
        info!(
            request_id = %request_id,
            method = %request.method,
            path = %request.path,
            status = response.status,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Request completed"
        );

        State::WritingResponse {
            bytes: finish(response, request_id, keep_alive, head_only),
            keep_alive,
        }
    }

    fn write_response(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }
}

impl ReadOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ReadOutcome::Data => "data",
            ReadOutcome::PeerClosed => "peer_closed",
            ReadOutcome::IdleTimeout => "idle_timeout",
            ReadOutcome::Shutdown => "shutdown",
        }
    }
}

/// Add the connection headers and encode
fn finish(mut response: Response, request_id: RequestId, keep_alive: bool, head_only: bool) -> Vec<u8> {
    response.set_header("connection", if keep_alive { "keep-alive" } else { "close" });
    response.set_header("x-request-id", request_id.to_string());
    if head_only {
        codec::write_head(&response)
    } else {
        codec::write(&response)
    }
}

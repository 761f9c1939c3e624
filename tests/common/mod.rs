#![allow(dead_code)]

pub mod test_server {
    use brrtserve::{HttpServer, ServerConfig, ServerHandle, Service};
    use std::net::SocketAddr;
    use std::sync::Once;

    static TRACING_INIT: Once = Once::new();

    /// Route server logs through the test harness; `RUST_LOG` controls verbosity
    pub fn init_tracing() {
        TRACING_INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        });
    }

    /// Small, fast-failing configuration on a random local port
    pub fn test_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            workers: 4,
            backlog: 16,
            idle_timeout_ms: 2_000,
            write_timeout_ms: 2_000,
            ..ServerConfig::default()
        }
    }

    /// Running server that is stopped when dropped
    pub struct TestServer {
        handle: Option<ServerHandle>,
        addr: SocketAddr,
    }

    impl TestServer {
        pub fn start(service: Service) -> Self {
            Self::start_with(service, test_config())
        }

        pub fn start_with(service: Service, config: ServerConfig) -> Self {
            init_tracing();
            let handle = HttpServer::new(service, config).start().unwrap();
            let addr = handle.local_addr();
            Self {
                handle: Some(handle),
                addr,
            }
        }

        pub fn addr(&self) -> SocketAddr {
            self.addr
        }

        pub fn handle(&self) -> &ServerHandle {
            self.handle.as_ref().unwrap()
        }

        /// Stop now instead of at drop
        pub fn stop(mut self) {
            if let Some(handle) = self.handle.take() {
                handle.stop();
            }
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            if let Some(handle) = self.handle.take() {
                handle.stop();
            }
        }
    }
}

pub mod http {
    use serde_json::Value;
    use std::io::{ErrorKind, Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::time::Duration;

    /// A response read off the wire
    #[derive(Debug)]
    pub struct RawResponse {
        pub status: u16,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl RawResponse {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        pub fn json(&self) -> Value {
            serde_json::from_slice(&self.body).unwrap()
        }

        pub fn content_length(&self) -> usize {
            self.header("content-length").unwrap().parse().unwrap()
        }
    }

    /// Raw HTTP/1.1 client over one TCP connection
    pub struct Client {
        stream: TcpStream,
        buf: Vec<u8>,
    }

    impl Client {
        pub fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            Self {
                stream,
                buf: Vec::new(),
            }
        }

        pub fn send(&mut self, raw: &str) {
            self.stream.write_all(raw.as_bytes()).unwrap();
        }

        /// Send a request and read its response
        pub fn request(&mut self, raw: &str) -> RawResponse {
            self.send(raw);
            self.read_response()
        }

        /// `GET path` on a kept-alive connection
        pub fn get(&mut self, path: &str) -> RawResponse {
            self.request(&format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n"))
        }

        /// Send a JSON body
        pub fn send_json(&mut self, method: &str, path: &str, body: &str) -> RawResponse {
            self.request(&format!(
                "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            ))
        }

        pub fn read_response(&mut self) -> RawResponse {
            self.read_message(true)
        }

        /// Read a response whose body was omitted (HEAD)
        pub fn read_head_response(&mut self) -> RawResponse {
            self.read_message(false)
        }

        /// True when the server has closed the connection
        pub fn is_closed(&mut self) -> bool {
            let mut byte = [0u8; 1];
            loop {
                match self.stream.read(&mut byte) {
                    Ok(0) => return true,
                    Ok(_) => return false,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => return true,
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => return false,
                    Err(e) => panic!("read failed: {e}"),
                }
            }
        }

        fn fill(&mut self) {
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed mid-response");
            self.buf.extend_from_slice(&chunk[..n]);
        }

        fn read_message(&mut self, with_body: bool) -> RawResponse {
            let head_end = loop {
                if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos;
                }
                self.fill();
            };

            let head = String::from_utf8(self.buf[..head_end].to_vec()).unwrap();
            let mut lines = head.split("\r\n");
            let status_line = lines.next().unwrap();
            assert!(status_line.starts_with("HTTP/1.1 "), "bad status line: {status_line}");
            let status = status_line[9..12].parse().unwrap();
            let headers: Vec<(String, String)> = lines
                .map(|line| {
                    let (k, v) = line.split_once(": ").unwrap();
                    (k.to_string(), v.to_string())
                })
                .collect();

            let mut response = RawResponse {
                status,
                headers,
                body: Vec::new(),
            };
            let body_len = if with_body { response.content_length() } else { 0 };
            let total = head_end + 4 + body_len;
            while self.buf.len() < total {
                self.fill();
            }
            response.body = self.buf[head_end + 4..total].to_vec();
            self.buf.drain(..total);
            response
        }
    }
}

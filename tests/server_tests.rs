//! Integration tests for the HTTP server and connection handling
//!
//! # Test Coverage
//!
//! - Keep-alive, `Connection: close` and HTTP/1.0 defaults
//! - Pipelined requests answered in order
//! - Malformed requests answered with 400 without affecting other connections
//! - The demo item API end to end
//! - 405 with `Allow`, HEAD without body
//! - Handler panics answered with 500 on a connection that stays usable
//! - Backlog overflow answered with 503
//! - Workers serve connections in parallel; a blocked handler or a slow
//!   client does not stall other connections
//! - Startup hooks run once, in order, before the first request
//!
//! Every test starts its own server on `127.0.0.1:0` through the RAII
//! [`TestServer`] fixture and speaks raw HTTP over `TcpStream`.

mod common;

use brrtserve::{demo, App, Reply, ServerConfig};
use common::http::Client;
use common::test_server::{test_config, TestServer};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn demo_server() -> TestServer {
    TestServer::start(demo::service().unwrap())
}

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let server = demo_server();
    let mut client = Client::connect(server.addr());

    let first = client.get("/health");
    assert_eq!(first.status, 200);
    assert_eq!(first.header("connection"), Some("keep-alive"));
    assert_eq!(first.json(), json!({ "status": "ok" }));

    let second = client.get("/");
    assert_eq!(second.status, 200);
    assert_eq!(second.header("connection"), Some("keep-alive"));
    assert_eq!(second.json()["message"], "Hello, World!");
}

#[test]
fn test_connection_close_closes_after_response() {
    let server = demo_server();
    let mut client = Client::connect(server.addr());

    let resp = client.request("GET /health HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("connection"), Some("close"));
    assert!(client.is_closed());
}

#[test]
fn test_http10_closes_by_default() {
    let server = demo_server();

    let mut client = Client::connect(server.addr());
    let resp = client.request("GET /health HTTP/1.0\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("connection"), Some("close"));
    assert!(client.is_closed());

    let mut client = Client::connect(server.addr());
    let resp = client.request("GET /health HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
    assert_eq!(resp.header("connection"), Some("keep-alive"));
    assert_eq!(client.get("/health").status, 200);
}

#[test]
fn test_malformed_start_line_gets_400() {
    let server = demo_server();

    let mut bad = Client::connect(server.addr());
    let resp = bad.request("GET /\r\n\r\n");
    assert_eq!(resp.status, 400);
    assert_eq!(resp.json()["code"], "INVALID_REQUEST_LINE");
    assert_eq!(resp.header("connection"), Some("close"));
    assert!(bad.is_closed());

    // The listener and other connections are unaffected
    let mut good = Client::connect(server.addr());
    assert_eq!(good.get("/health").status, 200);
}

#[test]
fn test_oversized_body_rejected() {
    let config = ServerConfig {
        max_body_bytes: 16,
        ..test_config()
    };
    let server = TestServer::start_with(demo::service().unwrap(), config);
    let mut client = Client::connect(server.addr());

    let resp = client.send_json("POST", "/items", r#"{"name":"a very long widget name","price":1}"#);
    assert_eq!(resp.status, 400);
    assert_eq!(resp.json()["code"], "BODY_TOO_LARGE");
}

#[test]
fn test_pipelined_requests_answered_in_order() {
    let server = demo_server();
    let mut client = Client::connect(server.addr());

    client.send("GET /items/1 HTTP/1.1\r\n\r\nGET /items/2 HTTP/1.1\r\n\r\nGET /items/3 HTTP/1.1\r\n\r\n");
    for id in 1..=3 {
        let resp = client.read_response();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.json(), json!({ "id": id }));
    }
}

#[test]
fn test_get_item_by_id() {
    let server = demo_server();
    let mut client = Client::connect(server.addr());

    let resp = client.get("/items/7");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-type"), Some("application/json"));
    assert_eq!(resp.body, br#"{"id":7}"#);

    let resp = client.get("/items/seven");
    assert_eq!(resp.status, 400);
    assert_eq!(resp.json()["code"], "TYPE_MISMATCH");
}

#[test]
fn test_post_item_echo_and_validation() {
    let server = demo_server();
    let mut client = Client::connect(server.addr());

    let resp = client.send_json("POST", "/items", r#"{"name":"Widget","price":9.99}"#);
    assert_eq!(resp.status, 200);
    let body = resp.json();
    assert_eq!(body["name"], "Widget");
    assert_eq!(body["price"], 9.99);

    let resp = client.send_json("POST", "/items", r#"{"name":"Widget"}"#);
    assert_eq!(resp.status, 400);
    let body = resp.json();
    assert_eq!(body["code"], "VALIDATION_FAILED");
    assert_eq!(body["fields"][0]["field"], "price");

    // The stored item is visible on the same connection
    let resp = client.get("/items/1");
    assert_eq!(resp.json()["name"], "Widget");
}

#[test]
fn test_method_not_allowed_lists_allow() {
    let server = demo_server();
    let mut client = Client::connect(server.addr());

    let resp = client.request("PUT /items HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
    assert_eq!(resp.status, 405);
    assert_eq!(resp.header("allow"), Some("GET, HEAD, POST"));
    assert_eq!(resp.json()["code"], "METHOD_NOT_ALLOWED");

    let resp = client.get("/nowhere");
    assert_eq!(resp.status, 404);
    assert_eq!(resp.json()["code"], "NOT_FOUND");
}

#[test]
fn test_head_omits_body() {
    let server = demo_server();
    let mut client = Client::connect(server.addr());

    client.send("HEAD /health HTTP/1.1\r\n\r\n");
    let resp = client.read_head_response();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.content_length(), br#"{"status":"ok"}"#.len());
    assert!(resp.body.is_empty());

    // Nothing but the head was sent: the next response parses cleanly
    let resp = client.get("/health");
    assert_eq!(resp.json(), json!({ "status": "ok" }));
}

#[test]
fn test_request_id_header() {
    let server = demo_server();
    let mut client = Client::connect(server.addr());

    let generated = client.get("/health");
    let id = generated.header("x-request-id").unwrap().to_string();
    assert_eq!(id.len(), 26);

    let echoed = client.request(&format!("GET /health HTTP/1.1\r\nX-Request-Id: {id}\r\n\r\n"));
    assert_eq!(echoed.header("x-request-id"), Some(id.as_str()));
}

#[test]
fn test_handler_panic_returns_500_and_connection_survives() {
    let service = App::new()
        .get("/panic", vec![], |_req, _args| -> Result<Reply, brrtserve::HandlerError> {
            panic!("boom")
        })
        .get("/ok", vec![], |_req, _args| Ok(Reply::text("fine")))
        .build()
        .unwrap();
    let server = TestServer::start(service);
    let mut client = Client::connect(server.addr());

    let resp = client.get("/panic");
    assert_eq!(resp.status, 500);
    assert_eq!(resp.json(), json!({ "error": "Internal Server Error", "code": "INTERNAL_ERROR" }));
    assert_eq!(resp.header("connection"), Some("keep-alive"));

    let resp = client.get("/ok");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"fine");
}

#[test]
fn test_backlog_overflow_gets_503() {
    // The only worker blocks inside a handler until released
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let service = App::new()
        .get("/block", vec![], move |_req, _args| {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(10));
            Ok(Reply::text("released"))
        })
        .build()
        .unwrap();
    let config = ServerConfig {
        workers: 1,
        backlog: 1,
        ..test_config()
    };
    let server = TestServer::start_with(service, config);

    let mut busy = Client::connect(server.addr());
    busy.send("GET /block HTTP/1.1\r\nConnection: close\r\n\r\n");
    // Wait until the worker has taken the first connection off the queue
    let metrics = Arc::clone(server.handle().metrics());
    for _ in 0..200 {
        if metrics.get_active_count() == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(metrics.get_active_count(), 1);

    let _queued = Client::connect(server.addr());
    // Give the acceptor time to queue the second connection
    for _ in 0..200 {
        if metrics.get_accepted_count() == 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let mut refused = Client::connect(server.addr());
    let resp = refused.read_response();
    assert_eq!(resp.status, 503);
    assert_eq!(resp.header("connection"), Some("close"));
    assert_eq!(resp.json()["code"], "SERVICE_UNAVAILABLE");
    assert!(refused.is_closed());
    assert_eq!(metrics.get_refused_count(), 1);

    release_tx.send(()).unwrap();
    let resp = busy.read_response();
    assert_eq!(resp.body, b"released");
}

#[test]
fn test_stop_with_open_connection() {
    let server = demo_server();
    let mut client = Client::connect(server.addr());
    assert_eq!(client.get("/health").status, 200);

    server.stop();
    assert!(client.is_closed());
}

#[test]
fn test_handlers_run_in_parallel() {
    // Each request waits until both are inside a handler at the same time
    let arrived = Arc::new(AtomicUsize::new(0));
    let service = App::new()
        .get("/meet", vec![], move |_req, _args| {
            arrived.fetch_add(1, Ordering::SeqCst);
            let deadline = Instant::now() + Duration::from_secs(3);
            while arrived.load(Ordering::SeqCst) < 2 {
                if Instant::now() > deadline {
                    return Ok(Reply::text("alone"));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(Reply::text("together"))
        })
        .build()
        .unwrap();
    let server = TestServer::start_with(service, ServerConfig { workers: 2, ..test_config() });

    let mut a = Client::connect(server.addr());
    let mut b = Client::connect(server.addr());
    a.send("GET /meet HTTP/1.1\r\n\r\n");
    b.send("GET /meet HTTP/1.1\r\n\r\n");
    assert_eq!(a.read_response().body, b"together");
    assert_eq!(b.read_response().body, b"together");
}

#[test]
fn test_blocked_handler_does_not_stall_other_connections() {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let service = App::new()
        .get("/block", vec![], move |_req, _args| {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(10));
            Ok(Reply::text("released"))
        })
        .get("/ok", vec![], |_req, _args| Ok(Reply::text("fine")))
        .build()
        .unwrap();
    let server = TestServer::start_with(service, ServerConfig { workers: 3, ..test_config() });
    let metrics = Arc::clone(server.handle().metrics());

    let mut blocked = Client::connect(server.addr());
    blocked.send("GET /block HTTP/1.1\r\n\r\n");
    // A client that stops halfway through its request line
    let mut slow = Client::connect(server.addr());
    slow.send("GET /ok HT");
    for _ in 0..200 {
        if metrics.get_active_count() == 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(metrics.get_active_count(), 2);

    let mut other = Client::connect(server.addr());
    let resp = other.get("/ok");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"fine");

    release_tx.send(()).unwrap();
    assert_eq!(blocked.read_response().body, b"released");
    slow.send("TP/1.1\r\n\r\n");
    assert_eq!(slow.read_response().body, b"fine");
}

#[test]
fn test_startup_hooks_run_once_before_first_request() {
    let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let (first, second, seen) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));
    let service = App::new()
        .on_startup("open_store", move || {
            first.lock().unwrap().push("open_store");
            Ok(())
        })
        .on_startup("warm_cache", move || {
            second.lock().unwrap().push("warm_cache");
            Ok(())
        })
        .get("/log", vec![], move |_req, _args| Ok(Reply::json(json!(*seen.lock().unwrap()))))
        .build()
        .unwrap();
    let server = TestServer::start(service);
    let mut client = Client::connect(server.addr());

    assert_eq!(client.get("/log").json(), json!(["open_store", "warm_cache"]));
    assert_eq!(client.get("/log").json(), json!(["open_store", "warm_cache"]));
    assert_eq!(log.lock().unwrap().len(), 2);
}

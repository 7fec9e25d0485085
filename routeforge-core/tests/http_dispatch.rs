use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use routeforge_core::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct Reply {
    status: u16,
    head: String,
    body: String,
}

async fn serve(router: Router) -> (Server, SocketAddr) {
    let config = ServerConfig::default()
        .with_application_name("dispatch-test")
        .with_prefix("http://127.0.0.1:0/")
        .with_default_header("X-Test", "yes");
    let server = Server::new(router, config).unwrap();
    server.start().await.unwrap();
    let addr = server.local_addrs()[0];
    (server, addr)
}

async fn exchange(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_reply(text: &str) -> Reply {
    let (head, body) = text.split_once("\r\n\r\n").unwrap();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    Reply {
        status,
        head: head.to_ascii_lowercase(),
        body: body.to_string(),
    }
}

async fn request(addr: SocketAddr, method: &str, target: &str) -> Reply {
    let raw = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        method, target
    );
    parse_reply(&exchange(addr, &raw).await)
}

async fn finish(server: Server) {
    server.stop();
    server.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exact_match_beats_template() {
    let router = Router::new()
        .get("/a/:x:", handler(|Param(x): Param<String>| async move { format!("template {}", x) }))
        .get("/a/b", handler(|| async { "exact" }));
    let (server, addr) = serve(router).await;

    let reply = request(addr, "GET", "/a/b").await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "exact");

    let reply = request(addr, "GET", "/a/zz").await;
    assert_eq!(reply.body, "template zz");

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn verb_filtering_and_any() {
    let router = Router::new()
        .post("/p", handler(|response: Response| async move { response.write("post;") }))
        .all("/p", handler(|response: Response| async move { response.write("any;") }));
    let (server, addr) = serve(router).await;

    let reply = request(addr, "GET", "/p").await;
    assert_eq!(reply.body, "any;");

    let reply = request(addr, "POST", "/p").await;
    assert_eq!(reply.body, "post;any;");

    let reply = request(addr, "DELETE", "/p").await;
    assert_eq!(reply.body, "any;");

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_route_is_404() {
    let router = Router::new()
        .get("/exists", handler(|| async { "here" }))
        .post("/post-only", handler(|| async { "posted" }));
    let (server, addr) = serve(router).await;

    let reply = request(addr, "GET", "/nope").await;
    assert_eq!(reply.status, 404);
    assert_eq!(reply.body, "404 Not Found");

    let reply = request(addr, "GET", "/post-only").await;
    assert_eq!(reply.status, 404);

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn arity_mismatch_is_500_and_skips_handler() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let router = Router::new().get(
        "/pair/{a}",
        handler(move |Param(a): Param<i32>, Param(b): Param<i32>| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                format!("{}", a + b)
            }
        }),
    );
    let (server, addr) = serve(router).await;

    let reply = request(addr, "GET", "/pair/1").await;
    assert_eq!(reply.status, 500);
    assert!(!ran.load(Ordering::SeqCst));

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unconvertible_parameter_is_400() {
    let router = Router::new().get(
        "/items/{id}",
        handler(|Param(id): Param<u32>| async move { format!("item {}", id) }),
    );
    let (server, addr) = serve(router).await;

    let reply = request(addr, "GET", "/items/12").await;
    assert_eq!(reply.body, "item 12");

    let reply = request(addr, "GET", "/items/twelve").await;
    assert_eq!(reply.status, 400);

    // fits the inferred i64 but not u32
    let reply = request(addr, "GET", "/items/9999999999").await;
    assert_eq!(reply.status, 400);

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn default_headers_and_status_from_handler() {
    let router = Router::new().get(
        "/created",
        handler(|| async { (StatusCode::CREATED, "made") }),
    );
    let (server, addr) = serve(router).await;

    let reply = request(addr, "GET", "/created").await;
    assert_eq!(reply.status, 201);
    assert!(reply.head.contains("x-test: yes"));
    assert!(reply.head.contains("content-length: 4"));
    assert_eq!(reply.body, "made");

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keep_alive_serves_several_requests() {
    let router = Router::new().get(
        "/n/{n}",
        handler(|Param(n): Param<u8>| async move { format!("n={}", n) }),
    );
    let (server, addr) = serve(router).await;

    let raw = "GET /n/1 HTTP/1.1\r\nHost: x\r\n\r\nGET /n/2 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
    let text = exchange(addr, raw).await;
    assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
    assert!(text.contains("n=1"));
    assert!(text.ends_with("n=2"));

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn head_request_has_no_body() {
    let router = Router::new().head("/doc", handler(|| async { "document body" }));
    let (server, addr) = serve(router).await;

    let reply = request(addr, "HEAD", "/doc").await;
    assert_eq!(reply.status, 200);
    assert!(reply.head.contains("content-length: 13"));
    assert!(reply.body.is_empty());

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_request_is_400() {
    let (server, addr) = serve(Router::new()).await;

    let reply = parse_reply(&exchange(addr, "NOT A REQUEST\r\n\r\n").await);
    assert_eq!(reply.status, 400);
    assert!(reply.head.contains("x-test: yes"));

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_handler_is_500() {
    let router = Router::new().get(
        "/panic",
        handler(|| async {
            if true {
                panic!("handler exploded");
            }
            "unreachable"
        }),
    );
    let (server, addr) = serve(router).await;

    let reply = request(addr, "GET", "/panic").await;
    assert_eq!(reply.status, 500);
    assert!(reply.head.contains("x-test: yes"));

    // the accept loop is unaffected
    let reply = request(addr, "GET", "/panic").await;
    assert_eq!(reply.status, 500);
    assert_eq!(server.state(), ServerState::Running);

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn json_body_and_query() {
    #[derive(serde::Deserialize)]
    struct Order {
        item: String,
        quantity: u32,
    }

    let router = Router::new().post(
        "/orders",
        handler(|Query(query): Query, Json(order): Json<Order>| async move {
            let channel = query
                .iter()
                .find(|(k, _)| k == "channel")
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            JsonResponse(serde_json::json!({
                "item": order.item,
                "quantity": order.quantity,
                "channel": channel,
            }))
        }),
    );
    let (server, addr) = serve(router).await;

    let body = r#"{"item":"widget","quantity":3}"#;
    let raw = format!(
        "POST /orders?channel=web+shop HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let reply = parse_reply(&exchange(addr, &raw).await);
    assert_eq!(reply.status, 200);
    assert!(reply.head.contains("content-type: application/json"));
    let value: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
    assert_eq!(value["item"], "widget");
    assert_eq!(value["quantity"], 3);
    assert_eq!(value["channel"], "web shop");

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_error_keeps_default_headers() {
    let router = Router::new()
        .get("/ok", handler(|| async { "fine" }))
        .get(
            "/boom",
            handler(|| async { Err::<&'static str, _>(Error::handler("boom")) }),
        );
    let (server, addr) = serve(router).await;

    let reply = request(addr, "GET", "/ok").await;
    assert_eq!(reply.status, 200);
    assert!(reply.head.contains("x-test: yes"));

    let reply = request(addr, "GET", "/boom").await;
    assert_eq!(reply.status, 500);
    assert!(reply.head.contains("x-test: yes"));
    assert!(reply.head.contains("connection: close"));

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_methods_are_case_sensitive() {
    let router = Router::new()
        .get("/p", handler(|| async { "GET handler ran" }))
        .all("/p", handler(|| async { "ANY handler ran" }));
    let (server, addr) = serve(router).await;

    for method in ["get", "Post", "ANY"] {
        let reply = request(addr, method, "/p").await;
        assert_eq!(reply.status, 400, "{} should be rejected", method);
        assert!(!reply.body.contains("handler ran"));
    }

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_json_body_is_400() {
    #[derive(serde::Deserialize)]
    struct Note {
        #[allow(dead_code)]
        text: String,
    }

    let router = Router::new().post(
        "/notes",
        handler(|Json(_note): Json<Note>| async { "stored" }),
    );
    let (server, addr) = serve(router).await;

    let body = "{\"text\":";
    let raw = format!(
        "POST /notes HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let reply = parse_reply(&exchange(addr, &raw).await);
    assert_eq!(reply.status, 400);
    assert!(reply.head.contains("x-test: yes"));

    finish(server).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn endpoint_path_does_not_filter_routes() {
    let router = Router::new().get("/ping", handler(|| async { "pong" }));
    let config = ServerConfig::default().with_prefix("http://127.0.0.1:0/api/");
    let server = Server::new(router, config).unwrap();
    assert_eq!(server.prefixes()[0].path(), "/api/");
    server.start().await.unwrap();
    let addr = server.local_addrs()[0];

    let reply = request(addr, "GET", "/ping").await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "pong");

    finish(server).await;
}

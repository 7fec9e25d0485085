use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use routeforge::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Stats {
    requests: AtomicU64,
}

impl Controller for Stats {}

#[derive(Deserialize, Serialize)]
struct Note {
    author: String,
    text: String,
}

async fn index(stats: Arc<Stats>) -> String {
    let served = stats.requests.fetch_add(1, Ordering::Relaxed) + 1;
    format!("routeforge echo demo ({} requests served)", served)
}

async fn echo_path(Param(rest): Param<String>) -> String {
    rest
}

async fn square(Param(n): Param<i64>) -> JsonResponse<serde_json::Value> {
    JsonResponse(serde_json::json!({ "n": n, "square": n.saturating_mul(n) }))
}

async fn post_note(ctx: HttpContext, Json(note): Json<Note>) -> Result<StatusCode> {
    let delivered = ctx
        .sessions()
        .broadcast(Message::text(serde_json::to_string(&note)?));
    info!("Note from {} delivered to {} session(s)", note.author, delivered);
    Ok(StatusCode::ACCEPTED)
}

async fn sessions(ctx: HttpContext) -> JsonResponse<Vec<String>> {
    JsonResponse(ctx.sessions().ids())
}

async fn websocket(upgrade: WebSocketUpgrade) -> Result<()> {
    upgrade.protocols(&["echo"]).on_upgrade(|mut session| async move {
        info!("Session {} opened from {:?}", session.id(), session.info().remote_addr());
        while let Some(event) = session.next_event().await {
            match event {
                SessionEvent::Message(message) => {
                    if let Err(e) = session.send(message) {
                        tracing::warn!("Echo failed: {}", e);
                        break;
                    }
                }
                SessionEvent::Closed(close) => {
                    info!("Session {} closed ({} {})", session.id(), close.code, close.reason);
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default()
            .with_prefix("http://127.0.0.1:8080/")
            .with_default_header("X-Powered-By", "routeforge")
            .with_access_log(true),
    };

    let router = Router::new()
        .get("/", handler(index))
        .get("/echo/{text}", handler(echo_path))
        .get("/square/:n:", handler(square))
        .post("/notes", handler(post_note))
        .get("/sessions", handler(sessions))
        .get("/ws", handler(websocket));

    let server = Server::new(router, config)?;
    server.start().await?;
    info!("Echo demo listening on {:?}", server.local_addrs());

    let shutdown = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            shutdown.stop();
        }
    });

    server.join().await;
    Ok(())
}

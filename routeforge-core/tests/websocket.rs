use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use routeforge_core::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WireMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

type Events = mpsc::UnboundedSender<SessionEvent>;

async fn echo(upgrade: WebSocketUpgrade, State(events): State<Events>) -> Result<()> {
    upgrade.on_upgrade(move |mut session| async move {
        while let Some(event) = session.next_event().await {
            if let SessionEvent::Message(message) = &event {
                let _ = session.send(message.clone());
            }
            let _ = events.send(event);
        }
    })
}

async fn serve() -> (Server, SocketAddr, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let router = Router::new()
        .with_state(std::sync::Arc::new(tx))
        .get("/ws", handler(echo));
    let config = ServerConfig::default()
        .with_prefix("http://127.0.0.1:0/")
        .with_websocket(WebSocketConfig::default().with_upgrade_timeout(Duration::from_secs(2)));
    let server = Server::new(router, config).unwrap();
    server.start().await.unwrap();
    let addr = server.local_addrs()[0];
    (server, addr, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no session event")
        .expect("event channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn text_round_trip_and_close() {
    let (server, addr, mut events) = serve().await;

    let (mut ws, response) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    assert_eq!(response.status(), 101);

    ws.send(WireMessage::Text("hello".into())).await.unwrap();
    match ws.next().await {
        Some(Ok(WireMessage::Text(text))) => assert_eq!(text, "hello"),
        other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(next_event(&mut events).await, SessionEvent::Message(Message::text("hello")));

    ws.send(WireMessage::Binary(vec![1, 2, 3])).await.unwrap();
    match ws.next().await {
        Some(Ok(WireMessage::Binary(data))) => assert_eq!(data, vec![1, 2, 3]),
        other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Message(Message::binary(vec![1u8, 2, 3]))
    );
    assert_eq!(server.router().sessions().count(), 1);

    ws.close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "bye".into(),
    }))
    .await
    .unwrap();

    // the server acknowledges the close
    let mut acknowledged = false;
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(WireMessage::Close(_)) => acknowledged = true,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(acknowledged);

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Closed(CloseInfo::new(1000, "bye"))
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(server.router().sessions().count(), 0);

    server.stop();
    server.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_request_to_websocket_route_is_rejected() {
    let (server, addr, _events) = serve().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /ws HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    let text = String::from_utf8_lossy(&out);
    assert!(text.starts_with("HTTP/1.1 400"), "{}", text);

    server.stop();
    server.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_receive_broadcasts() {
    let (server, addr, mut events) = serve().await;

    let (mut first, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    let (mut second, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

    let registry = server.router().sessions().clone();
    for _ in 0..100 {
        if registry.count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.broadcast(Message::text("news")), 2);

    for ws in [&mut first, &mut second] {
        match ws.next().await {
            Some(Ok(WireMessage::Text(text))) => assert_eq!(text, "news"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    first.close(None).await.unwrap();
    second.close(None).await.unwrap();
    for _ in 0..2 {
        assert!(matches!(next_event(&mut events).await, SessionEvent::Closed(_)));
    }

    server.stop();
    server.join().await;
}

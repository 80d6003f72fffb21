//! Pushed experiment updates from a fake Socket.IO server

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use biomage_e2e::socket::StatusFeed;
use biomage_e2e::{CompletionWaiter, E2eError, JobId, JobStatus, PipelineStage, StatusSource, WaitPolicy};

const OPEN: &str = r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#;

#[derive(Clone, Default)]
struct Seen {
    connected: Arc<AtomicBool>,
    ponged: Arc<AtomicBool>,
}

async fn updates(ws: WebSocketUpgrade, State(seen): State<Seen>) -> Response {
    ws.on_upgrade(move |socket| push_updates(socket, seen))
}

async fn push_updates(mut socket: WebSocket, seen: Seen) {
    if socket.send(Message::Text(OPEN.into())).await.is_err() {
        return;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) if text == "40" => {
                seen.connected.store(true, Ordering::SeqCst);
                let _ = socket.send(Message::Text("2".into())).await;
            }
            Message::Text(text) if text == "3" => {
                seen.ponged.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                let events = [
                    r#"42["ExperimentUpdates-e9",{"type":"gem2s","status":{"gem2s":{"status":"FAILED"}}}]"#,
                    r#"42["ExperimentUpdates-e1",{"type":"gem2s","status":{"gem2s":{"status":"RUNNING"}}}]"#,
                    r#"42["ExperimentUpdates-e1",{"type":"gem2s","status":{"gem2s":{"status":"SUCCEEDED"}}}]"#,
                ];
                for event in events {
                    let _ = socket.send(Message::Text(event.into())).await;
                }
            }
            _ => {}
        }
    }
}

async fn close_after_open(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        let _ = socket.send(Message::Text(OPEN.into())).await;
        let _ = socket.send(Message::Text("1".into())).await;
    })
}

async fn serve() -> (String, Seen) {
    let seen = Seen::default();
    let router = Router::new()
        .route("/socket.io/", get(updates))
        .route("/closing/socket.io/", get(close_after_open))
        .with_state(seen.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", addr), seen)
}

#[tokio::test]
async fn test_pushed_success_completes_wait() {
    let (base, seen) = serve().await;
    let feed = Arc::new(StatusFeed::connect(&base, &["e1".to_string()]).await.unwrap());

    let waiter = CompletionWaiter::new(feed.clone()).with_updates(feed.sender());
    let policy = WaitPolicy::for_stage(PipelineStage::Gem2s).with_timeout(Duration::from_secs(10));
    let outcome = waiter.wait(JobId::gem2s("e1"), policy).await.unwrap();

    assert_eq!(outcome.status, JobStatus::Succeeded);
    // Woken by the push, well before the 5s poll interval
    assert!(outcome.elapsed < Duration::from_secs(5));
    assert!(seen.connected.load(Ordering::SeqCst));
    assert!(seen.ponged.load(Ordering::SeqCst));

    // Updates for other experiments are dropped
    assert_eq!(feed.status(&JobId::gem2s("e9")).await.unwrap(), JobStatus::NotCreated);
    assert!(feed.is_connected());
}

#[tokio::test]
async fn test_closed_socket_without_status_is_an_error() {
    let (base, _) = serve().await;
    let feed = StatusFeed::connect(&format!("{}/closing", base), &[]).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while feed.is_connected() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let err = feed.status(&JobId::qc("e1")).await.unwrap_err();
    assert!(matches!(err, E2eError::Socket(_)));
}

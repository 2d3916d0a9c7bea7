//! Observer protocol over a real websocket: language filtering from the
//! query string, `setLangs` updates, heartbeat counts, and the plain HTTP
//! surface around it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

use final_words::broadcaster::{self, known_langs};
use final_words::consumer::DELETIONS_CAPACITY;
use final_words::likes::LikedPost;
use final_words::server::{AppState, build_router};
use final_words::store::PersistedPost;

struct Stack {
    addr: SocketAddr,
    deletions: mpsc::Sender<LikedPost>,
    top_langs: mpsc::Sender<Vec<String>>,
    cancel: CancellationToken,
}

async fn spawn_stack(host: Option<String>) -> Stack {
    let (deletions_tx, deletions_rx) = mpsc::channel(DELETIONS_CAPACITY);
    let (observers_tx, observers_rx) = mpsc::channel(16);
    let (langs_tx, langs_rx) = mpsc::channel(16);
    let published = known_langs();
    let cancel = CancellationToken::new();

    tokio::spawn(broadcaster::run(
        deletions_rx,
        observers_rx,
        langs_rx,
        Arc::clone(&published),
        cancel.clone(),
    ));

    let router = build_router(AppState {
        observers: observers_tx,
        known_langs: published,
        host,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Stack {
        addr,
        deletions: deletions_tx,
        top_langs: langs_tx,
        cancel,
    }
}

fn deleted(text: &str, langs: &[&str]) -> LikedPost {
    LikedPost {
        post: PersistedPost {
            time_us: chrono::Utc::now().timestamp_micros(),
            text: text.to_owned(),
            langs: langs.iter().map(|&l| l.to_owned()).collect(),
            target: None,
        },
        likes: None,
    }
}

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Read frames until one with the given `type` arrives.
async fn next_frame_of(socket: &mut Socket, kind: &str) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket errored");
        if let Message::Text(text) = frame {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }
}

#[tokio::test]
async fn observer_count_arrives_on_join() {
    let stack = spawn_stack(None).await;
    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{}/", stack.addr)).await.unwrap();

    let frame = next_frame_of(&mut socket, "observers").await;
    assert_eq!(frame["observers"], 1);
    stack.cancel.cancel();
}

#[tokio::test]
async fn query_lang_filter_selects_posts() {
    let stack = spawn_stack(None).await;
    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{}/?lang=en", stack.addr))
            .await
            .unwrap();
    // The join count doubles as the registration barrier.
    next_frame_of(&mut socket, "observers").await;

    // Paced sends: the per-observer buffer is two deep and filtering happens
    // on the observer's writer side.
    for post in [
        deleted("untagged", &[]),
        deleted("em pt", &["pt"]),
        deleted("in en", &["en", "ja"]),
        deleted("sentinel", &["en"]),
    ] {
        stack.deletions.send(post).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let frame = next_frame_of(&mut socket, "post").await;
    assert_eq!(frame["post"]["value"]["text"], "in en");
    let frame = next_frame_of(&mut socket, "post").await;
    assert_eq!(frame["post"]["value"]["text"], "sentinel");
    stack.cancel.cancel();
}

#[tokio::test]
async fn set_langs_switches_to_unknown_only() {
    let stack = spawn_stack(None).await;
    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{}/", stack.addr)).await.unwrap();
    next_frame_of(&mut socket, "observers").await;

    socket
        .send(Message::Text(
            r#"{"type":"setLangs","langs":[null]}"#.into(),
        ))
        .await
        .unwrap();
    // Give the reader/writer pair a beat to apply the new selection.
    tokio::time::sleep(Duration::from_millis(200)).await;

    stack.deletions.send(deleted("tagged", &["pt"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stack.deletions.send(deleted("untagged", &[])).await.unwrap();

    let frame = next_frame_of(&mut socket, "post").await;
    assert_eq!(frame["post"]["value"]["text"], "untagged");
    stack.cancel.cancel();
}

#[tokio::test]
async fn post_frames_carry_age_likes_and_target() {
    let stack = spawn_stack(None).await;
    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{}/", stack.addr)).await.unwrap();
    next_frame_of(&mut socket, "observers").await;

    let mut liked = deleted("hello", &["en"]);
    liked.likes = Some(7);
    stack.deletions.send(liked).await.unwrap();

    let frame = next_frame_of(&mut socket, "post").await;
    assert_eq!(frame["post"]["likes"], 7);
    assert!(frame["post"]["age"].as_i64().unwrap() >= 0);
    assert!(frame["post"]["value"]["target"].is_null());
    stack.cancel.cancel();
}

#[tokio::test]
async fn ready_and_index_are_served() {
    let stack = spawn_stack(None).await;
    let http = reqwest::Client::new();

    let ready = http
        .get(format!("http://{}/ready", stack.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), 200);
    assert_eq!(ready.text().await.unwrap(), "ready");

    stack
        .top_langs
        .send(vec!["en".to_owned(), "pt".to_owned()])
        .await
        .unwrap();
    // The broadcaster publishes the list asynchronously; poll briefly.
    let mut page = String::new();
    for _ in 0..50 {
        let response = http
            .get(format!("http://{}/", stack.addr))
            .header("accept-language", "pt-BR,en;q=0.8")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(
            response
                .headers()
                .get("cache-control")
                .unwrap()
                .to_str()
                .unwrap()
                .contains("max-age=300"),
        );
        page = response.text().await.unwrap();
        if page.contains(r#"value="en""#) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(page.contains(r#"value="pt" checked"#), "browser lang preselected");
    stack.cancel.cancel();
}

#[tokio::test]
async fn metrics_are_exposed() {
    let stack = spawn_stack(None).await;
    let body = reqwest::get(format!("http://{}/metrics", stack.addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("post_deletion_observers"));
    stack.cancel.cancel();
}

#[tokio::test]
async fn oops_accepts_error_reports() {
    let stack = spawn_stack(None).await;
    let response = reqwest::Client::new()
        .post(format!("http://{}/oops", stack.addr))
        .body(r#"{"message":"it broke"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    stack.cancel.cancel();
}

#[tokio::test]
async fn mismatched_host_redirects_to_canonical() {
    let stack = spawn_stack(Some("deletions.example.com".to_owned())).await;
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let response = http
        .get(format!("http://{}/", stack.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 301);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "https://deletions.example.com/",
    );

    // Probes hit /ready with whatever Host they like.
    let ready = http
        .get(format!("http://{}/ready", stack.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), 200);
    stack.cancel.cancel();
}

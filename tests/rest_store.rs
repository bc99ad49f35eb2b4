//! `RestStore` against a local stand-in for the hosted store: command POSTs, bearer auth,
//! and a chunked subscribe stream feeding a real consumer.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use relay::models::{ChannelTarget, EventEnvelope, EventType};
use relay::repositories::store::frame;
use relay::services::ConsumerState;
use relay::{AppError, RealtimeConfig, RealtimeService, RestStore, Store};
use serde_json::json;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const TOKEN: &str = "store-secret";

#[derive(Debug, Clone)]
struct Call {
    authorization: Option<String>,
    accept: Option<String>,
    args: Vec<String>,
}

#[derive(Clone, Default)]
struct Recorded {
    commands: Arc<Mutex<Vec<Call>>>,
    subscribes: Arc<Mutex<Vec<Call>>>,
}

fn header(headers: &HeaderMap, name: axum::http::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn typing_event() -> String {
    serde_json::to_string(&EventEnvelope::new(
        EventType::ConversationTyping,
        json!({ "conversationId": "c1", "isTyping": true }),
    ))
    .unwrap()
}

async fn command(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(args): Json<Vec<String>>,
) -> Response {
    recorded.commands.lock().unwrap().push(Call {
        authorization: header(&headers, AUTHORIZATION),
        accept: None,
        args: args.clone(),
    });
    match args.first().map(String::as_str) {
        Some("PUBLISH") => Json(json!({ "result": 2 })).into_response(),
        Some("GET") => Json(json!({ "result": null })).into_response(),
        Some("SMEMBERS") => Json(json!({ "result": ["k1", "k2"] })).into_response(),
        Some("SADD") => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "WRONGTYPE Operation against a key holding the wrong kind of value" })),
        )
            .into_response(),
        _ => Json(json!({ "result": "OK" })).into_response(),
    }
}

/// Streams a subscribe confirmation, then one message record split across two chunks, then
/// keeps the connection open.
async fn subscribe(
    State(recorded): State<Recorded>,
    Path(channel): Path<String>,
    headers: HeaderMap,
) -> Response {
    recorded.subscribes.lock().unwrap().push(Call {
        authorization: header(&headers, AUTHORIZATION),
        accept: header(&headers, ACCEPT),
        args: vec![channel.clone()],
    });
    let record = frame("message", &channel, &typing_event());
    let (head, tail) = record.split_at(record.len() / 2);
    let chunks = vec![
        frame("subscribe", &channel, "1"),
        head.to_string(),
        tail.to_string(),
    ];
    let body = stream::iter(chunks)
        .then(|chunk| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, Infallible>(Bytes::from(chunk))
        })
        .chain(stream::pending());
    Response::builder()
        .header(CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(body))
        .unwrap()
}

async fn spawn_store() -> (String, Recorded) {
    let recorded = Recorded::default();
    let app = Router::new()
        .route("/", post(command))
        .route("/subscribe/:channel", get(subscribe))
        .with_state(recorded.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), recorded)
}

#[tokio::test]
async fn commands_are_json_arrays_with_bearer_auth() {
    let (url, recorded) = spawn_store().await;
    let store = RestStore::new(&url, TOKEN).unwrap();

    store
        .set_ex("rt:conn:k1", "{\"a\":1}", Duration::from_millis(1500))
        .await
        .unwrap();
    assert_eq!(store.publish("rt:connection:k1", "{}").await.unwrap(), 2);
    assert_eq!(store.get("rt:conn:missing").await.unwrap(), None);
    assert_eq!(
        store.smembers("rt:website:w1:connections").await.unwrap(),
        vec!["k1".to_string(), "k2".to_string()]
    );

    let err = store.sadd("rt:conn:k1", "x").await.unwrap_err();
    assert!(
        matches!(&err, AppError::Transport(msg) if msg.contains("WRONGTYPE")),
        "unexpected error: {err:?}"
    );

    let calls = recorded.commands.lock().unwrap().clone();
    assert_eq!(calls.len(), 5);
    assert_eq!(calls[0].args, vec!["SETEX", "rt:conn:k1", "2", "{\"a\":1}"]);
    assert_eq!(calls[1].args, vec!["PUBLISH", "rt:connection:k1", "{}"]);
    let bearer = format!("Bearer {}", TOKEN);
    assert!(calls
        .iter()
        .all(|call| call.authorization.as_deref() == Some(bearer.as_str())));
}

#[tokio::test]
async fn subscribe_stream_feeds_consumer() {
    let (url, recorded) = spawn_store().await;
    let store = RestStore::new(&url, TOKEN).unwrap();
    let config = RealtimeConfig {
        channel_prefix: "rt".to_string(),
        key_prefix: "rt".to_string(),
        reconnect_delay: Duration::from_millis(50),
        server_id: Some("srv".to_string()),
        ..RealtimeConfig::default()
    };
    let service = RealtimeService::new(Arc::new(store), config);

    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<EventEnvelope>>();
    let handler = move |event: Arc<EventEnvelope>| {
        std::future::ready(tx.send(event).map_err(anyhow::Error::from))
    };
    service
        .subscribe_to_channels(&ChannelTarget::connection("k1"), handler)
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event delivered")
        .unwrap();
    assert_eq!(event.event_type, EventType::ConversationTyping);
    assert_eq!(event.data["conversationId"], "c1");
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    let state = service.consumer_state("rt:connection:k1").await.unwrap();
    assert_eq!(*state.borrow(), ConsumerState::Streaming);

    let calls = recorded.subscribes.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].args, vec!["rt:connection:k1"]);
    assert_eq!(calls[0].authorization.as_deref(), Some("Bearer store-secret"));
    assert_eq!(calls[0].accept.as_deref(), Some("text/event-stream"));

    service.shutdown().await;
}

#[tokio::test]
async fn rejected_subscribe_is_a_transport_error() {
    let (url, _recorded) = spawn_store().await;
    let store = RestStore::new(&format!("{}/missing", url), TOKEN).unwrap();
    assert!(matches!(
        store.subscribe("rt:connection:k1").await,
        Err(AppError::Transport(_))
    ));
}

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use crate::broker::message::MessageId;
use crate::broker::{Broker, Message, Topic};
use crate::config::Settings;
use crate::transport::http::{AppState, serve_http};
use crate::transport::message::{ControlFrame, encode};
use crate::transport::server_push::PROCESSOR_ID_HEADER;
use crate::utils::testing::wait_until;

#[test]
fn test_control_frames_parse() {
    let frame: ControlFrame = serde_json::from_str(r#"{"type":"SUB","topic":"lists"}"#).unwrap();
    assert_eq!(
        frame,
        ControlFrame::Subscribe {
            topic: "lists".to_string()
        }
    );

    let frame: ControlFrame = serde_json::from_str(r#"{"type":"UNSUB","topic":"lists"}"#).unwrap();
    assert_eq!(
        frame,
        ControlFrame::Unsubscribe {
            topic: "lists".to_string()
        }
    );

    assert!(serde_json::from_str::<ControlFrame>(r#"{"type":"sub","topic":"lists"}"#).is_err());
    assert!(serde_json::from_str::<ControlFrame>(r#"{"type":"SUB"}"#).is_err());
}

#[test]
fn test_envelope_shape() {
    let message = Message::with_id(
        MessageId::from_raw(42),
        "lists",
        "created",
        json!({ "name": "groceries" }),
    );
    let encoded: Value = serde_json::from_str(&encode(&message).unwrap()).unwrap();
    assert_eq!(
        encoded,
        json!({ "type": "created", "id": 42, "message": { "name": "groceries" } })
    );
}

/// Start a broker with topic "lists" and serve the HTTP API on a free port.
async fn setup_http() -> (String, Broker) {
    let settings = Arc::new(Settings::default());
    let broker = Broker::start(&settings.broker).unwrap();
    broker.create_topic("lists").await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState {
        broker: broker.clone(),
        dispatcher: None,
        settings,
    };
    tokio::spawn(serve_http(listener, state));
    (format!("http://{addr}"), broker)
}

#[tokio::test]
async fn test_health() {
    let (url, _broker) = setup_http().await;
    let response = reqwest::get(format!("{url}/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_topic_management() {
    let (url, broker) = setup_http().await;
    let client = reqwest::Client::new();

    let created = client
        .post(format!("{url}/topics"))
        .json(&json!({ "topic": "users" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);

    let duplicate = client
        .post(format!("{url}/topics"))
        .json(&json!({ "topic": "users" }))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    let body: Value = duplicate.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("users"));

    let listed: Value = client
        .get(format!("{url}/topics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let topics = listed["topics"].as_array().unwrap();
    assert!(topics.contains(&json!("users")));
    assert!(topics.contains(&json!("_subscribe")));

    let deleted = client
        .delete(format!("{url}/topics/users"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    assert!(!broker.topics().await.unwrap().contains(&Topic::new("users")));

    let missing = client
        .delete(format!("{url}/topics/users"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let reserved = client
        .delete(format!("{url}/topics/_subscribe"))
        .send()
        .await
        .unwrap();
    assert_eq!(reserved.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_subscription_errors_map_to_status_codes() {
    let (url, _broker) = setup_http().await;
    let client = reqwest::Client::new();

    let malformed = client
        .post(format!("{url}/subscribe"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

    let unknown_processor = client
        .post(format!("{url}/subscribe"))
        .json(&json!({ "topic": "lists", "processor": "ghost" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_processor.status(), StatusCode::BAD_REQUEST);

    let unknown_topic = client
        .post(format!("{url}/subscribe"))
        .json(&json!({ "topic": "missing", "processor": "ghost" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_topic.status(), StatusCode::NOT_FOUND);

    let publish_missing = client
        .post(format!("{url}/publish"))
        .json(&json!({ "topic": "missing", "type": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(publish_missing.status(), StatusCode::NOT_FOUND);

    let reserved_subscribe = client
        .post(format!("{url}/subscribe"))
        .json(&json!({ "topic": "_subscribe", "processor": "ghost" }))
        .send()
        .await
        .unwrap();
    assert_eq!(reserved_subscribe.status(), StatusCode::BAD_REQUEST);

    let reserved_publish = client
        .post(format!("{url}/publish"))
        .json(&json!({ "topic": "_unsubscribe", "type": "unsubscriptionMessageType" }))
        .send()
        .await
        .unwrap();
    assert_eq!(reserved_publish.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_dispatch_route_needs_dispatcher() {
    let (url, _broker) = setup_http().await;
    let response = reqwest::Client::new()
        .post(format!("{url}/dispatch"))
        .json(&json!({ "message": Message::new("lists", "x", json!(null)) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_server_push_stream() {
    let (url, broker) = setup_http().await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{url}/connect")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let processor = response
        .headers()
        .get(PROCESSOR_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .expect("processor-id header")
        .to_string();
    let mut body = response.bytes_stream();

    let subscribed = client
        .post(format!("{url}/subscribe"))
        .json(&json!({ "topic": "lists", "processor": processor }))
        .send()
        .await
        .unwrap();
    assert_eq!(subscribed.status(), StatusCode::OK);
    let reply: Value = subscribed.json().await.unwrap();
    assert_eq!(
        reply,
        json!({ "subscription": { "processor": processor, "topic": "lists" } })
    );

    let published: Value = client
        .post(format!("{url}/publish"))
        .json(&json!({ "topic": "lists", "type": "created", "payload": { "name": "groceries" } }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = published["id"].as_i64().expect("message id");

    let mut buffer = Vec::new();
    let line = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                return buffer[..end].to_vec();
            }
            let chunk = body.next().await.expect("stream ended").expect("read chunk");
            buffer.extend_from_slice(&chunk);
        }
    })
    .await
    .expect("timed out waiting for a pushed message");
    let envelope: Value = serde_json::from_slice(&line).unwrap();
    assert_eq!(
        envelope,
        json!({ "type": "created", "id": id, "message": { "name": "groceries" } })
    );

    let unsubscribed = client
        .post(format!("{url}/unsubscribe"))
        .json(&json!({ "topic": "lists", "processor": processor }))
        .send()
        .await
        .unwrap();
    assert_eq!(unsubscribed.status(), StatusCode::OK);

    let again = client
        .post(format!("{url}/unsubscribe"))
        .json(&json!({ "topic": "lists", "processor": processor }))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::CONFLICT);

    // Dropping the response body disconnects the processor. The server only
    // notices once a write fails, so keep publishing until it does.
    broker.subscribe(&processor, "lists").await.unwrap();
    drop(body);
    let broker = &broker;
    assert!(
        wait_until(move || async move {
            let _ = broker.publish(Message::new("lists", "ping", json!(null))).await;
            broker.processors().await.unwrap().is_empty()
        })
        .await
    );
}

#[tokio::test]
async fn test_server_push_ends_when_unregistered() {
    let (url, broker) = setup_http().await;
    let response = reqwest::get(format!("{url}/connect")).await.unwrap();
    let processor = response.headers()[PROCESSOR_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();

    broker.unregister_processor(&processor).await.unwrap();

    let body = timeout(Duration::from_secs(2), response.bytes())
        .await
        .expect("stream did not end");
    assert!(body.unwrap().is_empty());
}

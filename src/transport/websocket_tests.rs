use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::broker::message::TOPIC_DELETED_TYPE;
use crate::broker::{Broker, Message};
use crate::config::Settings;
use crate::transport::message::ControlFrame;
use crate::transport::websocket::serve_websocket;
use crate::utils::testing::wait_until;

type Client = WebSocketStream<TcpStream>;

async fn setup_server_and_client() -> (Client, Broker) {
    let settings = Arc::new(Settings::default());
    let broker = Broker::start(&settings.broker).expect("start broker");
    broker.create_topic("lists").await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_websocket(listener, broker.clone(), settings));

    let stream = TcpStream::connect(addr).await.expect("Failed to connect");
    let (ws_stream, _) = tokio_tungstenite::client_async("ws://localhost/", stream)
        .await
        .expect("WebSocket handshake failed");
    (ws_stream, broker)
}

async fn send_frame(ws: &mut Client, frame: &ControlFrame) {
    ws.send(WsMessage::text(serde_json::to_string(frame).unwrap()))
        .await
        .expect("Failed to send control frame");
}

async fn wait_for_subscribers(broker: &Broker, topic: &str, expected: usize) -> bool {
    wait_until(move || async move {
        broker
            .subscribers(topic)
            .await
            .map(|ids| ids.len() == expected)
            .unwrap_or(false)
    })
    .await
}

async fn next_envelope(ws: &mut Client) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .expect("websocket error");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("envelope is not json");
        }
    }
}

#[tokio::test]
async fn test_subscribe_and_receive_envelope() {
    let (mut ws, broker) = setup_server_and_client().await;

    send_frame(
        &mut ws,
        &ControlFrame::Subscribe {
            topic: "lists".to_string(),
        },
    )
    .await;
    assert!(wait_for_subscribers(&broker, "lists", 1).await);

    let message = Message::new("lists", "created", json!({ "name": "groceries" }));
    broker.publish(message.clone()).await.unwrap();

    let envelope = next_envelope(&mut ws).await;
    assert_eq!(
        envelope,
        json!({
            "type": "created",
            "id": message.id.get(),
            "message": { "name": "groceries" }
        })
    );
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (mut ws, broker) = setup_server_and_client().await;

    send_frame(&mut ws, &ControlFrame::Subscribe { topic: "lists".into() }).await;
    assert!(wait_for_subscribers(&broker, "lists", 1).await);

    send_frame(&mut ws, &ControlFrame::Unsubscribe { topic: "lists".into() }).await;
    assert!(wait_for_subscribers(&broker, "lists", 0).await);

    // Still connected, just no longer subscribed.
    assert_eq!(broker.processors().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_frames_are_ignored() {
    let (mut ws, broker) = setup_server_and_client().await;

    ws.send(WsMessage::text("definitely not json".to_string())).await.unwrap();
    ws.send(WsMessage::text(r#"{"type":"PUBLISH","topic":"lists"}"#.to_string()))
        .await
        .unwrap();
    // Unknown topic: rejected by the broker, connection stays up.
    send_frame(&mut ws, &ControlFrame::Subscribe { topic: "missing".into() }).await;
    send_frame(&mut ws, &ControlFrame::Subscribe { topic: "lists".into() }).await;

    assert!(wait_for_subscribers(&broker, "lists", 1).await);
}

#[tokio::test]
async fn test_disconnect_unregisters_processor() {
    let (mut ws, broker) = setup_server_and_client().await;

    send_frame(&mut ws, &ControlFrame::Subscribe { topic: "lists".into() }).await;
    assert!(wait_for_subscribers(&broker, "lists", 1).await);

    ws.close(None).await.unwrap();

    let broker_ref = &broker;
    assert!(
        wait_until(move || async move { broker_ref.processors().await.unwrap().is_empty() }).await
    );
    assert!(wait_for_subscribers(&broker, "lists", 0).await);
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let (mut ws, broker) = setup_server_and_client().await;
    let broker_ref = &broker;
    assert!(
        wait_until(move || async move { broker_ref.processors().await.unwrap().len() == 1 }).await
    );

    let oversized = "x".repeat(Settings::default().websocket.max_message_size + 1);
    ws.send(WsMessage::text(oversized)).await.unwrap();

    assert!(
        wait_until(move || async move { broker_ref.processors().await.unwrap().is_empty() }).await
    );
}

#[tokio::test]
async fn test_server_side_unregister_closes_socket() {
    let (mut ws, broker) = setup_server_and_client().await;
    let broker_ref = &broker;
    assert!(
        wait_until(move || async move { broker_ref.processors().await.unwrap().len() == 1 }).await
    );

    let handle = broker.processors().await.unwrap().remove(0);
    broker.unregister_processor(handle.id()).await.unwrap();

    let closed = timeout(Duration::from_secs(2), async {
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(WsMessage::Close(_)) | Err(_) => return true,
                Ok(_) => {}
            }
        }
        true
    })
    .await
    .expect("socket was not closed");
    assert!(closed);
}

#[tokio::test]
async fn test_topic_deletion_is_pushed_to_client() {
    let (mut ws, broker) = setup_server_and_client().await;

    send_frame(&mut ws, &ControlFrame::Subscribe { topic: "lists".into() }).await;
    assert!(wait_for_subscribers(&broker, "lists", 1).await);

    broker.delete_topic("lists").await.unwrap();

    let envelope = next_envelope(&mut ws).await;
    assert_eq!(envelope["type"], TOPIC_DELETED_TYPE);
    assert_eq!(envelope["message"], json!({ "topic": "lists" }));
}

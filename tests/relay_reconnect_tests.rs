use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use voicemesh::config::ReconnectPolicy;
use voicemesh::relay::{RelayStatus, RelaySupervisor};
use voicemesh::signaling::RelayMessage;

async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> RelayMessage {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

fn quick_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
    }
}

#[tokio::test]
async fn connect_announces_join_and_pumps_both_directions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let (handle, mut inbound, _status) =
        RelaySupervisor::spawn(url, "r1".into(), "alice".into(), quick_policy());

    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(stream).await.unwrap();

    assert_eq!(
        next_frame(&mut ws).await,
        RelayMessage::Join {
            room: "r1".into(),
            username: "alice".into(),
        }
    );

    // Outbound: a chat sent through the handle reaches the relay.
    handle.send(RelayMessage::Chat {
        room: "r1".into(),
        username: "alice".into(),
        content: "hello".into(),
    });
    assert_eq!(
        next_frame(&mut ws).await,
        RelayMessage::Chat {
            room: "r1".into(),
            username: "alice".into(),
            content: "hello".into(),
        }
    );

    // Inbound: a broadcast frame surfaces on the session side.
    ws.send(Message::Text(
        r#"{"type":"user_joined","username":"bob","room":"r1"}"#.into(),
    ))
    .await
    .unwrap();
    assert_eq!(
        inbound.recv().await.unwrap(),
        RelayMessage::UserJoined {
            username: "bob".into()
        }
    );

    handle.shutdown();
}

#[tokio::test]
async fn reconnect_resends_join_with_the_same_credentials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let (handle, _inbound, mut status) =
        RelaySupervisor::spawn(url, "r1".into(), "alice".into(), quick_policy());

    // First connection: take the join, then drop the socket under it.
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(stream).await.unwrap();
    let first = next_frame(&mut ws).await;
    assert_eq!(
        first,
        RelayMessage::Join {
            room: "r1".into(),
            username: "alice".into(),
        }
    );
    drop(ws);

    // The supervisor dials again after the backoff and re-announces the same
    // credentials on the fresh channel.
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(stream).await.unwrap();
    assert_eq!(next_frame(&mut ws).await, first);

    handle.shutdown();
    while status.changed().await.is_ok() {
        if *status.borrow() == RelayStatus::Closed {
            break;
        }
    }
    assert_eq!(*status.borrow(), RelayStatus::Closed);
}

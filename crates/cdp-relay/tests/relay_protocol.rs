//! Protocol-level tests driving both relay endpoints as real WebSocket peers.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> cdp_relay::RelayHandle {
    cdp_relay::start("127.0.0.1:0".parse().unwrap())
        .await
        .expect("relay start")
}

async fn connect(url: &str) -> Socket {
    let (socket, _) = connect_async(url).await.expect("websocket connect");
    socket
}

async fn send_json(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .expect("send frame");
}

async fn recv_json(socket: &mut Socket) -> Value {
    let deadline = Duration::from_secs(2);
    loop {
        let message = timeout(deadline, socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket ended")
            .expect("socket error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).expect("frame is json"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

async fn expect_silence(socket: &mut Socket, window: Duration) {
    match timeout(window, socket.next()).await {
        Err(_) => {}
        Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
        Ok(other) => panic!("expected no traffic, got {other:?}"),
    }
}

async fn recv_close_code(socket: &mut Socket) -> (u16, String) {
    let deadline = Duration::from_secs(2);
    loop {
        let message = timeout(deadline, socket.next())
            .await
            .expect("timed out waiting for close")
            .expect("socket ended without close frame")
            .expect("socket error");
        match message {
            Message::Close(Some(frame)) => {
                return (u16::from(frame.code), frame.reason.to_string())
            }
            Message::Close(None) => return (1000, String::new()),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected close, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn intercepts_get_version_without_extension() {
    let relay = start_relay().await;
    let mut client = connect(&relay.cdp_url()).await;

    send_json(&mut client, json!({"id": 7, "method": "Browser.getVersion"})).await;
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["result"]["protocolVersion"], "1.3");
    assert_eq!(reply["result"]["product"], "Chrome/Bridge");
    assert_eq!(reply["result"]["userAgent"], "CDP-Bridge/1.0");

    send_json(
        &mut client,
        json!({"id": 8, "method": "Browser.setDownloadBehavior", "params": {"behavior": "deny"}}),
    )
    .await;
    let reply = recv_json(&mut client).await;
    assert_eq!(reply, json!({"id": 8}));

    relay.shutdown().await;
}

#[tokio::test]
async fn forwards_command_round_trip() {
    let relay = start_relay().await;
    let mut extension = connect(&relay.extension_url()).await;
    let mut client = connect(&relay.cdp_url()).await;

    send_json(
        &mut client,
        json!({"id": 1, "method": "Page.navigate", "params": {"url": "about:blank"}}),
    )
    .await;

    let envelope = recv_json(&mut extension).await;
    assert_eq!(envelope["method"], "forwardCDPCommand");
    assert_eq!(envelope["params"]["method"], "Page.navigate");
    assert_eq!(envelope["params"]["params"]["url"], "about:blank");
    assert_eq!(envelope["params"]["sessionId"], Value::Null);
    let forward_id = envelope["id"].as_u64().expect("relay-allocated id");

    send_json(
        &mut extension,
        json!({"id": forward_id, "result": {"frameId": "f1"}}),
    )
    .await;

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["frameId"], "f1");

    relay.shutdown().await;
}

#[tokio::test]
async fn mirrors_extension_errors_to_client() {
    let relay = start_relay().await;
    let mut extension = connect(&relay.extension_url()).await;
    let mut client = connect(&relay.cdp_url()).await;

    send_json(&mut client, json!({"id": 4, "method": "Page.reload"})).await;
    let envelope = recv_json(&mut extension).await;
    let forward_id = envelope["id"].as_u64().unwrap();
    send_json(
        &mut extension,
        json!({"id": forward_id, "error": {"message": "no such frame"}}),
    )
    .await;

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["id"], 4);
    assert_eq!(reply["error"]["message"], "no such frame");

    relay.shutdown().await;
}

#[tokio::test]
async fn synthesizes_auto_attach_and_target_info() {
    let relay = start_relay().await;
    let mut extension = connect(&relay.extension_url()).await;
    let mut client = connect(&relay.cdp_url()).await;

    let extension_task = tokio::spawn(async move {
        let envelope = recv_json(&mut extension).await;
        assert_eq!(envelope["method"], "attachToTab");
        let id = envelope["id"].as_u64().unwrap();
        send_json(
            &mut extension,
            json!({
                "id": id,
                "result": {
                    "sessionId": "S1",
                    "targetInfo": {
                        "targetId": "T1",
                        "type": "page",
                        "title": "x",
                        "url": "https://a",
                        "attached": false,
                        "browserContextId": "B",
                    },
                },
            }),
        )
        .await;
        extension
    });

    send_json(
        &mut client,
        json!({
            "id": 12,
            "method": "Target.setAutoAttach",
            "params": {"autoAttach": true, "waitForDebuggerOnStart": false, "flatten": true},
        }),
    )
    .await;

    let event = recv_json(&mut client).await;
    assert_eq!(event["method"], "Target.attachedToTarget");
    assert_eq!(event["params"]["sessionId"], "S1");
    assert_eq!(event["params"]["targetInfo"]["attached"], true);
    assert_eq!(event["params"]["waitingForDebugger"], false);

    let reply = recv_json(&mut client).await;
    assert_eq!(reply, json!({"id": 12}));

    let mut extension = extension_task.await.unwrap();

    // The stored attachment now answers Target.getTargetInfo locally.
    send_json(&mut client, json!({"id": 13, "method": "Target.getTargetInfo"})).await;
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["id"], 13);
    assert_eq!(reply["result"]["targetInfo"]["targetId"], "T1");
    expect_silence(&mut extension, Duration::from_millis(200)).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn holds_commands_until_extension_connects() {
    let relay = start_relay().await;
    let mut client = connect(&relay.cdp_url()).await;

    send_json(&mut client, json!({"id": 1, "method": "Page.enable"})).await;
    send_json(&mut client, json!({"id": 2, "method": "Runtime.enable"})).await;
    expect_silence(&mut client, Duration::from_millis(200)).await;

    let mut extension = connect(&relay.extension_url()).await;
    let first = recv_json(&mut extension).await;
    assert_eq!(first["params"]["method"], "Page.enable");
    let second = recv_json(&mut extension).await;
    assert_eq!(second["params"]["method"], "Runtime.enable");

    relay.shutdown().await;
}

#[tokio::test]
async fn intercepted_commands_answered_while_forwards_wait() {
    let relay = start_relay().await;
    let mut client = connect(&relay.cdp_url()).await;

    // No extension yet: this forward suspends on the readiness gate.
    send_json(&mut client, json!({"id": 1, "method": "Page.enable"})).await;
    // An intercepted command sent afterwards must still be answered now.
    send_json(&mut client, json!({"id": 2, "method": "Browser.getVersion"})).await;

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["id"], 2);
    assert_eq!(reply["result"]["product"], "Chrome/Bridge");

    // The held forward is delivered once the extension pairs.
    let mut extension = connect(&relay.extension_url()).await;
    let envelope = recv_json(&mut extension).await;
    assert_eq!(envelope["params"]["method"], "Page.enable");

    relay.shutdown().await;
}

#[tokio::test]
async fn abandons_queued_commands_when_client_leaves() {
    let relay = start_relay().await;
    let mut client = connect(&relay.cdp_url()).await;

    send_json(&mut client, json!({"id": 1, "method": "Page.enable"})).await;
    drop(client);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut extension = connect(&relay.extension_url()).await;
    expect_silence(&mut extension, Duration::from_millis(300)).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn fails_pending_forwards_when_extension_drops() {
    let relay = start_relay().await;
    let mut extension = connect(&relay.extension_url()).await;
    let mut client = connect(&relay.cdp_url()).await;

    for id in 1..=3u64 {
        send_json(&mut client, json!({"id": id, "method": "Page.enable"})).await;
    }
    for _ in 0..3 {
        recv_json(&mut extension).await;
    }
    extension.close(None).await.expect("extension close");

    let mut ids: Vec<u64> = Vec::new();
    for _ in 0..3 {
        let reply = recv_json(&mut client).await;
        assert_eq!(reply["error"]["message"], "WebSocket closed");
        ids.push(reply["id"].as_u64().unwrap());
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);

    relay.shutdown().await;
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..100 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn second_client_supersedes_first() {
    let relay = start_relay().await;
    let mut first = connect(&relay.cdp_url()).await;
    let state = relay.state();
    wait_until(|| state.has_client()).await;
    let mut second = connect(&relay.cdp_url()).await;

    let (code, reason) = recv_close_code(&mut first).await;
    assert_eq!(code, 1000);
    assert_eq!(reason, "New connection established");

    // The second client owns the slot: interception still answers it.
    send_json(&mut second, json!({"id": 1, "method": "Browser.getVersion"})).await;
    let reply = recv_json(&mut second).await;
    assert_eq!(reply["id"], 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn second_extension_supersedes_first() {
    let relay = start_relay().await;
    let mut first = connect(&relay.extension_url()).await;
    let state = relay.state();
    wait_until(|| state.has_extension()).await;
    let _second = connect(&relay.extension_url()).await;

    let (code, reason) = recv_close_code(&mut first).await;
    assert_eq!(code, 1000);
    assert_eq!(reason, "New connection established");

    relay.shutdown().await;
}

#[tokio::test]
async fn unwraps_extension_events_to_client() {
    let relay = start_relay().await;
    let mut extension = connect(&relay.extension_url()).await;
    let mut client = connect(&relay.cdp_url()).await;
    let state = relay.state();
    wait_until(|| state.has_client()).await;

    send_json(
        &mut extension,
        json!({
            "method": "forwardCDPEvent",
            "params": {
                "sessionId": "S1",
                "method": "Page.loadEventFired",
                "params": {"timestamp": 12.5},
            },
        }),
    )
    .await;

    let event = recv_json(&mut client).await;
    assert_eq!(event["sessionId"], "S1");
    assert_eq!(event["method"], "Page.loadEventFired");
    assert_eq!(event["params"]["timestamp"], 12.5);
    assert!(event.get("id").is_none());

    relay.shutdown().await;
}

#[tokio::test]
async fn intercepted_methods_never_reach_extension() {
    let relay = start_relay().await;
    let mut extension = connect(&relay.extension_url()).await;
    let mut client = connect(&relay.cdp_url()).await;

    send_json(&mut client, json!({"id": 1, "method": "Browser.getVersion"})).await;
    send_json(
        &mut client,
        json!({"id": 2, "method": "Browser.setDownloadBehavior", "params": {"behavior": "allow"}}),
    )
    .await;
    send_json(&mut client, json!({"id": 3, "method": "Page.navigate", "params": {"url": "https://a"}})).await;

    // The first envelope that reaches the extension is the first
    // non-intercepted command.
    let envelope = recv_json(&mut extension).await;
    assert_eq!(envelope["method"], "forwardCDPCommand");
    assert_eq!(envelope["params"]["method"], "Page.navigate");

    relay.shutdown().await;
}

#[tokio::test]
async fn closes_unknown_path_with_4004() {
    let relay = start_relay().await;
    let url = format!("ws://{}/nope", relay.local_addr());
    let mut socket = connect(&url).await;

    let (code, reason) = recv_close_code(&mut socket).await;
    assert_eq!(code, 4004);
    assert_eq!(reason, "Invalid path");

    relay.shutdown().await;
}

#[tokio::test]
async fn malformed_client_json_closes_socket() {
    let relay = start_relay().await;
    let mut client = connect(&relay.cdp_url()).await;

    client
        .send(Message::Text("this is not json".into()))
        .await
        .expect("send garbage");

    let deadline = Duration::from_secs(2);
    loop {
        match timeout(deadline, client.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
        }
    }

    relay.shutdown().await;
}

#[tokio::test]
async fn detached_from_tab_clears_attachment_and_closes_extension() {
    let relay = start_relay().await;
    let mut extension = connect(&relay.extension_url()).await;
    let mut client = connect(&relay.cdp_url()).await;

    let state = relay.state();
    let extension_task = tokio::spawn(async move {
        let envelope = recv_json(&mut extension).await;
        let id = envelope["id"].as_u64().unwrap();
        send_json(
            &mut extension,
            json!({"id": id, "result": {"sessionId": "S9", "targetInfo": {"targetId": "T9"}}}),
        )
        .await;
        extension
    });
    send_json(
        &mut client,
        json!({"id": 1, "method": "Target.setAutoAttach", "params": {"autoAttach": true}}),
    )
    .await;
    recv_json(&mut client).await; // attachedToTarget
    recv_json(&mut client).await; // empty success
    assert!(state.attachment().is_some());

    let mut extension = extension_task.await.unwrap();
    send_json(&mut extension, json!({"method": "detachedFromTab"})).await;

    let deadline = Duration::from_secs(2);
    loop {
        match timeout(deadline, extension.next())
            .await
            .expect("timed out waiting for extension close")
        {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.attachment().is_none());

    relay.shutdown().await;
}

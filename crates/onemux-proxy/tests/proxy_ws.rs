//! End-to-end tests over real sockets: a router listener, a
//! tokio-tungstenite client, and stub target servers.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async,
    tungstenite::Message};

use onemux_core::{
    AuthStatus, CommandHook, ConnectionConfig, Direction, PersistenceHook, ProxyHooks,
    TargetEndpoint,
};
use onemux_proxy::ProxyRouter;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(500);

type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct NoopHook;
#[async_trait]
impl CommandHook for NoopHook {}

struct NullStore;
#[async_trait]
impl PersistenceHook for NullStore {
    async fn save_message(&self, _envelope: &Value, _direction: Direction, _connection_id: &str) {}
    async fn auth_status(&self, _bot_id: &str) -> Option<AuthStatus> {
        None
    }
    async fn upsert_auth_status(&self, _status: AuthStatus) {}
    async fn delete_auth_status(&self, _bot_id: &str) {}
}

fn hooks() -> ProxyHooks {
    ProxyHooks {
        command: Arc::new(NoopHook),
        persistence: Arc::new(NullStore),
    }
}

/// A downstream stub: accepts one connection, surfaces every received frame
/// and sends whatever the test pushes through `outbound`.
struct StubTarget {
    addr: SocketAddr,
    frames: mpsc::UnboundedReceiver<Message>,
    outbound: mpsc::UnboundedSender<Message>,
}

async fn spawn_target() -> StubTarget {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(ws) = accept_async(stream).await else {
            return;
        };
        let (mut tx, mut rx) = ws.split();
        loop {
            tokio::select! {
                incoming = rx.next() => match incoming {
                    Some(Ok(message)) => {
                        let _ = frames_tx.send(message);
                    }
                    _ => break,
                },
                order = outbound_rx.recv() => match order {
                    Some(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    StubTarget {
        addr,
        frames,
        outbound,
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn wait_for_port(port: u16) {
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("listener did not start on port {port}");
}

async fn start_router(
    port: u16,
    path: &str,
    targets: Vec<TargetEndpoint>,
) -> Arc<ProxyRouter> {
    let mut configs = BTreeMap::new();
    configs.insert(
        "test".to_string(),
        ConnectionConfig {
            enabled: true,
            client_endpoint: format!("ws://127.0.0.1:{port}{path}"),
            target_endpoints: targets,
        },
    );
    let router = ProxyRouter::new(configs, hooks());
    router.serve();
    wait_for_port(port).await;
    router
}

fn lifecycle_frame() -> Value {
    json!({
        "post_type": "meta_event",
        "meta_event_type": "lifecycle",
        "sub_type": "connect",
        "self_id": 3,
    })
}

async fn next_target_frame(frames: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    loop {
        let message = timeout(WAIT, frames.recv())
            .await
            .expect("timed out waiting for a target frame")
            .expect("target channel closed");
        match message {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn next_client_frame(client: &mut ClientWs) -> Message {
    loop {
        let message = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client stream ended")
            .expect("client socket error");
        match message {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

fn as_json(message: &Message) -> Value {
    match message {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        Message::Binary(data) => serde_json::from_slice(data).unwrap(),
        other => panic!("expected a data frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_event_fans_out_to_onebot_and_sakoya_targets() {
    let mut plain = spawn_target().await;
    let mut sakoya = spawn_target().await;
    let port = free_port().await;
    let targets = vec![
        TargetEndpoint::Url(format!("ws://127.0.0.1:{}/onebot/ws", plain.addr.port())),
        serde_json::from_value(json!({
            "url": format!("ws://127.0.0.1:{}/ws/Bot", sakoya.addr.port()),
            "sakoya_protocol": true,
        }))
        .unwrap(),
    ];
    let router = start_router(port, "/bs/test", targets).await;

    let (mut client, _) = connect_async(format!("ws://127.0.0.1:{port}/bs/test"))
        .await
        .unwrap();
    let lifecycle = lifecycle_frame();
    client
        .send(Message::Text(lifecycle.to_string().into()))
        .await
        .unwrap();

    // the plain target observes the registration frame
    let first = next_target_frame(&mut plain.frames).await;
    assert_eq!(as_json(&first), lifecycle);

    let event = json!({
        "post_type": "message",
        "message_type": "group",
        "group_id": 1,
        "user_id": 2,
        "self_id": 3,
        "message_id": 10,
        "message": [{"type": "text", "data": {"text": "hi"}}],
    });
    client
        .send(Message::Text(event.to_string().into()))
        .await
        .unwrap();

    // the plain target receives the identical JSON
    let forwarded = next_target_frame(&mut plain.frames).await;
    assert_eq!(as_json(&forwarded), event);

    // the dialect target skipped the meta event entirely; its first frame is
    // the translated message as binary
    let wire = next_target_frame(&mut sakoya.frames).await;
    assert!(matches!(wire, Message::Binary(_)));
    let receive = as_json(&wire);
    assert_eq!(receive["bot_id"], "Bot");
    assert_eq!(receive["user_type"], "group");
    assert_eq!(receive["group_id"], "1");
    assert_eq!(receive["user_id"], "2");
    assert_eq!(receive["content"], json!([{"type": "text", "data": "hi"}]));

    router.shutdown().await;
}

#[tokio::test]
async fn test_rpc_response_routes_to_issuing_target_only() {
    let mut quiet = spawn_target().await;
    let mut caller = spawn_target().await;
    let port = free_port().await;
    let targets = vec![
        TargetEndpoint::Url(format!("ws://127.0.0.1:{}/ws", quiet.addr.port())),
        TargetEndpoint::Url(format!("ws://127.0.0.1:{}/ws", caller.addr.port())),
    ];
    let router = start_router(port, "/bs/rpc", targets).await;

    let (mut client, _) = connect_async(format!("ws://127.0.0.1:{port}/bs/rpc"))
        .await
        .unwrap();
    client
        .send(Message::Text(lifecycle_frame().to_string().into()))
        .await
        .unwrap();
    next_target_frame(&mut quiet.frames).await;
    next_target_frame(&mut caller.frames).await;

    // target 2 issues an API call toward the client
    let call = json!({
        "action": "send_group_msg",
        "params": {"group_id": 1, "message": [{"type": "text", "data": {"text": "hi"}}]},
        "echo": "a1",
    });
    caller
        .outbound
        .send(Message::Text(call.to_string().into()))
        .unwrap();
    let delivered = next_client_frame(&mut client).await;
    assert_eq!(as_json(&delivered), call);

    // the client's response must reach target 2 only
    let response = json!({"status": "ok", "retcode": 0, "echo": "a1", "data": {"message_id": 99}});
    client
        .send(Message::Text(response.to_string().into()))
        .await
        .unwrap();
    let routed = next_target_frame(&mut caller.frames).await;
    assert_eq!(as_json(&routed), response);
    assert!(
        timeout(QUIET, quiet.frames.recv()).await.is_err(),
        "target 1 must not see the response"
    );

    // the echo entry was consumed: a replay of the response is dropped
    client
        .send(Message::Text(response.to_string().into()))
        .await
        .unwrap();
    assert!(
        timeout(QUIET, caller.frames.recv()).await.is_err(),
        "a second response with the same echo must be dropped"
    );

    router.shutdown().await;
}

#[tokio::test]
async fn test_second_client_rejected_while_first_open() {
    let port = free_port().await;
    let router = start_router(port, "/bs/dup", Vec::new()).await;
    let url = format!("ws://127.0.0.1:{port}/bs/dup");

    let (mut first, _) = connect_async(url.as_str()).await.unwrap();
    first
        .send(Message::Text(lifecycle_frame().to_string().into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (mut second, _) = connect_async(url.as_str()).await.unwrap();
    let close = loop {
        match timeout(WAIT, second.next())
            .await
            .expect("timed out waiting for rejection")
        {
            Some(Ok(Message::Close(frame))) => break frame.expect("close frame with code"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("socket error instead of close frame: {e}"),
            None => panic!("stream ended without a close frame"),
        }
    };
    assert_eq!(close.code, CloseCode::Policy);
    assert_eq!(close.reason.as_str(), "Connection already exists");

    // the first client is unaffected
    first
        .send(Message::Text(
            json!({"post_type": "message", "self_id": 3, "message": []})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    router.shutdown().await;
}

#[tokio::test]
async fn test_unknown_path_rejected() {
    let port = free_port().await;
    let router = start_router(port, "/bs/known", Vec::new()).await;

    let (mut socket, _) = connect_async(format!("ws://127.0.0.1:{port}/bs/other"))
        .await
        .unwrap();
    let close = loop {
        match timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for rejection")
        {
            Some(Ok(Message::Close(frame))) => break frame.expect("close frame with code"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("socket error instead of close frame: {e}"),
            None => panic!("stream ended without a close frame"),
        }
    };
    assert_eq!(close.code, CloseCode::Policy);

    router.shutdown().await;
}

#[tokio::test]
async fn test_disabled_target_never_dialed() {
    let mut enabled = spawn_target().await;
    let mut disabled = spawn_target().await;
    let port = free_port().await;
    let targets = vec![
        TargetEndpoint::Url(format!("ws://127.0.0.1:{}/ws", enabled.addr.port())),
        serde_json::from_value(json!({
            "url": format!("ws://127.0.0.1:{}/ws", disabled.addr.port()),
            "disabled": true,
        }))
        .unwrap(),
    ];
    let router = start_router(port, "/bs/off", targets).await;

    let (mut client, _) = connect_async(format!("ws://127.0.0.1:{port}/bs/off"))
        .await
        .unwrap();
    client
        .send(Message::Text(lifecycle_frame().to_string().into()))
        .await
        .unwrap();

    // the enabled slot registers, the disabled one sees no connection at all
    next_target_frame(&mut enabled.frames).await;
    assert!(
        timeout(QUIET, disabled.frames.recv()).await.is_err(),
        "disabled target must never be dialed"
    );

    router.shutdown().await;
}

#[tokio::test]
async fn test_reload_switches_targets_without_dropping_client() {
    let mut old_target = spawn_target().await;
    let port = free_port().await;
    let client_endpoint = format!("ws://127.0.0.1:{port}/bs/reload");
    let router = start_router(
        port,
        "/bs/reload",
        vec![TargetEndpoint::Url(format!(
            "ws://127.0.0.1:{}/ws",
            old_target.addr.port()
        ))],
    )
    .await;

    let (mut client, _) = connect_async(client_endpoint.as_str()).await.unwrap();
    let lifecycle = lifecycle_frame();
    client
        .send(Message::Text(lifecycle.to_string().into()))
        .await
        .unwrap();
    next_target_frame(&mut old_target.frames).await;

    // swap the target set under the live connection
    let mut new_target = spawn_target().await;
    let mut configs = BTreeMap::new();
    configs.insert(
        "test".to_string(),
        ConnectionConfig {
            enabled: true,
            client_endpoint: client_endpoint.clone(),
            target_endpoints: vec![TargetEndpoint::Url(format!(
                "ws://127.0.0.1:{}/ws",
                new_target.addr.port()
            ))],
        },
    );
    router.reload(configs).await;

    // the fresh target observes the replayed registration frame
    let replay = next_target_frame(&mut new_target.frames).await;
    assert_eq!(as_json(&replay), lifecycle);

    // the client socket survived the reload and traffic flows to the new set
    let event = json!({"post_type": "message", "message_type": "private", "user_id": 2, "self_id": 3, "message": []});
    client
        .send(Message::Text(event.to_string().into()))
        .await
        .unwrap();
    let forwarded = next_target_frame(&mut new_target.frames).await;
    assert_eq!(as_json(&forwarded), event);

    router.shutdown().await;
}

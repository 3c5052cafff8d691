//! Two real nodes over localhost TCP: dial, fire-and-forget text, and a
//! correlated request/response answered on the same stream.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use libp2p::{identity::Keypair, multiaddr::Protocol, Multiaddr, PeerId};
use satchel_net::{
    handler::{
        spawn_inbound_loop, InboundSubscriber, NoopNotifier, SubscriberAction,
    },
    swarm::{self, SwarmParams},
    MessageHandler, SwarmHandle,
};
use satchel_tokio::{notify_once::NotifyOnce, task::SatTask};
use satchel_wire::{
    envelope::{ResponsePayload, TextPayload},
    Envelope, MsgBody,
};

struct TestNode {
    handle: SwarmHandle,
    handler: Arc<MessageHandler>,
    _tasks: Vec<SatTask<()>>,
}

async fn spawn_node(shutdown: NotifyOnce) -> TestNode {
    let (driver, handle, inbound_rx) = swarm::build(
        SwarmParams {
            keypair: Keypair::generate_ed25519(),
            port: 0,
            announce_addrs: Vec::new(),
            enable_mdns: false,
            max_message_bytes: 1024 * 1024,
            request_timeout: Duration::from_secs(10),
        },
        shutdown.clone(),
    )
    .unwrap();

    let handler = MessageHandler::new(
        Arc::new(handle.clone()),
        Arc::new(NoopNotifier),
        1024 * 1024,
    );

    let tasks = vec![
        SatTask::spawn("driver", driver.run()),
        spawn_inbound_loop(
            handler.clone(),
            handle.clone(),
            inbound_rx,
            shutdown.clone(),
        ),
    ];

    TestNode {
        handle,
        handler,
        _tasks: tasks,
    }
}

/// Wait for the OS-assigned loopback listener and return it as a full
/// dialable multiaddr.
async fn listen_addr_of(node: &TestNode) -> Multiaddr {
    for _ in 0..200 {
        let addrs = node.handle.self_addrs().await.unwrap();
        let loopback = addrs.iter().find(|addr| {
            addr.iter()
                .any(|p| matches!(p, Protocol::Ip4(ip) if ip.is_loopback()))
        });
        if let Some(addr) = loopback {
            return addr
                .clone()
                .with(Protocol::P2p(node.handle.local_peer_id()));
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("listener never appeared");
}

struct EchoService {
    texts: Mutex<Vec<String>>,
}

#[async_trait]
impl InboundSubscriber for EchoService {
    async fn on_message(
        &self,
        _from: PeerId,
        envelope: &Envelope,
    ) -> SubscriberAction {
        match &envelope.body {
            MsgBody::Text(text) => {
                self.texts.lock().unwrap().push(text.content.clone());
                SubscriberAction::Consumed
            }
            MsgBody::Request(request) =>
                SubscriberAction::Reply(MsgBody::Response(ResponsePayload {
                    request_id: envelope.id,
                    result: serde_json::json!({ "echo": request.params }),
                    error: None,
                })),
            _ => SubscriberAction::Ignored,
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn two_nodes_exchange_messages() {
    logger::init_for_testing();
    let shutdown = NotifyOnce::new();

    let node_a = spawn_node(shutdown.clone()).await;
    let node_b = spawn_node(shutdown.clone()).await;

    let echo = Arc::new(EchoService {
        texts: Mutex::new(Vec::new()),
    });
    node_b.handler.register_subscriber(echo.clone());

    let addr_b = listen_addr_of(&node_b).await;
    let peer_b = node_b.handle.local_peer_id();

    tokio::time::timeout(
        Duration::from_secs(10),
        node_a.handle.dial(addr_b),
    )
    .await
    .expect("dial timed out")
    .expect("dial failed");
    assert!(node_a.handle.is_connected(peer_b).await.unwrap());

    // Fire-and-forget.
    node_a
        .handler
        .send(
            peer_b,
            MsgBody::Text(TextPayload {
                content: "hello".to_owned(),
            }),
        )
        .await
        .unwrap();

    // Correlated request/response, resolved by the same-stream reply.
    let response = tokio::time::timeout(
        Duration::from_secs(10),
        node_a.handler.request(
            peer_b,
            "echo",
            serde_json::json!({ "n": 7 }),
            Duration::from_secs(5),
        ),
    )
    .await
    .expect("request timed out")
    .expect("request failed");
    assert_eq!(response.result["echo"]["n"], 7);
    assert_eq!(node_a.handler.pending_requests(), 0);

    // The text lands independently of the request; poll briefly.
    let mut seen = false;
    for _ in 0..200 {
        if echo.texts.lock().unwrap().iter().any(|t| t == "hello") {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(seen, "text message never arrived");

    shutdown.send();
}

#[tokio::test(flavor = "multi_thread")]
async fn request_to_unreachable_peer_fails() {
    let shutdown = NotifyOnce::new();
    let node = spawn_node(shutdown.clone()).await;

    // Nobody home: the behaviour has no address for this peer.
    let stranger = PeerId::random();
    let err = node
        .handler
        .request(
            stranger,
            "echo",
            serde_json::json!({}),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

    // Dial failure surfaces as peer-not-connected (or a timeout if the
    // dial hangs); either way the correlation table is clean.
    let kind = err.kind();
    assert!(
        kind == "peer-not-connected" || kind == "timeout",
        "unexpected error kind {kind}"
    );
    assert_eq!(node.handler.pending_requests(), 0);

    shutdown.send();
}

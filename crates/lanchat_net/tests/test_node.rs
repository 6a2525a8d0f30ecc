use std::collections::HashSet;
use std::time::Duration;

use lanchat_net::chat::ChatMessage;
use lanchat_net::{
    Envelope, LanNode, Message, NetworkConfig, NetworkError, NodeEvent, NodeId, NodeIdentity,
    Peer,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    seq: u32,
}

impl Message for Ping {
    const TYPE_NAME: &'static str = "test.ping";
}

async fn started_node(name: &str) -> LanNode {
    let mut node = LanNode::new(NodeIdentity::generate(name), NetworkConfig::loopback());
    node.start().await.unwrap();
    node
}

fn peer_of(node: &LanNode) -> Peer {
    Peer::new(
        node.node_id().clone(),
        node.identity().name.clone(),
        "127.0.0.1".parse().unwrap(),
        node.local_addr().unwrap().port(),
    )
}

/// Wait for the first event matching `pick`, skipping everything else.
async fn next_matching<T>(
    rx: &mut UnboundedReceiver<NodeEvent>,
    mut pick: impl FnMut(NodeEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_text_end_to_end() {
    let mut a = started_node("alice").await;
    let mut b = started_node("bob").await;
    let mut a_events = a.subscribe();

    let sent = b.send_text("hello", Some(&peer_of(&a))).await.unwrap();
    assert_eq!(sent, 1);

    let (peer, text) = next_matching(&mut a_events, |e| match e {
        NodeEvent::TextReceived { peer, text } => Some((peer, text)),
        _ => None,
    })
    .await;
    assert_eq!(text, "hello");
    assert_eq!(&peer.node_id, b.node_id());
    assert_eq!(peer.name, "bob");
    assert_eq!(peer.port, b.local_addr().unwrap().port());

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_connect_reports_remote_identity() {
    let mut a = started_node("alice").await;
    let mut b = started_node("bob").await;
    let mut a_events = a.subscribe();

    let mut guess = peer_of(&a);
    guess.node_id = NodeId::generate();
    guess.name = "unknown".into();

    let connected = b.connect(&guess).await.unwrap();
    assert_eq!(&connected.node_id, a.node_id());
    assert_eq!(connected.name, "alice");

    let inbound = next_matching(&mut a_events, |e| match e {
        NodeEvent::PeerConnected(p) => Some(p),
        _ => None,
    })
    .await;
    assert_eq!(&inbound.node_id, b.node_id());

    // A second connect reuses the session.
    b.connect(&guess).await.unwrap();
    assert_eq!(b.connected_peers().len(), 1);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_typed_object_dispatch() {
    let mut a = started_node("alice").await;
    let mut b = started_node("bob").await;
    a.register_type::<Ping>();
    let mut a_events = a.subscribe();

    b.send_object(&Ping { seq: 7 }, Some(&peer_of(&a)))
        .await
        .unwrap();

    let obj = next_matching(&mut a_events, |e| match e {
        NodeEvent::ObjectReceived(obj) => Some(obj),
        _ => None,
    })
    .await;
    assert_eq!(obj.type_name, Ping::TYPE_NAME);
    let resolved = obj.resolved.expect("Ping is registered");
    assert_eq!(resolved.downcast_ref::<Ping>(), Some(&Ping { seq: 7 }));

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_unregistered_object_is_delivered_raw() {
    let mut a = started_node("alice").await;
    let mut b = started_node("bob").await;
    let mut a_events = a.subscribe();

    let env = Envelope::new("custom.thing", serde_json::json!({"k": "v"}));
    b.send_envelope(&env, Some(&peer_of(&a))).await.unwrap();

    let obj = next_matching(&mut a_events, |e| match e {
        NodeEvent::ObjectReceived(obj) => Some(obj),
        _ => None,
    })
    .await;
    assert_eq!(obj.type_name, "custom.thing");
    assert_eq!(obj.data["k"], "v");
    assert!(obj.resolved.is_none());

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_chat_message_between_nodes() {
    let mut a = started_node("alice").await;
    let mut b = started_node("bob").await;
    // Chat types are registered on the receiver only.
    a.register_type::<ChatMessage>();
    let mut a_events = a.subscribe();

    let msg = ChatMessage::new(b.identity(), "lunch?");
    b.send_object(&msg, Some(&peer_of(&a))).await.unwrap();

    let obj = next_matching(&mut a_events, |e| match e {
        NodeEvent::ObjectReceived(obj) => obj.resolved,
        _ => None,
    })
    .await;
    let got = obj.downcast_ref::<ChatMessage>().unwrap();
    assert_eq!(got.content, "lunch?");
    assert_eq!(&got.sender_id, b.node_id());

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_broadcast_survives_dead_peer() {
    let mut hub = started_node("hub").await;
    let mut alive = started_node("alive").await;
    let mut doomed = started_node("doomed").await;
    let mut alive_events = alive.subscribe();
    let mut hub_events = hub.subscribe();

    hub.connect(&peer_of(&alive)).await.unwrap();
    let doomed_peer = hub.connect(&peer_of(&doomed)).await.unwrap();
    assert_eq!(hub.connected_peers().len(), 2);

    doomed.stop().await;
    let gone = next_matching(&mut hub_events, |e| match e {
        NodeEvent::PeerDisconnected { peer, .. } => Some(peer),
        _ => None,
    })
    .await;
    assert_eq!(gone.node_id, doomed_peer.node_id);

    let sent = hub.send_text("still here", None).await.unwrap();
    assert_eq!(sent, 1);

    let text = next_matching(&mut alive_events, |e| match e {
        NodeEvent::TextReceived { text, .. } => Some(text),
        _ => None,
    })
    .await;
    assert_eq!(text, "still here");

    hub.stop().await;
    alive.stop().await;
}

#[tokio::test]
async fn test_disconnect_notifies_both_sides() {
    let mut a = started_node("alice").await;
    let mut b = started_node("bob").await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let a_peer = b.connect(&peer_of(&a)).await.unwrap();
    b.disconnect(&a_peer).unwrap();
    assert!(matches!(
        b.disconnect(&a_peer),
        Err(NetworkError::PeerNotFound(_))
    ));

    let local = next_matching(&mut b_events, |e| match e {
        NodeEvent::PeerDisconnected { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(local, "closed locally");

    let remote = next_matching(&mut a_events, |e| match e {
        NodeEvent::PeerDisconnected { peer, .. } => Some(peer),
        _ => None,
    })
    .await;
    assert_eq!(&remote.node_id, b.node_id());

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_stop_closes_sessions() {
    let mut a = started_node("alice").await;
    let mut b = started_node("bob").await;
    let mut b_events = b.subscribe();

    b.connect(&peer_of(&a)).await.unwrap();
    a.stop().await;

    next_matching(&mut b_events, |e| match e {
        NodeEvent::PeerDisconnected { .. } => Some(()),
        _ => None,
    })
    .await;
    assert!(b.connected_peers().is_empty());

    b.stop().await;
}

async fn next_text(rx: &mut UnboundedReceiver<NodeEvent>) -> String {
    next_matching(rx, |e| match e {
        NodeEvent::TextReceived { text, .. } => Some(text),
        _ => None,
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_sends_share_one_session() {
    for _ in 0..10 {
        let mut a = started_node("alice").await;
        let mut b = started_node("bob").await;
        let mut b_events = b.subscribe();
        let pb = peer_of(&b);

        let sends = (0..8).map(|i| {
            let (a, pb) = (&a, &pb);
            async move { a.send_text(&format!("m{i}"), Some(pb)).await }
        });
        for result in futures::future::join_all(sends).await {
            assert_eq!(result.unwrap(), 1);
        }

        let mut missing: HashSet<String> = (0..8).map(|i| format!("m{i}")).collect();
        while !missing.is_empty() {
            let text = next_text(&mut b_events).await;
            assert!(missing.remove(&text), "unexpected or repeated '{text}'");
        }
        assert_eq!(a.connected_peers().len(), 1);
        assert_eq!(b.connected_peers().len(), 1);

        b.stop().await;
        a.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_connect_settles_on_one_session() {
    for round in 0..10 {
        let mut a = started_node("alice").await;
        let mut b = started_node("bob").await;
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();
        let (pa, pb) = (peer_of(&a), peer_of(&b));

        let (to_b, to_a) = tokio::join!(a.connect(&pb), b.connect(&pa));
        assert_eq!(&to_b.unwrap().node_id, b.node_id());
        assert_eq!(&to_a.unwrap().node_id, a.node_id());

        let first = format!("a{round}");
        assert_eq!(a.send_text(&first, Some(&pb)).await.unwrap(), 1);
        assert_eq!(next_text(&mut b_events).await, first);
        let first = format!("b{round}");
        assert_eq!(b.send_text(&first, Some(&pa)).await.unwrap(), 1);
        assert_eq!(next_text(&mut a_events).await, first);

        // The losing session has drained by now; one session each way remains.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(a.connected_peers().len(), 1);
        assert_eq!(b.connected_peers().len(), 1);

        let again = format!("again a{round}");
        assert_eq!(a.send_text(&again, Some(&pb)).await.unwrap(), 1);
        assert_eq!(next_text(&mut b_events).await, again);
        let again = format!("again b{round}");
        assert_eq!(b.send_text(&again, Some(&pa)).await.unwrap(), 1);
        assert_eq!(next_text(&mut a_events).await, again);

        b.stop().await;
        a.stop().await;
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn test_unicast_announcement_registers_peer() {
    let mut config = NetworkConfig::loopback();
    config.discovery_enabled = true;
    config.discovery_port = free_udp_port();
    let port = config.discovery_port;

    let mut node = LanNode::new(NodeIdentity::generate("listener"), config);
    let mut events = node.subscribe();
    node.start().await.unwrap();

    let remote = NodeId::generate();
    let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sock.send_to(
        format!("HERE|{remote}|carol|5555").as_bytes(),
        ("127.0.0.1", port),
    )
    .await
    .unwrap();

    let found = next_matching(&mut events, |e| match e {
        NodeEvent::PeerDiscovered(p) if p.node_id == remote => Some(p),
        _ => None,
    })
    .await;
    assert_eq!(found.name, "carol");
    assert_eq!(found.port, 5555);
    assert_eq!(node.peers().len(), 1);

    node.stop().await;
    assert!(node.peers().is_empty());
}

#[tokio::test]
#[ignore = "requires multicast loopback on the host network"]
async fn test_multicast_discovery_end_to_end() {
    let port = free_udp_port();
    let make = |name: &str| {
        let mut config = NetworkConfig::loopback();
        config.listen_addr = "0.0.0.0:0".parse().unwrap();
        config.discovery_enabled = true;
        config.discovery_port = port;
        LanNode::new(NodeIdentity::generate(name), config)
    };
    let mut a = make("alice");
    let mut b = make("bob");
    let mut a_events = a.subscribe();

    a.start().await.unwrap();
    b.start().await.unwrap();
    b.discover().await.unwrap();

    let found = next_matching(&mut a_events, |e| match e {
        NodeEvent::PeerDiscovered(p) if &p.node_id == b.node_id() => Some(p),
        _ => None,
    })
    .await;
    assert_eq!(found.port, b.local_addr().unwrap().port());

    let connected = a.connect(&found).await.unwrap();
    assert_eq!(&connected.node_id, b.node_id());

    a.stop().await;
    b.stop().await;
}

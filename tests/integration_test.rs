//! Multi-node scenarios over real loopback sockets.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use serde_json::json;

use common::start_node;
use common::test_config;
use common::wait_for_connections;
use mesh_p2p::P2pEvent;
use mesh_p2p::PeerId;

#[tokio::test(flavor = "multi_thread")]
async fn seed_ring_discovers_the_full_mesh() {
    // Four nodes, each seeding only its successor in the ring. The direct
    // dials give every node two connections; the remaining diagonal link
    // can only come from the discovery populator.
    let ports = [46511u16, 46512, 46513, 46514];
    let count = ports.len();
    let mut nodes = Vec::new();
    for i in 0..count {
        let seed = ports[(i + 1) % count];
        nodes.push(start_node(test_config(ports[i], &[seed])).await);
    }

    for node in &nodes {
        wait_for_connections(node, count - 1, Duration::from_secs(15)).await;
    }

    for (i, node) in nodes.iter().enumerate() {
        let connected: HashSet<u16> = node
            .connected_peers()
            .await
            .unwrap()
            .into_iter()
            .map(|peer| peer.ws_port)
            .collect();
        let expected: HashSet<u16> = ports
            .iter()
            .copied()
            .filter(|port| *port != ports[i])
            .collect();
        assert_eq!(connected, expected, "node {} sees the wrong mesh", ports[i]);

        // A node never lists itself.
        assert!(!connected.contains(&ports[i]));
        let known: Vec<u16> = node
            .new_peers()
            .await
            .unwrap()
            .into_iter()
            .chain(node.tried_peers().await.unwrap())
            .map(|peer| peer.ws_port)
            .collect();
        assert!(!known.contains(&ports[i]));
    }

    for mut node in nodes {
        node.stop().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn penalties_accumulate_to_ban_and_expire() {
    // A ring of three so the banned peer can be rediscovered through the
    // third node once the ban expires.
    let ports = [46521u16, 46522, 46523];
    let mut configs: Vec<_> = (0..3)
        .map(|i| test_config(ports[i], &[ports[(i + 1) % 3]]))
        .collect();
    for config in &mut configs {
        config.peer_ban_time = Duration::from_millis(500);
    }

    let mut nodes = Vec::new();
    for config in configs {
        nodes.push(start_node(config).await);
    }
    for node in &nodes {
        wait_for_connections(node, 2, Duration::from_secs(10)).await;
    }

    let victim = PeerId::new("127.0.0.1", ports[1]);

    // A mild penalty does not cost the connection.
    nodes[0].apply_penalty(&victim, 10).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let still_connected: Vec<PeerId> = nodes[0]
        .connected_peers()
        .await
        .unwrap()
        .iter()
        .map(|peer| peer.peer_id())
        .collect();
    assert!(still_connected.contains(&victim));

    // Draining the remaining reputation bans the peer.
    nodes[0].apply_penalty(&victim, 100).await.unwrap();
    let gone = async {
        loop {
            let peers = nodes[0].connected_peers().await.unwrap();
            if !peers.iter().any(|peer| peer.peer_id() == victim) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), gone)
        .await
        .expect("banned peer was never removed");

    // After the ban expires, discovery brings the peer back.
    let back = async {
        loop {
            let peers = nodes[0].connected_peers().await.unwrap();
            if peers.iter().any(|peer| peer.peer_id() == victim) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), back)
        .await
        .expect("banned peer never came back after the ban expired");

    for mut node in nodes {
        node.stop().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_fan_out_with_sender_identity_and_rate() {
    let ports = [46531u16, 46532, 46533];
    let mut nodes = Vec::new();
    for i in 0..3 {
        nodes.push(start_node(test_config(ports[i], &[ports[(i + 1) % 3]])).await);
    }
    for node in &nodes {
        wait_for_connections(node, 2, Duration::from_secs(10)).await;
    }

    let mut observer_b = nodes[1].take_event_receiver().unwrap();
    let mut observer_c = nodes[2].take_event_receiver().unwrap();

    for i in 0..20 {
        nodes[0].send("bar", json!({ "n": i })).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let sender = PeerId::new("127.0.0.1", ports[0]);
    for observer in [&mut observer_b, &mut observer_c] {
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match observer.recv().await {
                    Some(P2pEvent::MessageReceived(message)) if message.event == "bar" => {
                        break message;
                    }
                    Some(_) => continue,
                    None => panic!("event stream ended early"),
                }
            }
        })
        .await
        .expect("no bar message was delivered");

        assert_eq!(received.peer_id, sender);
        assert!(received.data.get("n").is_some());
        assert!(received.rate.is_finite());
    }

    for mut node in nodes {
        node.stop().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn message_flooding_gets_the_sender_removed() {
    let ports = [46541u16, 46542];
    let mut flooder_config = test_config(ports[0], &[ports[1]]);
    // Keep the flooder itself tolerant so only the target reacts.
    flooder_config.ws_max_message_rate = 100_000.0;
    let mut target_config = test_config(ports[1], &[]);
    target_config.ws_max_message_rate = 50.0;
    target_config.peer_ban_time = Duration::from_secs(600);

    let flooder = start_node(flooder_config).await;
    let mut target = start_node(target_config).await;
    wait_for_connections(&flooder, 1, Duration::from_secs(10)).await;

    let mut target_events = target.take_event_receiver().unwrap();
    let flooder_id = PeerId::new("127.0.0.1", ports[0]);
    let target_id = PeerId::new("127.0.0.1", ports[1]);

    // Blast messages as fast as the channel accepts them.
    for i in 0..600 {
        if flooder
            .send_to_peer(&target_id, "flood", json!(i))
            .await
            .is_err()
        {
            break;
        }
    }

    let removed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match target_events.recv().await {
                Some(P2pEvent::RemovePeer { peer_id }) if peer_id == flooder_id => break,
                Some(_) => continue,
                None => panic!("event stream ended early"),
            }
        }
    })
    .await;
    assert!(removed.is_ok(), "the flooding peer was never removed");

    let mut flooder = flooder;
    flooder.stop().await.unwrap();
    target.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rediscovering_a_connected_peer_never_duplicates_the_connection() {
    let ports = [46551u16, 46552];
    let a = start_node(test_config(ports[0], &[ports[1]])).await;
    let b = start_node(test_config(ports[1], &[])).await;
    wait_for_connections(&a, 1, Duration::from_secs(10)).await;
    wait_for_connections(&b, 1, Duration::from_secs(10)).await;

    // Several populator cycles re-learn both peers through list exchanges;
    // a connected peer id must stay in exactly one map on each side.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let a_id = PeerId::new("127.0.0.1", ports[0]);
    let b_id = PeerId::new("127.0.0.1", ports[1]);

    let seen_by_b: Vec<PeerId> = b
        .connected_peers()
        .await
        .unwrap()
        .iter()
        .map(|peer| peer.peer_id())
        .collect();
    assert_eq!(seen_by_b, vec![a_id]);

    let seen_by_a: Vec<PeerId> = a
        .connected_peers()
        .await
        .unwrap()
        .iter()
        .map(|peer| peer.peer_id())
        .collect();
    assert_eq!(seen_by_a, vec![b_id]);

    let mut a = a;
    let mut b = b;
    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

use std::time::Duration;

use serde_json::Map;

use mesh_p2p::NodeInfo;
use mesh_p2p::P2p;
use mesh_p2p::P2pConfig;
use mesh_p2p::PeerInfo;
use mesh_p2p::PeerLists;

pub fn test_node_info(port: u16) -> NodeInfo {
    NodeInfo {
        network_id: "integration-test-net".to_string(),
        version: "1.0.0".to_string(),
        protocol_version: Some("1.1".to_string()),
        min_version: "1.0.0".to_string(),
        os: Some(std::env::consts::OS.to_string()),
        ws_port: port,
        height: 0,
        modules: vec![],
        nonce: rand::random(),
        options: Map::new(),
    }
}

pub fn peer_entry(port: u16) -> PeerInfo {
    PeerInfo {
        ip_address: "127.0.0.1".to_string(),
        ws_port: port,
        version: "1.0.0".to_string(),
        protocol_version: Some("1.1".to_string()),
        os: None,
        height: 0,
        options: Map::new(),
    }
}

/// A node configuration with timers tightened for test runs: discovery every
/// 150 ms, rates every 100 ms, no shuffle interference.
pub fn test_config(port: u16, seed_ports: &[u16]) -> P2pConfig {
    let mut config = P2pConfig::new(test_node_info(port));
    config.connect_timeout = Duration::from_secs(2);
    config.ack_timeout = Duration::from_secs(2);
    config.rate_calculation_interval = Duration::from_millis(100);
    config.populator_start_delay = Duration::from_millis(50);
    config.populator_interval = Duration::from_millis(150);
    config.outbound_shuffle_interval = Duration::from_secs(600);
    config.peer_lists = PeerLists {
        seed_peers: seed_ports.iter().map(|port| peer_entry(*port)).collect(),
        ..Default::default()
    };
    config
}

pub async fn start_node(config: P2pConfig) -> P2p {
    let mut p2p = P2p::new(config).expect("valid test configuration");
    p2p.start().await.expect("node must start");
    p2p
}

/// Poll a node until it reports at least `expected` connected peers.
pub async fn wait_for_connections(p2p: &P2p, expected: usize, deadline: Duration) {
    let poll = async {
        loop {
            let peers = p2p.connected_peers().await.expect("node is active");
            if peers.len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::time::timeout(deadline, poll)
        .await
        .unwrap_or_else(|_| panic!("node never reached {expected} connected peers"));
}

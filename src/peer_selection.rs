use rand::seq::IteratorRandom;
use rand::seq::SliceRandom;

use crate::models::node_info::NodeInfo;
use crate::models::peer::PeerId;
use crate::models::peer::PeerInfo;

/// Everything a selector sees when picking the single peer for a request.
pub struct RequestSelectionInput<'a> {
    pub peers: &'a [PeerInfo],
    pub node_info: &'a NodeInfo,
    pub procedure: &'a str,
}

/// Everything a selector sees when picking fan-out targets for a message.
pub struct SendSelectionInput<'a> {
    pub peers: &'a [PeerInfo],
    pub node_info: &'a NodeInfo,
    pub peer_limit: usize,
    pub event: &'a str,
}

/// Everything a selector sees when picking peers to dial.
pub struct ConnectionSelectionInput<'a> {
    pub disconnected_new_peers: &'a [PeerInfo],
    pub disconnected_tried_peers: &'a [PeerInfo],
    pub connected_new_peers: &'a [PeerInfo],
    pub connected_tried_peers: &'a [PeerInfo],
    pub outbound_count: usize,
    pub inbound_count: usize,
    pub max_outbound: usize,
    pub max_inbound: usize,
    pub node_info: &'a NodeInfo,
}

/// Pluggable peer-selection policy. The three decisions are independent and
/// a host can replace any of them by installing its own implementation in
/// the configuration.
pub trait PeerSelector: Send + Sync {
    /// Pick the peer a request goes to.
    fn select_for_request(&self, input: RequestSelectionInput<'_>) -> Option<PeerId>;

    /// Pick the peers a message is fanned out to.
    fn select_for_send(&self, input: SendSelectionInput<'_>) -> Vec<PeerId>;

    /// Pick the discovered peers to dial next.
    fn select_for_connection(&self, input: ConnectionSelectionInput<'_>) -> Vec<PeerInfo>;
}

/// The stock policy: requests go to a random peer that is at least as tall
/// as we are (any peer when none qualify), sends fan out to a shuffled
/// sample, and dialing mixes tried and new peers into the free outbound
/// slots.
pub struct DefaultPeerSelector;

impl PeerSelector for DefaultPeerSelector {
    fn select_for_request(&self, input: RequestSelectionInput<'_>) -> Option<PeerId> {
        let mut rng = rand::thread_rng();
        let tall_enough = input
            .peers
            .iter()
            .filter(|peer| peer.height >= input.node_info.height);
        match tall_enough.choose(&mut rng) {
            Some(peer) => Some(peer.peer_id()),
            None => input.peers.iter().choose(&mut rng).map(PeerInfo::peer_id),
        }
    }

    fn select_for_send(&self, input: SendSelectionInput<'_>) -> Vec<PeerId> {
        let mut rng = rand::thread_rng();
        let mut peers: Vec<&PeerInfo> = input.peers.iter().collect();
        peers.shuffle(&mut rng);
        peers
            .into_iter()
            .take(input.peer_limit)
            .map(PeerInfo::peer_id)
            .collect()
    }

    fn select_for_connection(&self, input: ConnectionSelectionInput<'_>) -> Vec<PeerInfo> {
        let shortage = input.max_outbound.saturating_sub(input.outbound_count);
        if shortage == 0 {
            return vec![];
        }

        // Tried peers answered us before; favor them but keep sampling the
        // new table so fresh addresses get exercised.
        let mut rng = rand::thread_rng();
        let mut tried: Vec<&PeerInfo> = input.disconnected_tried_peers.iter().collect();
        let mut fresh: Vec<&PeerInfo> = input.disconnected_new_peers.iter().collect();
        tried.shuffle(&mut rng);
        fresh.shuffle(&mut rng);

        let mut selected: Vec<PeerInfo> = Vec::with_capacity(shortage);
        let mut tried = tried.into_iter();
        let mut fresh = fresh.into_iter();
        while selected.len() < shortage {
            match (tried.next(), fresh.next()) {
                (Some(t), Some(f)) => {
                    selected.push(t.clone());
                    if selected.len() < shortage {
                        selected.push(f.clone());
                    }
                }
                (Some(t), None) => selected.push(t.clone()),
                (None, Some(f)) => selected.push(f.clone()),
                (None, None) => break,
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;

    fn peer(ip: &str, port: u16, height: u64) -> PeerInfo {
        PeerInfo {
            ip_address: ip.to_string(),
            ws_port: port,
            version: "1.0.0".to_string(),
            protocol_version: Some("1.0".to_string()),
            os: None,
            height,
            options: Map::new(),
        }
    }

    fn node_info(height: u64) -> NodeInfo {
        NodeInfo {
            network_id: "test-net".to_string(),
            version: "1.0.0".to_string(),
            protocol_version: Some("1.0".to_string()),
            min_version: "1.0.0".to_string(),
            os: None,
            ws_port: 7000,
            height,
            modules: vec![],
            nonce: 5,
            options: Map::new(),
        }
    }

    #[test]
    fn request_prefers_peers_at_or_above_own_height() {
        let peers = vec![
            peer("203.0.113.1", 5000, 10),
            peer("203.0.113.2", 5000, 100),
        ];
        let node_info = node_info(50);
        for _ in 0..20 {
            let selected = DefaultPeerSelector
                .select_for_request(RequestSelectionInput {
                    peers: &peers,
                    node_info: &node_info,
                    procedure: "status",
                })
                .unwrap();
            assert_eq!(selected, PeerId::new("203.0.113.2", 5000));
        }
    }

    #[test]
    fn request_falls_back_to_any_peer() {
        let peers = vec![peer("203.0.113.1", 5000, 10)];
        let selected = DefaultPeerSelector.select_for_request(RequestSelectionInput {
            peers: &peers,
            node_info: &node_info(50),
            procedure: "status",
        });
        assert!(selected.is_some());
    }

    #[test]
    fn request_on_empty_pool_selects_nothing() {
        let selected = DefaultPeerSelector.select_for_request(RequestSelectionInput {
            peers: &[],
            node_info: &node_info(0),
            procedure: "status",
        });
        assert!(selected.is_none());
    }

    #[test]
    fn send_respects_the_peer_limit() {
        let peers: Vec<PeerInfo> = (0..10)
            .map(|i| peer("203.0.113.1", 5000 + i, 0))
            .collect();
        let selected = DefaultPeerSelector.select_for_send(SendSelectionInput {
            peers: &peers,
            node_info: &node_info(0),
            peer_limit: 4,
            event: "bar",
        });
        assert_eq!(selected.len(), 4);
    }

    #[test]
    fn connection_fills_free_outbound_slots_only() {
        let tried: Vec<PeerInfo> = (0..5).map(|i| peer("203.0.113.1", 6000 + i, 0)).collect();
        let fresh: Vec<PeerInfo> = (0..5).map(|i| peer("198.51.100.1", 6000 + i, 0)).collect();
        let selected = DefaultPeerSelector.select_for_connection(ConnectionSelectionInput {
            disconnected_new_peers: &fresh,
            disconnected_tried_peers: &tried,
            connected_new_peers: &[],
            connected_tried_peers: &[],
            outbound_count: 17,
            inbound_count: 0,
            max_outbound: 20,
            max_inbound: 100,
            node_info: &node_info(0),
        });
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn connection_with_full_outbound_selects_nothing() {
        let fresh = vec![peer("198.51.100.1", 6000, 0)];
        let selected = DefaultPeerSelector.select_for_connection(ConnectionSelectionInput {
            disconnected_new_peers: &fresh,
            disconnected_tried_peers: &[],
            connected_new_peers: &[],
            connected_tried_peers: &[],
            outbound_count: 20,
            inbound_count: 0,
            max_outbound: 20,
            max_inbound: 100,
            node_info: &node_info(0),
        });
        assert!(selected.is_empty());
    }
}

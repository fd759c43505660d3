use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use tracing::debug;
use tracing::trace;

use crate::address::bucket_id;
use crate::address::normalize_address;
use crate::config_models::p2p_config::PeerLists;
use crate::models::peer::PeerId;
use crate::models::peer::PeerInfo;

/// Which of the two address tables a bucket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTableKind {
    New,
    Tried,
}

/// One hash-bucketed table of peer addresses. Within a bucket, entries are
/// kept in insertion order; the front is the least recently seen and the
/// first to go when the bucket overflows.
#[derive(Debug)]
struct PeerTable {
    bucket_count: u32,
    bucket_size: usize,
    buckets: HashMap<u32, VecDeque<PeerInfo>>,
}

impl PeerTable {
    fn new(bucket_count: u32, bucket_size: usize) -> Self {
        PeerTable {
            bucket_count,
            bucket_size,
            buckets: HashMap::new(),
        }
    }

    /// Insert a peer, returning the entry that was evicted to make room, if
    /// any. Unbucketable addresses are dropped.
    fn insert(&mut self, secret: u32, peer_info: PeerInfo) -> Option<PeerInfo> {
        let bucket = match bucket_id(secret, &peer_info.ip_address, self.bucket_count) {
            Ok(bucket) => bucket,
            Err(_) => {
                debug!(
                    "Dropping unbucketable peer address {}",
                    peer_info.ip_address
                );
                return None;
            }
        };
        let entries = self.buckets.entry(bucket).or_default();
        let evicted = if entries.len() >= self.bucket_size {
            entries.pop_front()
        } else {
            None
        };
        entries.push_back(peer_info);
        evicted
    }

    fn remove(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        for entries in self.buckets.values_mut() {
            if let Some(position) = entries.iter().position(|p| &p.peer_id() == peer_id) {
                return entries.remove(position);
            }
        }
        None
    }

    fn contains(&self, peer_id: &PeerId) -> bool {
        self.buckets
            .values()
            .any(|entries| entries.iter().any(|p| &p.peer_id() == peer_id))
    }

    fn all(&self) -> Vec<PeerInfo> {
        self.buckets
            .values()
            .flat_map(|entries| entries.iter().cloned())
            .collect()
    }

    fn bucket(&self, id: u32) -> Vec<PeerInfo> {
        self.buckets
            .get(&id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }
}

/// Discovered-address storage: a table of recently learned, unverified peers
/// and a table of peers we have successfully connected to at least once.
///
/// Bucket assignment is seeded with a node-private secret so an adversary
/// cannot precompute addresses that eclipse a victim's buckets.
#[derive(Debug)]
pub struct PeerBook {
    secret: u32,
    new_peers: PeerTable,
    tried_peers: PeerTable,
}

impl PeerBook {
    pub fn new(
        secret: u32,
        new_bucket_count: u32,
        new_bucket_size: usize,
        tried_bucket_count: u32,
        tried_bucket_size: usize,
    ) -> Self {
        PeerBook {
            secret,
            new_peers: PeerTable::new(new_bucket_count, new_bucket_size),
            tried_peers: PeerTable::new(tried_bucket_count, tried_bucket_size),
        }
    }

    /// Record a freshly discovered peer. Returns true if the peer was
    /// actually new to the book.
    pub fn add_new(&mut self, peer_info: PeerInfo) -> bool {
        let peer_id = peer_info.peer_id();
        if self.contains(&peer_id) {
            return false;
        }
        trace!("Adding {peer_id} to the new-peer table");
        self.new_peers.insert(self.secret, peer_info);
        true
    }

    /// Record a peer we have successfully connected to. Removes any entry
    /// for the same peer from the new table.
    pub fn add_tried(&mut self, peer_info: PeerInfo) -> bool {
        let peer_id = peer_info.peer_id();
        self.new_peers.remove(&peer_id);
        if self.tried_peers.contains(&peer_id) {
            return false;
        }
        trace!("Adding {peer_id} to the tried-peer table");
        self.tried_peers.insert(self.secret, peer_info);
        true
    }

    /// Move a peer from the new table to the tried table after a successful
    /// connection. Returns false if the peer was not in the new table.
    pub fn upgrade_new_to_tried(&mut self, peer_id: &PeerId) -> bool {
        match self.new_peers.remove(peer_id) {
            Some(peer_info) => {
                self.tried_peers.insert(self.secret, peer_info);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, peer_id: &PeerId) {
        self.new_peers.remove(peer_id);
        self.tried_peers.remove(peer_id);
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.new_peers.contains(peer_id) || self.tried_peers.contains(peer_id)
    }

    pub fn get_all_peers(&self) -> Vec<PeerInfo> {
        let mut peers = self.tried_peers.all();
        peers.extend(self.new_peers.all());
        peers
    }

    pub fn new_peers(&self) -> Vec<PeerInfo> {
        self.new_peers.all()
    }

    pub fn tried_peers(&self) -> Vec<PeerInfo> {
        self.tried_peers.all()
    }

    pub fn get_bucket(&self, kind: PeerTableKind, id: u32) -> Vec<PeerInfo> {
        match kind {
            PeerTableKind::New => self.new_peers.bucket(id),
            PeerTableKind::Tried => self.tried_peers.bucket(id),
        }
    }

    pub fn len(&self) -> usize {
        self.new_peers.len() + self.tried_peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The statically configured peer lists after blacklist filtering and
/// address normalization.
#[derive(Debug, Clone, Default)]
pub(crate) struct SanitizedPeerLists {
    pub seed_peers: Vec<PeerInfo>,
    pub fixed_peers: Vec<PeerInfo>,
    pub whitelisted: Vec<PeerInfo>,
    pub previous_peers: Vec<PeerInfo>,
    pub blacklisted_ips: HashSet<String>,
}

/// Normalize and filter the configured peer lists: blacklisted IPs are
/// removed everywhere, unparseable addresses are dropped, and whitelist
/// entries that already appear among the fixed or seed peers are removed
/// from the whitelist.
pub(crate) fn sanitize_peer_lists(lists: &PeerLists) -> SanitizedPeerLists {
    let blacklisted_ips: HashSet<String> = lists
        .blacklisted_ips
        .iter()
        .filter_map(|ip| normalize_address(ip).ok().map(|n| n.address))
        .collect();

    let sanitize = |peers: &[PeerInfo]| -> Vec<PeerInfo> {
        peers
            .iter()
            .filter_map(|peer| {
                let normalized = normalize_address(&peer.ip_address).ok()?;
                if blacklisted_ips.contains(&normalized.address) {
                    return None;
                }
                let mut peer = peer.clone();
                peer.ip_address = normalized.address;
                Some(peer)
            })
            .collect()
    };

    let seed_peers = sanitize(&lists.seed_peers);
    let fixed_peers = sanitize(&lists.fixed_peers);
    let previous_peers = sanitize(&lists.previous_peers);

    let reserved: HashSet<PeerId> = seed_peers
        .iter()
        .chain(fixed_peers.iter())
        .map(PeerInfo::peer_id)
        .collect();
    let whitelisted = sanitize(&lists.whitelisted)
        .into_iter()
        .filter(|peer| !reserved.contains(&peer.peer_id()))
        .collect();

    SanitizedPeerLists {
        seed_peers,
        fixed_peers,
        whitelisted,
        previous_peers,
        blacklisted_ips,
    }
}

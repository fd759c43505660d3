use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Instant;

use rand::seq::IteratorRandom;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio::time;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config_models::p2p_config::P2pConfig;
use crate::errors::P2pError;
use crate::models::channel::InboundGrant;
use crate::models::channel::MainCommand;
use crate::models::channel::P2pEvent;
use crate::models::channel::SessionCommand;
use crate::models::channel::SessionEvent;
use crate::models::node_info::NodeInfo;
use crate::models::peer::ConnectionRefusedReason;
use crate::models::peer::PeerId;
use crate::models::peer::PeerInfo;
use crate::models::peer::PeerKind;
use crate::models::peer::PeerMetrics;
use crate::models::peer::EVICTED_PEER_CODE;
use crate::peer_book::SanitizedPeerLists;
use crate::peer_selection::ConnectionSelectionInput;
use crate::peer_selection::RequestSelectionInput;
use crate::peer_selection::SendSelectionInput;
use crate::peer_session;
use crate::PEER_CHANNEL_CAPACITY;

/// The pool's view of one live session: its command channel plus the cached
/// facts eviction decisions are made from.
pub(crate) struct PeerHandle {
    pub peer_info: PeerInfo,
    pub kind: PeerKind,
    pub cmd_tx: mpsc::Sender<SessionCommand>,
    pub connect_time: Instant,
    pub metrics: PeerMetrics,
}

/// A snapshot row fed into the eviction policy.
#[derive(Debug, Clone)]
struct EvictionCandidate {
    peer_id: PeerId,
    latency_ms: u64,
    response_rate: f64,
    connect_time: Instant,
}

/// Process-lifetime container of all live peer connections.
///
/// Owned exclusively by the main-loop task; sessions talk back through the
/// shared session-event channel and are commanded through their handles.
pub(crate) struct PeerPool {
    config: P2pConfig,
    node_info: NodeInfo,
    inbound: HashMap<PeerId, PeerHandle>,
    outbound: HashMap<PeerId, PeerHandle>,
    banned: HashSet<PeerId>,
    blacklisted_ips: HashSet<String>,
    fixed_ids: HashSet<PeerId>,
    whitelisted_ids: HashSet<PeerId>,
    session_events: mpsc::Sender<SessionEvent>,
    main_tx: mpsc::Sender<MainCommand>,
    events: mpsc::Sender<P2pEvent>,
}

impl PeerPool {
    pub(crate) fn new(
        config: P2pConfig,
        lists: &SanitizedPeerLists,
        session_events: mpsc::Sender<SessionEvent>,
        main_tx: mpsc::Sender<MainCommand>,
        events: mpsc::Sender<P2pEvent>,
    ) -> Self {
        let node_info = config.node_info.clone();
        PeerPool {
            node_info,
            inbound: HashMap::new(),
            outbound: HashMap::new(),
            banned: HashSet::new(),
            blacklisted_ips: lists.blacklisted_ips.clone(),
            fixed_ids: lists.fixed_peers.iter().map(PeerInfo::peer_id).collect(),
            whitelisted_ids: lists.whitelisted.iter().map(PeerInfo::peer_id).collect(),
            session_events,
            main_tx,
            events,
            config,
        }
    }

    pub(crate) fn node_info(&self) -> &NodeInfo {
        &self.node_info
    }

    pub(crate) fn inbound_count(&self) -> usize {
        self.inbound.len()
    }

    pub(crate) fn outbound_count(&self) -> usize {
        self.outbound.len()
    }

    pub(crate) fn connected_peer_infos(&self) -> Vec<PeerInfo> {
        self.inbound
            .values()
            .chain(self.outbound.values())
            .map(|handle| handle.peer_info.clone())
            .collect()
    }

    pub(crate) fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.inbound.contains_key(peer_id) || self.outbound.contains_key(peer_id)
    }

    pub(crate) fn is_banned(&self, peer_id: &PeerId) -> bool {
        self.banned.contains(peer_id)
    }

    pub(crate) fn is_blacklisted(&self, ip_address: &str) -> bool {
        self.blacklisted_ips.contains(ip_address)
    }

    fn handle(&self, peer_id: &PeerId) -> Option<&PeerHandle> {
        self.inbound.get(peer_id).or_else(|| self.outbound.get(peer_id))
    }

    /// Open an outbound connection to the given peer. Idempotent: an
    /// existing connection to the same peer id wins.
    pub(crate) fn add_outbound_peer(&mut self, peer_info: PeerInfo) {
        let peer_id = peer_info.peer_id();
        if self.outbound.contains_key(&peer_id) || self.inbound.contains_key(&peer_id) {
            debug!("Not dialing {peer_id}: already connected");
            return;
        }
        if self.banned.contains(&peer_id) || self.blacklisted_ips.contains(&peer_info.ip_address) {
            debug!("Not dialing {peer_id}: banned or blacklisted");
            return;
        }
        if self.outbound.len() >= self.config.max_outbound_connections {
            debug!("Not dialing {peer_id}: outbound quota reached");
            return;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        self.outbound.insert(
            peer_id.clone(),
            PeerHandle {
                peer_info: peer_info.clone(),
                kind: PeerKind::Outbound,
                cmd_tx: cmd_tx.clone(),
                connect_time: Instant::now(),
                metrics: PeerMetrics::default(),
            },
        );
        info!("Dialing outbound peer {peer_id}");
        tokio::spawn(peer_session::run_outbound_session(
            peer_info,
            self.node_info.clone(),
            self.config.peer_config(),
            self.session_events.clone(),
            cmd_tx,
            cmd_rx,
        ));
    }

    /// Decide whether an already-handshaken inbound connection may join the
    /// pool, evicting an existing inbound peer if the quota demands it.
    pub(crate) fn admit_inbound(
        &mut self,
        peer_info: &PeerInfo,
    ) -> Result<InboundGrant, ConnectionRefusedReason> {
        let peer_id = peer_info.peer_id();
        if self.blacklisted_ips.contains(&peer_info.ip_address) || self.banned.contains(&peer_id) {
            return Err(ConnectionRefusedReason::BadStanding);
        }
        if self.is_connected(&peer_id) {
            return Err(ConnectionRefusedReason::AlreadyConnected);
        }

        let module_count = self.node_info.modules.len();
        let quota = self.config.max_inbound_connections * (module_count + 1);
        if self.inbound.len() >= quota && !self.evict_inbound_peer() {
            return Err(ConnectionRefusedReason::MaxPeerNumberExceeded);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        self.inbound.insert(
            peer_id.clone(),
            PeerHandle {
                peer_info: peer_info.clone(),
                kind: PeerKind::Inbound,
                cmd_tx: cmd_tx.clone(),
                connect_time: Instant::now(),
                metrics: PeerMetrics::default(),
            },
        );
        info!("Admitted inbound peer {peer_id}");
        Ok(InboundGrant {
            cmd_rx,
            cmd_tx,
            events: self.session_events.clone(),
            peer_config: self.config.peer_config(),
            node_info: self.node_info.clone(),
        })
    }

    /// Pick and disconnect one inbound peer to make room. Whitelisted peers
    /// are never candidates. Returns false if nobody could be evicted.
    fn evict_inbound_peer(&mut self) -> bool {
        let candidates: Vec<EvictionCandidate> = self
            .inbound
            .iter()
            .filter(|(peer_id, _)| !self.whitelisted_ids.contains(*peer_id))
            .map(|(peer_id, handle)| EvictionCandidate {
                peer_id: peer_id.clone(),
                latency_ms: handle.metrics.latency_ms,
                response_rate: handle.metrics.response_rate,
                connect_time: handle.connect_time,
            })
            .collect();

        let victim = select_eviction_candidate(
            candidates,
            self.config.latency_protection_ratio,
            self.config.productivity_protection_ratio,
            self.config.longevity_protection_ratio,
        );
        match victim {
            Some(peer_id) => {
                info!("Evicting inbound peer {peer_id} to free a connection slot");
                self.disconnect_and_remove(&peer_id, EVICTED_PEER_CODE);
                true
            }
            None => false,
        }
    }

    /// Evict one random non-fixed outbound peer. Bounds the lifetime of any
    /// single outbound relationship.
    pub(crate) fn shuffle_outbound(&mut self) {
        let mut rng = rand::thread_rng();
        let victim = self
            .outbound
            .keys()
            .filter(|peer_id| !self.fixed_ids.contains(*peer_id))
            .choose(&mut rng)
            .cloned();
        if let Some(peer_id) = victim {
            info!("Shuffling out outbound peer {peer_id}");
            self.disconnect_and_remove(&peer_id, EVICTED_PEER_CODE);
        }
    }

    /// Drop a peer from the pool right away and tell its session to close.
    /// The session's own `Closed` event then finds nothing left to remove.
    fn disconnect_and_remove(&mut self, peer_id: &PeerId, code: u16) {
        if let Some(handle) = self
            .inbound
            .remove(peer_id)
            .or_else(|| self.outbound.remove(peer_id))
        {
            let reason = crate::models::peer::sanitize_close_reason(code, "");
            let _ = handle.cmd_tx.try_send(SessionCommand::Disconnect {
                code,
                reason: reason.clone(),
            });
            match handle.kind {
                PeerKind::Inbound => self.emit(P2pEvent::CloseInbound {
                    peer_id: peer_id.clone(),
                    code,
                    reason,
                }),
                PeerKind::Outbound => self.emit(P2pEvent::CloseOutbound {
                    peer_id: peer_id.clone(),
                    code,
                    reason,
                }),
            }
            self.emit(P2pEvent::RemovePeer {
                peer_id: peer_id.clone(),
            });
        }
    }

    /// Ban a peer: drop the connection, remember the ban, and arm the
    /// one-shot unban timer.
    pub(crate) fn ban_peer(&mut self, peer_id: &PeerId) {
        if !self.banned.insert(peer_id.clone()) {
            return;
        }
        warn!("Peer {peer_id} is banned for {:?}", self.config.peer_ban_time);
        self.emit(P2pEvent::BanPeer {
            peer_id: peer_id.clone(),
        });
        // The session disconnects itself on ban; just drop our side.
        if self
            .inbound
            .remove(peer_id)
            .or_else(|| self.outbound.remove(peer_id))
            .is_some()
        {
            self.emit(P2pEvent::RemovePeer {
                peer_id: peer_id.clone(),
            });
        }

        let main_tx = self.main_tx.clone();
        let ban_time = self.config.peer_ban_time;
        let peer_id = peer_id.clone();
        tokio::spawn(async move {
            time::sleep(ban_time).await;
            let _ = main_tx.send(MainCommand::UnbanExpired { peer_id }).await;
        });
    }

    pub(crate) fn unban_peer(&mut self, peer_id: &PeerId) {
        if self.banned.remove(peer_id) {
            info!("Ban of peer {peer_id} expired");
            self.emit(P2pEvent::UnbanPeer {
                peer_id: peer_id.clone(),
            });
        }
    }

    /// A session finished its handshake; refresh the cached peer info.
    pub(crate) fn note_opened(&mut self, peer_id: &PeerId, kind: PeerKind, peer_info: &PeerInfo) {
        let handle = match kind {
            PeerKind::Inbound => self.inbound.get_mut(peer_id),
            PeerKind::Outbound => self.outbound.get_mut(peer_id),
        };
        if let Some(handle) = handle {
            handle.peer_info = peer_info.clone();
        }
    }

    pub(crate) fn note_metrics(&mut self, peer_id: &PeerId, metrics: PeerMetrics) {
        if let Some(handle) = self
            .inbound
            .get_mut(peer_id)
            .or_else(|| self.outbound.get_mut(peer_id))
        {
            handle.metrics = metrics;
        }
    }

    pub(crate) fn note_updated_peer_info(&mut self, peer_id: &PeerId, peer_info: &PeerInfo) {
        if let Some(handle) = self
            .inbound
            .get_mut(peer_id)
            .or_else(|| self.outbound.get_mut(peer_id))
        {
            handle.peer_info = peer_info.clone();
        }
    }

    /// A session reported itself closed. Removes it from its map and emits
    /// the close events; a session already evicted or banned is gone by now
    /// and produces nothing.
    pub(crate) fn remove_closed(&mut self, peer_id: &PeerId, kind: PeerKind, code: u16, reason: &str) {
        let removed = match kind {
            PeerKind::Inbound => self.inbound.remove(peer_id),
            PeerKind::Outbound => self.outbound.remove(peer_id),
        };
        if removed.is_none() {
            return;
        }
        match kind {
            PeerKind::Inbound => self.emit(P2pEvent::CloseInbound {
                peer_id: peer_id.clone(),
                code,
                reason: reason.to_string(),
            }),
            PeerKind::Outbound => self.emit(P2pEvent::CloseOutbound {
                peer_id: peer_id.clone(),
                code,
                reason: reason.to_string(),
            }),
        }
        self.emit(P2pEvent::RemovePeer {
            peer_id: peer_id.clone(),
        });
    }

    /// An outbound dial never became a session.
    pub(crate) fn remove_aborted(&mut self, peer_id: &PeerId) {
        self.outbound.remove(peer_id);
    }

    /// Fan a message out to the selector's choice of peers.
    pub(crate) fn send(&mut self, event: &str, data: &Value) -> Result<(), P2pError> {
        let peers = self.connected_peer_infos();
        let selected = self.config.peer_selector.select_for_send(SendSelectionInput {
            peers: &peers,
            node_info: &self.node_info,
            peer_limit: self.config.send_peer_limit,
            event,
        });
        if selected.is_empty() {
            return Err(P2pError::SendFail(
                "no peers available to send to".to_string(),
            ));
        }
        for peer_id in selected {
            self.dispatch_send(&peer_id, event, data);
        }
        Ok(())
    }

    pub(crate) fn send_to_peer(
        &mut self,
        peer_id: &PeerId,
        event: &str,
        data: &Value,
    ) -> Result<(), P2pError> {
        if self.handle(peer_id).is_none() {
            return Err(P2pError::SendFail(format!(
                "no connected peer with id {peer_id}"
            )));
        }
        self.dispatch_send(peer_id, event, data);
        Ok(())
    }

    fn dispatch_send(&self, peer_id: &PeerId, event: &str, data: &Value) {
        let Some(handle) = self.handle(peer_id) else {
            return;
        };
        let command = SessionCommand::Send {
            event: event.to_string(),
            data: data.clone(),
        };
        if handle.cmd_tx.try_send(command).is_err() {
            self.emit(P2pEvent::FailedToSendMessage {
                peer_id: peer_id.clone(),
                error: "session command queue is unavailable".to_string(),
            });
        }
    }

    /// Route a request to the selector's choice of peer; the session
    /// resolves the caller's oneshot when the response lands.
    pub(crate) fn request(
        &mut self,
        procedure: String,
        data: Value,
        reply: oneshot::Sender<Result<Value, P2pError>>,
    ) {
        let peers = self.connected_peer_infos();
        let selected = self
            .config
            .peer_selector
            .select_for_request(RequestSelectionInput {
                peers: &peers,
                node_info: &self.node_info,
                procedure: &procedure,
            });
        match selected {
            Some(peer_id) => self.request_from_peer(&peer_id, procedure, data, reply),
            None => {
                let _ = reply.send(Err(P2pError::RequestFail(
                    "no peers available to request from".to_string(),
                )));
            }
        }
    }

    pub(crate) fn request_from_peer(
        &mut self,
        peer_id: &PeerId,
        procedure: String,
        data: Value,
        reply: oneshot::Sender<Result<Value, P2pError>>,
    ) {
        let Some(handle) = self.handle(peer_id) else {
            let _ = reply.send(Err(P2pError::RequestFail(format!(
                "no connected peer with id {peer_id}"
            ))));
            return;
        };
        let command = SessionCommand::Request {
            procedure,
            data,
            response: reply,
        };
        match handle.cmd_tx.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) | Err(TrySendError::Closed(command)) => {
                if let SessionCommand::Request { response, .. } = command {
                    let _ = response.send(Err(P2pError::RequestFail(format!(
                        "peer {peer_id} is unavailable"
                    ))));
                }
            }
        }
    }

    pub(crate) fn apply_penalty(&self, peer_id: &PeerId, penalty: u32) -> Result<(), P2pError> {
        let Some(handle) = self.handle(peer_id) else {
            return Err(P2pError::RequestFail(format!(
                "no connected peer with id {peer_id}"
            )));
        };
        handle
            .cmd_tx
            .try_send(SessionCommand::ApplyPenalty(penalty))
            .map_err(|_| P2pError::RequestFail(format!("peer {peer_id} is unavailable")))
    }

    /// Cache new node info and propagate it to every live session.
    pub(crate) fn apply_node_info(&mut self, node_info: NodeInfo) {
        self.node_info = node_info.clone();
        for (peer_id, handle) in self.inbound.iter().chain(self.outbound.iter()) {
            if handle
                .cmd_tx
                .try_send(SessionCommand::ApplyNodeInfo(node_info.clone()))
                .is_err()
            {
                self.emit(P2pEvent::FailedToPushNodeInfo {
                    peer_id: peer_id.clone(),
                    error: "session command queue is unavailable".to_string(),
                });
            }
        }
    }

    /// Pick discovered peers to dial. Already-connected and fixed entries
    /// never reach the selector; disconnected fixed peers are always dialed.
    pub(crate) fn trigger_new_connections(
        &mut self,
        new_peers: &[PeerInfo],
        tried_peers: &[PeerInfo],
        fixed_peers: &[PeerInfo],
    ) {
        let dialable = |peer: &&PeerInfo| -> bool {
            let peer_id = peer.peer_id();
            !self.is_connected(&peer_id)
                && !self.fixed_ids.contains(&peer_id)
                && !self.banned.contains(&peer_id)
                && !self.blacklisted_ips.contains(&peer.ip_address)
        };
        let disconnected_new: Vec<PeerInfo> =
            new_peers.iter().filter(dialable).cloned().collect();
        let disconnected_tried: Vec<PeerInfo> =
            tried_peers.iter().filter(dialable).cloned().collect();
        let connected_new: Vec<PeerInfo> = new_peers
            .iter()
            .filter(|peer| self.is_connected(&peer.peer_id()))
            .cloned()
            .collect();
        let connected_tried: Vec<PeerInfo> = tried_peers
            .iter()
            .filter(|peer| self.is_connected(&peer.peer_id()))
            .cloned()
            .collect();

        let selected = self
            .config
            .peer_selector
            .select_for_connection(ConnectionSelectionInput {
                disconnected_new_peers: &disconnected_new,
                disconnected_tried_peers: &disconnected_tried,
                connected_new_peers: &connected_new,
                connected_tried_peers: &connected_tried,
                outbound_count: self.outbound.len(),
                inbound_count: self.inbound.len(),
                max_outbound: self.config.max_outbound_connections,
                max_inbound: self.config.max_inbound_connections,
                node_info: &self.node_info,
            });

        for peer_info in selected {
            self.add_outbound_peer(peer_info);
        }
        for peer_info in fixed_peers {
            if !self.is_connected(&peer_info.peer_id()) {
                self.add_outbound_peer(peer_info.clone());
            }
        }
    }

    /// Pick up to `sample_size` live peers to probe for their peer lists.
    pub(crate) fn sample_peers_for_discovery(&self, sample_size: usize) -> Vec<PeerId> {
        let mut rng = rand::thread_rng();
        self.inbound
            .keys()
            .chain(self.outbound.keys())
            .cloned()
            .choose_multiple(&mut rng, sample_size)
    }

    /// Disconnect everything, e.g. on shutdown.
    pub(crate) fn remove_all_peers(&mut self, code: u16, reason: &str) {
        let drained: Vec<(PeerId, PeerHandle)> = self
            .inbound
            .drain()
            .chain(self.outbound.drain())
            .collect();
        for (peer_id, handle) in drained {
            let _ = handle.cmd_tx.try_send(SessionCommand::Disconnect {
                code,
                reason: reason.to_string(),
            });
            self.emit(P2pEvent::RemovePeer { peer_id });
        }
    }

    fn emit(&self, event: P2pEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("Dropping p2p event, consumer is not keeping up: {e}");
        }
    }
}

/// Apply the three cascading protection filters and pick the eviction
/// victim uniformly at random from whoever is left.
///
/// Each filter sorts so the safest peers come first and shields the top
/// fraction given by its ratio; as soon as at most one candidate remains,
/// that candidate is it.
fn select_eviction_candidate(
    mut candidates: Vec<EvictionCandidate>,
    latency_ratio: f64,
    productivity_ratio: f64,
    longevity_ratio: f64,
) -> Option<PeerId> {
    if candidates.is_empty() {
        return None;
    }

    // Lowest latency is safest.
    candidates.sort_by_key(|candidate| candidate.latency_ms);
    candidates = drop_protected(candidates, latency_ratio);
    if candidates.len() <= 1 {
        return candidates.pop().map(|candidate| candidate.peer_id);
    }

    // Most productive responders are safest.
    candidates.sort_by(|a, b| {
        b.response_rate
            .partial_cmp(&a.response_rate)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates = drop_protected(candidates, productivity_ratio);
    if candidates.len() <= 1 {
        return candidates.pop().map(|candidate| candidate.peer_id);
    }

    // Longest-lived connections are safest.
    candidates.sort_by_key(|candidate| candidate.connect_time);
    candidates = drop_protected(candidates, longevity_ratio);

    let mut rng = rand::thread_rng();
    candidates
        .into_iter()
        .choose(&mut rng)
        .map(|candidate| candidate.peer_id)
}

/// Shield the first `ratio` fraction of an already-sorted candidate list
/// and return the rest.
fn drop_protected(
    mut candidates: Vec<EvictionCandidate>,
    ratio: f64,
) -> Vec<EvictionCandidate> {
    let protected = ((candidates.len() as f64 * ratio).ceil() as usize).min(candidates.len());
    candidates.split_off(protected)
}

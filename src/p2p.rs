use std::net::SocketAddr;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use futures::SinkExt;
use futures::TryStreamExt;
use serde_json::json;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::address::normalize_address;
use crate::config_models::p2p_config::P2pConfig;
use crate::config_models::peer_config::PeerConfig;
use crate::errors::P2pError;
use crate::models::channel::MainCommand;
use crate::models::channel::P2pEvent;
use crate::models::channel::P2pRequest;
use crate::models::channel::SessionEvent;
use crate::models::node_info::NodeInfo;
use crate::models::peer::ConnectionRefusedReason;
use crate::models::peer::PeerId;
use crate::models::peer::PeerInfo;
use crate::models::peer::PeerKind;
use crate::models::peer::TransferConnectionStatus;
use crate::models::peer::WireMessage;
use crate::models::peer::ABNORMAL_CLOSURE_CODE;
use crate::models::peer::INTENTIONAL_DISCONNECT_STATUS_CODE;
use crate::models::peer::PROCEDURE_PEER_LIST;
use crate::peer_book::sanitize_peer_lists;
use crate::peer_book::PeerBook;
use crate::peer_book::SanitizedPeerLists;
use crate::peer_pool::PeerPool;
use crate::peer_session;
use crate::transport;
use crate::transport::MAGIC_STRING_REQUEST;
use crate::transport::MAGIC_STRING_RESPONSE;
use crate::validation;
use crate::PEER_CHANNEL_CAPACITY;

/// How many live peers each populator cycle probes for their peer lists.
const MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE: usize = 3;

/// The facade of the library: owns the listener and the main-loop task and
/// exposes the mesh as request/send primitives plus a typed event stream.
///
/// All pool and book state lives on the main-loop task; this handle only
/// forwards commands to it.
pub struct P2p {
    config: P2pConfig,
    main_tx: Option<mpsc::Sender<MainCommand>>,
    event_rx: Option<mpsc::Receiver<P2pEvent>>,
    main_handle: Option<JoinHandle<()>>,
}

impl P2p {
    pub fn new(config: P2pConfig) -> Result<Self, P2pError> {
        config.validate()?;
        Ok(P2p {
            config,
            main_tx: None,
            event_rx: None,
            main_handle: None,
        })
    }

    pub fn is_active(&self) -> bool {
        self.main_tx.is_some()
    }

    /// Sanitize the configured peer lists, bind the listening socket and
    /// spawn the main loop with its discovery populator.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_active() {
            bail!(P2pError::AlreadyActive);
        }
        self.config.validate()?;

        let lists = sanitize_peer_lists(&self.config.peer_lists);
        let listen_address = (self.config.listen_ip, self.config.node_info.ws_port);
        let listener = TcpListener::bind(listen_address).await.with_context(|| {
            format!(
                "failed to bind listener on {}:{}",
                self.config.listen_ip, self.config.node_info.ws_port
            )
        })?;
        info!(
            "P2P node listening on {}:{}",
            self.config.listen_ip, self.config.node_info.ws_port
        );

        let (main_tx, cmd_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        let (session_tx, session_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);

        let own_ip = normalize_address(&self.config.listen_ip.to_string())
            .map_err(|e| anyhow!("listen address is unusable: {e}"))?;
        let own_peer_id = PeerId::new(&own_ip.address, self.config.node_info.ws_port);

        let pool = PeerPool::new(
            self.config.clone(),
            &lists,
            session_tx,
            main_tx.clone(),
            event_tx.clone(),
        );
        let book = PeerBook::new(
            self.config.secret,
            self.config.new_bucket_count,
            self.config.new_bucket_size,
            self.config.tried_bucket_count,
            self.config.tried_bucket_size,
        );

        let main_loop = MainLoop {
            config: self.config.clone(),
            pool,
            book,
            lists,
            listener,
            cmd_rx,
            main_tx: main_tx.clone(),
            session_rx,
            events: event_tx,
            own_peer_id,
        };
        self.main_handle = Some(tokio::spawn(main_loop.run()));
        self.main_tx = Some(main_tx);
        self.event_rx = Some(event_rx);
        Ok(())
    }

    /// Disconnect every peer with status 1000, cancel the timers and wind
    /// the main loop down.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(main_tx) = self.main_tx.take() else {
            bail!(P2pError::NotActive);
        };
        self.event_rx = None;
        let (reply_tx, reply_rx) = oneshot::channel();
        if main_tx.send(MainCommand::Stop { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
        if let Some(handle) = self.main_handle.take() {
            let _ = handle.await;
        }
        info!("P2P node stopped");
        Ok(())
    }

    /// The observable event stream. Single consumer; the first caller takes
    /// the receiver.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<P2pEvent>> {
        self.event_rx.take()
    }

    /// Fan a message out to the selector's choice of peers.
    pub async fn send(&self, event: &str, data: Value) -> Result<(), P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(MainCommand::Send {
            event: event.to_string(),
            data,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| P2pError::NotActive)?
    }

    pub async fn send_to_peer(
        &self,
        peer_id: &PeerId,
        event: &str,
        data: Value,
    ) -> Result<(), P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(MainCommand::SendToPeer {
            peer_id: peer_id.clone(),
            event: event.to_string(),
            data,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| P2pError::NotActive)?
    }

    /// Ask one selector-chosen peer to run a procedure and wait for its
    /// response.
    pub async fn request(&self, procedure: &str, data: Value) -> Result<Value, P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(MainCommand::Request {
            procedure: procedure.to_string(),
            data,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| P2pError::NotActive)?
    }

    pub async fn request_from_peer(
        &self,
        peer_id: &PeerId,
        procedure: &str,
        data: Value,
    ) -> Result<Value, P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(MainCommand::RequestFromPeer {
            peer_id: peer_id.clone(),
            procedure: procedure.to_string(),
            data,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| P2pError::NotActive)?
    }

    /// Cache new node info and push it to every live session.
    pub async fn apply_node_info(&self, node_info: NodeInfo) -> Result<(), P2pError> {
        self.command(MainCommand::ApplyNodeInfo(node_info)).await
    }

    /// Subtract from a peer's reputation; a depleted peer is banned.
    pub async fn apply_penalty(&self, peer_id: &PeerId, penalty: u32) -> Result<(), P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(MainCommand::ApplyPenalty {
            peer_id: peer_id.clone(),
            penalty,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| P2pError::NotActive)?
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerInfo>, P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(MainCommand::GetConnectedPeers { reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| P2pError::NotActive)
    }

    pub async fn new_peers(&self) -> Result<Vec<PeerInfo>, P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(MainCommand::GetNewPeers { reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| P2pError::NotActive)
    }

    pub async fn tried_peers(&self) -> Result<Vec<PeerInfo>, P2pError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(MainCommand::GetTriedPeers { reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| P2pError::NotActive)
    }

    async fn command(&self, command: MainCommand) -> Result<(), P2pError> {
        let main_tx = self.main_tx.as_ref().ok_or(P2pError::NotActive)?;
        main_tx.send(command).await.map_err(|_| P2pError::NotActive)
    }
}

/// The single task owning pool, book and listener. Everything mutates here;
/// sessions and the facade only talk to it over channels.
struct MainLoop {
    config: P2pConfig,
    pool: PeerPool,
    book: PeerBook,
    lists: SanitizedPeerLists,
    listener: TcpListener,
    cmd_rx: mpsc::Receiver<MainCommand>,
    main_tx: mpsc::Sender<MainCommand>,
    session_rx: mpsc::Receiver<SessionEvent>,
    events: mpsc::Sender<P2pEvent>,
    own_peer_id: PeerId,
}

impl MainLoop {
    async fn run(mut self) {
        self.seed_book();

        let populator_timer = time::sleep(self.config.populator_start_delay);
        tokio::pin!(populator_timer);
        let shuffle_timer = time::sleep(self.config.outbound_shuffle_interval);
        tokio::pin!(shuffle_timer);

        loop {
            select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => self.spawn_inbound_handshake(stream, remote),
                    Err(e) => warn!("Failed to accept an incoming connection: {e}"),
                },

                Some(event) = self.session_rx.recv() => self.on_session_event(event),

                command = self.cmd_rx.recv() => match command {
                    Some(MainCommand::Stop { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },

                _ = &mut populator_timer => {
                    self.run_populator_cycle();
                    populator_timer
                        .as_mut()
                        .reset(time::Instant::now() + self.config.populator_interval);
                },

                _ = &mut shuffle_timer => {
                    self.pool.shuffle_outbound();
                    shuffle_timer
                        .as_mut()
                        .reset(time::Instant::now() + self.config.outbound_shuffle_interval);
                },
            }
        }
    }

    /// Feed the sanitized lists into the new-peer table so the first
    /// populator cycle has somebody to dial.
    fn seed_book(&mut self) {
        let seeds = self
            .lists
            .seed_peers
            .iter()
            .chain(self.lists.previous_peers.iter())
            .chain(self.lists.whitelisted.iter())
            .chain(self.lists.fixed_peers.iter())
            .cloned()
            .collect::<Vec<_>>();
        for peer_info in seeds {
            if peer_info.peer_id() != self.own_peer_id {
                self.book.add_new(peer_info);
            }
        }
    }

    fn on_command(&mut self, command: MainCommand) {
        match command {
            MainCommand::Send { event, data, reply } => {
                let _ = reply.send(self.pool.send(&event, &data));
            }
            MainCommand::SendToPeer {
                peer_id,
                event,
                data,
                reply,
            } => {
                let _ = reply.send(self.pool.send_to_peer(&peer_id, &event, &data));
            }
            MainCommand::Request {
                procedure,
                data,
                reply,
            } => self.pool.request(procedure, data, reply),
            MainCommand::RequestFromPeer {
                peer_id,
                procedure,
                data,
                reply,
            } => self.pool.request_from_peer(&peer_id, procedure, data, reply),
            MainCommand::ApplyNodeInfo(node_info) => self.pool.apply_node_info(node_info),
            MainCommand::ApplyPenalty {
                peer_id,
                penalty,
                reply,
            } => {
                let _ = reply.send(self.pool.apply_penalty(&peer_id, penalty));
            }
            MainCommand::AdmitInbound { peer_info, reply } => {
                let _ = reply.send(self.pool.admit_inbound(&peer_info));
            }
            MainCommand::DiscoveredPeers { source, peers } => {
                self.merge_discovered_peers(&source, peers);
            }
            MainCommand::UnbanExpired { peer_id } => self.pool.unban_peer(&peer_id),
            MainCommand::GetConnectedPeers { reply } => {
                let _ = reply.send(self.pool.connected_peer_infos());
            }
            MainCommand::GetNewPeers { reply } => {
                let _ = reply.send(self.book.new_peers());
            }
            MainCommand::GetTriedPeers { reply } => {
                let _ = reply.send(self.book.tried_peers());
            }
            MainCommand::Stop { .. } => unreachable!("Stop is handled by the loop"),
        }
    }

    /// Apply a session event's side-effects and re-emit it upward under its
    /// stable name.
    fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened {
                peer_id,
                kind,
                peer_info,
            } => {
                self.pool.note_opened(&peer_id, kind, &peer_info);
                match kind {
                    PeerKind::Outbound => {
                        // A successful dial proves the address.
                        if !self.book.upgrade_new_to_tried(&peer_id) {
                            self.book.add_tried(peer_info.clone());
                        }
                        self.emit(P2pEvent::ConnectOutbound { peer_id, peer_info });
                    }
                    PeerKind::Inbound => {
                        if peer_id != self.own_peer_id {
                            self.book.add_new(peer_info);
                        }
                    }
                }
            }
            SessionEvent::ConnectAborted { peer_id, error } => {
                self.pool.remove_aborted(&peer_id);
                self.emit(P2pEvent::ConnectAbortOutbound { peer_id, error });
            }
            SessionEvent::RequestReceived(request) => {
                if request.procedure() == PROCEDURE_PEER_LIST {
                    self.answer_peer_list(request);
                } else {
                    self.emit(P2pEvent::RequestReceived(request));
                }
            }
            SessionEvent::MessageReceived(message) => {
                self.emit(P2pEvent::MessageReceived(message));
            }
            SessionEvent::UpdatedPeerInfo { peer_id, peer_info } => {
                self.pool.note_updated_peer_info(&peer_id, &peer_info);
                self.emit(P2pEvent::UpdatedPeerInfo { peer_info });
            }
            SessionEvent::FailedPeerInfoUpdate { peer_id, error } => {
                self.emit(P2pEvent::FailedPeerInfoUpdate { peer_id, error });
            }
            SessionEvent::InvalidRequestReceived { peer_id, error } => {
                self.emit(P2pEvent::InvalidRequestReceived { peer_id, error });
            }
            SessionEvent::InvalidMessageReceived { peer_id, error } => {
                self.emit(P2pEvent::InvalidMessageReceived { peer_id, error });
            }
            SessionEvent::FailedToFetchPeerInfo { peer_id, error } => {
                self.emit(P2pEvent::FailedToFetchPeerInfo { peer_id, error });
            }
            SessionEvent::FailedToFetchPeers { peer_id, error } => {
                self.emit(P2pEvent::FailedToFetchPeers { peer_id, error });
            }
            SessionEvent::FailedToCollectPeerDetails { peer_id, error } => {
                self.emit(P2pEvent::FailedToCollectPeerDetailsOnConnect { peer_id, error });
            }
            SessionEvent::FailedToPushNodeInfo { peer_id, error } => {
                self.emit(P2pEvent::FailedToPushNodeInfo { peer_id, error });
            }
            SessionEvent::FailedToSendMessage { peer_id, error } => {
                self.emit(P2pEvent::FailedToSendMessage { peer_id, error });
            }
            SessionEvent::DiscoveredPeers { peer_id, peers } => {
                self.merge_discovered_peers(&peer_id, peers);
            }
            SessionEvent::BanPeer { peer_id } => {
                self.book.remove(&peer_id);
                self.pool.ban_peer(&peer_id);
            }
            SessionEvent::MetricsTick { peer_id, metrics } => {
                self.pool.note_metrics(&peer_id, metrics);
            }
            SessionEvent::SocketError {
                peer_id,
                kind,
                error,
            } => match kind {
                PeerKind::Inbound => self.emit(P2pEvent::InboundSocketError { peer_id, error }),
                PeerKind::Outbound => self.emit(P2pEvent::OutboundSocketError { peer_id, error }),
            },
            SessionEvent::Closed {
                peer_id,
                kind,
                code,
                reason,
            } => self.pool.remove_closed(&peer_id, kind, code, &reason),
        }
    }

    /// Answer a `list` request with our known peers, then surface the
    /// (already answered) request upward like any other.
    fn answer_peer_list(&mut self, request: P2pRequest) {
        let mut seen = std::collections::HashSet::new();
        let requester = request.peer_id().clone();
        let mut peers: Vec<PeerInfo> = Vec::new();
        for peer_info in self
            .pool
            .connected_peer_infos()
            .into_iter()
            .chain(self.book.get_all_peers())
        {
            let peer_id = peer_info.peer_id();
            if peer_id == self.own_peer_id || peer_id == requester {
                continue;
            }
            if seen.insert(peer_id) {
                peers.push(peer_info);
            }
            if peers.len() >= self.config.max_peer_discovery_response_length {
                break;
            }
        }

        let body = json!({ "peers": peers });
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = request.end(body).await {
                debug!("Could not answer peer-list request: {e}");
            }
            if events.try_send(P2pEvent::RequestReceived(request)).is_err() {
                debug!("Dropping requestReceived event, consumer is not keeping up");
            }
        });
    }

    /// Merge validated discovered peers into the new-peer table, capped per
    /// cycle, then try to fill free outbound slots.
    fn merge_discovered_peers(&mut self, source: &PeerId, peers: Vec<PeerInfo>) {
        let mut accepted = 0;
        for peer_info in peers {
            if accepted >= self.config.minimum_peer_discovery_threshold {
                debug!("Discovery cycle cap reached, ignoring the rest of the list");
                break;
            }
            let peer_id = peer_info.peer_id();
            if peer_id == self.own_peer_id || &peer_id == source {
                continue;
            }
            if self.pool.is_banned(&peer_id) || self.pool.is_blacklisted(&peer_info.ip_address) {
                continue;
            }
            if self.book.add_new(peer_info.clone()) {
                accepted += 1;
                self.emit(P2pEvent::DiscoveredPeer { peer_info });
            }
        }
        self.trigger_connections();
    }

    fn trigger_connections(&mut self) {
        let new_peers = self.book.new_peers();
        let tried_peers = self.book.tried_peers();
        let fixed_peers = self.lists.fixed_peers.clone();
        self.pool
            .trigger_new_connections(&new_peers, &tried_peers, &fixed_peers);
    }

    /// One populator run: probe a few live peers for their lists and dial
    /// whatever discovery turned up.
    fn run_populator_cycle(&mut self) {
        debug!("Running the discovery populator");
        let targets = self
            .pool
            .sample_peers_for_discovery(MAX_PEER_DISCOVERY_PROBE_SAMPLE_SIZE);
        for peer_id in targets {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.pool.request_from_peer(
                &peer_id,
                PROCEDURE_PEER_LIST.to_string(),
                Value::Null,
                reply_tx,
            );

            let main_tx = self.main_tx.clone();
            let events = self.events.clone();
            let max_list_length = self.config.max_peer_discovery_response_length;
            let max_peer_bytes = self.config.max_peer_info_size;
            tokio::spawn(async move {
                let outcome = match reply_rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => return,
                };
                match outcome.and_then(|value| {
                    validation::validate_peer_list(&value, max_list_length, max_peer_bytes)
                }) {
                    Ok(peers) => {
                        let _ = main_tx
                            .send(MainCommand::DiscoveredPeers {
                                source: peer_id,
                                peers,
                            })
                            .await;
                    }
                    Err(e) => {
                        let _ = events.try_send(P2pEvent::FailedToFetchPeers {
                            peer_id,
                            error: e.to_string(),
                        });
                    }
                }
            });
        }
        self.trigger_connections();
    }

    fn spawn_inbound_handshake(&self, stream: TcpStream, remote: SocketAddr) {
        let main_tx = self.main_tx.clone();
        let events = self.events.clone();
        let node_info = self.pool.node_info().clone();
        let peer_config = self.config.peer_config();
        tokio::spawn(async move {
            if let Err(e) = answer_inbound(stream, remote, main_tx, node_info, peer_config).await {
                debug!("Inbound handshake with {remote} failed: {e:#}");
                let peer_id = match normalize_address(&remote.ip().to_string()) {
                    Ok(normalized) => PeerId::new(&normalized.address, remote.port()),
                    Err(_) => PeerId::new(&remote.ip().to_string(), remote.port()),
                };
                let _ = events.try_send(P2pEvent::InboundSocketError {
                    peer_id,
                    error: P2pError::PeerInboundHandshake(format!("{e:#}")).to_string(),
                });
            }
        });
    }

    fn shutdown(&mut self) {
        info!("Stopping the p2p node");
        self.pool.remove_all_peers(
            INTENTIONAL_DISCONNECT_STATUS_CODE,
            "Intentionally disconnected",
        );
    }

    fn emit(&self, event: P2pEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("Dropping p2p event, consumer is not keeping up: {e}");
        }
    }
}

/// Complete the server side of a handshake, ask the main loop for
/// admission, and run the session on success.
///
/// Mirrors the client side in `peer_session::establish_outbound`: handshake
/// frames both ways, then a connection status verdict.
async fn answer_inbound(
    stream: TcpStream,
    remote: SocketAddr,
    main_tx: mpsc::Sender<MainCommand>,
    node_info: NodeInfo,
    peer_config: PeerConfig,
) -> Result<()> {
    debug!("Established incoming TCP connection with {remote}");
    let mut framed = transport::wrap_stream(stream, peer_config.ws_max_payload_inbound);

    let first = time::timeout(peer_config.connect_timeout, framed.try_next())
        .await
        .map_err(|_| anyhow!("handshake with {remote} timed out"))?
        .map_err(|e| anyhow!("handshake with {remote} failed: {e}"))?;
    let remote_node_info = match first {
        Some(WireMessage::Handshake { magic, node_info }) => {
            if magic != MAGIC_STRING_REQUEST {
                bail!("unexpected magic value from {remote}");
            }
            validation::validate_node_info(&node_info, peer_config.max_peer_info_size)?
        }
        other => bail!(
            "expected a handshake from {remote}, got {:?}",
            other.map(|m| m.get_type())
        ),
    };

    // The remote learns who we are before any verdict.
    let own_bytes = serde_json::to_vec(&node_info)?;
    framed
        .send(WireMessage::Handshake {
            magic: MAGIC_STRING_RESPONSE.to_vec(),
            node_info: own_bytes,
        })
        .await
        .map_err(|e| anyhow!("handshake reply to {remote} failed: {e}"))?;

    let normalized = normalize_address(&remote.ip().to_string())
        .map_err(|e| anyhow!("unusable remote address: {e}"))?;
    let peer_info = remote_node_info.to_peer_info(&normalized.address);

    let refusal = if remote_node_info.network_id != node_info.network_id {
        Some(ConnectionRefusedReason::IncompatibleNetwork)
    } else if remote_node_info.nonce == node_info.nonce {
        Some(ConnectionRefusedReason::SelfConnect)
    } else if validation::check_compatibility(&peer_info, &node_info).is_err() {
        Some(ConnectionRefusedReason::IncompatibleProtocolVersion)
    } else {
        None
    };
    if let Some(reason) = refusal {
        let status = TransferConnectionStatus::Refused(reason);
        let _ = framed.send(WireMessage::ConnectionStatus(status)).await;
        bail!("refusing incoming connection from {remote}: {reason}");
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    main_tx
        .send(MainCommand::AdmitInbound {
            peer_info: peer_info.clone(),
            reply: reply_tx,
        })
        .await
        .map_err(|_| anyhow!("node is shutting down"))?;

    match reply_rx.await? {
        Ok(grant) => {
            let accepted = WireMessage::ConnectionStatus(TransferConnectionStatus::Accepted);
            if let Err(e) = framed.send(accepted).await {
                // The pool already granted a slot; hand the failure back so
                // it frees the slot again.
                let _ = grant
                    .events
                    .send(SessionEvent::Closed {
                        peer_id: peer_info.peer_id(),
                        kind: PeerKind::Inbound,
                        code: ABNORMAL_CLOSURE_CODE,
                        reason: "Connection lost during handshake".to_string(),
                    })
                    .await;
                bail!("could not accept connection from {remote}: {e}");
            }
            info!("Connection accepted from {remote}");
            peer_session::run_inbound_session(peer_info, grant, framed).await;
            Ok(())
        }
        Err(reason) => {
            let status = TransferConnectionStatus::Refused(reason);
            let _ = framed.send(WireMessage::ConnectionStatus(status)).await;
            bail!("refusing incoming connection from {remote}: {reason}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::time::Duration;

    use serde_json::Map;

    use super::*;

    fn node_info(port: u16) -> NodeInfo {
        NodeInfo {
            network_id: "test-net".to_string(),
            version: "1.0.0".to_string(),
            protocol_version: Some("1.0".to_string()),
            min_version: "1.0.0".to_string(),
            os: None,
            ws_port: port,
            height: 0,
            modules: vec![],
            nonce: rand::random(),
            options: Map::new(),
        }
    }

    fn config(port: u16) -> P2pConfig {
        let mut config = P2pConfig::new(node_info(port));
        config.populator_start_delay = Duration::from_millis(100);
        config.populator_interval = Duration::from_millis(200);
        config
    }

    #[tokio::test]
    async fn lifecycle_start_and_stop() {
        let mut p2p = P2p::new(config(47311)).unwrap();
        assert!(!p2p.is_active());

        p2p.start().await.unwrap();
        assert!(p2p.is_active());
        assert!(p2p.start().await.is_err());

        p2p.stop().await.unwrap();
        assert!(!p2p.is_active());
        assert!(p2p.stop().await.is_err());
    }

    #[tokio::test]
    async fn data_plane_calls_require_an_active_node() {
        let p2p = P2p::new(config(47312)).unwrap();
        assert!(matches!(
            p2p.send("bar", Value::Null).await,
            Err(P2pError::NotActive)
        ));
        assert!(matches!(
            p2p.request("status", Value::Null).await,
            Err(P2pError::NotActive)
        ));
        assert!(matches!(
            p2p.connected_peers().await,
            Err(P2pError::NotActive)
        ));
    }

    #[tokio::test]
    async fn send_with_no_connected_peers_is_a_send_fail() {
        let mut p2p = P2p::new(config(47313)).unwrap();
        p2p.start().await.unwrap();
        assert!(matches!(
            p2p.send("bar", Value::Null).await,
            Err(P2pError::SendFail(_))
        ));
        p2p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn two_nodes_connect_via_seed_list() {
        let port_a = 47314;
        let port_b = 47315;

        let mut a = P2p::new(config(port_a)).unwrap();
        a.start().await.unwrap();

        let mut b_config = config(port_b);
        b_config.peer_lists.seed_peers = vec![PeerInfo {
            ip_address: "127.0.0.1".to_string(),
            ws_port: port_a,
            version: "1.0.0".to_string(),
            protocol_version: Some("1.0".to_string()),
            os: None,
            height: 0,
            options: Map::new(),
        }];
        let mut b = P2p::new(b_config).unwrap();
        b.start().await.unwrap();
        let mut events = b.take_event_receiver().unwrap();

        let connected = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(P2pEvent::ConnectOutbound { peer_id, .. }) => break peer_id,
                    Some(_) => continue,
                    None => panic!("event stream ended"),
                }
            }
        })
        .await
        .expect("node B never connected to node A");
        assert_eq!(connected, PeerId::new("127.0.0.1", port_a));

        let peers = b.connected_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ws_port, port_a);

        // A successful dial upgrades the seed into the tried table.
        let tried = b.tried_peers().await.unwrap();
        assert_eq!(tried.len(), 1);

        b.stop().await.unwrap();
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn listen_ip_can_be_ipv6() {
        let mut cfg = config(47316);
        cfg.listen_ip = "::1".parse::<IpAddr>().unwrap();
        let mut p2p = P2p::new(cfg).unwrap();
        p2p.start().await.unwrap();
        p2p.stop().await.unwrap();
    }
}

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use super::node_info::NodeInfo;
use super::peer::ConnectionRefusedReason;
use super::peer::PeerId;
use super::peer::PeerInfo;
use super::peer::PeerKind;
use super::peer::PeerMetrics;
use super::peer::Productivity;
use crate::config_models::peer_config::PeerConfig;
use crate::errors::P2pError;

/// Commands a session accepts from the pool (and from responders handed to
/// higher layers).
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Send {
        event: String,
        data: Value,
    },
    Request {
        procedure: String,
        data: Value,
        response: oneshot::Sender<Result<Value, P2pError>>,
    },
    Respond {
        id: u64,
        result: Result<Value, String>,
    },
    ApplyNodeInfo(NodeInfo),
    ApplyPenalty(u32),
    Disconnect {
        code: u16,
        reason: String,
    },
}

/// Everything a session reports back to the pool. The pool re-emits most of
/// these upward after applying its own side-effects.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Opened {
        peer_id: PeerId,
        kind: PeerKind,
        peer_info: PeerInfo,
    },
    ConnectAborted {
        peer_id: PeerId,
        error: String,
    },
    RequestReceived(P2pRequest),
    MessageReceived(P2pMessage),
    UpdatedPeerInfo {
        peer_id: PeerId,
        peer_info: PeerInfo,
    },
    FailedPeerInfoUpdate {
        peer_id: PeerId,
        error: String,
    },
    InvalidRequestReceived {
        peer_id: PeerId,
        error: String,
    },
    InvalidMessageReceived {
        peer_id: PeerId,
        error: String,
    },
    FailedToFetchPeerInfo {
        peer_id: PeerId,
        error: String,
    },
    FailedToFetchPeers {
        peer_id: PeerId,
        error: String,
    },
    FailedToCollectPeerDetails {
        peer_id: PeerId,
        error: String,
    },
    FailedToPushNodeInfo {
        peer_id: PeerId,
        error: String,
    },
    FailedToSendMessage {
        peer_id: PeerId,
        error: String,
    },
    DiscoveredPeers {
        peer_id: PeerId,
        peers: Vec<PeerInfo>,
    },
    BanPeer {
        peer_id: PeerId,
    },
    MetricsTick {
        peer_id: PeerId,
        metrics: PeerMetrics,
    },
    SocketError {
        peer_id: PeerId,
        kind: PeerKind,
        error: String,
    },
    Closed {
        peer_id: PeerId,
        kind: PeerKind,
        code: u16,
        reason: String,
    },
}

/// Commands the facade (and helper tasks) send to the main loop.
#[derive(Debug)]
pub(crate) enum MainCommand {
    Send {
        event: String,
        data: Value,
        reply: oneshot::Sender<Result<(), P2pError>>,
    },
    SendToPeer {
        peer_id: PeerId,
        event: String,
        data: Value,
        reply: oneshot::Sender<Result<(), P2pError>>,
    },
    Request {
        procedure: String,
        data: Value,
        reply: oneshot::Sender<Result<Value, P2pError>>,
    },
    RequestFromPeer {
        peer_id: PeerId,
        procedure: String,
        data: Value,
        reply: oneshot::Sender<Result<Value, P2pError>>,
    },
    ApplyNodeInfo(NodeInfo),
    ApplyPenalty {
        peer_id: PeerId,
        penalty: u32,
        reply: oneshot::Sender<Result<(), P2pError>>,
    },
    AdmitInbound {
        peer_info: PeerInfo,
        reply: oneshot::Sender<Result<InboundGrant, ConnectionRefusedReason>>,
    },
    DiscoveredPeers {
        source: PeerId,
        peers: Vec<PeerInfo>,
    },
    UnbanExpired {
        peer_id: PeerId,
    },
    GetConnectedPeers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    GetNewPeers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    GetTriedPeers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Everything a granted inbound session needs to run: its command receiver,
/// the shared session-event sender and snapshots of node info and limits.
#[derive(Debug)]
pub(crate) struct InboundGrant {
    pub cmd_rx: mpsc::Receiver<SessionCommand>,
    pub cmd_tx: mpsc::Sender<SessionCommand>,
    pub events: mpsc::Sender<SessionEvent>,
    pub peer_config: PeerConfig,
    pub node_info: NodeInfo,
}

/// One-shot reply handle of an incoming RPC. The first `end`/`error` wins;
/// later attempts fail with `ResponseAlreadySent`.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHandle {
    id: u64,
    sent: Arc<AtomicBool>,
    commands: mpsc::Sender<SessionCommand>,
}

impl ResponseHandle {
    pub(crate) fn new(id: u64, commands: mpsc::Sender<SessionCommand>) -> Self {
        ResponseHandle {
            id,
            sent: Arc::new(AtomicBool::new(false)),
            commands,
        }
    }

    /// Atomically claim the right to answer. Returns false if somebody
    /// already did.
    pub(crate) fn claim(&self) -> bool {
        !self.sent.swap(true, Ordering::SeqCst)
    }

    fn was_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }

    async fn respond(&self, result: Result<Value, String>) -> Result<(), P2pError> {
        if !self.claim() {
            return Err(P2pError::ResponseAlreadySent);
        }
        self.commands
            .send(SessionCommand::Respond {
                id: self.id,
                result,
            })
            .await
            .map_err(|_| P2pError::SendFail("socket does not exist".to_string()))
    }
}

/// An incoming RPC request surfaced to the application, carrying the rate
/// and productivity snapshot of the peer that sent it plus a one-shot
/// responder.
#[derive(Debug)]
pub struct P2pRequest {
    pub(crate) procedure: String,
    pub(crate) data: Value,
    pub(crate) peer_id: PeerId,
    pub(crate) rate: f64,
    pub(crate) productivity: Productivity,
    pub(crate) responder: ResponseHandle,
}

impl P2pRequest {
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Requests-per-second of this procedure from this peer.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn productivity(&self) -> Productivity {
        self.productivity
    }

    /// True once anybody has answered this request.
    pub fn was_response_sent(&self) -> bool {
        self.responder.was_sent()
    }

    /// Answer the request. Fails with `ResponseAlreadySent` if it was
    /// already answered.
    pub async fn end(&self, data: Value) -> Result<(), P2pError> {
        self.responder.respond(Ok(data)).await
    }

    /// Answer the request with an error. Fails with `ResponseAlreadySent` if
    /// it was already answered.
    pub async fn error(&self, message: impl Into<String>) -> Result<(), P2pError> {
        self.responder.respond(Err(message.into())).await
    }
}

/// An incoming fire-and-forget message surfaced to the application.
#[derive(Debug, Clone)]
pub struct P2pMessage {
    pub event: String,
    pub data: Value,
    pub peer_id: PeerId,
    /// Messages-per-second of this event from this peer.
    pub rate: f64,
}

/// The facade's observable event stream.
#[derive(Debug)]
pub enum P2pEvent {
    RequestReceived(P2pRequest),
    MessageReceived(P2pMessage),
    DiscoveredPeer { peer_info: PeerInfo },
    ConnectOutbound { peer_id: PeerId, peer_info: PeerInfo },
    ConnectAbortOutbound { peer_id: PeerId, error: String },
    CloseOutbound { peer_id: PeerId, code: u16, reason: String },
    CloseInbound { peer_id: PeerId, code: u16, reason: String },
    OutboundSocketError { peer_id: PeerId, error: String },
    InboundSocketError { peer_id: PeerId, error: String },
    UpdatedPeerInfo { peer_info: PeerInfo },
    FailedPeerInfoUpdate { peer_id: PeerId, error: String },
    FailedToFetchPeerInfo { peer_id: PeerId, error: String },
    FailedToFetchPeers { peer_id: PeerId, error: String },
    FailedToPushNodeInfo { peer_id: PeerId, error: String },
    FailedToCollectPeerDetailsOnConnect { peer_id: PeerId, error: String },
    FailedToSendMessage { peer_id: PeerId, error: String },
    BanPeer { peer_id: PeerId },
    UnbanPeer { peer_id: PeerId },
    RemovePeer { peer_id: PeerId },
    InvalidRequestReceived { peer_id: PeerId, error: String },
    InvalidMessageReceived { peer_id: PeerId, error: String },
}

impl P2pEvent {
    /// Stable wire-level name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            P2pEvent::RequestReceived(_) => "requestReceived",
            P2pEvent::MessageReceived(_) => "messageReceived",
            P2pEvent::DiscoveredPeer { .. } => "discoveredPeer",
            P2pEvent::ConnectOutbound { .. } => "connectOutbound",
            P2pEvent::ConnectAbortOutbound { .. } => "connectAbortOutbound",
            P2pEvent::CloseOutbound { .. } => "closeOutbound",
            P2pEvent::CloseInbound { .. } => "closeInbound",
            P2pEvent::OutboundSocketError { .. } => "outboundSocketError",
            P2pEvent::InboundSocketError { .. } => "inboundSocketError",
            P2pEvent::UpdatedPeerInfo { .. } => "updatedPeerInfo",
            P2pEvent::FailedPeerInfoUpdate { .. } => "failedPeerInfoUpdate",
            P2pEvent::FailedToFetchPeerInfo { .. } => "failedToFetchPeerInfo",
            P2pEvent::FailedToFetchPeers { .. } => "failedToFetchPeers",
            P2pEvent::FailedToPushNodeInfo { .. } => "failedToPushNodeInfo",
            P2pEvent::FailedToCollectPeerDetailsOnConnect { .. } => {
                "failedToCollectPeerDetailsOnConnect"
            }
            P2pEvent::FailedToSendMessage { .. } => "failedToSendMessage",
            P2pEvent::BanPeer { .. } => "banPeer",
            P2pEvent::UnbanPeer { .. } => "unbanPeer",
            P2pEvent::RemovePeer { .. } => "removePeer",
            P2pEvent::InvalidRequestReceived { .. } => "invalidRequestReceived",
            P2pEvent::InvalidMessageReceived { .. } => "invalidMessageReceived",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_response_is_rejected() {
        let (tx, mut rx) = mpsc::channel(4);
        let request = P2pRequest {
            procedure: "custom".to_string(),
            data: Value::Null,
            peer_id: PeerId::new("127.0.0.1", 5000),
            rate: 0.0,
            productivity: Productivity::new(),
            responder: ResponseHandle::new(7, tx),
        };

        assert!(!request.was_response_sent());
        request.end(Value::from(1)).await.unwrap();
        assert!(request.was_response_sent());

        let second = request.end(Value::from(2)).await;
        assert!(matches!(second, Err(P2pError::ResponseAlreadySent)));
        let third = request.error("too late").await;
        assert!(matches!(third, Err(P2pError::ResponseAlreadySent)));

        // Exactly one response made it onto the command channel.
        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            SessionCommand::Respond { id: 7, result: Ok(_) }
        ));
        assert!(rx.try_recv().is_err());
    }
}

use std::fmt::Display;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::address::format_peer_id;

/// Procedure names handled by every node.
pub const PROCEDURE_STATUS: &str = "status";
pub const PROCEDURE_PEER_LIST: &str = "list";
pub const PROCEDURE_UPDATE_MYSELF: &str = "updateMyself";

/// Message event pushed to passive peers when the local node info changes.
pub const EVENT_NODE_INFO_CHANGED: &str = "nodeInfoChanged";

/// Reserved disconnect status codes.
pub const INTENTIONAL_DISCONNECT_STATUS_CODE: u16 = 1000;
pub const FAILED_TO_RESPOND_CODE: u16 = 4002;
pub const INCOMPATIBLE_PROTOCOL_VERSION_CODE: u16 = 4100;
pub const INCOMPATIBLE_NETWORK_CODE: u16 = 4102;
pub const FORBIDDEN_CONNECTION_CODE: u16 = 4403;
pub const EVICTED_PEER_CODE: u16 = 4418;

/// Status used when a socket dies without a proper `Bye` exchange.
pub(crate) const ABNORMAL_CLOSURE_CODE: u16 = 1006;

/// Initial reputation of every session. Penalties subtract from it; at zero
/// the peer is banned.
pub const INITIAL_REPUTATION: i32 = 100;

/// Canonical `ip:port` identity of a peer. IPv6 addresses are carried
/// uncompressed in brackets, e.g. `[0:0:0:0:0:0:0:1]:5000`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(ip_address: &str, port: u16) -> Self {
        PeerId(format_peer_id(ip_address, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether we dialed the peer or accepted its connection.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PeerKind {
    Inbound,
    Outbound,
}

impl Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerKind::Inbound => write!(f, "inbound"),
            PeerKind::Outbound => write!(f, "outbound"),
        }
    }
}

/// Connection lifecycle of a session. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// A discovered peer's address and advertised node facts.
///
/// Any advertised fields beyond the known schema are carried verbatim in
/// `options`. The wire representation is JSON with the address under the
/// field name `ip`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    #[serde(rename = "ip")]
    pub ip_address: String,
    pub ws_port: u16,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default)]
    pub height: u64,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl PeerInfo {
    pub fn peer_id(&self) -> PeerId {
        PeerId::new(&self.ip_address, self.ws_port)
    }

    /// Absorb a peer-info update while preserving the connection identity:
    /// the original address and port survive whatever the peer advertises.
    pub(crate) fn update_from(&mut self, incoming: PeerInfo) {
        let ip_address = std::mem::take(&mut self.ip_address);
        let ws_port = self.ws_port;
        *self = incoming;
        self.ip_address = ip_address;
        self.ws_port = ws_port;
    }
}

/// Counters measuring how productively a peer answers our requests.
#[derive(Clone, Copy, Debug)]
pub struct Productivity {
    pub request_counter: u64,
    pub response_counter: u64,
    pub response_rate: f64,
    pub(crate) last_responded: Option<Instant>,
}

impl Productivity {
    pub(crate) fn new() -> Self {
        Productivity {
            request_counter: 0,
            response_counter: 0,
            response_rate: 0.0,
            last_responded: Some(Instant::now()),
        }
    }

    pub(crate) fn note_request(&mut self) {
        self.request_counter += 1;
        self.update_rate();
    }

    pub(crate) fn note_response(&mut self) {
        self.response_counter += 1;
        self.last_responded = Some(Instant::now());
        self.update_rate();
    }

    fn update_rate(&mut self) {
        self.response_rate = self.response_counter as f64 / self.request_counter.max(1) as f64;
    }

    /// True when the peer has not answered anything for the given interval.
    pub(crate) fn is_stale(&self, interval: std::time::Duration) -> bool {
        match self.last_responded {
            Some(at) => at.elapsed() > interval,
            None => true,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.request_counter = 0;
        self.response_counter = 0;
        self.response_rate = 0.0;
        self.last_responded = Some(Instant::now());
    }
}

/// Live metrics of a session, reported to the pool on every rate tick and
/// used for eviction decisions.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerMetrics {
    pub latency_ms: u64,
    pub response_rate: f64,
    pub ws_message_rate: f64,
}

/// Why an incoming connection was turned away.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionRefusedReason {
    AlreadyConnected,
    BadStanding,
    IncompatibleNetwork,
    IncompatibleProtocolVersion,
    MaxPeerNumberExceeded,
    SelfConnect,
}

impl ConnectionRefusedReason {
    /// Status code reported alongside the refusal.
    pub fn status_code(self) -> u16 {
        match self {
            ConnectionRefusedReason::AlreadyConnected => INTENTIONAL_DISCONNECT_STATUS_CODE,
            ConnectionRefusedReason::BadStanding => FORBIDDEN_CONNECTION_CODE,
            ConnectionRefusedReason::IncompatibleNetwork => INCOMPATIBLE_NETWORK_CODE,
            ConnectionRefusedReason::IncompatibleProtocolVersion => {
                INCOMPATIBLE_PROTOCOL_VERSION_CODE
            }
            ConnectionRefusedReason::MaxPeerNumberExceeded => EVICTED_PEER_CODE,
            ConnectionRefusedReason::SelfConnect => INTENTIONAL_DISCONNECT_STATUS_CODE,
        }
    }
}

impl Display for ConnectionRefusedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            ConnectionRefusedReason::AlreadyConnected => "already connected",
            ConnectionRefusedReason::BadStanding => "bad standing",
            ConnectionRefusedReason::IncompatibleNetwork => "incompatible network",
            ConnectionRefusedReason::IncompatibleProtocolVersion => {
                "incompatible protocol version"
            }
            ConnectionRefusedReason::MaxPeerNumberExceeded => "max peer number exceeded",
            ConnectionRefusedReason::SelfConnect => "self connect",
        };
        write!(f, "{reason}")
    }
}

/// Handshake verdict sent to the remote before the session starts.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferConnectionStatus {
    Accepted,
    Refused(ConnectionRefusedReason),
}

/// The frame envelope exchanged on a peer socket. Payloads ride as raw JSON
/// bytes so arbitrary advertised fields survive the trip and size limits stay
/// enforceable at the edge.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) enum WireMessage {
    Handshake { magic: Vec<u8>, node_info: Vec<u8> },
    ConnectionStatus(TransferConnectionStatus),
    RpcRequest { id: u64, procedure: String, data: Vec<u8> },
    RpcResponse { id: u64, result: Result<Vec<u8>, String> },
    Message { event: String, data: Vec<u8> },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Bye { code: u16, reason: String },
}

impl WireMessage {
    pub fn get_type(&self) -> &'static str {
        match self {
            WireMessage::Handshake { .. } => "handshake",
            WireMessage::ConnectionStatus(_) => "connection status",
            WireMessage::RpcRequest { .. } => "rpc request",
            WireMessage::RpcResponse { .. } => "rpc response",
            WireMessage::Message { .. } => "message",
            WireMessage::Ping { .. } => "ping",
            WireMessage::Pong { .. } => "pong",
            WireMessage::Bye { .. } => "bye",
        }
    }
}

/// Replace a transport-supplied close reason with a trusted description for
/// the codes we know; unknown codes keep a length-capped copy of the remote
/// string.
pub(crate) fn sanitize_close_reason(code: u16, reason: &str) -> String {
    match code {
        INTENTIONAL_DISCONNECT_STATUS_CODE => "Intentionally disconnected".to_string(),
        FAILED_TO_RESPOND_CODE => "Failed to respond to an RPC request".to_string(),
        INCOMPATIBLE_PROTOCOL_VERSION_CODE => "Incompatible protocol version".to_string(),
        INCOMPATIBLE_NETWORK_CODE => "Incompatible network".to_string(),
        FORBIDDEN_CONNECTION_CODE => "Forbidden connection".to_string(),
        EVICTED_PEER_CODE => "Evicted to free a connection slot".to_string(),
        _ if reason.is_empty() => format!("Connection closed with status {code}"),
        _ => reason.chars().take(256).collect(),
    }
}

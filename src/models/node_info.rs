use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use super::peer::PeerInfo;

/// The local node's advertised state. Sent during the handshake, returned by
/// the `status` procedure and pushed on every `updateMyself`/
/// `nodeInfoChanged` propagation.
///
/// `nonce` is a per-process random identity used to detect connections to
/// ourselves. `min_version` is the oldest software version we still talk to
/// when a peer advertises no protocol version.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub network_id: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    pub min_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    pub ws_port: u16,
    #[serde(default)]
    pub height: u64,
    #[serde(default)]
    pub modules: Vec<String>,
    pub nonce: u64,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl NodeInfo {
    /// Derive the peer-facing view of a remote node from its advertised info
    /// and the address its connection came from.
    pub fn to_peer_info(&self, ip_address: &str) -> PeerInfo {
        PeerInfo {
            ip_address: ip_address.to_string(),
            ws_port: self.ws_port,
            version: self.version.clone(),
            protocol_version: self.protocol_version.clone(),
            os: self.os.clone(),
            height: self.height,
            options: self.options.clone(),
        }
    }
}

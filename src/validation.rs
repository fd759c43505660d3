use semver::Version;
use serde_json::Map;
use serde_json::Value;

use crate::address::normalize_address;
use crate::errors::P2pError;
use crate::models::node_info::NodeInfo;
use crate::models::peer::PeerInfo;

const KNOWN_PEER_INFO_FIELDS: [&str; 6] =
    ["ip", "wsPort", "version", "protocolVersion", "os", "height"];

/// A validated `{procedure, data}` RPC envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequestEnvelope {
    pub procedure: String,
    pub data: Value,
}

/// A validated `{event, data}` protocol-message envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub event: String,
    pub data: Value,
}

/// Validate a raw advertised peer record and translate it into a sanitized
/// [`PeerInfo`].
///
/// The wire field `ip` becomes the internal normalized address; `height` is
/// coerced to a non-negative integer (default 0); any unknown fields are
/// preserved verbatim. Records larger than `max_byte_size` are rejected
/// outright.
pub fn validate_peer_info(raw: &Value, max_byte_size: usize) -> Result<PeerInfo, P2pError> {
    let serialized_size = serde_json::to_vec(raw)
        .map_err(|e| P2pError::InvalidPeer(format!("unserializable peer info: {e}")))?
        .len();
    if serialized_size > max_byte_size {
        return Err(P2pError::InvalidPeer(format!(
            "peer info of {serialized_size} bytes exceeds the limit of {max_byte_size}"
        )));
    }

    let object = raw
        .as_object()
        .ok_or_else(|| P2pError::InvalidPeer("peer info must be an object".to_string()))?;

    let ip = object
        .get("ip")
        .and_then(Value::as_str)
        .ok_or_else(|| P2pError::InvalidPeer("missing or non-string ip".to_string()))?;
    let normalized = normalize_address(ip)
        .map_err(|_| P2pError::InvalidPeer(format!("invalid ip address: {ip}")))?;

    let ws_port = object
        .get("wsPort")
        .and_then(Value::as_u64)
        .filter(|port| (1..=u64::from(u16::MAX)).contains(port))
        .ok_or_else(|| P2pError::InvalidPeer("missing or out-of-range wsPort".to_string()))?
        as u16;

    let version = object
        .get("version")
        .and_then(Value::as_str)
        .ok_or_else(|| P2pError::InvalidPeer("missing or non-string version".to_string()))?;
    Version::parse(version)
        .map_err(|_| P2pError::InvalidPeer(format!("version is not valid semver: {version}")))?;

    let protocol_version = object
        .get("protocolVersion")
        .and_then(Value::as_str)
        .map(str::to_string);
    let os = object.get("os").and_then(Value::as_str).map(str::to_string);
    let height = object.get("height").and_then(Value::as_u64).unwrap_or(0);

    let options: Map<String, Value> = object
        .iter()
        .filter(|(key, _)| !KNOWN_PEER_INFO_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(PeerInfo {
        ip_address: normalized.address,
        ws_port,
        version: version.to_string(),
        protocol_version,
        os,
        height,
        options,
    })
}

/// Validate a raw node-info record received during a handshake or from the
/// `status` procedure.
pub fn validate_node_info(bytes: &[u8], max_byte_size: usize) -> Result<NodeInfo, P2pError> {
    if bytes.len() > max_byte_size {
        return Err(P2pError::InvalidPeer(format!(
            "node info of {} bytes exceeds the limit of {max_byte_size}",
            bytes.len()
        )));
    }
    let node_info: NodeInfo = serde_json::from_slice(bytes)
        .map_err(|e| P2pError::InvalidPeer(format!("malformed node info: {e}")))?;
    if node_info.ws_port == 0 {
        return Err(P2pError::InvalidPeer("wsPort must be non-zero".to_string()));
    }
    Version::parse(&node_info.version).map_err(|_| {
        P2pError::InvalidPeer(format!(
            "version is not valid semver: {}",
            node_info.version
        ))
    })?;
    Ok(node_info)
}

/// Validate a `list` response: must carry a `peers` array no longer than
/// `max_list_length`. Entries larger than `max_per_peer_bytes` are silently
/// dropped; the rest are schema-validated.
pub fn validate_peer_list(
    raw: &Value,
    max_list_length: usize,
    max_per_peer_bytes: usize,
) -> Result<Vec<PeerInfo>, P2pError> {
    let peers = raw
        .get("peers")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            P2pError::InvalidRpcResponse("peer list response lacks a peers array".to_string())
        })?;
    if peers.len() > max_list_length {
        return Err(P2pError::InvalidRpcResponse(format!(
            "peer list of length {} exceeds the limit of {max_list_length}",
            peers.len()
        )));
    }

    let mut validated = Vec::with_capacity(peers.len());
    for raw_peer in peers {
        let size = serde_json::to_vec(raw_peer)
            .map_err(|e| P2pError::InvalidPeer(format!("unserializable peer entry: {e}")))?
            .len();
        if size > max_per_peer_bytes {
            continue;
        }
        validated.push(validate_peer_info(raw_peer, max_per_peer_bytes)?);
    }
    Ok(validated)
}

/// Validate a raw `{procedure, data}` RPC request envelope.
pub fn validate_rpc_request(raw: &Value) -> Result<RpcRequestEnvelope, P2pError> {
    let procedure = raw
        .get("procedure")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            P2pError::InvalidRpcRequest("procedure must be a string".to_string())
        })?;
    Ok(RpcRequestEnvelope {
        procedure: procedure.to_string(),
        data: raw.get("data").cloned().unwrap_or(Value::Null),
    })
}

/// Validate a raw `{event, data}` protocol-message envelope.
pub fn validate_message(raw: &Value) -> Result<MessageEnvelope, P2pError> {
    let event = raw.get("event").and_then(Value::as_str).ok_or_else(|| {
        P2pError::InvalidProtocolMessage("event must be a string".to_string())
    })?;
    Ok(MessageEnvelope {
        event: event.to_string(),
        data: raw.get("data").cloned().unwrap_or(Value::Null),
    })
}

/// Decide whether a peer speaks a protocol we can work with.
///
/// Peers that advertise no protocol version fall back to a plain semver
/// comparison against our minimum version. Otherwise only the major
/// component matters and must match ours exactly, with major ≥ 1.
pub fn check_compatibility(peer: &PeerInfo, node: &NodeInfo) -> Result<(), P2pError> {
    let Some(peer_protocol) = peer.protocol_version.as_deref() else {
        let peer_version = Version::parse(&peer.version).map_err(|_| {
            P2pError::InvalidPeer(format!("unparseable peer version: {}", peer.version))
        })?;
        let min_version = Version::parse(&node.min_version).map_err(|_| {
            P2pError::InvalidConfig(format!("unparseable min version: {}", node.min_version))
        })?;
        if peer_version < min_version {
            return Err(P2pError::InvalidPeer(format!(
                "peer version {peer_version} is below the minimum {min_version}"
            )));
        }
        return Ok(());
    };

    let peer_major = protocol_major(peer_protocol).ok_or_else(|| {
        P2pError::InvalidPeer(format!("unparseable protocol version: {peer_protocol}"))
    })?;
    let own_protocol = node.protocol_version.as_deref().unwrap_or("1.0");
    let own_major = protocol_major(own_protocol).ok_or_else(|| {
        P2pError::InvalidConfig(format!("unparseable own protocol version: {own_protocol}"))
    })?;

    if peer_major < 1 || peer_major != own_major {
        return Err(P2pError::InvalidPeer(format!(
            "protocol major {peer_major} is incompatible with ours ({own_major})"
        )));
    }
    Ok(())
}

fn protocol_major(protocol_version: &str) -> Option<u64> {
    protocol_version.split('.').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn node_info() -> NodeInfo {
        NodeInfo {
            network_id: "test-net".to_string(),
            version: "1.2.0".to_string(),
            protocol_version: Some("1.1".to_string()),
            min_version: "1.0.0".to_string(),
            os: None,
            ws_port: 7000,
            height: 0,
            modules: vec![],
            nonce: 99,
            options: Map::new(),
        }
    }

    fn raw_peer() -> Value {
        json!({
            "ip": "203.0.113.7",
            "wsPort": 5001,
            "version": "1.1.0",
            "protocolVersion": "1.1",
            "height": 44,
            "nethash": "abc123"
        })
    }

    #[test]
    fn valid_peer_info_is_sanitized() {
        let info = validate_peer_info(&raw_peer(), 20_480).unwrap();
        assert_eq!(info.ip_address, "203.0.113.7");
        assert_eq!(info.ws_port, 5001);
        assert_eq!(info.height, 44);
        assert_eq!(info.options.get("nethash").unwrap(), "abc123");
        assert!(!info.options.contains_key("ip"));
    }

    #[test]
    fn oversized_peer_info_is_rejected() {
        let result = validate_peer_info(&raw_peer(), 16);
        assert!(matches!(result, Err(P2pError::InvalidPeer(_))));
    }

    #[test]
    fn bad_ip_port_or_version_is_rejected() {
        let mut bad_ip = raw_peer();
        bad_ip["ip"] = json!("not-an-ip");
        assert!(validate_peer_info(&bad_ip, 20_480).is_err());

        let mut bad_port = raw_peer();
        bad_port["wsPort"] = json!(0);
        assert!(validate_peer_info(&bad_port, 20_480).is_err());

        let mut bad_version = raw_peer();
        bad_version["version"] = json!("one.two");
        assert!(validate_peer_info(&bad_version, 20_480).is_err());
    }

    #[test]
    fn missing_height_defaults_to_zero() {
        let mut raw = raw_peer();
        raw.as_object_mut().unwrap().remove("height");
        let info = validate_peer_info(&raw, 20_480).unwrap();
        assert_eq!(info.height, 0);

        let mut negative = raw_peer();
        negative["height"] = json!(-3);
        let info = validate_peer_info(&negative, 20_480).unwrap();
        assert_eq!(info.height, 0);
    }

    #[test]
    fn ipv6_peer_is_normalized() {
        let mut raw = raw_peer();
        raw["ip"] = json!("2001:0db8::1");
        let info = validate_peer_info(&raw, 20_480).unwrap();
        assert_eq!(info.ip_address, "2001:db8:0:0:0:0:0:1");
    }

    #[test]
    fn peer_list_requires_a_peers_array() {
        let result = validate_peer_list(&json!({"nodes": []}), 10, 1024);
        assert!(matches!(result, Err(P2pError::InvalidRpcResponse(_))));
    }

    #[test]
    fn peer_list_length_limit_is_enforced() {
        let raw = json!({ "peers": [raw_peer(), raw_peer(), raw_peer()] });
        assert!(validate_peer_list(&raw, 2, 20_480).is_err());
        assert_eq!(validate_peer_list(&raw, 3, 20_480).unwrap().len(), 3);
    }

    #[test]
    fn oversized_list_entries_are_dropped_silently() {
        let mut fat_peer = raw_peer();
        fat_peer["padding"] = json!("x".repeat(4096));
        let raw = json!({ "peers": [raw_peer(), fat_peer] });
        let peers = validate_peer_list(&raw, 10, 512).unwrap();
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn rpc_request_requires_string_procedure() {
        assert!(validate_rpc_request(&json!({"procedure": 42})).is_err());
        let envelope =
            validate_rpc_request(&json!({"procedure": "status", "data": {"x": 1}})).unwrap();
        assert_eq!(envelope.procedure, "status");
        assert_eq!(envelope.data, json!({"x": 1}));
    }

    #[test]
    fn message_requires_string_event() {
        assert!(validate_message(&json!({"event": null})).is_err());
        let envelope = validate_message(&json!({"event": "bar"})).unwrap();
        assert_eq!(envelope.event, "bar");
        assert_eq!(envelope.data, Value::Null);
    }

    #[test]
    fn compatibility_by_protocol_major() {
        let mut peer = validate_peer_info(&raw_peer(), 20_480).unwrap();
        assert!(check_compatibility(&peer, &node_info()).is_ok());

        peer.protocol_version = Some("2.0".to_string());
        assert!(check_compatibility(&peer, &node_info()).is_err());

        peer.protocol_version = Some("0.9".to_string());
        assert!(check_compatibility(&peer, &node_info()).is_err());
    }

    #[test]
    fn compatibility_falls_back_to_min_version() {
        let mut peer = validate_peer_info(&raw_peer(), 20_480).unwrap();
        peer.protocol_version = None;

        peer.version = "1.0.0".to_string();
        assert!(check_compatibility(&peer, &node_info()).is_ok());

        peer.version = "0.9.9".to_string();
        assert!(check_compatibility(&peer, &node_info()).is_err());
    }
}

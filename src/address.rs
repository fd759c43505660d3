use std::net::IpAddr;
use std::net::Ipv6Addr;

use sha2::Digest;
use sha2::Sha256;

use crate::errors::P2pError;

/// Network class of a peer address, used for bucket assignment and for
/// grouping peers that sit behind the same locality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerNetwork {
    Local,
    Private,
    Ipv4,
    Ipv6,
    Other,
}

impl PeerNetwork {
    /// Single-byte code mixed into the bucket hash. `Other` has no code since
    /// unsupported addresses cannot be bucketed.
    fn code(self) -> Option<u8> {
        match self {
            PeerNetwork::Local => Some(0),
            PeerNetwork::Private => Some(1),
            PeerNetwork::Ipv4 => Some(2),
            PeerNetwork::Ipv6 => Some(3),
            PeerNetwork::Other => None,
        }
    }
}

/// Address family of a normalized address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// A textual peer address in canonical form: IPv4 dotted quad, or IPv6 as
/// eight lowercase hex groups without leading zeros and without `::`
/// compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAddress {
    pub family: AddressFamily,
    pub address: String,
}

/// Bring a textual IP address into canonical form.
///
/// IPv4 addresses are returned as-is. IPv4-mapped IPv6 addresses
/// (`::ffff:a.b.c.d`) unwrap to their dotted quad. All other IPv6 addresses
/// are expanded to eight explicit groups.
pub fn normalize_address(raw: &str) -> Result<NormalizedAddress, P2pError> {
    match raw.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => Ok(NormalizedAddress {
            family: AddressFamily::Ipv4,
            address: raw.to_string(),
        }),
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => Ok(NormalizedAddress {
                family: AddressFamily::Ipv4,
                address: v4.to_string(),
            }),
            None => Ok(NormalizedAddress {
                family: AddressFamily::Ipv6,
                address: expand_ipv6(v6),
            }),
        },
        Err(_) => Err(P2pError::UnsupportedAddress(raw.to_string())),
    }
}

fn expand_ipv6(ip: Ipv6Addr) -> String {
    let groups: Vec<String> = ip.segments().iter().map(|g| format!("{g:x}")).collect();
    groups.join(":")
}

/// Classify an address into its network class. Anything that does not parse
/// as an IP address is `Other`.
pub fn classify_network(raw: &str) -> PeerNetwork {
    let ip = match raw.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => return PeerNetwork::Other,
    };

    // IPv4-mapped addresses classify as their embedded IPv4 address.
    let ip = match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    };

    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            if octets[0] == 0 || octets[0] == 127 {
                PeerNetwork::Local
            } else if octets[0] == 10 || (octets[0] == 172 && (16..=31).contains(&octets[1])) {
                PeerNetwork::Private
            } else {
                PeerNetwork::Ipv4
            }
        }
        IpAddr::V6(v6) => {
            if v6 == Ipv6Addr::LOCALHOST {
                PeerNetwork::Local
            } else if matches!(v6.segments()[0] >> 8, 0xfc | 0xfd) {
                PeerNetwork::Private
            } else {
                PeerNetwork::Ipv6
            }
        }
    }
}

/// Deterministic bucket assignment for a peer address.
///
/// Hashes `secret (4 bytes BE) || network code (1 byte) || address bytes` with
/// SHA-256 and reduces the first four digest bytes modulo `bucket_count`. The
/// per-node `secret` keeps an adversary from precomputing addresses that
/// collide into a victim's bucket. Local and private addresses contribute no
/// address bytes, so they all collapse into a single bucket per secret.
pub fn bucket_id(secret: u32, target_address: &str, bucket_count: u32) -> Result<u32, P2pError> {
    let normalized = normalize_address(target_address)?;
    let network = classify_network(&normalized.address);
    let code = network
        .code()
        .ok_or_else(|| P2pError::UnsupportedAddress(target_address.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(secret.to_be_bytes());
    hasher.update([code]);

    match network {
        PeerNetwork::Ipv4 => {
            let v4: std::net::Ipv4Addr = normalized
                .address
                .parse()
                .map_err(|_| P2pError::UnsupportedAddress(target_address.to_string()))?;
            hasher.update(v4.octets());
        }
        PeerNetwork::Ipv6 => {
            let v6: Ipv6Addr = normalized
                .address
                .parse()
                .map_err(|_| P2pError::UnsupportedAddress(target_address.to_string()))?;
            hasher.update(v6.octets());
        }
        // Local and private peers share one bucket per secret.
        PeerNetwork::Local | PeerNetwork::Private => {}
        PeerNetwork::Other => unreachable!("no bucket code for unsupported networks"),
    }

    let digest = hasher.finalize();
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    Ok(prefix % bucket_count)
}

/// Wire- and log-visible peer identifier: `ip:port` for IPv4,
/// `[ip]:port` for IPv6 with the address uncompressed.
pub fn format_peer_id(ip_address: &str, port: u16) -> String {
    if ip_address.contains(':') {
        format!("[{ip_address}]:{port}")
    } else {
        format!("{ip_address}:{port}")
    }
}

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::P2pError;
use crate::models::node_info::NodeInfo;
use crate::models::peer::PeerInfo;
use crate::peer_selection::DefaultPeerSelector;
use crate::peer_selection::PeerSelector;

use super::peer_config::PeerConfig;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_RATE_CALCULATION_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_WS_MAX_MESSAGE_RATE: f64 = 100.0;
/// One over-limit tick drains the whole reputation: a flooding burst can
/// collapse into a single rate-calculation window, so a smaller penalty
/// would let it go unpunished.
pub const DEFAULT_WS_MAX_MESSAGE_RATE_PENALTY: u32 = 100;
pub const DEFAULT_WS_MAX_PAYLOAD_INBOUND: usize = 3_048_576;
pub const DEFAULT_WS_MAX_PAYLOAD_OUTBOUND: usize = 3_048_576;
pub const DEFAULT_MAX_PEER_INFO_SIZE: usize = 20_480;
pub const DEFAULT_MAX_PEER_DISCOVERY_RESPONSE_LENGTH: usize = 1000;
pub const DEFAULT_MINIMUM_PEER_DISCOVERY_THRESHOLD: usize = 100;
pub const DEFAULT_MAX_OUTBOUND_CONNECTIONS: usize = 20;
pub const DEFAULT_MAX_INBOUND_CONNECTIONS: usize = 100;
pub const DEFAULT_SEND_PEER_LIMIT: usize = 16;
pub const DEFAULT_OUTBOUND_SHUFFLE_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_PEER_BAN_TIME: Duration = Duration::from_secs(86_400);
pub const DEFAULT_POPULATOR_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_POPULATOR_START_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_PRODUCTIVITY_RESET_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_PING_INTERVAL_MIN: Duration = Duration::from_secs(20);
pub const DEFAULT_PING_INTERVAL_MAX: Duration = Duration::from_secs(60);
pub const DEFAULT_LATENCY_PROTECTION_RATIO: f64 = 0.068;
pub const DEFAULT_PRODUCTIVITY_PROTECTION_RATIO: f64 = 0.068;
pub const DEFAULT_LONGEVITY_PROTECTION_RATIO: f64 = 0.5;
pub const DEFAULT_NEW_BUCKET_COUNT: u32 = 128;
pub const DEFAULT_NEW_BUCKET_SIZE: usize = 32;
pub const DEFAULT_TRIED_BUCKET_COUNT: u32 = 64;
pub const DEFAULT_TRIED_BUCKET_SIZE: usize = 32;

/// Statically configured peer lists, all filtered against `blacklisted_ips`
/// before use.
#[derive(Clone, Debug, Default)]
pub struct PeerLists {
    pub seed_peers: Vec<PeerInfo>,
    pub fixed_peers: Vec<PeerInfo>,
    pub whitelisted: Vec<PeerInfo>,
    pub previous_peers: Vec<PeerInfo>,
    pub blacklisted_ips: Vec<String>,
}

/// Full configuration surface of a [`P2p`](crate::P2p) instance.
///
/// Construct with [`P2pConfig::new`] and adjust through the `with_*`
/// builders; every knob has a production default.
#[derive(Clone)]
pub struct P2pConfig {
    pub node_info: NodeInfo,
    pub listen_ip: IpAddr,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub rate_calculation_interval: Duration,
    pub ws_max_message_rate: f64,
    pub ws_max_message_rate_penalty: u32,
    pub ws_max_payload_inbound: usize,
    pub ws_max_payload_outbound: usize,
    pub max_peer_info_size: usize,
    pub max_peer_discovery_response_length: usize,
    pub minimum_peer_discovery_threshold: usize,
    pub max_outbound_connections: usize,
    pub max_inbound_connections: usize,
    pub send_peer_limit: usize,
    pub outbound_shuffle_interval: Duration,
    pub peer_ban_time: Duration,
    pub populator_interval: Duration,
    pub populator_start_delay: Duration,
    pub productivity_reset_interval: Duration,
    pub ping_interval_min: Duration,
    pub ping_interval_max: Duration,
    pub latency_protection_ratio: f64,
    pub productivity_protection_ratio: f64,
    pub longevity_protection_ratio: f64,
    /// Per-node secret seeding the peer-book bucket hash.
    pub secret: u32,
    pub peer_lists: PeerLists,
    pub new_bucket_count: u32,
    pub new_bucket_size: usize,
    pub tried_bucket_count: u32,
    pub tried_bucket_size: usize,
    pub peer_selector: Arc<dyn PeerSelector>,
}

impl P2pConfig {
    pub fn new(node_info: NodeInfo) -> Self {
        P2pConfig {
            node_info,
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            rate_calculation_interval: DEFAULT_RATE_CALCULATION_INTERVAL,
            ws_max_message_rate: DEFAULT_WS_MAX_MESSAGE_RATE,
            ws_max_message_rate_penalty: DEFAULT_WS_MAX_MESSAGE_RATE_PENALTY,
            ws_max_payload_inbound: DEFAULT_WS_MAX_PAYLOAD_INBOUND,
            ws_max_payload_outbound: DEFAULT_WS_MAX_PAYLOAD_OUTBOUND,
            max_peer_info_size: DEFAULT_MAX_PEER_INFO_SIZE,
            max_peer_discovery_response_length: DEFAULT_MAX_PEER_DISCOVERY_RESPONSE_LENGTH,
            minimum_peer_discovery_threshold: DEFAULT_MINIMUM_PEER_DISCOVERY_THRESHOLD,
            max_outbound_connections: DEFAULT_MAX_OUTBOUND_CONNECTIONS,
            max_inbound_connections: DEFAULT_MAX_INBOUND_CONNECTIONS,
            send_peer_limit: DEFAULT_SEND_PEER_LIMIT,
            outbound_shuffle_interval: DEFAULT_OUTBOUND_SHUFFLE_INTERVAL,
            peer_ban_time: DEFAULT_PEER_BAN_TIME,
            populator_interval: DEFAULT_POPULATOR_INTERVAL,
            populator_start_delay: DEFAULT_POPULATOR_START_DELAY,
            productivity_reset_interval: DEFAULT_PRODUCTIVITY_RESET_INTERVAL,
            ping_interval_min: DEFAULT_PING_INTERVAL_MIN,
            ping_interval_max: DEFAULT_PING_INTERVAL_MAX,
            latency_protection_ratio: DEFAULT_LATENCY_PROTECTION_RATIO,
            productivity_protection_ratio: DEFAULT_PRODUCTIVITY_PROTECTION_RATIO,
            longevity_protection_ratio: DEFAULT_LONGEVITY_PROTECTION_RATIO,
            secret: rand::random(),
            peer_lists: PeerLists::default(),
            new_bucket_count: DEFAULT_NEW_BUCKET_COUNT,
            new_bucket_size: DEFAULT_NEW_BUCKET_SIZE,
            tried_bucket_count: DEFAULT_TRIED_BUCKET_COUNT,
            tried_bucket_size: DEFAULT_TRIED_BUCKET_SIZE,
            peer_selector: Arc::new(DefaultPeerSelector),
        }
    }

    pub fn with_listen_ip(mut self, listen_ip: IpAddr) -> Self {
        self.listen_ip = listen_ip;
        self
    }

    pub fn with_peer_lists(mut self, peer_lists: PeerLists) -> Self {
        self.peer_lists = peer_lists;
        self
    }

    pub fn with_secret(mut self, secret: u32) -> Self {
        self.secret = secret;
        self
    }

    pub fn with_connection_limits(mut self, max_outbound: usize, max_inbound: usize) -> Self {
        self.max_outbound_connections = max_outbound;
        self.max_inbound_connections = max_inbound;
        self
    }

    pub fn with_peer_selector(mut self, selector: Arc<dyn PeerSelector>) -> Self {
        self.peer_selector = selector;
        self
    }

    /// The limit snapshot handed to each session at construction time.
    pub(crate) fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            connect_timeout: self.connect_timeout,
            ack_timeout: self.ack_timeout,
            rate_calculation_interval: self.rate_calculation_interval,
            ws_max_message_rate: self.ws_max_message_rate,
            ws_max_message_rate_penalty: self.ws_max_message_rate_penalty,
            ws_max_payload_inbound: self.ws_max_payload_inbound,
            ws_max_payload_outbound: self.ws_max_payload_outbound,
            max_peer_info_size: self.max_peer_info_size,
            max_peer_list_length: self.max_peer_discovery_response_length,
            productivity_reset_interval: self.productivity_reset_interval,
            ping_interval_min: self.ping_interval_min,
            ping_interval_max: self.ping_interval_max,
        }
    }

    /// Reject configurations the pool cannot run with.
    pub(crate) fn validate(&self) -> Result<(), P2pError> {
        if self.node_info.ws_port == 0 {
            return Err(P2pError::InvalidConfig("ws port must be non-zero".into()));
        }
        for (name, ratio) in [
            ("latency_protection_ratio", self.latency_protection_ratio),
            (
                "productivity_protection_ratio",
                self.productivity_protection_ratio,
            ),
            ("longevity_protection_ratio", self.longevity_protection_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(P2pError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {ratio}"
                )));
            }
        }
        if self.ping_interval_min > self.ping_interval_max {
            return Err(P2pError::InvalidConfig(
                "ping_interval_min exceeds ping_interval_max".into(),
            ));
        }
        if self.rate_calculation_interval.is_zero() {
            return Err(P2pError::InvalidConfig(
                "rate_calculation_interval must be non-zero".into(),
            ));
        }
        if self.new_bucket_count == 0 || self.tried_bucket_count == 0 {
            return Err(P2pError::InvalidConfig("bucket counts must be non-zero".into()));
        }
        if self.new_bucket_size == 0 || self.tried_bucket_size == 0 {
            return Err(P2pError::InvalidConfig("bucket sizes must be non-zero".into()));
        }
        if self.max_peer_info_size == 0 {
            return Err(P2pError::InvalidConfig(
                "max_peer_info_size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

use std::time::Duration;

/// Snapshot of the per-session limits, taken from the pool configuration when
/// a session is constructed. Sessions never read the pool config directly.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub rate_calculation_interval: Duration,
    pub ws_max_message_rate: f64,
    pub ws_max_message_rate_penalty: u32,
    pub ws_max_payload_inbound: usize,
    pub ws_max_payload_outbound: usize,
    pub max_peer_info_size: usize,
    pub max_peer_list_length: usize,
    pub productivity_reset_interval: Duration,
    pub ping_interval_min: Duration,
    pub ping_interval_max: Duration,
}

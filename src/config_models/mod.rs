pub mod p2p_config;
pub mod peer_config;

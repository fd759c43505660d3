pub mod channel;
pub mod node_info;
pub mod peer;

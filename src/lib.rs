//! Unstructured peer-to-peer networking for blockchain nodes.
//!
//! The library keeps a live mesh of peer connections over persistent duplex
//! sockets, multiplexing request/response RPCs and fire-and-forget messages
//! on each of them. Around that core it maintains hash-bucketed discovery
//! tables of known addresses, rates and reputation per connection, quota
//! enforcement with protected eviction, and periodic shuffling of outbound
//! relationships.
//!
//! The entry point is [`P2p`]: configure it with a [`P2pConfig`], `start` it,
//! and consume its typed [`P2pEvent`] stream.
//!
//! ```no_run
//! use mesh_p2p::{NodeInfo, P2p, P2pConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let node_info = NodeInfo {
//!     network_id: "da3ed6a45429278bac2666961289ca17ad86595d33b31037615d4b8e8f158bba".into(),
//!     version: "1.0.0".into(),
//!     protocol_version: Some("1.1".into()),
//!     min_version: "1.0.0".into(),
//!     os: Some(std::env::consts::OS.into()),
//!     ws_port: 5000,
//!     height: 0,
//!     modules: vec![],
//!     nonce: rand::random(),
//!     options: serde_json::Map::new(),
//! };
//! let mut p2p = P2p::new(P2pConfig::new(node_info))?;
//! p2p.start().await?;
//! let mut events = p2p.take_event_receiver().unwrap();
//! while let Some(event) = events.recv().await {
//!     println!("{}", event.name());
//! }
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod config_models;
pub mod errors;
mod models;
pub mod peer_book;
mod peer_pool;
pub mod peer_selection;
mod peer_session;
mod p2p;
mod transport;
pub mod validation;

pub use config_models::p2p_config::P2pConfig;
pub use config_models::p2p_config::PeerLists;
pub use config_models::peer_config::PeerConfig;
pub use errors::P2pError;
pub use models::channel::P2pEvent;
pub use models::channel::P2pMessage;
pub use models::channel::P2pRequest;
pub use models::node_info::NodeInfo;
pub use models::peer::ConnectionRefusedReason;
pub use models::peer::ConnectionState;
pub use models::peer::PeerId;
pub use models::peer::PeerInfo;
pub use models::peer::PeerKind;
pub use models::peer::PeerMetrics;
pub use models::peer::Productivity;
pub use models::peer::EVENT_NODE_INFO_CHANGED;
pub use models::peer::EVICTED_PEER_CODE;
pub use models::peer::FAILED_TO_RESPOND_CODE;
pub use models::peer::FORBIDDEN_CONNECTION_CODE;
pub use models::peer::INCOMPATIBLE_NETWORK_CODE;
pub use models::peer::INCOMPATIBLE_PROTOCOL_VERSION_CODE;
pub use models::peer::INTENTIONAL_DISCONNECT_STATUS_CODE;
pub use models::peer::PROCEDURE_PEER_LIST;
pub use models::peer::PROCEDURE_STATUS;
pub use models::peer::PROCEDURE_UPDATE_MYSELF;
pub use p2p::P2p;
pub use peer_selection::DefaultPeerSelector;
pub use peer_selection::PeerSelector;

/// Capacity of every command and event channel in the crate.
pub(crate) const PEER_CHANNEL_CAPACITY: usize = 1000;

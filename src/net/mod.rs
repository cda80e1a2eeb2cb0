//! Peer-to-peer layer - framing, handshake, connections, bloom filters
//!
//! ```text
//! Connector ─► spawn_peer ─► Framed<MessageCodec> ◄─► PeerSession
//!                                  │
//!                                  └── NetEvent ──► sync engine
//! ```

pub mod addrman;
pub mod bloom;
pub mod codec;
pub mod connection;
pub mod peer;

pub use addrman::AddressBook;
pub use bloom::BloomFilter;
pub use connection::{BoxedStream, Connector, NetEvent, PeerHandle, PeerId, TcpConnector, Timeouts};
pub use peer::{DisconnectReason, LocalInfo, PeerEvent, PeerSession, PeerState, RemoteInfo};

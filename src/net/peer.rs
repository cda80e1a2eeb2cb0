//! PeerSession - per-connection protocol state machine
//!
//! ```text
//!   Connecting ──connected──► Handshaking ──version+verack──► Ready
//!        │                         │                            │
//!        └─────────────────────────┴──── violation / close ─────┴──► Disconnected
//! ```
//!
//! Pure: takes decoded messages, returns what to send and what to hand to the
//! sync engine. No I/O, no clocks. The async driver in
//! [`super::connection`] owns timeouts and the socket.

use std::net::SocketAddr;

use bitcoin::block::Header;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Address as WireAddress, ServiceFlags};
use bitcoin::{MerkleBlock, Network, Transaction};

pub const PROTOCOL_VERSION: u32 = 70016;
/// Bloom filtering (BIP37) needs at least this.
pub const MIN_PEER_VERSION: u32 = 70001;
pub const USER_AGENT: &str = concat!("/beespv:", env!("CARGO_PKG_VERSION"), "/");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Ready,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Timeout,
    ProtocolViolation(String),
    VersionMismatch(u32),
    MissingServices,
    SelfConnection,
    Io(String),
    Closed,
    Requested,
}

impl DisconnectReason {
    /// Reasons that earn a soft ban rather than a plain retry backoff.
    pub fn is_misbehavior(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_) | Self::VersionMismatch(_) | Self::MissingServices | Self::SelfConnection)
    }
}

/// What the remote told us in its `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    pub version: u32,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub start_height: u32,
}

/// Messages for the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Ready(RemoteInfo),
    Headers(Vec<Header>),
    Inv(Vec<Inventory>),
    MerkleBlock(MerkleBlock),
    Tx(Transaction),
    GetData(Vec<Inventory>),
    NotFound(Vec<Inventory>),
    Addresses(Vec<SocketAddr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerAction {
    Send(NetworkMessage),
    Deliver(PeerEvent),
}

/// Our side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalInfo {
    pub network: Network,
    pub start_height: u32,
    /// Detects connections to ourselves.
    pub nonce: u64,
    /// Advertise a reachable address in `version`. Off when listening is
    /// disabled, which is the only mode this client runs in by default.
    pub advertise: Option<SocketAddr>,
}

#[derive(Debug)]
pub struct PeerSession {
    addr: SocketAddr,
    local: LocalInfo,
    state: PeerState,
    remote: Option<RemoteInfo>,
    got_verack: bool,
}

impl PeerSession {
    pub fn new(addr: SocketAddr, local: LocalInfo) -> Self {
        Self { addr, local, state: PeerState::Connecting, remote: None, got_verack: false }
    }

    pub fn addr(&self) -> SocketAddr { self.addr }
    pub fn network(&self) -> Network { self.local.network }
    pub fn state(&self) -> PeerState { self.state }
    pub fn remote(&self) -> Option<&RemoteInfo> { self.remote.as_ref() }

    /// Transport is up: start the handshake.
    pub fn on_connected(&mut self) -> Vec<NetworkMessage> {
        self.state = PeerState::Handshaking;
        vec![NetworkMessage::Version(self.version_message())]
    }

    pub fn close(&mut self) { self.state = PeerState::Disconnected; }

    fn version_message(&self) -> VersionMessage {
        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
        let sender = self.local.advertise.unwrap_or(unspecified);
        let mut msg = VersionMessage::new(
            ServiceFlags::NONE,
            chrono::Utc::now().timestamp(),
            WireAddress::new(&self.addr, ServiceFlags::NONE),
            WireAddress::new(&sender, ServiceFlags::NONE),
            self.local.nonce,
            USER_AGENT.to_string(),
            self.local.start_height as i32,
        );
        msg.version = PROTOCOL_VERSION;
        // no tx relay until a filter is loaded
        msg.relay = false;
        msg
    }

    pub fn handle(&mut self, msg: NetworkMessage) -> Result<Vec<PeerAction>, DisconnectReason> {
        match self.state {
            PeerState::Handshaking => self.handle_handshake(msg),
            PeerState::Ready => self.handle_ready(msg),
            PeerState::Connecting | PeerState::Disconnected => {
                Err(DisconnectReason::ProtocolViolation("message outside a session".into()))
            }
        }
    }

    fn handle_handshake(&mut self, msg: NetworkMessage) -> Result<Vec<PeerAction>, DisconnectReason> {
        let mut actions = Vec::new();
        match msg {
            NetworkMessage::Version(v) => {
                if self.remote.is_some() {
                    return Err(DisconnectReason::ProtocolViolation("duplicate version".into()));
                }
                if v.nonce == self.local.nonce {
                    return Err(DisconnectReason::SelfConnection);
                }
                if v.version < MIN_PEER_VERSION {
                    return Err(DisconnectReason::VersionMismatch(v.version));
                }
                if !v.services.has(ServiceFlags::NETWORK) || !v.services.has(ServiceFlags::BLOOM) {
                    return Err(DisconnectReason::MissingServices);
                }
                self.remote = Some(RemoteInfo {
                    version: v.version,
                    services: v.services,
                    user_agent: v.user_agent,
                    start_height: v.start_height.max(0) as u32,
                });
                actions.push(PeerAction::Send(NetworkMessage::Verack));
            }
            NetworkMessage::Verack => {
                if self.remote.is_none() {
                    return Err(DisconnectReason::ProtocolViolation("verack before version".into()));
                }
                self.got_verack = true;
            }
            NetworkMessage::WtxidRelay | NetworkMessage::SendAddrV2 | NetworkMessage::SendHeaders => {}
            other if self.remote.is_none() => {
                return Err(DisconnectReason::ProtocolViolation(format!("{} before version", other.cmd())));
            }
            other => tracing::trace!(peer = %self.addr, cmd = other.cmd(), "Ignored during handshake"),
        }
        if self.got_verack {
            if let Some(remote) = &self.remote {
                self.state = PeerState::Ready;
                tracing::debug!(peer = %self.addr, version = remote.version, height = remote.start_height, agent = %remote.user_agent, "Peer ready");
                actions.push(PeerAction::Deliver(PeerEvent::Ready(remote.clone())));
            }
        }
        Ok(actions)
    }

    fn handle_ready(&mut self, msg: NetworkMessage) -> Result<Vec<PeerAction>, DisconnectReason> {
        let deliver = |e| Ok(vec![PeerAction::Deliver(e)]);
        match msg {
            NetworkMessage::Ping(nonce) => Ok(vec![PeerAction::Send(NetworkMessage::Pong(nonce))]),
            NetworkMessage::Headers(h) => deliver(PeerEvent::Headers(h)),
            NetworkMessage::Inv(i) => deliver(PeerEvent::Inv(i)),
            NetworkMessage::MerkleBlock(mb) => deliver(PeerEvent::MerkleBlock(mb)),
            NetworkMessage::Tx(tx) => deliver(PeerEvent::Tx(tx)),
            NetworkMessage::GetData(i) => deliver(PeerEvent::GetData(i)),
            NetworkMessage::NotFound(i) => deliver(PeerEvent::NotFound(i)),
            NetworkMessage::Addr(list) => {
                let addrs = list.iter().filter_map(|(_, a)| a.socket_addr().ok()).collect();
                deliver(PeerEvent::Addresses(addrs))
            }
            NetworkMessage::Version(_) | NetworkMessage::Verack => {
                Err(DisconnectReason::ProtocolViolation("handshake repeated".into()))
            }
            NetworkMessage::Reject(r) => {
                tracing::warn!(peer = %self.addr, message = %r.message, reason = %r.reason, "Peer rejected");
                Ok(Vec::new())
            }
            other => {
                tracing::trace!(peer = %self.addr, cmd = other.cmd(), "Ignored");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn remote_version(nonce: u64, height: i32) -> VersionMessage {
        let any = SocketAddr::from(([127, 0, 0, 1], 18444));
        let mut v = VersionMessage::new(
            ServiceFlags::NETWORK | ServiceFlags::BLOOM,
            0,
            WireAddress::new(&any, ServiceFlags::NONE),
            WireAddress::new(&any, ServiceFlags::NONE),
            nonce,
            "/test:0/".into(),
            height,
        );
        v.version = PROTOCOL_VERSION;
        v
    }

    fn session() -> PeerSession {
        let local = LocalInfo { network: Network::Regtest, start_height: 0, nonce: 1, advertise: None };
        let mut s = PeerSession::new(SocketAddr::from(([127, 0, 0, 1], 18444)), local);
        s.on_connected();
        s
    }

    #[test]
    fn handshake_reaches_ready() {
        let mut s = session();
        assert_eq!(s.state(), PeerState::Handshaking);
        let actions = s.handle(NetworkMessage::Version(remote_version(2, 120))).unwrap();
        assert_eq!(actions, vec![PeerAction::Send(NetworkMessage::Verack)]);
        let actions = s.handle(NetworkMessage::Verack).unwrap();
        assert_eq!(s.state(), PeerState::Ready);
        assert!(matches!(&actions[0], PeerAction::Deliver(PeerEvent::Ready(r)) if r.start_height == 120));
    }

    #[test]
    fn old_version_is_mismatch() {
        let mut s = session();
        let mut v = remote_version(2, 0);
        v.version = 60_000;
        let err = s.handle(NetworkMessage::Version(v)).unwrap_err();
        assert_eq!(err, DisconnectReason::VersionMismatch(60_000));
        assert!(err.is_misbehavior());
    }

    #[test]
    fn missing_bloom_service_rejected() {
        let mut s = session();
        let mut v = remote_version(2, 0);
        v.services = ServiceFlags::NETWORK;
        assert_eq!(s.handle(NetworkMessage::Version(v)), Err(DisconnectReason::MissingServices));
    }

    #[test]
    fn self_connection_detected() {
        let mut s = session();
        assert_eq!(s.handle(NetworkMessage::Version(remote_version(1, 0))), Err(DisconnectReason::SelfConnection));
    }

    #[test]
    fn data_before_version_is_violation() {
        let mut s = session();
        assert!(matches!(s.handle(NetworkMessage::Headers(vec![])), Err(DisconnectReason::ProtocolViolation(_))));
    }

    #[test]
    fn ready_answers_ping_and_delivers() {
        let mut s = session();
        s.handle(NetworkMessage::Version(remote_version(2, 0))).unwrap();
        s.handle(NetworkMessage::Verack).unwrap();
        assert_eq!(s.handle(NetworkMessage::Ping(9)).unwrap(), vec![PeerAction::Send(NetworkMessage::Pong(9))]);
        assert_eq!(s.handle(NetworkMessage::Inv(vec![])).unwrap(), vec![PeerAction::Deliver(PeerEvent::Inv(vec![]))]);
        assert!(s.handle(NetworkMessage::Verack).is_err());
    }
}

//! Peer connection task - one tokio task per peer
//!
//! Owns the framed socket and a [`PeerSession`]. Outgoing messages arrive on an
//! mpsc channel through [`PeerHandle`]; everything the session delivers goes
//! up as [`NetEvent`]s. The task always ends with exactly one
//! `NetEvent::Disconnected`.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::Magic;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;

use super::codec::{CodecError, MessageCodec};
use super::peer::{DisconnectReason, PeerAction, PeerEvent, PeerSession, PeerState};

pub type PeerId = u64;

pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

pub type BoxedStream = Box<dyn PeerStream>;

/// Opens transports to peers. TCP in production; tests plug in duplex pipes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedStream>;
}

pub struct TcpConnector {
    pub timeout: Duration,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxedStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug)]
pub enum NetEvent {
    Message { peer: PeerId, event: PeerEvent },
    Disconnected { peer: PeerId, addr: SocketAddr, reason: DisconnectReason },
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub handshake: Duration,
    /// Silence longer than this triggers a ping; a second window without
    /// any traffic closes the connection.
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { handshake: Duration::from_secs(20), idle: Duration::from_secs(120) }
    }
}

enum Command {
    Send(NetworkMessage),
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    pub addr: SocketAddr,
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Send(m) => write!(f, "Send({})", m.cmd()),
            Command::Disconnect => f.write_str("Disconnect"),
        }
    }
}

impl PeerHandle {
    /// Queue a message. False when the peer task is gone or backed up.
    pub fn send(&self, msg: NetworkMessage) -> bool { self.tx.try_send(Command::Send(msg)).is_ok() }

    pub fn disconnect(&self) { let _ = self.tx.try_send(Command::Disconnect); }

    pub fn is_closed(&self) -> bool { self.tx.is_closed() }
}

pub fn spawn_peer<S>(
    id: PeerId,
    stream: S,
    session: PeerSession,
    timeouts: Timeouts,
    events: mpsc::Sender<NetEvent>,
) -> PeerHandle
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let addr = session.addr();
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(run_peer(id, stream, session, timeouts, rx, events));
    PeerHandle { id, addr, tx }
}

async fn run_peer<S>(
    id: PeerId,
    stream: S,
    mut session: PeerSession,
    timeouts: Timeouts,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<NetEvent>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let addr = session.addr();
    let mut framed = Framed::new(stream, MessageCodec::new(Magic::from(session.network())));
    let reason = drive(id, &mut framed, &mut session, timeouts, &mut commands, &events).await;
    session.close();
    tracing::debug!(peer = %addr, ?reason, "Peer disconnected");
    let _ = events.send(NetEvent::Disconnected { peer: id, addr, reason }).await;
}

async fn drive<S>(
    id: PeerId,
    framed: &mut Framed<S, MessageCodec>,
    session: &mut PeerSession,
    timeouts: Timeouts,
    commands: &mut mpsc::Receiver<Command>,
    events: &mpsc::Sender<NetEvent>,
) -> DisconnectReason
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    for msg in session.on_connected() {
        if let Err(e) = framed.send(msg).await {
            return io_reason(e);
        }
    }

    let handshake_deadline = Instant::now() + timeouts.handshake;
    let mut last_rx = Instant::now();
    let mut ping_sent: Option<Instant> = None;
    let mut tick = tokio::time::interval((timeouts.handshake.min(timeouts.idle) / 4).max(Duration::from_millis(10)));

    loop {
        tokio::select! {
            frame = framed.next() => {
                let msg = match frame {
                    None => return DisconnectReason::Closed,
                    Some(Err(e)) => return io_reason(e),
                    Some(Ok(msg)) => msg,
                };
                last_rx = Instant::now();
                ping_sent = None;
                let actions = match session.handle(msg) {
                    Ok(actions) => actions,
                    Err(reason) => return reason,
                };
                for action in actions {
                    match action {
                        PeerAction::Send(m) => {
                            if let Err(e) = framed.send(m).await {
                                return io_reason(e);
                            }
                        }
                        PeerAction::Deliver(event) => {
                            if events.send(NetEvent::Message { peer: id, event }).await.is_err() {
                                return DisconnectReason::Requested;
                            }
                        }
                    }
                }
            }
            cmd = commands.recv() => match cmd {
                Some(Command::Send(m)) => {
                    if let Err(e) = framed.send(m).await {
                        return io_reason(e);
                    }
                }
                Some(Command::Disconnect) | None => return DisconnectReason::Requested,
            },
            _ = tick.tick() => {
                let now = Instant::now();
                if session.state() != PeerState::Ready {
                    if now >= handshake_deadline {
                        return DisconnectReason::Timeout;
                    }
                    continue;
                }
                if now.duration_since(last_rx) < timeouts.idle {
                    continue;
                }
                match ping_sent {
                    None => {
                        if let Err(e) = framed.send(NetworkMessage::Ping(rand::random())).await {
                            return io_reason(e);
                        }
                        ping_sent = Some(now);
                    }
                    Some(at) if now.duration_since(at) >= timeouts.idle => return DisconnectReason::Timeout,
                    Some(_) => {}
                }
            }
        }
    }
}

fn io_reason(e: CodecError) -> DisconnectReason {
    match e {
        CodecError::Io(e) => DisconnectReason::Io(e.to_string()),
        CodecError::Protocol(m) => DisconnectReason::ProtocolViolation(m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::peer::tests::remote_version;
    use crate::net::peer::LocalInfo;
    use bitcoin::Network;

    fn session() -> PeerSession {
        let local = LocalInfo { network: Network::Regtest, start_height: 0, nonce: 1, advertise: None };
        PeerSession::new(SocketAddr::from(([127, 0, 0, 1], 18444)), local)
    }

    #[tokio::test]
    async fn handshake_and_ping_over_duplex() {
        let (ours, theirs) = tokio::io::duplex(1 << 16);
        let (ev_tx, mut ev_rx) = mpsc::channel(16);
        let handle = spawn_peer(7, ours, session(), Timeouts::default(), ev_tx);

        let mut remote = Framed::new(theirs, MessageCodec::new(Magic::from(Network::Regtest)));
        assert!(matches!(remote.next().await, Some(Ok(NetworkMessage::Version(_)))));
        remote.send(NetworkMessage::Version(remote_version(2, 5))).await.unwrap();
        remote.send(NetworkMessage::Verack).await.unwrap();
        assert!(matches!(remote.next().await, Some(Ok(NetworkMessage::Verack))));

        match ev_rx.recv().await {
            Some(NetEvent::Message { peer: 7, event: PeerEvent::Ready(info) }) => assert_eq!(info.start_height, 5),
            other => panic!("unexpected {other:?}"),
        }

        remote.send(NetworkMessage::Ping(42)).await.unwrap();
        assert!(matches!(remote.next().await, Some(Ok(NetworkMessage::Pong(42)))));

        assert!(handle.send(NetworkMessage::SendHeaders));
        assert!(matches!(remote.next().await, Some(Ok(NetworkMessage::SendHeaders))));

        handle.disconnect();
        match ev_rx.recv().await {
            Some(NetEvent::Disconnected { peer: 7, reason, .. }) => assert_eq!(reason, DisconnectReason::Requested),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_peer_times_out_in_handshake() {
        let (ours, _theirs) = tokio::io::duplex(1 << 16);
        let (ev_tx, mut ev_rx) = mpsc::channel(16);
        let timeouts = Timeouts { handshake: Duration::from_millis(100), idle: Duration::from_secs(5) };
        spawn_peer(1, ours, session(), timeouts, ev_tx);
        match ev_rx.recv().await {
            Some(NetEvent::Disconnected { reason, .. }) => assert_eq!(reason, DisconnectReason::Timeout),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_is_protocol_violation() {
        use tokio::io::AsyncWriteExt;
        let (ours, mut theirs) = tokio::io::duplex(1 << 16);
        let (ev_tx, mut ev_rx) = mpsc::channel(16);
        spawn_peer(1, ours, session(), Timeouts::default(), ev_tx);
        theirs.write_all(&[0xde; 32]).await.unwrap();
        match ev_rx.recv().await {
            Some(NetEvent::Disconnected { reason, .. }) => assert!(reason.is_misbehavior()),
            other => panic!("unexpected {other:?}"),
        }
    }
}

//! Sync driver - the async loop around [`ChainSyncEngine`]
//!
//! One task owns the engine, the address book and every peer handle. It
//! feeds network events to the engine and carries out the commands that come
//! back: wallet work goes through the mutation queue, headers and the peer
//! book go to disk, notifications go to the event bus.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::{Network, Transaction};
use tokio::sync::{broadcast, mpsc, watch};

use super::engine::{ChainSyncEngine, Command};
use super::state::SyncState;
use crate::chain::{store, HeaderChain};
use crate::events::{EventBus, FaultReporter, WalletEvent};
use crate::ledger::{Balance, TxChange};
use crate::net::addrman::resolve_seeds;
use crate::net::bloom::DEFAULT_FP_RATE;
use crate::net::connection::spawn_peer;
use crate::net::{AddressBook, BloomFilter, BoxedStream, Connector, LocalInfo, NetEvent, PeerEvent, PeerHandle, PeerId, PeerSession, Timeouts};
use crate::queue::QueueHandle;

const TICK: Duration = Duration::from_secs(1);
const HEADER_SAVE_INTERVAL: Duration = Duration::from_secs(10);
const RESERVATION_CHECK: Duration = Duration::from_secs(60);
const SEED_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub network: Network,
    pub max_peers: usize,
    pub timeouts: Timeouts,
    pub static_peers: Vec<SocketAddr>,
    pub dns_seeds: Vec<String>,
    pub port: u16,
    /// No DNS lookups and nothing advertised, for use behind anonymity proxies.
    pub disable_listening: bool,
    pub chain_path: PathBuf,
    pub peers_path: PathBuf,
    pub reservation_timeout: Duration,
}

/// Requests from the manager.
#[derive(Debug)]
pub enum Control {
    Broadcast(Transaction),
    RefreshFilter,
    Cancel,
    Resume,
    /// Drop every confirmation and restart from this chain.
    Resync(HeaderChain),
}

pub struct DriverContext {
    pub queue: QueueHandle,
    pub events: EventBus,
    pub faults: FaultReporter,
    pub connector: Arc<dyn Connector>,
    pub state: watch::Sender<SyncState>,
}

pub struct Driver {
    config: DriverConfig,
    engine: ChainSyncEngine,
    ctx: DriverContext,
    book: AddressBook,
    handles: HashMap<PeerId, PeerHandle>,
    connecting: HashSet<SocketAddr>,
    next_id: PeerId,
    nonce: u64,
    headers_dirty: bool,
    /// The wallet gained outpoints that peers' filters do not cover yet.
    filter_dirty: bool,
    last_header_save: Instant,
    last_reservation_check: Instant,
    last_balance: Option<Balance>,
}

type ConnectResult = (SocketAddr, std::io::Result<BoxedStream>);

impl Driver {
    pub fn new(config: DriverConfig, engine: ChainSyncEngine, book: AddressBook, ctx: DriverContext) -> Self {
        let now = Instant::now();
        Self {
            config,
            engine,
            ctx,
            book,
            handles: HashMap::new(),
            connecting: HashSet::new(),
            next_id: 1,
            nonce: rand::random(),
            headers_dirty: false,
            filter_dirty: false,
            last_header_save: now,
            last_reservation_check: now,
            last_balance: None,
        }
    }

    pub async fn run(mut self, mut control: mpsc::Receiver<Control>, mut shutdown: broadcast::Receiver<()>) {
        let (net_tx, mut net_rx) = mpsc::channel::<NetEvent>(1024);
        let (conn_tx, mut conn_rx) = mpsc::channel::<ConnectResult>(64);
        let (seed_tx, mut seed_rx) = mpsc::channel::<Vec<SocketAddr>>(1);

        self.engine.start();
        self.refresh_filter().await;
        match self.ctx.queue.call_async(|w| w.ledger().pending_sends()).await {
            Ok(pending) => {
                for tx in pending {
                    let cmds = self.engine.broadcast(tx);
                    self.execute(cmds).await;
                }
            }
            Err(e) => self.ctx.faults.report("load pending sends", e),
        }
        self.book.add_many(self.config.static_peers.iter().copied());
        if !self.config.disable_listening && !self.config.dns_seeds.is_empty() {
            let seeds = self.config.dns_seeds.clone();
            let port = self.config.port;
            tokio::spawn(async move {
                let _ = seed_tx.send(resolve_seeds(&seeds, port, SEED_TIMEOUT).await).await;
            });
        }
        self.ctx.events.publish(WalletEvent::EngineStarted);
        tracing::info!(network = %self.config.network, height = self.engine.chain().height(), "Sync started");

        let mut tick = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                ctl = control.recv() => match ctl {
                    Some(ctl) => self.handle_control(ctl).await,
                    None => break,
                },
                Some(event) = net_rx.recv() => self.handle_net(event, &conn_tx).await,
                Some((addr, result)) = conn_rx.recv() => self.handle_connect(addr, result, &net_tx),
                Some(found) = seed_rx.recv() => {
                    let added = self.book.add_many(found);
                    tracing::info!(added, "Peers from DNS seeds");
                    self.fill_slots(&conn_tx);
                }
                _ = tick.tick() => self.maintain(&conn_tx).await,
            }
            if self.filter_dirty {
                self.refresh_filter().await;
            }
            self.publish_state();
        }

        for handle in self.handles.values() {
            handle.disconnect();
        }
        self.save_headers();
        if let Err(e) = self.book.save(&self.config.peers_path) {
            tracing::warn!(error = %e, "Peer book not saved");
        }
        self.engine.stop();
        self.publish_state();
        self.ctx.events.publish(WalletEvent::EngineStopped);
        tracing::info!("Sync stopped");
    }

    async fn handle_control(&mut self, ctl: Control) {
        let now = Instant::now();
        let cmds = match ctl {
            Control::Broadcast(tx) => {
                self.filter_dirty = true;
                self.engine.broadcast(tx)
            }
            Control::RefreshFilter => {
                self.refresh_filter().await;
                Vec::new()
            }
            Control::Cancel => {
                self.engine.cancel();
                Vec::new()
            }
            Control::Resume => self.engine.resume(now),
            Control::Resync(chain) => self.resync(chain, now).await,
        };
        self.execute(cmds).await;
    }

    /// Revert on the wallet thread first so no block applied under the old
    /// chain lands after the reset.
    async fn resync(&mut self, chain: HeaderChain, now: Instant) -> Vec<Command> {
        let result = self.ctx.queue.call_async(|w| w.revert_above(None).map(|t| (t, w.balance(), w.birth_time()))).await;
        match result {
            Ok(Ok((reverted, balance, birth_time))) => {
                tracing::info!(reverted = reverted.len(), "Resyncing from base");
                for txid in reverted {
                    self.ctx.events.publish(WalletEvent::TransactionChanged { txid });
                }
                self.publish_balance(balance);
                // imported keys must be in the filter before blocks are asked for
                self.refresh_filter().await;
                let cmds = self.engine.reset(chain, birth_time, now);
                self.save_headers();
                cmds
            }
            Ok(Err(e)) | Err(e) => {
                self.ctx.faults.report("resync", e);
                Vec::new()
            }
        }
    }

    async fn refresh_filter(&mut self) {
        self.filter_dirty = false;
        match self.ctx.queue.call_async(|w| w.filter_elements()).await {
            Ok(elements) => {
                let filter = BloomFilter::from_elements(&elements, DEFAULT_FP_RATE);
                let cmds = self.engine.set_filter(filter.to_filter_load());
                self.execute(cmds).await;
            }
            Err(e) => self.ctx.faults.report("build bloom filter", e),
        }
    }

    fn handle_connect(&mut self, addr: SocketAddr, result: std::io::Result<BoxedStream>, net_tx: &mpsc::Sender<NetEvent>) {
        self.connecting.remove(&addr);
        match result {
            Ok(stream) => {
                let id = self.next_id;
                self.next_id += 1;
                let local = LocalInfo {
                    network: self.config.network,
                    start_height: self.engine.chain().height(),
                    nonce: self.nonce,
                    advertise: None,
                };
                let handle = spawn_peer(id, stream, PeerSession::new(addr, local), self.config.timeouts, net_tx.clone());
                tracing::debug!(peer = id, %addr, "Connected");
                self.handles.insert(id, handle);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "Connect failed");
                self.book.record_failure(addr, chrono::Utc::now().timestamp());
            }
        }
    }

    async fn handle_net(&mut self, event: NetEvent, conn_tx: &mpsc::Sender<ConnectResult>) {
        let now = Instant::now();
        let cmds = match event {
            NetEvent::Message { peer, event } => match event {
                PeerEvent::Ready(info) => {
                    if let Some(h) = self.handles.get(&peer) {
                        self.book.record_success(h.addr, chrono::Utc::now().timestamp());
                    }
                    let cmds = self.engine.on_ready(peer, &info, now);
                    self.ctx.events.publish(WalletEvent::PeerCountChanged(self.engine.peer_count()));
                    cmds
                }
                PeerEvent::Headers(headers) => self.engine.on_headers(peer, headers, now),
                PeerEvent::Inv(inv) => self.engine.on_inv(peer, inv, now),
                PeerEvent::MerkleBlock(block) => self.engine.on_merkle_block(peer, block, now),
                PeerEvent::Tx(tx) => self.engine.on_tx(peer, tx, now),
                PeerEvent::GetData(inv) => self.engine.on_get_data(peer, inv),
                PeerEvent::NotFound(inv) => self.engine.on_not_found(peer, inv, now),
                PeerEvent::Addresses(addrs) => {
                    self.book.add_many(addrs);
                    Vec::new()
                }
            },
            NetEvent::Disconnected { peer, addr, reason } => {
                self.handles.remove(&peer);
                let unix = chrono::Utc::now().timestamp();
                if reason.is_misbehavior() {
                    self.book.soft_ban(addr, unix);
                } else if !matches!(reason, crate::net::DisconnectReason::Requested) {
                    self.book.record_failure(addr, unix);
                }
                let before = self.engine.peer_count();
                let cmds = self.engine.on_disconnected(peer, now);
                if self.engine.peer_count() != before {
                    self.ctx.events.publish(WalletEvent::PeerCountChanged(self.engine.peer_count()));
                }
                self.fill_slots(conn_tx);
                cmds
            }
        };
        self.execute(cmds).await;
    }

    async fn maintain(&mut self, conn_tx: &mpsc::Sender<ConnectResult>) {
        self.fill_slots(conn_tx);
        let cmds = self.engine.tick(Instant::now());
        self.execute(cmds).await;

        if self.headers_dirty && self.last_header_save.elapsed() >= HEADER_SAVE_INTERVAL {
            self.save_headers();
        }
        if self.last_reservation_check.elapsed() >= RESERVATION_CHECK {
            self.last_reservation_check = Instant::now();
            let timeout = self.config.reservation_timeout.as_secs() as i64;
            match self.ctx.queue.call_async(move |w| w.release_expired_reservations(timeout).map(|t| (t, w.balance()))).await {
                Ok(Ok((released, balance))) => {
                    for txid in released {
                        self.ctx.events.publish(WalletEvent::TransactionFailed { txid, reason: "not confirmed in time".into() });
                        self.ctx.events.publish(WalletEvent::TransactionChanged { txid });
                    }
                    self.publish_balance(balance);
                }
                Ok(Err(e)) | Err(e) => self.ctx.faults.report("release reservations", e),
            }
        }
    }

    fn fill_slots(&mut self, conn_tx: &mpsc::Sender<ConnectResult>) {
        let busy: Vec<SocketAddr> = self.handles.values().map(|h| h.addr).chain(self.connecting.iter().copied()).collect();
        let want = self.config.max_peers.saturating_sub(busy.len());
        if want == 0 {
            return;
        }
        for addr in self.book.candidates(chrono::Utc::now().timestamp(), &busy, want) {
            self.connecting.insert(addr);
            let connector = self.ctx.connector.clone();
            let tx = conn_tx.clone();
            tokio::spawn(async move {
                let result = connector.connect(addr).await;
                let _ = tx.send((addr, result)).await;
            });
        }
    }

    async fn execute(&mut self, cmds: Vec<Command>) {
        for cmd in cmds {
            match cmd {
                Command::Send { peer, msg } => {
                    if let Some(h) = self.handles.get(&peer) {
                        if !h.send(msg) {
                            tracing::debug!(peer, "Peer send queue full");
                        }
                    }
                }
                Command::Disconnect { peer, reason } => {
                    if let Some(h) = self.handles.get(&peer) {
                        let unix = chrono::Utc::now().timestamp();
                        if reason.is_misbehavior() {
                            self.book.soft_ban(h.addr, unix);
                        } else {
                            self.book.record_failure(h.addr, unix);
                        }
                        h.disconnect();
                    }
                }
                Command::ApplyBlock { height, hash, txs } => {
                    let result = self
                        .ctx
                        .queue
                        .call_async(move |w| w.apply_block(height, &txs).map(|c| (c, w.balance())))
                        .await;
                    match result {
                        Ok(Ok((changes, balance))) => {
                            self.filter_dirty |= changes.iter().any(|c| c.received > 0);
                            if !changes.is_empty() {
                                tracing::info!(height, %hash, txs = changes.len(), "Applied block");
                            }
                            self.publish_changes(&changes);
                            self.publish_balance(balance);
                        }
                        Ok(Err(e)) | Err(e) => self.ctx.faults.report("apply block", e),
                    }
                }
                Command::ApplyPending(tx) => {
                    match self.ctx.queue.call_async(move |w| w.apply_pending(&tx).map(|c| (c, w.balance()))).await {
                        Ok(Ok((change, balance))) => {
                            if let Some(change) = change {
                                self.filter_dirty |= change.received > 0;
                                self.publish_changes(std::slice::from_ref(&change));
                            }
                            self.publish_balance(balance);
                        }
                        Ok(Err(e)) | Err(e) => self.ctx.faults.report("apply pending", e),
                    }
                }
                Command::Revert { fork_height } => {
                    match self.ctx.queue.call_async(move |w| w.revert_above(Some(fork_height)).map(|t| (t, w.balance()))).await {
                        Ok(Ok((reverted, balance))) => {
                            tracing::info!(fork_height, reverted = reverted.len(), "Reverted wallet above fork");
                            for txid in reverted {
                                self.ctx.events.publish(WalletEvent::TransactionChanged { txid });
                            }
                            self.publish_balance(balance);
                        }
                        Ok(Err(e)) | Err(e) => self.ctx.faults.report("revert", e),
                    }
                }
                Command::SaveHeaders => {
                    self.headers_dirty = true;
                    if self.last_header_save.elapsed() >= HEADER_SAVE_INTERVAL {
                        self.save_headers();
                    }
                }
                Command::Broadcasted(txid) => self.ctx.events.publish(WalletEvent::TransactionBroadcast { txid }),
            }
        }
    }

    fn save_headers(&mut self) {
        self.last_header_save = Instant::now();
        match store::save(self.engine.chain(), &self.config.chain_path) {
            Ok(()) => self.headers_dirty = false,
            Err(e) => self.ctx.faults.report("save headers", e),
        }
    }

    fn publish_changes(&self, changes: &[TxChange]) {
        for c in changes {
            self.ctx.events.publish(WalletEvent::TransactionChanged { txid: c.txid });
            if c.coins_received() {
                self.ctx.events.publish(WalletEvent::CoinsReceived { txid: c.txid, amount: c.received - c.sent });
            }
            for dead in &c.dead {
                self.ctx.events.publish(WalletEvent::TransactionFailed { txid: *dead, reason: "double spent".into() });
                self.ctx.events.publish(WalletEvent::TransactionChanged { txid: *dead });
            }
        }
    }

    fn publish_balance(&mut self, balance: Balance) {
        if self.last_balance != Some(balance) {
            self.last_balance = Some(balance);
            self.ctx.events.publish(WalletEvent::BalanceChanged(balance));
        }
    }

    fn publish_state(&self) {
        let state = self.engine.state();
        if *self.ctx.state.borrow() != state {
            self.ctx.state.send_replace(state.clone());
            self.ctx.events.publish(WalletEvent::SyncProgress(state));
        }
    }
}

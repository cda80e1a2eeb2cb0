//! ChainSyncEngine - header sync, filtered block download, reorgs
//!
//! ```text
//!   Idle ─start─► Connecting ─peer ready─► HeaderSync ─short batch─► BlockDownload ─caught up─► Synced
//!                                                                        ▲                         │
//!                                                                        └──── new block inv ──────┘
//! ```
//!
//! Pure logic. Peer events go in, [`Command`]s come out; the driver owns the
//! sockets, the wallet queue and the clock. Filtered blocks are requested
//! only above the wallet's processed height and applied strictly in height
//! order once every matched transaction has arrived.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use bitcoin::hashes::Hash;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::{GetHeadersMessage, Inventory};
use bitcoin::p2p::message_bloom::FilterLoad;
use bitcoin::block::Header;
use bitcoin::{BlockHash, MerkleBlock, Transaction, Txid};

use super::state::{SyncPhase, SyncState};
use crate::chain::{Connected, HeaderChain, Reorg};
use crate::net::{DisconnectReason, PeerId, RemoteInfo};

/// A full `headers` reply; shorter means the peer has nothing more.
pub const MAX_HEADERS: usize = 2000;
const MAX_BLOCKS_IN_FLIGHT: usize = 256;
const BLOCK_STALL: Duration = Duration::from_secs(30);
const HEADER_STALL: Duration = Duration::from_secs(60);
/// Blocks older than the wallet's birth by more than this are skipped.
const BIRTH_SLACK_SECS: i64 = 7 * 24 * 3600;
/// `inv` type for a filtered block (BIP37).
const MSG_FILTERED_BLOCK: u32 = 3;
const MAX_SEEN_TX: usize = 50_000;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send { peer: PeerId, msg: NetworkMessage },
    Disconnect { peer: PeerId, reason: DisconnectReason },
    /// Wallet-relevant transactions of the block at `height`, in block order.
    ApplyBlock { height: u32, hash: BlockHash, txs: Vec<Transaction> },
    ApplyPending(Transaction),
    /// Undo confirmations above `fork_height`.
    Revert { fork_height: u32 },
    SaveHeaders,
    /// A peer fetched one of our outgoing transactions.
    Broadcasted(Txid),
}

#[derive(Debug)]
struct PeerSlot {
    best_height: u32,
}

#[derive(Debug)]
struct Request {
    height: u32,
    peer: PeerId,
    at: Instant,
}

#[derive(Debug)]
struct Downloaded {
    hash: BlockHash,
    /// Peer that delivered the merkle block and owes its matched transactions.
    peer: PeerId,
    at: Instant,
    order: Vec<Txid>,
    txs: HashMap<Txid, Transaction>,
}

impl Downloaded {
    fn is_complete(&self) -> bool { self.txs.len() == self.order.len() }
}

pub struct ChainSyncEngine {
    chain: HeaderChain,
    phase: SyncPhase,
    running: bool,
    cancelled: bool,
    peers: BTreeMap<PeerId, PeerSlot>,
    /// Peer with an outstanding `getheaders`, and since when.
    header_peer: Option<(PeerId, Instant)>,
    processed: u32,
    next_height: u32,
    requests: HashMap<BlockHash, Request>,
    downloaded: BTreeMap<u32, Downloaded>,
    expecting: HashMap<Txid, BlockHash>,
    filter: Option<FilterLoad>,
    outgoing: HashMap<Txid, Transaction>,
    asked: HashSet<Txid>,
    relayed: HashSet<Txid>,
    birth_time: i64,
    round_robin: usize,
}

impl std::fmt::Debug for ChainSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainSyncEngine")
            .field("phase", &self.phase)
            .field("headers", &self.chain.height())
            .field("processed", &self.processed)
            .field("peers", &self.peers.len())
            .field("in_flight", &self.requests.len())
            .finish()
    }
}

impl ChainSyncEngine {
    /// `processed` is the wallet's last processed block, if any.
    pub fn new(chain: HeaderChain, processed: Option<u32>, birth_time: i64) -> Self {
        let processed = processed.unwrap_or(0).max(chain.base_height());
        Self {
            chain,
            phase: SyncPhase::Idle,
            running: false,
            cancelled: false,
            peers: BTreeMap::new(),
            header_peer: None,
            processed,
            next_height: processed + 1,
            requests: HashMap::new(),
            downloaded: BTreeMap::new(),
            expecting: HashMap::new(),
            filter: None,
            outgoing: HashMap::new(),
            asked: HashSet::new(),
            relayed: HashSet::new(),
            birth_time,
            round_robin: 0,
        }
    }

    pub fn chain(&self) -> &HeaderChain { &self.chain }
    pub fn phase(&self) -> SyncPhase { self.phase }
    pub fn processed(&self) -> u32 { self.processed }
    pub fn peer_count(&self) -> usize { self.peers.len() }
    pub fn is_cancelled(&self) -> bool { self.cancelled }

    pub fn state(&self) -> SyncState {
        let best_peer = self.peers.values().map(|p| p.best_height).max().unwrap_or(0);
        SyncState {
            phase: self.phase,
            current_height: self.processed,
            header_height: self.chain.height(),
            target_height: best_peer.max(self.chain.height()),
            peer_count: self.peers.len(),
            tip_time: self.chain.tip().header.time,
        }
    }

    pub fn start(&mut self) {
        self.running = true;
        self.cancelled = false;
        self.update_phase();
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.peers.clear();
        self.header_peer = None;
        self.forget_downloads();
        self.phase = SyncPhase::Idle;
    }

    /// Halt downloading. Applied blocks stay applied; nothing is rolled back.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.header_peer = None;
        self.forget_downloads();
        self.phase = SyncPhase::Idle;
        tracing::info!(processed = self.processed, "Sync cancelled");
    }

    pub fn resume(&mut self, now: Instant) -> Vec<Command> {
        self.cancelled = false;
        let mut cmds = Vec::new();
        if let Some(&peer) = self.peers.keys().next() {
            self.phase = SyncPhase::HeaderSync;
            self.request_headers(peer, now, &mut cmds);
        }
        self.update_phase();
        cmds
    }

    /// Replace the header chain and restart from its base. The wallet must
    /// already have dropped its confirmations.
    pub fn reset(&mut self, chain: HeaderChain, birth_time: i64, now: Instant) -> Vec<Command> {
        self.birth_time = birth_time;
        self.processed = chain.base_height();
        self.next_height = self.processed + 1;
        self.chain = chain;
        self.forget_downloads();
        self.header_peer = None;
        let mut cmds = vec![Command::SaveHeaders];
        if self.running && !self.cancelled {
            if let Some(&peer) = self.peers.keys().next() {
                self.phase = SyncPhase::HeaderSync;
                self.request_headers(peer, now, &mut cmds);
            }
        }
        self.update_phase();
        cmds
    }

    pub fn set_filter(&mut self, filter: FilterLoad) -> Vec<Command> {
        let cmds = self
            .peers
            .keys()
            .map(|&peer| Command::Send { peer, msg: NetworkMessage::FilterLoad(filter.clone()) })
            .collect();
        self.filter = Some(filter);
        cmds
    }

    /// Announce a transaction to every peer and serve it on request until it
    /// is seen in a block.
    pub fn broadcast(&mut self, tx: Transaction) -> Vec<Command> {
        let txid = tx.compute_txid();
        self.outgoing.insert(txid, tx);
        self.peers
            .keys()
            .map(|&peer| Command::Send { peer, msg: NetworkMessage::Inv(vec![Inventory::Transaction(txid)]) })
            .collect()
    }

    pub fn outgoing_count(&self) -> usize { self.outgoing.len() }

    // =========================================================================
    // Peer events
    // =========================================================================

    pub fn on_ready(&mut self, peer: PeerId, info: &RemoteInfo, now: Instant) -> Vec<Command> {
        self.peers.insert(peer, PeerSlot { best_height: info.start_height });
        let mut cmds = Vec::new();
        if let Some(filter) = &self.filter {
            cmds.push(Command::Send { peer, msg: NetworkMessage::FilterLoad(filter.clone()) });
        }
        if !self.outgoing.is_empty() {
            let inv = self.outgoing.keys().map(|t| Inventory::Transaction(*t)).collect();
            cmds.push(Command::Send { peer, msg: NetworkMessage::Inv(inv) });
        }
        if self.running && !self.cancelled && self.header_peer.is_none() {
            if matches!(self.phase, SyncPhase::Idle | SyncPhase::Connecting) {
                self.phase = SyncPhase::HeaderSync;
            }
            self.request_headers(peer, now, &mut cmds);
        }
        self.update_phase();
        cmds
    }

    pub fn on_disconnected(&mut self, peer: PeerId, now: Instant) -> Vec<Command> {
        let mut cmds = Vec::new();
        self.abandon_incomplete(peer);
        if self.peers.remove(&peer).is_none() {
            return cmds;
        }
        let lost: Vec<u32> = self.requests.values().filter(|r| r.peer == peer).map(|r| r.height).collect();
        self.requests.retain(|_, r| r.peer != peer);
        if let Some(&lowest) = lost.iter().min() {
            self.next_height = self.next_height.min(lowest);
        }
        if self.header_peer.map(|(p, _)| p) == Some(peer) {
            self.header_peer = None;
            if self.running && !self.cancelled {
                if let Some(&next) = self.peers.keys().next() {
                    self.request_headers(next, now, &mut cmds);
                }
            }
        }
        self.update_phase();
        self.schedule(now, &mut cmds);
        cmds
    }

    pub fn on_headers(&mut self, peer: PeerId, headers: Vec<Header>, now: Instant) -> Vec<Command> {
        let mut cmds = Vec::new();
        if !self.running {
            return cmds;
        }
        let full = headers.len() >= MAX_HEADERS;
        let mut stored = false;
        for header in headers {
            match self.chain.connect(header) {
                Ok(Connected::Extended { .. }) | Ok(Connected::SideChain { .. }) => stored = true,
                Ok(Connected::Reorg(reorg)) => {
                    stored = true;
                    self.handle_reorg(&reorg, &mut cmds);
                }
                Ok(Connected::Duplicate) => {}
                Err(e) if e.is_misbehavior() => {
                    tracing::warn!(peer, error = %e, "Invalid header");
                    if stored {
                        cmds.push(Command::SaveHeaders);
                    }
                    cmds.push(Command::Disconnect { peer, reason: DisconnectReason::ProtocolViolation(e.to_string()) });
                    return cmds;
                }
                Err(e) => {
                    tracing::debug!(peer, error = %e, "Headers do not connect");
                    break;
                }
            }
        }
        if stored {
            cmds.push(Command::SaveHeaders);
        }

        let height = self.chain.height();
        if let Some(slot) = self.peers.get_mut(&peer) {
            // a short reply means the peer's best is our tip
            slot.best_height = if full { slot.best_height.max(height) } else { height };
        }

        if self.header_peer.map(|(p, _)| p) == Some(peer) {
            self.header_peer = None;
        }
        if full && !self.cancelled {
            self.request_headers(peer, now, &mut cmds);
        } else if self.phase == SyncPhase::HeaderSync {
            tracing::info!(height, "Header sync complete");
            self.phase = SyncPhase::BlockDownload;
        }
        if stored && self.phase == SyncPhase::Synced {
            self.phase = SyncPhase::BlockDownload;
        }
        self.schedule(now, &mut cmds);
        self.update_phase();
        cmds
    }

    pub fn on_inv(&mut self, peer: PeerId, inv: Vec<Inventory>, now: Instant) -> Vec<Command> {
        let mut cmds = Vec::new();
        let mut new_block = false;
        let mut want = Vec::new();
        for item in inv {
            match item {
                Inventory::Block(hash) | Inventory::WitnessBlock(hash) => {
                    new_block |= !self.chain.contains(&hash);
                }
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                    if !self.outgoing.contains_key(&txid) && self.remember(txid, false) {
                        want.push(Inventory::Transaction(txid));
                    }
                }
                _ => {}
            }
        }
        if new_block && self.running && !self.cancelled && self.header_peer.is_none() {
            self.request_headers(peer, now, &mut cmds);
        }
        if !want.is_empty() {
            cmds.push(Command::Send { peer, msg: NetworkMessage::GetData(want) });
        }
        cmds
    }

    pub fn on_merkle_block(&mut self, peer: PeerId, block: MerkleBlock, now: Instant) -> Vec<Command> {
        let mut cmds = Vec::new();
        let hash = block.header.block_hash();
        let Some(request) = self.requests.remove(&hash) else {
            tracing::debug!(peer, %hash, "Unrequested merkle block");
            return cmds;
        };
        let mut matches = Vec::new();
        let mut indexes = Vec::new();
        if let Err(e) = block.extract_matches(&mut matches, &mut indexes) {
            tracing::warn!(peer, %hash, error = ?e, "Bad merkle proof");
            self.next_height = self.next_height.min(request.height);
            cmds.push(Command::Disconnect { peer, reason: DisconnectReason::ProtocolViolation("bad merkle proof".into()) });
            return cmds;
        }
        if !self.chain.is_active(&hash) || request.height <= self.processed {
            return cmds;
        }
        let mut order = Vec::with_capacity(matches.len());
        for txid in matches {
            if !order.contains(&txid) {
                self.expecting.insert(txid, hash);
                order.push(txid);
            }
        }
        if let Some(slot) = self.peers.get_mut(&peer) {
            slot.best_height = slot.best_height.max(request.height);
        }
        self.downloaded.insert(request.height, Downloaded { hash, peer, at: now, order, txs: HashMap::new() });
        self.drain_complete(&mut cmds);
        self.schedule(now, &mut cmds);
        self.update_phase();
        cmds
    }

    pub fn on_tx(&mut self, _peer: PeerId, tx: Transaction, now: Instant) -> Vec<Command> {
        let mut cmds = Vec::new();
        let txid = tx.compute_txid();
        if let Some(hash) = self.expecting.remove(&txid) {
            if let Some(entry) = self.downloaded.values_mut().find(|d| d.hash == hash) {
                entry.txs.insert(txid, tx);
            }
            self.drain_complete(&mut cmds);
            self.schedule(now, &mut cmds);
            self.update_phase();
        } else if self.remember(txid, true) {
            cmds.push(Command::ApplyPending(tx));
        }
        cmds
    }

    pub fn on_not_found(&mut self, _peer: PeerId, inv: Vec<Inventory>, now: Instant) -> Vec<Command> {
        let mut cmds = Vec::new();
        for item in inv {
            let hash = match item {
                Inventory::Block(h) | Inventory::WitnessBlock(h) => h,
                Inventory::Unknown { inv_type: MSG_FILTERED_BLOCK, hash } => BlockHash::from_byte_array(hash),
                _ => continue,
            };
            if let Some(request) = self.requests.remove(&hash) {
                self.next_height = self.next_height.min(request.height);
            }
        }
        self.schedule(now, &mut cmds);
        cmds
    }

    pub fn on_get_data(&mut self, peer: PeerId, inv: Vec<Inventory>) -> Vec<Command> {
        let mut cmds = Vec::new();
        for item in inv {
            if let Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) = item {
                if let Some(tx) = self.outgoing.get(&txid) {
                    cmds.push(Command::Send { peer, msg: NetworkMessage::Tx(tx.clone()) });
                    cmds.push(Command::Broadcasted(txid));
                }
            }
        }
        cmds
    }

    /// Evict peers that sit on requests or on matched transactions.
    pub fn tick(&mut self, now: Instant) -> Vec<Command> {
        let mut stalled: Vec<PeerId> = Vec::new();
        if let Some((peer, since)) = self.header_peer {
            if now.duration_since(since) >= HEADER_STALL {
                stalled.push(peer);
            }
        }
        for r in self.requests.values() {
            if now.duration_since(r.at) >= BLOCK_STALL && !stalled.contains(&r.peer) {
                stalled.push(r.peer);
            }
        }
        for d in self.downloaded.values() {
            if !d.is_complete() && now.duration_since(d.at) >= BLOCK_STALL && !stalled.contains(&d.peer) {
                stalled.push(d.peer);
            }
        }
        stalled
            .into_iter()
            .map(|peer| {
                tracing::info!(peer, "Peer stalled");
                Command::Disconnect { peer, reason: DisconnectReason::Timeout }
            })
            .collect()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn request_headers(&mut self, peer: PeerId, now: Instant, cmds: &mut Vec<Command>) {
        self.header_peer = Some((peer, now));
        let msg = GetHeadersMessage::new(self.chain.locator(), BlockHash::all_zeros());
        cmds.push(Command::Send { peer, msg: NetworkMessage::GetHeaders(msg) });
    }

    fn handle_reorg(&mut self, reorg: &Reorg, cmds: &mut Vec<Command>) {
        let fork = reorg.fork_height;
        if self.processed > fork {
            cmds.push(Command::Revert { fork_height: fork });
            self.processed = fork;
        }
        self.requests.retain(|_, r| r.height <= fork);
        self.downloaded.retain(|h, _| *h <= fork);
        let live: HashSet<BlockHash> = self.downloaded.values().map(|d| d.hash).collect();
        self.expecting.retain(|_, h| live.contains(h));
        self.next_height = self.next_height.min(fork + 1).max(self.processed + 1);
    }

    /// Drop blocks still waiting on `peer` for matched transactions so they
    /// are fetched again from someone else.
    fn abandon_incomplete(&mut self, peer: PeerId) {
        let heights: Vec<u32> =
            self.downloaded.iter().filter(|(_, d)| d.peer == peer && !d.is_complete()).map(|(h, _)| *h).collect();
        let Some(&lowest) = heights.iter().min() else { return };
        for height in &heights {
            if let Some(d) = self.downloaded.remove(height) {
                self.expecting.retain(|_, h| *h != d.hash);
            }
        }
        tracing::debug!(peer, blocks = heights.len(), "Re-queued blocks with missing transactions");
        self.next_height = self.next_height.min(lowest).max(self.processed + 1);
    }

    fn forget_downloads(&mut self) {
        self.requests.clear();
        self.downloaded.clear();
        self.expecting.clear();
        self.next_height = self.processed + 1;
    }

    /// Track a txid; false when already seen.
    fn remember(&mut self, txid: Txid, relayed: bool) -> bool {
        let set = if relayed { &mut self.relayed } else { &mut self.asked };
        if set.len() >= MAX_SEEN_TX {
            set.clear();
        }
        set.insert(txid)
    }

    fn drain_complete(&mut self, cmds: &mut Vec<Command>) {
        while let Some(entry) = self.downloaded.first_entry() {
            let height = *entry.key();
            if height <= self.processed {
                entry.remove();
                continue;
            }
            if height != self.processed + 1 || !entry.get().is_complete() {
                break;
            }
            let mut done = entry.remove();
            let txs: Vec<Transaction> = done.order.iter().filter_map(|t| done.txs.remove(t)).collect();
            for tx in &txs {
                self.outgoing.remove(&tx.compute_txid());
            }
            self.processed = height;
            cmds.push(Command::ApplyBlock { height, hash: done.hash, txs });
        }
    }

    fn schedule(&mut self, now: Instant, cmds: &mut Vec<Command>) {
        if !self.running || self.cancelled || self.phase == SyncPhase::HeaderSync {
            return;
        }
        self.skip_before_birth(cmds);

        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        if ids.is_empty() {
            return;
        }
        let mut batches: BTreeMap<PeerId, Vec<Inventory>> = BTreeMap::new();
        while self.next_height <= self.chain.height() && self.requests.len() < MAX_BLOCKS_IN_FLIGHT {
            let height = self.next_height;
            let Some(hash) = self.chain.hash_at(height) else { break };
            if self.downloaded.contains_key(&height) || self.requests.contains_key(&hash) {
                self.next_height += 1;
                continue;
            }
            let Some(peer) = self.pick_peer(&ids, height) else { break };
            self.requests.insert(hash, Request { height, peer, at: now });
            batches
                .entry(peer)
                .or_default()
                .push(Inventory::Unknown { inv_type: MSG_FILTERED_BLOCK, hash: hash.to_byte_array() });
            self.next_height += 1;
        }
        for (peer, inv) in batches {
            tracing::debug!(peer, blocks = inv.len(), "Requesting filtered blocks");
            cmds.push(Command::Send { peer, msg: NetworkMessage::GetData(inv) });
        }
    }

    fn pick_peer(&mut self, ids: &[PeerId], height: u32) -> Option<PeerId> {
        for _ in 0..ids.len() {
            let id = ids[self.round_robin % ids.len()];
            self.round_robin = self.round_robin.wrapping_add(1);
            if self.peers.get(&id).map_or(false, |p| p.best_height >= height) {
                return Some(id);
            }
        }
        None
    }

    /// Mark blocks mined well before the wallet existed as processed without
    /// downloading them.
    fn skip_before_birth(&mut self, cmds: &mut Vec<Command>) {
        if !self.requests.is_empty() || !self.downloaded.is_empty() {
            return;
        }
        let mut skip_to = None;
        while let Some(stored) = self.chain.header_at(self.next_height) {
            if stored.header.time as i64 + BIRTH_SLACK_SECS >= self.birth_time {
                break;
            }
            skip_to = Some((stored.height, stored.hash));
            self.next_height += 1;
        }
        if let Some((height, hash)) = skip_to {
            tracing::debug!(height, "Skipped blocks before wallet birth");
            self.processed = height;
            cmds.push(Command::ApplyBlock { height, hash, txs: Vec::new() });
        }
    }

    fn update_phase(&mut self) {
        self.phase = if !self.running || self.cancelled {
            SyncPhase::Idle
        } else if self.peers.is_empty() {
            SyncPhase::Connecting
        } else if self.phase == SyncPhase::HeaderSync && self.header_peer.is_some() {
            SyncPhase::HeaderSync
        } else if self.processed >= self.chain.height() && self.requests.is_empty() && self.downloaded.is_empty() {
            SyncPhase::Synced
        } else {
            SyncPhase::BlockDownload
        };
    }
}

//! End-to-end sync against an in-process fake full node: handshake, header
//! sync, filtered block download, broadcast, and restart from stored headers.

mod common;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use beespv::net::codec::MessageCodec;
use beespv::net::{BloomFilter, BoxedStream};
use beespv::{Connector, Fault, KdfParams, ManagerConfig, SyncPhase, WalletEvent, WalletManager};
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::consensus::serialize;
use bitcoin::hashes::Hash;
use bitcoin::merkle_tree::MerkleBlock;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_bloom::FilterLoad;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Address as WireAddress, ServiceFlags};
use bitcoin::{Block, BlockHash, Network, OutPoint, Transaction, Txid};
use common::{mine, pay, stranger, wallet};
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use tempfile::TempDir;
use tokio::io::DuplexStream;
use tokio::sync::broadcast;
use tokio_util::codec::Framed;

static SERIAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const MSG_FILTERED_BLOCK: u32 = 3;

/// Serves a fixed regtest chain and records transactions and filters pushed
/// to it.
#[derive(Clone)]
struct FakeNode {
    blocks: Arc<Vec<Block>>,
    wanted: Arc<HashSet<Txid>>,
    received: Arc<Mutex<Vec<Transaction>>>,
    filters: Arc<Mutex<Vec<FilterLoad>>>,
}

impl FakeNode {
    fn new(blocks: Vec<Block>, wanted: impl IntoIterator<Item = Txid>) -> Self {
        Self { blocks: Arc::new(blocks), wanted: Arc::new(wanted.into_iter().collect()), received: Arc::default(), filters: Arc::default() }
    }

    fn received(&self) -> Vec<Txid> { self.received.lock().unwrap().iter().map(Transaction::compute_txid).collect() }

    fn last_filter(&self) -> Option<BloomFilter> { self.filters.lock().unwrap().last().map(BloomFilter::from_filter_load) }

    /// Index of the first block after `hash`.
    fn after(&self, hash: &BlockHash) -> Option<usize> {
        if *hash == genesis_block(Network::Regtest).block_hash() {
            return Some(0);
        }
        self.blocks.iter().position(|b| b.block_hash() == *hash).map(|i| i + 1)
    }

    fn version(&self) -> VersionMessage {
        let any = SocketAddr::from(([127, 0, 0, 1], 18444));
        let mut v = VersionMessage::new(
            ServiceFlags::NETWORK | ServiceFlags::BLOOM,
            chrono::Utc::now().timestamp(),
            WireAddress::new(&any, ServiceFlags::NONE),
            WireAddress::new(&any, ServiceFlags::NONE),
            0xfeed,
            "/fake:0.1/".into(),
            self.blocks.len() as i32,
        );
        v.version = 70016;
        v
    }

    fn reply(&self, msg: NetworkMessage) -> Vec<NetworkMessage> {
        match msg {
            NetworkMessage::Version(_) => vec![NetworkMessage::Version(self.version()), NetworkMessage::Verack],
            NetworkMessage::Ping(nonce) => vec![NetworkMessage::Pong(nonce)],
            NetworkMessage::GetHeaders(req) => {
                let start = req.locator_hashes.iter().find_map(|h| self.after(h)).unwrap_or(0);
                vec![NetworkMessage::Headers(self.blocks[start..].iter().map(|b| b.header).collect())]
            }
            NetworkMessage::GetData(items) => {
                let mut out = Vec::new();
                for item in items {
                    let Inventory::Unknown { inv_type: MSG_FILTERED_BLOCK, hash } = item else { continue };
                    let Some(block) = self.blocks.iter().find(|b| b.block_hash().to_byte_array() == hash) else { continue };
                    out.push(NetworkMessage::MerkleBlock(MerkleBlock::from_block_with_predicate(block, |t| self.wanted.contains(t))));
                    out.extend(block.txdata.iter().filter(|t| self.wanted.contains(&t.compute_txid())).cloned().map(NetworkMessage::Tx));
                }
                out
            }
            NetworkMessage::Inv(items) => {
                let want: Vec<Inventory> = items.into_iter().filter(|i| matches!(i, Inventory::Transaction(_))).collect();
                if want.is_empty() { Vec::new() } else { vec![NetworkMessage::GetData(want)] }
            }
            NetworkMessage::Tx(tx) => {
                self.received.lock().unwrap().push(tx);
                Vec::new()
            }
            NetworkMessage::FilterLoad(load) => {
                self.filters.lock().unwrap().push(load);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    async fn serve(self, stream: DuplexStream) {
        let mut framed = Framed::new(stream, MessageCodec::new(Network::Regtest.magic()));
        while let Some(Ok(msg)) = framed.next().await {
            for reply in self.reply(msg) {
                if framed.send(reply).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Connector for FakeNode {
    async fn connect(&self, _addr: SocketAddr) -> std::io::Result<BoxedStream> {
        let (ours, theirs) = tokio::io::duplex(1 << 20);
        tokio::spawn(self.clone().serve(theirs));
        Ok(Box::new(ours))
    }
}

fn config(dir: &TempDir) -> ManagerConfig {
    ManagerConfig::new("sync")
        .with_network(Network::Regtest)
        .with_data_dir(dir.path())
        .with_kdf(KdfParams::insecure_fast())
        .with_min_depth(1)
        .with_peer(SocketAddr::from(([127, 0, 0, 1], 18444)))
        .with_dns_seeds(Vec::new())
        .disable_listening()
}

fn open(dir: &TempDir) -> WalletManager {
    let mut manager = WalletManager::new(config(dir)).unwrap();
    manager.set_fault_handler(Arc::new(|f: &Fault| eprintln!("fault in {}: {}", f.context, f.error))).unwrap();
    manager
}

fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    done()
}

fn drain(events: &mut broadcast::Receiver<WalletEvent>) -> Vec<WalletEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(e) => out.push(e),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

fn synced_to(manager: &WalletManager, height: u32) -> bool {
    let s = manager.sync_state();
    s.phase == SyncPhase::Synced && s.current_height == height
}

#[test]
fn syncs_payment_broadcasts_send_and_resumes_after_restart() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = TempDir::new().unwrap();

    let mut manager = open(&dir);
    manager.initialize().unwrap();
    manager.create_wallet(None).unwrap();
    let ours = manager.wallet_address().unwrap().unwrap();

    let base = (chrono::Utc::now().timestamp() - 3 * 3600) as u32;
    let payment = pay(ours.script_pubkey(), 50_000, 7);
    let genesis = genesis_block(Network::Regtest).header;
    let b1 = mine(&genesis, base, Vec::new(), 1);
    let b2 = mine(&b1.header, base + 600, vec![payment.clone()], 2);
    let b3 = mine(&b2.header, base + 1200, Vec::new(), 3);
    let tip_time = b3.header.time;
    let node = FakeNode::new(vec![b1, b2, b3], [payment.compute_txid()]);

    manager.set_connector(Arc::new(node.clone())).unwrap();
    let mut events = manager.subscribe();
    manager.start_blockchain().unwrap();

    assert!(wait_until(Duration::from_secs(30), || synced_to(&manager, 3)), "state {:?}", manager.sync_state());
    let balance = manager.balance().unwrap();
    assert_eq!((balance.confirmed, balance.unconfirmed), (50_000, 0));
    assert_eq!(manager.last_block_creation_time(), Some(tip_time as i64));
    assert_eq!(manager.peer_count(), 1);

    let seen = drain(&mut events);
    assert!(seen.contains(&WalletEvent::EngineStarted));
    assert!(seen.contains(&WalletEvent::CoinsReceived { txid: payment.compute_txid(), amount: 50_000 }));
    assert!(seen.iter().any(|e| matches!(e, WalletEvent::BalanceChanged(b) if b.confirmed == 50_000)));

    // peers learn the new coin so a spend of it without change still matches
    let coin = serialize(&OutPoint { txid: payment.compute_txid(), vout: 0 });
    assert!(wait_until(Duration::from_secs(5), || node.last_filter().map_or(false, |f| f.contains(&coin))));

    manager.prepare_send(20_000, &stranger(3).to_string(), Some("rent"), None).unwrap();
    let txid = manager.commit_send().unwrap();
    assert!(wait_until(Duration::from_secs(10), || node.received().contains(&txid)));
    assert!(wait_until(Duration::from_secs(5), || drain(&mut events).contains(&WalletEvent::TransactionBroadcast { txid })));
    assert_eq!(manager.transaction_count().unwrap(), 2);

    manager.stop().unwrap();
    drop(manager);

    let mut manager = open(&dir);
    manager.initialize().unwrap();
    manager.load_wallet().unwrap();
    manager.set_connector(Arc::new(node.clone())).unwrap();
    manager.start_blockchain().unwrap();
    // headers and processed height come back from disk
    assert_eq!(manager.sync_state().header_height, 3);
    assert!(wait_until(Duration::from_secs(30), || synced_to(&manager, 3)));
    let sent = manager.transaction_by_hash(txid).unwrap().unwrap();
    assert_eq!(sent.comment.as_deref(), Some("rent"));
    assert_eq!(sent.amount, -(20_000 + sent.fee.unwrap() as i64));
}

#[test]
fn cancel_resume_and_resync_while_running() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = TempDir::new().unwrap();
    let mut manager = open(&dir);
    manager.initialize().unwrap();
    manager.create_wallet(None).unwrap();
    assert!(manager.cancel_sync().is_err());

    let ours = manager.wallet_address().unwrap().unwrap();
    let payment = pay(ours.script_pubkey(), 30_000, 5);
    let base = (chrono::Utc::now().timestamp() - 3600) as u32;
    let b1 = mine(&genesis_block(Network::Regtest).header, base, vec![payment.clone()], 1);
    manager.set_connector(Arc::new(FakeNode::new(vec![b1], [payment.compute_txid()]))).unwrap();
    manager.start_blockchain().unwrap();
    assert!(wait_until(Duration::from_secs(30), || synced_to(&manager, 1)));
    assert_eq!(manager.balance().unwrap().confirmed, 30_000);

    manager.cancel_sync().unwrap();
    assert!(wait_until(Duration::from_secs(5), || manager.sync_state().phase == SyncPhase::Idle));
    manager.resume_sync().unwrap();
    assert!(wait_until(Duration::from_secs(10), || synced_to(&manager, 1)));

    let mut events = manager.subscribe();
    manager.resync_blockchain().unwrap();
    let txid = payment.compute_txid();
    // the confirmation is dropped, then found again
    assert!(wait_until(Duration::from_secs(10), || drain(&mut events).contains(&WalletEvent::TransactionChanged { txid })));
    assert!(wait_until(Duration::from_secs(30), || synced_to(&manager, 1)));
    assert!(wait_until(Duration::from_secs(10), || manager.balance().map_or(false, |b| b.confirmed == 30_000)));
    manager.stop().unwrap();
}

#[test]
fn import_while_running_rescans_history() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = TempDir::new().unwrap();
    let backup = dir.path().join("restored.backup");
    let restored = wallet(dir.path(), "restored", 1);
    let theirs = restored.current_address().unwrap();
    restored.export_to(&backup).unwrap();
    drop(restored);

    let base = (chrono::Utc::now().timestamp() - 3 * 3600) as u32;
    let payment = pay(theirs.script_pubkey(), 40_000, 9);
    let b1 = mine(&genesis_block(Network::Regtest).header, base, vec![payment.clone()], 1);
    let b2 = mine(&b1.header, base + 600, Vec::new(), 2);
    let b3 = mine(&b2.header, base + 1200, Vec::new(), 3);
    let node = FakeNode::new(vec![b1, b2, b3], [payment.compute_txid()]);

    let mut manager = open(&dir);
    manager.initialize().unwrap();
    manager.create_wallet(None).unwrap();
    manager.set_connector(Arc::new(node)).unwrap();
    manager.start_blockchain().unwrap();
    assert!(wait_until(Duration::from_secs(30), || synced_to(&manager, 3)));
    assert_eq!(manager.balance().unwrap().total(), 0);

    // the payment sits below the tip the engine already processed
    manager.import_wallet(&backup).unwrap();
    assert_eq!(manager.wallet_address().unwrap(), Some(theirs));
    assert!(wait_until(Duration::from_secs(30), || manager.balance().map_or(false, |b| b.confirmed == 40_000)));
    assert!(wait_until(Duration::from_secs(10), || synced_to(&manager, 3)));
    manager.stop().unwrap();
}

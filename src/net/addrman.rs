//! Address book - known peers, retry backoff and soft bans
//!
//! Failures back off exponentially from 30s; misbehavior starts at ten
//! minutes. Both cap out so a peer is never forgotten forever. Persisted as
//! `{app}.peers` next to the wallet.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::core::fs::write_atomic;
use crate::error::{Result, WalletError};

const FAILURE_BASE_SECS: i64 = 30;
const BAN_BASE_SECS: i64 = 600;
const MAX_BACKOFF_SECS: i64 = 3600;
const MAX_BAN_SECS: i64 = 24 * 3600;
const MAX_ENTRIES: usize = 2048;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    #[serde(default)]
    failures: u32,
    #[serde(default)]
    strikes: u32,
    #[serde(default)]
    retry_after: Option<i64>,
    #[serde(default)]
    last_success: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredBook {
    peers: Vec<StoredPeer>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPeer {
    addr: String,
    #[serde(flatten)]
    entry: Entry,
}

#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    entries: HashMap<SocketAddr, Entry>,
}

fn backoff(base: i64, n: u32, cap: i64) -> i64 {
    base.saturating_mul(1i64 << n.saturating_sub(1).min(20)).min(cap)
}

impl AddressBook {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn contains(&self, addr: &SocketAddr) -> bool { self.entries.contains_key(addr) }

    /// Returns true when the address was new.
    pub fn add(&mut self, addr: SocketAddr) -> bool {
        if self.entries.len() >= MAX_ENTRIES || self.entries.contains_key(&addr) {
            return false;
        }
        self.entries.insert(addr, Entry::default());
        true
    }

    pub fn add_many(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> usize {
        addrs.into_iter().filter(|a| self.add(*a)).count()
    }

    pub fn record_success(&mut self, addr: SocketAddr, now: i64) {
        let entry = self.entries.entry(addr).or_default();
        entry.failures = 0;
        entry.retry_after = None;
        entry.last_success = Some(now);
    }

    pub fn record_failure(&mut self, addr: SocketAddr, now: i64) {
        let entry = self.entries.entry(addr).or_default();
        entry.failures = entry.failures.saturating_add(1);
        let wait = backoff(FAILURE_BASE_SECS, entry.failures, MAX_BACKOFF_SECS);
        entry.retry_after = Some(entry.retry_after.unwrap_or(0).max(now + wait));
    }

    /// Temporarily unusable after a protocol violation.
    pub fn soft_ban(&mut self, addr: SocketAddr, now: i64) {
        let entry = self.entries.entry(addr).or_default();
        entry.strikes = entry.strikes.saturating_add(1);
        let wait = backoff(BAN_BASE_SECS, entry.strikes, MAX_BAN_SECS);
        entry.retry_after = Some(entry.retry_after.unwrap_or(0).max(now + wait));
        tracing::info!(peer = %addr, secs = wait, "Peer soft-banned");
    }

    pub fn is_usable(&self, addr: &SocketAddr, now: i64) -> bool {
        self.entries.get(addr).map_or(true, |e| e.retry_after.map_or(true, |t| now >= t))
    }

    /// Usable addresses, recently good ones first.
    pub fn candidates(&self, now: i64, exclude: &[SocketAddr], limit: usize) -> Vec<SocketAddr> {
        let mut out: Vec<(&SocketAddr, &Entry)> = self
            .entries
            .iter()
            .filter(|(a, e)| !exclude.contains(a) && e.retry_after.map_or(true, |t| now >= t))
            .collect();
        out.sort_by(|(a1, e1), (a2, e2)| {
            e2.last_success
                .cmp(&e1.last_success)
                .then(e1.failures.cmp(&e2.failures))
                .then(a1.cmp(a2))
        });
        out.into_iter().take(limit).map(|(a, _)| *a).collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut peers: Vec<StoredPeer> =
            self.entries.iter().map(|(a, e)| StoredPeer { addr: a.to_string(), entry: e.clone() }).collect();
        peers.sort_by(|a, b| a.addr.cmp(&b.addr));
        write_atomic(path, &serde_json::to_vec_pretty(&StoredBook { peers })?)
    }

    /// Missing file is an empty book. Unparseable entries are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = std::fs::read(path).map_err(|e| WalletError::storage("peer file read", e))?;
        let stored: StoredBook = serde_json::from_slice(&bytes)?;
        let entries = stored
            .peers
            .into_iter()
            .filter_map(|p| p.addr.parse::<SocketAddr>().ok().map(|a| (a, p.entry)))
            .collect();
        Ok(Self { entries })
    }
}

pub fn default_port(network: Network) -> u16 {
    match network {
        Network::Bitcoin => 8333,
        Network::Testnet => 18333,
        Network::Signet => 38333,
        _ => 18444,
    }
}

pub fn dns_seeds(network: Network) -> &'static [&'static str] {
    match network {
        Network::Bitcoin => &[
            "seed.bitcoin.sipa.be",
            "dnsseed.bluematt.me",
            "seed.bitcoinstats.com",
            "seed.bitcoin.jonasschnelli.ch",
            "seed.btc.petertodd.net",
            "seed.bitcoin.sprovoost.nl",
            "dnsseed.emzy.de",
            "seed.bitcoin.wiz.biz",
        ],
        Network::Testnet => &[
            "testnet-seed.bitcoin.jonasschnelli.ch",
            "seed.tbtc.petertodd.net",
            "seed.testnet.bitcoin.sprovoost.nl",
            "testnet-seed.bluematt.me",
        ],
        Network::Signet => &["seed.signet.bitcoin.sprovoost.nl"],
        _ => &[],
    }
}

/// Resolve seeds to peer addresses. Seeds that fail or stall are skipped.
pub async fn resolve_seeds(seeds: &[String], port: u16, timeout: Duration) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for seed in seeds {
        match tokio::time::timeout(timeout, tokio::net::lookup_host((seed.as_str(), port))).await {
            Ok(Ok(addrs)) => {
                let before = out.len();
                out.extend(addrs);
                tracing::debug!(seed = %seed, found = out.len() - before, "DNS seed resolved");
            }
            Ok(Err(e)) => tracing::debug!(seed = %seed, error = %e, "DNS seed failed"),
            Err(_) => tracing::debug!(seed = %seed, "DNS seed timed out"),
        }
    }
    out
}

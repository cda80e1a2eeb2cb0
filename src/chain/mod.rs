//! HeaderChain - validated block headers and fork choice
//!
//! ```text
//!   headers: BlockHash -> StoredHeader   (every valid header seen, all branches)
//!   active:  [base, base+1, ..., tip]    (hashes on the most-work chain)
//! ```
//!
//! A header is accepted when it links to a known header, its hash meets its
//! own target, the target is within the network's proof-of-work limit, the
//! difficulty is unchanged between retarget heights (where the network
//! enforces that), and its timestamp is after the median of the previous 11
//! and not more than two hours in the future. Retarget arithmetic itself is
//! not checked.
//!
//! The active chain is the branch with the most cumulative work. Connecting a
//! header that makes another branch heavier returns a [`Reorg`] describing
//! what left and what joined the active chain.

pub mod store;

use std::collections::HashMap;

use bitcoin::block::Header;
use bitcoin::constants::genesis_block;
use bitcoin::params::Params;
use bitcoin::{BlockHash, Network, Work};

/// Blocks younger than this relative to local time are rejected.
pub const MAX_FUTURE_BLOCK_SECS: i64 = 2 * 60 * 60;
const MEDIAN_TIME_SPAN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u32,
    pub header: Header,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHeader {
    pub header: Header,
    pub hash: BlockHash,
    pub height: u32,
    pub chain_work: Work,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("header does not connect (prev {0})")]
    Unconnected(BlockHash),
    #[error("proof of work does not meet target")]
    BadProofOfWork,
    #[error("target above network limit")]
    TargetAboveLimit,
    #[error("difficulty changed outside retarget at height {0}")]
    BadDifficulty(u32),
    #[error("timestamp not after median time past")]
    TimeTooOld,
    #[error("timestamp too far in the future")]
    TimeTooNew,
}

impl HeaderError {
    /// Whether the peer that sent the header should be penalized. Headers that
    /// merely fail to connect can come from an honest peer on a stale view.
    pub fn is_misbehavior(&self) -> bool { !matches!(self, Self::Unconnected(_)) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reorg {
    pub fork_height: u32,
    /// Former active hashes above the fork, lowest first.
    pub disconnected: Vec<BlockHash>,
    /// New active hashes above the fork, lowest first.
    pub connected: Vec<(u32, BlockHash)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connected {
    Extended { height: u32 },
    Reorg(Reorg),
    SideChain { height: u32 },
    Duplicate,
}

pub struct HeaderChain {
    network: Network,
    params: Params,
    headers: HashMap<BlockHash, StoredHeader>,
    active: Vec<BlockHash>,
    base_height: u32,
}

impl std::fmt::Debug for HeaderChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderChain")
            .field("network", &self.network)
            .field("base", &self.base_height)
            .field("height", &self.height())
            .finish()
    }
}

impl HeaderChain {
    /// Chain rooted at the network's genesis block.
    pub fn new(network: Network) -> Self { Self::rooted(network, 0, genesis_block(network).header) }

    /// Chain rooted at a trusted header, for wallets born after genesis.
    pub fn from_checkpoint(network: Network, checkpoint: Checkpoint) -> Self {
        Self::rooted(network, checkpoint.height, checkpoint.header)
    }

    fn rooted(network: Network, height: u32, header: Header) -> Self {
        let hash = header.block_hash();
        let root = StoredHeader { header, hash, height, chain_work: header.work() };
        Self {
            network,
            params: Params::new(network),
            headers: HashMap::from([(hash, root)]),
            active: vec![hash],
            base_height: height,
        }
    }

    pub fn network(&self) -> Network { self.network }
    pub fn base_height(&self) -> u32 { self.base_height }
    pub fn height(&self) -> u32 { self.base_height + self.active.len() as u32 - 1 }

    pub fn tip(&self) -> &StoredHeader {
        let hash = self.active[self.active.len() - 1];
        &self.headers[&hash]
    }

    pub fn base(&self) -> &StoredHeader { &self.headers[&self.active[0]] }
    pub fn get(&self, hash: &BlockHash) -> Option<&StoredHeader> { self.headers.get(hash) }
    pub fn contains(&self, hash: &BlockHash) -> bool { self.headers.contains_key(hash) }

    pub fn hash_at(&self, height: u32) -> Option<BlockHash> {
        height.checked_sub(self.base_height).and_then(|i| self.active.get(i as usize)).copied()
    }

    pub fn header_at(&self, height: u32) -> Option<&StoredHeader> { self.hash_at(height).and_then(|h| self.headers.get(&h)) }

    pub fn is_active(&self, hash: &BlockHash) -> bool {
        self.headers.get(hash).map_or(false, |s| self.hash_at(s.height) == Some(*hash))
    }

    /// Active headers from `height` to the tip.
    pub fn active_from(&self, height: u32) -> impl Iterator<Item = &StoredHeader> {
        let start = height.saturating_sub(self.base_height) as usize;
        self.active.iter().skip(start).map(move |h| &self.headers[h])
    }

    /// Block locator: the last ten hashes, then exponentially sparser, always
    /// ending with the chain base.
    pub fn locator(&self) -> Vec<BlockHash> {
        let mut hashes = Vec::new();
        let mut height = self.height() as i64;
        let mut step = 1i64;
        while height > self.base_height as i64 {
            if let Some(h) = self.hash_at(height as u32) {
                hashes.push(h);
            }
            if hashes.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        hashes.push(self.active[0]);
        hashes
    }

    fn median_time_past(&self, from: &StoredHeader) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(from);
        while let Some(h) = cursor {
            times.push(h.header.time);
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            cursor = self.headers.get(&h.header.prev_blockhash);
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Check `header` against its parent; returns the parent.
    pub fn validate(&self, header: &Header) -> Result<&StoredHeader, HeaderError> {
        let parent = self.headers.get(&header.prev_blockhash).ok_or(HeaderError::Unconnected(header.prev_blockhash))?;
        let height = parent.height + 1;

        let target = header.target();
        if target > self.params.pow_limit {
            return Err(HeaderError::TargetAboveLimit);
        }
        header.validate_pow(target).map_err(|_| HeaderError::BadProofOfWork)?;

        let interval = (self.params.pow_target_timespan / self.params.pow_target_spacing.max(1)) as u32;
        let enforce_bits = !self.params.no_pow_retargeting && !self.params.allow_min_difficulty_blocks;
        if enforce_bits && interval > 0 && height % interval != 0 && header.bits != parent.header.bits {
            return Err(HeaderError::BadDifficulty(height));
        }

        if header.time <= self.median_time_past(parent) {
            return Err(HeaderError::TimeTooOld);
        }
        if header.time as i64 > chrono::Utc::now().timestamp() + MAX_FUTURE_BLOCK_SECS {
            return Err(HeaderError::TimeTooNew);
        }
        Ok(parent)
    }

    pub fn connect(&mut self, header: Header) -> Result<Connected, HeaderError> {
        let hash = header.block_hash();
        if self.headers.contains_key(&hash) {
            return Ok(Connected::Duplicate);
        }
        let (height, chain_work) = {
            let parent = self.validate(&header)?;
            (parent.height + 1, parent.chain_work + header.work())
        };
        let extends_tip = header.prev_blockhash == self.tip().hash;
        let heavier = chain_work > self.tip().chain_work;
        self.headers.insert(hash, StoredHeader { header, hash, height, chain_work });

        if extends_tip {
            self.active.push(hash);
            return Ok(Connected::Extended { height });
        }
        if !heavier {
            tracing::debug!(%hash, height, "Side-chain header");
            return Ok(Connected::SideChain { height });
        }

        let mut branch = Vec::new();
        let mut cursor = hash;
        while !self.is_active(&cursor) {
            let h = &self.headers[&cursor];
            branch.push((h.height, cursor));
            cursor = h.header.prev_blockhash;
        }
        let fork_height = self.headers[&cursor].height;
        let keep = (fork_height - self.base_height + 1) as usize;
        let disconnected = self.active.split_off(keep);
        branch.reverse();
        self.active.extend(branch.iter().map(|(_, h)| *h));
        tracing::info!(fork_height, disconnected = disconnected.len(), connected = branch.len(), "Reorganized header chain");
        Ok(Connected::Reorg(Reorg { fork_height, disconnected, connected: branch }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bitcoin::block::Version;
    use bitcoin::hashes::Hash;
    use bitcoin::{CompactTarget, TxMerkleNode};

    /// Mine a regtest header on top of `prev`.
    pub(crate) fn mine(prev: &Header, merkle_root: TxMerkleNode, salt: u32) -> Header {
        let mut header = Header {
            version: Version::from_consensus(4),
            prev_blockhash: prev.block_hash(),
            merkle_root,
            time: prev.time + 600 + salt,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce: 0,
        };
        while header.validate_pow(header.target()).is_err() {
            header.nonce += 1;
        }
        header
    }

    pub(crate) fn extend(chain: &mut HeaderChain, from: &Header, n: usize, salt: u32) -> Vec<Header> {
        let mut out = Vec::new();
        let mut prev = *from;
        for _ in 0..n {
            let h = mine(&prev, TxMerkleNode::all_zeros(), salt);
            chain.connect(h).unwrap();
            out.push(h);
            prev = h;
        }
        out
    }

    #[test]
    fn genesis_root() {
        let chain = HeaderChain::new(Network::Regtest);
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.tip().hash, genesis_block(Network::Regtest).block_hash());
        assert_eq!(chain.locator(), vec![chain.tip().hash]);
    }

    #[test]
    fn extends_and_rejects_unconnected() {
        let mut chain = HeaderChain::new(Network::Regtest);
        let genesis = chain.tip().header;
        let hs = extend(&mut chain, &genesis, 3, 0);
        assert_eq!(chain.height(), 3);
        assert_eq!(chain.hash_at(2), Some(hs[1].block_hash()));
        assert_eq!(chain.connect(hs[2]).unwrap(), Connected::Duplicate);

        let mut orphan = mine(&hs[2], TxMerkleNode::all_zeros(), 0);
        orphan.prev_blockhash = BlockHash::all_zeros();
        assert!(matches!(chain.connect(orphan), Err(HeaderError::Unconnected(_))));
    }

    #[test]
    fn rejects_bad_work() {
        let mut chain = HeaderChain::new(Network::Regtest);
        let genesis = chain.tip().header;
        let mut h = mine(&genesis, TxMerkleNode::all_zeros(), 0);
        // find a nonce that fails the target
        while h.validate_pow(h.target()).is_ok() {
            h.nonce += 1;
        }
        let err = chain.connect(h).unwrap_err();
        assert_eq!(err, HeaderError::BadProofOfWork);
        assert!(err.is_misbehavior());
        assert_eq!(chain.height(), 0);
    }

    #[test]
    fn rejects_time_before_median() {
        let mut chain = HeaderChain::new(Network::Regtest);
        let genesis = chain.tip().header;
        let hs = extend(&mut chain, &genesis, 2, 0);
        let mut h = mine(&hs[1], TxMerkleNode::all_zeros(), 0);
        h.time = genesis.time;
        while h.validate_pow(h.target()).is_err() {
            h.nonce += 1;
        }
        assert_eq!(chain.connect(h), Err(HeaderError::TimeTooOld));
    }

    #[test]
    fn heavier_branch_reorgs() {
        let mut chain = HeaderChain::new(Network::Regtest);
        let genesis = chain.tip().header;
        let a = extend(&mut chain, &genesis, 3, 0);

        let b1 = mine(&a[0], TxMerkleNode::all_zeros(), 7);
        let b2 = mine(&b1, TxMerkleNode::all_zeros(), 7);
        assert_eq!(chain.connect(b1).unwrap(), Connected::SideChain { height: 2 });
        assert_eq!(chain.connect(b2).unwrap(), Connected::SideChain { height: 3 });
        assert_eq!(chain.tip().hash, a[2].block_hash());

        let b3 = mine(&b2, TxMerkleNode::all_zeros(), 7);
        match chain.connect(b3).unwrap() {
            Connected::Reorg(r) => {
                assert_eq!(r.fork_height, 1);
                assert_eq!(r.disconnected, vec![a[1].block_hash(), a[2].block_hash()]);
                assert_eq!(r.connected, vec![(2, b1.block_hash()), (3, b2.block_hash()), (4, b3.block_hash())]);
            }
            other => panic!("expected reorg, got {other:?}"),
        }
        assert_eq!(chain.height(), 4);
        assert!(!chain.is_active(&a[2].block_hash()));
    }

    #[test]
    fn locator_is_sparse_and_ends_at_base() {
        let mut chain = HeaderChain::new(Network::Regtest);
        let genesis = chain.tip().header;
        extend(&mut chain, &genesis, 40, 0);
        let loc = chain.locator();
        assert_eq!(loc[0], chain.tip().hash);
        assert_eq!(*loc.last().unwrap(), genesis.block_hash());
        assert!(loc.len() < 20);
    }

    #[test]
    fn checkpoint_root() {
        let mut chain = HeaderChain::new(Network::Regtest);
        let genesis = chain.tip().header;
        let hs = extend(&mut chain, &genesis, 5, 0);
        let mut cp = HeaderChain::from_checkpoint(Network::Regtest, Checkpoint { height: 5, header: hs[4] });
        assert_eq!(cp.height(), 5);
        let next = mine(&hs[4], TxMerkleNode::all_zeros(), 0);
        assert_eq!(cp.connect(next).unwrap(), Connected::Extended { height: 6 });
        assert_eq!(cp.hash_at(4), None);
    }
}

//! WalletLedger - transaction history, UTXO set, balances
//!
//! ```text
//!   records: Vec<TxRecord>  (append-only, index = arrival order)
//!   index:   Txid -> position in records
//!   utxos:   OutPoint -> Utxo          (only from transactions in blocks)
//!   by_height: height -> sum(unspent value at that height)
//! ```
//!
//! Balances are two running totals split at the maturity boundary
//! `tip + 1 - min_depth`: outputs at or below it are confirmed, the rest are
//! unconfirmed. Adding or removing a UTXO touches one total; moving the tip
//! moves only the heights that cross the boundary. `confirmed + unconfirmed`
//! always equals the sum of the UTXO set.
//!
//! Reserved outputs (inputs of a committed but unconfirmed send) still count
//! toward the balance until the spend confirms; they are just not selectable.

mod view;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::str::FromStr;

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::{Network, OutPoint, Script, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WalletError};
pub use view::{Category, Confidence, TxDetail, TxView};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: ScriptBuf,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TxState {
    Pending,
    Confirmed { height: u32 },
    Dead,
}

#[derive(Debug, Clone)]
pub struct TxRecord {
    pub tx: Transaction,
    pub txid: Txid,
    pub state: TxState,
    pub fee: Option<u64>,
    pub comment: Option<String>,
    pub seen_at: i64,
    /// Value of our outputs this transaction spends.
    pub sent: u64,
    /// Value of outputs paying our scripts.
    pub received: u64,
    /// Our UTXOs removed when the transaction confirmed. Restored on reorg.
    consumed: Vec<Utxo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub confirmed: u64,
    pub unconfirmed: u64,
}

impl Balance {
    pub fn total(&self) -> u64 { self.confirmed + self.unconfirmed }
}

/// Outcome of applying a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxChange {
    pub txid: Txid,
    pub received: u64,
    pub sent: u64,
    pub is_new: bool,
    /// Pending transactions killed by this one spending the same outputs.
    pub dead: Vec<Txid>,
}

impl TxChange {
    pub fn coins_received(&self) -> bool { self.received > self.sent }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    txid: Txid,
    since: i64,
}

#[derive(Debug)]
pub struct Ledger {
    network: Network,
    min_depth: u32,
    watched: HashSet<ScriptBuf>,
    records: Vec<TxRecord>,
    index: HashMap<Txid, usize>,
    utxos: BTreeMap<OutPoint, Utxo>,
    reserved: HashMap<OutPoint, Reservation>,
    by_height: BTreeMap<u32, u64>,
    confirmed: u64,
    unconfirmed: u64,
    tip: Option<u32>,
    processed_height: Option<u32>,
}

impl Ledger {
    pub fn new(network: Network, min_depth: u32) -> Self {
        Self {
            network,
            min_depth: min_depth.max(1),
            watched: HashSet::new(),
            records: Vec::new(),
            index: HashMap::new(),
            utxos: BTreeMap::new(),
            reserved: HashMap::new(),
            by_height: BTreeMap::new(),
            confirmed: 0,
            unconfirmed: 0,
            tip: None,
            processed_height: None,
        }
    }

    pub fn min_depth(&self) -> u32 { self.min_depth }
    pub fn tip(&self) -> Option<u32> { self.tip }
    pub fn processed_height(&self) -> Option<u32> { self.processed_height }
    pub fn set_processed_height(&mut self, height: u32) { self.processed_height = Some(height); }

    pub fn watch(&mut self, script: ScriptBuf) { self.watched.insert(script); }
    pub fn is_mine(&self, script: &Script) -> bool { self.watched.contains(script) }
    pub fn watched_scripts(&self) -> impl Iterator<Item = &ScriptBuf> { self.watched.iter() }

    /// O(1): the running totals.
    pub fn balance(&self) -> Balance { Balance { confirmed: self.confirmed, unconfirmed: self.unconfirmed } }

    pub fn is_relevant(&self, tx: &Transaction) -> bool {
        self.index.contains_key(&tx.compute_txid())
            || tx.output.iter().any(|o| self.watched.contains(&o.script_pubkey))
            || tx.input.iter().any(|i| self.utxos.contains_key(&i.previous_output))
    }

    /// Apply a transaction found in a block at `height`. Irrelevant
    /// transactions and repeats at the same height return `None`.
    pub fn apply_confirmed_transaction(&mut self, tx: &Transaction, height: u32) -> Option<TxChange> {
        let txid = tx.compute_txid();
        let existing = self.index.get(&txid).copied();
        if let Some(i) = existing {
            if let TxState::Confirmed { .. } = self.records[i].state {
                return None;
            }
        }
        if existing.is_none() && !self.is_relevant(tx) {
            return None;
        }
        if self.tip.map_or(true, |t| t < height) {
            self.set_tip(height);
        }

        let mut consumed = Vec::new();
        let mut dead = Vec::new();
        for input in &tx.input {
            if let Some(utxo) = self.remove_utxo(&input.previous_output) {
                consumed.push(utxo);
            }
            if let Some(r) = self.reserved.remove(&input.previous_output) {
                if r.txid != txid && !dead.contains(&r.txid) {
                    dead.push(r.txid);
                }
            }
        }
        let mut received = 0;
        for (vout, out) in tx.output.iter().enumerate() {
            if self.watched.contains(&out.script_pubkey) {
                received += out.value.to_sat();
                self.add_utxo(Utxo {
                    outpoint: OutPoint { txid, vout: vout as u32 },
                    value: out.value.to_sat(),
                    script_pubkey: out.script_pubkey.clone(),
                    height,
                });
            }
        }
        let sent: u64 = consumed.iter().map(|u| u.value).sum();
        let fee = if !consumed.is_empty() && consumed.len() == tx.input.len() {
            let out_total: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
            sent.checked_sub(out_total)
        } else {
            None
        };

        let state = TxState::Confirmed { height };
        match existing {
            Some(i) => {
                let rec = &mut self.records[i];
                rec.state = state;
                rec.sent = rec.sent.max(sent);
                rec.received = received;
                rec.fee = rec.fee.or(fee);
                rec.consumed = consumed;
            }
            None => self.push_record(TxRecord {
                tx: tx.clone(),
                txid,
                state,
                fee,
                comment: None,
                seen_at: chrono::Utc::now().timestamp(),
                sent,
                received,
                consumed,
            }),
        }
        for other in &dead {
            self.kill(other);
        }
        Some(TxChange { txid, received, sent, is_new: existing.is_none(), dead })
    }

    /// Record a signed send of ours and reserve its inputs.
    pub fn record_pending(&mut self, tx: &Transaction, fee: u64, comment: Option<String>) -> Result<TxChange> {
        let txid = tx.compute_txid();
        if self.index.contains_key(&txid) {
            return Err(WalletError::Unknown(format!("transaction {txid} already recorded")));
        }
        let mut sent = 0;
        for input in &tx.input {
            let utxo = self
                .utxos
                .get(&input.previous_output)
                .ok_or_else(|| WalletError::Unknown(format!("input {} is not ours", input.previous_output)))?;
            if self.reserved.contains_key(&input.previous_output) {
                return Err(WalletError::Unknown(format!("input {} already reserved", input.previous_output)));
            }
            sent += utxo.value;
        }
        let now = chrono::Utc::now().timestamp();
        for input in &tx.input {
            self.reserved.insert(input.previous_output, Reservation { txid, since: now });
        }
        let received = self.value_to_us(tx);
        self.push_record(TxRecord {
            tx: tx.clone(),
            txid,
            state: TxState::Pending,
            fee: Some(fee),
            comment,
            seen_at: now,
            sent,
            received,
            consumed: Vec::new(),
        });
        Ok(TxChange { txid, received, sent, is_new: true, dead: Vec::new() })
    }

    /// Record a relevant unconfirmed transaction relayed by a peer. History
    /// only; the UTXO set changes once it is mined.
    pub fn record_incoming_pending(&mut self, tx: &Transaction) -> Option<TxChange> {
        let txid = tx.compute_txid();
        if self.index.contains_key(&txid) || !self.is_relevant(tx) {
            return None;
        }
        let sent: u64 = tx.input.iter().filter_map(|i| self.utxos.get(&i.previous_output)).map(|u| u.value).sum();
        let received = self.value_to_us(tx);
        self.push_record(TxRecord {
            tx: tx.clone(),
            txid,
            state: TxState::Pending,
            fee: None,
            comment: None,
            seen_at: chrono::Utc::now().timestamp(),
            sent,
            received,
            consumed: Vec::new(),
        });
        Some(TxChange { txid, received, sent, is_new: true, dead: Vec::new() })
    }

    /// Revert every transaction confirmed above `height` (all of them for
    /// `None`), newest first. Reverted spends keep their inputs reserved.
    pub fn unconfirm_above(&mut self, height: Option<u32>) -> Vec<Txid> {
        let above = |h: u32| height.map_or(true, |k| h > k);
        let mut affected: Vec<(u32, usize)> = self
            .records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| match r.state {
                TxState::Confirmed { height: h } if above(h) => Some((h, i)),
                _ => None,
            })
            .collect();
        affected.sort_unstable_by(|a, b| b.cmp(a));

        let now = chrono::Utc::now().timestamp();
        let mut reverted = Vec::with_capacity(affected.len());
        for (_, i) in affected {
            let txid = self.records[i].txid;
            for vout in 0..self.records[i].tx.output.len() {
                self.remove_utxo(&OutPoint { txid, vout: vout as u32 });
            }
            let consumed = std::mem::take(&mut self.records[i].consumed);
            for utxo in consumed {
                self.reserved.insert(utxo.outpoint, Reservation { txid, since: now });
                self.add_utxo(utxo);
            }
            self.records[i].state = TxState::Pending;
            reverted.push(txid);
        }

        match height {
            Some(h) => {
                if self.tip.map_or(false, |t| t > h) {
                    self.set_tip(h);
                }
                if self.processed_height.map_or(false, |p| p > h) {
                    self.processed_height = Some(h);
                }
            }
            None => {
                self.tip = None;
                self.processed_height = None;
                self.recompute_totals();
            }
        }
        reverted
    }

    /// Move the chain tip the ledger measures depth against.
    pub fn set_tip(&mut self, tip: u32) {
        let old = self.boundary(self.tip);
        let new = self.boundary(Some(tip));
        self.tip = Some(tip);
        match (old, new) {
            (o, n) if o == n => {}
            (o, Some(n)) if o.map_or(true, |o| o < n) => {
                let moved = self.sum_heights(o, n);
                self.unconfirmed -= moved;
                self.confirmed += moved;
            }
            (Some(o), n) => {
                let moved = self.sum_heights(n, o);
                self.confirmed -= moved;
                self.unconfirmed += moved;
            }
            _ => {}
        }
    }

    /// Release reservations older than `timeout_secs`; their pending sends die.
    pub fn release_expired_reservations(&mut self, now: i64, timeout_secs: i64) -> Vec<Txid> {
        let mut expired: Vec<Txid> = self
            .reserved
            .values()
            .filter(|r| now - r.since >= timeout_secs)
            .map(|r| r.txid)
            .collect();
        expired.sort_unstable();
        expired.dedup();
        for txid in &expired {
            self.kill(txid);
        }
        expired
    }

    pub fn is_reserved(&self, outpoint: &OutPoint) -> bool { self.reserved.contains_key(outpoint) }
    pub fn utxos(&self) -> impl Iterator<Item = &Utxo> { self.utxos.values() }

    /// Mature, unreserved outputs in outpoint order.
    pub fn spendable_utxos(&self) -> Vec<Utxo> {
        let boundary = self.boundary(self.tip);
        self.utxos
            .values()
            .filter(|u| boundary.map_or(false, |b| u.height <= b))
            .filter(|u| !self.reserved.contains_key(&u.outpoint))
            .cloned()
            .collect()
    }

    /// Full rescan check of the running totals.
    pub fn reconcile(&self) -> bool {
        let boundary = self.boundary(self.tip);
        let (mut confirmed, mut unconfirmed) = (0u64, 0u64);
        for u in self.utxos.values() {
            if boundary.map_or(false, |b| u.height <= b) {
                confirmed += u.value;
            } else {
                unconfirmed += u.value;
            }
        }
        confirmed == self.confirmed && unconfirmed == self.unconfirmed
    }

    pub fn transaction_count(&self) -> usize { self.records.len() }

    pub fn record(&self, txid: &Txid) -> Option<&TxRecord> { self.index.get(txid).map(|&i| &self.records[i]) }

    pub fn transaction_by_hash(&self, txid: &Txid) -> Option<TxView> { self.record(txid).map(|r| self.view(r)) }

    /// Newest first. Walks the list, so this is O(n); prefer
    /// [`Ledger::all_transactions`] for bulk reads.
    pub fn transaction_at(&self, index: usize) -> Option<TxView> {
        self.records.iter().rev().nth(index).map(|r| self.view(r))
    }

    /// Newest first; `limit == 0` means no limit.
    pub fn all_transactions(&self, limit: usize) -> Vec<TxView> {
        let take = if limit == 0 { usize::MAX } else { limit };
        self.records.iter().rev().take(take).map(|r| self.view(r)).collect()
    }

    pub fn transactions_range(&self, from: usize, count: usize) -> Vec<TxView> {
        self.records.iter().rev().skip(from).take(count).map(|r| self.view(r)).collect()
    }

    /// Our own unconfirmed sends, oldest first. Rebroadcast on startup.
    pub fn pending_sends(&self) -> Vec<Transaction> {
        self.records.iter().filter(|r| r.state == TxState::Pending && r.sent > 0).map(|r| r.tx.clone()).collect()
    }

    fn view(&self, record: &TxRecord) -> TxView {
        TxView::from_record(record, self.tip, self.network, |s| self.watched.contains(s))
    }

    fn value_to_us(&self, tx: &Transaction) -> u64 {
        tx.output.iter().filter(|o| self.watched.contains(&o.script_pubkey)).map(|o| o.value.to_sat()).sum()
    }

    fn push_record(&mut self, record: TxRecord) {
        self.index.insert(record.txid, self.records.len());
        self.records.push(record);
    }

    fn kill(&mut self, txid: &Txid) {
        self.reserved.retain(|_, r| r.txid != *txid);
        if let Some(&i) = self.index.get(txid) {
            if self.records[i].state == TxState::Pending {
                self.records[i].state = TxState::Dead;
                tracing::info!(%txid, "Transaction dead");
            }
        }
    }

    /// Highest mature height for `tip`, if any.
    fn boundary(&self, tip: Option<u32>) -> Option<u32> { tip.and_then(|t| (t + 1).checked_sub(self.min_depth)) }

    fn is_mature(&self, height: u32) -> bool { self.boundary(self.tip).map_or(false, |b| height <= b) }

    /// Sum of unspent value in heights `(lo, hi]`.
    fn sum_heights(&self, lo: Option<u32>, hi: u32) -> u64 {
        let start = lo.map_or(Bound::Unbounded, Bound::Excluded);
        self.by_height.range((start, Bound::Included(hi))).map(|(_, v)| *v).sum()
    }

    fn add_utxo(&mut self, utxo: Utxo) {
        if self.utxos.contains_key(&utxo.outpoint) {
            return;
        }
        *self.by_height.entry(utxo.height).or_insert(0) += utxo.value;
        if self.is_mature(utxo.height) {
            self.confirmed += utxo.value;
        } else {
            self.unconfirmed += utxo.value;
        }
        self.utxos.insert(utxo.outpoint, utxo);
    }

    fn remove_utxo(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        let utxo = self.utxos.remove(outpoint)?;
        if let Some(sum) = self.by_height.get_mut(&utxo.height) {
            *sum -= utxo.value;
            if *sum == 0 {
                self.by_height.remove(&utxo.height);
            }
        }
        if self.is_mature(utxo.height) {
            self.confirmed -= utxo.value;
        } else {
            self.unconfirmed -= utxo.value;
        }
        Some(utxo)
    }

    fn recompute_totals(&mut self) {
        self.by_height.clear();
        self.confirmed = 0;
        self.unconfirmed = 0;
        let utxos: Vec<Utxo> = std::mem::take(&mut self.utxos).into_values().collect();
        for u in utxos {
            self.add_utxo(u);
        }
    }
}

// =============================================================================
// Persistence
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredUtxo {
    pub outpoint: String,
    pub value: u64,
    pub script: String,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTx {
    pub raw: String,
    #[serde(flatten)]
    pub state: TxState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub seen_at: i64,
    pub sent: u64,
    pub received: u64,
    #[serde(default)]
    pub consumed: Vec<StoredUtxo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredReservation {
    pub outpoint: String,
    pub txid: String,
    pub since: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredLedger {
    pub records: Vec<StoredTx>,
    pub utxos: Vec<StoredUtxo>,
    #[serde(default)]
    pub reserved: Vec<StoredReservation>,
    #[serde(default)]
    pub tip: Option<u32>,
    #[serde(default)]
    pub processed_height: Option<u32>,
}

impl StoredUtxo {
    fn from_utxo(u: &Utxo) -> Self {
        Self { outpoint: u.outpoint.to_string(), value: u.value, script: hex::encode(u.script_pubkey.as_bytes()), height: u.height }
    }

    fn into_utxo(self) -> Result<Utxo> {
        let outpoint = OutPoint::from_str(&self.outpoint).map_err(|e| WalletError::storage("outpoint", e))?;
        let script = hex::decode(&self.script).map_err(|e| WalletError::storage("script hex", e))?;
        Ok(Utxo { outpoint, value: self.value, script_pubkey: ScriptBuf::from_bytes(script), height: self.height })
    }
}

impl Ledger {
    pub fn to_stored(&self) -> StoredLedger {
        let records = self
            .records
            .iter()
            .map(|r| StoredTx {
                raw: hex::encode(serialize(&r.tx)),
                state: r.state,
                fee: r.fee,
                comment: r.comment.clone(),
                seen_at: r.seen_at,
                sent: r.sent,
                received: r.received,
                consumed: r.consumed.iter().map(StoredUtxo::from_utxo).collect(),
            })
            .collect();
        let mut reserved: Vec<StoredReservation> = self
            .reserved
            .iter()
            .map(|(op, r)| StoredReservation { outpoint: op.to_string(), txid: r.txid.to_string(), since: r.since })
            .collect();
        reserved.sort_by(|a, b| a.outpoint.cmp(&b.outpoint));
        StoredLedger {
            records,
            utxos: self.utxos.values().map(StoredUtxo::from_utxo).collect(),
            reserved,
            tip: self.tip,
            processed_height: self.processed_height,
        }
    }

    /// Rebuild from storage. Watched scripts are not stored; the caller
    /// re-registers them from the key store.
    pub fn from_stored(stored: StoredLedger, network: Network, min_depth: u32, watched: Vec<ScriptBuf>) -> Result<Self> {
        let mut ledger = Self::new(network, min_depth);
        ledger.watched.extend(watched);
        ledger.tip = stored.tip;
        ledger.processed_height = stored.processed_height;
        for s in stored.records {
            let raw = hex::decode(&s.raw).map_err(|e| WalletError::storage("tx hex", e))?;
            let tx: Transaction = deserialize(&raw).map_err(|e| WalletError::storage("tx decode", e))?;
            let consumed = s.consumed.into_iter().map(StoredUtxo::into_utxo).collect::<Result<Vec<_>>>()?;
            ledger.push_record(TxRecord {
                txid: tx.compute_txid(),
                tx,
                state: s.state,
                fee: s.fee,
                comment: s.comment,
                seen_at: s.seen_at,
                sent: s.sent,
                received: s.received,
                consumed,
            });
        }
        for u in stored.utxos {
            ledger.add_utxo(u.into_utxo()?);
        }
        for r in stored.reserved {
            let outpoint = OutPoint::from_str(&r.outpoint).map_err(|e| WalletError::storage("outpoint", e))?;
            let txid = Txid::from_str(&r.txid).map_err(|e| WalletError::storage("txid", e))?;
            ledger.reserved.insert(outpoint, Reservation { txid, since: r.since });
        }
        Ok(ledger)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, Sequence, TxIn, TxOut, Witness};

    pub(crate) fn script(tag: u8) -> ScriptBuf {
        let mut bytes = vec![0x00, 0x14];
        bytes.extend([tag; 20]);
        ScriptBuf::from_bytes(bytes)
    }

    pub(crate) fn tx(inputs: &[OutPoint], outputs: &[(u8, u64)]) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .iter()
                .map(|op| TxIn { previous_output: *op, script_sig: ScriptBuf::new(), sequence: Sequence::MAX, witness: Witness::new() })
                .collect(),
            output: outputs.iter().map(|(tag, v)| TxOut { value: Amount::from_sat(*v), script_pubkey: script(*tag) }).collect(),
        }
    }

    pub(crate) fn foreign(n: u8) -> OutPoint { OutPoint { txid: Txid::from_byte_array([n; 32]), vout: 0 } }

    fn ledger(depth: u32) -> Ledger {
        let mut l = Ledger::new(Network::Regtest, depth);
        l.watch(script(1));
        l
    }

    #[test]
    fn fresh_ledger_zero_balance() {
        let l = ledger(6);
        assert_eq!(l.balance(), Balance::default());
        assert_eq!(l.transaction_count(), 0);
        assert!(l.reconcile());
    }

    #[test]
    fn receive_matures_at_depth() {
        let mut l = ledger(6);
        let funding = tx(&[foreign(9)], &[(1, 50_000)]);
        let change = l.apply_confirmed_transaction(&funding, 100).unwrap();
        assert!(change.coins_received());
        assert_eq!(l.balance(), Balance { confirmed: 0, unconfirmed: 50_000 });
        l.set_tip(104);
        assert_eq!(l.balance().confirmed, 0);
        l.set_tip(105);
        assert_eq!(l.balance(), Balance { confirmed: 50_000, unconfirmed: 0 });
        assert_eq!(l.transaction_at(0).unwrap().confirmations, 6);
        assert!(l.reconcile());
    }

    #[test]
    fn irrelevant_and_duplicate_ignored() {
        let mut l = ledger(1);
        assert!(l.apply_confirmed_transaction(&tx(&[foreign(1)], &[(2, 10)]), 5).is_none());
        let t = tx(&[foreign(2)], &[(1, 10)]);
        assert!(l.apply_confirmed_transaction(&t, 5).is_some());
        assert!(l.apply_confirmed_transaction(&t, 5).is_none());
        assert_eq!(l.transaction_count(), 1);
    }

    #[test]
    fn pending_send_reserves_then_confirms() {
        let mut l = ledger(1);
        let funding = tx(&[foreign(1)], &[(1, 10_000)]);
        l.apply_confirmed_transaction(&funding, 10);
        let op = OutPoint { txid: funding.compute_txid(), vout: 0 };
        let spend = tx(&[op], &[(2, 7_000), (1, 2_500)]);
        l.record_pending(&spend, 500, Some("rent".into())).unwrap();
        assert!(l.is_reserved(&op));
        assert!(l.spendable_utxos().is_empty());
        assert_eq!(l.balance().total(), 10_000);

        l.apply_confirmed_transaction(&spend, 11);
        assert!(!l.is_reserved(&op));
        assert_eq!(l.balance().total(), 2_500);
        let view = l.transaction_by_hash(&spend.compute_txid()).unwrap();
        assert_eq!(view.amount, -7_500);
        assert_eq!(view.fee, Some(500));
        assert_eq!(view.comment.as_deref(), Some("rent"));
        assert!(l.reconcile());
    }

    #[test]
    fn conflicting_confirmation_kills_pending() {
        let mut l = ledger(1);
        let funding = tx(&[foreign(1)], &[(1, 10_000)]);
        l.apply_confirmed_transaction(&funding, 10);
        let op = OutPoint { txid: funding.compute_txid(), vout: 0 };
        let ours = tx(&[op], &[(2, 9_000)]);
        l.record_pending(&ours, 1_000, None).unwrap();
        let rival = tx(&[op], &[(3, 9_500)]);
        let change = l.apply_confirmed_transaction(&rival, 11).unwrap();
        assert_eq!(change.dead, vec![ours.compute_txid()]);
        assert_eq!(l.transaction_by_hash(&ours.compute_txid()).unwrap().confidence, Confidence::Dead);
    }

    #[test]
    fn unconfirm_above_reverts_and_reserves() {
        let mut l = ledger(1);
        let funding = tx(&[foreign(1)], &[(1, 10_000)]);
        l.apply_confirmed_transaction(&funding, 10);
        let op = OutPoint { txid: funding.compute_txid(), vout: 0 };
        let spend = tx(&[op], &[(2, 9_000)]);
        l.apply_confirmed_transaction(&spend, 12);
        assert_eq!(l.balance().total(), 0);

        let reverted = l.unconfirm_above(Some(11));
        assert_eq!(reverted, vec![spend.compute_txid()]);
        assert_eq!(l.balance().total(), 10_000);
        assert!(l.is_reserved(&op));
        assert_eq!(l.tip(), Some(11));
        assert!(l.reconcile());
    }

    #[test]
    fn expired_reservation_releases_inputs() {
        let mut l = ledger(1);
        let funding = tx(&[foreign(1)], &[(1, 10_000)]);
        l.apply_confirmed_transaction(&funding, 10);
        let op = OutPoint { txid: funding.compute_txid(), vout: 0 };
        let spend = tx(&[op], &[(2, 9_000)]);
        l.record_pending(&spend, 1_000, None).unwrap();
        let now = chrono::Utc::now().timestamp();
        assert!(l.release_expired_reservations(now, 3_600).is_empty());
        assert_eq!(l.release_expired_reservations(now + 3_600, 3_600), vec![spend.compute_txid()]);
        assert_eq!(l.spendable_utxos().len(), 1);
    }

    #[test]
    fn history_is_newest_first() {
        let mut l = ledger(1);
        let a = tx(&[foreign(1)], &[(1, 1)]);
        let b = tx(&[foreign(2)], &[(1, 2)]);
        l.apply_confirmed_transaction(&a, 1);
        l.apply_confirmed_transaction(&b, 2);
        assert_eq!(l.transaction_at(0).unwrap().txid, b.compute_txid());
        assert_eq!(l.all_transactions(0).len(), 2);
        assert_eq!(l.all_transactions(1).len(), 1);
        assert_eq!(l.transactions_range(1, 5)[0].txid, a.compute_txid());
        assert!(l.transaction_at(2).is_none());
    }

    #[test]
    fn stored_round_trip() {
        let mut l = ledger(3);
        let funding = tx(&[foreign(1)], &[(1, 10_000), (1, 5_000)]);
        l.apply_confirmed_transaction(&funding, 10);
        let op = OutPoint { txid: funding.compute_txid(), vout: 1 };
        l.record_pending(&tx(&[op], &[(2, 4_000)]), 1_000, None).unwrap();
        let restored = Ledger::from_stored(l.to_stored(), Network::Regtest, 3, vec![script(1)]).unwrap();
        assert_eq!(restored.balance(), l.balance());
        assert!(restored.is_reserved(&op));
        assert_eq!(restored.all_transactions(0), l.all_transactions(0));
        assert!(restored.reconcile());
    }
}

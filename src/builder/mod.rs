//! TransactionBuilder - coin selection, fees, signing
//!
//! A send is two steps with a single staging slot between them:
//!
//! ```text
//!   prepare_send ──► [staged: unsigned tx, inputs, fee] ──► commit_prepared ──► signed tx
//!         │                       │
//!         └── replaces ───────────┴── clear_prepared
//! ```
//!
//! Preparing never reserves coins. Reservation happens when the caller records
//! the committed transaction in the ledger.

pub mod fee;
pub mod selection;

use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use crate::error::{Result, WalletError};
use crate::keystore::{DerivedKey, KeyStore};
use crate::ledger::{Ledger, Utxo};
pub use selection::{select_coins, Selection};

/// What the host sees after a successful prepare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSend {
    pub txid: Txid,
    pub amount: u64,
    pub fee: u64,
    pub destination: Address,
}

/// A signed transaction ready for the ledger and the network.
#[derive(Debug, Clone)]
pub struct SignedSend {
    pub tx: Transaction,
    pub fee: u64,
    pub comment: Option<String>,
}

struct Staged {
    tx: Transaction,
    inputs: Vec<(Utxo, usize)>,
    prepared: PreparedSend,
    comment: Option<String>,
    signing_key: Option<DerivedKey>,
}

pub struct TransactionBuilder {
    fee_rate: u64,
    staged: Option<Staged>,
}

impl TransactionBuilder {
    pub fn new(fee_rate: u64) -> Self { Self { fee_rate, staged: None } }

    pub fn fee_rate(&self) -> u64 { self.fee_rate }
    pub fn set_fee_rate(&mut self, sat_per_vb: u64) { self.fee_rate = sat_per_vb; }
    pub fn has_prepared(&self) -> bool { self.staged.is_some() }
    pub fn prepared(&self) -> Option<&PreparedSend> { self.staged.as_ref().map(|s| &s.prepared) }

    /// Select coins and stage an unsigned transaction. Any previously staged
    /// transaction is discarded first, even if this one fails.
    pub fn prepare_send(
        &mut self,
        keys: &KeyStore,
        ledger: &Ledger,
        amount: u64,
        destination: &str,
        comment: Option<&str>,
        passphrase: Option<&str>,
    ) -> Result<PreparedSend> {
        self.staged = None;

        let destination = Address::from_str(destination.trim())
            .map_err(|e| WalletError::Unknown(format!("malformed destination: {e}")))?
            .require_network(keys.network())
            .map_err(|e| WalletError::Unknown(format!("destination network: {e}")))?;

        // Only an explicit passphrase is staged; otherwise commit reads the
        // lock state at signing time.
        let signing_key = match (keys.is_encrypted(), passphrase) {
            (false, _) => None,
            (true, Some(pass)) => match keys.signing_key(Some(pass)) {
                Ok(k) => k,
                Err(WalletError::WrongPassphrase) => return Err(WalletError::EncryptionRequired),
                Err(e) => return Err(e),
            },
            (true, None) if keys.is_locked() => return Err(WalletError::EncryptionRequired),
            (true, None) => None,
        };

        let change_script = keys.change_script().ok_or_else(|| WalletError::Unknown("wallet has no keys".into()))?;
        let dest_script = destination.script_pubkey();
        let sel = select_coins(&ledger.spendable_utxos(), amount, dest_script.len(), change_script.len(), self.fee_rate)?;

        let mut inputs = Vec::with_capacity(sel.inputs.len());
        for utxo in sel.inputs {
            let key_index = keys
                .find_by_script(&utxo.script_pubkey)
                .ok_or_else(|| WalletError::Unknown(format!("no key for {}", utxo.outpoint)))?;
            inputs.push((utxo, key_index));
        }
        let tx = unsigned_tx(&inputs, dest_script, amount, change_script, sel.change);

        let prepared = PreparedSend { txid: tx.compute_txid(), amount, fee: sel.fee, destination };
        tracing::info!(txid = %prepared.txid, amount, fee = sel.fee, inputs = inputs.len(), "Prepared send");
        self.staged = Some(Staged {
            tx,
            inputs,
            prepared: prepared.clone(),
            comment: comment.map(str::to_string),
            signing_key,
        });
        Ok(prepared)
    }

    /// Sign the staged transaction. The slot empties only on success, so a
    /// `WalletLocked` failure can be retried after unlocking.
    pub fn commit_prepared(&mut self, keys: &KeyStore) -> Result<SignedSend> {
        let staged = self.staged.as_ref().ok_or_else(|| WalletError::invalid_state("commit", "nothing is prepared"))?;
        let key = match &staged.signing_key {
            Some(k) => Some(k.clone()),
            None => keys.signing_key(None)?,
        };
        let tx = sign(keys, key.as_ref(), &staged.tx, &staged.inputs)?;
        let staged = self.staged.take().ok_or_else(|| WalletError::invalid_state("commit", "nothing is prepared"))?;
        tracing::info!(txid = %staged.prepared.txid, "Signed send");
        Ok(SignedSend { tx, fee: staged.prepared.fee, comment: staged.comment })
    }

    pub fn clear_prepared(&mut self) { self.staged = None; }
}

fn unsigned_tx(inputs: &[(Utxo, usize)], dest: ScriptBuf, amount: u64, change_script: ScriptBuf, change: u64) -> Transaction {
    let mut output = vec![TxOut { value: Amount::from_sat(amount), script_pubkey: dest }];
    if change > 0 {
        output.push(TxOut { value: Amount::from_sat(change), script_pubkey: change_script });
    }
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|(u, _)| TxIn { previous_output: u.outpoint, script_sig: ScriptBuf::new(), sequence: Sequence::MAX, witness: Witness::new() })
            .collect(),
        output,
    }
}

fn sign(keys: &KeyStore, key: Option<&DerivedKey>, unsigned: &Transaction, inputs: &[(Utxo, usize)]) -> Result<Transaction> {
    let secp = Secp256k1::signing_only();
    let mut witnesses = Vec::with_capacity(inputs.len());
    {
        let mut cache = SighashCache::new(unsigned);
        for (i, (utxo, key_index)) in inputs.iter().enumerate() {
            let sk = keys.secret_key(*key_index, key)?;
            let sighash = cache
                .p2wpkh_signature_hash(i, &utxo.script_pubkey, Amount::from_sat(utxo.value), EcdsaSighashType::All)
                .map_err(|e| WalletError::Unknown(format!("sighash: {e}")))?;
            let msg = Message::from_digest(sighash.to_byte_array());
            let signature = ecdsa::Signature { signature: secp.sign_ecdsa(&msg, &sk), sighash_type: EcdsaSighashType::All };
            let mut witness = Witness::new();
            witness.push(signature.serialize());
            witness.push(keys.keys()[*key_index].public_key.0.serialize());
            witnesses.push(witness);
        }
    }
    let mut tx = unsigned.clone();
    for (input, witness) in tx.input.iter_mut().zip(witnesses) {
        input.witness = witness;
    }
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::KdfParams;
    use crate::ledger::tests::{foreign, tx};
    use bitcoin::Network;

    fn dest() -> String {
        let other = KeyStore::create(Network::Regtest, KdfParams::insecure_fast(), None).unwrap();
        other.current_address().unwrap().to_string()
    }

    fn funded(passphrase: Option<&str>, values: &[u64]) -> (KeyStore, Ledger) {
        let keys = KeyStore::create(Network::Regtest, KdfParams::insecure_fast(), passphrase).unwrap();
        let mut ledger = Ledger::new(Network::Regtest, 1);
        let script = keys.keys()[0].script_pubkey();
        ledger.watch(script.clone());
        for (n, v) in values.iter().enumerate() {
            let mut funding = tx(&[foreign(n as u8 + 1)], &[]);
            funding.output.push(TxOut { value: Amount::from_sat(*v), script_pubkey: script.clone() });
            ledger.apply_confirmed_transaction(&funding, 10);
        }
        (keys, ledger)
    }

    #[test]
    fn prepare_commit_signs_every_input() {
        let (keys, ledger) = funded(None, &[30_000, 30_000]);
        let mut b = TransactionBuilder::new(2);
        let prepared = b.prepare_send(&keys, &ledger, 45_000, &dest(), Some("hi"), None).unwrap();
        assert!(b.has_prepared());
        let signed = b.commit_prepared(&keys).unwrap();
        assert!(!b.has_prepared());
        assert_eq!(signed.tx.compute_txid(), prepared.txid);
        assert_eq!(signed.tx.input.len(), 2);
        assert!(signed.tx.input.iter().all(|i| i.witness.len() == 2));
        assert_eq!(signed.comment.as_deref(), Some("hi"));
        let out: u64 = signed.tx.output.iter().map(|o| o.value.to_sat()).sum();
        assert_eq!(out + signed.fee, 60_000);
    }

    #[test]
    fn clear_discards_stage_and_reserves_nothing() {
        let (keys, ledger) = funded(None, &[30_000]);
        let mut b = TransactionBuilder::new(1);
        b.prepare_send(&keys, &ledger, 10_000, &dest(), None, None).unwrap();
        b.clear_prepared();
        assert!(!b.has_prepared());
        let op = ledger.spendable_utxos()[0].outpoint;
        assert!(!ledger.is_reserved(&op));
        assert!(matches!(b.commit_prepared(&keys), Err(WalletError::InvalidState { .. })));
    }

    #[test]
    fn encrypted_wallet_needs_passphrase() {
        let (keys, ledger) = funded(Some("pw"), &[30_000]);
        let mut b = TransactionBuilder::new(1);
        assert!(matches!(b.prepare_send(&keys, &ledger, 10_000, &dest(), None, None), Err(WalletError::EncryptionRequired)));
        assert!(matches!(b.prepare_send(&keys, &ledger, 10_000, &dest(), None, Some("bad")), Err(WalletError::EncryptionRequired)));
        b.prepare_send(&keys, &ledger, 10_000, &dest(), None, Some("pw")).unwrap();
        b.commit_prepared(&keys).unwrap();
    }

    #[test]
    fn locked_commit_retries_after_unlock() {
        let (mut keys, ledger) = funded(Some("pw"), &[30_000]);
        keys.unlock("pw").unwrap();
        let mut b = TransactionBuilder::new(1);
        b.prepare_send(&keys, &ledger, 10_000, &dest(), None, None).unwrap();
        keys.lock();
        assert!(matches!(b.commit_prepared(&keys), Err(WalletError::WalletLocked)));
        assert!(b.has_prepared());
        keys.unlock("pw").unwrap();
        b.commit_prepared(&keys).unwrap();
    }

    #[test]
    fn bad_destination_is_unknown() {
        let (keys, ledger) = funded(None, &[30_000]);
        let mut b = TransactionBuilder::new(1);
        assert!(matches!(b.prepare_send(&keys, &ledger, 1_000, "not-an-address", None, None), Err(WalletError::Unknown(_))));
        // mainnet address on regtest
        let main = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
        assert!(matches!(b.prepare_send(&keys, &ledger, 1_000, main, None, None), Err(WalletError::Unknown(_))));
    }

    #[test]
    fn new_prepare_replaces_old() {
        let (keys, ledger) = funded(None, &[30_000]);
        let mut b = TransactionBuilder::new(1);
        b.prepare_send(&keys, &ledger, 1_000, &dest(), None, None).unwrap();
        let second = b.prepare_send(&keys, &ledger, 2_000, &dest(), None, None).unwrap();
        assert_eq!(b.prepared().unwrap().txid, second.txid);
        assert!(matches!(b.prepare_send(&keys, &ledger, 90_000, &dest(), None, None), Err(WalletError::InsufficientFunds { .. })));
        assert!(!b.has_prepared());
    }

    #[test]
    fn oversized_amounts_are_insufficient() {
        let (keys, ledger) = funded(None, &[50]);
        let mut b = TransactionBuilder::new(1);
        for amount in [100, 51, u64::MAX] {
            assert!(matches!(b.prepare_send(&keys, &ledger, amount, &dest(), None, None), Err(WalletError::InsufficientFunds { .. })));
        }
        assert!(!b.has_prepared());
    }
}

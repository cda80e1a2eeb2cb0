//! Shared fixtures: regtest wallets, funding transactions, mined blocks.

#![allow(dead_code)]

use std::path::Path;

use beespv::{KdfParams, Wallet, WalletSettings};
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Block, CompactTarget, CompressedPublicKey, Network, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxMerkleNode, TxOut, Txid, Witness,
};

pub fn settings(min_depth: u32) -> WalletSettings {
    WalletSettings::new(Network::Regtest).with_kdf(KdfParams::insecure_fast()).with_min_depth(min_depth)
}

pub fn wallet(dir: &Path, name: &str, min_depth: u32) -> Wallet {
    Wallet::create(dir.join(format!("{name}.wallet")), settings(min_depth), None).unwrap()
}

/// A transaction spending an outpoint nobody owns, paying `value` to `script`.
pub fn pay(script: ScriptBuf, value: u64, salt: u8) -> Transaction {
    spend(&[OutPoint { txid: Txid::from_byte_array([salt; 32]), vout: 0 }], vec![(script, value)])
}

pub fn spend(inputs: &[OutPoint], outputs: Vec<(ScriptBuf, u64)>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|op| TxIn { previous_output: *op, script_sig: ScriptBuf::new(), sequence: Sequence::MAX, witness: Witness::new() })
            .collect(),
        output: outputs.into_iter().map(|(script_pubkey, v)| TxOut { value: Amount::from_sat(v), script_pubkey }).collect(),
    }
}

/// Regtest address nobody in the test controls.
pub fn stranger(seed: u8) -> Address {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[seed.max(1); 32]).unwrap();
    Address::p2wpkh(&CompressedPublicKey(PublicKey::from_secret_key(&secp, &sk)), Network::Regtest)
}

/// Mine a regtest block on `prev` carrying `txs` (a filler tx when empty).
pub fn mine(prev: &Header, time: u32, mut txs: Vec<Transaction>, salt: u8) -> Block {
    if txs.is_empty() {
        txs.push(pay(stranger(salt).script_pubkey(), 1_000, salt));
    }
    let mut block = Block {
        header: Header {
            version: BlockVersion::from_consensus(4),
            prev_blockhash: prev.block_hash(),
            merkle_root: TxMerkleNode::all_zeros(),
            time,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce: 0,
        },
        txdata: txs,
    };
    block.header.merkle_root = block.compute_merkle_root().unwrap();
    while block.header.validate_pow(block.header.target()).is_err() {
        block.header.nonce += 1;
    }
    block
}

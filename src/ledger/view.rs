//! Read-only transaction views handed to the host.

use bitcoin::{Address, Network, Txid};
use serde::Serialize;
use serde_json::{json, Value};

use super::{TxRecord, TxState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Seen or broadcast, not in a block on the best chain.
    Pending,
    /// In a block on the best chain.
    Building,
    /// Double-spent or abandoned.
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Received,
    Sent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxDetail {
    pub address: Option<String>,
    pub value: u64,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxView {
    pub txid: Txid,
    /// Net effect on the wallet in satoshis (negative for spends).
    pub amount: i64,
    pub fee: Option<u64>,
    /// Unix seconds the wallet first saw the transaction.
    pub time: i64,
    pub confidence: Confidence,
    pub confirmations: u32,
    pub height: Option<u32>,
    pub comment: Option<String>,
    pub details: Vec<TxDetail>,
}

impl TxView {
    pub(crate) fn from_record(record: &TxRecord, tip: Option<u32>, network: Network, is_mine: impl Fn(&bitcoin::Script) -> bool) -> Self {
        let (confidence, height) = match record.state {
            TxState::Pending => (Confidence::Pending, None),
            TxState::Confirmed { height } => (Confidence::Building, Some(height)),
            TxState::Dead => (Confidence::Dead, None),
        };
        let confirmations = match (height, tip) {
            (Some(h), Some(t)) if t >= h => t - h + 1,
            _ => 0,
        };
        let outgoing = record.sent > 0;
        let details = record
            .tx
            .output
            .iter()
            .filter_map(|out| {
                let mine = is_mine(out.script_pubkey.as_script());
                let category = match (mine, outgoing) {
                    (true, _) => Category::Received,
                    (false, true) => Category::Sent,
                    (false, false) => return None,
                };
                let address = Address::from_script(&out.script_pubkey, network).ok().map(|a| a.to_string());
                Some(TxDetail { address, value: out.value.to_sat(), category })
            })
            .collect();
        Self {
            txid: record.txid,
            amount: record.received as i64 - record.sent as i64,
            fee: record.fee,
            time: record.seen_at,
            confidence,
            confirmations,
            height,
            comment: record.comment.clone(),
            details,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "txid": self.txid.to_string(),
            "amount": self.amount,
            "fee": self.fee,
            "time": self.time,
            "confidence": self.confidence,
            "confirmations": self.confirmations,
            "height": self.height,
            "comment": self.comment,
            "details": self.details,
        })
    }
}

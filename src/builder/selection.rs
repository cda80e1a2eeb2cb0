//! Largest-first coin selection.
//!
//! Candidates are ordered by value (descending), ties broken by outpoint, so
//! the same UTXO set always yields the same inputs. Coins are added until the
//! total covers `amount + fee`, where the fee is recomputed for the actual
//! input count after every addition. Change below the dust limit is dropped
//! into the fee. An amount the whole set cannot cover is reported as
//! insufficient before anything else is checked.

use super::fee::{estimate_vsize, fee_for, DUST_LIMIT, MAX_STANDARD_VBYTES};
use crate::error::{Result, WalletError};
use crate::ledger::Utxo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<Utxo>,
    pub fee: u64,
    /// Zero when no change output is created.
    pub change: u64,
}

pub fn select_coins(candidates: &[Utxo], amount: u64, dest_script_len: usize, change_script_len: usize, fee_rate: u64) -> Result<Selection> {
    let available = candidates.iter().fold(0u64, |acc, u| acc.saturating_add(u.value));
    let min_fee = fee_for(estimate_vsize(1, &[dest_script_len]), fee_rate);
    let insufficient = |needed: Option<u64>| WalletError::InsufficientFunds { needed: needed.unwrap_or(u64::MAX), available };
    match amount.checked_add(min_fee) {
        Some(needed) if needed <= available => {}
        needed => return Err(insufficient(needed)),
    }
    if amount < DUST_LIMIT {
        return Err(WalletError::Unknown(format!("amount {amount} is below the dust limit")));
    }
    let mut sorted: Vec<&Utxo> = candidates.iter().collect();
    sorted.sort_by(|a, b| b.value.cmp(&a.value).then(a.outpoint.cmp(&b.outpoint)));

    let mut inputs = Vec::new();
    let mut total = 0u64;
    for utxo in sorted {
        inputs.push(utxo.clone());
        total = total.saturating_add(utxo.value);

        let fee_no_change = fee_for(estimate_vsize(inputs.len(), &[dest_script_len]), fee_rate);
        match amount.checked_add(fee_no_change) {
            Some(target) if total >= target => {}
            Some(_) => continue,
            None => return Err(insufficient(None)),
        }
        let with_change = estimate_vsize(inputs.len(), &[dest_script_len, change_script_len]);
        if with_change > MAX_STANDARD_VBYTES {
            return Err(WalletError::Unknown(format!("transaction too large: {with_change} vB")));
        }
        let fee_with_change = fee_for(with_change, fee_rate);
        let change = amount.checked_add(fee_with_change).and_then(|spent| total.checked_sub(spent));
        if let Some(change) = change.filter(|c| *c >= DUST_LIMIT) {
            return Ok(Selection { inputs, fee: fee_with_change, change });
        }
        return Ok(Selection { inputs, fee: total - amount, change: 0 });
    }

    let needed = amount.checked_add(fee_for(estimate_vsize(inputs.len().max(1), &[dest_script_len]), fee_rate));
    Err(insufficient(needed))
}

//! Size-based fee estimation for P2WPKH spends.

/// Version, locktime, in/out counts and the segwit marker (10.5 vB, rounded up).
pub const TX_OVERHEAD_VBYTES: u64 = 11;
/// Outpoint, empty scriptSig, sequence, plus the discounted witness.
pub const P2WPKH_INPUT_VBYTES: u64 = 68;
pub const P2WPKH_OUTPUT_VBYTES: u64 = 31;
/// Outputs below this are not worth creating; they go to the fee instead.
pub const DUST_LIMIT: u64 = 294;
/// Floor applied to any configured rate, in sat/vB.
pub const MIN_RELAY_FEE_RATE: u64 = 1;
pub const MAX_STANDARD_VBYTES: u64 = 100_000;

/// vbytes of an output paying `script_len` bytes of scriptPubKey.
pub fn output_vbytes(script_len: usize) -> u64 {
    let len = script_len as u64;
    8 + compact_size_len(len) + len
}

pub fn estimate_vsize(inputs: usize, output_script_lens: &[usize]) -> u64 {
    TX_OVERHEAD_VBYTES
        + inputs as u64 * P2WPKH_INPUT_VBYTES
        + output_script_lens.iter().map(|l| output_vbytes(*l)).sum::<u64>()
}

pub fn fee_for(vsize: u64, sat_per_vb: u64) -> u64 { vsize.saturating_mul(sat_per_vb.max(MIN_RELAY_FEE_RATE)) }

fn compact_size_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2wpkh_output_matches_constant() {
        assert_eq!(output_vbytes(22), P2WPKH_OUTPUT_VBYTES);
    }

    #[test]
    fn one_in_two_out() {
        assert_eq!(estimate_vsize(1, &[22, 22]), 11 + 68 + 62);
        assert_eq!(fee_for(141, 0), 141);
        assert_eq!(fee_for(141, 5), 705);
    }
}

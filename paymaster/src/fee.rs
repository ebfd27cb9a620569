//{{ Paymaster }}
//Copyright (C) {{ 2021,2022,2023,2024 }}  {{ Blockstream }}

//This program is free software: you can redistribute it and/or modify
//it under the terms of the GNU Affero General Public License as published by
//the Free Software Foundation, either version 3 of the License, or
//(at your option) any later version.

//This program is distributed in the hope that it will be useful,
//but WITHOUT ANY WARRANTY; without even the implied warranty of
//MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//GNU Affero General Public License for more details.

//You should have received a copy of the GNU Affero General Public License
//along with this program.  If not, see <http://www.gnu.org/licenses/>.


//! # Fee & Selection Policy
//! Pure fee estimation and coin selection; no I/O. The node's relay
//! rules are the final arbiter of fees, so estimation errs on the
//! generous side.
//!

use std::{error, fmt};

use bitcoin::Amount;

use common::BlockHeight;
use common::constants::{TX_BASE_BYTES, TX_INPUT_BYTES, TX_OUTPUT_BYTES};
use rpc::UnspentOutput;

/// Selection error.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Error {
    /// The wallet has no output that passes the spendability filter.
    NoSpendableUtxos,
    /// The spendable outputs cannot cover the required amount.
    InsufficientFunds {
        /// What selection needed to cover
        required: Amount,
        /// Sum of all spendable outputs
        available: Amount,
        /// Number of spendable outputs considered
        utxo_count: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::NoSpendableUtxos => f.write_str("no spendable outputs in the wallet"),
            Error::InsufficientFunds { required, available, utxo_count } => write!(
                f, "spendable outputs cover {} of required {} ({} outputs)",
                available, required, utxo_count,
            ),
        }
    }
}

impl error::Error for Error {}

/// Estimate the fee of a transaction with `inputs` inputs and `outputs`
/// outputs at the given feerate (coin units per estimated byte). A pure
/// function of its arguments; `None` when the arithmetic overflows.
pub fn try_estimate(inputs: usize, outputs: usize, fee_rate: Amount) -> Option<Amount> {
    let bytes = (inputs as u64).checked_mul(TX_INPUT_BYTES)
        .and_then(|b| (outputs as u64).checked_mul(TX_OUTPUT_BYTES).and_then(|o| b.checked_add(o)))
        .and_then(|b| b.checked_add(TX_BASE_BYTES));
    bytes.and_then(|b| fee_rate.checked_mul(b))
}

/// [try_estimate] with a flat fallback for when the arithmetic cannot
/// produce a value. Callers that want to notice the fallback (they
/// should: it usually means a misconfigured feerate) use [try_estimate]
/// directly.
pub fn estimate(inputs: usize, outputs: usize, fee_rate: Amount, fallback: Amount) -> Amount {
    try_estimate(inputs, outputs, fee_rate).unwrap_or(fallback)
}

/// Whether an output passes the spendability filter: the wallet must
/// consider it spendable and it must have enough confirmations.
pub fn is_selectable(utxo: &UnspentOutput, min_confirmations: BlockHeight) -> bool {
    utxo.spendable && utxo.confirmations >= min_confirmations
}

/// Select unspent outputs to cover `required` (payments plus fee).
///
/// The spendable set is ordered by descending amount (outpoint order as
/// tiebreak, so selection is deterministic for a given unspent set).
/// When a single output covers the requirement, the smallest such output
/// is chosen, keeping large outputs available for later batches.
/// Otherwise outputs are accumulated largest-first until the requirement
/// is covered.
pub fn select_utxos(
    available: &[UnspentOutput],
    required: Amount,
    min_confirmations: BlockHeight,
) -> Result<Vec<UnspentOutput>, Error> {
    let mut candidates: Vec<&UnspentOutput> = available.iter()
        .filter(|utxo| is_selectable(utxo, min_confirmations))
        .collect();
    if candidates.is_empty() {
        return Err(Error::NoSpendableUtxos);
    }
    candidates.sort_by(|a, b| {
        b.amount.cmp(&a.amount)
            .then(a.txid.cmp(&b.txid))
            .then(a.vout.cmp(&b.vout))
    });

    // Prefer paying the whole batch from one output: sweep the
    // descending order backwards for the smallest output that covers.
    if let Some(single) = candidates.iter().rev().find(|utxo| utxo.amount >= required) {
        return Ok(vec![(*single).clone()]);
    }

    // Otherwise accumulate largest-first.
    let mut selected = Vec::new();
    let mut total = Amount::ZERO;
    for utxo in &candidates {
        selected.push((*utxo).clone());
        total += utxo.amount;
        if total >= required {
            return Ok(selected);
        }
    }

    Err(Error::InsufficientFunds {
        required: required,
        available: total,
        utxo_count: candidates.len(),
    })
}

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


//! # Disburser Engine
//!
//! Drives one batch of payments through validation, coin selection,
//! transaction construction, broadcast, journaling and pool
//! acknowledgement.
//!
//! The one invariant everything here is built around: the completion
//! journal is written exactly once per payment, at the moment the last
//! contributing broadcast returns a txid from the node, and before the
//! pool is notified. A journaled payment is never broadcast against
//! again; an un-journaled payment always stays pending on the pool and
//! is re-attempted by a later batch. Partial progress lives only in
//! memory for the duration of the batch -- the journal and the chain are
//! the only durable signals across runs.
//!
//! Two dispatch shapes. When coin selection covers the batch with one
//! input, a single transaction pays every payment at once (one output
//! per distinct address). Otherwise the batch streams: each selected
//! input funds its own single-input transaction toward the first
//! payment that is still owed money, so a lost process can never
//! rebroadcast a payment (the input is gone once the node accepts it)
//! and a miner simply receives the owed amount in increments.
//!

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use std::{cmp, error, fmt, thread};

use bitcoin;
use bitcoin::Amount;

use common::constants;
use common::{BatchCtx, BatchMode, BlockHeight, PaymentId};
use config;
use fee;
use journal::{self, FailureLog, FailureRecord, Journal};
use logs;
use pool::{Obligation, PoolApi};
use rpc::{self, ChainRpc, TxInput, UnspentOutput};
use utils::Shutdown;

/// Fatal engine error; the process must stop (exit code 2).
#[derive(Debug)]
pub enum Error {
    /// The journal could not record a payment whose transaction the node
    /// already accepted. Continuing would risk paying it a second time
    /// on a later run.
    Journal(journal::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Journal(ref e) => write!(f, "journal failure after broadcast: {}", e),
        }
    }
}

impl error::Error for Error {
    fn cause(&self) -> Option<&dyn error::Error> {
        match *self {
            Error::Journal(ref e) => Some(e),
        }
    }
}

#[doc(hidden)]
impl From<journal::Error> for Error {
    fn from(e: journal::Error) -> Error {
        Error::Journal(e)
    }
}

/// Terminal state of one payment within a batch. Only the first two
/// persist across runs (through the journal); the other two leave the
/// payment pending on the pool.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PaymentStatus {
    /// Paid in full and journaled by this batch.
    Succeeded,
    /// Journaled by an earlier batch; the chain was not touched.
    AlreadyCompleted,
    /// The batch ended before the payment reached its full amount.
    PartiallyPaid,
    /// The payment, or the whole batch, failed.
    Failed,
}

/// Per-payment outcome of one engine invocation.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PaymentResult {
    /// The payment this is the outcome of
    pub payment_id: PaymentId,
    /// Terminal state within this batch
    pub status: PaymentStatus,
    /// Amount broadcast toward the payment within this invocation
    pub completed: Amount,
    /// Transactions attributed to the payment in this invocation; for
    /// [PaymentStatus::AlreadyCompleted], the journaled transaction
    pub txids: Vec<bitcoin::Txid>,
    /// Failure reason, set iff the status is [PaymentStatus::Failed]
    pub error: Option<String>,
}

impl PaymentResult {
    fn already_completed(payment_id: PaymentId, txid: bitcoin::Txid) -> PaymentResult {
        PaymentResult {
            payment_id: payment_id,
            status: PaymentStatus::AlreadyCompleted,
            completed: Amount::ZERO,
            txids: vec![txid],
            error: None,
        }
    }

    fn failed(payment_id: PaymentId, reason: &str) -> PaymentResult {
        PaymentResult {
            payment_id: payment_id,
            status: PaymentStatus::Failed,
            completed: Amount::ZERO,
            txids: Vec::new(),
            error: Some(reason.to_owned()),
        }
    }
}

/// Engine tuning, distilled from the configuration.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Params {
    /// The pool whose payments this engine disburses
    pub pool_id: String,
    /// Feerate in coin units per estimated byte
    pub fee_rate: Amount,
    /// Fee used when fee arithmetic cannot produce a value
    pub fee_fallback: Amount,
    /// Threshold below which change is surrendered to fees
    pub dust_threshold: Amount,
    /// Confirmations required before a wallet output may be spent
    pub min_confirmations: BlockHeight,
    /// Change address; a fresh one is generated per batch when unset
    pub change_address: Option<String>,
}

impl Params {
    /// Distill engine tuning from the configuration.
    pub fn from_config(config: &config::Configuration) -> Params {
        Params {
            pool_id: config.pool.pool_id.clone(),
            fee_rate: config.chain.fee_per_byte,
            fee_fallback: config.chain.fee_fallback,
            dust_threshold: config.chain.dust_threshold,
            min_confirmations: config.chain.min_confirmations,
            change_address: config.chain.change_address.clone(),
        }
    }
}

/// In-memory state of one batch. Never persisted.
struct BatchState {
    /// Amount broadcast toward each payment so far.
    progress: HashMap<PaymentId, Amount>,
    /// Transactions attributed to each payment, in broadcast order.
    attributed: HashMap<PaymentId, Vec<bitcoin::Txid>>,
    /// All successful broadcasts of the batch, in order.
    successful_txids: Vec<bitcoin::Txid>,
}

impl BatchState {
    fn new() -> BatchState {
        BatchState {
            progress: HashMap::new(),
            attributed: HashMap::new(),
            successful_txids: Vec::new(),
        }
    }

    fn progress_of(&self, payment_id: PaymentId) -> Amount {
        self.progress.get(&payment_id).cloned().unwrap_or(Amount::ZERO)
    }

    fn txids_of(&self, payment_id: PaymentId) -> Vec<bitcoin::Txid> {
        self.attributed.get(&payment_id).cloned().unwrap_or_default()
    }

    fn record(&mut self, payment_id: PaymentId, txid: bitcoin::Txid, paid: Amount) {
        *self.progress.entry(payment_id).or_insert(Amount::ZERO) += paid;
        self.attributed.entry(payment_id).or_insert_with(Vec::new).push(txid);
        self.successful_txids.push(txid);
    }
}

/// The disburser engine. Owns the completion journal and the
/// failed-payment log; gateways are handed in per batch.
pub struct Engine {
    /// Engine tuning.
    params: Params,
    /// The completion journal.
    journal: Journal,
    /// The failed-payment log.
    failures: FailureLog,
    /// Number of batches run by this instance, for log context.
    batch_count: u64,
}

impl Engine {
    /// Create a new engine around an opened journal.
    pub fn new(params: Params, journal: Journal, failures: FailureLog) -> Engine {
        Engine {
            params: params,
            journal: journal,
            failures: failures,
            batch_count: 0,
        }
    }

    /// Accessor for the completion journal.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Accessor for the engine tuning.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Process one batch of payments. Returns one result per payment, in
    /// the order supplied. `Err` is reserved for fatal conditions (a
    /// journal that cannot record a broadcast payment); everything else
    /// is reported per payment.
    pub fn run_batch<C: ChainRpc, P: PoolApi>(
        &mut self,
        chain: &C,
        pool: &P,
        pending: &[Obligation],
        mode: BatchMode,
        shutdown: &Shutdown,
    ) -> Result<Vec<PaymentResult>, Error> {
        self.batch_count += 1;
        logs::set_batch_ctx(BatchCtx::new(self.batch_count, mode));

        let total = pending.iter().fold(Some(Amount::ZERO), |acc, p| {
            acc.and_then(|acc| acc.checked_add(p.amount))
        });
        slog!(BatchStarted, n_payments: pending.len(),
            total_sat: total.unwrap_or(Amount::ZERO).to_sat(),
        );

        let results = self.process(chain, pool, pending, shutdown)?;

        // Residual logging: every payment that is neither complete nor
        // journaled is operator-visible in the failed-payment log.
        for result in &results {
            match result.status {
                PaymentStatus::Failed | PaymentStatus::PartiallyPaid => {
                    let payment = pending.iter().find(|p| p.id == result.payment_id)
                        .expect("result for unknown payment");
                    let reason = match result.error {
                        Some(ref reason) => &reason[..],
                        None => "batch ended before completion",
                    };
                    self.failures.append(&FailureRecord {
                        payment_id: result.payment_id,
                        address: &payment.address,
                        required: payment.amount,
                        completed: result.completed,
                        txids: &result.txids,
                        reason: reason,
                    });
                }
                PaymentStatus::Succeeded | PaymentStatus::AlreadyCompleted => {}
            }
        }

        let mut n_succeeded = 0;
        let mut n_already = 0;
        let mut n_partial = 0;
        let mut n_failed = 0;
        let mut paid = Amount::ZERO;
        for result in &results {
            match result.status {
                PaymentStatus::Succeeded => n_succeeded += 1,
                PaymentStatus::AlreadyCompleted => n_already += 1,
                PaymentStatus::PartiallyPaid => n_partial += 1,
                PaymentStatus::Failed => n_failed += 1,
            }
            paid += result.completed;
        }
        slog!(BatchComplete, n_succeeded: n_succeeded, n_already_completed: n_already,
            n_partial: n_partial, n_failed: n_failed, paid_sat: paid.to_sat(),
        );

        logs::set_batch_ctx(BatchCtx {
            batch: self.batch_count,
            mode: BatchMode::Idle,
        });
        Ok(results)
    }

    fn process<C: ChainRpc, P: PoolApi>(
        &mut self,
        chain: &C,
        pool: &P,
        pending: &[Obligation],
        shutdown: &Shutdown,
    ) -> Result<Vec<PaymentResult>, Error> {
        let mut results: HashMap<PaymentId, PaymentResult> = HashMap::new();

        // Journal pre-scan: anything on record is done and the chain is
        // not touched for it.
        let mut work: Vec<&Obligation> = Vec::new();
        for payment in pending {
            if let Some(txid) = self.journal.transaction_of(payment.id) {
                slog!(SkipAlreadyCompleted, payment_id: payment.id, txid: txid);
                results.insert(payment.id, PaymentResult::already_completed(payment.id, txid));
            } else {
                work.push(payment);
            }
        }
        if work.is_empty() {
            return Ok(ordered(results, pending));
        }

        // Validation, fail fast: invalid data is never silently skipped,
        // it stops the whole batch.
        for payment in &work {
            let reason = if payment.amount == Amount::ZERO {
                Some("amount must be positive".to_owned())
            } else {
                match chain.validate_address(&payment.address) {
                    Ok(true) => None,
                    Ok(false) => Some("address refused by node".to_owned()),
                    Err(e) => Some(format!("address validation failed: {}", e)),
                }
            };
            if let Some(reason) = reason {
                slog!(InvalidPayment, payment_id: payment.id, address: &payment.address,
                    reason: &reason[..],
                );
                fail_all(&work, &reason, &mut results);
                return Ok(ordered(results, pending));
            }
        }

        // Capacity check against the wallet balance.
        let total = match checked_total(&work) {
            Some(total) => total,
            None => {
                fail_all(&work, "batch total overflows", &mut results);
                return Ok(ordered(results, pending));
            }
        };
        let distinct = work.iter().map(|p| &p.address[..]).collect::<HashSet<_>>().len();
        let batch_fee = self.tx_fee(cmp::max(1, distinct), distinct);
        let required = match total.checked_add(batch_fee) {
            Some(required) => required,
            None => {
                fail_all(&work, "batch total overflows", &mut results);
                return Ok(ordered(results, pending));
            }
        };
        let balance = match self.with_retry("getbalance", || chain.balance()) {
            Ok(balance) => balance,
            Err(e) => {
                fail_all(&work, &format!("balance query failed: {}", e), &mut results);
                return Ok(ordered(results, pending));
            }
        };
        if balance < required {
            slog!(InsufficientBalance, required_sat: total.to_sat(),
                fee_sat: batch_fee.to_sat(), balance_sat: balance.to_sat(),
            );
            fail_all(&work, "insufficient balance", &mut results);
            return Ok(ordered(results, pending));
        }

        // Coin selection.
        let unspent = match self.with_retry("listunspent", || chain.list_unspent()) {
            Ok(unspent) => unspent,
            Err(e) => {
                fail_all(&work, &format!("listunspent failed: {}", e), &mut results);
                return Ok(ordered(results, pending));
            }
        };
        let selected = match fee::select_utxos(&unspent, required, self.params.min_confirmations) {
            Ok(selected) => selected,
            Err(e) => {
                slog!(SelectionFailed, error: e.to_string());
                fail_all(&work, &format!("selection failed: {}", e), &mut results);
                return Ok(ordered(results, pending));
            }
        };

        // Dispatch.
        if selected.len() == 1 {
            self.dispatch_aggregated(chain, pool, &work, &selected[0], &mut results)?;
        } else {
            self.dispatch_streaming(chain, pool, &work, &selected, &mut results, shutdown)?;
        }
        Ok(ordered(results, pending))
    }

    /// Pay the whole batch with one transaction over one input: one
    /// output per distinct address, plus change above the dust threshold.
    /// The journal write for every payment is the completion barrier; it
    /// happens after the broadcast returns and before any pool
    /// acknowledgement goes out.
    fn dispatch_aggregated<C: ChainRpc, P: PoolApi>(
        &mut self,
        chain: &C,
        pool: &P,
        work: &[&Obligation],
        input: &UnspentOutput,
        results: &mut HashMap<PaymentId, PaymentResult>,
    ) -> Result<(), Error> {
        let mut outputs: BTreeMap<String, Amount> = BTreeMap::new();
        for payment in work {
            *outputs.entry(payment.address.clone()).or_insert(Amount::ZERO) += payment.amount;
        }
        let total = outputs.values().fold(Amount::ZERO, |acc, a| acc + *a);
        slog!(AggregatedDispatch, n_payments: work.len(), n_outputs: outputs.len(),
            input_sat: input.amount.to_sat(),
        );

        let tx_fee = self.tx_fee(1, outputs.len() + 1);
        let residue = input.amount.checked_sub(total)
            .and_then(|r| r.checked_sub(tx_fee))
            .unwrap_or(Amount::ZERO);
        if residue > self.params.dust_threshold {
            let change_address = match self.change_address(chain) {
                Ok(address) => address,
                Err(e) => {
                    fail_all(work, &format!("change address unavailable: {}", e), results);
                    return Ok(());
                }
            };
            *outputs.entry(change_address).or_insert(Amount::ZERO) += residue;
        }

        let inputs = [input.to_input()];
        let txid = match self.construct_sign_send(chain, &inputs, &outputs) {
            Ok(txid) => txid,
            Err(e) => {
                slog!(BroadcastFailed, payment_id: 0, input_txid: input.txid,
                    input_vout: input.vout, error: e.to_string(),
                );
                fail_all(work, &format!("broadcast failed: {}", e), results);
                return Ok(());
            }
        };

        for payment in work {
            match self.journal.mark_completed(payment.id, txid) {
                Ok(()) => {}
                Err(journal::Error::Conflict { existing, .. }) => {
                    results.insert(payment.id,
                        PaymentResult::already_completed(payment.id, existing));
                    continue;
                }
                Err(e) => return Err(Error::Journal(e)),
            }
            slog!(PaymentComplete, payment_id: payment.id, txid: txid,
                amount_sat: payment.amount.to_sat(), n_broadcasts: 1,
            );
            results.insert(payment.id, PaymentResult {
                payment_id: payment.id,
                status: PaymentStatus::Succeeded,
                completed: payment.amount,
                txids: vec![txid],
                error: None,
            });
        }

        // Best-effort acknowledgements, strictly after every journal write.
        for payment in work {
            let succeeded = results.get(&payment.id)
                .map(|r| r.status == PaymentStatus::Succeeded)
                .unwrap_or(false);
            if succeeded {
                pool.mark_completed(&self.params.pool_id, payment.id, &txid);
            }
        }
        Ok(())
    }

    /// Pay the batch as a stream of single-input transactions. Each
    /// selected input funds the first payment that is still owed more
    /// than the dust threshold; a failed broadcast abandons only its own
    /// input. A payment is journaled at the moment its last contributing
    /// broadcast returns, with that txid.
    fn dispatch_streaming<C: ChainRpc, P: PoolApi>(
        &mut self,
        chain: &C,
        pool: &P,
        work: &[&Obligation],
        utxos: &[UnspentOutput],
        results: &mut HashMap<PaymentId, PaymentResult>,
        shutdown: &Shutdown,
    ) -> Result<(), Error> {
        slog!(StreamingDispatch, n_utxos: utxos.len(), n_payments: work.len());

        // The change address is resolved once per batch, not per
        // broadcast, to avoid churning through the wallet keypool.
        let change_address = match self.change_address(chain) {
            Ok(address) => address,
            Err(e) => {
                fail_all(work, &format!("change address unavailable: {}", e), results);
                return Ok(());
            }
        };

        let mut state = BatchState::new();
        let fee_single = self.tx_fee(1, 2);

        for utxo in utxos {
            // Cancellation is honored between transactions only; once a
            // broadcast returns, the journal write below cannot be
            // interrupted from here.
            if shutdown.is_requested() {
                break;
            }

            let avail = match utxo.amount.checked_sub(fee_single) {
                Some(avail) if avail > Amount::ZERO => avail,
                _ => {
                    slog!(UneconomicalUtxo, txid: utxo.txid, vout: utxo.vout,
                        value_sat: utxo.amount.to_sat(), fee_sat: fee_single.to_sat(),
                    );
                    continue;
                }
            };

            // The first payment still owed more than dust; surplus inputs
            // past the last such payment stay unspent.
            let payment = work.iter().find(|p| {
                !results.contains_key(&p.id) && match p.amount.checked_sub(state.progress_of(p.id)) {
                    Some(remaining) => remaining > self.params.dust_threshold,
                    None => false,
                }
            });
            let payment = *unwrap_opt_or!(payment, { break });

            let remaining = payment.amount - state.progress_of(payment.id);
            let pay = cmp::min(avail, remaining);
            let mut outputs: BTreeMap<String, Amount> = BTreeMap::new();
            outputs.insert(payment.address.clone(), pay);
            let residue = utxo.amount.checked_sub(pay)
                .and_then(|r| r.checked_sub(fee_single))
                .unwrap_or(Amount::ZERO);
            let mut change_sat = 0;
            if residue > self.params.dust_threshold {
                *outputs.entry(change_address.clone()).or_insert(Amount::ZERO) += residue;
                change_sat = residue.to_sat();
            }

            let inputs = [utxo.to_input()];
            let txid = match self.construct_sign_send(chain, &inputs, &outputs) {
                Ok(txid) => txid,
                Err(e) => {
                    // This input is abandoned for the batch; the next one
                    // may still complete the payment.
                    slog!(BroadcastFailed, payment_id: payment.id, input_txid: utxo.txid,
                        input_vout: utxo.vout, error: e.to_string(),
                    );
                    continue;
                }
            };

            state.record(payment.id, txid, pay);
            let progress = state.progress_of(payment.id);
            slog!(PaymentBroadcast, payment_id: payment.id, txid: txid,
                input_txid: utxo.txid, input_vout: utxo.vout, paid_sat: pay.to_sat(),
                progress_sat: progress.to_sat(), required_sat: payment.amount.to_sat(),
                change_sat: change_sat,
            );

            if progress >= payment.amount {
                // The payment just completed: journal it with the last
                // contributing txid, then tell the pool.
                match self.journal.mark_completed(payment.id, txid) {
                    Ok(()) => {
                        let txids = state.txids_of(payment.id);
                        slog!(PaymentComplete, payment_id: payment.id, txid: txid,
                            amount_sat: payment.amount.to_sat(), n_broadcasts: txids.len(),
                        );
                        results.insert(payment.id, PaymentResult {
                            payment_id: payment.id,
                            status: PaymentStatus::Succeeded,
                            completed: progress,
                            txids: txids,
                            error: None,
                        });
                        pool.mark_completed(&self.params.pool_id, payment.id, &txid);
                    }
                    Err(journal::Error::Conflict { existing, .. }) => {
                        results.insert(payment.id,
                            PaymentResult::already_completed(payment.id, existing));
                    }
                    Err(e) => return Err(Error::Journal(e)),
                }
            }
        }

        log!(Debug, "streaming dispatch made {} broadcasts", state.successful_txids.len());

        // Whatever did not complete stays pending and is re-attempted by
        // a later batch; the journal is untouched for it.
        for payment in work {
            if results.contains_key(&payment.id) {
                continue;
            }
            let progress = state.progress_of(payment.id);
            let txids = state.txids_of(payment.id);
            slog!(PaymentPartial, payment_id: payment.id, paid_sat: progress.to_sat(),
                required_sat: payment.amount.to_sat(), n_broadcasts: txids.len(),
            );
            results.insert(payment.id, PaymentResult {
                payment_id: payment.id,
                status: PaymentStatus::PartiallyPaid,
                completed: progress,
                txids: txids,
                error: None,
            });
        }
        Ok(())
    }

    /// Create, sign and broadcast a transaction. Construction is retried
    /// on transport failures; the broadcast itself is never retried,
    /// because a transport error may mean the node already accepted it.
    fn construct_sign_send<C: ChainRpc>(
        &self,
        chain: &C,
        inputs: &[TxInput],
        outputs: &BTreeMap<String, Amount>,
    ) -> Result<bitcoin::Txid, rpc::Error> {
        let hex = self.with_retry("createrawtransaction", || {
            chain.create_raw_transaction(inputs, outputs)
        })?;
        let signed = chain.sign_raw_transaction(&hex)?;
        chain.send_raw_transaction(&signed.hex)
    }

    /// The change address of the batch: the configured one, or a fresh
    /// wallet address when none is configured.
    fn change_address<C: ChainRpc>(&self, chain: &C) -> Result<String, rpc::Error> {
        match self.params.change_address {
            Some(ref address) => {
                slog!(ChangeAddress, address: &address[..], source: "config");
                Ok(address.clone())
            }
            None => {
                let address = self.with_retry("getnewaddress", || chain.new_address())?;
                slog!(ChangeAddress, address: &address[..], source: "wallet");
                Ok(address)
            }
        }
    }

    /// Estimate the fee of a transaction, falling back to the configured
    /// fallback fee (and saying so) when the arithmetic cannot produce a
    /// value.
    fn tx_fee(&self, inputs: usize, outputs: usize) -> Amount {
        match fee::try_estimate(inputs, outputs, self.params.fee_rate) {
            Some(fee) => fee,
            None => {
                slog!(FeeFallbackUsed, inputs: inputs, outputs: outputs,
                    fallback_sat: self.params.fee_fallback.to_sat(),
                );
                self.params.fee_fallback
            }
        }
    }

    /// Re-attempt a gateway call a bounded number of times on
    /// transport-level failures. Node-level answers are never retried.
    fn with_retry<T, F>(&self, call: &str, mut f: F) -> Result<T, rpc::Error>
        where F: FnMut() -> Result<T, rpc::Error>
    {
        let mut attempt = 0u32;
        loop {
            match f() {
                Err(ref e) if e.is_transport() && attempt < constants::TRANSPORT_RETRIES => {
                    attempt += 1;
                    slog!(RetryingCall, call: call, attempt: attempt, error: e.to_string());
                    thread::sleep(Duration::from_secs(constants::TRANSPORT_RETRY_WAIT_SECS));
                }
                other => return other,
            }
        }
    }
}

fn checked_total(work: &[&Obligation]) -> Option<Amount> {
    work.iter().fold(Some(Amount::ZERO), |acc, p| {
        acc.and_then(|acc| acc.checked_add(p.amount))
    })
}

fn fail_all(
    work: &[&Obligation],
    reason: &str,
    results: &mut HashMap<PaymentId, PaymentResult>,
) {
    for payment in work {
        results.insert(payment.id, PaymentResult::failed(payment.id, reason));
    }
}

fn ordered(
    mut results: HashMap<PaymentId, PaymentResult>,
    pending: &[Obligation],
) -> Vec<PaymentResult> {
    pending.iter()
        .map(|p| results.remove(&p.id).expect("result for every payment"))
        .collect()
}

#[cfg(test)]
pub mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::io::Read;

    use bitcoin::hashes::Hash;
    use jsonrpc;
    use serde_json;
    use serde_json::json;
    use tempfile;

    use fee::tests::{utxo, FEE_RATE};
    use pool;
    use super::*;

    const DUST: Amount = Amount::from_sat(100_000);

    /// A constructed transaction, as the mock node recorded it.
    #[derive(Clone, Debug)]
    pub struct TxSpec {
        pub inputs: Vec<TxInput>,
        pub outputs: BTreeMap<String, f64>,
    }

    /// Scriptable mock of the chain node, shared with the driver tests.
    pub struct MockChain {
        /// Live unspent set; broadcasts consume from it.
        pub utxos: RefCell<Vec<UnspentOutput>>,
        /// Every constructed raw transaction, indexed by its fake hex.
        pub created: RefCell<Vec<TxSpec>>,
        /// Every accepted broadcast, in order.
        pub broadcast: RefCell<Vec<TxSpec>>,
        /// 1-based broadcast attempt ordinals the node rejects.
        pub reject: Vec<usize>,
        /// Addresses the node refuses to validate.
        pub invalid: Vec<String>,
        /// Fixed balance instead of the unspent sum.
        pub balance_override: Option<f64>,
        /// Reported chain height.
        pub height: u64,
        /// Wallets the node reports as loaded.
        pub wallets: Vec<String>,
        send_attempts: RefCell<usize>,
    }

    impl MockChain {
        pub fn new(utxos: Vec<UnspentOutput>) -> MockChain {
            MockChain {
                utxos: RefCell::new(utxos),
                created: RefCell::new(Vec::new()),
                broadcast: RefCell::new(Vec::new()),
                reject: Vec::new(),
                invalid: Vec::new(),
                balance_override: None,
                height: 100,
                wallets: vec!["payouts".to_owned()],
                send_attempts: RefCell::new(0),
            }
        }

        /// Satoshis received by an address across all accepted broadcasts.
        pub fn paid_to(&self, address: &str) -> u64 {
            self.broadcast.borrow().iter()
                .flat_map(|spec| spec.outputs.get(address).cloned())
                .map(|btc| (btc * 1e8).round() as u64)
                .sum()
        }
    }

    fn rpc_err(code: i32, message: &str) -> jsonrpc::Error {
        jsonrpc::Error::Rpc(jsonrpc::error::RpcError {
            code: code,
            message: message.to_owned(),
            data: None,
        })
    }

    impl_dummy_rpc!(MockChain, dummy, _args,
        "getblockchaininfo" => Ok(json!({ "chain": "main", "blocks": dummy.height })),
        "getblockcount" => Ok(json!(dummy.height)),
        "listwallets" => Ok(serde_json::to_value(&dummy.wallets).unwrap()),
        "getbalance" => {
            let balance = dummy.balance_override.unwrap_or_else(|| {
                dummy.utxos.borrow().iter().map(|u| u.amount.to_btc()).sum::<f64>()
            });
            Ok(json!(balance))
        },
        "listunspent" => Ok(serde_json::to_value(&*dummy.utxos.borrow()).unwrap()),
        "validateaddress" => {
            let addr = _args[0].as_str().unwrap().to_owned();
            Ok(json!({ "isvalid": !dummy.invalid.contains(&addr) }))
        },
        "getnewaddress" => Ok(json!("pl1qchange")),
        "createrawtransaction" => {
            let spec = TxSpec {
                inputs: serde_json::from_value(_args[0].clone()).unwrap(),
                outputs: serde_json::from_value(_args[1].clone()).unwrap(),
            };
            let mut created = dummy.created.borrow_mut();
            created.push(spec);
            Ok(json!(format!("{:08x}", created.len() - 1)))
        },
        "signrawtransactionwithwallet" => {
            let hex = _args[0].as_str().unwrap();
            Ok(json!({ "hex": format!("{}ff", hex), "complete": true }))
        },
        "sendrawtransaction" => {
            let hex = _args[0].as_str().unwrap();
            let idx = usize::from_str_radix(&hex[..8], 16).unwrap();
            let spec = dummy.created.borrow()[idx].clone();
            *dummy.send_attempts.borrow_mut() += 1;
            let attempt = *dummy.send_attempts.borrow();
            if dummy.reject.contains(&attempt) {
                Err(rpc_err(-26, "transaction rejected"))
            } else {
                let input = spec.inputs[0].clone();
                dummy.utxos.borrow_mut()
                    .retain(|u| !(u.txid == input.txid && u.vout == input.vout));
                dummy.broadcast.borrow_mut().push(spec);
                let n = dummy.broadcast.borrow().len();
                Ok(json!(format!("{:064x}", n)))
            }
        },
    );

    /// A chain gateway that must never be reached.
    pub struct PanickingChain;
    impl_dummy_rpc!(PanickingChain, _dummy, _args,);

    /// Scriptable mock of the pool admin API, shared with the driver tests.
    pub struct MockPool {
        /// What the pending endpoint reports.
        pub pending: RefCell<Vec<Obligation>>,
        /// Acknowledgements received, in order.
        pub acks: RefCell<Vec<(PaymentId, bitcoin::Txid)>>,
        /// Whether acknowledgements are accepted.
        pub accept: bool,
    }

    impl MockPool {
        pub fn new() -> MockPool {
            MockPool {
                pending: RefCell::new(Vec::new()),
                acks: RefCell::new(Vec::new()),
                accept: true,
            }
        }
    }

    impl pool::PoolApi for MockPool {
        fn test_connection(&self) -> bool {
            true
        }
        fn pending_payments(&self, _pool_id: &str) -> Result<Vec<Obligation>, pool::Error> {
            Ok(self.pending.borrow().clone())
        }
        fn mark_completed(&self, _pool_id: &str, payment_id: PaymentId, txid: &bitcoin::Txid) -> bool {
            self.acks.borrow_mut().push((payment_id, *txid));
            self.accept
        }
    }

    /// Construct a pending payment for tests.
    pub fn payment(id: PaymentId, address: &str, amount_sat: u64) -> Obligation {
        Obligation {
            id: id,
            address: address.to_owned(),
            amount: Amount::from_sat(amount_sat),
            created_at: "2024-03-01T12:00:00Z".to_owned(),
        }
    }

    /// Construct an engine writing its journal under the given directory.
    pub fn test_engine(dir: &tempfile::TempDir) -> Engine {
        let journal_path = dir.path().join("journal.db");
        let failed_path = dir.path().join("failed.log");
        Engine::new(
            Params {
                pool_id: "main".to_owned(),
                fee_rate: FEE_RATE,
                fee_fallback: Amount::from_sat(100_000),
                dust_threshold: DUST,
                min_confirmations: 1,
                change_address: None,
            },
            Journal::open(journal_path.to_str().unwrap()).unwrap(),
            FailureLog::new(failed_path.to_str().unwrap()),
        )
    }

    fn run<C: ChainRpc, P: PoolApi>(
        engine: &mut Engine,
        chain: &C,
        pool: &P,
        pending: &[Obligation],
    ) -> Vec<PaymentResult> {
        engine.run_batch(chain, pool, pending, BatchMode::Interactive, &Shutdown::new())
            .expect("no fatal engine error")
    }

    fn failed_log_lines(dir: &tempfile::TempDir) -> Vec<String> {
        let mut content = String::new();
        match fs::File::open(dir.path().join("failed.log")) {
            Ok(mut fh) => {
                fh.read_to_string(&mut content).unwrap();
            }
            Err(_) => return Vec::new(),
        }
        content.lines().map(|l| l.to_owned()).collect()
    }

    #[test]
    fn single_utxo_single_payment() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        let chain = MockChain::new(vec![utxo(1, 10_0000_0000, 3)]);
        let pool = MockPool::new();
        let pending = [payment(42, "pl1qminer", 9_0000_0000)];

        let results = run(&mut engine, &chain, &pool, &pending);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, PaymentStatus::Succeeded);
        assert_eq!(results[0].completed, Amount::from_sat(9_0000_0000));
        assert_eq!(results[0].txids.len(), 1);

        let broadcast = chain.broadcast.borrow();
        assert_eq!(broadcast.len(), 1);
        assert_eq!(broadcast[0].inputs.len(), 1);
        assert_eq!(broadcast[0].outputs.len(), 2);
        assert_eq!(broadcast[0].outputs["pl1qminer"], 9.0);
        // change: 10 - 9 - fee(1 input, 2 outputs)
        assert_eq!(broadcast[0].outputs["pl1qchange"], 0.99772);

        assert_eq!(engine.journal().transaction_of(42), Some(results[0].txids[0]));
        assert_eq!(*pool.acks.borrow(), vec![(42, results[0].txids[0])]);
        assert!(failed_log_lines(&dir).is_empty());
    }

    #[test]
    fn streaming_multi_utxo_single_payment() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        let chain = MockChain::new(vec![
            utxo(1, 10_0000_0000, 3),
            utxo(2, 10_0000_0000, 3),
            utxo(3, 10_0000_0000, 3),
            utxo(4, 10_0000_0000, 3),
        ]);
        let pool = MockPool::new();
        let pending = [payment(100, "pl1qminer", 35_0000_0000)];

        let results = run(&mut engine, &chain, &pool, &pending);
        assert_eq!(results[0].status, PaymentStatus::Succeeded);
        assert_eq!(results[0].completed, Amount::from_sat(35_0000_0000));
        assert_eq!(results[0].txids.len(), 4);

        let broadcast = chain.broadcast.borrow();
        assert_eq!(broadcast.len(), 4);
        // every broadcast is single-input and no two share an input
        let inputs: HashSet<(bitcoin::Txid, u32)> = broadcast.iter()
            .map(|spec| {
                assert_eq!(spec.inputs.len(), 1);
                (spec.inputs[0].txid, spec.inputs[0].vout)
            })
            .collect();
        assert_eq!(inputs.len(), 4);
        // the first three spend a whole input less the single-tx fee,
        // with nothing left for change
        for spec in broadcast.iter().take(3) {
            assert_eq!(spec.outputs.len(), 1);
            assert_eq!(spec.outputs["pl1qminer"], 9.99772);
        }
        // the last pays the remainder and returns change
        assert_eq!(broadcast[3].outputs["pl1qminer"], 5.00684);
        assert_eq!(broadcast[3].outputs["pl1qchange"], 4.99088);
        assert_eq!(chain.paid_to("pl1qminer"), 35_0000_0000);

        // journaled once, with the final contributing txid, and acked once
        assert_eq!(engine.journal().transaction_of(100), Some(results[0].txids[3]));
        assert_eq!(pool.acks.borrow().len(), 1);
    }

    #[test]
    fn streaming_partial_failure_continues() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        let mut chain = MockChain::new(vec![
            utxo(1, 10_0000_0000, 3),
            utxo(2, 10_0000_0000, 3),
            utxo(3, 10_0000_0000, 3),
            utxo(4, 10_0000_0000, 3),
        ]);
        chain.reject = vec![3];
        let pool = MockPool::new();
        let pending = [payment(100, "pl1qminer", 35_0000_0000)];

        let results = run(&mut engine, &chain, &pool, &pending);
        assert_eq!(results[0].status, PaymentStatus::PartiallyPaid);
        assert_eq!(results[0].completed, Amount::from_sat(29_9931_6000));
        assert_eq!(results[0].txids.len(), 3);
        assert!(results[0].error.is_none());

        // the payment is not journaled and not acknowledged; it will be
        // re-attempted by the next batch
        assert!(engine.journal().is_empty());
        assert!(pool.acks.borrow().is_empty());

        // but it is operator-visible
        let lines = failed_log_lines(&dir);
        assert_eq!(lines.len(), 1);
        let fields: Vec<&str> = lines[0].split('|').collect();
        assert_eq!(fields[1], "100");
        assert_eq!(fields[5], "5.00684"); // remaining
    }

    #[test]
    fn already_completed_never_touches_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        let txid = bitcoin::Txid::hash(&[7]);
        engine.journal().mark_completed(7, txid).unwrap();

        let pool = MockPool::new();
        let pending = [payment(7, "pl1qminer", 1_0000_0000)];
        let results = run(&mut engine, &PanickingChain, &pool, &pending);

        assert_eq!(results[0].status, PaymentStatus::AlreadyCompleted);
        assert_eq!(results[0].txids, vec![txid]);
        assert_eq!(results[0].completed, Amount::ZERO);
        assert!(pool.acks.borrow().is_empty());
    }

    #[test]
    fn invalid_address_fails_the_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        let mut chain = MockChain::new(vec![utxo(1, 10_0000_0000, 3)]);
        chain.invalid = vec!["garbage".to_owned()];
        let pool = MockPool::new();
        let pending = [
            payment(1, "garbage", 1_0000_0000),
            payment(2, "pl1qminer", 1_0000_0000),
        ];

        let results = run(&mut engine, &chain, &pool, &pending);
        assert_eq!(results[0].status, PaymentStatus::Failed);
        assert_eq!(results[1].status, PaymentStatus::Failed);
        assert!(results[0].error.as_ref().unwrap().contains("refused"));

        // nothing was constructed, broadcast, journaled or acknowledged
        assert!(chain.created.borrow().is_empty());
        assert!(engine.journal().is_empty());
        assert!(pool.acks.borrow().is_empty());
        assert_eq!(failed_log_lines(&dir).len(), 2);
    }

    #[test]
    fn zero_amount_fails_without_chain_access() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        let pool = MockPool::new();
        let pending = [payment(9, "pl1qminer", 0)];

        let results = run(&mut engine, &PanickingChain, &pool, &pending);
        assert_eq!(results[0].status, PaymentStatus::Failed);
        assert!(results[0].error.as_ref().unwrap().contains("positive"));
    }

    #[test]
    fn insufficient_balance_aborts_before_construction() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        let chain = MockChain::new(vec![utxo(1, 1_0000_0000, 3)]);
        let pool = MockPool::new();
        let pending = [payment(11, "pl1qminer", 5_0000_0000)];

        let results = run(&mut engine, &chain, &pool, &pending);
        assert_eq!(results[0].status, PaymentStatus::Failed);
        assert_eq!(results[0].error.as_ref().unwrap(), "insufficient balance");
        assert!(chain.created.borrow().is_empty());
        assert!(engine.journal().is_empty());
    }

    #[test]
    fn no_spendable_utxos_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        let mut chain = MockChain::new(Vec::new());
        chain.balance_override = Some(100.0);
        let pool = MockPool::new();
        let pending = [payment(12, "pl1qminer", 5_0000_0000)];

        let results = run(&mut engine, &chain, &pool, &pending);
        assert_eq!(results[0].status, PaymentStatus::Failed);
        assert!(results[0].error.as_ref().unwrap().contains("no spendable"));
        assert!(engine.journal().is_empty());
    }

    #[test]
    fn rerunning_a_journaled_batch_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        let chain = MockChain::new(vec![utxo(1, 10_0000_0000, 3)]);
        let pool = MockPool::new();
        let pending = [payment(42, "pl1qminer", 9_0000_0000)];

        let first = run(&mut engine, &chain, &pool, &pending);
        assert_eq!(first[0].status, PaymentStatus::Succeeded);

        // the rerun performs zero chain calls and returns the journaled txid
        let second = run(&mut engine, &PanickingChain, &pool, &pending);
        assert_eq!(second[0].status, PaymentStatus::AlreadyCompleted);
        assert_eq!(second[0].txids, first[0].txids[..1].to_vec());
    }

    #[test]
    fn crash_between_broadcast_and_journal_replays() {
        let dir = tempfile::tempdir().unwrap();
        let pending = [payment(100, "pl1qminer", 35_0000_0000)];
        let utxos: Vec<UnspentOutput> =
            (1..=5).map(|tag| utxo(tag, 10_0000_0000, 3)).collect();

        // Run 1: the process dies right after its first broadcast
        // returns, before anything is journaled. Modeled by rejecting
        // every later broadcast and discarding the engine.
        let paid_before_crash;
        let leftover;
        {
            let mut chain = MockChain::new(utxos);
            chain.reject = (2..100).collect();
            let mut engine = test_engine(&dir);
            let pool = MockPool::new();
            let results = run(&mut engine, &chain, &pool, &pending);
            assert_eq!(results[0].status, PaymentStatus::PartiallyPaid);
            assert_eq!(results[0].completed, Amount::from_sat(9_9977_2000));
            assert!(engine.journal().is_empty());
            paid_before_crash = chain.paid_to("pl1qminer");
            leftover = chain.utxos.borrow().clone();
        }
        assert_eq!(paid_before_crash, 9_9977_2000);
        assert_eq!(leftover.len(), 4);

        // Run 2: a restarted process sees the payment still pending, an
        // empty journal, and a reduced unspent set. It re-attempts from
        // zero progress and completes; everything it attributes to the
        // payment totals exactly the owed amount. The pre-crash broadcast
        // is the bounded overpay this recovery model accepts.
        let chain = MockChain::new(leftover);
        let mut engine = test_engine(&dir);
        let pool = MockPool::new();
        let results = run(&mut engine, &chain, &pool, &pending);
        assert_eq!(results[0].status, PaymentStatus::Succeeded);
        assert_eq!(results[0].completed, Amount::from_sat(35_0000_0000));
        assert_eq!(chain.paid_to("pl1qminer"), 35_0000_0000);
        let last = *results[0].txids.last().unwrap();
        assert_eq!(engine.journal().transaction_of(100), Some(last));

        // Run 3: the journal now guards the payment forever.
        let pool = MockPool::new();
        let results = run(&mut engine, &PanickingChain, &pool, &pending);
        assert_eq!(results[0].status, PaymentStatus::AlreadyCompleted);
        assert_eq!(results[0].txids, vec![last]);
    }

    #[test]
    fn dust_sized_payment_pays_without_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        // the payment amount equals the dust threshold
        let chain = MockChain::new(vec![utxo(1, 40_0000, 3)]);
        let pool = MockPool::new();
        let pending = [payment(50, "pl1qminer", 10_0000)];

        let results = run(&mut engine, &chain, &pool, &pending);
        assert_eq!(results[0].status, PaymentStatus::Succeeded);

        // the residue is below the dust threshold and is surrendered to
        // fees instead of becoming a change output
        let broadcast = chain.broadcast.borrow();
        assert_eq!(broadcast.len(), 1);
        assert_eq!(broadcast[0].outputs.len(), 1);
        assert_eq!(broadcast[0].outputs["pl1qminer"], 0.001);
    }

    #[test]
    fn exact_cover_emits_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        let chain = MockChain::new(vec![utxo(1, 10_0000_0000, 3)]);
        let pool = MockPool::new();
        // the amount is exactly the input less the single-tx fee
        let pending = [payment(60, "pl1qminer", 9_9977_2000)];

        let results = run(&mut engine, &chain, &pool, &pending);
        assert_eq!(results[0].status, PaymentStatus::Succeeded);
        let broadcast = chain.broadcast.borrow();
        assert_eq!(broadcast.len(), 1);
        assert_eq!(broadcast[0].outputs.len(), 1);
        assert_eq!(broadcast[0].outputs["pl1qminer"], 9.99772);
    }

    #[test]
    fn uneconomical_utxo_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        // the 0.002 output cannot pay for its own spend
        let chain = MockChain::new(vec![
            utxo(1, 10_0000_0000, 3),
            utxo(2, 6_0000_0000, 3),
            utxo(3, 20_0000, 3),
        ]);
        let pool = MockPool::new();
        let pending = [payment(70, "pl1qminer", 16_0000_0000)];

        let results = run(&mut engine, &chain, &pool, &pending);
        assert_eq!(results[0].status, PaymentStatus::PartiallyPaid);
        assert_eq!(results[0].completed, Amount::from_sat(15_9954_4000));
        assert_eq!(chain.broadcast.borrow().len(), 2);
        // the uneconomical output was not consumed
        assert_eq!(chain.utxos.borrow().len(), 1);
        assert_eq!(chain.utxos.borrow()[0].amount, Amount::from_sat(20_0000));
    }

    #[test]
    fn later_payment_stays_pending_when_its_broadcast_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        let mut chain = MockChain::new(vec![
            utxo(1, 10_0000_0000, 3),
            utxo(2, 10_0000_0000, 3),
        ]);
        chain.reject = vec![2];
        let pool = MockPool::new();
        let pending = [
            payment(1, "pl1qminera", 9_0000_0000),
            payment(2, "pl1qminerb", 9_0000_0000),
        ];

        let results = run(&mut engine, &chain, &pool, &pending);
        assert_eq!(results[0].status, PaymentStatus::Succeeded);
        assert_eq!(results[1].status, PaymentStatus::PartiallyPaid);
        assert_eq!(results[1].completed, Amount::ZERO);
        assert!(results[1].txids.is_empty());

        // the first payment is journaled and acknowledged, the second is
        // neither
        assert!(engine.journal().is_completed(1));
        assert!(!engine.journal().is_completed(2));
        assert_eq!(pool.acks.borrow().len(), 1);
        assert_eq!(failed_log_lines(&dir).len(), 1);
    }

    #[test]
    fn pool_rejection_does_not_unsettle_the_payment() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        let chain = MockChain::new(vec![utxo(1, 10_0000_0000, 3)]);
        let mut pool = MockPool::new();
        pool.accept = false;
        let pending = [payment(42, "pl1qminer", 9_0000_0000)];

        let results = run(&mut engine, &chain, &pool, &pending);
        // the journal is authoritative: a refused acknowledgement does
        // not change the outcome
        assert_eq!(results[0].status, PaymentStatus::Succeeded);
        assert!(engine.journal().is_completed(42));
        assert_eq!(pool.acks.borrow().len(), 1);
    }

    #[test]
    fn cancellation_stops_between_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(&dir);
        let chain = MockChain::new(vec![
            utxo(1, 10_0000_0000, 3),
            utxo(2, 10_0000_0000, 3),
            utxo(3, 10_0000_0000, 3),
            utxo(4, 10_0000_0000, 3),
        ]);
        let pool = MockPool::new();
        let pending = [payment(100, "pl1qminer", 35_0000_0000)];

        let shutdown = Shutdown::new();
        shutdown.request();
        let results = engine
            .run_batch(&chain, &pool, &pending, BatchMode::Automated, &shutdown)
            .unwrap();
        // the batch observed cancellation before its first broadcast
        assert_eq!(results[0].status, PaymentStatus::PartiallyPaid);
        assert_eq!(results[0].completed, Amount::ZERO);
        assert!(chain.broadcast.borrow().is_empty());
        assert!(engine.journal().is_empty());
    }
}

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

//! # Disburser logs
//!

use bitcoin;

use common::PaymentId;

// ** process lifecycle **

/// The disburser daemon is starting up
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct StartingDisburser<'a> {
    /// Path of the configuration file that was loaded
    pub config_path: &'a str,
    /// Version of the daemon
    pub version: &'a str,
}

/// The disburser daemon is shutting down
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ShuttingDown {
    /// Why the daemon is stopping
    pub reason: String,
}

// ** preflight **

/// Started the preflight check sequence
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PreflightStarted {}

/// All preflight checks passed
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PreflightComplete<'a> {
    /// The wallet payments will be made from
    pub wallet: &'a str,
    /// Wallet balance, in satoshis
    pub balance_sat: u64,
    /// Sum of all pending payments, in satoshis
    pub pending_sat: u64,
    /// Number of pending payments
    pub n_pending: usize,
}

/// A preflight check failed; the daemon will not start
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PreflightFailed<'a> {
    /// The check that failed
    pub check: &'a str,
    /// The error it failed with
    pub error: String,
}

/// The wallet balance does not cover the pending payments. Not fatal:
/// the engine pays what it can and the rest stays pending.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct WalletBalanceShort {
    /// Wallet balance, in satoshis
    pub balance_sat: u64,
    /// Sum of all pending payments, in satoshis
    pub pending_sat: u64,
}

// ** completion journal **

/// Loaded the completion journal from disk
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct JournalLoaded<'a> {
    /// Path of the journal file
    pub path: &'a str,
    /// Number of completed payments on record
    pub n_entries: usize,
}

/// No journal file existed; starting with an empty journal
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct JournalMissing<'a> {
    /// Path of the journal file
    pub path: &'a str,
    /// The error opening it
    pub error: String,
}

/// The journal file exists but cannot be parsed. This is fatal at
/// startup: the journal is the authoritative payment record.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct JournalCorrupt<'a> {
    /// Path of the journal file
    pub path: &'a str,
    /// The parse error
    pub error: String,
}

/// Recorded a completed payment in the journal
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct JournalRecorded {
    /// The payment that completed
    pub payment_id: PaymentId,
    /// The transaction that completed it
    pub txid: bitcoin::Txid,
}

/// Serialized the journal to disk
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct JournalSaved<'a> {
    /// Path of the journal file
    pub path: &'a str,
    /// Number of completed payments on record
    pub n_entries: usize,
}

/// The journal was asked to record a second, different transaction for a
/// payment that is already complete. The original entry is kept.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct JournalConflict {
    /// The payment in question
    pub payment_id: PaymentId,
    /// The transaction already on record
    pub existing_txid: bitcoin::Txid,
    /// The conflicting transaction that was refused
    pub proposed_txid: bitcoin::Txid,
}

/// Appended a payment to the failed-payment log
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FailureRecorded {
    /// The payment that did not complete
    pub payment_id: PaymentId,
    /// Amount still owed, in satoshis
    pub remaining_sat: u64,
}

// ** engine **

/// Started processing a batch of payments
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BatchStarted {
    /// Number of payments in the batch
    pub n_payments: usize,
    /// Sum of the payment amounts, in satoshis
    pub total_sat: u64,
}

/// Finished processing a batch of payments
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BatchComplete {
    /// Payments fully paid and journaled in this batch
    pub n_succeeded: usize,
    /// Payments already journaled before the batch began
    pub n_already_completed: usize,
    /// Payments partially paid; they stay pending
    pub n_partial: usize,
    /// Payments that failed outright
    pub n_failed: usize,
    /// Amount broadcast on-chain by this batch, in satoshis
    pub paid_sat: u64,
}

/// A payment in the batch was already recorded complete in the journal;
/// the chain is not touched for it
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SkipAlreadyCompleted {
    /// The payment in question
    pub payment_id: PaymentId,
    /// The transaction that completed it, from the journal
    pub txid: bitcoin::Txid,
}

/// A payment failed validation. The whole batch is aborted: invalid data
/// must never be silently skipped.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct InvalidPayment<'a> {
    /// The payment in question
    pub payment_id: PaymentId,
    /// Destination address as supplied by the pool
    pub address: &'a str,
    /// What was wrong with it
    pub reason: &'a str,
}

/// The wallet balance cannot cover the batch total plus fees
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct InsufficientBalance {
    /// Batch total, in satoshis
    pub required_sat: u64,
    /// Estimated fee, in satoshis
    pub fee_sat: u64,
    /// Wallet balance, in satoshis
    pub balance_sat: u64,
}

/// Coin selection could not cover the batch
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SelectionFailed {
    /// The selection error
    pub error: String,
}

/// Paying the whole batch with a single transaction over a single input
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AggregatedDispatch {
    /// Number of payments covered
    pub n_payments: usize,
    /// Number of distinct destination outputs
    pub n_outputs: usize,
    /// Value of the input being spent, in satoshis
    pub input_sat: u64,
}

/// Paying the batch as a stream of single-input transactions
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct StreamingDispatch {
    /// Number of inputs selected
    pub n_utxos: usize,
    /// Number of payments to cover
    pub n_payments: usize,
}

/// An output is too small to pay for its own spend; it is left unspent
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct UneconomicalUtxo {
    /// Transaction of the output
    pub txid: bitcoin::Txid,
    /// Index of the output
    pub vout: u32,
    /// Value of the output, in satoshis
    pub value_sat: u64,
    /// Fee a single-input transaction would cost, in satoshis
    pub fee_sat: u64,
}

/// Broadcast one transaction paying (part of) one payment
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PaymentBroadcast {
    /// The payment being paid
    pub payment_id: PaymentId,
    /// The broadcast transaction
    pub txid: bitcoin::Txid,
    /// The input that was consumed
    pub input_txid: bitcoin::Txid,
    /// Index of the consumed output
    pub input_vout: u32,
    /// Amount paid to the miner by this transaction, in satoshis
    pub paid_sat: u64,
    /// Total paid toward this payment so far, in satoshis
    pub progress_sat: u64,
    /// Amount the payment requires in total, in satoshis
    pub required_sat: u64,
    /// Change returned to the wallet, in satoshis (0 when none)
    pub change_sat: u64,
}

/// A broadcast failed. In streaming dispatch the input is abandoned for
/// this batch and the engine continues with the next one.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BroadcastFailed {
    /// The payment being paid
    pub payment_id: PaymentId,
    /// The input that was being spent
    pub input_txid: bitcoin::Txid,
    /// Index of the output being spent
    pub input_vout: u32,
    /// The error
    pub error: String,
}

/// A payment reached its full amount and was journaled
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PaymentComplete {
    /// The payment that completed
    pub payment_id: PaymentId,
    /// The final contributing transaction (the journaled one)
    pub txid: bitcoin::Txid,
    /// The payment amount, in satoshis
    pub amount_sat: u64,
    /// Number of transactions that contributed
    pub n_broadcasts: usize,
}

/// The batch ended with a payment only partially paid. It stays pending
/// and will be re-attempted on a later batch.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PaymentPartial {
    /// The payment in question
    pub payment_id: PaymentId,
    /// Amount paid so far, in satoshis
    pub paid_sat: u64,
    /// Amount the payment requires in total, in satoshis
    pub required_sat: u64,
    /// Number of transactions that contributed in this batch
    pub n_broadcasts: usize,
}

/// The change address the batch will pay residues to
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ChangeAddress<'a> {
    /// The address
    pub address: &'a str,
    /// Whether it came from the configuration or was freshly generated
    pub source: &'a str,
}

/// Fee arithmetic could not produce a value and the configured fallback
/// fee was used instead. Usually indicates a misconfigured fee rate.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FeeFallbackUsed {
    /// Number of inputs of the transaction being estimated
    pub inputs: usize,
    /// Number of outputs of the transaction being estimated
    pub outputs: usize,
    /// The fallback that was used, in satoshis
    pub fallback_sat: u64,
}

/// Re-attempting a gateway call after a transport-level failure
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RetryingCall<'a> {
    /// The call being retried
    pub call: &'a str,
    /// Which attempt this is
    pub attempt: u32,
    /// The error the previous attempt failed with
    pub error: String,
}

// ** pool gateway **

/// An HTTP request to the pool admin API
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PoolRequest<'a> {
    /// HTTP method
    pub method: &'a str,
    /// Request URL
    pub url: &'a str,
}

/// An HTTP response from the pool admin API
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PoolResponse<'a> {
    /// HTTP method
    pub method: &'a str,
    /// Request URL
    pub url: &'a str,
    /// HTTP status code
    pub status: u16,
}

/// The pool admin API could not be reached
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PoolUnreachable {
    /// The transport error
    pub error: String,
}

/// Fetched the pending payments list from the pool
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PendingFetched {
    /// Number of pending payments
    pub n_payments: usize,
    /// Sum of the pending amounts, in satoshis
    pub total_sat: u64,
}

/// The pool accepted a completion acknowledgement
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AckRecorded {
    /// The payment acknowledged
    pub payment_id: PaymentId,
    /// The transaction that completed it
    pub txid: bitcoin::Txid,
}

/// The pool rejected (or could not receive) a completion acknowledgement.
/// Not fatal: the journal is authoritative and the payment stays complete.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AckFailed {
    /// The payment acknowledged
    pub payment_id: PaymentId,
    /// The transaction that completed it
    pub txid: bitcoin::Txid,
    /// HTTP status of the rejection, 0 when the request never went out
    pub status: u16,
}

// ** batch driver **

/// The automated driver started
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AutomationStarted {
    /// Maximum payments per batch
    pub batch_size: usize,
    /// Blocks between batches
    pub block_period: u64,
    /// Seconds between polls
    pub poll_interval_secs: u64,
    /// The block height processing starts from
    pub start_height: u64,
}

/// One iteration of the automated driver
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct DriverIteration {
    /// Current block height
    pub height: u64,
    /// Number of pending payments
    pub pending: usize,
    /// Wallet balance, in satoshis
    pub balance_sat: u64,
}

/// The driver decided to run a batch
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BatchTriggered {
    /// Current block height
    pub height: u64,
    /// Number of payments in the batch
    pub n_payments: usize,
}

/// The driver decided not to run a batch this iteration
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BatchDeferred<'a> {
    /// Which gate did not pass
    pub reason: &'a str,
}

/// An iteration of the automated driver failed; it will back off and
/// continue
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct DriverErrored {
    /// The error
    pub error: String,
}

/// Cumulative session totals of the automated driver
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Batches dispatched since startup
    pub batches: u64,
    /// Payments completed since startup
    pub succeeded: u64,
    /// Partial payments since startup
    pub partial: u64,
    /// Failed payments since startup
    pub failed: u64,
    /// Total amount broadcast since startup, in satoshis
    pub paid_sat: u64,
}

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


//! # Global table of all log codes
//!

use disburser::*;
use io_log::*;
use rpc::*;

use LegacyUnconvertedLogTrace;
use LegacyUnconvertedLogDebug;
use LegacyUnconvertedLogInfo;
use LegacyUnconvertedLogWarn;
use LegacyUnconvertedLogError;
use LegacyUnconvertedLogFatal;

macro_rules! impl_log(
    ($log_id:expr, $level:ident, $struct:ident $(::$next:ident)*, $desc:expr) => {
        impl_log!($log_id, $level, $struct$(::$next)*, $desc,);
    };
    ($log_id:expr, $level:ident, $struct:ident$(::$next:ident)*, $desc:expr,) => {
        impl $crate::Log for $struct$(::$next)* {
            const SEVERITY: $crate::Severity = $crate::Severity::$level;
            const LOG_ID: &'static str = $log_id;

            fn desc(&self) -> &str {
                $desc
            }
        }
    };
    ($log_id:expr, $level:ident, $struct:ident$(::$next:ident)*<$($lt:tt),*>, $desc:expr) => {
        impl_log!($log_id, $level, $struct$(::$next)*<$($lt),*>, $desc,);
    };
    ($log_id:expr, $level:ident, $struct:ident$(::$next:ident)*<$($lt:tt),*>, $desc:expr,) => {
        impl<$($lt),*> $crate::Log for $struct$(::$next)*<$($lt),*> {
            const SEVERITY: $crate::Severity = $crate::Severity::$level;
            const LOG_ID: &'static str = $log_id;

            fn desc(&self) -> &str {
                $desc
            }
        }
    };
);

impl_log!("D-0000", Info, StartingDisburser<'a>, "start disburser");
impl_log!("D-0001", Info, ShuttingDown, "disburser stopping");

impl_log!("D-0100", Info, PreflightStarted, "start preflight");
impl_log!("D-0101", Info, PreflightComplete<'a>, "preflight passed");
impl_log!("D-0102", Error, PreflightFailed<'a>, "preflight failed");
impl_log!("D-0103", Warn, WalletBalanceShort, "balance below pending total");

impl_log!("D-J001", Info, JournalLoaded<'a>, "journal loaded");
impl_log!("D-J002", Info, JournalMissing<'a>, "no journal, starting empty");
impl_log!("D-J003", Error, JournalCorrupt<'a>, "corrupt journal");
impl_log!("D-J010", Debug, JournalRecorded, "journal payment complete");
impl_log!("D-J011", Debug, JournalSaved<'a>, "serialize journal to disk");
impl_log!("D-J020", Warn, FailureRecorded, "record failed payment");
impl_log!("D-J900", Error, JournalConflict, "conflicting txid for completed payment");

impl_log!("D-P001", Info, BatchStarted, "start batch");
impl_log!("D-P002", Info, BatchComplete, "batch complete");
impl_log!("D-P010", Info, SkipAlreadyCompleted, "payment already complete");
impl_log!("D-P020", Info, AggregatedDispatch, "aggregated dispatch");
impl_log!("D-P021", Info, StreamingDispatch, "streaming dispatch");
impl_log!("D-P022", Debug, UneconomicalUtxo, "ignore utxo");
impl_log!("D-P023", Info, PaymentBroadcast, "payment broadcast");
impl_log!("D-P024", Error, BroadcastFailed, "broadcast failed");
impl_log!("D-P030", Info, PaymentComplete, "payment complete");
impl_log!("D-P031", Warn, PaymentPartial, "payment partially paid");
impl_log!("D-P040", Info, ChangeAddress<'a>, "change address");
impl_log!("D-P041", Warn, RetryingCall<'a>, "retrying gateway call");
impl_log!("D-P900", Error, InvalidPayment<'a>, "invalid payment");
impl_log!("D-P901", Error, InsufficientBalance, "insufficient balance");
impl_log!("D-P902", Error, SelectionFailed, "coin selection failed");

impl_log!("D-F101", Warn, FeeFallbackUsed, "fee fallback used");

impl_log!("D-G001", Trace, PoolRequest<'a>, "pool API request");
impl_log!("D-G002", Debug, PoolResponse<'a>, "pool API response");
impl_log!("D-G010", Debug, PendingFetched, "fetched pending payments");
impl_log!("D-G011", Info, AckRecorded, "pool accepted completion");
impl_log!("D-G012", Warn, AckFailed, "pool refused completion");
impl_log!("D-G900", Warn, PoolUnreachable, "pool unreachable");

impl_log!("D-A001", Info, AutomationStarted, "automation started");
impl_log!("D-A002", Debug, DriverIteration, "driver iteration");
impl_log!("D-A003", Info, BatchTriggered, "batch triggered");
impl_log!("D-A004", Debug, BatchDeferred<'a>, "batch deferred");
impl_log!("D-A005", Info, SessionStatus, "session totals");
impl_log!("D-A900", Error, DriverErrored, "driver iteration failed");

impl_log!("D-IO80", Warn, ReadFailed<'a>, "read failed");
impl_log!("D-IO81", Warn, WriteFailed<'a>, "write failed");
impl_log!("D-IO82", Warn, CreateFailed<'a>, "create failed");
impl_log!("D-IO83", Warn, MoveFailed<'a>, "move/rename failed");
impl_log!("D-IO84", Warn, SyncFailed<'a>, "fsync failed");

impl_log!("D-R001", Info, WarmingUp, "warming up");
impl_log!("D-R002", Info, WarmedUp, "warmed up");
impl_log!("D-R003", Trace, RpcRequest<'a>, "RPC request");
impl_log!("D-R004", Debug, RpcResponse<'a>, "RPC response");
impl_log!("D-R005", Trace, RpcResultTrace<'a>, "result portion of RPC response");
impl_log!("D-R801", Warn, AssumingAddressValid<'a>, "assuming address valid");
impl_log!("D-R900", Error, Error<'a, 'b>, "rpc error");

impl_log!("D-L000", Trace, LegacyUnconvertedLogTrace, "legacy log");
impl_log!("D-L001", Debug, LegacyUnconvertedLogDebug, "legacy log");
impl_log!("D-L002", Info, LegacyUnconvertedLogInfo, "legacy log");
impl_log!("D-L003", Warn, LegacyUnconvertedLogWarn, "legacy log");
impl_log!("D-L004", Error, LegacyUnconvertedLogError, "legacy log");
impl_log!("D-L005", Fatal, LegacyUnconvertedLogFatal, "legacy log");

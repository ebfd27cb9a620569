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


//! # Constants
//! Various constant values needed by other parts of the code

use BlockHeight;

/// Serialized size in bytes attributed to the fixed part of a transaction
/// (version, locktime, in/out counts) when estimating fees.
pub const TX_BASE_BYTES: u64 = 10;

/// Serialized size in bytes attributed to one input when estimating fees.
/// Sized for a signed segwit input with headroom; the node's relay rules
/// are the final arbiter.
pub const TX_INPUT_BYTES: u64 = 150;

/// Serialized size in bytes attributed to one output when estimating fees.
pub const TX_OUTPUT_BYTES: u64 = 34;

/// Default threshold below which a change output is uneconomical and is
/// surrendered to fees instead, in satoshis (0.001 in coin units).
pub const DEFAULT_DUST_THRESHOLD: u64 = 100_000;

/// Default fee used when fee arithmetic cannot produce a value, in
/// satoshis (0.001 in coin units). Deliberately a separate knob from
/// [DEFAULT_DUST_THRESHOLD] even though the defaults coincide.
pub const DEFAULT_FEE_FALLBACK: u64 = 100_000;

/// Default number of confirmations before a wallet output may be spent.
pub const DEFAULT_MIN_CONFIRMATIONS: BlockHeight = 1;

/// Default timeout of a single gateway call, in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// How many times a gateway call is re-attempted after a transport-level
/// failure before the batch gives up.
pub const TRANSPORT_RETRIES: u32 = 3;

/// Seconds to wait between transport-level retries.
pub const TRANSPORT_RETRY_WAIT_SECS: u64 = 2;

/// Seconds the automated driver sleeps after an iteration fails.
pub const DRIVER_ERROR_BACKOFF_SECS: u64 = 30;

/// Granularity of interruptible sleeps, in milliseconds. Bounds how long
/// shutdown can go unnoticed while a driver is sleeping.
pub const SHUTDOWN_POLL_MS: u64 = 250;

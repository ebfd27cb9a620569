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


//! # Configuration
//!
//! Configuration file for the disburser
//!

use std::time::Duration;

use bitcoin;
use bitcoin::Amount;
use serde::Deserializer;
use serde::de::Deserialize;

use common::BlockHeight;
use common::constants;
use logs;

/// Deserialize a [Duration] given in whole seconds.
pub fn deserialize_duration_secs<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let secs = u64::deserialize(d)?;
    Ok(Duration::from_secs(secs))
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(constants::DEFAULT_CALL_TIMEOUT_SECS)
}

fn default_dust_threshold() -> Amount {
    Amount::from_sat(constants::DEFAULT_DUST_THRESHOLD)
}

fn default_fee_fallback() -> Amount {
    Amount::from_sat(constants::DEFAULT_FEE_FALLBACK)
}

fn default_min_confirmations() -> BlockHeight {
    constants::DEFAULT_MIN_CONFIRMATIONS
}

fn default_true() -> bool {
    true
}

fn default_failed_payment_log() -> String {
    "failed-payments.log".to_owned()
}

fn default_batch_size() -> usize {
    50
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_min_balance() -> Amount {
    Amount::ZERO
}

/// Local configuration (logging, operator files)
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct Local {
    /// Verbosity level of the logging system
    pub log_level: logs::Severity,
    /// Path of the append-only failed-payment log, relative to the datadir
    #[serde(default = "default_failed_payment_log")]
    pub failed_payment_log: String,
}

/// Pool admin API configuration
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct Pool {
    /// Base URL of the pool admin API
    pub api_base_url: String,
    /// The pool whose payments this disburser drains
    pub pool_id: String,
    /// Bearer token for the admin API
    pub api_key: String,
    /// Timeout of a single API call (in seconds)
    #[serde(alias = "request_timeout_s")]
    #[serde(deserialize_with = "deserialize_duration_secs", default = "default_call_timeout")]
    pub request_timeout: Duration,
}

/// Chain node configuration (RPC connection, wallet, fee policy)
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct Chain {
    /// http://url:port of the node RPC
    pub rpc_url: String,
    /// RPC username for the node
    pub rpc_user: String,
    /// RPC password for the node
    pub rpc_password: String,
    /// Timeout of a single RPC call (in seconds)
    #[serde(alias = "rpc_timeout_s")]
    #[serde(deserialize_with = "deserialize_duration_secs", default = "default_call_timeout")]
    pub rpc_timeout: Duration,
    /// Name of the wallet payments are made from
    pub wallet_name: String,
    /// Address change is returned to. When unset, a fresh address is
    /// generated per batch.
    #[serde(default)]
    pub change_address: Option<String>,
    /// Feerate in coin units per estimated byte
    #[serde(with = "bitcoin::util::amount::serde::as_btc")]
    pub fee_per_byte: Amount,
    /// Confirmations required before a wallet output may be spent
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: BlockHeight,
    /// Whether to sign through the node wallet; when false the node is
    /// asked to complete signatures without wallet keys
    #[serde(default = "default_true")]
    pub use_wallet_signing: bool,
    /// Threshold below which change is surrendered to fees
    #[serde(with = "bitcoin::util::amount::serde::as_btc", default = "default_dust_threshold")]
    pub dust_threshold: Amount,
    /// Fee used when fee arithmetic cannot produce a value
    #[serde(with = "bitcoin::util::amount::serde::as_btc", default = "default_fee_fallback")]
    pub fee_fallback: Amount,
}

/// Automated-mode configuration
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct Automation {
    /// Whether the daemon runs the automated driver instead of the
    /// interactive one
    #[serde(default)]
    pub enabled: bool,
    /// Maximum number of payments per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Number of blocks between batches
    pub block_period: BlockHeight,
    /// Seconds between condition polls
    #[serde(alias = "poll_interval_s")]
    #[serde(deserialize_with = "deserialize_duration_secs", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Minimum wallet balance before a batch is attempted
    #[serde(with = "bitcoin::util::amount::serde::as_btc", default = "default_min_balance")]
    pub min_balance: Amount,
}

/// Completion journal configuration
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct Journal {
    /// Path of the journal file, relative to the datadir
    pub path: String,
}

/// Global disburser settings structure
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct Configuration {
    /// Local settings
    pub local: Local,
    /// Pool admin API settings
    pub pool: Pool,
    /// Chain node settings
    pub chain: Chain,
    /// Automated-mode settings
    pub automation: Automation,
    /// Completion journal settings
    pub journal: Journal,
}

impl Configuration {
    /// Check the sanity of the config.
    pub fn sanity_check(&self) -> Result<(), String> {
        if self.pool.api_base_url.is_empty() {
            return Err("pool.api_base_url must be set".into());
        }
        if self.pool.pool_id.is_empty() {
            return Err("pool.pool_id must be set".into());
        }
        if self.chain.rpc_url.is_empty() {
            return Err("chain.rpc_url must be set".into());
        }
        if self.chain.wallet_name.is_empty() {
            return Err("chain.wallet_name must be set".into());
        }
        if self.chain.fee_per_byte == Amount::ZERO {
            return Err("chain.fee_per_byte must be positive".into());
        }
        if self.journal.path.is_empty() {
            return Err("journal.path must be set".into());
        }
        if self.automation.enabled {
            if self.automation.batch_size == 0 {
                return Err("automation.batch_size must be positive".into());
            }
            if self.automation.block_period == 0 {
                return Err("automation.block_period must be positive".into());
            }
            if self.automation.poll_interval == Duration::from_secs(0) {
                return Err("automation.poll_interval_s must be positive".into());
            }
        }
        Ok(())
    }
}

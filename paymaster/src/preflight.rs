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


//! # Preflight
//! One-shot startup assertions. Any failure here aborts the process
//! before the engine is ever constructed; a balance that does not cover
//! the pending payments is only warned about, since the engine pays
//! what it can and leaves the rest pending.
//!

use std::{error, fmt};

use bitcoin::Amount;

use config::Configuration;
use pool::{self, PoolApi};
use rpc::{self, ChainRpc, Rpc};

/// Preflight failure; the daemon exits with status 1.
#[derive(Debug)]
pub enum Error {
    /// The pool admin API is unreachable or refused our key.
    PoolUnreachable,
    /// No wallet name in the configuration.
    NoWalletConfigured,
    /// The chain node is unreachable.
    ChainUnreachable,
    /// The configured wallet is not loaded on the node.
    WalletNotFound {
        /// The wallet the configuration names
        configured: String,
        /// The wallets the node has loaded
        available: Vec<String>,
    },
    /// A chain gateway call failed.
    Rpc(rpc::Error),
    /// A pool gateway call failed.
    Pool(pool::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::PoolUnreachable => f.write_str("pool admin API unreachable"),
            Error::NoWalletConfigured => f.write_str("no wallet configured"),
            Error::ChainUnreachable => f.write_str("chain node unreachable"),
            Error::WalletNotFound { ref configured, ref available } => write!(
                f, "wallet {} not loaded on the node (loaded: {})",
                configured, available.join(", "),
            ),
            Error::Rpc(ref e) => write!(f, "chain gateway: {}", e),
            Error::Pool(ref e) => write!(f, "pool gateway: {}", e),
        }
    }
}

impl error::Error for Error {
    fn cause(&self) -> Option<&dyn error::Error> {
        match *self {
            Error::Rpc(ref e) => Some(e),
            Error::Pool(ref e) => Some(e),
            _ => None,
        }
    }
}

/// Run the startup assertions in order: pool reachable, wallet
/// configured, node reachable, wallet loaded, balance vs pending. On
/// success the chain gateway is left scoped to the configured wallet.
pub fn run<C: ChainRpc, P: PoolApi>(
    chain: &mut C,
    pool: &P,
    config: &Configuration,
) -> Result<(), Error> {
    slog!(PreflightStarted);

    if !pool.test_connection() {
        slog!(PreflightFailed, check: "pool connection",
            error: "pool admin API unreachable or key refused".to_owned(),
        );
        return Err(Error::PoolUnreachable);
    }

    if config.chain.wallet_name.is_empty() {
        slog!(PreflightFailed, check: "wallet configured",
            error: "chain.wallet_name is empty".to_owned(),
        );
        return Err(Error::NoWalletConfigured);
    }

    if !chain.test_connection() {
        let error = match chain.is_warming_up() {
            Ok(true) => "chain node is still warming up".to_owned(),
            _ => "chain node unreachable".to_owned(),
        };
        slog!(PreflightFailed, check: "chain connection", error: error);
        return Err(Error::ChainUnreachable);
    }

    let wallets = match chain.list_wallets() {
        Ok(wallets) => wallets,
        Err(e) => {
            slog!(PreflightFailed, check: "list wallets", error: e.to_string());
            return Err(Error::Rpc(e));
        }
    };
    if !wallets.iter().any(|w| *w == config.chain.wallet_name) {
        slog!(PreflightFailed, check: "wallet loaded", error: format!(
            "wallet {} not loaded (loaded: {})",
            config.chain.wallet_name, wallets.join(", "),
        ));
        return Err(Error::WalletNotFound {
            configured: config.chain.wallet_name.clone(),
            available: wallets,
        });
    }

    chain.set_wallet(&config.chain.wallet_name);
    let balance = match chain.balance() {
        Ok(balance) => balance,
        Err(e) => {
            slog!(PreflightFailed, check: "wallet balance", error: e.to_string());
            return Err(Error::Rpc(e));
        }
    };
    let pending = match pool.pending_payments(&config.pool.pool_id) {
        Ok(pending) => pending,
        Err(e) => {
            slog!(PreflightFailed, check: "pending payments", error: e.to_string());
            return Err(Error::Pool(e));
        }
    };
    let pending_total = pending.iter().fold(Amount::ZERO, |acc, p| acc + p.amount);
    if balance < pending_total {
        slog!(WalletBalanceShort, balance_sat: balance.to_sat(),
            pending_sat: pending_total.to_sat(),
        );
    }

    slog!(PreflightComplete, wallet: &config.chain.wallet_name,
        balance_sat: balance.to_sat(), pending_sat: pending_total.to_sat(),
        n_pending: pending.len(),
    );
    Ok(())
}

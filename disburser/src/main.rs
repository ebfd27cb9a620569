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


//! # Disburser
//!
//! The mining pool payment disburser daemon. Drains the pool's pending
//! payment queue by paying miners on the mainchain, with a durable
//! completion journal giving at-most-once semantics per payment.
//!

// Coding conventions
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

// External libs
#[macro_use]
extern crate paymaster_logs as logs;
extern crate paymaster;
extern crate toml;

use std::{env, fs, io, process};

use paymaster::config::Configuration;
use paymaster::driver::Driver;
use paymaster::engine::{Engine, Params};
use paymaster::journal::{FailureLog, Journal};
use paymaster::pool::PoolClient;
use paymaster::preflight;
use paymaster::rpc::{Chain, ChainRpc};
use paymaster::utils::Shutdown;

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let args: Vec<_> = env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        println!("Usage: {} <datadir> [check]", args[0]);
        return 1;
    }
    let check_only = args.len() == 3;
    if check_only && args[2] != "check" {
        eprintln!("Unknown subcommand {}", args[2]);
        return 1;
    }

    let datadir = args[1].trim_end_matches('/').to_owned();
    let config_path = format!("{}/config.toml", datadir);
    let s = match fs::read_to_string(&config_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open configuration {}: {}", config_path, e);
            return 1;
        }
    };
    let config: Configuration = match toml::from_str(&s) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return 1;
        }
    };

    logs::initialize(config.local.log_level, "disburser", Box::new(io::stderr()));
    slog!(StartingDisburser, config_path: &config_path[..],
        version: env!("CARGO_PKG_VERSION"),
    );

    if let Err(e) = config.sanity_check() {
        eprintln!("Invalid configuration: {}", e);
        return 1;
    }

    let mut chain = Chain::new(
        config.chain.rpc_url.clone(),
        Some(config.chain.rpc_user.clone()),
        Some(config.chain.rpc_password.clone()),
        config.chain.rpc_timeout,
        config.chain.use_wallet_signing,
    );
    let pool = match PoolClient::new(
        &config.pool.api_base_url,
        &config.pool.api_key,
        config.pool.request_timeout,
    ) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to create pool client: {}", e);
            return 1;
        }
    };

    if let Err(e) = preflight::run(&mut chain, &pool, &config) {
        eprintln!("Preflight failed: {}", e);
        return 1;
    }

    let journal_path = resolve(&datadir, &config.journal.path);
    let journal = match Journal::open(&journal_path) {
        Ok(journal) => journal,
        Err(e) => {
            eprintln!("Failed to open journal {}: {}", journal_path, e);
            return 1;
        }
    };

    if check_only {
        return self_test(&chain, &journal);
    }

    let failures = FailureLog::new(&resolve(&datadir, &config.local.failed_payment_log));
    let engine = Engine::new(Params::from_config(&config), journal, failures);
    let automated = config.automation.enabled;
    let mut driver = Driver::new(chain, pool, engine, config.automation.clone(), Shutdown::new());

    let outcome = if automated {
        driver.run_automated()
    } else {
        driver.run_interactive()
    };
    match outcome {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Fatal engine error: {}", e);
            2
        }
    }
}

/// The self-test: configuration and preflight have passed by the time
/// this runs; probe the journal against the wallet so an operator can
/// tell the two agree.
fn self_test(chain: &Chain, journal: &Journal) -> i32 {
    println!("configuration and preflight: ok");
    println!("journal: {} completed payments on record", journal.len());
    if let Some(entry) = journal.snapshot().last() {
        match chain.tx_info(entry.transaction_id) {
            Ok(info) => {
                println!(
                    "journaled payment {} completed by {} ({} confirmations)",
                    entry.payment_id, info.txid, info.confirmations,
                );
            }
            Err(e) => {
                eprintln!(
                    "journaled payment {} completed by {}, but the wallet does not know it: {}",
                    entry.payment_id, entry.transaction_id, e,
                );
                return 1;
            }
        }
    }
    0
}

fn resolve(datadir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("{}/{}", datadir, path)
    }
}

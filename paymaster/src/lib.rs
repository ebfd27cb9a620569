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


//! # Paymaster
//! This is the library used by the disburser daemon to pay out miner
//! balances on the mainchain. It is separated into its own library mainly
//! for ease of testing; it is not expected to be used outside of this
//! project.
//!

// Coding conventions
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

// External libs
extern crate bitcoin;
extern crate jsonrpc;
extern crate reqwest;
extern crate serde;
#[macro_use] extern crate serde_derive;
extern crate serde_json;
#[cfg(test)]
extern crate tempfile;
extern crate time;
#[cfg(test)]
extern crate toml;

#[macro_use]
pub extern crate paymaster_logs as logs;
#[macro_use]
pub extern crate paymaster_common as common;

#[macro_use] pub mod macros;
pub mod config;
pub mod driver;
pub mod engine;
pub mod fee;
pub mod journal;
pub mod pool;
pub mod preflight;
pub mod rpc;
pub mod utils;

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


//! # Paymaster Common
//! Primitive types and constants shared between the paymaster library,
//! the logging crate and the daemon binaries.
//!

// Coding conventions
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

extern crate serde;
#[macro_use]
extern crate serde_derive;

pub mod constants;
#[macro_use]
pub mod macros;

use std::fmt;

/// A block height (or height delta, e.g. number of confirmations)
pub type BlockHeight = u64;

/// The pool-assigned identifier of a payment obligation. Positive and
/// globally unique within the pool scope; never reused.
pub type PaymentId = u64;

/// The mode the disburser is running in.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Not currently inside a batch.
    Idle,
    /// An operator-driven batch.
    Interactive,
    /// A block-height-triggered batch.
    Automated,
}

impl Default for BatchMode {
    fn default() -> BatchMode {
        BatchMode::Idle
    }
}

impl fmt::Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            BatchMode::Idle => f.write_str("idle"),
            BatchMode::Interactive => f.write_str("interactive"),
            BatchMode::Automated => f.write_str("automated"),
        }
    }
}

/// Logging context describing the batch currently being processed.
/// Attached to every structured log line.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct BatchCtx {
    /// Sequence number of the batch within this process, starting at 1.
    /// 0 means no batch has started yet.
    pub batch: u64,
    /// The mode the batch runs in.
    pub mode: BatchMode,
}

impl BatchCtx {
    /// Create a context for the given batch number and mode.
    pub fn new(batch: u64, mode: BatchMode) -> BatchCtx {
        BatchCtx {
            batch: batch,
            mode: mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate serde_json;

    #[test]
    fn batch_ctx_roundtrip() {
        let ctx = BatchCtx::new(7, BatchMode::Automated);
        let encoded = serde_json::to_string(&ctx).unwrap();
        assert_eq!(encoded, "{\"batch\":7,\"mode\":\"automated\"}");
        let decoded: BatchCtx = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, ctx);
    }

    #[test]
    fn default_ctx_is_idle() {
        let ctx = BatchCtx::default();
        assert_eq!(ctx.batch, 0);
        assert_eq!(ctx.mode, BatchMode::Idle);
    }
}

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

//! # RPC logs
//!

use jsonrpc;

/// an RPC request
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize)]
pub struct RpcRequest<'a> {
    /// the method
    pub method: &'a str,
    /// the arguments
    pub arguments: &'a [String],
}

/// an RPC response
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize)]
pub struct RpcResponse<'a> {
    /// the method
    pub method: &'a str,
    /// the result synopsis
    pub result: &'a str,
    /// RPC duration in nanoseconds
    pub duration_ns: u128,
}

/// Verbose result portion of an RPC response
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize)]
pub struct RpcResultTrace<'a> {
    /// the result
    pub result: &'a str,
}

/// The node is warming up and cannot respond to RPC
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize)]
pub struct WarmingUp {}

/// The node is done warming up and can respond to RPC
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize)]
pub struct WarmedUp {}

/// The address-validity probe could not reach the node; the address is
/// assumed valid so that a flaky node cannot wedge all payouts. The node
/// re-checks the address when the transaction is constructed.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct AssumingAddressValid<'a> {
    /// The address that could not be validated
    pub address: &'a str,
    /// The transport error
    pub error: String,
}

/// RPC communication failure
#[derive(Clone, Serialize)]
pub struct Error<'a, 'b> {
    /// What we were trying to do when we encountered the error
    pub action: String,
    /// The error we received
    #[serde(serialize_with = "::serialize_display")]
    pub error: &'b jsonrpc::Error,
    /// The RPC method involved, if any
    pub method: &'a str,
}

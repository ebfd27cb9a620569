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

//! # Pool Gateway
//! Typed surface over the pool's admin HTTP API: fetching pending payment
//! obligations and acknowledging completed ones.
//!

use std::time::Duration;
use std::{error, fmt};

use bitcoin;
use bitcoin::Amount;
use reqwest;

use common::PaymentId;

/// User-Agent header for log attribution on the pool side.
pub const USER_AGENT: &str = concat!("paymaster-disburser/", env!("CARGO_PKG_VERSION"));

/// Pool gateway error.
#[derive(Debug)]
pub enum Error {
    /// Transport-level failure reaching the pool.
    Http(reqwest::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Http(ref e) => write!(f, "pool api: {}", e),
        }
    }
}

impl error::Error for Error {
    fn cause(&self) -> Option<&dyn error::Error> {
        match *self {
            Error::Http(ref e) => Some(e),
        }
    }
}

#[doc(hidden)]
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Error {
        Error::Http(e)
    }
}

/// A pending payment obligation, as supplied by the pool. Never mutated
/// by the disburser.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct Obligation {
    /// Pool-assigned identifier, unique for the obligation's lifetime
    pub id: PaymentId,
    /// Destination chain address, validated only through the node
    pub address: String,
    /// Amount owed to the miner
    #[serde(with = "bitcoin::util::amount::serde::as_btc")]
    pub amount: Amount,
    /// When the pool created the obligation (UTC)
    #[serde(rename = "createdUtc")]
    pub created_at: String,
}

/// Response of the pending-payments endpoint.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
struct PendingResponse {
    #[serde(rename = "poolId", default)]
    pool_id: String,
    #[serde(default)]
    payments: Vec<Obligation>,
}

/// Body of the payment-completion endpoint.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
struct CompleteRequest<'a> {
    #[serde(rename = "paymentId")]
    payment_id: PaymentId,
    #[serde(rename = "transactionId")]
    transaction_id: &'a str,
}

/// Typed surface of the pool admin API; abstracted behind a trait so it
/// can be mocked out during testing.
pub trait PoolApi {
    /// Quick probe that the pool API is reachable and accepts our key.
    fn test_connection(&self) -> bool;

    /// Fetch the pending payment obligations of a pool, oldest first.
    /// A non-2xx answer means the pool has nothing for us and yields an
    /// empty list; only transport failures are errors.
    fn pending_payments(&self, pool_id: &str) -> Result<Vec<Obligation>, Error>;

    /// Tell the pool a payment completed with the given transaction.
    /// Best effort: a false return is logged by the gateway and the
    /// caller continues, because the local journal is authoritative.
    fn mark_completed(&self, pool_id: &str, payment_id: PaymentId, txid: &bitcoin::Txid) -> bool;
}

/// A pool admin API client.
pub struct PoolClient {
    /// The underlying HTTP client.
    client: reqwest::blocking::Client,
    /// Base URL of the admin API, without trailing slash.
    base_url: String,
    /// Bearer token.
    api_key: String,
}

impl PoolClient {
    /// Create a new pool API client.
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<PoolClient, Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(PoolClient {
            client: client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl PoolApi for PoolClient {
    fn test_connection(&self) -> bool {
        let url = self.url("/api/admin/pools");
        slog!(PoolRequest, method: "GET", url: &url);
        match self.client.get(&url).bearer_auth(&self.api_key).send() {
            Ok(resp) => {
                slog!(PoolResponse, method: "GET", url: &url, status: resp.status().as_u16());
                resp.status().is_success()
            }
            Err(e) => {
                slog!(PoolUnreachable, error: e.to_string());
                false
            }
        }
    }

    fn pending_payments(&self, pool_id: &str) -> Result<Vec<Obligation>, Error> {
        let url = self.url(&format!("/api/admin/pools/{}/payments/pending", pool_id));
        slog!(PoolRequest, method: "GET", url: &url);
        let resp = match self.client.get(&url).bearer_auth(&self.api_key).send() {
            Ok(resp) => resp,
            Err(e) => {
                slog!(PoolUnreachable, error: e.to_string());
                return Err(Error::Http(e));
            }
        };
        slog!(PoolResponse, method: "GET", url: &url, status: resp.status().as_u16());
        if !resp.status().is_success() {
            // The pool is allowed to have nothing for us.
            return Ok(Vec::new());
        }
        let body: PendingResponse = resp.json()?;
        let total = body.payments.iter().fold(0u64, |acc, p| acc + p.amount.to_sat());
        slog!(PendingFetched, n_payments: body.payments.len(), total_sat: total);
        Ok(body.payments)
    }

    fn mark_completed(&self, pool_id: &str, payment_id: PaymentId, txid: &bitcoin::Txid) -> bool {
        let url = self.url(&format!("/api/admin/pools/{}/payments/complete", pool_id));
        let txid_hex = txid.to_string();
        let body = CompleteRequest {
            payment_id: payment_id,
            transaction_id: &txid_hex,
        };
        slog!(PoolRequest, method: "POST", url: &url);
        match self.client.post(&url).bearer_auth(&self.api_key).json(&body).send() {
            Ok(resp) => {
                let status = resp.status().as_u16();
                slog!(PoolResponse, method: "POST", url: &url, status: status);
                if resp.status().is_success() {
                    slog!(AckRecorded, payment_id: payment_id, txid: *txid);
                    true
                } else {
                    slog!(AckFailed, payment_id: payment_id, txid: *txid, status: status);
                    false
                }
            }
            Err(e) => {
                slog!(PoolUnreachable, error: e.to_string());
                slog!(AckFailed, payment_id: payment_id, txid: *txid, status: 0);
                false
            }
        }
    }
}

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

//! # RPC
//! Support for interacting with the chain node's RPC interface
//!

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use std::{error, fmt};

use bitcoin;
use bitcoin::Amount;
use jsonrpc;
use serde;
use serde_json;
use serde_json::value::RawValue;

use common::BlockHeight;

/// RPC error code from the node for a transaction that is already
/// confirmed in the chain.
pub const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;

/// RPC error code from the node while it is still warming up.
const RPC_IN_WARMUP: i32 = -28;

/// Chain gateway error.
#[derive(Debug)]
pub enum Error {
    /// JSONRPC communication. Transport-level failures and node-level
    /// application errors are distinguished by the inner variant.
    Rpc(jsonrpc::Error),
    /// The signer did not produce a complete transaction.
    SigningFailed(Vec<String>),
}

impl Error {
    /// Whether this is a transport-level failure (refused connection,
    /// timeout) as opposed to an answer from the node.
    pub fn is_transport(&self) -> bool {
        match *self {
            Error::Rpc(jsonrpc::Error::Transport(_)) => true,
            _ => false,
        }
    }

    /// The node-level error code, if the node answered with one.
    pub fn rpc_code(&self) -> Option<i32> {
        match *self {
            Error::Rpc(jsonrpc::Error::Rpc(ref e)) => Some(e.code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Rpc(ref e) => write!(f, "rpc: {}", e),
            Error::SigningFailed(ref errors) => {
                write!(f, "signer did not complete the transaction: {}", errors.join(". "))
            }
        }
    }
}

impl error::Error for Error {
    fn cause(&self) -> Option<&dyn error::Error> {
        match *self {
            Error::Rpc(ref e) => Some(e),
            Error::SigningFailed(..) => None,
        }
    }
}

#[doc(hidden)]
impl From<jsonrpc::Error> for Error {
    fn from(e: jsonrpc::Error) -> Error {
        Error::Rpc(e)
    }
}

fn bad_amount(e: impl fmt::Display) -> Error {
    Error::Rpc(jsonrpc::Error::Json(
        serde::de::Error::custom(format!("bad amount from node: {}", e))
    ))
}

/// One input of a raw transaction, in the form `createrawtransaction`
/// expects it.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct TxInput {
    /// The transaction the input spends from
    pub txid: bitcoin::Txid,
    /// The output index being spent
    pub vout: u32,
}

/// An unspent wallet output, as reported by `listunspent`.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct UnspentOutput {
    /// The transaction the output belongs to
    pub txid: bitcoin::Txid,
    /// Index of the output
    pub vout: u32,
    /// Value of the output
    #[serde(with = "bitcoin::util::amount::serde::as_btc")]
    pub amount: Amount,
    /// Number of confirmations
    pub confirmations: BlockHeight,
    /// Whether the wallet considers the output safe to spend
    pub spendable: bool,
    /// Whether the wallet knows how to spend the output
    pub solvable: bool,
    /// The address the output pays, when the node can derive one
    #[serde(default)]
    pub address: Option<String>,
    /// The output script in hex
    #[serde(rename = "scriptPubKey", default)]
    pub script_pubkey: String,
}

impl UnspentOutput {
    /// The input that would spend this output.
    pub fn to_input(&self) -> TxInput {
        TxInput {
            txid: self.txid,
            vout: self.vout,
        }
    }
}

/// Response to `signrawtransactionwithwallet` / `signrawtransactionwithkey`.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct SignedTransaction {
    /// The (possibly partially) signed transaction in hex
    pub hex: String,
    /// Whether the transaction has a complete set of signatures
    pub complete: bool,
    /// Script verification errors, if any
    #[serde(default)]
    pub errors: serde_json::Value,
}

impl SignedTransaction {
    /// Flatten the node's verification errors into printable strings.
    pub fn error_strings(&self) -> Vec<String> {
        match self.errors {
            serde_json::Value::Array(ref errors) => errors.iter().map(|e| {
                match e.get("error").and_then(|v| v.as_str()) {
                    Some(msg) => msg.to_owned(),
                    None => e.to_string(),
                }
            }).collect(),
            serde_json::Value::Null => Vec::new(),
            ref other => vec![other.to_string()],
        }
    }
}

/// Response to `gettransaction` on a wallet transaction.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct TransactionInfo {
    /// The txid in hex
    pub txid: bitcoin::Txid,
    /// Number of confirmations; negative if the tx was reorged out
    pub confirmations: i64,
    /// The hash of the block this transaction appeared in, if any
    #[serde(default)]
    pub blockhash: Option<bitcoin::BlockHash>,
}

/// Trait representing something we can do general JSONRPC queries on;
/// abstracts over `jsonrpc::client::Client` so it can be mocked out
/// during testing.
pub trait Rpc {
    /// Convenience method to do a JSONRPC query and deserialize the result
    fn jsonrpc_query<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        args: &[jsonrpc::serde_json::Value],
    ) -> Result<T, jsonrpc::Error>;

    /// If there is any other error returns the Error, otherwise returns false.
    fn is_warming_up(&self) -> Result<bool, jsonrpc::Error>;
}

/// Chain-node RPC methods used by the disburser.
pub trait ChainRpc: Rpc {
    /// Route subsequent wallet-scoped calls to the given wallet. Callers
    /// must treat wallet reassignment as a global reset of the gateway.
    fn set_wallet(&mut self, wallet: &str);

    /// Whether signing goes through the node wallet
    /// (`signrawtransactionwithwallet`) or explicit keys.
    fn uses_wallet_signing(&self) -> bool {
        true
    }

    /// Quick probe that the node is reachable and answering RPC.
    fn test_connection(&self) -> bool {
        self.jsonrpc_query::<jsonrpc::serde_json::Value>("getblockchaininfo", &[]).is_ok()
    }

    /// List the wallets loaded on the node.
    fn list_wallets(&self) -> Result<Vec<String>, Error> {
        Ok(self.jsonrpc_query("listwallets", &[])?)
    }

    /// Get the spendable balance of the current wallet.
    fn balance(&self) -> Result<Amount, Error> {
        let btc: f64 = self.jsonrpc_query("getbalance", &[])?;
        Amount::from_btc(btc).map_err(bad_amount)
    }

    /// List the unspent outputs of the current wallet.
    fn list_unspent(&self) -> Result<Vec<UnspentOutput>, Error> {
        Ok(self.jsonrpc_query("listunspent", &[])?)
    }

    /// Check an address with the node. A transport failure of this probe
    /// is treated as "assume valid" so that a momentarily unresponsive
    /// node cannot wedge all payouts; the node re-checks every address
    /// when the transaction is constructed.
    fn validate_address(&self, address: &str) -> Result<bool, Error> {
        #[derive(Deserialize)]
        struct Response {
            isvalid: bool,
        }
        match self.jsonrpc_query::<Response>("validateaddress", &[address.into()]) {
            Ok(res) => Ok(res.isvalid),
            Err(e @ jsonrpc::Error::Transport(_)) => {
                slog!(AssumingAddressValid, address: address, error: e.to_string());
                Ok(true)
            }
            Err(e) => Err(Error::Rpc(e)),
        }
    }

    /// Get a fresh receive address from the current wallet.
    fn new_address(&self) -> Result<String, Error> {
        Ok(self.jsonrpc_query("getnewaddress", &[])?)
    }

    /// Create an unsigned raw transaction over the given inputs and
    /// address/amount pairs. Returns the serialized transaction in hex.
    /// Amounts are satoshi-precise and serialize to at most 8 fractional
    /// digits.
    fn create_raw_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &BTreeMap<String, Amount>,
    ) -> Result<String, Error> {
        let mut out_map = jsonrpc::serde_json::Map::with_capacity(outputs.len());
        for (address, amount) in outputs {
            out_map.insert(address.clone(), amount.to_btc().into());
        }
        Ok(self.jsonrpc_query("createrawtransaction", &[
            jsonrpc::serde_json::to_value(inputs).expect("serializing inputs"),
            out_map.into(),
        ])?)
    }

    /// Ask the node to sign a raw transaction. Fails with
    /// [Error::SigningFailed] when the signer does not complete it.
    fn sign_raw_transaction(&self, hex: &str) -> Result<SignedTransaction, Error> {
        let res: SignedTransaction = if self.uses_wallet_signing() {
            self.jsonrpc_query("signrawtransactionwithwallet", &[hex.into()])?
        } else {
            // With no keys supplied the node completes the signatures it
            // can from the transaction itself and reports what is missing.
            self.jsonrpc_query("signrawtransactionwithkey", &[
                hex.into(),
                jsonrpc::serde_json::Value::Array(vec![]),
            ])?
        };
        if res.complete {
            Ok(res)
        } else {
            Err(Error::SigningFailed(res.error_strings()))
        }
    }

    /// Broadcast a fully-signed transaction. Returns its txid.
    fn send_raw_transaction(&self, hex: &str) -> Result<bitcoin::Txid, Error> {
        Ok(self.jsonrpc_query("sendrawtransaction", &[hex.into()])?)
    }

    /// Get the number of blocks in the best chain.
    fn block_count(&self) -> Result<BlockHeight, Error> {
        Ok(self.jsonrpc_query("getblockcount", &[])?)
    }

    /// Get wallet information on a transaction.
    fn tx_info(&self, txid: bitcoin::Txid) -> Result<TransactionInfo, Error> {
        Ok(self.jsonrpc_query("gettransaction", &[txid.to_string().into()])?)
    }
}

/// A chain-node client.
pub struct Chain {
    /// The underlying jsonrpc client.
    client: jsonrpc::client::Client,
    /// Params to rebuild the client on wallet reassignment (url, user, pass).
    params: (String, Option<String>, Option<String>),
    /// Per-call timeout.
    timeout: Duration,
    /// The wallet calls are currently routed to.
    wallet: Option<String>,
    /// Whether signing goes through the node wallet.
    wallet_signing: bool,
}

impl Chain {
    /// Create a new chain-node client. No wallet is selected initially;
    /// see [ChainRpc::set_wallet].
    pub fn new(
        url: String,
        user: Option<String>,
        pass: Option<String>,
        timeout: Duration,
        wallet_signing: bool,
    ) -> Chain {
        let client = Chain::build_client(&url, &user, &pass, timeout, None);
        Chain {
            client: client,
            params: (url, user, pass),
            timeout: timeout,
            wallet: None,
            wallet_signing: wallet_signing,
        }
    }

    fn build_client(
        url: &str,
        user: &Option<String>,
        pass: &Option<String>,
        timeout: Duration,
        wallet: Option<&str>,
    ) -> jsonrpc::client::Client {
        let url = match wallet {
            Some(w) => format!("{}/wallet/{}", url.trim_end_matches('/'), w),
            None => url.to_owned(),
        };
        let mut client_builder = jsonrpc::simple_http::Builder::new()
            .timeout(timeout)
            .url(&url)
            .expect("simple_http builder");
        if let Some(u) = user.clone() {
            client_builder = client_builder.auth(u, pass.clone());
        }
        jsonrpc::Client::with_transport(client_builder.build())
    }

    /// The wallet calls are currently routed to.
    pub fn wallet(&self) -> Option<&str> {
        self.wallet.as_ref().map(|w| &w[..])
    }
}

impl Rpc for Chain {
    /// Convenience method to do a JSONRPC query and deserialize the result
    fn jsonrpc_query<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        args: &[jsonrpc::serde_json::Value],
    ) -> Result<T, jsonrpc::Error> {
        let args_raw: Vec<Box<RawValue>> = args.iter().map(|a| jsonrpc::arg(a)).collect();
        slog!(RpcRequest, method: query,
            arguments: &args_raw.iter().map(|a| a.get().to_owned()).collect::<Vec<_>>(),
        );
        let request = self.client.build_request(query, &args_raw);
        let start_time = Instant::now();
        let response = self.client.send_request(request)?;
        let duration_ns = start_time.elapsed().as_nanos();
        if let Some(ref error) = response.error {
            slog!(RpcResponse, method: query, result: format!("error: {:?}", error).as_str(),
                duration_ns,
            );
        } else if let Some(ref result) = response.result {
            let size = result.get().len();
            slog!(RpcResponse, method: query, duration_ns,
                result: format!("{} bytes", size).as_str(),
            );
            slog!(RpcResultTrace, result: &result.to_string());
        } else {
            slog!(RpcResponse, method: query, result: "null", duration_ns);
        }
        response.result::<T>()
    }

    fn is_warming_up(&self) -> Result<bool, jsonrpc::Error> {
        let request = self.client.build_request("getblockchaininfo", &[]);
        match self.client.send_request(request) {
            Ok(response) => {
                match response.error {
                    Some(e) => {
                        if e.code == RPC_IN_WARMUP {
                            slog!(WarmingUp);
                            Ok(true)
                        } else {
                            let e = jsonrpc::Error::Rpc(e);
                            slog!(Error, action: "warmup check".to_owned(), error: &e,
                                method: "getblockchaininfo",
                            );
                            Err(e)
                        }
                    }
                    None => {
                        slog!(WarmedUp);
                        Ok(false)
                    }
                }
            }
            Err(e) => {
                slog!(Error, action: "warmup check".to_owned(), error: &e,
                    method: "getblockchaininfo",
                );
                Err(e)
            }
        }
    }
}

impl ChainRpc for Chain {
    fn set_wallet(&mut self, wallet: &str) {
        let (ref url, ref user, ref pass) = self.params;
        self.client = Chain::build_client(url, user, pass, self.timeout, Some(wallet));
        self.wallet = Some(wallet.to_owned());
    }

    fn uses_wallet_signing(&self) -> bool {
        self.wallet_signing
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io;

    use serde_json;
    use serde_json::json;

    use super::*;

    fn transport_error() -> jsonrpc::Error {
        jsonrpc::Error::Transport(Box::new(
            io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
        ))
    }

    #[test]
    fn hash_decode() {
        let hash_str = "\"84e3fba7a2e319acd03098f80ad4b44f8efbcd7e6a70cced228b2d706c2012c6\"";
        let _: bitcoin::hashes::sha256d::Hash = serde_json::from_str(&hash_str).expect("decoding json");
        let _: bitcoin::Txid = serde_json::from_str(&hash_str).expect("decoding json");
    }

    #[test]
    fn listunspent_decode() {
        let unspent = "{
          \"txid\": \"84e3fba7a2e319acd03098f80ad4b44f8efbcd7e6a70cced228b2d706c2012c6\",
          \"vout\": 1,
          \"address\": \"pl1qfmppwlu9cezqgtaggpyfydqmw0zy0pgkh68ggu\",
          \"scriptPubKey\": \"00144ec217bfc2e32202fa8808912468376f111e1456\",
          \"amount\": 10.00000000,
          \"confirmations\": 3,
          \"spendable\": true,
          \"solvable\": true,
          \"safe\": true
        }";
        let decode: UnspentOutput = serde_json::from_str(&unspent).expect("decoding json");
        assert_eq!(decode.vout, 1);
        assert_eq!(decode.amount, Amount::from_sat(10_0000_0000));
        assert_eq!(decode.confirmations, 3);
        assert!(decode.spendable);
        assert!(decode.solvable);
        assert_eq!(decode.address.as_ref().unwrap(), "pl1qfmppwlu9cezqgtaggpyfydqmw0zy0pgkh68ggu");
        assert_eq!(decode.to_input().vout, 1);

        // fields the disburser doesn't read may be absent
        let minimal = "{
          \"txid\": \"84e3fba7a2e319acd03098f80ad4b44f8efbcd7e6a70cced228b2d706c2012c6\",
          \"vout\": 0,
          \"amount\": 0.00194000,
          \"confirmations\": 0,
          \"spendable\": false,
          \"solvable\": false
        }";
        let decode: UnspentOutput = serde_json::from_str(&minimal).expect("decoding json");
        assert_eq!(decode.amount, Amount::from_sat(194_000));
        assert!(decode.address.is_none());
        assert!(!decode.spendable);
    }

    #[test]
    fn signrawtransaction_decode() {
        let complete = "{ \"hex\": \"beef\", \"complete\": true }";
        let decode: SignedTransaction = serde_json::from_str(&complete).expect("decoding json");
        assert!(decode.complete);
        assert!(decode.error_strings().is_empty());

        let incomplete = "{
          \"hex\": \"beef\",
          \"complete\": false,
          \"errors\": [
            {\"txid\": \"84e3fba7a2e319acd03098f80ad4b44f8efbcd7e6a70cced228b2d706c2012c6\",
             \"vout\": 0, \"error\": \"CHECK(MULTI)SIG failing with non-zero signature count\"}
          ]
        }";
        let decode: SignedTransaction = serde_json::from_str(&incomplete).expect("decoding json");
        assert!(!decode.complete);
        assert_eq!(
            decode.error_strings(),
            vec!["CHECK(MULTI)SIG failing with non-zero signature count".to_owned()],
        );
    }

    struct ValidatingDummy {
        // flip to simulate the node being unreachable for the probe
        unreachable: Cell<bool>,
    }
    impl_dummy_rpc!(
        ValidatingDummy,
        dummy,
        _args,
        "validateaddress" => {
            if dummy.unreachable.get() {
                Err(super::tests::transport_error())
            } else {
                let addr = _args[0].as_str().unwrap();
                Ok(json!({ "isvalid": addr.starts_with("pl1") }))
            }
        }
    );

    #[test]
    fn validate_address_policy() {
        let dummy = ValidatingDummy { unreachable: Cell::new(false) };
        assert_eq!(dummy.validate_address("pl1qgood").unwrap(), true);
        assert_eq!(dummy.validate_address("garbage").unwrap(), false);

        // transport failure of the probe assumes validity
        dummy.unreachable.set(true);
        assert_eq!(dummy.validate_address("garbage").unwrap(), true);
    }

    struct ConstructingDummy;
    impl_dummy_rpc!(
        ConstructingDummy,
        _dummy,
        _args,
        "createrawtransaction" => {
            let inputs: Vec<TxInput> = serde_json::from_value(_args[0].clone()).unwrap();
            assert_eq!(inputs.len(), 1);
            assert_eq!(inputs[0].vout, 1);
            let outputs = _args[1].as_object().unwrap();
            assert_eq!(outputs.len(), 2);
            assert_eq!(outputs["pl1qminer"].as_f64().unwrap(), 9.0);
            assert_eq!(outputs["pl1qchange"].as_f64().unwrap(), 0.99772);
            Ok(json!("0200aabb"))
        },
        "sendrawtransaction" => {
            assert_eq!(_args[0].as_str().unwrap(), "0200aabb");
            Ok(json!("84e3fba7a2e319acd03098f80ad4b44f8efbcd7e6a70cced228b2d706c2012c6"))
        }
    );

    #[test]
    fn construct_and_broadcast() {
        let dummy = ConstructingDummy;
        let inputs = vec![TxInput {
            txid: "84e3fba7a2e319acd03098f80ad4b44f8efbcd7e6a70cced228b2d706c2012c6"
                .parse().unwrap(),
            vout: 1,
        }];
        let mut outputs = BTreeMap::new();
        outputs.insert("pl1qminer".to_owned(), Amount::from_sat(9_0000_0000));
        outputs.insert("pl1qchange".to_owned(), Amount::from_sat(9977_2000));
        let hex = dummy.create_raw_transaction(&inputs, &outputs).unwrap();
        let txid = dummy.send_raw_transaction(&hex).unwrap();
        assert_eq!(txid, inputs[0].txid);
    }

    struct SigningDummy {
        complete: bool,
    }
    impl_dummy_rpc!(
        SigningDummy,
        dummy,
        _args,
        "signrawtransactionwithwallet" => Ok(json!({
            "hex": "0200aabbcc",
            "complete": dummy.complete,
            "errors": if dummy.complete {
                json!(null)
            } else {
                json!([{ "error": "Input not found or already spent" }])
            },
        }))
    );

    #[test]
    fn signing_failure_classified() {
        let dummy = SigningDummy { complete: true };
        let signed = dummy.sign_raw_transaction("0200aabb").unwrap();
        assert_eq!(signed.hex, "0200aabbcc");

        let dummy = SigningDummy { complete: false };
        match dummy.sign_raw_transaction("0200aabb") {
            Err(Error::SigningFailed(errors)) => {
                assert_eq!(errors, vec!["Input not found or already spent".to_owned()]);
            }
            other => panic!("expected SigningFailed, got {:?}", other.map(|s| s.hex)),
        }
    }

    #[test]
    fn error_classification() {
        let e = Error::Rpc(transport_error());
        assert!(e.is_transport());
        assert_eq!(e.rpc_code(), None);

        let e = Error::Rpc(jsonrpc::Error::Rpc(jsonrpc::error::RpcError {
            code: RPC_VERIFY_ALREADY_IN_CHAIN,
            message: "already in chain".to_owned(),
            data: None,
        }));
        assert!(!e.is_transport());
        assert_eq!(e.rpc_code(), Some(RPC_VERIFY_ALREADY_IN_CHAIN));
    }
}

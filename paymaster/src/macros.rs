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


//! # Macros
//! Utility macros needed in the rest of the code.

/// Implements `Rpc` and `ChainRpc` for a mock type from a table of
/// method-name arms. Each arm is an expression of type
/// `Result<serde_json::Value, jsonrpc::Error>`; the mock's fields are
/// reachable through the given self-alias and the raw call arguments
/// through the given args-alias. Calling a method with no arm panics.
#[cfg(test)]
macro_rules! impl_dummy_rpc {
    ($ty:ty, $altself:ident, $argsself:ident, $($call:pat => $result:expr),* $(,)*) => {

        impl ::rpc::Rpc for $ty {
            fn jsonrpc_query<T: ::serde::de::DeserializeOwned>(
                &self,
                query: &str,
                $argsself: &[::jsonrpc::serde_json::Value],
            ) -> Result<T, ::jsonrpc::Error> {
                let $altself = self;
                let json: ::jsonrpc::serde_json::Value = match query {
                    $(
                    $call => {
                        let result: Result<::jsonrpc::serde_json::Value, ::jsonrpc::Error>
                            = $result;
                        result?
                    }
                    )*
                    _ => panic!("called mocked RPC `{}` which has no mock implementation", query),
                };

                Ok(::serde::Deserialize::deserialize(json)?)
            }

            fn is_warming_up(&self) -> Result<bool, ::jsonrpc::Error> {
                unimplemented!()
            }
        }

        impl ::rpc::ChainRpc for $ty {
            fn set_wallet(&mut self, _wallet: &str) {}
        }
    }
}

//! Dingocoin daemon JSON-RPC client.
//!
//! The daemon owns all UTXO wallet keys; this client only drives it. Raw
//! transactions are built, decoded, verified, signed, and broadcast through
//! RPC so the node never handles key material itself.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::amount::Satoshi;
use crate::error::{Error, Result};
use crate::metrics;

/// Error payload returned by the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "daemon rpc error {}: {}", self.code, self.message)
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

/// Result of `validateaddress`. The pubkey is present only for wallet-owned
/// addresses, which is exactly what deposit-address registration needs.
#[derive(Debug, Clone, Deserialize)]
pub struct AddressInfo {
    #[serde(rename = "isvalid")]
    pub is_valid: bool,
    #[serde(default)]
    pub pubkey: Option<String>,
}

/// Result of `createmultisig`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultisigAddress {
    pub address: String,
    pub redeem_script: String,
}

/// A confirmed unspent output as exchanged between authorities.
///
/// Equality over `(txid, vout, amount, address)` is what the payout
/// consensus intersection operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnspentOutput {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub amount: Satoshi,
}

#[derive(Debug, Deserialize)]
struct RawReceived {
    address: String,
    amount: f64,
}

#[derive(Debug, Deserialize)]
struct RawUnspent {
    txid: String,
    vout: u32,
    address: String,
    amount: f64,
}

#[derive(Debug, Deserialize)]
pub struct DecodedVin {
    pub txid: String,
    pub vout: u32,
}

#[derive(Debug, Deserialize)]
pub struct DecodedScriptPubKey {
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedVout {
    pub value: f64,
    pub script_pub_key: DecodedScriptPubKey,
}

#[derive(Debug, Deserialize)]
pub struct DecodedTransaction {
    pub vin: Vec<DecodedVin>,
    pub vout: Vec<DecodedVout>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignedTransaction {
    pub hex: String,
    pub complete: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockchainInfo {
    pub blocks: u64,
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: String,
}

/// JSON-RPC client for the Dingocoin daemon.
#[derive(Debug, Clone)]
pub struct DingoClient {
    url: String,
    user: String,
    password: String,
    client: Client,
}

impl DingoClient {
    pub fn new(url: &str, user: &str, password: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::ChainView(format!("failed to build daemon client: {e}")))?;
        Ok(DingoClient {
            url: url.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            client,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({
                "jsonrpc": "1.0",
                "id": method,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(|e| chain_view(format!("daemon unreachable: {e}")))?;

        let response: RpcResponse = response
            .json()
            .await
            .map_err(|e| chain_view(format!("bad daemon response: {e}")))?;

        if let Some(error) = response.error {
            return Err(chain_view(error.to_string()));
        }
        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|e| chain_view(format!("unexpected {method} result: {e}")))
    }

    pub async fn get_new_address(&self) -> Result<String> {
        self.call("getnewaddress", vec![]).await
    }

    pub async fn validate_address(&self, address: &str) -> Result<AddressInfo> {
        self.call("validateaddress", vec![json!(address)]).await
    }

    /// True when the daemon parses `address` as a valid Coin address.
    pub async fn is_valid_address(&self, address: &str) -> Result<bool> {
        Ok(self.validate_address(address).await?.is_valid)
    }

    /// Derive the k-of-N multisig address. The pubkey order is the fixed
    /// authority order, so every node derives the same address.
    pub async fn create_multisig(&self, k: usize, pubkeys: &[String]) -> Result<MultisigAddress> {
        self.call("createmultisig", vec![json!(k), json!(pubkeys)])
            .await
    }

    /// Watch the redeem script so deposits show up and spends can be signed.
    pub async fn import_address(&self, redeem_script: &str) -> Result<()> {
        self.call::<()>("importaddress", vec![json!(redeem_script), json!(""), json!(false)])
            .await
    }

    /// Confirmed totals received per watched address.
    pub async fn list_received_by_address(
        &self,
        confirmations: u64,
    ) -> Result<HashMap<String, Satoshi>> {
        let rows: Vec<RawReceived> = self
            .call(
                "listreceivedbyaddress",
                vec![json!(confirmations), json!(false), json!(true)],
            )
            .await?;
        let mut received = HashMap::with_capacity(rows.len());
        for row in rows {
            received.insert(row.address, Satoshi::from_coin_f64(row.amount)?);
        }
        Ok(received)
    }

    pub async fn list_unspent(
        &self,
        confirmations: u64,
        addresses: &[String],
    ) -> Result<Vec<UnspentOutput>> {
        let rows: Vec<RawUnspent> = self
            .call(
                "listunspent",
                vec![json!(confirmations), json!(9_999_999), json!(addresses)],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(UnspentOutput {
                    txid: row.txid,
                    vout: row.vout,
                    address: row.address,
                    amount: Satoshi::from_coin_f64(row.amount)?,
                })
            })
            .collect()
    }

    /// Build the unsigned settlement transaction spending `unspent` into the
    /// given address→amount vouts.
    pub async fn create_raw_transaction(
        &self,
        unspent: &[UnspentOutput],
        vouts: &BTreeMap<String, Satoshi>,
    ) -> Result<String> {
        let inputs: Vec<Value> = unspent
            .iter()
            .map(|u| json!({ "txid": u.txid, "vout": u.vout }))
            .collect();
        let mut outputs = serde_json::Map::new();
        for (address, amount) in vouts {
            outputs.insert(address.clone(), coin_amount_json(*amount)?);
        }
        self.call(
            "createrawtransaction",
            vec![json!(inputs), Value::Object(outputs)],
        )
        .await
    }

    pub async fn decode_raw_transaction(&self, hex: &str) -> Result<DecodedTransaction> {
        self.call("decoderawtransaction", vec![json!(hex)]).await
    }

    /// Add this wallet's signatures; `complete` turns true once enough
    /// authorities have signed.
    pub async fn sign_raw_transaction(&self, hex: &str) -> Result<SignedTransaction> {
        self.call("signrawtransaction", vec![json!(hex)]).await
    }

    pub async fn send_raw_transaction(&self, hex: &str) -> Result<String> {
        self.call("sendrawtransaction", vec![json!(hex)]).await
    }

    pub async fn get_blockchain_info(&self) -> Result<BlockchainInfo> {
        self.call("getblockchaininfo", vec![]).await
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<String> {
        self.call("getblockhash", vec![json!(height)]).await
    }

    /// Height and block hash every sealed envelope is anchored to:
    /// `syncDelayThreshold` blocks behind the current tip.
    pub async fn envelope_anchor(&self, sync_delay_threshold: u64) -> Result<(u64, String)> {
        let info = self.get_blockchain_info().await?;
        let height = info.blocks.saturating_sub(sync_delay_threshold);
        let hash = self.get_block_hash(height).await?;
        Ok((height, hash))
    }

    /// Check a raw transaction against the exact expected shape.
    ///
    /// The inputs must equal `unspent` by `(txid, vout)` and the outputs must
    /// pay precisely the non-dust `vouts`, nothing more.
    pub async fn verify_raw_transaction(
        &self,
        unspent: &[UnspentOutput],
        vouts: &BTreeMap<String, Satoshi>,
        hex: &str,
    ) -> Result<()> {
        let decoded = self.decode_raw_transaction(hex).await?;
        verify_decoded_transaction(unspent, vouts, &decoded)
    }
}

/// Pure shape check used by [`DingoClient::verify_raw_transaction`].
pub fn verify_decoded_transaction(
    unspent: &[UnspentOutput],
    vouts: &BTreeMap<String, Satoshi>,
    decoded: &DecodedTransaction,
) -> Result<()> {
    let expected_inputs: HashSet<(&str, u32)> = unspent
        .iter()
        .map(|u| (u.txid.as_str(), u.vout))
        .collect();
    let actual_inputs: HashSet<(&str, u32)> = decoded
        .vin
        .iter()
        .map(|v| (v.txid.as_str(), v.vout))
        .collect();
    if expected_inputs != actual_inputs || decoded.vin.len() != unspent.len() {
        return Err(Error::TxShapeMismatch(
            "transaction inputs do not match the agreed unspent set".into(),
        ));
    }

    if decoded.vout.len() != vouts.len() {
        return Err(Error::TxShapeMismatch(format!(
            "expected {} outputs, transaction has {}",
            vouts.len(),
            decoded.vout.len()
        )));
    }
    let mut seen: HashSet<&String> = HashSet::new();
    for out in &decoded.vout {
        let [address] = out.script_pub_key.addresses.as_slice() else {
            return Err(Error::TxShapeMismatch(
                "output does not pay a single address".into(),
            ));
        };
        let amount = Satoshi::from_coin_f64(out.value)?;
        match vouts.get(address.as_str()) {
            None => {
                return Err(Error::TxShapeMismatch(format!(
                    "unexpected output to {address}"
                )));
            }
            Some(expected) if *expected != amount => {
                return Err(Error::TxShapeMismatch(format!(
                    "output to {address} pays {amount}, expected {expected}"
                )));
            }
            Some(_) => {
                if !seen.insert(address) {
                    return Err(Error::TxShapeMismatch(format!(
                        "repeated output to {address}"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Daemon RPC failure: counted and surfaced as a chain-view error.
fn chain_view(message: String) -> Error {
    metrics::record_rpc_error("dingo");
    Error::ChainView(message)
}

/// Vout amounts go to the daemon as JSON numbers in whole Coins.
fn coin_amount_json(amount: Satoshi) -> Result<Value> {
    serde_json::Number::from_f64(amount.sat() as f64 / crate::amount::COIN as f64)
        .map(Value::Number)
        .ok_or_else(|| Error::Internal(format!("unrepresentable vout amount {amount}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::COIN;

    fn utxo(txid: &str, vout: u32, address: &str, sat: u64) -> UnspentOutput {
        UnspentOutput {
            txid: txid.to_string(),
            vout,
            address: address.to_string(),
            amount: Satoshi::from_sat(sat),
        }
    }

    fn decoded(
        vins: &[(&str, u32)],
        vouts: &[(&str, f64)],
    ) -> DecodedTransaction {
        DecodedTransaction {
            vin: vins
                .iter()
                .map(|(txid, vout)| DecodedVin {
                    txid: txid.to_string(),
                    vout: *vout,
                })
                .collect(),
            vout: vouts
                .iter()
                .map(|(address, value)| DecodedVout {
                    value: *value,
                    script_pub_key: DecodedScriptPubKey {
                        addresses: vec![address.to_string()],
                    },
                })
                .collect(),
        }
    }

    fn expected_vouts(entries: &[(&str, u64)]) -> BTreeMap<String, Satoshi> {
        entries
            .iter()
            .map(|(a, sat)| (a.to_string(), Satoshi::from_sat(*sat)))
            .collect()
    }

    #[test]
    fn test_verify_accepts_exact_shape() {
        let unspent = vec![utxo("aa", 0, "Ddep", 100 * COIN), utxo("bb", 1, "Dchg", 7 * COIN)];
        let vouts = expected_vouts(&[("Ddest", 50 * COIN), ("Dchg", 30 * COIN)]);
        let tx = decoded(&[("bb", 1), ("aa", 0)], &[("Ddest", 50.0), ("Dchg", 30.0)]);
        assert!(verify_decoded_transaction(&unspent, &vouts, &tx).is_ok());
    }

    #[test]
    fn test_verify_rejects_missing_input() {
        let unspent = vec![utxo("aa", 0, "Ddep", 100 * COIN), utxo("bb", 1, "Dchg", 7 * COIN)];
        let vouts = expected_vouts(&[("Ddest", 50 * COIN)]);
        let tx = decoded(&[("aa", 0)], &[("Ddest", 50.0)]);
        assert!(matches!(
            verify_decoded_transaction(&unspent, &vouts, &tx),
            Err(Error::TxShapeMismatch(_))
        ));
    }

    #[test]
    fn test_verify_rejects_extra_output() {
        let unspent = vec![utxo("aa", 0, "Ddep", 100 * COIN)];
        let vouts = expected_vouts(&[("Ddest", 50 * COIN)]);
        let tx = decoded(&[("aa", 0)], &[("Ddest", 50.0), ("Dthief", 1.0)]);
        assert!(verify_decoded_transaction(&unspent, &vouts, &tx).is_err());
    }

    #[test]
    fn test_verify_rejects_amount_drift() {
        let unspent = vec![utxo("aa", 0, "Ddep", 100 * COIN)];
        let vouts = expected_vouts(&[("Ddest", 50 * COIN)]);
        let tx = decoded(&[("aa", 0)], &[("Ddest", 49.99999999)]);
        assert!(matches!(
            verify_decoded_transaction(&unspent, &vouts, &tx),
            Err(Error::TxShapeMismatch(_))
        ));
    }

    #[test]
    fn test_verify_rejects_duplicated_destination() {
        let unspent = vec![utxo("aa", 0, "Ddep", 100 * COIN)];
        let vouts = expected_vouts(&[("Ddest", 50 * COIN), ("Dchg", 25 * COIN)]);
        let tx = decoded(&[("aa", 0)], &[("Ddest", 50.0), ("Ddest", 25.0)]);
        assert!(verify_decoded_transaction(&unspent, &vouts, &tx).is_err());
    }
}

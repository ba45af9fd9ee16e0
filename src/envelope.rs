//! Signed, time-bound message envelopes.
//!
//! Every inter-node exchange and every reply to a user is `{data, signature}`
//! where the signature covers the canonical JSON encoding of `data`, and
//! `data` carries a recent chain height plus that block's hash. Replaying a
//! message across a fork or after expiry fails verification.

use alloy::primitives::Address;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::evm::{recover_personal, EvmClient};

pub const HEIGHT_FIELD: &str = "valDingoHeight";
pub const HASH_FIELD: &str = "valDingoHash";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub data: Value,
    pub signature: String,
}

/// Canonical encoding: serde_json objects are key-sorted maps, so encoding
/// any `Value` yields the same bytes on every node.
pub fn canonical_json(data: &Value) -> String {
    data.to_string()
}

impl Envelope {
    /// Wrap `payload`, anchoring it to `(height, hash)` and signing with the
    /// node's wallet key. `payload` must serialize to a JSON object.
    pub fn seal<T: Serialize>(
        payload: &T,
        evm: &EvmClient,
        height: u64,
        hash: &str,
    ) -> Result<Envelope> {
        let mut data = serde_json::to_value(payload)?;
        let object = data
            .as_object_mut()
            .ok_or_else(|| Error::Internal("envelope payload must be an object".into()))?;
        object.insert(HEIGHT_FIELD.to_string(), json!(height));
        object.insert(HASH_FIELD.to_string(), json!(hash));
        let signature = evm.sign_message(canonical_json(&data).as_bytes())?;
        Ok(Envelope { data, signature })
    }

    /// Address recovered from the signature over the canonical encoding.
    pub fn signer(&self) -> Result<Address> {
        recover_personal(canonical_json(&self.data).as_bytes(), &self.signature)
    }

    /// Point-to-point check: the envelope must be signed by `expected`.
    pub fn verify_signer(&self, expected: Address) -> Result<()> {
        let signer = self.signer()?;
        if signer != expected {
            return Err(Error::Unauthorized(format!(
                "envelope signed by {signer}, expected {expected}"
            )));
        }
        Ok(())
    }

    /// "Signed by some authority" check: exactly one of `allowed` must match.
    pub fn verify_any_signer(&self, allowed: &[Address]) -> Result<Address> {
        let signer = self.signer()?;
        let matches = allowed.iter().filter(|a| **a == signer).count();
        if matches != 1 {
            return Err(Error::Unauthorized(format!(
                "envelope signer {signer} is not a configured authority"
            )));
        }
        Ok(signer)
    }

    /// The `(valDingoHeight, valDingoHash)` pair the envelope is bound to.
    pub fn anchor(&self) -> Result<(u64, String)> {
        let height = self.data.get(HEIGHT_FIELD).and_then(Value::as_u64);
        let hash = self.data.get(HASH_FIELD).and_then(Value::as_str);
        match (height, hash) {
            (Some(height), Some(hash)) => Ok((height, hash.to_string())),
            _ => Err(Error::MalformedRequest(
                "envelope is missing its chain anchor".into(),
            )),
        }
    }

    /// Reject envelopes anchored too far in the past or on another chain.
    ///
    /// `actual_hash` is the local daemon's hash at the envelope's height;
    /// the caller fetches it so this check stays pure.
    pub fn verify_anchor(
        &self,
        current_tip: u64,
        actual_hash: &str,
        sync_delay_threshold: u64,
    ) -> Result<()> {
        let (height, hash) = self.anchor()?;
        if height < current_tip.saturating_sub(2 * sync_delay_threshold) {
            return Err(Error::Unauthorized(format!(
                "envelope anchored at height {height} has expired (tip {current_tip})"
            )));
        }
        if hash != actual_hash {
            return Err(Error::Unauthorized(format!(
                "envelope anchored to unknown block at height {height}"
            )));
        }
        Ok(())
    }

    /// Deserialize the payload into a typed request/response.
    pub fn open<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| Error::MalformedRequest(format!("bad envelope payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::EvmClient;

    const TEST_KEY: &str =
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const OTHER_KEY: &str =
        "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    fn client(key: &str) -> EvmClient {
        EvmClient::new("http://127.0.0.1:8545", 56, &format!("0x{:040x}", 1u32), key).unwrap()
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    #[serde(rename_all = "camelCase")]
    struct Payload {
        mint_address: String,
        deposit_address: String,
    }

    fn payload() -> Payload {
        Payload {
            mint_address: "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".to_string(),
            deposit_address: "02aabbcc".to_string(),
        }
    }

    #[test]
    fn test_seal_open_round_trip() {
        let evm = client(TEST_KEY);
        let envelope = Envelope::seal(&payload(), &evm, 100, "hash100").unwrap();
        assert_eq!(envelope.anchor().unwrap(), (100, "hash100".to_string()));
        assert_eq!(envelope.open::<Payload>().unwrap(), payload());
        envelope.verify_signer(evm.wallet_address()).unwrap();
    }

    #[test]
    fn test_tampered_data_fails_signer_check() {
        let evm = client(TEST_KEY);
        let mut envelope = Envelope::seal(&payload(), &evm, 100, "hash100").unwrap();
        envelope.data["depositAddress"] = json!("03attacker");
        assert!(envelope.verify_signer(evm.wallet_address()).is_err());
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let evm = client(TEST_KEY);
        let other = client(OTHER_KEY);
        let envelope = Envelope::seal(&payload(), &evm, 100, "hash100").unwrap();
        assert!(envelope.verify_signer(other.wallet_address()).is_err());

        let allowed = [other.wallet_address()];
        assert!(envelope.verify_any_signer(&allowed).is_err());
        let allowed = [other.wallet_address(), evm.wallet_address()];
        assert_eq!(
            envelope.verify_any_signer(&allowed).unwrap(),
            evm.wallet_address()
        );
    }

    #[test]
    fn test_anchor_expiry_window() {
        let evm = client(TEST_KEY);
        let delay = 15;
        // Sealed at tip 100 - delay = 85.
        let envelope = Envelope::seal(&payload(), &evm, 85, "hash85").unwrap();

        // Fresh: tip has moved but within 2 * delay.
        envelope.verify_anchor(100, "hash85", delay).unwrap();
        envelope.verify_anchor(85 + 2 * delay, "hash85", delay).unwrap();

        // Expired: tip moved past height + 2 * delay.
        assert!(matches!(
            envelope.verify_anchor(85 + 2 * delay + 1, "hash85", delay),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_anchor_fork_mismatch() {
        let evm = client(TEST_KEY);
        let envelope = Envelope::seal(&payload(), &evm, 85, "hash85").unwrap();
        assert!(matches!(
            envelope.verify_anchor(100, "reorged85", 15),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_canonical_encoding_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_missing_anchor_is_malformed() {
        let envelope = Envelope {
            data: json!({"mintAddress": "0x00"}),
            signature: "00".to_string(),
        };
        assert!(matches!(
            envelope.anchor(),
            Err(Error::MalformedRequest(_))
        ));
    }
}

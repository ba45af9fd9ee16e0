//! Token-chain client.
//!
//! Holds the authority's secp256k1 key (loaded once at startup, never sent
//! over the wire), signs and verifies personal messages for envelopes, reads
//! mint/burn state from the wrapped-token contract, and produces the
//! contract-verifiable mint voucher signature.

use alloy::{
    primitives::{keccak256, Address, Signature, U256},
    providers::{ProviderBuilder, RootProvider},
    signers::{local::PrivateKeySigner, SignerSync},
    sol,
    sol_types::SolValue,
    transports::http::{Client, Http},
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::amount::Satoshi;
use crate::cache::BoundedCache;
use crate::error::{Error, Result};
use crate::metrics;

const BURN_CACHE_SIZE: usize = 100_000;

sol! {
    /// Read surface of the wrapped-Dingocoin token contract.
    #[sol(rpc)]
    contract WrappedDingocoin {
        /// Mint progress for a holder and their bound deposit address.
        function mintHistory(address account, string calldata depositAddress)
            external view returns (uint256 mintNonce, uint256 mintedAmount);

        /// One burn event from the holder's burn history.
        function burnHistory(address account, uint256 index)
            external view returns (string memory destination, uint256 amount);

        function burnHistoryLength(address account) external view returns (uint256);
    }
}

/// Mint progress as recorded on the contract.
#[derive(Debug, Clone, Copy)]
pub struct MintHistory {
    pub mint_nonce: u64,
    pub minted_amount: Satoshi,
}

/// An immutable on-chain burn event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnRecord {
    pub destination: String,
    pub amount: Satoshi,
}

/// `(v, r, s)` in the form the contract's mint verifier checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractSignature {
    pub v: u64,
    pub r: String,
    pub s: String,
}

pub struct EvmClient {
    signer: PrivateKeySigner,
    wallet_address: Address,
    provider: RootProvider<Http<Client>>,
    contract_address: Address,
    chain_id: u64,
    burn_cache: Mutex<BoundedCache<(Address, u64), BurnRecord>>,
}

impl EvmClient {
    pub fn new(
        provider_url: &str,
        chain_id: u64,
        contract_address: &str,
        private_key: &str,
    ) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|e| Error::Internal(format!("invalid wallet key: {e}")))?;
        let wallet_address = signer.address();
        let contract_address: Address = contract_address
            .parse()
            .map_err(|e| Error::Internal(format!("invalid contract address: {e}")))?;
        let provider = ProviderBuilder::new().on_http(
            provider_url
                .parse()
                .map_err(|e| Error::Internal(format!("invalid provider url: {e}")))?,
        );

        info!(
            address = %wallet_address,
            chain_id,
            contract = %contract_address,
            "EVM client initialized"
        );

        Ok(EvmClient {
            signer,
            wallet_address,
            provider,
            contract_address,
            chain_id,
            burn_cache: Mutex::new(BoundedCache::new(BURN_CACHE_SIZE)),
        })
    }

    /// The address peers verify this node's envelopes against.
    pub fn wallet_address(&self) -> Address {
        self.wallet_address
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Personal-message (EIP-191) signature, hex encoded.
    pub fn sign_message(&self, message: &[u8]) -> Result<String> {
        let signature = self
            .signer
            .sign_message_sync(message)
            .map_err(|e| Error::Internal(format!("signing failed: {e}")))?;
        Ok(hex::encode(signature.as_bytes()))
    }

    /// Mint voucher over `keccak256(abi.encode(chainId, mintAddress,
    /// mintNonce, depositAddress, mintAmount))`. Types and order must match
    /// the contract's mint verifier byte for byte.
    pub fn sign_mint_transaction(
        &self,
        mint_address: Address,
        mint_nonce: u64,
        deposit_address: &str,
        mint_amount: Satoshi,
    ) -> Result<ContractSignature> {
        let encoded = (
            U256::from(self.chain_id),
            mint_address,
            U256::from(mint_nonce),
            deposit_address.to_string(),
            U256::from(mint_amount.sat()),
        )
            .abi_encode();
        let digest = keccak256(&encoded);
        let signature = self
            .signer
            .sign_message_sync(digest.as_slice())
            .map_err(|e| Error::Internal(format!("signing failed: {e}")))?;
        // 65 bytes r || s || v, with v already in the 27/28 form the
        // contract checks.
        let bytes = signature.as_bytes();
        Ok(ContractSignature {
            v: bytes[64] as u64,
            r: format!("0x{}", hex::encode(&bytes[..32])),
            s: format!("0x{}", hex::encode(&bytes[32..64])),
        })
    }

    pub async fn mint_history(
        &self,
        mint_address: Address,
        deposit_address: &str,
    ) -> Result<MintHistory> {
        let contract = WrappedDingocoin::new(self.contract_address, self.provider.clone());
        let ret = contract
            .mintHistory(mint_address, deposit_address.to_string())
            .call()
            .await
            .map_err(|e| chain_view(format!("mintHistory: {e}")))?;
        Ok(MintHistory {
            mint_nonce: u256_to_u64(ret.mintNonce)?,
            minted_amount: u256_to_sat(ret.mintedAmount)?,
        })
    }

    pub async fn burn_history_length(&self, burn_address: Address) -> Result<u64> {
        let contract = WrappedDingocoin::new(self.contract_address, self.provider.clone());
        let ret = contract
            .burnHistoryLength(burn_address)
            .call()
            .await
            .map_err(|e| chain_view(format!("burnHistoryLength: {e}")))?;
        u256_to_u64(ret._0)
    }

    /// One burn record, served from the bounded cache when possible.
    pub async fn burn_record(&self, burn_address: Address, index: u64) -> Result<BurnRecord> {
        {
            let cache = self.burn_cache.lock().await;
            if let Some(record) = cache.get(&(burn_address, index)) {
                return Ok(record.clone());
            }
        }
        let contract = WrappedDingocoin::new(self.contract_address, self.provider.clone());
        let ret = contract
            .burnHistory(burn_address, U256::from(index))
            .call()
            .await
            .map_err(|e| chain_view(format!("burnHistory: {e}")))?;
        let record = BurnRecord {
            destination: ret.destination,
            amount: u256_to_sat(ret.amount)?,
        };
        self.burn_cache
            .lock()
            .await
            .insert((burn_address, index), record.clone());
        Ok(record)
    }

    /// The full burn history of an address, oldest first.
    pub async fn burn_records(&self, burn_address: Address) -> Result<Vec<BurnRecord>> {
        let len = self.burn_history_length(burn_address).await?;
        let mut records = Vec::with_capacity(len as usize);
        for index in 0..len {
            records.push(self.burn_record(burn_address, index).await?);
        }
        Ok(records)
    }
}

/// Provider RPC failure: counted and surfaced as a chain-view error.
fn chain_view(message: String) -> Error {
    metrics::record_rpc_error("evm");
    Error::ChainView(message)
}

/// Recover the signer of a personal-message signature.
pub fn recover_personal(message: &[u8], signature_hex: &str) -> Result<Address> {
    let bytes = hex::decode(signature_hex.trim_start_matches("0x"))
        .map_err(|_| Error::Unauthorized("malformed signature".into()))?;
    let signature = Signature::try_from(bytes.as_slice())
        .map_err(|_| Error::Unauthorized("malformed signature".into()))?;
    signature
        .recover_address_from_msg(message)
        .map_err(|_| Error::Unauthorized("signature recovery failed".into()))
}

/// Verify a personal-message signature against an expected address.
pub fn verify_personal(message: &[u8], signature_hex: &str, expected: Address) -> bool {
    matches!(recover_personal(message, signature_hex), Ok(addr) if addr == expected)
}

/// Parse a 0x-prefixed EVM address from a request.
pub fn parse_address(s: &str) -> Result<Address> {
    s.parse()
        .map_err(|_| Error::MalformedRequest(format!("invalid address {s:?}")))
}

fn u256_to_u64(v: U256) -> Result<u64> {
    u64::try_from(v).map_err(|_| Error::ChainView(format!("value {v} out of range")))
}

fn u256_to_sat(v: U256) -> Result<Satoshi> {
    Ok(Satoshi::from_sat(u256_to_u64(v)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known anvil development key; never used outside tests.
    pub const TEST_KEY: &str =
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn client() -> EvmClient {
        EvmClient::new("http://127.0.0.1:8545", 56, &format!("0x{:040x}", 1u32), TEST_KEY)
            .unwrap()
    }

    #[test]
    fn test_sign_and_recover_personal() {
        let client = client();
        let message = b"hello authorities";
        let sig = client.sign_message(message).unwrap();
        let recovered = recover_personal(message, &sig).unwrap();
        assert_eq!(recovered, client.wallet_address());
        assert!(verify_personal(message, &sig, client.wallet_address()));
        assert!(!verify_personal(b"tampered", &sig, client.wallet_address()));
    }

    #[test]
    fn test_recover_rejects_garbage() {
        assert!(recover_personal(b"m", "zz").is_err());
        assert!(recover_personal(b"m", "00").is_err());
    }

    #[test]
    fn test_mint_signature_is_deterministic_and_well_formed() {
        let client = client();
        let mint_address = parse_address("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap();
        let a = client
            .sign_mint_transaction(mint_address, 3, "DDepositAddr", Satoshi::from_sat(3_960_000_000))
            .unwrap();
        let b = client
            .sign_mint_transaction(mint_address, 3, "DDepositAddr", Satoshi::from_sat(3_960_000_000))
            .unwrap();
        assert_eq!(a, b);
        assert!(a.v == 27 || a.v == 28);
        assert_eq!(a.r.len(), 66);
        assert_eq!(a.s.len(), 66);

        // Any input change must change the signature.
        let c = client
            .sign_mint_transaction(mint_address, 4, "DDepositAddr", Satoshi::from_sat(3_960_000_000))
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_parse_address_rejects_invalid() {
        assert!(parse_address("0x1234").is_err());
        assert!(parse_address("not-an-address").is_err());
        assert!(parse_address("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").is_ok());
    }
}

//! Mint-address registration.
//!
//! Three-way protocol driven by the client: phase 1 collects one fresh
//! wallet pubkey from every authority, phase 2 forwards the ordered envelope
//! list back to every authority, which derives the same k-of-N multisig
//! deposit address from the same pubkeys in the same fixed order.

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::db;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::evm;
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateDepositAddressRequest {
    pub mint_address: String,
}

/// Phase-1 reply. `deposit_address` carries the authority's fresh wallet
/// pubkey, not a final address; phase 2 combines the N pubkeys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateDepositAddressResponse {
    pub mint_address: String,
    pub deposit_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMintDepositAddressRequest {
    pub generate_deposit_address_responses: Vec<Envelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMintDepositAddressResponse {
    pub deposit_address: String,
}

/// Phase 1: hand out one fresh wallet pubkey for a mint address.
pub async fn generate_deposit_address(
    state: &AppState,
    request: GenerateDepositAddressRequest,
) -> Result<GenerateDepositAddressResponse> {
    evm::parse_address(&request.mint_address)?;

    let address = state.dingo.get_new_address().await?;
    let info = state.dingo.validate_address(&address).await?;
    let pubkey = info.pubkey.ok_or_else(|| {
        Error::ChainView(format!("daemon returned no pubkey for fresh address {address}"))
    })?;

    Ok(GenerateDepositAddressResponse {
        mint_address: request.mint_address,
        deposit_address: pubkey,
    })
}

/// Positional checks over the phase-1 envelopes: envelope `i` must be signed
/// by `authorityNodes[i]`, and every payload must agree on the mint address.
///
/// Returns the common mint address and the pubkeys in authority order.
pub fn validate_phase_one_responses(
    settings: &Settings,
    responses: &[Envelope],
) -> Result<(String, Vec<String>)> {
    let nodes = &settings.public_settings.authority_nodes;
    if responses.len() != nodes.len() {
        return Err(Error::MalformedRequest(format!(
            "expected {} signed responses, got {}",
            nodes.len(),
            responses.len()
        )));
    }

    let mut mint_address: Option<String> = None;
    let mut pubkeys = Vec::with_capacity(nodes.len());
    for (node, envelope) in nodes.iter().zip(responses) {
        envelope.verify_signer(evm::parse_address(&node.wallet_address)?)?;
        let payload: GenerateDepositAddressResponse = envelope.open()?;
        match &mint_address {
            None => mint_address = Some(payload.mint_address),
            Some(expected) if *expected != payload.mint_address => {
                return Err(Error::Consensus(
                    "responses disagree on the mint address".into(),
                ));
            }
            Some(_) => {}
        }
        pubkeys.push(payload.deposit_address);
    }

    let mint_address =
        mint_address.ok_or_else(|| Error::MalformedRequest("no responses".into()))?;
    evm::parse_address(&mint_address)?;
    Ok((mint_address, pubkeys))
}

/// Phase 2: verify all N envelopes, burn the pubkeys, derive and watch the
/// multisig address, and bind it to the mint address.
pub async fn register_mint_deposit_address(
    state: &AppState,
    request: RegisterMintDepositAddressRequest,
) -> Result<RegisterMintDepositAddressResponse> {
    for envelope in &request.generate_deposit_address_responses {
        state.verify_anchor(envelope).await?;
    }
    let (mint_address, pubkeys) =
        validate_phase_one_responses(&state.settings, &request.generate_deposit_address_responses)?;

    let _write = state.write_lock.lock().await;

    if db::has_used_deposit_pubkeys(&state.pool, &pubkeys).await? {
        return Err(Error::Duplicate("a deposit pubkey has already been used".into()));
    }
    db::register_used_deposit_pubkeys(&state.pool, &pubkeys).await?;

    // Identical inputs in identical order: every authority derives the same
    // address and redeem script here.
    let multisig = state
        .dingo
        .create_multisig(state.settings.public_settings.authority_threshold, &pubkeys)
        .await?;
    state.dingo.import_address(&multisig.redeem_script).await?;

    db::register_mint_binding(
        &state.pool,
        &mint_address,
        &multisig.address,
        &multisig.redeem_script,
    )
    .await?;

    metrics::DEPOSIT_ADDRESSES_REGISTERED.inc();
    tracing::info!(
        mint_address = %mint_address,
        deposit_address = %multisig.address,
        "registered mint deposit address"
    );

    Ok(RegisterMintDepositAddressResponse {
        deposit_address: multisig.address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use crate::evm::EvmClient;

    // Anvil development keys 0-2; the derived addresses are patched into the
    // settings so positional checks can be exercised offline.
    const KEYS: [&str; 3] = [
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
        "0x5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a",
    ];
    const MINT: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    fn committee() -> (Settings, Vec<EvmClient>) {
        let mut settings = test_settings(3);
        let clients: Vec<EvmClient> = KEYS
            .iter()
            .map(|key| {
                EvmClient::new("http://127.0.0.1:8545", 56, &format!("0x{:040x}", 9u32), key)
            })
            .collect::<Result<_>>()
            .unwrap();
        for (node, client) in settings
            .public_settings
            .authority_nodes
            .iter_mut()
            .zip(&clients)
        {
            node.wallet_address = format!("{:#x}", client.wallet_address());
        }
        (settings, clients)
    }

    fn responses(clients: &[EvmClient], mint: &str) -> Vec<Envelope> {
        clients
            .iter()
            .enumerate()
            .map(|(i, client)| {
                let payload = GenerateDepositAddressResponse {
                    mint_address: mint.to_string(),
                    deposit_address: format!("02pubkey{i}"),
                };
                Envelope::seal(&payload, client, 100, "hash100").unwrap()
            })
            .collect()
    }

    #[test]
    fn test_valid_responses_yield_ordered_pubkeys() {
        let (settings, clients) = committee();
        let envelopes = responses(&clients, MINT);
        let (mint, pubkeys) = validate_phase_one_responses(&settings, &envelopes).unwrap();
        assert_eq!(mint, MINT);
        assert_eq!(pubkeys, vec!["02pubkey0", "02pubkey1", "02pubkey2"]);
    }

    #[test]
    fn test_out_of_order_responses_fail_positional_check() {
        let (settings, clients) = committee();
        let mut envelopes = responses(&clients, MINT);
        envelopes.swap(0, 1);
        assert!(matches!(
            validate_phase_one_responses(&settings, &envelopes),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_wrong_count_rejected() {
        let (settings, clients) = committee();
        let mut envelopes = responses(&clients, MINT);
        envelopes.pop();
        assert!(matches!(
            validate_phase_one_responses(&settings, &envelopes),
            Err(Error::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_mint_address_disagreement_is_consensus_failure() {
        let (settings, clients) = committee();
        let mut envelopes = responses(&clients, MINT);
        let other = GenerateDepositAddressResponse {
            mint_address: "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".to_string(),
            deposit_address: "02pubkey1".to_string(),
        };
        envelopes[1] = Envelope::seal(&other, &clients[1], 100, "hash100").unwrap();
        assert!(matches!(
            validate_phase_one_responses(&settings, &envelopes),
            Err(Error::Consensus(_))
        ));
    }

    #[test]
    fn test_invalid_mint_address_rejected() {
        let (settings, clients) = committee();
        let envelopes = responses(&clients, "not-an-address");
        assert!(validate_phase_one_responses(&settings, &envelopes).is_err());
    }
}

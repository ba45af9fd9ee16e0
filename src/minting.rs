//! Mint authorization.
//!
//! Reads the confirmed/unconfirmed deposit balances for a bound deposit
//! address and issues the contract-verifiable mint voucher. The contract is
//! the only party that advances `mintNonce`; the node just signs against its
//! current value, so an unexecuted voucher can be reissued safely.

use serde::{Deserialize, Serialize};

use crate::amount::{Satoshi, TaxPolicy};
use crate::db::{self, MintBinding};
use crate::error::{Error, Result};
use crate::evm::{self, ContractSignature, MintHistory};
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMintBalanceRequest {
    pub mint_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMintBalanceResponse {
    pub mint_nonce: u64,
    pub mint_address: String,
    pub deposit_address: String,
    pub deposited_amount: Satoshi,
    pub unconfirmed_amount: Satoshi,
    pub minted_amount: Satoshi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMintTransactionRequest {
    pub mint_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMintTransactionResponse {
    pub mint_address: String,
    pub mint_nonce: u64,
    pub deposit_address: String,
    pub mint_amount: Satoshi,
    pub on_contract_verification: ContractSignature,
}

/// Amount a deposit balance entitles the user to mint: everything after tax,
/// or nothing while the balance is below the flat fee.
pub fn mintable(policy: &TaxPolicy, received: Satoshi) -> Satoshi {
    if policy.meets_tax(received) {
        // meets_tax held, so amount_after_tax cannot fail.
        policy.amount_after_tax(received).unwrap_or(Satoshi::ZERO)
    } else {
        Satoshi::ZERO
    }
}

struct MintView {
    binding: MintBinding,
    mintable_confirmed: Satoshi,
    mintable_unconfirmed: Satoshi,
    history: MintHistory,
}

async fn load_mint_view(state: &AppState, mint_address: &str) -> Result<MintView> {
    let mint = evm::parse_address(mint_address)?;
    let binding = db::get_mint_binding(&state.pool, mint_address)
        .await?
        .ok_or_else(|| {
            Error::MalformedRequest(format!("no deposit address registered for {mint_address}"))
        })?;

    let policy = &state.settings.dingo_settings.tax;
    let confirmations = state.settings.dingo_settings.deposit_confirmations;
    let confirmed = state
        .dingo
        .list_received_by_address(confirmations)
        .await?
        .remove(&binding.deposit_address)
        .unwrap_or(Satoshi::ZERO);
    let total = state
        .dingo
        .list_received_by_address(0)
        .await?
        .remove(&binding.deposit_address)
        .unwrap_or(Satoshi::ZERO);
    let unconfirmed = total.saturating_sub(confirmed);

    let history = state.evm.mint_history(mint, &binding.deposit_address).await?;

    Ok(MintView {
        mintable_confirmed: mintable(policy, confirmed),
        mintable_unconfirmed: mintable(policy, unconfirmed),
        binding,
        history,
    })
}

pub async fn query_mint_balance(
    state: &AppState,
    request: QueryMintBalanceRequest,
) -> Result<QueryMintBalanceResponse> {
    let view = load_mint_view(state, &request.mint_address).await?;
    Ok(QueryMintBalanceResponse {
        mint_nonce: view.history.mint_nonce,
        mint_address: request.mint_address,
        deposit_address: view.binding.deposit_address,
        deposited_amount: view.mintable_confirmed,
        unconfirmed_amount: view.mintable_unconfirmed,
        minted_amount: view.history.minted_amount,
    })
}

pub async fn create_mint_transaction(
    state: &AppState,
    request: CreateMintTransactionRequest,
) -> Result<CreateMintTransactionResponse> {
    let view = load_mint_view(state, &request.mint_address).await?;
    let mint = evm::parse_address(&request.mint_address)?;

    let mint_amount = view
        .mintable_confirmed
        .saturating_sub(view.history.minted_amount);
    let on_contract_verification = state.evm.sign_mint_transaction(
        mint,
        view.history.mint_nonce,
        &view.binding.deposit_address,
        mint_amount,
    )?;

    metrics::MINT_VOUCHERS_ISSUED.inc();
    Ok(CreateMintTransactionResponse {
        mint_address: request.mint_address,
        mint_nonce: view.history.mint_nonce,
        deposit_address: view.binding.deposit_address,
        mint_amount,
        on_contract_verification,
    })
}

//! Withdrawal intake.
//!
//! Users point the node at a burn event on the Token chain; the node
//! validates it against the contract and records it SUBMITTED. The payout
//! engine later moves it to APPROVED inside a co-signed settlement batch.

use serde::{Deserialize, Serialize};

use crate::amount::Satoshi;
use crate::db;
use crate::error::{Error, Result};
use crate::evm;
use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitWithdrawalRequest {
    pub burn_address: String,
    pub burn_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitWithdrawalResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBurnHistoryRequest {
    pub burn_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalStatus {
    Submitted,
    Approved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnHistoryEntry {
    pub burn_destination: String,
    pub burn_amount: Satoshi,
    pub status: Option<WithdrawalStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBurnHistoryResponse {
    pub burn_history: Vec<BurnHistoryEntry>,
}

pub async fn submit_withdrawal(
    state: &AppState,
    request: SubmitWithdrawalRequest,
) -> Result<SubmitWithdrawalResponse> {
    let burn_address = evm::parse_address(&request.burn_address)?;
    let burn_index = i64::try_from(request.burn_index)
        .map_err(|_| Error::MalformedRequest("burn index out of range".into()))?;

    let _write = state.write_lock.lock().await;

    if db::get_withdrawal(&state.pool, &request.burn_address, burn_index)
        .await?
        .is_some()
    {
        return Err(Error::Duplicate(format!(
            "withdrawal ({}, {}) already submitted",
            request.burn_address, request.burn_index
        )));
    }

    let burn = state.evm.burn_record(burn_address, request.burn_index).await?;
    if !state.dingo.is_valid_address(&burn.destination).await? {
        return Err(Error::MalformedRequest(format!(
            "burn destination {:?} is not a valid Coin address",
            burn.destination
        )));
    }
    if !state.settings.dingo_settings.tax.meets_tax(burn.amount) {
        return Err(Error::AmountTooSmall {
            amount: burn.amount,
            minimum: state.settings.dingo_settings.tax.flat_fee,
        });
    }

    db::register_withdrawal(&state.pool, &request.burn_address, burn_index).await?;
    metrics::WITHDRAWALS_SUBMITTED.inc();
    tracing::info!(
        burn_address = %request.burn_address,
        burn_index = request.burn_index,
        amount = %burn.amount,
        "withdrawal submitted"
    );
    Ok(SubmitWithdrawalResponse {})
}

/// Full on-chain burn history, annotated with this node's local status.
pub async fn query_burn_history(
    state: &AppState,
    request: QueryBurnHistoryRequest,
) -> Result<QueryBurnHistoryResponse> {
    let burn_address = evm::parse_address(&request.burn_address)?;
    let records = state.evm.burn_records(burn_address).await?;

    let mut burn_history = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let status = db::get_withdrawal(&state.pool, &request.burn_address, index as i64)
            .await?
            .map(|w| {
                if w.is_submitted() {
                    WithdrawalStatus::Submitted
                } else {
                    WithdrawalStatus::Approved
                }
            });
        burn_history.push(BurnHistoryEntry {
            burn_destination: record.destination,
            burn_amount: record.amount,
            status,
        });
    }
    Ok(QueryBurnHistoryResponse { burn_history })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&WithdrawalStatus::Submitted).unwrap(),
            "\"SUBMITTED\""
        );
        assert_eq!(
            serde_json::to_string(&WithdrawalStatus::Approved).unwrap(),
            "\"APPROVED\""
        );
        let entry = BurnHistoryEntry {
            burn_destination: "DDest".to_string(),
            burn_amount: Satoshi::from_sat(8_000_000_000),
            status: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json["status"].is_null());
        assert_eq!(json["burnAmount"], "8000000000");
    }
}

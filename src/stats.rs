//! Signed stats snapshot for operator cross-checks.
//!
//! Every authority exposes the same aggregate view of its local state; the
//! operator tooling tabulates all nodes and flags any column where values
//! disagree. The snapshot is recomputed at most every 10 minutes behind a
//! dedicated lock to cap daemon RPC load.

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::amount::Satoshi;
use crate::db;
use crate::error::Result;
use crate::evm;
use crate::metrics;
use crate::state::AppState;

const STATS_TTL: Duration = Duration::from_secs(600);

pub async fn stats_snapshot(state: &AppState) -> Result<Value> {
    let mut cache = state.stats_cache.lock().await;
    if let Some((computed_at, snapshot)) = cache.as_ref() {
        if computed_at.elapsed() < STATS_TTL {
            return Ok(snapshot.clone());
        }
    }
    let snapshot = compute_snapshot(state).await?;
    *cache = Some((Instant::now(), snapshot.clone()));
    Ok(snapshot)
}

async fn compute_snapshot(state: &AppState) -> Result<Value> {
    let settings = &state.settings;
    let dingo_settings = &settings.dingo_settings;
    let policy = &dingo_settings.tax;

    let bindings = db::get_mint_bindings(&state.pool, None).await?;
    let received_confirmed = state
        .dingo
        .list_received_by_address(dingo_settings.deposit_confirmations)
        .await?;
    let received_all = state.dingo.list_received_by_address(0).await?;

    let mut deposits = serde_json::Map::new();
    let mut total_confirmed = Satoshi::ZERO;
    let mut total_unconfirmed = Satoshi::ZERO;
    let mut total_approved_tax = Satoshi::ZERO;
    for binding in &bindings {
        let confirmed = received_confirmed
            .get(&binding.deposit_address)
            .copied()
            .unwrap_or(Satoshi::ZERO);
        let unconfirmed = received_all
            .get(&binding.deposit_address)
            .copied()
            .unwrap_or(Satoshi::ZERO)
            .saturating_sub(confirmed);
        total_confirmed = total_confirmed.checked_add(confirmed)?;
        total_unconfirmed = total_unconfirmed.checked_add(unconfirmed)?;
        total_approved_tax = total_approved_tax.checked_add(binding.approved_tax)?;
        deposits.insert(
            binding.deposit_address.clone(),
            json!({
                "mintAddress": binding.mint_address,
                "confirmedAmount": confirmed,
                "unconfirmedAmount": unconfirmed,
                "approvedTax": binding.approved_tax,
            }),
        );
    }

    let withdrawals = db::get_withdrawals(&state.pool).await?;
    let mut unapproved = 0u64;
    let mut approvable_amount = Satoshi::ZERO;
    let mut approvable_tax = Satoshi::ZERO;
    let mut approved_amount = Satoshi::ZERO;
    let mut approved_tax = Satoshi::ZERO;
    for withdrawal in &withdrawals {
        if withdrawal.is_submitted() {
            unapproved += 1;
            let address = evm::parse_address(&withdrawal.burn_address)?;
            let burn = state
                .evm
                .burn_record(address, withdrawal.burn_index as u64)
                .await?;
            if policy.meets_tax(burn.amount) {
                approvable_amount =
                    approvable_amount.checked_add(policy.amount_after_tax(burn.amount)?)?;
                approvable_tax = approvable_tax.checked_add(policy.tax(burn.amount)?)?;
            }
        } else {
            approved_amount = approved_amount.checked_add(withdrawal.approved_amount)?;
            approved_tax = approved_tax.checked_add(withdrawal.approved_tax)?;
        }
    }
    metrics::UNAPPROVED_WITHDRAWALS.set(unapproved as i64);

    let change = std::slice::from_ref(&dingo_settings.change_address);
    let change_confirmed = utxo_total(state, dingo_settings.change_confirmations, change).await?;
    let change_all = utxo_total(state, 0, change).await?;
    let deposit_addresses: Vec<String> =
        bindings.iter().map(|b| b.deposit_address.clone()).collect();
    let (deposit_confirmed, deposit_all) = if deposit_addresses.is_empty() {
        (Satoshi::ZERO, Satoshi::ZERO)
    } else {
        (
            utxo_total(state, dingo_settings.deposit_confirmations, &deposit_addresses).await?,
            utxo_total(state, 0, &deposit_addresses).await?,
        )
    };

    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "publicSettings": settings.public_settings,
        "dingoSettings": settings.dingo_settings,
        "smartContractSettings": settings.smart_contract_settings,
        "deposits": {
            "byAddress": deposits,
            "totalConfirmedAmount": total_confirmed,
            "totalUnconfirmedAmount": total_unconfirmed,
            "totalApprovedTax": total_approved_tax,
        },
        "withdrawals": {
            "total": withdrawals.len() as u64,
            "unapproved": unapproved,
            "approvableAmount": approvable_amount,
            "approvableTax": approvable_tax,
            "approvedAmount": approved_amount,
            "approvedTax": approved_tax,
        },
        "utxos": {
            "changeConfirmedBalance": change_confirmed,
            "changeUnconfirmedBalance": change_all.saturating_sub(change_confirmed),
            "depositConfirmedBalance": deposit_confirmed,
            "depositUnconfirmedBalance": deposit_all.saturating_sub(deposit_confirmed),
        },
    }))
}

async fn utxo_total(
    state: &AppState,
    confirmations: u64,
    addresses: &[String],
) -> Result<Satoshi> {
    let unspent = state.dingo.list_unspent(confirmations, addresses).await?;
    Satoshi::sum(unspent.into_iter().map(|u| u.amount))
}

//! Settlement accounting over a real (in-memory) store.
//!
//! These tests drive the store and the payout engine's pure stages together,
//! the way a co-signing authority does: register state, validate a batch
//! against a chain view, apply the mutations, and check that replays and
//! underfunded batches leave state untouched.

use sqlx::SqlitePool;

use wdingo_authority::amount::{Satoshi, TaxPolicy, COIN};
use wdingo_authority::db;
use wdingo_authority::error::Error;
use wdingo_authority::evm::BurnRecord;
use wdingo_authority::payout::{
    build_vouts, validate_payouts, ChainStateView, DepositTaxPayout, PendingPayouts,
    WithdrawalPayout, WithdrawalTaxPayout,
};

async fn store() -> SqlitePool {
    let pool = db::create_pool(":memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

/// Chain view as one authority would see it, loaded from the store plus the
/// given chain facts.
async fn view(
    pool: &SqlitePool,
    received: &[(&str, u64)],
    burns: &[(&str, u64, &str, u64)],
) -> ChainStateView {
    let mut v = ChainStateView::default();
    for (address, sat) in received {
        v.received
            .insert(address.to_string(), Satoshi::from_sat(*sat));
    }
    for binding in db::get_mint_bindings(pool, None).await.unwrap() {
        v.bindings.insert(binding.deposit_address.clone(), binding);
    }
    for withdrawal in db::get_withdrawals(pool).await.unwrap() {
        v.withdrawals
            .insert((withdrawal.burn_address.clone(), withdrawal.burn_index), withdrawal);
    }
    for (address, index, destination, sat) in burns {
        v.burns.insert(
            (address.to_string(), *index),
            BurnRecord {
                destination: destination.to_string(),
                amount: Satoshi::from_sat(*sat),
            },
        );
    }
    v
}

/// The batch a coordinator would build for one deposit and one withdrawal.
fn batch_for(
    policy: &TaxPolicy,
    deposit: Option<(&str, u64, u64)>,
    burn: Option<(&str, u64, &str, u64)>,
) -> PendingPayouts {
    let mut pending = PendingPayouts::default();
    if let Some((address, balance_sat, approved_sat)) = deposit {
        let approvable = policy.tax(Satoshi::from_sat(balance_sat)).unwrap();
        pending.deposit_tax_payouts.push(DepositTaxPayout {
            deposit_address: address.to_string(),
            amount: approvable
                .checked_sub(Satoshi::from_sat(approved_sat))
                .unwrap(),
        });
    }
    if let Some((address, index, destination, burn_sat)) = burn {
        let amount = Satoshi::from_sat(burn_sat);
        pending.withdrawal_payouts.push(WithdrawalPayout {
            burn_address: address.to_string(),
            burn_index: index,
            burn_destination: destination.to_string(),
            amount: policy.amount_after_tax(amount).unwrap(),
        });
        pending.withdrawal_tax_payouts.push(WithdrawalTaxPayout {
            burn_address: address.to_string(),
            burn_index: index,
            burn_destination: destination.to_string(),
            amount: policy.tax(amount).unwrap(),
        });
    }
    pending
}

#[tokio::test]
async fn pubkey_reuse_across_registrations_is_rejected() {
    let pool = store().await;
    let first = vec!["02p0".to_string(), "02p1".to_string(), "02p2".to_string()];
    db::register_used_deposit_pubkeys(&pool, &first).await.unwrap();
    db::register_mint_binding(&pool, "0xmint1", "DdepA", "52aa").await.unwrap();

    // A second registration replaying 02p1 must fail and record nothing.
    let second = vec!["02p3".to_string(), "02p1".to_string(), "02p4".to_string()];
    assert!(db::has_used_deposit_pubkeys(&pool, &second).await.unwrap());
    let err = db::register_used_deposit_pubkeys(&pool, &second).await.unwrap_err();
    assert!(matches!(err, Error::Duplicate(_)));
    assert!(
        !db::has_used_deposit_pubkeys(&pool, &["02p3".to_string()]).await.unwrap()
    );
}

#[tokio::test]
async fn duplicate_withdrawal_submission_leaves_one_row() {
    let pool = store().await;
    db::register_withdrawal(&pool, "0xburner", 7).await.unwrap();
    let err = db::register_withdrawal(&pool, "0xburner", 7).await.unwrap_err();
    assert!(matches!(err, Error::Duplicate(_)));
    assert_eq!(db::get_withdrawals(&pool).await.unwrap().len(), 1);
}

#[tokio::test]
async fn underfunded_batch_is_rejected_without_state_change() {
    let pool = store().await;
    let policy = TaxPolicy::default();
    db::register_mint_binding(&pool, "0xmint1", "DdepX", "52aa").await.unwrap();
    db::register_withdrawal(&pool, "0xburnerB", 3).await.unwrap();

    // One deposit of 50 Coin and one burn of 80 Coin: totalTax 21.1 Coin is
    // below the (1 + 1) * 20 Coin network fee.
    let v = view(
        &pool,
        &[("DdepX", 50 * COIN)],
        &[("0xburnerB", 3, "DdestB", 80 * COIN)],
    )
    .await;
    let pending = batch_for(
        &policy,
        Some(("DdepX", 50 * COIN, 0)),
        Some(("0xburnerB", 3, "DdestB", 80 * COIN)),
    );

    let err = validate_payouts(&v, &policy, &pending).unwrap_err();
    match err {
        Error::InsufficientTaxForFee {
            total_tax,
            network_fee,
        } => {
            assert_eq!(total_tax, Satoshi::from_sat(2_110_000_000));
            assert_eq!(network_fee, Satoshi::from_sat(4_000_000_000));
        }
        other => panic!("expected InsufficientTaxForFee, got {other:?}"),
    }

    // Nothing was applied.
    let binding = db::get_mint_binding(&pool, "0xmint1").await.unwrap().unwrap();
    assert_eq!(binding.approved_tax, Satoshi::ZERO);
    let withdrawal = db::get_withdrawal(&pool, "0xburnerB", 3).await.unwrap().unwrap();
    assert!(withdrawal.is_submitted());
}

#[tokio::test]
async fn cosigned_batch_applies_once_and_replay_fails() {
    let pool = store().await;
    let policy = TaxPolicy::default();
    db::register_mint_binding(&pool, "0xmint1", "DdepX", "52aa").await.unwrap();
    db::register_withdrawal(&pool, "0xburnerB", 3).await.unwrap();

    let deposit_balance = 5_000 * COIN;
    let burn_amount = 2_100 * COIN;
    let chain_received = [("DdepX", deposit_balance)];
    let chain_burns = [("0xburnerB", 3u64, "DdestB", burn_amount)];

    let v = view(&pool, &chain_received, &chain_burns).await;
    let pending = batch_for(
        &policy,
        Some(("DdepX", deposit_balance, 0)),
        Some(("0xburnerB", 3, "DdestB", burn_amount)),
    );

    let (total_tax, network_fee) = validate_payouts(&v, &policy, &pending).unwrap();
    assert_eq!(total_tax, Satoshi::from_sat(5_990_000_000 + 3_090_000_000));
    assert_eq!(network_fee, Satoshi::from_sat(4_000_000_000));

    // The vouts a coordinator would encode, and the conservation law every
    // authority checks implicitly by recomputing them.
    let total_unspent = Satoshi::from_sat(10_000 * COIN);
    let vouts = build_vouts(
        &pending,
        total_tax,
        network_fee,
        total_unspent,
        &policy,
        &["Dtax".to_string()],
        "Dchange",
    )
    .unwrap();
    assert_eq!(vouts["DdestB"], Satoshi::from_sat(206_910_000_000));
    assert_eq!(vouts["Dtax"], Satoshi::from_sat(5_080_000_000));
    let out_total: u64 = vouts.values().map(|v| v.sat()).sum();
    assert_eq!(out_total + network_fee.sat(), total_unspent.sat());

    // Apply the batch the way the co-sign step does.
    let mut binding = db::get_mint_binding(&pool, "0xmint1").await.unwrap().unwrap();
    binding.approved_tax = binding
        .approved_tax
        .checked_add(pending.deposit_tax_payouts[0].amount)
        .unwrap();
    let approved = db::Withdrawal {
        burn_address: "0xburnerB".to_string(),
        burn_index: 3,
        approved_amount: pending.withdrawal_payouts[0].amount,
        approved_tax: pending.withdrawal_tax_payouts[0].amount,
    };
    db::apply_payout_mutations(&pool, &[binding], &[approved]).await.unwrap();

    // Invariants after apply: approved tax equals the approvable ceiling and
    // the withdrawal carries the exact two-state split.
    let binding = db::get_mint_binding(&pool, "0xmint1").await.unwrap().unwrap();
    assert_eq!(
        binding.approved_tax,
        policy.tax(Satoshi::from_sat(deposit_balance)).unwrap()
    );
    let withdrawal = db::get_withdrawal(&pool, "0xburnerB", 3).await.unwrap().unwrap();
    assert_eq!(
        withdrawal.approved_amount,
        policy.amount_after_tax(Satoshi::from_sat(burn_amount)).unwrap()
    );
    assert_eq!(
        withdrawal.approved_tax,
        policy.tax(Satoshi::from_sat(burn_amount)).unwrap()
    );

    // Replaying the same batch against the new state is a consensus failure:
    // the withdrawal is no longer SUBMITTED and the deposit tax would
    // overshoot its ceiling.
    let v = view(&pool, &chain_received, &chain_burns).await;
    let err = validate_payouts(&v, &policy, &pending).unwrap_err();
    assert!(matches!(err, Error::Consensus(_)));

    // There is also nothing left to pay: the unapproved set is empty and the
    // approvable deposit tax is fully consumed.
    assert!(db::get_unapproved_withdrawals(&pool).await.unwrap().is_empty());
}

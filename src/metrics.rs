//! Prometheus metrics for the authority node.
//!
//! Served from the plain-HTTP health listener, never from the signed API.

#![allow(dead_code)]

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_int_counter, register_int_gauge, CounterVec,
    Gauge, IntCounter, IntGauge,
};

lazy_static! {
    pub static ref UP: Gauge = register_gauge!(
        "authority_up",
        "Whether the authority node is up and running"
    )
    .unwrap();

    pub static ref DEPOSIT_ADDRESSES_REGISTERED: IntCounter = register_int_counter!(
        "authority_deposit_addresses_registered_total",
        "Total multisig deposit addresses registered"
    )
    .unwrap();

    pub static ref WITHDRAWALS_SUBMITTED: IntCounter = register_int_counter!(
        "authority_withdrawals_submitted_total",
        "Total withdrawal submissions accepted"
    )
    .unwrap();

    pub static ref MINT_VOUCHERS_ISSUED: IntCounter = register_int_counter!(
        "authority_mint_vouchers_issued_total",
        "Total mint transaction signatures issued"
    )
    .unwrap();

    pub static ref PAYOUTS_COSIGNED: IntCounter = register_int_counter!(
        "authority_payouts_cosigned_total",
        "Total payout batches this node co-signed"
    )
    .unwrap();

    pub static ref PAYOUTS_BROADCAST: IntCounter = register_int_counter!(
        "authority_payouts_broadcast_total",
        "Total settlement transactions broadcast as coordinator"
    )
    .unwrap();

    pub static ref UNAPPROVED_WITHDRAWALS: IntGauge = register_int_gauge!(
        "authority_unapproved_withdrawals",
        "Withdrawals currently awaiting a payout batch"
    )
    .unwrap();

    pub static ref RPC_ERRORS: CounterVec = register_counter_vec!(
        "authority_rpc_errors_total",
        "Errors talking to external chain endpoints",
        &["endpoint"]
    )
    .unwrap();
}

pub fn record_rpc_error(endpoint: &str) {
    RPC_ERRORS.with_label_values(&[endpoint]).inc();
}

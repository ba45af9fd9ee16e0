//! Authority node for the federated wDingocoin bridge.
//!
//! Each of the N committee operators runs one of these nodes. The node
//! co-derives multisig deposit addresses, accounts confirmed deposits and
//! on-chain burns, issues contract-verifiable mint vouchers, and co-signs
//! the coordinator's batched settlement transactions. There is no leader
//! election: correctness comes from a shared deterministic view of both
//! chains, local replay protection in the store, and unanimous co-signing.

pub mod amount;
pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod dingo;
pub mod envelope;
pub mod error;
pub mod evm;
pub mod faultlog;
pub mod metrics;
pub mod minting;
pub mod payout;
pub mod peers;
pub mod registrar;
pub mod state;
pub mod stats;
pub mod withdrawal;

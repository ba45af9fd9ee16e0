//! Application context threaded through every request handler.
//!
//! The store pool, UTXO client, and EVM client are leaves; handlers own
//! references to all three through this struct. No ambient globals.

use std::sync::Arc;
use std::time::Instant;

use alloy::primitives::Address;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::config::Settings;
use crate::dingo::DingoClient;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::evm::{self, EvmClient};
use crate::faultlog::FaultLog;
use crate::peers::PeerClient;

pub struct AppState {
    pub settings: Settings,
    pub pool: SqlitePool,
    pub dingo: DingoClient,
    pub evm: EvmClient,
    pub peers: PeerClient,
    /// Serializes all store mutations and the whole co-signing critical
    /// section. Held across awaits; tokio's mutex is required.
    pub write_lock: Mutex<()>,
    /// `(computed_at, snapshot)` for the 10-minute stats cache.
    pub stats_cache: Mutex<Option<(Instant, Value)>>,
    pub fault_log: FaultLog,
    /// This node's position in `settings.public_settings.authority_nodes`.
    pub self_index: usize,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        settings: Settings,
        pool: SqlitePool,
        dingo: DingoClient,
        evm: EvmClient,
    ) -> Result<Self> {
        let wallet = format!("{:#x}", evm.wallet_address());
        let self_index = settings.authority_index_of(&wallet).ok_or_else(|| {
            Error::Internal(format!(
                "wallet {wallet} is not in the configured authority set"
            ))
        })?;
        let fault_log = FaultLog::new(&settings.node_settings.fault_log_path);
        Ok(AppState {
            settings,
            pool,
            dingo,
            evm,
            peers: PeerClient::new()?,
            write_lock: Mutex::new(()),
            stats_cache: Mutex::new(None),
            fault_log,
            self_index,
        })
    }

    pub fn is_coordinator(&self) -> bool {
        self.self_index == self.settings.public_settings.payout_coordinator
    }

    /// Wallet addresses of the whole committee, in configured order.
    pub fn authority_addresses(&self) -> Result<Vec<Address>> {
        self.settings
            .public_settings
            .authority_nodes
            .iter()
            .map(|node| evm::parse_address(&node.wallet_address))
            .collect()
    }

    pub fn coordinator_address(&self) -> Result<Address> {
        evm::parse_address(&self.settings.coordinator().wallet_address)
    }

    /// Seal a reply/request payload against the current chain anchor.
    pub async fn seal<T: Serialize>(&self, payload: &T) -> Result<Envelope> {
        let (height, hash) = self
            .dingo
            .envelope_anchor(self.settings.dingo_settings.sync_delay_threshold)
            .await?;
        Envelope::seal(payload, &self.evm, height, &hash)
    }

    /// Check an inbound envelope's chain anchor against the local daemon.
    pub async fn verify_anchor(&self, envelope: &Envelope) -> Result<()> {
        let info = self.dingo.get_blockchain_info().await?;
        let (height, _) = envelope.anchor()?;
        if height > info.blocks {
            return Err(Error::Unauthorized(format!(
                "envelope anchored at {height}, above local tip {}",
                info.blocks
            )));
        }
        let actual = self.dingo.get_block_hash(height).await?;
        envelope.verify_anchor(
            info.blocks,
            &actual,
            self.settings.dingo_settings.sync_delay_threshold,
        )
    }
}

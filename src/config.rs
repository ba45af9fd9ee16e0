//! Node configuration.
//!
//! Layered loading: an optional local `.env`, a settings file (TOML/JSON),
//! then `WDINGO__`-prefixed environment overrides. The authority-node list is
//! ordered and positional — envelope checks and multisig derivation depend on
//! this exact order being identical on every node.

use std::fmt;
use std::path::Path;

use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::amount::TaxPolicy;

/// One entry of the fixed, publicly known authority committee.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct AuthorityNode {
    pub hostname: String,
    pub port: u16,
    /// EVM wallet address the node signs envelopes with.
    pub wallet_address: String,
}

impl AuthorityNode {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.hostname, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct PublicSettings {
    /// Ordered; index is the node's identity in every positional check.
    pub authority_nodes: Vec<AuthorityNode>,
    /// k for the k-of-N multisig and for accepted mints.
    pub authority_threshold: usize,
    /// Index into `authority_nodes` of the payout coordinator.
    pub payout_coordinator: usize,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct DingoSettings {
    /// Dingocoin daemon JSON-RPC endpoint.
    pub rpc_url: String,
    #[serde(skip_serializing)]
    pub rpc_user: String,
    #[serde(skip_serializing)]
    pub rpc_password: String,
    pub deposit_confirmations: u64,
    pub change_confirmations: u64,
    /// Blocks of tolerated desync when time-binding envelopes.
    pub sync_delay_threshold: u64,
    pub change_address: String,
    pub tax_payout_addresses: Vec<String>,
    #[serde(flatten)]
    pub tax: TaxPolicy,
}

/// Custom Debug that redacts daemon credentials.
impl fmt::Debug for DingoSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DingoSettings")
            .field("rpc_url", &self.rpc_url)
            .field("rpc_user", &"<redacted>")
            .field("rpc_password", &"<redacted>")
            .field("deposit_confirmations", &self.deposit_confirmations)
            .field("change_confirmations", &self.change_confirmations)
            .field("sync_delay_threshold", &self.sync_delay_threshold)
            .field("change_address", &self.change_address)
            .field("tax_payout_addresses", &self.tax_payout_addresses)
            .field("tax", &self.tax)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct SmartContractSettings {
    pub chain_id: u64,
    pub contract_address: String,
    pub provider: String,
}

#[derive(Clone, Deserialize)]
pub struct NodeSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub port: u16,
    /// Plain-HTTP health/metrics listener; disabled when absent.
    #[serde(default)]
    pub metrics_port: Option<u16>,
    pub database_path: String,
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    /// File holding the authority's EVM private key (strict permissions).
    pub wallet_key_path: String,
    #[serde(default = "default_fault_log_path")]
    pub fault_log_path: String,
}

/// Custom Debug that avoids echoing the wallet-key path contents anywhere.
impl fmt::Debug for NodeSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSettings")
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field("metrics_port", &self.metrics_port)
            .field("database_path", &self.database_path)
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("wallet_key_path", &self.wallet_key_path)
            .field("fault_log_path", &self.fault_log_path)
            .finish()
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_fault_log_path() -> String {
    "wdingo-authority.faults.log".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub public_settings: PublicSettings,
    pub dingo_settings: DingoSettings,
    pub smart_contract_settings: SmartContractSettings,
    pub node_settings: NodeSettings,
}

impl Settings {
    /// Load from `path`, with `WDINGO__`-prefixed environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::dotenv().wrap_err("failed to load .env")?;
        }

        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("WDINGO").separator("__"))
            .build()
            .wrap_err_with(|| format!("failed to read settings from {path}"))?
            .try_deserialize()
            .wrap_err("settings file does not match the expected schema")?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let n = self.public_settings.authority_nodes.len();
        if n == 0 {
            return Err(eyre!("public_settings.authority_nodes cannot be empty"));
        }
        if self.public_settings.authority_threshold == 0
            || self.public_settings.authority_threshold > n
        {
            return Err(eyre!(
                "public_settings.authority_threshold must be in 1..={n}"
            ));
        }
        if self.public_settings.payout_coordinator >= n {
            return Err(eyre!(
                "public_settings.payout_coordinator must index authority_nodes (< {n})"
            ));
        }
        for node in &self.public_settings.authority_nodes {
            if node.wallet_address.len() != 42 || !node.wallet_address.starts_with("0x") {
                return Err(eyre!(
                    "authority wallet_address {} is not a 0x-prefixed EVM address",
                    node.wallet_address
                ));
            }
        }
        if self.dingo_settings.rpc_url.is_empty() {
            return Err(eyre!("dingo_settings.rpc_url cannot be empty"));
        }
        if self.dingo_settings.change_address.is_empty() {
            return Err(eyre!("dingo_settings.change_address cannot be empty"));
        }
        if self.dingo_settings.tax_payout_addresses.is_empty() {
            return Err(eyre!("dingo_settings.tax_payout_addresses cannot be empty"));
        }
        if self.smart_contract_settings.contract_address.len() != 42
            || !self.smart_contract_settings.contract_address.starts_with("0x")
        {
            return Err(eyre!(
                "smart_contract_settings.contract_address must be a 0x-prefixed EVM address"
            ));
        }
        if self.node_settings.cert_path.is_some() != self.node_settings.key_path.is_some() {
            return Err(eyre!(
                "node_settings.cert_path and key_path must be set together"
            ));
        }
        Ok(())
    }

    /// Read the EVM wallet key from its private file.
    pub fn load_wallet_key(&self) -> Result<String> {
        let raw = std::fs::read_to_string(&self.node_settings.wallet_key_path)
            .wrap_err_with(|| {
                format!(
                    "failed to read wallet key from {}",
                    self.node_settings.wallet_key_path
                )
            })?;
        let key = raw.trim().to_string();
        if key.is_empty() {
            return Err(eyre!("wallet key file is empty"));
        }
        Ok(key)
    }

    /// Position of a wallet address in the committee, if it is a member.
    pub fn authority_index_of(&self, wallet_address: &str) -> Option<usize> {
        self.public_settings
            .authority_nodes
            .iter()
            .position(|node| node.wallet_address.eq_ignore_ascii_case(wallet_address))
    }

    pub fn coordinator(&self) -> &AuthorityNode {
        &self.public_settings.authority_nodes[self.public_settings.payout_coordinator]
    }
}

/// Reference settings for tests; not used by the binary.
#[doc(hidden)]
pub fn test_settings(n: usize) -> Settings {
    let authority_nodes = (0..n)
        .map(|i| AuthorityNode {
            hostname: format!("authority-{i}.example.org"),
            port: 8443,
            wallet_address: format!("0x{:040x}", i + 1),
        })
        .collect();
    Settings {
        public_settings: PublicSettings {
            authority_nodes,
            authority_threshold: (n * 2).div_ceil(3).max(1),
            payout_coordinator: 0,
        },
        dingo_settings: DingoSettings {
            rpc_url: "http://127.0.0.1:34646".to_string(),
            rpc_user: "rpc".to_string(),
            rpc_password: "rpc".to_string(),
            deposit_confirmations: 60,
            change_confirmations: 60,
            sync_delay_threshold: 15,
            change_address: "D7YzqF3q1rCmJ9aX2kP4vN8bTEST00chg".to_string(),
            tax_payout_addresses: vec!["D8WxrE2p5sDnK1bY3mQ6wO9cTEST00tax".to_string()],
            tax: TaxPolicy::default(),
        },
        smart_contract_settings: SmartContractSettings {
            chain_id: 56,
            contract_address: format!("0x{:040x}", 0xc0ffeeu64),
            provider: "http://127.0.0.1:8545".to_string(),
        },
        node_settings: NodeSettings {
            bind_address: default_bind_address(),
            port: 8443,
            metrics_port: None,
            database_path: ":memory:".to_string(),
            cert_path: None,
            key_path: None,
            wallet_key_path: "wallet.key".to_string(),
            fault_log_path: default_fault_log_path(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Satoshi;

    #[test]
    fn test_validate_accepts_reference_settings() {
        assert!(test_settings(3).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut s = test_settings(3);
        s.public_settings.authority_threshold = 0;
        assert!(s.validate().is_err());
        s.public_settings.authority_threshold = 4;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_coordinator() {
        let mut s = test_settings(3);
        s.public_settings.payout_coordinator = 3;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_requires_paired_tls_paths() {
        let mut s = test_settings(2);
        s.node_settings.cert_path = Some("cert.pem".to_string());
        assert!(s.validate().is_err());
        s.node_settings.key_path = Some("key.pem".to_string());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_authority_index_is_case_insensitive() {
        let mut s = test_settings(3);
        s.public_settings.authority_nodes[1].wallet_address =
            "0x00000000000000000000000000000000000000Ab".to_string();
        assert_eq!(
            s.authority_index_of("0x00000000000000000000000000000000000000ab"),
            Some(1)
        );
        assert_eq!(s.authority_index_of("0xdead"), None);
    }

    #[test]
    fn test_default_tax_policy_constants() {
        let tax = TaxPolicy::default();
        assert_eq!(tax.flat_fee, Satoshi::from_sat(1_000_000_000));
        assert_eq!(tax.payout_network_fee_per_tx, Satoshi::from_sat(2_000_000_000));
        assert_eq!(tax.dust_threshold, Satoshi::from_sat(100_000_000));
    }
}

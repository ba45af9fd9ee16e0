//! Outbound client for authority-to-authority calls.
//!
//! Every call is bounded by a 5 s timeout; a peer that fails to respond
//! aborts the in-progress operation. Response envelopes are verified against
//! the peer's publicly configured wallet address before use.

use std::time::Duration;

use reqwest::Client;

use crate::config::AuthorityNode;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::evm;

pub const PEER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PeerClient {
    client: Client,
}

impl PeerClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(PEER_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build peer client: {e}")))?;
        Ok(PeerClient { client })
    }

    /// POST a sealed envelope to `node` and return its verified response
    /// envelope.
    pub async fn post(
        &self,
        node: &AuthorityNode,
        path: &str,
        request: &Envelope,
    ) -> Result<Envelope> {
        let url = format!("{}{}", node.base_url(), path);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("authority {} unreachable: {e}", node.hostname)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Consensus(format!(
                "authority {} replied {status}: {body}",
                node.hostname
            )));
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| Error::Consensus(format!("bad reply from {}: {e}", node.hostname)))?;
        envelope.verify_signer(evm::parse_address(&node.wallet_address)?)?;
        Ok(envelope)
    }
}

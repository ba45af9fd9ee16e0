//! Store row types. Amounts are decimal satoshi TEXT in SQLite.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::amount::Satoshi;

/// One-to-one mapping between a Token-chain mint address and the k-of-N
/// multisig deposit address derived for it. `approved_tax` is the cumulative
/// deposit tax this authority has already co-signed a payout for; it only
/// ever increases.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintBinding {
    pub mint_address: String,
    pub deposit_address: String,
    pub redeem_script: String,
    pub approved_tax: Satoshi,
}

/// Local record of a user-reported burn event, keyed by
/// `(burn_address, burn_index)` into the Token-chain burn history.
///
/// Either both approved fields are zero (SUBMITTED) or both carry the full
/// credited split (APPROVED); there is no partial state.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Withdrawal {
    pub burn_address: String,
    pub burn_index: i64,
    pub approved_amount: Satoshi,
    pub approved_tax: Satoshi,
}

impl Withdrawal {
    pub fn is_submitted(&self) -> bool {
        self.approved_amount.is_zero() && self.approved_tax.is_zero()
    }
}

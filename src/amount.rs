//! Fixed-point Coin amounts and the consensus-critical tax formulas.
//!
//! Every authority recomputes taxes and fees over the same chain state and
//! must produce bit-identical results, so all arithmetic here is integer
//! arithmetic on satoshis (1e-8 Coin).

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Satoshis per whole Coin.
pub const COIN: u64 = 100_000_000;

/// A nonnegative Coin amount in satoshis (8 decimals).
///
/// Serialized everywhere (wire and store) as a decimal satoshi string so no
/// JSON number precision is ever involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Satoshi(u64);

impl Satoshi {
    pub const ZERO: Satoshi = Satoshi(0);

    pub const fn from_sat(sat: u64) -> Self {
        Satoshi(sat)
    }

    pub const fn sat(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Satoshi) -> Result<Satoshi, Error> {
        self.0
            .checked_add(other.0)
            .map(Satoshi)
            .ok_or(Error::AccountingInvariantViolated("amount overflow".into()))
    }

    pub fn checked_sub(self, other: Satoshi) -> Result<Satoshi, Error> {
        self.0
            .checked_sub(other.0)
            .map(Satoshi)
            .ok_or(Error::AccountingInvariantViolated(
                "amount underflow".into(),
            ))
    }

    pub fn saturating_sub(self, other: Satoshi) -> Satoshi {
        Satoshi(self.0.saturating_sub(other.0))
    }

    /// Sum an iterator of amounts, failing on overflow.
    pub fn sum<I: IntoIterator<Item = Satoshi>>(iter: I) -> Result<Satoshi, Error> {
        iter.into_iter()
            .try_fold(Satoshi::ZERO, |acc, x| acc.checked_add(x))
    }

    /// Parse an exact Coin decimal string ("50", "50.0", "0.00000001").
    ///
    /// More than 8 fractional digits, signs, or empty parts are rejected.
    pub fn from_coin_str(s: &str) -> Result<Satoshi, Error> {
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(Error::MalformedRequest(format!("bad amount {s:?}")));
        }
        if frac.len() > 8 {
            return Err(Error::MalformedRequest(format!(
                "amount {s:?} has more than 8 decimals"
            )));
        }
        let digits = |p: &str| p.is_empty() || p.bytes().all(|b| b.is_ascii_digit());
        if !digits(whole) || !digits(frac) {
            return Err(Error::MalformedRequest(format!("bad amount {s:?}")));
        }
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| Error::MalformedRequest(format!("bad amount {s:?}")))?
        };
        let mut frac_sat: u64 = 0;
        if !frac.is_empty() {
            let padded = format!("{frac:0<8}");
            frac_sat = padded
                .parse()
                .map_err(|_| Error::MalformedRequest(format!("bad amount {s:?}")))?;
        }
        whole
            .checked_mul(COIN)
            .and_then(|w| w.checked_add(frac_sat))
            .map(Satoshi)
            .ok_or_else(|| Error::MalformedRequest(format!("amount {s:?} out of range")))
    }

    /// Exact Coin decimal string with all 8 decimals ("50.00000000").
    ///
    /// This is the form handed to the UTXO daemon in raw-transaction vouts.
    pub fn to_coin_string(self) -> String {
        format!("{}.{:08}", self.0 / COIN, self.0 % COIN)
    }

    /// Convert a JSON float amount as reported by `decoderawtransaction`.
    ///
    /// The daemon serializes 8-decimal values as floats; round-half-up at
    /// 1e8 recovers the exact satoshi count.
    pub fn from_coin_f64(v: f64) -> Result<Satoshi, Error> {
        if !v.is_finite() || v < 0.0 {
            return Err(Error::MalformedRequest(format!("bad amount {v}")));
        }
        Ok(Satoshi((v * COIN as f64).round() as u64))
    }
}

impl fmt::Display for Satoshi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Satoshi {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Satoshi)
            .map_err(|_| Error::MalformedRequest(format!("bad satoshi amount {s:?}")))
    }
}

impl Serialize for Satoshi {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Satoshi {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SatVisitor;

        impl de::Visitor<'_> for SatVisitor {
            type Value = Satoshi;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a decimal satoshi string or nonnegative integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Satoshi, E> {
                v.parse().map_err(|_| E::custom("bad satoshi amount"))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Satoshi, E> {
                Ok(Satoshi(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Satoshi, E> {
                u64::try_from(v)
                    .map(Satoshi)
                    .map_err(|_| E::custom("negative satoshi amount"))
            }
        }

        deserializer.deserialize_any(SatVisitor)
    }
}

impl sqlx::Type<sqlx::Sqlite> for Satoshi {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for Satoshi {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <String as sqlx::Encode<'q, sqlx::Sqlite>>::encode(self.0.to_string(), buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for Satoshi {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
        Ok(Satoshi(s.parse::<u64>()?))
    }
}

/// Deployment fee constants (satoshis). Consensus-critical: all authorities
/// must run identical values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct TaxPolicy {
    /// Minimum amount and flat service fee per deposit/withdrawal.
    #[serde(default = "default_flat_fee")]
    pub flat_fee: Satoshi,
    /// Network-fee contribution per deposit and per withdrawal in a batch.
    #[serde(default = "default_network_fee_per_tx")]
    pub payout_network_fee_per_tx: Satoshi,
    /// Vouts below this are dropped.
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold: Satoshi,
}

fn default_flat_fee() -> Satoshi {
    Satoshi(10 * COIN)
}

fn default_network_fee_per_tx() -> Satoshi {
    Satoshi(20 * COIN)
}

fn default_dust_threshold() -> Satoshi {
    Satoshi(COIN)
}

impl Default for TaxPolicy {
    fn default() -> Self {
        TaxPolicy {
            flat_fee: default_flat_fee(),
            payout_network_fee_per_tx: default_network_fee_per_tx(),
            dust_threshold: default_dust_threshold(),
        }
    }
}

impl TaxPolicy {
    pub fn meets_tax(&self, x: Satoshi) -> bool {
        x >= self.flat_fee
    }

    /// Flat fee plus integer 1% of the remainder.
    pub fn tax(&self, x: Satoshi) -> Result<Satoshi, Error> {
        if !self.meets_tax(x) {
            return Err(Error::AmountTooSmall {
                amount: x,
                minimum: self.flat_fee,
            });
        }
        Ok(Satoshi(
            self.flat_fee.sat() + (x.sat() - self.flat_fee.sat()) / 100,
        ))
    }

    pub fn amount_after_tax(&self, x: Satoshi) -> Result<Satoshi, Error> {
        Ok(Satoshi(x.sat() - self.tax(x)?.sat()))
    }
}

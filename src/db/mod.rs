//! Durable local store.
//!
//! Append-only registry of used deposit pubkeys, mint↔deposit bindings, and
//! withdrawals. The store is single-writer: every mutation runs while the
//! process-wide write lock (held in the application state) is taken, and the
//! pool keeps a single connection so in-memory test databases behave like
//! file-backed ones.

use std::collections::HashSet;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::{Error, Result};

pub mod models;

pub use models::*;

/// Open (creating if missing) the store at `database_path`.
pub async fn create_pool(database_path: &str) -> Result<SqlitePool> {
    let options = if database_path == ":memory:" {
        SqliteConnectOptions::from_str("sqlite::memory:")
    } else {
        SqliteConnectOptions::from_str(&format!("sqlite://{database_path}"))
            .map(|o| o.create_if_missing(true))
    }
    .map_err(|e| Error::Internal(format!("bad database path {database_path:?}: {e}")))?;

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(Error::from)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| Error::Internal(format!("migrations failed: {e}")))
}

/// True if any of `pubkeys` has been consumed by an earlier registration.
pub async fn has_used_deposit_pubkeys(pool: &SqlitePool, pubkeys: &[String]) -> Result<bool> {
    for pubkey in pubkeys {
        let row: (bool,) = sqlx::query_as(
            r#"SELECT EXISTS(SELECT 1 FROM used_deposit_pubkeys WHERE pubkey = $1)"#,
        )
        .bind(pubkey)
        .fetch_one(pool)
        .await?;
        if row.0 {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Record all of `pubkeys` as used, atomically. Any prior use fails the
/// whole batch.
pub async fn register_used_deposit_pubkeys(pool: &SqlitePool, pubkeys: &[String]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for pubkey in pubkeys {
        sqlx::query(r#"INSERT INTO used_deposit_pubkeys (pubkey) VALUES ($1)"#)
            .bind(pubkey)
            .execute(&mut *tx)
            .await
            .map_err(|e| match Error::from(e) {
                Error::Duplicate(_) => {
                    Error::Duplicate(format!("deposit pubkey {pubkey} already used"))
                }
                other => other,
            })?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn register_mint_binding(
    pool: &SqlitePool,
    mint_address: &str,
    deposit_address: &str,
    redeem_script: &str,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO mint_bindings (mint_address, deposit_address, redeem_script)
           VALUES ($1, $2, $3)"#,
    )
    .bind(mint_address)
    .bind(deposit_address)
    .bind(redeem_script)
    .execute(pool)
    .await
    .map_err(|e| match Error::from(e) {
        Error::Duplicate(_) => Error::Duplicate(format!(
            "mint address {mint_address} or deposit address {deposit_address} already bound"
        )),
        other => other,
    })?;
    Ok(())
}

pub async fn get_mint_binding(pool: &SqlitePool, mint_address: &str) -> Result<Option<MintBinding>> {
    let row = sqlx::query_as::<_, MintBinding>(
        r#"SELECT mint_address, deposit_address, redeem_script, approved_tax
           FROM mint_bindings WHERE mint_address = $1"#,
    )
    .bind(mint_address)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// All bindings, optionally restricted to a set of deposit addresses.
pub async fn get_mint_bindings(
    pool: &SqlitePool,
    filter_deposit_addresses: Option<&HashSet<String>>,
) -> Result<Vec<MintBinding>> {
    let rows = sqlx::query_as::<_, MintBinding>(
        r#"SELECT mint_address, deposit_address, redeem_script, approved_tax
           FROM mint_bindings ORDER BY mint_address"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(match filter_deposit_addresses {
        Some(filter) => rows
            .into_iter()
            .filter(|b| filter.contains(&b.deposit_address))
            .collect(),
        None => rows,
    })
}

/// Persist new `approved_tax` values. Only that column is written.
pub async fn update_mint_bindings(pool: &SqlitePool, bindings: &[MintBinding]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for binding in bindings {
        sqlx::query(r#"UPDATE mint_bindings SET approved_tax = $1 WHERE mint_address = $2"#)
            .bind(binding.approved_tax)
            .bind(&binding.mint_address)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn register_withdrawal(
    pool: &SqlitePool,
    burn_address: &str,
    burn_index: i64,
) -> Result<()> {
    sqlx::query(r#"INSERT INTO withdrawals (burn_address, burn_index) VALUES ($1, $2)"#)
        .bind(burn_address)
        .bind(burn_index)
        .execute(pool)
        .await
        .map_err(|e| match Error::from(e) {
            Error::Duplicate(_) => Error::Duplicate(format!(
                "withdrawal ({burn_address}, {burn_index}) already submitted"
            )),
            other => other,
        })?;
    Ok(())
}

pub async fn get_withdrawal(
    pool: &SqlitePool,
    burn_address: &str,
    burn_index: i64,
) -> Result<Option<Withdrawal>> {
    let row = sqlx::query_as::<_, Withdrawal>(
        r#"SELECT burn_address, burn_index, approved_amount, approved_tax
           FROM withdrawals WHERE burn_address = $1 AND burn_index = $2"#,
    )
    .bind(burn_address)
    .bind(burn_index)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_withdrawals(pool: &SqlitePool) -> Result<Vec<Withdrawal>> {
    let rows = sqlx::query_as::<_, Withdrawal>(
        r#"SELECT burn_address, burn_index, approved_amount, approved_tax
           FROM withdrawals ORDER BY burn_address, burn_index"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Withdrawals still in the SUBMITTED state.
pub async fn get_unapproved_withdrawals(pool: &SqlitePool) -> Result<Vec<Withdrawal>> {
    let rows = sqlx::query_as::<_, Withdrawal>(
        r#"SELECT burn_address, burn_index, approved_amount, approved_tax
           FROM withdrawals
           WHERE approved_amount = '0' AND approved_tax = '0'
           ORDER BY burn_address, burn_index"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Persist new approved amounts. Only the approved columns are written.
pub async fn update_withdrawals(pool: &SqlitePool, withdrawals: &[Withdrawal]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for withdrawal in withdrawals {
        sqlx::query(
            r#"UPDATE withdrawals SET approved_amount = $1, approved_tax = $2
               WHERE burn_address = $3 AND burn_index = $4"#,
        )
        .bind(withdrawal.approved_amount)
        .bind(withdrawal.approved_tax)
        .bind(&withdrawal.burn_address)
        .bind(withdrawal.burn_index)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Apply one co-signed payout batch: increased binding taxes and approved
/// withdrawals land in a single transaction.
pub async fn apply_payout_mutations(
    pool: &SqlitePool,
    bindings: &[MintBinding],
    withdrawals: &[Withdrawal],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    for binding in bindings {
        sqlx::query(r#"UPDATE mint_bindings SET approved_tax = $1 WHERE mint_address = $2"#)
            .bind(binding.approved_tax)
            .bind(&binding.mint_address)
            .execute(&mut *tx)
            .await?;
    }
    for withdrawal in withdrawals {
        sqlx::query(
            r#"UPDATE withdrawals SET approved_amount = $1, approved_tax = $2
               WHERE burn_address = $3 AND burn_index = $4"#,
        )
        .bind(withdrawal.approved_amount)
        .bind(withdrawal.approved_tax)
        .bind(&withdrawal.burn_address)
        .bind(withdrawal.burn_index)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

fn sql_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Complete, self-contained textual snapshot of the store, suitable for
/// restoration on another authority via [`reset_database`].
pub async fn dump_database(pool: &SqlitePool) -> Result<String> {
    let mut out = String::new();
    out.push_str(include_str!("../../migrations/0001_init.sql"));
    out.push('\n');

    let pubkeys: Vec<(String,)> =
        sqlx::query_as(r#"SELECT pubkey FROM used_deposit_pubkeys ORDER BY pubkey"#)
            .fetch_all(pool)
            .await?;
    for (pubkey,) in &pubkeys {
        out.push_str(&format!(
            "INSERT INTO used_deposit_pubkeys (pubkey) VALUES ({});\n",
            sql_quote(pubkey)
        ));
    }

    for binding in get_mint_bindings(pool, None).await? {
        out.push_str(&format!(
            "INSERT INTO mint_bindings (mint_address, deposit_address, redeem_script, approved_tax) VALUES ({}, {}, {}, {});\n",
            sql_quote(&binding.mint_address),
            sql_quote(&binding.deposit_address),
            sql_quote(&binding.redeem_script),
            sql_quote(&binding.approved_tax.to_string()),
        ));
    }

    for w in get_withdrawals(pool).await? {
        out.push_str(&format!(
            "INSERT INTO withdrawals (burn_address, burn_index, approved_amount, approved_tax) VALUES ({}, {}, {}, {});\n",
            sql_quote(&w.burn_address),
            w.burn_index,
            sql_quote(&w.approved_amount.to_string()),
            sql_quote(&w.approved_tax.to_string()),
        ));
    }

    Ok(out)
}

/// Atomically replace all local state with `dump` (as produced by
/// [`dump_database`], possibly on another authority).
pub async fn reset_database(pool: &SqlitePool, dump: &str) -> Result<()> {
    let script = format!(
        "BEGIN;\n\
         DELETE FROM used_deposit_pubkeys;\n\
         DELETE FROM mint_bindings;\n\
         DELETE FROM withdrawals;\n\
         {dump}\n\
         COMMIT;\n"
    );
    sqlx::raw_sql(&script)
        .execute(pool)
        .await
        .map_err(|e| Error::Internal(format!("restore failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Satoshi;

    async fn pool() -> SqlitePool {
        let pool = create_pool(":memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_pubkey_registration_is_once_only() {
        let pool = pool().await;
        let keys = vec!["02aa".to_string(), "02bb".to_string(), "02cc".to_string()];
        assert!(!has_used_deposit_pubkeys(&pool, &keys).await.unwrap());
        register_used_deposit_pubkeys(&pool, &keys).await.unwrap();
        assert!(has_used_deposit_pubkeys(&pool, &keys).await.unwrap());

        // Reusing even one key fails the whole batch.
        let overlapping = vec!["02dd".to_string(), "02bb".to_string()];
        let err = register_used_deposit_pubkeys(&pool, &overlapping)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));

        // The atomic failure must not have recorded the fresh key.
        assert!(
            !has_used_deposit_pubkeys(&pool, &["02dd".to_string()])
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_mint_binding_bijection() {
        let pool = pool().await;
        register_mint_binding(&pool, "0xmint1", "Ddep1", "52aa").await.unwrap();

        // Same mint address, different deposit.
        assert!(matches!(
            register_mint_binding(&pool, "0xmint1", "Ddep2", "52bb").await,
            Err(Error::Duplicate(_))
        ));
        // Different mint address, same deposit.
        assert!(matches!(
            register_mint_binding(&pool, "0xmint2", "Ddep1", "52cc").await,
            Err(Error::Duplicate(_))
        ));

        let binding = get_mint_binding(&pool, "0xmint1").await.unwrap().unwrap();
        assert_eq!(binding.deposit_address, "Ddep1");
        assert_eq!(binding.approved_tax, Satoshi::ZERO);
        assert!(get_mint_binding(&pool, "0xmint2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mint_binding_filter_and_update() {
        let pool = pool().await;
        register_mint_binding(&pool, "0xmint1", "Ddep1", "52aa").await.unwrap();
        register_mint_binding(&pool, "0xmint2", "Ddep2", "52bb").await.unwrap();

        let filter: HashSet<String> = ["Ddep2".to_string()].into();
        let filtered = get_mint_bindings(&pool, Some(&filter)).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].mint_address, "0xmint2");

        let mut binding = filtered[0].clone();
        binding.approved_tax = Satoshi::from_sat(1_040_000_000);
        update_mint_bindings(&pool, &[binding]).await.unwrap();
        let reread = get_mint_binding(&pool, "0xmint2").await.unwrap().unwrap();
        assert_eq!(reread.approved_tax, Satoshi::from_sat(1_040_000_000));
        // Untouched columns survive.
        assert_eq!(reread.redeem_script, "52bb");
    }

    #[tokio::test]
    async fn test_withdrawal_duplicate_submit() {
        let pool = pool().await;
        register_withdrawal(&pool, "0xburner", 7).await.unwrap();
        assert!(matches!(
            register_withdrawal(&pool, "0xburner", 7).await,
            Err(Error::Duplicate(_))
        ));
        // Exactly one row.
        assert_eq!(get_withdrawals(&pool).await.unwrap().len(), 1);
        // Same address, different index is fine.
        register_withdrawal(&pool, "0xburner", 8).await.unwrap();
    }

    #[tokio::test]
    async fn test_withdrawal_approval_transition() {
        let pool = pool().await;
        register_withdrawal(&pool, "0xburner", 3).await.unwrap();
        assert_eq!(get_unapproved_withdrawals(&pool).await.unwrap().len(), 1);

        let mut w = get_withdrawal(&pool, "0xburner", 3).await.unwrap().unwrap();
        assert!(w.is_submitted());
        w.approved_amount = Satoshi::from_sat(6_930_000_000);
        w.approved_tax = Satoshi::from_sat(1_070_000_000);
        update_withdrawals(&pool, &[w]).await.unwrap();

        let w = get_withdrawal(&pool, "0xburner", 3).await.unwrap().unwrap();
        assert!(!w.is_submitted());
        assert!(get_unapproved_withdrawals(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dump_and_reset_round_trip() {
        let source = pool().await;
        register_used_deposit_pubkeys(&source, &["02aa".to_string(), "02bb".to_string()])
            .await
            .unwrap();
        register_mint_binding(&source, "0xmint1", "Ddep1", "52'quoted'").await.unwrap();
        register_withdrawal(&source, "0xburner", 7).await.unwrap();

        let dump = dump_database(&source).await.unwrap();

        let target = pool().await;
        register_withdrawal(&target, "0xstale", 1).await.unwrap();
        reset_database(&target, &dump).await.unwrap();

        assert!(
            has_used_deposit_pubkeys(&target, &["02aa".to_string()])
                .await
                .unwrap()
        );
        let binding = get_mint_binding(&target, "0xmint1").await.unwrap().unwrap();
        assert_eq!(binding.redeem_script, "52'quoted'");
        let withdrawals = get_withdrawals(&target).await.unwrap();
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0].burn_address, "0xburner");
    }
}

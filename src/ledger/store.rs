//! Account persistence: load, insert, update, delete, and the inflation
//! vote enumeration.
//!
//! Every mutation flushes the entry cache around itself and notifies the
//! supplied [`LedgerDelta`]. Affected-row mismatches are fatal to the
//! enclosing transaction; the delta is expected to roll the row back.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use eyre::{eyre, Result, WrapErr};
use tracing::trace;

use crate::crypto::PublicKey;
use crate::db::Database;
use crate::ledger::account::{AccountFrame, AccountId, LedgerKey, Signer};
use crate::ledger::delta::LedgerDelta;
use crate::metrics;

/// Base64 of the default `[1, 0, 0, 0]` thresholds, seeded by the load
/// sentinel for accounts that do not exist yet.
pub const DEFAULT_THRESHOLDS_B64: &str = "AQAAAA==";

/// Accounts vote for an inflation destination only at or above this balance.
pub const INFLATION_VOTE_MIN_BALANCE: i64 = 1_000_000_000;

/// One load round-trip that reports existence and seeds creation defaults:
/// either the real row comes back with isnew = 0, or the synthetic branch
/// supplies default field values with isnew = 1.
const LOAD_ACCOUNT_SQL: &str = r#"
    SELECT balance, seqnum, numsubentries, inflationdest, homedomain,
           thresholds, flags, lastmodified, 0 AS isnew
      FROM accounts WHERE accountid = $1
    UNION
    SELECT 0 AS balance, 0 AS seqnum, 0 AS numsubentries,
           NULL AS inflationdest, NULL AS homedomain,
           'AQAAAA==' AS thresholds, 0 AS flags, 0 AS lastmodified, 1 AS isnew
     WHERE NOT EXISTS (SELECT * FROM accounts WHERE accountid = $1)
"#;

const INSERT_ACCOUNT_SQL: &str = r#"
    INSERT INTO accounts ( accountid, balance, seqnum, numsubentries,
        inflationdest, homedomain, thresholds, flags, lastmodified )
    VALUES ( $1, $2, $3, $4, $5, $6, $7, $8, $9 )
"#;

const UPDATE_ACCOUNT_SQL: &str = r#"
    UPDATE accounts SET balance = $2, seqnum = $3, numsubentries = $4,
        inflationdest = $5, homedomain = $6, thresholds = $7, flags = $8,
        lastmodified = $9
    WHERE accountid = $1
"#;

type AccountRow = (
    i64,            // balance
    i64,            // seqnum
    i32,            // numsubentries
    Option<String>, // inflationdest
    Option<String>, // homedomain
    Option<String>, // thresholds
    i32,            // flags
    i32,            // lastmodified
    i32,            // isnew
);

impl AccountFrame {
    /// Load an account, consulting the cache first.
    ///
    /// Returns a frame even when no row exists: the sentinel branch seeds
    /// default field values and marks the frame new for a caller that
    /// intends to create the account. `None` only covers the no-data path.
    pub async fn load(db: &Database, account_id: &AccountId) -> Result<Option<AccountFrame>> {
        let key = LedgerKey::account(*account_id);
        if db.cached_entry_exists(&key) {
            return Ok(db.get_cached_entry(&key).flatten());
        }

        let act_id = account_id.to_strkey();

        let row: Option<AccountRow> = {
            let _timer = metrics::select_timer("account");
            sqlx::query_as(LOAD_ACCOUNT_SQL)
                .bind(&act_id)
                .fetch_optional(db.pool())
                .await
                .wrap_err("Failed to load account")?
        };

        let Some((balance, seqnum, numsubentries, inflationdest, homedomain, thresholds, flags, lastmodified, isnew)) =
            row
        else {
            // the synthetic branch guarantees a row; this covers driver errors
            db.put_cached_entry(key, None);
            return Ok(None);
        };

        let mut frame = AccountFrame::new(*account_id);
        frame.set_is_new(isnew == 1);
        {
            let entry = frame.account_mut();
            entry.balance = balance;
            entry.seq_num = seqnum as u64;
            entry.num_sub_entries = numsubentries as u32;
            entry.flags = flags as u32;
            entry.last_modified = lastmodified as u32;
            entry.home_domain = homedomain.unwrap_or_default();
            if let Some(t) = thresholds {
                let bytes = BASE64
                    .decode(&t)
                    .wrap_err("thresholds column is not valid base64")?;
                entry.thresholds = bytes
                    .try_into()
                    .map_err(|_| eyre!("thresholds column must decode to 4 bytes"))?;
            }
            if let Some(dest) = inflationdest {
                entry.inflation_dest = Some(PublicKey::from_strkey(&dest)?);
            }
            entry.signers.clear();
        }

        if frame.account().num_sub_entries != 0 {
            let rows: Vec<(String, i32)> = {
                let _timer = metrics::select_timer("signer");
                sqlx::query_as("SELECT publickey, weight FROM signers WHERE accountid = $1")
                    .bind(&act_id)
                    .fetch_all(db.pool())
                    .await
                    .wrap_err("Failed to load signers")?
            };
            for (pub_key, weight) in rows {
                frame.account_mut().signers.push(Signer {
                    pub_key: PublicKey::from_strkey(&pub_key)?,
                    weight: weight as u32,
                });
            }
        }

        frame.normalize();
        frame.set_update_signers(false);
        trace!(account = %act_id, is_new = frame.is_new(), "loaded account");

        // A sentinel frame was never committed, so the cache records the
        // account as absent; only real rows are cached as frames.
        if frame.is_new() {
            db.put_cached_entry(key, None);
        } else {
            db.put_cached_entry(key, Some(frame.clone()));
        }
        Ok(Some(frame))
    }

    /// Existence check that answers from the cache when it can.
    pub async fn exists(db: &Database, key: &LedgerKey) -> Result<bool> {
        if db.cached_entry_exists(key) && db.get_cached_entry(key).flatten().is_some() {
            return Ok(true);
        }

        let act_id = key.account_id().to_strkey();
        let row: (bool,) = {
            let _timer = metrics::select_timer("account-exists");
            sqlx::query_as("SELECT EXISTS (SELECT NULL FROM accounts WHERE accountid = $1)")
                .bind(&act_id)
                .fetch_one(db.pool())
                .await
                .wrap_err("Failed to check account existence")?
        };
        Ok(row.0)
    }

    pub async fn store_add(&mut self, delta: &mut dyn LedgerDelta, db: &Database) -> Result<()> {
        self.store_update(delta, db, true).await
    }

    pub async fn store_change(&mut self, delta: &mut dyn LedgerDelta, db: &Database) -> Result<()> {
        self.store_update(delta, db, false).await
    }

    /// Shared add/change path.
    ///
    /// The load sentinel's `is_new` flag decides INSERT vs UPDATE together
    /// with the caller's verb, so a load-then-store_change on a missing
    /// account inserts instead of issuing a zero-row UPDATE. Note the flag
    /// is cleared before the SQL executes: a failure mid-statement rolls
    /// back the row through the delta but not this flag.
    pub async fn store_update(
        &mut self,
        delta: &mut dyn LedgerDelta,
        db: &Database,
        insert: bool,
    ) -> Result<()> {
        self.account_mut().last_modified = delta.current_ledger();

        let key = self.key();
        db.flush_cached_entry(&key);

        let act_id = self.id().to_strkey();
        let do_insert = self.is_new() || insert;
        self.set_is_new(false);

        let inflation_dest = self.account().inflation_dest.map(|k| k.to_strkey());
        let thresholds = BASE64.encode(self.account().thresholds);

        let result = {
            let _timer = if do_insert {
                metrics::insert_timer("account")
            } else {
                metrics::update_timer("account")
            };
            sqlx::query(if do_insert {
                INSERT_ACCOUNT_SQL
            } else {
                UPDATE_ACCOUNT_SQL
            })
            .bind(&act_id)
            .bind(self.account().balance)
            .bind(self.account().seq_num as i64)
            .bind(self.account().num_sub_entries as i32)
            .bind(inflation_dest.as_deref())
            .bind(&self.account().home_domain)
            .bind(&thresholds)
            .bind(self.account().flags as i32)
            .bind(self.account().last_modified as i32)
            .execute(db.pool())
            .await
            .wrap_err("Could not update data in SQL (account)")?
        };

        if result.rows_affected() != 1 {
            return Err(eyre!("Could not update data in SQL (account)"));
        }

        if do_insert {
            delta.add_entry(self);
        } else {
            delta.mod_entry(self);
        }

        if self.update_signers() {
            self.store_signer_changes(db, &act_id).await?;
            // flush again so a subsequent load observes the new signer rows
            db.flush_cached_entry(&key);
        }
        Ok(())
    }

    /// Diff the in-memory signer set against disk and apply the difference.
    ///
    /// The direction of iteration follows which side shrank; correctness
    /// depends only on set semantics, not ordering.
    async fn store_signer_changes(&self, db: &Database, act_id: &str) -> Result<()> {
        let start = AccountFrame::load(db, self.id())
            .await?
            .ok_or_else(|| eyre!("could not load account"))?;
        let start_signers = &start.account().signers;
        let final_signers = &self.account().signers;

        if final_signers.len() < start_signers.len() {
            // some signers were removed
            for start_signer in start_signers {
                match final_signers
                    .iter()
                    .find(|f| f.pub_key == start_signer.pub_key)
                {
                    Some(final_signer) => {
                        if final_signer.weight != start_signer.weight {
                            let _timer = metrics::update_timer("signer");
                            sqlx::query(
                                "UPDATE signers SET weight = $1 WHERE accountid = $2 AND publickey = $3",
                            )
                            .bind(final_signer.weight as i32)
                            .bind(act_id)
                            .bind(final_signer.pub_key.to_strkey())
                            .execute(db.pool())
                            .await
                            .wrap_err("Could not update data in SQL (signer)")?;
                        }
                    }
                    None => {
                        let result = {
                            let _timer = metrics::delete_timer("signer");
                            sqlx::query(
                                "DELETE FROM signers WHERE accountid = $1 AND publickey = $2",
                            )
                            .bind(act_id)
                            .bind(start_signer.pub_key.to_strkey())
                            .execute(db.pool())
                            .await
                            .wrap_err("Could not update data in SQL (signer)")?
                        };
                        if result.rows_affected() != 1 {
                            return Err(eyre!("Could not update data in SQL (signer)"));
                        }
                    }
                }
            }
        } else {
            // signers added or the same
            for final_signer in final_signers {
                match start_signers
                    .iter()
                    .find(|s| s.pub_key == final_signer.pub_key)
                {
                    Some(start_signer) => {
                        if final_signer.weight != start_signer.weight {
                            let result = {
                                let _timer = metrics::update_timer("signer");
                                sqlx::query(
                                    "UPDATE signers SET weight = $1 WHERE accountid = $2 AND publickey = $3",
                                )
                                .bind(final_signer.weight as i32)
                                .bind(act_id)
                                .bind(final_signer.pub_key.to_strkey())
                                .execute(db.pool())
                                .await
                                .wrap_err("Could not update data in SQL (signer2)")?
                            };
                            if result.rows_affected() != 1 {
                                return Err(eyre!("Could not update data in SQL (signer2)"));
                            }
                        }
                    }
                    None => {
                        let result = {
                            let _timer = metrics::insert_timer("signer");
                            sqlx::query(
                                "INSERT INTO signers (accountid, publickey, weight) VALUES ($1, $2, $3)",
                            )
                            .bind(act_id)
                            .bind(final_signer.pub_key.to_strkey())
                            .bind(final_signer.weight as i32)
                            .execute(db.pool())
                            .await
                            .wrap_err("Could not update data in SQL (new signer)")?
                        };
                        if result.rows_affected() != 1 {
                            return Err(eyre!("Could not update data in SQL (new signer)"));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn store_delete(&self, delta: &mut dyn LedgerDelta, db: &Database) -> Result<()> {
        Self::store_delete_key(delta, db, &self.key()).await
    }

    /// Remove the account and its signer rows. Missing rows are tolerated:
    /// deleting twice does not raise.
    pub async fn store_delete_key(
        delta: &mut dyn LedgerDelta,
        db: &Database,
        key: &LedgerKey,
    ) -> Result<()> {
        db.flush_cached_entry(key);

        let act_id = key.account_id().to_strkey();
        {
            let _timer = metrics::delete_timer("account");
            sqlx::query("DELETE FROM accounts WHERE accountid = $1")
                .bind(&act_id)
                .execute(db.pool())
                .await
                .wrap_err("Could not update data in SQL (account)")?;
        }
        {
            let _timer = metrics::delete_timer("signer");
            sqlx::query("DELETE FROM signers WHERE accountid = $1")
                .bind(&act_id)
                .execute(db.pool())
                .await
                .wrap_err("Could not update data in SQL (signer)")?;
        }
        delta.delete_entry(key);
        Ok(())
    }

    /// Enumerate inflation winners in order, stopping early when the
    /// visitor returns false. The tie-break on the destination key keeps
    /// winner selection deterministic across replicas.
    pub async fn process_for_inflation<F>(
        db: &Database,
        max_winners: i64,
        mut visitor: F,
    ) -> Result<()>
    where
        F: FnMut(i64, PublicKey) -> bool,
    {
        let query = format!(
            "SELECT sum(balance)::BIGINT AS votes, inflationdest FROM accounts \
             WHERE inflationdest IS NOT NULL AND balance >= {} \
             GROUP BY inflationdest \
             ORDER BY votes DESC, inflationdest DESC \
             LIMIT $1",
            INFLATION_VOTE_MIN_BALANCE
        );
        let rows: Vec<(i64, String)> = {
            let _timer = metrics::select_timer("inflation");
            sqlx::query_as(&query)
                .bind(max_winners)
                .fetch_all(db.pool())
                .await
                .wrap_err("Failed to enumerate inflation votes")?
        };

        for (votes, dest) in rows {
            if !visitor(votes, PublicKey::from_strkey(&dest)?) {
                break;
            }
        }
        Ok(())
    }

    pub async fn count_objects(db: &Database) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accounts")
            .fetch_one(db.pool())
            .await
            .wrap_err("Failed to count accounts")?;
        Ok(row.0 as u64)
    }

    /// Drop and recreate both tables and their indexes. Schema
    /// reinitialisation only, never the steady-state path.
    pub async fn drop_all(db: &Database) -> Result<()> {
        for sql in [
            "DROP TABLE IF EXISTS accounts",
            "DROP TABLE IF EXISTS signers",
            r#"CREATE TABLE accounts
               (
                   accountid       VARCHAR(56)  PRIMARY KEY,
                   balance         BIGINT       NOT NULL CHECK (balance >= 0),
                   seqnum          BIGINT       NOT NULL,
                   numsubentries   INT          NOT NULL CHECK (numsubentries >= 0),
                   inflationdest   VARCHAR(56),
                   homedomain      VARCHAR(32),
                   thresholds      TEXT,
                   flags           INT          NOT NULL,
                   lastmodified    INT          NOT NULL
               )"#,
            r#"CREATE TABLE signers
               (
                   accountid       VARCHAR(56) NOT NULL,
                   publickey       VARCHAR(56) NOT NULL,
                   weight          INT         NOT NULL,
                   PRIMARY KEY (accountid, publickey)
               )"#,
            "CREATE INDEX signersaccount ON signers (accountid)",
            "CREATE INDEX accountbalances ON accounts (balance) WHERE balance >= 1000000000",
        ] {
            sqlx::query(sql)
                .execute(db.pool())
                .await
                .wrap_err("Failed to reinitialise account schema")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds_constant_decodes() {
        let bytes = BASE64.decode(DEFAULT_THRESHOLDS_B64).unwrap();
        assert_eq!(bytes, vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_thresholds_encode_matches_sentinel() {
        assert_eq!(BASE64.encode([1u8, 0, 0, 0]), DEFAULT_THRESHOLDS_B64);
    }
}

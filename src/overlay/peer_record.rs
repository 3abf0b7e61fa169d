//! Persistent known-peer records with connect backoff.
//!
//! Keyed by (ip, port). A successful handshake resets the backoff; each
//! failed connect doubles the delay until the next attempt, capped.

use std::net::Ipv4Addr;

use chrono::{DateTime, Duration, Utc};
use eyre::{Result, WrapErr};
use sqlx::PgPool;

use crate::overlay::message::PeerAddress;

/// Initial delay after the first failed connect.
const BACKOFF_INITIAL_SECS: i64 = 10;
/// Ceiling on the backoff delay.
const BACKOFF_MAX_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub ip: String,
    pub port: u16,
    pub next_attempt: DateTime<Utc>,
    pub num_failures: u32,
}

/// RFC 1918 ranges plus loopback; these never leave the node in PEERS and
/// are never stored from gossip.
pub fn is_private_address(ip: [u8; 4]) -> bool {
    match ip {
        [10, ..] => true,
        [127, ..] => true,
        [172, b, ..] if (16..=31).contains(&b) => true,
        [192, 168, ..] => true,
        _ => false,
    }
}

impl PeerRecord {
    pub fn new(ip: String, port: u16, now: DateTime<Utc>) -> Self {
        PeerRecord {
            ip,
            port,
            next_attempt: now,
            num_failures: 0,
        }
    }

    pub fn from_address(address: &PeerAddress, now: DateTime<Utc>) -> Self {
        let [a, b, c, d] = address.ip;
        PeerRecord {
            ip: Ipv4Addr::new(a, b, c, d).to_string(),
            port: address.port as u16,
            next_attempt: now,
            num_failures: address.num_failures,
        }
    }

    pub fn is_private_address(&self) -> bool {
        self.ip
            .parse::<Ipv4Addr>()
            .map(|ip| is_private_address(ip.octets()))
            .unwrap_or(false)
    }

    pub fn to_address(&self) -> Option<PeerAddress> {
        let ip = self.ip.parse::<Ipv4Addr>().ok()?;
        Some(PeerAddress {
            ip: ip.octets(),
            port: self.port as u32,
            num_failures: self.num_failures,
        })
    }

    /// Forget past failures after a successful handshake.
    pub fn reset_back_off(&mut self, now: DateTime<Utc>) {
        self.num_failures = 0;
        self.next_attempt = now;
    }

    /// Push the next attempt out exponentially after a failed connect.
    pub fn back_off(&mut self, now: DateTime<Utc>) {
        self.num_failures += 1;
        let exp = (self.num_failures - 1).min(31);
        let delay = BACKOFF_INITIAL_SECS
            .saturating_mul(1i64 << exp)
            .min(BACKOFF_MAX_SECS);
        self.next_attempt = now + Duration::seconds(delay);
    }

    /// Load one record by its (ip, port) key.
    pub async fn load(pool: &PgPool, ip: &str, port: u16) -> Result<Option<PeerRecord>> {
        let row: Option<(String, i32, DateTime<Utc>, i32)> = sqlx::query_as(
            "SELECT ip, port, nextattempt, numfailures FROM peers WHERE ip = $1 AND port = $2",
        )
        .bind(ip)
        .bind(port as i32)
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to load peer record")?;

        Ok(row.map(|(ip, port, next_attempt, num_failures)| PeerRecord {
            ip,
            port: port as u16,
            next_attempt,
            num_failures: num_failures as u32,
        }))
    }

    /// Up to `max` records whose retry time has come, soonest first.
    pub async fn load_records(
        pool: &PgPool,
        max: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<PeerRecord>> {
        let rows: Vec<(String, i32, DateTime<Utc>, i32)> = sqlx::query_as(
            r#"SELECT ip, port, nextattempt, numfailures FROM peers
                WHERE nextattempt <= $1
                ORDER BY nextattempt ASC
                LIMIT $2"#,
        )
        .bind(now)
        .bind(max)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to load peer records")?;

        Ok(rows
            .into_iter()
            .map(|(ip, port, next_attempt, num_failures)| PeerRecord {
                ip,
                port: port as u16,
                next_attempt,
                num_failures: num_failures as u32,
            })
            .collect())
    }

    /// Upsert this record.
    pub async fn store(&self, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO peers (ip, port, nextattempt, numfailures)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (ip, port) DO UPDATE SET
                nextattempt = EXCLUDED.nextattempt,
                numfailures = EXCLUDED.numfailures
            "#,
        )
        .bind(&self.ip)
        .bind(self.port as i32)
        .bind(self.next_attempt)
        .bind(self.num_failures as i32)
        .execute(pool)
        .await
        .wrap_err_with(|| format!("Failed to store peer record {}:{}", self.ip, self.port))?;
        Ok(())
    }

    /// Insert only if the (ip, port) key is unknown; existing backoff state
    /// is never clobbered by gossip.
    pub async fn insert_if_new(&self, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO peers (ip, port, nextattempt, numfailures)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (ip, port) DO NOTHING
            "#,
        )
        .bind(&self.ip)
        .bind(self.port as i32)
        .bind(self.next_attempt)
        .bind(self.num_failures as i32)
        .execute(pool)
        .await
        .wrap_err_with(|| format!("Failed to insert peer record {}:{}", self.ip, self.port))?;
        Ok(())
    }
}

//! Integration tests for the peer record table
//!
//! Run with: cargo test --test peer_records_pg -- --ignored --test-threads=1
//!
//! Prerequisites:
//! - PostgreSQL reachable via DATABASE_URL (scratch database; migrations
//!   are applied and the peers table is cleared)

use chrono::{Duration, Utc};
use sqlx::postgres::PgPoolOptions;

use lumen_node::db::Database;
use lumen_node::overlay::peer_record::PeerRecord;

async fn setup() -> Database {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for pg tests");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect to test database");
    let db = Database::from_pool(pool);
    db.run_migrations().await.expect("migrations");
    sqlx::query("DELETE FROM peers")
        .execute(db.pool())
        .await
        .expect("clear peers");
    db
}

#[tokio::test]
#[ignore]
async fn test_store_and_load_round_trip() {
    let db = setup().await;
    let now = Utc::now();

    let mut record = PeerRecord::new("203.0.113.1".into(), 11625, now);
    record.store(db.pool()).await.expect("store");

    let loaded = PeerRecord::load(db.pool(), "203.0.113.1", 11625)
        .await
        .expect("load")
        .expect("record");
    assert_eq!(loaded.ip, record.ip);
    assert_eq!(loaded.port, record.port);
    assert_eq!(loaded.num_failures, 0);

    // backoff state survives the upsert
    record.back_off(now);
    record.store(db.pool()).await.expect("store");
    let loaded = PeerRecord::load(db.pool(), "203.0.113.1", 11625)
        .await
        .expect("load")
        .expect("record");
    assert_eq!(loaded.num_failures, 1);
    assert!(loaded.next_attempt > now);
}

#[tokio::test]
#[ignore]
async fn test_insert_if_new_preserves_backoff() {
    let db = setup().await;
    let now = Utc::now();

    let mut record = PeerRecord::new("203.0.113.2".into(), 11625, now);
    record.back_off(now);
    record.back_off(now);
    record.store(db.pool()).await.expect("store");

    // gossip about a known peer must not clobber its backoff
    let gossiped = PeerRecord::new("203.0.113.2".into(), 11625, now);
    gossiped.insert_if_new(db.pool()).await.expect("insert");

    let loaded = PeerRecord::load(db.pool(), "203.0.113.2", 11625)
        .await
        .expect("load")
        .expect("record");
    assert_eq!(loaded.num_failures, 2);
}

#[tokio::test]
#[ignore]
async fn test_load_records_orders_by_retry_time() {
    let db = setup().await;
    let now = Utc::now();

    let soon = PeerRecord {
        ip: "203.0.113.3".into(),
        port: 11625,
        next_attempt: now - Duration::seconds(10),
        num_failures: 0,
    };
    let sooner = PeerRecord {
        ip: "203.0.113.4".into(),
        port: 11625,
        next_attempt: now - Duration::seconds(60),
        num_failures: 0,
    };
    let not_yet = PeerRecord {
        ip: "203.0.113.5".into(),
        port: 11625,
        next_attempt: now + Duration::seconds(3600),
        num_failures: 3,
    };
    for record in [&soon, &sooner, &not_yet] {
        record.store(db.pool()).await.expect("store");
    }

    let due = PeerRecord::load_records(db.pool(), 50, now)
        .await
        .expect("load_records");
    let ips: Vec<&str> = due.iter().map(|r| r.ip.as_str()).collect();
    // soonest retry first, future retries excluded
    assert_eq!(ips, vec!["203.0.113.4", "203.0.113.3"]);

    let limited = PeerRecord::load_records(db.pool(), 1, now)
        .await
        .expect("load_records");
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].ip, "203.0.113.4");
}

#[tokio::test]
#[ignore]
async fn test_missing_record_loads_none() {
    let db = setup().await;
    assert!(PeerRecord::load(db.pool(), "203.0.113.99", 11625)
        .await
        .expect("load")
        .is_none());
}

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::{Result, StoreError};

pub const CURRENT_SCHEMA_VERSION: u32 = 3;

const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        "
        CREATE TABLE accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            total_tweets_processed INTEGER NOT NULL DEFAULT 0,
            total_images_downloaded INTEGER NOT NULL DEFAULT 0,
            last_processed_tweet_id TEXT,
            last_processed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE tweets (
            tweet_id TEXT PRIMARY KEY,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            url TEXT NOT NULL,
            tweet_timestamp TEXT,
            image_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL CHECK (status IN ('processed', 'failed')),
            error TEXT,
            processed_at TEXT NOT NULL
        );

        CREATE TABLE images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tweet_id TEXT NOT NULL REFERENCES tweets(tweet_id),
            url TEXT NOT NULL,
            filename TEXT NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('pending', 'downloaded', 'skipped', 'failed')),
            status_reason TEXT,
            file_size INTEGER,
            downloaded_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (tweet_id, url)
        );
        ",
    ),
    (
        2,
        "
        CREATE TABLE runs (
            id TEXT PRIMARY KEY,
            account TEXT NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            total_tweets INTEGER NOT NULL DEFAULT 0,
            processed_tweets INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL
                CHECK (status IN ('in_progress', 'completed', 'interrupted', 'cancelled'))
        );
        ",
    ),
    (
        3,
        "
        CREATE INDEX idx_tweets_account_processed ON tweets(account_id, processed_at DESC);
        CREATE INDEX idx_images_url_status ON images(url, status);
        CREATE INDEX idx_runs_account_status ON runs(account, status);
        ",
    ),
];

/// Brings the schema up to [`CURRENT_SCHEMA_VERSION`].
///
/// Each pending migration runs in its own transaction together with its
/// ledger row, so a failure leaves the schema at the previous version.
pub(crate) fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );
        ",
    )?;

    let current = current_version(conn)?;
    if current > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            supported: CURRENT_SCHEMA_VERSION,
            found: current,
        });
    }

    for &(version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let tx = conn.transaction()?;
        apply(&tx, version, sql)?;
        tx.commit()?;
        log::info!("Applied schema migration {version}");
    }

    Ok(())
}

fn apply(tx: &Transaction<'_>, version: u32, sql: &str) -> Result<()> {
    tx.execute_batch(sql)?;
    tx.execute(
        "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        params![version, chrono::Utc::now()],
    )?;
    Ok(())
}

pub(crate) fn current_version(conn: &Connection) -> Result<u32> {
    let version = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<u32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);
    Ok(version)
}

use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, StoreError};
use crate::migrations;
use crate::model::{
    normalize_account_name, Account, Image, ImageStatus, NewImage, NewTweet, Run, RunStatus,
    Tweet, TweetStatus,
};

/// Durable crawl progress: accounts, tweets, images and the run ledger.
///
/// Every method is a short, individually committed statement (or a small
/// transaction), so the store can be shared between workers behind an
/// `Arc` without holding anything open across a browser call.
pub struct ProgressStore {
    conn: Mutex<Connection>,
}

impl ProgressStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(mut conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schema_version(&self) -> Result<u32> {
        migrations::current_version(&self.conn())
    }

    // Accounts

    pub fn get_or_create_account(&self, name: &str) -> Result<Account> {
        let name = normalize_account_name(name);
        if name.is_empty() {
            return Err(StoreError::InvalidAccountName(name));
        }
        let conn = self.conn();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO accounts (name, created_at, updated_at) VALUES (?1, ?2, ?2)
             ON CONFLICT(name) DO NOTHING",
            params![name, now],
        )?;
        let account = conn.query_row(
            "SELECT * FROM accounts WHERE name = ?1",
            params![name],
            row_to_account,
        )?;
        Ok(account)
    }

    pub fn account(&self, name: &str) -> Result<Option<Account>> {
        let account = self
            .conn()
            .query_row(
                "SELECT * FROM accounts WHERE name = ?1",
                params![normalize_account_name(name)],
                row_to_account,
            )
            .optional()?;
        Ok(account)
    }

    /// Adds a finished run's counts to the account and moves its watermark
    /// forward when `last_tweet_id` is newer than the stored one.
    pub fn record_run_totals(
        &self,
        account_id: i64,
        tweets_processed: u64,
        images_downloaded: u64,
        last_tweet_id: Option<&str>,
    ) -> Result<Account> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT last_processed_tweet_id FROM accounts WHERE id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::AccountNotFound(account_id.to_string()))?;

        let watermark = match (current, last_tweet_id) {
            (Some(cur), Some(new)) if compare_tweet_ids(new, &cur) == Ordering::Greater => {
                Some(new.to_string())
            }
            (Some(cur), _) => Some(cur),
            (None, new) => new.map(str::to_string),
        };

        let now = Utc::now();
        tx.execute(
            "UPDATE accounts SET
                total_tweets_processed = total_tweets_processed + ?1,
                total_images_downloaded = total_images_downloaded + ?2,
                last_processed_tweet_id = ?3,
                last_processed_at = CASE WHEN ?1 > 0 THEN ?4 ELSE last_processed_at END,
                updated_at = ?4
             WHERE id = ?5",
            params![tweets_processed, images_downloaded, watermark, now, account_id],
        )?;
        let account = tx.query_row(
            "SELECT * FROM accounts WHERE id = ?1",
            params![account_id],
            row_to_account,
        )?;
        tx.commit()?;
        Ok(account)
    }

    // Tweets

    /// Inserts the tweet or, when its id is already known, overwrites the
    /// mutable fields and refreshes `processed_at`.
    pub fn upsert_tweet(&self, tweet: &NewTweet<'_>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO tweets
                (tweet_id, account_id, url, tweet_timestamp, image_count, status, error, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(tweet_id) DO UPDATE SET
                tweet_timestamp = COALESCE(excluded.tweet_timestamp, tweets.tweet_timestamp),
                image_count = excluded.image_count,
                status = excluded.status,
                error = excluded.error,
                processed_at = excluded.processed_at",
            params![
                tweet.tweet_id,
                tweet.account_id,
                tweet.url,
                tweet.tweet_timestamp,
                tweet.image_count,
                tweet.status,
                tweet.error,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn tweet(&self, tweet_id: &str) -> Result<Option<Tweet>> {
        let tweet = self
            .conn()
            .query_row(
                "SELECT * FROM tweets WHERE tweet_id = ?1",
                params![tweet_id],
                row_to_tweet,
            )
            .optional()?;
        Ok(tweet)
    }

    /// A tweet is complete once it was processed and none of its images is
    /// still pending or failed.
    pub fn is_tweet_complete(&self, tweet_id: &str) -> Result<bool> {
        let complete = self.conn().query_row(
            "SELECT EXISTS (
                SELECT 1 FROM tweets t
                WHERE t.tweet_id = ?1 AND t.status = 'processed'
                AND NOT EXISTS (
                    SELECT 1 FROM images i
                    WHERE i.tweet_id = t.tweet_id AND i.status IN ('pending', 'failed')
                )
             )",
            params![tweet_id],
            |row| row.get(0),
        )?;
        Ok(complete)
    }

    /// Up to `limit` ids of the account's most recently processed complete
    /// tweets.
    pub fn recent_tweet_ids(&self, account_id: i64, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.tweet_id FROM tweets t
             WHERE t.account_id = ?1 AND t.status = 'processed'
             AND NOT EXISTS (
                SELECT 1 FROM images i
                WHERE i.tweet_id = t.tweet_id AND i.status IN ('pending', 'failed')
             )
             ORDER BY t.processed_at DESC, t.tweet_id DESC
             LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![account_id, limit], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn tweet_count(&self, account_id: i64, status: Option<TweetStatus>) -> Result<u64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM tweets WHERE account_id = ?1 AND (?2 IS NULL OR status = ?2)",
            params![account_id, status],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // Images

    /// Inserts the image or updates the existing `(tweet_id, url)` row.
    pub fn upsert_image(&self, image: &NewImage<'_>) -> Result<()> {
        if image.status.requires_reason() && image.status_reason.is_none() {
            return Err(StoreError::MissingReason {
                url: image.url.to_string(),
                status: image.status,
            });
        }
        let now = Utc::now();
        let downloaded_at = (image.status == ImageStatus::Downloaded).then_some(now);
        self.conn().execute(
            "INSERT INTO images
                (tweet_id, url, filename, status, status_reason, file_size, downloaded_at,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(tweet_id, url) DO UPDATE SET
                filename = excluded.filename,
                status = excluded.status,
                status_reason = excluded.status_reason,
                file_size = COALESCE(excluded.file_size, images.file_size),
                downloaded_at = COALESCE(excluded.downloaded_at, images.downloaded_at),
                updated_at = excluded.updated_at",
            params![
                image.tweet_id,
                image.url,
                image.filename,
                image.status,
                image.status_reason,
                image.file_size,
                downloaded_at,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn image(&self, tweet_id: &str, url: &str) -> Result<Option<Image>> {
        let image = self
            .conn()
            .query_row(
                "SELECT * FROM images WHERE tweet_id = ?1 AND url = ?2",
                params![tweet_id, url],
                row_to_image,
            )
            .optional()?;
        Ok(image)
    }

    pub fn images_for_tweet(&self, tweet_id: &str) -> Result<Vec<Image>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM images WHERE tweet_id = ?1 ORDER BY id")?;
        let images = stmt
            .query_map(params![tweet_id], row_to_image)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(images)
    }

    /// Whether any tweet already downloaded this image url.
    pub fn is_image_downloaded(&self, url: &str) -> Result<bool> {
        let downloaded = self.conn().query_row(
            "SELECT EXISTS (SELECT 1 FROM images WHERE url = ?1 AND status = 'downloaded')",
            params![url],
            |row| row.get(0),
        )?;
        Ok(downloaded)
    }

    pub fn image_count(&self, status: Option<ImageStatus>) -> Result<u64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM images WHERE (?1 IS NULL OR status = ?1)",
            params![status],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Images of the account's tweets, optionally only those in `status`.
    pub fn account_image_count(&self, account_id: i64, status: Option<ImageStatus>) -> Result<u64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM images i JOIN tweets t ON t.tweet_id = i.tweet_id
             WHERE t.account_id = ?1 AND (?2 IS NULL OR i.status = ?2)",
            params![account_id, status],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // Run ledger

    pub fn start_run(&self, account: &str, total_tweets: u64) -> Result<Run> {
        let run = Run {
            id: uuid::Uuid::new_v4().to_string(),
            account: normalize_account_name(account),
            started_at: Utc::now(),
            completed_at: None,
            total_tweets,
            processed_tweets: 0,
            status: RunStatus::InProgress,
        };
        self.conn().execute(
            "INSERT INTO runs (id, account, started_at, total_tweets, processed_tweets, status)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![run.id, run.account, run.started_at, run.total_tweets, run.status],
        )?;
        Ok(run)
    }

    pub fn run(&self, run_id: &str) -> Result<Option<Run>> {
        let run = self
            .conn()
            .query_row("SELECT * FROM runs WHERE id = ?1", params![run_id], row_to_run)
            .optional()?;
        Ok(run)
    }

    /// The newest `in_progress` run of the account, if any.
    pub fn find_in_progress_run(&self, account: &str) -> Result<Option<Run>> {
        let run = self
            .conn()
            .query_row(
                "SELECT * FROM runs WHERE account = ?1 AND status = 'in_progress'
                 ORDER BY started_at DESC LIMIT 1",
                params![normalize_account_name(account)],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// The run a new crawl of the account should pick up: the newest
    /// `in_progress` run, else the newest run when it ended `interrupted`.
    pub fn find_resumable_run(&self, account: &str) -> Result<Option<Run>> {
        if let Some(run) = self.find_in_progress_run(account)? {
            return Ok(Some(run));
        }
        let latest = self
            .conn()
            .query_row(
                "SELECT * FROM runs WHERE account = ?1 ORDER BY started_at DESC LIMIT 1",
                params![normalize_account_name(account)],
                row_to_run,
            )
            .optional()?;
        Ok(latest.filter(|run| run.status == RunStatus::Interrupted))
    }

    /// Moves an interrupted run back to `in_progress` so it can be resumed.
    pub fn reopen_run(&self, run_id: &str) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE runs SET status = 'in_progress', completed_at = NULL
             WHERE id = ?1 AND status = 'interrupted'",
            params![run_id],
        )?;
        if changed == 0 {
            return Err(self.finished_run_error(run_id));
        }
        log::debug!("Run {run_id} reopened");
        Ok(())
    }

    pub fn set_run_total(&self, run_id: &str, total_tweets: u64) -> Result<()> {
        self.update_in_progress(
            run_id,
            "UPDATE runs SET total_tweets = ?2 WHERE id = ?1 AND status = 'in_progress'",
            total_tweets,
        )
    }

    pub fn update_run_progress(&self, run_id: &str, processed_tweets: u64) -> Result<()> {
        self.update_in_progress(
            run_id,
            "UPDATE runs SET processed_tweets = ?2 WHERE id = ?1 AND status = 'in_progress'",
            processed_tweets,
        )
    }

    fn update_in_progress(&self, run_id: &str, sql: &str, value: u64) -> Result<()> {
        let changed = self.conn().execute(sql, params![run_id, value])?;
        if changed == 0 {
            return Err(self.finished_run_error(run_id));
        }
        Ok(())
    }

    pub fn complete_run(&self, run_id: &str) -> Result<()> {
        self.finish_run(run_id, RunStatus::Completed)
    }

    pub fn interrupt_run(&self, run_id: &str) -> Result<()> {
        self.finish_run(run_id, RunStatus::Interrupted)
    }

    pub fn cancel_run(&self, run_id: &str) -> Result<()> {
        self.finish_run(run_id, RunStatus::Cancelled)
    }

    fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE runs SET status = ?2, completed_at = ?3
             WHERE id = ?1 AND status = 'in_progress'",
            params![run_id, status, Utc::now()],
        )?;
        if changed == 0 {
            return Err(self.finished_run_error(run_id));
        }
        log::debug!("Run {run_id} marked {status}");
        Ok(())
    }

    fn finished_run_error(&self, run_id: &str) -> StoreError {
        match self.run(run_id) {
            Ok(Some(run)) => StoreError::RunFinished {
                run_id: run_id.to_string(),
                status: run.status,
            },
            Ok(None) => StoreError::RunNotFound(run_id.to_string()),
            Err(e) => e,
        }
    }

    /// Deletes interrupted runs that ended before `now - older_than`.
    pub fn purge_interrupted_runs(&self, older_than: Duration) -> Result<usize> {
        self.purge_interrupted_runs_before(Utc::now() - older_than)
    }

    pub fn purge_interrupted_runs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let deleted = self.conn().execute(
            "DELETE FROM runs WHERE status = 'interrupted'
             AND COALESCE(completed_at, started_at) < ?1",
            params![cutoff],
        )?;
        if deleted > 0 {
            log::info!("Purged {deleted} stale interrupted runs");
        }
        Ok(deleted)
    }

    pub fn list_runs(&self, account: Option<&str>, limit: usize) -> Result<Vec<Run>> {
        let account = account.map(normalize_account_name);
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM runs WHERE (?1 IS NULL OR account = ?1)
             ORDER BY started_at DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![account, limit], row_to_run)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}

/// Orders tweet ids numerically when both are digit strings, which is how
/// snowflake ids sort in time.
pub fn compare_tweet_ids(a: &str, b: &str) -> Ordering {
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit());
    if numeric(a) && numeric(b) {
        let (a, b) = (a.trim_start_matches('0'), b.trim_start_matches('0'));
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    } else {
        a.cmp(b)
    }
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get("id")?,
        name: row.get("name")?,
        total_tweets_processed: row.get("total_tweets_processed")?,
        total_images_downloaded: row.get("total_images_downloaded")?,
        last_processed_tweet_id: row.get("last_processed_tweet_id")?,
        last_processed_at: row.get("last_processed_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_tweet(row: &Row<'_>) -> rusqlite::Result<Tweet> {
    Ok(Tweet {
        tweet_id: row.get("tweet_id")?,
        account_id: row.get("account_id")?,
        url: row.get("url")?,
        tweet_timestamp: row.get("tweet_timestamp")?,
        image_count: row.get("image_count")?,
        status: row.get("status")?,
        error: row.get("error")?,
        processed_at: row.get("processed_at")?,
    })
}

fn row_to_image(row: &Row<'_>) -> rusqlite::Result<Image> {
    Ok(Image {
        id: row.get("id")?,
        tweet_id: row.get("tweet_id")?,
        url: row.get("url")?,
        filename: row.get("filename")?,
        status: row.get("status")?,
        status_reason: row.get("status_reason")?,
        file_size: row.get("file_size")?,
        downloaded_at: row.get("downloaded_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get("id")?,
        account: row.get("account")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        total_tweets: row.get("total_tweets")?,
        processed_tweets: row.get("processed_tweets")?,
        status: row.get("status")?,
    })
}

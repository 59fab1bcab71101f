use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::Serialize;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} {other:?}", stringify!($name))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TweetStatus {
    Processed,
    Failed,
}

text_enum!(TweetStatus {
    Processed => "processed",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Downloaded,
    Skipped,
    Failed,
}

text_enum!(ImageStatus {
    Pending => "pending",
    Downloaded => "downloaded",
    Skipped => "skipped",
    Failed => "failed",
});

impl ImageStatus {
    /// Skipped and failed rows must say why.
    pub fn requires_reason(&self) -> bool {
        matches!(self, Self::Skipped | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Interrupted,
    Cancelled,
}

text_enum!(RunStatus {
    InProgress => "in_progress",
    Completed => "completed",
    Interrupted => "interrupted",
    Cancelled => "cancelled",
});

/// A crawled account, the owner of tweets and runs.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub total_tweets_processed: u64,
    pub total_images_downloaded: u64,
    pub last_processed_tweet_id: Option<String>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTweet<'a> {
    pub tweet_id: &'a str,
    pub account_id: i64,
    pub url: &'a str,
    pub tweet_timestamp: Option<&'a str>,
    pub image_count: u32,
    pub status: TweetStatus,
    pub error: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tweet {
    pub tweet_id: String,
    pub account_id: i64,
    pub url: String,
    pub tweet_timestamp: Option<String>,
    pub image_count: u32,
    pub status: TweetStatus,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewImage<'a> {
    pub tweet_id: &'a str,
    pub url: &'a str,
    pub filename: &'a str,
    pub status: ImageStatus,
    pub status_reason: Option<&'a str>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Image {
    pub id: i64,
    pub tweet_id: String,
    pub url: String,
    pub filename: String,
    pub status: ImageStatus,
    pub status_reason: Option<String>,
    pub file_size: Option<u64>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry of the run ledger.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: String,
    pub account: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_tweets: u64,
    pub processed_tweets: u64,
    pub status: RunStatus,
}

impl Run {
    pub fn remaining(&self) -> u64 {
        self.total_tweets.saturating_sub(self.processed_tweets)
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == RunStatus::InProgress
    }
}

/// Trims whitespace and a leading `@`, then lowercases.
pub fn normalize_account_name(name: &str) -> String {
    name.trim().trim_start_matches('@').trim().to_lowercase()
}

mod error;
mod migrations;
mod model;
mod store;

pub use error::{Result, StoreError};
pub use migrations::CURRENT_SCHEMA_VERSION;
pub use model::{
    normalize_account_name, Account, Image, ImageStatus, NewImage, NewTweet, Run, RunStatus,
    Tweet, TweetStatus,
};
pub use store::{compare_tweet_ids, ProgressStore};

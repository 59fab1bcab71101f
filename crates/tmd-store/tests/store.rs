use chrono::{Duration, Utc};
use tmd_store::{
    ImageStatus, NewImage, NewTweet, ProgressStore, RunStatus, StoreError, TweetStatus,
    CURRENT_SCHEMA_VERSION,
};

fn tweet<'a>(id: &'a str, account_id: i64, status: TweetStatus) -> NewTweet<'a> {
    NewTweet {
        tweet_id: id,
        account_id,
        url: "https://x.com/someone/status/1",
        tweet_timestamp: None,
        image_count: 1,
        status,
        error: None,
    }
}

fn image<'a>(tweet_id: &'a str, url: &'a str, status: ImageStatus) -> NewImage<'a> {
    NewImage {
        tweet_id,
        url,
        filename: "out/someone/1_1.jpg",
        status,
        status_reason: status.requires_reason().then_some("because"),
        file_size: None,
    }
}

#[test]
fn fresh_store_is_fully_migrated() {
    let store = ProgressStore::in_memory().unwrap();
    assert_eq!(CURRENT_SCHEMA_VERSION, store.schema_version().unwrap());
}

#[test]
fn accounts_are_created_once_by_normalized_name() {
    let store = ProgressStore::in_memory().unwrap();
    let first = store.get_or_create_account("@Someone").unwrap();
    let second = store.get_or_create_account("someone ").unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!("someone", second.name);
    assert_eq!(0, second.total_tweets_processed);
    assert!(store.account("SOMEONE").unwrap().is_some());
    assert!(matches!(
        store.get_or_create_account(" @ "),
        Err(StoreError::InvalidAccountName(_))
    ));
}

#[test]
fn tweet_upsert_keeps_one_row_with_latest_status() {
    let store = ProgressStore::in_memory().unwrap();
    let account = store.get_or_create_account("someone").unwrap();

    store
        .upsert_tweet(&NewTweet {
            error: Some("timeout"),
            ..tweet("1", account.id, TweetStatus::Failed)
        })
        .unwrap();
    store
        .upsert_tweet(&tweet("1", account.id, TweetStatus::Processed))
        .unwrap();

    assert_eq!(1, store.tweet_count(account.id, None).unwrap());
    let row = store.tweet("1").unwrap().unwrap();
    assert_eq!(TweetStatus::Processed, row.status);
    assert_eq!(None, row.error);
}

#[test]
fn tweet_ids_are_unique_across_accounts() {
    let store = ProgressStore::in_memory().unwrap();
    let a = store.get_or_create_account("a").unwrap();
    let b = store.get_or_create_account("b").unwrap();

    store.upsert_tweet(&tweet("7", a.id, TweetStatus::Processed)).unwrap();
    store.upsert_tweet(&tweet("7", b.id, TweetStatus::Processed)).unwrap();

    assert_eq!(1, store.tweet_count(a.id, None).unwrap());
    assert_eq!(0, store.tweet_count(b.id, None).unwrap());
}

#[test]
fn image_upsert_keeps_one_row_with_latest_status() {
    let store = ProgressStore::in_memory().unwrap();
    let account = store.get_or_create_account("someone").unwrap();
    store
        .upsert_tweet(&tweet("1", account.id, TweetStatus::Processed))
        .unwrap();

    let url = "https://pbs.example/media/a.jpg";
    store.upsert_image(&image("1", url, ImageStatus::Failed)).unwrap();
    assert!(!store.is_image_downloaded(url).unwrap());

    store
        .upsert_image(&NewImage {
            file_size: Some(1234),
            ..image("1", url, ImageStatus::Downloaded)
        })
        .unwrap();

    let images = store.images_for_tweet("1").unwrap();
    assert_eq!(1, images.len());
    assert_eq!(ImageStatus::Downloaded, images[0].status);
    assert_eq!(Some(1234), images[0].file_size);
    assert!(images[0].downloaded_at.is_some());
    assert!(store.is_image_downloaded(url).unwrap());
    assert_eq!(1, store.image_count(None).unwrap());
}

#[test]
fn image_counts_can_be_scoped_to_an_account() {
    let store = ProgressStore::in_memory().unwrap();
    let mine = store.get_or_create_account("someone").unwrap();
    let theirs = store.get_or_create_account("other").unwrap();
    store.upsert_tweet(&tweet("1", mine.id, TweetStatus::Processed)).unwrap();
    store.upsert_tweet(&tweet("2", theirs.id, TweetStatus::Processed)).unwrap();
    store
        .upsert_image(&image("1", "https://pbs.example/media/a.jpg", ImageStatus::Downloaded))
        .unwrap();
    store
        .upsert_image(&image("1", "https://pbs.example/media/b.jpg", ImageStatus::Failed))
        .unwrap();
    store
        .upsert_image(&image("2", "https://pbs.example/media/c.jpg", ImageStatus::Downloaded))
        .unwrap();

    assert_eq!(2, store.account_image_count(mine.id, None).unwrap());
    assert_eq!(
        1,
        store
            .account_image_count(mine.id, Some(ImageStatus::Downloaded))
            .unwrap()
    );
    assert_eq!(1, store.account_image_count(theirs.id, None).unwrap());
    assert_eq!(3, store.image_count(None).unwrap());
}

#[test]
fn skipped_and_failed_images_need_a_reason() {
    let store = ProgressStore::in_memory().unwrap();
    let account = store.get_or_create_account("someone").unwrap();
    store
        .upsert_tweet(&tweet("1", account.id, TweetStatus::Processed))
        .unwrap();

    let err = store
        .upsert_image(&NewImage {
            status_reason: None,
            ..image("1", "https://pbs.example/a.jpg", ImageStatus::Skipped)
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::MissingReason { .. }));

    store
        .upsert_image(&image("1", "https://pbs.example/a.jpg", ImageStatus::Pending))
        .unwrap();
}

#[test]
fn incomplete_tweets_are_not_known() {
    let store = ProgressStore::in_memory().unwrap();
    let account = store.get_or_create_account("someone").unwrap();
    for id in ["1", "2", "3"] {
        store
            .upsert_tweet(&tweet(id, account.id, TweetStatus::Processed))
            .unwrap();
    }
    store
        .upsert_tweet(&tweet("4", account.id, TweetStatus::Failed))
        .unwrap();
    store
        .upsert_image(&image("2", "https://pbs.example/2.jpg", ImageStatus::Pending))
        .unwrap();

    let mut known = store.recent_tweet_ids(account.id, 10).unwrap();
    known.sort();
    assert_eq!(vec!["1", "3"], known);
    assert!(store.is_tweet_complete("1").unwrap());
    assert!(!store.is_tweet_complete("2").unwrap());
    assert!(!store.is_tweet_complete("4").unwrap());

    assert_eq!(1, store.recent_tweet_ids(account.id, 1).unwrap().len());
}

#[test]
fn run_totals_accumulate_and_watermark_only_moves_forward() {
    let store = ProgressStore::in_memory().unwrap();
    let account = store.get_or_create_account("someone").unwrap();

    let account = store
        .record_run_totals(account.id, 3, 5, Some("1000"))
        .unwrap();
    assert_eq!(Some("1000".to_string()), account.last_processed_tweet_id);
    assert!(account.last_processed_at.is_some());

    let account = store.record_run_totals(account.id, 2, 1, Some("999")).unwrap();
    assert_eq!(5, account.total_tweets_processed);
    assert_eq!(6, account.total_images_downloaded);
    assert_eq!(Some("1000".to_string()), account.last_processed_tweet_id);

    let account = store.record_run_totals(account.id, 0, 0, Some("10000")).unwrap();
    assert_eq!(Some("10000".to_string()), account.last_processed_tweet_id);
}

#[test]
fn run_ledger_resumes_in_progress_runs() {
    let store = ProgressStore::in_memory().unwrap();
    let run = store.start_run("someone", 10).unwrap();
    store.update_run_progress(&run.id, 3).unwrap();

    let found = store.find_in_progress_run("@someone").unwrap().unwrap();
    assert_eq!(run.id, found.id);
    assert_eq!(7, found.remaining());
    assert!(store.find_in_progress_run("other").unwrap().is_none());
}

#[test]
fn interrupted_run_is_resumable_until_superseded() {
    let store = ProgressStore::in_memory().unwrap();
    let run = store.start_run("someone", 10).unwrap();
    store.update_run_progress(&run.id, 4).unwrap();
    store.interrupt_run(&run.id).unwrap();
    assert!(store.find_in_progress_run("someone").unwrap().is_none());

    let found = store.find_resumable_run("someone").unwrap().unwrap();
    assert_eq!((run.id.clone(), 6), (found.id.clone(), found.remaining()));

    store.reopen_run(&run.id).unwrap();
    let reopened = store.run(&run.id).unwrap().unwrap();
    assert_eq!(RunStatus::InProgress, reopened.status);
    assert!(reopened.completed_at.is_none());
    assert!(matches!(
        store.reopen_run(&run.id),
        Err(StoreError::RunFinished {
            status: RunStatus::InProgress,
            ..
        })
    ));

    store.complete_run(&run.id).unwrap();
    assert!(store.find_resumable_run("someone").unwrap().is_none());

    // Only the newest run counts.
    let older = store.start_run("other", 3).unwrap();
    store.interrupt_run(&older.id).unwrap();
    let newer = store.start_run("other", 3).unwrap();
    store.complete_run(&newer.id).unwrap();
    assert!(store.find_resumable_run("other").unwrap().is_none());
}

#[test]
fn run_ledger_transitions_happen_once() {
    let store = ProgressStore::in_memory().unwrap();
    let run = store.start_run("someone", 2).unwrap();

    store.complete_run(&run.id).unwrap();
    let stored = store.run(&run.id).unwrap().unwrap();
    assert_eq!(RunStatus::Completed, stored.status);
    assert!(stored.completed_at.is_some());

    assert!(matches!(
        store.interrupt_run(&run.id),
        Err(StoreError::RunFinished {
            status: RunStatus::Completed,
            ..
        })
    ));
    assert!(matches!(
        store.update_run_progress(&run.id, 2),
        Err(StoreError::RunFinished { .. })
    ));
    assert!(matches!(
        store.cancel_run("missing"),
        Err(StoreError::RunNotFound(_))
    ));
    assert!(store.find_in_progress_run("someone").unwrap().is_none());
}

#[test]
fn cancelled_runs_keep_their_history() {
    let store = ProgressStore::in_memory().unwrap();
    let old = store.start_run("someone", 4).unwrap();
    store.cancel_run(&old.id).unwrap();
    let new = store.start_run("someone", 6).unwrap();

    let runs = store.list_runs(Some("someone"), 10).unwrap();
    assert_eq!(2, runs.len());
    assert_eq!(
        Some(RunStatus::Cancelled),
        runs.iter().find(|r| r.id == old.id).map(|r| r.status)
    );
    assert_eq!(
        new.id,
        store.find_in_progress_run("someone").unwrap().unwrap().id
    );
}

#[test]
fn only_stale_interrupted_runs_are_purged() {
    let store = ProgressStore::in_memory().unwrap();
    let interrupted = store.start_run("someone", 1).unwrap();
    store.interrupt_run(&interrupted.id).unwrap();
    let completed = store.start_run("someone", 1).unwrap();
    store.complete_run(&completed.id).unwrap();

    assert_eq!(0, store.purge_interrupted_runs(Duration::days(7)).unwrap());
    assert_eq!(
        1,
        store
            .purge_interrupted_runs_before(Utc::now() + Duration::days(1))
            .unwrap()
    );
    assert!(store.run(&interrupted.id).unwrap().is_none());
    assert!(store.run(&completed.id).unwrap().is_some());
}

#[test]
fn deleting_the_database_file_resets_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.db");

    {
        let store = ProgressStore::open(&path).unwrap();
        let account = store.get_or_create_account("someone").unwrap();
        store
            .upsert_tweet(&tweet("1", account.id, TweetStatus::Processed))
            .unwrap();
        let run = store.start_run("someone", 1).unwrap();
        store.complete_run(&run.id).unwrap();
    }

    let reopened = ProgressStore::open(&path).unwrap();
    assert!(reopened.tweet("1").unwrap().is_some());
    drop(reopened);

    for entry in std::fs::read_dir(dir.path()).unwrap() {
        std::fs::remove_file(entry.unwrap().path()).unwrap();
    }

    let fresh = ProgressStore::open(&path).unwrap();
    assert!(fresh.account("someone").unwrap().is_none());
    assert!(fresh.tweet("1").unwrap().is_none());
    assert!(fresh.list_runs(None, 10).unwrap().is_empty());
}

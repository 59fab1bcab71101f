use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tmd_store::{
    compare_tweet_ids, normalize_account_name, Account, ImageStatus, NewImage, NewTweet,
    ProgressStore, Run, RunStatus, StoreError, TweetStatus,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::{CrawlerConfig, ItemOrder, ResumePolicy};
use crate::error::{CrawlError, ProcessError};
use crate::extract::{image_extension, parse_item_id, Extractor};
use crate::pool::{PageFactory, ResourcePool};
use crate::processor::{ItemResult, ProcessObserver, ProcessorConfig, Progress, TaskProcessor};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a [`TimelineScroller`] is asked to collect.
#[derive(Debug, Clone, Copy)]
pub struct ScrollRequest<'a> {
    pub account: &'a str,
    pub start_url: &'a str,
    /// Ids of recently completed items.
    pub known_ids: &'a HashSet<String>,
    pub early_stop_after: Option<usize>,
}

impl ScrollRequest<'_> {
    pub fn is_known(&self, item_url: &str) -> bool {
        parse_item_id(item_url).map_or(false, |id| self.known_ids.contains(&id))
    }

    pub fn early_stop(&self) -> EarlyStop {
        EarlyStop::new(self.early_stop_after)
    }
}

/// Site specific scrolling of an account timeline.
#[async_trait]
pub trait TimelineScroller<P: ?Sized + Sync>: Send + Sync {
    /// Returns candidate item urls in timeline order. Scrollers are free to
    /// stop early on known items, see [`EarlyStop`].
    async fn collect(&self, page: &P, request: &ScrollRequest<'_>) -> anyhow::Result<Vec<String>>;
}

/// Fetches one image once its url is known.
#[async_trait]
pub trait ArtifactDownloader: Send + Sync {
    /// Writes `url` to `dest` and returns the number of bytes written.
    async fn download(&self, url: &str, dest: &Path) -> anyhow::Result<u64>;
}

/// "Stop after N consecutive known items" scrolling policy.
///
/// Timelines that interleave old and new items (pinned or reposted items)
/// can make it stop too soon, a larger limit or `None` trades speed for
/// completeness.
#[derive(Debug, Clone)]
pub struct EarlyStop {
    limit: Option<usize>,
    consecutive: usize,
}

impl EarlyStop {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit: limit.filter(|&l| l > 0),
            consecutive: 0,
        }
    }

    /// Records the next item and tells whether scrolling should stop.
    pub fn observe(&mut self, known: bool) -> bool {
        if known {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        self.limit.map_or(false, |limit| self.consecutive >= limit)
    }

    pub fn consecutive(&self) -> usize {
        self.consecutive
    }
}

/// How a crawl ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlReport {
    pub run_id: String,
    pub account: String,
    pub status: RunStatus,
    /// Whether an interrupted run was picked up again.
    pub resumed: bool,
    /// Items handed to the processor.
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    /// Items found already complete.
    pub skipped: usize,
    pub images_downloaded: usize,
    pub images_skipped: usize,
    pub images_failed: usize,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Tally {
    total: usize,
    skipped: usize,
    processed: usize,
    failed: usize,
    images_downloaded: usize,
    images_skipped: usize,
    images_failed: usize,
    watermark: Option<String>,
}

struct RunContext<'a> {
    account: &'a Account,
    run: &'a Run,
    resumed: bool,
    known: &'a HashSet<String>,
    tally: &'a Mutex<Tally>,
}

#[derive(Debug)]
struct DownloadJob {
    tweet_id: String,
    url: String,
    filename: String,
    dest: PathBuf,
}

/// Persists every completed item and queues its images for download.
struct RunRecorder<'a> {
    store: &'a ProgressStore,
    run_id: &'a str,
    account_id: i64,
    account_dir: &'a Path,
    base_processed: u64,
    tally: &'a Mutex<Tally>,
    downloads: mpsc::UnboundedSender<DownloadJob>,
}

impl RunRecorder<'_> {
    fn record(&self, result: &ItemResult) -> Result<(), StoreError> {
        {
            let mut tally = lock(self.tally);
            if result.success {
                tally.processed += 1;
            } else {
                tally.failed += 1;
            }
        }

        let data = result.data.as_ref().filter(|_| result.success);
        let tweet_id = data
            .map(|d| d.item_id.clone())
            .filter(|id| !id.is_empty())
            .or_else(|| parse_item_id(&result.url));
        let Some(tweet_id) = tweet_id else {
            log::warn!("No item id for {}, not recorded", result.url);
            return Ok(());
        };

        let Some(data) = data else {
            self.store.upsert_tweet(&NewTweet {
                tweet_id: &tweet_id,
                account_id: self.account_id,
                url: &result.url,
                tweet_timestamp: None,
                image_count: 0,
                status: TweetStatus::Failed,
                error: result.error.as_deref(),
            })?;
            return Ok(());
        };

        self.store.upsert_tweet(&NewTweet {
            tweet_id: &tweet_id,
            account_id: self.account_id,
            url: &result.url,
            tweet_timestamp: data.item_timestamp.as_deref(),
            image_count: data.image_urls.len() as u32,
            status: TweetStatus::Processed,
            error: None,
        })?;
        for (n, image_url) in data.image_urls.iter().enumerate() {
            self.record_image(&tweet_id, n + 1, image_url)?;
        }

        let mut tally = lock(self.tally);
        let newer = tally
            .watermark
            .as_deref()
            .map_or(true, |w| compare_tweet_ids(&tweet_id, w) == CmpOrdering::Greater);
        if newer {
            tally.watermark = Some(tweet_id);
        }
        Ok(())
    }

    fn record_image(&self, tweet_id: &str, n: usize, url: &str) -> Result<(), StoreError> {
        let filename = format!("{tweet_id}_{n}.{}", image_extension(url));

        // A downloaded row is final.
        if let Some(existing) = self.store.image(tweet_id, url)? {
            if existing.status == ImageStatus::Downloaded {
                lock(self.tally).images_skipped += 1;
                return Ok(());
            }
        }

        if self.store.is_image_downloaded(url)? {
            self.store.upsert_image(&NewImage {
                tweet_id,
                url,
                filename: &filename,
                status: ImageStatus::Skipped,
                status_reason: Some("already downloaded"),
                file_size: None,
            })?;
            lock(self.tally).images_skipped += 1;
            return Ok(());
        }

        self.store.upsert_image(&NewImage {
            tweet_id,
            url,
            filename: &filename,
            status: ImageStatus::Pending,
            status_reason: None,
            file_size: None,
        })?;
        let job = DownloadJob {
            tweet_id: tweet_id.to_string(),
            url: url.to_string(),
            dest: self.account_dir.join(&filename),
            filename,
        };
        if self.downloads.send(job).is_err() {
            log::warn!("Download queue closed, {url} left pending");
        }
        Ok(())
    }
}

impl ProcessObserver for RunRecorder<'_> {
    fn on_item_complete(&self, result: &ItemResult) {
        if let Err(e) = self.record(result) {
            log::error!("Couldn't record {}: {e}", result.url);
        }
    }

    fn on_progress(&self, progress: &Progress) {
        log::info!(
            "Progress {}/{} ({} failed)",
            progress.completed,
            progress.total,
            progress.failed
        );
        let processed = self.base_processed + progress.completed as u64;
        match self.store.update_run_progress(self.run_id, processed) {
            Ok(()) => {}
            Err(StoreError::RunFinished { status, .. }) => {
                log::debug!("Run {} already {status}, progress not saved", self.run_id)
            }
            Err(e) => log::error!("Couldn't save progress of run {}: {e}", self.run_id),
        }
    }
}

async fn fetch<D: ArtifactDownloader>(downloader: &D, job: &DownloadJob) -> anyhow::Result<u64> {
    if let Some(dir) = job.dest.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    downloader.download(&job.url, &job.dest).await
}

/// Runs crawls of account timelines and keeps their progress in a
/// [`ProgressStore`] so that an interrupted crawl can pick up where it
/// stopped.
pub struct Crawler<F: PageFactory> {
    config: CrawlerConfig,
    store: Arc<ProgressStore>,
    processor: TaskProcessor<F>,
    stopping: AtomicBool,
}

impl<F: PageFactory> Crawler<F> {
    pub fn new(
        config: CrawlerConfig,
        store: Arc<ProgressStore>,
        pool: ResourcePool<F>,
    ) -> Result<Self, CrawlError> {
        config.validate()?;
        let processor = TaskProcessor::new(pool, ProcessorConfig::from(&config));
        Ok(Self {
            config,
            store,
            processor,
            stopping: AtomicBool::new(false),
        })
    }

    /// Opens a pool of `poolSize` pages with `factory` and builds a crawler
    /// on top of it.
    pub async fn launch(
        config: CrawlerConfig,
        store: Arc<ProgressStore>,
        factory: F,
    ) -> Result<Self, CrawlError> {
        config.validate()?;
        let pool = ResourcePool::initialize(factory, config.pool_size).await?;
        Self::new(config, store, pool)
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    pub fn processor(&self) -> &TaskProcessor<F> {
        &self.processor
    }

    pub fn pool(&self) -> &ResourcePool<F> {
        self.processor.pool()
    }

    /// Cooperative stop: no new item is started and the run ends
    /// interrupted. A stop requested between crawls applies to the next one.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.processor.stop();
    }

    pub async fn shutdown(&self) {
        self.pool().cleanup().await;
    }

    /// Crawls one account end to end.
    ///
    /// Run level failures (expired session, dead pool, interruption) still
    /// produce a report with an interrupted status. Errors are returned for
    /// store failures and failed scrolls, after marking the run interrupted.
    pub async fn crawl<S, E, D>(
        &self,
        account: &str,
        scroller: &S,
        extractor: &E,
        downloader: &D,
    ) -> Result<CrawlReport, CrawlError>
    where
        S: TimelineScroller<F::Page>,
        E: Extractor<F::Page>,
        D: ArtifactDownloader,
    {
        let res = self
            .crawl_account(account, scroller, extractor, downloader)
            .await;
        self.stopping.store(false, Ordering::SeqCst);
        self.processor.clear_stop();
        res
    }

    async fn crawl_account<S, E, D>(
        &self,
        account: &str,
        scroller: &S,
        extractor: &E,
        downloader: &D,
    ) -> Result<CrawlReport, CrawlError>
    where
        S: TimelineScroller<F::Page>,
        E: Extractor<F::Page>,
        D: ArtifactDownloader,
    {
        let name = normalize_account_name(account);

        let retention = chrono::Duration::days(i64::from(self.config.run_retention_days));
        self.store.purge_interrupted_runs(retention)?;

        let account = self.store.get_or_create_account(&name)?;
        let known: HashSet<String> = self
            .store
            .recent_tweet_ids(account.id, self.config.known_ids_limit)?
            .into_iter()
            .collect();
        let (run, resumed) = self.open_run(&name)?;
        log::info!(
            "{} run {} for @{name}, {} known items",
            if resumed { "Resuming" } else { "Starting" },
            run.id,
            known.len()
        );

        let tally = Mutex::new(Tally::default());
        let ctx = RunContext {
            account: &account,
            run: &run,
            resumed,
            known: &known,
            tally: &tally,
        };
        let outcome = self
            .supervise(self.execute(&ctx, scroller, extractor, downloader), &run.id)
            .await;

        let interrupted = self.stopping.load(Ordering::SeqCst);
        let (status, error) = match outcome {
            Ok(()) if interrupted => (RunStatus::Interrupted, Some("interrupted".to_string())),
            Ok(()) => (RunStatus::Completed, None),
            Err(CrawlError::Process(
                e @ (ProcessError::Fatal { .. } | ProcessError::PoolExhausted { .. }),
            )) => {
                log::error!("Run {} aborted: {e}", run.id);
                (RunStatus::Interrupted, Some(e.to_string()))
            }
            Err(e) => {
                log::error!("Run {} failed: {e}", run.id);
                self.mark(&run.id, RunStatus::Interrupted);
                return Err(e);
            }
        };

        let tally = tally.into_inner().unwrap_or_else(PoisonError::into_inner);
        self.store.record_run_totals(
            account.id,
            tally.processed as u64,
            tally.images_downloaded as u64,
            tally.watermark.as_deref(),
        )?;
        self.mark(&run.id, status);

        let report = CrawlReport {
            run_id: run.id,
            account: name,
            status,
            resumed,
            total: tally.total,
            processed: tally.processed,
            failed: tally.failed,
            skipped: tally.skipped,
            images_downloaded: tally.images_downloaded,
            images_skipped: tally.images_skipped,
            images_failed: tally.images_failed,
            error,
        };
        log::info!(
            "Run {} {}: {} processed, {} failed, {} skipped, {} images downloaded",
            report.run_id,
            report.status,
            report.processed,
            report.failed,
            report.skipped,
            report.images_downloaded
        );
        Ok(report)
    }

    /// Resumes the account's unfinished run (in progress after a hard
    /// kill, or interrupted), or starts a new one. With the restart policy
    /// an in-progress run is cancelled and an interrupted one is left as
    /// is.
    fn open_run(&self, account: &str) -> Result<(Run, bool), CrawlError> {
        match self.store.find_resumable_run(account)? {
            Some(run) if self.config.on_existing_run == ResumePolicy::Resume => {
                log::info!(
                    "Found {} run {} at {}/{}, {} remaining",
                    run.status,
                    run.id,
                    run.processed_tweets,
                    run.total_tweets,
                    run.remaining()
                );
                if run.status == RunStatus::Interrupted {
                    self.store.reopen_run(&run.id)?;
                }
                let run = Run {
                    status: RunStatus::InProgress,
                    completed_at: None,
                    ..run
                };
                Ok((run, true))
            }
            existing => {
                if let Some(old) = existing.filter(Run::is_in_progress) {
                    log::info!("Cancelling previous run {}", old.id);
                    self.store.cancel_run(&old.id)?;
                }
                Ok((self.store.start_run(account, 0)?, false))
            }
        }
    }

    /// Waits for `work`, or on Ctrl-C stops the processor, marks the run
    /// interrupted and gives in-flight work a bounded time to drain before
    /// closing the pool.
    async fn supervise<Fut>(&self, work: Fut, run_id: &str) -> Result<(), CrawlError>
    where
        Fut: Future<Output = Result<(), CrawlError>>,
    {
        tokio::pin!(work);
        if !self.config.handle_sigint {
            return work.await;
        }
        tokio::select! {
            res = &mut work => res,
            Ok(()) = tokio::signal::ctrl_c() => {
                log::warn!(
                    "Interrupted, waiting up to {:?} for in-flight work",
                    self.config.drain_timeout()
                );
                self.stop();
                self.mark(run_id, RunStatus::Interrupted);
                let res = match tokio::time::timeout(self.config.drain_timeout(), &mut work).await {
                    Ok(res) => res,
                    Err(_) => {
                        log::warn!("In-flight work didn't finish in time");
                        Ok(())
                    }
                };
                self.shutdown().await;
                res
            }
        }
    }

    async fn execute<S, E, D>(
        &self,
        ctx: &RunContext<'_>,
        scroller: &S,
        extractor: &E,
        downloader: &D,
    ) -> Result<(), CrawlError>
    where
        S: TimelineScroller<F::Page>,
        E: Extractor<F::Page>,
        D: ArtifactDownloader,
    {
        if self.stopping.load(Ordering::SeqCst) {
            log::info!("Stop requested, not scrolling @{}", ctx.account.name);
            return Ok(());
        }
        let candidates = self.scroll(ctx, scroller).await?;
        let items = self.plan(ctx, candidates)?;
        if self.stopping.load(Ordering::SeqCst) {
            return Ok(());
        }
        if items.is_empty() {
            log::info!("Nothing new for @{}", ctx.account.name);
            return Ok(());
        }

        let account_dir = self.config.output_dir.join(&ctx.account.name);
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = RunRecorder {
            store: &self.store,
            run_id: &ctx.run.id,
            account_id: ctx.account.id,
            account_dir: &account_dir,
            base_processed: if ctx.resumed {
                ctx.run.processed_tweets
            } else {
                0
            },
            tally: ctx.tally,
            downloads: tx,
        };

        let processing = async move {
            let res = self.processor.process_all(items, extractor, &recorder).await;
            // Closes the download queue.
            drop(recorder);
            res
        };
        let downloads = UnboundedReceiverStream::new(rx)
            .map(|job| self.download(job, downloader, ctx.tally))
            .buffer_unordered(self.config.download_concurrency)
            .collect::<Vec<_>>();

        let (res, _) = futures::join!(processing, downloads);
        res?;
        Ok(())
    }

    async fn scroll<S>(&self, ctx: &RunContext<'_>, scroller: &S) -> Result<Vec<String>, CrawlError>
    where
        S: TimelineScroller<F::Page>,
    {
        let page = self.pool().acquire().await?;
        let start_url = self.config.timeline_url(&ctx.account.name);
        let request = ScrollRequest {
            account: &ctx.account.name,
            start_url: &start_url,
            known_ids: ctx.known,
            early_stop_after: self.config.early_stop_after,
        };
        log::info!("Scrolling {start_url}");
        let items = scroller
            .collect(&page, &request)
            .await
            .map_err(CrawlError::Scroll)?;
        drop(page);
        log::info!("Collected {} candidate items", items.len());
        Ok(items)
    }

    /// Dedups candidates, drops complete items, orders the rest and sizes
    /// the run accordingly.
    fn plan(&self, ctx: &RunContext<'_>, candidates: Vec<String>) -> Result<Vec<String>, CrawlError> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        let mut skipped = 0;
        for url in candidates {
            let url = url.trim();
            if url.is_empty() {
                continue;
            }
            let id = parse_item_id(url);
            if !seen.insert(id.clone().unwrap_or_else(|| url.to_string())) {
                continue;
            }
            let complete = match &id {
                Some(id) => ctx.known.contains(id) || self.store.is_tweet_complete(id)?,
                None => false,
            };
            if complete {
                skipped += 1;
            } else {
                items.push(url.to_string());
            }
        }
        if self.config.order == ItemOrder::Reverse {
            items.reverse();
        }

        let total = if ctx.resumed {
            let run = ctx.run;
            run.total_tweets.max(run.processed_tweets + items.len() as u64)
        } else {
            items.len() as u64
        };
        self.store.set_run_total(&ctx.run.id, total)?;
        log::info!("{} items to process, {skipped} already done", items.len());

        let mut tally = lock(ctx.tally);
        tally.total = items.len();
        tally.skipped = skipped;
        Ok(items)
    }

    async fn download<D: ArtifactDownloader>(
        &self,
        job: DownloadJob,
        downloader: &D,
        tally: &Mutex<Tally>,
    ) {
        let (status, reason, size) = match fetch(downloader, &job).await {
            Ok(size) => {
                log::debug!("Downloaded {} ({size} bytes)", job.url);
                (ImageStatus::Downloaded, None, Some(size))
            }
            Err(e) => {
                log::warn!("Couldn't download {}: {e:#}", job.url);
                (ImageStatus::Failed, Some(format!("{e:#}")), None)
            }
        };
        let image = NewImage {
            tweet_id: &job.tweet_id,
            url: &job.url,
            filename: &job.filename,
            status,
            status_reason: reason.as_deref(),
            file_size: size,
        };
        if let Err(e) = self.store.upsert_image(&image) {
            log::error!("Couldn't record image {}: {e}", job.url);
        }

        let mut tally = lock(tally);
        if status == ImageStatus::Downloaded {
            tally.images_downloaded += 1;
        } else {
            tally.images_failed += 1;
        }
    }

    /// Moves the run out of `in_progress`, once.
    fn mark(&self, run_id: &str, status: RunStatus) {
        let res = match status {
            RunStatus::Completed => self.store.complete_run(run_id),
            RunStatus::Interrupted => self.store.interrupt_run(run_id),
            RunStatus::Cancelled => self.store.cancel_run(run_id),
            RunStatus::InProgress => return,
        };
        match res {
            Ok(()) | Err(StoreError::RunFinished { .. }) => {}
            Err(e) => log::error!("Couldn't mark run {run_id} {status}: {e}"),
        }
    }
}

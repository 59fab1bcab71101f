use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future;
use tokio::time::sleep;

use crate::config::{CrawlerConfig, StaggerScope};
use crate::error::{ErrorKind, ExtractError, PoolError, ProcessError};
use crate::extract::{Extraction, Extractor};
use crate::limiter::{retry_delay, Backoff, Stagger};
use crate::pool::{PageFactory, PooledPage, ResourcePool};
use crate::sync::Guarded;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub max_workers: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub worker_start_delay: Duration,
    pub min_action_interval: Duration,
    pub stagger: StaggerScope,
    pub rate_limit_backoff: Duration,
}

impl From<&CrawlerConfig> for ProcessorConfig {
    fn from(conf: &CrawlerConfig) -> Self {
        Self {
            max_workers: conf.max_workers,
            max_retries: conf.max_retries,
            retry_base_delay: Duration::from_millis(conf.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(conf.retry_max_delay_ms),
            worker_start_delay: Duration::from_millis(conf.worker_start_delay_ms),
            min_action_interval: Duration::from_millis(conf.min_action_interval_ms),
            stagger: conf.stagger,
            rate_limit_backoff: conf.rate_limit_backoff(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from(&CrawlerConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Processing,
    Completed,
    Stopped,
}

/// Outcome of one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    pub url: String,
    pub success: bool,
    /// Extraction calls made for the item, rate limited ones included.
    pub attempts: u32,
    pub data: Option<Extraction>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub results: Vec<ItemResult>,
}

impl ProcessSummary {
    pub fn completed(&self) -> usize {
        self.processed + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Callbacks fired by workers as items complete.
///
/// They run on the worker, before it pulls its next item, so they should
/// stay short.
pub trait ProcessObserver: Send + Sync {
    fn on_item_complete(&self, _result: &ItemResult) {}

    fn on_progress(&self, _progress: &Progress) {}

    fn on_backoff(&self, _url: &str, _duration: Duration) {}
}

impl ProcessObserver for () {}

#[derive(Debug)]
struct QueueEntry {
    url: String,
    /// Attempts counted against the retry budget.
    attempts: u32,
    calls: u32,
}

#[derive(Debug, Default)]
struct WorkQueue {
    entries: Vec<QueueEntry>,
    cursor: usize,
}

impl WorkQueue {
    fn next(&mut self) -> Option<QueueEntry> {
        let entry = self.entries.get_mut(self.cursor)?;
        self.cursor += 1;
        Some(QueueEntry {
            url: std::mem::take(&mut entry.url),
            attempts: entry.attempts,
            calls: entry.calls,
        })
    }

    fn requeue(&mut self, entry: QueueEntry) {
        self.entries.push(entry);
    }
}

#[derive(Debug, Default)]
struct Tally {
    processed: usize,
    failed: usize,
    results: Vec<ItemResult>,
}

/// State shared by the workers of one `process_all` call.
struct Batch<'a, E, O> {
    total: usize,
    queue: Guarded<WorkQueue>,
    tally: Mutex<Tally>,
    fatal: Mutex<Option<ExtractError>>,
    exhausted: AtomicBool,
    extractor: &'a E,
    observer: &'a O,
}

/// Clears the stop flag once `process_all` ends, and resets the state when
/// it is dropped before finishing.
struct Running<'a> {
    state: &'a Mutex<ProcessorState>,
    stop: &'a AtomicBool,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.state);
        if *state == ProcessorState::Processing {
            *state = ProcessorState::Stopped;
        }
        self.stop.store(false, Ordering::SeqCst);
    }
}

enum Attempt {
    Done(ItemResult),
    Requeue(QueueEntry),
    Abandon,
}

/// Drains a list of item urls with a bounded number of workers sharing a
/// [`ResourcePool`].
pub struct TaskProcessor<F: PageFactory> {
    pool: ResourcePool<F>,
    config: ProcessorConfig,
    backoff: Backoff,
    shared_stagger: Stagger,
    state: Mutex<ProcessorState>,
    stop: AtomicBool,
}

impl<F: PageFactory> TaskProcessor<F> {
    pub fn new(pool: ResourcePool<F>, config: ProcessorConfig) -> Self {
        Self {
            backoff: Backoff::new(config.rate_limit_backoff),
            shared_stagger: Stagger::new(config.min_action_interval),
            pool,
            config,
            state: Mutex::new(ProcessorState::Idle),
            stop: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ProcessorState {
        *lock(&self.state)
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn pool(&self) -> &ResourcePool<F> {
        &self.pool
    }

    /// Asks workers to exit before pulling their next item. Items already
    /// in flight finish normally. A stop requested while idle applies to
    /// the next `process_all`.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            log::info!("Stop requested, workers will exit after their current item");
        }
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Drops a stop request that no `process_all` consumed.
    pub(crate) fn clear_stop(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    /// Processes every item and resolves once all workers exited.
    ///
    /// Per item failures end up in the summary results. The call only
    /// fails for run level problems: an expired session, or a pool left
    /// without any live page.
    pub async fn process_all<E, O>(
        &self,
        items: Vec<String>,
        extractor: &E,
        observer: &O,
    ) -> Result<ProcessSummary, ProcessError>
    where
        E: Extractor<F::Page>,
        O: ProcessObserver,
    {
        {
            let mut state = lock(&self.state);
            if *state == ProcessorState::Processing {
                return Err(ProcessError::AlreadyProcessing);
            }
            *state = ProcessorState::Processing;
        }
        let running = Running {
            state: &self.state,
            stop: &self.stop,
        };

        let total = items.len();
        let workers = self.config.max_workers.min(total);
        log::info!("Processing {total} items with {workers} workers");

        let batch = Batch {
            total,
            queue: Guarded::new(WorkQueue {
                entries: items
                    .into_iter()
                    .map(|url| QueueEntry {
                        url,
                        attempts: 0,
                        calls: 0,
                    })
                    .collect(),
                cursor: 0,
            }),
            tally: Mutex::new(Tally::default()),
            fatal: Mutex::new(None),
            exhausted: AtomicBool::new(false),
            extractor,
            observer,
        };

        future::join_all((0..workers).map(|id| self.worker(id, &batch))).await;

        let stopped = self.is_stopped();
        *lock(running.state) = if stopped {
            ProcessorState::Stopped
        } else {
            ProcessorState::Completed
        };

        let Tally {
            processed,
            failed,
            results,
        } = batch
            .tally
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let summary = ProcessSummary {
            total,
            processed,
            failed,
            results,
        };
        log::info!(
            "Processed {}/{total} items, {failed} failed",
            summary.completed()
        );

        let fatal = batch
            .fatal
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(e) = fatal {
            return Err(ProcessError::Fatal {
                kind: e.kind,
                message: e.message,
                summary,
            });
        }
        if batch.exhausted.load(Ordering::SeqCst) {
            return Err(ProcessError::PoolExhausted { summary });
        }
        Ok(summary)
    }

    async fn worker<E, O>(&self, id: usize, batch: &Batch<'_, E, O>)
    where
        E: Extractor<F::Page>,
        O: ProcessObserver,
    {
        if id > 0 {
            sleep(self.config.worker_start_delay * id as u32).await;
        }
        let local_stagger = Stagger::new(self.config.min_action_interval);
        log::debug!("Worker {id} started");

        loop {
            if self.is_stopped() {
                break;
            }
            let next = {
                let mut queue = batch.queue.lock().await;
                queue.next()
            };
            let Some(entry) = next else {
                break;
            };

            self.backoff.wait().await;
            match self.config.stagger {
                StaggerScope::PerWorker => local_stagger.wait().await,
                StaggerScope::Shared => self.shared_stagger.wait().await,
            }

            let page = match self.pool.acquire().await {
                Ok(page) => page,
                Err(PoolError::ShuttingDown) => {
                    log::info!("Worker {id} exiting, pool is shutting down");
                    break;
                }
                Err(e) => {
                    log::error!("Worker {id} couldn't get a page for {}: {e}", entry.url);
                    batch.exhausted.store(true, Ordering::SeqCst);
                    self.stop();
                    break;
                }
            };

            match self.attempt(id, page, entry, batch).await {
                Attempt::Done(result) => self.complete(batch, result),
                Attempt::Requeue(entry) => {
                    let mut queue = batch.queue.lock().await;
                    queue.requeue(entry);
                }
                Attempt::Abandon => {}
            }
        }
        log::debug!("Worker {id} done");
    }

    /// Runs extractions for one item on one page until the item succeeds,
    /// fails for good, or needs another page.
    async fn attempt<E, O>(
        &self,
        id: usize,
        mut page: PooledPage<F::Page>,
        mut entry: QueueEntry,
        batch: &Batch<'_, E, O>,
    ) -> Attempt
    where
        E: Extractor<F::Page>,
        O: ProcessObserver,
    {
        loop {
            // Another worker may have hit a rate limit while this one was
            // staggering or waiting for a page.
            self.backoff.wait().await;
            entry.calls += 1;
            let err = match batch.extractor.extract(&page, &entry.url).await {
                Ok(data) => {
                    log::debug!("Worker {id} extracted {}", entry.url);
                    return Attempt::Done(ItemResult {
                        url: entry.url,
                        success: true,
                        attempts: entry.calls,
                        data: Some(data),
                        error: None,
                        error_kind: None,
                    });
                }
                Err(e) => e,
            };

            match err.kind {
                ErrorKind::RateLimited => {
                    self.backoff.trigger();
                    log::warn!(
                        "Rate limited on {}, backing off for {:?}",
                        entry.url,
                        self.backoff.duration()
                    );
                    batch
                        .observer
                        .on_backoff(&entry.url, self.backoff.duration());
                    self.backoff.wait().await;
                    if self.is_stopped() {
                        return Attempt::Abandon;
                    }
                }
                ErrorKind::SessionExpired => {
                    log::error!("Session expired on {}: {}", entry.url, err.message);
                    lock(&batch.fatal).get_or_insert(err);
                    self.stop();
                    return Attempt::Abandon;
                }
                ErrorKind::NotFound => {
                    log::warn!("{} not found: {}", entry.url, err.message);
                    return Attempt::Done(failed(entry, err));
                }
                ErrorKind::Crashed => {
                    entry.attempts += 1;
                    page.mark_crashed();
                    drop(page);
                    if entry.attempts >= self.config.max_retries {
                        log::warn!("Giving up on {} after page crashes", entry.url);
                        return Attempt::Done(failed(entry, err));
                    }
                    log::warn!(
                        "Page crashed on {} (attempt {}), requeueing",
                        entry.url,
                        entry.attempts
                    );
                    sleep(self.delay(entry.attempts)).await;
                    return Attempt::Requeue(entry);
                }
                ErrorKind::Transient => {
                    entry.attempts += 1;
                    if entry.attempts >= self.config.max_retries || self.is_stopped() {
                        log::warn!(
                            "Giving up on {} after {} attempts: {}",
                            entry.url,
                            entry.attempts,
                            err.message
                        );
                        return Attempt::Done(failed(entry, err));
                    }
                    let delay = self.delay(entry.attempts);
                    log::warn!(
                        "Retrying {} in {delay:?} (attempt {}): {}",
                        entry.url,
                        entry.attempts,
                        err.message
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        retry_delay(
            self.config.retry_base_delay,
            self.config.retry_max_delay,
            attempt,
        )
    }

    fn complete<E, O>(&self, batch: &Batch<'_, E, O>, result: ItemResult)
    where
        O: ProcessObserver,
    {
        let progress = {
            let mut tally = lock(&batch.tally);
            if result.success {
                tally.processed += 1;
            } else {
                tally.failed += 1;
            }
            Progress {
                completed: tally.processed + tally.failed,
                total: batch.total,
                processed: tally.processed,
                failed: tally.failed,
            }
        };
        batch.observer.on_item_complete(&result);
        batch.observer.on_progress(&progress);
        lock(&batch.tally).results.push(result);
    }
}

fn failed(entry: QueueEntry, err: ExtractError) -> ItemResult {
    ItemResult {
        url: entry.url,
        success: false,
        attempts: entry.calls,
        data: None,
        error: Some(err.message),
        error_kind: Some(err.kind),
    }
}

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tmd_crawler::{
    parse_item_id, ArtifactDownloader, ExtractError, Extraction, Extractor,
    ItemResult, PageFactory, PageMonitor, ProcessObserver, ProcessorConfig, Progress,
    ScrollRequest, StaggerScope, TimelineScroller,
};
use tokio::time::Instant;

/// Test side handle on a page created by [`MockFactory`].
#[derive(Debug)]
pub struct PageHandle {
    pub id: usize,
    alive: AtomicBool,
    closed: AtomicBool,
    monitor: PageMonitor,
}

impl PageHandle {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn slot(&self) -> usize {
        self.monitor.index()
    }

    /// Dies and tells the pool about it, like a browser crash event.
    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.monitor.crashed();
    }

    /// Closed from the browser side, e.g. the user closed the tab.
    pub fn close_externally(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.monitor.closed();
    }

    /// Dies without any notification.
    pub fn die_silently(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockPage {
    pub handle: Arc<PageHandle>,
}

impl MockPage {
    pub fn id(&self) -> usize {
        self.handle.id
    }
}

#[derive(Debug, Default)]
pub struct MockFactory {
    created: AtomicUsize,
    fail_next: AtomicUsize,
    fail_always: AtomicBool,
    pages: Mutex<Vec<Arc<PageHandle>>>,
}

impl MockFactory {
    /// The first `n` page creations fail.
    pub fn failing_first(n: usize) -> Self {
        let factory = Self::default();
        factory.fail_next.store(n, Ordering::SeqCst);
        factory
    }

    pub fn fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Creation attempts, failed ones included.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn pages(&self) -> Vec<Arc<PageHandle>> {
        self.pages.lock().unwrap().clone()
    }

    pub fn page(&self, id: usize) -> Arc<PageHandle> {
        self.pages()
            .into_iter()
            .find(|p| p.id == id)
            .unwrap()
    }

    pub fn closed(&self) -> usize {
        self.pages().iter().filter(|p| p.is_closed()).count()
    }
}

#[async_trait]
impl PageFactory for MockFactory {
    type Page = MockPage;

    async fn create(&self, monitor: PageMonitor) -> anyhow::Result<MockPage> {
        let id = self.created.fetch_add(1, Ordering::SeqCst);
        let fail_next = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_next || self.fail_always.load(Ordering::SeqCst) {
            return Err(anyhow!("browser refused to open page {id}"));
        }
        let handle = Arc::new(PageHandle {
            id,
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            monitor,
        });
        self.pages.lock().unwrap().push(handle.clone());
        Ok(MockPage { handle })
    }

    async fn close(&self, page: &MockPage) {
        page.handle.alive.store(false, Ordering::SeqCst);
        page.handle.closed.store(true, Ordering::SeqCst);
    }

    fn is_alive(&self, page: &MockPage) -> bool {
        page.handle.is_alive()
    }
}

pub fn status_url(id: u64) -> String {
    format!("https://x.com/nasa/status/{id}")
}

pub fn status_urls(ids: impl IntoIterator<Item = u64>) -> Vec<String> {
    ids.into_iter().map(status_url).collect()
}

pub fn image_url(item_id: &str, n: usize) -> String {
    format!("https://pbs.example/media/{item_id}_{n}.jpg")
}

/// Succeeds unless a scripted outcome is queued for the url.
#[derive(Debug)]
pub struct ScriptedExtractor {
    images_per_item: usize,
    delay: Duration,
    script: Mutex<HashMap<String, VecDeque<ExtractError>>>,
    images: Mutex<HashMap<String, Vec<String>>>,
    calls: Mutex<Vec<(String, usize)>>,
    starts: Mutex<Vec<(String, Instant)>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Default for ScriptedExtractor {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ScriptedExtractor {
    pub fn new(images_per_item: usize) -> Self {
        Self {
            images_per_item,
            delay: Duration::ZERO,
            script: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            starts: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queues failures returned, in order, by the next calls for `url`.
    pub fn fail(self, url: &str, errors: impl IntoIterator<Item = ExtractError>) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .extend(errors);
        self
    }

    /// Image urls reported for `url` instead of the generated ones.
    pub fn with_images(self, url: &str, images: Vec<String>) -> Self {
        self.images.lock().unwrap().insert(url.to_string(), images);
        self
    }

    /// `(url, page id)` of every call, in call order.
    pub fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().unwrap().clone()
    }

    /// `(url, start time)` of every call.
    pub fn starts(&self) -> Vec<(String, Instant)> {
        self.starts.lock().unwrap().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls().into_iter().map(|(url, _)| url).collect()
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls().iter().filter(|(u, _)| u == url).count()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor<MockPage> for ScriptedExtractor {
    async fn extract(&self, page: &MockPage, item_url: &str) -> Result<Extraction, ExtractError> {
        self.calls
            .lock()
            .unwrap()
            .push((item_url.to_string(), page.id()));
        self.starts
            .lock()
            .unwrap()
            .push((item_url.to_string(), Instant::now()));
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(item_url)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }

        let item_id = parse_item_id(item_url).unwrap_or_default();
        let images = self
            .images
            .lock()
            .unwrap()
            .get(item_url)
            .cloned()
            .unwrap_or_else(|| {
                (1..=self.images_per_item)
                    .map(|n| image_url(&item_id, n))
                    .collect()
            });
        Ok(Extraction::new(
            item_id,
            Some("2024-01-01T00:00:00.000Z"),
            images,
        ))
    }
}

/// Returns a fixed timeline, honoring the early stop policy.
#[derive(Debug, Default)]
pub struct StaticScroller {
    items: Vec<String>,
    fail: bool,
    requests: Mutex<Vec<(String, usize)>>,
}

impl StaticScroller {
    pub fn new(items: Vec<String>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// `(start url, known id count)` of every call.
    pub fn requests(&self) -> Vec<(String, usize)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TimelineScroller<MockPage> for StaticScroller {
    async fn collect(
        &self,
        _page: &MockPage,
        request: &ScrollRequest<'_>,
    ) -> anyhow::Result<Vec<String>> {
        self.requests
            .lock()
            .unwrap()
            .push((request.start_url.to_string(), request.known_ids.len()));
        if self.fail {
            return Err(anyhow!("timeline never loaded"));
        }
        let mut early_stop = request.early_stop();
        let mut items = Vec::new();
        for url in &self.items {
            items.push(url.clone());
            if early_stop.observe(request.is_known(url)) {
                break;
            }
        }
        Ok(items)
    }
}

/// Writes a few bytes per image, failing for chosen urls.
#[derive(Debug, Default)]
pub struct MockDownloader {
    failing: Mutex<HashSet<String>>,
    downloads: Mutex<Vec<String>>,
}

impl MockDownloader {
    pub fn fail_on(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactDownloader for MockDownloader {
    async fn download(&self, url: &str, dest: &Path) -> anyhow::Result<u64> {
        self.downloads.lock().unwrap().push(url.to_string());
        if self.failing.lock().unwrap().contains(url) {
            return Err(anyhow!("HTTP 503 for {url}"));
        }
        let bytes = url.as_bytes();
        tokio::fs::write(dest, bytes).await?;
        Ok(bytes.len() as u64)
    }
}

/// Keeps every callback for later inspection.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub completed: Mutex<Vec<ItemResult>>,
    pub progress: Mutex<Vec<Progress>>,
    pub backoffs: Mutex<Vec<(String, Duration)>>,
}

impl ProcessObserver for RecordingObserver {
    fn on_item_complete(&self, result: &ItemResult) {
        self.completed.lock().unwrap().push(result.clone());
    }

    fn on_progress(&self, progress: &Progress) {
        self.progress.lock().unwrap().push(*progress);
    }

    fn on_backoff(&self, url: &str, duration: Duration) {
        self.backoffs
            .lock()
            .unwrap()
            .push((url.to_string(), duration));
    }
}

/// Processor settings without start delays and with short retries.
pub fn fast_processor_config(max_workers: usize) -> ProcessorConfig {
    ProcessorConfig {
        max_workers,
        max_retries: 3,
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(100),
        worker_start_delay: Duration::ZERO,
        min_action_interval: Duration::ZERO,
        stagger: StaggerScope::PerWorker,
        rate_limit_backoff: Duration::from_secs(60),
    }
}

/// Lets the pool's event task apply pending releases and crash reports.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

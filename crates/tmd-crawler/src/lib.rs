mod config;
mod error;
mod extract;
mod limiter;
mod orchestrator;
mod pool;
mod processor;
mod sync;

pub use config::{CrawlerConfig, ItemOrder, ResumePolicy, StaggerScope};
pub use error::{CrawlError, ErrorKind, ExtractError, PoolError, ProcessError};
pub use extract::{image_extension, parse_item_id, Extraction, Extractor};
pub use limiter::{retry_delay, Backoff, Stagger};
pub use orchestrator::{
    ArtifactDownloader, CrawlReport, Crawler, EarlyStop, ScrollRequest, TimelineScroller,
};
pub use pool::{
    PageEvent, PageFactory, PageMonitor, PoolStatus, PooledPage, ResourcePool, SlotStatus,
};
pub use processor::{
    ItemResult, ProcessObserver, ProcessSummary, ProcessorConfig, ProcessorState, Progress,
    TaskProcessor,
};
pub use sync::{Guarded, GuardedRef, Permit, Semaphore};

pub use anyhow;
pub use tmd_store;

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::future;
use tokio::sync::{mpsc, oneshot};

use crate::error::PoolError;

/// Creates and closes the browser pages held by a [`ResourcePool`].
///
/// The pool knows nothing about how a page is configured. A factory wires
/// the given [`PageMonitor`] into the page's crash and close notifications
/// so the pool learns about dead pages as soon as they die.
#[async_trait]
pub trait PageFactory: Send + Sync + 'static {
    type Page: Send + Sync + 'static;

    async fn create(&self, monitor: PageMonitor) -> anyhow::Result<Self::Page>;

    async fn close(&self, page: &Self::Page);

    fn is_alive(&self, page: &Self::Page) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Idle,
    Busy,
    Crashed,
    /// A page is being created for the slot.
    Starting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEvent {
    Crashed,
    Closed,
}

#[derive(Debug)]
enum PoolEvent {
    Page {
        index: usize,
        generation: u64,
        event: PageEvent,
    },
    Released {
        index: usize,
        generation: u64,
        crashed: bool,
    },
}

/// Reports the fate of one page back to its pool.
#[derive(Debug, Clone)]
pub struct PageMonitor {
    index: usize,
    generation: u64,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl PageMonitor {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn crashed(&self) {
        self.send(PageEvent::Crashed);
    }

    pub fn closed(&self) {
        self.send(PageEvent::Closed);
    }

    fn send(&self, event: PageEvent) {
        // The pool may already be gone, nothing left to update then.
        let _ = self.events.send(PoolEvent::Page {
            index: self.index,
            generation: self.generation,
            event,
        });
    }
}

/// A page checked out of the pool. Dropping it gives the slot back.
pub struct PooledPage<P> {
    page: Arc<P>,
    index: usize,
    generation: u64,
    crashed: bool,
    armed: bool,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl<P> PooledPage<P> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Flags the page as dead so the slot gets recreated instead of reused.
    pub fn mark_crashed(&mut self) {
        self.crashed = true;
    }

    pub fn release(self) {}

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<P> Deref for PooledPage<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.page
    }
}

impl<P> fmt::Debug for PooledPage<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledPage")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("crashed", &self.crashed)
            .finish()
    }
}

impl<P> Drop for PooledPage<P> {
    fn drop(&mut self) {
        if self.armed {
            // Releases go through the event queue, never through the lock,
            // so a page can be dropped anywhere.
            let _ = self.events.send(PoolEvent::Released {
                index: self.index,
                generation: self.generation,
                crashed: self.crashed,
            });
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub size: usize,
    pub idle: usize,
    pub busy: usize,
    pub crashed: usize,
    pub starting: usize,
    pub waiting: usize,
}

struct Slot<P> {
    page: Option<Arc<P>>,
    status: SlotStatus,
    generation: u64,
}

struct PoolState<P> {
    slots: Vec<Slot<P>>,
    waiters: VecDeque<oneshot::Sender<PooledPage<P>>>,
    next_generation: u64,
    closed: bool,
}

impl<P> PoolState<P> {
    fn first(&self, status: SlotStatus) -> Option<usize> {
        self.slots.iter().position(|s| s.status == status)
    }

    fn has_live(&self) -> bool {
        self.slots.iter().any(|s| s.status != SlotStatus::Crashed)
    }

    fn begin_start(&mut self, index: usize) -> u64 {
        self.next_generation += 1;
        let slot = &mut self.slots[index];
        slot.status = SlotStatus::Starting;
        slot.generation = self.next_generation;
        slot.page = None;
        self.next_generation
    }

    /// Hands `lease` to the oldest waiter still listening. Returns false
    /// when nobody took it, in which case the lease is disarmed.
    fn offer(&mut self, mut lease: PooledPage<P>) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(lease) {
                Ok(()) => return true,
                Err(returned) => lease = returned,
            }
        }
        lease.disarm();
        false
    }
}

struct Inner<F: PageFactory> {
    factory: F,
    state: Mutex<PoolState<F::Page>>,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl<F: PageFactory> Inner<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<F::Page>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lease(&self, page: Arc<F::Page>, index: usize, generation: u64) -> PooledPage<F::Page> {
        PooledPage {
            page,
            index,
            generation,
            crashed: false,
            armed: true,
            events: self.events.clone(),
        }
    }

    /// Marks an idle slot busy and checks it out. A page found dead is
    /// taken out of its slot, which becomes crashed.
    fn checkout(
        &self,
        state: &mut PoolState<F::Page>,
        index: usize,
    ) -> Result<PooledPage<F::Page>, Option<Arc<F::Page>>> {
        let slot = &mut state.slots[index];
        match slot.page.take() {
            Some(page) if self.factory.is_alive(&page) => {
                slot.page = Some(page.clone());
                slot.status = SlotStatus::Busy;
                Ok(self.lease(page, index, slot.generation))
            }
            page => {
                log::warn!("Page {index} found dead, slot marked crashed");
                slot.status = SlotStatus::Crashed;
                Err(page)
            }
        }
    }

    async fn create_page(&self, index: usize, generation: u64) -> anyhow::Result<Arc<F::Page>> {
        let monitor = PageMonitor {
            index,
            generation,
            events: self.events.clone(),
        };
        self.factory.create(monitor).await.map(Arc::new)
    }

    /// Stores a freshly created page in its slot, marked busy. Gives the
    /// page back when the slot moved on meanwhile.
    fn install(
        &self,
        state: &mut PoolState<F::Page>,
        index: usize,
        generation: u64,
        page: Arc<F::Page>,
    ) -> Result<PooledPage<F::Page>, Arc<F::Page>> {
        if state.closed {
            return Err(page);
        }
        match state.slots.get_mut(index) {
            Some(slot) if slot.generation == generation => {
                slot.page = Some(page.clone());
                slot.status = SlotStatus::Busy;
                Ok(self.lease(page, index, generation))
            }
            _ => Err(page),
        }
    }

    fn close_detached(self: &Arc<Self>, page: Arc<F::Page>) {
        let inner = self.clone();
        spawn_detached(async move { inner.factory.close(&page).await });
    }

    fn handle(self: &Arc<Self>, event: PoolEvent) {
        match event {
            PoolEvent::Page {
                index,
                generation,
                event,
            } => self.on_page_event(index, generation, event),
            PoolEvent::Released {
                index,
                generation,
                crashed,
            } => self.on_release(index, generation, crashed),
        }
    }

    fn on_page_event(self: &Arc<Self>, index: usize, generation: u64, event: PageEvent) {
        let mut state = self.lock();
        let Some(slot) = state.slots.get_mut(index) else {
            return;
        };
        if slot.generation != generation {
            return;
        }
        log::warn!("Page {index} reported {event:?} while {:?}", slot.status);
        // A busy slot goes down too. Its holder's release is ignored since
        // the slot is no longer busy, or has a new generation by then.
        if matches!(slot.status, SlotStatus::Idle | SlotStatus::Busy) {
            self.take_down(state, index);
        }
    }

    fn on_release(self: &Arc<Self>, index: usize, generation: u64, crashed: bool) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let Some(slot) = state.slots.get_mut(index) else {
            return;
        };
        if slot.generation != generation || slot.status != SlotStatus::Busy {
            return;
        }

        let healthy = !crashed
            && slot
                .page
                .as_deref()
                .map_or(false, |page| self.factory.is_alive(page));

        if healthy {
            if let Ok(lease) = self.checkout(&mut state, index) {
                if !state.offer(lease) {
                    state.slots[index].status = SlotStatus::Idle;
                }
            }
            return;
        }

        log::warn!("Page {index} released dead, slot marked crashed");
        self.take_down(state, index);
    }

    /// Marks the slot crashed, closes its page and recreates crashed slots
    /// when callers are waiting.
    fn take_down(self: &Arc<Self>, mut state: MutexGuard<'_, PoolState<F::Page>>, index: usize) {
        let page = state.slots.get_mut(index).and_then(|slot| {
            slot.status = SlotStatus::Crashed;
            slot.page.take()
        });
        let recover = !state.waiters.is_empty();
        drop(state);

        if let Some(page) = page {
            self.close_detached(page);
        }
        if recover {
            let inner = self.clone();
            spawn_detached(async move { inner.recover().await });
        }
    }

    /// Recreates crashed slots for queued waiters, one attempt per slot.
    async fn recover(self: Arc<Self>) {
        let mut tried = Vec::new();
        loop {
            let (index, generation) = {
                let mut state = self.lock();
                if state.closed || state.waiters.is_empty() {
                    return;
                }
                let candidate = state
                    .slots
                    .iter()
                    .enumerate()
                    .position(|(i, s)| s.status == SlotStatus::Crashed && !tried.contains(&i));
                let Some(index) = candidate else {
                    return;
                };
                (index, state.begin_start(index))
            };
            tried.push(index);

            let created = self.create_page(index, generation).await;
            let mut state = self.lock();
            match created {
                Ok(page) => match self.install(&mut state, index, generation, page) {
                    Ok(lease) => {
                        log::info!("Page {index} recreated");
                        if !state.offer(lease) {
                            state.slots[index].status = SlotStatus::Idle;
                        }
                    }
                    Err(page) => {
                        drop(state);
                        self.close_detached(page);
                        return;
                    }
                },
                Err(e) => {
                    log::warn!("Couldn't recreate page {index}: {e:#}");
                    if let Some(slot) = state.slots.get_mut(index) {
                        if slot.generation == generation {
                            slot.status = SlotStatus::Crashed;
                        }
                    }
                    if !state.has_live() {
                        log::error!("No live page left, failing {} waiters", state.waiters.len());
                        state.waiters.clear();
                        return;
                    }
                }
            }
        }
    }
}

fn spawn_detached<Fut>(fut: Fut)
where
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
        }
        Err(_) => log::debug!("No runtime to run pool housekeeping"),
    }
}

async fn watch_events<F: PageFactory>(
    pool: Weak<Inner<F>>,
    mut rx: mpsc::UnboundedReceiver<PoolEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = pool.upgrade() else {
            break;
        };
        inner.handle(event);
    }
}

/// A fixed number of long-lived browser pages shared by workers.
///
/// Slot state lives behind a short-lived lock that is never held across
/// an await. Crash reports and releases arrive as events and are applied
/// in order by a single task.
pub struct ResourcePool<F: PageFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: PageFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: PageFactory> ResourcePool<F> {
    /// Opens `size` pages. Slots whose page fails to open start out
    /// crashed; the pool only fails when no page opens at all.
    pub async fn initialize(factory: F, size: usize) -> Result<Self, PoolError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let slots = (0..size)
            .map(|_| Slot {
                page: None,
                status: SlotStatus::Crashed,
                generation: 0,
            })
            .collect();
        let inner = Arc::new(Inner {
            factory,
            state: Mutex::new(PoolState {
                slots,
                waiters: VecDeque::new(),
                next_generation: 0,
                closed: false,
            }),
            events: tx,
        });
        tokio::spawn(watch_events(Arc::downgrade(&inner), rx));

        let generations: Vec<u64> = {
            let mut state = inner.lock();
            (0..size).map(|i| state.begin_start(i)).collect()
        };
        let created = future::join_all(
            generations
                .iter()
                .enumerate()
                .map(|(index, &generation)| inner.create_page(index, generation)),
        )
        .await;

        let mut live = 0;
        {
            let mut state = inner.lock();
            for (index, page) in created.into_iter().enumerate() {
                let slot = &mut state.slots[index];
                match page {
                    Ok(page) => {
                        slot.page = Some(page);
                        slot.status = SlotStatus::Idle;
                        live += 1;
                    }
                    Err(e) => {
                        log::warn!("Couldn't create page {index}: {e:#}");
                        slot.status = SlotStatus::Crashed;
                    }
                }
            }
        }

        if live == 0 {
            return Err(PoolError::NoLivePages { attempted: size });
        }
        log::info!("Page pool ready with {live}/{size} pages");
        Ok(Self { inner })
    }

    /// Checks out a page, waiting in line when all of them are busy.
    ///
    /// Fails with [`PoolError::ShuttingDown`] once [`cleanup`](Self::cleanup)
    /// ran, and with [`PoolError::Exhausted`] when every slot crashed and
    /// none could be recreated.
    pub async fn acquire(&self) -> Result<PooledPage<F::Page>, PoolError> {
        let mut tried_recreate = false;
        let mut dead = Vec::new();
        let waiter = loop {
            let (index, generation) = {
                let mut state = self.inner.lock();
                if state.closed {
                    return Err(PoolError::ShuttingDown);
                }
                while let Some(index) = state.first(SlotStatus::Idle) {
                    match self.inner.checkout(&mut state, index) {
                        Ok(lease) => {
                            drop(state);
                            self.close_all_detached(dead);
                            return Ok(lease);
                        }
                        Err(page) => dead.extend(page),
                    }
                }
                match state.first(SlotStatus::Crashed).filter(|_| !tried_recreate) {
                    Some(index) => (index, state.begin_start(index)),
                    None if !state.has_live() => {
                        state.waiters.clear();
                        return Err(PoolError::Exhausted);
                    }
                    None => {
                        let (tx, rx) = oneshot::channel();
                        state.waiters.push_back(tx);
                        break rx;
                    }
                }
            };

            tried_recreate = true;
            self.close_all_detached(std::mem::take(&mut dead));
            let created = self.inner.create_page(index, generation).await;
            let mut state = self.inner.lock();
            match created {
                Ok(page) => match self.inner.install(&mut state, index, generation, page) {
                    Ok(lease) => {
                        log::info!("Page {index} recreated");
                        return Ok(lease);
                    }
                    Err(page) => {
                        let closed = state.closed;
                        drop(state);
                        self.inner.close_detached(page);
                        if closed {
                            return Err(PoolError::ShuttingDown);
                        }
                    }
                },
                Err(e) => {
                    log::warn!("Couldn't recreate page {index}: {e:#}");
                    if let Some(slot) = state.slots.get_mut(index) {
                        if slot.generation == generation {
                            slot.status = SlotStatus::Crashed;
                        }
                    }
                }
            }
        };

        self.close_all_detached(dead);
        match waiter.await {
            Ok(lease) => Ok(lease),
            Err(_) if self.inner.lock().closed => Err(PoolError::ShuttingDown),
            Err(_) => Err(PoolError::Exhausted),
        }
    }

    /// Wakes every waiter with [`PoolError::ShuttingDown`], closes all
    /// pages and empties the pool.
    pub async fn cleanup(&self) {
        let pages: Vec<Arc<F::Page>> = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.waiters.clear();
            state
                .slots
                .drain(..)
                .filter_map(|slot| slot.page)
                .collect()
        };
        log::info!("Closing {} pages", pages.len());
        future::join_all(pages.iter().map(|page| self.inner.factory.close(page))).await;
    }

    fn close_all_detached(&self, pages: Vec<Arc<F::Page>>) {
        for page in pages {
            self.inner.close_detached(page);
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        let count = |status| state.slots.iter().filter(|s| s.status == status).count();
        PoolStatus {
            size: state.slots.len(),
            idle: count(SlotStatus::Idle),
            busy: count(SlotStatus::Busy),
            crashed: count(SlotStatus::Crashed),
            starting: count(SlotStatus::Starting),
            waiting: state.waiters.len(),
        }
    }

    pub fn slot_status(&self, index: usize) -> Option<SlotStatus> {
        self.inner.lock().slots.get(index).map(|s| s.status)
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }
}

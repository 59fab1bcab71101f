use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedSemaphorePermit;

/// Counting permits served in FIFO order.
///
/// A released permit goes straight to the oldest waiter, and the permit
/// count cannot go negative because a [`Permit`] is the only way to hold one.
#[derive(Debug, Clone)]
pub struct Semaphore {
    permits: Arc<tokio::sync::Semaphore>,
}

/// A held permit, returned to its [`Semaphore`] on drop.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Arc::new(tokio::sync::Semaphore::new(permits)),
        }
    }

    /// A single permit, i.e. a mutual exclusion lock.
    pub fn mutex() -> Self {
        Self::new(1)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn acquire(&self) -> Permit {
        match self.permits.clone().acquire_owned().await {
            Ok(permit) => Permit { _permit: permit },
            // The inner semaphore is private and never closed.
            Err(_) => unreachable!("semaphore closed"),
        }
    }

    pub fn try_acquire(&self) -> Option<Permit> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { _permit: permit })
    }

    /// Runs `f` while holding a permit. The permit is released however the
    /// future ends, including when it is dropped early.
    pub async fn with_permit<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        f().await
    }
}

/// A value behind a one-permit [`Semaphore`].
///
/// Async callers queue on the permit instead of blocking a thread, so the
/// inner mutex is only ever taken by the permit holder.
#[derive(Debug)]
pub struct Guarded<T> {
    lock: Semaphore,
    value: Mutex<T>,
}

pub struct GuardedRef<'a, T> {
    value: MutexGuard<'a, T>,
    _permit: Permit,
}

impl<T> Guarded<T> {
    pub fn new(value: T) -> Self {
        Self {
            lock: Semaphore::mutex(),
            value: Mutex::new(value),
        }
    }

    pub async fn lock(&self) -> GuardedRef<'_, T> {
        let permit = self.lock.acquire().await;
        GuardedRef {
            value: self.value.lock().unwrap_or_else(PoisonError::into_inner),
            _permit: permit,
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Deref for GuardedRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for GuardedRef<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

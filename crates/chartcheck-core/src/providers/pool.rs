use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};

type Factory<H> = Box<dyn Fn() -> anyhow::Result<H> + Send + Sync>;

/// Bounded pool of transport handles.
///
/// Each in-flight call holds one handle exclusively; handles are built on
/// first demand and returned to the idle list when the guard drops. At most
/// `capacity` handles exist at once.
pub struct HandlePool<H> {
    idle: Mutex<Vec<H>>,
    permits: Semaphore,
    capacity: usize,
    created: AtomicUsize,
    factory: Factory<H>,
}

impl<H: Send> HandlePool<H> {
    pub fn new(
        capacity: usize,
        factory: impl Fn() -> anyhow::Result<H> + Send + Sync + 'static,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            permits: Semaphore::new(capacity),
            capacity,
            created: AtomicUsize::new(0),
            factory: Box::new(factory),
        }
    }

    /// Waits for a free slot, then reuses an idle handle or builds one.
    pub async fn acquire(&self) -> anyhow::Result<PooledHandle<'_, H>> {
        let permit = self.permits.acquire().await?;
        let reused = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let handle = match reused {
            Some(h) => h,
            None => {
                let h = (self.factory)()?;
                self.created.fetch_add(1, Ordering::Relaxed);
                h
            }
        };
        Ok(PooledHandle {
            handle: Some(handle),
            pool: self,
            _permit: permit,
        })
    }

    /// Drops every idle handle. Handles in use are unaffected and return to
    /// the pool as usual. Returns the number released.
    pub fn clear(&self) -> usize {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        let n = idle.len();
        idle.clear();
        n
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Handles built over the pool's lifetime.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

pub struct PooledHandle<'a, H> {
    handle: Option<H>,
    pool: &'a HandlePool<H>,
    _permit: SemaphorePermit<'a>,
}

impl<H> Deref for PooledHandle<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        // Only `Drop` takes the handle out.
        self.handle.as_ref().unwrap()
    }
}

impl<H> Drop for PooledHandle<'_, H> {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            self.pool
                .idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(h);
        }
    }
}

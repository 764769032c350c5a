//! GPU completion tokens and the single-assignment future that carries them
//! from the render actor back to the data manager.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::foundation::logging::debug;

/// Synchronization errors
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// A wait observed that its owner is shutting down
    #[error("wait cancelled by shutdown")]
    Cancelled,
    
    /// The promise was dropped without being resolved
    #[error("completion promise dropped without a value")]
    Abandoned,
    
    /// A bounded wait ran out of time
    #[error("wait timed out")]
    TimedOut,
}

/// Shared "still open" flag observed by every cancellable wait
#[derive(Debug, Clone)]
pub struct OpenFlag(Arc<AtomicBool>);

impl OpenFlag {
    /// Create a flag in the open state
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
    
    /// Check whether the owner is still open
    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
    
    /// Mark the owner as closing
    pub fn close(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for OpenFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic completion counter signalled when GPU work retires
#[derive(Debug, Clone, Default)]
pub struct GpuCounter(Arc<AtomicU64>);

impl GpuCounter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Last observed completed value
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
    
    /// Raise the counter to `value`; lower values are ignored
    pub fn signal(&self, value: u64) {
        self.0.fetch_max(value, Ordering::AcqRel);
    }
    
    /// Token that completes once this counter reaches `target`
    pub fn token(&self, target: u64) -> SyncToken {
        SyncToken { counter: self.clone(), target }
    }
    
    /// Check whether two handles refer to the same counter
    pub fn same_counter(&self, other: &GpuCounter) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Proof object for asynchronous GPU work: complete iff counter >= target
#[derive(Debug, Clone)]
pub struct SyncToken {
    counter: GpuCounter,
    target: u64,
}

impl SyncToken {
    /// Token that is already complete
    pub fn completed() -> Self {
        GpuCounter::new().token(0)
    }
    
    /// Counter this token observes
    pub fn counter(&self) -> &GpuCounter {
        &self.counter
    }
    
    /// Value the counter must reach
    pub fn target(&self) -> u64 {
        self.target
    }
    
    /// Check whether the work has retired
    pub fn is_complete(&self) -> bool {
        self.counter.value() >= self.target
    }
    
    /// Poll until the token completes or `open` is cleared
    pub fn wait(&self, open: &OpenFlag, poll_interval: Duration) -> Result<(), SyncError> {
        loop {
            if self.is_complete() {
                return Ok(());
            }
            if !open.is_open() {
                debug!("Completion wait for value {} cancelled at {}", self.target, self.counter.value());
                return Err(SyncError::Cancelled);
            }
            pause(poll_interval);
        }
    }
    
    /// Poll until the token completes or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration, poll_interval: Duration) -> Result<(), SyncError> {
        let deadline = Instant::now() + timeout;
        while !self.is_complete() {
            if Instant::now() >= deadline {
                return Err(SyncError::TimedOut);
            }
            pause(poll_interval);
        }
        Ok(())
    }
}

fn pause(poll_interval: Duration) {
    if poll_interval.is_zero() {
        thread::yield_now();
    } else {
        thread::sleep(poll_interval);
    }
}

#[derive(Debug)]
enum Shared {
    Pending,
    Ready(SyncToken),
    Abandoned,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a connected single-assignment promise/future pair
pub fn completion_pair() -> (CompletionPromise, CompletionFuture) {
    let shared = Arc::new(Mutex::new(Shared::Pending));
    (
        CompletionPromise { shared: Some(Arc::clone(&shared)) },
        CompletionFuture { shared },
    )
}

/// Write side of the pair, resolved exactly once
#[derive(Debug)]
pub struct CompletionPromise {
    shared: Option<Arc<Mutex<Shared>>>,
}

impl CompletionPromise {
    /// Hand the token to the waiting future
    pub fn resolve(mut self, token: SyncToken) {
        if let Some(shared) = self.shared.take() {
            *lock(&shared) = Shared::Ready(token);
        }
    }
}

impl Drop for CompletionPromise {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            *lock(&shared) = Shared::Abandoned;
        }
    }
}

/// Read side of the pair
#[derive(Debug)]
pub struct CompletionFuture {
    shared: Arc<Mutex<Shared>>,
}

impl CompletionFuture {
    /// Check whether the promise has been resolved or dropped
    pub fn is_ready(&self) -> bool {
        !matches!(*lock(&self.shared), Shared::Pending)
    }
    
    /// Token if already resolved, `Ok(None)` while pending
    pub fn try_get(&self) -> Result<Option<SyncToken>, SyncError> {
        match &*lock(&self.shared) {
            Shared::Pending => Ok(None),
            Shared::Ready(token) => Ok(Some(token.clone())),
            Shared::Abandoned => Err(SyncError::Abandoned),
        }
    }
    
    /// Poll until the promise is resolved, then return its token
    pub fn wait(&self, open: &OpenFlag, poll_interval: Duration) -> Result<SyncToken, SyncError> {
        loop {
            if let Some(token) = self.try_get()? {
                return Ok(token);
            }
            if !open.is_open() {
                return Err(SyncError::Cancelled);
            }
            pause(poll_interval);
        }
    }
    
    /// Wait for the promise and then for the token it carries
    pub fn wait_complete(&self, open: &OpenFlag, poll_interval: Duration) -> Result<SyncToken, SyncError> {
        let token = self.wait(open, poll_interval)?;
        token.wait(open, poll_interval)?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_token_completes_at_target() {
        let counter = GpuCounter::new();
        let token = counter.token(3);
        
        counter.signal(2);
        assert!(!token.is_complete());
        counter.signal(3);
        assert!(token.is_complete());
        
        counter.signal(1);
        assert_eq!(counter.value(), 3);
    }
    
    #[test]
    fn test_wait_cancelled_by_closed_flag() {
        let counter = GpuCounter::new();
        let open = OpenFlag::new();
        open.close();
        
        let result = counter.token(1).wait(&open, Duration::ZERO);
        assert_eq!(result, Err(SyncError::Cancelled));
    }
    
    #[test]
    fn test_wait_observes_other_thread_signal() {
        let counter = GpuCounter::new();
        let token = counter.token(5);
        let signaller = {
            let counter = counter.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                counter.signal(5);
            })
        };
        
        assert_eq!(token.wait(&OpenFlag::new(), Duration::from_micros(50)), Ok(()));
        signaller.join().unwrap();
    }
    
    #[test]
    fn test_promise_resolves_future() {
        let (promise, future) = completion_pair();
        assert!(!future.is_ready());
        assert!(future.try_get().unwrap().is_none());
        
        let counter = GpuCounter::new();
        promise.resolve(counter.token(7));
        
        let token = future.wait(&OpenFlag::new(), Duration::ZERO).unwrap();
        assert_eq!(token.target(), 7);
        assert!(token.counter().same_counter(&counter));
    }
    
    #[test]
    fn test_dropped_promise_abandons_future() {
        let (promise, future) = completion_pair();
        drop(promise);
        
        assert!(future.is_ready());
        assert_eq!(future.wait(&OpenFlag::new(), Duration::ZERO).unwrap_err(), SyncError::Abandoned);
    }
    
    #[test]
    fn test_wait_timeout_gives_up() {
        let counter = GpuCounter::new();
        let token = counter.token(1);
        assert_eq!(token.wait_timeout(Duration::from_millis(5), Duration::ZERO), Err(SyncError::TimedOut));
        
        counter.signal(1);
        assert_eq!(token.wait_timeout(Duration::ZERO, Duration::ZERO), Ok(()));
    }
}

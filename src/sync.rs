//! 带耗时追踪的互斥锁
//!
//! 在 parking_lot::Mutex 外面包一层, 临界区持有时间超过阈值时打 warn 日志.
//! 只影响可观测性, 不影响正确性.

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// 默认告警阈值
pub const DEFAULT_TRACE_THRESHOLD: Duration = Duration::from_millis(10);

pub struct TracedMutex<T> {
    inner: Mutex<T>,
    id: &'static str,
    threshold: Duration,
}

impl<T> TracedMutex<T> {
    pub fn new(id: &'static str, value: T) -> Self {
        Self::with_threshold(id, DEFAULT_TRACE_THRESHOLD, value)
    }

    pub fn with_threshold(id: &'static str, threshold: Duration, value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            id,
            threshold,
        }
    }

    pub fn lock(&self) -> TracedGuard<'_, T> {
        let requested = Instant::now();
        let guard = self.inner.lock();
        let waited = requested.elapsed();
        if waited > self.threshold {
            log::warn!("lock {} waited {:?} before acquiring", self.id, waited);
        }
        TracedGuard {
            guard,
            id: self.id,
            threshold: self.threshold,
            acquired: Instant::now(),
        }
    }
}

impl<T> fmt::Debug for TracedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedMutex")
            .field("id", &self.id)
            .field("threshold", &self.threshold)
            .finish()
    }
}

pub struct TracedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    id: &'static str,
    threshold: Duration,
    acquired: Instant,
}

impl<T> Deref for TracedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TracedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for TracedGuard<'_, T> {
    fn drop(&mut self) {
        let held = self.acquired.elapsed();
        if held > self.threshold {
            log::warn!("lock {} held for {:?}", self.id, held);
        }
    }
}

//! Process-local named objects with the same contract as the native ones.
//!
//! Names live in a process-wide table, so two handles opened under one name within a process
//! behave like two processes sharing the native object.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use log::trace;
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Registry<T> = Mutex<HashMap<String, Arc<T>>>;

fn unlink_from<T>(registry: &Registry<T>, name: &str) -> Result<()> {
    super::validate_name(name)?;
    match lock(registry).remove(name) {
        Some(_) => Ok(()),
        None => Err(Error::DoesNotExist(name.to_owned())),
    }
}

#[derive(Debug, Default)]
struct Counter {
    count: Mutex<u64>,
    available: Condvar,
}

fn semaphores() -> &'static Registry<Counter> {
    static SEMAPHORES: OnceLock<Registry<Counter>> = OnceLock::new();
    SEMAPHORES.get_or_init(Default::default)
}

/// A counting semaphore built from a mutex and a condition variable.
#[derive(Debug, Clone)]
pub struct LocalSemaphore {
    counter: Arc<Counter>,
}

impl super::SemaphoreDriver for LocalSemaphore {
    fn create_or_open(name: &str) -> Result<LocalSemaphore> {
        super::validate_name(name)?;
        let counter = lock(semaphores()).entry(name.to_owned()).or_default().clone();
        Ok(LocalSemaphore { counter })
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut count = lock(&self.counter.count);
        while *count == 0 {
            match (timeout, deadline) {
                (Some(_), Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false)
                    }
                    count = self.counter.available.wait_timeout(count, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner).0;
                }
                // no deadline, or one too far away to represent
                _ => {
                    count = self.counter.available.wait(count)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        *count -= 1;
        Ok(true)
    }

    fn release(&self) -> Result<()> {
        *lock(&self.counter.count) += 1;
        self.counter.available.notify_one();
        Ok(())
    }

    fn close(self) -> Result<()> {
        Ok(())
    }

    fn unlink(name: &str) -> Result<()> {
        unlink_from(semaphores(), name)
    }
}

#[repr(C, align(64))]
struct Line([u8; 64]);

struct Segment {
    lines: Box<[UnsafeCell<Line>]>,
    len: usize,
}

// SAFETY: The segment is plain memory; callers synchronize access to it the same way they would
// synchronize access to memory shared with another process.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

fn segments() -> &'static Registry<Segment> {
    static SEGMENTS: OnceLock<Registry<Segment>> = OnceLock::new();
    SEGMENTS.get_or_init(Default::default)
}

/// A heap allocation shared by name within the process.
pub struct LocalSharedMemory {
    segment: Arc<Segment>,
}

impl std::fmt::Debug for LocalSharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSharedMemory")
            .field("ptr", &self.segment.lines.as_ptr())
            .field("len", &self.segment.len)
            .finish()
    }
}

impl super::SharedMemoryDriver for LocalSharedMemory {
    fn create(name: &str, len: usize) -> Result<LocalSharedMemory> {
        super::validate_name(name)?;
        if len == 0 {
            return Err(Error::InvalidParameter(format!("shared memory {name} must not be empty")))
        }
        let lines = (0..len.div_ceil(64)).map(|_| UnsafeCell::new(Line([0; 64]))).collect();
        let segment = Arc::new(Segment { lines, len });
        lock(segments()).insert(name.to_owned(), segment.clone());
        trace!("allocated {name} ({len} bytes)");
        Ok(LocalSharedMemory { segment })
    }

    fn open(name: &str) -> Result<LocalSharedMemory> {
        super::validate_name(name)?;
        match lock(segments()).get(name) {
            Some(segment) => Ok(LocalSharedMemory { segment: segment.clone() }),
            None => Err(Error::DoesNotExist(name.to_owned())),
        }
    }

    fn as_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.segment.lines.as_ptr()) as *mut u8
    }

    fn len(&self) -> usize {
        self.segment.len
    }

    fn unlink(name: &str) -> Result<()> {
        unlink_from(segments(), name)
    }
}

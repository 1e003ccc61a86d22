use std::time::Duration;

use crate::Result;
use crate::sys::{NativeSemaphore, SemaphoreDriver};

/// A named cross-process counting semaphore.
///
/// Opening is idempotent: every process that calls [`Semaphore::create_or_open`] with the same
/// name gets a handle to the same count, and whichever comes first creates it with a count of zero.
/// Interrupted waits are resumed transparently.
#[derive(Debug)]
pub struct Semaphore<D = NativeSemaphore> {
    driver: D,
    name: String,
}

impl<D: SemaphoreDriver> Semaphore<D> {
    pub fn create_or_open(name: &str) -> Result<Semaphore<D>> {
        Ok(Semaphore { driver: D::create_or_open(name)?, name: name.to_owned() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the count to become non-zero and decrements it. Returns `false` if `timeout`
    /// elapsed first; `None` waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.driver.wait(timeout)
    }

    pub fn release(&self) -> Result<()> {
        self.driver.release()
    }

    pub fn close(self) -> Result<()> {
        self.driver.close()
    }

    /// Removes the name. Open handles keep working; a later `create_or_open` makes a new semaphore.
    pub fn unlink(name: &str) -> Result<()> {
        D::unlink(name)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;
    use super::*;
    use crate::Error;
    use crate::sys::local::LocalSemaphore;

    fn unique_name(test: &str) -> String {
        format!("/ts{}.{}", std::process::id(), test)
    }

    fn check_timeout<D: SemaphoreDriver>(name: &str) {
        let sem = Semaphore::<D>::create_or_open(name).unwrap();
        for timeout_ms in [0, 10, 100] {
            let timeout = Duration::from_millis(timeout_ms);
            let started = Instant::now();
            assert!(!sem.wait(Some(timeout)).unwrap());
            let elapsed = started.elapsed();
            assert!(elapsed >= timeout, "returned early after {elapsed:?}");
            assert!(elapsed < timeout + Duration::from_millis(500), "overslept by {elapsed:?}");
        }
        Semaphore::<D>::unlink(name).unwrap();
    }

    #[test]
    fn test_timeout_native() {
        check_timeout::<NativeSemaphore>(&unique_name("timeout-native"));
    }

    #[test]
    fn test_timeout_local() {
        check_timeout::<LocalSemaphore>(&unique_name("timeout-local"));
    }

    #[test]
    fn test_release_counts() {
        let name = unique_name("release-counts");
        let producer = Semaphore::<NativeSemaphore>::create_or_open(&name).unwrap();
        let consumer = Semaphore::<NativeSemaphore>::create_or_open(&name).unwrap();
        assert_eq!(consumer.name(), name);
        for _ in 0..3 {
            producer.release().unwrap();
        }
        for _ in 0..3 {
            assert!(consumer.wait(Some(Duration::ZERO)).unwrap());
        }
        assert!(!consumer.wait(Some(Duration::ZERO)).unwrap());
        Semaphore::<NativeSemaphore>::unlink(&name).unwrap();
        producer.close().unwrap();
        consumer.close().unwrap();
    }

    #[test]
    fn test_infinite_wait_is_woken() {
        let name = unique_name("infinite");
        let consumer = Arc::new(Semaphore::<NativeSemaphore>::create_or_open(&name).unwrap());
        let waiter = {
            let consumer = consumer.clone();
            thread::spawn(move || consumer.wait(None).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        let producer = Semaphore::<NativeSemaphore>::create_or_open(&name).unwrap();
        producer.release().unwrap();
        assert!(waiter.join().unwrap());
        Semaphore::<NativeSemaphore>::unlink(&name).unwrap();
    }

    #[test]
    fn test_name_errors() {
        assert!(matches!(Semaphore::<NativeSemaphore>::create_or_open("no-slash"),
            Err(Error::InvalidName(_))));
        let long = format!("/{}", "x".repeat(300));
        assert!(matches!(Semaphore::<LocalSemaphore>::create_or_open(&long),
            Err(Error::NameTooLong(_))));
        assert!(matches!(Semaphore::<NativeSemaphore>::unlink(&unique_name("never-created")),
            Err(Error::DoesNotExist(_))));
    }
}

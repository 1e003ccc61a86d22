use std::time::Duration;

use crate::{Error, Result};

/// Longest name accepted for a named semaphore or shared memory segment, including the leading `/`.
pub const MAX_NAME_LEN: usize = 250;

/// A named counting semaphore that can be opened from several processes.
pub trait SemaphoreDriver: Sized + Send + Sync {
    /// Opens the semaphore `name`, creating it with a count of zero if it does not exist.
    fn create_or_open(name: &str) -> Result<Self>;

    /// Decrements the count, blocking while it is zero. Returns `false` if `timeout` elapsed first;
    /// `None` waits without a deadline.
    fn wait(&self, timeout: Option<Duration>) -> Result<bool>;

    fn release(&self) -> Result<()>;

    fn close(self) -> Result<()>;

    /// Removes `name`; handles that are already open stay usable.
    fn unlink(name: &str) -> Result<()>;
}

/// A named, fixed-size memory segment mapped into the current process.
pub trait SharedMemoryDriver: Sized + Send {
    /// Creates the segment `name` with `len` zeroed bytes, replacing any segment of that name.
    fn create(name: &str, len: usize) -> Result<Self>;

    /// Maps an existing segment at its current size.
    fn open(name: &str) -> Result<Self>;

    /// Start of the mapping, aligned to at least 64 bytes.
    fn as_ptr(&self) -> *mut u8;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unlink(name: &str) -> Result<()>;
}

/// Checks that `name` has the portable form `/name`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong(name.to_owned()))
    }
    if name.len() < 2 || !name.starts_with('/') || name[1..].contains('/') || name.contains('\0') {
        return Err(Error::InvalidName(name.to_owned()))
    }
    Ok(())
}

pub mod local;

#[cfg(unix)]
#[path = "posix.rs"]
pub mod imp;

#[cfg(unix)]
pub type NativeSemaphore = imp::PosixSemaphore;
#[cfg(unix)]
pub type NativeSharedMemory = imp::PosixSharedMemory;

// Without POSIX IPC the bridge only works between threads of one process.
#[cfg(not(unix))]
pub type NativeSemaphore = local::LocalSemaphore;
#[cfg(not(unix))]
pub type NativeSharedMemory = local::LocalSharedMemory;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("/thunderscope.bridge").is_ok());
        assert!(matches!(validate_name("thunderscope"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_name("/"), Err(Error::InvalidName(_))));
        assert!(matches!(validate_name("/a/b"), Err(Error::InvalidName(_))));
        let long = format!("/{}", "x".repeat(MAX_NAME_LEN));
        assert!(matches!(validate_name(&long), Err(Error::NameTooLong(_))));
    }
}

use std::ffi::CString;
use std::io;
use std::mem::{self, ManuallyDrop};
use std::ptr;
use std::time::Duration;
#[cfg(any(target_os = "macos", target_os = "ios"))]
use std::time::Instant;
use libc::c_int;
use log::{trace, warn};
use crate::{Error, Result};

/// Maps the errno of an operation on an open handle.
fn os_error(name: &str, error: io::Error) -> Error {
    match error.raw_os_error() {
        Some(libc::ENAMETOOLONG) =>
            Error::NameTooLong(name.to_owned()),
        Some(libc::EACCES | libc::EPERM) =>
            Error::PermissionDenied(name.to_owned()),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOMEM | libc::ENOSPC) =>
            Error::ResourceLimit(name.to_owned()),
        Some(libc::EEXIST) =>
            Error::AlreadyExists(name.to_owned()),
        Some(libc::ENOENT) =>
            Error::DoesNotExist(name.to_owned()),
        _ => Error::Io(error)
    }
}

/// Maps the errno of an operation that resolves `name`, where `EINVAL` means the name was refused.
fn name_error(name: &str, error: io::Error) -> Error {
    match error.raw_os_error() {
        Some(libc::EINVAL) =>
            Error::InvalidName(name.to_owned()),
        _ => os_error(name, error)
    }
}

fn c_name(name: &str) -> Result<CString> {
    super::validate_name(name)?;
    CString::new(name).map_err(|_| Error::InvalidName(name.to_owned()))
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn realtime_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    // SAFETY: `timespec` is a plain C struct for which all-zero is a valid value.
    let mut deadline: libc::timespec = unsafe { mem::zeroed() };
    // SAFETY: `deadline` is a valid, writable `timespec`.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline) } == -1 {
        return Err(io::Error::last_os_error())
    }
    let nanos = deadline.tv_nsec as u64 + timeout.subsec_nanos() as u64;
    let secs = (deadline.tv_sec as u64)
        .saturating_add(timeout.as_secs())
        .saturating_add(nanos / 1_000_000_000)
        .min(libc::time_t::MAX as u64);
    deadline.tv_sec = secs as _;
    deadline.tv_nsec = (nanos % 1_000_000_000) as _;
    Ok(deadline)
}

#[derive(Debug)]
struct SemHandle(*mut libc::sem_t);

impl SemHandle {
    fn close(self) -> io::Result<()> {
        let handle = ManuallyDrop::new(self);
        // SAFETY: The handle was returned by `sem_open` and is closed exactly once.
        if unsafe { libc::sem_close(handle.0) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for SemHandle {
    fn drop(&mut self) {
        // SAFETY: See `SemHandle::close`.
        if unsafe { libc::sem_close(self.0) } == -1 {
            warn!("error closing semaphore: {}", io::Error::last_os_error())
        }
    }
}

/// A POSIX named semaphore (`sem_open`).
#[derive(Debug)]
pub struct PosixSemaphore {
    handle: SemHandle,
    name: String,
}

// SAFETY: POSIX semaphore operations are thread-safe and the handle is never reassigned.
unsafe impl Send for PosixSemaphore {}
unsafe impl Sync for PosixSemaphore {}

impl super::SemaphoreDriver for PosixSemaphore {
    fn create_or_open(name: &str) -> Result<PosixSemaphore> {
        let path = c_name(name)?;
        // SAFETY: `path` is NUL-terminated; the variadic arguments match `O_CREAT`.
        let sem = unsafe {
            libc::sem_open(path.as_ptr(), libc::O_CREAT, 0o666 as libc::c_uint, 0 as libc::c_uint)
        };
        if sem == libc::SEM_FAILED {
            return Err(name_error(name, io::Error::last_os_error()))
        }
        trace!("opened semaphore {name} at {sem:?}");
        Ok(PosixSemaphore { handle: SemHandle(sem), name: name.to_owned() })
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        match timeout {
            Some(timeout) => self.timed_wait(timeout),
            None => loop {
                // SAFETY: The handle is open for the lifetime of `self`.
                if unsafe { libc::sem_wait(self.handle.0) } == 0 {
                    return Ok(true)
                }
                let error = io::Error::last_os_error();
                if error.raw_os_error() != Some(libc::EINTR) {
                    return Err(os_error(&self.name, error))
                }
            }
        }
    }

    fn release(&self) -> Result<()> {
        // SAFETY: The handle is open for the lifetime of `self`.
        if unsafe { libc::sem_post(self.handle.0) } == -1 {
            return Err(os_error(&self.name, io::Error::last_os_error()))
        }
        trace!("posted semaphore {}", self.name);
        Ok(())
    }

    fn close(self) -> Result<()> {
        let PosixSemaphore { handle, name } = self;
        handle.close().map_err(|error| os_error(&name, error))
    }

    fn unlink(name: &str) -> Result<()> {
        let path = c_name(name)?;
        // SAFETY: `path` is NUL-terminated.
        if unsafe { libc::sem_unlink(path.as_ptr()) } == -1 {
            return Err(name_error(name, io::Error::last_os_error()))
        }
        Ok(())
    }
}

impl PosixSemaphore {
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn timed_wait(&self, timeout: Duration) -> Result<bool> {
        let deadline = realtime_deadline(timeout)?;
        loop {
            // SAFETY: The handle is open for the lifetime of `self`.
            if unsafe { libc::sem_timedwait(self.handle.0, &deadline) } == 0 {
                return Ok(true)
            }
            let error = io::Error::last_os_error();
            match error.raw_os_error() {
                // the deadline is absolute, so retrying waits only for the remaining time
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(os_error(&self.name, error)),
            }
        }
    }

    // Darwin has no `sem_timedwait`; poll with `sem_trywait` until the deadline.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn timed_wait(&self, timeout: Duration) -> Result<bool> {
        const POLL_INTERVAL: Duration = Duration::from_millis(1);

        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return <Self as super::SemaphoreDriver>::wait(self, None)
        };
        loop {
            // SAFETY: The handle is open for the lifetime of `self`.
            if unsafe { libc::sem_trywait(self.handle.0) } == 0 {
                return Ok(true)
            }
            let error = io::Error::last_os_error();
            match error.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => (),
                _ => return Err(os_error(&self.name, error)),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false)
            }
            std::thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }
}

#[derive(Debug)]
struct Fd(c_int);

impl Fd {
    fn shm_open(name: &str, path: &CString, flags: c_int) -> Result<Fd> {
        // SAFETY: `path` is NUL-terminated.
        let fd = unsafe { libc::shm_open(path.as_ptr(), flags, 0o666 as libc::c_uint) };
        if fd == -1 {
            Err(name_error(name, io::Error::last_os_error()))
        } else {
            Ok(Fd(fd))
        }
    }

    fn set_len(&self, len: usize) -> io::Result<()> {
        // SAFETY: `ftruncate` only operates on the descriptor.
        if unsafe { libc::ftruncate(self.0, len as libc::off_t) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn len(&self) -> io::Result<usize> {
        // SAFETY: `stat` is a plain C struct for which all-zero is a valid value.
        let mut stat: libc::stat = unsafe { mem::zeroed() };
        // SAFETY: `stat` is a valid, writable `stat` struct.
        if unsafe { libc::fstat(self.0, &mut stat) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(stat.st_size as usize)
        }
    }

    fn map(&self, len: usize) -> io::Result<*mut u8> {
        // SAFETY: A fresh shared mapping of the whole object is requested; the kernel picks the
        // address.
        let ptr = unsafe {
            libc::mmap(ptr::null_mut(), len, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED,
                self.0, 0)
        };
        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as *mut u8)
        }
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        // SAFETY: The descriptor is owned and closed exactly once.
        if unsafe { libc::close(self.0) } == -1 {
            warn!("error closing fd: {}", io::Error::last_os_error())
        }
    }
}

/// A POSIX shared memory object (`shm_open`) mapped read-write.
#[derive(Debug)]
pub struct PosixSharedMemory {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: The mapping is owned by this value and unmapped only on drop.
unsafe impl Send for PosixSharedMemory {}

impl PosixSharedMemory {
    fn map(name: &str, fd: &Fd, len: usize) -> Result<PosixSharedMemory> {
        let ptr = fd.map(len).map_err(|error| os_error(name, error))?;
        trace!("mapped {name} ({len} bytes) at {ptr:?}");
        Ok(PosixSharedMemory { ptr, len })
    }
}

impl super::SharedMemoryDriver for PosixSharedMemory {
    fn create(name: &str, len: usize) -> Result<PosixSharedMemory> {
        if len == 0 {
            return Err(Error::InvalidParameter(format!("shared memory {name} must not be empty")))
        }
        let path = c_name(name)?;
        match Self::unlink(name) {
            Ok(()) | Err(Error::DoesNotExist(_)) => (),
            Err(error) => return Err(error),
        }
        let fd = Fd::shm_open(name, &path, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;
        fd.set_len(len).map_err(|error| os_error(name, error))?;
        Self::map(name, &fd, len)
    }

    fn open(name: &str) -> Result<PosixSharedMemory> {
        let path = c_name(name)?;
        let fd = Fd::shm_open(name, &path, libc::O_RDWR)?;
        let len = fd.len().map_err(|error| os_error(name, error))?;
        if len == 0 {
            return Err(Error::DoesNotExist(name.to_owned()))
        }
        Self::map(name, &fd, len)
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn unlink(name: &str) -> Result<()> {
        let path = c_name(name)?;
        // SAFETY: `path` is NUL-terminated.
        if unsafe { libc::shm_unlink(path.as_ptr()) } == -1 {
            return Err(name_error(name, io::Error::last_os_error()))
        }
        Ok(())
    }
}

impl Drop for PosixSharedMemory {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `len` describe a mapping created by `mmap` and unmapped only here.
        if unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) } == -1 {
            warn!("error unmapping shared memory: {}", io::Error::last_os_error())
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;
    use super::*;
    use crate::sys::{SemaphoreDriver, SharedMemoryDriver};

    fn unique_name(test: &str) -> String {
        // short enough for the 31 byte limit of Darwin
        format!("/ts{}.{}", std::process::id(), test)
    }

    #[test]
    fn test_errno_mapping() {
        let einval = || io::Error::from_raw_os_error(libc::EINVAL);
        assert!(matches!(name_error("/ts", einval()), Error::InvalidName(_)));
        assert!(matches!(os_error("/ts", einval()), Error::Io(_)));
        let enoent = || io::Error::from_raw_os_error(libc::ENOENT);
        assert!(matches!(name_error("/ts", enoent()), Error::DoesNotExist(_)));
        assert!(matches!(os_error("/ts", enoent()), Error::DoesNotExist(_)));
    }

    #[test]
    fn test_timed_wait_is_woken() {
        let name = unique_name("posix-woken");
        let consumer = PosixSemaphore::create_or_open(&name).unwrap();
        let producer = PosixSemaphore::create_or_open(&name).unwrap();
        let started = Instant::now();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                producer.release().unwrap();
            });
            assert!(consumer.wait(Some(Duration::from_secs(5))).unwrap());
        });
        assert!(started.elapsed() < Duration::from_secs(5));
        PosixSemaphore::unlink(&name).unwrap();
    }

    #[test]
    fn test_semaphore_counts() {
        let name = unique_name("posix-count");
        let first = PosixSemaphore::create_or_open(&name).unwrap();
        let second = PosixSemaphore::create_or_open(&name).unwrap();
        first.release().unwrap();
        first.release().unwrap();
        assert!(second.wait(Some(Duration::ZERO)).unwrap());
        assert!(second.wait(None).unwrap());
        assert!(!second.wait(Some(Duration::ZERO)).unwrap());
        PosixSemaphore::unlink(&name).unwrap();
        assert!(matches!(PosixSemaphore::unlink(&name), Err(Error::DoesNotExist(_))));
        first.close().unwrap();
        second.close().unwrap();
    }

    #[test]
    fn test_semaphore_timeout() {
        let name = unique_name("posix-timeout");
        let sem = PosixSemaphore::create_or_open(&name).unwrap();
        let started = Instant::now();
        assert!(!sem.wait(Some(Duration::from_millis(50))).unwrap());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(1000));
        PosixSemaphore::unlink(&name).unwrap();
    }

    #[test]
    fn test_shared_memory_is_shared() {
        let name = unique_name("posix-shm");
        let writer = PosixSharedMemory::create(&name, 4096).unwrap();
        let reader = PosixSharedMemory::open(&name).unwrap();
        assert!(reader.len() >= 4096);
        assert_eq!(writer.as_ptr() as usize % 64, 0);
        // SAFETY: Both mappings are at least 4096 bytes long.
        unsafe {
            assert_eq!(*reader.as_ptr().add(100), 0);
            *writer.as_ptr().add(100) = 0xa5;
            assert_eq!(*reader.as_ptr().add(100), 0xa5);
        }
        PosixSharedMemory::unlink(&name).unwrap();
        assert!(matches!(PosixSharedMemory::open(&name), Err(Error::DoesNotExist(_))));
    }
}

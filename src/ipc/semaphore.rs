use super::IpcError;
use std::ffi::CString;
use std::io;
use tracing::{debug, warn};

/// POSIX named semaphore owned by the creating process
///
/// The handle stays valid in a forked child, which may `wait`/`post` on it
/// but must leave `destroy` to the creator. `destroy` closes and unlinks
/// the name and is safe to call more than once; `Drop` calls it.
pub struct NamedSemaphore {
    name: String,
    c_name: CString,
    handle: *mut libc::sem_t,
    unlinked: bool,
}

// SAFETY: sem_t operations are thread-safe by POSIX; the handle is only
// invalidated by `destroy`, which takes `&mut self`.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create `name` with an initial count, replacing a stale semaphore
    /// left behind by a crashed run
    pub fn create(name: &str, initial: u32) -> Result<Self, IpcError> {
        let c_name = CString::new(name).map_err(|_| IpcError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string for both calls.
        let handle = unsafe {
            libc::sem_unlink(c_name.as_ptr());
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };

        if handle == libc::SEM_FAILED {
            return Err(IpcError::Semaphore {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        debug!("Created semaphore {} with count {}", name, initial);
        Ok(Self {
            name: name.to_string(),
            c_name,
            handle,
            unlinked: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the count is positive, retrying on signal interruption
    pub fn wait(&self) -> io::Result<()> {
        if self.handle.is_null() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "semaphore destroyed"));
        }
        loop {
            // SAFETY: handle came from a successful sem_open and is not closed.
            if unsafe { libc::sem_wait(self.handle) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub fn post(&self) -> io::Result<()> {
        if self.handle.is_null() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "semaphore destroyed"));
        }
        // SAFETY: handle came from a successful sem_open and is not closed.
        if unsafe { libc::sem_post(self.handle) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Close the handle and remove the name
    pub fn destroy(&mut self) {
        if !self.handle.is_null() {
            // SAFETY: closed exactly once; the pointer is cleared below.
            if unsafe { libc::sem_close(self.handle) } != 0 {
                warn!("Failed to close semaphore {}: {}", self.name, io::Error::last_os_error());
            }
            self.handle = std::ptr::null_mut();
        }
        if !self.unlinked {
            // SAFETY: c_name is a valid NUL-terminated string.
            if unsafe { libc::sem_unlink(self.c_name.as_ptr()) } != 0 {
                debug!("Failed to unlink semaphore {}: {}", self.name, io::Error::last_os_error());
            }
            self.unlinked = true;
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::posix_resource_name;

    #[test]
    fn test_post_then_wait() {
        let sem = NamedSemaphore::create(&posix_resource_name("test"), 0).unwrap();
        sem.post().unwrap();
        sem.wait().unwrap();
    }

    #[test]
    fn test_initial_count() {
        let sem = NamedSemaphore::create(&posix_resource_name("test"), 2).unwrap();
        sem.wait().unwrap();
        sem.wait().unwrap();
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut sem = NamedSemaphore::create(&posix_resource_name("test"), 1).unwrap();
        sem.destroy();
        sem.destroy();
        assert!(sem.wait().is_err());
        assert!(sem.post().is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_name_is_removed_on_drop() {
        let name = posix_resource_name("test");
        let path = std::path::Path::new("/dev/shm").join(format!("sem.{}", name.trim_start_matches('/')));
        {
            let _sem = NamedSemaphore::create(&name, 0).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_wakes_waiter_in_other_thread() {
        let sem = NamedSemaphore::create(&posix_resource_name("test"), 0).unwrap();
        std::thread::scope(|s| {
            let waiter = s.spawn(|| sem.wait());
            std::thread::sleep(std::time::Duration::from_millis(10));
            sem.post().unwrap();
            waiter.join().unwrap().unwrap();
        });
    }
}

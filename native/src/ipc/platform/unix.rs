// POSIX shared memory and named semaphores.

use log::warn;
use std::ffi::CString;
use std::io;
use std::ptr;
use std::time::Duration;

/// POSIX object names need a leading slash and no other slashes.
fn object_name(name: &str) -> io::Result<CString> {
    if name.is_empty() || name.contains('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid object name '{}'", name),
        ));
    }
    CString::new(format!("/{}", name))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "object name contains NUL"))
}

/// A memory-mapped region shared by name.
pub struct SharedRegion {
    ptr: *mut u8,
    len: usize,
    name: CString,
    owner: bool,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a zero-filled region, replacing any stale one with the same name.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let c_name = object_name(name)?;

        unsafe {
            libc::shm_unlink(c_name.as_ptr());

            let fd = libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            );
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            if libc::ftruncate(fd, len as libc::off_t) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
                return Err(err);
            }

            match map_fd(fd, len) {
                Ok(ptr) => Ok(Self {
                    ptr,
                    len,
                    name: c_name,
                    owner: true,
                }),
                Err(err) => {
                    libc::shm_unlink(c_name.as_ptr());
                    Err(err)
                }
            }
        }
    }

    /// Attach to an existing region of at least `len` bytes.
    pub fn open(name: &str, len: usize) -> io::Result<Self> {
        let c_name = object_name(name)?;

        unsafe {
            let fd = libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0 as libc::mode_t);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            if (stat.st_size as u64) < len as u64 {
                libc::close(fd);
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("region is {} bytes, expected {}", stat.st_size, len),
                ));
            }

            let ptr = map_fd(fd, len)?;
            Ok(Self {
                ptr,
                len,
                name: c_name,
                owner: false,
            })
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Map `fd` read-write and close it.
unsafe fn map_fd(fd: libc::c_int, len: usize) -> io::Result<*mut u8> {
    let ptr = libc::mmap(
        ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        fd,
        0,
    );
    let err = io::Error::last_os_error();
    libc::close(fd);
    if ptr == libc::MAP_FAILED {
        return Err(err);
    }
    Ok(ptr as *mut u8)
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
extern "C" {
    // glibc 2.30+
    fn sem_clockwait(
        sem: *mut libc::sem_t,
        clock: libc::clockid_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
}

/// Clock the semaphore deadline is measured against.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

/// `sem_timedwait` only takes wall-clock deadlines, so a clock step here
/// stretches or shortens the wait.
#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    not(target_env = "gnu")
))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
unsafe fn timed_wait(sem: *mut libc::sem_t, deadline: &libc::timespec) -> libc::c_int {
    sem_clockwait(sem, WAIT_CLOCK, deadline)
}

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    not(target_env = "gnu")
))]
unsafe fn timed_wait(sem: *mut libc::sem_t, deadline: &libc::timespec) -> libc::c_int {
    libc::sem_timedwait(sem, deadline)
}

/// Absolute `clock` time `timeout` from now.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn deadline_after(clock: libc::clockid_t, timeout: Duration) -> io::Result<libc::timespec> {
    unsafe {
        let mut now: libc::timespec = std::mem::zeroed();
        if libc::clock_gettime(clock, &mut now) != 0 {
            return Err(io::Error::last_os_error());
        }
        let total_nanos = now.tv_nsec as u128 + timeout.subsec_nanos() as u128;
        let mut deadline: libc::timespec = std::mem::zeroed();
        deadline.tv_sec = now.tv_sec
            + timeout.as_secs() as libc::time_t
            + (total_nanos / 1_000_000_000) as libc::time_t;
        deadline.tv_nsec = (total_nanos % 1_000_000_000) as _;
        Ok(deadline)
    }
}

/// Named semaphore handle shared by the mutex and event wrappers.
struct Semaphore {
    sem: *mut libc::sem_t,
    name: CString,
    owner: bool,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    fn create(name: &str, initial: u32) -> io::Result<Self> {
        let c_name = object_name(name)?;
        unsafe {
            libc::sem_unlink(c_name.as_ptr());
            let sem = libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            );
            if sem == libc::SEM_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                sem,
                name: c_name,
                owner: true,
            })
        }
    }

    fn open(name: &str) -> io::Result<Self> {
        let c_name = object_name(name)?;
        unsafe {
            let sem = libc::sem_open(c_name.as_ptr(), 0);
            if sem == libc::SEM_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                sem,
                name: c_name,
                owner: false,
            })
        }
    }

    fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn value(&self) -> io::Result<i32> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem, &mut value) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value)
    }

    /// Decrement within `timeout`. `Ok(false)` means the wait timed out.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = deadline_after(WAIT_CLOCK, timeout)?;
        loop {
            if unsafe { timed_wait(self.sem, &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    /// Platforms without `sem_timedwait` poll instead.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                _ => return Err(err),
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
            if self.owner {
                libc::sem_unlink(self.name.as_ptr());
            }
        }
    }
}

/// Cross-process mutex backed by a binary semaphore.
pub struct NamedMutex {
    sem: Semaphore,
}

impl NamedMutex {
    pub fn create(name: &str) -> io::Result<Self> {
        Ok(Self {
            sem: Semaphore::create(name, 1)?,
        })
    }

    pub fn open(name: &str) -> io::Result<Self> {
        Ok(Self {
            sem: Semaphore::open(name)?,
        })
    }

    /// Acquire within `timeout`. `Ok(None)` means another holder kept it.
    pub fn lock(&self, timeout: Duration) -> io::Result<Option<NamedMutexGuard<'_>>> {
        if self.sem.wait(timeout)? {
            Ok(Some(NamedMutexGuard { mutex: self }))
        } else {
            Ok(None)
        }
    }
}

pub struct NamedMutexGuard<'a> {
    mutex: &'a NamedMutex,
}

impl Drop for NamedMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.sem.post() {
            warn!("[SHM] Failed to release mutex: {}", e);
        }
    }
}

/// Auto-reset event: at most one pending wake, consumed by a single waiter.
pub struct NamedEvent {
    sem: Semaphore,
}

impl NamedEvent {
    pub fn create(name: &str) -> io::Result<Self> {
        Ok(Self {
            sem: Semaphore::create(name, 0)?,
        })
    }

    pub fn open(name: &str) -> io::Result<Self> {
        Ok(Self {
            sem: Semaphore::open(name)?,
        })
    }

    pub fn set(&self) -> io::Result<()> {
        if self.sem.value()? > 0 {
            return Ok(());
        }
        self.sem.post()
    }

    /// `Ok(true)` if signalled within `timeout`.
    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        self.sem.wait(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_are_checked() {
        assert!(object_name("").is_err());
        assert!(object_name("a/b").is_err());
        assert_eq!(object_name("abc").unwrap().as_bytes(), b"/abc");
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn deadline_carries_nanoseconds_into_seconds() {
        let mut now: libc::timespec = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { libc::clock_gettime(WAIT_CLOCK, &mut now) }, 0);

        let deadline = deadline_after(WAIT_CLOCK, Duration::new(2, 999_999_999)).unwrap();
        assert!(deadline.tv_nsec >= 0 && deadline.tv_nsec < 1_000_000_000);
        assert!(deadline.tv_sec >= now.tv_sec + 2 && deadline.tv_sec <= now.tv_sec + 4);
    }

    #[test]
    fn semaphore_wait_times_out_then_succeeds() {
        let name = format!("semwait{}", uuid::Uuid::new_v4().simple());
        let sem = Semaphore::create(&name, 0).unwrap();

        let started = std::time::Instant::now();
        assert!(!sem.wait(Duration::from_millis(50)).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(45));

        sem.post().unwrap();
        assert!(sem.wait(Duration::from_millis(50)).unwrap());
    }

    #[test]
    fn overlong_name_fails_to_create() {
        let name = "x".repeat(400);
        assert!(SharedRegion::create(&name, 4096).is_err());
        assert!(NamedMutex::create(&name).is_err());
    }
}

// Win32 file mappings, mutexes and auto-reset events.

use log::warn;
use std::ffi::OsStr;
use std::io;
use std::marker::PhantomData;
use std::time::Duration;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE, INVALID_HANDLE_VALUE, WAIT_ABANDONED,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};
use windows::Win32::System::Threading::{
    CreateEventW, CreateMutexW, OpenEventW, OpenMutexW, ReleaseMutex, SetEvent,
    WaitForSingleObject, EVENT_MODIFY_STATE, MUTEX_ALL_ACCESS, SYNCHRONIZATION_SYNCHRONIZE,
};

fn to_wide(s: &str) -> Vec<u16> {
    use std::iter::once;
    use std::os::windows::ffi::OsStrExt;

    OsStr::new(s).encode_wide().chain(once(0)).collect()
}

fn to_io(err: windows::core::Error) -> io::Error {
    io::Error::other(err)
}

fn wait_millis(timeout: Duration) -> u32 {
    // u32::MAX is INFINITE; keep every wait bounded.
    timeout.as_millis().min((u32::MAX - 1) as u128) as u32
}

struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            if !self.0.is_invalid() {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// A file mapping shared by name.
pub struct SharedRegion {
    _mapping: OwnedHandle,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    len: usize,
}

unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a zero-filled, page-file backed mapping.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let wide = to_wide(name);
        unsafe {
            let handle = CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                (len as u64 >> 32) as u32,
                len as u32,
                PCWSTR(wide.as_ptr()),
            )
            .map_err(to_io)?;
            if GetLastError() == ERROR_ALREADY_EXISTS {
                warn!("[SHM] Mapping '{}' already existed, reusing it", name);
            }
            Self::map(OwnedHandle(handle), len)
        }
    }

    pub fn open(name: &str, len: usize) -> io::Result<Self> {
        let wide = to_wide(name);
        unsafe {
            let handle = OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, PCWSTR(wide.as_ptr()))
                .map_err(to_io)?;
            Self::map(OwnedHandle(handle), len)
        }
    }

    unsafe fn map(mapping: OwnedHandle, len: usize) -> io::Result<Self> {
        let view = MapViewOfFile(mapping.0, FILE_MAP_ALL_ACCESS, 0, 0, len);
        if view.Value.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            _mapping: mapping,
            view,
            len,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.view.Value as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
        }
    }
}

pub struct NamedMutex {
    handle: OwnedHandle,
}

unsafe impl Send for NamedMutex {}
unsafe impl Sync for NamedMutex {}

impl NamedMutex {
    pub fn create(name: &str) -> io::Result<Self> {
        let wide = to_wide(name);
        unsafe {
            let handle =
                CreateMutexW(None, false.into(), PCWSTR(wide.as_ptr())).map_err(to_io)?;
            Ok(Self {
                handle: OwnedHandle(handle),
            })
        }
    }

    pub fn open(name: &str) -> io::Result<Self> {
        let wide = to_wide(name);
        unsafe {
            let handle =
                OpenMutexW(MUTEX_ALL_ACCESS, false, PCWSTR(wide.as_ptr())).map_err(to_io)?;
            Ok(Self {
                handle: OwnedHandle(handle),
            })
        }
    }

    /// Acquire within `timeout`. `Ok(None)` means another holder kept it.
    pub fn lock(&self, timeout: Duration) -> io::Result<Option<NamedMutexGuard<'_>>> {
        let result = unsafe { WaitForSingleObject(self.handle.0, wait_millis(timeout)) };
        match result {
            WAIT_OBJECT_0 => Ok(Some(self.guard())),
            WAIT_ABANDONED => {
                warn!("[SHM] Mutex was abandoned by a dead holder; taking ownership");
                Ok(Some(self.guard()))
            }
            WAIT_TIMEOUT => Ok(None),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn guard(&self) -> NamedMutexGuard<'_> {
        NamedMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }
}

/// Win32 mutex ownership is per thread, so the guard stays on its thread.
pub struct NamedMutexGuard<'a> {
    mutex: &'a NamedMutex,
    _not_send: PhantomData<*const ()>,
}

impl Drop for NamedMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = ReleaseMutex(self.mutex.handle.0) {
                warn!("[SHM] Failed to release mutex: {}", e);
            }
        }
    }
}

/// Auto-reset event.
pub struct NamedEvent {
    handle: OwnedHandle,
}

unsafe impl Send for NamedEvent {}
unsafe impl Sync for NamedEvent {}

impl NamedEvent {
    pub fn create(name: &str) -> io::Result<Self> {
        let wide = to_wide(name);
        unsafe {
            let handle = CreateEventW(
                None,
                false.into(), // auto reset
                false.into(), // initially non-signaled
                PCWSTR(wide.as_ptr()),
            )
            .map_err(to_io)?;
            Ok(Self {
                handle: OwnedHandle(handle),
            })
        }
    }

    pub fn open(name: &str) -> io::Result<Self> {
        let wide = to_wide(name);
        unsafe {
            let handle = OpenEventW(
                SYNCHRONIZATION_SYNCHRONIZE | EVENT_MODIFY_STATE,
                false,
                PCWSTR(wide.as_ptr()),
            )
            .map_err(to_io)?;
            Ok(Self {
                handle: OwnedHandle(handle),
            })
        }
    }

    pub fn set(&self) -> io::Result<()> {
        unsafe { SetEvent(self.handle.0).map_err(to_io) }
    }

    /// `Ok(true)` if signalled within `timeout`.
    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let result = unsafe { WaitForSingleObject(self.handle.0, wait_millis(timeout)) };
        match result {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

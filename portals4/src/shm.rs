//! Thin wrappers over `shm_open`/`mmap` for the shared regions. The
//! creator truncates to the final size; openers poll until the region
//! reaches that size before mapping, since a partially grown file must
//! never be mapped.

use std::ffi::CString;
use std::time::Duration;

use log::warn;
use portals_types::{PtlError, Result};

use crate::params::params;

/// A mapped shared-memory region. Unmapped on drop; the backing name is
/// only unlinked by an explicit [`unlink`] call.
pub struct ShmRegion {
    base: *mut u8,
    len: usize,
}

// The region is plain shared bytes; all concurrent access goes through
// atomics placed into it by the users of this type.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

fn cname(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| PtlError::InvalidArg)
}

fn mmap_fd(fd: libc::c_int, len: usize) -> Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        warn!("mmap of {len} bytes failed (errno {})", errno());
        return Err(PtlError::NoSpace);
    }
    Ok(ptr.cast())
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl ShmRegion {
    /// Create the region, failing if a live one already exists under this
    /// name. Stale files from a crashed owner are removed first.
    pub fn create(name: &str, len: usize) -> Result<ShmRegion> {
        let cstr = cname(name)?;
        unsafe { libc::shm_unlink(cstr.as_ptr()) };
        let fd = unsafe {
            libc::shm_open(
                cstr.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
            )
        };
        if fd < 0 {
            warn!("shm_open({name}) failed (errno {})", errno());
            return Err(PtlError::NoSpace);
        }
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            warn!("ftruncate({name}, {len}) failed (errno {})", errno());
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cstr.as_ptr());
            }
            return Err(PtlError::NoSpace);
        }
        let base = mmap_fd(fd, len);
        unsafe { libc::close(fd) };
        // the mapping holds the region open from here on
        Ok(ShmRegion { base: base?, len })
    }

    /// Open a region another process creates, waiting for it to appear and
    /// to be grown to at least `len` bytes.
    pub fn open(name: &str, len: usize) -> Result<ShmRegion> {
        let cstr = cname(name)?;
        let tick = Duration::from_millis(100);

        let mut try_count = params().region_try_count;
        let fd = loop {
            let fd = unsafe {
                libc::shm_open(
                    cstr.as_ptr(),
                    libc::O_RDWR,
                    (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
                )
            };
            if fd >= 0 {
                break fd;
            }
            try_count -= 1;
            if try_count == 0 {
                warn!("shared region {name} never appeared");
                return Err(PtlError::Fail);
            }
            std::thread::sleep(tick);
        };

        let mut try_count = params().region_try_count;
        loop {
            let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
            if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
                unsafe { libc::close(fd) };
                return Err(PtlError::Fail);
            }
            if unsafe { stat.assume_init() }.st_size as usize >= len {
                break;
            }
            try_count -= 1;
            if try_count == 0 {
                warn!("shared region {name} never reached {len} bytes");
                unsafe { libc::close(fd) };
                return Err(PtlError::Fail);
            }
            std::thread::sleep(tick);
        }

        let base = mmap_fd(fd, len);
        unsafe { libc::close(fd) };
        Ok(ShmRegion { base: base?, len })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Reference a `T` placed at `offset`. The caller guarantees the slot
    /// was initialized by the region's creator and is within bounds.
    ///
    /// # Safety
    /// `offset` must be aligned for `T` and `offset + size_of::<T>()`
    /// must not exceed the region.
    pub unsafe fn at<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + std::mem::size_of::<T>() <= self.len);
        debug_assert_eq!(offset % std::mem::align_of::<T>(), 0);
        &*self.base.add(offset).cast()
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}

/// Remove the backing file. All ranks call this once everyone has mapped;
/// repeating it after a peer already unlinked is harmless.
pub fn unlink(name: &str) {
    if let Ok(cstr) = cname(name) {
        unsafe { libc::shm_unlink(cstr.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_share_bytes() {
        let name = format!("/portals4-test-shm-{}", std::process::id());
        let a = ShmRegion::create(&name, 4096).unwrap();
        let b = ShmRegion::open(&name, 4096).unwrap();
        unsafe {
            a.base().write(0xab);
            assert_eq!(b.base().read(), 0xab);
        }
        // distinct mappings of the same pages
        assert_ne!(a.base(), b.base());
        unlink(&name);
    }
}

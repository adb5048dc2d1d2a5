//! Linux mapping primitives.

use crate::error::{ShmError, ShmResult};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, mmap_anonymous, munmap};
use nix::unistd::getpid;
use rand::Rng;
use std::ffi::CString;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

fn last_os_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

/// Create an anonymous file descriptor, optionally backed by huge pages.
pub fn create_memfd(name: &str, huge_page: bool) -> ShmResult<OwnedFd> {
    let c_name = CString::new(name).map_err(|_| ShmError::CreateFailure {
        name: name.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "name contains NUL"),
    })?;

    let mut flags = libc::MFD_ALLOW_SEALING;
    if huge_page {
        flags |= libc::MFD_HUGETLB;
    }

    let fd = unsafe { libc::memfd_create(c_name.as_ptr(), flags) };
    if fd < 0 {
        return Err(ShmError::CreateFailure {
            name: name.to_string(),
            source: last_os_error(),
        });
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Extend a file to `size` bytes by seeking past the end and writing a
/// single byte (the POSIX-shm sizing idiom).
pub fn set_fd_size<F: AsFd>(fd: F, size: u64) -> std::io::Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    if unsafe { libc::lseek(raw, size as libc::off_t, libc::SEEK_SET) } < 0 {
        return Err(last_os_error());
    }
    let junk = 0u8;
    if unsafe { libc::write(raw, (&junk as *const u8).cast(), 1) } != 1 {
        return Err(last_os_error());
    }
    Ok(())
}

/// Size a file with ftruncate (the memfd sizing idiom).
pub fn ftruncate_fd<F: AsFd>(fd: F, size: u64) -> std::io::Result<()> {
    if unsafe { libc::ftruncate(fd.as_fd().as_raw_fd(), size as libc::off_t) } < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

/// Map `size` bytes of `fd` shared. When `hint_va` is nonzero the mapping
/// is placed exactly there (`MAP_FIXED`); otherwise the kernel chooses.
/// No partial success: on error nothing remains mapped.
pub fn map_shared<F: AsFd>(hint_va: u64, size: usize, fd: F) -> std::io::Result<NonNull<u8>> {
    let mut flags = MapFlags::MAP_SHARED;
    let addr = NonZeroUsize::new(hint_va as usize);
    if addr.is_some() {
        flags |= MapFlags::MAP_FIXED;
    }
    let len = NonZeroUsize::new(size)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "zero-length map"))?;

    let base = unsafe {
        mmap(
            addr,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            flags,
            fd,
            0,
        )
    }
    .map_err(std::io::Error::from)?;

    Ok(base.cast())
}

/// Anonymous private mapping of `size` bytes.
pub fn map_anonymous(size: usize) -> std::io::Result<NonNull<u8>> {
    let len = NonZeroUsize::new(size)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "zero-length map"))?;

    let base = unsafe {
        mmap_anonymous(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )
    }
    .map_err(std::io::Error::from)?;

    Ok(base.cast())
}

/// Unmap a region previously returned by [`map_shared`] or
/// [`map_anonymous`].
pub fn unmap(base: NonNull<u8>, size: usize) {
    if let Err(err) = unsafe { munmap(base.cast(), size) } {
        tracing::warn!(?err, "munmap failed");
    }
}

/// Page size of the object behind `fd` (huge-page memfds report their
/// huge page size here).
pub fn fd_page_size<F: AsFd>(fd: F) -> std::io::Result<usize> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_fd().as_raw_fd(), &mut st) } < 0 {
        return Err(last_os_error());
    }
    Ok(st.st_blksize as usize)
}

/// log2 of the page size behind `fd`. Returns an error if the reported
/// block size is not a power of two.
pub fn fd_log2_page_size<F: AsFd>(fd: F) -> std::io::Result<u32> {
    let page = fd_page_size(fd)?;
    if page == 0 || !page.is_power_of_two() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "cannot determine fd page size",
        ));
    }
    Ok(page.trailing_zeros())
}

/// Current byte size of the object behind `fd`.
pub fn fd_size<F: AsFd>(fd: F) -> std::io::Result<u64> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_fd().as_raw_fd(), &mut st) } < 0 {
        return Err(last_os_error());
    }
    Ok(st.st_size as u64)
}

/// System page size.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Round `size` up to a whole number of pages of `page` bytes.
pub fn round_to_page(size: usize, page: usize) -> usize {
    debug_assert!(page.is_power_of_two());
    (size + page - 1) & !(page - 1)
}

/// Perturb a requested map address by a small random number of pages,
/// keeping page alignment. Spreads segments across the address space so
/// unrelated runs do not pile onto one hint.
pub fn randomize_va(va: &mut u64, log2_page_size: u32) {
    let pages: u64 = rand::thread_rng().gen_range(0..16);
    *va += pages << log2_page_size;
}

/// Current process ID.
pub fn get_current_pid() -> i32 {
    getpid().as_raw()
}

/// Check if a process is alive using a null signal.
pub fn is_process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Ok(_) => true,
        Err(nix::Error::EPERM) => true, // exists, not signalable by us
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_sane() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn test_round_to_page() {
        assert_eq!(round_to_page(1, 4096), 4096);
        assert_eq!(round_to_page(4096, 4096), 4096);
        assert_eq!(round_to_page(4097, 4096), 8192);
    }

    #[test]
    fn test_memfd_create_and_size() {
        let fd = create_memfd("fastpath-test", false).unwrap();
        ftruncate_fd(&fd, 1 << 20).unwrap();
        assert_eq!(fd_size(&fd).unwrap(), 1 << 20);
        let page = fd_page_size(&fd).unwrap();
        assert_eq!(1usize << fd_log2_page_size(&fd).unwrap(), page);
    }

    #[test]
    fn test_anonymous_map_round_trip() {
        let base = map_anonymous(8192).unwrap();
        unsafe {
            base.as_ptr().write(0xAB);
            assert_eq!(base.as_ptr().read(), 0xAB);
        }
        unmap(base, 8192);
    }

    #[test]
    fn test_randomize_va_keeps_alignment() {
        let mut va = 0x2000_0000_0000u64;
        randomize_va(&mut va, 12);
        assert_eq!(va & 0xFFF, 0);
        assert!(va >= 0x2000_0000_0000);
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(get_current_pid()));
        assert!(!is_process_alive(i32::MAX - 1));
    }
}

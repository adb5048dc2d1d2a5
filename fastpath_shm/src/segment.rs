//! Segment lifecycle: create, attach, destroy.
//!
//! A segment is a named fixed-size region mapped into two cooperating
//! processes at the same virtual address. The creator maps it, formats
//! the page-zero header and the embedded heap, and publishes readiness;
//! the attacher probes the header through a one-page mapping, then
//! re-maps the whole segment at the creator's recorded address so that
//! every pointer written on either side stays valid on both.
//!
//! Three backings are supported behind one handle type, dispatched by
//! the tag persisted in the shared header: POSIX shm objects, anonymous
//! memfds (transferable over a socket), and process-private mappings.

use crate::error::{ShmError, ShmResult};
use crate::header::SharedHeader;
use crate::heap::SharedHeap;
use crate::platform;
use fastpath_common::{NO_BASE_VA, SEG_MAX_SIZE, SEG_MIN_SIZE, SegmentType};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::time::Duration;

fn nix_io(err: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(err as i32)
}

/// Validate segment size constraints before any resource is created.
fn validate_segment_size(name: &str, size: u64) -> ShmResult<()> {
    if size == 0 {
        return Err(ShmError::NoSize {
            name: name.to_string(),
        });
    }
    if size < SEG_MIN_SIZE as u64 || size > SEG_MAX_SIZE as u64 {
        return Err(ShmError::InvalidSize { size });
    }
    Ok(())
}

/// Parameters for creating or attaching a segment.
pub struct SegmentConfig {
    /// Segment name; for shm segments this names `/dev/shm/<name>`.
    pub name: String,
    /// Requested size in bytes. Must be nonzero.
    pub size: u64,
    /// Map-address hint. Zero lets the kernel choose; nonzero requests
    /// fixed placement (the creator additionally randomizes low
    /// page-granular bits).
    pub requested_va: u64,
    /// Attach countdown in seconds; each failed poll sleeps one second.
    pub attach_timeout_secs: u32,
    /// Back a memfd segment with huge pages.
    pub huge_page: bool,
    /// Optional uid/gid to chown shm backing files to.
    pub owner: Option<(u32, u32)>,
    /// Inherited fd for memfd attach paths.
    pub fd: Option<OwnedFd>,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            size: 0,
            requested_va: 0,
            attach_timeout_secs: 5,
            huge_page: false,
            owner: None,
            fd: None,
        }
    }
}

impl SegmentConfig {
    /// Convenience constructor for the common name+size case.
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            size,
            ..Default::default()
        }
    }
}

/// Per-process handle to a mapped segment.
#[derive(Debug)]
pub struct Segment {
    name: String,
    seg_type: SegmentType,
    base: NonNull<SharedHeader>,
    map_size: usize,
    is_server: bool,
    my_pid: i32,
    /// Retained for memfd segments: the server must be able to hand the
    /// fd over an out-of-band channel, and teardown closes it.
    fd: Option<OwnedFd>,
    destroyed: bool,
}

// The handle owns its view of the mapping; the shared state behind it is
// governed by the header/FIFO publication protocols.
unsafe impl Send for Segment {}

impl Segment {
    /// Create a segment (server role), dispatched on `seg_type`.
    ///
    /// On return `ready` is still unset: the caller performs whatever
    /// heap-dependent setup it needs, then calls [`Segment::publish_ready`].
    pub fn create(cfg: SegmentConfig, seg_type: SegmentType) -> ShmResult<Self> {
        match seg_type {
            SegmentType::Shm => Self::create_shm(cfg),
            SegmentType::Memfd => Self::create_memfd(cfg),
            SegmentType::Private => Self::create_private(cfg),
        }
    }

    /// Attach to a segment created by another process (client role).
    pub fn attach(cfg: SegmentConfig, seg_type: SegmentType) -> ShmResult<Self> {
        match seg_type {
            SegmentType::Shm => Self::attach_shm(cfg),
            SegmentType::Memfd => Self::attach_memfd(cfg),
            SegmentType::Private => {
                tracing::error!(name = %cfg.name, "attach requested on a private segment");
                Err(ShmError::ServerOnly { name: cfg.name })
            }
        }
    }

    fn create_shm(cfg: SegmentConfig) -> ShmResult<Self> {
        let name = cfg.name;
        validate_segment_size(&name, cfg.size)?;

        let my_pid = platform::get_current_pid();
        tracing::debug!(pid = my_pid, name = %name, size = cfg.size, "creating shm segment");

        // Clear any stale backing file from a previous run.
        let _ = shm_unlink(name.as_str());

        let fd = shm_open(
            name.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::from_bits_truncate(0o777),
        )
        .map_err(|e| {
            tracing::warn!(name = %name, err = %e, "shm_open failed");
            ShmError::CreateFailure {
                name: name.clone(),
                source: nix_io(e),
            }
        })?;

        if unsafe { libc::fchmod(fd.as_raw_fd(), 0o660) } < 0 {
            tracing::warn!(name = %name, "segment chmod failed");
        }
        if let Some((uid, gid)) = cfg.owner {
            if unsafe { libc::fchown(fd.as_raw_fd(), uid, gid) } < 0 {
                tracing::warn!(name = %name, uid, gid, "segment chown failed");
            }
        }

        platform::set_fd_size(&fd, cfg.size).map_err(|source| {
            tracing::warn!(name = %name, err = %source, "sizing shm backing file failed");
            ShmError::SetSize {
                name: name.clone(),
                source,
            }
        })?;

        let page_size = platform::fd_page_size(&fd).map_err(|source| ShmError::CreateFailure {
            name: name.clone(),
            source,
        })?;

        let mut requested_va = cfg.requested_va;
        if requested_va != 0 {
            platform::randomize_va(&mut requested_va, page_size.trailing_zeros());
        }

        let base = platform::map_shared(requested_va, cfg.size as usize, &fd).map_err(
            |source| {
                tracing::warn!(name = %name, err = %source, "shm segment mmap failed");
                ShmError::Mmap {
                    name: name.clone(),
                    source,
                }
            },
        )?;
        drop(fd); // the mapping keeps the object alive

        Self::format(base, SegmentType::Shm, &name, cfg.size, page_size, my_pid).map(|()| Self {
            name,
            seg_type: SegmentType::Shm,
            base: base.cast(),
            map_size: cfg.size as usize,
            is_server: true,
            my_pid,
            fd: None,
            destroyed: false,
        })
    }

    fn attach_shm(cfg: SegmentConfig) -> ShmResult<Self> {
        let name = cfg.name;
        let my_pid = platform::get_current_pid();
        let mut countdown = cfg.attach_timeout_secs;
        let page_size = platform::page_size();

        // Phase 1: wait for the backing file to exist and have a size.
        // The countdown gates every attempt: a zero timeout returns
        // before anything is opened or mapped.
        let mut fd_opt: Option<OwnedFd> = None;
        let fd = loop {
            if countdown == 0 {
                tracing::warn!(name = %name, "client attach timed out waiting for segment");
                return Err(ShmError::ClientTimeout { name });
            }
            countdown -= 1;

            if fd_opt.is_none() {
                fd_opt =
                    shm_open(name.as_str(), OFlag::O_RDWR, Mode::from_bits_truncate(0o777)).ok();
            }
            let sized = fd_opt
                .as_ref()
                .is_some_and(|fd| matches!(platform::fd_size(fd), Ok(sz) if sz > 0));
            if sized {
                break fd_opt.take().unwrap();
            }
            std::thread::sleep(Duration::from_secs(1));
        };

        // Phase 2: probe the header through a one-page mapping.
        let probe = platform::map_shared(0, page_size, &fd).map_err(|source| {
            tracing::warn!(name = %name, err = %source, "client probe mmap failed");
            ShmError::Mmap {
                name: name.clone(),
                source,
            }
        })?;
        let header: &SharedHeader = unsafe { probe.cast().as_ref() };

        loop {
            if countdown == 0 {
                platform::unmap(probe, page_size);
                tracing::warn!(name = %name, "client attach timed out waiting for readiness");
                return Err(ShmError::ClientTimeout { name });
            }
            countdown -= 1;

            if header.is_ready() {
                break;
            }

            // A creator that died before publishing readiness can never
            // complete the handshake; give up ahead of the countdown.
            let server_pid = header.server_pid();
            if server_pid > 0 && !platform::is_process_alive(server_pid) {
                platform::unmap(probe, page_size);
                tracing::warn!(
                    name = %name,
                    server_pid,
                    "segment creator died before publishing readiness"
                );
                return Err(ShmError::ClientTimeout { name });
            }
            std::thread::sleep(Duration::from_secs(1));
        }

        let base_va = header.base_va();
        let size = header.size();
        platform::unmap(probe, page_size);

        // Phase 3: re-map the whole segment at the creator's anchor.
        let base = platform::map_shared(base_va, size as usize, &fd).map_err(|source| {
            tracing::warn!(name = %name, err = %source, "client final mmap failed");
            ShmError::Mmap {
                name: name.clone(),
                source,
            }
        })?;
        drop(fd);

        let seg = Self {
            name,
            seg_type: SegmentType::Shm,
            base: base.cast(),
            map_size: size as usize,
            is_server: false,
            my_pid,
            fd: None,
            destroyed: false,
        };
        seg.header().set_client_pid(my_pid);
        tracing::debug!(pid = my_pid, name = %seg.name, base_va, "attached shm segment");
        Ok(seg)
    }

    fn create_memfd(cfg: SegmentConfig) -> ShmResult<Self> {
        let name = cfg.name;
        validate_segment_size(&name, cfg.size)?;

        let my_pid = platform::get_current_pid();
        let fd = platform::create_memfd(&name, cfg.huge_page)?;

        let log2_page = platform::fd_log2_page_size(&fd).map_err(|source| {
            tracing::warn!(name = %name, err = %source, "cannot determine memfd page size");
            ShmError::CreateFailure {
                name: name.clone(),
                source,
            }
        })?;
        let fd_page = 1u64 << log2_page;
        let n_pages = (cfg.size - 1) / fd_page + 1;

        platform::ftruncate_fd(&fd, n_pages * fd_page).map_err(|source| {
            tracing::warn!(name = %name, err = %source, "memfd ftruncate failed");
            ShmError::SetSize {
                name: name.clone(),
                source,
            }
        })?;

        let base =
            platform::map_shared(cfg.requested_va, cfg.size as usize, &fd).map_err(|source| {
                tracing::warn!(name = %name, err = %source, "memfd segment mmap failed");
                ShmError::Mmap {
                    name: name.clone(),
                    source,
                }
            })?;

        // The heap starts one system page in regardless of the fd's own
        // page size; the header only ever occupies the first 4K.
        let page_size = platform::page_size();
        Self::format(base, SegmentType::Memfd, &name, cfg.size, page_size, my_pid).map(|()| {
            Self {
                name,
                seg_type: SegmentType::Memfd,
                base: base.cast(),
                map_size: cfg.size as usize,
                is_server: true,
                my_pid,
                fd: Some(fd),
                destroyed: false,
            }
        })
    }

    fn attach_memfd(mut cfg: SegmentConfig) -> ShmResult<Self> {
        let name = cfg.name;
        let my_pid = platform::get_current_pid();
        let fd = cfg.fd.take().ok_or_else(|| ShmError::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "memfd attach requires an inherited fd",
            ),
        })?;

        let page_size = platform::fd_page_size(&fd).map_err(|source| {
            tracing::warn!(name = %name, err = %source, "cannot determine memfd page size");
            ShmError::Mmap {
                name: name.clone(),
                source,
            }
        })?;

        // Probe the header, then re-map at the creator's anchor.
        let probe = platform::map_shared(0, page_size, &fd).map_err(|source| {
            tracing::warn!(name = %name, err = %source, "client probe mmap failed");
            ShmError::Mmap {
                name: name.clone(),
                source,
            }
        })?;
        let header: &SharedHeader = unsafe { probe.cast().as_ref() };
        let base_va = header.base_va();
        let size = header.size();
        platform::unmap(probe, page_size);

        let base = platform::map_shared(base_va, size as usize, &fd).map_err(|source| {
            tracing::warn!(name = %name, err = %source, "client final mmap failed");
            ShmError::Mmap {
                name: name.clone(),
                source,
            }
        })?;

        let seg = Self {
            name,
            seg_type: SegmentType::Memfd,
            base: base.cast(),
            map_size: size as usize,
            is_server: false,
            my_pid,
            fd: Some(fd),
            destroyed: false,
        };
        seg.header().set_client_pid(my_pid);
        Ok(seg)
    }

    /// Attach a pre-negotiated memfd segment directly: size and page
    /// size come from the fd itself and no header handshake happens.
    /// Used for pools of buffer segments whose address and size were
    /// agreed out of band; the mapping is placed at `cfg.requested_va`
    /// when nonzero.
    pub fn attach_fd_direct(mut cfg: SegmentConfig) -> ShmResult<Self> {
        let name = cfg.name;
        let my_pid = platform::get_current_pid();
        let fd = cfg.fd.take().ok_or_else(|| ShmError::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "direct attach requires an inherited fd",
            ),
        })?;

        let size = platform::fd_size(&fd).map_err(|source| ShmError::Mmap {
            name: name.clone(),
            source,
        })?;
        if size == 0 {
            return Err(ShmError::Mmap {
                name,
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, "fd has no size"),
            });
        }
        platform::fd_log2_page_size(&fd).map_err(|source| ShmError::Mmap {
            name: name.clone(),
            source,
        })?;

        let base = platform::map_shared(cfg.requested_va, size as usize, &fd).map_err(
            |source| {
                tracing::warn!(name = %name, err = %source, "direct attach mmap failed");
                ShmError::Mmap {
                    name: name.clone(),
                    source,
                }
            },
        )?;

        Ok(Self {
            name,
            seg_type: SegmentType::Memfd,
            base: base.cast(),
            map_size: size as usize,
            is_server: false,
            my_pid,
            fd: Some(fd),
            destroyed: false,
        })
    }

    fn create_private(cfg: SegmentConfig) -> ShmResult<Self> {
        let name = cfg.name;
        validate_segment_size(&name, cfg.size)?;

        let my_pid = platform::get_current_pid();
        let page_size = platform::page_size();
        let rnd_size = platform::round_to_page(cfg.size as usize, page_size);
        let map_size = rnd_size + page_size;

        let base = platform::map_anonymous(map_size).map_err(|source| {
            tracing::warn!(name = %name, err = %source, "private map failed");
            ShmError::CreateFailure {
                name: name.clone(),
                source,
            }
        })?;

        Self::format(
            base,
            SegmentType::Private,
            &name,
            map_size as u64,
            page_size,
            my_pid,
        )
        .map(|()| Self {
            name,
            seg_type: SegmentType::Private,
            base: base.cast(),
            map_size,
            is_server: true,
            my_pid,
            fd: None,
            destroyed: false,
        })
    }

    /// Shared server-side formatting: zero the first page, write the
    /// header, build the heap one page in, and record the name inside
    /// the heap. Unmaps on any failure so no partial state survives.
    fn format(
        base: NonNull<u8>,
        seg_type: SegmentType,
        name: &str,
        size: u64,
        page_size: usize,
        my_pid: i32,
    ) -> ShmResult<()> {
        unsafe { std::ptr::write_bytes(base.as_ptr(), 0, page_size) };

        let base_va = if seg_type == SegmentType::Private {
            NO_BASE_VA
        } else {
            base.as_ptr() as u64
        };
        let header = unsafe { SharedHeader::init(base.cast(), seg_type, size, base_va, my_pid) };

        let heap_base = unsafe { NonNull::new_unchecked(base.as_ptr().add(page_size)) };
        let heap_size = size as usize - page_size;
        let result = SharedHeap::create(heap_base, heap_size).and_then(|heap| {
            let (name_ptr, name_len) = heap.alloc_bytes(name.as_bytes())?;
            header.set_heap(heap.as_raw());
            header.set_name(name_ptr, name_len);
            Ok(())
        });

        if let Err(err) = result {
            platform::unmap(base, size as usize);
            return Err(err);
        }

        tracing::debug!(pid = my_pid, name = %name, base_va, size, "segment formatted");
        Ok(())
    }

    /// The page-zero header.
    pub fn header(&self) -> &SharedHeader {
        unsafe { self.base.as_ref() }
    }

    /// Handle to the embedded heap.
    pub fn heap(&self) -> ShmResult<SharedHeap> {
        unsafe { SharedHeap::from_raw(self.header().heap()) }
    }

    /// Mark the segment ready for attachers. Call after all
    /// heap-dependent setup is complete.
    pub fn publish_ready(&self) {
        self.header().publish_ready();
    }

    /// Backing type, read from the shared header so a bare handle is
    /// enough to dispatch teardown.
    pub fn seg_type(&self) -> SegmentType {
        self.header().seg_type().unwrap_or(self.seg_type)
    }

    /// Name recorded inside the segment heap by the creator.
    pub fn shared_name(&self) -> String {
        String::from_utf8_lossy(self.header().name()).into_owned()
    }

    /// Local copy of the configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the segment is mapped at in this process.
    pub fn base_va(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    /// Total mapped size in bytes.
    pub fn size(&self) -> usize {
        self.map_size
    }

    /// Whether this handle created the segment.
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// The retained backing fd (memfd segments), for hand-off over an
    /// out-of-band channel.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Tear the segment down. Dispatches on the tag in the shared
    /// header: shm unlinks the backing file, memfd closes the retained
    /// fd, private just unmaps. A client's destroy only removes this
    /// process's view (plus the shm unlink, matching creator behavior
    /// so either side can retire a name).
    pub fn destroy(mut self) {
        let ty = self.seg_type();
        tracing::debug!(pid = self.my_pid, name = %self.name, ?ty, "destroying segment");

        if ty == SegmentType::Shm {
            if let Err(err) = shm_unlink(self.name.as_str()) {
                tracing::warn!(name = %self.name, err = %err, "unlinking segment backing file failed");
            }
        }

        // The heap keeps all of its state inside the region, so the
        // allocator-aware teardown and the plain unmap coincide.
        platform::unmap(self.base.cast(), self.map_size);
        self.fd.take();
        self.destroyed = true;
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if !self.destroyed {
            // Unmap this view only; the backing object survives for the
            // peer unless destroy() retires it.
            platform::unmap(self.base.cast(), self.map_size);
            self.destroyed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_segment_round_trip() {
        let seg =
            Segment::create(SegmentConfig::new("priv_rt", 64 * 1024), SegmentType::Private)
                .unwrap();

        assert!(seg.is_server());
        assert_eq!(seg.seg_type(), SegmentType::Private);
        assert!(!seg.header().has_anchor());
        assert_eq!(seg.shared_name(), "priv_rt");

        let heap = seg.heap().unwrap();
        assert!(heap.free_space() > 32 * 1024);
        assert!(heap.alloc(1024, 64).is_ok());

        seg.destroy();
    }

    #[test]
    fn test_private_attach_is_refused() {
        let err = Segment::attach(SegmentConfig::new("priv_cl", 4096), SegmentType::Private)
            .unwrap_err();
        assert!(matches!(err, ShmError::ServerOnly { .. }));
    }

    #[test]
    fn test_zero_size_rejected() {
        for ty in [SegmentType::Shm, SegmentType::Memfd, SegmentType::Private] {
            let err = Segment::create(SegmentConfig::new("zero_sz", 0), ty).unwrap_err();
            assert!(matches!(err, ShmError::NoSize { .. }));
        }
    }

    #[test]
    fn test_out_of_range_size_rejected() {
        for ty in [SegmentType::Shm, SegmentType::Memfd, SegmentType::Private] {
            let err = Segment::create(
                SegmentConfig::new("tiny_sz", SEG_MIN_SIZE as u64 - 1),
                ty,
            )
            .unwrap_err();
            assert!(matches!(err, ShmError::InvalidSize { .. }));

            let err = Segment::create(
                SegmentConfig::new("huge_sz", SEG_MAX_SIZE as u64 + 1),
                ty,
            )
            .unwrap_err();
            assert!(matches!(err, ShmError::InvalidSize { .. }));
        }
    }

    #[test]
    fn test_memfd_retains_fd() {
        let seg = Segment::create(SegmentConfig::new("memfd_fd", 1 << 20), SegmentType::Memfd)
            .unwrap();
        assert!(seg.fd().is_some());
        assert_eq!(seg.seg_type(), SegmentType::Memfd);
        assert_eq!(seg.header().server_pid(), platform::get_current_pid());
        seg.destroy();
    }
}

//! Platform mapping primitives.
//!
//! Thin wrappers over the mmap/memfd/shm_open plumbing the segment layer
//! is built on. Only Linux is supported.

mod linux;

pub use linux::{
    create_memfd, fd_log2_page_size, fd_page_size, fd_size, ftruncate_fd, get_current_pid,
    is_process_alive, map_anonymous, map_shared, page_size, randomize_va, round_to_page,
    set_fd_size, unmap,
};

//! # Fastpath Common
//!
//! Shared wire-layout types and constants for the fastpath shared-memory
//! substrate. Everything in this crate is agreed upon by both sides of a
//! segment: the creator writes these structures into shared memory, the
//! attacher reads them back after re-mapping at the creator's address.
//!
//! This crate is the single source of truth for cross-process layout -
//! all other crates must import from here rather than redefining.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod consts;
pub mod layout;

pub use consts::{CACHE_LINE_SIZE, NO_BASE_VA, SEG_MAX_SIZE, SEG_MIN_SIZE};
pub use layout::{BUFFER_DESC_SIZE, BufferDesc, SegmentType};

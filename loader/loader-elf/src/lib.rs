//! # ELF Metadata
//!
//! A minimal reader for statically linked, little-endian ELF executables.
//! It reads the file header and the program header table and keeps the
//! `PT_LOAD` segments in file order; it does not validate anything beyond
//! what is needed to find the entry point and the segment table.
//!
//! The opened file stays inside the [`Image`] so that pages can later be
//! mapped straight from it.

mod header;
mod image;
mod segment;

pub use header::{BinaryHeader, ElfClass};
pub use image::{Image, ImageError};
pub use segment::{PFlags, Segment, SegmentRef, SegmentTable};

//! # Demand-Paging Runtime
//!
//! Runs a statically linked executable inside the current process without
//! mapping any of its segments up front. Every first touch of a page raises
//! `SIGSEGV`; the interceptor maps exactly that page from the image file and
//! hands control back to a checkpoint taken just before the entry point was
//! called. The controller then either stops ([`RunMode::SingleShot`]) or calls
//! the entry point again ([`RunMode::Replay`]) until it returns on its own.
//!
//! ## Flow
//!
//! ```text
//! Loader::prepare ── Image::open, page size, zeroed statistics
//!     ↓
//! Loader::run ────── install SIGSEGV handler, arm checkpoint
//!     ↓
//! entry point ────── touches unmapped page
//!     ↓
//! interceptor ────── resolve segment → mmap one page → count → resume at checkpoint
//!     ↓
//! controller ─────── replay or stop, unregister, unmap, report
//! ```
//!
//! ## Caveats
//!
//! * Replays re-execute the guest's prologue from the entry point. That is
//!   only meaningful for guests whose code up to the next fault has no
//!   externally visible, non-idempotent side effects.
//! * The handler is process-wide; only one image may run at a time.
//! * Supported on Linux for x86 and x86-64, where the checkpoint trampoline
//!   and the signal-context layout are known.

#[cfg(not(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64"))))]
compile_error!("loader-runtime supports Linux on x86 and x86-64 only");

mod checkpoint;
mod config;
mod controller;
mod fault;
mod interceptor;
mod paging;
mod resident;
mod stats;

pub use checkpoint::{ForeignEntry, Resumption};
pub use config::{FragmentationModel, LoaderConfig, ParseConfigError, RunMode};
pub use controller::{Loader, LoaderError, Phase, RunReport, platform_page_size};
pub use fault::{FaultError, FaultRecord, MapFailure, PageFaultError};
pub use paging::{Backing, PagePlan, PlanError, ZeroFill, plan_page, zero_fill};
pub use stats::RunStatistics;

pub use loader_addresses::{PageSize, VirtualAddress, VirtualPage};
pub use loader_elf::{Image, ImageError, Segment, SegmentTable};

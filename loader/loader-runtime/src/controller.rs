//! # Execution Controller
//!
//! `Preparing → Running → Reporting`. The controller owns the fault context
//! for the whole run, installs the interceptor, calls the guest and decides
//! what to do each time control comes back to the checkpoint.

use crate::checkpoint::{ForeignEntry, Resumption};
use crate::config::{LoaderConfig, RunMode};
use crate::fault::FaultError;
use crate::interceptor::{FaultContext, Registration};
use crate::stats::RunStatistics;
use core::cell::Cell;
use core::fmt;
use loader_addresses::{PageSize, VirtualAddress};
use loader_elf::{Image, ImageError};
use log::{debug, info, trace, warn};
use nix::errno::Errno;
use nix::unistd::{SysconfVar, sysconf};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("failed to read the executable")]
    Image(#[from] ImageError),
    #[error("the platform page size could not be determined")]
    PageSize,
    #[error("entry point {0} is not callable from this process")]
    EntryPoint(VirtualAddress),
    #[error("another image is already running in this process")]
    AlreadyRunning,
    #[error("failed to install the SIGSEGV handler")]
    SignalSetup(#[source] Errno),
    #[error(transparent)]
    Fault(#[from] FaultError),
}

impl LoaderError {
    /// The phase the run was in when it failed.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self {
            Self::Image(_) | Self::PageSize | Self::EntryPoint(_) => Phase::Preparing,
            Self::AlreadyRunning | Self::SignalSetup(_) | Self::Fault(_) => Phase::Running,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Preparing,
    Running,
    Reporting,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Reporting => "reporting",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub stats: RunStatistics,
    pub mode: RunMode,
    /// How many times the entry point was called again after a fault.
    pub replays: u64,
    /// Whether the entry point eventually returned on its own.
    pub completed: bool,
}

/// Query the platform page size.
///
/// # Errors
/// [`LoaderError::PageSize`] if `sysconf` fails or reports something that
/// is not a power of two.
pub fn platform_page_size() -> Result<PageSize, LoaderError> {
    let raw = sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .ok_or(LoaderError::PageSize)?;
    u64::try_from(raw)
        .ok()
        .and_then(PageSize::new)
        .ok_or(LoaderError::PageSize)
}

pub struct Loader {
    context: FaultContext,
    entry: ForeignEntry,
    config: LoaderConfig,
    phase: Cell<Phase>,
}

impl Loader {
    /// Open `path` and prepare a run with the platform page size.
    ///
    /// # Errors
    /// Any [`ImageError`] from reading the file, or a page size failure.
    pub fn prepare(path: impl AsRef<Path>, config: LoaderConfig) -> Result<Self, LoaderError> {
        let image = Image::open(path)?;
        let page_size = platform_page_size()?;
        Self::with_image(image, page_size, config)
    }

    /// Prepare a run for an already opened image.
    pub fn with_image(
        image: Image,
        page_size: PageSize,
        config: LoaderConfig,
    ) -> Result<Self, LoaderError> {
        let header = *image.header();
        if !header.class.matches_host() {
            warn!(
                "{} is a {}-bit image but this process is {}-bit; its code will not run correctly",
                image.path().display(),
                header.class.bits(),
                usize::BITS
            );
        }

        let entry = ForeignEntry::new(header.entry).ok_or(LoaderError::EntryPoint(header.entry))?;
        if image.segments().resolve(header.entry).is_none() {
            warn!("entry point {} is not inside any loadable segment", header.entry);
        }

        debug!(
            "preparing {} ({} segments, {page_size} pages, mode={}, fragmentation={})",
            image.path().display(),
            image.segments().len(),
            config.mode,
            config.fragmentation
        );

        Ok(Self {
            context: FaultContext::new(image, page_size, config.fragmentation),
            entry,
            config,
            phase: Cell::new(Phase::Preparing),
        })
    }

    #[must_use]
    pub const fn image(&self) -> &Image {
        self.context.image()
    }

    /// Run the guest and report.
    ///
    /// Consumes the loader: the image file is closed and every page mapped
    /// for the guest is unmapped before this returns.
    ///
    /// # Errors
    /// [`LoaderError::AlreadyRunning`] or [`LoaderError::SignalSetup`] if the
    /// handler cannot be installed, and [`LoaderError::Fault`] for the first
    /// fault that could not be serviced.
    pub fn run(self) -> Result<RunReport, LoaderError> {
        let registration = Registration::install(&self.context)?;
        self.transition(Phase::Running);
        let outcome = self.drive();
        drop(registration);

        self.transition(Phase::Reporting);
        let released = self.context.release_pages();
        debug!("released {released} resident pages");

        let (replays, completed) = outcome?;
        let stats = self.context.stats();
        info!(
            "{}: {} faults, {} allocations, {} bytes fragmentation ({} replays, {})",
            self.image().path().display(),
            stats.faults,
            stats.allocations,
            stats.fragmentation_bytes,
            replays,
            if completed { "completed" } else { "stopped" }
        );

        Ok(RunReport {
            stats,
            mode: self.config.mode,
            replays,
            completed,
        })
    }

    fn transition(&self, next: Phase) {
        trace!("{} -> {next}", self.phase.get());
        self.phase.set(next);
    }

    /// Call the entry point until the run is over: `(replays, completed)`.
    fn drive(&self) -> Result<(u64, bool), FaultError> {
        let mut replays = 0;
        loop {
            // SAFETY: the interceptor is registered for this context, and the
            // entry point comes from the image the caller chose to run.
            let resumption = unsafe { self.context.enter(self.entry) };
            if resumption == Resumption::Returned {
                return Ok((replays, true));
            }

            if let Some(err) = self.context.take_error() {
                return Err(err);
            }
            if let Some(fault) = self.context.take_last_fault() {
                debug!(
                    "fault #{} at {} → page {} of segment {} ({})",
                    self.context.stats().faults,
                    fault.address,
                    fault.page,
                    fault.segment,
                    fault.cause.explain()
                );
            }

            match self.config.mode {
                RunMode::SingleShot => return Ok((replays, false)),
                RunMode::Replay => {
                    replays += 1;
                    trace!("replaying from entry point {}", self.entry.address());
                }
            }
        }
    }
}

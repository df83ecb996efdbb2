//! # SIGSEGV Interceptor
//!
//! The handler reaches its state through one process-wide pointer that
//! [`Registration`] sets for the duration of a run. Everything it touches is
//! allocated before the guest starts: the segment table, the statistics, the
//! resident page reservation and the error slot. It neither allocates nor
//! logs.

use crate::checkpoint::{self, Checkpoint, ForeignEntry, Resumption};
use crate::config::FragmentationModel;
use crate::controller::LoaderError;
use crate::fault::{FaultError, FaultRecord, MapFailure, PageFaultError};
use crate::paging::{Backing, PagePlan, PlanError, plan_page, zero_fill};
use crate::resident::ResidentPages;
use crate::stats::RunStatistics;
use core::cell::{Cell, UnsafeCell};
use core::ffi::{c_int, c_void};
use core::marker::PhantomData;
use core::num::NonZeroUsize;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use loader_addresses::{PageSize, VirtualAddress, VirtualPage};
use loader_elf::{Image, Segment};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, mmap_anonymous};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction, signal};

static CONTEXT: AtomicPtr<FaultContext> = AtomicPtr::new(ptr::null_mut());

/// Every page gets the same protection; per-segment permissions are not
/// modelled. Execute is included so that code pages can run.
const PAGE_PROT: ProtFlags = ProtFlags::PROT_READ
    .union(ProtFlags::PROT_WRITE)
    .union(ProtFlags::PROT_EXEC);

/// State shared between the controller and the fault handler.
///
/// Both sides run on the same thread and never at the same time: the
/// controller touches it only between guest calls.
pub struct FaultContext {
    image: Image,
    page_size: PageSize,
    fragmentation: FragmentationModel,
    owner: Cell<libc::pthread_t>,
    in_guest: Cell<bool>,
    checkpoint: Checkpoint,
    stats: Cell<RunStatistics>,
    last_fault: Cell<Option<FaultRecord>>,
    pending: Cell<Option<FaultError>>,
    resident: UnsafeCell<ResidentPages>,
}

impl FaultContext {
    /// Zeroed statistics and a resident-page reservation large enough for
    /// every page of every segment.
    pub fn new(image: Image, page_size: PageSize, fragmentation: FragmentationModel) -> Self {
        let capacity = image
            .segments()
            .iter()
            .map(|s| page_size.pages_spanned(s.vaddr.as_u64(), s.memsz))
            .fold(0usize, |acc, n| {
                acc.saturating_add(usize::try_from(n).unwrap_or(usize::MAX))
            });

        Self {
            image,
            page_size,
            fragmentation,
            // SAFETY: pthread_self has no preconditions.
            owner: Cell::new(unsafe { libc::pthread_self() }),
            in_guest: Cell::new(false),
            checkpoint: Checkpoint::new(),
            stats: Cell::new(RunStatistics::new()),
            last_fault: Cell::new(None),
            pending: Cell::new(None),
            resident: UnsafeCell::new(ResidentPages::with_capacity(capacity)),
        }
    }

    pub const fn image(&self) -> &Image {
        &self.image
    }

    pub fn stats(&self) -> RunStatistics {
        self.stats.get()
    }

    pub fn take_last_fault(&self) -> Option<FaultRecord> {
        self.last_fault.take()
    }

    pub fn take_error(&self) -> Option<FaultError> {
        self.pending.take()
    }

    /// Call the guest's entry point with the checkpoint armed.
    ///
    /// # Safety
    /// See [`ForeignEntry::call`]. The handler must be registered for this
    /// context, or a fault in the guest kills the process.
    pub unsafe fn enter(&self, entry: ForeignEntry) -> Resumption {
        // The guest runs on whichever thread calls this, not the one that
        // prepared the context.
        // SAFETY: pthread_self has no preconditions.
        self.owner.set(unsafe { libc::pthread_self() });
        self.in_guest.set(true);
        // SAFETY: forwarded to the caller.
        let resumption = unsafe { entry.call(&self.checkpoint) };
        self.in_guest.set(false);
        resumption
    }

    /// Whether a fault on the current thread belongs to the guest.
    fn owns_fault(&self) -> bool {
        // SAFETY: pthread_self has no preconditions.
        self.in_guest.get() && unsafe { libc::pthread_self() } == self.owner.get()
    }

    /// Materialize the page holding `address` and count it.
    ///
    /// Statistics only change when a page was actually mapped.
    pub fn service(
        &self,
        address: VirtualAddress,
        cause: PageFaultError,
    ) -> Result<FaultRecord, FaultError> {
        let found = self
            .image
            .segments()
            .resolve(address)
            .ok_or(FaultError::UnresolvableFault { address })?;

        let page = address.page(self.page_size);
        let mapping_failure = |cause| FaultError::MappingFailure {
            address,
            page: page.base(),
            cause,
        };

        // SAFETY: only this method and `release_pages` touch the set, and
        // never while the other is running.
        let resident = unsafe { &mut *self.resident.get() };
        if resident.contains(page) {
            return Err(FaultError::NoProgress {
                address,
                page: page.base(),
            });
        }
        if !resident.has_room() {
            return Err(mapping_failure(MapFailure::ResidentSetFull));
        }

        let plan = self
            .plan(found.segment, address)
            .map_err(|e| mapping_failure(MapFailure::Plan(e)))?;
        self.materialize(&plan).map_err(mapping_failure)?;
        resident.insert(page).map_err(mapping_failure)?;

        let mut stats = self.stats.get();
        stats.record(self.fragmentation.charge(found.segment, page));
        self.stats.set(stats);

        Ok(FaultRecord {
            address,
            page: page.base(),
            segment: found.index,
            cause,
        })
    }

    /// Plan the page for a fault inside `segment`.
    ///
    /// A page with no file bytes of its own may still hold file bytes of a
    /// neighbouring segment that shares it; those decide the backing then.
    fn plan(&self, segment: &Segment, address: VirtualAddress) -> Result<PagePlan, PlanError> {
        let plan = plan_page(segment, address, self.page_size)?;
        if plan.backing != Backing::Anonymous {
            return Ok(plan);
        }

        Ok(self
            .image
            .segments()
            .iter()
            .filter(|other| !ptr::eq(*other, segment))
            .filter_map(|other| plan_page(other, address, self.page_size).ok())
            .find(|shared| shared.backing != Backing::Anonymous)
            .unwrap_or(plan))
    }

    /// Map one page according to `plan` and zero the tails of every segment
    /// that ends inside it.
    fn materialize(&self, plan: &PagePlan) -> Result<(), MapFailure> {
        let base = plan.page.base();
        let addr = base
            .as_usize()
            .and_then(NonZeroUsize::new)
            .ok_or(MapFailure::AddressWidth)?;
        let len = NonZeroUsize::new(self.page_size.as_usize()).ok_or(MapFailure::AddressWidth)?;
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED_NOREPLACE;

        // SAFETY: MAP_FIXED_NOREPLACE never replaces an existing mapping, so
        // no memory owned by the loader is affected.
        let mapped = match plan.backing {
            Backing::File { offset } => {
                let offset = libc::off_t::try_from(offset).map_err(|_| MapFailure::OffsetRange)?;
                unsafe {
                    mmap(
                        Some(addr),
                        len,
                        PAGE_PROT,
                        flags,
                        self.image.file(),
                        offset,
                    )
                }
            }
            Backing::Anonymous => unsafe { mmap_anonymous(Some(addr), len, PAGE_PROT, flags) },
        }
        .map_err(MapFailure::Syscall)?;

        // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
        if mapped.as_ptr() as usize != addr.get() {
            // SAFETY: we just created this mapping and nothing refers to it.
            unsafe { libc::munmap(mapped.as_ptr(), len.get()) };
            return Err(MapFailure::Misplaced(VirtualAddress::from_ptr(
                mapped.as_ptr().cast_const(),
            )));
        }

        if plan.backing == Backing::Anonymous {
            return Ok(());
        }

        let page = mapped.cast::<u8>().as_ptr();
        for segment in self.image.segments().iter() {
            let Some(fill) = zero_fill(segment, plan.page) else {
                continue;
            };
            let from = usize::try_from(fill.from).map_err(|_| MapFailure::AddressWidth)?;
            let to = usize::try_from(fill.to).map_err(|_| MapFailure::AddressWidth)?;
            // SAFETY: the page is mapped writable and `from < to <= page size`.
            unsafe {
                ptr::write_bytes(page.add(from), 0, to - from);
            }
        }

        Ok(())
    }

    /// Unmap every page materialized so far. Returns the number of pages.
    pub fn release_pages(&self) -> usize {
        // SAFETY: called by the controller while no guest call is in flight.
        let resident = unsafe { &mut *self.resident.get() };
        let mut released = 0;
        for page in resident.drain() {
            if unmap(page) {
                released += 1;
            } else {
                log::warn!("failed to unmap resident page {page}");
            }
        }
        released
    }
}

impl Drop for FaultContext {
    fn drop(&mut self) {
        self.release_pages();
    }
}

fn unmap(page: VirtualPage) -> bool {
    let Some(addr) = page.base().as_usize() else {
        return false;
    };
    // SAFETY: the page was mapped by `materialize` and nothing in the loader
    // holds references into it.
    unsafe { libc::munmap(addr as *mut c_void, page.size().as_usize()) == 0 }
}

/// The installed `SIGSEGV` handler, tied to the context it serves.
///
/// Dropping it restores the previous disposition and clears the context
/// pointer.
pub struct Registration<'a> {
    previous: SigAction,
    _context: PhantomData<&'a FaultContext>,
}

impl<'a> Registration<'a> {
    pub fn install(context: &'a FaultContext) -> Result<Self, LoaderError> {
        CONTEXT
            .compare_exchange(
                ptr::null_mut(),
                ptr::from_ref(context).cast_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| LoaderError::AlreadyRunning)?;

        let action = SigAction::new(
            SigHandler::SigAction(on_segv),
            SaFlags::SA_SIGINFO,
            SigSet::empty(),
        );

        // SAFETY: `on_segv` only reaches state through CONTEXT, which stays
        // valid for the lifetime of this registration.
        match unsafe { sigaction(Signal::SIGSEGV, &action) } {
            Ok(previous) => {
                log::trace!("SIGSEGV handler installed");
                Ok(Self {
                    previous,
                    _context: PhantomData,
                })
            }
            Err(errno) => {
                CONTEXT.store(ptr::null_mut(), Ordering::Release);
                Err(LoaderError::SignalSetup(errno))
            }
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        // SAFETY: restores the disposition that was active before `install`.
        if let Err(errno) = unsafe { sigaction(Signal::SIGSEGV, &self.previous) } {
            log::warn!("failed to restore the previous SIGSEGV handler: {errno}");
        }
        CONTEXT.store(ptr::null_mut(), Ordering::Release);
        log::trace!("SIGSEGV handler removed");
    }
}

extern "C" fn on_segv(signum: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    // SAFETY: the pointer is either null or set by a live Registration.
    let Some(ctx) = (unsafe { CONTEXT.load(Ordering::Acquire).as_ref() }) else {
        return fall_through(signum);
    };
    if !ctx.owns_fault() {
        return fall_through(signum);
    }

    // SAFETY: the kernel passes a valid siginfo_t and ucontext_t for
    // SA_SIGINFO handlers.
    let address = VirtualAddress::from_ptr(unsafe { (*info).si_addr() }.cast_const());
    let cause = unsafe { checkpoint::fault_cause(ucontext) };

    match ctx.service(address, cause) {
        Ok(record) => ctx.last_fault.set(Some(record)),
        Err(err) => ctx.pending.set(Some(err)),
    }
    ctx.in_guest.set(false);

    // SAFETY: same thread that armed the checkpoint (checked by owns_fault).
    if !unsafe { ctx.checkpoint.resume(ucontext) } {
        fall_through(signum);
    }
}

/// Not ours: restore the default action and return, so the faulting
/// instruction re-executes and the process dies the usual way.
fn fall_through(signum: c_int) {
    if let Ok(sig) = Signal::try_from(signum) {
        // SAFETY: SIG_DFL is always a valid disposition.
        unsafe {
            let _ = signal(sig, SigHandler::SigDfl);
        }
    }
}

//! # Fault Records and Errors
//!
//! What the interceptor reports back to the controller after each fault.

use crate::paging::PlanError;
use bitfield_struct::bitfield;
use loader_addresses::VirtualAddress;
use nix::errno::Errno;

/// A fault the interceptor serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub address: VirtualAddress,
    pub page: VirtualAddress,
    /// Index of the owning segment in the image's segment table.
    pub segment: usize,
    pub cause: PageFaultError,
}

/// Why the interceptor could not service a fault.
///
/// Produced inside the signal handler, so it is `Copy` and allocation free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("fault at {address} lies outside every loadable segment")]
    UnresolvableFault { address: VirtualAddress },
    #[error("fault at {address} hit page {page}, which is already resident")]
    NoProgress {
        address: VirtualAddress,
        page: VirtualAddress,
    },
    #[error("failed to map page {page} for the fault at {address}")]
    MappingFailure {
        address: VirtualAddress,
        page: VirtualAddress,
        #[source]
        cause: MapFailure,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapFailure {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("mmap failed")]
    Syscall(#[source] Errno),
    #[error("the kernel placed the page at {0} instead")]
    Misplaced(VirtualAddress),
    #[error("the file offset does not fit the platform's off_t")]
    OffsetRange,
    #[error("the page address does not fit in a host pointer")]
    AddressWidth,
    #[error("no room left to record another resident page")]
    ResidentSetFull,
}

/// The bits of the x86 page-fault error code that tell what the guest did.
///
/// Linux stores the hardware error code in the saved machine context of the
/// signal. It is only decoded for log messages.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// Set when the page was present and the access was refused.
    pub present: bool,
    pub write: bool,
    #[bits(2)]
    __: u8,
    pub instruction_fetch: bool,
    #[bits(59)]
    __: u64,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            if self.instruction_fetch() {
                "instruction fetch from a non-present page"
            } else if self.write() {
                "write to a non-present page"
            } else {
                "read from a non-present page"
            }
        } else if self.instruction_fetch() {
            "instruction fetch from a protected page (likely NX)"
        } else if self.write() {
            "write access to a protected page"
        } else {
            "read access to a protected page"
        }
    }
}

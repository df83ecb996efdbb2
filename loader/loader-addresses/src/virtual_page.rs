use crate::{PageSize, VirtualAddress};
use core::fmt;

/// Base of a virtual page together with its size.
///
/// ### Invariants
/// - `base()` is aligned to `size()`.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct VirtualPage {
    base: u64,
    size: PageSize,
}

impl VirtualPage {
    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress, size: PageSize) -> Self {
        Self {
            base: size.align_down(addr.as_u64()),
            size,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.base)
    }

    #[inline]
    #[must_use]
    pub const fn size(self) -> PageSize {
        self.size
    }

    /// Exclusive end of the page.
    ///
    /// Wraps to zero for the very last page of the address space.
    #[inline]
    #[must_use]
    pub const fn end(self) -> VirtualAddress {
        VirtualAddress::new(self.base.wrapping_add(self.size.as_u64()))
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, addr: VirtualAddress) -> bool {
        self.size.align_down(addr.as_u64()) == self.base
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.base, self.size)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>({:#018X})", self.size, self.base)
    }
}

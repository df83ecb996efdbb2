use core::fmt;

/// Page granularity in bytes (always a power of two).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageSize(u64);

impl PageSize {
    /// 4 KiB pages (4096 bytes).
    pub const SIZE_4K: Self = Self(4096);

    /// Returns `None` unless `size` is a non-zero power of two.
    #[inline]
    #[must_use]
    pub const fn new(size: u64) -> Option<Self> {
        if size.is_power_of_two() {
            Some(Self(size))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Page size in bytes as `usize`.
    ///
    /// Page sizes are far below `u32::MAX`, so this never truncates on the
    /// 32- and 64-bit targets the loader runs on.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// log2 of the page size, i.e. the number of in-page offset bits.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    #[inline]
    const fn mask(self) -> u64 {
        self.0 - 1
    }

    /// Align `value` down to a page boundary.
    #[inline]
    #[must_use]
    pub const fn align_down(self, value: u64) -> u64 {
        value & !self.mask()
    }

    /// Align `value` up to a page boundary; `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn align_up(self, value: u64) -> Option<u64> {
        match value.checked_add(self.mask()) {
            Some(v) => Some(v & !self.mask()),
            None => None,
        }
    }

    /// Offset of `value` within its page.
    #[inline]
    #[must_use]
    pub const fn offset(self, value: u64) -> u64 {
        value & self.mask()
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, value: u64) -> bool {
        self.offset(value) == 0
    }

    /// Number of pages touched by the half-open range `[start, start + len)`.
    ///
    /// Ranges that run past the end of the address space are clamped to it.
    #[must_use]
    pub const fn pages_spanned(self, start: u64, len: u64) -> u64 {
        if len == 0 {
            return 0;
        }
        let first = self.align_down(start);
        let end = match start.checked_add(len) {
            Some(end) => end,
            None => u64::MAX,
        };
        let last = match self.align_up(end) {
            Some(last) => last,
            None => return ((u64::MAX - first) >> self.shift()) + 1,
        };
        (last - first) >> self.shift()
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            s if s >= 1 << 30 && s % (1 << 30) == 0 => write!(f, "{}G", s >> 30),
            s if s >= 1 << 20 && s % (1 << 20) == 0 => write!(f, "{}M", s >> 20),
            s if s >= 1 << 10 && s % (1 << 10) == 0 => write!(f, "{}K", s >> 10),
            s => write!(f, "{s}B"),
        }
    }
}

impl fmt::Debug for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PageSize({self})")
    }
}

//! # Resident Pages

use crate::fault::MapFailure;
use loader_addresses::VirtualPage;

/// Pages mapped so far, in fault order.
///
/// Capacity is reserved up front so that recording a page from inside the
/// signal handler never allocates.
#[derive(Debug, Default)]
pub struct ResidentPages {
    pages: Vec<VirtualPage>,
}

impl ResidentPages {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pages: Vec::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn contains(&self, page: VirtualPage) -> bool {
        self.pages.contains(&page)
    }

    /// Record `page`; fails instead of growing once the reservation is used up.
    pub fn insert(&mut self, page: VirtualPage) -> Result<(), MapFailure> {
        if self.pages.len() == self.pages.capacity() {
            return Err(MapFailure::ResidentSetFull);
        }
        self.pages.push(page);
        Ok(())
    }

    /// Whether another page can be recorded without allocating.
    #[must_use]
    pub fn has_room(&self) -> bool {
        self.pages.len() < self.pages.capacity()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = VirtualPage> + '_ {
        self.pages.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loader_addresses::{PageSize, VirtualAddress};

    fn page(addr: u64) -> VirtualPage {
        VirtualAddress::new(addr).page(PageSize::SIZE_4K)
    }

    #[test]
    fn insert_within_capacity() {
        let mut set = ResidentPages::with_capacity(2);
        set.insert(page(0x1000)).unwrap();
        assert!(set.contains(page(0x1FFF)));
        assert!(!set.contains(page(0x2000)));
        set.insert(page(0x2000)).unwrap();
        assert_eq!(set.pages.len(), 2);
    }

    #[test]
    fn refuses_to_grow() {
        let mut set = ResidentPages::with_capacity(1);
        let cap = set.pages.capacity();
        for i in 0..cap {
            set.insert(page(0x1000 * (i as u64 + 1))).unwrap();
        }
        assert!(!set.has_room());
        assert_eq!(
            set.insert(page(0xFFFF_0000)),
            Err(MapFailure::ResidentSetFull)
        );
    }

    #[test]
    fn drain_empties() {
        let mut set = ResidentPages::with_capacity(4);
        set.insert(page(0x1000)).unwrap();
        set.insert(page(0x5000)).unwrap();
        let drained: Vec<_> = set.drain().collect();
        assert_eq!(drained, vec![page(0x1000), page(0x5000)]);
        assert!(set.pages.is_empty());
        assert!(set.has_room());
    }
}

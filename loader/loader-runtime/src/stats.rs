//! # Run Statistics
//!
//! Fault and allocation counters, and how internal fragmentation is charged.

use crate::config::FragmentationModel;
use core::fmt;
use loader_addresses::VirtualPage;
use loader_elf::Segment;

/// Counters accumulated while the guest runs.
///
/// Only the interceptor writes them; the controller reads them once the run
/// is over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStatistics {
    pub faults: u64,
    pub allocations: u64,
    pub fragmentation_bytes: u64,
}

impl RunStatistics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            faults: 0,
            allocations: 0,
            fragmentation_bytes: 0,
        }
    }

    /// One serviced fault that materialized one page.
    pub const fn record(&mut self, slack: u64) {
        self.faults += 1;
        self.allocations += 1;
        self.fragmentation_bytes += slack;
    }

    /// Fragmentation in whole KiB, rounded down.
    #[must_use]
    pub const fn fragmentation_kib(&self) -> u64 {
        self.fragmentation_bytes / 1024
    }
}

impl fmt::Display for RunStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total page faults: {}", self.faults)?;
        writeln!(f, "Total page allocations: {}", self.allocations)?;
        write!(
            f,
            "Total internal fragmentation (KB): {}",
            self.fragmentation_kib()
        )
    }
}

impl FragmentationModel {
    /// Bytes of `page` wasted on behalf of `segment`.
    #[must_use]
    pub fn charge(self, segment: &Segment, page: VirtualPage) -> u64 {
        let page_size = page.size().as_u64();
        match self {
            Self::PerFault => page_size.saturating_sub(segment.memsz),
            Self::TailPage => {
                let start = page.base().as_u64();
                let end = start.saturating_add(page_size);
                let seg_end = segment.end().as_u64();
                if seg_end > start && seg_end <= end {
                    end - seg_end
                } else {
                    0
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loader_addresses::{PageSize, VirtualAddress};
    use loader_elf::PFlags;

    fn segment(vaddr: u64, memsz: u64) -> Segment {
        Segment {
            vaddr: VirtualAddress::new(vaddr),
            offset: 0,
            filesz: 0,
            memsz,
            flags: PFlags::new(),
            align: 0x1000,
        }
    }

    fn page(addr: u64) -> VirtualPage {
        VirtualAddress::new(addr).page(PageSize::SIZE_4K)
    }

    #[test]
    fn record_keeps_allocations_in_step_with_faults() {
        let mut stats = RunStatistics::new();
        stats.record(96);
        stats.record(0);
        assert_eq!(stats.faults, 2);
        assert_eq!(stats.allocations, stats.faults);
        assert_eq!(stats.fragmentation_bytes, 96);
    }

    #[test]
    fn kib_rounds_down() {
        let stats = RunStatistics {
            faults: 1,
            allocations: 1,
            fragmentation_bytes: 3996,
        };
        assert_eq!(stats.fragmentation_kib(), 3);
    }

    #[test]
    fn report_format() {
        let stats = RunStatistics {
            faults: 2,
            allocations: 2,
            fragmentation_bytes: 4096,
        };
        assert_eq!(
            stats.to_string(),
            "Total page faults: 2\nTotal page allocations: 2\nTotal internal fragmentation (KB): 4"
        );
    }

    #[test]
    fn sub_page_segments_agree_across_models() {
        for (memsz, expected) in [(4000, 96), (100, 3996), (4096, 0)] {
            let seg = segment(0x1_0000, memsz);
            for model in [FragmentationModel::TailPage, FragmentationModel::PerFault] {
                assert_eq!(model.charge(&seg, page(0x1_0000)), expected, "{model} {memsz}");
            }
        }
    }

    #[test]
    fn page_sized_segments_waste_nothing() {
        let seg = segment(0x1_0000, 3 * 4096);
        for addr in [0x1_0000, 0x1_1000, 0x1_2FFF] {
            assert_eq!(FragmentationModel::TailPage.charge(&seg, page(addr)), 0);
            assert_eq!(FragmentationModel::PerFault.charge(&seg, page(addr)), 0);
        }
    }

    #[test]
    fn tail_page_charges_only_the_last_page() {
        let seg = segment(0x1_0000, 4096 + 100);
        assert_eq!(FragmentationModel::TailPage.charge(&seg, page(0x1_0000)), 0);
        assert_eq!(FragmentationModel::TailPage.charge(&seg, page(0x1_1000)), 3996);
    }

    #[test]
    fn tail_page_accounts_for_unaligned_start() {
        let seg = segment(0x1_0010, 100);
        assert_eq!(
            FragmentationModel::TailPage.charge(&seg, page(0x1_0010)),
            4096 - 0x10 - 100
        );
        assert_eq!(
            FragmentationModel::PerFault.charge(&seg, page(0x1_0010)),
            4096 - 100
        );
    }
}

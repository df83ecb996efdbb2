//! # Page Materialization Plans
//!
//! Decides, for one faulting address, which page to map and where its bytes
//! come from. Kept free of side effects so the arithmetic can be tested
//! without touching the address space.

use loader_addresses::{PageSize, VirtualAddress, VirtualPage};
use loader_elf::Segment;

/// Where the bytes of a page come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Private mapping of the image file at this (page-aligned) offset.
    File { offset: u64 },
    /// Zero-filled anonymous memory; the page holds only `memsz - filesz` tail.
    Anonymous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePlan {
    pub page: VirtualPage,
    pub backing: Backing,
}

/// In-page byte range `[from, to)` that must read as zero after mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroFill {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("page {page} would start before the beginning of the file")]
    OffsetUnderflow { page: VirtualAddress },
    #[error("file offset {offset:#x} for page {page} is not page aligned")]
    Misaligned { page: VirtualAddress, offset: u64 },
}

/// Plan the page that services a fault at `address` inside `segment`.
///
/// The byte at the page start corresponds to file offset
/// `segment.offset + (page_start - segment.vaddr)`. That offset has to be
/// page aligned, which holds whenever `vaddr ≡ offset (mod page size)` as
/// the ELF format requires for loadable segments.
pub fn plan_page(
    segment: &Segment,
    address: VirtualAddress,
    page_size: PageSize,
) -> Result<PagePlan, PlanError> {
    let page = address.page(page_size);
    let start = page.base().as_u64();
    let end = start.saturating_add(page_size.as_u64());

    let file_start = segment.vaddr.as_u64();
    let file_end = segment.file_end().as_u64();

    if segment.filesz == 0 || end <= file_start || start >= file_end {
        return Ok(PagePlan {
            page,
            backing: Backing::Anonymous,
        });
    }

    let offset = if start >= file_start {
        segment.offset.checked_add(start - file_start)
    } else {
        segment.offset.checked_sub(file_start - start)
    }
    .ok_or(PlanError::OffsetUnderflow { page: page.base() })?;

    if !page_size.is_aligned(offset) {
        return Err(PlanError::Misaligned {
            page: page.base(),
            offset,
        });
    }

    Ok(PagePlan {
        page,
        backing: Backing::File { offset },
    })
}

/// The part of `segment`'s zero-filled tail `[vaddr + filesz, vaddr + memsz)`
/// that falls inside `page`, if any.
///
/// Bytes of the page outside that range are left alone: they may belong to
/// another segment sharing the page.
#[must_use]
pub fn zero_fill(segment: &Segment, page: VirtualPage) -> Option<ZeroFill> {
    let start = page.base().as_u64();
    let end = start.saturating_add(page.size().as_u64());
    let from = segment.file_end().as_u64().max(start);
    let to = segment.end().as_u64().min(end);
    (from < to).then(|| ZeroFill {
        from: from - start,
        to: to - start,
    })
}

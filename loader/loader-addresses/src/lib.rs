//! # Virtual Address and Page Types
//!
//! Strongly typed wrappers for the raw addresses and page bases the loader
//! juggles while servicing faults.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`VirtualAddress`] | A raw virtual address in the loader's (and the guest's) address space. |
//! | [`VirtualPage`] | The page-aligned base of a page, together with its [`PageSize`]. |
//! | [`PageSize`] | A power-of-two page granularity, usually queried from the OS at startup. |
//!
//! Unlike a kernel, a user-space loader does not get to pick its page size:
//! the platform decides. [`PageSize`] is therefore a runtime value rather
//! than a marker type, and every page computation takes it explicitly.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use loader_addresses::*;
//! let page_size = PageSize::SIZE_4K;
//! let va = VirtualAddress::new(0x1_2345);
//!
//! let page = va.page(page_size);
//! assert_eq!(page.base().as_u64(), 0x1_2000);
//! assert_eq!(va.offset(page_size), 0x345);
//! assert!(page.contains(va));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod virtual_address;
mod virtual_page;

pub use page_size::PageSize;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

#![doc = include_str!("../README.md")]
#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod offset_list;
pub mod region;
pub mod sync;

pub use offset_list::{FixedSlots, LIST_END, ListHead, OffsetLinks, OffsetList};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::{Offset, Region};

#[cfg(all(test, loom))]
mod loom_tests;

//! Space tracking for the filesystems
//!
//! - [`AllocationMap`]: merged used-interval set with first-fit search
//! - [`SlotBitmap`]: per-slot usage of directory entries

pub mod interval;
pub mod slots;

pub use interval::{AllocationMap, Interval, OverlapPolicy, FIND_FREE_TAG};
pub use slots::SlotBitmap;

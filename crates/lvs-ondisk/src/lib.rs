#![forbid(unsafe_code)]
//! On-disk format parsing for LVM snapshot COW devices.
//!
//! Pure parsing crate: no I/O, no side effects. Decodes the persistent
//! exception store header, exception records, and the geometry that places
//! exception stores on the device.

pub mod cow;

pub use cow::{CowHeader, DiskException, StoreGeometry};

//! Storage engine
//!
//! Bottom-up: byte stores ([`io`]), stream transforms ([`transform`]), the
//! interval allocator ([`allocator`]), the two filesystems ([`imgfs`],
//! [`xip`]) and container recognition ([`image`]).

pub mod allocator;
pub mod compression;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod htc;
pub mod image;
pub mod imgfs;
pub mod io;
pub mod module;
pub mod partition;
pub mod transform;
pub mod xip;

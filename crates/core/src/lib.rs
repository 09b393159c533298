//! Domain types and pure helpers shared by every meshgen crate.
//!
//! Nothing in here touches the network. The only I/O is the read-only
//! directory scan performed by [`artifact::find_latest`].

pub mod artifact;
pub mod error;
pub mod job;
pub mod types;

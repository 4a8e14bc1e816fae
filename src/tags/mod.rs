//! Tag mirroring layer.
//!
//! The controller exposes a fixed catalog of named values ("tags"). This
//! module keeps a local mirror of each: synchronous read/write for
//! application-owned tags, and a live subscription mode for
//! controller-owned tags where change notifications update the cache and
//! fire attached reactions.

mod client;
mod id;
mod mirror;
mod registry;
mod value;

pub use client::{MockPlc, PlcClient, TagChange};
pub use id::TagId;
pub use mirror::TagMirror;
pub use registry::TagRegistry;
pub use value::TagValue;

//! `unionfs` is a library for two-layer union (overlay) namespaces.
//!
//! A union filesystem presents a single merged directory tree formed by
//! stacking a writable *upper* layer over a read-only *lower* layer.
//! Lookups and metadata queries resolve through both layers; mutations are
//! redirected to the upper layer, materializing ("copying up") lower files
//! on first write; deletions of lower entries are recorded as tombstones
//! ("whiteouts") so the lower layer is never modified.
//!
//! The engine is entirely in-process: both layers are collaborators behind
//! the [`Layer`] trait, and the merged namespace is driven through
//! [`UnionFileSystem`].

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

mod attrs;
mod cache;
mod copyup;
mod error;
mod filesystem;
mod implementations;
mod layer;
mod lookup;
mod name;
mod node;
mod passthrough;
mod remove;
mod rename;
mod whiteout;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use attrs::*;
pub use error::*;
pub use filesystem::*;
pub use implementations::*;
pub use layer::*;
pub use name::*;
pub use node::*;
pub use passthrough::*;

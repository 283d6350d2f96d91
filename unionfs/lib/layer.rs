use std::{
    any::Any,
    fmt::{self, Debug},
    sync::Arc,
};

use async_trait::async_trait;

use crate::{AdvisoryLock, Attributes, EntryName, PathConfName, SetAttributes, UnionError, UnionResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An opaque, shared-ownership reference to a node inside one layer.
///
/// Handles are created by layer implementations and never inspected by the
/// engine. Cloning a handle acquires a reference; dropping the last clone
/// releases it. A layer is free to keep its own clones alive in internal
/// caches, which is what keeps a removed-but-open node's data reachable.
#[derive(Clone)]
pub struct LayerHandle(Arc<dyn Any + Send + Sync>);

/// The result of a single-layer lookup that did not hard-fail.
///
/// `Absent` and `Consumed` form the *not-found class* that drives the merge
/// policy; hard errors (I/O, permission, …) are reported through `Err`.
#[derive(Debug, Clone)]
pub enum LookupStatus {
    /// The name resolved to a node in this layer.
    Found(LayerHandle),

    /// The name does not exist in this layer.
    Absent,

    /// The layer consumed additional path components and resolution
    /// terminates here; the merge must not continue into the other layer.
    Consumed,
}

/// The role a layer plays in the union.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerRole {
    /// The writable top layer that receives all mutations.
    Upper,

    /// The read-only bottom layer providing fallback content.
    Lower,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The interface the engine requires from each underlying filesystem.
///
/// A `Layer` exposes one tree of nodes addressed by [`LayerHandle`]s.
/// All operations may block for arbitrary I/O latency; the engine never
/// holds its own locks across these calls. The engine only ever mutates
/// through the upper layer; a lower layer sees nothing but lookups,
/// reads and attribute fetches.
#[async_trait]
pub trait Layer: Send + Sync {
    /// Returns a handle to the root directory of this layer.
    async fn root(&self) -> UnionResult<LayerHandle>;

    /// Looks `name` up under the `parent` directory.
    ///
    /// Whiteout markers are invisible to lookup: a whited-out name reports
    /// [`LookupStatus::Absent`] and is surfaced through
    /// [`Layer::detect_whiteout`] instead.
    async fn lookup(&self, parent: &LayerHandle, name: &EntryName) -> UnionResult<LookupStatus>;

    /// Fetches the attributes of a node.
    async fn getattr(&self, handle: &LayerHandle) -> UnionResult<Attributes>;

    /// Applies a partial attribute update to a node.
    async fn setattr(&self, handle: &LayerHandle, changes: &SetAttributes) -> UnionResult<()>;

    /// Creates a regular file under `parent`.
    async fn create_file(
        &self,
        parent: &LayerHandle,
        name: &EntryName,
        attrs: &Attributes,
    ) -> UnionResult<LayerHandle>;

    /// Creates a directory under `parent`.
    async fn make_directory(
        &self,
        parent: &LayerHandle,
        name: &EntryName,
        attrs: &Attributes,
    ) -> UnionResult<LayerHandle>;

    /// Creates a symbolic link under `parent`.
    async fn make_symlink(
        &self,
        parent: &LayerHandle,
        name: &EntryName,
        target: &str,
        attrs: &Attributes,
    ) -> UnionResult<LayerHandle>;

    /// Creates a special node (fifo, socket, device) under `parent`.
    async fn make_node(
        &self,
        parent: &LayerHandle,
        name: &EntryName,
        attrs: &Attributes,
    ) -> UnionResult<LayerHandle>;

    /// Reads the target of a symbolic link.
    async fn read_symlink(&self, handle: &LayerHandle) -> UnionResult<String>;

    /// Removes the non-directory entry `name` from `parent`. `handle` is
    /// the node the entry currently refers to.
    async fn remove(
        &self,
        parent: &LayerHandle,
        handle: &LayerHandle,
        name: &EntryName,
    ) -> UnionResult<()>;

    /// Removes the directory entry `name` from `parent`. Fails with
    /// `NotEmpty` if the directory still has entries in this layer.
    async fn remove_directory(
        &self,
        parent: &LayerHandle,
        handle: &LayerHandle,
        name: &EntryName,
    ) -> UnionResult<()>;

    /// Renames `src_name` under `src_parent` to `dst_name` under
    /// `dst_parent` within this layer.
    async fn rename(
        &self,
        src_parent: &LayerHandle,
        src: &LayerHandle,
        src_name: &EntryName,
        dst_parent: &LayerHandle,
        dst_name: &EntryName,
    ) -> UnionResult<()>;

    /// Creates a hard link to `handle` named `name` under `dst_parent`.
    async fn link(
        &self,
        handle: &LayerHandle,
        dst_parent: &LayerHandle,
        name: &EntryName,
    ) -> UnionResult<()>;

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes read; 0 at or past end of file.
    async fn read(&self, handle: &LayerHandle, offset: u64, buf: &mut [u8]) -> UnionResult<usize>;

    /// Writes `data` starting at `offset`, extending the file as needed.
    /// Returns the number of bytes written.
    async fn write(&self, handle: &LayerHandle, offset: u64, data: &[u8]) -> UnionResult<usize>;

    /// Notes an open of the node.
    async fn open(&self, handle: &LayerHandle) -> UnionResult<()>;

    /// Notes a close of the node.
    async fn close(&self, handle: &LayerHandle) -> UnionResult<()>;

    /// Lists the real entry names of a directory, excluding whiteout
    /// markers.
    async fn read_directory(&self, handle: &LayerHandle) -> UnionResult<Vec<EntryName>>;

    /// Creates a whiteout marker for `name` under `parent`.
    async fn create_whiteout(&self, parent: &LayerHandle, name: &EntryName) -> UnionResult<()>;

    /// Removes a whiteout marker for `name` under `parent`.
    async fn remove_whiteout(&self, parent: &LayerHandle, name: &EntryName) -> UnionResult<()>;

    /// Reports whether a whiteout marker for `name` exists under `parent`.
    async fn detect_whiteout(&self, parent: &LayerHandle, name: &EntryName) -> UnionResult<bool>;

    /// Flushes pending writes for the node.
    async fn fsync(&self, _handle: &LayerHandle) -> UnionResult<()> {
        Ok(())
    }

    /// Device-specific control operation.
    async fn ioctl(
        &self,
        _handle: &LayerHandle,
        _command: u64,
        _data: &mut [u8],
    ) -> UnionResult<()> {
        Err(UnionError::Unsupported("ioctl"))
    }

    /// Reports a pathconf-style limit for the node.
    async fn pathconf(&self, _handle: &LayerHandle, _name: PathConfName) -> UnionResult<u64> {
        Err(UnionError::Unsupported("pathconf"))
    }

    /// Applies an advisory lock operation to the node.
    async fn advisory_lock(&self, _handle: &LayerHandle, _lock: &AdvisoryLock) -> UnionResult<()> {
        Err(UnionError::Unsupported("advisory_lock"))
    }

    /// Maps a logical file offset to an underlying block number.
    async fn block_map(&self, _handle: &LayerHandle, _offset: u64) -> UnionResult<u64> {
        Err(UnionError::Unsupported("block_map"))
    }
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LayerHandle {
    /// Wraps a layer-owned value into a handle.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Wraps an already-shared layer-owned value into a handle.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self(value)
    }

    /// Recovers the layer-owned value, if this handle was created by a
    /// layer using the same inner type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast::<T>().ok()
    }

    /// Returns `true` if both handles refer to the same layer node.
    pub fn same_node(&self, other: &LayerHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl LookupStatus {
    /// Returns the found handle, if any.
    pub fn found(&self) -> Option<&LayerHandle> {
        match self {
            LookupStatus::Found(handle) => Some(handle),
            _ => None,
        }
    }

    /// Returns `true` for the not-found class (`Absent` or `Consumed`).
    pub fn is_absent_class(&self) -> bool {
        !matches!(self, LookupStatus::Found(_))
    }
}

impl LayerRole {
    /// Returns the human-readable name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerRole::Upper => "upper",
            LayerRole::Lower => "lower",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Debug for LayerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LayerHandle({:p})", Arc::as_ptr(&self.0))
    }
}

impl fmt::Display for LayerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_downcast_roundtrip() {
        let handle = LayerHandle::new(42u32);
        assert_eq!(*handle.downcast::<u32>().unwrap(), 42);
        assert!(handle.downcast::<String>().is_none());
    }

    #[test]
    fn test_handle_identity() {
        let a = LayerHandle::new("node".to_string());
        let b = a.clone();
        let c = LayerHandle::new("node".to_string());

        assert!(a.same_node(&b));
        assert!(!a.same_node(&c));
    }

    #[test]
    fn test_lookup_status_classes() {
        let found = LookupStatus::Found(LayerHandle::new(0u8));
        assert!(found.found().is_some());
        assert!(!found.is_absent_class());

        assert!(LookupStatus::Absent.is_absent_class());
        assert!(LookupStatus::Consumed.is_absent_class());
        assert!(LookupStatus::Absent.found().is_none());
    }
}

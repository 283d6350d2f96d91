use std::sync::Arc;

use getset::CopyGetters;

use crate::{LayerHandle, LayerRole, UnionError, UnionFileSystem, UnionNode, UnionResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The pathconf-style limits a layer can be asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathConfName {
    /// Maximum length of an entry name.
    NameMax,

    /// Maximum length of a relative path.
    PathMax,

    /// Maximum number of hard links to a node.
    LinkMax,

    /// Pipe buffer capacity.
    PipeBuf,
}

/// The operation of an advisory-lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    /// Acquire the described lock.
    Set,

    /// Release the described lock.
    Clear,

    /// Test whether the described lock could be acquired.
    Test,
}

/// An advisory byte-range lock request, forwarded verbatim to the active
/// layer.
#[derive(Debug, Clone, Copy, CopyGetters, PartialEq, Eq)]
#[getset(get_copy = "pub with_prefix")]
pub struct AdvisoryLock {
    /// The requested operation.
    operation: LockOperation,

    /// Whether the lock is exclusive.
    exclusive: bool,

    /// First byte of the locked range.
    start: u64,

    /// Length of the locked range; 0 means to end of file.
    length: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AdvisoryLock {
    /// Creates a lock request over a byte range.
    pub fn new(operation: LockOperation, exclusive: bool, start: u64, length: u64) -> Self {
        Self {
            operation,
            exclusive,
            start,
            length,
        }
    }
}

impl UnionFileSystem {
    /// Returns the node's active handle (upper when present, lower
    /// otherwise) and the layer serving it.
    async fn active(&self, node: &Arc<UnionNode>) -> (LayerHandle, LayerRole) {
        let meta = node.meta.lock().await;
        let (handle, role) = meta.backing.active();
        (handle.clone(), role)
    }

    /// Reads the target of a symbolic link through the active layer.
    pub async fn read_symlink(&self, node: &Arc<UnionNode>) -> UnionResult<String> {
        if !node.kind().is_symlink() {
            return Err(UnionError::NotASymlink);
        }
        let (handle, role) = self.active(node).await;
        self.layer(role).read_symlink(&handle).await
    }

    /// Flushes pending writes for the node through the active layer.
    pub async fn fsync(&self, node: &Arc<UnionNode>) -> UnionResult<()> {
        let (handle, role) = self.active(node).await;
        self.layer(role).fsync(&handle).await
    }

    /// Forwards a device-control operation to the active layer.
    pub async fn ioctl(
        &self,
        node: &Arc<UnionNode>,
        command: u64,
        data: &mut [u8],
    ) -> UnionResult<()> {
        let (handle, role) = self.active(node).await;
        self.layer(role).ioctl(&handle, command, data).await
    }

    /// Reports a pathconf-style limit from the active layer.
    pub async fn pathconf(&self, node: &Arc<UnionNode>, name: PathConfName) -> UnionResult<u64> {
        let (handle, role) = self.active(node).await;
        self.layer(role).pathconf(&handle, name).await
    }

    /// Forwards an advisory-lock request to the active layer.
    pub async fn advisory_lock(
        &self,
        node: &Arc<UnionNode>,
        lock: &AdvisoryLock,
    ) -> UnionResult<()> {
        let (handle, role) = self.active(node).await;
        self.layer(role).advisory_lock(&handle, lock).await
    }

    /// Maps a logical offset to a block number in the active layer.
    pub async fn block_map(&self, node: &Arc<UnionNode>, offset: u64) -> UnionResult<u64> {
        let (handle, role) = self.active(node).await;
        self.layer(role).block_map(&handle, offset).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Attributes, EntryName, Layer, MemoryLayer, NodeKind};

    fn name(s: &str) -> EntryName {
        s.parse().unwrap()
    }

    async fn mount_with_lower_file() -> (UnionFileSystem, Arc<UnionNode>) {
        let upper = Arc::new(MemoryLayer::new());
        let lower = Arc::new(MemoryLayer::new());
        lower.seed_file("f", b"data").await.unwrap();
        lower.freeze();

        let fs = UnionFileSystem::new(upper as Arc<dyn Layer>, lower as Arc<dyn Layer>)
            .await
            .unwrap();
        let f = fs.resolve(&fs.root(), &name("f")).await.unwrap();
        (fs, f)
    }

    #[tokio::test]
    async fn test_passthrough_routes_to_lower_without_upper() {
        let (fs, f) = mount_with_lower_file().await;
        assert!(f.upper().await.is_none());

        // fsync and pathconf reach the lower layer.
        fs.fsync(&f).await.unwrap();
        assert_eq!(fs.pathconf(&f, PathConfName::NameMax).await.unwrap(), 255);
    }

    #[tokio::test]
    async fn test_passthrough_routes_to_upper_after_copy_up() {
        let (fs, f) = mount_with_lower_file().await;
        fs.copy_up(&f, false).await.unwrap();

        fs.fsync(&f).await.unwrap();
        assert_eq!(fs.pathconf(&f, PathConfName::NameMax).await.unwrap(), 255);
    }

    #[tokio::test]
    async fn test_passthrough_unsupported_operations_surface() {
        let (fs, f) = mount_with_lower_file().await;

        let err = fs.ioctl(&f, 0x1234, &mut []).await.unwrap_err();
        assert!(matches!(err, UnionError::Unsupported(_)));

        let err = fs.block_map(&f, 0).await.unwrap_err();
        assert!(matches!(err, UnionError::Unsupported(_)));

        let lock = AdvisoryLock::new(LockOperation::Set, true, 0, 0);
        let err = fs.advisory_lock(&f, &lock).await.unwrap_err();
        assert!(matches!(err, UnionError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_passthrough_read_symlink() {
        let upper = Arc::new(MemoryLayer::new());
        let lower = Arc::new(MemoryLayer::new());
        lower.seed_symlink("l", "target/of/link").await.unwrap();
        lower.freeze();

        let fs = UnionFileSystem::new(upper as Arc<dyn Layer>, lower as Arc<dyn Layer>)
            .await
            .unwrap();
        let l = fs.resolve(&fs.root(), &name("l")).await.unwrap();
        assert_eq!(l.kind(), NodeKind::Symlink);
        assert_eq!(fs.read_symlink(&l).await.unwrap(), "target/of/link");

        // Reading a non-symlink through the wrapper is rejected.
        let f = fs
            .create_file(&fs.root(), &name("f"), &Attributes::new(NodeKind::File))
            .await
            .unwrap();
        assert!(matches!(
            fs.read_symlink(&f).await.unwrap_err(),
            UnionError::NotASymlink
        ));
    }
}

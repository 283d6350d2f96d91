use std::{collections::BTreeMap, sync::Arc};

use getset::{CopyGetters, Getters};

use crate::{
    cache::NameCache, whiteout::WhiteoutStore, Attributes, Backing, DirCacheEntry, EntryName,
    Layer, LayerHandle, LayerRole, LookupStatus, NodeKind, SetAttributes, UnionError, UnionNode,
    UnionResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Mount-time configuration for a union filesystem.
#[derive(Debug, Clone, Copy, Default, CopyGetters)]
#[getset(get_copy = "pub with_prefix")]
pub struct MountOptions {
    /// Fault-bypass mode: nodes never materialize an upper handle through
    /// copy-up, and freshly created files and symlinks are handed back
    /// without being interned in the name cache.
    fault_bypass: bool,
}

/// A two-layer union namespace: a writable upper layer stacked over a
/// read-only lower layer.
///
/// The filesystem owns both layer collaborators, the root union node and
/// the name-to-node cache. All operations take and return
/// `Arc<`[`UnionNode`]`>` identities produced by
/// [`resolve`](UnionFileSystem::resolve).
#[derive(Getters)]
#[getset(get = "pub with_prefix")]
pub struct UnionFileSystem {
    /// The writable top layer that receives all mutations.
    upper: Arc<dyn Layer>,

    /// The read-only bottom layer providing fallback content.
    lower: Arc<dyn Layer>,

    /// Tombstone bookkeeping on the upper layer.
    #[getset(skip)]
    pub(crate) whiteouts: WhiteoutStore,

    /// The name-to-node cache shared by all lookups.
    #[getset(skip)]
    pub(crate) cache: NameCache,

    /// The root union node.
    #[getset(skip)]
    root: Arc<UnionNode>,

    /// Mount-time options.
    #[getset(skip)]
    options: MountOptions,
}

//--------------------------------------------------------------------------------------------------
// Methods: MountOptions
//--------------------------------------------------------------------------------------------------

impl MountOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables fault-bypass mode.
    pub fn fault_bypass(mut self, fault_bypass: bool) -> Self {
        self.fault_bypass = fault_bypass;
        self
    }
}

//--------------------------------------------------------------------------------------------------
// Methods: UnionFileSystem
//--------------------------------------------------------------------------------------------------

impl UnionFileSystem {
    /// Mounts a union of `upper` over `lower` with default options.
    ///
    /// ## Errors
    ///
    /// Returns `LayerMissing` when either layer cannot produce a root
    /// handle, the malformed-mount configuration error.
    pub async fn new(upper: Arc<dyn Layer>, lower: Arc<dyn Layer>) -> UnionResult<Self> {
        Self::with_options(upper, lower, MountOptions::default()).await
    }

    /// Mounts a union of `upper` over `lower`.
    pub async fn with_options(
        upper: Arc<dyn Layer>,
        lower: Arc<dyn Layer>,
        options: MountOptions,
    ) -> UnionResult<Self> {
        let upper_root = upper
            .root()
            .await
            .map_err(|_| UnionError::LayerMissing("upper"))?;
        let lower_root = lower
            .root()
            .await
            .map_err(|_| UnionError::LayerMissing("lower"))?;

        let root = UnionNode::new(
            NodeKind::Directory,
            Backing::Merged {
                upper: upper_root,
                lower: lower_root,
            },
            None,
            None,
            None,
            None,
            options.fault_bypass,
        );

        Ok(Self {
            whiteouts: WhiteoutStore::new(Arc::clone(&upper)),
            cache: NameCache::new(),
            upper,
            lower,
            root,
            options,
        })
    }

    /// Returns the root union node.
    pub fn root(&self) -> Arc<UnionNode> {
        Arc::clone(&self.root)
    }

    /// Returns the layer serving the given role.
    pub(crate) fn layer(&self, role: LayerRole) -> &Arc<dyn Layer> {
        match role {
            LayerRole::Upper => &self.upper,
            LayerRole::Lower => &self.lower,
        }
    }

    /// Allocates a child node under `parent` and interns it in the name
    /// cache; a racing resolution's node wins if one got there first.
    pub(crate) async fn alloc_child(
        &self,
        parent: &Arc<UnionNode>,
        name: &EntryName,
        kind: NodeKind,
        backing: Backing,
        upper_size: Option<u64>,
        lower_size: Option<u64>,
    ) -> Arc<UnionNode> {
        let node = UnionNode::new(
            kind,
            backing,
            Some(name.clone()),
            Some(Arc::clone(parent)),
            upper_size,
            lower_size,
            self.options.fault_bypass,
        );
        match self.cache.intern(parent.id(), name, &node).await {
            Some(existing) => existing,
            None => node,
        }
    }

    /// Drops a node's memoized directory listing.
    pub(crate) async fn invalidate_dir_cache(&self, node: &Arc<UnionNode>) {
        node.meta.lock().await.dir_cache = None;
    }

    /// Common validation for create-through operations: `parent` must be a
    /// live directory with an upper handle, and `name` must not be visible
    /// in the merged view. A covering whiteout is erased. Returns the
    /// upper parent handle to create under.
    async fn prepare_create(
        &self,
        parent: &Arc<UnionNode>,
        name: &EntryName,
    ) -> UnionResult<LayerHandle> {
        if !parent.kind().is_directory() {
            return Err(UnionError::NotADirectory);
        }
        if parent.is_deleted().await {
            return Err(UnionError::NotFound(name.clone()));
        }

        match self.resolve(parent, name).await {
            Result::Ok(_) => return Err(UnionError::AlreadyExists(name.clone())),
            Err(err) if err.is_absence() => {}
            Err(err) => return Err(err),
        }

        let upper_parent = parent.upper().await.ok_or(UnionError::ReadOnlyFilesystem)?;
        self.whiteouts.erase(&upper_parent, name).await?;
        Ok(upper_parent)
    }

    /// Finishes a create-through operation: wraps the new upper handle in
    /// a union node, invalidates the parent listing and interns the node
    /// (fault-bypass file/symlink nodes are handed back uncached).
    async fn finish_create(
        &self,
        parent: &Arc<UnionNode>,
        name: &EntryName,
        kind: NodeKind,
        handle: LayerHandle,
        size: u64,
    ) -> Arc<UnionNode> {
        self.invalidate_dir_cache(parent).await;

        if self.options.fault_bypass && !kind.is_directory() {
            return UnionNode::new(
                kind,
                Backing::UpperOnly(handle),
                Some(name.clone()),
                Some(Arc::clone(parent)),
                Some(size),
                None,
                true,
            );
        }

        self.alloc_child(
            parent,
            name,
            kind,
            Backing::UpperOnly(handle),
            Some(size),
            None,
        )
        .await
    }

    /// Creates a regular file under `parent` in the upper layer.
    ///
    /// ## Errors
    ///
    /// `AlreadyExists` if the name is visible in the merged view;
    /// `ReadOnlyFilesystem` if the parent has no upper handle.
    pub async fn create_file(
        &self,
        parent: &Arc<UnionNode>,
        name: &EntryName,
        attrs: &Attributes,
    ) -> UnionResult<Arc<UnionNode>> {
        let upper_parent = self.prepare_create(parent, name).await?;
        let handle = self.upper.create_file(&upper_parent, name, attrs).await?;
        tracing::debug!(%name, "created upper file");
        Ok(self
            .finish_create(parent, name, NodeKind::File, handle, attrs.get_size())
            .await)
    }

    /// Creates a directory under `parent` in the upper layer.
    ///
    /// Creating over a whiteout erases the tombstone, which re-exposes any
    /// same-named lower directory's content through the merge.
    pub async fn make_directory(
        &self,
        parent: &Arc<UnionNode>,
        name: &EntryName,
        attrs: &Attributes,
    ) -> UnionResult<Arc<UnionNode>> {
        let upper_parent = self.prepare_create(parent, name).await?;
        let handle = self.upper.make_directory(&upper_parent, name, attrs).await?;
        tracing::debug!(%name, "created upper directory");

        // The erased whiteout may have re-exposed a lower directory; pick
        // it up so the new node merges instead of shadowing. A lower
        // non-directory stays dropped, as in lookup.
        let lower = match parent.lower().await {
            Some(lower_parent) => match self.lower.lookup(&lower_parent, name).await {
                Result::Ok(LookupStatus::Found(handle)) => {
                    match self.lower.getattr(&handle).await {
                        Result::Ok(attrs) if attrs.get_kind().is_directory() => Some(handle),
                        _ => None,
                    }
                }
                _ => None,
            },
            None => None,
        };

        let backing = match lower {
            Some(lower) => Backing::Merged {
                upper: handle,
                lower,
            },
            None => Backing::UpperOnly(handle),
        };

        self.invalidate_dir_cache(parent).await;
        Ok(self
            .alloc_child(parent, name, NodeKind::Directory, backing, Some(0), None)
            .await)
    }

    /// Creates a symbolic link under `parent` in the upper layer.
    pub async fn make_symlink(
        &self,
        parent: &Arc<UnionNode>,
        name: &EntryName,
        target: &str,
        attrs: &Attributes,
    ) -> UnionResult<Arc<UnionNode>> {
        let upper_parent = self.prepare_create(parent, name).await?;
        let handle = self
            .upper
            .make_symlink(&upper_parent, name, target, attrs)
            .await?;
        tracing::debug!(%name, target, "created upper symlink");
        Ok(self
            .finish_create(parent, name, NodeKind::Symlink, handle, attrs.get_size())
            .await)
    }

    /// Creates a special node (fifo, socket, device) under `parent` in the
    /// upper layer.
    pub async fn make_node(
        &self,
        parent: &Arc<UnionNode>,
        name: &EntryName,
        attrs: &Attributes,
    ) -> UnionResult<Arc<UnionNode>> {
        if matches!(
            attrs.get_kind(),
            NodeKind::File | NodeKind::Directory | NodeKind::Symlink
        ) {
            return Err(UnionError::Unsupported("make_node on a regular kind"));
        }

        let upper_parent = self.prepare_create(parent, name).await?;
        let handle = self.upper.make_node(&upper_parent, name, attrs).await?;
        Ok(self
            .finish_create(parent, name, attrs.get_kind(), handle, 0)
            .await)
    }

    /// Notes an open of the node, routing to the upper handle when present
    /// and otherwise counting a lower-served open.
    pub async fn open(&self, node: &Arc<UnionNode>) -> UnionResult<()> {
        let backing = node.backing().await;
        match backing.upper() {
            Some(upper) => self.upper.open(upper).await,
            None => {
                let lower = backing
                    .lower()
                    .cloned()
                    .expect("union node with neither layer handle");
                self.lower.open(&lower).await?;
                node.meta.lock().await.open_lower_count += 1;
                Ok(())
            }
        }
    }

    /// Notes a close of the node.
    ///
    /// Opens served by the lower layer before a copy-up stay accounted to
    /// the node and are released at reclamation; once an upper handle
    /// exists, closes route to it.
    pub async fn close(&self, node: &Arc<UnionNode>) -> UnionResult<()> {
        let (handle, role) = {
            let mut meta = node.meta.lock().await;
            match meta.backing.upper() {
                Some(upper) => (upper.clone(), LayerRole::Upper),
                None => {
                    if meta.open_lower_count == 0 {
                        panic!("union: lower open count underflow");
                    }
                    meta.open_lower_count -= 1;
                    let lower = meta
                        .backing
                        .lower()
                        .cloned()
                        .expect("union node with neither layer handle");
                    (lower, LayerRole::Lower)
                }
            }
        };
        self.layer(role).close(&handle).await
    }

    /// Fetches merged attributes for the node.
    ///
    /// Upper attributes are authoritative when an upper handle exists. For
    /// merged directories the lower link count is added on top, a
    /// deliberately conservative over-count that defeats link-count-based
    /// tree walkers. Every fetch refreshes the corresponding tracked size.
    pub async fn getattr(&self, node: &Arc<UnionNode>) -> UnionResult<Attributes> {
        let backing = node.backing().await;

        match backing {
            Backing::UpperOnly(upper) => {
                let attrs = self.upper.getattr(&upper).await?;
                node.record_size(LayerRole::Upper, attrs.get_size()).await;
                Ok(attrs)
            }
            Backing::LowerOnly(lower) => {
                let attrs = self.lower.getattr(&lower).await?;
                node.record_size(LayerRole::Lower, attrs.get_size()).await;
                Ok(attrs)
            }
            Backing::Merged { upper, lower } => {
                let mut attrs = self.upper.getattr(&upper).await?;
                node.record_size(LayerRole::Upper, attrs.get_size()).await;

                if node.kind().is_directory() {
                    let lower_attrs = self.lower.getattr(&lower).await?;
                    node.record_size(LayerRole::Lower, lower_attrs.get_size())
                        .await;
                    attrs.set_link_count(
                        attrs.get_link_count() + lower_attrs.get_link_count(),
                    );
                }
                Ok(attrs)
            }
        }
    }

    /// Applies a partial attribute update.
    ///
    /// A size change on a lower-only regular file triggers copy-up first
    /// (truncating copy-up when the new size is zero, the open-with-
    /// `O_TRUNC` case). Updates always target the upper layer;
    /// `ReadOnlyFilesystem` otherwise.
    pub async fn setattr(
        &self,
        node: &Arc<UnionNode>,
        changes: &SetAttributes,
    ) -> UnionResult<()> {
        if let Some(new_size) = *changes.get_size() {
            let needs_copy_up = node.upper().await.is_none() && node.kind().is_file();
            if needs_copy_up {
                self.copy_up(node, new_size == 0).await?;
            }
        }

        let upper = node.upper().await.ok_or(UnionError::ReadOnlyFilesystem)?;
        self.upper.setattr(&upper, changes).await?;

        if let Some(new_size) = *changes.get_size() {
            node.record_size(LayerRole::Upper, new_size).await;
        }
        Ok(())
    }

    /// Reads from the active layer, reconciling the tracked size with the
    /// observed end offset (out-of-band growth of the underlying file).
    pub async fn read(
        &self,
        node: &Arc<UnionNode>,
        offset: u64,
        buf: &mut [u8],
    ) -> UnionResult<usize> {
        let (handle, role) = {
            let meta = node.meta.lock().await;
            let (handle, role) = meta.backing.active();
            (handle.clone(), role)
        };

        let read = self.layer(role).read(&handle, offset, buf).await?;
        if read > 0 {
            node.observe_size(role, offset + read as u64).await;
        }
        Ok(read)
    }

    /// Writes through the upper layer, copying a lower-only file up first.
    pub async fn write(
        &self,
        node: &Arc<UnionNode>,
        offset: u64,
        data: &[u8],
    ) -> UnionResult<usize> {
        if !node.kind().is_file() {
            return Err(UnionError::NotAFile);
        }

        if node.upper().await.is_none() {
            self.copy_up(node, false).await?;
        }

        let upper = match node.upper().await {
            Some(upper) => upper,
            None => panic!("union: missing upper layer in write"),
        };

        let written = self.upper.write(&upper, offset, data).await?;
        if written > 0 {
            node.observe_size(LayerRole::Upper, offset + written as u64)
                .await;
        }
        Ok(written)
    }

    /// Produces the merged, sorted listing of a directory.
    ///
    /// Upper entries win; lower entries are dropped when shadowed by an
    /// upper entry or covered by a whiteout. The result is memoized in the
    /// node's directory cache until a mutation under this directory
    /// invalidates it.
    pub async fn read_directory(&self, node: &Arc<UnionNode>) -> UnionResult<Vec<EntryName>> {
        if !node.kind().is_directory() {
            return Err(UnionError::NotADirectory);
        }

        {
            let meta = node.meta.lock().await;
            if let Some(cache) = &meta.dir_cache {
                return Ok(cache.keys().cloned().collect());
            }
        }

        let backing = node.backing().await;
        let mut merged: BTreeMap<EntryName, DirCacheEntry> = BTreeMap::new();

        if let Some(upper) = backing.upper() {
            for name in self.upper.read_directory(upper).await? {
                if let LookupStatus::Found(handle) = self.upper.lookup(upper, &name).await? {
                    merged.insert(
                        name,
                        DirCacheEntry {
                            role: LayerRole::Upper,
                            handle,
                        },
                    );
                }
            }
        }

        if let Some(lower) = backing.lower() {
            for name in self.lower.read_directory(lower).await? {
                if merged.contains_key(&name) {
                    continue;
                }
                if let Some(upper) = backing.upper() {
                    if self.whiteouts.covers(upper, &name).await? {
                        continue;
                    }
                }
                if let LookupStatus::Found(handle) = self.lower.lookup(lower, &name).await? {
                    merged.insert(
                        name,
                        DirCacheEntry {
                            role: LayerRole::Lower,
                            handle,
                        },
                    );
                }
            }
        }

        let names = merged.keys().cloned().collect();
        node.meta.lock().await.dir_cache = Some(merged);
        Ok(names)
    }

    /// Creates a hard link to `node` named `name` under `dst_parent`,
    /// copying a lower-only file up first.
    pub async fn link(
        &self,
        node: &Arc<UnionNode>,
        dst_parent: &Arc<UnionNode>,
        name: &EntryName,
    ) -> UnionResult<()> {
        if !dst_parent.kind().is_directory() {
            return Err(UnionError::NotADirectory);
        }
        if node.kind().is_directory() {
            return Err(UnionError::PermissionDenied);
        }

        match self.resolve(dst_parent, name).await {
            Result::Ok(_) => return Err(UnionError::AlreadyExists(name.clone())),
            Err(err) if err.is_absence() => {}
            Err(err) => return Err(err),
        }

        if node.upper().await.is_none() {
            if !node.kind().is_file() {
                return Err(UnionError::ReadOnlyFilesystem);
            }
            self.copy_up(node, false).await?;
        }

        let dst_upper = dst_parent
            .upper()
            .await
            .ok_or(UnionError::ReadOnlyFilesystem)?;
        let node_upper = node.upper().await.ok_or(UnionError::ReadOnlyFilesystem)?;

        self.whiteouts.erase(&dst_upper, name).await?;
        self.upper.link(&node_upper, &dst_upper, name).await?;
        self.invalidate_dir_cache(dst_parent).await;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

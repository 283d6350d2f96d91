use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    AdvisoryLock, Attributes, EntryName, Layer, LayerHandle, LookupStatus, NodeKind, PathConfName,
    SetAttributes, UnionError, UnionResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory [`Layer`] implementation backed by shared inodes.
///
/// Useful for tests, demos and temporary namespaces. Handles wrap
/// `Arc<Inode>`, so a node removed from its directory stays readable
/// through any handle still holding it, which is exactly what the union
/// engine's busy-delete relies on.
///
/// A layer can be [frozen](MemoryLayer::freeze) after seeding, turning
/// every later mutation into `PermissionDenied`. Freezing the lower layer
/// of a union proves the engine never writes below.
pub struct MemoryLayer {
    /// The root directory inode.
    root: Arc<Inode>,

    /// Once set, all mutating operations fail.
    frozen: AtomicBool,
}

/// One node of the memory layer.
pub struct Inode {
    /// The node kind, fixed at creation.
    kind: NodeKind,

    /// Mutable state.
    state: RwLock<InodeState>,
}

struct InodeState {
    permissions: u32,
    uid: u32,
    gid: u32,
    link_count: u32,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    accessed_at: DateTime<Utc>,
    open_count: u32,
    payload: Payload,
}

enum Payload {
    File { content: Vec<u8> },
    Directory { entries: BTreeMap<EntryName, MemoryEntry> },
    Symlink { target: String },
    Special,
}

/// A directory slot: a real child or a whiteout tombstone.
enum MemoryEntry {
    Node(Arc<Inode>),
    Whiteout,
}

//--------------------------------------------------------------------------------------------------
// Methods: Inode
//--------------------------------------------------------------------------------------------------

impl Inode {
    fn new(kind: NodeKind, attrs: &Attributes) -> Arc<Self> {
        let payload = match kind {
            NodeKind::File => Payload::File {
                content: Vec::new(),
            },
            NodeKind::Directory => Payload::Directory {
                entries: BTreeMap::new(),
            },
            NodeKind::Symlink => Payload::Symlink {
                target: String::new(),
            },
            _ => Payload::Special,
        };

        Arc::new(Self {
            kind,
            state: RwLock::new(InodeState {
                permissions: attrs.get_permissions(),
                uid: attrs.get_uid(),
                gid: attrs.get_gid(),
                link_count: attrs.get_link_count(),
                created_at: *attrs.get_created_at(),
                modified_at: *attrs.get_modified_at(),
                accessed_at: *attrs.get_accessed_at(),
                open_count: 0,
                payload,
            }),
        })
    }
}

impl InodeState {
    fn size(&self) -> u64 {
        match &self.payload {
            Payload::File { content } => content.len() as u64,
            Payload::Directory { entries } => entries
                .values()
                .filter(|entry| matches!(entry, MemoryEntry::Node(_)))
                .count() as u64,
            Payload::Symlink { target } => target.len() as u64,
            Payload::Special => 0,
        }
    }

    fn attributes(&self, kind: NodeKind) -> Attributes {
        Attributes::new(kind)
            .with_size(self.size())
            .with_permissions(self.permissions)
            .with_owner(self.uid, self.gid)
            .with_link_count(self.link_count)
            .with_timestamps(self.created_at, self.modified_at, self.accessed_at)
    }

    fn entries(&self) -> UnionResult<&BTreeMap<EntryName, MemoryEntry>> {
        match &self.payload {
            Payload::Directory { entries } => Ok(entries),
            _ => Err(UnionError::NotADirectory),
        }
    }

    fn entries_mut(&mut self) -> UnionResult<&mut BTreeMap<EntryName, MemoryEntry>> {
        match &mut self.payload {
            Payload::Directory { entries } => Ok(entries),
            _ => Err(UnionError::NotADirectory),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Methods: MemoryLayer
//--------------------------------------------------------------------------------------------------

impl MemoryLayer {
    /// Creates an empty memory layer.
    pub fn new() -> Self {
        Self {
            root: Inode::new(NodeKind::Directory, &Attributes::new(NodeKind::Directory)),
            frozen: AtomicBool::new(false),
        }
    }

    /// Makes the layer read-only; every later mutation reports
    /// `PermissionDenied`. Opens, closes and reads remain allowed.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    fn check_writable(&self) -> UnionResult<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(UnionError::PermissionDenied);
        }
        Ok(())
    }

    fn inode_of(handle: &LayerHandle) -> UnionResult<Arc<Inode>> {
        handle.downcast::<Inode>().ok_or(UnionError::ForeignHandle)
    }

    fn handle_of(inode: &Arc<Inode>) -> LayerHandle {
        LayerHandle::from_arc(Arc::clone(inode))
    }

    /// Splits a `/`-separated path into validated component names.
    fn components(path: &str) -> UnionResult<Vec<EntryName>> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .map(EntryName::try_from)
            .collect()
    }

    /// Resolves a path to an inode, treating whiteouts as absent.
    async fn walk(&self, path: &str) -> Option<Arc<Inode>> {
        let components = Self::components(path).ok()?;
        let mut current = Arc::clone(&self.root);

        for component in components {
            let next = {
                let state = current.state.read().await;
                match state.entries().ok()?.get(&component) {
                    Some(MemoryEntry::Node(inode)) => Arc::clone(inode),
                    _ => return None,
                }
            };
            current = next;
        }
        Some(current)
    }

    /// Creates the directory chain for `components`, returning the final
    /// directory inode.
    async fn ensure_directories(&self, components: &[EntryName]) -> UnionResult<Arc<Inode>> {
        let mut current = Arc::clone(&self.root);

        for component in components {
            let existing = {
                let state = current.state.read().await;
                match state.entries()?.get(component) {
                    Some(MemoryEntry::Node(inode)) => Some(Arc::clone(inode)),
                    Some(MemoryEntry::Whiteout) => None,
                    None => None,
                }
            };

            let next = match existing {
                Some(inode) => {
                    if !inode.kind.is_directory() {
                        return Err(UnionError::NotADirectory);
                    }
                    inode
                }
                None => {
                    let dir = Inode::new(
                        NodeKind::Directory,
                        &Attributes::new(NodeKind::Directory),
                    );
                    let mut state = current.state.write().await;
                    state
                        .entries_mut()?
                        .insert(component.clone(), MemoryEntry::Node(Arc::clone(&dir)));
                    state.link_count += 1;
                    dir
                }
            };
            current = next;
        }
        Ok(current)
    }

    /// Seeds a regular file at `path`, creating parent directories.
    pub async fn seed_file(&self, path: &str, content: &[u8]) -> UnionResult<()> {
        self.check_writable()?;
        let mut components = Self::components(path)?;
        let name = components.pop().ok_or(UnionError::EmptyEntryName)?;
        let parent = self.ensure_directories(&components).await?;

        let file = Inode::new(NodeKind::File, &Attributes::new(NodeKind::File));
        {
            let mut state = file.state.write().await;
            if let Payload::File { content: slot } = &mut state.payload {
                slot.extend_from_slice(content);
            }
        }

        let mut state = parent.state.write().await;
        if state.entries()?.contains_key(&name) {
            return Err(UnionError::AlreadyExists(name));
        }
        state.entries_mut()?.insert(name, MemoryEntry::Node(file));
        Ok(())
    }

    /// Seeds a directory at `path`, creating parents.
    pub async fn seed_directory(&self, path: &str) -> UnionResult<()> {
        self.check_writable()?;
        let components = Self::components(path)?;
        self.ensure_directories(&components).await?;
        Ok(())
    }

    /// Seeds a symbolic link at `path`, creating parent directories.
    pub async fn seed_symlink(&self, path: &str, target: &str) -> UnionResult<()> {
        self.check_writable()?;
        let mut components = Self::components(path)?;
        let name = components.pop().ok_or(UnionError::EmptyEntryName)?;
        let parent = self.ensure_directories(&components).await?;

        let link = Inode::new(NodeKind::Symlink, &Attributes::new(NodeKind::Symlink));
        {
            let mut state = link.state.write().await;
            if let Payload::Symlink { target: slot } = &mut state.payload {
                slot.push_str(target);
            }
        }

        let mut state = parent.state.write().await;
        if state.entries()?.contains_key(&name) {
            return Err(UnionError::AlreadyExists(name));
        }
        state.entries_mut()?.insert(name, MemoryEntry::Node(link));
        Ok(())
    }

    /// Reports whether a real (non-whiteout) entry exists at `path`.
    pub async fn contains(&self, path: &str) -> bool {
        self.walk(path).await.is_some()
    }

    /// Returns the content of the file at `path`.
    pub async fn content_of(&self, path: &str) -> Option<Vec<u8>> {
        let inode = self.walk(path).await?;
        let state = inode.state.read().await;
        match &state.payload {
            Payload::File { content } => Some(content.clone()),
            _ => None,
        }
    }

    /// Returns the attributes of the node at `path`.
    pub async fn attrs_at(&self, path: &str) -> Option<Attributes> {
        let inode = self.walk(path).await?;
        let state = inode.state.read().await;
        Some(state.attributes(inode.kind))
    }

    /// Returns the open count of the node at `path`.
    pub async fn open_count_of(&self, path: &str) -> Option<u32> {
        let inode = self.walk(path).await?;
        let state = inode.state.read().await;
        Some(state.open_count)
    }

    /// Inserts a freshly built inode under `parent`, rejecting occupied
    /// names (including whiteouts; callers erase those first).
    async fn insert_child(
        &self,
        parent: &LayerHandle,
        name: &EntryName,
        child: Arc<Inode>,
    ) -> UnionResult<LayerHandle> {
        let parent = Self::inode_of(parent)?;
        let is_directory = child.kind.is_directory();

        let mut state = parent.state.write().await;
        if state.entries()?.contains_key(name) {
            return Err(UnionError::AlreadyExists(name.clone()));
        }
        state
            .entries_mut()?
            .insert(name.clone(), MemoryEntry::Node(Arc::clone(&child)));
        if is_directory {
            state.link_count += 1;
        }
        state.modified_at = Utc::now();
        Ok(Self::handle_of(&child))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for MemoryLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Layer for MemoryLayer {
    async fn root(&self) -> UnionResult<LayerHandle> {
        Ok(Self::handle_of(&self.root))
    }

    async fn lookup(&self, parent: &LayerHandle, name: &EntryName) -> UnionResult<LookupStatus> {
        let parent = Self::inode_of(parent)?;
        let state = parent.state.read().await;
        match state.entries()?.get(name) {
            Some(MemoryEntry::Node(inode)) => Ok(LookupStatus::Found(Self::handle_of(inode))),
            Some(MemoryEntry::Whiteout) | None => Ok(LookupStatus::Absent),
        }
    }

    async fn getattr(&self, handle: &LayerHandle) -> UnionResult<Attributes> {
        let inode = Self::inode_of(handle)?;
        let state = inode.state.read().await;
        Ok(state.attributes(inode.kind))
    }

    async fn setattr(&self, handle: &LayerHandle, changes: &SetAttributes) -> UnionResult<()> {
        self.check_writable()?;
        let inode = Self::inode_of(handle)?;
        let mut state = inode.state.write().await;

        if let Some(size) = *changes.get_size() {
            match &mut state.payload {
                Payload::File { content } => content.resize(size as usize, 0),
                _ => return Err(UnionError::NotAFile),
            }
        }
        if let Some(permissions) = *changes.get_permissions() {
            state.permissions = permissions & 0o777;
        }
        if let Some(uid) = *changes.get_uid() {
            state.uid = uid;
        }
        if let Some(gid) = *changes.get_gid() {
            state.gid = gid;
        }
        if let Some(modified_at) = *changes.get_modified_at() {
            state.modified_at = modified_at;
        }
        if let Some(accessed_at) = *changes.get_accessed_at() {
            state.accessed_at = accessed_at;
        }
        Ok(())
    }

    async fn create_file(
        &self,
        parent: &LayerHandle,
        name: &EntryName,
        attrs: &Attributes,
    ) -> UnionResult<LayerHandle> {
        self.check_writable()?;
        let file = Inode::new(NodeKind::File, attrs);
        self.insert_child(parent, name, file).await
    }

    async fn make_directory(
        &self,
        parent: &LayerHandle,
        name: &EntryName,
        attrs: &Attributes,
    ) -> UnionResult<LayerHandle> {
        self.check_writable()?;
        let dir = Inode::new(NodeKind::Directory, attrs);
        self.insert_child(parent, name, dir).await
    }

    async fn make_symlink(
        &self,
        parent: &LayerHandle,
        name: &EntryName,
        target: &str,
        attrs: &Attributes,
    ) -> UnionResult<LayerHandle> {
        self.check_writable()?;
        let link = Inode::new(NodeKind::Symlink, attrs);
        {
            let mut state = link.state.write().await;
            if let Payload::Symlink { target: slot } = &mut state.payload {
                slot.push_str(target);
            }
        }
        self.insert_child(parent, name, link).await
    }

    async fn make_node(
        &self,
        parent: &LayerHandle,
        name: &EntryName,
        attrs: &Attributes,
    ) -> UnionResult<LayerHandle> {
        self.check_writable()?;
        if matches!(
            attrs.get_kind(),
            NodeKind::File | NodeKind::Directory | NodeKind::Symlink
        ) {
            return Err(UnionError::Unsupported("make_node on a regular kind"));
        }
        let node = Inode::new(attrs.get_kind(), attrs);
        self.insert_child(parent, name, node).await
    }

    async fn read_symlink(&self, handle: &LayerHandle) -> UnionResult<String> {
        let inode = Self::inode_of(handle)?;
        let state = inode.state.read().await;
        match &state.payload {
            Payload::Symlink { target } => Ok(target.clone()),
            _ => Err(UnionError::NotASymlink),
        }
    }

    async fn remove(
        &self,
        parent: &LayerHandle,
        handle: &LayerHandle,
        name: &EntryName,
    ) -> UnionResult<()> {
        self.check_writable()?;
        let parent = Self::inode_of(parent)?;
        let victim = Self::inode_of(handle)?;
        if victim.kind.is_directory() {
            return Err(UnionError::PermissionDenied);
        }

        let mut state = parent.state.write().await;
        match state.entries()?.get(name) {
            Some(MemoryEntry::Node(inode)) if Arc::ptr_eq(inode, &victim) => {}
            _ => return Err(UnionError::NotFound(name.clone())),
        }
        state.entries_mut()?.remove(name);
        state.modified_at = Utc::now();
        drop(state);

        let mut victim_state = victim.state.write().await;
        victim_state.link_count = victim_state.link_count.saturating_sub(1);
        Ok(())
    }

    async fn remove_directory(
        &self,
        parent: &LayerHandle,
        handle: &LayerHandle,
        name: &EntryName,
    ) -> UnionResult<()> {
        self.check_writable()?;
        let parent = Self::inode_of(parent)?;
        let victim = Self::inode_of(handle)?;
        if !victim.kind.is_directory() {
            return Err(UnionError::NotADirectory);
        }

        // Whiteout slots die with the directory; only real children make
        // it non-empty.
        {
            let state = victim.state.read().await;
            let occupied = state
                .entries()?
                .values()
                .any(|entry| matches!(entry, MemoryEntry::Node(_)));
            if occupied {
                return Err(UnionError::NotEmpty(name.clone()));
            }
        }

        let mut state = parent.state.write().await;
        match state.entries()?.get(name) {
            Some(MemoryEntry::Node(inode)) if Arc::ptr_eq(inode, &victim) => {}
            _ => return Err(UnionError::NotFound(name.clone())),
        }
        state.entries_mut()?.remove(name);
        state.link_count = state.link_count.saturating_sub(1);
        state.modified_at = Utc::now();
        Ok(())
    }

    async fn rename(
        &self,
        src_parent: &LayerHandle,
        src: &LayerHandle,
        src_name: &EntryName,
        dst_parent: &LayerHandle,
        dst_name: &EntryName,
    ) -> UnionResult<()> {
        self.check_writable()?;
        let src_parent = Self::inode_of(src_parent)?;
        let dst_parent = Self::inode_of(dst_parent)?;
        let moved = Self::inode_of(src)?;

        if Arc::ptr_eq(&src_parent, &dst_parent) {
            let mut state = src_parent.state.write().await;
            match state.entries()?.get(src_name) {
                Some(MemoryEntry::Node(inode)) if Arc::ptr_eq(inode, &moved) => {}
                _ => return Err(UnionError::NotFound(src_name.clone())),
            }
            if state.entries()?.contains_key(dst_name) {
                return Err(UnionError::AlreadyExists(dst_name.clone()));
            }
            state.entries_mut()?.remove(src_name);
            state
                .entries_mut()?
                .insert(dst_name.clone(), MemoryEntry::Node(moved));
            state.modified_at = Utc::now();
            return Ok(());
        }

        // Distinct parents: lock in address order so two opposing renames
        // cannot deadlock.
        let (first, second) = if Arc::as_ptr(&src_parent) < Arc::as_ptr(&dst_parent) {
            (Arc::clone(&src_parent), Arc::clone(&dst_parent))
        } else {
            (Arc::clone(&dst_parent), Arc::clone(&src_parent))
        };
        let mut first_state = first.state.write().await;
        let mut second_state = second.state.write().await;
        let (src_state, dst_state) = if Arc::ptr_eq(&first, &src_parent) {
            (&mut first_state, &mut second_state)
        } else {
            (&mut second_state, &mut first_state)
        };

        match src_state.entries()?.get(src_name) {
            Some(MemoryEntry::Node(inode)) if Arc::ptr_eq(inode, &moved) => {}
            _ => return Err(UnionError::NotFound(src_name.clone())),
        }
        if dst_state.entries()?.contains_key(dst_name) {
            return Err(UnionError::AlreadyExists(dst_name.clone()));
        }

        src_state.entries_mut()?.remove(src_name);
        dst_state
            .entries_mut()?
            .insert(dst_name.clone(), MemoryEntry::Node(Arc::clone(&moved)));
        if moved.kind.is_directory() {
            src_state.link_count = src_state.link_count.saturating_sub(1);
            dst_state.link_count += 1;
        }
        let now = Utc::now();
        src_state.modified_at = now;
        dst_state.modified_at = now;
        Ok(())
    }

    async fn link(
        &self,
        handle: &LayerHandle,
        dst_parent: &LayerHandle,
        name: &EntryName,
    ) -> UnionResult<()> {
        self.check_writable()?;
        let inode = Self::inode_of(handle)?;
        if inode.kind.is_directory() {
            return Err(UnionError::PermissionDenied);
        }
        let dst_parent = Self::inode_of(dst_parent)?;

        let mut state = dst_parent.state.write().await;
        if state.entries()?.contains_key(name) {
            return Err(UnionError::AlreadyExists(name.clone()));
        }
        state
            .entries_mut()?
            .insert(name.clone(), MemoryEntry::Node(Arc::clone(&inode)));
        state.modified_at = Utc::now();
        drop(state);

        let mut inode_state = inode.state.write().await;
        inode_state.link_count += 1;
        Ok(())
    }

    async fn read(&self, handle: &LayerHandle, offset: u64, buf: &mut [u8]) -> UnionResult<usize> {
        let inode = Self::inode_of(handle)?;
        let mut state = inode.state.write().await;
        state.accessed_at = Utc::now();
        match &state.payload {
            Payload::File { content } => {
                let offset = offset as usize;
                if offset >= content.len() {
                    return Ok(0);
                }
                let available = content.len() - offset;
                let count = available.min(buf.len());
                buf[..count].copy_from_slice(&content[offset..offset + count]);
                Ok(count)
            }
            _ => Err(UnionError::NotAFile),
        }
    }

    async fn write(&self, handle: &LayerHandle, offset: u64, data: &[u8]) -> UnionResult<usize> {
        self.check_writable()?;
        let inode = Self::inode_of(handle)?;
        let mut state = inode.state.write().await;
        state.modified_at = Utc::now();
        match &mut state.payload {
            Payload::File { content } => {
                let offset = offset as usize;
                let end = offset + data.len();
                if content.len() < end {
                    content.resize(end, 0);
                }
                content[offset..end].copy_from_slice(data);
                Ok(data.len())
            }
            _ => Err(UnionError::NotAFile),
        }
    }

    async fn open(&self, handle: &LayerHandle) -> UnionResult<()> {
        let inode = Self::inode_of(handle)?;
        let mut state = inode.state.write().await;
        state.open_count += 1;
        Ok(())
    }

    async fn close(&self, handle: &LayerHandle) -> UnionResult<()> {
        let inode = Self::inode_of(handle)?;
        let mut state = inode.state.write().await;
        state.open_count = state.open_count.saturating_sub(1);
        Ok(())
    }

    async fn read_directory(&self, handle: &LayerHandle) -> UnionResult<Vec<EntryName>> {
        let inode = Self::inode_of(handle)?;
        let state = inode.state.read().await;
        Ok(state
            .entries()?
            .iter()
            .filter(|(_, entry)| matches!(entry, MemoryEntry::Node(_)))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn create_whiteout(&self, parent: &LayerHandle, name: &EntryName) -> UnionResult<()> {
        self.check_writable()?;
        let parent = Self::inode_of(parent)?;
        let mut state = parent.state.write().await;
        match state.entries()?.get(name) {
            Some(MemoryEntry::Node(_)) => Err(UnionError::AlreadyExists(name.clone())),
            Some(MemoryEntry::Whiteout) => Ok(()),
            None => {
                state
                    .entries_mut()?
                    .insert(name.clone(), MemoryEntry::Whiteout);
                Ok(())
            }
        }
    }

    async fn remove_whiteout(&self, parent: &LayerHandle, name: &EntryName) -> UnionResult<()> {
        self.check_writable()?;
        let parent = Self::inode_of(parent)?;
        let mut state = parent.state.write().await;
        match state.entries()?.get(name) {
            Some(MemoryEntry::Whiteout) => {
                state.entries_mut()?.remove(name);
                Ok(())
            }
            _ => Err(UnionError::NotFound(name.clone())),
        }
    }

    async fn detect_whiteout(&self, parent: &LayerHandle, name: &EntryName) -> UnionResult<bool> {
        let parent = Self::inode_of(parent)?;
        let state = parent.state.read().await;
        Ok(matches!(
            state.entries()?.get(name),
            Some(MemoryEntry::Whiteout)
        ))
    }

    async fn pathconf(&self, _handle: &LayerHandle, name: PathConfName) -> UnionResult<u64> {
        match name {
            PathConfName::NameMax => Ok(255),
            PathConfName::PathMax => Ok(4096),
            PathConfName::LinkMax => Ok(65535),
            PathConfName::PipeBuf => Ok(512),
        }
    }

    async fn advisory_lock(&self, _handle: &LayerHandle, _lock: &AdvisoryLock) -> UnionResult<()> {
        Err(UnionError::Unsupported("advisory_lock"))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> EntryName {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_memory_seeding_and_walk() {
        let layer = MemoryLayer::new();
        layer.seed_file("a/b/c.txt", b"deep").await.unwrap();
        layer.seed_directory("a/empty").await.unwrap();
        layer.seed_symlink("a/l", "b/c.txt").await.unwrap();

        assert!(layer.contains("a").await);
        assert!(layer.contains("a/b/c.txt").await);
        assert!(layer.contains("a/empty").await);
        assert_eq!(layer.content_of("a/b/c.txt").await.unwrap(), b"deep");
        assert!(!layer.contains("a/missing").await);
    }

    #[tokio::test]
    async fn test_memory_lookup_and_getattr() {
        let layer = MemoryLayer::new();
        layer.seed_file("f", b"1234").await.unwrap();

        let root = layer.root().await.unwrap();
        let handle = match layer.lookup(&root, &name("f")).await.unwrap() {
            LookupStatus::Found(handle) => handle,
            _ => panic!("seeded entry missing"),
        };

        let attrs = layer.getattr(&handle).await.unwrap();
        assert_eq!(attrs.get_kind(), NodeKind::File);
        assert_eq!(attrs.get_size(), 4);

        assert!(matches!(
            layer.lookup(&root, &name("missing")).await.unwrap(),
            LookupStatus::Absent
        ));
    }

    #[tokio::test]
    async fn test_memory_read_write_with_gap() {
        let layer = MemoryLayer::new();
        layer.seed_file("f", b"ab").await.unwrap();
        let root = layer.root().await.unwrap();
        let handle = match layer.lookup(&root, &name("f")).await.unwrap() {
            LookupStatus::Found(handle) => handle,
            _ => panic!("seeded entry missing"),
        };

        // Writing past the end zero-fills the gap.
        layer.write(&handle, 4, b"cd").await.unwrap();
        assert_eq!(layer.content_of("f").await.unwrap(), b"ab\0\0cd");

        let mut buf = [0u8; 3];
        let read = layer.read(&handle, 4, &mut buf).await.unwrap();
        assert_eq!(read, 2);
        assert_eq!(&buf[..2], b"cd");

        // Reads at or past the end return 0.
        assert_eq!(layer.read(&handle, 100, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_removed_inode_stays_readable_through_handle() {
        let layer = MemoryLayer::new();
        layer.seed_file("f", b"survivor").await.unwrap();
        let root = layer.root().await.unwrap();
        let handle = match layer.lookup(&root, &name("f")).await.unwrap() {
            LookupStatus::Found(handle) => handle,
            _ => panic!("seeded entry missing"),
        };

        layer.remove(&root, &handle, &name("f")).await.unwrap();
        assert!(!layer.contains("f").await);

        let mut buf = [0u8; 16];
        let read = layer.read(&handle, 0, &mut buf).await.unwrap();
        assert_eq!(&buf[..read], b"survivor");
    }

    #[tokio::test]
    async fn test_memory_whiteout_lifecycle() {
        let layer = MemoryLayer::new();
        let root = layer.root().await.unwrap();
        let gone = name("gone");

        assert!(!layer.detect_whiteout(&root, &gone).await.unwrap());
        layer.create_whiteout(&root, &gone).await.unwrap();
        assert!(layer.detect_whiteout(&root, &gone).await.unwrap());

        // Whiteouts are invisible to lookup and listing.
        assert!(matches!(
            layer.lookup(&root, &gone).await.unwrap(),
            LookupStatus::Absent
        ));
        assert!(layer.read_directory(&root).await.unwrap().is_empty());

        layer.remove_whiteout(&root, &gone).await.unwrap();
        assert!(!layer.detect_whiteout(&root, &gone).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_rmdir_ignores_whiteout_slots() {
        let layer = MemoryLayer::new();
        layer.seed_directory("d").await.unwrap();
        let root = layer.root().await.unwrap();
        let d = match layer.lookup(&root, &name("d")).await.unwrap() {
            LookupStatus::Found(handle) => handle,
            _ => panic!("seeded entry missing"),
        };

        layer.create_whiteout(&d, &name("tomb")).await.unwrap();
        layer.remove_directory(&root, &d, &name("d")).await.unwrap();
        assert!(!layer.contains("d").await);
    }

    #[tokio::test]
    async fn test_memory_freeze_blocks_mutations() {
        let layer = MemoryLayer::new();
        layer.seed_file("f", b"ro").await.unwrap();
        layer.freeze();

        let root = layer.root().await.unwrap();
        let handle = match layer.lookup(&root, &name("f")).await.unwrap() {
            LookupStatus::Found(handle) => handle,
            _ => panic!("seeded entry missing"),
        };

        assert!(matches!(
            layer.write(&handle, 0, b"x").await.unwrap_err(),
            UnionError::PermissionDenied
        ));
        assert!(matches!(
            layer
                .create_file(&root, &name("new"), &Attributes::new(NodeKind::File))
                .await
                .unwrap_err(),
            UnionError::PermissionDenied
        ));
        assert!(matches!(
            layer.seed_file("late", b"").await.unwrap_err(),
            UnionError::PermissionDenied
        ));

        // Reads, opens and closes still work.
        let mut buf = [0u8; 2];
        assert_eq!(layer.read(&handle, 0, &mut buf).await.unwrap(), 2);
        layer.open(&handle).await.unwrap();
        layer.close(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_link_counts() {
        let layer = MemoryLayer::new();
        layer.seed_file("f", b"x").await.unwrap();
        layer.seed_directory("d").await.unwrap();

        // A subdirectory bumps the parent's link count (2 + subdirs).
        let root_attrs = {
            let root = layer.root().await.unwrap();
            layer.getattr(&root).await.unwrap()
        };
        assert_eq!(root_attrs.get_link_count(), 3);

        let root = layer.root().await.unwrap();
        let f = match layer.lookup(&root, &name("f")).await.unwrap() {
            LookupStatus::Found(handle) => handle,
            _ => panic!("seeded entry missing"),
        };
        layer.link(&f, &root, &name("hard")).await.unwrap();
        assert_eq!(layer.getattr(&f).await.unwrap().get_link_count(), 2);

        // Both names reach the same content.
        layer.write(&f, 0, b"y").await.unwrap();
        assert_eq!(layer.content_of("hard").await.unwrap(), b"y");
    }

    #[tokio::test]
    async fn test_memory_rename_across_directories() {
        let layer = MemoryLayer::new();
        layer.seed_file("a/f", b"moving").await.unwrap();
        layer.seed_directory("b").await.unwrap();

        let root = layer.root().await.unwrap();
        let a = match layer.lookup(&root, &name("a")).await.unwrap() {
            LookupStatus::Found(handle) => handle,
            _ => panic!("seeded entry missing"),
        };
        let b = match layer.lookup(&root, &name("b")).await.unwrap() {
            LookupStatus::Found(handle) => handle,
            _ => panic!("seeded entry missing"),
        };
        let f = match layer.lookup(&a, &name("f")).await.unwrap() {
            LookupStatus::Found(handle) => handle,
            _ => panic!("seeded entry missing"),
        };

        layer.rename(&a, &f, &name("f"), &b, &name("g")).await.unwrap();
        assert!(!layer.contains("a/f").await);
        assert_eq!(layer.content_of("b/g").await.unwrap(), b"moving");
    }

    #[tokio::test]
    async fn test_memory_foreign_handle_rejected() {
        let layer = MemoryLayer::new();
        let fake = LayerHandle::new(42u32);
        assert!(matches!(
            layer.getattr(&fake).await.unwrap_err(),
            UnionError::ForeignHandle
        ));
    }
}

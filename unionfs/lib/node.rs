use std::{
    collections::BTreeMap,
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::{Mutex, Notify};

use crate::{EntryName, LayerHandle, LayerRole, NodeKind};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The layer handles backing a union node.
///
/// A live node always holds at least one handle; there is no empty variant.
/// Once an upper handle exists, all mutations target it and the lower
/// handle becomes read-only historical backing (kept alive for link-count
/// hints and so directory-cache entries stay valid).
#[derive(Clone, Debug)]
pub enum Backing {
    /// Only the upper layer knows this node.
    UpperOnly(LayerHandle),

    /// Only the lower layer knows this node; mutations require copy-up.
    LowerOnly(LayerHandle),

    /// Both layers know this node: merged directories, and files after
    /// copy-up.
    Merged {
        /// The authoritative upper handle.
        upper: LayerHandle,

        /// The historical lower handle.
        lower: LayerHandle,
    },
}

/// The per-node exclusive section used to serialize copy-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyUpState {
    /// No structural mutation in flight.
    Idle,

    /// A copy-up (or equivalent structural mutation) holds the section.
    CopyingUp,
}

/// One entry of a node's merged-directory cache.
#[derive(Clone, Debug)]
pub(crate) struct DirCacheEntry {
    /// Which layer supplies the entry.
    pub(crate) role: LayerRole,

    /// Handle to the child in that layer.
    pub(crate) handle: LayerHandle,
}

/// The mutable merge state of a union node.
///
/// Guarded by the node's metadata mutex, which is never held across a
/// layer call. When the name cache is also involved (the `cached` flag),
/// the cache lock is taken first.
pub(crate) struct NodeMeta {
    /// The layer handles backing the node.
    pub(crate) backing: Backing,

    /// Component name relative to the parent; `None` for the root. Kept
    /// so a whiteout can be recreated after the node itself is removed.
    pub(crate) name: Option<EntryName>,

    /// Parent union node, held strongly for the node's lifetime; `None`
    /// for the root. Children never appear strongly in a parent, so no
    /// cycle forms.
    pub(crate) parent: Option<Arc<UnionNode>>,

    /// Last observed upper-layer size.
    pub(crate) upper_size: Option<u64>,

    /// Last observed lower-layer size.
    pub(crate) lower_size: Option<u64>,

    /// Set when a still-referenced node is unlinked; such a node is never
    /// visible through a fresh lookup and exists only for already-open
    /// references.
    pub(crate) deleted: bool,

    /// Whether the node is indexed in the name cache. Transitions are
    /// atomic with cache-map membership.
    pub(crate) cached: bool,

    /// Nodes in fault-bypass mode never materialize an upper handle.
    pub(crate) fault_bypass: bool,

    /// Opens served by the lower layer while no upper handle existed;
    /// released against the lower layer on close and at reclamation.
    pub(crate) open_lower_count: u32,

    /// Memoized merged directory listing.
    pub(crate) dir_cache: Option<BTreeMap<EntryName, DirCacheEntry>>,

    /// The copy-up exclusive section.
    pub(crate) copy_up: CopyUpState,

    /// Whether a waiter is suspended on the exclusive section.
    pub(crate) copy_up_wanted: bool,

    /// Second strong owner of the upper handle taken by a busy delete,
    /// released exactly once at reclamation.
    pub(crate) deferred_upper: Option<LayerHandle>,
}

/// The merged identity for one logical path across both layers.
///
/// Nodes are allocated by the lookup engine (or by create-through and
/// copy-up operations) and handed out as `Arc<UnionNode>`; the engine's
/// name cache holds only weak references, so a node's lifetime is exactly
/// that of its longest external holder.
pub struct UnionNode {
    /// Stable identity, used as the name-cache key component.
    id: u64,

    /// The node kind, fixed at allocation.
    kind: NodeKind,

    /// Mutable merge state.
    pub(crate) meta: Mutex<NodeMeta>,

    /// Wakes waiters when the copy-up exclusive section is released.
    pub(crate) copy_up_done: Notify,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Backing {
    /// Returns the upper handle, if present.
    pub fn upper(&self) -> Option<&LayerHandle> {
        match self {
            Backing::UpperOnly(upper) => Some(upper),
            Backing::Merged { upper, .. } => Some(upper),
            Backing::LowerOnly(_) => None,
        }
    }

    /// Returns the lower handle, if present.
    pub fn lower(&self) -> Option<&LayerHandle> {
        match self {
            Backing::LowerOnly(lower) => Some(lower),
            Backing::Merged { lower, .. } => Some(lower),
            Backing::UpperOnly(_) => None,
        }
    }

    /// Returns the handle all non-mutating traffic should use: the upper
    /// handle when present, the lower one otherwise.
    pub fn active(&self) -> (&LayerHandle, LayerRole) {
        match self {
            Backing::UpperOnly(upper) | Backing::Merged { upper, .. } => {
                (upper, LayerRole::Upper)
            }
            Backing::LowerOnly(lower) => (lower, LayerRole::Lower),
        }
    }

    /// Returns `true` if an upper handle is present.
    pub fn has_upper(&self) -> bool {
        self.upper().is_some()
    }

    /// Promotes a lower-only backing with a freshly created upper handle.
    ///
    /// Panics if the node already has an upper handle; copy-up holds the
    /// exclusive section, so a double promotion is a programming error.
    pub(crate) fn promote(&mut self, upper: LayerHandle) {
        match self {
            Backing::LowerOnly(lower) => {
                *self = Backing::Merged {
                    upper,
                    lower: lower.clone(),
                };
            }
            _ => panic!("union node promoted twice"),
        }
    }
}

impl UnionNode {
    /// Allocates a new node.
    pub(crate) fn new(
        kind: NodeKind,
        backing: Backing,
        name: Option<EntryName>,
        parent: Option<Arc<UnionNode>>,
        upper_size: Option<u64>,
        lower_size: Option<u64>,
        fault_bypass: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            meta: Mutex::new(NodeMeta {
                backing,
                name,
                parent,
                upper_size,
                lower_size,
                deleted: false,
                cached: false,
                fault_bypass,
                open_lower_count: 0,
                dir_cache: None,
                copy_up: CopyUpState::Idle,
                copy_up_wanted: false,
                deferred_upper: None,
            }),
            copy_up_done: Notify::new(),
        })
    }

    /// Returns the node's stable identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the node kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Returns a clone of the upper handle, if present.
    pub async fn upper(&self) -> Option<LayerHandle> {
        self.meta.lock().await.backing.upper().cloned()
    }

    /// Returns a clone of the lower handle, if present.
    pub async fn lower(&self) -> Option<LayerHandle> {
        self.meta.lock().await.backing.lower().cloned()
    }

    /// Returns a snapshot of the backing handles.
    pub async fn backing(&self) -> Backing {
        self.meta.lock().await.backing.clone()
    }

    /// Returns the component name relative to the parent; `None` for the
    /// root.
    pub async fn name(&self) -> Option<EntryName> {
        self.meta.lock().await.name.clone()
    }

    /// Returns `true` if the node has been unlinked but kept alive for
    /// already-open references.
    pub async fn is_deleted(&self) -> bool {
        self.meta.lock().await.deleted
    }

    /// Returns the exposed logical size: the upper size when an upper
    /// handle exists, the lower size otherwise.
    pub async fn size(&self) -> Option<u64> {
        let meta = self.meta.lock().await;
        if meta.backing.has_upper() {
            meta.upper_size
        } else {
            meta.lower_size
        }
    }

    /// Returns the parent union node; `None` for the root.
    pub async fn parent_node(&self) -> Option<Arc<UnionNode>> {
        let meta = self.meta.lock().await;
        meta.parent.clone()
    }

    /// Acquires the node's exclusive section, suspending while another
    /// copy-up holds it.
    ///
    /// The section must be released with [`UnionNode::end_exclusive`] on
    /// every path, including errors.
    pub(crate) async fn begin_exclusive(&self) {
        loop {
            let mut notified = std::pin::pin!(self.copy_up_done.notified());
            // Register for the wakeup before inspecting the state; a
            // release between the check and the await must not be missed.
            notified.as_mut().enable();
            {
                let mut meta = self.meta.lock().await;
                if meta.copy_up == CopyUpState::Idle {
                    meta.copy_up = CopyUpState::CopyingUp;
                    return;
                }
                meta.copy_up_wanted = true;
            }
            notified.await;
        }
    }

    /// Releases the node's exclusive section and wakes any waiter.
    pub(crate) async fn end_exclusive(&self) {
        let wake = {
            let mut meta = self.meta.lock().await;
            meta.copy_up = CopyUpState::Idle;
            let wake = meta.copy_up_wanted;
            meta.copy_up_wanted = false;
            wake
        };
        if wake {
            self.copy_up_done.notify_waiters();
        }
    }

    /// Reconciles a tracked size with an observed end offset; sizes only
    /// grow through this path.
    pub(crate) async fn observe_size(&self, role: LayerRole, end_offset: u64) {
        let mut meta = self.meta.lock().await;
        let tracked = match role {
            LayerRole::Upper => &mut meta.upper_size,
            LayerRole::Lower => &mut meta.lower_size,
        };
        match tracked {
            Some(size) if end_offset <= *size => {}
            _ => *tracked = Some(end_offset),
        }
    }

    /// Records an explicitly set size, the only path a tracked size may
    /// shrink through.
    pub(crate) async fn record_size(&self, role: LayerRole, size: u64) {
        let mut meta = self.meta.lock().await;
        match role {
            LayerRole::Upper => meta.upper_size = Some(size),
            LayerRole::Lower => meta.lower_size = Some(size),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Debug for UnionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnionNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LayerHandle;

    fn handle() -> LayerHandle {
        LayerHandle::new(())
    }

    #[test]
    fn test_backing_accessors() {
        let upper_only = Backing::UpperOnly(handle());
        assert!(upper_only.has_upper());
        assert!(upper_only.lower().is_none());
        assert_eq!(upper_only.active().1, LayerRole::Upper);

        let lower_only = Backing::LowerOnly(handle());
        assert!(!lower_only.has_upper());
        assert_eq!(lower_only.active().1, LayerRole::Lower);

        let merged = Backing::Merged {
            upper: handle(),
            lower: handle(),
        };
        assert!(merged.has_upper());
        assert!(merged.lower().is_some());
        assert_eq!(merged.active().1, LayerRole::Upper);
    }

    #[test]
    fn test_backing_promote() {
        let lower = handle();
        let mut backing = Backing::LowerOnly(lower.clone());
        let upper = handle();
        backing.promote(upper.clone());

        assert!(backing.upper().unwrap().same_node(&upper));
        assert!(backing.lower().unwrap().same_node(&lower));
    }

    #[test]
    #[should_panic(expected = "promoted twice")]
    fn test_backing_double_promote_panics() {
        let mut backing = Backing::UpperOnly(handle());
        backing.promote(handle());
    }

    #[tokio::test]
    async fn test_node_size_tracking() {
        let node = UnionNode::new(
            NodeKind::File,
            Backing::LowerOnly(handle()),
            Some("f".parse().unwrap()),
            None,
            None,
            Some(10),
            false,
        );

        // Exposed size follows the lower layer while no upper exists.
        assert_eq!(node.size().await, Some(10));

        // Observations only grow the tracked size.
        node.observe_size(LayerRole::Lower, 4).await;
        assert_eq!(node.size().await, Some(10));
        node.observe_size(LayerRole::Lower, 16).await;
        assert_eq!(node.size().await, Some(16));

        // An explicit set may shrink it.
        node.record_size(LayerRole::Lower, 3).await;
        assert_eq!(node.size().await, Some(3));
    }

    #[tokio::test]
    async fn test_node_exclusive_section_serializes() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let node = UnionNode::new(
            NodeKind::File,
            Backing::LowerOnly(handle()),
            Some("f".parse().unwrap()),
            None,
            None,
            Some(0),
            false,
        );

        let in_section = Arc::new(AtomicU32::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let node = Arc::clone(&node);
            let in_section = Arc::clone(&in_section);
            tasks.push(tokio::spawn(async move {
                node.begin_exclusive().await;
                let live = in_section.fetch_add(1, Ordering::SeqCst);
                assert_eq!(live, 0, "two tasks inside the exclusive section");
                tokio::task::yield_now().await;
                in_section.fetch_sub(1, Ordering::SeqCst);
                node.end_exclusive().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }
}

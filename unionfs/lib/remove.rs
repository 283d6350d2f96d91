use std::sync::Arc;

use crate::{EntryName, LookupStatus, UnionError, UnionFileSystem, UnionNode, UnionResult};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl UnionFileSystem {
    /// Removes the non-directory entry `name` from `parent`.
    ///
    /// A lower-only entry is never removed from its layer; a whiteout is
    /// created instead so the merged view hides it. An upper-backed entry
    /// is removed from the upper layer, with a whiteout left behind
    /// whenever a same-named lower counterpart exists (so it cannot
    /// reappear).
    ///
    /// A node with outstanding external references is *busy*: with
    /// `allow_busy_delete` the name disappears immediately while the node
    /// survives for its holders until [`reclaim`](UnionFileSystem::reclaim);
    /// without it the removal fails with `Busy` and nothing changes.
    ///
    /// ## Panics
    ///
    /// Removal always requires a writable parent; a parent without an
    /// upper handle is a contract violation by the embedding and aborts.
    pub async fn remove(
        &self,
        parent: &Arc<UnionNode>,
        node: &Arc<UnionNode>,
        name: &EntryName,
        allow_busy_delete: bool,
    ) -> UnionResult<()> {
        if node.kind().is_directory() {
            return Err(UnionError::PermissionDenied);
        }
        self.remove_entry(parent, node, name, false, allow_busy_delete)
            .await
    }

    /// Removes the directory entry `name` from `parent`.
    ///
    /// The directory must be empty in the *merged* view: upper entries
    /// gone and every lower entry whited out. Otherwise `NotEmpty`.
    pub async fn remove_directory(
        &self,
        parent: &Arc<UnionNode>,
        node: &Arc<UnionNode>,
        name: &EntryName,
        allow_busy_delete: bool,
    ) -> UnionResult<()> {
        if !node.kind().is_directory() {
            return Err(UnionError::NotADirectory);
        }
        if !self.read_directory(node).await?.is_empty() {
            return Err(UnionError::NotEmpty(name.clone()));
        }
        self.remove_entry(parent, node, name, true, allow_busy_delete)
            .await
    }

    /// Shared removal machinery for files and directories.
    async fn remove_entry(
        &self,
        parent: &Arc<UnionNode>,
        node: &Arc<UnionNode>,
        name: &EntryName,
        is_directory: bool,
        allow_busy_delete: bool,
    ) -> UnionResult<()> {
        if !parent.kind().is_directory() {
            return Err(UnionError::NotADirectory);
        }

        let parent_upper = match parent.upper().await {
            Some(handle) => handle,
            None => panic!("union remove: parent directory has no upper layer"),
        };

        let backing = node.backing().await;
        let upper = match backing.upper() {
            Some(upper) => upper.clone(),

            // Lower-only: nothing to remove in any layer, the whiteout
            // alone hides the entry.
            None => {
                if node.meta.lock().await.fault_bypass {
                    panic!("union remove: fault-bypass node has no upper layer");
                }

                self.whiteouts.hide(&parent_upper, name).await?;

                self.cache.forget(parent.id(), name, node).await;
                node.meta.lock().await.deleted = true;
                self.invalidate_dir_cache(parent).await;
                tracing::debug!(%name, "whited out lower-only entry");
                return Ok(());
            }
        };

        // Busy: external references beyond this caller still hold the
        // node (this includes child nodes holding their directory alive).
        let busy = Arc::strong_count(node) > 1;
        if busy && !allow_busy_delete {
            return Err(UnionError::Busy(name.clone()));
        }

        let needs_whiteout = self.lower_counterpart_exists(parent, name).await;

        // The layer removal goes first: if it fails, no engine state has
        // changed and the error propagates verbatim.
        if is_directory {
            self.get_upper()
                .remove_directory(&parent_upper, &upper, name)
                .await?;
        } else {
            self.get_upper().remove(&parent_upper, &upper, name).await?;
        }

        let whiteout_result = if needs_whiteout {
            self.whiteouts.hide(&parent_upper, name).await
        } else {
            Ok(())
        };

        self.cache.forget(parent.id(), name, node).await;
        {
            let mut meta = node.meta.lock().await;
            meta.deleted = true;
            meta.dir_cache = None;
            if busy {
                // The second strong owner of the upper handle; dropped
                // exactly once at reclamation.
                meta.deferred_upper = Some(upper);
            }
        }
        self.invalidate_dir_cache(parent).await;

        tracing::debug!(%name, busy, is_directory, "removed upper entry");
        whiteout_result
    }

    /// Reports whether the lower layer holds an entry under `name` in
    /// `parent`, which is the whiteout decision. The node's own backing is not
    /// enough: an upper-only node can shadow a lower entry it never
    /// captured, and that entry must not reappear after removal.
    pub(crate) async fn lower_counterpart_exists(
        &self,
        parent: &Arc<UnionNode>,
        name: &EntryName,
    ) -> bool {
        let lower_parent = match parent.lower().await {
            Some(handle) => handle,
            None => return false,
        };
        matches!(
            self.get_lower().lookup(&lower_parent, name).await,
            Result::Ok(LookupStatus::Found(_))
        )
    }

    /// Tears a node down once its last external reference is gone.
    ///
    /// This is the embedding's `on_last_reference_dropped` hook: it
    /// releases the busy-delete owner if one was taken, closes the lower
    /// layer once per open it served, and frees the directory cache. It
    /// is also the only point lower handles are released: an open lower
    /// handle stays alive for the node's whole lifetime so that
    /// directory-cache entries referencing it remain valid.
    pub async fn reclaim(&self, node: Arc<UnionNode>) {
        let (name, parent) = {
            let meta = node.meta.lock().await;
            (meta.name.clone(), meta.parent.clone())
        };
        if let (Some(name), Some(parent)) = (name, parent) {
            self.cache.forget(parent.id(), &name, &node).await;
        }

        let (deferred_upper, lower_opens, lower) = {
            let mut meta = node.meta.lock().await;
            let deferred_upper = meta.deferred_upper.take();
            let lower_opens = meta.open_lower_count;
            meta.open_lower_count = 0;
            meta.dir_cache = None;
            (deferred_upper, lower_opens, meta.backing.lower().cloned())
        };

        // Release the busy-delete ownership.
        drop(deferred_upper);

        if let Some(lower) = lower {
            for _ in 0..lower_opens {
                if let Err(err) = self.get_lower().close(&lower).await {
                    tracing::warn!(%err, "lower close failed during reclaim");
                }
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

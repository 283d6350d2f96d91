use std::sync::Arc;

use crate::{
    Attributes, Backing, EntryName, LayerHandle, LayerRole, LookupStatus, UnionError,
    UnionFileSystem, UnionNode, UnionResult,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl UnionFileSystem {
    /// Resolves `name` under `parent` into a union node.
    ///
    /// The merge policy, in order:
    ///
    /// 1. a successfully found upper **non-directory** fully shadows the
    ///    lower layer; the lower layer is not consulted;
    /// 2. an upper miss covered by a whiteout terminates with `NotFound`;
    /// 3. otherwise the lower layer is probed with pure-lookup semantics
    ///    (the engine never lets the lower layer see a create or rename
    ///    intent);
    /// 4. with both missing, the upper result is reported verbatim; one
    ///    hit yields a single-layer node; two hits (necessarily directories
    ///    by now on the upper side) yield a merged node when the lower
    ///    entry is also a directory, an upper-only node otherwise.
    ///
    /// Hard errors from the upper layer short-circuit resolution; hard
    /// errors from the lower layer never win over an upper result.
    ///
    /// Resolved nodes are interned in the name cache; resolving the same
    /// name twice yields the same node identity.
    pub async fn resolve(
        &self,
        parent: &Arc<UnionNode>,
        name: &EntryName,
    ) -> UnionResult<Arc<UnionNode>> {
        if !parent.kind().is_directory() {
            return Err(UnionError::NotADirectory);
        }
        // A deleted directory is never visible to fresh lookups; it only
        // serves handles that were obtained before the deletion.
        if parent.is_deleted().await {
            return Err(UnionError::NotFound(name.clone()));
        }

        if let Some(hit) = self.cache.get(parent.id(), name).await {
            if !hit.is_deleted().await {
                return Ok(hit);
            }
        }

        // A lower-origin entry in the parent's directory cache cannot be
        // merged (an upper entry would have claimed the name) and cannot
        // be whited out (mutations invalidate the cache), so both probes
        // can be skipped.
        let cached_lower = {
            let meta = parent.meta.lock().await;
            meta.dir_cache.as_ref().and_then(|cache| {
                cache.get(name).and_then(|entry| {
                    (entry.role == LayerRole::Lower).then(|| entry.handle.clone())
                })
            })
        };
        if let Some(handle) = cached_lower {
            let attrs = self.get_lower().getattr(&handle).await?;
            return Ok(self
                .alloc_child(
                    parent,
                    name,
                    attrs.get_kind(),
                    Backing::LowerOnly(handle),
                    None,
                    Some(attrs.get_size()),
                )
                .await);
        }

        // Snapshot the parent's handles; the parent lock is not held
        // across the layer probes below.
        let backing = parent.backing().await;
        let upper_parent = backing.upper().cloned();
        let lower_parent = backing.lower().cloned();

        let upper_found = self.probe_upper(&upper_parent, name).await?;

        // A found upper non-directory fully shadows the lower layer.
        if let Some((handle, attrs)) = &upper_found {
            if !attrs.get_kind().is_directory() {
                tracing::trace!(%name, "upper entry shadows lower layer");
                return Ok(self
                    .alloc_child(
                        parent,
                        name,
                        attrs.get_kind(),
                        Backing::UpperOnly(handle.clone()),
                        Some(attrs.get_size()),
                        None,
                    )
                    .await);
            }
        }

        // The upper entry either does not exist or is a directory. On a
        // miss, a covering whiteout hides any lower entry.
        if upper_found.is_none() {
            if let Some(upper_parent) = &upper_parent {
                if self.whiteouts.covers(upper_parent, name).await? {
                    tracing::trace!(%name, "whiteout hides lower entry");
                    return Err(UnionError::NotFound(name.clone()));
                }
            }
        }

        let lower_found = self.probe_lower(&lower_parent, name).await;

        match (upper_found, lower_found) {
            // Both failed: the upper result, verbatim.
            (None, None) => Err(UnionError::NotFound(name.clone())),

            // Upper failed, lower succeeded.
            (None, Some((lower, attrs))) => Ok(self
                .alloc_child(
                    parent,
                    name,
                    attrs.get_kind(),
                    Backing::LowerOnly(lower),
                    None,
                    Some(attrs.get_size()),
                )
                .await),

            // Upper succeeded, lower failed.
            (Some((upper, attrs)), None) => Ok(self
                .alloc_child(
                    parent,
                    name,
                    attrs.get_kind(),
                    Backing::UpperOnly(upper),
                    Some(attrs.get_size()),
                    None,
                )
                .await),

            // Both succeeded: merge two directories; a non-directory
            // lower entry under a directory upper is dropped.
            (Some((upper, upper_attrs)), Some((lower, lower_attrs))) => {
                if lower_attrs.get_kind().is_directory() {
                    Ok(self
                        .alloc_child(
                            parent,
                            name,
                            upper_attrs.get_kind(),
                            Backing::Merged { upper, lower },
                            Some(upper_attrs.get_size()),
                            Some(lower_attrs.get_size()),
                        )
                        .await)
                } else {
                    Ok(self
                        .alloc_child(
                            parent,
                            name,
                            upper_attrs.get_kind(),
                            Backing::UpperOnly(upper),
                            Some(upper_attrs.get_size()),
                            None,
                        )
                        .await)
                }
            }
        }
    }

    /// Returns the parent of `node` within the union namespace, clamped at
    /// the union root.
    ///
    /// Stepping from the union root across the covering mount point is the
    /// embedding's responsibility; by definition the union deals in
    /// namespaces, not filesystems.
    pub async fn parent_of(&self, node: &Arc<UnionNode>) -> Arc<UnionNode> {
        match node.parent_node().await {
            Some(parent) => parent,
            None => self.root(),
        }
    }

    /// Probes the upper layer. Not-found-class results (absent, consumed,
    /// or a `NotFound` error) collapse to `None`; hard errors
    /// short-circuit.
    async fn probe_upper(
        &self,
        upper_parent: &Option<LayerHandle>,
        name: &EntryName,
    ) -> UnionResult<Option<(LayerHandle, Attributes)>> {
        let upper_parent = match upper_parent {
            Some(handle) => handle,
            None => return Ok(None),
        };

        match self.get_upper().lookup(upper_parent, name).await {
            Result::Ok(LookupStatus::Found(handle)) => {
                let attrs = self.get_upper().getattr(&handle).await?;
                Ok(Some((handle, attrs)))
            }
            Result::Ok(LookupStatus::Absent) | Result::Ok(LookupStatus::Consumed) => Ok(None),
            Err(err) if err.is_absence() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Probes the lower layer with pure-lookup semantics. Lower hard
    /// errors never override an upper result, so they also collapse to
    /// `None`.
    async fn probe_lower(
        &self,
        lower_parent: &Option<LayerHandle>,
        name: &EntryName,
    ) -> Option<(LayerHandle, Attributes)> {
        let lower_parent = match lower_parent {
            Some(handle) => handle,
            None => return None,
        };

        match self.get_lower().lookup(lower_parent, name).await {
            Result::Ok(LookupStatus::Found(handle)) => {
                match self.get_lower().getattr(&handle).await {
                    Result::Ok(attrs) => Some((handle, attrs)),
                    Err(err) => {
                        tracing::warn!(%name, %err, "lower getattr failed during merge");
                        None
                    }
                }
            }
            Result::Ok(_) => None,
            Err(err) => {
                if !err.is_absence() {
                    tracing::warn!(%name, %err, "lower lookup failed during merge");
                }
                None
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

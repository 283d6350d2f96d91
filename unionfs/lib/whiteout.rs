use std::sync::Arc;

use crate::{EntryName, Layer, LayerHandle, UnionResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Creates and detects tombstone markers in the upper layer.
///
/// A whiteout for a name hides any same-named lower entry from the merged
/// view. The concrete on-layer representation (reserved entry type,
/// extended attribute, …) is the upper layer's concern.
pub(crate) struct WhiteoutStore {
    upper: Arc<dyn Layer>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WhiteoutStore {
    /// Creates a store backed by the upper layer.
    pub(crate) fn new(upper: Arc<dyn Layer>) -> Self {
        Self { upper }
    }

    /// Reports whether a whiteout covers `name` under the upper directory
    /// `parent`.
    pub(crate) async fn covers(
        &self,
        parent: &LayerHandle,
        name: &EntryName,
    ) -> UnionResult<bool> {
        self.upper.detect_whiteout(parent, name).await
    }

    /// Creates a whiteout for `name` under the upper directory `parent`.
    pub(crate) async fn hide(&self, parent: &LayerHandle, name: &EntryName) -> UnionResult<()> {
        tracing::debug!(%name, "creating whiteout");
        self.upper.create_whiteout(parent, name).await
    }

    /// Removes a covering whiteout for `name` if one exists, returning
    /// whether one was removed.
    pub(crate) async fn erase(&self, parent: &LayerHandle, name: &EntryName) -> UnionResult<bool> {
        if !self.upper.detect_whiteout(parent, name).await? {
            return Ok(false);
        }
        tracing::debug!(%name, "erasing whiteout");
        self.upper.remove_whiteout(parent, name).await?;
        Ok(true)
    }
}

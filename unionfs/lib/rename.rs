use std::sync::Arc;

use crate::{EntryName, UnionError, UnionFileSystem, UnionNode, UnionResult};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl UnionFileSystem {
    /// Renames `src_name` under `src_parent` to `dst_name` under
    /// `dst_parent`.
    ///
    /// The destination must not be visible in the merged view. A
    /// lower-only regular file is copied up first; lower-only directories
    /// and symlinks cannot be renamed (there is no deep-copy engine). The
    /// upper layer performs the actual rename; when the vacated source
    /// name still has a lower counterpart, a whiteout is left so it does
    /// not reappear.
    ///
    /// Partial failure: if the whiteout cannot be created after a
    /// successful layer rename, the engine renames back (best effort) and
    /// surfaces the whiteout error either way.
    ///
    /// A renamed node keeps its identity and, for merged directories,
    /// its original lower backing: the association between a union node
    /// and its lower tree is by identity, not by name.
    pub async fn rename(
        &self,
        src_parent: &Arc<UnionNode>,
        node: &Arc<UnionNode>,
        src_name: &EntryName,
        dst_parent: &Arc<UnionNode>,
        dst_name: &EntryName,
    ) -> UnionResult<()> {
        if !src_parent.kind().is_directory() || !dst_parent.kind().is_directory() {
            return Err(UnionError::NotADirectory);
        }

        // Both parents must be writable before any mutation happens.
        let src_upper_parent = src_parent
            .upper()
            .await
            .ok_or(UnionError::ReadOnlyFilesystem)?;
        let dst_upper_parent = dst_parent
            .upper()
            .await
            .ok_or(UnionError::ReadOnlyFilesystem)?;

        match self.resolve(dst_parent, dst_name).await {
            Result::Ok(_) => return Err(UnionError::AlreadyExists(dst_name.clone())),
            Err(err) if err.is_absence() => {}
            Err(err) => return Err(err),
        }

        if node.upper().await.is_none() {
            if !node.kind().is_file() {
                return Err(UnionError::Unsupported(
                    "rename of a lower-only directory or symlink",
                ));
            }
            self.copy_up(node, false).await?;
        }
        let upper = node
            .upper()
            .await
            .expect("rename source lost its upper handle");

        // A whiteout may cover the destination name; the layer rename
        // must not collide with it.
        self.whiteouts.erase(&dst_upper_parent, dst_name).await?;

        self.get_upper()
            .rename(
                &src_upper_parent,
                &upper,
                src_name,
                &dst_upper_parent,
                dst_name,
            )
            .await?;
        tracing::debug!(%src_name, %dst_name, "renamed upper entry");

        if self.lower_counterpart_exists(src_parent, src_name).await {
            if let Err(err) = self.whiteouts.hide(&src_upper_parent, src_name).await {
                tracing::error!(%src_name, %err, "rename: source whiteout failed, rolling back");
                if let Err(rollback_err) = self
                    .get_upper()
                    .rename(
                        &dst_upper_parent,
                        &upper,
                        dst_name,
                        &src_upper_parent,
                        src_name,
                    )
                    .await
                {
                    tracing::error!(
                        %src_name, %rollback_err,
                        "rename rollback failed; lower entry may shine through"
                    );
                }
                return Err(err);
            }
        }

        // Move the node's identity to its new name.
        self.cache.forget(src_parent.id(), src_name, node).await;
        {
            let mut meta = node.meta.lock().await;
            meta.name = Some(dst_name.clone());
            meta.parent = Some(Arc::clone(dst_parent));
        }
        self.cache.intern(dst_parent.id(), dst_name, node).await;

        self.invalidate_dir_cache(src_parent).await;
        self.invalidate_dir_cache(dst_parent).await;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Layer, MemoryLayer, UnionFileSystem};
    use helper::*;

    #[tokio::test]
    async fn test_rename_upper_only_file() {
        let (fs, upper, _) = mount(&["old=content"], &[]).await;
        let root = fs.root();

        let node = fs.resolve(&root, &name("old")).await.unwrap();
        fs.rename(&root, &node, &name("old"), &root, &name("new"))
            .await
            .unwrap();

        assert!(fs.resolve(&root, &name("old")).await.is_err());
        assert_eq!(upper.content_of("new").await.unwrap(), b"content");

        // No lower counterpart, so no whiteout for the vacated name.
        let root_handle = upper.root().await.unwrap();
        assert!(!upper
            .detect_whiteout(&root_handle, &name("old"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_rename_lower_only_file_copies_up_and_whites_out() {
        let (fs, upper, lower) = mount(&[], &["old=content"]).await;
        let root = fs.root();

        let node = fs.resolve(&root, &name("old")).await.unwrap();
        fs.rename(&root, &node, &name("old"), &root, &name("new"))
            .await
            .unwrap();

        // Source hidden, destination materialized in the upper layer,
        // lower layer untouched.
        assert!(fs.resolve(&root, &name("old")).await.is_err());
        assert_eq!(upper.content_of("new").await.unwrap(), b"content");
        assert!(lower.contains("old").await);

        let root_handle = upper.root().await.unwrap();
        assert!(upper
            .detect_whiteout(&root_handle, &name("old"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_rename_to_visible_destination_fails() {
        let (fs, _, _) = mount(&["a=1"], &["b=2"]).await;
        let root = fs.root();

        let a = fs.resolve(&root, &name("a")).await.unwrap();
        let err = fs
            .rename(&root, &a, &name("a"), &root, &name("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, UnionError::AlreadyExists(_)));
        assert!(fs.resolve(&root, &name("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_rename_lower_only_directory_is_unsupported() {
        let (fs, _, _) = mount(&[], &["d/f=x"]).await;
        let root = fs.root();

        let d = fs.resolve(&root, &name("d")).await.unwrap();
        let err = fs
            .rename(&root, &d, &name("d"), &root, &name("e"))
            .await
            .unwrap_err();
        assert!(matches!(err, UnionError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_rename_into_lower_only_parent_is_readonly() {
        let (fs, _, _) = mount(&["f=data"], &["target/inner=x"]).await;
        let root = fs.root();

        let f = fs.resolve(&root, &name("f")).await.unwrap();
        let target = fs.resolve(&root, &name("target")).await.unwrap();

        let err = fs
            .rename(&root, &f, &name("f"), &target, &name("f"))
            .await
            .unwrap_err();
        assert!(matches!(err, UnionError::ReadOnlyFilesystem));
        // Nothing moved.
        assert!(fs.resolve(&root, &name("f")).await.is_ok());
    }

    #[tokio::test]
    async fn test_rename_over_whiteout_succeeds() {
        let (fs, _, _) = mount(&["a=moved"], &["b=old"]).await;
        let root = fs.root();

        // Remove the lower-only "b", leaving a whiteout.
        let b = fs.resolve(&root, &name("b")).await.unwrap();
        fs.remove(&root, &b, &name("b"), false).await.unwrap();
        assert!(fs.resolve(&root, &name("b")).await.is_err());

        // Renaming onto the whited-out name erases the tombstone.
        let a = fs.resolve(&root, &name("a")).await.unwrap();
        fs.rename(&root, &a, &name("a"), &root, &name("b"))
            .await
            .unwrap();

        let b = fs.resolve(&root, &name("b")).await.unwrap();
        let mut buf = vec![0u8; 8];
        let read = fs.read(&b, 0, &mut buf).await.unwrap();
        assert_eq!(&buf[..read], b"moved");
    }

    #[tokio::test]
    async fn test_rename_keeps_node_identity() {
        let (fs, _, _) = mount(&["old=x"], &[]).await;
        let root = fs.root();

        let node = fs.resolve(&root, &name("old")).await.unwrap();
        fs.rename(&root, &node, &name("old"), &root, &name("new"))
            .await
            .unwrap();

        assert_eq!(node.name().await, Some(name("new")));
        let resolved = fs.resolve(&root, &name("new")).await.unwrap();
        assert!(Arc::ptr_eq(&resolved, &node));
    }

    mod helper {
        use super::*;
        use std::sync::Arc;

        pub(super) fn name(s: &str) -> EntryName {
            s.parse().unwrap()
        }

        pub(super) async fn mount(
            upper_specs: &[&str],
            lower_specs: &[&str],
        ) -> (UnionFileSystem, Arc<MemoryLayer>, Arc<MemoryLayer>) {
            let upper = Arc::new(MemoryLayer::new());
            let lower = Arc::new(MemoryLayer::new());

            for spec in upper_specs {
                seed_one(&upper, spec).await;
            }
            for spec in lower_specs {
                seed_one(&lower, spec).await;
            }
            lower.freeze();

            let fs = UnionFileSystem::new(
                Arc::clone(&upper) as Arc<dyn Layer>,
                Arc::clone(&lower) as Arc<dyn Layer>,
            )
            .await
            .unwrap();
            (fs, upper, lower)
        }

        async fn seed_one(layer: &MemoryLayer, spec: &str) {
            if let Some(dir) = spec.strip_suffix('/') {
                layer.seed_directory(dir).await.unwrap();
            } else if let Some((path, content)) = spec.split_once('=') {
                layer.seed_file(path, content.as_bytes()).await.unwrap();
            } else {
                layer.seed_file(spec, b"").await.unwrap();
            }
        }
    }
}

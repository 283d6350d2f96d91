use std::sync::Arc;

use crate::{LayerHandle, UnionError, UnionFileSystem, UnionNode, UnionResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Chunk size for the lower-to-upper content copy.
const COPY_CHUNK_SIZE: usize = 64 * 1024;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl UnionFileSystem {
    /// Promotes a lower-only regular file into the upper layer.
    ///
    /// With `truncate_to_zero` a zero-length upper file is created and no
    /// data is copied (the open-with-`O_TRUNC` case); otherwise the full
    /// lower content is copied. Attributes supported by the upper layer
    /// are carried over from the lower file.
    ///
    /// At most one copy-up per node is in flight: concurrent callers
    /// suspend on the node's exclusive section and then observe the
    /// winner's upper handle instead of repeating the work. After a
    /// successful copy-up all future mutations target the upper handle;
    /// the lower handle is kept as read-only historical backing.
    ///
    /// ## Errors
    ///
    /// `ReadOnlyFilesystem` when there is no legal copy-up path: the node
    /// is not a regular file, is in fault-bypass mode, has been unlinked,
    /// or its parent has no upper directory.
    pub async fn copy_up(&self, node: &Arc<UnionNode>, truncate_to_zero: bool) -> UnionResult<()> {
        {
            let meta = node.meta.lock().await;
            if meta.backing.has_upper() {
                return Ok(());
            }
            if meta.fault_bypass {
                return Err(UnionError::ReadOnlyFilesystem);
            }
        }
        if !node.kind().is_file() {
            return Err(UnionError::ReadOnlyFilesystem);
        }

        node.begin_exclusive().await;
        let result = self.copy_up_locked(node, truncate_to_zero).await;
        node.end_exclusive().await;
        result
    }

    /// The body of copy-up, run while holding the node's exclusive
    /// section.
    async fn copy_up_locked(
        &self,
        node: &Arc<UnionNode>,
        truncate_to_zero: bool,
    ) -> UnionResult<()> {
        // Re-check under the section: a waiter arrives here after the
        // winner finished and must not materialize a second upper file.
        let lower = {
            let meta = node.meta.lock().await;
            if meta.backing.has_upper() {
                return Ok(());
            }
            if meta.deleted {
                // The name is gone from the merged view; materializing it
                // now would resurrect it.
                return Err(UnionError::ReadOnlyFilesystem);
            }
            meta.backing
                .lower()
                .cloned()
                .expect("union node with neither layer handle")
        };

        let name = node
            .name()
            .await
            .expect("copy-up target has no component name");
        let parent = node
            .parent_node()
            .await
            .expect("copy-up target has no parent");
        let parent_upper = parent.upper().await.ok_or(UnionError::ReadOnlyFilesystem)?;

        tracing::debug!(%name, truncate_to_zero, "copying up");

        let lower_attrs = self.get_lower().getattr(&lower).await?;
        let upper = self
            .get_upper()
            .create_file(&parent_upper, &name, &lower_attrs.clone().with_size(0))
            .await?;

        let copied = if truncate_to_zero {
            0
        } else {
            match self.copy_content(&lower, &upper).await {
                Result::Ok(copied) => copied,
                Err(err) => {
                    // Undo the partial upper file so the lower content
                    // stays authoritative.
                    if let Err(cleanup_err) =
                        self.get_upper().remove(&parent_upper, &upper, &name).await
                    {
                        tracing::warn!(%name, %cleanup_err, "failed to undo partial copy-up");
                    }
                    return Err(err);
                }
            }
        };

        {
            let mut meta = node.meta.lock().await;
            meta.backing.promote(upper);
            meta.upper_size = Some(copied);
        }
        self.invalidate_dir_cache(&parent).await;

        tracing::debug!(%name, copied, "copy-up complete");
        Ok(())
    }

    /// Copies the full lower content into the new upper file, returning
    /// the number of bytes copied.
    async fn copy_content(&self, lower: &LayerHandle, upper: &LayerHandle) -> UnionResult<u64> {
        let mut buf = vec![0u8; COPY_CHUNK_SIZE];
        let mut copied: u64 = 0;

        loop {
            let read = self.get_lower().read(lower, copied, &mut buf).await?;
            if read == 0 {
                break;
            }

            let mut written = 0;
            while written < read {
                let n = self
                    .get_upper()
                    .write(upper, copied + written as u64, &buf[written..read])
                    .await?;
                if n == 0 {
                    return Err(UnionError::NoSpace);
                }
                written += n;
            }
            copied += read as u64;
        }

        Ok(copied)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntryName, Layer, MemoryLayer, UnionFileSystem};
    use helper::*;

    #[tokio::test]
    async fn test_copy_up_preserves_content() {
        let (fs, upper, _) = mount(&[], &["f=hello world"]).await;
        let f = fs.resolve(&fs.root(), &name("f")).await.unwrap();

        fs.copy_up(&f, false).await.unwrap();

        assert!(f.upper().await.is_some());
        assert!(f.lower().await.is_some());
        assert_eq!(upper.content_of("f").await.unwrap(), b"hello world");
        assert_eq!(f.size().await, Some(11));
    }

    #[tokio::test]
    async fn test_copy_up_truncating_skips_content() {
        let (fs, upper, _) = mount(&[], &["f=hello world"]).await;
        let f = fs.resolve(&fs.root(), &name("f")).await.unwrap();

        fs.copy_up(&f, true).await.unwrap();

        assert_eq!(upper.content_of("f").await.unwrap(), b"");
        assert_eq!(f.size().await, Some(0));
    }

    #[tokio::test]
    async fn test_copy_up_is_idempotent() {
        let (fs, upper, _) = mount(&[], &["f=abc"]).await;
        let f = fs.resolve(&fs.root(), &name("f")).await.unwrap();

        fs.copy_up(&f, false).await.unwrap();
        fs.copy_up(&f, false).await.unwrap();
        fs.copy_up(&f, true).await.unwrap();

        assert_eq!(upper.content_of("f").await.unwrap(), b"abc");
    }

    #[test_log::test(tokio::test)]
    async fn test_copy_up_concurrent_writers_materialize_once() {
        let (fs, upper, _) = mount(&[], &["f=original content"]).await;
        let fs = Arc::new(fs);
        let f = fs.resolve(&fs.root(), &name("f")).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let fs = Arc::clone(&fs);
            let f = Arc::clone(&f);
            tasks.push(tokio::spawn(async move { fs.copy_up(&f, false).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Exactly one upper file, with the lower's original content.
        assert_eq!(
            upper.content_of("f").await.unwrap(),
            b"original content"
        );
    }

    #[tokio::test]
    async fn test_copy_up_carries_attributes() {
        let upper = Arc::new(MemoryLayer::new());
        let lower = Arc::new(MemoryLayer::new());
        lower.seed_file("f", b"data").await.unwrap();

        // Give the lower file distinctive metadata before freezing.
        let root = lower.root().await.unwrap();
        let handle = match lower.lookup(&root, &name("f")).await.unwrap() {
            crate::LookupStatus::Found(handle) => handle,
            _ => panic!("seeded file missing"),
        };
        lower
            .setattr(
                &handle,
                &crate::SetAttributes::new().permissions(0o640).owner(7, 11),
            )
            .await
            .unwrap();
        lower.freeze();

        let fs = UnionFileSystem::new(
            Arc::clone(&upper) as Arc<dyn Layer>,
            Arc::clone(&lower) as Arc<dyn Layer>,
        )
        .await
        .unwrap();

        let f = fs.resolve(&fs.root(), &name("f")).await.unwrap();
        fs.copy_up(&f, false).await.unwrap();

        let attrs = upper.attrs_at("f").await.unwrap();
        assert_eq!(attrs.get_permissions(), 0o640);
        assert_eq!(attrs.get_uid(), 7);
        assert_eq!(attrs.get_gid(), 11);
    }

    #[tokio::test]
    async fn test_copy_up_requires_upper_parent() {
        let (fs, _, _) = mount(&[], &["d/f=data"]).await;

        let d = fs.resolve(&fs.root(), &name("d")).await.unwrap();
        let f = fs.resolve(&d, &name("f")).await.unwrap();

        let err = fs.copy_up(&f, false).await.unwrap_err();
        assert!(matches!(err, UnionError::ReadOnlyFilesystem));
        assert!(f.upper().await.is_none());
    }

    #[tokio::test]
    async fn test_copy_up_rejects_non_files() {
        let (fs, _, _) = mount(&[], &["d/x"]).await;

        let d = fs.resolve(&fs.root(), &name("d")).await.unwrap();
        let err = fs.copy_up(&d, false).await.unwrap_err();
        assert!(matches!(err, UnionError::ReadOnlyFilesystem));
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

//! This example demonstrates driving a two-layer union namespace.
//!
//! The example shows how to:
//! - Seed a read-only lower layer and an empty upper layer
//! - Resolve names through the merged view
//! - Trigger copy-up by writing to a lower-only file
//! - Hide a lower entry with a whiteout by removing it
//!
//! To run the example:
//! ```bash
//! cargo run --example union_demo
//! ```

use std::sync::Arc;

use anyhow::Result;
use unionfs::{Attributes, EntryName, Layer, MemoryLayer, NodeKind, UnionFileSystem};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // The lower layer is a pre-populated, frozen base image.
    let lower = Arc::new(MemoryLayer::new());
    lower.seed_file("motd", b"welcome to the base image\n").await?;
    lower.seed_file("notes.txt", b"to be deleted\n").await?;
    lower.freeze();

    // The upper layer starts empty and receives every mutation.
    let upper = Arc::new(MemoryLayer::new());

    let fs = UnionFileSystem::new(
        Arc::clone(&upper) as Arc<dyn Layer>,
        Arc::clone(&lower) as Arc<dyn Layer>,
    )
    .await?;
    let root = fs.root();

    // Everything in the lower layer is visible through the merged view.
    for entry in fs.read_directory(&root).await? {
        tracing::info!("merged entry: {}", entry);
    }

    // Writing to a lower-only file copies it up into the upper layer
    // first; the frozen lower layer is never touched.
    let motd = fs.resolve(&root, &name("motd")?).await?;
    tracing::info!("upper before write: {}", motd.upper().await.is_some());
    fs.write(&motd, 0, b"patched").await?;
    tracing::info!("upper after write:  {}", motd.upper().await.is_some());
    tracing::info!("upper copy exists:  {}", upper.contains("motd").await);

    // New files land in the upper layer directly.
    fs.create_file(&root, &name("scratch")?, &Attributes::new(NodeKind::File))
        .await?;

    // Removing a lower-only file records a whiteout; the lower layer
    // still physically holds the data, but the name is gone.
    let notes = fs.resolve(&root, &name("notes.txt")?).await?;
    fs.remove(&root, &notes, &name("notes.txt")?, false).await?;
    drop(notes);
    tracing::info!(
        "notes.txt resolvable: {}",
        fs.resolve(&root, &name("notes.txt")?).await.is_ok()
    );
    tracing::info!(
        "notes.txt still in lower: {}",
        lower.contains("notes.txt").await
    );

    for entry in fs.read_directory(&root).await? {
        tracing::info!("final merged entry: {}", entry);
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: *
//--------------------------------------------------------------------------------------------------

fn name(s: &str) -> Result<EntryName> {
    Ok(s.parse()?)
}

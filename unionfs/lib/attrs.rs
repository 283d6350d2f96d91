use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters};
#[cfg(unix)]
use uzers::{get_current_gid, get_current_uid};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The kind of a node in a layer.
///
/// Beyond the regular kinds, the device/fifo/socket kinds exist so that a
/// `make_node` (mknod) passthrough can create them in the upper layer; the
/// engine itself only routes on `Directory` vs everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file
    File,

    /// Directory
    Directory,

    /// Symbolic link
    Symlink,

    /// Named pipe
    Fifo,

    /// Unix domain socket
    Socket,

    /// Character device
    CharDevice,

    /// Block device
    BlockDevice,
}

/// Attributes of a node as reported by a layer.
///
/// This is the engine's view of layer metadata: kind, size, link count,
/// permission bits, ownership and timestamps. Layers are free to keep
/// richer metadata internally.
#[derive(Debug, Clone, CopyGetters, Getters, PartialEq, Eq)]
pub struct Attributes {
    /// The kind of the node
    #[getset(get_copy = "pub with_prefix")]
    kind: NodeKind,

    /// Size of the node in bytes
    #[getset(get_copy = "pub with_prefix")]
    size: u64,

    /// Number of hard links to the node
    #[getset(get_copy = "pub with_prefix")]
    link_count: u32,

    /// Permission bits (the low 9 mode bits)
    #[getset(get_copy = "pub with_prefix")]
    permissions: u32,

    /// User ID of the owner
    #[getset(get_copy = "pub with_prefix")]
    uid: u32,

    /// Group ID of the owner
    #[getset(get_copy = "pub with_prefix")]
    gid: u32,

    /// When the node was created
    #[getset(get = "pub with_prefix")]
    created_at: DateTime<Utc>,

    /// When the node was last modified
    #[getset(get = "pub with_prefix")]
    modified_at: DateTime<Utc>,

    /// When the node was last accessed
    #[getset(get = "pub with_prefix")]
    accessed_at: DateTime<Utc>,
}

/// A partial attribute update, as accepted by `setattr`.
///
/// Every field is optional; a present `size` is an explicit size change
/// (grow or truncate) and is what triggers copy-up on lower-only files.
#[derive(Debug, Clone, Default, Getters, PartialEq, Eq)]
#[getset(get = "pub with_prefix")]
pub struct SetAttributes {
    /// New size, if the size is to change
    size: Option<u64>,

    /// New permission bits
    permissions: Option<u32>,

    /// New owner user ID
    uid: Option<u32>,

    /// New owner group ID
    gid: Option<u32>,

    /// New modification time
    modified_at: Option<DateTime<Utc>>,

    /// New access time
    accessed_at: Option<DateTime<Utc>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NodeKind {
    /// Returns `true` if this is a directory.
    pub fn is_directory(&self) -> bool {
        matches!(self, NodeKind::Directory)
    }

    /// Returns `true` if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, NodeKind::File)
    }

    /// Returns `true` if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, NodeKind::Symlink)
    }
}

impl Attributes {
    /// Creates attributes for a new node of the given kind.
    ///
    /// Defaults: size 0, link count 1 (2 for directories), permissions
    /// `0o644` (`0o755` for directories), ownership taken from the current
    /// user on Unix, all timestamps now.
    pub fn new(kind: NodeKind) -> Self {
        let now = Utc::now();
        let (permissions, link_count) = if kind.is_directory() {
            (0o755, 2)
        } else {
            (0o644, 1)
        };

        Self {
            kind,
            size: 0,
            link_count,
            permissions,
            #[cfg(unix)]
            uid: get_current_uid(),
            #[cfg(not(unix))]
            uid: 0,
            #[cfg(unix)]
            gid: get_current_gid(),
            #[cfg(not(unix))]
            gid: 0,
            created_at: now,
            modified_at: now,
            accessed_at: now,
        }
    }

    /// Returns a copy with the given size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Returns a copy with the given permission bits.
    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = permissions & 0o777;
        self
    }

    /// Returns a copy with the given ownership.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Returns a copy with the given link count.
    pub fn with_link_count(mut self, link_count: u32) -> Self {
        self.link_count = link_count;
        self
    }

    /// Returns a copy with the given timestamps.
    pub fn with_timestamps(
        mut self,
        created_at: DateTime<Utc>,
        modified_at: DateTime<Utc>,
        accessed_at: DateTime<Utc>,
    ) -> Self {
        self.created_at = created_at;
        self.modified_at = modified_at;
        self.accessed_at = accessed_at;
        self
    }

    /// Sets the size in place.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// Sets the link count in place.
    pub fn set_link_count(&mut self, link_count: u32) {
        self.link_count = link_count;
    }

    /// Applies a partial update to these attributes.
    pub fn apply(&mut self, changes: &SetAttributes) {
        if let Some(size) = changes.size {
            self.size = size;
        }
        if let Some(permissions) = changes.permissions {
            self.permissions = permissions & 0o777;
        }
        if let Some(uid) = changes.uid {
            self.uid = uid;
        }
        if let Some(gid) = changes.gid {
            self.gid = gid;
        }
        if let Some(modified_at) = changes.modified_at {
            self.modified_at = modified_at;
        }
        if let Some(accessed_at) = changes.accessed_at {
            self.accessed_at = accessed_at;
        }
    }
}

impl SetAttributes {
    /// Creates an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a size change.
    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Requests new permission bits.
    pub fn permissions(mut self, permissions: u32) -> Self {
        self.permissions = Some(permissions & 0o777);
        self
    }

    /// Requests new ownership.
    pub fn owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Requests a new modification time.
    pub fn modified_at(mut self, at: DateTime<Utc>) -> Self {
        self.modified_at = Some(at);
        self
    }

    /// Requests a new access time.
    pub fn accessed_at(mut self, at: DateTime<Utc>) -> Self {
        self.accessed_at = Some(at);
        self
    }

    /// Returns `true` if the update changes nothing.
    pub fn is_noop(&self) -> bool {
        self == &SetAttributes::default()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

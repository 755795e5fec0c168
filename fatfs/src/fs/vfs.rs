//! Virtual File System entry tree
//!
//! File system drivers do not own the directory tree. The VFS layer owns
//! file entries and their parent/child links; a driver fills entries in when
//! it reads a directory and reads them back when it writes one.
//!
//! # Key Concepts
//! - **FileEntry**: one named file or directory with its sizes and times
//! - **EntryTree**: the operations a driver may perform on the tree
//! - **EntryHandle**: opaque slot where a driver attaches private data
//!
//! [`EntryArena`] is a plain in-memory tree for drivers that run without a
//! full VFS (tools, tests).

use alloc::string::String;
use alloc::vec::Vec;

/// File system status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FsStatus {
    /// Operation succeeded
    Success = 0,
    /// Not a directory
    NotDirectory = -4,
    /// Is a directory
    IsDirectory = -5,
    /// Disk full
    DiskFull = -7,
    /// Invalid parameter
    InvalidParameter = -8,
    /// I/O error
    IoError = -13,
    /// Invalid file system
    InvalidFileSystem = -14,
    /// Not mounted
    NotMounted = -15,
    /// Too many open files
    TooManyFiles = -16,
    /// Name too long
    NameTooLong = -17,
    /// Media was changed under a mounted volume
    MediaChanged = -23,
    /// On-disk structures disagree with each other
    Corrupt = -24,
}

impl FsStatus {
    pub fn is_success(&self) -> bool {
        *self == FsStatus::Success
    }
}

/// File type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FileType {
    /// Regular file
    #[default]
    Regular = 0,
    /// Directory
    Directory = 1,
}

/// Calendar time as the VFS sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    pub const fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        Self { year, month, day, hour, minute, second }
    }
}

/// Index of an entry in an [`EntryTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub usize);

/// Opaque handle to a driver's private per-entry data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// A file or directory known to the VFS
#[derive(Debug, Clone, Default)]
pub struct FileEntry {
    /// Long name, without any path component
    pub name: String,
    pub file_type: FileType,
    /// Size in bytes
    pub size: u64,
    /// Allocation units in use (clusters on FAT)
    pub blocks: u32,
    pub created: DateTime,
    pub modified: DateTime,
    pub accessed: DateTime,
    /// Containing directory, `None` for a root
    pub parent: Option<EntryId>,
    /// Driver private data
    pub fs_data: Option<EntryHandle>,
}

impl FileEntry {
    pub fn new(name: &str, file_type: FileType) -> Self {
        Self {
            name: String::from(name),
            file_type,
            ..Self::default()
        }
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// "." or ".."
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Operations a file system driver performs on the VFS entry tree
pub trait EntryTree {
    /// Allocate a blank entry, `None` when the VFS is out of entries
    fn new_entry(&mut self) -> Option<EntryId>;

    /// Return an entry (and its subtree) to the VFS
    fn release_entry(&mut self, id: EntryId);

    /// Link `id` as the last child of `parent`
    fn insert_entry(&mut self, id: EntryId, parent: EntryId) -> bool;

    fn entry(&self, id: EntryId) -> Option<&FileEntry>;

    fn entry_mut(&mut self, id: EntryId) -> Option<&mut FileEntry>;

    /// Children of a directory in insertion order
    fn children(&self, dir: EntryId) -> Vec<EntryId>;

    fn root(&self) -> EntryId;

    fn is_root(&self, id: EntryId) -> bool {
        id == self.root()
    }
}

struct Node {
    entry: FileEntry,
    children: Vec<EntryId>,
}

/// Vec-backed entry tree with a free list
pub struct EntryArena {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    root: EntryId,
    limit: usize,
}

impl EntryArena {
    /// Create a tree holding only a root directory named "/"
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Like [`EntryArena::new`], but refuse to hold more than `limit`
    /// entries
    pub fn with_limit(limit: usize) -> Self {
        let root = Node {
            entry: FileEntry::new("/", FileType::Directory),
            children: Vec::new(),
        };
        let mut nodes = Vec::new();
        nodes.push(Some(root));
        Self {
            nodes,
            free: Vec::new(),
            root: EntryId(0),
            limit,
        }
    }

    /// Number of live entries, root included
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find a child by exact name
    pub fn lookup(&self, dir: EntryId, name: &str) -> Option<EntryId> {
        self.children(dir)
            .into_iter()
            .find(|&id| self.entry(id).map(|e| e.name == name).unwrap_or(false))
    }

    /// Detach `id` from its parent without releasing it
    pub fn unlink(&mut self, id: EntryId) {
        let parent = match self.entry(id).and_then(|e| e.parent) {
            Some(parent) => parent,
            None => return,
        };
        if let Some(Some(node)) = self.nodes.get_mut(parent.0) {
            node.children.retain(|&child| child != id);
        }
        if let Some(entry) = self.entry_mut(id) {
            entry.parent = None;
        }
    }
}

impl EntryTree for EntryArena {
    fn new_entry(&mut self) -> Option<EntryId> {
        if self.len() >= self.limit {
            return None;
        }
        let node = Node {
            entry: FileEntry::default(),
            children: Vec::new(),
        };
        match self.free.pop() {
            Some(index) => {
                self.nodes[index] = Some(node);
                Some(EntryId(index))
            }
            None => {
                self.nodes.push(Some(node));
                Some(EntryId(self.nodes.len() - 1))
            }
        }
    }

    fn release_entry(&mut self, id: EntryId) {
        if id == self.root {
            return;
        }
        self.unlink(id);

        let mut pending = Vec::new();
        pending.push(id);
        while let Some(next) = pending.pop() {
            if let Some(slot) = self.nodes.get_mut(next.0) {
                if let Some(node) = slot.take() {
                    pending.extend(node.children);
                    self.free.push(next.0);
                }
            }
        }
    }

    fn insert_entry(&mut self, id: EntryId, parent: EntryId) -> bool {
        if self.entry(id).is_none() || self.entry(parent).is_none() {
            return false;
        }
        self.unlink(id);
        if let Some(Some(node)) = self.nodes.get_mut(parent.0) {
            node.children.push(id);
        }
        if let Some(entry) = self.entry_mut(id) {
            entry.parent = Some(parent);
        }
        true
    }

    fn entry(&self, id: EntryId) -> Option<&FileEntry> {
        self.nodes.get(id.0).and_then(|n| n.as_ref()).map(|n| &n.entry)
    }

    fn entry_mut(&mut self, id: EntryId) -> Option<&mut FileEntry> {
        self.nodes.get_mut(id.0).and_then(|n| n.as_mut()).map(|n| &mut n.entry)
    }

    fn children(&self, dir: EntryId) -> Vec<EntryId> {
        self.nodes
            .get(dir.0)
            .and_then(|n| n.as_ref())
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    fn root(&self) -> EntryId {
        self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let mut tree = EntryArena::new();
        let root = tree.root();
        let id = tree.new_entry().unwrap();
        *tree.entry_mut(id).unwrap() = FileEntry::new("readme.txt", FileType::Regular);
        assert!(tree.insert_entry(id, root));

        assert_eq!(tree.lookup(root, "readme.txt"), Some(id));
        assert_eq!(tree.entry(id).unwrap().parent, Some(root));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_release_subtree() {
        let mut tree = EntryArena::new();
        let root = tree.root();
        let dir = tree.new_entry().unwrap();
        *tree.entry_mut(dir).unwrap() = FileEntry::new("docs", FileType::Directory);
        tree.insert_entry(dir, root);
        let file = tree.new_entry().unwrap();
        tree.insert_entry(file, dir);

        tree.release_entry(dir);
        assert!(tree.entry(dir).is_none());
        assert!(tree.entry(file).is_none());
        assert!(tree.children(root).is_empty());
        assert_eq!(tree.len(), 1);

        // Freed slots are reused
        let again = tree.new_entry().unwrap();
        assert!(again == dir || again == file);
    }

    #[test]
    fn test_entry_limit() {
        let mut tree = EntryArena::with_limit(2);
        assert!(tree.new_entry().is_some());
        assert!(tree.new_entry().is_none());
    }
}

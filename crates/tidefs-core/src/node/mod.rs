//! In-memory node table for one folder-branch.
//!
//! Nodes identify files and directories across revisions, surviving renames
//! and pointer rewrites. Because directories can move (and conceptually
//! form cycles mid-rename), nodes live in an arena indexed by stable
//! id/generation pairs, with parent/child relationships expressed as
//! id-to-id links rather than owning references.
//!
//! The table itself is thread-safe. Callers are responsible for sequencing:
//! path lookups on a metadata-writing flow must happen under the writer
//! lock to see up-to-date paths, while plain reads may look up unlocked
//! with no consistency promise (concurrent mutations may reorder).

use std::fmt;
use std::sync::RwLock;

use dashmap::DashMap;

use crate::block::{BlockPointer, BlockRef};

/// Stable identity of a cached node: arena index plus a generation that
/// invalidates stale ids after the slot is reused or the table is cleared.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}g{}", self.index, self.generation)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One step of a node path: the block pointer of the entry plus its name in
/// the parent (empty for the root).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PathSegment {
    pub ptr: BlockPointer,
    pub name: String,
}

/// A root-first path through the folder tree.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NodePath {
    pub segments: Vec<PathSegment>,
}

impl NodePath {
    pub fn tail_pointer(&self) -> BlockPointer {
        self.segments.last().map_or(BlockPointer::ZERO, |s| s.ptr)
    }

    pub fn tail_ref(&self) -> BlockRef {
        self.tail_pointer().bref()
    }

    pub fn tail_name(&self) -> &str {
        self.segments.last().map_or("", |s| s.name.as_str())
    }

    pub fn is_root(&self) -> bool {
        self.segments.len() == 1
    }

    pub fn parent_path(&self) -> Option<NodePath> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(NodePath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/")?;
        let names: Vec<&str> = self
            .segments
            .iter()
            .skip(1)
            .map(|s| s.name.as_str())
            .collect();
        f.write_str(&names.join("/"))
    }
}

#[derive(Debug, Clone)]
struct NodeEntry {
    parent: Option<NodeId>,
    name: String,
    ptr: BlockPointer,
    unlinked: bool,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<NodeEntry>,
}

/// Arena of live nodes for one folder-branch.
#[derive(Debug, Default)]
pub struct NodeCache {
    slots: RwLock<Vec<Slot>>,
    by_ref: DashMap<BlockRef, NodeId>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_entry(&self, entry: NodeEntry) -> NodeId {
        let bref = entry.ptr.bref();
        let mut slots = self.slots.write().unwrap();
        let index = slots.iter().position(|s| s.entry.is_none());
        let id = match index {
            Some(index) => {
                let slot = &mut slots[index];
                slot.entry = Some(entry);
                NodeId {
                    index: index as u32,
                    generation: slot.generation,
                }
            }
            None => {
                slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                NodeId {
                    index: (slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.by_ref.insert(bref, id);
        id
    }

    fn with_entry<R>(&self, id: NodeId, f: impl FnOnce(&NodeEntry) -> R) -> Option<R> {
        let slots = self.slots.read().unwrap();
        let slot = slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref().map(f)
    }

    fn with_entry_mut<R>(&self, id: NodeId, f: impl FnOnce(&mut NodeEntry) -> R) -> Option<R> {
        let mut slots = self.slots.write().unwrap();
        let slot = slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut().map(f)
    }

    /// The root node for `ptr`, created on first use.
    pub fn get_or_create_root(&self, ptr: BlockPointer) -> NodeId {
        if let Some(id) = self.get(ptr.bref()) {
            return id;
        }
        self.insert_entry(NodeEntry {
            parent: None,
            name: String::new(),
            ptr,
            unlinked: false,
        })
    }

    /// The node for `ptr` under `parent`, created on first use.
    ///
    /// Returns `None` if `parent` is stale.
    pub fn get_or_create(
        &self,
        parent: NodeId,
        name: &str,
        ptr: BlockPointer,
    ) -> Option<NodeId> {
        if let Some(id) = self.get(ptr.bref()) {
            return Some(id);
        }
        // Parent must still be live.
        self.with_entry(parent, |_| ())?;
        Some(self.insert_entry(NodeEntry {
            parent: Some(parent),
            name: name.to_string(),
            ptr,
            unlinked: false,
        }))
    }

    /// Look up a live node by block reference.
    pub fn get(&self, bref: BlockRef) -> Option<NodeId> {
        let id = *self.by_ref.get(&bref)?;
        self.with_entry(id, |_| id)
    }

    /// The node's current block pointer.
    pub fn pointer(&self, id: NodeId) -> Option<BlockPointer> {
        self.with_entry(id, |e| e.ptr)
    }

    /// Root-first path for a linked node; `None` for stale or unlinked
    /// nodes.
    pub fn path_from_node(&self, id: NodeId) -> Option<NodePath> {
        let mut segments = Vec::new();
        let mut cur = Some(id);
        while let Some(node) = cur {
            let (parent, segment, unlinked) = self.with_entry(node, |e| {
                (
                    e.parent,
                    PathSegment {
                        ptr: e.ptr,
                        name: e.name.clone(),
                    },
                    e.unlinked,
                )
            })?;
            if unlinked {
                return None;
            }
            segments.push(segment);
            cur = parent;
        }
        segments.reverse();
        Some(NodePath { segments })
    }

    /// Rewrite a node's pointer after a sync assigned it a new identity.
    /// Returns whether a node was found for `old`.
    pub fn update_pointer(&self, old: BlockRef, new: BlockPointer) -> bool {
        let Some((_, id)) = self.by_ref.remove(&old) else {
            return false;
        };
        let updated = self
            .with_entry_mut(id, |e| {
                e.ptr = new;
            })
            .is_some();
        if updated {
            self.by_ref.insert(new.bref(), id);
        }
        updated
    }

    /// Re-home a node after a rename.
    pub fn rename(&self, id: NodeId, new_parent: NodeId, new_name: &str) -> bool {
        self.with_entry_mut(id, |e| {
            e.parent = Some(new_parent);
            e.name = new_name.to_string();
        })
        .is_some()
    }

    /// Mark a node unlinked (removed from the tree while possibly still
    /// open). Unlinked nodes have no path and are skipped on sync.
    pub fn unlink(&self, id: NodeId) -> bool {
        let unlinked = self
            .with_entry_mut(id, |e| {
                e.unlinked = true;
                e.ptr.bref()
            });
        match unlinked {
            Some(bref) => {
                self.by_ref.remove(&bref);
                true
            }
            None => false,
        }
    }

    pub fn is_unlinked(&self, id: NodeId) -> bool {
        self.with_entry(id, |e| e.unlinked).unwrap_or(true)
    }

    /// Drop a node, recycling its slot.
    pub fn release(&self, id: NodeId) {
        let mut slots = self.slots.write().unwrap();
        let Some(slot) = slots.get_mut(id.index as usize) else {
            return;
        };
        if slot.generation != id.generation {
            return;
        }
        if let Some(entry) = slot.entry.take() {
            self.by_ref.remove(&entry.ptr.bref());
        }
        slot.generation += 1;
    }

    /// Every live node id.
    pub fn all_node_ids(&self) -> Vec<NodeId> {
        let slots = self.slots.read().unwrap();
        slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.entry.is_some())
            .map(|(index, s)| NodeId {
                index: index as u32,
                generation: s.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap().iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invalidate every cached node in one batch (fast-forward): all
    /// parent/child relationships are dropped and every outstanding id goes
    /// stale. Returns the ids that were invalidated.
    pub fn invalidate_all(&self) -> Vec<NodeId> {
        let mut slots = self.slots.write().unwrap();
        self.by_ref.clear();
        let mut invalidated = Vec::new();
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.entry.take().is_some() {
                invalidated.push(NodeId {
                    index: index as u32,
                    generation: slot.generation,
                });
                slot.generation += 1;
            }
        }
        invalidated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr() -> BlockPointer {
        BlockPointer::temporary()
    }

    #[test]
    fn test_root_path() {
        let cache = NodeCache::new();
        let root_ptr = ptr();
        let root = cache.get_or_create_root(root_ptr);
        let path = cache.path_from_node(root).unwrap();
        assert!(path.is_root());
        assert_eq!(path.tail_pointer(), root_ptr);
        assert_eq!(path.to_string(), "/");
    }

    #[test]
    fn test_nested_path() {
        let cache = NodeCache::new();
        let root = cache.get_or_create_root(ptr());
        let dir = cache.get_or_create(root, "docs", ptr()).unwrap();
        let file_ptr = ptr();
        let file = cache.get_or_create(dir, "notes.txt", file_ptr).unwrap();

        let path = cache.path_from_node(file).unwrap();
        assert_eq!(path.depth(), 3);
        assert_eq!(path.to_string(), "/docs/notes.txt");
        assert_eq!(path.tail_pointer(), file_ptr);
        assert_eq!(path.parent_path().unwrap().tail_name(), "docs");
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let cache = NodeCache::new();
        let root = cache.get_or_create_root(ptr());
        let p = ptr();
        let a = cache.get_or_create(root, "f", p).unwrap();
        let b = cache.get_or_create(root, "f", p).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_update_pointer_rekeys_lookup() {
        let cache = NodeCache::new();
        let root = cache.get_or_create_root(ptr());
        let old = ptr();
        let id = cache.get_or_create(root, "f", old).unwrap();

        let new = ptr();
        assert!(cache.update_pointer(old.bref(), new));
        assert_eq!(cache.get(new.bref()), Some(id));
        assert_eq!(cache.get(old.bref()), None);
        assert_eq!(cache.pointer(id), Some(new));
    }

    #[test]
    fn test_unlinked_node_has_no_path() {
        let cache = NodeCache::new();
        let root = cache.get_or_create_root(ptr());
        let id = cache.get_or_create(root, "gone", ptr()).unwrap();
        assert!(!cache.is_unlinked(id));
        assert!(cache.unlink(id));
        assert!(cache.is_unlinked(id));
        assert!(cache.path_from_node(id).is_none());
    }

    #[test]
    fn test_rename_moves_node() {
        let cache = NodeCache::new();
        let root = cache.get_or_create_root(ptr());
        let a = cache.get_or_create(root, "a", ptr()).unwrap();
        let b = cache.get_or_create(root, "b", ptr()).unwrap();
        let file = cache.get_or_create(a, "f", ptr()).unwrap();

        assert!(cache.rename(file, b, "g"));
        assert_eq!(cache.path_from_node(file).unwrap().to_string(), "/b/g");
    }

    #[test]
    fn test_release_recycles_slot_with_new_generation() {
        let cache = NodeCache::new();
        let root = cache.get_or_create_root(ptr());
        let id = cache.get_or_create(root, "f", ptr()).unwrap();
        cache.release(id);

        assert!(cache.pointer(id).is_none());
        let replacement = cache.get_or_create(root, "g", ptr()).unwrap();
        // Slot reused, but the stale id still resolves to nothing.
        assert_ne!(id, replacement);
        assert!(cache.pointer(id).is_none());
        assert!(cache.pointer(replacement).is_some());
    }

    #[test]
    fn test_invalidate_all_goes_stale_in_one_batch() {
        let cache = NodeCache::new();
        let root = cache.get_or_create_root(ptr());
        let a = cache.get_or_create(root, "a", ptr()).unwrap();
        let b = cache.get_or_create(root, "b", ptr()).unwrap();

        let invalidated = cache.invalidate_all();
        assert_eq!(invalidated.len(), 3);
        for id in [root, a, b] {
            assert!(cache.pointer(id).is_none());
            assert!(cache.path_from_node(id).is_none());
        }
        assert!(cache.is_empty());
    }
}

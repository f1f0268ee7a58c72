//! Directory-mutating operations embedded in metadata revisions.
//!
//! Each revision carries the ordered list of operations that produced it
//! from its predecessor. The operation set is closed, so every per-type
//! behavior (inversion for local undo, block-update bookkeeping, observer
//! notification shape) is an exhaustive match and the compiler guarantees
//! completeness when a new operation is added.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::{BlockPointer, EntryType};
use crate::meta::revision::RevisionNumber;

/// An operation that could not be inverted for local undo.
#[derive(Error, Debug)]
#[error("cannot invert {kind} op: {reason}")]
pub struct OpInvertError {
    pub kind: &'static str,
    pub reason: String,
}

/// A pointer rewrite performed by an operation: the block previously
/// referenced by `unref` is now referenced by `reref`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockUpdate {
    pub unref: BlockPointer,
    pub reref: BlockPointer,
}

impl BlockUpdate {
    /// An update whose new pointer is not yet known; filled in when the
    /// sync engine assigns permanent pointers.
    pub fn pending(unref: BlockPointer) -> Self {
        Self {
            unref,
            reref: BlockPointer::ZERO,
        }
    }

    pub fn new(unref: BlockPointer, reref: BlockPointer) -> Self {
        Self { unref, reref }
    }

    pub fn is_filled(&self) -> bool {
        !self.reref.is_zero()
    }

    /// Swap old and new, for inversion.
    pub fn reversed(&self) -> Self {
        Self {
            unref: self.reref,
            reref: self.unref,
        }
    }
}

/// One contiguous span written to a file.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct WriteRange {
    pub offset: u64,
    pub len: u64,
}

/// Which attribute a `SetAttr` changed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum AttrChange {
    Exec,
    Mtime,
    Size,
}

/// Bookkeeping shared by every operation: blocks newly referenced, blocks
/// no longer referenced, and pointer rewrites for blocks that changed
/// identity during the revision.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct OpCommon {
    pub refs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockPointer>,
    pub updates: Vec<BlockUpdate>,
}

/// A directory-mutating operation.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum FolderOp {
    /// `name` created under the directory identified by `dir.unref`.
    Create {
        common: OpCommon,
        name: String,
        dir: BlockUpdate,
        entry_type: EntryType,
    },
    /// `name` removed from the directory identified by `dir.unref`.
    Remove {
        common: OpCommon,
        name: String,
        dir: BlockUpdate,
        removed_type: EntryType,
    },
    /// `old_name` in `old_dir` became `new_name` in `new_dir` (`None` when
    /// the rename stayed within one directory).
    Rename {
        common: OpCommon,
        old_name: String,
        old_dir: BlockUpdate,
        new_name: String,
        new_dir: Option<BlockUpdate>,
        renamed: BlockPointer,
        renamed_type: EntryType,
    },
    /// Writes flushed to the file identified by `file.unref`.
    Sync {
        common: OpCommon,
        file: BlockUpdate,
        writes: Vec<WriteRange>,
    },
    /// An attribute change on `file`, a child of `dir.unref` named `name`.
    SetAttr {
        common: OpCommon,
        name: String,
        dir: BlockUpdate,
        file: BlockPointer,
        attr: AttrChange,
    },
    /// Garbage collection of blocks unreferenced up to `latest_rev`.
    Gc {
        common: OpCommon,
        latest_rev: RevisionNumber,
    },
    /// A conflict-resolution or batched-sync summary marker.
    Resolution { common: OpCommon },
    /// A key rotation; carries no user-visible tree change.
    Rekey { common: OpCommon },
}

impl FolderOp {
    pub fn create(name: impl Into<String>, dir: BlockPointer, entry_type: EntryType) -> Self {
        FolderOp::Create {
            common: OpCommon::default(),
            name: name.into(),
            dir: BlockUpdate::pending(dir),
            entry_type,
        }
    }

    pub fn remove(name: impl Into<String>, dir: BlockPointer, removed_type: EntryType) -> Self {
        FolderOp::Remove {
            common: OpCommon::default(),
            name: name.into(),
            dir: BlockUpdate::pending(dir),
            removed_type,
        }
    }

    pub fn rename(
        old_name: impl Into<String>,
        old_dir: BlockPointer,
        new_name: impl Into<String>,
        new_dir: Option<BlockPointer>,
        renamed: BlockPointer,
        renamed_type: EntryType,
    ) -> Self {
        FolderOp::Rename {
            common: OpCommon::default(),
            old_name: old_name.into(),
            old_dir: BlockUpdate::pending(old_dir),
            new_name: new_name.into(),
            new_dir: new_dir.map(BlockUpdate::pending),
            renamed,
            renamed_type,
        }
    }

    pub fn sync(file: BlockPointer) -> Self {
        FolderOp::Sync {
            common: OpCommon::default(),
            file: BlockUpdate::pending(file),
            writes: Vec::new(),
        }
    }

    pub fn set_attr(
        name: impl Into<String>,
        dir: BlockPointer,
        file: BlockPointer,
        attr: AttrChange,
    ) -> Self {
        FolderOp::SetAttr {
            common: OpCommon::default(),
            name: name.into(),
            dir: BlockUpdate::pending(dir),
            file,
            attr,
        }
    }

    pub fn gc(latest_rev: RevisionNumber) -> Self {
        FolderOp::Gc {
            common: OpCommon::default(),
            latest_rev,
        }
    }

    pub fn resolution() -> Self {
        FolderOp::Resolution {
            common: OpCommon::default(),
        }
    }

    pub fn rekey() -> Self {
        FolderOp::Rekey {
            common: OpCommon::default(),
        }
    }

    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FolderOp::Create { .. } => "create",
            FolderOp::Remove { .. } => "remove",
            FolderOp::Rename { .. } => "rename",
            FolderOp::Sync { .. } => "sync",
            FolderOp::SetAttr { .. } => "setattr",
            FolderOp::Gc { .. } => "gc",
            FolderOp::Resolution { .. } => "resolution",
            FolderOp::Rekey { .. } => "rekey",
        }
    }

    pub fn common(&self) -> &OpCommon {
        match self {
            FolderOp::Create { common, .. }
            | FolderOp::Remove { common, .. }
            | FolderOp::Rename { common, .. }
            | FolderOp::Sync { common, .. }
            | FolderOp::SetAttr { common, .. }
            | FolderOp::Gc { common, .. }
            | FolderOp::Resolution { common }
            | FolderOp::Rekey { common } => common,
        }
    }

    pub fn common_mut(&mut self) -> &mut OpCommon {
        match self {
            FolderOp::Create { common, .. }
            | FolderOp::Remove { common, .. }
            | FolderOp::Rename { common, .. }
            | FolderOp::Sync { common, .. }
            | FolderOp::SetAttr { common, .. }
            | FolderOp::Gc { common, .. }
            | FolderOp::Resolution { common }
            | FolderOp::Rekey { common } => common,
        }
    }

    pub fn add_ref(&mut self, ptr: BlockPointer) {
        self.common_mut().refs.push(ptr);
    }

    pub fn add_unref(&mut self, ptr: BlockPointer) {
        self.common_mut().unrefs.push(ptr);
    }

    /// Record a pointer rewrite. The primary directory/file slots are
    /// filled first when the old pointer matches; everything else lands in
    /// the common update list.
    pub fn add_update(&mut self, unref: BlockPointer, reref: BlockPointer) {
        let update = BlockUpdate::new(unref, reref);
        match self {
            FolderOp::Create { dir, .. }
            | FolderOp::Remove { dir, .. }
            | FolderOp::SetAttr { dir, .. } => {
                if dir.unref == unref && !dir.is_filled() {
                    *dir = update;
                    return;
                }
            }
            FolderOp::Rename {
                old_dir, new_dir, ..
            } => {
                if old_dir.unref == unref && !old_dir.is_filled() {
                    *old_dir = update;
                    return;
                }
                if let Some(new_dir) = new_dir {
                    if new_dir.unref == unref && !new_dir.is_filled() {
                        *new_dir = update;
                        return;
                    }
                }
            }
            FolderOp::Sync { file, .. } => {
                if file.unref == unref && !file.is_filled() {
                    *file = update;
                    return;
                }
            }
            FolderOp::Gc { .. } | FolderOp::Resolution { .. } | FolderOp::Rekey { .. } => {}
        }
        self.common_mut().updates.push(update);
    }

    /// Every pointer rewrite this operation performed, primary slots
    /// included.
    pub fn all_updates(&self) -> Vec<BlockUpdate> {
        let mut updates = Vec::new();
        match self {
            FolderOp::Create { dir, .. }
            | FolderOp::Remove { dir, .. }
            | FolderOp::SetAttr { dir, .. } => {
                if dir.is_filled() {
                    updates.push(*dir);
                }
            }
            FolderOp::Rename {
                old_dir, new_dir, ..
            } => {
                if old_dir.is_filled() {
                    updates.push(*old_dir);
                }
                if let Some(new_dir) = new_dir {
                    if new_dir.is_filled() {
                        updates.push(*new_dir);
                    }
                }
            }
            FolderOp::Sync { file, .. } => {
                if file.is_filled() {
                    updates.push(*file);
                }
            }
            FolderOp::Gc { .. } | FolderOp::Resolution { .. } | FolderOp::Rekey { .. } => {}
        }
        updates.extend_from_slice(&self.common().updates);
        updates
    }

    /// Record a write span on a `Sync` op; merged with a directly adjacent
    /// previous span.
    pub fn add_write(&mut self, offset: u64, len: u64) {
        if let FolderOp::Sync { writes, .. } = self {
            if let Some(last) = writes.last_mut() {
                if last.offset + last.len == offset {
                    last.len += len;
                    return;
                }
            }
            writes.push(WriteRange { offset, len });
        }
    }

    /// The operation that undoes this one for local-notification purposes.
    ///
    /// Pointer rewrites are reversed wholesale; bare refs and unrefs are
    /// not carried since they do not matter for notifications.
    pub fn invert(&self) -> Result<FolderOp, OpInvertError> {
        let mut inverted = match self {
            FolderOp::Create {
                name,
                dir,
                entry_type,
                ..
            } => FolderOp::remove(name.clone(), dir.reref, *entry_type),
            FolderOp::Remove {
                name,
                dir,
                removed_type,
                ..
            } => FolderOp::create(name.clone(), dir.reref, *removed_type),
            FolderOp::Rename {
                old_name,
                old_dir,
                new_name,
                new_dir,
                renamed,
                renamed_type,
                ..
            } => {
                let forward_new_dir = (*new_dir).unwrap_or(*old_dir);
                if !forward_new_dir.is_filled() {
                    return Err(OpInvertError {
                        kind: "rename",
                        reason: format!(
                            "target directory update for {new_name} was never filled"
                        ),
                    });
                }
                FolderOp::rename(
                    new_name.clone(),
                    forward_new_dir.reref,
                    old_name.clone(),
                    (*new_dir).map(|_| old_dir.reref),
                    *renamed,
                    *renamed_type,
                )
            }
            FolderOp::Sync { file, writes, .. } => {
                // Replaying the same spans marks the right bytes invalid.
                let mut op = FolderOp::sync(file.reref);
                if let FolderOp::Sync {
                    writes: ref mut inv_writes,
                    ..
                } = op
                {
                    inv_writes.clone_from(writes);
                }
                op
            }
            FolderOp::SetAttr {
                name,
                dir,
                file,
                attr,
                ..
            } => FolderOp::set_attr(name.clone(), dir.reref, *file, *attr),
            FolderOp::Gc { latest_rev, .. } => FolderOp::gc(*latest_rev),
            FolderOp::Resolution { .. } => FolderOp::resolution(),
            FolderOp::Rekey { .. } => FolderOp::rekey(),
        };
        for update in self.all_updates() {
            let reversed = update.reversed();
            inverted.add_update(reversed.unref, reversed.reref);
        }
        Ok(inverted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr() -> BlockPointer {
        BlockPointer::temporary()
    }

    #[test]
    fn test_add_update_fills_primary_slot_first() {
        let old_dir = ptr();
        let new_dir = ptr();
        let mut op = FolderOp::create("foo", old_dir, EntryType::File);
        op.add_update(old_dir, new_dir);
        match &op {
            FolderOp::Create { dir, .. } => {
                assert_eq!(dir.unref, old_dir);
                assert_eq!(dir.reref, new_dir);
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert!(op.common().updates.is_empty());

        // A second rewrite of a different pointer lands in the common list.
        let other_old = ptr();
        let other_new = ptr();
        op.add_update(other_old, other_new);
        assert_eq!(op.common().updates.len(), 1);
        assert_eq!(op.all_updates().len(), 2);
    }

    #[test]
    fn test_rename_update_routing() {
        let old_dir = ptr();
        let new_dir = ptr();
        let mut op = FolderOp::rename("a", old_dir, "b", Some(new_dir), ptr(), EntryType::File);
        let old_dir_new = ptr();
        let new_dir_new = ptr();
        op.add_update(old_dir, old_dir_new);
        op.add_update(new_dir, new_dir_new);
        match &op {
            FolderOp::Rename {
                old_dir: od,
                new_dir: Some(nd),
                ..
            } => {
                assert_eq!(od.reref, old_dir_new);
                assert_eq!(nd.reref, new_dir_new);
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_create_inverts_to_remove() {
        let old_dir = ptr();
        let new_dir = ptr();
        let mut op = FolderOp::create("foo", old_dir, EntryType::Dir);
        op.add_update(old_dir, new_dir);

        let inverted = op.invert().unwrap();
        match &inverted {
            FolderOp::Remove {
                name,
                dir,
                removed_type,
                ..
            } => {
                assert_eq!(name, "foo");
                // The inverse removes from the post-op directory and
                // rewrites it back to the pre-op pointer.
                assert_eq!(dir.unref, new_dir);
                assert_eq!(dir.reref, old_dir);
                assert_eq!(*removed_type, EntryType::Dir);
            }
            other => panic!("unexpected inversion {other:?}"),
        }
    }

    #[test]
    fn test_remove_inverts_to_create() {
        let old_dir = ptr();
        let new_dir = ptr();
        let mut op = FolderOp::remove("foo", old_dir, EntryType::File);
        op.add_update(old_dir, new_dir);
        let inverted = op.invert().unwrap();
        assert!(matches!(inverted, FolderOp::Create { .. }));
    }

    #[test]
    fn test_rename_inverts_with_swapped_names() {
        let old_dir = ptr();
        let new_dir = ptr();
        let renamed = ptr();
        let mut op =
            FolderOp::rename("from", old_dir, "to", Some(new_dir), renamed, EntryType::File);
        op.add_update(old_dir, ptr());
        op.add_update(new_dir, ptr());

        let inverted = op.invert().unwrap();
        match inverted {
            FolderOp::Rename {
                old_name, new_name, ..
            } => {
                assert_eq!(old_name, "to");
                assert_eq!(new_name, "from");
            }
            other => panic!("unexpected inversion {other:?}"),
        }
    }

    #[test]
    fn test_unfilled_rename_cannot_invert() {
        let op = FolderOp::rename("from", ptr(), "to", Some(ptr()), ptr(), EntryType::File);
        assert!(op.invert().is_err());
    }

    #[test]
    fn test_sync_inversion_replays_writes() {
        let file_old = ptr();
        let file_new = ptr();
        let mut op = FolderOp::sync(file_old);
        op.add_write(0, 100);
        op.add_write(100, 50); // adjacent, merges
        op.add_write(500, 10);
        op.add_update(file_old, file_new);

        match &op {
            FolderOp::Sync { writes, .. } => {
                assert_eq!(
                    writes,
                    &vec![
                        WriteRange { offset: 0, len: 150 },
                        WriteRange {
                            offset: 500,
                            len: 10
                        }
                    ]
                );
            }
            other => panic!("unexpected op {other:?}"),
        }

        let inverted = op.invert().unwrap();
        match inverted {
            FolderOp::Sync { writes, .. } => assert_eq!(writes.len(), 2),
            other => panic!("unexpected inversion {other:?}"),
        }
    }

    #[test]
    fn test_inversion_reverses_updates() {
        let old_dir = ptr();
        let new_dir = ptr();
        let mut op = FolderOp::create("x", old_dir, EntryType::File);
        op.add_update(old_dir, new_dir);
        let inverted = op.invert().unwrap();
        let updates = inverted.all_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].unref, new_dir);
        assert_eq!(updates[0].reref, old_dir);
    }
}

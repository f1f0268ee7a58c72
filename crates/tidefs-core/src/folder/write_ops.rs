//! User-facing folder operations.
//!
//! Mutating operations stage their changes into the operation buffer and
//! dirty-block stage under the writer lock (through the metadata-write
//! retry wrapper), then either sync synchronously (exclusive creates) or
//! signal the background flusher. Reads go through the dirty overlay
//! first and fall back to the clean-block cache.

use std::collections::BTreeMap;

use tracing::{debug, instrument, warn};

use crate::block::{Block, BlockPointer, DirBlock, DirEntry, EntryType};
use crate::folder::sync_engine::{apply_write, Excl};
use crate::folder::{make_lock_state, DeferredWrite, EngineError, FolderBranchEngine, WriterState};
use crate::meta::{AttrChange, FolderHandle, FolderOp, ImmutableMd, RootMetadata, WriteRange};
use crate::node::{NodeId, NodePath};
use crate::server::NodeChange;
use crate::sync::{LockState, OpContext};

impl FolderBranchEngine {
    /// Create a brand-new folder on the server, with this engine's id and
    /// the given handle, and adopt its first revision as head.
    #[instrument(level = "info", skip(self, ctx, handle), fields(folder = %self.id()))]
    pub async fn initialize_new_folder(
        &self,
        ctx: &OpContext,
        handle: FolderHandle,
    ) -> Result<(), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        let lstate = make_lock_state();
        let mut ws = self.writer_lock.lock(&lstate).await;
        {
            let hs = self.head_lock.read(&lstate).await;
            if hs.head.is_some() {
                return Err(EngineError::Invariant(
                    "folder is already initialized".to_string(),
                ));
            }
        }

        let session = self.services.keys.current_session(&ctx).await?;
        if !handle.is_writer(&session.user) {
            return Err(EngineError::WriteAccess {
                user: session.user,
                folder: handle.canonical_name(),
            });
        }

        let root_block = Block::empty_dir();
        let (root_ptr, readied) = self
            .services
            .block_server
            .ready(&ctx, self.id(), &root_block)
            .await?;
        self.services
            .block_server
            .put(&ctx, self.id(), root_ptr, readied)
            .await?;
        self.clean_blocks
            .insert(root_ptr.bref(), std::sync::Arc::new(root_block));

        let mut md = RootMetadata::make_initial(
            self.id(),
            handle,
            root_ptr,
            session.user.clone(),
        );
        let mut root_op = FolderOp::create("", BlockPointer::ZERO, EntryType::Dir);
        root_op.add_ref(root_ptr);
        md.add_op(root_op);

        let published = self
            .services
            .md_server
            .put(&ctx, md, &session.verifying_key)
            .await?;

        let mut hs = self.head_lock.write(&lstate).await;
        self.set_initial_head_locked(&ctx, &mut ws, &mut hs, &lstate, published)
            .await
    }

    /// Fetch this folder's current head from the server and adopt it.
    /// No-op when a head is already set.
    pub async fn initialize_from_server(&self, ctx: &OpContext) -> Result<(), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        let lstate = make_lock_state();
        let mut ws = self.writer_lock.lock(&lstate).await;
        {
            let hs = self.head_lock.read(&lstate).await;
            if hs.head.is_some() {
                return Ok(());
            }
        }
        let md = self
            .services
            .md_server
            .get_for_folder(&ctx, self.id())
            .await
            .map_err(|e| self.transform_read_error(e.into()))?
            .ok_or(EngineError::NotInitialized)?;

        let mut hs = self.head_lock.write(&lstate).await;
        self.set_initial_head_trusted_locked(&ctx, &mut ws, &mut hs, &lstate, md)
            .await
    }

    /// Adopt a head that arrived from a rekey notification, fetched by
    /// folder id without handle verification. The head stays untrusted
    /// until validated against a user-initiated fetch.
    pub async fn set_head_from_rekey_notification(
        &self,
        ctx: &OpContext,
        md: ImmutableMd,
    ) -> Result<(), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        let lstate = make_lock_state();
        let mut ws = self.writer_lock.lock(&lstate).await;
        let mut hs = self.head_lock.write(&lstate).await;
        let trust = if hs.head.is_none() {
            super::HeadTrust::Untrusted
        } else {
            super::HeadTrust::Trusted
        };
        self.set_head_locked(&ctx, &mut ws, &mut hs, &lstate, md, trust)
            .await
    }

    /// The root directory node, initializing from the server on first
    /// access.
    pub async fn root_node(&self, ctx: &OpContext) -> Result<NodeId, EngineError> {
        self.check_running()?;
        let head = match self.get_head(true).await {
            Some(head) => head,
            None => {
                self.initialize_from_server(ctx).await?;
                self.get_head(true)
                    .await
                    .ok_or(EngineError::NotInitialized)?
            }
        };
        Ok(self.nodes.get_or_create_root(head.root_ptr()))
    }

    /// Look up one child by name. Symlinks resolve to their entry with no
    /// node.
    pub async fn lookup(
        &self,
        ctx: &OpContext,
        dir: NodeId,
        name: &str,
    ) -> Result<(Option<NodeId>, DirEntry), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        let lstate = make_lock_state();
        let ptr = self.nodes.pointer(dir).ok_or(EngineError::StaleNode)?;
        let block = self
            .block_for_reading(&ctx, &lstate, ptr)
            .await
            .map_err(|e| self.transform_read_error(e))?;
        let entry = block
            .as_dir()?
            .children
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NoSuchEntry {
                name: name.to_string(),
            })?;
        if entry.entry_type == EntryType::Sym {
            return Ok((None, entry));
        }
        let node = self
            .nodes
            .get_or_create(dir, name, entry.pointer)
            .ok_or(EngineError::StaleNode)?;
        Ok((Some(node), entry))
    }

    /// All children of a directory. An unlinked directory has none.
    pub async fn get_dir_children(
        &self,
        ctx: &OpContext,
        dir: NodeId,
    ) -> Result<BTreeMap<String, DirEntry>, EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        let lstate = make_lock_state();
        if self.nodes.is_unlinked(dir) {
            return Ok(BTreeMap::new());
        }
        let ptr = self.nodes.pointer(dir).ok_or(EngineError::StaleNode)?;
        let block = self
            .block_for_reading(&ctx, &lstate, ptr)
            .await
            .map_err(|e| self.transform_read_error(e))?;
        Ok(block.as_dir()?.children.clone())
    }

    /// Stat a node: its entry in the parent directory, with dirty sizes
    /// overlaid.
    pub async fn stat(&self, ctx: &OpContext, node: NodeId) -> Result<DirEntry, EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        let lstate = make_lock_state();
        let path = self.nodes.path_from_node(node).ok_or(EngineError::StaleNode)?;

        let mut entry = match path.parent_path() {
            None => {
                let head = self.get_head(true).await.ok_or(EngineError::NotInitialized)?;
                DirEntry::new(head.root_ptr(), EntryType::Dir, head.local_timestamp())
            }
            Some(parent) => {
                let block = self
                    .block_for_reading(&ctx, &lstate, parent.tail_pointer())
                    .await
                    .map_err(|e| self.transform_read_error(e))?;
                block
                    .as_dir()?
                    .children
                    .get(path.tail_name())
                    .cloned()
                    .ok_or_else(|| EngineError::NoSuchEntry {
                        name: path.tail_name().to_string(),
                    })?
            }
        };

        // A buffered write may not be reflected in the parent entry yet.
        {
            let stage = self.block_lock.read(&lstate).await;
            if let Some(Block::File(file)) = stage.block(path.tail_ref()) {
                entry.size = file.contents.len() as u64;
            }
        }
        Ok(entry)
    }

    /// Read up to `len` bytes at `offset`.
    pub async fn read(
        &self,
        ctx: &OpContext,
        file: NodeId,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        let lstate = make_lock_state();
        let ptr = self.nodes.pointer(file).ok_or(EngineError::StaleNode)?;
        let block = self
            .block_for_reading(&ctx, &lstate, ptr)
            .await
            .map_err(|e| self.transform_read_error(e))?;
        let contents = &block.as_file()?.contents;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if start >= contents.len() {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(len).min(contents.len());
        Ok(contents[start..end].to_vec())
    }

    /// Create a subdirectory.
    #[instrument(level = "debug", skip(self, ctx), fields(folder = %self.id(), name))]
    pub async fn create_dir(
        &self,
        ctx: &OpContext,
        parent: NodeId,
        name: &str,
    ) -> Result<(NodeId, DirEntry), EngineError> {
        self.create_entry(ctx, parent, name, EntryType::Dir, Excl::No, None)
            .await
            .map(|(node, entry)| (node.expect("directories always get nodes"), entry))
    }

    /// Create a file. With `excl`, the create syncs immediately and two
    /// racing exclusive creates of the same name end with exactly one
    /// winner.
    #[instrument(level = "debug", skip(self, ctx), fields(folder = %self.id(), name, excl))]
    pub async fn create_file(
        &self,
        ctx: &OpContext,
        parent: NodeId,
        name: &str,
        exec: bool,
        excl: bool,
    ) -> Result<(NodeId, DirEntry), EngineError> {
        let entry_type = if exec { EntryType::Exec } else { EntryType::File };
        let excl = if excl { Excl::Yes } else { Excl::No };
        self.create_entry(ctx, parent, name, entry_type, excl, None)
            .await
            .map(|(node, entry)| (node.expect("files always get nodes"), entry))
    }

    /// Create a symlink to `target`.
    #[instrument(level = "debug", skip(self, ctx), fields(folder = %self.id(), name))]
    pub async fn create_link(
        &self,
        ctx: &OpContext,
        parent: NodeId,
        name: &str,
        target: &str,
    ) -> Result<DirEntry, EngineError> {
        self.create_entry(
            ctx,
            parent,
            name,
            EntryType::Sym,
            Excl::No,
            Some(target.to_string()),
        )
        .await
        .map(|(_, entry)| entry)
    }

    async fn create_entry(
        &self,
        ctx: &OpContext,
        parent: NodeId,
        name: &str,
        entry_type: EntryType,
        excl: Excl,
        sym_target: Option<String>,
    ) -> Result<(Option<NodeId>, DirEntry), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        let mut created = None;
        self.with_md_write_retry(&ctx, async |ws, lstate| {
            created = Some(
                self.create_entry_locked(
                    &ctx,
                    ws,
                    lstate,
                    parent,
                    name,
                    entry_type,
                    excl,
                    sym_target.clone(),
                )
                .await?,
            );
            Ok(())
        })
        .await?;
        let (node, entry) = created.ok_or_else(|| {
            EngineError::Invariant("create finished without a result".to_string())
        })?;
        self.observers
            .batch_changes(&[NodeChange::dir(parent, vec![name.to_string()])], &[]);
        Ok((node, entry))
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_entry_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        lstate: &LockState,
        parent: NodeId,
        name: &str,
        entry_type: EntryType,
        excl: Excl,
        sym_target: Option<String>,
    ) -> Result<(Option<NodeId>, DirEntry), EngineError> {
        self.head_for_write(ctx, lstate).await?;
        if self.nodes.is_unlinked(parent) {
            return Err(EngineError::StaleNode);
        }
        let parent_path = self
            .nodes
            .path_from_node(parent)
            .ok_or(EngineError::StaleNode)?;
        let parent_ref = parent_path.tail_ref();
        let mut parent_block = self.dir_block_for_staging(ctx, lstate, &parent_path).await?;
        if parent_block.children.contains_key(name) {
            return Err(EngineError::NameExists {
                name: name.to_string(),
            });
        }

        let now = self.services.clock.now_unix_nanos();
        let new_ptr = BlockPointer::temporary();
        let mut entry = DirEntry::new(new_ptr, entry_type, now);
        if let Some(target) = &sym_target {
            entry.size = target.len() as u64;
            entry.sym_path = Some(target.clone());
        }
        parent_block.children.insert(name.to_string(), entry.clone());

        let new_node = if entry_type == EntryType::Sym {
            None
        } else {
            Some(
                self.nodes
                    .get_or_create(parent, name, new_ptr)
                    .ok_or(EngineError::StaleNode)?,
            )
        };

        let parent_was_dirty = {
            let mut stage = self.block_lock.write(lstate).await;
            let was_dirty = stage.block(parent_ref).is_some();
            stage.insert_block(parent_ref, Block::Dir(parent_block));
            stage.mark_dir_dirty(parent_ref, parent);
            match entry_type {
                EntryType::Dir => stage.insert_block(new_ptr.bref(), Block::empty_dir()),
                EntryType::File | EntryType::Exec => {
                    stage.insert_block(new_ptr.bref(), Block::empty_file());
                }
                EntryType::Sym => {}
            }
            was_dirty
        };

        let mut op = FolderOp::create(name, parent_path.tail_pointer(), entry_type);
        if entry_type != EntryType::Sym {
            op.add_ref(new_ptr);
        }
        let mut touched = vec![parent];
        if let Some(node) = new_node {
            touched.push(node);
        }
        ws.ops.add(op, touched);

        if excl == Excl::Yes {
            if let Err(err) = self.sync_all_locked(ctx, ws, lstate, Excl::Yes).await {
                // Roll back exactly what this staging added.
                debug!(error = %err, name, "exclusive create failed; rolling back staging");
                ws.ops.undo_last();
                let mut stage = self.block_lock.write(lstate).await;
                stage.discard(new_ptr.bref());
                if let Some(Block::Dir(dir)) = stage.block_mut(parent_ref) {
                    dir.children.remove(name);
                }
                if !parent_was_dirty {
                    stage.discard(parent_ref);
                }
                drop(stage);
                if let Some(node) = new_node {
                    self.nodes.unlink(node);
                }
                if matches!(err, EngineError::ExclusiveCreateRace) {
                    // Catch up with whoever won before the retry, so the
                    // rerun sees the server's view of this name.
                    match self.get_and_apply_updates_locked(ctx, ws, lstate).await {
                        Ok(()) | Err(EngineError::Unmerged) => {}
                        Err(update_err) => {
                            warn!(error = %update_err, "couldn't catch up after losing an exclusive create");
                        }
                    }
                }
                return Err(err);
            }
            // The sync assigned the entry its permanent identity.
            if let Some(node) = new_node {
                if let Some(ptr) = self.nodes.pointer(node) {
                    entry.pointer = ptr;
                }
            }
        } else {
            self.signal_write();
        }
        Ok((new_node, entry))
    }

    /// Remove a file or symlink.
    #[instrument(level = "debug", skip(self, ctx), fields(folder = %self.id(), name))]
    pub async fn remove_entry(
        &self,
        ctx: &OpContext,
        parent: NodeId,
        name: &str,
    ) -> Result<(), EngineError> {
        self.remove(ctx, parent, name, false).await
    }

    /// Remove an empty directory.
    #[instrument(level = "debug", skip(self, ctx), fields(folder = %self.id(), name))]
    pub async fn remove_dir(
        &self,
        ctx: &OpContext,
        parent: NodeId,
        name: &str,
    ) -> Result<(), EngineError> {
        self.remove(ctx, parent, name, true).await
    }

    async fn remove(
        &self,
        ctx: &OpContext,
        parent: NodeId,
        name: &str,
        expect_dir: bool,
    ) -> Result<(), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        self.with_md_write_retry(&ctx, async |ws, lstate| {
            self.remove_entry_locked(&ctx, ws, lstate, parent, name, expect_dir)
                .await
        })
        .await?;
        self.observers
            .batch_changes(&[NodeChange::dir(parent, vec![name.to_string()])], &[]);
        Ok(())
    }

    async fn remove_entry_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        lstate: &LockState,
        parent: NodeId,
        name: &str,
        expect_dir: bool,
    ) -> Result<(), EngineError> {
        self.head_for_write(ctx, lstate).await?;
        let parent_path = self
            .nodes
            .path_from_node(parent)
            .ok_or(EngineError::StaleNode)?;
        let parent_ref = parent_path.tail_ref();
        let mut parent_block = self.dir_block_for_staging(ctx, lstate, &parent_path).await?;
        let entry = parent_block
            .children
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NoSuchEntry {
                name: name.to_string(),
            })?;

        if expect_dir {
            if entry.entry_type != EntryType::Dir {
                return Err(EngineError::NotADirectory {
                    name: name.to_string(),
                });
            }
            // Only empty directories may go.
            let target = self
                .block_for_reading(ctx, lstate, entry.pointer)
                .await
                .map_err(|e| self.transform_read_error(e))?;
            if !target.as_dir()?.children.is_empty() {
                return Err(EngineError::DirNotEmpty {
                    name: name.to_string(),
                });
            }
        } else if entry.entry_type == EntryType::Dir {
            return Err(EngineError::NotAFile {
                name: name.to_string(),
            });
        }

        let mut op = FolderOp::remove(name, parent_path.tail_pointer(), entry.entry_type);
        op.add_unref(entry.pointer);
        if entry.entry_type != EntryType::Sym {
            // Best-effort fetch for unref accounting; a block that is
            // already gone must not fail the removal.
            match self.fetch_block(ctx, entry.pointer).await {
                Ok(_) => {}
                Err(EngineError::BlockServer(err)) if err.is_recoverable_for_removal() => {
                    warn!(
                        error = %err,
                        name,
                        "couldn't fetch block for unref accounting; treating as absent"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        parent_block.children.remove(name);
        {
            let mut stage = self.block_lock.write(lstate).await;
            stage.insert_block(parent_ref, Block::Dir(parent_block));
            stage.mark_dir_dirty(parent_ref, parent);
        }

        let mut touched = vec![parent];
        if let Some(child) = self.nodes.get(entry.pointer.bref()) {
            self.nodes.unlink(child);
            touched.push(child);
        }
        ws.ops.add(op, touched);
        self.signal_write();
        Ok(())
    }

    /// Rename (and possibly move) an entry within this folder.
    #[instrument(level = "debug", skip(self, ctx), fields(folder = %self.id(), old_name, new_name))]
    pub async fn rename(
        &self,
        ctx: &OpContext,
        old_parent: NodeId,
        old_name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<(), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        self.with_md_write_retry(&ctx, async |ws, lstate| {
            self.rename_locked(&ctx, ws, lstate, old_parent, old_name, new_parent, new_name)
                .await
        })
        .await?;
        self.observers.batch_changes(
            &[
                NodeChange::dir(old_parent, vec![old_name.to_string()]),
                NodeChange::dir(new_parent, vec![new_name.to_string()]),
            ],
            &[],
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn rename_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        lstate: &LockState,
        old_parent: NodeId,
        old_name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<(), EngineError> {
        self.head_for_write(ctx, lstate).await?;
        let old_path = self
            .nodes
            .path_from_node(old_parent)
            .ok_or(EngineError::StaleNode)?;
        let new_path = self
            .nodes
            .path_from_node(new_parent)
            .ok_or(EngineError::StaleNode)?;
        let same_dir = old_path.tail_ref() == new_path.tail_ref();

        let mut old_block = self.dir_block_for_staging(ctx, lstate, &old_path).await?;
        let mut entry = old_block
            .children
            .remove(old_name)
            .ok_or_else(|| EngineError::NoSuchEntry {
                name: old_name.to_string(),
            })?;
        entry.ctime = self.services.clock.now_unix_nanos();

        let mut op = FolderOp::rename(
            old_name,
            old_path.tail_pointer(),
            new_name,
            (!same_dir).then(|| new_path.tail_pointer()),
            entry.pointer,
            entry.entry_type,
        );

        let mut new_block = if same_dir {
            None
        } else {
            Some(self.dir_block_for_staging(ctx, lstate, &new_path).await?)
        };
        let target = new_block.as_mut().unwrap_or(&mut old_block);
        if let Some(existing) = target.children.get(new_name).cloned() {
            // Renaming over an existing entry replaces it.
            op.add_unref(existing.pointer);
            if let Some(node) = self.nodes.get(existing.pointer.bref()) {
                self.nodes.unlink(node);
            }
        }
        target.children.insert(new_name.to_string(), entry.clone());

        {
            let mut stage = self.block_lock.write(lstate).await;
            stage.insert_block(old_path.tail_ref(), Block::Dir(old_block));
            stage.mark_dir_dirty(old_path.tail_ref(), old_parent);
            if let Some(new_block) = new_block {
                stage.insert_block(new_path.tail_ref(), Block::Dir(new_block));
                stage.mark_dir_dirty(new_path.tail_ref(), new_parent);
            }
        }

        let mut touched = vec![old_parent];
        if !same_dir {
            touched.push(new_parent);
        }
        if let Some(moved) = self.nodes.get(entry.pointer.bref()) {
            self.nodes.rename(moved, new_parent, new_name);
            touched.push(moved);
        }
        ws.ops.add(op, touched);
        self.signal_write();
        Ok(())
    }

    /// Buffer a write into the dirty-block stage. Never hits the network
    /// except to fault in the file's current contents.
    #[instrument(level = "trace", skip(self, ctx, data), fields(folder = %self.id(), offset, len = data.len()))]
    pub async fn write(
        &self,
        ctx: &OpContext,
        file: NodeId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        let lstate = make_lock_state();
        let ptr = self.nodes.pointer(file).ok_or(EngineError::StaleNode)?;
        let bref = ptr.bref();

        let mut stage = self.block_lock.write(&lstate).await;
        if stage.is_syncing(bref) {
            // The file is mid-flush: apply to the local copy so reads see
            // the bytes, and defer re-application against the post-sync
            // pointers.
            if let Some(Block::File(f)) = stage.block_mut(bref) {
                apply_write(f, offset, data);
            }
            stage.defer_write(DeferredWrite {
                node: file,
                offset,
                data: data.to_vec(),
                truncate: false,
            });
            return Ok(());
        }

        let mut contents = match stage.block(bref) {
            Some(block) => block.as_file()?.clone(),
            None => {
                // Fault in the clean block without pinning the stage.
                drop(stage);
                let block = self
                    .fetch_block(&ctx, ptr)
                    .await
                    .map_err(|e| self.transform_read_error(e))?;
                let contents = block.as_file()?.clone();
                stage = self.block_lock.write(&lstate).await;
                if stage.is_syncing(bref) {
                    stage.defer_write(DeferredWrite {
                        node: file,
                        offset,
                        data: data.to_vec(),
                        truncate: false,
                    });
                    return Ok(());
                }
                contents
            }
        };

        apply_write(&mut contents, offset, data);
        stage.insert_block(bref, Block::File(contents));
        stage.mark_file_dirty(bref, file);
        stage.record_write(
            bref,
            WriteRange {
                offset,
                len: data.len() as u64,
            },
        );
        drop(stage);
        self.signal_write();
        Ok(())
    }

    /// Truncate (or extend) a file to `size` bytes.
    #[instrument(level = "trace", skip(self, ctx), fields(folder = %self.id(), size))]
    pub async fn truncate(
        &self,
        ctx: &OpContext,
        file: NodeId,
        size: u64,
    ) -> Result<(), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        let lstate = make_lock_state();
        let ptr = self.nodes.pointer(file).ok_or(EngineError::StaleNode)?;
        let bref = ptr.bref();

        let mut stage = self.block_lock.write(&lstate).await;
        if stage.is_syncing(bref) {
            if let Some(Block::File(f)) = stage.block_mut(bref) {
                f.contents
                    .resize(usize::try_from(size).unwrap_or(usize::MAX), 0);
            }
            stage.defer_write(DeferredWrite {
                node: file,
                offset: size,
                data: Vec::new(),
                truncate: true,
            });
            return Ok(());
        }
        let mut contents = match stage.block(bref) {
            Some(block) => block.as_file()?.clone(),
            None => {
                drop(stage);
                let block = self
                    .fetch_block(&ctx, ptr)
                    .await
                    .map_err(|e| self.transform_read_error(e))?;
                let contents = block.as_file()?.clone();
                stage = self.block_lock.write(&lstate).await;
                contents
            }
        };
        contents
            .contents
            .resize(usize::try_from(size).unwrap_or(usize::MAX), 0);
        stage.insert_block(bref, Block::File(contents));
        stage.mark_file_dirty(bref, file);
        stage.record_write(bref, WriteRange { offset: size, len: 0 });
        drop(stage);
        self.signal_write();
        Ok(())
    }

    /// Toggle the executable bit.
    pub async fn set_ex(
        &self,
        ctx: &OpContext,
        file: NodeId,
        exec: bool,
    ) -> Result<(), EngineError> {
        self.set_attr(ctx, file, AttrChange::Exec, move |entry| {
            let target = if exec { EntryType::Exec } else { EntryType::File };
            if entry.entry_type == target || entry.entry_type == EntryType::Dir {
                false
            } else {
                entry.entry_type = target;
                true
            }
        })
        .await
    }

    /// Set a file's modification time. `None` is a no-op.
    pub async fn set_mtime(
        &self,
        ctx: &OpContext,
        file: NodeId,
        mtime: Option<i64>,
    ) -> Result<(), EngineError> {
        let Some(mtime) = mtime else {
            return Ok(());
        };
        self.set_attr(ctx, file, AttrChange::Mtime, move |entry| {
            entry.mtime = mtime;
            true
        })
        .await
    }

    async fn set_attr(
        &self,
        ctx: &OpContext,
        node: NodeId,
        attr: AttrChange,
        mutate: impl Fn(&mut DirEntry) -> bool + Send + Sync,
    ) -> Result<(), EngineError> {
        self.check_running()?;
        let ctx = self.new_ctx(ctx);
        let mut parent_change = None;
        self.with_md_write_retry(&ctx, async |ws, lstate| {
            parent_change = self
                .set_attr_locked(&ctx, ws, lstate, node, attr, &mutate)
                .await?;
            Ok(())
        })
        .await?;
        if let Some(change) = parent_change {
            self.observers.batch_changes(&[change], &[]);
        }
        Ok(())
    }

    async fn set_attr_locked(
        &self,
        ctx: &OpContext,
        ws: &mut WriterState,
        lstate: &LockState,
        node: NodeId,
        attr: AttrChange,
        mutate: &(impl Fn(&mut DirEntry) -> bool + Send + Sync),
    ) -> Result<Option<NodeChange>, EngineError> {
        self.head_for_write(ctx, lstate).await?;
        let path = self.nodes.path_from_node(node).ok_or(EngineError::StaleNode)?;
        let parent_path = path.parent_path().ok_or_else(|| EngineError::Invariant(
            "cannot set attributes on the folder root".to_string(),
        ))?;
        let parent_node = self
            .nodes
            .get(parent_path.tail_ref())
            .ok_or(EngineError::StaleNode)?;
        let name = path.tail_name().to_string();

        let mut parent_block = self
            .dir_block_for_staging(ctx, lstate, &parent_path)
            .await?;
        let entry = parent_block
            .children
            .get_mut(&name)
            .ok_or_else(|| EngineError::NoSuchEntry { name: name.clone() })?;
        if !mutate(entry) {
            return Ok(None);
        }
        entry.ctime = self.services.clock.now_unix_nanos();
        let file_ptr = entry.pointer;

        {
            let mut stage = self.block_lock.write(lstate).await;
            stage.insert_block(parent_path.tail_ref(), Block::Dir(parent_block));
            stage.mark_dir_dirty(parent_path.tail_ref(), parent_node);
        }

        let op = FolderOp::set_attr(name.clone(), parent_path.tail_pointer(), file_ptr, attr);
        ws.ops.add(op, vec![parent_node, node]);
        self.signal_write();
        Ok(Some(NodeChange::dir(parent_node, vec![name])))
    }

    /// Permission-checked head access for staging paths.
    async fn head_for_write(
        &self,
        ctx: &OpContext,
        lstate: &LockState,
    ) -> Result<ImmutableMd, EngineError> {
        let head = {
            let hs = self.head_lock.read(lstate).await;
            hs.head.clone().ok_or(EngineError::NotInitialized)?
        };
        let session = self.services.keys.current_session(ctx).await?;
        if !head.handle().is_writer(&session.user) {
            return Err(EngineError::WriteAccess {
                user: session.user,
                folder: head.handle().canonical_name(),
            });
        }
        Ok(head)
    }

    /// A mutable copy of a directory block for staging: the dirty copy if
    /// one exists, the clean block otherwise.
    async fn dir_block_for_staging(
        &self,
        ctx: &OpContext,
        lstate: &LockState,
        path: &NodePath,
    ) -> Result<DirBlock, EngineError> {
        {
            let stage = self.block_lock.read(lstate).await;
            if let Some(block) = stage.block(path.tail_ref()) {
                return Ok(block.as_dir()?.clone());
            }
        }
        let block = self
            .fetch_block(ctx, path.tail_pointer())
            .await
            .map_err(|e| self.transform_read_error(e))?;
        Ok(block.as_dir()?.clone())
    }
}

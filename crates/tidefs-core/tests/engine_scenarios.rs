//! End-to-end scenarios for the folder-branch engine, on in-memory
//! servers. Multiple "devices" are separate engines sharing one metadata
//! and block server.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::time::timeout;

use tidefs_core::error::EngineError;
use tidefs_core::folder::{EngineConfig, FolderBranch, FolderBranchEngine, Services};
use tidefs_core::meta::{FolderHandle, FolderId, FolderOp, RevisionNumber, RootMetadata};
use tidefs_core::server::memory::{
    LocalKeyAuthority, MemoryBlockServer, MemoryMdServer, RecordingRekeyListener,
    RecordingResolver, StaticJournalStatus,
};
use tidefs_core::server::{MdServer, RekeyEvent, SystemClock};
use tidefs_core::sync::OpContext;
use tidefs_core::block::BlockPointer;

const WAIT: Duration = Duration::from_secs(5);

struct TestNet {
    md: Arc<MemoryMdServer>,
    blocks: Arc<MemoryBlockServer>,
    folder: FolderId,
}

struct Device {
    engine: Arc<FolderBranchEngine>,
    resolver: Arc<RecordingResolver>,
    rekey: Arc<RecordingRekeyListener>,
}

impl TestNet {
    fn new() -> Self {
        Self {
            md: Arc::new(MemoryMdServer::new()),
            blocks: Arc::new(MemoryBlockServer::new()),
            folder: FolderId::new_random(),
        }
    }

    fn device(&self, user: &str) -> Device {
        self.device_with_journal(user, None)
    }

    fn device_with_journal(
        &self,
        user: &str,
        journal: Option<Arc<StaticJournalStatus>>,
    ) -> Device {
        let resolver = Arc::new(RecordingResolver::new());
        let rekey = Arc::new(RecordingRekeyListener::new());
        let journal: Option<Arc<dyn tidefs_core::server::JournalStatus>> = match journal {
            Some(journal) => Some(journal),
            None => None,
        };
        let services = Services {
            md_server: self.md.clone(),
            block_server: self.blocks.clone(),
            resolver: resolver.clone(),
            keys: Arc::new(LocalKeyAuthority::new(user)),
            rekey: rekey.clone(),
            journal,
            clock: Arc::new(SystemClock),
        };
        let engine = FolderBranchEngine::new(
            FolderBranch::master(self.folder),
            services,
            test_config(),
        );
        Device {
            engine,
            resolver,
            rekey,
        }
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        // Long enough that the background flusher never races a test's
        // explicit syncs.
        flush_period: Duration::from_secs(5),
        background_task_timeout: Duration::from_secs(10),
        register_backoff_floor: Duration::from_millis(50),
        register_backoff_ceiling: Duration::from_secs(1),
        ..EngineConfig::default()
    }
}

fn shared_handle() -> FolderHandle {
    FolderHandle::private("alice,bob", &["alice", "bob"])
}

fn ctx() -> OpContext {
    OpContext::background()
}

/// Create, write, sync: one revision with a create op and
/// a sync op for the same file, child count 1, size 100.
#[tokio::test]
async fn test_basic_file_lifecycle() {
    let net = TestNet::new();
    let alice = net.device("alice");
    alice
        .engine
        .initialize_new_folder(&ctx(), shared_handle())
        .await
        .unwrap();

    let root = alice.engine.root_node(&ctx()).await.unwrap();
    let (file, _) = alice
        .engine
        .create_file(&ctx(), root, "foo", false, false)
        .await
        .unwrap();
    alice
        .engine
        .write(&ctx(), file, 0, &[7u8; 100])
        .await
        .unwrap();
    alice.engine.sync_all(&ctx()).await.unwrap();

    let head = net.md.head(net.folder).expect("head published");
    assert_eq!(head.revision(), RevisionNumber(2));

    let creates: Vec<_> = head
        .ops()
        .iter()
        .filter_map(|op| match op {
            FolderOp::Create { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(creates, ["foo"]);
    let sync_writes: Vec<_> = head
        .ops()
        .iter()
        .filter_map(|op| match op {
            FolderOp::Sync { writes, .. } => Some(writes.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(sync_writes.len(), 1, "exactly one sync op");
    assert_eq!(sync_writes[0][0].offset, 0);
    assert_eq!(sync_writes[0][0].len, 100);

    let children = alice.engine.get_dir_children(&ctx(), root).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children["foo"].size, 100);

    let entry = alice.engine.stat(&ctx(), file).await.unwrap();
    assert_eq!(entry.size, 100);

    let data = alice.engine.read(&ctx(), file, 0, 200).await.unwrap();
    assert_eq!(data, vec![7u8; 100]);
}

/// A second sync with no intervening writes makes zero
/// network calls and publishes nothing.
#[tokio::test]
async fn test_sync_all_is_idempotent() {
    let net = TestNet::new();
    let alice = net.device("alice");
    alice
        .engine
        .initialize_new_folder(&ctx(), shared_handle())
        .await
        .unwrap();
    let root = alice.engine.root_node(&ctx()).await.unwrap();
    let (file, _) = alice
        .engine
        .create_file(&ctx(), root, "foo", false, false)
        .await
        .unwrap();
    alice.engine.write(&ctx(), file, 0, b"data").await.unwrap();
    alice.engine.sync_all(&ctx()).await.unwrap();

    let md_puts = net.md.put_calls();
    let block_puts = net.blocks.put_calls();
    let block_gets = net.blocks.get_calls();

    alice.engine.sync_all(&ctx()).await.unwrap();

    assert_eq!(net.md.put_calls(), md_puts, "no metadata puts on a no-op sync");
    assert_eq!(net.blocks.put_calls(), block_puts, "no block puts on a no-op sync");
    assert_eq!(net.blocks.get_calls(), block_gets, "no block gets on a no-op sync");
    assert_eq!(net.md.head(net.folder).unwrap().revision(), RevisionNumber(2));
}

/// Two racing exclusive creates of one name produce
/// exactly one winner.
#[tokio::test]
async fn test_exclusive_create_race_has_one_winner() {
    let net = TestNet::new();
    let alice = net.device("alice");
    let bob = net.device("bob");
    alice
        .engine
        .initialize_new_folder(&ctx(), shared_handle())
        .await
        .unwrap();
    let alice_root = alice.engine.root_node(&ctx()).await.unwrap();
    let bob_root = bob.engine.root_node(&ctx()).await.unwrap();

    let (alice_result, bob_result) = tokio::join!(
        alice.engine.create_file(&ctx(), alice_root, "foo", false, true),
        bob.engine.create_file(&ctx(), bob_root, "foo", false, true),
    );

    let successes = [alice_result.is_ok(), bob_result.is_ok()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(successes, 1, "exactly one exclusive create may win");

    let loser = if alice_result.is_ok() {
        bob_result
    } else {
        alice_result
    };
    assert!(
        matches!(loser, Err(EngineError::NameExists { .. })),
        "loser sees an exclusivity failure, got {loser:?}"
    );

    // Neither device ended up on an unmerged branch.
    assert!(net.md.branch_ids(net.folder).is_empty());
}

/// A device syncing against a stale base lands on an
/// unmerged branch and triggers conflict resolution exactly once.
#[tokio::test]
async fn test_conflicting_write_goes_unmerged() {
    let net = TestNet::new();
    let alice = net.device("alice");
    let bob = net.device("bob");
    alice
        .engine
        .initialize_new_folder(&ctx(), shared_handle())
        .await
        .unwrap();
    let alice_root = alice.engine.root_node(&ctx()).await.unwrap();
    let bob_root = bob.engine.root_node(&ctx()).await.unwrap();

    // Keep bob from hearing about alice's revision.
    let _unpause = bob.engine.pause_updates();
    tokio::task::yield_now().await;

    alice
        .engine
        .create_file(&ctx(), alice_root, "from-alice", false, false)
        .await
        .unwrap();
    alice.engine.sync_all(&ctx()).await.unwrap();

    bob.engine
        .create_file(&ctx(), bob_root, "from-bob", false, false)
        .await
        .unwrap();
    bob.engine.sync_all(&ctx()).await.unwrap();

    let status = bob.engine.status(&ctx()).await;
    assert!(
        !status.unmerged_bid.is_null(),
        "bob must be on an unmerged branch"
    );
    assert_eq!(net.md.branch_ids(net.folder).len(), 1);

    let triggers = bob.resolver.triggers();
    assert_eq!(
        triggers.len(),
        1,
        "exactly one resolve trigger for the branch, got {triggers:?}"
    );
    // Alice saw no conflict.
    assert!(alice.resolver.triggers().is_empty());
}

/// Sync-from-server flushes dirty writes before applying
/// anything remote.
#[tokio::test]
async fn test_sync_from_server_flushes_dirty_state_first() {
    let net = TestNet::new();
    let alice = net.device("alice");
    alice
        .engine
        .initialize_new_folder(&ctx(), shared_handle())
        .await
        .unwrap();
    let root = alice.engine.root_node(&ctx()).await.unwrap();
    let (file, _) = alice
        .engine
        .create_file(&ctx(), root, "notes", false, false)
        .await
        .unwrap();
    alice.engine.sync_all(&ctx()).await.unwrap();

    alice
        .engine
        .write(&ctx(), file, 0, b"unsynced bytes")
        .await
        .unwrap();
    let before = alice.engine.status(&ctx()).await;
    assert_eq!(before.dirty_file_count, 1);

    alice.engine.sync_from_server(&ctx()).await.unwrap();

    let after = alice.engine.status(&ctx()).await;
    assert_eq!(after.dirty_file_count, 0, "dirty file must be flushed");

    // The flushed write is on the server: a fresh device sees it.
    let carol = net.device("bob");
    let carol_root = carol.engine.root_node(&ctx()).await.unwrap();
    let (carol_file, entry) = carol
        .engine
        .lookup(&ctx(), carol_root, "notes")
        .await
        .unwrap();
    assert_eq!(entry.size, b"unsynced bytes".len() as u64);
    let data = carol
        .engine
        .read(&ctx(), carol_file.unwrap(), 0, 64)
        .await
        .unwrap();
    assert_eq!(data, b"unsynced bytes");
}

/// Remote updates are refused while local writes are buffered.
#[tokio::test]
async fn test_updates_rejected_while_dirty() {
    let net = TestNet::new();
    let alice = net.device("alice");
    let bob = net.device("bob");
    alice
        .engine
        .initialize_new_folder(&ctx(), shared_handle())
        .await
        .unwrap();
    let alice_root = alice.engine.root_node(&ctx()).await.unwrap();
    let (file, _) = alice
        .engine
        .create_file(&ctx(), alice_root, "mine", false, false)
        .await
        .unwrap();
    alice.engine.sync_all(&ctx()).await.unwrap();

    let bob_root = bob.engine.root_node(&ctx()).await.unwrap();
    bob.engine
        .create_file(&ctx(), bob_root, "theirs", false, false)
        .await
        .unwrap();
    bob.engine.sync_all(&ctx()).await.unwrap();

    // Alice has a buffered write when bob's revision shows up.
    alice.engine.write(&ctx(), file, 0, b"dirty").await.unwrap();
    let pending = net
        .md
        .get_range(&ctx(), net.folder, RevisionNumber(3), None)
        .await
        .unwrap();
    assert!(!pending.is_empty());

    let err = alice.engine.apply_updates(&ctx(), &pending).await.unwrap_err();
    assert!(matches!(err, EngineError::NoUpdatesWhileDirty), "got {err:?}");
}

/// Unstaging a conflicted branch rejoins the mainline exactly: every
/// branch revision is undone and the head matches the server's.
#[tokio::test]
async fn test_unstage_rejoins_mainline() {
    let net = TestNet::new();
    let alice = net.device("alice");
    let bob = net.device("bob");
    alice
        .engine
        .initialize_new_folder(&ctx(), shared_handle())
        .await
        .unwrap();
    let alice_root = alice.engine.root_node(&ctx()).await.unwrap();
    let bob_root = bob.engine.root_node(&ctx()).await.unwrap();
    let _unpause = bob.engine.pause_updates();
    tokio::task::yield_now().await;

    alice
        .engine
        .create_file(&ctx(), alice_root, "kept", false, false)
        .await
        .unwrap();
    alice.engine.sync_all(&ctx()).await.unwrap();

    // Bob diverges with two revisions on his branch.
    bob.engine
        .create_file(&ctx(), bob_root, "doomed-1", false, false)
        .await
        .unwrap();
    bob.engine.sync_all(&ctx()).await.unwrap();
    bob.engine
        .create_file(&ctx(), bob_root, "doomed-2", false, false)
        .await
        .unwrap();
    bob.engine.sync_all(&ctx()).await.unwrap();
    assert!(!bob.engine.status(&ctx()).await.unmerged_bid.is_null());

    bob.engine.unstage_for_testing(&ctx()).await.unwrap();

    let status = bob.engine.status(&ctx()).await;
    assert!(status.unmerged_bid.is_null(), "bob is merged again");
    assert!(net.md.branch_ids(net.folder).is_empty(), "branch pruned");

    let server_head = net.md.head(net.folder).unwrap();
    let bob_head = bob.engine.get_head(true).await.unwrap();
    assert_eq!(bob_head.md_id(), server_head.md_id());

    // Only the mainline file survives.
    let bob_root = bob.engine.root_node(&ctx()).await.unwrap();
    let children = bob.engine.get_dir_children(&ctx(), bob_root).await.unwrap();
    assert_eq!(
        children.keys().cloned().collect::<Vec<_>>(),
        ["kept"],
        "branch files were undone"
    );
}

/// A long-behind device can jump straight to the server head, with every
/// cached node invalidated in one batch.
#[tokio::test]
async fn test_force_fast_forward_jumps_to_server_head() {
    let net = TestNet::new();
    let alice = net.device("alice");
    let bob = net.device("bob");
    alice
        .engine
        .initialize_new_folder(&ctx(), shared_handle())
        .await
        .unwrap();
    let alice_root = alice.engine.root_node(&ctx()).await.unwrap();
    let bob_root = bob.engine.root_node(&ctx()).await.unwrap();
    let _unpause = bob.engine.pause_updates();
    tokio::task::yield_now().await;

    for i in 0..3 {
        alice
            .engine
            .create_file(&ctx(), alice_root, &format!("file-{i}"), false, false)
            .await
            .unwrap();
        alice.engine.sync_all(&ctx()).await.unwrap();
    }

    let jumped = bob.engine.force_fast_forward(&ctx()).await.unwrap();
    assert!(jumped);

    let server_head = net.md.head(net.folder).unwrap();
    let bob_head = bob.engine.get_head(true).await.unwrap();
    assert_eq!(bob_head.md_id(), server_head.md_id());

    // The old node ids went stale in one batch.
    assert!(matches!(
        bob.engine.stat(&ctx(), bob_root).await,
        Err(EngineError::StaleNode)
    ));
    let fresh_root = bob.engine.root_node(&ctx()).await.unwrap();
    let children = bob
        .engine
        .get_dir_children(&ctx(), fresh_root)
        .await
        .unwrap();
    assert_eq!(children.len(), 3);
}

/// The update-registration loop delivers another device's revisions
/// without any explicit polling.
#[tokio::test]
async fn test_remote_updates_flow_between_devices() {
    let net = TestNet::new();
    let alice = net.device("alice");
    let bob = net.device("bob");
    alice
        .engine
        .initialize_new_folder(&ctx(), shared_handle())
        .await
        .unwrap();
    let alice_root = alice.engine.root_node(&ctx()).await.unwrap();
    let bob_root = bob.engine.root_node(&ctx()).await.unwrap();

    let mut watch = bob.engine.latest_merged_watch();

    alice
        .engine
        .create_file(&ctx(), alice_root, "shared", false, false)
        .await
        .unwrap();
    alice.engine.sync_all(&ctx()).await.unwrap();

    timeout(WAIT, async {
        loop {
            if *watch.borrow_and_update() >= Some(RevisionNumber(2)) {
                break;
            }
            watch.changed().await.unwrap();
        }
    })
    .await
    .expect("bob never heard about revision 2");

    // Give the apply a moment to finish notifying.
    timeout(WAIT, async {
        loop {
            let children = bob
                .engine
                .get_dir_children(&ctx(), bob_root)
                .await
                .unwrap();
            if children.contains_key("shared") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bob never saw the new file");

    // Applying the revision signalled the rekey state machine.
    let events = bob.rekey.events();
    assert!(
        events.contains(&RekeyEvent::NotNeeded { folder: net.folder }),
        "got {events:?}"
    );
}

/// Rename and remove round-trip through a sync.
#[tokio::test]
async fn test_rename_and_remove_lifecycle() {
    let net = TestNet::new();
    let alice = net.device("alice");
    alice
        .engine
        .initialize_new_folder(&ctx(), shared_handle())
        .await
        .unwrap();
    let root = alice.engine.root_node(&ctx()).await.unwrap();

    let (dir, _) = alice.engine.create_dir(&ctx(), root, "docs").await.unwrap();
    let (file, _) = alice
        .engine
        .create_file(&ctx(), dir, "draft.txt", false, false)
        .await
        .unwrap();
    alice
        .engine
        .write(&ctx(), file, 0, b"current")
        .await
        .unwrap();
    alice.engine.sync_all(&ctx()).await.unwrap();

    alice
        .engine
        .rename(&ctx(), dir, "draft.txt", root, "final.txt")
        .await
        .unwrap();
    alice.engine.sync_all(&ctx()).await.unwrap();

    let root_children = alice.engine.get_dir_children(&ctx(), root).await.unwrap();
    assert!(root_children.contains_key("final.txt"));
    let dir_children = alice.engine.get_dir_children(&ctx(), dir).await.unwrap();
    assert!(dir_children.is_empty());

    // Contents follow the rename.
    let data = alice.engine.read(&ctx(), file, 0, 16).await.unwrap();
    assert_eq!(data, b"current");

    alice
        .engine
        .remove_entry(&ctx(), root, "final.txt")
        .await
        .unwrap();
    alice.engine.remove_dir(&ctx(), root, "docs").await.unwrap();
    alice.engine.sync_all(&ctx()).await.unwrap();

    let root_children = alice.engine.get_dir_children(&ctx(), root).await.unwrap();
    assert!(root_children.is_empty());
}

/// After shutdown every operation fails fast and a second shutdown is a
/// no-op.
#[tokio::test]
async fn test_shutdown_stops_operations() {
    let net = TestNet::new();
    let alice = net.device("alice");
    alice
        .engine
        .initialize_new_folder(&ctx(), shared_handle())
        .await
        .unwrap();
    let root = alice.engine.root_node(&ctx()).await.unwrap();

    alice.engine.shutdown(&ctx()).await.unwrap();
    assert!(matches!(
        alice.engine.create_file(&ctx(), root, "late", false, false).await,
        Err(EngineError::Shutdown)
    ));
    alice.engine.shutdown(&ctx()).await.unwrap();
}

/// A reader who is not a writer cannot publish.
#[tokio::test]
async fn test_non_writer_cannot_mutate() {
    let net = TestNet::new();
    let alice = net.device("alice");
    let mut handle = FolderHandle::private("alice#rita", &["alice"]);
    handle.readers.insert("rita".to_string());
    alice
        .engine
        .initialize_new_folder(&ctx(), handle)
        .await
        .unwrap();

    let rita = net.device("rita");
    let rita_root = rita.engine.root_node(&ctx()).await.unwrap();
    let err = rita
        .engine
        .create_file(&ctx(), rita_root, "nope", false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WriteAccess { .. }), "got {err:?}");
}

/// While a local journal still holds revisions, fetched updates only
/// advance the merged watermark; the head waits for the journal to
/// flush and conflict resolution to reconcile.
#[tokio::test]
async fn test_journal_gating_defers_fetched_updates() {
    let net = TestNet::new();
    let journal = Arc::new(StaticJournalStatus::new());
    journal.set_predecessor(Some(RevisionNumber(1)));
    let alice = net.device_with_journal("alice", Some(journal.clone()));
    alice
        .engine
        .initialize_new_folder(&ctx(), shared_handle())
        .await
        .unwrap();
    assert_eq!(
        alice.engine.latest_merged_revision().await,
        Some(RevisionNumber(1)),
        "watermark bootstraps from the journal's flushed predecessor"
    );

    // The journal now claims unflushed local revisions.
    journal.set_revisions(Some((RevisionNumber(1), RevisionNumber(1))));

    // Another device advances the mainline.
    let bob = net.device("bob");
    let bob_root = bob.engine.root_node(&ctx()).await.unwrap();
    bob.engine
        .create_file(&ctx(), bob_root, "remote", false, false)
        .await
        .unwrap();
    bob.engine.sync_all(&ctx()).await.unwrap();

    let pending = net
        .md
        .get_range(&ctx(), net.folder, RevisionNumber(2), None)
        .await
        .unwrap();
    alice.engine.apply_updates(&ctx(), &pending).await.unwrap();

    // Only the watermark moved; the head did not.
    let head = alice.engine.get_head(true).await.unwrap();
    assert_eq!(head.revision(), RevisionNumber(1));
    assert_eq!(
        alice.engine.latest_merged_revision().await,
        Some(RevisionNumber(2))
    );
}

#[derive(Default)]
struct RecordingObserver {
    batches: std::sync::Mutex<Vec<(usize, usize)>>,
    readable: std::sync::atomic::AtomicU64,
}

impl tidefs_core::server::Observer for RecordingObserver {
    fn batch_changes(
        &self,
        changes: &[tidefs_core::server::NodeChange],
        affected: &[tidefs_core::node::NodeId],
    ) {
        self.batches
            .lock()
            .unwrap()
            .push((changes.len(), affected.len()));
    }

    fn handle_change(&self, _new_handle: &FolderHandle) {}

    fn became_readable(&self, _handle: &FolderHandle) {
        self.readable
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Observers hear about local mutations and the folder becoming
/// readable.
#[tokio::test]
async fn test_observers_receive_batched_changes() {
    let net = TestNet::new();
    let alice = net.device("alice");
    let observer = Arc::new(RecordingObserver::default());
    alice.engine.register_observer(observer.clone());

    alice
        .engine
        .initialize_new_folder(&ctx(), shared_handle())
        .await
        .unwrap();
    assert_eq!(
        observer.readable.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "readable notification fires exactly once on the first head"
    );

    let root = alice.engine.root_node(&ctx()).await.unwrap();
    alice
        .engine
        .create_file(&ctx(), root, "watched", false, false)
        .await
        .unwrap();
    assert!(
        !observer.batches.lock().unwrap().is_empty(),
        "staging a create notifies observers"
    );

    alice.engine.sync_all(&ctx()).await.unwrap();
    let batches = observer.batches.lock().unwrap().clone();
    assert!(
        batches.iter().any(|(_, affected)| *affected > 0),
        "publishing notifies with affected node ids, got {batches:?}"
    );
}

fn base_md() -> tidefs_core::meta::ImmutableMd {
    let md = RootMetadata::make_initial(
        FolderId::new_random(),
        FolderHandle::private("alice", &["alice"]),
        BlockPointer::temporary(),
        "alice",
    );
    tidefs_core::meta::ImmutableMd::make(md, true, 0).unwrap()
}

proptest! {
    /// A non-rebase successor is accepted only with an
    /// exact predecessor pointer and the very next revision number.
    #[test]
    fn prop_successor_requires_exact_predecessor(
        revision_jump in 0u64..4,
        corrupt_prev in any::<bool>(),
    ) {
        let head = base_md();
        let mut succ = head.successor("alice");
        succ.revision = RevisionNumber(succ.revision.0 + revision_jump);
        if corrupt_prev {
            succ.prev_root = Some(base_md().md_id());
        }

        let valid = revision_jump == 0 && !corrupt_prev;
        prop_assert_eq!(head.check_valid_successor(&succ).is_ok(), valid);
    }
}

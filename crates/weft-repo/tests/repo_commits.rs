//! Repository-level flows: commit chains, event validation, and CAR
//! export/import across storage backends.

use std::collections::BTreeMap;
use std::sync::Arc;

use ipld_core::ipld::Ipld;
use smol_str::SmolStr;
use weft_common::Did;
use weft_repo::commit::{Commit, SigningKey};
use weft_repo::event::CommitEvent;
use weft_repo::repo::{RecordWrite, Repository};
use weft_repo::storage::{BlockStore, FileBlockStore, MemoryBlockStore};

fn signing_key() -> k256::ecdsa::SigningKey {
    k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng)
}

fn record(text: &str) -> Ipld {
    let mut map = BTreeMap::new();
    map.insert(
        "$type".to_string(),
        Ipld::String("app.bsky.feed.post".into()),
    );
    map.insert("text".to_string(), Ipld::String(text.into()));
    Ipld::Map(map)
}

fn create(key: &str, text: &str) -> RecordWrite {
    RecordWrite::Create {
        key: SmolStr::new(key),
        record: record(text),
    }
}

#[tokio::test]
async fn commit_chain_is_strictly_ordered() {
    let storage = Arc::new(MemoryBlockStore::new());
    let key = signing_key();
    let mut repo = Repository::initialize(storage.clone(), Did::raw("did:plc:chain"), &key)
        .await
        .unwrap();

    let mut heads = vec![*repo.head_cid()];
    let mut revs = vec![repo.rev().clone()];

    for i in 0..10 {
        repo.apply_writes(&[create(&format!("coll/c{}", i), "post")], None, &key)
            .await
            .unwrap();
        heads.push(*repo.head_cid());
        revs.push(repo.rev().clone());
    }

    // Walk the chain backwards through storage
    for i in (1..heads.len()).rev() {
        let bytes = storage.get(&heads[i]).await.unwrap().unwrap();
        let commit = Commit::from_cbor(&bytes).unwrap();
        assert_eq!(commit.prev(), Some(&heads[i - 1]));
        assert_eq!(commit.rev(), &revs[i]);
        commit.verify(&key.public_key()).unwrap();
    }

    for pair in revs.windows(2) {
        assert!(pair[1].newer_than(&pair[0]));
    }
}

#[tokio::test]
async fn event_validates_against_previous_state() {
    let storage = Arc::new(MemoryBlockStore::new());
    let key = signing_key();
    let mut repo = Repository::initialize(storage.clone(), Did::raw("did:plc:events"), &key)
        .await
        .unwrap();

    // Seed some state
    repo.apply_writes(
        &[create("coll/seed1", "one"), create("coll/seed2", "two")],
        None,
        &key,
    )
    .await
    .unwrap();
    let prev_root = *repo.root();

    // A mixed batch, described as an event
    let (ops, commit_data) = repo
        .apply_writes(
            &[
                create("coll/fresh", "three"),
                RecordWrite::Update {
                    key: SmolStr::new("coll/seed1"),
                    record: record("one, revised"),
                    swap: None,
                },
                RecordWrite::Delete {
                    key: SmolStr::new("coll/seed2"),
                    swap: None,
                },
            ],
            None,
            &key,
        )
        .await
        .unwrap();

    let event = CommitEvent::from_commit_data(
        Did::raw("did:plc:events"),
        1,
        ops,
        &commit_data,
    )
    .await
    .unwrap();

    // A consumer holding the previous root and base blocks can replay it
    let new_root = event
        .validate(Some(prev_root), storage.clone(), &key.public_key())
        .await
        .unwrap();
    assert_eq!(new_root, *repo.root());
}

#[tokio::test]
async fn event_rejects_wrong_signer() {
    let storage = Arc::new(MemoryBlockStore::new());
    let key = signing_key();
    let mut repo = Repository::initialize(storage.clone(), Did::raw("did:plc:events"), &key)
        .await
        .unwrap();

    let prev_root = *repo.root();
    let (ops, commit_data) = repo
        .apply_writes(&[create("coll/a", "hello")], None, &key)
        .await
        .unwrap();

    let event = CommitEvent::from_commit_data(Did::raw("did:plc:events"), 1, ops, &commit_data)
        .await
        .unwrap();

    let other_key = signing_key();
    let err = event
        .validate(Some(prev_root), storage, &other_key.public_key())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), &weft_repo::RepoErrorKind::Signature);
}

#[tokio::test]
async fn event_rejects_did_mismatch() {
    let storage = Arc::new(MemoryBlockStore::new());
    let key = signing_key();
    let mut repo = Repository::initialize(storage.clone(), Did::raw("did:plc:genuine"), &key)
        .await
        .unwrap();

    let prev_root = *repo.root();
    let (ops, commit_data) = repo
        .apply_writes(&[create("coll/a", "hello")], None, &key)
        .await
        .unwrap();

    // Event claims a different repository than the signed commit
    let event = CommitEvent::from_commit_data(Did::raw("did:plc:impostor"), 1, ops, &commit_data)
        .await
        .unwrap();

    assert!(
        event
            .validate(Some(prev_root), storage, &key.public_key())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn event_bundle_blocks_are_hash_checked() {
    let storage = Arc::new(MemoryBlockStore::new());
    let key = signing_key();
    let mut repo = Repository::initialize(storage.clone(), Did::raw("did:plc:events"), &key)
        .await
        .unwrap();

    let prev_root = *repo.root();
    let (ops, commit_data) = repo
        .apply_writes(&[create("coll/a", "hello")], None, &key)
        .await
        .unwrap();

    let mut event = CommitEvent::from_commit_data(Did::raw("did:plc:events"), 1, ops, &commit_data)
        .await
        .unwrap();

    // Flip a byte somewhere in the block payload region
    let mut tampered = event.blocks.to_vec();
    let last = tampered.len() - 1;
    tampered[last] ^= 0xFF;
    event.blocks = tampered.into();

    let err = event
        .validate(Some(prev_root), storage, &key.public_key())
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        weft_repo::RepoErrorKind::CorruptBlock | weft_repo::RepoErrorKind::Car
    ));
}

#[tokio::test]
async fn car_export_reimports_to_same_repo() {
    let storage = Arc::new(MemoryBlockStore::new());
    let key = signing_key();
    let mut repo = Repository::initialize(storage, Did::raw("did:plc:carrier"), &key)
        .await
        .unwrap();

    let writes: Vec<_> = (0..25)
        .map(|i| create(&format!("coll/item{:02}", i), "payload"))
        .collect();
    repo.apply_writes(&writes, None, &key).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let car_path = dir.path().join("repo.car");
    repo.export_car(&car_path).await.unwrap();

    // Import into a completely fresh store
    let imported = FileBlockStore::load(&car_path).await.unwrap();
    assert_eq!(imported.roots(), vec![*repo.head_cid()]);

    let loaded = Repository::load(Arc::new(imported), repo.head_cid())
        .await
        .unwrap();

    assert_eq!(loaded.record_count(), 25);
    assert_eq!(loaded.did().as_str(), "did:plc:carrier");
    for i in 0..25 {
        let k = format!("coll/item{:02}", i);
        assert_eq!(loaded.get_record(&k), repo.get_record(&k));
    }
}

#[tokio::test]
async fn reloaded_repo_continues_the_chain() {
    let storage = Arc::new(MemoryBlockStore::new());
    let key = signing_key();
    let mut repo = Repository::initialize(storage.clone(), Did::raw("did:plc:resume"), &key)
        .await
        .unwrap();

    repo.apply_writes(&[create("coll/before", "x")], None, &key)
        .await
        .unwrap();
    let old_head = *repo.head_cid();
    let old_rev = repo.rev().clone();

    // Simulate a restart: reload from the durable head record
    let mut resumed = Repository::load(storage, &old_head).await.unwrap();
    assert_eq!(resumed.rev(), &old_rev);

    resumed
        .apply_writes(&[create("coll/after", "y")], None, &key)
        .await
        .unwrap();

    assert_eq!(resumed.head().prev(), Some(&old_head));
    assert!(resumed.rev().newer_than(&old_rev));
    assert!(resumed.has_record("coll/before"));
    assert!(resumed.has_record("coll/after"));
}

#[tokio::test]
async fn snapshot_unaffected_by_later_writes() {
    // A reader holding an old head observes exactly the state reachable
    // from it, regardless of later head advances
    let storage = Arc::new(MemoryBlockStore::new());
    let key = signing_key();
    let mut repo = Repository::initialize(storage.clone(), Did::raw("did:plc:snap"), &key)
        .await
        .unwrap();

    repo.apply_writes(&[create("coll/v1", "first")], None, &key)
        .await
        .unwrap();
    let snapshot_head = *repo.head_cid();

    repo.apply_writes(&[create("coll/v2", "second")], None, &key)
        .await
        .unwrap();

    let snapshot = Repository::load(storage, &snapshot_head).await.unwrap();
    assert!(snapshot.has_record("coll/v1"));
    assert!(
        !snapshot.has_record("coll/v2"),
        "snapshot must not see later writes"
    );
}

#[tokio::test]
async fn identical_contents_identical_roots_across_repos() {
    // Two repositories fed the same records in different batch shapes end
    // up with the same MST root (commits differ by rev and signature)
    let key1 = signing_key();
    let key2 = signing_key();

    let mut repo1 = Repository::initialize(
        Arc::new(MemoryBlockStore::new()),
        Did::raw("did:plc:alpha"),
        &key1,
    )
    .await
    .unwrap();
    let mut repo2 = Repository::initialize(
        Arc::new(MemoryBlockStore::new()),
        Did::raw("did:plc:beta"),
        &key2,
    )
    .await
    .unwrap();

    let all: Vec<_> = (0..20)
        .map(|i| (format!("coll/rec{:02}", i), format!("text {}", i)))
        .collect();

    // repo1: one batch, in order
    let writes: Vec<_> = all.iter().map(|(k, t)| create(k, t)).collect();
    repo1.apply_writes(&writes, None, &key1).await.unwrap();

    // repo2: several batches, reversed
    for chunk in all.iter().rev().collect::<Vec<_>>().chunks(7) {
        let writes: Vec<_> = chunk.iter().map(|(k, t)| create(k, t)).collect();
        repo2.apply_writes(&writes, None, &key2).await.unwrap();
    }

    assert_eq!(repo1.root(), repo2.root());
}

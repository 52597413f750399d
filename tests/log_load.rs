//! Snapshot round-trips, partial loads, pruning and re-absorption.

use std::sync::Arc;

use strand::{
    json_encoding, AppendOptions, BoxKeys, EncryptionConfig, Entry, Hash, JoinOptions, Keypair,
    Log, LogOptions, MemBlockStore, SnapshotError,
};

fn new_log(id: &[u8]) -> Log<String> {
    let mut rng = rand::thread_rng();
    Log::new(
        Keypair::generate(&mut rng),
        LogOptions {
            id: Some(bytes::Bytes::copy_from_slice(id)),
            ..LogOptions::default()
        },
    )
}

async fn append(log: &mut Log<String>, store: &MemBlockStore, data: &str) -> Arc<Entry<String>> {
    log.append(store, &data.to_string(), AppendOptions::default())
        .await
        .unwrap()
}

fn payloads(log: &Log<String>) -> Vec<String> {
    let encoding = json_encoding::<String>();
    log.values()
        .iter()
        .map(|e| e.payload_value(&encoding, None).unwrap())
        .collect()
}

#[tokio::test]
async fn test_snapshot_roundtrip() {
    let store = MemBlockStore::new();
    let mut log = new_log(b"roundtrip");
    for i in 0..8 {
        append(&mut log, &store, &format!("e{i}")).await;
    }

    let snapshot = log.to_multihash(&store).await.unwrap();
    let loaded: Log<String> = Log::from_multihash(
        &store,
        Keypair::generate(&mut rand::thread_rng()),
        snapshot,
        None,
        LogOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(loaded.id(), log.id());
    assert_eq!(loaded.len(), log.len());
    assert_eq!(loaded.head_hashes(), log.head_hashes());
    assert_eq!(payloads(&loaded), payloads(&log));
}

#[tokio::test]
async fn test_snapshot_missing_block() {
    let store = MemBlockStore::new();
    let absent = Hash::new(b"no such snapshot");
    let err = Log::<String>::from_multihash(
        &store,
        Keypair::generate(&mut rand::thread_rng()),
        absent,
        None,
        LogOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SnapshotError::Missing(h) if h == absent));
}

#[tokio::test]
async fn test_partial_load_has_exact_length_and_tails() {
    let store = MemBlockStore::new();
    let mut log = new_log(b"partial");
    let mut entries = Vec::new();
    for i in 0..12 {
        entries.push(append(&mut log, &store, &format!("p{i}")).await);
    }

    let loaded: Log<String> = Log::from_entry(
        &store,
        Keypair::generate(&mut rand::thread_rng()),
        &log.head_hashes(),
        Some(5),
        LogOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(loaded.len(), 5);
    let values = loaded.values();
    let expected: Vec<Hash> = entries[7..].iter().map(|e| e.hash()).collect();
    assert_eq!(
        values.iter().map(|e| e.hash()).collect::<Vec<_>>(),
        expected
    );

    // the boundary of the partial load is its only tail
    let tails = loaded.tails();
    assert_eq!(tails.len(), 1);
    assert_eq!(tails[0].hash(), entries[7].hash());
    assert_eq!(loaded.tail_hashes(), vec![entries[6].hash()]);
}

#[tokio::test]
async fn test_partial_load_longer_than_history() {
    let store = MemBlockStore::new();
    let mut log = new_log(b"short");
    for i in 0..3 {
        append(&mut log, &store, &format!("s{i}")).await;
    }
    let loaded: Log<String> = Log::from_entry(
        &store,
        Keypair::generate(&mut rand::thread_rng()),
        &log.head_hashes(),
        Some(50),
        LogOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(loaded.len(), 3);
    // a fully loaded log's tails are its roots
    assert_eq!(loaded.tails().len(), 1);
    assert!(loaded.tail_hashes().is_empty());
}

#[tokio::test]
async fn test_partial_load_of_forked_history() {
    let store = MemBlockStore::new();
    let mut log1 = new_log(b"fork");
    let mut log2 = new_log(b"fork");
    for i in 0..5 {
        append(&mut log1, &store, &format!("a{i}")).await;
    }
    for i in 0..5 {
        append(&mut log2, &store, &format!("b{i}")).await;
    }
    log1.join(&log2, JoinOptions::default()).unwrap();

    let loaded: Log<String> = Log::from_entry(
        &store,
        Keypair::generate(&mut rand::thread_rng()),
        &log1.head_hashes(),
        Some(6),
        LogOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(loaded.len(), 6);
    // exactly the 6 newest entries of the full log
    let full = log1.values();
    let expected: Vec<Hash> = full[full.len() - 6..].iter().map(|e| e.hash()).collect();
    assert_eq!(
        loaded.values().iter().map(|e| e.hash()).collect::<Vec<_>>(),
        expected
    );
}

#[tokio::test]
async fn test_stale_peer_restores_pruned_history() {
    let store = MemBlockStore::new();
    let mut log1 = new_log(b"restore");
    let mut stale = new_log(b"restore");

    for i in 0..4 {
        append(&mut log1, &store, &format!("old{i}")).await;
    }
    // the stale peer saw history up to here and never caught up
    stale.join(&log1, JoinOptions::default()).unwrap();
    for i in 0..2 {
        append(&mut log1, &store, &format!("new{i}")).await;
    }

    // drop everything but the two newest entries
    log1.prune(2);
    assert_eq!(log1.len(), 2);
    assert_eq!(log1.tail_hashes().len(), 1);

    // joining the stale peer re-absorbs the discarded entries
    let outcome = log1.join(&stale, JoinOptions::default()).unwrap();
    assert_eq!(outcome.merged, 4);
    assert_eq!(log1.len(), 6);
    assert_eq!(
        payloads(&log1),
        vec!["old0", "old1", "old2", "old3", "new0", "new1"]
    );
    // the stale head is shadowed by the retained newer entries
    assert_eq!(log1.heads().len(), 1);
}

#[tokio::test]
async fn test_join_after_prune_keeps_working() {
    let store = MemBlockStore::new();
    let mut log1 = new_log(b"after");
    let mut log2 = new_log(b"after");
    for i in 0..6 {
        append(&mut log1, &store, &format!("x{i}")).await;
    }
    log2.join(&log1, JoinOptions::default()).unwrap();
    log1.prune(2);

    let extended = append(&mut log2, &store, "extension").await;
    log1.join(&log2, JoinOptions::default()).unwrap();
    assert_eq!(log1.head_hashes(), vec![extended.hash()]);
    assert!(log1.contains(&extended.hash()));
}

#[tokio::test]
async fn test_join_with_size_bound_prunes() {
    let store = MemBlockStore::new();
    let mut log1 = new_log(b"size");
    let mut log2 = new_log(b"size");
    for i in 0..5 {
        append(&mut log1, &store, &format!("m{i}")).await;
    }
    for i in 0..5 {
        append(&mut log2, &store, &format!("n{i}")).await;
    }
    log1.join(
        &log2,
        JoinOptions {
            verify_signatures: false,
            size: Some(4),
        },
    )
    .unwrap();
    assert_eq!(log1.len(), 4);
}

#[tokio::test]
async fn test_encrypted_payload_replication() {
    let store = MemBlockStore::new();
    let mut rng = rand::thread_rng();
    let alice = Keypair::generate(&mut rng);
    let bob = Keypair::generate(&mut rng);

    let mut alice_log: Log<String> = Log::new(
        alice.clone(),
        LogOptions {
            id: Some(bytes::Bytes::from_static(b"sealed")),
            encryption: EncryptionConfig {
                encrypter: Some(Arc::new(BoxKeys::new(&alice))),
                decrypter: Some(Arc::new(BoxKeys::new(&alice))),
                payload_recipients: vec![alice.public(), bob.public()],
                ..EncryptionConfig::default()
            },
            ..LogOptions::default()
        },
    );
    let mut bob_log: Log<String> = Log::new(
        bob.clone(),
        LogOptions {
            id: Some(bytes::Bytes::from_static(b"sealed")),
            encryption: EncryptionConfig {
                decrypter: Some(Arc::new(BoxKeys::new(&bob))),
                ..EncryptionConfig::default()
            },
            ..LogOptions::default()
        },
    );

    let entry = alice_log
        .append(&store, &"for bobs eyes".to_string(), AppendOptions::default())
        .await
        .unwrap();
    assert!(entry.payload().is_sealed());

    // signatures verify without decrypting the payload
    bob_log
        .join(
            &alice_log,
            JoinOptions {
                verify_signatures: true,
                size: None,
            },
        )
        .unwrap();
    assert_eq!(bob_log.len(), 1);

    let received = bob_log.get(&entry.hash()).unwrap();
    let bob_keys = BoxKeys::new(&bob);
    let encoding = json_encoding::<String>();
    assert_eq!(
        received
            .payload_value(&encoding, Some(&bob_keys))
            .unwrap(),
        "for bobs eyes"
    );
}

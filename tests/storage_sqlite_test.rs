// tests/storage_sqlite_test.rs
// Exercises the sqlite-backed `StorageBackend` through a real on-disk
// database (via a tempdir, not the crate's own `:memory:` test helper,
// which is `#[cfg(test)]`-gated to the crate itself and invisible here).

use chat_core::model::{Message, MessageKind, ParticipantKind, Sender};
use chat_core::storage::{ConversationRecord, StorageBackend, StorageError};
use chat_core::storage::sqlite::SqliteStorage;

async fn storage_in(dir: &tempfile::TempDir) -> SqliteStorage {
    let path = dir.path().join("chat.db");
    let url = format!("sqlite://{}", path.display());
    SqliteStorage::connect(&url).await.expect("sqlite storage connects and migrates")
}

fn sender(id: &str) -> Sender {
    Sender { id: id.to_string(), display_name: id.to_string(), kind: ParticipantKind::Human }
}

/// P1 — sequence allocation is atomic and gap-free under concurrent callers.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequence_allocation_is_atomic_and_gap_free() {
    let dir = tempfile::tempdir().unwrap();
    let storage = std::sync::Arc::new(storage_in(&dir).await);
    storage.create_conversation(ConversationRecord::new("c1")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..30 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move { storage.next_sequence_id("c1").await.unwrap() }));
    }
    let mut ids: Vec<u64> = futures::future::join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=30).collect::<Vec<_>>());
}

/// P3/M3 — storing the same `message_id` twice is a no-op; the row, and
/// its originally allocated `sequence_id`, are unaffected by the retry.
#[tokio::test]
async fn duplicate_message_id_store_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_in(&dir).await;
    storage.create_conversation(ConversationRecord::new("c1")).await.unwrap();

    let mut m = Message::draft("m1", "c1", sender("alice"), "hello".into(), MessageKind::Text).unwrap();
    m.sequence_id = storage.next_sequence_id("c1").await.unwrap();
    storage.store_message(&m).await.unwrap();

    assert!(storage.has_message("c1", "m1").await.unwrap());
    storage.store_message(&m).await.unwrap();

    let all = storage.get_conversation_messages("c1", None, None).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].sequence_id, m.sequence_id);
}

/// P8 — messages come back ordered by `sequence_id` ascending regardless
/// of insertion order, and `after_seq` filters out everything at or below
/// the cursor.
#[tokio::test]
async fn history_is_ordered_and_after_seq_filters_correctly() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_in(&dir).await;
    storage.create_conversation(ConversationRecord::new("c1")).await.unwrap();

    for i in 0..5u64 {
        let mut m = Message::draft(format!("m{i}"), "c1", sender("alice"), format!("msg {i}"), MessageKind::Text).unwrap();
        m.sequence_id = storage.next_sequence_id("c1").await.unwrap();
        storage.store_message(&m).await.unwrap();
    }

    let all = storage.get_conversation_messages("c1", None, None).await.unwrap();
    let seqs: Vec<u64> = all.iter().map(|m| m.sequence_id).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

    let tail = storage.get_conversation_messages("c1", None, Some(3)).await.unwrap();
    let tail_seqs: Vec<u64> = tail.iter().map(|m| m.sequence_id).collect();
    assert_eq!(tail_seqs, vec![4, 5]);
}

/// P9/P10 — participant membership round-trips through a full replace,
/// and `update_conversation` on an unknown id surfaces as `NotFound`
/// rather than silently succeeding.
#[tokio::test]
async fn participant_membership_round_trips_and_unknown_update_fails() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_in(&dir).await;
    storage.create_conversation(ConversationRecord::new("c1")).await.unwrap();

    let alice = chat_core::model::Participant::human("alice", "Alice");
    let bob = chat_core::model::Participant::human("bob", "Bob");
    storage.update_participants("c1", &[alice.clone(), bob.clone()]).await.unwrap();

    assert!(storage.is_participant("c1", "alice").await.unwrap());
    assert!(storage.is_participant("c1", "bob").await.unwrap());
    assert_eq!(storage.get_participant_count("c1").await.unwrap(), 2);

    storage.update_participants("c1", &[alice]).await.unwrap();
    assert!(!storage.is_participant("c1", "bob").await.unwrap());
    assert_eq!(storage.get_participant_count("c1").await.unwrap(), 1);

    let err = storage.update_conversation(ConversationRecord::new("ghost")).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

/// A conversation a participant never joined is absent from their list;
/// joining two conversations surfaces both, most-recently-updated first.
#[tokio::test]
async fn user_conversations_reflect_membership_and_recency() {
    let dir = tempfile::tempdir().unwrap();
    let storage = storage_in(&dir).await;
    storage.create_conversation(ConversationRecord::new("c1")).await.unwrap();
    storage.create_conversation(ConversationRecord::new("c2")).await.unwrap();

    let alice = chat_core::model::Participant::human("alice", "Alice");
    storage.update_participants("c1", &[alice.clone()]).await.unwrap();
    storage.update_participants("c2", &[alice]).await.unwrap();

    let mut m = Message::draft("m1", "c2", sender("alice"), "bump c2".into(), MessageKind::Text).unwrap();
    m.sequence_id = storage.next_sequence_id("c2").await.unwrap();
    storage.store_message(&m).await.unwrap();

    let conversations = storage.get_user_conversations("alice", 10, 0).await.unwrap();
    let ids: Vec<String> = conversations.iter().map(|c| c.conversation_id.clone()).collect();
    assert_eq!(ids.first(), Some(&"c2".to_string()));
    assert_eq!(ids.len(), 2);

    let none = storage.get_user_conversations("mallory", 10, 0).await.unwrap();
    assert!(none.is_empty());
}

//! Integration tests for the graph store: chats, messages, branches,
//! checkpoints, and the cascade/atomicity invariants around them.

use braid::{
    ChatPatch, ContextStore, ListChatsFilter, MetadataFilter, NewBranch, NewChat, NewMessage,
    StoreError,
};
use serde_json::json;

fn chat(id: &str, user_id: &str) -> NewChat {
    NewChat {
        id: id.to_string(),
        user_id: user_id.to_string(),
        title: None,
        metadata: None,
    }
}

fn message(id: &str, chat_id: &str, parent: Option<&str>, name: &str, text: &str) -> NewMessage {
    NewMessage {
        id: id.to_string(),
        chat_id: chat_id.to_string(),
        parent_id: parent.map(str::to_string),
        name: name.to_string(),
        kind: Some("message".to_string()),
        data: json!(text),
    }
}

#[tokio::test]
async fn create_chat_creates_main_branch() {
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();

    let branches = store.list_branches("c1").await.unwrap();
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].name, "main");
    assert!(branches[0].is_active);
    assert_eq!(branches[0].head_message_id, None);
}

#[tokio::test]
async fn create_chat_twice_conflicts() {
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();
    let err = store.create_chat(chat("c1", "bob")).await.unwrap_err();
    assert!(err.is_conflict(), "got: {err}");
}

#[tokio::test]
async fn upsert_chat_never_overwrites() {
    let store = ContextStore::open_in_memory().await.unwrap();
    let first = NewChat {
        id: "c1".to_string(),
        user_id: "alice".to_string(),
        title: Some("original".to_string()),
        metadata: Some(json!({"env": "prod"})),
    };
    let (created, was_created) = store.upsert_chat(first).await.unwrap();
    assert!(was_created);

    let second = NewChat {
        id: "c1".to_string(),
        user_id: "mallory".to_string(),
        title: Some("overwritten?".to_string()),
        metadata: Some(json!({"env": "dev"})),
    };
    let (existing, was_created) = store.upsert_chat(second).await.unwrap();
    assert!(!was_created);
    assert_eq!(existing, created, "conflict must return the row unchanged");

    // Still exactly one main branch.
    assert_eq!(store.list_branches("c1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn update_chat_patches_only_provided_fields() {
    let store = ContextStore::open_in_memory().await.unwrap();
    let original = NewChat {
        id: "c1".to_string(),
        user_id: "alice".to_string(),
        title: Some("before".to_string()),
        metadata: Some(json!({"k": 1})),
    };
    let created = store.create_chat(original).await.unwrap();

    let updated = store
        .update_chat(
            "c1",
            ChatPatch {
                title: Some("after".to_string()),
                metadata: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.title.as_deref(), Some("after"));
    assert_eq!(updated.metadata, Some(json!({"k": 1})));
    assert!(updated.updated_at > created.updated_at);

    let err = store.update_chat("missing", ChatPatch::default()).await;
    assert!(matches!(err, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn chain_walk_and_message_count() {
    // Scenario 1: linear chain, chronological walk, listChats counts.
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();
    store
        .add_message(message("m1", "c1", None, "user", "Hi"))
        .await
        .unwrap();
    store
        .add_message(message("m2", "c1", Some("m1"), "assistant", "Hello"))
        .await
        .unwrap();
    let main = store.get_active_branch("c1").await.unwrap().unwrap();
    store.update_branch_head(&main.id, Some("m2")).await.unwrap();

    let msgs = store.get_message_chain("m2").await.unwrap();
    assert_eq!(
        msgs.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        vec!["m1", "m2"],
        "chain must come back root-first"
    );

    // Active-branch convenience accessor agrees.
    let via_chat = store.get_messages("c1").await.unwrap();
    assert_eq!(via_chat.len(), 2);

    let listed = store
        .list_chats(ListChatsFilter {
            user_id: Some("alice".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].message_count, 2);
    assert_eq!(listed[0].branch_count, 1);
}

#[tokio::test]
async fn branching_keeps_chains_independent() {
    // Scenario 2: fork from m1, each branch sees its own chain.
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();
    store
        .add_message(message("m1", "c1", None, "user", "Hi"))
        .await
        .unwrap();
    store
        .add_message(message("m2", "c1", Some("m1"), "assistant", "Hello"))
        .await
        .unwrap();
    let main = store.get_active_branch("c1").await.unwrap().unwrap();
    store.update_branch_head(&main.id, Some("m2")).await.unwrap();

    let v2 = store
        .create_branch(NewBranch {
            id: None,
            chat_id: "c1".to_string(),
            name: "branch-v2".to_string(),
            head_message_id: Some("m1".to_string()),
            is_active: true,
        })
        .await
        .unwrap();
    store
        .add_message(message("m3", "c1", Some("m1"), "assistant", "Hey"))
        .await
        .unwrap();
    store.update_branch_head(&v2.id, Some("m3")).await.unwrap();

    let branches = store.list_branches("c1").await.unwrap();
    assert_eq!(branches.len(), 2);
    let main_info = branches.iter().find(|b| b.name == "main").unwrap();
    let v2_info = branches.iter().find(|b| b.name == "branch-v2").unwrap();
    assert_eq!(main_info.message_count, 2);
    assert_eq!(v2_info.message_count, 2);
    assert_eq!(
        branches.iter().filter(|b| b.is_active).count(),
        1,
        "exactly one active branch"
    );
    assert!(v2_info.is_active);

    let v2_chain = store.get_message_chain("m3").await.unwrap();
    assert_eq!(
        v2_chain.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        vec!["m1", "m3"]
    );

    assert!(store.has_children("m1").await.unwrap());
    assert!(!store.has_children("m2").await.unwrap());
}

#[tokio::test]
async fn checkpoint_restore_is_a_rewind() {
    // Scenario 3: restoring a checkpoint creates a new active branch at
    // the checkpointed message; prior branches survive.
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();
    store
        .add_message(message("m1", "c1", None, "user", "Hi"))
        .await
        .unwrap();
    store
        .add_message(message("m2", "c1", Some("m1"), "assistant", "Hello"))
        .await
        .unwrap();
    let main = store.get_active_branch("c1").await.unwrap().unwrap();
    store.update_branch_head(&main.id, Some("m2")).await.unwrap();

    store.create_checkpoint("c1", "cp1", "m1").await.unwrap();
    let restored = store.restore_checkpoint("c1", "cp1").await.unwrap();

    assert_eq!(restored.head_message_id.as_deref(), Some("m1"));
    assert!(restored.is_active);
    assert_eq!(restored.name, "main-v2");

    let branches = store.list_branches("c1").await.unwrap();
    assert_eq!(branches.len(), 2, "prior branch must remain");
    assert!(branches.iter().any(|b| b.name == "main" && !b.is_active));
}

#[tokio::test]
async fn checkpoint_upsert_overwrites_message_pointer() {
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();
    store
        .add_message(message("m1", "c1", None, "user", "one"))
        .await
        .unwrap();
    store
        .add_message(message("m2", "c1", Some("m1"), "user", "two"))
        .await
        .unwrap();

    let first = store.create_checkpoint("c1", "cp", "m1").await.unwrap();
    let second = store.create_checkpoint("c1", "cp", "m2").await.unwrap();
    assert_eq!(second.id, first.id, "conflict keeps the row id");
    assert_eq!(second.message_id, "m2");
    assert!(second.created_at > first.created_at);

    assert_eq!(store.list_checkpoints("c1").await.unwrap().len(), 1);
    assert!(store.delete_checkpoint("c1", "cp").await.unwrap());
    assert!(!store.delete_checkpoint("c1", "cp").await.unwrap());
}

#[tokio::test]
async fn set_active_branch_switches_atomically() {
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();
    let other = store
        .create_branch(NewBranch {
            id: None,
            chat_id: "c1".to_string(),
            name: "alt".to_string(),
            head_message_id: None,
            is_active: false,
        })
        .await
        .unwrap();

    let activated = store.set_active_branch("c1", &other.id).await.unwrap();
    assert!(activated.is_active);
    let by_name = store.get_branch("c1", "alt").await.unwrap().unwrap();
    assert_eq!(by_name.id, other.id);
    let branches = store.list_branches("c1").await.unwrap();
    assert_eq!(branches.iter().filter(|b| b.is_active).count(), 1);
    assert!(branches.iter().any(|b| b.name == "alt" && b.is_active));

    let err = store.set_active_branch("c1", "nope").await;
    assert!(matches!(err, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn message_upsert_preserves_chat_and_created_at() {
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();
    store.create_chat(chat("c2", "alice")).await.unwrap();

    let first = store
        .add_message(message("m1", "c1", None, "user", "original"))
        .await
        .unwrap();
    // Replay with a different chat id and payload: chat and created_at
    // must be preserved, the rest updated.
    let replayed = store
        .add_message(message("m1", "c2", None, "user", "replayed"))
        .await
        .unwrap();
    assert_eq!(replayed.chat_id, "c1");
    assert_eq!(replayed.created_at, first.created_at);
    assert_eq!(replayed.data, json!("replayed"));

    let fetched = store.get_message("m1").await.unwrap().unwrap();
    assert_eq!(fetched, replayed);
}

#[tokio::test]
async fn self_referential_parent_rejected() {
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();
    let err = store
        .add_message(message("m1", "c1", Some("m1"), "user", "loop"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn parent_cycle_does_not_hang_the_walk() {
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();
    store
        .add_message(message("m1", "c1", None, "user", "a"))
        .await
        .unwrap();
    store
        .add_message(message("m2", "c1", Some("m1"), "user", "b"))
        .await
        .unwrap();
    // Buggy caller re-parents m1 under m2, forming a 2-cycle.
    store
        .add_message(message("m1", "c1", Some("m2"), "user", "a"))
        .await
        .unwrap();

    let walked = store.get_message_chain("m2").await.unwrap();
    assert_eq!(walked.len(), 2, "cycle guard must stop the walk");
}

#[tokio::test]
async fn get_messages_unknown_chat_is_not_found() {
    let store = ContextStore::open_in_memory().await.unwrap();
    let err = store.get_messages("ghost").await;
    assert!(matches!(err, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn metadata_filter_matches_json_typed() {
    let store = ContextStore::open_in_memory().await.unwrap();
    for (id, metadata) in [
        ("c1", Some(json!({"env": "prod"}))),
        ("c2", Some(json!({"env": "dev"}))),
        ("c3", Some(json!({"count": 2}))),
        ("c4", Some(json!({"flag": true}))),
        ("c5", None),
    ] {
        store
            .create_chat(NewChat {
                id: id.to_string(),
                user_id: "alice".to_string(),
                title: None,
                metadata,
            })
            .await
            .unwrap();
    }

    let by_env = store
        .list_chats(ListChatsFilter {
            metadata: Some(MetadataFilter {
                key: "env".to_string(),
                value: json!("prod"),
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_env.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["c1"]);

    let by_count = store
        .list_chats(ListChatsFilter {
            metadata: Some(MetadataFilter {
                key: "count".to_string(),
                value: json!(2),
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_count.len(), 1);
    assert_eq!(by_count[0].id, "c3");

    let by_flag = store
        .list_chats(ListChatsFilter {
            metadata: Some(MetadataFilter {
                key: "flag".to_string(),
                value: json!(true),
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_flag.len(), 1);
    assert_eq!(by_flag[0].id, "c4");

    // A numeric 1 must not match the boolean true.
    let bool_vs_number = store
        .list_chats(ListChatsFilter {
            metadata: Some(MetadataFilter {
                key: "flag".to_string(),
                value: json!(1),
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(bool_vs_number.is_empty());
}

#[tokio::test]
async fn list_chats_orders_by_recent_activity() {
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();
    store.create_chat(chat("c2", "alice")).await.unwrap();
    store
        .update_chat(
            "c1",
            ChatPatch {
                title: Some("bumped".to_string()),
                metadata: None,
            },
        )
        .await
        .unwrap();

    let listed = store.list_chats(ListChatsFilter::default()).await.unwrap();
    assert_eq!(listed[0].id, "c1", "most recently updated first");

    let limited = store
        .list_chats(ListChatsFilter {
            limit: Some(1),
            offset: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, "c2");
}

#[tokio::test]
async fn delete_chat_cascades_atomically() {
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();
    store
        .add_message(message("m1", "c1", None, "user", "searchable needle"))
        .await
        .unwrap();
    store.create_checkpoint("c1", "cp", "m1").await.unwrap();

    // Owner-guarded delete with the wrong user is a no-op.
    assert!(!store.delete_chat("c1", Some("bob")).await.unwrap());
    assert!(store.get_chat("c1").await.unwrap().is_some());

    assert!(store.delete_chat("c1", Some("alice")).await.unwrap());
    assert!(store.get_chat("c1").await.unwrap().is_none());
    assert!(store.get_message("m1").await.unwrap().is_none());
    assert!(store.list_branches("c1").await.unwrap().is_empty());
    assert!(store.list_checkpoints("c1").await.unwrap().is_empty());
    let hits = store
        .search_messages("c1", "needle", Default::default())
        .await
        .unwrap();
    assert!(hits.is_empty(), "search entries must be cascaded away");

    // Second delete reports nothing was removed.
    assert!(!store.delete_chat("c1", None).await.unwrap());
}

#[tokio::test]
async fn unicode_round_trips() {
    let store = ContextStore::open_in_memory().await.unwrap();
    let created = store
        .create_chat(NewChat {
            id: "c1".to_string(),
            user_id: "ユーザー".to_string(),
            title: Some("Schrödinger 🐈".to_string()),
            metadata: Some(json!({"émoji": "✨"})),
        })
        .await
        .unwrap();
    let fetched = store.get_chat("c1").await.unwrap().unwrap();
    assert_eq!(fetched, created);

    store
        .add_message(message("m1", "c1", None, "user", "héllo wörld 👋"))
        .await
        .unwrap();
    let msg = store.get_message("m1").await.unwrap().unwrap();
    assert_eq!(msg.data, json!("héllo wörld 👋"));
}

#[tokio::test]
async fn graph_dump_truncates_previews() {
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();
    let long = "x".repeat(80);
    store
        .add_message(message("m1", "c1", None, "user", &long))
        .await
        .unwrap();
    store
        .add_message(message("m2", "c1", Some("m1"), "assistant", "short"))
        .await
        .unwrap();
    store.create_checkpoint("c1", "cp", "m1").await.unwrap();

    let graph = store.get_graph("c1").await.unwrap();
    assert_eq!(graph.chat_id, "c1");
    assert_eq!(graph.nodes.len(), 2);
    assert_eq!(graph.nodes[0].id, "m1", "nodes ordered by created_at");
    assert_eq!(graph.nodes[0].preview.chars().count(), 51);
    assert!(graph.nodes[0].preview.ends_with('…'));
    assert_eq!(graph.nodes[1].preview, "short");
    assert_eq!(graph.branches.len(), 1);
    assert_eq!(graph.checkpoints.len(), 1);
}

#[tokio::test]
async fn concurrent_writers_serialize() {
    let store = ContextStore::open_in_memory().await.unwrap();
    store.create_chat(chat("c1", "alice")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .add_message(message(&format!("m{i}"), "c1", None, "user", "hi"))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let listed = store.list_chats(ListChatsFilter::default()).await.unwrap();
    assert_eq!(listed[0].message_count, 10);
}

#[tokio::test]
async fn injected_pool_survives_store_close() {
    let owner = ContextStore::open_in_memory().await.unwrap();
    let pool = owner.pool().clone();

    let borrowed = ContextStore::with_pool(pool).await.unwrap();
    borrowed.create_chat(chat("c1", "alice")).await.unwrap();
    borrowed.close();

    // The pool belongs to `owner`; closing the borrowing store must not
    // tear it down.
    assert!(owner.get_chat("c1").await.unwrap().is_some());
}

mod common;

use std::sync::Arc;
use crossbeam::channel;
use nodestore::{Error, NodeKey, NodeState, SqliteStore, TransactorState, Value};
use common::{blog_schema, manager, open_store, seed_user};

fn text(s: &str) -> Option<Value> {
    Some(Value::Text(s.to_string()))
}

#[test]
fn test_rename_commits_one_new_version() {
    let store = open_store();
    seed_user(&store, "42", "Alice");

    let manager = manager(store.clone());
    let key = NodeKey::new("user", "42");
    let tx = manager.current_transactor();
    tx.begin().unwrap();
    let user = manager.get_node(&key).unwrap();
    assert_eq!(user.version(), 1);
    user.set("name", "Alicia").unwrap();
    assert_eq!(user.state(), NodeState::Dirty);
    assert!(tx.contains(&key));
    tx.commit().unwrap();

    assert_eq!(tx.state(), TransactorState::Idle);
    assert_eq!(user.state(), NodeState::Clean);
    assert_eq!(user.version(), 2);

    let fresh = common::manager(store);
    let reloaded = fresh.get_node(&key).unwrap();
    assert_eq!(reloaded.get("name"), text("Alicia"));
    assert_eq!(reloaded.version(), 2);
}

#[test]
fn test_abort_restores_committed_state() {
    let store = open_store();
    seed_user(&store, "1", "Ada");

    let manager = manager(store.clone());
    let key = NodeKey::new("user", "1");
    let tx = manager.current_transactor();
    tx.begin().unwrap();
    let user = manager.get_node(&key).unwrap();
    user.set("name", "Countess").unwrap();
    let draft = manager.create_node_with_id("user", "2").unwrap();
    draft.set("name", "Draft").unwrap();
    tx.abort().unwrap();

    assert_eq!(user.get("name"), text("Ada"));
    assert_eq!(user.state(), NodeState::Clean);
    assert_eq!(user.version(), 1);
    assert_eq!(draft.state(), NodeState::Transient);
    assert!(manager.cached(&NodeKey::new("user", "2")).is_none());
    assert_eq!(store.count_rows("users").unwrap(), 1);
}

#[test]
fn test_failed_commit_writes_nothing() {
    let store = open_store();
    seed_user(&store, "taken", "Existing");
    seed_user(&store, "1", "Ada");

    // this manager has never seen user/taken, so only the store can reject it
    let manager = manager(store.clone());
    let tx = manager.current_transactor();
    tx.begin().unwrap();
    let ada = manager.get_node(&NodeKey::new("user", "1")).unwrap();
    ada.set("name", "Lovelace").unwrap();
    let fresh = manager.create_node_with_id("user", "fresh").unwrap();
    fresh.set("name", "Fresh").unwrap();
    let clash = manager.create_node_with_id("user", "taken").unwrap();
    clash.set("name", "Clash").unwrap();

    let err = tx.commit().unwrap_err();
    assert!(matches!(err, Error::StorageIO(_)), "{err}");
    assert_eq!(tx.state(), TransactorState::Idle);

    assert_eq!(store.count_rows("users").unwrap(), 2);
    assert_eq!(ada.get("name"), text("Ada"));
    assert_eq!(ada.version(), 1);
    assert_eq!(ada.state(), NodeState::Clean);
    assert_eq!(fresh.state(), NodeState::Transient);
    assert_eq!(clash.state(), NodeState::Transient);

    let reader = common::manager(store);
    assert_eq!(reader.get_node(&NodeKey::new("user", "1")).unwrap().get("name"), text("Ada"));
    assert!(matches!(reader.get_node(&NodeKey::new("user", "fresh")), Err(Error::NotFound(_))));
}

#[test]
fn test_second_writer_loses_on_stale_version() {
    let store = open_store();
    seed_user(&store, "9", "Base");

    let manager = manager(store.clone());
    let key = NodeKey::new("user", "9");
    let (to_b, from_a) = channel::unbounded::<()>();
    let (to_a, from_b) = channel::unbounded::<()>();

    let (first, second) = std::thread::scope(|s| {
        let a = s.spawn(|| {
            let tx = manager.current_transactor();
            tx.begin().unwrap();
            manager.get_node(&key).unwrap().set("name", "A").unwrap();
            to_b.send(()).unwrap();
            from_b.recv().unwrap();
            let result = tx.commit();
            to_b.send(()).unwrap();
            result
        });
        let b = s.spawn(|| {
            let tx = manager.current_transactor();
            tx.begin().unwrap();
            from_a.recv().unwrap();
            // read at version 1, before A commits
            let user = manager.get_node(&key).unwrap();
            user.set("name", "B").unwrap();
            to_a.send(()).unwrap();
            from_a.recv().unwrap();
            tx.commit()
        });
        (a.join().unwrap(), b.join().unwrap())
    });

    first.unwrap();
    assert!(matches!(second, Err(Error::ConcurrentModification(_))));

    let user = manager.get_node(&key).unwrap();
    assert_eq!(user.version(), 2);
    assert_eq!(user.get("name"), text("A"));
    assert_eq!(user.state(), NodeState::Clean);

    let reader = common::manager(store);
    assert_eq!(reader.get_node(&key).unwrap().get("name"), text("A"));
}

#[test]
fn test_writers_of_different_properties_still_conflict() {
    let store = open_store();
    seed_user(&store, "11", "Base");

    let manager = manager(store.clone());
    let key = NodeKey::new("user", "11");
    let (to_b, from_a) = channel::unbounded::<()>();
    let (to_a, from_b) = channel::unbounded::<()>();

    let (first, second) = std::thread::scope(|s| {
        let a = s.spawn(|| {
            let tx = manager.current_transactor();
            tx.begin().unwrap();
            manager.get_node(&key).unwrap().set("name", "Renamed").unwrap();
            to_b.send(()).unwrap();
            from_b.recv().unwrap();
            let result = tx.commit();
            to_b.send(()).unwrap();
            result
        });
        let b = s.spawn(|| {
            let tx = manager.current_transactor();
            tx.begin().unwrap();
            from_a.recv().unwrap();
            manager.get_node(&key).unwrap().set("email", "b@example.com").unwrap();
            to_a.send(()).unwrap();
            from_a.recv().unwrap();
            tx.commit()
        });
        (a.join().unwrap(), b.join().unwrap())
    });

    first.unwrap();
    assert!(matches!(second, Err(Error::ConcurrentModification(_))));

    let user = manager.get_node(&key).unwrap();
    assert_eq!(user.get("name"), text("Renamed"));
    assert_eq!(user.get("email"), None);
    assert_eq!(user.version(), 2);
    assert_eq!(user.state(), NodeState::Clean);

    let reader = common::manager(store);
    let stored = reader.get_node(&key).unwrap();
    assert_eq!(stored.get("name"), text("Renamed"));
    assert_eq!(stored.get("email"), None);
}

#[test]
fn test_update_after_concurrent_delete_conflicts() {
    let store = open_store();
    seed_user(&store, "9", "Doomed");

    let manager = manager(store.clone());
    let key = NodeKey::new("user", "9");
    let (to_a, from_b) = channel::unbounded::<()>();
    let (to_b, from_a) = channel::unbounded::<()>();

    let (deleted, updated) = std::thread::scope(|s| {
        let b = s.spawn(|| {
            let tx = manager.current_transactor();
            tx.begin().unwrap();
            manager.get_node(&key).unwrap().set("name", "Survivor").unwrap();
            to_a.send(()).unwrap();
            from_a.recv().unwrap();
            tx.commit()
        });
        let a = s.spawn(|| {
            from_b.recv().unwrap();
            let tx = manager.current_transactor();
            let result = tx.run(|| manager.get_node(&key)?.delete());
            to_b.send(()).unwrap();
            result
        });
        (a.join().unwrap(), b.join().unwrap())
    });

    deleted.unwrap();
    assert!(matches!(updated, Err(Error::ConcurrentModification(_))));
    assert_eq!(store.count_rows("users").unwrap(), 0);
    assert!(matches!(manager.get_node(&key), Err(Error::NotFound(_))));
}

#[test]
fn test_abort_keeps_a_later_writer_value() {
    let store = open_store();
    seed_user(&store, "12", "Original");

    let manager = manager(store.clone());
    let key = NodeKey::new("user", "12");
    let (to_second, from_first) = channel::unbounded::<()>();
    let (to_first, from_second) = channel::unbounded::<()>();

    let committed = std::thread::scope(|s| {
        s.spawn(|| {
            let tx = manager.current_transactor();
            tx.begin().unwrap();
            manager.get_node(&key).unwrap().set("name", "First").unwrap();
            to_second.send(()).unwrap();
            from_second.recv().unwrap();
            tx.abort().unwrap();
            assert_eq!(manager.get_node(&key).unwrap().get("name"), text("Second"));
            to_second.send(()).unwrap();
        });
        let second = s.spawn(|| {
            let tx = manager.current_transactor();
            tx.begin().unwrap();
            from_first.recv().unwrap();
            manager.get_node(&key).unwrap().set("name", "Second").unwrap();
            to_first.send(()).unwrap();
            from_first.recv().unwrap();
            tx.commit()
        });
        second.join().unwrap()
    });

    committed.unwrap();
    let user = manager.get_node(&key).unwrap();
    assert_eq!(user.get("name"), text("Second"));
    assert_eq!(user.state(), NodeState::Clean);
    assert_eq!(common::manager(store).get_node(&key).unwrap().get("name"), text("Second"));
}

#[test]
fn test_in_memory_nodes_conflict_without_a_store() {
    let manager = manager(open_store());
    let key = manager
        .current_transactor()
        .run(|| {
            let session = manager.create_node("session")?;
            session.set("token", "start")?;
            Ok(session.key().clone())
        })
        .unwrap();

    let (to_b, from_a) = channel::unbounded::<()>();
    let (to_a, from_b) = channel::unbounded::<()>();
    let (first, second) = std::thread::scope(|s| {
        let a = s.spawn(|| {
            let tx = manager.current_transactor();
            tx.begin().unwrap();
            manager.get_node(&key).unwrap().set("token", "a").unwrap();
            to_b.send(()).unwrap();
            from_b.recv().unwrap();
            let result = tx.commit();
            to_b.send(()).unwrap();
            result
        });
        let b = s.spawn(|| {
            let tx = manager.current_transactor();
            tx.begin().unwrap();
            from_a.recv().unwrap();
            manager.get_node(&key).unwrap().set("user", "b").unwrap();
            to_a.send(()).unwrap();
            from_a.recv().unwrap();
            tx.commit()
        });
        (a.join().unwrap(), b.join().unwrap())
    });

    first.unwrap();
    assert!(matches!(second, Err(Error::ConcurrentModification(_))));
    let session = manager.get_node(&key).unwrap();
    assert_eq!(session.version(), 2);
    assert_eq!(session.get("token"), text("a"));
    assert_eq!(session.get("user"), None);
}

#[test]
fn test_stale_cache_is_rejected_by_the_store() {
    let store = open_store();
    seed_user(&store, "5", "Old");

    let stale = manager(store.clone());
    let key = NodeKey::new("user", "5");
    stale.get_node(&key).unwrap();

    // another process moves the row to version 2
    let other = manager(store.clone());
    other
        .current_transactor()
        .run(|| other.get_node(&key)?.set("name", "Newer"))
        .unwrap();

    let tx = stale.current_transactor();
    let err = tx
        .run(|| stale.get_node(&key)?.set("name", "Stale"))
        .unwrap_err();
    assert!(matches!(err, Error::ConcurrentModification(_)));
    assert_eq!(stale.get_node(&key).unwrap().get("name"), text("Old"));

    assert!(stale.evict(&key).unwrap());
    assert_eq!(stale.get_node(&key).unwrap().get("name"), text("Newer"));
}

#[test]
fn test_mutation_outside_a_transaction_is_rejected() {
    let store = open_store();
    seed_user(&store, "3", "Idle");

    let manager = manager(store);
    let user = manager.get_node(&NodeKey::new("user", "3")).unwrap();
    assert!(matches!(user.set("name", "Nope"), Err(Error::NoActiveTransaction)));
    assert!(matches!(user.delete(), Err(Error::NoActiveTransaction)));
    assert_eq!(user.state(), NodeState::Clean);
}

#[test]
fn test_delete_removes_row_and_cache_entry() {
    let store = open_store();
    seed_user(&store, "gone", "Soon");

    let manager = manager(store.clone());
    let key = NodeKey::new("user", "gone");
    manager
        .current_transactor()
        .run(|| manager.get_node(&key)?.delete())
        .unwrap();

    assert_eq!(store.count_rows("users").unwrap(), 0);
    assert!(manager.cached(&key).is_none());
    assert!(matches!(manager.get_node(&key), Err(Error::NotFound(_))));
}

#[test]
fn test_many_to_many_attach_and_detach() {
    let store = open_store();
    let manager = manager(store.clone());
    let post_key = NodeKey::new("post", "p1");

    manager
        .current_transactor()
        .run(|| {
            let post = manager.create_node_with_id("post", "p1")?;
            post.set("title", "Tagged")?;
            for label in ["rust", "sql", "cache"] {
                let tag = manager.create_node_with_id("tag", label)?;
                tag.set("label", label)?;
                post.add_child("tags", &tag)?;
            }
            Ok(())
        })
        .unwrap();

    let ids = |m: &nodestore::NodeManager| -> Vec<String> {
        m.get_nodes(&post_key, "tags")
            .unwrap()
            .ids()
            .unwrap()
            .into_iter()
            .map(|k| k.id)
            .collect()
    };
    assert_eq!(ids(&common::manager(store.clone())), vec!["rust", "sql", "cache"]);

    manager
        .current_transactor()
        .run(|| {
            let post = manager.get_node(&post_key)?;
            let sql = manager.get_node(&NodeKey::new("tag", "sql"))?;
            let cache = manager.get_node(&NodeKey::new("tag", "cache"))?;
            post.remove_child("tags", &sql)?;
            // detach and attach of the same pair cancel out
            post.remove_child("tags", &cache)?;
            post.add_child("tags", &cache)
        })
        .unwrap();

    assert_eq!(ids(&common::manager(store.clone())), vec!["rust", "cache"]);
    assert_eq!(store.count_rows("tags").unwrap(), 3);
}

#[test]
fn test_new_nodes_may_reference_each_other() {
    let store = open_store();
    let manager = manager(store.clone());

    manager
        .current_transactor()
        .run(|| {
            let alice = manager.create_node_with_id("person", "alice")?;
            let bob = manager.create_node_with_id("person", "bob")?;
            alice.set("name", "Alice")?;
            bob.set("name", "Bob")?;
            alice.set("partner", bob.key().clone())?;
            bob.set("partner", alice.key().clone())
        })
        .unwrap();

    let reader = common::manager(store);
    let alice = reader.get_node(&NodeKey::new("person", "alice")).unwrap();
    let bob = alice.reference("partner").unwrap().unwrap();
    assert_eq!(bob.get("name"), text("Bob"));
    assert!(Arc::ptr_eq(&bob.reference("partner").unwrap().unwrap(), &alice));
    assert_eq!(alice.version(), 1);
}

#[test]
fn test_one_to_many_remove_child_clears_reference() {
    let store = open_store();
    seed_user(&store, "42", "Alice");
    let manager = manager(store.clone());
    let author_key = NodeKey::new("user", "42");

    manager
        .current_transactor()
        .run(|| {
            let author = manager.get_node(&author_key)?;
            let post = manager.transient_node("post")?;
            post.set("title", "Draft")?;
            author.add_child("posts", &post)
        })
        .unwrap();
    let children = manager.get_nodes(&author_key, "posts").unwrap();
    let posts = children.to_vec().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].state(), NodeState::Clean);

    manager
        .current_transactor()
        .run(|| manager.get_node(&author_key)?.remove_child("posts", &posts[0]))
        .unwrap();
    assert_eq!(children.count().unwrap(), 0);
    assert_eq!(posts[0].get("author"), None);
    assert_eq!(store.count_rows("posts").unwrap(), 1);
}

#[test]
fn test_file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.db");
    let registry = blog_schema().build().unwrap();

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        store.ensure_schema(&registry).unwrap();
        seed_user(&store, "disk", "Persisted");
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    store.ensure_schema(&registry).unwrap();
    let manager = manager(store);
    let user = manager.get_node(&NodeKey::new("user", "disk")).unwrap();
    assert_eq!(user.get("name"), text("Persisted"));
    assert_eq!(user.version(), 1);
}

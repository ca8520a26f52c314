//! Contract tests run against every `ContainerStore` implementation.

use chrono::{Duration, Utc};

use arena_core::types::{Container, ContainerStatus, Endpoint};
use arena_core::{ContainerStore, Error};
use arena_store::{InMemoryContainerStore, SqliteContainerStore};

fn stores() -> Vec<(&'static str, Box<dyn ContainerStore>)> {
    vec![
        ("memory", Box::new(InMemoryContainerStore::new())),
        ("sqlite", Box::new(SqliteContainerStore::open_in_memory().unwrap())),
    ]
}

fn record(id: &str, team: &str, challenge: &str) -> Container {
    let mut c = Container::new(id, "echo:latest", Endpoint::new("172.17.0.2", 7))
        .with_owner(team, challenge);
    c.status = ContainerStatus::Running;
    c
}

#[tokio::test]
async fn test_list_dying_is_strictly_before_now() {
    for (name, store) in stores() {
        let now = Utc::now();

        for (id, offset) in [("past", -1), ("now", 0), ("future", 1)] {
            let mut c = record(id, id, "chal");
            c.expect_stop_at = now + Duration::seconds(offset);
            store.save(&c).await.unwrap();
        }

        let dying: Vec<String> = store
            .list_dying(now)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(dying, vec!["past".to_string()], "store: {}", name);
    }
}

#[tokio::test]
async fn test_list_dying_below_one_millisecond() {
    for (name, store) in stores() {
        let base = chrono::DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();
        let mut c = record("c1", "t1", "c1");
        c.expect_stop_at = base + Duration::microseconds(100);
        store.save(&c).await.unwrap();

        let before = store.list_dying(base + Duration::microseconds(100)).await.unwrap();
        assert!(before.is_empty(), "store: {}", name);

        let after = store.list_dying(base + Duration::microseconds(900)).await.unwrap();
        assert_eq!(after.len(), 1, "store: {}", name);

        let just_after = store.list_dying(base + Duration::nanoseconds(100_001)).await.unwrap();
        assert_eq!(just_after.len(), 1, "store: {}", name);
    }
}

#[tokio::test]
async fn test_find_active_ignores_destroyed() {
    for (name, store) in stores() {
        let mut old = record("old", "t1", "c1");
        old.mark_destroyed();
        store.save(&old).await.unwrap();
        assert!(store.find_active("t1", "c1").await.unwrap().is_none(), "store: {}", name);

        store.save(&record("new", "t1", "c1")).await.unwrap();
        store.save(&record("other", "t2", "c1")).await.unwrap();

        let active = store.find_active("t1", "c1").await.unwrap().unwrap();
        assert_eq!(active.id, "new", "store: {}", name);
        assert!(store.find_active("t1", "c2").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_remove_requires_destroyed() {
    for (name, store) in stores() {
        let mut c = record("c1", "t1", "c1");
        store.save(&c).await.unwrap();

        let err = store.remove(&c).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)), "store: {}", name);
        assert!(store.get("c1").await.unwrap().is_some());

        c.mark_destroyed();
        store.save(&c).await.unwrap();
        store.remove(&c).await.unwrap();
        assert!(store.get("c1").await.unwrap().is_none(), "store: {}", name);

        // Already gone.
        store.remove(&c).await.unwrap();
    }
}

#[tokio::test]
async fn test_remove_ignores_stale_destroyed_copy() {
    for (name, store) in stores() {
        let running = record("c1", "t1", "c1");
        store.save(&running).await.unwrap();

        let mut stale = running.clone();
        stale.mark_destroyed();
        let err = store.remove(&stale).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)), "store: {}", name);

        let stored = store.get("c1").await.unwrap().unwrap();
        assert_eq!(stored.status, ContainerStatus::Running, "store: {}", name);
    }
}

#[tokio::test]
async fn test_extended_deadline_persists() {
    for (name, store) in stores() {
        let mut c = record("c1", "t1", "c1");
        c.expect_stop_at = Utc::now() - Duration::minutes(1);
        store.save(&c).await.unwrap();
        assert_eq!(store.list_dying(Utc::now()).await.unwrap().len(), 1);

        c.extend_to(Utc::now() + Duration::hours(2));
        store.save(&c).await.unwrap();
        assert!(store.list_dying(Utc::now()).await.unwrap().is_empty(), "store: {}", name);
    }
}

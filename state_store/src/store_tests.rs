use std::sync::Arc;

use anyhow::Result;
use data_model::{
    test_objects::tests::{mock_build_identifier, mock_check_identifier, mock_record},
    ContainerHandle,
    ContainerState,
    Owner,
};

use crate::{
    test_state_store::TestStateStore,
    ContainerStore,
    InMemoryStore,
    InsertMode,
    StoreError,
    Transition,
};

struct Backends {
    _rocksdb: TestStateStore,
    stores: Vec<(&'static str, Arc<dyn ContainerStore>)>,
}

async fn backends() -> Result<Backends> {
    let rocksdb = TestStateStore::new().await?;
    let stores: Vec<(&'static str, Arc<dyn ContainerStore>)> = vec![
        ("rocksdb", rocksdb.registry_state.clone()),
        ("in_memory", Arc::new(InMemoryStore::new())),
    ];
    Ok(Backends {
        _rocksdb: rocksdb,
        stores,
    })
}

#[tokio::test]
async fn test_insert_and_get() -> Result<()> {
    let backends = backends().await?;
    for (name, store) in &backends.stores {
        let identifier = mock_build_identifier("unit");
        let record = mock_record("h1", &identifier, ContainerState::Creating, 10, 10);
        store.insert(record.clone(), InsertMode::Exclusive).await?;

        let stored = store.get_by_handle(&ContainerHandle::from("h1")).await?;
        assert_eq!(stored, Some(record.clone()), "{}", name);
        assert!(store
            .get_by_handle(&ContainerHandle::from("missing"))
            .await?
            .is_none());

        let err = store
            .insert(record, InsertMode::Historical)
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::DuplicateHandle { .. }),
            "{}: {:?}",
            name,
            err
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_exclusive_insert_respects_reservation() -> Result<()> {
    let backends = backends().await?;
    for (name, store) in &backends.stores {
        let identifier = mock_build_identifier("unit");
        let first = mock_record("a", &identifier, ContainerState::Creating, 10, 10);
        let second = mock_record("b", &identifier, ContainerState::Creating, 11, 11);
        store.insert(first, InsertMode::Exclusive).await?;

        let err = store
            .insert(second.clone(), InsertMode::Exclusive)
            .await
            .unwrap_err();
        match err {
            StoreError::IdentifierReserved {
                identifier_key,
                holder,
            } => {
                assert_eq!(identifier_key, identifier.key(), "{}", name);
                assert_eq!(holder.get(), "a", "{}", name);
            }
            other => panic!("{}: unexpected error {:?}", name, other),
        }

        // Another identifier is unaffected.
        let other = mock_record(
            "c",
            &mock_build_identifier("lint"),
            ContainerState::Creating,
            10,
            10,
        );
        store.insert(other, InsertMode::Exclusive).await?;

        // Leaving the holding states frees the identifier.
        store
            .update_state(
                &ContainerHandle::from("a"),
                Transition::new(ContainerState::Creating, ContainerState::Expired),
            )
            .await?;
        store.insert(second, InsertMode::Exclusive).await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_historical_insert_skips_reservation() -> Result<()> {
    let backends = backends().await?;
    for (name, store) in &backends.stores {
        let identifier = mock_check_identifier(5);
        store
            .insert(
                mock_record("a", &identifier, ContainerState::Created, 10, 10),
                InsertMode::Exclusive,
            )
            .await?;
        store
            .insert(
                mock_record("b", &identifier, ContainerState::Created, 20, 20),
                InsertMode::Historical,
            )
            .await?;
        let records = store.find_by_identifier(&identifier.key()).await?;
        assert_eq!(records.len(), 2, "{}", name);
    }
    Ok(())
}

#[tokio::test]
async fn test_find_by_identifier_most_recent_first() -> Result<()> {
    let backends = backends().await?;
    for (name, store) in &backends.stores {
        let identifier = mock_build_identifier("unit");
        for (handle, created_at, last_used_at) in [("t1", 1, 100), ("t3", 3, 300), ("t2", 2, 200)]
        {
            store
                .insert(
                    mock_record(
                        handle,
                        &identifier,
                        ContainerState::Created,
                        created_at,
                        last_used_at,
                    ),
                    InsertMode::Historical,
                )
                .await?;
        }
        // Same last use as t1, created later.
        store
            .insert(
                mock_record("t0", &identifier, ContainerState::Expired, 50, 100),
                InsertMode::Historical,
            )
            .await?;
        store
            .insert(
                mock_record(
                    "other",
                    &mock_build_identifier("lint"),
                    ContainerState::Created,
                    1,
                    999,
                ),
                InsertMode::Historical,
            )
            .await?;

        let handles: Vec<String> = store
            .find_by_identifier(&identifier.key())
            .await?
            .into_iter()
            .map(|r| r.handle.get().to_string())
            .collect();
        assert_eq!(handles, vec!["t3", "t2", "t0", "t1"], "{}", name);

        assert!(store.find_by_identifier("unknown").await?.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn test_update_state_is_compare_and_swap() -> Result<()> {
    let backends = backends().await?;
    for (name, store) in &backends.stores {
        let identifier = mock_build_identifier("unit");
        let handle = ContainerHandle::from("h1");
        store
            .insert(
                mock_record("h1", &identifier, ContainerState::Created, 10, 50),
                InsertMode::Exclusive,
            )
            .await?;

        let err = store
            .update_state(
                &handle,
                Transition::new(ContainerState::Active, ContainerState::Created),
            )
            .await
            .unwrap_err();
        match err {
            StoreError::StateConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, ContainerState::Active, "{}", name);
                assert_eq!(actual, ContainerState::Created, "{}", name);
            }
            other => panic!("{}: unexpected error {:?}", name, other),
        }

        let updated = store
            .update_state(
                &handle,
                Transition::new(ContainerState::Created, ContainerState::Active).touched(80),
            )
            .await?;
        assert_eq!(updated.state, ContainerState::Active);
        assert_eq!(updated.last_used_at, 80);
        assert_eq!(store.get_by_handle(&handle).await?, Some(updated));

        // A stale use never moves last_used_at backwards.
        let updated = store
            .update_state(
                &handle,
                Transition::new(ContainerState::Active, ContainerState::Created).touched(20),
            )
            .await?;
        assert_eq!(updated.last_used_at, 80, "{}", name);

        let err = store
            .update_state(
                &ContainerHandle::from("missing"),
                Transition::new(ContainerState::Created, ContainerState::Active),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }), "{}", name);
    }
    Ok(())
}

#[tokio::test]
async fn test_update_state_guarded_by_last_use() -> Result<()> {
    let backends = backends().await?;
    for (name, store) in &backends.stores {
        let identifier = mock_build_identifier("unit");
        let handle = ContainerHandle::from("h1");
        store
            .insert(
                mock_record("h1", &identifier, ContainerState::Created, 10, 50),
                InsertMode::Exclusive,
            )
            .await?;

        // Someone joined the container after it was read at 50.
        store
            .update_state(
                &handle,
                Transition::new(ContainerState::Created, ContainerState::Created).touched(60),
            )
            .await?;

        let err = store
            .update_state(
                &handle,
                Transition::new(ContainerState::Created, ContainerState::Expired)
                    .if_unused_since(50),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                StoreError::UsedSince {
                    observed_at: 50,
                    last_used_at: 60,
                    ..
                }
            ),
            "{}: {:?}",
            name,
            err
        );
        assert!(err.is_retryable());
        let stored = store.get_by_handle(&handle).await?.unwrap();
        assert_eq!(stored.state, ContainerState::Created, "{}", name);

        let expired = store
            .update_state(
                &handle,
                Transition::new(ContainerState::Created, ContainerState::Expired)
                    .if_unused_since(60),
            )
            .await?;
        assert_eq!(expired.state, ContainerState::Expired, "{}", name);
    }
    Ok(())
}

#[tokio::test]
async fn test_update_state_rejects_invalid_transition() -> Result<()> {
    let backends = backends().await?;
    for (name, store) in &backends.stores {
        let identifier = mock_build_identifier("unit");
        let handle = ContainerHandle::from("h1");
        store
            .insert(
                mock_record("h1", &identifier, ContainerState::Expired, 10, 10),
                InsertMode::Historical,
            )
            .await?;
        let err = store
            .update_state(
                &handle,
                Transition::new(ContainerState::Expired, ContainerState::Created),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::InvalidTransition { .. }),
            "{}: {:?}",
            name,
            err
        );
        assert!(err.is_permanent());
        assert_eq!(
            store.get_by_handle(&handle).await?.map(|r| r.state),
            Some(ContainerState::Expired)
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_failed_destroy_counts_attempts() -> Result<()> {
    let backends = backends().await?;
    for (name, store) in &backends.stores {
        let identifier = mock_build_identifier("unit");
        let handle = ContainerHandle::from("h1");
        store
            .insert(
                mock_record("h1", &identifier, ContainerState::Expired, 10, 10),
                InsertMode::Historical,
            )
            .await?;
        store
            .update_state(
                &handle,
                Transition::new(ContainerState::Expired, ContainerState::Destroying),
            )
            .await?;
        for attempt in 1..=2 {
            let updated = store
                .update_state(
                    &handle,
                    Transition::new(ContainerState::Destroying, ContainerState::Destroying)
                        .with_failed_destroy(),
                )
                .await?;
            assert_eq!(updated.destroy_attempts, attempt, "{}", name);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_delete_removes_record_and_reservation() -> Result<()> {
    let backends = backends().await?;
    for (name, store) in &backends.stores {
        let identifier = mock_build_identifier("unit");
        let handle = ContainerHandle::from("h1");
        store
            .insert(
                mock_record("h1", &identifier, ContainerState::Creating, 10, 10),
                InsertMode::Exclusive,
            )
            .await?;
        store.delete(&handle).await?;

        assert!(store.get_by_handle(&handle).await?.is_none(), "{}", name);
        assert!(store.find_by_identifier(&identifier.key()).await?.is_empty());
        store
            .insert(
                mock_record("h2", &identifier, ContainerState::Creating, 11, 11),
                InsertMode::Exclusive,
            )
            .await?;

        let err = store.delete(&handle).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }), "{}", name);
    }
    Ok(())
}

#[tokio::test]
async fn test_list_by_state() -> Result<()> {
    let backends = backends().await?;
    for (name, store) in &backends.stores {
        let identifier = mock_build_identifier("unit");
        for (handle, state) in [
            ("a", ContainerState::Created),
            ("b", ContainerState::Expired),
            ("c", ContainerState::Created),
        ] {
            store
                .insert(
                    mock_record(handle, &identifier, state, 1, 1),
                    InsertMode::Historical,
                )
                .await?;
        }
        assert_eq!(store.list_containers().await?.len(), 3, "{}", name);
        let mut created: Vec<String> = store
            .list_by_state(ContainerState::Created)
            .await?
            .into_iter()
            .map(|r| r.handle.get().to_string())
            .collect();
        created.sort();
        assert_eq!(created, vec!["a", "c"], "{}", name);
        assert!(store
            .list_by_state(ContainerState::Destroying)
            .await?
            .is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn test_owner_tombstones() -> Result<()> {
    let backends = backends().await?;
    for (name, store) in &backends.stores {
        let owner = Owner::Build(7);
        assert!(!store.is_tombstoned(&owner).await?, "{}", name);
        store.tombstone_owner(owner, 100).await?;
        store.tombstone_owner(owner, 200).await?;
        assert!(store.is_tombstoned(&owner).await?, "{}", name);
        assert!(!store.is_tombstoned(&Owner::Pipeline(7)).await?, "{}", name);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_exclusive_inserts_admit_one() -> Result<()> {
    let backends = backends().await?;
    for (name, store) in &backends.stores {
        let identifier = mock_build_identifier("unit");
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let record = mock_record(
                &format!("h{}", i),
                &identifier,
                ContainerState::Creating,
                10,
                10,
            );
            tasks.push(tokio::spawn(async move {
                store.insert(record, InsertMode::Exclusive).await
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            match task.await? {
                Ok(()) => admitted += 1,
                Err(StoreError::IdentifierReserved { .. }) => {}
                // Lock timeouts are retryable and leave nothing behind.
                Err(err) if err.is_retryable() => {}
                Err(err) => panic!("{}: unexpected error {:?}", name, err),
            }
        }
        assert_eq!(admitted, 1, "{}", name);
        assert_eq!(
            store.find_by_identifier(&identifier.key()).await?.len(),
            1,
            "{}",
            name
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_rocksdb_state_survives_reopen() -> Result<()> {
    let test_store = TestStateStore::new().await?;
    let identifier = mock_build_identifier("unit");
    let handle = ContainerHandle::from("h1");
    {
        let store = test_store.registry_state.clone();
        store
            .insert(
                mock_record("h1", &identifier, ContainerState::Creating, 10, 10),
                InsertMode::Exclusive,
            )
            .await?;
        store
            .update_state(
                &handle,
                Transition::new(ContainerState::Creating, ContainerState::Created).touched(30),
            )
            .await?;
        store.tombstone_owner(Owner::Pipeline(1), 40).await?;
    }

    let test_store = test_store.reopen().await?;
    let store = test_store.registry_state.clone();
    let record = store.get_by_handle(&handle).await?.unwrap();
    assert_eq!(record.state, ContainerState::Created);
    assert_eq!(record.last_used_at, 30);
    assert!(store.is_tombstoned(&Owner::Pipeline(1)).await?);
    assert_eq!(store.find_by_identifier(&identifier.key()).await?.len(), 1);

    // The reservation is durable too.
    let err = store
        .insert(
            mock_record("h2", &identifier, ContainerState::Creating, 50, 50),
            InsertMode::Exclusive,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::IdentifierReserved { .. }));
    Ok(())
}

//! Live tests for the PostgreSQL event log.
//!
//! Run with a server available: `DATABASE_URL=... cargo test -- --ignored`.

mod common;

use std::time::Duration;

use serde_json::json;

use chronicle::{
    AggregateFilter, EventStorage, EventStoreError, EventType, ExpectedSequence, SearchQuery,
    Sequence, UniqueConstraint,
};

use common::{group, pending, tenant, user_aggregate, PostgresFixture};

#[tokio::test]
#[ignore = "requires a PostgreSQL server (set DATABASE_URL)"]
async fn push_assigns_gapless_sequences_and_commit_ordered_positions() {
    let fx = PostgresFixture::connect().await;
    let tenant = tenant();
    let alice = user_aggregate("u-1");
    let bob = user_aggregate("u-2");

    let events = fx
        .events
        .push(
            &tenant,
            vec![
                group(
                    &alice,
                    ExpectedSequence::NoStream,
                    vec![
                        pending("user.added", Some(json!({"username": "alice"})), vec![]),
                        pending("user.renamed", Some(json!({"username": "alyce"})), vec![]),
                    ],
                ),
                group(
                    &bob,
                    ExpectedSequence::NoStream,
                    vec![pending("user.added", Some(json!({"username": "bob"})), vec![])],
                ),
            ],
        )
        .await
        .unwrap();

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].sequence, Sequence::new(1));
    assert_eq!(events[1].sequence, Sequence::new(2));
    assert_eq!(events[2].sequence, Sequence::new(1));

    // The counter row stays locked until commit, so one push always gets a
    // consecutive run of positions.
    let first = events[0].position.get();
    assert_eq!(events[1].position.get(), first + 1);
    assert_eq!(events[2].position.get(), first + 2);

    let read = fx
        .events
        .filter(&SearchQuery::builder(tenant.clone()).build())
        .await
        .unwrap();
    assert_eq!(read, events);

    let latest = fx.events.latest_position().await.unwrap();
    assert!(latest >= events[2].position);
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server (set DATABASE_URL)"]
async fn stale_expectation_rejects_the_whole_push() {
    let fx = PostgresFixture::connect().await;
    let tenant = tenant();
    let alice = user_aggregate("u-1");
    let bob = user_aggregate("u-2");

    fx.events
        .push(
            &tenant,
            vec![group(
                &alice,
                ExpectedSequence::NoStream,
                vec![pending("user.added", None, vec![])],
            )],
        )
        .await
        .unwrap();

    let error = fx
        .events
        .push(
            &tenant,
            vec![
                group(
                    &bob,
                    ExpectedSequence::NoStream,
                    vec![pending("user.added", None, vec![])],
                ),
                group(
                    &alice,
                    ExpectedSequence::NoStream,
                    vec![pending("user.renamed", None, vec![])],
                ),
            ],
        )
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        EventStoreError::ConcurrentModification { .. }
    ));

    // The valid group must not have survived the rejected push.
    let read = fx
        .events
        .filter(&SearchQuery::builder(tenant.clone()).build())
        .await
        .unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].aggregate_id, alice.id);
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server (set DATABASE_URL)"]
async fn concurrent_pushes_elect_a_single_winner() {
    let fx = PostgresFixture::connect().await;
    let tenant = tenant();
    let aggregate = user_aggregate("u-1");

    let push = |username: &str| {
        let payload = json!({ "username": username });
        fx.events.push(
            &tenant,
            vec![group(
                &aggregate,
                ExpectedSequence::NoStream,
                vec![pending("user.added", Some(payload), vec![])],
            )],
        )
    };

    let (left, right) = tokio::join!(push("alice"), push("bob"));
    assert_ne!(left.is_ok(), right.is_ok());

    let loser = left.and(right).unwrap_err();
    assert!(loser.is_retryable());
    assert!(matches!(
        loser,
        EventStoreError::ConcurrentModification {
            expected: ExpectedSequence::NoStream,
            ..
        }
    ));

    let read = fx
        .events
        .filter(&SearchQuery::builder(tenant.clone()).build())
        .await
        .unwrap();
    assert_eq!(read.len(), 1);
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server (set DATABASE_URL)"]
async fn username_claims_are_transactional_and_reclaimable() {
    let fx = PostgresFixture::connect().await;
    let tenant = tenant();
    let first = user_aggregate("u-1");
    let second = user_aggregate("u-2");
    let claim = || UniqueConstraint::add("username", "alice", "username is already taken");

    fx.events
        .push(
            &tenant,
            vec![group(
                &first,
                ExpectedSequence::NoStream,
                vec![pending(
                    "user.added",
                    Some(json!({"username": "alice"})),
                    vec![claim()],
                )],
            )],
        )
        .await
        .unwrap();

    let error = fx
        .events
        .push(
            &tenant,
            vec![group(
                &second,
                ExpectedSequence::NoStream,
                vec![pending(
                    "user.added",
                    Some(json!({"username": "alice"})),
                    vec![claim()],
                )],
            )],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        EventStoreError::UniqueConstraintViolated { ref message, .. }
            if message == "username is already taken"
    ));

    // The losing push left nothing behind.
    let read = fx
        .events
        .filter(&SearchQuery::builder(tenant.clone()).build())
        .await
        .unwrap();
    assert_eq!(read.len(), 1);

    // Freeing the key makes it claimable again.
    fx.events
        .push(
            &tenant,
            vec![group(
                &first,
                ExpectedSequence::Exact(Sequence::new(1)),
                vec![pending(
                    "user.removed",
                    None,
                    vec![UniqueConstraint::remove("username", "alice")],
                )],
            )],
        )
        .await
        .unwrap();

    fx.events
        .push(
            &tenant,
            vec![group(
                &second,
                ExpectedSequence::NoStream,
                vec![pending(
                    "user.added",
                    Some(json!({"username": "alice"})),
                    vec![claim()],
                )],
            )],
        )
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server (set DATABASE_URL)"]
async fn concurrent_claims_of_one_username_elect_a_single_winner() {
    let fx = PostgresFixture::connect().await;
    let tenant = tenant();
    let first = user_aggregate("u-1");
    let second = user_aggregate("u-2");

    let claim = |aggregate| {
        fx.events.push(
            &tenant,
            vec![group(
                aggregate,
                ExpectedSequence::NoStream,
                vec![pending(
                    "user.added",
                    Some(json!({"username": "alice"})),
                    vec![UniqueConstraint::add(
                        "username",
                        "alice",
                        "username is already taken",
                    )],
                )],
            )],
        )
    };

    let (left, right) = tokio::join!(claim(&first), claim(&second));
    assert_ne!(left.is_ok(), right.is_ok());

    let loser = left.and(right).unwrap_err();
    assert!(matches!(
        loser,
        EventStoreError::UniqueConstraintViolated { ref message, .. }
            if message == "username is already taken"
    ));

    // Only the winner's event survives the race.
    let read = fx
        .events
        .filter(&SearchQuery::builder(tenant.clone()).build())
        .await
        .unwrap();
    assert_eq!(read.len(), 1);
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server (set DATABASE_URL)"]
async fn global_claims_span_tenants_while_scoped_claims_do_not() {
    let fx = PostgresFixture::connect().await;
    let here = tenant();
    let there = tenant();
    let key = format!("example-{:08x}.com", rand::random::<u32>());

    fx.events
        .push(
            &here,
            vec![group(
                &user_aggregate("i-1"),
                ExpectedSequence::NoStream,
                vec![pending(
                    "instance.domain.added",
                    Some(json!({"domain": &key})),
                    vec![UniqueConstraint::add_global(
                        "domain",
                        &key,
                        "domain is already reserved",
                    )],
                )],
            )],
        )
        .await
        .unwrap();

    let error = fx
        .events
        .push(
            &there,
            vec![group(
                &user_aggregate("i-1"),
                ExpectedSequence::NoStream,
                vec![pending(
                    "instance.domain.added",
                    Some(json!({"domain": &key})),
                    vec![UniqueConstraint::add_global(
                        "domain",
                        &key,
                        "domain is already reserved",
                    )],
                )],
            )],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        EventStoreError::UniqueConstraintViolated { ref message, .. }
            if message == "domain is already reserved"
    ));

    // The same key scoped per tenant does not collide across tenants.
    for owner in [&here, &there] {
        fx.events
            .push(
                owner,
                vec![group(
                    &user_aggregate("u-9"),
                    ExpectedSequence::NoStream,
                    vec![pending(
                        "user.added",
                        Some(json!({"username": "carol"})),
                        vec![UniqueConstraint::add(
                            "username",
                            "carol",
                            "username is already taken",
                        )],
                    )],
                )],
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server (set DATABASE_URL)"]
async fn filter_scopes_orders_and_truncates() {
    let fx = PostgresFixture::connect().await;
    let tenant = tenant();
    let noise = common::tenant();
    let alice = user_aggregate("u-1");
    let bob = user_aggregate("u-2");

    let events = fx
        .events
        .push(
            &tenant,
            vec![
                group(
                    &alice,
                    ExpectedSequence::NoStream,
                    vec![
                        pending("user.added", Some(json!({"username": "alice"})), vec![]),
                        pending("user.renamed", Some(json!({"username": "alyce"})), vec![]),
                    ],
                ),
                group(
                    &bob,
                    ExpectedSequence::NoStream,
                    vec![pending("user.added", Some(json!({"username": "bob"})), vec![])],
                ),
            ],
        )
        .await
        .unwrap();
    fx.events
        .push(
            &noise,
            vec![group(
                &user_aggregate("u-1"),
                ExpectedSequence::NoStream,
                vec![pending("user.added", None, vec![])],
            )],
        )
        .await
        .unwrap();

    let scoped = fx
        .events
        .filter(&SearchQuery::builder(tenant.clone()).build())
        .await
        .unwrap();
    assert_eq!(scoped.len(), 3);
    assert!(scoped.iter().all(|event| event.instance_id == tenant));

    let renames = fx
        .events
        .filter(
            &SearchQuery::builder(tenant.clone())
                .filter(
                    AggregateFilter::new(alice.aggregate_type.clone())
                        .aggregate_id(alice.id.clone())
                        .event_types([EventType::try_new("user.renamed").unwrap()]),
                )
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(renames.len(), 1);
    assert_eq!(renames[0].event_type.as_str(), "user.renamed");

    let newest = fx
        .events
        .filter(
            &SearchQuery::builder(tenant.clone())
                .descending()
                .limit(1)
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(newest.len(), 1);
    assert_eq!(newest[0].position, events[2].position);

    let caught_up = fx
        .events
        .filter(
            &SearchQuery::builder(tenant.clone())
                .position_after(events[0].position)
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(caught_up.len(), 2);
    assert!(caught_up.iter().all(|event| event.position > events[0].position));
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server (set DATABASE_URL)"]
async fn empty_groups_validate_but_commit_nothing() {
    let fx = PostgresFixture::connect().await;
    let tenant = tenant();

    let committed = fx
        .events
        .push(
            &tenant,
            vec![group(
                &user_aggregate("u-1"),
                ExpectedSequence::NoStream,
                vec![],
            )],
        )
        .await
        .unwrap();
    assert!(committed.is_empty());

    let read = fx
        .events
        .filter(&SearchQuery::builder(tenant.clone()).build())
        .await
        .unwrap();
    assert!(read.is_empty());
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server (set DATABASE_URL)"]
async fn active_instances_reports_recent_writers() {
    let fx = PostgresFixture::connect().await;
    let tenant = tenant();

    fx.events
        .push(
            &tenant,
            vec![group(
                &user_aggregate("u-1"),
                ExpectedSequence::NoStream,
                vec![pending("user.added", None, vec![])],
            )],
        )
        .await
        .unwrap();

    let active = fx
        .events
        .active_instances(Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(active.contains(&tenant));
}

#[tokio::test]
#[ignore = "requires a PostgreSQL server (set DATABASE_URL)"]
async fn ping_reaches_the_server() {
    let fx = PostgresFixture::connect().await;
    fx.events.ping().await.unwrap();
}

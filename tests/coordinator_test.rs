mod helpers;

use std::sync::atomic::Ordering;

use memhub::error::{ErrorKind, MemoryError};
use memhub::memory::coordinator::{
    ChangeKind, CleanupRequest, DeleteStatus, RecordRef, StoreRequest, SubStore,
};
use memhub::memory::records::ListFilter;
use memhub::memory::types::{record_id, NodeKind, Scope};
use serde_json::json;

#[tokio::test]
async fn partial_delete_is_reported_and_retry_finishes() {
    let (c, vectors) = helpers::coordinator_with_failing_vectors();
    helpers::store(&c, "u1", "shared", "plan", json!("migrate the billing service")).await;
    c.flush_indexing().await.unwrap();

    vectors.fail_remove.store(true, Ordering::SeqCst);
    let err = c.delete("u1", "shared", "plan").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PartialFailure);
    let MemoryError::PartialFailure(report) = err else {
        panic!("expected a partial failure");
    };
    assert_eq!(report.status, DeleteStatus::PartialFailure);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].store, SubStore::Vector);
    assert!(report.succeeded.contains(&SubStore::Lexical));
    assert!(report.succeeded.contains(&SubStore::Record));

    vectors.fail_remove.store(false, Ordering::SeqCst);
    let retry = c.delete("u1", "shared", "plan").await.unwrap();
    assert_eq!(retry.status, DeleteStatus::Deleted);
    assert!(retry.failed.is_empty());

    let again = c.delete("u1", "shared", "plan").await.unwrap();
    assert_eq!(again.status, DeleteStatus::Noop);
}

#[tokio::test]
async fn partial_failure_carries_report_in_error_data() {
    let (c, vectors) = helpers::coordinator_with_failing_vectors();
    helpers::store(&c, "u1", "shared", "k", json!("value")).await;
    c.flush_indexing().await.unwrap();
    vectors.fail_remove.store(true, Ordering::SeqCst);

    let err = c.delete("u1", "shared", "k").await.unwrap_err();
    let data = err.data().unwrap();
    assert_eq!(data["status"], "partial_failure");
    assert_eq!(data["failed"][0]["store"], "vector");
}

#[tokio::test]
async fn delete_of_missing_record_is_noop() {
    let c = helpers::coordinator();
    for _ in 0..3 {
        let report = c.delete("u1", "shared", "never-stored").await.unwrap();
        assert_eq!(report.status, DeleteStatus::Noop);
        assert_eq!(report.record_id, record_id("u1", "shared", "never-stored"));
    }
}

#[tokio::test]
async fn delete_is_scoped_to_owner() {
    let c = helpers::coordinator();
    helpers::store(&c, "alice", "shared", "k", json!("alice's value")).await;
    let report = c.delete("bob", "shared", "k").await.unwrap();
    assert_eq!(report.status, DeleteStatus::Noop);
    assert!(c.get("alice", "shared", "k").await.unwrap().is_some());
}

#[tokio::test]
async fn mutations_publish_events() {
    let c = helpers::coordinator();
    let mut events = c.subscribe();

    helpers::store(&c, "u1", "shared", "k", json!("v")).await;
    c.feedback("u1", "shared", "k", true).await.unwrap();
    c.delete("u1", "shared", "k").await.unwrap();
    // Noop deletes are silent.
    c.delete("u1", "shared", "k").await.unwrap();
    helpers::store(&c, "u1", "shared", "k2", json!("v")).await;

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(events.recv().await.unwrap().change);
    }
    assert_eq!(
        seen,
        vec![
            ChangeKind::Stored,
            ChangeKind::Feedback,
            ChangeKind::Deleted,
            ChangeKind::Stored
        ]
    );
}

#[tokio::test]
async fn invalid_requests_write_nothing() {
    let c = helpers::coordinator();

    let mut bad_tags = StoreRequest::new("k", json!("v"));
    bad_tags.tags = (0..100).map(|i| format!("t{i}")).collect();
    assert_eq!(
        c.store("u1", bad_tags).await.unwrap_err().kind(),
        ErrorKind::ValidationError
    );
    assert_eq!(
        c.store("u1", StoreRequest::new("", json!("v"))).await.unwrap_err().kind(),
        ErrorKind::ValidationError
    );
    assert_eq!(
        c.store("", StoreRequest::new("k", json!("v"))).await.unwrap_err().kind(),
        ErrorKind::ValidationError
    );
    assert!(c.list("u1", ListFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn store_keeps_created_at_and_bumps_updated_at() {
    let c = helpers::coordinator();
    let first = helpers::store(&c, "u1", "shared", "k", json!("v1")).await;
    let before = c.get("u1", "shared", "k").await.unwrap().unwrap();
    let second = helpers::store(&c, "u1", "shared", "k", json!("v2")).await;
    let after = c.get("u1", "shared", "k").await.unwrap().unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(before.created_at, after.created_at);
    assert!(after.updated_at >= before.updated_at);
    assert_eq!(after.value, json!("v2"));
}

#[tokio::test]
async fn cleanup_dry_run_then_delete() {
    let c = helpers::coordinator();
    for (key, importance) in [("low1", 0.05), ("low2", 0.1), ("keep", 0.8)] {
        let mut req = StoreRequest::new(key, json!(format!("value of {key}"))).in_namespace("shared");
        req.importance = Some(importance);
        c.store("u1", req).await.unwrap();
    }
    let mut other = StoreRequest::new("low_other", json!("x"));
    other.importance = Some(0.0);
    c.store("u2", other).await.unwrap();

    let dry = c
        .cleanup(
            "u1",
            CleanupRequest {
                namespace: None,
                max_importance: 0.1,
                dry_run: true,
            },
        )
        .await
        .unwrap();
    assert!(dry.dry_run);
    assert_eq!(dry.candidates.len(), 2);
    assert_eq!(dry.deleted, 0);
    assert_eq!(c.list("u1", ListFilter::default()).await.unwrap().len(), 3);

    let real = c
        .cleanup(
            "u1",
            CleanupRequest {
                namespace: None,
                max_importance: 0.1,
                dry_run: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(real.deleted, 2);
    assert!(real.failures.is_empty());
    let left = c.list("u1", ListFilter::default()).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].key, "keep");
    assert!(c.get("u2", "shared", "low_other").await.unwrap().is_some());
}

#[tokio::test]
async fn cleanup_rejects_out_of_range_threshold() {
    let c = helpers::coordinator();
    let err = c
        .cleanup(
            "u1",
            CleanupRequest {
                namespace: None,
                max_importance: 1.5,
                dry_run: true,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
}

#[tokio::test]
async fn related_memories_follow_relate_edges() {
    let c = helpers::coordinator();
    helpers::store(&c, "u1", "shared", "project", json!("memhub backend")).await;
    helpers::store(&c, "u1", "shared", "stack", json!("rust and sqlite")).await;
    helpers::store(&c, "u1", "work", "deadline", json!("ships in november")).await;

    c.relate(
        "u1",
        RecordRef::new("shared", "project"),
        RecordRef::new("shared", "stack"),
        "uses",
        0.9,
    )
    .await
    .unwrap();
    c.relate(
        "u1",
        RecordRef::new("shared", "stack"),
        RecordRef::new("work", "deadline"),
        "constrains",
        0.4,
    )
    .await
    .unwrap();

    let related = c
        .related_memories("u1", RecordRef::new("shared", "project"), 2, 10)
        .await
        .unwrap();
    let keys: Vec<&str> = related.iter().map(|r| r.record.key.as_str()).collect();
    assert_eq!(keys, vec!["stack", "deadline"]);
    assert_eq!(related[0].depth, 1);
    assert_eq!(related[0].relation, "uses");
    assert_eq!(related[1].depth, 2);

    let shallow = c
        .related_memories("u1", RecordRef::new("shared", "project"), 1, 10)
        .await
        .unwrap();
    assert_eq!(shallow.len(), 1);
}

#[tokio::test]
async fn unrelated_record_has_no_related_memories() {
    let c = helpers::coordinator();
    helpers::store(&c, "u1", "shared", "alone", json!("nothing links here")).await;
    let related = c
        .related_memories("u1", RecordRef::new("shared", "alone"), 2, 10)
        .await
        .unwrap();
    assert!(related.is_empty());
}

#[tokio::test]
async fn relate_requires_both_records_of_the_same_owner() {
    let c = helpers::coordinator();
    helpers::store(&c, "alice", "shared", "mine", json!("a")).await;
    helpers::store(&c, "bob", "shared", "theirs", json!("b")).await;

    let err = c
        .relate(
            "alice",
            RecordRef::new("shared", "mine"),
            RecordRef::new("shared", "theirs"),
            "knows",
            1.0,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = c
        .relate(
            "alice",
            RecordRef::new("shared", "mine"),
            RecordRef::new("shared", "mine"),
            "self",
            -0.5,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
}

#[tokio::test]
async fn graph_edges_cannot_cross_owners() {
    let c = helpers::coordinator();
    let a = c.add_node("alice", NodeKind::Topic, "rust", json!({})).await.unwrap();
    let b = c.add_node("bob", NodeKind::Topic, "go", json!({})).await.unwrap();

    let err = c.add_edge("alice", &a, &b, "related_to", 0.5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(c.get_related("alice", &a, 2, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn retracted_edge_leaves_traversal() {
    let c = helpers::coordinator();
    let a = c.add_node("u1", NodeKind::Topic, "a", json!({})).await.unwrap();
    let b = c.add_node("u1", NodeKind::Topic, "b", json!({})).await.unwrap();
    c.add_edge("u1", &a, &b, "related_to", 0.7).await.unwrap();
    assert_eq!(c.get_related("u1", &a, 1, 10).await.unwrap().len(), 1);

    c.add_edge("u1", &a, &b, "related_to", 0.0).await.unwrap();
    assert!(c.get_related("u1", &a, 1, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn interactions_feed_pattern_analysis() {
    let c = helpers::coordinator();
    helpers::store(&c, "u1", "shared", "lang_pref", json!("prefers Go")).await;
    let memory = record_id("u1", "shared", "lang_pref");

    let first = c
        .record_interaction(
            "u1",
            "which language should the ingestion service use",
            "Go, since you prefer it.",
            json!({"platform": "desktop", "memory_ids": [memory]}),
        )
        .await
        .unwrap();
    assert_eq!(first.memory_refs, vec![memory.clone()]);
    c.record_interaction("u1", "ingestion service deployment", "", json!({"platform": "cli"}))
        .await
        .unwrap();

    let report = c.analyze_pattern("u1").await.unwrap();
    assert_eq!(report.total_interactions, 2);
    assert_eq!(report.topics["ingestion"], 2);
    assert_eq!(report.platforms["desktop"], 1);
    assert_eq!(report.trajectory.len(), 2);

    let nothing = c.analyze_pattern("someone-else").await.unwrap();
    assert_eq!(nothing.total_interactions, 0);
}

#[tokio::test]
async fn link_graph_attaches_record_to_user() {
    let c = helpers::coordinator();
    let mut req = StoreRequest::new("tz", json!("UTC+2")).in_namespace("shared");
    req.link_graph = true;
    req.scope = Scope::Persistent;
    c.store("u1", req).await.unwrap();

    let user = c.add_node("u1", NodeKind::User, "u1", json!({})).await.unwrap();
    let related = c.get_related("u1", &user, 1, 10).await.unwrap();
    assert!(related
        .iter()
        .any(|r| r.node.kind == NodeKind::MemoryReference
            && r.node.label == record_id("u1", "shared", "tz")));
}

//! Task submission tests.
//!
//! Run with: `cargo test -p distributask-worker --test submitter_test`

mod helpers;

use std::sync::Arc;

use serde_json::json;

use distributask_broker::{Broker, MemoryBroker};
use distributask_core::models::{ImageOperation, ImagePayload, Priority, TaskStatus};
use distributask_core::{StoreError, TaskListQuery, TaskStore};
use distributask_db::MemoryTaskStore;
use distributask_worker::{CreateTaskRequest, Distributor, PriorityInput, SubmitError, TaskSubmitter};

use helpers::{defaults, DownBroker, Harness, ScriptedHandler, OWNER};

fn request(body: serde_json::Value) -> CreateTaskRequest {
    serde_json::from_value(body).unwrap()
}

fn resize_request() -> CreateTaskRequest {
    request(json!({
        "type": "image_processing",
        "payload": {
            "url": "https://example.com/photo.jpg",
            "operation": "resize",
            "params": {"width": 100, "height": 200}
        }
    }))
}

fn harness() -> Harness {
    Harness::new(ScriptedHandler::succeeding())
}

#[tokio::test(start_paused = true)]
async fn test_create_task_applies_defaults_and_queues_reference() {
    let h = harness();
    let task = h.submitter().create_task(OWNER, resize_request()).await.unwrap();

    assert_eq!(task.owner_id, OWNER);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.priority, Priority::Default);
    assert_eq!(task.timeout_seconds, 30);
    assert_eq!(task.max_retries, 5);
    assert_eq!(task.retry_count, 0);
    assert!(h.broker.contains(task.id).await.unwrap());

    let delivery = h.next_delivery().await;
    assert_eq!(delivery.task_id(), task.id);
    assert_eq!(delivery.message.priority, Priority::Default);
    assert_eq!(delivery.message.max_retries, 5);
}

#[tokio::test(start_paused = true)]
async fn test_create_task_honours_explicit_settings() {
    let h = harness();
    let task = h
        .submitter()
        .create_task(
            OWNER,
            request(json!({
                "type": "image_processing",
                "payload": {
                    "url": "http://example.com/a.png",
                    "operation": "rotate",
                    "params": {"angle": 90}
                },
                "priority": "critical",
                "timeout_seconds": 120,
                "max_retries": 0
            })),
        )
        .await
        .unwrap();

    assert_eq!(task.priority, Priority::Critical);
    assert_eq!(task.timeout_seconds, 120);
    assert_eq!(task.max_retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_numeric_priority_weights() {
    let h = harness();
    let submitter = h.submitter();

    for (weight, expected) in [(3, Priority::Critical), (2, Priority::Default), (1, Priority::Low)] {
        let mut req = resize_request();
        req.priority = Some(PriorityInput::Weight(weight));
        let task = submitter.create_task(OWNER, req).await.unwrap();
        assert_eq!(task.priority, expected);
    }

    let parsed = request(json!({
        "type": "image_processing",
        "payload": {"url": "https://example.com/a.png", "operation": "flip", "params": {"axis": "y"}},
        "priority": 3
    }));
    assert_eq!(parsed.priority, Some(PriorityInput::Weight(3)));
}

#[tokio::test(start_paused = true)]
async fn test_top_level_params_are_merged_into_payload() {
    let h = harness();
    let task = h
        .submitter()
        .create_task(
            OWNER,
            request(json!({
                "type": "image_processing",
                "payload": {"url": "https://example.com/a.gif", "operation": "flip"},
                "params": {"axis": "X"}
            })),
        )
        .await
        .unwrap();

    let stored = ImagePayload::from_value(&task.payload).unwrap();
    assert_eq!(
        stored.operation,
        ImageOperation::Flip {
            axis: distributask_core::models::FlipAxis::X
        }
    );
    // Normalised on the way in.
    assert_eq!(task.payload["params"]["axis"], "x");
}

#[tokio::test(start_paused = true)]
async fn test_invalid_requests_are_rejected_before_storage() {
    let h = harness();
    let submitter = h.submitter();

    let cases = [
        json!({
            "type": "video_processing",
            "payload": {"url": "https://example.com/a.png", "operation": "flip", "params": {"axis": "x"}}
        }),
        json!({
            "type": "image_processing",
            "payload": {"url": "ftp://example.com/a.png", "operation": "flip", "params": {"axis": "x"}}
        }),
        json!({
            "type": "image_processing",
            "payload": {"url": "https://example.com/a.bmp", "operation": "flip", "params": {"axis": "x"}}
        }),
        json!({
            "type": "image_processing",
            "payload": {"url": "https://example.com/a.png", "operation": "resize", "params": {"width": 0, "height": 10}}
        }),
        json!({
            "type": "image_processing",
            "payload": {"url": "https://example.com/a.png", "operation": "blur", "params": {}}
        }),
        json!({
            "type": "image_processing",
            "payload": {"url": "https://example.com/a.png", "operation": "rotate", "params": {"angle": 0}}
        }),
        json!({
            "type": "image_processing",
            "payload": {"url": "https://example.com/a.png", "operation": "flip", "params": {"axis": "x"}},
            "timeout_seconds": 0
        }),
        json!({
            "type": "image_processing",
            "payload": {"url": "https://example.com/a.png", "operation": "flip", "params": {"axis": "x"}},
            "max_retries": -1
        }),
    ];

    for body in cases {
        let err = submitter.create_task(OWNER, request(body.clone())).await.unwrap_err();
        assert!(
            matches!(err, SubmitError::Validation(_)),
            "expected validation error for {}, got {:?}",
            body,
            err
        );
    }

    let stored = submitter
        .list_tasks(OWNER, TaskListQuery::default())
        .await
        .unwrap();
    assert!(stored.is_empty());
    assert_eq!(h.broker.stats().await.total(), 0);
}

#[tokio::test]
async fn test_enqueue_failure_leaves_pending_row() {
    let store = Arc::new(MemoryTaskStore::new());
    let submitter = TaskSubmitter::new(
        store.clone(),
        Distributor::new(Arc::new(DownBroker)),
        defaults(),
    );

    let err = submitter.create_task(OWNER, resize_request()).await.unwrap_err();
    let task_id = match err {
        SubmitError::Enqueue { task_id, .. } => task_id,
        other => panic!("expected enqueue error, got {:?}", other),
    };

    let task = store.get(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_get_and_list_are_owner_scoped() {
    let h = harness();
    let submitter = h.submitter();
    let first = submitter.create_task(OWNER, resize_request()).await.unwrap();
    let second = submitter.create_task(OWNER, resize_request()).await.unwrap();
    let foreign = submitter.create_task(OWNER + 1, resize_request()).await.unwrap();

    assert_eq!(submitter.get_task(OWNER, first.id).await.unwrap().id, first.id);
    assert!(matches!(
        submitter.get_task(OWNER, foreign.id).await,
        Err(SubmitError::Store(StoreError::NotFound { .. }))
    ));

    let listed: Vec<_> = submitter
        .list_tasks(OWNER, TaskListQuery::default())
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(listed, vec![second.id, first.id]);

    let completed = submitter
        .list_tasks(
            OWNER,
            TaskListQuery {
                status: Some(TaskStatus::Completed),
                ..TaskListQuery::default()
            },
        )
        .await
        .unwrap();
    assert!(completed.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_delete_withdraws_queued_reference() {
    let h = harness();
    let submitter = h.submitter();
    let task = submitter.create_task(OWNER, resize_request()).await.unwrap();

    assert!(matches!(
        submitter.delete_task(OWNER + 1, task.id).await,
        Err(SubmitError::Store(StoreError::NotFound { .. }))
    ));
    assert!(h.broker.contains(task.id).await.unwrap());

    assert!(submitter.delete_task(OWNER, task.id).await.unwrap());
    assert!(!h.broker.contains(task.id).await.unwrap());
    assert!(h.store.get(task.id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_delete_of_leased_task_lets_worker_drop_it() {
    let h = harness();
    let submitter = h.submitter();
    let task = submitter.create_task(OWNER, resize_request()).await.unwrap();

    let delivery = h.next_delivery().await;
    assert!(submitter.delete_task(OWNER, task.id).await.unwrap());
    // Leased references are not withdrawn.
    assert!(h.broker.contains(task.id).await.unwrap());

    assert_eq!(
        h.processor.process(delivery).await,
        distributask_worker::ProcessOutcome::Dropped
    );
    assert!(!h.broker.contains(task.id).await.unwrap());
}

#[tokio::test]
async fn test_submitter_over_plain_memory_broker() {
    let store = Arc::new(MemoryTaskStore::new());
    let broker = Arc::new(MemoryBroker::default());
    let submitter = TaskSubmitter::new(store.clone(), Distributor::new(broker.clone()), defaults());

    let task = submitter.create_task(OWNER, resize_request()).await.unwrap();
    assert_eq!(store.load(task.id, OWNER).await.unwrap().id, task.id);
    assert_eq!(broker.stats().await.visible, 1);
}

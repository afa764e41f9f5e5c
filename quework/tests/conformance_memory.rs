#![cfg(feature = "memory")]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use quework::{
    backend::{memory::MemoryBackend, QueueBackend},
    Client, JobPriority, NewJob, DEFAULT_QUEUE,
};

/// Test factory functions
fn client() -> Client<MemoryBackend> {
    Client::new(MemoryBackend::new().with_max_connections(32))
}

fn job(job_type: &str, priority: i16) -> NewJob {
    NewJob::new(job_type).with_priority(priority)
}

/// C1. Claim order is (priority, run_at, id)
#[tokio::test]
async fn test_claim_order() {
    let client = client();
    let earlier = Utc::now() - chrono::Duration::seconds(10);

    let late_low = client.enqueue(job("late_low", 5)).await.unwrap();
    let urgent = client.enqueue(job("urgent", 0)).await.unwrap();
    let old_low = client.enqueue(job("old_low", 5).with_run_at(earlier)).await.unwrap();
    let tie = client.enqueue(job("tie", 5)).await.unwrap();

    let mut claimed = Vec::new();
    while let Some(mut locked) = client.lock_job(DEFAULT_QUEUE).await.unwrap() {
        claimed.push(locked.job().id);
        locked.delete().await.unwrap();
        locked.release().await.unwrap();
    }

    // late_low and tie may share a run_at; the lower id breaks the tie
    assert_eq!(claimed, vec![urgent, old_low, late_low, tie]);
}

/// C2. Concurrent claimers never hold the same job
#[tokio::test]
async fn test_concurrent_claims_are_distinct() {
    let client = Arc::new(client());
    for _ in 0..20 {
        client.enqueue(job("work", 0)).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(locked) = client.lock_job(DEFAULT_QUEUE).await.unwrap() {
                held.push(locked);
                tokio::task::yield_now().await;
            }
            held
        }));
    }

    let mut all_held = Vec::new();
    for handle in handles {
        all_held.extend(handle.await.unwrap());
    }

    // Every lock is still held here, so any duplicate would be a double claim
    let ids: HashSet<_> = all_held.iter().map(|locked| locked.job().id).collect();
    assert_eq!(ids.len(), 20);
    assert_eq!(all_held.len(), 20);

    for locked in all_held {
        locked.release().await.unwrap();
    }
}

/// C3. Enqueue then claim returns the job before lower-priority work
#[tokio::test]
async fn test_enqueue_then_claim() {
    let client = client();
    client.enqueue(job("background", 100)).await.unwrap();
    let id = client.enqueue(job("foreground", 1)).await.unwrap();

    let locked = client.lock_job(DEFAULT_QUEUE).await.unwrap().unwrap();
    assert_eq!(locked.job().id, id);

    // Held, so a second claim moves on
    let other = client.lock_job(DEFAULT_QUEUE).await.unwrap().unwrap();
    assert_ne!(other.job().id, id);

    locked.release().await.unwrap();
    other.release().await.unwrap();
}

/// C4. A dropped connection frees its job with no other action
#[tokio::test]
async fn test_dropped_connection_releases_job() {
    let backend = MemoryBackend::new();
    let client = Client::new(backend.clone());
    let id = client.enqueue(job("crashy", 0)).await.unwrap();

    let mut conn = backend.acquire().await.unwrap();
    let claimed = backend.claim_next(&mut conn, DEFAULT_QUEUE).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert!(client.lock_job(DEFAULT_QUEUE).await.unwrap().is_none());

    // Simulated crash: the session goes away without unlocking
    drop(conn);

    let reclaimed = client.lock_job(DEFAULT_QUEUE).await.unwrap().unwrap();
    assert_eq!(reclaimed.job().id, id);
    reclaimed.release().await.unwrap();
}

/// C5. Future jobs are not eligible
#[tokio::test]
async fn test_future_job_not_claimed() {
    let client = client();
    client
        .enqueue(job("later", 0).with_run_at(Utc::now() + chrono::Duration::hours(1)))
        .await
        .unwrap();

    assert!(client.lock_job(DEFAULT_QUEUE).await.unwrap().is_none());
}

/// C6. Queues are isolated
#[tokio::test]
async fn test_queue_filter() {
    let client = client();
    let mail = client.enqueue(job("send", 0).with_queue("mail")).await.unwrap();

    assert!(client.lock_job(DEFAULT_QUEUE).await.unwrap().is_none());

    let locked = client.lock_job("mail").await.unwrap().unwrap();
    assert_eq!(locked.job().id, mail);
    locked.release().await.unwrap();
}

/// C7. Unlock is idempotent
#[tokio::test]
async fn test_release_lock_idempotent() {
    let backend = MemoryBackend::new();
    let client = Client::new(backend.clone());
    let id = client.enqueue(job("once", 0)).await.unwrap();

    let mut conn = backend.acquire().await.unwrap();
    backend.claim_next(&mut conn, DEFAULT_QUEUE).await.unwrap().unwrap();

    backend.release_lock(&mut conn, id).await.unwrap();
    backend.release_lock(&mut conn, id).await.unwrap();
    assert!(!backend.is_locked(id));
}

/// C8. Retry and reschedule touch only their own fields
#[tokio::test]
async fn test_update_fields() {
    let client = client();
    let id = client
        .enqueue(job("mutable", 3).with_args(b"v1".to_vec()))
        .await
        .unwrap();
    let later = Utc::now() + chrono::Duration::minutes(1);
    let even_later = later + chrono::Duration::minutes(1);

    let mut locked = client.lock_job(DEFAULT_QUEUE).await.unwrap().unwrap();
    locked.retry(1, "first failure", later).await.unwrap();
    locked.reschedule(b"v2", even_later).await.unwrap();
    locked.release().await.unwrap();

    let stored = client.backend().get(id).unwrap();
    assert_eq!(stored.error_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("first failure"));
    assert_eq!(stored.args, b"v2".to_vec());
    assert_eq!(stored.run_at, even_later);
    assert_eq!(stored.priority, JobPriority(3));
}

/// C9. Claims wait for a free connection
#[tokio::test]
async fn test_claim_waits_for_connection() {
    let backend = MemoryBackend::new()
        .with_max_connections(1)
        .with_acquire_timeout(None);
    let client = Client::new(backend);
    client.enqueue(job("a", 0)).await.unwrap();
    client.enqueue(job("b", 0)).await.unwrap();

    let first = client.lock_job(DEFAULT_QUEUE).await.unwrap().unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.lock_job(DEFAULT_QUEUE).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    first.release().await.unwrap();
    let second = waiter.await.unwrap().unwrap().unwrap();
    second.release().await.unwrap();
}

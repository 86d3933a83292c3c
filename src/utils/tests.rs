use super::batching_queue::BatchingQueue;
use super::error::Error;
use super::limiter::{FixedLimiter, RateLimiter};
use super::random_string;
use std::time::Duration;

#[test]
fn test_fixed_limiter_add_until_limit() {
    let limiter = FixedLimiter::new(10);
    assert!(limiter.add(4).is_ok());
    assert!(limiter.add(6).is_ok());
    assert!(matches!(limiter.add(1), Err(Error::LimitReached)));
    assert_eq!(limiter.value(), 10);
    assert_eq!(limiter.limit(), 10);
    assert_eq!(limiter.remaining(), 0);
}

#[test]
fn test_fixed_limiter_failed_add_commits_nothing() {
    let limiter = FixedLimiter::new(5);
    limiter.add(3).unwrap();
    assert!(limiter.add(3).is_err());
    assert_eq!(limiter.value(), 3);
    assert!(limiter.add(2).is_ok());
}

#[test]
fn test_fixed_limiter_sub_floors_at_zero() {
    let limiter = FixedLimiter::new(5);
    limiter.add(2).unwrap();
    limiter.sub(5);
    assert_eq!(limiter.value(), 0);
    assert_eq!(limiter.remaining(), 5);
}

#[test]
fn test_fixed_limiter_with_value_and_reset() {
    let limiter = FixedLimiter::with_value(100, 90);
    assert!(limiter.add(11).is_err());
    assert!(limiter.add(10).is_ok());
    limiter.reset();
    assert_eq!(limiter.value(), 0);
}

#[test]
fn test_fixed_limiter_concurrent_adds_never_exceed_limit() {
    let limiter = std::sync::Arc::new(FixedLimiter::new(50));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let limiter = limiter.clone();
            std::thread::spawn(move || (0..20).filter(|_| limiter.add(1).is_ok()).count())
        })
        .collect();
    let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(accepted, 50);
    assert_eq!(limiter.value(), 50);
}

#[test]
fn test_rate_limiter_burst_then_replenish() {
    let limiter = RateLimiter::new(2, Duration::from_millis(200));
    assert!(limiter.allow());
    assert!(limiter.allow());
    assert!(!limiter.allow());

    std::thread::sleep(Duration::from_millis(220));
    assert!(limiter.allow());
    assert!(!limiter.allow());
}

#[test]
fn test_rate_limiter_zero_replenish_is_unlimited() {
    let limiter = RateLimiter::new(1, Duration::ZERO);
    for _ in 0..100 {
        assert!(limiter.allow());
    }
}

#[test]
fn test_rate_limiter_takes_bulk_tokens() {
    let limiter = RateLimiter::per_period(1000, Duration::from_secs(86_400));
    assert_eq!(limiter.burst(), 1000);
    assert!((limiter.replenish().as_secs_f64() - 86.4).abs() < 1e-6);
    assert_eq!(limiter.tokens(), 1000);

    assert!(limiter.allow_n(600));
    assert_eq!(limiter.tokens(), 400);
    assert!(!limiter.allow_n(500));
    assert_eq!(limiter.tokens(), 400);
    assert!(limiter.allow_n(400));
    assert_eq!(limiter.tokens(), 0);
    assert!(!limiter.allow());
}

#[test]
fn test_rate_limiter_zero_period_limit_is_unlimited() {
    let limiter = RateLimiter::per_period(0, Duration::from_secs(86_400));
    assert!(limiter.replenish().is_zero());
    assert!(limiter.allow_n(u64::MAX));
    assert!(limiter.allow_n(u64::MAX));
}

#[test]
fn test_random_string() {
    let s = random_string(12);
    assert_eq!(s.len(), 12);
    assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_ne!(s, random_string(12));
}

#[tokio::test]
async fn test_batching_queue_emits_on_batch_size() {
    let (queue, mut batches) = BatchingQueue::new(2, Duration::ZERO);
    queue.enqueue(1).unwrap();
    queue.enqueue(2).unwrap();
    queue.enqueue(3).unwrap();

    let batch = batches.recv().await.unwrap();
    assert_eq!(batch, vec![1, 2]);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.drain(), vec![3]);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_batching_queue_emits_on_timeout() {
    let (queue, mut batches) = BatchingQueue::new(100, Duration::from_millis(50));
    queue.enqueue("a").unwrap();
    queue.enqueue("b").unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(2), batches.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch, vec!["a", "b"]);
}

#[tokio::test]
async fn test_batching_queue_receiver_ends_after_drop() {
    let (queue, mut batches) = BatchingQueue::<u8>::new(0, Duration::from_millis(10));
    drop(queue);
    let next = tokio::time::timeout(Duration::from_secs(2), batches.recv())
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_batching_queue_close_hands_back_pending() {
    let (queue, mut batches) = BatchingQueue::new(2, Duration::from_millis(10));
    queue.enqueue(1).unwrap();
    queue.enqueue(2).unwrap();
    queue.enqueue(3).unwrap();

    assert_eq!(queue.close(), vec![3]);
    assert!(queue.is_empty());
    assert!(matches!(queue.enqueue(4), Err(Error::Storage(_))));

    // The batch emitted before closing is still delivered, then the receiver ends
    assert_eq!(batches.recv().await, Some(vec![1, 2]));
    let next = tokio::time::timeout(Duration::from_secs(2), batches.recv())
        .await
        .unwrap();
    assert!(next.is_none());
}

#[test]
fn test_error_is_quota() {
    assert!(Error::TooManyRequests.is_quota());
    assert!(Error::LimitReached.is_quota());
    assert!(Error::AttachmentTooLarge.is_quota());
    assert!(!Error::MessageNotFound.is_quota());
    assert!(!Error::InvalidTopic("a b".to_string()).is_quota());
}

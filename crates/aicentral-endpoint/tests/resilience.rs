mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use aicentral_endpoint::{
    BreakerConfig, Bulkhead, CircuitBreaker, ResilienceError, ResiliencyConfig,
    ResiliencyStrategy, UpstreamMethod, UpstreamRequest,
};

use support::{Scripted, ScriptedClient};

fn request() -> UpstreamRequest {
    UpstreamRequest {
        method: UpstreamMethod::Post,
        url: "https://east.example.com/v1/chat/completions".to_string(),
        headers: vec![],
        body: aicentral_endpoint::RequestBody::Bytes(Bytes::from_static(b"{}")),
        want_stream: false,
    }
}

fn reply(status: u16) -> Scripted {
    Scripted::Reply {
        status,
        headers: vec![],
        body: Bytes::from_static(b"{}"),
    }
}

#[test]
fn breaker_opens_on_failure_ratio_and_fails_fast() {
    let breaker = CircuitBreaker::new(
        "east",
        BreakerConfig {
            failure_ratio: 0.5,
            sampling_window: Duration::from_secs(5),
            min_throughput: 4,
            break_duration: Duration::from_secs(30),
        },
    );

    for _ in 0..2 {
        assert!(breaker.try_pass());
        breaker.record(true);
    }
    // Two failures bring the ratio to exactly 0.5 over four samples.
    for _ in 0..2 {
        assert!(breaker.try_pass());
        breaker.record(false);
    }

    assert!(breaker.is_open());
    assert!(!breaker.try_pass());
}

#[test]
fn breaker_half_open_probe_recovers() {
    let breaker = CircuitBreaker::new(
        "east",
        BreakerConfig {
            failure_ratio: 0.5,
            sampling_window: Duration::from_secs(5),
            min_throughput: 2,
            break_duration: Duration::from_millis(40),
        },
    );
    breaker.record(false);
    breaker.record(false);
    assert!(!breaker.try_pass());

    std::thread::sleep(Duration::from_millis(60));
    // First probe is admitted, a second concurrent call is not.
    assert!(breaker.try_pass());
    assert!(!breaker.try_pass());
    breaker.record(true);
    assert!(breaker.try_pass());
}

#[tokio::test]
async fn retry_recovers_from_a_transient_transport_error() {
    let client = ScriptedClient::new(vec![Scripted::TransportError, reply(200)]);
    let strategy = ResiliencyStrategy::new(
        "east",
        ResiliencyConfig {
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            ..ResiliencyConfig::default()
        },
    );

    let response = strategy.execute(client.as_ref(), request()).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(client.call_count(), 2);
}

#[tokio::test]
async fn retry_treats_429_as_transient_until_attempts_run_out() {
    let client = ScriptedClient::new(vec![reply(429), reply(429), reply(429)]);
    let strategy = ResiliencyStrategy::new(
        "east",
        ResiliencyConfig {
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            ..ResiliencyConfig::default()
        },
    );

    let response = strategy.execute(client.as_ref(), request()).await.unwrap();
    assert_eq!(response.status, 429);
    assert_eq!(client.call_count(), 3);
}

#[tokio::test]
async fn open_breaker_blocks_without_a_network_attempt() {
    let client = ScriptedClient::new(vec![Scripted::TransportError, Scripted::TransportError]);
    let strategy = ResiliencyStrategy::new(
        "east",
        ResiliencyConfig {
            retry_max_attempts: 1,
            retry_base_delay: Duration::from_millis(1),
            breaker: BreakerConfig {
                failure_ratio: 0.5,
                sampling_window: Duration::from_secs(5),
                min_throughput: 2,
                break_duration: Duration::from_secs(30),
            },
            ..ResiliencyConfig::default()
        },
    );

    for _ in 0..2 {
        let err = strategy.execute(client.as_ref(), request()).await;
        assert!(matches!(err, Err(ResilienceError::Transport(_))));
    }
    assert_eq!(client.call_count(), 2);

    let err = strategy.execute(client.as_ref(), request()).await;
    assert!(matches!(err, Err(ResilienceError::BreakerOpen)));
    assert_eq!(client.call_count(), 2);
}

#[tokio::test]
async fn bulkhead_rejects_beyond_the_queue_bound() {
    let bulkhead = Arc::new(Bulkhead::new(1, 0));

    let first = bulkhead.acquire().await.unwrap();
    // Queue bound is zero, so a second caller is rejected immediately.
    assert!(bulkhead.acquire().await.is_none());

    drop(first);
    assert!(bulkhead.acquire().await.is_some());
}

#[tokio::test]
async fn bulkhead_queues_up_to_the_bound() {
    let bulkhead = Arc::new(Bulkhead::new(1, 1));
    let first = bulkhead.acquire().await.unwrap();

    let waiter = {
        let bulkhead = bulkhead.clone();
        tokio::spawn(async move { bulkhead.acquire().await.is_some() })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    // One waiter is parked; the next caller overflows the queue.
    assert!(bulkhead.acquire().await.is_none());

    drop(first);
    assert!(waiter.await.unwrap());
}

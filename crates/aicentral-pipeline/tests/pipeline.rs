mod support;

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;

use aicentral_endpoint::NoopUsageSink;
use aicentral_pipeline::{
    AffinityStep, ClientKeyEntry, ClientKeyStep, EndpointSelector, FixedWindowRateLimiterStep,
    PartitionScope, Pipeline, PipelineStep, RandomSelector, RouteTarget, SingleSelector,
    TokenRateLimiterStep,
};

use support::{Behavior, chat_call, endpoint, request_context, request_context_with_key};

fn single_endpoint_pipeline(
    steps: Vec<Arc<dyn PipelineStep>>,
) -> (Pipeline, Arc<support::StaticClient>) {
    let (target, client) = endpoint("east", Behavior::Healthy {
        delay: Duration::ZERO,
        total_tokens: 25,
    });
    let selector = Arc::new(EndpointSelector::Single(SingleSelector::new(
        "only",
        RouteTarget::Leaf(target),
    )));
    (
        Pipeline::new("main", steps, selector, Arc::new(NoopUsageSink)),
        client,
    )
}

#[tokio::test]
async fn buffered_responses_carry_the_serving_endpoint_header() {
    let (pipeline, _) = single_endpoint_pipeline(vec![]);
    let (ctx, head_rx, mut body_rx) = request_context();

    let response = pipeline.execute(&ctx, chat_call("c1")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let head = head_rx.await.unwrap();
    assert_eq!(
        head.headers
            .get("x-aicentral-server")
            .and_then(|v| v.to_str().ok()),
        Some("east")
    );
    drop(ctx);
    let chunk = body_rx.recv().await.unwrap().unwrap();
    assert!(!chunk.is_empty());
}

#[tokio::test]
async fn unknown_client_key_short_circuits_before_dispatch() {
    let step = Arc::new(ClientKeyStep::new(vec![ClientKeyEntry {
        name: "good".to_string(),
        key: "good-key".to_string(),
    }]));
    let (pipeline, client) = single_endpoint_pipeline(vec![step]);

    let (ctx, _head, _body) = request_context_with_key(Some("wrong-key"));
    let response = pipeline.execute(&ctx, chat_call("anon")).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(client.call_count(), 0);
    assert!(response.usage.endpoint.is_none());
}

#[tokio::test]
async fn known_client_key_flows_through_with_identity() {
    let step = Arc::new(ClientKeyStep::new(vec![ClientKeyEntry {
        name: "good".to_string(),
        key: "good-key".to_string(),
    }]));
    let (pipeline, client) = single_endpoint_pipeline(vec![step]);

    let (ctx, _head, _body) = request_context_with_key(Some("good-key"));
    // No client pre-attached; the auth step supplies it.
    let call = aicentral_endpoint::CallDetails::new(
        aicentral_protocol::CallKind::Chat,
        None,
        aicentral_endpoint::CallBody::Json(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
        })),
    );
    let response = pipeline.execute(&ctx, call).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(client.call_count(), 1);
    assert_eq!(
        response.usage.client.as_ref().map(|c| c.name.as_str()),
        Some("good")
    );
}

#[tokio::test]
async fn fixed_window_limits_then_recovers() {
    let step = Arc::new(FixedWindowRateLimiterStep::new(
        2,
        Duration::from_millis(150),
        PartitionScope::Client,
    ));
    let (pipeline, client) = single_endpoint_pipeline(vec![step]);

    for _ in 0..2 {
        let (ctx, _head, _body) = request_context();
        let response = pipeline.execute(&ctx, chat_call("c1")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Third request in the same window is rejected with a Retry-After.
    let (ctx, head_rx, _body) = request_context();
    let response = pipeline.execute(&ctx, chat_call("c1")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let head = head_rx.await.unwrap();
    assert!(head.headers.get("retry-after").is_some());
    assert_eq!(client.call_count(), 2);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let (ctx, _head, _body) = request_context();
    let response = pipeline.execute(&ctx, chat_call("c1")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn fixed_window_partitions_are_independent_per_client() {
    let step = Arc::new(FixedWindowRateLimiterStep::new(
        1,
        Duration::from_secs(60),
        PartitionScope::Client,
    ));
    let (pipeline, _) = single_endpoint_pipeline(vec![step]);

    let (ctx, _head, _body) = request_context();
    assert_eq!(
        pipeline.execute(&ctx, chat_call("c1")).await.status(),
        StatusCode::OK
    );
    let (ctx, _head, _body) = request_context();
    assert_eq!(
        pipeline.execute(&ctx, chat_call("c1")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    // A different client still has budget.
    let (ctx, _head, _body) = request_context();
    assert_eq!(
        pipeline.execute(&ctx, chat_call("c2")).await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn token_limiter_deducts_consumption_and_never_goes_negative() {
    // Each healthy call reports 25 consumed tokens against a budget of 30.
    let step = Arc::new(TokenRateLimiterStep::new(
        30,
        Duration::from_secs(60),
        PartitionScope::Client,
    ));
    let step_handle = step.clone();
    let (pipeline, _) = single_endpoint_pipeline(vec![step]);

    let (ctx, head_rx, _body) = request_context();
    assert_eq!(
        pipeline.execute(&ctx, chat_call("c1")).await.status(),
        StatusCode::OK
    );
    let head = head_rx.await.unwrap();
    let remaining: i64 = head
        .headers
        .get("x-ratelimit-remaining-tokens")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap();
    assert_eq!(remaining, 5);

    // Second call overshoots the window; the deduction clamps at zero.
    let (ctx, head_rx, _body) = request_context();
    assert_eq!(
        pipeline.execute(&ctx, chat_call("c1")).await.status(),
        StatusCode::OK
    );
    let head = head_rx.await.unwrap();
    let remaining: i64 = head
        .headers
        .get("x-ratelimit-remaining-tokens")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap();
    assert_eq!(remaining, 0);
    assert_eq!(step_handle.remaining("c1"), 0);

    // Exhausted partition short-circuits with 429.
    let (ctx, _head, _body) = request_context();
    assert_eq!(
        pipeline.execute(&ctx, chat_call("c1")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    // An unrelated client is untouched.
    let (ctx, _head, _body) = request_context();
    assert_eq!(
        pipeline.execute(&ctx, chat_call("c2")).await.status(),
        StatusCode::OK
    );
    assert_eq!(step_handle.remaining("c2"), 5);
}

#[tokio::test]
async fn failover_is_reported_through_response_headers() {
    let (p1, _) = endpoint("primary-1", Behavior::Unreachable);
    let (p2, _) = endpoint("primary-2", Behavior::Unreachable);
    let (f1, _) = endpoint("fallback-1", Behavior::Healthy {
        delay: Duration::ZERO,
        total_tokens: 10,
    });
    let selector = Arc::new(EndpointSelector::Priority(
        aicentral_pipeline::PrioritySelector::new(
            "tiered",
            vec![RouteTarget::Leaf(p1), RouteTarget::Leaf(p2)],
            vec![RouteTarget::Leaf(f1)],
        ),
    ));
    let pipeline = Pipeline::new("main", vec![], selector, Arc::new(NoopUsageSink));

    let (ctx, head_rx, _body) = request_context();
    let response = pipeline.execute(&ctx, chat_call("c1")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let head = head_rx.await.unwrap();
    assert_eq!(
        head.headers
            .get("x-aicentral-server")
            .and_then(|v| v.to_str().ok()),
        Some("fallback-1")
    );
    let failed = head
        .headers
        .get("x-aicentral-failed-servers")
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert!(failed.contains("primary-1"));
    assert!(failed.contains("primary-2"));
}

#[tokio::test]
async fn affinity_sticks_to_the_last_successful_endpoint() {
    let (a, _) = endpoint("a", Behavior::Healthy {
        delay: Duration::ZERO,
        total_tokens: 10,
    });
    let (b, _) = endpoint("b", Behavior::Healthy {
        delay: Duration::ZERO,
        total_tokens: 10,
    });
    let selector = Arc::new(EndpointSelector::Random(RandomSelector::new(
        "pair",
        vec![RouteTarget::Leaf(a), RouteTarget::Leaf(b)],
    )));
    let affinity: Arc<dyn PipelineStep> = Arc::new(AffinityStep::new(Duration::from_secs(60)));
    let pipeline = Pipeline::new("main", vec![affinity], selector, Arc::new(NoopUsageSink));

    let (ctx, _head, _body) = request_context();
    let first = pipeline.execute(&ctx, chat_call("c1")).await;
    let chosen = first.usage.endpoint.clone().unwrap();

    for _ in 0..10 {
        let (ctx, _head, _body) = request_context();
        let response = pipeline.execute(&ctx, chat_call("c1")).await;
        assert_eq!(response.usage.endpoint.as_deref(), Some(chosen.as_str()));
    }
}

#[tokio::test]
async fn affinity_expires_after_its_ttl() {
    let (a, _) = endpoint("a", Behavior::Healthy {
        delay: Duration::ZERO,
        total_tokens: 10,
    });
    let selector = Arc::new(EndpointSelector::Single(SingleSelector::new(
        "only",
        RouteTarget::Leaf(a),
    )));
    let affinity = Arc::new(AffinityStep::new(Duration::from_millis(30)));
    let affinity_step: Arc<dyn PipelineStep> = affinity;
    let pipeline = Pipeline::new("main", vec![affinity_step], selector, Arc::new(NoopUsageSink));

    let (ctx, _head, _body) = request_context();
    pipeline.execute(&ctx, chat_call("c1")).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    // Entry has lapsed; the call still routes normally.
    let (ctx, _head, _body) = request_context();
    let response = pipeline.execute(&ctx, chat_call("c1")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

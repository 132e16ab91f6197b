//! HTTP surface for aicentral.
//!
//! Mirrors the upstream vendors' API shapes — Azure's
//! `/openai/deployments/{deployment}/...` paths and OpenAI's `/v1/...` paths —
//! parses each request into a `CallDetails`, and runs it through the gateway
//! pipeline. The pipeline executes in its own task writing through a client
//! sink, so streamed responses start reaching the caller before the backend
//! finishes.

use std::net::IpAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Multipart, Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use aicentral_common::new_trace_id;
use aicentral_endpoint::{
    AFFINITY_HEADER, AFFINITY_QUERY_PARAM, CallBody, CallDetails, ClientSink, FormPart,
    InboundAuth, RequestContext,
};
use aicentral_pipeline::Pipeline;
use aicentral_protocol::CallKind;

#[derive(Clone)]
pub struct GatewayState {
    pipeline: Arc<Pipeline>,
    public_host: String,
}

pub fn gateway_router(pipeline: Arc<Pipeline>, public_host: impl Into<String>) -> Router {
    let state = GatewayState {
        pipeline,
        public_host: public_host.into(),
    };

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        // Azure shape: deployment in the path.
        .route(
            "/openai/deployments/{deployment}/chat/completions",
            post(azure_chat),
        )
        .route(
            "/openai/deployments/{deployment}/completions",
            post(azure_completions),
        )
        .route(
            "/openai/deployments/{deployment}/embeddings",
            post(azure_embeddings),
        )
        .route(
            "/openai/deployments/{deployment}/images/generations",
            post(azure_images),
        )
        .route(
            "/openai/deployments/{deployment}/audio/transcriptions",
            post(azure_transcriptions),
        )
        .route(
            "/openai/deployments/{deployment}/audio/translations",
            post(azure_translations),
        )
        // OpenAI shape: model in the body.
        .route("/v1/chat/completions", post(v1_chat))
        .route("/v1/completions", post(v1_completions))
        .route("/v1/embeddings", post(v1_embeddings))
        .route(
            "/v1/images/generations",
            post(v1_images),
        )
        .route(
            "/v1/audio/transcriptions",
            post(v1_transcriptions),
        )
        .route(
            "/v1/audio/translations",
            post(v1_translations),
        )
        .with_state(state)
}

async fn azure_chat(
    State(state): State<GatewayState>,
    Path(deployment): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    json_call(state, CallKind::Chat, Some(deployment), query, headers, body).await
}

async fn azure_completions(
    State(state): State<GatewayState>,
    Path(deployment): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    json_call(state, CallKind::Completions, Some(deployment), query, headers, body).await
}

async fn azure_embeddings(
    State(state): State<GatewayState>,
    Path(deployment): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    json_call(state, CallKind::Embeddings, Some(deployment), query, headers, body).await
}

async fn azure_images(
    State(state): State<GatewayState>,
    Path(deployment): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    json_call(
        state,
        CallKind::ImageGeneration,
        Some(deployment),
        query,
        headers,
        body,
    )
    .await
}

async fn azure_transcriptions(
    State(state): State<GatewayState>,
    Path(deployment): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    multipart_call(
        state,
        CallKind::Transcription,
        Some(deployment),
        query,
        headers,
        multipart,
    )
    .await
}

async fn azure_translations(
    State(state): State<GatewayState>,
    Path(deployment): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    multipart_call(
        state,
        CallKind::Translation,
        Some(deployment),
        query,
        headers,
        multipart,
    )
    .await
}

async fn v1_chat(
    State(state): State<GatewayState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    json_call(state, CallKind::Chat, None, query, headers, body).await
}

async fn v1_completions(
    State(state): State<GatewayState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    json_call(state, CallKind::Completions, None, query, headers, body).await
}

async fn v1_embeddings(
    State(state): State<GatewayState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    json_call(state, CallKind::Embeddings, None, query, headers, body).await
}

async fn v1_images(
    State(state): State<GatewayState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    json_call(state, CallKind::ImageGeneration, None, query, headers, body).await
}

async fn v1_transcriptions(
    State(state): State<GatewayState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    multipart_call(state, CallKind::Transcription, None, query, headers, multipart).await
}

async fn v1_translations(
    State(state): State<GatewayState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    multipart_call(state, CallKind::Translation, None, query, headers, multipart).await
}

async fn json_call(
    state: GatewayState,
    kind: CallKind,
    deployment: Option<String>,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let parsed = if body.is_empty() {
        CallBody::Empty
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => CallBody::Json(value),
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    format!("invalid json body: {err}"),
                )
                    .into_response();
            }
        }
    };
    run_call(state, kind, deployment, query, headers, parsed).await
}

async fn multipart_call(
    state: GatewayState,
    kind: CallKind,
    deployment: Option<String>,
    query: Option<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let mut parts = Vec::new();
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let name = field.name().unwrap_or_default().to_string();
                let filename = field.file_name().map(|value| value.to_string());
                let content_type = field.content_type().map(|value| value.to_string());
                match field.bytes().await {
                    Ok(data) => parts.push(FormPart {
                        name,
                        filename,
                        content_type,
                        data,
                    }),
                    Err(err) => {
                        return (
                            StatusCode::BAD_REQUEST,
                            format!("invalid multipart field: {err}"),
                        )
                            .into_response();
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    format!("invalid multipart body: {err}"),
                )
                    .into_response();
            }
        }
    }
    run_call(
        state,
        kind,
        deployment,
        query,
        headers,
        CallBody::Multipart(parts),
    )
    .await
}

async fn run_call(
    state: GatewayState,
    kind: CallKind,
    deployment: Option<String>,
    query: Option<String>,
    headers: HeaderMap,
    body: CallBody,
) -> Response {
    let trace_id = new_trace_id();
    let preferred = affinity_marker(&headers, query.as_deref());
    let forward_query = strip_gateway_params(query);

    let call = CallDetails::new(kind, deployment, body)
        .with_query(forward_query)
        .with_preferred_endpoint(preferred);

    let (sink, head_rx, body_rx) = ClientSink::channel();
    let ctx = RequestContext::new(
        trace_id.clone(),
        client_addr(&headers),
        state.public_host.clone(),
        inbound_auth(&headers),
        sink,
    );

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        pipeline.execute(&ctx, call).await;
    });

    match head_rx.await {
        Ok(head) => {
            let stream = ReceiverStream::new(body_rx);
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() = head.status;
            *response.headers_mut() = head.headers;
            response
        }
        Err(_) => {
            // The pipeline task died before producing a head; surface a 502
            // rather than dropping the connection.
            warn!(event = "pipeline_aborted", trace_id = %trace_id);
            (StatusCode::BAD_GATEWAY, "gateway pipeline failed").into_response()
        }
    }
}

fn inbound_auth(headers: &HeaderMap) -> InboundAuth {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let presented_key = headers
        .get("api-key")
        .or_else(|| headers.get("x-api-key"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            let value = authorization.as_deref()?;
            let prefix = "Bearer ";
            if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
                let token = value[prefix.len()..].trim();
                (!token.is_empty()).then(|| token.to_string())
            } else {
                None
            }
        });

    InboundAuth {
        presented_key,
        authorization,
    }
}

/// Session affinity marker: header first, then the query parameter planted by
/// rewritten polling locations.
fn affinity_marker(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers
        .get(AFFINITY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return Some(value.to_string());
    }
    let query = query?;
    let pairs = serde_urlencoded::from_str::<Vec<(String, String)>>(query).ok()?;
    pairs
        .into_iter()
        .find(|(key, _)| key == AFFINITY_QUERY_PARAM)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// Drops gateway-only parameters before the query is forwarded downstream.
fn strip_gateway_params(query: Option<String>) -> Option<String> {
    let query = query?;
    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(&query) else {
        return Some(query);
    };
    let filtered: Vec<(String, String)> = pairs
        .into_iter()
        .filter(|(key, _)| key != AFFINITY_QUERY_PARAM)
        .collect();
    if filtered.is_empty() {
        return None;
    }
    serde_urlencoded::to_string(&filtered).ok()
}

fn client_addr(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn inbound_auth_prefers_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("api-key", HeaderValue::from_static("k1"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok"),
        );
        let auth = inbound_auth(&headers);
        assert_eq!(auth.presented_key.as_deref(), Some("k1"));
        assert_eq!(auth.authorization.as_deref(), Some("Bearer tok"));
    }

    #[test]
    fn inbound_auth_falls_back_to_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("bearer tok-2"),
        );
        let auth = inbound_auth(&headers);
        assert_eq!(auth.presented_key.as_deref(), Some("tok-2"));
    }

    #[test]
    fn affinity_marker_reads_header_then_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AFFINITY_HEADER, HeaderValue::from_static("east"));
        assert_eq!(
            affinity_marker(&headers, Some("ai-central-endpoint-affinity=west")),
            Some("east".to_string())
        );
        assert_eq!(
            affinity_marker(&HeaderMap::new(), Some("ai-central-endpoint-affinity=west")),
            Some("west".to_string())
        );
        assert_eq!(affinity_marker(&HeaderMap::new(), None), None);
    }

    #[test]
    fn gateway_params_are_stripped_from_forwarded_queries() {
        let stripped = strip_gateway_params(Some(
            "api-version=2024-02-01&ai-central-endpoint-affinity=east".to_string(),
        ));
        assert_eq!(stripped.as_deref(), Some("api-version=2024-02-01"));
        assert_eq!(
            strip_gateway_params(Some("ai-central-endpoint-affinity=east".to_string())),
            None
        );
    }

    #[test]
    fn forwarded_for_parses_the_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(
            client_addr(&headers),
            Some("203.0.113.9".parse::<IpAddr>().unwrap())
        );
    }
}

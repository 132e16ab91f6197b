use std::time::{Duration, SystemTime};

use http::{HeaderMap, HeaderName, HeaderValue};

pub type Headers = Vec<(String, String)>;

pub const SERVER_HEADER: &str = "x-aicentral-server";
pub const FAILED_SERVERS_HEADER: &str = "x-aicentral-failed-servers";
pub const AFFINITY_HEADER: &str = "x-aicentral-affinity";
pub const AFFINITY_QUERY_PARAM: &str = "ai-central-endpoint-affinity";
pub const REMAINING_REQUESTS_HEADER: &str = "x-ratelimit-remaining-requests";
pub const REMAINING_TOKENS_HEADER: &str = "x-ratelimit-remaining-tokens";

/// Downstream header prefixes that are safe to copy back to the client.
/// Everything else (connection management, auth echoes, cookies) is dropped.
const FORWARD_PREFIXES: &[&str] = &[
    "x-ratelimit-",
    "openai-",
    "apim-request-id",
    "x-ms-region",
    "x-request-id",
    "content-type",
    "retry-after",
];

const POLL_LOCATION_HEADERS: &[&str] = &["operation-location", "azure-asyncoperation"];

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    let key = name.to_ascii_lowercase();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    let key = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
        .map(|(_, v)| v.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let key = name.to_ascii_lowercase();
    let idx = headers
        .iter()
        .position(|(k, _)| k.to_ascii_lowercase() == key)?;
    Some(headers.remove(idx).1)
}

pub fn headers_to_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

/// Sanitized view of a downstream response, plus the routing hints the rate
/// limiters and affinity step care about.
#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata {
    pub sanitized: Headers,
    /// Set when the response points at a polling location, meaning follow-up
    /// requests must land on the same endpoint.
    pub requires_affinity: bool,
    pub remaining_tokens: Option<u64>,
    pub remaining_requests: Option<u64>,
}

/// Filters downstream headers through the allow-list and rewrites polling
/// locations so the client's next request comes back through the gateway,
/// tagged with the endpoint that owns the operation.
pub fn extract_metadata(headers: &Headers, endpoint: &str, gateway_host: &str) -> ResponseMetadata {
    let mut sanitized = Headers::new();
    let mut requires_affinity = false;

    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if POLL_LOCATION_HEADERS.contains(&lower.as_str()) {
            sanitized.push((
                name.clone(),
                rewrite_poll_location(value, endpoint, gateway_host),
            ));
            requires_affinity = true;
            continue;
        }
        if FORWARD_PREFIXES
            .iter()
            .any(|prefix| lower.starts_with(prefix))
        {
            sanitized.push((name.clone(), value.clone()));
        }
    }

    ResponseMetadata {
        remaining_tokens: parse_u64(header_get(headers, REMAINING_TOKENS_HEADER)),
        remaining_requests: parse_u64(header_get(headers, REMAINING_REQUESTS_HEADER)),
        sanitized,
        requires_affinity,
    }
}

fn parse_u64(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse().ok())
}

fn rewrite_poll_location(location: &str, endpoint: &str, gateway_host: &str) -> String {
    let rebased = match location.find("://") {
        Some(scheme_end) => {
            let rest = &location[scheme_end + 3..];
            let path = rest.find('/').map(|idx| &rest[idx..]).unwrap_or("");
            format!("https://{gateway_host}{path}")
        }
        None => location.to_string(),
    };
    let separator = if rebased.contains('?') { '&' } else { '?' };
    format!("{rebased}{separator}{AFFINITY_QUERY_PARAM}={endpoint}")
}

/// `Retry-After` as a duration: either delta-seconds or an HTTP-date.
pub fn retry_after(headers: &Headers) -> Option<Duration> {
    let value = header_get(headers, "retry-after")?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    if let Ok(when) = httpdate::parse_http_date(value) {
        return when.duration_since(SystemTime::now()).ok();
    }
    None
}

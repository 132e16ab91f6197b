use crate::context::RequestContext;
use crate::headers::{Headers, header_remove, header_set};

/// Applies endpoint credentials to an outgoing request.
///
/// Invoked by every dispatcher just before send. Implementations must make
/// sure no inbound client credential leaks downstream unless that is exactly
/// what they are for.
pub trait AuthHandler: Send + Sync {
    fn apply(&self, ctx: &RequestContext, headers: &mut Headers);
}

/// Azure OpenAI style: `api-key` header.
#[derive(Debug, Clone)]
pub struct ApiKeyAuth {
    key: String,
}

impl ApiKeyAuth {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl AuthHandler for ApiKeyAuth {
    fn apply(&self, _ctx: &RequestContext, headers: &mut Headers) {
        header_remove(headers, "authorization");
        header_set(headers, "api-key", self.key.clone());
    }
}

/// OpenAI style: `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct BearerTokenAuth {
    token: String,
}

impl BearerTokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AuthHandler for BearerTokenAuth {
    fn apply(&self, _ctx: &RequestContext, headers: &mut Headers) {
        header_remove(headers, "api-key");
        header_set(headers, "authorization", format!("Bearer {}", self.token));
    }
}

/// Forwards whatever credential the client presented. Useful when the gateway
/// fronts a backend that shares the client's key space.
#[derive(Debug, Clone, Default)]
pub struct PassThroughAuth;

impl AuthHandler for PassThroughAuth {
    fn apply(&self, ctx: &RequestContext, headers: &mut Headers) {
        if let Some(authorization) = &ctx.inbound_auth.authorization {
            header_set(headers, "authorization", authorization.clone());
        } else if let Some(key) = &ctx.inbound_auth.presented_key {
            header_set(headers, "api-key", key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ClientSink, InboundAuth};
    use crate::headers::header_get;

    fn ctx_with_auth(auth: InboundAuth) -> RequestContext {
        let (sink, _head, _body) = ClientSink::channel();
        RequestContext::new("t".to_string(), None, "gw".to_string(), auth, sink)
    }

    #[test]
    fn api_key_auth_strips_client_authorization() {
        let ctx = ctx_with_auth(InboundAuth::default());
        let mut headers = vec![("authorization".to_string(), "Bearer client".to_string())];
        ApiKeyAuth::new("secret").apply(&ctx, &mut headers);
        assert_eq!(header_get(&headers, "api-key"), Some("secret"));
        assert!(header_get(&headers, "authorization").is_none());
    }

    #[test]
    fn bearer_auth_sets_authorization() {
        let ctx = ctx_with_auth(InboundAuth::default());
        let mut headers = Headers::new();
        BearerTokenAuth::new("tok").apply(&ctx, &mut headers);
        assert_eq!(header_get(&headers, "authorization"), Some("Bearer tok"));
    }

    #[test]
    fn pass_through_forwards_the_inbound_credential() {
        let ctx = ctx_with_auth(InboundAuth {
            presented_key: Some("key".to_string()),
            authorization: None,
        });
        let mut headers = Headers::new();
        PassThroughAuth.apply(&ctx, &mut headers);
        assert_eq!(header_get(&headers, "api-key"), Some("key"));
    }
}

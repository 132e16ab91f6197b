use bytes::Bytes;
use serde_json::Value;

use aicentral_common::ClientIdentity;
use aicentral_protocol::{CallKind, usage};

/// One field of a multipart form body, kept verbatim so audio requests can be
/// rebuilt field-by-field for the chosen backend.
#[derive(Debug, Clone)]
pub struct FormPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub enum CallBody {
    Json(Value),
    Multipart(Vec<FormPart>),
    Empty,
}

impl CallBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            CallBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// The parsed inbound call, threaded through every pipeline step.
///
/// Immutable once constructed; steps that need to change it build a modified
/// copy via the `with_*` helpers instead of mutating shared state.
#[derive(Debug, Clone)]
pub struct CallDetails {
    pub kind: CallKind,
    /// Deployment (Azure path shape) or model (OpenAI body shape) the client
    /// asked for.
    pub deployment: Option<String>,
    pub body: CallBody,
    /// Query string to forward downstream, already stripped of gateway-only
    /// parameters.
    pub query: Option<String>,
    pub client: Option<ClientIdentity>,
    pub preferred_endpoint: Option<String>,
}

impl CallDetails {
    pub fn new(kind: CallKind, deployment: Option<String>, body: CallBody) -> Self {
        let deployment = deployment.or_else(|| match &body {
            CallBody::Json(value) => usage::model_from_body(value),
            CallBody::Multipart(parts) => parts
                .iter()
                .find(|part| part.name == "model")
                .map(|part| String::from_utf8_lossy(&part.data).trim().to_string())
                .filter(|model| !model.is_empty()),
            CallBody::Empty => None,
        });
        Self {
            kind,
            deployment,
            body,
            query: None,
            client: None,
            preferred_endpoint: None,
        }
    }

    pub fn with_query(&self, query: Option<String>) -> Self {
        let mut copy = self.clone();
        copy.query = query;
        copy
    }

    pub fn with_client(&self, client: ClientIdentity) -> Self {
        let mut copy = self.clone();
        copy.client = Some(client);
        copy
    }

    pub fn with_preferred_endpoint(&self, endpoint: Option<String>) -> Self {
        let mut copy = self.clone();
        copy.preferred_endpoint = endpoint;
        copy
    }

    /// Rate-limit/affinity partition key for this caller.
    pub fn partition_key(&self) -> String {
        self.client
            .as_ref()
            .map(|client| client.id.clone())
            .unwrap_or_else(|| "anonymous".to_string())
    }

    /// Whether the client asked for a streamed response.
    pub fn wants_stream(&self) -> bool {
        self.body
            .as_json()
            .and_then(|body| body.get("stream"))
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
    }

    /// The prompt-bearing text of the request, used for streamed-response
    /// token estimation.
    pub fn prompt_text(&self) -> Option<String> {
        let body = self.body.as_json()?;
        usage::prompt_text(self.kind, body)
    }
}

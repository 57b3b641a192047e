//! The application router contract.
//!
//! The transport stays ignorant of what the carried requests mean. After
//! decrypting a `request` frame it hands `(method, path, headers, body)` to
//! an [`AppRouter`] and forwards whatever comes back as the `response`
//! frame. Router failures are ordinary responses with an error status; there
//! is no exceptional channel on the wire.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use homelink_types::messages::Method;

/// A decrypted application request, as seen by the router.
#[derive(Debug, Clone)]
pub struct RouterRequest {
    /// Request method.
    pub method: Method,
    /// URL path.
    pub path: String,
    /// Optional header map.
    pub headers: Option<BTreeMap<String, String>>,
    /// JSON body or pre-encoded scalar.
    pub body: Option<Value>,
    /// The authenticated username the request arrived under.
    pub username: String,
}

/// The router's answer, sent back as a `response` frame.
#[derive(Debug, Clone)]
pub struct RouterResponse {
    /// HTTP-like status code.
    pub status: u16,
    /// Optional header map.
    pub headers: Option<BTreeMap<String, String>>,
    /// JSON body.
    pub body: Option<Value>,
}

impl RouterResponse {
    /// A `200` response with the given body.
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            headers: None,
            body: Some(body),
        }
    }

    /// A bodyless response with the given status.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: None,
            body: None,
        }
    }
}

/// Dispatch target for decrypted application requests.
///
/// Implementations are the surrounding system's REST surface; the transport
/// calls them concurrently (bounded per connection) and may abandon a call
/// when the connection closes.
#[async_trait]
pub trait AppRouter: Send + Sync {
    /// Handles one request. Errors are expressed as `status >= 400`.
    async fn handle(&self, request: RouterRequest) -> RouterResponse;
}

/// Shared handle to the application router.
pub type AppRouterService = Arc<dyn AppRouter>;

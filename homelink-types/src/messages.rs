//! Application protocol messages.
//!
//! After authentication every frame is an envelope; JSON payloads (formats
//! `0x01` and `0x03`) carry one [`AppMessage`]. The union multiplexes three
//! independent exchanges over one socket: request/response, subscriptions
//! with cursor-addressable events, and chunked uploads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::PayloadFormat;

/// HTTP-like methods understood by the application router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// GET
    #[serde(rename = "GET")]
    Get,
    /// POST
    #[serde(rename = "POST")]
    Post,
    /// PUT
    #[serde(rename = "PUT")]
    Put,
    /// DELETE
    #[serde(rename = "DELETE")]
    Delete,
    /// PATCH
    #[serde(rename = "PATCH")]
    Patch,
}

/// Event channels a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Events scoped to one agent session; takes a `sessionId` parameter.
    Session,
    /// Global activity feed.
    Activity,
}

/// Descriptor of a completed upload, as handed back by the upload store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    /// The upload id the file was transferred under.
    pub id: Uuid,
    /// Project the file belongs to.
    pub project_id: String,
    /// Agent session the file belongs to.
    pub session_id: String,
    /// Original filename as sent by the client.
    pub filename: String,
    /// Final size in bytes.
    pub size: u64,
    /// Declared MIME type.
    pub mime_type: String,
    /// Store-relative path of the promoted file.
    pub path: String,
}

/// The application message union carried inside JSON envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppMessage {
    /// HTTP-like request. `id` is client-invented and opaque to the server.
    #[serde(rename_all = "camelCase")]
    Request {
        /// Correlation id, echoed on the response.
        id: Uuid,
        /// Request method.
        method: Method,
        /// URL path as seen by the application router.
        path: String,
        /// Optional header map.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<BTreeMap<String, String>>,
        /// JSON body or pre-encoded scalar.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
    /// Response to a [`AppMessage::Request`]; delivered exactly once, errors
    /// included (no exceptional channel).
    #[serde(rename_all = "camelCase")]
    Response {
        /// The id of the request being answered.
        id: Uuid,
        /// HTTP-like status code.
        status: u16,
        /// Optional header map.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<BTreeMap<String, String>>,
        /// JSON body.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
    /// Opens a subscription on a channel.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        /// Client-chosen id, unique per connection lifetime.
        subscription_id: Uuid,
        /// The channel to subscribe to.
        channel: Channel,
        /// Scope parameter for [`Channel::Session`].
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Resume cursor: replay retained events strictly after this id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_event_id: Option<u64>,
    },
    /// Tears down a subscription. Unknown ids are a protocol violation.
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        /// The subscription to stop.
        subscription_id: Uuid,
    },
    /// One event on a subscription.
    #[serde(rename_all = "camelCase")]
    Event {
        /// The subscription this event belongs to.
        subscription_id: Uuid,
        /// Channel-specific event kind; `connected` and `heartbeat` are
        /// emitted by the transport itself.
        event_type: String,
        /// Monotonically increasing per-channel cursor. Absent on synthetic
        /// transport events.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<u64>,
        /// Opaque event payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// Announces an upload and reserves a write slot.
    #[serde(rename_all = "camelCase")]
    UploadStart {
        /// Client-chosen 128-bit id, unique per connection.
        upload_id: Uuid,
        /// Project the file belongs to.
        project_id: String,
        /// Agent session the file belongs to.
        session_id: String,
        /// Filename to store under.
        filename: String,
        /// Total size in bytes; chunks must add up to exactly this.
        size: u64,
        /// Declared MIME type.
        mime_type: String,
    },
    /// Ends an upload; the server finalizes iff all declared bytes arrived.
    #[serde(rename_all = "camelCase")]
    UploadEnd {
        /// The upload to finalize.
        upload_id: Uuid,
    },
    /// Server → client progress report, coalesced.
    #[serde(rename_all = "camelCase")]
    UploadProgress {
        /// The upload being reported on.
        upload_id: Uuid,
        /// Bytes appended so far.
        bytes_received: u64,
    },
    /// The upload was promoted into the store.
    #[serde(rename_all = "camelCase")]
    UploadComplete {
        /// The finished upload.
        upload_id: Uuid,
        /// Descriptor of the stored file.
        file: FileDescriptor,
    },
    /// The upload failed; the connection stays open.
    #[serde(rename_all = "camelCase")]
    UploadError {
        /// The failed upload.
        upload_id: Uuid,
        /// Machine-readable reason, e.g. `size_mismatch`.
        error: String,
    },
    /// Client capability announcement; lists payload formats the client can
    /// decode. The server emits compressed JSON only after seeing `0x03`
    /// here.
    #[serde(rename_all = "camelCase")]
    ClientCapabilities {
        /// Supported inner payload formats.
        formats: Vec<PayloadFormat>,
    },
}

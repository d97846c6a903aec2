// wv-protocol: Webverse wire protocol types and serialization.
//
// All WebSocket frames use a top-level `{type, data}` envelope for
// discriminated deserialization.  The enum variants map 1:1 to the frozen
// v1 message types.  Page-channel bus payloads reuse the push frames
// verbatim, so a hub can forward them without re-encoding.

use serde::{Deserialize, Serialize};

/// WebSocket subprotocol name.  The bearer token travels as the *second*
/// subprotocol token in the upgrade request.
pub const SUBPROTOCOL: &str = "webverse-v1";

// ---------------------------------------------------------------------------
// Bus channels
// ---------------------------------------------------------------------------

/// Process-wide channel announcing account deletion.
pub const USER_DELETED_CHANNEL: &str = "user-deleted";
/// Process-wide channel announcing key-version changes.
pub const USER_KEYS_UPDATED_CHANNEL: &str = "user-keys-updated";

/// Per-page channel carrying `new_stroke` / `delete_stroke` push frames.
pub fn page_channel(page_key: &str) -> String {
    format!("page:{page_key}")
}

/// Inverse of [`page_channel`].
pub fn page_key_of_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix("page:")
}

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Drawing layer. Serialized as `0` (public) or `1` (private).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Layer {
    Public,
    Private,
}

impl From<Layer> for u8 {
    fn from(layer: Layer) -> u8 {
        match layer {
            Layer::Public => 0,
            Layer::Private => 1,
        }
    }
}

impl TryFrom<u8> for Layer {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Layer::Public),
            1 => Ok(Layer::Private),
            other => Err(format!("unknown layer {other}")),
        }
    }
}

/// OAuth identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Github,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Github => "github",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "google" => Some(Provider::Google),
            "github" => Some(Provider::Github),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single stroke as it travels on the wire.
///
/// `content` is an opaque base64 blob: a small JSON document for public
/// strokes, ciphertext for private ones.  `user_id` is advisory on input;
/// the server always stamps the authenticated identity on output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stroke {
    /// UUIDv7, empty on a fresh `draw` request.
    #[serde(default)]
    pub id: String,
    /// Ignored on input; authoritative on output.
    #[serde(default)]
    pub user_id: String,
    /// Empty for public strokes, 24 bytes base64 for private ones.
    #[serde(default)]
    pub nonce: String,
    pub content: String,
}

/// A stroke together with its page/layer placement.  This is the unit the
/// store persists and the batcher buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrokeRecord {
    pub page_key: String,
    pub layer: Layer,
    /// Decimal `keyVersion` for private strokes; empty for public.
    #[serde(default)]
    pub layer_id: String,
    pub stroke: Stroke,
}

/// A user's client-side encryption envelope.  Either fully present or
/// fully absent; the server never sees plaintext DEKs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEnvelope {
    #[serde(rename = "saltKEK")]
    pub salt_kek: String,
    #[serde(rename = "encryptedDEK1")]
    pub encrypted_dek1: String,
    #[serde(rename = "nonceDEK1")]
    pub nonce_dek1: String,
    #[serde(rename = "encryptedDEK2")]
    pub encrypted_dek2: String,
    #[serde(rename = "nonceDEK2")]
    pub nonce_dek2: String,
}

impl KeyEnvelope {
    /// True when every field is empty (the "no envelope" state).
    pub fn is_empty(&self) -> bool {
        self.salt_kek.is_empty()
            && self.encrypted_dek1.is_empty()
            && self.nonce_dek1.is_empty()
            && self.encrypted_dek2.is_empty()
            && self.nonce_dek2.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Client -> Server messages
// ---------------------------------------------------------------------------

/// Page reference used by `load`, `subscribe` and `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRef {
    pub page_key: String,
    pub layer: Layer,
    #[serde(default)]
    pub layer_id: String,
}

/// `draw` and `redo` request body.
///
/// `stroke.id` is empty for `draw` and carries the original ID for `redo`.
/// `user_stroke_id` is an opaque client correlation token echoed in the
/// response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawRequest {
    pub stroke: Stroke,
    pub page_key: String,
    pub user_stroke_id: u32,
    pub layer: Layer,
    #[serde(default)]
    pub layer_id: String,
}

/// `undo` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoRequest {
    pub page_key: String,
    pub layer: Layer,
    #[serde(default)]
    pub layer_id: String,
    pub stroke_id: String,
}

/// All client-to-server message types in the v1 protocol.
///
/// ```json
/// { "type": "draw", "data": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Load(PageRef),
    Subscribe(PageRef),
    Unsubscribe(PageRef),
    Draw(DrawRequest),
    Undo(UndoRequest),
    Redo(DrawRequest),
}

// ---------------------------------------------------------------------------
// Server -> Client messages
// ---------------------------------------------------------------------------

/// Response to `load`.  `strokes` is ordered oldest to newest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub page_key: String,
    pub layer: Layer,
    #[serde(default)]
    pub layer_id: String,
    #[serde(default)]
    pub strokes: Vec<Stroke>,
}

/// Response to `subscribe` / `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub page_key: String,
    pub layer: Layer,
    #[serde(default)]
    pub layer_id: String,
}

/// Response to `draw` / `redo`.  `stroke_id` is present on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub page_key: String,
    pub user_stroke_id: u32,
    pub layer: Layer,
    #[serde(default)]
    pub layer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_id: Option<String>,
}

/// Response to `undo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub page_key: String,
    pub layer: Layer,
    #[serde(default)]
    pub layer_id: String,
    pub stroke_id: String,
}

/// `new_stroke` push.  Also the page-channel bus payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrokeEvent {
    pub page_key: String,
    pub layer: Layer,
    #[serde(default)]
    pub layer_id: String,
    pub stroke: Stroke,
}

/// `delete_stroke` push.  Also the page-channel bus payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrokeDeleteEvent {
    pub page_key: String,
    pub layer: Layer,
    #[serde(default)]
    pub layer_id: String,
    pub stroke_id: String,
    pub user_id: String,
}

/// `keys_updated` push, delivered to every live connection of the affected
/// user so in-flight sockets pick up the new key version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysUpdated {
    pub key_version: u32,
    pub keys_deleted: bool,
}

/// All server-to-client message types in the v1 protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    LoadResponse(LoadResponse),
    SubscribeResponse(PageResponse),
    UnsubscribeResponse(PageResponse),
    DrawResponse(DrawResponse),
    UndoResponse(UndoResponse),
    RedoResponse(DrawResponse),
    NewStroke(StrokeEvent),
    DeleteStroke(StrokeDeleteEvent),
    KeysUpdated(KeysUpdated),
}

// ---------------------------------------------------------------------------
// Bus-only payloads
// ---------------------------------------------------------------------------

/// Payload on [`USER_DELETED_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDeleted {
    pub user_id: String,
}

/// Payload on [`USER_KEYS_UPDATED_CHANNEL`].
///
/// `key_version` is the version after a set/rotate, or the version the
/// deleted envelope had when `keys_deleted` is true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserKeysUpdated {
    pub user_id: String,
    pub key_version: u32,
    pub keys_deleted: bool,
}

// ---------------------------------------------------------------------------
// Purge queue payload
// ---------------------------------------------------------------------------

/// A queued request to delete a user's strokes: either everything
/// (`delete_all`) or a single historical private layer tag such as
/// `"Private#4"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeJob {
    pub user_id: String,
    pub provider: Provider,
    pub provider_id: String,
    pub delete_all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
}

/// Layer tag for a historical private layer, e.g. `"Private#4"`.
pub fn private_layer_tag(key_version: u32) -> String {
    format!("Private#{key_version}")
}

/// Parse a layer tag back into `(layer, layer_id)`.
pub fn parse_layer_tag(tag: &str) -> Option<(Layer, String)> {
    if let Some(version) = tag.strip_prefix("Private#") {
        return Some((Layer::Private, version.to_owned()));
    }
    if tag == "Public" {
        return Some((Layer::Public, String::new()));
    }
    None
}

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Frozen v1 error kinds, surfaced in `*_response.error` and close frames.
pub mod error_kinds {
    pub const UNAUTHENTICATED: &str = "Unauthenticated";
    pub const INVALID_REQUEST: &str = "InvalidRequest";
    pub const USER_QUOTA_EXCEEDED: &str = "UserQuotaExceeded";
    pub const PAGE_QUOTA_EXCEEDED: &str = "PageQuotaExceeded";
    pub const STROKE_ENCRYPTED_WITH_OLD_KEY: &str = "StrokeEncryptedWithOldKey";
    pub const NOT_OWNER: &str = "NotOwner";
    pub const TRANSPORT_ERROR: &str = "TransportError";
}

// ---------------------------------------------------------------------------
// HTTP API types (frozen schema definitions)
// ---------------------------------------------------------------------------

/// Request body for `POST /login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub provider: Provider,
    pub code: String,
}

/// Account envelope returned by `POST /login` and `GET /me`.
/// `token` is present only in the login response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountResponse {
    pub id: String,
    pub username: String,
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "keyVersion")]
    pub key_version: u32,
    #[serde(flatten)]
    pub envelope: KeyEnvelope,
}

/// Request body for `POST /me/encryption-keys` (create or replace) and
/// `PUT /me/encryption-keys` (rotate the KEK only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetKeysRequest {
    #[serde(flatten)]
    pub envelope: KeyEnvelope,
}

/// Response body for the encryption-keys endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysResponse {
    pub success: bool,
    #[serde(rename = "keyVersion")]
    pub key_version: u32,
}

/// Frozen HTTP error envelope used by all non-2xx responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
}

// pb-protocol: Pushbullet wire types and serialization.
//
// REST entities and stream frames are deserialized permissively: the server
// adds fields over time, and a client must never reject a push it cannot
// fully understand.  Unknown `type` tags map to explicit Unknown variants.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// REST entities
// ---------------------------------------------------------------------------

/// The authenticated user, from `GET /v2/users/me`.
///
/// Replaced wholesale on every refresh; `iden` doubles as the PBKDF2 salt
/// for end-to-end encryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub iden: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// A registered device, from `GET /v2/devices`.
///
/// The list is requested with `?active=true`; the client still filters on
/// `active` defensively because deletion tombstones have been observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub iden: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub active: bool,
}

/// A chat contact, from `GET /v2/chats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iden: Option<String>,
    pub with: ChatWith,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatWith {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ---------------------------------------------------------------------------
// Pushes
// ---------------------------------------------------------------------------

/// The `type` discriminator of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    Note,
    Link,
    File,
    Mirror,
    SmsChanged,
    Dismissal,
    /// Forward-compat: anything the server invents later.
    #[serde(other)]
    Unknown,
}

/// One entry of a mirrored Android notification group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorNotification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// A push as it appears on the wire (REST list or stream `push` frame).
///
/// Modeled as one struct with optional per-variant fields rather than a
/// tagged enum: an end-to-end encrypted push carries only
/// `encrypted`/`ciphertext` plus envelope metadata, and decryption merges
/// the plaintext JSON *over* that envelope.  A closed enum cannot express
/// the half-decrypted intermediate states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Push {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iden: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<PushKind>,
    /// Unix seconds; set by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<f64>,
    /// Unix seconds; monotonic per push server-side.  Drives the cutoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<f64>,
    #[serde(default)]
    pub dismissed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<MirrorNotification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device_iden: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_device_iden: Option<String>,
    /// True while the payload is still an opaque ciphertext envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
}

impl Push {
    /// Whether this push still carries an undecrypted envelope.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted == Some(true)
    }

    /// Whether the push has content a display list can render.
    ///
    /// Encrypted envelopes count as renderable (shown as "encrypted
    /// message" until a password is configured).  `sms_changed` and
    /// `dismissal` never render; neither does a push with no content at
    /// all.
    pub fn is_renderable(&self) -> bool {
        if self.is_encrypted() {
            return true;
        }
        match self.kind {
            Some(PushKind::Note) => self.title.is_some() || self.body.is_some(),
            Some(PushKind::Link) => self.url.is_some(),
            Some(PushKind::File) => self.file_url.is_some() || self.file_name.is_some(),
            Some(PushKind::Mirror) => {
                self.title.is_some() || self.body.is_some() || !self.notifications.is_empty()
            }
            Some(PushKind::SmsChanged | PushKind::Dismissal | PushKind::Unknown) | None => false,
        }
    }

    /// Title line for notifications; falls back per variant.
    pub fn display_title(&self) -> String {
        if self.is_encrypted() {
            return "Encrypted message".to_owned();
        }
        if let Some(t) = &self.title {
            return t.clone();
        }
        match self.kind {
            Some(PushKind::Link) => "Link".to_owned(),
            Some(PushKind::File) => self.file_name.clone().unwrap_or_else(|| "File".to_owned()),
            Some(PushKind::Mirror) => self
                .application_name
                .clone()
                .unwrap_or_else(|| "Notification".to_owned()),
            _ => "Push".to_owned(),
        }
    }

    /// Body line for notifications.
    pub fn display_body(&self) -> String {
        if self.is_encrypted() {
            return "A password is required to decrypt this message.".to_owned();
        }
        if let Some(b) = &self.body {
            return b.clone();
        }
        if let Some(u) = &self.url {
            return u.clone();
        }
        if let Some(u) = &self.file_url {
            return u.clone();
        }
        String::new()
    }

    /// Merge decrypted plaintext JSON over this envelope.
    ///
    /// Plaintext fields win; envelope metadata (`iden`, `created`,
    /// `modified`, device idens) survives where the plaintext is silent.
    /// The result always carries `encrypted = false` so downstream code can
    /// tell a decrypted push from a never-encrypted one.
    pub fn merged_with_plaintext(&self, plaintext: &str) -> Result<Push, serde_json::Error> {
        let mut base = serde_json::to_value(self)?;
        let overlay: serde_json::Value = serde_json::from_str(plaintext)?;
        if let (Some(base_map), Some(overlay_map)) = (base.as_object_mut(), overlay.as_object()) {
            for (k, v) in overlay_map {
                base_map.insert(k.clone(), v.clone());
            }
            base_map.insert("encrypted".to_owned(), serde_json::Value::Bool(false));
            base_map.remove("ciphertext");
        }
        serde_json::from_value(base)
    }
}

/// Response shape of `GET /v2/pushes`.
///
/// `cursor` is a server-supplied continuation; pass it back verbatim as
/// `?cursor=` to fetch the next page.  An expired cursor yields the
/// `invalid_cursor` error envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushList {
    #[serde(default)]
    pub pushes: Vec<Push>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Response shape of `GET /v2/devices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceList {
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// Response shape of `GET /v2/chats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatList {
    #[serde(default)]
    pub chats: Vec<Chat>,
}

// ---------------------------------------------------------------------------
// Device registration
// ---------------------------------------------------------------------------

/// Body of `POST /v2/devices` when registering this client.
///
/// Field values other than `nickname` and `app_version` are fixed by the
/// server-side device taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub nickname: String,
    pub model: String,
    pub manufacturer: String,
    pub push_token: String,
    pub app_version: u32,
    pub icon: String,
    pub has_sms: bool,
    #[serde(rename = "type")]
    pub kind: String,
}

impl DeviceRegistration {
    pub fn new(nickname: impl Into<String>, app_version: u32) -> Self {
        Self {
            nickname: nickname.into(),
            model: "Chrome".to_owned(),
            manufacturer: "Google".to_owned(),
            push_token: String::new(),
            app_version,
            icon: "browser".to_owned(),
            has_sms: false,
            kind: "chrome".to_owned(),
        }
    }
}

/// Body of `POST /v2/devices/<iden>` for a nickname update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NicknameUpdate {
    pub nickname: String,
}

/// Body of `POST /v2/pushes`.  Only the fields for the chosen `type` are
/// serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingPush {
    #[serde(rename = "type")]
    pub kind: PushKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device_iden: Option<String>,
}

impl OutgoingPush {
    pub fn note(title: Option<String>, body: Option<String>) -> Self {
        Self {
            kind: PushKind::Note,
            title,
            body,
            url: None,
            target_device_iden: None,
        }
    }

    pub fn link(title: Option<String>, url: String, body: Option<String>) -> Self {
        Self {
            kind: PushKind::Link,
            title,
            body,
            url: Some(url),
            target_device_iden: None,
        }
    }
}

// ---------------------------------------------------------------------------
// REST error envelope
// ---------------------------------------------------------------------------

/// Error code the pushes endpoint returns for an expired `modified_after`
/// continuation.
pub const ERROR_TYPE_INVALID_CURSOR: &str = "invalid_cursor";

/// The `{ "error": { ... } }` envelope used by all non-2xx REST responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiErrorBody {
    /// Parse an error envelope out of a response body, tolerating
    /// non-conforming bodies.
    pub fn parse(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }

    pub fn is_invalid_cursor(&self) -> bool {
        self.error.kind == ERROR_TYPE_INVALID_CURSOR
    }
}

// ---------------------------------------------------------------------------
// Stream frames
// ---------------------------------------------------------------------------

/// Category named by a `tickle` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickleSubtype {
    Push,
    Device,
    #[serde(other)]
    Unknown,
}

/// A frame on the real-time stream, discriminated by `type`.
///
/// ```json
/// { "type": "nop" }
/// { "type": "tickle", "subtype": "push" }
/// { "type": "push", "push": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Keep-alive, sent roughly every 30 s.
    Nop,
    /// Re-sync request for one category.
    Tickle {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<TickleSubtype>,
    },
    /// Direct push delivery; the nested push may be an encrypted envelope.
    Push { push: Push },
    /// Forward-compat for frame types this client predates.
    #[serde(other)]
    Unknown,
}

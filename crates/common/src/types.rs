//! Envelope and reply data model shared by transports, the pipeline, and the
//! dispatcher.

use std::{fmt, path::PathBuf, str::FromStr};

use {
    bytes::Bytes,
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    uuid::Uuid,
};

use crate::{Error, Result};

/// Insertion-ordered auxiliary fields carried by an [`Envelope`].
pub type Attributes = Map<String, Value>;

/// Well-known attribute keys.
///
/// `SESSION_ID` and `RECEIVER` are owned by the core: the first must be set
/// before an envelope is submitted, the second before it is delivered.
pub mod attr {
    pub const SESSION_ID: &str = "session_id";
    pub const RECEIVER: &str = "receiver";
    pub const IS_GROUP: &str = "isgroup";
    /// Id of the transport that produced the envelope (replies go back through it).
    pub const CHANNEL: &str = "channel";
    pub const DESIRED_REPLY_KIND: &str = "desired_reply_kind";
    pub const SENDER_ID: &str = "sender_id";
    pub const SENDER_NAME: &str = "sender_name";
    pub const GROUP_ID: &str = "group_id";
    pub const GROUP_NAME: &str = "group_name";
    /// The bot was @-mentioned by the sender.
    pub const MENTIONED: &str = "mentioned";
    /// Set by transports for messages the bot sent itself.
    pub const FROM_SELF: &str = "from_self";
    /// Suppress the sender mention when decorating group replies.
    pub const NO_MENTION: &str = "no_mention";
    /// Kind of the envelope a derived envelope was built from.
    pub const ORIGIN_KIND: &str = "origin_kind";
}

// ── Envelope ────────────────────────────────────────────────────────────────

/// Kind of inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Text,
    Voice,
    Image,
    ImageCreate,
    Xml,
    Sharing,
    File,
    System,
    FriendRequest,
    Unknown,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Image => "image",
            Self::ImageCreate => "image_create",
            Self::Xml => "xml",
            Self::Sharing => "sharing",
            Self::File => "file",
            Self::System => "system",
            Self::FriendRequest => "friend_request",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque inbound content. Interpretation is up to the pipeline stage and the
/// generator handling the envelope's kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
    /// Local file handle (downloaded media, voice notes).
    Path(PathBuf),
    Structured(Value),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Normalized unit of inbound work.
///
/// `id`, `kind` and `payload` are fixed at construction; `attributes` are
/// read and written by pipeline stages and hooks. Cloning deep-copies the
/// attribute map, which is what the dispatcher relies on when it hands an
/// admitted envelope to a worker.
#[derive(Debug, Clone)]
pub struct Envelope {
    id: Uuid,
    kind: EnvelopeKind,
    payload: Payload,
    pub attributes: Attributes,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, payload: impl Into<Payload>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload: payload.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Text, Payload::Text(text.into()))
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn text_payload(&self) -> Option<&str> {
        self.payload.as_text()
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Boolean attribute; missing or non-boolean values read as `false`.
    pub fn attr_bool(&self, key: &str) -> bool {
        self.attributes
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// String attribute that must be present.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.attr_str(key)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::missing_attribute(self.id, key))
    }

    pub fn session_id(&self) -> Option<&str> {
        self.attr_str(attr::SESSION_ID)
    }

    pub fn receiver(&self) -> Option<&str> {
        self.attr_str(attr::RECEIVER)
    }

    pub fn is_group(&self) -> bool {
        self.attr_bool(attr::IS_GROUP)
    }

    pub fn desired_reply_kind(&self) -> Option<ReplyKind> {
        self.attr_str(attr::DESIRED_REPLY_KIND)
            .and_then(|kind| kind.parse().ok())
    }

    /// Build a new unit of work from this one: fresh id, new kind and payload,
    /// copied attributes. The first derivation records the source kind
    /// under [`attr::ORIGIN_KIND`].
    pub fn derive(&self, kind: EnvelopeKind, payload: impl Into<Payload>) -> Self {
        let mut attributes = self.attributes.clone();
        attributes
            .entry(attr::ORIGIN_KIND)
            .or_insert_with(|| Value::from(self.kind.as_str()));
        Self {
            id: Uuid::new_v4(),
            kind,
            payload: payload.into(),
            attributes,
        }
    }

    /// True when this envelope was derived from one of `kind`, e.g. the
    /// text transcript of a voice note.
    pub fn is_derived_from(&self, kind: EnvelopeKind) -> bool {
        self.attr_str(attr::ORIGIN_KIND) == Some(kind.as_str())
    }

    /// Same identity, replaced payload. Used by compose when it strips
    /// routing prefixes or re-kinds a message (e.g. image creation).
    pub fn rewrite(self, kind: EnvelopeKind, payload: impl Into<Payload>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            ..self
        }
    }
}

// ── Reply ───────────────────────────────────────────────────────────────────

/// Kind of outbound content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    Text,
    Voice,
    Image,
    ImageUrl,
    File,
    Video,
    VideoUrl,
    AppXml,
    Error,
    Info,
    AcceptFriend,
}

impl ReplyKind {
    pub const ALL: &'static [ReplyKind] = &[
        Self::Text,
        Self::Voice,
        Self::Image,
        Self::ImageUrl,
        Self::File,
        Self::Video,
        Self::VideoUrl,
        Self::AppXml,
        Self::Error,
        Self::Info,
        Self::AcceptFriend,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Image => "image",
            Self::ImageUrl => "image_url",
            Self::File => "file",
            Self::Video => "video",
            Self::VideoUrl => "video_url",
            Self::AppXml => "app_xml",
            Self::Error => "error",
            Self::Info => "info",
            Self::AcceptFriend => "accept_friend",
        }
    }
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::message(format!("unknown reply kind: {s}")))
    }
}

/// Content carried by a [`Reply`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyContent {
    Text(String),
    Binary(Bytes),
    Path(PathBuf),
    Url(String),
    Structured(Value),
}

/// Outbound reply. Stages never mutate a reply produced by an earlier stage;
/// they build a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub kind: ReplyKind,
    pub content: ReplyContent,
}

impl Reply {
    pub fn new(kind: ReplyKind, content: ReplyContent) -> Self {
        Self { kind, content }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(ReplyKind::Text, ReplyContent::Text(text.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ReplyKind::Error, ReplyContent::Text(message.into()))
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(ReplyKind::Info, ReplyContent::Text(message.into()))
    }

    pub fn voice_file(path: impl Into<PathBuf>) -> Self {
        Self::new(ReplyKind::Voice, ReplyContent::Path(path.into()))
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self::new(ReplyKind::ImageUrl, ReplyContent::Url(url.into()))
    }

    /// Text body for text-like replies (text, error, info, URLs).
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            ReplyContent::Text(text) | ReplyContent::Url(text) => Some(text),
            _ => None,
        }
    }
}

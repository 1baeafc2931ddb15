use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Participant role within a class session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Teacher,
    Student,
    Admin,
    Proctor,
}

impl Role {
    /// Roles allowed to grant or revoke capabilities
    pub fn is_moderator(&self) -> bool {
        matches!(self, Role::Teacher | Role::Admin)
    }
}

/// Media kind of a produced stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

/// A named capability that can be granted to or revoked from a participant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Speak,
    Camera,
    ScreenShare,
    Chat,
}

/// The capability set currently granted to one participant
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionSet {
    pub speak: bool,
    pub camera: bool,
    pub screen_share: bool,
    pub chat: bool,
}

impl PermissionSet {
    /// Everything granted
    pub fn all() -> Self {
        Self {
            speak: true,
            camera: true,
            screen_share: true,
            chat: true,
        }
    }

    /// Starting set for a newly joined participant of the given role.
    /// Students begin with chat only; staff roles begin with everything.
    pub fn defaults_for(role: Role) -> Self {
        match role {
            Role::Student => Self {
                chat: true,
                ..Self::default()
            },
            Role::Teacher | Role::Admin | Role::Proctor => Self::all(),
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Speak => self.speak,
            Capability::Camera => self.camera,
            Capability::ScreenShare => self.screen_share,
            Capability::Chat => self.chat,
        }
    }

    pub fn set(&mut self, capability: Capability, granted: bool) {
        match capability {
            Capability::Speak => self.speak = granted,
            Capability::Camera => self.camera = granted,
            Capability::ScreenShare => self.screen_share = granted,
            Capability::Chat => self.chat = granted,
        }
    }
}

/// Full permission map for a session, keyed by participant user id
pub type PermissionMap = HashMap<Uuid, PermissionSet>;

/// Direction of a media transport
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportDirection {
    Send,
    Receive,
}

/// One codec the routing context (or a consuming endpoint) supports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodecCapability {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
}

/// Negotiation capabilities of a session's routing context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterCapabilities {
    pub codecs: Vec<CodecCapability>,
}

/// Codecs a consuming endpoint can receive
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerCapabilities {
    pub codecs: Vec<CodecCapability>,
}

/// Media parameters describing one produced stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaParams {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    /// Synchronization source identifier of the RTP stream
    pub ssrc: u32,
    pub fmtp: Option<String>,
}

/// Local connection parameters returned when a transport is created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportParams {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub address: String,
    pub port: u16,
    pub protocol: String,
}

/// Remote connection parameters supplied by the client to connect a transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConnectParams {
    pub dtls_fingerprint: String,
    pub ice_ufrag: String,
    pub ice_pwd: String,
}

/// A live producer as advertised to other participants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub producer_id: Uuid,
    pub user_id: Uuid,
    pub kind: MediaKind,
    pub paused: bool,
}

/// A participant as advertised in join/leave broadcasts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub permissions: PermissionSet,
}

/// Machine-readable failure kind carried by error frames
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    /// Referenced producer exists but has already closed
    Stale,
    Conflict,
    IncompatibleCapabilities,
    ResourceExhausted,
    TransientNetwork,
    Forbidden,
    BadRequest,
    Internal,
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    Capability, ConsumerCapabilities, ErrorCode, MediaKind, MediaParams, ParticipantInfo,
    PermissionMap, ProducerInfo, Role, RouterCapabilities, TransportConnectParams,
    TransportDirection, TransportParams,
};

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server; must be the first message
    Authenticate { token: String },

    /// Join a class session
    Join {
        session_id: String,
        role: Role,
        display_name: String,
    },

    /// Query the session routing context's negotiation capabilities
    GetCapabilities { session_id: String },

    /// Create a media transport in a session
    CreateTransport {
        session_id: String,
        direction: TransportDirection,
    },

    /// Connect a previously created transport with remote parameters
    ConnectTransport {
        transport_id: Uuid,
        params: TransportConnectParams,
    },

    /// Publish a media stream on a send transport
    Produce {
        session_id: String,
        transport_id: Uuid,
        kind: MediaKind,
        params: MediaParams,
    },

    /// Swap the sender's video source (e.g. camera to screen)
    ReplaceProducer {
        transport_id: Uuid,
        params: MediaParams,
        is_substitute: bool,
    },

    /// Subscribe to a producer's stream
    Consume {
        transport_id: Uuid,
        producer_id: Uuid,
        capabilities: ConsumerCapabilities,
    },

    /// Resume delivery on a consumer
    ResumeConsumer { consumer_id: Uuid },

    /// Pause delivery on a consumer
    PauseConsumer { consumer_id: Uuid },

    /// Pause the sender's own producer (mute / camera off)
    PauseProducer { producer_id: Uuid },

    /// Resume the sender's own producer
    ResumeProducer { producer_id: Uuid },

    /// Close a producer
    CloseProducer { producer_id: Uuid },

    /// Leave a class session
    Leave { session_id: String },

    /// Grant a capability to a participant (moderator roles only)
    GrantPermission {
        session_id: String,
        user_id: Uuid,
        capability: Capability,
    },

    /// Revoke a capability from a participant (moderator roles only)
    RevokePermission {
        session_id: String,
        user_id: Uuid,
        capability: Capability,
    },

    /// Raise hand
    RaiseHand { session_id: String },

    /// Lower hand
    LowerHand { session_id: String },

    /// Send a chat line to the session
    Chat { session_id: String, body: String },

    /// Ping to keep connection alive
    Ping,
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication successful
    Authenticated { connection_id: Uuid },

    /// Join succeeded
    Joined {
        session_id: String,
        capabilities: RouterCapabilities,
        producers: Vec<ProducerInfo>,
        participant_count: usize,
        permissions: PermissionMap,
    },

    /// Routing context capabilities
    Capabilities {
        session_id: String,
        capabilities: RouterCapabilities,
    },

    /// Transport created
    TransportCreated {
        transport_id: Uuid,
        direction: TransportDirection,
        params: TransportParams,
    },

    /// Transport connected
    TransportConnected { transport_id: Uuid },

    /// Producer created
    Produced { producer_id: Uuid },

    /// Producer replaced; carries the id of the replacement
    ProducerSwapped { producer_id: Uuid },

    /// Consumer created (paused until resumed)
    Consumed {
        consumer_id: Uuid,
        producer_id: Uuid,
        params: MediaParams,
    },

    /// Generic acknowledgement for soft operations
    Ack,

    /// Pong response to ping
    Pong,

    /// Structured failure result
    Error { code: ErrorCode, message: String },

    /// A participant joined the session
    ParticipantJoined {
        session_id: String,
        participant: ParticipantInfo,
        participant_count: usize,
    },

    /// A participant left the session
    ParticipantLeft {
        session_id: String,
        user_id: Uuid,
        participant_count: usize,
    },

    /// A new producer is available to consume
    NewProducer {
        session_id: String,
        producer: ProducerInfo,
    },

    /// A producer was replaced by a source swap; subscribers should
    /// re-consume rather than treat this as a new participant stream
    ProducerReplaced {
        session_id: String,
        producer: ProducerInfo,
        replaced_producer_ids: Vec<Uuid>,
        is_substitute: bool,
    },

    /// A producer closed
    ProducerClosed {
        session_id: String,
        producer_id: Uuid,
        user_id: Uuid,
    },

    /// A producer paused upstream
    ProducerPaused {
        session_id: String,
        producer_id: Uuid,
    },

    /// A producer resumed upstream
    ProducerResumed {
        session_id: String,
        producer_id: Uuid,
    },

    /// A capability was granted; carries the full permission map
    PermissionGranted {
        session_id: String,
        user_id: Uuid,
        capability: Capability,
        permissions: PermissionMap,
    },

    /// A capability was revoked; carries the full permission map
    PermissionRevoked {
        session_id: String,
        user_id: Uuid,
        capability: Capability,
        permissions: PermissionMap,
    },

    /// A participant raised their hand
    HandRaised { session_id: String, user_id: Uuid },

    /// A participant lowered their hand
    HandLowered { session_id: String, user_id: Uuid },

    /// Chat line relayed to the session
    ChatMessage {
        session_id: String,
        user_id: Uuid,
        display_name: String,
        body: String,
        sent_at: chrono::DateTime<chrono::Utc>,
    },

    /// Current live producers; pushed when a client's view has gone stale
    ProducerList {
        session_id: String,
        producers: Vec<ProducerInfo>,
    },
}

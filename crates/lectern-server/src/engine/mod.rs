//! Media engine contract
//!
//! The native media-routing engine (packet forwarding, codec negotiation,
//! ICE/DTLS) lives outside this server. The orchestration layer consumes it
//! through the fixed capability surface below: workers host routers, routers
//! host transports, transports host producers and consumers. A process-local
//! [`loopback`] implementation backs the default wiring and the test suite.

mod loopback;
mod pool;

pub use loopback::{LoopbackConfig, LoopbackEngine};
pub use pool::WorkerPool;

use async_trait::async_trait;
use lectern_protocol::{
    ConsumerCapabilities, MediaKind, MediaParams, RouterCapabilities, TransportConnectParams,
    TransportParams,
};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The new stream's synchronization identifier collides with one the
    /// engine still holds from a stale registration
    #[error("synchronization source {0} is already registered")]
    SsrcInUse(u32),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("worker is not running")]
    WorkerDown,

    #[error("resource is closed")]
    Closed,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self) -> Result<Arc<dyn Worker>, EngineError>;
}

/// Handle to one native engine worker process
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> Uuid;

    fn is_alive(&self) -> bool;

    /// Resolves when the engine reports this worker crashed
    async fn died(&self);

    async fn create_router(&self) -> Result<Arc<dyn Router>, EngineError>;
}

/// Per-session routing context on a worker
#[async_trait]
pub trait Router: Send + Sync {
    fn capabilities(&self) -> RouterCapabilities;

    /// Whether an endpoint with the given capabilities can receive a stream
    /// described by the given producer parameters
    fn can_consume(&self, producer: &MediaParams, capabilities: &ConsumerCapabilities) -> bool;

    async fn create_transport(&self) -> Result<Arc<dyn Transport>, EngineError>;

    async fn close(&self);
}

/// Bidirectional media-connection endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> Uuid;

    /// Local connection parameters handed to the remote endpoint
    fn params(&self) -> TransportParams;

    async fn connect(&self, remote: TransportConnectParams) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        params: MediaParams,
    ) -> Result<Arc<dyn Producer>, EngineError>;

    async fn consume(
        &self,
        producer: Arc<dyn Producer>,
        capabilities: &ConsumerCapabilities,
    ) -> Result<Arc<dyn Consumer>, EngineError>;

    async fn close(&self);
}

/// One outbound stream held by the engine
#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> Uuid;

    fn media_params(&self) -> MediaParams;

    fn paused(&self) -> bool;

    async fn pause(&self);

    async fn resume(&self);

    async fn close(&self);
}

/// One inbound stream held by the engine, bound to a producer
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> Uuid;

    fn media_params(&self) -> MediaParams;

    fn paused(&self) -> bool;

    async fn pause(&self);

    async fn resume(&self);

    async fn close(&self);
}

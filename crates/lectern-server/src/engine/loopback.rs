//! Process-local media engine
//!
//! Implements the engine contract in-memory: no packets are forwarded, but
//! identifier allocation behaves like the real engine does, including the
//! lazy release of synchronization sources after a producer closes. That
//! lag is what the orchestration layer's settle delays and conflict retries
//! exist to absorb, so the loopback engine makes them exercisable.

use super::{Consumer, EngineError, MediaEngine, Producer, Router, Transport, Worker};
use async_trait::async_trait;
use lectern_protocol::{
    CodecCapability, ConsumerCapabilities, IceCandidate, MediaKind, MediaParams,
    RouterCapabilities, TransportConnectParams, TransportParams,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// How long a closed producer's SSRC stays registered before the engine
    /// releases it. Zero means immediate release.
    pub ssrc_linger: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            ssrc_linger: Duration::ZERO,
        }
    }
}

pub struct LoopbackEngine {
    config: LoopbackConfig,
    workers: Mutex<Vec<Arc<LoopbackWorker>>>,
    connects: Arc<AtomicUsize>,
}

impl LoopbackEngine {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            workers: Mutex::new(Vec::new()),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Simulate an engine-reported crash of the given worker
    pub async fn crash_worker(&self, worker_id: Uuid) {
        let workers = self.workers.lock().await;
        if let Some(worker) = workers.iter().find(|w| w.id == worker_id) {
            worker.crash();
        }
    }

    /// Total transport connect calls the engine has served
    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_worker(&self) -> Result<Arc<dyn Worker>, EngineError> {
        let worker = Arc::new(LoopbackWorker::new(
            self.config.clone(),
            self.connects.clone(),
        ));
        self.workers.lock().await.push(worker.clone());
        tracing::debug!("Loopback worker {} started", worker.id);
        Ok(worker)
    }
}

struct LoopbackWorker {
    id: Uuid,
    config: LoopbackConfig,
    connects: Arc<AtomicUsize>,
    alive_tx: watch::Sender<bool>,
    alive_rx: watch::Receiver<bool>,
}

impl LoopbackWorker {
    fn new(config: LoopbackConfig, connects: Arc<AtomicUsize>) -> Self {
        let (alive_tx, alive_rx) = watch::channel(true);
        Self {
            id: Uuid::new_v4(),
            config,
            connects,
            alive_tx,
            alive_rx,
        }
    }

    fn crash(&self) {
        self.alive_tx.send_replace(false);
    }
}

#[async_trait]
impl Worker for LoopbackWorker {
    fn id(&self) -> Uuid {
        self.id
    }

    fn is_alive(&self) -> bool {
        *self.alive_rx.borrow()
    }

    async fn died(&self) {
        let mut rx = self.alive_rx.clone();
        // The sender lives as long as the worker, so this only ends on crash
        let _ = rx.wait_for(|alive| !*alive).await;
    }

    async fn create_router(&self) -> Result<Arc<dyn Router>, EngineError> {
        if !self.is_alive() {
            return Err(EngineError::WorkerDown);
        }
        Ok(Arc::new(LoopbackRouter {
            ssrcs: Arc::new(Mutex::new(HashMap::new())),
            linger: self.config.ssrc_linger,
            connects: self.connects.clone(),
            alive: self.alive_rx.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Registration state of one SSRC on a router
enum SsrcHold {
    Active,
    Released(Instant),
}

struct LoopbackRouter {
    ssrcs: Arc<Mutex<HashMap<u32, SsrcHold>>>,
    linger: Duration,
    connects: Arc<AtomicUsize>,
    alive: watch::Receiver<bool>,
    closed: AtomicBool,
}

fn default_codecs() -> Vec<CodecCapability> {
    vec![
        CodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
        },
        CodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
        },
        CodecCapability {
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: 0,
        },
    ]
}

fn codec_match(producer: &MediaParams, capabilities: &ConsumerCapabilities) -> bool {
    capabilities.codecs.iter().any(|c| {
        c.mime_type.eq_ignore_ascii_case(&producer.mime_type) && c.clock_rate == producer.clock_rate
    })
}

#[async_trait]
impl Router for LoopbackRouter {
    fn capabilities(&self) -> RouterCapabilities {
        RouterCapabilities {
            codecs: default_codecs(),
        }
    }

    fn can_consume(&self, producer: &MediaParams, capabilities: &ConsumerCapabilities) -> bool {
        codec_match(producer, capabilities)
    }

    async fn create_transport(&self) -> Result<Arc<dyn Transport>, EngineError> {
        if !*self.alive.borrow() {
            return Err(EngineError::WorkerDown);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(Arc::new(LoopbackTransport {
            id: Uuid::new_v4(),
            params: synth_transport_params(),
            ssrcs: self.ssrcs.clone(),
            linger: self.linger,
            connects: self.connects.clone(),
            alive: self.alive.clone(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn synth_transport_params() -> TransportParams {
    let mut rng = rand::thread_rng();
    let ufrag: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let pwd: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    let fingerprint: Vec<String> = (0..32).map(|_| format!("{:02X}", rng.r#gen::<u8>())).collect();
    TransportParams {
        ice_ufrag: ufrag,
        ice_pwd: pwd,
        ice_candidates: vec![IceCandidate {
            address: "127.0.0.1".to_string(),
            port: rng.gen_range(40000..50000),
            protocol: "udp".to_string(),
        }],
        dtls_fingerprint: fingerprint.join(":"),
    }
}

struct LoopbackTransport {
    id: Uuid,
    params: TransportParams,
    ssrcs: Arc<Mutex<HashMap<u32, SsrcHold>>>,
    linger: Duration,
    connects: Arc<AtomicUsize>,
    alive: watch::Receiver<bool>,
    connected: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn id(&self) -> Uuid {
        self.id
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    async fn connect(&self, _remote: TransportConnectParams) -> Result<(), EngineError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Negotiation(
                "transport is already connected".to_string(),
            ));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        params: MediaParams,
    ) -> Result<Arc<dyn Producer>, EngineError> {
        if !*self.alive.borrow() {
            return Err(EngineError::WorkerDown);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }

        let mut ssrcs = self.ssrcs.lock().await;
        let now = Instant::now();
        // Lazily drop holds whose linger window has passed
        ssrcs.retain(|_, hold| match hold {
            SsrcHold::Active => true,
            SsrcHold::Released(at) => now < *at + self.linger,
        });
        if ssrcs.contains_key(&params.ssrc) {
            return Err(EngineError::SsrcInUse(params.ssrc));
        }
        ssrcs.insert(params.ssrc, SsrcHold::Active);

        Ok(Arc::new(LoopbackProducer {
            id: Uuid::new_v4(),
            kind,
            params,
            ssrcs: self.ssrcs.clone(),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consume(
        &self,
        producer: Arc<dyn Producer>,
        capabilities: &ConsumerCapabilities,
    ) -> Result<Arc<dyn Consumer>, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        let params = producer.media_params();
        if !codec_match(&params, capabilities) {
            return Err(EngineError::Negotiation(format!(
                "no codec overlap for {}",
                params.mime_type
            )));
        }
        Ok(Arc::new(LoopbackConsumer {
            id: Uuid::new_v4(),
            params,
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct LoopbackProducer {
    id: Uuid,
    #[allow(dead_code)]
    kind: MediaKind,
    params: MediaParams,
    ssrcs: Arc<Mutex<HashMap<u32, SsrcHold>>>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for LoopbackProducer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn media_params(&self) -> MediaParams {
        self.params.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut ssrcs = self.ssrcs.lock().await;
            if let Some(hold) = ssrcs.get_mut(&self.params.ssrc) {
                *hold = SsrcHold::Released(Instant::now());
            }
        }
    }
}

struct LoopbackConsumer {
    id: Uuid,
    params: MediaParams,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl Consumer for LoopbackConsumer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn media_params(&self) -> MediaParams {
        self.params.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::trace!("Consumer {} closed twice", self.id);
        }
    }
}

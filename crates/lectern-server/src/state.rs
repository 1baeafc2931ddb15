use crate::directory::ClassDirectory;
use crate::engine::{MediaEngine, WorkerPool};
use crate::sfu::SessionRegistry;
use crate::ws::connections::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub jwt_secret: String,
    /// Fixed number of engine workers spawned at startup
    pub worker_pool_size: usize,
    /// How often the idle sweep runs
    pub sweep_interval: Duration,
    /// Idle time after which a session is closed by the sweep
    pub idle_timeout: Duration,
    /// How long a disconnected participant's producers stay alive
    pub producer_grace: Duration,
    /// Pause between closing a producer and re-creating its key, letting the
    /// engine release its identifier space
    pub produce_settle: Duration,
    /// Retries after an identifier conflict before giving up
    pub conflict_retry_limit: u32,
    /// Linear backoff step between conflict retries
    pub conflict_backoff_step: Duration,
    /// Settle delay before creating a replacement video producer
    pub replace_settle: Duration,
    /// Same, for higher-bandwidth substitute sources (screen shares)
    pub replace_settle_substitute: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            jwt_secret: "dev-secret-change-in-production".to_string(),
            worker_pool_size: 4,
            sweep_interval: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
            producer_grace: Duration::from_secs(30),
            produce_settle: Duration::from_millis(100),
            conflict_retry_limit: 3,
            conflict_backoff_step: Duration::from_secs(1),
            replace_settle: Duration::from_secs(2),
            replace_settle_substitute: Duration::from_secs(3),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let jwt_secret = std::env::var("LECTERN_JWT_SECRET").unwrap_or_else(|_| {
            tracing::warn!("LECTERN_JWT_SECRET not set, using default (insecure for production!)");
            defaults.jwt_secret.clone()
        });

        let bind_address =
            std::env::var("LECTERN_BIND_ADDRESS").unwrap_or(defaults.bind_address);

        let worker_pool_size = env_usize("LECTERN_WORKERS", defaults.worker_pool_size)?;

        Ok(Config {
            bind_address,
            jwt_secret,
            worker_pool_size,
            sweep_interval: env_secs("LECTERN_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            idle_timeout: env_secs("LECTERN_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            producer_grace: env_secs("LECTERN_PRODUCER_GRACE_SECS", defaults.producer_grace)?,
            produce_settle: defaults.produce_settle,
            conflict_retry_limit: defaults.conflict_retry_limit,
            conflict_backoff_step: defaults.conflict_backoff_step,
            replace_settle: defaults.replace_settle,
            replace_settle_substitute: defaults.replace_settle_substitute,
        })
    }
}

fn env_usize(name: &str, default: usize) -> anyhow::Result<usize> {
    match std::env::var(name) {
        Ok(value) => Ok(value
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be an integer, got {:?}", name, value))?),
        Err(_) => Ok(default),
    }
}

fn env_secs(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(name) {
        Ok(value) => {
            let secs: u64 = value
                .parse()
                .map_err(|_| anyhow::anyhow!("{} must be an integer, got {:?}", name, value))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub connections: Arc<ConnectionManager>,
    pub sessions: Arc<SessionRegistry>,
    pub pool: Arc<WorkerPool>,
    pub directory: Arc<dyn ClassDirectory>,
}

impl AppState {
    pub async fn new(
        config: Config,
        engine: Arc<dyn MediaEngine>,
        directory: Arc<dyn ClassDirectory>,
    ) -> anyhow::Result<Self> {
        let pool = WorkerPool::start(engine, config.worker_pool_size).await?;
        let connections = Arc::new(ConnectionManager::new());
        let sessions = SessionRegistry::new(pool.clone(), connections.clone(), config.clone());
        sessions.clone().spawn_idle_sweep();

        Ok(Self {
            config,
            connections,
            sessions,
            pool,
            directory,
        })
    }
}

//! Process-wide wiring, built once at start-up and handed to every component.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cache::{MemoryCache, OccupancyCache, RedisCache};
use crate::config::Config;
use crate::engine::Engine;
use crate::grid::GridIndexer;
use crate::model::now_ms;
use crate::notify::{EventSink, GridHub, GridSink, Notifier, OccupancySink, PushSink, SensorHub, SensorSink};
use crate::push::{HttpPushGateway, LogPushGateway, PushError, PushGateway};
use crate::store::{DocumentStore, MemoryStore, OccupancyStore, StoreError};
use crate::sweep::{self, Sweeper};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const HUB_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum ContextError {
    Io(io::Error),
    Store(StoreError),
    Push(PushError),
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::Io(e) => write!(f, "store open failed: {e}"),
            ContextError::Store(e) => write!(f, "store setup failed: {e}"),
            ContextError::Push(e) => write!(f, "push gateway setup failed: {e}"),
        }
    }
}

impl std::error::Error for ContextError {}

impl From<io::Error> for ContextError {
    fn from(e: io::Error) -> Self {
        ContextError::Io(e)
    }
}

impl From<StoreError> for ContextError {
    fn from(e: StoreError) -> Self {
        ContextError::Store(e)
    }
}

impl From<PushError> for ContextError {
    fn from(e: PushError) -> Self {
        ContextError::Push(e)
    }
}

pub struct Context {
    pub config: Config,
    pub store: Arc<MemoryStore>,
    pub occupancy: OccupancyStore,
    pub cache: Arc<dyn OccupancyCache>,
    pub grid_hub: Arc<GridHub>,
    pub sensor_hub: Arc<SensorHub>,
    pub notifier: Arc<Notifier>,
    pub engine: Arc<Engine>,
}

impl Context {
    /// Open the store and connect the side channels described by `config`.
    /// An unreachable Redis degrades to the in-process cache.
    pub async fn build(config: Config) -> Result<Self, ContextError> {
        let store = match config.wal_path() {
            Some(path) => Arc::new(MemoryStore::open(&path)?),
            None => {
                info!("running on an ephemeral store");
                Arc::new(MemoryStore::new())
            }
        };

        let cache: Arc<dyn OccupancyCache> = match &config.redis_url {
            Some(url) => match RedisCache::connect(url).await {
                Ok(cache) => Arc::new(cache),
                Err(e) => {
                    warn!("{e}; falling back to in-process occupancy cache");
                    Arc::new(MemoryCache::new())
                }
            },
            None => Arc::new(MemoryCache::new()),
        };

        let push: Arc<dyn PushGateway> = match &config.push_url {
            Some(url) => Arc::new(HttpPushGateway::new(url.clone(), config.push_token.clone())?),
            None => Arc::new(LogPushGateway),
        };

        Self::with_parts(config, store, cache, push).await
    }

    pub async fn with_parts(
        config: Config,
        store: Arc<MemoryStore>,
        cache: Arc<dyn OccupancyCache>,
        push: Arc<dyn PushGateway>,
    ) -> Result<Self, ContextError> {
        let documents: Arc<dyn DocumentStore> = store.clone();
        let occupancy = OccupancyStore::new(documents);
        occupancy.ensure_indexes().await?;

        let grid_hub = Arc::new(GridHub::new());
        let sensor_hub = Arc::new(SensorHub::new());
        let sinks: Vec<Arc<dyn EventSink>> = vec![
            Arc::new(OccupancySink::new(cache.clone())),
            Arc::new(SensorSink::new(occupancy.clone(), sensor_hub.clone())),
            Arc::new(GridSink::new(grid_hub.clone())),
            Arc::new(PushSink::new(occupancy.clone(), push)),
        ];
        let notifier = Arc::new(Notifier::new(sinks));
        let engine = Arc::new(Engine::new(
            occupancy.clone(),
            GridIndexer::new(config.max_grid_cells),
            notifier.clone(),
        ));

        Ok(Self {
            config,
            store,
            occupancy,
            cache,
            grid_hub,
            sensor_hub,
            notifier,
            engine,
        })
    }

    /// Ephemeral store, in-process cache, push only logged.
    pub async fn ephemeral(config: Config) -> Result<Self, ContextError> {
        Self::with_parts(
            Config {
                data_dir: None,
                ..config
            },
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::new()),
            Arc::new(LogPushGateway),
        )
        .await
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.engine.clone(),
            self.config.reminder_lead,
            self.config.reservation_grace,
            now_ms(),
        )
    }

    /// Start the sweep, the WAL compactor and hub housekeeping.
    pub fn spawn_background(&self) {
        let every = Duration::from_millis(self.config.sweep_interval.max(1) as u64);
        tokio::spawn(self.sweeper().run(every));

        tokio::spawn(sweep::run_compactor(
            self.store.clone(),
            self.config.compact_threshold,
            COMPACT_CHECK_INTERVAL,
        ));

        let grid_hub = self.grid_hub.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HUB_CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                grid_hub.cleanup();
            }
        });
    }
}

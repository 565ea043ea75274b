//! Startup wiring: configuration → backends → services.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{info, warn};

use folio_core::{Clock, InstanceId, SystemClock};
use folio_infra::cache::{
    Cache, CacheBackend, CacheError, CacheInvalidator, FilesystemCacheBackend,
    InMemoryCacheBackend, RedisCacheBackend,
};
use folio_infra::config::{CacheConfig, ConfigError, Deployment, FolioConfig, LoggingConfig};
use folio_infra::db::PgDatabase;
use folio_infra::jobs::{
    Dispatcher, DispatcherHandle, InMemoryJobStore, InMemoryPagePublisher, InMemoryPreviewStore,
    JobRegistry, JobStore, PagePublisher, PostgresJobStore, PostgresPagePublisher,
    PostgresPreviewStore, PreviewStore, RegistryError, StandardJobDeps, TriggerError,
    standard_jobs,
};
use folio_infra::tokens::{InMemoryTokenStore, PostgresTokenStore, TokenLifecycleManager, TokenStore};
use folio_observability::TracingSettings;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database: {0}")]
    Database(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

pub fn tracing_settings(logging: &LoggingConfig) -> TracingSettings {
    TracingSettings {
        filter: logging.filter.clone(),
        json: logging.json,
    }
}

/// Storage collaborators, chosen once from configuration.
#[derive(Clone)]
pub struct Backends {
    pub clock: Arc<dyn Clock>,
    pub cache: Cache,
    pub jobs: Arc<dyn JobStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub previews: Arc<dyn PreviewStore>,
    pub pages: Arc<dyn PagePublisher>,
}

impl Backends {
    /// Connect the configured backends. Database calls are driven by `runtime`,
    /// so this must run outside of any async context.
    pub fn connect(config: &FolioConfig, runtime: &Handle) -> Result<Self, StartupError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = Cache::new(cache_backend(&config.cache, Arc::clone(&clock))?);

        let Some(url) = &config.database.url else {
            warn!("no database configured; job and token records are kept in memory");
            let mut backends = Self::in_memory(clock);
            backends.cache = cache;
            return Ok(backends);
        };

        let db = PgDatabase::connect(url, config.database.max_connections, runtime.clone())
            .map_err(|e| StartupError::Database(e.to_string()))?;
        db.migrate().map_err(|e| StartupError::Database(e.to_string()))?;

        Ok(Self {
            clock,
            cache,
            jobs: Arc::new(PostgresJobStore::new(db.clone())),
            tokens: Arc::new(PostgresTokenStore::new(db.clone())),
            previews: Arc::new(PostgresPreviewStore::new(db.clone())),
            pages: Arc::new(PostgresPagePublisher::new(db)),
        })
    }

    /// Everything in process memory.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: Cache::new(Arc::new(InMemoryCacheBackend::new(Arc::clone(&clock)))),
            clock,
            jobs: InMemoryJobStore::arc(),
            tokens: InMemoryTokenStore::arc(),
            previews: Arc::new(InMemoryPreviewStore::new()),
            pages: Arc::new(InMemoryPagePublisher::new()),
        }
    }
}

fn cache_backend(config: &CacheConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn CacheBackend>, StartupError> {
    let backend: Arc<dyn CacheBackend> = match config {
        CacheConfig::Local { path } => Arc::new(FilesystemCacheBackend::open(path.clone(), clock)?),
        CacheConfig::Shared { url, namespace } => {
            Arc::new(RedisCacheBackend::connect(url, namespace.clone())?)
        }
        CacheConfig::Memory => Arc::new(InMemoryCacheBackend::new(clock)),
    };
    info!(backend = backend.name(), shared = backend.is_shared(), "cache backend ready");
    Ok(backend)
}

/// Process-wide services.
pub struct Services {
    pub instance: InstanceId,
    pub cache: Cache,
    pub invalidator: Arc<CacheInvalidator>,
    pub tokens: Arc<TokenLifecycleManager>,
    pub dispatcher: Arc<Dispatcher<Arc<dyn JobStore>>>,
}

impl Services {
    pub fn build(config: &FolioConfig, runtime: &Handle) -> Result<Self, StartupError> {
        config.validate()?;
        Self::assemble(config, Backends::connect(config, runtime)?)
    }

    /// Wire services over already constructed backends.
    pub fn assemble(config: &FolioConfig, backends: Backends) -> Result<Self, StartupError> {
        if config.instance.deployment == Deployment::Multi && !backends.cache.backend().is_shared() {
            return Err(ConfigError::Conflict(format!(
                "cache backend '{}' is not shared across instances",
                backends.cache.backend().name()
            ))
            .into());
        }

        let instance = config.instance_id()?;
        let invalidator = Arc::new(CacheInvalidator::new(backends.cache.clone()));
        let tokens = Arc::new(TokenLifecycleManager::new(
            backends.tokens,
            backends.cache.clone(),
            Arc::clone(&backends.clock),
            config.token_policy()?,
            config.token_lookup_ttl(),
        ));

        let deps = StandardJobDeps {
            previews: backends.previews,
            pages: backends.pages,
            tokens: Arc::clone(&tokens),
            invalidator: Arc::clone(&invalidator),
        };
        let registry = JobRegistry::builder()
            .register_all(standard_jobs(&deps, &config.standard_job_settings()?))?
            .build();

        let dispatcher = Arc::new(Dispatcher::new(
            instance.clone(),
            Arc::new(registry),
            backends.jobs,
            backends.clock,
            config.dispatcher_config(),
        ));

        info!(instance = %instance, jobs = dispatcher.registry().len(), "services assembled");
        Ok(Self {
            instance,
            cache: backends.cache,
            invalidator,
            tokens,
            dispatcher,
        })
    }

    /// Start the scheduler loop.
    pub fn start(&self) -> Result<DispatcherHandle, StartupError> {
        Ok(Arc::clone(&self.dispatcher).spawn()?)
    }
}

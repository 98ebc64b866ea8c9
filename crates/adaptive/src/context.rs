// Session context: configuration, runtime, connection factories and shared services
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::config::AdaptiveConfig;
use crate::encryption::Keyring;
use crate::error::AdaptiveError;
use crate::http::{ConnectionFactory, ReqwestFactory};
use crate::metrics::PerformanceMetrics;
use crate::plumbing::DemuxerFactory;

/// Everything a playlist manager needs from its embedder.
///
/// Passed explicitly to constructors; nothing in the engine is global.
pub struct Context {
    config: Arc<AdaptiveConfig>,
    factories: Vec<Arc<dyn ConnectionFactory>>,
    demuxers: Arc<DemuxerFactory>,
    keyring: Arc<Keyring>,
    metrics: Arc<PerformanceMetrics>,
    handle: Handle,
    runtime: Option<Runtime>,
}

impl Context {
    /// Owns a multi-thread runtime and talks HTTP(S) through reqwest.
    pub fn new(config: AdaptiveConfig) -> Result<Self, AdaptiveError> {
        let factory = ReqwestFactory::new(&config.http)?;
        Self::builder(config)
            .factory(Arc::new(factory))
            .build()
    }

    pub fn builder(config: AdaptiveConfig) -> ContextBuilder {
        ContextBuilder {
            config,
            factories: Vec::new(),
            demuxers: None,
            keyring: None,
            handle: None,
        }
    }

    pub fn config(&self) -> &Arc<AdaptiveConfig> {
        &self.config
    }

    pub fn factories(&self) -> &[Arc<dyn ConnectionFactory>] {
        &self.factories
    }

    pub fn demuxers(&self) -> &Arc<DemuxerFactory> {
        &self.demuxers
    }

    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    pub fn metrics(&self) -> &Arc<PerformanceMetrics> {
        &self.metrics
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs `future` to completion from a thread outside the runtime.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        match &self.runtime {
            Some(runtime) => runtime.block_on(future),
            None => self.handle.block_on(future),
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

pub struct ContextBuilder {
    config: AdaptiveConfig,
    factories: Vec<Arc<dyn ConnectionFactory>>,
    demuxers: Option<Arc<DemuxerFactory>>,
    keyring: Option<Arc<Keyring>>,
    handle: Option<Handle>,
}

impl ContextBuilder {
    /// Factories are tried in registration order.
    pub fn factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn demuxers(mut self, demuxers: DemuxerFactory) -> Self {
        self.demuxers = Some(Arc::new(demuxers));
        self
    }

    pub fn keyring(mut self, keyring: Arc<Keyring>) -> Self {
        self.keyring = Some(keyring);
        self
    }

    /// Uses an existing runtime instead of creating one.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build(self) -> Result<Context, AdaptiveError> {
        if self.factories.is_empty() {
            return Err(AdaptiveError::invalid_state(
                "at least one connection factory is required",
            ));
        }
        let (handle, runtime) = match self.handle {
            Some(handle) => (handle, None),
            None => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("adaptive-worker")
                    .enable_all()
                    .build()
                    .map_err(|e| AdaptiveError::runtime(e.to_string()))?;
                (runtime.handle().clone(), Some(runtime))
            }
        };
        Ok(Context {
            config: Arc::new(self.config),
            factories: self.factories,
            demuxers: self
                .demuxers
                .unwrap_or_else(|| Arc::new(DemuxerFactory::with_passthrough())),
            keyring: self.keyring.unwrap_or_default(),
            metrics: Arc::new(PerformanceMetrics::new()),
            handle,
            runtime,
        })
    }
}

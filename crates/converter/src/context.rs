use std::sync::Arc;

use log::{info, warn};

use crate::config::ConverterConfig;
use crate::engine::{EngineBackend, EngineHandle, EngineState};
use crate::error::Result;
use crate::ffmpeg::FfmpegBackend;
use crate::session::Session;

/// Process-wide owner of the engine handle; every session shares its load and invocation lock
pub struct ConverterContext {
    config: ConverterConfig,
    backend: Arc<dyn EngineBackend>,
    engine: Arc<EngineHandle>,
}

impl ConverterContext {
    /// Context backed by the system ffmpeg named in `config`
    pub fn new(config: ConverterConfig) -> Self {
        let backend = Arc::new(FfmpegBackend::new(&config));
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: ConverterConfig, backend: Arc<dyn EngineBackend>) -> Self {
        let engine = Arc::new(EngineHandle::new(Arc::clone(&backend)));
        Self {
            config,
            backend,
            engine,
        }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<EngineHandle> {
        &self.engine
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    /// Load the engine on first use; later calls return the same outcome
    pub async fn ensure_ready(&self) -> Result<()> {
        self.engine.ensure_ready().await
    }

    pub fn new_session(&self) -> Session {
        Session::new(Arc::clone(&self.engine), &self.config)
    }

    /// Replace a faulted engine with a fresh, unloaded handle.
    ///
    /// Sessions created earlier keep the old handle.
    pub fn rebuild_engine(&mut self) {
        if self.engine.is_busy() {
            warn!("Rebuilding transcoding engine while an invocation is in flight");
        }
        self.engine.shutdown();
        self.engine = Arc::new(EngineHandle::new(Arc::clone(&self.backend)));
        info!("Transcoding engine handle rebuilt");
    }

    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}

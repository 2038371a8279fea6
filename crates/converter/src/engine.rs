use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, OnceCell};

use crate::command::ConversionCommand;
use crate::error::{ConvertError, Result};
use crate::staging::{StagingScope, StagingStore};

/// Event emitted by the engine while an invocation runs
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// One line of engine log output
    Log(String),
    /// Completion ratio, nominally in [0, 1] but not guaranteed to be
    Progress(f64),
}

/// Ordered event stream handed to each observer
pub type EventStream = mpsc::UnboundedReceiver<EngineEvent>;

/// Engine lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum EngineState {
    Unloaded,
    Loading,
    Ready,
    Faulted(String),
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Unloaded => write!(f, "unloaded"),
            EngineState::Loading => write!(f, "loading"),
            EngineState::Ready => write!(f, "ready"),
            EngineState::Faulted(reason) => write!(f, "faulted: {}", reason),
        }
    }
}

/// How an invocation completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Fan-out of engine events to every subscribed observer.
///
/// Each observer gets an unbounded queue, so emitting never waits on a slow
/// consumer and nothing is dropped or reordered.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    observers: Arc<Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    pub fn log(&self, line: impl Into<String>) {
        self.emit(EngineEvent::Log(line.into()));
    }

    pub fn progress(&self, ratio: f64) {
        self.emit(EngineEvent::Progress(ratio));
    }

    pub fn emit(&self, event: EngineEvent) {
        let mut observers = self.observers.lock();
        // Drop observers whose receiver has gone away
        observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.closed.load(Ordering::SeqCst) {
            self.observers.lock().push(tx);
        }
        rx
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.observers.lock().clear();
    }
}

/// The opaque engine behind the handle.
#[async_trait]
pub trait EngineBackend: Send + Sync + 'static {
    /// One-time initialization (asset fetch, capability checks)
    async fn load(&self) -> anyhow::Result<()>;

    /// Run one invocation against the staging store, emitting events as it goes.
    ///
    /// A non-zero exit is reported through [`ExitOutcome`], not as an error.
    async fn run(
        &self,
        command: &ConversionCommand,
        store: &StagingStore,
        events: &EventSink,
    ) -> anyhow::Result<ExitOutcome>;
}

/// Shared handle to the one transcoding engine instance.
///
/// Loading happens once per handle and a failed load stays failed. Only one
/// invocation runs at a time; a second `execute` is rejected with `EngineBusy`.
pub struct EngineHandle {
    backend: Arc<dyn EngineBackend>,
    state: Mutex<EngineState>,
    load: OnceCell<std::result::Result<(), String>>,
    invocation: Arc<tokio::sync::Mutex<()>>,
    store: StagingStore,
    events: EventSink,
}

impl EngineHandle {
    pub fn new(backend: Arc<dyn EngineBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(EngineState::Unloaded),
            load: OnceCell::new(),
            invocation: Arc::new(tokio::sync::Mutex::new(())),
            store: StagingStore::new(),
            events: EventSink::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state.lock().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.state.lock() == EngineState::Ready
    }

    /// Whether an invocation is currently in flight
    pub fn is_busy(&self) -> bool {
        self.invocation.try_lock().is_err()
    }

    /// Load the engine once; every caller observes the same outcome.
    pub async fn ensure_ready(&self) -> Result<()> {
        if let EngineState::Faulted(reason) = self.state() {
            return Err(ConvertError::EngineLoad(reason));
        }

        let outcome = self
            .load
            .get_or_init(|| async {
                *self.state.lock() = EngineState::Loading;
                info!("Loading transcoding engine (this may take a moment)...");

                match self.backend.load().await {
                    Ok(()) => {
                        *self.state.lock() = EngineState::Ready;
                        info!("Transcoding engine loaded successfully");
                        Ok(())
                    }
                    Err(e) => {
                        let reason = format!("{:#}", e);
                        error!("Failed to load transcoding engine: {}", reason);
                        *self.state.lock() = EngineState::Faulted(reason.clone());
                        Err(reason)
                    }
                }
            })
            .await;

        outcome.clone().map_err(ConvertError::EngineLoad)
    }

    /// Run one command to completion.
    ///
    /// The backend runs on its own task, so dropping this future does not stop
    /// the invocation; the engine stays busy until it settles.
    pub async fn execute(&self, command: &ConversionCommand) -> Result<ExitOutcome> {
        if !self.is_ready() {
            return Err(ConvertError::EngineNotReady);
        }
        let permit = Arc::clone(&self.invocation)
            .try_lock_owned()
            .map_err(|_| ConvertError::EngineBusy)?;

        debug!("engine exec: {}", command);

        let backend = Arc::clone(&self.backend);
        let store = self.store.clone();
        let events = self.events.clone();
        let command = command.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            backend.run(&command, &store, &events).await
        });

        match task.await {
            Ok(Ok(outcome)) => {
                debug!("engine exit: {:?}", outcome.code);
                Ok(outcome)
            }
            Ok(Err(e)) => Err(ConvertError::EngineExec(format!("{:#}", e))),
            Err(e) => Err(ConvertError::EngineExec(format!("engine task failed: {}", e))),
        }
    }

    /// Register an observer for log and progress events
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// The engine's private staging namespace
    pub fn store(&self) -> &StagingStore {
        &self.store
    }

    /// Open a cleanup scope bound to this engine's invocation lock
    pub fn staging_scope(&self) -> StagingScope {
        StagingScope::with_settle(self.store.clone(), Arc::clone(&self.invocation))
    }

    /// Tear the engine down: no further events are delivered, no further loads or invocations.
    pub fn shutdown(&self) {
        if self.is_busy() {
            warn!("Shutting down transcoding engine with an invocation in flight");
        }
        self.events.close();
        *self.state.lock() = EngineState::Faulted("engine shut down".to_string());
        info!("Transcoding engine shut down");
    }
}

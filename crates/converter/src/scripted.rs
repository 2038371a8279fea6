use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::command::ConversionCommand;
use crate::engine::{EngineBackend, EngineEvent, EventSink, ExitOutcome};
use crate::staging::{StagedRole, StagingStore};

/// In-memory engine backend that replays a fixed script
#[derive(Default)]
pub struct ScriptedBackend {
    loads: AtomicUsize,
    load_delay: Duration,
    load_error: Option<String>,
    probe_events: Vec<EngineEvent>,
    transcode_events: Vec<EngineEvent>,
    output: Option<Vec<u8>>,
    transcode_exit: i32,
    gate: Option<Arc<Notify>>,
    runs: Mutex<Vec<ConversionCommand>>,
    staged_inputs: Mutex<Vec<(String, usize)>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn failing_load(mut self, reason: &str) -> Self {
        self.load_error = Some(reason.to_string());
        self
    }

    /// Log lines emitted by probe invocations
    pub fn with_probe_log(mut self, lines: &[&str]) -> Self {
        self.probe_events = lines.iter().map(|l| EngineEvent::Log(l.to_string())).collect();
        self
    }

    pub fn with_transcode_events(mut self, events: Vec<EngineEvent>) -> Self {
        self.transcode_events = events;
        self
    }

    /// Bytes written to the command's output name on transcode
    pub fn with_output(mut self, bytes: Vec<u8>) -> Self {
        self.output = Some(bytes);
        self
    }

    pub fn with_transcode_exit(mut self, code: i32) -> Self {
        self.transcode_exit = code;
        self
    }

    /// Hold every invocation until the gate is notified
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> Vec<ConversionCommand> {
        self.runs.lock().clone()
    }

    /// (name, byte length) of the input seen by each invocation
    pub fn staged_inputs(&self) -> Vec<(String, usize)> {
        self.staged_inputs.lock().clone()
    }
}

#[async_trait]
impl EngineBackend for ScriptedBackend {
    async fn load(&self) -> Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        match &self.load_error {
            Some(reason) => Err(anyhow!("{}", reason)),
            None => Ok(()),
        }
    }

    async fn run(
        &self,
        command: &ConversionCommand,
        store: &StagingStore,
        events: &EventSink,
    ) -> Result<ExitOutcome> {
        self.runs.lock().push(command.clone());

        let input = store.get(command.input())?;
        self.staged_inputs
            .lock()
            .push((command.input().to_string(), input.len()));

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        if command.is_probe() {
            for event in &self.probe_events {
                events.emit(event.clone());
            }
            events.log("At least one output file must be specified");
            return Ok(ExitOutcome { code: Some(1) });
        }

        for event in &self.transcode_events {
            events.emit(event.clone());
        }
        if let (Some(bytes), Some(name)) = (&self.output, command.output()) {
            store.put(name, bytes.clone(), StagedRole::Output);
        }
        Ok(ExitOutcome {
            code: Some(self.transcode_exit),
        })
    }
}

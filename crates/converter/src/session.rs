use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::artifact::ConversionArtifact;
use crate::classifier::{Diagnosis, DiagnosticClassifier, PhraseClassifier};
use crate::command::{CommandBuilder, ConversionCommand};
use crate::config::ConverterConfig;
use crate::engine::{EngineEvent, EngineHandle, ExitOutcome};
use crate::error::{ConvertError, Result};
use crate::staging::{output_name_for, sanitize_name};

/// Session status as shown to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Analyzing,
    Processing,
    Complete,
    Error,
}

/// Read-only view of a session, published after every change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub status: SessionStatus,
    /// Percent complete, always within [0, 100]
    pub progress: f64,
    pub log: Vec<String>,
    pub diagnosis: Diagnosis,
    /// Display name of the selected file
    pub input_name: Option<String>,
    /// Suggested filename of the finished artifact
    pub result_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            status: SessionStatus::Idle,
            progress: 0.0,
            log: Vec::new(),
            diagnosis: Diagnosis::None,
            input_name: None,
            result_name: None,
            updated_at: Utc::now(),
        }
    }
}

/// A user-selected file: raw bytes plus the name it was picked under
#[derive(Debug, Clone)]
pub struct InputFile {
    name: String,
    bytes: Bytes,
}

impl InputFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Map an engine ratio to a percentage in [0, 100]; NaN carries no information
pub fn clamp_progress(ratio: f64) -> Option<f64> {
    if ratio.is_nan() {
        return None;
    }
    Some((ratio * 100.0).clamp(0.0, 100.0))
}

/// One user's conversion: the selected file plus the state the caller observes.
///
/// ```text
/// Idle --submit--> Analyzing --probe done--> Idle
/// Idle | Complete | Error --convert--> Processing --ok--> Complete
///                                                  \--err--> Error
/// ```
pub struct Session {
    engine: Arc<EngineHandle>,
    builder: CommandBuilder,
    classifier: Arc<dyn DiagnosticClassifier>,
    config: ConverterConfig,
    input: Option<InputFile>,
    result: Option<ConversionArtifact>,
    state: watch::Sender<SessionSnapshot>,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(engine: Arc<EngineHandle>, config: &ConverterConfig) -> Self {
        let id = Uuid::new_v4();
        let (state, _) = watch::channel(SessionSnapshot::new(id));
        debug!("Session {}: created", id);

        Self {
            engine,
            builder: CommandBuilder::new(config.transcode.clone()),
            classifier: Arc::new(PhraseClassifier::new()),
            config: config.clone(),
            input: None,
            result: None,
            state,
            created_at: Utc::now(),
        }
    }

    /// Swap the log classifier, e.g. for an engine with structured error codes
    pub fn with_classifier(mut self, classifier: Arc<dyn DiagnosticClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn id(&self) -> Uuid {
        self.state.borrow().id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Subscribe to snapshots; the receiver sees every transition and progress update
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    pub fn diagnosis(&self) -> Diagnosis {
        self.state.borrow().diagnosis.clone()
    }

    pub fn input(&self) -> Option<&InputFile> {
        self.input.as_ref()
    }

    /// Select a file and, if the engine is ready, analyze it.
    ///
    /// Analysis always ends back in Idle: the probe invocation is expected to
    /// exit with a failure, and only its log output is used. A probe that could
    /// not run because another invocation holds the engine is reported as
    /// `EngineBusy` and the file is not selected.
    pub async fn submit_file(&mut self, file: InputFile) -> Result<()> {
        if !self.config.accepts(file.name()) {
            warn!("Session {}: rejected {} (not an accepted file type)", self.id(), file.name());
            return Err(ConvertError::UnsupportedInput {
                name: file.name().to_string(),
                expected: self.config.accepted_extensions.join(", "),
            });
        }

        let analyze = self.engine.is_ready();
        if analyze && self.engine.is_busy() {
            warn!("Session {}: engine busy, cannot analyze {}", self.id(), file.name());
            return Err(ConvertError::EngineBusy);
        }

        info!("Session {}: selected {} ({} bytes)", self.id(), file.name(), file.len());

        let name = file.name().to_string();
        let bytes = file.bytes().clone();
        self.input = Some(file);
        self.result = None;
        self.update(|s| {
            s.input_name = Some(name.clone());
            s.result_name = None;
        });

        if !analyze {
            debug!("Session {}: engine not ready, skipping analysis", self.id());
            return Ok(());
        }

        if let Err(e) = self.analyze(&name, bytes).await {
            self.input = None;
            self.update(|s| {
                s.status = SessionStatus::Idle;
                s.input_name = None;
                s.log.clear();
                s.diagnosis = Diagnosis::None;
            });
            return Err(e);
        }
        Ok(())
    }

    async fn analyze(&mut self, display_name: &str, bytes: Bytes) -> Result<()> {
        let staged = sanitize_name(display_name);
        // Someone else's invocation owns that name until its scope drops
        if self.engine.store().contains(&staged) {
            return Err(ConvertError::EngineBusy);
        }

        self.update(|s| {
            s.status = SessionStatus::Analyzing;
            s.log.clear();
            s.diagnosis = Diagnosis::None;
        });
        self.push_log(format!("Analyzing file format: {}", display_name));

        let mut scope = self.engine.staging_scope();
        scope.stage_input(&staged, bytes);

        let command = self.builder.build_probe(&staged);
        match self.run_observed(&command).await {
            Ok(outcome) => debug!("Session {}: analysis complete (exit {:?})", self.id(), outcome.code),
            // The probe never ran, so there is nothing to classify
            Err(ConvertError::EngineBusy) => return Err(ConvertError::EngineBusy),
            Err(e) => debug!("Session {}: analysis complete ({})", self.id(), e),
        }
        drop(scope);

        self.update(|s| s.status = SessionStatus::Idle);

        let diagnosis = self.diagnosis();
        if diagnosis.is_unsupported() {
            warn!(
                "Session {}: {} uses a codec the engine cannot decode ({})",
                self.id(),
                display_name,
                diagnosis.codec_hint().unwrap_or("unknown codec")
            );
        }
        Ok(())
    }

    /// Convert the selected file to MP4.
    ///
    /// Precondition failures (no file, engine not ready, engine busy) leave the
    /// session untouched. A blocked unsupported-codec diagnosis and every
    /// pipeline failure move the session to Error.
    pub async fn convert(&mut self) -> Result<&ConversionArtifact> {
        let Some(input) = self.input.as_ref() else {
            return Err(ConvertError::NoInput);
        };
        let name = input.name().to_string();
        let bytes = input.bytes().clone();

        if !self.engine.is_ready() {
            return Err(ConvertError::EngineNotReady);
        }
        if self.engine.is_busy() {
            return Err(ConvertError::EngineBusy);
        }

        let diagnosis = self.diagnosis();
        if self.config.block_unsupported && diagnosis.is_unsupported() {
            let err = ConvertError::UnsupportedCodec {
                codec: diagnosis.codec_hint().map(str::to_string),
            };
            warn!("Session {}: refusing to convert {}: {}", self.id(), name, err);
            self.fail(&err);
            return Err(err);
        }

        self.result = None;
        self.update(|s| {
            s.status = SessionStatus::Processing;
            s.progress = 0.0;
            s.log.clear();
            s.diagnosis = Diagnosis::None;
            s.result_name = None;
        });
        info!("Session {}: converting {}", self.id(), name);

        match self.transcode(&name, bytes).await {
            Ok(artifact) => {
                info!(
                    "Session {}: conversion complete, {} ({} bytes)",
                    self.id(),
                    artifact.filename(),
                    artifact.len()
                );
                let filename = artifact.filename().to_string();
                self.result = Some(artifact);
                self.update(|s| {
                    s.status = SessionStatus::Complete;
                    s.result_name = Some(filename);
                });
                self.download_result()
            }
            Err(e) => {
                error!("Session {}: conversion failed: {}", self.id(), e);
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Stage, run, read back. Staged names are released when `scope` drops.
    async fn transcode(&mut self, display_name: &str, bytes: Bytes) -> Result<ConversionArtifact> {
        let input_name = sanitize_name(display_name);
        let output_name = output_name_for(&input_name);

        let mut scope = self.engine.staging_scope();
        self.push_log(format!("Writing file to memory: {}", input_name));
        scope.stage_input(&input_name, bytes);
        scope.claim_output(&output_name);

        let command = self.builder.build_transcode(&input_name, &output_name);
        self.push_log("Starting conversion process...".to_string());
        let outcome = self.run_observed(&command).await?;

        let diagnosis = self.diagnosis();
        if diagnosis.is_unsupported() {
            return Err(ConvertError::UnsupportedCodec {
                codec: diagnosis.codec_hint().map(str::to_string),
            });
        }
        if !outcome.success() {
            return Err(ConvertError::EngineExec(match outcome.code {
                Some(code) => format!("engine exited with status {}", code),
                None => "engine terminated without an exit status".to_string(),
            }));
        }

        self.push_log("Reading output file...".to_string());
        let data = scope.store().get(&output_name)?;
        debug!("Session {}: output file size {}", self.id(), data.len());
        if data.is_empty() {
            return Err(ConvertError::EmptyOutput);
        }

        Ok(ConversionArtifact::new(data, display_name))
    }

    /// Execute while applying engine events to the session as they arrive.
    async fn run_observed(&mut self, command: &ConversionCommand) -> Result<ExitOutcome> {
        let engine = Arc::clone(&self.engine);
        let mut events = engine.subscribe();
        let execution = engine.execute(command);
        tokio::pin!(execution);

        let outcome = loop {
            tokio::select! {
                biased;
                outcome = &mut execution => break outcome,
                Some(event) = events.recv() => self.apply(event),
            }
        };

        // A busy rejection never started, so anything queued belongs to someone else
        if !matches!(outcome, Err(ConvertError::EngineBusy)) {
            while let Ok(event) = events.try_recv() {
                self.apply(event);
            }
        }

        outcome
    }

    fn apply(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Log(line) => {
                debug!("[engine] {}", line);
                let found = self.classifier.classify(&line);
                let newly_flagged = found.is_unsupported() && !self.state.borrow().diagnosis.is_unsupported();
                if newly_flagged {
                    info!("Session {}: unsupported decoder reported: {}", self.id(), line);
                }
                self.update(|s| {
                    s.diagnosis.absorb(found);
                    s.log.push(line);
                });
            }
            EngineEvent::Progress(ratio) => {
                if let Some(percent) = clamp_progress(ratio) {
                    self.update(|s| s.progress = percent);
                }
            }
        }
    }

    /// The finished artifact; only available in Complete
    pub fn download_result(&self) -> Result<&ConversionArtifact> {
        if self.status() != SessionStatus::Complete {
            return Err(ConvertError::NoResult);
        }
        self.result.as_ref().ok_or(ConvertError::NoResult)
    }

    /// Discard the selected file and any result, back to Idle
    pub fn reset(&mut self) {
        self.input = None;
        self.result = None;
        let id = self.id();
        self.state.send_replace(SessionSnapshot::new(id));
        debug!("Session {}: reset", id);
    }

    fn fail(&mut self, err: &ConvertError) {
        self.result = None;
        let line = format!("ERROR: {}", err);
        self.update(|s| {
            s.status = SessionStatus::Error;
            s.result_name = None;
            s.log.push(line);
        });
    }

    fn push_log(&mut self, line: String) {
        self.update(|s| s.log.push(line));
    }

    fn update(&mut self, f: impl FnOnce(&mut SessionSnapshot)) {
        self.state.send_modify(|s| {
            f(s);
            s.updated_at = Utc::now();
        });
    }
}

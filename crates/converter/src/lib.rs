pub mod artifact;
pub mod classifier;
pub mod command;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod ffmpeg;
pub mod session;
pub mod sidecar;
pub mod staging;

#[cfg(test)]
mod scripted;

pub use artifact::ConversionArtifact;
pub use classifier::{Diagnosis, DiagnosticClassifier, PhraseClassifier};
pub use config::{ConverterConfig, TranscodePolicy};
pub use context::ConverterContext;
pub use engine::{EngineBackend, EngineEvent, EngineHandle, EngineState};
pub use error::{ConvertError, Result};
pub use session::{InputFile, Session, SessionSnapshot, SessionStatus};

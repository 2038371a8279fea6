use thiserror::Error;

/// Errors surfaced by the engine handle, staging store and session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConvertError {
    /// Engine asset fetch or initialization failed. Terminal for the handle.
    #[error("Failed to load FFmpeg: {0}")]
    EngineLoad(String),

    /// An invocation was attempted before the engine reached Ready.
    #[error("transcoding engine is not ready")]
    EngineNotReady,

    /// Another invocation is already in flight on the shared engine.
    #[error("transcoding engine is busy with another invocation")]
    EngineBusy,

    /// Invocation-level failure (spawn, IO, or a failed transcode exit).
    #[error("engine invocation failed: {0}")]
    EngineExec(String),

    /// Raised after the classifier matched a decoder-not-found phrase.
    #[error("{}", unsupported_codec_message(.codec))]
    UnsupportedCodec { codec: Option<String> },

    /// Engine reported success but wrote a zero-byte file.
    #[error("Conversion produced an empty file. The input video codec may be unsupported.")]
    EmptyOutput,

    /// Staging store miss.
    #[error("staged file not found: {0}")]
    NotFound(String),

    /// Download requested without a completed result.
    #[error("no conversion result is available")]
    NoResult,

    /// Convert requested with no file selected.
    #[error("no input file selected")]
    NoInput,

    /// Submitted file does not have an accepted extension.
    #[error("unsupported input file '{name}': expected one of {expected}")]
    UnsupportedInput { name: String, expected: String },
}

impl ConvertError {
    /// Load failures block every conversion until a new handle is built.
    pub fn is_engine_fault(&self) -> bool {
        matches!(self, ConvertError::EngineLoad(_))
    }
}

fn unsupported_codec_message(codec: &Option<String>) -> String {
    match codec {
        Some(codec) => format!(
            "This file contains {} video which is not supported by the transcoding engine.",
            codec.to_uppercase()
        ),
        None => "This file uses a codec which is not supported by the transcoding engine.".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;

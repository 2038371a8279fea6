use std::fmt;

use crate::config::TranscodePolicy;

/// What an invocation is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    /// Full transcode producing an output file
    Transcode,
    /// Input-only call that provokes diagnostic log output; expected to exit non-zero
    Probe,
}

/// Immutable argument list for a single engine invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionCommand {
    kind: InvocationKind,
    input: String,
    output: Option<String>,
    args: Vec<String>,
}

impl ConversionCommand {
    pub fn kind(&self) -> InvocationKind {
        self.kind
    }

    /// Staged name the engine reads
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Staged name the engine writes, if any
    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    /// Full ordered argument sequence
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn is_probe(&self) -> bool {
        self.kind == InvocationKind::Probe
    }
}

impl fmt::Display for ConversionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args.join(" "))
    }
}

/// Command builder for generating engine argument lists
#[derive(Debug, Clone, Default)]
pub struct CommandBuilder {
    policy: TranscodePolicy,
}

impl CommandBuilder {
    /// Create a builder for the given encoding policy
    pub fn new(policy: TranscodePolicy) -> Self {
        CommandBuilder { policy }
    }

    /// Build the transcode command
    ///
    /// Generates:
    /// - Input file
    /// - Video re-encode at a bounded quality target
    /// - Audio re-encode at a fixed bitrate
    /// - Progressive-playback container flag
    /// - Overwrite without prompting
    /// - Output file
    pub fn build_transcode(&self, input_name: &str, output_name: &str) -> ConversionCommand {
        let p = &self.policy;
        let mut args = Vec::new();

        args.push("-i".to_string());
        args.push(input_name.to_string());

        args.push("-c:v".to_string());
        args.push(p.video_codec.clone());
        args.push("-preset".to_string());
        args.push(p.preset.clone());
        args.push("-crf".to_string());
        args.push(p.crf.to_string());

        args.push("-c:a".to_string());
        args.push(p.audio_codec.clone());
        args.push("-b:a".to_string());
        args.push(p.audio_bitrate.clone());

        if p.faststart {
            args.push("-movflags".to_string());
            args.push("+faststart".to_string());
        }

        args.push("-y".to_string());
        args.push(output_name.to_string());

        ConversionCommand {
            kind: InvocationKind::Transcode,
            input: input_name.to_string(),
            output: Some(output_name.to_string()),
            args,
        }
    }

    /// Build the probe-only command (`-i <input>`, no output)
    pub fn build_probe(&self, input_name: &str) -> ConversionCommand {
        ConversionCommand {
            kind: InvocationKind::Probe,
            input: input_name.to_string(),
            output: None,
            args: vec!["-i".to_string(), input_name.to_string()],
        }
    }
}

use serde::Serialize;

/// Structured classification of an unsupported-input condition
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnosis {
    #[default]
    None,
    /// The engine has no decoder for one of the input streams
    UnsupportedDecoder { codec: Option<String> },
}

impl Diagnosis {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Diagnosis::UnsupportedDecoder { .. })
    }

    /// Codec named by the matching log line, if any
    pub fn codec_hint(&self) -> Option<&str> {
        match self {
            Diagnosis::UnsupportedDecoder { codec } => codec.as_deref(),
            Diagnosis::None => None,
        }
    }

    /// Fold a newly classified line into a session's diagnosis.
    ///
    /// The first `UnsupportedDecoder` sticks; later lines never clear or replace it.
    pub fn absorb(&mut self, next: Diagnosis) {
        if !self.is_unsupported() && next.is_unsupported() {
            *self = next;
        }
    }
}

/// Turns free-text engine log lines into a [`Diagnosis`].
///
/// Implementations must depend only on the text, never on exit codes.
pub trait DiagnosticClassifier: Send + Sync {
    fn classify(&self, line: &str) -> Diagnosis;
}

/// How to pull a codec name out of a matching line
#[derive(Debug, Clone, Copy)]
enum HintRule {
    /// `Decoder (codec av1) not found for input stream #0:0`
    Parenthesized,
    /// `Decoding requested, but no decoder found for: av1`
    AfterColon,
    /// `Unknown decoder 'av1'`
    Quoted,
    None,
}

/// A known failure phrase
#[derive(Debug, Clone, Copy)]
struct Signature {
    needle: &'static str,
    hint: HintRule,
}

/// Decoder-not-found family, checked in order
const DECODER_NOT_FOUND: &[Signature] = &[
    Signature { needle: "Decoder (codec ", hint: HintRule::Parenthesized },
    Signature { needle: "Decoder not found", hint: HintRule::None },
    Signature { needle: "no decoder found for:", hint: HintRule::AfterColon },
    Signature { needle: "Unknown decoder", hint: HintRule::Quoted },
];

/// Fixed-phrase classifier for ffmpeg's decoder-not-found messages
#[derive(Debug, Clone, Copy, Default)]
pub struct PhraseClassifier;

impl PhraseClassifier {
    pub fn new() -> Self {
        PhraseClassifier
    }
}

impl DiagnosticClassifier for PhraseClassifier {
    fn classify(&self, line: &str) -> Diagnosis {
        for sig in DECODER_NOT_FOUND {
            let Some(pos) = line.find(sig.needle) else {
                continue;
            };
            // "Decoder (codec x)" alone is not a failure without the verdict
            if matches!(sig.hint, HintRule::Parenthesized) && !line.contains("not found") {
                continue;
            }

            let rest = &line[pos + sig.needle.len()..];
            let codec = match sig.hint {
                HintRule::Parenthesized => rest.split(')').next(),
                HintRule::AfterColon => rest.split_whitespace().next(),
                HintRule::Quoted => rest.split('\'').nth(1),
                HintRule::None => None,
            }
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| c.to_lowercase());

            return Diagnosis::UnsupportedDecoder { codec };
        }

        Diagnosis::None
    }
}

use std::path::Path;

use bytes::Bytes;

/// MIME type of every artifact the converter produces
pub const OUTPUT_MIME_TYPE: &str = "video/mp4";

/// Finished conversion output, ready to hand to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionArtifact {
    bytes: Bytes,
    filename: String,
}

impl ConversionArtifact {
    /// Wrap engine output for a file originally called `display_name`
    pub fn new(bytes: Bytes, display_name: &str) -> Self {
        Self {
            bytes,
            filename: suggested_filename(display_name),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Suggested download name, `<basename>.mp4`
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn mime_type(&self) -> &'static str {
        OUTPUT_MIME_TYPE
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// `<basename>.mp4` for a user-facing filename
pub fn suggested_filename(display_name: &str) -> String {
    let path = Path::new(display_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("output");
    format!("{}.mp4", stem)
}

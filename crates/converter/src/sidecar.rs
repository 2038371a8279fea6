use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use std::fs;

use crate::artifact::ConversionArtifact;

/// Where to write an artifact: the explicit override, else next to the input.
///
/// Never the input itself; a colliding path becomes `<stem>.converted.mp4`.
pub fn output_path_for(input: &Path, artifact: &ConversionArtifact, override_path: Option<&Path>) -> PathBuf {
    let path = match override_path {
        Some(path) if path.is_dir() => path.join(artifact.filename()),
        Some(path) => path.to_path_buf(),
        None => input
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(artifact.filename()),
    };

    if !is_same_file(&path, input) {
        return path;
    }
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    path.with_file_name(format!("{}.converted.mp4", stem))
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Write the artifact bytes to `path`, via a temp file in the same directory
pub fn write_artifact(path: &Path, artifact: &ConversionArtifact) -> Result<()> {
    let mut tmp_path = path.to_path_buf();
    tmp_path.set_extension("mp4.tmp");

    fs::write(&tmp_path, artifact.bytes())
        .with_context(|| format!("Failed to write output: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to move output into place: {}", path.display()))?;
    Ok(())
}

/// Get the path to the why.txt file for a given media file (`clip.mkv` -> `clip.why.txt`)
pub fn why_txt_path(file_path: &Path) -> PathBuf {
    let mut path = file_path.to_path_buf();
    path.set_extension("why.txt");
    path
}

/// Write a why.txt file explaining why a conversion failed, followed by the engine log
pub fn write_why_txt(file_path: &Path, reason: &str, log: &[String]) -> Result<()> {
    let why_path = why_txt_path(file_path);
    let mut contents = format!("{}\n", reason);
    if !log.is_empty() {
        contents.push_str("\n--- log ---\n");
        for line in log {
            contents.push_str(line);
            contents.push('\n');
        }
    }
    fs::write(&why_path, contents)
        .with_context(|| format!("Failed to write why.txt: {}", why_path.display()))?;
    Ok(())
}

//! Transcoder driving external command-line tools.
//!
//! | input → output | route |
//! |---|---|
//! | native → wav | decoder |
//! | wav → native | encoder |
//! | other → native | ffmpeg to wav, then encoder |
//! | native → other | decoder to wav, then ffmpeg |
//! | anything else | ffmpeg |

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{fresh_output_path, Transcoder};
use crate::config::{extension_of, ToolPaths};

const WAV: &str = "wav";

/// Error type for the CLI transcoder.
#[derive(Debug, thiserror::Error)]
pub enum CliTranscodeError {
    /// Input file does not exist.
    #[error("Input file does not exist: {}", .0.display())]
    MissingInput(PathBuf),
    /// Input file has no extension to dispatch on.
    #[error("Input file has no extension: {}", .0.display())]
    NoExtension(PathBuf),
    /// Input is already in the target format.
    #[error("Input and output extension are both .{0}")]
    SameFormat(String),
    /// Tool could not be started.
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        /// Tool path.
        tool: String,
        /// Spawn error.
        #[source]
        source: std::io::Error,
    },
    /// Tool exited unsuccessfully or produced no output.
    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        /// Tool path.
        tool: String,
        /// Exit status description.
        status: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Output directory could not be created.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transcoder shelling out to ffmpeg, a native-codec decoder and encoder.
#[derive(Debug, Clone)]
pub struct CliTranscoder {
    tools: ToolPaths,
    native_extension: String,
    output_dir: PathBuf,
}

impl CliTranscoder {
    /// Create a transcoder writing into `output_dir`.
    pub fn new(tools: ToolPaths, native_extension: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            tools,
            native_extension: native_extension.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Directory outputs are written to.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn convert(&self, input: &Path, output: &Path) -> Result<(), CliTranscodeError> {
        let input_ext = extension_of(input).ok_or_else(|| CliTranscodeError::NoExtension(input.to_path_buf()))?;
        let output_ext = extension_of(output).ok_or_else(|| CliTranscodeError::NoExtension(output.to_path_buf()))?;
        if input_ext == output_ext {
            return Err(CliTranscodeError::SameFormat(input_ext));
        }

        info!(input = %input.display(), output = %output.display(), "Converting audio");
        let native = self.native_extension.as_str();

        if input_ext == native && output_ext == WAV {
            self.decode(input, output).await
        } else if input_ext == WAV && output_ext == native {
            self.encode(input, output).await
        } else if output_ext == native {
            let wav = output.with_extension(WAV);
            self.ffmpeg(input, &wav).await?;
            let result = self.encode(&wav, output).await;
            remove_intermediate(&wav).await;
            result
        } else if input_ext == native {
            let wav = output.with_extension(WAV);
            self.decode(input, &wav).await?;
            let result = self.ffmpeg(&wav, output).await;
            remove_intermediate(&wav).await;
            result
        } else {
            self.ffmpeg(input, output).await
        }
    }

    async fn decode(&self, input: &Path, output: &Path) -> Result<(), CliTranscodeError> {
        let mut cmd = Command::new(&self.tools.vgmstream);
        cmd.arg(input).arg("-o").arg(output);
        run(cmd, &self.tools.vgmstream, output).await
    }

    async fn encode(&self, input: &Path, output: &Path) -> Result<(), CliTranscodeError> {
        let mut cmd = Command::new(&self.tools.wem_encoder);
        cmd.arg(input).arg(output);
        run(cmd, &self.tools.wem_encoder, output).await
    }

    async fn ffmpeg(&self, input: &Path, output: &Path) -> Result<(), CliTranscodeError> {
        let mut cmd = Command::new(&self.tools.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "warning", "-i"])
            .arg(input)
            .arg("-y")
            .arg(output);
        run(cmd, &self.tools.ffmpeg, output).await
    }
}

async fn run(mut cmd: Command, tool: &Path, output: &Path) -> Result<(), CliTranscodeError> {
    let tool = tool.display().to_string();
    debug!(tool = %tool, "Spawning transcoder");

    let result = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| CliTranscodeError::Spawn {
            tool: tool.clone(),
            source,
        })?;

    if !result.status.success() {
        return Err(CliTranscodeError::ToolFailed {
            tool,
            status: result.status.to_string(),
            stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
        });
    }
    if !tokio::fs::try_exists(output).await.unwrap_or(false) {
        return Err(CliTranscodeError::ToolFailed {
            tool,
            status: result.status.to_string(),
            stderr: format!("no output written to {}", output.display()),
        });
    }
    Ok(())
}

async fn remove_intermediate(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove intermediate wav");
    }
}

#[async_trait]
impl Transcoder for CliTranscoder {
    type Error = CliTranscodeError;

    async fn transcode(&self, input: &Path, target_extension: &str) -> Result<PathBuf, Self::Error> {
        if !tokio::fs::try_exists(input).await.unwrap_or(false) {
            return Err(CliTranscodeError::MissingInput(input.to_path_buf()));
        }
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let output = fresh_output_path(&self.output_dir, target_extension);
        self.convert(input, &output).await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcoder(dir: &Path) -> CliTranscoder {
        let tools = ToolPaths {
            ffmpeg: PathBuf::from("/nonexistent/ffmpeg"),
            vgmstream: PathBuf::from("/nonexistent/vgmstream-cli"),
            wem_encoder: PathBuf::from("/nonexistent/encoder"),
        };
        CliTranscoder::new(tools, "wem", dir.join("transcode"))
    }

    #[tokio::test]
    async fn test_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let result = transcoder(dir.path())
            .transcode(&dir.path().join("absent.wav"), "wem")
            .await;
        assert!(matches!(result, Err(CliTranscodeError::MissingInput(_))));
    }

    #[tokio::test]
    async fn test_same_format_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("clip.wav");
        tokio::fs::write(&input, b"RIFF").await.unwrap();

        let result = transcoder(dir.path()).transcode(&input, "wav").await;
        assert!(matches!(result, Err(CliTranscodeError::SameFormat(ext)) if ext == "wav"));
    }

    #[tokio::test]
    async fn test_missing_tool_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("clip.wav");
        tokio::fs::write(&input, b"RIFF").await.unwrap();

        let result = transcoder(dir.path()).transcode(&input, "wem").await;
        match result {
            Err(CliTranscodeError::Spawn { tool, .. }) => assert!(tool.ends_with("encoder")),
            other => panic!("expected spawn error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ogg_to_native_starts_with_ffmpeg() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("clip.ogg");
        tokio::fs::write(&input, b"OggS").await.unwrap();

        let result = transcoder(dir.path()).transcode(&input, "wem").await;
        match result {
            Err(CliTranscodeError::Spawn { tool, .. }) => assert!(tool.ends_with("ffmpeg")),
            other => panic!("expected spawn error, got {other:?}"),
        }
    }
}

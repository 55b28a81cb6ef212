//! Copying transcoder for testing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{fresh_output_path, Transcoder};

/// Error type for the stub transcoder.
#[derive(Debug, thiserror::Error)]
pub enum StubTranscodeError {
    /// Input was registered to fail.
    #[error("Simulated failure for {}", .0.display())]
    Simulated(PathBuf),
    /// Copy failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transcoder that copies the input bytes under the new extension.
#[derive(Debug)]
pub struct StubTranscoder {
    output_dir: PathBuf,
    calls: AtomicUsize,
    failing: Mutex<HashSet<PathBuf>>,
}

impl StubTranscoder {
    /// Create a stub writing into `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            calls: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Make every conversion of `input` fail.
    pub fn fail_on(&self, input: impl Into<PathBuf>) {
        self.failing.lock().insert(input.into());
    }

    /// Number of conversions attempted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for StubTranscoder {
    type Error = StubTranscodeError;

    async fn transcode(&self, input: &Path, target_extension: &str) -> Result<PathBuf, Self::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(input) {
            return Err(StubTranscodeError::Simulated(input.to_path_buf()));
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output = fresh_output_path(&self.output_dir, target_extension);
        tokio::fs::copy(input, &output).await?;
        Ok(output)
    }
}

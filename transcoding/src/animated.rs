//! Animated transcoding through an external ffmpeg process.
//!
//! Each call owns a [`ScratchSpace`]: a uniquely named temporary directory
//! holding the input and output files. The directory is removed when the
//! scratch space drops, which covers success, failure, timeout and the
//! caller dropping the future mid-flight.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{Result, TranscodeError};
use crate::quality::{AnimatedImageParams, VideoParams};

/// Default wall clock budget for one ffmpeg run.
pub const DEFAULT_TRANSCODE_TIMEOUT: Duration = Duration::from_secs(60);

/// Black pixels within this similarity/blend become transparent.
pub const TRANSPARENCY_FILTER: &str = "colorkey=0x000000:0.1:0.1";

const SCRATCH_PREFIX: &str = "recompress-";

/// What an animated source should become.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimatedTarget {
    AnimatedImage(AnimatedImageParams),
    Video(VideoParams),
}

impl AnimatedTarget {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::AnimatedImage(_) => "webp",
            Self::Video(_) => "mp4",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::AnimatedImage(_) => "image/webp",
            Self::Video(_) => "video/mp4",
        }
    }
}

/// Converts an animated source into the requested target.
#[async_trait]
pub trait AnimatedTranscoder: Send + Sync {
    async fn transcode(
        &self,
        source: &[u8],
        source_extension: &str,
        target: &AnimatedTarget,
    ) -> Result<Vec<u8>>;
}

/// Per-call temporary directory with an input and an output path.
pub struct ScratchSpace {
    dir: TempDir,
    input: PathBuf,
    output: PathBuf,
}

impl ScratchSpace {
    pub fn new_in(root: &Path, input_extension: &str, output_extension: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(root)?;
        let input = dir.path().join(format!("input.{}", input_extension));
        let output = dir.path().join(format!("output.{}", output_extension));

        Ok(Self { dir, input, output })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        // TempDir removes the directory itself; this only reports failures
        if let Err(e) = std::fs::remove_dir_all(self.dir.path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "Failed to remove scratch space {}: {}",
                    self.dir.path().display(),
                    e
                );
            }
        }
    }
}

/// Builds the ffmpeg argument list for one conversion.
pub fn ffmpeg_args(input: &Path, output: &Path, target: &AnimatedTarget) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-vf".into(),
        TRANSPARENCY_FILTER.into(),
    ];

    match target {
        AnimatedTarget::AnimatedImage(params) => {
            args.extend([
                "-c:v".to_string(),
                "libvpx-vp9".to_string(),
                "-b:v".to_string(),
                params.bitrate.to_string(),
                "-crf".to_string(),
                params.crf.to_string(),
                "-pix_fmt".to_string(),
                "yuva420p".to_string(),
                "-loop".to_string(),
                "0".to_string(),
            ]);
        }
        AnimatedTarget::Video(params) => {
            args.extend([
                "-c:v".to_string(),
                "libx264".to_string(),
                "-crf".to_string(),
                params.crf.to_string(),
                "-pix_fmt".to_string(),
                "yuv420p".to_string(),
                "-movflags".to_string(),
                "+faststart".to_string(),
            ]);
        }
    }

    args.push(output.to_string_lossy().into_owned());
    args
}

/// Shells out to ffmpeg over a fresh scratch space per call.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
    scratch_root: PathBuf,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            scratch_root: scratch_root.into(),
            timeout: DEFAULT_TRANSCODE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    async fn run(&self, scratch: &ScratchSpace, target: &AnimatedTarget) -> Result<()> {
        let args = ffmpeg_args(scratch.input(), scratch.output(), target);
        log::debug!("Running {} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                program: self.program_name(),
                source,
            })?;

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                log::warn!(
                    "{} exceeded {:?}, killing pid {:?}",
                    self.program_name(),
                    self.timeout,
                    child.id()
                );
                if let Err(e) = child.kill().await {
                    log::error!("Failed to kill {}: {}", self.program_name(), e);
                }
                return Err(TranscodeError::Timeout(self.timeout));
            }
        };

        let stderr = match stderr_reader {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if !status.success() {
            return Err(TranscodeError::TranscodeFailed {
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl AnimatedTranscoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        source: &[u8],
        source_extension: &str,
        target: &AnimatedTarget,
    ) -> Result<Vec<u8>> {
        let scratch = ScratchSpace::new_in(&self.scratch_root, source_extension, target.extension())?;

        tokio::fs::write(scratch.input(), source).await?;
        self.run(&scratch, target).await?;

        let output = tokio::fs::read(scratch.output()).await.map_err(|e| {
            TranscodeError::TranscodeFailed {
                status: "exit status: 0".to_string(),
                stderr: format!("no output produced: {}", e),
            }
        })?;

        log::info!(
            "Transcoded animated {} -> {}: {} -> {} bytes",
            source_extension,
            target.extension(),
            source.len(),
            output.len()
        );

        Ok(output)
    }
}

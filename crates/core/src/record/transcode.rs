//! Re-encoding captured AVI files to MP4 through an external `ffmpeg`.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::process::Command;
use tracing::debug;

use super::{ContainerFormat, MediaBlob};
use crate::{AvatarError, Result};

static NEXT_JOB: AtomicU64 = AtomicU64::new(1);

/// Result of [`CaptureExporter::transcode`](super::CaptureExporter::transcode).
#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeOutcome {
    /// Broadly playable MP4.
    Transcoded(MediaBlob),
    /// Transcoding failed; the original container is returned untouched.
    Fallback(MediaBlob),
}

impl TranscodeOutcome {
    /// The bytes to hand out, whichever way it went.
    pub fn blob(&self) -> &MediaBlob {
        match self {
            TranscodeOutcome::Transcoded(blob) | TranscodeOutcome::Fallback(blob) => blob,
        }
    }

    pub fn into_blob(self) -> MediaBlob {
        match self {
            TranscodeOutcome::Transcoded(blob) | TranscodeOutcome::Fallback(blob) => blob,
        }
    }

    /// True if the blob is the MP4.
    pub fn is_transcoded(&self) -> bool {
        matches!(self, TranscodeOutcome::Transcoded(_))
    }
}

/// Removes its files when dropped, including when the transcode future is
/// abandoned.
struct TempFiles(Vec<PathBuf>);

impl Drop for TempFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!(path = ?path, error = %e, "failed to remove transcode temp file"),
            }
        }
    }
}

/// Runs `ffmpeg` (H.264 yuv420p + AAC, `+faststart`) on `blob`.
pub(crate) async fn to_mp4(blob: &MediaBlob, ffmpeg: &str, limit: Duration) -> Result<MediaBlob> {
    if blob.is_empty() {
        return Err(AvatarError::Transcode("nothing to transcode".into()));
    }

    let job = NEXT_JOB.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir();
    let stem = format!("lipsync-export-{}-{job}", std::process::id());
    let input = dir.join(format!("{stem}.{}", blob.format().extension()));
    let output = dir.join(format!("{stem}.{}", ContainerFormat::Mp4.extension()));
    let _cleanup = TempFiles(vec![input.clone(), output.clone()]);

    tokio::fs::write(&input, blob.bytes()).await?;

    let mut cmd = Command::new(ffmpeg);
    cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-i"])
        .arg(&input)
        .args([
            "-vf",
            "scale=trunc(iw/2)*2:trunc(ih/2)*2",
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            "-c:a",
            "aac",
            "-movflags",
            "+faststart",
        ])
        .arg(&output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(command = ?cmd, "running ffmpeg");

    let result = tokio::time::timeout(limit, cmd.output())
        .await
        .map_err(|_| AvatarError::Transcode(format!("ffmpeg timed out after {limit:?}")))?
        .map_err(|e| AvatarError::Transcode(format!("cannot run `{ffmpeg}`: {e}")))?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        let tail = stderr.lines().last().unwrap_or("").trim();
        return Err(AvatarError::Transcode(format!(
            "ffmpeg exited with {}: {tail}",
            result.status
        )));
    }

    let bytes = tokio::fs::read(&output).await?;
    if bytes.is_empty() {
        return Err(AvatarError::Transcode("ffmpeg produced no output".into()));
    }
    Ok(MediaBlob::new(bytes, ContainerFormat::Mp4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_a_transcode_error() {
        let blob = MediaBlob::new(vec![1, 2, 3, 4], ContainerFormat::Avi);
        let err = to_mp4(&blob, "/nonexistent/lipsync-ffmpeg", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, AvatarError::Transcode(ref m) if m.contains("cannot run")));
    }

    #[tokio::test]
    async fn empty_input_is_refused() {
        let blob = MediaBlob::new(Vec::new(), ContainerFormat::Avi);
        assert!(to_mp4(&blob, "ffmpeg", Duration::from_secs(1)).await.is_err());
    }

    #[test]
    fn outcome_exposes_blob() {
        let blob = MediaBlob::new(vec![7], ContainerFormat::Avi);
        let outcome = TranscodeOutcome::Fallback(blob.clone());

        assert!(!outcome.is_transcoded());
        assert_eq!(outcome.blob(), &blob);
        assert_eq!(outcome.into_blob(), blob);
    }
}

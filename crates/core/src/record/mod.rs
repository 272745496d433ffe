//! Captures the rendered surface together with the playing audio.

mod avi;
mod transcode;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use image::{codecs::jpeg::JpegEncoder, ExtendedColorType};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use avi::{AviWriter, ContainerInfo, PcmFormat};
pub use transcode::TranscodeOutcome;

use crate::{
    render::{SharedSurface, Surface},
    timeline::{frame_interval, frames_for},
    AnimationDriver, AvatarError, CaptureConfig, FrameTicker, PlaybackHandle, Result, StopReason,
};

/// Container of an exported video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// Motion-JPEG video with PCM audio, as captured.
    Avi,
    /// H.264/AAC, after transcoding.
    Mp4,
}

impl ContainerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Avi => "avi",
            ContainerFormat::Mp4 => "mp4",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            ContainerFormat::Avi => "video/x-msvideo",
            ContainerFormat::Mp4 => "video/mp4",
        }
    }
}

/// Encoded video bytes tagged with their container.
#[derive(Clone, PartialEq, Eq)]
pub struct MediaBlob {
    bytes: Vec<u8>,
    format: ContainerFormat,
}

impl MediaBlob {
    pub fn new(bytes: Vec<u8>, format: ContainerFormat) -> Self {
        Self { bytes, format }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    pub fn mime(&self) -> &'static str {
        self.format.mime()
    }

    pub fn extension(&self) -> &'static str {
        self.format.extension()
    }

    /// `stem` plus the extension matching the bytes.
    pub fn file_name(&self, stem: &str) -> String {
        format!("{stem}.{}", self.extension())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for MediaBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaBlob")
            .field("format", &self.format)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Records surface frames plus audio into an AVI, one capture at a time.
#[derive(Debug)]
pub struct CaptureExporter {
    config: CaptureConfig,
    fps: u32,
    busy: Arc<AtomicBool>,
}

/// Marks the exporter busy until dropped.
struct CaptureGuard(Arc<AtomicBool>);

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CaptureExporter {
    /// An idle exporter capturing at `fps` frames per second.
    pub fn new(config: CaptureConfig, fps: u32) -> Self {
        Self {
            config,
            fps: fps.max(1),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// True while a capture holds the exporter.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Grabs frames from `surface` at the exporter's frame rate while `audio`
    /// plays in real time.
    ///
    /// Each grab lands in the frame slot given by the audio cursor, so video
    /// stays aligned with the audio even when encoding falls behind: slots
    /// skipped while the encoder was busy repeat the previous frame.
    ///
    /// Stops once `duration_ms` of audio has elapsed or the audio ends. Fails
    /// if the surface is empty, another capture is running, or `audio` is
    /// stopped or superseded before the capture completes.
    pub async fn record_canvas_with_audio(
        &self,
        surface: &SharedSurface,
        audio: &PlaybackHandle,
        duration_ms: u64,
    ) -> Result<MediaBlob> {
        let _guard = self.begin()?;
        let session = self.session(surface, audio, duration_ms)?;
        let frames = frames_for(duration_ms, self.fps);
        info!(frames, duration_ms, fps = self.fps, "capture started");

        let mut encoder = FrameEncoder::new(session);
        let mut ticker = FrameTicker::new(self.fps);
        let mut origin = None;
        let mut skipped = 0u64;
        loop {
            ticker.next_frame().await;
            let bound = still_bound(audio)?;
            let now = audio.current_time();
            let start = *origin.get_or_insert(now);
            let slot = frame_slot(now - start, self.fps);
            let done = !bound || slot + 1 >= frames;
            if !done && encoder.is_busy() {
                skipped += 1;
                continue;
            }

            encoder
                .submit(Grab {
                    slot: slot.min(frames - 1),
                    audio_origin: audio.audio().frame_at(start),
                    frame: surface.snapshot()?,
                })
                .await?;
            if done {
                break;
            }
        }
        if skipped > 0 {
            debug!(skipped, "ticks skipped while the encoder was busy");
        }
        self.finish(encoder.finish().await?).await
    }

    /// Renders the export faster than real time.
    ///
    /// `audio` must run on a manual clock. For each frame the clock is moved
    /// one frame interval and `driver` renders the matching pose.
    pub async fn record_offline(
        &self,
        driver: &AnimationDriver,
        audio: &PlaybackHandle,
        duration_ms: u64,
    ) -> Result<MediaBlob> {
        if !audio.clock().is_manual() {
            return Err(AvatarError::capture(
                "offline capture needs a manually clocked playback",
            ));
        }
        let _guard = self.begin()?;
        let surface = driver.surface();
        let session = self.session(surface, audio, duration_ms)?;
        let frames = frames_for(duration_ms, self.fps);
        let step = frame_interval(self.fps);
        info!(frames, duration_ms, fps = self.fps, "offline capture started");

        let mut encoder = FrameEncoder::new(session);
        let origin = audio.audio().frame_at(audio.current_time());
        for slot in 0..frames {
            if !still_bound(audio)? {
                break;
            }
            driver.tick_at(audio.current_time() as f32)?;
            encoder
                .submit(Grab {
                    slot,
                    audio_origin: origin,
                    frame: surface.snapshot()?,
                })
                .await?;
            audio.clock().advance(step);
        }
        self.finish(encoder.finish().await?).await
    }

    /// Converts `blob` to MP4. Any failure yields the original blob.
    pub async fn transcode(&self, blob: MediaBlob) -> TranscodeOutcome {
        if blob.format() == ContainerFormat::Mp4 {
            return TranscodeOutcome::Transcoded(blob);
        }
        let limit = Duration::from_millis(self.config.transcode_timeout_ms);
        match transcode::to_mp4(&blob, &self.config.ffmpeg_bin, limit).await {
            Ok(mp4) => {
                info!(from = blob.len(), to = mp4.len(), "transcoded capture to mp4");
                TranscodeOutcome::Transcoded(mp4)
            }
            Err(e) => {
                warn!(error = %e, "transcode failed, keeping captured container");
                TranscodeOutcome::Fallback(blob)
            }
        }
    }

    fn begin(&self) -> Result<CaptureGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AvatarError::capture("capture already in progress"))?;
        Ok(CaptureGuard(self.busy.clone()))
    }

    fn session(
        &self,
        surface: &SharedSurface,
        audio: &PlaybackHandle,
        duration_ms: u64,
    ) -> Result<CaptureSession> {
        let (width, height) = surface.dimensions()?;
        if width == 0 || height == 0 {
            return Err(AvatarError::capture("surface has zero size"));
        }
        if duration_ms == 0 {
            return Err(AvatarError::capture("capture duration must be positive"));
        }
        still_bound(audio)?;
        Ok(CaptureSession::new(
            width,
            height,
            self.fps,
            self.config.jpeg_quality,
            audio.clone(),
        ))
    }

    async fn finish(&self, session: CaptureSession) -> Result<MediaBlob> {
        let frames = session.writer.video_frames();
        let bytes = tokio::task::spawn_blocking(move || session.writer.finish())
            .await
            .map_err(|e| AvatarError::capture(format!("mux task failed: {e}")))?;
        info!(frames, bytes = bytes.len(), "capture finished");
        Ok(MediaBlob::new(bytes, ContainerFormat::Avi))
    }
}

/// Slot index for a grab taken `elapsed` seconds after the first one.
///
/// Ticks land on slot boundaries, so rounding absorbs scheduler jitter.
fn frame_slot(elapsed: f64, fps: u32) -> u64 {
    (elapsed.max(0.0) * fps as f64).round() as u64
}

/// `Ok(false)` once the audio has ended naturally.
fn still_bound(audio: &PlaybackHandle) -> Result<bool> {
    match audio.stop_reason() {
        None => Ok(true),
        Some(StopReason::Ended) => Ok(false),
        Some(StopReason::Superseded) => Err(AvatarError::capture("bound audio was superseded")),
        Some(StopReason::Stopped) => Err(AvatarError::capture("bound audio was stopped")),
    }
}

/// One surface snapshot bound to its frame slot.
struct Grab {
    slot: u64,
    /// Audio frame under the cursor at the first grab.
    audio_origin: usize,
    frame: Surface,
}

/// Runs JPEG encoding and muxing on the blocking pool, one grab at a time.
///
/// The session lives either here or inside the running encode task.
struct FrameEncoder {
    idle: Option<CaptureSession>,
    running: Option<JoinHandle<Result<CaptureSession>>>,
}

impl FrameEncoder {
    fn new(session: CaptureSession) -> Self {
        Self {
            idle: Some(session),
            running: None,
        }
    }

    /// True while the previous grab is still being encoded.
    fn is_busy(&self) -> bool {
        self.running.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Waits for the previous grab, then starts encoding `grab`.
    async fn submit(&mut self, grab: Grab) -> Result<()> {
        let mut session = self.settle().await?;
        self.running = Some(tokio::task::spawn_blocking(
            move || -> Result<CaptureSession> {
                session.push(grab)?;
                Ok(session)
            },
        ));
        Ok(())
    }

    async fn finish(mut self) -> Result<CaptureSession> {
        self.settle().await
    }

    async fn settle(&mut self) -> Result<CaptureSession> {
        if let Some(task) = self.running.take() {
            return task
                .await
                .map_err(|e| AvatarError::capture(format!("encode task failed: {e}")))?;
        }
        self.idle
            .take()
            .ok_or_else(|| AvatarError::capture("frame encoder lost its session"))
    }
}

/// Per-export state: the bound audio and the container being filled.
struct CaptureSession {
    writer: AviWriter,
    audio: PlaybackHandle,
    width: u32,
    height: u32,
    fps: u32,
    quality: u8,
    /// Audio frame at the first captured video frame.
    origin: Option<usize>,
    rgb: Vec<u8>,
    last_jpeg: Option<Vec<u8>>,
}

impl CaptureSession {
    fn new(width: u32, height: u32, fps: u32, quality: u8, audio: PlaybackHandle) -> Self {
        let decoded = audio.audio();
        let pcm = PcmFormat {
            sample_rate: decoded.sample_rate,
            channels: decoded.channels,
        };
        Self {
            writer: AviWriter::new(width, height, fps, Some(pcm)),
            audio,
            width,
            height,
            fps,
            quality,
            origin: None,
            rgb: Vec::with_capacity(width as usize * height as usize * 3),
            last_jpeg: None,
        }
    }

    /// Writes `grab` at its slot. Slots between the last written one and
    /// `grab.slot` repeat the previous image; slots already written are
    /// left alone.
    fn push(&mut self, grab: Grab) -> Result<()> {
        let next = self.writer.video_frames() as u64;
        if grab.slot < next {
            return Ok(());
        }
        let frame = &grab.frame;
        if (frame.width(), frame.height()) != (self.width, self.height) {
            return Err(AvatarError::capture("surface was resized during capture"));
        }
        let origin = *self.origin.get_or_insert(grab.audio_origin);
        if next == 0 {
            debug!(audio_offset = origin, "first frame captured");
        }

        let jpeg = self.encode(frame)?;
        let previous = self.last_jpeg.take();
        for slot in next..=grab.slot {
            let image = match &previous {
                Some(previous) if slot < grab.slot => previous,
                _ => &jpeg,
            };
            let pcm = self.audio_for_slot(origin, slot);
            self.writer.push_video(image);
            self.writer.push_audio(&pcm);
        }
        self.last_jpeg = Some(jpeg);
        Ok(())
    }

    /// JPEG of `frame` with alpha premultiplied onto black.
    fn encode(&mut self, frame: &Surface) -> Result<Vec<u8>> {
        self.rgb.clear();
        for px in frame.pixels().chunks_exact(4) {
            let alpha = px[3] as u32;
            self.rgb
                .extend(px[..3].iter().map(|&c| ((c as u32 * alpha + 127) / 255) as u8));
        }
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode(&self.rgb, self.width, self.height, ExtendedColorType::Rgb8)
            .map_err(|e| AvatarError::capture(format!("jpeg encoding failed: {e}")))?;
        Ok(jpeg)
    }

    /// 16-bit PCM covering `[origin + slot/fps, origin + (slot+1)/fps)`.
    fn audio_for_slot(&self, origin: usize, slot: u64) -> Vec<i16> {
        let decoded = self.audio.audio();
        let rate = decoded.sample_rate as u64;
        let fps = self.fps as u64;
        let start = origin + (slot * rate / fps) as usize;
        let end = origin + ((slot + 1) * rate / fps) as usize;
        decoded
            .frame_range(start, end)
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)
            .collect()
    }
}

//! User-facing actions: preview, upload, export and avatar settings.
//!
//! Every action catches its own errors, logs them and reports failure as
//! `None` or `false`, so callers never have to unwind a half-finished step.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use tracing::{error, info, warn};

use crate::{
    driver::AnimationLoop,
    render::SharedSurface,
    AnimationDriver, AppConfig, AudioEngine, AudioOutput, AudioSource, AudioUpload, AvatarError,
    AvatarMode, CaptureExporter, Emotion, PlaybackClock, PlaybackHandle, PortraitAsset, Result,
    SpeechService, Voice,
};

/// A finished export, ready to be written out.
#[derive(Clone, PartialEq, Eq)]
pub struct ExportedFile {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl ExportedFile {
    /// Writes the file into `dir`, creating it if needed.
    pub fn write_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(&self.file_name);
        std::fs::write(&path, &self.bytes)?;
        Ok(path)
    }
}

impl std::fmt::Debug for ExportedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedFile")
            .field("file_name", &self.file_name)
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct StudioState {
    mode: AvatarMode,
    emotion: Emotion,
    voice: Voice,
    script: String,
    portrait: Option<PortraitAsset>,
    last_source: Option<AudioSource>,
    audio_ref: Option<PlaybackHandle>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the audio engine, animation driver and exporter of one avatar.
pub struct Studio {
    config: AppConfig,
    engine: AudioEngine,
    driver: AnimationDriver,
    exporter: CaptureExporter,
    state: Mutex<StudioState>,
    animation: Mutex<Option<AnimationLoop>>,
    busy: AtomicBool,
}

impl Studio {
    /// A studio with silent playback, an idle animation loop and the configured mode.
    pub fn new(config: AppConfig, speech: Arc<dyn SpeechService>) -> Self {
        let engine = AudioEngine::new(speech, config.analyzer.clone());
        let anim = &config.animation;
        let surface = SharedSurface::new(anim.surface_width, anim.surface_height);
        let driver = AnimationDriver::new(
            engine.analyzer(),
            surface,
            anim.mode.renderer(anim.jaw_easing, None),
        );
        let exporter = CaptureExporter::new(config.capture.clone(), anim.fps);
        let state = StudioState {
            mode: anim.mode,
            ..Default::default()
        };

        Self {
            engine,
            driver,
            exporter,
            state: Mutex::new(state),
            animation: Mutex::new(None),
            busy: AtomicBool::new(false),
            config,
        }
    }

    /// Plays audio through `output` instead of silently.
    pub fn with_output(mut self, output: Arc<dyn AudioOutput>) -> Self {
        self.engine = self.engine.with_output(output);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The audio engine behind preview and export.
    pub fn engine(&self) -> &AudioEngine {
        &self.engine
    }

    /// The animation driver feeding the surface.
    pub fn driver(&self) -> &AnimationDriver {
        &self.driver
    }

    /// The surface the avatar is drawn into.
    pub fn surface(&self) -> &SharedSurface {
        self.driver.surface()
    }

    /// True while an action is running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Current avatar mode.
    pub fn mode(&self) -> AvatarMode {
        self.read(|state| state.mode).unwrap_or_default()
    }

    /// Current emotion.
    pub fn emotion(&self) -> Emotion {
        self.read(|state| state.emotion).unwrap_or_default()
    }

    /// Voice used for the next preview.
    pub fn voice(&self) -> Voice {
        self.read(|state| state.voice).unwrap_or_default()
    }

    /// The script text, as typed or transcribed.
    pub fn script(&self) -> String {
        self.read(|state| state.script.clone()).unwrap_or_default()
    }

    /// Handle of the most recent preview or export playback.
    pub fn audio_ref(&self) -> Option<PlaybackHandle> {
        self.read(|state| state.audio_ref.clone()).ok().flatten()
    }

    /// Starts the display-rate animation loop if it is not running.
    pub fn start_animation(&self) -> bool {
        self.report("start animation", || {
            let mut slot = self.lock_animation()?;
            if slot.is_none() {
                *slot = Some(self.driver.start(self.config.animation.fps));
            }
            Ok(())
        })
        .is_some()
    }

    /// Cancels the animation loop if it is running.
    pub fn stop_animation(&self) -> bool {
        self.report("stop animation", || {
            if let Some(mut running) = self.lock_animation()?.take() {
                running.cancel();
            }
            Ok(())
        })
        .is_some()
    }

    /// Switches renderer; the portrait, if any, is kept.
    pub fn set_mode(&self, mode: AvatarMode) -> bool {
        self.report("set mode", || {
            self.driver.set_renderer(self.renderer_for(mode))?;
            self.lock_state()?.mode = mode;
            info!(%mode, "avatar mode changed");
            Ok(())
        })
        .is_some()
    }

    /// Sets the emotion shown from the next frame on.
    pub fn set_emotion(&self, emotion: Emotion) -> bool {
        self.report("set emotion", || {
            self.driver.set_emotion(emotion)?;
            self.lock_state()?.emotion = emotion;
            Ok(())
        })
        .is_some()
    }

    /// Selects the voice for later previews.
    pub fn set_voice(&self, voice: Voice) -> bool {
        self.report("set voice", || {
            self.lock_state()?.voice = voice;
            Ok(())
        })
        .is_some()
    }

    /// Replaces the script text.
    pub fn set_script(&self, text: &str) -> bool {
        self.report("set script", || {
            self.lock_state()?.script = text.to_string();
            Ok(())
        })
        .is_some()
    }

    /// Decodes a portrait image and switches to portrait mode.
    pub fn set_portrait(&self, bytes: &[u8]) -> bool {
        let Some(asset) = self.report("set portrait", || PortraitAsset::decode(bytes)) else {
            return false;
        };
        if self
            .report("set portrait", || {
                self.lock_state()?.portrait = Some(asset);
                Ok(())
            })
            .is_none()
        {
            return false;
        }
        self.set_mode(AvatarMode::Portrait)
    }

    /// Synthesises `text` with the selected voice and plays it.
    ///
    /// Blank text is ignored.
    pub async fn preview(&self, text: &str) -> Option<PlaybackHandle> {
        if text.trim().is_empty() {
            return None;
        }
        let _busy = self.begin("preview")?;
        self.set_script(text);
        let voice = self.voice();
        let result = async {
            let source = self
                .engine
                .tts(text, voice, self.config.speech.response_format)
                .await?;
            self.play(source).await
        }
        .await;
        self.settle("preview", result)
    }

    /// Plays an uploaded mp3 or wav file as is.
    pub async fn preview_upload(&self, file: &AudioUpload) -> Option<PlaybackHandle> {
        let _busy = self.begin("preview upload")?;
        let result = async {
            let source = self.engine.adopt_upload(file)?;
            self.play(source).await
        }
        .await;
        self.settle("preview upload", result)
    }

    /// Transcribes `file` and makes the transcript the new script.
    pub async fn upload_audio(&self, file: &AudioUpload) -> Option<String> {
        let _busy = self.begin("upload audio")?;
        let result = async {
            let text = self.engine.stt(file).await?;
            self.lock_state()?.script = text.clone();
            info!(chars = text.chars().count(), "script replaced by transcript");
            Ok(text)
        }
        .await;
        self.settle("upload audio", result)
    }

    /// Replays the last previewed audio while capturing the avatar.
    ///
    /// Returns `None` without error if nothing has been previewed yet.
    pub async fn export(&self) -> Option<ExportedFile> {
        let source = self.read(|state| state.last_source.clone()).ok().flatten();
        let Some(source) = source else {
            info!("nothing has been previewed yet, export skipped");
            return None;
        };
        let _busy = self.begin("export")?;
        let result = self.export_source(&source).await;
        self.settle("export", result)
    }

    async fn export_source(&self, source: &AudioSource) -> Result<ExportedFile> {
        let blob = if self.config.capture.offline {
            let audio = self
                .engine
                .play_with_clock(source, PlaybackClock::manual())
                .await?
                .audio;
            self.remember(&audio)?;
            let duration_ms = audio.duration_ms();
            info!(duration_ms, "offline export");
            self.exporter
                .record_offline(&self.driver, &audio, duration_ms)
                .await?
        } else {
            let running = self.lock_animation()?.is_some();
            let _temporary = (!running).then(|| self.driver.start(self.config.animation.fps));
            let audio = self.engine.play_audio_buffer(source).await?.audio;
            self.remember(&audio)?;
            let duration_ms = audio.duration_ms();
            info!(duration_ms, "realtime export");
            self.exporter
                .record_canvas_with_audio(self.driver.surface(), &audio, duration_ms)
                .await?
        };

        let outcome = self.exporter.transcode(blob).await;
        let transcoded = outcome.is_transcoded();
        let blob = outcome.into_blob();
        let file = ExportedFile {
            file_name: blob.file_name(&self.config.capture.file_stem),
            mime: blob.mime().to_string(),
            bytes: blob.into_bytes(),
        };
        info!(file = %file.file_name, bytes = file.bytes.len(), transcoded, "export ready");
        Ok(file)
    }

    async fn play(&self, source: AudioSource) -> Result<PlaybackHandle> {
        let audio = self.engine.play_audio_buffer(&source).await?.audio;
        let mut state = self.lock_state()?;
        state.last_source = Some(source);
        state.audio_ref = Some(audio.clone());
        Ok(audio)
    }

    fn remember(&self, audio: &PlaybackHandle) -> Result<()> {
        self.lock_state()?.audio_ref = Some(audio.clone());
        Ok(())
    }

    fn renderer_for(&self, mode: AvatarMode) -> Box<dyn crate::render::Renderer> {
        let portrait = self.read(|state| state.portrait.clone()).ok().flatten();
        mode.renderer(self.config.animation.jaw_easing, portrait)
    }

    fn begin(&self, action: &'static str) -> Option<BusyGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(action, "studio is busy, action rejected");
            return None;
        }
        Some(BusyGuard(&self.busy))
    }

    fn settle<T>(&self, action: &'static str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                error!(action, error = %e, "action failed");
                None
            }
        }
    }

    fn report<T>(&self, action: &'static str, f: impl FnOnce() -> Result<T>) -> Option<T> {
        self.settle(action, f())
    }

    fn read<T>(&self, f: impl FnOnce(&StudioState) -> T) -> Result<T> {
        let state = self.lock_state()?;
        Ok(f(&state))
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, StudioState>> {
        self.state
            .lock()
            .map_err(|_| AvatarError::msg("studio state has been poisoned"))
    }

    fn lock_animation(&self) -> Result<MutexGuard<'_, Option<AnimationLoop>>> {
        self.animation
            .lock()
            .map_err(|_| AvatarError::msg("animation slot has been poisoned"))
    }
}

impl std::fmt::Debug for Studio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Studio")
            .field("mode", &self.mode())
            .field("emotion", &self.emotion())
            .field("busy", &self.is_busy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        assets::fixtures::portrait_png,
        audio::mock::MockSpeech,
        record::ContainerInfo,
        source::fixtures::tone_wav,
        AudioFormat,
    };

    fn config(offline: bool) -> AppConfig {
        let mut config = AppConfig::default();
        config.animation.fps = 10;
        config.animation.surface_width = 64;
        config.animation.surface_height = 48;
        config.capture.offline = offline;
        config.capture.ffmpeg_bin = "/nonexistent/lipsync-ffmpeg".into();
        config.speech.response_format = AudioFormat::Wav;
        config
    }

    fn studio(offline: bool, speech: MockSpeech) -> (Studio, Arc<MockSpeech>) {
        let speech = Arc::new(speech);
        (Studio::new(config(offline), speech.clone()), speech)
    }

    fn speaking() -> MockSpeech {
        MockSpeech::with_audio(tone_wav(1.0, 0.5, 16_000))
    }

    #[tokio::test]
    async fn export_before_preview_does_nothing() {
        let (studio, _) = studio(true, speaking());

        assert_eq!(studio.export().await, None);
        assert!(!studio.is_busy());
    }

    #[tokio::test]
    async fn blank_preview_is_skipped() {
        let (studio, speech) = studio(true, speaking());

        assert!(studio.preview("  \n").await.is_none());
        assert_eq!(speech.synth_calls.load(Ordering::SeqCst), 0);
        assert!(studio.audio_ref().is_none());
    }

    #[tokio::test]
    async fn offline_export_falls_back_to_avi() {
        let (studio, _) = studio(true, speaking());
        let handle = studio.preview("Hello there").await.unwrap();
        assert_eq!(handle.duration_ms(), 1000);
        assert_eq!(studio.script(), "Hello there");

        let file = studio.export().await.unwrap();

        assert_eq!(file.file_name, "avatar.avi");
        assert_eq!(file.mime, "video/x-msvideo");
        let info = ContainerInfo::probe(&file.bytes).unwrap();
        assert_eq!(info.frames, 10);
        assert_eq!((info.width, info.height), (64, 48));
        assert_ne!(studio.audio_ref(), Some(handle));
        assert!(!studio.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_export_captures_for_the_audio_duration() {
        let (studio, _) = studio(false, speaking());
        studio.preview("Hello there").await.unwrap();

        let file = studio.export().await.unwrap();

        let info = ContainerInfo::probe(&file.bytes).unwrap();
        assert!((info.duration_ms() - 1000.0).abs() <= 100.0);
        assert!(info.has_audio());
        assert!(studio.driver().frames_rendered() > 0);
    }

    #[tokio::test]
    async fn failed_synthesis_is_reported_as_none() {
        let (studio, speech) = studio(
            true,
            MockSpeech {
                fail: true,
                ..Default::default()
            },
        );

        assert!(studio.preview("hello").await.is_none());
        assert_eq!(speech.synth_calls.load(Ordering::SeqCst), 1);
        assert!(!studio.is_busy());
        assert_eq!(studio.export().await, None);
    }

    #[tokio::test]
    async fn transcript_replaces_script() {
        let (studio, _) = studio(
            true,
            MockSpeech {
                transcript: "  hi there ".into(),
                ..Default::default()
            },
        );
        studio.set_script("old words");
        let upload = AudioUpload::new("clip.wav", None, tone_wav(0.5, 0.2, 16_000));

        assert_eq!(studio.upload_audio(&upload).await.as_deref(), Some("hi there"));
        assert_eq!(studio.script(), "hi there");
    }

    #[tokio::test]
    async fn busy_studio_rejects_actions() {
        let (studio, speech) = studio(true, speaking());
        let guard = studio.begin("test").unwrap();

        assert!(studio.preview("hello").await.is_none());
        assert_eq!(speech.synth_calls.load(Ordering::SeqCst), 0);

        drop(guard);
        assert!(studio.preview("hello").await.is_some());
    }

    #[test]
    fn portrait_upload_switches_mode() {
        let (studio, _) = studio(true, speaking());
        assert_eq!(studio.mode(), AvatarMode::Puppet);

        assert!(!studio.set_portrait(b"not an image"));
        assert_eq!(studio.mode(), AvatarMode::Puppet);

        assert!(studio.set_portrait(&portrait_png(32, 32)));
        assert_eq!(studio.mode(), AvatarMode::Portrait);
    }

    #[test]
    fn exported_file_is_written_under_its_name() {
        let dir = std::env::temp_dir().join(format!("lipsync-export-test-{}", std::process::id()));
        let file = ExportedFile {
            file_name: "avatar.avi".into(),
            mime: "video/x-msvideo".into(),
            bytes: vec![1, 2, 3],
        };

        let path = file.write_to(&dir).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        std::fs::remove_dir_all(&dir).ok();
    }
}

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::{
    decode, AmplitudeAnalyzer, AnalyzerConfig, AudioFormat, AudioOutput, AudioSource,
    AudioUpload, AvatarError, PlaybackClock, PlaybackHandle, Result, SilentOutput, SpeechService,
    Voice,
};

/// Result of starting playback.
#[derive(Debug, Clone)]
pub struct Playback {
    pub audio: PlaybackHandle,
}

/// High level audio engine façade.
///
/// Owns the current [`AudioSource`], the single active [`PlaybackHandle`] and
/// the analyzer tap bound to it.
pub struct AudioEngine {
    speech: Arc<dyn SpeechService>,
    output: Arc<dyn AudioOutput>,
    analyzer: Arc<AmplitudeAnalyzer>,
    source: Mutex<Option<AudioSource>>,
    active: Mutex<Option<PlaybackHandle>>,
}

impl AudioEngine {
    /// Creates an engine that plays silently (clock only).
    pub fn new(speech: Arc<dyn SpeechService>, analyzer: AnalyzerConfig) -> Self {
        Self {
            speech,
            output: Arc::new(SilentOutput),
            analyzer: Arc::new(AmplitudeAnalyzer::new(analyzer)),
            source: Mutex::new(None),
            active: Mutex::new(None),
        }
    }

    /// Routes playback through a different audio output.
    pub fn with_output(mut self, output: Arc<dyn AudioOutput>) -> Self {
        self.output = output;
        self
    }

    /// Shared analyzer, for readers such as the animation driver.
    pub fn analyzer(&self) -> Arc<AmplitudeAnalyzer> {
        self.analyzer.clone()
    }

    /// Loudness of the active playback in `[0, 1]`; zero when idle.
    pub fn get_amplitude(&self) -> f32 {
        self.analyzer.get_amplitude()
    }

    /// The most recently synthesised or adopted source.
    pub fn current_source(&self) -> Option<AudioSource> {
        self.lock_source().ok().and_then(|slot| slot.clone())
    }

    /// The playback the analyzer is currently bound to, if any.
    pub fn active_handle(&self) -> Option<PlaybackHandle> {
        self.lock_active().ok().and_then(|slot| slot.clone())
    }

    /// Synthesises `text`. Calls the remote service at most once.
    pub async fn tts(&self, text: &str, voice: Voice, format: AudioFormat) -> Result<AudioSource> {
        if text.trim().is_empty() {
            return Err(AvatarError::Synthesis("text must not be empty".into()));
        }

        info!(%voice, %format, chars = text.chars().count(), "synthesizing speech");
        let bytes = self
            .speech
            .synthesize_speech(text, voice, format)
            .await
            .map_err(|e| match e {
                AvatarError::Synthesis(_) => e,
                other => AvatarError::Synthesis(other.to_string()),
            })?;
        if bytes.is_empty() {
            return Err(AvatarError::Synthesis("service returned no audio".into()));
        }

        let declared = match AudioFormat::sniff(&bytes) {
            Some(actual) if actual != format => {
                warn!(requested = %format, %actual, "synthesized audio differs from requested format");
                actual
            }
            _ => format,
        };
        let source = AudioSource::new(bytes, declared);
        self.adopt(source.clone())?;
        Ok(source)
    }

    /// Transcribes an uploaded file. An empty transcript is a success.
    pub async fn stt(&self, file: &AudioUpload) -> Result<String> {
        if file.bytes.is_empty() {
            return Err(AvatarError::Transcription(format!(
                "`{}` is empty",
                file.file_name
            )));
        }
        if !file.is_supported() {
            return Err(AvatarError::Transcription(format!(
                "`{}` is not a supported audio file",
                file.file_name
            )));
        }

        info!(file = %file.file_name, bytes = file.bytes.len(), "transcribing upload");
        let text = self
            .speech
            .transcribe_audio(file)
            .await
            .map_err(|e| match e {
                AvatarError::Transcription(_) => e,
                other => AvatarError::Transcription(other.to_string()),
            })?;
        Ok(text.trim().to_string())
    }

    /// Makes an uploaded mp3/wav file the current source.
    pub fn adopt_upload(&self, file: &AudioUpload) -> Result<AudioSource> {
        let source = AudioSource::from_upload(file)?;
        self.adopt(source.clone())?;
        Ok(source)
    }

    /// Decodes and starts `source` on the wall clock. Resolves once playback
    /// has started.
    pub async fn play_audio_buffer(&self, source: &AudioSource) -> Result<Playback> {
        self.start_playback(source, PlaybackClock::realtime).await
    }

    /// Like [`play_audio_buffer`](Self::play_audio_buffer) with an injected
    /// clock; a manual clock makes playback position fully deterministic.
    pub async fn play_with_clock(
        &self,
        source: &AudioSource,
        clock: PlaybackClock,
    ) -> Result<Playback> {
        self.start_playback(source, move || clock).await
    }

    /// Stops the active playback and detaches the analyzer.
    pub fn stop(&self) -> Result<()> {
        let previous = self.lock_active()?.take();
        self.analyzer.detach()?;
        if let Some(handle) = previous {
            handle.stop();
        }
        Ok(())
    }

    async fn start_playback(
        &self,
        source: &AudioSource,
        clock: impl FnOnce() -> PlaybackClock,
    ) -> Result<Playback> {
        let decoded = {
            let source = source.clone();
            tokio::task::spawn_blocking(move || decode(&source))
                .await
                .map_err(|e| AvatarError::msg(format!("decode task failed: {e}")))??
        };
        debug!(
            sample_rate = decoded.sample_rate,
            channels = decoded.channels,
            seconds = decoded.duration_seconds(),
            "audio decoded"
        );

        // No await from here on: the swap is a single step for other tasks.
        let mut active = self.lock_active()?;
        if let Some(previous) = active.take() {
            previous.supersede();
        }

        let output = self.output.open(source)?;
        let handle = PlaybackHandle::start(source.clone(), Arc::new(decoded), clock(), output);
        if let Some(stale) = self.analyzer.set_active_handle(Some(handle.clone()))? {
            stale.supersede();
        }
        *active = Some(handle.clone());
        drop(active);

        info!(
            handle = handle.id(),
            output = self.output.name(),
            duration_ms = handle.duration_ms(),
            "playback started"
        );
        Ok(Playback { audio: handle })
    }

    fn adopt(&self, source: AudioSource) -> Result<()> {
        let mut slot = self.lock_source()?;
        *slot = Some(source);
        Ok(())
    }

    fn lock_source(&self) -> Result<MutexGuard<'_, Option<AudioSource>>> {
        self.source
            .lock()
            .map_err(|_| AvatarError::msg("audio source slot has been poisoned"))
    }

    fn lock_active(&self) -> Result<MutexGuard<'_, Option<PlaybackHandle>>> {
        self.active
            .lock()
            .map_err(|_| AvatarError::msg("active playback slot has been poisoned"))
    }
}

impl std::fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioEngine")
            .field("output", &self.output.name())
            .field("analyzer", &self.analyzer)
            .field("active", &self.active_handle())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::{AudioFormat, AudioUpload, AvatarError, Result, SpeechService, Voice};

    /// Speech service double that answers from canned data.
    #[derive(Default)]
    pub struct MockSpeech {
        pub audio: Vec<u8>,
        pub transcript: String,
        pub fail: bool,
        pub synth_calls: AtomicUsize,
        pub stt_calls: AtomicUsize,
    }

    impl MockSpeech {
        pub fn with_audio(audio: Vec<u8>) -> Self {
            Self {
                audio,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl SpeechService for MockSpeech {
        async fn synthesize_speech(
            &self,
            _text: &str,
            _voice: Voice,
            _format: AudioFormat,
        ) -> Result<Vec<u8>> {
            self.synth_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AvatarError::msg("503 Service Unavailable"));
            }
            Ok(self.audio.clone())
        }

        async fn transcribe_audio(&self, _file: &AudioUpload) -> Result<String> {
            self.stt_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AvatarError::msg("500 Internal Server Error"));
            }
            Ok(self.transcript.clone())
        }
    }
}

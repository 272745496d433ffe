use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{AnalysisDomain, AudioFormat, AvatarError, AvatarMode, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub speech: SpeechConfig,
    pub analyzer: AnalyzerConfig,
    pub animation: AnimationConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections and fields fall back
    /// to their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AvatarError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| AvatarError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies the environment overrides on top of the current values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(key) = env_non_empty("OPENAI_API_KEY") {
            self.speech.api_key = Some(key);
        }
        if let Some(url) = env_non_empty("OPENAI_BASE_URL") {
            self.speech.base_url = url;
        }
        if let Some(model) = env_non_empty("LIPSYNC_TTS_MODEL") {
            self.speech.tts_model = model;
        }
        if let Some(model) = env_non_empty("LIPSYNC_STT_MODEL") {
            self.speech.stt_model = model;
        }
        if let Some(bin) = env_non_empty("FFMPEG_BIN") {
            self.capture.ffmpeg_bin = bin;
        }
        if let Some(fps) = env_non_empty("LIPSYNC_FPS").and_then(|v| v.parse::<u32>().ok()) {
            self.animation.fps = fps;
        }
        self
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.animation.fps == 0 {
            return Err(AvatarError::Config("animation.fps must be positive".into()));
        }
        if self.animation.surface_width == 0 || self.animation.surface_height == 0 {
            return Err(AvatarError::Config(
                "animation surface dimensions must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.animation.jaw_easing) || self.animation.jaw_easing == 0.0 {
            return Err(AvatarError::Config(
                "animation.jaw_easing must be in (0, 1]".into(),
            ));
        }
        if self.analyzer.window_size < 2 {
            return Err(AvatarError::Config(
                "analyzer.window_size must hold at least two samples".into(),
            ));
        }
        if self.analyzer.gain <= 0.0 {
            return Err(AvatarError::Config("analyzer.gain must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.analyzer.smoothing) {
            return Err(AvatarError::Config(
                "analyzer.smoothing must be in [0, 1)".into(),
            ));
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(AvatarError::Config(
                "capture.jpeg_quality must be in 1..=100".into(),
            ));
        }
        Ok(())
    }
}

/// Remote speech service settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub base_url: String,
    /// Never written back out when the config is serialised.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub tts_model: String,
    pub stt_model: String,
    /// Container requested from the synthesis endpoint.
    pub response_format: AudioFormat,
    pub timeout_ms: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            tts_model: "gpt-4o-mini-tts".to_string(),
            stt_model: "whisper-1".to_string(),
            response_format: AudioFormat::Mp3,
            timeout_ms: 60_000,
        }
    }
}

impl std::fmt::Debug for SpeechConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("tts_model", &self.tts_model)
            .field("stt_model", &self.stt_model)
            .field("response_format", &self.response_format)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// Tunables for the amplitude analyzer.
///
/// `gain` and `smoothing` shape how loud speech maps onto jaw motion. The
/// defaults put typical TTS speech (RMS around 0.05-0.25) across most of the
/// `[0, 1]` range and leave temporal smoothing to the renderer's easing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub window_size: usize,
    pub gain: f32,
    pub smoothing: f32,
    pub domain: AnalysisDomain,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window_size: 2048,
            gain: 4.0,
            smoothing: 0.0,
            domain: AnalysisDomain::TimeDomain,
        }
    }
}

/// Render loop and surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationConfig {
    pub fps: u32,
    pub surface_width: u32,
    pub surface_height: u32,
    /// Fraction of the remaining distance the jaw covers per frame.
    pub jaw_easing: f32,
    pub mode: AvatarMode,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            surface_width: 640,
            surface_height: 360,
            jaw_easing: 0.35,
            mode: AvatarMode::Puppet,
        }
    }
}

/// Capture and transcode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub jpeg_quality: u8,
    pub ffmpeg_bin: String,
    pub transcode_timeout_ms: u64,
    /// Render export frames from a manual clock instead of waiting on the
    /// wall clock.
    pub offline: bool,
    pub file_stem: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 85,
            ffmpeg_bin: "ffmpeg".to_string(),
            transcode_timeout_ms: 120_000,
            offline: false,
            file_stem: "avatar".to_string(),
        }
    }
}

/// Where preview audio goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Advance the playback clock without producing sound.
    #[default]
    Silent,
    /// Hand the audio to a system player.
    Command,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub output: OutputKind,
    /// Preferred player binary (`ffplay`, `paplay`, `aplay`).
    pub player: Option<String>,
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "animation": { "fps": 30 }, "capture": { "offline": true } }"#)
                .unwrap();

        assert_eq!(config.animation.fps, 30);
        assert_eq!(config.animation.surface_width, 640);
        assert!(config.capture.offline);
        assert_eq!(config.analyzer.window_size, 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = AppConfig::default();
        config.analyzer.smoothing = 1.0;
        assert!(matches!(config.validate(), Err(AvatarError::Config(_))));

        let mut config = AppConfig::default();
        config.animation.fps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn api_key_is_not_serialised() {
        let mut config = AppConfig::default();
        config.speech.api_key = Some("sk-secret".into());

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
        assert!(!format!("{:?}", config.speech).contains("sk-secret"));
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("lipsync-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "analyzer": { "gain": 2.5 } }"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.analyzer.gain, 2.5);
    }
}

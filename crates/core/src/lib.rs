//! Core library for the lip-sync avatar.
//!
//! Speech audio is synthesised or uploaded, played, and reduced to a loudness
//! signal every frame. That signal drives a software-rendered avatar whose
//! frames can be captured together with the audio into a video file. Each
//! module owns one stage of that pipeline; [`Studio`] wires them together
//! behind user-level actions.

pub mod analysis;
pub mod assets;
pub mod audio;
pub mod config;
pub mod driver;
pub mod error;
pub mod mapping;
pub mod playback;
pub mod record;
pub mod render;
pub mod scene;
pub mod source;
pub mod speech;
pub mod studio;
pub mod timeline;

pub use analysis::{AmplitudeAnalyzer, AmplitudeSource, AnalysisDomain};
pub use assets::PortraitAsset;
pub use audio::{AudioEngine, Playback};
pub use config::{
    AnalyzerConfig, AnimationConfig, AppConfig, CaptureConfig, OutputKind, PlaybackConfig,
    SpeechConfig,
};
pub use driver::{AnimationDriver, AnimationLoop};
pub use error::{AvatarError, Result};
pub use mapping::Emotion;
pub use playback::{AudioOutput, CommandOutput, PlaybackHandle, SilentOutput, StopReason};
pub use record::{CaptureExporter, ContainerFormat, ContainerInfo, MediaBlob, TranscodeOutcome};
pub use render::{FrameInput, Renderer, SharedSurface, Surface};
pub use scene::{AvatarMode, PortraitRenderer, PuppetRenderer};
pub use source::{decode, AudioFormat, AudioSource, AudioUpload, DecodedAudio};
pub use speech::{OpenAiSpeechClient, SpeechService, Voice};
pub use studio::{ExportedFile, Studio};
pub use timeline::{FrameTicker, PlaybackClock};

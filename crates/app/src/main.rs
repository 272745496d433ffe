use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use lipsync_avatar_core::{
    AppConfig, AudioFormat, AudioOutput, AudioUpload, AvatarError, AvatarMode, CommandOutput,
    ContainerFormat, ContainerInfo, Emotion, OpenAiSpeechClient, OutputKind, Result, Studio, Voice,
};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Voices => {
            list_voices();
            Ok(())
        }
        Commands::Transcribe { file } => run_transcribe(config, &file).await,
        Commands::Preview {
            text,
            speech,
            audible,
        } => run_preview(config, &text, speech, audible).await,
        Commands::Render(args) => run_render(config, args).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;
    Ok(config)
}

fn list_voices() {
    for voice in Voice::ALL {
        let marker = if voice == Voice::default() { " (default)" } else { "" };
        println!("{:<6} {}{marker}", voice.as_str(), voice.display_name());
    }
}

fn studio(config: AppConfig, audible: bool) -> Result<Studio> {
    let speech = Arc::new(OpenAiSpeechClient::new(config.speech.clone())?);
    let wants_sound = audible || config.playback.output == OutputKind::Command;
    let output: Option<Arc<dyn AudioOutput>> = if wants_sound {
        match CommandOutput::detect(config.playback.player.as_deref()) {
            Some(player) => Some(Arc::new(player)),
            None => {
                tracing::warn!("no audio player found on PATH, playing silently");
                None
            }
        }
    } else {
        None
    };

    let studio = Studio::new(config, speech);
    Ok(match output {
        Some(output) => studio.with_output(output),
        None => studio,
    })
}

async fn run_transcribe(config: AppConfig, file: &PathBuf) -> Result<()> {
    tracing::info!(?file, "transcribing");
    let upload = AudioUpload::from_path(file)?;
    let studio = studio(config, false)?;
    let text = studio.engine().stt(&upload).await?;
    println!("{text}");
    Ok(())
}

async fn run_preview(
    mut config: AppConfig,
    text: &str,
    speech: SpeechArgs,
    audible: bool,
) -> Result<()> {
    speech.apply(&mut config);
    let studio = studio(config, audible)?;
    studio.set_voice(speech.voice.unwrap_or_default());
    studio.start_animation();

    let handle = studio
        .preview(text)
        .await
        .ok_or_else(|| AvatarError::msg("preview failed"))?;
    tracing::info!(duration_ms = handle.duration_ms(), "previewing");

    let mut trace = tokio::time::interval(Duration::from_millis(100));
    while !handle.is_finished() {
        trace.tick().await;
        tracing::info!(
            t = handle.current_time(),
            amplitude = f64::from(studio.engine().get_amplitude()),
            "amplitude"
        );
    }
    studio.stop_animation();
    Ok(())
}

async fn run_render(mut config: AppConfig, args: RenderArgs) -> Result<()> {
    args.speech.apply(&mut config);
    if args.offline {
        config.capture.offline = true;
    }
    let studio = studio(config, false)?;
    studio.set_voice(args.speech.voice.unwrap_or_default());
    if let Some(image) = &args.image {
        if !studio.set_portrait(&std::fs::read(image)?) {
            return Err(AvatarError::msg(format!("cannot use {} as portrait", image.display())));
        }
    }
    if let Some(mode) = args.mode {
        studio.set_mode(mode);
    }
    if let Some(emotion) = args.emotion {
        studio.set_emotion(emotion);
    }

    let played = match (&args.input.text, &args.input.upload, &args.input.audio) {
        (Some(text), _, _) => studio.preview(text).await,
        (_, Some(upload), _) => {
            let upload = AudioUpload::from_path(upload)?;
            match studio.upload_audio(&upload).await {
                Some(script) if !script.is_empty() => studio.preview(&script).await,
                Some(_) => return Err(AvatarError::Transcription("nothing was recognised".into())),
                None => None,
            }
        }
        (_, _, Some(audio)) => studio.preview_upload(&AudioUpload::from_path(audio)?).await,
        _ => None,
    };
    if played.is_none() {
        return Err(AvatarError::msg("nothing to render"));
    }

    let file = studio
        .export()
        .await
        .ok_or_else(|| AvatarError::Capture("export failed".into()))?;
    let path = file.write_to(&args.out)?;

    if file.file_name.ends_with(ContainerFormat::Avi.extension()) {
        let info = ContainerInfo::probe(&file.bytes)?;
        tracing::info!(
            width = info.width,
            height = info.height,
            frames = info.frames,
            duration_ms = info.duration_ms(),
            audio = info.has_audio(),
            "captured container"
        );
    }
    println!("{}", path.display());
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Lip-synced talking avatar renderer", long_about = None)]
struct Cli {
    /// JSON configuration file; missing fields use defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the available synthesis voices.
    Voices,
    /// Print the transcript of an audio file.
    Transcribe {
        /// Audio file to transcribe.
        file: PathBuf,
    },
    /// Speak a line and log the amplitude the avatar sees.
    Preview {
        #[arg(long)]
        text: String,
        #[command(flatten)]
        speech: SpeechArgs,
        /// Play through a system audio player.
        #[arg(long)]
        audible: bool,
    },
    /// Speak, animate and export the avatar as a video file.
    Render(RenderArgs),
}

#[derive(Args, Debug, Clone, Copy)]
struct SpeechArgs {
    #[arg(long)]
    voice: Option<Voice>,
    /// Audio container requested from the synthesis service.
    #[arg(long)]
    format: Option<AudioFormat>,
}

impl SpeechArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(format) = self.format {
            config.speech.response_format = format;
        }
    }
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InputArgs {
    /// Text to synthesise.
    #[arg(long)]
    text: Option<String>,
    /// Audio to transcribe; the transcript is then synthesised.
    #[arg(long)]
    upload: Option<PathBuf>,
    /// Audio to use as is (mp3 or wav).
    #[arg(long)]
    audio: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[command(flatten)]
    input: InputArgs,
    #[command(flatten)]
    speech: SpeechArgs,
    #[arg(long)]
    mode: Option<AvatarMode>,
    #[arg(long)]
    emotion: Option<Emotion>,
    /// Portrait image (png or jpeg); implies portrait mode.
    #[arg(long)]
    image: Option<PathBuf>,
    /// Render frames from a manual clock instead of capturing in real time.
    #[arg(long)]
    offline: bool,
    /// Directory for the exported file.
    #[arg(long, default_value = ".")]
    out: PathBuf,
}

//! Playing instances of an [`AudioSource`] and the outputs they drive.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tracing::{debug, warn};

use crate::{AudioFormat, AudioSource, AvatarError, DecodedAudio, PlaybackClock, Result};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TEMP_FILE: AtomicU64 = AtomicU64::new(1);

/// Why a handle stopped producing audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The cursor reached the end of the track.
    Ended,
    /// Stopped explicitly.
    Stopped,
    /// A newer playback took over the analyzer.
    Superseded,
}

/// One playing instance of an audio source.
///
/// Clones share state: stopping one clone stops them all.
#[derive(Clone)]
pub struct PlaybackHandle {
    inner: Arc<PlaybackInner>,
}

struct PlaybackInner {
    id: u64,
    source: AudioSource,
    audio: Arc<DecodedAudio>,
    clock: PlaybackClock,
    stopped: Mutex<Option<(StopReason, f64)>>,
    output: Mutex<Option<Box<dyn OutputStream>>>,
}

impl PlaybackHandle {
    pub(crate) fn start(
        source: AudioSource,
        audio: Arc<DecodedAudio>,
        clock: PlaybackClock,
        output: Box<dyn OutputStream>,
    ) -> Self {
        Self {
            inner: Arc::new(PlaybackInner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                source,
                audio,
                clock,
                stopped: Mutex::new(None),
                output: Mutex::new(Some(output)),
            }),
        }
    }

    /// Process-unique id, shared by clones.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn source(&self) -> &AudioSource {
        &self.inner.source
    }

    /// Decoded PCM of the source.
    pub fn audio(&self) -> &DecodedAudio {
        &self.inner.audio
    }

    /// The clock the cursor follows.
    pub fn clock(&self) -> &PlaybackClock {
        &self.inner.clock
    }

    /// Track length in seconds.
    pub fn duration(&self) -> f64 {
        self.inner.audio.duration_seconds()
    }

    /// Track length rounded up to whole milliseconds.
    pub fn duration_ms(&self) -> u64 {
        (self.duration() * 1000.0).ceil() as u64
    }

    /// Playback cursor in seconds. Frozen once the handle is stopped.
    pub fn current_time(&self) -> f64 {
        if let Some((_, position)) = *self.lock_stopped() {
            return position;
        }
        self.inner.clock.elapsed().as_secs_f64().min(self.duration())
    }

    /// True once stopped, superseded or past the end.
    pub fn is_finished(&self) -> bool {
        self.stop_reason().is_some()
    }

    /// Why the handle stopped, or `None` while it plays.
    pub fn stop_reason(&self) -> Option<StopReason> {
        if let Some((reason, _)) = *self.lock_stopped() {
            return Some(reason);
        }
        (self.inner.clock.elapsed().as_secs_f64() >= self.duration()).then_some(StopReason::Ended)
    }

    /// Stops playback and silences the output. Idempotent.
    pub fn stop(&self) {
        self.stop_with(StopReason::Stopped);
    }

    pub(crate) fn supersede(&self) {
        self.stop_with(StopReason::Superseded);
    }

    fn stop_with(&self, reason: StopReason) {
        {
            let mut stopped = self.lock_stopped();
            if stopped.is_some() {
                return;
            }
            let elapsed = self.inner.clock.elapsed().as_secs_f64();
            let reason = if elapsed >= self.duration() {
                StopReason::Ended
            } else {
                reason
            };
            *stopped = Some((reason, elapsed.min(self.duration())));
        }
        let output = self
            .inner
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut output) = output {
            output.halt();
        }
        debug!(handle = self.id(), reason = ?self.stop_reason(), "playback stopped");
    }

    fn lock_stopped(&self) -> MutexGuard<'_, Option<(StopReason, f64)>> {
        self.inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for PlaybackHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Debug for PlaybackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackHandle")
            .field("id", &self.id())
            .field("duration", &self.duration())
            .field("current_time", &self.current_time())
            .field("stop_reason", &self.stop_reason())
            .finish()
    }
}

/// A running audio output that can be silenced.
pub trait OutputStream: Send {
    fn halt(&mut self);
}

/// Factory for audio outputs.
pub trait AudioOutput: Send + Sync {
    fn name(&self) -> &str;

    /// Starts sounding `source`. Returns once the output is running.
    fn open(&self, source: &AudioSource) -> Result<Box<dyn OutputStream>>;
}

/// Produces no sound; the playback clock alone drives the cursor.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentOutput;

struct SilentStream;

impl OutputStream for SilentStream {
    fn halt(&mut self) {}
}

impl AudioOutput for SilentOutput {
    fn name(&self) -> &str {
        "silent"
    }

    fn open(&self, _source: &AudioSource) -> Result<Box<dyn OutputStream>> {
        Ok(Box::new(SilentStream))
    }
}

/// Plays audio through a system player binary.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    player: PathBuf,
    temp_dir: PathBuf,
}

impl CommandOutput {
    /// Plays through the given player binary.
    pub fn new(player: impl Into<PathBuf>) -> Self {
        Self {
            player: player.into(),
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Picks the preferred player when it is on `PATH`, otherwise the first
    /// of `ffplay`, `paplay`, `aplay` that is.
    pub fn detect(preference: Option<&str>) -> Option<Self> {
        preference
            .and_then(find_on_path)
            .or_else(|| ["ffplay", "paplay", "aplay"].iter().find_map(|p| find_on_path(p)))
            .map(Self::new)
    }

    fn player_name(&self) -> &str {
        self.player
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("")
    }

    fn command_for(&self, path: &Path, format: AudioFormat) -> Result<Command> {
        let mut cmd = Command::new(&self.player);
        match self.player_name() {
            "ffplay" => {
                cmd.args(["-autoexit", "-nodisp", "-loglevel", "quiet"]);
            }
            "aplay" | "paplay" if format != AudioFormat::Wav => {
                return Err(AvatarError::msg(format!(
                    "{} cannot play {format} audio",
                    self.player_name()
                )));
            }
            _ => {}
        }
        cmd.arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        Ok(cmd)
    }
}

struct CommandStream {
    child: Child,
    path: PathBuf,
}

impl OutputStream for CommandStream {
    fn halt(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "player already exited");
        }
        let _ = self.child.wait();
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = ?self.path, error = %e, "failed to remove playback temp file");
        }
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        if self.path.exists() {
            self.halt();
        }
    }
}

impl AudioOutput for CommandOutput {
    fn name(&self) -> &str {
        self.player_name()
    }

    fn open(&self, source: &AudioSource) -> Result<Box<dyn OutputStream>> {
        let path = self.temp_dir.join(format!(
            "lipsync-playback-{}-{}.{}",
            std::process::id(),
            NEXT_TEMP_FILE.fetch_add(1, Ordering::Relaxed),
            source.format().extension()
        ));
        std::fs::write(&path, source.bytes())?;

        let mut cmd = self.command_for(&path, source.format())?;
        debug!(command = ?cmd, "spawning audio player");
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }
        };
        Ok(Box::new(CommandStream { child, path }))
    }
}

fn find_on_path(bin: &str) -> Option<PathBuf> {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(bin);
        return path.exists().then_some(path);
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(bin))
            .find(|candidate| candidate.exists())
    })
}

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    render::{FrameInput, Renderer, SharedSurface},
    AmplitudeSource, AvatarError, Emotion, FrameTicker, Result,
};

/// Pushes amplitude and emotion into the active renderer once per frame.
///
/// Cloning yields another handle to the same driver.
#[derive(Clone)]
pub struct AnimationDriver {
    source: Arc<dyn AmplitudeSource>,
    surface: SharedSurface,
    state: Arc<Mutex<DriverState>>,
    frames: Arc<AtomicU64>,
}

struct DriverState {
    renderer: Box<dyn Renderer>,
    emotion: Emotion,
}

impl AnimationDriver {
    /// Creates a driver that reads `source` and draws into `surface`.
    pub fn new(
        source: Arc<dyn AmplitudeSource>,
        surface: SharedSurface,
        renderer: Box<dyn Renderer>,
    ) -> Self {
        Self {
            source,
            surface,
            state: Arc::new(Mutex::new(DriverState {
                renderer,
                emotion: Emotion::default(),
            })),
            frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The surface every frame is rendered into.
    pub fn surface(&self) -> &SharedSurface {
        &self.surface
    }

    /// Swaps the renderer; takes effect on the next frame.
    pub fn set_renderer(&self, renderer: Box<dyn Renderer>) -> Result<()> {
        let mut state = self.lock_state()?;
        debug!(from = state.renderer.name(), to = renderer.name(), "renderer swapped");
        state.renderer = renderer;
        Ok(())
    }

    /// Sets the emotion passed to the renderer from the next frame on.
    pub fn set_emotion(&self, emotion: Emotion) -> Result<()> {
        self.lock_state()?.emotion = emotion;
        Ok(())
    }

    /// Current emotion; neutral if the state lock is poisoned.
    pub fn emotion(&self) -> Emotion {
        self.lock_state()
            .map(|state| state.emotion)
            .unwrap_or_default()
    }

    /// Number of frames rendered so far.
    pub fn frames_rendered(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Renders one frame for `time_seconds` of animation time. Never awaits.
    pub fn tick_at(&self, time_seconds: f32) -> Result<FrameInput> {
        let amplitude = self.source.amplitude();
        let mut state = self.lock_state()?;
        let input = FrameInput {
            amplitude,
            emotion: state.emotion,
            time_seconds,
        };
        let mut surface = self.surface.lock()?;
        state.renderer.render(&input, &mut surface);
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(input)
    }

    /// Spawns the frame loop on the current tokio runtime.
    pub fn start(&self, fps: u32) -> AnimationLoop {
        let cancelled = Arc::new(AtomicBool::new(false));
        let driver = self.clone();
        let flag = cancelled.clone();
        info!(fps, "animation loop starting");

        let task = tokio::spawn(async move {
            let origin = Instant::now();
            let mut ticker = FrameTicker::new(fps);
            loop {
                ticker.next_frame().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = driver.tick_at(origin.elapsed().as_secs_f32()) {
                    warn!(error = %e, "animation frame failed");
                }
            }
        });

        AnimationLoop {
            cancelled,
            task: Some(task),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, DriverState>> {
        self.state
            .lock()
            .map_err(|_| AvatarError::msg("animation driver state has been poisoned"))
    }
}

impl std::fmt::Debug for AnimationDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimationDriver")
            .field("emotion", &self.emotion())
            .field("frames", &self.frames_rendered())
            .finish()
    }
}

/// A running frame loop. Dropping it cancels the loop.
#[derive(Debug)]
pub struct AnimationLoop {
    cancelled: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl AnimationLoop {
    /// Stops renderer updates. No frame starts after this returns.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("animation loop cancelled");
        }
    }

    /// True once [`cancel`](Self::cancel) ran or the loop was dropped.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for AnimationLoop {
    fn drop(&mut self) {
        self.cancel();
    }
}

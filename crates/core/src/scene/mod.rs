use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    assets::{FittedPortrait, PortraitAsset},
    mapping::{self, JAW_CLOSED},
    render::{FrameInput, Renderer, Rgba, Surface},
    AvatarError,
};

const PANEL: Rgba = Rgba([10, 10, 16, 230]);
const PLACEHOLDER: Rgba = Rgba::hex(0x222633);
const PORTRAIT_MOUTH: Rgba = Rgba::hex(0x8b1a1a);
const BROW: Rgba = Rgba::hex(0xffffff);

const STAGE: Rgba = Rgba::hex(0x0b0d12);
const SKIN: Rgba = Rgba::hex(0xf2c9a0);
const PUPPET_MOUTH: Rgba = Rgba::hex(0x6b1b1b);
const EYE: Rgba = Rgba::hex(0x111111);
const SHIRT: Rgba = Rgba::hex(0x4b5563);

/// Which avatar is drawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvatarMode {
    /// Still image with a talking mouth overlay.
    Portrait,
    /// Posed figure with an eased jaw, blinking and idle sway.
    #[default]
    Puppet,
}

impl AvatarMode {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AvatarMode::Portrait => "portrait",
            AvatarMode::Puppet => "puppet",
        }
    }

    /// Builds the renderer for this mode.
    pub fn renderer(&self, jaw_easing: f32, portrait: Option<PortraitAsset>) -> Box<dyn Renderer> {
        match self {
            AvatarMode::Portrait => Box::new(PortraitRenderer::new(portrait)),
            AvatarMode::Puppet => Box::new(PuppetRenderer::new(jaw_easing)),
        }
    }
}

impl fmt::Display for AvatarMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AvatarMode {
    type Err = AvatarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "portrait" | "image" | "2d" => Ok(AvatarMode::Portrait),
            "puppet" | "3d" => Ok(AvatarMode::Puppet),
            other => Err(AvatarError::msg(format!("unknown avatar mode `{other}`"))),
        }
    }
}

/// Image avatar with a mouth ellipse and emotion brows drawn on top.
///
/// Offsets are authored for a 300 px tall surface and scale with height.
#[derive(Debug, Default)]
pub struct PortraitRenderer {
    portrait: Option<PortraitAsset>,
    fitted: Option<FittedPortrait>,
    fitted_for: (u32, u32),
}

impl PortraitRenderer {
    /// Without a portrait a placeholder panel is drawn.
    pub fn new(portrait: Option<PortraitAsset>) -> Self {
        Self {
            portrait,
            fitted: None,
            fitted_for: (0, 0),
        }
    }

    /// Replaces the portrait and drops the cached fit.
    pub fn set_portrait(&mut self, portrait: Option<PortraitAsset>) {
        self.portrait = portrait;
        self.fitted = None;
    }

    fn fitted(&mut self, width: u32, height: u32) -> Option<&FittedPortrait> {
        let portrait = self.portrait.as_ref()?;
        if self.fitted.is_none() || self.fitted_for != (width, height) {
            self.fitted = Some(portrait.fit(width, height));
            self.fitted_for = (width, height);
        }
        self.fitted.as_ref()
    }
}

impl Renderer for PortraitRenderer {
    fn name(&self) -> &str {
        "portrait"
    }

    fn render(&mut self, input: &FrameInput, surface: &mut Surface) {
        if surface.is_empty() {
            return;
        }
        let (w, h) = (surface.width() as f32, surface.height() as f32);
        let scale = h / 300.0;

        surface.fill(PANEL);
        match self.fitted(surface.width(), surface.height()) {
            Some(img) => {
                let (x, y, iw, ih) = (img.x, img.y, img.width, img.height);
                surface.blit(x, y, iw, ih, &img.pixels);
            }
            None => surface.fill_rect(w * 0.2, h * 0.2, w * 0.6, h * 0.6, PLACEHOLDER),
        }

        let openness = mapping::mouth_openness(input.amplitude) * scale;
        surface.fill_ellipse(w * 0.5, h * 0.6, 40.0 * scale, openness, PORTRAIT_MOUTH);

        let brow = mapping::brow_offset(input.emotion) * scale;
        let thickness = (4.0 * scale).max(1.0);
        surface.stroke_line(
            (w * 0.42, h * 0.45 + brow),
            (w * 0.48, h * 0.43 + brow),
            thickness,
            BROW,
        );
        surface.stroke_line(
            (w * 0.58, h * 0.45 + brow),
            (w * 0.52, h * 0.43 + brow),
            thickness,
            BROW,
        );
    }
}

/// Procedural figure viewed from the front.
///
/// World units: the head is centred at `y = 0.9` with radius `0.55`, the body
/// spans `y = -0.8..0.4`. The jaw eases toward its target rather than
/// snapping, and blink and sway follow time alone.
#[derive(Debug)]
pub struct PuppetRenderer {
    jaw: f32,
    easing: f32,
}

impl PuppetRenderer {
    /// `easing` is the fraction of the jaw gap closed per frame.
    pub fn new(easing: f32) -> Self {
        Self {
            jaw: JAW_CLOSED,
            easing,
        }
    }

    /// Current jaw angle in radians.
    pub fn jaw_angle(&self) -> f32 {
        self.jaw
    }
}

struct Camera {
    cx: f32,
    cy: f32,
    unit: f32,
    yaw: (f32, f32),
    pitch: (f32, f32),
}

impl Camera {
    const PIVOT_Y: f32 = 0.45;

    fn new(surface: &Surface, time_seconds: f32) -> Self {
        let (yaw, pitch) = mapping::sway(time_seconds);
        Self {
            cx: surface.width() as f32 / 2.0,
            cy: surface.height() as f32 / 2.0,
            unit: surface.height() as f32 / 2.6,
            yaw: yaw.sin_cos(),
            pitch: pitch.sin_cos(),
        }
    }

    /// Orthographic projection after the sway rotation.
    fn project(&self, x: f32, y: f32, z: f32) -> (f32, f32) {
        let (sy, cy) = self.yaw;
        let (sp, cp) = self.pitch;
        let x1 = x * cy + z * sy;
        let z1 = -x * sy + z * cy;
        let y0 = y - Self::PIVOT_Y;
        let y1 = y0 * cp - z1 * sp;
        (self.cx + x1 * self.unit, self.cy - y1 * self.unit)
    }

    fn len(&self, world: f32) -> f32 {
        world * self.unit
    }
}

impl Renderer for PuppetRenderer {
    fn name(&self) -> &str {
        "puppet"
    }

    fn render(&mut self, input: &FrameInput, surface: &mut Surface) {
        self.jaw = mapping::ease_toward(self.jaw, mapping::jaw_target(input.amplitude), self.easing);
        if surface.is_empty() {
            return;
        }
        let cam = Camera::new(surface, input.time_seconds);
        surface.fill(STAGE);

        // Body, stacked slices widening from 0.6 at the shoulders to 0.7 below.
        let (_, top) = cam.project(0.0, 0.4, 0.0);
        let (_, bottom) = cam.project(0.0, -0.8, 0.0);
        let rows = (bottom - top).max(1.0).ceil() as usize;
        for row in 0..rows {
            let t = row as f32 / rows as f32;
            let half = cam.len(0.6 + 0.1 * t);
            let (x, _) = cam.project(0.0, 0.4 - 1.2 * t, 0.0);
            surface.fill_rect(x - half, top + row as f32, half * 2.0, 1.0, SHIRT);
        }

        let (left, right) = mapping::hand_heights(input.amplitude, input.time_seconds);
        for (x, y) in [(-0.8, left), (0.8, right)] {
            let (px, py) = cam.project(x, y, 0.0);
            let r = cam.len(0.14);
            surface.fill_ellipse(px, py, r, r, SKIN);
        }

        let (hx, hy) = cam.project(0.0, 0.9, 0.0);
        let r = cam.len(0.55);
        surface.fill_ellipse(hx, hy, r, r, SKIN);

        // The upper lip stays at y = 0.62; the jaw hangs below the opening.
        let drop = 0.6 * self.jaw.sin();
        let (jx, jy) = cam.project(0.0, 0.58 - drop, 0.28);
        let (jw, jh) = (cam.len(0.8), cam.len(0.35) * self.jaw.cos());
        surface.fill_rect(jx - jw / 2.0, jy, jw, jh / 2.0, SKIN);
        let (mx, my) = cam.project(0.0, 0.6 - drop * 0.5, 0.55);
        surface.fill_ellipse(mx, my, cam.len(0.18), cam.len(0.02 + drop * 0.5), PUPPET_MOUTH);

        let (forward, up) = mapping::eye_offset(input.emotion);
        let blink = mapping::blink_scale(input.time_seconds);
        for x in [-0.2, 0.2] {
            let (ex, ey) = cam.project(x, 1.02 + up, 0.45 + forward);
            let r = cam.len(0.06);
            surface.fill_ellipse(ex, ey, r, r * blink, EYE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assets::fixtures::portrait_png, mapping::JAW_OPEN, Emotion};

    fn frame(amplitude: f32, emotion: Emotion) -> FrameInput {
        FrameInput {
            amplitude,
            emotion,
            time_seconds: 0.0,
        }
    }

    fn count(surface: &Surface, color: Rgba) -> usize {
        surface
            .pixels()
            .chunks_exact(4)
            .filter(|px| *px == color.0)
            .count()
    }

    fn first_row_of(surface: &Surface, color: Rgba) -> Option<u32> {
        (0..surface.height()).find(|&y| (0..surface.width()).any(|x| surface.pixel(x, y) == Some(color)))
    }

    #[test]
    fn portrait_mouth_opens_with_amplitude() {
        let mut renderer = PortraitRenderer::new(None);
        let mut surface = Surface::new(300, 300);

        renderer.render(&frame(0.0, Emotion::Neutral), &mut surface);
        let closed = count(&surface, PORTRAIT_MOUTH);
        renderer.render(&frame(1.0, Emotion::Neutral), &mut surface);
        let open = count(&surface, PORTRAIT_MOUTH);

        assert!(closed > 0);
        assert!(open > closed * 5, "{closed} vs {open}");
        assert_eq!(surface.pixel(70, 70), Some(PLACEHOLDER));
    }

    #[test]
    fn portrait_brows_follow_emotion() {
        let mut renderer = PortraitRenderer::new(None);
        let mut surface = Surface::new(300, 300);

        renderer.render(&frame(0.0, Emotion::Neutral), &mut surface);
        let neutral = first_row_of(&surface, BROW).unwrap();
        renderer.render(&frame(0.0, Emotion::Surprised), &mut surface);
        let surprised = first_row_of(&surface, BROW).unwrap();

        assert_eq!(neutral - surprised, 12);
    }

    #[test]
    fn portrait_image_replaces_placeholder() {
        let asset = PortraitAsset::decode(&portrait_png(60, 60)).unwrap();
        let mut renderer = PortraitRenderer::new(Some(asset));
        let mut surface = Surface::new(120, 120);

        renderer.render(&frame(0.0, Emotion::Neutral), &mut surface);

        assert_eq!(count(&surface, PLACEHOLDER), 0);
        let Some(Rgba([r, g, _, a])) = surface.pixel(5, 5) else {
            panic!("pixel out of bounds");
        };
        assert!(r.abs_diff(200) <= 2 && g.abs_diff(150) <= 2, "{r} {g}");
        assert_eq!(a, 255);
    }

    #[test]
    fn puppet_jaw_eases_instead_of_snapping() {
        let mut renderer = PuppetRenderer::new(0.35);
        let mut surface = Surface::new(64, 64);

        renderer.render(&frame(1.0, Emotion::Neutral), &mut surface);
        let first = renderer.jaw_angle();
        assert!(first > JAW_CLOSED && first < JAW_OPEN);
        assert!((first - (JAW_CLOSED + (JAW_OPEN - JAW_CLOSED) * 0.35)).abs() < 1e-6);

        for _ in 0..40 {
            renderer.render(&frame(1.0, Emotion::Neutral), &mut surface);
        }
        assert!((renderer.jaw_angle() - JAW_OPEN).abs() < 1e-3);
    }

    #[test]
    fn puppet_draws_figure_and_mouth() {
        let mut renderer = PuppetRenderer::new(1.0);
        let mut surface = Surface::new(200, 200);

        renderer.render(&frame(0.0, Emotion::Happy), &mut surface);
        let quiet = count(&surface, PUPPET_MOUTH);
        renderer.render(&frame(1.0, Emotion::Happy), &mut surface);
        let loud = count(&surface, PUPPET_MOUTH);

        assert!(count(&surface, SKIN) > 0);
        assert!(count(&surface, SHIRT) > 0);
        assert!(count(&surface, EYE) > 0);
        assert!(loud > quiet);
    }

    #[test]
    fn zero_sized_surface_is_tolerated() {
        let mut surface = Surface::new(0, 0);
        PortraitRenderer::default().render(&frame(0.5, Emotion::Sad), &mut surface);
        PuppetRenderer::new(0.35).render(&frame(0.5, Emotion::Sad), &mut surface);
    }

    #[test]
    fn modes_parse_aliases() {
        assert_eq!("3d".parse::<AvatarMode>().unwrap(), AvatarMode::Puppet);
        assert_eq!("Image".parse::<AvatarMode>().unwrap(), AvatarMode::Portrait);
        assert_eq!(AvatarMode::default().renderer(0.35, None).name(), "puppet");
    }
}

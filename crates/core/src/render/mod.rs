//! Offscreen RGBA surface and the renderer contract.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{AvatarError, Emotion, Result};

/// 8-bit RGBA colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self([r, g, b, 255])
    }

    /// Colour from a `0xRRGGBB` literal.
    pub const fn hex(value: u32) -> Self {
        Self::opaque((value >> 16) as u8, (value >> 8) as u8, value as u8)
    }

    pub fn with_alpha(self, alpha: f32) -> Self {
        let [r, g, b, _] = self.0;
        Self([r, g, b, (alpha.clamp(0.0, 1.0) * 255.0).round() as u8])
    }
}

/// Per-frame input handed to a [`Renderer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInput {
    pub amplitude: f32,
    pub emotion: Emotion,
    pub time_seconds: f32,
}

/// Something that turns amplitude and emotion into pixels.
pub trait Renderer: Send {
    fn name(&self) -> &str;

    fn render(&mut self, input: &FrameInput, surface: &mut Surface);
}

/// RGBA8 pixel buffer. Zero-sized surfaces are allowed but cannot be
/// captured.
#[derive(Clone, PartialEq, Eq)]
pub struct Surface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Surface {
    /// A transparent surface of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Row-major RGBA8 bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Resizes and clears the buffer.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.pixels.clear();
        self.pixels.resize(width as usize * height as usize * 4, 0);
    }

    /// Colour at `(x, y)`, or `None` outside the surface.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = self.offset(x, y);
        let mut px = [0u8; 4];
        px.copy_from_slice(&self.pixels[offset..offset + 4]);
        Some(Rgba(px))
    }

    /// Overwrites every pixel, ignoring blending.
    pub fn fill(&mut self, color: Rgba) {
        for px in self.pixels.chunks_exact_mut(4) {
            px.copy_from_slice(&color.0);
        }
    }

    /// Source-over blend of one pixel. Out-of-bounds coordinates are ignored.
    pub fn blend(&mut self, x: i64, y: i64, color: Rgba) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let offset = self.offset(x as u32, y as u32);
        let alpha = color.0[3] as u32;
        if alpha == 255 {
            self.pixels[offset..offset + 4].copy_from_slice(&color.0);
            return;
        }
        let dst = &mut self.pixels[offset..offset + 4];
        for channel in 0..3 {
            let src = color.0[channel] as u32;
            let under = dst[channel] as u32;
            dst[channel] = ((src * alpha + under * (255 - alpha) + 127) / 255) as u8;
        }
        let under = dst[3] as u32;
        dst[3] = (alpha + (under * (255 - alpha) + 127) / 255).min(255) as u8;
    }

    /// Blends an axis-aligned rectangle; the edges are clipped.
    pub fn fill_rect(&mut self, x: f32, y: f32, w: f32, h: f32, color: Rgba) {
        let (x0, y0) = (x.round() as i64, y.round() as i64);
        let (x1, y1) = ((x + w).round() as i64, (y + h).round() as i64);
        for py in y0.max(0)..y1.min(self.height as i64) {
            for px in x0.max(0)..x1.min(self.width as i64) {
                self.blend(px, py, color);
            }
        }
    }

    /// Axis-aligned filled ellipse centred on `(cx, cy)`.
    pub fn fill_ellipse(&mut self, cx: f32, cy: f32, rx: f32, ry: f32, color: Rgba) {
        if rx <= 0.0 || ry <= 0.0 {
            return;
        }
        let y0 = (cy - ry).floor() as i64;
        let y1 = (cy + ry).ceil() as i64;
        for py in y0.max(0)..=y1.min(self.height as i64 - 1) {
            let dy = (py as f32 + 0.5 - cy) / ry;
            if dy.abs() > 1.0 {
                continue;
            }
            let half = rx * (1.0 - dy * dy).sqrt();
            let x0 = (cx - half).round() as i64;
            let x1 = (cx + half).round() as i64;
            for px in x0.max(0)..x1.min(self.width as i64) {
                self.blend(px, py, color);
            }
        }
    }

    /// Thick line segment drawn as a run of discs.
    pub fn stroke_line(&mut self, from: (f32, f32), to: (f32, f32), width: f32, color: Rgba) {
        let (dx, dy) = (to.0 - from.0, to.1 - from.1);
        let steps = dx.abs().max(dy.abs()).ceil().max(1.0) as usize;
        let radius = (width / 2.0).max(0.5);
        // Opaque colours only; overlapping translucent discs would darken.
        let color = Rgba::opaque(color.0[0], color.0[1], color.0[2]);
        for step in 0..=steps {
            let t = step as f32 / steps as f32;
            self.fill_ellipse(from.0 + dx * t, from.1 + dy * t, radius, radius, color);
        }
    }

    /// Copies `pixels` (RGBA8, `width` x `height`) with its top-left at `(x, y)`.
    pub fn blit(&mut self, x: i64, y: i64, width: u32, height: u32, pixels: &[u8]) {
        for row in 0..height as i64 {
            for col in 0..width as i64 {
                let offset = ((row * width as i64 + col) * 4) as usize;
                let Some(src) = pixels.get(offset..offset + 4) else {
                    return;
                };
                self.blend(x + col, y + row, Rgba([src[0], src[1], src[2], src[3]]));
            }
        }
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 4
    }
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Surface shared between the animation loop and capture.
#[derive(Debug, Clone)]
pub struct SharedSurface {
    inner: Arc<Mutex<Surface>>,
}

impl SharedSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Surface::new(width, height))),
        }
    }

    /// Exclusive access for drawing.
    pub fn lock(&self) -> Result<MutexGuard<'_, Surface>> {
        self.inner
            .lock()
            .map_err(|_| AvatarError::msg("render surface has been poisoned"))
    }

    /// Current width and height.
    pub fn dimensions(&self) -> Result<(u32, u32)> {
        let surface = self.lock()?;
        Ok((surface.width(), surface.height()))
    }

    /// Copy of the current pixels.
    pub fn snapshot(&self) -> Result<Surface> {
        Ok(self.lock()?.clone())
    }
}

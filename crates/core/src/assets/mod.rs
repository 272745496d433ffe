use image::{imageops::FilterType, RgbaImage};
use tracing::debug;

use crate::{AvatarError, Result};

/// Decoded portrait image used by the portrait renderer.
#[derive(Clone)]
pub struct PortraitAsset {
    image: RgbaImage,
}

/// A portrait scaled for one surface size.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedPortrait {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl PortraitAsset {
    /// Decodes png or jpeg bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| AvatarError::decode(format!("portrait image: {e}")))?
            .to_rgba8();
        if image.width() == 0 || image.height() == 0 {
            return Err(AvatarError::decode("portrait image has no pixels"));
        }
        debug!(width = image.width(), height = image.height(), "portrait decoded");
        Ok(Self { image })
    }

    /// Uses an already decoded image as is.
    pub fn from_rgba(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Scales to the full surface width, keeping aspect, centred vertically.
    ///
    /// Portraits taller than the surface are cropped to the rows that stay
    /// visible before scaling, so the result never exceeds the surface.
    pub fn fit(&self, surface_width: u32, surface_height: u32) -> FittedPortrait {
        let (source_width, source_height) = self.image.dimensions();
        let width = surface_width.max(1);
        let surface_height = surface_height.max(1);
        let scale = width as f64 / source_width as f64;
        let full_height = ((source_height as f64 * scale).round() as u32).max(1);

        if full_height <= surface_height {
            let resized =
                image::imageops::resize(&self.image, width, full_height, FilterType::Triangle);
            return FittedPortrait {
                x: 0,
                y: (surface_height - full_height) as i64 / 2,
                width,
                height: full_height,
                pixels: resized.into_raw(),
            };
        }

        let rows = ((surface_height as f64 / scale).round() as u32).clamp(1, source_height);
        let top = (source_height - rows) / 2;
        let visible = image::imageops::crop_imm(&self.image, 0, top, source_width, rows).to_image();
        let resized = image::imageops::resize(&visible, width, surface_height, FilterType::Triangle);
        FittedPortrait {
            x: 0,
            y: 0,
            width,
            height: surface_height,
            pixels: resized.into_raw(),
        }
    }
}

impl std::fmt::Debug for PortraitAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortraitAsset")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::Cursor;

    use image::{ImageFormat, Rgba, RgbaImage};

    pub fn portrait_png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba([200, 150, 120, 255]));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .expect("encode png fixture");
        out.into_inner()
    }
}

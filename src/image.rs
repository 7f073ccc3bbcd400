//! Layer fragments and raster compositing.

use bytes::Bytes;
use kurbo::BezPath;
use rayon::prelude::*;

use crate::error::{TileError, TileResult};

/// Decoded RGBA8 image, straight (non-premultiplied) alpha.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// Raw RGBA pixel data, row-major.
    pub data: Bytes,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Image {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 4);
        Self {
            data: Bytes::from(data),
            width,
            height,
        }
    }

    /// Image filled with a single RGBA colour.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba.repeat(width as usize * height as usize);
        Self::new(data, width, height)
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Whether `data` holds exactly `width * height` RGBA pixels.
    pub fn is_well_formed(&self) -> bool {
        self.size_bytes() == self.width as usize * self.height as usize * 4
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }
}

/// Vector overlay drawn above the raster composite by the presentation
/// layer. Opacity, visibility and z-value mirror the owning layer and are
/// refreshed on every blend.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayItem {
    pub path: BezPath,
    pub color: [u8; 4],
    pub opacity: f64,
    pub visible: bool,
    pub z_value: i32,
}

impl OverlayItem {
    pub fn new(path: BezPath, color: [u8; 4]) -> Self {
        Self {
            path,
            color,
            opacity: 1.0,
            visible: true,
            z_value: 0,
        }
    }
}

/// Kind of result a source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Raster,
    Overlay,
}

/// One layer's data for one tile.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Raster(Image),
    Overlay(OverlayItem),
}

impl Fragment {
    pub fn image_type(&self) -> ImageType {
        match self {
            Fragment::Raster(_) => ImageType::Raster,
            Fragment::Overlay(_) => ImageType::Overlay,
        }
    }

    /// Check that the fragment is the kind `expected` and that raster data
    /// matches its dimensions.
    pub fn validate(&self, expected: ImageType) -> TileResult<()> {
        if self.image_type() != expected {
            return Err(TileError::MalformedFragment(format!(
                "expected {expected:?}, got {:?}",
                self.image_type()
            )));
        }
        match self {
            Fragment::Raster(image) if !image.is_well_formed() => {
                Err(TileError::MalformedFragment(format!(
                    "{}x{} raster with {} bytes",
                    image.width,
                    image.height,
                    image.size_bytes()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Mutable RGBA surface that raster fragments are painted onto.
pub(crate) struct Canvas {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Canvas {
    /// Fully transparent canvas.
    pub(crate) fn new(width: u32, height: u32) -> Self {
        Self {
            data: vec![0; width as usize * height as usize * 4],
            width,
            height,
        }
    }

    /// Source-over paint of `src`, stretched to the canvas with
    /// nearest-neighbour sampling, at the given opacity.
    pub(crate) fn paint(&mut self, src: &Image, opacity: f64) {
        if src.width == 0 || src.height == 0 || !src.is_well_formed() {
            return;
        }
        let opacity = opacity.clamp(0.0, 1.0) as f32;
        let (dw, dh) = (self.width as usize, self.height as usize);
        let (sw, sh) = (src.width as usize, src.height as usize);
        let src_data = src.data.as_ref();

        self.data
            .par_chunks_mut(dw * 4)
            .enumerate()
            .for_each(|(y, row)| {
                let sy = (y * sh / dh).min(sh - 1);
                for x in 0..dw {
                    let sx = (x * sw / dw).min(sw - 1);
                    let si = (sy * sw + sx) * 4;
                    blend_pixel(&mut row[x * 4..x * 4 + 4], &src_data[si..si + 4], opacity);
                }
            });
    }

    pub(crate) fn into_image(self) -> Image {
        Image::new(self.data, self.width, self.height)
    }
}

fn blend_pixel(dst: &mut [u8], src: &[u8], opacity: f32) {
    let sa = src[3] as f32 / 255.0 * opacity;
    if sa <= 0.0 {
        return;
    }
    let da = dst[3] as f32 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    for c in 0..3 {
        let sc = src[c] as f32;
        let dc = dst[c] as f32;
        let v = (sc * sa + dc * da * (1.0 - sa)) / out_a;
        dst[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    dst[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
}

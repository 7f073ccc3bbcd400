//! Patch geometry mapped into scene (display) space.

use kurbo::{Affine, Rect};

use crate::error::{TileError, TileResult};
use crate::patch_accessor::{Bounds, PatchAccessor};

/// Precomputed geometry of one tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGeometry {
    /// Data-space rectangle requested from sources, including overlap.
    pub data_rect: Bounds,
    /// Scene rectangle covered by `data_rect`.
    pub scene_rect: Rect,
    /// Scene rectangle of the bare patch, padded outward by the draw overlap.
    pub draw_rect: Rect,
    /// Pixel size of the composited tile image.
    pub image_size: (u32, u32),
}

/// Tile grid over one slice, with its data-to-scene transform.
#[derive(Debug, Clone)]
pub struct Tiling {
    accessor: PatchAccessor,
    data2scene: Affine,
    scene2data: Affine,
    overlap: usize,
    overlap_draw: f64,
    name: String,
    geometry: Vec<TileGeometry>,
}

fn check_invertible(transform: Affine) -> TileResult<()> {
    let det = transform.determinant();
    if det == 0.0 || !det.is_finite() {
        return Err(TileError::Configuration(format!(
            "data2scene transform is not invertible: {transform:?}"
        )));
    }
    Ok(())
}

/// Whole-pixel size of a scene rectangle once aligned to the pixel grid.
fn aligned_size(rect: Rect) -> (u32, u32) {
    let w = (rect.x1.ceil() - rect.x0.floor()).max(1.0);
    let h = (rect.y1.ceil() - rect.y0.floor()).max(1.0);
    (w as u32, h as u32)
}

impl Tiling {
    pub fn new(
        slice_shape: (usize, usize),
        data2scene: Affine,
        tile_width: usize,
        overlap: usize,
        overlap_draw: f64,
        name: impl Into<String>,
    ) -> TileResult<Self> {
        if tile_width == 0 {
            return Err(TileError::Configuration("tile width must be positive".into()));
        }
        check_invertible(data2scene)?;

        let mut tiling = Self {
            accessor: PatchAccessor::new(slice_shape.0, slice_shape.1, tile_width),
            data2scene,
            scene2data: data2scene.inverse(),
            overlap,
            overlap_draw,
            name: name.into(),
            geometry: Vec::new(),
        };
        tiling.compute_geometry();
        Ok(tiling)
    }

    fn compute_geometry(&mut self) {
        self.geometry = (0..self.accessor.patch_count())
            .map(|id| {
                let data_rect = self.accessor.patch_bounds(id, self.overlap);
                let scene_rect = self.data2scene.transform_rect_bbox(data_rect.to_rect());
                let bare = self.accessor.patch_bounds(id, 0);
                let draw_rect = self
                    .data2scene
                    .transform_rect_bbox(bare.to_rect())
                    .inflate(self.overlap_draw, self.overlap_draw);
                TileGeometry {
                    data_rect,
                    scene_rect,
                    draw_rect,
                    image_size: aligned_size(scene_rect),
                }
            })
            .collect();
    }

    /// Replace the transform. Patch ids and the grid stay as they are; only
    /// the scene-space geometry is recomputed.
    pub fn set_data2scene(&mut self, data2scene: Affine) -> TileResult<()> {
        check_invertible(data2scene)?;
        self.data2scene = data2scene;
        self.scene2data = data2scene.inverse();
        self.compute_geometry();
        Ok(())
    }

    pub fn data2scene(&self) -> Affine {
        self.data2scene
    }

    pub fn scene2data(&self) -> Affine {
        self.scene2data
    }

    /// Patch ids whose data rectangle intersects `rect` (scene space).
    ///
    /// A degenerate rect means "everything" and yields every id.
    pub fn intersected(&self, rect: Rect) -> Vec<usize> {
        if !rect.is_finite() || rect.width() <= 0.0 || rect.height() <= 0.0 {
            return self.all_ids();
        }
        let data = self.scene2data.transform_rect_bbox(rect);
        let x0 = data.x0.floor().max(0.0) as usize;
        let y0 = data.y0.floor().max(0.0) as usize;
        let x1 = data.x1.ceil().max(0.0) as usize;
        let y1 = data.y1.ceil().max(0.0) as usize;
        self.accessor.patches_for_rect(x0, y0, x1, y1)
    }

    /// Patch ids intersecting a data-space rectangle.
    pub fn intersected_data(&self, bounds: &Bounds) -> Vec<usize> {
        self.accessor.patches_for_bounds(bounds)
    }

    pub fn all_ids(&self) -> Vec<usize> {
        (0..self.len()).collect()
    }

    pub fn len(&self) -> usize {
        self.geometry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.is_empty()
    }

    pub fn geometry(&self, id: usize) -> Option<&TileGeometry> {
        self.geometry.get(id)
    }

    /// Scene rectangle of the whole slice.
    pub fn scene_rect(&self) -> Rect {
        self.data2scene
            .transform_rect_bbox(self.accessor.extent().to_rect())
    }

    pub fn slice_shape(&self) -> (usize, usize) {
        self.accessor.shape()
    }

    pub fn accessor(&self) -> &PatchAccessor {
        &self.accessor
    }

    pub fn tile_width(&self) -> usize {
        self.accessor.block_size()
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn overlap_draw(&self) -> f64 {
        self.overlap_draw
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

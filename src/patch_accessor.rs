//! Partitioning of a 2D data extent into a grid of rectangular patches.
//!
//! Patches are numbered row-major. Along each axis a trailing cell thinner
//! than a third of the nominal size is folded into its neighbour, so the
//! grid never ends in a sliver.

/// Half-open data-space rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Bounds {
    pub x0: usize,
    pub x1: usize,
    pub y0: usize,
    pub y1: usize,
}

impl Bounds {
    pub fn new(x0: usize, x1: usize, y0: usize, y1: usize) -> Self {
        Self { x0, x1, y0, y1 }
    }

    pub fn width(&self) -> usize {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> usize {
        self.y1.saturating_sub(self.y0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Whether `self` covers all of `other`.
    pub fn contains(&self, other: &Bounds) -> bool {
        self.x0 <= other.x0 && self.y0 <= other.y0 && self.x1 >= other.x1 && self.y1 >= other.y1
    }

    pub fn to_rect(&self) -> kurbo::Rect {
        kurbo::Rect::new(self.x0 as f64, self.y0 as f64, self.x1 as f64, self.y1 as f64)
    }
}

/// Number of cells along one axis after merging a thin trailing cell.
fn cell_count(extent: usize, block: usize) -> usize {
    let n = extent.div_ceil(block).max(1);
    let last = extent.saturating_sub((n - 1) * block);
    if n > 1 && last > 0 && last * 3 < block {
        n - 1
    } else {
        n
    }
}

/// Grid of patches over a `width x height` extent.
#[derive(Debug, Clone)]
pub struct PatchAccessor {
    width: usize,
    height: usize,
    block_size: usize,
    cols: usize,
    rows: usize,
}

impl PatchAccessor {
    /// `block_size` must be non-zero; callers validate configuration first.
    pub fn new(width: usize, height: usize, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            width,
            height,
            block_size,
            cols: cell_count(width, block_size),
            rows: cell_count(height, block_size),
        }
    }

    pub fn patch_count(&self) -> usize {
        self.cols * self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn axis_bounds(index: usize, count: usize, block: usize, extent: usize) -> (usize, usize) {
        let start = (index * block).min(extent);
        let end = if index + 1 >= count {
            extent
        } else {
            ((index + 1) * block).min(extent)
        };
        (start, end)
    }

    /// Bounds of patch `id`, grown by `overlap` on every side that is not
    /// the outer boundary of the extent.
    pub fn patch_bounds(&self, id: usize, overlap: usize) -> Bounds {
        let col = id % self.cols;
        let row = (id / self.cols).min(self.rows - 1);
        let (x0, x1) = Self::axis_bounds(col, self.cols, self.block_size, self.width);
        let (y0, y1) = Self::axis_bounds(row, self.rows, self.block_size, self.height);
        Bounds {
            x0: x0.saturating_sub(overlap),
            x1: (x1 + overlap).min(self.width),
            y0: y0.saturating_sub(overlap),
            y1: (y1 + overlap).min(self.height),
        }
    }

    /// Index range `[start, end)` of the cells hit by `[lo, hi)`, clamped so
    /// it always holds at least one cell.
    fn axis_range(lo: usize, hi: usize, block: usize, count: usize) -> (usize, usize) {
        let start = (lo / block).min(count - 1);
        let end = hi.div_ceil(block).min(count).max(start + 1);
        (start, end)
    }

    /// Patch ids covering the half-open rectangle `[x0, x1) x [y0, y1)`, in
    /// row-major order.
    pub fn patches_for_rect(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> Vec<usize> {
        let (sx, ex) = Self::axis_range(x0, x1, self.block_size, self.cols);
        let (sy, ey) = Self::axis_range(y0, y1, self.block_size, self.rows);

        let mut ids = Vec::with_capacity((ex - sx) * (ey - sy));
        for row in sy..ey {
            for col in sx..ex {
                ids.push(row * self.cols + col);
            }
        }
        ids
    }

    pub fn patches_for_bounds(&self, bounds: &Bounds) -> Vec<usize> {
        self.patches_for_rect(bounds.x0, bounds.y0, bounds.x1, bounds.y1)
    }

    /// Bounds of the whole extent.
    pub fn extent(&self) -> Bounds {
        Bounds::new(0, self.width, 0, self.height)
    }
}

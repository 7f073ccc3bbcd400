//! Image sources and the ordered layer stack composited into tiles.

use std::fmt;
use std::sync::Arc;

use crate::error::{TileError, TileResult};
use crate::image::{Fragment, ImageType};
use crate::patch_accessor::Bounds;

/// Identity of one layer in a [`StackedImageSources`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u64);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

/// Key of one renderable plane of the volume: the slicing index plus the
/// coordinates along the remaining ("through") axes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StackId {
    pub index: usize,
    pub through: Vec<i64>,
}

impl StackId {
    pub fn new(index: usize, through: Vec<i64>) -> Self {
        Self { index, through }
    }

    /// Sibling plane on the same slicing index.
    pub fn with_through(&self, through: Vec<i64>) -> Self {
        Self {
            index: self.index,
            through,
        }
    }
}

/// Pending fetch produced by an [`ImageSource`].
pub trait ImageRequest: Send {
    /// Block until the data is available.
    fn wait(self: Box<Self>) -> TileResult<Fragment>;
}

/// Upstream provider of one layer's pixel or overlay data.
pub trait ImageSource: Send + Sync {
    /// Prepare a fetch of `rect` on the plane addressed by `through`.
    ///
    /// Returns [`TileError::IndeterminateSource`] when the upstream cannot
    /// currently say what it would produce.
    fn request(&self, rect: Bounds, through: &[i64]) -> TileResult<Box<dyn ImageRequest>>;

    /// Cheap sources are fetched inline instead of through the scheduler.
    fn is_direct(&self) -> bool {
        false
    }

    fn image_type(&self) -> ImageType {
        ImageType::Raster
    }

    /// Whether the source's output has no transparent pixels.
    fn is_opaque(&self) -> bool {
        false
    }
}

/// A layer in the stack.
#[derive(Clone)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub source: Arc<dyn ImageSource>,
    pub visible: bool,
    pub opacity: f64,
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("visible", &self.visible)
            .field("opacity", &self.opacity)
            .finish()
    }
}

/// Snapshot of a layer's compositing state.
#[derive(Clone, Debug)]
pub struct LayerView {
    pub layer: Layer,
    /// Effective visibility (visible flag and non-zero opacity).
    pub visible: bool,
    pub occluded: bool,
    /// Stacking position; larger values are drawn above smaller ones.
    pub z_value: i32,
}

impl LayerView {
    pub fn id(&self) -> LayerId {
        self.layer.id
    }

    /// Visible and not hidden by an opaque layer above it.
    pub fn contributes(&self) -> bool {
        self.visible && !self.occluded
    }
}

/// Ordered layer stack, stored top to bottom (index 0 is drawn last).
#[derive(Debug, Default)]
pub struct StackedImageSources {
    layers: Vec<Layer>,
    next_id: u64,
}

impl StackedImageSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a layer at `index` (clamped to the stack height).
    pub fn add_layer(
        &mut self,
        index: usize,
        name: impl Into<String>,
        source: Arc<dyn ImageSource>,
        opacity: f64,
        visible: bool,
    ) -> LayerId {
        self.next_id += 1;
        let id = LayerId(self.next_id);
        let layer = Layer {
            id,
            name: name.into(),
            source,
            visible,
            opacity: opacity.clamp(0.0, 1.0),
        };
        let index = index.min(self.layers.len());
        self.layers.insert(index, layer);
        id
    }

    pub fn remove_layer(&mut self, id: LayerId) -> TileResult<Layer> {
        let index = self.position(id)?;
        Ok(self.layers.remove(index))
    }

    /// Move a layer to `index` (clamped). Returns whether the order changed.
    pub fn move_layer(&mut self, id: LayerId, index: usize) -> TileResult<bool> {
        let from = self.position(id)?;
        let to = index.min(self.layers.len() - 1);
        if from == to {
            return Ok(false);
        }
        let layer = self.layers.remove(from);
        self.layers.insert(to, layer);
        Ok(true)
    }

    /// Returns whether the flag changed.
    pub fn set_visible(&mut self, id: LayerId, visible: bool) -> TileResult<bool> {
        let layer = self.layer_mut(id)?;
        let changed = layer.visible != visible;
        layer.visible = visible;
        Ok(changed)
    }

    /// Returns whether the opacity changed.
    pub fn set_opacity(&mut self, id: LayerId, opacity: f64) -> TileResult<bool> {
        let opacity = opacity.clamp(0.0, 1.0);
        let layer = self.layer_mut(id)?;
        let changed = layer.opacity != opacity;
        layer.opacity = opacity;
        Ok(changed)
    }

    fn position(&self, id: LayerId) -> TileResult<usize> {
        self.layers
            .iter()
            .position(|l| l.id == id)
            .ok_or(TileError::UnknownLayer(id))
    }

    fn layer_mut(&mut self, id: LayerId) -> TileResult<&mut Layer> {
        self.layers
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(TileError::UnknownLayer(id))
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    fn layer_visible(layer: &Layer) -> bool {
        layer.visible && layer.opacity > 0.0
    }

    fn layer_hides_below(layer: &Layer) -> bool {
        Self::layer_visible(layer) && layer.opacity >= 1.0 && layer.source.is_opaque()
    }

    pub fn is_visible(&self, id: LayerId) -> bool {
        self.layer(id).is_some_and(Self::layer_visible)
    }

    /// Whether a visible, fully opaque layer lies above `id`.
    pub fn is_occluded(&self, id: LayerId) -> bool {
        self.layers
            .iter()
            .take_while(|l| l.id != id)
            .any(Self::layer_hides_below)
    }

    /// Compositing snapshot, top to bottom.
    pub fn view(&self) -> Vec<LayerView> {
        let n = self.layers.len() as i32;
        let mut occluded = false;
        self.layers
            .iter()
            .enumerate()
            .map(|(i, layer)| {
                let view = LayerView {
                    layer: layer.clone(),
                    visible: Self::layer_visible(layer),
                    occluded,
                    z_value: n - i as i32,
                };
                occluded |= Self::layer_hides_below(layer);
                view
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

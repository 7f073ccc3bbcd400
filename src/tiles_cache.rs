//! Per-stack storage of composited tiles, layer fragments and dirty bits.
//!
//! Five [`MultiCache`]s share one [`CachePolicy`] so that everything cached
//! for a stack is evicted together. All access goes through a
//! [`TilesCacheGuard`]: callers take the lock once per logical transaction
//! (read dirty bit, then write) so producer threads cannot interleave.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{TileError, TileResult};
use crate::image::{Fragment, Image, OverlayItem};
use crate::multi_cache::{CachePolicy, MultiCache};
use crate::source::{LayerId, LayerView, StackId};

/// Everything a tile composite depends on: pixel size, and per layer
/// (bottom to top) its id, fragment timestamp, visibility, opacity and z.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlendInputs {
    pub image_size: (u32, u32),
    pub layers: Vec<(LayerId, u64, bool, f64, i32)>,
}

/// Composited state of one tile.
#[derive(Debug, Clone, Default)]
pub struct TileCacheEntry {
    /// `None` until the first contributing layer has been painted.
    pub image: Option<Image>,
    /// Fraction of contributing layers that are clean, in `[0, 1]`.
    pub progress: f64,
    /// Inputs `image` was composited from; `None` forces a re-blend.
    pub inputs: Option<BlendInputs>,
}

/// Sparse dirty bits: a key is dirty unless it has been marked clean.
///
/// Marking everything dirty is therefore just forgetting every clean key,
/// and keys never seen before read as dirty.
#[derive(Debug, Clone)]
pub struct DirtyMap<K> {
    clean: HashSet<K>,
}

impl<K> Default for DirtyMap<K> {
    fn default() -> Self {
        Self {
            clean: HashSet::new(),
        }
    }
}

impl<K: Hash + Eq> DirtyMap<K> {
    pub fn is_dirty(&self, key: &K) -> bool {
        !self.clean.contains(key)
    }

    pub fn set_dirty(&mut self, key: K, dirty: bool) {
        if dirty {
            self.clean.remove(&key);
        } else {
            self.clean.insert(key);
        }
    }

    pub fn mark_all_dirty(&mut self) {
        self.clean.clear();
    }

    /// Mark dirty every key for which `f` returns true.
    pub fn mark_dirty_where(&mut self, mut f: impl FnMut(&K) -> bool) {
        self.clean.retain(|k| !f(k));
    }
}

type LayerKey = (LayerId, usize);

struct CacheState {
    tiles: MultiCache<StackId, HashMap<usize, TileCacheEntry>>,
    tile_dirty: MultiCache<StackId, DirtyMap<usize>>,
    layers: MultiCache<StackId, HashMap<LayerKey, Fragment>>,
    layer_dirty: MultiCache<StackId, DirtyMap<LayerKey>>,
    layer_timestamp: MultiCache<StackId, HashMap<LayerKey, u64>>,
    /// Per layer, completions at or below this timestamp are stale in
    /// every stack.
    layer_floor: HashMap<LayerId, u64>,
    /// Same as `layer_floor` for one (layer, tile).
    tile_floor: HashMap<LayerKey, u64>,
}

impl CacheState {
    fn new(policy: &CachePolicy) -> Self {
        Self {
            tiles: MultiCache::new(policy.clone()),
            tile_dirty: MultiCache::new(policy.clone()),
            layers: MultiCache::new(policy.clone()),
            layer_dirty: MultiCache::new(policy.clone()),
            layer_timestamp: MultiCache::new(policy.clone()),
            layer_floor: HashMap::new(),
            tile_floor: HashMap::new(),
        }
    }

    fn enforce_capacity(&mut self) {
        self.tiles.enforce_capacity();
        self.tile_dirty.enforce_capacity();
        self.layers.enforce_capacity();
        self.layer_dirty.enforce_capacity();
        self.layer_timestamp.enforce_capacity();
    }
}

/// Tile and layer cache for every stack, bounded in number of stacks.
pub struct TilesCache {
    state: Arc<Mutex<CacheState>>,
    policy: CachePolicy,
}

impl TilesCache {
    pub fn new(cache_size: usize) -> TileResult<Self> {
        let policy = CachePolicy::new(cache_size)?;
        let state = Arc::new(Mutex::new(CacheState::new(&policy)));

        let weak = Arc::downgrade(&state);
        policy.subscribe(move |_| {
            if let Some(state) = weak.upgrade() {
                state.lock().enforce_capacity();
            }
        });

        Ok(Self { state, policy })
    }

    /// Enter a cache transaction.
    pub fn lock(&self) -> TilesCacheGuard<'_> {
        TilesCacheGuard {
            state: self.state.lock(),
        }
    }

    pub fn cache_size(&self) -> usize {
        self.policy.size()
    }

    /// Resize, evicting least recently used stacks immediately.
    ///
    /// Takes the cache lock itself; must not be called while the caller
    /// holds a guard.
    pub fn set_cache_size(&self, cache_size: usize) -> TileResult<()> {
        self.policy.set_size(cache_size)
    }
}

/// Lock held over a [`TilesCache`] transaction.
///
/// Stacks that are absent (never added, or evicted) read as empty and
/// dirty, and writes to them are dropped.
pub struct TilesCacheGuard<'a> {
    state: MutexGuard<'a, CacheState>,
}

impl TilesCacheGuard<'_> {
    /// Add `stack` as most recently used in all sub-caches.
    pub fn add_stack(&mut self, stack: StackId) -> TileResult<()> {
        if self.state.tiles.contains(&stack) {
            return Err(TileError::DuplicateKey(format!("{stack:?}")));
        }
        self.state.tiles.add(stack.clone())?;
        self.state.tile_dirty.add(stack.clone())?;
        self.state.layers.add(stack.clone())?;
        self.state.layer_dirty.add(stack.clone())?;
        self.state.layer_timestamp.add(stack)?;
        Ok(())
    }

    /// Promote `stack` to most recently used in all sub-caches.
    pub fn touch_stack(&mut self, stack: &StackId) {
        self.state.tiles.touch(stack);
        self.state.tile_dirty.touch(stack);
        self.state.layers.touch(stack);
        self.state.layer_dirty.touch(stack);
        self.state.layer_timestamp.touch(stack);
    }

    pub fn contains_stack(&self, stack: &StackId) -> bool {
        self.state.tiles.contains(stack)
    }

    /// Cached stacks, least recently used first.
    pub fn stacks(&self) -> Vec<StackId> {
        self.state.tiles.keys().cloned().collect()
    }

    pub fn tile(&self, stack: &StackId, tile: usize) -> Option<&TileCacheEntry> {
        self.state.tiles.get(stack)?.get(&tile)
    }

    /// Store a composited tile and return its freshly computed progress.
    pub fn set_tile(
        &mut self,
        stack: &StackId,
        tile: usize,
        image: Option<Image>,
        inputs: BlendInputs,
        layers: &[LayerView],
    ) -> f64 {
        let progress = self.progress(stack, tile, layers);
        if let Some(tiles) = self.state.tiles.get_mut(stack) {
            tiles.insert(
                tile,
                TileCacheEntry {
                    image,
                    progress,
                    inputs: Some(inputs),
                },
            );
        }
        progress
    }

    /// Recompute and store the progress of `tile` without touching its image.
    pub fn refresh_progress(&mut self, stack: &StackId, tile: usize, layers: &[LayerView]) -> f64 {
        let progress = self.progress(stack, tile, layers);
        if let Some(entry) = self
            .state
            .tiles
            .get_mut(stack)
            .and_then(|tiles| tiles.get_mut(&tile))
        {
            entry.progress = progress;
        }
        progress
    }

    /// Current compositing inputs of `tile` for the given layer snapshot.
    pub fn blend_inputs(
        &self,
        stack: &StackId,
        tile: usize,
        layers: &[LayerView],
        image_size: (u32, u32),
    ) -> BlendInputs {
        BlendInputs {
            image_size,
            layers: layers
                .iter()
                .rev()
                .map(|view| {
                    (
                        view.id(),
                        self.layer_timestamp(stack, view.id(), tile),
                        view.visible,
                        view.layer.opacity,
                        view.z_value,
                    )
                })
                .collect(),
        }
    }

    /// Inputs the stored composite of `tile` was built from.
    pub fn tile_inputs(&self, stack: &StackId, tile: usize) -> Option<&BlendInputs> {
        self.tile(stack, tile)?.inputs.as_ref()
    }

    /// Drop the recorded inputs of `tile` so the next refresh re-blends it.
    pub fn forget_blend(&mut self, stack: &StackId, tile: usize) {
        if let Some(entry) = self
            .state
            .tiles
            .get_mut(stack)
            .and_then(|tiles| tiles.get_mut(&tile))
        {
            entry.inputs = None;
        }
    }

    /// `1 - dirty / contributing` over layers that are visible and not
    /// occluded; 1.0 when no layer contributes.
    pub fn progress(&self, stack: &StackId, tile: usize, layers: &[LayerView]) -> f64 {
        let mut contributing = 0usize;
        let mut dirty = 0usize;
        for view in layers.iter().filter(|v| v.contributes()) {
            contributing += 1;
            if self.layer_dirty(stack, view.id(), tile) {
                dirty += 1;
            }
        }
        if contributing == 0 {
            1.0
        } else {
            1.0 - dirty as f64 / contributing as f64
        }
    }

    pub fn tile_dirty(&self, stack: &StackId, tile: usize) -> bool {
        self.state
            .tile_dirty
            .get(stack)
            .map_or(true, |bits| bits.is_dirty(&tile))
    }

    pub fn set_tile_dirty(&mut self, stack: &StackId, tile: usize, dirty: bool) {
        if let Some(bits) = self.state.tile_dirty.get_mut(stack) {
            bits.set_dirty(tile, dirty);
        }
    }

    /// Mark every tile of `stack` dirty.
    pub fn set_all_tiles_dirty(&mut self, stack: &StackId) {
        if let Some(bits) = self.state.tile_dirty.get_mut(stack) {
            bits.mark_all_dirty();
        }
    }

    /// Mark every tile of every stack dirty.
    pub fn set_all_tiles_dirty_all_stacks(&mut self) {
        for bits in self.state.tile_dirty.values_mut() {
            bits.mark_all_dirty();
        }
    }

    /// Mark `tile` dirty in every stack.
    pub fn set_tile_dirty_all_stacks(&mut self, tile: usize) {
        for bits in self.state.tile_dirty.values_mut() {
            bits.set_dirty(tile, true);
        }
    }

    pub fn layer(&self, stack: &StackId, layer: LayerId, tile: usize) -> Option<&Fragment> {
        self.state.layers.get(stack)?.get(&(layer, tile))
    }

    pub fn layer_mut(
        &mut self,
        stack: &StackId,
        layer: LayerId,
        tile: usize,
    ) -> Option<&mut Fragment> {
        self.state.layers.get_mut(stack)?.get_mut(&(layer, tile))
    }

    pub fn layer_dirty(&self, stack: &StackId, layer: LayerId, tile: usize) -> bool {
        self.state
            .layer_dirty
            .get(stack)
            .map_or(true, |bits| bits.is_dirty(&(layer, tile)))
    }

    pub fn set_layer_dirty(&mut self, stack: &StackId, layer: LayerId, tile: usize, dirty: bool) {
        if let Some(bits) = self.state.layer_dirty.get_mut(stack) {
            bits.set_dirty((layer, tile), dirty);
        }
    }

    /// Mark every tile of `layer` dirty in every stack.
    pub fn set_layer_dirty_all(&mut self, layer: LayerId) {
        for bits in self.state.layer_dirty.values_mut() {
            bits.mark_dirty_where(|(l, _)| *l == layer);
        }
    }

    /// Mark one tile of `layer` dirty in every stack.
    pub fn set_layer_tile_dirty_all_stacks(&mut self, layer: LayerId, tile: usize) {
        for bits in self.state.layer_dirty.values_mut() {
            bits.set_dirty((layer, tile), true);
        }
    }

    /// Newest timestamp accepted for (stack, layer, tile): that of the
    /// cached fragment or of a later dirty mark (0 if neither).
    pub fn layer_timestamp(&self, stack: &StackId, layer: LayerId, tile: usize) -> u64 {
        let stored = self
            .state
            .layer_timestamp
            .get(stack)
            .and_then(|ts| ts.get(&(layer, tile)).copied())
            .unwrap_or(0);
        let layer_floor = self.state.layer_floor.get(&layer).copied().unwrap_or(0);
        let tile_floor = self.state.tile_floor.get(&(layer, tile)).copied().unwrap_or(0);
        stored.max(layer_floor).max(tile_floor)
    }

    /// Reject completions of `layer` requested at or before `timestamp`,
    /// in every stack and tile.
    pub fn raise_layer_floor(&mut self, layer: LayerId, timestamp: u64) {
        let floor = self.state.layer_floor.entry(layer).or_insert(0);
        *floor = (*floor).max(timestamp);
    }

    /// Like [`raise_layer_floor`](Self::raise_layer_floor) for one tile.
    pub fn raise_layer_tile_floor(&mut self, layer: LayerId, tile: usize, timestamp: u64) {
        let floor = self.state.tile_floor.entry((layer, tile)).or_insert(0);
        *floor = (*floor).max(timestamp);
    }

    /// Store `fragment` and mark the layer clean, but only when `timestamp`
    /// is strictly newer than [`layer_timestamp`](Self::layer_timestamp).
    /// Returns whether it was stored.
    pub fn update_tile_if_necessary(
        &mut self,
        stack: &StackId,
        layer: LayerId,
        tile: usize,
        timestamp: u64,
        fragment: Fragment,
    ) -> bool {
        if !self.contains_stack(stack) || timestamp <= self.layer_timestamp(stack, layer, tile) {
            return false;
        }
        let key = (layer, tile);
        if let Some(layers) = self.state.layers.get_mut(stack) {
            layers.insert(key, fragment);
        }
        if let Some(bits) = self.state.layer_dirty.get_mut(stack) {
            bits.set_dirty(key, false);
        }
        if let Some(ts) = self.state.layer_timestamp.get_mut(stack) {
            ts.insert(key, timestamp);
        }
        true
    }

    /// Overlay fragments of `tile`, in stacking order of `layers`.
    ///
    /// These are not part of the raster composite.
    pub fn overlay_layers(
        &self,
        stack: &StackId,
        tile: usize,
        layers: &[LayerView],
    ) -> Vec<(LayerId, OverlayItem)> {
        layers
            .iter()
            .filter_map(|view| match self.layer(stack, view.id(), tile) {
                Some(Fragment::Overlay(item)) => Some((view.id(), item.clone())),
                _ => None,
            })
            .collect()
    }
}

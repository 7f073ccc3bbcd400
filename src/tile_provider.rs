//! Tile provider: decides which tiles need work, fetches layer fragments
//! through the scheduler and composites them into per-tile images.
//!
//! There is no explicit state machine; a tile's lifecycle lives in the
//! dirty bits of the [`TilesCache`]. A query re-blends dirty tiles from
//! whatever fragments are cached (a preview), then fetches every
//! contributing layer that is still dirty. Completed fetches re-blend the
//! tile and notify listeners. Fragments are copied out under the cache
//! lock and painted after it is released.
//!
//! Lock order: layer stack, tiling, current cache slot, cache
//! transaction, in-flight set. Sources, the scheduler and listeners are
//! only ever called with no provider lock held.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use kurbo::{Affine, Rect};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::{tile_timing_enabled, ProviderConfig};
use crate::error::{TileError, TileResult};
use crate::image::{Canvas, Fragment, Image, OverlayItem};
use crate::patch_accessor::Bounds;
use crate::scheduler::{CancelReason, Priority, TaskScheduler, TaskTag, ViewportId};
use crate::source::{ImageSource, LayerId, LayerView, StackId, StackedImageSources};
use crate::tiles_cache::{BlendInputs, TilesCache, TilesCacheGuard};
use crate::tiling::{TileGeometry, Tiling};

/// Polling interval of [`TileProvider::wait_for_tiles`].
const WAIT_POLL: Duration = Duration::from_millis(5);

/// Current state of one tile as seen by the presentation layer.
#[derive(Debug, Clone)]
pub struct TileView {
    pub id: usize,
    /// Raster composite, `None` until a raster layer has been painted.
    pub image: Option<Image>,
    /// Vector overlays to draw above `image`.
    pub overlays: Vec<(LayerId, OverlayItem)>,
    /// Scene rectangle to draw the image into.
    pub rect: Rect,
    /// Fraction of contributing layers that are up to date.
    pub progress: f64,
}

type Listener = Arc<dyn Fn(Rect) + Send + Sync>;
type FetchKey = (StackId, LayerId, usize);

struct ProviderInner {
    sims: RwLock<StackedImageSources>,
    tiling: RwLock<Tiling>,
    /// Replaced wholesale on size changes; tasks compare against it by identity.
    cache: RwLock<Arc<TilesCache>>,
    scheduler: TaskScheduler,
    viewport: ViewportId,
    prefetch_viewport: ViewportId,
    current_stack: RwLock<StackId>,
    timestamp: AtomicU64,
    /// Outstanding fetches, keyed to the timestamp of the request.
    in_flight: Mutex<HashMap<FetchKey, u64>>,
    listeners: RwLock<Vec<Listener>>,
    tile_timing: bool,
}

/// Removes an in-flight record when the fetch ends, however it ends.
struct InFlightTicket {
    owner: Weak<ProviderInner>,
    key: FetchKey,
    timestamp: u64,
}

impl Drop for InFlightTicket {
    fn drop(&mut self) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        let mut in_flight = owner.in_flight.lock();
        // a newer fetch may have taken the slot after an invalidation
        if in_flight.get(&self.key) == Some(&self.timestamp) {
            in_flight.remove(&self.key);
        }
    }
}

/// Raster fragments of one tile, bottom first, lifted out of the cache so
/// that painting runs with no lock held.
struct BlendPlan {
    inputs: BlendInputs,
    rasters: Vec<(Image, f64)>,
}

impl BlendPlan {
    fn paint(&self) -> Option<Image> {
        let (width, height) = self.inputs.image_size;
        let mut canvas: Option<Canvas> = None;
        for (image, opacity) in &self.rasters {
            canvas
                .get_or_insert_with(|| Canvas::new(width, height))
                .paint(image, *opacity);
        }
        canvas.map(Canvas::into_image)
    }
}

/// Decide whether `tile` needs compositing from the cached fragments.
///
/// When the stored composite was built from the same inputs only its
/// progress is recomputed and `None` is returned. Otherwise overlay
/// fragments get their display metadata synced with the owning layer and
/// the rasters to paint are returned.
fn plan_blend(
    guard: &mut TilesCacheGuard<'_>,
    stack: &StackId,
    tile: usize,
    geometry: &TileGeometry,
    layers: &[LayerView],
) -> Option<BlendPlan> {
    let inputs = guard.blend_inputs(stack, tile, layers, geometry.image_size);
    if guard.tile_inputs(stack, tile) == Some(&inputs) {
        if guard.refresh_progress(stack, tile, layers) >= 1.0 {
            guard.set_tile_dirty(stack, tile, false);
        }
        return None;
    }

    let mut rasters = Vec::new();
    for view in layers.iter().rev() {
        match guard.layer_mut(stack, view.id(), tile) {
            Some(Fragment::Overlay(item)) => {
                item.opacity = view.layer.opacity;
                item.visible = view.visible;
                item.z_value = view.z_value;
            }
            Some(Fragment::Raster(image)) if view.visible => {
                rasters.push((image.clone(), view.layer.opacity));
            }
            _ => {}
        }
    }
    Some(BlendPlan { inputs, rasters })
}

impl ProviderInner {
    fn current_cache(&self) -> Arc<TilesCache> {
        self.cache.read().clone()
    }

    fn current_stack(&self) -> StackId {
        self.current_stack.read().clone()
    }

    fn next_timestamp(&self) -> u64 {
        self.timestamp.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, rect: Rect) {
        let listeners: Vec<Listener> = self.listeners.read().clone();
        for listener in listeners {
            listener(rect);
        }
    }

    fn emit_all(&self) {
        let rect = self.tiling.read().scene_rect();
        self.emit(rect);
    }

    fn refresh(
        self: &Arc<Self>,
        rect: Rect,
        stack: &StackId,
        prefetch: bool,
        filter: Option<&[LayerId]>,
    ) {
        let layers = self.sims.read().view();
        let tiles: Vec<(usize, TileGeometry)> = {
            let tiling = self.tiling.read();
            tiling
                .intersected(rect)
                .into_iter()
                .filter_map(|id| tiling.geometry(id).map(|g| (id, *g)))
                .collect()
        };
        let cache = self.current_cache();
        if !prefetch && *stack == self.current_stack() {
            let mut guard = cache.lock();
            if !guard.contains_stack(stack) {
                warn!(?stack, "current stack missing from cache, re-adding");
                if let Err(e) = guard.add_stack(stack.clone()) {
                    warn!(?stack, error = %e, "failed to re-add current stack");
                }
            }
        }

        for (tile, geometry) in &tiles {
            self.refresh_tile(&cache, stack, *tile, geometry, &layers, prefetch, filter);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn refresh_tile(
        self: &Arc<Self>,
        cache: &Arc<TilesCache>,
        stack: &StackId,
        tile: usize,
        geometry: &TileGeometry,
        layers: &[LayerView],
        prefetch: bool,
        filter: Option<&[LayerId]>,
    ) {
        let (plan, to_fetch) = {
            let mut guard = cache.lock();
            if !guard.contains_stack(stack) || !guard.tile_dirty(stack, tile) {
                return;
            }
            let plan = plan_blend(&mut guard, stack, tile, geometry, layers);
            // reserved under the cache lock: a fetch stores its fragment
            // before releasing its slot, so a dirty layer without a slot
            // has nothing outstanding
            let mut in_flight = self.in_flight.lock();
            let to_fetch: Vec<(&LayerView, InFlightTicket)> = layers
                .iter()
                .filter(|view| view.contributes())
                .filter(|view| filter.map_or(true, |ids| ids.contains(&view.id())))
                .filter(|view| guard.layer_dirty(stack, view.id(), tile))
                .filter_map(|view| {
                    let key: FetchKey = (stack.clone(), view.id(), tile);
                    if in_flight.contains_key(&key) {
                        return None;
                    }
                    let timestamp = self.next_timestamp();
                    in_flight.insert(key.clone(), timestamp);
                    let ticket = InFlightTicket {
                        owner: Arc::downgrade(self),
                        key,
                        timestamp,
                    };
                    Some((view, ticket))
                })
                .collect();
            (plan, to_fetch)
        };

        if let Some(plan) = plan {
            self.commit_blend(cache, stack, tile, plan);
        }
        for (view, ticket) in to_fetch {
            self.fetch_layer(cache, stack, geometry, view, ticket, prefetch);
        }
    }

    fn fetch_layer(
        self: &Arc<Self>,
        cache: &Arc<TilesCache>,
        stack: &StackId,
        geometry: &TileGeometry,
        view: &LayerView,
        ticket: InFlightTicket,
        prefetch: bool,
    ) {
        let layer = view.id();
        let tile = ticket.key.2;
        let timestamp = ticket.timestamp;

        let source: &Arc<dyn ImageSource> = &view.layer.source;
        let request = match source.request(geometry.data_rect, &stack.through) {
            Ok(request) => request,
            Err(TileError::IndeterminateSource(reason)) => {
                debug!(%layer, tile, %reason, "source indeterminate, tile stays dirty");
                return;
            }
            Err(e) => {
                warn!(%layer, tile, error = %e, "failed to create fetch request");
                return;
            }
        };

        let expected = source.image_type();
        if source.is_direct() {
            let fetched = request
                .wait()
                .and_then(|fragment| fragment.validate(expected).map(|()| fragment));
            match fetched {
                Ok(fragment) => self.on_layer_fetched(cache, stack, layer, tile, timestamp, fragment),
                Err(e) => warn!(%layer, tile, error = %e, "direct fetch failed"),
            }
            drop(ticket);
            return;
        }

        let owner = Arc::downgrade(self);
        let captured = Arc::clone(cache);
        let job_stack = stack.clone();
        let timing = self.tile_timing;
        let job = move || {
            let _ticket = ticket;
            let t0 = timing.then(Instant::now);
            let fragment = request.wait()?;
            fragment.validate(expected)?;
            if let Some(t0) = t0 {
                debug!(
                    %layer,
                    tile,
                    elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0,
                    "layer fetch"
                );
            }
            if let Some(inner) = owner.upgrade() {
                inner.on_layer_fetched(&captured, &job_stack, layer, tile, timestamp, fragment);
            }
            Ok(())
        };

        let cancel_cache = Arc::downgrade(cache);
        let cancel_stack = stack.clone();
        let on_cancel = move |reason: CancelReason| {
            if !reason.marks_dirty() {
                return;
            }
            if let Some(cache) = cancel_cache.upgrade() {
                cache.lock().set_tile_dirty(&cancel_stack, tile, true);
            }
        };

        let viewport = if prefetch {
            self.prefetch_viewport
        } else {
            self.viewport
        };
        let tag = TaskTag {
            viewport,
            stack_id: stack.clone(),
            tile,
            layer,
        };
        self.scheduler
            .submit(job, Priority::new(prefetch, timestamp), tag, on_cancel);
    }

    /// Store a completed fetch and re-blend its tile.
    fn on_layer_fetched(
        &self,
        captured: &Arc<TilesCache>,
        stack: &StackId,
        layer: LayerId,
        tile: usize,
        timestamp: u64,
        fragment: Fragment,
    ) {
        if !Arc::ptr_eq(captured, &self.current_cache()) {
            // cache was replaced while the fetch ran
            return;
        }
        let layers = self.sims.read().view();
        let Some(geometry) = self.tiling.read().geometry(tile).copied() else {
            return;
        };
        let is_current = *self.current_stack.read() == *stack;

        let plan = {
            let mut guard = captured.lock();
            if !guard.update_tile_if_necessary(stack, layer, tile, timestamp, fragment) {
                return;
            }
            plan_blend(&mut guard, stack, tile, &geometry, &layers)
        };
        if let Some(plan) = plan {
            if !self.commit_blend(captured, stack, tile, plan) {
                // whoever changed the inputs re-blends and notifies
                return;
            }
        }

        if is_current {
            self.emit(geometry.scene_rect);
        }
    }

    /// Paint `plan` and store the result, unless the tile's inputs changed
    /// meanwhile. Returns whether the composite was stored.
    fn commit_blend(
        &self,
        cache: &TilesCache,
        stack: &StackId,
        tile: usize,
        plan: BlendPlan,
    ) -> bool {
        let image = plan.paint();
        let layers = self.sims.read().view();
        let Some(image_size) = self.tiling.read().geometry(tile).map(|g| g.image_size) else {
            return false;
        };
        let mut guard = cache.lock();
        if !guard.contains_stack(stack)
            || guard.blend_inputs(stack, tile, &layers, image_size) != plan.inputs
        {
            debug!(tile, "blend inputs changed while painting, composite dropped");
            return false;
        }
        if guard.set_tile(stack, tile, image, plan.inputs, &layers) >= 1.0 {
            guard.set_tile_dirty(stack, tile, false);
        }
        true
    }

    fn collect_tiles(&self, ids: &[usize], stack: &StackId) -> Vec<TileView> {
        let layers = self.sims.read().view();
        let geometry: Vec<Option<TileGeometry>> = {
            let tiling = self.tiling.read();
            ids.iter().map(|&id| tiling.geometry(id).copied()).collect()
        };
        let cache = self.current_cache();
        let guard = cache.lock();

        let tiles = ids
            .iter()
            .zip(geometry)
            .filter_map(|(&id, geometry)| {
                let geometry = geometry?;
                let (image, progress) = match guard.tile(stack, id) {
                    Some(entry) => (entry.image.clone(), entry.progress),
                    None => (None, 0.0),
                };
                Some(TileView {
                    id,
                    image,
                    overlays: guard.overlay_layers(stack, id, &layers),
                    rect: geometry.draw_rect,
                    progress,
                })
            })
            .collect();
        tiles
    }

    fn on_layer_dirty(&self, layer: LayerId, rect: Option<Bounds>) {
        let shown = {
            let sims = self.sims.read();
            sims.is_visible(layer) && !sims.is_occluded(layer)
        };
        let (tiles, changed) = {
            let tiling = self.tiling.read();
            let extent = tiling.accessor().extent();
            match rect {
                Some(b) if b.is_empty() => return,
                Some(b) if !b.contains(&extent) => (
                    Some(tiling.intersected_data(&b)),
                    tiling.data2scene().transform_rect_bbox(b.to_rect()),
                ),
                _ => (None, tiling.scene_rect()),
            }
        };

        let cache = self.current_cache();
        {
            let mut guard = cache.lock();
            // fetches requested before this point carry older data
            let floor = self.next_timestamp();
            match &tiles {
                None => {
                    guard.set_layer_dirty_all(layer);
                    guard.raise_layer_floor(layer, floor);
                    guard.set_all_tiles_dirty_all_stacks();
                }
                Some(tiles) => {
                    for &tile in tiles {
                        guard.set_layer_tile_dirty_all_stacks(layer, tile);
                        guard.raise_layer_tile_floor(layer, tile, floor);
                        guard.set_tile_dirty_all_stacks(tile);
                    }
                }
            }
        }
        self.in_flight.lock().retain(|(_, l, tile), _| {
            *l != layer || tiles.as_ref().is_some_and(|t| !t.contains(tile))
        });

        if shown {
            self.emit(changed);
        }
    }

    /// Compositing inputs changed for every tile; fragments stay valid.
    fn invalidate_composites(&self) {
        self.current_cache().lock().set_all_tiles_dirty_all_stacks();
        self.emit_all();
    }

    fn on_size_changed(&self) -> TileResult<()> {
        let cache_size = self.current_cache().cache_size();
        let fresh = TilesCache::new(cache_size)?;
        fresh.lock().add_stack(self.current_stack())?;
        *self.cache.write() = Arc::new(fresh);
        self.in_flight.lock().clear();
        debug!(cache_size, "tile cache replaced");
        self.emit_all();
        Ok(())
    }

    fn on_stack_id_changed(&self, stack: StackId) -> TileResult<()> {
        {
            let cache = self.current_cache();
            let mut guard = cache.lock();
            if guard.contains_stack(&stack) {
                guard.touch_stack(&stack);
            } else {
                guard.add_stack(stack.clone())?;
            }
        }
        debug!(?stack, "current stack changed");
        *self.current_stack.write() = stack;
        self.emit_all();
        Ok(())
    }
}

/// Tile rendering front end for one view of a layered image volume.
#[derive(Clone)]
pub struct TileProvider {
    inner: Arc<ProviderInner>,
}

impl TileProvider {
    /// Build a provider over `sims`, showing `stack_id`.
    ///
    /// `scheduler` is shared with other providers of the application; this
    /// provider registers its own viewports on it.
    pub fn new(
        config: &ProviderConfig,
        slice_shape: (usize, usize),
        data2scene: Affine,
        sims: StackedImageSources,
        stack_id: StackId,
        scheduler: TaskScheduler,
    ) -> TileResult<Self> {
        config.validate()?;
        let tiling = Tiling::new(
            slice_shape,
            data2scene,
            config.tile_width,
            config.overlap,
            config.overlap_draw,
            "tiles",
        )?;
        let cache = TilesCache::new(config.cache_size)?;
        cache.lock().add_stack(stack_id.clone())?;

        let viewport = scheduler.register_viewport();
        let prefetch_viewport = scheduler.register_viewport();

        Ok(Self {
            inner: Arc::new(ProviderInner {
                sims: RwLock::new(sims),
                tiling: RwLock::new(tiling),
                cache: RwLock::new(Arc::new(cache)),
                scheduler,
                viewport,
                prefetch_viewport,
                current_stack: RwLock::new(stack_id),
                timestamp: AtomicU64::new(1),
                in_flight: Mutex::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                tile_timing: tile_timing_enabled(),
            }),
        })
    }

    /// Tiles intersecting `display_rect`, in their current state.
    ///
    /// Queued fetches of this view that fall outside `viewport_rect` are
    /// dropped, dirty tiles are refreshed, and the cached state is returned
    /// without waiting. Call again to observe progress.
    pub fn get_tiles(&self, display_rect: Rect, viewport_rect: Rect) -> Vec<TileView> {
        let (ids, visible) = {
            let tiling = self.inner.tiling.read();
            let visible: HashSet<usize> = tiling.intersected(viewport_rect).into_iter().collect();
            (tiling.intersected(display_rect), visible)
        };
        let stack = self.inner.current_stack();

        self.inner
            .scheduler
            .clear_vp_res(self.inner.viewport, &stack, &visible);
        self.inner.refresh(display_rect, &stack, false, None);
        self.inner.collect_tiles(&ids, &stack)
    }

    /// Refresh tiles intersecting `rect` without reading them back.
    ///
    /// `stack` defaults to the current stack and `layers` to every layer.
    pub fn request_refresh(
        &self,
        rect: Rect,
        stack: Option<StackId>,
        prefetch: bool,
        layers: Option<&[LayerId]>,
    ) {
        let stack = stack.unwrap_or_else(|| self.inner.current_stack());
        self.inner.refresh(rect, &stack, prefetch, layers);
    }

    /// Render the sibling stack at `through` in the background.
    ///
    /// The current stack stays most recently used in the cache.
    pub fn prefetch(&self, rect: Rect, through: Vec<i64>) -> TileResult<()> {
        let current = self.inner.current_stack();
        let stack = current.with_through(through);
        {
            let cache = self.inner.current_cache();
            let room_for_sibling = cache.cache_size() >= 2;
            let mut guard = cache.lock();
            if !guard.contains_stack(&current) {
                guard.add_stack(current.clone())?;
            }
            if !guard.contains_stack(&stack) {
                if !room_for_sibling {
                    debug!(?stack, "no room for a sibling stack, prefetch skipped");
                    return Ok(());
                }
                guard.touch_stack(&current);
                guard.add_stack(stack.clone())?;
            }
            guard.touch_stack(&current);
        }
        debug!(?stack, "prefetching stack");
        self.inner.refresh(rect, &stack, true, None);
        Ok(())
    }

    /// Block until every tile in `rect` is complete, or `timeout` passes.
    ///
    /// Returns whether all tiles completed. Meant for tests and batch use;
    /// interactive callers poll [`get_tiles`](Self::get_tiles) instead.
    pub fn wait_for_tiles(&self, rect: Rect, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let tiles = self.get_tiles(rect, rect);
            if tiles.iter().all(|t| t.progress >= 1.0) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    /// Force `tile` of the current stack to be re-blended on next query.
    pub fn set_tile_dirty(&self, tile: usize) {
        let stack = self.inner.current_stack();
        let cache = self.inner.current_cache();
        let mut guard = cache.lock();
        guard.forget_blend(&stack, tile);
        guard.set_tile_dirty(&stack, tile, true);
    }

    /// Register a listener for changed scene rectangles.
    pub fn subscribe(&self, listener: impl Fn(Rect) + Send + Sync + 'static) {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    // -- reactive handlers --

    /// Data of `layer` changed inside `rect` (`None` for everything).
    pub fn on_layer_dirty(&self, layer: LayerId, rect: Option<Bounds>) {
        self.inner.on_layer_dirty(layer, rect);
    }

    pub fn on_visibility_changed(&self) {
        self.inner.invalidate_composites();
    }

    pub fn on_opacity_changed(&self) {
        self.inner.invalidate_composites();
    }

    pub fn on_order_changed(&self) {
        self.inner.invalidate_composites();
    }

    /// Discard the whole cache. Fetches still running finish as no-ops.
    pub fn on_size_changed(&self) -> TileResult<()> {
        self.inner.on_size_changed()
    }

    // -- layer stack --

    pub fn add_layer(
        &self,
        index: usize,
        name: impl Into<String>,
        source: Arc<dyn ImageSource>,
        opacity: f64,
        visible: bool,
    ) -> TileResult<LayerId> {
        let id = self
            .inner
            .sims
            .write()
            .add_layer(index, name, source, opacity, visible);
        self.inner.on_size_changed()?;
        Ok(id)
    }

    pub fn remove_layer(&self, id: LayerId) -> TileResult<()> {
        self.inner.sims.write().remove_layer(id)?;
        self.inner.on_size_changed()
    }

    pub fn set_layer_visible(&self, id: LayerId, visible: bool) -> TileResult<()> {
        if self.inner.sims.write().set_visible(id, visible)? {
            self.on_visibility_changed();
        }
        Ok(())
    }

    pub fn set_layer_opacity(&self, id: LayerId, opacity: f64) -> TileResult<()> {
        if self.inner.sims.write().set_opacity(id, opacity)? {
            self.on_opacity_changed();
        }
        Ok(())
    }

    pub fn move_layer(&self, id: LayerId, index: usize) -> TileResult<()> {
        if self.inner.sims.write().move_layer(id, index)? {
            self.on_order_changed();
        }
        Ok(())
    }

    /// Compositing snapshot of the layer stack, top to bottom.
    pub fn layers(&self) -> Vec<LayerView> {
        self.inner.sims.read().view()
    }

    // -- stack and geometry --

    /// Switch to another plane. Data cached for the old one is kept.
    pub fn set_stack_id(&self, stack: StackId) -> TileResult<()> {
        if stack == self.inner.current_stack() {
            return Ok(());
        }
        self.inner.on_stack_id_changed(stack)
    }

    pub fn current_stack(&self) -> StackId {
        self.inner.current_stack()
    }

    /// Replace the slice dimensions, rebuilding the grid and the cache.
    pub fn set_slice_shape(&self, slice_shape: (usize, usize)) -> TileResult<()> {
        {
            let mut tiling = self.inner.tiling.write();
            let rebuilt = Tiling::new(
                slice_shape,
                tiling.data2scene(),
                tiling.tile_width(),
                tiling.overlap(),
                tiling.overlap_draw(),
                tiling.name().to_string(),
            )?;
            *tiling = rebuilt;
        }
        self.inner.on_size_changed()
    }

    /// Change the data-to-scene transform (zoom, pan, rotation).
    ///
    /// Tiles are re-blended at the new resolution from cached fragments;
    /// nothing is fetched again.
    pub fn set_data2scene(&self, data2scene: Affine) -> TileResult<()> {
        self.inner.tiling.write().set_data2scene(data2scene)?;
        self.inner.invalidate_composites();
        Ok(())
    }

    pub fn scene_rect(&self) -> Rect {
        self.inner.tiling.read().scene_rect()
    }

    pub fn tile_count(&self) -> usize {
        self.inner.tiling.read().len()
    }

    pub fn tile_geometry(&self, id: usize) -> Option<TileGeometry> {
        self.inner.tiling.read().geometry(id).copied()
    }

    // -- cache --

    pub fn cache_size(&self) -> usize {
        self.inner.current_cache().cache_size()
    }

    pub fn set_cache_size(&self, cache_size: usize) -> TileResult<()> {
        self.inner.current_cache().set_cache_size(cache_size)
    }

    /// Cached stacks, least recently used first.
    pub fn cached_stacks(&self) -> Vec<StackId> {
        self.inner.current_cache().lock().stacks()
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.inner.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        FailingSource, GatedSource, IndeterminateSource, MalformedSource, OverlaySource, RectLog,
        SolidSource,
    };

    const WAIT: Duration = Duration::from_secs(5);
    const RED: [u8; 4] = [200, 0, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 180, 255];

    fn config(n: i64) -> ProviderConfig {
        ProviderConfig {
            tile_width: 32,
            cache_size: 4,
            n_concurrent_tasks: n,
            ..Default::default()
        }
    }

    /// 64x64 slice in 32px tiles: four tiles, identity transform.
    fn provider(sims: StackedImageSources, n: i64) -> TileProvider {
        TileProvider::new(
            &config(n),
            (64, 64),
            Affine::IDENTITY,
            sims,
            StackId::new(0, vec![0]),
            TaskScheduler::new(n).unwrap(),
        )
        .unwrap()
    }

    fn all() -> Rect {
        Rect::ZERO
    }

    fn wait_idle(provider: &TileProvider) -> bool {
        let deadline = Instant::now() + WAIT;
        let scheduler = provider.scheduler();
        while scheduler.active_count() + scheduler.queued_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    #[test]
    fn test_single_layer_end_to_end() {
        let src = SolidSource::opaque(RED);
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "raw", src.clone(), 1.0, true);
        let provider = provider(sims, 2);

        let first = provider.get_tiles(all(), all());
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|t| (0.0..=1.0).contains(&t.progress)));

        assert!(provider.wait_for_tiles(all(), WAIT));
        let tiles = provider.get_tiles(all(), all());
        for tile in &tiles {
            assert_eq!(tile.progress, 1.0);
            assert_eq!(tile.image, Some(Image::filled(32, 32, RED)));
            assert!(tile.overlays.is_empty());
        }
        assert_eq!(src.requests(), 4);
        assert_eq!(provider.scheduler().failure_count(), 0);
    }

    #[test]
    fn test_direct_layer_completes_inline() {
        let src = SolidSource::direct(BLUE);
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "labels", src.clone(), 1.0, true);
        let provider = provider(sims, 1);

        let tiles = provider.get_tiles(all(), all());
        assert!(tiles.iter().all(|t| t.progress == 1.0));
        assert_eq!(tiles[0].image, Some(Image::filled(32, 32, BLUE)));
        assert_eq!(provider.scheduler().queued_count(), 0);
        assert_eq!(provider.scheduler().active_count(), 0);
        assert_eq!(src.requests(), 4);
    }

    #[test]
    fn test_indeterminate_source_is_retried() {
        let src = IndeterminateSource::new(RED);
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "pending", src.clone(), 1.0, true);
        let provider = provider(sims, 2);

        let tiles = provider.get_tiles(all(), all());
        assert!(tiles.iter().all(|t| t.progress == 0.0 && t.image.is_none()));
        assert_eq!(provider.scheduler().queued_count(), 0);

        src.set_ready();
        assert!(provider.wait_for_tiles(all(), WAIT));
        assert_eq!(provider.scheduler().failure_count(), 0);
    }

    #[test]
    fn test_failing_source_leaves_tiles_incomplete() {
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "broken", Arc::new(FailingSource), 1.0, true);
        let provider = provider(sims, 2);

        provider.get_tiles(all(), all());
        assert!(wait_idle(&provider));
        assert_eq!(provider.scheduler().failure_count(), 4);

        let tiles = provider.get_tiles(all(), all());
        assert!(tiles.iter().all(|t| t.progress == 0.0 && t.image.is_none()));
        assert!(wait_idle(&provider));
    }

    #[test]
    fn test_two_layer_composite() {
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "bottom", SolidSource::opaque([0, 0, 0, 255]), 1.0, true);
        sims.add_layer(0, "top", SolidSource::opaque([200, 100, 50, 255]), 0.5, true);
        let provider = provider(sims, 2);

        assert!(provider.wait_for_tiles(all(), WAIT));
        let tiles = provider.get_tiles(all(), all());
        let image = tiles[0].image.as_ref().unwrap();
        assert_eq!(image.pixel(0, 0), [100, 50, 25, 255]);
        assert_eq!(image.pixel(31, 31), [100, 50, 25, 255]);
    }

    #[test]
    fn test_occluded_layer_not_fetched() {
        let bottom = SolidSource::opaque(BLUE);
        let top = SolidSource::opaque(RED);
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "bottom", bottom.clone(), 1.0, true);
        sims.add_layer(0, "top", top.clone(), 1.0, true);
        let provider = provider(sims, 2);

        assert!(provider.wait_for_tiles(all(), WAIT));
        assert_eq!(top.requests(), 4);
        assert_eq!(bottom.requests(), 0);
        assert_eq!(
            provider.get_tiles(all(), all())[0].image,
            Some(Image::filled(32, 32, RED))
        );
    }

    #[test]
    fn test_layer_dirty_refetches_region() {
        let src = SolidSource::opaque(RED);
        let mut sims = StackedImageSources::new();
        let layer = sims.add_layer(0, "raw", src.clone(), 1.0, true);
        let provider = provider(sims, 2);
        assert!(provider.wait_for_tiles(all(), WAIT));
        assert_eq!(src.requests(), 4);

        src.set_color(BLUE);
        provider.on_layer_dirty(layer, Some(Bounds::new(0, 10, 0, 10)));
        assert!(provider.wait_for_tiles(all(), WAIT));
        assert_eq!(src.requests(), 5);
        let tiles = provider.get_tiles(all(), all());
        assert_eq!(tiles[0].image, Some(Image::filled(32, 32, BLUE)));
        assert_eq!(tiles[1].image, Some(Image::filled(32, 32, RED)));

        provider.on_layer_dirty(layer, None);
        assert!(provider.wait_for_tiles(all(), WAIT));
        assert_eq!(src.requests(), 9);

        // empty region: nothing to do
        provider.on_layer_dirty(layer, Some(Bounds::new(5, 5, 0, 10)));
        assert!(provider.wait_for_tiles(all(), WAIT));
        assert_eq!(src.requests(), 9);
    }

    #[test]
    fn test_opacity_change_reblends_without_fetch() {
        let src = SolidSource::opaque(RED);
        let mut sims = StackedImageSources::new();
        let layer = sims.add_layer(0, "raw", src.clone(), 1.0, true);
        let provider = provider(sims, 2);
        assert!(provider.wait_for_tiles(all(), WAIT));

        provider.set_layer_opacity(layer, 0.5).unwrap();
        let tiles = provider.get_tiles(all(), all());
        assert!(tiles.iter().all(|t| t.progress == 1.0));
        assert_eq!(tiles[0].image.as_ref().unwrap().pixel(0, 0), [200, 0, 0, 128]);
        assert_eq!(src.requests(), 4);
    }

    #[test]
    fn test_hidden_layer_drops_out_of_composite() {
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "bottom", SolidSource::opaque(BLUE), 1.0, true);
        let top = sims.add_layer(0, "top", SolidSource::opaque(RED), 1.0, true);
        let provider = provider(sims, 2);
        assert!(provider.wait_for_tiles(all(), WAIT));

        provider.set_layer_visible(top, false).unwrap();
        assert!(provider.wait_for_tiles(all(), WAIT));
        assert_eq!(
            provider.get_tiles(all(), all())[0].image,
            Some(Image::filled(32, 32, BLUE))
        );
    }

    #[test]
    fn test_size_change_discards_running_fetches() {
        let src = GatedSource::new(RED);
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "slow", src.clone(), 1.0, true);
        let provider = provider(sims, 4);

        provider.get_tiles(all(), all());
        assert_eq!(src.requests(), 4);
        provider.on_size_changed().unwrap();
        provider.get_tiles(all(), all());
        assert_eq!(src.requests(), 8);

        src.gate.open();
        assert!(provider.wait_for_tiles(all(), WAIT));
        assert!(wait_idle(&provider));
        assert_eq!(src.requests(), 8);
    }

    #[test]
    fn test_out_of_view_tasks_cancelled() {
        let src = GatedSource::new(RED);
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "slow", src.clone(), 1.0, true);
        let provider = provider(sims, 1);
        let viewport = Rect::new(0.0, 0.0, 16.0, 16.0);

        provider.get_tiles(all(), viewport);
        assert_eq!(provider.scheduler().active_count(), 1);
        assert_eq!(provider.scheduler().queued_count(), 3);

        // tile 0 runs; the other three are outside the viewport
        provider.get_tiles(viewport, viewport);
        assert_eq!(provider.scheduler().cleared_count(), 3);
        assert_eq!(provider.scheduler().queued_count(), 0);

        src.gate.open();
        assert!(provider.wait_for_tiles(all(), WAIT));
        assert!(wait_idle(&provider));
    }

    #[test]
    fn test_duplicate_fetch_not_submitted() {
        let src = GatedSource::new(RED);
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "slow", src.clone(), 1.0, true);
        let provider = provider(sims, 1);

        provider.get_tiles(all(), all());
        provider.get_tiles(all(), all());
        provider.request_refresh(all(), None, false, None);
        assert_eq!(src.requests(), 4);
        assert_eq!(provider.scheduler().cleared_count(), 0);

        src.gate.open();
        assert!(provider.wait_for_tiles(all(), WAIT));
        assert_eq!(src.requests(), 4);
    }

    #[test]
    fn test_stack_change_keeps_old_stack() {
        let src = SolidSource::opaque(RED);
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "raw", src.clone(), 1.0, true);
        let provider = provider(sims, 2);
        let first = provider.current_stack();
        assert!(provider.wait_for_tiles(all(), WAIT));

        let second = first.with_through(vec![1]);
        provider.set_stack_id(second.clone()).unwrap();
        assert!(provider.wait_for_tiles(all(), WAIT));
        assert_eq!(src.requests(), 8);
        assert_eq!(provider.cached_stacks(), vec![first.clone(), second]);

        provider.set_stack_id(first.clone()).unwrap();
        let tiles = provider.get_tiles(all(), all());
        assert!(tiles.iter().all(|t| t.progress == 1.0));
        assert_eq!(src.requests(), 8);
        assert_eq!(provider.cached_stacks().last(), Some(&first));
    }

    #[test]
    fn test_prefetch_renders_sibling_in_background() {
        let src = SolidSource::opaque(RED);
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "raw", src.clone(), 1.0, true);
        let provider = provider(sims, 2);
        let current = provider.current_stack();

        provider.prefetch(all(), vec![5]).unwrap();
        let sibling = current.with_through(vec![5]);
        assert_eq!(provider.cached_stacks(), vec![sibling.clone(), current.clone()]);
        assert_eq!(provider.current_stack(), current);
        assert!(wait_idle(&provider));
        assert_eq!(src.requests(), 4);
        assert!(src.throughs().iter().all(|t| t == &vec![5]));

        provider.set_stack_id(sibling).unwrap();
        let tiles = provider.get_tiles(all(), all());
        assert!(tiles.iter().all(|t| t.progress == 1.0));
        assert_eq!(src.requests(), 4);
    }

    #[test]
    fn test_zoom_reblends_at_new_resolution() {
        let src = SolidSource::opaque(RED);
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "raw", src.clone(), 1.0, true);
        let provider = provider(sims, 2);
        assert!(provider.wait_for_tiles(all(), WAIT));

        provider.set_data2scene(Affine::scale(2.0)).unwrap();
        assert_eq!(provider.tile_count(), 4);
        assert_eq!(provider.scene_rect(), Rect::new(0.0, 0.0, 128.0, 128.0));
        let tiles = provider.get_tiles(all(), all());
        assert!(tiles.iter().all(|t| t.progress == 1.0));
        assert_eq!(tiles[0].image, Some(Image::filled(64, 64, RED)));
        assert_eq!(src.requests(), 4);

        assert!(provider.set_data2scene(Affine::scale(0.0)).is_err());
    }

    #[test]
    fn test_overlay_fragments_reported() {
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "raw", SolidSource::direct(RED), 1.0, true);
        let overlay = sims.add_layer(0, "outline", Arc::new(OverlaySource), 0.7, true);
        let provider = provider(sims, 1);

        let tiles = provider.get_tiles(all(), all());
        assert!(tiles.iter().all(|t| t.progress == 1.0));
        let (id, item) = &tiles[0].overlays[0];
        assert_eq!(*id, overlay);
        assert_eq!(item.z_value, 2);
        assert_eq!(item.opacity, 0.7);
        assert!(item.visible);
        // overlays are not painted into the raster
        assert_eq!(tiles[0].image, Some(Image::filled(32, 32, RED)));
    }

    #[test]
    fn test_listeners_notified() {
        let mut sims = StackedImageSources::new();
        let layer = sims.add_layer(0, "raw", SolidSource::opaque(RED), 1.0, true);
        let provider = provider(sims, 2);
        let log = RectLog::default();
        provider.subscribe(log.listener());

        assert!(provider.wait_for_tiles(all(), WAIT));
        assert!(wait_idle(&provider));
        assert!(log.rects().contains(&Rect::new(0.0, 0.0, 32.0, 32.0)));
        assert!(log.rects().contains(&Rect::new(32.0, 32.0, 64.0, 64.0)));

        provider.set_layer_visible(layer, false).unwrap();
        assert_eq!(log.rects().last(), Some(&Rect::new(0.0, 0.0, 64.0, 64.0)));
    }

    #[test]
    fn test_layer_add_and_remove_rebuild_cache() {
        let provider = provider(StackedImageSources::new(), 2);
        let tiles = provider.get_tiles(all(), all());
        assert!(tiles.iter().all(|t| t.progress == 1.0 && t.image.is_none()));

        let src = SolidSource::opaque(RED);
        let id = provider.add_layer(0, "raw", src.clone(), 1.0, true).unwrap();
        assert!(provider.wait_for_tiles(all(), WAIT));
        assert_eq!(provider.layers().len(), 1);

        provider.remove_layer(id).unwrap();
        assert!(provider.layers().is_empty());
        assert!(provider.get_tiles(all(), all()).iter().all(|t| t.image.is_none()));
        assert!(matches!(provider.remove_layer(id), Err(TileError::UnknownLayer(_))));
    }

    #[test]
    fn test_slice_shape_change() {
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "raw", SolidSource::opaque(RED), 1.0, true);
        let provider = provider(sims, 2);
        assert!(provider.wait_for_tiles(all(), WAIT));

        provider.set_slice_shape((96, 64)).unwrap();
        assert_eq!(provider.tile_count(), 6);
        assert!(provider.wait_for_tiles(all(), WAIT));
    }

    #[test]
    fn test_cache_size_round_trip() {
        let provider = provider(StackedImageSources::new(), 1);
        assert_eq!(provider.cache_size(), 4);
        provider.prefetch(all(), vec![3]).unwrap();
        assert_eq!(provider.cached_stacks().len(), 2);

        provider.set_cache_size(1).unwrap();
        assert_eq!(provider.cache_size(), 1);
        assert_eq!(provider.cached_stacks(), vec![provider.current_stack()]);
        assert!(matches!(provider.set_cache_size(0), Err(TileError::Configuration(_))));
    }

    #[test]
    fn test_prefetch_never_evicts_current_stack() {
        let src = SolidSource::opaque(RED);
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "raw", src.clone(), 1.0, true);
        let config = ProviderConfig {
            cache_size: 1,
            ..config(2)
        };
        let provider = TileProvider::new(
            &config,
            (64, 64),
            Affine::IDENTITY,
            sims,
            StackId::new(0, vec![0]),
            TaskScheduler::new(2).unwrap(),
        )
        .unwrap();
        let current = provider.current_stack();

        provider.prefetch(all(), vec![5]).unwrap();
        assert_eq!(provider.cached_stacks(), vec![current.clone()]);
        assert_eq!(src.requests(), 0);
        assert!(provider.wait_for_tiles(all(), WAIT));
        assert_eq!(src.requests(), 4);

        // with room for one sibling, a second prefetch evicts the first
        provider.set_cache_size(2).unwrap();
        provider.prefetch(all(), vec![5]).unwrap();
        provider.prefetch(all(), vec![6]).unwrap();
        assert_eq!(
            provider.cached_stacks(),
            vec![current.with_through(vec![6]), current.clone()]
        );
        assert!(wait_idle(&provider));
        assert!(provider.get_tiles(all(), all()).iter().all(|t| t.progress == 1.0));
    }

    #[test]
    fn test_dirty_during_fetch_discards_stale_result() {
        let src = GatedSource::new(RED);
        let mut sims = StackedImageSources::new();
        let layer = sims.add_layer(0, "slow", src.clone(), 1.0, true);
        let provider = provider(sims, 4);

        provider.get_tiles(all(), all());
        assert_eq!(src.requests(), 4);
        src.set_color(BLUE);
        provider.on_layer_dirty(layer, None);
        src.gate.open();
        assert!(wait_idle(&provider));

        assert!(provider.wait_for_tiles(all(), WAIT));
        let tiles = provider.get_tiles(all(), all());
        for tile in &tiles {
            assert_eq!(tile.image, Some(Image::filled(32, 32, BLUE)));
        }
        assert_eq!(src.requests(), 8);
    }

    #[test]
    fn test_regional_dirty_during_fetch_discards_stale_tile() {
        let src = GatedSource::new(RED);
        let mut sims = StackedImageSources::new();
        let layer = sims.add_layer(0, "slow", src.clone(), 1.0, true);
        let provider = provider(sims, 4);

        provider.get_tiles(all(), all());
        src.set_color(BLUE);
        provider.on_layer_dirty(layer, Some(Bounds::new(0, 10, 0, 10)));
        src.gate.open();
        assert!(wait_idle(&provider));

        assert!(provider.wait_for_tiles(all(), WAIT));
        let tiles = provider.get_tiles(all(), all());
        assert_eq!(tiles[0].image, Some(Image::filled(32, 32, BLUE)));
        assert_eq!(tiles[3].image, Some(Image::filled(32, 32, RED)));
        assert_eq!(src.requests(), 5);
    }

    #[test]
    fn test_malformed_fragment_counts_as_failure() {
        let src = MalformedSource::new(false);
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "corrupt", src.clone(), 1.0, true);
        let provider = provider(sims, 2);

        provider.get_tiles(all(), all());
        assert!(wait_idle(&provider));
        assert_eq!(provider.scheduler().failure_count(), 4);

        let tiles = provider.get_tiles(all(), all());
        assert!(tiles.iter().all(|t| t.progress == 0.0 && t.image.is_none()));
        assert!(wait_idle(&provider));
    }

    #[test]
    fn test_malformed_direct_fragment_dropped() {
        let src = MalformedSource::new(true);
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "bottom", SolidSource::translucent([0, 0, 0, 255]), 1.0, true);
        sims.add_layer(0, "corrupt", src.clone(), 1.0, true);
        let provider = provider(sims, 1);

        let tiles = provider.get_tiles(all(), all());
        assert_eq!(src.requests(), 4);
        assert!(tiles.iter().all(|t| t.progress < 1.0));

        assert!(wait_idle(&provider));
        let tiles = provider.get_tiles(all(), all());
        assert!(tiles.iter().all(|t| t.progress == 0.5));
        assert_eq!(tiles[0].image, Some(Image::filled(32, 32, [0, 0, 0, 255])));
    }

    #[test]
    fn test_unchanged_tile_not_reblended() {
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "raw", SolidSource::opaque(RED), 1.0, true);
        let provider = provider(sims, 2);
        assert!(provider.wait_for_tiles(all(), WAIT));
        let before = provider.get_tiles(all(), all())[0].image.clone().unwrap();

        // nothing actually moved: the stored composite is reused
        provider.on_order_changed();
        let kept = provider.get_tiles(all(), all());
        assert_eq!(kept[0].progress, 1.0);
        assert_eq!(kept[0].image.as_ref().unwrap().data.as_ptr(), before.data.as_ptr());

        provider.set_tile_dirty(0);
        let redone = provider.get_tiles(all(), all());
        let image = redone[0].image.as_ref().unwrap();
        assert_ne!(image.data.as_ptr(), before.data.as_ptr());
        assert_eq!(*image, before);
    }

    #[test]
    fn test_many_layers_composite_on_busy_pool() {
        let mut sims = StackedImageSources::new();
        sims.add_layer(0, "base", SolidSource::opaque([0, 0, 0, 255]), 1.0, true);
        for i in 0..3 {
            let color = [40 * (i + 1), 0, 0, 255];
            sims.add_layer(0, format!("layer {i}"), SolidSource::translucent(color), 0.5, true);
        }
        let provider = TileProvider::new(
            &config(8),
            (256, 256),
            Affine::IDENTITY,
            sims,
            StackId::new(0, vec![0]),
            TaskScheduler::new(8).unwrap(),
        )
        .unwrap();

        assert!(provider.wait_for_tiles(all(), WAIT));
        assert!(wait_idle(&provider));
        let tiles = provider.get_tiles(all(), all());
        assert_eq!(tiles.len(), 64);
        let expected = tiles[0].image.as_ref().unwrap().pixel(0, 0);
        assert_ne!(expected, [0, 0, 0, 255]);
        for tile in &tiles {
            assert_eq!(tile.progress, 1.0);
            assert_eq!(tile.image.as_ref().unwrap().pixel(5, 5), expected);
        }
    }

    #[test]
    fn test_dirty_hidden_layer_not_announced() {
        let mut sims = StackedImageSources::new();
        let bottom = sims.add_layer(0, "bottom", SolidSource::opaque(BLUE), 1.0, true);
        let top = sims.add_layer(0, "top", SolidSource::opaque(RED), 1.0, true);
        let provider = provider(sims, 2);
        assert!(provider.wait_for_tiles(all(), WAIT));
        assert!(wait_idle(&provider));
        let log = RectLog::default();
        provider.subscribe(log.listener());

        // occluded by `top`
        provider.on_layer_dirty(bottom, None);
        assert!(log.rects().is_empty());

        provider.on_layer_dirty(top, Some(Bounds::new(0, 10, 0, 10)));
        assert_eq!(log.rects(), vec![Rect::new(0.0, 0.0, 10.0, 10.0)]);
    }
}

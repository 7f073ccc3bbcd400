//! Tilestack Core - tile rendering, caching and fetch scheduling for
//! layered image-volume viewers.
//!
//! This crate provides:
//! - A patch grid over each slice, mapped into scene space by an affine transform
//! - Per-stack LRU caches of composited tiles and layer fragments with dirty bits
//! - A bounded-concurrency priority scheduler on a rayon thread pool
//! - Raster compositing of ordered, translucent layers
//!
//! Usage:
//! ```no_run
//! use kurbo::{Affine, Rect};
//! use tilestack_core::{ProviderConfig, StackId, StackedImageSources, TileProvider};
//!
//! # fn main() -> tilestack_core::TileResult<()> {
//! let config = ProviderConfig::default();
//! let scheduler = config.scheduler()?;
//! let sims = StackedImageSources::new();
//! let provider = TileProvider::new(
//!     &config,
//!     (4096, 4096),
//!     Affine::IDENTITY,
//!     sims,
//!     StackId::new(0, vec![0, 0]),
//!     scheduler,
//! )?;
//!
//! // non-blocking; call again as fetches complete
//! let view = Rect::new(0.0, 0.0, 1024.0, 768.0);
//! for tile in provider.get_tiles(view, view) {
//!     println!("tile {} at {:?}: {:.0}%", tile.id, tile.rect, tile.progress * 100.0);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod image;
mod multi_cache;
mod patch_accessor;
mod scheduler;
mod source;
mod tile_provider;
mod tiles_cache;
mod tiling;
#[cfg(test)]
pub(crate) mod test_utils;

pub use config::ProviderConfig;
pub use error::{TileError, TileResult};
pub use image::{Fragment, Image, ImageType, OverlayItem};
pub use multi_cache::{CachePolicy, MultiCache};
pub use patch_accessor::{Bounds, PatchAccessor};
pub use scheduler::{
    CancelReason, Priority, TaskHandle, TaskScheduler, TaskState, TaskTag, ViewportId,
};
pub use source::{ImageRequest, ImageSource, Layer, LayerId, LayerView, StackId, StackedImageSources};
pub use tile_provider::{TileProvider, TileView};
pub use tiles_cache::{BlendInputs, DirtyMap, TileCacheEntry, TilesCache, TilesCacheGuard};
pub use tiling::{TileGeometry, Tiling};

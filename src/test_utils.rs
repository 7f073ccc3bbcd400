//! Fake image sources shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use kurbo::{BezPath, Rect};
use parking_lot::{Condvar, Mutex};

use crate::error::{TileError, TileResult};
use crate::image::{Fragment, Image, ImageType, OverlayItem};
use crate::patch_accessor::Bounds;
use crate::source::{ImageRequest, ImageSource};

struct Ready(TileResult<Fragment>);

impl ImageRequest for Ready {
    fn wait(self: Box<Self>) -> TileResult<Fragment> {
        self.0
    }
}

/// Source producing a single colour over any requested rect.
pub struct SolidSource {
    color: Mutex<[u8; 4]>,
    opaque: bool,
    direct: bool,
    requests: AtomicUsize,
    throughs: Mutex<Vec<Vec<i64>>>,
}

impl SolidSource {
    fn build(color: [u8; 4], opaque: bool, direct: bool) -> Arc<Self> {
        Arc::new(Self {
            color: Mutex::new(color),
            opaque,
            direct,
            requests: AtomicUsize::new(0),
            throughs: Mutex::new(Vec::new()),
        })
    }

    pub fn opaque(color: [u8; 4]) -> Arc<Self> {
        Self::build(color, true, false)
    }

    pub fn translucent(color: [u8; 4]) -> Arc<Self> {
        Self::build(color, false, false)
    }

    pub fn direct(color: [u8; 4]) -> Arc<Self> {
        Self::build(color, true, true)
    }

    pub fn set_color(&self, color: [u8; 4]) {
        *self.color.lock() = color;
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// `through` coordinates of every request so far.
    pub fn throughs(&self) -> Vec<Vec<i64>> {
        self.throughs.lock().clone()
    }
}

impl ImageSource for SolidSource {
    fn request(&self, rect: Bounds, through: &[i64]) -> TileResult<Box<dyn ImageRequest>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.throughs.lock().push(through.to_vec());
        let image = Image::filled(rect.width() as u32, rect.height() as u32, *self.color.lock());
        Ok(Box::new(Ready(Ok(Fragment::Raster(image)))))
    }

    fn is_direct(&self) -> bool {
        self.direct
    }

    fn is_opaque(&self) -> bool {
        self.opaque
    }
}

/// Barrier that blocked requests wait on.
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn open(&self) {
        let (open, cv) = &*self.state;
        *open.lock() = true;
        cv.notify_all();
    }

    fn wait(&self) {
        let (open, cv) = &*self.state;
        let mut guard = open.lock();
        while !*guard {
            cv.wait(&mut guard);
        }
    }
}

struct GatedRequest {
    gate: Gate,
    image: Image,
}

impl ImageRequest for GatedRequest {
    fn wait(self: Box<Self>) -> TileResult<Fragment> {
        self.gate.wait();
        Ok(Fragment::Raster(self.image))
    }
}

/// Solid-colour source whose requests block until the gate opens.
pub struct GatedSource {
    pub gate: Gate,
    color: Mutex<[u8; 4]>,
    requests: AtomicUsize,
}

impl GatedSource {
    pub fn new(color: [u8; 4]) -> Arc<Self> {
        Arc::new(Self {
            gate: Gate::default(),
            color: Mutex::new(color),
            requests: AtomicUsize::new(0),
        })
    }

    /// Colour for requests made from now on.
    pub fn set_color(&self, color: [u8; 4]) {
        *self.color.lock() = color;
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl ImageSource for GatedSource {
    fn request(&self, rect: Bounds, _through: &[i64]) -> TileResult<Box<dyn ImageRequest>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(GatedRequest {
            gate: self.gate.clone(),
            image: Image::filled(rect.width() as u32, rect.height() as u32, *self.color.lock()),
        }))
    }

    fn is_opaque(&self) -> bool {
        true
    }
}

/// Source whose fetches always fail.
pub struct FailingSource;

impl ImageSource for FailingSource {
    fn request(&self, _rect: Bounds, _through: &[i64]) -> TileResult<Box<dyn ImageRequest>> {
        Ok(Box::new(Ready(Err(TileError::TaskFailure(
            "upstream read failed".into(),
        )))))
    }
}

/// Source returning rasters whose pixel buffer is too short.
pub struct MalformedSource {
    direct: bool,
    requests: AtomicUsize,
}

impl MalformedSource {
    pub fn new(direct: bool) -> Arc<Self> {
        Arc::new(Self {
            direct,
            requests: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl ImageSource for MalformedSource {
    fn request(&self, rect: Bounds, _through: &[i64]) -> TileResult<Box<dyn ImageRequest>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let image = Image {
            data: Bytes::from(vec![255; 4]),
            width: rect.width() as u32,
            height: rect.height() as u32,
        };
        Ok(Box::new(Ready(Ok(Fragment::Raster(image)))))
    }

    fn is_direct(&self) -> bool {
        self.direct
    }
}

/// Source that refuses to produce requests until marked ready.
pub struct IndeterminateSource {
    ready: AtomicBool,
    color: [u8; 4],
}

impl IndeterminateSource {
    pub fn new(color: [u8; 4]) -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(false),
            color,
        })
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }
}

impl ImageSource for IndeterminateSource {
    fn request(&self, rect: Bounds, _through: &[i64]) -> TileResult<Box<dyn ImageRequest>> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(TileError::IndeterminateSource("graph is being rewired".into()));
        }
        let image = Image::filled(rect.width() as u32, rect.height() as u32, self.color);
        Ok(Box::new(Ready(Ok(Fragment::Raster(image)))))
    }
}

/// Source producing a rectangle outline overlay per tile.
pub struct OverlaySource;

impl ImageSource for OverlaySource {
    fn request(&self, rect: Bounds, _through: &[i64]) -> TileResult<Box<dyn ImageRequest>> {
        let mut path = BezPath::new();
        let r = rect.to_rect();
        path.move_to((r.x0, r.y0));
        path.line_to((r.x1, r.y0));
        path.line_to((r.x1, r.y1));
        path.close_path();
        let item = OverlayItem::new(path, [0, 255, 0, 255]);
        Ok(Box::new(Ready(Ok(Fragment::Overlay(item)))))
    }

    fn is_direct(&self) -> bool {
        true
    }

    fn image_type(&self) -> ImageType {
        ImageType::Overlay
    }
}

/// Collects scene-change notifications.
#[derive(Clone, Default)]
pub struct RectLog {
    rects: Arc<Mutex<Vec<Rect>>>,
}

impl RectLog {
    pub fn listener(&self) -> impl Fn(Rect) + Send + Sync + 'static {
        let rects = Arc::clone(&self.rects);
        move |rect| rects.lock().push(rect)
    }

    pub fn rects(&self) -> Vec<Rect> {
        self.rects.lock().clone()
    }
}

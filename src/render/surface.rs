use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tiny_skia::{Color, FilterQuality, IntSize, Pixmap, PixmapPaint, Transform};
use tracing::debug;

use crate::backend::RgbaFrame;
use crate::error::{PrintError, PrintResult};
use crate::handle::{NativeHandle, NativeResource};

/// Creates off-screen surfaces for preview rendering.
pub trait RenderDevice: Send + Sync {
    fn create_surface(&self, width: u32, height: u32) -> PrintResult<Surface>;

    /// Surfaces created by this device that have not been released yet.
    fn live_surfaces(&self) -> usize;
}

/// CPU device backed by `tiny-skia` pixmaps.
#[derive(Debug, Default)]
pub struct RasterDevice {
    allocations: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl RasterDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }
}

impl RenderDevice for RasterDevice {
    fn create_surface(&self, width: u32, height: u32) -> PrintResult<Surface> {
        let pixmap = Pixmap::new(width, height).ok_or_else(|| {
            PrintError::invalid_argument(format!("cannot allocate a {width}x{height} surface"))
        })?;
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(Surface {
            pixmap,
            live: Some(Arc::clone(&self.live)),
        })
    }

    fn live_surfaces(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// An off-screen drawing surface. Pixels are premultiplied RGBA.
pub struct Surface {
    pixmap: Pixmap,
    live: Option<Arc<AtomicUsize>>,
}

impl Surface {
    pub fn detached(width: u32, height: u32) -> PrintResult<Self> {
        let pixmap = Pixmap::new(width, height).ok_or_else(|| {
            PrintError::invalid_argument(format!("cannot allocate a {width}x{height} surface"))
        })?;
        Ok(Self { pixmap, live: None })
    }

    pub fn width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn height(&self) -> u32 {
        self.pixmap.height()
    }

    pub fn pixmap(&self) -> &Pixmap {
        &self.pixmap
    }

    pub fn pixmap_mut(&mut self) -> &mut Pixmap {
        &mut self.pixmap
    }

    pub fn clear(&mut self, color: Color) {
        self.pixmap.fill(color);
    }

    /// Stretches `frame` over the whole surface.
    pub fn draw_frame(&mut self, frame: &RgbaFrame) -> PrintResult<()> {
        let source = pixmap_from_frame(frame)?;
        let sx = self.width() as f32 / source.width() as f32;
        let sy = self.height() as f32 / source.height() as f32;
        let paint = PixmapPaint {
            quality: FilterQuality::Bilinear,
            ..PixmapPaint::default()
        };
        self.pixmap.draw_pixmap(
            0,
            0,
            source.as_ref(),
            &paint,
            Transform::from_scale(sx, sy),
            None,
        );
        Ok(())
    }

    /// Detached copy of the current pixels.
    pub fn snapshot(&self) -> Self {
        Self {
            pixmap: self.pixmap.clone(),
            live: None,
        }
    }

    /// Copies the surface out as straight-alpha RGBA.
    pub fn to_frame(&self) -> RgbaFrame {
        frame_from_pixmap(&self.pixmap)
    }
}

impl NativeResource for Surface {
    fn release_native(self) {
        drop(self);
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

pub(crate) fn premultiply_u8(channel: u8, alpha: u8) -> u8 {
    let product = channel as u16 * alpha as u16 + 127;
    ((product + (product >> 8)) >> 8) as u8
}

/// Converts straight-alpha RGBA into a premultiplied pixmap.
pub(crate) fn pixmap_from_rgba(width: u32, height: u32, rgba: &[u8]) -> PrintResult<Pixmap> {
    let size = IntSize::from_wh(width, height)
        .ok_or_else(|| PrintError::invalid_argument("image has a zero dimension"))?;
    if rgba.len() != width as usize * height as usize * 4 {
        return Err(PrintError::invalid_argument(
            "frame buffer does not match its size",
        ));
    }

    let mut data = Vec::with_capacity(rgba.len());
    for px in rgba.chunks_exact(4) {
        let alpha = px[3];
        data.extend_from_slice(&[
            premultiply_u8(px[0], alpha),
            premultiply_u8(px[1], alpha),
            premultiply_u8(px[2], alpha),
            alpha,
        ]);
    }

    Pixmap::from_vec(data, size)
        .ok_or_else(|| PrintError::invalid_argument("frame buffer does not match its size"))
}

pub(crate) fn pixmap_from_frame(frame: &RgbaFrame) -> PrintResult<Pixmap> {
    pixmap_from_rgba(frame.width, frame.height, &frame.pixels)
}

pub(crate) fn frame_from_pixmap(pixmap: &Pixmap) -> RgbaFrame {
    let mut pixels = Vec::with_capacity(pixmap.data().len());
    for pixel in pixmap.pixels() {
        let color = pixel.demultiply();
        pixels.extend_from_slice(&[color.red(), color.green(), color.blue(), color.alpha()]);
    }
    RgbaFrame {
        width: pixmap.width(),
        height: pixmap.height(),
        pixels: pixels.into(),
    }
}

fn check_size(width: u32, height: u32) -> PrintResult<()> {
    if width == 0 || height == 0 {
        return Err(PrintError::invalid_argument(
            "surface size must be at least one pixel",
        ));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct SurfaceSlot {
    surface: Option<NativeHandle<Surface>>,
    width: u32,
    height: u32,
    cached_page: Option<u32>,
}

/// Owns the preview surface and recreates it only when the size changes.
///
/// The slot lock is held while a page is rendered into the surface, so a
/// resize can never swap the surface out from under an in-flight render.
pub struct SurfaceManager {
    device: Arc<dyn RenderDevice>,
    slot: Mutex<SurfaceSlot>,
}

/// Borrowed view of the surface while the slot lock is held. Never hold one
/// across a call into the preview target.
pub struct SurfaceLease<'a> {
    slot: MutexGuard<'a, SurfaceSlot>,
}

impl SurfaceLease<'_> {
    pub fn surface(&self) -> Option<&Surface> {
        self.slot.surface.as_ref().and_then(NativeHandle::get)
    }

    pub fn surface_mut(&mut self) -> Option<&mut Surface> {
        self.slot.surface.as_mut().and_then(NativeHandle::get_mut)
    }

    /// The page currently drawn on the surface.
    pub fn cached_page(&self) -> Option<u32> {
        self.slot.cached_page
    }

    pub fn set_cached_page(&mut self, page: Option<u32>) {
        self.slot.cached_page = page;
    }
}

impl SurfaceManager {
    pub fn new(device: Arc<dyn RenderDevice>) -> Self {
        Self {
            device,
            slot: Mutex::new(SurfaceSlot::default()),
        }
    }

    /// Returns `true` when a new surface was allocated.
    pub fn ensure_surface(&self, width: u32, height: u32) -> PrintResult<bool> {
        check_size(width, height)?;
        let mut slot = self.lock();
        if slot.surface.is_some() && slot.width == width && slot.height == height {
            return Ok(false);
        }
        self.allocate(&mut slot, width, height)?;
        Ok(true)
    }

    /// Creates a surface only when none exists; an existing surface keeps
    /// its size. Returns `true` when a new surface was allocated.
    pub fn ensure_any_surface(&self, width: u32, height: u32) -> PrintResult<bool> {
        check_size(width, height)?;
        let mut slot = self.lock();
        if slot.surface.is_some() {
            return Ok(false);
        }
        self.allocate(&mut slot, width, height)?;
        Ok(true)
    }

    fn allocate(&self, slot: &mut SurfaceSlot, width: u32, height: u32) -> PrintResult<()> {
        let surface = self.device.create_surface(width, height)?;
        debug!(
            width,
            height,
            previous_width = slot.width,
            previous_height = slot.height,
            "recreating preview surface"
        );
        slot.surface = Some(NativeHandle::new(surface));
        slot.width = width;
        slot.height = height;
        slot.cached_page = None;
        Ok(())
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let slot = self.lock();
        slot.surface.as_ref().map(|_| (slot.width, slot.height))
    }

    pub fn lease(&self) -> SurfaceLease<'_> {
        SurfaceLease { slot: self.lock() }
    }

    pub fn cached_page(&self) -> Option<u32> {
        self.lock().cached_page
    }

    /// Forgets which page is on the surface so the next request redraws.
    pub fn invalidate(&self) {
        self.lock().cached_page = None;
    }

    pub fn release(&self) -> bool {
        let mut slot = self.lock();
        slot.cached_page = None;
        match slot.surface.take() {
            Some(mut handle) => handle.release(),
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SurfaceSlot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for SurfaceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceManager")
            .field("dimensions", &self.dimensions())
            .finish()
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tiny_skia::Color;
use tracing::{debug, trace, warn};

use crate::backend::{DIPS_PER_INCH, DocumentBackend, RgbaFrame};
use crate::error::{PrintError, PrintResult};
use crate::handle::SharedHandle;
use crate::render::{
    GateClaim, PageBitmapCache, PageBitmapKey, PageWorkGate, RenderDevice, Surface, SurfaceManager,
};
use crate::stats::PreviewStats;
use crate::target::{JOB_PAGE_APPLICATION_DEFINED, PageCountType, PageDescription, PreviewTarget};
use crate::xps::SolidColor;

/// Knobs for the preview path of a document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewSettings {
    /// Resolution the surface is handed to the preview pane at.
    pub dpi: f32,
    pub gate_poll_interval: Duration,
    pub cache_entries: usize,
    pub cache_memory_bytes: usize,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            dpi: DIPS_PER_INCH,
            gate_poll_interval: Duration::from_millis(100),
            cache_entries: 8,
            cache_memory_bytes: 128 * 1024 * 1024,
        }
    }
}

/// Per-format preview renderer bound to one preview target.
///
/// Owns the preview target handle; disposing the render target releases it
/// and stops the page gate so pending page requests return.
pub(crate) struct PreviewRenderTarget {
    target: SharedHandle<Arc<dyn PreviewTarget>>,
    surfaces: SurfaceManager,
    gate: PageWorkGate,
    bitmaps: Mutex<PageBitmapCache>,
    stats: Mutex<PreviewStats>,
    page_count_reported: AtomicBool,
    dpi: f32,
    background: Mutex<SolidColor>,
}

impl PreviewRenderTarget {
    pub(crate) fn new(
        target: Arc<dyn PreviewTarget>,
        device: Arc<dyn RenderDevice>,
        settings: PreviewSettings,
    ) -> Self {
        Self {
            target: SharedHandle::new(target),
            surfaces: SurfaceManager::new(device),
            gate: PageWorkGate::new(settings.gate_poll_interval),
            bitmaps: Mutex::new(PageBitmapCache::new(
                settings.cache_entries,
                settings.cache_memory_bytes,
            )),
            stats: Mutex::new(PreviewStats::default()),
            page_count_reported: AtomicBool::new(false),
            dpi: settings.dpi,
            background: Mutex::new(SolidColor::WHITE),
        }
    }

    pub(crate) fn set_background(&self, color: SolidColor) {
        *self.background.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = color;
    }

    /// Reports the final page count to the preview pane, once per binding.
    pub(crate) fn report_page_count(&self, count: u32) -> PrintResult<bool> {
        if self
            .page_count_reported
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        debug!(count, "reporting final page count");
        match self.target.cloned() {
            Some(target) => target
                .set_job_page_count(PageCountType::Final, count)
                .map(|()| true),
            None => Ok(false),
        }
    }

    pub(crate) fn paginate(&self, job_page: u32, description: &PageDescription) -> PrintResult<()> {
        if self.gate.is_stopped() {
            return Ok(());
        }

        let rect = description.imageable_rect;
        let (width, height) = self.surface_pixels(rect.width, rect.height)?;
        trace!(
            job_page,
            width,
            height,
            thread = ?thread::current().id(),
            "paginate"
        );
        if self.surfaces.ensure_surface(width, height)? {
            self.stats().record_surface_allocation();
        }
        Ok(())
    }

    /// Draws `desired_job_page` (1-based) and hands the surface to the pane.
    ///
    /// A request for the page already being drawn returns at once; a request
    /// for another page waits for the current one to finish.
    pub(crate) fn make_page(
        &self,
        backend: &dyn DocumentBackend,
        desired_job_page: u32,
        width: f32,
        height: f32,
    ) -> PrintResult<()> {
        let page = if desired_job_page == JOB_PAGE_APPLICATION_DEFINED {
            1
        } else {
            desired_job_page
        };
        trace!(
            page,
            width,
            height,
            thread = ?thread::current().id(),
            "make page"
        );

        if page == 0 || page as usize > backend.page_count() {
            debug!(page, page_count = backend.page_count(), "preview page out of range");
            self.stats().record_skipped();
            return Ok(());
        }
        let (width_px, height_px) = self.surface_pixels(width, height)?;

        let guard = match self.gate.claim(page) {
            GateClaim::Claimed(guard) => guard,
            GateClaim::Duplicate => {
                trace!(page, "page already in flight");
                self.stats().record_coalesced();
                return Ok(());
            }
            GateClaim::Stopped => return Ok(()),
        };
        if guard.waited() {
            self.stats().record_wait();
        }

        // paginate owns the surface size; the requested size is only used
        // when no surface exists yet
        if self.surfaces.ensure_any_surface(width_px, height_px)? {
            self.stats().record_surface_allocation();
        }

        let Some(snapshot) = self.render_into_surface(backend, page)? else {
            return Ok(());
        };
        let Some(target) = self.target.cloned() else {
            return Ok(());
        };
        let drawn = target.draw_page(page, &snapshot, self.dpi, self.dpi);
        drop(guard);
        drawn
    }

    /// Brings `page` onto the surface and returns a copy to hand to the
    /// pane, so the surface lock is released before calling out.
    fn render_into_surface(
        &self,
        backend: &dyn DocumentBackend,
        page: u32,
    ) -> PrintResult<Option<Surface>> {
        let mut lease = self.surfaces.lease();
        let Some((width, height)) = lease
            .surface()
            .map(|surface| (surface.width(), surface.height()))
        else {
            return Ok(None);
        };

        if lease.cached_page() == Some(page) {
            self.stats().record_coalesced();
        } else {
            let started = Instant::now();
            let frame = self.page_bitmap(backend, page, width, height)?;
            let background = self.background_color();
            if let Some(surface) = lease.surface_mut() {
                surface.clear(background);
                surface.draw_frame(&frame)?;
            }
            lease.set_cached_page(Some(page));
            self.stats().record_render(started.elapsed());
        }
        Ok(lease.surface().map(Surface::snapshot))
    }

    /// Drops everything drawn for the old settings and asks the pane to
    /// request pages again.
    pub(crate) fn invalidate(&self) -> PrintResult<()> {
        self.surfaces.invalidate();
        self.bitmaps().clear();
        debug!("invalidating preview");
        match self.target.cloned() {
            Some(target) => target.invalidate_preview(),
            None => Ok(()),
        }
    }

    pub(crate) fn dispose(&self) {
        self.gate.stop();
        self.surfaces.release();
        self.bitmaps().clear();
        if self.target.release() {
            debug!("preview target released");
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.gate.is_stopped()
    }

    pub(crate) fn snapshot_stats(&self) -> PreviewStats {
        let (counters, bytes) = {
            let bitmaps = self.bitmaps();
            (bitmaps.counters(), bitmaps.memory_bytes())
        };
        let mut stats = self.stats().clone();
        stats.record_cache(counters, bytes);
        stats
    }

    fn page_bitmap(
        &self,
        backend: &dyn DocumentBackend,
        page: u32,
        width: u32,
        height: u32,
    ) -> PrintResult<RgbaFrame> {
        let index = page as usize - 1;
        let key = PageBitmapKey::new(backend.doc_id(), index, width, height);
        if let Some(frame) = self.bitmaps().get_cloned(&key) {
            return Ok(frame);
        }

        let frame = backend.render_page_to_size(index, width, height)?;
        if !self.bitmaps().insert(key, frame.clone()) {
            warn!(page, width, height, "page bitmap exceeds the preview cache budget");
        }
        Ok(frame)
    }

    fn surface_pixels(&self, width: f32, height: f32) -> PrintResult<(u32, u32)> {
        if !width.is_finite() || !height.is_finite() || width <= 0.0 || height <= 0.0 {
            return Err(PrintError::invalid_argument(format!(
                "preview size must be positive, got {width}x{height}"
            )));
        }
        let scale = self.dpi / DIPS_PER_INCH;
        Ok((
            (width * scale).round().max(1.0) as u32,
            (height * scale).round().max(1.0) as u32,
        ))
    }

    fn background_color(&self) -> Color {
        let color = *self.background.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Color::from_rgba8(color.r, color.g, color.b, color.a)
    }

    fn stats(&self) -> MutexGuard<'_, PreviewStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bitmaps(&self) -> MutexGuard<'_, PageBitmapCache> {
        self.bitmaps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::backend::{build_pdf, unique_temp_path};
use crate::error::{PrintError, PrintResult};
use crate::render::Surface;
use crate::target::{
    AdviseCookie, DocumentPackageTarget, PackageCompletion, PackageStatus, PackageWriter,
    PageCountType, PreviewTarget, StatusSink,
};
use crate::xps::{FixedPage, PageContent, PartUri, build_xps};

/// Temp file removed on drop.
pub(crate) struct TempDoc(pub PathBuf);

impl TempDoc {
    pub(crate) fn pdf(pages: &[&str]) -> Self {
        let path = unique_temp_path("doc").with_extension("pdf");
        fs::write(&path, build_pdf(pages)).expect("pdf should be written");
        Self(path)
    }

    pub(crate) fn xps(pages: usize) -> Self {
        let path = unique_temp_path("doc").with_extension("xps");
        fs::write(&path, build_xps(pages)).expect("xps should be written");
        Self(path)
    }
}

impl Drop for TempDoc {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DrawRecord {
    pub page: u32,
    pub width: u32,
    pub height: u32,
    pub dpi: (f32, f32),
    /// Straight RGBA at (5, 5).
    pub corner: [u8; 4],
}

type DrawHook = Box<dyn Fn(u32) + Send + Sync>;

#[derive(Default)]
pub(crate) struct RecordingPreview {
    pub page_counts: Mutex<Vec<(PageCountType, u32)>>,
    pub draws: Mutex<Vec<DrawRecord>>,
    pub invalidations: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    draw_delay: Duration,
    on_draw: Mutex<Option<DrawHook>>,
}

impl RecordingPreview {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn slow(draw_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            draw_delay,
            ..Self::default()
        })
    }

    pub(crate) fn drawn_pages(&self) -> Vec<u32> {
        self.draws
            .lock()
            .expect("draws lock")
            .iter()
            .map(|draw| draw.page)
            .collect()
    }

    pub(crate) fn page_counts(&self) -> Vec<(PageCountType, u32)> {
        self.page_counts.lock().expect("page count lock").clone()
    }

    /// Runs `hook(job_page)` from inside every `draw_page`.
    pub(crate) fn on_draw(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        *self.on_draw.lock().expect("draw hook lock") = Some(Box::new(hook));
    }

    /// Drops the hook so it no longer keeps its captures alive.
    pub(crate) fn clear_on_draw(&self) {
        self.on_draw.lock().expect("draw hook lock").take();
    }
}

impl PreviewTarget for RecordingPreview {
    fn set_job_page_count(&self, count_type: PageCountType, count: u32) -> PrintResult<()> {
        self.page_counts
            .lock()
            .expect("page count lock")
            .push((count_type, count));
        Ok(())
    }

    fn draw_page(
        &self,
        job_page: u32,
        surface: &Surface,
        dpi_x: f32,
        dpi_y: f32,
    ) -> PrintResult<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.draw_delay.is_zero() {
            thread::sleep(self.draw_delay);
        }

        let frame = surface.to_frame();
        let offset = (5 * frame.width as usize + 5) * 4;
        let mut corner = [0_u8; 4];
        if let Some(pixel) = frame.pixels.get(offset..offset + 4) {
            corner.copy_from_slice(pixel);
        }
        self.draws.lock().expect("draws lock").push(DrawRecord {
            page: job_page,
            width: surface.width(),
            height: surface.height(),
            dpi: (dpi_x, dpi_y),
            corner,
        });

        if let Some(hook) = self.on_draw.lock().expect("draw hook lock").as_ref() {
            hook(job_page);
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn invalidate_preview(&self) -> PrintResult<()> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WriterEvent {
    StartDocument(String),
    AddPage {
        name: String,
        markup: bool,
        paths: usize,
        resources: Vec<(String, String)>,
    },
    Close,
}

type PageHook = Box<dyn Fn(usize) + Send + Sync>;

/// Package target double. Writers record every call and publish
/// `InProgress` per page and `Submitted` on close; they never publish on
/// failure.
#[derive(Default)]
pub(crate) struct RecordingTarget {
    preview: Option<Arc<RecordingPreview>>,
    shared: Arc<TargetShared>,
}

#[derive(Default)]
struct TargetShared {
    events: Mutex<Vec<WriterEvent>>,
    canceled: AtomicBool,
    cancel_calls: AtomicUsize,
    sinks: Mutex<Vec<(AdviseCookie, Arc<dyn StatusSink>)>>,
    next_cookie: AtomicU64,
    advised: AtomicUsize,
    unadvised: AtomicUsize,
    fail_at_page: Mutex<Option<usize>>,
    after_page: Mutex<Option<PageHook>>,
}

impl TargetShared {
    fn publish(&self, status: PackageStatus) {
        let sinks: Vec<_> = self
            .sinks
            .lock()
            .expect("sinks lock")
            .iter()
            .map(|(_, sink)| Arc::clone(sink))
            .collect();
        for sink in sinks {
            sink.package_status_updated(&status);
        }
    }
}

impl RecordingTarget {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_preview(preview: &Arc<RecordingPreview>) -> Self {
        Self {
            preview: Some(Arc::clone(preview)),
            ..Self::default()
        }
    }

    pub(crate) fn fail_at_page(self, index: usize) -> Self {
        *self.shared.fail_at_page.lock().expect("fail lock") = Some(index);
        self
    }

    /// Runs `hook(pages_written)` after each appended page.
    pub(crate) fn after_page(self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        *self.shared.after_page.lock().expect("hook lock") = Some(Box::new(hook));
        self
    }

    pub(crate) fn events(&self) -> Vec<WriterEvent> {
        self.shared.events.lock().expect("events lock").clone()
    }

    pub(crate) fn page_names(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                WriterEvent::AddPage { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn cancel_calls(&self) -> usize {
        self.shared.cancel_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn advise_counts(&self) -> (usize, usize) {
        (
            self.shared.advised.load(Ordering::SeqCst),
            self.shared.unadvised.load(Ordering::SeqCst),
        )
    }

    /// Drops the hook so it no longer keeps its captures alive.
    pub(crate) fn clear_hook(&self) {
        self.shared.after_page.lock().expect("hook lock").take();
    }
}

impl DocumentPackageTarget for RecordingTarget {
    fn preview_target(&self) -> Option<Arc<dyn PreviewTarget>> {
        self.preview
            .as_ref()
            .map(|preview| Arc::clone(preview) as Arc<dyn PreviewTarget>)
    }

    fn xps_writer(
        &self,
        _sequence: &PartUri,
        _discard_control: &PartUri,
    ) -> PrintResult<Box<dyn PackageWriter>> {
        if self.shared.canceled.load(Ordering::SeqCst) {
            return Err(PrintError::Canceled);
        }
        Ok(Box::new(RecordingWriter {
            shared: Arc::clone(&self.shared),
            pages: 0,
        }))
    }

    fn cancel(&self) {
        self.shared.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.canceled.store(true, Ordering::SeqCst);
    }

    fn advise(&self, sink: Arc<dyn StatusSink>) -> Option<AdviseCookie> {
        let cookie = AdviseCookie(self.shared.next_cookie.fetch_add(1, Ordering::SeqCst));
        self.shared.advised.fetch_add(1, Ordering::SeqCst);
        self.shared
            .sinks
            .lock()
            .expect("sinks lock")
            .push((cookie, sink));
        Some(cookie)
    }

    fn unadvise(&self, cookie: AdviseCookie) {
        self.shared.unadvised.fetch_add(1, Ordering::SeqCst);
        self.shared
            .sinks
            .lock()
            .expect("sinks lock")
            .retain(|(existing, _)| *existing != cookie);
    }
}

struct RecordingWriter {
    shared: Arc<TargetShared>,
    pages: usize,
}

impl RecordingWriter {
    fn check_canceled(&self) -> PrintResult<()> {
        if self.shared.canceled.load(Ordering::SeqCst) {
            return Err(PrintError::Canceled);
        }
        Ok(())
    }

    fn status(&self, completion: PackageCompletion) -> PackageStatus {
        PackageStatus {
            job_id: 42,
            current_document: 1,
            current_page: self.pages as u32,
            current_page_total: self.pages as u32,
            completion,
        }
    }
}

impl PackageWriter for RecordingWriter {
    fn start_new_document(&mut self, name: &PartUri) -> PrintResult<()> {
        self.check_canceled()?;
        self.shared
            .events
            .lock()
            .expect("events lock")
            .push(WriterEvent::StartDocument(name.as_str().to_string()));
        Ok(())
    }

    fn add_page(&mut self, page: FixedPage) -> PrintResult<()> {
        self.check_canceled()?;
        if *self.shared.fail_at_page.lock().expect("fail lock") == Some(self.pages) {
            return Err(PrintError::package("spool disk is full"));
        }

        self.shared
            .events
            .lock()
            .expect("events lock")
            .push(WriterEvent::AddPage {
                name: page.name.as_str().to_string(),
                markup: matches!(page.content, PageContent::Markup(_)),
                paths: page.path_count(),
                resources: page
                    .resources
                    .iter()
                    .map(|resource| (resource.uri.as_str().to_string(), resource.content_type.clone()))
                    .collect(),
            });
        self.pages += 1;
        self.shared.publish(self.status(PackageCompletion::InProgress));

        if let Some(hook) = self.shared.after_page.lock().expect("hook lock").as_ref() {
            hook(self.pages);
        }
        Ok(())
    }

    fn close(&mut self) -> PrintResult<()> {
        self.check_canceled()?;
        self.shared
            .events
            .lock()
            .expect("events lock")
            .push(WriterEvent::Close);
        self.shared.publish(self.status(PackageCompletion::Submitted));
        Ok(())
    }
}

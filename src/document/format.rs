use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{DocumentBackend, PdfDoc, XpsDoc};
use crate::error::{PrintError, PrintResult};
use crate::render::RenderDevice;
use crate::stats::PreviewStats;
use crate::target::{DocumentPackageTarget, PrintTaskOptions};
use crate::xps::{PartUri, RasterOptions, SolidColor};

use super::control::print_with_control;
use super::preview::PreviewSettings;
use super::serializer::{PassThroughPages, RasterizedPages, write_document};
use super::session::{DocumentSession, ProductionContext};
use super::source::{
    DocumentState, DocumentStatus, PreviewPageCollection, PrintDocumentPageSource,
    PrintDocumentSource, StatusCallback, SubscriptionId,
};

/// Part name of the fixed document sequence in the output package.
pub const SEQUENCE_PART: &str = "/seq";
pub const DISCARD_CONTROL_PART: &str = "/discard";

/// What differs between source formats: how a file is decoded, which
/// options tune it and how the final package is produced from it.
pub trait DocumentFormat: Send + Sync + 'static {
    type Backend: DocumentBackend + 'static;
    type Options: Clone + Default + PartialEq + fmt::Debug + Send + Sync + 'static;

    const NAME: &'static str;

    fn open_backend(path: &Path) -> PrintResult<Self::Backend>;

    /// Pushes options that affect rendering into a decoded backend.
    fn apply_options(_backend: &Self::Backend, _options: &Self::Options) {}

    fn preview_background(_options: &Self::Options) -> SolidColor {
        SolidColor::WHITE
    }

    fn produce(
        backend: &Self::Backend,
        options: &Self::Options,
        context: &ProductionContext<'_>,
    ) -> PrintResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PdfPrintingMode {
    /// Pages are recorded as drawing commands and played into the package.
    #[default]
    Direct,
    /// Pages are rasterized and written as full-page images.
    Xps,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdfOptions {
    pub printing_mode: PdfPrintingMode,
    /// Resolution of the page bitmaps recorded in direct mode.
    pub raster_dpi: f32,
    pub ignore_high_contrast: bool,
    /// Page background; replaced by white when high contrast is ignored.
    pub background: SolidColor,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            printing_mode: PdfPrintingMode::Direct,
            raster_dpi: 150.0,
            ignore_high_contrast: false,
            background: SolidColor::WHITE,
        }
    }
}

impl PdfOptions {
    pub fn effective_background(&self) -> SolidColor {
        if self.ignore_high_contrast {
            SolidColor::WHITE
        } else {
            self.background
        }
    }
}

pub struct PdfFormat;

impl DocumentFormat for PdfFormat {
    type Backend = PdfDoc;
    type Options = PdfOptions;

    const NAME: &'static str = "pdf";

    fn open_backend(path: &Path) -> PrintResult<PdfDoc> {
        PdfDoc::open(path)
    }

    fn apply_options(backend: &PdfDoc, options: &PdfOptions) {
        backend.set_background(options.effective_background());
    }

    fn preview_background(options: &PdfOptions) -> SolidColor {
        options.effective_background()
    }

    fn produce(
        backend: &PdfDoc,
        options: &PdfOptions,
        context: &ProductionContext<'_>,
    ) -> PrintResult<()> {
        let sequence = PartUri::new(SEQUENCE_PART)?;
        let discard = PartUri::new(DISCARD_CONTROL_PART)?;
        let writer = context.target().xps_writer(&sequence, &discard)?;

        info!(
            mode = ?options.printing_mode,
            pages = backend.page_count(),
            "producing pdf package"
        );
        match options.printing_mode {
            PdfPrintingMode::Xps => {
                let mut pages = RasterizedPages::new(backend);
                write_document(&mut pages, backend.page_count(), writer, context.document_name(), context)
                    .map(drop)
            }
            PdfPrintingMode::Direct => print_with_control(backend, options, writer, context).map(drop),
        }
    }
}

pub struct XpsFormat;

impl DocumentFormat for XpsFormat {
    type Backend = XpsDoc;
    type Options = RasterOptions;

    const NAME: &'static str = "xps";

    fn open_backend(path: &Path) -> PrintResult<XpsDoc> {
        XpsDoc::open(path)
    }

    fn apply_options(backend: &XpsDoc, options: &RasterOptions) {
        backend.set_raster_options(*options);
    }

    fn produce(
        backend: &XpsDoc,
        _options: &RasterOptions,
        context: &ProductionContext<'_>,
    ) -> PrintResult<()> {
        let package = backend.package();
        let sequence = PartUri::new(SEQUENCE_PART)?;
        let discard = PartUri::new(DISCARD_CONTROL_PART)?;
        let writer = context.target().xps_writer(&sequence, &discard)?;

        info!(
            pages = package.page_count(),
            document = %package.document_uri(),
            "producing xps package"
        );
        let name = PartUri::new("/name")?;
        let mut pages = PassThroughPages::new(package);
        write_document(&mut pages, package.page_count(), writer, &name, context).map(drop)
    }
}

struct DocumentInner<F: DocumentFormat> {
    session: Arc<DocumentSession>,
    backend: OnceCell<Arc<F::Backend>>,
    options: Mutex<F::Options>,
}

/// A print document source over one file.
///
/// Cheap to clone; clones share the session. The file is decoded on first
/// use, once, and the decoded document is shared by preview and production.
pub struct PrintDocument<F: DocumentFormat> {
    inner: Arc<DocumentInner<F>>,
}

pub type PdfPrintDocument = PrintDocument<PdfFormat>;
pub type XpsPrintDocument = PrintDocument<XpsFormat>;

impl<F: DocumentFormat> Clone for PrintDocument<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: DocumentFormat> PrintDocument<F> {
    pub fn open(path: impl AsRef<Path>) -> PrintResult<Self> {
        Self::open_with(path, F::Options::default(), PreviewSettings::default())
    }

    pub fn open_with(
        path: impl AsRef<Path>,
        options: F::Options,
        settings: PreviewSettings,
    ) -> PrintResult<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(PrintError::invalid_argument(
                "document path must not be empty",
            ));
        }
        debug!(format = F::NAME, path = %path.display(), "print document opened");

        Ok(Self {
            inner: Arc::new(DocumentInner {
                session: Arc::new(DocumentSession::new(PathBuf::from(path), settings)),
                backend: OnceCell::new(),
                options: Mutex::new(options),
            }),
        })
    }

    /// Surfaces for previews negotiated from now on come from `device`.
    pub fn set_render_device(&self, device: Arc<dyn RenderDevice>) {
        self.inner.session.set_device(device);
    }

    pub fn options(&self) -> F::Options {
        self.lock_options().clone()
    }

    /// Replaces the format options. A bound preview is invalidated when
    /// anything changed.
    pub fn set_options(&self, options: F::Options) -> PrintResult<()> {
        {
            let mut current = self.lock_options();
            if *current == options {
                return Ok(());
            }
            debug!(format = F::NAME, ?options, "document options changed");
            *current = options.clone();
        }

        if let Some(backend) = self.inner.backend.get() {
            F::apply_options(backend, &options);
        }
        match self.inner.session.preview() {
            Some(preview) => {
                preview.set_background(F::preview_background(&options));
                preview.invalidate()
            }
            None => Ok(()),
        }
    }

    pub fn preview_stats(&self) -> Option<PreviewStats> {
        self.inner.session.preview_stats()
    }

    /// Decodes the file on first call.
    pub fn backend(&self) -> PrintResult<&Arc<F::Backend>> {
        self.inner.session.ensure_live()?;
        self.inner.backend.get_or_try_init(|| {
            let session = &self.inner.session;
            let backend = F::open_backend(session.path())?;
            F::apply_options(&backend, &self.options());

            let pages = u32::try_from(backend.page_count()).unwrap_or(u32::MAX);
            info!(format = F::NAME, path = %session.path().display(), pages, "document decoded");
            session.set_total_pages(pages);
            Ok(Arc::new(backend))
        })
    }

    fn lock_options(&self) -> MutexGuard<'_, F::Options> {
        self.inner
            .options
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<F: DocumentFormat> PreviewPageCollection for PrintDocument<F> {
    fn paginate(&self, current_job_page: u32, options: &dyn PrintTaskOptions) -> PrintResult<()> {
        let session = &self.inner.session;
        if session.is_disposed() {
            return Ok(());
        }
        session.enter_preview_loop();
        let Some(preview) = session.preview() else {
            return Ok(());
        };

        self.backend()?;
        let description = options.page_description(current_job_page)?;
        preview.paginate(current_job_page, &description)
    }

    fn make_page(&self, desired_job_page: u32, width: f32, height: f32) -> PrintResult<()> {
        let session = &self.inner.session;
        if session.is_disposed() {
            return Ok(());
        }
        session.enter_preview_loop();
        let Some(preview) = session.preview() else {
            return Ok(());
        };

        let backend = self.backend()?;
        match preview.make_page(backend.as_ref(), desired_job_page, width, height) {
            Err(err @ PrintError::InvalidArgument(_)) => Err(err),
            Err(err) => {
                warn!(page = desired_job_page, error = %err, "preview page failed");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}

impl<F: DocumentFormat> PrintDocumentPageSource for PrintDocument<F> {
    fn get_preview_page_collection(
        &self,
        target: Arc<dyn DocumentPackageTarget>,
    ) -> PrintResult<Arc<dyn PreviewPageCollection>> {
        if let Some(preview) = self.inner.session.bind_preview(target.as_ref())? {
            preview.set_background(F::preview_background(&self.options()));
        }
        Ok(Arc::new(self.clone()))
    }

    fn make_document(
        &self,
        options: &dyn PrintTaskOptions,
        target: Option<Arc<dyn DocumentPackageTarget>>,
    ) -> PrintResult<()> {
        self.inner
            .session
            .run_production(options, target, |context| {
                let backend = self.backend()?;
                F::produce(backend, &self.options(), context)
            })
    }
}

impl<F: DocumentFormat> PrintDocumentSource for PrintDocument<F> {
    fn file_path(&self) -> &Path {
        self.inner.session.path()
    }

    fn total_pages(&self) -> Option<u32> {
        self.inner.session.total_pages()
    }

    fn state(&self) -> DocumentState {
        self.inner.session.state()
    }

    fn cancel(&self) {
        self.inner.session.cancel();
    }

    fn dispose(&self) {
        self.inner.session.dispose();
    }

    fn subscribe(&self, callback: StatusCallback) -> SubscriptionId {
        self.inner.session.subscribe(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.session.unsubscribe(id)
    }

    fn subscribe_channel(&self) -> flume::Receiver<DocumentStatus> {
        self.inner.session.subscribe_channel()
    }
}

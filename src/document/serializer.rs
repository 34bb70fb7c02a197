//! Appending source pages to an output package.

use tracing::{debug, trace};

use crate::backend::{DIPS_PER_INCH, DocumentBackend, PageRect};
use crate::error::PrintResult;
use crate::target::PackageWriter;
use crate::xps::{Brush, FixedPage, Geometry, GeometryFigure, ImageBrush, PageResource, PartUri, XpsPackage, XpsPath};

use super::session::ProductionContext;

/// Appends one source page (0-based) to the writer's current document.
pub trait PageSerializer {
    fn append_page(&mut self, index: usize, writer: &mut dyn PackageWriter) -> PrintResult<()>;
}

/// Writes every page as a full-page image at 96 DPI.
pub struct RasterizedPages<'a> {
    backend: &'a dyn DocumentBackend,
}

impl<'a> RasterizedPages<'a> {
    pub fn new(backend: &'a dyn DocumentBackend) -> Self {
        Self { backend }
    }
}

impl PageSerializer for RasterizedPages<'_> {
    fn append_page(&mut self, index: usize, writer: &mut dyn PackageWriter) -> PrintResult<()> {
        let size = self.backend.page_size(index)?;
        let frame = self.backend.render_page_at_dpi(index, DIPS_PER_INCH)?;
        let png = frame.encode_png()?;

        let image = PartUri::from_root(&format!("image{index}"))?;
        let rect = PageRect::from_size(size);
        let mut page = FixedPage::new(PartUri::from_root(&format!("page{index}"))?, size);
        page.add_path(XpsPath::filled(
            Geometry::new(format!("geometry{index}"), vec![GeometryFigure::rectangle(rect)]),
            Brush::Image(ImageBrush {
                image: image.clone(),
                viewbox: rect,
                viewport: rect,
            }),
        ));
        page.resources.push(PageResource::png(image, png));

        trace!(index, width = frame.width, height = frame.height, "rasterized page");
        writer.add_page(page)
    }
}

/// Copies pages of an XPS package unchanged, with the resources they need.
pub struct PassThroughPages<'a> {
    package: &'a XpsPackage,
}

impl<'a> PassThroughPages<'a> {
    pub fn new(package: &'a XpsPackage) -> Self {
        Self { package }
    }
}

impl PageSerializer for PassThroughPages<'_> {
    fn append_page(&mut self, index: usize, writer: &mut dyn PackageWriter) -> PrintResult<()> {
        let page = self.package.pass_through_page(index)?;
        trace!(index, part = %page.name, resources = page.resources.len(), "passing page through");
        writer.add_page(page)
    }
}

/// Writes one document of `page_count` pages and closes the writer.
///
/// Cancellation is checked before each page; no page is appended once it
/// has been observed.
pub fn write_document(
    pages: &mut dyn PageSerializer,
    page_count: usize,
    mut writer: Box<dyn PackageWriter>,
    name: &PartUri,
    context: &ProductionContext<'_>,
) -> PrintResult<u32> {
    context.check_canceled()?;
    writer.start_new_document(name)?;

    let mut written = 0_u32;
    for index in 0..page_count {
        context.check_canceled()?;
        pages.append_page(index, writer.as_mut())?;
        written += 1;
    }

    writer.close()?;
    debug!(document = %name, pages = written, "document written");
    Ok(written)
}

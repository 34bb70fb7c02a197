use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{PrintError, PrintResult};
use crate::xps::{PageRasterizer, RasterOptions, XpsPackage};

use super::hayro::calculate_doc_id;
use super::traits::{DocumentBackend, PageSize, RgbaFrame};

/// An XPS or OpenXPS source document.
pub struct XpsDoc {
    path: PathBuf,
    doc_id: u64,
    package: Arc<XpsPackage>,
    options: Mutex<RasterOptions>,
}

impl XpsDoc {
    pub fn open(path: impl AsRef<Path>) -> PrintResult<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(PrintError::invalid_argument("xps path must not be empty"));
        }
        if !path.is_file() {
            return Err(PrintError::invalid_argument(format!(
                "xps path must be a regular file: {}",
                path.display()
            )));
        }

        let package = XpsPackage::open(path)?;
        Ok(Self::from_package(path, package))
    }

    pub fn from_package(path: impl AsRef<Path>, package: XpsPackage) -> Self {
        let path = path.as_ref();
        let doc_id = calculate_doc_id(path, package.total_size());
        debug!(
            path = %path.display(),
            pages = package.page_count(),
            document = %package.document_uri(),
            "xps package loaded"
        );
        Self {
            path: path.to_path_buf(),
            doc_id,
            package: Arc::new(package),
            options: Mutex::new(RasterOptions::default()),
        }
    }

    pub fn package(&self) -> &Arc<XpsPackage> {
        &self.package
    }

    pub fn raster_options(&self) -> RasterOptions {
        self.options
            .lock()
            .map(|options| *options)
            .unwrap_or_default()
    }

    pub fn set_raster_options(&self, options: RasterOptions) {
        if let Ok(mut current) = self.options.lock() {
            *current = options;
        }
    }
}

impl DocumentBackend for XpsDoc {
    fn path(&self) -> &Path {
        &self.path
    }

    fn doc_id(&self) -> u64 {
        self.doc_id
    }

    fn page_count(&self) -> usize {
        self.package.page_count()
    }

    fn page_size(&self, page: usize) -> PrintResult<PageSize> {
        self.check_page(page)?;
        self.package.page_size(page)
    }

    fn render_page(&self, page: usize, x_scale: f32, y_scale: f32) -> PrintResult<RgbaFrame> {
        self.check_page(page)?;
        for scale in [x_scale, y_scale] {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(PrintError::invalid_argument(
                    "scale must be a positive finite value",
                ));
            }
        }

        let size = self.package.page_size(page)?;
        let width = (size.width * x_scale).round().max(1.0) as u32;
        let height = (size.height * y_scale).round().max(1.0) as u32;
        PageRasterizer::new(&self.package, self.raster_options()).render_page(page, width, height)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::XpsDoc;
    use crate::backend::{DocumentBackend, open_backend_for_path, unique_temp_path};
    use crate::xps::build_xps;

    #[test]
    fn opens_package_and_renders_at_scale() {
        let path = unique_temp_path("doc").with_extension("xps");
        fs::write(&path, build_xps(2)).expect("package should be written");

        let doc = XpsDoc::open(&path).expect("xps should open");
        assert_eq!(doc.page_count(), 2);
        let size = doc.page_size(1).expect("size");
        assert_eq!((size.width, size.height), (200.0, 100.0));

        let frame = doc.render_page(0, 0.5, 0.5).expect("render");
        assert_eq!((frame.width, frame.height), (100, 50));
        assert!(doc.render_page(2, 1.0, 1.0).is_err_and(|err| err.is_unsupported_page()));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn dispatch_opens_xps_by_extension() {
        let path = unique_temp_path("dispatch").with_extension("oxps");
        fs::write(&path, build_xps(1)).expect("package should be written");

        let backend = open_backend_for_path(&path).expect("backend");
        assert_eq!(backend.page_count(), 1);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn rejects_directory() {
        let dir = std::env::temp_dir();
        assert!(XpsDoc::open(dir).is_err());
    }
}

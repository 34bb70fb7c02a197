use std::path::Path;
use std::sync::Arc;

use crate::error::{PrintError, PrintResult};

mod hayro;
mod traits;
mod vector;
mod xps;

pub use hayro::PdfDoc;
pub use traits::{DIPS_PER_INCH, DocumentBackend, PageRect, PageSize, RgbaFrame};
pub use vector::{FLATTEN_TOLERANCE, PageOp, outline_figures};
pub use xps::XpsDoc;

#[cfg(test)]
pub(crate) use hayro::tests::{build_pdf, build_pdf_from_streams, unique_temp_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Xps,
}

impl SourceKind {
    /// Classifies a path by extension (`.pdf`, `.xps`, `.oxps`, any case).
    pub fn from_path(path: impl AsRef<Path>) -> PrintResult<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        match extension.as_deref() {
            Some("pdf") => Ok(Self::Pdf),
            Some("xps") | Some("oxps") => Ok(Self::Xps),
            _ => Err(PrintError::unsupported(format!(
                "unsupported document type: {}",
                path.display()
            ))),
        }
    }
}

pub fn open_backend_for_path(path: impl AsRef<Path>) -> PrintResult<Arc<dyn DocumentBackend>> {
    let path = path.as_ref();
    match SourceKind::from_path(path)? {
        SourceKind::Pdf => PdfDoc::open(path).map(|doc| Arc::new(doc) as Arc<dyn DocumentBackend>),
        SourceKind::Xps => XpsDoc::open(path).map(|doc| Arc::new(doc) as Arc<dyn DocumentBackend>),
    }
}

#[cfg(test)]
mod tests {
    use super::SourceKind;

    #[test]
    fn source_kind_follows_extension_case_insensitively() {
        assert_eq!(SourceKind::from_path("a/b/report.PDF").ok(), Some(SourceKind::Pdf));
        assert_eq!(SourceKind::from_path("scan.oxps").ok(), Some(SourceKind::Xps));
        assert_eq!(SourceKind::from_path("scan.Xps").ok(), Some(SourceKind::Xps));
        assert!(SourceKind::from_path("notes.txt").is_err());
        assert!(SourceKind::from_path("no_extension").is_err());
    }
}

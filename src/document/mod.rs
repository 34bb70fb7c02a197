//! Print document page sources for PDF and XPS files.
//!
//! A document is opened without reading the file. The print host then
//! negotiates a preview ([`PrintDocumentPageSource::get_preview_page_collection`]),
//! drives it through [`PreviewPageCollection::paginate`] and
//! [`PreviewPageCollection::make_page`], and finally asks for the output
//! package with [`PrintDocumentPageSource::make_document`].

mod control;
mod format;
mod preview;
mod serializer;
mod session;
mod source;

#[cfg(test)]
mod tests;

use std::path::Path;

use crate::backend::SourceKind;
use crate::error::{PrintError, PrintResult};

pub use control::{CommandList, DeviceContext, DrawCommand, PrintControl, print_with_control};
pub use format::{
    DISCARD_CONTROL_PART, DocumentFormat, PdfFormat, PdfOptions, PdfPrintDocument,
    PdfPrintingMode, PrintDocument, SEQUENCE_PART, XpsFormat, XpsPrintDocument,
};
pub use preview::PreviewSettings;
pub use serializer::{PageSerializer, PassThroughPages, RasterizedPages, write_document};
pub use session::ProductionContext;
pub use source::{
    DocumentState, DocumentStatus, PreviewPageCollection, PrintDocumentPageSource,
    PrintDocumentSource, StatusCallback, SubscriptionId,
};

/// Opens a PDF or XPS document, chosen by file extension.
pub fn open_print_document(path: impl AsRef<Path>) -> PrintResult<Box<dyn PrintDocumentSource>> {
    open_print_document_with(path, DocumentOptions::default())
}

/// Per-format options used by [`open_print_document_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DocumentOptions {
    pub pdf: PdfOptions,
    pub xps: crate::xps::RasterOptions,
    pub preview: PreviewSettings,
}

pub fn open_print_document_with(
    path: impl AsRef<Path>,
    options: DocumentOptions,
) -> PrintResult<Box<dyn PrintDocumentSource>> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(PrintError::invalid_argument(
            "document path must not be empty",
        ));
    }

    match SourceKind::from_path(path)? {
        SourceKind::Pdf => Ok(Box::new(PdfPrintDocument::open_with(
            path,
            options.pdf,
            options.preview,
        )?)),
        SourceKind::Xps => Ok(Box::new(XpsPrintDocument::open_with(
            path,
            options.xps,
            options.preview,
        )?)),
    }
}

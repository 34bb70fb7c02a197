use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::{Seek, Write};

use tracing::{debug, trace};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::backend::PageSize;
use crate::error::{PrintError, PrintResult};
use crate::target::{
    CancelToken, PackageCompletion, PackageStatus, PackageWriter, StatusPublisher,
};

use super::markup::escape;
use super::model::{FixedPage, ResourceKind};
use super::package::{
    ContentTypes, NS_XPS, PartUri, Relationships, content_types, relationship_types,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Closed,
    Canceled,
    Failed,
}

struct DocumentEntry {
    name: PartUri,
    pages: Vec<(PartUri, PageSize)>,
}

/// Zip-backed XPS package writer.
///
/// Parts are streamed as pages arrive; the sequence, documents,
/// relationships and content types are written on [`PackageWriter::close`].
pub struct XpsPackageWriter<W: Write + Seek> {
    zip: Option<ZipWriter<W>>,
    finished: Option<W>,
    sequence: PartUri,
    discard_control: Option<PartUri>,
    documents: Vec<DocumentEntry>,
    written_parts: HashSet<String>,
    content_types: ContentTypes,
    cancel: CancelToken,
    status: Option<StatusPublisher>,
    job_id: u32,
    pages_written: u32,
    state: WriterState,
}

impl<W: Write + Seek> XpsPackageWriter<W> {
    pub fn new(writer: W, sequence: PartUri, discard_control: Option<PartUri>) -> Self {
        Self {
            zip: Some(ZipWriter::new(writer)),
            finished: None,
            sequence,
            discard_control,
            documents: Vec::new(),
            written_parts: HashSet::new(),
            content_types: ContentTypes::new(),
            cancel: CancelToken::new(),
            status: None,
            job_id: 0,
            pages_written: 0,
            state: WriterState::Open,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_status(mut self, publisher: StatusPublisher, job_id: u32) -> Self {
        self.status = Some(publisher);
        self.job_id = job_id;
        self
    }

    pub fn pages_written(&self) -> u32 {
        self.pages_written
    }

    /// The underlying writer once the package has been closed.
    pub fn into_inner(mut self) -> Option<W> {
        self.finished.take()
    }

    fn ensure_writable(&mut self) -> PrintResult<()> {
        match self.state {
            WriterState::Open => {}
            WriterState::Canceled => return Err(PrintError::Canceled),
            WriterState::Closed | WriterState::Failed => {
                return Err(PrintError::package("package writer is closed"));
            }
        }
        if self.cancel.is_canceled() {
            debug!(job_id = self.job_id, "package write rejected: job canceled");
            self.state = WriterState::Canceled;
            self.publish(PackageCompletion::Canceled);
            return Err(PrintError::Canceled);
        }
        Ok(())
    }

    fn publish(&self, completion: PackageCompletion) {
        let Some(status) = &self.status else {
            return;
        };
        let current_page = self
            .documents
            .last()
            .map(|document| document.pages.len() as u32)
            .unwrap_or(0);
        status.publish(PackageStatus {
            job_id: self.job_id,
            current_document: self.documents.len() as u32,
            current_page,
            current_page_total: self.pages_written,
            completion,
        });
    }

    fn write_part(
        &mut self,
        part: &PartUri,
        content_type: Option<&str>,
        data: &[u8],
        compress: bool,
    ) -> PrintResult<()> {
        if !self.written_parts.insert(part.key()) {
            return Err(PrintError::package(format!(
                "part {part} was already written"
            )));
        }
        let zip = self
            .zip
            .as_mut()
            .ok_or_else(|| PrintError::package("package writer is closed"))?;

        let method = if compress {
            zip::CompressionMethod::Deflated
        } else {
            zip::CompressionMethod::Stored
        };
        zip.start_file(part.zip_name(), SimpleFileOptions::default().compression_method(method))?;
        zip.write_all(data).map_err(|source| {
            PrintError::io_with_context(source, format!("failed to write part {part}"))
        })?;

        if let Some(content_type) = content_type {
            self.content_types.add_override(part, content_type);
        }
        Ok(())
    }

    fn fixed_document_markup(document: &DocumentEntry) -> String {
        let mut xml = String::new();
        let _ = write!(xml, r#"<FixedDocument xmlns="{NS_XPS}">"#);
        for (page, size) in &document.pages {
            let _ = write!(
                xml,
                r#"<PageContent Source="{}" Width="{}" Height="{}"/>"#,
                escape(page.as_str()),
                size.width,
                size.height
            );
        }
        xml.push_str("</FixedDocument>");
        xml
    }

    fn finish_package(&mut self) -> PrintResult<()> {
        let documents = std::mem::take(&mut self.documents);
        let mut sequence = String::new();
        let _ = write!(sequence, r#"<FixedDocumentSequence xmlns="{NS_XPS}">"#);
        for document in &documents {
            let markup = Self::fixed_document_markup(document);
            self.write_part(
                &document.name,
                Some(content_types::FIXED_DOCUMENT),
                markup.as_bytes(),
                true,
            )?;
            let _ = write!(
                sequence,
                r#"<DocumentReference Source="{}"/>"#,
                escape(document.name.as_str())
            );
        }
        sequence.push_str("</FixedDocumentSequence>");
        self.documents = documents;

        let sequence_part = self.sequence.clone();
        self.write_part(
            &sequence_part,
            Some(content_types::FIXED_DOCUMENT_SEQUENCE),
            sequence.as_bytes(),
            true,
        )?;

        let mut root_rels = Relationships::new();
        root_rels.add(
            relationship_types::FIXED_REPRESENTATION,
            sequence_part.as_str(),
        );
        if let Some(discard) = self.discard_control.clone() {
            let markup = format!(r#"<DiscardControl xmlns="{NS_XPS}/discard"/>"#);
            self.write_part(
                &discard,
                Some(content_types::DISCARD_CONTROL),
                markup.as_bytes(),
                true,
            )?;
            root_rels.add(relationship_types::DISCARD_CONTROL, discard.as_str());
        }
        let root_rels_part = PartUri::new("/_rels/.rels")?;
        self.write_part(&root_rels_part, None, root_rels.to_xml().as_bytes(), true)?;

        let content_types = self.content_types.to_xml();
        let content_types_part = PartUri::new("/[Content_Types].xml")?;
        self.write_part(&content_types_part, None, content_types.as_bytes(), true)?;

        let zip = self
            .zip
            .take()
            .ok_or_else(|| PrintError::package("package writer is closed"))?;
        self.finished = Some(zip.finish()?);
        Ok(())
    }
}

impl<W: Write + Seek + Send> PackageWriter for XpsPackageWriter<W> {
    fn start_new_document(&mut self, name: &PartUri) -> PrintResult<()> {
        self.ensure_writable()?;
        if self
            .documents
            .iter()
            .any(|document| document.name.key() == name.key())
        {
            return Err(PrintError::package(format!(
                "document {name} was already started"
            )));
        }
        debug!(document = %name, "starting package document");
        self.documents.push(DocumentEntry {
            name: name.clone(),
            pages: Vec::new(),
        });
        Ok(())
    }

    fn add_page(&mut self, page: FixedPage) -> PrintResult<()> {
        self.ensure_writable()?;
        if self.documents.is_empty() {
            return Err(PrintError::package("add_page called before start_new_document"));
        }
        if self.written_parts.contains(&page.name.key()) {
            return Err(PrintError::package(format!(
                "page {} was already written",
                page.name
            )));
        }

        let mut page_rels = Relationships::new();
        for resource in &page.resources {
            if !self.written_parts.contains(&resource.uri.key()) {
                let compress = resource.kind != ResourceKind::Image;
                self.write_part(
                    &resource.uri,
                    Some(&resource.content_type),
                    &resource.data,
                    compress,
                )?;
            }
            page_rels.add(relationship_types::REQUIRED_RESOURCE, resource.uri.as_str());
        }

        let markup = page.to_markup()?;
        self.write_part(
            &page.name,
            Some(content_types::FIXED_PAGE),
            markup.as_bytes(),
            true,
        )?;
        if !page_rels.is_empty() {
            let rels_part = page.name.relationships_part();
            self.write_part(&rels_part, None, page_rels.to_xml().as_bytes(), true)?;
        }

        self.pages_written += 1;
        if let Some(document) = self.documents.last_mut() {
            document.pages.push((page.name.clone(), page.size));
        }
        trace!(page = %page.name, total = self.pages_written, "page added to package");
        self.publish(PackageCompletion::InProgress);
        Ok(())
    }

    fn close(&mut self) -> PrintResult<()> {
        self.ensure_writable()?;
        if let Err(err) = self.finish_package() {
            self.state = WriterState::Failed;
            self.publish(PackageCompletion::Failed);
            return Err(err);
        }
        self.state = WriterState::Closed;
        debug!(
            job_id = self.job_id,
            pages = self.pages_written,
            "package closed"
        );
        self.publish(PackageCompletion::Submitted);
        Ok(())
    }
}

impl<W: Write + Seek> Drop for XpsPackageWriter<W> {
    fn drop(&mut self) {
        if self.state == WriterState::Open {
            debug!(job_id = self.job_id, "package writer dropped before close");
            if self.cancel.is_canceled() {
                self.state = WriterState::Canceled;
                self.publish(PackageCompletion::Canceled);
            } else {
                self.state = WriterState::Failed;
                self.publish(PackageCompletion::Failed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use zip::ZipArchive;

    use super::XpsPackageWriter;
    use crate::backend::{PageRect, PageSize};
    use crate::error::PrintError;
    use crate::target::{CancelToken, PackageWriter};
    use crate::xps::model::{
        Brush, FixedPage, Geometry, GeometryFigure, PageResource, SolidColor, XpsPath,
    };
    use crate::xps::package::PartUri;

    fn part(name: &str) -> PartUri {
        PartUri::new(name).expect("valid part name")
    }

    fn solid_page(index: usize, shared_image: Option<&PageResource>) -> FixedPage {
        let size = PageSize::new(100.0, 50.0);
        let mut page = FixedPage::new(part(&format!("/page{index}")), size);
        page.add_path(XpsPath::filled(
            Geometry::new(
                format!("geometry{index}"),
                vec![GeometryFigure::rectangle(PageRect::from_size(size))],
            ),
            Brush::Solid(SolidColor::BLACK),
        ));
        if let Some(resource) = shared_image {
            page.resources.push(resource.clone());
        }
        page
    }

    fn read_entry(archive: &mut ZipArchive<Cursor<Vec<u8>>>, name: &str) -> String {
        let mut file = archive.by_name(name).expect("entry should exist");
        let mut text = String::new();
        file.read_to_string(&mut text).expect("entry should be utf-8");
        text
    }

    #[test]
    fn close_writes_sequence_documents_and_content_types() {
        let mut writer =
            XpsPackageWriter::new(Cursor::new(Vec::new()), part("/seq"), Some(part("/discard")));
        writer.start_new_document(&part("/report")).expect("document starts");
        let image = PageResource::png(part("/shared.png"), vec![1, 2, 3]);
        writer.add_page(solid_page(0, Some(&image))).expect("page 0");
        writer.add_page(solid_page(1, Some(&image))).expect("page 1");
        writer.close().expect("close succeeds");
        assert_eq!(writer.pages_written(), 2);

        let bytes = writer.into_inner().expect("closed writer returns output").into_inner();
        let mut archive = ZipArchive::new(Cursor::new(bytes)).expect("valid zip");

        let seq = read_entry(&mut archive, "seq");
        assert!(seq.contains(r#"<DocumentReference Source="/report"/>"#));
        let doc = read_entry(&mut archive, "report");
        let first = doc.find("/page0").expect("page0 listed");
        let second = doc.find("/page1").expect("page1 listed");
        assert!(first < second);
        let rels = read_entry(&mut archive, "_rels/.rels");
        assert!(rels.contains(r#"Target="/seq""#));
        assert!(rels.contains("discard-control"));
        let page_rels = read_entry(&mut archive, "_rels/page1.rels");
        assert!(page_rels.contains("/shared.png"));
        let types = read_entry(&mut archive, "[Content_Types].xml");
        assert!(types.contains(r#"PartName="/page1""#));
        assert!(archive.by_name("shared.png").is_ok());
    }

    #[test]
    fn add_page_after_cancel_fails_with_canceled() {
        let cancel = CancelToken::new();
        let mut writer = XpsPackageWriter::new(Cursor::new(Vec::new()), part("/seq"), None)
            .with_cancel_token(cancel.clone());
        writer.start_new_document(&part("/doc")).expect("document starts");
        writer.add_page(solid_page(0, None)).expect("first page");

        cancel.cancel();
        let err = writer.add_page(solid_page(1, None)).expect_err("canceled");
        assert!(matches!(err, PrintError::Canceled));
        assert!(matches!(writer.close(), Err(PrintError::Canceled)));
        assert_eq!(writer.pages_written(), 1);
    }

    #[test]
    fn duplicate_page_names_are_rejected() {
        let mut writer = XpsPackageWriter::new(Cursor::new(Vec::new()), part("/seq"), None);
        writer.start_new_document(&part("/doc")).expect("document starts");
        writer.add_page(solid_page(0, None)).expect("first page");
        assert!(writer.add_page(solid_page(0, None)).is_err());
    }

    #[test]
    fn add_page_requires_a_started_document() {
        let mut writer = XpsPackageWriter::new(Cursor::new(Vec::new()), part("/seq"), None);
        assert!(writer.add_page(solid_page(0, None)).is_err());
    }
}

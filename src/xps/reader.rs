use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use zip::ZipArchive;

use crate::backend::PageSize;
use crate::error::{PrintError, PrintResult};

use super::markup::XmlElement;
use super::model::{FixedPage, PageContent, PageResource, ResourceKind};
use super::package::{
    ContentTypes, NS_OXPS, NS_XPS, PartUri, Relationships, content_types, relationship_types,
};

/// Largest decompressed part accepted from a package.
const MAX_PART_BYTES: u64 = 256 * 1024 * 1024;
/// Largest decompressed package accepted, all parts together.
const MAX_PACKAGE_BYTES: u64 = 1024 * 1024 * 1024;
/// Upper bound on the buffer reserved up front from a zip header's size.
const MAX_PREALLOCATION: u64 = 1024 * 1024;

/// Reads one zip entry, trusting its declared size only as a capacity hint.
fn read_part(reader: impl Read, name: &str, declared: u64, limit: u64) -> PrintResult<Vec<u8>> {
    let mut data = Vec::with_capacity(declared.min(limit).min(MAX_PREALLOCATION) as usize);
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut data)
        .map_err(|source| {
            PrintError::io_with_context(source, format!("failed to read part {name}"))
        })?;
    if data.len() as u64 > limit {
        return Err(PrintError::package(format!(
            "part {name} exceeds {limit} bytes when decompressed"
        )));
    }
    Ok(data)
}

#[derive(Debug, Clone, PartialEq)]
pub struct XpsPageRef {
    pub uri: PartUri,
    pub width: Option<f32>,
    pub height: Option<f32>,
}

/// An XPS or OpenXPS package read fully into memory.
///
/// Only the first document of the sequence is exposed.
#[derive(Debug)]
pub struct XpsPackage {
    path: PathBuf,
    parts: HashMap<String, (PartUri, Arc<[u8]>)>,
    content_types: ContentTypes,
    document: PartUri,
    pages: Vec<XpsPageRef>,
}

impl XpsPackage {
    pub fn open(path: impl AsRef<Path>) -> PrintResult<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(PrintError::invalid_argument("xps path must not be empty"));
        }
        let file = File::open(path).map_err(|source| {
            PrintError::io_with_context(source, format!("failed to open {}", path.display()))
        })?;
        Self::from_reader(BufReader::new(file), path)
    }

    pub fn from_reader<R: Read + Seek>(reader: R, path: impl AsRef<Path>) -> PrintResult<Self> {
        let mut archive = ZipArchive::new(reader)?;
        let mut parts = HashMap::new();
        let mut pieces: BTreeMap<String, Vec<(u32, Vec<u8>)>> = BTreeMap::new();
        let mut total_bytes = 0_u64;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            let declared = entry.size();
            let data = read_part(&mut entry, &name, declared, MAX_PART_BYTES)?;
            total_bytes = total_bytes.saturating_add(data.len() as u64);
            if total_bytes > MAX_PACKAGE_BYTES {
                return Err(PrintError::package(format!(
                    "package exceeds {MAX_PACKAGE_BYTES} bytes when decompressed"
                )));
            }

            match split_piece_name(&name) {
                Some((base, piece)) => pieces.entry(base.to_string()).or_default().push((piece, data)),
                None => {
                    let Ok(part) = PartUri::from_zip_name(&name) else {
                        debug!(entry = %name, "skipping zip entry with an invalid part name");
                        continue;
                    };
                    parts.insert(part.key(), (part, Arc::from(data)));
                }
            }
        }

        for (base, mut chunks) in pieces {
            chunks.sort_by_key(|(piece, _)| *piece);
            let data: Vec<u8> = chunks.into_iter().flat_map(|(_, bytes)| bytes).collect();
            let part = PartUri::from_zip_name(&base)?;
            parts.insert(part.key(), (part, Arc::from(data)));
        }

        let content_types = match parts.get("/[content_types].xml") {
            Some((_, data)) => ContentTypes::parse(&decode_xml_text(data)?)?,
            None => return Err(PrintError::package("package has no [Content_Types].xml")),
        };

        let mut package = Self {
            path: path.as_ref().to_path_buf(),
            parts,
            content_types,
            document: PartUri::new("/unresolved")?,
            pages: Vec::new(),
        };
        package.load_first_document()?;
        Ok(package)
    }

    fn load_first_document(&mut self) -> PrintResult<()> {
        let root_rels = self.relationships_of_root()?;
        let fixed = root_rels
            .first_of(&[
                relationship_types::FIXED_REPRESENTATION,
                relationship_types::OXPS_FIXED_REPRESENTATION,
            ])
            .ok_or_else(|| PrintError::package("package has no fixed representation"))?;
        let sequence_uri = PartUri::from_root(&fixed.target)?;

        let sequence = self.parse_part(&sequence_uri)?;
        let mut references = sequence.children_named("DocumentReference");
        let first = references
            .next()
            .and_then(|reference| reference.attr("Source"))
            .ok_or_else(|| PrintError::package("document sequence has no documents"))?;
        let ignored = references.count();
        if ignored > 0 {
            debug!(ignored, "only the first document of the sequence is used");
        }
        let document_uri = sequence_uri.resolve(first)?;

        let document = self.parse_part(&document_uri)?;
        let mut pages = Vec::new();
        for content in document.children_named("PageContent") {
            let Some(source) = content.attr("Source") else {
                continue;
            };
            pages.push(XpsPageRef {
                uri: document_uri.resolve(source)?,
                width: content.attr_f32("Width"),
                height: content.attr_f32("Height"),
            });
        }

        self.document = document_uri;
        self.pages = pages;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_size(&self) -> usize {
        self.parts.values().map(|(_, data)| data.len()).sum()
    }

    pub fn document_uri(&self) -> &PartUri {
        &self.document
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_ref(&self, page: usize) -> PrintResult<&XpsPageRef> {
        self.pages
            .get(page)
            .ok_or(PrintError::unsupported_page(page, self.pages.len()))
    }

    pub fn part(&self, uri: &PartUri) -> Option<Arc<[u8]>> {
        self.parts.get(&uri.key()).map(|(_, data)| Arc::clone(data))
    }

    pub fn content_type(&self, uri: &PartUri) -> String {
        if let Some(content_type) = self.content_types.content_type_for(uri) {
            return content_type.to_string();
        }
        let fallback = match uri.extension().map(str::to_ascii_lowercase).as_deref() {
            Some("png") => content_types::PNG,
            Some("jpg") | Some("jpeg") => content_types::JPEG,
            Some("tif") | Some("tiff") | Some("wdp") => content_types::TIFF,
            Some("odttf") => content_types::OBFUSCATED_FONT,
            Some("ttf") | Some("otf") => content_types::FONT,
            Some("dict") => content_types::RESOURCE_DICTIONARY,
            _ => content_types::OCTET_STREAM,
        };
        fallback.to_string()
    }

    pub fn relationships_of(&self, uri: &PartUri) -> PrintResult<Relationships> {
        match self.part(&uri.relationships_part()) {
            Some(data) => Relationships::parse(&decode_xml_text(&data)?),
            None => Ok(Relationships::new()),
        }
    }

    fn relationships_of_root(&self) -> PrintResult<Relationships> {
        let root = PartUri::new("/_rels/.rels")?;
        let data = self
            .part(&root)
            .ok_or_else(|| PrintError::package("package has no root relationships"))?;
        Relationships::parse(&decode_xml_text(&data)?)
    }

    pub fn part_text(&self, uri: &PartUri) -> PrintResult<String> {
        let data = self
            .part(uri)
            .ok_or_else(|| PrintError::package(format!("missing part {uri}")))?;
        decode_xml_text(&data)
    }

    fn parse_part(&self, uri: &PartUri) -> PrintResult<XmlElement> {
        XmlElement::parse(&self.part_text(uri)?)
    }

    pub fn fixed_page(&self, page: usize) -> PrintResult<XmlElement> {
        let page_ref = self.page_ref(page)?;
        self.parse_part(&page_ref.uri)
    }

    pub fn page_size(&self, page: usize) -> PrintResult<PageSize> {
        let page_ref = self.page_ref(page)?;
        let markup = self.fixed_page(page)?;
        let width = markup.attr_f32("Width").or(page_ref.width);
        let height = markup.attr_f32("Height").or(page_ref.height);
        match (width, height) {
            (Some(width), Some(height)) if width > 0.0 && height > 0.0 => {
                Ok(PageSize::new(width, height))
            }
            _ => Err(PrintError::package(format!(
                "page {} has no usable size",
                page_ref.uri
            ))),
        }
    }

    /// Parts the page needs: its required-resource relationships plus any
    /// image, font or dictionary referenced from the markup.
    pub fn page_resources(&self, page: usize) -> PrintResult<Vec<PageResource>> {
        let page_uri = self.page_ref(page)?.uri.clone();
        let mut seen = HashSet::new();
        let mut uris = Vec::new();

        let rels = self.relationships_of(&page_uri)?;
        for rel in rels
            .by_type(relationship_types::REQUIRED_RESOURCE)
            .chain(rels.by_type(relationship_types::OXPS_REQUIRED_RESOURCE))
        {
            if let Ok(uri) = page_uri.resolve(&rel.target)
                && seen.insert(uri.key())
            {
                uris.push(uri);
            }
        }

        let mut pending = vec![(page_uri.clone(), self.fixed_page(page)?)];
        while let Some((source, markup)) = pending.pop() {
            for reference in referenced_parts(&markup) {
                let Ok(uri) = source.resolve(&reference) else {
                    continue;
                };
                if !seen.insert(uri.key()) {
                    continue;
                }
                if self.content_type(&uri) == content_types::RESOURCE_DICTIONARY
                    && let Ok(dictionary) = self.parse_part(&uri)
                {
                    pending.push((uri.clone(), dictionary));
                }
                uris.push(uri);
            }
        }

        let mut resources = Vec::with_capacity(uris.len());
        for uri in uris {
            let Some(data) = self.part(&uri) else {
                warn!(page = %page_uri, resource = %uri, "page references a missing part");
                continue;
            };
            let content_type = self.content_type(&uri);
            resources.push(PageResource {
                kind: ResourceKind::from_content_type(&content_type),
                uri,
                content_type,
                data,
            });
        }
        Ok(resources)
    }

    /// The page as-is, ready to be appended to another package.
    pub fn pass_through_page(&self, page: usize) -> PrintResult<FixedPage> {
        let page_ref = self.page_ref(page)?;
        let markup = self.part_text(&page_ref.uri)?.replace(NS_OXPS, NS_XPS);
        Ok(FixedPage {
            name: page_ref.uri.clone(),
            size: self.page_size(page)?,
            language: None,
            content: PageContent::Markup(markup),
            resources: self.page_resources(page)?,
        })
    }
}

fn referenced_parts(markup: &XmlElement) -> Vec<String> {
    let mut references = Vec::new();
    markup.visit(&mut |element| {
        for attribute in ["ImageSource", "FontUri", "Source"] {
            if attribute == "Source" && element.name != "ResourceDictionary" {
                continue;
            }
            if let Some(value) = element.attr(attribute) {
                let value = value.trim();
                if !value.is_empty() && !value.starts_with('{') {
                    references.push(value.to_string());
                }
            }
        }
    });
    references
}

/// Splits `Documents/1/Pages/1.fpage/[0].piece` into its part and index.
fn split_piece_name(name: &str) -> Option<(&str, u32)> {
    let (base, file) = name.rsplit_once('/')?;
    let rest = file.strip_prefix('[')?;
    let (index, suffix) = rest.split_once(']')?;
    let suffix = suffix.to_ascii_lowercase();
    if suffix != ".piece" && suffix != ".last.piece" {
        return None;
    }
    Some((base, index.parse().ok()?))
}

/// Decodes an XML part that may be UTF-8 or UTF-16 with a byte order mark.
pub(crate) fn decode_xml_text(data: &[u8]) -> PrintResult<String> {
    let utf16 = |bytes: &[u8], little_endian: bool| -> PrintResult<String> {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| {
                if little_endian {
                    u16::from_le_bytes([pair[0], pair[1]])
                } else {
                    u16::from_be_bytes([pair[0], pair[1]])
                }
            })
            .collect();
        String::from_utf16(&units).map_err(|_| PrintError::package("invalid UTF-16 markup"))
    };

    match data {
        [0xEF, 0xBB, 0xBF, rest @ ..] => std::str::from_utf8(rest)
            .map(str::to_string)
            .map_err(|_| PrintError::package("invalid UTF-8 markup")),
        [0xFF, 0xFE, rest @ ..] => utf16(rest, true),
        [0xFE, 0xFF, rest @ ..] => utf16(rest, false),
        _ => std::str::from_utf8(data)
            .map(str::to_string)
            .map_err(|_| PrintError::package("invalid UTF-8 markup")),
    }
}

//! Open Packaging Conventions plumbing shared by the XPS reader and writer:
//! part names, `[Content_Types].xml` and `.rels` parts.

use std::collections::BTreeMap;
use std::fmt;

use quick_xml::events::Event;

use crate::error::{PrintError, PrintResult};

use super::markup::{XmlParser, escape};

pub const NS_XPS: &str = "http://schemas.microsoft.com/xps/2005/06";
pub const NS_OXPS: &str = "http://schemas.openxps.org/oxps/v1.0";
pub const NS_RESOURCE_KEY: &str = "http://schemas.microsoft.com/xps/2005/06/resourcedictionary-key";
pub const NS_RELATIONSHIPS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
pub const NS_CONTENT_TYPES: &str = "http://schemas.openxmlformats.org/package/2006/content-types";

pub mod relationship_types {
    pub const FIXED_REPRESENTATION: &str =
        "http://schemas.microsoft.com/xps/2005/06/fixedrepresentation";
    pub const OXPS_FIXED_REPRESENTATION: &str =
        "http://schemas.openxps.org/oxps/v1.0/fixedrepresentation";
    pub const REQUIRED_RESOURCE: &str = "http://schemas.microsoft.com/xps/2005/06/required-resource";
    pub const OXPS_REQUIRED_RESOURCE: &str =
        "http://schemas.openxps.org/oxps/v1.0/required-resource";
    pub const DISCARD_CONTROL: &str = "http://schemas.microsoft.com/xps/2005/06/discard-control";
}

pub mod content_types {
    pub const RELATIONSHIPS: &str = "application/vnd.openxmlformats-package.relationships+xml";
    pub const FIXED_DOCUMENT_SEQUENCE: &str =
        "application/vnd.ms-package.xps-fixeddocumentsequence+xml";
    pub const FIXED_DOCUMENT: &str = "application/vnd.ms-package.xps-fixeddocument+xml";
    pub const FIXED_PAGE: &str = "application/vnd.ms-package.xps-fixedpage+xml";
    pub const RESOURCE_DICTIONARY: &str = "application/vnd.ms-package.xps-resourcedictionary+xml";
    pub const DISCARD_CONTROL: &str = "application/vnd.ms-package.xps-discard-control+xml";
    pub const OBFUSCATED_FONT: &str = "application/vnd.ms-package.obfuscated-opentype";
    pub const FONT: &str = "application/vnd.ms-opentype";
    pub const PNG: &str = "image/png";
    pub const JPEG: &str = "image/jpeg";
    pub const TIFF: &str = "image/tiff";
    pub const OCTET_STREAM: &str = "application/octet-stream";
}

/// An absolute part name such as `/Documents/1/Pages/1.fpage`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartUri(String);

impl PartUri {
    pub fn new(name: impl Into<String>) -> PrintResult<Self> {
        let name = name.into();
        if !name.starts_with('/') || name.len() < 2 || name.ends_with('/') {
            return Err(PrintError::package(format!("invalid part name: {name:?}")));
        }
        if name.contains('\\') || name.contains('#') || name.contains('?') {
            return Err(PrintError::package(format!("invalid part name: {name:?}")));
        }
        if name[1..]
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(PrintError::package(format!("invalid part name: {name:?}")));
        }
        Ok(Self(name))
    }

    pub fn from_zip_name(name: &str) -> PrintResult<Self> {
        Self::new(format!("/{}", name.trim_start_matches('/')))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn zip_name(&self) -> &str {
        &self.0[1..]
    }

    /// Part names compare case-insensitively inside a package.
    pub fn key(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    pub fn directory(&self) -> &str {
        match self.0.rfind('/') {
            Some(index) => &self.0[..index],
            None => "",
        }
    }

    pub fn file_name(&self) -> &str {
        match self.0.rfind('/') {
            Some(index) => &self.0[index + 1..],
            None => &self.0,
        }
    }

    pub fn extension(&self) -> Option<&str> {
        let file_name = self.file_name();
        file_name
            .rfind('.')
            .filter(|index| *index > 0)
            .map(|index| &file_name[index + 1..])
    }

    /// Resolves a reference found in this part (absolute or relative).
    pub fn resolve(&self, reference: &str) -> PrintResult<Self> {
        let reference = reference.trim();
        let reference = reference.split('#').next().unwrap_or_default();
        if reference.is_empty() {
            return Err(PrintError::package("empty part reference"));
        }

        let joined = if reference.starts_with('/') {
            reference.to_string()
        } else {
            format!("{}/{}", self.directory(), reference)
        };
        Self::normalized(&joined, reference)
    }

    /// Resolves a reference made from the package root (`/_rels/.rels`).
    pub fn from_root(reference: &str) -> PrintResult<Self> {
        let reference = reference.trim();
        Self::normalized(&format!("/{reference}"), reference)
    }

    fn normalized(joined: &str, reference: &str) -> PrintResult<Self> {
        let mut segments: Vec<&str> = Vec::new();
        for segment in joined.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PrintError::package(format!(
                            "part reference escapes the package: {reference}"
                        )));
                    }
                }
                other => segments.push(other),
            }
        }
        Self::new(format!("/{}", segments.join("/")))
    }

    pub fn relationships_part(&self) -> Self {
        Self(format!("{}/_rels/{}.rels", self.directory(), self.file_name()))
    }
}

impl fmt::Display for PartUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContentTypes {
    defaults: BTreeMap<String, String>,
    overrides: BTreeMap<String, (PartUri, String)>,
}

impl ContentTypes {
    pub fn new() -> Self {
        let mut types = Self::default();
        types.add_default("rels", content_types::RELATIONSHIPS);
        types
    }

    pub fn parse(content: &str) -> PrintResult<Self> {
        let mut result = Self::default();
        let mut reader = XmlParser::from_string(content);
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e)) => {
                    let name = e.name();
                    if XmlParser::matches_element(name.as_ref(), "Default") {
                        if let (Some(ext), Some(ct)) = (
                            XmlParser::get_attribute(e, b"Extension"),
                            XmlParser::get_attribute(e, b"ContentType"),
                        ) {
                            result.add_default(&ext, &ct);
                        }
                    } else if XmlParser::matches_element(name.as_ref(), "Override")
                        && let (Some(part), Some(ct)) = (
                            XmlParser::get_attribute(e, b"PartName"),
                            XmlParser::get_attribute(e, b"ContentType"),
                        )
                        && let Ok(part) = PartUri::new(part)
                    {
                        result.add_override(&part, &ct);
                    }
                }
                Ok(Event::Eof) => break,
                Err(source) => return Err(PrintError::xml("[Content_Types].xml", source)),
                _ => {}
            }
            buf.clear();
        }

        Ok(result)
    }

    pub fn add_default(&mut self, extension: &str, content_type: &str) {
        self.defaults
            .insert(extension.to_ascii_lowercase(), content_type.to_string());
    }

    pub fn add_override(&mut self, part: &PartUri, content_type: &str) {
        self.overrides
            .insert(part.key(), (part.clone(), content_type.to_string()));
    }

    pub fn content_type_for(&self, part: &PartUri) -> Option<&str> {
        if let Some((_part, content_type)) = self.overrides.get(&part.key()) {
            return Some(content_type);
        }
        part.extension()
            .and_then(|ext| self.defaults.get(&ext.to_ascii_lowercase()))
            .map(String::as_str)
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        xml.push_str(&format!(r#"<Types xmlns="{NS_CONTENT_TYPES}">"#));
        for (extension, content_type) in &self.defaults {
            xml.push_str(&format!(
                r#"<Default Extension="{}" ContentType="{}"/>"#,
                escape(extension),
                escape(content_type)
            ));
        }
        for (part, content_type) in self.overrides.values() {
            xml.push_str(&format!(
                r#"<Override PartName="{}" ContentType="{}"/>"#,
                escape(part.as_str()),
                escape(content_type)
            ));
        }
        xml.push_str("</Types>");
        xml
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub rel_type: String,
    pub target: String,
}

#[derive(Debug, Clone, Default)]
pub struct Relationships {
    entries: Vec<Relationship>,
    next_id: u32,
}

impl Relationships {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    pub fn parse(content: &str) -> PrintResult<Self> {
        let mut result = Self::new();
        let mut reader = XmlParser::from_string(content);
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e)) => {
                    if XmlParser::matches_element(e.name().as_ref(), "Relationship") {
                        let id = XmlParser::get_attribute(e, b"Id").unwrap_or_default();
                        let rel_type = XmlParser::get_attribute(e, b"Type").ok_or_else(|| {
                            PrintError::package("relationship without a Type attribute")
                        })?;
                        let target = XmlParser::get_attribute(e, b"Target").ok_or_else(|| {
                            PrintError::package("relationship without a Target attribute")
                        })?;
                        result.entries.push(Relationship {
                            id,
                            rel_type,
                            target,
                        });
                    }
                }
                Ok(Event::Eof) => break,
                Err(source) => return Err(PrintError::xml("relationships part", source)),
                _ => {}
            }
            buf.clear();
        }

        result.next_id = result.entries.len() as u32 + 1;
        Ok(result)
    }

    pub fn add(&mut self, rel_type: &str, target: &str) -> String {
        let id = format!("R{}", self.next_id);
        self.next_id += 1;
        self.entries.push(Relationship {
            id: id.clone(),
            rel_type: rel_type.to_string(),
            target: target.to_string(),
        });
        id
    }

    pub fn by_type<'a>(&'a self, rel_type: &'a str) -> impl Iterator<Item = &'a Relationship> {
        self.entries
            .iter()
            .filter(move |rel| rel.rel_type == rel_type)
    }

    pub fn first_of(&self, rel_types: &[&str]) -> Option<&Relationship> {
        self.entries
            .iter()
            .find(|rel| rel_types.contains(&rel.rel_type.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        xml.push_str(&format!(r#"<Relationships xmlns="{NS_RELATIONSHIPS}">"#));
        for rel in &self.entries {
            xml.push_str(&format!(
                r#"<Relationship Id="{}" Type="{}" Target="{}"/>"#,
                escape(&rel.id),
                escape(&rel.rel_type),
                escape(&rel.target)
            ));
        }
        xml.push_str("</Relationships>");
        xml
    }
}

#[cfg(test)]
mod tests {
    use super::{ContentTypes, PartUri, Relationships, content_types, relationship_types};

    #[test]
    fn part_uri_rejects_relative_and_dotted_names() {
        assert!(PartUri::new("/Documents/1/FixedDocument.fdoc").is_ok());
        assert!(PartUri::new("Documents/1").is_err());
        assert!(PartUri::new("/a//b").is_err());
        assert!(PartUri::new("/a/../b").is_err());
        assert!(PartUri::new("/").is_err());
    }

    #[test]
    fn resolve_handles_relative_and_absolute_references() {
        let page = PartUri::new("/Documents/1/Pages/1.fpage").expect("valid part");

        let font = page.resolve("../Resources/Fonts/A.odttf").expect("relative");
        assert_eq!(font.as_str(), "/Documents/1/Resources/Fonts/A.odttf");
        let image = page.resolve("/Resources/img.png").expect("absolute");
        assert_eq!(image.as_str(), "/Resources/img.png");
        assert!(page.resolve("../../../../x").is_err());
    }

    #[test]
    fn relationships_part_sits_next_to_the_source() {
        let page = PartUri::new("/Documents/1/Pages/1.fpage").expect("valid part");
        assert_eq!(
            page.relationships_part().as_str(),
            "/Documents/1/Pages/_rels/1.fpage.rels"
        );
        let seq = PartUri::new("/seq").expect("valid part");
        assert_eq!(seq.relationships_part().as_str(), "/_rels/seq.rels");
    }

    #[test]
    fn content_types_prefer_overrides_over_defaults() {
        let mut types = ContentTypes::new();
        types.add_default("png", content_types::PNG);
        let page = PartUri::new("/page0").expect("valid part");
        types.add_override(&page, content_types::FIXED_PAGE);

        let parsed = ContentTypes::parse(&types.to_xml()).expect("content types parse");
        assert_eq!(parsed.content_type_for(&page), Some(content_types::FIXED_PAGE));
        let image = PartUri::new("/Resources/A.PNG").expect("valid part");
        assert_eq!(parsed.content_type_for(&image), Some(content_types::PNG));
        let unknown = PartUri::new("/other.bin").expect("valid part");
        assert_eq!(parsed.content_type_for(&unknown), None);
    }

    #[test]
    fn relationships_round_trip_through_xml() {
        let mut rels = Relationships::new();
        rels.add(relationship_types::FIXED_REPRESENTATION, "/seq");
        rels.add(relationship_types::REQUIRED_RESOURCE, "/image0");

        let parsed = Relationships::parse(&rels.to_xml()).expect("rels parse");
        assert_eq!(parsed.len(), 2);
        let fixed = parsed
            .first_of(&[
                relationship_types::OXPS_FIXED_REPRESENTATION,
                relationship_types::FIXED_REPRESENTATION,
            ])
            .expect("fixed representation should be present");
        assert_eq!(fixed.target, "/seq");
    }
}

use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::{PrintError, PrintResult};

pub(crate) fn escape(value: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(value)
}

/// Helpers over `quick-xml` for the small flat parts (rels, content types).
pub struct XmlParser;

impl XmlParser {
    pub fn from_string(content: &str) -> Reader<&[u8]> {
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);
        reader
    }

    pub fn get_attribute(event: &BytesStart, name: &[u8]) -> Option<String> {
        event
            .attributes()
            .filter_map(|attr| attr.ok())
            .find(|attr| attr.key.as_ref() == name)
            .map(|attr| match attr.unescape_value() {
                Ok(value) => value.into_owned(),
                Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
            })
    }

    /// Matches `expected` with or without a namespace prefix.
    pub fn matches_element(name: &[u8], expected: &str) -> bool {
        let name = std::str::from_utf8(name).unwrap_or("");
        local_part(name) == expected
    }
}

fn local_part(name: &str) -> &str {
    match name.rfind(':') {
        Some(index) => &name[index + 1..],
        None => name,
    }
}

/// Element tree of a fixed-content part. Text nodes are dropped; fixed
/// content carries everything in attributes and child elements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn parse(content: &str) -> PrintResult<Self> {
        let mut reader = XmlParser::from_string(content);
        let mut buf = Vec::new();
        let mut stack: Vec<XmlElement> = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => stack.push(Self::from_start(e)?),
                Ok(Event::Empty(ref e)) => {
                    let element = Self::from_start(e)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::End(_)) => {
                    let Some(element) = stack.pop() else {
                        return Err(PrintError::package("unbalanced end tag"));
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::Eof) => {
                    return Err(PrintError::package("markup has no root element"));
                }
                Err(source) => return Err(PrintError::xml("fixed content markup", source)),
                _ => {}
            }
            buf.clear();
        }
    }

    fn from_start(event: &BytesStart) -> PrintResult<Self> {
        let name = String::from_utf8_lossy(event.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in event.attributes() {
            let attr = attr.map_err(|source| {
                PrintError::xml(format!("attribute of <{name}>"), quick_xml::Error::from(source))
            })?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|source| PrintError::xml(format!("attribute {key}"), source))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            children: Vec::new(),
        })
    }

    /// Looks an attribute up by qualified or local name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .or_else(|| {
                self.attributes
                    .iter()
                    .find(|(key, _)| key.contains(':') && local_part(key) == name)
            })
            .map(|(_, value)| value.as_str())
    }

    pub fn attr_f32(&self, name: &str) -> Option<f32> {
        self.attr(name).and_then(|value| value.trim().parse().ok())
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Property element content, e.g. `<Path.Fill>` for `Fill` on `Path`.
    pub fn property(&self, property: &str) -> Option<&XmlElement> {
        let qualified = format!("{}.{}", self.name, property);
        self.child(&qualified)
            .and_then(|element| element.children.first())
    }

    pub fn visit(&self, visitor: &mut impl FnMut(&XmlElement)) {
        visitor(self);
        for child in &self.children {
            child.visit(visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::XmlElement;

    #[test]
    fn parses_nested_elements_and_attributes() {
        let root = XmlElement::parse(
            r##"<FixedPage xmlns="http://schemas.microsoft.com/xps/2005/06" Width="816" Height="1056" xml:lang="en">
                 <Canvas RenderTransform="1,0,0,1,10,10">
                   <Path Data="M 0,0 L 10,0 10,10 Z" Fill="#FF000000"/>
                 </Canvas>
                 <Path Data="M 0,0 H 5">
                   <Path.Fill><SolidColorBrush Color="#80FF0000"/></Path.Fill>
                 </Path>
               </FixedPage>"##,
        )
        .expect("markup should parse");

        assert_eq!(root.name, "FixedPage");
        assert_eq!(root.attr_f32("Width"), Some(816.0));
        assert_eq!(root.attr("lang"), Some("en"));
        assert_eq!(root.children.len(), 2);
        let canvas = root.child("Canvas").expect("canvas should exist");
        assert_eq!(canvas.children[0].attr("Fill"), Some("#FF000000"));
        let path = &root.children[1];
        let brush = path.property("Fill").expect("fill property");
        assert_eq!(brush.name, "SolidColorBrush");
    }

    #[test]
    fn unescapes_attribute_values() {
        let root = XmlElement::parse(r#"<Glyphs UnicodeString="a &amp; b"/>"#)
            .expect("markup should parse");
        assert_eq!(root.attr("UnicodeString"), Some("a & b"));
    }

    #[test]
    fn rejects_markup_without_root() {
        assert!(XmlElement::parse("").is_err());
    }
}

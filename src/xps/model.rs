//! Page content handed to a package writer.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::backend::{PageRect, PageSize};
use crate::error::PrintResult;

use super::markup::escape;
use super::package::{NS_RESOURCE_KEY, NS_XPS, PartUri, content_types};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolidColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl SolidColor {
    pub const WHITE: Self = Self::rgba(255, 255, 255, 255);
    pub const BLACK: Self = Self::rgba(0, 0, 0, 255);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_markup(&self) -> String {
        format!("#{:02X}{:02X}{:02X}{:02X}", self.a, self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageBrush {
    pub image: PartUri,
    pub viewbox: PageRect,
    pub viewport: PageRect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Brush {
    Solid(SolidColor),
    Image(ImageBrush),
}

/// A figure of straight segments starting at `start`.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryFigure {
    pub start: (f32, f32),
    pub segments: Vec<(f32, f32)>,
    pub closed: bool,
    pub filled: bool,
}

impl GeometryFigure {
    /// Closed, filled rectangle traced from the top-left corner.
    pub fn rectangle(rect: PageRect) -> Self {
        let right = rect.x + rect.width;
        let bottom = rect.y + rect.height;
        Self {
            start: (rect.x, rect.y),
            segments: vec![(rect.x, bottom), (right, bottom), (right, rect.y)],
            closed: true,
            filled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillRule {
    #[default]
    EvenOdd,
    NonZero,
}

/// Geometry stored in the page resource dictionary under `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub key: String,
    pub figures: Vec<GeometryFigure>,
    pub fill_rule: FillRule,
}

impl Geometry {
    pub fn new(key: impl Into<String>, figures: Vec<GeometryFigure>) -> Self {
        Self {
            key: key.into(),
            figures,
            fill_rule: FillRule::default(),
        }
    }

    pub fn with_fill_rule(mut self, fill_rule: FillRule) -> Self {
        self.fill_rule = fill_rule;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct XpsPath {
    pub geometry: Geometry,
    pub fill: Option<Brush>,
    /// Clip geometries, outermost first; the path is drawn inside all of them.
    pub clips: Vec<Geometry>,
}

impl XpsPath {
    pub fn filled(geometry: Geometry, fill: Brush) -> Self {
        Self {
            geometry,
            fill: Some(fill),
            clips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Image,
    Font,
    ResourceDictionary,
    Other,
}

impl ResourceKind {
    pub fn from_content_type(content_type: &str) -> Self {
        match content_type {
            content_types::PNG | content_types::JPEG | content_types::TIFF => Self::Image,
            content_types::FONT | content_types::OBFUSCATED_FONT => Self::Font,
            content_types::RESOURCE_DICTIONARY => Self::ResourceDictionary,
            other if other.starts_with("image/") => Self::Image,
            other if other.contains("font") || other.contains("opentype") => Self::Font,
            _ => Self::Other,
        }
    }
}

/// A part the page depends on; written once per package.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResource {
    pub uri: PartUri,
    pub kind: ResourceKind,
    pub content_type: String,
    pub data: Arc<[u8]>,
}

impl PageResource {
    pub fn png(uri: PartUri, data: Vec<u8>) -> Self {
        Self {
            uri,
            kind: ResourceKind::Image,
            content_type: content_types::PNG.to_string(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageContent {
    Paths(Vec<XpsPath>),
    /// FixedPage markup copied from another package.
    Markup(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixedPage {
    pub name: PartUri,
    pub size: PageSize,
    pub language: Option<String>,
    pub content: PageContent,
    pub resources: Vec<PageResource>,
}

impl FixedPage {
    pub fn new(name: PartUri, size: PageSize) -> Self {
        Self {
            name,
            size,
            language: Some("en".to_string()),
            content: PageContent::Paths(Vec::new()),
            resources: Vec::new(),
        }
    }

    pub fn path_count(&self) -> usize {
        match &self.content {
            PageContent::Paths(paths) => paths.len(),
            PageContent::Markup(_) => 0,
        }
    }

    pub fn add_path(&mut self, path: XpsPath) {
        if let PageContent::Paths(paths) = &mut self.content {
            paths.push(path);
        }
    }

    pub fn to_markup(&self) -> PrintResult<String> {
        match &self.content {
            PageContent::Markup(markup) => Ok(markup.clone()),
            PageContent::Paths(paths) => Ok(self.paths_markup(paths)),
        }
    }

    fn paths_markup(&self, paths: &[XpsPath]) -> String {
        let mut xml = String::new();
        let _ = write!(
            xml,
            r#"<FixedPage xmlns="{NS_XPS}" xmlns:x="{NS_RESOURCE_KEY}" Width="{}" Height="{}""#,
            number(self.size.width),
            number(self.size.height)
        );
        if let Some(language) = &self.language {
            let _ = write!(xml, r#" xml:lang="{}""#, escape(language));
        }
        xml.push('>');

        if !paths.is_empty() {
            xml.push_str("<FixedPage.Resources><ResourceDictionary>");
            let mut written = HashSet::new();
            for path in paths {
                for geometry in path.clips.iter().chain(std::iter::once(&path.geometry)) {
                    if written.insert(geometry.key.as_str()) {
                        write_geometry(&mut xml, geometry);
                    }
                }
            }
            xml.push_str("</ResourceDictionary></FixedPage.Resources>");
        }

        for path in paths {
            for clip in &path.clips {
                let _ = write!(
                    xml,
                    r#"<Canvas Clip="{{StaticResource {}}}">"#,
                    escape(&clip.key)
                );
            }
            let _ = write!(
                xml,
                r#"<Path Data="{{StaticResource {}}}""#,
                escape(&path.geometry.key)
            );
            match &path.fill {
                None => xml.push_str("/>"),
                Some(Brush::Solid(color)) => {
                    let _ = write!(xml, r#" Fill="{}"/>"#, color.to_markup());
                }
                Some(Brush::Image(brush)) => {
                    xml.push_str("><Path.Fill>");
                    let _ = write!(
                        xml,
                        r#"<ImageBrush ImageSource="{}" Viewbox="{}" ViewboxUnits="Absolute" Viewport="{}" ViewportUnits="Absolute" TileMode="None"/>"#,
                        escape(brush.image.as_str()),
                        rect(brush.viewbox),
                        rect(brush.viewport)
                    );
                    xml.push_str("</Path.Fill></Path>");
                }
            }
            for _ in &path.clips {
                xml.push_str("</Canvas>");
            }
        }

        xml.push_str("</FixedPage>");
        xml
    }
}

fn write_geometry(xml: &mut String, geometry: &Geometry) {
    let _ = write!(xml, r#"<PathGeometry x:Key="{}""#, escape(&geometry.key));
    if geometry.fill_rule == FillRule::NonZero {
        xml.push_str(r#" FillRule="NonZero""#);
    }
    xml.push('>');
    for figure in &geometry.figures {
        let _ = write!(
            xml,
            r#"<PathFigure StartPoint="{},{}" IsClosed="{}" IsFilled="{}">"#,
            number(figure.start.0),
            number(figure.start.1),
            figure.closed,
            figure.filled
        );
        if !figure.segments.is_empty() {
            let points = figure
                .segments
                .iter()
                .map(|(x, y)| format!("{},{}", number(*x), number(*y)))
                .collect::<Vec<_>>()
                .join(" ");
            let _ = write!(xml, r#"<PolyLineSegment Points="{points}"/>"#);
        }
        xml.push_str("</PathFigure>");
    }
    xml.push_str("</PathGeometry>");
}

fn rect(rect: PageRect) -> String {
    format!(
        "{},{},{},{}",
        number(rect.x),
        number(rect.y),
        number(rect.width),
        number(rect.height)
    )
}

fn number(value: f32) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    if rounded == rounded.trunc() {
        format!("{}", rounded as i64)
    } else {
        format!("{rounded}")
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Brush, FillRule, FixedPage, Geometry, GeometryFigure, ImageBrush, SolidColor, XpsPath,
    };
    use crate::backend::{PageRect, PageSize};
    use crate::xps::markup::XmlElement;
    use crate::xps::package::PartUri;

    #[test]
    fn rectangle_figure_walks_the_page_outline() {
        let figure = GeometryFigure::rectangle(PageRect::new(0.0, 0.0, 200.0, 100.0));
        assert_eq!(figure.start, (0.0, 0.0));
        assert_eq!(
            figure.segments,
            vec![(0.0, 100.0), (200.0, 100.0), (200.0, 0.0)]
        );
        assert!(figure.closed && figure.filled);
    }

    #[test]
    fn image_page_markup_references_geometry_and_image() {
        let size = PageSize::new(200.0, 100.0);
        let mut page = FixedPage::new(PartUri::new("/page0").expect("valid"), size);
        let full = PageRect::from_size(size);
        page.add_path(XpsPath::filled(
            Geometry::new("geometry0", vec![GeometryFigure::rectangle(full)]),
            Brush::Image(ImageBrush {
                image: PartUri::new("/image0").expect("valid"),
                viewbox: full,
                viewport: full,
            }),
        ));

        let root = XmlElement::parse(&page.to_markup().expect("markup")).expect("xml parses");
        assert_eq!(root.attr("lang"), Some("en"));
        assert_eq!(root.attr("Width"), Some("200"));
        let path = root.child("Path").expect("path");
        assert_eq!(path.attr("Data"), Some("{StaticResource geometry0}"));
        let brush = path.property("Fill").expect("fill");
        assert_eq!(brush.attr("ImageSource"), Some("/image0"));
        assert_eq!(brush.attr("Viewbox"), Some("0,0,200,100"));
    }

    #[test]
    fn solid_color_markup_is_argb() {
        assert_eq!(SolidColor::rgba(1, 2, 3, 255).to_markup(), "#FF010203");
    }

    #[test]
    fn clipped_paths_nest_in_canvases_and_share_clip_geometry() {
        let size = PageSize::new(100.0, 100.0);
        let mut page = FixedPage::new(PartUri::new("/page0").expect("valid"), size);
        let clip = Geometry::new("clip0", vec![GeometryFigure::rectangle(PageRect::new(
            10.0, 10.0, 50.0, 50.0,
        ))])
        .with_fill_rule(FillRule::NonZero);
        for key in ["fill0", "fill1"] {
            let mut path = XpsPath::filled(
                Geometry::new(key, vec![GeometryFigure::rectangle(PageRect::from_size(size))]),
                Brush::Solid(SolidColor::BLACK),
            );
            path.clips.push(clip.clone());
            page.add_path(path);
        }

        let markup = page.to_markup().expect("markup");
        assert_eq!(markup.matches(r#"x:Key="clip0""#).count(), 1);
        assert!(markup.contains(r#"<PathGeometry x:Key="clip0" FillRule="NonZero">"#));
        assert!(markup.contains(r#"<PathGeometry x:Key="fill0">"#));

        let root = XmlElement::parse(&markup).expect("xml parses");
        let canvas = root.child("Canvas").expect("clip canvas");
        assert_eq!(canvas.attr("Clip"), Some("{StaticResource clip0}"));
        let path = canvas.child("Path").expect("clipped path");
        assert_eq!(path.attr("Fill"), Some("#FF000000"));
    }
}

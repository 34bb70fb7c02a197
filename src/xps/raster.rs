//! CPU rasterizer for fixed pages.
//!
//! Covers the fixed-content subset print jobs actually use: nested canvases
//! with transforms, opacity and clips; paths with solid, image and gradient
//! brushes; glyph runs from embedded (optionally obfuscated) fonts; and
//! resource dictionaries, inline or in their own part.

use std::collections::HashMap;
use std::sync::Arc;

use kurbo::{BezPath, PathEl};
use serde::{Deserialize, Serialize};
use tiny_skia::{
    Color, FillRule, FilterQuality, GradientStop, LineCap, LineJoin, LinearGradient, Mask, Paint,
    Path, PathBuilder, Pattern, Pixmap, Point, RadialGradient, Rect, SpreadMode, Stroke, Transform,
};
use tracing::{debug, trace, warn};
use ttf_parser::{Face, GlyphId, OutlineBuilder};

use crate::backend::RgbaFrame;
use crate::error::{PrintError, PrintResult};
use crate::render::{frame_from_pixmap, pixmap_from_rgba};

use super::markup::XmlElement;
use super::package::{PartUri, content_types};
use super::reader::XpsPackage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderingMode {
    Aliased,
    #[default]
    Antialiased,
}

impl RenderingMode {
    fn anti_alias(self) -> bool {
        matches!(self, Self::Antialiased)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RasterOptions {
    pub text_rendering: RenderingMode,
    pub non_text_rendering: RenderingMode,
    /// Thinnest stroke drawn, in device pixels.
    pub minimal_line_width: Option<f32>,
}

#[derive(Clone)]
struct DrawState {
    transform: Transform,
    opacity: f32,
    clip: Option<Mask>,
}

type ResourceScope = HashMap<String, (PartUri, XmlElement)>;

#[derive(Debug, Clone)]
enum FillSpec {
    Solid(Color),
    Image {
        image: String,
        transform: Transform,
        tile: bool,
        opacity: f32,
    },
    Linear {
        start: Point,
        end: Point,
        stops: Vec<(f32, Color)>,
        spread: SpreadMode,
        transform: Transform,
    },
    Radial {
        origin: Point,
        center: Point,
        radius: f32,
        stops: Vec<(f32, Color)>,
        spread: SpreadMode,
        transform: Transform,
    },
}

impl FillSpec {
    fn with_opacity(mut self, factor: f32) -> Self {
        let factor = factor.clamp(0.0, 1.0);
        match &mut self {
            Self::Solid(color) => color.apply_opacity(factor),
            Self::Image { opacity, .. } => *opacity *= factor,
            Self::Linear { stops, .. } | Self::Radial { stops, .. } => {
                for (_, color) in stops.iter_mut() {
                    color.apply_opacity(factor);
                }
            }
        }
        self
    }
}

/// Renders pages of one package; decoded images and fonts are kept across
/// pages.
pub struct PageRasterizer<'a> {
    package: &'a XpsPackage,
    options: RasterOptions,
    images: HashMap<String, Option<Pixmap>>,
    fonts: HashMap<String, Option<Arc<[u8]>>>,
    scopes: Vec<ResourceScope>,
}

impl<'a> PageRasterizer<'a> {
    pub fn new(package: &'a XpsPackage, options: RasterOptions) -> Self {
        Self {
            package,
            options,
            images: HashMap::new(),
            fonts: HashMap::new(),
            scopes: Vec::new(),
        }
    }

    pub fn render_page(
        &mut self,
        page: usize,
        width_px: u32,
        height_px: u32,
    ) -> PrintResult<RgbaFrame> {
        let size = self.package.page_size(page)?;
        let markup = self.package.fixed_page(page)?;
        let page_uri = self.package.page_ref(page)?.uri.clone();

        let mut target = Pixmap::new(width_px, height_px).ok_or_else(|| {
            PrintError::invalid_argument(format!(
                "cannot rasterize page {page} at {width_px}x{height_px}"
            ))
        })?;
        target.fill(Color::WHITE);

        let state = DrawState {
            transform: Transform::from_scale(
                width_px as f32 / size.width,
                height_px as f32 / size.height,
            ),
            opacity: 1.0,
            clip: None,
        };

        self.scopes.clear();
        let scope = self.load_scope(&page_uri, &markup);
        self.scopes.push(scope);
        self.draw_children(&mut target, &page_uri, &markup, &state);
        self.scopes.clear();

        trace!(page, width_px, height_px, "fixed page rasterized");
        Ok(frame_from_pixmap(&target))
    }

    fn draw_children(
        &mut self,
        target: &mut Pixmap,
        base: &PartUri,
        parent: &XmlElement,
        state: &DrawState,
    ) {
        for child in &parent.children {
            match child.name.as_str() {
                "Canvas" => self.draw_canvas(target, base, child, state),
                "Path" => self.draw_path(target, base, child, state),
                "Glyphs" => self.draw_glyphs(target, base, child, state),
                name if name.contains('.') => {}
                other => debug!(element = other, "skipping unsupported fixed-page element"),
            }
        }
    }

    fn draw_canvas(
        &mut self,
        target: &mut Pixmap,
        base: &PartUri,
        canvas: &XmlElement,
        parent: &DrawState,
    ) {
        let scope = self.load_scope(base, canvas);
        let pushed = !scope.is_empty();
        if pushed {
            self.scopes.push(scope);
        }
        if let Some(state) = self.enter(target, canvas, parent) {
            self.draw_children(target, base, canvas, &state);
        }
        if pushed {
            self.scopes.pop();
        }
    }

    fn draw_path(
        &mut self,
        target: &mut Pixmap,
        base: &PartUri,
        element: &XmlElement,
        parent: &DrawState,
    ) {
        let Some(state) = self.enter(target, element, parent) else {
            return;
        };
        let Some((path, fill_rule)) = self.geometry_of(element, "Data") else {
            trace!("path without usable geometry");
            return;
        };
        let anti_alias = self.options.non_text_rendering.anti_alias();

        if let Some(fill) = self.resolve_brush(base, element, "Fill") {
            let fill = fill.with_opacity(state.opacity);
            if let Some(paint) = self.paint_for(&fill, anti_alias) {
                target.fill_path(&path, &paint, fill_rule, state.transform, state.clip.as_ref());
            }
        }

        if let Some(brush) = self.resolve_brush(base, element, "Stroke") {
            let brush = brush.with_opacity(state.opacity);
            let stroke = self.stroke_for(element, state.transform);
            if let Some(paint) = self.paint_for(&brush, anti_alias) {
                target.stroke_path(&path, &paint, &stroke, state.transform, state.clip.as_ref());
            }
        }
    }

    fn draw_glyphs(
        &mut self,
        target: &mut Pixmap,
        base: &PartUri,
        element: &XmlElement,
        parent: &DrawState,
    ) {
        let Some(state) = self.enter(target, element, parent) else {
            return;
        };
        let Some(font_uri) = element.attr("FontUri").and_then(|uri| base.resolve(uri).ok()) else {
            debug!("glyph run without a font");
            return;
        };
        let Some(font) = self.ensure_font(&font_uri) else {
            return;
        };
        let Ok(face) = Face::parse(&font, 0) else {
            warn!(font = %font_uri, "embedded font could not be parsed");
            return;
        };
        let size = element.attr_f32("FontRenderingEmSize").unwrap_or(0.0);
        if size <= 0.0 {
            return;
        }
        let Some(fill) = self.resolve_brush(base, element, "Fill") else {
            return;
        };
        let fill = fill.with_opacity(state.opacity);
        let Some(paint) = self.paint_for(&fill, self.options.text_rendering.anti_alias()) else {
            return;
        };

        let origin_x = element.attr_f32("OriginX").unwrap_or(0.0);
        let origin_y = element.attr_f32("OriginY").unwrap_or(0.0);
        let right_to_left = element
            .attr("BidiLevel")
            .and_then(|level| level.trim().parse::<u8>().ok())
            .is_some_and(|level| level % 2 == 1);
        let scale = size / face.units_per_em().max(1) as f32;
        let text = element.attr("UnicodeString").unwrap_or_default();

        let mut pen_x = origin_x;
        for glyph in glyph_run(&face, text, element.attr("Indices"), size) {
            if right_to_left {
                pen_x -= glyph.advance;
            }
            let mut builder =
                GlyphPathBuilder::new(pen_x + glyph.offset_x, origin_y - glyph.offset_y, scale);
            if face.outline_glyph(GlyphId(glyph.id), &mut builder).is_some()
                && let Some(path) = builder.finish()
            {
                target.fill_path(
                    &path,
                    &paint,
                    FillRule::Winding,
                    state.transform,
                    state.clip.as_ref(),
                );
            }
            if !right_to_left {
                pen_x += glyph.advance;
            }
        }
    }

    /// Applies an element's transform, opacity and clip on top of `parent`.
    /// `None` when nothing under the element can be visible.
    fn enter(
        &self,
        target: &Pixmap,
        element: &XmlElement,
        parent: &DrawState,
    ) -> Option<DrawState> {
        let mut state = parent.clone();
        if let Some(local) = self.transform_of(element, "RenderTransform") {
            state.transform = state.transform.pre_concat(local);
        }
        state.opacity *= element.attr_f32("Opacity").unwrap_or(1.0).clamp(0.0, 1.0);
        if state.opacity <= 0.0 {
            return None;
        }

        if let Some((clip, fill_rule)) = self.geometry_of(element, "Clip") {
            let anti_alias = self.options.non_text_rendering.anti_alias();
            match state.clip.as_mut() {
                Some(mask) => mask.intersect_path(&clip, fill_rule, anti_alias, state.transform),
                None => {
                    let mut mask = Mask::new(target.width(), target.height())?;
                    mask.fill_path(&clip, fill_rule, anti_alias, state.transform);
                    state.clip = Some(mask);
                }
            }
        }
        Some(state)
    }

    fn load_scope(&self, base: &PartUri, element: &XmlElement) -> ResourceScope {
        let mut scope = ResourceScope::new();
        if let Some(dictionary) = element.property("Resources") {
            self.collect_dictionary(base, dictionary, &mut scope, 0);
        }
        scope
    }

    fn collect_dictionary(
        &self,
        base: &PartUri,
        dictionary: &XmlElement,
        scope: &mut ResourceScope,
        depth: usize,
    ) {
        if let Some(source) = dictionary.attr("Source")
            && depth < 4
        {
            let remote = base.resolve(source).and_then(|uri| {
                let markup = XmlElement::parse(&self.package.part_text(&uri)?)?;
                Ok((uri, markup))
            });
            match remote {
                Ok((uri, markup)) => self.collect_dictionary(&uri, &markup, scope, depth + 1),
                Err(err) => warn!(source, %err, "resource dictionary could not be loaded"),
            }
        }
        for entry in &dictionary.children {
            if let Some(key) = entry.attr("Key") {
                scope.insert(key.to_string(), (base.clone(), entry.clone()));
            }
        }
    }

    fn lookup(&self, key: &str) -> Option<&(PartUri, XmlElement)> {
        self.scopes.iter().rev().find_map(|scope| scope.get(key))
    }

    fn transform_of(&self, element: &XmlElement, property: &str) -> Option<Transform> {
        if let Some(value) = element.attr(property) {
            if let Some(key) = static_resource_key(value) {
                let (_, resource) = self.lookup(key)?;
                return resource.attr("Matrix").and_then(parse_matrix);
            }
            return parse_matrix(value);
        }
        element
            .property(property)
            .and_then(|transform| transform.attr("Matrix"))
            .and_then(parse_matrix)
    }

    fn geometry_of(
        &self,
        element: &XmlElement,
        property: &str,
    ) -> Option<(Path, FillRule)> {
        if let Some(value) = element.attr(property) {
            if let Some(key) = static_resource_key(value) {
                let (_, resource) = self.lookup(key)?;
                return self.path_geometry(resource);
            }
            let (bez, fill_rule) = abbreviated_geometry(value)?;
            return Some((bez_to_path(&bez)?, fill_rule));
        }
        let geometry = element.property(property)?;
        self.path_geometry(geometry)
    }

    fn path_geometry(&self, geometry: &XmlElement) -> Option<(Path, FillRule)> {
        if geometry.name != "PathGeometry" {
            debug!(element = %geometry.name, "unsupported geometry element");
            return None;
        }
        let (bez, fill_rule) = path_geometry_to_bez(geometry)?;
        let path = bez_to_path(&bez)?;
        match self.transform_of(geometry, "Transform") {
            Some(transform) => Some((path.transform(transform)?, fill_rule)),
            None => Some((path, fill_rule)),
        }
    }

    fn resolve_brush(
        &mut self,
        base: &PartUri,
        element: &XmlElement,
        property: &str,
    ) -> Option<FillSpec> {
        if let Some(value) = element.attr(property) {
            if let Some(key) = static_resource_key(value) {
                let (owner, brush) = self.lookup(key).cloned()?;
                return self.brush_from_element(&owner, &brush);
            }
            let color = parse_color(value);
            if color.is_none() {
                debug!(value, "unsupported color syntax");
            }
            return color.map(FillSpec::Solid);
        }
        let brush = element.property(property)?;
        self.brush_from_element(base, brush)
    }

    fn brush_from_element(&mut self, base: &PartUri, brush: &XmlElement) -> Option<FillSpec> {
        let opacity = brush.attr_f32("Opacity").unwrap_or(1.0);
        let transform = self
            .transform_of(brush, "Transform")
            .unwrap_or_else(Transform::identity);

        let fill = match brush.name.as_str() {
            "SolidColorBrush" => FillSpec::Solid(parse_color(brush.attr("Color")?)?),
            "ImageBrush" => {
                let uri = base.resolve(brush.attr("ImageSource")?).ok()?;
                let (image_width, image_height) = self.ensure_image(&uri)?;
                let viewbox = brush
                    .attr("Viewbox")
                    .and_then(parse_rect)
                    .or_else(|| Rect::from_xywh(0.0, 0.0, image_width as f32, image_height as f32))?;
                let viewport = parse_rect(brush.attr("Viewport")?)?;
                let sx = viewport.width() / viewbox.width();
                let sy = viewport.height() / viewbox.height();
                let mapping = Transform::from_row(
                    sx,
                    0.0,
                    0.0,
                    sy,
                    viewport.x() - viewbox.x() * sx,
                    viewport.y() - viewbox.y() * sy,
                );
                FillSpec::Image {
                    image: uri.key(),
                    transform: transform.pre_concat(mapping),
                    tile: !matches!(brush.attr("TileMode"), None | Some("None")),
                    opacity: 1.0,
                }
            }
            "LinearGradientBrush" => FillSpec::Linear {
                start: parse_point(brush.attr("StartPoint")?)?,
                end: parse_point(brush.attr("EndPoint")?)?,
                stops: gradient_stops(brush),
                spread: spread_method(brush),
                transform,
            },
            "RadialGradientBrush" => {
                let center = parse_point(brush.attr("Center")?)?;
                let origin = brush
                    .attr("GradientOrigin")
                    .and_then(parse_point)
                    .unwrap_or(center);
                let radius_x = brush.attr_f32("RadiusX")?;
                let radius_y = brush.attr_f32("RadiusY").unwrap_or(radius_x);
                if radius_x <= 0.0 || radius_y <= 0.0 {
                    return None;
                }
                let ellipse = Transform::from_translate(center.x, center.y)
                    .pre_scale(1.0, radius_y / radius_x)
                    .pre_translate(-center.x, -center.y);
                FillSpec::Radial {
                    origin,
                    center,
                    radius: radius_x,
                    stops: gradient_stops(brush),
                    spread: spread_method(brush),
                    transform: transform.pre_concat(ellipse),
                }
            }
            other => {
                debug!(brush = other, "unsupported brush");
                return None;
            }
        };
        Some(fill.with_opacity(opacity))
    }

    fn paint_for(&self, fill: &FillSpec, anti_alias: bool) -> Option<Paint<'_>> {
        let mut paint = Paint {
            anti_alias,
            ..Paint::default()
        };
        match fill {
            FillSpec::Solid(color) => paint.set_color(*color),
            FillSpec::Image {
                image,
                transform,
                tile,
                opacity,
            } => {
                let pixmap = self.images.get(image)?.as_ref()?;
                let spread = if *tile {
                    SpreadMode::Repeat
                } else {
                    SpreadMode::Pad
                };
                paint.shader = Pattern::new(
                    pixmap.as_ref(),
                    spread,
                    FilterQuality::Bilinear,
                    *opacity,
                    *transform,
                );
            }
            FillSpec::Linear {
                start,
                end,
                stops,
                spread,
                transform,
            } => {
                paint.shader =
                    LinearGradient::new(*start, *end, to_stops(stops), *spread, *transform)?;
            }
            FillSpec::Radial {
                origin,
                center,
                radius,
                stops,
                spread,
                transform,
            } => {
                paint.shader = RadialGradient::new(
                    *origin,
                    *center,
                    *radius,
                    to_stops(stops),
                    *spread,
                    *transform,
                )?;
            }
        }
        Some(paint)
    }

    fn stroke_for(&self, element: &XmlElement, transform: Transform) -> Stroke {
        let thickness = element.attr_f32("StrokeThickness").unwrap_or(1.0).max(0.0);
        let scale = (transform.sx * transform.sy - transform.kx * transform.ky)
            .abs()
            .sqrt();
        let width = match self.options.minimal_line_width {
            Some(minimum) if scale > 0.0 && thickness * scale < minimum => minimum / scale,
            _ => thickness,
        };

        Stroke {
            width,
            miter_limit: element.attr_f32("StrokeMiterLimit").unwrap_or(10.0).max(1.0),
            line_cap: match element.attr("StrokeStartLineCap") {
                Some("Round") => LineCap::Round,
                Some("Square") => LineCap::Square,
                _ => LineCap::Butt,
            },
            line_join: match element.attr("StrokeLineJoin") {
                Some("Round") => LineJoin::Round,
                Some("Bevel") => LineJoin::Bevel,
                _ => LineJoin::Miter,
            },
            ..Stroke::default()
        }
    }

    fn ensure_image(&mut self, uri: &PartUri) -> Option<(u32, u32)> {
        let key = uri.key();
        if !self.images.contains_key(&key) {
            let decoded = match self.package.part(uri) {
                Some(data) => decode_image(&data)
                    .inspect_err(|err| warn!(image = %uri, %err, "image could not be decoded"))
                    .ok(),
                None => {
                    warn!(image = %uri, "image part is missing");
                    None
                }
            };
            self.images.insert(key.clone(), decoded);
        }
        self.images
            .get(&key)?
            .as_ref()
            .map(|pixmap| (pixmap.width(), pixmap.height()))
    }

    fn ensure_font(&mut self, uri: &PartUri) -> Option<Arc<[u8]>> {
        let key = uri.key();
        if let Some(cached) = self.fonts.get(&key) {
            return cached.clone();
        }

        let obfuscated = self.package.content_type(uri) == content_types::OBFUSCATED_FONT
            || uri
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("odttf"));
        let loaded = match self.package.part(uri) {
            Some(data) if obfuscated => deobfuscate_font(&data, uri.file_name())
                .inspect_err(|err| warn!(font = %uri, %err, "font could not be deobfuscated"))
                .ok()
                .map(Arc::from),
            Some(data) => Some(data),
            None => {
                warn!(font = %uri, "font part is missing");
                None
            }
        };
        self.fonts.insert(key, loaded.clone());
        loaded
    }
}

fn decode_image(data: &[u8]) -> PrintResult<Pixmap> {
    let image = image::load_from_memory(data)?.to_rgba8();
    pixmap_from_rgba(image.width(), image.height(), image.as_raw())
}

/// Undoes the embedded-font obfuscation: the first 32 bytes are XORed with
/// the GUID taken from the part's file name.
pub(crate) fn deobfuscate_font(data: &[u8], file_name: &str) -> PrintResult<Vec<u8>> {
    const KEY_ORDER: [usize; 16] = [15, 14, 13, 12, 11, 10, 9, 8, 6, 7, 4, 5, 0, 1, 2, 3];

    let stem = file_name.split('.').next().unwrap_or(file_name);
    let hex: Vec<u8> = stem
        .bytes()
        .filter(|byte| byte.is_ascii_hexdigit())
        .collect();
    let is_guid = hex.len() == 32
        && stem
            .bytes()
            .all(|byte| byte.is_ascii_hexdigit() || matches!(byte, b'{' | b'}' | b'-'));
    if !is_guid || data.len() < 32 {
        return Err(PrintError::package(format!(
            "font part {file_name} is not a valid obfuscated font"
        )));
    }

    let mut guid = [0u8; 16];
    for (index, byte) in guid.iter_mut().enumerate() {
        let pair = std::str::from_utf8(&hex[index * 2..index * 2 + 2])
            .map_err(|_| PrintError::package("invalid font GUID"))?;
        *byte = u8::from_str_radix(pair, 16).map_err(|_| PrintError::package("invalid font GUID"))?;
    }

    let mut font = data.to_vec();
    for (index, &position) in KEY_ORDER.iter().enumerate() {
        font[index] ^= guid[position];
        font[index + 16] ^= guid[position];
    }
    Ok(font)
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct IndexEntry {
    cluster: Option<(usize, usize)>,
    glyph: Option<u16>,
    advance: Option<f32>,
    offset_x: Option<f32>,
    offset_y: Option<f32>,
}

/// Parses a `Glyphs` `Indices` attribute:
/// `[(chars:glyphs)][glyph][,advance[,uOffset[,vOffset]]]` per glyph, `;`
/// separated, advances and offsets in hundredths of the em size.
fn parse_indices(indices: &str) -> Vec<IndexEntry> {
    indices
        .split(';')
        .map(|entry| {
            let mut parsed = IndexEntry::default();
            let mut rest = entry.trim();
            if let Some(inner) = rest.strip_prefix('(')
                && let Some((mapping, tail)) = inner.split_once(')')
            {
                let (chars, glyphs) = mapping.split_once(':').unwrap_or((mapping, "1"));
                parsed.cluster = Some((
                    chars.trim().parse().unwrap_or(1),
                    glyphs.trim().parse().unwrap_or(1),
                ));
                rest = tail;
            }
            let mut fields = rest.split(',').map(str::trim);
            parsed.glyph = fields.next().and_then(|field| field.parse().ok());
            parsed.advance = fields.next().and_then(|field| field.parse().ok());
            parsed.offset_x = fields.next().and_then(|field| field.parse().ok());
            parsed.offset_y = fields.next().and_then(|field| field.parse().ok());
            parsed
        })
        .collect()
}

struct GlyphPlacement {
    id: u16,
    advance: f32,
    offset_x: f32,
    offset_y: f32,
}

fn glyph_run(face: &Face, text: &str, indices: Option<&str>, size: f32) -> Vec<GlyphPlacement> {
    let units_per_em = face.units_per_em().max(1) as f32;
    let chars: Vec<char> = text.strip_prefix("{}").unwrap_or(text).chars().collect();
    let entries = indices.map(parse_indices).unwrap_or_default();
    let count = chars.len().max(entries.len());

    let mut placements = Vec::with_capacity(count);
    let mut char_pos = 0usize;
    let mut cluster_chars = 1usize;
    let mut cluster_glyphs_left = 0usize;
    for index in 0..count {
        let entry = entries.get(index).copied().unwrap_or_default();
        if let Some((chars_in_cluster, glyphs_in_cluster)) = entry.cluster {
            cluster_chars = chars_in_cluster;
            cluster_glyphs_left = glyphs_in_cluster.max(1);
        } else if cluster_glyphs_left == 0 {
            cluster_chars = 1;
            cluster_glyphs_left = 1;
        }

        let id = match entry.glyph {
            Some(id) => Some(id),
            None => chars
                .get(char_pos)
                .map(|&ch| face.glyph_index(ch).map(|glyph| glyph.0).unwrap_or(0)),
        };
        if let Some(id) = id {
            let advance = entry.advance.map(|advance| advance / 100.0 * size).unwrap_or_else(|| {
                face.glyph_hor_advance(GlyphId(id))
                    .map(|advance| advance as f32 / units_per_em * size)
                    .unwrap_or(0.0)
            });
            placements.push(GlyphPlacement {
                id,
                advance,
                offset_x: entry.offset_x.unwrap_or(0.0) / 100.0 * size,
                offset_y: entry.offset_y.unwrap_or(0.0) / 100.0 * size,
            });
        }

        cluster_glyphs_left -= 1;
        if cluster_glyphs_left == 0 {
            char_pos += cluster_chars;
        }
    }
    placements
}

/// Outline sink placing font units at `origin` with the y axis flipped.
struct GlyphPathBuilder {
    builder: PathBuilder,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
}

impl GlyphPathBuilder {
    fn new(origin_x: f32, origin_y: f32, scale: f32) -> Self {
        Self {
            builder: PathBuilder::new(),
            origin_x,
            origin_y,
            scale,
        }
    }

    fn map(&self, x: f32, y: f32) -> (f32, f32) {
        (self.origin_x + x * self.scale, self.origin_y - y * self.scale)
    }

    fn finish(self) -> Option<Path> {
        self.builder.finish()
    }
}

impl OutlineBuilder for GlyphPathBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.map(x, y);
        self.builder.move_to(x, y);
    }

    fn line_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.map(x, y);
        self.builder.line_to(x, y);
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        let (x1, y1) = self.map(x1, y1);
        let (x, y) = self.map(x, y);
        self.builder.quad_to(x1, y1, x, y);
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        let (x1, y1) = self.map(x1, y1);
        let (x2, y2) = self.map(x2, y2);
        let (x, y) = self.map(x, y);
        self.builder.cubic_to(x1, y1, x2, y2, x, y);
    }

    fn close(&mut self) {
        self.builder.close();
    }
}

fn static_resource_key(value: &str) -> Option<&str> {
    value
        .trim()
        .strip_prefix("{StaticResource")?
        .strip_suffix('}')
        .map(str::trim)
}

fn parse_numbers(value: &str) -> Vec<f32> {
    value
        .split(|ch: char| ch == ',' || ch.is_whitespace())
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse().ok())
        .collect()
}

fn parse_point(value: &str) -> Option<Point> {
    match parse_numbers(value).as_slice() {
        [x, y] => Some(Point::from_xy(*x, *y)),
        _ => None,
    }
}

fn parse_rect(value: &str) -> Option<Rect> {
    match parse_numbers(value).as_slice() {
        [x, y, width, height] => Rect::from_xywh(*x, *y, *width, *height),
        _ => None,
    }
}

/// `m11,m12,m21,m22,dx,dy`, the fixed-content matrix order.
fn parse_matrix(value: &str) -> Option<Transform> {
    match parse_numbers(value).as_slice() {
        [m11, m12, m21, m22, dx, dy] => Some(Transform::from_row(*m11, *m12, *m21, *m22, *dx, *dy)),
        _ => None,
    }
}

/// `#AARRGGBB`, `#RRGGBB` or scRGB `sc#[a,]r,g,b`.
pub(crate) fn parse_color(value: &str) -> Option<Color> {
    let value = value.trim();
    if let Some(sc) = value.strip_prefix("sc#") {
        let (alpha, red, green, blue) = match parse_numbers(sc).as_slice() {
            [alpha, red, green, blue] => (*alpha, *red, *green, *blue),
            [red, green, blue] => (1.0, *red, *green, *blue),
            _ => return None,
        };
        return Color::from_rgba(
            linear_to_srgb(red),
            linear_to_srgb(green),
            linear_to_srgb(blue),
            alpha.clamp(0.0, 1.0),
        );
    }

    let hex = value.strip_prefix('#')?;
    let channel = |index: usize| -> Option<u8> {
        u8::from_str_radix(hex.get(index..index + 2)?, 16).ok()
    };
    match hex.len() {
        8 => Some(Color::from_rgba8(
            channel(2)?,
            channel(4)?,
            channel(6)?,
            channel(0)?,
        )),
        6 => Some(Color::from_rgba8(channel(0)?, channel(2)?, channel(4)?, 255)),
        _ => None,
    }
}

fn linear_to_srgb(channel: f32) -> f32 {
    let channel = channel.clamp(0.0, 1.0);
    if channel <= 0.003_130_8 {
        channel * 12.92
    } else {
        1.055 * channel.powf(1.0 / 2.4) - 0.055
    }
}

fn gradient_stops(brush: &XmlElement) -> Vec<(f32, Color)> {
    let property = format!("{}.GradientStops", brush.name);
    let Some(stops) = brush.child(&property) else {
        return Vec::new();
    };
    stops
        .children_named("GradientStop")
        .filter_map(|stop| {
            let color = parse_color(stop.attr("Color")?)?;
            Some((stop.attr_f32("Offset").unwrap_or(0.0).clamp(0.0, 1.0), color))
        })
        .collect()
}

fn to_stops(stops: &[(f32, Color)]) -> Vec<GradientStop> {
    stops
        .iter()
        .map(|(offset, color)| GradientStop::new(*offset, *color))
        .collect()
}

fn spread_method(brush: &XmlElement) -> SpreadMode {
    match brush.attr("SpreadMethod") {
        Some("Reflect") => SpreadMode::Reflect,
        Some("Repeat") => SpreadMode::Repeat,
        _ => SpreadMode::Pad,
    }
}

/// Abbreviated geometry: an optional `F0` (even-odd, the default) or `F1`
/// (nonzero) prefix followed by path commands.
fn abbreviated_geometry(data: &str) -> Option<(BezPath, FillRule)> {
    let data = data.trim();
    let (fill_rule, commands) = match data.strip_prefix('F') {
        Some(rest) => {
            let rest = rest.trim_start();
            match rest.as_bytes().first() {
                Some(b'0') => (FillRule::EvenOdd, &rest[1..]),
                Some(b'1') => (FillRule::Winding, &rest[1..]),
                _ => return None,
            }
        }
        None => (FillRule::EvenOdd, data),
    };
    match BezPath::from_svg(commands.trim()) {
        Ok(path) => Some((path, fill_rule)),
        Err(err) => {
            debug!(%err, "geometry could not be parsed");
            None
        }
    }
}

fn path_geometry_to_bez(geometry: &XmlElement) -> Option<(BezPath, FillRule)> {
    let mut fill_rule = match geometry.attr("FillRule") {
        Some("NonZero") => FillRule::Winding,
        _ => FillRule::EvenOdd,
    };
    let mut path = BezPath::new();
    if let Some(figures) = geometry.attr("Figures") {
        let (parsed, figures_rule) = abbreviated_geometry(figures)?;
        if figures.trim_start().starts_with('F') {
            fill_rule = figures_rule;
        }
        path.extend(parsed.elements().iter().copied());
    }

    let figures = geometry
        .children_named("PathFigure")
        .chain(
            geometry
                .child("PathGeometry.Figures")
                .into_iter()
                .flat_map(|figures| figures.children_named("PathFigure")),
        );
    let mut commands = String::new();
    for figure in figures {
        let Some(start) = figure.attr("StartPoint") else {
            continue;
        };
        commands.push_str(&format!("M {start} "));
        for segment in &figure.children {
            let command = match segment.name.as_str() {
                "PolyLineSegment" => segment.attr("Points").map(|points| format!("L {points} ")),
                "PolyBezierSegment" => segment.attr("Points").map(|points| format!("C {points} ")),
                "PolyQuadraticBezierSegment" => {
                    segment.attr("Points").map(|points| format!("Q {points} "))
                }
                "ArcSegment" => arc_command(segment),
                other => {
                    debug!(segment = other, "unsupported path segment");
                    None
                }
            };
            if let Some(command) = command {
                commands.push_str(&command);
            }
        }
        if figure.attr("IsClosed") == Some("true") {
            commands.push_str("Z ");
        }
    }

    if !commands.is_empty() {
        match BezPath::from_svg(&commands) {
            Ok(figures) => path.extend(figures.elements().iter().copied()),
            Err(err) => {
                debug!(%err, "path figures could not be parsed");
                return None;
            }
        }
    }
    Some((path, fill_rule))
}

fn arc_command(segment: &XmlElement) -> Option<String> {
    let point = segment.attr("Point")?;
    let size = segment.attr("Size")?;
    let rotation = segment.attr_f32("RotationAngle").unwrap_or(0.0);
    let large_arc = u8::from(segment.attr("IsLargeArc") == Some("true"));
    let sweep = u8::from(segment.attr("SweepDirection") == Some("Clockwise"));
    Some(format!("A {size} {rotation} {large_arc} {sweep} {point} "))
}

fn bez_to_path(bez: &BezPath) -> Option<Path> {
    let mut builder = PathBuilder::new();
    for element in bez.elements() {
        match *element {
            PathEl::MoveTo(p) => builder.move_to(p.x as f32, p.y as f32),
            PathEl::LineTo(p) => builder.line_to(p.x as f32, p.y as f32),
            PathEl::QuadTo(c, p) => builder.quad_to(c.x as f32, c.y as f32, p.x as f32, p.y as f32),
            PathEl::CurveTo(c1, c2, p) => builder.cubic_to(
                c1.x as f32,
                c1.y as f32,
                c2.x as f32,
                c2.y as f32,
                p.x as f32,
                p.y as f32,
            ),
            PathEl::ClosePath => builder.close(),
        }
    }
    builder.finish()
}

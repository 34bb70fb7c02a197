use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use hayro::hayro_interpret::font::Glyph;
use hayro::hayro_interpret::util::{PageExt, RectExt};
use hayro::hayro_interpret::{
    BlendMode, ClipPath, Context, Device, GlyphDrawMode, Image, InterpreterSettings, LumaData,
    Paint, PathDrawMode, RgbData, SoftMask, StrokeProps, interpret_page,
};
use hayro::hayro_syntax::Pdf;
use hayro::hayro_syntax::page::Page;
use hayro::vello_cpu::color::AlphaColor;
use hayro::{RenderSettings, render};
use kurbo::{Affine, BezPath, Rect, Stroke, StrokeOpts};
use tracing::debug;

use crate::error::{PrintError, PrintResult};
use crate::xps::{FillRule, SolidColor};

use super::traits::{DIPS_PER_INCH, DocumentBackend, PageRect, PageSize, RgbaFrame};
use super::vector::{FLATTEN_TOLERANCE, PageOp, outline_figures};

const POINTS_PER_INCH: f32 = 72.0;

pub struct PdfDoc {
    path: PathBuf,
    doc_id: u64,
    page_count: usize,
    // hayro documents are Send but not shareable; renders take turns.
    pdf: Mutex<Pdf>,
    background: Mutex<SolidColor>,
}

impl DocumentBackend for PdfDoc {
    fn path(&self) -> &Path {
        PdfDoc::path(self)
    }

    fn doc_id(&self) -> u64 {
        PdfDoc::doc_id(self)
    }

    fn page_count(&self) -> usize {
        PdfDoc::page_count(self)
    }

    fn page_size(&self, page: usize) -> PrintResult<PageSize> {
        PdfDoc::page_size(self, page)
    }

    fn render_page(&self, page: usize, x_scale: f32, y_scale: f32) -> PrintResult<RgbaFrame> {
        PdfDoc::render_page(self, page, x_scale, y_scale)
    }

    fn record_page(&self, page: usize) -> PrintResult<Option<Vec<PageOp>>> {
        PdfDoc::record_page(self, page)
    }
}

impl PdfDoc {
    pub fn open(path: impl AsRef<Path>) -> PrintResult<Self> {
        let path = path.as_ref();
        let bytes = read_pdf_bytes(path)?;
        let doc_id = calculate_doc_id(path, bytes.len());
        let pdf = Pdf::new(Arc::new(bytes))
            .map_err(|_| PrintError::invalid_argument("failed to parse PDF with hayro"))?;
        let page_count = pdf.pages().len();

        Ok(Self {
            path: path.to_path_buf(),
            doc_id,
            page_count,
            pdf: Mutex::new(pdf),
            background: Mutex::new(SolidColor::WHITE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn doc_id(&self) -> u64 {
        self.doc_id
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Color painted under the page content.
    pub fn background(&self) -> SolidColor {
        *self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_background(&self, color: SolidColor) {
        *self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = color;
    }

    pub fn page_size(&self, page: usize) -> PrintResult<PageSize> {
        self.check_page(page)?;

        let pdf = self.lock_pdf();
        let page_ref = pdf
            .pages()
            .get(page)
            .ok_or(PrintError::unsupported_page(page, self.page_count))?;
        let (width, height) = page_ref.render_dimensions();

        Ok(PageSize::from_points(width, height))
    }

    pub fn render_page(&self, page: usize, x_scale: f32, y_scale: f32) -> PrintResult<RgbaFrame> {
        self.check_page(page)?;
        for scale in [x_scale, y_scale] {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(PrintError::invalid_argument(
                    "scale must be a positive finite value",
                ));
            }
        }

        let background = self.background();
        let pdf = self.lock_pdf();
        let page_ref = pdf
            .pages()
            .get(page)
            .ok_or(PrintError::unsupported_page(page, self.page_count))?;

        // hayro renders one pixel per point at scale 1.0
        let dip_to_point = DIPS_PER_INCH / POINTS_PER_INCH;
        let render_settings = RenderSettings {
            x_scale: x_scale * dip_to_point,
            y_scale: y_scale * dip_to_point,
            bg_color: AlphaColor::from_rgba8(background.r, background.g, background.b, background.a),
            ..Default::default()
        };
        let interpreter_settings = InterpreterSettings::default();
        let pixmap = render(page_ref, &interpreter_settings, &render_settings);

        Ok(RgbaFrame {
            width: pixmap.width() as u32,
            height: pixmap.height() as u32,
            pixels: pixmap.data_as_u8_slice().to_vec().into(),
        })
    }

    /// Interprets a page into vector operations. Returns `None` when the
    /// page uses content that only a rasterizer reproduces faithfully.
    pub fn record_page(&self, page: usize) -> PrintResult<Option<Vec<PageOp>>> {
        self.check_page(page)?;

        let pdf = self.lock_pdf();
        let page_ref = pdf
            .pages()
            .get(page)
            .ok_or(PrintError::unsupported_page(page, self.page_count))?;

        let recorder = record_with_device(page_ref);
        match recorder.unsupported {
            Some(reason) => {
                debug!(page, reason, "page needs a bitmap");
                Ok(None)
            }
            None => Ok(Some(recorder.ops)),
        }
    }

    fn lock_pdf(&self) -> MutexGuard<'_, Pdf> {
        self.pdf
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn record_with_device(page: &Page<'_>) -> VectorRecorder {
    let mut context = Context::new(
        page.initial_transform(true),
        page.intersected_crop_box().to_kurbo(),
        page.xref(),
        InterpreterSettings::default(),
    );
    let mut device = VectorRecorder::default();
    interpret_page(page, &mut context, &mut device);
    device
}

/// Maps a device space of one unit per point onto DIPs.
fn points_to_dips() -> Affine {
    Affine::scale((DIPS_PER_INCH / POINTS_PER_INCH) as f64)
}

/// Records what hayro draws as DIP-space operations.
#[derive(Default)]
struct VectorRecorder {
    ops: Vec<PageOp>,
    unsupported: Option<&'static str>,
}

impl VectorRecorder {
    fn reject(&mut self, reason: &'static str) {
        if self.unsupported.is_none() {
            self.unsupported = Some(reason);
        }
    }

    fn solid(&mut self, paint: &Paint<'_>) -> Option<SolidColor> {
        match paint {
            Paint::Color(color) => {
                let [r, g, b, a] = color.to_rgba().to_rgba8();
                Some(SolidColor::rgba(r, g, b, a))
            }
            Paint::Pattern(_) => {
                self.reject("pattern paint");
                None
            }
        }
    }

    fn fill(&mut self, path: &BezPath, transform: Affine, paint: &Paint<'_>, fill_rule: FillRule) {
        let Some(color) = self.solid(paint) else {
            return;
        };
        let figures = outline_figures(path, points_to_dips() * transform);
        if !figures.is_empty() {
            self.ops.push(PageOp::Fill {
                figures,
                color,
                fill_rule,
            });
        }
    }

    /// Expands the stroke to an outline in user space and fills it.
    fn stroke(&mut self, path: &BezPath, transform: Affine, paint: &Paint<'_>, props: &StrokeProps) {
        let scale = (points_to_dips() * transform).determinant().abs().sqrt();
        if !scale.is_normal() {
            return;
        }
        // zero width strokes are drawn as thin as the device allows
        let width = if props.line_width > 0.0 {
            props.line_width as f64
        } else {
            1.0 / scale
        };
        let style = Stroke::new(width)
            .with_caps(props.line_cap)
            .with_join(props.line_join)
            .with_miter_limit(props.miter_limit as f64)
            .with_dashes(
                props.dash_offset as f64,
                props.dash_array.iter().map(|dash| *dash as f64),
            );
        let outline = kurbo::stroke(
            path.iter(),
            &style,
            &StrokeOpts::default(),
            FLATTEN_TOLERANCE / scale,
        );
        self.fill(&outline, transform, paint, FillRule::NonZero);
    }

    fn image(&mut self, image: Image<'_, '_>, transform: Affine) {
        let transform = points_to_dips() * transform;
        let [a, b, c, d, _, _] = transform.as_coeffs();
        if b.abs() > f64::EPSILON || c.abs() > f64::EPSILON || a <= 0.0 || d <= 0.0 {
            self.reject("rotated or mirrored image");
            return;
        }

        let raster = match image {
            Image::Raster(raster) => raster,
            Image::Stencil(_) => {
                self.reject("stencil mask");
                return;
            }
        };
        let bounds = transform.transform_rect_bbox(Rect::new(
            0.0,
            0.0,
            raster.width() as f64,
            raster.height() as f64,
        ));

        let mut frame = None;
        raster.with_rgba(|rgb, alpha| frame = rgba_frame(rgb, alpha), None);
        match frame {
            Some(frame) => self.ops.push(PageOp::Image {
                frame,
                dest: PageRect::new(
                    bounds.x0 as f32,
                    bounds.y0 as f32,
                    bounds.width() as f32,
                    bounds.height() as f32,
                ),
            }),
            None => self.reject("undecodable image"),
        }
    }
}

fn rgba_frame(rgb: RgbData, alpha: Option<LumaData>) -> Option<RgbaFrame> {
    let pixel_count = rgb.width as usize * rgb.height as usize;
    if pixel_count == 0 || rgb.data.len() != pixel_count * 3 {
        return None;
    }
    let pixels: Vec<u8> = match alpha {
        None => rgb
            .data
            .chunks_exact(3)
            .flat_map(|px| [px[0], px[1], px[2], 255])
            .collect(),
        Some(alpha) if alpha.width == rgb.width && alpha.height == rgb.height => rgb
            .data
            .chunks_exact(3)
            .zip(alpha.data)
            .flat_map(|(px, a)| [px[0], px[1], px[2], a])
            .collect(),
        Some(_) => return None,
    };
    Some(RgbaFrame {
        width: rgb.width,
        height: rgb.height,
        pixels: pixels.into(),
    })
}

impl<'a> Device<'a> for VectorRecorder {
    fn set_soft_mask(&mut self, mask: Option<SoftMask<'a>>) {
        if mask.is_some() {
            self.reject("soft mask");
        }
    }

    fn set_blend_mode(&mut self, blend_mode: BlendMode) {
        if blend_mode != BlendMode::Normal {
            self.reject("blend mode");
        }
    }

    fn draw_path(
        &mut self,
        path: &BezPath,
        transform: Affine,
        paint: &Paint<'a>,
        draw_mode: &PathDrawMode,
    ) {
        match draw_mode {
            PathDrawMode::Fill(rule) => self.fill(path, transform, paint, fill_rule(*rule)),
            PathDrawMode::Stroke(props) => self.stroke(path, transform, paint, props),
        }
    }

    fn push_clip_path(&mut self, clip_path: &ClipPath) {
        // clip paths arrive in device space
        self.ops.push(PageOp::PushClip {
            figures: outline_figures(&clip_path.path, points_to_dips()),
            fill_rule: fill_rule(clip_path.fill),
        });
    }

    fn push_transparency_group(
        &mut self,
        opacity: f32,
        mask: Option<SoftMask<'a>>,
        blend_mode: BlendMode,
    ) {
        if opacity < 1.0 || mask.is_some() || blend_mode != BlendMode::Normal {
            self.reject("transparency group");
        }
    }

    fn draw_glyph(
        &mut self,
        glyph: &Glyph<'a>,
        transform: Affine,
        glyph_transform: Affine,
        paint: &Paint<'a>,
        draw_mode: &GlyphDrawMode,
    ) {
        match (glyph, draw_mode) {
            (_, GlyphDrawMode::Invisible) => {}
            (Glyph::Outline(outline), GlyphDrawMode::Fill) => self.fill(
                &outline.outline(),
                transform * glyph_transform,
                paint,
                FillRule::NonZero,
            ),
            (Glyph::Outline(outline), GlyphDrawMode::Stroke(props)) => {
                self.stroke(&(glyph_transform * outline.outline()), transform, paint, props)
            }
            (Glyph::Type3(glyph), _) => glyph.interpret(self, transform, glyph_transform, paint),
        }
    }

    fn draw_image(&mut self, image: Image<'a, '_>, transform: Affine) {
        self.image(image, transform);
    }

    fn pop_clip_path(&mut self) {
        self.ops.push(PageOp::PopClip);
    }

    fn pop_transparency_group(&mut self) {}
}

fn fill_rule(rule: hayro::hayro_interpret::FillRule) -> FillRule {
    match rule {
        hayro::hayro_interpret::FillRule::NonZero => FillRule::NonZero,
        hayro::hayro_interpret::FillRule::EvenOdd => FillRule::EvenOdd,
    }
}

pub(crate) fn read_pdf_bytes(path: &Path) -> PrintResult<Vec<u8>> {
    if path.as_os_str().is_empty() {
        return Err(PrintError::invalid_argument("pdf path must not be empty"));
    }
    if !path.exists() {
        return Err(PrintError::io_with_context(
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing file"),
            format!("pdf file not found: {}", path.display()),
        ));
    }
    if !path.is_file() {
        return Err(PrintError::invalid_argument(
            "pdf path must be a regular file",
        ));
    }

    let bytes = std::fs::read(path).map_err(|source| {
        PrintError::io_with_context(source, format!("failed to read {}", path.display()))
    })?;
    if !bytes.starts_with(b"%PDF-") {
        return Err(PrintError::invalid_argument(
            "input is not a valid PDF header",
        ));
    }
    Ok(bytes)
}

pub(crate) fn calculate_doc_id(path: &Path, byte_len: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    byte_len.hash(&mut hasher);
    hasher.finish()
}

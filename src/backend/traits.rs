use std::path::Path;
use std::sync::Arc;

use crate::error::{PrintError, PrintResult};

use super::vector::PageOp;

/// Device-independent pixels per inch; the unit of page sizes in this crate.
pub const DIPS_PER_INCH: f32 = 96.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Arc<[u8]>,
}

impl RgbaFrame {
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    pub fn pixels_to_vec(&self) -> Vec<u8> {
        self.pixels.as_ref().to_vec()
    }

    pub fn encode_png(&self) -> PrintResult<Vec<u8>> {
        let image = image::RgbaImage::from_raw(self.width, self.height, self.pixels_to_vec())
            .ok_or_else(|| PrintError::invalid_argument("frame buffer does not match its size"))?;
        let mut png = std::io::Cursor::new(Vec::new());
        image.write_to(&mut png, image::ImageFormat::Png)?;
        Ok(png.into_inner())
    }
}

/// Page dimensions in DIPs (1/96 inch).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn from_points(width: f32, height: f32) -> Self {
        let factor = DIPS_PER_INCH / 72.0;
        Self::new(width * factor, height * factor)
    }

    pub fn is_valid(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }

    /// Pixel size of the page rasterized at `dpi`.
    pub fn to_pixels(&self, dpi: f32) -> (u32, u32) {
        let factor = dpi / DIPS_PER_INCH;
        (
            (self.width * factor).round().max(1.0) as u32,
            (self.height * factor).round().max(1.0) as u32,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PageRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl PageRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_size(size: PageSize) -> Self {
        Self::new(0.0, 0.0, size.width, size.height)
    }

    pub fn size(&self) -> PageSize {
        PageSize::new(self.width, self.height)
    }
}

/// A decoded source document. Page indices are 0-based.
pub trait DocumentBackend: Send + Sync {
    fn path(&self) -> &Path;
    fn doc_id(&self) -> u64;
    fn page_count(&self) -> usize;
    fn page_size(&self, page: usize) -> PrintResult<PageSize>;

    /// Rasterizes a page; a scale of 1.0 maps one DIP to one pixel.
    fn render_page(&self, page: usize, x_scale: f32, y_scale: f32) -> PrintResult<RgbaFrame>;

    fn render_page_to_size(&self, page: usize, width: u32, height: u32) -> PrintResult<RgbaFrame> {
        if width == 0 || height == 0 {
            return Err(PrintError::invalid_argument(
                "render size must be at least one pixel",
            ));
        }
        let size = self.page_size(page)?;
        self.render_page(
            page,
            width as f32 / size.width,
            height as f32 / size.height,
        )
    }

    fn render_page_at_dpi(&self, page: usize, dpi: f32) -> PrintResult<RgbaFrame> {
        if !dpi.is_finite() || dpi <= 0.0 {
            return Err(PrintError::invalid_argument("dpi must be positive"));
        }
        let scale = dpi / DIPS_PER_INCH;
        self.render_page(page, scale, scale)
    }

    /// Records a page as vector operations in DIPs. `None` means the page
    /// can only be reproduced as a bitmap.
    fn record_page(&self, page: usize) -> PrintResult<Option<Vec<PageOp>>> {
        self.check_page(page)?;
        Ok(None)
    }

    fn check_page(&self, page: usize) -> PrintResult<()> {
        let page_count = self.page_count();
        if page >= page_count {
            return Err(PrintError::unsupported_page(page, page_count));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{PageSize, RgbaFrame};

    #[test]
    fn points_convert_to_dips() {
        let letter = PageSize::from_points(612.0, 792.0);
        assert!((letter.width - 816.0).abs() < 0.01);
        assert!((letter.height - 1056.0).abs() < 0.01);
        assert_eq!(letter.to_pixels(150.0), (1275, 1650));
    }

    #[test]
    fn encode_png_writes_png_signature() {
        let frame = RgbaFrame {
            width: 2,
            height: 2,
            pixels: Arc::from(vec![0xff_u8; 16]),
        };
        let png = frame.encode_png().expect("png should encode");
        assert!(png.starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[test]
    fn encode_png_rejects_mismatched_buffer() {
        let frame = RgbaFrame {
            width: 4,
            height: 4,
            pixels: Arc::from(vec![0_u8; 3]),
        };
        assert!(frame.encode_png().is_err());
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::document::{DocumentOptions, PdfOptions, PdfPrintingMode, PreviewSettings};
use crate::error::{PrintError, PrintResult};
use crate::xps::{RasterOptions, RenderingMode, SolidColor};

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub preview: PreviewConfig,
    pub pdf: PdfConfig,
    pub cache: CacheConfig,
    pub spool: SpoolConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreviewConfig {
    pub dpi: f32,
    pub gate_poll_ms: u64,
    pub text_rendering: RenderingMode,
    pub non_text_rendering: RenderingMode,
    pub minimal_line_width: Option<f32>,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            dpi: 96.0,
            gate_poll_ms: 100,
            text_rendering: RenderingMode::Antialiased,
            non_text_rendering: RenderingMode::Antialiased,
            minimal_line_width: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PdfConfig {
    pub printing_mode: PdfPrintingMode,
    pub raster_dpi: f32,
    pub ignore_high_contrast: bool,
    /// `#RRGGBB` or `#AARRGGBB`.
    pub background: String,
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            printing_mode: PdfPrintingMode::Direct,
            raster_dpi: 150.0,
            ignore_high_contrast: false,
            background: "#FFFFFF".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub memory_budget_mb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 8,
            memory_budget_mb: 128,
        }
    }
}

impl CacheConfig {
    const MEBIBYTE: usize = 1024 * 1024;

    pub fn memory_budget_bytes(&self) -> usize {
        self.memory_budget_mb.saturating_mul(Self::MEBIBYTE).max(1)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SpoolConfig {
    pub directory: PathBuf,
    pub poll_interval_ms: u64,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join("cpd-spool"),
            poll_interval_ms: 200,
        }
    }
}

impl Config {
    pub fn load() -> PrintResult<Self> {
        let Some(path) = default_config_path() else {
            return Ok(Self::default());
        };
        Self::load_from_path(path)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> PrintResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        if !path.is_file() {
            return Err(PrintError::invalid_argument(format!(
                "config path is not a regular file: {}",
                path.display()
            )));
        }

        let raw = fs::read_to_string(path).map_err(|source| {
            PrintError::io_with_context(source, format!("failed to read config: {}", path.display()))
        })?;
        let parsed = toml::from_str::<Self>(&raw).map_err(|source| {
            PrintError::invalid_argument(format!(
                "failed to parse config {}: {source}",
                path.display()
            ))
        })?;
        Ok(parsed.sanitized())
    }

    fn sanitized(mut self) -> Self {
        if !self.preview.dpi.is_finite() || self.preview.dpi < 1.0 {
            self.preview.dpi = PreviewConfig::default().dpi;
        }
        self.preview.gate_poll_ms = self.preview.gate_poll_ms.max(1);
        self.preview.minimal_line_width = self
            .preview
            .minimal_line_width
            .filter(|width| width.is_finite() && *width > 0.0);
        if !self.pdf.raster_dpi.is_finite() || self.pdf.raster_dpi < 1.0 {
            self.pdf.raster_dpi = PdfConfig::default().raster_dpi;
        }
        if parse_hex_color(&self.pdf.background).is_none() {
            self.pdf.background = PdfConfig::default().background;
        }
        self.cache.max_entries = self.cache.max_entries.max(1);
        self.spool.poll_interval_ms = self.spool.poll_interval_ms.max(1);
        self
    }

    pub fn preview_settings(&self) -> PreviewSettings {
        PreviewSettings {
            dpi: self.preview.dpi,
            gate_poll_interval: Duration::from_millis(self.preview.gate_poll_ms),
            cache_entries: self.cache.max_entries,
            cache_memory_bytes: self.cache.memory_budget_bytes(),
        }
    }

    pub fn pdf_options(&self) -> PdfOptions {
        PdfOptions {
            printing_mode: self.pdf.printing_mode,
            raster_dpi: self.pdf.raster_dpi,
            ignore_high_contrast: self.pdf.ignore_high_contrast,
            background: parse_hex_color(&self.pdf.background).unwrap_or(SolidColor::WHITE),
        }
    }

    pub fn raster_options(&self) -> RasterOptions {
        RasterOptions {
            text_rendering: self.preview.text_rendering,
            non_text_rendering: self.preview.non_text_rendering,
            minimal_line_width: self.preview.minimal_line_width,
        }
    }

    pub fn document_options(&self) -> DocumentOptions {
        DocumentOptions {
            pdf: self.pdf_options(),
            xps: self.raster_options(),
            preview: self.preview_settings(),
        }
    }
}

fn parse_hex_color(value: &str) -> Option<SolidColor> {
    let hex = value.trim().strip_prefix('#')?;
    if !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    let byte = |index: usize| u8::from_str_radix(hex.get(index..index + 2)?, 16).ok();
    match hex.len() {
        6 => Some(SolidColor::rgba(byte(0)?, byte(2)?, byte(4)?, 255)),
        8 => Some(SolidColor::rgba(byte(2)?, byte(4)?, byte(6)?, byte(0)?)),
        _ => None,
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os("CPD_CONFIG_PATH")
        && !explicit.is_empty()
    {
        return Some(PathBuf::from(explicit));
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME")
        && !xdg.is_empty()
    {
        return Some(PathBuf::from(xdg).join("cpd").join("config.toml"));
    }
    if let Some(home) = std::env::var_os("HOME")
        && !home.is_empty()
    {
        return Some(
            PathBuf::from(home)
                .join(".config")
                .join("cpd")
                .join("config.toml"),
        );
    }
    if let Some(appdata) = std::env::var_os("APPDATA")
        && !appdata.is_empty()
    {
        return Some(PathBuf::from(appdata).join("cpd").join("config.toml"));
    }
    None
}

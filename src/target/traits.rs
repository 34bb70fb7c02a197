use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::{PageRect, PageSize};
use crate::error::PrintResult;
use crate::render::Surface;
use crate::xps::{FixedPage, PartUri};

use super::status::{AdviseCookie, StatusSink};

/// Job page number meaning "whatever page the application considers current".
pub const JOB_PAGE_APPLICATION_DEFINED: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCountType {
    Final,
}

/// The print subsystem's preview pane.
pub trait PreviewTarget: Send + Sync {
    fn set_job_page_count(&self, count_type: PageCountType, count: u32) -> PrintResult<()>;
    fn draw_page(&self, job_page: u32, surface: &Surface, dpi_x: f32, dpi_y: f32)
    -> PrintResult<()>;
    fn invalidate_preview(&self) -> PrintResult<()>;
}

/// Sequential, append-only writer of the final package.
pub trait PackageWriter: Send {
    fn start_new_document(&mut self, name: &PartUri) -> PrintResult<()>;
    fn add_page(&mut self, page: FixedPage) -> PrintResult<()>;
    fn close(&mut self) -> PrintResult<()>;
}

/// The destination the print subsystem hands out for one job.
pub trait DocumentPackageTarget: Send + Sync {
    /// `None` when the target has no preview pane (unattended printing).
    fn preview_target(&self) -> Option<Arc<dyn PreviewTarget>>;

    fn xps_writer(
        &self,
        sequence: &PartUri,
        discard_control: &PartUri,
    ) -> PrintResult<Box<dyn PackageWriter>>;

    /// Aborts the job; writes after this fail with `PrintError::Canceled`.
    fn cancel(&self);

    /// `None` when the target offers no status connection point.
    fn advise(&self, sink: Arc<dyn StatusSink>) -> Option<AdviseCookie>;
    fn unadvise(&self, cookie: AdviseCookie);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageDescription {
    pub page_size: PageSize,
    pub imageable_rect: PageRect,
    pub dpi_x: u32,
    pub dpi_y: u32,
}

impl Default for PageDescription {
    /// US Letter with half-inch margins at 96 DPI.
    fn default() -> Self {
        let page_size = PageSize::new(816.0, 1056.0);
        Self {
            page_size,
            imageable_rect: PageRect::new(48.0, 48.0, 720.0, 960.0),
            dpi_x: 96,
            dpi_y: 96,
        }
    }
}

pub trait PrintTaskOptions: Send + Sync {
    fn page_description(&self, job_page: u32) -> PrintResult<PageDescription>;
}

/// Task options that describe every page the same way.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformTaskOptions(pub PageDescription);

impl PrintTaskOptions for UniformTaskOptions {
    fn page_description(&self, _job_page: u32) -> PrintResult<PageDescription> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

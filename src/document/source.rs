//! Host-facing contracts of a print document source.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::error::PrintResult;
use crate::target::{DocumentPackageTarget, PackageStatus, PrintTaskOptions};

/// Lifecycle of one print session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Idle,
    Negotiating,
    PreviewLoop,
    FinalProduction,
    Completed,
    Canceled,
    Failed,
    Disposed,
}

impl DocumentState {
    /// No further work happens in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Canceled | Self::Failed | Self::Disposed
        )
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::PreviewLoop => "preview",
            Self::FinalProduction => "production",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
            Self::Disposed => "disposed",
        };
        f.write_str(label)
    }
}

/// A package status as seen by the document's subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentStatus {
    #[serde(flatten)]
    pub status: PackageStatus,
    /// Total page count of the source, when already known.
    pub total_pages: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub type StatusCallback = Box<dyn Fn(&DocumentStatus) + Send + Sync>;

/// The preview half of the page source: called repeatedly by the preview
/// pane while the user changes settings.
pub trait PreviewPageCollection: Send + Sync {
    /// Prepares for rendering with the current settings. Never renders.
    fn paginate(&self, current_job_page: u32, options: &dyn PrintTaskOptions) -> PrintResult<()>;

    /// Renders one page to the preview pane. Out-of-range pages are ignored.
    fn make_page(&self, desired_job_page: u32, width: f32, height: f32) -> PrintResult<()>;
}

pub trait PrintDocumentPageSource: Send + Sync {
    fn get_preview_page_collection(
        &self,
        target: Arc<dyn DocumentPackageTarget>,
    ) -> PrintResult<Arc<dyn PreviewPageCollection>>;

    /// Produces the final package. Blocks until the package is closed.
    fn make_document(
        &self,
        options: &dyn PrintTaskOptions,
        target: Option<Arc<dyn DocumentPackageTarget>>,
    ) -> PrintResult<()>;
}

/// Everything a print host needs from an opened document.
pub trait PrintDocumentSource: PrintDocumentPageSource {
    fn file_path(&self) -> &Path;

    /// `None` until the document has been decoded.
    fn total_pages(&self) -> Option<u32>;

    fn state(&self) -> DocumentState;

    fn cancel(&self);

    fn dispose(&self);

    fn subscribe(&self, callback: StatusCallback) -> SubscriptionId;

    /// Returns `false` when the subscription was already gone.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    fn subscribe_channel(&self) -> flume::Receiver<DocumentStatus>;
}

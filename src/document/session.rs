//! Format-independent state of one print session.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, trace, warn};

use crate::error::{PrintError, PrintResult};
use crate::handle::SharedHandle;
use crate::render::{RasterDevice, RenderDevice};
use crate::stats::PreviewStats;
use crate::target::{
    DocumentPackageTarget, PackageCompletion, PackageStatus, PrintTaskOptions, StatusRelay,
};
use crate::xps::PartUri;

use super::preview::{PreviewRenderTarget, PreviewSettings};
use super::source::{DocumentState, DocumentStatus, StatusCallback, SubscriptionId};

enum Subscriber {
    Callback(Arc<dyn Fn(&DocumentStatus) + Send + Sync>),
    Channel(flume::Sender<DocumentStatus>),
}

/// What a production run may touch.
pub struct ProductionContext<'a> {
    target: &'a dyn DocumentPackageTarget,
    options: &'a dyn PrintTaskOptions,
    canceled: &'a AtomicBool,
    document_name: PartUri,
}

impl<'a> ProductionContext<'a> {
    pub fn target(&self) -> &'a dyn DocumentPackageTarget {
        self.target
    }

    pub fn task_options(&self) -> &'a dyn PrintTaskOptions {
        self.options
    }

    /// Part name derived from the source file's stem.
    pub fn document_name(&self) -> &PartUri {
        &self.document_name
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn check_canceled(&self) -> PrintResult<()> {
        if self.is_canceled() {
            return Err(PrintError::Canceled);
        }
        Ok(())
    }
}

pub(crate) struct DocumentSession {
    path: PathBuf,
    state: Mutex<DocumentState>,
    total_pages: Mutex<Option<u32>>,
    canceled: AtomicBool,
    disposed: AtomicBool,
    terminal_relayed: AtomicBool,
    package_target: SharedHandle<Arc<dyn DocumentPackageTarget>>,
    preview: Mutex<Option<Arc<PreviewRenderTarget>>>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
    device: Mutex<Arc<dyn RenderDevice>>,
    settings: PreviewSettings,
}

impl DocumentSession {
    pub(crate) fn new(path: PathBuf, settings: PreviewSettings) -> Self {
        Self {
            path,
            state: Mutex::new(DocumentState::Idle),
            total_pages: Mutex::new(None),
            canceled: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            terminal_relayed: AtomicBool::new(false),
            package_target: SharedHandle::empty(),
            preview: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            device: Mutex::new(Arc::new(RasterDevice::new())),
            settings,
        }
    }

    /// Device used for preview surfaces bound after this call.
    pub(crate) fn set_device(&self, device: Arc<dyn RenderDevice>) {
        *lock(&self.device) = device;
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn state(&self) -> DocumentState {
        *lock(&self.state)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_live(&self) -> PrintResult<()> {
        if self.is_disposed() {
            return Err(PrintError::Disposed);
        }
        Ok(())
    }

    fn transition(&self, next: DocumentState) {
        let mut state = lock(&self.state);
        if *state == next || *state == DocumentState::Disposed {
            return;
        }
        debug!(path = %self.path.display(), from = %*state, to = %next, "document state");
        *state = next;
    }

    /// Enters the preview loop unless the session already moved past it.
    pub(crate) fn enter_preview_loop(&self) {
        let state = self.state();
        if matches!(state, DocumentState::Idle | DocumentState::Negotiating) {
            self.transition(DocumentState::PreviewLoop);
        }
    }

    pub(crate) fn total_pages(&self) -> Option<u32> {
        *lock(&self.total_pages)
    }

    /// Records the decoded page count and reports it to a bound preview.
    pub(crate) fn set_total_pages(&self, count: u32) {
        *lock(&self.total_pages) = Some(count);
        if let Some(preview) = self.preview()
            && let Err(err) = preview.report_page_count(count)
        {
            warn!(count, error = %err, "failed to report page count to preview");
        }
    }

    pub(crate) fn preview(&self) -> Option<Arc<PreviewRenderTarget>> {
        lock(&self.preview)
            .as_ref()
            .filter(|preview| !preview.is_disposed())
            .cloned()
    }

    pub(crate) fn preview_stats(&self) -> Option<PreviewStats> {
        self.preview().map(|preview| preview.snapshot_stats())
    }

    /// Binds a fresh render target to the package target's preview pane,
    /// disposing any earlier binding.
    pub(crate) fn bind_preview(
        &self,
        target: &dyn DocumentPackageTarget,
    ) -> PrintResult<Option<Arc<PreviewRenderTarget>>> {
        self.ensure_live()?;
        self.transition(DocumentState::Negotiating);

        let render_target = target.preview_target().map(|preview| {
            Arc::new(PreviewRenderTarget::new(
                preview,
                Arc::clone(&*lock(&self.device)),
                self.settings,
            ))
        });
        let previous = std::mem::replace(&mut *lock(&self.preview), render_target.clone());
        if let Some(previous) = previous {
            previous.dispose();
        }

        match &render_target {
            Some(render_target) => {
                if let Some(count) = self.total_pages() {
                    render_target.report_page_count(count)?;
                }
            }
            None => debug!(path = %self.path.display(), "package target has no preview pane"),
        }
        Ok(render_target)
    }

    pub(crate) fn release_preview(&self) {
        if let Some(preview) = lock(&self.preview).take() {
            preview.dispose();
        }
    }

    pub(crate) fn subscribe(&self, callback: StatusCallback) -> SubscriptionId {
        self.add_subscriber(Subscriber::Callback(Arc::from(callback)))
    }

    pub(crate) fn subscribe_channel(&self) -> flume::Receiver<DocumentStatus> {
        let (tx, rx) = flume::unbounded();
        self.add_subscriber(Subscriber::Channel(tx));
        rx
    }

    fn add_subscriber(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        if !self.is_disposed() {
            lock(&self.subscribers).push((id, subscriber));
        }
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    /// Forwards one package status to every subscriber, unmodified.
    pub(crate) fn relay_status(&self, status: &PackageStatus) {
        if status.completion.is_terminal() {
            self.terminal_relayed.store(true, Ordering::SeqCst);
        }
        let event = DocumentStatus {
            status: status.clone(),
            total_pages: self.total_pages(),
        };
        trace!(
            job_id = status.job_id,
            progress = %status.progress_text(),
            completion = ?status.completion,
            "relaying package status"
        );

        let callbacks: Vec<_> = {
            let mut subscribers = lock(&self.subscribers);
            subscribers.retain(|(_, subscriber)| match subscriber {
                Subscriber::Channel(tx) => !tx.is_disconnected(),
                Subscriber::Callback(_) => true,
            });
            subscribers
                .iter()
                .filter_map(|(_, subscriber)| match subscriber {
                    Subscriber::Callback(callback) => Some(Arc::clone(callback)),
                    Subscriber::Channel(tx) => {
                        let _ = tx.send(event.clone());
                        None
                    }
                })
                .collect()
        };
        for callback in callbacks {
            callback(&event);
        }
    }

    /// Runs one production job against `target`.
    ///
    /// Cancellation ends the job quietly. Any other failure is reported to
    /// subscribers as a `Failed` status, unless the package already sent a
    /// terminal status, and then returned. The preview binding, the retained
    /// package target and the status subscription are released on every path.
    pub(crate) fn run_production(
        self: &Arc<Self>,
        options: &dyn PrintTaskOptions,
        target: Option<Arc<dyn DocumentPackageTarget>>,
        produce: impl FnOnce(&ProductionContext<'_>) -> PrintResult<()>,
    ) -> PrintResult<()> {
        let Some(target) = target else {
            return Err(PrintError::invalid_argument(
                "make_document requires a package target",
            ));
        };
        self.ensure_live()?;
        let document_name = document_part_name(&self.path)?;

        info!(path = %self.path.display(), "starting final production");
        self.transition(DocumentState::FinalProduction);
        self.terminal_relayed.store(false, Ordering::SeqCst);
        self.package_target.replace(Arc::clone(&target));
        if self.canceled.load(Ordering::SeqCst) {
            target.cancel();
        }

        let relay = Arc::new(StatusRelay::new(self, Self::relay_status));
        let cookie = target.advise(relay);
        if cookie.is_none() {
            debug!("package target offers no status connection point");
        }

        let context = ProductionContext {
            target: target.as_ref(),
            options,
            canceled: &self.canceled,
            document_name,
        };
        let result = produce(&context);

        if let Some(cookie) = cookie {
            target.unadvise(cookie);
        }
        let outcome = match result {
            Ok(()) => {
                info!(path = %self.path.display(), "final production finished");
                self.transition(DocumentState::Completed);
                Ok(())
            }
            Err(err) if err.is_canceled() => {
                info!(path = %self.path.display(), "print job canceled");
                self.transition(DocumentState::Canceled);
                Ok(())
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "final production failed");
                self.transition(DocumentState::Failed);
                if !self.terminal_relayed.load(Ordering::SeqCst) {
                    let mut status = PackageStatus::new(0, PackageCompletion::Failed);
                    status.current_page_total = self.total_pages().unwrap_or(0);
                    self.relay_status(&status);
                }
                Err(err)
            }
        };

        self.release_preview();
        self.package_target.release();
        outcome
    }

    pub(crate) fn cancel(&self) {
        if self.state().is_terminal() {
            trace!(state = %self.state(), "cancel after completion ignored");
            return;
        }
        if !self.canceled.swap(true, Ordering::SeqCst) {
            info!(path = %self.path.display(), "cancel requested");
        }
        if let Some(target) = self.package_target.cloned() {
            target.cancel();
        }
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_preview();
        self.package_target.release();
        lock(&self.subscribers).clear();
        self.transition(DocumentState::Disposed);
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// `/<file stem>` with characters outside a safe part-name set replaced.
fn document_part_name(path: &Path) -> PrintResult<PartUri> {
    let stem: String = path
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_matches('.');
    let name = if stem.is_empty() { "document" } else { stem };
    PartUri::from_root(name)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

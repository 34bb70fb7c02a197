//! Package status notifications.
//!
//! A [`StatusDispatcher`] plays the role of the package target's connection
//! point: sinks are advised on it and every published status is delivered
//! to them, in publish order, from one dispatcher thread. Advise and
//! unadvise travel through the same queue, so a sink sees every status
//! published before it was unadvised and none after.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use serde::Serialize;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageCompletion {
    InProgress,
    Submitted,
    Canceled,
    Abandoned,
    Failed,
}

impl PackageCompletion {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageStatus {
    pub job_id: u32,
    pub current_document: u32,
    pub current_page: u32,
    pub current_page_total: u32,
    pub completion: PackageCompletion,
}

impl PackageStatus {
    pub fn new(job_id: u32, completion: PackageCompletion) -> Self {
        Self {
            job_id,
            current_document: 0,
            current_page: 0,
            current_page_total: 0,
            completion,
        }
    }

    pub fn progress_text(&self) -> String {
        format!("{}/{}", self.current_page, self.current_page_total)
    }
}

/// Receiver of package status updates (the connection-point sink).
pub trait StatusSink: Send + Sync {
    fn package_status_updated(&self, status: &PackageStatus);
}

impl<F> StatusSink for F
where
    F: Fn(&PackageStatus) + Send + Sync,
{
    fn package_status_updated(&self, status: &PackageStatus) {
        self(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdviseCookie(pub u64);

/// Sink that forwards each update to the one owner it was created for.
///
/// Holds the owner weakly: the package target keeps its sinks alive, and
/// the owner keeps the package target alive.
pub struct StatusRelay<T: Send + Sync + 'static> {
    owner: Weak<T>,
    forward: fn(&T, &PackageStatus),
}

impl<T: Send + Sync + 'static> StatusRelay<T> {
    pub fn new(owner: &Arc<T>, forward: fn(&T, &PackageStatus)) -> Self {
        Self {
            owner: Arc::downgrade(owner),
            forward,
        }
    }
}

impl<T: Send + Sync + 'static> StatusSink for StatusRelay<T> {
    fn package_status_updated(&self, status: &PackageStatus) {
        match self.owner.upgrade() {
            Some(owner) => (self.forward)(&owner, status),
            None => trace!(?status, "status relay owner is gone"),
        }
    }
}

enum DispatchMessage {
    Advise(AdviseCookie, Arc<dyn StatusSink>),
    Unadvise(AdviseCookie, Option<flume::Sender<()>>),
    Publish(PackageStatus),
    Shutdown,
}

/// Cloneable publishing side handed to package writers.
#[derive(Clone)]
pub struct StatusPublisher {
    tx: flume::Sender<DispatchMessage>,
    terminal_sent: Arc<AtomicBool>,
    latest: Arc<Mutex<Option<PackageStatus>>>,
}

impl StatusPublisher {
    pub fn publish(&self, status: PackageStatus) {
        if status.completion.is_terminal() {
            self.terminal_sent.store(true, Ordering::SeqCst);
        }
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(status.clone());
        }
        if self.tx.send(DispatchMessage::Publish(status)).is_err() {
            warn!("status dispatcher is gone; dropping status update");
        }
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }
}

pub struct StatusDispatcher {
    publisher: StatusPublisher,
    next_cookie: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    job_id: u32,
}

impl StatusDispatcher {
    pub fn spawn(job_id: u32) -> std::io::Result<Self> {
        let (tx, rx) = flume::unbounded::<DispatchMessage>();
        let worker = thread::Builder::new()
            .name(format!("cpd-status-{job_id}"))
            .spawn(move || dispatch_loop(rx))?;
        let worker_id = worker.thread().id();

        Ok(Self {
            publisher: StatusPublisher {
                tx,
                terminal_sent: Arc::new(AtomicBool::new(false)),
                latest: Arc::new(Mutex::new(None)),
            },
            next_cookie: AtomicU64::new(1),
            worker: Mutex::new(Some(worker)),
            worker_id,
            job_id,
        })
    }

    pub fn publisher(&self) -> StatusPublisher {
        self.publisher.clone()
    }

    pub fn advise(&self, sink: Arc<dyn StatusSink>) -> AdviseCookie {
        let cookie = AdviseCookie(self.next_cookie.fetch_add(1, Ordering::SeqCst));
        if self
            .publisher
            .tx
            .send(DispatchMessage::Advise(cookie, sink))
            .is_err()
        {
            warn!(cookie = cookie.0, "status dispatcher is gone; advise ignored");
        }
        cookie
    }

    /// Returns once every status published before this call has reached
    /// the sink. Called from inside a sink callback it returns immediately.
    pub fn unadvise(&self, cookie: AdviseCookie) {
        let on_worker = thread::current().id() == self.worker_id;
        let (ack_tx, ack_rx) = flume::bounded(1);
        let ack = (!on_worker).then_some(ack_tx);
        if self
            .publisher
            .tx
            .send(DispatchMessage::Unadvise(cookie, ack))
            .is_err()
        {
            return;
        }
        if !on_worker {
            let _ = ack_rx.recv();
        }
    }

    pub fn publish(&self, status: PackageStatus) {
        self.publisher.publish(status);
    }

    pub fn latest(&self) -> Option<PackageStatus> {
        self.publisher
            .latest
            .lock()
            .ok()
            .and_then(|latest| latest.clone())
    }

    pub fn terminal_sent(&self) -> bool {
        self.publisher.terminal_sent()
    }
}

impl Drop for StatusDispatcher {
    fn drop(&mut self) {
        if !self.terminal_sent() {
            debug!(job_id = self.job_id, "job ended without a terminal status");
            let mut status = self
                .latest()
                .unwrap_or_else(|| PackageStatus::new(self.job_id, PackageCompletion::Abandoned));
            status.completion = PackageCompletion::Abandoned;
            self.publish(status);
        }
        let _ = self.publisher.tx.send(DispatchMessage::Shutdown);

        let worker = self
            .worker
            .lock()
            .ok()
            .and_then(|mut worker| worker.take());
        if let Some(worker) = worker
            && worker.thread().id() != thread::current().id()
        {
            let _ = worker.join();
        }
    }
}

fn dispatch_loop(rx: flume::Receiver<DispatchMessage>) {
    let mut sinks: Vec<(AdviseCookie, Arc<dyn StatusSink>)> = Vec::new();
    while let Ok(message) = rx.recv() {
        match message {
            DispatchMessage::Advise(cookie, sink) => sinks.push((cookie, sink)),
            DispatchMessage::Unadvise(cookie, ack) => {
                sinks.retain(|(advised, _)| *advised != cookie);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            DispatchMessage::Publish(status) => {
                trace!(?status, sinks = sinks.len(), "dispatching package status");
                for (_, sink) in &sinks {
                    sink.package_status_updated(&status);
                }
            }
            DispatchMessage::Shutdown => break,
        }
    }
}

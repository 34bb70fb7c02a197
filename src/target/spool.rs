use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, info};

use crate::error::{PrintError, PrintResult};
use crate::xps::{PartUri, XpsPackageWriter};

use super::status::{AdviseCookie, PackageStatus, StatusDispatcher, StatusSink};
use super::traits::{CancelToken, DocumentPackageTarget, PackageWriter, PreviewTarget};

static NEXT_JOB_ID: AtomicU32 = AtomicU32::new(1);

/// Package target that spools each job to an XPS file in a per-printer
/// directory.
pub struct SpoolPackageTarget {
    output: PathBuf,
    job_id: u32,
    cancel: CancelToken,
    preview: Option<Arc<dyn PreviewTarget>>,
    status: StatusDispatcher,
}

impl SpoolPackageTarget {
    pub fn new(spool_dir: impl AsRef<Path>, printer: &str, job_name: &str) -> PrintResult<Self> {
        let printer_slug = slug(printer);
        if printer_slug.is_empty() {
            return Err(PrintError::invalid_argument("printer name must not be empty"));
        }
        let directory = spool_dir.as_ref().join(&printer_slug);
        fs::create_dir_all(&directory).map_err(|source| {
            PrintError::io_with_context(
                source,
                format!("failed to create spool directory {}", directory.display()),
            )
        })?;

        let job_id = NEXT_JOB_ID.fetch_add(1, Ordering::SeqCst);
        let job_name = match slug(job_name) {
            name if name.is_empty() => "job".to_string(),
            name => name,
        };
        let output = directory.join(format!("{job_name}-{job_id}.xps"));
        let status = StatusDispatcher::spawn(job_id).map_err(|source| {
            PrintError::io_with_context(source, "failed to start status dispatcher")
        })?;
        debug!(job_id, printer, output = %output.display(), "spool target created");

        Ok(Self {
            output,
            job_id,
            cancel: CancelToken::new(),
            preview: None,
            status,
        })
    }

    pub fn with_preview_target(mut self, preview: Arc<dyn PreviewTarget>) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn job_id(&self) -> u32 {
        self.job_id
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    pub fn latest_status(&self) -> Option<PackageStatus> {
        self.status.latest()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }
}

impl DocumentPackageTarget for SpoolPackageTarget {
    fn preview_target(&self) -> Option<Arc<dyn PreviewTarget>> {
        self.preview.clone()
    }

    fn xps_writer(
        &self,
        sequence: &PartUri,
        discard_control: &PartUri,
    ) -> PrintResult<Box<dyn PackageWriter>> {
        if self.cancel.is_canceled() {
            return Err(PrintError::Canceled);
        }
        let file = File::create(&self.output).map_err(|source| {
            PrintError::io_with_context(
                source,
                format!("failed to create spool file {}", self.output.display()),
            )
        })?;
        info!(job_id = self.job_id, output = %self.output.display(), "spooling package");

        let writer = XpsPackageWriter::new(
            BufWriter::new(file),
            sequence.clone(),
            Some(discard_control.clone()),
        )
        .with_cancel_token(self.cancel.clone())
        .with_status(self.status.publisher(), self.job_id);
        Ok(Box::new(writer))
    }

    fn cancel(&self) {
        if !self.cancel.is_canceled() {
            debug!(job_id = self.job_id, "spool job canceled");
        }
        self.cancel.cancel();
    }

    fn advise(&self, sink: Arc<dyn StatusSink>) -> Option<AdviseCookie> {
        Some(self.status.advise(sink))
    }

    fn unadvise(&self, cookie: AdviseCookie) {
        self.status.unadvise(cookie);
    }
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches(|ch| ch == '_' || ch == '.').to_string()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::{Arc, Mutex};

    use super::{SpoolPackageTarget, slug};
    use crate::backend::{PageSize, unique_temp_path};
    use crate::target::{DocumentPackageTarget, PackageCompletion, PackageStatus, StatusSink};
    use crate::xps::{FixedPage, PartUri};

    #[test]
    fn slug_keeps_safe_characters() {
        assert_eq!(slug("Office Printer #2"), "office_printer_2");
        assert_eq!(slug("  "), "");
        assert_eq!(slug("report.final"), "report.final");
    }

    #[test]
    fn spools_package_and_reports_submitted() {
        let dir = unique_temp_path("spool");
        let target = SpoolPackageTarget::new(&dir, "Test Printer", "report")
            .expect("target should be created");
        let seen = Arc::new(Mutex::new(Vec::<PackageStatus>::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |status: &PackageStatus| seen.lock().expect("lock").push(status.clone()))
                as Arc<dyn StatusSink>
        };
        let cookie = target.advise(sink).expect("spool target offers advise");

        let mut writer = target
            .xps_writer(
                &PartUri::new("/seq").expect("uri"),
                &PartUri::new("/discard").expect("uri"),
            )
            .expect("writer");
        writer
            .start_new_document(&PartUri::new("/report").expect("uri"))
            .expect("document");
        writer
            .add_page(FixedPage::new(
                PartUri::new("/page0").expect("uri"),
                PageSize::new(100.0, 100.0),
            ))
            .expect("page");
        writer.close().expect("close");
        target.unadvise(cookie);

        assert!(target.output_path().starts_with(dir.join("test_printer")));
        assert!(fs::metadata(target.output_path()).is_ok_and(|meta| meta.len() > 0));
        let seen = seen.lock().expect("lock").clone();
        assert_eq!(
            seen.last().map(|status| status.completion),
            Some(PackageCompletion::Submitted)
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn canceled_target_refuses_new_writers() {
        let dir = unique_temp_path("spool_cancel");
        let target = SpoolPackageTarget::new(&dir, "p", "").expect("target");
        target.cancel();
        target.cancel();
        assert!(target.is_canceled());
        let result = target.xps_writer(
            &PartUri::new("/seq").expect("uri"),
            &PartUri::new("/discard").expect("uri"),
        );
        assert!(result.is_err_and(|err| err.is_canceled()));
        let _ = fs::remove_dir_all(dir);
    }
}

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cpd::config::Config;
use cpd::document::{PdfPrintingMode, PrintDocumentSource, open_print_document_with};
use cpd::error::{PrintError, PrintResult};
use cpd::target::{
    DocumentPackageTarget, PackageCompletion, PackageStatus, SpoolPackageTarget,
    UniformTaskOptions,
};

#[derive(Parser, Debug)]
#[command(name = "cpd", version, about = "Spool a PDF or XPS document as an XPS print job")]
struct Cli {
    /// Printer the job is spooled for
    printer: String,

    /// Document to print (.pdf, .xps or .oxps)
    file: PathBuf,

    /// Config file (defaults to CPD_CONFIG_PATH or the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// How PDF pages are written to the package
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Print the final job status as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Direct,
    Xps,
}

impl From<ModeArg> for PdfPrintingMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Direct => Self::Direct,
            ModeArg::Xps => Self::Xps,
        }
    }
}

#[derive(Serialize)]
struct JobReport<'a> {
    printer: &'a str,
    document: String,
    output: String,
    total_pages: Option<u32>,
    #[serde(flatten)]
    status: PackageStatus,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(PackageCompletion::Failed | PackageCompletion::Abandoned) => std::process::exit(2),
        Ok(_) => {}
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cpd=info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init();
    if let Err(err) = installed {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

async fn run(cli: Cli) -> PrintResult<PackageCompletion> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(mode) = cli.mode {
        config.pdf.printing_mode = mode.into();
    }

    let document: Arc<dyn PrintDocumentSource> =
        Arc::from(open_print_document_with(&cli.file, config.document_options())?);
    let job_name = cli
        .file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target = Arc::new(SpoolPackageTarget::new(
        &config.spool.directory,
        &cli.printer,
        &job_name,
    )?);
    info!(
        printer = %cli.printer,
        document = %cli.file.display(),
        job_id = target.job_id(),
        "print job submitted"
    );

    let cookie = target.advise(Arc::new(|status: &PackageStatus| {
        debug!(
            job_id = status.job_id,
            progress = %status.progress_text(),
            completion = ?status.completion,
            "package status"
        );
    }));

    let job = {
        let document = Arc::clone(&document);
        let target = Arc::clone(&target) as Arc<dyn DocumentPackageTarget>;
        tokio::task::spawn_blocking(move || {
            document.make_document(&UniformTaskOptions::default(), Some(target))
        })
    };
    let watch = watch_job(
        &target,
        job,
        Duration::from_millis(config.spool.poll_interval_ms),
    )
    .await?;

    if let Some(cookie) = cookie {
        target.unadvise(cookie);
    }
    if let Err(err) = &watch.outcome {
        warn!(error = %err, "print job failed");
    }

    let status = watch.status;
    let completion = status.completion;
    info!(
        job_id = status.job_id,
        pages = status.current_page_total,
        polls = watch.progress_ticks,
        completion = ?completion,
        output = %target.output_path().display(),
        "print job finished"
    );

    if cli.json {
        let report = JobReport {
            printer: &cli.printer,
            document: cli.file.display().to_string(),
            output: target.output_path().display().to_string(),
            total_pages: document.total_pages(),
            status,
        };
        let json = serde_json::to_string_pretty(&report).map_err(|err| {
            PrintError::invalid_argument(format!("failed to encode job report: {err}"))
        })?;
        println!("{json}");
    }

    document.dispose();
    Ok(completion)
}

struct JobWatch {
    outcome: PrintResult<()>,
    status: PackageStatus,
    progress_ticks: usize,
}

/// Waits for `job`, logging the target's progress every `poll`, and settles
/// the terminal status of the job.
async fn watch_job<F>(
    target: &SpoolPackageTarget,
    job: F,
    poll: Duration,
) -> PrintResult<JobWatch>
where
    F: Future<Output = Result<PrintResult<()>, JoinError>>,
{
    let mut job = std::pin::pin!(job);
    let mut ticker = tokio::time::interval(poll);
    let mut progress_ticks = 0;
    let outcome = loop {
        tokio::select! {
            joined = &mut job => {
                break joined.map_err(|err| PrintError::package(format!("print job did not finish: {err}")))?;
            }
            _ = ticker.tick() => {
                if let Some(status) = target.latest_status()
                    && !status.completion.is_terminal()
                {
                    progress_ticks += 1;
                    info!(progress = %status.progress_text(), "printing ...");
                }
            }
        }
    };

    // a job that ends without publishing a terminal status still gets one
    let status = match (target.latest_status(), &outcome) {
        (Some(status), _) if status.completion.is_terminal() => status,
        (_, Err(_)) => PackageStatus::new(target.job_id(), PackageCompletion::Failed),
        _ => PackageStatus::new(target.job_id(), PackageCompletion::Abandoned),
    };
    Ok(JobWatch {
        outcome,
        status,
        progress_ticks,
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use clap::Parser;
    use cpd::backend::PageSize;
    use cpd::error::{PrintError, PrintResult};
    use cpd::target::{
        DocumentPackageTarget, PackageCompletion, PackageStatus, SpoolPackageTarget,
    };
    use cpd::xps::{FixedPage, PartUri};

    use super::{Cli, ModeArg, watch_job};

    fn spool_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("cpd_{name}_{}_{nanos}", std::process::id()))
    }

    /// Writes one page, then holds the package open for `pause`.
    fn slow_job(target: &dyn DocumentPackageTarget, pause: Duration) -> PrintResult<()> {
        let mut writer = target.xps_writer(
            &PartUri::new("/FixedDocumentSequence.fdseq")?,
            &PartUri::new("/DiscardControl.xml")?,
        )?;
        writer.start_new_document(&PartUri::new("/slow")?)?;
        writer.add_page(FixedPage::new(
            PartUri::new("/page0")?,
            PageSize::new(96.0, 96.0),
        ))?;
        std::thread::sleep(pause);
        writer.close()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_job_shows_progress_then_one_terminal_status() {
        let dir = spool_dir("watch");
        let target = Arc::new(SpoolPackageTarget::new(&dir, "Office", "slow").expect("target"));
        let terminal = Arc::new(AtomicUsize::new(0));
        let cookie = {
            let terminal = Arc::clone(&terminal);
            target
                .advise(Arc::new(move |status: &PackageStatus| {
                    if status.completion.is_terminal() {
                        terminal.fetch_add(1, Ordering::SeqCst);
                    }
                }))
                .expect("spool targets accept sinks")
        };

        let job = {
            let target = Arc::clone(&target);
            tokio::task::spawn_blocking(move || slow_job(&*target, Duration::from_millis(200)))
        };
        let watch = watch_job(&target, job, Duration::from_millis(10))
            .await
            .expect("job should join");

        assert!(watch.outcome.is_ok());
        assert!(watch.progress_ticks >= 1);
        assert_eq!(watch.status.completion, PackageCompletion::Submitted);
        assert_eq!(watch.status.current_page_total, 1);

        for _ in 0..200 {
            if terminal.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(terminal.load(Ordering::SeqCst), 1);

        target.unadvise(cookie);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn job_that_fails_before_writing_reports_failed() {
        let dir = spool_dir("watch_failed");
        let target = SpoolPackageTarget::new(&dir, "Office", "broken").expect("target");

        let job = tokio::task::spawn_blocking(|| -> PrintResult<()> {
            Err(PrintError::package("source went away"))
        });
        let watch = watch_job(&target, job, Duration::from_millis(10))
            .await
            .expect("job should join");

        assert!(matches!(watch.outcome, Err(PrintError::Package(_))));
        assert_eq!(watch.status.completion, PackageCompletion::Failed);
        assert_eq!(watch.status.job_id, target.job_id());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn job_that_never_writes_is_abandoned() {
        let dir = spool_dir("watch_idle");
        let target = SpoolPackageTarget::new(&dir, "Office", "idle").expect("target");

        let job = tokio::task::spawn_blocking(|| -> PrintResult<()> { Ok(()) });
        let watch = watch_job(&target, job, Duration::from_millis(10))
            .await
            .expect("job should join");

        assert!(watch.outcome.is_ok());
        assert_eq!(watch.progress_ticks, 0);
        assert_eq!(watch.status.completion, PackageCompletion::Abandoned);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn cli_accepts_printer_file_and_flags() {
        let cli = Cli::try_parse_from(["cpd", "Office", "report.pdf", "--mode", "xps", "--json"])
            .expect("arguments should parse");
        assert_eq!(cli.printer, "Office");
        assert_eq!(cli.file.to_str(), Some("report.pdf"));
        assert!(matches!(cli.mode, Some(ModeArg::Xps)));
        assert!(cli.json);
    }

    #[test]
    fn cli_rejects_missing_file_or_unknown_mode() {
        assert!(Cli::try_parse_from(["cpd", "Office"]).is_err());
        assert!(Cli::try_parse_from(["cpd", "Office", "a.pdf", "--mode", "gdi"]).is_err());
    }
}

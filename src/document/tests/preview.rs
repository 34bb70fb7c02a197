use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use super::support::{RecordingPreview, RecordingTarget, TempDoc};
use crate::backend::PageRect;
use crate::document::{
    DocumentState, PdfOptions, PdfPrintDocument, PdfPrintingMode, PreviewPageCollection,
    PrintDocumentPageSource, PrintDocumentSource, XpsPrintDocument,
};
use crate::error::PrintError;
use crate::render::RasterDevice;
use crate::target::{
    JOB_PAGE_APPLICATION_DEFINED, PageCountType, PageDescription, UniformTaskOptions,
};
use crate::xps::{RasterOptions, RenderingMode};

fn negotiate(
    doc: &PdfPrintDocument,
    preview: &Arc<RecordingPreview>,
) -> Arc<dyn PreviewPageCollection> {
    let target = Arc::new(RecordingTarget::with_preview(preview));
    doc.get_preview_page_collection(target)
        .expect("preview should negotiate")
}

#[test]
fn final_page_count_is_reported_once_after_decode() {
    let file = TempDoc::pdf(&["one", "two", "three"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    assert_eq!(doc.total_pages(), None);
    assert_eq!(doc.state(), DocumentState::Idle);

    let preview = RecordingPreview::new();
    let collection = negotiate(&doc, &preview);
    assert!(preview.page_counts().is_empty());
    assert_eq!(doc.state(), DocumentState::Negotiating);

    let options = UniformTaskOptions::default();
    collection.paginate(1, &options).expect("paginate");
    collection.make_page(1, 200.0, 200.0).expect("make page");
    collection.paginate(2, &options).expect("paginate again");

    assert_eq!(preview.page_counts(), vec![(PageCountType::Final, 3)]);
    assert_eq!(doc.total_pages(), Some(3));
    assert_eq!(doc.state(), DocumentState::PreviewLoop);
}

#[test]
fn known_page_count_is_reported_at_negotiation() {
    let file = TempDoc::pdf(&["one", "two"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    doc.backend().expect("pdf should decode");

    let preview = RecordingPreview::new();
    let collection = negotiate(&doc, &preview);
    assert_eq!(preview.page_counts(), vec![(PageCountType::Final, 2)]);

    collection
        .paginate(1, &UniformTaskOptions::default())
        .expect("paginate");
    assert_eq!(preview.page_counts().len(), 1);
}

#[test]
fn repeated_request_for_same_page_renders_once() {
    let file = TempDoc::pdf(&["only"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    let preview = RecordingPreview::new();
    let collection = negotiate(&doc, &preview);

    collection.make_page(1, 200.0, 200.0).expect("first request");
    collection.make_page(1, 200.0, 200.0).expect("second request");

    let stats = doc.preview_stats().expect("preview is bound");
    assert_eq!(stats.render_passes, 1);
    assert_eq!(stats.coalesced_requests, 1);
    assert_eq!(preview.drawn_pages(), vec![1, 1]);

    let draws = preview.draws.lock().expect("draws lock").clone();
    assert_eq!((draws[0].width, draws[0].height), (200, 200));
    assert_eq!(draws[0].dpi, (96.0, 96.0));
    assert_eq!(draws[0].corner, [255, 255, 255, 255]);
}

#[test]
fn application_defined_page_means_first_page() {
    let file = TempDoc::pdf(&["one", "two"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    let preview = RecordingPreview::new();
    let collection = negotiate(&doc, &preview);

    collection
        .make_page(JOB_PAGE_APPLICATION_DEFINED, 100.0, 100.0)
        .expect("sentinel page");
    assert_eq!(preview.drawn_pages(), vec![1]);
}

#[test]
fn concurrent_requests_for_different_pages_are_serialized() {
    let file = TempDoc::pdf(&["one", "two"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    let preview = RecordingPreview::slow(Duration::from_millis(150));
    let collection = negotiate(&doc, &preview);
    collection
        .paginate(1, &UniformTaskOptions::default())
        .expect("paginate decodes the document");

    let first = {
        let collection = Arc::clone(&collection);
        thread::spawn(move || collection.make_page(1, 200.0, 200.0))
    };
    thread::sleep(Duration::from_millis(40));
    let second = {
        let collection = Arc::clone(&collection);
        thread::spawn(move || collection.make_page(2, 200.0, 200.0))
    };

    first.join().expect("first thread").expect("page 1");
    second.join().expect("second thread").expect("page 2");

    assert_eq!(preview.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(preview.drawn_pages(), vec![1, 2]);
    let stats = doc.preview_stats().expect("preview is bound");
    assert_eq!(stats.gate_waits, 1);
    assert_eq!(stats.render_passes, 2);
}

#[test]
fn concurrent_duplicate_request_returns_without_waiting() {
    let file = TempDoc::pdf(&["one"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    let preview = RecordingPreview::slow(Duration::from_millis(300));
    let collection = negotiate(&doc, &preview);
    collection
        .paginate(1, &UniformTaskOptions::default())
        .expect("paginate decodes the document");

    let first = {
        let collection = Arc::clone(&collection);
        thread::spawn(move || collection.make_page(1, 200.0, 200.0))
    };
    thread::sleep(Duration::from_millis(60));

    let started = Instant::now();
    collection.make_page(1, 200.0, 200.0).expect("duplicate request");
    assert!(started.elapsed() < Duration::from_millis(200));

    first.join().expect("first thread").expect("page 1");
    assert_eq!(preview.drawn_pages(), vec![1]);
    let stats = doc.preview_stats().expect("preview is bound");
    assert_eq!(stats.coalesced_requests, 1);
    assert_eq!(stats.render_passes, 1);
}

#[test]
fn surface_is_recreated_only_when_size_changes() {
    let file = TempDoc::pdf(&["one"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    let device = Arc::new(RasterDevice::new());
    doc.set_render_device(device.clone());
    let preview = RecordingPreview::new();
    let collection = negotiate(&doc, &preview);

    let letter = UniformTaskOptions::default();
    collection.paginate(1, &letter).expect("paginate");
    collection.paginate(1, &letter).expect("paginate same size");
    collection.make_page(1, 720.0, 960.0).expect("page at imageable size");
    assert_eq!(device.allocations(), 1);

    let mut a4 = PageDescription::default();
    a4.imageable_rect = PageRect::new(48.0, 48.0, 698.0, 1027.0);
    let a4 = UniformTaskOptions(a4);
    collection.paginate(1, &a4).expect("paginate a4");
    collection.paginate(2, &a4).expect("paginate a4 again");
    assert_eq!(device.allocations(), 2);

    let stats = doc.preview_stats().expect("preview is bound");
    assert_eq!(stats.surface_allocations, 2);
    assert_eq!(preview.drawn_pages(), vec![1]);
}

#[test]
fn repeated_pagination_keeps_surface_when_page_size_differs() {
    let file = TempDoc::pdf(&["one", "two"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    let device = Arc::new(RasterDevice::new());
    doc.set_render_device(device.clone());
    let preview = RecordingPreview::new();
    let collection = negotiate(&doc, &preview);

    let letter = UniformTaskOptions::default();
    for page in [1, 2, 1] {
        collection.paginate(page, &letter).expect("paginate");
        collection.make_page(page, 300.0, 400.0).expect("make page");
    }

    assert_eq!(device.allocations(), 1);
    let stats = doc.preview_stats().expect("preview is bound");
    assert_eq!(stats.surface_allocations, 1);
    assert_eq!((stats.bitmap_cache_misses, stats.bitmap_cache_hits), (2, 1));
    let draws = preview.draws.lock().expect("draws lock").clone();
    assert_eq!(draws.len(), 3);
    assert!(draws.iter().all(|draw| (draw.width, draw.height) == (720, 960)));
}

#[test]
fn preview_pane_may_call_back_while_drawing() {
    let file = TempDoc::pdf(&["one"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    let preview = RecordingPreview::new();
    let collection = negotiate(&doc, &preview);

    let nested = Arc::new(Mutex::new(Vec::new()));
    {
        let collection = Arc::clone(&collection);
        let nested = Arc::clone(&nested);
        preview.on_draw(move |page| {
            let paginated = collection.paginate(page, &UniformTaskOptions::default());
            let redrawn = collection.make_page(page, 300.0, 400.0);
            nested
                .lock()
                .expect("nested lock")
                .push((paginated.is_ok(), redrawn.is_ok()));
        });
    }

    let (done_tx, done_rx) = mpsc::channel();
    let worker = {
        let collection = Arc::clone(&collection);
        thread::spawn(move || {
            let result = collection.make_page(1, 300.0, 400.0);
            done_tx.send(result.is_ok()).expect("receiver should be alive");
        })
    };
    let finished = done_rx.recv_timeout(Duration::from_secs(10));
    preview.clear_on_draw();

    assert_eq!(finished, Ok(true));
    worker.join().expect("worker should finish");
    assert_eq!(*nested.lock().expect("nested lock"), vec![(true, true)]);
    assert_eq!(preview.drawn_pages(), vec![1]);
    let stats = doc.preview_stats().expect("preview is bound");
    assert_eq!(stats.coalesced_requests, 1);
    assert_eq!(stats.surface_allocations, 2);
}

#[test]
fn out_of_range_page_is_ignored() {
    let file = TempDoc::pdf(&["one", "two", "three"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    let preview = RecordingPreview::new();
    let collection = negotiate(&doc, &preview);

    collection.make_page(999, 200.0, 200.0).expect("no error");
    collection.make_page(0, 200.0, 200.0).expect("no error");

    assert!(preview.drawn_pages().is_empty());
    let stats = doc.preview_stats().expect("preview is bound");
    assert_eq!(stats.skipped_pages, 2);
    assert_eq!(stats.render_passes, 0);
}

#[test]
fn invalid_preview_size_is_rejected() {
    let file = TempDoc::pdf(&["one"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    let preview = RecordingPreview::new();
    let collection = negotiate(&doc, &preview);

    let err = collection
        .make_page(1, f32::NAN, 100.0)
        .expect_err("nan width");
    assert!(matches!(err, PrintError::InvalidArgument(_)));
}

#[test]
fn changing_options_invalidates_preview() {
    let file = TempDoc::pdf(&["one"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    let preview = RecordingPreview::new();
    let collection = negotiate(&doc, &preview);
    collection.make_page(1, 200.0, 200.0).expect("first render");

    let options = PdfOptions {
        printing_mode: PdfPrintingMode::Xps,
        ..PdfOptions::default()
    };
    doc.set_options(options).expect("options change");
    doc.set_options(options).expect("same options");
    assert_eq!(preview.invalidations.load(Ordering::SeqCst), 1);
    assert_eq!(doc.options(), options);

    collection.make_page(1, 200.0, 200.0).expect("render after invalidation");
    let stats = doc.preview_stats().expect("preview is bound");
    assert_eq!(stats.render_passes, 2);
}

#[test]
fn target_without_preview_pane_yields_inert_collection() {
    let file = TempDoc::pdf(&["one"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    let collection = doc
        .get_preview_page_collection(Arc::new(RecordingTarget::new()))
        .expect("collection");

    collection
        .paginate(1, &UniformTaskOptions::default())
        .expect("paginate");
    collection.make_page(1, 200.0, 200.0).expect("make page");
    assert!(doc.preview_stats().is_none());
    assert_eq!(doc.total_pages(), None);
}

#[test]
fn dispose_releases_preview_target_and_stops_work() {
    let file = TempDoc::pdf(&["one"]);
    let doc = PdfPrintDocument::open(&file.0).expect("pdf should open");
    let preview = RecordingPreview::new();
    let target = Arc::new(RecordingTarget::with_preview(&preview));
    let collection = doc
        .get_preview_page_collection(target.clone())
        .expect("collection");
    assert_eq!(Arc::strong_count(&preview), 3);

    doc.dispose();
    doc.dispose();
    assert_eq!(Arc::strong_count(&preview), 2);
    assert_eq!(doc.state(), DocumentState::Disposed);

    collection.make_page(1, 200.0, 200.0).expect("no-op after dispose");
    assert!(preview.drawn_pages().is_empty());
    assert!(matches!(
        doc.get_preview_page_collection(target.clone()),
        Err(PrintError::Disposed)
    ));
    assert!(matches!(
        doc.make_document(&UniformTaskOptions::default(), Some(target)),
        Err(PrintError::Disposed)
    ));
}

#[test]
fn xps_preview_draws_page_content() {
    let file = TempDoc::xps(2);
    let doc = XpsPrintDocument::open(&file.0).expect("xps should open");
    let preview = RecordingPreview::new();
    let collection = doc
        .get_preview_page_collection(Arc::new(RecordingTarget::with_preview(&preview)))
        .expect("collection");

    collection.make_page(2, 200.0, 100.0).expect("page 2");
    assert_eq!(preview.page_counts(), vec![(PageCountType::Final, 2)]);
    let draws = preview.draws.lock().expect("draws lock").clone();
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].page, 2);
    assert_eq!(draws[0].corner, [0, 0, 0, 255]);

    let options = RasterOptions {
        non_text_rendering: RenderingMode::Aliased,
        ..RasterOptions::default()
    };
    doc.set_options(options).expect("options change");
    assert_eq!(preview.invalidations.load(Ordering::SeqCst), 1);
    assert_eq!(
        doc.backend().expect("decoded").raster_options(),
        options
    );
}

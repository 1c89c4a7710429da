//! End-to-end pipeline behaviour through the public API, with an in-process
//! resizer standing in for `vipsthumbnail`.

use chrono::NaiveDate;
use picture_pipeline::control::{ControlEvent, EventSink};
use picture_pipeline::resizer::{ResizeError, ResizeRequest, Resizer};
use picture_pipeline::task::{TaskKind, VariantOutcome};
use picture_pipeline::types::HIDPI_MARKER;
use picture_pipeline::{
    LifecycleState, Pipeline, PipelineError, PipelineSettings, PictureDescriptor, StorageLayout,
    VariantSpec,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Default)]
struct RecordingResizer {
    calls: Mutex<Vec<ResizeRequest>>,
    fail_outputs: Vec<String>,
    delay: Option<Duration>,
    /// Write the source bytes to the output, like a real resize would.
    write_outputs: bool,
}

impl RecordingResizer {
    fn failing_for(pattern: &str) -> Self {
        Self {
            fail_outputs: vec![pattern.to_string()],
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<ResizeRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl Resizer for RecordingResizer {
    fn resize(&self, request: &ResizeRequest) -> Result<(), ResizeError> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.calls.lock().unwrap().push(request.clone());

        let output = request.output.to_string_lossy();
        if self.fail_outputs.iter().any(|p| output.contains(p.as_str())) {
            return Err(ResizeError::Failed {
                program: "vipsthumbnail".into(),
                status: "exit status: 1".into(),
                output: "VipsJpeg: premature end of input file".into(),
            });
        }
        if self.write_outputs {
            std::fs::copy(&request.source, &request.output).map_err(|source| {
                ResizeError::Spawn {
                    program: "copy".into(),
                    source,
                }
            })?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<ControlEvent>>,
}

impl CollectingSink {
    fn errors(&self) -> Vec<ControlEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.is_error())
            .cloned()
            .collect()
    }

    fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn deliver(&self, event: ControlEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn picture(key: &str) -> (PictureDescriptor, VariantSpec) {
    (
        PictureDescriptor::new(key, "jpg", format!("/images/original/{key}.jpg")),
        VariantSpec::from_base(
            key,
            format!("/images/thumbnail/{key}.jpg"),
            format!("/images/processed/{key}.jpg"),
            HIDPI_MARKER,
        ),
    )
}

fn settings(workers: usize) -> PipelineSettings {
    PipelineSettings {
        workers,
        queue_capacity: 100,
        ..PipelineSettings::default()
    }
}

fn started(
    workers: usize,
    resizer: Arc<RecordingResizer>,
) -> (Pipeline, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::default());
    let pipeline = Pipeline::with_sink(settings(workers), resizer, sink.clone());
    pipeline.start().unwrap();
    (pipeline, sink)
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn one_picture_produces_four_variants() {
    let resizer = Arc::new(RecordingResizer::default());
    let (pipeline, sink) = started(2, resizer.clone());

    let (p, v) = picture("abc123");
    let handle = pipeline.submit(p, v).unwrap();
    let outcome = handle.wait_timeout(Duration::from_secs(10)).unwrap();
    pipeline.stop();

    assert!(outcome.all_succeeded());
    assert_eq!(outcome.key, "abc123");

    let mut calls: Vec<(u32, PathBuf)> = resizer
        .calls()
        .into_iter()
        .map(|r| (r.max_dimension.value(), r.output))
        .collect();
    calls.sort();
    assert_eq!(
        calls,
        vec![
            (400, PathBuf::from("/images/thumbnail/abc123.jpg")),
            (800, PathBuf::from("/images/thumbnail/abc123@2x.jpg")),
            (1024, PathBuf::from("/images/processed/abc123.jpg")),
            (2048, PathBuf::from("/images/processed/abc123@2x.jpg")),
        ]
    );
    assert!(resizer.calls().iter().all(|r| r.strip_metadata));
    assert!(sink.errors().is_empty());
}

#[test]
fn failed_variant_reports_one_error_and_still_completes() {
    let resizer = Arc::new(RecordingResizer::failing_for("/processed/abc123.jpg"));
    let (pipeline, sink) = started(3, resizer.clone());

    let (p, v) = picture("abc123");
    let outcome = pipeline
        .submit(p, v)
        .unwrap()
        .wait_timeout(Duration::from_secs(10))
        .unwrap();
    pipeline.stop();

    assert_eq!(outcome.failed_kinds(), vec![TaskKind::Processed]);
    assert_eq!(outcome.get(TaskKind::Thumbnail), Some(&VariantOutcome::Succeeded));
    assert_eq!(outcome.get(TaskKind::HiRes), Some(&VariantOutcome::Succeeded));
    assert_eq!(resizer.calls().len(), 4);

    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, Some(TaskKind::Processed));
    assert_eq!(errors[0].picture.as_deref(), Some("abc123"));
    assert!(errors[0].message.contains("Processed"));
    assert!(errors[0].message.contains("abc123"));
}

#[test]
fn submit_after_stop_is_rejected() {
    let resizer = Arc::new(RecordingResizer::default());
    let (pipeline, _sink) = started(1, resizer.clone());
    pipeline.stop();

    let (p, v) = picture("late");
    assert!(matches!(
        pipeline.submit(p, v),
        Err(PipelineError::PipelineClosed)
    ));
    let (p, v) = picture("late");
    assert!(matches!(
        pipeline.try_submit(p, v),
        Err(PipelineError::PipelineClosed)
    ));
    assert!(resizer.calls().is_empty());
    assert_eq!(pipeline.state(), LifecycleState::Stopped);
}

#[test]
fn concurrent_submissions_all_complete() {
    const SUBMITTERS: usize = 8;
    const PER_SUBMITTER: usize = 5;

    let resizer = Arc::new(RecordingResizer::default());
    let (pipeline, _sink) = started(4, resizer.clone());

    let submitters: Vec<_> = (0..SUBMITTERS)
        .map(|s| {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                (0..PER_SUBMITTER)
                    .map(|i| {
                        let (p, v) = picture(&format!("s{s}p{i}"));
                        pipeline.submit(p, v).unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let handles: Vec<_> = submitters
        .into_iter()
        .flat_map(|t| t.join().unwrap())
        .collect();

    for handle in &handles {
        assert!(handle.wait_timeout(Duration::from_secs(10)).unwrap().all_succeeded());
    }
    pipeline.stop();

    let n = SUBMITTERS * PER_SUBMITTER;
    let stats = pipeline.stats();
    assert_eq!(stats.submitted, n as u64);
    assert_eq!(stats.tasks_finished, 3 * n as u64);
    assert_eq!(resizer.calls().len(), 4 * n);

    // Every output path written exactly once
    let outputs: HashSet<PathBuf> = resizer.calls().into_iter().map(|r| r.output).collect();
    assert_eq!(outputs.len(), 4 * n);
}

#[test]
fn stop_finishes_everything_already_accepted() {
    let resizer = Arc::new(RecordingResizer::slow(Duration::from_millis(10)));
    let (pipeline, sink) = started(2, resizer.clone());

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let (p, v) = picture(&format!("pic{i}"));
            pipeline.submit(p, v).unwrap()
        })
        .collect();
    pipeline.stop();

    for handle in handles {
        assert_eq!(handle.remaining(), 0);
        assert!(handle.try_outcome().unwrap().all_succeeded());
    }
    assert_eq!(resizer.calls().len(), 24);
    assert_eq!(pipeline.stats().queued, 0);

    // Sink was flushed before stop returned
    let finished = sink
        .messages()
        .into_iter()
        .filter(|m| m.contains("finished"))
        .count();
    assert_eq!(finished, 18);
}

#[test]
fn wait_timeout_does_not_cancel_tasks() {
    let resizer = Arc::new(RecordingResizer::slow(Duration::from_millis(150)));
    let (pipeline, _sink) = started(3, resizer.clone());

    let (p, v) = picture("abc123");
    let handle = pipeline.submit(p, v).unwrap();

    let err = handle.wait_timeout(Duration::from_millis(20)).unwrap_err();
    assert!(matches!(err, PipelineError::TrackerTimeout { ref key, .. } if key == "abc123"));

    let outcome = handle.wait_timeout(Duration::from_secs(10)).unwrap();
    assert!(outcome.all_succeeded());
    assert_eq!(resizer.calls().len(), 4);
    pipeline.stop();
}

#[test]
fn completion_callbacks_fire_once() {
    let resizer = Arc::new(RecordingResizer::default());
    let (pipeline, _sink) = started(2, resizer);
    let fired = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = mpsc::channel();

    let (p, v) = picture("abc123");
    let handle = pipeline.submit(p, v).unwrap();
    let counter = Arc::clone(&fired);
    handle.on_complete(move |outcome| {
        counter.fetch_add(1, Ordering::SeqCst);
        done_tx.send(outcome.key.clone()).unwrap();
    });

    let key = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(key, "abc123");
    pipeline.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn resubmitting_a_picture_rewrites_the_same_outputs() {
    let resizer = Arc::new(RecordingResizer::default());
    let (pipeline, _sink) = started(2, resizer.clone());

    let (p, v) = picture("abc123");
    let expected: HashSet<PathBuf> = v.outputs().iter().map(|p| p.to_path_buf()).collect();
    let first = pipeline.submit(p.clone(), v.clone()).unwrap();
    let second = pipeline.submit(p, v).unwrap();
    assert!(first.wait_timeout(Duration::from_secs(10)).unwrap().all_succeeded());
    assert!(second.wait_timeout(Duration::from_secs(10)).unwrap().all_succeeded());
    pipeline.stop();

    let calls = resizer.calls();
    assert_eq!(calls.len(), 8);
    let written: HashSet<PathBuf> = calls.into_iter().map(|r| r.output).collect();
    assert_eq!(written, expected);
}

#[test]
fn not_started_pipeline_rejects_work() {
    let resizer = Arc::new(RecordingResizer::default());
    let pipeline = Pipeline::new(settings(1), resizer.clone());

    let (p, v) = picture("abc123");
    assert!(matches!(pipeline.submit(p, v), Err(PipelineError::NotStarted)));
    assert_eq!(pipeline.state(), LifecycleState::NotStarted);
    assert!(resizer.calls().is_empty());
}

#[test]
fn storage_layout_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let layout = StorageLayout::new(tmp.path(), HIDPI_MARKER);
    let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
    layout.prepare(date).unwrap();

    let (picture, variants) = layout.allocate("jpg", date);
    std::fs::write(&picture.original, b"not really a jpeg").unwrap();
    let outputs: Vec<PathBuf> = variants.outputs().iter().map(|p| p.to_path_buf()).collect();

    let resizer = Arc::new(RecordingResizer {
        write_outputs: true,
        ..RecordingResizer::default()
    });
    let (pipeline, _sink) = started(2, resizer);
    let outcome = pipeline.submit(picture, variants).unwrap().wait();
    pipeline.stop();

    assert!(outcome.all_succeeded());
    for output in outputs {
        assert!(output.is_file(), "missing {}", output.display());
        assert!(output.starts_with(tmp.path()));
    }
}

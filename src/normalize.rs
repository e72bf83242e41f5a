//! Loudness normalization: a bounded pool of worker threads, each driving one
//! external ffmpeg process at a time.
//!
//! A worker moves the file to `<f>.normalizing`, encodes it to
//! `<f>.normalized`, renames the output over `<f>` and then deletes the
//! staging file. Until the output has been renamed into place the original
//! content only exists as the staging file, so an interrupted or failed run
//! never leaves a half-written `<f>`; `Library::recover_staged` puts things
//! back on the next sign-in.

use crate::config::LoudnessConfig;
use crate::effect::CancelToken;
use crate::error::NormalizeError;
use crate::ledger::{NormalizationLedger, NormalizationRecord};
use crate::library::{Library, content_hash, output_path, staging_path};
use crate::media_tool::{MediaTool, RunLimit, run_limited};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const TOLERANCE_EPSILON: f64 = 1e-9;

// ── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// The file was re-encoded in place.
    Normalized,
    /// Measured within tolerance; left untouched.
    Conformant { loudness: f64 },
    Failed(String),
    /// The tool ran past the per-file limit and was killed.
    TimedOut,
    Cancelled,
}

impl WorkerOutcome {
    /// The file now sits at the target loudness.
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerOutcome::Normalized | WorkerOutcome::Conformant { .. })
    }
}

/// Result of a normalization request.
#[derive(Debug)]
pub enum Submission {
    /// Already within tolerance of the target; nothing was queued.
    Conformant { loudness: f64 },
    Queued(WorkerHandle),
}

/// Tracks one queued file.
#[derive(Debug)]
pub struct WorkerHandle {
    path: PathBuf,
    rx: Receiver<WorkerOutcome>,
}

impl WorkerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the worker reports.
    pub fn join(self) -> WorkerOutcome {
        self.rx
            .recv()
            .unwrap_or_else(|_| WorkerOutcome::Failed("worker exited without reporting".into()))
    }

    pub fn wait(&self, timeout: Duration) -> Result<WorkerOutcome, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// Totals of one library batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub submitted: usize,
    pub normalized: usize,
    pub conformant: usize,
    /// Already recorded in the ledger at the current target.
    pub skipped: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// The batch stopped waiting and killed what was still running.
    pub aborted: bool,
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

struct Job {
    path: PathBuf,
    measured: Option<f64>,
    /// Write the ledger entry from the worker (requests nobody joins).
    record: bool,
    cancel: CancelToken,
    reply: Sender<WorkerOutcome>,
}

struct WorkerContext {
    tool: MediaTool,
    ledger: Arc<Mutex<NormalizationLedger>>,
    timeout: Duration,
    /// Fixed wait for a whole batch; `None` derives it from `timeout`.
    batch_timeout: Option<Duration>,
    shutdown: CancelToken,
}

pub struct NormalizationPipeline {
    ctx: Arc<WorkerContext>,
    jobs: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl NormalizationPipeline {
    /// Start `loudness.worker_count()` workers.
    pub fn new(
        tool: MediaTool,
        ledger: Arc<Mutex<NormalizationLedger>>,
        loudness: &LoudnessConfig,
    ) -> Result<Self, NormalizeError> {
        let target = loudness.target_lufs;
        if target > 0.0 || !target.is_finite() {
            return Err(NormalizeError::InvalidTarget(target));
        }
        let worker_count = loudness.worker_count();
        let ctx = Arc::new(WorkerContext {
            tool,
            ledger,
            timeout: loudness.worker_timeout(),
            batch_timeout: loudness.batch_timeout(),
            shutdown: CancelToken::new(),
        });
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();

        let workers = (0..worker_count)
            .map(|i| {
                let rx = rx.clone();
                let ctx = ctx.clone();
                std::thread::Builder::new()
                    .name(format!("normalize-{}", i))
                    .spawn(move || worker_loop(&ctx, rx))
                    .expect("failed to spawn normalization worker")
            })
            .collect();

        log::debug!("Normalization pool started with {} workers", worker_count);
        Ok(NormalizationPipeline {
            ctx,
            jobs: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            worker_count,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn target_lufs(&self) -> f64 {
        self.ctx.tool.target_lufs()
    }

    pub fn ledger(&self) -> &Arc<Mutex<NormalizationLedger>> {
        &self.ctx.ledger
    }

    /// True when `measured` is within the tolerance window of the target (inclusive).
    pub fn within_tolerance(&self, measured: f64) -> bool {
        let loudness = self.ctx.tool.loudness();
        (measured - loudness.target_lufs).abs() <= loudness.tolerance_lufs + TOLERANCE_EPSILON
    }

    /// Request normalization of one file. With a known measurement inside
    /// the tolerance window this returns at once; otherwise the file is
    /// queued (and measured by the worker when `measured` is `None`).
    pub fn normalize(&self, path: &Path, measured: Option<f64>) -> Result<Submission, NormalizeError> {
        if let Some(loudness) = measured {
            if self.within_tolerance(loudness) {
                log::debug!("'{}' already at {:.2} LUFS", path.display(), loudness);
                return Ok(Submission::Conformant { loudness });
            }
        }
        self.submit(path, measured, false, CancelToken::new())
            .map(Submission::Queued)
    }

    /// Queue a file nobody will wait on; the worker records the ledger entry.
    /// Content the ledger already holds at the target is not queued. Returns
    /// whether the file was queued.
    pub fn submit_detached(&self, path: &Path) -> Result<bool, NormalizeError> {
        let hash = content_hash(path).map_err(|e| NormalizeError::from_io(path, e))?;
        if self.ctx.ledger.lock().is_normalized(&hash, self.target_lufs()) {
            log::debug!("'{}' already normalized", path.display());
            return Ok(false);
        }
        self.submit(path, None, true, CancelToken::new())?;
        Ok(true)
    }

    fn submit(
        &self,
        path: &Path,
        measured: Option<f64>,
        record: bool,
        cancel: CancelToken,
    ) -> Result<WorkerHandle, NormalizeError> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        let job = Job {
            path: path.to_path_buf(),
            measured,
            record,
            cancel,
            reply,
        };
        let jobs = self.jobs.lock();
        let sender = jobs.as_ref().ok_or_else(|| NormalizeError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other("normalization pipeline is shut down"),
        })?;
        sender.send(job).map_err(|_| NormalizeError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other("normalization workers are gone"),
        })?;
        Ok(WorkerHandle {
            path: path.to_path_buf(),
            rx,
        })
    }

    /// Normalize every file in the library and wait for the result.
    ///
    /// Files whose content the ledger already records at the target are
    /// skipped. The wait is bounded by `batch_timeout_secs`, or when that is
    /// unset by the per-file timeout times the number of rounds the pool
    /// needs; past that the batch is abandoned and its running tools are
    /// killed, leaving their staging files for the next recovery.
    pub fn run_batch(&self, library: &Library) -> BatchReport {
        let mut report = BatchReport::default();
        let target = self.target_lufs();
        let batch_cancel = CancelToken::new();
        let mut pending = Vec::new();

        for category in library.categories() {
            for path in library.list(&category) {
                let hash = match content_hash(&path) {
                    Ok(h) => h,
                    Err(e) => {
                        log::error!("Cannot hash '{}': {}", path.display(), e);
                        report.failed += 1;
                        continue;
                    }
                };
                if self.ctx.ledger.lock().is_normalized(&hash, target) {
                    report.skipped += 1;
                    continue;
                }
                match self.submit(&path, None, false, batch_cancel.clone()) {
                    Ok(handle) => pending.push(handle),
                    Err(e) => {
                        log::error!("{}", e);
                        report.failed += 1;
                    }
                }
            }
        }
        report.submitted = pending.len();
        if pending.is_empty() {
            log::info!("Library already normalized ({} files skipped)", report.skipped);
            return report;
        }

        let limit = self.ctx.batch_timeout.unwrap_or_else(|| {
            let rounds = pending.len().div_ceil(self.worker_count.max(1)) as u32;
            self.ctx
                .timeout
                .saturating_mul(rounds)
                .saturating_add(Duration::from_secs(1))
        });
        let now = Instant::now();
        let deadline = now.checked_add(limit).unwrap_or(now + Duration::from_secs(86_400 * 365));
        log::info!(
            "Normalizing {} files on {} workers",
            pending.len(),
            self.worker_count
        );

        let mut handles = pending.into_iter();
        for handle in handles.by_ref() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match handle.wait(remaining) {
                Ok(outcome) => self.tally(&mut report, handle.path(), outcome),
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "Normalization batch exceeded {:?}; abandoning remaining files",
                        limit
                    );
                    report.timed_out += 1;
                    report.aborted = true;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    log::error!(
                        "critical: normalization worker for '{}' died; abandoning batch",
                        handle.path().display()
                    );
                    report.failed += 1;
                    report.aborted = true;
                    break;
                }
            }
        }
        if report.aborted {
            batch_cancel.cancel();
            report.timed_out += handles.count();
        }

        if let Err(e) = self.ctx.ledger.lock().flush() {
            log::error!("{}", e);
        }
        log::info!(
            "Normalization batch: {} normalized, {} conformant, {} skipped, {} failed, {} timed out",
            report.normalized,
            report.conformant,
            report.skipped,
            report.failed,
            report.timed_out
        );
        report
    }

    fn tally(&self, report: &mut BatchReport, path: &Path, outcome: WorkerOutcome) {
        match &outcome {
            WorkerOutcome::Normalized => report.normalized += 1,
            WorkerOutcome::Conformant { .. } => report.conformant += 1,
            WorkerOutcome::Failed(_) | WorkerOutcome::Cancelled => report.failed += 1,
            WorkerOutcome::TimedOut => report.timed_out += 1,
        }
        if outcome.is_success() {
            record_entry(&self.ctx, path);
        }
    }

    /// Stop accepting work, kill running tools and join the workers.
    pub fn shutdown(&self) {
        self.ctx.shutdown.cancel();
        self.jobs.lock().take();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for NormalizationPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

fn worker_loop(ctx: &WorkerContext, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        let outcome = if ctx.shutdown.is_cancelled() || job.cancel.is_cancelled() {
            WorkerOutcome::Cancelled
        } else {
            run_job(ctx, &job)
        };
        match &outcome {
            WorkerOutcome::Normalized => log::info!("Normalized '{}'", job.path.display()),
            WorkerOutcome::Failed(reason) => {
                log::error!("Normalization of '{}' failed: {}", job.path.display(), reason)
            }
            WorkerOutcome::TimedOut => {
                log::warn!("Normalization of '{}' timed out", job.path.display())
            }
            _ => {}
        }
        if job.record && outcome.is_success() {
            record_entry(ctx, &job.path);
            if let Err(e) = ctx.ledger.lock().flush() {
                log::error!("{}", e);
            }
        }
        let _ = job.reply.send(outcome);
    }
}

fn run_job(ctx: &WorkerContext, job: &Job) -> WorkerOutcome {
    let tool = &ctx.tool;
    let path = &job.path;
    // Measurement and encode share one budget.
    let limit = RunLimit::new(ctx.timeout)
        .cancelled_by(&ctx.shutdown)
        .cancelled_by(&job.cancel);

    let measured = match job.measured {
        Some(m) => m,
        None => match tool.measure_loudness(path, &limit) {
            Ok(m) => m,
            Err(e) => return failure_outcome(e),
        },
    };
    let loudness = tool.loudness();
    if (measured - loudness.target_lufs).abs() <= loudness.tolerance_lufs + TOLERANCE_EPSILON {
        return WorkerOutcome::Conformant { loudness: measured };
    }

    log::debug!(
        "Normalizing '{}' from {:.2} to {} LUFS",
        path.display(),
        measured,
        loudness.target_lufs
    );
    match transform(ctx, job, &limit) {
        Ok(()) => WorkerOutcome::Normalized,
        Err(e) => failure_outcome(e),
    }
}

fn failure_outcome(error: NormalizeError) -> WorkerOutcome {
    match error {
        NormalizeError::TimedOut { .. } => WorkerOutcome::TimedOut,
        NormalizeError::Cancelled { .. } => WorkerOutcome::Cancelled,
        e => WorkerOutcome::Failed(e.to_string()),
    }
}

/// The staging transaction. On any failure the staging file stays in place.
fn transform(ctx: &WorkerContext, job: &Job, limit: &RunLimit) -> Result<(), NormalizeError> {
    let path = &job.path;
    let staging = staging_path(path);
    let output = output_path(path);

    fs::rename(path, &staging).map_err(|e| NormalizeError::from_io(path, e))?;

    let ffmpeg = ctx.tool.ffmpeg();
    let mut cmd = ctx.tool.normalize_command(&staging, &output);
    let status = match run_limited(&mut cmd, ffmpeg, limit) {
        Ok(out) => out.status,
        Err(e) => {
            discard_partial(&output);
            return Err(e);
        }
    };
    if !status.success() {
        discard_partial(&output);
        return Err(NormalizeError::ToolFailed {
            program: ffmpeg.to_path_buf(),
            code: status.code().unwrap_or(-1),
        });
    }

    fs::rename(&output, path).map_err(|e| NormalizeError::from_io(path, e))?;
    if let Err(e) = fs::remove_file(&staging) {
        log::warn!("Cannot remove '{}': {}", staging.display(), e);
    }
    Ok(())
}

fn discard_partial(output: &Path) {
    if output.exists() {
        if let Err(e) = fs::remove_file(output) {
            log::error!("Cannot remove partial '{}': {}", output.display(), e);
        }
    }
}

fn record_entry(ctx: &WorkerContext, path: &Path) {
    let hash = match content_hash(path) {
        Ok(h) => h,
        Err(e) => {
            log::error!("Cannot hash '{}': {}", path.display(), e);
            return;
        }
    };
    let loudness = ctx.tool.loudness();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    ctx.ledger.lock().upsert(NormalizationRecord {
        name,
        hash,
        loudness: loudness.target_lufs,
        bitrate: loudness.bitrate.clone(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_with(tool: MediaTool, workers: usize) -> NormalizationPipeline {
        let mut cfg = tool.loudness().clone();
        cfg.workers = workers;
        NormalizationPipeline::new(
            tool,
            Arc::new(Mutex::new(NormalizationLedger::in_memory())),
            &cfg,
        )
        .unwrap()
    }

    fn missing_tool() -> MediaTool {
        MediaTool::with_programs(
            PathBuf::from("/nonexistent/ffmpeg"),
            PathBuf::from("/nonexistent/ffprobe"),
            &LoudnessConfig::default(),
        )
    }

    #[test]
    fn rejects_positive_target() {
        let mut cfg = LoudnessConfig::default();
        cfg.target_lufs = 1.0;
        let result = NormalizationPipeline::new(
            missing_tool(),
            Arc::new(Mutex::new(NormalizationLedger::in_memory())),
            &cfg,
        );
        assert!(matches!(result, Err(NormalizeError::InvalidTarget(_))));
    }

    #[test]
    fn tolerance_window_is_inclusive() {
        let p = pipeline_with(missing_tool(), 1);
        assert!(p.within_tolerance(-23.0));
        assert!(p.within_tolerance(-23.0 + 1.5));
        assert!(p.within_tolerance(-23.0 - 1.5));
        assert!(!p.within_tolerance(-23.0 + 1.6));
        assert!(!p.within_tolerance(-23.0 - 1.6));
    }

    #[test]
    fn conformant_measurement_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp3");
        fs::write(&path, b"audio").unwrap();

        let p = pipeline_with(missing_tool(), 1);
        let submission = p.normalize(&path, Some(-21.5)).unwrap();
        assert!(matches!(submission, Submission::Conformant { loudness } if loudness == -21.5));
        assert!(path.exists());
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn out_of_tolerance_is_queued() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp3");
        fs::write(&path, b"audio").unwrap();

        let p = pipeline_with(missing_tool(), 1);
        match p.normalize(&path, Some(-23.0 - 1.6)).unwrap() {
            Submission::Queued(handle) => {
                assert_eq!(handle.path(), path);
                assert!(matches!(handle.join(), WorkerOutcome::Failed(_)));
            }
            other => panic!("expected a queued job, got {:?}", other),
        }
    }

    #[test]
    fn missing_tool_leaves_staged_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp3");
        fs::write(&path, b"original").unwrap();

        let p = pipeline_with(missing_tool(), 1);
        let Submission::Queued(handle) = p.normalize(&path, Some(-40.0)).unwrap() else {
            panic!("expected a queued job");
        };
        assert!(matches!(handle.join(), WorkerOutcome::Failed(_)));
        assert!(!path.exists());
        assert_eq!(fs::read(staging_path(&path)).unwrap(), b"original");
        assert!(!output_path(&path).exists());
    }

    #[test]
    fn unmeasurable_file_fails_without_moving() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp3");
        fs::write(&path, b"original").unwrap();

        let p = pipeline_with(missing_tool(), 1);
        let Submission::Queued(handle) = p.normalize(&path, None).unwrap() else {
            panic!("expected a queued job");
        };
        assert!(matches!(handle.join(), WorkerOutcome::Failed(_)));
        assert!(path.exists());
    }

    #[test]
    fn submit_after_shutdown_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp3");
        fs::write(&path, b"audio").unwrap();

        let p = pipeline_with(missing_tool(), 2);
        p.shutdown();
        assert!(p.submit_detached(&path).is_err());
    }

    #[test]
    fn detached_submit_skips_recorded_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp3");
        fs::write(&path, b"audio").unwrap();

        let p = pipeline_with(missing_tool(), 1);
        let hash = content_hash(&path).unwrap();
        p.ledger().lock().upsert(NormalizationRecord {
            name: "a.mp3".into(),
            hash,
            loudness: -23.0,
            bitrate: "192k".into(),
        });
        assert!(!p.submit_detached(&path).unwrap());
        // Nothing was queued, so the file was never staged.
        assert!(path.exists());
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn empty_library_batch() {
        let dir = tempfile::tempdir().unwrap();
        let lib = Library::new(dir.path(), &["mp3".to_string()]);
        let p = pipeline_with(missing_tool(), 2);
        assert_eq!(p.run_batch(&lib), BatchReport::default());
    }

    #[cfg(unix)]
    mod with_fake_tool {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn tool(ffmpeg: PathBuf, timeout_secs: u64) -> MediaTool {
            let mut cfg = LoudnessConfig::default();
            cfg.worker_timeout_secs = timeout_secs;
            tool_with(ffmpeg, &cfg)
        }

        fn tool_with(ffmpeg: PathBuf, cfg: &LoudnessConfig) -> MediaTool {
            MediaTool::with_programs(ffmpeg, PathBuf::from("/nonexistent/ffprobe"), cfg)
        }

        const LOUD_THEN_COPY: &str = "if [ \"$1\" = \"-hide_banner\" ]; then\n  echo '{ \"input_i\" : \"-40.0\" }' >&2\n  exit 0\nfi\nfor last; do :; done\ncp \"$3\" \"$last\"";

        fn show_library(files: &[&str]) -> (tempfile::TempDir, Library) {
            let dir = tempfile::tempdir().unwrap();
            for name in files {
                let p = dir.path().join("show").join(name);
                fs::create_dir_all(p.parent().unwrap()).unwrap();
                fs::write(&p, name.as_bytes()).unwrap();
            }
            let lib = Library::new(dir.path(), &["mp3".to_string()]);
            (dir, lib)
        }

        #[test]
        fn success_replaces_original() {
            let bin = tempfile::tempdir().unwrap();
            let ffmpeg = script(
                bin.path(),
                "ffmpeg",
                "for last; do :; done\nprintf 'normalized:' > \"$last\"\ncat \"$3\" >> \"$last\"",
            );
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("a.mp3");
            fs::write(&path, b"original").unwrap();

            let p = pipeline_with(tool(ffmpeg, 30), 1);
            let Submission::Queued(handle) = p.normalize(&path, Some(-40.0)).unwrap() else {
                panic!("expected a queued job");
            };
            assert_eq!(handle.join(), WorkerOutcome::Normalized);
            assert_eq!(fs::read(&path).unwrap(), b"normalized:original");
            assert!(!staging_path(&path).exists());
            assert!(!output_path(&path).exists());
        }

        #[test]
        fn tool_failure_leaves_staging_and_no_output() {
            let bin = tempfile::tempdir().unwrap();
            let ffmpeg = script(
                bin.path(),
                "ffmpeg",
                "for last; do :; done\necho partial > \"$last\"\nexit 1",
            );
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("a.mp3");
            fs::write(&path, b"original").unwrap();

            let p = pipeline_with(tool(ffmpeg, 30), 1);
            let Submission::Queued(handle) = p.normalize(&path, Some(-40.0)).unwrap() else {
                panic!("expected a queued job");
            };
            assert!(matches!(handle.join(), WorkerOutcome::Failed(_)));
            assert!(!path.exists());
            assert_eq!(fs::read(staging_path(&path)).unwrap(), b"original");
            assert!(!output_path(&path).exists());
        }

        #[test]
        fn hung_tool_is_killed() {
            let bin = tempfile::tempdir().unwrap();
            let ffmpeg = script(bin.path(), "ffmpeg", "exec sleep 30");
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("a.mp3");
            fs::write(&path, b"original").unwrap();

            let p = pipeline_with(tool(ffmpeg, 1), 1);
            let started = Instant::now();
            let Submission::Queued(handle) = p.normalize(&path, Some(-40.0)).unwrap() else {
                panic!("expected a queued job");
            };
            assert_eq!(handle.join(), WorkerOutcome::TimedOut);
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(staging_path(&path).exists());
        }

        #[test]
        fn batch_records_and_skips_on_rerun() {
            let bin = tempfile::tempdir().unwrap();
            // Measurement passes print a loud report; encodes copy the input.
            let ffmpeg = script(
                bin.path(),
                "ffmpeg",
                "if [ \"$1\" = \"-hide_banner\" ]; then\n  echo '{ \"input_i\" : \"-40.0\" }' >&2\n  exit 0\nfi\nfor last; do :; done\ncp \"$3\" \"$last\"",
            );
            let lib_dir = tempfile::tempdir().unwrap();
            for (cat, name) in [("show", "a.mp3"), ("show", "b.mp3"), ("stationID", "id.mp3")] {
                let p = lib_dir.path().join(cat).join(name);
                fs::create_dir_all(p.parent().unwrap()).unwrap();
                fs::write(&p, name.as_bytes()).unwrap();
            }
            let lib = Library::new(lib_dir.path(), &["mp3".to_string()]);

            let p = pipeline_with(tool(ffmpeg, 30), 2);
            let first = p.run_batch(&lib);
            assert_eq!(first.submitted, 3);
            assert_eq!(first.normalized, 3);
            assert!(!first.aborted);
            assert_eq!(p.ledger().lock().len(), 3);

            let second = p.run_batch(&lib);
            assert_eq!(second.skipped, 3);
            assert_eq!(second.submitted, 0);
        }

        #[test]
        fn detached_job_records_itself() {
            let bin = tempfile::tempdir().unwrap();
            let ffmpeg = script(
                bin.path(),
                "ffmpeg",
                "if [ \"$1\" = \"-hide_banner\" ]; then\n  echo '{ \"input_i\" : \"-30.0\" }' >&2\n  exit 0\nfi\nfor last; do :; done\ncp \"$3\" \"$last\"",
            );
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("a.mp3");
            fs::write(&path, b"original").unwrap();

            // The fake encode copies bytes, so the hash is stable.
            let hash = content_hash(&path).unwrap();
            let p = pipeline_with(tool(ffmpeg, 30), 1);
            p.submit_detached(&path).unwrap();
            let deadline = Instant::now() + Duration::from_secs(10);
            while !p.ledger().lock().is_normalized(&hash, -23.0) {
                assert!(Instant::now() < deadline, "detached job never recorded");
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    
        #[test]
        fn hung_measurement_counts_against_the_file_limit() {
            let bin = tempfile::tempdir().unwrap();
            let ffmpeg = script(bin.path(), "ffmpeg", "exec sleep 30");
            let (lib_dir, lib) = show_library(&["a.mp3", "b.mp3"]);

            let p = pipeline_with(tool(ffmpeg, 1), 1);
            let started = Instant::now();
            let report = p.run_batch(&lib);
            assert_eq!(report.submitted, 2);
            assert_eq!(report.timed_out, 2);
            assert_eq!(report.normalized, 0);
            assert!(started.elapsed() < Duration::from_secs(10));

            let stopping = Instant::now();
            p.shutdown();
            assert!(stopping.elapsed() < Duration::from_secs(5));
            // Measurement never stages anything.
            assert!(lib_dir.path().join("show").join("a.mp3").exists());
            assert!(!staging_path(&lib_dir.path().join("show").join("a.mp3")).exists());
        }

        #[test]
        fn shutdown_kills_a_hung_detached_measurement() {
            let bin = tempfile::tempdir().unwrap();
            let ffmpeg = script(bin.path(), "ffmpeg", "exec sleep 30");
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("a.mp3");
            fs::write(&path, b"original").unwrap();

            let p = pipeline_with(tool(ffmpeg, 600), 1);
            assert!(p.submit_detached(&path).unwrap());
            std::thread::sleep(Duration::from_millis(200));

            let started = Instant::now();
            p.shutdown();
            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(fs::read(&path).unwrap(), b"original");
            assert!(p.ledger().lock().is_empty());
        }

        #[test]
        fn abandoned_batch_leaves_staging_for_recovery() {
            let bin = tempfile::tempdir().unwrap();
            // Measurement reports a loud file; the encode hangs.
            let ffmpeg = script(
                bin.path(),
                "ffmpeg",
                "if [ \"$1\" = \"-hide_banner\" ]; then\n  echo '{ \"input_i\" : \"-40.0\" }' >&2\n  exit 0\nfi\nexec sleep 30",
            );
            let (lib_dir, lib) = show_library(&["a.mp3", "b.mp3"]);
            let a = lib_dir.path().join("show").join("a.mp3");
            let b = lib_dir.path().join("show").join("b.mp3");

            let mut cfg = LoudnessConfig::default();
            cfg.worker_timeout_secs = 30;
            cfg.batch_timeout_secs = 1;
            let p = pipeline_with(tool_with(ffmpeg, &cfg), 1);

            let started = Instant::now();
            let report = p.run_batch(&lib);
            assert!(report.aborted);
            assert_eq!(report.submitted, 2);
            assert_eq!(report.timed_out, 2);
            assert!(started.elapsed() < Duration::from_secs(10));

            p.shutdown();
            assert!(!a.exists());
            assert_eq!(fs::read(staging_path(&a)).unwrap(), b"a.mp3");
            assert!(!output_path(&a).exists());
            // The second file was cancelled before it was touched.
            assert_eq!(fs::read(&b).unwrap(), b"b.mp3");
            assert!(p.ledger().lock().is_empty());

            assert_eq!(lib.recover_staged(), vec![a.clone()]);
            assert_eq!(fs::read(&a).unwrap(), b"a.mp3");
            assert!(!staging_path(&a).exists());
        }

        #[test]
        fn batch_then_detached_submit_does_not_encode_again() {
            let bin = tempfile::tempdir().unwrap();
            let calls = bin.path().join("calls");
            let ffmpeg = script(
                bin.path(),
                "ffmpeg",
                &format!("echo run >> '{}'\n{}", calls.display(), LOUD_THEN_COPY),
            );
            let (lib_dir, lib) = show_library(&["a.mp3"]);
            let a = lib_dir.path().join("show").join("a.mp3");

            let p = pipeline_with(tool(ffmpeg, 30), 1);
            assert_eq!(p.run_batch(&lib).normalized, 1);
            let runs = fs::read_to_string(&calls).unwrap().lines().count();
            assert_eq!(runs, 2);

            assert!(!p.submit_detached(&a).unwrap());
            p.shutdown();
            assert_eq!(fs::read_to_string(&calls).unwrap().lines().count(), runs);
        }
    }
}

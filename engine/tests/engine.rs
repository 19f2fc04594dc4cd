use async_trait::async_trait;
use backup_engine::{
    BackupMode, ChannelProgressSink, EncryptionProgress, EngineBuilder, EngineError, Encryptor,
    Engine, FileProgress, Job, JobStatus, LogAction, LogEntry, LogSink, ProcessProbe,
    ProgressEvent, ProgressSink, Scheduler, Settings, StepError,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// XOR with a fixed key; files whose name contains "bad" are rejected.
struct XorEncryptor {
    key: u8,
    running_elsewhere: AtomicBool,
}

impl XorEncryptor {
    fn new() -> Arc<Self> {
        Arc::new(XorEncryptor {
            key: 0x5a,
            running_elsewhere: AtomicBool::new(false),
        })
    }

    fn transform(
        &self,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Duration, StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        let started = Instant::now();
        let name = source.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if name.contains("bad") {
            return Err(EngineError::EncryptionFailed {
                path: source.to_path_buf(),
                reason: "rejected".to_string(),
            }
            .into());
        }
        let data = fs::read(source).map_err(|e| EngineError::ReadError {
            path: source.to_path_buf(),
            source: e,
        })?;
        let sealed: Vec<u8> = data.iter().map(|b| b ^ self.key).collect();
        fs::write(target, sealed).map_err(|e| EngineError::WriteError {
            path: target.to_path_buf(),
            source: e,
        })?;
        Ok(started.elapsed())
    }
}

#[async_trait]
impl Encryptor for XorEncryptor {
    async fn encrypt(
        &self,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Duration, StepError> {
        self.transform(source, target, cancel)
    }

    async fn decrypt(
        &self,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Duration, StepError> {
        self.transform(source, target, cancel)
    }

    fn is_running_elsewhere(&self) -> bool {
        self.running_elsewhere.load(Ordering::SeqCst)
    }

    fn tool_path(&self) -> &Path {
        Path::new("xor")
    }
}

struct NoProcesses;

impl ProcessProbe for NoProcesses {
    fn running_processes(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Default)]
struct RecordingLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl RecordingLog {
    fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl LogSink for RecordingLog {
    fn write(&self, entry: LogEntry) {
        self.entries.lock().unwrap().push(entry);
    }
}

/// Records file events and lets a test act on the engine from inside them.
struct ScriptedSink {
    engine: OnceLock<Engine>,
    on_file: Box<dyn Fn(&Engine, &FileProgress) + Send + Sync>,
    files: Mutex<Vec<FileProgress>>,
}

impl ScriptedSink {
    fn new<F>(on_file: F) -> Arc<Self>
    where
        F: Fn(&Engine, &FileProgress) + Send + Sync + 'static,
    {
        Arc::new(ScriptedSink {
            engine: OnceLock::new(),
            on_file: Box::new(on_file),
            files: Mutex::new(Vec::new()),
        })
    }

    fn attach(&self, engine: &Engine) {
        let _ = self.engine.set(engine.clone());
    }

    fn files(&self) -> Vec<FileProgress> {
        self.files.lock().unwrap().clone()
    }
}

impl ProgressSink for ScriptedSink {
    fn on_file_progress(&self, event: &FileProgress) {
        self.files.lock().unwrap().push(event.clone());
        if let Some(engine) = self.engine.get() {
            (self.on_file)(engine, event);
        }
    }

    fn on_encryption_progress(&self, _event: &EncryptionProgress) {}

    fn on_business_software_detected(&self, _job: &str, _process: &str) {}
}

struct Fixture {
    dir: tempfile::TempDir,
    engine: Engine,
    log: Arc<RecordingLog>,
    encryptor: Arc<XorEncryptor>,
}

impl Fixture {
    fn new(settings: Settings) -> Self {
        Self::with_sink(settings, None)
    }

    fn with_sink(settings: Settings, sink: Option<Arc<dyn ProgressSink>>) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let settings = Settings {
            staging_dir: Some(dir.path().join("staging")),
            ..settings
        };
        let log = Arc::new(RecordingLog::default());
        let encryptor = XorEncryptor::new();
        let mut builder = EngineBuilder::in_dir(settings, &dir.path().join("data"))
            .expect("open stores")
            .with_process_probe(Arc::new(NoProcesses))
            .with_encryptor(encryptor.clone())
            .with_log_sink(log.clone())
            .with_scheduler(Scheduler::new(4));
        if let Some(sink) = sink {
            builder = builder.with_progress_sink(sink);
        }
        let engine = builder.build().expect("build engine");
        Fixture {
            dir,
            engine,
            log,
            encryptor,
        }
    }

    fn src(&self) -> PathBuf {
        self.dir.path().join("src")
    }

    fn dst(&self) -> PathBuf {
        self.dir.path().join("dst")
    }

    /// Write a source file with a fixed mtime an hour in the past.
    fn write_source(&self, rel: &str, data: &[u8]) {
        let path = self.src().join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("create source dir");
        fs::write(&path, data).expect("write source");
        let past = SystemTime::now() - Duration::from_secs(3600);
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(past))
            .expect("set mtime");
    }

    fn create_job(&self, mode: BackupMode, encrypt: bool) {
        fs::create_dir_all(self.src()).expect("create src");
        self.engine
            .create_job(Job::new("Docs", self.src(), self.dst(), mode, encrypt))
            .expect("create job");
    }

    fn actions(&self) -> Vec<LogAction> {
        self.log.entries().iter().map(|e| e.action).collect()
    }
}

fn scripted(settings: Settings, sink: &Arc<ScriptedSink>) -> Fixture {
    let progress: Arc<dyn ProgressSink> = sink.clone();
    let f = Fixture::with_sink(settings, Some(progress));
    sink.attach(&f.engine);
    f
}

async fn wait_for(flag: &AtomicBool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !flag.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "timed out");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn partials_in(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
                .count()
        })
        .unwrap_or(0)
}

fn mtime(path: &Path) -> filetime::FileTime {
    filetime::FileTime::from_last_modification_time(&fs::metadata(path).expect("metadata"))
}

#[tokio::test]
async fn test_full_backup_mirrors_tree() {
    let f = Fixture::new(Settings::default());
    f.write_source("a.txt", &[b'a'; 100]);
    f.write_source("docs/b.txt", &[b'b'; 100]);
    f.write_source("docs/deep/c.bin", &[b'c'; 100]);
    f.create_job(BackupMode::Full, false);

    let outcome = f.engine.execute("Docs").await.expect("run");
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.files_copied, 3);
    assert_eq!(outcome.bytes_copied, 300);
    assert!(outcome.errors.is_empty());

    for rel in ["a.txt", "docs/b.txt", "docs/deep/c.bin"] {
        let source = f.src().join(rel);
        let target = f.dst().join(rel);
        assert_eq!(fs::read(&target).expect("read target"), fs::read(&source).expect("read source"));
        assert_eq!(mtime(&target), mtime(&source), "mtime of {} preserved", rel);
    }

    let state = f.engine.state("Docs").expect("state");
    assert_eq!(state.status, JobStatus::Completed);
    assert_eq!(state.total_files, 3);
    assert_eq!(state.total_bytes, 300);
    assert_eq!(state.files_remaining, 0);
    assert_eq!(state.bytes_remaining, 0);
    assert_eq!(state.progress_percentage, 100);
    assert!(state.current_source_file.is_none());

    let actions = f.actions();
    assert_eq!(actions.first(), Some(&LogAction::BackupStarted));
    assert_eq!(actions.last(), Some(&LogAction::BackupCompleted));
    assert_eq!(actions.iter().filter(|a| **a == LogAction::FileCopyComplete).count(), 3);
}

#[tokio::test]
async fn test_full_backup_with_small_chunks() {
    let f = Fixture::new(Settings {
        chunk_size: 7,
        large_file_threshold: 50,
        ..Settings::default()
    });
    let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    f.write_source("big.bin", &data);
    f.write_source("small.bin", b"tiny");
    f.create_job(BackupMode::Full, false);

    let outcome = f.engine.execute("Docs").await.expect("run");
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(fs::read(f.dst().join("big.bin")).expect("read"), data);
    assert_eq!(fs::read(f.dst().join("small.bin")).expect("read"), b"tiny");
}

#[tokio::test]
async fn test_differential_rerun_copies_nothing() {
    let f = Fixture::new(Settings::default());
    f.write_source("a.txt", b"alpha");
    f.write_source("b.txt", b"beta");
    f.write_source("sub/c.txt", b"gamma");
    f.create_job(BackupMode::Differential, false);

    let first = f.engine.execute("Docs").await.expect("first run");
    assert_eq!(first.files_copied, 3);
    let before = mtime(&f.dst().join("a.txt"));

    let second = f.engine.execute("Docs").await.expect("second run");
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(second.files_copied, 0);
    assert_eq!(second.files_skipped, 3);
    assert_eq!(mtime(&f.dst().join("a.txt")), before, "up-to-date target untouched");

    let state = f.engine.state("Docs").expect("state");
    assert_eq!(state.status, JobStatus::Completed);
    assert_eq!(state.files_remaining, 0);
    assert_eq!(state.progress_percentage, 100);
    assert_eq!(
        f.actions().iter().filter(|a| **a == LogAction::FileSkipped).count(),
        3
    );

    // A newer source is copied again.
    fs::write(f.src().join("b.txt"), b"beta v2").expect("rewrite source");
    let later = SystemTime::now() + Duration::from_secs(60);
    filetime::set_file_mtime(f.src().join("b.txt"), filetime::FileTime::from_system_time(later))
        .expect("set mtime");

    let third = f.engine.execute("Docs").await.expect("third run");
    assert_eq!(third.files_copied, 1);
    assert_eq!(third.files_skipped, 2);
    assert_eq!(fs::read(f.dst().join("b.txt")).expect("read"), b"beta v2");
}

#[tokio::test]
async fn test_encrypted_files_round_trip() {
    let f = Fixture::new(Settings {
        encrypted_extensions: vec!["txt".to_string()],
        ..Settings::default()
    });
    f.write_source("secret.txt", b"attack at dawn");
    f.write_source("plain.bin", b"public");
    f.create_job(BackupMode::Full, true);

    let outcome = f.engine.execute("Docs").await.expect("run");
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.files_copied, 2);

    let sealed = f.dst().join("secret.txt");
    assert_ne!(fs::read(&sealed).expect("read sealed"), b"attack at dawn");
    assert_eq!(fs::read(f.dst().join("plain.bin")).expect("read plain"), b"public");

    let opened = f.dir.path().join("opened.txt");
    f.encryptor
        .decrypt(&sealed, &opened, &CancellationToken::new())
        .await
        .expect("decrypt");
    assert_eq!(fs::read(&opened).expect("read opened"), b"attack at dawn");

    let entries = f.log.entries();
    let encrypted = entries
        .iter()
        .find(|e| e.action == LogAction::EncryptionComplete)
        .expect("encryption logged");
    assert!(encrypted.encryption_time_ms.is_some());

    let staging = f.dir.path().join("staging");
    assert!(!staging.exists() || fs::read_dir(&staging).expect("read").count() == 0);
}

#[tokio::test]
async fn test_failed_file_settles_job_in_error() {
    let f = Fixture::new(Settings {
        encrypted_extensions: vec!["txt".to_string()],
        ..Settings::default()
    });
    f.write_source("bad.txt", b"nope");
    f.write_source("good.txt", b"fine");
    f.create_job(BackupMode::Full, true);

    let outcome = f.engine.execute("Docs").await.expect("run");
    assert_eq!(outcome.status, JobStatus::Error);
    assert_eq!(outcome.files_copied, 1);
    assert_eq!(outcome.files_failed, 1);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors[0].contains("bad.txt"));
    assert!(!f.dst().join("bad.txt").exists());
    assert!(f.dst().join("good.txt").exists());

    let state = f.engine.state("Docs").expect("state");
    assert_eq!(state.status, JobStatus::Error);
    assert_eq!(state.files_remaining, 0);
    assert_eq!(state.progress_percentage, 100);

    let last = f.log.entries().pop().expect("final entry");
    assert_eq!(last.action, LogAction::BackupFailed);
    assert_eq!(last.errors, outcome.errors);
}

#[tokio::test]
async fn test_encryption_tool_running_blocks_encrypting_jobs() {
    let f = Fixture::new(Settings::default());
    f.write_source("a.txt", b"a");
    f.create_job(BackupMode::Full, true);
    f.encryptor.running_elsewhere.store(true, Ordering::SeqCst);

    let result = f.engine.execute("Docs").await;
    assert!(matches!(result, Err(EngineError::EncryptionToolRunning { .. })));
    assert_eq!(f.engine.state("Docs").expect("state").status, JobStatus::Ready);
    assert!(!f.dst().exists());
}

#[tokio::test]
async fn test_pause_then_resume_copies_everything() {
    let f = Fixture::new(Settings {
        chunk_size: 16,
        pause_poll_interval_ms: 5,
        ..Settings::default()
    });
    let data: Vec<u8> = (0..200u8).collect();
    f.write_source("data.bin", &data);
    f.create_job(BackupMode::Full, false);

    let handle = f.engine.start("Docs").await.expect("start");
    f.engine.pause("Docs").expect("pause");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(f.engine.state("Docs").expect("state").status, JobStatus::Paused);
    assert!(!f.dst().join("data.bin").exists());

    f.engine.resume("Docs").expect("resume");
    let outcome = handle.await.expect("join").expect("run");
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.bytes_copied, 200);
    assert_eq!(fs::read(f.dst().join("data.bin")).expect("read"), data);

    let actions = f.actions();
    assert!(actions.contains(&LogAction::BackupPaused));
    assert!(actions.contains(&LogAction::BackupResumed));
}

#[tokio::test]
async fn test_stop_settles_stopped() {
    let f = Fixture::new(Settings::default());
    f.write_source("a.txt", b"a");
    f.write_source("b.txt", b"b");
    f.create_job(BackupMode::Full, false);

    let handle = f.engine.start("Docs").await.expect("start");
    f.engine.pause("Docs").expect("pause");
    tokio::time::sleep(Duration::from_millis(20)).await;
    f.engine.stop("Docs").expect("stop");

    let outcome = handle.await.expect("join").expect("run");
    assert_eq!(outcome.status, JobStatus::Stopped);
    assert_eq!(outcome.files_copied, 0);

    let state = f.engine.state("Docs").expect("state");
    assert_eq!(state.status, JobStatus::Stopped);
    assert!(state.files_remaining <= state.total_files);
    assert!(state.bytes_remaining <= state.total_bytes);
    assert!(!f.engine.is_running("Docs"));
    assert_eq!(f.actions().last(), Some(&LogAction::BackupStopped));

    // A stopped job can run again.
    let outcome = f.engine.execute("Docs").await.expect("rerun");
    assert_eq!(outcome.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_cancel_all_settles_cancelled() {
    let f = Fixture::new(Settings::default());
    f.write_source("a.txt", b"a");
    f.create_job(BackupMode::Full, false);

    let handle = f.engine.start("Docs").await.expect("start");
    f.engine.pause("Docs").expect("pause");
    assert_eq!(f.engine.running(), vec!["Docs".to_string()]);
    assert_eq!(f.engine.cancel_all(), 1);

    let outcome = handle.await.expect("join").expect("run");
    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert_eq!(f.engine.state("Docs").expect("state").status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_second_start_is_rejected_while_running() {
    let f = Fixture::new(Settings::default());
    f.write_source("a.txt", b"a");
    f.create_job(BackupMode::Full, false);

    let handle = f.engine.start("Docs").await.expect("start");
    f.engine.pause("Docs").expect("pause");

    let second = f.engine.execute("Docs").await;
    assert!(matches!(second, Err(EngineError::AlreadyRunning { .. })));
    assert!(matches!(
        f.engine.delete_job("Docs"),
        Err(EngineError::JobRunning { .. })
    ));

    f.engine.resume("Docs").expect("resume");
    let outcome = handle.await.expect("join").expect("first run");
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(fs::read(f.dst().join("a.txt")).expect("read"), b"a");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_priority_files_copy_first() {
    let (sink, events) = ChannelProgressSink::bounded(100_000);
    let f = Fixture::with_sink(
        Settings {
            priority_extensions: vec!["pdf".to_string()],
            chunk_size: 64,
            ..Settings::default()
        },
        Some(Arc::new(sink)),
    );
    for i in 0..4 {
        f.write_source(&format!("normal{}.txt", i), &[b'n'; 2048]);
        f.write_source(&format!("urgent{}.pdf", i), &[b'p'; 2048]);
    }
    f.create_job(BackupMode::Full, false);

    let outcome = f.engine.execute("Docs").await.expect("run");
    assert_eq!(outcome.status, JobStatus::Completed);

    let sources: Vec<PathBuf> = events
        .try_iter()
        .filter_map(|e| match e {
            ProgressEvent::File(p) => Some(p.source),
            _ => None,
        })
        .collect();
    let is_priority = |p: &PathBuf| p.extension().map_or(false, |e| e == "pdf");
    let last_priority = sources.iter().rposition(is_priority).expect("priority events");
    let first_normal = sources.iter().position(|p| !is_priority(p)).expect("normal events");
    assert!(
        last_priority < first_normal,
        "a normal file started before every priority file finished"
    );
}

#[tokio::test]
async fn test_execute_many_runs_jobs_concurrently() {
    let f = Fixture::new(Settings::default());
    f.write_source("a.txt", b"a");
    f.create_job(BackupMode::Full, false);

    let other_src = f.dir.path().join("other-src");
    fs::create_dir_all(&other_src).expect("create other src");
    fs::write(other_src.join("b.txt"), b"b").expect("write");
    f.engine
        .create_job(Job::new(
            "Other",
            &other_src,
            f.dir.path().join("other-dst"),
            BackupMode::Full,
            false,
        ))
        .expect("create other");

    let results = f.engine.execute_many(["Docs", "Other", "Missing"]).await;
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].0, "Docs");
    assert_eq!(results[0].1.as_ref().expect("docs").status, JobStatus::Completed);
    assert_eq!(results[1].1.as_ref().expect("other").status, JobStatus::Completed);
    assert!(matches!(results[2].1, Err(EngineError::JobNotFound { .. })));
    assert!(f.dir.path().join("other-dst").join("b.txt").exists());
}

#[tokio::test]
async fn test_pause_mid_file_suspends_at_chunk_boundary() {
    let paused = Arc::new(AtomicBool::new(false));
    let sink = ScriptedSink::new({
        let paused = paused.clone();
        move |engine, event| {
            if event.bytes_transferred >= 16 && !paused.swap(true, Ordering::SeqCst) {
                engine.pause("Docs").expect("pause mid-file");
            }
        }
    });
    let f = scripted(
        Settings {
            chunk_size: 16,
            pause_poll_interval_ms: 5,
            ..Settings::default()
        },
        &sink,
    );
    let data: Vec<u8> = (0..200u8).collect();
    f.write_source("data.bin", &data);
    f.create_job(BackupMode::Full, false);

    let handle = f.engine.start("Docs").await.expect("start");
    wait_for(&paused).await;
    let seen = sink.files().len();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(sink.files().len(), seen, "a chunk was copied while paused");
    assert_eq!(f.engine.state("Docs").expect("state").status, JobStatus::Paused);
    assert!(!f.dst().join("data.bin").exists());

    f.engine.resume("Docs").expect("resume");
    let outcome = handle.await.expect("join").expect("run");
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.bytes_copied, 200);
    assert_eq!(fs::read(f.dst().join("data.bin")).expect("read"), data);

    // One event per chunk, then the settle event; nothing lost or repeated.
    let transferred: Vec<u64> = sink.files().iter().map(|e| e.bytes_transferred).collect();
    let expected: Vec<u64> = (1..=13u64).map(|i| (16 * i).min(200)).chain([200]).collect();
    assert_eq!(transferred, expected);
}

#[tokio::test]
async fn test_stop_mid_file_restores_unsettled_bytes() {
    let sink = ScriptedSink::new(|engine, event| {
        if event.bytes_transferred >= 64 {
            let _ = engine.stop("Docs");
        }
    });
    let f = scripted(
        Settings {
            chunk_size: 16,
            ..Settings::default()
        },
        &sink,
    );
    f.write_source("data.bin", &[b'd'; 200]);
    f.create_job(BackupMode::Full, false);

    let outcome = f.engine.execute("Docs").await.expect("run");
    assert_eq!(outcome.status, JobStatus::Stopped);
    assert_eq!(outcome.bytes_copied, 0);

    let state = f.engine.state("Docs").expect("state");
    assert_eq!(state.status, JobStatus::Stopped);
    assert_eq!(state.total_files, 1);
    assert_eq!(state.files_remaining, 1);
    assert_eq!(state.bytes_remaining, 200, "bytes of the interrupted file are still owed");
    assert!(!f.dst().join("data.bin").exists());
    assert_eq!(partials_in(&f.dst()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_files_copy_one_at_a_time() {
    let dst = Arc::new(OnceLock::<PathBuf>::new());
    let most = Arc::new(AtomicUsize::new(0));
    let sink = ScriptedSink::new({
        let dst = dst.clone();
        let most = most.clone();
        move |_, _| {
            if let Some(dst) = dst.get() {
                most.fetch_max(partials_in(dst), Ordering::SeqCst);
            }
        }
    });
    let f = scripted(
        Settings {
            chunk_size: 64,
            large_file_threshold: 100,
            ..Settings::default()
        },
        &sink,
    );
    let _ = dst.set(f.dst());
    for i in 0..4 {
        f.write_source(&format!("large{}.bin", i), &[b'l'; 2048]);
    }
    f.create_job(BackupMode::Full, false);

    let outcome = f.engine.execute("Docs").await.expect("run");
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.files_copied, 4);
    assert_eq!(most.load(Ordering::SeqCst), 1, "large files overlapped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_priority_batch_encrypts_before_normal_batch() {
    let (sink, events) = ChannelProgressSink::bounded(10_000);
    let f = Fixture::with_sink(
        Settings {
            priority_extensions: vec!["pdf".to_string()],
            encrypted_extensions: vec!["pdf".to_string(), "txt".to_string()],
            ..Settings::default()
        },
        Some(Arc::new(sink)),
    );
    for i in 0..3 {
        f.write_source(&format!("normal{}.txt", i), b"plain text");
        f.write_source(&format!("urgent{}.pdf", i), b"priority text");
    }
    f.create_job(BackupMode::Full, true);

    let outcome = f.engine.execute("Docs").await.expect("run");
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.files_copied, 6);

    let files: Vec<PathBuf> = events
        .try_iter()
        .filter_map(|e| match e {
            ProgressEvent::Encryption(p) => Some(p.file),
            _ => None,
        })
        .collect();
    let is_priority = |p: &PathBuf| p.extension().map_or(false, |e| e == "pdf");
    assert_eq!(files.iter().filter(|p| is_priority(p)).count(), 6, "start and end per file");
    let last_priority = files.iter().rposition(is_priority).expect("priority events");
    let first_normal = files.iter().position(|p| !is_priority(p)).expect("normal events");
    assert!(
        last_priority < first_normal,
        "a normal file was encrypted before the priority batch finished"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_dangling_link_fails_alone() {
    let f = Fixture::new(Settings::default());
    f.write_source("a.txt", b"alpha");
    std::os::unix::fs::symlink(f.dir.path().join("missing"), f.src().join("link"))
        .expect("dangling link");
    f.create_job(BackupMode::Full, false);

    let outcome = f.engine.execute("Docs").await.expect("run");
    assert_eq!(outcome.status, JobStatus::Error);
    assert_eq!(outcome.files_copied, 1);
    assert_eq!(outcome.files_failed, 1);
    assert!(outcome.errors[0].contains("link"));
    assert_eq!(fs::read(f.dst().join("a.txt")).expect("read"), b"alpha");

    let state = f.engine.state("Docs").expect("state");
    assert_eq!(state.files_remaining, 0);
    assert!(f.actions().contains(&LogAction::FileCopyError));
}

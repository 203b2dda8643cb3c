//! Writer that drains a [`DataLog`] from a dedicated thread.
//!
//! The thread wakes every `period` (or when asked to flush, rename, stop or
//! shut down), writes the queued blocks, and takes care of segment
//! rotation and free-space backpressure. Producers never wait on I/O: when
//! the disk or the outgoing queue fills up the log pauses and drops data.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    mem,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::Result;
use parking_lot::MutexGuard;
use tracing::{debug, error, info, trace, warn};

use crate::{
    buffer::Buffer,
    clock::{MonotonicClock, TimeProvider},
    log::{Backend, DataLog, LogState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterMode {
    /// A file should be opened on the next wakeup.
    #[default]
    Start,
    Active,
    Paused,
    Stopped,
    Shutdown,
}

/// Requests from producers to the writer thread, guarded by the log lock.
#[derive(Debug, Default)]
pub(crate) struct WriterSignals {
    pub(crate) mode: WriterMode,
    pub(crate) new_filename: Option<String>,
    pub(crate) do_flush: bool,
}

/// Background writer configuration.
#[derive(Debug, Clone)]
pub struct BackgroundWriterConfig {
    /// Directory the log files are created in.
    pub dir: PathBuf,
    /// File name; empty picks a random `wpilog_<hex>.wpilog` name.
    pub filename: String,
    /// Time between flushes.
    pub period: Duration,
    /// Opaque text stored in the file header.
    pub extra_header: String,
    /// Logging pauses when the disk has less free space than this.
    pub min_free_space: u64,
    /// A new segment is started once a file grows past this many bytes.
    pub max_segment_size: u64,
    /// Wakeups between checks that the log file still exists.
    pub check_interval: u32,
    /// Attempts at opening a file (with random fallback names) before giving up.
    pub open_attempts: u32,
}

impl Default for BackgroundWriterConfig {
    fn default() -> Self {
        BackgroundWriterConfig {
            dir: PathBuf::from("."),
            filename: String::new(),
            period: Duration::from_millis(250),
            extra_header: String::new(),
            min_free_space: 5 * 1024 * 1024,   // 5 MiB
            max_segment_size: 1_800_000_000, // 1.8 GB
            check_interval: 10,
            open_attempts: 5,
        }
    }
}

impl BackgroundWriterConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    #[must_use]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    #[must_use]
    pub fn with_extra_header(mut self, extra_header: impl Into<String>) -> Self {
        self.extra_header = extra_header.into();
        self
    }

    #[must_use]
    pub fn with_min_free_space(mut self, bytes: u64) -> Self {
        self.min_free_space = bytes;
        self
    }

    #[must_use]
    pub fn with_max_segment_size(mut self, bytes: u64) -> Self {
        self.max_segment_size = bytes;
        self
    }

    #[must_use]
    pub fn with_check_interval(mut self, wakeups: u32) -> Self {
        self.check_interval = wakeups;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period.is_zero() {
            return Err(ConfigError::ZeroPeriod);
        }
        if self.check_interval == 0 {
            return Err(ConfigError::ZeroCheckInterval);
        }
        if self.open_attempts == 0 {
            return Err(ConfigError::ZeroOpenAttempts);
        }
        Ok(())
    }

    /// Short period so tests do not sit in condition variable waits.
    #[must_use]
    pub fn for_testing() -> Self {
        BackgroundWriterConfig {
            period: Duration::from_millis(10),
            min_free_space: 0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("flush period must be nonzero")]
    ZeroPeriod,

    #[error("file existence check interval must be nonzero")]
    ZeroCheckInterval,

    #[error("at least one file open attempt is required")]
    ZeroOpenAttempts,
}

struct BackgroundBackend;

impl Backend for BackgroundBackend {
    fn buffer_half_full(&self, state: &mut LogState) {
        state.writer.do_flush = true;
    }

    fn buffer_full(&self, state: &mut LogState) -> bool {
        error!(
            "outgoing buffers exceeded threshold, pausing logging; \
             consider flushing to disk more frequently (shorter period)"
        );
        if state.writer.mode == WriterMode::Active {
            state.writer.mode = WriterMode::Paused;
        }
        true
    }
}

/// A [`DataLog`] drained to disk (or a custom sink) by a background thread.
///
/// Dereferences to the [`DataLog`] for starting entries and appending.
/// Dropping the writer flushes everything still queued and joins the thread.
pub struct DataLogBackgroundWriter {
    log: Arc<DataLog>,
    thread: Option<JoinHandle<()>>,
}

impl DataLogBackgroundWriter {
    pub fn new(config: BackgroundWriterConfig) -> Result<Self> {
        Self::with_clock(config, MonotonicClock::new())
    }

    pub fn with_clock(
        config: BackgroundWriterConfig,
        clock: impl TimeProvider + Send + Sync + 'static,
    ) -> Result<Self> {
        let target = Target::File(FileTarget::new(&config.dir, &config.filename));
        Self::spawn(config, Arc::new(clock), target)
    }

    /// Hands each drained block to `sink` instead of writing files. Rotation,
    /// renaming and free-space checks do not apply.
    pub fn with_sink(
        config: BackgroundWriterConfig,
        sink: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<Self> {
        Self::with_sink_and_clock(config, sink, MonotonicClock::new())
    }

    pub fn with_sink_and_clock(
        config: BackgroundWriterConfig,
        sink: impl FnMut(&[u8]) + Send + 'static,
        clock: impl TimeProvider + Send + Sync + 'static,
    ) -> Result<Self> {
        let target = Target::Sink {
            write: Box::new(sink),
            open: false,
            started: false,
        };
        Self::spawn(config, Arc::new(clock), target)
    }

    fn spawn(
        config: BackgroundWriterConfig,
        clock: Arc<dyn TimeProvider + Send + Sync>,
        target: Target,
    ) -> Result<Self> {
        config.validate()?;

        let log = Arc::new(DataLog::new(
            Arc::new(BackgroundBackend),
            clock,
            &config.extra_header,
        ));

        let thread_log = Arc::clone(&log);
        let handle = thread::Builder::new()
            .name("datalog-writer".into())
            .spawn(move || {
                WriterThread {
                    config,
                    target,
                    wakeups: 0,
                }
                .run(&thread_log);
            })?;

        Ok(DataLogBackgroundWriter {
            log,
            thread: Some(handle),
        })
    }

    /// Renames the current file (or names the next one if none is open).
    pub fn set_filename(&self, filename: &str) {
        let mut state = self.log.lock();
        state.writer.new_filename = Some(filename.to_owned());
        self.log.wake().notify_all();
    }

    /// Asks the writer thread to write out everything queued so far.
    pub fn flush(&self) {
        let mut state = self.log.lock();
        state.writer.do_flush = true;
        self.log.wake().notify_all();
    }

    pub fn pause(&self) {
        let mut state = self.log.lock();
        state.paused = true;
        if state.writer.mode == WriterMode::Active {
            state.writer.mode = WriterMode::Paused;
        }
    }

    /// Resumes after [`pause`](Self::pause), a backpressure pause, or a
    /// [`stop`](Self::stop); after a stop the next segment file is started.
    pub fn resume(&self) {
        let mut state = self.log.lock();
        state.paused = false;
        match state.writer.mode {
            WriterMode::Paused => state.writer.mode = WriterMode::Active,
            WriterMode::Stopped => state.writer.mode = WriterMode::Start,
            _ => {}
        }
        self.log.wake().notify_all();
    }

    /// Closes the file once what is already queued has been written.
    pub fn stop(&self) {
        let mut state = self.log.lock();
        state.active = false;
        state.writer.mode = WriterMode::Stopped;
        state.writer.new_filename = None;
        self.log.wake().notify_all();
    }

    #[must_use]
    pub fn mode(&self) -> WriterMode {
        self.log.lock().writer.mode
    }
}

impl Deref for DataLogBackgroundWriter {
    type Target = DataLog;

    fn deref(&self) -> &DataLog {
        &self.log
    }
}

impl Drop for DataLogBackgroundWriter {
    fn drop(&mut self) {
        {
            let mut state = self.log.lock();
            state.writer.mode = WriterMode::Shutdown;
            self.log.wake().notify_all();
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("data log writer thread panicked");
            }
        }
    }
}

enum Target {
    File(FileTarget),
    Sink {
        write: Box<dyn FnMut(&[u8]) + Send>,
        open: bool,
        /// The file header has already been delivered.
        started: bool,
    },
}

impl Target {
    fn is_open(&self) -> bool {
        match self {
            Target::File(file) => file.file.is_some(),
            Target::Sink { open, .. } => *open,
        }
    }

    /// A sink is one continuous stream; reopening it must not repeat the
    /// file header.
    fn continues_stream(&self) -> bool {
        matches!(self, Target::Sink { started: true, .. })
    }

    fn open(&mut self, config: &BackgroundWriterConfig) -> bool {
        match self {
            Target::File(file) => file.open(config),
            Target::Sink { open, started, .. } => {
                *open = true;
                *started = true;
                true
            }
        }
    }

    /// Closes the output; a file target moves on to the next segment name.
    fn close_segment(&mut self) {
        match self {
            Target::File(file) => {
                file.close();
                file.increment_filename();
            }
            Target::Sink { open, .. } => *open = false,
        }
    }

    /// Returns `true` if writing stopped for lack of free space.
    fn write_all(&mut self, bufs: &[Buffer], config: &BackgroundWriterConfig) -> bool {
        match self {
            Target::File(file) => file.write_all(bufs, config),
            Target::Sink { write, .. } => {
                for buf in bufs {
                    write(buf.data());
                }
                false
            }
        }
    }
}

/// Current output file and rotation state. Only the writer thread touches it.
struct FileTarget {
    dir: PathBuf,
    base_filename: String,
    filename: String,
    path: PathBuf,
    file: Option<File>,
    segment: u32,
    free_space: u64,
    flushes: u32,
    written: u64,
    blocked: bool,
}

impl FileTarget {
    fn new(dir: &Path, filename: &str) -> Self {
        let mut target = FileTarget {
            dir: dir.to_path_buf(),
            base_filename: String::new(),
            filename: String::new(),
            path: PathBuf::new(),
            file: None,
            segment: 1,
            free_space: u64::MAX,
            flushes: 0,
            written: 0,
            blocked: false,
        };
        target.set_filename(filename);
        target
    }

    fn set_filename(&mut self, filename: &str) {
        filename.clone_into(&mut self.base_filename);
        filename.clone_into(&mut self.filename);
        self.path = self.dir.join(filename);
        self.segment = 1;
    }

    /// `{stem}.{segment}{ext}` for the next segment of the same log.
    fn increment_filename(&mut self) {
        self.segment += 1;
        let base = Path::new(&self.base_filename);
        let stem = base
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = base
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        self.filename = format!("{stem}.{}{ext}", self.segment);
        self.path = self.dir.join(&self.filename);
    }

    fn refresh_free_space(&mut self) {
        self.free_space = fs2::available_space(&self.dir).unwrap_or(u64::MAX);
    }

    fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = file.sync_all() {
                warn!(file = %self.filename, %err, "could not sync log file on close");
            }
        }
    }

    fn open(&mut self, config: &BackgroundWriterConfig) -> bool {
        if self.filename.is_empty() {
            self.set_filename(&random_filename());
        }
        if let Err(err) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), %err, "could not create log directory");
        }

        self.refresh_free_space();
        if self.free_space < config.min_free_space {
            error!(
                available = %format_bytes(self.free_space),
                "insufficient free space, no log being saved"
            );
            return false;
        }

        for _ in 0..config.open_attempts {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(file) => {
                    self.file = Some(file);
                    break;
                }
                Err(err) => {
                    error!(path = %self.path.display(), %err, "could not open log file");
                    self.set_filename(&random_filename());
                }
            }
        }

        if self.file.is_none() {
            error!("could not open log file, no log being saved");
            return false;
        }

        info!(
            path = %self.path.display(),
            free_space = %format_bytes(self.free_space),
            "logging to file"
        );
        self.written = 0;
        self.flushes = 0;
        self.blocked = false;
        true
    }

    fn rename(&mut self, filename: &str) {
        if self.file.is_none() {
            self.set_filename(filename);
            return;
        }
        if self.filename == filename {
            return;
        }

        let new_path = self.dir.join(filename);
        match fs::rename(&self.path, &new_path) {
            Ok(()) => {
                info!(from = %self.filename, to = filename, "renamed log file");
                self.set_filename(filename);
            }
            Err(err) => {
                error!(
                    from = %self.filename,
                    to = filename,
                    %err,
                    "could not rename log file"
                );
            }
        }
    }

    /// Writes a drained batch. The batch always ends on a record boundary,
    /// so it is written whole or not at all when space runs low.
    fn write_all(&mut self, bufs: &[Buffer], config: &BackgroundWriterConfig) -> bool {
        if self.file.is_none() {
            return false;
        }

        // refresh every 10 flushes in case something else is filling the disk
        self.flushes += 1;
        if self.blocked || self.flushes >= 10 {
            self.flushes = 0;
            self.refresh_free_space();
        }

        let total: u64 = bufs.iter().map(|buf| buf.len() as u64).sum();
        if self.free_space.saturating_sub(total) < config.min_free_space {
            if !self.blocked {
                error!(
                    available = %format_bytes(self.free_space),
                    "stopped logging due to low free space"
                );
            }
            self.blocked = true;
            return true;
        }
        self.blocked = false;

        let Some(file) = self.file.as_mut() else {
            return false;
        };
        for buf in bufs {
            if let Err(err) = write_retrying(file, buf.data()) {
                error!(file = %self.filename, %err, "error writing to log file");
                break;
            }
            self.written += buf.len() as u64;
            self.free_space = self.free_space.saturating_sub(buf.len() as u64);
        }

        if let Err(err) = file.sync_data() {
            warn!(file = %self.filename, %err, "could not sync log file");
        }
        false
    }
}

fn write_retrying(file: &mut File, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match file.write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn random_filename() -> String {
    format!("wpilog_{:016x}.wpilog", rand::random::<u64>())
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(value: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    match value {
        u64::MAX => "unknown".to_string(),
        0..KIB => format!("{value} B"),
        KIB..MIB => format!("{:.1} KiB", value as f64 / KIB as f64),
        MIB..GIB => format!("{:.1} MiB", value as f64 / MIB as f64),
        _ => format!("{:.1} GiB", value as f64 / GIB as f64),
    }
}

struct WriterThread {
    config: BackgroundWriterConfig,
    target: Target,
    wakeups: u32,
}

impl WriterThread {
    fn run(mut self, log: &DataLog) {
        debug!("data log writer thread starting");

        let mut state = log.lock();
        // a writer dropped right away still gets its file
        if matches!(state.writer.mode, WriterMode::Start | WriterMode::Shutdown) {
            self.start(log, &mut state);
        }

        loop {
            if state.writer.mode == WriterMode::Shutdown {
                break;
            }

            // requests made while the lock was released already notified
            let pending = state.writer.do_flush
                || state.writer.new_filename.is_some()
                || state.writer.mode == WriterMode::Start;
            let timed_out = !pending
                && log
                    .wake()
                    .wait_for(&mut state, self.config.period)
                    .timed_out();
            let do_flush = mem::take(&mut state.writer.do_flush) || timed_out;

            match state.writer.mode {
                WriterMode::Shutdown => break,
                WriterMode::Stopped => {
                    if self.target.is_open() {
                        self.flush(&mut state);
                        state.active = false;
                        MutexGuard::unlocked(&mut state, || self.target.close_segment());
                    }
                    // with no file open this names the next one
                    self.apply_rename(&mut state);
                    continue;
                }
                _ => {}
            }

            let mut do_start = state.writer.mode == WriterMode::Start;
            if let Some(reason) = MutexGuard::unlocked(&mut state, || self.rotation_reason()) {
                // whatever is queued still belongs to the old segment
                self.flush(&mut state);
                MutexGuard::unlocked(&mut state, || self.target.close_segment());
                if let Target::File(file) = &self.target {
                    info!(reason, file = %file.filename, "starting new log segment");
                }
                state.active = false;
                do_start = true;
            }

            if do_start {
                if self.target.is_open() {
                    // resumed before the stop was seen; finish the old segment
                    self.flush(&mut state);
                    MutexGuard::unlocked(&mut state, || self.target.close_segment());
                }
                self.start(log, &mut state);
            }

            self.apply_rename(&mut state);

            if do_flush {
                self.flush(&mut state);
            }
        }

        // final rename and flush, then close
        self.apply_rename(&mut state);
        self.flush(&mut state);
        drop(state);
        if let Target::File(file) = &mut self.target {
            file.close();
        }
        debug!("data log writer thread exiting");
    }

    /// Opens the target and begins a file in the log; called with the log
    /// locked, releases the lock around the I/O.
    fn start(&mut self, log: &DataLog, state: &mut MutexGuard<'_, LogState>) {
        let opened = MutexGuard::unlocked(state, || {
            let continuing = self.target.continues_stream();
            let opened = self.target.open(&self.config);
            if opened {
                log.stop();
                if continuing {
                    log.continue_stream();
                } else {
                    log.start_file();
                }
            }
            opened
        });

        // stop or shutdown requested while the lock was released
        if matches!(state.writer.mode, WriterMode::Stopped | WriterMode::Shutdown) {
            return;
        }
        state.writer.mode = if !opened {
            WriterMode::Stopped
        } else if state.paused {
            WriterMode::Paused
        } else {
            WriterMode::Active
        };
    }

    fn apply_rename(&mut self, state: &mut MutexGuard<'_, LogState>) {
        if let Some(filename) = state.writer.new_filename.take() {
            MutexGuard::unlocked(state, || match &mut self.target {
                Target::File(file) => file.rename(&filename),
                Target::Sink { .. } => warn!(%filename, "cannot rename a custom sink"),
            });
        }
    }

    fn rotation_reason(&mut self) -> Option<&'static str> {
        let Target::File(file) = &self.target else {
            return None;
        };
        file.file.as_ref()?;

        self.wakeups += 1;
        if self.wakeups >= self.config.check_interval {
            self.wakeups = 0;
            if matches!(file.path.try_exists(), Ok(false)) {
                return Some("log file deleted");
            }
        }
        if file.written > self.config.max_segment_size {
            return Some("log file reached maximum size");
        }
        None
    }

    fn flush(&mut self, state: &mut MutexGuard<'_, LogState>) {
        let bufs = DataLog::drain_locked(state);
        if bufs.is_empty() {
            return;
        }

        let bytes: usize = bufs.iter().map(Buffer::len).sum();
        trace!(buffers = bufs.len(), bytes, "flushing data log");

        let out_of_space = if self.target.is_open() {
            MutexGuard::unlocked(state, || self.target.write_all(&bufs, &self.config))
        } else {
            false
        };
        if out_of_space {
            state.writer.mode = WriterMode::Paused;
            state.paused = true;
        }
        state.pool.release(bufs);
    }
}

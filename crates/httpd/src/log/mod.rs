//! Leveled log output to dated, rotating files.
//!
//! [`init`] installs a `tracing-subscriber` `fmt` subscriber whose writer appends to
//! `<dir>/<YYYY_MM_DD><suffix>`. A new file is started when the date changes and every
//! 50 000 lines (`<dir>/<YYYY_MM_DD>-<n><suffix>`).
//!
//! With a non-zero `queue_size` each formatted line is handed to a background writer
//! thread over a bounded channel; a full channel makes the caller write the line
//! itself. Call sites are the same plain `tracing` macros in both modes. Dropping the
//! returned [`LogGuard`] drains the queue and flushes the file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{Local, NaiveDate};
use thiserror::Error;
use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

use crate::utils::lock;

/// Lines per file before a numbered continuation file is started.
const MAX_LINES: usize = 50_000;

/// Failures while setting up logging.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("invalid log level {level}, expected 0 (debug) to 3 (error)")]
    InvalidLevel { level: u8 },

    #[error("failed to open log file: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("failed to install log subscriber: {reason}")]
    Install { reason: String },
}

impl LogError {
    /// The global subscriber could not be set, usually because one is already installed.
    pub fn install<S: ToString>(str: S) -> Self {
        Self::Install { reason: str.to_string() }
    }
}

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `false` skips installing any subscriber
    pub enabled: bool,
    /// 0 debug, 1 info, 2 warn, 3 error
    pub level: u8,
    pub dir: PathBuf,
    /// appended to the dated file name, `.log` by default
    pub suffix: String,
    /// Capacity of the background queue, 0 writes synchronously
    pub queue_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { enabled: true, level: 1, dir: PathBuf::from("./log"), suffix: ".log".to_owned(), queue_size: 1024 }
    }
}

impl LogConfig {
    /// Maps the numeric level onto a `tracing` level.
    pub fn max_level(&self) -> Result<Level, LogError> {
        match self.level {
            0 => Ok(Level::DEBUG),
            1 => Ok(Level::INFO),
            2 => Ok(Level::WARN),
            3 => Ok(Level::ERROR),
            level => Err(LogError::InvalidLevel { level }),
        }
    }
}

/// Installs the file subscriber as the global default.
///
/// Returns `None` when logging is disabled; the `tracing` macros are then no-ops.
pub fn init(config: &LogConfig) -> Result<Option<LogGuard>, LogError> {
    if !config.enabled {
        return Ok(None);
    }
    let (subscriber, guard) = build(config)?;
    tracing::subscriber::set_global_default(subscriber).map_err(LogError::install)?;
    Ok(Some(guard))
}

/// Builds the file subscriber without installing it.
pub fn build(config: &LogConfig) -> Result<(impl Subscriber + Send + Sync + 'static, LogGuard), LogError> {
    let level = config.max_level()?;
    let file = LogFile::open(&config.dir, &config.suffix, MAX_LINES, Local::now().date_naive())?;
    let sink = Arc::new(Sink { file: Mutex::new(file), queue: Mutex::new(None) });

    let worker = if config.queue_size > 0 {
        let (tx, rx) = mpsc::sync_channel(config.queue_size);
        *lock(&sink.queue) = Some(tx);
        let sink = Arc::clone(&sink);
        let handle = thread::Builder::new().name("httpd-log".to_owned()).spawn(move || sink.drain(&rx))?;
        Some(handle)
    } else {
        None
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_timer(LocalTime)
        .with_writer(SinkMaker(Arc::clone(&sink)))
        .finish();
    Ok((subscriber, LogGuard { sink, worker }))
}

/// Flushes the log when dropped; keep it alive for as long as the server logs.
#[derive(Debug)]
pub struct LogGuard {
    sink: Arc<Sink>,
    worker: Option<JoinHandle<()>>,
}

impl LogGuard {
    /// Drains the queue and flushes the file. The flush runs even when the writer thread died.
    fn finish(&mut self) -> io::Result<()> {
        // closing the channel lets the writer thread finish the queue and exit
        lock(&self.sink.queue).take();
        let joined = match self.worker.take() {
            Some(worker) => worker.join().ok().ok_or_else(|| io::Error::other("log writer thread panicked")),
            None => Ok(()),
        };
        let flushed = lock(&self.sink.file).flush();
        joined.and(flushed)
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            eprintln!("failed to finish log: {e}");
        }
    }
}

/// `2024-01-02 15:04:05.000001` in local time
struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.6f"))
    }
}

#[derive(Debug)]
struct Sink {
    file: Mutex<LogFile>,
    queue: Mutex<Option<SyncSender<Vec<u8>>>>,
}

impl Sink {
    fn submit(&self, line: Vec<u8>) {
        let line = match lock(&self.queue).as_ref() {
            Some(tx) => match tx.try_send(line) {
                Ok(()) => return,
                Err(TrySendError::Full(line) | TrySendError::Disconnected(line)) => line,
            },
            None => line,
        };
        self.write_now(&line);
    }

    fn write_now(&self, line: &[u8]) {
        let mut file = lock(&self.file);
        if let Err(e) = file.write_line(line, Local::now().date_naive()) {
            eprintln!("failed to write log line: {e}");
        }
    }

    fn drain(&self, rx: &Receiver<Vec<u8>>) {
        for line in rx {
            self.write_now(&line);
        }
    }
}

struct SinkMaker(Arc<Sink>);

impl<'a> MakeWriter<'a> for SinkMaker {
    type Writer = LineWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter { sink: &self.0, line: Vec::with_capacity(256) }
    }
}

/// Collects one formatted event and submits it on drop.
struct LineWriter<'a> {
    sink: &'a Sink,
    line: Vec<u8>,
}

impl Write for LineWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineWriter<'_> {
    fn drop(&mut self) {
        if !self.line.is_empty() {
            self.sink.submit(std::mem::take(&mut self.line));
        }
    }
}

/// Current log file plus what is needed to decide when to rotate it.
#[derive(Debug)]
struct LogFile {
    dir: PathBuf,
    suffix: String,
    max_lines: usize,
    file: File,
    today: NaiveDate,
    line_count: usize,
}

impl LogFile {
    fn open(dir: &Path, suffix: &str, max_lines: usize, today: NaiveDate) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let file = Self::append(&Self::file_name(dir, suffix, today, 0))?;
        Ok(Self { dir: dir.to_path_buf(), suffix: suffix.to_owned(), max_lines, file, today, line_count: 0 })
    }

    fn file_name(dir: &Path, suffix: &str, date: NaiveDate, part: usize) -> PathBuf {
        let date = date.format("%Y_%m_%d");
        if part == 0 { dir.join(format!("{date}{suffix}")) } else { dir.join(format!("{date}-{part}{suffix}")) }
    }

    fn append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn write_line(&mut self, line: &[u8], today: NaiveDate) -> io::Result<()> {
        if today != self.today {
            self.file.flush()?;
            self.file = Self::append(&Self::file_name(&self.dir, &self.suffix, today, 0))?;
            self.today = today;
            self.line_count = 0;
        } else if self.line_count > 0 && self.line_count % self.max_lines == 0 {
            self.file.flush()?;
            let part = self.line_count / self.max_lines;
            self.file = Self::append(&Self::file_name(&self.dir, &self.suffix, today, part))?;
        }

        self.line_count += 1;
        self.file.write_all(line)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info, warn};

    fn config(dir: &Path, level: u8, queue_size: usize) -> LogConfig {
        LogConfig { enabled: true, level, dir: dir.to_path_buf(), suffix: ".log".to_owned(), queue_size }
    }

    fn today_log(dir: &Path) -> String {
        fs::read_to_string(LogFile::file_name(dir, ".log", Local::now().date_naive(), 0)).unwrap()
    }

    #[test]
    fn level_mapping() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(config(dir.path(), 0, 0).max_level().unwrap(), Level::DEBUG);
        assert_eq!(config(dir.path(), 3, 0).max_level().unwrap(), Level::ERROR);
        assert!(matches!(config(dir.path(), 4, 0).max_level(), Err(LogError::InvalidLevel { level: 4 })));
    }

    #[test]
    fn sync_mode_filters_by_level() {
        let dir = tempfile::tempdir().unwrap();
        let (subscriber, guard) = build(&config(dir.path(), 2, 0)).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            info!("not written");
            warn!(fd = 7, "slow client");
        });
        drop(guard);

        let content = today_log(dir.path());
        assert!(content.contains("slow client"));
        assert!(content.contains("fd=7"));
        assert!(!content.contains("not written"));
    }

    #[test]
    fn async_mode_writes_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let (subscriber, guard) = build(&config(dir.path(), 0, 4)).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            for i in 0..200 {
                debug!(i, "queued line");
            }
        });
        drop(guard);

        let content = today_log(dir.path());
        assert_eq!(content.lines().filter(|line| line.contains("queued line")).count(), 200);
    }

    #[test]
    fn finish_reports_dead_writer_and_still_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let (subscriber, mut guard) = build(&config(dir.path(), 1, 0)).unwrap();
        tracing::subscriber::with_default(subscriber, || info!("before the writer died"));
        guard.worker = Some(thread::spawn(|| panic!("writer died")));

        let err = guard.finish().unwrap_err();
        assert_eq!(err.to_string(), "log writer thread panicked");
        assert!(today_log(dir.path()).contains("before the writer died"));

        // nothing left to join
        guard.finish().unwrap();
    }

    #[test]
    fn rotates_by_line_count_and_date() {
        let dir = tempfile::tempdir().unwrap();
        let day1 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();

        let mut file = LogFile::open(dir.path(), ".log", 2, day1).unwrap();
        for i in 0..5 {
            file.write_line(format!("line {i}\n").as_bytes(), day1).unwrap();
        }
        file.write_line(b"next day\n", day2).unwrap();
        file.flush().unwrap();

        let read = |name: &str| fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("2024_01_02.log"), "line 0\nline 1\n");
        assert_eq!(read("2024_01_02-1.log"), "line 2\nline 3\n");
        assert_eq!(read("2024_01_02-2.log"), "line 4\n");
        assert_eq!(read("2024_01_03.log"), "next day\n");
    }
}

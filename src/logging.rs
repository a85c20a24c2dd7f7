/// Logging Module
///
/// Sets up `tracing` with a console layer and a plain-text file layer. The file
/// layer writes to `<dir>/<prefix>.<year>.log` and moves on to a new file when
/// the calendar year changes.
use crate::config::LogConfig;
use anyhow::{Context, Result};
use chrono::{Datelike, Local};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Keeps the file sink alive for the lifetime of the process and flushes it on drop
pub struct LogGuard {
    writer: YearlyFileWriter,
}

impl LogGuard {
    /// Path of the file currently being written
    pub fn current_path(&self) -> PathBuf {
        self.writer.path_for_year(Local::now().year())
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Install the global subscriber.
///
/// Must be called once, from the entry point, before either stage runs.
pub fn init(config: &LogConfig) -> Result<LogGuard> {
    fs::create_dir_all(&config.dir)
        .with_context(|| format!("Failed to create log directory {}", config.dir.display()))?;

    let writer = YearlyFileWriter::new(&config.dir, &config.file_prefix);

    tracing_subscriber::registry()
        .with(env_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref()))
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(writer.clone()))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { writer })
}

/// `RUST_LOG` directives, or `info` when none are given
fn env_filter(directives: Option<&str>) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(directives.unwrap_or_default())
}

fn file_name(prefix: &str, year: i32) -> String {
    format!("{}.{}.log", prefix, year)
}

/// Append-only log file rotated once per calendar year
#[derive(Clone)]
pub struct YearlyFileWriter {
    inner: Arc<Mutex<YearlyFile>>,
}

struct YearlyFile {
    dir: PathBuf,
    prefix: String,
    year: i32,
    file: Option<File>,
}

impl YearlyFileWriter {
    pub fn new(dir: &Path, prefix: &str) -> Self {
        let inner = YearlyFile { dir: dir.to_path_buf(), prefix: prefix.to_string(), year: 0, file: None };
        Self { inner: Arc::new(Mutex::new(inner)) }
    }

    fn path_for_year(&self, year: i32) -> PathBuf {
        match self.inner.lock() {
            Ok(inner) => inner.dir.join(file_name(&inner.prefix, year)),
            Err(poisoned) => {
                let inner = poisoned.into_inner();
                inner.dir.join(file_name(&inner.prefix, year))
            }
        }
    }

    fn write_for_year(&self, year: i32, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().map_err(|_| io::Error::other("log writer lock poisoned"))?;
        inner.write_for_year(year, buf)
    }
}

impl YearlyFile {
    fn write_for_year(&mut self, year: i32, buf: &[u8]) -> io::Result<usize> {
        if self.file.is_none() || self.year != year {
            self.rotate(year)?;
        }

        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("log file is not open")),
        }
    }

    fn rotate(&mut self, year: i32) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }

        let path = self.dir.join(file_name(&self.prefix, year));
        self.file = Some(OpenOptions::new().create(true).append(true).open(path)?);
        self.year = year;
        Ok(())
    }
}

impl Write for YearlyFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_for_year(Local::now().year(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.inner.lock().map_err(|_| io::Error::other("log writer lock poisoned"))?;
        match inner.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for YearlyFileWriter {
    type Writer = YearlyFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

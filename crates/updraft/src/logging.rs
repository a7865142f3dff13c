#[cfg(debug_assertions)]
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use simplelog::{CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, WriteLogger};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use updraft_platform::AppPaths;

/// Append-only log file that is reopened when something deletes it, e.g. a
/// user cleaning up while the host keeps running.
struct ReopeningLogFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl ReopeningLogFile {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = Self::append_to(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    fn append_to(path: &Path) -> io::Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn with_file<T>(&self, write: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.is_none() || !self.path.exists() {
            *guard = Some(Self::append_to(&self.path)?);
        }
        match guard.as_mut() {
            Some(file) => write(file),
            None => Err(io::Error::other("log file not available")),
        }
    }
}

impl Write for ReopeningLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.as_mut().map_or(Ok(()), Write::flush)
    }
}

/// Drop the older half of an oversized log, cutting at a line boundary.
fn trim_to_recent_half(log_path: &Path, max_log_size: u64) {
    let Ok(metadata) = std::fs::metadata(log_path) else {
        return;
    };
    if metadata.len() <= max_log_size {
        return;
    }
    if let Ok(contents) = std::fs::read(log_path) {
        let half = contents.len() / 2;
        let start = contents[half..]
            .iter()
            .position(|&byte| byte == b'\n')
            .map_or(half, |offset| half + offset + 1);
        let _ = std::fs::write(log_path, &contents[start..]);
    }
}

/// Install the global logger, writing to `updraft.log` in the platform data
/// directory (and the terminal in debug builds).
///
/// Library crates log through the `log` facade; hosts that install their own
/// logger simply skip this.
pub fn init_logging(debug_enabled: bool, max_log_size: u64) {
    let Ok(paths) = AppPaths::new() else {
        return;
    };
    init_logging_at(&paths.log_file(), debug_enabled, max_log_size);
}

pub fn init_logging_at(log_path: &Path, debug_enabled: bool, max_log_size: u64) {
    trim_to_recent_half(log_path, max_log_size);

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("updraft")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();

    #[cfg(debug_assertions)]
    loggers.push(TermLogger::new(
        LevelFilter::Debug,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));

    match ReopeningLogFile::open(log_path.to_path_buf()) {
        Ok(file) => loggers.push(WriteLogger::new(LevelFilter::Debug, config, file)),
        Err(error) => eprintln!("updraft: cannot open {}: {error}", log_path.display()),
    }

    if loggers.is_empty() {
        return;
    }
    let _ = CombinedLogger::init(loggers);
    set_logging_enabled(debug_enabled);
    log::debug!("Debug logging enabled, writing to {}", log_path.display());
}

/// Switch between debug output and the default of info and above.
pub fn set_logging_enabled(debug_enabled: bool) {
    if debug_enabled {
        log::set_max_level(LevelFilter::Debug);
    } else {
        log::set_max_level(LevelFilter::Info);
    }
}

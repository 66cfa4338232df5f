//! Log sink selection.
//!
//! The crate logs through the `log` macros. [`configure`] installs a
//! process-wide dispatcher that writes to stderr until the options name a
//! logger or a log file. An application that set up its own logger first
//! keeps it.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::{Mutex, RwLock};

use crate::errors::Result;
use crate::options::Options;

lazy_static! {
    static ref DISPATCH: Dispatch = Dispatch {
        sink: RwLock::new(Arc::new(Stderr)),
        installed: AtomicBool::new(false),
    };
}

struct Dispatch {
    sink: RwLock<Arc<dyn Log>>,
    installed: AtomicBool,
}

impl Log for Dispatch {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.sink.read().enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        self.sink.read().log(record)
    }

    fn flush(&self) {
        self.sink.read().flush()
    }
}

struct Stderr;

impl Log for Stderr {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        eprintln!("{} [{}] {}: {}", timestamp(), record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Appends records at or above `level` to a file.
struct FileLogger {
    out: Mutex<BufWriter<File>>,
    level: LevelFilter,
}

impl FileLogger {
    fn open(path: &str, level: LevelFilter) -> io::Result<FileLogger> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(FileLogger {
            out: Mutex::new(BufWriter::new(file)),
            level,
        })
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut out = self.out.lock();
        let _ = writeln!(
            out,
            "{} [{}] {}: {}",
            timestamp(),
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = self.out.lock().flush();
    }
}

fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}

/// Routes the crate's records to the logger or file named in `opts`.
///
/// `Options::logger` wins over `Options::log_path`. With neither set the
/// current sink stays, which is stderr unless an earlier run replaced it.
pub(crate) fn configure(opts: &Options) -> Result<()> {
    let sink: Option<Arc<dyn Log>> = match (&opts.logger, opts.log_path.as_str()) {
        (Some(logger), _) => Some(logger.clone()),
        (None, "") => None,
        (None, path) => Some(Arc::new(FileLogger::open(path, opts.log_level)?)),
    };
    let replaced = sink.is_some();
    if let Some(sink) = sink {
        *DISPATCH.sink.write() = sink;
    }

    if !DISPATCH.installed.swap(true, Ordering::AcqRel) {
        if log::set_logger(&*DISPATCH).is_err() {
            // the application owns the global logger
            DISPATCH.installed.store(false, Ordering::Release);
            return Ok(());
        }
    } else if !replaced {
        return Ok(());
    }
    log::set_max_level(opts.log_level);
    Ok(())
}

/// Flushes the active sink.
pub(crate) fn cleanup() {
    log::logger().flush();
}

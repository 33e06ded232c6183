//! The proxy's log sink.
//!
//! Installs a [`log`] backend writing the traditional line format,
//! `<mon> <day> <HH:MM:SS> xvp[<pid>]: <level> <msg>`, to a file or to
//! stdout.  The file can be re-opened at runtime, which is how SIGHUP
//! interacts with log rotation.  Debug records are dropped unless
//! verbose mode was requested.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Mutex, OnceLock};

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};

enum Sink {
    Stdout,
    File { path: String, file: File },
}

pub struct XvpLogger {
    sink: Mutex<Sink>,
    verbose: bool,
}

static LOGGER: OnceLock<&'static XvpLogger> = OnceLock::new();

fn open_sink(path: &str) -> Result<Sink, String> {
    if path == "-" {
        return Ok(Sink::Stdout);
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(|file| Sink::File {
            path: path.to_string(),
            file,
        })
        .map_err(|e| format!("{}: {}", path, e))
}

/// Install the logger.  Called once, before anything logs.
pub fn init(logfile: &str, verbose: bool) -> Result<(), String> {
    let logger: &'static XvpLogger = Box::leak(Box::new(XvpLogger {
        sink: Mutex::new(open_sink(logfile)?),
        verbose,
    }));
    log::set_logger(logger).map_err(|e| e.to_string())?;
    log::set_max_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    let _ = LOGGER.set(logger);
    Ok(())
}

/// Close and re-open the log file (no-op for stdout).
pub fn reopen() {
    let Some(logger) = LOGGER.get() else {
        return;
    };
    log::info!("Closing log file on signal");
    let mut sink = match logger.sink.lock() {
        Ok(sink) => sink,
        Err(_) => return,
    };
    if let Sink::File { path, file } = &mut *sink {
        if let Ok(fresh) = OpenOptions::new().create(true).append(true).open(&*path) {
            *file = fresh;
        }
    }
    drop(sink);
    log::info!("Re-opening log file on signal");
}

impl Log for XvpLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= if self.verbose {
            Level::Debug
        } else {
            Level::Info
        }
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(
            &Local::now().format("%b %e %T").to_string(),
            std::process::id(),
            record.level(),
            &record.args().to_string(),
        );
        if let Ok(mut sink) = self.sink.lock() {
            match &mut *sink {
                Sink::Stdout => {
                    let _ = std::io::stdout().write_all(line.as_bytes());
                }
                Sink::File { file, .. } => {
                    let _ = file.write_all(line.as_bytes());
                }
            }
        }
    }

    fn flush(&self) {}
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "Error:",
        Level::Warn => "Warn: ",
        Level::Info => "Info: ",
        Level::Debug | Level::Trace => "Debug:",
    }
}

fn format_line(timestamp: &str, pid: u32, level: Level, message: &str) -> String {
    format!("{} xvp[{}]: {} {}\n", timestamp, pid, level_tag(level), message)
}

//! Routes log records to per-level destinations.
//!
//! Each level writes to one of the literals `stdout`, `stderr`, `null`
//! (discard) or to a filesystem path (opened append/create, mode 0644).
//! Records with `target: "event"` go to the dedicated event sink, which is
//! how availability transitions reach their own log.

use config::Config;
use log::{self, LogLevel, LogLevelFilter, LogMetadata, LogRecord, SetLoggerError};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub const LOG_STDOUT: &'static str = "stdout";
pub const LOG_STDERR: &'static str = "stderr";
pub const LOG_NULL: &'static str = "null";

enum Sink {
    Stdout,
    Stderr,
    Null,
    File(Mutex<::std::fs::File>),
}

impl Sink {
    fn open(location: &str) -> io::Result<Sink> {
        match location {
            LOG_STDOUT => Ok(Sink::Stdout),
            LOG_STDERR => Ok(Sink::Stderr),
            LOG_NULL => Ok(Sink::Null),
            path => {
                let f = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .mode(0o644)
                    .open(path)?;
                Ok(Sink::File(Mutex::new(f)))
            }
        }
    }

    fn write_line(&self, line: &str) {
        match *self {
            Sink::Null => {}
            Sink::Stdout => {
                let out = io::stdout();
                let _ = writeln!(out.lock(), "{}", line);
            }
            Sink::Stderr => {
                let err = io::stderr();
                let _ = writeln!(err.lock(), "{}", line);
            }
            Sink::File(ref f) => {
                if let Ok(mut f) = f.lock() {
                    let _ = writeln!(f, "{}", line);
                }
            }
        }
    }
}

pub const EVENT_TARGET: &'static str = "event";

struct LevelLogger {
    error: Sink,
    warn: Sink,
    info: Sink,
    debug: Sink,
    event: Sink,
}

impl log::Log for LevelLogger {
    fn enabled(&self, metadata: &LogMetadata) -> bool {
        metadata.level() <= LogLevel::Debug
    }

    fn log(&self, record: &LogRecord) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("{} {} {}: {}",
                           timestamp(),
                           record.level(),
                           record.target(),
                           record.args());
        if record.target() == EVENT_TARGET {
            self.event.write_line(&line);
            return;
        }
        match record.level() {
            LogLevel::Error => self.error.write_line(&line),
            LogLevel::Warn => self.warn.write_line(&line),
            LogLevel::Info => self.info.write_line(&line),
            LogLevel::Debug | LogLevel::Trace => self.debug.write_line(&line),
        }
    }
}

fn timestamp() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => format!("{}.{:03}", d.as_secs(), d.subsec_nanos() / 1_000_000),
        Err(_) => "0.000".into(),
    }
}

/// Opens the configured destinations and installs the router as the
/// process logger. Failure to open any destination is a startup error.
pub fn init(config: &Config) -> io::Result<()> {
    let logger = LevelLogger {
        error: Sink::open(config.log_location_error.as_ref().map(|s| s.as_str())
                              .unwrap_or(LOG_STDERR))?,
        warn: Sink::open(config.log_location_warning.as_ref().map(|s| s.as_str())
                             .unwrap_or(LOG_STDERR))?,
        info: Sink::open(config.log_location_info.as_ref().map(|s| s.as_str())
                             .unwrap_or(LOG_STDOUT))?,
        debug: Sink::open(config.log_location_debug.as_ref().map(|s| s.as_str())
                              .unwrap_or(LOG_NULL))?,
        event: Sink::open(config.log_location_event.as_ref().map(|s| s.as_str())
                              .unwrap_or(LOG_STDOUT))?,
    };
    log::set_logger(move |max| {
            max.set(LogLevelFilter::Debug);
            Box::new(logger)
        })
        .map_err(|e: SetLoggerError| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

#[test]
fn sink_literals_open() {
    assert!(Sink::open("stdout").is_ok());
    assert!(Sink::open("stderr").is_ok());
    assert!(Sink::open("null").is_ok());
}

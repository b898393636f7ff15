//! Watches the ops configuration file.

use futures::sync::mpsc;
use notify::{self, RawEvent, RecursiveMode, Watcher, raw_watcher};
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::thread;

fn read_file(path: &PathBuf) -> io::Result<Vec<u8>> {
    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    Ok(contents)
}

fn watch_error(e: notify::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("file watch: {}", e))
}

/// Reads `path` once, then republishes its contents on every write.
///
/// The initial read is authoritative configuration: failure is an error
/// for the caller to treat as fatal. Later read failures are logged and
/// the previously published contents stand. Watching happens on its own
/// thread; contents arrive on the returned channel.
pub fn start(path: &str) -> io::Result<(Vec<u8>, mpsc::UnboundedReceiver<Vec<u8>>)> {
    let path = PathBuf::from(path);
    let initial = read_file(&path)?;

    let (event_tx, event_rx) = std_mpsc::channel();
    let mut watcher = raw_watcher(event_tx).map_err(watch_error)?;
    watcher.watch(&path, RecursiveMode::NonRecursive).map_err(watch_error)?;

    let (tx, rx) = mpsc::unbounded();
    thread::Builder::new()
        .name("file-watcher".into())
        .spawn(move || {
            // the watcher lives and dies with this thread.
            let _watcher = watcher;
            for event in event_rx {
                match event {
                    RawEvent { op: Ok(op), .. } => {
                        if !op.contains(notify::op::WRITE) {
                            continue;
                        }
                        match read_file(&path) {
                            Ok(contents) => {
                                if tx.unbounded_send(contents).is_err() {
                                    debug!("config file consumer is gone; stopping watch");
                                    return;
                                }
                            }
                            Err(e) => error!("rereading {}: {}", path.display(), e),
                        }
                    }
                    RawEvent { op: Err(e), .. } => {
                        error!("watching {}: {}", path.display(), e)
                    }
                }
            }
        })?;

    Ok((initial, rx))
}

#[cfg(test)]
mod tests {
    use super::start;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn missing_file_is_an_error() {
        assert!(start("/nonexistent/edgemon-ops.cfg").is_err());
    }

    #[test]
    fn initial_contents_are_returned() {
        let dir = ::std::env::temp_dir().join("edgemon-file-poller-test");
        ::std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ops.cfg");
        File::create(&path)
            .unwrap()
            .write_all(b"{\"cdnName\": \"test\"}")
            .unwrap();
        let (initial, _rx) = start(path.to_str().unwrap()).unwrap();
        assert_eq!(initial, b"{\"cdnName\": \"test\"}".to_vec());
    }
}

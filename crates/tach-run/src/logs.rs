//! Per-task log pipeline
//!
//! Every task owns a log file under its package's `.tach/` directory and
//! a prefixed view onto the shared terminal sink. Terminal writes are
//! line-atomic: concurrent tasks interleave by whole lines, each
//! carrying its `package:task: ` prefix, so a consumer can demultiplex
//! the stream. The log file always receives the raw lines regardless of
//! output mode; the mode only governs what reaches the terminal.

use std::io::Write;
use std::sync::{Arc, Mutex};

use tach_graph::OutputMode;
use tach_path::AbsoluteSystemPathBuf;

use crate::RunError;

/// Shared, line-locked terminal output.
pub type TerminalSink = Arc<Mutex<Box<dyn Write + Send>>>;

pub fn stdout_sink() -> TerminalSink {
    Arc::new(Mutex::new(Box::new(std::io::stdout())))
}

/// Wrap any writer; used by tests to capture output.
pub fn sink_to_writer(writer: Box<dyn Write + Send>) -> TerminalSink {
    Arc::new(Mutex::new(writer))
}

pub struct TaskLogger {
    prefix: String,
    mode: OutputMode,
    sink: TerminalSink,
    file: std::fs::File,
    /// Held back until failure in errors-only mode.
    buffer: Vec<String>,
}

impl TaskLogger {
    pub fn new(
        prefix: String,
        mode: OutputMode,
        sink: TerminalSink,
        log_path: &AbsoluteSystemPathBuf,
    ) -> Result<Self, RunError> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent.as_std_path()).map_err(|source| RunError::Io {
                path: parent.clone(),
                source,
            })?;
        }
        let file = std::fs::File::create(log_path.as_std_path()).map_err(|source| {
            RunError::Io {
                path: log_path.clone(),
                source,
            }
        })?;
        Ok(Self {
            prefix,
            mode,
            sink,
            file,
            buffer: Vec::new(),
        })
    }

    fn emit(&self, line: &str) {
        let mut sink = self.sink.lock().expect("terminal sink poisoned");
        let _ = writeln!(sink, "{}{}", self.prefix, line);
    }

    /// One line of child output.
    pub fn line(&mut self, line: &str) {
        let _ = writeln!(self.file, "{line}");
        match self.mode {
            OutputMode::Full => self.emit(line),
            OutputMode::ErrorsOnly => self.buffer.push(line.to_string()),
            OutputMode::HashOnly | OutputMode::None => {}
        }
    }

    /// Cache status line (`cache miss, executing <hash>` and friends).
    /// Shown in full and hash-only modes; errors-only stays quiet until
    /// failure and none stays quiet always.
    pub fn banner(&self, message: &str) {
        match self.mode {
            OutputMode::Full | OutputMode::HashOnly => self.emit(message),
            OutputMode::ErrorsOnly | OutputMode::None => {}
        }
    }

    /// The task failed: flush anything errors-only mode was holding
    /// back.
    pub fn flush_failure(&mut self) {
        if self.mode == OutputMode::ErrorsOnly {
            for line in std::mem::take(&mut self.buffer) {
                self.emit(&line);
            }
        }
    }

    /// Replay a cached log file to the terminal. Only full mode replays
    /// the body; a hit can never be a failure, so errors-only shows
    /// nothing.
    pub fn replay(&self, contents: &str) {
        if self.mode != OutputMode::Full {
            return;
        }
        for line in contents.lines() {
            self.emit(line);
        }
    }

    pub fn flush(&mut self) {
        let _ = self.file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture() -> (TerminalSink, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = sink_to_writer(Box::new(SharedBuf(buf.clone())));
        (sink, buf)
    }

    fn rendered(buf: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8(buf.lock().unwrap().clone()).unwrap()
    }

    fn logger(mode: OutputMode, sink: TerminalSink, dir: &tempfile::TempDir) -> TaskLogger {
        let log_path = AbsoluteSystemPathBuf::from_std(dir.path().join("task.log")).unwrap();
        TaskLogger::new("app:build: ".to_string(), mode, sink, &log_path).unwrap()
    }

    #[test]
    fn test_full_mode_streams_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, buf) = capture();
        let mut log = logger(OutputMode::Full, sink, &dir);

        log.line("compiling");
        log.flush();

        assert_eq!(rendered(&buf), "app:build: compiling\n");
        let on_disk = std::fs::read_to_string(dir.path().join("task.log")).unwrap();
        assert_eq!(on_disk, "compiling\n");
    }

    #[test]
    fn test_hash_only_shows_banner_not_body() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, buf) = capture();
        let mut log = logger(OutputMode::HashOnly, sink, &dir);

        log.banner("cache miss, executing 0123456789abcdef");
        log.line("compiling");
        log.flush();

        let out = rendered(&buf);
        assert!(out.contains("cache miss, executing"));
        assert!(!out.contains("compiling"));
        // The body still lands in the log file.
        let on_disk = std::fs::read_to_string(dir.path().join("task.log")).unwrap();
        assert!(on_disk.contains("compiling"));
    }

    #[test]
    fn test_errors_only_buffers_until_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, buf) = capture();
        let mut log = logger(OutputMode::ErrorsOnly, sink, &dir);

        log.banner("cache miss, executing 0123456789abcdef");
        log.line("error: something broke");
        assert_eq!(rendered(&buf), "");

        log.flush_failure();
        assert!(rendered(&buf).contains("error: something broke"));
    }

    #[test]
    fn test_none_mode_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, buf) = capture();
        let mut log = logger(OutputMode::None, sink, &dir);

        log.banner("cache miss, executing 0123456789abcdef");
        log.line("noise");
        log.flush_failure();

        assert_eq!(rendered(&buf), "");
    }

    #[test]
    fn test_replay_only_in_full_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, buf) = capture();
        let log = logger(OutputMode::Full, sink, &dir);
        log.replay("line one\nline two\n");
        assert_eq!(rendered(&buf), "app:build: line one\napp:build: line two\n");

        let dir2 = tempfile::tempdir().unwrap();
        let (sink2, buf2) = capture();
        let log2 = logger(OutputMode::HashOnly, sink2, &dir2);
        log2.replay("line one\n");
        assert_eq!(rendered(&buf2), "");
    }
}

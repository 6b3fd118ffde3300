//! Raw line mirror of one full refresh, written on request.
//!
//! `Idle` → `Requested` (operator) → `InProgress` (first `H:`) → `Idle` (completed `L:`).
//! While not idle every raw line is appended to the sink before it is decoded.

use chrono::{DateTime, Local};
use log::{info, warn};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Idle,
    Requested,
    InProgress,
}

pub trait BackupSink: Send {
    fn append(&mut self, line: &str) -> io::Result<()>;
    fn finish(&mut self) -> io::Result<()>;
    /// Shown in logs.
    fn describe(&self) -> String;
}

pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    /// Creates `{dir}/cube-backup-yyyyMMdd-HHmm.txt`, truncating a backup from the same minute.
    pub fn create(dir: &Path, now: DateTime<Local>) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("cube-backup-{}.txt", now.format("%Y%m%d-%H%M")));
        let file = File::create(&path)?;
        Ok(FileSink {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BackupSink for FileSink {
    fn append(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

pub struct BackupRecorder {
    state: BackupState,
    sink: Option<Box<dyn BackupSink>>,
}

impl Default for BackupRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupRecorder {
    pub fn new() -> Self {
        BackupRecorder {
            state: BackupState::Idle,
            sink: None,
        }
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    /// Starts a new backup into `sink`, abandoning one that has not completed.
    pub fn request(&mut self, sink: Box<dyn BackupSink>) {
        if let Some(old) = self.sink.as_ref() {
            warn!("Backup {} abandoned before it completed", old.describe());
        }
        info!("Backup requested: {}", sink.describe());
        self.sink = Some(sink);
        self.state = BackupState::Requested;
    }

    pub fn record_line(&mut self, line: &str) {
        if self.state == BackupState::Idle {
            return;
        }
        if let Some(sink) = self.sink.as_mut()
            && let Err(e) = sink.append(line)
        {
            warn!("Backup {} failed: {}", sink.describe(), e);
            self.abandon();
        }
    }

    /// Advances the state machine once a message of type `tag` was decoded.
    pub fn observe_message(&mut self, tag: char) {
        match (self.state, tag) {
            (BackupState::Requested, 'H') => self.state = BackupState::InProgress,
            (BackupState::InProgress, 'L') => {
                if let Some(mut sink) = self.sink.take() {
                    match sink.finish() {
                        Ok(()) => info!("Backup written to {}", sink.describe()),
                        Err(e) => warn!("Backup {} could not be completed: {}", sink.describe(), e),
                    }
                }
                self.state = BackupState::Idle;
            }
            _ => {}
        }
    }

    fn abandon(&mut self) {
        self.sink = None;
        self.state = BackupState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct MemorySink(Arc<Mutex<Vec<String>>>);

    impl BackupSink for MemorySink {
        fn append(&mut self, line: &str) -> io::Result<()> {
            self.0.lock().push(line.to_string());
            Ok(())
        }
        fn finish(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    struct BrokenSink;

    impl BackupSink for BrokenSink {
        fn append(&mut self, _line: &str) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
        fn finish(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn describe(&self) -> String {
            "broken".to_string()
        }
    }

    fn feed(recorder: &mut BackupRecorder, line: &str) {
        recorder.record_line(line);
        recorder.observe_message(line.chars().next().unwrap_or(' '));
    }

    #[test]
    fn mirrors_one_refresh_cycle() {
        let mut recorder = BackupRecorder::new();
        let sink = MemorySink::default();
        feed(&mut recorder, "L:before");
        recorder.request(Box::new(sink.clone()));
        assert_eq!(recorder.state(), BackupState::Requested);

        feed(&mut recorder, "H:hello");
        assert_eq!(recorder.state(), BackupState::InProgress);
        feed(&mut recorder, "M:rooms");
        feed(&mut recorder, "C:config");
        feed(&mut recorder, "L:devices");
        assert_eq!(recorder.state(), BackupState::Idle);
        feed(&mut recorder, "L:after");

        assert_eq!(*sink.0.lock(), vec!["H:hello", "M:rooms", "C:config", "L:devices"]);
    }

    #[test]
    fn device_list_before_hello_does_not_complete() {
        let mut recorder = BackupRecorder::new();
        recorder.request(Box::new(MemorySink::default()));
        feed(&mut recorder, "L:devices");
        assert_eq!(recorder.state(), BackupState::Requested);
    }

    #[test]
    fn sink_error_abandons_backup() {
        let mut recorder = BackupRecorder::new();
        recorder.request(Box::new(BrokenSink));
        feed(&mut recorder, "H:hello");
        assert_eq!(recorder.state(), BackupState::Idle);
    }

    #[test]
    fn file_sink_writes_timestamped_file() {
        let dir = std::env::temp_dir().join(format!("cube-backup-test-{}", std::process::id()));
        let now = Local::now();
        let mut sink = FileSink::create(&dir, now).unwrap();
        sink.append("H:hello").unwrap();
        sink.finish().unwrap();
        let expected = dir.join(format!("cube-backup-{}.txt", now.format("%Y%m%d-%H%M")));
        assert_eq!(sink.path(), expected.as_path());
        assert_eq!(fs::read_to_string(&expected).unwrap(), "H:hello\n");
        let _ = fs::remove_dir_all(&dir);
    }
}

//! Append-only event log and push fan-out.
//!
//! The sink owns its own locks, separate from the frame store, and never
//! returns an error to callers: a broken log file is reported and skipped.
//! File appends happen on a dedicated writer thread so request handlers never
//! wait on disk.

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    data::{LOG_HISTORY_CAPACITY, LogEntry, PushEvent},
    pipeline::telemetry,
};

/// Lines queued for the writer thread before new ones are dropped.
const LOG_BACKLOG: usize = 1024;

pub type EventReceiver = broadcast::Receiver<Arc<PushEvent>>;

pub struct NotificationSink {
    log_writer: Option<LogWriter>,
    log_path: Option<PathBuf>,
    history: Mutex<VecDeque<LogEntry>>,
    events: broadcast::Sender<Arc<PushEvent>>,
}

impl NotificationSink {
    /// `subscriber_buffer` bounds how many events a slow subscriber may lag
    /// behind before its oldest pending events are dropped.
    pub fn new(log_path: Option<&Path>, subscriber_buffer: usize) -> Result<Self> {
        let log_writer = match log_path {
            Some(path) => Some(LogWriter::spawn(open_append(path)?)?),
            None => None,
        };
        let (events, _) = broadcast::channel(subscriber_buffer.max(1));
        Ok(Self {
            log_writer,
            log_path: log_path.map(Path::to_path_buf),
            history: Mutex::new(VecDeque::with_capacity(LOG_HISTORY_CAPACITY)),
            events,
        })
    }

    /// Sink without a backing file.
    pub fn in_memory(subscriber_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(subscriber_buffer.max(1));
        Self {
            log_writer: None,
            log_path: None,
            history: Mutex::new(VecDeque::with_capacity(LOG_HISTORY_CAPACITY)),
            events,
        }
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Append a timestamped line and push it to subscribers.
    pub fn log(&self, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            message: message.into(),
        };
        let line = entry.line();

        if let Some(writer) = &self.log_writer {
            writer.append(line.clone());
        }

        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_back(entry.clone());
            if history.len() > LOG_HISTORY_CAPACITY {
                history.pop_front();
            }
        }

        self.publish(PushEvent::NewLog { log: line });
        entry
    }

    /// Fan an event out to every connected subscriber. Returns how many
    /// subscribers were connected.
    pub fn publish(&self, event: PushEvent) -> usize {
        let name = event.name();
        metrics::counter!("vision_push_events_total", "event" => name).increment(1);
        match self.events.send(Arc::new(event)) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(event = name, "no push subscribers connected");
                0
            }
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Most recent log entries, oldest first.
    pub fn recent_logs(&self) -> Vec<LogEntry> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Background appender. Dropping it drains the queue and joins the thread.
struct LogWriter {
    tx: Option<Sender<String>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LogWriter {
    fn spawn(file: File) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<String>(LOG_BACKLOG);
        let handle = telemetry::spawn_thread("event-log-writer", move || write_lines(file, rx))
            .context("failed to spawn event log writer")?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    fn append(&self, line: String) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::counter!("vision_notification_errors_total", "kind" => "log_backlog")
                    .increment(1);
                warn!("event log writer is behind; dropping line");
            }
            Err(TrySendError::Disconnected(_)) => {
                metrics::counter!("vision_notification_errors_total", "kind" => "log_file")
                    .increment(1);
                warn!("event log writer has stopped; dropping line");
            }
        }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("event log writer panicked");
            }
        }
    }
}

fn write_lines(file: File, rx: Receiver<String>) {
    let mut out = BufWriter::new(file);
    for line in rx.iter() {
        if let Err(err) = writeln!(out, "{line}") {
            metrics::counter!("vision_notification_errors_total", "kind" => "log_file")
                .increment(1);
            warn!("failed to append to event log: {err}");
            continue;
        }
        if !rx.is_empty() {
            continue;
        }
        if let Err(err) = out.flush() {
            metrics::counter!("vision_notification_errors_total", "kind" => "log_file")
                .increment(1);
            warn!("failed to flush event log: {err}");
        }
    }
    if let Err(err) = out.flush() {
        warn!("failed to flush event log: {err}");
    }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open event log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;

    #[test]
    fn log_lines_are_appended_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("log.txt");
        let sink = NotificationSink::new(Some(&path), 4).unwrap();
        sink.log("first");
        sink.log("second");
        drop(sink);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] first"));
        assert!(lines[1].ends_with("] second"));
    }

    #[test]
    fn reopening_keeps_existing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        NotificationSink::new(Some(&path), 4).unwrap().log("one");
        NotificationSink::new(Some(&path), 4).unwrap().log("two");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn file_appends_run_off_the_calling_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let sink = NotificationSink::new(Some(&path), 4).unwrap();
        let caller = thread::current().id();

        let writer = sink.log_writer.as_ref().unwrap();
        let handle = writer.handle.as_ref().unwrap();
        assert_ne!(handle.thread().id(), caller);
        assert_eq!(handle.thread().name(), Some("event-log-writer"));

        for n in 0..50 {
            sink.log(format!("line {n}"));
        }
        assert_eq!(sink.recent_logs().len(), 50);
        drop(sink);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 50);
        assert!(lines[49].ends_with("] line 49"));
    }

    #[test]
    fn log_lines_reach_subscribers() {
        let sink = NotificationSink::in_memory(4);
        let mut rx = sink.subscribe();
        let entry = sink.log("hello");
        let event = rx.try_recv().unwrap();
        match event.as_ref() {
            PushEvent::NewLog { log } => assert_eq!(log, &entry.line()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn slow_subscriber_drops_oldest_events() {
        let sink = NotificationSink::in_memory(2);
        let mut slow = sink.subscribe();
        for n in 0..5 {
            sink.log(format!("line {n}"));
        }
        assert!(matches!(slow.try_recv(), Err(TryRecvError::Lagged(3))));
        match slow.try_recv().unwrap().as_ref() {
            PushEvent::NewLog { log } => assert!(log.ends_with("line 3")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn history_is_bounded() {
        let sink = NotificationSink::in_memory(1);
        for n in 0..(LOG_HISTORY_CAPACITY + 5) {
            sink.log(format!("{n}"));
        }
        let logs = sink.recent_logs();
        assert_eq!(logs.len(), LOG_HISTORY_CAPACITY);
        assert_eq!(logs[0].message, "5");
    }
}

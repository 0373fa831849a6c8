//! Append-only audit log for conversation events.
//!
//! `record()` never blocks on storage and never fails: it enqueues the record
//! for a single background writer, which appends one JSON line per record in
//! enqueue order. Write failures are reported through the process logger and
//! otherwise ignored.

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, warn};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};

use colloquy_protocol::{AuditEventType, AuditRecord};

enum WriterCommand {
    Record(AuditRecord),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Handle to the audit log. Cheap to clone; all clones share one writer.
#[derive(Clone)]
pub struct AuditLogger {
    tx: Option<mpsc::UnboundedSender<WriterCommand>>,
    path: Option<PathBuf>,
}

impl AuditLogger {
    /// Open a new log file under `dir` and start the writer task.
    ///
    /// The file is named `<prefix>-<UTC timestamp>-<pid>.jsonl` so every
    /// process lifetime gets its own file.
    pub async fn open(dir: &Path, prefix: &str) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating audit log directory {}", dir.display()))?;

        let file_name = format!(
            "{}-{}-{}.jsonl",
            prefix,
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            std::process::id()
        );
        Self::open_file(dir.join(file_name)).await
    }

    /// Open (or append to) an explicit file path.
    pub async fn open_file(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating audit log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening audit log file {}", path.display()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(BufWriter::new(file), path.clone(), rx));
        debug!("audit log opened at {}", path.display());

        let logger = Self {
            tx: Some(tx),
            path: Some(path),
        };
        logger.record(
            None,
            AuditEventType::AdapterStart,
            None,
            serde_json::json!({ "pid": std::process::id() }),
            None,
        );
        Ok(logger)
    }

    /// A logger that accepts and discards every record.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Enqueue one record.
    pub fn record(
        &self,
        session_id: Option<&str>,
        event_type: AuditEventType,
        message_type: Option<&str>,
        data: Value,
        metadata: Option<Value>,
    ) {
        self.write(AuditRecord::new(
            session_id.map(str::to_string),
            event_type,
            message_type.map(str::to_string),
            data,
            metadata,
        ));
    }

    /// Enqueue a prebuilt record.
    pub fn write(&self, record: AuditRecord) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(WriterCommand::Record(record)).is_err() {
            debug!("audit writer closed; dropping record");
        }
    }

    /// Wait until every record enqueued so far has been written and flushed.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(WriterCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Write a close marker, drain, flush, and stop the writer.
    ///
    /// Records enqueued after `close()` are dropped.
    pub async fn close(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        self.record(None, AuditEventType::AdapterClose, None, Value::Null, None);
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(WriterCommand::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_writer(
    mut file: BufWriter<File>,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    let mut dirty = false;

    while let Some(cmd) = rx.recv().await {
        let mut next = Some(cmd);
        // Drain whatever is already queued before paying for a flush.
        while let Some(cmd) = next.take() {
            match cmd {
                WriterCommand::Record(record) => {
                    write_line(&mut file, &path, &record).await;
                    dirty = true;
                }
                WriterCommand::Flush(done) => {
                    flush(&mut file, &path, &mut dirty).await;
                    let _ = done.send(());
                }
                WriterCommand::Close(done) => {
                    flush(&mut file, &path, &mut dirty).await;
                    let _ = done.send(());
                    return;
                }
            }
            next = rx.try_recv().ok();
        }
        flush(&mut file, &path, &mut dirty).await;
    }

    // All handles dropped without close().
    flush(&mut file, &path, &mut dirty).await;
}

async fn write_line(file: &mut BufWriter<File>, path: &Path, record: &AuditRecord) {
    let mut line = match serde_json::to_string(record) {
        Ok(line) => line,
        Err(err) => {
            warn!("failed to serialize audit record: {err}");
            return;
        }
    };
    line.push('\n');
    if let Err(err) = file.write_all(line.as_bytes()).await {
        warn!("failed to write audit log {}: {err}", path.display());
    }
}

async fn flush(file: &mut BufWriter<File>, path: &Path, dirty: &mut bool) {
    if !*dirty {
        return;
    }
    *dirty = false;
    if let Err(err) = file.flush().await {
        warn!("failed to flush audit log {}: {err}", path.display());
    }
}

/// Read an audit file back into records, skipping lines that do not parse.
pub fn read_records(path: &Path) -> Result<Vec<AuditRecord>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading audit log {}", path.display()))?;
    Ok(contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One access log line. Field names on the wire match the JSON-lines
/// format consumers of `gateway.log` already parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    /// Unix seconds.
    #[serde(rename = "time")]
    pub timestamp: i64,
    /// API key exactly as presented; empty when the header was absent.
    pub key: String,
    pub path: String,
    /// Reserved for token accounting; always 0.
    #[serde(rename = "prompt")]
    pub prompt_tokens: u64,
    /// Body bytes written to the client.
    #[serde(rename = "resp")]
    pub response_bytes: u64,
    pub status: u16,
}

impl AccessRecord {
    pub fn new(key: impl Into<String>, path: impl Into<String>, response_bytes: u64, status: u16) -> Self {
        Self {
            timestamp: Utc::now().timestamp(),
            key: key.into(),
            path: path.into(),
            prompt_tokens: 0,
            response_bytes,
            status,
        }
    }

    /// Record for a request refused at the key check.
    pub fn rejected(key: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(key, path, 0, 403)
    }
}

/// Append-only JSON-lines access log.
///
/// A single writer task owns the file; request tasks hand records over a
/// bounded channel with `try_send`, so recording never waits on disk I/O
/// and lines are never interleaved. When the queue is full or the writer
/// is gone the record is dropped with a warning.
///
/// Queued records reach the file only while the runtime is alive; call
/// [`AccessLogger::shutdown`] before dropping it.
#[derive(Clone)]
pub struct AccessLogger {
    sender: Option<mpsc::Sender<AccessRecord>>,
    writer: Option<Arc<Mutex<Option<JoinHandle<()>>>>>,
}

impl AccessLogger {
    /// Open (or create) the log file in append mode and start the writer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(path: &Path, capacity: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(write_loop(File::from_std(file), rx));

        info!(path = %path.display(), "Access log opened");
        Ok(Self {
            sender: Some(tx),
            writer: Some(Arc::new(Mutex::new(Some(writer)))),
        })
    }

    /// No-op logger.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            writer: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Queue a record for the writer. Never blocks, never fails.
    #[inline]
    pub fn record(&self, record: AccessRecord) {
        debug!(
            target: "access_log",
            path = %record.path,
            status = record.status,
            bytes = record.response_bytes,
            key_present = !record.key.is_empty(),
            "access"
        );

        let Some(ref sender) = self.sender else {
            return;
        };
        match sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!(path = %dropped.path, status = dropped.status, "Access log queue full, record dropped");
            }
            Err(TrySendError::Closed(dropped)) => {
                warn!(path = %dropped.path, status = dropped.status, "Access log writer gone, record dropped");
            }
        }
    }

    /// Drop this handle and wait for the writer to persist everything queued.
    ///
    /// The writer stops once every clone is gone, so callers must release
    /// the other clones first (or bound the wait with a timeout). Only the
    /// first call across clones waits; later ones return at once.
    pub async fn shutdown(self) {
        let Self { sender, writer } = self;
        drop(sender);

        let Some(handle) = writer.and_then(|writer| writer.lock().ok().and_then(|mut handle| handle.take())) else {
            return;
        };
        match handle.await {
            Ok(()) => info!("Access log flushed"),
            Err(e) => error!(error = %e, "Access log writer failed"),
        }
    }
}

async fn write_loop(mut file: File, mut rx: mpsc::Receiver<AccessRecord>) {
    let mut buf = Vec::with_capacity(4096);

    while let Some(first) = rx.recv().await {
        buf.clear();
        encode_line(&mut buf, &first);
        // Drain whatever else is already queued into the same write.
        while let Ok(next) = rx.try_recv() {
            encode_line(&mut buf, &next);
        }
        if buf.is_empty() {
            continue;
        }

        if let Err(e) = file.write_all(&buf).await {
            error!(error = %e, "Failed to append access log");
            continue;
        }
        if let Err(e) = file.flush().await {
            error!(error = %e, "Failed to flush access log");
        }
    }

    debug!("Access log writer stopped");
}

fn encode_line(buf: &mut Vec<u8>, record: &AccessRecord) {
    let start = buf.len();
    match serde_json::to_writer(&mut *buf, record) {
        Ok(()) => buf.push(b'\n'),
        Err(e) => {
            buf.truncate(start);
            error!(error = %e, "Failed to encode access record");
        }
    }
}

//! Batched database writer for worker handlers
//!
//! Handlers hand statements to a dedicated OS thread and await a completion
//! future. The thread coalesces everything it receives into one transaction
//! per flush, executing identical statements back to back through the
//! statement cache. A flush happens when the oldest pending item reaches the
//! maximum age or when nothing new has arrived for the idle period.
//!
//! The connection is opened on the first flush and closed again as soon as
//! the queue drains, so an idle worker holds no database connection.

use crate::storage::configure_connection;
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Batched writer failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriterError {
    #[error("integrity conflict persisted after retry: {0}")]
    Integrity(String),

    #[error("database error: {0}")]
    Sqlite(String),

    #[error("writer thread has stopped")]
    Closed,
}

/// One statement with its bound values
#[derive(Debug, Clone)]
pub struct WriteItem {
    pub sql: &'static str,
    pub params: Vec<Value>,
}

impl WriteItem {
    pub fn new(sql: &'static str, params: Vec<Value>) -> Self {
        Self { sql, params }
    }
}

enum Command {
    Write {
        items: Vec<WriteItem>,
        done: oneshot::Sender<Result<(), WriterError>>,
    },
    Shutdown,
}

struct Pending {
    items: Vec<WriteItem>,
    done: oneshot::Sender<Result<(), WriterError>>,
}

/// Handle to the writer thread
pub struct BatchWriter {
    sender: mpsc::Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl BatchWriter {
    /// Start a writer for the database at `path`
    pub fn spawn(path: &Path, max_age: Duration, idle: Duration) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let path = path.to_path_buf();

        let thread = std::thread::Builder::new()
            .name("critic-writer".to_string())
            .spawn(move || writer_loop(path, receiver, max_age, idle))?;

        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    /// Queue statements and wait until their transaction commits
    pub async fn write(&self, items: Vec<WriteItem>) -> Result<(), WriterError> {
        if items.is_empty() {
            return Ok(());
        }
        let (done, committed) = oneshot::channel();
        self.sender
            .send(Command::Write { items, done })
            .map_err(|_| WriterError::Closed)?;
        committed.await.map_err(|_| WriterError::Closed)?
    }

    /// Flush what is queued and stop the thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Writer thread panicked");
            }
        }
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn writer_loop(
    path: PathBuf,
    receiver: mpsc::Receiver<Command>,
    max_age: Duration,
    idle: Duration,
) {
    let mut pending: Vec<Pending> = Vec::new();
    let mut oldest = Instant::now();
    let mut newest = Instant::now();
    let mut conn: Option<Connection> = None;

    loop {
        let command = if pending.is_empty() {
            // Nothing queued: release the connection while idle
            conn = None;
            match receiver.recv() {
                Ok(command) => Some(command),
                Err(_) => return,
            }
        } else {
            let deadline = (oldest + max_age).min(newest + idle);
            match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(command) => Some(command),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    flush(&path, &mut conn, std::mem::take(&mut pending));
                    return;
                }
            }
        };

        match command {
            Some(Command::Write { items, done }) => {
                let now = Instant::now();
                if pending.is_empty() {
                    oldest = now;
                }
                newest = now;
                pending.push(Pending { items, done });
            }
            Some(Command::Shutdown) => {
                flush(&path, &mut conn, std::mem::take(&mut pending));
                return;
            }
            None => flush(&path, &mut conn, std::mem::take(&mut pending)),
        }
    }
}

fn flush(path: &Path, conn: &mut Option<Connection>, pending: Vec<Pending>) {
    if pending.is_empty() {
        return;
    }

    let result = open(path, conn).and_then(|conn| commit_with_retry(conn, &pending));
    debug!(
        batches = pending.len(),
        ok = result.is_ok(),
        "Flushed writer queue"
    );
    for item in pending {
        let _ = item.done.send(result.clone());
    }
}

fn open<'a>(path: &Path, conn: &'a mut Option<Connection>) -> Result<&'a mut Connection, WriterError> {
    if conn.is_none() {
        let opened = Connection::open(path).map_err(|e| WriterError::Sqlite(e.to_string()))?;
        configure_connection(&opened).map_err(|e| WriterError::Sqlite(e.to_string()))?;
        *conn = Some(opened);
    }
    conn.as_mut().ok_or(WriterError::Closed)
}

fn commit_with_retry(conn: &mut Connection, pending: &[Pending]) -> Result<(), WriterError> {
    match commit(conn, pending) {
        Ok(()) => Ok(()),
        Err(e) if is_integrity_error(&e) => {
            warn!(error = %e, "Integrity conflict in writer batch, retrying");
            commit(conn, pending).map_err(|e| {
                if is_integrity_error(&e) {
                    WriterError::Integrity(e.to_string())
                } else {
                    WriterError::Sqlite(e.to_string())
                }
            })
        }
        Err(e) => Err(WriterError::Sqlite(e.to_string())),
    }
}

fn is_integrity_error(error: &rusqlite::Error) -> bool {
    error.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

/// Execute every queued item in one transaction, grouped by statement in
/// order of first appearance
fn commit(conn: &mut Connection, pending: &[Pending]) -> rusqlite::Result<()> {
    let mut order: Vec<&'static str> = Vec::new();
    for item in pending.iter().flat_map(|p| &p.items) {
        if !order.contains(&item.sql) {
            order.push(item.sql);
        }
    }

    // Dropping the transaction on error rolls it back
    let tx = conn.transaction()?;
    for sql in order {
        let mut stmt = tx.prepare_cached(sql)?;
        for item in pending.iter().flat_map(|p| &p.items).filter(|i| i.sql == sql) {
            stmt.execute(rusqlite::params_from_iter(item.params.iter()))?;
        }
    }
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    const INSERT_FILE: &str = "INSERT INTO files (path) VALUES (?1)";

    fn item(path: &str) -> WriteItem {
        WriteItem::new(INSERT_FILE, vec![Value::Text(path.to_string())])
    }

    #[tokio::test]
    async fn test_writes_commit_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("critic.db");
        let db = Database::open(&path).unwrap();

        let writer = BatchWriter::spawn(
            &path,
            Duration::from_millis(500),
            Duration::from_millis(20),
        )
        .unwrap();

        let (a, b) = tokio::join!(
            writer.write(vec![item("a"), item("b")]),
            writer.write(vec![item("c")])
        );
        a.unwrap();
        b.unwrap();

        assert!(db.file_id("a").unwrap().is_some());
        assert!(db.file_id("c").unwrap().is_some());
        writer.shutdown();
    }

    #[tokio::test]
    async fn test_integrity_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("critic.db");
        let db = Database::open(&path).unwrap();

        let writer =
            BatchWriter::spawn(&path, Duration::from_millis(50), Duration::from_millis(10))
                .unwrap();

        // UNIQUE(path) fails on both attempts
        let result = writer.write(vec![item("dup"), item("dup")]).await;
        assert!(matches!(result, Err(WriterError::Integrity(_))));
        assert_eq!(db.file_id("dup").unwrap(), None);

        // The writer keeps working after a failed batch
        writer.write(vec![item("ok")]).await.unwrap();
        assert!(db.file_id("ok").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_write_and_closed_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("critic.db");
        Database::open(&path).unwrap();

        let mut writer =
            BatchWriter::spawn(&path, Duration::from_millis(50), Duration::from_millis(10))
                .unwrap();
        writer.write(Vec::new()).await.unwrap();

        writer.stop();
        assert_eq!(writer.write(vec![item("x")]).await, Err(WriterError::Closed));
    }
}

//! Worker child processes
//!
//! A worker launched as a child process talks to its parent over three
//! streams, each carrying length-prefixed JSON records:
//! - stdin: [`CommandRecord`]s; end of stream asks the worker to stop once
//!   the commands it already took have been answered
//! - stdout: [`ResponseRecord`]s, any number of items or an error and then a
//!   final record per command token
//! - stderr: [`LogRecord`]s

use super::handlers::Handlers;
use super::service::handle_guarded;
use crate::error::JobFailure;
use crate::pubsub::{read_frame, write_frame};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Time a worker gets to exit after its command stream closes
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// A command sent to a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub token: u64,
    pub user_id: Option<i64>,
    pub access_token_id: Option<i64>,
    pub payload: Value,
}

/// Payload of a command routed to a handler channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChannelRequest {
    channel: String,
    payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    Item { value: Value },
    Error { message: String },
    Final,
}

/// A response to the command with the same token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub token: u64,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: String,
    pub message: String,
}

impl LogRecord {
    fn new(level: &str, message: impl Into<String>) -> Self {
        Self {
            level: level.to_string(),
            message: message.into(),
        }
    }
}

/// Serve commands from this process's standard streams
pub async fn serve_stdio(handlers: Arc<Handlers>) -> Result<()> {
    serve_records(
        handlers,
        tokio::io::stdin(),
        tokio::io::stdout(),
        tokio::io::stderr(),
    )
    .await
}

/// Serve commands read from `commands` until it ends, then wait for the
/// commands in progress
pub async fn serve_records<R, W, L>(
    handlers: Arc<Handlers>,
    mut commands: R,
    responses: W,
    log: L,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    L: AsyncWrite + Unpin + Send + 'static,
{
    let (response_tx, response_rx) = mpsc::unbounded_channel::<ResponseRecord>();
    let (log_tx, log_rx) = mpsc::unbounded_channel::<LogRecord>();
    let response_writer = tokio::spawn(forward(response_rx, responses));
    let log_writer = tokio::spawn(forward(log_rx, log));

    let _ = log_tx.send(LogRecord::new("info", "Worker process started"));

    let mut tasks = JoinSet::new();
    loop {
        let command: CommandRecord = match read_frame(&mut commands).await {
            Ok(Some(command)) => command,
            Ok(None) => break,
            Err(e) => {
                let _ = log_tx.send(LogRecord::new("error", format!("Bad command: {}", e)));
                break;
            }
        };

        let handlers = handlers.clone();
        let response_tx = response_tx.clone();
        let log_tx = log_tx.clone();
        tasks.spawn(async move {
            let token = command.token;
            let result = match serde_json::from_value::<ChannelRequest>(command.payload) {
                Ok(request) => handle_guarded(handlers, request.channel, request.payload).await,
                Err(e) => Err(JobFailure::internal(format!("Malformed command: {}", e))),
            };
            let body = match result {
                Ok(value) => ResponseBody::Item { value },
                Err(failure) => {
                    let _ = log_tx.send(LogRecord::new(
                        "warn",
                        format!("Command {} failed: {}", token, failure),
                    ));
                    ResponseBody::Error {
                        message: failure.to_wire(),
                    }
                }
            };
            let _ = response_tx.send(ResponseRecord { token, body });
            let _ = response_tx.send(ResponseRecord {
                token,
                body: ResponseBody::Final,
            });
        });
    }

    while tasks.join_next().await.is_some() {}
    let _ = log_tx.send(LogRecord::new("info", "Worker process stopping"));
    drop(response_tx);
    drop(log_tx);
    response_writer.await.context("Response writer failed")??;
    log_writer.await.context("Log writer failed")??;
    Ok(())
}

async fn forward<T, W>(mut records: mpsc::UnboundedReceiver<T>, mut writer: W) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    while let Some(record) = records.recv().await {
        write_frame(&mut writer, &record).await?;
    }
    Ok(())
}

/// Parent-side handle of a worker child process
pub struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    next_token: u64,
}

impl WorkerProcess {
    /// Launch `program` with piped streams; its log records are re-emitted
    /// through tracing
    pub fn spawn(program: &Path, args: &[&str]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start worker {}", program.display()))?;

        let stdin = child.stdin.take().context("Worker stdin not piped")?;
        let stdout = child.stdout.take().context("Worker stdout not piped")?;
        let mut stderr = child.stderr.take().context("Worker stderr not piped")?;

        let pid = child.id();
        tokio::spawn(async move {
            while let Ok(Some(record)) = read_frame::<_, LogRecord>(&mut stderr).await {
                match record.level.as_str() {
                    "error" | "warn" => warn!(pid, "{}", record.message),
                    "info" => info!(pid, "{}", record.message),
                    _ => debug!(pid, "{}", record.message),
                }
            }
        });

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout,
            next_token: 1,
        })
    }

    /// Send a command; returns its token
    pub async fn send(&mut self, payload: Value) -> Result<u64> {
        let token = self.next_token;
        self.next_token += 1;
        let stdin = self.stdin.as_mut().context("Worker command stream closed")?;
        write_frame(
            stdin,
            &CommandRecord {
                token,
                user_id: None,
                access_token_id: None,
                payload,
            },
        )
        .await?;
        Ok(token)
    }

    /// Next response record; `None` once the worker closed its stream
    pub async fn next_response(&mut self) -> Result<Option<ResponseRecord>> {
        Ok(read_frame(&mut self.stdout).await?)
    }

    /// Send a request for a handler channel and wait for its result
    pub async fn call(&mut self, channel: &str, payload: Value) -> Result<Value, JobFailure> {
        let command = serde_json::to_value(ChannelRequest {
            channel: channel.to_string(),
            payload,
        })
        .map_err(|e| JobFailure::internal(e.to_string()))?;
        let token = self
            .send(command)
            .await
            .map_err(|e| JobFailure::transport(e.to_string()))?;

        let mut outcome = None;
        loop {
            let record = self
                .next_response()
                .await
                .map_err(|e| JobFailure::transport(e.to_string()))?
                .ok_or_else(|| JobFailure::transport("Worker exited"))?;
            if record.token != token {
                debug!(token = record.token, "Skipping response to another command");
                continue;
            }
            match record.body {
                ResponseBody::Item { value } => outcome = Some(Ok(value)),
                ResponseBody::Error { message } => {
                    outcome = Some(Err(JobFailure::from_wire(&message)))
                }
                ResponseBody::Final => break,
            }
        }
        outcome.unwrap_or_else(|| Err(JobFailure::internal("Worker sent no result")))
    }

    /// Close the command stream and wait for the worker to exit, killing it
    /// after the grace period
    pub async fn shutdown(self) -> Result<ExitStatus> {
        self.shutdown_within(SHUTDOWN_GRACE).await
    }

    pub async fn shutdown_within(mut self, grace: Duration) -> Result<ExitStatus> {
        drop(self.stdin.take());
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!(pid = self.child.id(), "Worker did not exit, killing it");
                self.child.kill().await?;
                Ok(self.child.wait().await?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HighlightConfig;
    use crate::error::FailureKind;
    use crate::worker::{BatchWriter, CALCULATE_FILE_DIFFERENCE};
    use serde_json::json;

    fn handlers(dir: &Path) -> Arc<Handlers> {
        let db_path = dir.join("critic.db");
        let writer =
            BatchWriter::spawn(&db_path, Duration::from_millis(50), Duration::from_millis(10))
                .unwrap();
        Arc::new(Handlers::new(
            db_path,
            Arc::new(writer),
            HighlightConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_commands_get_result_then_final() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut parent_commands, worker_commands) = tokio::io::duplex(64 * 1024);
        let (worker_responses, mut parent_responses) = tokio::io::duplex(64 * 1024);
        let (worker_log, mut parent_log) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(serve_records(
            handlers(dir.path()),
            worker_commands,
            worker_responses,
            worker_log,
        ));

        let missing = dir.path().join("missing");
        write_frame(
            &mut parent_commands,
            &CommandRecord {
                token: 7,
                user_id: Some(1),
                access_token_id: None,
                payload: json!({
                    "channel": CALCULATE_FILE_DIFFERENCE,
                    "payload": {"repository_path": missing, "files": []}
                }),
            },
        )
        .await
        .unwrap();
        drop(parent_commands);

        let first: ResponseRecord = read_frame(&mut parent_responses).await.unwrap().unwrap();
        assert_eq!(first.token, 7);
        let ResponseBody::Error { message } = first.body else {
            panic!("expected an error record");
        };
        assert_eq!(JobFailure::from_wire(&message).kind, FailureKind::Input);

        let last: ResponseRecord = read_frame(&mut parent_responses).await.unwrap().unwrap();
        assert_eq!(last.body, ResponseBody::Final);

        // End of the command stream stops the worker
        server.await.unwrap().unwrap();
        let end: Option<ResponseRecord> = read_frame(&mut parent_responses).await.unwrap();
        assert!(end.is_none());

        let started: LogRecord = read_frame(&mut parent_log).await.unwrap().unwrap();
        assert_eq!(started.message, "Worker process started");
    }
}

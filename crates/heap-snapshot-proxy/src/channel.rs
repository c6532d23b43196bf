//! Structured message channel to an isolated worker.

use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::WorkerProcessConfig;
use crate::error::{ProxyError, Result};
use crate::lock;
use crate::protocol::{CallId, WorkerEvent, WorkerFailure, WorkerRequest, WorkerResponse};

pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;

type InboundReceiver = mpsc::UnboundedReceiver<Value>;

/// Ordered, bidirectional channel carrying [`WorkerRequest`]s out and raw
/// structured messages in.
///
/// The inbound side is a single slot: exactly one consumer may take it.
pub struct WorkerChannel {
    outbound: Mutex<Option<mpsc::UnboundedSender<WorkerRequest>>>,
    inbound: Mutex<Option<InboundReceiver>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    process: Mutex<Option<Child>>,
    terminated: AtomicBool,
}

impl WorkerChannel {
    fn from_parts(
        outbound: mpsc::UnboundedSender<WorkerRequest>,
        inbound: InboundReceiver,
        tasks: Vec<JoinHandle<()>>,
        process: Option<Child>,
    ) -> Self {
        Self {
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            tasks: Mutex::new(tasks),
            process: Mutex::new(process),
            terminated: AtomicBool::new(false),
        }
    }

    /// Channel to a worker running in this process. The returned endpoint is the
    /// worker's side of the conversation.
    pub fn in_process() -> (Self, WorkerEndpoint) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        (
            Self::from_parts(request_tx, response_rx, Vec::new(), None),
            WorkerEndpoint {
                requests: request_rx,
                responses: response_tx,
            },
        )
    }

    /// Newline-delimited JSON over an arbitrary byte stream pair.
    pub fn connect_with_io(writer: ChannelWriter, reader: ChannelReader) -> Result<Self> {
        Self::connect_inner(writer, reader, None)
    }

    /// Launch a worker process and talk to it over its stdio.
    pub fn spawn(config: &WorkerProcessConfig) -> Result<Self> {
        let program = resolve_worker_program(&config.program)?;

        let mut cmd = Command::new(&program);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|error| ProxyError::Spawn(format!("{}: {error}", program.display())))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Spawn("worker stdin missing".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Spawn("worker stdout missing".to_string()))?;

        debug!(program = %program.display(), pid = ?child.id(), "spawned snapshot worker");
        Self::connect_inner(Box::new(stdin), Box::new(stdout), Some(child))
    }

    fn connect_inner(
        writer: ChannelWriter,
        reader: ChannelReader,
        process: Option<Child>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ProxyError::NoRuntime)?;
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<WorkerRequest>();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let writer_task = runtime.spawn(async move {
            let mut writer = writer;
            while let Some(request) = request_rx.recv().await {
                let line = match serde_json::to_string(&request) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(error = %err, call_id = %request.call_id, "Worker request encode failed");
                        continue;
                    }
                };
                trace!(line = %line, "worker <-");
                if let Err(err) = write_line(&mut writer, &line).await {
                    warn!(error = %err, "Worker write failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let reader_task = runtime.spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "Worker read failed");
                        break;
                    }
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                trace!(line = %trimmed, "worker ->");

                let value: Value = match serde_json::from_str(trimmed) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(error = %err, line = %trimmed, "Worker JSON parse failed");
                        continue;
                    }
                };
                if response_tx.send(value).is_err() {
                    break;
                }
            }
            debug!("worker channel reader finished");
        });

        Ok(Self::from_parts(
            request_tx,
            response_rx,
            vec![writer_task, reader_task],
            process,
        ))
    }

    /// Queue a request for the worker. Never blocks.
    pub fn post_message(&self, request: WorkerRequest) -> Result<()> {
        let outbound = lock(&self.outbound);
        let sender = outbound.as_ref().ok_or(ProxyError::ChannelClosed)?;
        sender
            .send(request)
            .map_err(|_| ProxyError::ChannelClosed)
    }

    /// Take the inbound message stream. Succeeds once per channel.
    pub fn take_inbound(&self) -> Result<mpsc::UnboundedReceiver<Value>> {
        lock(&self.inbound).take().ok_or(ProxyError::ChannelInUse)
    }

    /// Shut the channel down. Safe to call any number of times.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.outbound).take();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(mut child) = lock(&self.process).take()
            && let Err(err) = child.start_kill()
        {
            debug!(error = %err, "worker process already gone");
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Worker side of an in-process channel.
pub struct WorkerEndpoint {
    requests: mpsc::UnboundedReceiver<WorkerRequest>,
    responses: mpsc::UnboundedSender<Value>,
}

impl WorkerEndpoint {
    /// Next request from the client, or `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<WorkerRequest> {
        self.requests.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WorkerRequest> {
        self.requests.try_recv().ok()
    }

    pub fn reply(&self, call_id: CallId, result: Value) -> Result<()> {
        self.send(WorkerResponse::Success { call_id, result })
    }

    pub fn fail(
        &self,
        call_id: CallId,
        method_name: Option<&str>,
        call_stack: Option<&str>,
    ) -> Result<()> {
        self.send(WorkerResponse::Failure(WorkerFailure {
            call_id,
            method_name: method_name.map(str::to_string),
            call_stack: call_stack.map(str::to_string),
        }))
    }

    pub fn emit(&self, name: &str, data: Value) -> Result<()> {
        self.send(WorkerResponse::Event(WorkerEvent {
            name: name.to_string(),
            data,
        }))
    }

    /// Send an arbitrary message, bypassing envelope encoding.
    pub fn send_raw(&self, value: Value) -> Result<()> {
        self.responses
            .send(value)
            .map_err(|_| ProxyError::ChannelClosed)
    }

    fn send(&self, response: WorkerResponse) -> Result<()> {
        self.send_raw(response.into_value())
    }
}

async fn write_line(writer: &mut ChannelWriter, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

fn resolve_worker_program(program: &Path) -> Result<std::path::PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return Ok(program.to_path_buf());
    }
    which::which(program)
        .map_err(|error| ProxyError::Spawn(format!("{}: {error}", program.display())))
}

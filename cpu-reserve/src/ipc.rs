//! IPC interface for the CPU reservation daemon
//!
//! Newline-delimited JSON over a Unix socket. The requesting client is
//! identified by the peer credentials of its connection.

use crate::controller::{Admission, AddRequest, ChangeRequest, Controller, DeleteOutcome, ReservationInfo};
use crate::error::{ErrorCode, ReserveError};
use crate::kernel::PeriodicMode;
use crate::reservation::ThreadId;
use crate::watch::WATCH_SLOTS;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

/// IPC request types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IpcRequest {
    /// List all reservations
    List,

    /// Add a periodic reservation
    Add(AddRequest),

    /// Add a delayed-preemption section
    DelayedPreempt { thread: ThreadId, id: u32, delay_us: u64 },

    /// Change a periodic reservation
    Change {
        thread: ThreadId,
        id: u32,
        change: ChangeRequest,
    },

    /// Delete all reservations of a thread
    DeleteThread { thread: ThreadId },

    /// Delete all reservations of a task
    DeleteTask { thread: ThreadId },

    /// Start periodic execution
    BeginPeriodic {
        thread: ThreadId,
        mode: PeriodicMode,
        clock: u64,
    },

    /// Stop periodic execution
    EndPeriodic { thread: ThreadId },

    /// Watch preemptions of a thread's primary reservation
    Watch { thread: ThreadId },

    /// Read a watched reservation's overrun counters
    WatchCounters { thread: ThreadId },

    /// Query the response time of a reservation
    TimeDemand { thread: ThreadId, id: u32 },

    /// Query the scheduler granularity
    Granularity,
}

/// IPC response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum IpcResponse {
    /// Successful response with data
    Success { data: serde_json::Value },

    /// Error response
    Error { code: ErrorCode, message: String },
}

impl IpcResponse {
    /// Create success response
    pub fn success<T: Serialize>(data: T) -> Self {
        Self::Success {
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Create error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    fn from_result<T: Serialize>(result: crate::Result<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::from(e),
        }
    }
}

impl From<ReserveError> for IpcResponse {
    fn from(e: ReserveError) -> Self {
        Self::error(e.to_error_code(), e.to_string())
    }
}

/// Reply to a watch request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchReply {
    /// Identity registered as the thread's preempter
    pub preempter: ThreadId,
    /// Number of counter slots
    pub slots: usize,
}

/// Handler for processing IPC requests
pub trait IpcHandler: Send + Sync {
    /// Handle a request from `caller`
    fn handle(
        &self,
        request: IpcRequest,
        caller: ThreadId,
    ) -> impl std::future::Future<Output = IpcResponse> + Send;
}

impl IpcHandler for Controller {
    async fn handle(&self, request: IpcRequest, caller: ThreadId) -> IpcResponse {
        match request {
            IpcRequest::List => IpcResponse::success(self.list().await),

            IpcRequest::Add(req) => IpcResponse::from_result(self.add(req, caller).await),

            IpcRequest::DelayedPreempt { thread, id, delay_us } => {
                IpcResponse::from_result(self.delayed_preempt(thread, id, delay_us, caller).await)
            }

            IpcRequest::Change { thread, id, change } => {
                IpcResponse::from_result(self.change(thread, id, change).await)
            }

            IpcRequest::DeleteThread { thread } => {
                IpcResponse::from_result(self.delete_thread(thread).await)
            }

            IpcRequest::DeleteTask { thread } => {
                IpcResponse::from_result(self.delete_task(thread).await)
            }

            IpcRequest::BeginPeriodic { thread, mode, clock } => {
                IpcResponse::from_result(self.begin_periodic(thread, mode, clock).await)
            }

            IpcRequest::EndPeriodic { thread } => {
                IpcResponse::from_result(self.end_periodic(thread).await)
            }

            IpcRequest::Watch { thread } => {
                IpcResponse::from_result(self.watch(thread, caller).await.map(|grant| WatchReply {
                    preempter: grant.preempter,
                    slots: WATCH_SLOTS,
                }))
            }

            IpcRequest::WatchCounters { thread } => {
                IpcResponse::from_result(self.watch_counters(thread).await)
            }

            IpcRequest::TimeDemand { thread, id } => {
                IpcResponse::from_result(self.time_demand(thread, id).await)
            }

            IpcRequest::Granularity => IpcResponse::success(self.granularity()),
        }
    }
}

/// IPC server
pub struct IpcServer<H: IpcHandler> {
    socket_path: String,
    handler: Arc<H>,
}

impl<H: IpcHandler + 'static> IpcServer<H> {
    /// Create new IPC server
    pub fn new(socket_path: impl Into<String>, handler: Arc<H>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler,
        }
    }

    /// Bind the socket, replacing a stale one
    pub fn bind(&self) -> Result<UnixListener> {
        let path = Path::new(&self.socket_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(path);

        let listener = UnixListener::bind(path)?;
        info!("cpu-reserve IPC listening on {}", self.socket_path);
        Ok(listener)
    }

    /// Bind and serve forever
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: UnixListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handler).await {
                            error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Identity of the peer process
fn peer_identity(stream: &UnixStream) -> ThreadId {
    let pid = stream
        .peer_cred()
        .ok()
        .and_then(|cred| cred.pid())
        .and_then(|pid| u32::try_from(pid).ok())
        .unwrap_or(0);
    ThreadId::new(pid, 0)
}

async fn handle_client<H: IpcHandler>(stream: UnixStream, handler: Arc<H>) -> Result<()> {
    let caller = peer_identity(&stream);
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => {
                debug!("IPC request from {}: {:?}", caller, request);
                handler.handle(request, caller).await
            }
            Err(e) => IpcResponse::error(ErrorCode::InvalidRequest, format!("Invalid request: {}", e)),
        };

        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

/// Error returned by the daemon
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} ({code:?})")]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

/// IPC client for connecting to cpu-reserved
pub struct IpcClient {
    socket_path: String,
}

impl IpcClient {
    /// Create new IPC client
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Send request and receive response
    pub async fn send(&self, request: IpcRequest) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let request_json = serde_json::to_string(&request)?;
        stream.write_all(request_json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        Ok(serde_json::from_str(&line)?)
    }

    async fn call<T: DeserializeOwned>(&self, request: IpcRequest) -> Result<T> {
        match self.send(request).await? {
            IpcResponse::Success { data } => Ok(serde_json::from_value(data)?),
            IpcResponse::Error { code, message } => Err(RemoteError { code, message }.into()),
        }
    }

    /// List reservations
    pub async fn list(&self) -> Result<Vec<ReservationInfo>> {
        self.call(IpcRequest::List).await
    }

    /// Add a periodic reservation
    pub async fn add(&self, req: AddRequest) -> Result<Admission> {
        self.call(IpcRequest::Add(req)).await
    }

    /// Add a delayed-preemption section, returns the reserved delay
    pub async fn delayed_preempt(&self, thread: ThreadId, id: u32, delay_us: u64) -> Result<u64> {
        self.call(IpcRequest::DelayedPreempt { thread, id, delay_us })
            .await
    }

    /// Change a periodic reservation
    pub async fn change(
        &self,
        thread: ThreadId,
        id: u32,
        change: ChangeRequest,
    ) -> Result<crate::Reservation> {
        self.call(IpcRequest::Change { thread, id, change }).await
    }

    /// Delete all reservations of a thread
    pub async fn delete_thread(&self, thread: ThreadId) -> Result<DeleteOutcome> {
        self.call(IpcRequest::DeleteThread { thread }).await
    }

    /// Delete all reservations of a task
    pub async fn delete_task(&self, thread: ThreadId) -> Result<DeleteOutcome> {
        self.call(IpcRequest::DeleteTask { thread }).await
    }

    /// Start periodic execution
    pub async fn begin_periodic(&self, thread: ThreadId, mode: PeriodicMode, clock: u64) -> Result<()> {
        self.call(IpcRequest::BeginPeriodic { thread, mode, clock })
            .await
    }

    /// Stop periodic execution
    pub async fn end_periodic(&self, thread: ThreadId) -> Result<()> {
        self.call(IpcRequest::EndPeriodic { thread }).await
    }

    /// Watch a thread's primary reservation
    pub async fn watch(&self, thread: ThreadId) -> Result<WatchReply> {
        self.call(IpcRequest::Watch { thread }).await
    }

    /// Read overrun counters
    pub async fn watch_counters(&self, thread: ThreadId) -> Result<Vec<u32>> {
        self.call(IpcRequest::WatchCounters { thread }).await
    }

    /// Query response time
    pub async fn time_demand(&self, thread: ThreadId, id: u32) -> Result<u64> {
        self.call(IpcRequest::TimeDemand { thread, id }).await
    }

    /// Query scheduler granularity
    pub async fn granularity(&self) -> Result<u64> {
        self.call(IpcRequest::Granularity).await
    }
}

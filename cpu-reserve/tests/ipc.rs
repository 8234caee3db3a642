//! Daemon protocol over a real Unix socket

use cpu_reserve::config::CpuReserveConfig;
use cpu_reserve::controller::{AddRequest, ChangeRequest, Controller};
use cpu_reserve::error::ErrorCode;
use cpu_reserve::ipc::{IpcClient, IpcRequest, IpcResponse, IpcServer, RemoteError};
use cpu_reserve::kernel::{PeriodicMode, SimulatedKernel};
use cpu_reserve::reservation::CONTROL_ID;
use cpu_reserve::ThreadId;
use std::sync::Arc;

fn start_daemon(dir: &tempfile::TempDir) -> (Arc<SimulatedKernel>, IpcClient) {
    let socket = dir.path().join("cpu-reserve.sock");
    let kernel = Arc::new(SimulatedKernel::new(1000));
    let controller = Arc::new(Controller::new(
        kernel.clone(),
        CONTROL_ID,
        &CpuReserveConfig::default(),
    ));

    let server = IpcServer::new(socket.to_string_lossy(), controller);
    let listener = server.bind().unwrap();
    tokio::spawn(async move { server.serve(listener).await });

    (kernel, IpcClient::new(socket.to_string_lossy()))
}

fn remote_code(err: &anyhow::Error) -> Option<ErrorCode> {
    err.downcast_ref::<RemoteError>().map(|e| e.code)
}

#[tokio::test]
async fn test_admission_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let (kernel, client) = start_daemon(&dir);
    let t = ThreadId::new(0x10, 1);

    assert_eq!(client.granularity().await.unwrap(), 1000);

    let admission = client
        .add(AddRequest {
            thread: t,
            name: "video".into(),
            priority: 50,
            period_us: 40_000,
            wcet_us: 7_500,
            deadline_us: 40_000,
        })
        .await
        .unwrap();
    assert_eq!(admission.id, 1);
    assert_eq!(admission.wcet_us, 8_000);

    assert_eq!(client.delayed_preempt(t, 1, 100).await.unwrap(), 1000);
    assert_eq!(client.time_demand(t, 1).await.unwrap(), 8_000);

    let list = client.list().await.unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].name, "video.dp");
    // Identity comes from the socket's peer credentials
    assert_eq!(list[1].creator, ThreadId::new(std::process::id(), 0));

    let err = client
        .change(
            t,
            1,
            ChangeRequest {
                wcet_us: Some(50_000),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(remote_code(&err), Some(ErrorCode::Infeasible));

    client.begin_periodic(t, PeriodicMode::Minimal, 5).await.unwrap();
    assert_eq!(kernel.periodic(t), Some((PeriodicMode::Minimal, 5)));
    client.end_periodic(t).await.unwrap();

    let outcome = client.delete_thread(t).await.unwrap();
    assert_eq!(outcome.removed, 2);
    let err = client.delete_thread(t).await.unwrap_err();
    assert_eq!(remote_code(&err), Some(ErrorCode::NotFound));
}

#[tokio::test]
async fn test_watch_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let (_kernel, client) = start_daemon(&dir);
    let t = ThreadId::new(0x11, 0);

    client
        .add(AddRequest {
            thread: t,
            name: "audio".into(),
            priority: 60,
            period_us: 10_000,
            wcet_us: 1_000,
            deadline_us: 0,
        })
        .await
        .unwrap();

    let reply = client.watch(t).await.unwrap();
    assert_eq!(reply.slots, 1024);
    let err = client.watch(t).await.unwrap_err();
    assert_eq!(remote_code(&err), Some(ErrorCode::Busy));

    assert!(client.watch_counters(t).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_request_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (_kernel, client) = start_daemon(&dir);

    // A well-formed request still succeeds on the same daemon
    let response = client.send(IpcRequest::List).await.unwrap();
    assert!(matches!(response, IpcResponse::Success { .. }));

    let socket = dir.path().join("cpu-reserve.sock");
    let mut stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    stream.write_all(b"{\"type\":\"Bogus\"}\n").await.unwrap();
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).await.unwrap();
    let response: IpcResponse = serde_json::from_str(&line).unwrap();
    assert!(matches!(
        response,
        IpcResponse::Error {
            code: ErrorCode::InvalidRequest,
            ..
        }
    ));
}

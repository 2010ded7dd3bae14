//! Integration tests for the offload-server and offload-client binaries.
//!
//! These tests run the real processes and check their exit codes, which
//! carry the fail-fast policy: peer closed exits 0, every other failure 1.

use offload_core::transport::framing::{read_frame, write_frame};
use offload_core::ReadySignal;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};

const SERVER: &str = env!("CARGO_BIN_EXE_offload-server");
const CLIENT: &str = env!("CARGO_BIN_EXE_offload-client");

struct ServerProcess {
    child: Child,
    announced: String,
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Start the server and wait for the line starting with `prefix`.
async fn start_server(args: &[&str], prefix: &str) -> Result<ServerProcess, String> {
    let mut child = Command::new(SERVER)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn offload-server: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix(prefix) {
                    let announced = value.trim().to_string();
                    tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });
                    return Ok(ServerProcess { child, announced });
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read offload-server stdout: {err}")),
            Err(_) => continue,
        }
    }
    Err(format!("{prefix} line not emitted by offload-server"))
}

async fn run_client(args: &[&str]) -> std::process::ExitStatus {
    let child = Command::new(CLIENT)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to spawn offload-client");
    tokio::time::timeout(Duration::from_secs(60), child.wait_with_output())
        .await
        .expect("offload-client did not finish")
        .expect("failed to wait for offload-client")
        .status
}

#[tokio::test]
async fn test_client_runs_every_kernel_over_socket() {
    let server = start_server(&["--port", "0"], "OFFLOAD_PORT=").await.unwrap();
    let port = server.announced.clone();

    for kernel in ["add", "scale", "matmul", "jacobi_2d", "seidel"] {
        let status = run_client(&[
            "--port", &port, "--kernel", kernel, "--size", "6", "--runs", "2",
        ])
        .await;
        assert_eq!(status.code(), Some(0), "kernel {kernel}");
    }
}

#[tokio::test]
async fn test_client_local_path_and_time_file() {
    let server = start_server(&["--port", "0"], "OFFLOAD_PORT=").await.unwrap();
    let temp_dir = TempDir::new().unwrap();
    let time_file = temp_dir.path().join("times.jsonl");

    let status = run_client(&[
        "--port",
        &server.announced,
        "--kernel",
        "scale",
        "--size",
        "100",
        "--runs",
        "3",
        "--threshold",
        "0",
        "--time-file",
        time_file.to_str().unwrap(),
    ])
    .await;
    assert_eq!(status.code(), Some(0));

    let text = std::fs::read_to_string(&time_file).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].contains("\"kind\":\"session\""));
    assert!(lines[1..].iter().all(|l| l.contains("\"path\":\"local\"")));
}

#[tokio::test]
async fn test_client_over_shared_segment() {
    let name = format!("offload_rpc_it_{}", std::process::id());
    let mut server = start_server(
        &["--comm", "sharedmem", "--shmem-name", &name, "--shmem-size", "1048576"],
        "OFFLOAD_SHMEM=",
    )
    .await
    .unwrap();

    let status = run_client(&[
        "--comm",
        "sharedmem",
        "--shmem-name",
        &name,
        "--kernel",
        "matmul",
        "--size",
        "5",
    ])
    .await;
    assert_eq!(status.code(), Some(0));

    // A shared segment server serves a single session, then exits.
    let server_status = tokio::time::timeout(Duration::from_secs(20), server.child.wait())
        .await
        .expect("server did not exit after the session")
        .unwrap();
    assert!(server_status.success());
}

#[tokio::test]
async fn test_server_disconnect_exits_client_with_zero() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port().to_string();

    // Accept the module, announce readiness, then drop the connection
    // as soon as the first call arrives.
    let fake = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_frame(&mut stream, 1 << 20).await.unwrap().unwrap();
        let ready = ReadySignal::default();
        write_frame(&mut stream, ready.to_text().as_bytes()).await.unwrap();
        read_frame(&mut stream, 1 << 20).await.unwrap().is_some()
    });

    let status = run_client(&["--port", &port, "--kernel", "add"]).await;
    assert_eq!(status.code(), Some(0));
    assert!(fake.await.unwrap());
}

#[tokio::test]
async fn test_client_without_server_exits_with_one() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    drop(listener);

    let status = run_client(&["--port", &port, "--kernel", "add"]).await;
    assert_eq!(status.code(), Some(1));
}

#[tokio::test]
async fn test_unknown_comm_type_rejected() {
    let status = run_client(&["--comm", "pipe"]).await;
    assert!(!status.success());
}

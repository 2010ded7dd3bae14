//! End-to-end tests of offload sessions over both transports.

use offload_core::transport::framing::{read_frame, write_frame};
use offload_core::{
    kernels, Arg, CallPath, ClientTransport, NativeFunctionTable, OffloadClient,
    OffloadDecisionSite, OffloadError, ReadySignal, Scalar, ServerSession, ShmemClientTransport,
    ShmemConfig, ShmemServerTransport, StreamClientTransport, StreamServer, StreamServerHandle,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

fn loader() -> Arc<NativeFunctionTable> {
    Arc::new(kernels::builtin_table().expect("built-in kernels"))
}

fn module_text() -> String {
    loader()
        .module_text("kernels", &kernels::NAMES)
        .expect("module text")
}

async fn stream_server() -> StreamServerHandle {
    StreamServer::start("127.0.0.1:0".parse().unwrap(), loader())
        .await
        .unwrap()
}

async fn stream_client(server: &StreamServerHandle) -> OffloadClient<StreamClientTransport> {
    let transport = StreamClientTransport::connect(server.addr()).await.unwrap();
    let mut client = OffloadClient::new(transport);
    client.initialise(&module_text()).await.unwrap();
    client
}

fn shmem_config(tag: &str) -> ShmemConfig {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    ShmemConfig::with_base(
        &format!("offload_it_{}_{}_{}", tag, std::process::id(), n),
        1 << 20,
    )
}

/// Start a shared segment server session in the background.
fn shmem_server(
    config: &ShmemConfig,
) -> tokio::task::JoinHandle<offload_core::Result<offload_core::SessionSummary>> {
    let transport = ShmemServerTransport::create(config.clone()).unwrap();
    tokio::spawn(ServerSession::new(transport, loader()).run())
}

async fn shmem_client(config: &ShmemConfig) -> OffloadClient<ShmemClientTransport> {
    let mut client = OffloadClient::new(ShmemClientTransport::open(config).unwrap());
    client.initialise(&module_text()).await.unwrap();
    client
}

async fn add<T: ClientTransport>(client: &mut OffloadClient<T>, a: i32, b: i32) -> Option<Scalar> {
    client
        .call(kernels::ADD, &mut [Arg::scalar(a), Arg::scalar(b)])
        .await
        .unwrap()
        .value
}

async fn scale<T: ClientTransport>(client: &mut OffloadClient<T>) {
    let mut data = vec![1.0f64, 2.0, 3.0];
    let reply = client
        .call(kernels::SCALE, &mut [Arg::array(&mut data), Arg::count(3)])
        .await
        .unwrap();
    assert_eq!(reply.value, None);
    assert!(reply.exec_micros >= 0);
    assert_eq!(data, vec![2.0, 4.0, 6.0]);
}

#[tokio::test]
async fn test_add_over_stream() {
    let server = stream_server().await;
    let mut client = stream_client(&server).await;
    assert_eq!(add(&mut client, 3, 4).await, Some(Scalar::i32(7)));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_scale_over_stream() {
    let server = stream_server().await;
    let mut client = stream_client(&server).await;
    scale(&mut client).await;
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_add_and_scale_over_shared_segment() {
    let config = shmem_config("ab");
    let server = shmem_server(&config);
    let mut client = shmem_client(&config).await;

    assert_eq!(add(&mut client, 3, 4).await, Some(Scalar::i32(7)));
    scale(&mut client).await;
    client.close().await.unwrap();

    let summary = server.await.unwrap().unwrap();
    assert_eq!(summary.calls, 2);
    assert!(summary.ready.is_some());
}

#[tokio::test]
async fn test_replies_match_requests_over_stream() {
    let server = stream_server().await;
    let mut client = stream_client(&server).await;
    for i in 0..50 {
        assert_eq!(add(&mut client, i, 1000 * i).await, Some(Scalar::i32(1001 * i)));
    }
    assert_eq!(client.calls_made(), 50);
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replies_match_requests_over_shared_segment() {
    let config = shmem_config("seq");
    let server = shmem_server(&config);
    let mut client = shmem_client(&config).await;
    for i in 0..50 {
        assert_eq!(add(&mut client, -i, 3 * i).await, Some(Scalar::i32(2 * i)));
    }
    client.close().await.unwrap();
    assert_eq!(server.await.unwrap().unwrap().calls, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_termination_byte_ends_server_loop() {
    let config = shmem_config("term");
    let server = shmem_server(&config);
    let client = shmem_client(&config).await;

    client.close().await.unwrap();
    let summary = server.await.unwrap().unwrap();
    assert_eq!(summary.calls, 0);

    // Teardown removed the named objects.
    assert!(ShmemClientTransport::open(&config).is_err());
}

#[tokio::test]
async fn test_server_disconnect_mid_call_is_peer_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Server that accepts the module and the first call, then goes away.
    let fake = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let module = read_frame(&mut stream, 1 << 20).await.unwrap().unwrap();
        assert!(!module.is_empty());
        let ready = ReadySignal {
            optimize_micros: 1,
            init_micros: 1,
        };
        write_frame(&mut stream, ready.to_text().as_bytes())
            .await
            .unwrap();
        read_frame(&mut stream, 1 << 20).await.unwrap().unwrap()
    });

    let transport = StreamClientTransport::connect(addr).await.unwrap();
    let mut client = OffloadClient::new(transport);
    client.initialise(&module_text()).await.unwrap();

    let err = client
        .call(kernels::ADD, &mut [Arg::scalar(3), Arg::scalar(4)])
        .await
        .unwrap_err();
    assert!(matches!(err, OffloadError::PeerClosed));
    assert_eq!(err.exit_code(), 0);
    assert_eq!(fake.await.unwrap(), b"add:3:4");
}

#[tokio::test]
async fn test_matmul_matches_local_body() {
    let server = stream_server().await;
    let mut client = stream_client(&server).await;

    let n = 6;
    let a: Vec<f64> = (0..n * n).map(|i| (i % 7) as f64 * 0.5).collect();
    let b: Vec<f64> = (0..n * n).map(|i| 1.0 / (1 + i) as f64).collect();
    let mut expected = vec![0.0; n * n];
    kernels::matmul(&a, &b, &mut expected, n);

    let mut ra = a.clone();
    let mut rb = b.clone();
    let mut c = vec![0.0; n * n];
    client
        .call(
            kernels::MATMUL,
            &mut [
                Arg::array(&mut ra),
                Arg::count(n * n),
                Arg::array(&mut rb),
                Arg::count(n * n),
                Arg::array(&mut c),
                Arg::count(n * n),
            ],
        )
        .await
        .unwrap();

    // Hex text carries every bit, so the results are identical.
    assert_eq!(c, expected);
    assert_eq!(ra, a);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_decision_site_picks_path_by_score() {
    let server = stream_server().await;
    let mut client = stream_client(&server).await;

    let remote = OffloadDecisionSite::new(kernels::ADD, 12).unwrap();
    let outcome = remote
        .run(&mut client, &mut [Arg::scalar(20), Arg::scalar(22)], |_| {
            panic!("local body must not run")
        })
        .await
        .unwrap();
    assert_eq!(outcome.path, CallPath::Remote);
    assert_eq!(outcome.value, Some(Scalar::i32(42)));
    assert!(outcome.exec_micros.is_some());

    let local = OffloadDecisionSite::new(kernels::ADD, 11).unwrap();
    let outcome = local
        .run(&mut client, &mut [Arg::scalar(20), Arg::scalar(22)], |args| {
            let a = args[0].as_i64().unwrap_or(0) as i32;
            let b = args[1].as_i64().unwrap_or(0) as i32;
            Some(Scalar::i32(kernels::add(a, b)))
        })
        .await
        .unwrap();
    assert_eq!(outcome.path, CallPath::Local);
    assert_eq!(outcome.value, Some(Scalar::i32(42)));
    assert_eq!(outcome.exec_micros, None);
    assert_eq!(client.calls_made(), 1);

    client.close().await.unwrap();
}

//! End-to-end tests: HTTP client -> gateway -> mock Gopher server

use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

use idigna::config::{Config, RemoteConfig, ServerConfig};
use idigna::server::{Gateway, ShutdownHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Accept `count` Gopher requests, answer each with `reply` and close.
/// Resolves to the selector lines received.
async fn spawn_gopher(reply: Vec<u8>, count: usize) -> (SocketAddr, JoinHandle<Vec<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let task = tokio::spawn(async move {
        let mut selectors = Vec::new();
        for _ in 0..count {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut line = Vec::new();
            let mut byte = [0u8; 1];
            while !line.ends_with(b"\r\n") {
                if socket.read(&mut byte).await.unwrap() == 0 {
                    break;
                }
                line.push(byte[0]);
            }
            socket.write_all(&reply).await.unwrap();
            socket.shutdown().await.unwrap();
            selectors.push(line);
        }
        selectors
    });

    (addr, task)
}

fn loopback_config(remote: SocketAddr) -> Config {
    Config {
        server: ServerConfig {
            listen_port: 0,
            bind: Some("127.0.0.1".into()),
        },
        remote: RemoteConfig {
            host: remote.ip().to_string(),
            port: remote.port(),
        },
    }
}

fn start_gateway(
    remote: SocketAddr,
) -> (SocketAddr, ShutdownHandle, JoinHandle<anyhow::Result<()>>) {
    let mut gateway = Gateway::bind(&loopback_config(remote)).unwrap();
    let addr = gateway.local_addrs()[0];
    let shutdown = gateway.shutdown_handle();
    let task = tokio::task::spawn_blocking(move || gateway.run());

    (addr, shutdown, task)
}

async fn stop_gateway(shutdown: ShutdownHandle, task: JoinHandle<anyhow::Result<()>>) {
    shutdown.trigger().unwrap();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

async fn fetch(gateway: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(gateway).await.unwrap();
    client.write_all(request).await.unwrap();

    let mut response = Vec::new();
    timeout(WAIT, client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn test_selector_round_trip() {
    let (remote, server) = spawn_gopher(b"hello gopher\n".to_vec(), 1).await;
    let (gateway, shutdown, task) = start_gateway(remote);

    let response = fetch(gateway, b"GET /selector HTTP/1.0\r\nHost: x\r\n\r\n").await;

    assert_eq!(response, b"hello gopher\n");
    assert_eq!(server.await.unwrap(), vec![b"/selector\r\n".to_vec()]);
    stop_gateway(shutdown, task).await;
}

#[tokio::test]
async fn test_request_sent_one_byte_at_a_time() {
    let (remote, server) = spawn_gopher(b"iInfo line\tfake\t(NULL)\t0\r\n.\r\n".to_vec(), 1).await;
    let (gateway, shutdown, task) = start_gateway(remote);

    let mut client = TcpStream::connect(gateway).await.unwrap();
    for byte in b"GET /slow HTTP/1.1\r\nUser-Agent: t\r\n\r\n" {
        client.write_all(std::slice::from_ref(byte)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let mut response = Vec::new();
    timeout(WAIT, client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response, b"iInfo line\tfake\t(NULL)\t0\r\n.\r\n");
    assert_eq!(server.await.unwrap(), vec![b"/slow\r\n".to_vec()]);
    stop_gateway(shutdown, task).await;
}

#[tokio::test]
async fn test_large_response_is_relayed_verbatim() {
    let body: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let (remote, server) = spawn_gopher(body.clone(), 1).await;
    let (gateway, shutdown, task) = start_gateway(remote);

    let response = fetch(gateway, b"GET /9/file.bin HTTP/1.1\r\n\r\n").await;

    assert_eq!(response.len(), body.len());
    assert!(response == body);
    server.await.unwrap();
    stop_gateway(shutdown, task).await;
}

#[tokio::test]
async fn test_sequential_and_concurrent_clients() {
    let (remote, server) = spawn_gopher(b"0ok\n".to_vec(), 4).await;
    let (gateway, shutdown, task) = start_gateway(remote);

    assert_eq!(fetch(gateway, b"GET /one HTTP/1.0\r\n\r\n").await, b"0ok\n");

    let (a, b, c) = tokio::join!(
        fetch(gateway, b"GET /a HTTP/1.0\r\n\r\n"),
        fetch(gateway, b"GET /b HTTP/1.0\r\n\r\n"),
        fetch(gateway, b"GET /c HTTP/1.0\r\n\r\n"),
    );
    assert_eq!(a, b"0ok\n");
    assert_eq!(b, b"0ok\n");
    assert_eq!(c, b"0ok\n");

    let mut selectors = server.await.unwrap();
    assert_eq!(selectors.remove(0), b"/one\r\n");
    selectors.sort();
    assert_eq!(
        selectors,
        vec![b"/a\r\n".to_vec(), b"/b\r\n".to_vec(), b"/c\r\n".to_vec()]
    );
    stop_gateway(shutdown, task).await;
}

#[tokio::test]
async fn test_other_method_never_reaches_remote() {
    let (remote, server) = spawn_gopher(b"fine\n".to_vec(), 1).await;
    let (gateway, shutdown, task) = start_gateway(remote);

    let mut bad = TcpStream::connect(gateway).await.unwrap();
    bad.write_all(b"POST /nope HTTP/1.0\r\n\r\n").await.unwrap();

    let mut buf = [0u8; 16];
    assert!(
        timeout(Duration::from_millis(200), bad.read(&mut buf)).await.is_err(),
        "gateway answered a non-GET request"
    );
    drop(bad);

    assert_eq!(fetch(gateway, b"GET /yes HTTP/1.0\r\n\r\n").await, b"fine\n");
    assert_eq!(server.await.unwrap(), vec![b"/yes\r\n".to_vec()]);
    stop_gateway(shutdown, task).await;
}

#[tokio::test]
async fn test_client_hanging_up_mid_request() {
    let (remote, server) = spawn_gopher(b"still here\n".to_vec(), 1).await;
    let (gateway, shutdown, task) = start_gateway(remote);

    let mut quitter = TcpStream::connect(gateway).await.unwrap();
    quitter.write_all(b"GET /half HTTP/1.0\r\nHost:").await.unwrap();
    drop(quitter);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        fetch(gateway, b"GET /whole HTTP/1.0\r\n\r\n").await,
        b"still here\n"
    );
    assert_eq!(server.await.unwrap(), vec![b"/whole\r\n".to_vec()]);
    stop_gateway(shutdown, task).await;
}

#[tokio::test]
async fn test_unreachable_remote_closes_only_that_client() {
    // Reserve a port, then free it so nothing listens there.
    let remote = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (gateway, shutdown, task) = start_gateway(remote);

    assert!(fetch(gateway, b"GET /x HTTP/1.0\r\n\r\n").await.is_empty());
    assert!(fetch(gateway, b"GET /y HTTP/1.0\r\n\r\n").await.is_empty());
    assert!(!task.is_finished());

    stop_gateway(shutdown, task).await;
}

#[tokio::test]
async fn test_shutdown_with_open_connections() {
    let (remote, _server) = spawn_gopher(Vec::new(), 1).await;
    let (gateway, shutdown, task) = start_gateway(remote);

    let mut idle = TcpStream::connect(gateway).await.unwrap();
    idle.write_all(b"GET /idle").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    stop_gateway(shutdown, task).await;

    let mut buf = [0u8; 4];
    let n = timeout(WAIT, idle.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_client_leaving_mid_response_closes_remote() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();

    // Stream data until the gateway drops the remote side.
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut selector = [0u8; 9];
        socket.read_exact(&mut selector).await.unwrap();

        let chunk = vec![b'g'; 64 * 1024];
        let mut written = 0usize;
        while socket.write_all(&chunk).await.is_ok() {
            written += chunk.len();
        }
        written
    });
    let (gateway, shutdown, task) = start_gateway(remote);

    let mut client = TcpStream::connect(gateway).await.unwrap();
    client.write_all(b"GET /stream HTTP/1.0\r\n\r\n").await.unwrap();
    let mut head = [0u8; 4096];
    timeout(WAIT, client.read_exact(&mut head))
        .await
        .unwrap()
        .unwrap();
    assert!(head.iter().all(|&b| b == b'g'));
    drop(client);

    let written = timeout(WAIT, server).await.unwrap().unwrap();
    assert!(written >= head.len());
    assert!(!task.is_finished());
    stop_gateway(shutdown, task).await;
}

/// Step `gateway` until `done` holds.
fn turn_until(gateway: &mut Gateway, done: impl Fn(&Gateway) -> bool) {
    for _ in 0..200 {
        if done(gateway) {
            return;
        }
        assert!(gateway.turn(Some(Duration::from_millis(25))).unwrap());
    }
    panic!("gateway did not reach the expected state");
}

#[test]
fn test_client_reset_during_request_is_torn_down() {
    let remote = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut gateway = Gateway::bind(&loopback_config(remote.local_addr().unwrap())).unwrap();
    let addr = gateway.local_addrs()[0];

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    turn_until(&mut gateway, |g| g.connection_count() == 1);

    client.write_all(b"GET /re").unwrap();
    socket2::SockRef::from(&client)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(client);
    turn_until(&mut gateway, |g| g.connection_count() == 0);

    // Still accepting afterwards.
    let _next = std::net::TcpStream::connect(addr).unwrap();
    turn_until(&mut gateway, |g| g.connection_count() == 1);
}

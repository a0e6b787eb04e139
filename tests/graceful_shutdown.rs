//! End-to-end shutdown tests over real sockets.

use graceful_drain::conn::{ConnInfo, ConnState};
use graceful_drain::listener::{self, DrainingListener, ListenAddr, ListenerError, acceptor_from_config};
use graceful_drain::server::{Body, GracefulServer, ServerError, ServerSettings, ServerState, body};
use hyper::header::{CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: test\r\n\r\n";
const TIMEOUT: Duration = Duration::from_secs(5);

fn hello(_req: Request<Body>) -> impl std::future::Future<Output = Response<Body>> + Send {
    async { Response::new(body::full("hello")) }
}

async fn serve_tcp(server: &GracefulServer) -> (SocketAddr, JoinHandle<Result<(), ServerError>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });
    (addr, task)
}

async fn finish(task: JoinHandle<Result<(), ServerError>>) {
    tokio::time::timeout(TIMEOUT, task)
        .await
        .expect("serve did not return")
        .unwrap()
        .unwrap();
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Read one response whose body ends with `tail`.
async fn read_until<S: AsyncRead + Unpin>(stream: &mut S, tail: &str) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.ends_with(tail.as_bytes()) {
        let n = tokio::time::timeout(TIMEOUT, stream.read(&mut chunk))
            .await
            .expect("response timed out")
            .unwrap();
        assert!(n > 0, "connection closed early: {}", String::from_utf8_lossy(&buf));
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8(buf).unwrap()
}

#[tokio::test]
async fn test_in_flight_request_completes_after_close() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let handler = {
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        move |_req: Request<Body>| {
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            async move {
                entered.notify_one();
                release.notified().await;
                Response::new(body::full("slow"))
            }
        }
    };
    let server = GracefulServer::new(handler);
    let (addr, task) = serve_tcp(&server).await;

    let mut a = TcpStream::connect(addr).await.unwrap();
    a.write_all(REQUEST).await.unwrap();
    entered.notified().await;

    assert!(server.close());
    server.shutting_down().await;

    // The listener goes away, new clients are refused.
    tokio::time::timeout(TIMEOUT, async {
        while TcpStream::connect(addr).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("listener still accepting");

    assert_eq!(server.state(), ServerState::ShuttingDown);
    eventually(|| server.outstanding() == 1).await;

    release.notify_one();
    let response = read_until(&mut a, "slow").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));

    finish(task).await;
    assert_eq!(server.state(), ServerState::Drained);
    assert!(server.connection_states().is_empty());
}

#[tokio::test]
async fn test_idle_keep_alive_connection_does_not_block_drain() {
    let server = GracefulServer::new(hello);
    let (addr, task) = serve_tcp(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    for _ in 0..3 {
        client.write_all(REQUEST).await.unwrap();
        read_until(&mut client, "hello").await;
    }
    eventually(|| server.outstanding() == 0).await;

    let states = server.connection_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].state, ConnState::Idle);
    assert!(!states[0].protected);

    server.close();
    finish(task).await;

    // Keep-alive was switched off, so the idle connection was closed.
    let mut rest = Vec::new();
    tokio::time::timeout(TIMEOUT, client.read_to_end(&mut rest))
        .await
        .expect("idle connection left open")
        .ok();
}

#[tokio::test]
async fn test_blocking_close_waits_for_drain() {
    let server = GracefulServer::new(hello);
    let (_addr, task) = serve_tcp(&server).await;

    server.start_routine();
    let closer = tokio::spawn({
        let server = server.clone();
        async move { server.blocking_close().await }
    });

    server.shutting_down().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!closer.is_finished());
    assert_eq!(server.state(), ServerState::ShuttingDown);

    server.finish_routine();
    let first = tokio::time::timeout(TIMEOUT, closer).await.unwrap().unwrap();
    assert!(first);
    assert!(!server.close());
    finish(task).await;
}

#[tokio::test]
async fn test_observer_sees_full_lifecycle() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let server = GracefulServer::new(hello);
    server.add_observer(Arc::new({
        let seen = Arc::clone(&seen);
        move |_conn: &ConnInfo, previous: ConnState, next: ConnState| {
            seen.lock().push((previous, next));
        }
    }));
    let (addr, task) = serve_tcp(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    eventually(|| seen.lock().last().map(|t| t.1) == Some(ConnState::Closed)).await;

    server.close();
    finish(task).await;

    let next: Vec<ConnState> = seen.lock().iter().map(|t| t.1).collect();
    assert_eq!(
        next,
        vec![ConnState::New, ConnState::Active, ConnState::Idle, ConnState::Closed]
    );
}

#[tokio::test]
async fn test_hijacked_listener_keeps_accepting() {
    let old = GracefulServer::new(hello);
    let (addr, old_task) = serve_tcp(&old).await;
    eventually(|| old.listener_fd().is_ok()).await;

    let successor = old
        .hijack_listener(
            |_req: Request<Body>| async { Response::new(body::full("successor")) },
            None,
        )
        .unwrap();
    assert_eq!(successor.local_addr(), Some(ListenAddr::Tcp(addr)));
    assert_ne!(successor.listener_fd().unwrap(), old.listener_fd().unwrap());

    let new_task = tokio::spawn({
        let successor = successor.clone();
        async move { successor.listen_and_serve().await }
    });

    old.close();
    finish(old_task).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(REQUEST).await.unwrap();
    read_until(&mut client, "successor").await;
    drop(client);

    successor.close();
    finish(new_task).await;
}

#[tokio::test]
async fn test_close_on_interrupt_without_signal_keeps_serving() {
    let server = GracefulServer::new(hello);
    server.close_on_interrupt(&[]).unwrap();
    let (addr, task) = serve_tcp(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(REQUEST).await.unwrap();
    read_until(&mut client, "hello").await;
    assert!(server.signal_received().is_none());

    server.close();
    finish(task).await;
    assert!(server.signal_received().is_none());
}

fn fcgi_record(kind: u8, id: u16, content: &[u8]) -> Vec<u8> {
    let mut out = vec![1, kind];
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&(content.len() as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(content);
    out
}

fn fcgi_pair(name: &str, value: &str) -> Vec<u8> {
    let mut out = vec![name.len() as u8, value.len() as u8];
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(value.as_bytes());
    out
}

#[tokio::test]
async fn test_fastcgi_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.sock");
    let bind = path.to_str().unwrap().to_string();

    let server = GracefulServer::new(|req: Request<Body>| async move {
        Response::new(body::full(format!("path={}", req.uri().path())))
    });
    let bound = listener::listen(&bind).await.unwrap();
    let task = tokio::spawn({
        let server = server.clone();
        async move { server.serve(bound).await }
    });

    let mut params = fcgi_pair("REQUEST_METHOD", "GET");
    params.extend(fcgi_pair("REQUEST_URI", "/drain"));
    params.extend(fcgi_pair("SERVER_PROTOCOL", "HTTP/1.1"));

    let mut request = fcgi_record(1, 1, &[0, 1, 0, 0, 0, 0, 0, 0]);
    request.extend(fcgi_record(4, 1, &params));
    request.extend(fcgi_record(4, 1, &[]));
    request.extend(fcgi_record(5, 1, &[]));

    let mut client = UnixStream::connect(&path).await.unwrap();
    client.write_all(&request).await.unwrap();
    let mut raw = Vec::new();
    tokio::time::timeout(TIMEOUT, client.read_to_end(&mut raw))
        .await
        .expect("fastcgi response timed out")
        .unwrap();

    let mut stdout = Vec::new();
    let mut ended = false;
    let mut rest = raw.as_slice();
    while rest.len() >= 8 {
        let kind = rest[1];
        let len = u16::from_be_bytes([rest[4], rest[5]]) as usize;
        let padding = rest[6] as usize;
        let content = &rest[8..8 + len];
        match kind {
            6 => stdout.extend_from_slice(content),
            3 => ended = true,
            _ => {}
        }
        rest = &rest[8 + len + padding..];
    }
    let stdout = String::from_utf8(stdout).unwrap();
    assert!(ended);
    assert!(stdout.starts_with("Status: 200 OK\r\n"));
    assert!(stdout.ends_with("path=/drain"));

    server.close();
    finish(task).await;
}

type Transitions = Arc<parking_lot::Mutex<Vec<(ConnState, ConnState)>>>;

fn record_transitions(server: &GracefulServer) -> Transitions {
    let seen: Transitions = Arc::default();
    server.add_observer(Arc::new({
        let seen = Arc::clone(&seen);
        move |_conn: &ConnInfo, previous: ConnState, next: ConnState| {
            seen.lock().push((previous, next));
        }
    }));
    seen
}

/// Answers every request with 101 and echoes bytes on the upgraded stream.
fn echo_upgrade(mut req: Request<Body>) -> impl std::future::Future<Output = Response<Body>> + Send {
    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let Ok(upgraded) = on_upgrade.await else {
            return;
        };
        let mut io = TokioIo::new(upgraded);
        let mut buf = [0u8; 64];
        loop {
            match io.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if io.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    async {
        let mut response = Response::new(body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        response.headers_mut().insert(CONNECTION, "upgrade".parse().unwrap());
        response.headers_mut().insert(UPGRADE, "echo".parse().unwrap());
        response
    }
}

#[tokio::test]
async fn test_upgraded_connection_is_hijacked_and_outlives_drain() {
    let server = GracefulServer::new(echo_upgrade);
    let seen = record_transitions(&server);
    let (addr, task) = serve_tcp(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /ws HTTP/1.1\r\nHost: test\r\nConnection: upgrade\r\nUpgrade: echo\r\n\r\n")
        .await
        .unwrap();
    let head = read_until(&mut client, "\r\n\r\n").await;
    assert!(head.starts_with("HTTP/1.1 101"));

    eventually(|| seen.lock().last().map(|t| t.1) == Some(ConnState::Hijacked)).await;
    assert_eq!(
        *seen.lock(),
        vec![
            (ConnState::New, ConnState::New),
            (ConnState::New, ConnState::Active),
            (ConnState::Active, ConnState::Hijacked),
        ]
    );
    assert_eq!(server.outstanding(), 0);
    assert!(server.connection_states().is_empty());

    // The hijacked socket belongs to the handler now, so it does not hold
    // back the drain and stays usable after it.
    server.close();
    finish(task).await;
    assert_eq!(server.state(), ServerState::Drained);

    client.write_all(b"ping").await.unwrap();
    read_until(&mut client, "ping").await;
}

fn tls_data(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/data").join(name)
}

fn tls_server_config() -> ServerConfig {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(tls_data("localhost.pem")).unwrap()))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(tls_data("localhost-key.pem")).unwrap()))
        .unwrap()
        .unwrap();
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap()
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(File::open(tls_data("ca.pem")).unwrap())) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn test_tls_listener_cannot_be_cloned() {
    let bound = listener::listen("127.0.0.1:0").await.unwrap();
    let tls = bound.with_tls(acceptor_from_config(tls_server_config())).unwrap();
    let listener = DrainingListener::new(tls);

    let err = listener.try_clone().unwrap_err();
    assert!(matches!(err, ListenerError::Clone(ref e) if e.kind() == io::ErrorKind::Unsupported));

    // The plaintext socket underneath can still be handed on.
    assert!(listener.try_clone_transport().is_ok());
}

#[tokio::test]
async fn test_tls_serving_drains() {
    let server = GracefulServer::with_settings(
        hello,
        ServerSettings {
            addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        },
    );
    let task = tokio::spawn({
        let server = server.clone();
        async move { server.listen_and_serve_tls_with_config(tls_server_config()).await }
    });
    eventually(|| server.local_addr().is_some()).await;
    let Some(ListenAddr::Tcp(addr)) = server.local_addr() else {
        panic!("expected a TCP listener");
    };

    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut client = tls_connector()
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();

    for _ in 0..2 {
        client.write_all(REQUEST).await.unwrap();
        let response = read_until(&mut client, "hello").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
    }
    eventually(|| server.outstanding() == 0).await;

    server.close();
    finish(task).await;
    assert_eq!(server.state(), ServerState::Drained);

    let mut rest = Vec::new();
    tokio::time::timeout(TIMEOUT, client.read_to_end(&mut rest))
        .await
        .expect("idle TLS connection left open")
        .ok();
    assert!(rest.is_empty());
}

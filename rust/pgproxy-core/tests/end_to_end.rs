//! Exercises whole sessions over real TCP sockets: allow-and-forward,
//! deny-with-fatal-frame, cancel forwarding, and a byte-for-byte relay
//! once authorized. Where a real PostgreSQL backend is available,
//! `pgproxy_testkit` spins one up and the authorized case relays all
//! the way to a live `AuthenticationOk`.

use std::sync::Arc;
use std::time::Duration;

use pgproxy_authorize::{AlwaysAllowAuthorizer, AlwaysDenyAuthorizer};
use pgproxy_core::{Session, SessionConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn startup_message(user: &str, database: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0x00, 0x03, 0x00, 0x00]);
    body.extend_from_slice(b"user\0");
    body.extend_from_slice(user.as_bytes());
    body.push(0);
    body.extend_from_slice(b"database\0");
    body.extend_from_slice(database.as_bytes());
    body.push(0);
    body.push(0);
    let len = (body.len() + 4) as u32;
    let mut out = Vec::new();
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    out
}

async fn spawn_proxy<A>(upstream: String, authorizer: Arc<A>) -> std::net::SocketAddr
where
    A: pgproxy_authorize::Authorizer + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = SessionConfig {
        upstream,
        op_timeout: Duration::from_secs(5),
        max_chain: 10_000_000,
        tls: None,
    };
    tokio::spawn(async move {
        let (client, peer_addr) = listener.accept().await.unwrap();
        Session::new(0, client, peer_addr, config, authorizer)
            .run()
            .await;
    });
    addr
}

/// A denied StartupMessage gets a fatal error frame, and the backend
/// never sees any bytes at all.
#[tokio::test]
async fn denied_session_never_reaches_backend() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    let backend_saw_bytes = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = backend_saw_bytes.clone();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = backend_listener.accept().await {
            let mut buf = [0u8; 1];
            if let Ok(n) = stream.read(&mut buf).await {
                if n > 0 {
                    flag.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            }
        }
    });

    let proxy_addr = spawn_proxy(backend_addr.to_string(), Arc::new(AlwaysDenyAuthorizer)).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(&startup_message("alice", "db1"))
        .await
        .unwrap();

    let mut reply = vec![0u8; 128];
    let n = client.read(&mut reply).await.unwrap();
    assert_eq!(reply[0], b'E');
    assert!(reply[..n].windows(5).any(|w| w == b"28000"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!backend_saw_bytes.load(std::sync::atomic::Ordering::SeqCst));
}

/// An allowed StartupMessage is forwarded verbatim, and once relaying
/// starts, post-startup bytes pass through byte-for-byte in both
/// directions.
#[tokio::test]
async fn authorized_session_relays_byte_for_byte() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    let msg = startup_message("alice", "db1");
    let expected_startup = msg.clone();

    tokio::spawn(async move {
        let (mut backend, _) = backend_listener.accept().await.unwrap();
        let mut got = vec![0u8; expected_startup.len()];
        backend.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected_startup);

        // AuthenticationOk, then echo one query-response chain back.
        backend.write_all(&[b'R', 0, 0, 0, 8, 0, 0, 0, 0]).await.unwrap();
        let mut query = vec![0u8; 11];
        backend.read_exact(&mut query).await.unwrap();
        backend.write_all(&query).await.unwrap();
    });

    let proxy_addr = spawn_proxy(backend_addr.to_string(), Arc::new(AlwaysAllowAuthorizer)).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&msg).await.unwrap();

    let mut auth_ok = [0u8; 9];
    client.read_exact(&mut auth_ok).await.unwrap();
    assert_eq!(auth_ok[0], b'R');

    let query = [b'Q', 0, 0, 0, 7, b'A', b'B'];
    client.write_all(&query).await.unwrap();
    let mut echoed = [0u8; 7];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, query);
}

/// An unrecognized startup discriminator (protocol 2) is rejected with
/// an "old client" message.
#[tokio::test]
async fn protocol_2_is_rejected_with_old_client_message() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = backend_listener.accept().await;
    });

    let proxy_addr = spawn_proxy(backend_addr.to_string(), Arc::new(AlwaysAllowAuthorizer)).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(&[0x00, 0x00, 0x00, 0x08, 0x00, 0x02, 0x00, 0x00])
        .await
        .unwrap();

    let mut reply = vec![0u8; 128];
    let n = client.read(&mut reply).await.unwrap();
    assert!(String::from_utf8_lossy(&reply[..n]).contains("old client"));
}

/// A CancelRequest is forwarded verbatim and the session ends without
/// ever spawning relay halves.
#[tokio::test]
async fn cancel_request_forwarded_and_session_ends() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    let cancel = {
        let mut msg = vec![0x00, 0x00, 0x00, 0x10, 0x04, 0xd2, 0x16, 0x2e];
        msg.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 2]);
        msg
    };
    let expected = cancel.clone();

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut backend, _) = backend_listener.accept().await.unwrap();
        let mut got = vec![0u8; expected.len()];
        backend.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        let _ = done_tx.send(());
    });

    let proxy_addr = spawn_proxy(backend_addr.to_string(), Arc::new(AlwaysAllowAuthorizer)).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&cancel).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .expect("backend should observe the forwarded cancel request")
        .unwrap();
}

/// Full relay against a real `postgres` backend, skipped when one
/// isn't available on this machine.
#[tokio::test]
async fn authorizes_and_authenticates_against_real_postgres() {
    let Ok(Some(process)) = pgproxy_testkit::setup_postgres(false) else {
        eprintln!("skipping: no local postgres install");
        return;
    };

    let upstream = match &process.socket_address {
        pgproxy_testkit::ListenAddress::Tcp(addr) => addr.to_string(),
        pgproxy_testkit::ListenAddress::Unix(path) => path.display().to_string(),
    };

    let proxy_addr = spawn_proxy(upstream, Arc::new(AlwaysAllowAuthorizer)).await;
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(&startup_message(
            pgproxy_testkit::DEFAULT_USERNAME,
            pgproxy_testkit::DEFAULT_DATABASE,
        ))
        .await
        .unwrap();

    assert_eq!(client.read_u8().await.unwrap(), b'R');
}

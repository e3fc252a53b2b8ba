//! End-to-end exercises against a fully bound orchestrator.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use bootherd::{Addressing, Orchestrator, OrchestratorConfig, ShutdownHandle};

const OWN_PATH: &str = "00:11:22:33:44:55/PXEClient:Arch:00000:UNDI:002001/[iPXE]";

fn test_config(root: &Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(
        root.to_path_buf(),
        Ipv4Addr::new(127, 0, 0, 1),
        Addressing::Proxy,
    );
    config.dhcp_port = 0;
    config.tftp_port = 0;
    config.http_port = 0;
    config.pxe_port = 0;
    config
}

struct Running {
    tftp: SocketAddr,
    http: SocketAddr,
    handle: ShutdownHandle,
    serve: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn start(root: &Path) -> Running {
    let (orchestrator, handle) = Orchestrator::bind(test_config(root)).await.unwrap();
    let tftp_port = orchestrator.tftp_addr().unwrap().port();
    let http_port = orchestrator.http_addr().unwrap().port();
    let serve = tokio::spawn(orchestrator.serve());
    Running {
        tftp: SocketAddr::from((Ipv4Addr::LOCALHOST, tftp_port)),
        http: SocketAddr::from((Ipv4Addr::LOCALHOST, http_port)),
        handle,
        serve,
    }
}

fn rrq(filename: &str, options: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = vec![0u8, 1];
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(b"octet\0");
    for (name, value) in options {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
    }
    buf
}

/// Fetch a file over TFTP, acknowledging every block. Returns the body, or
/// the error message the server sent.
async fn tftp_get(server: SocketAddr, filename: &str) -> Result<Vec<u8>, (u16, String)> {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&rrq(filename, &[]), server).await.unwrap();

    let mut body = Vec::new();
    let mut buf = [0u8; 1500];
    loop {
        let (len, from) = tokio::time::timeout(
            Duration::from_secs(5),
            client.recv_from(&mut buf),
        )
        .await
        .expect("server reply")
        .unwrap();
        match u16::from_be_bytes([buf[0], buf[1]]) {
            3 => {
                body.extend_from_slice(&buf[4..len]);
                client
                    .send_to(&[0, 4, buf[2], buf[3]], from)
                    .await
                    .unwrap();
                if len - 4 < 512 {
                    return Ok(body);
                }
            }
            5 => {
                let code = u16::from_be_bytes([buf[2], buf[3]]);
                let message = String::from_utf8_lossy(&buf[4..len - 1]).into_owned();
                return Err((code, message));
            }
            op => panic!("unexpected opcode {op}"),
        }
    }
}

async fn http_get(server: SocketAddr, path: &str) -> (String, String) {
    let mut stream = TcpStream::connect(server).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    let status = head.lines().next().unwrap().to_string();
    (status, body.to_string())
}

#[tokio::test]
async fn recognized_client_gets_menu_over_tftp() {
    let root = tempfile::tempdir().unwrap();
    let running = start(root.path()).await;

    let body = tftp_get(running.tftp, OWN_PATH).await.unwrap();
    let script = String::from_utf8(body).unwrap();
    assert!(script.starts_with("#!ipxe"));
    assert!(script.contains("menu iPXE boot menu"));
    assert!(script.contains("/ipxe?uuid=${uuid}"));

    running.handle.shutdown();
    running.serve.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_class_is_refused_over_tftp() {
    let root = tempfile::tempdir().unwrap();
    let running = start(root.path()).await;

    let path = "00:11:22:33:44:55/PXEClient:Arch:00007:UNDI:003016/[]";
    let (code, message) = tftp_get(running.tftp, path).await.unwrap_err();
    assert_eq!(code, 1); // file not found
    assert!(message.contains("PXEClient:Arch:00007"));

    // A garbage path is refused the same way.
    let (code, _) = tftp_get(running.tftp, "garbage").await.unwrap_err();
    assert_eq!(code, 1);

    running.handle.shutdown();
    running.serve.await.unwrap().unwrap();
}

#[tokio::test]
async fn http_serves_menu_when_downstream_has_no_answer() {
    let root = tempfile::tempdir().unwrap();
    let running = start(root.path()).await;

    let (status, body) = http_get(running.http, "/ipxe?type=worker").await;
    assert!(status.contains("200"), "{status}");
    assert!(body.starts_with("#!ipxe"));
    assert!(body.contains("choose --timeout 0 --default worker"));

    running.handle.shutdown();
    running.serve.await.unwrap().unwrap();
}

#[tokio::test]
async fn http_passes_downstream_answers_through() {
    let root = tempfile::tempdir().unwrap();
    let assets = root.path().join("assets");
    std::fs::create_dir(&assets).unwrap();
    std::fs::write(assets.join("ipxe"), "#!ipxe\nkernel from-disk\n").unwrap();
    std::fs::write(assets.join("vmlinuz"), "kernel-bytes").unwrap();
    let running = start(root.path()).await;

    // The downstream can answer /ipxe; its response must arrive untouched.
    let (status, body) = http_get(running.http, "/ipxe").await;
    assert!(status.contains("200"), "{status}");
    assert_eq!(body, "#!ipxe\nkernel from-disk\n");

    // Other paths never involve the menu layer.
    let (status, body) = http_get(running.http, "/vmlinuz").await;
    assert!(status.contains("200"), "{status}");
    assert_eq!(body, "kernel-bytes");
    let (status, _) = http_get(running.http, "/missing").await;
    assert!(status.contains("404"), "{status}");

    running.handle.shutdown();
    running.serve.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_wins_when_nothing_failed() {
    let root = tempfile::tempdir().unwrap();
    let running = start(root.path()).await;

    // Repeated shutdowns are harmless.
    running.handle.shutdown();
    running.handle.shutdown();
    let result = running.serve.await.unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn bind_conflict_aborts_startup() {
    let root = tempfile::tempdir().unwrap();
    let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let mut config = test_config(root.path());
    config.http_port = taken.local_addr().unwrap().port();

    let result = Orchestrator::bind(config).await;
    assert!(result.is_err());
}

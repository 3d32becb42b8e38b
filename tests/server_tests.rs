//! End-to-end tests for the control-plane server.
//!
//! Each test runs a daemon on an ephemeral port against a temp rootfs and
//! speaks the wire protocol over a real TCP connection. The guest init is a
//! shell script; boot completion is simulated by connecting to the boot
//! latch socket the way the real guest does.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, UnixStream};
use twoyi_host::server::{self, Daemon, ServerConfig};

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    _temp: TempDir,
    daemon: Arc<Daemon>,
    addr: std::net::SocketAddr,
    data_dir: PathBuf,
}

/// Builds a daemon over a temp rootfs and serves it on an ephemeral port.
async fn harness(init_script: Option<&str>) -> Harness {
    let temp = TempDir::new().unwrap();
    let data_dir = temp.path().join("data");
    let rootfs = data_dir.join("rootfs");
    std::fs::create_dir_all(&rootfs).unwrap();

    if let Some(script) = init_script {
        write_init(&rootfs, script);
    }

    let daemon = Daemon::new(ServerConfig {
        listen: String::new(), // tests bind their own listener
        rootfs,
        data_dir: data_dir.clone(),
        launcher: None,
        loader: None,
        width: 720,
        height: 1280,
        dpi: 320,
        stream_screen: false,
        scrcpy_mode: false,
        verbose: false,
        reap_orphans: false,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(Arc::clone(&daemon), listener));

    Harness {
        _temp: temp,
        daemon,
        addr,
        data_dir,
    }
}

fn write_init(rootfs: &Path, script: &str) {
    let init = rootfs.join("init");
    std::fs::write(&init, script).unwrap();
    std::fs::set_permissions(&init, std::fs::Permissions::from_mode(0o755)).unwrap();
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn read_json(&mut self) -> serde_json::Value {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(30), self.reader.read_line(&mut line))
            .await
            .expect("read timed out")
            .unwrap();
        assert!(n > 0, "connection closed unexpectedly");
        serde_json::from_str(line.trim()).expect("server sent invalid JSON")
    }

    /// Reads lines until a message of one of the given types arrives,
    /// skipping pushed status updates.
    async fn read_until_type(&mut self, types: &[&str]) -> serde_json::Value {
        loop {
            let value = self.read_json().await;
            let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
            if types.contains(&kind) {
                return value;
            }
        }
    }
}

// =============================================================================
// Banner
// =============================================================================

#[tokio::test]
async fn banner_is_the_first_line() {
    let h = harness(Some("#!/bin/sh\nexit 0\n")).await;
    let mut client = Client::connect(h.addr).await;

    let banner = client.read_json().await;
    for key in [
        "status",
        "width",
        "height",
        "setup_mode",
        "streaming",
        "scrcpy_mode",
    ] {
        assert!(banner.get(key).is_some(), "banner missing {key}");
    }
    assert_eq!(banner["status"], "setup_mode");
    assert_eq!(banner["width"], 720);
    assert_eq!(banner["height"], 1280);
    assert_eq!(banner["setup_mode"], true);
    assert_eq!(banner["streaming"], false);
}

// =============================================================================
// Request / Response
// =============================================================================

#[tokio::test]
async fn ping_get_status_and_input_events() {
    let h = harness(Some("#!/bin/sh\nexit 0\n")).await;
    let mut client = Client::connect(h.addr).await;
    client.read_json().await; // banner

    client.send(r#"{"type":"Ping"}"#).await;
    assert_eq!(client.read_json().await["type"], "Pong");

    client.send(r#"{"type":"GetStatus"}"#).await;
    let status = client.read_json().await;
    assert_eq!(status["type"], "Status");
    assert_eq!(status["container_running"], false);
    assert_eq!(status["width"], 720);

    client
        .send(r#"{"type":"TouchEvent","action":0,"x":10.0,"y":20.0,"pointer_id":0,"pressure":1.0}"#)
        .await;
    assert_eq!(client.read_json().await["type"], "Ok");

    client
        .send(r#"{"type":"KeyEvent","keycode":26,"pressed":true}"#)
        .await;
    assert_eq!(client.read_json().await["type"], "Ok");
}

#[tokio::test]
async fn responses_are_fifo_per_session() {
    let h = harness(Some("#!/bin/sh\nexit 0\n")).await;
    let mut client = Client::connect(h.addr).await;
    client.read_json().await; // banner

    // Two pipelined requests answered strictly in order.
    client
        .send("{\"type\":\"Ping\"}\n{\"type\":\"GetStatus\"}")
        .await;
    assert_eq!(client.read_json().await["type"], "Pong");
    assert_eq!(client.read_json().await["type"], "Status");
}

#[tokio::test]
async fn malformed_requests_keep_the_session_alive() {
    let h = harness(Some("#!/bin/sh\nexit 0\n")).await;
    let mut client = Client::connect(h.addr).await;
    client.read_json().await; // banner

    client.send("this is not json").await;
    assert_eq!(client.read_json().await["type"], "Error");

    client.send(r#"{"type":"NoSuchCommand"}"#).await;
    assert_eq!(client.read_json().await["type"], "Error");

    // The connection is still usable.
    client.send(r#"{"type":"Ping"}"#).await;
    assert_eq!(client.read_json().await["type"], "Pong");
}

#[tokio::test]
async fn sessions_are_independent() {
    let h = harness(Some("#!/bin/sh\nexit 0\n")).await;

    let mut a = Client::connect(h.addr).await;
    let mut b = Client::connect(h.addr).await;
    a.read_json().await;
    b.read_json().await;

    // Killing one session leaves the other working.
    drop(a);
    b.send(r#"{"type":"Ping"}"#).await;
    assert_eq!(b.read_json().await["type"], "Pong");
}

// =============================================================================
// Boot
// =============================================================================

#[tokio::test]
async fn boot_failure_when_init_exits_immediately() {
    let h = harness(Some("#!/bin/sh\nexit 1\n")).await;
    let mut client = Client::connect(h.addr).await;
    client.read_json().await; // banner

    client.send(r#"{"type":"StartContainer"}"#).await;
    let response = client
        .read_until_type(&["Error", "ContainerStarted"])
        .await;
    assert_eq!(response["type"], "Error");
    assert_eq!(
        response["message"],
        "Server did not start within timeout"
    );

    use twoyi_host::protocol::DaemonStatus;
    assert_eq!(h.daemon.status(), DaemonStatus::BootFailed);
}

#[tokio::test]
async fn boot_succeeds_when_guest_fires_the_latch() {
    let h = harness(Some("#!/bin/sh\nsleep 30\n")).await;
    let mut client = Client::connect(h.addr).await;
    client.read_json().await; // banner

    // Play the guest: connect to the boot latch once it appears.
    let latch_path = h.data_dir.join("socket/boot-done");
    let guest = tokio::spawn(async move {
        for _ in 0..100 {
            if UnixStream::connect(&latch_path).await.is_ok() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    });

    client.send(r#"{"type":"StartContainer"}"#).await;
    let response = client
        .read_until_type(&["Error", "ContainerStarted"])
        .await;
    assert_eq!(response["type"], "ContainerStarted", "boot failed: {response}");
    assert!(guest.await.unwrap(), "latch socket never appeared");

    client.send(r#"{"type":"GetStatus"}"#).await;
    let status = client.read_until_type(&["Status"]).await;
    assert_eq!(status["container_running"], true);

    // A second start while running is idempotent.
    client.send(r#"{"type":"StartContainer"}"#).await;
    let again = client
        .read_until_type(&["Error", "ContainerStarted"])
        .await;
    assert_eq!(again["type"], "ContainerStarted");

    server::shutdown(&h.daemon).await;
    assert!(!h.daemon.supervisor.is_running());
}

#[tokio::test]
async fn boot_prepares_rootfs_and_vendor_props() {
    let h = harness(Some("#!/bin/sh\nexit 1\n")).await;
    let mut client = Client::connect(h.addr).await;
    client.read_json().await; // banner

    client.send(r#"{"type":"StartContainer"}"#).await;
    client.read_until_type(&["Error", "ContainerStarted"]).await;

    // Even a failed boot has run the preparation steps.
    let rootfs = h.data_dir.join("rootfs");
    assert!(rootfs.join("dev/input").is_dir());
    assert!(rootfs.join("dev/socket").is_dir());
    let props = std::fs::read_to_string(rootfs.join("vendor/default.prop")).unwrap();
    assert!(props.contains("ro.sf.lcd_density=320"));
}

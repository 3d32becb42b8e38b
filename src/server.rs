//! Control-plane server.
//!
//! Accepts TCP connections and speaks the line-delimited JSON protocol from
//! [`crate::protocol`]. Every connection gets its own task and its own
//! outbound byte queue, drained by a single writer task; JSON lines and
//! binary screen frames therefore never interleave mid-message, and
//! responses on one session are strictly FIFO.
//!
//! `StartContainer` drives the full boot pipeline: install the rootfs if
//! needed, prepare boot files, spawn the guest and wait on the boot latch.
//! Sessions share no mutable state beyond the daemon context; a failure on
//! one session never affects its peers.

use crate::constants::{BOOT_TIMEOUT, MAX_REQUEST_LINE_LEN, SESSION_READ_TIMEOUT};
use crate::error::{Error, Result};
use crate::input::InputRouter;
use crate::kv::{self, KvStore};
use crate::profile::{Profile, ProfileStore};
use crate::protocol::{self, Banner, ClientMessage, DaemonStatus, ServerMessage};
use crate::rom::{self, RomInfo};
use crate::rootfs::{self, ensure_boot_files, init_rootfs, HostProps, InstallFlags, Installer};
use crate::screen::ScreenStreamer;
use crate::supervisor::{Supervisor, SupervisorConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Static daemon configuration, assembled by the binary from CLI arguments.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Control-plane bind endpoint, `host:port`.
    pub listen: String,
    /// Guest rootfs directory.
    pub rootfs: PathBuf,
    /// Daemon state directory (kv store, sockets, loader symlink, ROMs).
    pub data_dir: PathBuf,
    /// Binding launcher binary; the guest `./init` runs directly when unset.
    pub launcher: Option<PathBuf>,
    /// Renderer loader shared object.
    pub loader: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    /// Attach the screen streamer to every session.
    pub stream_screen: bool,
    /// Display goes through the scrcpy/ADB path.
    pub scrcpy_mode: bool,
    /// Forward guest output at info level.
    pub verbose: bool,
    /// Reap processes orphaned by a previous guest before each boot.
    pub reap_orphans: bool,
}

// =============================================================================
// Daemon Context
// =============================================================================

/// Daemon-scoped context shared by all sessions.
///
/// Everything a connection handler touches hangs off this value; there are
/// no process-wide singletons.
pub struct Daemon {
    pub cfg: ServerConfig,
    pub kv: Arc<KvStore>,
    pub profiles: Mutex<ProfileStore>,
    pub installer: Installer,
    pub supervisor: Arc<Supervisor>,
    pub input: Arc<InputRouter>,
    pub screen: Option<Arc<ScreenStreamer>>,
    /// Most-recent-wins status; sessions observe transitions through it.
    status: watch::Sender<DaemonStatus>,
    /// Serializes container starts across sessions.
    start_lock: tokio::sync::Mutex<()>,
}

impl Daemon {
    pub fn new(cfg: ServerConfig) -> Arc<Self> {
        let kv = Arc::new(KvStore::open(&cfg.data_dir));
        let profiles = ProfileStore::load(Arc::clone(&kv), &cfg.data_dir);
        let installer = Installer::new(Arc::clone(&kv), &cfg.data_dir.join("files"));
        let screen = cfg
            .stream_screen
            .then(|| ScreenStreamer::new(&cfg.rootfs, cfg.width, cfg.height));
        let (status, _) = watch::channel(DaemonStatus::SetupMode);

        Arc::new(Self {
            kv,
            profiles: Mutex::new(profiles),
            installer,
            supervisor: Supervisor::new(),
            input: InputRouter::new(),
            screen,
            status,
            start_lock: tokio::sync::Mutex::new(()),
            cfg,
        })
    }

    pub fn status(&self) -> DaemonStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: DaemonStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            info!(?previous, current = ?status, "daemon status changed");
        }
    }

    fn subscribe_status(&self) -> watch::Receiver<DaemonStatus> {
        self.status.subscribe()
    }

    /// Snapshot for `GetStatus` and status broadcasts.
    fn status_message(&self) -> ServerMessage {
        ServerMessage::Status {
            container_running: self.supervisor.is_running(),
            rootfs_path: self.cfg.rootfs.to_string_lossy().to_string(),
            width: self.cfg.width,
            height: self.cfg.height,
        }
    }
}

// =============================================================================
// Accept Loop
// =============================================================================

/// Binds the control listener and serves connections until cancelled.
pub async fn run(daemon: Arc<Daemon>) -> Result<()> {
    let listener = TcpListener::bind(&daemon.cfg.listen)
        .await
        .map_err(|e| Error::InvalidAddress {
            address: daemon.cfg.listen.clone(),
            reason: e.to_string(),
        })?;
    info!(listen = %daemon.cfg.listen, "control server listening");
    serve(daemon, listener).await
}

/// Serves connections on an already-bound listener.
pub async fn serve(daemon: Arc<Daemon>, listener: TcpListener) -> Result<()> {
    daemon
        .input
        .start(&daemon.cfg.rootfs, daemon.cfg.width, daemon.cfg.height);
    if let Some(screen) = &daemon.screen {
        screen.start();
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let daemon = Arc::clone(&daemon);
                tokio::spawn(async move {
                    handle_session(daemon, stream, peer).await;
                });
            }
            Err(e) => warn!(error = %e, "failed to accept connection"),
        }
    }
}

/// Stops the screen stream and the container; called on daemon shutdown.
pub async fn shutdown(daemon: &Arc<Daemon>) {
    if let Some(screen) = &daemon.screen {
        screen.stop();
    }
    daemon.supervisor.stop().await;
    daemon.set_status(DaemonStatus::SetupMode);
}

// =============================================================================
// Session
// =============================================================================

/// Serves one client connection until EOF, timeout or write failure.
async fn handle_session(daemon: Arc<Daemon>, stream: TcpStream, peer: SocketAddr) {
    info!(%peer, "client connected");

    let (read_half, write_half) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(write_loop(write_half, outbound_rx));

    // The banner is always the first line on the wire.
    let banner = Banner {
        status: daemon.status(),
        width: daemon.cfg.width,
        height: daemon.cfg.height,
        setup_mode: !daemon.supervisor.is_running(),
        streaming: daemon.screen.is_some(),
        scrcpy_mode: daemon.cfg.scrcpy_mode,
    };
    if outbound
        .send(protocol::to_json_line(&banner).into_bytes())
        .is_err()
    {
        writer.abort();
        return;
    }

    if let Some(screen) = &daemon.screen {
        screen.add_client(outbound.clone());
    }

    // Forward status transitions; a slow session only sees the latest value.
    let status_task = {
        let daemon = Arc::clone(&daemon);
        let outbound = outbound.clone();
        let mut status_rx = daemon.subscribe_status();
        tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let line = protocol::to_json_line(&daemon.status_message());
                if outbound.send(line.into_bytes()).is_err() {
                    break;
                }
            }
        })
    };

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::time::timeout(SESSION_READ_TIMEOUT, reader.read_line(&mut line)).await;
        let response = match read {
            Err(_) => {
                info!(%peer, "session idle timeout");
                break;
            }
            Ok(Ok(0)) => {
                info!(%peer, "client disconnected");
                break;
            }
            Ok(Ok(n)) if n > MAX_REQUEST_LINE_LEN => {
                ServerMessage::Error {
                    message: "request too large".to_string(),
                }
            }
            Ok(Ok(_)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ClientMessage>(trimmed) {
                    Ok(message) => dispatch(&daemon, message).await,
                    Err(e) => {
                        debug!(%peer, error = %e, "unparseable request");
                        ServerMessage::Error {
                            message: format!("invalid request: {e}"),
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "session read error");
                break;
            }
        };

        if outbound
            .send(protocol::to_json_line(&response).into_bytes())
            .is_err()
        {
            break;
        }
    }

    status_task.abort();
    // Dropping the senders lets the writer drain queued responses before it
    // ends; the screen streamer may still hold one, so bound the wait.
    drop(outbound);
    let mut writer = writer;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), &mut writer).await;
    writer.abort();
}

/// Drains a session's outbound queue into the socket, preserving order.
async fn write_loop(mut half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(chunk) = rx.recv().await {
        if half.write_all(&chunk).await.is_err() {
            break;
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

async fn dispatch(daemon: &Arc<Daemon>, message: ClientMessage) -> ServerMessage {
    match message {
        ClientMessage::StartContainer => start_container(daemon).await,
        ClientMessage::GetStatus => daemon.status_message(),
        ClientMessage::Ping => ServerMessage::Pong,
        ClientMessage::TouchEvent {
            action,
            x,
            y,
            pointer_id,
            pressure,
        } => {
            daemon.input.handle_touch(action, pointer_id, x, y, pressure);
            ServerMessage::Ok
        }
        ClientMessage::KeyEvent { keycode, pressed } => {
            daemon.input.handle_key(keycode, pressed);
            ServerMessage::Ok
        }
    }
}

/// Runs the boot pipeline: materialize, prepare, spawn, await the latch.
async fn start_container(daemon: &Arc<Daemon>) -> ServerMessage {
    let _guard = daemon.start_lock.lock().await;

    if daemon.supervisor.is_running() && daemon.supervisor.boot_completed() {
        return ServerMessage::ContainerStarted;
    }

    daemon.set_status(DaemonStatus::Boot);
    match boot(daemon).await {
        Ok(()) => {
            daemon.set_status(DaemonStatus::Running);
            {
                let mut profiles = daemon.profiles.lock().unwrap();
                let mut active = profiles.active().clone();
                active.touch();
                profiles.update(active);
            }

            // Fold the status back once the guest goes away on its own.
            let watcher = Arc::clone(daemon);
            tokio::spawn(async move {
                watcher.supervisor.wait_exited().await;
                watcher.set_status(DaemonStatus::SetupMode);
            });

            ServerMessage::ContainerStarted
        }
        Err(e) => {
            let (profile_id, profile_name) = {
                let profiles = daemon.profiles.lock().unwrap();
                let active = profiles.active();
                (active.id.clone(), active.name.clone())
            };
            let failure = daemon.supervisor.boot_failure(&profile_id, &profile_name);
            error!(
                profile = %failure.profile_id,
                name = %failure.profile_name,
                error = %e,
                "container boot failed"
            );
            for line in &failure.log_tail {
                error!(target: "guest", "{line}");
            }

            daemon.supervisor.stop().await;
            daemon.set_status(DaemonStatus::BootFailed);
            ServerMessage::Error {
                message: e.to_string(),
            }
        }
    }
}

/// The boot pipeline body; any error maps to a `boot_failed` transition.
async fn boot(daemon: &Arc<Daemon>) -> Result<()> {
    let (profile, use_third_party, verbose) = {
        let profiles = daemon.profiles.lock().unwrap();
        let active: Profile = profiles.active().clone();
        let use_third_party = active.use_third_party_rom
            || daemon.kv.get_bool(kv::USE_THIRD_PARTY_ROM, false);
        let verbose = daemon.cfg.verbose || active.verbose_debug;
        (active, use_third_party, verbose)
    };
    info!(profile = %profile.id, name = %profile.name, "starting container");

    let rootfs = daemon.cfg.rootfs.clone();
    let force_install = daemon.kv.get_bool(kv::FORCE_ROM_REINSTALL, false);

    // Install and boot preparation are blocking filesystem work.
    let ctx = Arc::clone(daemon);
    tokio::task::spawn_blocking(move || -> Result<()> {
        let current_exists = rootfs::rom_exists(&rootfs);
        let current = RomInfo::from_dir(&rootfs);
        let bundled = RomInfo::from_archive(ctx.installer.bundled_archive());
        let flags = InstallFlags {
            current_exists,
            // An upgrade needs an actually staged bundled ROM to upgrade to.
            needs_upgrade: bundled.is_valid() && rom::needs_upgrade(&current, &bundled),
            force_install,
            use_third_party,
        };
        ctx.installer.install(&rootfs, flags)?;
        init_rootfs(&rootfs, &HostProps::detect(ctx.cfg.dpi))?;
        ensure_boot_files(&rootfs, &ctx.cfg.data_dir, ctx.cfg.loader.as_deref())?;
        if ctx.cfg.reap_orphans {
            rootfs::kill_orphans();
        }
        Ok(())
    })
    .await
    .map_err(|e| Error::SpawnFailed(format!("boot preparation panicked: {e}")))??;

    if !rootfs::rom_exists(&daemon.cfg.rootfs) {
        return Err(Error::RootfsUnusable {
            path: daemon.cfg.rootfs.clone(),
            reason: "no init binary after install".to_string(),
        });
    }

    daemon.supervisor.start(&SupervisorConfig {
        rootfs: daemon.cfg.rootfs.clone(),
        data_dir: daemon.cfg.data_dir.clone(),
        launcher: daemon.cfg.launcher.clone(),
        bind: daemon.cfg.listen.clone(),
        loader: daemon.cfg.loader.clone(),
        width: daemon.cfg.width,
        height: daemon.cfg.height,
        dpi: daemon.cfg.dpi,
        verbose,
    })?;

    if daemon.supervisor.wait_boot(BOOT_TIMEOUT).await {
        Ok(())
    } else {
        Err(Error::BootTimeout)
    }
}

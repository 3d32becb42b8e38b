//! Guest container supervision.
//!
//! The supervisor owns the single guest `init` process a daemon instance may
//! run at a time. It spawns `./init` inside the rootfs under the binding
//! launcher environment, captures its merged stdout/stderr into a bounded
//! ring buffer, fans every line out on a broadcast channel, and exposes the
//! boot latch the guest fires when user-space is ready.
//!
//! ```text
//!  start() ──▶ spawn ./init ──▶ reader tasks ──▶ ring buffer (500 lines)
//!                  │                                  └──▶ broadcast
//!                  └──▶ boot latch listener (unix socket boot-done)
//!
//!  wait_boot(t) ──▶ latch fired        → true
//!                   child exited early → false
//!                   deadline elapsed   → false
//! ```
//!
//! Log subscribers receive lines through `tokio::sync::broadcast`; a slow or
//! panicking subscriber only lags its own receiver and can never stall the
//! reader task.

use crate::constants::{BOOT_DONE_SOCKET, BOOT_FAILURE_LOG_LINES, LOG_RING_CAPACITY,
    STOP_GRACE_PERIOD};
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How the supervisor launches and wires the guest.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Guest rootfs; the working directory of the spawned process.
    pub rootfs: PathBuf,
    /// Data directory holding the boot-done socket and loader symlink.
    pub data_dir: PathBuf,
    /// Binding launcher. When set, it is invoked with the stable argument
    /// vector (rootfs, bind endpoint, geometry, loader, verbosity); when
    /// unset the guest `./init` is executed directly.
    pub launcher: Option<PathBuf>,
    /// Control endpoint, handed to the launcher.
    pub bind: String,
    /// Renderer loader, exported to the guest as `TYLOADER`.
    pub loader: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    /// Forward guest output at info level instead of debug.
    pub verbose: bool,
}

/// Diagnostics captured when a boot fails.
#[derive(Debug, Clone)]
pub struct BootFailure {
    pub profile_id: String,
    pub profile_name: String,
    /// Most recent guest output lines.
    pub log_tail: Vec<String>,
}

/// Supervises at most one guest init process.
pub struct Supervisor {
    /// Pid of the running init, 0 when none.
    pid: AtomicU32,
    running: AtomicBool,
    boot_done: AtomicBool,
    boot_notify: Notify,
    exit_notify: Notify,
    ring: Mutex<VecDeque<String>>,
    log_tx: broadcast::Sender<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        let (log_tx, _) = broadcast::channel(LOG_RING_CAPACITY);
        Arc::new(Self {
            pid: AtomicU32::new(0),
            running: AtomicBool::new(false),
            boot_done: AtomicBool::new(false),
            boot_notify: Notify::new(),
            exit_notify: Notify::new(),
            ring: Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
            log_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// True while the guest init process is alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True once the guest has signalled boot completion.
    pub fn boot_completed(&self) -> bool {
        self.boot_done.load(Ordering::SeqCst)
    }

    /// Subscribes to live guest output lines.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.log_tx.subscribe()
    }

    /// Snapshot of the most recent `n` captured lines.
    pub fn last_lines(&self, n: usize) -> Vec<String> {
        let ring = self.ring.lock().unwrap();
        ring.iter().rev().take(n).rev().cloned().collect()
    }

    /// Builds a boot-failure report for the given profile identity.
    pub fn boot_failure(&self, profile_id: &str, profile_name: &str) -> BootFailure {
        BootFailure {
            profile_id: profile_id.to_string(),
            profile_name: profile_name.to_string(),
            log_tail: self.last_lines(BOOT_FAILURE_LOG_LINES),
        }
    }

    /// Spawns the guest init process. A second start while the guest is
    /// running is a no-op; the daemon never runs two containers.
    pub fn start(self: &Arc<Self>, cfg: &SupervisorConfig) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("container already running, start ignored");
            return Ok(());
        }
        // Clear leftovers of a previous run before wiring the new one.
        self.cleanup();

        if let Err(e) = self.spawn_boot_latch(cfg) {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let mut command = match &cfg.launcher {
            Some(launcher) => {
                let mut command = tokio::process::Command::new(launcher);
                command
                    .arg("--rootfs")
                    .arg(&cfg.rootfs)
                    .arg("--bind")
                    .arg(&cfg.bind)
                    .arg("--width")
                    .arg(cfg.width.to_string())
                    .arg("--height")
                    .arg(cfg.height.to_string());
                if let Some(loader) = &cfg.loader {
                    command.arg("--loader").arg(loader);
                }
                if cfg.verbose {
                    command.arg("--verbose");
                }
                command
            }
            None => tokio::process::Command::new("./init"),
        };
        command
            .current_dir(&cfg.rootfs)
            .env("REDROID_WIDTH", cfg.width.to_string())
            .env("REDROID_HEIGHT", cfg.height.to_string())
            .env("REDROID_DPI", cfg.dpi.to_string())
            .env("REDROID_ADB_ENABLED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(loader) = &cfg.loader {
            command.env("TYLOADER", loader);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                // The boot latch is already listening; tear it down like
                // every other shutdown path does.
                self.cleanup();
                self.running.store(false, Ordering::SeqCst);
                return Err(Error::SpawnFailed(e.to_string()));
            }
        };

        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);
        info!(pid, rootfs = %cfg.rootfs.display(), "container init spawned");

        let verbose = cfg.verbose;
        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(stdout, "stdout", verbose);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(stderr, "stderr", verbose);
        }

        // Monitor task owns the child; stop() signals it by pid.
        let this = Arc::clone(self);
        let monitor = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(%status, "container init exited"),
                Err(e) => error!(error = %e, "failed to wait for container init"),
            }
            this.pid.store(0, Ordering::SeqCst);
            this.running.store(false, Ordering::SeqCst);
            this.exit_notify.notify_waiters();
        });
        self.tasks.lock().unwrap().push(monitor);

        Ok(())
    }

    /// Listens on the boot-done socket; the guest connects once user-space
    /// is ready.
    fn spawn_boot_latch(self: &Arc<Self>, cfg: &SupervisorConfig) -> Result<()> {
        let socket_path = cfg.data_dir.join(BOOT_DONE_SOCKET);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| Error::SpawnFailed(format!("cannot bind boot latch: {e}")))?;

        let this = Arc::clone(self);
        let latch = tokio::spawn(async move {
            match listener.accept().await {
                Ok(_) => {
                    info!("guest signalled boot completion");
                    this.boot_done.store(true, Ordering::SeqCst);
                    this.boot_notify.notify_waiters();
                }
                Err(e) => debug!(error = %e, "boot latch listener closed"),
            }
        });
        self.tasks.lock().unwrap().push(latch);
        Ok(())
    }

    /// Drains one guest output stream into the ring buffer and broadcast.
    fn spawn_reader(
        self: &Arc<Self>,
        stream: impl AsyncRead + Unpin + Send + 'static,
        label: &'static str,
        verbose: bool,
    ) {
        let this = Arc::clone(self);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if verbose {
                            info!(stream = label, "{line}");
                        } else {
                            debug!(stream = label, "{line}");
                        }
                        this.push_line(line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(stream = label, error = %e, "guest stream read error");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(reader);
    }

    fn push_line(&self, line: String) {
        {
            let mut ring = self.ring.lock().unwrap();
            if ring.len() >= LOG_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(line.clone());
        }
        // Receivers that lag simply drop old lines; send never blocks.
        let _ = self.log_tx.send(line);
    }

    /// Blocks until the guest signals boot completion or the deadline
    /// elapses. Returns false on timeout and on premature guest exit.
    pub async fn wait_boot(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.boot_done.load(Ordering::SeqCst) {
                return true;
            }
            if !self.running.load(Ordering::SeqCst) {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.boot_done.load(Ordering::SeqCst);
            }
            // The tick bounds the window where a notification can slip in
            // between the flag check and the select registration.
            let tick = remaining.min(Duration::from_millis(100));
            tokio::select! {
                _ = self.boot_notify.notified() => {}
                _ = self.exit_notify.notified() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    /// Resolves once the guest init process is gone.
    pub async fn wait_exited(&self) {
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.exit_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }

    /// Terminates the guest: SIGTERM, a grace period, then SIGKILL.
    pub async fn stop(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            self.cleanup();
            return;
        }

        info!(pid, "stopping container");
        // SAFETY: kill with a plain signal is safe for any pid value.
        unsafe { libc::kill(pid as i32, libc::SIGTERM) };

        let deadline = Instant::now() + STOP_GRACE_PERIOD;
        while self.running.load(Ordering::SeqCst) && Instant::now() < deadline {
            tokio::select! {
                _ = self.exit_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        if self.running.load(Ordering::SeqCst) {
            warn!(pid, "container did not exit in time, sending SIGKILL");
            // SAFETY: as above.
            unsafe { libc::kill(pid as i32, libc::SIGKILL) };
            while self.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = self.exit_notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
        }

        self.cleanup();
    }

    /// Aborts helper tasks and resets the latch for the next start.
    fn cleanup(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.pid.store(0, Ordering::SeqCst);
        self.boot_done.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_boot_fails_fast_when_not_running() {
        let supervisor = Supervisor::new();
        assert!(!supervisor.wait_boot(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn ring_buffer_is_bounded() {
        let supervisor = Supervisor::new();
        for i in 0..LOG_RING_CAPACITY + 20 {
            supervisor.push_line(format!("line {i}"));
        }
        let lines = supervisor.last_lines(LOG_RING_CAPACITY + 20);
        assert_eq!(lines.len(), LOG_RING_CAPACITY);
        assert_eq!(lines[0], "line 20");
        assert_eq!(lines.last().unwrap(), &format!("line {}", LOG_RING_CAPACITY + 19));
    }

    #[tokio::test]
    async fn subscribers_receive_lines() {
        let supervisor = Supervisor::new();
        let mut rx = supervisor.subscribe();
        supervisor.push_line("hello".to_string());
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn boot_failure_carries_log_tail() {
        let supervisor = Supervisor::new();
        supervisor.push_line("panic in guest".to_string());
        let failure = supervisor.boot_failure("default", "Default");
        assert_eq!(failure.profile_id, "default");
        assert_eq!(failure.log_tail, vec!["panic in guest".to_string()]);
    }
}

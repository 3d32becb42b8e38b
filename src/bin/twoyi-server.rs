//! twoyi-server - standalone container host daemon.
//!
//! Hosts the guest Android rootfs and exposes the control plane over TCP:
//! lifecycle commands, status, input events and (optionally) a framed screen
//! stream. Rendering is consumed remotely; connect a client to the listen
//! address and issue `StartContainer`.
//!
//! ```sh
//! twoyi-server --rootfs /data/twoyi/rootfs \
//!              --listen 0.0.0.0:9876 --width 720 --height 1280
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use twoyi_host::server::{self, Daemon, ServerConfig};
use twoyi_host::{
    extract, renderer, rootfs, DEFAULT_DPI, DEFAULT_HEIGHT, DEFAULT_LISTEN_ADDRESS, DEFAULT_WIDTH,
    INIT_BINARY,
};

#[derive(Parser, Debug)]
#[command(name = "twoyi-server")]
#[command(about = "twoyi container host daemon

Runs the guest Android userspace as an unprivileged process tree and exposes
lifecycle, input and screen streaming over a line-delimited JSON protocol.")]
struct Args {
    /// Guest rootfs directory
    #[arg(short = 'r', long)]
    rootfs: PathBuf,

    /// Control-plane bind endpoint
    #[arg(short = 'b', long, default_value = DEFAULT_LISTEN_ADDRESS)]
    listen: String,

    /// Screen width reported in the banner and applied to the guest
    #[arg(short = 'W', long, default_value_t = DEFAULT_WIDTH)]
    width: u32,

    /// Screen height reported in the banner and applied to the guest
    #[arg(short = 'H', long, default_value_t = DEFAULT_HEIGHT)]
    height: u32,

    /// Screen density applied to the guest
    #[arg(short = 'd', long, default_value_t = DEFAULT_DPI)]
    dpi: u32,

    /// Renderer loader library (libloader.so)
    #[arg(short = 'l', long)]
    loader: Option<PathBuf>,

    /// Binding launcher binary; the guest init runs directly when omitted
    #[arg(long)]
    launcher: Option<PathBuf>,

    /// Archive to materialize into --rootfs before starting
    #[arg(long, value_name = "ARCHIVE")]
    extract_rootfs: Option<PathBuf>,

    /// Daemon state directory (defaults to the rootfs parent)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Attach the screen streamer to every control session
    #[arg(long)]
    stream: bool,

    /// Start without requiring an initialized rootfs (manual setup)
    #[arg(short = 's', long)]
    setup: bool,

    /// Verbose logging, including guest output
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "debug,twoyi_host=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        rootfs = %args.rootfs.display(),
        listen = %args.listen,
        "twoyi-server starting"
    );
    info!(
        width = args.width,
        height = args.height,
        dpi = args.dpi,
        "display geometry"
    );

    if let Some(archive) = &args.extract_rootfs {
        info!(archive = %archive.display(), "materializing rootfs before start");
        let archive = archive.clone();
        let target = args.rootfs.clone();
        tokio::task::spawn_blocking(move || extract::extract_archive(&archive, &target))
            .await
            .context("extraction task failed")?
            .context("rootfs extraction failed")?;
    }

    if !args.rootfs.is_dir() {
        anyhow::bail!("rootfs directory does not exist: {}", args.rootfs.display());
    }
    if !args.setup && !args.rootfs.join(INIT_BINARY).is_file() {
        anyhow::bail!(
            "init binary not found at {}; extract a ROM first or pass --setup",
            args.rootfs.join(INIT_BINARY).display()
        );
    }

    // Resolving the loader early surfaces a broken library as a startup
    // error instead of a boot failure later.
    if let Some(loader) = &args.loader {
        // SAFETY: the operator-provided loader path is trusted by contract.
        let bridge = unsafe { renderer::RendererBridge::load(loader) };
        match bridge {
            Ok(_) => info!(loader = %loader.display(), "renderer loader validated"),
            Err(e) => anyhow::bail!("renderer loader rejected: {e}"),
        }
    }

    let data_dir = args.data_dir.clone().unwrap_or_else(|| {
        args.rootfs
            .parent()
            .map(|p| p.to_path_buf())
            .or_else(|| dirs::data_local_dir().map(|d| d.join("twoyi")))
            .unwrap_or_else(|| PathBuf::from("."))
    });
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;

    if args.setup {
        info!("setup mode: the container will not be started automatically");
        rootfs::ensure_boot_files(&args.rootfs, &data_dir, args.loader.as_deref())?;
    }

    let daemon = Daemon::new(ServerConfig {
        listen: args.listen,
        rootfs: args.rootfs,
        data_dir,
        launcher: args.launcher,
        loader: args.loader,
        width: args.width,
        height: args.height,
        dpi: args.dpi,
        stream_screen: args.stream,
        scrcpy_mode: false,
        verbose: args.verbose,
        reap_orphans: true,
    });

    let serve = server::run(Arc::clone(&daemon));
    tokio::select! {
        result = serve => {
            result.context("control server failed")?;
        }
        _ = signal::ctrl_c() => {
            info!("received shutdown signal, stopping");
        }
    }

    server::shutdown(&daemon).await;
    info!("twoyi-server stopped");
    Ok(())
}

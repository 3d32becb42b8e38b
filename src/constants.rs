//! Constants for the container host daemon.
//!
//! All limits, timeouts, file names and well-known paths are defined here to
//! ensure consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// ROM Archives
// =============================================================================

/// File name of the bundled ROM archive, staged under `<data>/files/`.
pub const BUNDLED_ROM_NAME: &str = "rootfs.tar.gz";

/// File name of a sideloaded third-party ROM archive.
pub const THIRD_PARTY_ROM_NAME: &str = "rootfs_3rd.tar.gz";

/// ROM metadata file, found at the root of an archive or rootfs.
pub const ROM_INFO_FILE: &str = "rom.ini";

/// Fallback value for ROM metadata fields that are absent or unreadable.
pub const ROM_INFO_DEFAULT: &str = "unknown";

// =============================================================================
// Rootfs Layout
// =============================================================================

/// The guest entry point; a rootfs is initialized iff this file exists.
pub const INIT_BINARY: &str = "init";

/// Partitions fully owned by the installed ROM, wiped on every install.
pub const WIPED_PARTITIONS: [&str; 2] = ["system", "vendor"];

/// Vendor property file rewritten with host locale and display settings.
pub const VENDOR_PROP_FILE: &str = "vendor/default.prop";

/// Directories required inside the rootfs before the guest can boot.
pub const BOOT_DIRS: [&str; 9] = [
    "dev/input",
    "dev/socket",
    "dev/maps",
    "dev/vbinder",
    "dev/vndbinder",
    "dev/hwbinder",
    "dev/graphics",
    "dev/shm",
    "data/system",
];

/// Name of the loader symlink inside the data directory.
pub const LOADER_SYMLINK: &str = "loader64";

/// Renderer loader shared object name.
pub const LOADER_FILE: &str = "libloader.so";

/// Guest kernel log capture, rotated on every boot.
pub const KMSG_FILE: &str = "kmsg";

/// Destination of the previous kernel log capture.
pub const LAST_KMSG_FILE: &str = "last_kmsg";

/// Unix socket the guest connects to when user-space is ready.
pub const BOOT_DONE_SOCKET: &str = "socket/boot-done";

// =============================================================================
// Profiles
// =============================================================================

/// Id of the profile seeded on first use.
pub const DEFAULT_PROFILE_ID: &str = "default";

/// Maximum length of a sanitized profile id used in rootfs directory names.
pub const SANITIZED_ID_MAX_LEN: usize = 32;

/// Default control endpoint stored in new profiles.
pub const DEFAULT_CONTROL_ADDRESS: &str = "127.0.0.1:8765";

/// Default ADB endpoint stored in new profiles.
pub const DEFAULT_ADB_ADDRESS: &str = "127.0.0.1:5556";

// =============================================================================
// Control Plane
// =============================================================================

/// Default bind endpoint for the control-plane listener.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9876";

/// Default display geometry reported in the banner.
pub const DEFAULT_WIDTH: u32 = 720;
pub const DEFAULT_HEIGHT: u32 = 1280;
pub const DEFAULT_DPI: u32 = 320;

/// Deadline for the guest to signal boot completion.
pub const BOOT_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-line read timeout on a client session; clients ping to stay alive.
pub const SESSION_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum request line length (bytes).
pub const MAX_REQUEST_LINE_LEN: usize = 65536;

/// Grace period between SIGTERM and SIGKILL when stopping the container.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

// =============================================================================
// Supervisor
// =============================================================================

/// Bounded capacity of the container log ring buffer (drop oldest).
pub const LOG_RING_CAPACITY: usize = 500;

/// Number of log lines attached to a boot-failure report.
pub const BOOT_FAILURE_LOG_LINES: usize = 50;

// =============================================================================
// Input
// =============================================================================

/// Maximum simultaneous multitouch slots.
pub const MAX_TOUCH_SLOTS: usize = 10;

/// Touch event device socket, relative to the rootfs.
pub const TOUCH_DEVICE: &str = "dev/input/touch";

/// Key event device socket, relative to the rootfs.
pub const KEY_DEVICE: &str = "dev/input/key0";

// =============================================================================
// Screen Stream
// =============================================================================

/// Magic prefix of a binary screen frame.
pub const FRAME_HEADER: &[u8] = b"FRAME";

/// Target frame rate of the screen stream.
pub const FRAME_FPS: u64 = 30;

/// Shared framebuffer file the renderer writes into, relative to the rootfs.
pub const GRALLOC_FB_PATH: &str = "dev/shm/gralloc_fb";

//! # twoyi-host
//!
//! Container host daemon for the twoyi guest Android userspace. The crate
//! hosts a guest rootfs tree (an Android system image rooted at an `init`
//! binary) as an unprivileged process tree and exposes it over the network
//! for remote rendering and input.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  twoyi-server (control plane, TCP, JSON lines)                  │
//! │  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌──────────────┐  │
//! │  │ sessions  │─▶│ dispatch  │─▶│ input     │  │ screen       │  │
//! │  └───────────┘  └─────┬─────┘  │ router    │  │ streamer     │  │
//! │                       │        └─────┬─────┘  └──────┬───────┘  │
//! │            StartContainer            │               │          │
//! │                       ▼              ▼               ▼          │
//! │  ┌─────────────────────────┐   unix sockets    FRAME chunks     │
//! │  │ installer → boot prep → │   in rootfs/dev   on the session   │
//! │  │ supervisor (./init)     │                                    │
//! │  └───────────┬─────────────┘                                    │
//! │              ▼                                                  │
//! │     guest init subtree, boot latch at <data>/socket/boot-done   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The profile store, key-value store and ROM probing live below the control
//! plane and are plain synchronous modules; everything socket-shaped runs on
//! tokio.

mod constants;
mod error;

pub mod extract;
pub mod input;
pub mod kv;
pub mod profile;
pub mod protocol;
pub mod renderer;
pub mod rom;
pub mod rootfs;
pub mod screen;
pub mod server;
pub mod supervisor;

pub use constants::*;
pub use error::{Error, Result};

//! Screen frame streaming.
//!
//! When enabled, the streamer multiplexes binary RGBA frames onto subscribed
//! control sessions, interleaved between complete JSON lines through each
//! session's outbound queue (so framing never tears). Frames come from the
//! renderer's shared framebuffer file when it exists; until the guest starts
//! drawing, a generated test pattern is streamed so clients can verify the
//! pipeline end to end.

use crate::constants::{FRAME_FPS, GRALLOC_FB_PATH};
use crate::protocol;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Multiplexes screen frames to subscribed sessions.
pub struct ScreenStreamer {
    width: u32,
    height: u32,
    /// Shared framebuffer the renderer writes into.
    source: PathBuf,
    /// Outbound byte queues of subscribed sessions.
    clients: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    running: AtomicBool,
}

impl ScreenStreamer {
    pub fn new(rootfs: &Path, width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            source: rootfs.join(GRALLOC_FB_PATH),
            clients: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Attaches a session's outbound queue to the stream.
    pub fn add_client(&self, sink: mpsc::UnboundedSender<Vec<u8>>) {
        self.clients.lock().unwrap().push(sink);
        debug!("screen stream client attached");
    }

    /// Starts the frame pump; repeated calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                source = %this.source.display(),
                fps = FRAME_FPS,
                "screen streamer started"
            );
            let frame_size = (this.width * this.height * 4) as usize;
            let mut pattern = vec![0u8; frame_size];
            let mut counter: u32 = 0;
            let mut ticker = tokio::time::interval(Duration::from_millis(1000 / FRAME_FPS));

            while this.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if this.clients.lock().unwrap().is_empty() {
                    continue;
                }

                let pixels = match tokio::fs::read(&this.source).await {
                    Ok(data) if data.len() >= frame_size => data,
                    _ => {
                        test_pattern(&mut pattern, this.width, this.height, counter);
                        pattern.clone()
                    }
                };

                let chunk = protocol::frame(this.width, this.height, &pixels[..frame_size]);
                this.clients
                    .lock()
                    .unwrap()
                    // A closed queue means the session ended; drop it.
                    .retain(|sink| sink.send(chunk.clone()).is_ok());

                counter = counter.wrapping_add(1);
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Fills `data` with a recognizable moving pattern: a white border, phase
/// colored background and a sweeping indicator block.
fn test_pattern(data: &mut [u8], width: u32, height: u32, frame: u32) {
    let w = width as usize;
    let h = height as usize;
    let phase = (frame / FRAME_FPS as u32) % 6;
    let (base_r, base_g, base_b) = match phase {
        0 => (50, 50, 50),
        1 => (100, 50, 50),
        2 => (50, 100, 50),
        3 => (50, 50, 100),
        4 => (100, 100, 50),
        _ => (50, 100, 100),
    };

    let border = 20.min(w / 4).min(h / 4);
    let sweep_size = 50.min(w);
    let sweep_x = if w > sweep_size {
        (frame as usize * 5) % (w - sweep_size)
    } else {
        0
    };

    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) * 4;
            let is_border = x < border || x >= w - border || y < border || y >= h - border;
            let is_sweep = y > border * 2
                && y < border * 2 + sweep_size
                && x > sweep_x
                && x < sweep_x + sweep_size;

            let (r, g, b) = if is_border {
                (255, 255, 255)
            } else if is_sweep {
                (0, 255, 0)
            } else {
                (base_r, base_g, base_b)
            };

            data[idx] = r;
            data[idx + 1] = g;
            data[idx + 2] = b;
            data[idx + 3] = 255;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_fills_alpha() {
        let mut data = vec![0u8; 64 * 64 * 4];
        test_pattern(&mut data, 64, 64, 0);
        assert!(data.chunks(4).all(|px| px[3] == 255));
    }

    #[test]
    fn test_pattern_has_border() {
        let mut data = vec![0u8; 64 * 64 * 4];
        test_pattern(&mut data, 64, 64, 0);
        // Top-left pixel lies inside the white border.
        assert_eq!(&data[..3], &[255, 255, 255]);
    }
}

//! Guest input routing.
//!
//! The guest's input HAL connects to two Unix sockets inside its rootfs,
//! `dev/input/touch` and `dev/input/key0`. On connect the router sends a
//! device descriptor (name, id and capability bitmasks, mirroring the kernel
//! evdev ioctls), then streams raw `input_event` structs.
//!
//! Touch events become multitouch protocol B sequences over up to
//! [`MAX_TOUCH_SLOTS`] slots; key events become `EV_KEY` + `SYN_REPORT`
//! pairs. Delivery is fire-and-forget through an unbounded channel: when no
//! guest device is connected the event is dropped, which is acceptable
//! because clients resend state continuously.

use crate::constants::{KEY_DEVICE, MAX_TOUCH_SLOTS, TOUCH_DEVICE};
use libc::{c_char, c_int, timeval, CLOCK_MONOTONIC};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// =============================================================================
// Event Codes
// =============================================================================

const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const EV_ABS: u16 = 0x03;

const SYN_REPORT: u16 = 0x00;

const ABS_MT_SLOT: u16 = 0x2f;
const ABS_MT_POSITION_X: u16 = 0x35;
const ABS_MT_POSITION_Y: u16 = 0x36;
const ABS_MT_TRACKING_ID: u16 = 0x39;
const ABS_MT_PRESSURE: u16 = 0x3a;

const KEY_MAX: usize = 0x2ff;
const ABS_MAX: usize = 0x3f;
const ABS_CNT: usize = ABS_MAX + 1;
const REL_MAX: usize = 0x0f;
const SW_MAX: usize = 0x10;
const LED_MAX: usize = 0x0f;
const FF_MAX: usize = 0x7f;
const INPUT_PROP_MAX: usize = 0x1f;
const INPUT_PROP_BUTTONPAD: u8 = 0x02;

const TOUCH_DEVICE_NAME: &str = "vtouch";
const TOUCH_DEVICE_UNIQUE_ID: &str = "<vtouch 0>";
const KEY_DEVICE_NAME: &str = "vkey";
const KEY_DEVICE_UNIQUE_ID: &str = "<keyboard 0>";

/// Maximum pressure reported in the touch descriptor.
const PRESSURE_MAX: u32 = 80;

// =============================================================================
// Wire Structs
// =============================================================================

/// Kernel `struct input_id`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct InputId {
    bustype: u16,
    vendor: u16,
    product: u16,
    version: u16,
}

/// Kernel `struct input_event`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct InputEvent {
    time: timeval,
    kind: u16,
    code: u16,
    value: i32,
}

/// Device descriptor sent once per connection, before any events.
#[repr(C)]
#[derive(Clone, Copy)]
struct DeviceInfo {
    name: [c_char; 80],
    driver_version: c_int,
    id: InputId,
    physical_location: [c_char; 80],
    unique_id: [c_char; 80],
    key_bitmask: [u8; (KEY_MAX + 1) / 8],
    abs_bitmask: [u8; (ABS_MAX + 1) / 8],
    rel_bitmask: [u8; (REL_MAX + 1) / 8],
    sw_bitmask: [u8; (SW_MAX + 1) / 8],
    led_bitmask: [u8; (LED_MAX + 1) / 8],
    ff_bitmask: [u8; (FF_MAX + 1) / 8],
    prop_bitmask: [u8; (INPUT_PROP_MAX + 1) / 8],
    abs_max: [u32; ABS_CNT],
    abs_min: [u32; ABS_CNT],
}

/// Views a plain repr(C) struct as bytes for the wire.
///
/// # Safety
///
/// `T` must be a repr(C) type with no padding-sensitive invariants; both
/// wire structs here qualify.
unsafe fn as_bytes<T: Sized>(value: &T) -> &[u8] {
    std::slice::from_raw_parts((value as *const T).cast::<u8>(), std::mem::size_of::<T>())
}

fn copy_to_cstr<const N: usize>(text: &str, out: &mut [c_char; N]) {
    for (slot, byte) in out.iter_mut().zip(text.bytes().chain(std::iter::once(0))) {
        *slot = byte as c_char;
    }
}

fn set_bit(mask: &mut [u8], bit: u16) {
    let bit = bit as usize;
    if bit / 8 < mask.len() {
        mask[bit / 8] |= 1 << (bit % 8);
    }
}

fn touch_descriptor(path: &Path, width: u32, height: u32) -> DeviceInfo {
    // SAFETY: DeviceInfo is plain-old-data; all-zero is a valid value.
    let mut info: DeviceInfo = unsafe { std::mem::zeroed() };
    info.driver_version = 0x1;
    info.id.product = 0x1;

    copy_to_cstr(TOUCH_DEVICE_NAME, &mut info.name);
    copy_to_cstr(&path.to_string_lossy(), &mut info.physical_location);
    copy_to_cstr(TOUCH_DEVICE_UNIQUE_ID, &mut info.unique_id);

    info.prop_bitmask[0] = INPUT_PROP_BUTTONPAD;

    for code in [
        ABS_MT_SLOT,
        ABS_MT_POSITION_X,
        ABS_MT_POSITION_Y,
        ABS_MT_TRACKING_ID,
        ABS_MT_PRESSURE,
    ] {
        set_bit(&mut info.abs_bitmask, code);
    }

    info.abs_max[ABS_MT_SLOT as usize] = MAX_TOUCH_SLOTS as u32 - 1;
    info.abs_max[ABS_MT_POSITION_X as usize] = width;
    info.abs_max[ABS_MT_POSITION_Y as usize] = height;
    info.abs_max[ABS_MT_PRESSURE as usize] = PRESSURE_MAX;

    info
}

fn key_descriptor(path: &Path) -> DeviceInfo {
    // SAFETY: as above.
    let mut info: DeviceInfo = unsafe { std::mem::zeroed() };
    info.driver_version = 0x1;
    info.id.product = 0x1;

    copy_to_cstr(KEY_DEVICE_NAME, &mut info.name);
    copy_to_cstr(&path.to_string_lossy(), &mut info.physical_location);
    copy_to_cstr(KEY_DEVICE_UNIQUE_ID, &mut info.unique_id);

    // Advertise the common navigation key range.
    info.key_bitmask[14] = 0x1c;

    info
}

fn event(kind: u16, code: u16, value: i32) -> InputEvent {
    let mut tp = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime writes into the provided struct.
    unsafe { libc::clock_gettime(CLOCK_MONOTONIC, &mut tp) };
    InputEvent {
        time: timeval {
            tv_sec: tp.tv_sec,
            tv_usec: tp.tv_nsec / 1000,
        },
        kind,
        code,
        value,
    }
}

// =============================================================================
// Router
// =============================================================================

/// One guest event device: the sender half is replaced on every reconnect.
struct DeviceChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<InputEvent>>>,
}

impl DeviceChannel {
    fn new() -> Self {
        Self {
            tx: Mutex::new(None),
        }
    }

    fn send_all(&self, events: &[InputEvent]) {
        let guard = self.tx.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            // No guest device connected; the client will resend state.
            return;
        };
        for ev in events {
            if tx.send(*ev).is_err() {
                return;
            }
        }
    }
}

/// Translates control-plane input events into guest event-device writes.
pub struct InputRouter {
    touch: DeviceChannel,
    key: DeviceChannel,
    slots: Mutex<[bool; MAX_TOUCH_SLOTS]>,
}

impl InputRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            touch: DeviceChannel::new(),
            key: DeviceChannel::new(),
            slots: Mutex::new([false; MAX_TOUCH_SLOTS]),
        })
    }

    /// Binds both device sockets inside the rootfs and starts serving.
    pub fn start(self: &Arc<Self>, rootfs: &Path, width: u32, height: u32) {
        let touch_path = rootfs.join(TOUCH_DEVICE);
        let key_path = rootfs.join(KEY_DEVICE);

        let this = Arc::clone(self);
        let descriptor = touch_descriptor(&touch_path, width, height);
        tokio::spawn(async move {
            device_server(touch_path, descriptor, |tx| {
                *this.touch.tx.lock().unwrap() = Some(tx);
            })
            .await;
        });

        let this = Arc::clone(self);
        let descriptor = key_descriptor(&key_path);
        tokio::spawn(async move {
            device_server(key_path, descriptor, |tx| {
                *this.key.tx.lock().unwrap() = Some(tx);
            })
            .await;
        });
    }

    /// Routes a touch event.
    ///
    /// Actions: 0=DOWN, 1=UP, 2=MOVE, 3=CANCEL/POINTER_UP. Out-of-range
    /// pointer ids are dropped.
    pub fn handle_touch(&self, action: i32, pointer_id: i32, x: f32, y: f32, pressure: f32) {
        let Ok(slot) = usize::try_from(pointer_id) else {
            return;
        };
        if slot >= MAX_TOUCH_SLOTS {
            return;
        }

        let mut events = Vec::new();
        match action {
            // DOWN / POINTER_DOWN
            0 => {
                self.slots.lock().unwrap()[slot] = true;
                events.push(event(EV_ABS, ABS_MT_SLOT, slot as i32));
                events.push(event(EV_ABS, ABS_MT_TRACKING_ID, slot as i32 + 1));
                events.push(event(EV_ABS, ABS_MT_POSITION_X, x as i32));
                events.push(event(EV_ABS, ABS_MT_POSITION_Y, y as i32));
                events.push(event(EV_ABS, ABS_MT_PRESSURE, pressure as i32));
                events.push(event(EV_SYN, SYN_REPORT, 0));
            }
            // UP lifts every active contact
            1 => {
                let mut slots = self.slots.lock().unwrap();
                for (index, active) in slots.iter_mut().enumerate() {
                    if *active {
                        *active = false;
                        events.push(event(EV_ABS, ABS_MT_SLOT, index as i32));
                        events.push(event(EV_ABS, ABS_MT_TRACKING_ID, -1));
                        events.push(event(EV_SYN, SYN_REPORT, 0));
                    }
                }
            }
            // MOVE
            2 => {
                if self.slots.lock().unwrap()[slot] {
                    events.push(event(EV_ABS, ABS_MT_SLOT, slot as i32));
                    events.push(event(EV_ABS, ABS_MT_POSITION_X, x as i32));
                    events.push(event(EV_ABS, ABS_MT_POSITION_Y, y as i32));
                    events.push(event(EV_ABS, ABS_MT_PRESSURE, pressure as i32));
                    events.push(event(EV_SYN, SYN_REPORT, 0));
                }
            }
            // CANCEL / POINTER_UP lifts one contact
            3 => {
                let mut slots = self.slots.lock().unwrap();
                if slots[slot] {
                    slots[slot] = false;
                    events.push(event(EV_ABS, ABS_MT_SLOT, slot as i32));
                    events.push(event(EV_ABS, ABS_MT_TRACKING_ID, -1));
                    events.push(event(EV_SYN, SYN_REPORT, 0));
                }
            }
            _ => {}
        }

        if !events.is_empty() {
            self.touch.send_all(&events);
        }
    }

    /// Routes a key press or release.
    pub fn handle_key(&self, keycode: i32, pressed: bool) {
        let keycode = match u16::try_from(keycode) {
            Ok(code) if (code as usize) <= KEY_MAX => code,
            _ => {
                debug!(keycode, "keycode out of range, dropped");
                return;
            }
        };
        self.key.send_all(&[
            event(EV_KEY, keycode, i32::from(pressed)),
            event(EV_SYN, SYN_REPORT, 0),
        ]);
    }
}

/// Accept loop for one event-device socket. Each new guest connection gets
/// the descriptor followed by the live event stream; a reconnect replaces
/// the previous sender.
async fn device_server(
    path: PathBuf,
    descriptor: DeviceInfo,
    install_sender: impl Fn(mpsc::UnboundedSender<InputEvent>),
) {
    let _ = std::fs::remove_file(&path);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let listener = match UnixListener::bind(&path) {
        Ok(l) => l,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to bind input device socket");
            return;
        }
    };
    info!(path = %path.display(), "input device socket listening");

    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "input accept failed");
                return;
            }
        };
        info!(path = %path.display(), "guest input device connected");

        // SAFETY: DeviceInfo is repr(C) plain-old-data.
        let header = unsafe { as_bytes(&descriptor) }.to_vec();
        if stream.write_all(&header).await.is_err() {
            continue;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<InputEvent>();
        install_sender(tx);

        while let Some(ev) = rx.recv().await {
            // SAFETY: InputEvent is repr(C) plain-old-data.
            let bytes = unsafe { as_bytes(&ev) }.to_vec();
            if stream.write_all(&bytes).await.is_err() {
                debug!(path = %path.display(), "guest input device disconnected");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_sizes_are_stable() {
        // The guest parses these as fixed-size C structs.
        assert_eq!(std::mem::size_of::<InputId>(), 8);
        assert_eq!(
            std::mem::size_of::<InputEvent>(),
            std::mem::size_of::<timeval>() + 8
        );
    }

    #[test]
    fn touch_descriptor_ranges() {
        let info = touch_descriptor(Path::new("/tmp/touch"), 720, 1280);
        assert_eq!(info.abs_max[ABS_MT_POSITION_X as usize], 720);
        assert_eq!(info.abs_max[ABS_MT_POSITION_Y as usize], 1280);
        assert_eq!(info.abs_max[ABS_MT_SLOT as usize], MAX_TOUCH_SLOTS as u32 - 1);
    }

    #[test]
    fn cstr_copy_truncates_and_terminates() {
        let mut buf = [0 as c_char; 8];
        copy_to_cstr("abc", &mut buf);
        assert_eq!(buf[0] as u8, b'a');
        assert_eq!(buf[3], 0);

        copy_to_cstr("longer-than-buffer", &mut buf);
        assert_eq!(buf[7] as u8, b't'); // truncated, no terminator space left
    }

    #[test]
    fn bit_setting() {
        let mut mask = [0u8; 8];
        set_bit(&mut mask, ABS_MT_SLOT);
        assert_eq!(mask[(ABS_MT_SLOT / 8) as usize] & (1 << (ABS_MT_SLOT % 8)), 1 << (ABS_MT_SLOT % 8));
    }
}

//! Renderer loader bridge.
//!
//! The native OpenGL renderer lives in a host-provided shared object (the
//! "loader", linked into the guest through the `loader64` symlink). The core
//! consumes it through six C-ABI symbols, resolved once at load time. All
//! calls must come from the single thread that owns the target surface; the
//! bridge itself only loads the library and validates the contract.

use crate::error::{Error, Result};
use libloading::Library;
use std::ffi::c_void;
use std::path::Path;
use tracing::info;

type StartOpenGlRenderer =
    unsafe extern "C" fn(win: *mut c_void, width: i32, height: i32, xdpi: i32, ydpi: i32, fps: i32)
        -> i32;
type ResetSubWindow = unsafe extern "C" fn(
    window: *mut c_void,
    wx: i32,
    wy: i32,
    ww: i32,
    wh: i32,
    fbw: i32,
    fbh: i32,
    dpr: f32,
    z_rot: f32,
) -> i32;
type SetNativeWindow = unsafe extern "C" fn(window: *mut c_void) -> i32;
type RepaintOpenGlDisplay = unsafe extern "C" fn();
type RemoveSubWindow = unsafe extern "C" fn(window: *mut c_void) -> i32;
type DestroyOpenGlSubwindow = unsafe extern "C" fn() -> i32;

/// The resolved renderer entry points. Holding the bridge keeps the library
/// mapped; the fn pointers are valid for exactly that long.
pub struct RendererBridge {
    start_renderer: StartOpenGlRenderer,
    reset_sub_window: ResetSubWindow,
    set_native_window: SetNativeWindow,
    repaint_display: RepaintOpenGlDisplay,
    remove_sub_window: RemoveSubWindow,
    destroy_subwindow: DestroyOpenGlSubwindow,
    _lib: Library,
}

impl RendererBridge {
    /// Loads the loader library and resolves all six symbols.
    ///
    /// # Safety
    ///
    /// Loading a shared object runs its initializers; the caller asserts the
    /// path refers to a trusted renderer loader.
    pub unsafe fn load(path: &Path) -> Result<Self> {
        let lib = Library::new(path).map_err(|e| {
            Error::Config(format!("cannot load renderer loader {}: {e}", path.display()))
        })?;

        let missing = |name: &str, e: libloading::Error| {
            Error::Config(format!(
                "renderer loader {} lacks symbol {name}: {e}",
                path.display()
            ))
        };

        // Resolve into plain fn pointers first; the symbols stay valid for
        // as long as the library handle below lives.
        let start_renderer: StartOpenGlRenderer = *lib
            .get(b"startOpenGLRenderer\0")
            .map_err(|e| missing("startOpenGLRenderer", e))?;
        let reset_sub_window: ResetSubWindow = *lib
            .get(b"resetSubWindow\0")
            .map_err(|e| missing("resetSubWindow", e))?;
        let set_native_window: SetNativeWindow = *lib
            .get(b"setNativeWindow\0")
            .map_err(|e| missing("setNativeWindow", e))?;
        let repaint_display: RepaintOpenGlDisplay = *lib
            .get(b"repaintOpenGLDisplay\0")
            .map_err(|e| missing("repaintOpenGLDisplay", e))?;
        let remove_sub_window: RemoveSubWindow = *lib
            .get(b"removeSubWindow\0")
            .map_err(|e| missing("removeSubWindow", e))?;
        let destroy_subwindow: DestroyOpenGlSubwindow = *lib
            .get(b"destroyOpenGLSubwindow\0")
            .map_err(|e| missing("destroyOpenGLSubwindow", e))?;

        info!(loader = %path.display(), "renderer loader resolved");
        Ok(Self {
            start_renderer,
            reset_sub_window,
            set_native_window,
            repaint_display,
            remove_sub_window,
            destroy_subwindow,
            _lib: lib,
        })
    }

    /// # Safety
    /// `win` must be a valid native window handle owned by the calling thread.
    pub unsafe fn start_renderer(
        &self,
        win: *mut c_void,
        width: i32,
        height: i32,
        xdpi: i32,
        ydpi: i32,
        fps: i32,
    ) -> i32 {
        (self.start_renderer)(win, width, height, xdpi, ydpi, fps)
    }

    /// # Safety
    /// `window` must be a valid native window handle owned by the calling thread.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn reset_sub_window(
        &self,
        window: *mut c_void,
        wx: i32,
        wy: i32,
        ww: i32,
        wh: i32,
        fbw: i32,
        fbh: i32,
        dpr: f32,
        z_rot: f32,
    ) -> i32 {
        (self.reset_sub_window)(window, wx, wy, ww, wh, fbw, fbh, dpr, z_rot)
    }

    /// # Safety
    /// `window` must be a valid native window handle owned by the calling thread.
    pub unsafe fn set_native_window(&self, window: *mut c_void) -> i32 {
        (self.set_native_window)(window)
    }

    /// # Safety
    /// Must run on the thread that owns the renderer surface.
    pub unsafe fn repaint_display(&self) {
        (self.repaint_display)()
    }

    /// # Safety
    /// `window` must be a valid native window handle owned by the calling thread.
    pub unsafe fn remove_sub_window(&self, window: *mut c_void) -> i32 {
        (self.remove_sub_window)(window)
    }

    /// # Safety
    /// Must run on the thread that owns the renderer surface.
    pub unsafe fn destroy_subwindow(&self) -> i32 {
        (self.destroy_subwindow)()
    }
}

//! KMS display acquisition, page-flip presentation, CRTC restore.
//!
//! The engine takes exclusive control of one display pipe: first connected
//! connector, its preferred mode, scan-out from a GBM surface the GL context
//! renders into. The CRTC configuration found at acquisition is snapshotted
//! and put back on every exit path; the crash path applies it with a single
//! raw ioctl that is safe to issue from a signal handler.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use drm::control::{
    connector, crtc, framebuffer, Device as ControlDevice, Event, Mode, ModeTypeFlags,
    PageFlipFlags,
};
use drm::Device;
use gbm::AsRaw;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("no usable DRM device under /dev/dri")]
    NoDevice,
    #[error("no connected connector")]
    NoConnector,
    #[error("connector reports no modes")]
    NoMode,
    #[error("no CRTC available for the connector")]
    NoCrtc,
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(context: &'static str) -> impl FnOnce(std::io::Error) -> DisplayError {
    move |source| DisplayError::Io { context, source }
}

/// DRM device node wrapper carrying the drm-rs trait impls.
pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

// ============================================================================
// Surface
// ============================================================================

pub struct DisplaySurface {
    card: Card,
    gbm: gbm::Device<Card>,
    surface: gbm::Surface<framebuffer::Handle>,
    crtc: crtc::Handle,
    connector: connector::Handle,
    mode: Mode,
    saved: crtc::Info,
    /// Front buffer currently scanned out; must stay alive until the next
    /// flip completes.
    front: Option<gbm::BufferObject<framebuffer::Handle>>,
    created_fbs: Vec<framebuffer::Handle>,
    mode_set: bool,
    restored: bool,
}

impl DisplaySurface {
    /// Enumerate `/dev/dri`, take the first card with a connected connector,
    /// pick its preferred mode and snapshot the CRTC we are about to own.
    pub fn acquire() -> Result<Self, DisplayError> {
        for path in enumerate_cards() {
            let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) else {
                continue;
            };
            let card = Card(file);
            match Self::acquire_on(card) {
                Ok(surface) => {
                    tracing::info!(card = %path.display(), "display acquired");
                    return Ok(surface);
                }
                Err(e) => {
                    tracing::debug!(card = %path.display(), "skipping device: {e}");
                }
            }
        }
        Err(DisplayError::NoDevice)
    }

    fn acquire_on(card: Card) -> Result<Self, DisplayError> {
        let resources = card.resource_handles().map_err(io_err("resources"))?;

        let mut picked = None;
        for handle in resources.connectors() {
            let info = card
                .get_connector(*handle, false)
                .map_err(io_err("get_connector"))?;
            if info.state() == connector::State::Connected {
                picked = Some(info);
                break;
            }
        }
        let conn = picked.ok_or(DisplayError::NoConnector)?;

        let mode = *conn
            .modes()
            .iter()
            .find(|m| m.mode_type().contains(ModeTypeFlags::PREFERRED))
            .or_else(|| conn.modes().first())
            .ok_or(DisplayError::NoMode)?;

        let crtc_handle = pick_crtc(&card, &conn, &resources)?;
        let saved = card.get_crtc(crtc_handle).map_err(io_err("get_crtc"))?;

        let (width, height) = mode.size();
        let dup = Card(card.0.try_clone().map_err(io_err("dup fd"))?);
        let gbm = gbm::Device::new(dup).map_err(io_err("gbm device"))?;
        let surface = gbm
            .create_surface::<framebuffer::Handle>(
                width as u32,
                height as u32,
                gbm::Format::Xrgb8888,
                gbm::BufferObjectFlags::SCANOUT | gbm::BufferObjectFlags::RENDERING,
            )
            .map_err(io_err("gbm surface"))?;

        tracing::info!(
            mode = %format_mode(&mode),
            connector = ?conn.handle(),
            crtc = ?crtc_handle,
            "display pipe configured"
        );

        arm_crtc_restore(&card, crtc_handle, conn.handle(), &saved);

        Ok(Self {
            card,
            gbm,
            surface,
            crtc: crtc_handle,
            connector: conn.handle(),
            mode,
            saved,
            front: None,
            created_fbs: Vec::new(),
            mode_set: false,
            restored: false,
        })
    }

    pub fn mode_size(&self) -> (u32, u32) {
        let (w, h) = self.mode.size();
        (w as u32, h as u32)
    }

    /// Display refresh period, the render loop's pacing unit.
    pub fn refresh_period(&self) -> Duration {
        let hz = self.mode.vrefresh().max(1);
        Duration::from_nanos(1_000_000_000 / hz as u64)
    }

    /// Raw GBM device pointer for EGL display creation.
    pub fn gbm_device_ptr(&self) -> *mut std::ffi::c_void {
        self.gbm.as_raw() as *mut _
    }

    /// Raw GBM surface pointer for the EGL window surface.
    pub fn gbm_surface_ptr(&self) -> *mut std::ffi::c_void {
        self.surface.as_raw() as *mut _
    }

    /// Scan out the buffer most recently finished by `eglSwapBuffers`.
    /// Blocks until the page flip completes, which is the VSync gate the
    /// whole render loop paces on.
    pub fn present(&mut self) -> Result<(), DisplayError> {
        let mut bo = unsafe { self.surface.lock_front_buffer() }
            .map_err(|_| DisplayError::Io {
                context: "lock front buffer",
                source: std::io::Error::other("no front buffer after swap"),
            })?;

        let fb = match bo.userdata().ok().flatten() {
            Some(fb) => *fb,
            None => {
                let fb = self
                    .card
                    .add_framebuffer(&bo, 24, 32)
                    .map_err(io_err("add_framebuffer"))?;
                let _ = bo.set_userdata(fb);
                self.created_fbs.push(fb);
                fb
            }
        };

        if !self.mode_set {
            self.card
                .set_crtc(self.crtc, Some(fb), (0, 0), &[self.connector], Some(self.mode))
                .map_err(io_err("set_crtc"))?;
            self.mode_set = true;
        } else {
            self.card
                .page_flip(self.crtc, fb, PageFlipFlags::EVENT, None)
                .map_err(io_err("page_flip"))?;
            self.wait_flip()?;
        }

        // The previous front buffer stopped scanning out at the flip; give
        // it back to the GBM surface.
        self.front = Some(bo);
        Ok(())
    }

    fn wait_flip(&self) -> Result<(), DisplayError> {
        loop {
            let events = self
                .card
                .receive_events()
                .map_err(io_err("receive_events"))?;
            for event in events {
                if let Event::PageFlip(_) = event {
                    return Ok(());
                }
            }
        }
    }

    /// Put the CRTC back the way we found it. Idempotent; also runs from
    /// `Drop`, so the console is restored on every orderly exit path.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        disarm_crtc_restore();

        let result = self.card.set_crtc(
            self.crtc,
            self.saved.framebuffer(),
            self.saved.position(),
            &[self.connector],
            self.saved.mode(),
        );
        match result {
            Ok(()) => tracing::info!("CRTC restored"),
            Err(e) => tracing::error!("CRTC restore failed: {e}"),
        }

        self.front = None;
        for fb in self.created_fbs.drain(..) {
            let _ = self.card.destroy_framebuffer(fb);
        }
    }
}

impl Drop for DisplaySurface {
    fn drop(&mut self) {
        self.restore();
    }
}

fn enumerate_cards() -> Vec<PathBuf> {
    let mut cards: Vec<PathBuf> = std::fs::read_dir("/dev/dri")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("card"))
                        .unwrap_or(false)
                })
                .collect()
        })
        .unwrap_or_default();
    cards.sort();
    cards
}

fn pick_crtc(
    card: &Card,
    conn: &connector::Info,
    resources: &drm::control::ResourceHandles,
) -> Result<crtc::Handle, DisplayError> {
    // Prefer the CRTC already driving this connector.
    if let Some(enc_handle) = conn.current_encoder() {
        if let Ok(enc) = card.get_encoder(enc_handle) {
            if let Some(crtc) = enc.crtc() {
                return Ok(crtc);
            }
        }
    }
    for enc_handle in conn.encoders() {
        if let Ok(enc) = card.get_encoder(*enc_handle) {
            if let Some(crtc) = enc.crtc() {
                return Ok(crtc);
            }
        }
    }
    resources
        .crtcs()
        .first()
        .copied()
        .ok_or(DisplayError::NoCrtc)
}

fn format_mode(mode: &Mode) -> String {
    let (w, h) = mode.size();
    format!("{w}x{h}@{}", mode.vrefresh())
}

// ============================================================================
// Async-signal-safe CRTC restore
// ============================================================================
//
// A fatal signal handler cannot take locks or call into drm-rs. The saved
// CRTC configuration is therefore mirrored into plain static storage at
// acquisition time; the handler replays it with one ioctl.

#[repr(C)]
#[derive(Clone, Copy)]
struct DrmModeInfoRaw {
    clock: u32,
    hdisplay: u16,
    hsync_start: u16,
    hsync_end: u16,
    htotal: u16,
    hskew: u16,
    vdisplay: u16,
    vsync_start: u16,
    vsync_end: u16,
    vtotal: u16,
    vscan: u16,
    vrefresh: u32,
    flags: u32,
    mode_type: u32,
    name: [u8; 32],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DrmModeCrtcReq {
    set_connectors_ptr: u64,
    count_connectors: u32,
    crtc_id: u32,
    fb_id: u32,
    x: u32,
    y: u32,
    gamma_size: u32,
    mode_valid: u32,
    mode: DrmModeInfoRaw,
}

const fn drm_ioctl_mode_setcrtc() -> libc::c_ulong {
    // _IOWR('d', 0xA2, struct drm_mode_crtc)
    const IOC_WRITE: libc::c_ulong = 1;
    const IOC_READ: libc::c_ulong = 2;
    ((IOC_READ | IOC_WRITE) << 30)
        | ((std::mem::size_of::<DrmModeCrtcReq>() as libc::c_ulong) << 16)
        | ((b'd' as libc::c_ulong) << 8)
        | 0xA2
}

struct EmergencyCrtc {
    armed: AtomicBool,
    fd: AtomicI32,
    req: std::cell::UnsafeCell<DrmModeCrtcReq>,
    connector_id: std::cell::UnsafeCell<u32>,
}

// Written once before `armed` is released, read only by the signal handler.
unsafe impl Sync for EmergencyCrtc {}

static EMERGENCY_CRTC: EmergencyCrtc = EmergencyCrtc {
    armed: AtomicBool::new(false),
    fd: AtomicI32::new(-1),
    req: std::cell::UnsafeCell::new(DrmModeCrtcReq {
        set_connectors_ptr: 0,
        count_connectors: 0,
        crtc_id: 0,
        fb_id: 0,
        x: 0,
        y: 0,
        gamma_size: 0,
        mode_valid: 0,
        mode: DrmModeInfoRaw {
            clock: 0,
            hdisplay: 0,
            hsync_start: 0,
            hsync_end: 0,
            htotal: 0,
            hskew: 0,
            vdisplay: 0,
            vsync_start: 0,
            vsync_end: 0,
            vtotal: 0,
            vscan: 0,
            vrefresh: 0,
            flags: 0,
            mode_type: 0,
            name: [0; 32],
        },
    }),
    connector_id: std::cell::UnsafeCell::new(0),
};

fn arm_crtc_restore(
    card: &Card,
    crtc: crtc::Handle,
    connector: connector::Handle,
    saved: &crtc::Info,
) {
    let req = unsafe { &mut *EMERGENCY_CRTC.req.get() };
    let conn_id = unsafe { &mut *EMERGENCY_CRTC.connector_id.get() };

    *conn_id = connector.into();
    req.set_connectors_ptr = conn_id as *const u32 as u64;
    req.count_connectors = 1;
    req.crtc_id = crtc.into();
    req.fb_id = saved
        .framebuffer()
        .map(|fb| {
            let raw: u32 = fb.into();
            raw
        })
        .unwrap_or(0);
    let (x, y) = saved.position();
    req.x = x;
    req.y = y;
    req.gamma_size = 0;
    match saved.mode() {
        Some(mode) => {
            req.mode_valid = 1;
            req.mode = raw_mode(&mode);
        }
        None => req.mode_valid = 0,
    }

    EMERGENCY_CRTC.fd.store(card.0.as_raw_fd(), Ordering::Relaxed);
    EMERGENCY_CRTC.armed.store(true, Ordering::Release);
}

fn raw_mode(mode: &Mode) -> DrmModeInfoRaw {
    // drm-rs's Mode is a transparent wrapper over the kernel's
    // drm_mode_modeinfo; the uapi layout is stable by contract.
    unsafe { std::mem::transmute_copy(mode) }
}

fn disarm_crtc_restore() {
    EMERGENCY_CRTC.armed.store(false, Ordering::Release);
}

/// Replay the saved CRTC configuration. Async-signal-safe: one ioctl on
/// pre-staged memory, no locks, no allocation. Applied at most once.
pub fn emergency_crtc_restore() {
    if EMERGENCY_CRTC
        .armed
        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        return;
    }
    let fd = EMERGENCY_CRTC.fd.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    unsafe {
        libc::ioctl(fd, drm_ioctl_mode_setcrtc(), EMERGENCY_CRTC.req.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_number_matches_uapi_layout() {
        // struct drm_mode_modeinfo is 68 bytes, drm_mode_crtc is 104.
        assert_eq!(std::mem::size_of::<DrmModeInfoRaw>(), 68);
        assert_eq!(std::mem::size_of::<DrmModeCrtcReq>(), 104);
        // drm-rs's Mode must stay layout-identical for raw_mode's copy.
        assert_eq!(std::mem::size_of::<Mode>(), std::mem::size_of::<DrmModeInfoRaw>());
        // dir=RW (3), size=104, type='d', nr=0xA2
        assert_eq!(drm_ioctl_mode_setcrtc(), 0xC068_64A2);
    }

    #[test]
    fn emergency_restore_unarmed_is_a_no_op() {
        disarm_crtc_restore();
        emergency_crtc_restore();
        emergency_crtc_restore();
    }
}

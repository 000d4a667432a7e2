//! X11 backend: RandR for display modes, EWMH for focus, XFixes pointer
//! barriers for cursor confinement.
//!
//! All three primitives share one `RustConnection` opened by
//! [`X11Session::connect`].

use std::cmp::Reverse;
use std::env;
use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;
use x11rb::CURRENT_TIME;
use x11rb::NONE;
use x11rb::connection::Connection;
use x11rb::errors::ReplyError;
use x11rb::protocol::randr;
use x11rb::protocol::randr::ConnectionExt as _;
use x11rb::protocol::xfixes;
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xproto::Atom;
use x11rb::protocol::xproto::AtomEnum;
use x11rb::protocol::xproto::ConnectionExt as _;
use x11rb::protocol::xproto::Window;
use x11rb::rust_connection::RustConnection;

use super::BackendError;
use crate::cursor::CursorConfiner;
use crate::cursor::CursorError;
use crate::display::DisplayBackend;
use crate::display::DisplayError;
use crate::domain::FocusState;
use crate::domain::Rect;
use crate::domain::ResolutionMode;
use crate::focus::FocusError;
use crate::focus::FocusProbe;
use crate::processes::ProcessTable;

/// `Rotate_90 | Rotate_270`: the CRTC scans out with width and height swapped.
const ROTATED_SIDEWAYS: u32 = (1 << 1) | (1 << 3);

/// Connection state shared by the X11 primitives.
#[derive(Clone)]
pub struct X11Session {
    conn: Arc<RustConnection>,
    root: Window,
    /// Physical size of the root window at connect time, for keeping DPI
    /// stable across screen resizes.
    size_px: (u16, u16),
    size_mm: (u16, u16),
    net_active_window: Atom,
    net_wm_pid: Atom,
}

impl X11Session {
    pub fn connect() -> Result<Self, BackendError> {
        let (conn, screen_num) =
            RustConnection::connect(None).map_err(|e| BackendError::Connect(e.to_string()))?;

        let screen = conn
            .setup()
            .roots
            .get(screen_num)
            .ok_or_else(|| BackendError::Connect(format!("screen {screen_num} not found")))?;
        let root = screen.root;
        let size_px = (screen.width_in_pixels, screen.height_in_pixels);
        let size_mm = (screen.width_in_millimeters, screen.height_in_millimeters);

        let net_active_window = intern(&conn, b"_NET_ACTIVE_WINDOW")?;
        let net_wm_pid = intern(&conn, b"_NET_WM_PID")?;

        info!("Connected to X11 display (screen {})", screen_num);

        Ok(Self {
            conn: Arc::new(conn),
            root,
            size_px,
            size_mm,
            net_active_window,
            net_wm_pid,
        })
    }

    /// Environment lines that explain a failed connection.
    pub fn diagnostics() -> Vec<String> {
        ["DISPLAY", "XDG_SESSION_TYPE", "WAYLAND_DISPLAY"]
            .iter()
            .map(|var| match env::var(var) {
                Ok(v) => format!("{var}={v}"),
                Err(_) => format!("{var}: NOT SET"),
            })
            .collect()
    }

    pub fn display(&self) -> Result<X11Display, BackendError> {
        let version = self
            .conn
            .randr_query_version(1, 3)
            .map_err(|_| BackendError::MissingExtension("RandR"))?
            .reply()
            .map_err(|e| BackendError::Request(e.to_string()))?;

        if (version.major_version, version.minor_version) < (1, 3) {
            return Err(BackendError::MissingExtension("RandR 1.3"));
        }
        debug!("RandR {}.{}", version.major_version, version.minor_version);

        Ok(X11Display {
            session: self.clone(),
        })
    }

    /// Pointer-barrier confiner, or one that always reports itself
    /// unavailable when the server is too old.
    pub fn cursor(&self) -> Box<dyn CursorConfiner> {
        match X11Cursor::new(self) {
            Ok(cursor) => Box::new(cursor),
            Err(e) => {
                warn!("{}; mouse lock disabled", e);
                Box::new(UnavailableCursor(e.to_string()))
            }
        }
    }

    pub fn focus_probe(&self, processes: Arc<ProcessTable>) -> X11FocusProbe {
        X11FocusProbe {
            session: self.clone(),
            processes,
        }
    }
}

fn intern(conn: &RustConnection, name: &[u8]) -> Result<Atom, BackendError> {
    Ok(conn
        .intern_atom(false, name)
        .map_err(|e| BackendError::Request(e.to_string()))?
        .reply()
        .map_err(|e| BackendError::Request(e.to_string()))?
        .atom)
}

fn query_err(e: impl ToString) -> DisplayError {
    DisplayError::Query(e.to_string())
}

/// The CRTC driving the output we switch modes on.
struct ActiveOutput {
    resources: randr::GetScreenResourcesCurrentReply,
    crtc_id: randr::Crtc,
    crtc: randr::GetCrtcInfoReply,
    /// Mode ids the output accepts.
    modes: Vec<randr::Mode>,
}

/// RandR display primitive for the primary (or first active) output.
pub struct X11Display {
    session: X11Session,
}

impl X11Display {
    fn conn(&self) -> &RustConnection {
        &self.session.conn
    }

    fn active_output(&self) -> Result<ActiveOutput, DisplayError> {
        let root = self.session.root;
        let resources = self
            .conn()
            .randr_get_screen_resources_current(root)
            .map_err(query_err)?
            .reply()
            .map_err(query_err)?;
        let primary = self
            .conn()
            .randr_get_output_primary(root)
            .map_err(query_err)?
            .reply()
            .map_err(query_err)?
            .output;

        let mut candidates = Vec::with_capacity(resources.outputs.len() + 1);
        if primary != NONE {
            candidates.push(primary);
        }
        candidates.extend(resources.outputs.iter().copied().filter(|o| *o != primary));

        for output in candidates {
            let info = self
                .conn()
                .randr_get_output_info(output, resources.config_timestamp)
                .map_err(query_err)?
                .reply()
                .map_err(query_err)?;
            if info.connection != randr::Connection::CONNECTED || info.crtc == NONE {
                continue;
            }

            let crtc = self
                .conn()
                .randr_get_crtc_info(info.crtc, resources.config_timestamp)
                .map_err(query_err)?
                .reply()
                .map_err(query_err)?;
            if crtc.mode == NONE {
                continue;
            }

            trace!(
                "Using output {} on CRTC {}",
                String::from_utf8_lossy(&info.name),
                info.crtc
            );
            return Ok(ActiveOutput {
                resources,
                crtc_id: info.crtc,
                crtc,
                modes: info.modes,
            });
        }

        Err(DisplayError::Query("no active output".to_string()))
    }

    fn active_crtc_count(&self, resources: &randr::GetScreenResourcesCurrentReply) -> usize {
        resources
            .crtcs
            .iter()
            .filter_map(|crtc| {
                self.conn()
                    .randr_get_crtc_info(*crtc, resources.config_timestamp)
                    .ok()?
                    .reply()
                    .ok()
            })
            .filter(|info| info.mode != NONE)
            .count()
    }

    fn screen_size(&self) -> Result<(u16, u16), DisplayError> {
        let geometry = self
            .conn()
            .get_geometry(self.session.root)
            .map_err(query_err)?
            .reply()
            .map_err(query_err)?;
        Ok((geometry.width, geometry.height))
    }

    fn set_screen_size(&self, width: u16, height: u16) -> Result<(), String> {
        let (px_w, px_h) = self.session.size_px;
        let (mm_w, mm_h) = self.session.size_mm;
        let mm = |px: u16, base_px: u16, base_mm: u16| {
            u32::try_from(u64::from(px) * u64::from(base_mm) / u64::from(base_px.max(1)))
                .unwrap_or(u32::MAX)
        };

        debug!("Resizing screen to {}x{}", width, height);
        self.conn()
            .randr_set_screen_size(
                self.session.root,
                width,
                height,
                mm(width, px_w, mm_w),
                mm(height, px_h, mm_h),
            )
            .map_err(|e| e.to_string())?
            .check()
            .map_err(|e| e.to_string())
    }
}

impl DisplayBackend for X11Display {
    fn current_mode(&self) -> Result<ResolutionMode, DisplayError> {
        let active = self.active_output()?;
        active
            .resources
            .modes
            .iter()
            .find(|info| info.id == active.crtc.mode)
            .map(mode_from_info)
            .ok_or_else(|| DisplayError::Query(format!("mode {} not listed", active.crtc.mode)))
    }

    fn supported_modes(&self) -> Result<Vec<ResolutionMode>, DisplayError> {
        let active = self.active_output()?;
        Ok(supported_from(&active.resources.modes, &active.modes))
    }

    fn apply_mode(&self, mode: ResolutionMode) -> Result<(), DisplayError> {
        let rejected = |reason: String| DisplayError::Rejected { mode, reason };

        let active = self.active_output()?;
        let info = active
            .resources
            .modes
            .iter()
            .filter(|info| active.modes.contains(&info.id))
            .find(|info| mode_from_info(info) == mode)
            .ok_or(DisplayError::Unsupported(mode))?;

        if info.id == active.crtc.mode {
            debug!("Display already at {}", mode);
            return Ok(());
        }

        let (width, height) = if u32::from(active.crtc.rotation) & ROTATED_SIDEWAYS != 0 {
            (info.height, info.width)
        } else {
            (info.width, info.height)
        };
        let extent = |origin: i16, size: u16| {
            u16::try_from(i32::from(origin) + i32::from(size))
                .map_err(|_| rejected(format!("CRTC would end past {}", u16::MAX)))
        };
        let right = extent(active.crtc.x, width)?;
        let bottom = extent(active.crtc.y, height)?;

        let (screen_w, screen_h) = self.screen_size()?;
        if right > screen_w || bottom > screen_h {
            self.set_screen_size(right.max(screen_w), bottom.max(screen_h))
                .map_err(rejected)?;
        }

        let reply = self
            .conn()
            .randr_set_crtc_config(
                active.crtc_id,
                CURRENT_TIME,
                active.resources.config_timestamp,
                active.crtc.x,
                active.crtc.y,
                info.id,
                active.crtc.rotation,
                &active.crtc.outputs,
            )
            .map_err(|e| rejected(e.to_string()))?
            .reply()
            .map_err(|e| rejected(e.to_string()))?;

        if reply.status != randr::SetConfig::SUCCESS {
            return Err(rejected(format!("{:?}", reply.status)));
        }

        if self.active_crtc_count(&active.resources) == 1
            && (right, bottom) != self.screen_size()?
            && let Err(e) = self.set_screen_size(right, bottom)
        {
            warn!("Could not shrink screen after switching to {}: {}", mode, e);
        }

        info!("Display switched to {}", mode);
        Ok(())
    }
}

/// Refresh rate in whole Hz, corrected for double-scan and interlace.
fn refresh_hz(info: &randr::ModeInfo) -> u32 {
    let flags = u32::from(info.mode_flags);
    let mut vtotal = u64::from(info.vtotal);
    if flags & u32::from(randr::ModeFlag::DOUBLE_SCAN) != 0 {
        vtotal *= 2;
    }
    if flags & u32::from(randr::ModeFlag::INTERLACE) != 0 {
        vtotal /= 2;
    }

    let denominator = u64::from(info.htotal) * vtotal;
    if denominator == 0 {
        return 0;
    }
    u32::try_from((u64::from(info.dot_clock) + denominator / 2) / denominator).unwrap_or(u32::MAX)
}

fn mode_from_info(info: &randr::ModeInfo) -> ResolutionMode {
    ResolutionMode::new(u32::from(info.width), u32::from(info.height), refresh_hz(info))
}

/// Modes offered to the user: the output's modes, deduplicated, largest first.
fn supported_from(all: &[randr::ModeInfo], output_modes: &[randr::Mode]) -> Vec<ResolutionMode> {
    let mut modes: Vec<ResolutionMode> = all
        .iter()
        .filter(|info| output_modes.contains(&info.id))
        .map(mode_from_info)
        .collect();
    modes.sort_by_key(|m| Reverse((m.width, m.height, m.frequency)));
    modes.dedup();
    modes
}

/// Focus probe: `_NET_ACTIVE_WINDOW`, then `_NET_WM_PID`, then the process table.
pub struct X11FocusProbe {
    session: X11Session,
    processes: Arc<ProcessTable>,
}

fn focus_err(e: ReplyError) -> FocusError {
    match e {
        ReplyError::ConnectionError(e) => FocusError::Connection(e.to_string()),
        ReplyError::X11Error(e) => FocusError::Query(format!("{:?}", e.error_kind)),
    }
}

impl X11FocusProbe {
    fn window_property(
        &self,
        window: Window,
        property: Atom,
        kind: AtomEnum,
    ) -> Result<Option<u32>, FocusError> {
        let reply = self
            .session
            .conn
            .get_property(false, window, property, kind, 0, 1)
            .map_err(|e| FocusError::Connection(e.to_string()))?
            .reply()
            .map_err(focus_err)?;
        Ok(reply.value32().and_then(|mut values| values.next()))
    }

    fn window_rect(&self, window: Window) -> Result<Rect, FocusError> {
        let conn = &self.session.conn;
        let geometry = conn
            .get_geometry(window)
            .map_err(|e| FocusError::Connection(e.to_string()))?
            .reply()
            .map_err(focus_err)?;
        let origin = conn
            .translate_coordinates(window, self.session.root, 0, 0)
            .map_err(|e| FocusError::Connection(e.to_string()))?
            .reply()
            .map_err(focus_err)?;

        Ok(Rect::new(
            i32::from(origin.dst_x),
            i32::from(origin.dst_y),
            u32::from(geometry.width),
            u32::from(geometry.height),
        ))
    }
}

impl FocusProbe for X11FocusProbe {
    fn foreground(&mut self) -> Result<FocusState, FocusError> {
        let window = self.window_property(
            self.session.root,
            self.session.net_active_window,
            AtomEnum::WINDOW,
        )?;
        let Some(window) = window.filter(|w| *w != NONE) else {
            return Ok(FocusState::Unknown);
        };

        let Some(pid) =
            self.window_property(window, self.session.net_wm_pid, AtomEnum::CARDINAL)?
        else {
            trace!("Window 0x{:x} has no _NET_WM_PID", window);
            return Ok(FocusState::Unknown);
        };

        let Some(name) = self.processes.name_of(pid) else {
            trace!("PID {} of window 0x{:x} is gone", pid, window);
            return Ok(FocusState::Unknown);
        };

        Ok(FocusState::focused(name, self.window_rect(window)?))
    }
}

/// One pointer barrier segment and the directions it lets the pointer cross.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BarrierLine {
    x1: u16,
    y1: u16,
    x2: u16,
    y2: u16,
    directions: xfixes::BarrierDirections,
}

fn clamp_coord(v: i64) -> u16 {
    u16::try_from(v.clamp(0, i64::from(u16::MAX))).unwrap_or(u16::MAX)
}

/// Four barriers enclosing `rect`, each passable only inwards.
fn barrier_lines(rect: Rect) -> [BarrierLine; 4] {
    let left = clamp_coord(i64::from(rect.x));
    let top = clamp_coord(i64::from(rect.y));
    let right = clamp_coord(i64::from(rect.x) + i64::from(rect.width.max(1)));
    let bottom = clamp_coord(i64::from(rect.y) + i64::from(rect.height.max(1)));

    [
        BarrierLine {
            x1: left,
            y1: top,
            x2: left,
            y2: bottom,
            directions: xfixes::BarrierDirections::POSITIVE_X,
        },
        BarrierLine {
            x1: right,
            y1: top,
            x2: right,
            y2: bottom,
            directions: xfixes::BarrierDirections::NEGATIVE_X,
        },
        BarrierLine {
            x1: left,
            y1: top,
            x2: right,
            y2: top,
            directions: xfixes::BarrierDirections::POSITIVE_Y,
        },
        BarrierLine {
            x1: left,
            y1: bottom,
            x2: right,
            y2: bottom,
            directions: xfixes::BarrierDirections::NEGATIVE_Y,
        },
    ]
}

/// XFixes pointer-barrier confiner.
pub struct X11Cursor {
    conn: Arc<RustConnection>,
    root: Window,
    barriers: Vec<xfixes::Barrier>,
}

impl X11Cursor {
    fn new(session: &X11Session) -> Result<Self, CursorError> {
        let unavailable = CursorError::Unavailable;
        let version = session
            .conn
            .xfixes_query_version(5, 0)
            .map_err(|e| unavailable(e.to_string()))?
            .reply()
            .map_err(|e| unavailable(e.to_string()))?;

        if version.major_version < 5 {
            return Err(unavailable(format!(
                "XFixes {}.{} has no pointer barriers",
                version.major_version, version.minor_version
            )));
        }

        Ok(Self {
            conn: Arc::clone(&session.conn),
            root: session.root,
            barriers: Vec::new(),
        })
    }

    /// Barriers only stop crossings, so the pointer must start inside.
    fn warp_inside(&self, rect: Rect) -> Result<(), CursorError> {
        let pointer = self
            .conn
            .query_pointer(self.root)
            .map_err(|e| CursorError::Request(e.to_string()))?
            .reply()
            .map_err(|e| CursorError::Request(e.to_string()))?;

        if rect.contains(i32::from(pointer.root_x), i32::from(pointer.root_y)) {
            return Ok(());
        }

        let centre = |origin: i32, extent: u32| {
            let c = i64::from(origin) + i64::from(extent / 2);
            i16::try_from(c.clamp(0, i64::from(i16::MAX))).unwrap_or(i16::MAX)
        };
        trace!("Warping pointer into {}", rect);
        self.conn
            .warp_pointer(
                NONE,
                self.root,
                0,
                0,
                0,
                0,
                centre(rect.x, rect.width),
                centre(rect.y, rect.height),
            )
            .map_err(|e| CursorError::Request(e.to_string()))?;
        Ok(())
    }
}

impl CursorConfiner for X11Cursor {
    fn confine(&mut self, rect: Rect) -> Result<(), CursorError> {
        self.release()?;
        self.warp_inside(rect)?;

        for line in barrier_lines(rect) {
            let id = self
                .conn
                .generate_id()
                .map_err(|e| CursorError::Request(e.to_string()))?;
            self.conn
                .xfixes_create_pointer_barrier(
                    id,
                    self.root,
                    line.x1,
                    line.y1,
                    line.x2,
                    line.y2,
                    line.directions,
                    &[],
                )
                .map_err(|e| CursorError::Request(e.to_string()))?
                .check()
                .map_err(|e| CursorError::Request(e.to_string()))?;
            self.barriers.push(id);
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), CursorError> {
        if self.barriers.is_empty() {
            return Ok(());
        }
        for id in self.barriers.drain(..) {
            self.conn
                .xfixes_delete_pointer_barrier(id)
                .map_err(|e| CursorError::Request(e.to_string()))?;
        }
        self.conn
            .flush()
            .map_err(|e| CursorError::Request(e.to_string()))
    }
}

impl Drop for X11Cursor {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Stand-in when the server cannot confine the pointer.
struct UnavailableCursor(String);

impl CursorConfiner for UnavailableCursor {
    fn confine(&mut self, _rect: Rect) -> Result<(), CursorError> {
        Err(CursorError::Unavailable(self.0.clone()))
    }

    fn release(&mut self) -> Result<(), CursorError> {
        Ok(())
    }
}

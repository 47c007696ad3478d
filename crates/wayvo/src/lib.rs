//! Wayland video-output backend.
//!
//! Connects the player's render pipeline to a Wayland compositor: window
//! and surface lifecycle, input translation, frame pacing against the
//! compositor's frame clock, and zero-copy import of hardware-decoded
//! frames as dmabuf-backed buffers. The overall flow is:
//!
//! ```text
//!   player core ──options──▶ WayVo ◀──configure/input/feedback── compositor
//!        ▲                     │
//!        │ InputEvent channel  │ draw_frame() / flip()
//!        └─────────────────────┴──▶ wl_buffer on the video subsurface
//! ```
//!
//! Everything runs on one thread: [`WayVo`] owns the single blocking point
//! that polls the connection plus an internal wakeup pipe and dispatches
//! protocol events into [`state::State`]. Other threads may only ring the
//! [`Wakeup`] handle.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe2;
use smithay_client_toolkit::compositor::Region;
use smithay_client_toolkit::output::OutputState;
use smithay_client_toolkit::reexports::client::globals::registry_queue_init;
use smithay_client_toolkit::reexports::client::protocol::wl_shm;
use smithay_client_toolkit::reexports::client::{Connection, EventQueue};
use smithay_client_toolkit::seat::SeatState;
use smithay_client_toolkit::shell::xdg::window::{DecorationMode, WindowDecorations};
use smithay_client_toolkit::shell::WaylandSurface;
use smithay_client_toolkit::shm::slot::SlotPool;
use tracing::{debug, error, warn};

use playercore::{
    HwFrame, InputEvent, InputSender, MimeScorer, OptionStore, SurfaceExporter, VideoParams,
    VoEvents, VoOptions, VsyncInfo,
};

mod cursor;
mod dmabuf;
mod dnd;
mod geom;
mod globals;
mod input;
mod output;
mod present;
mod state;
mod window;

pub use dmabuf::{POOL_MAX_ENTRIES, RESET_FLUSH_DRAWS};
pub use globals::Caps;

use cursor::CursorState;
use dmabuf::BufferPool;
use dnd::Dnd;
use globals::Protocols;
use input::InputState;
use output::OutputRegistry;
use state::State;
use window::Window;

/// Everything the embedder provides to bring the backend up.
pub struct VoInit {
    pub vo_opts: VoOptions,
    pub options: OptionStore,
    pub input: InputSender,
    pub mime_scorer: Box<dyn MimeScorer>,
    /// Exporter for GPU-surface frames; raw descriptor frames work without.
    pub exporter: Option<Box<dyn SurfaceExporter>>,
}

/// Cross-thread wakeup handle: carries no payload, only "re-poll now".
#[derive(Clone)]
pub struct Wakeup(Arc<OwnedFd>);

impl Wakeup {
    pub fn notify(&self) {
        let _ = nix::unistd::write(self.0.as_fd(), &[0u8]);
    }
}

/// The Wayland video output. All methods must be called from one thread.
pub struct WayVo {
    event_queue: EventQueue<State>,
    state: State,
    wakeup_rx: OwnedFd,
    wakeup_tx: Arc<OwnedFd>,
}

impl WayVo {
    /// Connects, negotiates protocols and creates the (unmapped) window.
    ///
    /// Two blocking roundtrips bracket the setup, so required globals,
    /// outputs and the decoration mode are resolved before this returns.
    pub fn new(init: VoInit) -> Result<Self> {
        let conn =
            Connection::connect_to_env().context("failed to connect to Wayland compositor")?;
        let (globals, mut event_queue) =
            registry_queue_init::<State>(&conn).context("failed to initialize registry queue")?;
        let qh = event_queue.handle();

        let (protocols, caps, dmabuf_global) = Protocols::bind(&globals, &qh)?;
        let output_state = OutputState::new(&globals, &qh);
        let seat_state = SeatState::new(&globals, &qh);

        let surface = protocols.compositor.create_surface(&qh);
        let (video_subsurface, video_surface) = protocols
            .subcompositor
            .create_subsurface(surface.clone(), &qh);
        video_subsurface.set_desync();
        // The video surface never takes input.
        if let Ok(region) = Region::new(&protocols.compositor) {
            video_surface.set_input_region(Some(region.wl_region()));
        }
        let cursor_surface = protocols.compositor.create_surface(&qh);

        let opts = init.options.snapshot();
        let decorations = if opts.border {
            WindowDecorations::RequestServer
        } else {
            WindowDecorations::RequestClient
        };
        let xdg = protocols.xdg_shell.create_window(surface, decorations, &qh);

        let viewport = protocols
            .viewporter
            .as_ref()
            .map(|v| v.get_viewport(xdg.wl_surface(), &qh, ()));
        let video_viewport = protocols
            .viewporter
            .as_ref()
            .map(|v| v.get_viewport(&video_surface, &qh, ()));

        let pool = BufferPool::new(dmabuf_global);
        pool.request_feedback(&qh);

        let (wakeup_rx, wakeup_tx) =
            pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).context("failed to create wakeup pipe")?;

        let mut state = State {
            conn: conn.clone(),
            qh,
            caps,
            protocols,
            outputs: OutputRegistry::new(output_state),
            window: Window::new(xdg, video_surface, video_subsurface, viewport, video_viewport),
            input: InputState::new(seat_state),
            dnd: Dnd::default(),
            cursor: CursorState::new(cursor_surface),
            clock: Default::default(),
            pacer: Default::default(),
            pool,
            events: VoEvents::empty(),
            input_tx: init.input,
            scorer: init.mime_scorer,
            exporter: init.exporter,
            opt_cache: init.options.cache(),
            vo_opts: init.vo_opts,
            video: None,
            solid: None,
            display_dead: false,
        };

        // Roundtrip to run the registry; outputs and seats resolve here.
        event_queue
            .roundtrip(&mut state)
            .context("initial roundtrip failed")?;
        if state.outputs.state.outputs().next().is_none() {
            bail!("no outputs found or compositor doesn't support wl_output (ver. 2)");
        }

        if let Ok(desktop) = std::env::var("XDG_CURRENT_DESKTOP") {
            if desktop.contains("GNOME") && !state.caps.idle_inhibit {
                warn!(
                    "GNOME's compositor lacks idle-inhibit support; \
                     the screen can blank during playback"
                );
            }
        }

        if let Some(manager) = &state.protocols.data_device_manager {
            if let Some(seat) = state.input.seat.clone() {
                state.dnd.device = Some(manager.get_data_device(&seat, &state.qh, ()));
            }
        } else {
            debug!("compositor doesn't support wl_data_device_manager (ver. 3)");
        }

        if state.caps.decoration {
            let mode = if opts.border {
                DecorationMode::Server
            } else {
                DecorationMode::Client
            };
            state.request_decoration(mode);
        } else {
            state.opt_cache.write(|o| o.border = false);
        }
        if !state.caps.presentation {
            debug!("compositor doesn't support wp_presentation");
        }

        state.update_app_id();
        state.update_title();

        // Arm the first frame callback and map the surface; the second
        // roundtrip resolves the initial configure and decoration mode.
        state.arm_frame_callback();
        state.window.xdg.wl_surface().commit();
        event_queue
            .roundtrip(&mut state)
            .context("surface setup roundtrip failed")?;

        Ok(Self {
            event_queue,
            state,
            wakeup_rx,
            wakeup_tx: Arc::new(wakeup_tx),
        })
    }

    /// Prepares the window for a new video stream.
    pub fn reconfig(&mut self, params: VideoParams) -> Result<()> {
        debug!(width = params.width, height = params.height, "reconfiguring");
        self.state.video = Some(params);
        self.ensure_solid_buffer()?;

        if self.state.outputs.current.is_none() {
            let opts = self.state.opt_cache.opts();
            let output = self
                .state
                .outputs
                .find_output(opts.fs_screen_id, opts.fs_screen_name.as_deref());
            let Some(output) = output else {
                bail!("no outputs available");
            };
            self.state.outputs.current = Some(output);
            self.state.set_surface_scaling();
            self.state.events |= VoEvents::DPI;
        }

        self.state.set_geometry();
        self.state.window.window_size = self.state.window.vdparams;
        if self.state.vo_opts.configure_bounds {
            self.state.set_window_bounds();
        }

        let opts = self.state.opt_cache.opts().clone();
        if (!opts.fullscreen && !opts.maximized) || self.state.window.geometry.is_empty() {
            self.state.window.geometry = self.state.window.window_size;
        }
        if opts.fullscreen {
            self.state.toggle_fullscreen();
        }
        if opts.maximized {
            self.state.toggle_maximized();
        }
        if opts.minimized {
            self.state.do_minimize();
        }
        self.state.events |= VoEvents::RESIZE;
        Ok(())
    }

    /// Imports and attaches one decoded frame. Returns false when the frame
    /// should be skipped (surface hidden or the import was rejected).
    pub fn draw_frame(&mut self, frame: &HwFrame) -> bool {
        let render = !self.state.pacer.hidden || self.state.vo_opts.disable_vsync;
        self.state.pacer.frame_wait = true;
        if !render {
            return false;
        }

        let Some(buffer) = self.state.import_frame(frame) else {
            return false;
        };
        let surface = &self.state.window.video_surface;
        surface.attach(Some(&buffer), 0, 0);
        surface.damage_buffer(0, 0, i32::MAX, i32::MAX);
        true
    }

    /// Commits the attached frame and paces against the compositor.
    pub fn flip(&mut self) {
        self.state.window.video_surface.commit();
        self.state.window.xdg.wl_surface().commit();
        if !self.state.vo_opts.disable_vsync {
            self.wait_frame();
        }
        if self.state.pacer.use_present {
            self.state.clock.swap();
        }
    }

    /// Seek/reset notification from the player; flushes stale pool entries
    /// over the next couple of draws.
    pub fn notify_reset(&mut self) {
        self.state.pool.request_reset();
    }

    /// Drains pending backend events, applying layout changes first.
    pub fn poll_events(&mut self) -> VoEvents {
        if !self.state.display_dead {
            if self.event_queue.dispatch_pending(&mut self.state).is_err() {
                self.on_display_error();
            }
        }
        self.state.check_dnd_pipe();
        self.state.handle_option_changes();

        let mut events = self.state.take_events();
        if events.contains(VoEvents::RESIZE) {
            events |= VoEvents::EXPOSE;
            self.state.pacer.frame_wait = false;
            self.state.pacer.note_on_time();
            self.state.pacer.hidden = false;
            self.state.apply_resize();
        }
        events
    }

    /// Blocks on the connection and the wakeup pipe until `until` or
    /// activity. The timeout is clamped to ten seconds.
    pub fn wait_events(&mut self, until: Option<Instant>) {
        if self.state.display_dead {
            return;
        }
        let timeout_ms = match until {
            Some(deadline) => {
                let micros = deadline
                    .saturating_duration_since(Instant::now())
                    .as_micros();
                ((micros + 999) / 1000).min(10_000) as u16
            }
            None => 10_000,
        };
        self.dispatch_events(true, timeout_ms);
    }

    /// Handle other threads use to interrupt [`Self::wait_events`].
    pub fn wakeup(&self) -> Wakeup {
        Wakeup(self.wakeup_tx.clone())
    }

    // Queries for the player core.

    pub fn focused(&self) -> bool {
        self.state.window.focused
    }

    pub fn visible(&self) -> bool {
        !self.state.pacer.hidden
    }

    pub fn hidpi_scale(&self) -> f64 {
        self.state.window.scaling as f64
    }

    pub fn displays_spanned(&self) -> Vec<String> {
        self.state.outputs.displays_spanned()
    }

    pub fn displays(&self) -> Vec<playercore::DisplayInfo> {
        self.state.outputs.enumerate()
    }

    pub fn display_fps(&self) -> Option<f64> {
        self.state.outputs.refresh_hz()
    }

    pub fn display_res(&self) -> Option<(i32, i32)> {
        self.state.outputs.resolution()
    }

    /// Vsync timing; only meaningful with presentation-time support.
    pub fn vsync_info(&self) -> Option<VsyncInfo> {
        self.state.pacer.use_present.then(|| self.state.clock.info())
    }

    /// Advertised (format, modifier) pairs for dmabuf import.
    pub fn supported_formats(&self) -> Vec<(u32, u64)> {
        self.state.pool.supported_formats()
    }

    pub fn supported_format(&self, format: u32, modifier: u64) -> bool {
        self.state.pool.supported_format(format, modifier)
    }

    /// The un-fullscreened window size in buffer pixels.
    pub fn window_size(&self) -> (i32, i32) {
        let w = &self.state.window;
        let rect = if self.state.opt_cache.opts().maximized {
            w.geometry
        } else {
            w.window_size
        };
        (rect.width() * w.scaling, rect.height() * w.scaling)
    }

    /// Requests a new windowed size in buffer pixels.
    pub fn set_window_size(&mut self, width: i32, height: i32) {
        self.state.set_window_size(width, height);
    }

    pub fn set_cursor_visible(&mut self, visible: bool) -> bool {
        if self.state.input.pointer.is_none() {
            return false;
        }
        self.state.set_cursor_visibility(visible)
    }

    /// Keeps the screen awake during playback; false when unsupported.
    pub fn inhibit_screensaver(&mut self, inhibit: bool) -> bool {
        self.state.set_screensaver_inhibit(inhibit)
    }

    /// Waits for the outstanding frame callback with a vblank-derived
    /// deadline, then updates the miss accounting.
    fn wait_frame(&mut self) {
        let output_hz = self.state.outputs.refresh_hz().unwrap_or(0.0);
        let vblank_us = self.state.pacer.vblank_interval(&self.state.clock, output_hz);
        let deadline = Instant::now() + Duration::from_micros(vblank_us.max(0) as u64);

        while self.state.pacer.frame_wait && !self.state.display_dead {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            let timeout_ms = ((remaining.as_micros() + 999) / 1000).min(10_000) as u16;
            self.dispatch_events(false, timeout_ms);
        }

        // Without presentation-time the wait is not trustworthy; block on a
        // roundtrip to approximate synchronization.
        if !self.state.pacer.use_present && !self.state.display_dead {
            if self.event_queue.roundtrip(&mut self.state).is_err() {
                self.on_display_error();
            }
        }

        if self.state.pacer.frame_wait {
            self.state.pacer.note_timeout();
        } else {
            self.state.pacer.note_on_time();
        }
    }

    /// The single blocking point: prepare-read / dispatch-pending / flush,
    /// poll the connection (and optionally the wakeup pipe), then read or
    /// cancel. Connection errors are fatal for the window and reported once.
    fn dispatch_events(&mut self, watch_wakeup: bool, timeout_ms: u16) {
        if self.state.display_dead {
            return;
        }

        let guard = loop {
            match self.event_queue.prepare_read() {
                Some(guard) => break guard,
                None => {
                    if self.event_queue.dispatch_pending(&mut self.state).is_err() {
                        self.on_display_error();
                        return;
                    }
                }
            }
        };
        let _ = self.event_queue.flush();

        let conn_fd = guard.connection_fd();
        let (conn_revents, woke) = {
            let mut fds = vec![PollFd::new(conn_fd, PollFlags::POLLIN)];
            if watch_wakeup {
                fds.push(PollFd::new(self.wakeup_rx.as_fd(), PollFlags::POLLIN));
            }
            let _ = poll(&mut fds, PollTimeout::from(timeout_ms));
            let conn_revents = fds[0].revents().unwrap_or(PollFlags::empty());
            let woke = watch_wakeup
                && fds[1]
                    .revents()
                    .map_or(false, |r| r.contains(PollFlags::POLLIN));
            (conn_revents, woke)
        };

        if conn_revents.contains(PollFlags::POLLIN) {
            if guard.read().is_err() {
                self.on_display_error();
                return;
            }
        } else {
            // Cancel the read so other threads are not blocked.
            drop(guard);
        }

        if conn_revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
            self.on_display_error();
            return;
        }

        if woke {
            let mut drain = [0u8; 64];
            while matches!(
                nix::unistd::read(self.wakeup_rx.as_raw_fd(), &mut drain),
                Ok(n) if n > 0
            ) {}
        }

        if self.event_queue.dispatch_pending(&mut self.state).is_err() {
            self.on_display_error();
        }
    }

    fn on_display_error(&mut self) {
        if self.state.display_dead {
            return;
        }
        error!("error occurred on the display connection, closing");
        self.state.display_dead = true;
        self.state.input_tx.put(InputEvent::CloseRequested);
    }

    fn ensure_solid_buffer(&mut self) -> Result<()> {
        if self.state.solid.is_some() {
            return Ok(());
        }
        // One XRGB pixel, stride aligned up to 16.
        let stride = 16;
        let mut pool = SlotPool::new(stride as usize, &self.state.protocols.shm)
            .context("failed to allocate shared memory for the window backing")?;
        let (buffer, canvas) = pool
            .create_buffer(1, 1, stride, wl_shm::Format::Xrgb8888)
            .context("failed to create the solid buffer")?;
        canvas.fill(0);
        buffer
            .attach_to(self.state.window.xdg.wl_surface())
            .context("failed to attach the solid buffer")?;
        self.state.solid = Some((pool, buffer));
        Ok(())
    }
}

impl Drop for WayVo {
    fn drop(&mut self) {
        self.state.input_tx.put(InputEvent::ReleaseAll);
        self.state.pool.teardown();
    }
}

//! Window state machine: geometry, fullscreen/maximize/decoration/focus,
//! and reconciliation of compositor configure events against user-requested
//! state.

use smithay_client_toolkit::compositor::{CompositorHandler, Region};
use smithay_client_toolkit::reexports::client::protocol::wl_output::{Transform, WlOutput};
use smithay_client_toolkit::reexports::client::protocol::wl_subsurface::WlSubsurface;
use smithay_client_toolkit::reexports::client::protocol::wl_surface::WlSurface;
use smithay_client_toolkit::reexports::client::{Connection, QueueHandle};
use smithay_client_toolkit::reexports::csd_frame::WindowState as XdgWindowState;
use smithay_client_toolkit::reexports::protocols::wp::idle_inhibit::zv1::client::zwp_idle_inhibitor_v1::ZwpIdleInhibitorV1;
use smithay_client_toolkit::reexports::protocols::wp::viewporter::client::wp_viewport::WpViewport;
use smithay_client_toolkit::reexports::protocols::xdg::shell::client::xdg_toplevel::ResizeEdge;
use smithay_client_toolkit::shell::xdg::window::{
    DecorationMode, Window as XdgWindow, WindowConfigure, WindowHandler,
};
use smithay_client_toolkit::shell::WaylandSurface;
use smithay_client_toolkit::{delegate_compositor, delegate_xdg_shell, delegate_xdg_window};
use tracing::{debug, trace};

use playercore::{InputEvent, VoEvents, WinOpt};

use crate::geom::{self, Rect};
use crate::state::State;

/// The toplevel window and its negotiated state.
///
/// Geometry fields are in logical (surface-local) pixels; the buffer scale
/// is applied when talking to the renderer.
pub struct Window {
    pub xdg: XdgWindow,
    /// Video frames land here; the toplevel surface carries a solid color.
    pub video_surface: WlSurface,
    pub video_subsurface: WlSubsurface,
    pub viewport: Option<WpViewport>,
    pub video_viewport: Option<WpViewport>,
    pub idle_inhibitor: Option<ZwpIdleInhibitorV1>,

    /// Committed content rect. Stays empty until the first reconfigure.
    pub geometry: Rect,
    /// Last windowed (not fullscreen/maximized) size.
    pub window_size: Rect,
    /// Natural size derived from the video params and options.
    pub vdparams: Rect,
    /// Compositor-suggested maximum size, 0 = unbounded.
    pub bounded: (i32, i32),
    /// Size from the most recent toplevel configure.
    pub toplevel_size: (i32, i32),
    /// GCD-reduced aspect pair of the natural size.
    pub reduced: (i32, i32),
    pub scaling: i32,

    pub activated: bool,
    pub focused: bool,
    /// A fullscreen/maximize transition is waiting for its configure.
    pub state_change: bool,
    /// Set after a configure-driven resize; suppresses one stale motion.
    pub toplevel_configured: bool,
    pub requested_decoration: Option<DecorationMode>,
}

impl Window {
    pub fn new(
        xdg: XdgWindow,
        video_surface: WlSurface,
        video_subsurface: WlSubsurface,
        viewport: Option<WpViewport>,
        video_viewport: Option<WpViewport>,
    ) -> Self {
        Self {
            xdg,
            video_surface,
            video_subsurface,
            viewport,
            video_viewport,
            idle_inhibitor: None,
            geometry: Rect::default(),
            window_size: Rect::default(),
            vdparams: Rect::default(),
            bounded: (0, 0),
            toplevel_size: (0, 0),
            reduced: (0, 0),
            scaling: 1,
            activated: false,
            focused: false,
            state_change: false,
            toplevel_configured: false,
            requested_decoration: None,
        }
    }
}

/// Inputs for reconciling one toplevel configure.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConfigureInput {
    /// Suggested size; zero means "pick your own".
    pub width: i32,
    pub height: i32,
    pub old_toplevel: (i32, i32),
    pub is_fullscreen: bool,
    pub is_maximized: bool,
    pub state_change: bool,
    pub keep_aspect: bool,
    pub reduced: (i32, i32),
    pub geometry: Rect,
    pub window_size: Rect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConfigureResult {
    pub geometry: Rect,
    pub window_size: Rect,
    pub resize: bool,
    pub clear_state_change: bool,
}

/// Pure size reconciliation, mirroring the state machine's edge cases:
/// a configure completing an un-fullscreen/un-maximize restores the last
/// windowed size; zero width or height reuses the last windowed size rather
/// than resizing to zero; aspect-locked windowed resizes recompute the
/// height from the reduced aspect pair.
pub(crate) fn reconcile_configure(input: ConfigureInput) -> ConfigureResult {
    let mut result = ConfigureResult {
        geometry: input.geometry,
        window_size: input.window_size,
        resize: false,
        clear_state_change: false,
    };
    let windowed = !input.is_fullscreen && !input.is_maximized;

    if input.state_change && windowed {
        result.geometry = input.window_size;
        result.resize = true;
        result.clear_state_change = true;
        return result;
    }

    // Reuse the old size if either dimension is zero.
    if input.width == 0 || input.height == 0 {
        if windowed {
            result.geometry = input.window_size;
        }
        result.resize = true;
        return result;
    }

    if input.old_toplevel == (input.width, input.height) {
        return result;
    }

    let width = input.width;
    let mut height = input.height;
    if windowed {
        if input.keep_aspect {
            height = geom::aspect_height(input.reduced, width);
        }
        result.window_size = Rect::from_size(width, height);
    }
    result.geometry = Rect::from_size(width, height);
    if result.geometry == input.geometry {
        return result;
    }
    result.resize = true;
    result
}

/// Which resize edge a point inside the margin maps to; corners take
/// precedence over single edges.
pub(crate) fn edge_for_point(
    x: f64,
    y: f64,
    width: i32,
    height: i32,
    margin: i32,
) -> Option<ResizeEdge> {
    let (x, y) = (x as i32, y as i32);
    let left = x < margin;
    let top = y < margin;
    let right = x > width - margin;
    let bottom = y > height - margin;

    let edge = if left {
        if top {
            ResizeEdge::TopLeft
        } else if bottom {
            ResizeEdge::BottomLeft
        } else {
            ResizeEdge::Left
        }
    } else if right {
        if top {
            ResizeEdge::TopRight
        } else if bottom {
            ResizeEdge::BottomRight
        } else {
            ResizeEdge::Right
        }
    } else if top {
        ResizeEdge::Top
    } else if bottom {
        ResizeEdge::Bottom
    } else {
        return None;
    };
    Some(edge)
}

impl State {
    /// Recomputes the natural window size and the reduced aspect pair from
    /// the video params, the geometry option and the current output.
    pub(crate) fn set_geometry(&mut self) {
        if self.outputs.current.is_none() {
            return;
        }
        let Some(params) = self.video else {
            return;
        };
        let (width, height) = self
            .opt_cache
            .opts()
            .geometry
            .map(|(w, h)| (w as i32, h as i32))
            .unwrap_or((params.width as i32, params.height as i32));

        self.window.reduced = geom::reduce_aspect(width, height);
        let scaling = self.window.scaling.max(1);
        self.window.vdparams = Rect::from_size(width / scaling, height / scaling);
    }

    /// Applies the output scale factor (or 1) to the surface and rescales
    /// the cached logical sizes.
    pub(crate) fn set_surface_scaling(&mut self) {
        let old = self.window.scaling.max(1);
        let new = if self.opt_cache.opts().hidpi_window_scale {
            self.outputs.scale().max(1)
        } else {
            1
        };

        self.window.vdparams = self.window.vdparams.scale(old, new);
        self.window.window_size = self.window.window_size.scale(old, new);
        self.window.scaling = new;
        self.window.xdg.wl_surface().set_buffer_scale(new);
    }

    /// Clamps the pending window size to the compositor-suggested bounds.
    pub(crate) fn set_window_bounds(&mut self) {
        let (bw, bh) = self.window.bounded;
        if bw > 0 && bw < self.window.window_size.x1 {
            self.window.window_size.x1 = bw;
        }
        if bh > 0 && bh < self.window.window_size.y1 {
            self.window.window_size.y1 = bh;
        }
    }

    pub(crate) fn toggle_fullscreen(&mut self) {
        self.window.state_change = true;
        let opts = self.opt_cache.opts();
        if opts.fullscreen {
            let specific = opts.fs_screen_id.is_some() || opts.fs_screen_name.is_some();
            let output = if specific {
                self.outputs
                    .find_output(opts.fs_screen_id, opts.fs_screen_name.as_deref())
            } else {
                None
            };
            self.window.xdg.set_fullscreen(output.as_ref());
        } else {
            self.window.xdg.unset_fullscreen();
        }
    }

    pub(crate) fn toggle_maximized(&mut self) {
        self.window.state_change = true;
        if self.opt_cache.opts().maximized {
            self.window.xdg.set_maximized();
        } else {
            self.window.xdg.unset_maximized();
        }
    }

    pub(crate) fn do_minimize(&mut self) {
        if self.opt_cache.opts().minimized {
            self.window.xdg.set_minimized();
        }
    }

    pub(crate) fn update_app_id(&mut self) {
        self.window.xdg.set_app_id(self.opt_cache.opts().app_id.clone());
    }

    pub(crate) fn update_title(&mut self) {
        // xdg-shell requires UTF-8 titles; Rust strings already are.
        self.window.xdg.set_title(self.opt_cache.opts().title.clone());
    }

    pub(crate) fn request_decoration(&mut self, mode: DecorationMode) {
        self.window.requested_decoration = Some(mode);
        self.window.xdg.request_decoration_mode(Some(mode));
    }

    /// Enables or disables the idle inhibitor. Returns false when the
    /// compositor lacks the protocol.
    pub(crate) fn set_screensaver_inhibit(&mut self, inhibit: bool) -> bool {
        let Some(manager) = &self.protocols.idle_inhibit else {
            return false;
        };
        if inhibit == self.window.idle_inhibitor.is_some() {
            return true;
        }
        if inhibit {
            debug!("enabling idle inhibitor");
            let inhibitor =
                manager.create_inhibitor(self.window.xdg.wl_surface(), &self.qh, ());
            self.window.idle_inhibitor = Some(inhibitor);
        } else {
            debug!("disabling the idle inhibitor");
            if let Some(inhibitor) = self.window.idle_inhibitor.take() {
                inhibitor.destroy();
            }
        }
        true
    }

    /// Applies option changes pushed by the player core, turning each into
    /// the matching protocol request. Compositor-owned state (fullscreen,
    /// maximized, border) becomes effective only with the next configure.
    pub(crate) fn handle_option_changes(&mut self) {
        for opt in self.opt_cache.drain_changed() {
            match opt {
                WinOpt::AppId => self.update_app_id(),
                WinOpt::Title => self.update_title(),
                WinOpt::Fullscreen => self.toggle_fullscreen(),
                WinOpt::Maximized => self.toggle_maximized(),
                WinOpt::Minimized => self.do_minimize(),
                WinOpt::HidpiWindowScale => self.set_surface_scaling(),
                WinOpt::Border => {
                    let requested = self.opt_cache.opts().border;
                    if self.caps.decoration {
                        // The option must not change until the compositor
                        // answers; flip it back and let the configure ack
                        // write the final value.
                        self.opt_cache.write(|o| o.border = !requested);
                        self.request_decoration(if requested {
                            DecorationMode::Server
                        } else {
                            DecorationMode::Client
                        });
                    } else {
                        self.opt_cache.write(|o| o.border = false);
                    }
                }
                WinOpt::Geometry => {
                    if self.outputs.current.is_some() {
                        self.set_geometry();
                        self.window.window_size = self.window.vdparams;
                        let opts = self.opt_cache.opts();
                        if !opts.fullscreen && !opts.maximized {
                            self.window.geometry = self.window.window_size;
                        }
                        self.events |= VoEvents::RESIZE;
                    }
                }
                WinOpt::KeepAspectWindow | WinOpt::FsScreen | WinOpt::NativeKeyrepeat => {}
            }
        }
    }

    /// Resizes the window while staying windowed, checking that a pending
    /// unmaximize was actually honored before applying the size.
    pub(crate) fn set_window_size(&mut self, width: i32, height: i32) {
        let scaling = self.window.scaling.max(1);
        self.window.window_size = Rect::from_size(width / scaling, height / scaling);
        let opts = self.opt_cache.opts();
        if opts.fullscreen {
            return;
        }
        if opts.maximized {
            self.window.xdg.unset_maximized();
            let _ = self.conn.flush();
            if self.opt_cache.opts().maximized {
                return;
            }
        }
        self.window.geometry = self.window.window_size;
        self.events |= VoEvents::RESIZE;
    }

    pub(crate) fn refresh_focus(&mut self) {
        let activated = self.window.activated;
        let focused = self.window.focused;
        if (!focused && activated && self.input.has_keyboard_input) || (focused && !activated) {
            self.window.focused = !focused;
            self.events |= VoEvents::FOCUS;
        }
    }

    /// Re-layouts the surfaces after a geometry change: opaque region, the
    /// two viewport destinations and the video subsurface position.
    pub(crate) fn apply_resize(&mut self) {
        let geometry = self.window.geometry;
        if geometry.is_empty() {
            return;
        }
        self.set_opaque_region(true);

        let src = self
            .video
            .map(|p| (p.width, p.height))
            .unwrap_or((geometry.width() as u32, geometry.height() as u32));
        let dst = geom::fit_rect(src, geometry.width(), geometry.height());

        if let Some(viewport) = &self.window.viewport {
            viewport.set_destination(2 * dst.x0 + dst.width(), 2 * dst.y0 + dst.height());
        }
        if let Some(viewport) = &self.window.video_viewport {
            viewport.set_destination(dst.width(), dst.height());
        }
        self.window.video_subsurface.set_position(dst.x0, dst.y0);
        trace!(
            "layout {}x{} -> video {}x{}+{}+{}",
            geometry.width(),
            geometry.height(),
            dst.width(),
            dst.height(),
            dst.x0,
            dst.y0
        );
    }

    pub(crate) fn set_opaque_region(&mut self, opaque: bool) {
        let surface = self.window.xdg.wl_surface();
        let geometry = self.window.geometry;
        if !opaque || geometry.is_empty() {
            surface.set_opaque_region(None);
            return;
        }
        match Region::new(&self.protocols.compositor) {
            Ok(region) => {
                region.add(0, 0, geometry.width(), geometry.height());
                surface.set_opaque_region(Some(region.wl_region()));
            }
            Err(err) => {
                debug!(error = %err, "failed to create opaque region");
                surface.set_opaque_region(None);
            }
        }
    }
}

impl WindowHandler for State {
    fn request_close(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _window: &XdgWindow) {
        self.input_tx.put(InputEvent::CloseRequested);
    }

    fn configure(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _window: &XdgWindow,
        configure: WindowConfigure,
        _serial: u32,
    ) {
        let width = configure.new_size.0.map(|v| v.get() as i32).unwrap_or(0);
        let height = configure.new_size.1.map(|v| v.get() as i32).unwrap_or(0);
        let old_toplevel = self.window.toplevel_size;
        self.window.toplevel_size = (width, height);

        if let Some((bw, bh)) = configure.suggested_bounds {
            self.window.bounded = (bw as i32, bh as i32);
        }

        // Decoration requests are acked through configure; a mismatch means
        // the compositor insists on its mode. Never retried.
        if let Some(requested) = self.window.requested_decoration.take() {
            if requested != configure.decoration_mode {
                debug!(
                    ?requested,
                    got = ?configure.decoration_mode,
                    "compositor overrode the requested decoration mode"
                );
            }
        }
        if self.caps.decoration {
            let server_side = configure.decoration_mode == DecorationMode::Server;
            if self.opt_cache.opts().border != server_side {
                self.opt_cache.write(|o| o.border = server_side);
            }
        }

        // Buffer everything else until the initial geometry exists.
        if self.window.geometry.is_empty() {
            return;
        }

        let is_fullscreen = configure.state.contains(XdgWindowState::FULLSCREEN);
        let tiled = XdgWindowState::TILED_TOP
            | XdgWindowState::TILED_LEFT
            | XdgWindowState::TILED_RIGHT
            | XdgWindowState::TILED_BOTTOM;
        let is_maximized =
            configure.state.contains(XdgWindowState::MAXIMIZED) || configure.state.intersects(tiled);
        let is_activated = configure.state.contains(XdgWindowState::ACTIVATED);

        if is_activated {
            // Activated rules out minimized; the exact state is unknowable.
            if self.opt_cache.opts().minimized {
                self.opt_cache.write(|o| o.minimized = false);
            }
        }

        if self.opt_cache.opts().fullscreen != is_fullscreen {
            self.window.state_change = true;
            self.opt_cache.write(|o| o.fullscreen = is_fullscreen);
        }
        if self.opt_cache.opts().maximized != is_maximized {
            self.window.state_change = true;
            self.opt_cache.write(|o| o.maximized = is_maximized);
        }

        if self.window.activated != is_activated {
            self.window.activated = is_activated;
            self.refresh_focus();
            // Force a redraw to be on the safe side.
            if is_activated {
                self.pacer.hidden = false;
                self.events |= VoEvents::EXPOSE;
            }
        }

        let result = reconcile_configure(ConfigureInput {
            width,
            height,
            old_toplevel,
            is_fullscreen,
            is_maximized,
            state_change: self.window.state_change,
            keep_aspect: self.opt_cache.opts().keep_aspect_window,
            reduced: self.window.reduced,
            geometry: self.window.geometry,
            window_size: self.window.window_size,
        });
        if result.clear_state_change {
            self.window.state_change = false;
        }
        let old_geometry = self.window.geometry;
        self.window.geometry = result.geometry;
        self.window.window_size = result.window_size;
        if result.resize {
            debug!(
                "resizing due to configure from {}x{} to {}x{}",
                old_geometry.width() * self.window.scaling,
                old_geometry.height() * self.window.scaling,
                result.geometry.width() * self.window.scaling,
                result.geometry.height() * self.window.scaling,
            );
            self.events |= VoEvents::RESIZE;
            self.window.toplevel_configured = true;
        }
    }
}

impl CompositorHandler for State {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &WlSurface,
        _new_factor: i32,
    ) {
        // Scaling follows the entered output instead.
    }

    fn transform_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _surface: &WlSurface,
        _new_transform: Transform,
    ) {
    }

    fn frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &WlSurface,
        _time: u32,
    ) {
        if surface != self.window.xdg.wl_surface() {
            return;
        }
        self.on_frame_callback();
    }

    fn surface_enter(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &WlSurface,
        output: &WlOutput,
    ) {
        if surface != self.window.xdg.wl_surface() {
            return;
        }
        self.outputs.mark_spanned(output);
        self.events |= VoEvents::WIN_STATE;

        if self.outputs.current.is_none() {
            return;
        }
        let output_changed = self.outputs.current.as_ref() != Some(output);
        self.outputs.current = Some(output.clone());

        let old_geometry = self.window.geometry;
        let mut force_resize = false;
        if self.window.scaling != self.outputs.scale() {
            self.set_surface_scaling();
            self.spawn_cursor();
            force_resize = true;
            self.events |= VoEvents::DPI;
        }
        if output_changed {
            self.set_geometry();
            force_resize = true;
        }
        if force_resize || old_geometry != self.window.geometry {
            self.events |= VoEvents::RESIZE;
        }
        trace!(scale = self.window.scaling, "surface entered output");
    }

    fn surface_leave(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &WlSurface,
        output: &WlOutput,
    ) {
        if surface != self.window.xdg.wl_surface() {
            return;
        }
        self.outputs.unmark_spanned(output);
        self.events |= VoEvents::WIN_STATE;
    }
}

delegate_compositor!(State);
delegate_xdg_shell!(State);
delegate_xdg_window!(State);

#[cfg(test)]
mod tests {
    use super::*;

    fn windowed_input() -> ConfigureInput {
        ConfigureInput {
            width: 0,
            height: 0,
            old_toplevel: (0, 0),
            is_fullscreen: false,
            is_maximized: false,
            state_change: false,
            keep_aspect: false,
            reduced: (16, 9),
            geometry: Rect::from_size(1280, 720),
            window_size: Rect::from_size(1280, 720),
        }
    }

    #[test]
    fn zero_size_configure_reuses_last_windowed_size() {
        let result = reconcile_configure(windowed_input());
        assert_eq!(result.geometry, Rect::from_size(1280, 720));
        assert!(result.resize);
        // Never zero.
        assert!(!result.geometry.is_empty());
    }

    #[test]
    fn first_real_configure_applies_suggested_size() {
        let result = reconcile_configure(ConfigureInput {
            width: 800,
            height: 600,
            ..windowed_input()
        });
        assert_eq!(result.geometry, Rect::from_size(800, 600));
        assert_eq!(result.window_size, Rect::from_size(800, 600));
        assert!(result.resize);
    }

    #[test]
    fn repeated_toplevel_size_is_ignored() {
        let result = reconcile_configure(ConfigureInput {
            width: 800,
            height: 600,
            old_toplevel: (800, 600),
            ..windowed_input()
        });
        assert!(!result.resize);
        assert_eq!(result.geometry, Rect::from_size(1280, 720));
    }

    #[test]
    fn aspect_locked_resize_recomputes_height() {
        let result = reconcile_configure(ConfigureInput {
            width: 1000,
            height: 333,
            keep_aspect: true,
            ..windowed_input()
        });
        // ceil(9 * 1000 / 16) = 563
        assert_eq!(result.geometry, Rect::from_size(1000, 563));
        assert_eq!(result.window_size, Rect::from_size(1000, 563));
    }

    #[test]
    fn fullscreen_configure_does_not_touch_window_size() {
        let result = reconcile_configure(ConfigureInput {
            width: 3840,
            height: 2160,
            is_fullscreen: true,
            keep_aspect: true,
            ..windowed_input()
        });
        assert_eq!(result.geometry, Rect::from_size(3840, 2160));
        assert_eq!(result.window_size, Rect::from_size(1280, 720));
        assert!(result.resize);
    }

    #[test]
    fn leaving_maximized_restores_windowed_size() {
        let result = reconcile_configure(ConfigureInput {
            width: 1920,
            height: 1080,
            state_change: true,
            ..windowed_input()
        });
        assert_eq!(result.geometry, Rect::from_size(1280, 720));
        assert!(result.resize);
        assert!(result.clear_state_change);
    }

    #[test]
    fn corner_edges_take_precedence() {
        assert_eq!(
            edge_for_point(3.0, 4.0, 1000, 800, 10),
            Some(ResizeEdge::TopLeft)
        );
        assert_eq!(
            edge_for_point(996.0, 795.0, 1000, 800, 10),
            Some(ResizeEdge::BottomRight)
        );
        assert_eq!(
            edge_for_point(4.0, 794.0, 1000, 800, 10),
            Some(ResizeEdge::BottomLeft)
        );
        assert_eq!(
            edge_for_point(500.0, 3.0, 1000, 800, 10),
            Some(ResizeEdge::Top)
        );
        assert_eq!(
            edge_for_point(2.0, 400.0, 1000, 800, 10),
            Some(ResizeEdge::Left)
        );
        assert_eq!(edge_for_point(500.0, 400.0, 1000, 800, 10), None);
    }

    #[test]
    fn touch_margin_widens_the_edge_zone() {
        assert_eq!(edge_for_point(20.0, 400.0, 1000, 800, 10), None);
        assert_eq!(
            edge_for_point(20.0, 400.0, 1000, 800, 32),
            Some(ResizeEdge::Left)
        );
    }
}

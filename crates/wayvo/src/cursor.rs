//! Pointer cursor handling.
//!
//! The theme and size come from `XCURSOR_THEME` / `XCURSOR_SIZE` at
//! (re)creation time, scaled by the surface scale. A loaded theme is reused
//! until the scale changes.

use smithay_client_toolkit::reexports::client::protocol::wl_buffer::WlBuffer;
use smithay_client_toolkit::reexports::client::protocol::wl_surface::WlSurface;
use wayland_cursor::CursorTheme;
use tracing::error;

use crate::state::State;

const DEFAULT_CURSOR_SIZE: u32 = 24;

pub struct CursorState {
    pub surface: WlSurface,
    theme: Option<CursorTheme>,
    allocated_scale: i32,
    pub visible: bool,
}

impl CursorState {
    pub fn new(surface: WlSurface) -> Self {
        Self {
            surface,
            theme: None,
            allocated_scale: 0,
            visible: true,
        }
    }
}

fn cursor_size_from_env() -> u32 {
    std::env::var("XCURSOR_SIZE")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|&size| size > 0)
        .unwrap_or(DEFAULT_CURSOR_SIZE)
}

impl State {
    /// (Re)loads the cursor theme for the current scale. Reuses the loaded
    /// theme when the scale is unchanged.
    pub(crate) fn spawn_cursor(&mut self) {
        if self.input.pointer.is_none() || self.cursor.allocated_scale == self.window.scaling {
            return;
        }

        let scale = self.window.scaling.max(1) as u32;
        let size = cursor_size_from_env() * scale;
        let theme_name = std::env::var("XCURSOR_THEME").ok();
        let theme = match CursorTheme::load_or(
            &self.conn,
            self.protocols.shm.wl_shm().clone(),
            theme_name.as_deref().unwrap_or("default"),
            size,
        ) {
            Ok(theme) => theme,
            Err(err) => {
                error!(error = %err, "unable to load cursor theme");
                return;
            }
        };
        self.cursor.theme = Some(theme);
        self.cursor.allocated_scale = self.window.scaling;
    }

    /// Shows or hides the cursor on the pointer's current surface entry.
    pub(crate) fn set_cursor_visibility(&mut self, visible: bool) -> bool {
        self.cursor.visible = visible;
        self.apply_cursor_visibility()
    }

    /// Re-asserts the stored visibility, e.g. on pointer enter.
    pub(crate) fn apply_cursor_visibility(&mut self) -> bool {
        let Some(pointer) = self.input.pointer.clone() else {
            return false;
        };
        let serial = self.input.pointer_serial;

        if !self.cursor.visible {
            pointer.set_cursor(serial, None, 0, 0);
            return true;
        }

        self.spawn_cursor();
        let scale = self.window.scaling.max(1);
        let Some(theme) = self.cursor.theme.as_mut() else {
            return false;
        };
        let Some(cursor) = theme.get_cursor("left_ptr") else {
            error!("cursor theme has no left_ptr cursor");
            return false;
        };
        let image = &cursor[0];
        let (hx, hy) = image.hotspot();
        let (w, h) = image.dimensions();
        let buffer: &WlBuffer = image;

        pointer.set_cursor(
            serial,
            Some(&self.cursor.surface),
            hx as i32 / scale,
            hy as i32 / scale,
        );
        self.cursor.surface.set_buffer_scale(scale);
        self.cursor.surface.attach(Some(buffer), 0, 0);
        self.cursor.surface.damage_buffer(0, 0, w as i32, h as i32);
        self.cursor.surface.commit();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_size_falls_back_to_default() {
        // Not set in the test environment, or set to something sane; either
        // way the result is positive.
        assert!(cursor_size_from_env() > 0);
    }
}

//! Input translation: seat capabilities, keyboard (xkb), pointer and touch.
//!
//! Keyboard handling bypasses the toolkit so modifier reporting can use the
//! "active but not consumed" xkb query per key, which depends on the
//! compositor-supplied keymap. The keymap is compiled fresh from every
//! keymap event; the previous one is dropped.

use std::fs::File;

use memmap2::MmapOptions;
use smithay_client_toolkit::reexports::client::protocol::wl_keyboard::{
    self, KeymapFormat, WlKeyboard,
};
use smithay_client_toolkit::reexports::client::protocol::wl_pointer::WlPointer;
use smithay_client_toolkit::reexports::client::protocol::wl_seat::WlSeat;
use smithay_client_toolkit::reexports::client::protocol::wl_touch::WlTouch;
use smithay_client_toolkit::reexports::client::protocol::wl_surface::WlSurface;
use smithay_client_toolkit::reexports::client::{Connection, Dispatch, QueueHandle, WEnum};
use smithay_client_toolkit::seat::pointer::{PointerEvent, PointerEventKind, PointerHandler};
use smithay_client_toolkit::seat::touch::TouchHandler;
use smithay_client_toolkit::seat::{Capability, SeatHandler, SeatState};
use smithay_client_toolkit::shell::WaylandSurface;
use smithay_client_toolkit::{delegate_pointer, delegate_seat, delegate_touch};
use tracing::error;
use xkbcommon::xkb;

use playercore::{InputEvent, Key, KeyState, Modifiers, MouseButton, WheelDirection};

use crate::state::State;
use crate::window::edge_for_point;

// Linux evdev button codes as they appear on the wire.
const BTN_MOUSE: u32 = 0x110;
const BTN_LEFT: u32 = 0x110;
const BTN_RIGHT: u32 = 0x111;
const BTN_MIDDLE: u32 = 0x112;
const BTN_SIDE: u32 = 0x113;
const BTN_EXTRA: u32 = 0x114;
const BTN_FORWARD: u32 = 0x115;
const BTN_JOYSTICK: u32 = 0x120;

/// Seat, keyboard, pointer and touch session state.
pub struct InputState {
    pub seat_state: SeatState,
    pub seat: Option<WlSeat>,
    pub keyboard: Option<WlKeyboard>,
    pub pointer: Option<WlPointer>,
    pub touch: Option<WlTouch>,

    xkb_context: xkb::Context,
    xkb_keymap: Option<xkb::Keymap>,
    xkb_state: Option<xkb::State>,
    /// xkb keycode of the most recent key event (evdev + 8).
    keyboard_code: u32,
    pub has_keyboard_input: bool,

    /// Pointer position, scaled to buffer pixels.
    pub mouse: (i32, i32),
    /// Pointer position in surface-local coordinates.
    pub mouse_unscaled: (f64, f64),
    pub pointer_serial: u32,
}

impl InputState {
    pub fn new(seat_state: SeatState) -> Self {
        Self {
            seat_state,
            seat: None,
            keyboard: None,
            pointer: None,
            touch: None,
            xkb_context: xkb::Context::new(xkb::CONTEXT_NO_FLAGS),
            xkb_keymap: None,
            xkb_state: None,
            keyboard_code: 0,
            has_keyboard_input: false,
            mouse: (0, 0),
            mouse_unscaled: (0.0, 0.0),
            pointer_serial: 0,
        }
    }

    fn load_keymap(&mut self, format: WEnum<KeymapFormat>, fd: std::os::fd::OwnedFd, size: u32) {
        if format != WEnum::Value(KeymapFormat::XkbV1) {
            return;
        }
        let file = File::from(fd);
        let map = match unsafe { MmapOptions::new().len(size as usize).map_copy_read_only(&file) }
        {
            Ok(map) => map,
            Err(err) => {
                error!(error = %err, "failed to map keymap fd");
                return;
            }
        };

        let end = map.iter().position(|&b| b == 0).unwrap_or(map.len());
        let text = String::from_utf8_lossy(&map[..end]).into_owned();
        let Some(keymap) = xkb::Keymap::new_from_string(
            &self.xkb_context,
            text,
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        ) else {
            error!("failed to compile keymap");
            self.xkb_keymap = None;
            self.xkb_state = None;
            return;
        };
        self.xkb_state = Some(xkb::State::new(&keymap));
        self.xkb_keymap = Some(keymap);
    }

    /// Modifiers that are depressed and not consumed by the current key.
    fn active_mods(&mut self) -> Modifiers {
        let (Some(keymap), Some(state)) = (&self.xkb_keymap, &mut self.xkb_state) else {
            return Modifiers::empty();
        };
        let keycode = xkb::Keycode::new(self.keyboard_code);
        let mut mods = Modifiers::empty();
        for (name, flag) in [
            (xkb::MOD_NAME_SHIFT, Modifiers::SHIFT),
            (xkb::MOD_NAME_CTRL, Modifiers::CTRL),
            (xkb::MOD_NAME_ALT, Modifiers::ALT),
            (xkb::MOD_NAME_LOGO, Modifiers::META),
        ] {
            let index = keymap.mod_get_index(name);
            if state.mod_index_is_active(index, xkb::STATE_MODS_DEPRESSED)
                && !state.mod_index_is_consumed(keycode, index)
            {
                mods |= flag;
            }
        }
        mods
    }
}

/// ASCII fast path plus the keysym lookup table.
fn lookup_key(sym: u32) -> Option<Key> {
    const PASSTHROUGH: &str = " -+*/<>`~!@#$%^&()_{}:;\"',.?\\|=[]";
    if let Some(c) = char::from_u32(sym) {
        if c.is_ascii_alphanumeric() || (sym > 0 && sym < 256 && PASSTHROUGH.contains(c)) {
            return Some(Key::Char(c));
        }
    }

    use xkb::keysyms as ks;
    let key = match sym {
        ks::KEY_Pause => Key::Pause,
        ks::KEY_Escape => Key::Esc,
        ks::KEY_BackSpace => Key::Backspace,
        ks::KEY_Tab => Key::Tab,
        ks::KEY_Return => Key::Enter,
        ks::KEY_Menu => Key::Menu,
        ks::KEY_Print => Key::Print,

        ks::KEY_Left => Key::Left,
        ks::KEY_Right => Key::Right,
        ks::KEY_Up => Key::Up,
        ks::KEY_Down => Key::Down,

        ks::KEY_Insert => Key::Insert,
        ks::KEY_Delete => Key::Delete,
        ks::KEY_Home => Key::Home,
        ks::KEY_End => Key::End,
        ks::KEY_Page_Up => Key::PageUp,
        ks::KEY_Page_Down => Key::PageDown,

        ks::KEY_F1..=ks::KEY_F24 => Key::F((sym - ks::KEY_F1 + 1) as u8),

        // Keypad, independent of numlock.
        ks::KEY_KP_Subtract => Key::Char('-'),
        ks::KEY_KP_Add => Key::Char('+'),
        ks::KEY_KP_Multiply => Key::Char('*'),
        ks::KEY_KP_Divide => Key::Char('/'),
        ks::KEY_KP_Enter => Key::KpEnter,

        // Keypad with numlock.
        ks::KEY_KP_0..=ks::KEY_KP_9 => Key::Kp((sym - ks::KEY_KP_0) as u8),
        ks::KEY_KP_Decimal | ks::KEY_KP_Separator => Key::KpDecimal,

        // Keypad without numlock.
        ks::KEY_KP_Insert => Key::KpInsert,
        ks::KEY_KP_End => Key::Kp(1),
        ks::KEY_KP_Down => Key::Kp(2),
        ks::KEY_KP_Page_Down => Key::Kp(3),
        ks::KEY_KP_Left => Key::Kp(4),
        ks::KEY_KP_Begin => Key::Kp(5),
        ks::KEY_KP_Right => Key::Kp(6),
        ks::KEY_KP_Home => Key::Kp(7),
        ks::KEY_KP_Up => Key::Kp(8),
        ks::KEY_KP_Page_Up => Key::Kp(9),
        ks::KEY_KP_Delete => Key::KpDelete,

        ks::KEY_XF86MenuKB => Key::Menu,
        ks::KEY_XF86AudioPlay => Key::Play,
        ks::KEY_XF86AudioPause => Key::Pause,
        ks::KEY_XF86AudioStop => Key::Stop,
        ks::KEY_XF86AudioPrev => Key::PrevTrack,
        ks::KEY_XF86AudioNext => Key::NextTrack,
        ks::KEY_XF86AudioRewind => Key::Rewind,
        ks::KEY_XF86AudioForward => Key::FastForward,
        ks::KEY_XF86AudioMute => Key::Mute,
        ks::KEY_XF86AudioLowerVolume => Key::VolumeDown,
        ks::KEY_XF86AudioRaiseVolume => Key::VolumeUp,
        ks::KEY_XF86HomePage => Key::Homepage,
        ks::KEY_XF86WWW => Key::Www,
        ks::KEY_XF86Mail => Key::Mail,
        ks::KEY_XF86Favorites => Key::Favorites,
        ks::KEY_XF86Search => Key::Search,
        ks::KEY_XF86Sleep => Key::Sleep,

        _ => return None,
    };
    Some(key)
}

fn lookup_button(button: u32) -> Option<MouseButton> {
    if !(BTN_MOUSE..BTN_JOYSTICK).contains(&button) {
        return None;
    }
    Some(match button {
        BTN_LEFT => MouseButton::Left,
        BTN_MIDDLE => MouseButton::Middle,
        BTN_RIGHT => MouseButton::Right,
        BTN_SIDE => MouseButton::Back,
        BTN_EXTRA => MouseButton::Forward,
        other => MouseButton::Other((9 + other.saturating_sub(BTN_FORWARD)) as u8),
    })
}

impl State {
    fn on_key(&mut self, raw: u32, pressed: bool) {
        self.input.keyboard_code = raw + 8;
        let (sym, text) = {
            let Some(xkb_state) = &self.input.xkb_state else {
                return;
            };
            let keycode = xkb::Keycode::new(self.input.keyboard_code);
            (
                xkb_state.key_get_one_sym(keycode).raw(),
                xkb_state.key_get_utf8(keycode),
            )
        };
        let state = if pressed { KeyState::Down } else { KeyState::Up };
        let mods = self.input.active_mods();

        if let Some(key) = lookup_key(sym) {
            self.input_tx.put_key(key, state, mods);
        } else if !text.is_empty() {
            self.input_tx.put_text(text, state, mods);
        }
    }

    /// Primary-button-down handling: an edge zone starts an interactive
    /// resize, anywhere else starts an interactive move. The compositor owns
    /// the grab afterwards, so a synthetic release keeps the input layer
    /// consistent.
    fn maybe_start_interactive(&mut self, serial: u32, mods: Modifiers, touch: bool) {
        let opts = self.opt_cache.opts();
        if opts.fullscreen || opts.maximized {
            return;
        }
        let Some(seat) = self.input.seat.clone() else {
            return;
        };

        let margin = if touch {
            self.vo_opts.edge_pixels_touch
        } else {
            self.vo_opts.edge_pixels_pointer
        } as i32;
        let (x, y) = self.input.mouse_unscaled;
        let edge = if touch || !self.caps.decoration {
            edge_for_point(
                x,
                y,
                self.window.geometry.width(),
                self.window.geometry.height(),
                margin,
            )
        } else {
            None
        };

        let toplevel = self.window.xdg.xdg_toplevel();
        match edge {
            Some(edge) => toplevel.resize(&seat, serial, edge),
            None => toplevel._move(&seat, serial),
        }
        self.input_tx
            .put_button(MouseButton::Left, KeyState::Up, mods);
    }
}

impl SeatHandler for State {
    fn seat_state(&mut self) -> &mut SeatState {
        &mut self.input.seat_state
    }

    fn new_seat(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, seat: WlSeat) {
        if self.input.seat.is_none() {
            self.input.seat = Some(seat);
        }
    }

    fn new_capability(
        &mut self,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
        seat: WlSeat,
        capability: Capability,
    ) {
        match capability {
            Capability::Keyboard if self.input.keyboard.is_none() => {
                self.input.keyboard = Some(seat.get_keyboard(qh, ()));
            }
            Capability::Pointer if self.input.pointer.is_none() => {
                self.input.pointer = self.input.seat_state.get_pointer(qh, &seat).ok();
            }
            Capability::Touch if self.input.touch.is_none() => {
                self.input.touch = self.input.seat_state.get_touch(qh, &seat).ok();
            }
            _ => {}
        }
    }

    fn remove_capability(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _seat: WlSeat,
        capability: Capability,
    ) {
        match capability {
            Capability::Keyboard => {
                if let Some(keyboard) = self.input.keyboard.take() {
                    keyboard.release();
                }
                self.input.xkb_keymap = None;
                self.input.xkb_state = None;
            }
            Capability::Pointer => {
                if let Some(pointer) = self.input.pointer.take() {
                    pointer.release();
                }
            }
            Capability::Touch => {
                if let Some(touch) = self.input.touch.take() {
                    touch.release();
                }
            }
            _ => {}
        }
    }

    fn remove_seat(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, seat: WlSeat) {
        if self.input.seat.as_ref() == Some(&seat) {
            self.input.seat = None;
        }
    }
}

impl Dispatch<WlKeyboard, ()> for State {
    fn event(
        state: &mut State,
        _keyboard: &WlKeyboard,
        event: wl_keyboard::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<State>,
    ) {
        match event {
            wl_keyboard::Event::Keymap { format, fd, size } => {
                state.input.load_keymap(format, fd, size);
            }
            wl_keyboard::Event::Enter { .. } => {
                state.input.has_keyboard_input = true;
                state.refresh_focus();
            }
            wl_keyboard::Event::Leave { .. } => {
                state.input.has_keyboard_input = false;
                state.refresh_focus();
            }
            wl_keyboard::Event::Key {
                key,
                state: key_state,
                ..
            } => {
                let pressed = key_state == WEnum::Value(wl_keyboard::KeyState::Pressed);
                state.on_key(key, pressed);
            }
            wl_keyboard::Event::Modifiers {
                mods_depressed,
                mods_latched,
                mods_locked,
                group,
                ..
            } => {
                if let Some(xkb_state) = &mut state.input.xkb_state {
                    xkb_state.update_mask(mods_depressed, mods_latched, mods_locked, 0, 0, group);
                }
            }
            wl_keyboard::Event::RepeatInfo { rate, delay } => {
                if state.opt_cache.opts().native_keyrepeat {
                    state.input_tx.put(InputEvent::RepeatInfo { rate, delay });
                }
            }
            _ => {}
        }
    }
}

impl PointerHandler for State {
    fn pointer_frame(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _pointer: &WlPointer,
        events: &[PointerEvent],
    ) {
        for event in events {
            if event.surface != *self.window.xdg.wl_surface() {
                continue;
            }
            match event.kind {
                PointerEventKind::Enter { serial } => {
                    self.input.pointer_serial = serial;
                    self.apply_cursor_visibility();
                    self.input_tx.put(InputEvent::MouseEnter);
                }
                PointerEventKind::Leave { .. } => {
                    self.input_tx.put(InputEvent::MouseLeave);
                }
                PointerEventKind::Motion { .. } => {
                    let scaling = self.window.scaling.max(1);
                    self.input.mouse_unscaled = event.position;
                    self.input.mouse = (
                        event.position.0 as i32 * scaling,
                        event.position.1 as i32 * scaling,
                    );
                    // One stale motion right after a configure carries
                    // pre-resize coordinates; skip it.
                    if !self.window.toplevel_configured {
                        let (x, y) = self.input.mouse;
                        self.input_tx.put(InputEvent::MousePosition { x, y });
                    }
                    self.window.toplevel_configured = false;
                }
                PointerEventKind::Press { button, serial, .. }
                | PointerEventKind::Release { button, serial, .. } => {
                    let pressed = matches!(event.kind, PointerEventKind::Press { .. });
                    let state = if pressed { KeyState::Down } else { KeyState::Up };
                    let mods = self.input.active_mods();
                    let mapped = lookup_button(button);
                    if let Some(mapped) = mapped {
                        self.input_tx.put_button(mapped, state, mods);
                    }
                    if mapped == Some(MouseButton::Left) && pressed {
                        self.maybe_start_interactive(serial, mods, false);
                    }
                }
                PointerEventKind::Axis {
                    horizontal,
                    vertical,
                    ..
                } => {
                    let mods = self.input.active_mods();
                    if vertical.absolute > 0.0 {
                        self.input_tx.put_wheel(WheelDirection::Down, 1.0, mods);
                    } else if vertical.absolute < 0.0 {
                        self.input_tx.put_wheel(WheelDirection::Up, 1.0, mods);
                    }
                    if horizontal.absolute > 0.0 {
                        self.input_tx.put_wheel(WheelDirection::Right, 1.0, mods);
                    } else if horizontal.absolute < 0.0 {
                        self.input_tx.put_wheel(WheelDirection::Left, 1.0, mods);
                    }
                }
            }
        }
    }
}

impl TouchHandler for State {
    fn down(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _touch: &WlTouch,
        serial: u32,
        _time: u32,
        surface: WlSurface,
        _id: i32,
        position: (f64, f64),
    ) {
        if surface != *self.window.xdg.wl_surface() {
            return;
        }
        let scaling = self.window.scaling.max(1);
        self.input.mouse_unscaled = position;
        self.input.mouse = (position.0 as i32 * scaling, position.1 as i32 * scaling);
        let (x, y) = self.input.mouse;
        self.input_tx.put(InputEvent::MousePosition { x, y });
        let mods = self.input.active_mods();
        self.input_tx
            .put_button(MouseButton::Left, KeyState::Down, mods);
        self.maybe_start_interactive(serial, mods, true);
    }

    fn up(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _touch: &WlTouch,
        _serial: u32,
        _time: u32,
        _id: i32,
    ) {
        let mods = self.input.active_mods();
        self.input_tx
            .put_button(MouseButton::Left, KeyState::Up, mods);
    }

    fn motion(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _touch: &WlTouch,
        _time: u32,
        _id: i32,
        position: (f64, f64),
    ) {
        let scaling = self.window.scaling.max(1);
        self.input.mouse_unscaled = position;
        self.input.mouse = (position.0 as i32 * scaling, position.1 as i32 * scaling);
        let (x, y) = self.input.mouse;
        self.input_tx.put(InputEvent::MousePosition { x, y });
    }

    fn shape(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _touch: &WlTouch,
        _id: i32,
        _major: f64,
        _minor: f64,
    ) {
    }

    fn orientation(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        _touch: &WlTouch,
        _id: i32,
        _orientation: f64,
    ) {
    }

    fn cancel(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _touch: &WlTouch) {}
}

delegate_seat!(State);
delegate_pointer!(State);
delegate_touch!(State);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_fast_path() {
        assert_eq!(lookup_key('a' as u32), Some(Key::Char('a')));
        assert_eq!(lookup_key('Z' as u32), Some(Key::Char('Z')));
        assert_eq!(lookup_key('7' as u32), Some(Key::Char('7')));
        assert_eq!(lookup_key('#' as u32), Some(Key::Char('#')));
        assert_eq!(lookup_key(' ' as u32), Some(Key::Char(' ')));
    }

    #[test]
    fn table_lookup_for_special_keys() {
        assert_eq!(lookup_key(xkb::keysyms::KEY_Escape), Some(Key::Esc));
        assert_eq!(lookup_key(xkb::keysyms::KEY_F5), Some(Key::F(5)));
        assert_eq!(lookup_key(xkb::keysyms::KEY_KP_7), Some(Key::Kp(7)));
        assert_eq!(lookup_key(xkb::keysyms::KEY_KP_Home), Some(Key::Kp(7)));
        assert_eq!(lookup_key(xkb::keysyms::KEY_XF86AudioPlay), Some(Key::Play));
    }

    #[test]
    fn unknown_symbols_fall_through_to_text() {
        // U+00E9 LATIN SMALL LETTER E WITH ACUTE: keysym 0xe9, not in the
        // fast path or the table, so the caller emits a text event.
        assert_eq!(lookup_key(0xe9), None);
    }

    #[test]
    fn button_mapping() {
        assert_eq!(lookup_button(BTN_LEFT), Some(MouseButton::Left));
        assert_eq!(lookup_button(BTN_SIDE), Some(MouseButton::Back));
        assert_eq!(lookup_button(BTN_FORWARD + 1), Some(MouseButton::Other(10)));
        assert_eq!(lookup_button(BTN_JOYSTICK), None);
        assert_eq!(lookup_button(0), None);
    }
}

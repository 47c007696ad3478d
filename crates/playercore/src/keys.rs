//! The player's internal key model.
//!
//! Backends translate platform key symbols into [`Key`] values; anything
//! that does not map to a named key but still produces text is delivered as
//! a text event instead (see [`crate::InputEvent::Text`]).

use bitflags::bitflags;

/// A normalized key code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// Printable character keys delivered as-is (ASCII fast path).
    Char(char),

    Enter,
    Esc,
    Backspace,
    Tab,
    Menu,
    Print,
    Pause,

    Left,
    Right,
    Up,
    Down,

    Insert,
    Delete,
    Home,
    End,
    PageUp,
    PageDown,

    /// Function keys, 1-based (`F(1)` = F1).
    F(u8),

    KpEnter,
    /// Numpad digits, `Kp(0)`..`Kp(9)`.
    Kp(u8),
    KpDecimal,
    KpInsert,
    KpDelete,

    Play,
    Stop,
    PrevTrack,
    NextTrack,
    Rewind,
    FastForward,
    Mute,
    VolumeDown,
    VolumeUp,
    Homepage,
    Www,
    Mail,
    Favorites,
    Search,
    Sleep,
}

/// Key or button transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Down,
    Up,
}

/// Pointer buttons in the internal model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
    Back,
    Forward,
    /// Buttons past the named ones, numbered from 9 like the original
    /// player's MBTN9+ range.
    Other(u8),
}

/// Discrete wheel step direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WheelDirection {
    Up,
    Down,
    Left,
    Right,
}

bitflags! {
    /// Modifier mask attached to key, button and wheel events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Modifiers: u32 {
        const SHIFT = 1 << 0;
        const CTRL  = 1 << 1;
        const ALT   = 1 << 2;
        const META  = 1 << 3;
    }
}

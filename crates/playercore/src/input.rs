//! Input events flowing from a video-output backend into the player core.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::keys::{Key, KeyState, Modifiers, MouseButton, WheelDirection};

/// What to do with a dropped payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropAction {
    /// Replace the current playlist.
    Replace,
    /// Append to the current playlist.
    Append,
}

/// A translated input event.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Key {
        key: Key,
        state: KeyState,
        mods: Modifiers,
    },
    /// Symbols without a key mapping that still decode to text.
    Text {
        text: String,
        state: KeyState,
        mods: Modifiers,
    },
    Button {
        button: MouseButton,
        state: KeyState,
        mods: Modifiers,
    },
    Wheel {
        direction: WheelDirection,
        value: f64,
        mods: Modifiers,
    },
    MousePosition {
        x: i32,
        y: i32,
    },
    MouseEnter,
    MouseLeave,
    /// Key auto-repeat parameters pushed by the platform.
    RepeatInfo {
        rate: i32,
        delay: i32,
    },
    /// The window was asked to close.
    CloseRequested,
    /// All pressed keys must be considered released (backend teardown).
    ReleaseAll,
    /// A completed drag-and-drop transfer.
    Drop {
        mime_type: String,
        data: Vec<u8>,
        action: DropAction,
    },
}

/// Sending half handed to a video-output backend.
///
/// Sends never block; a disconnected player core simply discards events.
#[derive(Debug, Clone)]
pub struct InputSender(Sender<InputEvent>);

/// Receiving half kept by the player core.
pub type InputReceiver = Receiver<InputEvent>;

impl InputSender {
    pub fn put(&self, event: InputEvent) {
        let _ = self.0.send(event);
    }

    pub fn put_key(&self, key: Key, state: KeyState, mods: Modifiers) {
        self.put(InputEvent::Key { key, state, mods });
    }

    pub fn put_button(&self, button: MouseButton, state: KeyState, mods: Modifiers) {
        self.put(InputEvent::Button {
            button,
            state,
            mods,
        });
    }

    pub fn put_wheel(&self, direction: WheelDirection, value: f64, mods: Modifiers) {
        self.put(InputEvent::Wheel {
            direction,
            value,
            mods,
        });
    }

    pub fn put_text(&self, text: String, state: KeyState, mods: Modifiers) {
        self.put(InputEvent::Text { text, state, mods });
    }
}

/// Creates the input channel pair.
pub fn input_channel() -> (InputSender, InputReceiver) {
    let (tx, rx) = unbounded();
    (InputSender(tx), rx)
}

/// Scores drag-and-drop mime types; the offer with the highest score wins.
///
/// Scores are player policy, not backend policy, so the backend receives the
/// scorer as a trait object. Non-positive scores mean "unusable".
pub trait MimeScorer: Send {
    fn score(&self, mime_type: &str) -> i32;
}

/// Reasonable default scorer: prefer URI lists over plain text.
#[derive(Debug, Default)]
pub struct DefaultMimeScorer;

impl MimeScorer for DefaultMimeScorer {
    fn score(&self, mime_type: &str) -> i32 {
        match mime_type {
            "text/uri-list" => 15,
            "text/plain;charset=utf-8" => 10,
            "text/plain" => 8,
            _ if mime_type.starts_with("text/") => 5,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_delivers_in_order() {
        let (tx, rx) = input_channel();
        tx.put_key(Key::Esc, KeyState::Down, Modifiers::empty());
        tx.put(InputEvent::CloseRequested);
        assert_eq!(
            rx.try_recv().unwrap(),
            InputEvent::Key {
                key: Key::Esc,
                state: KeyState::Down,
                mods: Modifiers::empty()
            }
        );
        assert_eq!(rx.try_recv().unwrap(), InputEvent::CloseRequested);
    }

    #[test]
    fn send_without_receiver_is_silent() {
        let (tx, rx) = input_channel();
        drop(rx);
        tx.put(InputEvent::MouseEnter);
    }

    #[test]
    fn default_scorer_prefers_uri_lists() {
        let scorer = DefaultMimeScorer;
        assert!(scorer.score("text/uri-list") > scorer.score("text/plain"));
        assert_eq!(scorer.score("image/png"), 0);
    }
}

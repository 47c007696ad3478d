//! Player-side model shared between the player core and its video-output
//! backends.
//!
//! The crate deliberately contains no windowing-protocol types. It defines
//! the vocabulary both sides speak:
//!
//! ```text
//!   player core ──(OptionStore changes)──▶ video output backend
//!   player core ◀──(InputEvent channel)── video output backend
//!   decoder     ──(HwFrame descriptors)─▶ video output backend
//!   player core ◀──(VoEvents bitmask)──── video output backend
//! ```
//!
//! A backend observes option changes through an [`OptionCache`], reports
//! translated input through an [`InputSender`], and imports decoded frames
//! described by [`HwFrame`].

pub mod frame;
pub mod input;
pub mod keys;
pub mod options;
pub mod vo;

pub use frame::{
    DrmFrameDescriptor, DrmLayer, DrmObject, DrmPlane, ExportError, HwFrame, HwHandle,
    SurfaceExporter,
};
pub use input::{
    input_channel, DefaultMimeScorer, DropAction, InputEvent, InputReceiver, InputSender,
    MimeScorer,
};
pub use keys::{Key, KeyState, Modifiers, MouseButton, WheelDirection};
pub use options::{ConfigError, OptionCache, OptionStore, VoOptions, WinOpt, WindowOptions};
pub use vo::{DisplayInfo, VideoParams, VoEvents, VsyncInfo};

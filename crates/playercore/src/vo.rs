//! Events and queries a video-output backend reports to the player core.

use bitflags::bitflags;

bitflags! {
    /// Pending backend events, drained by the player's control loop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VoEvents: u32 {
        /// Window geometry changed; the render path must re-layout.
        const RESIZE = 1 << 0;
        /// The surface contents must be redrawn.
        const EXPOSE = 1 << 1;
        /// The effective scale factor changed.
        const DPI = 1 << 2;
        /// Window state (outputs spanned, fullscreen, ...) changed.
        const WIN_STATE = 1 << 3;
        /// Keyboard focus changed.
        const FOCUS = 1 << 4;
    }
}

/// One entry of the display enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayInfo {
    pub name: String,
    pub refresh_hz: f64,
    pub resolution: (i32, i32),
}

/// Source video dimensions for a reconfigure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
}

/// Vsync timing derived from presentation feedback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VsyncInfo {
    /// Measured duration of one vblank, microseconds.
    pub vsync_duration: i64,
    /// Vsyncs skipped since the previous swap.
    pub skipped_vsyncs: i64,
    /// Estimated display time of the last queued frame, microseconds on the
    /// compositor's monotonic clock.
    pub last_queue_display_time: i64,
}
